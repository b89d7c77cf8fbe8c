use serde::Deserialize;

use crate::hierarchy::QualifierHierarchy;
use crate::ir::{Annotation, DEFAULT_QUALIFIER};
use crate::qualifier::{KindId, Qualifier};

/// Where an unannotated type occurs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TypeUseLocation {
    Field,
    LocalVariable,
    ExceptionParameter,
    Receiver,
    Parameter,
    Return,
    ConstructorResult,
    ImplicitUpperBound,
    ExplicitUpperBound,
    LowerBound,
    Otherwise,
    All,
}

impl TypeUseLocation {
    pub(crate) fn parse(text: &str) -> Option<Self> {
        let location = match text.trim().to_ascii_lowercase().as_str() {
            "field" => TypeUseLocation::Field,
            "local_variable" => TypeUseLocation::LocalVariable,
            "exception_parameter" => TypeUseLocation::ExceptionParameter,
            "receiver" => TypeUseLocation::Receiver,
            "parameter" => TypeUseLocation::Parameter,
            "return" => TypeUseLocation::Return,
            "constructor_result" => TypeUseLocation::ConstructorResult,
            "implicit_upper_bound" => TypeUseLocation::ImplicitUpperBound,
            "explicit_upper_bound" => TypeUseLocation::ExplicitUpperBound,
            "upper_bound" => TypeUseLocation::ExplicitUpperBound,
            "lower_bound" => TypeUseLocation::LowerBound,
            "otherwise" => TypeUseLocation::Otherwise,
            "all" => TypeUseLocation::All,
            _ => return None,
        };
        Some(location)
    }
}

/// Default qualifiers by location for one scope.
#[derive(Clone, Debug, Default)]
pub(crate) struct DefaultSet {
    entries: Vec<(TypeUseLocation, Qualifier)>,
}

impl DefaultSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Later additions for the same location and hierarchy replace earlier ones.
    pub(crate) fn add(&mut self, location: TypeUseLocation, qualifier: Qualifier) {
        self.entries
            .retain(|(existing, q)| !(*existing == location && q.top == qualifier.top));
        self.entries.push((location, qualifier));
    }

    pub(crate) fn exact(&self, location: TypeUseLocation, top: KindId) -> Option<&Qualifier> {
        self.entries
            .iter()
            .find(|(existing, q)| *existing == location && q.top == top)
            .map(|(_, q)| q)
    }

    /// Exact location first, then `otherwise`, then `all`.
    pub(crate) fn lookup(&self, location: TypeUseLocation, top: KindId) -> Option<&Qualifier> {
        self.exact(location, top)
            .or_else(|| self.exact(TypeUseLocation::Otherwise, top))
            .or_else(|| self.exact(TypeUseLocation::All, top))
    }

    /// Collect `@DefaultQualifier(Qualifier, location...)` annotations that name
    /// qualifiers of this hierarchy; other checkers' qualifiers are skipped.
    pub(crate) fn from_annotations(
        annotations: &[Annotation],
        hierarchy: &QualifierHierarchy,
    ) -> Self {
        let mut set = DefaultSet::new();
        for annotation in annotations
            .iter()
            .filter(|annotation| annotation.name == DEFAULT_QUALIFIER)
        {
            let Some((name, locations)) = annotation.values.split_first() else {
                continue;
            };
            let Ok(qualifier) = hierarchy.qualifier(name) else {
                continue;
            };
            if locations.is_empty() {
                set.add(TypeUseLocation::All, qualifier);
                continue;
            }
            for location in locations.iter().filter_map(|text| TypeUseLocation::parse(text)) {
                set.add(location, qualifier.clone());
            }
        }
        set
    }
}

/// Checker-wide defaulting policy.
#[derive(Clone, Debug)]
pub(crate) struct QualifierDefaults {
    checked: DefaultSet,
    unchecked: DefaultSet,
}

impl QualifierDefaults {
    /// Checker defaults from `default_for` declarations, completed with the
    /// CLIMB defaults: locals, exception parameters and implicit upper bounds
    /// start at top so flow refinement can narrow them.
    pub(crate) fn new(hierarchy: &QualifierHierarchy) -> Self {
        let mut checked = DefaultSet::new();
        for (id, kind) in hierarchy.kinds().kinds() {
            for location in &kind.default_for {
                checked.add(*location, hierarchy.of_kind(id));
            }
        }
        let climb = [
            TypeUseLocation::LocalVariable,
            TypeUseLocation::ExceptionParameter,
            TypeUseLocation::ImplicitUpperBound,
        ];
        for top in hierarchy.tops() {
            for location in climb {
                if checked.exact(location, top.top).is_none() {
                    checked.add(location, top.clone());
                }
            }
        }

        let mut unchecked = DefaultSet::new();
        for top in hierarchy.tops() {
            let bottom = hierarchy.bottom(&top);
            for location in [
                TypeUseLocation::Return,
                TypeUseLocation::Field,
                TypeUseLocation::ImplicitUpperBound,
                TypeUseLocation::ExplicitUpperBound,
            ] {
                unchecked.add(location, top.clone());
            }
            for location in [TypeUseLocation::Parameter, TypeUseLocation::LowerBound] {
                unchecked.add(location, bottom.clone());
            }
        }
        Self { checked, unchecked }
    }

    /// Resolve the default for `location` in the hierarchy rooted at `top`.
    ///
    /// `scopes` are the enclosing `@DefaultQualifier` sets, innermost first.
    pub(crate) fn resolve(
        &self,
        hierarchy: &QualifierHierarchy,
        location: TypeUseLocation,
        top: KindId,
        scopes: &[&DefaultSet],
        unchecked_code: bool,
    ) -> Qualifier {
        for scope in scopes {
            if let Some(qualifier) = scope.lookup(location, top) {
                return qualifier.clone();
            }
        }
        if unchecked_code {
            if let Some(qualifier) = self.unchecked.exact(location, top) {
                return qualifier.clone();
            }
        }
        self.checked
            .lookup(location, top)
            .cloned()
            .unwrap_or_else(|| hierarchy.top_of(top))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::QualifierDecl;

    fn nullness() -> QualifierHierarchy {
        QualifierHierarchy::new(&[
            QualifierDecl::new("Nullable"),
            QualifierDecl::new("NonNull")
                .subtype_of(&["Nullable"])
                .default_for(&[TypeUseLocation::Otherwise]),
        ])
        .expect("hierarchy")
    }

    fn resolve_name(
        defaults: &QualifierDefaults,
        hierarchy: &QualifierHierarchy,
        location: TypeUseLocation,
        scopes: &[&DefaultSet],
        unchecked: bool,
    ) -> String {
        let top = hierarchy.tops()[0].top;
        defaults
            .resolve(hierarchy, location, top, scopes, unchecked)
            .name
    }

    #[test]
    fn climb_defaults_put_locals_at_top() {
        let hierarchy = nullness();
        let defaults = QualifierDefaults::new(&hierarchy);
        assert_eq!(
            resolve_name(&defaults, &hierarchy, TypeUseLocation::LocalVariable, &[], false),
            "Nullable"
        );
        assert_eq!(
            resolve_name(&defaults, &hierarchy, TypeUseLocation::Parameter, &[], false),
            "NonNull"
        );
    }

    #[test]
    fn method_scope_wins_over_class_scope() {
        let hierarchy = nullness();
        let defaults = QualifierDefaults::new(&hierarchy);
        let method = DefaultSet::from_annotations(
            &[Annotation::with_values(DEFAULT_QUALIFIER, &["NonNull", "local_variable"])],
            &hierarchy,
        );
        let class = DefaultSet::from_annotations(
            &[Annotation::with_values(DEFAULT_QUALIFIER, &["Nullable"])],
            &hierarchy,
        );
        assert_eq!(
            resolve_name(
                &defaults,
                &hierarchy,
                TypeUseLocation::LocalVariable,
                &[&method, &class],
                false
            ),
            "NonNull"
        );
        assert_eq!(
            resolve_name(
                &defaults,
                &hierarchy,
                TypeUseLocation::Parameter,
                &[&method, &class],
                false
            ),
            "Nullable"
        );
    }

    #[test]
    fn unchecked_code_uses_conservative_defaults() {
        let hierarchy = nullness();
        let defaults = QualifierDefaults::new(&hierarchy);
        assert_eq!(
            resolve_name(&defaults, &hierarchy, TypeUseLocation::Return, &[], true),
            "Nullable"
        );
        assert_eq!(
            resolve_name(&defaults, &hierarchy, TypeUseLocation::Parameter, &[], true),
            "NonNull"
        );
        assert_eq!(
            resolve_name(&defaults, &hierarchy, TypeUseLocation::Receiver, &[], true),
            "NonNull"
        );
    }

    #[test]
    fn foreign_default_qualifiers_are_ignored() {
        let hierarchy = nullness();
        let set = DefaultSet::from_annotations(
            &[Annotation::with_values(DEFAULT_QUALIFIER, &["Untainted", "field"])],
            &hierarchy,
        );
        assert!(set.is_empty());
    }

    #[test]
    fn parses_location_names() {
        assert_eq!(
            TypeUseLocation::parse("LOCAL_VARIABLE"),
            Some(TypeUseLocation::LocalVariable)
        );
        assert_eq!(TypeUseLocation::parse("nowhere"), None);
    }
}
