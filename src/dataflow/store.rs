use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::dataflow::expression::FlowExpr;
use crate::hierarchy::{QualifierHierarchy, TypeSystemError};
use crate::qualifier::QualifierSet;

/// Refined qualifiers of flow expressions at one program point.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Store {
    values: BTreeMap<FlowExpr, QualifierSet>,
}

/// What an invocation may have changed.
pub(crate) struct SideEffects<'s> {
    /// Whether a field read through the given receiver is final.
    pub(crate) is_final_field: &'s dyn Fn(&FlowExpr, &str) -> bool,
    /// When set, only locals in `final_locals` keep their facts.
    pub(crate) unrefine_aliases: bool,
    pub(crate) final_locals: &'s BTreeSet<String>,
}

impl Store {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, expr: &FlowExpr) -> Option<&QualifierSet> {
        self.values.get(expr)
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&FlowExpr, &QualifierSet)> {
        self.values.iter()
    }

    /// Overwrite the value of `expr`. Expressions containing `Unknown` are never stored.
    pub(crate) fn replace(&mut self, expr: FlowExpr, value: QualifierSet) {
        if expr.contains_unknown() || value.is_empty() {
            return;
        }
        self.values.insert(expr, value);
    }

    /// Narrow the value of `expr` to the glb of `value` and what is known,
    /// with `fallback` standing in for an absent entry.
    pub(crate) fn refine(
        &mut self,
        hierarchy: &QualifierHierarchy,
        expr: FlowExpr,
        value: &QualifierSet,
        fallback: Option<&QualifierSet>,
    ) -> Result<(), TypeSystemError> {
        let merged = match self.values.get(&expr).or(fallback) {
            Some(current) => hierarchy.glb_set(current, value)?,
            None => value.clone(),
        };
        self.replace(expr, merged);
        Ok(())
    }

    pub(crate) fn remove(&mut self, expr: &FlowExpr) {
        self.values.remove(expr);
    }

    /// Drop facts an assignment to `target` may invalidate, then record `value`.
    pub(crate) fn update_for_assignment(&mut self, target: &FlowExpr, value: Option<QualifierSet>) {
        match target {
            FlowExpr::Local(name) => {
                let name = name.clone();
                self.values
                    .retain(|expr, _| expr == target || !expr.mentions_local(&name));
            }
            FlowExpr::Field { field, .. } => {
                let field = field.clone();
                self.values.retain(|expr, _| {
                    expr == target || !(expr.contains_field(&field) || expr.contains_method_call())
                });
            }
            FlowExpr::ArrayAccess { .. } => {
                self.values.retain(|expr, _| {
                    expr == target || !(expr.contains_array_access() || expr.contains_method_call())
                });
            }
            _ => {}
        }
        match value {
            Some(value) => self.replace(target.clone(), value),
            None => self.remove(target),
        }
    }

    /// Drop facts an impure invocation may invalidate.
    pub(crate) fn update_for_method_call(&mut self, effects: &SideEffects<'_>) {
        self.values.retain(|expr, _| {
            if expr.contains_array_access() || expr.contains_method_call() {
                return false;
            }
            if matches!(expr, FlowExpr::Field { .. })
                && !expr.is_unmodifiable_by_other_code(effects.is_final_field)
            {
                return false;
            }
            if effects.unrefine_aliases {
                if let FlowExpr::Local(name) = expr {
                    return effects.final_locals.contains(name);
                }
            }
            true
        });
    }

    /// Join; entries present in only one store are dropped.
    pub(crate) fn lub(&self, hierarchy: &QualifierHierarchy, other: &Store) -> Result<Store, TypeSystemError> {
        let mut values = BTreeMap::new();
        for (expr, value) in &self.values {
            if let Some(other_value) = other.values.get(expr) {
                let joined = hierarchy.lub_set(value, other_value)?;
                if !joined.is_empty() {
                    values.insert(expr.clone(), joined);
                }
            }
        }
        Ok(Store { values })
    }

    /// Join that forces termination on infinite ascending chains.
    pub(crate) fn widen(&self, hierarchy: &QualifierHierarchy, next: &Store) -> Result<Store, TypeSystemError> {
        let mut values = BTreeMap::new();
        for (expr, value) in &self.values {
            if let Some(next_value) = next.values.get(expr) {
                let widened = hierarchy.widened_set(value, next_value)?;
                if !widened.is_empty() {
                    values.insert(expr.clone(), widened);
                }
            }
        }
        Ok(Store { values })
    }
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (index, (expr, value)) in self.values.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{expr}: {value}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::QualifierDecl;

    fn nullness() -> QualifierHierarchy {
        QualifierHierarchy::new(&[
            QualifierDecl::new("Nullable"),
            QualifierDecl::new("NonNull").subtype_of(&["Nullable"]),
        ])
        .expect("hierarchy")
    }

    fn set(hierarchy: &QualifierHierarchy, name: &str) -> QualifierSet {
        QualifierSet::single(hierarchy.qualifier(name).expect("qualifier"))
    }

    fn local(name: &str) -> FlowExpr {
        FlowExpr::Local(name.to_string())
    }

    #[test]
    fn lub_drops_one_sided_entries() {
        let hierarchy = nullness();
        let mut left = Store::new();
        left.replace(local("a"), set(&hierarchy, "NonNull"));
        left.replace(local("b"), set(&hierarchy, "NonNull"));
        let mut right = Store::new();
        right.replace(local("a"), set(&hierarchy, "Nullable"));

        let joined = left.lub(&hierarchy, &right).expect("lub");

        assert_eq!(joined.len(), 1);
        assert_eq!(joined.get(&local("a")), Some(&set(&hierarchy, "Nullable")));
    }

    #[test]
    fn reassigning_a_local_forgets_dependent_facts() {
        let hierarchy = nullness();
        let mut store = Store::new();
        let field = FlowExpr::field(local("a"), "next");
        store.replace(field.clone(), set(&hierarchy, "NonNull"));
        store.replace(local("b"), set(&hierarchy, "NonNull"));

        store.update_for_assignment(&local("a"), Some(set(&hierarchy, "Nullable")));

        assert!(store.get(&field).is_none());
        assert!(store.get(&local("b")).is_some());
        assert_eq!(store.get(&local("a")), Some(&set(&hierarchy, "Nullable")));
    }

    #[test]
    fn impure_call_keeps_only_unmodifiable_facts() {
        let hierarchy = nullness();
        let mut store = Store::new();
        let final_field = FlowExpr::field(FlowExpr::This, "id");
        let mutable_field = FlowExpr::field(FlowExpr::This, "cache");
        store.replace(final_field.clone(), set(&hierarchy, "NonNull"));
        store.replace(mutable_field.clone(), set(&hierarchy, "NonNull"));
        store.replace(local("x"), set(&hierarchy, "NonNull"));

        let final_locals = BTreeSet::new();
        let is_final_field = |_receiver: &FlowExpr, name: &str| name == "id";
        store.update_for_method_call(&SideEffects {
            is_final_field: &is_final_field,
            unrefine_aliases: false,
            final_locals: &final_locals,
        });

        assert!(store.get(&final_field).is_some());
        assert!(store.get(&mutable_field).is_none());
        assert!(store.get(&local("x")).is_some());

        store.update_for_method_call(&SideEffects {
            is_final_field: &is_final_field,
            unrefine_aliases: true,
            final_locals: &final_locals,
        });
        assert!(store.get(&local("x")).is_none());
    }

    #[test]
    fn refine_uses_fallback_for_absent_entries() {
        let hierarchy = nullness();
        let mut store = Store::new();
        store
            .refine(
                &hierarchy,
                local("p"),
                &set(&hierarchy, "Nullable"),
                Some(&set(&hierarchy, "NonNull")),
            )
            .expect("refine");
        assert_eq!(store.get(&local("p")), Some(&set(&hierarchy, "NonNull")));
        assert_eq!(store.to_string(), "{p: @NonNull}");
    }
}
