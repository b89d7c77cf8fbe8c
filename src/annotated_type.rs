use std::collections::BTreeMap;
use std::fmt;

use crate::qualifier::{KindId, Qualifier, QualifierSet};

/// A type with a qualifier set at every structural position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AnnotatedType {
    /// Primary qualifiers. On a type variable use these are only the
    /// qualifiers written on (or refined onto) the use itself.
    pub(crate) qualifiers: QualifierSet,
    pub(crate) kind: TypeKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TypeKind {
    Primitive(String),
    Declared {
        name: String,
        args: Vec<AnnotatedType>,
    },
    Array(Box<AnnotatedType>),
    TypeVar {
        name: String,
        /// Qualifiers of the declared upper bound.
        upper: QualifierSet,
        /// Qualifiers of the declared lower bound.
        lower: QualifierSet,
    },
    Wildcard {
        extends: Option<Box<AnnotatedType>>,
        super_bound: Option<Box<AnnotatedType>>,
    },
    Intersection(Vec<AnnotatedType>),
    Null,
    Void,
}

impl AnnotatedType {
    pub(crate) fn new(kind: TypeKind) -> Self {
        Self {
            qualifiers: QualifierSet::new(),
            kind,
        }
    }

    pub(crate) fn with_qualifiers(kind: TypeKind, qualifiers: QualifierSet) -> Self {
        Self { qualifiers, kind }
    }

    pub(crate) fn declared(name: &str, args: Vec<AnnotatedType>) -> Self {
        Self::new(TypeKind::Declared {
            name: name.to_string(),
            args,
        })
    }

    pub(crate) fn void() -> Self {
        Self::new(TypeKind::Void)
    }

    pub(crate) fn is_void(&self) -> bool {
        matches!(self.kind, TypeKind::Void)
    }

    pub(crate) fn is_primitive(&self) -> bool {
        matches!(self.kind, TypeKind::Primitive(_))
    }

    pub(crate) fn is_type_var(&self) -> bool {
        matches!(self.kind, TypeKind::TypeVar { .. })
    }

    pub(crate) fn is_declared(&self, expected: &str) -> bool {
        matches!(&self.kind, TypeKind::Declared { name, .. } if name == expected)
    }

    /// Effective primary qualifier in the hierarchy rooted at `top`.
    pub(crate) fn primary(&self, top: KindId) -> Option<&Qualifier> {
        if let Some(qualifier) = self.qualifiers.get(top) {
            return Some(qualifier);
        }
        match &self.kind {
            TypeKind::TypeVar { upper, .. } => upper.get(top),
            TypeKind::Wildcard {
                extends: Some(bound),
                ..
            } => bound.primary(top),
            TypeKind::Intersection(bounds) => bounds.iter().find_map(|bound| bound.primary(top)),
            _ => None,
        }
    }

    /// Primary qualifier used when this type is the target of a subtype check.
    pub(crate) fn primary_as_supertype(&self, top: KindId) -> Option<&Qualifier> {
        if let Some(qualifier) = self.qualifiers.get(top) {
            return Some(qualifier);
        }
        match &self.kind {
            TypeKind::TypeVar { lower, .. } => lower.get(top),
            TypeKind::Wildcard {
                super_bound: Some(bound),
                ..
            } => bound.primary(top),
            TypeKind::Wildcard { .. } => None,
            _ => self.primary(top),
        }
    }

    /// Every effective primary qualifier.
    pub(crate) fn effective_qualifiers(&self) -> QualifierSet {
        let mut out = self.qualifiers.clone();
        match &self.kind {
            TypeKind::TypeVar { upper, .. } => out.add_all_missing(upper),
            TypeKind::Wildcard {
                extends: Some(bound),
                ..
            } => out.add_all_missing(&bound.effective_qualifiers()),
            TypeKind::Intersection(bounds) => {
                for bound in bounds {
                    out.add_all_missing(&bound.effective_qualifiers());
                }
            }
            _ => {}
        }
        out
    }

    pub(crate) fn replace_qualifier(&mut self, qualifier: Qualifier) {
        self.qualifiers.replace(qualifier);
    }

    pub(crate) fn replace_qualifiers(&mut self, qualifiers: &QualifierSet) {
        self.qualifiers.replace_all(qualifiers);
    }

    pub(crate) fn add_missing(&mut self, qualifier: Qualifier) {
        self.qualifiers.add_missing(qualifier);
    }

    pub(crate) fn clear_primary(&mut self) {
        self.qualifiers.clear();
    }

    pub(crate) fn component(&self) -> Option<&AnnotatedType> {
        match &self.kind {
            TypeKind::Array(component) => Some(component),
            _ => None,
        }
    }

    pub(crate) fn type_args(&self) -> &[AnnotatedType] {
        match &self.kind {
            TypeKind::Declared { args, .. } => args,
            _ => &[],
        }
    }

    /// Apply `f` to the qualifiers at every position, bounds included.
    pub(crate) fn map_qualifiers(&self, f: &dyn Fn(&Qualifier) -> Qualifier) -> AnnotatedType {
        let map_set = |set: &QualifierSet| -> QualifierSet { set.iter().map(f).collect() };
        let kind = match &self.kind {
            TypeKind::Declared { name, args } => TypeKind::Declared {
                name: name.clone(),
                args: args.iter().map(|arg| arg.map_qualifiers(f)).collect(),
            },
            TypeKind::Array(component) => TypeKind::Array(Box::new(component.map_qualifiers(f))),
            TypeKind::TypeVar { name, upper, lower } => TypeKind::TypeVar {
                name: name.clone(),
                upper: map_set(upper),
                lower: map_set(lower),
            },
            TypeKind::Wildcard {
                extends,
                super_bound,
            } => TypeKind::Wildcard {
                extends: extends.as_ref().map(|bound| Box::new(bound.map_qualifiers(f))),
                super_bound: super_bound
                    .as_ref()
                    .map(|bound| Box::new(bound.map_qualifiers(f))),
            },
            TypeKind::Intersection(bounds) => {
                TypeKind::Intersection(bounds.iter().map(|bound| bound.map_qualifiers(f)).collect())
            }
            other => other.clone(),
        };
        AnnotatedType {
            qualifiers: map_set(&self.qualifiers),
            kind,
        }
    }

    /// Replace type variable uses by their arguments.
    ///
    /// A qualifier written on the use overrides the argument's qualifier in
    /// that hierarchy; otherwise the argument's qualifier is kept.
    pub(crate) fn substitute(&self, mapping: &BTreeMap<String, AnnotatedType>) -> AnnotatedType {
        match &self.kind {
            TypeKind::TypeVar { name, .. } => match mapping.get(name) {
                Some(argument) => {
                    let mut out = argument.clone();
                    for qualifier in self.qualifiers.iter() {
                        out.replace_qualifier(qualifier.clone());
                    }
                    out
                }
                None => self.clone(),
            },
            TypeKind::Declared { name, args } => AnnotatedType {
                qualifiers: self.qualifiers.clone(),
                kind: TypeKind::Declared {
                    name: name.clone(),
                    args: args.iter().map(|arg| arg.substitute(mapping)).collect(),
                },
            },
            TypeKind::Array(component) => AnnotatedType {
                qualifiers: self.qualifiers.clone(),
                kind: TypeKind::Array(Box::new(component.substitute(mapping))),
            },
            TypeKind::Wildcard {
                extends,
                super_bound,
            } => AnnotatedType {
                qualifiers: self.qualifiers.clone(),
                kind: TypeKind::Wildcard {
                    extends: extends
                        .as_ref()
                        .map(|bound| Box::new(bound.substitute(mapping))),
                    super_bound: super_bound
                        .as_ref()
                        .map(|bound| Box::new(bound.substitute(mapping))),
                },
            },
            TypeKind::Intersection(bounds) => AnnotatedType {
                qualifiers: self.qualifiers.clone(),
                kind: TypeKind::Intersection(
                    bounds.iter().map(|bound| bound.substitute(mapping)).collect(),
                ),
            },
            TypeKind::Primitive(_) | TypeKind::Null | TypeKind::Void => self.clone(),
        }
    }
}

impl AnnotatedType {
    fn write_prefix(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.qualifiers.is_empty() {
            write!(f, "{} ", self.qualifiers)?;
        }
        Ok(())
    }
}

impl fmt::Display for AnnotatedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TypeKind::Primitive(name) => {
                self.write_prefix(f)?;
                write!(f, "{name}")
            }
            TypeKind::Declared { name, args } => {
                self.write_prefix(f)?;
                write!(f, "{name}")?;
                if !args.is_empty() {
                    write!(f, "<")?;
                    for (index, arg) in args.iter().enumerate() {
                        if index > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{arg}")?;
                    }
                    write!(f, ">")?;
                }
                Ok(())
            }
            TypeKind::Array(component) => {
                write!(f, "{component} ")?;
                self.write_prefix(f)?;
                write!(f, "[]")
            }
            TypeKind::TypeVar { name, .. } => {
                self.write_prefix(f)?;
                write!(f, "{name}")
            }
            TypeKind::Wildcard {
                extends,
                super_bound,
            } => {
                self.write_prefix(f)?;
                write!(f, "?")?;
                if let Some(bound) = extends {
                    write!(f, " extends {bound}")?;
                }
                if let Some(bound) = super_bound {
                    write!(f, " super {bound}")?;
                }
                Ok(())
            }
            TypeKind::Intersection(bounds) => {
                for (index, bound) in bounds.iter().enumerate() {
                    if index > 0 {
                        write!(f, " & ")?;
                    }
                    write!(f, "{bound}")?;
                }
                Ok(())
            }
            TypeKind::Null => {
                self.write_prefix(f)?;
                write!(f, "null")
            }
            TypeKind::Void => write!(f, "void"),
        }
    }
}
