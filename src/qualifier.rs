use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::dataflow::expression::FlowExpr;

/// Index of a qualifier kind inside one `QualifierKindHierarchy`.
pub(crate) type KindId = usize;

/// One argument of a structured qualifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum QualifierArg {
    Int(i64),
    Text(String),
    /// Standardized dependent expression.
    Expr(FlowExpr),
}

impl fmt::Display for QualifierArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualifierArg::Int(value) => write!(f, "{value}"),
            QualifierArg::Text(value) => write!(f, "\"{value}\""),
            QualifierArg::Expr(expr) => write!(f, "\"{expr}\""),
        }
    }
}

/// A lattice element: a kind plus the arguments of a structured kind.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Qualifier {
    pub(crate) kind: KindId,
    /// Top kind of the hierarchy this qualifier belongs to.
    pub(crate) top: KindId,
    pub(crate) name: String,
    pub(crate) args: BTreeSet<QualifierArg>,
}

impl Qualifier {
    pub(crate) fn is_structured(&self) -> bool {
        !self.args.is_empty()
    }

    pub(crate) fn same_hierarchy(&self, other: &Qualifier) -> bool {
        self.top == other.top
    }

    pub(crate) fn text_args(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(|arg| match arg {
            QualifierArg::Text(value) => Some(value.as_str()),
            _ => None,
        })
    }

    pub(crate) fn int_args(&self) -> impl Iterator<Item = i64> + '_ {
        self.args.iter().filter_map(|arg| match arg {
            QualifierArg::Int(value) => Some(*value),
            _ => None,
        })
    }

    /// Rewrite every dependent expression argument.
    pub(crate) fn map_exprs(&self, adapt: &dyn Fn(&FlowExpr) -> FlowExpr) -> Qualifier {
        let args = self
            .args
            .iter()
            .map(|arg| match arg {
                QualifierArg::Expr(expr) => QualifierArg::Expr(adapt(expr)),
                other => other.clone(),
            })
            .collect();
        Qualifier {
            args,
            ..self.clone()
        }
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.name)?;
        if self.args.is_empty() {
            return Ok(());
        }
        write!(f, "(")?;
        if self.args.len() > 1 {
            write!(f, "{{")?;
        }
        for (index, arg) in self.args.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        if self.args.len() > 1 {
            write!(f, "}}")?;
        }
        write!(f, ")")
    }
}

/// Qualifiers attached to one type position, at most one per hierarchy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub(crate) struct QualifierSet {
    by_top: BTreeMap<KindId, Qualifier>,
}

impl QualifierSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn single(qualifier: Qualifier) -> Self {
        let mut set = Self::new();
        set.replace(qualifier);
        set
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_top.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_top.len()
    }

    /// Qualifier of the hierarchy rooted at `top`.
    pub(crate) fn get(&self, top: KindId) -> Option<&Qualifier> {
        self.by_top.get(&top)
    }

    /// Replace whatever qualifier this set holds in the qualifier's hierarchy.
    pub(crate) fn replace(&mut self, qualifier: Qualifier) -> Option<Qualifier> {
        self.by_top.insert(qualifier.top, qualifier)
    }

    /// Insert only when the hierarchy has no qualifier yet.
    pub(crate) fn add_missing(&mut self, qualifier: Qualifier) {
        self.by_top.entry(qualifier.top).or_insert(qualifier);
    }

    pub(crate) fn add_all_missing(&mut self, other: &QualifierSet) {
        for qualifier in other.iter() {
            self.add_missing(qualifier.clone());
        }
    }

    pub(crate) fn remove(&mut self, top: KindId) -> Option<Qualifier> {
        self.by_top.remove(&top)
    }

    pub(crate) fn clear(&mut self) {
        self.by_top.clear();
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Qualifier> {
        self.by_top.values()
    }

    pub(crate) fn tops(&self) -> impl Iterator<Item = KindId> + '_ {
        self.by_top.keys().copied()
    }

    /// Overwrite every hierarchy present in `other`.
    pub(crate) fn replace_all(&mut self, other: &QualifierSet) {
        for qualifier in other.iter() {
            self.replace(qualifier.clone());
        }
    }
}

impl FromIterator<Qualifier> for QualifierSet {
    fn from_iter<I: IntoIterator<Item = Qualifier>>(iter: I) -> Self {
        let mut set = QualifierSet::new();
        for qualifier in iter {
            set.replace(qualifier);
        }
        set
    }
}

impl fmt::Display for QualifierSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, qualifier) in self.iter().enumerate() {
            if index > 0 {
                write!(f, " ")?;
            }
            write!(f, "{qualifier}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qualifier(kind: KindId, top: KindId, name: &str) -> Qualifier {
        Qualifier {
            kind,
            top,
            name: name.to_string(),
            args: BTreeSet::new(),
        }
    }

    #[test]
    fn set_holds_one_qualifier_per_hierarchy() {
        let mut set = QualifierSet::new();
        set.replace(qualifier(1, 0, "NonNull"));
        set.replace(qualifier(0, 0, "Nullable"));
        set.replace(qualifier(3, 2, "Tainted"));

        assert_eq!(set.len(), 2);
        assert_eq!(set.get(0).map(|q| q.name.as_str()), Some("Nullable"));
        assert_eq!(set.to_string(), "@Nullable @Tainted");
    }

    #[test]
    fn add_missing_keeps_existing_qualifier() {
        let mut set = QualifierSet::single(qualifier(1, 0, "NonNull"));
        set.add_missing(qualifier(0, 0, "Nullable"));
        assert_eq!(set.get(0).map(|q| q.kind), Some(1));
    }

    #[test]
    fn structured_qualifier_renders_arguments() {
        let mut value = qualifier(4, 3, "IntVal");
        value.args.insert(QualifierArg::Int(2));
        value.args.insert(QualifierArg::Int(1));
        assert_eq!(value.to_string(), "@IntVal({1, 2})");

        let mut bound = qualifier(6, 5, "LTLengthOf");
        bound
            .args
            .insert(QualifierArg::Expr(FlowExpr::Local("a".to_string())));
        assert_eq!(bound.to_string(), "@LTLengthOf(\"a\")");
        let adapted = bound.map_exprs(&|_| FlowExpr::Param(1));
        assert_eq!(adapted.to_string(), "@LTLengthOf(\"#1\")");
    }
}
