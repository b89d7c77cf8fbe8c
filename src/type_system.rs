use serde::Deserialize;

use crate::annotated_type::AnnotatedType;
use crate::dataflow::expression::FlowExpr;
use crate::defaults::QualifierDefaults;
use crate::hierarchy::{HierarchyDecl, QualifierDecl, QualifierHierarchy, TypeSystemError};
use crate::ir::{BinaryOp, Expr, Literal};
use crate::qualifier::QualifierSet;

/// Literal category a qualifier kind can be declared for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum LiteralKind {
    Null,
    String,
    Int,
    Bool,
    Char,
}

impl LiteralKind {
    pub(crate) fn of(literal: &Literal) -> Self {
        match literal {
            Literal::Null => LiteralKind::Null,
            Literal::String(_) => LiteralKind::String,
            Literal::Int(_) => LiteralKind::Int,
            Literal::Bool(_) => LiteralKind::Bool,
            Literal::Char(_) => LiteralKind::Char,
        }
    }
}

/// A type-system specific diagnostic raised by a rule hook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RuleFinding {
    pub(crate) key: &'static str,
    pub(crate) args: Vec<String>,
}

/// Facts learned on each branch of a condition.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConditionalRefinement {
    pub(crate) then_facts: Vec<(FlowExpr, QualifierSet)>,
    pub(crate) else_facts: Vec<(FlowExpr, QualifierSet)>,
}

impl ConditionalRefinement {
    pub(crate) fn is_empty(&self) -> bool {
        self.then_facts.is_empty() && self.else_facts.is_empty()
    }
}

/// Type-system specific transfer and validation hooks.
///
/// Every hook has a neutral default, so a purely declarative hierarchy
/// needs no rules at all.
pub(crate) trait TypeRules {
    /// Qualifiers of a literal beyond the per-kind `literals` declarations.
    fn literal(&self, _hierarchy: &QualifierHierarchy, _literal: &Literal) -> Option<QualifierSet> {
        None
    }

    /// Result of an arithmetic or concatenation operator; `None` means lub of the operands.
    fn binary(
        &self,
        _hierarchy: &QualifierHierarchy,
        _op: BinaryOp,
        _left: &QualifierSet,
        _right: &QualifierSet,
    ) -> Option<QualifierSet> {
        None
    }

    /// Refinement of `operand` on the branch where it differs from `other`.
    fn refine_not_equal(
        &self,
        _hierarchy: &QualifierHierarchy,
        _operand: &QualifierSet,
        _other: &Expr,
    ) -> Option<QualifierSet> {
        None
    }

    /// Refinement of the operand of a successful `instanceof`.
    fn refine_instanceof(
        &self,
        _hierarchy: &QualifierHierarchy,
        _operand: &QualifierSet,
    ) -> Option<QualifierSet> {
        None
    }

    /// Refinement of a receiver after it has been dereferenced.
    fn refine_dereference(
        &self,
        _hierarchy: &QualifierHierarchy,
        _receiver: &QualifierSet,
    ) -> Option<QualifierSet> {
        None
    }

    /// Refinements implied by `<`, `<=`, `>` and `>=`.
    fn refine_comparison(
        &self,
        _hierarchy: &QualifierHierarchy,
        _op: BinaryOp,
        _left: Option<&FlowExpr>,
        _right: Option<&FlowExpr>,
    ) -> ConditionalRefinement {
        ConditionalRefinement::default()
    }

    fn check_dereference(
        &self,
        _hierarchy: &QualifierHierarchy,
        _receiver: &AnnotatedType,
    ) -> Option<RuleFinding> {
        None
    }

    fn check_equality(
        &self,
        _hierarchy: &QualifierHierarchy,
        _left: (&Expr, &AnnotatedType),
        _right: (&Expr, &AnnotatedType),
    ) -> Option<RuleFinding> {
        None
    }

    fn check_array_access(
        &self,
        _hierarchy: &QualifierHierarchy,
        _array: Option<&FlowExpr>,
        _index: &AnnotatedType,
    ) -> Option<RuleFinding> {
        None
    }
}

/// Rules for hierarchies that only declare qualifiers and defaults.
pub(crate) struct NoRules;

impl TypeRules for NoRules {}

/// Everything the generic factory, transfer and visitor need from one checker.
pub(crate) struct TypeSystem {
    pub(crate) name: String,
    pub(crate) hierarchy: QualifierHierarchy,
    pub(crate) defaults: QualifierDefaults,
    pub(crate) rules: Box<dyn TypeRules + Send + Sync>,
}

impl TypeSystem {
    pub(crate) fn new(
        name: &str,
        decls: &[QualifierDecl],
        rules: Box<dyn TypeRules + Send + Sync>,
    ) -> Result<Self, TypeSystemError> {
        let hierarchy = QualifierHierarchy::new(decls)?;
        let defaults = QualifierDefaults::new(&hierarchy);
        Ok(Self {
            name: name.to_string(),
            hierarchy,
            defaults,
            rules,
        })
    }

    pub(crate) fn declarative(decl: &HierarchyDecl) -> Result<Self, TypeSystemError> {
        Self::new(&decl.name, &decl.qualifiers, Box::new(NoRules))
    }

    /// Qualifiers fixed for a literal; hierarchies without a rule are left out.
    pub(crate) fn literal_qualifiers(&self, literal: &Literal) -> QualifierSet {
        let mut out = self
            .rules
            .literal(&self.hierarchy, literal)
            .unwrap_or_default();
        let kind = LiteralKind::of(literal);
        for (id, info) in self.hierarchy.kinds().kinds() {
            if info.literals.contains(&kind) {
                out.add_missing(self.hierarchy.of_kind(id));
            }
        }
        out
    }
}

impl std::fmt::Debug for TypeSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeSystem")
            .field("name", &self.name)
            .field("hierarchy", &self.hierarchy)
            .finish_non_exhaustive()
    }
}
