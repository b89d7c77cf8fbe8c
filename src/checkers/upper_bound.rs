use std::collections::BTreeSet;

use crate::annotated_type::AnnotatedType;
use crate::dataflow::expression::FlowExpr;
use crate::defaults::TypeUseLocation;
use crate::hierarchy::{ArgumentKind, ArgumentOrder, QualifierDecl, QualifierHierarchy, TypeSystemError};
use crate::ir::BinaryOp;
use crate::qualifier::{QualifierArg, QualifierSet};
use crate::type_system::{ConditionalRefinement, RuleFinding, TypeRules, TypeSystem};

pub(crate) const NAME: &str = "upper_bound";

const LT_LENGTH_OF: &str = "LTLengthOf";

/// `@LTLengthOf("a")` marks an int that is a valid index for every array named.
pub(crate) fn type_system() -> Result<TypeSystem, TypeSystemError> {
    TypeSystem::new(
        NAME,
        &[
            QualifierDecl::new("UpperBoundUnknown").default_for(&[TypeUseLocation::Otherwise]),
            QualifierDecl::new(LT_LENGTH_OF)
                .subtype_of(&["UpperBoundUnknown"])
                .arguments(ArgumentKind::Expressions, ArgumentOrder::Superset),
            QualifierDecl::new("UpperBoundBottom")
                .subtype_of(&[LT_LENGTH_OF])
                .bottom(),
        ],
        Box::new(UpperBoundRules),
    )
}

struct UpperBoundRules;

/// The array of an `a.length` expression.
fn length_of(expr: &FlowExpr) -> Option<&FlowExpr> {
    match expr {
        FlowExpr::Field { receiver, field } if field == "length" => Some(receiver),
        _ => None,
    }
}

fn less_than_length(hierarchy: &QualifierHierarchy, array: &FlowExpr) -> Option<QualifierSet> {
    let kind = hierarchy.kinds().by_name(LT_LENGTH_OF)?;
    let args = BTreeSet::from([QualifierArg::Expr(array.clone())]);
    Some(QualifierSet::single(hierarchy.with_args(kind, args)))
}

impl TypeRules for UpperBoundRules {
    /// `i < a.length` and `a.length > i` bound `i` on the true branch;
    /// `i >= a.length` and `a.length <= i` bound it on the false branch.
    fn refine_comparison(
        &self,
        hierarchy: &QualifierHierarchy,
        op: BinaryOp,
        left: Option<&FlowExpr>,
        right: Option<&FlowExpr>,
    ) -> ConditionalRefinement {
        let mut refinement = ConditionalRefinement::default();
        let (Some(left), Some(right)) = (left, right) else {
            return refinement;
        };
        let (index, array, when_true) = match op {
            BinaryOp::Lt => match length_of(right) {
                Some(array) => (left, array, true),
                None => return refinement,
            },
            BinaryOp::Ge => match length_of(right) {
                Some(array) => (left, array, false),
                None => return refinement,
            },
            BinaryOp::Gt => match length_of(left) {
                Some(array) => (right, array, true),
                None => return refinement,
            },
            BinaryOp::Le => match length_of(left) {
                Some(array) => (right, array, false),
                None => return refinement,
            },
            _ => return refinement,
        };
        let Some(bound) = less_than_length(hierarchy, array) else {
            return refinement;
        };
        let fact = (index.clone(), bound);
        if when_true {
            refinement.then_facts.push(fact);
        } else {
            refinement.else_facts.push(fact);
        }
        refinement
    }

    fn check_array_access(
        &self,
        hierarchy: &QualifierHierarchy,
        array: Option<&FlowExpr>,
        index: &AnnotatedType,
    ) -> Option<RuleFinding> {
        let bound = less_than_length(hierarchy, array?)?;
        let required = bound.iter().next()?;
        let found = index.primary(required.top)?;
        if hierarchy.is_subtype(found, required) {
            return None;
        }
        Some(RuleFinding {
            key: "array.access.unsafe.high",
            args: vec![found.to_string()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::*;

    fn read_at(index_guard: Option<crate::ir::Expr>) -> Vec<crate::ir::CompilationUnit> {
        let access = expr_stmt(array_access(local("values"), local("i")));
        let body = match index_guard {
            Some(guard) => vec![if_then(guard, vec![access])],
            None => vec![access],
        };
        vec![unit(
            "A.java",
            vec![class("A").method(
                method("m")
                    .param("values", array_of(primitive("int")))
                    .param("i", primitive("int"))
                    .body(body),
            )],
        )]
    }

    fn length(array: &str) -> crate::ir::Expr {
        field_access(local(array), "length")
    }

    #[test]
    fn guarded_index_is_accepted() {
        let harness = CheckerTestHarness::new(NAME).expect("harness");
        let guard = binary(BinaryOp::Lt, local("i"), length("values"));

        let diagnostics = harness.check(read_at(Some(guard))).expect("check");

        assert!(diagnostics.is_empty(), "unexpected: {diagnostics:?}");
    }

    #[test]
    fn reversed_guard_is_understood() {
        let harness = CheckerTestHarness::new(NAME).expect("harness");
        let guard = binary(BinaryOp::Gt, length("values"), local("i"));

        let diagnostics = harness.check(read_at(Some(guard))).expect("check");

        assert!(diagnostics.is_empty(), "unexpected: {diagnostics:?}");
    }

    #[test]
    fn unguarded_index_is_reported() {
        let harness = CheckerTestHarness::new(NAME).expect("harness");

        let diagnostics = harness.check(read_at(None)).expect("check");

        assert_eq!(keys(&diagnostics), vec!["array.access.unsafe.high"]);
        assert_eq!(
            diagnostics[0].args,
            vec![
                "i".to_string(),
                "values".to_string(),
                "@UpperBoundUnknown".to_string()
            ]
        );
    }

    #[test]
    fn guard_against_another_array_does_not_help() {
        let harness = CheckerTestHarness::new(NAME).expect("harness");
        let units = vec![unit(
            "A.java",
            vec![class("A").method(
                method("m")
                    .param("values", array_of(primitive("int")))
                    .param("other", array_of(primitive("int")))
                    .param("i", primitive("int"))
                    .body(vec![if_then(
                        binary(BinaryOp::Lt, local("i"), length("other")),
                        vec![expr_stmt(array_access(local("values"), local("i")))],
                    )]),
            )],
        )];

        let diagnostics = harness.check(units).expect("check");

        assert_eq!(keys(&diagnostics), vec!["array.access.unsafe.high"]);
    }
}
