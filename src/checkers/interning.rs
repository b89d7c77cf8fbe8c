use crate::annotated_type::AnnotatedType;
use crate::defaults::TypeUseLocation;
use crate::hierarchy::{QualifierDecl, QualifierHierarchy, TypeSystemError};
use crate::ir::Expr;
use crate::type_system::{LiteralKind, RuleFinding, TypeRules, TypeSystem};

pub(crate) const NAME: &str = "interning";

const INTERNED: &str = "Interned";

pub(crate) fn type_system() -> Result<TypeSystem, TypeSystemError> {
    TypeSystem::new(
        NAME,
        &[
            QualifierDecl::new("UnknownInterned").default_for(&[TypeUseLocation::Otherwise]),
            QualifierDecl::new(INTERNED)
                .subtype_of(&["UnknownInterned"])
                .literals(&[
                    LiteralKind::String,
                    LiteralKind::Null,
                    LiteralKind::Int,
                    LiteralKind::Bool,
                    LiteralKind::Char,
                ]),
        ],
        Box::new(InterningRules),
    )
}

/// Reference equality is only meaningful between interned values.
struct InterningRules;

impl InterningRules {
    fn is_interned(hierarchy: &QualifierHierarchy, ty: &AnnotatedType) -> bool {
        let Ok(interned) = hierarchy.qualifier(INTERNED) else {
            return true;
        };
        ty.primary(interned.top)
            .is_none_or(|found| hierarchy.is_subtype(found, &interned))
    }
}

impl TypeRules for InterningRules {
    fn check_equality(
        &self,
        hierarchy: &QualifierHierarchy,
        left: (&Expr, &AnnotatedType),
        right: (&Expr, &AnnotatedType),
    ) -> Option<RuleFinding> {
        let (left_expr, left_type) = left;
        let (right_expr, right_type) = right;
        if left_type.is_primitive() || right_type.is_primitive() {
            return None;
        }
        if left_expr.is_null_literal() || right_expr.is_null_literal() {
            return None;
        }
        let offending = if !Self::is_interned(hierarchy, left_type) {
            left_expr
        } else if !Self::is_interned(hierarchy, right_type) {
            right_expr
        } else {
            return None;
        };
        Some(RuleFinding {
            key: "not.interned",
            args: vec![offending.to_string()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::BinaryOp;
    use crate::test_harness::*;

    #[test]
    fn comparing_uninterned_strings_is_reported() {
        let harness = CheckerTestHarness::new(NAME).expect("harness");
        let units = vec![unit(
            "A.java",
            vec![class("A").method(
                method("same")
                    .param("a", declared("String"))
                    .param("b", declared_with("String", &["Interned"]))
                    .returns(primitive("boolean"))
                    .body(vec![return_stmt(Some(binary(
                        BinaryOp::Eq,
                        local("a"),
                        local("b"),
                    )))]),
            )],
        )];

        let diagnostics = harness.check(units).expect("check");

        assert_eq!(keys(&diagnostics), vec!["not.interned"]);
        assert_eq!(diagnostics[0].args, vec!["a".to_string()]);
    }

    #[test]
    fn comparisons_with_null_and_interned_values_are_fine() {
        let harness = CheckerTestHarness::new(NAME).expect("harness");
        let units = vec![unit(
            "A.java",
            vec![class("A").method(
                method("check")
                    .param("a", declared("String"))
                    .param("b", declared_with("String", &["Interned"]))
                    .body(vec![
                        if_then(binary(BinaryOp::Eq, local("a"), null_lit()), vec![]),
                        if_then(binary(BinaryOp::Eq, local("b"), string_lit("x")), vec![]),
                    ]),
            )],
        )];

        let diagnostics = harness.check(units).expect("check");

        assert!(diagnostics.is_empty(), "unexpected: {diagnostics:?}");
    }
}
