use crate::annotated_type::AnnotatedType;
use crate::defaults::TypeUseLocation;
use crate::hierarchy::{QualifierDecl, QualifierHierarchy, TypeSystemError};
use crate::ir::Expr;
use crate::qualifier::QualifierSet;
use crate::type_system::{LiteralKind, RuleFinding, TypeRules, TypeSystem};

pub(crate) const NAME: &str = "nullness";

const NULLABLE: &str = "Nullable";
const NON_NULL: &str = "NonNull";

pub(crate) fn type_system() -> Result<TypeSystem, TypeSystemError> {
    TypeSystem::new(
        NAME,
        &[
            QualifierDecl::new(NULLABLE).literals(&[LiteralKind::Null]),
            QualifierDecl::new(NON_NULL)
                .subtype_of(&[NULLABLE])
                .bottom()
                .default_for(&[TypeUseLocation::Otherwise])
                .literals(&[
                    LiteralKind::String,
                    LiteralKind::Int,
                    LiteralKind::Bool,
                    LiteralKind::Char,
                ]),
        ],
        Box::new(NullnessRules),
    )
}

/// Comparisons against `null`, `instanceof` and dereferences prove non-nullness.
struct NullnessRules;

impl NullnessRules {
    fn non_null(hierarchy: &QualifierHierarchy, value: &QualifierSet) -> Option<QualifierSet> {
        let mut refined = value.clone();
        refined.replace(hierarchy.qualifier(NON_NULL).ok()?);
        Some(refined)
    }
}

impl TypeRules for NullnessRules {
    fn refine_not_equal(
        &self,
        hierarchy: &QualifierHierarchy,
        operand: &QualifierSet,
        other: &Expr,
    ) -> Option<QualifierSet> {
        if !other.is_null_literal() {
            return None;
        }
        Self::non_null(hierarchy, operand)
    }

    fn refine_instanceof(
        &self,
        hierarchy: &QualifierHierarchy,
        operand: &QualifierSet,
    ) -> Option<QualifierSet> {
        Self::non_null(hierarchy, operand)
    }

    fn refine_dereference(
        &self,
        hierarchy: &QualifierHierarchy,
        receiver: &QualifierSet,
    ) -> Option<QualifierSet> {
        Self::non_null(hierarchy, receiver)
    }

    fn check_dereference(
        &self,
        hierarchy: &QualifierHierarchy,
        receiver: &AnnotatedType,
    ) -> Option<RuleFinding> {
        if receiver.is_primitive() {
            return None;
        }
        let non_null = hierarchy.qualifier(NON_NULL).ok()?;
        let found = receiver.primary(non_null.top)?;
        if hierarchy.is_subtype(found, &non_null) {
            return None;
        }
        Some(RuleFinding {
            key: "dereference.of.nullable",
            args: Vec::new(),
        })
    }
}
