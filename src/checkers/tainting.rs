use crate::defaults::TypeUseLocation;
use crate::hierarchy::{QualifierDecl, TypeSystemError};
use crate::type_system::{LiteralKind, NoRules, TypeSystem};

pub(crate) const NAME: &str = "tainting";

/// `@Untainted` values are trusted; everything else, including input, is `@Tainted`.
pub(crate) fn type_system() -> Result<TypeSystem, TypeSystemError> {
    TypeSystem::new(
        NAME,
        &[
            QualifierDecl::new("Tainted").default_for(&[TypeUseLocation::Otherwise]),
            QualifierDecl::new("Untainted")
                .subtype_of(&["Tainted"])
                .literals(&[
                    LiteralKind::String,
                    LiteralKind::Int,
                    LiteralKind::Bool,
                    LiteralKind::Char,
                    LiteralKind::Null,
                ]),
        ],
        Box::new(NoRules),
    )
}
