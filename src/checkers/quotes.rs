use crate::defaults::TypeUseLocation;
use crate::hierarchy::{QualifierDecl, QualifierHierarchy, TypeSystemError};
use crate::ir::{BinaryOp, Literal};
use crate::qualifier::QualifierSet;
use crate::type_system::{LiteralKind, TypeRules, TypeSystem};

pub(crate) const NAME: &str = "quotes";

const EVEN: &str = "EvenQuotes";
const ODD: &str = "OddQuotes";

/// Parity of the number of `"` characters in a string.
pub(crate) fn type_system() -> Result<TypeSystem, TypeSystemError> {
    TypeSystem::new(
        NAME,
        &[
            QualifierDecl::new("UnknownQuotes").default_for(&[TypeUseLocation::Otherwise]),
            QualifierDecl::new(EVEN)
                .subtype_of(&["UnknownQuotes"])
                .literals(&[LiteralKind::Int, LiteralKind::Bool, LiteralKind::Null]),
            QualifierDecl::new(ODD).subtype_of(&["UnknownQuotes"]),
            QualifierDecl::new("QuotesBottom")
                .subtype_of(&[EVEN, ODD])
                .bottom(),
        ],
        Box::new(QuoteRules),
    )
}

struct QuoteRules;

impl QuoteRules {
    fn parity_qualifier(hierarchy: &QualifierHierarchy, odd: bool) -> Option<QualifierSet> {
        let name = if odd { ODD } else { EVEN };
        Some(QualifierSet::single(hierarchy.qualifier(name).ok()?))
    }

    /// `Some(true)` for an odd count, `None` when unknown.
    fn parity(value: &QualifierSet) -> Option<bool> {
        value.iter().find_map(|qualifier| match qualifier.name.as_str() {
            EVEN => Some(false),
            ODD => Some(true),
            _ => None,
        })
    }
}

impl TypeRules for QuoteRules {
    fn literal(&self, hierarchy: &QualifierHierarchy, literal: &Literal) -> Option<QualifierSet> {
        let odd = match literal {
            Literal::String(text) => text.chars().filter(|c| *c == '"').count() % 2 == 1,
            Literal::Char(c) => *c == '"',
            _ => return None,
        };
        Self::parity_qualifier(hierarchy, odd)
    }

    /// Concatenation adds parities.
    fn binary(
        &self,
        hierarchy: &QualifierHierarchy,
        op: BinaryOp,
        left: &QualifierSet,
        right: &QualifierSet,
    ) -> Option<QualifierSet> {
        if op != BinaryOp::Add {
            return None;
        }
        let odd = Self::parity(left)? != Self::parity(right)?;
        Self::parity_qualifier(hierarchy, odd)
    }
}
