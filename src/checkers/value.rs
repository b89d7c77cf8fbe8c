use std::collections::BTreeSet;

use crate::defaults::TypeUseLocation;
use crate::hierarchy::{ArgumentKind, ArgumentOrder, QualifierDecl, QualifierHierarchy, TypeSystemError};
use crate::ir::{BinaryOp, Literal};
use crate::qualifier::{Qualifier, QualifierArg, QualifierSet};
use crate::type_system::{TypeRules, TypeSystem};

pub(crate) const NAME: &str = "value";

const UNKNOWN: &str = "UnknownVal";
const INT_VAL: &str = "IntVal";
const STRING_VAL: &str = "StringVal";

/// Values beyond this many possibilities are not tracked.
pub(crate) const MAX_VALUES: usize = 10;

/// Constant propagation over sets of possible values.
pub(crate) fn type_system() -> Result<TypeSystem, TypeSystemError> {
    TypeSystem::new(
        NAME,
        &[
            QualifierDecl::new(UNKNOWN).default_for(&[TypeUseLocation::Otherwise]),
            QualifierDecl::new(INT_VAL)
                .subtype_of(&[UNKNOWN])
                .arguments(ArgumentKind::Ints, ArgumentOrder::Subset)
                .max_arguments(MAX_VALUES),
            QualifierDecl::new(STRING_VAL)
                .subtype_of(&[UNKNOWN])
                .arguments(ArgumentKind::Strings, ArgumentOrder::Subset)
                .max_arguments(MAX_VALUES),
            QualifierDecl::new("BottomVal")
                .subtype_of(&[INT_VAL, STRING_VAL])
                .bottom(),
        ],
        Box::new(ValueRules),
    )
}

struct ValueRules;

#[derive(Clone, Debug)]
enum Values {
    Ints(BTreeSet<i64>),
    Strings(BTreeSet<String>),
}

impl Values {
    fn of(qualifier: &Qualifier) -> Option<Self> {
        match qualifier.name.as_str() {
            INT_VAL => Some(Values::Ints(qualifier.int_args().collect())),
            STRING_VAL => Some(Values::Strings(
                qualifier.text_args().map(str::to_string).collect(),
            )),
            _ => None,
        }
    }

    fn as_strings(&self) -> BTreeSet<String> {
        match self {
            Values::Ints(values) => values.iter().map(|value| value.to_string()).collect(),
            Values::Strings(values) => values.clone(),
        }
    }

    fn into_qualifier(self, hierarchy: &QualifierHierarchy) -> Option<Qualifier> {
        let (name, args): (&str, BTreeSet<QualifierArg>) = match self {
            Values::Ints(values) => (INT_VAL, values.into_iter().map(QualifierArg::Int).collect()),
            Values::Strings(values) => (
                STRING_VAL,
                values.into_iter().map(QualifierArg::Text).collect(),
            ),
        };
        let kind = hierarchy.kinds().by_name(name)?;
        if args.len() > MAX_VALUES {
            return Some(hierarchy.of_kind(hierarchy.kinds().kind(kind).top));
        }
        Some(hierarchy.with_args(kind, args))
    }
}

fn arithmetic(op: BinaryOp, left: i64, right: i64) -> Option<i64> {
    match op {
        BinaryOp::Add => left.checked_add(right),
        BinaryOp::Sub => left.checked_sub(right),
        BinaryOp::Mul => left.checked_mul(right),
        BinaryOp::Div => left.checked_div(right),
        BinaryOp::Rem => left.checked_rem(right),
        _ => None,
    }
}

fn unknown(hierarchy: &QualifierHierarchy) -> Option<QualifierSet> {
    Some(QualifierSet::single(hierarchy.qualifier(UNKNOWN).ok()?))
}

impl TypeRules for ValueRules {
    fn literal(&self, hierarchy: &QualifierHierarchy, literal: &Literal) -> Option<QualifierSet> {
        let values = match literal {
            Literal::Int(value) => Values::Ints(BTreeSet::from([*value])),
            Literal::Char(value) => Values::Ints(BTreeSet::from([*value as i64])),
            Literal::String(value) => Values::Strings(BTreeSet::from([value.clone()])),
            Literal::Null | Literal::Bool(_) => return None,
        };
        values.into_qualifier(hierarchy).map(QualifierSet::single)
    }

    /// Every combination of the operands' possible values.
    fn binary(
        &self,
        hierarchy: &QualifierHierarchy,
        op: BinaryOp,
        left: &QualifierSet,
        right: &QualifierSet,
    ) -> Option<QualifierSet> {
        // An operand with no possible value makes the result unreachable too.
        if let Some(bottom) = left
            .iter()
            .chain(right.iter())
            .find(|qualifier| hierarchy.is_bottom(qualifier))
        {
            return Some(QualifierSet::single(bottom.clone()));
        }
        let left = left.iter().find_map(Values::of);
        let right = right.iter().find_map(Values::of);
        let (Some(left), Some(right)) = (left, right) else {
            return unknown(hierarchy);
        };
        let result = match (&left, &right) {
            (Values::Ints(lefts), Values::Ints(rights)) => {
                let mut out = BTreeSet::new();
                for l in lefts {
                    for r in rights {
                        match arithmetic(op, *l, *r) {
                            Some(value) => out.insert(value),
                            None => return unknown(hierarchy),
                        };
                    }
                }
                Values::Ints(out)
            }
            _ if op == BinaryOp::Add => {
                let mut out = BTreeSet::new();
                for l in left.as_strings() {
                    for r in right.as_strings() {
                        out.insert(format!("{l}{r}"));
                    }
                }
                Values::Strings(out)
            }
            _ => return None,
        };
        result.into_qualifier(hierarchy).map(QualifierSet::single)
    }
}
