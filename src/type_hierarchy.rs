use crate::annotated_type::{AnnotatedType, TypeKind};
use crate::hierarchy::QualifierHierarchy;
use crate::qualifier::KindId;

/// Structural subtyping over annotated types.
pub(crate) struct TypeHierarchy<'a> {
    qualifiers: &'a QualifierHierarchy,
}

impl<'a> TypeHierarchy<'a> {
    pub(crate) fn new(qualifiers: &'a QualifierHierarchy) -> Self {
        Self { qualifiers }
    }

    pub(crate) fn is_subtype(&self, sub: &AnnotatedType, sup: &AnnotatedType) -> bool {
        let tops: Vec<KindId> = self.qualifiers.tops().iter().map(|top| top.top).collect();
        tops.iter().all(|top| self.is_subtype_in(sub, sup, *top))
    }

    /// Subtyping restricted to the hierarchy rooted at `top`.
    pub(crate) fn is_subtype_in(&self, sub: &AnnotatedType, sup: &AnnotatedType, top: KindId) -> bool {
        if !self.primary_is_subtype(sub, sup, top) {
            return false;
        }
        match (&sub.kind, &sup.kind) {
            (TypeKind::Array(sub_component), TypeKind::Array(sup_component)) => {
                self.is_subtype_in(sub_component, sup_component, top)
            }
            (
                TypeKind::Declared {
                    name: sub_name,
                    args: sub_args,
                },
                TypeKind::Declared {
                    name: sup_name,
                    args: sup_args,
                },
            ) if sub_name == sup_name && sub_args.len() == sup_args.len() => sub_args
                .iter()
                .zip(sup_args)
                .all(|(sub_arg, sup_arg)| self.type_argument_contained(sub_arg, sup_arg, top)),
            _ => true,
        }
    }

    fn primary_is_subtype(&self, sub: &AnnotatedType, sup: &AnnotatedType, top: KindId) -> bool {
        if let (
            TypeKind::TypeVar {
                name: sub_name,
                upper,
                ..
            },
            TypeKind::TypeVar {
                name: sup_name,
                lower,
                ..
            },
        ) = (&sub.kind, &sup.kind)
        {
            if sub_name == sup_name {
                // Same variable: only the use qualifiers can differ.
                return match (sub.qualifiers.get(top), sup.qualifiers.get(top)) {
                    (None, None) => true,
                    (Some(sub_q), Some(sup_q)) => self.qualifiers.is_subtype(sub_q, sup_q),
                    (Some(sub_q), None) => lower
                        .get(top)
                        .is_none_or(|sup_q| self.qualifiers.is_subtype(sub_q, sup_q)),
                    (None, Some(sup_q)) => upper
                        .get(top)
                        .is_none_or(|sub_q| self.qualifiers.is_subtype(sub_q, sup_q)),
                };
            }
        }
        match (sub.primary(top), sup.primary_as_supertype(top)) {
            (Some(sub_q), Some(sup_q)) => self.qualifiers.is_subtype(sub_q, sup_q),
            _ => true,
        }
    }

    /// Containment of a type argument: invariant unless `sup` is a wildcard.
    fn type_argument_contained(&self, sub: &AnnotatedType, sup: &AnnotatedType, top: KindId) -> bool {
        match &sup.kind {
            TypeKind::Wildcard {
                extends,
                super_bound,
            } => {
                let upper_ok = extends
                    .as_ref()
                    .is_none_or(|bound| self.is_subtype_in(sub, bound, top));
                let lower_ok = super_bound
                    .as_ref()
                    .is_none_or(|bound| self.is_subtype_in(bound, sub, top));
                upper_ok && lower_ok
            }
            _ => self.is_subtype_in(sub, sup, top) && self.is_subtype_in(sup, sub, top),
        }
    }
}
