use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use thiserror::Error;

use crate::defaults::TypeUseLocation;
use crate::qualifier::{KindId, Qualifier, QualifierArg, QualifierSet};
use crate::type_system::LiteralKind;

/// Misconfigured hierarchies and requests that mix hierarchies.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum TypeSystemError {
    #[error("duplicate qualifier kind {0}")]
    DuplicateQualifier(String),
    #[error("qualifier {kind} declares unknown supertype {supertype}")]
    UnknownSupertype { kind: String, supertype: String },
    #[error("subtyping cycle through qualifier {0}")]
    Cycle(String),
    #[error("qualifier {kind} reaches several tops: {tops}")]
    MultipleTops { kind: String, tops: String },
    #[error("hierarchy {top} declares several bottoms: {bottoms}")]
    MultipleBottoms { top: String, bottoms: String },
    #[error("no unique least upper bound for {0} and {1}")]
    NonUniqueLub(String, String),
    #[error("no unique greatest lower bound for {0} and {1}")]
    NonUniqueGlb(String, String),
    #[error("{0} and {1} belong to different qualifier hierarchies")]
    CrossHierarchy(String, String),
    #[error("unknown qualifier {0}")]
    UnknownQualifier(String),
}

/// Argument type of a structured qualifier kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ArgumentKind {
    Strings,
    Ints,
    /// Dependent expressions, standardized before they are compared.
    Expressions,
}

/// How argument sets of one structured kind are ordered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ArgumentOrder {
    /// More arguments denote more values: `a <: b` iff `args(a) ⊆ args(b)`.
    #[default]
    Subset,
    /// More arguments denote more facts: `a <: b` iff `args(a) ⊇ args(b)`.
    Superset,
}

/// Declaration of one qualifier hierarchy set, usable from JSON.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct HierarchyDecl {
    pub(crate) name: String,
    pub(crate) qualifiers: Vec<QualifierDecl>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct QualifierDecl {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) subtype_of: Vec<String>,
    #[serde(default)]
    pub(crate) bottom: bool,
    #[serde(default)]
    pub(crate) arguments: Option<ArgumentKind>,
    #[serde(default)]
    pub(crate) argument_order: ArgumentOrder,
    #[serde(default)]
    pub(crate) max_arguments: Option<usize>,
    #[serde(default)]
    pub(crate) default_for: Vec<TypeUseLocation>,
    #[serde(default)]
    pub(crate) literals: Vec<LiteralKind>,
}

impl QualifierDecl {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subtype_of: Vec::new(),
            bottom: false,
            arguments: None,
            argument_order: ArgumentOrder::Subset,
            max_arguments: None,
            default_for: Vec::new(),
            literals: Vec::new(),
        }
    }

    pub(crate) fn subtype_of(mut self, supertypes: &[&str]) -> Self {
        self.subtype_of = supertypes.iter().map(|name| name.to_string()).collect();
        self
    }

    pub(crate) fn bottom(mut self) -> Self {
        self.bottom = true;
        self
    }

    pub(crate) fn arguments(mut self, kind: ArgumentKind, order: ArgumentOrder) -> Self {
        self.arguments = Some(kind);
        self.argument_order = order;
        self
    }

    pub(crate) fn max_arguments(mut self, max: usize) -> Self {
        self.max_arguments = Some(max);
        self
    }

    pub(crate) fn default_for(mut self, locations: &[TypeUseLocation]) -> Self {
        self.default_for = locations.to_vec();
        self
    }

    pub(crate) fn literals(mut self, literals: &[LiteralKind]) -> Self {
        self.literals = literals.to_vec();
        self
    }
}

/// A resolved qualifier kind.
#[derive(Clone, Debug)]
pub(crate) struct QualifierKind {
    pub(crate) name: String,
    pub(crate) top: KindId,
    pub(crate) is_top: bool,
    pub(crate) is_bottom: bool,
    pub(crate) arguments: Option<ArgumentKind>,
    pub(crate) argument_order: ArgumentOrder,
    pub(crate) max_arguments: Option<usize>,
    pub(crate) default_for: Vec<TypeUseLocation>,
    pub(crate) literals: Vec<LiteralKind>,
    /// Reflexive and transitive supertypes.
    supertypes: BTreeSet<KindId>,
}

impl QualifierKind {
    pub(crate) fn is_structured(&self) -> bool {
        self.arguments.is_some()
    }
}

/// Kinds, their subtype relation and the precomputed kind-level lub/glb tables.
#[derive(Clone, Debug)]
pub(crate) struct QualifierKindHierarchy {
    kinds: Vec<QualifierKind>,
    by_name: BTreeMap<String, KindId>,
    tops: Vec<KindId>,
    bottoms: BTreeMap<KindId, KindId>,
    lubs: BTreeMap<(KindId, KindId), KindId>,
    glbs: BTreeMap<(KindId, KindId), KindId>,
}

impl QualifierKindHierarchy {
    pub(crate) fn new(decls: &[QualifierDecl]) -> Result<Self, TypeSystemError> {
        let mut decls = decls.to_vec();
        let mut by_name = BTreeMap::new();
        for (id, decl) in decls.iter().enumerate() {
            if by_name.insert(decl.name.clone(), id).is_some() {
                return Err(TypeSystemError::DuplicateQualifier(decl.name.clone()));
            }
        }

        let mut direct: Vec<BTreeSet<KindId>> = Vec::with_capacity(decls.len());
        for decl in &decls {
            let mut supers = BTreeSet::new();
            for supertype in &decl.subtype_of {
                let Some(id) = by_name.get(supertype) else {
                    return Err(TypeSystemError::UnknownSupertype {
                        kind: decl.name.clone(),
                        supertype: supertype.clone(),
                    });
                };
                supers.insert(*id);
            }
            direct.push(supers);
        }

        let mut closure = transitive_closure(&direct, &decls)?;
        let tops: Vec<KindId> = (0..decls.len()).filter(|id| direct[*id].is_empty()).collect();

        let mut top_of = Vec::with_capacity(decls.len());
        for (id, supers) in closure.iter().enumerate() {
            let reached: Vec<KindId> = tops
                .iter()
                .copied()
                .filter(|top| supers.contains(top))
                .collect();
            if reached.len() != 1 {
                return Err(TypeSystemError::MultipleTops {
                    kind: decls[id].name.clone(),
                    tops: join_names(&decls, &reached),
                });
            }
            top_of.push(reached[0]);
        }

        let mut bottoms = BTreeMap::new();
        for &top in &tops {
            let members: Vec<KindId> = (0..decls.len()).filter(|id| top_of[*id] == top).collect();
            let declared: Vec<KindId> = members
                .iter()
                .copied()
                .filter(|id| decls[*id].bottom)
                .collect();
            if declared.len() > 1 {
                return Err(TypeSystemError::MultipleBottoms {
                    top: decls[top].name.clone(),
                    bottoms: join_names(&decls, &declared),
                });
            }
            let bottom = if let Some(&bottom) = declared.first() {
                bottom
            } else {
                let leaves: Vec<KindId> = members
                    .iter()
                    .copied()
                    .filter(|id| {
                        !members
                            .iter()
                            .any(|other| other != id && closure[*other].contains(id))
                    })
                    .collect();
                if leaves.len() == 1 && members.len() > 1 {
                    leaves[0]
                } else {
                    let name = format!("{}Bottom", decls[top].name);
                    if by_name.contains_key(&name) {
                        return Err(TypeSystemError::DuplicateQualifier(name));
                    }
                    let id = decls.len();
                    let mut decl = QualifierDecl::new(&name).bottom();
                    decl.subtype_of = leaves.iter().map(|leaf| decls[*leaf].name.clone()).collect();
                    decls.push(decl);
                    by_name.insert(name, id);
                    closure.push(BTreeSet::from([id]));
                    top_of.push(top);
                    id
                }
            };
            // Bottom is below every kind of its hierarchy.
            for member in members.iter().copied().chain(std::iter::once(bottom)) {
                closure[bottom].insert(member);
            }
            bottoms.insert(top, bottom);
        }

        let kinds: Vec<QualifierKind> = decls
            .iter()
            .enumerate()
            .map(|(id, decl)| QualifierKind {
                name: decl.name.clone(),
                top: top_of[id],
                is_top: top_of[id] == id,
                is_bottom: bottoms.get(&top_of[id]) == Some(&id),
                arguments: decl.arguments,
                argument_order: decl.argument_order,
                max_arguments: decl.max_arguments,
                default_for: decl.default_for.clone(),
                literals: decl.literals.clone(),
                supertypes: closure[id].clone(),
            })
            .collect();

        let mut hierarchy = Self {
            kinds,
            by_name,
            tops,
            bottoms,
            lubs: BTreeMap::new(),
            glbs: BTreeMap::new(),
        };
        hierarchy.compute_bounds()?;
        Ok(hierarchy)
    }

    fn compute_bounds(&mut self) -> Result<(), TypeSystemError> {
        for a in 0..self.kinds.len() {
            for b in 0..self.kinds.len() {
                if self.kinds[a].top != self.kinds[b].top {
                    continue;
                }
                let lub = self.find_lub(a, b)?;
                let glb = self.find_glb(a, b)?;
                self.lubs.insert((a, b), lub);
                self.glbs.insert((a, b), glb);
            }
        }
        Ok(())
    }

    fn find_lub(&self, a: KindId, b: KindId) -> Result<KindId, TypeSystemError> {
        if self.is_subtype(a, b) {
            return Ok(b);
        }
        if self.is_subtype(b, a) {
            return Ok(a);
        }
        let common: BTreeSet<KindId> = self.kinds[a]
            .supertypes
            .intersection(&self.kinds[b].supertypes)
            .copied()
            .collect();
        let lowest: Vec<KindId> = common
            .iter()
            .copied()
            .filter(|candidate| {
                !common
                    .iter()
                    .any(|other| other != candidate && self.is_subtype(*other, *candidate))
            })
            .collect();
        match lowest.as_slice() {
            [single] => Ok(*single),
            _ => Err(TypeSystemError::NonUniqueLub(
                self.kinds[a].name.clone(),
                self.kinds[b].name.clone(),
            )),
        }
    }

    fn find_glb(&self, a: KindId, b: KindId) -> Result<KindId, TypeSystemError> {
        if self.is_subtype(a, b) {
            return Ok(a);
        }
        if self.is_subtype(b, a) {
            return Ok(b);
        }
        let common: Vec<KindId> = (0..self.kinds.len())
            .filter(|id| self.is_subtype(*id, a) && self.is_subtype(*id, b))
            .collect();
        let highest: Vec<KindId> = common
            .iter()
            .copied()
            .filter(|candidate| {
                !common
                    .iter()
                    .any(|other| other != candidate && self.is_subtype(*candidate, *other))
            })
            .collect();
        match highest.as_slice() {
            [single] => Ok(*single),
            _ => Err(TypeSystemError::NonUniqueGlb(
                self.kinds[a].name.clone(),
                self.kinds[b].name.clone(),
            )),
        }
    }

    pub(crate) fn is_subtype(&self, sub: KindId, sup: KindId) -> bool {
        self.kinds[sub].supertypes.contains(&sup)
    }

    pub(crate) fn lub(&self, a: KindId, b: KindId) -> Option<KindId> {
        self.lubs.get(&(a, b)).copied()
    }

    pub(crate) fn glb(&self, a: KindId, b: KindId) -> Option<KindId> {
        self.glbs.get(&(a, b)).copied()
    }

    pub(crate) fn kind(&self, id: KindId) -> &QualifierKind {
        &self.kinds[id]
    }

    pub(crate) fn kinds(&self) -> impl Iterator<Item = (KindId, &QualifierKind)> {
        self.kinds.iter().enumerate()
    }

    pub(crate) fn by_name(&self, name: &str) -> Option<KindId> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn tops(&self) -> &[KindId] {
        &self.tops
    }

    pub(crate) fn bottom_of(&self, top: KindId) -> KindId {
        self.bottoms[&top]
    }
}

fn transitive_closure(
    direct: &[BTreeSet<KindId>],
    decls: &[QualifierDecl],
) -> Result<Vec<BTreeSet<KindId>>, TypeSystemError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit(
        id: KindId,
        direct: &[BTreeSet<KindId>],
        decls: &[QualifierDecl],
        marks: &mut [Mark],
        closure: &mut [BTreeSet<KindId>],
    ) -> Result<(), TypeSystemError> {
        match marks[id] {
            Mark::Done => return Ok(()),
            Mark::InProgress => return Err(TypeSystemError::Cycle(decls[id].name.clone())),
            Mark::Unvisited => {}
        }
        marks[id] = Mark::InProgress;
        let mut supers = BTreeSet::from([id]);
        for &parent in &direct[id] {
            visit(parent, direct, decls, marks, closure)?;
            supers.extend(closure[parent].iter().copied());
        }
        closure[id] = supers;
        marks[id] = Mark::Done;
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; direct.len()];
    let mut closure = vec![BTreeSet::new(); direct.len()];
    for id in 0..direct.len() {
        visit(id, direct, decls, &mut marks, &mut closure)?;
    }
    Ok(closure)
}

fn join_names(decls: &[QualifierDecl], ids: &[KindId]) -> String {
    ids.iter()
        .map(|id| decls[*id].name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Qualifier-level lattice operations, including structured arguments.
#[derive(Clone, Debug)]
pub(crate) struct QualifierHierarchy {
    kinds: QualifierKindHierarchy,
}

impl QualifierHierarchy {
    pub(crate) fn new(decls: &[QualifierDecl]) -> Result<Self, TypeSystemError> {
        Ok(Self {
            kinds: QualifierKindHierarchy::new(decls)?,
        })
    }

    pub(crate) fn kinds(&self) -> &QualifierKindHierarchy {
        &self.kinds
    }

    /// Plain qualifier of the named kind.
    pub(crate) fn qualifier(&self, name: &str) -> Result<Qualifier, TypeSystemError> {
        let kind = self
            .kinds
            .by_name(name)
            .ok_or_else(|| TypeSystemError::UnknownQualifier(name.to_string()))?;
        Ok(self.of_kind(kind))
    }

    pub(crate) fn of_kind(&self, kind: KindId) -> Qualifier {
        self.with_args(kind, BTreeSet::new())
    }

    pub(crate) fn with_args(&self, kind: KindId, args: BTreeSet<QualifierArg>) -> Qualifier {
        let info = self.kinds.kind(kind);
        Qualifier {
            kind,
            top: info.top,
            name: info.name.clone(),
            args,
        }
    }

    pub(crate) fn tops(&self) -> Vec<Qualifier> {
        self.kinds
            .tops()
            .iter()
            .map(|top| self.of_kind(*top))
            .collect()
    }

    pub(crate) fn top_set(&self) -> QualifierSet {
        self.tops().into_iter().collect()
    }

    pub(crate) fn bottom_set(&self) -> QualifierSet {
        self.kinds
            .tops()
            .iter()
            .map(|top| self.of_kind(self.kinds.bottom_of(*top)))
            .collect()
    }

    pub(crate) fn top(&self, qualifier: &Qualifier) -> Qualifier {
        self.of_kind(qualifier.top)
    }

    pub(crate) fn bottom(&self, qualifier: &Qualifier) -> Qualifier {
        self.of_kind(self.kinds.bottom_of(qualifier.top))
    }

    pub(crate) fn top_of(&self, top: KindId) -> Qualifier {
        self.of_kind(top)
    }

    pub(crate) fn bottom_of(&self, top: KindId) -> Qualifier {
        self.of_kind(self.kinds.bottom_of(top))
    }

    pub(crate) fn is_top(&self, qualifier: &Qualifier) -> bool {
        qualifier.kind == qualifier.top
    }

    pub(crate) fn is_bottom(&self, qualifier: &Qualifier) -> bool {
        qualifier.kind == self.kinds.bottom_of(qualifier.top)
    }

    /// Subtyping; qualifiers of different hierarchies are never related.
    pub(crate) fn is_subtype(&self, sub: &Qualifier, sup: &Qualifier) -> bool {
        if !sub.same_hierarchy(sup) {
            return false;
        }
        if sub.kind == sup.kind {
            let info = self.kinds.kind(sub.kind);
            if !info.is_structured() {
                return true;
            }
            return match info.argument_order {
                ArgumentOrder::Subset => sub.args.is_subset(&sup.args),
                ArgumentOrder::Superset => sub.args.is_superset(&sup.args),
            };
        }
        self.kinds.is_subtype(sub.kind, sup.kind)
    }

    pub(crate) fn least_upper_bound(
        &self,
        a: &Qualifier,
        b: &Qualifier,
    ) -> Result<Qualifier, TypeSystemError> {
        self.check_same_hierarchy(a, b)?;
        if a.kind == b.kind && self.kinds.kind(a.kind).is_structured() {
            let info = self.kinds.kind(a.kind);
            let args: BTreeSet<QualifierArg> = match info.argument_order {
                ArgumentOrder::Subset => a.args.union(&b.args).cloned().collect(),
                ArgumentOrder::Superset => a.args.intersection(&b.args).cloned().collect(),
            };
            let over_cap = info.max_arguments.is_some_and(|max| args.len() > max);
            if (args.is_empty() && info.argument_order == ArgumentOrder::Superset) || over_cap {
                return Ok(self.top(a));
            }
            return Ok(self.with_args(a.kind, args));
        }
        if self.is_subtype(a, b) {
            return Ok(b.clone());
        }
        if self.is_subtype(b, a) {
            return Ok(a.clone());
        }
        let kind = self
            .kinds
            .lub(a.kind, b.kind)
            .ok_or_else(|| TypeSystemError::NonUniqueLub(a.name.clone(), b.name.clone()))?;
        Ok(self.resolve_mixed(kind, a, b, || self.top(a)))
    }

    pub(crate) fn greatest_lower_bound(
        &self,
        a: &Qualifier,
        b: &Qualifier,
    ) -> Result<Qualifier, TypeSystemError> {
        self.check_same_hierarchy(a, b)?;
        if a.kind == b.kind && self.kinds.kind(a.kind).is_structured() {
            let info = self.kinds.kind(a.kind);
            let args: BTreeSet<QualifierArg> = match info.argument_order {
                ArgumentOrder::Subset => a.args.intersection(&b.args).cloned().collect(),
                ArgumentOrder::Superset => a.args.union(&b.args).cloned().collect(),
            };
            if args.is_empty() && info.argument_order == ArgumentOrder::Subset {
                return Ok(self.bottom(a));
            }
            return Ok(self.with_args(a.kind, args));
        }
        if self.is_subtype(a, b) {
            return Ok(a.clone());
        }
        if self.is_subtype(b, a) {
            return Ok(b.clone());
        }
        let kind = self
            .kinds
            .glb(a.kind, b.kind)
            .ok_or_else(|| TypeSystemError::NonUniqueGlb(a.name.clone(), b.name.clone()))?;
        Ok(self.resolve_mixed(kind, a, b, || self.bottom(a)))
    }

    /// Upper bound used at loop heads once a block has been revisited often enough.
    pub(crate) fn widened_upper_bound(
        &self,
        previous: &Qualifier,
        next: &Qualifier,
    ) -> Result<Qualifier, TypeSystemError> {
        self.check_same_hierarchy(previous, next)?;
        if previous.kind == next.kind
            && self.kinds.kind(previous.kind).is_structured()
            && previous.args != next.args
        {
            return Ok(self.top(previous));
        }
        self.least_upper_bound(previous, next)
    }

    fn resolve_mixed(
        &self,
        kind: KindId,
        a: &Qualifier,
        b: &Qualifier,
        fallback: impl FnOnce() -> Qualifier,
    ) -> Qualifier {
        if kind == a.kind {
            return a.clone();
        }
        if kind == b.kind {
            return b.clone();
        }
        if self.kinds.kind(kind).is_structured() {
            return fallback();
        }
        self.of_kind(kind)
    }

    fn check_same_hierarchy(&self, a: &Qualifier, b: &Qualifier) -> Result<(), TypeSystemError> {
        if a.same_hierarchy(b) {
            Ok(())
        } else {
            Err(TypeSystemError::CrossHierarchy(a.to_string(), b.to_string()))
        }
    }

    /// Per-hierarchy subtyping; hierarchies missing on either side are not compared.
    pub(crate) fn is_subtype_set(&self, sub: &QualifierSet, sup: &QualifierSet) -> bool {
        sub.iter().all(|qualifier| match sup.get(qualifier.top) {
            Some(other) => self.is_subtype(qualifier, other),
            None => true,
        })
    }

    /// Per-hierarchy lub; a hierarchy present on one side only is dropped.
    pub(crate) fn lub_set(
        &self,
        a: &QualifierSet,
        b: &QualifierSet,
    ) -> Result<QualifierSet, TypeSystemError> {
        let mut out = QualifierSet::new();
        for qualifier in a.iter() {
            if let Some(other) = b.get(qualifier.top) {
                out.replace(self.least_upper_bound(qualifier, other)?);
            }
        }
        Ok(out)
    }

    /// Per-hierarchy glb; a hierarchy present on one side only is kept.
    pub(crate) fn glb_set(
        &self,
        a: &QualifierSet,
        b: &QualifierSet,
    ) -> Result<QualifierSet, TypeSystemError> {
        let mut out = a.clone();
        for qualifier in b.iter() {
            let merged = match a.get(qualifier.top) {
                Some(other) => self.greatest_lower_bound(other, qualifier)?,
                None => qualifier.clone(),
            };
            out.replace(merged);
        }
        Ok(out)
    }

    pub(crate) fn widened_set(
        &self,
        previous: &QualifierSet,
        next: &QualifierSet,
    ) -> Result<QualifierSet, TypeSystemError> {
        let mut out = QualifierSet::new();
        for qualifier in previous.iter() {
            if let Some(other) = next.get(qualifier.top) {
                out.replace(self.widened_upper_bound(qualifier, other)?);
            }
        }
        Ok(out)
    }
}
