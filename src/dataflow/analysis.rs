use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, bail};

use crate::dataflow::cfg::{BlockId, ControlFlowGraph, ENTRY, EXIT, Node, Terminator};
use crate::ir::{Expr, ExprId, Span};

/// Store flowing into a node: one store, or one per outcome of a boolean.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum TransferInput<S> {
    Regular(S),
    Conditional { then_store: S, else_store: S },
}

impl<S: Clone> TransferInput<S> {
    pub(crate) fn then_store(&self) -> &S {
        match self {
            TransferInput::Regular(store) => store,
            TransferInput::Conditional { then_store, .. } => then_store,
        }
    }

    pub(crate) fn else_store(&self) -> &S {
        match self {
            TransferInput::Regular(store) => store,
            TransferInput::Conditional { else_store, .. } => else_store,
        }
    }

    /// Collapse a conditional pair with `merge`.
    pub(crate) fn into_regular(self, merge: impl Fn(&S, &S) -> Result<S>) -> Result<S> {
        match self {
            TransferInput::Regular(store) => Ok(store),
            TransferInput::Conditional {
                then_store,
                else_store,
            } => merge(&then_store, &else_store),
        }
    }

    pub(crate) fn swap(self) -> Self {
        match self {
            TransferInput::Regular(store) => TransferInput::Regular(store),
            TransferInput::Conditional {
                then_store,
                else_store,
            } => TransferInput::Conditional {
                then_store: else_store,
                else_store: then_store,
            },
        }
    }
}

/// Outcome of visiting one node.
pub(crate) struct TransferResult<S, V> {
    pub(crate) value: Option<V>,
    pub(crate) output: TransferInput<S>,
    /// Store handed to the block's catch successors, for nodes that may throw.
    pub(crate) exceptional: Option<S>,
}

impl<S, V> TransferResult<S, V> {
    pub(crate) fn regular(value: Option<V>, store: S) -> Self {
        Self {
            value,
            output: TransferInput::Regular(store),
            exceptional: None,
        }
    }
}

/// Domain callbacks required by the fixed-point engine.
pub(crate) trait TransferFunction<'a> {
    type Store: Clone + PartialEq;
    type Value: Clone;

    fn initial_store(&self) -> Result<Self::Store>;

    fn visit_node(
        &self,
        node: &Node<'a>,
        input: TransferInput<Self::Store>,
        values: &BTreeMap<ExprId, Self::Value>,
    ) -> Result<TransferResult<Self::Store, Self::Value>>;

    fn merge(&self, left: &Self::Store, right: &Self::Store) -> Result<Self::Store>;

    fn widen(&self, previous: &Self::Store, next: &Self::Store) -> Result<Self::Store>;

    /// Whether the input store of `node` is kept for later inspection.
    fn records_store_before(&self, _node: &Node<'a>) -> bool {
        false
    }
}

/// One `return` statement and the store that reaches it.
#[derive(Clone, Debug)]
pub(crate) struct ReturnSite<'a, S> {
    pub(crate) value: Option<&'a Expr>,
    pub(crate) span: Span,
    pub(crate) input: TransferInput<S>,
}

/// Fixed point of one method.
#[derive(Clone, Debug)]
pub(crate) struct AnalysisResult<'a, S, V> {
    pub(crate) values: BTreeMap<ExprId, V>,
    pub(crate) stores_before: BTreeMap<ExprId, S>,
    pub(crate) return_sites: Vec<ReturnSite<'a, S>>,
    /// `None` when the method never completes normally.
    pub(crate) exit_store: Option<S>,
}

impl<S, V> AnalysisResult<'_, S, V> {
    pub(crate) fn value(&self, id: ExprId) -> Option<&V> {
        self.values.get(&id)
    }

    pub(crate) fn store_before(&self, id: ExprId) -> Option<&S> {
        self.stores_before.get(&id)
    }
}

/// Limits guarding termination.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AnalysisLimits {
    pub(crate) widen_after: usize,
    pub(crate) max_block_visits: usize,
}

/// Forward fixed point over `cfg`, blocks ordered by reverse post-order.
pub(crate) fn analyze<'a, T>(
    cfg: &ControlFlowGraph<'a>,
    transfer: &T,
    limits: AnalysisLimits,
) -> Result<AnalysisResult<'a, T::Store, T::Value>>
where
    T: TransferFunction<'a>,
{
    let order = cfg.reverse_post_order();
    let rank: BTreeMap<BlockId, usize> = order
        .iter()
        .enumerate()
        .map(|(index, block)| (*block, index))
        .collect();

    let mut engine = Engine {
        rank: &rank,
        limits,
        inputs: BTreeMap::new(),
        visits: BTreeMap::new(),
        worklist: BTreeSet::new(),
    };
    engine
        .inputs
        .insert((ENTRY, Edge::Normal), transfer.initial_store()?);
    engine.worklist.insert((0, ENTRY));

    let mut values = BTreeMap::new();
    let mut stores_before = BTreeMap::new();
    let mut return_sites: BTreeMap<BlockId, ReturnSite<'a, T::Store>> = BTreeMap::new();
    let mut exit_store = None;

    while let Some((_, block_id)) = engine.worklist.pop_first() {
        let visits = engine.visits.entry(block_id).or_insert(0);
        *visits += 1;
        if *visits > limits.max_block_visits {
            bail!(
                "dataflow did not converge: block {block_id} visited more than {} times",
                limits.max_block_visits
            );
        }
        let Some(mut input) = engine.block_input(block_id) else {
            continue;
        };
        let block = &cfg.blocks[block_id];

        for node in &block.nodes {
            if transfer.records_store_before(node) {
                if let Some(expr) = node.expr() {
                    let store = input.clone().into_regular(|a, b| transfer.merge(a, b))?;
                    stores_before.insert(expr.id, store);
                }
            }
            let result = transfer.visit_node(node, input, &values)?;
            if let (Some(value), Some(expr)) = (result.value, node.expr()) {
                values.insert(expr.id, value);
            }
            if let Some(exceptional) = result.exceptional {
                for target in &block.exceptional {
                    engine.propagate(transfer, *target, Edge::Normal, &exceptional)?;
                }
            }
            input = result.output;
        }

        match block.terminator {
            Terminator::Goto(target) => {
                let store = input.into_regular(|a, b| transfer.merge(a, b))?;
                engine.propagate(transfer, target, Edge::Normal, &store)?;
            }
            Terminator::If {
                then_target,
                else_target,
                ..
            } => {
                engine.propagate(transfer, then_target, Edge::Normal, input.then_store())?;
                engine.propagate(transfer, else_target, Edge::Normal, input.else_store())?;
            }
            Terminator::Outcome { target, outcome } => {
                let store = input.into_regular(|a, b| transfer.merge(a, b))?;
                let edge = if outcome { Edge::WhenTrue } else { Edge::WhenFalse };
                engine.propagate(transfer, target, edge, &store)?;
            }
            Terminator::Return { value, span } => {
                let store = input.clone().into_regular(|a, b| transfer.merge(a, b))?;
                return_sites.insert(block_id, ReturnSite { value, span, input });
                engine.propagate(transfer, EXIT, Edge::Normal, &store)?;
            }
            Terminator::Throw => {
                let store = input.into_regular(|a, b| transfer.merge(a, b))?;
                for target in &block.exceptional {
                    engine.propagate(transfer, *target, Edge::Normal, &store)?;
                }
            }
            Terminator::Exit => {
                exit_store = Some(input.into_regular(|a, b| transfer.merge(a, b))?);
            }
        }
    }

    Ok(AnalysisResult {
        values,
        stores_before,
        return_sites: return_sites.into_values().collect(),
        exit_store,
    })
}

/// Which part of a block's input an edge feeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Edge {
    Normal,
    WhenTrue,
    WhenFalse,
}

struct Engine<'r, S> {
    rank: &'r BTreeMap<BlockId, usize>,
    limits: AnalysisLimits,
    inputs: BTreeMap<(BlockId, Edge), S>,
    visits: BTreeMap<BlockId, usize>,
    worklist: BTreeSet<(usize, BlockId)>,
}

impl<S: Clone + PartialEq> Engine<'_, S> {
    /// Input of `block`; conditional when it is only reached through outcome edges.
    fn block_input(&self, block: BlockId) -> Option<TransferInput<S>> {
        if let Some(store) = self.inputs.get(&(block, Edge::Normal)) {
            return Some(TransferInput::Regular(store.clone()));
        }
        // A half whose edge has not been taken yet mirrors the other one.
        let (then_store, else_store) = match (
            self.inputs.get(&(block, Edge::WhenTrue)),
            self.inputs.get(&(block, Edge::WhenFalse)),
        ) {
            (None, None) => return None,
            (Some(only), None) | (None, Some(only)) => (only, only),
            (Some(then_store), Some(else_store)) => (then_store, else_store),
        };
        Some(TransferInput::Conditional {
            then_store: then_store.clone(),
            else_store: else_store.clone(),
        })
    }

    /// Merge `store` into one input of `target` and schedule it when it changed.
    fn propagate<'a, T>(
        &mut self,
        transfer: &T,
        target: BlockId,
        edge: Edge,
        store: &S,
    ) -> Result<()>
    where
        T: TransferFunction<'a, Store = S>,
    {
        let Some(rank) = self.rank.get(&target).copied() else {
            return Ok(());
        };
        let next = match self.inputs.get(&(target, edge)) {
            None => store.clone(),
            Some(previous) => {
                let merged = transfer.merge(previous, store)?;
                let visits = self.visits.get(&target).copied().unwrap_or(0);
                let merged = if visits >= self.limits.widen_after {
                    transfer.widen(previous, &merged)?
                } else {
                    merged
                };
                if &merged == previous {
                    return Ok(());
                }
                merged
            }
        };
        self.inputs.insert((target, edge), next);
        self.worklist.insert((rank, target));
        Ok(())
    }
}
