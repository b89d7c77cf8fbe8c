use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use tracing::debug;

use crate::dataflow::analysis::{
    AnalysisLimits, AnalysisResult, TransferFunction, TransferInput, TransferResult, analyze,
};
use crate::dataflow::cfg::{ControlFlowGraph, Node};
use crate::dataflow::expression::FlowExpr;
use crate::dataflow::store::{SideEffects, Store};
use crate::factory::{AnnotatedTypeFactory, MethodScope, MethodSignature};
use crate::hierarchy::QualifierHierarchy;
use crate::ir::{BinaryOp, ContractKind, Expr, ExprId, ExprKind, Method, UnaryOp};
use crate::qualifier::QualifierSet;

/// Flow facts of one analyzed method.
pub(crate) type FlowResult<'a> = AnalysisResult<'a, Store, QualifierSet>;

/// Refined qualifiers of already evaluated expressions.
pub(crate) trait FlowValues {
    fn value(&self, id: ExprId) -> Option<&QualifierSet>;
}

impl FlowValues for BTreeMap<ExprId, QualifierSet> {
    fn value(&self, id: ExprId) -> Option<&QualifierSet> {
        self.get(&id)
    }
}

impl FlowValues for FlowResult<'_> {
    fn value(&self, id: ExprId) -> Option<&QualifierSet> {
        self.values.get(&id)
    }
}

/// Run the qualifier dataflow over `method`.
pub(crate) fn analyze_method<'a>(
    factory: &AnnotatedTypeFactory<'_>,
    scope: &MethodScope<'_>,
    method: &'a Method,
) -> Result<FlowResult<'a>> {
    let cfg = ControlFlowGraph::build(method);
    let transfer = QualifierTransfer::new(factory, scope);
    let limits = AnalysisLimits {
        widen_after: factory.options.widen_after,
        max_block_visits: factory.options.max_block_visits,
    };
    let result = analyze(&cfg, &transfer, limits)?;
    debug!(
        method = method.name.as_str(),
        blocks = cfg.blocks.len(),
        values = result.values.len(),
        "analyzed method"
    );
    Ok(result)
}

/// Generic transfer function parameterised by the type system's rules.
pub(crate) struct QualifierTransfer<'f, 'c> {
    factory: &'f AnnotatedTypeFactory<'c>,
    scope: &'f MethodScope<'c>,
    final_locals: BTreeSet<String>,
}

impl<'f, 'c> QualifierTransfer<'f, 'c> {
    pub(crate) fn new(factory: &'f AnnotatedTypeFactory<'c>, scope: &'f MethodScope<'c>) -> Self {
        Self {
            factory,
            scope,
            final_locals: scope.final_locals(),
        }
    }

    fn hierarchy(&self) -> &QualifierHierarchy {
        &self.factory.system.hierarchy
    }

    fn regular(&self, input: TransferInput<Store>) -> Result<Store> {
        input.into_regular(|left, right| self.merge_stores(left, right))
    }

    fn merge_stores(&self, left: &Store, right: &Store) -> Result<Store> {
        Ok(left.lub(self.hierarchy(), right)?)
    }

    /// Qualifiers of `expr` from its declaration and its operands' values.
    fn computed(&self, expr: &Expr, values: &BTreeMap<ExprId, QualifierSet>) -> Result<QualifierSet> {
        Ok(self
            .factory
            .unrefined_type(expr, self.scope, Some(values as &dyn FlowValues))?
            .effective_qualifiers())
    }

    fn operand(&self, expr: &Expr, values: &BTreeMap<ExprId, QualifierSet>) -> Result<QualifierSet> {
        match values.get(&expr.id) {
            Some(value) => Ok(value.clone()),
            None => self.computed(expr, values),
        }
    }

    fn declared_of(&self, expr: &FlowExpr) -> Option<QualifierSet> {
        self.factory
            .declared_type_of(expr, self.scope)
            .map(|ty| ty.effective_qualifiers())
    }

    /// Store key for `expr`, if its value can be tracked at all.
    ///
    /// Calls are only tracked when every invoked method is deterministic.
    fn trackable(&self, expr: &Expr) -> Option<FlowExpr> {
        let flow = FlowExpr::from_tree(expr)?;
        if matches!(flow, FlowExpr::Literal(_) | FlowExpr::ClassName(_)) {
            return None;
        }
        self.only_deterministic_calls(expr).then_some(flow)
    }

    fn only_deterministic_calls(&self, expr: &Expr) -> bool {
        if matches!(expr.kind, ExprKind::Call { .. }) {
            let deterministic = self
                .factory
                .method_signature(expr, self.scope, None)
                .ok()
                .flatten()
                .is_some_and(|signature| signature.method.purity.is_deterministic());
            if !deterministic {
                return false;
            }
        }
        expr.children()
            .into_iter()
            .all(|child| self.only_deterministic_calls(child))
    }

    /// A dereferenced receiver is refined by the type system's rules.
    fn refine_receiver(&self, expr: &Expr, store: &mut Store, values: &BTreeMap<ExprId, QualifierSet>) -> Result<()> {
        let receiver = match &expr.kind {
            ExprKind::Field {
                receiver: Some(receiver),
                ..
            }
            | ExprKind::Call {
                receiver: Some(receiver),
                ..
            } => receiver.as_ref(),
            ExprKind::ArrayAccess { array, .. } => array.as_ref(),
            _ => return Ok(()),
        };
        let Some(key) = self.trackable(receiver) else {
            return Ok(());
        };
        let current = self.operand(receiver, values)?;
        if let Some(refined) = self
            .factory
            .system
            .rules
            .refine_dereference(self.hierarchy(), &current)
        {
            store.replace(key, refined);
        }
        Ok(())
    }

    fn apply_fact(&self, store: &mut Store, target: FlowExpr, qualifiers: &QualifierSet) -> Result<()> {
        let fallback = self.declared_of(&target);
        store.refine(self.hierarchy(), target, qualifiers, fallback.as_ref())?;
        Ok(())
    }

    fn visit_read(
        &self,
        expr: &Expr,
        input: TransferInput<Store>,
        values: &BTreeMap<ExprId, QualifierSet>,
    ) -> Result<TransferResult<Store, QualifierSet>> {
        let mut store = self.regular(input)?;
        let declared = self.computed(expr, values)?;
        let value = match self.trackable(expr).and_then(|key| store.get(&key).cloned()) {
            Some(known) => self.hierarchy().glb_set(&known, &declared)?,
            None => declared,
        };
        self.refine_receiver(expr, &mut store, values)?;
        Ok(TransferResult::regular(Some(value), store))
    }

    fn visit_assignment(
        &self,
        target: &Expr,
        assigned: &Expr,
        input: TransferInput<Store>,
        values: &BTreeMap<ExprId, QualifierSet>,
    ) -> Result<TransferResult<Store, QualifierSet>> {
        let mut store = self.regular(input)?;
        let value = self.operand(assigned, values)?;
        if let Some(key) = FlowExpr::from_tree(target) {
            store.update_for_assignment(&key, Some(value.clone()));
        }
        self.refine_receiver(target, &mut store, values)?;
        Ok(TransferResult::regular(Some(value), store))
    }

    fn visit_equality(
        &self,
        expr: &Expr,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        input: TransferInput<Store>,
        values: &BTreeMap<ExprId, QualifierSet>,
    ) -> Result<TransferResult<Store, QualifierSet>> {
        let store = self.regular(input)?;
        let value = self.computed(expr, values)?;
        let left_value = self.operand(left, values)?;
        let right_value = self.operand(right, values)?;
        let rules = &self.factory.system.rules;

        let meet = self.hierarchy().glb_set(&left_value, &right_value)?;
        let mut equal = store.clone();
        let mut unequal = store;
        for (operand, operand_value, other) in [
            (left, &left_value, right),
            (right, &right_value, left),
        ] {
            let Some(key) = self.trackable(operand) else {
                continue;
            };
            equal.replace(key.clone(), meet.clone());
            if let Some(refined) = rules.refine_not_equal(self.hierarchy(), operand_value, other) {
                unequal.replace(key, refined);
            }
        }
        let output = match op {
            BinaryOp::Eq => TransferInput::Conditional {
                then_store: equal,
                else_store: unequal,
            },
            _ => TransferInput::Conditional {
                then_store: unequal,
                else_store: equal,
            },
        };
        Ok(TransferResult {
            value: Some(value),
            output,
            exceptional: None,
        })
    }

    fn visit_comparison(
        &self,
        expr: &Expr,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        input: TransferInput<Store>,
        values: &BTreeMap<ExprId, QualifierSet>,
    ) -> Result<TransferResult<Store, QualifierSet>> {
        let store = self.regular(input)?;
        let value = self.computed(expr, values)?;
        let left_key = self.trackable(left);
        let right_key = self.trackable(right);
        let refinement = self.factory.system.rules.refine_comparison(
            self.hierarchy(),
            op,
            left_key.as_ref(),
            right_key.as_ref(),
        );
        if refinement.is_empty() {
            return Ok(TransferResult::regular(Some(value), store));
        }
        let mut then_store = store.clone();
        for (target, qualifiers) in refinement.then_facts {
            self.apply_fact(&mut then_store, target, &qualifiers)?;
        }
        let mut else_store = store;
        for (target, qualifiers) in refinement.else_facts {
            self.apply_fact(&mut else_store, target, &qualifiers)?;
        }
        Ok(TransferResult {
            value: Some(value),
            output: TransferInput::Conditional {
                then_store,
                else_store,
            },
            exceptional: None,
        })
    }

    fn visit_instanceof(
        &self,
        expr: &Expr,
        operand: &Expr,
        input: TransferInput<Store>,
        values: &BTreeMap<ExprId, QualifierSet>,
    ) -> Result<TransferResult<Store, QualifierSet>> {
        let store = self.regular(input)?;
        let value = self.computed(expr, values)?;
        let operand_value = self.operand(operand, values)?;
        let refined = self
            .factory
            .system
            .rules
            .refine_instanceof(self.hierarchy(), &operand_value);
        let (Some(key), Some(refined)) = (self.trackable(operand), refined) else {
            return Ok(TransferResult::regular(Some(value), store));
        };
        let mut then_store = store.clone();
        then_store.replace(key, refined);
        Ok(TransferResult {
            value: Some(value),
            output: TransferInput::Conditional {
                then_store,
                else_store: store,
            },
            exceptional: None,
        })
    }

    fn visit_invocation(
        &self,
        expr: &Expr,
        input: TransferInput<Store>,
        values: &BTreeMap<ExprId, QualifierSet>,
    ) -> Result<TransferResult<Store, QualifierSet>> {
        let mut store = self.regular(input)?;
        self.refine_receiver(expr, &mut store, values)?;
        let signature = self
            .factory
            .method_signature(expr, self.scope, Some(values as &dyn FlowValues))?;
        let declared = match (&expr.kind, signature.as_ref()) {
            (ExprKind::Call { .. }, Some(signature)) => signature.return_type.effective_qualifiers(),
            _ => self.computed(expr, values)?,
        };
        let key = self.trackable(expr);
        let value = match key.as_ref().and_then(|key| store.get(key)) {
            Some(known) => self.hierarchy().glb_set(known, &declared)?,
            None => declared,
        };

        let side_effect_free = self.factory.options.assume_side_effect_free
            || signature
                .as_ref()
                .is_some_and(|signature| signature.method.purity.is_side_effect_free());
        if !side_effect_free {
            let is_final_field = |receiver: &FlowExpr, name: &str| {
                self.factory.is_final_field(receiver, name, self.scope)
            };
            store.update_for_method_call(&SideEffects {
                is_final_field: &is_final_field,
                unrefine_aliases: self.factory.options.side_effects_unrefine_aliases,
                final_locals: &self.final_locals,
            });
        }
        let exceptional = Some(store.clone());
        if let Some(key) = key {
            store.replace(key, value.clone());
        }

        let Some(signature) = signature else {
            return Ok(TransferResult {
                value: Some(value),
                output: TransferInput::Regular(store),
                exceptional,
            });
        };
        let mut when_true = Vec::new();
        let mut when_false = Vec::new();
        for (kind, target, qualifiers) in self.adapted_postconditions(&signature) {
            match kind {
                ContractKind::Postcondition => self.apply_fact(&mut store, target, &qualifiers)?,
                ContractKind::ConditionalPostcondition { result: true } => {
                    when_true.push((target, qualifiers))
                }
                ContractKind::ConditionalPostcondition { result: false } => {
                    when_false.push((target, qualifiers))
                }
                ContractKind::Precondition => {}
            }
        }
        let output = if when_true.is_empty() && when_false.is_empty() {
            TransferInput::Regular(store)
        } else {
            let mut then_store = store.clone();
            for (target, qualifiers) in when_true {
                self.apply_fact(&mut then_store, target, &qualifiers)?;
            }
            let mut else_store = store;
            for (target, qualifiers) in when_false {
                self.apply_fact(&mut else_store, target, &qualifiers)?;
            }
            TransferInput::Conditional {
                then_store,
                else_store,
            }
        };
        Ok(TransferResult {
            value: Some(value),
            output,
            exceptional,
        })
    }

    /// Postconditions of the callee, rewritten to the call site.
    fn adapted_postconditions(
        &self,
        signature: &MethodSignature<'_>,
    ) -> Vec<(ContractKind, FlowExpr, QualifierSet)> {
        let adapt = |expr: &FlowExpr| expr.viewpoint_adapt(&signature.receiver_expr, &signature.arg_exprs);
        self.factory
            .contracts(signature.owner, signature.method)
            .into_iter()
            .filter(|contract| !matches!(contract.kind, ContractKind::Precondition))
            .map(|contract| {
                let qualifier = contract.qualifier.map_exprs(&adapt);
                (
                    contract.kind,
                    adapt(&contract.target),
                    QualifierSet::single(qualifier),
                )
            })
            .collect()
    }
}

impl<'n> TransferFunction<'n> for QualifierTransfer<'_, '_> {
    type Store = Store;
    type Value = QualifierSet;

    /// Parameters, `this` and the method's preconditions.
    fn initial_store(&self) -> Result<Store> {
        let mut store = Store::new();
        let Some(method) = self.scope.method else {
            return Ok(store);
        };
        for param in &method.params {
            if let Some(ty) = self.factory.variable_type(self.scope, &param.name) {
                store.replace(FlowExpr::Local(param.name.clone()), ty.effective_qualifiers());
            }
        }
        if !method.is_static {
            store.replace(
                FlowExpr::This,
                self.factory.this_type(self.scope).effective_qualifiers(),
            );
        }
        let params = self.scope.param_exprs();
        for contract in self.factory.contracts(self.scope.class, method) {
            if !matches!(contract.kind, ContractKind::Precondition) {
                continue;
            }
            let adapt = |expr: &FlowExpr| expr.viewpoint_adapt(&FlowExpr::This, &params);
            let qualifier = contract.qualifier.map_exprs(&adapt);
            self.apply_fact(
                &mut store,
                adapt(&contract.target),
                &QualifierSet::single(qualifier),
            )?;
        }
        Ok(store)
    }

    fn visit_node(
        &self,
        node: &Node<'n>,
        input: TransferInput<Store>,
        values: &BTreeMap<ExprId, QualifierSet>,
    ) -> Result<TransferResult<Store, QualifierSet>> {
        let expr = match node {
            Node::LocalDecl { name, init, .. } => {
                let mut store = self.regular(input)?;
                let value = match init {
                    Some(init) => Some(self.operand(init, values)?),
                    None => None,
                };
                store.update_for_assignment(&FlowExpr::Local(name.to_string()), value);
                return Ok(TransferResult::regular(None, store));
            }
            Node::Expr(expr) => *expr,
        };
        match &expr.kind {
            ExprKind::Local(_)
            | ExprKind::This
            | ExprKind::Field { .. }
            | ExprKind::ArrayAccess { .. } => self.visit_read(expr, input, values),
            ExprKind::Assign { target, value } => {
                self.visit_assignment(target, value, input, values)
            }
            ExprKind::Binary { op, left, right } if matches!(op, BinaryOp::Eq | BinaryOp::Ne) => {
                self.visit_equality(expr, *op, left, right, input, values)
            }
            ExprKind::Binary { op, left, right }
                if matches!(op, BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge) =>
            {
                self.visit_comparison(expr, *op, left, right, input, values)
            }
            ExprKind::InstanceOf { expr: operand, .. } => {
                self.visit_instanceof(expr, operand, input, values)
            }
            ExprKind::Call { .. } | ExprKind::New { .. } => {
                self.visit_invocation(expr, input, values)
            }
            ExprKind::Unary {
                op: UnaryOp::Not, ..
            } => {
                let value = self.computed(expr, values)?;
                Ok(TransferResult {
                    value: Some(value),
                    output: input.swap(),
                    exceptional: None,
                })
            }
            ExprKind::Binary { op, .. } if op.is_logical() => {
                let value = self.computed(expr, values)?;
                Ok(TransferResult {
                    value: Some(value),
                    output: input,
                    exceptional: None,
                })
            }
            _ => {
                let store = self.regular(input)?;
                let value = self.computed(expr, values)?;
                Ok(TransferResult::regular(Some(value), store))
            }
        }
    }

    fn merge(&self, left: &Store, right: &Store) -> Result<Store> {
        self.merge_stores(left, right)
    }

    fn widen(&self, previous: &Store, next: &Store) -> Result<Store> {
        Ok(previous.widen(self.hierarchy(), next)?)
    }

    fn records_store_before(&self, node: &Node<'n>) -> bool {
        node.expr()
            .is_some_and(|expr| matches!(expr.kind, ExprKind::Call { .. } | ExprKind::New { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkers::builtin;
    use crate::ir::{CompilationUnit, Contract, Purity};
    use crate::options::CheckerOptions;
    use crate::test_harness::*;
    use crate::type_system::TypeSystem;

    fn nullness() -> TypeSystem {
        builtin("nullness").expect("nullness")
    }

    fn holder(methods: Vec<Method>) -> Vec<CompilationUnit> {
        let mut class = class("Holder").with_field(field("cache", declared_with("String", &["Nullable"])));
        for method in methods {
            class = class.method(method);
        }
        let mut units = vec![unit("Holder.java", vec![class])];
        number(&mut units);
        units
    }

    fn store_before_call(units: &[CompilationUnit], system: &TypeSystem, options: &CheckerOptions, callee: &str) -> Store {
        let factory = AnnotatedTypeFactory::new(system, units, &[], options);
        let class = &units[0].classes[0];
        let method = class
            .methods
            .iter()
            .find(|method| method.name == "m")
            .expect("method m");
        let scope = MethodScope::new(class, method);
        let result = analyze_method(&factory, &scope, method).expect("analysis");
        let call = find_call(method, callee).expect("call");
        result.store_before(call.id).cloned().expect("store before call")
    }

    fn cache() -> FlowExpr {
        FlowExpr::field(FlowExpr::This, "cache")
    }

    #[test]
    fn null_check_refines_then_branch() {
        let system = nullness();
        let options = CheckerOptions::default();
        let units = holder(vec![method("m")
            .param("p", declared_with("String", &["Nullable"]))
            .body(vec![if_then(
                binary(BinaryOp::Ne, local("p"), null_lit()),
                vec![expr_stmt(call(None, "sink", vec![local("p")]))],
            )])]);

        let store = store_before_call(&units, &system, &options, "sink");

        let p = store.get(&FlowExpr::Local("p".to_string())).expect("p");
        assert_eq!(p.to_string(), "@NonNull");
    }

    #[test]
    fn impure_call_forgets_field_refinement() {
        let system = nullness();
        let options = CheckerOptions::default();
        let units = holder(vec![
            method("work"),
            method("m").body(vec![if_then(
                binary(BinaryOp::Ne, this_field("cache"), null_lit()),
                vec![
                    expr_stmt(call(None, "work", vec![])),
                    expr_stmt(call(None, "sink", vec![this_field("cache")])),
                ],
            )]),
        ]);

        let store = store_before_call(&units, &system, &options, "sink");
        assert!(store.get(&cache()).is_none());

        let options = CheckerOptions {
            assume_side_effect_free: true,
            ..CheckerOptions::default()
        };
        let store = store_before_call(&units, &system, &options, "sink");
        assert_eq!(store.get(&cache()).map(ToString::to_string).as_deref(), Some("@NonNull"));
    }

    #[test]
    fn field_finality_is_resolved_on_the_receiver_class() {
        let system = nullness();
        let options = CheckerOptions::default();
        let nullable = || declared_with("String", &["Nullable"]);
        let other = class("Other").with_field(crate::ir::Field {
            is_final: true,
            ..field("label", nullable())
        });
        let holder = class("Holder")
            .with_field(field("label", nullable()))
            .method(method("work"))
            .method(
                method("m")
                    .param("other", declared("Other"))
                    .body(vec![if_then(
                        binary(BinaryOp::Ne, this_field("label"), null_lit()),
                        vec![if_then(
                            binary(
                                BinaryOp::Ne,
                                field_access(local("other"), "label"),
                                null_lit(),
                            ),
                            vec![
                                expr_stmt(call(None, "work", vec![])),
                                expr_stmt(call(None, "sink", vec![])),
                            ],
                        )],
                    )]),
            );
        let mut units = vec![unit("Holder.java", vec![holder, other])];
        number(&mut units);

        let store = store_before_call(&units, &system, &options, "sink");

        let own_label = FlowExpr::field(FlowExpr::This, "label");
        let other_label = FlowExpr::field(FlowExpr::Local("other".to_string()), "label");
        assert!(store.get(&own_label).is_none());
        assert_eq!(
            store.get(&other_label).map(ToString::to_string).as_deref(),
            Some("@NonNull")
        );
    }

    #[test]
    fn side_effect_free_callee_keeps_refinement() {
        let system = nullness();
        let options = CheckerOptions::default();
        let units = holder(vec![
            method("peek").purity(Purity::SideEffectFree),
            method("m").body(vec![if_then(
                binary(BinaryOp::Ne, this_field("cache"), null_lit()),
                vec![
                    expr_stmt(call(None, "peek", vec![])),
                    expr_stmt(call(None, "sink", vec![this_field("cache")])),
                ],
            )]),
        ]);

        let store = store_before_call(&units, &system, &options, "sink");
        assert!(store.get(&cache()).is_some());
    }

    #[test]
    fn postcondition_refines_after_call() {
        let system = nullness();
        let options = CheckerOptions::default();
        let units = holder(vec![
            method("ensure").contract(Contract {
                kind: ContractKind::Postcondition,
                expression: "cache".to_string(),
                qualifier: crate::ir::Annotation::marker("NonNull"),
            }),
            method("m").body(vec![
                expr_stmt(call(None, "ensure", vec![])),
                expr_stmt(call(None, "sink", vec![this_field("cache")])),
            ]),
        ]);

        let store = store_before_call(&units, &system, &options, "sink");
        assert_eq!(store.get(&cache()).map(ToString::to_string).as_deref(), Some("@NonNull"));
    }

    #[test]
    fn conditional_postcondition_refines_matching_branch_only() {
        let system = nullness();
        let options = CheckerOptions::default();
        let units = holder(vec![
            method("ready").returns(primitive("boolean")).contract(Contract {
                kind: ContractKind::ConditionalPostcondition { result: true },
                expression: "cache".to_string(),
                qualifier: crate::ir::Annotation::marker("NonNull"),
            }),
            method("m").body(vec![if_else(
                call(None, "ready", vec![]),
                vec![expr_stmt(call(None, "sink", vec![this_field("cache")]))],
                vec![expr_stmt(call(None, "other", vec![this_field("cache")]))],
            )]),
        ]);

        let then_store = store_before_call(&units, &system, &options, "sink");
        assert!(then_store.get(&cache()).is_some());
        let else_store = store_before_call(&units, &system, &options, "other");
        assert!(else_store.get(&cache()).is_none());
    }

    #[test]
    fn precondition_seeds_entry_store() {
        let system = nullness();
        let options = CheckerOptions::default();
        let units = holder(vec![method("m")
            .contract(Contract {
                kind: ContractKind::Precondition,
                expression: "cache".to_string(),
                qualifier: crate::ir::Annotation::marker("NonNull"),
            })
            .body(vec![expr_stmt(call(None, "sink", vec![this_field("cache")]))])]);

        let store = store_before_call(&units, &system, &options, "sink");
        assert_eq!(store.get(&cache()).map(ToString::to_string).as_deref(), Some("@NonNull"));
    }
}
