use anyhow::{Context, Result};
use tracing::debug;

use crate::annotated_type::{AnnotatedType, TypeKind};
use crate::dataflow::expression::FlowExpr;
use crate::dataflow::store::Store;
use crate::dataflow::transfer::{FlowResult, FlowValues, analyze_method};
use crate::diagnostics::Reporter;
use crate::factory::{AnnotatedTypeFactory, MethodScope, MethodSignature};
use crate::hierarchy::QualifierHierarchy;
use crate::ir::{
    BinaryOp, Class, CompilationUnit, ContractKind, Expr, ExprKind, Literal, Method, Span, Stmt,
    StmtKind, TypeSyntax,
};
use crate::qualifier::QualifierSet;
use crate::type_hierarchy::TypeHierarchy;

/// Expression and flow facts of the body being checked.
struct Body<'b, 'a> {
    scope: &'b MethodScope<'a>,
    flow: Option<&'b FlowResult<'a>>,
}

impl Body<'_, '_> {
    fn values(&self) -> Option<&dyn FlowValues> {
        self.flow.map(|flow| flow as &dyn FlowValues)
    }
}

/// Walks classes and reports qualifier errors through a `Reporter`.
///
/// Every check recovers locally: a failed check is reported and the walk
/// continues with the next node.
pub(crate) struct TypeCheckVisitor<'v, 'a> {
    factory: &'v AnnotatedTypeFactory<'a>,
    reporter: &'v mut Reporter,
    /// Fallback position for nodes without one.
    span: Span,
}

impl<'v, 'a> TypeCheckVisitor<'v, 'a> {
    pub(crate) fn new(factory: &'v AnnotatedTypeFactory<'a>, reporter: &'v mut Reporter) -> Self {
        Self {
            factory,
            reporter,
            span: Span::default(),
        }
    }

    fn hierarchy(&self) -> &'v QualifierHierarchy {
        &self.factory.system.hierarchy
    }

    fn types(&self) -> TypeHierarchy<'v> {
        TypeHierarchy::new(self.hierarchy())
    }

    fn span_of(&self, span: Span) -> Span {
        if span.line > 0 { span } else { self.span }
    }

    fn error(&mut self, key: &str, span: Span, args: Vec<String>) {
        let span = self.span_of(span);
        self.reporter.error(key, span, args);
    }

    pub(crate) fn visit_class(&mut self, class: &'a Class) -> Result<()> {
        self.reporter.enter_class(class);
        let result = self.check_class(class);
        self.reporter.exit_class();
        result
    }

    fn check_class(&mut self, class: &'a Class) -> Result<()> {
        self.span = class.span;
        let class_scope = MethodScope::for_class(class);
        for field in &class.fields {
            self.span = field.span;
            self.report_problems(self.factory.declaration_problems(class, None, &field.ty), field.span);
            let declared = self.factory.field_type(class, field);
            self.check_type_arguments(&declared, field.span);
            if let Some(init) = field.initializer.as_ref() {
                let body = Body {
                    scope: &class_scope,
                    flow: None,
                };
                self.check_expr(init, &body)?;
                self.check_assignment(init, &declared, &body, field.span)?;
            }
        }
        for method in &class.methods {
            self.reporter.enter_method(method);
            let result = self.check_method(class, method);
            self.reporter.exit_method();
            result.with_context(|| format!("check {}.{}", class.name, method.name))?;
        }
        Ok(())
    }

    fn check_method(&mut self, class: &'a Class, method: &'a Method) -> Result<()> {
        self.span = method.span;
        self.check_signature(class, method);
        self.check_overrides(class, method);

        let Some(stmts) = method.body.as_ref() else {
            return Ok(());
        };
        let scope = MethodScope::new(class, method);
        let flow = analyze_method(self.factory, &scope, method)?;
        let body = Body {
            scope: &scope,
            flow: Some(&flow),
        };
        self.check_stmts(stmts, &body)?;
        self.check_postconditions(class, method, &body, &flow);
        debug!(
            class = class.name.as_str(),
            method = method.name.as_str(),
            "checked method"
        );
        Ok(())
    }

    fn report_problems(&mut self, problems: Vec<(String, String)>, span: Span) {
        for (expression, message) in problems {
            self.error("expression.unparsable.type.invalid", span, vec![expression, message]);
        }
    }

    /// Annotation problems and type-argument validity of the declared signature.
    fn check_signature(&mut self, class: &'a Class, method: &'a Method) {
        let span = method.span;
        let mut problems = Vec::new();
        for param in &method.params {
            problems.extend(self.factory.declaration_problems(class, Some(method), &param.ty));
        }
        problems.extend(
            self.factory
                .declaration_problems(class, Some(method), &method.return_type),
        );
        if let Some(receiver) = method.receiver.as_ref() {
            problems.extend(self.factory.declaration_problems(class, Some(method), receiver));
        }
        problems.extend(self.factory.contract_problems(class, method));
        self.report_problems(problems, span);

        let declared = self.factory.method_type(class, method);
        for param in &declared.params {
            self.check_type_arguments(param, span);
        }
        if !method.is_constructor() {
            self.check_type_arguments(&declared.return_type, span);
        }
    }

    /// Returns are covariant, parameters contravariant, receivers contravariant.
    fn check_overrides(&mut self, class: &'a Class, method: &'a Method) {
        if method.is_constructor() || method.is_static {
            return;
        }
        let types = self.types();
        let overrider = self.factory.method_type(class, method);
        let overrider_label = method_label(class, method);
        let overrider_scope = MethodScope::new(class, method);
        for supertype in self.factory.supertypes(class) {
            let Some(overridden_method) = supertype.methods.iter().find(|candidate| {
                candidate.name == method.name
                    && candidate.params.len() == method.params.len()
                    && !candidate.is_static
            }) else {
                continue;
            };
            let overridden = self.factory.method_type(supertype, overridden_method);
            let overridden_label = method_label(supertype, overridden_method);

            if !overridden.return_type.is_void()
                && !types.is_subtype(&overrider.return_type, &overridden.return_type)
            {
                self.error(
                    "override.return.invalid",
                    method.span,
                    vec![
                        overrider_label.clone(),
                        overridden_label.clone(),
                        overrider.return_type.to_string(),
                        overridden.return_type.to_string(),
                    ],
                );
            }
            for ((param, mine), theirs) in method
                .params
                .iter()
                .zip(&overrider.params)
                .zip(&overridden.params)
            {
                if !types.is_subtype(theirs, mine) {
                    self.error(
                        "override.param.invalid",
                        method.span,
                        vec![
                            param.name.clone(),
                            overrider_label.clone(),
                            overridden_label.clone(),
                            mine.to_string(),
                            theirs.to_string(),
                        ],
                    );
                }
            }
            if method.receiver.is_some() {
                let mine = self.factory.this_type(&overrider_scope).effective_qualifiers();
                let overridden_scope = MethodScope::new(supertype, overridden_method);
                let theirs = self.factory.this_type(&overridden_scope).effective_qualifiers();
                if !self.hierarchy().is_subtype_set(&theirs, &mine) {
                    self.error(
                        "override.receiver.invalid",
                        method.span,
                        vec![
                            overrider_label.clone(),
                            overridden_label,
                            mine.to_string(),
                            theirs.to_string(),
                        ],
                    );
                }
            }
        }
    }

    /// Every type argument must lie below the bound of its type parameter.
    fn check_type_arguments(&mut self, ty: &AnnotatedType, span: Span) {
        match &ty.kind {
            TypeKind::Declared { name, args } => {
                let bounds = self.factory.type_parameter_bounds(name);
                for ((param, bound), arg) in bounds.iter().zip(args) {
                    let checkable = !matches!(
                        arg.kind,
                        TypeKind::Wildcard { .. } | TypeKind::TypeVar { .. }
                    );
                    if checkable
                        && !self
                            .hierarchy()
                            .is_subtype_set(&arg.effective_qualifiers(), &bound.effective_qualifiers())
                    {
                        self.error(
                            "type.argument.type.incompatible",
                            span,
                            vec![
                                param.clone(),
                                name.clone(),
                                arg.to_string(),
                                bound.to_string(),
                            ],
                        );
                    }
                }
                for arg in args {
                    self.check_type_arguments(arg, span);
                }
            }
            TypeKind::Array(component) => self.check_type_arguments(component, span),
            TypeKind::Wildcard {
                extends,
                super_bound,
            } => {
                for bound in extends.iter().chain(super_bound.iter()) {
                    self.check_type_arguments(bound, span);
                }
            }
            _ => {}
        }
    }

    fn check_stmts(&mut self, stmts: &[Stmt], body: &Body<'_, 'a>) -> Result<()> {
        for stmt in stmts {
            self.check_stmt(stmt, body)?;
        }
        Ok(())
    }

    fn check_stmt(&mut self, stmt: &Stmt, body: &Body<'_, 'a>) -> Result<()> {
        if stmt.span.line > 0 {
            self.span = stmt.span;
        }
        match &stmt.kind {
            StmtKind::LocalVar { name, ty, init, .. } => {
                self.check_body_syntax(ty, body);
                let declared = self
                    .factory
                    .variable_type(body.scope, name)
                    .unwrap_or_else(|| self.factory.type_in_body(body.scope, ty));
                self.check_type_arguments(&declared, stmt.span);
                if let Some(init) = init {
                    self.check_expr(init, body)?;
                    self.check_assignment(init, &declared, body, stmt.span)?;
                }
            }
            StmtKind::Expr(expr) | StmtKind::Throw(expr) => self.check_expr(expr, body)?,
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.check_expr(condition, body)?;
                self.check_stmts(then_branch, body)?;
                if let Some(else_branch) = else_branch {
                    self.check_stmts(else_branch, body)?;
                }
            }
            StmtKind::While {
                condition,
                body: stmts,
            }
            | StmtKind::DoWhile {
                body: stmts,
                condition,
            } => {
                self.check_expr(condition, body)?;
                self.check_stmts(stmts, body)?;
            }
            StmtKind::For {
                init,
                condition,
                update,
                body: stmts,
            } => {
                self.check_stmts(init, body)?;
                if let Some(condition) = condition {
                    self.check_expr(condition, body)?;
                }
                for expr in update {
                    self.check_expr(expr, body)?;
                }
                self.check_stmts(stmts, body)?;
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.check_expr(value, body)?;
                    self.check_return(value, body, stmt.span)?;
                }
            }
            StmtKind::Try {
                body: stmts,
                catches,
                finally,
            } => {
                self.check_stmts(stmts, body)?;
                for catch in catches {
                    self.check_body_syntax(&catch.ty, body);
                    self.check_stmts(&catch.body, body)?;
                }
                if let Some(finally) = finally {
                    self.check_stmts(finally, body)?;
                }
            }
            StmtKind::Block(stmts) => self.check_stmts(stmts, body)?,
            StmtKind::Break | StmtKind::Continue => {}
        }
        Ok(())
    }

    fn check_body_syntax(&mut self, syntax: &TypeSyntax, body: &Body<'_, 'a>) {
        let problems = self.factory.body_problems(body.scope, syntax);
        self.report_problems(problems, self.span);
    }

    fn check_return(&mut self, value: &Expr, body: &Body<'_, 'a>, span: Span) -> Result<()> {
        let Some(method) = body.scope.method else {
            return Ok(());
        };
        if method.is_constructor() {
            return Ok(());
        }
        let required = self.factory.method_type(body.scope.class, method).return_type;
        if required.is_void() {
            return Ok(());
        }
        let found = self.factory.annotated_type(value, body.scope, body.values())?;
        if !self.types().is_subtype(&found, &required) {
            self.error(
                "return.type.incompatible",
                span,
                vec![found.to_string(), required.to_string()],
            );
        }
        Ok(())
    }

    /// `value` must be assignable to a variable of type `required`.
    fn check_assignment(
        &mut self,
        value: &Expr,
        required: &AnnotatedType,
        body: &Body<'_, 'a>,
        span: Span,
    ) -> Result<()> {
        let found = self.factory.annotated_type(value, body.scope, body.values())?;
        if !self.types().is_subtype(&found, required) {
            self.error(
                "assignment.type.incompatible",
                span,
                vec![found.to_string(), required.to_string()],
            );
        }
        Ok(())
    }

    fn check_expr(&mut self, expr: &Expr, body: &Body<'_, 'a>) -> Result<()> {
        for child in expr.children() {
            self.check_expr(child, body)?;
        }
        match &expr.kind {
            ExprKind::Assign { target, value } => {
                let required = self
                    .factory
                    .unrefined_type(target, body.scope, body.values())?;
                self.check_assignment(value, &required, body, expr.span)?;
            }
            ExprKind::Field {
                receiver: Some(receiver),
                ..
            } => self.check_dereference(receiver, body, expr.span)?,
            ExprKind::ArrayAccess { array, index } => {
                self.check_dereference(array, body, expr.span)?;
                self.check_array_access(array, index, body, expr.span)?;
            }
            ExprKind::Call { receiver, .. } => {
                if let Some(receiver) = receiver {
                    self.check_dereference(receiver, body, expr.span)?;
                }
                self.check_invocation(expr, body)?;
            }
            ExprKind::New { type_args, .. } => {
                for arg in type_args {
                    self.check_body_syntax(arg, body);
                }
                let created = self.factory.annotated_type(expr, body.scope, body.values())?;
                self.check_type_arguments(&created, self.span_of(expr.span));
                self.check_invocation(expr, body)?;
            }
            ExprKind::NewArray { component, .. } => self.check_body_syntax(component, body),
            ExprKind::Binary {
                op: BinaryOp::Eq | BinaryOp::Ne,
                left,
                right,
            } => self.check_equality(left, right, body, expr.span)?,
            ExprKind::InstanceOf { ty, .. } => self.check_body_syntax(ty, body),
            ExprKind::Cast { ty, expr: inner } => {
                self.check_body_syntax(ty, body);
                self.check_cast(expr, ty, inner, body)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn check_dereference(&mut self, receiver: &Expr, body: &Body<'_, 'a>, span: Span) -> Result<()> {
        if matches!(receiver.kind, ExprKind::ClassName(_)) {
            return Ok(());
        }
        let ty = self.factory.annotated_type(receiver, body.scope, body.values())?;
        if let Some(finding) = self
            .factory
            .system
            .rules
            .check_dereference(self.hierarchy(), &ty)
        {
            let mut args = vec![receiver.to_string()];
            args.extend(finding.args);
            self.error(finding.key, span, args);
        }
        Ok(())
    }

    fn check_array_access(
        &mut self,
        array: &Expr,
        index: &Expr,
        body: &Body<'_, 'a>,
        span: Span,
    ) -> Result<()> {
        let index_type = self.factory.annotated_type(index, body.scope, body.values())?;
        let array_expr = FlowExpr::from_tree(array);
        if let Some(finding) = self.factory.system.rules.check_array_access(
            self.hierarchy(),
            array_expr.as_ref(),
            &index_type,
        ) {
            let mut args = vec![index.to_string(), array.to_string()];
            args.extend(finding.args);
            self.error(finding.key, span, args);
        }
        Ok(())
    }

    fn check_equality(
        &mut self,
        left: &Expr,
        right: &Expr,
        body: &Body<'_, 'a>,
        span: Span,
    ) -> Result<()> {
        let left_type = self.factory.annotated_type(left, body.scope, body.values())?;
        let right_type = self.factory.annotated_type(right, body.scope, body.values())?;
        if let Some(finding) = self.factory.system.rules.check_equality(
            self.hierarchy(),
            (left, &left_type),
            (right, &right_type),
        ) {
            self.error(finding.key, span, finding.args);
        }
        Ok(())
    }

    /// Casts that narrow a qualifier cannot be verified and are only warned about.
    fn check_cast(
        &mut self,
        cast: &Expr,
        ty: &TypeSyntax,
        inner: &Expr,
        body: &Body<'_, 'a>,
    ) -> Result<()> {
        if ty.annotations().is_empty() {
            return Ok(());
        }
        let target = self.factory.annotated_type(cast, body.scope, body.values())?;
        let found = self.factory.annotated_type(inner, body.scope, body.values())?;
        if !self
            .hierarchy()
            .is_subtype_set(&found.effective_qualifiers(), &target.effective_qualifiers())
        {
            let span = self.span_of(cast.span);
            self.reporter.warning(
                "cast.unsafe",
                span,
                vec![found.to_string(), target.to_string()],
            );
        }
        Ok(())
    }

    /// Arguments, receiver and preconditions of a call or `new`.
    fn check_invocation(&mut self, expr: &Expr, body: &Body<'_, 'a>) -> Result<()> {
        let Some(signature) = self
            .factory
            .method_signature(expr, body.scope, body.values())?
        else {
            return Ok(());
        };
        let label = method_label(signature.owner, signature.method);
        let (receiver, args) = match &expr.kind {
            ExprKind::Call { receiver, args, .. } => (receiver.as_deref(), args),
            ExprKind::New { args, .. } => (None, args),
            _ => return Ok(()),
        };

        for ((param, required), arg) in signature
            .method
            .params
            .iter()
            .zip(&signature.params)
            .zip(args)
        {
            let found = self.factory.annotated_type(arg, body.scope, body.values())?;
            if !self.types().is_subtype(&found, required) {
                self.error(
                    "argument.type.incompatible",
                    arg.span,
                    vec![
                        param.name.clone(),
                        label.clone(),
                        found.to_string(),
                        required.to_string(),
                    ],
                );
            }
        }

        if let (ExprKind::Call { .. }, Some(required)) = (&expr.kind, signature.receiver.as_ref()) {
            let found = match receiver {
                Some(receiver) if matches!(receiver.kind, ExprKind::ClassName(_)) => None,
                Some(receiver) => Some(self.factory.annotated_type(receiver, body.scope, body.values())?),
                None => Some(self.factory.this_type(body.scope)),
            };
            if let Some(found) = found {
                let found = found.effective_qualifiers();
                let required = required.effective_qualifiers();
                if !self.hierarchy().is_subtype_set(&found, &required) {
                    self.error(
                        "method.invocation.invalid",
                        expr.span,
                        vec![label.clone(), found.to_string(), required.to_string()],
                    );
                }
            }
        }

        self.check_preconditions(expr, &signature, &label, body);
        Ok(())
    }

    fn check_preconditions(
        &mut self,
        expr: &Expr,
        signature: &MethodSignature<'_>,
        label: &str,
        body: &Body<'_, 'a>,
    ) {
        let store = body.flow.and_then(|flow| flow.store_before(expr.id));
        let adapt = |target: &FlowExpr| {
            target.viewpoint_adapt(&signature.receiver_expr, &signature.arg_exprs)
        };
        for contract in self.factory.contracts(signature.owner, signature.method) {
            if contract.kind != ContractKind::Precondition {
                continue;
            }
            let target = adapt(&contract.target);
            if target.contains_unknown() {
                continue;
            }
            let required = QualifierSet::single(contract.qualifier.map_exprs(&adapt));
            let found = self.known_value(store, &target, body.scope);
            if !self.hierarchy().is_subtype_set(&found, &required) {
                self.error(
                    "contracts.precondition.not.satisfied",
                    expr.span,
                    vec![
                        label.to_string(),
                        target.to_string(),
                        required.to_string(),
                        found.to_string(),
                    ],
                );
            }
        }
    }

    /// Refined value of `target`, else its declared qualifiers, else top.
    fn known_value(&self, store: Option<&Store>, target: &FlowExpr, scope: &MethodScope<'_>) -> QualifierSet {
        store
            .and_then(|store| store.get(target).cloned())
            .or_else(|| {
                self.factory
                    .declared_type_of(target, scope)
                    .map(|ty| ty.effective_qualifiers())
            })
            .unwrap_or_else(|| self.hierarchy().top_set())
    }

    /// Postconditions against the exit store, conditional ones against each return.
    fn check_postconditions(
        &mut self,
        class: &'a Class,
        method: &'a Method,
        body: &Body<'_, 'a>,
        flow: &FlowResult<'a>,
    ) {
        let params = body.scope.param_exprs();
        let adapt = |target: &FlowExpr| target.viewpoint_adapt(&FlowExpr::This, &params);
        let label = method_label(class, method);
        for contract in self.factory.contracts(class, method) {
            let target = adapt(&contract.target);
            let required = QualifierSet::single(contract.qualifier.map_exprs(&adapt));
            match contract.kind {
                ContractKind::Precondition => {}
                ContractKind::Postcondition => {
                    let Some(exit) = flow.exit_store.as_ref() else {
                        continue;
                    };
                    let found = self.known_value(Some(exit), &target, body.scope);
                    if !self.hierarchy().is_subtype_set(&found, &required) {
                        self.error(
                            "contracts.postcondition.not.satisfied",
                            method.span,
                            vec![
                                label.clone(),
                                contract.expression.clone(),
                                required.to_string(),
                                found.to_string(),
                            ],
                        );
                    }
                }
                ContractKind::ConditionalPostcondition { result } => {
                    for site in &flow.return_sites {
                        if let Some(Expr {
                            kind: ExprKind::Literal(Literal::Bool(returned)),
                            ..
                        }) = site.value
                        {
                            if *returned != result {
                                continue;
                            }
                        }
                        let store = if result {
                            site.input.then_store()
                        } else {
                            site.input.else_store()
                        };
                        let found = self.known_value(Some(store), &target, body.scope);
                        if !self.hierarchy().is_subtype_set(&found, &required) {
                            self.error(
                                "contracts.conditional.postcondition.not.satisfied",
                                site.span,
                                vec![
                                    label.clone(),
                                    result.to_string(),
                                    contract.expression.clone(),
                                    required.to_string(),
                                    found.to_string(),
                                ],
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Check every class of `unit`; the reporter holds what was found.
pub(crate) fn check_unit<'a>(
    factory: &AnnotatedTypeFactory<'a>,
    unit: &'a CompilationUnit,
) -> Result<Reporter> {
    let mut reporter = Reporter::new(
        &factory.system.name,
        &unit.path,
        &factory.options.suppress_warnings,
    );
    let mut visitor = TypeCheckVisitor::new(factory, &mut reporter);
    for class in &unit.classes {
        visitor
            .visit_class(class)
            .with_context(|| format!("check {}", unit.path))?;
    }
    Ok(reporter)
}

fn method_label(owner: &Class, method: &Method) -> String {
    format!("{}.{}", owner.name, method.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkers::builtin;
    use crate::hierarchy::HierarchyDecl;
    use crate::ir::{Annotation, Contract};
    use crate::test_harness::*;
    use crate::type_system::TypeSystem;

    fn nullness() -> CheckerTestHarness {
        CheckerTestHarness::new("nullness").expect("harness")
    }

    #[test]
    fn return_of_nullable_from_non_null_method_is_reported() {
        let units = vec![unit(
            "A.java",
            vec![class("A").method(
                method("get")
                    .param("p", declared_with("String", &["Nullable"]))
                    .returns(declared("String"))
                    .body(vec![return_stmt(Some(local("p")))]),
            )],
        )];

        let diagnostics = nullness().check(units).expect("check");

        assert_eq!(keys(&diagnostics), vec!["return.type.incompatible"]);
        assert_eq!(
            diagnostics[0].args,
            vec!["@Nullable String".to_string(), "@NonNull String".to_string()]
        );
    }

    #[test]
    fn refined_local_is_assignable_after_null_check() {
        let units = vec![unit(
            "A.java",
            vec![class("A").method(
                method("get")
                    .param("p", declared_with("String", &["Nullable"]))
                    .returns(declared("String"))
                    .body(vec![
                        if_then(
                            binary(BinaryOp::Eq, local("p"), null_lit()),
                            vec![return_stmt(Some(string_lit("")))],
                        ),
                        return_stmt(Some(local("p"))),
                    ]),
            )],
        )];

        let diagnostics = nullness().check(units).expect("check");

        assert!(diagnostics.is_empty(), "unexpected: {diagnostics:?}");
    }

    #[test]
    fn override_checks_cover_return_and_parameters() {
        let units = vec![unit(
            "A.java",
            vec![
                class("Base").method(
                    method("convert")
                        .param("input", declared_with("String", &["Nullable"]))
                        .returns(declared("String")),
                ),
                class("Derived").extends("Base").method(
                    method("convert")
                        .param("input", declared("String"))
                        .returns(declared_with("String", &["Nullable"])),
                ),
            ],
        )];

        let diagnostics = nullness().check(units).expect("check");

        assert_eq!(
            keys(&diagnostics),
            vec!["override.return.invalid", "override.param.invalid"]
        );
    }

    #[test]
    fn receiver_annotation_must_accept_the_overridden_receiver() {
        let units = vec![unit(
            "A.java",
            vec![
                class("Base").method(
                    method("run").receiver(declared_with("Base", &["Nullable"])),
                ),
                class("Derived")
                    .extends("Base")
                    .method(method("run").receiver(declared_with("Derived", &["NonNull"]))),
            ],
        )];

        let diagnostics = nullness().check(units).expect("check");

        assert_eq!(keys(&diagnostics), vec!["override.receiver.invalid"]);
    }

    #[test]
    fn type_argument_must_respect_explicit_bound() {
        let units = vec![unit(
            "A.java",
            vec![
                class("Box").type_param(type_param_bounded("T", declared("Object"))),
                class("User").method(method("use").param(
                    "box",
                    generic("Box", vec![declared_with("String", &["Nullable"])]),
                )),
            ],
        )];

        let diagnostics = nullness().check(units).expect("check");

        assert_eq!(keys(&diagnostics), vec!["type.argument.type.incompatible"]);
    }

    #[test]
    fn unbounded_type_parameter_accepts_nullable_arguments() {
        let units = vec![unit(
            "A.java",
            vec![
                class("Box").type_param(type_param("T")),
                class("User").method(method("use").param(
                    "box",
                    generic("Box", vec![declared_with("String", &["Nullable"])]),
                )),
            ],
        )];

        let diagnostics = nullness().check(units).expect("check");

        assert!(diagnostics.is_empty(), "unexpected: {diagnostics:?}");
    }

    #[test]
    fn receiver_requirement_is_checked_at_calls() {
        let units = vec![unit(
            "A.java",
            vec![
                class("Conn").method(
                    method("close").receiver(declared_with("Conn", &["NonNull"])),
                ),
                class("User").method(
                    method("m")
                        .param("conn", declared_with("Conn", &["Nullable"]))
                        .body(vec![expr_stmt(call(Some(local("conn")), "close", vec![]))]),
                ),
            ],
        )];

        let diagnostics = nullness().check(units).expect("check");

        assert_eq!(
            keys(&diagnostics),
            vec!["dereference.of.nullable", "method.invocation.invalid"]
        );
    }

    #[test]
    fn precondition_is_checked_at_call_sites() {
        let units = vec![unit(
            "A.java",
            vec![class("A")
                .with_field(field("cache", declared_with("String", &["Nullable"])))
                .method(method("use").contract(Contract {
                    kind: ContractKind::Precondition,
                    expression: "cache".to_string(),
                    qualifier: Annotation::marker("NonNull"),
                }))
                .method(method("bad").body(vec![expr_stmt(call(None, "use", vec![]))]))
                .method(method("good").body(vec![if_then(
                    binary(BinaryOp::Ne, this_field("cache"), null_lit()),
                    vec![expr_stmt(call(None, "use", vec![]))],
                )]))],
        )];

        let diagnostics = nullness().check(units).expect("check");

        assert_eq!(keys(&diagnostics), vec!["contracts.precondition.not.satisfied"]);
        assert_eq!(diagnostics[0].method.as_deref(), Some("bad"));
    }

    #[test]
    fn postcondition_is_verified_at_exit() {
        let ensures = |name: &str, body: Vec<Stmt>| {
            method(name)
                .contract(Contract {
                    kind: ContractKind::Postcondition,
                    expression: "cache".to_string(),
                    qualifier: Annotation::marker("NonNull"),
                })
                .body(body)
        };
        let units = vec![unit(
            "A.java",
            vec![class("A")
                .with_field(field("cache", declared_with("String", &["Nullable"])))
                .method(ensures(
                    "fill",
                    vec![expr_stmt(assign(this_field("cache"), string_lit("x")))],
                ))
                .method(ensures("forget", vec![]))],
        )];

        let diagnostics = nullness().check(units).expect("check");

        assert_eq!(keys(&diagnostics), vec!["contracts.postcondition.not.satisfied"]);
        assert_eq!(diagnostics[0].method.as_deref(), Some("forget"));
    }

    #[test]
    fn conditional_postcondition_is_checked_per_return() {
        let contract = Contract {
            kind: ContractKind::ConditionalPostcondition { result: true },
            expression: "value".to_string(),
            qualifier: Annotation::marker("NonNull"),
        };
        let units = vec![unit(
            "A.java",
            vec![class("A")
                .method(
                    method("present")
                        .param("value", declared_with("String", &["Nullable"]))
                        .returns(primitive("boolean"))
                        .contract(contract.clone())
                        .body(vec![return_stmt(Some(binary(
                            BinaryOp::Ne,
                            local("value"),
                            null_lit(),
                        )))]),
                )
                .method(
                    method("lies")
                        .param("value", declared_with("String", &["Nullable"]))
                        .returns(primitive("boolean"))
                        .contract(contract.clone())
                        .body(vec![return_stmt(Some(bool_lit(true)))]),
                )
                .method(
                    method("never")
                        .param("value", declared_with("String", &["Nullable"]))
                        .returns(primitive("boolean"))
                        .contract(contract)
                        .body(vec![return_stmt(Some(bool_lit(false)))]),
                )],
        )];

        let diagnostics = nullness().check(units).expect("check");

        assert_eq!(
            keys(&diagnostics),
            vec!["contracts.conditional.postcondition.not.satisfied"]
        );
        assert_eq!(diagnostics[0].method.as_deref(), Some("lies"));
    }

    #[test]
    fn conditional_postcondition_holds_through_logical_returns() {
        let checks = |name: &str, result: bool, returned: Expr| {
            method(name)
                .param("first", declared_with("String", &["Nullable"]))
                .param("second", declared_with("String", &["Nullable"]))
                .returns(primitive("boolean"))
                .contract(Contract {
                    kind: ContractKind::ConditionalPostcondition { result },
                    expression: "second".to_string(),
                    qualifier: Annotation::marker("NonNull"),
                })
                .body(vec![return_stmt(Some(returned))])
        };
        let present = |name: &str| binary(BinaryOp::Ne, local(name), null_lit());
        let absent = |name: &str| binary(BinaryOp::Eq, local(name), null_lit());
        let units = vec![unit(
            "A.java",
            vec![class("A")
                .method(checks(
                    "both",
                    true,
                    binary(BinaryOp::And, present("first"), present("second")),
                ))
                .method(checks(
                    "either_missing",
                    false,
                    binary(BinaryOp::Or, absent("first"), absent("second")),
                ))
                .method(checks("not_missing", true, unary_not(absent("second"))))
                .method(checks(
                    "neither_missing",
                    true,
                    unary_not(binary(BinaryOp::Or, absent("first"), absent("second"))),
                ))
                .method(checks(
                    "any",
                    true,
                    binary(BinaryOp::Or, present("first"), present("second")),
                ))],
        )];

        let diagnostics = nullness().check(units).expect("check");

        assert_eq!(
            keys(&diagnostics),
            vec!["contracts.conditional.postcondition.not.satisfied"]
        );
        assert_eq!(diagnostics[0].method.as_deref(), Some("any"));
    }

    #[test]
    fn narrowing_cast_is_a_warning() {
        let units = vec![unit(
            "A.java",
            vec![class("A").method(
                method("m")
                    .param("p", declared_with("String", &["Nullable"]))
                    .body(vec![expr_stmt(cast(
                        declared_with("String", &["NonNull"]),
                        local("p"),
                    ))]),
            )],
        )];

        let diagnostics = nullness().check(units).expect("check");

        assert_eq!(keys(&diagnostics), vec!["cast.unsafe"]);
        assert_eq!(diagnostics[0].severity, crate::diagnostics::Severity::Warning);
    }

    #[test]
    fn unparsable_dependent_expression_is_reported_once() {
        let harness = CheckerTestHarness::new("upper_bound").expect("harness");
        let units = vec![unit(
            "A.java",
            vec![class("A").method(
                method("m")
                    .param("i", primitive_with("int", &[("LTLengthOf", &["nope("])]))
                    .body(vec![]),
            )],
        )];

        let diagnostics = harness.check(units).expect("check");

        assert_eq!(keys(&diagnostics), vec!["expression.unparsable.type.invalid"]);
        assert_eq!(diagnostics[0].args[0], "nope(");
    }

    #[test]
    fn sibling_refinements_merge_to_their_parent() {
        let decl: HierarchyDecl = serde_json::from_str(
            r#"{
                "name": "siblings",
                "qualifiers": [
                    {"name": "Top", "default_for": ["otherwise"]},
                    {"name": "Parent", "subtype_of": ["Top"]},
                    {"name": "Sibling1", "subtype_of": ["Parent"]},
                    {"name": "Sibling2", "subtype_of": ["Parent"]},
                    {"name": "Bottom", "subtype_of": ["Sibling1", "Sibling2"], "bottom": true}
                ]
            }"#,
        )
        .expect("parse declaration");
        let harness = CheckerTestHarness::with_system(TypeSystem::declarative(&decl).expect("system"));
        let units = vec![unit(
            "A.java",
            vec![class("A")
                .with_field(field("f", declared("Object")))
                .method(
                    method("m")
                        .param("one", declared_with("Object", &["Sibling1"]))
                        .param("two", declared_with("Object", &["Sibling2"]))
                        .param("flag", primitive("boolean"))
                        .body(vec![
                            if_else(
                                local("flag"),
                                vec![expr_stmt(assign(this_field("f"), local("one")))],
                                vec![expr_stmt(assign(this_field("f"), local("two")))],
                            ),
                            local_var(
                                "parent",
                                declared_with("Object", &["Parent"]),
                                Some(this_field("f")),
                            ),
                            local_var(
                                "narrow",
                                declared_with("Object", &["Sibling1"]),
                                Some(this_field("f")),
                            ),
                        ]),
                )],
        )];

        let diagnostics = harness.check(units).expect("check");

        // Only the second local rejects the merged @Parent value.
        assert_eq!(keys(&diagnostics), vec!["assignment.type.incompatible"]);
        assert_eq!(diagnostics[0].args[0], "@Parent Object");
    }

    #[test]
    fn suppressed_method_reports_nothing() {
        let units = vec![unit(
            "A.java",
            vec![class("A").method(
                method("get")
                    .annotation(Annotation::with_values("SuppressWarnings", &["nullness"]))
                    .param("p", declared_with("String", &["Nullable"]))
                    .returns(declared("String"))
                    .body(vec![return_stmt(Some(local("p")))]),
            )],
        )];

        let diagnostics = nullness().check(units).expect("check");

        assert!(diagnostics.is_empty(), "unexpected: {diagnostics:?}");
    }

    #[test]
    fn stub_signatures_are_used_for_library_calls() {
        let stubs = vec![crate::ir::StubFile {
            classes: vec![class("Lib").method(
                method("find")
                    .returns(declared_with("String", &["Nullable"]))
                    .static_method(),
            )],
        }];
        let units = vec![unit(
            "A.java",
            vec![class("A").method(
                method("get")
                    .returns(declared("String"))
                    .body(vec![return_stmt(Some(call(
                        Some(class_name("Lib")),
                        "find",
                        vec![],
                    )))]),
            )],
        )];

        let diagnostics = nullness().with_stubs(stubs).check(units).expect("check");

        assert_eq!(keys(&diagnostics), vec!["return.type.incompatible"]);
        assert_eq!(diagnostics[0].span.line, 3);
    }

    #[test]
    fn command_line_suppressions_hide_matching_keys() {
        let options = crate::options::CheckerOptions {
            suppress_warnings: vec!["nullness:return".to_string()],
            ..crate::options::CheckerOptions::default()
        };
        let units = vec![unit(
            "A.java",
            vec![class("A").method(
                method("get")
                    .param("p", declared_with("String", &["Nullable"]))
                    .returns(declared("String"))
                    .body(vec![return_stmt(Some(local("p")))]),
            )],
        )];

        let diagnostics = nullness().with_options(options).check(units).expect("check");

        assert!(diagnostics.is_empty(), "unexpected: {diagnostics:?}");
    }

    #[test]
    fn builtin_lookup_is_shared_with_the_harness() {
        let system = builtin("tainting").expect("tainting");
        assert_eq!(CheckerTestHarness::with_system(system).checker(), "tainting");
    }
}
