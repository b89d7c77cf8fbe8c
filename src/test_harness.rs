use anyhow::Result;

use crate::checkers::builtin;
use crate::diagnostics::Diagnostic;
use crate::factory::AnnotatedTypeFactory;
use crate::ir::{
    Annotation, BinaryOp, CatchClause, Class, CompilationUnit, Contract, Expr, ExprKind, Field,
    Literal, Method, Param, Purity, Span, Stmt, StmtKind, StubFile, TypeParam, TypeSyntax, UnaryOp,
    assign_expression_ids,
};
use crate::options::CheckerOptions;
use crate::type_system::TypeSystem;
use crate::visitor::check_unit;

/// Runs one type system over hand-built compilation units.
pub(crate) struct CheckerTestHarness {
    system: TypeSystem,
    options: CheckerOptions,
    stubs: Vec<StubFile>,
}

impl CheckerTestHarness {
    pub(crate) fn new(checker: &str) -> Result<Self> {
        Ok(Self::with_system(builtin(checker)?))
    }

    pub(crate) fn with_system(system: TypeSystem) -> Self {
        Self {
            system,
            options: CheckerOptions::default(),
            stubs: Vec::new(),
        }
    }

    pub(crate) fn with_options(mut self, options: CheckerOptions) -> Self {
        self.options = options;
        self
    }

    pub(crate) fn with_stubs(mut self, stubs: Vec<StubFile>) -> Self {
        self.stubs = stubs;
        self
    }

    pub(crate) fn checker(&self) -> &str {
        &self.system.name
    }

    /// Diagnostics of every unit in order.
    pub(crate) fn check(&self, mut units: Vec<CompilationUnit>) -> Result<Vec<Diagnostic>> {
        number(&mut units);
        let factory = AnnotatedTypeFactory::new(&self.system, &units, &self.stubs, &self.options);
        let mut diagnostics = Vec::new();
        for unit in &units {
            diagnostics.extend(check_unit(&factory, unit)?.into_diagnostics());
        }
        Ok(diagnostics)
    }
}

pub(crate) fn keys(diagnostics: &[Diagnostic]) -> Vec<&str> {
    diagnostics
        .iter()
        .map(|diagnostic| diagnostic.key.as_str())
        .collect()
}

/// Assign expression ids and give each statement its own line.
pub(crate) fn number(units: &mut [CompilationUnit]) {
    for unit in units.iter_mut() {
        assign_expression_ids(unit);
        let mut line = 1;
        for class in &mut unit.classes {
            class.span = Span::at(line);
            line += 1;
            for field in &mut class.fields {
                field.span = Span::at(line);
                line += 1;
            }
            for method in &mut class.methods {
                method.span = Span::at(line);
                line += 1;
                if let Some(body) = method.body.as_mut() {
                    number_lines(body, &mut line);
                }
            }
        }
    }
}

fn number_lines(stmts: &mut [Stmt], line: &mut u32) {
    for stmt in stmts {
        if stmt.span.line == 0 {
            stmt.span = Span::at(*line);
        }
        *line += 1;
        match &mut stmt.kind {
            StmtKind::If {
                then_branch,
                else_branch,
                ..
            } => {
                number_lines(then_branch, line);
                if let Some(else_branch) = else_branch.as_mut() {
                    number_lines(else_branch, line);
                }
            }
            StmtKind::While { body, .. }
            | StmtKind::DoWhile { body, .. }
            | StmtKind::Block(body) => number_lines(body, line),
            StmtKind::For { init, body, .. } => {
                number_lines(init, line);
                number_lines(body, line);
            }
            StmtKind::Try {
                body,
                catches,
                finally,
            } => {
                number_lines(body, line);
                for catch in catches.iter_mut() {
                    number_lines(&mut catch.body, line);
                }
                if let Some(finally) = finally.as_mut() {
                    number_lines(finally, line);
                }
            }
            _ => {}
        }
    }
}

pub(crate) fn unit(path: &str, classes: Vec<Class>) -> CompilationUnit {
    CompilationUnit {
        path: path.to_string(),
        classes,
    }
}

pub(crate) fn class(name: &str) -> Class {
    Class {
        name: name.to_string(),
        super_name: None,
        interfaces: Vec::new(),
        type_params: Vec::new(),
        annotations: Vec::new(),
        fields: Vec::new(),
        methods: Vec::new(),
        span: Span::default(),
    }
}

impl Class {
    pub(crate) fn method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    pub(crate) fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub(crate) fn type_param(mut self, param: TypeParam) -> Self {
        self.type_params.push(param);
        self
    }

    pub(crate) fn annotation(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    pub(crate) fn extends(mut self, super_name: &str) -> Self {
        self.super_name = Some(super_name.to_string());
        self
    }
}

pub(crate) fn method(name: &str) -> Method {
    Method {
        name: name.to_string(),
        type_params: Vec::new(),
        params: Vec::new(),
        return_type: TypeSyntax::Void,
        receiver: None,
        is_static: false,
        purity: Purity::Impure,
        contracts: Vec::new(),
        annotations: Vec::new(),
        body: None,
        span: Span::default(),
    }
}

impl Method {
    pub(crate) fn param(mut self, name: &str, ty: TypeSyntax) -> Self {
        self.params.push(Param {
            name: name.to_string(),
            ty,
            is_final: false,
        });
        self
    }

    pub(crate) fn returns(mut self, ty: TypeSyntax) -> Self {
        self.return_type = ty;
        self
    }

    pub(crate) fn body(mut self, body: Vec<Stmt>) -> Self {
        self.body = Some(body);
        self
    }

    pub(crate) fn type_param(mut self, param: TypeParam) -> Self {
        self.type_params.push(param);
        self
    }

    pub(crate) fn receiver(mut self, ty: TypeSyntax) -> Self {
        self.receiver = Some(ty);
        self
    }

    pub(crate) fn static_method(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub(crate) fn purity(mut self, purity: Purity) -> Self {
        self.purity = purity;
        self
    }

    pub(crate) fn contract(mut self, contract: Contract) -> Self {
        self.contracts.push(contract);
        self
    }

    pub(crate) fn annotation(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }
}

pub(crate) fn field(name: &str, ty: TypeSyntax) -> Field {
    Field {
        name: name.to_string(),
        ty,
        is_final: false,
        is_static: false,
        initializer: None,
        span: Span::default(),
    }
}

fn markers(names: &[&str]) -> Vec<Annotation> {
    names.iter().map(|name| Annotation::marker(name)).collect()
}

pub(crate) fn declared(name: &str) -> TypeSyntax {
    declared_with(name, &[])
}

pub(crate) fn declared_with(name: &str, annotations: &[&str]) -> TypeSyntax {
    TypeSyntax::Declared {
        name: name.to_string(),
        args: Vec::new(),
        annotations: markers(annotations),
    }
}

pub(crate) fn generic(name: &str, args: Vec<TypeSyntax>) -> TypeSyntax {
    TypeSyntax::Declared {
        name: name.to_string(),
        args,
        annotations: Vec::new(),
    }
}

pub(crate) fn type_var(name: &str) -> TypeSyntax {
    TypeSyntax::TypeVar {
        name: name.to_string(),
        annotations: Vec::new(),
    }
}

pub(crate) fn wildcard_extends(bound: TypeSyntax) -> TypeSyntax {
    TypeSyntax::Wildcard {
        extends: Some(Box::new(bound)),
        super_bound: None,
        annotations: Vec::new(),
    }
}

pub(crate) fn array_of(component: TypeSyntax) -> TypeSyntax {
    TypeSyntax::Array {
        component: Box::new(component),
        annotations: Vec::new(),
    }
}

pub(crate) fn primitive(name: &str) -> TypeSyntax {
    primitive_with(name, &[])
}

/// Primitive with annotations carrying element values, e.g. `@IntVal({1, 2}) int`.
pub(crate) fn primitive_with(name: &str, annotations: &[(&str, &[&str])]) -> TypeSyntax {
    TypeSyntax::Primitive {
        name: name.to_string(),
        annotations: annotations
            .iter()
            .map(|(annotation, values)| Annotation::with_values(annotation, values))
            .collect(),
    }
}

pub(crate) fn type_param(name: &str) -> TypeParam {
    TypeParam {
        name: name.to_string(),
        bound: None,
        annotations: Vec::new(),
    }
}

pub(crate) fn type_param_bounded(name: &str, bound: TypeSyntax) -> TypeParam {
    TypeParam {
        bound: Some(bound),
        ..type_param(name)
    }
}

fn stmt(kind: StmtKind) -> Stmt {
    Stmt {
        span: Span::default(),
        kind,
    }
}

pub(crate) fn local_var(name: &str, ty: TypeSyntax, init: Option<Expr>) -> Stmt {
    stmt(StmtKind::LocalVar {
        name: name.to_string(),
        ty,
        init,
        is_final: false,
    })
}

pub(crate) fn expr_stmt(expr: Expr) -> Stmt {
    stmt(StmtKind::Expr(expr))
}

pub(crate) fn if_then(condition: Expr, then_branch: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::If {
        condition,
        then_branch,
        else_branch: None,
    })
}

pub(crate) fn if_else(condition: Expr, then_branch: Vec<Stmt>, else_branch: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::If {
        condition,
        then_branch,
        else_branch: Some(else_branch),
    })
}

pub(crate) fn while_loop(condition: Expr, body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::While { condition, body })
}

/// `try { body } catch (Exception name) { handler }`
pub(crate) fn try_catch(body: Vec<Stmt>, name: &str, handler: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::Try {
        body,
        catches: vec![CatchClause {
            name: name.to_string(),
            ty: declared("Exception"),
            body: handler,
        }],
        finally: None,
    })
}

pub(crate) fn return_stmt(value: Option<Expr>) -> Stmt {
    stmt(StmtKind::Return(value))
}

pub(crate) fn local(name: &str) -> Expr {
    Expr::new(ExprKind::Local(name.to_string()))
}

pub(crate) fn class_name(name: &str) -> Expr {
    Expr::new(ExprKind::ClassName(name.to_string()))
}

pub(crate) fn this_field(name: &str) -> Expr {
    field_access(Expr::new(ExprKind::This), name)
}

pub(crate) fn field_access(receiver: Expr, name: &str) -> Expr {
    Expr::new(ExprKind::Field {
        receiver: Some(Box::new(receiver)),
        name: name.to_string(),
    })
}

pub(crate) fn array_access(array: Expr, index: Expr) -> Expr {
    Expr::new(ExprKind::ArrayAccess {
        array: Box::new(array),
        index: Box::new(index),
    })
}

pub(crate) fn call(receiver: Option<Expr>, method: &str, args: Vec<Expr>) -> Expr {
    Expr::new(ExprKind::Call {
        receiver: receiver.map(Box::new),
        method: method.to_string(),
        args,
    })
}

pub(crate) fn assign(target: Expr, value: Expr) -> Expr {
    Expr::new(ExprKind::Assign {
        target: Box::new(target),
        value: Box::new(value),
    })
}

pub(crate) fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::new(ExprKind::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    })
}

pub(crate) fn unary_not(operand: Expr) -> Expr {
    Expr::new(ExprKind::Unary {
        op: UnaryOp::Not,
        operand: Box::new(operand),
    })
}

pub(crate) fn cast(ty: TypeSyntax, expr: Expr) -> Expr {
    Expr::new(ExprKind::Cast {
        ty,
        expr: Box::new(expr),
    })
}

pub(crate) fn null_lit() -> Expr {
    Expr::new(ExprKind::Literal(Literal::Null))
}

pub(crate) fn bool_lit(value: bool) -> Expr {
    Expr::new(ExprKind::Literal(Literal::Bool(value)))
}

pub(crate) fn int_lit(value: i64) -> Expr {
    Expr::new(ExprKind::Literal(Literal::Int(value)))
}

pub(crate) fn string_lit(value: &str) -> Expr {
    Expr::new(ExprKind::Literal(Literal::String(value.to_string())))
}

/// Top expression of the first statement.
pub(crate) fn first_expr(method: &Method) -> &Expr {
    let body = method.body.as_ref().expect("method body");
    match &body[0].kind {
        StmtKind::Expr(expr) => expr,
        StmtKind::LocalVar {
            init: Some(init), ..
        } => init,
        StmtKind::Return(Some(value)) => value,
        other => panic!("no expression in {other:?}"),
    }
}

/// First call of `name` anywhere in the body.
pub(crate) fn find_call<'m>(method: &'m Method, name: &str) -> Option<&'m Expr> {
    method
        .body
        .as_ref()
        .and_then(|body| find_in_stmts(body, name))
}

fn find_in_stmts<'m>(stmts: &'m [Stmt], name: &str) -> Option<&'m Expr> {
    stmts.iter().find_map(|stmt| match &stmt.kind {
        StmtKind::LocalVar { init, .. } => init.as_ref().and_then(|init| find_in_expr(init, name)),
        StmtKind::Expr(expr) | StmtKind::Throw(expr) => find_in_expr(expr, name),
        StmtKind::Return(value) => value.as_ref().and_then(|value| find_in_expr(value, name)),
        StmtKind::If {
            condition,
            then_branch,
            else_branch,
        } => find_in_expr(condition, name)
            .or_else(|| find_in_stmts(then_branch, name))
            .or_else(|| {
                else_branch
                    .as_ref()
                    .and_then(|branch| find_in_stmts(branch, name))
            }),
        StmtKind::While { condition, body } | StmtKind::DoWhile { body, condition } => {
            find_in_expr(condition, name).or_else(|| find_in_stmts(body, name))
        }
        StmtKind::For {
            init,
            condition,
            update,
            body,
        } => find_in_stmts(init, name)
            .or_else(|| condition.as_ref().and_then(|c| find_in_expr(c, name)))
            .or_else(|| update.iter().find_map(|expr| find_in_expr(expr, name)))
            .or_else(|| find_in_stmts(body, name)),
        StmtKind::Try {
            body,
            catches,
            finally,
        } => find_in_stmts(body, name)
            .or_else(|| {
                catches
                    .iter()
                    .find_map(|catch| find_in_stmts(&catch.body, name))
            })
            .or_else(|| finally.as_ref().and_then(|f| find_in_stmts(f, name))),
        StmtKind::Block(body) => find_in_stmts(body, name),
        StmtKind::Break | StmtKind::Continue => None,
    })
}

fn find_in_expr<'m>(expr: &'m Expr, name: &str) -> Option<&'m Expr> {
    if let ExprKind::Call { method, .. } = &expr.kind {
        if method == name {
            return Some(expr);
        }
    }
    expr.children()
        .into_iter()
        .find_map(|child| find_in_expr(child, name))
}
