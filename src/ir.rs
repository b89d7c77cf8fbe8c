use serde::{Deserialize, Serialize};

/// Identifier assigned to every expression of a compilation unit.
pub(crate) type ExprId = u32;

/// Source position of a tree node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub(crate) struct Span {
    #[serde(default)]
    pub(crate) line: u32,
    #[serde(default)]
    pub(crate) column: u32,
}

impl Span {
    pub(crate) fn at(line: u32) -> Self {
        Self { line, column: 0 }
    }
}

/// One compilation unit as produced by the front end.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct CompilationUnit {
    pub(crate) path: String,
    #[serde(default)]
    pub(crate) classes: Vec<Class>,
}

/// Annotated library signatures without bodies.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub(crate) struct StubFile {
    #[serde(default)]
    pub(crate) classes: Vec<Class>,
}

/// Annotation use: a name plus its element values rendered as strings.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub(crate) struct Annotation {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) values: Vec<String>,
}

#[cfg(test)]
impl Annotation {
    pub(crate) fn marker(name: &str) -> Self {
        Self {
            name: name.to_string(),
            values: Vec::new(),
        }
    }

    pub(crate) fn with_values(name: &str, values: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            values: values.iter().map(|value| value.to_string()).collect(),
        }
    }
}

/// Declaration annotation understood by the framework itself.
pub(crate) const DEFAULT_QUALIFIER: &str = "DefaultQualifier";
pub(crate) const ANNOTATED_FOR: &str = "AnnotatedFor";
pub(crate) const SUPPRESS_WARNINGS: &str = "SuppressWarnings";

/// Class declaration with its members.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Class {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) super_name: Option<String>,
    #[serde(default)]
    pub(crate) interfaces: Vec<String>,
    #[serde(default)]
    pub(crate) type_params: Vec<TypeParam>,
    #[serde(default)]
    pub(crate) annotations: Vec<Annotation>,
    #[serde(default)]
    pub(crate) fields: Vec<Field>,
    #[serde(default)]
    pub(crate) methods: Vec<Method>,
    #[serde(default)]
    pub(crate) span: Span,
}

impl Class {
    pub(crate) fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }
}

/// Type parameter declaration `T extends Bound`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct TypeParam {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) bound: Option<TypeSyntax>,
    /// Annotations written on the declaration itself, i.e. on the lower bound.
    #[serde(default)]
    pub(crate) annotations: Vec<Annotation>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Field {
    pub(crate) name: String,
    pub(crate) ty: TypeSyntax,
    #[serde(default)]
    pub(crate) is_final: bool,
    #[serde(default)]
    pub(crate) is_static: bool,
    #[serde(default)]
    pub(crate) initializer: Option<Expr>,
    #[serde(default)]
    pub(crate) span: Span,
}

/// What a method may do to the heap and whether repeated calls agree.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Purity {
    #[default]
    Impure,
    SideEffectFree,
    Deterministic,
    Pure,
}

impl Purity {
    pub(crate) fn is_side_effect_free(self) -> bool {
        matches!(self, Purity::SideEffectFree | Purity::Pure)
    }

    pub(crate) fn is_deterministic(self) -> bool {
        matches!(self, Purity::Deterministic | Purity::Pure)
    }
}

/// Pre- and postconditions expressed over qualifiers.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Contract {
    pub(crate) kind: ContractKind,
    pub(crate) expression: String,
    pub(crate) qualifier: Annotation,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ContractKind {
    Precondition,
    Postcondition,
    ConditionalPostcondition { result: bool },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Method {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) type_params: Vec<TypeParam>,
    #[serde(default)]
    pub(crate) params: Vec<Param>,
    pub(crate) return_type: TypeSyntax,
    #[serde(default)]
    pub(crate) receiver: Option<TypeSyntax>,
    #[serde(default)]
    pub(crate) is_static: bool,
    #[serde(default)]
    pub(crate) purity: Purity,
    #[serde(default)]
    pub(crate) contracts: Vec<Contract>,
    #[serde(default)]
    pub(crate) annotations: Vec<Annotation>,
    #[serde(default)]
    pub(crate) body: Option<Vec<Stmt>>,
    #[serde(default)]
    pub(crate) span: Span,
}

impl Method {
    pub(crate) fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Param {
    pub(crate) name: String,
    pub(crate) ty: TypeSyntax,
    #[serde(default)]
    pub(crate) is_final: bool,
}

/// Type as written in source, with its type annotations.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TypeSyntax {
    Primitive {
        name: String,
        #[serde(default)]
        annotations: Vec<Annotation>,
    },
    Declared {
        name: String,
        #[serde(default)]
        args: Vec<TypeSyntax>,
        #[serde(default)]
        annotations: Vec<Annotation>,
    },
    Array {
        component: Box<TypeSyntax>,
        #[serde(default)]
        annotations: Vec<Annotation>,
    },
    TypeVar {
        name: String,
        #[serde(default)]
        annotations: Vec<Annotation>,
    },
    Wildcard {
        #[serde(default)]
        extends: Option<Box<TypeSyntax>>,
        #[serde(default)]
        super_bound: Option<Box<TypeSyntax>>,
        #[serde(default)]
        annotations: Vec<Annotation>,
    },
    Intersection {
        bounds: Vec<TypeSyntax>,
    },
    Void,
}

impl TypeSyntax {
    pub(crate) fn annotations(&self) -> &[Annotation] {
        match self {
            TypeSyntax::Primitive { annotations, .. }
            | TypeSyntax::Declared { annotations, .. }
            | TypeSyntax::Array { annotations, .. }
            | TypeSyntax::TypeVar { annotations, .. }
            | TypeSyntax::Wildcard { annotations, .. } => annotations,
            TypeSyntax::Intersection { .. } | TypeSyntax::Void => &[],
        }
    }

    /// Every type annotation at any position of this type.
    pub(crate) fn all_annotations(&self) -> Vec<&Annotation> {
        let mut out: Vec<&Annotation> = self.annotations().iter().collect();
        match self {
            TypeSyntax::Declared { args, .. } => {
                for arg in args {
                    out.extend(arg.all_annotations());
                }
            }
            TypeSyntax::Array { component, .. } => out.extend(component.all_annotations()),
            TypeSyntax::Wildcard {
                extends,
                super_bound,
                ..
            } => {
                if let Some(bound) = extends {
                    out.extend(bound.all_annotations());
                }
                if let Some(bound) = super_bound {
                    out.extend(bound.all_annotations());
                }
            }
            TypeSyntax::Intersection { bounds } => {
                for bound in bounds {
                    out.extend(bound.all_annotations());
                }
            }
            _ => {}
        }
        out
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Stmt {
    #[serde(default)]
    pub(crate) span: Span,
    pub(crate) kind: StmtKind,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum StmtKind {
    LocalVar {
        name: String,
        ty: TypeSyntax,
        #[serde(default)]
        init: Option<Expr>,
        #[serde(default)]
        is_final: bool,
    },
    Expr(Expr),
    If {
        condition: Expr,
        then_branch: Vec<Stmt>,
        #[serde(default)]
        else_branch: Option<Vec<Stmt>>,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
    },
    DoWhile {
        body: Vec<Stmt>,
        condition: Expr,
    },
    For {
        #[serde(default)]
        init: Vec<Stmt>,
        #[serde(default)]
        condition: Option<Expr>,
        #[serde(default)]
        update: Vec<Expr>,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Throw(Expr),
    Try {
        body: Vec<Stmt>,
        #[serde(default)]
        catches: Vec<CatchClause>,
        #[serde(default)]
        finally: Option<Vec<Stmt>>,
    },
    Block(Vec<Stmt>),
    Break,
    Continue,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct CatchClause {
    pub(crate) name: String,
    pub(crate) ty: TypeSyntax,
    pub(crate) body: Vec<Stmt>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Expr {
    #[serde(skip)]
    pub(crate) id: ExprId,
    #[serde(default)]
    pub(crate) span: Span,
    pub(crate) kind: ExprKind,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Char(char),
    String(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
}

impl BinaryOp {
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    pub(crate) fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub(crate) fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ExprKind {
    Literal(Literal),
    Local(String),
    This,
    /// Static receiver such as `Util` in `Util.parse(x)`.
    ClassName(String),
    Field {
        #[serde(default)]
        receiver: Option<Box<Expr>>,
        name: String,
    },
    ArrayAccess {
        array: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        #[serde(default)]
        receiver: Option<Box<Expr>>,
        method: String,
        #[serde(default)]
        args: Vec<Expr>,
    },
    New {
        class: String,
        #[serde(default)]
        type_args: Vec<TypeSyntax>,
        #[serde(default)]
        args: Vec<Expr>,
    },
    NewArray {
        component: TypeSyntax,
        length: Box<Expr>,
    },
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    InstanceOf {
        expr: Box<Expr>,
        ty: TypeSyntax,
    },
    Cast {
        ty: TypeSyntax,
        expr: Box<Expr>,
    },
    Conditional {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
}

impl Expr {
    pub(crate) fn new(kind: ExprKind) -> Self {
        Self {
            id: 0,
            span: Span::default(),
            kind,
        }
    }

    pub(crate) fn is_null_literal(&self) -> bool {
        matches!(self.kind, ExprKind::Literal(Literal::Null))
    }

    /// Direct subexpressions in evaluation order.
    pub(crate) fn children(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::Literal(_) | ExprKind::Local(_) | ExprKind::This | ExprKind::ClassName(_) => {
                Vec::new()
            }
            ExprKind::Field { receiver, .. } => receiver.iter().map(|r| r.as_ref()).collect(),
            ExprKind::ArrayAccess { array, index } => vec![array, index],
            ExprKind::Call { receiver, args, .. } => {
                let mut out: Vec<&Expr> = receiver.iter().map(|r| r.as_ref()).collect();
                out.extend(args.iter());
                out
            }
            ExprKind::New { args, .. } => args.iter().collect(),
            ExprKind::NewArray { length, .. } => vec![length],
            ExprKind::Assign { target, value } => vec![target, value],
            ExprKind::Binary { left, right, .. } => vec![left, right],
            ExprKind::Unary { operand, .. } => vec![operand],
            ExprKind::InstanceOf { expr, .. } | ExprKind::Cast { expr, .. } => vec![expr],
            ExprKind::Conditional {
                condition,
                then_expr,
                else_expr,
            } => vec![condition, then_expr, else_expr],
        }
    }

    fn children_mut(&mut self) -> Vec<&mut Expr> {
        match &mut self.kind {
            ExprKind::Literal(_) | ExprKind::Local(_) | ExprKind::This | ExprKind::ClassName(_) => {
                Vec::new()
            }
            ExprKind::Field { receiver, .. } => receiver.iter_mut().map(|r| r.as_mut()).collect(),
            ExprKind::ArrayAccess { array, index } => vec![array, index],
            ExprKind::Call { receiver, args, .. } => {
                let mut out: Vec<&mut Expr> = receiver.iter_mut().map(|r| r.as_mut()).collect();
                out.extend(args.iter_mut());
                out
            }
            ExprKind::New { args, .. } => args.iter_mut().collect(),
            ExprKind::NewArray { length, .. } => vec![length],
            ExprKind::Assign { target, value } => vec![target, value],
            ExprKind::Binary { left, right, .. } => vec![left, right],
            ExprKind::Unary { operand, .. } => vec![operand],
            ExprKind::InstanceOf { expr, .. } | ExprKind::Cast { expr, .. } => vec![expr],
            ExprKind::Conditional {
                condition,
                then_expr,
                else_expr,
            } => vec![condition, then_expr, else_expr],
        }
    }
}

/// Source-like rendering used in diagnostics.
impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ExprKind::Literal(Literal::Null) => write!(f, "null"),
            ExprKind::Literal(Literal::Bool(value)) => write!(f, "{value}"),
            ExprKind::Literal(Literal::Int(value)) => write!(f, "{value}"),
            ExprKind::Literal(Literal::Char(value)) => write!(f, "'{value}'"),
            ExprKind::Literal(Literal::String(value)) => write!(f, "{value:?}"),
            ExprKind::Local(name) | ExprKind::ClassName(name) => write!(f, "{name}"),
            ExprKind::This => write!(f, "this"),
            ExprKind::Field { receiver, name } => match receiver {
                Some(receiver) => write!(f, "{receiver}.{name}"),
                None => write!(f, "{name}"),
            },
            ExprKind::ArrayAccess { array, index } => write!(f, "{array}[{index}]"),
            ExprKind::Call {
                receiver,
                method,
                args,
            } => {
                if let Some(receiver) = receiver {
                    write!(f, "{receiver}.")?;
                }
                write!(f, "{method}(")?;
                for (index, arg) in args.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            ExprKind::New { class, args, .. } => {
                write!(f, "new {class}(")?;
                for (index, arg) in args.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            ExprKind::NewArray { length, .. } => write!(f, "new [{length}]"),
            ExprKind::Assign { target, value } => write!(f, "{target} = {value}"),
            ExprKind::Binary { op, left, right } => {
                write!(f, "{left} {} {right}", op.symbol())
            }
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::Not => write!(f, "!{operand}"),
                UnaryOp::Neg => write!(f, "-{operand}"),
            },
            ExprKind::InstanceOf { expr, .. } => write!(f, "{expr} instanceof ..."),
            ExprKind::Cast { expr, .. } => write!(f, "(...) {expr}"),
            ExprKind::Conditional {
                condition,
                then_expr,
                else_expr,
            } => write!(f, "{condition} ? {then_expr} : {else_expr}"),
        }
    }
}

/// Number every expression of a unit so analysis results can be keyed by id.
///
/// Ids start at 1; 0 marks an expression that was never numbered.
pub(crate) fn assign_expression_ids(unit: &mut CompilationUnit) {
    let mut next: ExprId = 1;
    for class in &mut unit.classes {
        for field in &mut class.fields {
            if let Some(init) = field.initializer.as_mut() {
                number_expr(init, &mut next);
            }
        }
        for method in &mut class.methods {
            if let Some(body) = method.body.as_mut() {
                number_stmts(body, &mut next);
            }
        }
    }
}

fn number_stmts(stmts: &mut [Stmt], next: &mut ExprId) {
    for stmt in stmts {
        match &mut stmt.kind {
            StmtKind::LocalVar { init, .. } => {
                if let Some(init) = init.as_mut() {
                    number_expr(init, next);
                }
            }
            StmtKind::Expr(expr) | StmtKind::Throw(expr) => number_expr(expr, next),
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                number_expr(condition, next);
                number_stmts(then_branch, next);
                if let Some(else_branch) = else_branch.as_mut() {
                    number_stmts(else_branch, next);
                }
            }
            StmtKind::While { condition, body } | StmtKind::DoWhile { body, condition } => {
                number_expr(condition, next);
                number_stmts(body, next);
            }
            StmtKind::For {
                init,
                condition,
                update,
                body,
            } => {
                number_stmts(init, next);
                if let Some(condition) = condition.as_mut() {
                    number_expr(condition, next);
                }
                for expr in update.iter_mut() {
                    number_expr(expr, next);
                }
                number_stmts(body, next);
            }
            StmtKind::Return(value) => {
                if let Some(value) = value.as_mut() {
                    number_expr(value, next);
                }
            }
            StmtKind::Try {
                body,
                catches,
                finally,
            } => {
                number_stmts(body, next);
                for catch in catches.iter_mut() {
                    number_stmts(&mut catch.body, next);
                }
                if let Some(finally) = finally.as_mut() {
                    number_stmts(finally, next);
                }
            }
            StmtKind::Block(stmts) => number_stmts(stmts, next),
            StmtKind::Break | StmtKind::Continue => {}
        }
    }
}

fn number_expr(expr: &mut Expr, next: &mut ExprId) {
    for child in expr.children_mut() {
        number_expr(child, next);
    }
    expr.id = *next;
    *next += 1;
}
