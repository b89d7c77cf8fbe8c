use std::fmt;

use crate::ir::{BinaryOp, Expr, ExprKind, Literal};

/// An expression whose qualifiers the flow store can track.
///
/// Also the canonical form of dependent-type expressions, so a refined
/// store key and a standardized qualifier argument print the same way.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum FlowExpr {
    Local(String),
    This,
    ClassName(String),
    /// 1-based formal parameter, written `#i`.
    Param(usize),
    Field {
        receiver: Box<FlowExpr>,
        field: String,
    },
    ArrayAccess {
        array: Box<FlowExpr>,
        index: Box<FlowExpr>,
    },
    MethodCall {
        receiver: Box<FlowExpr>,
        method: String,
        args: Vec<FlowExpr>,
    },
    /// Canonical literal text such as `1`, `"a"` or `null`.
    Literal(String),
    Binary {
        op: BinaryOp,
        left: Box<FlowExpr>,
        right: Box<FlowExpr>,
    },
    /// Something that could not be expressed at this program point.
    Unknown,
}

impl FlowExpr {
    pub(crate) fn field(receiver: FlowExpr, field: &str) -> Self {
        FlowExpr::Field {
            receiver: Box::new(receiver),
            field: field.to_string(),
        }
    }

    /// Convert a tree expression; `None` for expressions the store never tracks.
    ///
    /// Method calls are converted regardless of purity; callers decide
    /// whether a call result may be stored.
    pub(crate) fn from_tree(expr: &Expr) -> Option<Self> {
        let converted = match &expr.kind {
            ExprKind::Local(name) => FlowExpr::Local(name.clone()),
            ExprKind::This => FlowExpr::This,
            ExprKind::ClassName(name) => FlowExpr::ClassName(name.clone()),
            ExprKind::Field { receiver, name } => {
                let receiver = match receiver {
                    Some(receiver) => FlowExpr::from_tree(receiver)?,
                    None => FlowExpr::This,
                };
                FlowExpr::field(receiver, name)
            }
            ExprKind::ArrayAccess { array, index } => FlowExpr::ArrayAccess {
                array: Box::new(FlowExpr::from_tree(array)?),
                index: Box::new(FlowExpr::from_tree(index)?),
            },
            ExprKind::Call {
                receiver,
                method,
                args,
            } => {
                let receiver = match receiver {
                    Some(receiver) => FlowExpr::from_tree(receiver)?,
                    None => FlowExpr::This,
                };
                let args = args
                    .iter()
                    .map(FlowExpr::from_tree)
                    .collect::<Option<Vec<_>>>()?;
                FlowExpr::MethodCall {
                    receiver: Box::new(receiver),
                    method: method.clone(),
                    args,
                }
            }
            ExprKind::Literal(literal) => FlowExpr::Literal(literal_text(literal)),
            ExprKind::Binary { op, left, right } if matches!(op, BinaryOp::Add | BinaryOp::Sub) => {
                FlowExpr::Binary {
                    op: *op,
                    left: Box::new(FlowExpr::from_tree(left)?),
                    right: Box::new(FlowExpr::from_tree(right)?),
                }
            }
            _ => return None,
        };
        Some(converted)
    }

    fn children(&self) -> Vec<&FlowExpr> {
        match self {
            FlowExpr::Field { receiver, .. } => vec![receiver],
            FlowExpr::ArrayAccess { array, index } => vec![array, index],
            FlowExpr::MethodCall { receiver, args, .. } => {
                let mut out: Vec<&FlowExpr> = vec![receiver];
                out.extend(args.iter());
                out
            }
            FlowExpr::Binary { left, right, .. } => vec![left, right],
            _ => Vec::new(),
        }
    }

    fn any(&self, predicate: &dyn Fn(&FlowExpr) -> bool) -> bool {
        predicate(self) || self.children().into_iter().any(|child| child.any(predicate))
    }

    pub(crate) fn mentions_local(&self, name: &str) -> bool {
        self.any(&|expr| matches!(expr, FlowExpr::Local(local) if local == name))
    }

    pub(crate) fn contains_array_access(&self) -> bool {
        self.any(&|expr| matches!(expr, FlowExpr::ArrayAccess { .. }))
    }

    pub(crate) fn contains_method_call(&self) -> bool {
        self.any(&|expr| matches!(expr, FlowExpr::MethodCall { .. }))
    }

    pub(crate) fn contains_unknown(&self) -> bool {
        self.any(&|expr| matches!(expr, FlowExpr::Unknown))
    }

    pub(crate) fn contains_field(&self, name: &str) -> bool {
        self.any(&|expr| matches!(expr, FlowExpr::Field { field, .. } if field == name))
    }

    /// Whether no code other than the current method can change its value.
    pub(crate) fn is_unmodifiable_by_other_code(
        &self,
        is_final_field: &dyn Fn(&FlowExpr, &str) -> bool,
    ) -> bool {
        match self {
            FlowExpr::Local(_)
            | FlowExpr::This
            | FlowExpr::ClassName(_)
            | FlowExpr::Param(_)
            | FlowExpr::Literal(_) => true,
            FlowExpr::Field { receiver, field } => {
                is_final_field(receiver, field)
                    && receiver.is_unmodifiable_by_other_code(is_final_field)
            }
            FlowExpr::Binary { left, right, .. } => {
                left.is_unmodifiable_by_other_code(is_final_field)
                    && right.is_unmodifiable_by_other_code(is_final_field)
            }
            FlowExpr::ArrayAccess { .. } | FlowExpr::MethodCall { .. } | FlowExpr::Unknown => false,
        }
    }

    /// Replace `#i` by the i-th argument and `this` by the receiver.
    ///
    /// A parameter without a matching argument becomes `Unknown`.
    pub(crate) fn viewpoint_adapt(&self, receiver: &FlowExpr, args: &[FlowExpr]) -> FlowExpr {
        match self {
            FlowExpr::This => receiver.clone(),
            FlowExpr::Param(index) => index
                .checked_sub(1)
                .and_then(|position| args.get(position))
                .cloned()
                .unwrap_or(FlowExpr::Unknown),
            FlowExpr::Field {
                receiver: inner,
                field,
            } => FlowExpr::Field {
                receiver: Box::new(inner.viewpoint_adapt(receiver, args)),
                field: field.clone(),
            },
            FlowExpr::ArrayAccess { array, index } => FlowExpr::ArrayAccess {
                array: Box::new(array.viewpoint_adapt(receiver, args)),
                index: Box::new(index.viewpoint_adapt(receiver, args)),
            },
            FlowExpr::MethodCall {
                receiver: inner,
                method,
                args: call_args,
            } => FlowExpr::MethodCall {
                receiver: Box::new(inner.viewpoint_adapt(receiver, args)),
                method: method.clone(),
                args: call_args
                    .iter()
                    .map(|arg| arg.viewpoint_adapt(receiver, args))
                    .collect(),
            },
            FlowExpr::Binary { op, left, right } => FlowExpr::Binary {
                op: *op,
                left: Box::new(left.viewpoint_adapt(receiver, args)),
                right: Box::new(right.viewpoint_adapt(receiver, args)),
            },
            other => other.clone(),
        }
    }
}

fn literal_text(literal: &Literal) -> String {
    match literal {
        Literal::Null => "null".to_string(),
        Literal::Bool(value) => value.to_string(),
        Literal::Int(value) => value.to_string(),
        Literal::Char(value) => format!("'{value}'"),
        Literal::String(value) => format!("{value:?}"),
    }
}

impl fmt::Display for FlowExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowExpr::Local(name) | FlowExpr::ClassName(name) => write!(f, "{name}"),
            FlowExpr::This => write!(f, "this"),
            FlowExpr::Param(index) => write!(f, "#{index}"),
            FlowExpr::Field { receiver, field } => write!(f, "{receiver}.{field}"),
            FlowExpr::ArrayAccess { array, index } => write!(f, "{array}[{index}]"),
            FlowExpr::MethodCall {
                receiver,
                method,
                args,
            } => {
                write!(f, "{receiver}.{method}(")?;
                for (position, arg) in args.iter().enumerate() {
                    if position > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            FlowExpr::Literal(text) => write!(f, "{text}"),
            FlowExpr::Binary { op, left, right } => {
                write!(f, "{left} {} ", op.symbol())?;
                if matches!(right.as_ref(), FlowExpr::Binary { .. }) {
                    write!(f, "({right})")
                } else {
                    write!(f, "{right}")
                }
            }
            FlowExpr::Unknown => write!(f, "<unknown>"),
        }
    }
}
