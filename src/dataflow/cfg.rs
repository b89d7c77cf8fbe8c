use crate::ir::{BinaryOp, Expr, ExprId, ExprKind, Method, Span, Stmt, StmtKind, UnaryOp};

pub(crate) type BlockId = usize;

pub(crate) const ENTRY: BlockId = 0;
pub(crate) const EXIT: BlockId = 1;

/// One evaluation step inside a basic block.
///
/// Subexpressions always appear as earlier nodes, so a node's operands have
/// values by the time it is visited.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Node<'a> {
    Expr(&'a Expr),
    LocalDecl {
        name: &'a str,
        init: Option<&'a Expr>,
        span: Span,
    },
}

impl Node<'_> {
    pub(crate) fn expr(&self) -> Option<&Expr> {
        match self {
            Node::Expr(expr) => Some(expr),
            Node::LocalDecl { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Terminator<'a> {
    Goto(BlockId),
    If {
        condition: ExprId,
        then_target: BlockId,
        else_target: BlockId,
    },
    /// Flows into the `outcome` half of `target`'s input, keeping the two
    /// results of a boolean apart.
    Outcome {
        target: BlockId,
        outcome: bool,
    },
    /// Flows to `EXIT`.
    Return {
        value: Option<&'a Expr>,
        span: Span,
    },
    /// Flows to the block's exceptional successors only.
    Throw,
    Exit,
}

#[derive(Clone, Debug)]
pub(crate) struct BasicBlock<'a> {
    pub(crate) nodes: Vec<Node<'a>>,
    pub(crate) terminator: Terminator<'a>,
    /// Catch blocks reached when an invocation in this block throws.
    pub(crate) exceptional: Vec<BlockId>,
}

#[derive(Clone, Debug)]
pub(crate) struct ControlFlowGraph<'a> {
    pub(crate) blocks: Vec<BasicBlock<'a>>,
}

impl<'a> ControlFlowGraph<'a> {
    /// Graph of a method body. Bodiless methods get an entry that flows to exit.
    pub(crate) fn build(method: &'a Method) -> Self {
        let mut builder = CfgBuilder::default();
        let entry = builder.new_block();
        let exit = builder.new_block();
        debug_assert_eq!((entry, exit), (ENTRY, EXIT));
        builder.blocks[EXIT].terminator = Some(Terminator::Exit);
        let body = method.body.as_deref().unwrap_or(&[]);
        if let Some(end) = builder.build_seq(body, ENTRY) {
            builder.set_terminator(end, Terminator::Goto(EXIT));
        }
        builder.finish()
    }

    pub(crate) fn successors(&self, block: BlockId) -> Vec<BlockId> {
        let data = &self.blocks[block];
        let mut out = match data.terminator {
            Terminator::Goto(target) => vec![target],
            Terminator::If {
                then_target,
                else_target,
                ..
            } => vec![then_target, else_target],
            Terminator::Outcome { target, .. } => vec![target],
            Terminator::Return { .. } => vec![EXIT],
            Terminator::Throw => Vec::new(),
            Terminator::Exit => Vec::new(),
        };
        out.extend(data.exceptional.iter().copied());
        out.dedup();
        out
    }

    /// Reachable blocks in reverse post-order from `ENTRY`.
    pub(crate) fn reverse_post_order(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut post_order = Vec::with_capacity(self.blocks.len());
        let mut stack = vec![(ENTRY, 0usize)];
        visited[ENTRY] = true;
        while let Some((block, next)) = stack.pop() {
            let successors = self.successors(block);
            if let Some(&successor) = successors.get(next) {
                stack.push((block, next + 1));
                if !visited[successor] {
                    visited[successor] = true;
                    stack.push((successor, 0));
                }
            } else {
                post_order.push(block);
            }
        }
        post_order.reverse();
        post_order
    }
}

#[derive(Debug, Clone, Copy)]
struct LoopContext {
    break_target: BlockId,
    continue_target: BlockId,
}

#[derive(Default)]
struct PendingBlock<'a> {
    nodes: Vec<Node<'a>>,
    terminator: Option<Terminator<'a>>,
    exceptional: Vec<BlockId>,
}

#[derive(Default)]
struct CfgBuilder<'a> {
    blocks: Vec<PendingBlock<'a>>,
    loop_stack: Vec<LoopContext>,
    /// Catch blocks of every enclosing `try`, innermost last.
    handlers: Vec<BlockId>,
}

impl<'a> CfgBuilder<'a> {
    fn new_block(&mut self) -> BlockId {
        self.blocks.push(PendingBlock::default());
        self.blocks.len() - 1
    }

    fn set_terminator(&mut self, block: BlockId, terminator: Terminator<'a>) {
        let slot = &mut self.blocks[block].terminator;
        if slot.is_none() {
            *slot = Some(terminator);
        }
    }

    fn push(&mut self, block: BlockId, node: Node<'a>) {
        self.blocks[block].nodes.push(node);
    }

    fn finish(self) -> ControlFlowGraph<'a> {
        let blocks = self
            .blocks
            .into_iter()
            .map(|block| BasicBlock {
                nodes: block.nodes,
                terminator: block.terminator.unwrap_or(Terminator::Goto(EXIT)),
                exceptional: block.exceptional,
            })
            .collect();
        ControlFlowGraph { blocks }
    }

    fn build_seq(&mut self, stmts: &'a [Stmt], entry: BlockId) -> Option<BlockId> {
        let mut reachable_current = Some(entry);
        let mut unreachable_current: Option<BlockId> = None;
        for stmt in stmts {
            if let Some(current) = reachable_current {
                reachable_current = self.build_stmt(stmt, current);
                continue;
            }
            let current = match unreachable_current {
                Some(block) => block,
                None => self.new_block(),
            };
            unreachable_current = self.build_stmt(stmt, current);
        }
        reachable_current
    }

    fn build_stmt(&mut self, stmt: &'a Stmt, entry: BlockId) -> Option<BlockId> {
        match &stmt.kind {
            StmtKind::Block(stmts) => self.build_seq(stmts, entry),
            StmtKind::LocalVar { name, init, .. } => {
                let current = match init {
                    Some(init) => self.expression(init, entry),
                    None => entry,
                };
                self.push(
                    current,
                    Node::LocalDecl {
                        name,
                        init: init.as_ref(),
                        span: stmt.span,
                    },
                );
                Some(current)
            }
            StmtKind::Expr(expr) => Some(self.expression(expr, entry)),
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let then_entry = self.new_block();
                let else_entry = self.new_block();
                let join = self.new_block();
                self.condition(condition, entry, then_entry, else_entry);

                let then_fallthrough = self.build_seq(then_branch, then_entry);
                if let Some(block) = then_fallthrough {
                    self.set_terminator(block, Terminator::Goto(join));
                }
                let else_fallthrough = match else_branch {
                    Some(else_branch) => self.build_seq(else_branch, else_entry),
                    None => Some(else_entry),
                };
                if let Some(block) = else_fallthrough {
                    self.set_terminator(block, Terminator::Goto(join));
                }
                (then_fallthrough.is_some() || else_fallthrough.is_some()).then_some(join)
            }
            StmtKind::While { condition, body } => {
                let cond_block = self.new_block();
                let body_block = self.new_block();
                let after = self.new_block();
                self.set_terminator(entry, Terminator::Goto(cond_block));
                self.condition(condition, cond_block, body_block, after);

                self.loop_stack.push(LoopContext {
                    break_target: after,
                    continue_target: cond_block,
                });
                let body_fallthrough = self.build_seq(body, body_block);
                self.loop_stack.pop();
                if let Some(block) = body_fallthrough {
                    self.set_terminator(block, Terminator::Goto(cond_block));
                }
                Some(after)
            }
            StmtKind::DoWhile { body, condition } => {
                let body_block = self.new_block();
                let cond_block = self.new_block();
                let after = self.new_block();
                self.set_terminator(entry, Terminator::Goto(body_block));

                self.loop_stack.push(LoopContext {
                    break_target: after,
                    continue_target: cond_block,
                });
                let body_fallthrough = self.build_seq(body, body_block);
                self.loop_stack.pop();
                if let Some(block) = body_fallthrough {
                    self.set_terminator(block, Terminator::Goto(cond_block));
                }
                self.condition(condition, cond_block, body_block, after);
                Some(after)
            }
            StmtKind::For {
                init,
                condition,
                update,
                body,
            } => {
                let init_end = self.build_seq(init, entry)?;
                let cond_block = self.new_block();
                let body_block = self.new_block();
                let update_block = self.new_block();
                let after = self.new_block();
                self.set_terminator(init_end, Terminator::Goto(cond_block));
                match condition {
                    Some(condition) => self.condition(condition, cond_block, body_block, after),
                    None => self.set_terminator(cond_block, Terminator::Goto(body_block)),
                }

                self.loop_stack.push(LoopContext {
                    break_target: after,
                    continue_target: update_block,
                });
                let body_fallthrough = self.build_seq(body, body_block);
                self.loop_stack.pop();
                if let Some(block) = body_fallthrough {
                    self.set_terminator(block, Terminator::Goto(update_block));
                }

                let mut current = update_block;
                for expr in update {
                    current = self.expression(expr, current);
                }
                self.set_terminator(current, Terminator::Goto(cond_block));
                Some(after)
            }
            StmtKind::Return(value) => {
                let current = match value {
                    Some(value) => self.expression(value, entry),
                    None => entry,
                };
                self.set_terminator(
                    current,
                    Terminator::Return {
                        value: value.as_ref(),
                        span: stmt.span,
                    },
                );
                None
            }
            StmtKind::Throw(exception) => {
                let current = self.expression(exception, entry);
                let targets = self.handlers.clone();
                self.blocks[current].exceptional.extend(targets);
                self.set_terminator(current, Terminator::Throw);
                None
            }
            StmtKind::Try {
                body,
                catches,
                finally,
            } => {
                let catch_blocks: Vec<BlockId> = catches.iter().map(|_| self.new_block()).collect();
                let after = self.new_block();

                let saved = self.handlers.len();
                self.handlers.extend(catch_blocks.iter().copied());
                let body_fallthrough = self.build_seq(body, entry);
                self.handlers.truncate(saved);

                let mut reaches_after = false;
                if let Some(block) = body_fallthrough {
                    self.set_terminator(block, Terminator::Goto(after));
                    reaches_after = true;
                }
                for (catch, block) in catches.iter().zip(catch_blocks) {
                    if let Some(end) = self.build_seq(&catch.body, block) {
                        self.set_terminator(end, Terminator::Goto(after));
                        reaches_after = true;
                    }
                }
                if !reaches_after {
                    return None;
                }
                match finally {
                    Some(finally) => self.build_seq(finally, after),
                    None => Some(after),
                }
            }
            StmtKind::Break => {
                let target = self
                    .loop_stack
                    .last()
                    .map(|ctx| ctx.break_target)
                    .unwrap_or(EXIT);
                self.set_terminator(entry, Terminator::Goto(target));
                None
            }
            StmtKind::Continue => {
                let target = self
                    .loop_stack
                    .last()
                    .map(|ctx| ctx.continue_target)
                    .unwrap_or(EXIT);
                self.set_terminator(entry, Terminator::Goto(target));
                None
            }
        }
    }

    /// Branch on `condition`, decomposing `&&`, `||` and `!`.
    fn condition(&mut self, condition: &'a Expr, entry: BlockId, then_target: BlockId, else_target: BlockId) {
        match &condition.kind {
            ExprKind::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                let rhs = self.new_block();
                self.condition(left, entry, rhs, else_target);
                self.condition(right, rhs, then_target, else_target);
            }
            ExprKind::Binary {
                op: BinaryOp::Or,
                left,
                right,
            } => {
                let rhs = self.new_block();
                self.condition(left, entry, then_target, rhs);
                self.condition(right, rhs, then_target, else_target);
            }
            ExprKind::Unary {
                op: UnaryOp::Not,
                operand,
            } => self.condition(operand, entry, else_target, then_target),
            _ => {
                let current = self.expression(condition, entry);
                self.set_terminator(
                    current,
                    Terminator::If {
                        condition: condition.id,
                        then_target,
                        else_target,
                    },
                );
            }
        }
    }

    /// Append the evaluation of `expr`; returns the block evaluation ends in.
    fn expression(&mut self, expr: &'a Expr, entry: BlockId) -> BlockId {
        match &expr.kind {
            ExprKind::Conditional {
                condition,
                then_expr,
                else_expr,
            } => {
                let then_block = self.new_block();
                let else_block = self.new_block();
                let join = self.new_block();
                self.condition(condition, entry, then_block, else_block);
                let then_end = self.expression(then_expr, then_block);
                self.set_terminator(then_end, Terminator::Goto(join));
                let else_end = self.expression(else_expr, else_block);
                self.set_terminator(else_end, Terminator::Goto(join));
                self.push(join, Node::Expr(expr));
                join
            }
            ExprKind::Binary { op, .. } if op.is_logical() => {
                let when_true = self.new_block();
                let when_false = self.new_block();
                let join = self.new_block();
                self.condition(expr, entry, when_true, when_false);
                self.set_terminator(
                    when_true,
                    Terminator::Outcome {
                        target: join,
                        outcome: true,
                    },
                );
                self.set_terminator(
                    when_false,
                    Terminator::Outcome {
                        target: join,
                        outcome: false,
                    },
                );
                self.push(join, Node::Expr(expr));
                join
            }
            _ => {
                let mut current = entry;
                for child in expr.children() {
                    current = self.expression(child, current);
                }
                self.push(current, Node::Expr(expr));
                let invokes = matches!(expr.kind, ExprKind::Call { .. } | ExprKind::New { .. });
                if invokes && !self.handlers.is_empty() {
                    let handlers = self.handlers.clone();
                    self.blocks[current].exceptional.extend(handlers);
                    let next = self.new_block();
                    self.set_terminator(current, Terminator::Goto(next));
                    return next;
                }
                current
            }
        }
    }
}
