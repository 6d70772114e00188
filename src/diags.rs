//! Formatting and display for IR nodes.
//!
//! The printed form is close to the surface syntax of the statement
//! language and is stable: tests use it as a structural-equality witness.
//! With a [`NodeContext`] symbols print by name; without one they print as
//! `<id>`.

use std::fmt::{self, Display, Formatter, Write};

use crate::interval::{BoxExpr, DimExpr, Interval};
use crate::ir::{BinaryOp, Expr, ExprNode, NodeContext, Stmt, StmtNode, SymbolId};

/// Render an expression with symbol names from `ctx`.
pub fn print_expr(e: &Expr, ctx: Option<&NodeContext>) -> String {
    let mut p = Printer::new(ctx);
    p.write_expr(e);
    p.out
}

/// Render a statement tree with symbol names from `ctx`.
pub fn print_stmt(s: &Stmt, ctx: Option<&NodeContext>) -> String {
    let mut p = Printer::new(ctx);
    p.write_stmt(s);
    p.out
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&print_expr(self, None))
    }
}

impl Display for Stmt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&print_stmt(self, None))
    }
}

fn binary_symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => " + ",
        BinaryOp::Sub => " - ",
        BinaryOp::Mul => " * ",
        BinaryOp::Div => " / ",
        BinaryOp::Mod => " % ",
        BinaryOp::Eq => " == ",
        BinaryOp::Ne => " != ",
        BinaryOp::Lt => " < ",
        BinaryOp::Le => " <= ",
        BinaryOp::And => " && ",
        BinaryOp::Or => " || ",
        BinaryOp::BitAnd => " & ",
        BinaryOp::BitOr => " | ",
        BinaryOp::BitXor => " ^ ",
        BinaryOp::Shl => " << ",
        BinaryOp::Shr => " >> ",
        // min/max print as calls.
        BinaryOp::Min | BinaryOp::Max => unreachable!(),
    }
}

struct Printer<'a> {
    out: String,
    depth: usize,
    ctx: Option<&'a NodeContext>,
}

impl<'a> Printer<'a> {
    fn new(ctx: Option<&'a NodeContext>) -> Self {
        Printer {
            out: String::new(),
            depth: 0,
            ctx,
        }
    }

    fn sym(&mut self, sym: SymbolId) {
        match self.ctx {
            Some(ctx) => self.out.push_str(&ctx.name(sym)),
            None => {
                let _ = write!(self.out, "<{}>", sym.0);
            }
        }
    }

    fn indent(&mut self) {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
    }

    fn write_expr(&mut self, e: &Expr) {
        let node = match e.node() {
            Some(node) => node,
            None => {
                self.out.push_str("<>");
                return;
            }
        };
        match node {
            ExprNode::Variable(sym) => self.sym(*sym),
            ExprNode::Wildcard(sym) => {
                self.out.push('$');
                self.sym(*sym);
            }
            ExprNode::Constant(c) => {
                let _ = write!(self.out, "{}", c);
            }
            ExprNode::Let { sym, value, body } => {
                self.out.push_str("let ");
                self.sym(*sym);
                self.out.push_str(" = ");
                self.write_expr(value);
                self.out.push_str(" in ");
                self.write_expr(body);
            }
            ExprNode::Binary { op, a, b } => match op {
                BinaryOp::Min | BinaryOp::Max => {
                    self.out.push_str(if *op == BinaryOp::Min { "min(" } else { "max(" });
                    self.write_expr(a);
                    self.out.push_str(", ");
                    self.write_expr(b);
                    self.out.push(')');
                }
                _ => {
                    self.out.push('(');
                    self.write_expr(a);
                    self.out.push_str(binary_symbol(*op));
                    self.write_expr(b);
                    self.out.push(')');
                }
            },
            ExprNode::Not(a) => {
                self.out.push('!');
                self.write_expr(a);
            }
            ExprNode::Select {
                condition,
                true_value,
                false_value,
            } => {
                self.out.push_str("select(");
                self.write_expr(condition);
                self.out.push_str(", ");
                self.write_expr(true_value);
                self.out.push_str(", ");
                self.write_expr(false_value);
                self.out.push(')');
            }
            ExprNode::Call { intrinsic, args } => {
                if args.is_empty() {
                    self.out.push_str(intrinsic.name());
                    return;
                }
                self.out.push_str(intrinsic.name());
                self.out.push('(');
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.write_expr(a);
                }
                self.out.push(')');
            }
        }
    }

    fn write_interval(&mut self, i: &Interval) {
        self.out.push('[');
        self.write_expr(&i.min);
        self.out.push_str(", ");
        self.write_expr(&i.max);
        self.out.push(']');
    }

    fn write_box(&mut self, b: &BoxExpr) {
        self.out.push('{');
        for (i, interval) in b.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.write_interval(interval);
        }
        self.out.push('}');
    }

    fn write_dim(&mut self, d: &DimExpr) {
        self.out.push('{');
        self.write_interval(&d.bounds);
        self.out.push_str(", ");
        self.write_expr(&d.stride);
        self.out.push_str(", ");
        self.write_expr(&d.fold_factor);
        self.out.push('}');
    }

    fn open_body(&mut self, body: &Stmt) {
        self.out.push_str(" {\n");
        self.depth += 1;
        self.write_stmt(body);
        self.depth -= 1;
        self.indent();
        self.out.push_str("}\n");
    }

    fn write_stmt(&mut self, s: &Stmt) {
        let node = match s.node() {
            Some(node) => node,
            None => return,
        };
        match node {
            StmtNode::LetStmt { sym, value, body } => {
                self.indent();
                self.out.push_str("let ");
                self.sym(*sym);
                self.out.push_str(" = ");
                self.write_expr(value);
                self.open_body(body);
            }
            StmtNode::Block { a, b } => {
                self.write_stmt(a);
                self.write_stmt(b);
            }
            StmtNode::Loop {
                sym,
                mode,
                bounds,
                step,
                body,
            } => {
                self.indent();
                self.out.push_str(match mode {
                    crate::ir::LoopMode::Serial => "loop(",
                    crate::ir::LoopMode::Parallel => "parallel_loop(",
                });
                self.sym(*sym);
                self.out.push_str(" in ");
                self.write_interval(bounds);
                if !step.is_constant(1) {
                    self.out.push_str(" step ");
                    self.write_expr(step);
                }
                self.out.push(')');
                self.open_body(body);
            }
            StmtNode::IfThenElse {
                condition,
                then_body,
                else_body,
            } => {
                self.indent();
                self.out.push_str("if(");
                self.write_expr(condition);
                self.out.push(')');
                if else_body.defined() {
                    self.out.push_str(" {\n");
                    self.depth += 1;
                    self.write_stmt(then_body);
                    self.depth -= 1;
                    self.indent();
                    self.out.push_str("} else");
                    self.open_body(else_body);
                } else {
                    self.open_body(then_body);
                }
            }
            StmtNode::Allocate {
                sym,
                storage,
                elem_size,
                dims,
                body,
            } => {
                self.indent();
                self.sym(*sym);
                let _ = write!(self.out, " = allocate<{}>(", elem_size);
                self.out.push('{');
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.write_dim(d);
                }
                self.out.push('}');
                let _ = write!(
                    self.out,
                    " on {})",
                    match storage {
                        crate::ir::MemoryType::Stack => "stack",
                        crate::ir::MemoryType::Heap => "heap",
                    }
                );
                self.open_body(body);
            }
            StmtNode::MakeBuffer {
                sym,
                base,
                elem_size,
                dims,
                body,
            } => {
                self.indent();
                self.sym(*sym);
                self.out.push_str(" = make_buffer(");
                self.write_expr(base);
                self.out.push_str(", ");
                self.write_expr(elem_size);
                self.out.push_str(", {");
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.write_dim(d);
                }
                self.out.push_str("})");
                self.open_body(body);
            }
            StmtNode::CropBuffer { sym, bounds, body } => {
                self.indent();
                self.out.push_str("crop_buffer(");
                self.sym(*sym);
                self.out.push_str(", ");
                self.write_box(bounds);
                self.out.push(')');
                self.open_body(body);
            }
            StmtNode::CropDim {
                sym,
                dim,
                bounds,
                body,
            } => {
                self.indent();
                let _ = write!(self.out, "crop_dim<{}>(", dim);
                self.sym(*sym);
                self.out.push_str(", ");
                self.write_interval(bounds);
                self.out.push(')');
                self.open_body(body);
            }
            StmtNode::SliceBuffer { sym, at, body } => {
                self.indent();
                self.out.push_str("slice_buffer(");
                self.sym(*sym);
                self.out.push_str(", {");
                for (i, e) in at.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.write_expr(e);
                }
                self.out.push_str("})");
                self.open_body(body);
            }
            StmtNode::SliceDim { sym, dim, at, body } => {
                self.indent();
                let _ = write!(self.out, "slice_dim<{}>(", dim);
                self.sym(*sym);
                self.out.push_str(", ");
                self.write_expr(at);
                self.out.push(')');
                self.open_body(body);
            }
            StmtNode::TruncateRank { sym, rank, body } => {
                self.indent();
                let _ = write!(self.out, "truncate_rank<{}>(", rank);
                self.sym(*sym);
                self.out.push(')');
                self.open_body(body);
            }
            StmtNode::Call(call) => {
                self.indent();
                self.out.push_str("call(<stage>, {");
                for (i, sym) in call.inputs.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.sym(*sym);
                }
                self.out.push_str("}, {");
                for (i, sym) in call.outputs.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.sym(*sym);
                }
                self.out.push_str("})\n");
            }
            StmtNode::Copy { src, dst, padding } => {
                self.indent();
                self.out.push_str("copy(");
                self.sym(*src);
                self.out.push_str(" -> ");
                self.sym(*dst);
                if !padding.is_empty() {
                    let _ = write!(self.out, ", padding {:?}", padding);
                }
                self.out.push_str(")\n");
            }
            StmtNode::Check(condition) => {
                self.indent();
                self.out.push_str("check(");
                self.write_expr(condition);
                self.out.push_str(")\n");
            }
        }
    }
}
