//! Folder pattern for traversing and rewriting the IR.
//!
//! Each pass implements [`NodeFolder`] and overrides only the hooks it
//! needs; the `walk_*` functions perform the canonical traversal. Walks
//! rebuild a node only when some child actually changed (`same_as` on
//! every child), so an untouched subtree keeps its identity and sharing.

use crate::interval::{BoxExpr, DimExpr, Interval};
use crate::ir::*;

pub trait NodeFolder: Sized {
    fn fold_expr(&mut self, e: &Expr) -> Expr {
        dispatch_expr(self, e)
    }

    fn fold_stmt(&mut self, s: &Stmt) -> Stmt {
        dispatch_stmt(self, s)
    }

    fn fold_interval(&mut self, i: &Interval) -> Interval {
        Interval {
            min: self.fold_expr(&i.min),
            max: self.fold_expr(&i.max),
        }
    }

    fn fold_box(&mut self, b: &BoxExpr) -> BoxExpr {
        b.iter().map(|i| self.fold_interval(i)).collect()
    }

    fn fold_dims(&mut self, dims: &[DimExpr]) -> Vec<DimExpr> {
        dims.iter()
            .map(|d| DimExpr {
                bounds: self.fold_interval(&d.bounds),
                stride: self.fold_expr(&d.stride),
                fold_factor: self.fold_expr(&d.fold_factor),
            })
            .collect()
    }

    // --- Expressions ---

    fn visit_variable(&mut self, _sym: SymbolId, e: &Expr) -> Expr {
        e.clone()
    }

    fn visit_wildcard(&mut self, _sym: SymbolId, e: &Expr) -> Expr {
        e.clone()
    }

    fn visit_constant(&mut self, _value: Index, e: &Expr) -> Expr {
        e.clone()
    }

    fn visit_let(&mut self, sym: SymbolId, value: &Expr, body: &Expr, e: &Expr) -> Expr {
        walk_let(self, sym, value, body, e)
    }

    fn visit_binary(&mut self, op: BinaryOp, a: &Expr, b: &Expr, e: &Expr) -> Expr {
        walk_binary(self, op, a, b, e)
    }

    fn visit_not(&mut self, a: &Expr, e: &Expr) -> Expr {
        walk_not(self, a, e)
    }

    fn visit_select(&mut self, condition: &Expr, true_value: &Expr, false_value: &Expr, e: &Expr) -> Expr {
        walk_select(self, condition, true_value, false_value, e)
    }

    fn visit_call(&mut self, intrinsic: Intrinsic, args: &[Expr], e: &Expr) -> Expr {
        walk_call(self, intrinsic, args, e)
    }

    // --- Statements ---

    fn visit_let_stmt(&mut self, sym: SymbolId, value: &Expr, body: &Stmt, s: &Stmt) -> Stmt {
        walk_let_stmt(self, sym, value, body, s)
    }

    fn visit_block(&mut self, a: &Stmt, b: &Stmt, s: &Stmt) -> Stmt {
        walk_block(self, a, b, s)
    }

    fn visit_loop(
        &mut self,
        sym: SymbolId,
        mode: LoopMode,
        bounds: &Interval,
        step: &Expr,
        body: &Stmt,
        s: &Stmt,
    ) -> Stmt {
        walk_loop(self, sym, mode, bounds, step, body, s)
    }

    fn visit_if_then_else(&mut self, condition: &Expr, then_body: &Stmt, else_body: &Stmt, s: &Stmt) -> Stmt {
        walk_if_then_else(self, condition, then_body, else_body, s)
    }

    #[allow(clippy::too_many_arguments)]
    fn visit_allocate(
        &mut self,
        sym: SymbolId,
        storage: MemoryType,
        elem_size: Index,
        dims: &[DimExpr],
        body: &Stmt,
        s: &Stmt,
    ) -> Stmt {
        walk_allocate(self, sym, storage, elem_size, dims, body, s)
    }

    fn visit_make_buffer(
        &mut self,
        sym: SymbolId,
        base: &Expr,
        elem_size: &Expr,
        dims: &[DimExpr],
        body: &Stmt,
        s: &Stmt,
    ) -> Stmt {
        walk_make_buffer(self, sym, base, elem_size, dims, body, s)
    }

    fn visit_crop_buffer(&mut self, sym: SymbolId, bounds: &BoxExpr, body: &Stmt, s: &Stmt) -> Stmt {
        walk_crop_buffer(self, sym, bounds, body, s)
    }

    fn visit_crop_dim(&mut self, sym: SymbolId, dim: usize, bounds: &Interval, body: &Stmt, s: &Stmt) -> Stmt {
        walk_crop_dim(self, sym, dim, bounds, body, s)
    }

    fn visit_slice_buffer(&mut self, sym: SymbolId, at: &[Expr], body: &Stmt, s: &Stmt) -> Stmt {
        walk_slice_buffer(self, sym, at, body, s)
    }

    fn visit_slice_dim(&mut self, sym: SymbolId, dim: usize, at: &Expr, body: &Stmt, s: &Stmt) -> Stmt {
        walk_slice_dim(self, sym, dim, at, body, s)
    }

    fn visit_truncate_rank(&mut self, sym: SymbolId, rank: usize, body: &Stmt, s: &Stmt) -> Stmt {
        walk_truncate_rank(self, sym, rank, body, s)
    }

    fn visit_call_stmt(&mut self, _call: &CallStmt, s: &Stmt) -> Stmt {
        s.clone()
    }

    fn visit_copy(&mut self, _src: SymbolId, _dst: SymbolId, _padding: &[u8], s: &Stmt) -> Stmt {
        s.clone()
    }

    fn visit_check(&mut self, condition: &Expr, s: &Stmt) -> Stmt {
        walk_check(self, condition, s)
    }
}

// --- Dispatch ---

pub fn dispatch_expr<F: NodeFolder>(f: &mut F, e: &Expr) -> Expr {
    let node = match e.node() {
        Some(node) => node,
        None => return e.clone(),
    };
    match node {
        ExprNode::Variable(sym) => f.visit_variable(*sym, e),
        ExprNode::Wildcard(sym) => f.visit_wildcard(*sym, e),
        ExprNode::Constant(value) => f.visit_constant(*value, e),
        ExprNode::Let { sym, value, body } => f.visit_let(*sym, value, body, e),
        ExprNode::Binary { op, a, b } => f.visit_binary(*op, a, b, e),
        ExprNode::Not(a) => f.visit_not(a, e),
        ExprNode::Select {
            condition,
            true_value,
            false_value,
        } => f.visit_select(condition, true_value, false_value, e),
        ExprNode::Call { intrinsic, args } => f.visit_call(*intrinsic, args, e),
    }
}

pub fn dispatch_stmt<F: NodeFolder>(f: &mut F, s: &Stmt) -> Stmt {
    let node = match s.node() {
        Some(node) => node,
        None => return s.clone(),
    };
    match node {
        StmtNode::LetStmt { sym, value, body } => f.visit_let_stmt(*sym, value, body, s),
        StmtNode::Block { a, b } => f.visit_block(a, b, s),
        StmtNode::Loop {
            sym,
            mode,
            bounds,
            step,
            body,
        } => f.visit_loop(*sym, *mode, bounds, step, body, s),
        StmtNode::IfThenElse {
            condition,
            then_body,
            else_body,
        } => f.visit_if_then_else(condition, then_body, else_body, s),
        StmtNode::Allocate {
            sym,
            storage,
            elem_size,
            dims,
            body,
        } => f.visit_allocate(*sym, *storage, *elem_size, dims, body, s),
        StmtNode::MakeBuffer {
            sym,
            base,
            elem_size,
            dims,
            body,
        } => f.visit_make_buffer(*sym, base, elem_size, dims, body, s),
        StmtNode::CropBuffer { sym, bounds, body } => f.visit_crop_buffer(*sym, bounds, body, s),
        StmtNode::CropDim {
            sym,
            dim,
            bounds,
            body,
        } => f.visit_crop_dim(*sym, *dim, bounds, body, s),
        StmtNode::SliceBuffer { sym, at, body } => f.visit_slice_buffer(*sym, at, body, s),
        StmtNode::SliceDim { sym, dim, at, body } => f.visit_slice_dim(*sym, *dim, at, body, s),
        StmtNode::TruncateRank { sym, rank, body } => f.visit_truncate_rank(*sym, *rank, body, s),
        StmtNode::Call(call) => f.visit_call_stmt(call, s),
        StmtNode::Copy { src, dst, padding } => f.visit_copy(*src, *dst, padding, s),
        StmtNode::Check(condition) => f.visit_check(condition, s),
    }
}

// --- Walks: canonical traversal, rebuilding only on change ---

fn interval_same(a: &Interval, b: &Interval) -> bool {
    a.same_as(b)
}

fn box_same(a: &BoxExpr, b: &BoxExpr) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.same_as(y))
}

fn dims_same(a: &[DimExpr], b: &[DimExpr]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.same_as(y))
}

fn exprs_same(a: &[Expr], b: &[Expr]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.same_as(y))
}

pub fn walk_let<F: NodeFolder>(f: &mut F, sym: SymbolId, value: &Expr, body: &Expr, e: &Expr) -> Expr {
    let new_value = f.fold_expr(value);
    let new_body = f.fold_expr(body);
    if new_value.same_as(value) && new_body.same_as(body) {
        e.clone()
    } else {
        Expr::let_in(sym, new_value, new_body)
    }
}

pub fn walk_binary<F: NodeFolder>(f: &mut F, op: BinaryOp, a: &Expr, b: &Expr, e: &Expr) -> Expr {
    let new_a = f.fold_expr(a);
    let new_b = f.fold_expr(b);
    if new_a.same_as(a) && new_b.same_as(b) {
        e.clone()
    } else {
        Expr::binary(op, new_a, new_b)
    }
}

pub fn walk_not<F: NodeFolder>(f: &mut F, a: &Expr, e: &Expr) -> Expr {
    let new_a = f.fold_expr(a);
    if new_a.same_as(a) {
        e.clone()
    } else {
        Expr::not(new_a)
    }
}

pub fn walk_select<F: NodeFolder>(
    f: &mut F,
    condition: &Expr,
    true_value: &Expr,
    false_value: &Expr,
    e: &Expr,
) -> Expr {
    let new_c = f.fold_expr(condition);
    let new_t = f.fold_expr(true_value);
    let new_f = f.fold_expr(false_value);
    if new_c.same_as(condition) && new_t.same_as(true_value) && new_f.same_as(false_value) {
        e.clone()
    } else {
        Expr::select(new_c, new_t, new_f)
    }
}

pub fn walk_call<F: NodeFolder>(f: &mut F, intrinsic: Intrinsic, args: &[Expr], e: &Expr) -> Expr {
    let new_args: Vec<Expr> = args.iter().map(|a| f.fold_expr(a)).collect();
    if exprs_same(&new_args, args) {
        e.clone()
    } else {
        Expr::call(intrinsic, new_args)
    }
}

pub fn walk_let_stmt<F: NodeFolder>(f: &mut F, sym: SymbolId, value: &Expr, body: &Stmt, s: &Stmt) -> Stmt {
    let new_value = f.fold_expr(value);
    let new_body = f.fold_stmt(body);
    if new_value.same_as(value) && new_body.same_as(body) {
        s.clone()
    } else {
        Stmt::let_stmt(sym, new_value, new_body)
    }
}

pub fn walk_block<F: NodeFolder>(f: &mut F, a: &Stmt, b: &Stmt, s: &Stmt) -> Stmt {
    let new_a = f.fold_stmt(a);
    let new_b = f.fold_stmt(b);
    if new_a.same_as(a) && new_b.same_as(b) {
        s.clone()
    } else {
        Stmt::block(new_a, new_b)
    }
}

pub fn walk_loop<F: NodeFolder>(
    f: &mut F,
    sym: SymbolId,
    mode: LoopMode,
    bounds: &Interval,
    step: &Expr,
    body: &Stmt,
    s: &Stmt,
) -> Stmt {
    let new_bounds = f.fold_interval(bounds);
    let new_step = f.fold_expr(step);
    let new_body = f.fold_stmt(body);
    if interval_same(&new_bounds, bounds) && new_step.same_as(step) && new_body.same_as(body) {
        s.clone()
    } else {
        Stmt::loop_stmt(sym, mode, new_bounds, new_step, new_body)
    }
}

pub fn walk_if_then_else<F: NodeFolder>(
    f: &mut F,
    condition: &Expr,
    then_body: &Stmt,
    else_body: &Stmt,
    s: &Stmt,
) -> Stmt {
    let new_c = f.fold_expr(condition);
    let new_t = f.fold_stmt(then_body);
    let new_e = f.fold_stmt(else_body);
    if new_c.same_as(condition) && new_t.same_as(then_body) && new_e.same_as(else_body) {
        s.clone()
    } else {
        Stmt::if_then_else(new_c, new_t, new_e)
    }
}

#[allow(clippy::too_many_arguments)]
pub fn walk_allocate<F: NodeFolder>(
    f: &mut F,
    sym: SymbolId,
    storage: MemoryType,
    elem_size: Index,
    dims: &[DimExpr],
    body: &Stmt,
    s: &Stmt,
) -> Stmt {
    let new_dims = f.fold_dims(dims);
    let new_body = f.fold_stmt(body);
    if dims_same(&new_dims, dims) && new_body.same_as(body) {
        s.clone()
    } else {
        Stmt::allocate(sym, storage, elem_size, new_dims, new_body)
    }
}

#[allow(clippy::too_many_arguments)]
pub fn walk_make_buffer<F: NodeFolder>(
    f: &mut F,
    sym: SymbolId,
    base: &Expr,
    elem_size: &Expr,
    dims: &[DimExpr],
    body: &Stmt,
    s: &Stmt,
) -> Stmt {
    let new_base = f.fold_expr(base);
    let new_elem_size = f.fold_expr(elem_size);
    let new_dims = f.fold_dims(dims);
    let new_body = f.fold_stmt(body);
    if new_base.same_as(base)
        && new_elem_size.same_as(elem_size)
        && dims_same(&new_dims, dims)
        && new_body.same_as(body)
    {
        s.clone()
    } else {
        Stmt::make_buffer(sym, new_base, new_elem_size, new_dims, new_body)
    }
}

pub fn walk_crop_buffer<F: NodeFolder>(f: &mut F, sym: SymbolId, bounds: &BoxExpr, body: &Stmt, s: &Stmt) -> Stmt {
    let new_bounds = f.fold_box(bounds);
    let new_body = f.fold_stmt(body);
    if box_same(&new_bounds, bounds) && new_body.same_as(body) {
        s.clone()
    } else {
        Stmt::crop_buffer(sym, new_bounds, new_body)
    }
}

pub fn walk_crop_dim<F: NodeFolder>(
    f: &mut F,
    sym: SymbolId,
    dim: usize,
    bounds: &Interval,
    body: &Stmt,
    s: &Stmt,
) -> Stmt {
    let new_bounds = f.fold_interval(bounds);
    let new_body = f.fold_stmt(body);
    if interval_same(&new_bounds, bounds) && new_body.same_as(body) {
        s.clone()
    } else {
        Stmt::crop_dim(sym, dim, new_bounds, new_body)
    }
}

pub fn walk_slice_buffer<F: NodeFolder>(f: &mut F, sym: SymbolId, at: &[Expr], body: &Stmt, s: &Stmt) -> Stmt {
    let new_at: Vec<Expr> = at.iter().map(|e| f.fold_expr(e)).collect();
    let new_body = f.fold_stmt(body);
    if exprs_same(&new_at, at) && new_body.same_as(body) {
        s.clone()
    } else {
        Stmt::slice_buffer(sym, new_at, new_body)
    }
}

pub fn walk_slice_dim<F: NodeFolder>(
    f: &mut F,
    sym: SymbolId,
    dim: usize,
    at: &Expr,
    body: &Stmt,
    s: &Stmt,
) -> Stmt {
    let new_at = f.fold_expr(at);
    let new_body = f.fold_stmt(body);
    if new_at.same_as(at) && new_body.same_as(body) {
        s.clone()
    } else {
        Stmt::slice_dim(sym, dim, new_at, new_body)
    }
}

pub fn walk_truncate_rank<F: NodeFolder>(f: &mut F, sym: SymbolId, rank: usize, body: &Stmt, s: &Stmt) -> Stmt {
    let new_body = f.fold_stmt(body);
    if new_body.same_as(body) {
        s.clone()
    } else {
        Stmt::truncate_rank(sym, rank, new_body)
    }
}

pub fn walk_check<F: NodeFolder>(f: &mut F, condition: &Expr, s: &Stmt) -> Stmt {
    let new_c = f.fold_expr(condition);
    if new_c.same_as(condition) {
        s.clone()
    } else {
        Stmt::check(new_c)
    }
}
