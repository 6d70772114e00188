//! Structural substitution, matching, and free-variable analysis.

use std::collections::{HashMap, HashSet};

use crate::interval::{BoxExpr, DimExpr, Interval};
use crate::ir::folder::{self, NodeFolder};
use crate::ir::{Expr, ExprNode, Intrinsic, Stmt, StmtNode, SymbolId};
use crate::scope::SymbolMap;

/// Structural equality. Wildcards are literal here: a wildcard only equals
/// the same wildcard id. Use [`exprs_match`] for pattern matching.
pub fn exprs_equal(a: &Expr, b: &Expr) -> bool {
    if a.same_as(b) {
        return true;
    }
    match (a.node(), b.node()) {
        (None, None) => true,
        (Some(na), Some(nb)) => nodes_equal(na, nb),
        _ => false,
    }
}

fn nodes_equal(a: &ExprNode, b: &ExprNode) -> bool {
    match (a, b) {
        (ExprNode::Variable(x), ExprNode::Variable(y)) => x == y,
        (ExprNode::Wildcard(x), ExprNode::Wildcard(y)) => x == y,
        (ExprNode::Constant(x), ExprNode::Constant(y)) => x == y,
        (
            ExprNode::Let {
                sym: sa,
                value: va,
                body: ba,
            },
            ExprNode::Let {
                sym: sb,
                value: vb,
                body: bb,
            },
        ) => sa == sb && exprs_equal(va, vb) && exprs_equal(ba, bb),
        (
            ExprNode::Binary { op: oa, a: aa, b: ab },
            ExprNode::Binary { op: ob, a: ba, b: bb },
        ) => oa == ob && exprs_equal(aa, ba) && exprs_equal(ab, bb),
        (ExprNode::Not(x), ExprNode::Not(y)) => exprs_equal(x, y),
        (
            ExprNode::Select {
                condition: ca,
                true_value: ta,
                false_value: fa,
            },
            ExprNode::Select {
                condition: cb,
                true_value: tb,
                false_value: fb,
            },
        ) => exprs_equal(ca, cb) && exprs_equal(ta, tb) && exprs_equal(fa, fb),
        (
            ExprNode::Call {
                intrinsic: ia,
                args: aa,
            },
            ExprNode::Call {
                intrinsic: ib,
                args: ab,
            },
        ) => ia == ib && aa.len() == ab.len() && aa.iter().zip(ab.iter()).all(|(x, y)| exprs_equal(x, y)),
        _ => false,
    }
}

/// Structural match with wildcard unification: a wildcard on either side
/// matches any defined expression, and repeated occurrences of the same
/// wildcard id must match equal expressions.
pub fn exprs_match(a: &Expr, b: &Expr) -> bool {
    let mut bindings: HashMap<(bool, SymbolId), Expr> = HashMap::new();
    match_impl(a, b, &mut bindings)
}

fn bind_wildcard(
    side: bool,
    sym: SymbolId,
    matched: &Expr,
    bindings: &mut HashMap<(bool, SymbolId), Expr>,
) -> bool {
    match bindings.get(&(side, sym)) {
        Some(prev) => exprs_equal(prev, matched),
        None => {
            bindings.insert((side, sym), matched.clone());
            true
        }
    }
}

fn match_impl(a: &Expr, b: &Expr, bindings: &mut HashMap<(bool, SymbolId), Expr>) -> bool {
    match (a.node(), b.node()) {
        (None, None) => true,
        (Some(ExprNode::Wildcard(sym)), Some(_)) => bind_wildcard(false, *sym, b, bindings),
        (Some(_), Some(ExprNode::Wildcard(sym))) => bind_wildcard(true, *sym, a, bindings),
        (Some(na), Some(nb)) => match (na, nb) {
            (ExprNode::Variable(x), ExprNode::Variable(y)) => x == y,
            (ExprNode::Constant(x), ExprNode::Constant(y)) => x == y,
            (
                ExprNode::Let {
                    sym: sa,
                    value: va,
                    body: ba,
                },
                ExprNode::Let {
                    sym: sb,
                    value: vb,
                    body: bb,
                },
            ) => sa == sb && match_impl(va, vb, bindings) && match_impl(ba, bb, bindings),
            (
                ExprNode::Binary { op: oa, a: aa, b: ab },
                ExprNode::Binary { op: ob, a: ba, b: bb },
            ) => oa == ob && match_impl(aa, ba, bindings) && match_impl(ab, bb, bindings),
            (ExprNode::Not(x), ExprNode::Not(y)) => match_impl(x, y, bindings),
            (
                ExprNode::Select {
                    condition: ca,
                    true_value: ta,
                    false_value: fa,
                },
                ExprNode::Select {
                    condition: cb,
                    true_value: tb,
                    false_value: fb,
                },
            ) => {
                match_impl(ca, cb, bindings) && match_impl(ta, tb, bindings) && match_impl(fa, fb, bindings)
            }
            (
                ExprNode::Call {
                    intrinsic: ia,
                    args: aa,
                },
                ExprNode::Call {
                    intrinsic: ib,
                    args: ab,
                },
            ) => {
                ia == ib
                    && aa.len() == ab.len()
                    && aa.iter().zip(ab.iter()).all(|(x, y)| match_impl(x, y, bindings))
            }
            _ => false,
        },
        _ => false,
    }
}

/// Free variables of an expression (variables not bound by an enclosing
/// `let` within `e`). Wildcards count too.
pub fn free_vars(e: &Expr) -> HashSet<SymbolId> {
    let mut out = HashSet::new();
    let mut shadow = Vec::new();
    collect_free(e, &mut shadow, &mut out);
    out
}

fn collect_free(e: &Expr, shadow: &mut Vec<SymbolId>, out: &mut HashSet<SymbolId>) {
    match e.node() {
        None => {}
        Some(ExprNode::Variable(sym)) | Some(ExprNode::Wildcard(sym)) => {
            if !shadow.contains(sym) {
                out.insert(*sym);
            }
        }
        Some(ExprNode::Constant(_)) => {}
        Some(ExprNode::Let { sym, value, body }) => {
            collect_free(value, shadow, out);
            shadow.push(*sym);
            collect_free(body, shadow, out);
            shadow.pop();
        }
        Some(ExprNode::Binary { a, b, .. }) => {
            collect_free(a, shadow, out);
            collect_free(b, shadow, out);
        }
        Some(ExprNode::Not(a)) => collect_free(a, shadow, out),
        Some(ExprNode::Select {
            condition,
            true_value,
            false_value,
        }) => {
            collect_free(condition, shadow, out);
            collect_free(true_value, shadow, out);
            collect_free(false_value, shadow, out);
        }
        Some(ExprNode::Call { args, .. }) => {
            for a in args {
                collect_free(a, shadow, out);
            }
        }
    }
}

struct Substitutor<'a> {
    target: &'a Expr,
    replacement: &'a Expr,
    target_frees: HashSet<SymbolId>,
}

impl<'a> Substitutor<'a> {
    fn shadows(&self, sym: SymbolId) -> bool {
        self.target_frees.contains(&sym)
    }
}

impl<'a> NodeFolder for Substitutor<'a> {
    fn fold_expr(&mut self, e: &Expr) -> Expr {
        if e.defined() && exprs_equal(e, self.target) {
            return self.replacement.clone();
        }
        folder::dispatch_expr(self, e)
    }

    fn visit_let(&mut self, sym: SymbolId, value: &Expr, body: &Expr, e: &Expr) -> Expr {
        let new_value = self.fold_expr(value);
        // A binder that re-binds a symbol free in the target shadows it;
        // occurrences inside the body refer to the inner binding.
        let new_body = if self.shadows(sym) { body.clone() } else { self.fold_expr(body) };
        if new_value.same_as(value) && new_body.same_as(body) {
            e.clone()
        } else {
            Expr::let_in(sym, new_value, new_body)
        }
    }

    fn visit_let_stmt(&mut self, sym: SymbolId, value: &Expr, body: &Stmt, s: &Stmt) -> Stmt {
        let new_value = self.fold_expr(value);
        let new_body = if self.shadows(sym) { body.clone() } else { self.fold_stmt(body) };
        if new_value.same_as(value) && new_body.same_as(body) {
            s.clone()
        } else {
            Stmt::let_stmt(sym, new_value, new_body)
        }
    }

    fn visit_loop(
        &mut self,
        sym: SymbolId,
        mode: crate::ir::LoopMode,
        bounds: &Interval,
        step: &Expr,
        body: &Stmt,
        s: &Stmt,
    ) -> Stmt {
        let new_bounds = self.fold_interval(bounds);
        let new_step = self.fold_expr(step);
        let new_body = if self.shadows(sym) { body.clone() } else { self.fold_stmt(body) };
        if new_bounds.same_as(bounds) && new_step.same_as(step) && new_body.same_as(body) {
            s.clone()
        } else {
            Stmt::loop_stmt(sym, mode, new_bounds, new_step, new_body)
        }
    }

    fn visit_allocate(
        &mut self,
        sym: SymbolId,
        storage: crate::ir::MemoryType,
        elem_size: crate::ir::Index,
        dims: &[DimExpr],
        body: &Stmt,
        s: &Stmt,
    ) -> Stmt {
        let new_dims = self.fold_dims(dims);
        let new_body = if self.shadows(sym) { body.clone() } else { self.fold_stmt(body) };
        if new_body.same_as(body) && new_dims.iter().zip(dims.iter()).all(|(x, y)| x.same_as(y)) {
            s.clone()
        } else {
            Stmt::allocate(sym, storage, elem_size, new_dims, new_body)
        }
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
        let new_base = self.fold_expr(base);
        let new_elem_size = self.fold_expr(elem_size);
        let new_dims = self.fold_dims(dims);
        let new_body = if self.shadows(sym) { body.clone() } else { self.fold_stmt(body) };
        if new_base.same_as(base)
            && new_elem_size.same_as(elem_size)
            && new_body.same_as(body)
            && new_dims.iter().zip(dims.iter()).all(|(x, y)| x.same_as(y))
        {
            s.clone()
        } else {
            Stmt::make_buffer(sym, new_base, new_elem_size, new_dims, new_body)
        }
    }
}

/// Replace every occurrence of `target` in `e` with `replacement`,
/// stopping inside binders that re-bind a symbol free in `target`.
pub fn substitute(e: &Expr, target: &Expr, replacement: &Expr) -> Expr {
    let mut sub = Substitutor {
        target,
        replacement,
        target_frees: free_vars(target),
    };
    sub.fold_expr(e)
}

/// Replace occurrences of the variable `sym`.
pub fn substitute_sym(e: &Expr, sym: SymbolId, replacement: &Expr) -> Expr {
    substitute(e, &Expr::var(sym), replacement)
}

pub fn substitute_in_stmt(s: &Stmt, target: &Expr, replacement: &Expr) -> Stmt {
    let mut sub = Substitutor {
        target,
        replacement,
        target_frees: free_vars(target),
    };
    sub.fold_stmt(s)
}

struct BoundsSubstitutor<'a> {
    buf: SymbolId,
    bounds: &'a BoxExpr,
}

impl<'a> NodeFolder for BoundsSubstitutor<'a> {
    fn visit_call(&mut self, intrinsic: Intrinsic, args: &[Expr], e: &Expr) -> Expr {
        if args.len() == 2 && args[0].as_variable() == Some(self.buf) {
            if let Some(d) = args[1].as_constant() {
                if d >= 0 && (d as usize) < self.bounds.len() {
                    let i = &self.bounds[d as usize];
                    match intrinsic {
                        Intrinsic::BufferMin if i.min.defined() => return i.min.clone(),
                        Intrinsic::BufferMax if i.max.defined() => return i.max.clone(),
                        Intrinsic::BufferExtent if i.min.defined() && i.max.defined() => {
                            return i.extent();
                        }
                        _ => {}
                    }
                }
            }
        }
        folder::walk_call(self, intrinsic, args, e)
    }
}

/// Replace `buffer_min(buf, d)` / `buffer_max(buf, d)` / `buffer_extent(buf, d)`
/// with the corresponding known bounds. Strides and fold factors are left
/// alone.
pub fn substitute_bounds(e: &Expr, buf: SymbolId, bounds: &BoxExpr) -> Expr {
    let mut sub = BoundsSubstitutor { buf, bounds };
    sub.fold_expr(e)
}

/// Inline all known buffer bounds into the endpoints of `bounds`.
pub fn substitute_bounds_box(bounds: &mut BoxExpr, buffers: &SymbolMap<BoxExpr>) {
    for (buf, buf_bounds) in buffers.iter() {
        for i in bounds.iter_mut() {
            if i.min.defined() {
                i.min = substitute_bounds(&i.min, buf, buf_bounds);
            }
            if i.max.defined() {
                i.max = substitute_bounds(&i.max, buf, buf_bounds);
            }
        }
    }
}

/// Apply a substitution list to a dims vector until it stops changing.
/// Buffer metadata placeholders can refer to each other, so one pass is
/// not enough.
pub fn substitute_dims(mut dims: Vec<DimExpr>, substitutions: &[(Expr, Expr)]) -> Vec<DimExpr> {
    // The substitution lists built by the passes have replacement sides
    // free of keys, so this terminates; the cap is there for the rest.
    for _ in 0..100 {
        let mut changed = false;
        for dim in dims.iter_mut() {
            let mut new_dim = dim.clone();
            for (k, v) in substitutions {
                new_dim.bounds.min = substitute(&new_dim.bounds.min, k, v);
                new_dim.bounds.max = substitute(&new_dim.bounds.max, k, v);
                new_dim.stride = substitute(&new_dim.stride, k, v);
                new_dim.fold_factor = substitute(&new_dim.fold_factor, k, v);
            }
            if !new_dim.same_as(dim) {
                changed = true;
                *dim = new_dim;
            }
        }
        if !changed {
            break;
        }
    }
    dims
}

// --- depends_on ---

fn expr_uses(e: &Expr, syms: &[SymbolId], shadow: &mut Vec<SymbolId>) -> bool {
    match e.node() {
        None => false,
        Some(ExprNode::Variable(sym)) | Some(ExprNode::Wildcard(sym)) => {
            syms.contains(sym) && !shadow.contains(sym)
        }
        Some(ExprNode::Constant(_)) => false,
        Some(ExprNode::Let { sym, value, body }) => {
            if expr_uses(value, syms, shadow) {
                return true;
            }
            shadow.push(*sym);
            let r = expr_uses(body, syms, shadow);
            shadow.pop();
            r
        }
        Some(ExprNode::Binary { a, b, .. }) => expr_uses(a, syms, shadow) || expr_uses(b, syms, shadow),
        Some(ExprNode::Not(a)) => expr_uses(a, syms, shadow),
        Some(ExprNode::Select {
            condition,
            true_value,
            false_value,
        }) => {
            expr_uses(condition, syms, shadow)
                || expr_uses(true_value, syms, shadow)
                || expr_uses(false_value, syms, shadow)
        }
        Some(ExprNode::Call { args, .. }) => args.iter().any(|a| expr_uses(a, syms, shadow)),
    }
}

fn interval_uses(i: &Interval, syms: &[SymbolId], shadow: &mut Vec<SymbolId>) -> bool {
    expr_uses(&i.min, syms, shadow) || expr_uses(&i.max, syms, shadow)
}

fn dims_use(dims: &[DimExpr], syms: &[SymbolId], shadow: &mut Vec<SymbolId>) -> bool {
    dims.iter().any(|d| {
        interval_uses(&d.bounds, syms, shadow)
            || expr_uses(&d.stride, syms, shadow)
            || expr_uses(&d.fold_factor, syms, shadow)
    })
}

fn sym_used(sym: SymbolId, syms: &[SymbolId], shadow: &[SymbolId]) -> bool {
    syms.contains(&sym) && !shadow.contains(&sym)
}

fn stmt_uses(s: &Stmt, syms: &[SymbolId], shadow: &mut Vec<SymbolId>) -> bool {
    match s.node() {
        None => false,
        Some(StmtNode::LetStmt { sym, value, body }) => {
            if expr_uses(value, syms, shadow) {
                return true;
            }
            shadow.push(*sym);
            let r = stmt_uses(body, syms, shadow);
            shadow.pop();
            r
        }
        Some(StmtNode::Block { a, b }) => stmt_uses(a, syms, shadow) || stmt_uses(b, syms, shadow),
        Some(StmtNode::Loop {
            sym,
            bounds,
            step,
            body,
            ..
        }) => {
            if interval_uses(bounds, syms, shadow) || expr_uses(step, syms, shadow) {
                return true;
            }
            shadow.push(*sym);
            let r = stmt_uses(body, syms, shadow);
            shadow.pop();
            r
        }
        Some(StmtNode::IfThenElse {
            condition,
            then_body,
            else_body,
        }) => {
            expr_uses(condition, syms, shadow)
                || stmt_uses(then_body, syms, shadow)
                || stmt_uses(else_body, syms, shadow)
        }
        Some(StmtNode::Allocate { sym, dims, body, .. }) => {
            // Placeholder dims may query the buffer being allocated, which
            // is the inner binding, not an outer use.
            shadow.push(*sym);
            let r = dims_use(dims, syms, shadow) || stmt_uses(body, syms, shadow);
            shadow.pop();
            r
        }
        Some(StmtNode::MakeBuffer {
            sym,
            base,
            elem_size,
            dims,
            body,
        }) => {
            if expr_uses(base, syms, shadow) || expr_uses(elem_size, syms, shadow) {
                return true;
            }
            shadow.push(*sym);
            let r = dims_use(dims, syms, shadow) || stmt_uses(body, syms, shadow);
            shadow.pop();
            r
        }
        Some(StmtNode::CropBuffer { sym, bounds, body }) => {
            sym_used(*sym, syms, shadow)
                || bounds.iter().any(|i| interval_uses(i, syms, shadow))
                || stmt_uses(body, syms, shadow)
        }
        Some(StmtNode::CropDim { sym, bounds, body, .. }) => {
            sym_used(*sym, syms, shadow) || interval_uses(bounds, syms, shadow) || stmt_uses(body, syms, shadow)
        }
        Some(StmtNode::SliceBuffer { sym, at, body }) => {
            sym_used(*sym, syms, shadow)
                || at.iter().any(|e| expr_uses(e, syms, shadow))
                || stmt_uses(body, syms, shadow)
        }
        Some(StmtNode::SliceDim { sym, at, body, .. }) => {
            sym_used(*sym, syms, shadow) || expr_uses(at, syms, shadow) || stmt_uses(body, syms, shadow)
        }
        Some(StmtNode::TruncateRank { sym, body, .. }) => {
            sym_used(*sym, syms, shadow) || stmt_uses(body, syms, shadow)
        }
        Some(StmtNode::Call(call)) => {
            call.inputs.iter().chain(call.outputs.iter()).any(|sym| sym_used(*sym, syms, shadow))
        }
        Some(StmtNode::Copy { src, dst, .. }) => {
            sym_used(*src, syms, shadow) || sym_used(*dst, syms, shadow)
        }
        Some(StmtNode::Check(condition)) => expr_uses(condition, syms, shadow),
    }
}

/// True iff `e` mentions `sym` outside a shadowing binder.
pub fn expr_depends_on(e: &Expr, sym: SymbolId) -> bool {
    let mut shadow = Vec::new();
    expr_uses(e, &[sym], &mut shadow)
}

pub fn interval_depends_on(i: &Interval, sym: SymbolId) -> bool {
    let mut shadow = Vec::new();
    interval_uses(i, &[sym], &mut shadow)
}

/// True iff `s` references any of `syms`, including as a buffer operand of
/// a call, copy, crop or slice.
pub fn stmt_depends_on(s: &Stmt, syms: &[SymbolId]) -> bool {
    let mut shadow = Vec::new();
    stmt_uses(s, syms, &mut shadow)
}
