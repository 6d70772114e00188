//! Sliding window and storage folding.
//!
//! Runs after bounds inference, before simplification: the demand
//! expressions must still be phrased in terms of the crops between
//! stages. For each producer inside a serial loop, the demand of the
//! previous iteration is compared against the current one:
//!
//! - disjoint: nothing carries over, but storage can fold to one
//!   iteration's extent;
//! - overlapping and monotonically increasing: the producer is rewritten
//!   to compute only the new region each iteration (warming up on the
//!   first), and storage folds to the stepped extent.
//!
//! Parallel loops are skipped entirely: iteration `i` may not observe
//! iteration `i-1`'s output there.

use log::debug;

use crate::interval::{merge_crop, merge_crop_dim, BoxExpr, DimExpr, Interval};
use crate::ir::folder::{self, NodeFolder};
use crate::ir::{
    self, align_up, buffer_fold_factor, is_negative_infinity, is_positive_infinity, positive_infinity,
    CallStmt, Expr, Index, LoopMode, MemoryType, NodeContext, Stmt, SymbolId,
};
use crate::scope::SymbolMap;
use crate::simplify::{bounds_of, prove_true, simplify, where_true};
use crate::substitute::{
    expr_depends_on, interval_depends_on, stmt_depends_on, substitute, substitute_bounds_box,
    substitute_dims, substitute_sym,
};

struct LoopInfo {
    sym: SymbolId,
    /// Fresh symbol standing for the loop's original minimum during
    /// analysis; warm-up rewrites guard on it.
    orig_min: SymbolId,
    bounds: Interval,
    step: Expr,
}

struct SlideAndFold<'ctx> {
    ctx: &'ctx mut NodeContext,
    /// Known required box per buffer, from allocations and crops,
    /// narrowed further by slides discovered below.
    buffer_bounds: SymbolMap<BoxExpr>,
    /// At most one folded dimension per buffer, with its factor.
    fold_factors: SymbolMap<(usize, Expr)>,
    /// Enclosing serial loops, outermost first.
    loops: Vec<LoopInfo>,
    /// Solver unknown for warm-up equations.
    x: SymbolId,
}

impl<'ctx> SlideAndFold<'ctx> {
    fn new(ctx: &'ctx mut NodeContext) -> Self {
        let x = ctx.insert_unique("_x");
        SlideAndFold {
            ctx,
            buffer_bounds: SymbolMap::new(),
            fold_factors: SymbolMap::new(),
            loops: Vec::new(),
            x,
        }
    }

    fn analyze_outputs(&mut self, outputs: &[SymbolId]) {
        for &output in outputs {
            if self.buffer_bounds.get(output).is_none() {
                continue;
            }
            self.analyze_output(output);
        }
    }

    fn analyze_output(&mut self, output: SymbolId) {
        'loops: for l in 0..self.loops.len() {
            let loop_sym = self.loops[l].sym;
            let loop_var = Expr::var(loop_sym);
            let loop_max = self.loops[l].bounds.max.clone();
            let loop_min = self.loops[l].bounds.min.clone();
            let loop_step = self.loops[l].step.clone();
            let orig_min = self.loops[l].orig_min;

            // min(loop_max, x) terms block the proofs below even though x
            // is bounded by the loop; substituting infinity for the loop
            // max lets them simplify away.
            let ignore_loop_max =
                |e: &Expr| -> Expr { substitute(e, &loop_max, &positive_infinity()) };

            let rank = match self.buffer_bounds.get(output) {
                Some(b) => b.len(),
                None => return,
            };
            for d in 0..rank {
                let cur_bounds = match self.buffer_bounds.get(output) {
                    Some(b) => b[d].clone(),
                    None => return,
                };
                if !cur_bounds.min.defined() || !cur_bounds.max.defined() {
                    continue;
                }
                if !interval_depends_on(&cur_bounds, loop_sym) {
                    // The stage recomputes this region identically every
                    // iteration; folding or sliding gains nothing here.
                    continue;
                }

                let prev_var = loop_var.clone() - loop_step.clone();
                let prev_bounds = Interval::new(
                    substitute_sym(&cur_bounds.min, loop_sym, &prev_var),
                    substitute_sym(&cur_bounds.max, loop_sym, &prev_var),
                );

                // Simplify before bounding: interval arithmetic cannot
                // cancel the loop variable out of the extent on its own.
                let extent = simplify(&ignore_loop_max(&cur_bounds.extent()));

                let overlap = prev_bounds.intersection(&cur_bounds);
                if prove_true(&ignore_loop_max(&overlap.empty())) {
                    // Iterations are disjoint: no reuse, but the storage
                    // folds to one iteration's extent.
                    let fold = simplify(&bounds_of(&extent, &SymbolMap::new()).max);
                    if !expr_depends_on(&fold, loop_sym) {
                        debug!("folding <{}> dim {} by {}", output.0, d, fold);
                        self.fold_factors.insert(output, (d, fold));
                    }
                    continue;
                }

                let monotonic_increasing = ir::and(
                    ir::le(prev_bounds.min.clone(), cur_bounds.min.clone()),
                    ir::le(prev_bounds.max.clone(), cur_bounds.max.clone()),
                );
                let monotonic_decreasing = ir::and(
                    ir::le(cur_bounds.min.clone(), prev_bounds.min.clone()),
                    ir::le(cur_bounds.max.clone(), prev_bounds.max.clone()),
                );
                if prove_true(&ignore_loop_max(&monotonic_increasing)) {
                    // Overlapping and moving forward: compute only the
                    // newly required region each iteration.
                    let old_min = cur_bounds.min.clone();
                    let new_min = simplify(&(prev_bounds.max.clone() + 1));

                    let fold = simplify(&bounds_of(&extent, &SymbolMap::new()).max);
                    if !expr_depends_on(&fold, loop_sym) {
                        // Aligned to the step so a crop never straddles a
                        // folding boundary.
                        let fold = simplify(&align_up(fold, loop_step.clone()));
                        debug!("sliding <{}> dim {}, fold {}", output.0, d, fold);
                        self.fold_factors.insert(output, (d, fold));
                    }

                    // The first iterations must cover the whole region the
                    // sliding tail no longer recomputes. Moving the loop
                    // min back does that without touching the body.
                    let new_min_at_x = substitute_sym(&new_min, loop_sym, &Expr::var(self.x));
                    let old_min_at_loop_min = substitute_sym(&old_min, loop_sym, &loop_min);
                    let new_loop_min = where_true(
                        &ignore_loop_max(&ir::le(new_min_at_x, old_min_at_loop_min)),
                        self.x,
                    )
                    .max;
                    let new_bounds_min = if !is_negative_infinity(&new_loop_min) {
                        self.loops[l].bounds.min = new_loop_min;
                        new_min
                    } else {
                        // No closed-form warm-up start; guard the first
                        // iteration instead.
                        Expr::select(
                            ir::eq(loop_var.clone(), Expr::var(orig_min)),
                            old_min,
                            new_min,
                        )
                    };
                    if let Some(bounds) = self.buffer_bounds.get_mut(output) {
                        bounds[d].min = new_bounds_min;
                    }
                    // One slide per producer.
                    break 'loops;
                } else if prove_true(&ignore_loop_max(&monotonic_decreasing)) {
                    // Decreasing demands slide too in principle; nothing
                    // rewrites them yet.
                    continue;
                }
            }
        }
    }
}

impl<'ctx> NodeFolder for SlideAndFold<'ctx> {
    fn visit_allocate(
        &mut self,
        sym: SymbolId,
        storage: MemoryType,
        elem_size: Index,
        dims: &[DimExpr],
        body: &Stmt,
        _s: &Stmt,
    ) -> Stmt {
        let bounds: BoxExpr = dims.iter().map(|d| d.bounds.clone()).collect();
        let old = self.buffer_bounds.set(sym, Some(bounds));
        let body = self.fold_stmt(body);
        self.buffer_bounds.set(sym, old);

        // Resolve fold factor placeholders: the folded dimension gets its
        // factor, every other dimension reads as infinite and then
        // becomes unfolded.
        let fold_info = self.fold_factors.get(sym).cloned();
        let alloc_var = Expr::var(sym);
        let mut replacements: Vec<(Expr, Expr)> = Vec::new();
        for d in 0..dims.len() {
            let value = match &fold_info {
                Some((fold_dim, factor)) if *fold_dim == d => factor.clone(),
                _ => positive_infinity(),
            };
            replacements.push((buffer_fold_factor(alloc_var.clone(), d), value));
        }
        let mut new_dims = substitute_dims(dims.to_vec(), &replacements);
        for d in new_dims.iter_mut() {
            d.bounds.min = simplify(&d.bounds.min);
            d.bounds.max = simplify(&d.bounds.max);
            d.stride = simplify(&d.stride);
            d.fold_factor = simplify(&d.fold_factor);
            if is_positive_infinity(&d.fold_factor) {
                d.fold_factor = Expr::undefined();
            }
        }
        Stmt::allocate(sym, storage, elem_size, new_dims, body)
    }

    fn visit_call_stmt(&mut self, call: &CallStmt, s: &Stmt) -> Stmt {
        self.analyze_outputs(&call.outputs);
        s.clone()
    }

    fn visit_copy(&mut self, _src: SymbolId, dst: SymbolId, _padding: &[u8], s: &Stmt) -> Stmt {
        self.analyze_outputs(&[dst]);
        s.clone()
    }

    fn visit_crop_buffer(&mut self, sym: SymbolId, bounds: &BoxExpr, body: &Stmt, s: &Stmt) -> Stmt {
        let _ = s;
        let mut merged = self.buffer_bounds.get(sym).cloned().unwrap_or_default();
        merge_crop(&mut merged, bounds);
        substitute_bounds_box(&mut merged, &self.buffer_bounds);
        let old = self.buffer_bounds.set(sym, Some(merged));
        let new_body = self.fold_stmt(body);
        // Sliding may have narrowed the bounds below; the crop is
        // re-emitted from the map so producers see the narrowed region.
        let new_bounds = self.buffer_bounds.set(sym, old).unwrap_or_else(|| bounds.clone());
        Stmt::crop_buffer(sym, new_bounds, new_body)
    }

    fn visit_crop_dim(&mut self, sym: SymbolId, dim: usize, bounds: &Interval, body: &Stmt, s: &Stmt) -> Stmt {
        let mut merged = self.buffer_bounds.get(sym).cloned().unwrap_or_default();
        merge_crop_dim(&mut merged, dim, bounds);
        substitute_bounds_box(&mut merged, &self.buffer_bounds);
        let old = self.buffer_bounds.set(sym, Some(merged));
        let new_body = self.fold_stmt(body);
        let new_bounds = self.buffer_bounds.set(sym, old);
        let new_dim_bounds = match &new_bounds {
            Some(b) if dim < b.len() => b[dim].clone(),
            _ => bounds.clone(),
        };
        if new_body.same_as(body) && new_dim_bounds.same_as(bounds) {
            s.clone()
        } else {
            Stmt::crop_dim(sym, dim, new_dim_bounds, new_body)
        }
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
        if mode == LoopMode::Parallel {
            // No iteration order to slide along.
            return folder::walk_loop(self, sym, mode, bounds, step, body, s);
        }

        let loop_name = self.ctx.name(sym);
        let orig_min = self.ctx.insert_unique(&format!("{}.min_orig", loop_name));
        let orig_min_var = Expr::var(orig_min);
        self.loops.push(LoopInfo {
            sym,
            orig_min,
            bounds: Interval::new(orig_min_var.clone(), bounds.max.clone()),
            step: step.clone(),
        });
        let new_body = self.fold_stmt(body);
        let info = self.loops.pop().expect("loop stack underflow");

        let min_changed = !info.bounds.min.same_as(&orig_min_var);
        if min_changed || stmt_depends_on(&new_body, &[orig_min]) {
            // The loop min was rewritten or the body guards on it; keep
            // the original min around under the fresh name.
            let new_min = if min_changed { info.bounds.min } else { bounds.min.clone() };
            let looped = Stmt::loop_stmt(
                sym,
                mode,
                Interval::new(new_min, bounds.max.clone()),
                step.clone(),
                new_body,
            );
            Stmt::let_stmt(orig_min, bounds.min.clone(), looped)
        } else if new_body.same_as(body) {
            s.clone()
        } else {
            Stmt::loop_stmt(sym, mode, bounds.clone(), step.clone(), new_body)
        }
    }

    fn visit_block(&mut self, a: &Stmt, b: &Stmt, s: &Stmt) -> Stmt {
        // Reverse order: consumers come after producers in the tree, and
        // a producer's analysis needs its consumers' demands recorded
        // first.
        let new_b = self.fold_stmt(b);
        let new_a = self.fold_stmt(a);
        if new_a.same_as(a) && new_b.same_as(b) {
            s.clone()
        } else {
            Stmt::block(new_a, new_b)
        }
    }
}

/// Apply sliding-window and storage-folding rewrites to `s`.
pub fn slide_and_fold(s: &Stmt, ctx: &mut NodeContext) -> Stmt {
    SlideAndFold::new(ctx).fold_stmt(s)
}
