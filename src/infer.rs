//! Backward bounds inference.
//!
//! The builder leaves every producer wrapped in crops whose bounds are
//! symbolic expressions of its consumer's buffer metadata, and every
//! allocation with self-referential `buffer_*` placeholder dims. This
//! pass walks the tree propagating consumer demands backwards: calls
//! record the in-scope crop of each consumed buffer as its demand, loops
//! project their variable out of any demand that mentions it, and
//! allocations resolve their placeholder dims against the accumulated
//! demand. Checks that the pipeline's inputs are large enough are emitted
//! at the top of the tree.

use log::debug;

use crate::interval::{merge_crop, merge_crop_dim, union_boxes, BoxExpr, DimExpr, Interval};
use crate::ir::folder::{self, NodeFolder};
use crate::ir::{
    self, buffer_extent, buffer_fold_factor, buffer_max, buffer_min, buffer_stride, CallStmt, Expr, Index,
    LoopMode, MemoryType, Stmt, SymbolId,
};
use crate::scope::SymbolMap;
use crate::simplify::simplify;
use crate::substitute::{
    expr_depends_on, substitute, substitute_dims, substitute_sym,
};

struct BoundsInferrer {
    /// Demand being accumulated per buffer: pipeline inputs and every
    /// allocation in scope.
    infer: SymbolMap<BoxExpr>,
    /// Current in-scope crop per buffer.
    crops: SymbolMap<BoxExpr>,
}

impl BoundsInferrer {
    fn record_demand(&mut self, sym: SymbolId) {
        if !self.infer.contains(sym) {
            return;
        }
        // No crop in scope leaves the demand untouched; the builder's
        // contract is that every consumed buffer is under one.
        let crop = match self.crops.get(sym) {
            Some(crop) => crop.clone(),
            None => return,
        };
        if let Some(demand) = self.infer.get_mut(sym) {
            union_boxes(demand, &crop);
        }
    }
}

impl NodeFolder for BoundsInferrer {
    fn visit_allocate(
        &mut self,
        sym: SymbolId,
        storage: MemoryType,
        elem_size: Index,
        dims: &[DimExpr],
        body: &Stmt,
        _s: &Stmt,
    ) -> Stmt {
        let old = self.infer.set(sym, Some(BoxExpr::new()));
        let body = self.fold_stmt(body);
        let bounds = self.infer.set(sym, old).unwrap_or_default();

        // The builder set the dims to buffer_* queries of the buffer
        // itself. Substituting the inferred bounds resolves them, and
        // honors user-adjusted dims (padding an extent, say) by rewriting
        // only the queries inside the adjusted expression.
        let alloc_var = Expr::var(sym);
        let mut substitutions: Vec<(Expr, Expr)> = Vec::new();
        let mut stride: Expr = Expr::constant(elem_size);
        for (d, bounds_d) in bounds.iter().enumerate() {
            substitutions.push((buffer_min(alloc_var.clone(), d), bounds_d.min.clone()));
            substitutions.push((buffer_max(alloc_var.clone(), d), bounds_d.max.clone()));
            substitutions.push((buffer_stride(alloc_var.clone(), d), stride.clone()));
            let extent = simplify(&bounds_d.extent());
            substitutions.push((buffer_extent(alloc_var.clone(), d), extent.clone()));
            stride = stride * ir::min(extent, buffer_fold_factor(alloc_var.clone(), d));
        }
        let new_dims = substitute_dims(dims.to_vec(), &substitutions);

        // Dims the user overrode must still cover the inferred demand.
        let mut checks = Vec::new();
        for (d, dim) in new_dims.iter().enumerate() {
            if d >= bounds.len() {
                continue;
            }
            if !dim.bounds.min.same_as(&bounds[d].min) {
                checks.push(Stmt::check(ir::le(dim.bounds.min.clone(), bounds[d].min.clone())));
            }
            if !dim.bounds.max.same_as(&bounds[d].max) {
                checks.push(Stmt::check(ir::le(bounds[d].max.clone(), dim.bounds.max.clone())));
            }
        }

        // Allocation bounds flow outward into any demand still being
        // accumulated for other buffers.
        for (_, outstanding) in self.infer.iter_mut() {
            for i in outstanding.iter_mut() {
                for (k, v) in &substitutions {
                    if i.min.defined() {
                        i.min = substitute(&i.min, k, v);
                    }
                    if i.max.defined() {
                        i.max = substitute(&i.max, k, v);
                    }
                }
            }
        }

        debug!(
            "inferred allocation of <{}>: {} dims",
            sym.0,
            new_dims.len()
        );
        let alloc = Stmt::allocate(sym, storage, elem_size, new_dims, body);
        Stmt::block(Stmt::block_of(checks), alloc)
    }

    fn visit_call_stmt(&mut self, call: &CallStmt, s: &Stmt) -> Stmt {
        for sym in &call.inputs {
            self.record_demand(*sym);
        }
        s.clone()
    }

    fn visit_copy(&mut self, src: SymbolId, _dst: SymbolId, _padding: &[u8], s: &Stmt) -> Stmt {
        self.record_demand(src);
        s.clone()
    }

    fn visit_crop_buffer(&mut self, sym: SymbolId, bounds: &BoxExpr, body: &Stmt, s: &Stmt) -> Stmt {
        let mut crop = self.crops.get(sym).cloned().unwrap_or_default();
        merge_crop(&mut crop, bounds);
        let old = self.crops.set(sym, Some(crop));
        let result = folder::walk_crop_buffer(self, sym, bounds, body, s);
        self.crops.set(sym, old);
        result
    }

    fn visit_crop_dim(&mut self, sym: SymbolId, dim: usize, bounds: &Interval, body: &Stmt, s: &Stmt) -> Stmt {
        let mut crop = self.crops.get(sym).cloned().unwrap_or_default();
        merge_crop_dim(&mut crop, dim, bounds);
        let old = self.crops.set(sym, Some(crop));
        let result = folder::walk_crop_dim(self, sym, dim, bounds, body, s);
        self.crops.set(sym, old);
        result
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
        let new_body = self.fold_stmt(body);
        let mut result = if new_body.same_as(body) {
            s.clone()
        } else {
            Stmt::loop_stmt(sym, mode, bounds.clone(), step.clone(), new_body)
        };

        // Leaving the loop: demands that mention the loop variable are
        // projected onto the loop bounds, and each such buffer's union
        // demand is declared with a crop around the loop, so its producer
        // inside sees everything downstream needs.
        for buf in self.infer.keys() {
            let mut projected = match self.infer.get(buf) {
                Some(b) => b.clone(),
                None => continue,
            };
            let mut mentions_loop = false;
            for i in projected.iter_mut() {
                // min > max demands exist when a pipeline flips a
                // dimension, so both endpoints project through both loop
                // ends.
                if i.min.defined() && expr_depends_on(&i.min, sym) {
                    mentions_loop = true;
                    i.min = simplify(&ir::min(
                        substitute_sym(&i.min, sym, &bounds.min),
                        substitute_sym(&i.min, sym, &bounds.max),
                    ));
                }
                if i.max.defined() && expr_depends_on(&i.max, sym) {
                    mentions_loop = true;
                    i.max = simplify(&ir::max(
                        substitute_sym(&i.max, sym, &bounds.min),
                        substitute_sym(&i.max, sym, &bounds.max),
                    ));
                }
            }
            if mentions_loop {
                self.infer.set(buf, Some(projected.clone()));
                result = Stmt::crop_buffer(buf, projected, result);
            }
        }
        result
    }
}

/// Infer bounds through `s` and prepend sufficiency checks for the
/// pipeline's input buffers.
pub fn infer_bounds(s: &Stmt, inputs: &[SymbolId]) -> Stmt {
    let mut pass = BoundsInferrer {
        infer: SymbolMap::new(),
        crops: SymbolMap::new(),
    };
    for &i in inputs {
        pass.infer.insert(i, BoxExpr::new());
    }
    let result = pass.fold_stmt(s);

    let mut checks = Vec::new();
    for &i in inputs {
        let buf_var = Expr::var(i);
        let bounds = match pass.infer.get(i) {
            Some(b) => b,
            None => continue,
        };
        for (d, bounds_d) in bounds.iter().enumerate() {
            if bounds_d.min.defined() {
                checks.push(Stmt::check(ir::le(
                    buffer_min(buf_var.clone(), d),
                    bounds_d.min.clone(),
                )));
            }
            if bounds_d.max.defined() {
                checks.push(Stmt::check(ir::le(
                    bounds_d.max.clone(),
                    buffer_max(buf_var.clone(), d),
                )));
            }
            if bounds_d.min.defined() && bounds_d.max.defined() {
                checks.push(Stmt::check(ir::le(
                    simplify(&bounds_d.extent()),
                    buffer_fold_factor(buf_var.clone(), d),
                )));
            }
        }
    }
    Stmt::block(Stmt::block_of(checks), result)
}
