//! Post-inference cleanup passes: dead input-crop removal, scope
//! reduction, buffer aliasing, and the copy optimization hook.

use std::collections::BTreeSet;

use log::debug;

use crate::interval::{merge_crop, merge_crop_dim, BoxExpr, DimExpr, Interval};
use crate::ir::folder::{self, NodeFolder};
use crate::ir::{
    buffer_max, buffer_min, CallStmt, Expr, Index, MemoryType, Stmt, StmtNode, SymbolId,
};
use crate::scope::SymbolMap;
use crate::substitute::{exprs_match, stmt_depends_on};

// --- Input crop removal ---

// After inference, crops on buffers that are never produced beneath them
// carry no information: the consumer reads whatever the caller provided,
// and the sufficiency checks already guard the region.
struct InputCropRemover {
    used_as_output: SymbolMap<bool>,
}

impl InputCropRemover {
    fn visit_crop<F>(&mut self, sym: SymbolId, body: &Stmt, s: &Stmt, rebuild: F) -> Stmt
    where
        F: FnOnce(Stmt) -> Stmt,
    {
        let old = self.used_as_output.set(sym, Some(false));
        let new_body = self.fold_stmt(body);
        let used = matches!(self.used_as_output.get(sym), Some(true));
        if !used {
            self.used_as_output.set(sym, old);
            return new_body;
        }
        // The buffer is produced below, so the enclosing crops see it as
        // an output too.
        self.used_as_output.set(sym, Some(true));
        if new_body.same_as(body) {
            s.clone()
        } else {
            rebuild(new_body)
        }
    }
}

impl NodeFolder for InputCropRemover {
    fn visit_call_stmt(&mut self, call: &CallStmt, s: &Stmt) -> Stmt {
        for sym in &call.outputs {
            self.used_as_output.insert(*sym, true);
        }
        s.clone()
    }

    fn visit_copy(&mut self, _src: SymbolId, dst: SymbolId, _padding: &[u8], s: &Stmt) -> Stmt {
        self.used_as_output.insert(dst, true);
        s.clone()
    }

    fn visit_crop_buffer(&mut self, sym: SymbolId, bounds: &BoxExpr, body: &Stmt, s: &Stmt) -> Stmt {
        let bounds = bounds.clone();
        self.visit_crop(sym, body, s, move |b| Stmt::crop_buffer(sym, bounds, b))
    }

    fn visit_crop_dim(&mut self, sym: SymbolId, dim: usize, bounds: &Interval, body: &Stmt, s: &Stmt) -> Stmt {
        let bounds = bounds.clone();
        self.visit_crop(sym, body, s, move |b| Stmt::crop_dim(sym, dim, bounds, b))
    }
}

/// Drop crops of buffers that are not used as an output beneath them.
pub fn remove_input_crops(s: &Stmt) -> Stmt {
    InputCropRemover {
        used_as_output: SymbolMap::new(),
    }
    .fold_stmt(s)
}

// --- Scope reduction ---

fn for_each_stmt_forward(s: &Stmt, f: &mut impl FnMut(&Stmt)) {
    if let Some(StmtNode::Block { a, b }) = s.node() {
        for_each_stmt_forward(a, f);
        for_each_stmt_forward(b, f);
    } else if s.defined() {
        f(s);
    }
}

fn for_each_stmt_backward(s: &Stmt, f: &mut impl FnMut(&Stmt)) {
    if let Some(StmtNode::Block { a, b }) = s.node() {
        for_each_stmt_backward(b, f);
        for_each_stmt_backward(a, f);
    } else if s.defined() {
        f(s);
    }
}

// Split a block spine into the prefix independent of `syms`, the part
// that needs the scope, and the independent suffix.
fn split_body(body: &Stmt, syms: &[SymbolId]) -> (Stmt, Stmt, Stmt) {
    let mut before = Stmt::undefined();
    let mut body_and_after = Stmt::undefined();
    let mut depended = false;
    for_each_stmt_forward(body, &mut |s| {
        if depended || stmt_depends_on(s, syms) {
            depended = true;
            body_and_after = Stmt::block(body_and_after.clone(), s.clone());
        } else {
            before = Stmt::block(before.clone(), s.clone());
        }
    });

    let mut new_body = Stmt::undefined();
    let mut after = Stmt::undefined();
    depended = false;
    for_each_stmt_backward(&body_and_after, &mut |s| {
        if !depended && !stmt_depends_on(s, syms) {
            after = Stmt::block(s.clone(), after.clone());
        } else {
            depended = true;
            new_body = Stmt::block(s.clone(), new_body.clone());
        }
    });

    (before, new_body, after)
}

struct ScopeReducer;

impl ScopeReducer {
    fn reduce<F>(&mut self, sym: SymbolId, body: &Stmt, s: &Stmt, rebuild: F) -> Stmt
    where
        F: FnOnce(Stmt) -> Stmt,
    {
        let new_body = self.fold_stmt(body);
        let (before, inner, after) = split_body(&new_body, &[sym]);
        if new_body.same_as(body) && !before.defined() && !after.defined() {
            s.clone()
        } else if inner.defined() {
            Stmt::block_of([before, rebuild(inner), after])
        } else {
            // The scope was dead.
            Stmt::block(before, after)
        }
    }
}

impl NodeFolder for ScopeReducer {
    fn visit_let_stmt(&mut self, sym: SymbolId, value: &Expr, body: &Stmt, s: &Stmt) -> Stmt {
        let value = value.clone();
        self.reduce(sym, body, s, move |b| Stmt::let_stmt(sym, value, b))
    }

    fn visit_allocate(
        &mut self,
        sym: SymbolId,
        storage: MemoryType,
        elem_size: Index,
        dims: &[DimExpr],
        body: &Stmt,
        s: &Stmt,
    ) -> Stmt {
        let dims = dims.to_vec();
        self.reduce(sym, body, s, move |b| {
            Stmt::allocate(sym, storage, elem_size, dims, b)
        })
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
        let base = base.clone();
        let elem_size = elem_size.clone();
        let dims = dims.to_vec();
        self.reduce(sym, body, s, move |b| {
            Stmt::make_buffer(sym, base, elem_size, dims, b)
        })
    }

    fn visit_crop_buffer(&mut self, sym: SymbolId, bounds: &BoxExpr, body: &Stmt, s: &Stmt) -> Stmt {
        let bounds = bounds.clone();
        self.reduce(sym, body, s, move |b| Stmt::crop_buffer(sym, bounds, b))
    }

    fn visit_crop_dim(&mut self, sym: SymbolId, dim: usize, bounds: &Interval, body: &Stmt, s: &Stmt) -> Stmt {
        let bounds = bounds.clone();
        self.reduce(sym, body, s, move |b| Stmt::crop_dim(sym, dim, bounds, b))
    }
}

/// Hoist statements out of scopes they do not depend on, and elide scopes
/// left with an empty body.
pub fn reduce_scopes(s: &Stmt) -> Stmt {
    ScopeReducer.fold_stmt(s)
}

// --- Buffer aliasing ---

#[derive(Debug, Default, Clone)]
struct AliasInfo {
    candidates: BTreeSet<SymbolId>,
    elementwise: bool,
    consumers: usize,
}

struct BufferAliaser {
    alias_info: SymbolMap<AliasInfo>,
    buffer_bounds: SymbolMap<BoxExpr>,
}

// A consumed region is elementwise with respect to `out` when it is
// exactly the rectangle of the consumer's output. This is broader than
// point-to-point dependence, so aliasing also demands a single consumer.
fn is_elementwise(in_bounds: &BoxExpr, out: SymbolId) -> bool {
    let out_var = Expr::var(out);
    for (d, i) in in_bounds.iter().enumerate() {
        if !i.min.defined() || !i.max.defined() {
            return false;
        }
        if !exprs_match(&i.min, &buffer_min(out_var.clone(), d)) {
            return false;
        }
        if !exprs_match(&i.max, &buffer_max(out_var.clone(), d)) {
            return false;
        }
    }
    true
}

impl NodeFolder for BufferAliaser {
    fn visit_allocate(
        &mut self,
        sym: SymbolId,
        storage: MemoryType,
        elem_size: Index,
        dims: &[DimExpr],
        body: &Stmt,
        s: &Stmt,
    ) -> Stmt {
        let bounds: BoxExpr = dims.iter().map(|d| d.bounds.clone()).collect();
        let old_bounds = self.buffer_bounds.set(sym, Some(bounds));
        let old_info = self.alias_info.set(
            sym,
            Some(AliasInfo {
                elementwise: true,
                ..AliasInfo::default()
            }),
        );
        let new_body = self.fold_stmt(body);
        let info = self.alias_info.set(sym, old_info).unwrap_or_default();
        self.buffer_bounds.set(sym, old_bounds);

        if info.elementwise && info.consumers == 1 {
            if let Some(&target) = info.candidates.iter().next() {
                debug!("aliasing <{}> to <{}>", sym.0, target.0);
                // The target is spoken for now.
                for (_, other) in self.alias_info.iter_mut() {
                    other.candidates.remove(&target);
                }
                return Stmt::let_stmt(sym, Expr::var(target), new_body);
            }
        }
        if new_body.same_as(body) {
            s.clone()
        } else {
            Stmt::allocate(sym, storage, elem_size, dims.to_vec(), new_body)
        }
    }

    fn visit_call_stmt(&mut self, call: &CallStmt, s: &Stmt) -> Stmt {
        for input in &call.inputs {
            if self.alias_info.get(*input).is_none() {
                continue;
            }
            let in_bounds = self.buffer_bounds.get(*input).cloned();
            let info = match self.alias_info.get_mut(*input) {
                Some(info) => info,
                None => continue,
            };
            info.consumers += 1;
            let in_bounds = match in_bounds {
                Some(b) => b,
                None => {
                    info.elementwise = false;
                    continue;
                }
            };
            for output in &call.outputs {
                if is_elementwise(&in_bounds, *output) {
                    info.candidates.insert(*output);
                } else {
                    info.elementwise = false;
                }
            }
        }
        s.clone()
    }

    fn visit_copy(&mut self, src: SymbolId, _dst: SymbolId, _padding: &[u8], s: &Stmt) -> Stmt {
        // Copies are the domain of copy optimization, not aliasing.
        if let Some(info) = self.alias_info.get_mut(src) {
            info.consumers += 1;
            info.elementwise = false;
        }
        s.clone()
    }

    fn visit_crop_buffer(&mut self, sym: SymbolId, bounds: &BoxExpr, body: &Stmt, s: &Stmt) -> Stmt {
        let mut merged = self.buffer_bounds.get(sym).cloned().unwrap_or_default();
        merge_crop(&mut merged, bounds);
        let old = self.buffer_bounds.set(sym, Some(merged));
        let result = folder::walk_crop_buffer(self, sym, bounds, body, s);
        self.buffer_bounds.set(sym, old);
        result
    }

    fn visit_crop_dim(&mut self, sym: SymbolId, dim: usize, bounds: &Interval, body: &Stmt, s: &Stmt) -> Stmt {
        let mut merged = self.buffer_bounds.get(sym).cloned().unwrap_or_default();
        merge_crop_dim(&mut merged, dim, bounds);
        let old = self.buffer_bounds.set(sym, Some(merged));
        let result = folder::walk_crop_dim(self, sym, dim, bounds, body, s);
        self.buffer_bounds.set(sym, old);
        result
    }
}

/// Rewrite allocations that feed a single elementwise consumer with a
/// matching output shape into aliases of that output.
pub fn alias_buffers(s: &Stmt) -> Stmt {
    BufferAliaser {
        alias_info: SymbolMap::new(),
        buffer_bounds: SymbolMap::new(),
    }
    .fold_stmt(s)
}

// --- Copy optimization ---

struct CopyImplementer;

impl NodeFolder for CopyImplementer {
    fn visit_copy(&mut self, _src: SymbolId, _dst: SymbolId, _padding: &[u8], s: &Stmt) -> Stmt {
        s.clone()
    }
}

/// Reserved hook: copies are currently left for the interpreter.
pub fn optimize_copies(s: &Stmt) -> Stmt {
    CopyImplementer.fold_stmt(s)
}
