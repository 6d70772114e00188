//! Tests for bounds inference, validation and slide-and-fold, on
//! hand-built statement trees.

use crate::diags::print_stmt;
use crate::error::CompilerError;
use crate::infer::infer_bounds;
use crate::interval::{DimExpr, Interval};
use crate::ir::folder::{self, NodeFolder};
use crate::ir::{
    self, buffer_fold_factor, buffer_max, buffer_min, CallStmt, Callable, Expr, Index, LoopMode,
    MemoryType, NodeContext, Stmt, SymbolId,
};
use crate::slide::slide_and_fold;
use crate::substitute::exprs_equal;
use crate::validate::validate;

fn noop() -> Callable {
    Callable::new(|_, _| Ok(()))
}

fn call(inputs: Vec<SymbolId>, outputs: Vec<SymbolId>) -> Stmt {
    Stmt::call(CallStmt {
        target: noop(),
        inputs,
        outputs,
    })
}

fn placeholder_dims(sym: SymbolId, rank: usize) -> Vec<DimExpr> {
    let var = Expr::var(sym);
    (0..rank)
        .map(|d| DimExpr {
            bounds: Interval::new(buffer_min(var.clone(), d), buffer_max(var.clone(), d)),
            stride: ir::buffer_stride(var.clone(), d),
            fold_factor: buffer_fold_factor(var.clone(), d),
        })
        .collect()
}

struct FindAllocate {
    sym: SymbolId,
    dims: Option<Vec<DimExpr>>,
}

impl NodeFolder for FindAllocate {
    fn visit_allocate(
        &mut self,
        sym: SymbolId,
        storage: MemoryType,
        elem_size: Index,
        dims: &[DimExpr],
        body: &Stmt,
        s: &Stmt,
    ) -> Stmt {
        if sym == self.sym {
            self.dims = Some(dims.to_vec());
        }
        folder::walk_allocate(self, sym, storage, elem_size, dims, body, s)
    }
}

fn find_allocate(s: &Stmt, sym: SymbolId) -> Option<Vec<DimExpr>> {
    let mut finder = FindAllocate { sym, dims: None };
    finder.fold_stmt(s);
    finder.dims
}

#[test]
fn inference_emits_input_sufficiency_checks() {
    let mut ctx = NodeContext::new();
    let in_sym = ctx.insert("in");
    let out_sym = ctx.insert("out");
    let out_var = Expr::var(out_sym);

    let s = Stmt::crop_buffer(
        in_sym,
        vec![Interval::new(
            buffer_min(out_var.clone(), 0),
            buffer_max(out_var.clone(), 0),
        )],
        call(vec![in_sym], vec![out_sym]),
    );
    let result = infer_bounds(&s, &[in_sym]);
    let text = print_stmt(&result, Some(&ctx));
    // min coverage, max coverage, and fold factor sufficiency.
    assert_eq!(text.matches("check(").count(), 3);
    assert!(text.contains("buffer_min(in, 0)"));
    assert!(text.contains("buffer_max(in, 0)"));
    assert!(text.contains("buffer_fold_factor(in, 0)"));
    assert!(text.contains("buffer_min(out, 0)"));
}

#[test]
fn inference_resolves_allocation_placeholders() {
    let mut ctx = NodeContext::new();
    let in_sym = ctx.insert("in");
    let intm_sym = ctx.insert("intm");
    let out_sym = ctx.insert("out");
    let intm_var = Expr::var(intm_sym);
    let out_var = Expr::var(out_sym);

    let demand_on_intm = vec![Interval::new(
        buffer_min(out_var.clone(), 0),
        buffer_max(out_var.clone(), 0),
    )];
    let demand_on_in = vec![Interval::new(
        buffer_min(intm_var.clone(), 0),
        buffer_max(intm_var.clone(), 0),
    )];
    let body = Stmt::crop_buffer(
        intm_sym,
        demand_on_intm.clone(),
        Stmt::block(
            Stmt::crop_buffer(in_sym, demand_on_in, call(vec![in_sym], vec![intm_sym])),
            call(vec![intm_sym], vec![out_sym]),
        ),
    );
    let s = Stmt::allocate(
        intm_sym,
        MemoryType::Heap,
        4,
        placeholder_dims(intm_sym, 1),
        body,
    );

    let result = infer_bounds(&s, &[in_sym]);

    let dims = find_allocate(&result, intm_sym).expect("allocation survives");
    assert!(exprs_equal(&dims[0].bounds.min, &buffer_min(out_var.clone(), 0)));
    assert!(exprs_equal(&dims[0].bounds.max, &buffer_max(out_var.clone(), 0)));
    assert_eq!(dims[0].stride.as_constant(), Some(4));
    // Fold factors are the slide-and-fold pass's business.
    assert!(exprs_equal(
        &dims[0].fold_factor,
        &buffer_fold_factor(intm_var, 0)
    ));

    // The input's demand flowed through the allocation's substitutions.
    let text = print_stmt(&result, Some(&ctx));
    assert!(text.contains("check((buffer_min(in, 0) <= buffer_min(out, 0)))"));
}

#[test]
fn loop_exit_projects_demands_onto_loop_bounds() {
    let mut ctx = NodeContext::new();
    let p_sym = ctx.insert("p");
    let out_sym = ctx.insert("out");
    let x_sym = ctx.insert("x");
    let out_var = Expr::var(out_sym);
    let x = Expr::var(x_sym);

    let body = Stmt::loop_stmt(
        x_sym,
        LoopMode::Serial,
        Interval::new(buffer_min(out_var.clone(), 0), buffer_max(out_var.clone(), 0)),
        Expr::constant(1),
        Stmt::crop_buffer(
            p_sym,
            vec![Interval::point(x.clone())],
            call(vec![p_sym], vec![out_sym]),
        ),
    );
    let s = Stmt::allocate(p_sym, MemoryType::Heap, 4, placeholder_dims(p_sym, 1), body);
    let result = infer_bounds(&s, &[]);

    let dims = find_allocate(&result, p_sym).expect("allocation survives");
    let lo = buffer_min(out_var.clone(), 0);
    let hi = buffer_max(out_var.clone(), 0);
    assert!(exprs_equal(&dims[0].bounds.min, &ir::min(lo.clone(), hi.clone())));
    assert!(exprs_equal(&dims[0].bounds.max, &ir::max(lo, hi)));

    // The union demand is declared around the loop too.
    let text = print_stmt(&result, Some(&ctx));
    assert_eq!(text.matches("crop_buffer(p").count(), 2);
}

#[test]
fn validation_rejects_unbound_symbols() {
    let mut ctx = NodeContext::new();
    let a = ctx.insert("a");
    let b = ctx.insert("b");
    let s = call(vec![a], vec![b]);
    // Only `b` is declared external.
    match validate(&s, &ctx, &[b]) {
        Err(CompilerError::UnboundSymbol { name, .. }) => assert_eq!(name, "a"),
        other => panic!("expected UnboundSymbol, got {:?}", other),
    }
    assert!(validate(&s, &ctx, &[a, b]).is_ok());
}

#[test]
fn validation_rejects_slices() {
    let mut ctx = NodeContext::new();
    let a = ctx.insert("a");
    let s = Stmt::slice_dim(a, 0, Expr::constant(0), call(vec![], vec![a]));
    match validate(&s, &ctx, &[a]) {
        Err(CompilerError::SliceBeforeInference { construct }) => assert_eq!(construct, "slice_dim"),
        other => panic!("expected SliceBeforeInference, got {:?}", other),
    }
}

#[test]
fn validation_rejects_rank_violating_crops() {
    let mut ctx = NodeContext::new();
    let a = ctx.insert("a");
    let body = Stmt::crop_dim(
        a,
        1,
        Interval::new(Expr::constant(0), Expr::constant(3)),
        call(vec![], vec![a]),
    );
    let s = Stmt::allocate(a, MemoryType::Heap, 4, placeholder_dims(a, 1), body);
    match validate(&s, &ctx, &[]) {
        Err(CompilerError::RankMismatch { dim, rank, .. }) => {
            assert_eq!(dim, 1);
            assert_eq!(rank, 1);
        }
        other => panic!("expected RankMismatch, got {:?}", other),
    }
}

// --- slide and fold ---

fn slide_input(
    ctx: &mut NodeContext,
    mode: LoopMode,
    demand: impl Fn(&Expr) -> Interval,
    alloc_bounds: (Index, Index),
) -> (Stmt, SymbolId, SymbolId) {
    let p_sym = ctx.insert("p");
    let out_sym = ctx.insert("out");
    let x_sym = ctx.insert("x");
    let x = Expr::var(x_sym);

    let body = Stmt::loop_stmt(
        x_sym,
        mode,
        Interval::new(Expr::constant(0), Expr::constant(9)),
        Expr::constant(1),
        Stmt::crop_buffer(
            p_sym,
            vec![demand(&x)],
            Stmt::block(call(vec![], vec![p_sym]), call(vec![p_sym], vec![out_sym])),
        ),
    );
    let dims = vec![DimExpr {
        bounds: Interval::new(Expr::constant(alloc_bounds.0), Expr::constant(alloc_bounds.1)),
        stride: Expr::constant(4),
        fold_factor: buffer_fold_factor(Expr::var(p_sym), 0),
    }];
    let s = Stmt::allocate(p_sym, MemoryType::Heap, 4, dims, body);
    (s, p_sym, x_sym)
}

#[test]
fn disjoint_iterations_fold_without_sliding() {
    let mut ctx = NodeContext::new();
    let (s, p_sym, _) = slide_input(
        &mut ctx,
        LoopMode::Serial,
        |x| Interval::new(x.clone() * 4, x.clone() * 4 + 3),
        (0, 43),
    );
    let result = slide_and_fold(&s, &mut ctx);

    let dims = find_allocate(&result, p_sym).expect("allocation survives");
    assert_eq!(dims[0].fold_factor.as_constant(), Some(4));
    let text = print_stmt(&result, Some(&ctx));
    assert!(!text.contains("select("));
    assert!(!text.contains("min_orig"));
}

#[test]
fn monotonic_overlap_slides_with_guarded_warm_up() {
    let mut ctx = NodeContext::new();
    let (s, p_sym, _) = slide_input(
        &mut ctx,
        LoopMode::Serial,
        |x| Interval::new(x.clone() - 1, x.clone() + 1),
        (-1, 10),
    );
    let result = slide_and_fold(&s, &mut ctx);

    let dims = find_allocate(&result, p_sym).expect("allocation survives");
    assert_eq!(dims[0].fold_factor.as_constant(), Some(3));

    let text = print_stmt(&result, Some(&ctx));
    // The producer's per-iteration demand becomes the incremental region,
    // expanded on the first iteration.
    assert!(text.contains("select((x == x.min_orig), (x - 1), (x + 1))"));
    assert!(text.contains("let x.min_orig = 0"));
    // The loop itself still runs over the original bounds.
    assert!(text.contains("loop(x in [0, 9])"));
}

#[test]
fn parallel_loops_are_left_alone() {
    let mut ctx = NodeContext::new();
    let (s, p_sym, _) = slide_input(
        &mut ctx,
        LoopMode::Parallel,
        |x| Interval::new(x.clone() - 1, x.clone() + 1),
        (-1, 10),
    );
    let result = slide_and_fold(&s, &mut ctx);

    let dims = find_allocate(&result, p_sym).expect("allocation survives");
    assert!(!dims[0].fold_factor.defined());
    let text = print_stmt(&result, Some(&ctx));
    assert!(!text.contains("select("));
    assert!(!text.contains("min_orig"));
    assert!(text.contains("[(x - 1), (x + 1)]"));
}

#[test]
fn recomputed_regions_are_not_folded() {
    // A demand independent of the loop variable is recomputed, not slid.
    let mut ctx = NodeContext::new();
    let (s, p_sym, _) = slide_input(
        &mut ctx,
        LoopMode::Serial,
        |_| Interval::new(Expr::constant(0), Expr::constant(7)),
        (0, 7),
    );
    let result = slide_and_fold(&s, &mut ctx);
    let dims = find_allocate(&result, p_sym).expect("allocation survives");
    assert!(!dims[0].fold_factor.defined());
}
