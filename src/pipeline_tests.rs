//! End-to-end pipeline tests: build a stage DAG, compile it, interpret
//! it, and check both the transformed tree and the computed values.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffer::Buffer;
use crate::diags::print_stmt;
use crate::error::EvalError;
use crate::interval::{DimExpr, Interval};
use crate::ir::folder::{self, NodeFolder};
use crate::ir::{
    buffer_fold_factor, buffer_max, buffer_min, buffer_stride, Callable, Expr, Index, MemoryType,
    NodeContext, Stmt, SymbolId,
};
use crate::pipeline::{BufferExpr, Func, FuncInput, FuncOutput, LoopSpec, Pipeline};

fn stage1(
    f: impl Fn(&Buffer<i32>, &Buffer<i32>) -> Result<(), EvalError> + 'static,
) -> Callable {
    Callable::new(move |inputs, outputs| {
        f(
            &Buffer::view(inputs[0].clone()),
            &Buffer::view(outputs[0].clone()),
        )
    })
}

fn stage2(
    f: impl Fn(&Buffer<i32>, &Buffer<i32>, &Buffer<i32>) -> Result<(), EvalError> + 'static,
) -> Callable {
    Callable::new(move |inputs, outputs| {
        f(
            &Buffer::view(inputs[0].clone()),
            &Buffer::view(inputs[1].clone()),
            &Buffer::view(outputs[0].clone()),
        )
    })
}

fn point(e: Expr) -> Interval {
    Interval::point(e)
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

fn double_stage() -> Callable {
    stage1(|i, o| {
        for ix in o.min(0)..=o.max(0) {
            o.set(&[ix], i.at(&[ix]) * 2);
        }
        Ok(())
    })
}

// A trivial pipeline with one elementwise stage.
#[test]
fn trivial_pipeline() {
    let mut ctx = NodeContext::new();
    let in_buf = BufferExpr::new(&mut ctx, "in", 4, 1);
    let out_buf = BufferExpr::new(&mut ctx, "out", 4, 1);
    let x = ctx.insert("x");

    let _mul = Func::new(
        double_stage(),
        vec![FuncInput::new(&in_buf, vec![point(Expr::var(x))])],
        vec![FuncOutput::new(&out_buf, vec![x])],
    );
    let p = Pipeline::build(&mut ctx, vec![in_buf], vec![out_buf]).unwrap();

    let text = print_stmt(&p.body, Some(&ctx));
    assert_eq!(text.matches("check(").count(), 3);
    assert!(text.contains("buffer_min(in, 0)"));
    assert!(!text.contains("crop_buffer"));

    const N: Index = 10;
    let input = Buffer::<i32>::new(&[(0, N)]);
    input.fill_with(|at| at[0] as i32);
    let output = Buffer::<i32>::new(&[(0, N)]);
    p.evaluate(&[&input.raw], &[&output.raw]).unwrap();
    for i in 0..N {
        assert_eq!(output.at(&[i]), (2 * i) as i32);
    }
}

#[test]
fn undersized_inputs_fail_a_check() {
    let mut ctx = NodeContext::new();
    let in_buf = BufferExpr::new(&mut ctx, "in", 4, 1);
    let out_buf = BufferExpr::new(&mut ctx, "out", 4, 1);
    let x = ctx.insert("x");
    let _mul = Func::new(
        double_stage(),
        vec![FuncInput::new(&in_buf, vec![point(Expr::var(x))])],
        vec![FuncOutput::new(&out_buf, vec![x])],
    );
    let p = Pipeline::build(&mut ctx, vec![in_buf], vec![out_buf]).unwrap();

    let output = Buffer::<i32>::new(&[(0, 10)]);
    // One element short on the low side.
    let short = Buffer::<i32>::new(&[(1, 9)]);
    assert!(matches!(
        p.evaluate(&[&short.raw], &[&output.raw]),
        Err(EvalError::CheckFailed(_))
    ));
    // One element short on the high side.
    let short = Buffer::<i32>::new(&[(0, 9)]);
    assert!(matches!(
        p.evaluate(&[&short.raw], &[&output.raw]),
        Err(EvalError::CheckFailed(_))
    ));
    // Exactly sufficient.
    let exact = Buffer::<i32>::new(&[(0, 10)]);
    assert!(p.evaluate(&[&exact.raw], &[&output.raw]).is_ok());
}

// Two elementwise stages in sequence; the intermediate aliases the
// output and its allocation disappears.
#[test]
fn elementwise_chain_aliases_the_intermediate() {
    let mut ctx = NodeContext::new();
    let in_buf = BufferExpr::new(&mut ctx, "in", 4, 1);
    let intm = BufferExpr::new(&mut ctx, "intm", 4, 1);
    let out_buf = BufferExpr::new(&mut ctx, "out", 4, 1);
    let x = ctx.insert("x");

    let _mul = Func::new(
        double_stage(),
        vec![FuncInput::new(&in_buf, vec![point(Expr::var(x))])],
        vec![FuncOutput::new(&intm, vec![x])],
    );
    let _add = Func::new(
        stage1(|i, o| {
            for ix in o.min(0)..=o.max(0) {
                o.set(&[ix], i.at(&[ix]) + 1);
            }
            Ok(())
        }),
        vec![FuncInput::new(&intm, vec![point(Expr::var(x))])],
        vec![FuncOutput::new(&out_buf, vec![x])],
    );
    let p = Pipeline::build(&mut ctx, vec![in_buf], vec![out_buf]).unwrap();

    let text = print_stmt(&p.body, Some(&ctx));
    assert!(text.contains("let intm = out"));
    assert!(!text.contains("allocate"));

    const N: Index = 10;
    let input = Buffer::<i32>::new(&[(0, N)]);
    input.fill_with(|at| at[0] as i32);
    let output = Buffer::<i32>::new(&[(0, N)]);
    p.evaluate(&[&input.raw], &[&output.raw]).unwrap();
    for i in 0..N {
        assert_eq!(output.at(&[i]), (2 * i + 1) as i32);
    }
}

fn stencil_pipeline(mut schedule: impl FnMut(SymbolId) -> LoopSpec) -> (NodeContext, Pipeline, SymbolId) {
    let mut ctx = NodeContext::new();
    let in_buf = BufferExpr::new(&mut ctx, "in", 4, 1);
    let p_buf = BufferExpr::new(&mut ctx, "p", 4, 1);
    let out_buf = BufferExpr::new(&mut ctx, "out", 4, 1);
    let x = ctx.insert("x");
    let p_sym = p_buf.sym();

    let _produce = Func::new(
        double_stage(),
        vec![FuncInput::new(&in_buf, vec![point(Expr::var(x))])],
        vec![FuncOutput::new(&p_buf, vec![x])],
    );
    let consume = Func::new(
        stage1(|p, o| {
            for ix in o.min(0)..=o.max(0) {
                o.set(&[ix], p.at(&[ix - 1]) + p.at(&[ix]) + p.at(&[ix + 1]));
            }
            Ok(())
        }),
        vec![FuncInput::new(
            &p_buf,
            vec![Interval::new(Expr::var(x) - 1, Expr::var(x) + 1)],
        )],
        vec![FuncOutput::new(&out_buf, vec![x])],
    );
    consume.loops(vec![schedule(x)]);

    let p = Pipeline::build(&mut ctx, vec![in_buf], vec![out_buf]).unwrap();
    (ctx, p, p_sym)
}

fn run_stencil(p: &Pipeline, n: Index) -> Buffer<i32> {
    // The stencil needs one extra producer element on each side.
    let input = Buffer::<i32>::new(&[(-1, n + 2)]);
    input.fill_with(|at| at[0] as i32);
    let output = Buffer::<i32>::new(&[(0, n)]);
    p.evaluate(&[&input.raw], &[&output.raw]).unwrap();
    output
}

// A 1-D stencil inside a serial loop: the producer slides (guarded
// warm-up on the first iteration) and its storage folds to the window.
#[test]
fn serial_stencil_slides_and_folds() {
    let (ctx, p, p_sym) = stencil_pipeline(LoopSpec::serial);

    let dims = find_allocate(&p.body, p_sym).expect("producer allocation");
    assert_eq!(dims[0].fold_factor.as_constant(), Some(3));

    let text = print_stmt(&p.body, Some(&ctx));
    assert!(text.contains("min_orig"));
    assert!(text.contains("select("));

    const N: Index = 10;
    let output = run_stencil(&p, N);
    for i in 0..N {
        // p[j] = 2j, so out[i] = 2(i-1) + 2i + 2(i+1) = 6i.
        assert_eq!(output.at(&[i]), (6 * i) as i32);
    }
}

// The same stencil in a parallel loop: no sliding, no folding, each
// iteration recomputes its whole window.
#[test]
fn parallel_stencil_is_untouched() {
    let (ctx, p, p_sym) = stencil_pipeline(LoopSpec::parallel);

    let dims = find_allocate(&p.body, p_sym).expect("producer allocation");
    assert!(!dims[0].fold_factor.defined());

    let text = print_stmt(&p.body, Some(&ctx));
    assert!(!text.contains("min_orig"));
    assert!(!text.contains("select("));
    assert!(text.contains("parallel_loop"));

    const N: Index = 10;
    let output = run_stencil(&p, N);
    for i in 0..N {
        assert_eq!(output.at(&[i]), (6 * i) as i32);
    }
}

// Disjoint tiles: each iteration consumes its own block of the producer,
// so the storage folds to one tile and nothing slides.
#[test]
fn disjoint_tiles_fold_only() {
    let mut ctx = NodeContext::new();
    let in_buf = BufferExpr::new(&mut ctx, "in", 4, 1);
    let p_buf = BufferExpr::new(&mut ctx, "p", 4, 1);
    let out_buf = BufferExpr::new(&mut ctx, "out", 4, 1);
    let x = ctx.insert("x");
    let p_sym = p_buf.sym();

    let _produce = Func::new(
        stage1(|i, o| {
            for ix in o.min(0)..=o.max(0) {
                o.set(&[ix], i.at(&[ix]));
            }
            Ok(())
        }),
        vec![FuncInput::new(&in_buf, vec![point(Expr::var(x))])],
        vec![FuncOutput::new(&p_buf, vec![x])],
    );
    let sum = Func::new(
        stage1(|p, o| {
            for ix in o.min(0)..=o.max(0) {
                let mut total = 0;
                for k in 0..4 {
                    total += p.at(&[4 * ix + k]);
                }
                o.set(&[ix], total);
            }
            Ok(())
        }),
        vec![FuncInput::new(
            &p_buf,
            vec![Interval::new(Expr::var(x) * 4, Expr::var(x) * 4 + 3)],
        )],
        vec![FuncOutput::new(&out_buf, vec![x])],
    );
    sum.loops(vec![LoopSpec::serial(x)]);

    let p = Pipeline::build(&mut ctx, vec![in_buf], vec![out_buf]).unwrap();

    let dims = find_allocate(&p.body, p_sym).expect("producer allocation");
    assert_eq!(dims[0].fold_factor.as_constant(), Some(4));
    let text = print_stmt(&p.body, Some(&ctx));
    assert!(!text.contains("select("));

    const TILES: Index = 5;
    let input = Buffer::<i32>::new(&[(0, 4 * TILES)]);
    input.fill_with(|at| at[0] as i32);
    let output = Buffer::<i32>::new(&[(0, TILES)]);
    p.evaluate(&[&input.raw], &[&output.raw]).unwrap();
    for i in 0..TILES {
        // Sum of 4i .. 4i+3.
        assert_eq!(output.at(&[i]), (16 * i + 6) as i32);
    }
}

fn matmul_stage() -> Callable {
    stage2(|a, b, c| {
        for i in c.min(0)..=c.max(0) {
            for j in c.min(1)..=c.max(1) {
                let mut acc = 0i32;
                for k in a.min(1)..=a.max(1) {
                    acc += a.at(&[i, k]) * b.at(&[k, j]);
                }
                c.set(&[i, j], acc);
            }
        }
        Ok(())
    })
}

// Two chained matrix multiplies: D = (A x B) x C. Inference propagates
// D's region back through the intermediate into all three inputs.
#[test]
fn matmul_chain_infers_through_the_intermediate() {
    let mut ctx = NodeContext::new();
    let a = BufferExpr::new(&mut ctx, "a", 4, 2);
    let b = BufferExpr::new(&mut ctx, "b", 4, 2);
    let c = BufferExpr::new(&mut ctx, "c", 4, 2);
    let d = BufferExpr::new(&mut ctx, "d", 4, 2);
    let ab = BufferExpr::new(&mut ctx, "ab", 4, 2);
    let i = ctx.insert("i");
    let j = ctx.insert("j");
    let ab_sym = ab.sym();
    let d_sym = d.sym();

    // Reduction extents come from the input shapes; no constants yet.
    let k_ab = a.extent(1);
    let k_d = c.extent(0);

    let _matmul_ab = Func::new(
        matmul_stage(),
        vec![
            FuncInput::new(&a, vec![point(Expr::var(i)), Interval::new(Expr::constant(0), k_ab.clone() - 1)]),
            FuncInput::new(&b, vec![Interval::new(Expr::constant(0), k_ab.clone() - 1), point(Expr::var(j))]),
        ],
        vec![FuncOutput::new(&ab, vec![i, j])],
    );
    let _matmul_abc = Func::new(
        matmul_stage(),
        vec![
            FuncInput::new(&ab, vec![point(Expr::var(i)), Interval::new(Expr::constant(0), k_d.clone() - 1)]),
            FuncInput::new(&c, vec![Interval::new(Expr::constant(0), k_d.clone() - 1), point(Expr::var(j))]),
        ],
        vec![FuncOutput::new(&d, vec![i, j])],
    );

    let p = Pipeline::build(&mut ctx, vec![a, b, c], vec![d]).unwrap();

    // The intermediate's rows track d's rows; its columns span the
    // reduction.
    let dims = find_allocate(&p.body, ab_sym).expect("intermediate allocation");
    assert!(crate::substitute::exprs_equal(
        &dims[0].bounds.min,
        &buffer_min(Expr::var(d_sym), 0)
    ));
    assert!(crate::substitute::exprs_equal(
        &dims[0].bounds.max,
        &buffer_max(Expr::var(d_sym), 0)
    ));
    assert_eq!(dims[1].bounds.min.as_constant(), Some(0));
    // No serial reduction loop encloses the intermediate; nothing slides.
    let text = print_stmt(&p.body, Some(&ctx));
    assert!(!text.contains("select("));
    assert!(!dims[0].fold_factor.defined());

    const M: Index = 10;
    let mut rng = StdRng::seed_from_u64(0xAB5EED);
    let mk = |rng: &mut StdRng| {
        let buf = Buffer::<i32>::new(&[(0, M), (0, M)]);
        buf.fill_with(|_| rng.gen_range(0..10));
        buf
    };
    let a_buf = mk(&mut rng);
    let b_buf = mk(&mut rng);
    let c_buf = mk(&mut rng);
    let d_buf = Buffer::<i32>::new(&[(0, M), (0, M)]);
    p.evaluate(&[&a_buf.raw, &b_buf.raw, &c_buf.raw], &[&d_buf.raw]).unwrap();

    // Reference: D = (A x B) x C.
    let mut ab_ref = vec![vec![0i32; M as usize]; M as usize];
    for i in 0..M as usize {
        for j in 0..M as usize {
            for k in 0..M as usize {
                ab_ref[i][j] += a_buf.at(&[i as Index, k as Index]) * b_buf.at(&[k as Index, j as Index]);
            }
        }
    }
    for i in 0..M as usize {
        for j in 0..M as usize {
            let mut acc = 0i32;
            for k in 0..M as usize {
                acc += ab_ref[i][k] * c_buf.at(&[k as Index, j as Index]);
            }
            assert_eq!(d_buf.at(&[i as Index, j as Index]), acc);
        }
    }
}

// User-padded dims are honored and checked, and pad the demand upstream.
#[test]
fn user_dim_overrides_are_honored() {
    let mut ctx = NodeContext::new();
    let in_buf = BufferExpr::new(&mut ctx, "in", 4, 1);
    let intm = BufferExpr::new(&mut ctx, "intm", 4, 1);
    let out_buf = BufferExpr::new(&mut ctx, "out", 4, 1);
    let x = ctx.insert("x");
    let intm_sym = intm.sym();

    let intm_var = Expr::var(intm_sym);
    intm.set_dim(
        0,
        DimExpr {
            bounds: Interval::new(
                buffer_min(intm_var.clone(), 0),
                buffer_max(intm_var.clone(), 0) + 10,
            ),
            stride: buffer_stride(intm_var.clone(), 0),
            fold_factor: buffer_fold_factor(intm_var, 0),
        },
    );

    let _mul = Func::new(
        double_stage(),
        vec![FuncInput::new(&in_buf, vec![point(Expr::var(x))])],
        vec![FuncOutput::new(&intm, vec![x])],
    );
    let _add = Func::new(
        stage1(|i, o| {
            for ix in o.min(0)..=o.max(0) {
                o.set(&[ix], i.at(&[ix]) + 1);
            }
            Ok(())
        }),
        vec![FuncInput::new(&intm, vec![point(Expr::var(x))])],
        vec![FuncOutput::new(&out_buf, vec![x])],
    );
    let p = Pipeline::build(&mut ctx, vec![in_buf], vec![out_buf]).unwrap();

    // The padded extent blocks aliasing and survives into the allocation.
    let dims = find_allocate(&p.body, intm_sym).expect("padded allocation survives");
    let text = print_stmt(&p.body, Some(&ctx));
    assert!(text.contains("(buffer_max(out, 0) + 10)"));
    assert!(!text.contains("let intm = out"));
    assert_eq!(dims.len(), 1);

    // The crop between the stages still governs what is computed and
    // demanded, so an exactly-sized input is enough.
    const N: Index = 10;
    let input = Buffer::<i32>::new(&[(0, N)]);
    input.fill_with(|at| at[0] as i32);
    let output = Buffer::<i32>::new(&[(0, N)]);
    p.evaluate(&[&input.raw], &[&output.raw]).unwrap();
    for i in 0..N {
        assert_eq!(output.at(&[i]), (2 * i + 1) as i32);
    }
}

// Running the middle end over its own output changes nothing for
// non-sliding pipelines.
#[test]
fn middle_end_is_idempotent_on_non_sliding_pipelines() {
    // Elementwise chain.
    let mut ctx = NodeContext::new();
    let in_buf = BufferExpr::new(&mut ctx, "in", 4, 1);
    let intm = BufferExpr::new(&mut ctx, "intm", 4, 1);
    let out_buf = BufferExpr::new(&mut ctx, "out", 4, 1);
    let x = ctx.insert("x");
    let in_sym = in_buf.sym();
    let out_sym = out_buf.sym();

    let _mul = Func::new(
        double_stage(),
        vec![FuncInput::new(&in_buf, vec![point(Expr::var(x))])],
        vec![FuncOutput::new(&intm, vec![x])],
    );
    let _add = Func::new(
        double_stage(),
        vec![FuncInput::new(&intm, vec![point(Expr::var(x))])],
        vec![FuncOutput::new(&out_buf, vec![x])],
    );
    let p = Pipeline::build(&mut ctx, vec![in_buf], vec![out_buf]).unwrap();

    let again = crate::compile(&p.body, &mut ctx, &[in_sym], &[out_sym]).unwrap();
    assert_eq!(
        print_stmt(&p.body, Some(&ctx)),
        print_stmt(&again, Some(&ctx))
    );
}

#[test]
fn middle_end_is_idempotent_on_the_trivial_pipeline() {
    let mut ctx = NodeContext::new();
    let in_buf = BufferExpr::new(&mut ctx, "in", 4, 1);
    let out_buf = BufferExpr::new(&mut ctx, "out", 4, 1);
    let x = ctx.insert("x");
    let in_sym = in_buf.sym();
    let out_sym = out_buf.sym();
    let _mul = Func::new(
        double_stage(),
        vec![FuncInput::new(&in_buf, vec![point(Expr::var(x))])],
        vec![FuncOutput::new(&out_buf, vec![x])],
    );
    let p = Pipeline::build(&mut ctx, vec![in_buf], vec![out_buf]).unwrap();

    let again = crate::compile(&p.body, &mut ctx, &[in_sym], &[out_sym]).unwrap();
    assert_eq!(
        print_stmt(&p.body, Some(&ctx)),
        print_stmt(&again, Some(&ctx))
    );
}

// A sliding pipeline re-run changes nothing observable: same results,
// same folds.
#[test]
fn recompiling_a_slid_pipeline_preserves_behavior() {
    let (mut ctx, p, p_sym) = stencil_pipeline(LoopSpec::serial);
    let in_sym = ctx.lookup("in").unwrap();
    let out_sym = ctx.lookup("out").unwrap();

    let again = crate::compile(&p.body, &mut ctx, &[in_sym], &[out_sym]).unwrap();
    let dims = find_allocate(&again, p_sym).expect("producer allocation");
    assert_eq!(dims[0].fold_factor.as_constant(), Some(3));

    const N: Index = 10;
    let input = Buffer::<i32>::new(&[(-1, N + 2)]);
    input.fill_with(|at| at[0] as i32);
    let output = Buffer::<i32>::new(&[(0, N)]);
    let mut env = crate::eval::EvalContext::new();
    env.bind_buffer(in_sym, input.raw.clone());
    env.bind_buffer(out_sym, output.raw.clone());
    crate::eval::eval_stmt(&again, &mut env).unwrap();
    for i in 0..N {
        assert_eq!(output.at(&[i]), (6 * i) as i32);
    }
}

// A copy stage lowers to a copy statement and moves the data through.
#[test]
fn copy_stages_move_data() {
    let mut ctx = NodeContext::new();
    let in_buf = BufferExpr::new(&mut ctx, "in", 4, 1);
    let out_buf = BufferExpr::new(&mut ctx, "out", 4, 1);
    let x = ctx.insert("x");
    let _copy = Func::make_copy(
        FuncInput::new(&in_buf, vec![point(Expr::var(x))]),
        FuncOutput::new(&out_buf, vec![x]),
        9i32.to_le_bytes().to_vec(),
    );
    let p = Pipeline::build(&mut ctx, vec![in_buf], vec![out_buf]).unwrap();
    assert!(print_stmt(&p.body, Some(&ctx)).contains("copy(in -> out"));

    let input = Buffer::<i32>::new(&[(0, 5)]);
    input.fill_with(|at| at[0] as i32 + 1);
    let output = Buffer::<i32>::new(&[(0, 5)]);
    p.evaluate(&[&input.raw], &[&output.raw]).unwrap();
    for i in 0..5 {
        assert_eq!(output.at(&[i]), i as i32 + 1);
    }
}
