//! Tests for the simplifier and the bounds reasoning built on it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::eval::{eval_expr, EvalContext};
use crate::interval::Interval;
use crate::ir::{
    self, align_up, buffer_min, indeterminate, is_indeterminate, is_negative_infinity,
    is_positive_infinity, negative_infinity, positive_infinity, CallStmt, Callable, Expr, NodeContext,
    Stmt, SymbolId,
};
use crate::scope::SymbolMap;
use crate::simplify::{bounds_of, prove_false, prove_true, simplify, simplify_stmt, where_true};
use crate::substitute::exprs_equal;

fn var(ctx: &mut NodeContext, name: &str) -> Expr {
    ctx.var(name)
}

#[test]
fn identities() {
    let mut ctx = NodeContext::new();
    let x = var(&mut ctx, "x");
    assert!(exprs_equal(&simplify(&(x.clone() + 0)), &x));
    assert!(exprs_equal(&simplify(&(x.clone() * 1)), &x));
    assert_eq!(simplify(&(x.clone() * 0)).as_constant(), Some(0));
    assert!(exprs_equal(&simplify(&ir::min(x.clone(), positive_infinity())), &x));
    assert!(exprs_equal(&simplify(&ir::max(x.clone(), negative_infinity())), &x));
    assert!(is_negative_infinity(&simplify(&ir::min(x.clone(), negative_infinity()))));
    assert!(is_positive_infinity(&simplify(&ir::max(x, positive_infinity()))));
}

#[test]
fn constant_folding_is_floor_semantics() {
    assert_eq!(simplify(&(Expr::constant(7) / -2)).as_constant(), Some(-4));
    assert_eq!(simplify(&(Expr::constant(-7) / 2)).as_constant(), Some(-4));
    assert_eq!(simplify(&(Expr::constant(7) % -2)).as_constant(), Some(-1));
    assert_eq!(simplify(&(Expr::constant(-7) % 2)).as_constant(), Some(1));
    // Division by zero is not folded away.
    assert!(simplify(&(Expr::constant(1) / 0)).as_constant().is_none());
}

#[test]
fn linear_cancellation() {
    let mut ctx = NodeContext::new();
    let x = var(&mut ctx, "x");
    let e = (x.clone() + 1) - (x.clone() - 1);
    assert_eq!(simplify(&e).as_constant(), Some(2));
    let e = (x.clone() * 3) - (x.clone() * 2) - x;
    assert_eq!(simplify(&e).as_constant(), Some(0));
}

#[test]
fn comparisons_of_affine_expressions_fold() {
    let mut ctx = NodeContext::new();
    let x = var(&mut ctx, "x");
    assert_eq!(simplify(&ir::lt(x.clone(), x.clone() - 1)).as_constant(), Some(0));
    assert_eq!(simplify(&ir::le(x.clone() - 2, x.clone() - 1)).as_constant(), Some(1));
    assert_eq!(simplify(&ir::eq(x.clone() + 1, x.clone() + 1)).as_constant(), Some(1));
    assert_eq!(simplify(&ir::ne(x.clone(), x.clone())).as_constant(), Some(0));
    // Unknown differences stay symbolic.
    let y = var(&mut ctx, "y");
    assert!(simplify(&ir::lt(x, y)).as_constant().is_none());
}

#[test]
fn comparisons_against_infinity() {
    let mut ctx = NodeContext::new();
    let x = var(&mut ctx, "x");
    assert_eq!(simplify(&ir::le(x.clone(), positive_infinity())).as_constant(), Some(1));
    assert_eq!(simplify(&ir::lt(negative_infinity(), x.clone())).as_constant(), Some(1));
    assert_eq!(simplify(&ir::lt(x, negative_infinity())).as_constant(), Some(0));
}

#[test]
fn min_max_share_affine_base() {
    let mut ctx = NodeContext::new();
    let x = var(&mut ctx, "x");
    assert!(exprs_equal(
        &simplify(&ir::min(x.clone() - 1, x.clone() - 2)),
        &(x.clone() - 2)
    ));
    assert!(exprs_equal(
        &simplify(&ir::max(x.clone() * 4 - 4, x.clone() * 4)),
        &(x.clone() * 4)
    ));
    assert!(exprs_equal(&simplify(&ir::min(x.clone(), x.clone())), &x));
}

#[test]
fn select_folding() {
    let mut ctx = NodeContext::new();
    let a = var(&mut ctx, "a");
    let b = var(&mut ctx, "b");
    let cond = ir::lt(Expr::constant(1), Expr::constant(2));
    assert!(exprs_equal(&simplify(&Expr::select(cond, a.clone(), b.clone())), &a));
    let unknown = ir::lt(a.clone(), b.clone());
    assert!(exprs_equal(
        &simplify(&Expr::select(unknown, a.clone(), a.clone())),
        &a
    ));
}

#[test]
fn not_inverts_comparisons() {
    let mut ctx = NodeContext::new();
    let a = var(&mut ctx, "a");
    let b = var(&mut ctx, "b");
    let r = simplify(&Expr::not(ir::lt(a.clone(), b.clone())));
    assert!(exprs_equal(&r, &ir::le(b, a)));
}

#[test]
fn indeterminate_poisons() {
    assert!(is_indeterminate(&simplify(&(Expr::constant(0) * positive_infinity()))));
    assert!(is_indeterminate(&simplify(&(positive_infinity() + negative_infinity()))));
    // Predicates over indeterminate never prove.
    assert!(!prove_true(&ir::le(Expr::constant(0), indeterminate())));
    assert!(!prove_false(&ir::le(Expr::constant(0), indeterminate())));
}

#[test]
fn align_up_folds() {
    assert_eq!(simplify(&align_up(Expr::constant(3), Expr::constant(1))).as_constant(), Some(3));
    assert_eq!(simplify(&align_up(Expr::constant(5), Expr::constant(4))).as_constant(), Some(8));
    assert_eq!(simplify(&align_up(Expr::constant(8), Expr::constant(4))).as_constant(), Some(8));
    assert!(is_positive_infinity(&simplify(&align_up(
        positive_infinity(),
        Expr::constant(2)
    ))));
}

#[test]
fn prove_true_is_conservative() {
    let mut ctx = NodeContext::new();
    let x = var(&mut ctx, "x");
    let y = var(&mut ctx, "y");
    assert!(prove_true(&ir::le(x.clone(), x.clone() + 1)));
    assert!(prove_true(&ir::and(
        ir::le(x.clone() - 2, x.clone() - 1),
        ir::le(x.clone(), x.clone() + 1)
    )));
    assert!(!prove_true(&ir::lt(x.clone(), x.clone())));
    assert!(!prove_true(&ir::le(x.clone(), y.clone())));
    assert!(!prove_true(&ir::eq(x, y)));
}

#[test]
fn bounds_of_interval_arithmetic() {
    let mut ctx = NodeContext::new();
    let x_sym = ctx.insert("x");
    let x = Expr::var(x_sym);
    let mut scope = SymbolMap::new();
    scope.insert(x_sym, Interval::new(Expr::constant(0), Expr::constant(10)));

    let b = bounds_of(&(x.clone() * 2 + 1), &scope);
    assert_eq!(b.min.as_constant(), Some(1));
    assert_eq!(b.max.as_constant(), Some(21));

    let b = bounds_of(&(Expr::constant(5) - x.clone()), &scope);
    assert_eq!(b.min.as_constant(), Some(-5));
    assert_eq!(b.max.as_constant(), Some(5));

    let b = bounds_of(&(x.clone() % 5), &scope);
    assert_eq!(b.min.as_constant(), Some(0));
    assert_eq!(b.max.as_constant(), Some(4));

    // Free variables read as unbounded.
    let b = bounds_of(&x, &SymbolMap::new());
    assert!(is_negative_infinity(&b.min));
    assert!(is_positive_infinity(&b.max));

    // Constant expressions bound themselves.
    let b = bounds_of(&simplify(&(Expr::constant(7) - 4)), &SymbolMap::new());
    assert_eq!(b.max.as_constant(), Some(3));
}

#[test]
fn where_true_solves_affine_comparisons() {
    let mut ctx = NodeContext::new();
    let x = ctx.insert("x");
    let y = ctx.insert("y");

    let sup = where_true(&ir::le(Expr::var(x) + 1, Expr::constant(10)), x);
    assert_eq!(sup.max.as_constant(), Some(9));

    let inf = where_true(&ir::le(Expr::constant(10), Expr::var(x)), x);
    assert_eq!(inf.min.as_constant(), Some(10));
    assert!(is_positive_infinity(&inf.max));

    let strict = where_true(&ir::lt(Expr::var(x), Expr::constant(10)), x);
    assert_eq!(strict.max.as_constant(), Some(9));

    let both = where_true(
        &ir::and(
            ir::le(Expr::constant(0), Expr::var(x)),
            ir::le(Expr::var(x), Expr::constant(7)),
        ),
        x,
    );
    assert_eq!(both.min.as_constant(), Some(0));
    assert_eq!(both.max.as_constant(), Some(7));

    // A residual bound in another symbol is a conservative failure.
    let fail = where_true(&ir::le(Expr::var(x), Expr::var(y)), x);
    assert!(is_negative_infinity(&fail.max));
}

#[test]
fn stmt_simplification_drops_dead_checks() {
    let s = Stmt::check(ir::le(Expr::constant(1), Expr::constant(2)));
    assert!(!simplify_stmt(&s).defined());

    let failing = Stmt::check(ir::le(Expr::constant(2), Expr::constant(1)));
    assert!(simplify_stmt(&failing).defined());
}

#[test]
fn stmt_simplification_dedupes_established_checks() {
    let mut ctx = NodeContext::new();
    let b = ctx.insert("b");
    let x = ctx.var("x");
    let cond = ir::le(buffer_min(Expr::var(b), 0), x);
    let s = Stmt::block(Stmt::check(cond.clone()), Stmt::check(cond));
    let out = simplify_stmt(&s);
    let text = crate::diags::print_stmt(&out, Some(&ctx));
    assert_eq!(text.matches("check(").count(), 1);
}

#[test]
fn stmt_simplification_drops_redundant_crops() {
    let mut ctx = NodeContext::new();
    let b = ctx.insert("b");
    let call = Stmt::call(CallStmt {
        target: Callable::new(|_, _| Ok(())),
        inputs: vec![],
        outputs: vec![b],
    });
    let bounds = vec![Interval::new(Expr::constant(0), Expr::constant(9))];
    let s = Stmt::crop_buffer(b, bounds.clone(), Stmt::crop_buffer(b, bounds, call));
    let out = simplify_stmt(&s);
    let text = crate::diags::print_stmt(&out, Some(&ctx));
    assert_eq!(text.matches("crop_buffer").count(), 1);
}

#[test]
fn stmt_simplification_selects_constant_branches() {
    let mut ctx = NodeContext::new();
    let b = ctx.insert("b");
    let call = Stmt::call(CallStmt {
        target: Callable::new(|_, _| Ok(())),
        inputs: vec![],
        outputs: vec![b],
    });
    let s = Stmt::if_then_else(
        ir::lt(Expr::constant(1), Expr::constant(2)),
        call.clone(),
        Stmt::undefined(),
    );
    assert!(simplify_stmt(&s).same_as(&call));

    let s = Stmt::if_then_else(
        ir::lt(Expr::constant(2), Expr::constant(1)),
        call,
        Stmt::undefined(),
    );
    assert!(!simplify_stmt(&s).defined());
}

// --- Randomized soundness ---

fn gen_expr(rng: &mut StdRng, vars: &[SymbolId], depth: usize) -> Expr {
    if depth == 0 || rng.gen_bool(0.3) {
        if rng.gen_bool(0.5) {
            Expr::constant(rng.gen_range(-5..6))
        } else {
            Expr::var(vars[rng.gen_range(0..vars.len())])
        }
    } else {
        let a = gen_expr(rng, vars, depth - 1);
        let b = gen_expr(rng, vars, depth - 1);
        match rng.gen_range(0..8) {
            0 => a + b,
            1 => a - b,
            2 => a * b,
            3 => ir::min(a, b),
            4 => ir::max(a, b),
            5 => ir::lt(a, b),
            6 => ir::le(a, b),
            _ => {
                let c = gen_expr(rng, vars, depth - 1);
                Expr::select(ir::lt(a, b), c, gen_expr(rng, vars, depth - 1))
            }
        }
    }
}

#[test]
fn simplify_preserves_value_on_sampled_assignments() {
    let mut ctx = NodeContext::new();
    let vars = [ctx.insert("a"), ctx.insert("b"), ctx.insert("c")];
    let mut rng = StdRng::seed_from_u64(0x5111CE);

    for _ in 0..300 {
        let e = gen_expr(&mut rng, &vars, 4);
        let s = simplify(&e);
        for _ in 0..8 {
            let mut eval_ctx = EvalContext::new();
            for &v in &vars {
                eval_ctx.bind_index(v, rng.gen_range(-10..11));
            }
            let expected = eval_expr(&e, &eval_ctx).expect("generated exprs are total");
            let got = eval_expr(&s, &eval_ctx).expect("simplification must not introduce failures");
            assert_eq!(
                expected, got,
                "simplify changed the value of {} (simplified to {})",
                e, s
            );
        }
    }
}

#[test]
fn simplify_is_idempotent() {
    let mut ctx = NodeContext::new();
    let vars = [ctx.insert("a"), ctx.insert("b"), ctx.insert("c")];
    let mut rng = StdRng::seed_from_u64(0xF01D);

    for _ in 0..200 {
        let e = gen_expr(&mut rng, &vars, 4);
        let once = simplify(&e);
        let twice = simplify(&once);
        assert!(
            exprs_equal(&once, &twice),
            "not idempotent: {} vs {}",
            once,
            twice
        );
    }
}
