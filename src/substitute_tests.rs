//! Tests for substitution, matching and dependence analysis.

use crate::interval::{DimExpr, Interval};
use crate::ir::{
    buffer_extent, buffer_max, buffer_min, buffer_stride, CallStmt, Callable, Expr, NodeContext, Stmt,
};
use crate::substitute::*;

fn noop_callable() -> Callable {
    Callable::new(|_, _| Ok(()))
}

#[test]
fn substitute_variable() {
    let mut ctx = NodeContext::new();
    let x = ctx.insert("x");
    let y = ctx.var("y");
    let e = Expr::var(x) + y.clone();
    let r = substitute_sym(&e, x, &Expr::constant(2));
    assert!(exprs_equal(&r, &(Expr::constant(2) + y)));
}

#[test]
fn substitute_compound_target() {
    let mut ctx = NodeContext::new();
    let buf = ctx.var("b");
    let z = ctx.var("z");
    let e = buffer_min(buf.clone(), 0) * 2;
    let r = substitute(&e, &buffer_min(buf.clone(), 0), &z);
    assert!(exprs_equal(&r, &(z * 2)));
}

#[test]
fn substitute_round_trip() {
    let mut ctx = NodeContext::new();
    let a = ctx.insert("a");
    let b = ctx.var("b");
    let c = ctx.insert("c");
    let e = (Expr::var(a) + b) * 3;
    let there = substitute_sym(&e, a, &Expr::var(c));
    assert!(expr_depends_on(&there, c));
    let back = substitute_sym(&there, c, &Expr::var(a));
    assert!(exprs_equal(&back, &e));
}

#[test]
fn substitute_stops_at_shadowing_binder() {
    let mut ctx = NodeContext::new();
    let x = ctx.insert("x");
    let e = Expr::let_in(x, Expr::constant(5), Expr::var(x) + 1);
    let r = substitute_sym(&e, x, &Expr::constant(7));
    // The body's x refers to the inner binding.
    assert!(exprs_equal(&r, &e));
}

#[test]
fn depends_on_sees_through_operations() {
    let mut ctx = NodeContext::new();
    let x = ctx.insert("x");
    let y = ctx.insert("y");
    let e = (Expr::var(x) + 1) * 2;
    assert!(expr_depends_on(&e, x));
    assert!(!expr_depends_on(&e, y));

    let shadowed = Expr::let_in(x, Expr::constant(1), Expr::var(x));
    assert!(!expr_depends_on(&shadowed, x));
}

#[test]
fn stmt_depends_on_buffer_operands() {
    let mut ctx = NodeContext::new();
    let a = ctx.insert("a");
    let b = ctx.insert("b");
    let c = ctx.insert("c");
    let call = Stmt::call(CallStmt {
        target: noop_callable(),
        inputs: vec![a],
        outputs: vec![b],
    });
    assert!(stmt_depends_on(&call, &[a]));
    assert!(stmt_depends_on(&call, &[b]));
    assert!(!stmt_depends_on(&call, &[c]));

    let check = Stmt::check(crate::ir::le(buffer_min(Expr::var(c), 0), Expr::constant(0)));
    assert!(stmt_depends_on(&check, &[c]));
}

#[test]
fn match_with_wildcards() {
    let mut ctx = NodeContext::new();
    let w = ctx.insert("w");
    let x = ctx.var("x");
    let y = ctx.var("y");

    // A wildcard matches anything.
    assert!(exprs_match(&Expr::wildcard(w), &(x.clone() + 1)));
    // Repeated occurrences must unify.
    let pattern = Expr::wildcard(w) + Expr::wildcard(w);
    assert!(exprs_match(&pattern, &(x.clone() + x.clone())));
    assert!(!exprs_match(&pattern, &(x.clone() + y.clone())));
    // Without wildcards, match is structural equality.
    assert!(exprs_match(&(x.clone() + y.clone()), &(x.clone() + y.clone())));
    assert!(!exprs_match(&(x.clone() + y.clone()), &(y + x)));
}

#[test]
fn substitute_bounds_replaces_metadata_queries() {
    let mut ctx = NodeContext::new();
    let b = ctx.insert("b");
    let bounds = vec![Interval::new(Expr::constant(0), Expr::constant(9))];
    let b_var = Expr::var(b);

    let e = buffer_min(b_var.clone(), 0) + buffer_max(b_var.clone(), 0);
    let r = substitute_bounds(&e, b, &bounds);
    assert!(exprs_equal(&r, &(Expr::constant(0) + Expr::constant(9))));

    let e = buffer_extent(b_var.clone(), 0);
    let r = substitute_bounds(&e, b, &bounds);
    assert_eq!(crate::simplify::simplify(&r).as_constant(), Some(10));

    // Strides are not substituted here.
    let e = buffer_stride(b_var.clone(), 0);
    let r = substitute_bounds(&e, b, &bounds);
    assert!(exprs_equal(&r, &e));

    // Out-of-range dims keep the query.
    let e = buffer_min(b_var, 1);
    let r = substitute_bounds(&e, b, &bounds);
    assert!(exprs_equal(&r, &e));
}

#[test]
fn substitute_dims_runs_to_fixpoint() {
    let mut ctx = NodeContext::new();
    let b = ctx.insert("b");
    let b_var = Expr::var(b);
    let dims = vec![DimExpr {
        bounds: Interval::new(buffer_min(b_var.clone(), 0), buffer_max(b_var.clone(), 0)),
        stride: buffer_stride(b_var.clone(), 0),
        fold_factor: Expr::undefined(),
    }];
    // The stride substitution's replacement mentions another key, so a
    // single pass would leave it unresolved.
    let subs = vec![
        (buffer_stride(b_var.clone(), 0), buffer_min(b_var.clone(), 0) * 4),
        (buffer_min(b_var.clone(), 0), Expr::constant(2)),
        (buffer_max(b_var.clone(), 0), Expr::constant(11)),
    ];
    let out = substitute_dims(dims, &subs);
    assert!(exprs_equal(&out[0].bounds.min, &Expr::constant(2)));
    assert!(exprs_equal(&out[0].bounds.max, &Expr::constant(11)));
    assert!(exprs_equal(&out[0].stride, &(Expr::constant(2) * 4)));
    assert!(!out[0].fold_factor.defined());
}
