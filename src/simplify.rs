//! Bottom-up simplification of IR expressions and statements, and the
//! bounds reasoning built on top of it: `prove_true`, `bounds_of` and
//! `where_true`.
//!
//! Every rewrite preserves value under every assignment of free variables
//! in the representable range; when a rule cannot guarantee that, it
//! declines. Arithmetic over the infinity sentinels follows extended
//! integer rules, with `indeterminate` poisoning anything it touches and
//! no predicate over it ever proving.

use crate::interval::{merge_crop, merge_crop_dim, BoxExpr, Interval};
use crate::ir::folder::{self, NodeFolder};
use crate::ir::{
    self, indeterminate, negative_infinity, positive_infinity, BinaryOp, Expr, ExprNode, Index, Intrinsic,
    LoopMode, MemoryType, Stmt, StmtNode, SymbolId,
};
use crate::scope::SymbolMap;
use crate::substitute::{exprs_equal, expr_depends_on, stmt_depends_on, substitute_sym};

/// Simplify an expression.
pub fn simplify(e: &Expr) -> Expr {
    Simplifier::default().fold_expr(e)
}

/// Simplify a statement tree: expressions within it, plus dead checks,
/// constant branches, no-op crops and empty scopes.
pub fn simplify_stmt(s: &Stmt) -> Stmt {
    Simplifier::default().fold_stmt(s)
}

// --- Extended-integer scalars ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scalar {
    Finite(Index),
    PosInf,
    NegInf,
    Indeterminate,
}

use Scalar::*;

pub(crate) fn as_scalar(e: &Expr) -> Option<Scalar> {
    match e.node() {
        Some(ExprNode::Constant(c)) => Some(Finite(*c)),
        Some(ExprNode::Call { intrinsic, args }) if args.is_empty() => match intrinsic {
            Intrinsic::PositiveInfinity => Some(PosInf),
            Intrinsic::NegativeInfinity => Some(NegInf),
            Intrinsic::Indeterminate => Some(Indeterminate),
            _ => None,
        },
        _ => None,
    }
}

fn scalar_to_expr(s: Scalar) -> Expr {
    match s {
        Finite(c) => Expr::constant(c),
        PosInf => positive_infinity(),
        NegInf => negative_infinity(),
        Indeterminate => indeterminate(),
    }
}

pub(crate) fn floor_div(a: Index, b: Index) -> Index {
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

pub(crate) fn floor_mod(a: Index, b: Index) -> Index {
    a.wrapping_sub(floor_div(a, b).wrapping_mul(b))
}

fn scalar_add(a: Scalar, b: Scalar) -> Option<Scalar> {
    match (a, b) {
        (Indeterminate, _) | (_, Indeterminate) => Some(Indeterminate),
        (PosInf, NegInf) | (NegInf, PosInf) => Some(Indeterminate),
        (PosInf, _) | (_, PosInf) => Some(PosInf),
        (NegInf, _) | (_, NegInf) => Some(NegInf),
        (Finite(x), Finite(y)) => x.checked_add(y).map(Finite),
    }
}

fn scalar_neg(a: Scalar) -> Option<Scalar> {
    match a {
        Indeterminate => Some(Indeterminate),
        PosInf => Some(NegInf),
        NegInf => Some(PosInf),
        Finite(x) => x.checked_neg().map(Finite),
    }
}

fn scalar_sub(a: Scalar, b: Scalar) -> Option<Scalar> {
    scalar_neg(b).and_then(|nb| scalar_add(a, nb))
}

fn scalar_mul(a: Scalar, b: Scalar) -> Option<Scalar> {
    match (a, b) {
        (Indeterminate, _) | (_, Indeterminate) => Some(Indeterminate),
        (Finite(0), PosInf) | (Finite(0), NegInf) | (PosInf, Finite(0)) | (NegInf, Finite(0)) => {
            Some(Indeterminate)
        }
        (PosInf, PosInf) | (NegInf, NegInf) => Some(PosInf),
        (PosInf, NegInf) | (NegInf, PosInf) => Some(NegInf),
        (PosInf, Finite(x)) | (Finite(x), PosInf) => Some(if x > 0 { PosInf } else { NegInf }),
        (NegInf, Finite(x)) | (Finite(x), NegInf) => Some(if x > 0 { NegInf } else { PosInf }),
        (Finite(x), Finite(y)) => x.checked_mul(y).map(Finite),
    }
}

fn scalar_div(a: Scalar, b: Scalar) -> Option<Scalar> {
    match (a, b) {
        (Indeterminate, _) | (_, Indeterminate) => Some(Indeterminate),
        (_, Finite(0)) => None,
        (PosInf, PosInf) | (PosInf, NegInf) | (NegInf, PosInf) | (NegInf, NegInf) => Some(Indeterminate),
        (Finite(_), PosInf) | (Finite(_), NegInf) => Some(Finite(0)),
        (PosInf, Finite(x)) => Some(if x > 0 { PosInf } else { NegInf }),
        (NegInf, Finite(x)) => Some(if x > 0 { NegInf } else { PosInf }),
        (Finite(x), Finite(y)) => Some(Finite(floor_div(x, y))),
    }
}

fn scalar_mod(a: Scalar, b: Scalar) -> Option<Scalar> {
    match (a, b) {
        (Indeterminate, _) | (_, Indeterminate) => Some(Indeterminate),
        (_, Finite(0)) => None,
        (Finite(x), Finite(y)) => Some(Finite(floor_mod(x, y))),
        _ => None,
    }
}

fn scalar_cmp(a: Scalar, b: Scalar) -> Option<std::cmp::Ordering> {
    use std::cmp::Ordering::*;
    match (a, b) {
        (Indeterminate, _) | (_, Indeterminate) => None,
        (PosInf, PosInf) | (NegInf, NegInf) => Some(Equal),
        (PosInf, _) => Some(Greater),
        (_, PosInf) => Some(Less),
        (NegInf, _) => Some(Less),
        (_, NegInf) => Some(Greater),
        (Finite(x), Finite(y)) => Some(x.cmp(&y)),
    }
}

fn scalar_min(a: Scalar, b: Scalar) -> Option<Scalar> {
    match scalar_cmp(a, b) {
        Some(std::cmp::Ordering::Greater) => Some(b),
        Some(_) => Some(a),
        None => Some(Indeterminate),
    }
}

fn scalar_max(a: Scalar, b: Scalar) -> Option<Scalar> {
    match scalar_cmp(a, b) {
        Some(std::cmp::Ordering::Less) => Some(b),
        Some(_) => Some(a),
        None => Some(Indeterminate),
    }
}

fn scalar_truthy(s: Scalar) -> Option<bool> {
    match s {
        Indeterminate => None,
        Finite(c) => Some(c != 0),
        PosInf | NegInf => Some(true),
    }
}

fn bool_expr(b: bool) -> Expr {
    Expr::constant(if b { 1 } else { 0 })
}

/// Whether `e` contains any infinity or indeterminate node. Linear
/// normalization must not cancel terms across these.
fn contains_infinity(e: &Expr) -> bool {
    match e.node() {
        None => false,
        Some(ExprNode::Call { intrinsic, .. }) => matches!(
            intrinsic,
            Intrinsic::PositiveInfinity | Intrinsic::NegativeInfinity | Intrinsic::Indeterminate
        ),
        Some(ExprNode::Variable(_)) | Some(ExprNode::Wildcard(_)) | Some(ExprNode::Constant(_)) => false,
        Some(ExprNode::Let { value, body, .. }) => contains_infinity(value) || contains_infinity(body),
        Some(ExprNode::Binary { a, b, .. }) => contains_infinity(a) || contains_infinity(b),
        Some(ExprNode::Not(a)) => contains_infinity(a),
        Some(ExprNode::Select {
            condition,
            true_value,
            false_value,
        }) => {
            contains_infinity(condition) || contains_infinity(true_value) || contains_infinity(false_value)
        }
    }
}

// --- Linear normalization ---

#[derive(Debug, Default)]
pub(crate) struct Linear {
    pub terms: Vec<(Expr, Index)>,
    pub constant: Index,
}

pub(crate) fn linear_of(e: &Expr) -> Option<Linear> {
    let mut lin = Linear::default();
    if accumulate(e, 1, &mut lin) {
        lin.terms.retain(|(_, c)| *c != 0);
        Some(lin)
    } else {
        None
    }
}

fn accumulate(e: &Expr, scale: Index, lin: &mut Linear) -> bool {
    match e.node() {
        None => false,
        Some(ExprNode::Constant(c)) => match scale.checked_mul(*c).and_then(|v| lin.constant.checked_add(v)) {
            Some(total) => {
                lin.constant = total;
                true
            }
            None => false,
        },
        Some(ExprNode::Binary { op: BinaryOp::Add, a, b }) => {
            accumulate(a, scale, lin) && accumulate(b, scale, lin)
        }
        Some(ExprNode::Binary { op: BinaryOp::Sub, a, b }) => match scale.checked_neg() {
            Some(neg) => accumulate(a, scale, lin) && accumulate(b, neg, lin),
            None => false,
        },
        Some(ExprNode::Binary { op: BinaryOp::Mul, a, b }) => {
            if let Some(Finite(c)) = as_scalar(b) {
                match scale.checked_mul(c) {
                    Some(s) => accumulate(a, s, lin),
                    None => false,
                }
            } else if let Some(Finite(c)) = as_scalar(a) {
                match scale.checked_mul(c) {
                    Some(s) => accumulate(b, s, lin),
                    None => false,
                }
            } else {
                push_term(e, scale, lin)
            }
        }
        _ => {
            if contains_infinity(e) {
                return false;
            }
            push_term(e, scale, lin)
        }
    }
}

fn push_term(e: &Expr, scale: Index, lin: &mut Linear) -> bool {
    if contains_infinity(e) {
        return false;
    }
    for (t, c) in lin.terms.iter_mut() {
        if exprs_equal(t, e) {
            match c.checked_add(scale) {
                Some(total) => {
                    *c = total;
                    return true;
                }
                None => return false,
            }
        }
    }
    lin.terms.push((e.clone(), scale));
    true
}

fn term_expr(t: &Expr, c: Index) -> Expr {
    if c == 1 {
        t.clone()
    } else {
        t.clone() * c
    }
}

pub(crate) fn linear_to_expr(lin: &Linear) -> Expr {
    let mut acc: Option<Expr> = None;
    for (t, c) in &lin.terms {
        acc = Some(match acc {
            None => term_expr(t, *c),
            Some(prev) => {
                if *c == 1 {
                    prev + t.clone()
                } else if *c == -1 {
                    prev - t.clone()
                } else if *c < 0 {
                    prev - term_expr(t, -*c)
                } else {
                    prev + term_expr(t, *c)
                }
            }
        });
    }
    match acc {
        None => Expr::constant(lin.constant),
        Some(e) if lin.constant == 0 => e,
        Some(e) if lin.constant < 0 => e - Expr::constant(-lin.constant),
        Some(e) => e + Expr::constant(lin.constant),
    }
}

// --- Expression rewrites ---

// Returns Some(rewritten) only when something actually changed.
fn try_rewrite_binary(op: BinaryOp, a: &Expr, b: &Expr) -> Option<Expr> {
    let sa = as_scalar(a);
    let sb = as_scalar(b);

    if let (Some(x), Some(y)) = (sa, sb) {
        let folded = match op {
            BinaryOp::Add => scalar_add(x, y),
            BinaryOp::Sub => scalar_sub(x, y),
            BinaryOp::Mul => scalar_mul(x, y),
            BinaryOp::Div => scalar_div(x, y),
            BinaryOp::Mod => scalar_mod(x, y),
            BinaryOp::Min => scalar_min(x, y),
            BinaryOp::Max => scalar_max(x, y),
            BinaryOp::Eq => scalar_cmp(x, y).map(|o| Finite((o == std::cmp::Ordering::Equal) as Index)),
            BinaryOp::Ne => scalar_cmp(x, y).map(|o| Finite((o != std::cmp::Ordering::Equal) as Index)),
            BinaryOp::Lt => scalar_cmp(x, y).map(|o| Finite((o == std::cmp::Ordering::Less) as Index)),
            BinaryOp::Le => scalar_cmp(x, y).map(|o| Finite((o != std::cmp::Ordering::Greater) as Index)),
            BinaryOp::And => match (scalar_truthy(x), scalar_truthy(y)) {
                (Some(p), Some(q)) => Some(Finite((p && q) as Index)),
                _ => None,
            },
            BinaryOp::Or => match (scalar_truthy(x), scalar_truthy(y)) {
                (Some(p), Some(q)) => Some(Finite((p || q) as Index)),
                _ => None,
            },
            BinaryOp::BitAnd => finite_binop(x, y, |p, q| Some(p & q)),
            BinaryOp::BitOr => finite_binop(x, y, |p, q| Some(p | q)),
            BinaryOp::BitXor => finite_binop(x, y, |p, q| Some(p ^ q)),
            BinaryOp::Shl => finite_binop(x, y, |p, q| u32::try_from(q).ok().and_then(|q| p.checked_shl(q))),
            BinaryOp::Shr => finite_binop(x, y, |p, q| u32::try_from(q).ok().and_then(|q| p.checked_shr(q))),
        };
        if let Some(r) = folded {
            return Some(scalar_to_expr(r));
        }
    }

    match op {
        BinaryOp::Add | BinaryOp::Sub => rewrite_additive(op, a, b, sa, sb),
        BinaryOp::Mul => rewrite_mul(a, b, sa, sb),
        BinaryOp::Div => rewrite_div(a, b, sb),
        BinaryOp::Mod => rewrite_mod(a, b, sb),
        BinaryOp::Min | BinaryOp::Max => rewrite_min_max(op, a, b),
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le => rewrite_compare(op, a, b, sa, sb),
        BinaryOp::And => rewrite_and(a, b, sa, sb),
        BinaryOp::Or => rewrite_or(a, b, sa, sb),
        _ => None,
    }
}

fn finite_binop(a: Scalar, b: Scalar, f: impl Fn(Index, Index) -> Option<Index>) -> Option<Scalar> {
    match (a, b) {
        (Finite(x), Finite(y)) => f(x, y).map(Finite),
        _ => None,
    }
}

fn rewrite_additive(op: BinaryOp, a: &Expr, b: &Expr, sa: Option<Scalar>, sb: Option<Scalar>) -> Option<Expr> {
    // Infinity absorbs any finite-valued operand. Variables are finite.
    let absorb = |inf: Scalar, other: &Expr| -> Option<Expr> {
        if contains_infinity(other) {
            None
        } else {
            Some(scalar_to_expr(inf))
        }
    };
    match (sa, sb, op) {
        (Some(PosInf), _, BinaryOp::Add) => return absorb(PosInf, b),
        (_, Some(PosInf), BinaryOp::Add) => return absorb(PosInf, a),
        (Some(NegInf), _, BinaryOp::Add) => return absorb(NegInf, b),
        (_, Some(NegInf), BinaryOp::Add) => return absorb(NegInf, a),
        (Some(PosInf), _, BinaryOp::Sub) => return absorb(PosInf, b),
        (_, Some(PosInf), BinaryOp::Sub) => return absorb(NegInf, a),
        (Some(NegInf), _, BinaryOp::Sub) => return absorb(NegInf, b),
        (_, Some(NegInf), BinaryOp::Sub) => return absorb(PosInf, a),
        _ => {}
    }

    let candidate = Expr::binary(op, a.clone(), b.clone());
    let lin = linear_of(&candidate)?;
    let rebuilt = linear_to_expr(&lin);
    if exprs_equal(&rebuilt, &candidate) {
        None
    } else {
        Some(rebuilt)
    }
}

fn rewrite_mul(a: &Expr, b: &Expr, sa: Option<Scalar>, sb: Option<Scalar>) -> Option<Expr> {
    // Canonicalize the constant to the right.
    if sa.is_some() && sb.is_none() {
        return Some(Expr::binary(BinaryOp::Mul, b.clone(), a.clone()));
    }
    match sb {
        Some(Finite(0)) if !contains_infinity(a) => return Some(Expr::constant(0)),
        Some(Finite(1)) => return Some(a.clone()),
        Some(Finite(c)) => {
            // (x * c1) * c2 -> x * (c1 * c2)
            if let Some(ExprNode::Binary {
                op: BinaryOp::Mul,
                a: inner,
                b: inner_c,
            }) = a.node()
            {
                if let Some(Finite(c1)) = as_scalar(inner_c) {
                    let combined = c1.checked_mul(c)?;
                    return Some(Expr::binary(BinaryOp::Mul, inner.clone(), Expr::constant(combined)));
                }
            }
            None
        }
        _ => None,
    }
}

fn rewrite_div(a: &Expr, b: &Expr, sb: Option<Scalar>) -> Option<Expr> {
    match sb {
        Some(Finite(1)) => Some(a.clone()),
        Some(Finite(c)) if c > 1 => {
            // Exact division distributes over an affine numerator.
            let lin = linear_of(a)?;
            if lin.constant % c == 0 && lin.terms.iter().all(|(_, k)| k % c == 0) {
                let divided = Linear {
                    terms: lin.terms.iter().map(|(t, k)| (t.clone(), k / c)).collect(),
                    constant: lin.constant / c,
                };
                Some(linear_to_expr(&divided))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn rewrite_mod(a: &Expr, b: &Expr, sb: Option<Scalar>) -> Option<Expr> {
    match sb {
        Some(Finite(1)) => Some(Expr::constant(0)),
        Some(Finite(c)) if c > 1 => {
            let lin = linear_of(a)?;
            if lin.constant % c == 0 && lin.terms.iter().all(|(_, k)| k % c == 0) {
                Some(Expr::constant(0))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn collect_operands(op: BinaryOp, e: &Expr, out: &mut Vec<Expr>) {
    if let Some(ExprNode::Binary { op: o, a, b }) = e.node() {
        if *o == op {
            collect_operands(op, a, out);
            collect_operands(op, b, out);
            return;
        }
    }
    out.push(e.clone());
}

fn rewrite_min_max(op: BinaryOp, a: &Expr, b: &Expr) -> Option<Expr> {
    let mut operands = Vec::new();
    collect_operands(op, a, &mut operands);
    collect_operands(op, b, &mut operands);

    let mut constant: Option<Scalar> = None;
    let mut rest: Vec<Expr> = Vec::new();
    for o in operands {
        match as_scalar(&o) {
            Some(Indeterminate) => return None,
            Some(s) => {
                constant = Some(match constant {
                    None => s,
                    Some(prev) => match op {
                        BinaryOp::Min => scalar_min(prev, s)?,
                        _ => scalar_max(prev, s)?,
                    },
                });
            }
            None => {
                if !rest.iter().any(|r| exprs_equal(r, &o)) {
                    rest.push(o);
                }
            }
        }
    }

    // The identity element drops out; the absorbing element wins outright.
    match (op, constant) {
        (BinaryOp::Min, Some(PosInf)) | (BinaryOp::Max, Some(NegInf)) => constant = None,
        (BinaryOp::Min, Some(NegInf)) => return Some(negative_infinity()),
        (BinaryOp::Max, Some(PosInf)) => return Some(positive_infinity()),
        _ => {}
    }

    // Merge operands that are the same affine expression up to a constant.
    let mut i = 0;
    while i < rest.len() {
        let mut j = i + 1;
        while j < rest.len() {
            if let (Some(li), Some(lj)) = (linear_of(&rest[i]), linear_of(&rest[j])) {
                if li.terms.len() == lj.terms.len()
                    && li
                        .terms
                        .iter()
                        .zip(lj.terms.iter())
                        .all(|((ta, ca), (tb, cb))| ca == cb && exprs_equal(ta, tb))
                {
                    let c = match op {
                        BinaryOp::Min => li.constant.min(lj.constant),
                        _ => li.constant.max(lj.constant),
                    };
                    rest[i] = linear_to_expr(&Linear {
                        terms: li.terms,
                        constant: c,
                    });
                    rest.remove(j);
                    continue;
                }
            }
            j += 1;
        }
        i += 1;
    }

    let mut result: Option<Expr> = None;
    for o in rest {
        result = Some(match result {
            None => o,
            Some(prev) => Expr::binary(op, prev, o),
        });
    }
    if let Some(c) = constant {
        let c = scalar_to_expr(c);
        result = Some(match result {
            None => c,
            Some(prev) => Expr::binary(op, prev, c),
        });
    }
    let result = result?;
    let candidate = Expr::binary(op, a.clone(), b.clone());
    if exprs_equal(&result, &candidate) {
        None
    } else {
        Some(result)
    }
}

fn rewrite_compare(op: BinaryOp, a: &Expr, b: &Expr, sa: Option<Scalar>, sb: Option<Scalar>) -> Option<Expr> {
    // Comparisons against an infinity are decided for any finite operand.
    match (op, sa, sb) {
        (BinaryOp::Lt, _, Some(PosInf)) | (BinaryOp::Le, _, Some(PosInf)) if !contains_infinity(a) => {
            return Some(bool_expr(true));
        }
        (BinaryOp::Lt, Some(NegInf), _) | (BinaryOp::Le, Some(NegInf), _) if !contains_infinity(b) => {
            return Some(bool_expr(true));
        }
        (BinaryOp::Lt, Some(PosInf), _) | (BinaryOp::Le, Some(PosInf), _) if !contains_infinity(b) => {
            return Some(bool_expr(false));
        }
        (BinaryOp::Lt, _, Some(NegInf)) | (BinaryOp::Le, _, Some(NegInf)) if !contains_infinity(a) => {
            return Some(bool_expr(false));
        }
        _ => {}
    }

    let diff = linear_of(&(b.clone() - a.clone()))?;
    if !diff.terms.is_empty() {
        return None;
    }
    let c = diff.constant;
    let result = match op {
        BinaryOp::Eq => c == 0,
        BinaryOp::Ne => c != 0,
        BinaryOp::Lt => c > 0,
        BinaryOp::Le => c >= 0,
        _ => unreachable!(),
    };
    Some(bool_expr(result))
}

fn rewrite_and(a: &Expr, b: &Expr, sa: Option<Scalar>, sb: Option<Scalar>) -> Option<Expr> {
    let _ = (a, b);
    match (sa.and_then(scalar_truthy), sb.and_then(scalar_truthy)) {
        (Some(false), _) | (_, Some(false)) => Some(bool_expr(false)),
        _ => None,
    }
}

fn rewrite_or(a: &Expr, b: &Expr, sa: Option<Scalar>, sb: Option<Scalar>) -> Option<Expr> {
    let _ = (a, b);
    match (sa.and_then(scalar_truthy), sb.and_then(scalar_truthy)) {
        (Some(true), _) | (_, Some(true)) => Some(bool_expr(true)),
        _ => None,
    }
}

fn try_rewrite_not(a: &Expr) -> Option<Expr> {
    if let Some(s) = as_scalar(a) {
        if let Some(t) = scalar_truthy(s) {
            return Some(bool_expr(!t));
        }
    }
    // Invert comparisons instead of keeping the negation.
    if let Some(ExprNode::Binary { op, a: x, b: y }) = a.node() {
        let inverted = match op {
            BinaryOp::Lt => Some(Expr::binary(BinaryOp::Le, y.clone(), x.clone())),
            BinaryOp::Le => Some(Expr::binary(BinaryOp::Lt, y.clone(), x.clone())),
            BinaryOp::Eq => Some(Expr::binary(BinaryOp::Ne, x.clone(), y.clone())),
            BinaryOp::Ne => Some(Expr::binary(BinaryOp::Eq, x.clone(), y.clone())),
            _ => None,
        };
        if inverted.is_some() {
            return inverted;
        }
    }
    None
}

fn try_rewrite_call(intrinsic: Intrinsic, args: &[Expr]) -> Option<Expr> {
    if intrinsic == Intrinsic::Abs && args.len() == 1 {
        match as_scalar(&args[0])? {
            Finite(c) => return c.checked_abs().map(Expr::constant),
            PosInf | NegInf => return Some(positive_infinity()),
            Indeterminate => return Some(indeterminate()),
        }
    }
    None
}

// --- The simplifier pass ---

#[derive(Default)]
struct Simplifier {
    /// Conditions established by dominating `check` statements.
    known: Vec<Expr>,
    /// In-scope bounds per buffer, from allocations and crops. A crop that
    /// adds nothing over these is dropped.
    crops: SymbolMap<BoxExpr>,
}

fn boxes_equal(a: &BoxExpr, b: &BoxExpr) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| exprs_equal(&x.min, &y.min) && exprs_equal(&x.max, &y.max))
}

fn collect_spine_checks(s: &Stmt, out: &mut Vec<Expr>) {
    match s.node() {
        Some(StmtNode::Block { a, b }) => {
            collect_spine_checks(a, out);
            collect_spine_checks(b, out);
        }
        Some(StmtNode::Check(condition)) => out.push(condition.clone()),
        _ => {}
    }
}

impl Simplifier {
    fn knows(&self, cond: &Expr) -> bool {
        self.known.iter().any(|k| exprs_equal(k, cond))
    }
}

impl NodeFolder for Simplifier {
    fn visit_binary(&mut self, op: BinaryOp, a: &Expr, b: &Expr, e: &Expr) -> Expr {
        let na = self.fold_expr(a);
        let nb = self.fold_expr(b);
        match try_rewrite_binary(op, &na, &nb) {
            Some(r) => r,
            None => {
                if na.same_as(a) && nb.same_as(b) {
                    e.clone()
                } else {
                    Expr::binary(op, na, nb)
                }
            }
        }
    }

    fn visit_not(&mut self, a: &Expr, e: &Expr) -> Expr {
        let na = self.fold_expr(a);
        match try_rewrite_not(&na) {
            Some(r) => r,
            None => {
                if na.same_as(a) {
                    e.clone()
                } else {
                    Expr::not(na)
                }
            }
        }
    }

    fn visit_select(&mut self, condition: &Expr, true_value: &Expr, false_value: &Expr, e: &Expr) -> Expr {
        let nc = self.fold_expr(condition);
        let nt = self.fold_expr(true_value);
        let nf = self.fold_expr(false_value);
        if let Some(t) = as_scalar(&nc).and_then(scalar_truthy) {
            return if t { nt } else { nf };
        }
        if exprs_equal(&nt, &nf) {
            return nt;
        }
        if nc.same_as(condition) && nt.same_as(true_value) && nf.same_as(false_value) {
            e.clone()
        } else {
            Expr::select(nc, nt, nf)
        }
    }

    fn visit_call(&mut self, intrinsic: Intrinsic, args: &[Expr], e: &Expr) -> Expr {
        let new_args: Vec<Expr> = args.iter().map(|a| self.fold_expr(a)).collect();
        if let Some(r) = try_rewrite_call(intrinsic, &new_args) {
            return r;
        }
        if new_args.iter().zip(args.iter()).all(|(x, y)| x.same_as(y)) {
            e.clone()
        } else {
            Expr::call(intrinsic, new_args)
        }
    }

    fn visit_let(&mut self, sym: SymbolId, value: &Expr, body: &Expr, e: &Expr) -> Expr {
        let nv = self.fold_expr(value);
        let nb = self.fold_expr(body);
        if !expr_depends_on(&nb, sym) {
            return nb;
        }
        // Cheap values inline.
        if nv.as_constant().is_some() || nv.as_variable().is_some() {
            return self.fold_expr(&substitute_sym(&nb, sym, &nv));
        }
        if nv.same_as(value) && nb.same_as(body) {
            e.clone()
        } else {
            Expr::let_in(sym, nv, nb)
        }
    }

    // --- Statements ---

    fn visit_check(&mut self, condition: &Expr, s: &Stmt) -> Stmt {
        let nc = self.fold_expr(condition);
        if let Some(t) = as_scalar(&nc).and_then(scalar_truthy) {
            if t {
                return Stmt::undefined();
            }
        }
        if self.knows(&nc) {
            return Stmt::undefined();
        }
        if nc.same_as(condition) {
            s.clone()
        } else {
            Stmt::check(nc)
        }
    }

    fn visit_block(&mut self, a: &Stmt, b: &Stmt, s: &Stmt) -> Stmt {
        let na = self.fold_stmt(a);
        let saved = self.known.len();
        collect_spine_checks(&na, &mut self.known);
        let nb = self.fold_stmt(b);
        self.known.truncate(saved);
        if na.same_as(a) && nb.same_as(b) {
            s.clone()
        } else {
            Stmt::block(na, nb)
        }
    }

    fn visit_if_then_else(&mut self, condition: &Expr, then_body: &Stmt, else_body: &Stmt, s: &Stmt) -> Stmt {
        let nc = self.fold_expr(condition);
        let saved = self.known.len();
        let nt = self.fold_stmt(then_body);
        self.known.truncate(saved);
        let ne = self.fold_stmt(else_body);
        self.known.truncate(saved);
        if let Some(t) = as_scalar(&nc).and_then(scalar_truthy) {
            return if t { nt } else { ne };
        }
        if !nt.defined() && !ne.defined() {
            return Stmt::undefined();
        }
        if nc.same_as(condition) && nt.same_as(then_body) && ne.same_as(else_body) {
            s.clone()
        } else {
            Stmt::if_then_else(nc, nt, ne)
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
        let nbounds = self.fold_interval(bounds);
        let nstep = self.fold_expr(step);
        let saved = self.known.len();
        let nbody = self.fold_stmt(body);
        self.known.truncate(saved);
        if !nbody.defined() {
            return Stmt::undefined();
        }
        if nbounds.same_as(bounds) && nstep.same_as(step) && nbody.same_as(body) {
            s.clone()
        } else {
            Stmt::loop_stmt(sym, mode, nbounds, nstep, nbody)
        }
    }

    fn visit_let_stmt(&mut self, sym: SymbolId, value: &Expr, body: &Stmt, s: &Stmt) -> Stmt {
        let nv = self.fold_expr(value);
        let nb = self.fold_stmt(body);
        if !nb.defined() {
            return Stmt::undefined();
        }
        if !stmt_depends_on(&nb, &[sym]) {
            return nb;
        }
        if nv.same_as(value) && nb.same_as(body) {
            s.clone()
        } else {
            Stmt::let_stmt(sym, nv, nb)
        }
    }

    fn visit_allocate(
        &mut self,
        sym: SymbolId,
        storage: MemoryType,
        elem_size: Index,
        dims: &[crate::interval::DimExpr],
        body: &Stmt,
        s: &Stmt,
    ) -> Stmt {
        let ndims = self.fold_dims(dims);
        let bounds: BoxExpr = ndims.iter().map(|d| d.bounds.clone()).collect();
        let old = self.crops.set(sym, Some(bounds));
        let nbody = self.fold_stmt(body);
        self.crops.set(sym, old);
        if !nbody.defined() {
            return Stmt::undefined();
        }
        if nbody.same_as(body) && ndims.iter().zip(dims.iter()).all(|(x, y)| x.same_as(y)) {
            s.clone()
        } else {
            Stmt::allocate(sym, storage, elem_size, ndims, nbody)
        }
    }

    fn visit_crop_buffer(&mut self, sym: SymbolId, bounds: &BoxExpr, body: &Stmt, s: &Stmt) -> Stmt {
        let nbounds = self.fold_box(bounds);
        let current = self.crops.get(sym).cloned();
        let mut merged = current.clone().unwrap_or_default();
        merge_crop(&mut merged, &nbounds);
        if let Some(cur) = &current {
            if boxes_equal(&merged, cur) {
                // The crop narrows nothing.
                return self.fold_stmt(body);
            }
        } else if nbounds.iter().all(|i| !i.min.defined() && !i.max.defined()) {
            return self.fold_stmt(body);
        }
        let old = self.crops.set(sym, Some(merged));
        let nbody = self.fold_stmt(body);
        self.crops.set(sym, old);
        if !nbody.defined() {
            return Stmt::undefined();
        }
        if nbody.same_as(body) && nbounds.iter().zip(bounds.iter()).all(|(x, y)| x.same_as(y)) {
            s.clone()
        } else {
            Stmt::crop_buffer(sym, nbounds, nbody)
        }
    }

    fn visit_crop_dim(&mut self, sym: SymbolId, dim: usize, bounds: &Interval, body: &Stmt, s: &Stmt) -> Stmt {
        let nbounds = self.fold_interval(bounds);
        let current = self.crops.get(sym).cloned();
        let mut merged = current.clone().unwrap_or_default();
        merge_crop_dim(&mut merged, dim, &nbounds);
        if let Some(cur) = &current {
            if boxes_equal(&merged, cur) {
                return self.fold_stmt(body);
            }
        } else if !nbounds.min.defined() && !nbounds.max.defined() {
            return self.fold_stmt(body);
        }
        let old = self.crops.set(sym, Some(merged));
        let nbody = self.fold_stmt(body);
        self.crops.set(sym, old);
        if !nbody.defined() {
            return Stmt::undefined();
        }
        if nbody.same_as(body) && nbounds.same_as(bounds) {
            s.clone()
        } else {
            Stmt::crop_dim(sym, dim, nbounds, nbody)
        }
    }

    fn visit_make_buffer(
        &mut self,
        sym: SymbolId,
        base: &Expr,
        elem_size: &Expr,
        dims: &[crate::interval::DimExpr],
        body: &Stmt,
        s: &Stmt,
    ) -> Stmt {
        let result = folder::walk_make_buffer(self, sym, base, elem_size, dims, body, s);
        match result.node() {
            Some(StmtNode::MakeBuffer { body, .. }) if !body.defined() => Stmt::undefined(),
            _ => result,
        }
    }
}

// --- prove_true ---

/// True only if `e` provably evaluates to a nonzero value under every
/// assignment of its free variables. Never true on uncertain input.
pub fn prove_true(e: &Expr) -> bool {
    let s = simplify(e);
    prove_simplified(&s)
}

fn prove_simplified(e: &Expr) -> bool {
    if let Some(s) = as_scalar(e) {
        return matches!(s, Finite(c) if c != 0);
    }
    match e.node() {
        Some(ExprNode::Binary { op: BinaryOp::And, a, b }) => prove_simplified(a) && prove_simplified(b),
        Some(ExprNode::Binary { op: BinaryOp::Or, a, b }) => prove_simplified(a) || prove_simplified(b),
        Some(ExprNode::Binary { op: BinaryOp::Le, a, b }) | Some(ExprNode::Binary { op: BinaryOp::Lt, a, b }) => {
            let strict = matches!(e.node(), Some(ExprNode::Binary { op: BinaryOp::Lt, .. }));
            let diff = simplify(&(b.clone() - a.clone()));
            let bounds = bounds_of(&diff, &SymbolMap::new());
            match as_scalar(&bounds.min) {
                Some(Finite(c)) => {
                    if strict {
                        c > 0
                    } else {
                        c >= 0
                    }
                }
                Some(PosInf) => true,
                _ => false,
            }
        }
        _ => false,
    }
}

/// True only if `e` provably evaluates to zero.
pub fn prove_false(e: &Expr) -> bool {
    let s = simplify(e);
    matches!(as_scalar(&s), Some(Finite(0)))
}

// --- bounds_of ---

fn full_range() -> Interval {
    Interval::new(negative_infinity(), positive_infinity())
}

fn bool_range() -> Interval {
    Interval::new(Expr::constant(0), Expr::constant(1))
}

fn point_range(e: &Expr) -> Interval {
    Interval::point(e.clone())
}

/// Conservative bounds of `e`, treating free variables as unbounded unless
/// `scope` knows better. Endpoints are expressions; `±oo` marks the
/// unbounded sides.
pub fn bounds_of(e: &Expr, scope: &SymbolMap<Interval>) -> Interval {
    match e.node() {
        None => full_range(),
        Some(ExprNode::Constant(_)) => point_range(e),
        Some(ExprNode::Variable(sym)) => match scope.get(*sym) {
            Some(i) => i.clone(),
            None => full_range(),
        },
        Some(ExprNode::Wildcard(_)) => full_range(),
        Some(ExprNode::Let { sym, value, body }) => {
            let value_bounds = bounds_of(value, scope);
            let mut inner = scope.clone();
            inner.insert(*sym, value_bounds);
            bounds_of(body, &inner)
        }
        Some(ExprNode::Not(_)) => bool_range(),
        Some(ExprNode::Select {
            true_value,
            false_value,
            ..
        }) => {
            let t = bounds_of(true_value, scope);
            let f = bounds_of(false_value, scope);
            Interval::new(
                simplify(&ir::min(t.min, f.min)),
                simplify(&ir::max(t.max, f.max)),
            )
        }
        Some(ExprNode::Call { intrinsic, args }) => match intrinsic {
            Intrinsic::PositiveInfinity | Intrinsic::NegativeInfinity | Intrinsic::Indeterminate => {
                match as_scalar(e) {
                    Some(PosInf) => point_range(e),
                    Some(NegInf) => point_range(e),
                    _ => full_range(),
                }
            }
            Intrinsic::Abs if args.len() == 1 => {
                let inner = bounds_of(&args[0], scope);
                let hi = simplify(&ir::max(ir::abs(inner.min), ir::abs(inner.max)));
                Interval::new(Expr::constant(0), hi)
            }
            _ => full_range(),
        },
        Some(ExprNode::Binary { op, a, b }) => {
            let ba = bounds_of(a, scope);
            let bb = bounds_of(b, scope);
            match op {
                BinaryOp::Add => Interval::new(
                    simplify(&(ba.min + bb.min)),
                    simplify(&(ba.max + bb.max)),
                ),
                BinaryOp::Sub => Interval::new(
                    simplify(&(ba.min - bb.max)),
                    simplify(&(ba.max - bb.min)),
                ),
                BinaryOp::Mul => bounds_of_mul(&ba, &bb),
                BinaryOp::Div => bounds_of_div(&ba, &bb),
                BinaryOp::Mod => match point_constant(&bb) {
                    Some(c) if c > 0 => Interval::new(Expr::constant(0), Expr::constant(c - 1)),
                    _ => full_range(),
                },
                BinaryOp::Min => Interval::new(
                    simplify(&ir::min(ba.min, bb.min)),
                    simplify(&ir::min(ba.max, bb.max)),
                ),
                BinaryOp::Max => Interval::new(
                    simplify(&ir::max(ba.min, bb.min)),
                    simplify(&ir::max(ba.max, bb.max)),
                ),
                BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::And
                | BinaryOp::Or => bool_range(),
                _ => full_range(),
            }
        }
    }
}

fn point_constant(i: &Interval) -> Option<Index> {
    match (as_scalar(&i.min), as_scalar(&i.max)) {
        (Some(Finite(a)), Some(Finite(b))) if a == b => Some(a),
        _ => None,
    }
}

fn bounds_of_mul(a: &Interval, b: &Interval) -> Interval {
    let scale = |i: &Interval, c: Index| -> Interval {
        let lo = simplify(&(i.min.clone() * c));
        let hi = simplify(&(i.max.clone() * c));
        if c < 0 {
            Interval::new(hi, lo)
        } else {
            Interval::new(lo, hi)
        }
    };
    if let Some(c) = point_constant(b) {
        scale(a, c)
    } else if let Some(c) = point_constant(a) {
        scale(b, c)
    } else {
        full_range()
    }
}

fn bounds_of_div(a: &Interval, b: &Interval) -> Interval {
    match point_constant(b) {
        Some(c) if c > 0 => Interval::new(
            simplify(&(a.min.clone() / c)),
            simplify(&(a.max.clone() / c)),
        ),
        Some(c) if c < 0 => Interval::new(
            simplify(&(a.max.clone() / c)),
            simplify(&(a.min.clone() / c)),
        ),
        _ => full_range(),
    }
}

// --- where_true ---

fn no_solution() -> Interval {
    Interval::new(positive_infinity(), negative_infinity())
}

fn all_solutions() -> Interval {
    Interval::new(negative_infinity(), positive_infinity())
}

fn ceil_div(a: Index, b: Index) -> Index {
    floor_div(a + b - 1, b)
}

/// Interval of values of `x` for which `cond` is provably true, found by
/// solving comparisons affine in `x`. `.max == -oo` reports that nothing
/// was established; residual bounds that still mention other symbols are
/// a conservative failure, not an answer.
pub fn where_true(cond: &Expr, x: SymbolId) -> Interval {
    let c = simplify(cond);
    solve(&c, x)
}

fn solve(cond: &Expr, x: SymbolId) -> Interval {
    match cond.node() {
        Some(ExprNode::Binary { op: BinaryOp::And, a, b }) => {
            let ia = solve(a, x);
            let ib = solve(b, x);
            let i = ia.intersection(&ib);
            Interval::new(simplify(&i.min), simplify(&i.max))
        }
        Some(ExprNode::Binary { op: BinaryOp::Le, a, b }) => solve_compare(a, b, x, false),
        Some(ExprNode::Binary { op: BinaryOp::Lt, a, b }) => solve_compare(a, b, x, true),
        _ => {
            if !expr_depends_on(cond, x) && prove_true(cond) {
                all_solutions()
            } else {
                no_solution()
            }
        }
    }
}

fn solve_compare(a: &Expr, b: &Expr, x: SymbolId, strict: bool) -> Interval {
    let lin = match linear_of(&(b.clone() - a.clone())) {
        Some(lin) => lin,
        None => return no_solution(),
    };
    let x_var = Expr::var(x);
    let mut k = 0;
    for (t, c) in &lin.terms {
        if exprs_equal(t, &x_var) {
            k = *c;
        } else {
            // A residual bound in other symbols is not a usable solution.
            return no_solution();
        }
    }
    // Solving k*x + r >= bound over the integers.
    let r = lin.constant;
    let bound: Index = if strict { 1 } else { 0 };
    if k == 0 {
        return if r >= bound { all_solutions() } else { no_solution() };
    }
    if k > 0 {
        Interval::new(Expr::constant(ceil_div(bound - r, k)), positive_infinity())
    } else {
        Interval::new(negative_infinity(), Expr::constant(floor_div(r - bound, -k)))
    }
}
