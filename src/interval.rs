//! Symbolic intervals, boxes and dimension descriptors.
//!
//! An interval is inclusive on both ends; undefined endpoints read as
//! minus/plus infinity. `union` is the hull, not the set union.

use crate::ir::{lt, max, min, Expr};

/// `{x : min <= x <= max}` over symbolic endpoints.
#[derive(Debug, Clone, Default)]
pub struct Interval {
    pub min: Expr,
    pub max: Expr,
}

// min/max where an undefined operand reads as -oo / +oo.
fn min_with_undef(a: Expr, b: Expr) -> Expr {
    if !a.defined() || !b.defined() {
        Expr::undefined()
    } else {
        min(a, b)
    }
}

fn max_with_undef(a: Expr, b: Expr) -> Expr {
    if !a.defined() || !b.defined() {
        Expr::undefined()
    } else {
        max(a, b)
    }
}

impl Interval {
    pub fn new(min: Expr, max: Expr) -> Interval {
        Interval { min, max }
    }

    /// The single-point interval `[e, e]`.
    pub fn point(e: Expr) -> Interval {
        Interval {
            min: e.clone(),
            max: e,
        }
    }

    pub fn undefined() -> Interval {
        Interval::default()
    }

    pub fn extent(&self) -> Expr {
        self.max.clone() - self.min.clone() + 1
    }

    /// Condition under which the interval is empty: `max < min`.
    pub fn empty(&self) -> Expr {
        lt(self.max.clone(), self.min.clone())
    }

    pub fn same_as(&self, other: &Interval) -> bool {
        self.min.same_as(&other.min) && self.max.same_as(&other.max)
    }

    /// Hull of the two intervals.
    pub fn union(&self, r: &Interval) -> Interval {
        Interval {
            min: min_with_undef(self.min.clone(), r.min.clone()),
            max: max_with_undef(self.max.clone(), r.max.clone()),
        }
    }

    /// Intersection: max of the mins, min of the maxes. An undefined
    /// endpoint is no constraint, so the other side wins.
    pub fn intersection(&self, r: &Interval) -> Interval {
        let min = if !self.min.defined() {
            r.min.clone()
        } else if !r.min.defined() {
            self.min.clone()
        } else {
            max(self.min.clone(), r.min.clone())
        };
        let max = if !self.max.defined() {
            r.max.clone()
        } else if !r.max.defined() {
            self.max.clone()
        } else {
            crate::ir::min(self.max.clone(), r.max.clone())
        };
        Interval { min, max }
    }

    pub fn offset(&self, by: Expr) -> Interval {
        Interval {
            min: self.min.clone() + by.clone(),
            max: self.max.clone() + by,
        }
    }
}

/// One interval per buffer dimension; rank is the length.
pub type BoxExpr = Vec<Interval>;

/// Pointwise hull of two boxes, extending the shorter one.
pub fn union_boxes(a: &mut BoxExpr, b: &BoxExpr) {
    while a.len() < b.len() {
        a.push(Interval::undefined());
    }
    for (d, i) in b.iter().enumerate() {
        let merged = if a[d].min.defined() || a[d].max.defined() {
            a[d].union(i)
        } else {
            i.clone()
        };
        a[d] = merged;
    }
}

/// Overlay a crop of one dimension onto `bounds`: defined endpoints
/// override, undefined endpoints keep what was there.
pub fn merge_crop_dim(bounds: &mut BoxExpr, dim: usize, new_bounds: &Interval) {
    while bounds.len() <= dim {
        bounds.push(Interval::undefined());
    }
    if new_bounds.min.defined() {
        bounds[dim].min = new_bounds.min.clone();
    }
    if new_bounds.max.defined() {
        bounds[dim].max = new_bounds.max.clone();
    }
}

/// Overlay a whole-box crop onto `bounds`, dimension by dimension.
pub fn merge_crop(bounds: &mut BoxExpr, new_bounds: &BoxExpr) {
    for (d, i) in new_bounds.iter().enumerate() {
        merge_crop_dim(bounds, d, i);
    }
}

/// Descriptor of one buffer dimension: bounds, byte stride, and the fold
/// factor (undefined means unfolded). A folded dimension stores index `i`
/// at `(i mod fold_factor) * stride`.
#[derive(Debug, Clone, Default)]
pub struct DimExpr {
    pub bounds: Interval,
    pub stride: Expr,
    pub fold_factor: Expr,
}

impl DimExpr {
    pub fn new(bounds: Interval, stride: Expr, fold_factor: Expr) -> DimExpr {
        DimExpr {
            bounds,
            stride,
            fold_factor,
        }
    }

    pub fn same_as(&self, other: &DimExpr) -> bool {
        self.bounds.same_as(&other.bounds)
            && self.stride.same_as(&other.stride)
            && self.fold_factor.same_as(&other.fold_factor)
    }
}
