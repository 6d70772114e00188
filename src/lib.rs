//! sluice: the middle end of a pipeline scheduling language.
//!
//! A front end (the [`pipeline`] builder here, or any producer honoring
//! the same contract) lowers a DAG of stages into a statement tree in
//! which every producer is wrapped in crops expressing its consumer's
//! demand symbolically. This crate transforms that tree so that:
//!
//! - every allocation is sized to exactly the region downstream
//!   consumers read (bounds inference);
//! - producers inside serial loops compute only the incremental region
//!   per iteration where demands overlap and march forward, and their
//!   storage folds to the live window (sliding window / storage folding);
//! - single-consumer elementwise intermediates alias their consumer's
//!   output, dead crops disappear, and statements move out of scopes
//!   they do not need.
//!
//! The result is interpreted by [`eval`] against concrete buffers.

pub mod buffer;
pub mod diags;
pub mod error;
pub mod eval;
pub mod infer;
pub mod interval;
pub mod ir;
pub mod optimize;
pub mod pipeline;
pub mod scope;
pub mod simplify;
pub mod slide;
pub mod substitute;
pub mod validate;

#[cfg(test)]
mod infer_tests;
#[cfg(test)]
mod pipeline_tests;
#[cfg(test)]
mod scope_tests;
#[cfg(test)]
mod simplify_tests;
#[cfg(test)]
mod substitute_tests;

pub use error::{CompilerError, EvalError, Result};
pub use interval::{BoxExpr, DimExpr, Interval};
pub use ir::{Expr, Index, LoopMode, MemoryType, NodeContext, Stmt, SymbolId};

// =============================================================================
// Typestate middle-end pipeline
// =============================================================================
//
// Each struct is a stage; methods consume `self` and return the next
// stage, enforcing pass order:
//
//   Built::new(body)
//     -> .infer_bounds(ctx, inputs, outputs)   -> Inferred  (validates first)
//       -> .slide_and_fold(ctx)                -> Slid
//         -> .optimize()                       -> Compiled
//
// `compile` chains the whole thing.

/// A builder-produced statement tree, not yet checked or inferred.
pub struct Built {
    pub body: Stmt,
}

impl Built {
    pub fn new(body: Stmt) -> Built {
        Built { body }
    }

    /// Validate the input contract, then size every allocation from its
    /// consumers' demands and emit input sufficiency checks.
    pub fn infer_bounds(self, ctx: &NodeContext, inputs: &[SymbolId], outputs: &[SymbolId]) -> Result<Inferred> {
        let externals: Vec<SymbolId> = inputs.iter().chain(outputs.iter()).copied().collect();
        validate::validate(&self.body, ctx, &externals)?;
        Ok(Inferred {
            body: infer::infer_bounds(&self.body, inputs),
        })
    }
}

/// Bounds have been inferred; demands are still phrased through crops.
pub struct Inferred {
    pub body: Stmt,
}

impl Inferred {
    /// Apply sliding-window and storage-folding rewrites inside serial
    /// loops. Must run before simplification collapses the crops it
    /// reads.
    pub fn slide_and_fold(self, ctx: &mut NodeContext) -> Slid {
        Slid {
            body: slide::slide_and_fold(&self.body, ctx),
        }
    }
}

/// Sliding and folding decisions are final.
pub struct Slid {
    pub body: Stmt,
}

impl Slid {
    /// Cleanup: drop input crops, simplify, reduce scopes, alias
    /// buffers, optimize copies, then simplify and reduce scopes again.
    pub fn optimize(self) -> Compiled {
        let s = optimize::remove_input_crops(&self.body);
        let s = simplify::simplify_stmt(&s);
        let s = optimize::reduce_scopes(&s);
        let s = optimize::alias_buffers(&s);
        let s = optimize::optimize_copies(&s);
        let s = simplify::simplify_stmt(&s);
        Compiled {
            body: optimize::reduce_scopes(&s),
        }
    }
}

/// The final statement tree, ready for the interpreter.
pub struct Compiled {
    pub body: Stmt,
}

/// Run the whole middle end over `s`: validation, bounds inference,
/// slide-and-fold, and the cleanup passes, in their fixed order.
pub fn compile(s: &Stmt, ctx: &mut NodeContext, inputs: &[SymbolId], outputs: &[SymbolId]) -> Result<Stmt> {
    let compiled = Built::new(s.clone())
        .infer_bounds(ctx, inputs, outputs)?
        .slide_and_fold(ctx)
        .optimize();
    Ok(compiled.body)
}
