//! Up-front validation of the statement tree handed to the middle end.
//!
//! Malformed input fails fast here with a located error; the rewrite
//! passes behind this gate are infallible. Checked: every symbol is bound
//! by an enclosing binder or declared external, no `slice_*` or
//! `truncate_rank` appears, crops stay within the rank of the buffers
//! whose rank is known, and no wildcard leaks into the tree.

use crate::error::{CompilerError, Result};
use crate::interval::{DimExpr, Interval};
use crate::ir::{Expr, ExprNode, NodeContext, Stmt, StmtNode, SymbolId};
use crate::scope::SymbolMap;

struct Validator<'a> {
    ctx: &'a NodeContext,
    bound: Vec<SymbolId>,
    ranks: SymbolMap<usize>,
}

impl<'a> Validator<'a> {
    fn name(&self, sym: SymbolId) -> String {
        self.ctx.name(sym)
    }

    fn check_sym(&self, sym: SymbolId, context: &str) -> Result<()> {
        if self.bound.contains(&sym) {
            Ok(())
        } else {
            Err(CompilerError::UnboundSymbol {
                name: self.name(sym),
                context: context.to_string(),
            })
        }
    }

    fn check_expr(&self, e: &Expr, context: &str) -> Result<()> {
        let node = match e.node() {
            Some(node) => node,
            None => return Ok(()),
        };
        match node {
            ExprNode::Variable(sym) => self.check_sym(*sym, context),
            ExprNode::Wildcard(_) => Err(CompilerError::WildcardInInput {
                context: context.to_string(),
            }),
            ExprNode::Constant(_) => Ok(()),
            ExprNode::Let { sym, value, body } => {
                self.check_expr(value, context)?;
                let mut inner = Validator {
                    ctx: self.ctx,
                    bound: self.bound.clone(),
                    ranks: self.ranks.clone(),
                };
                inner.bound.push(*sym);
                inner.check_expr(body, context)
            }
            ExprNode::Binary { a, b, .. } => {
                self.check_expr(a, context)?;
                self.check_expr(b, context)
            }
            ExprNode::Not(a) => self.check_expr(a, context),
            ExprNode::Select {
                condition,
                true_value,
                false_value,
            } => {
                self.check_expr(condition, context)?;
                self.check_expr(true_value, context)?;
                self.check_expr(false_value, context)
            }
            ExprNode::Call { args, .. } => {
                for a in args {
                    self.check_expr(a, context)?;
                }
                Ok(())
            }
        }
    }

    fn check_interval(&self, i: &Interval, context: &str) -> Result<()> {
        self.check_expr(&i.min, context)?;
        self.check_expr(&i.max, context)
    }

    fn check_dims(&self, dims: &[DimExpr], context: &str) -> Result<()> {
        for d in dims {
            self.check_interval(&d.bounds, context)?;
            self.check_expr(&d.stride, context)?;
            self.check_expr(&d.fold_factor, context)?;
        }
        Ok(())
    }

    fn check_crop_rank(&self, sym: SymbolId, dim: usize) -> Result<()> {
        if let Some(&rank) = self.ranks.get(sym) {
            if dim >= rank {
                return Err(CompilerError::RankMismatch {
                    buffer: self.name(sym),
                    dim,
                    rank,
                });
            }
        }
        Ok(())
    }

    fn check_stmt(&mut self, s: &Stmt) -> Result<()> {
        let node = match s.node() {
            Some(node) => node,
            None => return Ok(()),
        };
        match node {
            StmtNode::LetStmt { sym, value, body } => {
                self.check_expr(value, "let")?;
                self.scoped(*sym, None, body)
            }
            StmtNode::Block { a, b } => {
                self.check_stmt(a)?;
                self.check_stmt(b)
            }
            StmtNode::Loop {
                sym, bounds, step, body, ..
            } => {
                self.check_interval(bounds, "loop bounds")?;
                self.check_expr(step, "loop step")?;
                self.scoped(*sym, None, body)
            }
            StmtNode::IfThenElse {
                condition,
                then_body,
                else_body,
            } => {
                self.check_expr(condition, "if condition")?;
                self.check_stmt(then_body)?;
                self.check_stmt(else_body)
            }
            StmtNode::Allocate { sym, dims, body, .. } => {
                // Placeholder dims may query the buffer being allocated,
                // so the binding is visible to its own dims.
                self.bound.push(*sym);
                let result = self.check_dims(dims, "allocate dims");
                self.bound.pop();
                result?;
                self.scoped(*sym, Some(dims.len()), body)
            }
            StmtNode::MakeBuffer {
                sym,
                base,
                elem_size,
                dims,
                body,
            } => {
                self.check_expr(base, "make_buffer base")?;
                self.check_expr(elem_size, "make_buffer elem_size")?;
                self.bound.push(*sym);
                let result = self.check_dims(dims, "make_buffer dims");
                self.bound.pop();
                result?;
                self.scoped(*sym, Some(dims.len()), body)
            }
            StmtNode::CropBuffer { sym, bounds, body } => {
                self.check_sym(*sym, "crop_buffer")?;
                if !bounds.is_empty() {
                    self.check_crop_rank(*sym, bounds.len() - 1)?;
                }
                for i in bounds {
                    self.check_interval(i, "crop_buffer bounds")?;
                }
                self.check_stmt(body)
            }
            StmtNode::CropDim {
                sym, dim, bounds, body,
            } => {
                self.check_sym(*sym, "crop_dim")?;
                self.check_crop_rank(*sym, *dim)?;
                self.check_interval(bounds, "crop_dim bounds")?;
                self.check_stmt(body)
            }
            StmtNode::SliceBuffer { .. } => {
                Err(CompilerError::SliceBeforeInference {
                    construct: "slice_buffer",
                })
            }
            StmtNode::SliceDim { .. } => Err(CompilerError::SliceBeforeInference {
                construct: "slice_dim",
            }),
            StmtNode::TruncateRank { .. } => Err(CompilerError::SliceBeforeInference {
                construct: "truncate_rank",
            }),
            StmtNode::Call(call) => {
                for sym in call.inputs.iter().chain(call.outputs.iter()) {
                    self.check_sym(*sym, "call")?;
                }
                Ok(())
            }
            StmtNode::Copy { src, dst, .. } => {
                self.check_sym(*src, "copy")?;
                self.check_sym(*dst, "copy")
            }
            StmtNode::Check(condition) => self.check_expr(condition, "check"),
        }
    }

    fn scoped(&mut self, sym: SymbolId, rank: Option<usize>, body: &Stmt) -> Result<()> {
        self.bound.push(sym);
        let old_rank = match rank {
            Some(r) => Some(self.ranks.set(sym, Some(r))),
            None => None,
        };
        let result = self.check_stmt(body);
        if let Some(old) = old_rank {
            self.ranks.set(sym, old);
        }
        self.bound.pop();
        result
    }
}

/// Validate `s` against the middle end's input contract. `externals` are
/// the pipeline's input and output buffer symbols, considered bound.
pub fn validate(s: &Stmt, ctx: &NodeContext, externals: &[SymbolId]) -> Result<()> {
    let mut v = Validator {
        ctx,
        bound: externals.to_vec(),
        ranks: SymbolMap::new(),
    };
    v.check_stmt(s)
}
