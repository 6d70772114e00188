//! Interpreter for compiled statement trees.
//!
//! The interpreter executes the tree a pipeline compiles to: it allocates
//! intermediate buffers, applies crops as clamped metadata narrowing,
//! runs loops (parallel loops run sequentially, which is a legal
//! schedule), invokes stage callables, and raises on failed checks.
//!
//! Scalar evaluation maps the infinity sentinels to `Index::MAX`/`MIN`;
//! they survive only inside checks against unfolded dimensions, where
//! comparison is all that happens to them.

use crate::buffer::{BufferDim, RawBuffer};
use crate::diags::print_expr;
use crate::error::EvalError;
use crate::interval::DimExpr;
use crate::ir::{BinaryOp, Expr, ExprNode, Index, Intrinsic, Stmt, StmtNode, SymbolId};
use crate::scope::SymbolMap;
use crate::simplify::{floor_div, floor_mod};

/// A value bound to a symbol during evaluation.
#[derive(Debug, Clone)]
pub enum Value {
    Index(Index),
    Buffer(RawBuffer),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Index(_) => "scalar",
            Value::Buffer(_) => "buffer",
        }
    }
}

/// Evaluation environment: a value per bound symbol.
#[derive(Default)]
pub struct EvalContext {
    values: SymbolMap<Value>,
}

impl EvalContext {
    pub fn new() -> EvalContext {
        EvalContext::default()
    }

    pub fn bind_index(&mut self, sym: SymbolId, value: Index) -> Option<Value> {
        self.values.set(sym, Some(Value::Index(value)))
    }

    pub fn bind_buffer(&mut self, sym: SymbolId, buffer: RawBuffer) -> Option<Value> {
        self.values.set(sym, Some(Value::Buffer(buffer)))
    }

    fn lookup(&self, sym: SymbolId) -> Result<&Value, EvalError> {
        self.values.get(sym).ok_or(EvalError::UndefinedValue(format!("<{}>", sym.0)))
    }

    fn index(&self, sym: SymbolId) -> Result<Index, EvalError> {
        match self.lookup(sym)? {
            Value::Index(v) => Ok(*v),
            v => Err(EvalError::WrongValueKind(format!("<{}>", sym.0), v.kind(), "scalar")),
        }
    }

    fn buffer(&self, sym: SymbolId) -> Result<RawBuffer, EvalError> {
        match self.lookup(sym)? {
            Value::Buffer(b) => Ok(b.clone()),
            v => Err(EvalError::WrongValueKind(format!("<{}>", sym.0), v.kind(), "buffer")),
        }
    }
}

// The buffer argument of a metadata query must be a variable naming a
// live buffer.
fn buffer_arg(e: &Expr, ctx: &EvalContext) -> Result<RawBuffer, EvalError> {
    match e.as_variable() {
        Some(sym) => ctx.buffer(sym),
        None => Err(EvalError::Unsupported("buffer metadata of a non-variable")),
    }
}

fn dim_arg(e: &Expr, ctx: &EvalContext) -> Result<usize, EvalError> {
    let d = eval_expr(e, ctx)?;
    usize::try_from(d).map_err(|_| EvalError::Unsupported("negative dimension index"))
}

fn truthy(v: Index) -> bool {
    v != 0
}

/// Evaluate a scalar expression in `ctx`.
pub fn eval_expr(e: &Expr, ctx: &EvalContext) -> Result<Index, EvalError> {
    let node = match e.node() {
        Some(node) => node,
        None => return Err(EvalError::UndefinedValue("<undefined expr>".to_string())),
    };
    match node {
        ExprNode::Constant(c) => Ok(*c),
        ExprNode::Variable(sym) => ctx.index(*sym),
        ExprNode::Wildcard(_) => Err(EvalError::Unsupported("wildcard evaluation")),
        ExprNode::Let { sym, value, body } => {
            // Value may be a buffer alias; thread it through as a value.
            let bound = match value.as_variable() {
                Some(src) if matches!(ctx.lookup(src), Ok(Value::Buffer(_))) => {
                    Value::Buffer(ctx.buffer(src)?)
                }
                _ => Value::Index(eval_expr(value, ctx)?),
            };
            // A shared context would need interior mutability here; clone
            // the cheap map instead.
            let mut inner = EvalContext {
                values: clone_values(&ctx.values),
            };
            inner.values.set(*sym, Some(bound));
            eval_expr(body, &inner)
        }
        ExprNode::Binary { op, a, b } => {
            let x = eval_expr(a, ctx)?;
            let y = eval_expr(b, ctx)?;
            eval_binary(*op, x, y)
        }
        ExprNode::Not(a) => Ok(!truthy(eval_expr(a, ctx)?) as Index),
        ExprNode::Select {
            condition,
            true_value,
            false_value,
        } => {
            if truthy(eval_expr(condition, ctx)?) {
                eval_expr(true_value, ctx)
            } else {
                eval_expr(false_value, ctx)
            }
        }
        ExprNode::Call { intrinsic, args } => eval_call(*intrinsic, args, ctx),
    }
}

fn clone_values(values: &SymbolMap<Value>) -> SymbolMap<Value> {
    let mut out = SymbolMap::new();
    for (sym, v) in values.iter() {
        out.insert(sym, v.clone());
    }
    out
}

fn eval_binary(op: BinaryOp, x: Index, y: Index) -> Result<Index, EvalError> {
    let v = match op {
        BinaryOp::Add => x.wrapping_add(y),
        BinaryOp::Sub => x.wrapping_sub(y),
        BinaryOp::Mul => x.wrapping_mul(y),
        BinaryOp::Div => {
            if y == 0 {
                return Err(EvalError::DivideByZero);
            }
            floor_div(x, y)
        }
        BinaryOp::Mod => {
            if y == 0 {
                return Err(EvalError::DivideByZero);
            }
            floor_mod(x, y)
        }
        BinaryOp::Min => x.min(y),
        BinaryOp::Max => x.max(y),
        BinaryOp::Eq => (x == y) as Index,
        BinaryOp::Ne => (x != y) as Index,
        BinaryOp::Lt => (x < y) as Index,
        BinaryOp::Le => (x <= y) as Index,
        BinaryOp::And => (truthy(x) && truthy(y)) as Index,
        BinaryOp::Or => (truthy(x) || truthy(y)) as Index,
        BinaryOp::BitAnd => x & y,
        BinaryOp::BitOr => x | y,
        BinaryOp::BitXor => x ^ y,
        BinaryOp::Shl => x.wrapping_shl(y as u32),
        BinaryOp::Shr => x.wrapping_shr(y as u32),
    };
    Ok(v)
}

fn eval_call(intrinsic: Intrinsic, args: &[Expr], ctx: &EvalContext) -> Result<Index, EvalError> {
    match intrinsic {
        Intrinsic::PositiveInfinity => Ok(Index::MAX),
        Intrinsic::NegativeInfinity => Ok(Index::MIN),
        Intrinsic::Indeterminate => Err(EvalError::Indeterminate),
        Intrinsic::Abs => Ok(eval_expr(&args[0], ctx)?.wrapping_abs()),
        Intrinsic::BufferRank => Ok(buffer_arg(&args[0], ctx)?.rank() as Index),
        Intrinsic::BufferElemSize => Ok(buffer_arg(&args[0], ctx)?.elem_size as Index),
        Intrinsic::BufferSizeBytes => Ok(buffer_arg(&args[0], ctx)?.size_bytes() as Index),
        Intrinsic::BufferMin => {
            let b = buffer_arg(&args[0], ctx)?;
            Ok(b.min(dim_arg(&args[1], ctx)?))
        }
        Intrinsic::BufferMax => {
            let b = buffer_arg(&args[0], ctx)?;
            Ok(b.max(dim_arg(&args[1], ctx)?))
        }
        Intrinsic::BufferExtent => {
            let b = buffer_arg(&args[0], ctx)?;
            Ok(b.extent(dim_arg(&args[1], ctx)?))
        }
        Intrinsic::BufferStride => {
            let b = buffer_arg(&args[0], ctx)?;
            Ok(b.stride(dim_arg(&args[1], ctx)?))
        }
        Intrinsic::BufferFoldFactor => {
            let b = buffer_arg(&args[0], ctx)?;
            Ok(b.fold_factor(dim_arg(&args[1], ctx)?).unwrap_or(Index::MAX))
        }
        Intrinsic::BufferBase | Intrinsic::BufferAt => {
            Err(EvalError::Unsupported("address-of intrinsics"))
        }
    }
}

// Evaluate dims of an allocation to runtime descriptors. An undefined
// fold factor (or one that reads as +oo) is unfolded storage.
fn eval_dims(dims: &[DimExpr], ctx: &EvalContext) -> Result<Vec<BufferDim>, EvalError> {
    let mut out = Vec::with_capacity(dims.len());
    for d in dims {
        let min = eval_expr(&d.bounds.min, ctx)?;
        let max = eval_expr(&d.bounds.max, ctx)?;
        let stride = eval_expr(&d.stride, ctx)?;
        let fold_factor = if d.fold_factor.defined() {
            let f = eval_expr(&d.fold_factor, ctx)?;
            if f == Index::MAX {
                None
            } else {
                Some(f)
            }
        } else {
            None
        };
        out.push(BufferDim {
            min,
            extent: max - min + 1,
            stride,
            fold_factor,
        });
    }
    Ok(out)
}

/// Execute a statement tree in `ctx`.
pub fn eval_stmt(s: &Stmt, ctx: &mut EvalContext) -> Result<(), EvalError> {
    let node = match s.node() {
        Some(node) => node,
        None => return Ok(()),
    };
    match node {
        StmtNode::LetStmt { sym, value, body } => {
            let bound = match value.as_variable() {
                Some(src) if matches!(ctx.lookup(src), Ok(Value::Buffer(_))) => {
                    Value::Buffer(ctx.buffer(src)?)
                }
                _ => Value::Index(eval_expr(value, ctx)?),
            };
            let old = ctx.values.set(*sym, Some(bound));
            let result = eval_stmt(body, ctx);
            ctx.values.set(*sym, old);
            result
        }
        StmtNode::Block { a, b } => {
            eval_stmt(a, ctx)?;
            eval_stmt(b, ctx)
        }
        StmtNode::Loop {
            sym, bounds, step, body, ..
        } => {
            // Parallel loops execute sequentially; that is one of their
            // legal schedules.
            let lo = eval_expr(&bounds.min, ctx)?;
            let hi = eval_expr(&bounds.max, ctx)?;
            let step = eval_expr(step, ctx)?;
            if step <= 0 {
                return Err(EvalError::Unsupported("non-positive loop step"));
            }
            let mut x = lo;
            while x <= hi {
                let old = ctx.values.set(*sym, Some(Value::Index(x)));
                let result = eval_stmt(body, ctx);
                ctx.values.set(*sym, old);
                result?;
                x += step;
            }
            Ok(())
        }
        StmtNode::IfThenElse {
            condition,
            then_body,
            else_body,
        } => {
            if truthy(eval_expr(condition, ctx)?) {
                eval_stmt(then_body, ctx)
            } else {
                eval_stmt(else_body, ctx)
            }
        }
        StmtNode::Allocate {
            sym,
            elem_size,
            dims,
            body,
            ..
        } => {
            let dims = eval_dims(dims, ctx)?;
            let buffer = RawBuffer::allocate(*elem_size as usize, dims);
            let old = ctx.values.set(*sym, Some(Value::Buffer(buffer)));
            let result = eval_stmt(body, ctx);
            ctx.values.set(*sym, old);
            result
        }
        StmtNode::CropBuffer { sym, bounds, body } => {
            let mut buffer = ctx.buffer(*sym)?;
            for (d, i) in bounds.iter().enumerate() {
                if d >= buffer.rank() {
                    break;
                }
                let min = if i.min.defined() { eval_expr(&i.min, ctx)? } else { buffer.min(d) };
                let max = if i.max.defined() { eval_expr(&i.max, ctx)? } else { buffer.max(d) };
                buffer = buffer.crop_dim(d, min, max);
            }
            let old = ctx.values.set(*sym, Some(Value::Buffer(buffer)));
            let result = eval_stmt(body, ctx);
            ctx.values.set(*sym, old);
            result
        }
        StmtNode::CropDim {
            sym, dim, bounds, body,
        } => {
            let buffer = ctx.buffer(*sym)?;
            let min = if bounds.min.defined() {
                eval_expr(&bounds.min, ctx)?
            } else {
                buffer.min(*dim)
            };
            let max = if bounds.max.defined() {
                eval_expr(&bounds.max, ctx)?
            } else {
                buffer.max(*dim)
            };
            let cropped = buffer.crop_dim(*dim, min, max);
            let old = ctx.values.set(*sym, Some(Value::Buffer(cropped)));
            let result = eval_stmt(body, ctx);
            ctx.values.set(*sym, old);
            result
        }
        StmtNode::Call(call) => {
            let mut inputs = Vec::with_capacity(call.inputs.len());
            for sym in &call.inputs {
                inputs.push(ctx.buffer(*sym)?);
            }
            let mut outputs = Vec::with_capacity(call.outputs.len());
            for sym in &call.outputs {
                outputs.push(ctx.buffer(*sym)?);
            }
            // Empty output regions are legal; producers simply do nothing.
            if outputs.iter().any(|b| b.dims.iter().any(|d| d.extent <= 0)) {
                return Ok(());
            }
            (call.target.0)(&inputs, &outputs)
        }
        StmtNode::Copy { src, dst, padding } => {
            let src = ctx.buffer(*src)?;
            let dst = ctx.buffer(*dst)?;
            let mut failure = None;
            dst.for_each_index(|at| {
                if failure.is_some() {
                    return;
                }
                if src.contains(at) {
                    match src.read_bytes(at) {
                        Some(bytes) => {
                            dst.write_bytes(at, &bytes);
                        }
                        None => failure = Some(EvalError::OutOfBounds { at: at.to_vec() }),
                    }
                } else if !padding.is_empty() {
                    dst.write_bytes(at, padding);
                }
            });
            match failure {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        StmtNode::Check(condition) => {
            if truthy(eval_expr(condition, ctx)?) {
                Ok(())
            } else {
                Err(EvalError::CheckFailed(print_expr(condition, None)))
            }
        }
        StmtNode::MakeBuffer { .. }
        | StmtNode::SliceBuffer { .. }
        | StmtNode::SliceDim { .. }
        | StmtNode::TruncateRank { .. } => Err(EvalError::Unsupported("buffer reshaping statements")),
    }
}
