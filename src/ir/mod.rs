//! Core IR for the sluice middle end.
//!
//! Scalar expressions and statements are immutable trees shared through
//! `Rc`; an `Expr`/`Stmt` handle is cheap to clone and `same_as` compares
//! node identity, which is how passes detect that a rewrite changed
//! nothing. The undefined sentinel (no node at all) doubles as "no bound"
//! in intervals and "unfolded" in dimension descriptors.
//!
//! This representation assumes:
//! - All arithmetic is over signed machine integers (`Index`); the
//!   infinities and `indeterminate` are nullary intrinsic calls.
//! - Buffer metadata is queried symbolically through `buffer_*`
//!   intrinsics and resolved by the bounds passes, not stored on nodes.
//! - Statement trees have no cycles; a symbol is bound by an enclosing
//!   `let`, `loop`, `allocate`, `make_buffer`, or is a pipeline input or
//!   output.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexSet;

use crate::buffer::RawBuffer;
use crate::error::EvalError;
use crate::interval::{BoxExpr, DimExpr, Interval};

pub mod folder;


/// Scalar type of the IR: indices, extents, strides and element values all
/// share it.
pub type Index = i64;

/// Dense identifier for a name interned in a [`NodeContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for SymbolId {
    fn from(id: u32) -> Self {
        SymbolId(id)
    }
}

/// Interning symbol table. Maps strings to dense ids for the lifetime of
/// one compilation; ids are never recycled.
#[derive(Debug, Clone, Default)]
pub struct NodeContext {
    names: IndexSet<String>,
}

impl NodeContext {
    pub fn new() -> Self {
        NodeContext::default()
    }

    /// Get or intern a symbol id for `name`.
    pub fn insert(&mut self, name: &str) -> SymbolId {
        let (i, _) = self.names.insert_full(name.to_string());
        SymbolId(i as u32)
    }

    /// Intern a fresh symbol, freshening `name` with a numeric suffix if it
    /// is already taken. Used for compiler-introduced symbols like warm-up
    /// loop minimums, which must never collide with user names.
    pub fn insert_unique(&mut self, name: &str) -> SymbolId {
        if !self.names.contains(name) {
            return self.insert(name);
        }
        let mut n = 1usize;
        loop {
            let candidate = format!("{}.{}", name, n);
            if !self.names.contains(&candidate) {
                return self.insert(&candidate);
            }
            n += 1;
        }
    }

    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.names.get_index_of(name).map(|i| SymbolId(i as u32))
    }

    /// Name of a symbol id; ids minted elsewhere print as `<id>`.
    pub fn name(&self, sym: SymbolId) -> String {
        match self.names.get_index(sym.index()) {
            Some(name) => name.clone(),
            None => format!("<{}>", sym.0),
        }
    }

    /// Convenience: intern `name` and wrap it in a variable expression.
    pub fn var(&mut self, name: &str) -> Expr {
        Expr::var(self.insert(name))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Binary operators of the scalar IR. Division and modulo are
/// floor-semantics; `And`/`Or` are logical (any nonzero operand is true,
/// the result is 0 or 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Eq,
    Ne,
    Lt,
    Le,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

/// Intrinsics recognized by substitution, simplification and evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    PositiveInfinity,
    NegativeInfinity,
    Indeterminate,
    Abs,
    BufferRank,
    BufferBase,
    BufferElemSize,
    BufferSizeBytes,
    BufferMin,
    BufferMax,
    BufferExtent,
    BufferStride,
    BufferFoldFactor,
    BufferAt,
}

impl Intrinsic {
    pub fn name(self) -> &'static str {
        match self {
            Intrinsic::PositiveInfinity => "oo",
            Intrinsic::NegativeInfinity => "-oo",
            Intrinsic::Indeterminate => "indeterminate",
            Intrinsic::Abs => "abs",
            Intrinsic::BufferRank => "buffer_rank",
            Intrinsic::BufferBase => "buffer_base",
            Intrinsic::BufferElemSize => "buffer_elem_size",
            Intrinsic::BufferSizeBytes => "buffer_size_bytes",
            Intrinsic::BufferMin => "buffer_min",
            Intrinsic::BufferMax => "buffer_max",
            Intrinsic::BufferExtent => "buffer_extent",
            Intrinsic::BufferStride => "buffer_stride",
            Intrinsic::BufferFoldFactor => "buffer_fold_factor",
            Intrinsic::BufferAt => "buffer_at",
        }
    }
}

#[derive(Debug)]
pub enum ExprNode {
    Variable(SymbolId),
    /// Matches any expression in `exprs_match`, unifying across repeated
    /// occurrences of the same id. Never valid in an input tree.
    Wildcard(SymbolId),
    Constant(Index),
    Let {
        sym: SymbolId,
        value: Expr,
        body: Expr,
    },
    Binary {
        op: BinaryOp,
        a: Expr,
        b: Expr,
    },
    Not(Expr),
    Select {
        condition: Expr,
        true_value: Expr,
        false_value: Expr,
    },
    Call {
        intrinsic: Intrinsic,
        args: Vec<Expr>,
    },
}

/// Shared handle to an immutable scalar expression, or the undefined
/// sentinel.
#[derive(Debug, Clone, Default)]
pub struct Expr {
    node: Option<Rc<ExprNode>>,
}

impl Expr {
    pub fn undefined() -> Expr {
        Expr { node: None }
    }

    pub fn defined(&self) -> bool {
        self.node.is_some()
    }

    pub fn node(&self) -> Option<&ExprNode> {
        self.node.as_deref()
    }

    /// Node identity. Both-undefined counts as the same.
    pub fn same_as(&self, other: &Expr) -> bool {
        match (&self.node, &other.node) {
            (None, None) => true,
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn make(node: ExprNode) -> Expr {
        Expr {
            node: Some(Rc::new(node)),
        }
    }

    pub fn var(sym: SymbolId) -> Expr {
        Expr::make(ExprNode::Variable(sym))
    }

    pub fn wildcard(sym: SymbolId) -> Expr {
        Expr::make(ExprNode::Wildcard(sym))
    }

    pub fn constant(value: Index) -> Expr {
        Expr::make(ExprNode::Constant(value))
    }

    pub fn let_in(sym: SymbolId, value: Expr, body: Expr) -> Expr {
        Expr::make(ExprNode::Let { sym, value, body })
    }

    pub fn binary(op: BinaryOp, a: Expr, b: Expr) -> Expr {
        Expr::make(ExprNode::Binary { op, a, b })
    }

    pub fn not(a: Expr) -> Expr {
        Expr::make(ExprNode::Not(a))
    }

    pub fn select(condition: Expr, true_value: Expr, false_value: Expr) -> Expr {
        Expr::make(ExprNode::Select {
            condition,
            true_value,
            false_value,
        })
    }

    pub fn call(intrinsic: Intrinsic, args: Vec<Expr>) -> Expr {
        Expr::make(ExprNode::Call { intrinsic, args })
    }

    pub fn as_constant(&self) -> Option<Index> {
        match self.node() {
            Some(ExprNode::Constant(c)) => Some(*c),
            _ => None,
        }
    }

    pub fn as_variable(&self) -> Option<SymbolId> {
        match self.node() {
            Some(ExprNode::Variable(sym)) => Some(*sym),
            _ => None,
        }
    }

    pub fn is_constant(&self, value: Index) -> bool {
        self.as_constant() == Some(value)
    }
}

impl From<Index> for Expr {
    fn from(value: Index) -> Expr {
        Expr::constant(value)
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Expr {
        Expr::constant(value as Index)
    }
}

macro_rules! impl_binary_operator {
    ($trait:ident, $fn:ident, $op:ident) => {
        impl std::ops::$trait for Expr {
            type Output = Expr;
            fn $fn(self, rhs: Expr) -> Expr {
                Expr::binary(BinaryOp::$op, self, rhs)
            }
        }
        impl std::ops::$trait<Index> for Expr {
            type Output = Expr;
            fn $fn(self, rhs: Index) -> Expr {
                Expr::binary(BinaryOp::$op, self, Expr::constant(rhs))
            }
        }
    };
}

impl_binary_operator!(Add, add, Add);
impl_binary_operator!(Sub, sub, Sub);
impl_binary_operator!(Mul, mul, Mul);
impl_binary_operator!(Div, div, Div);
impl_binary_operator!(Rem, rem, Mod);

pub fn min(a: Expr, b: Expr) -> Expr {
    Expr::binary(BinaryOp::Min, a, b)
}

pub fn max(a: Expr, b: Expr) -> Expr {
    Expr::binary(BinaryOp::Max, a, b)
}

pub fn eq(a: Expr, b: Expr) -> Expr {
    Expr::binary(BinaryOp::Eq, a, b)
}

pub fn ne(a: Expr, b: Expr) -> Expr {
    Expr::binary(BinaryOp::Ne, a, b)
}

pub fn lt(a: Expr, b: Expr) -> Expr {
    Expr::binary(BinaryOp::Lt, a, b)
}

pub fn le(a: Expr, b: Expr) -> Expr {
    Expr::binary(BinaryOp::Le, a, b)
}

pub fn gt(a: Expr, b: Expr) -> Expr {
    lt(b, a)
}

pub fn ge(a: Expr, b: Expr) -> Expr {
    le(b, a)
}

pub fn and(a: Expr, b: Expr) -> Expr {
    Expr::binary(BinaryOp::And, a, b)
}

pub fn or(a: Expr, b: Expr) -> Expr {
    Expr::binary(BinaryOp::Or, a, b)
}

pub fn abs(x: Expr) -> Expr {
    Expr::call(Intrinsic::Abs, vec![x])
}

pub fn positive_infinity() -> Expr {
    Expr::call(Intrinsic::PositiveInfinity, vec![])
}

pub fn negative_infinity() -> Expr {
    Expr::call(Intrinsic::NegativeInfinity, vec![])
}

pub fn indeterminate() -> Expr {
    Expr::call(Intrinsic::Indeterminate, vec![])
}

fn is_nullary_call(e: &Expr, intrinsic: Intrinsic) -> bool {
    matches!(e.node(), Some(ExprNode::Call { intrinsic: i, args }) if *i == intrinsic && args.is_empty())
}

pub fn is_positive_infinity(e: &Expr) -> bool {
    is_nullary_call(e, Intrinsic::PositiveInfinity)
}

pub fn is_negative_infinity(e: &Expr) -> bool {
    is_nullary_call(e, Intrinsic::NegativeInfinity)
}

pub fn is_indeterminate(e: &Expr) -> bool {
    is_nullary_call(e, Intrinsic::Indeterminate)
}

fn buffer_meta(intrinsic: Intrinsic, buf: Expr, dim: usize) -> Expr {
    Expr::call(intrinsic, vec![buf, Expr::constant(dim as Index)])
}

pub fn buffer_min(buf: Expr, dim: usize) -> Expr {
    buffer_meta(Intrinsic::BufferMin, buf, dim)
}

pub fn buffer_max(buf: Expr, dim: usize) -> Expr {
    buffer_meta(Intrinsic::BufferMax, buf, dim)
}

pub fn buffer_extent(buf: Expr, dim: usize) -> Expr {
    buffer_meta(Intrinsic::BufferExtent, buf, dim)
}

pub fn buffer_stride(buf: Expr, dim: usize) -> Expr {
    buffer_meta(Intrinsic::BufferStride, buf, dim)
}

pub fn buffer_fold_factor(buf: Expr, dim: usize) -> Expr {
    buffer_meta(Intrinsic::BufferFoldFactor, buf, dim)
}

pub fn buffer_rank(buf: Expr) -> Expr {
    Expr::call(Intrinsic::BufferRank, vec![buf])
}

pub fn buffer_base(buf: Expr) -> Expr {
    Expr::call(Intrinsic::BufferBase, vec![buf])
}

pub fn buffer_elem_size(buf: Expr) -> Expr {
    Expr::call(Intrinsic::BufferElemSize, vec![buf])
}

pub fn buffer_size_bytes(buf: Expr) -> Expr {
    Expr::call(Intrinsic::BufferSizeBytes, vec![buf])
}

pub fn buffer_at(buf: Expr, at: Vec<Expr>) -> Expr {
    let mut args = vec![buf];
    args.extend(at);
    Expr::call(Intrinsic::BufferAt, args)
}

/// `((x + s - 1) / s) * s`, the smallest multiple of `s` that is >= `x`.
pub fn align_up(x: Expr, s: Expr) -> Expr {
    ((x + s.clone() - 1) / s.clone()) * s
}

/// Execution mode of a loop statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Serial,
    /// Iterations may run concurrently; no iteration may observe another's
    /// output. Sliding-window rewrites must not apply.
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Stack,
    Heap,
}

/// Opaque stage body invoked by the interpreter with the stage's input and
/// output buffer views. Stages write through shared storage, so outputs
/// are passed by shared reference too.
#[derive(Clone)]
pub struct Callable(pub Rc<dyn Fn(&[RawBuffer], &[RawBuffer]) -> Result<(), EvalError>>);

impl Callable {
    pub fn new<F>(f: F) -> Callable
    where
        F: Fn(&[RawBuffer], &[RawBuffer]) -> Result<(), EvalError> + 'static,
    {
        Callable(Rc::new(f))
    }

    pub fn same_as(&self, other: &Callable) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<stage>")
    }
}

/// A stage invocation: run `target` with the named buffers as inputs and
/// outputs, cropped to whatever region is visible at this point.
#[derive(Debug, Clone)]
pub struct CallStmt {
    pub target: Callable,
    pub inputs: Vec<SymbolId>,
    pub outputs: Vec<SymbolId>,
}

#[derive(Debug)]
pub enum StmtNode {
    LetStmt {
        sym: SymbolId,
        value: Expr,
        body: Stmt,
    },
    /// Sequential composition, left-associative.
    Block {
        a: Stmt,
        b: Stmt,
    },
    Loop {
        sym: SymbolId,
        mode: LoopMode,
        bounds: Interval,
        step: Expr,
        body: Stmt,
    },
    IfThenElse {
        condition: Expr,
        then_body: Stmt,
        else_body: Stmt,
    },
    /// Reserve storage for `sym` for the lifetime of `body`.
    Allocate {
        sym: SymbolId,
        storage: MemoryType,
        elem_size: Index,
        dims: Vec<DimExpr>,
        body: Stmt,
    },
    MakeBuffer {
        sym: SymbolId,
        base: Expr,
        elem_size: Expr,
        dims: Vec<DimExpr>,
        body: Stmt,
    },
    /// Narrow the visible bounds of `sym` within `body`. Undefined
    /// endpoints leave the existing bound in place.
    CropBuffer {
        sym: SymbolId,
        bounds: BoxExpr,
        body: Stmt,
    },
    CropDim {
        sym: SymbolId,
        dim: usize,
        bounds: Interval,
        body: Stmt,
    },
    SliceBuffer {
        sym: SymbolId,
        at: Vec<Expr>,
        body: Stmt,
    },
    SliceDim {
        sym: SymbolId,
        dim: usize,
        at: Expr,
        body: Stmt,
    },
    TruncateRank {
        sym: SymbolId,
        rank: usize,
        body: Stmt,
    },
    Call(CallStmt),
    Copy {
        src: SymbolId,
        dst: SymbolId,
        /// Bytes of one element used where the source is out of bounds;
        /// empty means out-of-bounds reads are not padded.
        padding: Vec<u8>,
    },
    Check(Expr),
}

/// Shared handle to an immutable statement, or the undefined sentinel.
#[derive(Debug, Clone, Default)]
pub struct Stmt {
    node: Option<Rc<StmtNode>>,
}

impl Stmt {
    pub fn undefined() -> Stmt {
        Stmt { node: None }
    }

    pub fn defined(&self) -> bool {
        self.node.is_some()
    }

    pub fn node(&self) -> Option<&StmtNode> {
        self.node.as_deref()
    }

    pub fn same_as(&self, other: &Stmt) -> bool {
        match (&self.node, &other.node) {
            (None, None) => true,
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn make(node: StmtNode) -> Stmt {
        Stmt {
            node: Some(Rc::new(node)),
        }
    }

    pub fn let_stmt(sym: SymbolId, value: Expr, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::LetStmt { sym, value, body })
    }

    /// Sequential composition. An undefined side collapses to the other.
    pub fn block(a: Stmt, b: Stmt) -> Stmt {
        if !a.defined() {
            b
        } else if !b.defined() {
            a
        } else {
            Stmt::make(StmtNode::Block { a, b })
        }
    }

    /// Left-associative block of any number of statements; undefined
    /// entries vanish.
    pub fn block_of<I: IntoIterator<Item = Stmt>>(stmts: I) -> Stmt {
        let mut result = Stmt::undefined();
        for s in stmts {
            result = Stmt::block(result, s);
        }
        result
    }

    pub fn loop_stmt(sym: SymbolId, mode: LoopMode, bounds: Interval, step: Expr, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::Loop {
            sym,
            mode,
            bounds,
            step,
            body,
        })
    }

    pub fn if_then_else(condition: Expr, then_body: Stmt, else_body: Stmt) -> Stmt {
        Stmt::make(StmtNode::IfThenElse {
            condition,
            then_body,
            else_body,
        })
    }

    pub fn allocate(
        sym: SymbolId,
        storage: MemoryType,
        elem_size: Index,
        dims: Vec<DimExpr>,
        body: Stmt,
    ) -> Stmt {
        Stmt::make(StmtNode::Allocate {
            sym,
            storage,
            elem_size,
            dims,
            body,
        })
    }

    pub fn make_buffer(sym: SymbolId, base: Expr, elem_size: Expr, dims: Vec<DimExpr>, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::MakeBuffer {
            sym,
            base,
            elem_size,
            dims,
            body,
        })
    }

    pub fn crop_buffer(sym: SymbolId, bounds: BoxExpr, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::CropBuffer { sym, bounds, body })
    }

    pub fn crop_dim(sym: SymbolId, dim: usize, bounds: Interval, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::CropDim {
            sym,
            dim,
            bounds,
            body,
        })
    }

    pub fn slice_buffer(sym: SymbolId, at: Vec<Expr>, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::SliceBuffer { sym, at, body })
    }

    pub fn slice_dim(sym: SymbolId, dim: usize, at: Expr, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::SliceDim { sym, dim, at, body })
    }

    pub fn truncate_rank(sym: SymbolId, rank: usize, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::TruncateRank { sym, rank, body })
    }

    pub fn call(call: CallStmt) -> Stmt {
        Stmt::make(StmtNode::Call(call))
    }

    pub fn copy(src: SymbolId, dst: SymbolId, padding: Vec<u8>) -> Stmt {
        Stmt::make(StmtNode::Copy { src, dst, padding })
    }

    pub fn check(condition: Expr) -> Stmt {
        Stmt::make(StmtNode::Check(condition))
    }
}
