//! User-facing pipeline builder.
//!
//! A pipeline is a DAG of stages (`Func`) over symbolic buffers
//! (`BufferExpr`). Each stage declares, per input, the region it reads as
//! intervals over its output's dimension variables. Building lowers the
//! DAG to the statement tree the middle end expects: every producer sits
//! inside a crop expressing its consumer's demand in terms of the
//! consumer's output metadata, scheduled dimensions become loops with a
//! per-iteration crop of the output, and intermediate buffers are
//! allocated at the root with self-referential placeholder dims.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::{Rc, Weak};

use log::debug;

use crate::buffer::RawBuffer;
use crate::error::{CompilerError, EvalError, Result};
use crate::eval::{eval_stmt, EvalContext};
use crate::interval::{BoxExpr, DimExpr, Interval};
use crate::ir::{
    buffer_extent, buffer_fold_factor, buffer_max, buffer_min, buffer_stride, CallStmt, Callable, Expr,
    Index, LoopMode, MemoryType, NodeContext, Stmt, SymbolId,
};
use crate::substitute::substitute_sym;

/// A symbolic buffer in a pipeline: a name, an element size, and one
/// placeholder dim per rank that the middle end resolves.
#[derive(Clone)]
pub struct BufferExpr {
    inner: Rc<RefCell<BufferData>>,
}

struct BufferData {
    sym: SymbolId,
    elem_size: Index,
    dims: Vec<DimExpr>,
    storage: MemoryType,
    producer: Option<Weak<FuncData>>,
}

impl BufferExpr {
    pub fn new(ctx: &mut NodeContext, name: &str, elem_size: Index, rank: usize) -> BufferExpr {
        let sym = ctx.insert(name);
        let var = Expr::var(sym);
        let dims = (0..rank)
            .map(|d| DimExpr {
                bounds: Interval::new(buffer_min(var.clone(), d), buffer_max(var.clone(), d)),
                stride: buffer_stride(var.clone(), d),
                fold_factor: buffer_fold_factor(var.clone(), d),
            })
            .collect();
        BufferExpr {
            inner: Rc::new(RefCell::new(BufferData {
                sym,
                elem_size,
                dims,
                storage: MemoryType::Heap,
                producer: None,
            })),
        }
    }

    pub fn sym(&self) -> SymbolId {
        self.inner.borrow().sym
    }

    pub fn elem_size(&self) -> Index {
        self.inner.borrow().elem_size
    }

    pub fn rank(&self) -> usize {
        self.inner.borrow().dims.len()
    }

    pub fn dims(&self) -> Vec<DimExpr> {
        self.inner.borrow().dims.clone()
    }

    /// Override one dimension descriptor, e.g. to pad an extent.
    pub fn set_dim(&self, d: usize, dim: DimExpr) {
        self.inner.borrow_mut().dims[d] = dim;
    }

    pub fn store_in(&self, storage: MemoryType) -> &BufferExpr {
        self.inner.borrow_mut().storage = storage;
        self
    }

    pub fn storage(&self) -> MemoryType {
        self.inner.borrow().storage
    }

    /// Symbolic extent of dimension `d`, usable in stage bounds.
    pub fn extent(&self, d: usize) -> Expr {
        buffer_extent(Expr::var(self.sym()), d)
    }

    pub fn producer(&self) -> Option<Func> {
        self.inner
            .borrow()
            .producer
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Func { inner })
    }

    fn set_producer(&self, f: &Rc<FuncData>) {
        self.inner.borrow_mut().producer = Some(Rc::downgrade(f));
    }
}

/// One consumed buffer of a stage, with the region read per dimension as
/// intervals over the stage output's dimension variables.
#[derive(Clone)]
pub struct FuncInput {
    pub buffer: BufferExpr,
    pub bounds: Vec<Interval>,
}

impl FuncInput {
    pub fn new(buffer: &BufferExpr, bounds: Vec<Interval>) -> FuncInput {
        FuncInput {
            buffer: buffer.clone(),
            bounds,
        }
    }
}

/// One produced buffer of a stage, with the variable naming each output
/// dimension.
#[derive(Clone)]
pub struct FuncOutput {
    pub buffer: BufferExpr,
    pub dims: Vec<SymbolId>,
}

impl FuncOutput {
    pub fn new(buffer: &BufferExpr, dims: Vec<SymbolId>) -> FuncOutput {
        FuncOutput {
            buffer: buffer.clone(),
            dims,
        }
    }
}

/// One explicit loop of a stage's schedule.
#[derive(Debug, Clone, Copy)]
pub struct LoopSpec {
    pub var: SymbolId,
    pub mode: LoopMode,
}

impl LoopSpec {
    pub fn serial(var: SymbolId) -> LoopSpec {
        LoopSpec {
            var,
            mode: LoopMode::Serial,
        }
    }

    pub fn parallel(var: SymbolId) -> LoopSpec {
        LoopSpec {
            var,
            mode: LoopMode::Parallel,
        }
    }
}

enum FuncKind {
    Call(Callable),
    Copy { padding: Vec<u8> },
}

/// A stage of computation in a pipeline.
#[derive(Clone)]
pub struct Func {
    inner: Rc<FuncData>,
}

struct FuncData {
    kind: FuncKind,
    inputs: Vec<FuncInput>,
    outputs: Vec<FuncOutput>,
    loops: RefCell<Vec<LoopSpec>>,
}

impl Func {
    /// A compute stage. Registers itself as the producer of its outputs.
    pub fn new(target: Callable, inputs: Vec<FuncInput>, outputs: Vec<FuncOutput>) -> Func {
        Func::make(FuncKind::Call(target), inputs, outputs)
    }

    /// A copy stage with optional out-of-bounds padding.
    pub fn make_copy(input: FuncInput, output: FuncOutput, padding: Vec<u8>) -> Func {
        Func::make(FuncKind::Copy { padding }, vec![input], vec![output])
    }

    fn make(kind: FuncKind, inputs: Vec<FuncInput>, outputs: Vec<FuncOutput>) -> Func {
        let inner = Rc::new(FuncData {
            kind,
            inputs,
            outputs,
            loops: RefCell::new(Vec::new()),
        });
        for o in &inner.outputs {
            o.buffer.set_producer(&inner);
        }
        Func { inner }
    }

    /// Declare which output dimensions get explicit loops, outermost
    /// first.
    pub fn loops(&self, specs: Vec<LoopSpec>) -> &Func {
        *self.inner.loops.borrow_mut() = specs;
        self
    }

    fn loop_specs(&self) -> Vec<LoopSpec> {
        self.inner.loops.borrow().clone()
    }
}

/// A compiled pipeline: the statement tree and its external buffers.
pub struct Pipeline {
    pub body: Stmt,
    inputs: Vec<SymbolId>,
    outputs: Vec<SymbolId>,
}

struct Builder {
    produced: HashSet<SymbolId>,
    externals: HashSet<SymbolId>,
    allocations: Vec<BufferExpr>,
}

impl Builder {
    fn produce(&mut self, ctx: &NodeContext, f: &Func) -> Result<Stmt> {
        let data = &f.inner;
        let out0 = data
            .outputs
            .first()
            .ok_or_else(|| crate::err_malformed!("stage with no outputs"))?;
        let out_sym = out0.buffer.sym();

        for o in &data.outputs {
            let sym = o.buffer.sym();
            self.produced.insert(sym);
            if !self.externals.contains(&sym) {
                self.allocations.push(o.buffer.clone());
            }
        }

        let mut s = match &data.kind {
            FuncKind::Call(target) => Stmt::call(CallStmt {
                target: target.clone(),
                inputs: data.inputs.iter().map(|i| i.buffer.sym()).collect(),
                outputs: data.outputs.iter().map(|o| o.buffer.sym()).collect(),
            }),
            FuncKind::Copy { padding } => {
                let src = data.inputs[0].buffer.sym();
                Stmt::copy(src, out_sym, padding.clone())
            }
        };

        // Wrap the stage in a crop per input expressing its demand, and
        // generate not-yet-produced producers inside that crop, before
        // the stage.
        let specs = f.loop_specs();
        let looped: HashSet<SymbolId> = specs.iter().map(|l| l.var).collect();
        for input in data.inputs.iter().rev() {
            let in_sym = input.buffer.sym();
            let demand = input_demand(out0, &looped, input);
            let mut inner = s;
            if !self.externals.contains(&in_sym) && !self.produced.contains(&in_sym) {
                let g = input.buffer.producer().ok_or_else(|| CompilerError::MissingProducer {
                    name: ctx.name(in_sym),
                })?;
                inner = Stmt::block(self.produce(ctx, &g)?, inner);
            }
            s = Stmt::crop_buffer(in_sym, demand, inner);
        }

        // Scheduled dimensions loop over the output's bounds, computing
        // one slice per iteration. Applied innermost-out.
        for spec in specs.iter().rev() {
            let d = out0.dims.iter().position(|&v| v == spec.var).ok_or_else(|| {
                crate::err_malformed!(
                    "loop variable '{}' is not an output dimension",
                    ctx.name(spec.var)
                )
            })?;
            let out_var = Expr::var(out_sym);
            s = Stmt::crop_dim(out_sym, d, Interval::point(Expr::var(spec.var)), s);
            s = Stmt::loop_stmt(
                spec.var,
                spec.mode,
                Interval::new(buffer_min(out_var.clone(), d), buffer_max(out_var, d)),
                Expr::constant(1),
                s,
            );
        }
        Ok(s)
    }
}

// Project a consumer's demand onto its output's metadata: dimension
// variables with explicit loops stay as loop variables; the rest
// substitute the output's min into the min endpoint and max into the max
// endpoint. Demands are monotone in the dimension variables.
fn input_demand(out0: &FuncOutput, looped: &HashSet<SymbolId>, input: &FuncInput) -> BoxExpr {
    let out_var = Expr::var(out0.buffer.sym());
    input
        .bounds
        .iter()
        .map(|i| {
            let mut min = i.min.clone();
            let mut max = i.max.clone();
            for (d, &v) in out0.dims.iter().enumerate() {
                if looped.contains(&v) {
                    continue;
                }
                min = substitute_sym(&min, v, &buffer_min(out_var.clone(), d));
                max = substitute_sym(&max, v, &buffer_max(out_var.clone(), d));
            }
            Interval::new(min, max)
        })
        .collect()
}

impl Pipeline {
    /// Lower the stage DAG reaching `outputs` and run the middle end.
    pub fn build(ctx: &mut NodeContext, inputs: Vec<BufferExpr>, outputs: Vec<BufferExpr>) -> Result<Pipeline> {
        let input_syms: Vec<SymbolId> = inputs.iter().map(|b| b.sym()).collect();
        let output_syms: Vec<SymbolId> = outputs.iter().map(|b| b.sym()).collect();

        let mut builder = Builder {
            produced: HashSet::new(),
            externals: input_syms.iter().chain(output_syms.iter()).copied().collect(),
            allocations: Vec::new(),
        };

        let mut body = Stmt::undefined();
        for out in &outputs {
            if builder.produced.contains(&out.sym()) {
                continue;
            }
            let f = out.producer().ok_or_else(|| CompilerError::MissingProducer {
                name: ctx.name(out.sym()),
            })?;
            let produced = builder.produce(ctx, &f)?;
            body = Stmt::block(body, produced);
        }

        for buf in builder.allocations.iter().rev() {
            body = Stmt::allocate(buf.sym(), buf.storage(), buf.elem_size(), buf.dims(), body);
        }

        debug!("built pipeline with {} allocations", builder.allocations.len());
        let body = crate::compile(&body, ctx, &input_syms, &output_syms)?;

        Ok(Pipeline {
            body,
            inputs: input_syms,
            outputs: output_syms,
        })
    }

    /// Run the compiled pipeline against concrete buffers, in declaration
    /// order.
    pub fn evaluate(
        &self,
        inputs: &[&RawBuffer],
        outputs: &[&RawBuffer],
    ) -> std::result::Result<(), EvalError> {
        let mut ctx = EvalContext::new();
        for (sym, buf) in self.inputs.iter().zip(inputs.iter()) {
            ctx.bind_buffer(*sym, (*buf).clone());
        }
        for (sym, buf) in self.outputs.iter().zip(outputs.iter()) {
            ctx.bind_buffer(*sym, (*buf).clone());
        }
        eval_stmt(&self.body, &mut ctx)
    }
}
