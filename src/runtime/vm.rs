use crate::bytecode::op::{LDF_ADDRESS_OFFSET, LDF_ENV_EXTENSION_COUNT_OFFSET, LDF_MAX_OS_SIZE_OFFSET};
use crate::bytecode::verify::verify;
use crate::bytecode::{Op, Program};
use crate::lang::value::Value;
use crate::runtime::gc::{Collector, Roots};
use crate::runtime::heap::{Heap, Node, NodeRef};
use crate::runtime::runtime_error::{RuntimeError, type_mismatch};
use crate::runtime::schedule::{GcPolicy, Scheduler, Tick};
use crate::runtime::structures::{
    add_bindings, alloc_bool, alloc_number, alloc_undefined, bind, environment_size, extend,
    lookup, new_closure, new_environment, new_operand_stack, peek_operand, pop_operand,
    push_operand, read_value,
};
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Heap size in cells, sentinel included.
    pub heap_nodes: usize,
    pub policy: GcPolicy,
    /// Cells examined per collector mark step.
    pub mark_batch: usize,
    /// Cells examined per collector sweep step.
    pub sweep_batch: usize,
    /// Stop with an error after this many ticks (mutator and collector).
    pub max_ticks: Option<usize>,
    /// Record a [`TraceSample`] after every tick.
    pub record_trace: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            heap_nodes: 4096,
            policy: GcPolicy::default(),
            mark_batch: 10,
            sweep_batch: 10,
            max_ticks: None,
            record_trace: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    Normal,
    DivisionByZero,
    OutOfMemory,
    /// Any other runtime error. The machine cannot resume.
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Running,
    Halted(HaltReason),
}

/// Heap occupancy after one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceSample {
    pub tick: Tick,
    /// Cells in use, sentinel excluded.
    pub live: usize,
}

/// `P <live>` for a mutator tick, `GC <live>` for a collector tick.
impl std::fmt::Display for TraceSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.tick {
            Tick::Mutator => "P",
            Tick::Collector => "GC",
        };
        write!(f, "{} {}", kind, self.live)
    }
}

/// Stack machine executing a [`Program`] against a collected heap.
///
/// Registers: `pc`, `os` (top cell of the current operand stack), `env`
/// (current environment frame) and the return stack `rts`, a host-side list
/// of return frames living in the heap. Registers are the collector's roots
/// and every handle moved into one is shaded.
///
/// CALL takes two mutator ticks. The bind step moves the arguments into a
/// fresh frame and saves the caller; the enter step builds the callee's
/// environment and jumps. Splitting it keeps each step's allocation within
/// a bound that admission control can check up front.
pub struct Vm {
    program: Program,
    config: VmConfig,
    heap: Heap,
    collector: Collector,
    scheduler: Scheduler,

    pc: usize,
    os: NodeRef,
    env: NodeRef,
    rts: Vec<NodeRef>,
    pending_call: bool,

    state: MachineState,
    ticks: usize,
    instructions: usize,
    trace: Vec<TraceSample>,
}

impl Vm {
    /// Load a program. It is verified first.
    pub fn new(program: Program, config: VmConfig) -> Result<Self, RuntimeError> {
        verify(&program)?;

        Ok(Self {
            heap: Heap::new(config.heap_nodes)?,
            collector: Collector::new(config.mark_batch, config.sweep_batch),
            scheduler: Scheduler::new(config.policy.clone()),
            program,
            config,
            pc: 0,
            os: NodeRef::NIL,
            env: NodeRef::NIL,
            rts: Vec::new(),
            pending_call: false,
            state: MachineState::Running,
            ticks: 0,
            instructions: 0,
            trace: Vec::new(),
        })
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn ticks(&self) -> usize {
        self.ticks
    }

    /// Mutator steps executed so far. A call counts twice.
    pub fn instructions(&self) -> usize {
        self.instructions
    }

    /// Per-tick samples, empty unless `record_trace` is set.
    pub fn trace(&self) -> &[TraceSample] {
        &self.trace
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Value on top of the operand stack.
    pub fn peek(&self) -> Option<Value> {
        if self.os.is_nil() {
            return None;
        }
        let top = peek_operand(&self.heap, self.os)?;
        read_value(&self.heap, top).ok()
    }

    /// Run to completion and return the value left by DONE.
    pub fn run(&mut self) -> Result<Value, RuntimeError> {
        loop {
            self.tick()?;
            if self.state != MachineState::Running {
                return Ok(self.peek().unwrap_or(Value::Undefined));
            }
        }
    }

    /// Give one tick to the mutator or the collector, as the policy decides.
    ///
    /// Every error is terminal: the machine halts and later ticks return
    /// [`RuntimeError::Halted`].
    pub fn tick(&mut self) -> Result<(), RuntimeError> {
        if let MachineState::Halted(_) = self.state {
            return Err(RuntimeError::Halted);
        }

        let result = self.advance();
        if let Err(e) = &result {
            if self.state == MachineState::Running {
                log::warn!("fault at {:04}: {}", self.pc, e);
                self.halt(HaltReason::Fault);
            }
        }
        result
    }

    fn advance(&mut self) -> Result<(), RuntimeError> {
        self.ticks += 1;
        if let Some(limit) = self.config.max_ticks {
            if self.ticks > limit {
                return Err(RuntimeError::TickLimitExceeded { limit });
            }
        }

        let tick = self.scheduler.next_tick();
        let result = match tick {
            Tick::Collector => {
                self.collector.step(
                    &mut self.heap,
                    &Roots {
                        os: self.os,
                        env: self.env,
                        rts: &self.rts,
                    },
                );
                Ok(())
            }
            Tick::Mutator => self.step(),
        };
        if self.config.record_trace {
            self.trace.push(TraceSample {
                tick,
                live: self.heap.live_count(),
            });
        }
        result
    }

    // Execution

    fn step(&mut self) -> Result<(), RuntimeError> {
        let op = self.program.op_at(self.pc)?;

        let demand = self.demand(op)?;
        if !self.admit(demand) {
            let free = self.heap.free_left();
            log::warn!(
                "out of memory at {:04} {}: need {} cell(s), {} free",
                self.pc,
                op,
                demand,
                free
            );
            self.halt(HaltReason::OutOfMemory);
            return Err(RuntimeError::OutOfMemory { demand, free });
        }

        log::trace!("{:04} {}", self.pc, op);
        self.instructions += 1;
        self.execute(op)
    }

    /// Worst-case number of cells `op` allocates in its next step.
    fn demand(&self, op: Op) -> Result<usize, RuntimeError> {
        Ok(match op {
            Op::Start => 2,
            Op::Ldcn | Op::Ldcb | Op::Ldcu => 2,
            Op::Plus
            | Op::Minus
            | Op::Times
            | Op::Div
            | Op::Equal
            | Op::Less
            | Op::Greater
            | Op::Leq
            | Op::Geq
            | Op::Not => 2,
            Op::Ld | Op::Rtn => 1,
            Op::Ldf => 2,
            Op::Pop | Op::Jof | Op::Goto | Op::Assign | Op::Done => 0,
            Op::Call if self.pending_call => {
                let (env_extension, closure_env) = self.pending_callee()?;
                let bound = environment_size(&self.heap, self.env)?;
                let captured = environment_size(&self.heap, closure_env)?;
                env_extension.saturating_sub(bound) + captured + 2
            }
            Op::Call => self.program.index_at(self.pc + 1)? + 2,
        })
    }

    /// Make sure `demand` cells are free, collecting synchronously if needed.
    fn admit(&mut self, demand: usize) -> bool {
        if self.heap.free_left() >= demand {
            return true;
        }
        if !self.scheduler.policy().collects() {
            return false;
        }

        log::debug!(
            "need {} cell(s), {} free: collecting",
            demand,
            self.heap.free_left()
        );
        self.collector.stop_the_world(
            &mut self.heap,
            &Roots {
                os: self.os,
                env: self.env,
                rts: &self.rts,
            },
        );
        self.heap.free_left() >= demand
    }

    fn halt(&mut self, reason: HaltReason) {
        log::info!(
            "halted ({:?}) at {:04} after {} ticks, {} instructions",
            reason,
            self.pc,
            self.ticks,
            self.instructions
        );
        self.state = MachineState::Halted(reason);
    }

    fn set_registers(&mut self, os: NodeRef, env: NodeRef) {
        self.heap.shade(os);
        self.heap.shade(env);
        self.os = os;
        self.env = env;
    }

    fn execute(&mut self, op: Op) -> Result<(), RuntimeError> {
        match op {
            Op::Start => {
                let os = new_operand_stack(&mut self.heap)?;
                let env = new_environment(&mut self.heap, 0)?;
                self.set_registers(os, env);
                self.pc += 1;
            }

            // Literals
            Op::Ldcn => {
                let n = self.program.number_at(self.pc + 1)?;
                let value = alloc_number(&mut self.heap, n)?;
                self.push(value)?;
                self.pc += 2;
            }
            Op::Ldcb => {
                let b = self.program.bool_at(self.pc + 1)?;
                let value = alloc_bool(&mut self.heap, b)?;
                self.push(value)?;
                self.pc += 2;
            }
            Op::Ldcu => {
                let value = alloc_undefined(&mut self.heap)?;
                self.push(value)?;
                self.pc += 1;
            }

            // Arithmetic and comparison
            Op::Plus => self.binary_number_op(op, |a, b| Value::Number(a + b))?,
            Op::Minus => self.binary_number_op(op, |a, b| Value::Number(a - b))?,
            Op::Times => self.binary_number_op(op, |a, b| Value::Number(a * b))?,
            Op::Less => self.binary_number_op(op, |a, b| Value::Bool(a < b))?,
            Op::Greater => self.binary_number_op(op, |a, b| Value::Bool(a > b))?,
            Op::Leq => self.binary_number_op(op, |a, b| Value::Bool(a <= b))?,
            Op::Geq => self.binary_number_op(op, |a, b| Value::Bool(a >= b))?,
            Op::Div => {
                let (a, b) = self.pop_numbers(op)?;
                let quotient = alloc_number(&mut self.heap, a / b)?;
                self.push(quotient)?;
                self.pc += 1;
                if b == 0.0 {
                    self.halt(HaltReason::DivisionByZero);
                    return Err(RuntimeError::DivisionByZero);
                }
            }
            Op::Equal => {
                let right = self.pop()?;
                let left = self.pop()?;
                let equal = self.values_equal(left, right)?;
                let value = alloc_bool(&mut self.heap, equal)?;
                self.push(value)?;
                self.pc += 1;
            }
            Op::Not => {
                let b = self.pop_bool(op)?;
                let value = alloc_bool(&mut self.heap, !b)?;
                self.push(value)?;
                self.pc += 1;
            }

            // Stack and environment
            Op::Pop => {
                self.pop()?;
                self.pc += 1;
            }
            Op::Ld => {
                let slot = self.program.index_at(self.pc + 1)?;
                let value = lookup(&self.heap, self.env, slot)?;
                self.push(value)?;
                self.pc += 2;
            }
            Op::Assign => {
                let slot = self.program.index_at(self.pc + 1)?;
                let value = self.pop()?;
                bind(&mut self.heap, self.env, slot, value)?;
                self.pc += 2;
            }

            // Control flow
            Op::Jof => {
                let target = self.program.index_at(self.pc + 1)?;
                if self.pop_bool(op)? {
                    self.pc += 2;
                } else {
                    self.pc = target;
                }
            }
            Op::Goto => {
                self.pc = self.program.index_at(self.pc + 1)?;
            }

            // Functions
            Op::Ldf => {
                let max_stack = self.program.index_at(self.pc + LDF_MAX_OS_SIZE_OFFSET)?;
                let address = self.program.index_at(self.pc + LDF_ADDRESS_OFFSET)?;
                let env_extension = self
                    .program
                    .index_at(self.pc + LDF_ENV_EXTENSION_COUNT_OFFSET)?;
                let closure =
                    new_closure(&mut self.heap, address, env_extension, max_stack, self.env)?;
                self.push(closure)?;
                self.pc += op.width();
            }
            Op::Call if self.pending_call => self.enter_call()?,
            Op::Call => self.bind_call()?,
            Op::Rtn => {
                let result = self.pop()?;
                let frame = self.rts.pop().ok_or(RuntimeError::ReturnStackUnderflow)?;
                let Node::RtsFrame { resume_pc, os, env } = self.heap.get(frame) else {
                    return Err(type_mismatch("RTN", "return frame", self.heap.get(frame).kind()));
                };
                let os = push_operand(&mut self.heap, os, result)?;
                self.set_registers(os, env);
                self.pc = resume_pc;
            }
            Op::Done => self.halt(HaltReason::Normal),
        }
        Ok(())
    }

    /// CALL, first step: move `argc` arguments into a fresh frame, save the
    /// caller on the return stack.
    ///
    /// The closure stays on top of the operand stack and the frame becomes
    /// the current environment, so both stay rooted until the enter step.
    fn bind_call(&mut self) -> Result<(), RuntimeError> {
        let argc = self.program.index_at(self.pc + 1)?;
        let frame = new_environment(&mut self.heap, argc)?;
        for slot in (0..argc).rev() {
            let value = self.pop()?;
            bind(&mut self.heap, frame, slot, value)?;
        }

        let callee = peek_operand(&self.heap, self.os).ok_or(RuntimeError::OperandStackUnderflow)?;
        let Node::Closure { .. } = self.heap.get(callee) else {
            return Err(type_mismatch("CALL", "function", self.heap.get(callee).kind()));
        };

        let (caller_os, _) = pop_operand(&mut self.heap, self.os)?;
        let saved = self.heap.allocate(Node::RtsFrame {
            resume_pc: self.pc + Op::Call.width(),
            os: caller_os,
            env: self.env,
        })?;
        self.rts.push(saved);

        self.set_registers(self.os, frame);
        self.pending_call = true;
        Ok(())
    }

    /// CALL, second step: complete the argument frame with the callee's
    /// local slots, extend the captured environment with it and jump.
    fn enter_call(&mut self) -> Result<(), RuntimeError> {
        let callee = peek_operand(&self.heap, self.os).ok_or(RuntimeError::OperandStackUnderflow)?;
        let Node::Closure {
            address,
            env_extension,
            env: captured,
            ..
        } = self.heap.get(callee)
        else {
            return Err(type_mismatch("CALL", "function", self.heap.get(callee).kind()));
        };

        let bound = environment_size(&self.heap, self.env)?;
        add_bindings(&mut self.heap, self.env, env_extension.saturating_sub(bound))?;
        let env = extend(&mut self.heap, captured, self.env)?;
        let os = new_operand_stack(&mut self.heap)?;

        self.set_registers(os, env);
        self.pending_call = false;
        self.pc = address;
        Ok(())
    }

    /// `(env_extension, captured env)` of the closure a pending call enters.
    fn pending_callee(&self) -> Result<(usize, NodeRef), RuntimeError> {
        let callee = peek_operand(&self.heap, self.os).ok_or(RuntimeError::OperandStackUnderflow)?;
        match self.heap.get(callee) {
            Node::Closure {
                env_extension, env, ..
            } => Ok((env_extension, env)),
            other => Err(type_mismatch("CALL", "function", other.kind())),
        }
    }

    // Operand stack helpers

    fn push(&mut self, value: NodeRef) -> Result<(), RuntimeError> {
        self.os = push_operand(&mut self.heap, self.os, value)?;
        Ok(())
    }

    fn pop(&mut self) -> Result<NodeRef, RuntimeError> {
        let (os, value) = pop_operand(&mut self.heap, self.os)?;
        self.os = os;
        Ok(value)
    }

    fn pop_number(&mut self, op: Op) -> Result<f64, RuntimeError> {
        let value = self.pop()?;
        match read_value(&self.heap, value)? {
            Value::Number(n) => Ok(n),
            other => Err(type_mismatch(op.name(), "number", other.type_name())),
        }
    }

    fn pop_bool(&mut self, op: Op) -> Result<bool, RuntimeError> {
        let value = self.pop()?;
        match read_value(&self.heap, value)? {
            Value::Bool(b) => Ok(b),
            other => Err(type_mismatch(op.name(), "boolean", other.type_name())),
        }
    }

    /// Pop the right operand, then the left one.
    fn pop_numbers(&mut self, op: Op) -> Result<(f64, f64), RuntimeError> {
        let b = self.pop_number(op)?;
        let a = self.pop_number(op)?;
        Ok((a, b))
    }

    fn binary_number_op(&mut self, op: Op, f: impl Fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_numbers(op)?;
        let result = match f(a, b) {
            Value::Bool(b) => alloc_bool(&mut self.heap, b)?,
            Value::Number(n) => alloc_number(&mut self.heap, n)?,
            _ => alloc_undefined(&mut self.heap)?,
        };
        self.push(result)?;
        self.pc += 1;
        Ok(())
    }

    /// Numbers, booleans and undefined compare by value, functions by
    /// identity. Values of different types are never equal.
    fn values_equal(&self, left: NodeRef, right: NodeRef) -> Result<bool, RuntimeError> {
        Ok(
            match (read_value(&self.heap, left)?, read_value(&self.heap, right)?) {
                (Value::Number(a), Value::Number(b)) => a == b,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                (Value::Undefined, Value::Undefined) => true,
                (Value::Closure { .. }, Value::Closure { .. }) => left == right,
                _ => false,
            },
        )
    }

    // Introspection

    /// Cells reachable from the registers, free list excluded.
    pub fn reachable(&self) -> HashSet<NodeRef> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeRef> = [self.os, self.env]
            .into_iter()
            .chain(self.rts.iter().copied())
            .filter(|r| !r.is_nil())
            .collect();

        while let Some(cell) = queue.pop_front() {
            if !seen.insert(cell) {
                continue;
            }
            for child in self.heap.get(cell).children() {
                if !child.is_nil() && !seen.contains(&child) {
                    queue.push_back(child);
                }
            }
        }
        seen
    }
}
