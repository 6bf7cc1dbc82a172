use tracing::{debug, info};

use crate::config::RuntimeConfig;

use super::context::{ExecutionContext, TraceEvent};
use super::error::VmError;
use super::heap::Heap;
use super::program::Program;
use super::runtime::Runtime;
use super::tiering::TieringController;
use super::value::Value;

/// What a finished run leaves behind.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Top of the operand stack after the entry function returns, or Null.
    pub result: Value,
    /// Display text of `result`, resolved against the heap.
    pub display: String,
    pub trace: Vec<TraceEvent>,
    /// Ids of functions compiled during the run, ascending.
    pub compiled_functions: Vec<usize>,
    pub jit_compile_count: usize,
}

/// The Skipper virtual machine. Each `run` gets a fresh execution context,
/// so counters and compiled code never leak between runs.
#[derive(Debug, Clone, Default)]
pub struct Vm {
    config: RuntimeConfig,
}

impl Vm {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// A heap configured from this VM's limits, GC flags and seed.
    pub fn new_heap(&self) -> Heap {
        let heap = Heap::new_with_config(self.config.heap_limit, self.config.gc_enabled)
            .with_gc_stats(self.config.gc_stats);
        match self.config.random_seed {
            Some(seed) => heap.with_seed(seed),
            None => heap,
        }
    }

    fn tiering_for(&self, program: &Program) -> TieringController {
        let count = program.functions.len();
        if self.config.jit_enabled() {
            TieringController::new(count, self.config.jit_threshold)
        } else {
            TieringController::disabled(count)
        }
    }

    /// Execute the program's entry function against `runtime`.
    pub fn run(&self, program: &Program, runtime: &mut dyn Runtime) -> Result<RunOutcome, VmError> {
        let entry = program.entry_function()?;
        let tiering = self.tiering_for(program);
        debug!(
            entry = %program.entry,
            functions = program.functions.len(),
            threshold = ?tiering.threshold(),
            "starting run"
        );

        let mut ctx = ExecutionContext::new(program, runtime, tiering)
            .with_trace(self.config.trace_execution);
        ctx.call_function(entry)?;

        let result = ctx.peek_stack().unwrap_or_default();
        let compiled_functions = ctx.tiering().compiled_functions();
        let jit_compile_count = ctx.jit().compile_count();
        if self.config.trace_jit && jit_compile_count > 0 {
            info!(compiled = jit_compile_count, functions = ?compiled_functions, "jit summary");
        }

        Ok(RunOutcome {
            display: ctx.runtime().describe(result),
            result,
            trace: ctx.take_trace(),
            compiled_functions,
            jit_compile_count,
        })
    }

    /// Run against a fresh heap built by [`Vm::new_heap`].
    pub fn run_program(&self, program: &Program) -> Result<RunOutcome, VmError> {
        let mut heap = self.new_heap();
        self.run(program, &mut heap)
    }
}
