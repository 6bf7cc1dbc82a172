use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use skipper_vm::optimizer::{self, Pass};
use skipper_vm::{JitMode, Program, RuntimeConfig, Value, Vm};
use tracing_subscriber::EnvFilter;

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JitModeArg {
    Off,
    On,
    Auto,
}

impl From<JitModeArg> for JitMode {
    fn from(arg: JitModeArg) -> Self {
        match arg {
            JitModeArg::Off => JitMode::Off,
            JitModeArg::On => JitMode::On,
            JitModeArg::Auto => JitMode::Auto,
        }
    }
}

#[derive(Parser)]
#[command(name = "skipper")]
#[command(about = "Skipper bytecode virtual machine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program image
    Run {
        /// JSON program image
        image: PathBuf,

        /// TOML runtime configuration; flags override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// JIT compilation mode (off, on, auto)
        #[arg(long, value_enum)]
        jit: Option<JitModeArg>,

        /// JIT compilation threshold (number of calls before JIT)
        #[arg(long)]
        jit_threshold: Option<u32>,

        /// Trace JIT compilation events
        #[arg(long)]
        trace_jit: bool,

        /// Trace every executed instruction
        #[arg(long)]
        trace: bool,

        /// Print GC statistics
        #[arg(long)]
        gc_stats: bool,

        /// Heap limit in bytes
        #[arg(long, value_name = "BYTES")]
        heap_limit: Option<usize>,

        /// Seed for the random native
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Optimize a program image and print listings before and after
    Optimize {
        /// JSON program image
        image: PathBuf,

        /// Only optimize this function
        #[arg(long)]
        function: Option<String>,

        /// Passes to run, in order
        #[arg(long, value_delimiter = ',', default_value = "branch,peephole,dce")]
        passes: Vec<Pass>,
    },
}

fn init_logging(trace_jit: bool, trace: bool) {
    let default = if trace {
        "trace"
    } else if trace_jit {
        "warn,skipper_vm::jit=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            image,
            config,
            jit,
            jit_threshold,
            trace_jit,
            trace,
            gc_stats,
            heap_limit,
            seed,
        } => {
            init_logging(trace_jit, trace);
            let mut runtime_config = match config {
                Some(path) => match RuntimeConfig::load(&path) {
                    Ok(c) => c,
                    Err(e) => {
                        eprintln!("error: {}", e);
                        return ExitCode::FAILURE;
                    }
                },
                None => RuntimeConfig::default(),
            };
            if let Some(mode) = jit {
                runtime_config.jit_mode = mode.into();
            }
            if let Some(threshold) = jit_threshold {
                runtime_config.jit_threshold = threshold;
            }
            runtime_config.trace_jit |= trace_jit;
            runtime_config.trace_execution |= trace;
            runtime_config.gc_stats |= gc_stats;
            if heap_limit.is_some() {
                runtime_config.heap_limit = heap_limit;
            }
            if seed.is_some() {
                runtime_config.random_seed = seed;
            }
            run_image(&image, runtime_config)
        }
        Commands::Optimize { image, function, passes } => {
            init_logging(false, false);
            optimize_image(&image, function.as_deref(), &passes)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run_image(path: &Path, config: RuntimeConfig) -> Result<(), String> {
    let program = Program::load(path).map_err(|e| e.to_string())?;
    let vm = Vm::new(config);
    let mut heap = vm.new_heap();

    let outcome = vm.run(&program, &mut heap);
    if vm.config().gc_stats {
        let stats = heap.gc_stats();
        eprintln!(
            "[GC] cycles: {}, objects freed: {}, bytes freed: {}, total pause: {}us, max pause: {}us",
            stats.cycles,
            stats.objects_freed,
            stats.bytes_freed,
            stats.total_pause_us,
            stats.max_pause_us
        );
    }

    let outcome = outcome.map_err(|e| e.to_string())?;
    if vm.config().trace_jit && !outcome.compiled_functions.is_empty() {
        let names: Vec<&str> = outcome
            .compiled_functions
            .iter()
            .filter_map(|&id| program.functions.get(id).map(|f| f.name.as_str()))
            .collect();
        eprintln!("[JIT] compiled: {}", names.join(", "));
    }
    if outcome.result != Value::null() {
        println!("{}", outcome.display);
    }
    Ok(())
}

fn optimize_image(path: &Path, function: Option<&str>, passes: &[Pass]) -> Result<(), String> {
    let program = Program::load(path).map_err(|e| e.to_string())?;
    if let Some(name) = function {
        if program.function_id(name).is_none() {
            return Err(format!("function '{}' not found", name));
        }
    }

    let mut constants = program.constants.clone();
    for func in &program.functions {
        if function.is_some_and(|name| name != func.name) {
            continue;
        }

        let pool_len = constants.len();
        let output = optimizer::optimize(&func.code, &mut constants, passes);
        let mut optimized = func.clone();
        optimized.code = output.code;

        println!("== {} (before) ==", func.name);
        print!("{}", func.listing());
        println!("== {} (after) ==", func.name);
        print!("{}", optimized.listing());
        for (index, constant) in constants.iter().enumerate().skip(pool_len) {
            println!("-- constant {}: {} {}", index, constant.type_name(), constant);
        }
        println!(
            "-- branches folded: {}, constants folded: {}, jumps threaded: {}, removed: {}",
            output.stats.branches_folded,
            output.stats.constants_folded,
            output.stats.jumps_threaded,
            output.stats.instructions_removed
        );
    }
    Ok(())
}
