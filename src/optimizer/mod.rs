//! Bytecode optimizer: local, single-function, windowed rewrites.
//!
//! Every pass returns the rewritten code together with the old-to-new index
//! [`Remap`] it applied. Passes may append to the constant pool but never
//! touch existing entries. A window is left alone when a jump lands inside
//! it anywhere but its first instruction.

mod branch;
mod dce;
mod peephole;
pub mod remap;

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::vm::{Constant, Op, VmError};

pub use branch::{constant_truthiness, simplify_branches};
pub use dce::eliminate_dead_code;
pub use peephole::peephole;
pub use remap::{Remap, Rewriter};

/// Smallest positive double. Double zero tests and equality fold against it.
pub const EPSILON: f64 = f64::from_bits(1);

/// Statistics from optimization passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizationStats {
    /// Branches resolved at compile time.
    pub branches_folded: usize,
    /// Constant expressions folded into a single `PUSH`.
    pub constants_folded: usize,
    /// Jumps retargeted past jump chains.
    pub jumps_threaded: usize,
    /// Instructions removed overall.
    pub instructions_removed: usize,
}

impl OptimizationStats {
    fn absorb(&mut self, other: &OptimizationStats) {
        self.branches_folded += other.branches_folded;
        self.constants_folded += other.constants_folded;
        self.jumps_threaded += other.jumps_threaded;
        self.instructions_removed += other.instructions_removed;
    }
}

/// Result of running one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassOutput {
    pub code: Vec<Op>,
    pub remap: Remap,
    pub stats: OptimizationStats,
}

impl PassOutput {
    fn new(old_len: usize, code: Vec<Op>, remap: Remap, mut stats: OptimizationStats) -> Self {
        stats.instructions_removed = old_len.saturating_sub(code.len());
        Self { code, remap, stats }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    BranchSimplify,
    Peephole,
    DeadCode,
}

impl Pass {
    /// Default pipeline order.
    pub const ALL: [Pass; 3] = [Pass::BranchSimplify, Pass::Peephole, Pass::DeadCode];

    pub fn run(self, code: &[Op], constants: &mut Vec<Constant>) -> PassOutput {
        match self {
            Pass::BranchSimplify => simplify_branches(code, constants),
            Pass::Peephole => peephole(code, constants),
            Pass::DeadCode => eliminate_dead_code(code),
        }
    }
}

impl FromStr for Pass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "branch" => Ok(Pass::BranchSimplify),
            "peephole" => Ok(Pass::Peephole),
            "dce" => Ok(Pass::DeadCode),
            other => Err(format!("unknown pass '{}' (expected branch, peephole or dce)", other)),
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Pass::BranchSimplify => "branch",
            Pass::Peephole => "peephole",
            Pass::DeadCode => "dce",
        };
        write!(f, "{}", name)
    }
}

/// Run `passes` in order. The returned remap composes every pass.
pub fn optimize(code: &[Op], constants: &mut Vec<Constant>, passes: &[Pass]) -> PassOutput {
    let mut current = code.to_vec();
    let mut remap = Remap::identity(code.len());
    let mut stats = OptimizationStats::default();

    for pass in passes {
        let output = pass.run(&current, constants);
        debug!(
            pass = %pass,
            before = current.len(),
            after = output.code.len(),
            "optimizer pass"
        );
        remap = remap.then(&output.remap);
        stats.absorb(&output.stats);
        current = output.code;
    }

    stats.instructions_removed = code.len().saturating_sub(current.len());
    PassOutput { code: current, remap, stats }
}

/// Check that every jump operand is within `0..=code.len()`.
pub fn validate_jumps(code: &[Op]) -> Result<(), VmError> {
    for (ip, op) in code.iter().enumerate() {
        if let Some(target) = op.jump_target() {
            if target > code.len() {
                return Err(VmError::MalformedInstruction {
                    op: op.name().to_string(),
                    reason: format!(
                        "jump at {} targets {} beyond code length {}",
                        ip,
                        target,
                        code.len()
                    ),
                });
            }
        }
    }
    Ok(())
}
