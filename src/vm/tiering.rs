//! Per-function call counters and the compiled set.
//!
//! Each function starts cold and is promoted to compiled once its call count
//! reaches the threshold. Promotion is permanent for the life of the
//! controller.

use tracing::debug;

/// What to do with one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Run through the bytecode interpreter.
    Interpret,
    /// The function just became hot: compile it and run this call compiled.
    Compile,
    /// Run the cached native routine.
    Compiled,
}

#[derive(Debug, Clone)]
pub struct TieringController {
    call_counts: Vec<u32>,
    compiled: Vec<bool>,
    /// None disables compilation
    threshold: Option<u32>,
}

impl TieringController {
    pub fn new(function_count: usize, threshold: u32) -> Self {
        Self {
            call_counts: vec![0; function_count],
            compiled: vec![false; function_count],
            threshold: Some(threshold.max(1)),
        }
    }

    /// A controller that interprets every call.
    pub fn disabled(function_count: usize) -> Self {
        Self {
            call_counts: vec![0; function_count],
            compiled: vec![false; function_count],
            threshold: None,
        }
    }

    /// Count a call to `func` and pick its tier.
    pub fn on_call(&mut self, func: usize) -> Tier {
        if self.is_compiled(func) {
            return Tier::Compiled;
        }
        let Some(count) = self.call_counts.get_mut(func) else {
            return Tier::Interpret;
        };
        *count = count.saturating_add(1);

        match self.threshold {
            Some(threshold) if *count >= threshold => {
                debug!(func, calls = *count, "hot function detected");
                Tier::Compile
            }
            _ => Tier::Interpret,
        }
    }

    pub fn mark_compiled(&mut self, func: usize) {
        if let Some(flag) = self.compiled.get_mut(func) {
            *flag = true;
        }
    }

    pub fn is_compiled(&self, func: usize) -> bool {
        self.compiled.get(func).copied().unwrap_or(false)
    }

    pub fn call_count(&self, func: usize) -> u32 {
        self.call_counts.get(func).copied().unwrap_or(0)
    }

    /// Ids of compiled functions in ascending order.
    pub fn compiled_functions(&self) -> Vec<usize> {
        self.compiled
            .iter()
            .enumerate()
            .filter_map(|(id, &c)| c.then_some(id))
            .collect()
    }

    pub fn threshold(&self) -> Option<u32> {
        self.threshold
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold.is_some()
    }
}
