use crate::agent_engine::state::AgentRunState;
use crate::config::AgentConfig;

/// Step and retry budgets for one run.
///
/// Step and action-retry counters live in [`AgentRunState`] so observers see
/// them; consecutive format failures are private to the loop.
#[derive(Debug, Clone)]
pub struct LoopController {
    max_steps: u32,
    max_action_retries: u32,
    max_format_retries: u32,
    format_failures: u32,
}

impl LoopController {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            max_action_retries: config.max_action_retries,
            max_format_retries: config.max_format_retries,
            format_failures: 0,
        }
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn steps_exhausted(&self, state: &AgentRunState) -> bool {
        state.step_index >= self.max_steps
    }

    /// Count a failed actuation. Returns `true` once the run should stop.
    pub fn record_action_failure(&self, state: &mut AgentRunState) -> bool {
        state.retry_count += 1;
        state.retry_count >= self.max_action_retries
    }

    /// A successful actuation closes the step.
    pub fn record_action_success(&self, state: &mut AgentRunState) {
        state.retry_count = 0;
        state.step_index += 1;
    }

    /// Count an undecodable reply. Returns `true` once the run should stop.
    pub fn record_format_failure(&mut self) -> bool {
        self.format_failures += 1;
        self.format_failures > self.max_format_retries
    }

    pub fn record_format_success(&mut self) {
        self.format_failures = 0;
    }
}
