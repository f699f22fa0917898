//! Per-step state machine (§4.7 of the design): a thin, observable record of
//! how a step's execution concluded. Distinct from the [`ttpforge_types::StepOutput`]
//! it produces — this is about control flow, not captured data.

/// A step's position in its own lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    /// Loaded, not yet reached by the forward pass.
    Pending,
    /// Condition evaluated true; expansion and subprocess launch underway.
    Running,
    /// Exit 0 and, if declared, every output filter applied cleanly.
    Succeeded,
    /// Non-zero exit, timeout, cancellation, or a filter error.
    Failed,
    /// Condition evaluated false; no subprocess was spawned, no cleanup pushed.
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_distinct() {
        let all = [
            StepState::Pending,
            StepState::Running,
            StepState::Succeeded,
            StepState::Failed,
            StepState::Skipped,
        ];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                assert_eq!(a == b, i == j);
            }
        }
    }
}
