#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,

    /// A non-advisory stage failed or an analysis found nothing to analyze.
    StageFailed = 10,

    /// Invalid CLI/scenario input (bad flags, unparsable YAML, unknown stages, bad expressions).
    InvalidInput = 30,

    /// Internal/runtime error (IO errors, unexpected invariants).
    RuntimeError = 40,
}

impl ExitCode {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// The worst outcome across all runs wins; a configuration error outranks a failed stage.
    #[must_use]
    pub fn from_runs(configuration_failed: bool, stage_failed: bool) -> Self {
        match (configuration_failed, stage_failed) {
            (true, _) => Self::InvalidInput,
            (false, true) => Self::StageFailed,
            (false, false) => Self::Success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_outrank_stage_failures() {
        assert_eq!(ExitCode::from_runs(false, false), ExitCode::Success);
        assert_eq!(ExitCode::from_runs(false, true), ExitCode::StageFailed);
        assert_eq!(ExitCode::from_runs(true, true), ExitCode::InvalidInput);
        assert_eq!(ExitCode::StageFailed.as_i32(), 10);
    }
}
