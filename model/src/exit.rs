//! Process exit codes.
//!
//! These values are an external contract: operators and wrapper scripts
//! match on them, so existing numbers must never be reused for a different
//! meaning.

use serde::{Deserialize, Serialize};

/// Exit status of a worker or of the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitCode {
    /// Run completed and a bundle was produced
    Success,
    /// Privilege drop, sink creation or resource access failed
    SetupFailed,
    /// The identity to switch to could not be resolved
    IdentityUnavailable,
    /// Collection ran but the bundle could not be finalized
    CollectFailed,
    /// Producer gave up because the channel stayed saturated or vanished
    ChannelFull,
    /// Collection worker failed
    WorkerFailed,
    /// Both workers failed
    BothWorkersFailed,
    /// Run was interrupted by the operator
    Interrupted,
    /// Unexpected internal fault
    Bug,
}

impl ExitCode {
    /// All codes, in numeric order.
    pub const ALL: [ExitCode; 9] = [
        ExitCode::Success,
        ExitCode::SetupFailed,
        ExitCode::IdentityUnavailable,
        ExitCode::CollectFailed,
        ExitCode::ChannelFull,
        ExitCode::WorkerFailed,
        ExitCode::BothWorkersFailed,
        ExitCode::Interrupted,
        ExitCode::Bug,
    ];

    /// Numeric process exit status.
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::SetupFailed => 10,
            ExitCode::IdentityUnavailable => 20,
            ExitCode::CollectFailed => 30,
            ExitCode::ChannelFull => 45,
            ExitCode::WorkerFailed => 50,
            ExitCode::BothWorkersFailed => 60,
            ExitCode::Interrupted => 98,
            ExitCode::Bug => 99,
        }
    }

    /// Map a raw exit status back to a known code.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Success
    }

    /// Human readable explanation for operators.
    pub fn describe(self) -> &'static str {
        match self {
            ExitCode::Success => "The run completed and the bundle was written.",
            ExitCode::SetupFailed => {
                "Setup failed: privileges could not be dropped, the archive could not be \
                 created, or required files were unreadable after switching user."
            }
            ExitCode::IdentityUnavailable => {
                "The user to switch to does not exist on this system. Use --user to pick \
                 an existing unprivileged account."
            }
            ExitCode::CollectFailed => "Collection ran but the archive could not be completed.",
            ExitCode::ChannelFull => {
                "The privileged worker could not hand over its data in time and aborted; \
                 privileged data may be missing from the bundle."
            }
            ExitCode::WorkerFailed => "The collection worker failed; the bundle is incomplete.",
            ExitCode::BothWorkersFailed => "Both the privileged and the collection worker failed.",
            ExitCode::Interrupted => "The run was interrupted by the operator.",
            ExitCode::Bug => {
                "An unexpected internal error occurred. Please report it together with \
                 the log file."
            }
        }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_codes_are_distinct() {
        let codes: HashSet<i32> = ExitCode::ALL.iter().map(|c| c.code()).collect();
        assert_eq!(codes.len(), ExitCode::ALL.len());
    }

    #[test]
    fn test_only_success_is_zero() {
        for code in ExitCode::ALL {
            assert_eq!(code.code() == 0, code.is_success());
        }
    }

    #[test]
    fn test_from_code_round_trip() {
        for code in ExitCode::ALL {
            assert_eq!(ExitCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ExitCode::from_code(1), None);
    }
}
