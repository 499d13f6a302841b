//! Per-partition lifecycle: `Unread -> Read -> Transformed -> Materialized | Failed`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ColflowError, Result};

/// Lifecycle state of one partition within a materialization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    Unread,
    Read,
    Transformed,
    Materialized,
    Failed,
}

impl PartitionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Materialized | Self::Failed)
    }

    /// Forward-only transitions; any non-terminal state may fail.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Unread, Self::Read)
            | (Self::Read, Self::Transformed)
            | (Self::Transformed, Self::Materialized) => true,
            (from, Self::Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unread => "unread",
            Self::Read => "read",
            Self::Transformed => "transformed",
            Self::Materialized => "materialized",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks one partition through a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionRun {
    pub partition: usize,
    pub state: PartitionState,
    /// Rows after reading, then after the final filter.
    pub rows_read: Option<usize>,
    pub rows_out: Option<usize>,
    pub error: Option<String>,
}

impl PartitionRun {
    pub fn new(partition: usize) -> Self {
        Self {
            partition,
            state: PartitionState::Unread,
            rows_read: None,
            rows_out: None,
            error: None,
        }
    }

    pub fn advance(&mut self, next: PartitionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ColflowError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Move to `Failed`, recording the error message.
    pub fn fail(&mut self, error: &ColflowError) -> Result<()> {
        self.advance(PartitionState::Failed)?;
        self.error = Some(error.to_string());
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        self.state != PartitionState::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut run = PartitionRun::new(0);
        run.advance(PartitionState::Read).unwrap();
        run.advance(PartitionState::Transformed).unwrap();
        run.advance(PartitionState::Materialized).unwrap();
        assert!(run.state.is_terminal());
    }

    #[test]
    fn test_no_backward_transition() {
        let mut run = PartitionRun::new(0);
        run.advance(PartitionState::Read).unwrap();
        let err = run.advance(PartitionState::Unread).unwrap_err();
        assert!(matches!(err, ColflowError::InvalidTransition { .. }));
    }

    #[test]
    fn test_no_skipping_states() {
        let mut run = PartitionRun::new(0);
        assert!(run.advance(PartitionState::Transformed).is_err());
        assert_eq!(run.state, PartitionState::Unread);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut run = PartitionRun::new(1);
        run.fail(&ColflowError::Cancelled).unwrap();
        assert_eq!(run.error.as_deref(), Some("Run was cancelled"));
        assert!(run.fail(&ColflowError::Cancelled).is_err());
        assert!(run.advance(PartitionState::Read).is_err());
    }

    #[test]
    fn test_materialized_cannot_fail() {
        assert!(!PartitionState::Materialized.can_transition_to(PartitionState::Failed));
    }
}
