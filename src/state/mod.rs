//! Pipeline state machine
//!
//! States: IDLE → UNPACKING → REWRITING → REPACKING → SIGNING → {DONE | FAILED}
//!
//! Stages run strictly in order. Any non-terminal state may fail; terminal
//! states never transition again.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of pipeline work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Unpack,
    Rewrite,
    Repack,
    Sign,
}

impl Stage {
    /// All stages in execution order
    pub const ALL: [Stage; 4] = [Stage::Unpack, Stage::Rewrite, Stage::Repack, Stage::Sign];

    /// State the pipeline is in while this stage runs
    pub fn state(&self) -> PipelineState {
        match self {
            Stage::Unpack => PipelineState::Unpacking,
            Stage::Rewrite => PipelineState::Rewriting,
            Stage::Repack => PipelineState::Repacking,
            Stage::Sign => PipelineState::Signing,
        }
    }

    /// Progress percentages at the start and end of this stage
    pub fn progress_span(&self) -> (u8, u8) {
        match self {
            Stage::Unpack => (0, 25),
            Stage::Rewrite => (25, 50),
            Stage::Repack => (50, 75),
            Stage::Sign => (75, 100),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Unpack => "unpack",
            Stage::Rewrite => "rewrite",
            Stage::Repack => "repack",
            Stage::Sign => "sign",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Idle,
    Unpacking,
    Rewriting,
    Repacking,
    Signing,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    /// Stage that is active in this state
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Unpacking => Some(Stage::Unpack),
            PipelineState::Rewriting => Some(Stage::Rewrite),
            PipelineState::Repacking => Some(Stage::Repack),
            PipelineState::Signing => Some(Stage::Sign),
            _ => None,
        }
    }

    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: PipelineState) -> bool {
        match (self, target) {
            (PipelineState::Idle, PipelineState::Unpacking) => true,
            (PipelineState::Unpacking, PipelineState::Rewriting) => true,
            (PipelineState::Rewriting, PipelineState::Repacking) => true,
            (PipelineState::Repacking, PipelineState::Signing) => true,
            (PipelineState::Signing, PipelineState::Done) => true,

            // Any non-terminal state can fail
            (from, PipelineState::Failed) => !from.is_terminal(),

            _ => false,
        }
    }
}

/// Errors for state operations
#[derive(Debug, thiserror::Error)]
pub enum PipelineStateError {
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },
}

/// A recorded state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub state: PipelineState,
    pub at: DateTime<Utc>,
}

/// State of one run with its history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStateData {
    /// Current state
    pub state: PipelineState,

    /// Stage that failed (set on entering FAILED from a stage)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,

    /// All states entered, in order, starting with IDLE
    pub history: Vec<StateChange>,
}

impl PipelineStateData {
    /// Create a new run in IDLE state
    pub fn new() -> Self {
        Self {
            state: PipelineState::Idle,
            failed_stage: None,
            history: vec![StateChange {
                state: PipelineState::Idle,
                at: Utc::now(),
            }],
        }
    }

    /// Transition to a new state
    pub fn transition(&mut self, new_state: PipelineState) -> Result<(), PipelineStateError> {
        if !self.state.can_transition_to(new_state) {
            return Err(PipelineStateError::InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }
        if new_state == PipelineState::Failed {
            self.failed_stage = self.state.stage();
        }
        self.state = new_state;
        self.history.push(StateChange {
            state: new_state,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Enter the state for `stage`
    pub fn begin(&mut self, stage: Stage) -> Result<(), PipelineStateError> {
        self.transition(stage.state())
    }

    /// Mark the run as done
    pub fn finish(&mut self) -> Result<(), PipelineStateError> {
        self.transition(PipelineState::Done)
    }

    /// Mark the run as failed
    pub fn fail(&mut self) -> Result<(), PipelineStateError> {
        self.transition(PipelineState::Failed)
    }
}

impl Default for PipelineStateData {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut data = PipelineStateData::new();
        for stage in Stage::ALL {
            data.begin(stage).unwrap();
        }
        data.finish().unwrap();
        let states: Vec<PipelineState> = data.history.iter().map(|c| c.state).collect();
        assert_eq!(
            states,
            vec![
                PipelineState::Idle,
                PipelineState::Unpacking,
                PipelineState::Rewriting,
                PipelineState::Repacking,
                PipelineState::Signing,
                PipelineState::Done,
            ]
        );
        assert!(data.failed_stage.is_none());
    }

    #[test]
    fn test_stages_cannot_be_skipped() {
        assert!(!PipelineState::Idle.can_transition_to(PipelineState::Rewriting));
        assert!(!PipelineState::Unpacking.can_transition_to(PipelineState::Signing));
        assert!(!PipelineState::Rewriting.can_transition_to(PipelineState::Done));
        assert!(!PipelineState::Repacking.can_transition_to(PipelineState::Unpacking));
    }

    #[test]
    fn test_invalid_transition_error() {
        let mut data = PipelineStateData::new();
        let err = data.begin(Stage::Repack).unwrap_err();
        assert!(matches!(
            err,
            PipelineStateError::InvalidTransition {
                from: PipelineState::Idle,
                to: PipelineState::Repacking
            }
        ));
        assert_eq!(data.state, PipelineState::Idle);
    }

    #[test]
    fn test_fail_records_stage() {
        let mut data = PipelineStateData::new();
        data.begin(Stage::Unpack).unwrap();
        data.begin(Stage::Rewrite).unwrap();
        data.fail().unwrap();
        assert_eq!(data.state, PipelineState::Failed);
        assert_eq!(data.failed_stage, Some(Stage::Rewrite));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut data = PipelineStateData::new();
        data.fail().unwrap();
        assert!(data.fail().is_err());
        assert!(data.begin(Stage::Unpack).is_err());

        assert!(!PipelineState::Done.can_transition_to(PipelineState::Failed));
        assert!(!PipelineState::Done.can_transition_to(PipelineState::Idle));
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&PipelineState::Unpacking).unwrap();
        assert_eq!(json, "\"UNPACKING\"");
        assert_eq!(serde_json::to_string(&Stage::Sign).unwrap(), "\"sign\"");
    }

    #[test]
    fn test_stage_progress_is_monotonic() {
        let mut last = 0;
        for stage in Stage::ALL {
            let (start, end) = stage.progress_span();
            assert_eq!(start, last);
            assert!(end > start);
            last = end;
        }
        assert_eq!(last, 100);
    }
}
