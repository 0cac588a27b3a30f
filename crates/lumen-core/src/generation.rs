//! Generation state machine for one conversation.
//!
//! `Idle -> Streaming -> Completed | Failed`, and back to `Idle` only through
//! an explicit [`GenerationTracker::acknowledge`].

use serde::{Deserialize, Serialize};

use crate::{LumenError, Result, UsageStats};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum GenerationState {
    #[default]
    Idle,
    Streaming {
        partial_text: String,
    },
    Completed {
        final_text: String,
        usage: Option<UsageStats>,
    },
    Failed {
        reason: String,
        /// Text already shown to the user before the failure. Never committed
        /// to the conversation history.
        partial_text: String,
    },
}

impl GenerationState {
    pub fn is_idle(&self) -> bool {
        matches!(self, GenerationState::Idle)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, GenerationState::Streaming { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationState::Completed { .. } | GenerationState::Failed { .. }
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerationTracker {
    state: GenerationState,
}

impl GenerationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &GenerationState {
        &self.state
    }

    /// `Idle -> Streaming("")`.
    pub fn begin(&mut self) -> Result<()> {
        if !self.state.is_idle() {
            return Err(LumenError::GenerationInProgress);
        }
        self.state = GenerationState::Streaming {
            partial_text: String::new(),
        };
        Ok(())
    }

    /// Replace the partial text. Ignored unless streaming.
    pub fn update(&mut self, partial: &str) -> bool {
        let GenerationState::Streaming { partial_text } = &mut self.state else {
            return false;
        };
        partial_text.clear();
        partial_text.push_str(partial);
        true
    }

    pub fn complete(&mut self, final_text: String, usage: Option<UsageStats>) -> bool {
        if !self.state.is_streaming() {
            return false;
        }
        self.state = GenerationState::Completed { final_text, usage };
        true
    }

    pub fn fail(&mut self, reason: String) -> bool {
        let GenerationState::Streaming { partial_text } = &mut self.state else {
            return false;
        };
        let partial_text = std::mem::take(partial_text);
        self.state = GenerationState::Failed {
            reason,
            partial_text,
        };
        true
    }

    /// `Completed | Failed -> Idle`. Acknowledging while idle is a no-op.
    pub fn acknowledge(&mut self) -> Result<()> {
        match self.state {
            GenerationState::Streaming { .. } => Err(LumenError::GenerationInProgress),
            _ => {
                self.state = GenerationState::Idle;
                Ok(())
            }
        }
    }
}
