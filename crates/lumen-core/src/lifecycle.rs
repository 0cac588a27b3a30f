//! Model lifecycle state machine.
//!
//! `Unloaded -> Loading -> Ready | Error`, `Ready | Error -> Loading` on a new
//! load. Only the outcome of the single outstanding load leaves `Loading`.

use serde::{Deserialize, Serialize};

use crate::{LumenError, ModelCatalog, ModelDescriptor, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ModelLifecycleState {
    #[default]
    Unloaded,
    Loading { model_id: String },
    Ready { model_id: String },
    Error { model_id: String, reason: String },
}

impl ModelLifecycleState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ModelLifecycleState::Ready { .. })
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, ModelLifecycleState::Loading { .. })
    }

    pub fn model_id(&self) -> Option<&str> {
        match self {
            ModelLifecycleState::Unloaded => None,
            ModelLifecycleState::Loading { model_id }
            | ModelLifecycleState::Ready { model_id }
            | ModelLifecycleState::Error { model_id, .. } => Some(model_id),
        }
    }
}

impl std::fmt::Display for ModelLifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelLifecycleState::Unloaded => write!(f, "No model loaded"),
            ModelLifecycleState::Loading { model_id } => write!(f, "Loading {}", model_id),
            ModelLifecycleState::Ready { model_id } => write!(f, "{} ready", model_id),
            ModelLifecycleState::Error { model_id, reason } => {
                write!(f, "Failed to load {}: {}", model_id, reason)
            }
        }
    }
}

/// Handle for one accepted load. Outcomes are only applied if the ticket is
/// still the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub epoch: u64,
    pub model_id: String,
    /// Model that was ready before this load and should be unloaded first.
    pub previous: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelLifecycle {
    state: ModelLifecycleState,
    candidate: Option<String>,
    epoch: u64,
}

impl ModelLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ModelLifecycleState {
        &self.state
    }

    pub fn candidate(&self) -> Option<&str> {
        self.candidate.as_deref()
    }

    /// Record the candidate model. Only the candidate changes.
    pub fn select<'a>(&mut self, catalog: &'a ModelCatalog, id: &str) -> Result<&'a ModelDescriptor> {
        let model = catalog.validate(id)?;
        self.candidate = Some(model.id.clone());
        Ok(model)
    }

    pub fn begin_load(&mut self, model_id: &str) -> Result<LoadTicket> {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            return Err(LumenError::Validation("model id is empty".into()));
        }
        if self.state.is_loading() {
            return Err(LumenError::AlreadyInProgress);
        }

        let previous = match &self.state {
            ModelLifecycleState::Ready { model_id } => Some(model_id.clone()),
            _ => None,
        };

        self.epoch += 1;
        self.state = ModelLifecycleState::Loading {
            model_id: model_id.to_string(),
        };

        Ok(LoadTicket {
            epoch: self.epoch,
            model_id: model_id.to_string(),
            previous,
        })
    }

    /// True while `epoch` identifies the load currently in `Loading`.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.state.is_loading()
    }

    /// Apply the outcome of a load. Returns false if the ticket is stale.
    pub fn finish_load(&mut self, ticket: &LoadTicket, outcome: std::result::Result<(), String>) -> bool {
        if !self.is_current(ticket.epoch) {
            return false;
        }
        self.state = match outcome {
            Ok(()) => ModelLifecycleState::Ready {
                model_id: ticket.model_id.clone(),
            },
            Err(reason) => ModelLifecycleState::Error {
                model_id: ticket.model_id.clone(),
                reason,
            },
        };
        true
    }

    /// `Ready | Error -> Unloaded`. Returns the model that was ready, if any.
    pub fn unload(&mut self) -> Result<Option<String>> {
        let previous = match &self.state {
            ModelLifecycleState::Loading { .. } => return Err(LumenError::AlreadyInProgress),
            ModelLifecycleState::Ready { model_id } => Some(model_id.clone()),
            ModelLifecycleState::Error { .. } | ModelLifecycleState::Unloaded => None,
        };
        self.state = ModelLifecycleState::Unloaded;
        Ok(previous)
    }
}
