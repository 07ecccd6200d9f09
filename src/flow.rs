//! Per-user upload dialogue state.
//!
//! Replaces an ambient "upload in progress" boolean with an explicit state
//! machine: events are the only transition trigger, so a second media
//! message arriving mid-upload cannot race the flag.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Stage of one user's upload dialogue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowState {
    /// Nothing pending for this user.
    #[default]
    Idle,
    /// Media received; waiting for the user to pick what to do with it.
    AwaitingSelection,
    /// An upload is running; further media is refused until it finishes.
    Uploading,
}

/// Events driving the dialogue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowEvent {
    /// The user sent a media file.
    MediaReceived,
    /// The user confirmed their selection; the upload starts.
    SelectionConfirmed,
    /// The user abandoned the pending selection.
    SelectionCancelled,
    /// The running upload finished, successfully or not.
    UploadFinished,
}

/// An event arrived that the current state does not accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event {event:?} is not valid in state {state:?}")]
pub struct FlowViolation {
    /// State the user was in.
    pub state: FlowState,
    /// The refused event.
    pub event: FlowEvent,
}

impl FlowState {
    /// Apply one event, yielding the next state.
    ///
    /// # Errors
    ///
    /// [`FlowViolation`] when the transition does not exist; the state is
    /// left unchanged by the caller in that case.
    pub fn apply(self, event: FlowEvent) -> Result<Self, FlowViolation> {
        match (self, event) {
            (Self::Idle, FlowEvent::MediaReceived) => Ok(Self::AwaitingSelection),
            (Self::AwaitingSelection, FlowEvent::SelectionConfirmed) => Ok(Self::Uploading),
            (Self::AwaitingSelection, FlowEvent::SelectionCancelled) => Ok(Self::Idle),
            (Self::Uploading, FlowEvent::UploadFinished) => Ok(Self::Idle),
            (state, event) => Err(FlowViolation { state, event }),
        }
    }
}

/// Dialogue state per user id.
///
/// All mutation goes through [`FlowRegistry::apply`], atomically under one
/// lock, so concurrent handlers for the same user serialize on the
/// transition table instead of racing a flag.
#[derive(Default)]
pub struct FlowRegistry {
    states: Mutex<HashMap<i64, FlowState>>,
}

impl FlowRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state for a user (Idle when never seen).
    pub async fn state(&self, user_id: i64) -> FlowState {
        self.states
            .lock()
            .await
            .get(&user_id)
            .copied()
            .unwrap_or_default()
    }

    /// Apply one event for a user, returning the new state.
    ///
    /// # Errors
    ///
    /// [`FlowViolation`] when the current state refuses the event; the
    /// stored state is unchanged.
    pub async fn apply(&self, user_id: i64, event: FlowEvent) -> Result<FlowState, FlowViolation> {
        let mut states = self.states.lock().await;
        let current = states.get(&user_id).copied().unwrap_or_default();
        let next = current.apply(event)?;
        debug!(user_id, ?current, ?event, ?next, "flow transition");
        if next == FlowState::Idle {
            // Idle entries carry no information; drop them so the map only
            // holds users with something pending.
            states.remove(&user_id);
        } else {
            states.insert(user_id, next);
        }
        Ok(next)
    }
}
