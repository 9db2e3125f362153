//! Two-phase session creation: a client placeholder that is later either
//! confirmed against a real backend session or dropped.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationPhase {
    Placeholder,
    Confirmed(String),
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCreation {
    pub temp_id: String,
    pub workdir: String,
    /// `tempId` from the create response, once it has arrived.
    pub backend_temp_id: Option<String>,
    /// Name the backend reported for the new session, if any.
    pub backend_name: Option<String>,
    pub requested_at: DateTime<Utc>,
    phase: CreationPhase,
}

impl PendingCreation {
    pub fn new(temp_id: String, workdir: String, requested_at: DateTime<Utc>) -> Self {
        Self {
            temp_id,
            workdir,
            backend_temp_id: None,
            backend_name: None,
            requested_at,
            phase: CreationPhase::Placeholder,
        }
    }

    pub fn phase(&self) -> &CreationPhase {
        &self.phase
    }

    pub fn is_pending(&self) -> bool {
        self.phase == CreationPhase::Placeholder
    }

    pub fn confirmed_id(&self) -> Option<&str> {
        match &self.phase {
            CreationPhase::Confirmed(id) => Some(id),
            _ => None,
        }
    }

    /// Placeholder -> Confirmed. Returns false if already resolved.
    pub fn confirm(&mut self, real_id: String) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.phase = CreationPhase::Confirmed(real_id);
        true
    }

    /// Placeholder -> Failed. Returns false if already resolved.
    pub fn fail(&mut self) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.phase = CreationPhase::Failed;
        true
    }
}
