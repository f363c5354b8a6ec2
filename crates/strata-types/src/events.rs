//! Event types for provisioning observability
//!
//! Events provide a unified stream of deployment, feature and repository
//! lifecycle activities.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all strata events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataEventEnvelope {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Event severity
    pub severity: EventSeverity,

    /// The actual event
    pub event: StrataEvent,
}

impl StrataEventEnvelope {
    pub fn new(event: StrataEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            severity: event.severity(),
            event,
        }
    }
}

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Milestones of one deployment transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentEvent {
    DeploymentStarted,
    BundlesInstalled,
    BundlesResolved,
    DeploymentFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureEventKind {
    Installed,
    Uninstalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepositoryEventKind {
    Added,
    Removed,
}

/// Strata events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrataEvent {
    Deployment(DeploymentEvent),

    Feature {
        kind: FeatureEventKind,
        feature_id: String,
        region: String,
        /// Replayed to a late subscriber rather than freshly produced
        replay: bool,
    },

    Repository {
        kind: RepositoryEventKind,
        uri: String,
        replay: bool,
    },

    /// A transaction ended with an error
    DeploymentFailed { reason: String },
}

impl StrataEvent {
    pub fn severity(&self) -> EventSeverity {
        match self {
            Self::Deployment(_) => EventSeverity::Debug,
            Self::Feature { .. } | Self::Repository { .. } => EventSeverity::Info,
            Self::DeploymentFailed { .. } => EventSeverity::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_takes_event_severity() {
        let envelope = StrataEventEnvelope::new(StrataEvent::DeploymentFailed {
            reason: "boom".to_string(),
        });
        assert_eq!(envelope.severity, EventSeverity::Error);

        let envelope = StrataEventEnvelope::new(StrataEvent::Feature {
            kind: FeatureEventKind::Installed,
            feature_id: "foo/1.0.0".to_string(),
            region: "root".to_string(),
            replay: false,
        });
        assert_eq!(envelope.severity, EventSeverity::Info);
    }
}
