// SPDX-License-Identifier: Apache-2.0
//
// Core domain types for the Cinder secure environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for a secure environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentId(pub Uuid);

impl EnvironmentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EnvironmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states of a secure environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentState {
    /// Built but isolation/storage not yet initialized.
    Created,
    /// Initialized and accepting store/retrieve/execute calls.
    Active,
    /// Teardown in progress — new operations are rejected.
    Destroying,
    /// Fully torn down; the handle is permanently unusable.
    Destroyed,
}

/// Best-effort classification of the storage medium under a path.
///
/// Advisory only: used to annotate residual-recovery risk in deletion
/// reports, never to make a security decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediumType {
    /// Spinning disk — multi-pass overwrite addresses the physical blocks.
    Rotational,
    /// Flash storage — wear leveling may retain stale copies of blocks.
    SolidState,
    /// Classification failed or is not implemented for this platform.
    Unknown,
}

impl std::fmt::Display for MediumType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MediumType::Rotational => "rotational",
            MediumType::SolidState => "solid-state",
            MediumType::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a post-deletion verification check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionReport {
    /// The path that was checked.
    pub path: PathBuf,
    /// Whether anything still exists at the path.
    pub exists: bool,
    /// Advisory storage-medium classification.
    pub medium: MediumType,
    /// Human-readable caveats (wear leveling, classification failures, ...).
    pub notes: Vec<String>,
}

/// Non-secret metadata record written alongside ciphertext files.
///
/// This is the only artifact other than ciphertext that ever touches
/// disk. It must never carry key material or plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// When the environment's storage root was created.
    pub created: DateTime<Utc>,
    /// Caller-chosen environment name (diagnostic only).
    pub name: String,
    /// `std::env::consts::OS` at creation time.
    pub platform: String,
}

/// Outcome of a single teardown step inside `destroy()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestructionStep {
    /// Step label: "restore-isolation", "destroy-store", "scrub-memory".
    pub step: String,
    /// `None` on success, otherwise the error rendered as text.
    pub error: Option<String>,
}

impl DestructionStep {
    pub fn ok(step: &str) -> Self {
        Self {
            step: step.to_owned(),
            error: None,
        }
    }

    pub fn failed(step: &str, error: impl std::fmt::Display) -> Self {
        Self {
            step: step.to_owned(),
            error: Some(error.to_string()),
        }
    }
}

/// Aggregated result of environment teardown.
///
/// `destroy()` never raises: every step is attempted and its outcome
/// recorded here so the caller can tell the user whether destruction
/// may be incomplete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestructionReport {
    /// The environment that was torn down.
    pub environment: EnvironmentId,
    /// Per-step outcomes, in execution order.
    pub steps: Vec<DestructionStep>,
}

impl DestructionReport {
    pub fn new(environment: EnvironmentId) -> Self {
        Self {
            environment,
            steps: Vec::new(),
        }
    }

    /// True only if every teardown step succeeded.
    pub fn fully_destroyed(&self) -> bool {
        self.steps.iter().all(|s| s.error.is_none())
    }

    /// Errors from failed steps, for display.
    pub fn failures(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(|s| s.error.as_deref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_ids_are_unique() {
        assert_ne!(EnvironmentId::new(), EnvironmentId::new());
    }

    #[test]
    fn destruction_report_aggregates_failures() {
        let mut report = DestructionReport::new(EnvironmentId::new());
        report.steps.push(DestructionStep::ok("restore-isolation"));
        assert!(report.fully_destroyed());

        report
            .steps
            .push(DestructionStep::failed("destroy-store", "disk on fire"));
        assert!(!report.fully_destroyed());
        assert_eq!(report.failures(), vec!["disk on fire"]);
    }

    #[test]
    fn metadata_round_trips_through_json() {
        let meta = StoreMetadata {
            created: Utc::now(),
            name: "tax-audit".into(),
            platform: std::env::consts::OS.into(),
        };
        let json = serde_json::to_string(&meta).expect("serialize");
        let back: StoreMetadata = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.name, meta.name);
        assert_eq!(back.platform, meta.platform);
    }
}
