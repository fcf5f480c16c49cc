//! Health and status reporting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::engine::QueryEngine;
use crate::sync::SyncOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    NeverInitialized,
    Initializing,
    Ready,
    Syncing,
    DegradedStale,
    Error,
}

impl HealthState {
    /// Whether queries can be served in this state.
    pub fn is_serving(&self) -> bool {
        matches!(
            self,
            HealthState::Ready | HealthState::Syncing | HealthState::DegradedStale
        )
    }
}

/// Inputs to [`evaluate`], gathered from the engine and orchestrator.
#[derive(Debug, Clone, Default)]
pub struct HealthInputs {
    pub engine_ready: bool,
    pub engine_initializing: bool,
    pub syncing: bool,
    pub last_sync_failed: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Derive the health state.
///
/// Staleness means the last successful sync is older than twice the sync
/// interval.
pub fn evaluate(inputs: &HealthInputs, interval: Duration, now: DateTime<Utc>) -> HealthState {
    if !inputs.engine_ready {
        if inputs.engine_initializing || inputs.syncing {
            return HealthState::Initializing;
        }
        if inputs.last_sync_failed {
            return HealthState::Error;
        }
        return HealthState::NeverInitialized;
    }

    if inputs.syncing {
        return HealthState::Syncing;
    }
    if inputs.last_sync_failed {
        return HealthState::Error;
    }

    let stale = inputs.last_synced_at.is_some_and(|at| {
        now.signed_duration_since(at)
            .to_std()
            .is_ok_and(|age| age > interval * 2)
    });
    if stale {
        HealthState::DegradedStale
    } else {
        HealthState::Ready
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: HealthState,
    pub message: String,
    pub content_version: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub document_count: usize,
    pub is_syncing: bool,
    pub last_error: Option<String>,
    pub version: &'static str,
}

fn message(state: HealthState) -> &'static str {
    match state {
        HealthState::NeverInitialized => "no index generation yet; waiting for the first sync",
        HealthState::Initializing => "building the first index generation",
        HealthState::Ready => "serving queries",
        HealthState::Syncing => "serving queries; sync in progress",
        HealthState::DegradedStale => "serving queries; content has not synced recently",
        HealthState::Error => "last sync failed",
    }
}

/// Snapshot the engine and orchestrator into a status report.
///
/// Reads only in-memory state and the version record, so it never triggers
/// engine initialization.
pub async fn report(engine: &QueryEngine, orchestrator: &SyncOrchestrator, interval: Duration) -> StatusReport {
    let current = engine.current().await;
    let record = orchestrator.version_record();
    let sync_state = orchestrator.state();

    let inputs = HealthInputs {
        engine_ready: current.is_some(),
        engine_initializing: engine.is_initializing(),
        syncing: orchestrator.is_sync_in_progress(),
        last_sync_failed: sync_state.last_failed,
        last_synced_at: record.as_ref().map(|r| r.last_synced_at),
    };
    let state = evaluate(&inputs, interval, Utc::now());

    StatusReport {
        state,
        message: message(state).to_string(),
        content_version: current
            .as_ref()
            .map(|g| g.content_version().to_string())
            .or_else(|| record.as_ref().map(|r| r.content_version.clone())),
        last_synced_at: inputs.last_synced_at,
        document_count: current.as_ref().map(|g| g.document_count()).unwrap_or(0),
        is_syncing: inputs.syncing,
        last_error: sync_state.last_error,
        version: env!("CARGO_PKG_VERSION"),
    }
}
