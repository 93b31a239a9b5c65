//! Shared runtime state for pmk-daemon.
//!
//! The engine itself is synchronous and thread-safe; handlers receive
//! `State<Arc<AppState>>` from Axum and call straight into it. The
//! broadcast bus doubles as the engine's notification sink, so every
//! engine event reaches SSE subscribers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use pmk_audit::AuditTrail;
use pmk_escrow::{EscrowEngine, NotificationSink, SinkError};
use pmk_processor_paper::PaperProcessor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BusMsg — SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE
/// events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    Notice {
        recipient_id: String,
        event_type: String,
        payload: Value,
    },
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// BusSink — NotificationSink backed by the broadcast bus
// ---------------------------------------------------------------------------

/// Forwards engine notification events onto the SSE bus. Send failures
/// (no subscribers) are not errors — delivery is best-effort by contract.
pub struct BusSink {
    bus: broadcast::Sender<BusMsg>,
}

impl BusSink {
    pub fn new(bus: broadcast::Sender<BusMsg>) -> Self {
        Self { bus }
    }
}

impl NotificationSink for BusSink {
    fn notify(&self, recipient_id: &str, event_type: &str, payload: &Value) -> Result<(), SinkError> {
        let _ = self.bus.send(BusMsg::Notice {
            recipient_id: recipient_id.to_string(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Shared handle across all Axum handlers.
pub struct AppState {
    pub engine: Arc<EscrowEngine>,
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    /// Static build metadata.
    pub build: BuildInfo,
    /// Optional hash-chained audit trail; appended per committed mutation.
    pub audit: Option<Mutex<AuditTrail>>,
    /// Canonical hash of the loaded configuration (logged at boot).
    pub config_hash: Option<String>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    /// In-memory state backed by the deterministic paper processor.
    pub fn new() -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        let sink = Arc::new(BusSink::new(bus.clone()));
        let engine = Arc::new(EscrowEngine::new(Arc::new(PaperProcessor::new()), sink));

        Self {
            engine,
            bus,
            build: BuildInfo {
                service: "pmk-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            audit: None,
            config_hash: None,
        }
    }

    /// Attach a hash-chained audit trail at `path`.
    pub fn with_audit(mut self, path: &str, hash_chain: bool) -> Result<Self> {
        self.audit = Some(Mutex::new(AuditTrail::new(path, hash_chain)?));
        Ok(self)
    }

    /// Append one audit event; failures are logged, never propagated — the
    /// financial mutation already committed.
    pub fn audit_append(
        &self,
        escrow_id: Uuid,
        topic: &str,
        event_type: &str,
        actor: &str,
        payload: Value,
    ) {
        let Some(audit) = &self.audit else {
            return;
        };
        let mut trail = match audit.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = trail.append(escrow_id, topic, event_type, actor, payload) {
            tracing::warn!(event_type, error = %err, "audit append failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}
