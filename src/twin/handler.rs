//! Twin protocol adapter implementation
//!
//! Topic grammar: responses arrive on `$iothub/twin/res/<status>/?$rid=<rid>`
//! and server-initiated desired updates on
//! `$iothub/twin/PATCH/properties/desired/…`. The fields are fixed-shape, so
//! a hand-rolled tokenizer does the parsing.
//!
//! An apply is atomic: the cleaned desired object is written to a sibling
//! temp file and renamed into place, and only after that rename succeeds is
//! the in-memory version advanced and the reported acknowledgment published.

use crate::domain::utc_timestamp;
use crate::transport::{Message, QosLevel, Transport, TransportError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Applied desired-properties document, the sole persistent state
pub const APPLIED_CONFIG_FILE: &str = "./config_applied.json";

/// Last parse/apply failure, overwritten on each occurrence
pub const ERROR_FILE: &str = "./config_error.json";

const RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
const GET_PREFIX: &str = "$iothub/twin/GET/";
const REPORTED_PREFIX: &str = "$iothub/twin/PATCH/properties/reported/";

/// Top-level property groups the device knows how to acknowledge
const KNOWN_GROUPS: [&str; 6] = ["config", "reporting", "modes", "ota", "telemetry", "device"];

/// Twin operation status for observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinStatus {
    Success,
    JsonParseError,
    FileWriteError,
    InvalidResponse,
}

/// Twin errors for fallible operations
#[derive(Debug, Clone, Error)]
pub enum TwinError {
    #[error("twin JSON parse error: {0}")]
    JsonParse(String),

    #[error("applied-config write failed: {0}")]
    FileWrite(String),

    #[error("unexpected twin response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result of one desired-properties apply
#[derive(Debug, Clone)]
pub struct TwinUpdateResult {
    pub status: TwinStatus,
    pub error_message: String,
    pub config_version: String,
    pub applied_at: String,
    pub has_changes: bool,
}

/// Why a request id is outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestPurpose {
    FullTwin,
    Reported,
}

/// Observer for applied configuration changes
pub type ConfigUpdateObserver = Box<dyn Fn(&TwinUpdateResult, &Value) + Send + Sync>;

/// Observer for twin operation completions
pub type TwinResponseObserver = Box<dyn Fn(TwinStatus, &str) + Send + Sync>;

/// Twin protocol adapter.
///
/// Holds no transport; every operation takes the hub transport as an
/// explicit handle, which keeps ownership hub-and-spoke and the adapter
/// trivially mockable.
pub struct TwinAdapter {
    device_id: String,
    initialized: bool,
    version: Mutex<String>,
    pending: Mutex<HashMap<String, RequestPurpose>>,
    config_path: PathBuf,
    error_path: PathBuf,
    config_observer: Option<ConfigUpdateObserver>,
    response_observer: Option<TwinResponseObserver>,
}

impl TwinAdapter {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self::with_paths(device_id, APPLIED_CONFIG_FILE, ERROR_FILE)
    }

    /// Adapter with custom file locations, used by tests
    pub fn with_paths(
        device_id: impl Into<String>,
        config_path: impl Into<PathBuf>,
        error_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            initialized: false,
            version: Mutex::new(String::new()),
            pending: Mutex::new(HashMap::new()),
            config_path: config_path.into(),
            error_path: error_path.into(),
            config_observer: None,
            response_observer: None,
        }
    }

    pub fn set_config_observer(
        &mut self,
        observer: impl Fn(&TwinUpdateResult, &Value) + Send + Sync + 'static,
    ) {
        self.config_observer = Some(Box::new(observer));
    }

    pub fn set_response_observer(
        &mut self,
        observer: impl Fn(TwinStatus, &str) + Send + Sync + 'static,
    ) {
        self.response_observer = Some(Box::new(observer));
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Last successfully applied configuration version
    pub fn config_version(&self) -> String {
        self.version.lock().expect("version lock poisoned").clone()
    }

    /// Whether a topic belongs to the twin protocol
    pub fn is_twin_topic(topic: &str) -> bool {
        topic.starts_with("$iothub/twin/")
    }

    /// Subscribe to the response and desired-PATCH topics. Must run after
    /// the hub session is connected.
    pub async fn initialize<T: Transport>(&mut self, transport: &T) -> Result<(), TwinError> {
        transport
            .subscribe(&format!("{RESPONSE_PREFIX}#"), QosLevel::AtMostOnce)
            .await?;
        transport
            .subscribe(&format!("{DESIRED_PREFIX}#"), QosLevel::AtMostOnce)
            .await?;

        info!(device_id = %self.device_id, "twin subscriptions active");
        self.initialized = true;
        Ok(())
    }

    /// Request the full twin document
    pub async fn request_full_twin<T: Transport>(
        &self,
        transport: &T,
        rid: &str,
    ) -> Result<(), TwinError> {
        let topic = format!("{GET_PREFIX}?$rid={rid}");
        transport
            .publish(&topic, Vec::new(), QosLevel::AtMostOnce, false)
            .await?;
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(rid.to_string(), RequestPurpose::FullTwin);
        debug!(rid, "requested full twin");
        Ok(())
    }

    /// Publish a reported-properties document
    pub async fn send_reported<T: Transport>(
        &self,
        transport: &T,
        rid: &str,
        reported: &Value,
    ) -> Result<(), TwinError> {
        let topic = format!("{REPORTED_PREFIX}?$rid={rid}");
        let payload = serde_json::to_vec(reported)
            .map_err(|e| TwinError::InvalidResponse(e.to_string()))?;
        transport
            .publish(&topic, payload, QosLevel::AtMostOnce, false)
            .await?;
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(rid.to_string(), RequestPurpose::Reported);
        debug!(rid, "sent reported properties");
        Ok(())
    }

    /// Route an inbound twin message
    pub async fn handle_message<T: Transport>(&self, transport: &T, message: &Message) {
        if message.topic.starts_with(RESPONSE_PREFIX) {
            self.process_response(transport, message).await;
        } else if message.topic.starts_with(DESIRED_PREFIX) {
            self.process_desired_patch(transport, message).await;
        }
        // Other topics are not twin traffic; nothing to do
    }

    async fn process_response<T: Transport>(&self, transport: &T, message: &Message) {
        let status = parse_status_code(&message.topic);
        let rid = parse_request_id(&message.topic);
        if !rid.is_empty() {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&rid);
        }

        match status {
            204 => {
                // PATCH acknowledged, no payload
                self.notify_response(TwinStatus::Success, "configuration acknowledged");
                return;
            }
            200 => {
                debug!(rid = %rid, "processing twin document");
            }
            other => {
                let msg = format!("twin operation failed: HTTP {other}");
                warn!(rid = %rid, "{msg}");
                self.notify_response(TwinStatus::InvalidResponse, &msg);
                return;
            }
        }

        let payload = message.payload_str();
        let twin: Value = match serde_json::from_str(&payload) {
            Ok(value) => value,
            Err(e) => {
                let msg = format!("failed to parse twin response JSON: {e}");
                self.write_error_file(&payload, &msg);
                self.notify_response(TwinStatus::JsonParseError, &msg);
                return;
            }
        };

        // A GET response carries desired either directly or wrapped in
        // `properties`
        let desired = twin
            .get("desired")
            .or_else(|| twin.get("properties").and_then(|p| p.get("desired")));
        let Some(desired) = desired else {
            let msg = "twin document missing desired properties".to_string();
            self.notify_response(TwinStatus::InvalidResponse, &msg);
            return;
        };

        if desired.as_object().is_some_and(|m| !m.is_empty()) {
            self.apply_and_ack(transport, desired, "2").await;
        }
    }

    async fn process_desired_patch<T: Transport>(&self, transport: &T, message: &Message) {
        let payload = message.payload_str();
        let patch: Value = match serde_json::from_str(&payload) {
            Ok(value) => value,
            Err(e) => {
                let msg = format!("invalid JSON in desired-properties PATCH: {e}");
                self.write_error_file(&payload, &msg);
                self.notify_response(TwinStatus::JsonParseError, &msg);
                return;
            }
        };

        self.apply_and_ack(transport, &patch, "3").await;
    }

    /// Apply a desired object, then acknowledge. The reported publish is
    /// only attempted once the applied-config file write has succeeded.
    async fn apply_and_ack<T: Transport>(&self, transport: &T, desired: &Value, ack_rid: &str) {
        let result = self.apply_desired(desired);

        if result.status == TwinStatus::Success {
            let ack = self.build_reported_ack(desired, &result);
            if let Err(e) = self.send_reported(transport, ack_rid, &ack).await {
                warn!("failed to publish reported ack: {e}");
            }
        }

        if let Some(observer) = &self.config_observer {
            observer(&result, desired);
        }
        self.notify_response(result.status, &result.error_message);
    }

    /// Apply a desired object: extract the version, persist the cleaned
    /// document atomically, then commit the version in memory. A file write
    /// failure leaves the in-memory version untouched.
    fn apply_desired(&self, desired: &Value) -> TwinUpdateResult {
        let applied_at = utc_timestamp();

        if !validate_desired_structure(desired) {
            warn!("desired properties have no recognized structure, applying anyway");
        }

        let new_version = extract_version(desired);

        let mut clean = desired.clone();
        if let Some(map) = clean.as_object_mut() {
            map.remove("$version");
            map.remove("$metadata");
        }

        if let Err(e) = write_atomic(&self.config_path, &clean) {
            return TwinUpdateResult {
                status: TwinStatus::FileWriteError,
                error_message: format!("failed to write applied config: {e}"),
                config_version: new_version,
                applied_at,
                has_changes: false,
            };
        }

        let has_changes = {
            let mut version = self.version.lock().expect("version lock poisoned");
            if *version != new_version {
                *version = new_version.clone();
                true
            } else {
                false
            }
        };

        info!(
            version = %new_version,
            changed = has_changes,
            "configuration applied"
        );

        TwinUpdateResult {
            status: TwinStatus::Success,
            error_message: String::new(),
            config_version: new_version,
            applied_at,
            has_changes,
        }
    }

    /// Build the reported acknowledgment for an applied desired object.
    ///
    /// Desired documents with a `config` group get a config-wrapped ack that
    /// copies through the recognized inner keys; anything else gets a flat
    /// ack plus per-group stubs.
    fn build_reported_ack(&self, applied: &Value, result: &TwinUpdateResult) -> Value {
        let status = if result.status == TwinStatus::Success {
            "ok"
        } else {
            "error"
        };

        let mut ack = if let Some(config) = applied.get("config") {
            let mut config_ack = json!({
                "applied_at": result.applied_at,
                "status": status,
            });

            if !result.config_version.is_empty() && result.config_version != "unknown" {
                config_ack["config_version"] = json!(result.config_version);
            }
            for key in ["reporting_interval_sec", "feature_high_rate"] {
                if let Some(value) = config.get(key) {
                    config_ack[key] = value.clone();
                }
            }

            json!({ "config": config_ack })
        } else {
            let mut flat = json!({
                "applied_at": result.applied_at,
                "status": status,
                "config_version": result.config_version,
            });

            for group in ["reporting", "modes", "ota"] {
                if applied.get(group).is_some() {
                    flat[format!("{group}_ack")] = json!({
                        "applied_at": result.applied_at,
                        "status": "ok",
                    });
                }
            }

            flat
        };

        if result.status != TwinStatus::Success {
            ack["error"] = json!(result.error_message);
        }

        ack
    }

    /// Overwrite the error file with the latest parse/apply failure
    fn write_error_file(&self, raw_payload: &str, error_message: &str) {
        let document = json!({
            "timestamp": utc_timestamp(),
            "deviceId": self.device_id,
            "error": error_message,
            "rawPayload": raw_payload,
        });

        match serde_json::to_string_pretty(&document) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.error_path, text) {
                    warn!("failed to write error file: {e}");
                }
            }
            Err(e) => warn!("failed to serialize error file: {e}"),
        }
    }

    fn notify_response(&self, status: TwinStatus, message: &str) {
        if let Some(observer) = &self.response_observer {
            observer(status, message);
        }
    }
}

/// Extract the configuration version: `$version` first, then
/// `config.config_version`, else `"unknown"`.
fn extract_version(desired: &Value) -> String {
    let value = desired
        .get("$version")
        .or_else(|| desired.get("config").and_then(|c| c.get("config_version")));

    match value {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => "unknown".to_string(),
    }
}

/// Whether the desired object carries any structure the device recognizes
fn validate_desired_structure(desired: &Value) -> bool {
    let Some(map) = desired.as_object() else {
        return false;
    };
    if KNOWN_GROUPS.iter().any(|key| map.contains_key(*key)) {
        return true;
    }
    map.keys().any(|key| !key.starts_with('$'))
}

/// Write a JSON document via a sibling temp file and rename, so a crash
/// mid-write never leaves a torn applied-config file.
fn write_atomic(path: &Path, document: &Value) -> std::io::Result<()> {
    let text = serde_json::to_string_pretty(document)?;
    let mut temp = path.as_os_str().to_os_string();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    std::fs::write(&temp, text)?;
    std::fs::rename(&temp, path)
}

/// Extract the HTTP status segment from `$iothub/twin/res/<status>/...`
fn parse_status_code(topic: &str) -> u16 {
    let Some(rest) = topic.strip_prefix(RESPONSE_PREFIX) else {
        return 0;
    };
    let segment: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    segment.parse().unwrap_or(0)
}

/// Extract the request id: the value after `$rid=` (or `rid=`) up to the
/// next `&`, `/` or `?`
fn parse_request_id(topic: &str) -> String {
    let start = topic
        .find("$rid=")
        .map(|i| i + 5)
        .or_else(|| topic.find("rid=").map(|i| i + 4));
    let Some(start) = start else {
        return String::new();
    };
    topic[start..]
        .chars()
        .take_while(|c| !matches!(c, '&' | '/' | '?'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_code() {
        assert_eq!(parse_status_code("$iothub/twin/res/200/?$rid=1"), 200);
        assert_eq!(parse_status_code("$iothub/twin/res/204/?$rid=2"), 204);
        assert_eq!(parse_status_code("$iothub/twin/res/429/?$rid=9&retry=5"), 429);
        assert_eq!(parse_status_code("$iothub/twin/res/"), 0);
        assert_eq!(parse_status_code("devices/d/messages/devicebound/x"), 0);
    }

    #[test]
    fn test_parse_request_id() {
        assert_eq!(parse_request_id("$iothub/twin/res/200/?$rid=7"), "7");
        assert_eq!(parse_request_id("$iothub/twin/res/200/?$rid=abc&x=1"), "abc");
        assert_eq!(parse_request_id("$iothub/twin/res/204/?rid=12/extra"), "12");
        assert_eq!(parse_request_id("$iothub/twin/res/200/"), "");
    }

    #[test]
    fn test_extract_version_precedence() {
        assert_eq!(extract_version(&json!({"$version": 7})), "7");
        assert_eq!(
            extract_version(&json!({"config": {"config_version": 9}})),
            "9"
        );
        assert_eq!(
            extract_version(&json!({"$version": 7, "config": {"config_version": 9}})),
            "7"
        );
        assert_eq!(extract_version(&json!({"reporting": {}})), "unknown");
    }

    #[test]
    fn test_validate_desired_structure() {
        assert!(validate_desired_structure(&json!({"config": {}})));
        assert!(validate_desired_structure(&json!({"custom_key": 1})));
        assert!(!validate_desired_structure(&json!({"$version": 3})));
        assert!(!validate_desired_structure(&json!(42)));
    }

    #[test]
    fn test_apply_strips_metadata_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config_applied.json");
        let adapter = TwinAdapter::with_paths(
            "dev-1",
            &config_path,
            dir.path().join("config_error.json"),
        );

        let desired = json!({
            "$version": 7,
            "$metadata": {"$lastUpdated": "2025-01-01T00:00:00Z"},
            "config": {"config_version": 7, "reporting_interval_sec": 30}
        });
        let result = adapter.apply_desired(&desired);

        assert_eq!(result.status, TwinStatus::Success);
        assert_eq!(result.config_version, "7");
        assert!(result.has_changes);
        assert_eq!(adapter.config_version(), "7");

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(&config_path).unwrap()).unwrap();
        assert_eq!(
            written,
            json!({"config": {"config_version": 7, "reporting_interval_sec": 30}})
        );
    }

    #[test]
    fn test_apply_is_idempotent_on_version() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = TwinAdapter::with_paths(
            "dev-1",
            dir.path().join("applied.json"),
            dir.path().join("error.json"),
        );

        let desired = json!({"$version": 5, "config": {"config_version": 5}});
        assert!(adapter.apply_desired(&desired).has_changes);
        let second = adapter.apply_desired(&desired);
        assert!(!second.has_changes);
        assert_eq!(second.status, TwinStatus::Success);
        assert_eq!(adapter.config_version(), "5");
    }

    #[test]
    fn test_apply_file_write_failure_leaves_version_untouched() {
        let adapter = TwinAdapter::with_paths(
            "dev-1",
            "/nonexistent-dir/deeper/applied.json",
            "/nonexistent-dir/deeper/error.json",
        );

        let result = adapter.apply_desired(&json!({"$version": 4}));

        assert_eq!(result.status, TwinStatus::FileWriteError);
        assert!(!result.has_changes);
        assert_eq!(adapter.config_version(), "");
    }

    #[test]
    fn test_reported_ack_config_shape() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = TwinAdapter::with_paths(
            "dev-1",
            dir.path().join("applied.json"),
            dir.path().join("error.json"),
        );

        let desired = json!({
            "$version": 7,
            "config": {"config_version": 7, "reporting_interval_sec": 30}
        });
        let result = adapter.apply_desired(&desired);
        let ack = adapter.build_reported_ack(&desired, &result);

        assert_eq!(ack["config"]["status"], "ok");
        assert_eq!(ack["config"]["config_version"], "7");
        assert_eq!(ack["config"]["reporting_interval_sec"], 30);
        assert!(ack["config"]["applied_at"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_reported_ack_flat_shape_with_group_stubs() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = TwinAdapter::with_paths(
            "dev-1",
            dir.path().join("applied.json"),
            dir.path().join("error.json"),
        );

        let desired = json!({
            "$version": 8,
            "reporting": {"interval": 60},
            "ota": {"channel": "stable"}
        });
        let result = adapter.apply_desired(&desired);
        let ack = adapter.build_reported_ack(&desired, &result);

        assert_eq!(ack["status"], "ok");
        assert_eq!(ack["config_version"], "8");
        assert_eq!(ack["reporting_ack"]["status"], "ok");
        assert_eq!(ack["ota_ack"]["status"], "ok");
        assert!(ack.get("modes_ack").is_none());
    }

    #[test]
    fn test_error_file_shape() {
        let dir = tempfile::tempdir().unwrap();
        let error_path = dir.path().join("config_error.json");
        let adapter =
            TwinAdapter::with_paths("dev-1", dir.path().join("applied.json"), &error_path);

        adapter.write_error_file("{not json", "failed to parse");

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(&error_path).unwrap()).unwrap();
        assert_eq!(written["deviceId"], "dev-1");
        assert_eq!(written["error"], "failed to parse");
        assert_eq!(written["rawPayload"], "{not json");
        assert!(written["timestamp"].as_str().unwrap().ends_with('Z'));
    }
}
