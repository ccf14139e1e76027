//! Service configuration and metadata records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::types::ServiceId;

/// Supervisor-side record of one discovered service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub id: ServiceId,
    /// Errors seen since the last clear.
    pub errors: u32,
    /// Service definition (`<id>.json`).
    pub file_path: PathBuf,
    /// Metadata (`<id>.meta.json`).
    pub meta_path: PathBuf,
    /// Config overlay (`<id>.conf.json`).
    pub config_path: PathBuf,
    /// Process override (`<id>.process.json`).
    pub process_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub run: bool,
    /// Restart after the next crash. Cleared on every explicit start/stop.
    pub auto_reload: bool,
    /// Definition file vanished while the service was running.
    pub deleted: bool,
}

impl ServiceConfig {
    pub fn new(id: ServiceId, dir: &std::path::Path) -> Self {
        Self {
            file_path: dir.join(format!("{id}.json")),
            meta_path: dir.join(format!("{id}.meta.json")),
            config_path: dir.join(format!("{id}.conf.json")),
            process_path: dir.join(format!("{id}.process.json")),
            id,
            errors: 0,
            started_at: None,
            run: false,
            auto_reload: false,
            deleted: false,
        }
    }
}

/// Service metadata, read from `<id>.meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceMeta {
    pub name: String,
    pub group: String,
    pub description: String,
    /// Part of the host itself rather than a user service.
    pub system: bool,
    pub auto_start: bool,
    pub auto_reload: bool,
    /// Run in its own unit instead of the shared one.
    pub isolated: bool,
}

impl Default for ServiceMeta {
    fn default() -> Self {
        Self {
            name: "default name".to_string(),
            group: "no group".to_string(),
            description: "Default description".to_string(),
            system: false,
            auto_start: false,
            auto_reload: false,
            isolated: false,
        }
    }
}

/// Lifecycle status derived from supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    RestartScheduled,
}

/// Config with the metadata keys laid over it, as exported to clients.
pub fn merge_export(config: &ServiceConfig, meta: Option<&ServiceMeta>) -> Value {
    let mut merged = match serde_json::to_value(config) {
        Ok(Value::Object(object)) => object,
        _ => Map::new(),
    };
    if let Some(Ok(Value::Object(meta))) = meta.map(serde_json::to_value) {
        merged.extend(meta);
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::Path;

    #[test]
    fn test_config_paths_follow_id() {
        let config = ServiceConfig::new(ServiceId::try_from("meter").unwrap(), Path::new("svc"));
        assert_eq!(config.file_path, Path::new("svc/meter.json"));
        assert_eq!(config.meta_path, Path::new("svc/meter.meta.json"));
        assert_eq!(config.config_path, Path::new("svc/meter.conf.json"));
        assert_eq!(config.process_path, Path::new("svc/meter.process.json"));
    }

    #[test]
    fn test_meta_partial_file_keeps_defaults() {
        let meta: ServiceMeta =
            serde_json::from_value(json!({"name": "Meter", "autoReload": true})).unwrap();
        assert_eq!(meta.name, "Meter");
        assert!(meta.auto_reload);
        assert_eq!(meta.group, "no group");
        assert!(!meta.isolated);
    }

    #[test]
    fn test_export_lays_meta_over_config() {
        let config = ServiceConfig::new(ServiceId::try_from("meter").unwrap(), Path::new("svc"));
        let meta = ServiceMeta {
            auto_reload: true,
            ..ServiceMeta::default()
        };
        let exported = merge_export(&config, Some(&meta));

        assert_eq!(exported["id"], json!("meter"));
        assert_eq!(exported["filePath"], json!("svc/meter.json"));
        // Both records carry autoReload; the metadata value wins.
        assert_eq!(exported["autoReload"], json!(true));
        assert_eq!(exported["name"], json!("default name"));
    }
}
