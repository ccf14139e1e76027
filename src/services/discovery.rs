//! Service definition discovery.
//!
//! A services dir holds `<id>.json` definitions next to optional
//! `<id>.meta.json`, `<id>.conf.json` and `<id>.process.json` files. Only
//! names with exactly one dot and a `json` extension are definitions.

use std::fs;
use std::path::{Path, PathBuf};

use super::types::ServiceMeta;
use crate::types::{Error, Result, ServiceId};

/// A definition found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Discovered {
    pub id: ServiceId,
    pub dir: PathBuf,
    pub meta: ServiceMeta,
}

/// List the service definitions of one dir, sorted by id.
pub fn scan_dir(dir: &Path) -> Result<Vec<Discovered>> {
    if !dir.is_dir() {
        return Err(Error::ServicesDirNotFound(dir.display().to_string()));
    }

    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(definition_id) else {
            continue;
        };
        let meta = read_meta(&dir.join(format!("{id}.meta.json")));
        found.push(Discovered {
            id,
            dir: dir.to_path_buf(),
            meta,
        });
    }
    found.sort_by(|a, b| a.id.cmp(&b.id));

    tracing::debug!(dir = %dir.display(), services = found.len(), "services dir scanned");
    Ok(found)
}

/// `meter.json` -> `meter`; anything else (`meter.meta.json`, `meter.js`) -> `None`.
fn definition_id(file_name: &str) -> Option<ServiceId> {
    let (stem, ext) = file_name.split_once('.')?;
    if ext != "json" {
        return None;
    }
    ServiceId::try_from(stem).ok()
}

/// Read service metadata, falling back to defaults when the file is missing
/// or unreadable.
pub fn read_meta(path: &Path) -> ServiceMeta {
    if !path.is_file() {
        return ServiceMeta::default();
    }
    let parsed = fs::read_to_string(path)
        .map_err(Error::from)
        .and_then(|raw| serde_json::from_str::<ServiceMeta>(&raw).map_err(Error::from));
    match parsed {
        Ok(meta) => meta,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "service metadata unreadable, using defaults");
            ServiceMeta::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tracing_test::traced_test;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn test_scan_picks_definitions_only() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "meter.json", "{}");
        write(dir.path(), "meter.meta.json", r#"{"name": "Meter", "autoStart": true}"#);
        write(dir.path(), "meter.conf.json", "{}");
        write(dir.path(), "alpha.json", "{}");
        write(dir.path(), "generator.js", "");
        write(dir.path(), "notes.txt", "");
        fs::create_dir(dir.path().join("nested.json")).unwrap();

        let found = scan_dir(dir.path()).unwrap();
        let ids: Vec<&str> = found.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "meter"]);

        assert_eq!(found[0].meta, ServiceMeta::default());
        assert_eq!(found[1].meta.name, "Meter");
        assert!(found[1].meta.auto_start);
    }

    #[test]
    fn test_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        let err = scan_dir(&missing).unwrap_err();
        assert_eq!(err.code(), "SERVICE_DIR_NOT_FOUND");
    }

    #[test]
    #[traced_test]
    fn test_broken_meta_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "meter.meta.json", "{ not json");
        assert_eq!(
            read_meta(&dir.path().join("meter.meta.json")),
            ServiceMeta::default()
        );
        assert!(logs_contain("service metadata unreadable"));
    }

    #[test]
    fn test_definition_id() {
        assert_eq!(definition_id("meter.json").unwrap().as_str(), "meter");
        assert!(definition_id("meter.meta.json").is_none());
        assert!(definition_id(".json").is_none());
        assert!(definition_id("meter").is_none());
    }
}
