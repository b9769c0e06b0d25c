//! Stream Store (C2): a serialized, file-backed map with an in-memory index.
//!
//! Persistence writes atomically (temp file then rename) into the versioned
//! TOML document §6 specifies. The store keeps the whole parsed document as
//! a `toml::Table` so that fields this crate doesn't know about round-trip
//! untouched — only the subtrees an operation actually touches are
//! rewritten.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use toml::value::Table;
use toml::Value;

use crate::error::{AppError, Result};
use crate::model::{StreamSpec, ValidationRecord};

const STORE_VERSION: i64 = 1;

struct Index {
    doc: Table,
    specs: BTreeMap<String, StreamSpec>,
    validation: ValidationRecord,
}

/// File-backed map of `stream_id -> StreamSpec`, single-writer/many-reader.
pub struct StreamStore {
    path: PathBuf,
    inner: RwLock<Index>,
}

impl StreamStore {
    /// Construct a store bound to `path` without touching disk. Call
    /// [`StreamStore::load`] to populate it (or it starts out empty, matching
    /// a fresh installation).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: RwLock::new(Index {
                doc: empty_doc(),
                specs: BTreeMap::new(),
                validation: ValidationRecord::default(),
            }),
        }
    }

    /// Re-read the backing file from scratch. On a malformed file, the
    /// existing in-memory state is left untouched and the parse error is
    /// returned.
    pub fn load(&self) -> Result<()> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // A fresh install: nothing to load, nothing to change.
                return Ok(());
            }
            Err(e) => return Err(AppError::ConfigIo(e)),
        };
        let doc: Table = toml::from_str(&text).map_err(AppError::TomlDe)?;
        let (specs, validation) = parse_doc(&doc)?;

        let mut guard = self.inner.write();
        guard.doc = doc;
        guard.specs = specs;
        guard.validation = validation;
        Ok(())
    }

    /// Atomically persist the current in-memory document: write to a sibling
    /// temp file, then rename over the target. Creates parent directories if
    /// missing.
    pub fn save(&self) -> Result<()> {
        let guard = self.inner.read();
        let text = toml::to_string_pretty(&guard.doc).map_err(AppError::TomlSer)?;
        drop(guard);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(AppError::ConfigIo)?;
        }
        let tmp_path = tmp_sibling(&self.path);
        std::fs::write(&tmp_path, text).map_err(AppError::ConfigIo)?;
        std::fs::rename(&tmp_path, &self.path).map_err(AppError::ConfigIo)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<StreamSpec> {
        self.inner.read().specs.get(id).cloned()
    }

    pub fn get_all(&self) -> BTreeMap<String, StreamSpec> {
        self.inner.read().specs.clone()
    }

    pub fn add(&self, spec: StreamSpec) -> Result<()> {
        spec.validate()
            .map_err(|e| AppError::ConfigSchema(e.to_string()))?;
        let mut guard = self.inner.write();
        put_spec(&mut guard.doc, &spec)?;
        guard.specs.insert(spec.id.clone(), spec);
        Ok(())
    }

    pub fn update(&self, id: &str, spec: StreamSpec) -> Result<()> {
        spec.validate()
            .map_err(|e| AppError::ConfigSchema(e.to_string()))?;
        let mut guard = self.inner.write();
        if !guard.specs.contains_key(id) {
            return Err(AppError::ConfigSchema(format!("unknown stream id {id}")));
        }
        remove_spec(&mut guard.doc, id);
        put_spec(&mut guard.doc, &spec)?;
        guard.specs.remove(id);
        guard.specs.insert(spec.id.clone(), spec);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let mut guard = self.inner.write();
        remove_spec(&mut guard.doc, id);
        guard.specs.remove(id);
        Ok(())
    }

    pub fn get_validation(&self) -> ValidationRecord {
        self.inner.read().validation.clone()
    }

    pub fn update_validation(&self, record: ValidationRecord) -> Result<()> {
        let mut guard = self.inner.write();
        let value = Value::try_from(&record).map_err(AppError::TomlSer)?;
        guard.doc.insert("validation".into(), value);
        guard.validation = record;
        Ok(())
    }
}

fn empty_doc() -> Table {
    let mut doc = Table::new();
    doc.insert("version".into(), Value::Integer(STORE_VERSION));
    doc.insert("streams".into(), Value::Table(Table::new()));
    doc
}

fn put_spec(doc: &mut Table, spec: &StreamSpec) -> Result<()> {
    let streams = doc
        .entry("streams")
        .or_insert_with(|| Value::Table(Table::new()))
        .as_table_mut()
        .ok_or_else(|| AppError::ConfigSchema("`streams` is not a table".into()))?;
    let value = Value::try_from(spec).map_err(AppError::TomlSer)?;
    streams.insert(spec.id.clone(), value);
    Ok(())
}

fn remove_spec(doc: &mut Table, id: &str) {
    if let Some(Value::Table(streams)) = doc.get_mut("streams") {
        streams.remove(id);
    }
}

fn parse_doc(doc: &Table) -> Result<(BTreeMap<String, StreamSpec>, ValidationRecord)> {
    let mut specs = BTreeMap::new();
    if let Some(Value::Table(streams)) = doc.get("streams") {
        for (id, value) in streams {
            let spec: StreamSpec = value
                .clone()
                .try_into()
                .map_err(|e: toml::de::Error| AppError::ConfigSchema(format!("{id}: {e}")))?;
            specs.insert(id.clone(), spec);
        }
    }
    let validation = match doc.get("validation") {
        Some(value) => value
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| AppError::ConfigSchema(e.to_string()))?,
        None => ValidationRecord::default(),
    };
    Ok((specs, validation))
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Codec, FfmpegSpec, Quality, QualityMode};

    fn spec(id: &str) -> StreamSpec {
        StreamSpec {
            id: id.into(),
            name: "cam".into(),
            device: "usb-0000:00:14.0-1".into(),
            test_mode: false,
            custom_command: None,
            ffmpeg: FfmpegSpec {
                codec: Codec::H264,
                input_format: "yuyv422".into(),
                resolution: "1920x1080".into(),
                fps: 30,
                audio_device: None,
                options: vec![],
                quality: Quality {
                    mode: QualityMode::Vbr,
                    bitrate_kbps: 4000,
                },
            },
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn round_trip_preserves_specs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.toml");

        let store = StreamStore::new(&path);
        store.add(spec("cam1")).unwrap();
        store.add(spec("cam2")).unwrap();
        store.save().unwrap();

        let reloaded = StreamStore::new(&path);
        reloaded.load().unwrap();
        let all = reloaded.get_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all["cam1"].device, "usb-0000:00:14.0-1");
    }

    #[test]
    fn unknown_fields_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.toml");
        std::fs::write(
            &path,
            r#"
version = 1
future_field = "kept"

[streams.cam1]
id = "cam1"
name = "cam"
device = "usb-0000:00:14.0-1"
created_at = "2024-01-01T00:00:00Z"
updated_at = "2024-01-01T00:00:00Z"

[streams.cam1.ffmpeg]
codec = "h264"
input_format = "yuyv422"
resolution = "1920x1080"
fps = 30

[streams.cam1.ffmpeg.quality]
mode = "vbr"
bitrate_kbps = 4000
"#,
        )
        .unwrap();

        let store = StreamStore::new(&path);
        store.load().unwrap();
        store.save().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("future_field"));
    }

    #[test]
    fn malformed_file_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.toml");
        std::fs::write(&path, "not = [valid toml").unwrap();

        let store = StreamStore::new(&path);
        store.add(spec("cam1")).unwrap();
        assert!(store.load().is_err());
        assert_eq!(store.get_all().len(), 1);
    }

    #[test]
    fn rejects_invalid_spec() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::new(dir.path().join("streams.toml"));
        let mut bad = spec("bad id!");
        bad.ffmpeg.resolution = "1920x1080".into();
        assert!(store.add(bad).is_err());
    }

    #[test]
    fn validation_sidecar_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.toml");
        let store = StreamStore::new(&path);

        let mut record = ValidationRecord::default();
        record.h264.working.push("h264_vaapi".into());
        record.h264.failed.push("h264_nvenc".into());
        store.update_validation(record).unwrap();
        store.save().unwrap();

        let reloaded = StreamStore::new(&path);
        reloaded.load().unwrap();
        let rec = reloaded.get_validation();
        assert_eq!(rec.h264.working, vec!["h264_vaapi".to_string()]);
    }
}
