//! Reading and writing the persisted transfer lists.
//!
//! The current format is a JSON array of rows
//! `[user, virtual_path, folder, status, size, offset, attributes]`. Older
//! releases stored the download queue as a pickled list of the same rows,
//! optionally with legacy bitrate and length columns. Every format is read
//! into [`StoredTransfer`]; only JSON is ever written.

use super::record::{
    FileAttributes, TransferRecord, ATTRIBUTE_BITRATE, ATTRIBUTE_DURATION, ATTRIBUTE_VBR,
};
use super::state::{TransferKind, TransferStatus};
use crate::utils::atomic_write::{backup_path, write_file_and_backup};
use crate::{Result, TransferEngineError};
use serde_json::{json, Value as JsonValue};
use serde_pickle::{DeOptions, Value as PickleValue};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DOWNLOADS_FILE: &str = "downloads.json";
pub const UPLOADS_FILE: &str = "uploads.json";
/// Download queue written by 1.4.2 and later legacy releases.
pub const LEGACY_DOWNLOADS_FILE: &str = "config.transfers.pickle";
/// Download queue written by 1.4.1 and earlier.
pub const OLDEST_DOWNLOADS_FILE: &str = "transfers.pickle";

const PICKLE_PROTO: u8 = 0x80;

/// On-disk layout of a transfer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferListFormat {
    Json,
    /// `config.transfers.pickle`
    Pickle142,
    /// `transfers.pickle`
    Pickle141,
}

impl TransferListFormat {
    /// Pick a reader from the file name, falling back to the leading bytes.
    pub fn detect(path: &Path, content: &[u8]) -> Self {
        match path.file_name().and_then(|name| name.to_str()) {
            Some(LEGACY_DOWNLOADS_FILE) => return TransferListFormat::Pickle142,
            Some(OLDEST_DOWNLOADS_FILE) => return TransferListFormat::Pickle141,
            Some(name) if name.ends_with(".json") => return TransferListFormat::Json,
            _ => {}
        }

        let first = content.iter().find(|byte| !byte.is_ascii_whitespace());
        match first {
            Some(&PICKLE_PROTO) => TransferListFormat::Pickle142,
            Some(b'(') | Some(b']') => TransferListFormat::Pickle141,
            _ => TransferListFormat::Json,
        }
    }

    fn parse(self, content: &[u8]) -> Result<Vec<Vec<Cell>>> {
        let root = match self {
            TransferListFormat::Json => Cell::from(serde_json::from_slice::<JsonValue>(content)?),
            TransferListFormat::Pickle142 | TransferListFormat::Pickle141 => {
                let options = DeOptions::new().decode_strings().replace_unresolved_globals();
                Cell::from(serde_pickle::value_from_slice(content, options)?)
            }
        };

        match root {
            Cell::List(rows) => Ok(rows
                .into_iter()
                .filter_map(|row| match row {
                    Cell::List(columns) => Some(columns),
                    _ => None,
                })
                .collect()),
            _ => Err(TransferEngineError::LegacyFormat(
                "Transfer list is not a list of rows".to_string(),
            )),
        }
    }
}

/// Format independent view of one stored value.
#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Cell>),
    Map(Vec<(Cell, Cell)>),
}

impl Cell {
    fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Positive numbers only; zero and anything else count as missing.
    fn as_positive(&self) -> Option<u64> {
        match *self {
            Cell::Int(value) if value > 0 => Some(value as u64),
            Cell::Float(value) if value >= 1.0 => Some(value as u64),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match *self {
            Cell::Int(value) => Some(value),
            Cell::Bool(value) => Some(value as i64),
            Cell::Float(value) => Some(value as i64),
            Cell::Text(ref text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Cell::Null => true,
            Cell::Text(text) => text.is_empty(),
            Cell::List(items) => items.is_empty(),
            Cell::Map(items) => items.is_empty(),
            _ => false,
        }
    }

    fn display(&self) -> String {
        match self {
            Cell::Text(text) => text.clone(),
            Cell::Int(value) => value.to_string(),
            Cell::Float(value) => value.to_string(),
            Cell::Bool(value) => value.to_string(),
            _ => String::new(),
        }
    }
}

impl From<JsonValue> for Cell {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Cell::Null,
            JsonValue::Bool(value) => Cell::Bool(value),
            JsonValue::Number(number) => match number.as_i64() {
                Some(value) => Cell::Int(value),
                None => Cell::Float(number.as_f64().unwrap_or_default()),
            },
            JsonValue::String(text) => Cell::Text(text),
            JsonValue::Array(items) => Cell::List(items.into_iter().map(Cell::from).collect()),
            JsonValue::Object(map) => Cell::Map(
                map.into_iter()
                    .map(|(key, value)| (Cell::Text(key), Cell::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<PickleValue> for Cell {
    fn from(value: PickleValue) -> Self {
        match value {
            PickleValue::None => Cell::Null,
            PickleValue::Bool(value) => Cell::Bool(value),
            PickleValue::I64(value) => Cell::Int(value),
            PickleValue::F64(value) => Cell::Float(value),
            PickleValue::String(text) => Cell::Text(text),
            PickleValue::Bytes(bytes) => Cell::Text(String::from_utf8_lossy(&bytes).into_owned()),
            PickleValue::List(items) | PickleValue::Tuple(items) => {
                Cell::List(items.into_iter().map(Cell::from).collect())
            }
            PickleValue::Dict(map) => Cell::Map(
                map.into_iter()
                    .map(|(key, value)| (Cell::from(key.into_value()), Cell::from(value)))
                    .collect(),
            ),
            // Big integers and sets never appear in transfer rows
            _ => Cell::Null,
        }
    }
}

/// One persisted row, independent of the format it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTransfer {
    pub user: String,
    pub virtual_path: String,
    pub folder_path: String,
    pub status: Option<String>,
    pub size: u64,
    pub current_offset: Option<u64>,
    pub file_attributes: FileAttributes,
}

impl StoredTransfer {
    pub fn from_record(record: &TransferRecord) -> Self {
        Self {
            user: record.user().to_string(),
            virtual_path: record.virtual_path().to_string(),
            folder_path: record.folder_path.to_string_lossy().into_owned(),
            status: Some(record.status().label().into_owned()),
            size: record.size(),
            current_offset: record.current_offset(),
            file_attributes: record.file_attributes.clone(),
        }
    }

    fn from_row(row: &[Cell]) -> Option<Self> {
        if row.len() < 3 {
            return None;
        }

        let user = row[0].as_text()?.to_string();
        let virtual_path = row[1].as_text()?.to_string();
        let folder_path = row[2].as_text()?.to_string();

        let status = row.get(3).filter(|cell| !cell.is_empty()).map(Cell::display);
        let size = row.get(4).and_then(Cell::as_positive).unwrap_or(0);
        let current_offset = row.get(5).and_then(Cell::as_positive);
        let file_attributes = parse_file_attributes(row.get(6), row.get(7));

        Some(Self {
            user,
            virtual_path,
            folder_path,
            status,
            size,
            current_offset,
            file_attributes,
        })
    }

    fn to_json(&self) -> JsonValue {
        json!([
            self.user,
            self.virtual_path,
            self.folder_path,
            self.status,
            self.size,
            self.current_offset,
            self.file_attributes,
        ])
    }

    /// Status a reloaded transfer starts in, `None` if it should not be
    /// restored at all. Only finished uploads are restored; unfinished
    /// downloads wait for their user to come back online.
    pub fn restored_status(&self, kind: TransferKind) -> Option<TransferStatus> {
        let status = self.status.as_deref();

        if kind == TransferKind::Upload && status != Some("Finished") {
            return None;
        }

        Some(match status {
            Some("Aborted") | Some("Paused") => TransferStatus::Paused,
            Some("Filtered") => TransferStatus::Filtered,
            Some("Finished") => TransferStatus::Finished,
            _ => TransferStatus::UserLoggedOff,
        })
    }

    pub fn into_record(self, kind: TransferKind) -> Option<TransferRecord> {
        let status = self.restored_status(kind)?;
        let folder_path = if self.folder_path.is_empty() {
            PathBuf::new()
        } else {
            PathBuf::from(&self.folder_path).components().collect()
        };

        Some(
            TransferRecord::new(self.user, self.virtual_path, folder_path, status, self.size)
                .with_offset(self.current_offset)
                .with_attributes(self.file_attributes),
        )
    }
}

fn parse_file_attributes(attributes: Option<&Cell>, length: Option<&Cell>) -> FileAttributes {
    let mut parsed = FileAttributes::new();

    let Some(attributes) = attributes.filter(|cell| !cell.is_empty()) else {
        return parsed;
    };

    match attributes {
        Cell::Map(entries) => {
            for (key, value) in entries {
                if let (Some(key), Some(value)) = (key.as_int(), value.as_int()) {
                    if let (Ok(key), Ok(value)) = (u32::try_from(key), u32::try_from(value)) {
                        parsed.insert(key, value);
                    }
                }
            }
            return parsed;
        }
        Cell::Text(text) if text.trim_start().starts_with('{') => {
            return parse_dict_literal(text);
        }
        _ => {}
    }

    // Bitrate strings such as "320" or "192 (vbr)"
    let bitrate = attributes.display();
    let is_vbr = bitrate.contains(" (vbr)");

    if let Ok(value) = bitrate.replace(" (vbr)", "").trim().parse::<u32>() {
        parsed.insert(ATTRIBUTE_BITRATE, value);
        if is_vbr {
            parsed.insert(ATTRIBUTE_VBR, 1);
        }
    }

    if let Some(seconds) = length.map(Cell::display).and_then(|text| parse_length(&text)) {
        parsed.insert(ATTRIBUTE_DURATION, seconds);
    }

    parsed
}

/// `"{0: 320, 2: 1}"`
fn parse_dict_literal(text: &str) -> FileAttributes {
    text.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once(':')?;
            let key = key.trim().trim_matches(|c| c == '\'' || c == '"');
            Some((key.parse().ok()?, value.trim().parse().ok()?))
        })
        .collect()
}

/// `"HH:MM:SS"` or `"MM:SS"` to seconds.
fn parse_length(text: &str) -> Option<u32> {
    if !text.contains(':') {
        return None;
    }

    text.split(':').try_fold(0u32, |seconds, part| {
        let part: u32 = part.trim().parse().ok()?;
        seconds.checked_mul(60)?.checked_add(part)
    })
}

/// Path of the download list to load: the JSON file if present, else the
/// newest legacy file that exists.
pub fn download_list_path(data_dir: &Path) -> PathBuf {
    for name in [DOWNLOADS_FILE, LEGACY_DOWNLOADS_FILE, OLDEST_DOWNLOADS_FILE] {
        let path = data_dir.join(name);
        if path.is_file() {
            return path;
        }
    }
    data_dir.join(DOWNLOADS_FILE)
}

pub fn upload_list_path(data_dir: &Path) -> PathBuf {
    data_dir.join(UPLOADS_FILE)
}

fn read_transfers(path: &Path) -> Result<Vec<StoredTransfer>> {
    let content = std::fs::read(path)?;
    let format = TransferListFormat::detect(path, &content);

    debug!("Reading {} as {:?}", path.display(), format);

    Ok(format
        .parse(&content)?
        .iter()
        .filter_map(|row| StoredTransfer::from_row(row))
        .collect())
}

/// Load a transfer list, falling back to the `.old` backup if the file is
/// unreadable. A missing file is an empty list.
pub fn load_transfers(path: &Path) -> Result<Vec<StoredTransfer>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    match read_transfers(path) {
        Ok(transfers) => {
            info!("Loaded {} transfers from {}", transfers.len(), path.display());
            Ok(transfers)
        }
        Err(e) => {
            let backup = backup_path(path);
            if !backup.exists() {
                return Err(e);
            }

            warn!(
                "Failed to load {}: {}, trying backup {}",
                path.display(),
                e,
                backup.display()
            );
            read_transfers(&backup)
        }
    }
}

pub fn save_transfers(path: &Path, transfers: &[StoredTransfer]) -> Result<()> {
    let rows: Vec<JsonValue> = transfers.iter().map(StoredTransfer::to_json).collect();
    let content = serde_json::to_vec(&rows)?;

    write_file_and_backup(path, &content)?;
    debug!("Saved {} transfers to {}", transfers.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_json_rows_with_attribute_variants() {
        let content = br#"[
            ["alice", "music\\a.mp3", "/music", "Finished", 1000, 1000, {"0": 320, "1": 200}],
            ["bob", "music\\b.mp3", "", "Transferring", 2000, 500, "{0: 256, 2: 1}"],
            ["carol", "music\\c.mp3", "", "Paused", 0, null, "192 (vbr)", "1:02:03"],
            ["dave"],
            [1, "bad", ""]
        ]"#;

        let rows = TransferListFormat::Json.parse(content).unwrap();
        let stored: Vec<StoredTransfer> =
            rows.iter().filter_map(|row| StoredTransfer::from_row(row)).collect();

        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].file_attributes, FileAttributes::from([(0, 320), (1, 200)]));
        assert_eq!(stored[1].file_attributes, FileAttributes::from([(0, 256), (2, 1)]));
        assert_eq!(
            stored[2].file_attributes,
            FileAttributes::from([(ATTRIBUTE_BITRATE, 192), (ATTRIBUTE_VBR, 1), (ATTRIBUTE_DURATION, 3723)])
        );
        assert_eq!(stored[2].size, 0);
        assert_eq!(stored[2].current_offset, None);
    }

    #[test]
    fn test_restored_statuses() {
        let mut stored = StoredTransfer {
            user: "alice".into(),
            virtual_path: "a".into(),
            folder_path: String::new(),
            status: Some("Transferring".into()),
            size: 10,
            current_offset: Some(5),
            file_attributes: FileAttributes::new(),
        };

        assert_eq!(stored.restored_status(TransferKind::Download), Some(TransferStatus::UserLoggedOff));
        assert_eq!(stored.restored_status(TransferKind::Upload), None);

        stored.status = Some("Aborted".into());
        assert_eq!(stored.restored_status(TransferKind::Download), Some(TransferStatus::Paused));

        stored.status = Some("Finished".into());
        assert_eq!(stored.restored_status(TransferKind::Upload), Some(TransferStatus::Finished));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DOWNLOADS_FILE);

        let mut record = TransferRecord::new("alice", "music\\a.mp3", "/music", TransferStatus::Paused, 100)
            .with_offset(Some(40));
        record.file_attributes.insert(ATTRIBUTE_BITRATE, 320);

        save_transfers(&path, &[StoredTransfer::from_record(&record)]).unwrap();
        let loaded = load_transfers(&path).unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status.as_deref(), Some("Paused"));
        assert_eq!(loaded[0].current_offset, Some(40));
        assert_eq!(loaded[0].file_attributes.get(&ATTRIBUTE_BITRATE), Some(&320));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(r#"[["alice","music\\a.mp3","/music","Paused",100,40,{"0":320}]"#));
    }

    #[test]
    fn test_corrupt_file_falls_back_to_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(UPLOADS_FILE);

        std::fs::write(backup_path(&path), r#"[["bob", "b", "", "Finished", 5, 5, {}]]"#).unwrap();
        std::fs::write(&path, "[[\"trunc").unwrap();

        let loaded = load_transfers(&path).unwrap();
        assert_eq!(loaded[0].user, "bob");
    }

    #[test]
    fn test_legacy_pickle_download_list() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LEGACY_DOWNLOADS_FILE);

        let rows = vec![vec![
            PickleValue::String("alice".into()),
            PickleValue::String("music\\a.mp3".into()),
            PickleValue::String("/music".into()),
            PickleValue::String("Aborted".into()),
            PickleValue::I64(1000),
            PickleValue::I64(10),
            PickleValue::String("320".into()),
            PickleValue::String("03:30".into()),
        ]];
        let value = PickleValue::List(rows.into_iter().map(PickleValue::List).collect());
        let content = serde_pickle::value_to_vec(&value, serde_pickle::SerOptions::new()).unwrap();
        std::fs::write(&path, content).unwrap();

        assert_eq!(download_list_path(dir.path()), path);

        let loaded = load_transfers(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].restored_status(TransferKind::Download), Some(TransferStatus::Paused));
        assert_eq!(
            loaded[0].file_attributes,
            FileAttributes::from([(ATTRIBUTE_BITRATE, 320), (ATTRIBUTE_DURATION, 210)])
        );
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            TransferListFormat::detect(Path::new("downloads.json"), b"\x80\x02"),
            TransferListFormat::Json
        );
        assert_eq!(
            TransferListFormat::detect(Path::new("transfers.pickle"), b"["),
            TransferListFormat::Pickle141
        );
        assert_eq!(
            TransferListFormat::detect(Path::new("queue.dat"), b"\x80\x03]q"),
            TransferListFormat::Pickle142
        );
        assert_eq!(
            TransferListFormat::detect(Path::new("queue.dat"), b"  [[]]"),
            TransferListFormat::Json
        );
    }
}
