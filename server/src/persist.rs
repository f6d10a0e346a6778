//! Atomic JSON file persistence shared by the identity store and the
//! session registry.
//!
//! Writers go through write-to-temp + rename so readers never observe a
//! torn file. A failed write is retried once with back-off; a second
//! failure quarantines the on-disk record and surfaces a persistence error.

use crate::error::ServerError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{error, warn};

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

pub fn quarantine_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".quarantined");
    PathBuf::from(os)
}

async fn write_once<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = tmp_path(path);
    fs::write(&tmp, &bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Atomic write with one retry. On the second failure the current on-disk
/// record (if any) is renamed aside so it is not overwritten by later
/// partial writes, and the caller gets a persistence error.
pub async fn write_json_with_retry<T: Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), ServerError> {
    match write_once(path, value).await {
        Ok(()) => return Ok(()),
        Err(e) => {
            warn!("write of {} failed, retrying: {}", path.display(), e);
        }
    }
    tokio::time::sleep(RETRY_BACKOFF).await;
    match write_once(path, value).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("write of {} failed twice, quarantining: {}", path.display(), e);
            if fs::try_exists(path).await.unwrap_or(false) {
                let _ = fs::rename(path, quarantine_path(path)).await;
            }
            Err(ServerError::Persistence(format!(
                "{}: {}",
                path.display(),
                e
            )))
        }
    }
}

/// Reads a JSON record. `Ok(None)` when the file does not exist; a parse
/// failure is reported as a corrupted record.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ServerError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ServerError::Persistence(format!(
                "{}: {}",
                path.display(),
                e
            )))
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| ServerError::CorruptedRecord(format!("{}: {}", path.display(), e)))
}

/// Moves a record aside as `<name>.quarantined` instead of deleting it.
pub async fn quarantine(path: &Path) {
    warn!("quarantining {}", path.display());
    let _ = fs::rename(path, quarantine_path(path)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        let record = Record {
            name: "alice".to_string(),
            count: 3,
        };

        write_json_with_retry(&path, &record).await.unwrap();
        let loaded: Option<Record> = read_json(&path).await.unwrap();
        assert_eq!(loaded, Some(record));

        // The temp file must not survive the rename.
        assert!(!tmp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<Record> = read_json(&dir.path().join("nope.json")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, b"{not json").await.unwrap();
        let err = read_json::<Record>(&path).await.unwrap_err();
        assert!(matches!(err, ServerError::CorruptedRecord(_)));
    }

    #[tokio::test]
    async fn test_quarantine_moves_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        fs::write(&path, b"{}").await.unwrap();
        quarantine(&path).await;
        assert!(!path.exists());
        assert!(quarantine_path(&path).exists());
    }
}
