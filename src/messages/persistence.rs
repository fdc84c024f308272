//! Durable storage for the two message logs.
//!
//! Layout: `<storage_root>/tasks/<task_id>/` holding
//! `api_conversation_history.json` and `ui_messages.json`. Writes go
//! through a temp file and rename so a crash never leaves a half-written
//! log behind.

use std::path::{Path, PathBuf};

use crate::errors::PersistenceError;
use crate::messages::{ApiMessage, UiMessage};

const API_HISTORY_FILE: &str = "api_conversation_history.json";
const UI_MESSAGES_FILE: &str = "ui_messages.json";

/// Directory holding all persisted state for one task.
pub fn task_dir(storage_root: &Path, task_id: &str) -> PathBuf {
    storage_root.join("tasks").join(task_id)
}

pub async fn read_api_messages(
    storage_root: &Path,
    task_id: &str,
) -> Result<Vec<ApiMessage>, PersistenceError> {
    read_log(&task_dir(storage_root, task_id).join(API_HISTORY_FILE)).await
}

pub async fn save_api_messages(
    storage_root: &Path,
    task_id: &str,
    messages: &[ApiMessage],
) -> Result<(), PersistenceError> {
    write_log(
        &task_dir(storage_root, task_id).join(API_HISTORY_FILE),
        messages,
    )
    .await
}

pub async fn read_ui_messages(
    storage_root: &Path,
    task_id: &str,
) -> Result<Vec<UiMessage>, PersistenceError> {
    read_log(&task_dir(storage_root, task_id).join(UI_MESSAGES_FILE)).await
}

pub async fn save_ui_messages(
    storage_root: &Path,
    task_id: &str,
    messages: &[UiMessage],
) -> Result<(), PersistenceError> {
    write_log(
        &task_dir(storage_root, task_id).join(UI_MESSAGES_FILE),
        messages,
    )
    .await
}

async fn read_log<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Vec<T>, PersistenceError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(PersistenceError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

async fn write_log<T: serde::Serialize>(
    path: &Path,
    records: &[T],
) -> Result<(), PersistenceError> {
    let write_err = |e: std::io::Error| PersistenceError::Write {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let bytes = serde_json::to_vec_pretty(records).map_err(|e| PersistenceError::Write {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await.map_err(write_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(write_err)?;
    Ok(())
}
