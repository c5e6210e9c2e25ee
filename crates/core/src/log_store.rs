//! Crash-safe JSON logs kept next to the engine file.
//!
//! Every write goes to a temp file in the destination directory and is then
//! renamed over the target, so readers only ever see a complete old or a
//! complete new document.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::layout;
use crate::request::{DetailLogRecord, UserStackEntry, UserStackLogRecord};

pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_REPLACED: &str = "replaced";

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory: {}", parent.display()))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    tmp.write_all(data)
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to fsync temp file for {}", path.display()))?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to atomically replace {}", path.display()))?;

    Ok(())
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let encoded = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize JSON for {}", path.display()))?;
    write_atomic(path, &encoded)
}

/// Guards the artifact writes of one bounded stage. After `close` returns,
/// no commit through this gate can reach disk.
#[derive(Debug, Clone, Default)]
pub struct CommitGate {
    closed: Arc<StdMutex<bool>>,
}

impl CommitGate {
    pub fn open() -> Self {
        Self::default()
    }

    /// Writes `data` atomically unless the gate is closed. The gate stays
    /// locked for the whole write, so `close` waits for it.
    pub fn commit(&self, path: &Path, data: &[u8]) -> Result<()> {
        let closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            bail!("stage deadline passed, not writing {}", path.display());
        }
        write_atomic(path, data)
    }

    pub fn commit_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(value)
            .with_context(|| format!("failed to serialize JSON for {}", path.display()))?;
        self.commit(path, &encoded)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks while a commit is in flight, then refuses all later ones.
    pub fn close(&self) {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

/// Per-request handle on the log locations. Built fresh for every request;
/// nothing here is global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogContext {
    pub base_dir: PathBuf,
    pub uuid: String,
    pub user_id: Option<String>,
}

impl LogContext {
    pub fn new(base_dir: PathBuf, uuid: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            base_dir,
            uuid: uuid.into(),
            user_id,
        }
    }

    pub fn detail_log_path(&self) -> PathBuf {
        layout::detail_log_path(&self.base_dir, &self.uuid)
    }

    pub fn user_log_path(&self) -> Option<PathBuf> {
        self.user_id
            .as_deref()
            .map(|user_id| layout::user_log_path(&self.base_dir, user_id))
    }

    pub fn write_detail(&self, record: &DetailLogRecord) -> Result<PathBuf> {
        let path = self.detail_log_path();
        write_json_atomic(&path, record)?;
        debug!(uuid = %self.uuid, path = %path.display(), "detail log written");
        Ok(path)
    }
}

/// Moves any stack entry with the same `process_name` into history and
/// appends `entry` at the top of the stack.
pub fn apply_stack_entry(record: &mut UserStackLogRecord, entry: UserStackEntry, now: &str) {
    let (replaced, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut record.stack)
        .into_iter()
        .partition(|existing| existing.process_name == entry.process_name);

    record.history.extend(replaced.into_iter().map(|mut old| {
        old.status = STATUS_REPLACED.to_string();
        old.replaced_at = Some(now.to_string());
        old
    }));
    record.stack = kept;
    record.stack.push(entry);
    record.updated_at = now.to_string();
}

fn load_user_stack(path: &Path, user_id: &str, now: &str) -> UserStackLogRecord {
    let fresh = || UserStackLogRecord {
        user_id: user_id.to_string(),
        stack: Vec::new(),
        history: Vec::new(),
        updated_at: now.to_string(),
    };

    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return fresh(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable user stack log; starting fresh");
            return fresh();
        }
    };

    match serde_json::from_slice::<UserStackLogRecord>(&raw) {
        Ok(mut record) => {
            record.user_id = user_id.to_string();
            record
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt user stack log; starting fresh");
            fresh()
        }
    }
}

/// Blocking read-modify-write of one user's stack file. Callers must hold
/// the per-user lock from [`UserStackStore`].
pub fn update_user_stack_file(
    path: &Path,
    user_id: &str,
    entry: UserStackEntry,
) -> Result<UserStackLogRecord> {
    let now = now_rfc3339();
    let mut record = load_user_stack(path, user_id, &now);
    apply_stack_entry(&mut record, entry, &now);
    write_json_atomic(path, &record)?;
    Ok(record)
}

/// Serializes user-stack updates per target file. Entries live only while
/// an update for that file is running or queued.
#[derive(Debug, Clone, Default)]
pub struct UserStackStore {
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl UserStackStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks.entry(path.to_path_buf()).or_default().clone()
    }

    /// Drops the lock entry once nobody but the map and the caller holds it.
    fn release(&self, path: &Path, lock: Arc<Mutex<()>>) {
        self.locks
            .remove_if(path, |_, held| Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2);
    }

    pub fn tracked_locks(&self) -> usize {
        self.locks.len()
    }

    /// Records a completed operation for the context's user. The lock is held
    /// across load, update and write.
    pub async fn record_completion(
        &self,
        ctx: &LogContext,
        process_name: &str,
        request_time: Value,
    ) -> Result<UserStackLogRecord> {
        let user_id = ctx
            .user_id
            .clone()
            .context("user stack update requires a user_id")?;
        let base = layout::normalize_dir(&ctx.base_dir);
        let path = layout::user_log_path(&base, &user_id);
        let entry = UserStackEntry {
            process_name: process_name.to_string(),
            uuid: ctx.uuid.clone(),
            request_time,
            status: STATUS_COMPLETED.to_string(),
            replaced_at: None,
        };

        let lock = self.lock_for(&path);
        let guard = lock.lock().await;

        let target = path.clone();
        let updated = tokio::task::spawn_blocking(move || {
            update_user_stack_file(&target, &user_id, entry)
        })
        .await;
        drop(guard);
        self.release(&path, lock);
        let record = updated.context("user stack update task panicked")??;

        debug!(
            user_id = %record.user_id,
            stack_len = record.stack.len(),
            history_len = record.history.len(),
            "user stack updated"
        );
        Ok(record)
    }
}
