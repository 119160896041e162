//! Append-only, line-oriented side logs.
//!
//! Used for the per-endpoint deletion audit trail and the migration logs.
//! Every line is flushed and synced before `append` returns, so a crash right
//! after the call still leaves the line on disk.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions, create_dir_all};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// File name of the deletion audit log for a pool.
pub fn deletion_log_name(pool_id: i32) -> String {
    format!("deleted-{pool_id}.log")
}

/// File name of the log of keys fetched from a migration source.
pub fn migration_log_name(pool_id: i32) -> String {
    format!("migrated-{pool_id}.log")
}

/// File name of the migration failure log for a source pool.
pub fn migration_error_log_name(pool_id: i32) -> String {
    format!("migrated-error-{pool_id}.log")
}

#[derive(Debug)]
pub struct AppendLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AppendLog {
    /// Open (creating if needed) `dir/name` for appending.
    pub async fn open(dir: &Path, name: &str) -> io::Result<Self> {
        create_dir_all(dir).await?;
        let path = dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line. Concurrent callers are serialized.
    pub async fn append(&self, line: &str) -> io::Result<()> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await
    }
}
