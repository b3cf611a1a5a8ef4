// ============================
// crates/backend-lib/src/storage.rs
// ============================
//! Message persistence with flat-file implementation.
use crate::error::AppError;
use async_trait::async_trait;
use dashmap::DashMap;
use okean_common::{ChatMessage, PrivateMessage, UserId};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs as tokio_fs, io::AsyncWriteExt};

/// Trait for message storage backends
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message sent to a group
    async fn append_group_message(&self, message: &ChatMessage) -> Result<(), AppError>;

    /// Persist a private message and count it as unread for the receiver
    async fn append_private_message(&self, message: &PrivateMessage) -> Result<(), AppError>;

    /// Unread private messages addressed to a user
    async fn unread_count(&self, user_id: &str) -> Result<u64, AppError>;

    /// Mark everything `from_user_id` sent to `reader_id` as read. Returns
    /// the reader's remaining unread count.
    async fn mark_read(&self, reader_id: &str, from_user_id: &str) -> Result<u64, AppError>;
}

/// Flat-file implementation of the `MessageStore` trait.
///
/// Messages are appended as JSON lines; unread counters live in memory.
#[derive(Clone)]
pub struct FlatFileStorage {
    root: PathBuf,
    unread: Arc<DashMap<(UserId, UserId), u64>>,
}

impl FlatFileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("groups"))?;
        fs::create_dir_all(root.join("private"))?;
        Ok(Self {
            root,
            unread: Default::default(),
        })
    }

    fn group_log(&self, group: &str) -> PathBuf {
        self.root
            .join("groups")
            .join(format!("{}.log", group.replace(':', "_")))
    }

    fn private_log(&self, a: &str, b: &str) -> PathBuf {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        self.root
            .join("private")
            .join(format!("{first}__{second}.log"))
    }
}

/// Append one JSON line to `path`
async fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<(), AppError> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');

    let mut file = tokio_fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(AppError::from)?;

    // Single write so concurrent appends never interleave within a line
    file.write_all(&line).await?;
    Ok(())
}

#[async_trait]
impl MessageStore for FlatFileStorage {
    async fn append_group_message(&self, message: &ChatMessage) -> Result<(), AppError> {
        append_line(&self.group_log(&message.group), message).await
    }

    async fn append_private_message(&self, message: &PrivateMessage) -> Result<(), AppError> {
        append_line(
            &self.private_log(&message.sender.id, &message.receiver_id),
            message,
        )
        .await?;
        if !message.is_read {
            *self
                .unread
                .entry((message.receiver_id.clone(), message.sender.id.clone()))
                .or_insert(0) += 1;
        }
        Ok(())
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64, AppError> {
        Ok(self
            .unread
            .iter()
            .filter(|entry| entry.key().0 == user_id)
            .map(|entry| *entry.value())
            .sum())
    }

    async fn mark_read(&self, reader_id: &str, from_user_id: &str) -> Result<u64, AppError> {
        self.unread
            .remove(&(reader_id.to_string(), from_user_id.to_string()));
        self.unread_count(reader_id).await
    }
}
