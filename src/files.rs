//! File transfer between Slack and task directories.
//!
//! Inbound: attachments on task-starting messages land in the task
//! directory (collision-safe names); images on follow-ups to a live task
//! travel inline. Outbound: tool-result snippets, plus a poll-based watcher
//! that uploads files the agent drops into the task directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use slack_morphism::prelude::{SlackChannelId, SlackHistoryMessage, SlackTs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::runner::protocol::ImageAttachment;
use crate::slack::SlackService;
use crate::Result;

const WATCH_INTERVAL: Duration = Duration::from_secs(2);
/// Delay before re-checking a candidate file's size, to skip files still
/// being written.
const SETTLE_DELAY: Duration = Duration::from_millis(500);
/// Minimum gap between re-uploads of the same path.
const REUPLOAD_COOLDOWN: Duration = Duration::from_secs(10);

/// A file attached to a Slack message.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub mimetype: String,
    pub url: String,
}

/// Upload tracking for the output watcher.
struct UploadedFile {
    mod_time: SystemTime,
    last_upload: Instant,
}

/// Slack file intake and output-upload helper.
#[derive(Clone)]
pub struct FileHandler {
    slack: Arc<SlackService>,
}

impl FileHandler {
    /// Create a handler backed by the shared Slack service.
    #[must_use]
    pub fn new(slack: Arc<SlackService>) -> Self {
        Self { slack }
    }

    /// Fetch the files attached to a message.
    ///
    /// Mention events do not carry the files array, so the message is
    /// re-read: via history for thread roots, via the replies API for
    /// thread replies.
    pub async fn message_files(
        &self,
        channel_id: &str,
        thread_ts: &str,
        message_ts: &str,
    ) -> Vec<RemoteFile> {
        let channel = SlackChannelId(channel_id.to_owned());
        let ts = SlackTs(message_ts.to_owned());
        let fetched = if message_ts == thread_ts {
            self.slack.fetch_message(channel, &ts).await
        } else {
            self.slack
                .fetch_thread_reply(channel, &SlackTs(thread_ts.to_owned()), &ts)
                .await
        };

        match fetched {
            Ok(Some(message)) => extract_files(&message),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(%err, "failed to check for message files");
                Vec::new()
            }
        }
    }

    /// Download every attachment on a message into the task directory.
    ///
    /// Posts a short status line when files are present; per-file failures
    /// become warnings in the thread and are skipped.
    pub async fn download_message_files(
        &self,
        channel_id: &str,
        thread_ts: &str,
        message_ts: &str,
        task_path: &Path,
    ) -> Vec<PathBuf> {
        let files = self.message_files(channel_id, thread_ts, message_ts).await;
        if files.is_empty() {
            return Vec::new();
        }

        self.post(
            channel_id,
            thread_ts,
            &format!(":inbox_tray: Downloading {} file(s)...", files.len()),
        )
        .await;

        let mut downloaded = Vec::new();
        for file in &files {
            match self.download_to_task(file, task_path).await {
                Ok(local_path) => {
                    info!(file_id = %file.id, local_path = %local_path.display(), "file downloaded");
                    downloaded.push(local_path);
                }
                Err(err) => {
                    error!(%err, file_id = %file.id, "failed to download file");
                    self.post(
                        channel_id,
                        thread_ts,
                        &format!(":warning: Failed to download `{}`: {err}", file.name),
                    )
                    .await;
                }
            }
        }
        downloaded
    }

    /// Split a follow-up message's attachments for a live task: images are
    /// downloaded to memory for inline delivery, everything else lands in
    /// the task directory.
    pub async fn collect_attachments(
        &self,
        channel_id: &str,
        thread_ts: &str,
        message_ts: &str,
        task_path: &Path,
    ) -> (Vec<ImageAttachment>, Vec<PathBuf>) {
        let files = self.message_files(channel_id, thread_ts, message_ts).await;
        let mut images = Vec::new();
        let mut paths = Vec::new();

        for file in &files {
            if file.mimetype.starts_with("image/") {
                match self.slack.download_url(&file.url).await {
                    Ok(data) => images.push(ImageAttachment {
                        media_type: file.mimetype.clone(),
                        data,
                    }),
                    Err(err) => error!(%err, file_id = %file.id, "failed to download image"),
                }
            } else {
                match self.download_to_task(file, task_path).await {
                    Ok(local_path) => paths.push(local_path),
                    Err(err) => error!(%err, file_id = %file.id, "failed to download file"),
                }
            }
        }
        (images, paths)
    }

    /// Download one file into the task directory.
    ///
    /// Name collisions get an auto-incrementing `-N` suffix before the
    /// extension (`image.png`, `image-1.png`, ...).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` on download failure, `AppError::Io` on
    /// write failure.
    pub async fn download_to_task(&self, file: &RemoteFile, task_path: &Path) -> Result<PathBuf> {
        let filename = if file.name.is_empty() {
            file.id.clone()
        } else {
            file.name.clone()
        };
        let local_path = unique_path(task_path, &filename);

        debug!(file_id = %file.id, local_path = %local_path.display(), "downloading file to disk");
        let data = self.slack.download_url(&file.url).await?;
        fs::write(&local_path, &data)
            .map_err(|err| crate::AppError::Io(format!("write downloaded file: {err}")))?;
        Ok(local_path)
    }

    /// Upload text content as a collapsible snippet with a summary comment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` if the upload fails.
    pub async fn upload_snippet(
        &self,
        channel_id: &str,
        thread_ts: &str,
        content: &str,
        title: &str,
        comment: &str,
    ) -> Result<()> {
        self.slack
            .upload_file(
                SlackChannelId(channel_id.to_owned()),
                Some(SlackTs(thread_ts.to_owned())),
                &format!("{title}.txt"),
                title,
                comment,
                content.as_bytes().to_vec(),
            )
            .await
    }

    /// Upload a file from the task directory into the thread.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be read, `AppError::Slack`
    /// if the upload fails.
    pub async fn upload_from_task(
        &self,
        local_path: &Path,
        channel_id: &str,
        thread_ts: &str,
        comment: &str,
    ) -> Result<()> {
        let content = fs::read(local_path)
            .map_err(|err| crate::AppError::Io(format!("read output file: {err}")))?;
        let filename = local_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("output");
        self.slack
            .upload_file(
                SlackChannelId(channel_id.to_owned()),
                Some(SlackTs(thread_ts.to_owned())),
                filename,
                filename,
                comment,
                content,
            )
            .await
    }

    /// Watch the task directory and upload files the agent produces.
    ///
    /// Polls every two seconds; files present at start are seeded as
    /// already uploaded. Runs a final sweep when cancelled so late writes
    /// still make it into the thread.
    pub async fn watch_outputs(
        &self,
        task_path: &Path,
        channel_id: &str,
        thread_ts: &str,
        cancel: CancellationToken,
    ) {
        let mut uploaded: HashMap<String, UploadedFile> = HashMap::new();
        if let Ok(entries) = fs::read_dir(task_path) {
            for entry in entries.flatten() {
                if let Ok(metadata) = entry.metadata() {
                    if let Ok(mod_time) = metadata.modified() {
                        uploaded.insert(
                            entry.file_name().to_string_lossy().into_owned(),
                            UploadedFile {
                                mod_time,
                                last_upload: Instant::now(),
                            },
                        );
                    }
                }
            }
        }

        debug!(
            task_path = %task_path.display(),
            existing_files = uploaded.len(),
            "starting output file watcher"
        );

        let mut ticker = tokio::time::interval(WATCH_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("output file watcher stopping");
                    self.sweep(task_path, channel_id, thread_ts, &mut uploaded).await;
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep(task_path, channel_id, thread_ts, &mut uploaded).await;
                }
            }
        }
    }

    /// Upload any new or re-modified top-level files.
    async fn sweep(
        &self,
        task_path: &Path,
        channel_id: &str,
        thread_ts: &str,
        uploaded: &mut HashMap<String, UploadedFile>,
    ) {
        let Ok(entries) = fs::read_dir(task_path) else {
            return;
        };

        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let local_path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let Ok(mod_time) = metadata.modified() else {
                continue;
            };

            let should_upload = match uploaded.get(&name) {
                None => true,
                Some(tracked) => {
                    mod_time > tracked.mod_time
                        && tracked.last_upload.elapsed() >= REUPLOAD_COOLDOWN
                }
            };
            if !should_upload {
                continue;
            }

            // Give in-progress writes a moment, then require a stable size.
            let size_before = metadata.len();
            tokio::time::sleep(SETTLE_DELAY).await;
            let Ok(metadata_after) = fs::metadata(&local_path) else {
                continue;
            };
            if metadata_after.len() != size_before {
                continue;
            }

            match self
                .upload_from_task(
                    &local_path,
                    channel_id,
                    thread_ts,
                    &format!(":outbox_tray: Output: `{name}`"),
                )
                .await
            {
                Ok(()) => {
                    let mod_time = metadata_after.modified().unwrap_or(mod_time);
                    uploaded.insert(
                        name,
                        UploadedFile {
                            mod_time,
                            last_upload: Instant::now(),
                        },
                    );
                }
                Err(err) => {
                    error!(%err, file = %name, "failed to upload output file");
                }
            }
        }
    }

    async fn post(&self, channel_id: &str, thread_ts: &str, text: &str) {
        if let Err(err) = self
            .slack
            .post_message(
                SlackChannelId(channel_id.to_owned()),
                text,
                Some(SlackTs(thread_ts.to_owned())),
            )
            .await
        {
            error!(%err, "failed to post file status message");
        }
    }
}

/// Extract attachment metadata from a fetched message.
fn extract_files(message: &SlackHistoryMessage) -> Vec<RemoteFile> {
    let Some(files) = message.content.files.as_ref() else {
        return Vec::new();
    };
    files
        .iter()
        .filter_map(|file| {
            let url = file
                .url_private_download
                .as_ref()
                .or(file.url_private.as_ref())?
                .to_string();
            Some(RemoteFile {
                id: file.id.to_string(),
                name: file
                    .name
                    .clone()
                    .unwrap_or_else(|| file.id.to_string()),
                mimetype: file
                    .mimetype
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                url,
            })
        })
        .collect()
}

/// Next free path for `filename` in `dir`, inserting `-N` before the
/// extension on collision.
fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let (base, ext) = match filename.rfind('.') {
        Some(idx) if idx > 0 => (&filename[..idx], &filename[idx..]),
        _ => (filename, ""),
    };
    for i in 1.. {
        let candidate = dir.join(format!("{base}-{i}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("unbounded suffix search")
}
