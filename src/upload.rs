// Multipart upload pipeline: validate → plan → initiate → signed part
// transfers (bounded parallelism) → confirm.
//
// Progress is reported as a finite event stream: one `PartCompleted` per part
// that succeeded, then exactly one `Finished` or `Failed`.

use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{FileMetadata, UploadApi, UploadSession};
use crate::chunk::{plan_chunks, Chunk, ChunkPlan};
use crate::config::MAX_UPLOAD_CONCURRENCY;
use crate::error::{ApiError, ClientError, UploadError, ValidationError};
use crate::retry::RetryPolicy;
use crate::session::Session;

/// Progress of one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    PartCompleted {
        part_number: u32,
        bytes_done: u64,
        total_bytes: u64,
    },
    Finished(FileMetadata),
    Failed {
        message: String,
        completed_parts: u32,
        total_parts: u32,
        bytes_sent: u64,
    },
}

pub type ProgressSender = mpsc::UnboundedSender<UploadEvent>;

enum PartOutcome {
    Done { part_number: u32 },
    Skipped,
    Failed { part_number: u32, cause: ClientError },
    Unreadable { message: String },
}

/// Uploads one local file per call.
pub struct UploadCoordinator {
    api: Arc<dyn UploadApi>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl UploadCoordinator {
    pub fn new(api: Arc<dyn UploadApi>) -> Self {
        UploadCoordinator {
            api,
            retry: RetryPolicy::default(),
            concurrency: MAX_UPLOAD_CONCURRENCY,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Parallel part transfers, clamped to `1..=4`.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, MAX_UPLOAD_CONCURRENCY);
        self
    }

    /// Upload `local_path` to `remote_path` in the session's personal space.
    ///
    /// Validation happens before any network call. Confirm is called exactly
    /// once, and only after every planned part succeeded and the upload was
    /// not cancelled. No rollback is attempted on failure; the server expires
    /// abandoned upload sessions on its own.
    pub async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        session: &Session,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<FileMetadata, UploadError> {
        let result = self
            .run(local_path, remote_path, session, progress, cancel)
            .await;
        match &result {
            Ok(meta) => {
                let _ = progress.send(UploadEvent::Finished(meta.clone()));
            }
            Err(e) => {
                let (completed_parts, total_parts, bytes_sent) = match e {
                    UploadError::PartFailed {
                        completed_parts,
                        total_parts,
                        bytes_sent,
                        ..
                    }
                    | UploadError::Cancelled {
                        completed_parts,
                        total_parts,
                        bytes_sent,
                    } => (*completed_parts, *total_parts, *bytes_sent),
                    _ => (0, 0, 0),
                };
                let _ = progress.send(UploadEvent::Failed {
                    message: e.to_string(),
                    completed_parts,
                    total_parts,
                    bytes_sent,
                });
            }
        }
        result
    }

    async fn run(
        &self,
        local_path: &Path,
        remote_path: &str,
        session: &Session,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<FileMetadata, UploadError> {
        validate_remote_path(remote_path)?;
        let size = local_file_size(local_path).await?;
        let plan = plan_chunks(size)?;
        let total_parts = plan.part_count();

        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled {
                completed_parts: 0,
                total_parts,
                bytes_sent: 0,
            });
        }

        let upload = self
            .retry
            .run("initiate_upload", || {
                self.api.initiate(session, remote_path, total_parts)
            })
            .await?;
        check_part_headers(&upload, total_parts)?;
        debug!(
            upload_id = %upload.upload_id,
            parts = total_parts,
            expires_at = ?upload.expires_at,
            "upload initiated"
        );

        let done = self
            .transfer_parts(local_path, &plan, &upload, progress, cancel)
            .await?;

        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled {
                completed_parts: done.completed_parts,
                total_parts,
                bytes_sent: done.bytes_sent,
            });
        }

        let meta = self
            .retry
            .run("confirm_upload", || self.api.confirm(session, &upload.confirm_key))
            .await?;
        info!(remote = remote_path, size, parts = total_parts, "upload confirmed");
        Ok(meta)
    }

    /// Transfer every planned part, at most `concurrency` at a time. Returns
    /// only after all in-flight transfers settled.
    async fn transfer_parts(
        &self,
        local_path: &Path,
        plan: &ChunkPlan,
        upload: &UploadSession,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<Transferred, UploadError> {
        let bytes_sent = AtomicU64::new(0);
        let aborted = AtomicBool::new(false);
        let total_bytes = plan.file_size;

        let outcomes: Vec<PartOutcome> = stream::iter(plan.chunks.iter().copied())
            .map(|chunk| {
                let bytes_sent = &bytes_sent;
                let aborted = &aborted;
                async move {
                    if aborted.load(Ordering::SeqCst) || cancel.is_cancelled() {
                        return PartOutcome::Skipped;
                    }
                    let body = match read_chunk(local_path, chunk).await {
                        Ok(body) => body,
                        Err(e) => {
                            aborted.store(true, Ordering::SeqCst);
                            return PartOutcome::Unreadable {
                                message: e.to_string(),
                            };
                        }
                    };
                    match self.transfer_part(upload, chunk.part_number, body).await {
                        Ok(()) => {
                            let done = bytes_sent.fetch_add(chunk.length, Ordering::SeqCst)
                                + chunk.length;
                            let _ = progress.send(UploadEvent::PartCompleted {
                                part_number: chunk.part_number,
                                bytes_done: done,
                                total_bytes,
                            });
                            PartOutcome::Done {
                                part_number: chunk.part_number,
                            }
                        }
                        Err(cause) => {
                            warn!(part = chunk.part_number, error = %cause, "part transfer failed");
                            aborted.store(true, Ordering::SeqCst);
                            PartOutcome::Failed {
                                part_number: chunk.part_number,
                                cause,
                            }
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut completed = BTreeSet::new();
        let mut failure: Option<(u32, ClientError)> = None;
        let mut unreadable: Option<String> = None;
        for outcome in outcomes {
            match outcome {
                PartOutcome::Done { part_number } => {
                    completed.insert(part_number);
                }
                PartOutcome::Failed { part_number, cause } => {
                    if failure.as_ref().map_or(true, |(p, _)| part_number < *p) {
                        failure = Some((part_number, cause));
                    }
                }
                PartOutcome::Unreadable { message } => {
                    unreadable.get_or_insert(message);
                }
                PartOutcome::Skipped => {}
            }
        }

        let transferred = Transferred {
            completed_parts: completed.len() as u32,
            bytes_sent: bytes_sent.load(Ordering::SeqCst),
        };

        if let Some(message) = unreadable {
            return Err(UploadError::Io {
                path: local_path.display().to_string(),
                message,
            });
        }
        if let Some((part_number, cause)) = failure {
            return Err(UploadError::PartFailed {
                part_number,
                cause,
                completed_parts: transferred.completed_parts,
                total_parts: plan.part_count(),
                last_completed_part: last_contiguous_part(&completed),
                bytes_sent: transferred.bytes_sent,
            });
        }
        if transferred.completed_parts != plan.part_count() {
            return Err(UploadError::Cancelled {
                completed_parts: transferred.completed_parts,
                total_parts: plan.part_count(),
                bytes_sent: transferred.bytes_sent,
            });
        }
        Ok(transferred)
    }

    async fn transfer_part(
        &self,
        upload: &UploadSession,
        part_number: u32,
        body: Bytes,
    ) -> Result<(), ClientError> {
        let headers = upload
            .parts
            .get(&part_number)
            .map(|p| &p.headers)
            .ok_or_else(|| {
                ClientError::Api(ApiError::protocol_mismatch(format!(
                    "no signed headers for part {}",
                    part_number
                )))
            })?;
        self.retry
            .run("upload_part", || {
                self.api.put_part(upload, part_number, headers, body.clone())
            })
            .await
    }
}

struct Transferred {
    completed_parts: u32,
    bytes_sent: u64,
}

/// Highest `k` such that parts `1..=k` all completed.
fn last_contiguous_part(completed: &BTreeSet<u32>) -> Option<u32> {
    let mut last = None;
    for (expected, part) in (1u32..).zip(completed.iter()) {
        if *part != expected {
            break;
        }
        last = Some(expected);
    }
    last
}

/// The server must sign exactly the parts `1..=N`.
fn check_part_headers(upload: &UploadSession, total_parts: u32) -> Result<(), UploadError> {
    let expected = 1..=total_parts;
    let exact = upload.parts.len() == total_parts as usize
        && upload.parts.keys().copied().eq(expected);
    if exact {
        return Ok(());
    }
    Err(UploadError::Client(ClientError::Api(ApiError::protocol_mismatch(
        format!(
            "initiate returned signed headers for {} parts, expected {}",
            upload.parts.len(),
            total_parts
        ),
    ))))
}

fn invalid_path(path: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Remote paths name a file: non-empty segments, no `.`/`..`, no trailing `/`.
pub fn validate_remote_path(remote_path: &str) -> Result<(), ValidationError> {
    let trimmed = remote_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(invalid_path(remote_path, "remote path is empty"));
    }
    if trimmed.ends_with('/') {
        return Err(invalid_path(remote_path, "remote path names a directory"));
    }
    for segment in trimmed.split('/') {
        match segment {
            "" => return Err(invalid_path(remote_path, "empty path segment")),
            "." | ".." => return Err(invalid_path(remote_path, "relative path segment")),
            _ => {}
        }
    }
    Ok(())
}

async fn local_file_size(local_path: &Path) -> Result<u64, UploadError> {
    let display = local_path.display().to_string();
    match tokio::fs::metadata(local_path).await {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(invalid_path(&display, "not a regular file").into()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(invalid_path(&display, "no such file").into())
        }
        Err(e) => Err(UploadError::Io {
            path: display,
            message: e.to_string(),
        }),
    }
}

/// Read exactly the planned byte range of one part.
async fn read_chunk(path: &Path, chunk: Chunk) -> std::io::Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(chunk.offset)).await?;
    let mut buf = vec![0u8; chunk.length as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
