// High-level client used by the CLI. It owns the session store and both
// coordinators, makes sure an operation runs with a valid session, and
// re-authenticates once when the service rejects the access token.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::api::{FileMetadata, HttpApi};
use crate::auth::{AuthCoordinator, AuthNotice};
use crate::config::Config;
use crate::error::{AuthError, ClientError, UploadError};
use crate::session::{Session, SessionStore};
use crate::upload::{ProgressSender, UploadCoordinator, UploadEvent};

/// Failure of a client operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Upload(#[from] UploadError),
}

pub struct CloudClient {
    store: Arc<SessionStore>,
    auth: Arc<AuthCoordinator>,
    uploader: UploadCoordinator,
    probe: Option<Arc<HttpApi>>,
    auth_timeout: Duration,
}

impl CloudClient {
    /// Wire the HTTP implementation into both coordinators.
    pub fn new(config: &Config, notices: mpsc::UnboundedSender<AuthNotice>) -> anyhow::Result<Self> {
        let api = Arc::new(HttpApi::new(config)?);
        let store = Arc::new(SessionStore::new(config.session_file.clone()));
        let auth = AuthCoordinator::new(api.clone(), store.clone()).with_notices(notices);
        let uploader = UploadCoordinator::new(api.clone()).with_concurrency(config.upload_concurrency);
        Ok(CloudClient {
            store,
            auth: Arc::new(auth),
            uploader,
            probe: Some(api),
            auth_timeout: config.auth_timeout,
        })
    }

    pub fn from_parts(
        store: Arc<SessionStore>,
        auth: Arc<AuthCoordinator>,
        uploader: UploadCoordinator,
        auth_timeout: Duration,
    ) -> Self {
        CloudClient {
            store,
            auth,
            uploader,
            probe: None,
            auth_timeout,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Explicit login: always runs a fresh handshake.
    pub async fn login(&self, cancel: &CancellationToken) -> Result<Arc<Session>, AuthError> {
        let deadline = Instant::now() + self.auth_timeout;
        self.auth.authenticate(deadline, cancel.clone()).await
    }

    /// Forget the current session.
    pub fn logout(&self) -> Result<(), AuthError> {
        Ok(self.store.invalidate()?)
    }

    /// Ask the service whether the stored session is still accepted.
    pub async fn check_session(&self) -> Result<bool, ClientError> {
        let Some(session) = self.store.load() else {
            return Ok(false);
        };
        match &self.probe {
            Some(probe) => self.store.validate_remote(&session, probe.as_ref()).await,
            None => Ok(self.store.validate(&session)),
        }
    }

    /// A valid session, re-authenticating at most once across concurrent callers.
    pub async fn ensure_session(&self, cancel: &CancellationToken) -> Result<Arc<Session>, AuthError> {
        let auth = self.auth.clone();
        let cancel = cancel.clone();
        let deadline = Instant::now() + self.auth_timeout;
        self.store
            .get_or_reauthenticate(move || async move { auth.authenticate(deadline, cancel).await })
            .await
    }

    /// Upload a file, re-authenticating once if the access token is rejected.
    pub async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<FileMetadata, OperationError> {
        let session = self.ensure_session(cancel).await?;
        let (result, failed) = self
            .upload_once(local_path, remote_path, &session, progress, cancel)
            .await;

        let result = match result {
            Err(e) if e.is_invalid_token() => {
                warn!("access token rejected, re-authenticating");
                self.store.invalidate_if(&session).map_err(AuthError::from)?;
                let session = self.ensure_session(cancel).await?;
                let (retried, failed) = self
                    .upload_once(local_path, remote_path, &session, progress, cancel)
                    .await;
                forward_failure(progress, failed);
                retried
            }
            other => {
                forward_failure(progress, failed);
                other
            }
        };
        Ok(result?)
    }

    /// One upload attempt. Progress is forwarded live, except the terminal
    /// `Failed` event, which is handed back so a retried attempt does not
    /// end the caller's stream early.
    async fn upload_once(
        &self,
        local_path: &Path,
        remote_path: &str,
        session: &Session,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> (Result<FileMetadata, UploadError>, Option<UploadEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = async move {
            let result = self
                .uploader
                .upload(local_path, remote_path, session, &tx, cancel)
                .await;
            drop(tx);
            result
        };
        let forward = async {
            let mut failed = None;
            while let Some(event) = rx.recv().await {
                match event {
                    UploadEvent::Failed { .. } => failed = Some(event),
                    other => {
                        let _ = progress.send(other);
                    }
                }
            }
            failed
        };
        tokio::join!(run, forward)
    }
}

fn forward_failure(progress: &ProgressSender, failed: Option<UploadEvent>) {
    if let Some(event) = failed {
        let _ = progress.send(event);
    }
}
