// Session persistence and lifecycle.
//
// `SessionStore` owns the single active `Session` of the process. It keeps an
// in-memory copy for readers, persists it as a JSON record with owner-only
// permissions, and guarantees that concurrent callers observing an invalid
// session share one re-authentication run instead of starting their own.

use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AuthError, ClientError, SessionError};

/// Authenticated session. Replaced wholesale on re-authentication.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub cookie: String,
    pub user_token: String,
    pub library_id: String,
    pub space_id: String,
    pub access_token: String,
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Cheap remote check that the access token is still accepted.
#[async_trait]
pub trait SessionProbe: Send + Sync {
    async fn probe(&self, session: &Session) -> Result<(), ClientError>;
}

type ReauthResult = Result<Arc<Session>, AuthError>;
type SharedReauth = Shared<BoxFuture<'static, ReauthResult>>;

/// Owner of the process-wide session.
pub struct SessionStore {
    path: PathBuf,
    current: RwLock<Option<Arc<Session>>>,
    /// In-flight re-authentication, tagged with a generation so only the run
    /// that is still registered gets cleared.
    reauth: Mutex<Option<(u64, SharedReauth)>>,
    generation: Mutex<u64>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SessionStore {
            path: path.into(),
            current: RwLock::new(None),
            reauth: Mutex::new(None),
            generation: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// In-memory session, without touching the file.
    pub fn current(&self) -> Option<Arc<Session>> {
        self.current.read().ok().and_then(|guard| guard.clone())
    }

    /// Return the active session, reading the persisted record if nothing is
    /// held in memory yet. A missing or unreadable record means no session.
    pub fn load(&self) -> Option<Arc<Session>> {
        if let Some(session) = self.current() {
            return Some(session);
        }

        let session = match self.read_file() {
            Ok(Some(session)) => Arc::new(session),
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable session file");
                return None;
            }
        };
        self.replace(Some(session.clone()));
        Some(session)
    }

    /// Persist `session` (atomic replace, mode 0600) and make it active.
    pub fn save(&self, session: Session) -> Result<Arc<Session>, SessionError> {
        let json = serde_json::to_vec_pretty(&session).map_err(|e| SessionError::Json {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        write_atomic(&self.path, &json).map_err(|e| self.io_error(e))?;

        let session = Arc::new(session);
        self.replace(Some(session.clone()));
        info!(user = %session.username, expires_at = %session.expires_at, "session saved");
        Ok(session)
    }

    /// Local expiry check.
    pub fn validate(&self, session: &Session) -> bool {
        !session.is_expired_at(Utc::now())
    }

    /// Local expiry check followed by a remote probe. Only an invalid-token
    /// answer makes the session invalid; other probe failures are returned.
    pub async fn validate_remote<P>(&self, session: &Session, probe: &P) -> Result<bool, ClientError>
    where
        P: SessionProbe + ?Sized,
    {
        if !self.validate(session) {
            return Ok(false);
        }
        match probe.probe(session).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_invalid_token() => {
                debug!("remote probe rejected the access token");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Forget the session in memory and on disk.
    pub fn invalidate(&self) -> Result<(), SessionError> {
        self.replace(None);
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "session invalidated");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Forget the session only if `rejected` is still the active one.
    ///
    /// A caller whose request failed with a stale token must not discard a
    /// session another caller already renewed. Returns whether anything was
    /// invalidated.
    pub fn invalidate_if(&self, rejected: &Session) -> Result<bool, SessionError> {
        let _slot = lock(&self.reauth);
        match self.load() {
            Some(active) if active.access_token == rejected.access_token => {
                self.invalidate()?;
                Ok(true)
            }
            _ => {
                debug!("rejected session already replaced, keeping the current one");
                Ok(false)
            }
        }
    }

    /// Return a valid session, running `reauth` if there is none.
    ///
    /// Callers arriving while a run is in flight await that run instead of
    /// starting another one, and all of them receive the same `Arc<Session>`.
    /// `reauth` is expected to persist the session it produces via `save`.
    /// If every waiting caller goes away, the run is dropped and the next
    /// caller starts a fresh one.
    pub async fn get_or_reauthenticate<F, Fut>(&self, reauth: F) -> Result<Arc<Session>, AuthError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ReauthResult> + Send + 'static,
    {
        if let Some(session) = self.load().filter(|s| self.validate(s)) {
            return Ok(session);
        }

        let mut pending = {
            let mut slot = lock(&self.reauth);
            // A run may have finished between the check above and taking the lock.
            if let Some(session) = self.current().filter(|s| self.validate(s)) {
                return Ok(session);
            }
            match slot.as_ref() {
                Some((generation, shared)) => {
                    debug!(generation, "joining in-flight re-authentication");
                    PendingReauth {
                        store: self,
                        generation: *generation,
                        shared: shared.clone(),
                    }
                }
                None => {
                    let generation = self.next_generation();
                    debug!(generation, "starting re-authentication");
                    let shared = reauth().boxed().shared();
                    *slot = Some((generation, shared.clone()));
                    PendingReauth {
                        store: self,
                        generation,
                        shared,
                    }
                }
            }
        };

        (&mut pending.shared).await
    }

    fn next_generation(&self) -> u64 {
        let mut generation = lock(&self.generation);
        *generation += 1;
        *generation
    }

    fn replace(&self, session: Option<Arc<Session>>) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = session;
    }

    fn read_file(&self) -> Result<Option<Session>, SessionError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| SessionError::Json {
                path: self.path.display().to_string(),
                message: e.to_string(),
            })
    }

    fn io_error(&self, err: std::io::Error) -> SessionError {
        SessionError::Io {
            path: self.path.display().to_string(),
            message: err.to_string(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One caller's share of a re-authentication run. Dropping it, on completion
/// or because the caller was cancelled, unregisters the run once no other
/// caller is waiting on it.
struct PendingReauth<'a> {
    store: &'a SessionStore,
    generation: u64,
    shared: SharedReauth,
}

impl Drop for PendingReauth<'_> {
    fn drop(&mut self) {
        let mut slot = lock(&self.store.reauth);
        if !matches!(slot.as_ref(), Some((g, _)) if *g == self.generation) {
            return;
        }
        // `None` once this handle has observed the result. Otherwise the
        // count covers the registered copy, this handle and other waiters.
        let others_waiting = self.shared.strong_count().map_or(false, |n| n > 2);
        if !others_waiting {
            debug!(generation = self.generation, "re-authentication unregistered");
            *slot = None;
        }
    }
}

/// Write to a sibling temp file with owner-only permissions, sync it, then
/// rename it over `path` so readers never see a partial record.
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp)?;
    #[cfg(unix)]
    {
        // The mode above only applies when the temp file is newly created.
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)
}
