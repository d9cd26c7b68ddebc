// QR-code authentication.
//
// `AuthMachine` is the pure state machine; it owns the currently bound
// challenge and decides what to do with each input. `AuthCoordinator` drives
// it: the event-stream reader and the refresh ticker are two tasks feeding one
// ordered queue, and the coordinator applies inputs one at a time, so a
// refresh and a late "confirmed" event can never interleave mid-transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{AuthApi, QrChallenge, QrEvent, QrEventStream};
use crate::error::{ApiError, AuthError, ClientError};
use crate::retry::RetryPolicy;
use crate::session::{Session, SessionStore};

/// Cadence at which a fresh QR challenge replaces the current one.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    QrIssued,
    WaitingForEvent,
    Scanned,
    Confirmed,
    TokenExchanged,
    SpaceResolved,
    Active,
    Failed,
}

impl AuthState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AuthState::Active | AuthState::Failed)
    }
}

/// One entry of the merged input queue.
#[derive(Debug)]
pub enum AuthInput {
    /// Frame from the stream bound to `challenge_id`.
    Event {
        challenge_id: String,
        event: Result<QrEvent, ClientError>,
    },
    /// The stream bound to `challenge_id` ended.
    StreamClosed { challenge_id: String },
    /// Refresh timer fired.
    Tick,
}

/// What the driver has to do after an input was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    None,
    Scanned,
    /// Discard the current challenge and issue a new one.
    RequestChallenge,
    /// Exchange the authorization code for a user token.
    Exchange { code: String },
}

/// Handshake state plus the single challenge currently bound.
#[derive(Debug)]
pub struct AuthMachine {
    state: AuthState,
    bound: Option<QrChallenge>,
    refreshing: bool,
    refreshes: u32,
}

impl Default for AuthMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthMachine {
    pub fn new() -> Self {
        AuthMachine {
            state: AuthState::Idle,
            bound: None,
            refreshing: false,
            refreshes: 0,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn bound_challenge(&self) -> Option<&QrChallenge> {
        self.bound.as_ref()
    }

    /// Number of refreshes started so far.
    pub fn refreshes(&self) -> u32 {
        self.refreshes
    }

    pub fn start(&mut self) -> Command {
        if self.state != AuthState::Idle {
            return Command::None;
        }
        self.transition(AuthState::QrIssued);
        Command::RequestChallenge
    }

    /// Bind a freshly issued challenge and start waiting for its events.
    pub fn challenge_issued(&mut self, challenge: QrChallenge) -> Result<(), AuthError> {
        if !challenge.is_well_formed() {
            self.fail();
            return Err(AuthError::InvalidSignature {
                uuid: challenge.uuid,
            });
        }
        self.bound = Some(challenge);
        self.refreshing = false;
        self.transition(AuthState::WaitingForEvent);
        Ok(())
    }

    pub fn handle(&mut self, input: AuthInput) -> Command {
        if !matches!(
            self.state,
            AuthState::QrIssued | AuthState::WaitingForEvent | AuthState::Scanned
        ) {
            return Command::None;
        }

        match input {
            AuthInput::Tick => match self.state {
                AuthState::WaitingForEvent if !self.refreshing => {
                    debug!("refresh timer fired");
                    self.begin_refresh()
                }
                // A scanned code is kept until its own lifetime runs out.
                AuthState::Scanned if self.bound_lapsed(Instant::now()) => {
                    debug!("scanned challenge lapsed without confirmation");
                    self.begin_refresh()
                }
                _ => Command::None,
            },
            AuthInput::Event { challenge_id, event } => {
                if !self.is_bound(&challenge_id) {
                    debug!(challenge = %challenge_id, "ignoring event for superseded challenge");
                    return Command::None;
                }
                match event {
                    Ok(QrEvent::Scanned) => {
                        if self.state == AuthState::WaitingForEvent {
                            self.transition(AuthState::Scanned);
                            Command::Scanned
                        } else {
                            Command::None
                        }
                    }
                    Ok(QrEvent::Confirmed { code }) => {
                        self.transition(AuthState::Confirmed);
                        Command::Exchange { code }
                    }
                    Ok(QrEvent::Expired) => self.refresh_unless_in_flight(),
                    Err(e) => {
                        warn!(challenge = %challenge_id, error = %e, "event stream error");
                        self.refresh_unless_in_flight()
                    }
                }
            }
            AuthInput::StreamClosed { challenge_id } => {
                if !self.is_bound(&challenge_id) {
                    return Command::None;
                }
                debug!(challenge = %challenge_id, "event stream closed");
                self.refresh_unless_in_flight()
            }
        }
    }

    pub fn token_exchanged(&mut self) {
        self.transition(AuthState::TokenExchanged);
    }

    pub fn space_resolved(&mut self) {
        self.transition(AuthState::SpaceResolved);
    }

    pub fn activate(&mut self) {
        self.bound = None;
        self.transition(AuthState::Active);
    }

    pub fn fail(&mut self) {
        self.bound = None;
        self.transition(AuthState::Failed);
    }

    fn is_bound(&self, challenge_id: &str) -> bool {
        self.bound.as_ref().map(|c| c.uuid.as_str()) == Some(challenge_id)
    }

    fn bound_lapsed(&self, now: Instant) -> bool {
        self.bound.as_ref().map_or(false, |c| now >= c.expires_at)
    }

    fn refresh_unless_in_flight(&mut self) -> Command {
        if self.refreshing {
            return Command::None;
        }
        self.begin_refresh()
    }

    fn begin_refresh(&mut self) -> Command {
        if let Some(old) = self.bound.take() {
            debug!(challenge = %old.uuid, age = ?old.issued_at.elapsed(), "discarding challenge");
        }
        self.refreshing = true;
        self.refreshes += 1;
        self.transition(AuthState::QrIssued);
        Command::RequestChallenge
    }

    fn transition(&mut self, to: AuthState) {
        if self.state != to {
            debug!(from = ?self.state, to = ?to, "auth state");
            self.state = to;
        }
    }
}

/// User-facing progress of the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthNotice {
    /// A (new) QR code should be displayed.
    QrReady { uuid: String, url: String },
    Scanned,
    Confirmed,
}

/// Reader and ticker tasks; aborted when the handshake ends or is dropped.
#[derive(Default)]
struct Activities {
    reader: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl Activities {
    fn stop_reader(&mut self) {
        if let Some(task) = self.reader.take() {
            task.abort();
        }
    }

    fn stop_all(&mut self) {
        self.stop_reader();
        if let Some(task) = self.ticker.take() {
            task.abort();
        }
    }
}

impl Drop for Activities {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Drives QR issuance, event monitoring, refresh and the token exchange.
pub struct AuthCoordinator {
    api: Arc<dyn AuthApi>,
    store: Arc<SessionStore>,
    retry: RetryPolicy,
    refresh_interval: Duration,
    notices: Option<mpsc::UnboundedSender<AuthNotice>>,
}

impl AuthCoordinator {
    pub fn new(api: Arc<dyn AuthApi>, store: Arc<SessionStore>) -> Self {
        AuthCoordinator {
            api,
            store,
            retry: RetryPolicy::default(),
            refresh_interval: REFRESH_INTERVAL,
            notices: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_notices(mut self, notices: mpsc::UnboundedSender<AuthNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Run the handshake until a session is persisted, the deadline passes,
    /// or `cancel` fires. Deadline and cancellation both tear down the event
    /// stream and the timer and yield `AuthError::Timeout`.
    pub async fn authenticate(
        &self,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Result<Arc<Session>, AuthError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("authentication cancelled");
                Err(AuthError::Timeout)
            }
            _ = sleep_until(deadline) => {
                warn!("authentication deadline exceeded");
                Err(AuthError::Timeout)
            }
            result = self.run() => result,
        }
    }

    async fn run(&self) -> Result<Arc<Session>, AuthError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuthInput>();
        let mut machine = AuthMachine::new();
        let mut activities = Activities::default();

        machine.start();
        let challenge = match self.issue_challenge().await {
            Ok(challenge) => challenge,
            Err(e) => {
                machine.fail();
                return Err(e.into());
            }
        };
        if let Err(e) = self.bind(&mut machine, challenge, &tx, &mut activities).await {
            machine.fail();
            return Err(e);
        }

        while let Some(input) = rx.recv().await {
            match machine.handle(input) {
                Command::None => {}
                Command::Scanned => {
                    info!("QR code scanned, waiting for confirmation");
                    self.notify(AuthNotice::Scanned);
                }
                Command::RequestChallenge => {
                    activities.stop_reader();
                    let challenge = match self.issue_challenge().await {
                        Ok(challenge) => challenge,
                        Err(cause) => {
                            machine.fail();
                            return Err(AuthError::ChallengeExpiredNoRefresh { cause });
                        }
                    };
                    info!(refresh = machine.refreshes(), "QR code refreshed");
                    let bound = self.bind(&mut machine, challenge, &tx, &mut activities).await;
                    if let Err(e) = bound {
                        machine.fail();
                        return Err(match e {
                            AuthError::Client(cause) => AuthError::ChallengeExpiredNoRefresh { cause },
                            other => other,
                        });
                    }
                }
                Command::Exchange { code } => {
                    activities.stop_all();
                    self.notify(AuthNotice::Confirmed);
                    let result = self.complete(&mut machine, &code).await;
                    if result.is_err() {
                        machine.fail();
                    }
                    return result;
                }
            }
        }

        machine.fail();
        Err(AuthError::Client(ClientError::Network(
            "authentication event queue closed".into(),
        )))
    }

    async fn issue_challenge(&self) -> Result<QrChallenge, ClientError> {
        self.retry
            .run("issue_qr_challenge", || self.api.issue_challenge())
            .await
    }

    /// Bind `challenge`, open its event stream and restart the refresh timer.
    async fn bind(
        &self,
        machine: &mut AuthMachine,
        challenge: QrChallenge,
        tx: &mpsc::UnboundedSender<AuthInput>,
        activities: &mut Activities,
    ) -> Result<(), AuthError> {
        machine.challenge_issued(challenge.clone())?;

        let stream = self
            .retry
            .run("subscribe_qr_events", || self.api.subscribe(&challenge))
            .await?;
        activities.reader = Some(spawn_reader(challenge.uuid.clone(), stream, tx.clone()));

        if let Some(ticker) = activities.ticker.take() {
            ticker.abort();
        }
        activities.ticker = Some(spawn_ticker(self.refresh_interval, tx.clone()));

        self.notify(AuthNotice::QrReady {
            uuid: challenge.uuid.clone(),
            url: self.api.qr_url(&challenge),
        });
        Ok(())
    }

    /// Code → user token → personal space → persisted session.
    async fn complete(&self, machine: &mut AuthMachine, code: &str) -> Result<Arc<Session>, AuthError> {
        // Authorization codes are single-use, so the exchange is not retried.
        let grant = self.api.exchange_code(code).await?;
        machine.token_exchanged();

        let space = self
            .retry
            .run("personal_space", || self.api.personal_space(&grant.user_token))
            .await?;
        machine.space_resolved();

        let session = Session {
            cookie: self.api.auth_cookie().unwrap_or_default(),
            user_token: grant.user_token,
            library_id: space.library_id,
            space_id: space.space_id,
            access_token: space.access_token,
            username: grant.username,
            expires_at: session_expiry(Utc::now(), space.expires_in)?,
        };
        let saved = self.store.save(session)?;
        machine.activate();
        info!(user = %saved.username, "authenticated");
        Ok(saved)
    }

    fn notify(&self, notice: AuthNotice) {
        if let Some(tx) = &self.notices {
            let _ = tx.send(notice);
        }
    }
}

/// Absolute expiry for a token valid for `expires_in` seconds from `now`.
fn session_expiry(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>, ClientError> {
    chrono::Duration::try_seconds(expires_in)
        .filter(|lifetime| *lifetime > chrono::Duration::zero())
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| {
            ClientError::Api(ApiError::protocol_mismatch(format!(
                "unusable access token lifetime {}s",
                expires_in
            )))
        })
}

fn spawn_reader(
    challenge_id: String,
    mut stream: QrEventStream,
    tx: mpsc::UnboundedSender<AuthInput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            let input = AuthInput::Event {
                challenge_id: challenge_id.clone(),
                event,
            };
            if tx.send(input).is_err() {
                return;
            }
        }
        let _ = tx.send(AuthInput::StreamClosed { challenge_id });
    })
}

fn spawn_ticker(period: Duration, tx: mpsc::UnboundedSender<AuthInput>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.send(AuthInput::Tick).is_err() {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{SpaceInfo, TokenGrant};
    use async_trait::async_trait;
    use futures::channel::mpsc as fmpsc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    type EventTx = fmpsc::UnboundedSender<Result<QrEvent, ClientError>>;

    /// Fake server: issues numbered challenges and lets the test push events
    /// into the stream of any challenge.
    #[derive(Default)]
    struct FakeAuthApi {
        issued: AtomicU32,
        streams: Mutex<HashMap<String, EventTx>>,
        exchanged: Mutex<Vec<String>>,
        blank_signature: bool,
        fail_issue_after: Option<u32>,
        expires_in: Option<i64>,
    }

    impl FakeAuthApi {
        fn issued(&self) -> u32 {
            self.issued.load(Ordering::SeqCst)
        }

        fn push(&self, uuid: &str, event: QrEvent) {
            let streams = self.streams.lock().unwrap();
            let _ = streams[uuid].unbounded_send(Ok(event));
        }

        fn exchanged(&self) -> Vec<String> {
            self.exchanged.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AuthApi for FakeAuthApi {
        async fn issue_challenge(&self) -> Result<QrChallenge, ClientError> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_issue_after.map_or(false, |limit| n > limit) {
                return Err(ClientError::Api(crate::error::ApiError::from_status(
                    403, "Forbidden", "no more codes",
                )));
            }
            let sig = if self.blank_signature { "" } else { "sig" };
            Ok(QrChallenge::new(format!("qr-{}", n), sig, n as i64))
        }

        async fn subscribe(&self, challenge: &QrChallenge) -> Result<QrEventStream, ClientError> {
            let (tx, rx) = fmpsc::unbounded();
            self.streams.lock().unwrap().insert(challenge.uuid.clone(), tx);
            Ok(rx.boxed())
        }

        async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ClientError> {
            self.exchanged.lock().unwrap().push(code.to_string());
            Ok(TokenGrant {
                user_token: format!("user-{}", code),
                username: "student".into(),
            })
        }

        async fn personal_space(&self, user_token: &str) -> Result<SpaceInfo, ClientError> {
            Ok(SpaceInfo {
                library_id: "lib".into(),
                space_id: "space".into(),
                access_token: format!("access-{}", user_token),
                expires_in: self.expires_in.unwrap_or(1800),
            })
        }

        fn qr_url(&self, challenge: &QrChallenge) -> String {
            format!("https://qr.test/{}", challenge.uuid)
        }

        fn auth_cookie(&self) -> Option<String> {
            Some("JSESSIONID=fake".into())
        }
    }

    fn store() -> (tempfile::TempDir, Arc<SessionStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path().join("session.json")));
        (dir, store)
    }

    /// Let spawned tasks run until `cond` holds.
    async fn wait_until(cond: impl Fn() -> bool) {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn bound(id: &str) -> QrChallenge {
        QrChallenge::new(id, "sig", 0)
    }

    #[test]
    fn machine_walks_the_happy_path() {
        let mut m = AuthMachine::new();
        assert_eq!(m.start(), Command::RequestChallenge);
        assert_eq!(m.state(), AuthState::QrIssued);
        m.challenge_issued(bound("a")).unwrap();
        assert_eq!(m.state(), AuthState::WaitingForEvent);

        let scanned = AuthInput::Event {
            challenge_id: "a".into(),
            event: Ok(QrEvent::Scanned),
        };
        assert_eq!(m.handle(scanned), Command::Scanned);
        let confirmed = AuthInput::Event {
            challenge_id: "a".into(),
            event: Ok(QrEvent::Confirmed { code: "c".into() }),
        };
        assert_eq!(m.handle(confirmed), Command::Exchange { code: "c".into() });
        m.token_exchanged();
        m.space_resolved();
        m.activate();
        assert_eq!(m.state(), AuthState::Active);
        assert!(m.handle(AuthInput::Tick) == Command::None);
    }

    #[test]
    fn stale_confirmation_after_refresh_is_ignored() {
        let mut m = AuthMachine::new();
        m.start();
        m.challenge_issued(bound("old")).unwrap();

        // Expired triggers an immediate refresh.
        let expired = AuthInput::Event {
            challenge_id: "old".into(),
            event: Ok(QrEvent::Expired),
        };
        assert_eq!(m.handle(expired), Command::RequestChallenge);

        // While the refresh is in flight nothing is bound.
        let late = AuthInput::Event {
            challenge_id: "old".into(),
            event: Ok(QrEvent::Confirmed { code: "late".into() }),
        };
        assert_eq!(m.handle(late), Command::None);
        assert_eq!(m.handle(AuthInput::Tick), Command::None);

        m.challenge_issued(bound("new")).unwrap();
        let late_again = AuthInput::Event {
            challenge_id: "old".into(),
            event: Ok(QrEvent::Confirmed { code: "late".into() }),
        };
        assert_eq!(m.handle(late_again), Command::None);
        assert_eq!(m.state(), AuthState::WaitingForEvent);
        assert_eq!(m.bound_challenge().map(|c| c.uuid.as_str()), Some("new"));
        assert_eq!(m.refreshes(), 1);
    }

    #[test]
    fn tick_refreshes_only_while_waiting() {
        let mut m = AuthMachine::new();
        m.start();
        m.challenge_issued(bound("a")).unwrap();
        m.handle(AuthInput::Event {
            challenge_id: "a".into(),
            event: Ok(QrEvent::Scanned),
        });
        assert_eq!(m.handle(AuthInput::Tick), Command::None);

        let mut m = AuthMachine::new();
        m.start();
        m.challenge_issued(bound("b")).unwrap();
        assert_eq!(m.handle(AuthInput::Tick), Command::RequestChallenge);
    }

    #[tokio::test(start_paused = true)]
    async fn scanned_challenge_is_replaced_once_it_lapses() {
        let mut m = AuthMachine::new();
        m.start();
        m.challenge_issued(bound("a")).unwrap();
        m.handle(AuthInput::Event {
            challenge_id: "a".into(),
            event: Ok(QrEvent::Scanned),
        });

        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(m.handle(AuthInput::Tick), Command::None);
        assert_eq!(m.state(), AuthState::Scanned);

        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(m.handle(AuthInput::Tick), Command::RequestChallenge);
        assert!(m.bound_challenge().is_none());
    }

    #[test]
    fn token_lifetime_must_be_positive_and_representable() {
        let now = Utc::now();
        assert_eq!(
            session_expiry(now, 1800),
            Ok(now + chrono::Duration::seconds(1800))
        );
        for bad in [0, -5, i64::MAX, i64::MIN] {
            match session_expiry(now, bad) {
                Err(ClientError::Api(e)) => assert!(e.is_protocol_mismatch(), "{}", bad),
                other => panic!("lifetime {} gave {:?}", bad, other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn absurd_token_lifetime_fails_without_saving() {
        let (_dir, store) = store();
        let api = Arc::new(FakeAuthApi {
            expires_in: Some(i64::MAX),
            ..Default::default()
        });
        let coordinator = Arc::new(AuthCoordinator::new(api.clone(), store.clone()));

        let run = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_secs(30);
                coordinator.authenticate(deadline, CancellationToken::new()).await
            })
        };
        wait_until(|| api.streams.lock().unwrap().contains_key("qr-1")).await;
        api.push("qr-1", QrEvent::Confirmed { code: "code-1".into() });

        match run.await.unwrap() {
            Err(AuthError::Client(ClientError::Api(e))) => assert!(e.is_protocol_mismatch()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(store.current().is_none());
    }

    #[test]
    fn closed_stream_of_bound_challenge_triggers_refresh() {
        let mut m = AuthMachine::new();
        m.start();
        m.challenge_issued(bound("a")).unwrap();
        let closed_other = AuthInput::StreamClosed {
            challenge_id: "zzz".into(),
        };
        assert_eq!(m.handle(closed_other), Command::None);
        let closed = AuthInput::StreamClosed {
            challenge_id: "a".into(),
        };
        assert_eq!(m.handle(closed), Command::RequestChallenge);
    }

    #[test]
    fn blank_signature_fails_the_machine() {
        let mut m = AuthMachine::new();
        m.start();
        let err = m.challenge_issued(QrChallenge::new("u", " ", 0)).unwrap_err();
        assert_eq!(err, AuthError::InvalidSignature { uuid: "u".into() });
        assert_eq!(m.state(), AuthState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_event_produces_a_persisted_session() {
        let (_dir, store) = store();
        let api = Arc::new(FakeAuthApi::default());
        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(
            AuthCoordinator::new(api.clone(), store.clone()).with_notices(notice_tx),
        );

        let run = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_secs(30);
                coordinator.authenticate(deadline, CancellationToken::new()).await
            })
        };

        wait_until(|| api.streams.lock().unwrap().contains_key("qr-1")).await;
        api.push("qr-1", QrEvent::Scanned);
        api.push("qr-1", QrEvent::Confirmed { code: "code-1".into() });

        let session = run.await.unwrap().unwrap();
        assert_eq!(session.user_token, "user-code-1");
        assert_eq!(session.access_token, "access-user-code-1");
        assert_eq!(session.cookie, "JSESSIONID=fake");
        assert_eq!(api.exchanged(), vec!["code-1".to_string()]);
        assert_eq!(api.issued(), 1);
        assert_eq!(store.load().as_deref(), Some(&*session));

        assert_eq!(
            notice_rx.recv().await,
            Some(AuthNotice::QrReady {
                uuid: "qr-1".into(),
                url: "https://qr.test/qr-1".into()
            })
        );
        assert_eq!(notice_rx.recv().await, Some(AuthNotice::Scanned));
        assert_eq!(notice_rx.recv().await, Some(AuthNotice::Confirmed));
    }

    #[tokio::test(start_paused = true)]
    async fn challenge_is_refreshed_every_fifty_seconds_until_deadline() {
        let (_dir, store) = store();
        let api = Arc::new(FakeAuthApi::default());
        let coordinator = AuthCoordinator::new(api.clone(), store.clone());

        let deadline = Instant::now() + Duration::from_secs(180);
        let result = coordinator
            .authenticate(deadline, CancellationToken::new())
            .await;

        assert_eq!(result, Err(AuthError::Timeout));
        // Issued at 0s, 50s, 100s and 150s.
        assert_eq!(api.issued(), 4);
        assert!(store.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_then_late_confirmation_for_old_code_is_ignored() {
        let (_dir, store) = store();
        let api = Arc::new(FakeAuthApi::default());
        let coordinator = Arc::new(AuthCoordinator::new(api.clone(), store.clone()));

        let run = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_secs(40);
                coordinator.authenticate(deadline, CancellationToken::new()).await
            })
        };

        wait_until(|| api.streams.lock().unwrap().contains_key("qr-1")).await;
        api.push("qr-1", QrEvent::Expired);
        wait_until(|| api.streams.lock().unwrap().contains_key("qr-2")).await;

        api.push("qr-1", QrEvent::Confirmed { code: "stale".into() });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(api.exchanged().is_empty());

        api.push("qr-2", QrEvent::Confirmed { code: "fresh".into() });
        let session = run.await.unwrap().unwrap();
        assert_eq!(session.user_token, "user-fresh");
        assert_eq!(api.exchanged(), vec!["fresh".to_string()]);
        assert_eq!(api.issued(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_yields_timeout_without_a_session() {
        let (_dir, store) = store();
        let api = Arc::new(FakeAuthApi::default());
        let coordinator = AuthCoordinator::new(api.clone(), store.clone());
        let cancel = CancellationToken::new();

        let trigger = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                cancel.cancel();
            }
        };
        let deadline = Instant::now() + Duration::from_secs(600);
        let (result, _) = tokio::join!(coordinator.authenticate(deadline, cancel), trigger);

        assert_eq!(result, Err(AuthError::Timeout));
        assert!(store.current().is_none());
        assert_eq!(api.issued(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_signature_is_reported() {
        let (_dir, store) = store();
        let api = Arc::new(FakeAuthApi {
            blank_signature: true,
            ..Default::default()
        });
        let coordinator = AuthCoordinator::new(api, store);
        let result = coordinator
            .authenticate(Instant::now() + Duration::from_secs(10), CancellationToken::new())
            .await;
        assert_eq!(result, Err(AuthError::InvalidSignature { uuid: "qr-1".into() }));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_is_terminal() {
        let (_dir, store) = store();
        let api = Arc::new(FakeAuthApi {
            fail_issue_after: Some(1),
            ..Default::default()
        });
        let coordinator = AuthCoordinator::new(api.clone(), store);
        let result = coordinator
            .authenticate(Instant::now() + Duration::from_secs(120), CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(AuthError::ChallengeExpiredNoRefresh { .. })
        ));
        assert_eq!(api.issued(), 2);
    }
}
