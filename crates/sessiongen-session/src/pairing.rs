//! Pairing session lifecycle
//!
//! Every accepted request runs as its own task:
//! 1. A fresh credential namespace is allocated under a new session id
//! 2. A protocol connection is opened bound to that namespace
//! 3. A pairing code is requested (numeric mode) or the first QR is awaited
//! 4. The challenge is handed back to the caller of `start`
//! 5. Connection events drive the session until it is authenticated, the
//!    device is logged out, or its retry/lifetime budget runs out
//!
//! Once authenticated the credentials are persisted under the session id and
//! sent to the paired account. Failures after the challenge was issued never
//! reach the caller; they only show up in the session's final state.

use crate::delivery;
use crate::session::{format_pairing_code, Challenge, PairingRequest, SessionId, SessionState};
use crate::storage::{CredentialNamespace, SessionStore, StorageError};
use chrono::Utc;
use sessiongen_core::{
    AuthState, Config, Connection, ConnectionEvent, Connector, CredentialBundle,
    DisconnectReason, ErrorClass, PhoneNumber, RetentionPolicy,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, watch, RwLock, Semaphore};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Pairing errors
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("Invalid phone number: {0}")]
    InvalidNumber(String),
    #[error("Failed to get pairing code: {0}")]
    PairingCodeUnavailable(String),
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Session not found")]
    NotFound,
}

pub type PairingResult<T> = Result<T, PairingError>;

impl From<StorageError> for PairingError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => PairingError::NotFound,
            other => PairingError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<sessiongen_core::Error> for PairingError {
    fn from(err: sessiongen_core::Error) -> Self {
        match err {
            sessiongen_core::Error::InvalidNumber(reason) => PairingError::InvalidNumber(reason),
        }
    }
}

/// Returned by `start` once the challenge is available
#[derive(Debug)]
pub struct PairingHandle {
    /// Capability token for retrieving the credentials later
    pub session_id: SessionId,
    pub challenge: Challenge,
    /// Live lifecycle state of the session
    pub state: watch::Receiver<SessionState>,
}

/// Manages pairing sessions
pub struct PairingManager {
    connector: Arc<dyn Connector>,
    store: Arc<SessionStore>,
    config: Config,
    /// Bounds the number of sessions in flight
    slots: Arc<Semaphore>,
    /// State of live sessions
    sessions: Arc<RwLock<HashMap<SessionId, watch::Receiver<SessionState>>>>,
}

impl PairingManager {
    /// Create a new pairing manager
    pub fn new(connector: Arc<dyn Connector>, store: Arc<SessionStore>, config: Config) -> Self {
        Self {
            connector,
            store,
            slots: Arc::new(Semaphore::new(config.max_sessions)),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Validate a user-typed number and start a pairing-code session
    pub async fn pair_number(&self, raw_number: &str) -> PairingResult<PairingHandle> {
        let request = PairingRequest::code(raw_number)?;
        self.start(request).await
    }

    /// Start a pairing session and wait for its first challenge
    pub async fn start(&self, request: PairingRequest) -> PairingResult<PairingHandle> {
        let permit = self.slots.clone().try_acquire_owned().map_err(|_| {
            warn!(
                "Rejecting pairing request: {} sessions already in flight",
                self.config.max_sessions
            );
            PairingError::ServiceUnavailable(
                "Too many pairing sessions in progress, try again shortly".to_string(),
            )
        })?;

        let session_id = SessionId::generate();
        let namespace = self.store.create(&session_id).await.map_err(|e| {
            error!("Failed to allocate credential namespace: {}", e);
            PairingError::StoreUnavailable(e.to_string())
        })?;

        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (challenge_tx, challenge_rx) = oneshot::channel();

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), state_rx.clone());

        info!(
            "Started {:?} pairing session {} via {}",
            request.mode(),
            session_id.fingerprint(),
            self.connector.name()
        );

        let task = SessionTask {
            id: session_id.clone(),
            number: request.number().cloned(),
            namespace,
            connector: self.connector.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            state: state_tx,
            challenge: Some(challenge_tx),
            deadline: Instant::now() + self.config.session_lifetime,
            attempts: 0,
        };
        let sessions = self.sessions.clone();
        let id = session_id.clone();
        tokio::spawn(async move {
            task.run().await;
            sessions.write().await.remove(&id);
            drop(permit);
        });

        match tokio::time::timeout(self.config.challenge_timeout, challenge_rx).await {
            Ok(Ok(Ok(challenge))) => Ok(PairingHandle {
                session_id,
                challenge,
                state: state_rx,
            }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(PairingError::ServiceUnavailable(
                "Session ended before a pairing challenge was issued".to_string(),
            )),
            Err(_) => {
                warn!(
                    "No pairing challenge for session {} within {:?}",
                    session_id.fingerprint(),
                    self.config.challenge_timeout
                );
                Err(PairingError::ServiceUnavailable(
                    "Timed out waiting for a pairing challenge".to_string(),
                ))
            }
        }
    }

    /// Current state of a live session
    pub async fn state(&self, id: &SessionId) -> Option<SessionState> {
        let sessions = self.sessions.read().await;
        sessions.get(id).map(|rx| *rx.borrow())
    }

    /// Number of sessions in flight
    pub fn active_sessions(&self) -> usize {
        self.config
            .max_sessions
            .saturating_sub(self.slots.available_permits())
    }

    pub fn capacity(&self) -> usize {
        self.config.max_sessions
    }

    /// Retrieve a stored bundle, applying the retention policy
    pub async fn fetch(&self, id: &SessionId) -> PairingResult<CredentialBundle> {
        if let RetentionPolicy::TimeBoxed { ttl } = self.config.retention {
            let stored = self.store.stored(id).await?;
            let stale = stored
                .completed_at
                .and_then(|done| (Utc::now() - done).to_std().ok())
                .is_some_and(|age| age > ttl);
            if stale {
                self.store.delete(id).await?;
                return Err(PairingError::NotFound);
            }
        }

        let bundle = match self.config.retention {
            RetentionPolicy::UntilFetched => self.store.take(id).await?,
            _ => self.store.read(id).await?,
        };

        info!("Session {} retrieved", id.fingerprint());
        Ok(bundle)
    }

    /// Remove stored namespaces the retention policy no longer covers
    ///
    /// Namespaces of live sessions are never touched. Returns how many
    /// namespaces were removed.
    pub async fn reap(&self) -> usize {
        let stored = match self.store.list().await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to list stored sessions: {}", e);
                return 0;
            }
        };
        let live: HashSet<SessionId> = self.sessions.read().await.keys().cloned().collect();
        let now = Utc::now();
        let mut removed = 0;

        for entry in stored.into_iter().filter(|s| !live.contains(&s.id)) {
            let expired = match entry.completed_at {
                Some(done) => match self.config.retention {
                    RetentionPolicy::TimeBoxed { ttl } => {
                        (now - done).to_std().is_ok_and(|age| age > ttl)
                    }
                    RetentionPolicy::OneShot => true,
                    RetentionPolicy::UntilFetched => false,
                },
                // Left behind by a session that never finished
                None => (now - entry.created_at)
                    .to_std()
                    .is_ok_and(|age| age > self.config.session_lifetime),
            };

            if expired {
                match self.store.delete(&entry.id).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to reap session {}: {}", entry.id.fingerprint(), e),
                }
            }
        }

        if removed > 0 {
            info!("Reaped {} stored session(s)", removed);
        }
        removed
    }
}

/// How a session ended
enum Terminal {
    Completed,
    LoggedOut,
    Expired,
    Failed(PairingError),
}

impl Terminal {
    fn state(&self) -> SessionState {
        match self {
            Terminal::Completed => SessionState::Completed,
            Terminal::LoggedOut => SessionState::LoggedOut,
            Terminal::Expired => SessionState::Expired,
            Terminal::Failed(_) => SessionState::Failed,
        }
    }
}

/// What to do after a connection stopped being useful
enum Flow {
    Reconnect(DisconnectReason),
    Finish(Terminal),
}

/// Why an upstream call was cut short
enum Interrupt {
    /// Session lifetime elapsed
    Expired,
    /// Caller of `start` stopped waiting for the challenge
    Abandoned,
}

/// Upper bound on closing a connection
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// One pairing attempt; owns its connection and namespace
struct SessionTask {
    id: SessionId,
    number: Option<PhoneNumber>,
    namespace: CredentialNamespace,
    connector: Arc<dyn Connector>,
    store: Arc<SessionStore>,
    config: Config,
    state: watch::Sender<SessionState>,
    /// Present until the first challenge was handed out
    challenge: Option<oneshot::Sender<PairingResult<Challenge>>>,
    deadline: Instant,
    attempts: u32,
}

impl SessionTask {
    async fn run(mut self) {
        let terminal = self.drive().await;
        let state = terminal.state();

        let keep = matches!(terminal, Terminal::Completed) && self.config.retention.retains_bundle();
        if !keep {
            if let Err(e) = self.store.delete(&self.id).await {
                warn!("Failed to clean up session {}: {}", self.id.fingerprint(), e);
            }
        }

        if let Some(tx) = self.challenge.take() {
            let err = match terminal {
                Terminal::Failed(e) => e,
                _ => PairingError::ServiceUnavailable(
                    "Session ended before a pairing challenge was issued".to_string(),
                ),
            };
            let _ = tx.send(Err(err));
        }

        info!("Session {} finished: {}", self.id.fingerprint(), state);
        self.state.send_replace(state);
    }

    async fn drive(&mut self) -> Terminal {
        loop {
            self.set_state(SessionState::Connecting);

            let mut conn = match self.connect().await {
                Ok(conn) => conn,
                Err(Flow::Finish(terminal)) => return terminal,
                Err(Flow::Reconnect(reason)) => {
                    if let Some(terminal) = self.backoff(&reason).await {
                        return terminal;
                    }
                    continue;
                }
            };

            let flow = match self.request_code(conn.as_mut()).await {
                Some(flow) => flow,
                None => self.watch(conn.as_mut()).await,
            };
            if tokio::time::timeout(CLOSE_GRACE, conn.close()).await.is_err() {
                warn!("Session {} connection did not close in time", self.id.fingerprint());
            }

            match flow {
                Flow::Finish(terminal) => return terminal,
                Flow::Reconnect(reason) => {
                    if let Some(terminal) = self.backoff(&reason).await {
                        return terminal;
                    }
                }
            }
        }
    }

    /// Open a connection bound to this session's namespace
    async fn connect(&mut self) -> Result<Box<dyn Connection>, Flow> {
        let credentials = self
            .namespace
            .load_working()
            .await
            .map_err(|e| Flow::Finish(Terminal::Failed(e.into())))?;

        let auth = AuthState {
            namespace: self.namespace.path().to_path_buf(),
            credentials,
        };

        let connector = self.connector.clone();
        let result = tokio::select! {
            result = connector.connect(auth) => result,
            stop = interruption(self.deadline, &mut self.challenge) => {
                return Err(Flow::Finish(self.interrupted(stop, "connecting")));
            }
        };

        match result {
            Ok(conn) => Ok(conn),
            Err(err) => {
                let class = err.class();
                warn!(
                    "Session {} failed to connect ({:?}): {}",
                    self.id.fingerprint(),
                    class,
                    err
                );
                if self.awaiting_challenge() {
                    Err(Flow::Finish(Terminal::Failed(
                        PairingError::ServiceUnavailable(err.to_string()),
                    )))
                } else if class == ErrorClass::LoggedOut {
                    Err(Flow::Finish(Terminal::LoggedOut))
                } else if class.is_retryable() {
                    Err(Flow::Reconnect(DisconnectReason::from_error(&err)))
                } else {
                    Err(Flow::Finish(Terminal::Failed(
                        PairingError::ServiceUnavailable(err.to_string()),
                    )))
                }
            }
        }
    }

    /// Numeric mode: request and hand out the pairing code
    ///
    /// Returns a flow only when the session cannot continue.
    async fn request_code(&mut self, conn: &mut dyn Connection) -> Option<Flow> {
        let number = self.number.clone()?;
        if conn.is_registered() || !self.awaiting_challenge() {
            return None;
        }

        let delay = self.config.pairing_code_delay;
        let requested = tokio::select! {
            result = async {
                // The socket must finish its handshake before the server accepts this
                tokio::time::sleep(delay).await;
                conn.request_pairing_code(number.as_str()).await
            } => result,
            stop = interruption(self.deadline, &mut self.challenge) => {
                return Some(Flow::Finish(self.interrupted(stop, "requesting a pairing code")));
            }
        };

        match requested {
            Ok(raw) => {
                let code = format_pairing_code(&raw);
                if self.issue(Challenge::Code(code), SessionState::CodeIssued) {
                    info!("Pairing code issued for session {}", self.id.fingerprint());
                    None
                } else {
                    Some(Flow::Finish(Terminal::Failed(PairingError::ServiceUnavailable(
                        "Caller stopped waiting for the pairing code".to_string(),
                    ))))
                }
            }
            Err(err) => {
                warn!(
                    "Pairing code request failed for session {} ({:?}): {}",
                    self.id.fingerprint(),
                    err.class(),
                    err
                );
                Some(Flow::Finish(Terminal::Failed(
                    PairingError::PairingCodeUnavailable(err.to_string()),
                )))
            }
        }
    }

    /// React to connection events until the connection is done
    async fn watch(&mut self, conn: &mut dyn Connection) -> Flow {
        loop {
            let next = tokio::select! {
                event = conn.next_event() => event,
                stop = interruption(self.deadline, &mut self.challenge) => {
                    return Flow::Finish(self.interrupted(stop, "waiting for events"));
                }
            };
            let Some(event) = next else {
                return self.closed(DisconnectReason::Other {
                    code: None,
                    message: "event stream ended".to_string(),
                });
            };

            match event {
                ConnectionEvent::Connecting => {
                    debug!("Session {} connecting", self.id.fingerprint());
                }
                ConnectionEvent::Qr(payload) => {
                    if self.number.is_none() && self.awaiting_challenge() {
                        if !self.issue(Challenge::Qr(payload), SessionState::QrIssued) {
                            return Flow::Finish(Terminal::Failed(
                                PairingError::ServiceUnavailable(
                                    "Caller stopped waiting for the QR code".to_string(),
                                ),
                            ));
                        }
                        info!("QR code issued for session {}", self.id.fingerprint());
                    } else {
                        debug!("Session {} received a refreshed QR", self.id.fingerprint());
                    }
                }
                ConnectionEvent::CredentialsUpdated(bundle) => {
                    if let Err(e) = self.namespace.save_working(&bundle).await {
                        error!(
                            "Failed to save credentials for session {}: {}",
                            self.id.fingerprint(),
                            e
                        );
                        return Flow::Finish(Terminal::Failed(e.into()));
                    }
                    debug!("Session {} credentials updated", self.id.fingerprint());
                }
                ConnectionEvent::NewLogin => {
                    info!("Session {}: new login via pairing", self.id.fingerprint());
                }
                ConnectionEvent::Online => {
                    debug!("Session {} online", self.id.fingerprint());
                }
                ConnectionEvent::Open => return Flow::Finish(self.complete(conn).await),
                ConnectionEvent::Closed(reason) => return self.closed(reason),
            }
        }
    }

    fn interrupted(&self, stop: Interrupt, during: &str) -> Terminal {
        match stop {
            Interrupt::Expired => {
                warn!(
                    "Session {} exceeded its lifetime of {:?} while {}",
                    self.id.fingerprint(),
                    self.config.session_lifetime,
                    during
                );
                Terminal::Expired
            }
            Interrupt::Abandoned => {
                debug!(
                    "Session {} abandoned by its caller while {}",
                    self.id.fingerprint(),
                    during
                );
                Terminal::Failed(PairingError::ServiceUnavailable(
                    "Caller stopped waiting for a pairing challenge".to_string(),
                ))
            }
        }
    }

    fn closed(&self, reason: DisconnectReason) -> Flow {
        if reason.is_logged_out() {
            info!(
                "Session {} logged out; a new pairing is required",
                self.id.fingerprint()
            );
            Flow::Finish(Terminal::LoggedOut)
        } else if self.awaiting_challenge() {
            Flow::Finish(Terminal::Failed(PairingError::ServiceUnavailable(format!(
                "Connection closed before a pairing challenge was issued: {}",
                reason
            ))))
        } else {
            info!(
                "Session {} connection closed: {} (status {:?})",
                self.id.fingerprint(),
                reason,
                reason.status_code()
            );
            Flow::Reconnect(reason)
        }
    }

    /// Persist and deliver the credentials of an authenticated connection
    async fn complete(&mut self, conn: &mut dyn Connection) -> Terminal {
        self.set_state(SessionState::Authenticated);
        info!("Session {} authenticated", self.id.fingerprint());

        let bundle = match self.namespace.load_working().await {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                error!(
                    "Session {} opened without saved credentials",
                    self.id.fingerprint()
                );
                return Terminal::Failed(PairingError::StoreUnavailable(
                    "No credentials were saved before the connection opened".to_string(),
                ));
            }
            Err(e) => return Terminal::Failed(e.into()),
        };

        if let Err(e) = self.store.persist(&self.id, &bundle).await {
            error!(
                "Failed to persist credentials for session {}: {}",
                self.id.fingerprint(),
                e
            );
            return Terminal::Failed(e.into());
        }

        if self.config.deliver_to_account {
            let delivered = tokio::time::timeout_at(self.deadline, self.deliver(conn, &bundle)).await;
            if delivered.is_err() {
                warn!(
                    "Session {} ran out of lifetime while delivering",
                    self.id.fingerprint()
                );
            }
        }

        Terminal::Completed
    }

    /// Send the result to the paired account; failures are logged only
    async fn deliver(&self, conn: &mut dyn Connection, bundle: &CredentialBundle) {
        let account = self
            .number
            .as_ref()
            .map(|n| n.as_str().to_string())
            .or_else(|| conn.paired_account());
        let Some(account) = account else {
            warn!(
                "Session {} has no account to deliver to",
                self.id.fingerprint()
            );
            return;
        };

        let to = delivery::account_address(&account);
        let messages = [
            delivery::session_ready(&self.id, &to, self.config.retention, bundle),
            delivery::security_notice().to_string(),
        ];
        for text in &messages {
            if let Err(err) = conn.send_text(&to, text).await {
                warn!(
                    "Delivery failed for session {} ({:?}): {}",
                    self.id.fingerprint(),
                    err.class(),
                    err
                );
                return;
            }
        }
        info!("Session {} delivered to paired account", self.id.fingerprint());
    }

    /// Count a reconnect and wait out its backoff
    ///
    /// Returns a terminal state once the retry or lifetime budget is spent.
    async fn backoff(&mut self, reason: &DisconnectReason) -> Option<Terminal> {
        self.attempts += 1;
        let max = self.config.retry.max_attempts;
        if self.attempts > max {
            warn!(
                "Session {} gave up after {} reconnects (last: {})",
                self.id.fingerprint(),
                max,
                reason
            );
            return Some(Terminal::Expired);
        }

        let delay = self.config.retry.delay_for(self.attempts);
        if Instant::now() + delay >= self.deadline {
            warn!(
                "Session {} has no lifetime left to reconnect",
                self.id.fingerprint()
            );
            return Some(Terminal::Expired);
        }

        self.set_state(SessionState::Reconnecting);
        info!(
            "Session {} reconnecting in {:?} (attempt {}/{})",
            self.id.fingerprint(),
            delay,
            self.attempts,
            max
        );
        tokio::time::sleep(delay).await;
        None
    }

    fn awaiting_challenge(&self) -> bool {
        self.challenge.is_some()
    }

    /// Hand the first challenge to the caller; false if it stopped waiting
    fn issue(&mut self, challenge: Challenge, state: SessionState) -> bool {
        let Some(tx) = self.challenge.take() else {
            return false;
        };
        // Visible to the caller as soon as it holds the challenge
        self.set_state(state);
        tx.send(Ok(challenge)).is_ok()
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }
}

/// Resolves once the session lifetime ends or, before the challenge was
/// handed out, once the caller of `start` stopped waiting
async fn interruption(
    deadline: Instant,
    challenge: &mut Option<oneshot::Sender<PairingResult<Challenge>>>,
) -> Interrupt {
    tokio::select! {
        _ = tokio::time::sleep_until(deadline) => Interrupt::Expired,
        _ = caller_gone(challenge) => Interrupt::Abandoned,
    }
}

/// Resolves when the caller of `start` dropped its end; never resolves once
/// the challenge was handed out
async fn caller_gone(challenge: &mut Option<oneshot::Sender<PairingResult<Challenge>>>) {
    match challenge {
        Some(tx) => tx.closed().await,
        None => std::future::pending().await,
    }
}
