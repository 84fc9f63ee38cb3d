//! In-process protocol backend
//!
//! Simulates the chat network without leaving the process. Every connection
//! gets its own event channel; a [`LoopbackController`] drives the most recent
//! one (emit events, inject failures) and records what the client did. With
//! an autopilot delay set, connections pair themselves after that delay, which
//! is what the bundled binary uses for local runs.

use crate::error::ProtocolError;
use crate::protocol::{AuthState, Connection, ConnectionEvent, Connector, CredentialBundle, DisconnectReason};
use async_trait::async_trait;
use rand::distributions::{Alphanumeric, DistString};
use rand::Rng;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// Characters the pairing code alphabet is drawn from
const CODE_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTVWXYZ";
const CODE_LEN: usize = 8;

/// A `connect` call observed by the loopback backend
#[derive(Debug, Clone)]
pub struct ConnectRecord {
    pub namespace: PathBuf,
    pub credentials: Option<CredentialBundle>,
}

/// A message sent through a loopback connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub to: String,
    pub text: String,
}

#[derive(Default)]
struct State {
    connects: Vec<ConnectRecord>,
    current: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    connect_failures: VecDeque<ProtocolError>,
    code_failure: Option<ProtocolError>,
    send_failure: Option<ProtocolError>,
    code_requests: Vec<String>,
    sent: Vec<SentMessage>,
    closed: usize,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Loopback implementation of [`Connector`]
#[derive(Clone, Default)]
pub struct LoopbackConnector {
    state: Arc<Mutex<State>>,
    autopilot: Option<Duration>,
    handshake: Duration,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair every connection automatically after `delay`
    pub fn with_autopilot(mut self, delay: Duration) -> Self {
        self.autopilot = Some(delay);
        self
    }

    /// Reject pairing code requests made sooner than `delay` after connecting
    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake = delay;
        self
    }

    /// Handle for driving and inspecting connections
    pub fn controller(&self) -> LoopbackController {
        LoopbackController {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, auth: AuthState) -> Result<Box<dyn Connection>, ProtocolError> {
        let registered = auth.credentials.as_ref().is_some_and(is_registered);
        let account = auth.credentials.as_ref().and_then(account_of);
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut state = lock(&self.state);
            if let Some(err) = state.connect_failures.pop_front() {
                return Err(err);
            }
            state.connects.push(ConnectRecord {
                namespace: auth.namespace.clone(),
                credentials: auth.credentials.clone(),
            });
            state.current = Some(tx.clone());
        }

        debug!("Loopback connection opened (registered: {})", registered);
        let _ = tx.send(ConnectionEvent::Connecting);

        if let Some(delay) = self.autopilot {
            tokio::spawn(autopilot(tx, registered, delay));
        }

        Ok(Box::new(LoopbackConnection {
            rx,
            registered,
            account,
            opened_at: Instant::now(),
            handshake: self.handshake,
            state: self.state.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

async fn autopilot(tx: mpsc::UnboundedSender<ConnectionEvent>, registered: bool, delay: Duration) {
    if !registered {
        let _ = tx.send(ConnectionEvent::Qr(qr_payload()));
    }
    tokio::time::sleep(delay).await;
    let events = [
        ConnectionEvent::CredentialsUpdated(issue_credentials(None)),
        ConnectionEvent::NewLogin,
        ConnectionEvent::Open,
        ConnectionEvent::Online,
    ];
    for event in events {
        if tx.send(event).is_err() {
            return;
        }
    }
}

/// Drives loopback connections from the outside
#[derive(Clone)]
pub struct LoopbackController {
    state: Arc<Mutex<State>>,
}

impl LoopbackController {
    /// Send an event on the most recent connection
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        let state = lock(&self.state);
        state
            .current
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Save linked-device credentials and open the most recent connection
    pub fn authenticate(&self) -> bool {
        let account = lock(&self.state).code_requests.last().cloned();
        self.emit(ConnectionEvent::CredentialsUpdated(issue_credentials(
            account.as_deref(),
        ))) && self.emit(ConnectionEvent::NewLogin)
            && self.emit(ConnectionEvent::Open)
    }

    /// Close the most recent connection with `reason`
    pub fn disconnect(&self, reason: DisconnectReason) -> bool {
        self.emit(ConnectionEvent::Closed(reason))
    }

    /// End the most recent connection's event stream without a close event
    pub fn drop_stream(&self) {
        lock(&self.state).current = None;
    }

    /// Fail the next `connect` call
    pub fn fail_next_connect(&self, err: ProtocolError) {
        lock(&self.state).connect_failures.push_back(err);
    }

    /// Fail the next pairing code request
    pub fn fail_next_pairing_code(&self, err: ProtocolError) {
        lock(&self.state).code_failure = Some(err);
    }

    /// Fail the next outgoing message
    pub fn fail_next_send(&self, err: ProtocolError) {
        lock(&self.state).send_failure = Some(err);
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects.len()
    }

    pub fn connects(&self) -> Vec<ConnectRecord> {
        lock(&self.state).connects.clone()
    }

    /// Numbers pairing codes were requested for
    pub fn code_requests(&self) -> Vec<String> {
        lock(&self.state).code_requests.clone()
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        lock(&self.state).sent.clone()
    }

    /// Number of connections closed by the client
    pub fn closed_count(&self) -> usize {
        lock(&self.state).closed
    }

    /// Wait until at least `n` connections were opened
    pub async fn wait_for_connects(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.connect_count() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.connect_count() >= n
    }
}

struct LoopbackConnection {
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    registered: bool,
    account: Option<String>,
    opened_at: Instant,
    handshake: Duration,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Connection for LoopbackConnection {
    fn is_registered(&self) -> bool {
        self.registered
    }

    async fn request_pairing_code(&mut self, number: &str) -> Result<String, ProtocolError> {
        if self.opened_at.elapsed() < self.handshake {
            return Err(ProtocolError::with_status(428, "Connection Closed"));
        }

        let mut state = lock(&self.state);
        if let Some(err) = state.code_failure.take() {
            return Err(err);
        }
        state.code_requests.push(number.to_string());
        self.account = Some(number.to_string());

        let mut rng = rand::thread_rng();
        let code = (0..CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        Ok(code)
    }

    async fn next_event(&mut self) -> Option<ConnectionEvent> {
        let event = self.rx.recv().await?;
        if let ConnectionEvent::CredentialsUpdated(bundle) = &event {
            self.registered = is_registered(bundle);
            if let Some(account) = account_of(bundle) {
                self.account = Some(account);
            }
        }
        Some(event)
    }

    fn paired_account(&self) -> Option<String> {
        self.account.clone()
    }

    async fn send_text(&mut self, to: &str, text: &str) -> Result<(), ProtocolError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.send_failure.take() {
            return Err(err);
        }
        state.sent.push(SentMessage {
            to: to.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn close(&mut self) {
        self.rx.close();
        lock(&self.state).closed += 1;
    }
}

fn qr_payload() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "2@{},{},{}",
        Alphanumeric.sample_string(&mut rng, 32),
        Alphanumeric.sample_string(&mut rng, 43),
        Alphanumeric.sample_string(&mut rng, 43)
    )
}

/// Credentials as a linked device would hold them
fn issue_credentials(account: Option<&str>) -> CredentialBundle {
    let mut rng = rand::thread_rng();
    let account = account
        .map(str::to_string)
        .unwrap_or_else(|| format!("1555{:07}", rng.gen_range(0..10_000_000u32)));
    let creds = serde_json::json!({
        "registered": true,
        "me": { "id": account },
        "noiseKey": Alphanumeric.sample_string(&mut rng, 43),
        "signedIdentityKey": Alphanumeric.sample_string(&mut rng, 43),
        "registrationId": rng.gen_range(1..16_384u32),
        "issuedAt": chrono::Utc::now().to_rfc3339(),
    });
    CredentialBundle::from_bytes(creds.to_string())
}

fn credential_json(bundle: &CredentialBundle) -> Option<serde_json::Value> {
    serde_json::from_slice(bundle.as_bytes()).ok()
}

fn is_registered(bundle: &CredentialBundle) -> bool {
    credential_json(bundle)
        .and_then(|v| v.get("registered")?.as_bool())
        .unwrap_or(false)
}

fn account_of(bundle: &CredentialBundle) -> Option<String> {
    credential_json(bundle)?
        .get("me")?
        .get("id")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(credentials: Option<CredentialBundle>) -> AuthState {
        AuthState {
            namespace: PathBuf::from("/tmp/loopback-test"),
            credentials,
        }
    }

    #[tokio::test]
    async fn test_connect_emits_connecting() {
        let connector = LoopbackConnector::new();
        let mut conn = connector.connect(auth(None)).await.unwrap();
        assert!(!conn.is_registered());
        assert_eq!(conn.next_event().await, Some(ConnectionEvent::Connecting));
        assert_eq!(connector.controller().connect_count(), 1);
    }

    #[tokio::test]
    async fn test_pairing_code_shape() {
        let connector = LoopbackConnector::new();
        let mut conn = connector.connect(auth(None)).await.unwrap();
        let code = conn.request_pairing_code("15551234567").await.unwrap();
        assert_eq!(code.len(), CODE_LEN);
        assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        assert_eq!(conn.paired_account().as_deref(), Some("15551234567"));
    }

    #[tokio::test]
    async fn test_handshake_delay_rejects_early_code_request() {
        let connector = LoopbackConnector::new().with_handshake_delay(Duration::from_secs(60));
        let mut conn = connector.connect(auth(None)).await.unwrap();
        let err = conn.request_pairing_code("15551234567").await.unwrap_err();
        assert_eq!(err.status, Some(428));
    }

    #[tokio::test]
    async fn test_authenticate_marks_registered() {
        let connector = LoopbackConnector::new();
        let controller = connector.controller();
        let mut conn = connector.connect(auth(None)).await.unwrap();
        conn.request_pairing_code("447911123456").await.unwrap();

        assert!(controller.authenticate());
        assert_eq!(conn.next_event().await, Some(ConnectionEvent::Connecting));
        let creds = match conn.next_event().await {
            Some(ConnectionEvent::CredentialsUpdated(creds)) => creds,
            other => panic!("unexpected event: {:?}", other),
        };
        assert!(conn.is_registered());
        assert_eq!(account_of(&creds).as_deref(), Some("447911123456"));

        // Reconnecting with saved credentials skips pairing
        let conn = connector.connect(auth(Some(creds))).await.unwrap();
        assert!(conn.is_registered());
    }

    #[tokio::test]
    async fn test_injected_connect_failure() {
        let connector = LoopbackConnector::new();
        let controller = connector.controller();
        controller.fail_next_connect(ProtocolError::new("Socket connection timeout"));
        assert!(connector.connect(auth(None)).await.is_err());
        assert!(connector.connect(auth(None)).await.is_ok());
        assert_eq!(controller.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_autopilot_pairs() {
        let connector = LoopbackConnector::new().with_autopilot(Duration::from_millis(10));
        let mut conn = connector.connect(auth(None)).await.unwrap();
        let mut saw_qr = false;
        while let Some(event) = conn.next_event().await {
            match event {
                ConnectionEvent::Qr(_) => saw_qr = true,
                ConnectionEvent::Open => break,
                _ => {}
            }
        }
        assert!(saw_qr);
        assert!(conn.is_registered());
    }
}
