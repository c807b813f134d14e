//! Connection supervisor.
//!
//! Owns the WebSocket lifecycle: the Noise handshake on connect, stanza
//! routing by selector, tagged request/reply with rate-limit retry,
//! keep-alive pings, session-health checks and reconnection with backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicI64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::binary::{decode, encode, Node};
use crate::config::Config;
use crate::crypto::noise::{Handshake, NoiseTransport};
use crate::proto::wa;
use crate::socket::FrameSocket;
use crate::store::{Credentials, SignalStore};
use crate::types::events::{ConnectionState, ConnectionUpdate, DisconnectReason, Event};

/// Keep-alive failures tolerated before the connection is declared lost.
const MAX_KEEPALIVE_FAILURES: u32 = 6;
/// Rate-limit retry budget for queries.
const MAX_RATE_LIMIT_RETRIES: u32 = 20;

/// Connection errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnError {
    #[error("not connected")]
    NotConnected,
    #[error("timedOut")]
    TimedOut,
    #[error("connection closed")]
    Closed,
    #[error("socket error: {0}")]
    Socket(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("stanza error {code}: {text}")]
    Iq { code: u16, text: String },
}

/// The narrow sending interface collaborators depend on. The supervisor
/// implements it; nothing below the supervisor imports the supervisor.
pub trait NodeSender: Send + Sync {
    fn send_node(&self, node: Node) -> BoxFuture<'_, Result<(), ConnError>>;

    /// Send a tagged node and await its reply. `timeout` falls back to the
    /// configured query timeout.
    fn query(&self, node: Node, timeout: Option<Duration>)
        -> BoxFuture<'_, Result<Node, ConnError>>;
}

/// Stanza selector: tag, optional attribute equality, optional child tag.
/// More constrained selectors are more specific and dispatch first.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSelector {
    pub tag: String,
    pub attr: Option<(String, String)>,
    pub child: Option<String>,
}

impl RouteSelector {
    pub fn tag(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            attr: None,
            child: None,
        }
    }

    pub fn with_attr(mut self, key: &str, value: &str) -> Self {
        self.attr = Some((key.to_string(), value.to_string()));
        self
    }

    pub fn with_child(mut self, child: &str) -> Self {
        self.child = Some(child.to_string());
        self
    }

    pub fn matches(&self, node: &Node) -> bool {
        if node.tag != self.tag {
            return false;
        }
        if let Some((key, value)) = &self.attr {
            if node.get_attr_str(key) != Some(value.as_str()) {
                return false;
            }
        }
        if let Some(child) = &self.child {
            if node.get_child_by_tag(child).is_none() {
                return false;
            }
        }
        true
    }

    pub fn specificity(&self) -> u8 {
        1 + u8::from(self.attr.is_some()) + u8::from(self.child.is_some())
    }
}

type RouteHandler = Arc<dyn Fn(Node) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct RouteTable {
    routes: Vec<(RouteSelector, RouteHandler)>,
}

impl RouteTable {
    fn register(&mut self, selector: RouteSelector, handler: RouteHandler) {
        self.routes.push((selector, handler));
        // Most specific first; registration order breaks ties.
        self.routes
            .sort_by(|a, b| b.0.specificity().cmp(&a.0.specificity()));
    }

    fn matching(&self, node: &Node) -> Vec<RouteHandler> {
        self.routes
            .iter()
            .filter(|(selector, _)| selector.matches(node))
            .map(|(_, handler)| handler.clone())
            .collect()
    }
}

/// The connection supervisor.
pub struct Connection {
    cfg: Config,
    store: Arc<SignalStore>,
    creds: Arc<RwLock<Credentials>>,
    events: mpsc::UnboundedSender<Event>,

    routes: StdMutex<RouteTable>,
    waiters: StdMutex<HashMap<String, oneshot::Sender<Node>>>,
    unique_id: String,
    id_counter: AtomicU64,

    socket: Mutex<Option<FrameSocket>>,
    noise: Mutex<Option<NoiseTransport>>,

    expected_disconnect: AtomicBool,
    keepalive_failures: AtomicU32,
    last_recv_ms: AtomicI64,
    reconnect_attempts: AtomicU32,
    last_error_was_network: AtomicBool,
}

impl Connection {
    pub fn new(
        cfg: Config,
        store: Arc<SignalStore>,
        creds: Arc<RwLock<Credentials>>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Arc<Self> {
        let unique: u16 = rand::random();
        Arc::new(Self {
            cfg,
            store,
            creds,
            events,
            routes: StdMutex::new(RouteTable::default()),
            waiters: StdMutex::new(HashMap::new()),
            unique_id: format!("{unique:x}"),
            id_counter: AtomicU64::new(0),
            socket: Mutex::new(None),
            noise: Mutex::new(None),
            expected_disconnect: AtomicBool::new(false),
            keepalive_failures: AtomicU32::new(0),
            last_recv_ms: AtomicI64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            last_error_was_network: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<SignalStore> {
        &self.store
    }

    /// Register a stanza route. Handlers are wired once, before `connect`.
    pub fn register_route<F>(&self, selector: RouteSelector, handler: F)
    where
        F: Fn(Node) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.routes
            .lock()
            .expect("route table lock")
            .register(selector, Arc::new(handler));
    }

    fn next_id(&self) -> String {
        let n = self.id_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{n}", self.unique_id)
    }

    /// Connect the socket, run the Noise handshake and start the pumps.
    pub fn connect(self: &Arc<Self>) -> BoxFuture<'_, Result<(), ConnError>> {
        Box::pin(self.connect_inner())
    }

    async fn connect_inner(self: &Arc<Self>) -> Result<(), ConnError> {
        self.expected_disconnect.store(false, Ordering::Release);
        let _ = self.events.send(Event::Connection(ConnectionUpdate::state(
            ConnectionState::Connecting,
        )));

        let (noise_key, routing_info, payload) = {
            let creds = self.creds.read().await;
            let payload = client_payload(&creds);
            (
                creds.noise_key.clone(),
                creds.routing_info.clone(),
                payload,
            )
        };

        let connect = FrameSocket::connect(&self.cfg.endpoint, self.cfg.send_spacing);
        let (socket, mut incoming) = tokio::time::timeout(self.cfg.connect_timeout, connect)
            .await
            .map_err(|_| ConnError::TimedOut)?
            .map_err(|e| ConnError::Socket(e.to_string()))?;

        // Noise XX: hello out, server hello in, finish out.
        let mut handshake = Handshake::new(noise_key, routing_info.as_deref());
        socket
            .send_frame(handshake.client_hello())
            .map_err(|e| ConnError::Socket(e.to_string()))?;

        let server_hello = tokio::time::timeout(self.cfg.connect_timeout, incoming.recv())
            .await
            .map_err(|_| ConnError::TimedOut)?
            .ok_or(ConnError::Closed)?;
        handshake
            .read_server_hello(&server_hello)
            .map_err(|e| ConnError::Handshake(e.to_string()))?;

        let finish = handshake
            .client_finish(&payload)
            .map_err(|e| ConnError::Handshake(e.to_string()))?;
        socket
            .send_frame(finish)
            .map_err(|e| ConnError::Socket(e.to_string()))?;

        let transport = handshake
            .finish()
            .map_err(|e| ConnError::Handshake(e.to_string()))?;

        let reconnect_request = socket.reconnect_request.clone();
        *self.noise.lock().await = Some(transport);
        *self.socket.lock().await = Some(socket);
        self.keepalive_failures.store(0, Ordering::Release);
        self.reconnect_attempts.store(0, Ordering::Release);
        self.touch_recv();

        let _ = self.events.send(Event::Connection(ConnectionUpdate::state(
            ConnectionState::Open,
        )));

        let conn = self.clone();
        tokio::spawn(async move { conn.read_loop(incoming).await });
        let conn = self.clone();
        tokio::spawn(async move { conn.keepalive_loop().await });
        let conn = self.clone();
        tokio::spawn(async move { conn.health_loop().await });
        let conn = self.clone();
        tokio::spawn(async move {
            reconnect_request.notified().await;
            conn.handle_disconnect(DisconnectReason::ConnectionLost).await;
        });

        Ok(())
    }

    fn touch_recv(&self) {
        self.last_recv_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Release);
    }

    async fn read_loop(self: Arc<Self>, mut incoming: mpsc::UnboundedReceiver<Vec<u8>>) {
        while let Some(body) = incoming.recv().await {
            let plaintext = {
                let mut noise = self.noise.lock().await;
                match noise.as_mut() {
                    Some(transport) => match transport.decrypt_frame(&body) {
                        Ok(Some(plaintext)) => plaintext,
                        // Single-frame AEAD failure: logged and skipped.
                        Ok(None) => continue,
                        Err(e) => {
                            error!("transport state error: {e}");
                            continue;
                        }
                    },
                    None => continue,
                }
            };
            self.touch_recv();

            let node = match decode(&plaintext) {
                Ok(node) => node,
                Err(e) => {
                    warn!("failed to decode stanza: {e}");
                    continue;
                }
            };
            self.dispatch(node).await;
        }

        if !self.expected_disconnect.load(Ordering::Acquire) {
            self.clone()
                .handle_disconnect(DisconnectReason::ConnectionClosed)
                .await;
        }
    }

    /// Route one decoded stanza: reply waiters first, stream errors next,
    /// then the selector table.
    pub(crate) async fn dispatch(self: &Arc<Self>, node: Node) {
        if let Some(id) = node.get_attr_str("id") {
            let waiter = self.waiters.lock().expect("waiter lock").remove(id);
            if let Some(tx) = waiter {
                let _ = tx.send(node);
                return;
            }
        }

        if node.tag == "stream:error" {
            let code = node
                .get_attr_int("code")
                .map(|c| c as u16)
                .unwrap_or(0);
            let reason = DisconnectReason::from_stream_error_code(code);
            warn!("stream error {code}, closing ({reason:?})");
            self.end(reason).await;
            return;
        }

        let handlers = self.routes.lock().expect("route table lock").matching(&node);
        if handlers.is_empty() {
            debug!("unhandled stanza <{}>", node.tag);
        }
        for handler in handlers {
            handler(node.clone()).await;
        }
    }

    async fn encrypt_and_send(&self, plaintext: &[u8]) -> Result<(), ConnError> {
        let frame = {
            let mut noise = self.noise.lock().await;
            let transport = noise.as_mut().ok_or(ConnError::NotConnected)?;
            transport
                .frame_outgoing(plaintext)
                .map_err(|e| ConnError::Socket(e.to_string()))?
        };
        let socket = self.socket.lock().await;
        let socket = socket.as_ref().ok_or(ConnError::NotConnected)?;
        socket
            .send_frame(frame)
            .map_err(|e| ConnError::Socket(e.to_string()))
    }

    async fn query_once(
        &self,
        mut node: Node,
        timeout: Duration,
    ) -> Result<Node, ConnError> {
        let id = match node.get_attr_str("id") {
            Some(id) => id.to_string(),
            None => {
                let id = self.next_id();
                node.set_attr("id", id.clone());
                id
            }
        };

        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("waiter lock")
            .insert(id.clone(), tx);

        if let Err(e) = self.encrypt_and_send(&encode(&node)).await {
            self.waiters.lock().expect("waiter lock").remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ConnError::Closed),
            Err(_) => {
                // The in-flight send is not cancelled; a late reply is
                // dropped on arrival.
                self.waiters.lock().expect("waiter lock").remove(&id);
                Err(ConnError::TimedOut)
            }
        }
    }

    /// End the connection with a reason. 401/403/419-class reasons disable
    /// auto-reconnect.
    pub async fn end(self: &Arc<Self>, reason: DisconnectReason) {
        self.expected_disconnect.store(true, Ordering::Release);
        if let Some(socket) = self.socket.lock().await.take() {
            socket.shutdown();
        }
        *self.noise.lock().await = None;
        let _ = self
            .events
            .send(Event::Connection(ConnectionUpdate::closed(reason)));

        if reason.should_reconnect() {
            // The teardown above silenced the pumps; re-arm for reconnect.
            self.expected_disconnect.store(false, Ordering::Release);
            let conn = self.clone();
            tokio::spawn(async move { conn.reconnect_with_backoff().await });
        }
    }

    async fn handle_disconnect(self: Arc<Self>, reason: DisconnectReason) {
        if self.expected_disconnect.load(Ordering::Acquire) {
            return;
        }
        self.last_error_was_network.store(
            matches!(
                reason,
                DisconnectReason::ConnectionLost | DisconnectReason::ConnectionClosed
            ),
            Ordering::Release,
        );
        let _ = self
            .events
            .send(Event::Connection(ConnectionUpdate::closed(reason)));
        self.reconnect_with_backoff().await;
    }

    async fn reconnect_with_backoff(self: &Arc<Self>) {
        loop {
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::AcqRel);
            if attempt >= self.cfg.max_reconnect_attempts {
                error!("reconnect attempts exhausted");
                let _ = self.events.send(Event::ReconnectFailed);
                let _ = self.events.send(Event::Connection(ConnectionUpdate::closed(
                    DisconnectReason::ConnectionLost,
                )));
                return;
            }

            let delay = backoff_delay(
                attempt,
                self.last_error_was_network.load(Ordering::Acquire),
                self.cfg.max_reconnect_delay,
            );
            info!(
                "reconnecting in {delay:?} (attempt {}/{})",
                attempt + 1,
                self.cfg.max_reconnect_attempts
            );
            tokio::time::sleep(delay).await;

            if self.expected_disconnect.load(Ordering::Acquire) {
                return;
            }
            match self.connect().await {
                Ok(()) => return,
                Err(e) => {
                    self.last_error_was_network
                        .store(matches!(e, ConnError::Socket(_)), Ordering::Release);
                    warn!("reconnect attempt failed: {e}");
                }
            }
        }
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.cfg.keep_alive_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.expected_disconnect.load(Ordering::Acquire) {
                return;
            }

            let socket_closed = match self.socket.lock().await.as_ref() {
                Some(socket) => socket.is_closed(),
                None => true,
            };
            if socket_closed {
                self.clone()
                    .handle_disconnect(DisconnectReason::ConnectionLost)
                    .await;
                return;
            }

            let ping = Node::new("iq")
                .attr("type", "get")
                .attr("xmlns", "w:p")
                .children(vec![Node::new("ping")]);
            match self.query_once(ping, self.cfg.query_timeout).await {
                Ok(_) => {
                    self.keepalive_failures.store(0, Ordering::Release);
                }
                Err(e) => {
                    let failures = self.keepalive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                    warn!("keep-alive failed ({failures}/{MAX_KEEPALIVE_FAILURES}): {e}");
                    if failures >= MAX_KEEPALIVE_FAILURES {
                        self.end(DisconnectReason::ConnectionLost).await;
                        return;
                    }
                }
            }
        }
    }

    /// Independent watchdog: a long receive gap while the socket is closed
    /// triggers reconnection.
    async fn health_loop(self: Arc<Self>) {
        let limit = self.cfg.keep_alive_interval.as_millis() as i64 * 10;
        let mut ticker = tokio::time::interval(self.cfg.keep_alive_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.expected_disconnect.load(Ordering::Acquire) {
                return;
            }
            let silent_for =
                chrono::Utc::now().timestamp_millis() - self.last_recv_ms.load(Ordering::Acquire);
            let socket_closed = match self.socket.lock().await.as_ref() {
                Some(socket) => socket.is_closed(),
                None => true,
            };
            if silent_for > limit && socket_closed {
                warn!("no traffic for {silent_for}ms and socket closed, reconnecting");
                self.clone()
                    .handle_disconnect(DisconnectReason::ConnectionLost)
                    .await;
                return;
            }
        }
    }
}

/// Compute the reconnect delay for an attempt: base doubles per attempt,
/// capped. Network errors start from a higher base.
pub fn backoff_delay(attempt: u32, network_error: bool, cap: Duration) -> Duration {
    let base = if network_error { 2 } else { 1 };
    let secs = base << attempt.min(16);
    Duration::from_secs(secs).min(cap)
}

fn client_payload(creds: &Credentials) -> Vec<u8> {
    use prost::Message as ProstMessage;
    let payload = match (&creds.me, creds.registered) {
        (Some(me), true) => {
            wa::login_payload(me.user.parse().unwrap_or_default(), me.device as u32)
        }
        _ => wa::registration_payload(wa::make_device_pairing_data(
            creds.registration_id,
            &creds.identity_key.public,
            creds.signed_pre_key.key_id,
            &creds.signed_pre_key.key_pair.public,
            &creds.signed_pre_key.signature,
        )),
    };
    let mut buf = Vec::with_capacity(payload.encoded_len());
    payload.encode(&mut buf).expect("vec write is infallible");
    buf
}

impl NodeSender for Connection {
    fn send_node(&self, node: Node) -> BoxFuture<'_, Result<(), ConnError>> {
        Box::pin(async move { self.encrypt_and_send(&encode(&node)).await })
    }

    fn query(
        &self,
        node: Node,
        timeout: Option<Duration>,
    ) -> BoxFuture<'_, Result<Node, ConnError>> {
        let timeout = timeout.unwrap_or(self.cfg.query_timeout);
        Box::pin(async move {
            let mut attempt = 0;
            loop {
                let reply = self.query_once(node.clone(), timeout).await?;
                match classify_reply(&reply) {
                    Ok(reply) => return Ok(reply),
                    Err(ConnError::Iq { code: 429, .. }) if attempt < MAX_RATE_LIMIT_RETRIES => {
                        attempt += 1;
                        let jitter = rand::thread_rng().gen_range(300..=1000);
                        debug!("rate limited, retry {attempt} in {jitter}ms");
                        tokio::time::sleep(Duration::from_millis(jitter)).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}

/// Classify an IQ reply: errors become typed `ConnError::Iq` values.
pub fn classify_reply(reply: &Node) -> Result<Node, ConnError> {
    if reply.tag == "iq" && reply.get_attr_str("type") == Some("error") {
        let (code, text) = reply
            .get_child_by_tag("error")
            .map(|e| {
                (
                    e.get_attr_int("code").unwrap_or(0) as u16,
                    e.get_attr_str("text").unwrap_or(&e.tag).to_string(),
                )
            })
            .unwrap_or((0, "unknown".to_string()));
        return Err(ConnError::Iq { code, text });
    }
    Ok(reply.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn connection() -> (Arc<Connection>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(
            Config::default(),
            SignalStore::new(Arc::new(MemoryStore::new())),
            Arc::new(RwLock::new(Credentials::generate())),
            tx,
        );
        (conn, rx)
    }

    #[test]
    fn test_backoff_sequence() {
        let cap = Duration::from_secs(30);
        let delays: Vec<u64> = (0..5)
            .map(|n| backoff_delay(n, true, cap).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30]);

        let delays: Vec<u64> = (0..5)
            .map(|n| backoff_delay(n, false, cap).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_selector_matching() {
        let node = Node::new("iq")
            .attr("type", "set")
            .children(vec![Node::new("pair-device")]);

        assert!(RouteSelector::tag("iq").matches(&node));
        assert!(RouteSelector::tag("iq")
            .with_attr("type", "set")
            .matches(&node));
        assert!(RouteSelector::tag("iq")
            .with_attr("type", "set")
            .with_child("pair-device")
            .matches(&node));
        assert!(!RouteSelector::tag("iq")
            .with_attr("type", "get")
            .matches(&node));
        assert!(!RouteSelector::tag("message").matches(&node));
        assert!(!RouteSelector::tag("iq")
            .with_child("pair-success")
            .matches(&node));
    }

    #[test]
    fn test_selector_specificity_orders_dispatch() {
        let mut table = RouteTable::default();
        let order = Arc::new(StdMutex::new(Vec::new()));

        for (name, selector) in [
            ("tag", RouteSelector::tag("iq")),
            (
                "tag+attr+child",
                RouteSelector::tag("iq")
                    .with_attr("type", "set")
                    .with_child("pair-device"),
            ),
            ("tag+attr", RouteSelector::tag("iq").with_attr("type", "set")),
        ] {
            let order = order.clone();
            table.register(
                selector,
                Arc::new(move |_node| {
                    let order = order.clone();
                    Box::pin(async move {
                        order.lock().unwrap().push(name);
                    })
                }),
            );
        }

        let node = Node::new("iq")
            .attr("type", "set")
            .children(vec![Node::new("pair-device")]);
        let handlers = table.matching(&node);
        assert_eq!(handlers.len(), 3);

        futures::executor::block_on(async {
            for handler in handlers {
                handler(node.clone()).await;
            }
        });
        assert_eq!(*order.lock().unwrap(), vec!["tag+attr+child", "tag+attr", "tag"]);
    }

    #[tokio::test]
    async fn test_dispatch_completes_waiter() {
        let (conn, _rx) = connection();
        let (tx, rx) = oneshot::channel();
        conn.waiters
            .lock()
            .unwrap()
            .insert("abc-1".to_string(), tx);

        conn.dispatch(Node::new("iq").attr("id", "abc-1").attr("type", "result"))
            .await;
        let reply = rx.await.unwrap();
        assert_eq!(reply.get_attr_str("type"), Some("result"));
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_handler() {
        let (conn, _rx) = connection();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        conn.register_route(RouteSelector::tag("receipt"), move |node| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(node.tag);
            })
        });

        conn.dispatch(Node::new("receipt")).await;
        conn.dispatch(Node::new("presence")).await;
        assert_eq!(*seen.lock().unwrap(), vec!["receipt"]);
    }

    #[tokio::test]
    async fn test_stream_error_401_closes_without_reconnect() {
        let (conn, mut rx) = connection();
        conn.dispatch(Node::new("stream:error").attr("code", "401"))
            .await;

        let event = rx.recv().await.unwrap();
        match event {
            Event::Connection(update) => {
                assert_eq!(update.connection, Some(ConnectionState::Close));
                assert_eq!(update.last_disconnect, Some(DisconnectReason::LoggedOut));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(conn.expected_disconnect.load(Ordering::Acquire));
    }

    #[test]
    fn test_classify_reply_error() {
        let reply = Node::new("iq").attr("type", "error").children(vec![
            Node::new("error").attr("code", "429").attr("text", "rate-overlimit"),
        ]);
        match classify_reply(&reply) {
            Err(ConnError::Iq { code, text }) => {
                assert_eq!(code, 429);
                assert_eq!(text, "rate-overlimit");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_next_id_unique_and_tagged() {
        let (conn, _rx) = connection();
        let a = conn.next_id();
        let b = conn.next_id();
        assert_ne!(a, b);
        assert!(a.starts_with(&conn.unique_id));
    }

    #[tokio::test]
    async fn test_query_without_socket_fails_fast() {
        let (conn, _rx) = connection();
        let err = conn
            .query(Node::new("iq"), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnError::NotConnected));
        assert!(conn.waiters.lock().unwrap().is_empty());
    }
}
