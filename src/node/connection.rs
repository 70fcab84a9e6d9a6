//! Socket del nodo: handshake, keep-alive y reconexión.
//!
//! El socket es el canal de diagnóstico del nodo (eventos, stats, estado de
//! players) y, en modo legacy, también el canal de comandos. La conexión se
//! mantiene sola: backoff acumulativo con tope, tandas de reintentos y
//! fallback de versión cuando el handshake devuelve 404.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::protocol::{Credentials, ProtocolClient, SocketSender};
use crate::api::routes::RouteTable;
use crate::api::version::Version;
use crate::config::NodeOptions;
use crate::error::{Error, Result};
use crate::node::message::{OutboundFrame, ServerMessage};
use crate::types::{now_ms, NodeId, NodeStats};

/// Tope del backoff acumulativo y de la sonda de keep-alive.
const BACKOFF_CAP_MS: u64 = 15_000;
const KEEPALIVE_PROBE_MS: u64 = 15_000;

/// Estado observable de la conexión.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
    Destroyed,
}

/// Hooks que el dueño del nodo registra para enrutar mensajes y cambios de
/// estado. Por defecto no hacen nada.
#[derive(Clone)]
pub struct NodeCallbacks {
    pub on_message: Arc<dyn Fn(NodeId, ServerMessage) + Send + Sync>,
    pub on_state: Arc<dyn Fn(NodeId, NodeState) + Send + Sync>,
    /// Frames que el wire no reconoce, crudos, para diagnóstico.
    pub on_unknown: Arc<dyn Fn(NodeId, String) + Send + Sync>,
}

impl Default for NodeCallbacks {
    fn default() -> Self {
        Self {
            on_message: Arc::new(|_, _| {}),
            on_state: Arc::new(|_, _| {}),
            on_unknown: Arc::new(|_, _| {}),
        }
    }
}

/// Cómo terminó una sesión de socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionExit {
    /// Cierre limpio (1000): no se reintenta.
    Clean,
    /// Destroy local.
    Destroyed,
    /// El nodo pidió re-marcar de inmediato (1003) o hubo fallback de
    /// versión; no consume reintento.
    Redial,
    /// Caída con derecho a backoff. `opened` indica si el socket llegó a
    /// abrirse, lo que reinicia la tanda.
    Dropped { opened: bool },
}

/// Un nodo de audio remoto y su conexión de socket.
pub struct Node {
    options: NodeOptions,
    credentials: Credentials,
    protocol: Arc<ProtocolClient>,
    version: RwLock<Version>,
    state: Arc<RwLock<NodeState>>,
    session_id: Arc<RwLock<Option<String>>>,
    stats: RwLock<Option<NodeStats>>,
    latency_ms: RwLock<Option<f64>>,
    last_ping: Arc<RwLock<Option<u64>>>,
    writer: Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    runner: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    callbacks: NodeCallbacks,
}

impl Node {
    pub fn new(options: NodeOptions, user_id: u64, callbacks: NodeCallbacks) -> Result<Arc<Self>> {
        options.validate()?;
        let credentials = Credentials::new(options.password.clone(), user_id);
        let session_id: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));
        let writer: Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>> =
            Arc::new(RwLock::new(None));
        let state = Arc::new(RwLock::new(NodeState::Idle));

        // Canal de comandos legacy: serializa el frame y lo empuja a la
        // tarea escritora. Falla rápido si el socket no está abierto.
        let socket: SocketSender = {
            let writer = Arc::clone(&writer);
            let state = Arc::clone(&state);
            Arc::new(move |frame: OutboundFrame| {
                if *state.read() != NodeState::Open {
                    return Err(Error::NodeUnavailable("socket is not open".into()));
                }
                let json =
                    serde_json::to_string(&frame).map_err(|err| Error::Protocol(err.to_string()))?;
                match writer.read().as_ref() {
                    Some(tx) => tx
                        .send(Message::text(json))
                        .map_err(|_| Error::NodeUnavailable("socket writer closed".into())),
                    None => Err(Error::NodeUnavailable("socket is not open".into())),
                }
            })
        };

        let table = RouteTable::for_version(
            options.version,
            options.secure,
            &options.host,
            options.port,
        );
        let protocol = Arc::new(ProtocolClient::new(
            table,
            credentials.clone(),
            Arc::clone(&session_id),
            socket,
        ));

        Ok(Arc::new(Self {
            version: RwLock::new(options.version),
            options,
            credentials,
            protocol,
            state,
            session_id,
            stats: RwLock::new(None),
            latency_ms: RwLock::new(None),
            last_ping: Arc::new(RwLock::new(None)),
            writer,
            keepalive: Mutex::new(None),
            runner: Mutex::new(None),
            cancel: CancellationToken::new(),
            callbacks,
        }))
    }

    pub fn id(&self) -> NodeId {
        self.options.id
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn protocol(&self) -> &Arc<ProtocolClient> {
        &self.protocol
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn connected(&self) -> bool {
        self.state() == NodeState::Open
    }

    pub fn version(&self) -> Version {
        *self.version.read()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    /// Último reporte de stats del nodo, si hubo alguno.
    pub fn stats(&self) -> Option<NodeStats> {
        self.stats.read().clone()
    }

    /// Latencia del último ciclo ping/pong, en milisegundos.
    pub fn latency_ms(&self) -> Option<f64> {
        *self.latency_ms.read()
    }

    /// Carga del proceso de audio; sin stats (o con stats corruptas) el nodo
    /// ordena al final en la selección.
    pub fn cpu_load(&self) -> f64 {
        match self.stats.read().as_ref().map(|s| s.cpu.lavalink_load) {
            Some(load) if load.is_finite() => load,
            _ => f64::INFINITY,
        }
    }

    fn is_destroyed(&self) -> bool {
        self.state() == NodeState::Destroyed
    }

    fn set_state(&self, next: NodeState) {
        let changed = {
            let mut state = self.state.write();
            if *state == NodeState::Destroyed || *state == next {
                false
            } else {
                *state = next;
                true
            }
        };
        if changed {
            (self.callbacks.on_state)(self.options.id, next);
        }
    }

    /// Arranca (o re-arranca) la tarea de conexión. Inofensivo si ya hay una
    /// corriendo o si el nodo fue destruido.
    pub fn connect(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        let mut runner = self.runner.lock();
        if runner.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let node = Arc::clone(self);
        *runner = Some(tokio::spawn(async move {
            node.run().await;
        }));
    }

    /// Cierra el socket con 1001 y deja el nodo inutilizable. Idempotente.
    pub fn destroy(&self) {
        {
            let mut state = self.state.write();
            if *state == NodeState::Destroyed {
                return;
            }
            *state = NodeState::Destroyed;
        }
        (self.callbacks.on_state)(self.options.id, NodeState::Destroyed);
        self.cancel.cancel();
        self.stop_keepalive();
        *self.session_id.write() = None;
        info!(node = self.options.id, "node destroyed");
    }

    async fn run(self: Arc<Self>) {
        let base = self.options.reconnect_delay_ms;
        let mut fallback_used = false;
        'waves: for wave in 0..self.options.reconnect_waves {
            let mut retries = 0u32;
            let mut acc = 0u64;
            loop {
                if self.is_destroyed() {
                    return;
                }
                self.set_state(if wave == 0 && retries == 0 {
                    NodeState::Connecting
                } else {
                    NodeState::Reconnecting
                });
                match self.dial(&mut fallback_used).await {
                    SessionExit::Clean => {
                        info!(node = self.options.id, "node closed cleanly");
                        self.set_state(NodeState::Closed);
                        return;
                    }
                    SessionExit::Destroyed => return,
                    SessionExit::Redial => continue,
                    SessionExit::Dropped { opened } => {
                        if opened {
                            // Una sesión que llegó a abrirse reinicia la tanda.
                            retries = 0;
                            acc = 0;
                        }
                        retries += 1;
                        if retries > self.options.max_reconnect {
                            warn!(
                                node = self.options.id,
                                wave, "retry budget exhausted for this wave"
                            );
                            continue 'waves;
                        }
                        acc = backoff(acc, base);
                        debug!(node = self.options.id, delay_ms = acc, retries, "reconnect backoff");
                        tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_millis(acc)) => {}
                        }
                    }
                }
            }
        }
        warn!(node = self.options.id, "❌ all reconnect waves exhausted, giving up");
        self.set_state(NodeState::Closed);
    }

    async fn dial(&self, fallback_used: &mut bool) -> SessionExit {
        let url = self.ws_url();
        debug!(node = self.options.id, "dialing node socket");
        let request = match self.handshake_request(&url) {
            Ok(request) => request,
            Err(err) => {
                error!(node = self.options.id, error = %err, "cannot build handshake request");
                return SessionExit::Dropped { opened: false };
            }
        };
        let connect = tokio::select! {
            _ = self.cancel.cancelled() => return SessionExit::Destroyed,
            result = connect_async(request) => result,
        };
        let (ws, response) = match connect {
            Ok(pair) => pair,
            // Ruta de ws equivocada para la generación real: el 404 trae los
            // headers de versión, re-ligamos y marcamos una sola vez más.
            Err(WsError::Http(response))
                if response.status() == StatusCode::NOT_FOUND && !*fallback_used =>
            {
                *fallback_used = true;
                let detected = Version::from_headers(response.headers());
                info!(
                    node = self.options.id,
                    version = %detected,
                    "handshake returned 404, rebinding to advertised version"
                );
                self.bind_version(detected);
                return SessionExit::Redial;
            }
            Err(err) => {
                warn!(node = self.options.id, error = %err, "node handshake failed");
                return SessionExit::Dropped { opened: false };
            }
        };

        if self.options.version == Version::Auto {
            let detected = Version::from_headers(response.headers());
            if detected != *self.version.read() {
                self.bind_version(detected);
            }
        }
        self.read_loop(ws).await
    }

    fn bind_version(&self, version: Version) {
        *self.version.write() = version;
        self.protocol.rebind(RouteTable::for_version(
            version,
            self.options.secure,
            &self.options.host,
            self.options.port,
        ));
    }

    fn ws_url(&self) -> String {
        let scheme = if self.options.secure { "wss" } else { "ws" };
        let port = match self.options.port {
            Some(port) => format!(":{port}"),
            None => String::new(),
        };
        let path = self.version.read().ws_path();
        if path.is_empty() {
            format!("{scheme}://{}{port}", self.options.host)
        } else {
            format!("{scheme}://{}{port}/{path}", self.options.host)
        }
    }

    fn handshake_request(&self, url: &str) -> Result<Request> {
        let mut request = url
            .into_client_request()
            .map_err(|err| Error::Connection(err.to_string()))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", header_value(&self.credentials.password)?);
        headers.insert("User-Id", header_value(&self.credentials.user_id.to_string())?);
        headers.insert("Client-Name", header_value(&self.credentials.client_name)?);
        if let Some(session) = self.session_id.read().as_deref() {
            headers.insert("Session-Id", header_value(session)?);
        }
        Ok(request)
    }

    async fn read_loop(&self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> SessionExit {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.writer.write() = Some(tx);
        self.set_state(NodeState::Open);
        info!(node = self.options.id, version = %self.version(), "🎵 node socket open");

        let exit = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let frame = CloseFrame { code: CloseCode::Away, reason: "".into() };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break SessionExit::Destroyed;
                }
                outbound = rx.recv() => match outbound {
                    Some(message) => {
                        if let Err(err) = sink.send(message).await {
                            warn!(node = self.options.id, error = %err, "socket write failed");
                            break SessionExit::Dropped { opened: true };
                        }
                    }
                    None => break SessionExit::Dropped { opened: true },
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1006);
                        debug!(node = self.options.id, code, "socket closed by node");
                        break classify_close(code);
                    }
                    // Ping/pong de nivel websocket los contesta tungstenite.
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(node = self.options.id, error = %err, "socket read failed");
                        break SessionExit::Dropped { opened: true };
                    }
                    None => break SessionExit::Dropped { opened: true },
                },
            }
        };

        *self.writer.write() = None;
        self.stop_keepalive();
        exit
    }

    fn handle_text(&self, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                // Frames de forks desconocidos no tiran el socket; se entregan
                // crudos al suscriptor de diagnóstico.
                debug!(node = self.options.id, error = %err, "unrecognized frame");
                (self.callbacks.on_unknown)(self.options.id, text.to_string());
                return;
            }
        };
        match &message {
            ServerMessage::Ready { session_id, resumed } => {
                if let Some(id) = session_id {
                    *self.session_id.write() = Some(id.clone());
                }
                info!(node = self.options.id, resumed = *resumed, "node session ready");
                if !*resumed {
                    self.configure_resuming();
                }
            }
            ServerMessage::Stats(stats) => {
                *self.stats.write() = Some(stats.clone());
            }
            ServerMessage::Ping { timestamp } => {
                self.schedule_keepalive(*timestamp);
                return;
            }
            ServerMessage::Pong { timestamp } => {
                if let Some(sent) = timestamp.or(*self.last_ping.read()) {
                    *self.latency_ms.write() = Some(now_ms().saturating_sub(sent) as f64);
                }
                return;
            }
            _ => {}
        }
        (self.callbacks.on_message)(self.options.id, message);
    }

    /// Pide al nodo que retenga la sesión para un resume, si está habilitado
    /// y la generación tiene el endpoint.
    fn configure_resuming(&self) {
        let Some(timeout) = self.options.resume_timeout_s else {
            return;
        };
        let Some(session) = self.session_id.read().clone() else {
            return;
        };
        let protocol = Arc::clone(&self.protocol);
        let node_id = self.options.id;
        tokio::spawn(async move {
            match protocol.update_session(&session, true, timeout).await {
                Ok(()) => debug!(node = node_id, timeout, "session resuming configured"),
                Err(Error::NotSupported { .. }) => {
                    debug!(node = node_id, "backend has no session-update endpoint");
                }
                Err(err) => warn!(node = node_id, error = %err, "configure resuming failed"),
            }
        });
    }

    /// Programa el próximo ping saliente. Nunca hay más de un timer en vuelo.
    fn schedule_keepalive(&self, timestamp: Option<u64>) {
        let delay = keepalive_delay(timestamp, now_ms());
        let writer = Arc::clone(&self.writer);
        let last_ping = Arc::clone(&self.last_ping);
        let mut slot = self.keepalive.lock();
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let sent = now_ms();
            let frame = OutboundFrame::Ping { timestamp: sent };
            let Ok(json) = serde_json::to_string(&frame) else {
                return;
            };
            if let Some(tx) = writer.read().as_ref() {
                if tx.send(Message::text(json)).is_ok() {
                    *last_ping.write() = Some(sent);
                }
            }
        }));
    }

    fn stop_keepalive(&self) {
        if let Some(handle) = self.keepalive.lock().take() {
            handle.abort();
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| Error::Configuration("header value contains invalid characters".into()))
}

/// Backoff acumulativo: cada intento suma el incremento base, con tope.
fn backoff(acc: u64, base: u64) -> u64 {
    (acc + base).min(BACKOFF_CAP_MS)
}

/// Retardo hasta el próximo ping. Un timestamp vencido o ausente degrada a
/// una sonda fija.
fn keepalive_delay(timestamp: Option<u64>, now: u64) -> Duration {
    match timestamp {
        Some(ts) if ts > now => Duration::from_millis(ts - now),
        _ => Duration::from_millis(KEEPALIVE_PROBE_MS),
    }
}

fn classify_close(code: u16) -> SessionExit {
    match code {
        1000 => SessionExit::Clean,
        1003 => SessionExit::Redial,
        _ => SessionExit::Dropped { opened: true },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn options() -> NodeOptions {
        NodeOptions {
            id: 1,
            host: "localhost".into(),
            port: Some(2333),
            password: "youshallnotpass".into(),
            ..NodeOptions::default()
        }
    }

    #[test]
    fn backoff_accumulates_and_caps() {
        let mut acc = 0;
        let mut observed = Vec::new();
        for _ in 0..20 {
            acc = backoff(acc, 1_000);
            observed.push(acc);
        }
        assert_eq!(&observed[..5], &[1_000, 2_000, 3_000, 4_000, 5_000]);
        assert_eq!(observed[14], 15_000);
        assert_eq!(observed[19], 15_000);
    }

    #[test]
    fn keepalive_delay_follows_the_timestamp() {
        assert_eq!(
            keepalive_delay(Some(10_500), 10_000),
            Duration::from_millis(500)
        );
        // Vencido o ausente: sonda de 15s.
        assert_eq!(
            keepalive_delay(Some(9_000), 10_000),
            Duration::from_millis(15_000)
        );
        assert_eq!(keepalive_delay(None, 10_000), Duration::from_millis(15_000));
    }

    #[test]
    fn close_codes_drive_the_retry_policy() {
        assert_eq!(classify_close(1000), SessionExit::Clean);
        assert_eq!(classify_close(1003), SessionExit::Redial);
        assert_eq!(classify_close(1006), SessionExit::Dropped { opened: true });
        assert_eq!(classify_close(4000), SessionExit::Dropped { opened: true });
    }

    #[test]
    fn destroy_is_idempotent() {
        let node = Node::new(options(), 81, NodeCallbacks::default()).unwrap();
        node.destroy();
        node.destroy();
        assert_eq!(node.state(), NodeState::Destroyed);
    }

    #[test]
    fn ws_url_tracks_the_bound_version() {
        let node = Node::new(
            NodeOptions {
                version: Version::V4,
                secure: true,
                ..options()
            },
            81,
            NodeCallbacks::default(),
        )
        .unwrap();
        assert_eq!(node.ws_url(), "wss://localhost:2333/v4/websocket");
        node.bind_version(Version::V2);
        assert_eq!(node.ws_url(), "wss://localhost:2333");
    }

    #[test]
    fn commands_fail_fast_without_an_open_socket() {
        use crate::api::protocol::{Command, CommandKind};
        use crate::types::GuildId;

        let node = Node::new(options(), 81, NodeCallbacks::default()).unwrap();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let result = rt.block_on(node.protocol().dispatch(Command {
            guild_id: GuildId(42),
            kind: CommandKind::Pause(true),
        }));
        assert!(matches!(result, Err(Error::NodeUnavailable(_))));
    }

    #[test]
    fn nodes_without_stats_sort_last() {
        let node = Node::new(options(), 81, NodeCallbacks::default()).unwrap();
        assert_eq!(node.cpu_load(), f64::INFINITY);
    }

    #[test]
    fn invalid_options_refuse_to_build() {
        let result = Node::new(
            NodeOptions {
                host: String::new(),
                ..options()
            },
            81,
            NodeCallbacks::default(),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
