//! # Voice Module
//!
//! Sesión de voz por guild: junta las credenciales que llegan por el gateway
//! del chat-platform (token + endpoint + sessionId) y, cuando las tres están,
//! dispara una sola vez el callback de sesión lista para que el player mande
//! el `voiceUpdate` al nodo.
//!
//! La máquina también absorbe los cierres del websocket de voz que el nodo
//! reporta y decide si reconectar, resetear credenciales o darse por
//! desconectada.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::protocol::VoiceServer;
use crate::config::VoiceOptions;
use crate::types::{now_ms, GuildId};

/// Ventana en la que un voice-state del shard cuenta como "reciente" para
/// decidir una reconexión con reset de credenciales.
const SHARD_RECENT_MS: u64 = 10_000;

/// Estado observable de la sesión de voz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceStatus {
    Disconnected,
    Connecting,
    /// Credenciales completas enviadas al nodo; esperando que abra.
    Authenticating,
    Ready,
    Reconnecting,
    /// Reconexión de recuperación tras un cierre 4009/1014.
    Recovering,
    Moving,
    Disconnecting,
    /// El endpoint de voz se perdió; corre el timer de gracia.
    AwaitingEndpoint,
    Destroyed,
}

/// Payload op-4 que el dueño del cluster debe reenviar por su shard.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayVoiceUpdate {
    pub guild_id: GuildId,
    pub channel_id: Option<u64>,
    pub self_deaf: bool,
    pub self_mute: bool,
}

/// Cómo salen los payloads hacia el gateway del chat-platform.
pub type GatewaySender = Arc<dyn Fn(GatewayVoiceUpdate) + Send + Sync>;

/// Callback de sesión lista: se dispara una sola vez por negociación.
pub type SessionReady = Arc<dyn Fn(VoiceServer) + Send + Sync>;

pub struct VoiceSession {
    guild_id: GuildId,
    options: VoiceOptions,
    status: RwLock<VoiceStatus>,
    channel_id: RwLock<Option<u64>>,
    token: RwLock<Option<String>>,
    endpoint: RwLock<Option<String>>,
    session_id: RwLock<Option<String>>,
    /// One-shot: se desarma al disparar el callback y se re-arma en cada
    /// reset de credenciales.
    armed: AtomicBool,
    last_shard_update: RwLock<u64>,
    grace: Mutex<Option<JoinHandle<()>>>,
    gateway: GatewaySender,
    on_ready: SessionReady,
}

impl VoiceSession {
    pub fn new(
        guild_id: GuildId,
        options: VoiceOptions,
        gateway: GatewaySender,
        on_ready: SessionReady,
    ) -> Arc<Self> {
        Arc::new(Self {
            guild_id,
            options,
            status: RwLock::new(VoiceStatus::Disconnected),
            channel_id: RwLock::new(None),
            token: RwLock::new(None),
            endpoint: RwLock::new(None),
            session_id: RwLock::new(None),
            armed: AtomicBool::new(true),
            last_shard_update: RwLock::new(0),
            grace: Mutex::new(None),
            gateway,
            on_ready,
        })
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn status(&self) -> VoiceStatus {
        *self.status.read()
    }

    pub fn channel_id(&self) -> Option<u64> {
        *self.channel_id.read()
    }

    fn set_status(&self, next: VoiceStatus) {
        let mut status = self.status.write();
        if *status != VoiceStatus::Destroyed {
            *status = next;
        }
    }

    fn send_gateway(&self, channel_id: Option<u64>) {
        (self.gateway)(GatewayVoiceUpdate {
            guild_id: self.guild_id,
            channel_id,
            self_deaf: self.options.self_deaf,
            self_mute: self.options.self_mute,
        });
    }

    // ---------------------------------------------------------------
    // Operaciones del player
    // ---------------------------------------------------------------

    /// Pide unirse a un canal. El resto de la negociación llega por el
    /// gateway en forma de server/state updates.
    pub fn connect(&self, channel_id: u64) {
        self.arm();
        *self.channel_id.write() = Some(channel_id);
        self.set_status(VoiceStatus::Connecting);
        info!(guild = %self.guild_id, channel = channel_id, "joining voice channel");
        self.send_gateway(Some(channel_id));
    }

    pub fn disconnect(&self) {
        self.cancel_grace();
        self.set_status(VoiceStatus::Disconnecting);
        self.send_gateway(None);
        self.reset_credentials();
        *self.channel_id.write() = None;
        self.set_status(VoiceStatus::Disconnected);
        info!(guild = %self.guild_id, "left voice channel");
    }

    /// Cambia de canal. No hace nada si ya estamos conectados a ese canal.
    pub fn move_channel(&self, channel_id: u64) {
        if self.channel_id() == Some(channel_id) && self.status() == VoiceStatus::Ready {
            debug!(guild = %self.guild_id, channel = channel_id, "already in target channel");
            return;
        }
        self.arm();
        *self.channel_id.write() = Some(channel_id);
        self.set_status(VoiceStatus::Moving);
        self.send_gateway(Some(channel_id));
    }

    /// Re-pide el canal actual. Sin canal conocido es un no-op.
    pub fn reconnect(&self) {
        let Some(channel_id) = self.channel_id() else {
            warn!(guild = %self.guild_id, "reconnect requested without a known channel");
            return;
        };
        self.arm();
        if self.status() != VoiceStatus::Recovering {
            self.set_status(VoiceStatus::Reconnecting);
        }
        self.send_gateway(Some(channel_id));
    }

    /// Marca la sesión como abierta; lo llama el player cuando el nodo
    /// confirma el `voiceUpdate`.
    pub fn mark_ready(&self) {
        self.set_status(VoiceStatus::Ready);
    }

    pub fn destroy(&self) {
        self.cancel_grace();
        *self.status.write() = VoiceStatus::Destroyed;
    }

    // ---------------------------------------------------------------
    // Entradas del gateway
    // ---------------------------------------------------------------

    /// Voice server update: token + endpoint del servidor de voz asignado.
    ///
    /// Un endpoint nulo significa que el servidor actual se cayó y aún no hay
    /// reemplazo: se arranca el timer de gracia antes de re-pedir el canal.
    pub fn voice_server_update(self: &Arc<Self>, token: Option<String>, endpoint: Option<String>) {
        self.cancel_grace();
        match endpoint {
            Some(endpoint) => {
                if let Some(token) = token {
                    *self.token.write() = Some(token);
                }
                *self.endpoint.write() = Some(endpoint);
                self.try_complete();
            }
            None => {
                *self.endpoint.write() = None;
                self.set_status(VoiceStatus::AwaitingEndpoint);
                self.schedule_grace_reconnect();
            }
        }
    }

    /// Voice state update del propio bot: sessionId y canal real.
    ///
    /// Un canal nulo es una expulsión del servidor; la sesión queda
    /// desconectada y las credenciales se descartan.
    pub fn voice_state_update(self: &Arc<Self>, session_id: Option<String>, channel_id: Option<u64>) {
        *self.last_shard_update.write() = now_ms();
        match channel_id {
            Some(channel) => {
                *self.channel_id.write() = Some(channel);
            }
            None => {
                debug!(guild = %self.guild_id, "voice state cleared by server");
                self.reset_credentials();
                *self.channel_id.write() = None;
                self.set_status(VoiceStatus::Disconnected);
                return;
            }
        }
        if let Some(session) = session_id {
            *self.session_id.write() = Some(session);
        }
        self.try_complete();
    }

    /// El shard del guild volvió a estar disponible. Refresca la marca de
    /// frescura y, si la sesión quedó a medias, re-pide el canal.
    pub fn shard_resumed(&self) {
        *self.last_shard_update.write() = now_ms();
        if matches!(
            self.status(),
            VoiceStatus::Reconnecting | VoiceStatus::Recovering | VoiceStatus::AwaitingEndpoint
        ) {
            self.reconnect();
        }
    }

    /// Cierre del websocket de voz reportado por el nodo.
    pub fn node_socket_closed(self: &Arc<Self>, code: u16, by_remote: bool) {
        match code {
            // Sesión de voz resumible: desconexión completa (credenciales
            // fuera, payload de salida) y recién entonces re-pedir el canal.
            4009 | 1014 if !by_remote => {
                info!(guild = %self.guild_id, code, "voice session recoverable, reconnecting");
                self.set_status(VoiceStatus::Recovering);
                self.reset_credentials();
                self.send_gateway(None);
                self.reconnect();
            }
            // Sesión inválida o canal movido: con canal conocido y un shard
            // que habló hace poco, se renegocia todo en el mismo canal.
            4006 | 4014 => {
                if self.channel_id().is_some() && self.shard_recent() {
                    info!(guild = %self.guild_id, code, "voice credentials stale, renegotiating");
                    self.reset_credentials();
                    self.reconnect();
                } else {
                    self.reset_credentials();
                    self.set_status(VoiceStatus::Disconnected);
                }
            }
            1001 | 1006 if !by_remote => {
                self.set_status(VoiceStatus::Disconnected);
            }
            _ => {
                debug!(guild = %self.guild_id, code, by_remote, "voice socket closed");
            }
        }
    }

    // ---------------------------------------------------------------
    // Internos
    // ---------------------------------------------------------------

    fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    fn shard_recent(&self) -> bool {
        now_ms().saturating_sub(*self.last_shard_update.read()) <= SHARD_RECENT_MS
    }

    /// Descarta las credenciales negociadas y re-arma el one-shot.
    fn reset_credentials(&self) {
        *self.token.write() = None;
        *self.endpoint.write() = None;
        *self.session_id.write() = None;
        self.arm();
    }

    /// Con las tres credenciales presentes, dispara el callback exactamente
    /// una vez por negociación.
    fn try_complete(&self) {
        if !self.armed.load(Ordering::Acquire) {
            return;
        }
        let token = self.token.read().clone();
        let endpoint = self.endpoint.read().clone();
        let session_id = self.session_id.read().clone();
        if let (Some(token), Some(endpoint), Some(session_id)) = (token, endpoint, session_id) {
            if self.armed.swap(false, Ordering::AcqRel) {
                self.set_status(VoiceStatus::Authenticating);
                (self.on_ready)(VoiceServer {
                    token,
                    endpoint,
                    session_id,
                });
            }
        }
    }

    fn schedule_grace_reconnect(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let delay = Duration::from_millis(self.options.reconnect_grace_ms);
        let mut slot = self.grace.lock();
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if session.status() == VoiceStatus::AwaitingEndpoint {
                warn!(guild = %session.guild_id, "voice endpoint not replaced in time, reconnecting");
                session.reconnect();
            }
        }));
    }

    fn cancel_grace(&self) {
        if let Some(handle) = self.grace.lock().take() {
            handle.abort();
        }
    }
}
