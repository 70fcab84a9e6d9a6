//! # Manager Module
//!
//! Registro central del cluster: nodos conectados, un player por guild y el
//! enrutado entre ambos. También es la puerta de entrada de los payloads de
//! voz que llegan por el gateway del chat-platform.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::protocol::{Command, CommandKind};
use crate::config::{ClusterOptions, NodeOptions};
use crate::error::{Error, Result};
use crate::node::connection::{Node, NodeCallbacks, NodeState};
use crate::node::message::ServerMessage;
use crate::player::{CommandSink, Player};
use crate::types::{GuildId, NodeId};
use crate::voice::{GatewaySender, SessionReady, VoiceSession};

pub struct ClusterManager {
    options: ClusterOptions,
    nodes: DashMap<NodeId, Arc<Node>>,
    players: DashMap<GuildId, Arc<Player>>,
    gateway: GatewaySender,
    node_events: broadcast::Sender<(NodeId, NodeState)>,
}

impl ClusterManager {
    /// Construye el cluster y registra los nodos declarados en las opciones.
    /// No abre ninguna conexión; eso lo hace [`connect_all`](Self::connect_all).
    pub fn new(options: ClusterOptions, gateway: GatewaySender) -> Result<Arc<Self>> {
        options.validate()?;
        let (node_events, _) = broadcast::channel(64);
        let manager = Arc::new(Self {
            nodes: DashMap::new(),
            players: DashMap::new(),
            gateway,
            node_events,
            options: options.clone(),
        });
        for node_options in options.nodes {
            manager.add_node(node_options)?;
        }
        Ok(manager)
    }

    // ---------------------------------------------------------------
    // Nodos
    // ---------------------------------------------------------------

    /// Registra un nodo nuevo. El id debe ser único dentro del cluster.
    pub fn add_node(self: &Arc<Self>, options: NodeOptions) -> Result<Arc<Node>> {
        if self.nodes.contains_key(&options.id) {
            return Err(Error::Configuration(format!(
                "duplicate node id {}",
                options.id
            )));
        }
        let weak = Arc::downgrade(self);
        let state_weak = weak.clone();
        let callbacks = NodeCallbacks {
            on_message: Arc::new(move |node_id, message| {
                if let Some(manager) = weak.upgrade() {
                    manager.route_message(node_id, message);
                }
            }),
            on_state: Arc::new(move |node_id, state| {
                if let Some(manager) = state_weak.upgrade() {
                    manager.node_state_changed(node_id, state);
                }
            }),
            on_unknown: Arc::new(|node_id, frame| {
                debug!(node = node_id, %frame, "unknown frame from node");
            }),
        };
        let node = Node::new(options, self.options.user_id, callbacks)?;
        info!(node = node.id(), "node registered");
        self.nodes.insert(node.id(), Arc::clone(&node));
        Ok(node)
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Abre la conexión de todos los nodos registrados.
    pub fn connect_all(&self) {
        for entry in self.nodes.iter() {
            entry.value().connect();
        }
    }

    /// Nodo conectado con menor carga de audio. Nodos sin stats (o con stats
    /// corruptas) ordenan al final.
    pub fn select_node(&self) -> Option<Arc<Node>> {
        self.nodes
            .iter()
            .filter(|entry| entry.value().connected())
            .min_by(|a, b| a.value().cpu_load().total_cmp(&b.value().cpu_load()))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Re-emisión de los cambios de estado de todos los nodos del pool.
    pub fn subscribe_nodes(&self) -> broadcast::Receiver<(NodeId, NodeState)> {
        self.node_events.subscribe()
    }

    fn node_state_changed(&self, node_id: NodeId, state: NodeState) {
        debug!(node = node_id, ?state, "node state changed");
        let _ = self.node_events.send((node_id, state));
    }

    fn route_message(&self, node_id: NodeId, message: ServerMessage) {
        let guild_id = match &message {
            ServerMessage::PlayerUpdate { guild_id, .. } => *guild_id,
            ServerMessage::Event(event) => event.guild_id(),
            _ => return,
        };
        match self.players.get(&guild_id) {
            Some(player) => player.handle_message(message),
            None => {
                debug!(node = node_id, guild = %guild_id, "message for unknown player dropped");
            }
        }
    }

    // ---------------------------------------------------------------
    // Players
    // ---------------------------------------------------------------

    /// Crea (o devuelve) el player del guild, ligado al nodo menos cargado.
    /// Sin nodos conectados falla de inmediato, sin efectos.
    pub fn create_player(self: &Arc<Self>, guild_id: GuildId) -> Result<Arc<Player>> {
        if let Some(existing) = self.players.get(&guild_id) {
            return Ok(Arc::clone(existing.value()));
        }
        let node = self
            .select_node()
            .ok_or_else(|| Error::NodeUnavailable("no connected nodes in the cluster".into()))?;

        // El callback de sesión lista manda el voiceUpdate al nodo y marca la
        // sesión como abierta cuando el envío sale bien.
        let session_slot: Arc<RwLock<Option<Weak<VoiceSession>>>> = Arc::new(RwLock::new(None));
        let on_ready: SessionReady = {
            let node = Arc::clone(&node);
            let slot = Arc::clone(&session_slot);
            Arc::new(move |server| {
                let node = Arc::clone(&node);
                let slot = Arc::clone(&slot);
                tokio::spawn(async move {
                    let result = node
                        .protocol()
                        .dispatch(Command {
                            guild_id,
                            kind: CommandKind::VoiceUpdate(server),
                        })
                        .await;
                    match result {
                        Ok(()) => {
                            if let Some(session) = slot.read().as_ref().and_then(Weak::upgrade) {
                                session.mark_ready();
                            }
                        }
                        Err(err) => {
                            warn!(guild = %guild_id, error = %err, "voice update failed");
                        }
                    }
                });
            })
        };
        let voice = VoiceSession::new(guild_id, self.options.voice, self.gateway.clone(), on_ready);
        *session_slot.write() = Some(Arc::downgrade(&voice));

        let node_id = node.id();
        let sink: Arc<dyn CommandSink> = node;
        let player = Player::new(guild_id, node_id, sink, voice);
        info!(guild = %guild_id, "player created");
        self.players.insert(guild_id, Arc::clone(&player));
        Ok(player)
    }

    pub fn get_player(&self, guild_id: GuildId) -> Option<Arc<Player>> {
        self.players
            .get(&guild_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Saca el player del registro sin tocar el lado remoto. Para limpiar
    /// también el nodo, usar [`destroy_player`](Self::destroy_player).
    pub fn remove_player(&self, guild_id: GuildId) -> Option<Arc<Player>> {
        self.players.remove(&guild_id).map(|(_, player)| player)
    }

    /// Destruye el player local y remotamente y lo saca del registro.
    pub async fn destroy_player(&self, guild_id: GuildId) -> Result<()> {
        if let Some(player) = self.remove_player(guild_id) {
            player.destroy().await?;
        }
        Ok(())
    }

    /// Apaga el cluster: destruye todos los players y cierra todos los nodos.
    pub async fn shutdown(&self) {
        let guilds: Vec<GuildId> = self.players.iter().map(|entry| *entry.key()).collect();
        for guild_id in guilds {
            if let Err(err) = self.destroy_player(guild_id).await {
                warn!(guild = %guild_id, error = %err, "player teardown failed");
            }
        }
        for entry in self.nodes.iter() {
            entry.value().destroy();
        }
        info!("cluster shut down");
    }

    // ---------------------------------------------------------------
    // Entradas del gateway de voz
    // ---------------------------------------------------------------

    /// VOICE_SERVER_UPDATE del chat-platform.
    pub fn voice_server_update(
        &self,
        guild_id: GuildId,
        token: Option<String>,
        endpoint: Option<String>,
    ) {
        if let Some(player) = self.get_player(guild_id) {
            player.voice().voice_server_update(token, endpoint);
        } else {
            debug!(guild = %guild_id, "voice server update for unknown guild");
        }
    }

    /// VOICE_STATE_UPDATE del chat-platform. Solo interesa el estado del
    /// propio bot; los de otros usuarios se descartan.
    pub fn voice_state_update(
        &self,
        guild_id: GuildId,
        user_id: u64,
        session_id: Option<String>,
        channel_id: Option<u64>,
    ) {
        if user_id != self.options.user_id {
            return;
        }
        if let Some(player) = self.get_player(guild_id) {
            player.voice().voice_state_update(session_id, channel_id);
        }
    }

    /// Aviso de que un shard se reconectó. Las sesiones de voz de los guilds
    /// afectados refrescan su marca de frescura y reintentan si quedaron a
    /// medias.
    pub fn shard_voice(&self, guild_ids: &[GuildId]) {
        for guild_id in guild_ids {
            if let Some(player) = self.get_player(*guild_id) {
                player.voice().shard_resumed();
            }
        }
    }

    /// Entrada cruda para quien reenvía los dispatches del shard sin
    /// desarmarlos. Reconoce los dos eventos de voz y deja pasar el resto.
    pub fn handle_gateway_dispatch(&self, event: &str, data: &Value) {
        let Some(guild_id) = data
            .get("guild_id")
            .and_then(parse_snowflake)
            .map(GuildId)
        else {
            return;
        };
        match event {
            "VOICE_SERVER_UPDATE" => {
                let token = data.get("token").and_then(Value::as_str).map(String::from);
                let endpoint = data
                    .get("endpoint")
                    .and_then(Value::as_str)
                    .map(String::from);
                self.voice_server_update(guild_id, token, endpoint);
            }
            "VOICE_STATE_UPDATE" => {
                let Some(user_id) = data.get("user_id").and_then(parse_snowflake) else {
                    return;
                };
                let session_id = data
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(String::from);
                let channel_id = data.get("channel_id").and_then(parse_snowflake);
                self.voice_state_update(guild_id, user_id, session_id, channel_id);
            }
            _ => {}
        }
    }
}

/// Snowflakes llegan como string o como número según la librería de gateway.
fn parse_snowflake(value: &Value) -> Option<u64> {
    match value {
        Value::String(text) => text.parse().ok(),
        Value::Number(number) => number.as_u64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options() -> ClusterOptions {
        ClusterOptions {
            user_id: 81,
            nodes: vec![NodeOptions {
                id: 1,
                host: "localhost".into(),
                port: Some(2333),
                password: "youshallnotpass".into(),
                ..NodeOptions::default()
            }],
            ..ClusterOptions::default()
        }
    }

    fn manager() -> Arc<ClusterManager> {
        ClusterManager::new(options(), Arc::new(|_| {})).unwrap()
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let manager = manager();
        let result = manager.add_node(NodeOptions {
            id: 1,
            host: "other".into(),
            password: "pw".into(),
            ..NodeOptions::default()
        });
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(manager.node_count(), 1);
    }

    #[test]
    fn create_player_fails_fast_without_connected_nodes() {
        let manager = manager();
        let result = manager.create_player(GuildId(42));
        assert!(matches!(result, Err(Error::NodeUnavailable(_))));
        assert_eq!(manager.player_count(), 0);
    }

    #[test]
    fn select_node_is_none_when_nothing_is_connected() {
        let manager = manager();
        assert!(manager.select_node().is_none());
    }

    #[test]
    fn gateway_dispatch_tolerates_unknown_guilds_and_events() {
        let manager = manager();
        manager.handle_gateway_dispatch(
            "VOICE_SERVER_UPDATE",
            &json!({"guild_id": "42", "token": "t", "endpoint": "e"}),
        );
        manager.handle_gateway_dispatch("PRESENCE_UPDATE", &json!({"guild_id": "42"}));
        manager.handle_gateway_dispatch("VOICE_STATE_UPDATE", &json!({}));
    }

    #[test]
    fn parses_snowflakes_in_both_shapes() {
        assert_eq!(parse_snowflake(&json!("123")), Some(123));
        assert_eq!(parse_snowflake(&json!(123)), Some(123));
        assert_eq!(parse_snowflake(&json!(null)), None);
    }

    #[test]
    fn remove_player_is_registry_only() {
        let manager = manager();
        assert!(manager.remove_player(GuildId(42)).is_none());
    }

    #[test]
    fn invalid_cluster_options_refuse_to_build() {
        let result = ClusterManager::new(ClusterOptions::default(), Arc::new(|_| {}));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
