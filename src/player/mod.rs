//! # Player Module
//!
//! Un player por guild. Mantiene la vista local del estado remoto (track,
//! pausa, volumen, filtros) y estima la posición de reproducción entre los
//! reportes periódicos del nodo con un anclaje de reloj local.
//!
//! Los comandos validan sus parámetros antes de tocar la red: si algo está
//! fuera de rango se devuelven *todos* los campos ofensores de una vez y el
//! estado previo queda intacto.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::api::protocol::{Command, CommandKind};
use crate::error::{Error, Result};
use crate::node::connection::Node;
use crate::node::message::{NodeEvent, PlayerUpdateState, ServerMessage};
use crate::types::{
    now_ms, EqualizerBand, Filters, GuildId, NodeId, Track, TrackEndReason, TrackException,
    EQUALIZER_BANDS,
};
use crate::voice::{VoiceSession, VoiceStatus};

/// Por dónde salen los comandos del player. El nodo real los manda por REST
/// o socket según la generación; los tests inyectan un doble.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandSink: Send + Sync {
    fn available(&self) -> bool;
    async fn dispatch(&self, command: Command) -> Result<()>;
}

#[async_trait]
impl CommandSink for Node {
    fn available(&self) -> bool {
        self.connected()
    }

    async fn dispatch(&self, command: Command) -> Result<()> {
        self.protocol().dispatch(command).await
    }
}

/// Opciones de `play`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayOptions {
    /// Posición inicial en ms.
    pub start_time: Option<f64>,
    /// Corte anticipado en ms.
    pub end_time: Option<f64>,
    /// No pisar el track actual si ya hay uno sonando.
    pub no_replace: bool,
    pub user_data: Option<serde_json::Value>,
}

/// Anclaje de posición: posición conocida + momento en que se conoció.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PositionAnchor {
    Idle,
    /// Avanza con el reloj local desde `epoch_ms`.
    Playing {
        epoch_ms: u64,
        offset_ms: u64,
        length_ms: Option<u64>,
    },
    /// Congelado mientras el player está en pausa.
    Frozen { position_ms: u64 },
}

impl PositionAnchor {
    fn position_at(self, now: u64) -> u64 {
        match self {
            PositionAnchor::Idle => 0,
            PositionAnchor::Frozen { position_ms } => position_ms,
            PositionAnchor::Playing {
                epoch_ms,
                offset_ms,
                length_ms,
            } => {
                let position = offset_ms + now.saturating_sub(epoch_ms);
                match length_ms {
                    Some(length) => position.min(length),
                    None => position,
                }
            }
        }
    }
}

/// Eventos que el player re-publica a sus suscriptores.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    TrackStart {
        track: Option<Track>,
    },
    TrackEnd {
        track: Option<Track>,
        reason: TrackEndReason,
        may_start_next: bool,
    },
    TrackException {
        track: Option<Track>,
        exception: Option<TrackException>,
    },
    TrackStuck {
        track: Option<Track>,
        threshold_ms: Option<u64>,
    },
    VoiceClosed {
        code: u16,
        reason: Option<String>,
        by_remote: bool,
    },
    PositionUpdate {
        position_ms: u64,
    },
}

/// Instantánea del estado local del player.
#[derive(Debug, Clone)]
pub struct PlayerSnapshot {
    pub guild_id: GuildId,
    pub node_id: NodeId,
    pub track: Option<Track>,
    pub paused: bool,
    pub volume: f64,
    pub position_ms: u64,
    pub filters: Filters,
    pub connected: bool,
    pub ping_ms: Option<f64>,
    /// Aún no llegó el primer reporte de posición tras un play/seek.
    pub awaiting_sync: bool,
    pub voice: VoiceStatus,
}

struct Internals {
    track: Option<Track>,
    paused: bool,
    volume: f64,
    filters: Filters,
    anchor: PositionAnchor,
    awaiting_sync: bool,
    connected: bool,
    ping_ms: Option<f64>,
}

pub struct Player {
    guild_id: GuildId,
    node_id: NodeId,
    sink: Arc<dyn CommandSink>,
    voice: Arc<VoiceSession>,
    internals: RwLock<Internals>,
    events: broadcast::Sender<PlayerEvent>,
}

impl Player {
    pub fn new(
        guild_id: GuildId,
        node_id: NodeId,
        sink: Arc<dyn CommandSink>,
        voice: Arc<VoiceSession>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            guild_id,
            node_id,
            sink,
            voice,
            internals: RwLock::new(Internals {
                track: None,
                paused: false,
                volume: 100.0,
                filters: Filters::default(),
                anchor: PositionAnchor::Idle,
                awaiting_sync: false,
                connected: false,
                ping_ms: None,
            }),
            events,
        })
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Id del nodo al que está ligado este player.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn voice(&self) -> &Arc<VoiceSession> {
        &self.voice
    }

    /// Posición estimada de reproducción, en ms.
    pub fn position_ms(&self) -> u64 {
        self.internals.read().anchor.position_at(now_ms())
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        let internals = self.internals.read();
        PlayerSnapshot {
            guild_id: self.guild_id,
            node_id: self.node_id,
            track: internals.track.clone(),
            paused: internals.paused,
            volume: internals.volume,
            position_ms: internals.anchor.position_at(now_ms()),
            filters: internals.filters.clone(),
            connected: internals.connected,
            ping_ms: internals.ping_ms,
            awaiting_sync: internals.awaiting_sync,
            voice: self.voice.status(),
        }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.sink.available() {
            Ok(())
        } else {
            Err(Error::NodeUnavailable(format!(
                "node for guild {} is not connected",
                self.guild_id
            )))
        }
    }

    async fn send(&self, kind: CommandKind) -> Result<()> {
        self.sink
            .dispatch(Command {
                guild_id: self.guild_id,
                kind,
            })
            .await
    }

    // ---------------------------------------------------------------
    // Comandos
    // ---------------------------------------------------------------

    pub async fn play(&self, track: Track, options: PlayOptions) -> Result<()> {
        self.ensure_available()?;
        let encoded = track.encoded.clone().ok_or_else(|| {
            Error::validation(vec!["track: missing encoded payload".into()])
        })?;
        let length_ms = track.length();
        self.send(CommandKind::Play {
            encoded,
            user_data: options.user_data.clone(),
            start_time: options.start_time,
            end_time: options.end_time,
            no_replace: options.no_replace.then_some(true),
        })
        .await?;

        let mut internals = self.internals.write();
        let offset = options.start_time.unwrap_or(0.0).max(0.0) as u64;
        internals.anchor = PositionAnchor::Playing {
            epoch_ms: now_ms(),
            offset_ms: offset,
            length_ms: (length_ms > 0).then_some(length_ms),
        };
        internals.track = Some(track);
        internals.paused = false;
        internals.awaiting_sync = true;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.ensure_available()?;
        self.send(CommandKind::Stop).await?;
        let mut internals = self.internals.write();
        internals.track = None;
        internals.anchor = PositionAnchor::Idle;
        internals.awaiting_sync = false;
        Ok(())
    }

    pub async fn pause(&self, pause: bool) -> Result<()> {
        self.ensure_available()?;
        self.send(CommandKind::Pause(pause)).await?;
        let now = now_ms();
        let mut internals = self.internals.write();
        if pause && !internals.paused {
            internals.anchor = PositionAnchor::Frozen {
                position_ms: internals.anchor.position_at(now),
            };
        } else if !pause && internals.paused {
            let position = internals.anchor.position_at(now);
            let length_ms = internals.track.as_ref().map(Track::length).filter(|l| *l > 0);
            internals.anchor = PositionAnchor::Playing {
                epoch_ms: now,
                offset_ms: position,
                length_ms,
            };
        }
        internals.paused = pause;
        Ok(())
    }

    pub async fn seek(&self, position_ms: f64) -> Result<()> {
        self.ensure_available()?;
        self.send(CommandKind::Seek(position_ms)).await?;
        let position = position_ms.max(0.0) as u64;
        let mut internals = self.internals.write();
        if internals.paused {
            // En pausa la posición queda congelada en el destino del seek.
            internals.anchor = PositionAnchor::Frozen {
                position_ms: position,
            };
        } else {
            let length_ms = internals.track.as_ref().map(Track::length).filter(|l| *l > 0);
            internals.anchor = PositionAnchor::Playing {
                epoch_ms: now_ms(),
                offset_ms: position,
                length_ms,
            };
        }
        internals.awaiting_sync = true;
        Ok(())
    }

    pub async fn set_volume(&self, volume: f64) -> Result<()> {
        self.ensure_available()?;
        self.send(CommandKind::SetVolume(volume)).await?;
        self.internals.write().volume = volume.max(0.0);
        Ok(())
    }

    pub async fn set_equalizer(&self, bands: Vec<EqualizerBand>) -> Result<()> {
        validate_equalizer(&bands)?;
        self.ensure_available()?;
        self.send(CommandKind::SetEqualizer(bands.clone())).await?;
        self.internals.write().filters.equalizer = Some(bands);
        Ok(())
    }

    pub async fn set_filters(&self, filters: Filters) -> Result<()> {
        validate_filters(&filters)?;
        self.ensure_available()?;
        self.send(CommandKind::SetFilters(filters.clone())).await?;
        self.internals.write().filters = filters;
        Ok(())
    }

    pub fn filters(&self) -> Filters {
        self.internals.read().filters.clone()
    }

    /// Destruye el player en el nodo y apaga su sesión de voz. Con el nodo
    /// caído falla rápido, sin ningún efecto local.
    pub async fn destroy(&self) -> Result<()> {
        self.ensure_available()?;
        // Primero el lado remoto: si el destroy no sale, la sesión de voz y
        // el estado local quedan como estaban.
        self.send(CommandKind::Destroy).await?;
        self.voice.disconnect();
        self.voice.destroy();
        let mut internals = self.internals.write();
        internals.track = None;
        internals.anchor = PositionAnchor::Idle;
        internals.awaiting_sync = false;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Voz
    // ---------------------------------------------------------------

    pub fn connect_voice(&self, channel_id: u64) {
        self.voice.connect(channel_id);
    }

    pub fn disconnect_voice(&self) {
        self.voice.disconnect();
    }

    pub fn move_voice(&self, channel_id: u64) {
        self.voice.move_channel(channel_id);
    }

    pub fn reconnect_voice(&self) {
        self.voice.reconnect();
    }

    // ---------------------------------------------------------------
    // Mensajes del nodo
    // ---------------------------------------------------------------

    /// Entrada de los mensajes del socket que el dueño del nodo enruta a
    /// este guild.
    pub fn handle_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::PlayerUpdate { state, .. } => self.handle_update(state),
            ServerMessage::Event(event) => self.handle_event(event),
            other => debug!(guild = %self.guild_id, ?other, "ignoring unrouted message"),
        }
    }

    fn handle_update(&self, state: PlayerUpdateState) {
        let position = {
            let mut internals = self.internals.write();
            if let Some(connected) = state.connected {
                internals.connected = connected;
            }
            // Pings negativos o no finitos son "sin medición" en varios forks.
            if let Some(ping) = state.ping {
                internals.ping_ms = (ping.is_finite() && ping >= 0.0).then_some(ping);
            }
            if let Some(position) = state.position {
                // Reportes de arranque (<= 1ms) no cuentan como sync real.
                // Tras el sync manda la extrapolación local: un reporte viejo
                // no rebobina el anclaje.
                if position > 1 && internals.awaiting_sync {
                    internals.awaiting_sync = false;
                    let length_ms =
                        internals.track.as_ref().map(Track::length).filter(|l| *l > 0);
                    internals.anchor = if internals.paused {
                        PositionAnchor::Frozen {
                            position_ms: position,
                        }
                    } else {
                        PositionAnchor::Playing {
                            epoch_ms: now_ms(),
                            offset_ms: position,
                            length_ms,
                        }
                    };
                }
            }
            internals.anchor.position_at(now_ms())
        };
        let _ = self.events.send(PlayerEvent::PositionUpdate {
            position_ms: position,
        });
    }

    fn handle_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::TrackStartEvent { track, .. } => {
                let track = track.map(|t| t.into_track());
                {
                    let mut internals = self.internals.write();
                    let length_ms = track.as_ref().map(Track::length).filter(|l| *l > 0);
                    internals.anchor = PositionAnchor::Playing {
                        epoch_ms: now_ms(),
                        offset_ms: 0,
                        length_ms,
                    };
                    internals.awaiting_sync = true;
                    internals.paused = false;
                    if track.is_some() {
                        internals.track = track.clone();
                    }
                }
                let _ = self.events.send(PlayerEvent::TrackStart { track });
            }
            NodeEvent::TrackEndEvent { track, reason, .. } => {
                let ended = {
                    let mut internals = self.internals.write();
                    let ended = internals.track.take();
                    if reason.clears_anchor() {
                        internals.anchor = PositionAnchor::Idle;
                    }
                    internals.awaiting_sync = false;
                    ended.or_else(|| track.map(|t| t.into_track()))
                };
                let _ = self.events.send(PlayerEvent::TrackEnd {
                    track: ended,
                    reason,
                    may_start_next: reason.may_start_next(),
                });
            }
            NodeEvent::TrackExceptionEvent {
                track, exception, ..
            } => {
                let _ = self.events.send(PlayerEvent::TrackException {
                    track: track.map(|t| t.into_track()),
                    exception,
                });
            }
            NodeEvent::TrackStuckEvent {
                track, threshold_ms, ..
            } => {
                let _ = self.events.send(PlayerEvent::TrackStuck {
                    track: track.map(|t| t.into_track()),
                    threshold_ms,
                });
            }
            NodeEvent::WebSocketClosedEvent {
                code,
                reason,
                by_remote,
                ..
            } => {
                self.voice.node_socket_closed(code, by_remote);
                let _ = self.events.send(PlayerEvent::VoiceClosed {
                    code,
                    reason,
                    by_remote,
                });
            }
        }
    }
}

/// Valida las bandas del ecualizador, acumulando todos los problemas.
fn validate_equalizer(bands: &[EqualizerBand]) -> Result<()> {
    let mut issues = Vec::new();
    for band in bands {
        if band.band as usize >= EQUALIZER_BANDS {
            issues.push(format!(
                "band {}: does not exist, valid bands are 0..=14",
                band.band
            ));
        }
        if !(-0.25..=1.0).contains(&band.gain) {
            issues.push(format!(
                "band {}: gain {} out of range [-0.25, 1.0]",
                band.band, band.gain
            ));
        }
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(issues))
    }
}

fn check_unit(issues: &mut Vec<String>, name: &str, value: Option<f32>) {
    if let Some(value) = value {
        if !(0.0..=1.0).contains(&value) {
            issues.push(format!("{name}: {value} out of range [0.0, 1.0]"));
        }
    }
}

fn check_non_negative(issues: &mut Vec<String>, name: &str, value: Option<f32>) {
    if let Some(value) = value {
        if value.is_nan() || value < 0.0 {
            issues.push(format!("{name}: {value} must be >= 0"));
        }
    }
}

/// Valida todos los parámetros de filtros de una vez.
fn validate_filters(filters: &Filters) -> Result<()> {
    let mut issues = Vec::new();
    check_non_negative(&mut issues, "volume", filters.volume);
    if let Some(bands) = &filters.equalizer {
        if let Err(Error::Validation { issues: eq }) = validate_equalizer(bands) {
            issues.extend(eq);
        }
    }
    if let Some(karaoke) = &filters.karaoke {
        check_unit(&mut issues, "karaoke.level", karaoke.level);
        check_unit(&mut issues, "karaoke.monoLevel", karaoke.mono_level);
    }
    if let Some(timescale) = &filters.timescale {
        check_non_negative(&mut issues, "timescale.speed", timescale.speed);
        check_non_negative(&mut issues, "timescale.pitch", timescale.pitch);
        check_non_negative(&mut issues, "timescale.rate", timescale.rate);
    }
    if let Some(tremolo) = &filters.tremolo {
        check_non_negative(&mut issues, "tremolo.frequency", tremolo.frequency);
        check_unit(&mut issues, "tremolo.depth", tremolo.depth);
    }
    if let Some(mix) = &filters.channel_mix {
        check_unit(&mut issues, "channelMix.leftToLeft", mix.left_to_left);
        check_unit(&mut issues, "channelMix.leftToRight", mix.left_to_right);
        check_unit(&mut issues, "channelMix.rightToLeft", mix.right_to_left);
        check_unit(&mut issues, "channelMix.rightToRight", mix.right_to_right);
    }
    if let Some(low_pass) = &filters.low_pass {
        check_non_negative(&mut issues, "lowPass.smoothing", low_pass.smoothing);
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(issues))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoiceOptions;
    use crate::types::{TimescaleFilter, TrackInfo, TremoloFilter};

    fn voice() -> Arc<VoiceSession> {
        VoiceSession::new(
            GuildId(42),
            VoiceOptions::default(),
            Arc::new(|_| {}),
            Arc::new(|_| {}),
        )
    }

    fn track(length: u64) -> Track {
        Track {
            encoded: Some("QAAA".into()),
            info: TrackInfo {
                length,
                ..TrackInfo::default()
            },
            ..Track::default()
        }
    }

    fn player_with(mut sink: MockCommandSink) -> Arc<Player> {
        sink.expect_available().return_const(true);
        Player::new(GuildId(42), 1, Arc::new(sink), voice())
    }

    #[tokio::test]
    async fn play_anchors_position_and_awaits_sync() {
        let mut sink = MockCommandSink::new();
        sink.expect_dispatch().times(1).returning(|_| Ok(()));
        let player = player_with(sink);

        player.play(track(180_000), PlayOptions::default()).await.unwrap();
        let snapshot = player.snapshot();
        assert!(snapshot.awaiting_sync);
        assert!(!snapshot.paused);
        assert!(snapshot.position_ms < 1_000);
    }

    #[tokio::test]
    async fn seek_while_paused_freezes_the_position() {
        let mut sink = MockCommandSink::new();
        sink.expect_dispatch().times(3).returning(|_| Ok(()));
        let player = player_with(sink);

        player.play(track(180_000), PlayOptions::default()).await.unwrap();
        player.pause(true).await.unwrap();
        player.seek(30_000.0).await.unwrap();
        assert_eq!(player.position_ms(), 30_000);
        assert!(player.snapshot().awaiting_sync);
    }

    #[tokio::test]
    async fn commands_fail_fast_on_a_dead_node() {
        let mut sink = MockCommandSink::new();
        sink.expect_available().return_const(false);
        let player = Player::new(GuildId(42), 1, Arc::new(sink), voice());

        let result = player.play(track(1_000), PlayOptions::default()).await;
        assert!(matches!(result, Err(Error::NodeUnavailable(_))));
    }

    #[tokio::test]
    async fn destroy_fails_fast_on_a_dead_node() {
        let mut sink = MockCommandSink::new();
        sink.expect_available().return_const(false);
        let player = Player::new(GuildId(42), 1, Arc::new(sink), voice());

        let result = player.destroy().await;
        assert!(matches!(result, Err(Error::NodeUnavailable(_))));
        // Sin efectos locales: la sesión de voz sigue viva.
        assert_ne!(player.voice().status(), VoiceStatus::Destroyed);
    }

    #[tokio::test]
    async fn failed_destroy_keeps_voice_and_local_state() {
        let mut sink = MockCommandSink::new();
        sink.expect_dispatch().returning(|command| match command.kind {
            CommandKind::Destroy => Err(Error::Protocol("backend refused".into())),
            _ => Ok(()),
        });
        let player = player_with(sink);

        player.play(track(180_000), PlayOptions::default()).await.unwrap();
        let result = player.destroy().await;
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert_ne!(player.voice().status(), VoiceStatus::Destroyed);
        assert!(player.snapshot().track.is_some());
    }

    #[tokio::test]
    async fn equalizer_validation_reports_every_bad_band() {
        let mut sink = MockCommandSink::new();
        sink.expect_dispatch().times(1).returning(|_| Ok(()));
        let player = player_with(sink);

        let good = vec![EqualizerBand { band: 0, gain: 0.25 }];
        player.set_equalizer(good.clone()).await.unwrap();

        let bands = vec![
            EqualizerBand { band: 0, gain: 2.0 },
            EqualizerBand { band: 20, gain: 0.1 },
            EqualizerBand { band: 3, gain: 0.5 },
        ];
        let err = player.set_equalizer(bands).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("band 0"));
        assert!(text.contains("band 20"));
        assert!(!text.contains("band 3:"));
        // El rechazo no toca el ecualizador vigente.
        assert_eq!(player.filters().equalizer, Some(good));
    }

    #[tokio::test]
    async fn filter_validation_collects_all_fields() {
        let sink = MockCommandSink::new();
        let player = Player::new(GuildId(42), 1, Arc::new(sink), voice());

        let filters = Filters {
            timescale: Some(TimescaleFilter {
                speed: Some(-1.0),
                ..Default::default()
            }),
            tremolo: Some(TremoloFilter {
                frequency: Some(2.0),
                depth: Some(1.5),
            }),
            ..Default::default()
        };
        let err = player.set_filters(filters).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("timescale.speed"));
        assert!(text.contains("tremolo.depth"));
        assert!(!text.contains("tremolo.frequency:"));
    }

    #[tokio::test]
    async fn position_report_clears_awaiting_sync_and_sanitizes_ping() {
        let mut sink = MockCommandSink::new();
        sink.expect_dispatch().times(1).returning(|_| Ok(()));
        let player = player_with(sink);

        player.play(track(180_000), PlayOptions::default()).await.unwrap();
        player.handle_update(PlayerUpdateState {
            time: Some(now_ms()),
            position: Some(5_000),
            connected: Some(true),
            ping: Some(-1.0),
        });
        let snapshot = player.snapshot();
        assert!(!snapshot.awaiting_sync);
        assert!(snapshot.connected);
        assert_eq!(snapshot.ping_ms, None);
        assert!(snapshot.position_ms >= 5_000);
    }

    #[tokio::test]
    async fn stale_reports_after_sync_do_not_rewind_the_position() {
        let mut sink = MockCommandSink::new();
        sink.expect_dispatch().times(1).returning(|_| Ok(()));
        let player = player_with(sink);

        player.play(track(180_000), PlayOptions::default()).await.unwrap();
        player.handle_update(PlayerUpdateState {
            time: Some(now_ms()),
            position: Some(60_000),
            connected: Some(true),
            ping: None,
        });
        assert!(player.position_ms() >= 60_000);

        // Reporte rezagado tras el sync: la posición no retrocede.
        player.handle_update(PlayerUpdateState {
            time: None,
            position: Some(5_000),
            connected: None,
            ping: None,
        });
        assert!(player.position_ms() >= 60_000);
    }

    #[tokio::test]
    async fn startup_report_does_not_count_as_sync() {
        let mut sink = MockCommandSink::new();
        sink.expect_dispatch().times(1).returning(|_| Ok(()));
        let player = player_with(sink);

        player.play(track(180_000), PlayOptions::default()).await.unwrap();
        player.handle_update(PlayerUpdateState {
            time: None,
            position: Some(0),
            connected: None,
            ping: None,
        });
        assert!(player.snapshot().awaiting_sync);
    }

    #[tokio::test]
    async fn replaced_end_clears_the_anchor() {
        let mut sink = MockCommandSink::new();
        sink.expect_dispatch().times(1).returning(|_| Ok(()));
        let player = player_with(sink);
        let mut events = player.subscribe();

        player.play(track(180_000), PlayOptions::default()).await.unwrap();
        player.handle_event(NodeEvent::TrackEndEvent {
            guild_id: GuildId(42),
            track: None,
            reason: TrackEndReason::Replaced,
        });
        assert_eq!(player.position_ms(), 0);
        match events.try_recv().unwrap() {
            PlayerEvent::TrackEnd {
                reason,
                may_start_next,
                ..
            } => {
                assert_eq!(reason, TrackEndReason::Replaced);
                assert!(!may_start_next);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn finished_end_allows_advancing_the_queue() {
        let mut sink = MockCommandSink::new();
        sink.expect_dispatch().times(1).returning(|_| Ok(()));
        let player = player_with(sink);
        let mut events = player.subscribe();

        player.play(track(2_000), PlayOptions::default()).await.unwrap();
        player.handle_event(NodeEvent::TrackEndEvent {
            guild_id: GuildId(42),
            track: None,
            reason: TrackEndReason::Finished,
        });
        match events.try_recv().unwrap() {
            PlayerEvent::TrackEnd { may_start_next, .. } => assert!(may_start_next),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn anchor_clamps_to_track_length() {
        let anchor = PositionAnchor::Playing {
            epoch_ms: 1_000,
            offset_ms: 170_000,
            length_ms: Some(180_000),
        };
        assert_eq!(anchor.position_at(100_000), 180_000);
        assert_eq!(anchor.position_at(2_000), 171_000);
    }

    #[tokio::test]
    async fn pause_freezes_and_resume_reanchors() {
        let mut sink = MockCommandSink::new();
        sink.expect_dispatch().times(3).returning(|_| Ok(()));
        let player = player_with(sink);

        player.play(track(180_000), PlayOptions::default()).await.unwrap();
        player.pause(true).await.unwrap();
        let frozen = player.position_ms();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(player.position_ms(), frozen);

        player.pause(false).await.unwrap();
        assert!(player.position_ms() >= frozen);
    }
}
