//! Mensajes del socket del nodo, etiquetados por `op`.

use serde::{Deserialize, Serialize};

use crate::types::{
    EqualizerBand, Filters, GuildId, NodeStats, Track, TrackEndReason, TrackException,
};

/// Estado periódico que el nodo reporta para un player. También viaja de
/// vuelta en el op legacy `playerUpdate` de algunos forks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerUpdateState {
    pub time: Option<u64>,
    pub position: Option<u64>,
    pub connected: Option<bool>,
    pub ping: Option<f64>,
}

/// Track embebido en un evento: v4 manda el objeto completo, v2/v3 solo el
/// string codificado.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EventTrack {
    Full(Track),
    Encoded(String),
}

impl EventTrack {
    pub fn encoded(&self) -> Option<&str> {
        match self {
            EventTrack::Full(track) => track.encoded.as_deref(),
            EventTrack::Encoded(encoded) => Some(encoded),
        }
    }

    /// Duración en ms, si el evento trae la metadata.
    pub fn length(&self) -> Option<u64> {
        match self {
            EventTrack::Full(track) => Some(track.info.length),
            EventTrack::Encoded(_) => None,
        }
    }

    pub fn into_track(self) -> Track {
        match self {
            EventTrack::Full(track) => track,
            EventTrack::Encoded(encoded) => Track {
                encoded: Some(encoded),
                ..Track::default()
            },
        }
    }
}

/// Eventos de player que el nodo origina.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum NodeEvent {
    TrackStartEvent {
        guild_id: GuildId,
        track: Option<EventTrack>,
    },
    TrackEndEvent {
        guild_id: GuildId,
        track: Option<EventTrack>,
        reason: TrackEndReason,
    },
    TrackExceptionEvent {
        guild_id: GuildId,
        track: Option<EventTrack>,
        exception: Option<TrackException>,
    },
    TrackStuckEvent {
        guild_id: GuildId,
        track: Option<EventTrack>,
        threshold_ms: Option<u64>,
    },
    WebSocketClosedEvent {
        guild_id: GuildId,
        code: u16,
        reason: Option<String>,
        by_remote: bool,
    },
}

impl NodeEvent {
    pub fn guild_id(&self) -> GuildId {
        match self {
            NodeEvent::TrackStartEvent { guild_id, .. }
            | NodeEvent::TrackEndEvent { guild_id, .. }
            | NodeEvent::TrackExceptionEvent { guild_id, .. }
            | NodeEvent::TrackStuckEvent { guild_id, .. }
            | NodeEvent::WebSocketClosedEvent { guild_id, .. } => *guild_id,
        }
    }
}

/// Mensaje entrante decodificado del socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ServerMessage {
    Ready {
        #[serde(default)]
        resumed: bool,
        #[serde(rename = "sessionId")]
        session_id: Option<String>,
    },
    PlayerUpdate {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        state: PlayerUpdateState,
    },
    Stats(NodeStats),
    Event(NodeEvent),
    Ping {
        timestamp: Option<u64>,
    },
    Pong {
        timestamp: Option<u64>,
    },
}

/// Frame saliente para el modo socket legacy. El `Stop` con mayúscula es el
/// op que el protocolo original define; se conserva tal cual por
/// compatibilidad de wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all_fields = "camelCase")]
pub enum OutboundFrame {
    #[serde(rename = "play")]
    Play {
        guild_id: GuildId,
        track: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        no_replace: Option<bool>,
    },
    #[serde(rename = "Stop")]
    Stop { guild_id: GuildId },
    #[serde(rename = "pause")]
    Pause { guild_id: GuildId, pause: bool },
    #[serde(rename = "seek")]
    Seek { guild_id: GuildId, seek: u64 },
    #[serde(rename = "volume")]
    Volume { guild_id: GuildId, volume: i64 },
    #[serde(rename = "destroy")]
    Destroy { guild_id: GuildId },
    #[serde(rename = "playerUpdate")]
    PlayerUpdate {
        guild_id: GuildId,
        state: PlayerUpdateState,
    },
    #[serde(rename = "voiceUpdate")]
    VoiceUpdate {
        guild_id: GuildId,
        endpoint: String,
        session_id: String,
        token: String,
    },
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },
    #[serde(rename = "equalizer")]
    Equalizer {
        guild_id: GuildId,
        equalizer: Vec<EqualizerBand>,
    },
    #[serde(rename = "filters")]
    Filters {
        guild_id: GuildId,
        #[serde(flatten)]
        filters: Filters,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_ready() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"op":"ready","resumed":false,"sessionId":"abc"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Ready {
                resumed: false,
                session_id: Some("abc".into())
            }
        );
    }

    #[test]
    fn decodes_player_update() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"op":"playerUpdate","guildId":"42","state":{"time":1000,"position":250,"connected":true,"ping":12.0}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::PlayerUpdate { guild_id, state } => {
                assert_eq!(guild_id, GuildId(42));
                assert_eq!(state.position, Some(250));
                assert_eq!(state.connected, Some(true));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn decodes_stats() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"op":"stats","players":3,"playingPlayers":1,"uptime":12345,
                "memory":{"free":1,"used":2,"allocated":3,"reservable":4},
                "cpu":{"cores":8,"systemLoad":0.5,"lavalinkLoad":0.1}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Stats(stats) => {
                assert_eq!(stats.players, 3);
                assert_eq!(stats.cpu.lavalink_load, 0.1);
                assert!(stats.frame_stats.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn decodes_track_end_event_with_string_track() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"op":"event","type":"TrackEndEvent","guildId":"42","track":"QAAA...","reason":"finished"}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Event(NodeEvent::TrackEndEvent { track, reason, .. }) => {
                assert_eq!(track.unwrap().encoded(), Some("QAAA..."));
                assert_eq!(reason, TrackEndReason::Finished);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn decodes_websocket_closed_event() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"op":"event","type":"WebSocketClosedEvent","guildId":"42","code":4014,"reason":"moved","byRemote":true}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Event(NodeEvent::WebSocketClosedEvent { code, by_remote, .. }) => {
                assert_eq!(code, 4014);
                assert!(by_remote);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn encodes_legacy_play_frame() {
        let frame = OutboundFrame::Play {
            guild_id: GuildId(42),
            track: Some("QAAA".into()),
            start_time: None,
            end_time: Some(5000),
            no_replace: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["op"], "play");
        assert_eq!(json["guildId"], "42");
        assert_eq!(json["endTime"], 5000);
        assert!(json.get("startTime").is_none());
    }

    #[test]
    fn stop_frame_keeps_original_capitalization() {
        let json = serde_json::to_value(OutboundFrame::Stop { guild_id: GuildId(1) }).unwrap();
        assert_eq!(json["op"], "Stop");
    }

    #[test]
    fn legacy_player_update_echoes_state() {
        let frame = OutboundFrame::PlayerUpdate {
            guild_id: GuildId(7),
            state: PlayerUpdateState {
                time: Some(1_000),
                position: Some(250),
                connected: Some(true),
                ping: None,
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["op"], "playerUpdate");
        assert_eq!(json["state"]["position"], 250);
    }

    #[test]
    fn filters_frame_flattens_parameters() {
        let frame = OutboundFrame::Filters {
            guild_id: GuildId(9),
            filters: Filters {
                timescale: Some(crate::types::TimescaleFilter {
                    // Exacto en binario: el paso f32 -> f64 no lo altera.
                    speed: Some(0.5),
                    ..Default::default()
                }),
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["op"], "filters");
        assert_eq!(json["timescale"]["speed"], 0.5);
    }
}
