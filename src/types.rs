//! Shared wire types: identifiers, tracks, filters and node statistics.
//!
//! Everything here mirrors the JSON the backend speaks, with camelCase field
//! names on the wire and snake_case in Rust.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Identificador de guild. Snowflakes viajan como string en el protocolo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuildId(pub u64);

impl fmt::Display for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for GuildId {
    fn from(value: u64) -> Self {
        GuildId(value)
    }
}

impl Serialize for GuildId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for GuildId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct Visitor;
        impl de::Visitor<'_> for Visitor {
            type Value = GuildId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a guild id as string or integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<GuildId, E> {
                Ok(GuildId(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<GuildId, E> {
                v.parse::<u64>().map(GuildId).map_err(E::custom)
            }
        }
        deserializer.deserialize_any(Visitor)
    }
}

/// Identificador de nodo dentro del pool.
pub type NodeId = u32;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub is_stream: bool,
    pub author: Option<String>,
    /// Duración en milisegundos.
    pub length: u64,
    pub position: u64,
    pub title: Option<String>,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub source_name: Option<String>,
}

/// Un track tal como el backend lo entrega. El campo codificado aparece como
/// `encoded` (v4), `track` (v3) o `encodedTrack` según la generación; los
/// alias cubren los tres.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Track {
    #[serde(alias = "track", alias = "encodedTrack")]
    pub encoded: Option<String>,
    pub info: TrackInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_info: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<serde_json::Value>,
}

impl Track {
    pub fn length(&self) -> u64 {
        self.info.length
    }
}

/// Banda del ecualizador de 15 bandas del backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqualizerBand {
    /// 0..=14
    pub band: u8,
    /// -0.25..=1.0
    pub gain: f32,
}

pub const EQUALIZER_BANDS: usize = 15;

/// Ecualizador plano: una entrada por banda, ganancia 0.0 por defecto.
pub fn flat_equalizer() -> Vec<EqualizerBand> {
    (0..EQUALIZER_BANDS as u8)
        .map(|band| EqualizerBand { band, gain: 0.0 })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KaraokeFilter {
    pub level: Option<f32>,
    pub mono_level: Option<f32>,
    pub filter_band: Option<f32>,
    pub filter_width: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimescaleFilter {
    pub speed: Option<f32>,
    pub pitch: Option<f32>,
    pub rate: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TremoloFilter {
    pub frequency: Option<f32>,
    pub depth: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RotationFilter {
    pub rotation_hz: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DistortionFilter {
    pub sin_offset: Option<f32>,
    pub sin_scale: Option<f32>,
    pub cos_offset: Option<f32>,
    pub cos_scale: Option<f32>,
    pub tan_offset: Option<f32>,
    pub tan_scale: Option<f32>,
    pub offset: Option<f32>,
    pub scale: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelMixFilter {
    pub left_to_left: Option<f32>,
    pub left_to_right: Option<f32>,
    pub right_to_left: Option<f32>,
    pub right_to_right: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LowPassFilter {
    pub smoothing: Option<f32>,
}

/// Parámetros de efectos estructurados del player.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Filters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equalizer: Option<Vec<EqualizerBand>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub karaoke: Option<KaraokeFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timescale: Option<TimescaleFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tremolo: Option<TremoloFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<RotationFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distortion: Option<DistortionFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_mix: Option<ChannelMixFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_pass: Option<LowPassFilter>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

/// Contadores en vivo que el nodo publica por el socket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Common,
    Suspicious,
    #[serde(alias = "FAULT", alias = "fault")]
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackException {
    pub message: Option<String>,
    pub severity: Option<Severity>,
    pub cause: Option<String>,
}

/// Por qué terminó un track. `finished` y `loadFailed` habilitan el avance
/// automático de playlist (`may_start_next`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    #[serde(alias = "FINISHED")]
    Finished,
    #[serde(alias = "LOAD_FAILED")]
    LoadFailed,
    #[serde(alias = "STOPPED")]
    Stopped,
    #[serde(alias = "REPLACED")]
    Replaced,
    #[serde(alias = "CLEANUP")]
    Cleanup,
}

impl TrackEndReason {
    pub fn may_start_next(self) -> bool {
        matches!(self, TrackEndReason::Finished | TrackEndReason::LoadFailed)
    }

    /// Estos motivos invalidan el anclaje de posición del player.
    pub fn clears_anchor(self) -> bool {
        matches!(
            self,
            TrackEndReason::Replaced | TrackEndReason::Cleanup | TrackEndReason::Stopped
        )
    }
}

/// Resultado de `loadtracks`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadResult {
    pub load_type: Option<String>,
    #[serde(alias = "data")]
    pub tracks: serde_json::Value,
    pub playlist_info: Option<serde_json::Value>,
    pub exception: Option<TrackException>,
}

/// Milisegundos desde epoch; los anclajes y timestamps del protocolo usan esta base.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
