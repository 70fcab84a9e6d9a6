use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::api::routes::{RouteParams, RouteTable};
use crate::api::version::Version;
use crate::error::{Error, Result};
use crate::node::message::{OutboundFrame, PlayerUpdateState};
use crate::types::{EqualizerBand, Filters, GuildId, NodeStats, Track};

/// Credenciales y cabeceras de identificación hacia el backend.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub password: String,
    pub user_id: u64,
    pub client_name: String,
}

impl Credentials {
    pub fn new(password: impl Into<String>, user_id: u64) -> Self {
        Self {
            password: password.into(),
            user_id,
            client_name: format!("nodelink/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Credenciales de voz del chat-platform que el backend necesita para
/// conectarse al canal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceServer {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

/// Payload de cada comando de player.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Play {
        encoded: String,
        user_data: Option<Value>,
        start_time: Option<f64>,
        end_time: Option<f64>,
        no_replace: Option<bool>,
    },
    Stop,
    Pause(bool),
    Seek(f64),
    SetVolume(f64),
    SetEqualizer(Vec<EqualizerBand>),
    SetFilters(Filters),
    Destroy,
    VoiceUpdate(VoiceServer),
    Ping,
}

/// Comando efímero: se construye, se despacha y se descarta.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub guild_id: GuildId,
    pub kind: CommandKind,
}

/// Canal de salida hacia el socket del nodo, inyectado por la conexión.
pub type SocketSender = Arc<dyn Fn(OutboundFrame) -> Result<()> + Send + Sync>;

/// Player tal como lo devuelve `GET sessions/{id}/players/{guild}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerInfo {
    pub guild_id: Option<GuildId>,
    pub track: Option<Track>,
    pub volume: Option<f64>,
    pub paused: Option<bool>,
    pub state: Option<PlayerUpdateState>,
    pub filters: Option<Filters>,
}

/// Cliente del protocolo: una API de comandos uniforme sobre las tres
/// generaciones del backend.
///
/// Las generaciones con sesión (v3/v4) traducen cada comando a un PATCH
/// parcial del player; el modo legacy serializa un frame de socket. La tabla
/// de rutas se re-liga cuando el handshake detecta la versión real.
pub struct ProtocolClient {
    http: reqwest::Client,
    credentials: Credentials,
    table: RwLock<RouteTable>,
    session_id: Arc<RwLock<Option<String>>>,
    socket: SocketSender,
}

impl ProtocolClient {
    pub fn new(
        table: RouteTable,
        credentials: Credentials,
        session_id: Arc<RwLock<Option<String>>>,
        socket: SocketSender,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            table: RwLock::new(table),
            session_id,
            socket,
        }
    }

    /// Versión actualmente ligada.
    pub fn version(&self) -> Version {
        self.table.read().version()
    }

    /// Reemplaza la tabla de rutas tras detectar la versión real del nodo.
    pub fn rebind(&self, table: RouteTable) {
        debug!("protocol client rebound to version {}", table.version());
        *self.table.write() = table;
    }

    fn headers(&self, with_auth: bool) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if with_auth {
            if let Ok(value) = HeaderValue::from_str(&self.credentials.password) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&self.credentials.user_id.to_string()) {
            headers.insert("User-Id", value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.credentials.client_name) {
            headers.insert("Client-Name", value);
        }
        if let Some(session) = self.session_id.read().as_deref() {
            if let Ok(value) = HeaderValue::from_str(session) {
                headers.insert("Session-Id", value);
            }
        }
        headers
    }

    async fn request(
        &self,
        method: Method,
        url: String,
        with_auth: bool,
        body: Option<Value>,
    ) -> Result<reqwest::Response> {
        let mut req = self.http.request(method, url).headers(self.headers(with_auth));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let response = req.send().await.map_err(Error::from_http)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::bad_status(status, Some(&body)));
        }
        Ok(response)
    }

    async fn request_json<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        url: String,
        with_auth: bool,
        body: Option<Value>,
    ) -> Result<T> {
        let response = self.request(method, url, with_auth, body).await?;
        response.json::<T>().await.map_err(Error::from_http)
    }

    // ---------------------------------------------------------------
    // Despacho de comandos
    // ---------------------------------------------------------------

    /// Despacha un comando por la vía que la generación detectada exige.
    pub async fn dispatch(&self, command: Command) -> Result<()> {
        validate_numbers(&command.kind)?;
        let session = self.session_id.read().clone();
        let session_capable = self.table.read().supports("getPlayer");
        match session {
            Some(session_id) if session_capable => {
                self.dispatch_rest(&session_id, command).await
            }
            _ => self.dispatch_socket(command),
        }
    }

    async fn dispatch_rest(&self, session_id: &str, command: Command) -> Result<()> {
        let version = self.version();
        let body = player_update_body(version, &command.kind);
        let mut params = RouteParams::new()
            .path("sessionId", session_id)
            .path_end("players")
            .path("player", command.guild_id.to_string());
        if let CommandKind::Play {
            no_replace: Some(no_replace),
            ..
        } = command.kind
        {
            params = params.query("noReplace", no_replace);
        }

        match command.kind {
            CommandKind::Destroy => {
                let url = self.table.read().resolve("getPlayer", &params)?;
                self.request(Method::DELETE, url, true, None).await?;
            }
            CommandKind::Ping => {
                // El keep-alive en generaciones con sesión vive en el socket;
                // no hay equivalente REST.
            }
            _ => {
                let url = self.table.read().resolve("getPlayer", &params)?;
                self.request(Method::PATCH, url, true, Some(body)).await?;
            }
        }
        Ok(())
    }

    fn dispatch_socket(&self, command: Command) -> Result<()> {
        let guild_id = command.guild_id;
        let frame = match command.kind {
            CommandKind::Play {
                encoded,
                start_time,
                end_time,
                no_replace,
                ..
            } => OutboundFrame::Play {
                guild_id,
                track: Some(encoded),
                start_time: start_time.map(|t| t.max(0.0) as u64),
                end_time: end_time.map(|t| t.max(0.0) as u64),
                no_replace,
            },
            CommandKind::Stop => OutboundFrame::Stop { guild_id },
            CommandKind::Pause(pause) => OutboundFrame::Pause { guild_id, pause },
            CommandKind::Seek(position) => OutboundFrame::Seek {
                guild_id,
                seek: position.max(0.0) as u64,
            },
            CommandKind::SetVolume(volume) => OutboundFrame::Volume {
                guild_id,
                volume: volume.max(0.0) as i64,
            },
            CommandKind::SetEqualizer(equalizer) => OutboundFrame::Equalizer {
                guild_id,
                equalizer,
            },
            CommandKind::SetFilters(filters) => OutboundFrame::Filters { guild_id, filters },
            CommandKind::Destroy => OutboundFrame::Destroy { guild_id },
            CommandKind::VoiceUpdate(voice) => OutboundFrame::VoiceUpdate {
                guild_id,
                endpoint: voice.endpoint,
                session_id: voice.session_id,
                token: voice.token,
            },
            CommandKind::Ping => OutboundFrame::Ping {
                timestamp: crate::types::now_ms(),
            },
        };
        (self.socket)(frame)
    }

    // ---------------------------------------------------------------
    // Superficie REST
    // ---------------------------------------------------------------

    pub async fn load_tracks(&self, identifier: &str) -> Result<crate::types::LoadResult> {
        let (url, auth) = {
            let table = self.table.read();
            let route = table.require("loadTracks")?;
            let params = RouteParams::new().query("identifier", identifier);
            (table.resolve("loadTracks", &params)?, route.required_auth)
        };
        self.request_json(Method::GET, url, auth, None).await
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<Track> {
        let (url, auth) = {
            let table = self.table.read();
            let route = table.require("decodeTrack")?;
            let params = RouteParams::new().query("encodedTrack", encoded);
            (table.resolve("decodeTrack", &params)?, route.required_auth)
        };
        self.request_json(Method::GET, url, auth, None).await
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<Track>> {
        let (url, auth) = {
            let table = self.table.read();
            let route = table.require("decodeTracks")?;
            (table.resolve("decodeTracks", &RouteParams::new())?, route.required_auth)
        };
        self.request_json(Method::POST, url, auth, Some(json!(encoded)))
            .await
    }

    /// Consulta `GET version` y devuelve la generación anunciada en headers.
    pub async fn backend_version(&self) -> Result<Version> {
        let url = {
            let table = self.table.read();
            table.resolve("version", &RouteParams::new())?
        };
        let response = self.request(Method::GET, url, true, None).await?;
        Ok(Version::from_headers(response.headers()))
    }

    pub async fn get_players(&self, session_id: &str) -> Result<Vec<PlayerInfo>> {
        let url = {
            let table = self.table.read();
            let params = RouteParams::new().path("sessionId", session_id).path_end("players");
            table.resolve("getPlayers", &params)?
        };
        self.request_json(Method::GET, url, true, None).await
    }

    pub async fn get_player(&self, session_id: &str, guild_id: GuildId) -> Result<PlayerInfo> {
        let url = {
            let table = self.table.read();
            let params = RouteParams::new()
                .path("sessionId", session_id)
                .path_end("players")
                .path("player", guild_id.to_string());
            table.resolve("getPlayer", &params)?
        };
        self.request_json(Method::GET, url, true, None).await
    }

    /// `DELETE sessions/{id}/players/{guild}` directo, sin pasar por el
    /// despacho de comandos.
    pub async fn destroy_player(&self, session_id: &str, guild_id: GuildId) -> Result<()> {
        let url = {
            let table = self.table.read();
            let params = RouteParams::new()
                .path("sessionId", session_id)
                .path_end("players")
                .path("player", guild_id.to_string());
            table.resolve("getPlayer", &params)?
        };
        self.request(Method::DELETE, url, true, None).await?;
        Ok(())
    }

    /// Configura el resume de sesión (`PATCH sessions/{id}`).
    pub async fn update_session(&self, session_id: &str, resuming: bool, timeout_s: u64) -> Result<()> {
        let url = {
            let table = self.table.read();
            let params = RouteParams::new().path("sessionId", session_id);
            table.resolve("updateSession", &params)?
        };
        let body = json!({ "resuming": resuming, "timeout": timeout_s });
        self.request(Method::PATCH, url, true, Some(body)).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<NodeStats> {
        let url = {
            let table = self.table.read();
            table.resolve("stats", &RouteParams::new())?
        };
        self.request_json(Method::GET, url, true, None).await
    }

    pub async fn info(&self) -> Result<Value> {
        let url = {
            let table = self.table.read();
            table.resolve("info", &RouteParams::new())?
        };
        self.request_json(Method::GET, url, true, None).await
    }

    pub async fn plugins(&self) -> Result<Value> {
        let url = {
            let table = self.table.read();
            table.resolve("plugins", &RouteParams::new())?
        };
        self.request_json(Method::GET, url, true, None).await
    }

    pub async fn routeplanner_status(&self) -> Result<Value> {
        let url = {
            let table = self.table.read();
            table.resolve("routeplannerStatus", &RouteParams::new())?
        };
        self.request_json(Method::GET, url, true, None).await
    }
}

/// Rechaza valores no finitos antes de cualquier I/O.
fn validate_numbers(kind: &CommandKind) -> Result<()> {
    let mut issues = Vec::new();
    let mut check = |name: &str, value: f64| {
        if !value.is_finite() {
            issues.push(format!("{name}: value cannot be infinite or NaN"));
        }
    };
    match kind {
        CommandKind::Play {
            start_time,
            end_time,
            ..
        } => {
            if let Some(t) = start_time {
                check("startTime", *t);
            }
            if let Some(t) = end_time {
                check("endTime", *t);
            }
        }
        CommandKind::Seek(position) => check("position", *position),
        CommandKind::SetVolume(volume) => check("volume", *volume),
        CommandKind::VoiceUpdate(voice) => {
            if voice.endpoint.is_empty() {
                issues.push("voice.endpoint: must not be empty".into());
            }
            if voice.session_id.is_empty() {
                issues.push("voice.sessionId: must not be empty".into());
            }
            if voice.token.is_empty() {
                issues.push("voice.token: must not be empty".into());
            }
        }
        _ => {}
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(issues))
    }
}

/// Documento parcial de "player update" con el mapeo de campos que cada
/// generación espera. El mapeo es data, no dispatch virtual: v4 anida el
/// track codificado bajo `track.encoded`; v3 y legacy lo duplican en
/// `encodedTrack`/`track`/`play` para compatibilidad con varios forks.
fn player_update_body(version: Version, kind: &CommandKind) -> Value {
    match kind {
        CommandKind::Play {
            encoded,
            user_data,
            start_time,
            end_time,
            ..
        } => {
            let mut body = match version {
                Version::V4 => {
                    let mut track = json!({ "encoded": encoded });
                    if let Some(data) = user_data {
                        track["userData"] = data.clone();
                    }
                    json!({ "track": track })
                }
                // v3 duplica el campo (identifier incluido) para cubrir
                // forks; las sesiones legacy no conocen identifier.
                Version::V3 => json!({
                    "encodedTrack": encoded,
                    "track": encoded,
                    "play": encoded,
                    "identifier": encoded,
                }),
                _ => json!({
                    "encodedTrack": encoded,
                    "track": encoded,
                    "play": encoded,
                }),
            };
            if let Some(t) = start_time {
                body["position"] = json!(t.max(0.0) as u64);
            }
            if let Some(t) = end_time {
                body["endTime"] = json!(t.max(0.0) as u64);
            }
            body
        }
        CommandKind::Stop => match version {
            Version::V4 => json!({ "track": { "encoded": Value::Null } }),
            _ => json!({ "encodedTrack": Value::Null, "track": Value::Null, "play": Value::Null }),
        },
        CommandKind::Pause(pause) => json!({ "paused": pause }),
        CommandKind::Seek(position) => json!({ "position": position.max(0.0) as u64 }),
        CommandKind::SetVolume(volume) => {
            // El volumen nunca viaja negativo.
            json!({ "volume": volume.max(0.0) as i64 })
        }
        CommandKind::SetEqualizer(equalizer) => json!({ "filters": { "equalizer": equalizer } }),
        CommandKind::SetFilters(filters) => json!({ "filters": filters }),
        CommandKind::VoiceUpdate(voice) => json!({
            "voice": {
                "token": voice.token,
                "endpoint": voice.endpoint,
                "sessionId": voice.session_id,
            }
        }),
        // destroy viaja como DELETE y ping no tiene forma REST.
        CommandKind::Destroy | CommandKind::Ping => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn play(encoded: &str) -> CommandKind {
        CommandKind::Play {
            encoded: encoded.into(),
            user_data: None,
            start_time: None,
            end_time: None,
            no_replace: None,
        }
    }

    #[test]
    fn v4_nests_track_under_encoded() {
        let body = player_update_body(Version::V4, &play("QAAA"));
        assert_eq!(body["track"]["encoded"], "QAAA");
        assert!(body.get("encodedTrack").is_none());
    }

    #[test]
    fn v3_duplicates_track_fields_for_forks() {
        let body = player_update_body(Version::V3, &play("QAAA"));
        assert_eq!(body["encodedTrack"], "QAAA");
        assert_eq!(body["track"], "QAAA");
        assert_eq!(body["play"], "QAAA");
        assert_eq!(body["identifier"], "QAAA");
    }

    #[test]
    fn v4_stop_clears_nested_track() {
        let body = player_update_body(Version::V4, &CommandKind::Stop);
        assert_eq!(body["track"]["encoded"], Value::Null);
    }

    #[test]
    fn volume_is_clamped_to_zero() {
        let body = player_update_body(Version::V4, &CommandKind::SetVolume(-30.0));
        assert_eq!(body["volume"], 0);
    }

    #[test]
    fn non_finite_numbers_are_rejected_before_io() {
        assert!(matches!(
            validate_numbers(&CommandKind::SetVolume(f64::NAN)),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            validate_numbers(&CommandKind::Seek(f64::INFINITY)),
            Err(Error::Validation { .. })
        ));
        assert!(validate_numbers(&CommandKind::SetVolume(50.0)).is_ok());
    }

    #[test]
    fn voice_update_requires_all_credentials() {
        let incomplete = CommandKind::VoiceUpdate(VoiceServer {
            token: "tok".into(),
            endpoint: String::new(),
            session_id: "sess".into(),
        });
        let err = validate_numbers(&incomplete).unwrap_err();
        assert!(err.to_string().contains("voice.endpoint"));
    }

    #[test]
    fn equalizer_command_travels_inside_filters() {
        let bands = vec![EqualizerBand { band: 0, gain: 0.25 }];
        let body = player_update_body(Version::V4, &CommandKind::SetEqualizer(bands));
        assert_eq!(body["filters"]["equalizer"][0]["band"], 0);
        assert_eq!(body["filters"]["equalizer"][0]["gain"], 0.25);
    }

    #[test]
    fn legacy_dispatch_uses_socket_frames() {
        use std::sync::Mutex;
        let sent: Arc<Mutex<Vec<OutboundFrame>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let client = ProtocolClient::new(
            RouteTable::for_version(Version::V2, false, "localhost", Some(2333)),
            Credentials::new("pw", 1),
            Arc::new(RwLock::new(None)),
            Arc::new(move |frame| {
                sink.lock().unwrap().push(frame);
                Ok(())
            }),
        );
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            client
                .dispatch(Command {
                    guild_id: GuildId(42),
                    kind: CommandKind::Pause(true),
                })
                .await
                .unwrap();
        });
        let frames = sent.lock().unwrap();
        assert_eq!(
            *frames,
            vec![OutboundFrame::Pause {
                guild_id: GuildId(42),
                pause: true
            }]
        );
    }
}
