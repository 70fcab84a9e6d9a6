//! Tablas de rutas por generación del backend.
//!
//! Cada versión registra un conjunto fijo de endpoints con su esquema de
//! parámetros de path/query. La resolución descarta en silencio los campos
//! que el esquema no declara o cuyo tipo no coincide: es un shim de
//! compatibilidad entre forks, no un error de validación.

use crate::api::version::Version;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Number,
    Boolean,
    Json,
    /// El propio nombre del campo se emite como segmento literal
    /// (p. ej. el `players` de `sessions/{id}/players/{guild}`).
    Terminal,
}

/// Valor de parámetro en runtime; su tipo inferido se compara contra el
/// esquema de la ruta.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Num(f64),
    Bool(bool),
    Json(serde_json::Value),
}

impl ParamValue {
    fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Str(_) => ParamKind::String,
            ParamValue::Num(_) => ParamKind::Number,
            ParamValue::Bool(_) => ParamKind::Boolean,
            ParamValue::Json(_) => ParamKind::Json,
        }
    }

    fn render(&self) -> String {
        match self {
            ParamValue::Str(s) => s.clone(),
            ParamValue::Num(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            ParamValue::Bool(b) => b.to_string(),
            ParamValue::Json(v) => v.to_string(),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        ParamValue::Num(v as f64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Num(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<serde_json::Value> for ParamValue {
    fn from(v: serde_json::Value) -> Self {
        ParamValue::Json(v)
    }
}

/// Parámetros aportados por una llamada; el orden de inserción se respeta al
/// renderizar los segmentos.
#[derive(Debug, Clone, Default)]
pub struct RouteParams {
    path: Vec<(&'static str, ParamValue)>,
    query: Vec<(&'static str, ParamValue)>,
}

impl RouteParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, key: &'static str, value: impl Into<ParamValue>) -> Self {
        self.path.push((key, value.into()));
        self
    }

    /// Marca un segmento terminal; el valor es irrelevante, se emite la clave.
    pub fn path_end(mut self, key: &'static str) -> Self {
        self.path.push((key, ParamValue::Str(String::new())));
        self
    }

    pub fn query(mut self, key: &'static str, value: impl Into<ParamValue>) -> Self {
        self.query.push((key, value.into()));
        self
    }
}

/// Un endpoint con nombre. Inmutable una vez registrado.
#[derive(Debug, Clone)]
pub struct Route {
    pub name: &'static str,
    /// Segmento literal, con `/` inicial.
    pub segment: &'static str,
    pub path: &'static [(&'static str, ParamKind)],
    pub query: &'static [(&'static str, ParamKind)],
    pub required_auth: bool,
}

impl Route {
    const fn new(name: &'static str, segment: &'static str) -> Self {
        Route {
            name,
            segment,
            path: &[],
            query: &[],
            required_auth: false,
        }
    }

    const fn auth(mut self) -> Self {
        self.required_auth = true;
        self
    }

    const fn with_path(mut self, schema: &'static [(&'static str, ParamKind)]) -> Self {
        self.path = schema;
        self
    }

    const fn with_query(mut self, schema: &'static [(&'static str, ParamKind)]) -> Self {
        self.query = schema;
        self
    }

    fn path_kind(&self, key: &str) -> Option<ParamKind> {
        self.path.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    fn query_kind(&self, key: &str) -> Option<ParamKind> {
        self.query.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    /// Renderiza el sufijo path+query de la ruta a partir de los parámetros
    /// provistos, descartando lo que el esquema no declare.
    pub fn prepare(&self, params: &RouteParams) -> String {
        let mut out = String::from(self.segment);
        for (key, value) in &params.path {
            match self.path_kind(key) {
                Some(ParamKind::Terminal) => {
                    out.push('/');
                    out.push_str(key);
                }
                Some(kind) if kind == value.kind() => {
                    out.push('/');
                    out.push_str(&value.render());
                }
                // Tipo distinto o campo no declarado: se ignora.
                _ => {}
            }
        }

        let query: Vec<String> = params
            .query
            .iter()
            .filter(|(key, value)| self.query_kind(key) == Some(value.kind()))
            .map(|(key, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(key),
                    urlencoding::encode(&value.render())
                )
            })
            .collect();
        if !query.is_empty() {
            out.push('?');
            out.push_str(&query.join("&"));
        }
        out
    }
}

const SESSION_ID: (&str, ParamKind) = ("sessionId", ParamKind::String);
const PLAYERS_END: (&str, ParamKind) = ("players", ParamKind::Terminal);
const PLAYER: (&str, ParamKind) = ("player", ParamKind::String);

/// Rutas compartidas por todas las generaciones.
const COMMON_ROUTES: [Route; 3] = [
    Route::new("loadTracks", "/loadtracks")
        .with_query(&[("identifier", ParamKind::String)]),
    Route::new("decodeTrack", "/decodeTrack")
        .with_query(&[("encodedTrack", ParamKind::String)]),
    Route::new("decodeTracks", "/decodeTracks"),
];

/// Rutas de las generaciones con sesión (v3/v4).
const SESSION_ROUTES: [Route; 6] = [
    Route::new("version", "/version"),
    Route::new("getPlayers", "/sessions")
        .auth()
        .with_path(&[SESSION_ID, PLAYERS_END]),
    Route::new("getPlayer", "/sessions")
        .auth()
        .with_path(&[SESSION_ID, PLAYERS_END, PLAYER])
        .with_query(&[("noReplace", ParamKind::Boolean)]),
    Route::new("updateSession", "/sessions")
        .auth()
        .with_path(&[SESSION_ID]),
    Route::new("stats", "/stats").auth(),
    Route::new("info", "/info").auth(),
];

const ROUTEPLANNER: Route = Route::new("routeplannerStatus", "/routeplannerStatus").auth();
const PLUGINS: Route = Route::new("plugins", "/plugins").auth();

/// Tabla de endpoints ligada a una versión concreta del backend.
#[derive(Debug, Clone)]
pub struct RouteTable {
    version: Version,
    secure: bool,
    host: String,
    port: Option<u16>,
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn for_version(version: Version, secure: bool, host: &str, port: Option<u16>) -> Self {
        let mut routes: Vec<Route> = COMMON_ROUTES.to_vec();
        if version.is_session_based() {
            // v3/v4 exigen auth también en las rutas de tracks
            for route in &mut routes {
                route.required_auth = true;
            }
            routes.extend_from_slice(&SESSION_ROUTES);
            routes.push(ROUTEPLANNER);
            if version == Version::V4 {
                routes.push(PLUGINS);
            }
        }
        // Auto se trata como legacy hasta que el handshake detecte algo.
        RouteTable {
            version,
            secure,
            host: host.to_string(),
            port,
            routes,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Base REST: protocolo + host + puerto opcional + prefijo de versión.
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https://" } else { "http://" };
        let port = match self.port {
            Some(port) => format!(":{port}"),
            None => String::new(),
        };
        format!("{scheme}{}{port}{}", self.host, self.version.rest_prefix())
    }

    pub fn supports(&self, name: &str) -> bool {
        self.routes.iter().any(|route| route.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.name == name)
    }

    pub fn require(&self, name: &'static str) -> Result<&Route> {
        self.get(name).ok_or(Error::NotSupported { route: name })
    }

    /// URL completa para una llamada lógica.
    pub fn resolve(&self, name: &'static str, params: &RouteParams) -> Result<String> {
        let route = self.require(name)?;
        Ok(format!("{}{}", self.base_url(), route.prepare(params)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn v4_table() -> RouteTable {
        RouteTable::for_version(Version::V4, false, "localhost", Some(2333))
    }

    #[test]
    fn resolves_player_route_with_terminal_segment() {
        let table = v4_table();
        let params = RouteParams::new()
            .path("sessionId", "abc123")
            .path_end("players")
            .path("player", "81384788765712384")
            .query("noReplace", true);
        let url = table.resolve("getPlayer", &params).unwrap();
        assert_eq!(
            url,
            "http://localhost:2333/v4/sessions/abc123/players/81384788765712384?noReplace=true"
        );
    }

    #[test]
    fn unsupported_route_names_the_endpoint() {
        let table = RouteTable::for_version(Version::V2, false, "localhost", None);
        let err = table.resolve("getPlayer", &RouteParams::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "endpoint not supported for this version: 'getPlayer'"
        );
    }

    #[test]
    fn legacy_table_keeps_track_routes() {
        let table = RouteTable::for_version(Version::V2, false, "localhost", None);
        assert!(table.supports("loadTracks"));
        assert!(table.supports("decodeTrack"));
        assert!(!table.supports("stats"));
        assert!(!table.supports("version"));
    }

    #[test]
    fn mismatched_param_types_are_dropped() {
        let table = v4_table();
        // noReplace declarado boolean; un string no pasa el filtro.
        let params = RouteParams::new()
            .path("sessionId", "abc")
            .path_end("players")
            .path("player", "1")
            .query("noReplace", "yes");
        let url = table.resolve("getPlayer", &params).unwrap();
        assert!(!url.contains('?'));
    }

    #[test]
    fn undeclared_fields_are_silently_ignored() {
        let table = v4_table();
        let params = RouteParams::new()
            .query("identifier", "ytsearch:test")
            .query("somethingElse", "1");
        let url = table.resolve("loadTracks", &params).unwrap();
        assert_eq!(
            url,
            "http://localhost:2333/v4/loadtracks?identifier=ytsearch%3Atest"
        );
    }

    #[test]
    fn query_values_are_percent_encoded() {
        let table = RouteTable::for_version(Version::V2, false, "localhost", Some(8080));
        let params = RouteParams::new().query("identifier", "a b&c");
        let url = table.resolve("loadTracks", &params).unwrap();
        assert_eq!(url, "http://localhost:8080/loadtracks?identifier=a%20b%26c");
    }

    #[test]
    fn v3_prefixes_base_url() {
        let table = RouteTable::for_version(Version::V3, true, "audio.example.com", None);
        assert_eq!(table.base_url(), "https://audio.example.com/v3");
    }
}
