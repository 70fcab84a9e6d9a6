use std::fmt;

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

/// Generación del protocolo del backend.
///
/// Tres dialectos incompatibles viven detrás de la misma API de comandos:
/// `V2` (legacy, todo por socket), `V3` (sesiones REST) y `V4` (player solo
/// por HTTP). `Custom` cubre forks que no publican una versión numérica y se
/// tratan con la tabla legacy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Version {
    Auto,
    V2,
    V3,
    V4,
    Custom,
}

/// Headers que pueden anunciar la versión, en orden de prioridad.
const VERSION_HEADERS: [&str; 4] = ["api-version", "lavalink-api-version", "apiVersion", "version"];

impl Version {
    /// Detecta la versión desde los headers de un handshake o respuesta REST.
    ///
    /// Ausente -> V2. No numérica -> Custom. Numérica se recorta a [2, 4].
    pub fn from_headers(headers: &HeaderMap) -> Version {
        for name in VERSION_HEADERS {
            if let Some(value) = headers.get(name) {
                let Ok(text) = value.to_str() else {
                    return Version::Custom;
                };
                return match text.trim().parse::<i64>() {
                    Ok(n) => Version::clamp_numeric(n),
                    Err(_) => Version::Custom,
                };
            }
        }
        Version::V2
    }

    /// Valores numéricos fuera de [2, 4] se recortan al extremo más cercano.
    pub fn clamp_numeric(n: i64) -> Version {
        match n.clamp(2, 4) {
            2 => Version::V2,
            3 => Version::V3,
            _ => Version::V4,
        }
    }

    /// Ruta del websocket para cada generación.
    pub fn ws_path(self) -> &'static str {
        match self {
            Version::Auto | Version::V2 => "",
            Version::V3 => "v3/websocket",
            Version::V4 => "v4/websocket",
            Version::Custom => "ws",
        }
    }

    /// Prefijo de versión para la base REST. Legacy y custom sirven sus
    /// endpoints sin prefijo.
    pub fn rest_prefix(self) -> &'static str {
        match self {
            Version::V3 => "/v3",
            Version::V4 => "/v4",
            Version::Auto | Version::V2 | Version::Custom => "",
        }
    }

    /// Las generaciones con sesión controlan el player vía REST.
    pub fn is_session_based(self) -> bool {
        matches!(self, Version::V3 | Version::V4)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Version::Auto => "auto",
            Version::V2 => "v2",
            Version::V3 => "v3",
            Version::V4 => "v4",
            Version::Custom => "custom",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn headers(name: &'static str, value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(name, HeaderValue::from_str(value).unwrap());
        map
    }

    #[test]
    fn numeric_versions_are_clamped() {
        assert_eq!(Version::from_headers(&headers("lavalink-api-version", "1")), Version::V2);
        assert_eq!(Version::from_headers(&headers("lavalink-api-version", "9")), Version::V4);
        assert_eq!(Version::from_headers(&headers("api-version", "3")), Version::V3);
    }

    #[test]
    fn non_numeric_becomes_custom() {
        assert_eq!(Version::from_headers(&headers("version", "abc")), Version::Custom);
    }

    #[test]
    fn absent_header_defaults_to_v2() {
        assert_eq!(Version::from_headers(&HeaderMap::new()), Version::V2);
    }

    #[test]
    fn api_version_takes_priority() {
        let mut map = headers("api-version", "4");
        map.insert("version", HeaderValue::from_static("2"));
        assert_eq!(Version::from_headers(&map), Version::V4);
    }

    #[test]
    fn ws_paths_per_generation() {
        assert_eq!(Version::V2.ws_path(), "");
        assert_eq!(Version::V3.ws_path(), "v3/websocket");
        assert_eq!(Version::V4.ws_path(), "v4/websocket");
        assert_eq!(Version::Custom.ws_path(), "ws");
    }
}
