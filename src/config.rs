use serde::{Deserialize, Serialize};

use crate::api::version::Version;
use crate::error::{Error, Result};
use crate::types::NodeId;

/// Opciones de conexión para un nodo del backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOptions {
    pub id: NodeId,
    pub host: String,
    pub port: Option<u16>,
    pub password: String,
    /// WSS/HTTPS en lugar de WS/HTTP.
    pub secure: bool,
    /// Generación del backend; `Auto` la detecta en el handshake.
    pub version: Version,

    // Reintentos
    pub max_reconnect: u32,
    /// Incremento base del backoff, en milisegundos.
    pub reconnect_delay_ms: u64,
    /// Tandas completas de reintentos antes de rendirse del todo.
    pub reconnect_waves: u32,

    /// Segundos que el nodo debe retener la sesión para un resume. `None`
    /// desactiva el configureResuming tras el handshake.
    pub resume_timeout_s: Option<u64>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            id: 0,
            host: String::new(),
            port: None,
            password: String::new(),
            secure: false,
            version: Version::Auto,

            // Backoff: 1s de incremento, tope 15s, 2 tandas
            max_reconnect: 10,
            reconnect_delay_ms: 1_000,
            reconnect_waves: 2,

            resume_timeout_s: None,
        }
    }
}

impl NodeOptions {
    /// Validates connection options before any socket is opened.
    ///
    /// Invalid input here is fatal: the node constructor refuses to build
    /// rather than dialing a host it knows is wrong.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Configuration(
                "NodeOptions.host must not be empty".into(),
            ));
        }
        if self.host.contains("://") || self.host.contains('/') {
            return Err(Error::Configuration(format!(
                "NodeOptions.host must be a bare hostname, got: {}",
                self.host
            )));
        }
        if self.password.is_empty() {
            return Err(Error::Configuration(
                "NodeOptions.password must not be empty".into(),
            ));
        }
        if self.reconnect_delay_ms == 0 {
            return Err(Error::Configuration(
                "NodeOptions.reconnect_delay_ms must be greater than 0".into(),
            ));
        }
        if self.reconnect_waves == 0 {
            return Err(Error::Configuration(
                "NodeOptions.reconnect_waves must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Comportamiento global de las sesiones de voz.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VoiceOptions {
    pub self_deaf: bool,
    pub self_mute: bool,
    /// Gracia antes de reintentar cuando se pierde el endpoint de voz.
    pub reconnect_grace_ms: u64,
}

impl Default for VoiceOptions {
    fn default() -> Self {
        Self {
            self_deaf: true,
            self_mute: false,
            reconnect_grace_ms: 2_000,
        }
    }
}

/// Opciones del cluster completo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterOptions {
    /// Id de usuario del bot, requerido por el header `User-Id`.
    pub user_id: u64,
    pub nodes: Vec<NodeOptions>,
    pub voice: VoiceOptions,
}

impl ClusterOptions {
    pub fn validate(&self) -> Result<()> {
        if self.user_id == 0 {
            return Err(Error::Configuration(
                "ClusterOptions.user_id must be provided".into(),
            ));
        }
        for node in &self.nodes {
            node.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_host() {
        let opts = NodeOptions {
            password: "youshallnotpass".into(),
            ..NodeOptions::default()
        };
        assert!(matches!(opts.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn rejects_host_with_scheme() {
        let opts = NodeOptions {
            host: "ws://localhost".into(),
            password: "pw".into(),
            ..NodeOptions::default()
        };
        assert!(matches!(opts.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn accepts_minimal_valid_options() {
        let opts = NodeOptions {
            host: "localhost".into(),
            port: Some(2333),
            password: "youshallnotpass".into(),
            ..NodeOptions::default()
        };
        assert!(opts.validate().is_ok());
    }
}
