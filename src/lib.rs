//! # nodelink
//!
//! Runtime de cliente para nodos de audio remotos estilo Lavalink.
//!
//! Tres generaciones incompatibles del backend (legacy por socket, sesiones
//! REST v3 y player-por-HTTP v4) quedan detrás de una sola API de comandos:
//! el cluster detecta la generación de cada nodo en el handshake, liga la
//! tabla de rutas correspondiente y traduce cada comando al wire que toque.
//!
//! ```no_run
//! use std::sync::Arc;
//! use nodelink::{ClusterManager, ClusterOptions, NodeOptions};
//!
//! # async fn run() -> nodelink::Result<()> {
//! let options = ClusterOptions {
//!     user_id: 81384788765712384,
//!     nodes: vec![NodeOptions {
//!         id: 1,
//!         host: "localhost".into(),
//!         port: Some(2333),
//!         password: "youshallnotpass".into(),
//!         ..NodeOptions::default()
//!     }],
//!     ..ClusterOptions::default()
//! };
//! let cluster = ClusterManager::new(options, Arc::new(|payload| {
//!     // Reenviar el op-4 por el shard del chat-platform.
//!     let _ = payload;
//! }))?;
//! cluster.connect_all();
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod manager;
pub mod node;
pub mod player;
pub mod types;
pub mod voice;

pub use api::protocol::{Command, CommandKind, PlayerInfo, VoiceServer};
pub use api::version::Version;
pub use config::{ClusterOptions, NodeOptions, VoiceOptions};
pub use error::{Error, Result};
pub use manager::ClusterManager;
pub use node::{Node, NodeState};
pub use player::{CommandSink, PlayOptions, Player, PlayerEvent, PlayerSnapshot};
pub use voice::{GatewayVoiceUpdate, VoiceSession, VoiceStatus};
