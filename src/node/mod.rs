//! # Node Module
//!
//! Conexión de larga vida contra un nodo de audio remoto.
//!
//! - [`message`] define el wire de socket (mensajes entrantes y frames
//!   legacy salientes).
//! - [`connection`] mantiene el socket: handshake con detección de versión,
//!   keep-alive, backoff de reconexión y despacho de mensajes.

pub mod connection;
pub mod message;

pub use connection::{Node, NodeCallbacks, NodeState};
