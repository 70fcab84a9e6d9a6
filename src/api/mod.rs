//! # API Module
//!
//! REST surface of the backend and the version abstraction that lets one
//! command API target any backend generation.
//!
//! - [`version`] detects and clamps the backend generation from headers.
//! - [`routes`] declares the per-version endpoint tables and resolves
//!   logical names into concrete request paths.
//! - [`protocol`] issues the actual REST calls and dispatches guild
//!   commands either as player-update PATCHes (session generations) or as
//!   legacy socket frames.

pub mod protocol;
pub mod routes;
pub mod version;
