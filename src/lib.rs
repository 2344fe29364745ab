//! Host-based reverse proxy for the Minecraft Java Edition client/server
//! wire protocol: reads just enough of the handshake to pick an upstream by
//! virtual host, then gets out of the way.

pub mod chat;
pub mod codec;
pub mod config;
pub mod conn;
pub mod events;
pub mod listener;
pub mod session;
pub mod upstream;
