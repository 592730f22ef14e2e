//! WebRTC signaling coordinator: authenticates WebSocket clients, keeps the
//! directory of live peers and relays directed negotiation frames between them.

pub mod app;
pub mod cli;
pub mod config;
pub mod directory;
pub mod gate;
pub mod handlers;
pub mod hub;
pub mod identity;
pub mod jwt;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod telemetry;
pub mod websocket;
