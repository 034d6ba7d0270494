#![forbid(unsafe_code)]

// Roomwire library - WebSocket relay for group chat and call signaling

pub mod auth;
pub mod cache;
pub mod client;
pub mod db;
pub mod metrics;
pub mod presence;
pub mod registry;
pub mod rooms;
pub mod signaling;
