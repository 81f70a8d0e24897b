//! Previewgate - a host for short-lived preview apps
//!
//! This library runs many untrusted, user-supplied web apps behind one
//! public entry point:
//! - Each app is served by its own ephemeral instance on a local port
//! - Requests to `/preview/{appId}/...` are routed to that instance
//! - Instances are reclaimed when their TTL elapses or to make room
//! - Evicted apps are transparently rehydrated from storage on next request
//! - Uses connection pooling for efficient instance communication

pub mod admission;
pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod launcher;
pub mod manager;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod reclaimer;
pub mod registry;
pub mod render;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod store;
