//! # overseer
//!
//! Supervises named service processes over a line-delimited JSON control
//! protocol and streams log files to WebSocket clients.
//!
//! - [`supervisor`]: start/stop/restart/status of services, with optional
//!   auto-restart when a monitored process exits on its own.
//! - [`tail`]: one shared follow process per log path, fanned out to
//!   subscribers and respawned when it exits.
//! - [`api`]: the action set over HTTP GET and a WebSocket push channel.
//! - [`lifecycle`]: listener, settings changes and signal handling.

pub mod api;
pub mod child;
pub mod events;
pub mod lifecycle;
pub mod supervisor;
pub mod tail;
