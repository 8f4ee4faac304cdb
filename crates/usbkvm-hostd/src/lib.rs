//! # usbkvm-hostd
//!
//! The daemon wiring for the usbkvm host: configuration loading, the
//! HTTP/WebSocket adapters over the device layer, and the two serving
//! modes.
//!
//! - **usbkvm mode** drives a single dongle described by a JSON config
//!   file and serves the flat `/hid`, `/stream`, `/audio`, `/aux/*`
//!   routes.
//! - **ipkvm mode** scans the device tree for every connected dongle and
//!   serves the UUID-addressed `/api/v1/*` routes.
//!
//! The HTTP front door itself (TLS, CSRF, static assets) is deliberately
//! thin here — the adapters in [`api`] are the stable entry points an
//! outer web layer mounts.

pub mod api;
pub mod config;
