//! # Trilateration Coordination Service
//!
//! Accepts WebSocket sessions from fixed RSSI anchors, keeps the anchor
//! registry current and re-solves the target position after every usable
//! distance report. An HTTP API exposes positions and status and lets an
//! operator place and calibrate anchors.
//!
//! ## Architecture
//!
//! ```text
//!  anchors (ESP32)            operator / 3D viewer
//!       │ WebSocket /ws             │ HTTP
//!       ▼                           ▼
//! ┌───────────────────────────────────────────┐
//! │              trilat-server                │
//! │  ┌────────┐   ┌─────────────┐   ┌──────┐  │
//! │  │ ws     │──►│ Coordinator │◄──│ api  │  │
//! │  │session │   │ + conn table│   │      │  │
//! │  └────────┘   └──────┬──────┘   └──────┘  │
//! └──────────────────────┼────────────────────┘
//!                        ▼
//! ┌───────────────────────────────────────────┐
//! │              trilat-core                  │
//! │  Registry │ Solver │ Signal │ Protocol    │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Wire dialects
//!
//! | Anchor sends | Service replies |
//! |--------------|-----------------|
//! | `{"type":"register","mac":..}` | `{"type":"id_assignment","id":..}` |
//! | `REGISTER` | `ID:<id>` |
//! | `{"type":"ping"}` | `{"type":"pong"}` |
//! | `PING` | `PONG` |
//! | `distance`, `rssi_report`, `position`, `calibration` | (none) |
//!
//! After any registration every connected anchor receives a `node_list`.

pub mod api;
pub mod config;
pub mod error;
pub mod service;
pub mod ws;

pub use api::{create_router, serve, serve_with_shutdown};
pub use config::{ServerConfig, DEFAULT_PORT};
pub use error::{ApiError, ServerError};
pub use service::Coordinator;
