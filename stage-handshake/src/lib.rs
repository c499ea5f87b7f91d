//! `stage-handshake`: a four-stage UDP/TCP handshake server and client.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  hello (UDP)   ┌──────────────┐
//!  │  Client  │───────────────▶│    Server    │  well-known port
//!  └────┬─────┘                └──────┬───────┘
//!       │                             │ spawn per request
//!       │   stage B (UDP)      ┌──────▼───────┐
//!       │◀────────────────────▶│   Session    │  own UDP + TCP ports
//!       │   stage C/D (TCP)    │  (Machine)   │
//!       │◀────────────────────▶└──────┬───────┘
//!       │                             │ reserve / release
//!       │                      ┌──────▼───────┐
//!       │                      │ PortAllocator│  shared registry
//!       │                      └──────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]: envelope wire format and per-stage frame builders
//! - [`state`]: pure server state machine
//! - [`params`]: seeded per-session parameter generation
//! - [`ack_policy`]: stage-B acknowledgement decisions (random or scripted)
//! - [`ports`]: session port registry with RAII reservations
//! - [`socket`]: async UDP/TCP frame I/O with bounded waits
//! - [`session`]: one server session, stage A through D
//! - [`server`]: well-known listener that spawns sessions
//! - [`client`]: client driver for all four stages
//! - [`config`]: timeouts, ports and defaults
//! - [`error`]: session and client error types

pub mod ack_policy;
pub mod client;
pub mod config;
pub mod error;
pub mod packet;
pub mod params;
pub mod ports;
pub mod server;
pub mod session;
pub mod socket;
pub mod state;

pub use client::{Client, Secrets};
pub use config::{ClientConfig, ServerConfig};
pub use error::{ClientError, SessionError};
pub use params::SessionParams;
pub use server::Server;
pub use session::SessionReport;
