//! Server and client configuration.
//!
//! Both structs carry sensible defaults; the CLI in `main.rs` overrides the
//! handful of values exposed as flags.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::ack_policy::DEFAULT_ACK_PROBABILITY;
use crate::packet::DEFAULT_SESSION_TAG;

/// Well-known UDP port for stage A.
pub const DEFAULT_PORT: u16 = 12235;

/// Bound on every blocking server-side receive, accept and read.
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(3);

/// Client wait per stage-B attempt before retransmitting.
pub const CLIENT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(100);

/// Client wait for any single server response outside stage B.
pub const CLIENT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Pause the client takes between stages.
pub const STAGE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address every socket of the server binds to.
    pub bind: IpAddr,
    /// Stage-A port; `0` lets the OS pick one.
    pub port: u16,
    pub timeout: Duration,
    /// Probability that a valid stage-B packet is acknowledged.
    pub ack_probability: f64,
    /// Seed for parameter generation; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            timeout: SERVER_TIMEOUT,
            ack_probability: DEFAULT_ACK_PROBABILITY,
            seed: None,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,
    /// Server stage-A port.
    pub port: u16,
    pub session_tag: u16,
    pub attempt_timeout: Duration,
    pub response_timeout: Duration,
    pub stage_delay: Duration,
    /// Cap on stage-B sends per packet; `None` retries forever.
    pub max_retransmits: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            session_tag: DEFAULT_SESSION_TAG,
            attempt_timeout: CLIENT_ATTEMPT_TIMEOUT,
            response_timeout: CLIENT_RESPONSE_TIMEOUT,
            stage_delay: STAGE_DELAY,
            max_retransmits: None,
        }
    }
}
