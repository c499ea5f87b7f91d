//! Stage-A listener.
//!
//! The [`Server`] owns the well-known UDP socket.  Every datagram it receives
//! is handed to a freshly spawned session task together with its own
//! parameter generator and ack policy; the listener itself never blocks on a
//! session and never stops because one failed.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;

use crate::ack_policy::{AckPolicy, AckPolicyFactory, RandomAck};
use crate::config::ServerConfig;
use crate::packet;
use crate::params::ParamGenerator;
use crate::ports::PortAllocator;
use crate::session::{self, SessionContext, SessionReport};
use crate::socket::Socket;

pub struct Server {
    socket: Arc<Socket>,
    ports: PortAllocator,
    config: ServerConfig,
    /// Source of per-session generator seeds.
    seeds: Mutex<StdRng>,
    ack_policy: Arc<AckPolicyFactory>,
}

impl Server {
    /// Bind the stage-A socket with the default random ack policy.
    pub async fn bind(config: ServerConfig) -> io::Result<Self> {
        let probability = config.ack_probability;
        Self::bind_with_ack_policy(
            config,
            Arc::new(move || Box::new(RandomAck::new(probability)) as Box<dyn AckPolicy>),
        )
        .await
    }

    /// Bind the stage-A socket; each session gets a policy from `ack_policy`.
    pub async fn bind_with_ack_policy(
        config: ServerConfig,
        ack_policy: Arc<AckPolicyFactory>,
    ) -> io::Result<Self> {
        let socket = Socket::bind(config.listen_addr()).await?;
        let seeds = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        log::info!("[server] listening on {}", socket.local_addr);

        Ok(Self {
            ports: PortAllocator::with_reserved([socket.local_addr.port()]),
            socket: Arc::new(socket),
            config,
            seeds: Mutex::new(seeds),
            ack_policy,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// The port registry shared by every session of this server.
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Wait for one stage-A datagram and spawn a session for it.
    pub async fn accept(&self) -> io::Result<JoinHandle<SessionReport>> {
        let expected_len = packet::padded_len(packet::HELLO.len());
        let (hello, peer) = self.socket.recv_frame(expected_len).await?;
        log::debug!("[server] {} byte datagram from {peer}", hello.len());

        let seed = self
            .seeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random();
        let ctx = SessionContext {
            listener: Arc::clone(&self.socket),
            ports: self.ports.clone(),
            bind: self.config.bind,
            timeout: self.config.timeout,
            generator: ParamGenerator::seeded(seed),
            ack: (self.ack_policy)(),
        };
        Ok(tokio::spawn(session::serve(ctx, hello, peer)))
    }

    /// Accept forever.  Receive errors are logged and the loop continues.
    pub async fn run(self) {
        loop {
            match self.accept().await {
                // Sessions log their own outcome.
                Ok(_session) => {}
                Err(e) => log::warn!("[server] receive failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Failure, ServerState, Stage};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            timeout: Duration::from_millis(200),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn listener_port_is_never_handed_to_sessions() {
        let server = Server::bind(loopback_config()).await.unwrap();
        assert!(server.ports().is_reserved(server.local_addr().port()));
        assert_eq!(server.ports().in_use(), 1);
    }

    #[tokio::test]
    async fn garbage_datagram_spawns_a_rejected_session() {
        let server = Server::bind(loopback_config()).await.unwrap();
        let client = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        client.send_to(b"not a hello", server.local_addr()).await.unwrap();

        let report = server.accept().await.unwrap().await.unwrap();
        assert_eq!(
            report.state,
            ServerState::Failed {
                stage: Stage::A,
                reason: Failure::ProtocolViolation
            }
        );
        assert_eq!(server.ports().in_use(), 1);

        // The listener keeps serving after a rejected session.
        client
            .send_to(&packet::hello_frame(7), server.local_addr())
            .await
            .unwrap();
        let report = server.accept().await.unwrap().await.unwrap();
        assert_eq!(
            report.state,
            ServerState::Failed {
                stage: Stage::B,
                reason: Failure::Timeout
            }
        );
        assert_eq!(server.ports().in_use(), 1);
    }
}
