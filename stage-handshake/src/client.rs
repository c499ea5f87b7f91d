//! Client driver.
//!
//! Mirrors the server stage by stage.  The client rebuilds every envelope the
//! server expects from the secrets revealed so far, and reads the next
//! stage's parameters from fixed offsets of each validated response.
//!
//! Stage B is the only lossy exchange: each packet is resent on a short
//! per-attempt timeout until its acknowledgement arrives.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::Range;
use std::time::Duration;

use tokio::net::lookup_host;
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::packet::{self, step, Envelope, OFF_FIELD_0, OFF_FIELD_1, OFF_FIELD_2, OFF_FIELD_3};
use crate::params::{SessionParams, COUNT_RANGE, SIZE_RANGE};
use crate::socket::{FrameStream, Socket};
use crate::state::Stage;

/// The four secrets, in the order they are revealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Secrets {
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
}

impl From<&SessionParams> for Secrets {
    fn from(p: &SessionParams) -> Self {
        Self {
            a: p.secret_a,
            b: p.secret_b,
            c: p.secret_c,
            d: p.secret_d,
        }
    }
}

pub struct Client {
    config: ClientConfig,
    server: SocketAddr,
    udp: Socket,
}

impl Client {
    /// Resolve the server and bind a local UDP socket of the same family.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let target = format!("{}:{}", config.host, config.port);
        let server = lookup_host(target.as_str())
            .await
            .map_err(|_| ClientError::Resolve(target.clone()))?
            .next()
            .ok_or_else(|| ClientError::Resolve(target.clone()))?;

        let local = match server.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let udp = Socket::bind(SocketAddr::new(local, 0)).await?;
        log::debug!("[client] {} -> {server}", udp.local_addr);

        Ok(Self {
            config,
            server,
            udp,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Run all four stages and return every parameter the server revealed.
    pub async fn run(&self) -> Result<SessionParams, ClientError> {
        let mut p = SessionParams::default();

        self.stage_a(&mut p).await?;
        self.pause().await;
        self.stage_b(&mut p).await?;
        self.pause().await;
        let mut stream = self.stage_c(&mut p).await?;
        self.pause().await;
        self.stage_d(&mut stream, &mut p).await?;

        log::info!("[client] all secrets revealed: {:?}", Secrets::from(&p));
        Ok(p)
    }

    fn tag(&self) -> u16 {
        self.config.session_tag
    }

    async fn pause(&self) {
        if !self.config.stage_delay.is_zero() {
            tokio::time::sleep(self.config.stage_delay).await;
        }
    }

    async fn stage_a(&self, p: &mut SessionParams) -> Result<(), ClientError> {
        log::info!("[client] stage A");
        self.udp
            .send_to(&packet::hello_frame(self.tag()), self.server)
            .await?;

        let (frame, _) = self
            .udp
            .recv_frame_within(packet::padded_len(16), self.config.response_timeout)
            .await
            .map_err(|e| ClientError::from_io(Stage::A, e))?;
        self.check(Stage::A, &frame, 0, 16)?;

        p.packet_count =
            bounded(Stage::A, "num", packet::read_u32_at(&frame, OFF_FIELD_0)?, &COUNT_RANGE)?;
        p.payload_size =
            bounded(Stage::A, "len", packet::read_u32_at(&frame, OFF_FIELD_1)?, &SIZE_RANGE)?;
        p.udp_port = port_field(Stage::A, packet::read_u32_at(&frame, OFF_FIELD_2)?)?;
        p.secret_a = packet::read_u32_at(&frame, OFF_FIELD_3)?;
        log::info!(
            "[client] stage A ok: num={} len={} udp_port={}",
            p.packet_count,
            p.payload_size,
            p.udp_port
        );
        Ok(())
    }

    async fn stage_b(&self, p: &mut SessionParams) -> Result<(), ClientError> {
        log::info!("[client] stage B");
        let dest = SocketAddr::new(self.server.ip(), p.udp_port);

        for packet_id in 0..p.packet_count {
            let request = packet::stage_b_request(self.tag(), p.secret_a, packet_id, p.payload_size);
            let ack = packet::stage_b_ack(self.tag(), p.secret_a, packet_id);
            let mut attempts = 0u32;
            loop {
                if self.config.max_retransmits.is_some_and(|max| attempts >= max) {
                    return Err(ClientError::RetriesExhausted {
                        packet_id,
                        attempts,
                    });
                }
                attempts += 1;
                self.udp.send_to(&request, dest).await?;
                if self.await_datagram(&ack, self.config.attempt_timeout).await? {
                    break;
                }
                log::debug!("[client] packet {packet_id}: timeout, resending");
            }
            log::debug!("[client] packet {packet_id}: acked after {attempts} attempt(s)");
        }

        let frame = self.await_stage_b_completion(p.secret_a).await?;
        p.tcp_port = port_field(Stage::B, packet::read_u32_at(&frame, OFF_FIELD_0)?)?;
        p.secret_b = packet::read_u32_at(&frame, OFF_FIELD_1)?;
        log::info!("[client] stage B ok: tcp_port={}", p.tcp_port);
        Ok(())
    }

    async fn stage_c(&self, p: &mut SessionParams) -> Result<FrameStream, ClientError> {
        log::info!("[client] stage C");
        let addr = SocketAddr::new(self.server.ip(), p.tcp_port);
        let mut stream = FrameStream::connect(addr, self.config.response_timeout)
            .await
            .map_err(|e| ClientError::from_io(Stage::C, e))?;

        let frame = stream
            .read_frame(packet::padded_len(13), self.config.response_timeout)
            .await
            .map_err(|e| ClientError::from_io(Stage::C, e))?;
        self.check(Stage::C, &frame, p.secret_b, 13)?;

        p.packet_count2 =
            bounded(Stage::C, "num2", packet::read_u32_at(&frame, OFF_FIELD_0)?, &COUNT_RANGE)?;
        p.payload_size2 =
            bounded(Stage::C, "len2", packet::read_u32_at(&frame, OFF_FIELD_1)?, &SIZE_RANGE)?;
        p.secret_c = packet::read_u32_at(&frame, OFF_FIELD_2)?;
        p.fill_byte = packet::read_u8_at(&frame, OFF_FIELD_3)?;
        log::info!(
            "[client] stage C ok: num2={} len2={} fill={:#04x}",
            p.packet_count2,
            p.payload_size2,
            p.fill_byte
        );
        Ok(stream)
    }

    async fn stage_d(
        &self,
        stream: &mut FrameStream,
        p: &mut SessionParams,
    ) -> Result<(), ClientError> {
        log::info!("[client] stage D");
        let request = packet::stage_d_request(self.tag(), p.secret_c, p.payload_size2, p.fill_byte);
        for _ in 0..p.packet_count2 {
            stream
                .write_frame(&request)
                .await
                .map_err(|e| ClientError::from_io(Stage::D, e))?;
        }

        let frame = stream
            .read_frame(packet::padded_len(4), self.config.response_timeout)
            .await
            .map_err(|e| ClientError::from_io(Stage::D, e))?;
        self.check(Stage::D, &frame, p.secret_c, 4)?;
        p.secret_d = packet::read_u32_at(&frame, OFF_FIELD_0)?;
        log::info!("[client] stage D ok");
        Ok(())
    }

    /// Receive datagrams until one equals `expected` or `wait` runs out.
    ///
    /// Anything else (a late ack for an earlier attempt, stray traffic) is
    /// discarded.  Returns `Ok(false)` on timeout.
    async fn await_datagram(&self, expected: &[u8], wait: Duration) -> Result<bool, ClientError> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.udp.recv_frame_within(expected.len(), remaining).await {
                Ok((frame, _)) if packet::matches(expected, &frame) => return Ok(true),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wait for the stage-B completion, skipping any leftover acks.
    async fn await_stage_b_completion(&self, secret_a: u32) -> Result<Vec<u8>, ClientError> {
        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (frame, _) = self
                .udp
                .recv_frame_within(packet::padded_len(8), remaining)
                .await
                .map_err(|e| ClientError::from_io(Stage::B, e))?;
            if Envelope::decode(&frame).is_ok_and(|env| env.step == step::REQUEST) {
                continue;
            }
            self.check(Stage::B, &frame, secret_a, 8)?;
            return Ok(frame);
        }
    }

    /// Validate a server response before reading fields from it.
    fn check(
        &self,
        stage: Stage,
        frame: &[u8],
        secret: u32,
        payload_len: usize,
    ) -> Result<(), ClientError> {
        let env = Envelope::decode(frame)?;
        if env.step != step::RESPONSE {
            return Err(ClientError::unexpected(stage, format!("step {}", env.step)));
        }
        if env.secret != secret {
            return Err(ClientError::unexpected(
                stage,
                format!("secret {} (expected {secret})", env.secret),
            ));
        }
        if env.session_tag != self.tag() {
            return Err(ClientError::unexpected(
                stage,
                format!("session tag {:#06x}", env.session_tag),
            ));
        }
        if env.payload.len() != payload_len {
            return Err(ClientError::unexpected(
                stage,
                format!("payload of {} bytes (expected {payload_len})", env.payload.len()),
            ));
        }
        Ok(())
    }
}

fn port_field(stage: Stage, value: u32) -> Result<u16, ClientError> {
    u16::try_from(value).map_err(|_| ClientError::unexpected(stage, format!("port {value}")))
}

/// Reject a count or size outside the range the server draws from.
///
/// Counts and sizes bound allocations and loops on this side.
fn bounded(stage: Stage, name: &str, value: u32, range: &Range<u32>) -> Result<u32, ClientError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ClientError::unexpected(
            stage,
            format!("{name}={value} outside {range:?}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_follow_params() {
        let p = SessionParams {
            packet_count: 10,
            payload_size: 10,
            udp_port: 10_000,
            secret_a: 1,
            tcp_port: 10_001,
            secret_b: 2,
            packet_count2: 10,
            payload_size2: 10,
            secret_c: 3,
            fill_byte: 0,
            secret_d: 4,
        };
        assert_eq!(
            Secrets::from(&p),
            Secrets {
                a: 1,
                b: 2,
                c: 3,
                d: 4
            }
        );
    }

    #[test]
    fn counts_and_sizes_outside_server_ranges_are_rejected() {
        assert_eq!(bounded(Stage::A, "num", 10, &COUNT_RANGE).unwrap(), 10);
        assert!(bounded(Stage::A, "num", 20, &COUNT_RANGE).is_err());
        assert!(bounded(Stage::C, "len2", u32::MAX, &SIZE_RANGE).is_err());
        let err = bounded(Stage::C, "len2", 9, &SIZE_RANGE).unwrap_err();
        assert!(
            matches!(err, ClientError::UnexpectedResponse { stage: Stage::C, .. }),
            "got {err:?}"
        );
    }

    #[test]
    fn port_field_rejects_out_of_range() {
        assert_eq!(port_field(Stage::A, 12_345).unwrap(), 12_345);
        assert!(port_field(Stage::B, 70_000).is_err());
    }

    #[tokio::test]
    async fn stage_a_timeout_is_reported() {
        // A bound socket that never answers.
        let silent = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client = Client::connect(ClientConfig {
            host: "127.0.0.1".to_string(),
            port: silent.local_addr.port(),
            response_timeout: Duration::from_millis(50),
            ..ClientConfig::default()
        })
        .await
        .unwrap();

        let err = client.run().await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(Stage::A)), "got {err:?}");
    }

    #[tokio::test]
    async fn oversized_stage_a_count_is_rejected_before_stage_b() {
        let server = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client = Client::connect(ClientConfig {
            host: "127.0.0.1".to_string(),
            port: server.local_addr.port(),
            response_timeout: Duration::from_secs(2),
            stage_delay: Duration::ZERO,
            ..ClientConfig::default()
        })
        .await
        .unwrap();

        let fake = async {
            let (hello, from) = server.recv_frame(24).await.unwrap();
            let tag = packet::session_tag_of(&hello).unwrap();
            let reply = packet::stage_a_response(tag, u32::MAX, u32::MAX, 10_000, 1);
            server.send_to(&reply, from).await.unwrap();
        };
        let (result, ()) = tokio::join!(client.run(), fake);

        let err = result.unwrap_err();
        assert!(
            matches!(err, ClientError::UnexpectedResponse { stage: Stage::A, .. }),
            "got {err:?}"
        );
    }
}
