//! One server session: the unit of concurrency.
//!
//! A session is spawned for every stage-A datagram the listener receives.  It
//! owns everything it touches after that point:
//! - two [`PortReservation`]s and the UDP socket / TCP listener bound to them,
//! - the [`SessionParams`] drawn for this client,
//! - one [`Machine`] driving stages A through D.
//!
//! Sessions never share sockets.  Every exit path drops the reservations and
//! sockets, so ports return to the registry whether the session completed,
//! timed out or was rejected.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::ack_policy::AckPolicy;
use crate::error::SessionError;
use crate::packet;
use crate::params::{ParamGenerator, SessionParams};
use crate::ports::{PortAllocator, PortReservation};
use crate::socket::{FrameStream, Socket};
use crate::state::{Event, Failure, Machine, ServerState, Stage};

/// Attempts at reserving and binding a port before giving up.
const BIND_ATTEMPTS: u32 = 8;

/// Terminal outcome of one session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub peer: SocketAddr,
    pub state: ServerState,
    /// `None` if the session failed before parameters were drawn.
    pub params: Option<SessionParams>,
}

/// Everything a session borrows from the server that spawned it.
pub struct SessionContext {
    /// The well-known stage-A socket, used for the stage-A reply.
    pub listener: Arc<Socket>,
    pub ports: PortAllocator,
    pub bind: IpAddr,
    pub timeout: Duration,
    pub generator: ParamGenerator,
    pub ack: Box<dyn AckPolicy>,
}

/// Sockets bound to this session's reserved ports.
struct Endpoints {
    udp: Socket,
    tcp: TcpListener,
    // Fields drop in order, so the ports are released after the sockets close.
    udp_port: PortReservation,
    tcp_port: PortReservation,
}

impl Endpoints {
    async fn bind(ports: &PortAllocator, ip: IpAddr) -> Result<Self, SessionError> {
        let (udp, udp_port) =
            bind_reserved(ports, |port| Socket::bind(SocketAddr::new(ip, port))).await?;
        let (tcp, tcp_port) =
            bind_reserved(ports, |port| TcpListener::bind(SocketAddr::new(ip, port))).await?;
        Ok(Self {
            udp,
            tcp,
            udp_port,
            tcp_port,
        })
    }
}

/// Reserve a port and bind it, retrying with a fresh port if the OS already
/// has the chosen one in use.
async fn bind_reserved<T, F, Fut>(
    ports: &PortAllocator,
    mut bind: F,
) -> Result<(T, PortReservation), SessionError>
where
    F: FnMut(u16) -> Fut,
    Fut: std::future::Future<Output = io::Result<T>>,
{
    let mut attempt = 1;
    loop {
        let reservation = ports.reserve()?;
        match bind(reservation.port()).await {
            Ok(socket) => return Ok((socket, reservation)),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                log::debug!("[session] port {} busy, retrying", reservation.port());
                attempt += 1;
            }
            Err(e) => return Err(SessionError::io(Stage::A, e)),
        }
    }
}

/// Run one session from its stage-A datagram to a terminal state.
pub async fn serve(ctx: SessionContext, hello: Vec<u8>, peer: SocketAddr) -> SessionReport {
    let SessionContext {
        listener,
        ports,
        bind,
        timeout,
        mut generator,
        ack,
    } = ctx;

    let endpoints = match Endpoints::bind(&ports, bind).await {
        Ok(endpoints) => endpoints,
        Err(e) => {
            log::warn!("[session {peer}] could not set up endpoints: {e}");
            return SessionReport {
                peer,
                state: ServerState::Failed {
                    stage: Stage::A,
                    reason: Failure::Transport,
                },
                params: None,
            };
        }
    };

    let params = generator.generate(endpoints.udp_port.port(), endpoints.tcp_port.port());
    let tag = packet::session_tag_of(&hello).unwrap_or(packet::DEFAULT_SESSION_TAG);
    let mut session = Session {
        peer,
        listener,
        endpoints,
        timeout,
        machine: Machine::new(params, tag, ack),
    };

    match session.drive(&hello).await {
        Ok(()) => log::info!("[session {peer}] complete"),
        Err(e) => {
            if let Some(event) = e.event() {
                session.machine.handle(event);
            }
            match session.machine.state() {
                ServerState::Failed {
                    stage: Stage::A,
                    reason: Failure::ProtocolViolation,
                } => log::info!("[session {peer}] rejected stage A request"),
                _ if e.is_timeout() => log::info!("[session {peer}] timed out: {e}"),
                state => log::warn!("[session {peer}] ended in {state}: {e}"),
            }
        }
    }

    SessionReport {
        peer,
        state: session.machine.state(),
        params: Some(params),
    }
}

struct Session {
    peer: SocketAddr,
    listener: Arc<Socket>,
    endpoints: Endpoints,
    timeout: Duration,
    machine: Machine,
}

impl Session {
    async fn drive(&mut self, hello: &[u8]) -> Result<(), SessionError> {
        self.stage_a(hello).await?;
        self.stage_b().await?;
        let mut stream = self.stage_c().await?;
        self.stage_d(&mut stream).await
    }

    /// Feed `event` and fail fast if the machine rejected it.
    fn advance(&mut self, event: Event<'_>) -> Result<Vec<Vec<u8>>, SessionError> {
        let effect = self.machine.handle(event);
        match self.machine.state() {
            state @ ServerState::Failed { .. } => Err(SessionError::Rejected(state)),
            _ => Ok(effect.replies),
        }
    }

    async fn stage_a(&mut self, hello: &[u8]) -> Result<(), SessionError> {
        log::debug!("[session {}] stage A", self.peer);
        for reply in self.advance(Event::Datagram(hello))? {
            self.listener
                .send_to(&reply, self.peer)
                .await
                .map_err(|e| SessionError::io(Stage::A, e))?;
        }
        let p = self.machine.params();
        log::info!(
            "[session {}] stage A ok: tag={:#06x} num={} len={} udp_port={}",
            self.peer,
            self.machine.tag(),
            p.packet_count,
            p.payload_size,
            p.udp_port
        );
        Ok(())
    }

    async fn stage_b(&mut self) -> Result<(), SessionError> {
        let packet_count = self.machine.params().packet_count;
        while let ServerState::AwaitingB { next_packet_id } = self.machine.state() {
            let expected_len = self.expected_len();
            let (frame, from) = self
                .endpoints
                .udp
                .recv_frame_within(expected_len, self.timeout)
                .await
                .map_err(|e| SessionError::io(Stage::B, e))?;

            let replies = self.advance(Event::Datagram(&frame))?;
            if replies.is_empty() {
                log::debug!(
                    "[session {}] stage B still awaiting packet {}/{}",
                    self.peer,
                    next_packet_id + 1,
                    packet_count
                );
                continue;
            }
            log::debug!(
                "[session {}] stage B packet {}/{} acked",
                self.peer,
                next_packet_id + 1,
                packet_count
            );
            for reply in replies {
                self.endpoints
                    .udp
                    .send_to(&reply, from)
                    .await
                    .map_err(|e| SessionError::io(Stage::B, e))?;
            }
        }
        log::info!(
            "[session {}] stage B ok: tcp_port={}",
            self.peer,
            self.machine.params().tcp_port
        );
        Ok(())
    }

    async fn stage_c(&mut self) -> Result<FrameStream, SessionError> {
        let mut stream = FrameStream::accept(&self.endpoints.tcp, self.timeout)
            .await
            .map_err(|e| SessionError::io(Stage::C, e))?;
        for reply in self.advance(Event::Connected)? {
            stream
                .write_frame(&reply)
                .await
                .map_err(|e| SessionError::io(Stage::C, e))?;
        }
        log::info!("[session {}] stage C ok: stream from {}", self.peer, stream.peer_addr);
        Ok(stream)
    }

    async fn stage_d(&mut self, stream: &mut FrameStream) -> Result<(), SessionError> {
        while let ServerState::AwaitingD { .. } = self.machine.state() {
            let frame = stream
                .read_frame(self.expected_len(), self.timeout)
                .await
                .map_err(|e| SessionError::io(Stage::D, e))?;
            for reply in self.advance(Event::Segment(&frame))? {
                stream
                    .write_frame(&reply)
                    .await
                    .map_err(|e| SessionError::io(Stage::D, e))?;
            }
        }
        log::info!("[session {}] stage D ok", self.peer);
        Ok(())
    }

    fn expected_len(&self) -> usize {
        // Only called from states that expect an inbound frame.
        self.machine.expected_len().unwrap_or(packet::HEADER_LEN)
    }
}
