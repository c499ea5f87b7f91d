//! Server-side stage state machine.
//!
//! The machine is pure: it never touches a socket.  The session handler feeds
//! it [`Event`]s (a datagram arrived, a connection was accepted, a receive
//! timed out, ...) and sends whatever frames the returned [`Effect`] carries.
//!
//! ```text
//!  AwaitingA ──hello──▶ AwaitingB{0} ──N acked──▶ AwaitingC ──accept──▶ AwaitingD{0}
//!      │                  │    ▲                     │                     │
//!      │                  └────┘ ignore / no-ack     │                     │ len2 × num2
//!      │                                             │                     ▼
//!      └──────────── mismatch / timeout / I/O ───────┴────────────────▶ Failed   Complete
//! ```

use std::fmt;

use crate::ack_policy::AckPolicy;
use crate::packet::{self, HELLO};
use crate::params::SessionParams;

/// One phase of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    A,
    B,
    C,
    D,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {self:?}")
    }
}

/// Why a session ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// A frame did not byte-match the expected envelope.
    ProtocolViolation,
    /// Nothing qualifying arrived within the bound.
    Timeout,
    /// Bind, send, accept or read failed at the OS level.
    Transport,
    /// The peer closed the stream before the stage completed.
    Closed,
}

/// All states of one server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    AwaitingA,
    /// `next_packet_id` packets have been acknowledged so far.
    AwaitingB { next_packet_id: u32 },
    AwaitingC,
    /// `received` stage-D frames have been validated so far.
    AwaitingD { received: u32 },
    Complete,
    Failed { stage: Stage, reason: Failure },
}

impl ServerState {
    /// The stage this state belongs to, `None` once complete.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::AwaitingA => Some(Stage::A),
            Self::AwaitingB { .. } => Some(Stage::B),
            Self::AwaitingC => Some(Stage::C),
            Self::AwaitingD { .. } => Some(Stage::D),
            Self::Complete => None,
            Self::Failed { stage, .. } => Some(*stage),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed { .. })
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { stage, reason } => write!(f, "Failed({stage}, {reason:?})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    /// A UDP datagram, exactly as received.
    Datagram(&'a [u8]),
    /// The stage-C TCP connection was accepted.
    Connected,
    /// One expected-length slice read from the stage-D stream.
    Segment(&'a [u8]),
    TimedOut,
    TransportFailed,
    StreamClosed,
}

/// Frames to send in response to one event, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Effect {
    pub replies: Vec<Vec<u8>>,
}

impl Effect {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn reply(frame: Vec<u8>) -> Self {
        Self {
            replies: vec![frame],
        }
    }

    pub fn is_silent(&self) -> bool {
        self.replies.is_empty()
    }
}

/// Compute the next state and its effect.
///
/// Terminal states absorb every event.
pub fn transition(
    state: ServerState,
    params: &SessionParams,
    tag: u16,
    event: Event<'_>,
    ack: &mut dyn AckPolicy,
) -> (ServerState, Effect) {
    use ServerState::*;

    if state.is_terminal() {
        return (state, Effect::none());
    }
    let fail = |reason| Failed {
        stage: state.stage().unwrap_or(Stage::D),
        reason,
    };

    match (state, event) {
        (_, Event::TimedOut) => (fail(Failure::Timeout), Effect::none()),
        (_, Event::TransportFailed) => (fail(Failure::Transport), Effect::none()),
        (_, Event::StreamClosed) => (fail(Failure::Closed), Effect::none()),

        (AwaitingA, Event::Datagram(frame)) => {
            if !packet::matches(&packet::hello_frame(tag), frame) {
                return (fail(Failure::ProtocolViolation), Effect::none());
            }
            let reply = packet::stage_a_response(
                tag,
                params.packet_count,
                params.payload_size,
                params.udp_port,
                params.secret_a,
            );
            (AwaitingB { next_packet_id: 0 }, Effect::reply(reply))
        }

        (AwaitingB { next_packet_id }, Event::Datagram(frame)) => {
            let expected =
                packet::stage_b_request(tag, params.secret_a, next_packet_id, params.payload_size);
            if !packet::matches(&expected, frame) || !ack.should_ack(next_packet_id) {
                return (state, Effect::none());
            }

            let mut effect =
                Effect::reply(packet::stage_b_ack(tag, params.secret_a, next_packet_id));
            let acked = next_packet_id + 1;
            if acked < params.packet_count {
                return (AwaitingB { next_packet_id: acked }, effect);
            }
            effect.replies.push(packet::stage_b_complete(
                tag,
                params.secret_a,
                params.tcp_port,
                params.secret_b,
            ));
            (AwaitingC, effect)
        }

        (AwaitingC, Event::Connected) => {
            let reply = packet::stage_c_handoff(
                tag,
                params.secret_b,
                params.packet_count2,
                params.payload_size2,
                params.secret_c,
                params.fill_byte,
            );
            (AwaitingD { received: 0 }, Effect::reply(reply))
        }

        (AwaitingD { received }, Event::Segment(frame)) => {
            let expected = packet::stage_d_request(
                tag,
                params.secret_c,
                params.payload_size2,
                params.fill_byte,
            );
            if !packet::matches(&expected, frame) {
                return (fail(Failure::ProtocolViolation), Effect::none());
            }
            let received = received + 1;
            if received < params.packet_count2 {
                return (AwaitingD { received }, Effect::none());
            }
            let reply = packet::stage_d_result(tag, params.secret_c, params.secret_d);
            (Complete, Effect::reply(reply))
        }

        // Event does not belong to the current stage.
        _ => (fail(Failure::ProtocolViolation), Effect::none()),
    }
}

/// Server stage machine for one session.
pub struct Machine {
    state: ServerState,
    params: SessionParams,
    tag: u16,
    ack: Box<dyn AckPolicy>,
}

impl Machine {
    pub fn new(params: SessionParams, tag: u16, ack: Box<dyn AckPolicy>) -> Self {
        Self {
            state: ServerState::AwaitingA,
            params,
            tag,
            ack,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// Feed one event, advance, and return what must be sent.
    pub fn handle(&mut self, event: Event<'_>) -> Effect {
        let (next, effect) =
            transition(self.state, &self.params, self.tag, event, self.ack.as_mut());
        self.state = next;
        effect
    }

    /// Size of the next inbound frame in the current state, if one is expected.
    pub fn expected_len(&self) -> Option<usize> {
        match self.state {
            ServerState::AwaitingA => Some(packet::padded_len(HELLO.len())),
            ServerState::AwaitingB { .. } => {
                Some(packet::padded_len(4 + self.params.payload_size as usize))
            }
            ServerState::AwaitingD { .. } => {
                Some(packet::padded_len(self.params.payload_size2 as usize))
            }
            _ => None,
        }
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("state", &self.state)
            .field("params", &self.params)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}
