pub mod relay;
pub mod response;

pub use relay::HandshakeRelay;

use crate::error::ProxyError;
use crate::protocol::mysql::constants::{
    FAST_AUTH_SUCCESS, MAX_AUTH_ROUND_TRIPS, RSA_PUBLIC_KEY_MARKER,
};

/// Authentication relay states. `WaitServer*` states read from the
/// upstream, `WaitClient*` states read from the client; `Done` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    WaitServerGreeting,
    WaitClientResponse,
    WaitServerAuth,
    WaitClientAuthSwitch,
    WaitServerAuthSwitch,
    WaitClientMoreData,
    WaitServerMoreData,
    Done,
    Failed,
}

impl HandshakeState {
    pub fn expects_server(self) -> bool {
        matches!(
            self,
            HandshakeState::WaitServerGreeting
                | HandshakeState::WaitServerAuth
                | HandshakeState::WaitServerAuthSwitch
                | HandshakeState::WaitServerMoreData
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Done | HandshakeState::Failed)
    }
}

/// Pure classification of a server auth packet, independent of state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthClass {
    Ok,
    Error,
    Eof,
    AuthSwitch,
    AuthMoreData,
    Unknown,
}

pub fn classify_auth_response(payload: &[u8]) -> AuthClass {
    match payload.first().copied() {
        Some(0x00) => AuthClass::Ok,
        Some(0xff) => AuthClass::Error,
        Some(0xfe) if payload.len() < 9 => AuthClass::Eof,
        Some(0xfe) => AuthClass::AuthSwitch,
        Some(0x01) => AuthClass::AuthMoreData,
        _ => AuthClass::Unknown,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    RelayToClient,
    RelayToServer,
}

/// One table entry: where to forward the packet just read, which state
/// follows, and whether this transition consumes a client round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeStep {
    pub next: HandshakeState,
    pub action: StepAction,
    pub round_trip: bool,
}

fn step(next: HandshakeState, action: StepAction) -> HandshakeStep {
    HandshakeStep {
        next,
        action,
        round_trip: false,
    }
}

/// Entering a waiting-for-client state inside the AuthSwitch/MoreData loop
/// costs a round trip; the cap bounds hostile servers that ping-pong the
/// exchange forever.
fn client_round_trip(next: HandshakeState, round_trips: u32) -> Result<HandshakeStep, ProxyError> {
    if round_trips + 1 >= MAX_AUTH_ROUND_TRIPS {
        return Err(ProxyError::MalformedPacket(
            "exceeded max round trips".to_string(),
        ));
    }
    Ok(HandshakeStep {
        next,
        action: StepAction::RelayToClient,
        round_trip: true,
    })
}

fn nested_auth_switch() -> ProxyError {
    ProxyError::MalformedPacket("nested auth switch request".to_string())
}

fn unexpected_auth_packet(payload: &[u8]) -> ProxyError {
    ProxyError::MalformedPacket(format!(
        "unexpected auth packet first byte {:?}",
        payload.first()
    ))
}

/// The transition table as a pure function. Illegal combinations (nested
/// AuthSwitch, unknown first byte, round-trip cap) come back as parse
/// errors and the caller forwards nothing; a `Failed` step means the
/// offending server packet (ERR or EOF) is relayed to the client first.
pub fn transition(
    state: HandshakeState,
    class: AuthClass,
    payload: &[u8],
    round_trips: u32,
) -> Result<HandshakeStep, ProxyError> {
    match state {
        HandshakeState::WaitServerGreeting => Ok(step(
            HandshakeState::WaitClientResponse,
            StepAction::RelayToClient,
        )),
        HandshakeState::WaitClientResponse => Ok(step(
            HandshakeState::WaitServerAuth,
            StepAction::RelayToServer,
        )),
        HandshakeState::WaitClientAuthSwitch => Ok(step(
            HandshakeState::WaitServerAuthSwitch,
            StepAction::RelayToServer,
        )),
        HandshakeState::WaitClientMoreData => Ok(step(
            HandshakeState::WaitServerMoreData,
            StepAction::RelayToServer,
        )),
        HandshakeState::WaitServerAuth => match class {
            AuthClass::Ok => Ok(step(HandshakeState::Done, StepAction::RelayToClient)),
            AuthClass::Error | AuthClass::Eof => {
                Ok(step(HandshakeState::Failed, StepAction::RelayToClient))
            }
            AuthClass::AuthSwitch => {
                client_round_trip(HandshakeState::WaitClientAuthSwitch, round_trips)
            }
            AuthClass::AuthMoreData => {
                if payload.get(1) == Some(&FAST_AUTH_SUCCESS) {
                    // caching_sha2_password fast-auth success: the OK packet
                    // follows from the server with no client response.
                    Ok(step(
                        HandshakeState::WaitServerMoreData,
                        StepAction::RelayToClient,
                    ))
                } else {
                    client_round_trip(HandshakeState::WaitClientMoreData, round_trips)
                }
            }
            AuthClass::Unknown => Err(unexpected_auth_packet(payload)),
        },
        HandshakeState::WaitServerAuthSwitch => match class {
            AuthClass::Ok => Ok(step(HandshakeState::Done, StepAction::RelayToClient)),
            AuthClass::Error | AuthClass::Eof => {
                Ok(step(HandshakeState::Failed, StepAction::RelayToClient))
            }
            AuthClass::AuthSwitch => Err(nested_auth_switch()),
            AuthClass::AuthMoreData => {
                client_round_trip(HandshakeState::WaitClientMoreData, round_trips)
            }
            AuthClass::Unknown => Err(unexpected_auth_packet(payload)),
        },
        HandshakeState::WaitServerMoreData => match class {
            AuthClass::Ok => Ok(step(HandshakeState::Done, StepAction::RelayToClient)),
            AuthClass::Error | AuthClass::Eof => {
                Ok(step(HandshakeState::Failed, StepAction::RelayToClient))
            }
            AuthClass::AuthSwitch => Err(nested_auth_switch()),
            AuthClass::AuthMoreData => {
                client_round_trip(HandshakeState::WaitClientMoreData, round_trips)
            }
            AuthClass::Unknown if payload.first() == Some(&RSA_PUBLIC_KEY_MARKER) => {
                // caching_sha2_password full auth: the server ships its RSA
                // public key as a plain packet starting with '-'. The client
                // answers with the encrypted password, so this is an
                // ordinary round-trip continuation.
                client_round_trip(HandshakeState::WaitClientMoreData, round_trips)
            }
            AuthClass::Unknown => Err(unexpected_auth_packet(payload)),
        },
        HandshakeState::Done | HandshakeState::Failed => Err(ProxyError::InternalError(
            "transition on terminal handshake state".to_string(),
        )),
    }
}
