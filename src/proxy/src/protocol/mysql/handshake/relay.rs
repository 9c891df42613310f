use crate::error::ProxyError;
use crate::protocol::mysql::handshake::response::{
    client_handshake_fields, strip_client_response, strip_server_greeting,
};
use crate::protocol::mysql::handshake::{
    classify_auth_response, transition, HandshakeState, StepAction,
};
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::MysqlPacket;
use crate::session::SessionContext;

use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Carries MySQL's authentication exchange between client and server
/// without interpreting plugin-specific material. The state machine lives
/// in [`transition`]; this driver only moves packets, strips capability
/// bits on the two packets that advertise them, and pulls the username and
/// initial database out of the client response.
pub struct HandshakeRelay {
    state: HandshakeState,
    round_trips: u32,
}

impl Default for HandshakeRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeRelay {
    pub fn new() -> Self {
        HandshakeRelay {
            state: HandshakeState::WaitServerGreeting,
            round_trips: 0,
        }
    }

    pub async fn run<CR, CW, SR, SW>(
        &mut self,
        client_reader: &mut PacketReader<CR>,
        client_writer: &mut PacketWriter<CW>,
        server_reader: &mut PacketReader<SR>,
        server_writer: &mut PacketWriter<SW>,
        ctx: &mut SessionContext,
    ) -> Result<(), ProxyError>
    where
        CR: AsyncRead + Send + Unpin,
        CW: AsyncWrite + Send + Unpin,
        SR: AsyncRead + Send + Unpin,
        SW: AsyncWrite + Send + Unpin,
    {
        loop {
            let pkt = if self.state.expects_server() {
                server_reader.next_packet().await?
            } else {
                client_reader.next_packet().await?
            };
            let pkt = pkt.ok_or_else(|| {
                ProxyError::Io(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "peer closed during handshake",
                ))
            })?;

            // The two packets the relay must look inside; everything else
            // is forwarded byte-identical.
            let outgoing = match self.state {
                HandshakeState::WaitServerGreeting => {
                    if pkt.is_err_packet() {
                        // server refused the connection outright; hand its
                        // ERR to the client, then give up
                        client_writer.write_packet(&pkt).await?;
                        client_writer.flush_all().await?;
                        return Err(ProxyError::InternalError(
                            "upstream rejected connection".to_string(),
                        ));
                    }
                    strip_server_greeting(&pkt.payload)?
                }
                HandshakeState::WaitClientResponse => {
                    let fields = client_handshake_fields(&pkt.payload)?;
                    ctx.user = Some(String::from_utf8_lossy(&fields.username).into_owned());
                    ctx.database = fields
                        .database
                        .as_deref()
                        .map(|db| String::from_utf8_lossy(db).into_owned());
                    strip_client_response(&pkt.payload)?
                }
                _ => pkt.payload.clone(),
            };

            let class = classify_auth_response(&pkt.payload);
            let step = transition(self.state, class, &pkt.payload, self.round_trips)?;

            let out = MysqlPacket::new(pkt.seq, outgoing);
            match step.action {
                StepAction::RelayToClient => {
                    client_writer.write_packet(&out).await?;
                    client_writer.flush_all().await?;
                }
                StepAction::RelayToServer => {
                    server_writer.write_packet(&out).await?;
                    server_writer.flush_all().await?;
                }
            }
            if step.round_trip {
                self.round_trips += 1;
            }

            match step.next {
                HandshakeState::Done => {
                    ctx.handshake_done = true;
                    debug!(
                        session_id = ctx.session_id,
                        user = ctx.user.as_deref().unwrap_or(""),
                        "handshake relay complete"
                    );
                    return Ok(());
                }
                HandshakeState::Failed => {
                    // the server's ERR/EOF went to the client above
                    warn!(session_id = ctx.session_id, "upstream authentication failed");
                    return Err(ProxyError::InternalError(
                        "upstream authentication failed".to_string(),
                    ));
                }
                next => self.state = next,
            }
        }
    }
}
