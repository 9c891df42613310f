use crate::error::ProxyError;
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::packet::MysqlPacket;

use num_traits::FromPrimitive;
use strum_macros::AsRefStr;

/// Post-handshake client command, extracted from a wire packet's first
/// payload byte. Only `Query` carries data: the SQL text verbatim (no
/// UTF-8 assumption) plus the sequence id the response framing must
/// continue from.
#[derive(Debug, Clone, PartialEq, Eq, AsRefStr)]
pub enum CommandPacket {
    Quit,
    InitDb { schema: Vec<u8> },
    Query { seq: u8, sql: Vec<u8> },
    FieldList,
    Statistics,
    ProcessInfo,
    Ping,
    ChangeUser,
    StmtPrepare,
    StmtExecute,
    StmtSendLongData,
    StmtClose,
    StmtReset,
    SetOption,
    StmtFetch,
    ResetConnection,
    Unknown,
}

impl CommandPacket {
    /// True for commands whose handling never consults the classifier,
    /// injection detector, or policy evaluator.
    pub fn is_passthrough(&self) -> bool {
        !matches!(self, CommandPacket::Query { .. })
    }
}

/// Maps a post-handshake packet to its command. Empty payloads and bytes
/// outside the recognized set are parse errors; the caller converts them
/// into a blocked query, never a relayed one.
pub fn extract_command(pkt: &MysqlPacket) -> Result<CommandPacket, ProxyError> {
    let first = match pkt.payload.first() {
        Some(b) => *b,
        None => {
            return Err(ProxyError::MalformedPacket(
                "empty command packet".to_string(),
            ))
        }
    };
    let code = CommandCode::from_u8(first)
        .ok_or_else(|| ProxyError::UnsupportedCommand(format!("command byte 0x{first:02x}")))?;
    let command = match code {
        CommandCode::ComQuit => CommandPacket::Quit,
        CommandCode::ComInitDB => CommandPacket::InitDb {
            schema: pkt.payload[1..].to_vec(),
        },
        CommandCode::ComQuery => CommandPacket::Query {
            seq: pkt.seq,
            sql: pkt.payload[1..].to_vec(),
        },
        CommandCode::ComFieldList => CommandPacket::FieldList,
        CommandCode::ComStatistics => CommandPacket::Statistics,
        CommandCode::ComProcessInfo => CommandPacket::ProcessInfo,
        CommandCode::ComPing => CommandPacket::Ping,
        CommandCode::ComChangeUser => CommandPacket::ChangeUser,
        CommandCode::ComStmtPrepare => CommandPacket::StmtPrepare,
        CommandCode::ComStmtExecute => CommandPacket::StmtExecute,
        CommandCode::ComStmtSendLongData => CommandPacket::StmtSendLongData,
        CommandCode::ComStmtClose => CommandPacket::StmtClose,
        CommandCode::ComStmtReset => CommandPacket::StmtReset,
        CommandCode::ComSetOption => CommandPacket::SetOption,
        CommandCode::ComStmtFetch => CommandPacket::StmtFetch,
        CommandCode::ComResetConnection => CommandPacket::ResetConnection,
        other => {
            return Err(ProxyError::UnsupportedCommand(format!(
                "{} (0x{first:02x})",
                other.as_ref()
            )))
        }
    };
    Ok(command)
}
