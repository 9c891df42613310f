use mysql_common::constants::CapabilityFlags;
use num_derive::{FromPrimitive, ToPrimitive};
use strum_macros::AsRefStr;

// see: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html
// max packet payload length (3-byte little-endian length field).
pub const MAX_PAYLOAD_LEN: usize = 16_777_215;

pub const PACKET_HEADER_LEN: usize = 4;

/// ERR packet fixed overhead: header byte, error code, `#` marker, sql state.
pub const ERR_PACKET_OVERHEAD: usize = 9;

/// Smallest HandshakeResponse41 the relay will accept: 4 capability bytes,
/// 4 max-packet bytes, 1 charset byte, 23 filler bytes, and at least the
/// username terminator.
pub const HANDSHAKE_RESPONSE_MIN_LEN: usize = 33;

/// Auth exchanges longer than this many client round trips are treated as
/// hostile (loop-bomb defense) and terminate the session.
pub const MAX_AUTH_ROUND_TRIPS: u32 = 10;

/// caching_sha2_password fast-auth success marker, second byte of an
/// AuthMoreData packet.
pub const FAST_AUTH_SUCCESS: u8 = 0x03;

/// First byte of the un-framed RSA public key caching_sha2_password sends
/// during full authentication (`-----BEGIN PUBLIC KEY-----`).
pub const RSA_PUBLIC_KEY_MARKER: u8 = b'-';

/// Capability bits the proxy cannot honor and therefore clears from both
/// sides of the handshake:
/// - CLIENT_SSL: no TLS termination.
/// - CLIENT_DEPRECATE_EOF: the response relay walks the legacy result-set
///   framing (column definitions, EOF, rows, EOF).
/// - CLIENT_QUERY_ATTRIBUTES: the attribute header would sit between the
///   COM_QUERY byte and the SQL text and break extraction.
pub fn stripped_capabilities() -> CapabilityFlags {
    CapabilityFlags::CLIENT_SSL
        | CapabilityFlags::CLIENT_DEPRECATE_EOF
        | CapabilityFlags::CLIENT_QUERY_ATTRIBUTES
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive, AsRefStr)]
#[repr(u8)]
pub enum CommandCode {
    ComSleep = 0,
    ComQuit,
    ComInitDB,
    ComQuery,
    ComFieldList,
    ComCreateDB,
    ComDropDB,
    ComRefresh,
    ComShutdown,
    ComStatistics,
    ComProcessInfo,
    ComConnect,
    ComProcessKill,
    ComDebug,
    ComPing,
    ComTime,
    ComDelayedInsert,
    ComChangeUser,
    ComBinlogDump,
    ComTableDump,
    ComConnectOut,
    ComRegisterSlave,
    ComStmtPrepare,
    ComStmtExecute,
    ComStmtSendLongData,
    ComStmtClose,
    ComStmtReset,
    ComSetOption,
    ComStmtFetch,
    ComDaemon,
    ComBinlogDumpGtid,
    ComResetConnection,
    ComEnd,
}
