//! Server-response decoding the relay needs: just enough of the OK and EOF
//! packet layouts to track status flags across a result-set walk.

use mysql_common::constants::{CapabilityFlags, StatusFlags};
use winnow::binary::{le_u16, le_u8};
use winnow::prelude::*;
use winnow::token::take;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OkPacket {
    pub header: u8,
    /// affected rows in update/insert
    pub affected_rows: u64,
    /// insert_id in update/insert
    pub last_insert_id: u64,
    /// StatusFlags associated with this query
    pub status_flags: StatusFlags,
    /// Warnings
    pub warnings: u16,
}

pub fn read_length_encoded_number(i: &[u8]) -> IResult<&[u8], u64> {
    let (i, b) = le_u8.parse_peek(i)?;
    let r_size: usize = match b {
        0xfb => return Ok((i, 0)),
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        _ => return Ok((i, b as u64)),
    };
    let mut bytes = [0u8; 8];
    let (i, b) = take(r_size).parse_peek(i)?;
    bytes[..r_size].copy_from_slice(b);
    Ok((i, u64::from_le_bytes(bytes)))
}

pub fn ok_packet(i: &[u8], _capabilities: CapabilityFlags) -> IResult<&[u8], OkPacket> {
    let (i, header) = le_u8.parse_peek(i)?;
    let (i, affected_rows) = read_length_encoded_number(i)?;
    let (i, last_insert_id) = read_length_encoded_number(i)?;
    let (i, status_flags_value) = le_u16.parse_peek(i)?;
    let status_flags = StatusFlags::from_bits_retain(status_flags_value);
    let (i, warnings) = le_u16.parse_peek(i)?;

    Ok((
        i,
        OkPacket {
            header,
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
        },
    ))
}

/// EOF packet layout: 0xfe, warnings (2), status flags (2). Short EOF
/// packets from a broken upstream carry no flags rather than erroring;
/// the relay treats them like any other flagless terminator.
pub fn eof_server_status(i: &[u8]) -> IResult<&[u8], StatusFlags> {
    if i.len() < 5 {
        return Ok((&i[i.len()..], StatusFlags::empty()));
    }
    let status_flag_slice = &i[3..i.len()];
    let (i, status_flags_code) = le_u16.parse_peek(status_flag_slice)?;
    Ok((i, StatusFlags::from_bits_truncate(status_flags_code)))
}

/// Fallible helper for the relay: a server OK whose body will not parse is
/// treated as carrying no status flags rather than killing the session.
pub fn ok_status_flags(payload: &[u8], capabilities: CapabilityFlags) -> StatusFlags {
    match ok_packet(payload, capabilities) {
        Ok((_, ok)) => ok.status_flags,
        Err(_) => StatusFlags::empty(),
    }
}
