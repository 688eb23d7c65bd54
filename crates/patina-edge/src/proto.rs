//! Wire protocol constants.
//!
//! A message on the wire is `<type:u8> <length:u32> <payload>`, where
//! `length` counts itself plus the payload. Integers are big-endian,
//! strings are u32-length-prefixed UTF-8 unless noted otherwise.

use patina_types::unit::TxStatus;

pub const PROTO_VER: (i16, i16) = (1, 0);

// client -> server
pub const MSG_CLIENT_HANDSHAKE: u8 = b'0';
pub const MSG_PARSE: u8 = b'P';
pub const MSG_DESCRIBE: u8 = b'D';
pub const MSG_EXECUTE: u8 = b'E';
pub const MSG_OPPORTUNISTIC_EXECUTE: u8 = b'O';
pub const MSG_SIMPLE_QUERY: u8 = b'Q';
pub const MSG_SYNC: u8 = b'S';
pub const MSG_LEGACY: u8 = b'L';
pub const MSG_FLUSH: u8 = b'H';

// server -> client
pub const MSG_AUTH: u8 = b'R';
pub const MSG_BACKEND_KEY: u8 = b'K';
pub const MSG_PARAM_STATUS: u8 = b'S';
pub const MSG_READY_FOR_QUERY: u8 = b'Z';
pub const MSG_PARSE_COMPLETE: u8 = b'1';
pub const MSG_TYPE_DESC: u8 = b'T';
pub const MSG_COMMAND_COMPLETE: u8 = b'C';
pub const MSG_LEGACY_RESULT: u8 = b'L';
pub const MSG_ERROR: u8 = b'E';

pub const AUTH_OK: i32 = 0;

pub const OUTPUT_BINARY: u8 = b'b';
pub const OUTPUT_JSON: u8 = b'j';

pub const LEGACY_LANG_GRAPHQL: u8 = b'g';

pub const DESCRIBE_TYPE: u8 = b'T';

/// ParseComplete / TypeDescribe flag bits.
pub const FLAG_HAS_RESULT: i32 = 1;
pub const FLAG_SINGLETON_RESULT: i32 = 2;

/// ReadyForQuery status bytes.
pub const STATUS_IDLE: u8 = b'I';
pub const STATUS_IN_TRANS: u8 = b'T';
pub const STATUS_IN_ERROR: u8 = b'E';

pub fn status_byte(status: TxStatus) -> u8 {
    match status {
        TxStatus::Idle => STATUS_IDLE,
        TxStatus::InTrans => STATUS_IN_TRANS,
        TxStatus::InError => STATUS_IN_ERROR,
    }
}

/// Outbound data is flushed once this much is buffered. Flushing only
/// ever happens at message boundaries.
pub const FLUSH_THRESHOLD: usize = 100_000;
