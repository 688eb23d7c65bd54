//! The client-visible error taxonomy.
//!
//! Every error written to the wire carries a `u32` code unique to its
//! class plus a map of single-byte attribute keys to string values.

use std::collections::BTreeMap;

pub mod codes {
    pub const INTERNAL_SERVER_ERROR: u32 = 0x_01_00_00_00;
    pub const UNSUPPORTED_FEATURE_ERROR: u32 = 0x_02_00_00_00;
    pub const PROTOCOL_ERROR: u32 = 0x_03_00_00_00;
    pub const BINARY_PROTOCOL_ERROR: u32 = 0x_03_01_00_00;
    pub const UNSUPPORTED_PROTOCOL_VERSION_ERROR: u32 = 0x_03_01_00_01;
    pub const TYPE_SPEC_NOT_FOUND_ERROR: u32 = 0x_03_01_00_02;
    pub const UNEXPECTED_MESSAGE_ERROR: u32 = 0x_03_01_00_03;
    pub const QUERY_ERROR: u32 = 0x_04_00_00_00;
    pub const INVALID_SYNTAX_ERROR: u32 = 0x_04_01_00_00;
    pub const EXECUTION_ERROR: u32 = 0x_05_00_00_00;
    pub const ACCESS_ERROR: u32 = 0x_07_00_00_00;
    pub const AUTHENTICATION_ERROR: u32 = 0x_07_01_00_00;
    pub const TRANSACTION_ERROR: u32 = 0x_0a_00_00_00;
}

/// Single-byte attribute keys carried alongside an error message.
pub mod fields {
    pub const HINT: u8 = b'H';
    pub const DETAILS: u8 = b'D';
    pub const POSITION_START: u8 = b'P';
    pub const POSITION_END: u8 = b'p';
    pub const LINE: u8 = b'L';
    pub const COLUMN: u8 = b'C';
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ServerError {
    pub code: u32,
    pub message: String,
    pub attributes: BTreeMap<u8, String>,
}

impl ServerError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: u8, value: impl Into<String>) -> Self {
        self.attributes.insert(key, value.into());
        self
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(codes::PROTOCOL_ERROR, message)
    }

    pub fn binary_protocol(message: impl Into<String>) -> Self {
        Self::new(codes::BINARY_PROTOCOL_ERROR, message)
    }

    pub fn unsupported_feature(message: impl Into<String>) -> Self {
        Self::new(codes::UNSUPPORTED_FEATURE_ERROR, message)
    }

    pub fn unsupported_protocol_version(message: impl Into<String>) -> Self {
        Self::new(codes::UNSUPPORTED_PROTOCOL_VERSION_ERROR, message)
    }

    pub fn type_spec_not_found(message: impl Into<String>) -> Self {
        Self::new(codes::TYPE_SPEC_NOT_FOUND_ERROR, message)
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(codes::TRANSACTION_ERROR, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(codes::AUTHENTICATION_ERROR, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_SERVER_ERROR, message)
    }
}
