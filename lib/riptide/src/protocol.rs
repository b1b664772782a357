//! Message types and payload records of the cluster protocol.
//!
//! Payloads are MessagePack records: maps with string keys, raw byte
//! strings for binary fields. The envelope around them lives in
//! [`crate::net::pkg`].

use serde_derive::{Deserialize, Serialize};
use std::convert::TryFrom;

/// Types at or above this value are replies and complete promises; below
/// it they are requests routed to a handler.
pub const RESPONSE_BASE: u8 = 0x40;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum Tp {
    // Requests.
    ReqClientAuth = 0x01,
    ReqServerAuth = 0x02,
    ReqFlagsUpdate = 0x03,
    ReqPing = 0x04,

    // Replies.
    ResClientAuthSuccess = 0x40,
    ResServerAuthSuccess = 0x41,
    ResAck = 0x42,
    ResErrMsg = 0x43,
    ErrAuthUnknownDb = 0x44,
    ErrAuthCredentials = 0x45,
    ErrServerAuthInvalidUuid = 0x46,
    ErrServerAuthVersionTooOld = 0x47,
    ErrServerAuthVersionTooNew = 0x48,
    ErrServerAuthUnknownDbname = 0x49,
    ErrServerAuthUnknownUuid = 0x4A,
    ErrUnavailable = 0x4B,
    ErrInvalidRequest = 0x4C,
}

impl Tp {
    /// Replies complete a pending promise; requests get a handler.
    #[inline]
    pub fn is_response(self) -> bool {
        self as u8 >= RESPONSE_BASE
    }
}

impl From<Tp> for u8 {
    #[inline]
    fn from(tp: Tp) -> u8 {
        tp as u8
    }
}

impl TryFrom<u8> for Tp {
    type Error = u8;

    fn try_from(value: u8) -> Result<Tp, u8> {
        Ok(match value {
            0x01 => Tp::ReqClientAuth,
            0x02 => Tp::ReqServerAuth,
            0x03 => Tp::ReqFlagsUpdate,
            0x04 => Tp::ReqPing,
            0x40 => Tp::ResClientAuthSuccess,
            0x41 => Tp::ResServerAuthSuccess,
            0x42 => Tp::ResAck,
            0x43 => Tp::ResErrMsg,
            0x44 => Tp::ErrAuthUnknownDb,
            0x45 => Tp::ErrAuthCredentials,
            0x46 => Tp::ErrServerAuthInvalidUuid,
            0x47 => Tp::ErrServerAuthVersionTooOld,
            0x48 => Tp::ErrServerAuthVersionTooNew,
            0x49 => Tp::ErrServerAuthUnknownDbname,
            0x4A => Tp::ErrServerAuthUnknownUuid,
            0x4B => Tp::ErrUnavailable,
            0x4C => Tp::ErrInvalidRequest,
            unknown => return Err(unknown),
        })
    }
}

/// Client authentication request.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientAuthReq {
    pub username: String,
    pub password: String,
    pub dbname: String,
}

/// Backend handshake request. The uuid travels as a raw byte string; its
/// length is validated by the responder, not the codec.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerAuthReq {
    #[serde(with = "serde_bytes")]
    pub uuid: Vec<u8>,
    pub dbname: String,
    pub version: String,
    pub min_version: String,
}

/// Liveness flag broadcast.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct FlagsUpdate {
    pub flags: u8,
}

/// Error reply record.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrMsg {
    pub error_msg: String,
}
