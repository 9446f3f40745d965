//! Error types shared across the core.

use thiserror::Error;

/// A bounded lock acquisition gave up before it could take the lock.
///
/// Nothing was read or written. Callers retry on their next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("store busy")]
pub struct Busy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("request head incomplete")]
    Incomplete,
    #[error("request head too large")]
    TooLarge,
    #[error("malformed request line")]
    BadRequestLine,
    #[error("request is not valid utf-8")]
    Encoding,
}

/// Failures an API handler reports to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("{0}")]
    Internal(&'static str),
    #[error("store busy")]
    Busy,
}

impl ApiError {
    pub const fn status(self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::Unauthorized => 401,
            ApiError::NotFound => 404,
            ApiError::MethodNotAllowed => 405,
            ApiError::PayloadTooLarge => 413,
            ApiError::Internal(_) => 500,
            ApiError::Busy => 503,
        }
    }
}

impl From<Busy> for ApiError {
    fn from(_: Busy) -> Self {
        ApiError::Busy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MqttError {
    #[error("output buffer too small")]
    BufferTooSmall,
    #[error("malformed remaining length")]
    BadLength,
    #[error("malformed packet")]
    Malformed,
    #[error("broker refused connection (code {0})")]
    Refused(u8),
    #[error("connection lost")]
    Transport,
    #[error("broker not responding")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("image larger than staging area")]
    TooLarge,
    #[error("image length unknown")]
    MissingLength,
    #[error("more data than declared")]
    Overrun,
    #[error("image truncated")]
    Truncated,
    #[error("not a firmware image")]
    BadMagic,
    #[error("staged image failed read-back check")]
    Corrupt,
    #[error("flash access failed")]
    Flash,
    #[error("flash handshake timed out")]
    Handshake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("value too long")]
    TooLong,
    #[error("settings store full")]
    Full,
    #[error("record corrupt")]
    Corrupt,
    #[error("flash write failed")]
    Flash,
    #[error("flash handshake timed out")]
    Handshake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DisplayError {
    #[error("display not acknowledging")]
    Nack,
    #[error("bus error")]
    Bus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("radio configuration rejected")]
    Config,
    #[error("radio failed to start")]
    Start,
}
