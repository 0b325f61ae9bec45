//! Reply values and conversions into Rust types.

use bytes::Bytes;

use crate::error::{RemqError, Result};

/// A single value of the RESP wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK` style status line.
    SimpleString(String),
    /// `-ERR ...` error reply.
    Error(String),
    /// `:42` signed integer.
    Integer(i64),
    /// `$n` length-prefixed binary string.
    BulkString(Bytes),
    /// Null bulk string or null array.
    Nil,
    /// `*n` array of nested values.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Returns `true` for the nil reply.
    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::Nil)
    }

    /// Returns `true` for an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Creates a bulk string value.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    /// Creates a status value.
    pub fn status(status: impl Into<String>) -> Self {
        RespValue::SimpleString(status.into())
    }

    /// Converts an error reply into `Err(RemqError::Remote)`, passing other values through.
    pub fn into_result(self) -> Result<RespValue> {
        match self {
            RespValue::Error(message) => Err(RemqError::Remote(message)),
            other => Ok(other),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            RespValue::SimpleString(_) => "simple string",
            RespValue::Error(_) => "error",
            RespValue::Integer(_) => "integer",
            RespValue::BulkString(_) => "bulk string",
            RespValue::Nil => "nil",
            RespValue::Array(_) => "array",
        }
    }
}

fn unexpected<T>(expected: &str, value: &RespValue) -> Result<T> {
    Err(RemqError::Protocol(format!(
        "expected {} reply, got {}",
        expected,
        value.kind()
    )))
}

/// Conversion from a decoded reply into a typed result.
///
/// Error replies always convert into [`RemqError::Remote`].
pub trait FromResp: Sized {
    /// Converts the reply.
    fn from_resp(value: RespValue) -> Result<Self>;
}

impl FromResp for RespValue {
    fn from_resp(value: RespValue) -> Result<Self> {
        value.into_result()
    }
}

impl FromResp for () {
    fn from_resp(value: RespValue) -> Result<Self> {
        value.into_result().map(|_| ())
    }
}

impl FromResp for i64 {
    fn from_resp(value: RespValue) -> Result<Self> {
        match value.into_result()? {
            RespValue::Integer(n) => Ok(n),
            RespValue::BulkString(data) => std::str::from_utf8(&data)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| RemqError::Protocol("bulk string is not an integer".to_string())),
            other => unexpected("integer", &other),
        }
    }
}

impl FromResp for usize {
    fn from_resp(value: RespValue) -> Result<Self> {
        let n = i64::from_resp(value)?;
        usize::try_from(n)
            .map_err(|_| RemqError::Protocol(format!("negative length in reply: {}", n)))
    }
}

impl FromResp for bool {
    fn from_resp(value: RespValue) -> Result<Self> {
        match value.into_result()? {
            RespValue::Integer(n) => Ok(n != 0),
            RespValue::SimpleString(s) => Ok(s == "OK"),
            RespValue::Nil => Ok(false),
            other => unexpected("integer", &other),
        }
    }
}

impl FromResp for String {
    fn from_resp(value: RespValue) -> Result<Self> {
        match value.into_result()? {
            RespValue::SimpleString(s) => Ok(s),
            RespValue::BulkString(data) => String::from_utf8(data.to_vec())
                .map_err(|e| RemqError::Protocol(format!("reply is not UTF-8: {}", e))),
            RespValue::Integer(n) => Ok(n.to_string()),
            other => unexpected("string", &other),
        }
    }
}

impl FromResp for Bytes {
    fn from_resp(value: RespValue) -> Result<Self> {
        match value.into_result()? {
            RespValue::BulkString(data) => Ok(data),
            RespValue::SimpleString(s) => Ok(Bytes::from(s)),
            other => unexpected("bulk string", &other),
        }
    }
}

impl<T: FromResp> FromResp for Option<T> {
    fn from_resp(value: RespValue) -> Result<Self> {
        match value.into_result()? {
            RespValue::Nil => Ok(None),
            other => T::from_resp(other).map(Some),
        }
    }
}

impl<T: FromResp> FromResp for Vec<T> {
    fn from_resp(value: RespValue) -> Result<Self> {
        match value.into_result()? {
            RespValue::Array(items) => items.into_iter().map(T::from_resp).collect(),
            RespValue::Nil => Ok(Vec::new()),
            other => unexpected("array", &other),
        }
    }
}
