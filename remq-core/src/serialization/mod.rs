//! Item serialization for values stored in remote structures.
//!
//! Items travel as JSON documents, so any type implementing
//! `serde::Serialize` and `serde::DeserializeOwned` can be queued:
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use remq_core::serialization::{decode_item, encode_item};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Job {
//!     id: u64,
//!     name: String,
//! }
//!
//! let job = Job { id: 7, name: "resize".to_string() };
//! let bytes = encode_item(&job).unwrap();
//! let back: Job = decode_item(&bytes).unwrap();
//! assert_eq!(back, job);
//! ```

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{RemqError, Result};
use crate::protocol::RespValue;

/// Encodes an item into its wire form.
pub fn encode_item<T: Serialize + ?Sized>(item: &T) -> Result<Bytes> {
    serde_json::to_vec(item)
        .map(Bytes::from)
        .map_err(|e| RemqError::Serialization(e.to_string()))
}

/// Decodes an item from its wire form.
pub fn decode_item<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| RemqError::Serialization(e.to_string()))
}

/// Decodes a bulk-string reply into an item, mapping nil to `None`.
pub fn decode_reply<T: DeserializeOwned>(value: RespValue) -> Result<Option<T>> {
    match value.into_result()? {
        RespValue::Nil => Ok(None),
        RespValue::BulkString(data) => decode_item(&data).map(Some),
        other => Err(RemqError::Protocol(format!(
            "expected item reply, got {:?}",
            other
        ))),
    }
}

/// Decodes an array reply of items.
pub fn decode_reply_list<T: DeserializeOwned>(value: RespValue) -> Result<Vec<T>> {
    match value.into_result()? {
        RespValue::Nil => Ok(Vec::new()),
        RespValue::Array(items) => items
            .into_iter()
            .map(|item| {
                decode_reply(item)?.ok_or_else(|| {
                    RemqError::Protocol("nil element in item list".to_string())
                })
            })
            .collect(),
        other => Err(RemqError::Protocol(format!(
            "expected item list reply, got {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_integer_items_are_plain_json() {
        assert_eq!(encode_item(&123).unwrap(), Bytes::from_static(b"123"));
        assert_eq!(decode_item::<i32>(b"123").unwrap(), 123);
    }

    #[test]
    fn test_struct_item() {
        let bytes = encode_item(&Point { x: 1, y: -2 }).unwrap();
        assert_eq!(decode_item::<Point>(&bytes).unwrap(), Point { x: 1, y: -2 });
    }

    #[test]
    fn test_decode_invalid_item_fails() {
        let err = decode_item::<i32>(b"not-json").unwrap_err();
        assert!(matches!(err, RemqError::Serialization(_)));
    }

    #[test]
    fn test_decode_reply_nil() {
        assert_eq!(decode_reply::<i32>(RespValue::Nil).unwrap(), None);
        assert_eq!(decode_reply::<i32>(RespValue::bulk("5")).unwrap(), Some(5));
    }

    #[test]
    fn test_decode_reply_error() {
        let err = decode_reply::<i32>(RespValue::Error("ERR".to_string())).unwrap_err();
        assert!(matches!(err, RemqError::Remote(_)));
    }

    #[test]
    fn test_decode_reply_list() {
        let value = RespValue::Array(vec![RespValue::bulk("1"), RespValue::bulk("2")]);
        assert_eq!(decode_reply_list::<i32>(value).unwrap(), vec![1, 2]);
        assert!(decode_reply_list::<i32>(RespValue::Array(vec![RespValue::Nil])).is_err());
    }
}
