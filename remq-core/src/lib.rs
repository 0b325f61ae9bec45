//! Core types and protocols for remq.
//!
//! Holds the pieces shared by every layer of the client: the error taxonomy,
//! the RESP codec with its command and reply models, and item serialization.

#![warn(missing_docs)]

pub mod error;
pub mod protocol;
pub mod serialization;

pub use error::{RemqError, Result};
pub use protocol::{Command, CommandKind, FromResp, RespCodec, RespValue};
