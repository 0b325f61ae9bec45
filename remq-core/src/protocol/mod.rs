//! RESP wire protocol implementation.
//!
//! This module provides the command model, the reply value model and the
//! framed codec used to talk to the server.

mod codec;
mod command;
mod value;

pub use codec::{RespCodec, MAX_BULK_LENGTH, MAX_NESTING_DEPTH};
pub use command::{format_wait, Command, CommandKind, IntoArg};
pub use value::{FromResp, RespValue};
