//! Immutable command descriptions.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

/// Whether a command may park on the server waiting for data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Answered immediately by the server.
    NonBlocking,
    /// May wait server-side; the reply arrives when data shows up or the wait ends.
    Blocking {
        /// Position in the argument list of the server-side wait budget, if any.
        wait_arg: Option<usize>,
    },
}

/// A value usable as a command argument.
pub trait IntoArg {
    /// Converts into the wire representation.
    fn into_arg(self) -> Bytes;
}

impl IntoArg for Bytes {
    fn into_arg(self) -> Bytes {
        self
    }
}

impl IntoArg for Vec<u8> {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for &[u8] {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl IntoArg for String {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for &str {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl IntoArg for &String {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

macro_rules! int_arg {
    ($($t:ty),*) => {
        $(impl IntoArg for $t {
            fn into_arg(self) -> Bytes {
                Bytes::from(self.to_string())
            }
        })*
    };
}

int_arg!(i64, u64, usize, u32);

/// Formats a server-side wait budget in seconds.
///
/// `None` waits forever and encodes as `0`. A positive budget never rounds down to
/// zero, since zero would turn a short wait into an unbounded one.
pub fn format_wait(wait: Option<Duration>) -> String {
    match wait {
        None => "0".to_string(),
        Some(d) => {
            let millis = d.as_millis().max(1);
            format!("{}.{:03}", millis / 1000, millis % 1000)
        }
    }
}

/// A command name plus ordered arguments, with its blocking classification.
///
/// Commands are immutable once built; re-sending a blocking command after a
/// reconnect derives a fresh copy with [`Command::with_wait`].
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    name: &'static str,
    args: Vec<Bytes>,
    kind: CommandKind,
}

impl Command {
    /// Creates a non-blocking command.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            args: Vec::new(),
            kind: CommandKind::NonBlocking,
        }
    }

    /// Creates a blocking command.
    pub fn blocking(name: &'static str) -> Self {
        Self {
            name,
            args: Vec::new(),
            kind: CommandKind::Blocking { wait_arg: None },
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl IntoArg) -> Self {
        self.args.push(arg.into_arg());
        self
    }

    /// Appends every argument of an iterator.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        self.args.extend(args.into_iter().map(IntoArg::into_arg));
        self
    }

    /// Appends the server-side wait budget and remembers its position.
    ///
    /// Has no effect on the classification of non-blocking commands other than
    /// appending the formatted argument.
    pub fn wait_arg(mut self, wait: Option<Duration>) -> Self {
        let index = self.args.len();
        self.args.push(Bytes::from(format_wait(wait)));
        if let CommandKind::Blocking { wait_arg } = &mut self.kind {
            *wait_arg = Some(index);
        }
        self
    }

    /// Returns a copy with the wait budget argument rewritten.
    ///
    /// Commands without a wait budget argument are returned unchanged.
    pub fn with_wait(&self, wait: Option<Duration>) -> Command {
        let mut command = self.clone();
        if let CommandKind::Blocking {
            wait_arg: Some(index),
        } = self.kind
        {
            command.args[index] = Bytes::from(format_wait(wait));
        }
        command
    }

    /// Returns the command name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the arguments, excluding the name.
    pub fn arguments(&self) -> &[Bytes] {
        &self.args
    }

    /// Returns the blocking classification.
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Returns `true` for commands that may wait on the server.
    pub fn is_blocking(&self) -> bool {
        matches!(self.kind, CommandKind::Blocking { .. })
    }

    /// Returns `true` when the server-side wait is tied to a budget argument.
    pub fn has_wait_budget(&self) -> bool {
        matches!(self.kind, CommandKind::Blocking { wait_arg: Some(_) })
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("args", &self.args.len())
            .field("kind", &self.kind)
            .finish()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
