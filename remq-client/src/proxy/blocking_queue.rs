//! Distributed blocking queue proxy.

use std::fmt;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use bytes::Bytes;
use remq_core::serialization::{decode_item, decode_reply, decode_reply_list, encode_item};
use remq_core::{Command, RemqError, RespValue, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::scripts;
use crate::dispatch::{CommandDispatcher, OperationHandle};

/// A queue operation, expressed as one of a closed set of server interactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOperation {
    /// Appends items at the tail.
    Enqueue {
        /// Target queue.
        queue: String,
        /// Encoded items, in order.
        items: Vec<Bytes>,
    },
    /// Pops the head, waiting up to `timeout` for an item.
    BoundedWaitPop {
        /// Source queue.
        queue: String,
        /// Longest wait.
        timeout: Duration,
    },
    /// Pops the head, waiting as long as it takes.
    UnboundedWaitPop {
        /// Source queue.
        queue: String,
    },
    /// Pops the head of the first of several queues to hold an item.
    MultiSourceWaitPop {
        /// Source queues, checked in order.
        queues: Vec<String>,
        /// Longest wait.
        timeout: Duration,
    },
    /// Pops the tail of `source` and pushes it onto the head of `target` atomically.
    AtomicTransfer {
        /// Queue popped at its tail.
        source: String,
        /// Queue pushed at its head.
        target: String,
        /// Longest wait for `source` to hold an item.
        timeout: Duration,
    },
    /// Removes up to `limit` items from the head, or every item.
    Drain {
        /// Source queue.
        queue: String,
        /// Most items removed, `None` for all of them.
        limit: Option<usize>,
    },
}

impl QueueOperation {
    /// Builds the command carrying this operation.
    ///
    /// A zero timeout becomes the non-blocking counterpart, since a zero
    /// server-side wait means waiting forever.
    pub fn to_command(&self) -> Command {
        match self {
            QueueOperation::Enqueue { queue, items } => {
                Command::new("RPUSH").arg(queue).args(items.iter().cloned())
            }
            QueueOperation::BoundedWaitPop { queue, timeout } if timeout.is_zero() => {
                Command::new("LPOP").arg(queue)
            }
            QueueOperation::BoundedWaitPop { queue, timeout } => Command::blocking("BLPOP")
                .arg(queue)
                .wait_arg(Some(*timeout)),
            QueueOperation::UnboundedWaitPop { queue } => {
                Command::blocking("BLPOP").arg(queue).wait_arg(None)
            }
            QueueOperation::MultiSourceWaitPop { queues, timeout } if timeout.is_zero() => {
                Command::new("EVAL")
                    .arg(scripts::POLL_FIRST_FROM_ANY)
                    .arg(queues.len())
                    .args(queues.iter())
            }
            QueueOperation::MultiSourceWaitPop { queues, timeout } => Command::blocking("BLPOP")
                .args(queues.iter())
                .wait_arg(Some(*timeout)),
            QueueOperation::AtomicTransfer {
                source,
                target,
                timeout,
            } if timeout.is_zero() => Command::new("RPOPLPUSH").arg(source).arg(target),
            QueueOperation::AtomicTransfer {
                source,
                target,
                timeout,
            } => Command::blocking("BRPOPLPUSH")
                .arg(source)
                .arg(target)
                .wait_arg(Some(*timeout)),
            QueueOperation::Drain {
                queue,
                limit: Some(limit),
            } => Command::new("EVAL")
                .arg(scripts::DRAIN_LIMIT)
                .arg(1u32)
                .arg(queue)
                .arg(*limit),
            QueueOperation::Drain { queue, limit: None } => Command::new("EVAL")
                .arg(scripts::DRAIN_ALL)
                .arg(1u32)
                .arg(queue),
        }
    }

    /// Returns the deadline of a waiting operation started now.
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            QueueOperation::BoundedWaitPop { timeout, .. }
            | QueueOperation::MultiSourceWaitPop { timeout, .. }
            | QueueOperation::AtomicTransfer { timeout, .. }
                if !timeout.is_zero() =>
            {
                Some(Instant::now() + *timeout)
            }
            _ => None,
        }
    }

    /// Returns the names of every queue the operation touches.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            QueueOperation::Enqueue { queue, .. }
            | QueueOperation::BoundedWaitPop { queue, .. }
            | QueueOperation::UnboundedWaitPop { queue }
            | QueueOperation::Drain { queue, .. } => vec![queue.as_str()],
            QueueOperation::MultiSourceWaitPop { queues, .. } => {
                queues.iter().map(String::as_str).collect()
            }
            QueueOperation::AtomicTransfer { source, target, .. } => {
                vec![source.as_str(), target.as_str()]
            }
        }
    }
}

/// Returns the grouping tag of a queue name: the non-empty text between the
/// first `{` and the following `}`.
pub fn hash_tag(name: &str) -> Option<&str> {
    let start = name.find('{')?;
    let len = name[start + 1..].find('}')?;
    if len == 0 {
        return None;
    }
    Some(&name[start + 1..start + 1 + len])
}

/// Fails unless every tagged name among `names` carries the same tag.
fn check_colocated(names: &[&str]) -> Result<()> {
    let mut tags = names.iter().filter_map(|name| hash_tag(name));
    if let Some(first) = tags.next() {
        if let Some(other) = tags.find(|tag| *tag != first) {
            return Err(RemqError::IllegalArgument(format!(
                "queues must share one grouping tag, found '{{{}}}' and '{{{}}}'",
                first, other
            )));
        }
    }
    Ok(())
}

/// Decodes the reply of a pop: a bare item, a `[queue, item]` pair, or nil.
fn decode_popped<T: DeserializeOwned>(reply: RespValue) -> Result<Option<T>> {
    match reply.into_result()? {
        RespValue::Array(mut pair) if pair.len() == 2 => match pair.pop() {
            Some(RespValue::BulkString(data)) => decode_item(&data).map(Some),
            Some(other) => decode_reply(other),
            None => Ok(None),
        },
        other => decode_reply(other),
    }
}

fn decode_waited<T: DeserializeOwned>(reply: Option<RespValue>) -> Result<Option<T>> {
    match reply {
        Some(value) => decode_popped(value),
        None => Ok(None),
    }
}

/// A distributed FIFO queue whose consumers can wait for items.
///
/// Waiting operations survive connection loss: when the connection carrying a
/// wait drops, the wait is re-issued on a fresh connection with the budget
/// left, so an item enqueued after the server comes back is still delivered.
/// A wait that runs out reports `None`, never an error.
///
/// Items are encoded as JSON.
pub struct BlockingQueue<T> {
    name: String,
    dispatcher: CommandDispatcher,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for BlockingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            dispatcher: self.dispatcher.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> fmt::Debug for BlockingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingQueue")
            .field("name", &self.name)
            .finish()
    }
}

impl<T> BlockingQueue<T> {
    pub(crate) fn new(name: String, dispatcher: CommandDispatcher) -> Self {
        Self {
            name,
            dispatcher,
            _phantom: PhantomData,
        }
    }

    /// Returns the name of this queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of items in the queue.
    pub async fn size(&self) -> Result<usize> {
        self.dispatcher
            .execute(Command::new("LLEN").arg(&self.name))
            .await
    }

    /// Returns `true` if the queue holds no items.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.size().await? == 0)
    }

    /// Deletes the queue and every item in it. Returns `true` if it existed.
    pub async fn delete(&self) -> Result<bool> {
        let removed: i64 = self
            .dispatcher
            .execute(Command::new("DEL").arg(&self.name))
            .await?;
        Ok(removed > 0)
    }

    /// Expires the queue after `ttl`. Returns `false` if the queue does not exist.
    pub async fn expire(&self, ttl: Duration) -> Result<bool> {
        if ttl.is_zero() {
            return Err(RemqError::IllegalArgument("ttl must be positive".to_string()));
        }
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.dispatcher
            .execute(Command::new("PEXPIRE").arg(&self.name).arg(millis))
            .await
    }
}

impl<T> BlockingQueue<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Appends an item at the tail. Always returns `true`: the queue is unbounded.
    pub async fn add(&self, item: &T) -> Result<bool> {
        self.enqueue(vec![encode_item(item)?]).await?;
        Ok(true)
    }

    /// Appends an item at the tail, returning `true` if it was accepted.
    pub async fn offer(&self, item: &T) -> Result<bool> {
        self.add(item).await
    }

    /// Appends an item at the tail.
    pub async fn put(&self, item: &T) -> Result<()> {
        self.enqueue(vec![encode_item(item)?]).await
    }

    /// Appends every item in order with a single command.
    ///
    /// Returns `false` when `items` is empty and nothing was sent.
    pub async fn add_all<'a, I>(&self, items: I) -> Result<bool>
    where
        I: IntoIterator<Item = &'a T>,
        T: 'a,
    {
        let encoded = items
            .into_iter()
            .map(|item| encode_item(item))
            .collect::<Result<Vec<_>>>()?;
        if encoded.is_empty() {
            return Ok(false);
        }
        self.enqueue(encoded).await?;
        Ok(true)
    }

    async fn enqueue(&self, items: Vec<Bytes>) -> Result<()> {
        let operation = QueueOperation::Enqueue {
            queue: self.name.clone(),
            items,
        };
        let _length: i64 = self.dispatcher.execute(operation.to_command()).await?;
        Ok(())
    }

    /// Removes and returns the head, or `None` if the queue is empty.
    pub async fn poll(&self) -> Result<Option<T>> {
        let reply: RespValue = self
            .dispatcher
            .execute(Command::new("LPOP").arg(&self.name))
            .await?;
        decode_reply(reply)
    }

    /// Removes and returns the head, waiting up to `timeout` for an item.
    ///
    /// Returns `None` if no item arrived in time.
    pub async fn poll_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        self.poll_async(timeout).await
    }

    /// Starts a [`poll_timeout`](Self::poll_timeout) and returns its handle.
    pub fn poll_async(&self, timeout: Duration) -> OperationHandle<Option<T>> {
        self.submit_wait(QueueOperation::BoundedWaitPop {
            queue: self.name.clone(),
            timeout,
        })
    }

    /// Removes and returns the head, waiting as long as it takes for an item.
    pub async fn take(&self) -> Result<T> {
        self.take_async().await
    }

    /// Starts a [`take`](Self::take) and returns its handle.
    pub fn take_async(&self) -> OperationHandle<T> {
        let operation = QueueOperation::UnboundedWaitPop {
            queue: self.name.clone(),
        };
        self.dispatcher.submit(operation.to_command(), None, |reply| {
            decode_waited(reply)?.ok_or_else(|| {
                RemqError::Protocol("unbounded wait ended without an item".to_string())
            })
        })
    }

    /// Removes and returns the head of this queue or of the first of `queues`
    /// to hold an item, waiting up to `timeout`.
    ///
    /// Queues are checked in order: this queue first, then `queues` as given.
    pub async fn poll_from_any(&self, timeout: Duration, queues: &[&str]) -> Result<Option<T>> {
        self.poll_from_any_async(timeout, queues)?.await
    }

    /// Starts a [`poll_from_any`](Self::poll_from_any) and returns its handle.
    pub fn poll_from_any_async(&self, timeout: Duration, queues: &[&str]) -> Result<OperationHandle<Option<T>>> {
        let mut names = Vec::with_capacity(queues.len() + 1);
        names.push(self.name.clone());
        names.extend(queues.iter().map(|name| name.to_string()));

        let operation = QueueOperation::MultiSourceWaitPop {
            queues: names,
            timeout,
        };
        check_colocated(&operation.keys())?;
        Ok(self.submit_wait(operation))
    }

    /// Moves the tail of this queue onto the head of `target` atomically,
    /// waiting up to `timeout` for an item. Returns the moved item.
    pub async fn poll_last_and_offer_first_to(&self, target: &str, timeout: Duration) -> Result<Option<T>> {
        self.poll_last_and_offer_first_to_async(target, timeout)?.await
    }

    /// Starts a [`poll_last_and_offer_first_to`](Self::poll_last_and_offer_first_to)
    /// and returns its handle.
    pub fn poll_last_and_offer_first_to_async(
        &self,
        target: &str,
        timeout: Duration,
    ) -> Result<OperationHandle<Option<T>>> {
        let operation = QueueOperation::AtomicTransfer {
            source: self.name.clone(),
            target: target.to_string(),
            timeout,
        };
        check_colocated(&operation.keys())?;
        Ok(self.submit_wait(operation))
    }

    fn submit_wait(&self, operation: QueueOperation) -> OperationHandle<Option<T>> {
        let deadline = operation.deadline();
        self.dispatcher
            .submit(operation.to_command(), deadline, decode_waited::<T>)
    }

    /// Removes every item and appends them to `sink` in queue order.
    ///
    /// Returns the number of items moved.
    pub async fn drain_to<E: Extend<T>>(&self, sink: &mut E) -> Result<usize> {
        self.drain(sink, None).await
    }

    /// Removes up to `limit` items and appends them to `sink` in queue order.
    ///
    /// Returns the number of items moved.
    pub async fn drain_to_limit<E: Extend<T>>(&self, sink: &mut E, limit: usize) -> Result<usize> {
        if limit == 0 {
            return Ok(0);
        }
        self.drain(sink, Some(limit)).await
    }

    async fn drain<E: Extend<T>>(&self, sink: &mut E, limit: Option<usize>) -> Result<usize> {
        let operation = QueueOperation::Drain {
            queue: self.name.clone(),
            limit,
        };
        let reply: RespValue = self.dispatcher.execute(operation.to_command()).await?;
        let items: Vec<T> = decode_reply_list(reply)?;
        let count = items.len();
        sink.extend(items);
        Ok(count)
    }

    /// Removes and returns the head.
    ///
    /// Fails with [`RemqError::NoSuchElement`] if the queue is empty.
    pub async fn remove(&self) -> Result<T> {
        self.poll().await?.ok_or(RemqError::NoSuchElement)
    }

    /// Returns the head without removing it, or `None` if the queue is empty.
    pub async fn peek(&self) -> Result<Option<T>> {
        let reply: RespValue = self
            .dispatcher
            .execute(Command::new("LINDEX").arg(&self.name).arg(0u32))
            .await?;
        decode_reply(reply)
    }

    /// Returns the head without removing it.
    ///
    /// Fails with [`RemqError::NoSuchElement`] if the queue is empty.
    pub async fn element(&self) -> Result<T> {
        self.peek().await?.ok_or(RemqError::NoSuchElement)
    }

    /// Returns every item in queue order without removing any.
    pub async fn read_all(&self) -> Result<Vec<T>> {
        let reply: RespValue = self
            .dispatcher
            .execute(Command::new("LRANGE").arg(&self.name).arg(0u32).arg("-1"))
            .await?;
        decode_reply_list(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(command: &Command) -> Vec<String> {
        command
            .arguments()
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect()
    }

    #[test]
    fn test_bounded_wait_pop_command() {
        let op = QueueOperation::BoundedWaitPop {
            queue: "jobs".to_string(),
            timeout: Duration::from_millis(1500),
        };
        let command = op.to_command();
        assert_eq!(command.name(), "BLPOP");
        assert!(command.has_wait_budget());
        assert_eq!(args(&command), vec!["jobs", "1.500"]);
        assert!(op.deadline().is_some());
    }

    #[test]
    fn test_zero_timeout_degrades_to_non_blocking() {
        let pop = QueueOperation::BoundedWaitPop {
            queue: "jobs".to_string(),
            timeout: Duration::ZERO,
        };
        assert_eq!(pop.to_command().name(), "LPOP");
        assert!(pop.deadline().is_none());

        let transfer = QueueOperation::AtomicTransfer {
            source: "a".to_string(),
            target: "b".to_string(),
            timeout: Duration::ZERO,
        };
        assert_eq!(transfer.to_command().name(), "RPOPLPUSH");

        let any = QueueOperation::MultiSourceWaitPop {
            queues: vec!["a".to_string(), "b".to_string()],
            timeout: Duration::ZERO,
        };
        let command = any.to_command();
        assert_eq!(command.name(), "EVAL");
        assert!(!command.is_blocking());
        assert_eq!(&args(&command)[1..], &["2", "a", "b"]);
    }

    #[test]
    fn test_unbounded_wait_pop_waits_forever() {
        let op = QueueOperation::UnboundedWaitPop {
            queue: "jobs".to_string(),
        };
        assert_eq!(args(&op.to_command()), vec!["jobs", "0"]);
        assert!(op.deadline().is_none());
    }

    #[test]
    fn test_drain_commands() {
        let limited = QueueOperation::Drain {
            queue: "jobs".to_string(),
            limit: Some(3),
        };
        let command = limited.to_command();
        assert_eq!(args(&command)[0], scripts::DRAIN_LIMIT);
        assert_eq!(&args(&command)[1..], &["1", "jobs", "3"]);

        let all = QueueOperation::Drain {
            queue: "jobs".to_string(),
            limit: None,
        };
        assert_eq!(args(&all.to_command())[0], scripts::DRAIN_ALL);
    }

    #[test]
    fn test_keys() {
        let op = QueueOperation::AtomicTransfer {
            source: "a".to_string(),
            target: "b".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(op.keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_colocation_checks_every_key() {
        let op = QueueOperation::MultiSourceWaitPop {
            queues: vec!["{a}x".to_string(), "plain".to_string(), "{b}y".to_string()],
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            check_colocated(&op.keys()),
            Err(RemqError::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_hash_tag() {
        assert_eq!(hash_tag("{orders}:pending"), Some("orders"));
        assert_eq!(hash_tag("jobs"), None);
        assert_eq!(hash_tag("{}jobs"), None);
        assert_eq!(hash_tag("jobs{"), None);
    }

    #[test]
    fn test_colocation_check() {
        assert!(check_colocated(&["{a}x", "{a}y", "plain"]).is_ok());
        assert!(check_colocated(&["x", "y"]).is_ok());
        let err = check_colocated(&["{a}x", "{b}y"]).unwrap_err();
        assert!(matches!(err, RemqError::IllegalArgument(_)));
    }

    #[test]
    fn test_decode_popped_shapes() {
        let pair = RespValue::Array(vec![
            RespValue::bulk("jobs"),
            RespValue::bulk(encode_item(&7i64).unwrap()),
        ]);
        assert_eq!(decode_popped::<i64>(pair).unwrap(), Some(7));

        let bare = RespValue::bulk(encode_item(&8i64).unwrap());
        assert_eq!(decode_popped::<i64>(bare).unwrap(), Some(8));

        assert_eq!(decode_popped::<i64>(RespValue::Nil).unwrap(), None);
        assert_eq!(decode_waited::<i64>(None).unwrap(), None);
    }

    #[test]
    fn test_remote_error_surfaces() {
        let err = decode_popped::<i64>(RespValue::Error("WRONGTYPE".to_string())).unwrap_err();
        assert!(matches!(err, RemqError::Remote(_)));
    }
}
