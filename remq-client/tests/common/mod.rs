//! Common test utilities for integration tests.
//!
//! `MockServer` is an in-process RESP server holding lists in memory. It
//! implements the list, blocking, client and script commands the client sends,
//! and can be stopped and restarted on the same port to simulate a server
//! going away and coming back.

#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use remq_client::core::{RespCodec, RespValue};
use remq_client::proxy::scripts;
use remq_client::{ClientConfig, RemqClient};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

pub const LLEN_SCRIPT: &str = "return redis.call('llen', KEYS[1])";
pub const FAILING_SCRIPT: &str = "return redis.error_reply('boom')";

pub fn unique_name(prefix: &str) -> String {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}-{}-{}", prefix, std::process::id(), id)
}

pub fn config_for(server: &MockServer) -> ClientConfig {
    ClientConfig::builder()
        .address(server.address().to_string())
        .client_name("remq-test")
        .pool(|p| p.min_idle(1).max_size(4).acquire_timeout(Duration::from_secs(1)))
        .retry(|r| {
            r.initial_backoff(Duration::from_millis(20))
                .max_backoff(Duration::from_millis(200))
        })
        .build()
        .expect("failed to build config")
}

pub async fn create_client(server: &MockServer) -> RemqClient {
    RemqClient::new(config_for(server))
        .await
        .expect("failed to create client")
}

/// Polls `condition` every 10ms until it holds, panicking after `timeout`.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, condition: F) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {:?}", timeout);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct ServerState {
    lists: Mutex<HashMap<Bytes, VecDeque<Bytes>>>,
    scripts: Mutex<HashMap<String, String>>,
    blocked: Mutex<HashMap<i64, Arc<Notify>>>,
    changed: Notify,
    next_client_id: AtomicI64,
    open_connections: AtomicUsize,
    commands: Mutex<Vec<String>>,
    connection_token: Mutex<CancellationToken>,
}

impl ServerState {
    fn lists(&self) -> MutexGuard<'_, HashMap<Bytes, VecDeque<Bytes>>> {
        self.lists.lock().unwrap()
    }

    fn connection_token(&self) -> CancellationToken {
        self.connection_token.lock().unwrap().clone()
    }

    fn drop_connections(&self) {
        let mut token = self.connection_token.lock().unwrap();
        token.cancel();
        *token = CancellationToken::new();
    }
}

struct Listener {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// In-memory RESP server for integration tests.
pub struct MockServer {
    address: SocketAddr,
    state: Arc<ServerState>,
    listener: Mutex<Option<Listener>>,
}

impl MockServer {
    /// Starts a server on a free local port.
    pub async fn start() -> Self {
        let state = Arc::new(ServerState {
            lists: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            blocked: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            next_client_id: AtomicI64::new(1),
            open_connections: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            connection_token: Mutex::new(CancellationToken::new()),
        });
        let (address, listener) = listen("127.0.0.1:0".parse().unwrap(), Arc::clone(&state));
        Self {
            address,
            state,
            listener: Mutex::new(Some(listener)),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Stops accepting, drops every client connection and loses all data.
    pub fn stop(&self) {
        if let Some(listener) = self.listener.lock().unwrap().take() {
            listener.shutdown.cancel();
            listener.task.abort();
        }
        self.state.drop_connections();
        self.state.lists().clear();
        self.state.scripts.lock().unwrap().clear();
    }

    /// Starts listening again on the same port.
    pub async fn restart(&self) {
        for _ in 0..100 {
            if self.listener.lock().unwrap().is_some() {
                return;
            }
            // The aborted accept task releases the port asynchronously.
            match try_listen(self.address, Arc::clone(&self.state)) {
                Ok((_, listener)) => {
                    *self.listener.lock().unwrap() = Some(listener);
                    return;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        panic!("could not rebind {}", self.address);
    }

    /// Closes every client connection while keeping the listener and the data.
    pub fn kill_connections(&self) {
        self.state.drop_connections();
    }

    /// Appends raw items to a list, as another client would.
    pub fn push(&self, key: &str, item: Bytes) {
        self.state
            .lists()
            .entry(Bytes::copy_from_slice(key.as_bytes()))
            .or_default()
            .push_back(item);
        self.state.changed.notify_waiters();
    }

    /// Returns the items of a list, head first.
    pub fn list(&self, key: &str) -> Vec<Bytes> {
        self.state
            .lists()
            .get(key.as_bytes())
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns how many clients are parked in a blocking command.
    pub fn blocked_clients(&self) -> usize {
        self.state.blocked.lock().unwrap().len()
    }

    /// Returns the number of open client connections.
    pub fn connection_count(&self) -> usize {
        self.state.open_connections.load(Ordering::SeqCst)
    }

    /// Returns how many times a command name was received.
    pub fn command_count(&self, name: &str) -> usize {
        self.state
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.eq_ignore_ascii_case(name))
            .count()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen(address: SocketAddr, state: Arc<ServerState>) -> (SocketAddr, Listener) {
    try_listen(address, state).expect("failed to bind mock server")
}

fn try_listen(address: SocketAddr, state: Arc<ServerState>) -> std::io::Result<(SocketAddr, Listener)> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(address)?;
    let listener = socket.listen(64)?;
    let local = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { return };
                        let token = state.connection_token();
                        tokio::spawn(serve(stream, Arc::clone(&state), token));
                    }
                }
            }
        })
    };
    Ok((local, Listener { shutdown, task }))
}

type Conn = Framed<TcpStream, RespCodec>;

async fn serve(stream: TcpStream, state: Arc<ServerState>, token: CancellationToken) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::SeqCst);
    state.open_connections.fetch_add(1, Ordering::SeqCst);
    let mut conn = Framed::new(stream, RespCodec::new());

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = conn.next() => frame,
        };
        let Some(Ok(RespValue::Array(parts))) = frame else {
            break;
        };
        let args: Vec<Bytes> = parts
            .into_iter()
            .filter_map(|part| match part {
                RespValue::BulkString(data) => Some(data),
                _ => None,
            })
            .collect();
        let Some(name) = args.first().map(|n| String::from_utf8_lossy(n).to_uppercase()) else {
            break;
        };
        state.commands.lock().unwrap().push(name.clone());

        let reply = match name.as_str() {
            "BLPOP" | "BRPOPLPUSH" => {
                match wait_pop(&mut conn, &state, client_id, &name, &args[1..], &token).await {
                    Some(reply) => reply,
                    None => break,
                }
            }
            "DEBUG" => {
                let secs: f64 = text(&args, 2).parse().unwrap_or(0.0);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs_f64(secs)) => RespValue::status("OK"),
                }
            }
            _ => execute(&state, client_id, &name, &args[1..]),
        };

        if conn.send(reply).await.is_err() {
            break;
        }
    }

    state.blocked.lock().unwrap().remove(&client_id);
    state.open_connections.fetch_sub(1, Ordering::SeqCst);
}

fn text(args: &[Bytes], index: usize) -> String {
    args.get(index)
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .unwrap_or_default()
}

fn int(arg: &Bytes) -> i64 {
    String::from_utf8_lossy(arg).parse().unwrap_or(0)
}

fn array(items: Vec<Bytes>) -> RespValue {
    RespValue::Array(items.into_iter().map(RespValue::BulkString).collect())
}

fn bulk_or_nil(item: Option<Bytes>) -> RespValue {
    item.map_or(RespValue::Nil, RespValue::BulkString)
}

fn error(message: &str) -> RespValue {
    RespValue::Error(message.to_string())
}

/// Resolves a possibly negative list index against `len`.
fn index(len: usize, raw: i64) -> i64 {
    if raw < 0 {
        len as i64 + raw
    } else {
        raw
    }
}

fn range(list: &VecDeque<Bytes>, start: i64, stop: i64) -> Vec<Bytes> {
    let len = list.len();
    let start = index(len, start).max(0);
    let stop = index(len, stop).min(len as i64 - 1);
    if start > stop {
        return Vec::new();
    }
    list.iter()
        .skip(start as usize)
        .take((stop - start + 1) as usize)
        .cloned()
        .collect()
}

fn trim(list: &mut VecDeque<Bytes>, start: i64, stop: i64) {
    let kept: VecDeque<Bytes> = range(list, start, stop).into_iter().collect();
    *list = kept;
}

fn pop_front(lists: &mut HashMap<Bytes, VecDeque<Bytes>>, key: &Bytes) -> Option<Bytes> {
    let list = lists.get_mut(key)?;
    let item = list.pop_front();
    if list.is_empty() {
        lists.remove(key);
    }
    item
}

fn pop_back(lists: &mut HashMap<Bytes, VecDeque<Bytes>>, key: &Bytes) -> Option<Bytes> {
    let list = lists.get_mut(key)?;
    let item = list.pop_back();
    if list.is_empty() {
        lists.remove(key);
    }
    item
}

fn transfer(lists: &mut HashMap<Bytes, VecDeque<Bytes>>, source: &Bytes, target: &Bytes) -> Option<Bytes> {
    let item = pop_back(lists, source)?;
    lists.entry(target.clone()).or_default().push_front(item.clone());
    Some(item)
}

fn try_wait_pop(state: &ServerState, name: &str, args: &[Bytes]) -> Option<RespValue> {
    let mut lists = state.lists();
    let keys = &args[..args.len().saturating_sub(1)];
    if name == "BLPOP" {
        keys.iter().find_map(|key| {
            pop_front(&mut lists, key).map(|item| array(vec![key.clone(), item]))
        })
    } else {
        transfer(&mut lists, &keys[0], &keys[1]).map(RespValue::BulkString)
    }
}

/// Serves a blocking pop. Returns `None` when the connection must close.
async fn wait_pop(
    conn: &mut Conn,
    state: &ServerState,
    client_id: i64,
    name: &str,
    args: &[Bytes],
    token: &CancellationToken,
) -> Option<RespValue> {
    let wait: f64 = args
        .last()
        .map(|a| String::from_utf8_lossy(a).parse().unwrap_or(0.0))
        .unwrap_or(0.0);
    let deadline = (wait > 0.0).then(|| Instant::now() + Duration::from_secs_f64(wait));

    let unblock = Arc::new(Notify::new());
    state.blocked.lock().unwrap().insert(client_id, Arc::clone(&unblock));

    let reply = loop {
        let changed = state.changed.notified();
        tokio::pin!(changed);
        changed.as_mut().enable();

        if let Some(reply) = try_wait_pop(state, name, args) {
            break Some(reply);
        }

        let expiry = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            frame = conn.next() => {
                // A client never writes while parked; anything here is EOF or garbage.
                if !matches!(frame, Some(Ok(_))) {
                    break None;
                }
            }
            _ = token.cancelled() => break None,
            _ = unblock.notified() => break Some(RespValue::Nil),
            _ = &mut changed => {}
            _ = expiry => break Some(RespValue::Nil),
        }
    };

    state.blocked.lock().unwrap().remove(&client_id);
    reply
}

fn sha_of(body: &str) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("{:040x}", hasher.finish())
}

fn execute(state: &ServerState, client_id: i64, name: &str, args: &[Bytes]) -> RespValue {
    match name {
        "PING" => RespValue::status("PONG"),
        "SELECT" => RespValue::status("OK"),
        "CLIENT" => match text(args, 0).to_uppercase().as_str() {
            "ID" => RespValue::Integer(client_id),
            "SETNAME" => RespValue::status("OK"),
            "UNBLOCK" => {
                let target = args.get(1).map(int).unwrap_or(0);
                match state.blocked.lock().unwrap().get(&target) {
                    Some(waiter) => {
                        waiter.notify_one();
                        RespValue::Integer(1)
                    }
                    None => RespValue::Integer(0),
                }
            }
            _ => error("ERR unknown CLIENT subcommand"),
        },
        "RPUSH" | "LPUSH" => {
            let len = {
                let mut lists = state.lists();
                let list = lists.entry(args[0].clone()).or_default();
                for item in &args[1..] {
                    if name == "RPUSH" {
                        list.push_back(item.clone());
                    } else {
                        list.push_front(item.clone());
                    }
                }
                list.len()
            };
            state.changed.notify_waiters();
            RespValue::Integer(len as i64)
        }
        "LPOP" => bulk_or_nil(pop_front(&mut state.lists(), &args[0])),
        "RPOP" => bulk_or_nil(pop_back(&mut state.lists(), &args[0])),
        "RPOPLPUSH" => {
            let item = transfer(&mut state.lists(), &args[0], &args[1]);
            state.changed.notify_waiters();
            bulk_or_nil(item)
        }
        "LLEN" => RespValue::Integer(state.lists().get(&args[0]).map_or(0, |l| l.len() as i64)),
        "LINDEX" => {
            let lists = state.lists();
            let item = lists.get(&args[0]).and_then(|list| {
                let i = index(list.len(), int(&args[1]));
                usize::try_from(i).ok().and_then(|i| list.get(i).cloned())
            });
            bulk_or_nil(item)
        }
        "LRANGE" => {
            let lists = state.lists();
            let items = lists
                .get(&args[0])
                .map(|list| range(list, int(&args[1]), int(&args[2])))
                .unwrap_or_default();
            array(items)
        }
        "DEL" => {
            let mut lists = state.lists();
            let removed = args.iter().filter(|key| lists.remove(*key).is_some()).count();
            RespValue::Integer(removed as i64)
        }
        "PEXPIRE" => RespValue::Integer(i64::from(state.lists().contains_key(&args[0]))),
        "EVAL" => {
            let body = text(args, 0);
            run_script(state, &body, &args[1..])
        }
        "EVALSHA" => {
            let sha = text(args, 0);
            let body = state.scripts.lock().unwrap().get(&sha).cloned();
            match body {
                Some(body) => run_script(state, &body, &args[1..]),
                None => error("NOSCRIPT No matching script. Please use EVAL."),
            }
        }
        "SCRIPT" => match text(args, 0).to_uppercase().as_str() {
            "LOAD" => {
                let body = text(args, 1);
                let sha = sha_of(&body);
                state.scripts.lock().unwrap().insert(sha.clone(), body);
                RespValue::bulk(sha)
            }
            "EXISTS" => {
                let scripts = state.scripts.lock().unwrap();
                RespValue::Array(
                    args[1..]
                        .iter()
                        .map(|sha| {
                            let known = scripts.contains_key(&*String::from_utf8_lossy(sha));
                            RespValue::Integer(i64::from(known))
                        })
                        .collect(),
                )
            }
            "FLUSH" => {
                state.scripts.lock().unwrap().clear();
                RespValue::status("OK")
            }
            _ => error("ERR unknown SCRIPT subcommand"),
        },
        _ => error(&format!("ERR unknown command '{}'", name)),
    }
}

fn run_script(state: &ServerState, body: &str, args: &[Bytes]) -> RespValue {
    let numkeys = args.first().map(int).unwrap_or(0).max(0) as usize;
    let keys = &args[1..1 + numkeys];
    let argv = &args[1 + numkeys..];
    let mut lists = state.lists();

    if body == scripts::DRAIN_LIMIT || body == scripts::DRAIN_ALL {
        let limit = if body == scripts::DRAIN_LIMIT {
            argv.first().map(int).unwrap_or(0).max(0) as usize
        } else {
            usize::MAX
        };
        let Some(list) = lists.get_mut(&keys[0]) else {
            return RespValue::Array(Vec::new());
        };
        let count = limit.min(list.len());
        let drained: Vec<Bytes> = list.drain(..count).collect();
        if list.is_empty() {
            lists.remove(&keys[0]);
        }
        array(drained)
    } else if body == scripts::POLL_FIRST_FROM_ANY {
        bulk_or_nil(keys.iter().find_map(|key| pop_front(&mut lists, key)))
    } else if body == LLEN_SCRIPT {
        RespValue::Integer(lists.get(&keys[0]).map_or(0, |l| l.len() as i64))
    } else if body == FAILING_SCRIPT {
        error("ERR user script failed: boom")
    } else {
        error("ERR unsupported script")
    }
}
