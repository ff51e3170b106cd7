/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The engine: one connection, one loop thread, and the operations callers use to reach it.
//!
//! An [`Engine`] owns a single connection to the server.  `connect` spawns a dedicated thread
//! which runs the event loop; that thread alone touches the socket, the codec and the
//! per-command timers.  Caller threads build commands, hand them over through an internal
//! queue, and get replies back through their callbacks (or by blocking, for the `_sync`
//! variants).  Dropping the engine disconnects it.
//!
//! Commands are issued against a connected engine:
//!
//! ```no_run
//! use redis_engine::{Engine, ReplyShape};
//!
//! let mut engine = Engine::new("127.0.0.1", 6379);
//! engine.connect().expect("Cannot connect");
//!
//! engine.set("key", "value").expect("Cannot set");
//! let value = engine.get("key").expect("Cannot get");
//! assert_eq!(value, b"value");
//!
//! let reply = engine.command_sync(vec!["INCR", "counter"], ReplyShape::Long);
//! assert!(reply.ok());
//! engine.free(&reply);
//! ```

mod connect;
mod inner;

use std::panic::{self, AssertUnwindSafe};
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use futures_channel::{mpsc, oneshot};

use crate::command::{Command, CommandCallback};
use crate::error::{self, ConnectionReason, Error};
use crate::registry::Registry;
use crate::reply::{Reply, ReplyShape, ReplyStatus};

use connect::ServerAddr;
use inner::{EngineInner, QueuedId};

/// The lifecycle of an engine's connection, observable by callers at any time and reported
/// through the optional state-change callback on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    NotYetConnected = 0,
    Connected = 1,
    Disconnected = 2,
    ConnectError = 3,
    DisconnectError = 4,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> ConnectionState {
        match raw {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnected,
            3 => ConnectionState::ConnectError,
            4 => ConnectionState::DisconnectError,
            _ => ConnectionState::NotYetConnected,
        }
    }
}

type StateCallback = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// State shared between the engine handle, its loop thread, and every caller thread.
pub(crate) struct Shared {
    state: AtomicU8,
    state_lock: Mutex<()>,
    state_signal: Condvar,
    on_state_change: Option<StateCallback>,
    pub(crate) registry: Registry,
}

impl Shared {
    fn new(on_state_change: Option<StateCallback>) -> Shared {
        Shared {
            state: AtomicU8::new(ConnectionState::NotYetConnected as u8),
            state_lock: Mutex::new(()),
            state_signal: Condvar::new(),
            on_state_change,
            registry: Registry::new(),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        {
            let _guard = self.state_lock.lock().expect("state lock poisoned");
            self.state.store(state as u8, Ordering::SeqCst);
            self.state_signal.notify_all();
        }
        if let Some(callback) = &self.on_state_change {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(state))).is_err() {
                log::error!("connection-state callback panicked");
            }
        }
    }

    fn wait_while(&self, condition: impl Fn(ConnectionState) -> bool) -> ConnectionState {
        let mut guard = self.state_lock.lock().expect("state lock poisoned");
        loop {
            let state = self.state();
            if !condition(state) {
                return state;
            }
            guard = self
                .state_signal
                .wait(guard)
                .expect("state lock poisoned");
        }
    }
}

/// The channels a connected engine uses to reach its loop thread.
struct LoopLinks {
    submit_tx: mpsc::UnboundedSender<QueuedId>,
    free_tx: mpsc::UnboundedSender<QueuedId>,
    stop_tx: Option<oneshot::Sender<()>>,
}

/// Configuration for an [`Engine`], following the builder pattern.
pub struct EngineBuilder {
    addr: ServerAddr,
    on_state_change: Option<StateCallback>,
}

impl EngineBuilder {
    /// An engine for a server reached over TCP.
    pub fn tcp(host: impl Into<String>, port: u16) -> EngineBuilder {
        EngineBuilder {
            addr: ServerAddr::Tcp(host.into(), port),
            on_state_change: None,
        }
    }

    /// An engine for a server reached over a Unix socket.
    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>) -> EngineBuilder {
        EngineBuilder {
            addr: ServerAddr::Unix(path.into()),
            on_state_change: None,
        }
    }

    /// Installs a callback invoked on every connection-state transition.  It runs on the loop
    /// thread, so it should return promptly.
    pub fn on_state_change(
        mut self,
        callback: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> EngineBuilder {
        self.on_state_change = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> Engine {
        Engine::from_builder(self, false)
    }
}

pub struct Engine {
    addr: ServerAddr,
    shared: Arc<Shared>,
    links: Option<LoopLinks>,
    thread: Option<JoinHandle<()>>,
    pubsub: bool,
}

impl Engine {
    /// An engine for the server at `host:port`, with default configuration.  Use
    /// [`EngineBuilder`] for anything more.
    pub fn new(host: impl Into<String>, port: u16) -> Engine {
        EngineBuilder::tcp(host, port).build()
    }

    pub(crate) fn from_builder(builder: EngineBuilder, pubsub: bool) -> Engine {
        Engine {
            addr: builder.addr,
            shared: Arc::new(Shared::new(builder.on_state_change)),
            links: None,
            thread: None,
            pubsub,
        }
    }

    /// Spawns the loop thread and connects to the server.  Blocks until the connection is
    /// established, or returns an error if it could not be; after a failure the engine stays
    /// down, and commands submitted to it fail with `SendError`.
    pub fn connect(&mut self) -> Result<(), Error> {
        match self.shared.state() {
            ConnectionState::NotYetConnected => {}
            ConnectionState::Connected => {
                return Err(Error::Connection(ConnectionReason::Connected))
            }
            _ => return Err(Error::Connection(ConnectionReason::NotConnected)),
        }
        if self.thread.is_some() {
            return Err(Error::Connection(ConnectionReason::Connecting));
        }

        let (submit_tx, submit_rx) = mpsc::unbounded();
        let (free_tx, free_rx) = mpsc::unbounded();
        let (stop_tx, stop_rx) = oneshot::channel();

        let addr = self.addr.clone();
        let shared = self.shared.clone();
        let pubsub = self.pubsub;
        let thread = thread::Builder::new()
            .name("redis-engine".to_owned())
            .spawn(move || run_loop(addr, shared, submit_rx, free_rx, stop_rx, pubsub))?;

        self.links = Some(LoopLinks {
            submit_tx,
            free_tx,
            stop_tx: Some(stop_tx),
        });
        self.thread = Some(thread);

        let state = self
            .shared
            .wait_while(|state| state == ConnectionState::NotYetConnected);
        match state {
            ConnectionState::Connected => Ok(()),
            _ => {
                self.wait();
                Err(Error::Connection(ConnectionReason::ConnectionFailed))
            }
        }
    }

    /// Asks the loop thread to shut down and blocks until it has.  The connection is flushed
    /// and closed; commands still live are retired under the documented terminal policy.
    pub fn disconnect(&mut self) {
        if let Some(links) = &mut self.links {
            if let Some(stop_tx) = links.stop_tx.take() {
                let _ = stop_tx.send(());
            }
        }
        self.wait();
    }

    /// Blocks until the loop thread exits, without requesting shutdown.
    pub fn wait(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("engine loop thread panicked");
            }
        }
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Runs a command asynchronously.  The callback is invoked on the loop thread, exactly
    /// once, with the populated command; the record is retired automatically afterwards.
    pub fn command<A, S, F>(&self, argv: A, shape: ReplyShape, callback: F)
    where
        A: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
        F: FnMut(&Command) + Send + 'static,
    {
        self.create_command(to_argv(argv), shape, Some(Box::new(callback)), 0.0, 0.0, true);
    }

    /// Runs a command asynchronously, ignoring the reply entirely.
    pub fn command_forget<A, S>(&self, argv: A)
    where
        A: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        self.create_command(to_argv(argv), ReplyShape::Raw, None, 0.0, 0.0, true);
    }

    /// Runs a command and blocks until its reply arrives.  The returned record carries the
    /// status and the decoded reply; the caller must hand it back with [`Engine::free`] when
    /// done.
    ///
    /// Must not be called from a command callback: callbacks run on the loop thread, and the
    /// loop cannot deliver a reply while it is blocked.
    pub fn command_sync<A, S>(&self, argv: A, shape: ReplyShape) -> Arc<Command>
    where
        A: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        let gate = Arc::new(SyncGate::new());
        let signal = gate.clone();
        let cmd = self.create_command(
            to_argv(argv),
            shape,
            Some(Box::new(move |_: &Command| signal.open())),
            0.0,
            0.0,
            false,
        );
        gate.wait();
        cmd
    }

    /// Runs a command every `repeat` seconds, the first time after `after` seconds.  The
    /// callback fires on every reply.  The caller stops it with [`Command::cancel`]; the
    /// engine retires the record once the cancellation has been observed.
    pub fn command_loop<A, S, F>(
        &self,
        argv: A,
        shape: ReplyShape,
        callback: F,
        repeat: f64,
        after: f64,
    ) -> Arc<Command>
    where
        A: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
        F: FnMut(&Command) + Send + 'static,
    {
        self.create_command(
            to_argv(argv),
            shape,
            Some(Box::new(callback)),
            repeat,
            after,
            true,
        )
    }

    /// Runs a command once, `after` seconds from now.
    pub fn command_delayed<A, S, F>(&self, argv: A, shape: ReplyShape, callback: F, after: f64)
    where
        A: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
        F: FnMut(&Command) + Send + 'static,
    {
        self.create_command(
            to_argv(argv),
            shape,
            Some(Box::new(callback)),
            0.0,
            after,
            true,
        );
    }

    /// Hands a record back to the engine for disposal.  Safe to call more than once, and safe
    /// to call while a reply is still in transit; the loop thread performs the actual removal.
    pub fn free(&self, cmd: &Command) {
        if let Some(links) = &self.links {
            let _ = links.free_tx.unbounded_send(QueuedId {
                id: cmd.id(),
                shape: cmd.shape(),
            });
        }
    }

    /// Blocking GET: the value stored at `key`, as bytes.
    pub fn get(&self, key: impl Into<Vec<u8>>) -> Result<Vec<u8>, Error> {
        let cmd = self.command_sync(vec![b"GET".to_vec(), key.into()], ReplyShape::Bytes);
        let result = match (cmd.status(), cmd.reply()) {
            (ReplyStatus::Ok, Some(Reply::Bytes(bytes))) => Ok(bytes),
            (status, _) => Err(reply_error("GET", status, cmd.error_text())),
        };
        self.free(&cmd);
        result
    }

    /// Blocking SET.
    pub fn set(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<(), Error> {
        let cmd = self.command_sync(
            vec![b"SET".to_vec(), key.into(), value.into()],
            ReplyShape::Bytes,
        );
        let result = match cmd.status() {
            ReplyStatus::Ok => Ok(()),
            status => Err(reply_error("SET", status, cmd.error_text())),
        };
        self.free(&cmd);
        result
    }

    /// Blocking DEL: the number of keys removed.
    pub fn del(&self, key: impl Into<Vec<u8>>) -> Result<i64, Error> {
        let cmd = self.command_sync(vec![b"DEL".to_vec(), key.into()], ReplyShape::Long);
        let result = match (cmd.status(), cmd.reply()) {
            (ReplyStatus::Ok, Some(Reply::Long(count))) => Ok(count),
            (status, _) => Err(reply_error("DEL", status, cmd.error_text())),
        };
        self.free(&cmd);
        result
    }

    /// Publishes `msg` to `topic`, ignoring the outcome.
    pub fn publish(&self, topic: impl Into<Vec<u8>>, msg: impl Into<Vec<u8>>) {
        self.command_forget(vec![b"PUBLISH".to_vec(), topic.into(), msg.into()]);
    }

    /// Publishes `msg` to `topic`; `on_result` is invoked on the loop thread with the number
    /// of subscribers that received it, or the error.
    pub fn publish_with<F>(
        &self,
        topic: impl Into<Vec<u8>>,
        msg: impl Into<Vec<u8>>,
        on_result: F,
    ) where
        F: FnOnce(Result<i64, Error>) + Send + 'static,
    {
        let mut on_result = Some(on_result);
        self.command(
            vec![b"PUBLISH".to_vec(), topic.into(), msg.into()],
            ReplyShape::Long,
            move |cmd: &Command| {
                if let Some(on_result) = on_result.take() {
                    let outcome = match (cmd.status(), cmd.reply()) {
                        (ReplyStatus::Ok, Some(Reply::Long(count))) => Ok(count),
                        (status, _) => Err(reply_error("PUBLISH", status, cmd.error_text())),
                    };
                    on_result(outcome);
                }
            },
        );
    }

    /// The number of commands created and retired over this engine's lifetime.  When the
    /// engine is idle the two are equal.
    pub fn command_counts(&self) -> (u64, u64) {
        (
            self.shared.registry.created(),
            self.shared.registry.deleted(),
        )
    }

    pub(crate) fn create_command(
        &self,
        argv: Vec<Vec<u8>>,
        shape: ReplyShape,
        callback: Option<CommandCallback>,
        repeat: f64,
        after: f64,
        free_memory: bool,
    ) -> Arc<Command> {
        if argv.is_empty() {
            log::error!("rejecting a command with an empty argv");
            return send_error_record(argv, shape, callback);
        }
        let links = match (&self.links, self.shared.state()) {
            (Some(links), ConnectionState::Connected) => links,
            (_, state) => {
                log::warn!(
                    "cannot submit a command while the connection state is {:?}",
                    state
                );
                return send_error_record(argv, shape, callback);
            }
        };
        let cmd = match self
            .shared
            .registry
            .insert(argv, shape, callback, repeat, after, free_memory)
        {
            Ok(cmd) => cmd,
            // The loop wound down between the state check and the insertion
            Err((argv, callback)) => return send_error_record(argv, shape, callback),
        };
        let queued = QueuedId {
            id: cmd.id(),
            shape,
        };
        if links.submit_tx.unbounded_send(queued).is_err() {
            // The loop wound down between the state check and the send
            self.shared.registry.remove(queued.id, queued.shape);
            cmd.set_status(ReplyStatus::SendError);
            cmd.invoke_callback();
        }
        cmd
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// A record that was refused before submission.  It never enters the registry; the id 0 is
/// reserved and never assigned to live commands.
fn send_error_record(
    argv: Vec<Vec<u8>>,
    shape: ReplyShape,
    callback: Option<CommandCallback>,
) -> Arc<Command> {
    let cmd = Arc::new(Command::new(0, argv, shape, callback, 0.0, 0.0, false));
    cmd.set_status(ReplyStatus::SendError);
    cmd.invoke_callback();
    cmd
}

pub(crate) fn reply_error(op: &str, status: ReplyStatus, error_text: Option<String>) -> Error {
    match status {
        ReplyStatus::ErrorReply => Error::Remote(
            error_text.unwrap_or_else(|| format!("{} failed with a server error", op)),
        ),
        ReplyStatus::NilReply => error::unexpected(format!("{} returned nil", op)),
        ReplyStatus::WrongType => {
            error::unexpected(format!("{} returned a reply of an unexpected shape", op))
        }
        ReplyStatus::SendError => Error::Connection(ConnectionReason::NotConnected),
        _ => error::internal(format!("{} did not complete", op)),
    }
}

fn to_argv<A, S>(argv: A) -> Vec<Vec<u8>>
where
    A: IntoIterator<Item = S>,
    S: Into<Vec<u8>>,
{
    argv.into_iter().map(Into::into).collect()
}

/// The gate a blocked `command_sync` caller waits behind until its callback fires.
struct SyncGate {
    done: Mutex<bool>,
    signal: Condvar,
}

impl SyncGate {
    fn new() -> SyncGate {
        SyncGate {
            done: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    fn open(&self) {
        *self.done.lock().expect("sync gate lock poisoned") = true;
        self.signal.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().expect("sync gate lock poisoned");
        while !*done {
            done = self.signal.wait(done).expect("sync gate lock poisoned");
        }
    }
}

/// The body of the loop thread: build a small single-threaded runtime, connect, drive the loop
/// future to completion, then retire whatever is left and report the final state.
fn run_loop(
    addr: ServerAddr,
    shared: Arc<Shared>,
    submit_rx: mpsc::UnboundedReceiver<QueuedId>,
    free_rx: mpsc::UnboundedReceiver<QueuedId>,
    stop_rx: oneshot::Receiver<()>,
    pubsub: bool,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("failed to build the loop runtime: {}", e);
            shared.set_state(ConnectionState::ConnectError);
            return;
        }
    };

    runtime.block_on(async move {
        let connection = match connect::connect(&addr).await {
            Ok(connection) => connection,
            Err(e) => {
                log::error!("connection to {} failed: {}", addr, e);
                shared.set_state(ConnectionState::ConnectError);
                return;
            }
        };
        log::debug!("connected to {}", addr);
        shared.set_state(ConnectionState::Connected);

        let result =
            EngineInner::new(connection, shared.clone(), submit_rx, free_rx, stop_rx, pubsub)
                .await;
        finish_remaining(&shared.registry, pubsub);
        match result {
            Ok(()) => shared.set_state(ConnectionState::Disconnected),
            Err(e) => {
                log::error!("connection to {} lost: {}", addr, e);
                shared.set_state(ConnectionState::DisconnectError);
            }
        }
    });
}

/// Retires every record still registered as the loop winds down.  A one-shot command that
/// never reached a terminal state has its callback invoked exactly once with `NoReply`, so a
/// blocked `command_sync` caller always wakes; repeating commands and subscriptions are
/// dropped without a further callback.
fn finish_remaining(registry: &Registry, pubsub: bool) {
    registry.close();
    for cmd in registry.drain() {
        if pubsub || cmd.is_repeating() {
            continue;
        }
        if cmd.status() == ReplyStatus::NoReply && !cmd.is_canceled() {
            cmd.invoke_callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    // None of these engines ever connect, so no loop thread is spawned and no network is
    // touched

    #[test]
    fn sync_command_before_connect_returns_send_error_without_blocking() {
        let engine = Engine::new("127.0.0.1", 6379);
        let cmd = engine.command_sync(vec!["GET", "x"], ReplyShape::Bytes);
        assert_eq!(cmd.status(), ReplyStatus::SendError);
        assert_eq!(cmd.reply(), None);
        // Refused records never enter the registry and never consume an id
        assert_eq!(cmd.id(), 0);
        assert_eq!(engine.command_counts(), (0, 0));
    }

    #[test]
    fn async_callback_fires_once_when_refused() {
        let engine = Engine::new("127.0.0.1", 6379);
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        engine.command(vec!["PING"], ReplyShape::Raw, move |cmd: &Command| {
            if cmd.status() == ReplyStatus::SendError {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reply_error_classifies_statuses() {
        match reply_error("GET", ReplyStatus::ErrorReply, Some("ERR boom".to_owned())) {
            Error::Remote(text) => assert_eq!(text, "ERR boom"),
            other => panic!("expected a remote error, got {:?}", other),
        }
        assert!(matches!(
            reply_error("GET", ReplyStatus::NilReply, None),
            Error::Unexpected(_)
        ));
        assert!(matches!(
            reply_error("GET", ReplyStatus::SendError, None),
            Error::Connection(ConnectionReason::NotConnected)
        ));
    }

    #[test]
    fn argv_bytes_pass_through_untouched() {
        let argv = to_argv(vec![b"SET".to_vec(), b"k\0ey".to_vec(), b"a b\r\nc".to_vec()]);
        assert_eq!(argv[1], b"k\0ey");
        assert_eq!(argv[2], b"a b\r\nc");
    }

    #[test]
    fn disconnect_without_connect_is_a_noop() {
        let mut engine = Engine::new("127.0.0.1", 6379);
        engine.disconnect();
        assert_eq!(engine.state(), ConnectionState::NotYetConnected);
    }
}
