/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The in-flight representation of one command.
//!
//! A [`Command`] pairs the immutable request (its argv, its expected reply shape, its schedule)
//! with the mutable delivery state: how many replies are outstanding, whether it has been
//! canceled, and the most recent decoded reply.  The engine's loop thread writes the delivery
//! state; caller threads read it after synchronising through the user callback or the blocking
//! wait of `command_sync`.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::protocol::resp::RespValue;
use crate::reply::{Decoded, Reply, ReplyShape, ReplyStatus};

/// The capability invoked with the populated command on every reply delivery.  Stored by value
/// inside the record, so it may outlive the scope that created the command.
pub type CommandCallback = Box<dyn FnMut(&Command) + Send>;

pub struct Command {
    id: u64,
    argv: Vec<Vec<u8>>,
    shape: ReplyShape,
    repeat: f64,
    after: f64,
    free_memory: bool,

    /// Replies submitted to the server but not yet received
    pending: AtomicUsize,
    canceled: AtomicBool,
    status: AtomicU8,
    reply: Mutex<Option<Reply>>,
    error_text: Mutex<Option<String>>,
    callback: Mutex<Option<CommandCallback>>,
}

impl Command {
    pub(crate) fn new(
        id: u64,
        argv: Vec<Vec<u8>>,
        shape: ReplyShape,
        callback: Option<CommandCallback>,
        repeat: f64,
        after: f64,
        free_memory: bool,
    ) -> Command {
        Command {
            id,
            argv,
            shape,
            repeat,
            after,
            free_memory,
            pending: AtomicUsize::new(0),
            canceled: AtomicBool::new(false),
            status: AtomicU8::new(ReplyStatus::NoReply as u8),
            reply: Mutex::new(None),
            error_text: Mutex::new(None),
            callback: Mutex::new(callback),
        }
    }

    /// The unique id of this command.  Ids are assigned from a per-engine counter and are never
    /// reused within the lifetime of the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The shape this command expects its reply in.
    pub fn shape(&self) -> ReplyShape {
        self.shape
    }

    /// The argv this command was built from, one byte string per argument.
    pub fn argv(&self) -> &[Vec<u8>] {
        &self.argv
    }

    /// The status of the most recent reply delivery.
    pub fn status(&self) -> ReplyStatus {
        ReplyStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// `true` once the most recent reply decoded into the expected shape.
    pub fn ok(&self) -> bool {
        self.status() == ReplyStatus::Ok
    }

    /// A copy of the most recent decoded reply, present only after a successful delivery.
    pub fn reply(&self) -> Option<Reply> {
        self.reply.lock().expect("reply lock poisoned").clone()
    }

    /// The error text attached to an `ErrorReply` status.
    pub fn error_text(&self) -> Option<String> {
        self.error_text
            .lock()
            .expect("error text lock poisoned")
            .clone()
    }

    /// Marks the command canceled.  The engine's next timer tick for this command observes the
    /// flag, stops the timer, and retires the record once no replies are outstanding.  No user
    /// callback is invoked after that point.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// A human-readable rendition of the argv, for log messages.
    pub fn command_text(&self) -> String {
        self.argv
            .iter()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub(crate) fn repeat(&self) -> f64 {
        self.repeat
    }

    pub(crate) fn after(&self) -> f64 {
        self.after
    }

    pub(crate) fn is_repeating(&self) -> bool {
        self.repeat > 0.0
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.repeat > 0.0 || self.after > 0.0
    }

    pub(crate) fn frees_automatically(&self) -> bool {
        self.free_memory
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_pending(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the outstanding-reply counter, returning the count left.
    pub(crate) fn dec_pending(&self) -> usize {
        let before = self.pending.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(before > 0, "pending counter underflow");
        before.saturating_sub(1)
    }

    pub(crate) fn set_status(&self, status: ReplyStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Installs the outcome of one reply delivery: status, decoded value and error text.
    pub(crate) fn store_reply(&self, decoded: Decoded) {
        *self.reply.lock().expect("reply lock poisoned") = decoded.reply;
        *self.error_text.lock().expect("error text lock poisoned") = decoded.error;
        self.set_status(decoded.status);
    }

    /// Runs the user callback, if any.  A panic unwinding out of the callback is caught here,
    /// at the dispatch boundary, and logged; it must not tear down the loop thread.
    pub(crate) fn invoke_callback(&self) {
        let mut slot = self.callback.lock().expect("callback lock poisoned");
        if let Some(callback) = slot.as_mut() {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(self))).is_err() {
                log::error!("{}: user callback panicked", self.command_text());
            }
        }
    }

    /// The wire frame for this command: an array of length-counted bulk strings.  The user's
    /// bytes are never escaped or re-quoted.
    pub(crate) fn to_frame(&self) -> RespValue {
        RespValue::Array(
            self.argv
                .iter()
                .map(|arg| RespValue::BulkString(arg.clone()))
                .collect(),
        )
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("argv", &self.command_text())
            .field("shape", &self.shape)
            .field("status", &self.status())
            .field("pending", &self.pending())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
