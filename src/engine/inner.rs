/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The loop future driven by the engine's dedicated thread.
//!
//! Everything the socket touches lives here: the framed connection, the per-command timers,
//! the in-flight reply pairing, and the registry's deletion path.  Caller threads reach the
//! loop only through the submission channel, the free channel and the stop signal; each send
//! doubles as a wake-up.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_channel::{mpsc, oneshot};
use futures_sink::Sink;
use futures_util::stream::{Fuse, StreamExt};

use tokio_util::time::{delay_queue::Key, DelayQueue};

use crate::command::Command;
use crate::error::Error;
use crate::protocol::resp::RespValue;
use crate::pubsub::frame::{self, PubsubFrame};
use crate::reply::{self, ReplyShape};

use super::connect::RespConnection;
use super::Shared;

/// A command id paired with its home partition; the unit queued from caller threads into the
/// loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueuedId {
    pub(crate) id: u64,
    pub(crate) shape: ReplyShape,
}

/// A subscription submitted to the server whose confirmation frame has not arrived yet.
struct PendingSub {
    topic: String,
    id: u64,
    pattern: bool,
}

/// Routing state for a connection in subscription mode: topics map to the long-lived commands
/// whose dispatchers consume their frames.
#[derive(Default)]
struct Demux {
    pending: VecDeque<PendingSub>,
    channels: HashMap<String, u64>,
    patterns: HashMap<String, u64>,
}

impl Demux {
    fn take_pending(&mut self, topic: &str, pattern: bool) -> Option<u64> {
        let pos = self
            .pending
            .iter()
            .position(|sub| sub.pattern == pattern && sub.topic == topic)?;
        self.pending.remove(pos).map(|sub| sub.id)
    }
}

pub(crate) struct EngineInner {
    connection: RespConnection,
    shared: Arc<Shared>,
    submit_rx: Fuse<mpsc::UnboundedReceiver<QueuedId>>,
    free_rx: Fuse<mpsc::UnboundedReceiver<QueuedId>>,
    stop_rx: oneshot::Receiver<()>,
    /// Delayed and repeating commands, keyed for cancellation
    timers: DelayQueue<QueuedId>,
    timer_keys: HashMap<u64, Key>,
    /// Submitted commands awaiting replies, oldest first.  Unused in subscription mode.
    in_flight: VecDeque<QueuedId>,
    /// Present when this connection is in subscription mode
    demux: Option<Demux>,
    /// Frames accepted for sending but not yet handed to the connection
    outbox: VecDeque<RespValue>,
    stopping: bool,
}

impl EngineInner {
    pub(crate) fn new(
        connection: RespConnection,
        shared: Arc<Shared>,
        submit_rx: mpsc::UnboundedReceiver<QueuedId>,
        free_rx: mpsc::UnboundedReceiver<QueuedId>,
        stop_rx: oneshot::Receiver<()>,
        pubsub: bool,
    ) -> EngineInner {
        EngineInner {
            connection,
            shared,
            submit_rx: submit_rx.fuse(),
            free_rx: free_rx.fuse(),
            stop_rx,
            timers: DelayQueue::new(),
            timer_keys: HashMap::new(),
            in_flight: VecDeque::new(),
            demux: if pubsub { Some(Demux::default()) } else { None },
            outbox: VecDeque::new(),
            stopping: false,
        }
    }

    /// Moves frames from the outbox into the connection while it will take them.
    fn pump_outbox(&mut self, cx: &mut Context) -> Result<(), Error> {
        while let Some(frame) = self.outbox.pop_front() {
            match Pin::new(&mut self.connection).poll_ready(cx) {
                Poll::Ready(Ok(())) => Pin::new(&mut self.connection).start_send(frame)?,
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Pending => {
                    self.outbox.push_front(frame);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn handle_submissions(&mut self, cx: &mut Context) -> Result<(), Error> {
        loop {
            match self.submit_rx.poll_next_unpin(cx) {
                Poll::Ready(Some(queued)) => self.admit(queued),
                Poll::Ready(None) | Poll::Pending => break,
            }
        }
        self.pump_outbox(cx)
    }

    /// First processing of a freshly queued command: delayed and repeating commands get their
    /// timer started, everything else is submitted straight away.
    fn admit(&mut self, queued: QueuedId) {
        let cmd = match self.shared.registry.find(queued.id, queued.shape) {
            Some(cmd) => cmd,
            // Freed before its first dispatch
            None => return,
        };
        if cmd.is_canceled() {
            self.shared.registry.remove(queued.id, queued.shape);
            return;
        }
        if cmd.is_scheduled() {
            let key = self.timers.insert(queued, delay(cmd.after()));
            self.timer_keys.insert(queued.id, key);
        } else {
            self.submit_now(queued, &cmd);
        }
    }

    fn submit_now(&mut self, queued: QueuedId, cmd: &Arc<Command>) {
        if self.demux.is_some() {
            self.submit_subscription(queued, cmd);
        } else {
            cmd.inc_pending();
            self.in_flight.push_back(queued);
            self.outbox.push_back(cmd.to_frame());
        }
    }

    /// In subscription mode nothing is paired first-in-first-out: subscribe commands are
    /// registered with the demultiplexer and stay alive until their unsubscribe confirmation,
    /// while every other command is send-only.
    fn submit_subscription(&mut self, queued: QueuedId, cmd: &Arc<Command>) {
        let demux = match self.demux.as_mut() {
            Some(demux) => demux,
            None => return,
        };
        let argv = cmd.argv();
        let verb = argv.first().map(|v| v.as_slice()).unwrap_or(b"");
        let subscribes = verb.eq_ignore_ascii_case(b"SUBSCRIBE");
        let psubscribes = verb.eq_ignore_ascii_case(b"PSUBSCRIBE");
        if subscribes || psubscribes {
            let topic = match argv.get(1) {
                Some(topic) => String::from_utf8_lossy(topic).into_owned(),
                None => {
                    log::error!("subscription command without a topic: {}", cmd.command_text());
                    self.shared.registry.remove(queued.id, queued.shape);
                    return;
                }
            };
            demux.pending.push_back(PendingSub {
                topic,
                id: queued.id,
                pattern: psubscribes,
            });
            self.outbox.push_back(cmd.to_frame());
        } else {
            // Confirmation frames are addressed to the subscription they affect, nothing ever
            // routes back to this record
            self.outbox.push_back(cmd.to_frame());
            self.shared.registry.remove(queued.id, queued.shape);
        }
    }

    fn handle_timers(&mut self, cx: &mut Context) -> Result<(), Error> {
        loop {
            match self.timers.poll_expired(cx) {
                Poll::Ready(Some(expired)) => {
                    let queued = expired.into_inner();
                    self.timer_keys.remove(&queued.id);
                    let cmd = match self.shared.registry.find(queued.id, queued.shape) {
                        Some(cmd) => cmd,
                        None => continue,
                    };
                    if cmd.is_canceled() {
                        // The tick observes the cancellation: the timer is gone, and the
                        // record goes too once no replies are outstanding
                        if cmd.pending() == 0 {
                            self.shared.registry.remove(queued.id, queued.shape);
                        }
                        continue;
                    }
                    self.submit_now(queued, &cmd);
                    if cmd.is_repeating() {
                        let key = self.timers.insert(queued, delay(cmd.repeat()));
                        self.timer_keys.insert(queued.id, key);
                    }
                }
                Poll::Ready(None) | Poll::Pending => break,
            }
        }
        self.pump_outbox(cx)
    }

    fn handle_frees(&mut self, cx: &mut Context) {
        loop {
            match self.free_rx.poll_next_unpin(cx) {
                Poll::Ready(Some(queued)) => self.release(queued),
                Poll::Ready(None) | Poll::Pending => break,
            }
        }
    }

    fn release(&mut self, queued: QueuedId) {
        if let Some(key) = self.timer_keys.remove(&queued.id) {
            self.timers.remove(&key);
        }
        self.shared.registry.remove(queued.id, queued.shape);
    }

    fn do_flush(&mut self, cx: &mut Context) -> Result<(), Error> {
        match Pin::new(&mut self.connection).poll_flush(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => Ok(()),
        }
    }

    fn handle_replies(&mut self, cx: &mut Context) -> Result<(), Error> {
        loop {
            match self.connection.poll_next_unpin(cx) {
                Poll::Pending => return Ok(()),
                Poll::Ready(None) => return Err(Error::EndOfStream),
                Poll::Ready(Some(Err(e))) => return Err(e),
                Poll::Ready(Some(Ok(frame))) => {
                    if self.demux.is_some() {
                        self.route_subscription_frame(frame);
                    } else {
                        self.pair_reply(frame);
                    }
                }
            }
        }
    }

    fn pair_reply(&mut self, frame: RespValue) {
        match self.in_flight.pop_front() {
            Some(queued) => self.finish_reply(queued, frame),
            None => log::warn!("reply received with no command in flight, dropping it"),
        }
    }

    fn finish_reply(&mut self, queued: QueuedId, frame: RespValue) {
        let cmd = match self.shared.registry.find(queued.id, queued.shape) {
            Some(cmd) => cmd,
            None => {
                // Orphan reply: the command was freed while its reply was in transit
                log::debug!("dropping reply for unregistered command {}", queued.id);
                return;
            }
        };
        let remaining = cmd.dec_pending();
        if cmd.is_canceled() {
            if remaining == 0 && !self.timer_keys.contains_key(&queued.id) {
                self.shared.registry.remove(queued.id, queued.shape);
            }
            return;
        }
        cmd.store_reply(reply::decode(queued.shape, frame));
        cmd.invoke_callback();
        if !cmd.is_repeating() && cmd.frees_automatically() && cmd.pending() == 0 {
            self.shared.registry.remove(queued.id, queued.shape);
        }
    }

    fn route_subscription_frame(&mut self, frame: RespValue) {
        let demux = match self.demux.as_mut() {
            Some(demux) => demux,
            None => return,
        };
        match frame::parse(&frame) {
            Some(PubsubFrame::Subscribed { topic }) => match demux.take_pending(&topic, false) {
                Some(id) => {
                    demux.channels.insert(topic, id);
                    deliver(&self.shared, id, frame);
                }
                None => log::warn!("subscribe confirmation for an unexpected topic: {}", topic),
            },
            Some(PubsubFrame::PatternSubscribed { pattern }) => {
                match demux.take_pending(&pattern, true) {
                    Some(id) => {
                        demux.patterns.insert(pattern, id);
                        deliver(&self.shared, id, frame);
                    }
                    None => {
                        log::warn!("psubscribe confirmation for an unexpected pattern: {}", pattern)
                    }
                }
            }
            Some(PubsubFrame::Unsubscribed { topic }) => match demux.channels.remove(&topic) {
                Some(id) => {
                    deliver(&self.shared, id, frame);
                    self.shared.registry.remove(id, ReplyShape::Raw);
                }
                None => log::warn!("unsubscribe confirmation for a topic not held: {}", topic),
            },
            Some(PubsubFrame::PatternUnsubscribed { pattern }) => {
                match demux.patterns.remove(&pattern) {
                    Some(id) => {
                        deliver(&self.shared, id, frame);
                        self.shared.registry.remove(id, ReplyShape::Raw);
                    }
                    None => {
                        log::warn!("punsubscribe confirmation for a pattern not held: {}", pattern)
                    }
                }
            }
            Some(PubsubFrame::Message { topic, .. }) => match demux.channels.get(&topic) {
                Some(&id) => deliver(&self.shared, id, frame),
                None => log::warn!("message for a topic not subscribed to: {}", topic),
            },
            Some(PubsubFrame::PatternMessage { pattern, .. }) => {
                match demux.patterns.get(&pattern) {
                    Some(&id) => deliver(&self.shared, id, frame),
                    None => log::warn!("message for a pattern not subscribed to: {}", pattern),
                }
            }
            None => {
                if let RespValue::Error(text) = &frame {
                    // An error reply on a subscription connection belongs to the oldest
                    // subscription the server has not yet confirmed
                    let text = text.clone();
                    match demux.pending.pop_front() {
                        Some(pending) => {
                            deliver(&self.shared, pending.id, frame);
                            self.shared.registry.remove(pending.id, ReplyShape::Raw);
                        }
                        None => log::error!("server error on subscription connection: {}", text),
                    }
                } else {
                    log::warn!("unknown pub/sub frame: {:?}", frame);
                }
            }
        }
    }

    /// Entering shutdown: late submissions are not sent, timers stop, and whatever is still
    /// registered is retired by the terminal drain once the loop finishes.
    fn begin_stop(&mut self) {
        self.stopping = true;
        self.timers.clear();
        self.timer_keys.clear();
        self.outbox.clear();
        self.in_flight.clear();
    }
}

/// Delivers a raw frame to a subscription command: the decoded frame lands in the record and
/// its dispatcher callback runs on this, the loop thread.
fn deliver(shared: &Shared, id: u64, frame: RespValue) {
    if let Some(cmd) = shared.registry.find(id, ReplyShape::Raw) {
        cmd.store_reply(reply::decode(ReplyShape::Raw, frame));
        cmd.invoke_callback();
    }
}

fn delay(seconds: f64) -> Duration {
    if seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::from_millis(0)
    }
}

impl Future for EngineInner {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.stopping {
            if let Poll::Ready(_) = Pin::new(&mut this.stop_rx).poll(cx) {
                this.begin_stop();
            }
        }

        if this.stopping {
            // Flush whatever the connection has buffered and close it down
            return match Pin::new(&mut this.connection).poll_close(cx) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            };
        }

        if let Err(e) = this.handle_submissions(cx) {
            return Poll::Ready(Err(e));
        }
        if let Err(e) = this.handle_timers(cx) {
            return Poll::Ready(Err(e));
        }
        this.handle_frees(cx);
        if let Err(e) = this.do_flush(cx) {
            return Poll::Ready(Err(e));
        }
        if let Err(e) = this.handle_replies(cx) {
            return Poll::Ready(Err(e));
        }

        Poll::Pending
    }
}
