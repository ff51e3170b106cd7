/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! PUBSUB support.
//!
//! A connection in subscription mode is useless for ordinary commands, so subscriptions get an
//! engine of their own: a [`Subscriber`] wraps a second [`Engine`] whose loop routes every
//! inbound frame by topic instead of pairing replies with requests.  Publishing happens from a
//! normal engine (see [`Engine::publish`]).
//!
//! Each call to [`Subscriber::subscribe`] issues one long-lived SUBSCRIBE command; the
//! command's callback is a dispatcher that interprets the frames pushed for that topic,
//! maintains the subscribed-topic sets, and fans out to the handlers the caller supplied.
//! Unsubscribing sends the UNSUBSCRIBE command; it is the confirmation frame coming back that
//! removes the topic from the set and retires the command.
//!
//! ```no_run
//! use redis_engine::{Subscriber, TopicHandlers};
//!
//! let mut subscriber = Subscriber::new("127.0.0.1", 6379);
//! subscriber.connect().expect("Cannot connect");
//!
//! subscriber.subscribe(
//!     "news",
//!     TopicHandlers::new(|topic, payload: &[u8]| {
//!         println!("{}: {}", topic, String::from_utf8_lossy(payload));
//!     }),
//! );
//! ```

pub(crate) mod frame;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::command::Command;
use crate::engine::{ConnectionState, Engine, EngineBuilder};
use crate::error::Error;
use crate::reply::{Reply, ReplyShape, ReplyStatus};

use frame::PubsubFrame;

/// The callbacks attached to one subscribed topic.  Only the message handler is required.
pub struct TopicHandlers {
    on_message: Box<dyn FnMut(&str, &[u8]) + Send>,
    on_subscribe: Option<Box<dyn FnMut(&str) + Send>>,
    on_unsubscribe: Option<Box<dyn FnMut(&str) + Send>>,
    on_error: Option<Box<dyn FnMut(&str, Error) + Send>>,
}

impl TopicHandlers {
    /// Handlers that deliver messages to `on_message` as `(topic, payload)`.  For a pattern
    /// subscription the topic argument is the concrete channel the message was published to.
    pub fn new(on_message: impl FnMut(&str, &[u8]) + Send + 'static) -> TopicHandlers {
        TopicHandlers {
            on_message: Box::new(on_message),
            on_subscribe: None,
            on_unsubscribe: None,
            on_error: None,
        }
    }

    /// Invoked once the server confirms the subscription.
    pub fn on_subscribe(mut self, callback: impl FnMut(&str) + Send + 'static) -> TopicHandlers {
        self.on_subscribe = Some(Box::new(callback));
        self
    }

    /// Invoked once the server confirms the unsubscription.
    pub fn on_unsubscribe(mut self, callback: impl FnMut(&str) + Send + 'static) -> TopicHandlers {
        self.on_unsubscribe = Some(Box::new(callback));
        self
    }

    /// Invoked when the subscription fails: the server rejects it, or the connection goes away
    /// before it completes.
    pub fn on_error(
        mut self,
        callback: impl FnMut(&str, Error) + Send + 'static,
    ) -> TopicHandlers {
        self.on_error = Some(Box::new(callback));
        self
    }
}

#[derive(Default)]
struct TopicSets {
    channels: BTreeSet<String>,
    patterns: BTreeSet<String>,
    pending_channels: BTreeSet<String>,
    pending_patterns: BTreeSet<String>,
}

impl TopicSets {
    fn active(&mut self, pattern: bool) -> &mut BTreeSet<String> {
        if pattern {
            &mut self.patterns
        } else {
            &mut self.channels
        }
    }

    fn pending(&mut self, pattern: bool) -> &mut BTreeSet<String> {
        if pattern {
            &mut self.pending_patterns
        } else {
            &mut self.pending_channels
        }
    }
}

/// A dedicated connection for subscriptions.
pub struct Subscriber {
    engine: Engine,
    topics: Arc<Mutex<TopicSets>>,
}

impl Subscriber {
    /// A subscriber for the server at `host:port`, with default configuration.
    pub fn new(host: impl Into<String>, port: u16) -> Subscriber {
        Subscriber::with_builder(EngineBuilder::tcp(host, port))
    }

    /// A subscriber configured through an [`EngineBuilder`], for Unix sockets or state-change
    /// callbacks.
    pub fn with_builder(builder: EngineBuilder) -> Subscriber {
        Subscriber {
            engine: Engine::from_builder(builder, true),
            topics: Arc::new(Mutex::new(TopicSets::default())),
        }
    }

    /// Spawns the loop thread and connects, exactly as [`Engine::connect`] does.
    pub fn connect(&mut self) -> Result<(), Error> {
        self.engine.connect()
    }

    pub fn disconnect(&mut self) {
        self.engine.disconnect();
    }

    pub fn wait(&mut self) {
        self.engine.wait();
    }

    pub fn state(&self) -> ConnectionState {
        self.engine.state()
    }

    /// Subscribes to `topic`.  Subscribing to a topic already held (or being set up) is a
    /// no-op, logged as a warning.
    pub fn subscribe(&self, topic: &str, handlers: TopicHandlers) {
        self.subscribe_base(topic, handlers, false);
    }

    /// Subscribes to every channel matching `pattern`.
    pub fn psubscribe(&self, pattern: &str, handlers: TopicHandlers) {
        self.subscribe_base(pattern, handlers, true);
    }

    fn subscribe_base(&self, topic: &str, handlers: TopicHandlers, pattern: bool) {
        {
            let mut sets = self.topics.lock().expect("topic sets lock poisoned");
            if sets.active(pattern).contains(topic) || sets.pending(pattern).contains(topic) {
                log::warn!("already subscribed to {}, ignoring", topic);
                return;
            }
            sets.pending(pattern).insert(topic.to_owned());
        }
        let verb: &[u8] = if pattern {
            b"PSUBSCRIBE"
        } else {
            b"SUBSCRIBE"
        };
        let dispatcher = make_dispatcher(
            topic.to_owned(),
            handlers,
            self.topics.clone(),
            pattern,
        );
        self.engine.create_command(
            vec![verb.to_vec(), topic.as_bytes().to_vec()],
            ReplyShape::Raw,
            Some(Box::new(dispatcher)),
            0.0,
            0.0,
            false,
        );
    }

    /// Unsubscribes from `topic`.  The topic leaves [`Subscriber::channels`] when the server's
    /// confirmation frame arrives, not when this call returns.  Unsubscribing from a topic not
    /// held is a no-op, logged as a warning.
    pub fn unsubscribe(&self, topic: &str) {
        self.unsubscribe_base(topic, false);
    }

    pub fn punsubscribe(&self, pattern: &str) {
        self.unsubscribe_base(pattern, true);
    }

    fn unsubscribe_base(&self, topic: &str, pattern: bool) {
        {
            let mut sets = self.topics.lock().expect("topic sets lock poisoned");
            if !sets.active(pattern).contains(topic) && !sets.pending(pattern).contains(topic) {
                log::warn!("cannot unsubscribe from {}, not subscribed", topic);
                return;
            }
        }
        let verb: &[u8] = if pattern {
            b"PUNSUBSCRIBE"
        } else {
            b"UNSUBSCRIBE"
        };
        self.engine.create_command(
            vec![verb.to_vec(), topic.as_bytes().to_vec()],
            ReplyShape::Raw,
            None,
            0.0,
            0.0,
            true,
        );
    }

    /// A snapshot of the channels with confirmed subscriptions.
    pub fn channels(&self) -> BTreeSet<String> {
        self.topics
            .lock()
            .expect("topic sets lock poisoned")
            .channels
            .clone()
    }

    /// A snapshot of the patterns with confirmed subscriptions.
    pub fn patterns(&self) -> BTreeSet<String> {
        self.topics
            .lock()
            .expect("topic sets lock poisoned")
            .patterns
            .clone()
    }
}

/// Builds the dispatcher installed as the subscription command's callback.  It runs on the
/// loop thread for every frame routed to the topic: it keeps the topic sets current and fans
/// out to the caller's handlers.
fn make_dispatcher(
    topic: String,
    handlers: TopicHandlers,
    topics: Arc<Mutex<TopicSets>>,
    pattern: bool,
) -> impl FnMut(&Command) + Send {
    let TopicHandlers {
        mut on_message,
        mut on_subscribe,
        mut on_unsubscribe,
        mut on_error,
    } = handlers;

    move |cmd: &Command| {
        let frame = match (cmd.status(), cmd.reply()) {
            (ReplyStatus::Ok, Some(Reply::Raw(frame))) => frame,
            (status, _) => {
                // The subscription never made it: drop the reservation and report
                topics
                    .lock()
                    .expect("topic sets lock poisoned")
                    .pending(pattern)
                    .remove(&topic);
                let error = crate::engine::reply_error("SUBSCRIBE", status, cmd.error_text());
                match &mut on_error {
                    Some(on_error) => on_error(&topic, error),
                    None => log::error!("subscription to {} failed: {}", topic, error),
                }
                return;
            }
        };
        match frame::parse(&frame) {
            Some(PubsubFrame::Subscribed { topic: confirmed })
            | Some(PubsubFrame::PatternSubscribed {
                pattern: confirmed,
            }) => {
                {
                    let mut sets = topics.lock().expect("topic sets lock poisoned");
                    sets.pending(pattern).remove(&confirmed);
                    sets.active(pattern).insert(confirmed.clone());
                }
                if let Some(on_subscribe) = &mut on_subscribe {
                    on_subscribe(&confirmed);
                }
            }
            Some(PubsubFrame::Unsubscribed { topic: confirmed })
            | Some(PubsubFrame::PatternUnsubscribed {
                pattern: confirmed,
            }) => {
                {
                    let mut sets = topics.lock().expect("topic sets lock poisoned");
                    sets.active(pattern).remove(&confirmed);
                    sets.pending(pattern).remove(&confirmed);
                }
                if let Some(on_unsubscribe) = &mut on_unsubscribe {
                    on_unsubscribe(&confirmed);
                }
            }
            Some(PubsubFrame::Message { topic, payload }) => on_message(&topic, &payload),
            Some(PubsubFrame::PatternMessage {
                channel, payload, ..
            }) => on_message(&channel, &payload),
            None => log::warn!("unknown pub/sub frame for {}: {:?}", topic, frame),
        }
    }
}
