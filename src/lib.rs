/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! A callback-driven client for Redis-compatible servers.
//!
//! Each connection is owned by an [`Engine`](engine/struct.Engine.html): calling
//! [`connect`](engine/struct.Engine.html#method.connect) spawns one dedicated thread that runs
//! the event loop, owns the socket, and drives every command submitted to the engine from any
//! number of caller threads.  Replies come back typed, through a shape declared per command,
//! and are delivered either to a callback (asynchronous commands) or to a blocked caller
//! (synchronous commands).
//!
//! ## Commands
//!
//! A command is an argv, a sequence of binary-safe byte strings; it is framed as a
//! length-counted RESP array, so arguments may contain any bytes at all.  Four delivery styles
//! are available: fire-and-forget ([`command_forget`](engine/struct.Engine.html#method.command_forget)),
//! asynchronous with a callback ([`command`](engine/struct.Engine.html#method.command)),
//! blocking ([`command_sync`](engine/struct.Engine.html#method.command_sync)), and scheduled,
//! either one-shot after a delay or repeating on an interval
//! ([`command_loop`](engine/struct.Engine.html#method.command_loop)).
//!
//! ## PUBSUB
//!
//! A connection that subscribes stops being usable for ordinary commands, so subscriptions use
//! a dedicated [`Subscriber`](pubsub/struct.Subscriber.html): a second engine whose loop
//! demultiplexes inbound frames to per-topic handlers and tracks the subscribed channel and
//! pattern sets.
//!
//! ## Protocol
//!
//! The RESP value model and the tokio codec live in [`protocol`](protocol/index.html) and are
//! public: anything that needs to speak raw RESP, test servers included, can frame its own
//! streams with them.

#[macro_use]
pub mod protocol;

pub mod command;
pub mod engine;
pub mod error;
pub mod pubsub;
pub mod reply;

pub(crate) mod registry;

pub use command::Command;
pub use engine::{ConnectionState, Engine, EngineBuilder};
pub use error::Error;
pub use pubsub::{Subscriber, TopicHandlers};
pub use reply::{Reply, ReplyShape, ReplyStatus};
