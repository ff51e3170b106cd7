/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The table of live commands, indexed by id and partitioned by reply shape.
//!
//! Insertion happens on caller threads, deletion on the engine's loop thread; one mutex guards
//! all partitions.  A command is present here exactly as long as it may still be handed a reply
//! or a timer tick.  Each command has one home partition, fixed at construction, so a lookup
//! with the wrong shape misses rather than handing back a record of another type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::command::{Command, CommandCallback};
use crate::reply::ReplyShape;

#[derive(Default)]
struct Partitions {
    raw: HashMap<u64, Arc<Command>>,
    bytes: HashMap<u64, Arc<Command>>,
    int: HashMap<u64, Arc<Command>>,
    long: HashMap<u64, Arc<Command>>,
    nil: HashMap<u64, Arc<Command>>,
    vector: HashMap<u64, Arc<Command>>,
    set: HashMap<u64, Arc<Command>>,
    hash_set: HashMap<u64, Arc<Command>>,
}

impl Partitions {
    fn for_shape(&mut self, shape: ReplyShape) -> &mut HashMap<u64, Arc<Command>> {
        match shape {
            ReplyShape::Raw => &mut self.raw,
            ReplyShape::Bytes => &mut self.bytes,
            ReplyShape::Int => &mut self.int,
            ReplyShape::Long => &mut self.long,
            ReplyShape::Nil => &mut self.nil,
            ReplyShape::Vector => &mut self.vector,
            ReplyShape::Set => &mut self.set,
            ReplyShape::HashSet => &mut self.hash_set,
        }
    }

    fn all(&mut self) -> [&mut HashMap<u64, Arc<Command>>; 8] {
        [
            &mut self.raw,
            &mut self.bytes,
            &mut self.int,
            &mut self.long,
            &mut self.nil,
            &mut self.vector,
            &mut self.set,
            &mut self.hash_set,
        ]
    }
}

pub(crate) struct Registry {
    partitions: Mutex<Partitions>,
    closed: AtomicBool,
    created: AtomicU64,
    deleted: AtomicU64,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            partitions: Mutex::new(Partitions::default()),
            closed: AtomicBool::new(false),
            created: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
        }
    }

    /// Builds a command around the next unique id and inserts it in its home partition, as one
    /// step under the registry lock.  Once the registry has been closed nothing could ever
    /// retire a new record, so the insertion is refused and the argv and callback are handed
    /// back to the caller.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn insert(
        &self,
        argv: Vec<Vec<u8>>,
        shape: ReplyShape,
        callback: Option<CommandCallback>,
        repeat: f64,
        after: f64,
        free_memory: bool,
    ) -> Result<Arc<Command>, (Vec<Vec<u8>>, Option<CommandCallback>)> {
        let mut partitions = self.partitions.lock().expect("registry lock poisoned");
        if self.closed.load(Ordering::SeqCst) {
            return Err((argv, callback));
        }
        let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let command = Arc::new(Command::new(
            id,
            argv,
            shape,
            callback,
            repeat,
            after,
            free_memory,
        ));
        partitions.for_shape(shape).insert(id, command.clone());
        Ok(command)
    }

    /// Refuses all future insertions.  Called as the loop winds down, ahead of the final
    /// drain, so no record can slip in behind it.
    pub(crate) fn close(&self) {
        let _partitions = self.partitions.lock().expect("registry lock poisoned");
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn find(&self, id: u64, shape: ReplyShape) -> Option<Arc<Command>> {
        let mut partitions = self.partitions.lock().expect("registry lock poisoned");
        partitions.for_shape(shape).get(&id).cloned()
    }

    /// Removes the command from the registry.  This is the sole de-registration path; once it
    /// returns, no future reply or timer tick can reach the record.  Removing an id twice is a
    /// no-op.
    pub(crate) fn remove(&self, id: u64, shape: ReplyShape) -> Option<Arc<Command>> {
        let mut partitions = self.partitions.lock().expect("registry lock poisoned");
        let removed = partitions.for_shape(shape).remove(&id);
        if removed.is_some() {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    /// Empties every partition, handing back the records that were still live.  Used at
    /// shutdown.
    pub(crate) fn drain(&self) -> Vec<Arc<Command>> {
        let mut partitions = self.partitions.lock().expect("registry lock poisoned");
        let mut drained = Vec::new();
        for partition in partitions.all() {
            drained.extend(partition.drain().map(|(_, command)| command));
        }
        self.deleted
            .fetch_add(drained.len() as u64, Ordering::SeqCst);
        drained
    }

    pub(crate) fn len(&self) -> usize {
        let mut partitions = self.partitions.lock().expect("registry lock poisoned");
        partitions.all().iter().map(|p| p.len()).sum()
    }

    /// Total commands ever created; doubles as the id source.
    pub(crate) fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::SeqCst)
    }
}
