// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The work pool: a dense table translating kernel user-data values into
//! typed work items with bounded cost.
//!
//! All three operations hold a single mutex. Contention is low because the
//! ring driver is single-threaded; the mutex exists so that a helper thread
//! can stage a send work item while the driver thread processes completions.

use log::*;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::ring::work::{
    AcceptCallback, Callback, CloseCallback, ConnectCallback, OpKind, RecvCallback, WorkId,
    WorkItem,
};
use crate::socket::Socket;

struct Slot {
    item: Option<Arc<Mutex<WorkItem>>>,
    /// Bumped on every free. A stale `WorkId` whose generation no longer
    /// matches the slot misses on lookup instead of reaching the slot's new
    /// occupant.
    generation: u32,
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Allocates, looks up and frees work items by their packed id.
pub struct WorkPool {
    inner: Mutex<Inner>,
}

impl WorkPool {
    pub fn new() -> WorkPool {
        WorkPool {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn alloc_accept(
        &self,
        socket: Arc<Socket>,
        callback: AcceptCallback,
        descr: &'static str,
    ) -> Arc<Mutex<WorkItem>> {
        self.alloc(OpKind::Accept, socket, descr, |item| {
            item.callback = Callback::Accept(callback);
        })
    }

    pub fn alloc_connect(
        &self,
        target: &SocketAddr,
        socket: Arc<Socket>,
        callback: ConnectCallback,
        link_next: bool,
        descr: &'static str,
    ) -> Arc<Mutex<WorkItem>> {
        self.alloc(OpKind::Connect, socket, descr, |item| {
            item.set_target(target);
            item.link_next = link_next;
            item.callback = Callback::Connect(callback);
        })
    }

    pub fn alloc_recv(
        &self,
        socket: Arc<Socket>,
        callback: RecvCallback,
        descr: &'static str,
    ) -> Arc<Mutex<WorkItem>> {
        self.alloc(OpKind::Recv, socket, descr, |item| {
            item.callback = Callback::Recv(callback);
        })
    }

    pub fn alloc_send(&self, socket: Arc<Socket>, descr: &'static str) -> Arc<Mutex<WorkItem>> {
        self.alloc(OpKind::Send, socket, descr, |_| {})
    }

    pub fn alloc_close(
        &self,
        socket: Arc<Socket>,
        callback: CloseCallback,
        descr: &'static str,
    ) -> Arc<Mutex<WorkItem>> {
        self.alloc(OpKind::Close, socket, descr, |item| {
            item.callback = Callback::Close(callback);
        })
    }

    /// Returns the item bound to `id`, or `None` when the item has already
    /// been freed (which happens legitimately when a multishot operation
    /// emits a completion after its item was released).
    pub fn lookup(&self, id: WorkId) -> Option<Arc<Mutex<WorkItem>>> {
        let inner = self.inner.lock().unwrap();
        let slot = inner.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.item.clone()
    }

    /// Releases the item bound to `id` and recycles its index.
    ///
    /// Panics when the slot is not occupied by `id`: freeing twice, or
    /// freeing an id that was never handed out, is a bug in the driver.
    pub fn free(&self, id: WorkId) {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .slots
            .get_mut(id.index as usize)
            .expect("work item index out of range");
        assert_eq!(slot.generation, id.generation, "work item already freed");
        assert!(slot.item.is_some(), "work item already freed");

        slot.item = None;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(id.index);
        trace!("freed work item {id}");
    }

    /// The number of items currently in use.
    pub fn in_use(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.slots.iter().filter(|s| s.item.is_some()).count()
    }

    fn alloc(
        &self,
        kind: OpKind,
        socket: Arc<Socket>,
        descr: &'static str,
        fill: impl FnOnce(&mut WorkItem),
    ) -> Arc<Mutex<WorkItem>> {
        let mut inner = self.inner.lock().unwrap();

        let (index, generation) = match inner.free.pop() {
            Some(index) => {
                let generation = inner.slots[index as usize].generation;
                trace!("allocating work item from free stack: {index} ({descr})");
                (index, generation)
            }
            None => {
                let index = inner.slots.len() as u32;
                debug!("new work item: index = {index} ({descr})");
                inner.slots.push(Slot {
                    item: None,
                    generation: 0,
                });
                (index, 0)
            }
        };

        let id = WorkId { index, generation };
        let mut item = WorkItem::new(id, kind, socket, descr);
        fill(&mut item);
        let item = Arc::new(Mutex::new(item));
        inner.slots[index as usize].item = Some(item.clone());
        item
    }
}

impl Default for WorkPool {
    fn default() -> Self {
        Self::new()
    }
}
