// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Work items: the per-operation bookkeeping the driver keeps while an
//! operation is in flight at the kernel.
//!
//! The packed [`WorkId`] of an item is the user-data value carried through
//! the kernel, so a completion can always be routed back to the item that
//! submitted it. The generation half of the id protects against an index
//! being recycled while a late completion for its previous occupant is still
//! in the completion queue: such a completion misses on lookup and is logged
//! instead of being routed to the wrong callback.

use log::*;

use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::ring::buffers::SendScratch;
use crate::ring::SubmitHandle;
use crate::socket::Socket;

/// Identifies one in-flight operation: a dense table index plus the
/// generation of the table slot at allocation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkId {
    pub index: u32,
    pub generation: u32,
}

impl WorkId {
    /// Packs the id into the 64-bit user-data of a submission entry.
    pub fn as_user_data(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Recovers an id from the user-data of a completion entry.
    pub fn from_user_data(data: u64) -> WorkId {
        WorkId {
            index: data as u32,
            generation: (data >> 32) as u32,
        }
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// The kind of kernel operation a work item tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Accept,
    Connect,
    Recv,
    Send,
    Close,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Accept => "accept",
            OpKind::Connect => "connect",
            OpKind::Recv => "recv",
            OpKind::Send => "send",
            OpKind::Close => "close",
        }
    }
}

/// Delivered to the accept callback for every accepted connection.
#[derive(Clone, Copy, Debug)]
pub struct AcceptResult {
    /// The freshly accepted descriptor.
    pub fd: RawFd,
    /// The peer that connected.
    pub peer: SocketAddr,
}

/// Delivered to the connect callback exactly once.
#[derive(Clone, Copy, Debug)]
pub struct ConnectResult {
    /// 0 on success, the negated errno on failure.
    pub status: i32,
    /// The address the connect was aimed at.
    pub peer: SocketAddr,
}

/// Delivered to the send callback exactly once.
#[derive(Clone, Copy, Debug)]
pub struct SendResult {
    /// The number of bytes sent, or the negated errno on failure.
    pub status: i32,
}

/// Delivered to the close callback exactly once.
#[derive(Clone, Copy, Debug)]
pub struct CloseResult {
    /// 0 on success, the negated errno on failure.
    pub status: i32,
}

/// A view of one received payload.
///
/// The data borrows the kernel-provided buffer; it is only valid for the
/// duration of the callback, after which the buffer goes back to the kernel.
#[derive(Debug)]
pub struct ReceivedMessage<'a> {
    /// The received bytes.
    pub data: &'a [u8],
    /// The datagram sender. Stream receives carry no source address.
    pub source: Option<SocketAddr>,
    /// The number of received bytes (0 for a stream whose peer closed), or
    /// the negated errno of a failed receive. A failed receive is terminal:
    /// it is delivered with an empty payload and the operation is not
    /// re-armed.
    pub status: i32,
}

impl ReceivedMessage<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_err(&self) -> bool {
        self.status < 0
    }
}

/// Returned by a receive callback to decide whether the operation is armed
/// again with the same work item.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveAction {
    /// Do not receive again; the work item reaches its terminal state.
    None,
    /// Arm the receive again with the same work item and callback.
    Resubmit,
}

pub type AcceptCallback = Box<dyn FnMut(&mut SubmitHandle, AcceptResult) + Send>;
pub type ConnectCallback = Box<dyn FnOnce(&mut SubmitHandle, ConnectResult) + Send>;
pub type RecvCallback =
    Box<dyn FnMut(&mut SubmitHandle, ReceivedMessage<'_>) -> ReceiveAction + Send>;
pub type SendCallback = Box<dyn FnOnce(&mut SubmitHandle, SendResult) + Send>;
pub type CloseCallback = Box<dyn FnOnce(&mut SubmitHandle, CloseResult) + Send>;

/// Exactly one of the five result-typed callbacks, tagged to match the
/// operation kind of the item that stores it.
pub(crate) enum Callback {
    Unset,
    Accept(AcceptCallback),
    Connect(ConnectCallback),
    Recv(RecvCallback),
    Send(SendCallback),
    Close(CloseCallback),
}

/// Scratch memory handed to the kernel inside submission entries. The
/// pointers written into the msghdr refer back into this struct, which is
/// safe because the work item lives pinned inside its `Arc` allocation until
/// the pool frees it, and the pool only frees it after the operation's
/// terminal completion.
pub(crate) struct Scratch {
    pub sockaddr: libc::sockaddr_storage,
    pub socklen: libc::socklen_t,
    pub msghdr: libc::msghdr,
    pub iovec: libc::iovec,
}

impl Scratch {
    fn new() -> Scratch {
        // SAFETY: all four structs are plain C data, valid when zeroed.
        unsafe {
            Scratch {
                sockaddr: mem::zeroed(),
                socklen: 0,
                msghdr: mem::zeroed(),
                iovec: mem::zeroed(),
            }
        }
    }
}

/// The staged outgoing bytes of a send item.
pub(crate) enum SendPayload {
    None,
    /// A reserved buffer from the upper half of the buffer pool.
    Scratch(SendScratch),
    /// Heap fallback, used when the scratch stack is exhausted or the
    /// payload outgrows one pool buffer.
    Heap(Vec<u8>),
}

/// One in-flight kernel operation.
pub struct WorkItem {
    pub(crate) id: WorkId,
    pub(crate) kind: OpKind,
    pub(crate) socket: Arc<Socket>,
    pub(crate) callback: Callback,
    pub(crate) scratch: Scratch,
    pub(crate) payload: SendPayload,
    /// When set, the submission entry built next for this item carries
    /// IO_LINK, so the kernel will not start the following entry unless this
    /// one succeeds.
    pub(crate) link_next: bool,
    pub(crate) descr: &'static str,
}

// SAFETY: the raw pointers inside `scratch` only ever point into this item
// itself or into the registered buffer pool, both of which outlive the
// kernel's use of them; the item is shared across threads only behind a
// mutex.
unsafe impl Send for WorkItem {}

impl WorkItem {
    pub(crate) fn new(
        id: WorkId,
        kind: OpKind,
        socket: Arc<Socket>,
        descr: &'static str,
    ) -> WorkItem {
        WorkItem {
            id,
            kind,
            socket,
            callback: Callback::Unset,
            scratch: Scratch::new(),
            payload: SendPayload::None,
            link_next: false,
            descr,
        }
    }

    pub fn id(&self) -> WorkId {
        self.id
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn descr(&self) -> &'static str {
        self.descr
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    pub(crate) fn is_stream(&self) -> bool {
        self.socket.is_stream()
    }

    /// Copies `target` into the scratch sockaddr for a connect submission.
    pub(crate) fn set_target(&mut self, target: &SocketAddr) {
        self.scratch.socklen = crate::socket::addr_to_sockaddr(target, &mut self.scratch.sockaddr);
    }

    /// The address stored by [`WorkItem::set_target`], or the peer written
    /// by the kernel into the accept scratch.
    pub(crate) fn scratch_addr(&self) -> Option<SocketAddr> {
        crate::socket::sockaddr_to_addr(&self.scratch.sockaddr, self.scratch.socklen as usize)
    }

    pub(crate) fn invoke_accept(&mut self, handle: &mut SubmitHandle, result: AcceptResult) {
        match &mut self.callback {
            Callback::Accept(cb) => cb(handle, result),
            _ => error!("work item {} has no accept callback", self.id),
        }
    }

    pub(crate) fn invoke_recv(
        &mut self,
        handle: &mut SubmitHandle,
        message: ReceivedMessage<'_>,
    ) -> ReceiveAction {
        match &mut self.callback {
            Callback::Recv(cb) => cb(handle, message),
            _ => {
                error!("work item {} has no recv callback", self.id);
                ReceiveAction::None
            }
        }
    }

    pub(crate) fn invoke_connect(&mut self, handle: &mut SubmitHandle, result: ConnectResult) {
        match mem::replace(&mut self.callback, Callback::Unset) {
            Callback::Connect(cb) => cb(handle, result),
            _ => error!("work item {} has no connect callback", self.id),
        }
    }

    pub(crate) fn invoke_send(&mut self, handle: &mut SubmitHandle, result: SendResult) {
        match mem::replace(&mut self.callback, Callback::Unset) {
            Callback::Send(cb) => cb(handle, result),
            _ => error!("work item {} has no send callback", self.id),
        }
    }

    pub(crate) fn invoke_close(&mut self, handle: &mut SubmitHandle, result: CloseResult) {
        match mem::replace(&mut self.callback, Callback::Unset) {
            Callback::Close(cb) => cb(handle, result),
            _ => error!("work item {} has no close callback", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_round_trip() {
        let id = WorkId {
            index: 1234,
            generation: 77,
        };
        assert_eq!(WorkId::from_user_data(id.as_user_data()), id);
    }

    #[test]
    fn generations_do_not_collide() {
        let a = WorkId {
            index: 3,
            generation: 0,
        };
        let b = WorkId {
            index: 3,
            generation: 1,
        };
        assert_ne!(a.as_user_data(), b.as_user_data());
    }
}
