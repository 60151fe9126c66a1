// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The ring driver.
//!
//! Owns the io_uring instance, the provided-buffer pool and the work pool.
//! Typed submissions become submission queue entries whose user-data is the
//! packed id of a work item; the completion loop looks the item back up and
//! routes the completion to the callback stored in it.
//!
//! The driver is single-threaded: exactly one thread calls
//! [`Ring::poll_completion_queues`] and the `Ring::submit_*` methods.
//! Callbacks run on that thread and stage follow-up submissions through the
//! [`SubmitHandle`] they receive; a helper thread may also clone the handle
//! and stage sends, which is the one cross-thread path the work pool's mutex
//! exists for. Staged work is turned into submission entries and handed to
//! the kernel by the owner thread, either inside a `submit_*` call or at the
//! top of the next poll.

use log::*;

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ptr;
use std::sync::{Arc, Mutex};

use io_uring::types::RecvMsgOut;
use io_uring::{cqueue, opcode, squeue, types, IoUring};

pub(crate) mod buffers;
mod pool;
mod probe;
mod work;

use buffers::{BufferPool, BUFFER_GROUP};
use work::{Callback, SendPayload};

pub use pool::WorkPool;
pub use work::{
    AcceptCallback, AcceptResult, CloseCallback, CloseResult, ConnectCallback, ConnectResult,
    OpKind, ReceiveAction, ReceivedMessage, RecvCallback, SendCallback, SendResult, WorkId,
    WorkItem,
};

use crate::socket::{Socket, SocketKind};
use crate::Error;

/// Submission queue depth used when the caller does not override it.
pub const DEFAULT_QUEUE_DEPTH: u32 = 64;

/// Number of provided buffers (half receive, half send scratch).
pub const DEFAULT_BUFFER_COUNT: u16 = 1024;

/// log2 of the provided buffer size (4 KiB).
pub const DEFAULT_BUFFER_SHIFT: u32 = 12;

/// Sizing knobs for a [`Ring`].
#[derive(Clone, Copy, Debug)]
pub struct RingConfig {
    pub queue_depth: u32,
    pub buffer_count: u16,
    pub buffer_shift: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            buffer_count: DEFAULT_BUFFER_COUNT,
            buffer_shift: DEFAULT_BUFFER_SHIFT,
        }
    }
}

/// Stages typed submissions onto the driver's pending queue.
///
/// Every callback receives one of these, so completion handlers can submit
/// follow-up operations without holding a reference to the [`Ring`] itself.
/// The handle is cheap to clone and may cross threads; anything staged from
/// another thread is picked up by the owner thread's next poll.
#[derive(Clone)]
pub struct SubmitHandle {
    pool: Arc<WorkPool>,
    pending: Arc<Mutex<VecDeque<WorkId>>>,
    buffers: BufferPool,
}

impl SubmitHandle {
    /// Arms an accept on a listening stream socket. The handler fires for
    /// every accepted connection; the operation re-arms itself until it
    /// fails.
    pub fn submit_accept(
        &mut self,
        socket: &Arc<Socket>,
        handler: impl FnMut(&mut SubmitHandle, AcceptResult) + Send + 'static,
    ) {
        assert_eq!(
            socket.kind(),
            SocketKind::ServerStream,
            "accept requires a server stream socket"
        );
        let item = self
            .pool
            .alloc_accept(socket.clone(), Box::new(handler), "accept-job");
        self.stage(item.lock().unwrap().id());
    }

    /// Submits a connect to `target`. One-shot: the handler fires exactly
    /// once, with a negative status on failure.
    pub fn submit_connect(
        &mut self,
        socket: &Arc<Socket>,
        target: SocketAddr,
        handler: impl FnOnce(&mut SubmitHandle, ConnectResult) + Send + 'static,
    ) {
        self.connect_inner(socket, target, false, Box::new(handler));
    }

    /// Like [`SubmitHandle::submit_connect`], but marks the connect entry
    /// IO_LINK so the kernel refuses to start the next staged submission
    /// (typically a send on the same socket) unless the connect succeeded.
    /// The rejected follower completes with -ECANCELED.
    pub fn submit_connect_linked(
        &mut self,
        socket: &Arc<Socket>,
        target: SocketAddr,
        handler: impl FnOnce(&mut SubmitHandle, ConnectResult) + Send + 'static,
    ) {
        self.connect_inner(socket, target, true, Box::new(handler));
    }

    /// Arms a receive. Stream sockets get a plain provided-buffer recv that
    /// re-arms while the handler keeps returning
    /// [`ReceiveAction::Resubmit`]; datagram sockets get a kernel multishot
    /// recvmsg.
    pub fn submit_recv(
        &mut self,
        socket: &Arc<Socket>,
        handler: impl FnMut(&mut SubmitHandle, ReceivedMessage<'_>) -> ReceiveAction + Send + 'static,
    ) {
        let item = self
            .pool
            .alloc_recv(socket.clone(), Box::new(handler), "read-from-socket");
        self.stage(item.lock().unwrap().id());
    }

    /// Allocates a send work item. The caller fills the packet through the
    /// returned [`SendRequest`] and then submits it.
    pub fn submit_send(&mut self, socket: &Arc<Socket>) -> SendRequest {
        let item = self.pool.alloc_send(socket.clone(), "write-to-socket");
        SendRequest {
            item,
            handle: self.clone(),
        }
    }

    /// Asks the kernel to close the socket's descriptor. One-shot.
    pub fn submit_close(
        &mut self,
        socket: &Arc<Socket>,
        handler: impl FnOnce(&mut SubmitHandle, CloseResult) + Send + 'static,
    ) {
        let item = self
            .pool
            .alloc_close(socket.clone(), Box::new(handler), "close-of-socket");
        self.stage(item.lock().unwrap().id());
    }

    /// The work pool backing this driver.
    pub fn pool(&self) -> &Arc<WorkPool> {
        &self.pool
    }

    fn connect_inner(
        &mut self,
        socket: &Arc<Socket>,
        target: SocketAddr,
        link_next: bool,
        handler: ConnectCallback,
    ) {
        debug!("connecting socket {} to {target}", socket.fd());
        let item = self
            .pool
            .alloc_connect(&target, socket.clone(), handler, link_next, "connect-job");
        self.stage(item.lock().unwrap().id());
    }

    fn stage(&self, id: WorkId) {
        self.pending.lock().unwrap().push_back(id);
    }
}

/// A send in the making: allocated, but not yet handed to the kernel.
///
/// Fill the outgoing packet with [`SendRequest::append`] (and, for an
/// unconnected datagram socket, [`SendRequest::set_destination`]), then call
/// [`SendRequest::submit`]. The payload lands in a scratch buffer reserved
/// from the upper half of the buffer pool when one is free, falling back to
/// the heap otherwise.
pub struct SendRequest {
    item: Arc<Mutex<WorkItem>>,
    handle: SubmitHandle,
}

impl SendRequest {
    pub fn id(&self) -> WorkId {
        self.item.lock().unwrap().id()
    }

    /// Appends bytes to the outgoing packet.
    pub fn append(&mut self, bytes: &[u8]) {
        let mut item = self.item.lock().unwrap();

        if let SendPayload::None = item.payload {
            item.payload = match self.handle.buffers.take_send_scratch() {
                Some(scratch) => {
                    trace!("staging send payload in scratch buffer {}", scratch.index());
                    SendPayload::Scratch(scratch)
                }
                None => {
                    debug!("send scratch exhausted, staging payload on the heap");
                    SendPayload::Heap(Vec::new())
                }
            };
        }

        let spill = match &mut item.payload {
            SendPayload::Scratch(scratch) => {
                if scratch.extend(bytes) {
                    None
                } else {
                    let mut v = scratch.as_slice().to_vec();
                    v.extend_from_slice(bytes);
                    Some(v)
                }
            }
            SendPayload::Heap(v) => {
                v.extend_from_slice(bytes);
                None
            }
            SendPayload::None => unreachable!(),
        };
        if let Some(v) = spill {
            debug!("payload outgrew its scratch buffer, spilling to the heap");
            item.payload = SendPayload::Heap(v);
        }
    }

    /// Sets the destination address for a datagram send. Without one, the
    /// send goes to wherever the socket is connected.
    pub fn set_destination(&mut self, target: SocketAddr) {
        self.item.lock().unwrap().set_target(&target);
    }

    /// Installs the completion handler and stages the submission. The entry
    /// is handed to the kernel by the owner thread's next flush or poll.
    pub fn submit(self, handler: impl FnOnce(&mut SubmitHandle, SendResult) + Send + 'static) {
        let id = {
            let mut item = self.item.lock().unwrap();
            item.callback = Callback::Send(Box::new(handler));
            item.id()
        };
        self.handle.stage(id);
    }
}

/// The ring driver. See the module docs for the threading contract.
pub struct Ring {
    // Field order matters for Drop: the ring (and with it the kernel's
    // registration of the buffer ring) must go away before the buffer
    // mapping can be unmapped.
    ring: IoUring,
    buffers: BufferPool,
    handle: SubmitHandle,
    initialized: bool,
    /// The last prepared entry carried IO_LINK; hold back the enter syscall
    /// until its follower has been prepared, so the chain stays in one
    /// submission batch.
    chain_open: bool,
    /// Entries pushed since the last enter syscall.
    unsubmitted: usize,
}

impl Ring {
    /// Creates the ring and maps the buffer pool. The minimal ring setup is
    /// used deliberately; see DESIGN.md for the reasoning.
    pub fn new(config: RingConfig) -> Result<Ring, Error> {
        let ring = IoUring::new(config.queue_depth).map_err(Error::Io)?;
        let buffers = BufferPool::new(config.buffer_count, config.buffer_shift)?;
        let handle = SubmitHandle {
            pool: Arc::new(WorkPool::new()),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            buffers: buffers.clone(),
        };
        Ok(Ring {
            ring,
            buffers,
            handle,
            initialized: false,
            chain_open: false,
            unsubmitted: 0,
        })
    }

    pub fn with_defaults() -> Result<Ring, Error> {
        Ring::new(RingConfig::default())
    }

    /// Probes kernel support for the required opcodes and registers the
    /// provided-buffer ring. Must be called once before any submission.
    pub fn init(&mut self) -> Result<(), Error> {
        probe::verify_required_opcodes(&self.ring.submitter())?;
        self.buffers.register(&self.ring.submitter())?;
        debug!(
            "registered {} provided buffers of {} bytes",
            self.buffers.entry_count(),
            self.buffers.buffer_size()
        );
        self.initialized = true;
        Ok(())
    }

    /// A clonable handle for staging submissions, e.g. from a helper thread.
    pub fn handle(&self) -> SubmitHandle {
        self.handle.clone()
    }

    /// See [`SubmitHandle::submit_accept`].
    pub fn submit_accept(
        &mut self,
        socket: &Arc<Socket>,
        handler: impl FnMut(&mut SubmitHandle, AcceptResult) + Send + 'static,
    ) -> Result<(), Error> {
        assert!(self.initialized, "ring driver not initialized");
        self.handle.submit_accept(socket, handler);
        self.flush_staged()
    }

    /// See [`SubmitHandle::submit_connect`].
    pub fn submit_connect(
        &mut self,
        socket: &Arc<Socket>,
        target: SocketAddr,
        handler: impl FnOnce(&mut SubmitHandle, ConnectResult) + Send + 'static,
    ) -> Result<(), Error> {
        assert!(self.initialized, "ring driver not initialized");
        self.handle.submit_connect(socket, target, handler);
        self.flush_staged()
    }

    /// See [`SubmitHandle::submit_connect_linked`].
    pub fn submit_connect_linked(
        &mut self,
        socket: &Arc<Socket>,
        target: SocketAddr,
        handler: impl FnOnce(&mut SubmitHandle, ConnectResult) + Send + 'static,
    ) -> Result<(), Error> {
        assert!(self.initialized, "ring driver not initialized");
        self.handle.submit_connect_linked(socket, target, handler);
        self.flush_staged()
    }

    /// See [`SubmitHandle::submit_recv`].
    pub fn submit_recv(
        &mut self,
        socket: &Arc<Socket>,
        handler: impl FnMut(&mut SubmitHandle, ReceivedMessage<'_>) -> ReceiveAction + Send + 'static,
    ) -> Result<(), Error> {
        assert!(self.initialized, "ring driver not initialized");
        self.handle.submit_recv(socket, handler);
        self.flush_staged()
    }

    /// See [`SubmitHandle::submit_send`]. The returned request is staged by
    /// its own `submit` call and flushed on the next poll or [`Ring::flush`].
    pub fn submit_send(&mut self, socket: &Arc<Socket>) -> SendRequest {
        assert!(self.initialized, "ring driver not initialized");
        self.handle.submit_send(socket)
    }

    /// See [`SubmitHandle::submit_close`].
    pub fn submit_close(
        &mut self,
        socket: &Arc<Socket>,
        handler: impl FnOnce(&mut SubmitHandle, CloseResult) + Send + 'static,
    ) -> Result<(), Error> {
        assert!(self.initialized, "ring driver not initialized");
        self.handle.submit_close(socket, handler);
        self.flush_staged()
    }

    /// Turns staged submissions into entries and issues the enter syscall.
    pub fn flush(&mut self) -> Result<(), Error> {
        assert!(self.initialized, "ring driver not initialized");
        self.flush_staged()
    }

    /// Drains at most one completion and dispatches it. Never blocks; call
    /// it in a loop.
    ///
    /// Optimizing for latency, not bandwidth: one completion per call keeps
    /// the time between kernel delivery and callback bounded.
    pub fn poll_completion_queues(&mut self) -> Result<(), Error> {
        assert!(self.initialized, "ring driver not initialized");
        self.flush_staged()?;

        let cqe = {
            let mut cq = self.ring.completion();
            cq.sync();
            cq.next()
        };
        let Some(cqe) = cqe else {
            return Ok(());
        };

        self.handle_completion(&cqe);
        self.flush_staged()
    }

    fn flush_staged(&mut self) -> Result<(), Error> {
        loop {
            let id = self.handle.pending.lock().unwrap().pop_front();
            let Some(id) = id else { break };
            let Some(item) = self.handle.pool.lookup(id) else {
                warn!("staged work item {id} vanished before submission");
                continue;
            };
            let entry = {
                let mut item = item.lock().unwrap();
                let entry = build_entry(&mut item, &self.buffers);
                self.chain_open = item.link_next;
                entry
            };
            self.push_entry(&entry)?;
        }

        if self.unsubmitted > 0 && !self.chain_open {
            self.enter()?;
        }
        Ok(())
    }

    /// Pushes one entry, flushing the queue once if it is full. A second
    /// failure is fatal: the caller over-submitted or starved the
    /// completion loop.
    fn push_entry(&mut self, entry: &squeue::Entry) -> Result<(), Error> {
        // SAFETY: every pointer in the entry refers into the entry's work
        // item (pinned in its Arc and kept alive by the pool until the
        // terminal completion) or into the registered buffer pool.
        let pushed = unsafe { self.ring.submission().push(entry).is_ok() };
        if !pushed {
            warn!("no submission entry available, flushing the queue");
            self.enter()?;
            let mut sq = self.ring.submission();
            sq.sync();
            // SAFETY: as above.
            if unsafe { sq.push(entry).is_err() } {
                error!("no submission entry available even after a flush");
                return Err(Error::SubmissionQueueFull);
            }
        }
        self.unsubmitted += 1;
        Ok(())
    }

    fn enter(&mut self) -> Result<(), Error> {
        match self.ring.submit() {
            Ok(n) => {
                if n > 0 {
                    trace!("{n} submissions handed to the kernel");
                }
                self.unsubmitted = 0;
                Ok(())
            }
            // The kernel wants the completion queue drained first; the
            // entries stay queued and go in with a later enter.
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => {
                error!("failed to submit to the ring: {e}");
                Err(Error::Io(e))
            }
        }
    }

    fn handle_completion(&mut self, cqe: &cqueue::Entry) {
        let id = WorkId::from_user_data(cqe.user_data());
        let status = cqe.result();
        let flags = cqe.flags();

        let Some(item) = self.handle.pool.lookup(id) else {
            error!("no work item {id} exists anymore (status {status}, flags {flags:#x})");
            return;
        };
        let mut item = item.lock().unwrap();

        if cqueue::more(flags) {
            trace!("more completion events to follow ({})", item.descr());
        }

        match item.kind() {
            OpKind::Accept => self.on_accept(&mut item, status),
            OpKind::Close => self.on_close(&mut item, status),
            OpKind::Connect => self.on_connect(&mut item, status),
            OpKind::Recv => self.on_recv(&mut item, status, flags),
            OpKind::Send => self.on_send(&mut item, status),
        }
    }

    fn on_accept(&mut self, item: &mut WorkItem, status: i32) {
        if status < 0 {
            log_completion_error("accept", status, item.descr());
            self.handle.pool.free(item.id());
            return;
        }

        let peer = item.scratch_addr().unwrap_or_else(|| {
            warn!("accept completion without a usable peer address");
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        });
        debug!("accepted fd {status} from {peer}");
        item.invoke_accept(&mut self.handle, AcceptResult { fd: status, peer });

        // Accept is multishot by resubmission: the same item goes straight
        // back in.
        self.handle.stage(item.id());
    }

    fn on_connect(&mut self, item: &mut WorkItem, status: i32) {
        if status < 0 {
            log_completion_error("connect", status, item.descr());
        }
        let peer = item.scratch_addr().unwrap_or_else(|| {
            warn!("connect item lost its target address");
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        });
        item.invoke_connect(&mut self.handle, ConnectResult { status, peer });
        self.handle.pool.free(item.id());
    }

    fn on_close(&mut self, item: &mut WorkItem, status: i32) {
        if status < 0 {
            log_completion_error("close", status, item.descr());
        }
        // close(2) releases the descriptor even when it reports an error, so
        // the flag must be set on failure too: a second close from drop
        // could hit a reused descriptor.
        item.socket().mark_closed();
        item.invoke_close(&mut self.handle, CloseResult { status });
        self.handle.pool.free(item.id());
    }

    fn on_send(&mut self, item: &mut WorkItem, status: i32) {
        if status < 0 {
            log_completion_error("send", status, item.descr());
        }
        item.invoke_send(&mut self.handle, SendResult { status });
        // Dropping the payload returns a scratch buffer to the free stack.
        item.payload = SendPayload::None;
        self.handle.pool.free(item.id());
    }

    fn on_recv(&mut self, item: &mut WorkItem, status: i32, flags: u32) {
        if status == -libc::ENOBUFS {
            // No buffer was selected, so there is nothing to recycle, and
            // the operation is not re-armed automatically.
            error!(
                "receive ran out of provided buffers -- status {status} ({})",
                item.descr()
            );
            return;
        }
        if status < 0 {
            log_completion_error("recv", status, item.descr());
            // Surface the failure so the caller sees the operation end; the
            // item is terminal either way, so the returned action is moot.
            let _ = item.invoke_recv(
                &mut self.handle,
                ReceivedMessage {
                    data: &[],
                    source: None,
                    status,
                },
            );
            self.handle.pool.free(item.id());
            return;
        }

        if item.is_stream() {
            self.on_recv_stream(item, status, flags);
        } else {
            self.on_recv_datagram(item, status, flags);
        }
    }

    fn on_recv_stream(&mut self, item: &mut WorkItem, status: i32, flags: u32) {
        let selected = cqueue::buffer_select(flags);

        if status == 0 {
            // Peer closed the connection. Deliver the empty read so the
            // caller sees the end of stream, then retire the item.
            let _ = item.invoke_recv(
                &mut self.handle,
                ReceivedMessage {
                    data: &[],
                    source: None,
                    status: 0,
                },
            );
            if let Some(index) = selected {
                self.buffers.recycle(index);
            }
            self.handle.pool.free(item.id());
            return;
        }

        let Some(index) = selected else {
            // A successful provided-buffer receive must carry a buffer.
            error!(
                "recv completion without a selected buffer ({})",
                item.descr()
            );
            self.handle.pool.free(item.id());
            return;
        };

        let count = status as usize;
        trace!("received {count} stream bytes in buffer {index}");
        // SAFETY: the kernel handed buffer `index` to this completion; it is
        // not recycled (and thus not rewritten) until after the callback.
        let data = unsafe { std::slice::from_raw_parts(self.buffers.buffer_ptr(index), count) };
        let action = item.invoke_recv(
            &mut self.handle,
            ReceivedMessage {
                data,
                source: None,
                status,
            },
        );
        self.buffers.recycle(index);

        match action {
            ReceiveAction::Resubmit => self.handle.stage(item.id()),
            ReceiveAction::None => self.handle.pool.free(item.id()),
        }
    }

    fn on_recv_datagram(&mut self, item: &mut WorkItem, status: i32, flags: u32) {
        let more = cqueue::more(flags);

        let Some(index) = cqueue::buffer_select(flags) else {
            error!(
                "datagram completion without a selected buffer ({})",
                item.descr()
            );
            if !more {
                self.handle.stage(item.id());
            }
            return;
        };

        // SAFETY: as in on_recv_stream.
        let raw =
            unsafe { std::slice::from_raw_parts(self.buffers.buffer_ptr(index), status as usize) };

        let action = match RecvMsgOut::parse(raw, &item.scratch.msghdr) {
            Err(()) => {
                error!("bad recvmsg completion: no parsable header ({})", item.descr());
                ReceiveAction::Resubmit
            }
            Ok(out) if out.is_name_data_truncated() => {
                error!("recvmsg source address truncated ({})", item.descr());
                ReceiveAction::Resubmit
            }
            Ok(out) if out.is_payload_truncated() => {
                error!(
                    "truncated datagram: kept {} bytes ({})",
                    out.payload_data().len(),
                    item.descr()
                );
                ReceiveAction::Resubmit
            }
            Ok(out) => {
                let source = crate::socket::sockaddr_bytes_to_addr(out.name_data());
                let payload = out.payload_data();
                trace!(
                    "received {} datagram bytes from {source:?} in buffer {index}",
                    payload.len()
                );
                item.invoke_recv(
                    &mut self.handle,
                    ReceivedMessage {
                        data: payload,
                        source,
                        status: payload.len() as i32,
                    },
                )
            }
        };
        self.buffers.recycle(index);

        // While MORE is set the kernel's multishot is still armed and the
        // action only matters for the final completion of the stream.
        if !more {
            match action {
                ReceiveAction::Resubmit => self.handle.stage(item.id()),
                ReceiveAction::None => self.handle.pool.free(item.id()),
            }
        }
    }
}

/// Fills a submission entry for the item's operation kind. The entry's
/// user-data is the item's packed id.
fn build_entry(item: &mut WorkItem, buffers: &BufferPool) -> squeue::Entry {
    let fd = types::Fd(item.socket().fd());

    let entry = match item.kind() {
        OpKind::Close => opcode::Close::new(fd).build(),

        OpKind::Accept => {
            debug!("accept armed on socket {}", item.socket().fd());
            item.scratch.socklen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            opcode::Accept::new(
                fd,
                &mut item.scratch.sockaddr as *mut _ as *mut libc::sockaddr,
                &mut item.scratch.socklen,
            )
            .build()
        }

        OpKind::Connect => {
            assert!(item.scratch.socklen > 0, "connect without a target");
            let entry = opcode::Connect::new(
                fd,
                &item.scratch.sockaddr as *const _ as *const libc::sockaddr,
                item.scratch.socklen,
            )
            .build();
            if item.link_next {
                entry.flags(squeue::Flags::IO_LINK)
            } else {
                entry
            }
        }

        OpKind::Recv if item.is_stream() => {
            // Null buffer: the kernel selects one from group 0.
            opcode::Recv::new(fd, ptr::null_mut(), buffers.buffer_size() as u32)
                .buf_group(BUFFER_GROUP)
                .build()
                .flags(squeue::Flags::BUFFER_SELECT)
        }

        OpKind::Recv => {
            // Multishot recvmsg writes header, source address and payload
            // into the selected buffer; the msghdr describes the field
            // widths of that layout.
            let scratch = &mut item.scratch;
            // SAFETY: msghdr is plain C data, valid when zeroed.
            scratch.msghdr = unsafe { mem::zeroed() };
            scratch.msghdr.msg_name = &mut scratch.sockaddr as *mut _ as *mut libc::c_void;
            scratch.msghdr.msg_namelen =
                mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            scratch.iovec.iov_base = ptr::null_mut(); // selected from group 0
            scratch.iovec.iov_len = buffers.buffer_size();
            scratch.msghdr.msg_iov = &mut scratch.iovec;
            scratch.msghdr.msg_iovlen = 1;

            opcode::RecvMsgMulti::new(fd, &scratch.msghdr, BUFFER_GROUP)
                .flags(libc::MSG_TRUNC as u32)
                .build()
        }

        OpKind::Send if item.is_stream() => {
            let (payload, len) = payload_parts(item);
            debug!("sending {len} bytes on socket {}", item.socket().fd());
            let entry = opcode::Send::new(fd, payload, len as u32).build();
            if item.link_next {
                entry.flags(squeue::Flags::IO_LINK)
            } else {
                entry
            }
        }

        OpKind::Send => {
            let (payload, len) = payload_parts(item);
            debug!("sending {len} datagram bytes on socket {}", item.socket().fd());
            let scratch = &mut item.scratch;
            scratch.iovec.iov_base = payload as *mut libc::c_void;
            scratch.iovec.iov_len = len;
            // SAFETY: msghdr is plain C data, valid when zeroed.
            scratch.msghdr = unsafe { mem::zeroed() };
            if scratch.socklen > 0 {
                scratch.msghdr.msg_name = &mut scratch.sockaddr as *mut _ as *mut libc::c_void;
                scratch.msghdr.msg_namelen = scratch.socklen;
            }
            scratch.msghdr.msg_iov = &mut scratch.iovec;
            scratch.msghdr.msg_iovlen = 1;

            let entry = opcode::SendMsg::new(fd, &scratch.msghdr).build();
            if item.link_next {
                entry.flags(squeue::Flags::IO_LINK)
            } else {
                entry
            }
        }
    };

    entry.user_data(item.id().as_user_data())
}

fn payload_parts(item: &WorkItem) -> (*const u8, usize) {
    match &item.payload {
        SendPayload::Scratch(scratch) => (scratch.as_ptr(), scratch.len()),
        SendPayload::Heap(v) => (v.as_ptr(), v.len()),
        SendPayload::None => (ptr::null(), 0),
    }
}

fn log_completion_error(op: &str, status: i32, descr: &str) {
    let err = io::Error::from_raw_os_error(-status);
    error!("{op} completion failed: {err} ({descr})");
    if status == -libc::EFAULT || status == -libc::EINVAL {
        error!("NB: this requires a kernel version >= 6.0");
    }
}
