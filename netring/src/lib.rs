// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! An asynchronous network I/O core for Linux built on io_uring.
//!
//! The crate multiplexes TCP stream and UDP datagram sockets through a single
//! submission/completion ring. Callers submit typed operations (accept,
//! connect, receive, send, close) together with a callback; the completion
//! loop routes each completion back to the callback that submitted it.
//! Receive operations use kernel-selected provided buffers, so no per-socket
//! receive buffer has to be allocated up front.
//!
//! The driver is single-threaded and cooperative: one owner thread calls
//! [`ring::Ring::poll_completion_queues`] and issues submissions. Callbacks
//! run on that thread and stage follow-up work through the
//! [`ring::SubmitHandle`] they are handed.

pub mod adapter;
pub mod ring;
pub mod socket;

use std::fmt;
use std::io;

pub use ring::{
    AcceptResult, CloseResult, ConnectResult, ReceiveAction, ReceivedMessage, Ring, RingConfig,
    SendRequest, SendResult, SubmitHandle,
};
pub use socket::{Socket, SocketKind, SocketType};

/// The errors the ring driver can surface to its caller.
///
/// Per-operation failures do not show up here: those travel through the
/// `status` field of the result struct handed to the operation's callback,
/// carrying the negated errno the kernel reported.
#[derive(Debug)]
pub enum Error {
    /// The buffer pool's memory mapping could not be created.
    MmapFailed(io::Error),

    /// The running kernel rejected a required io_uring capability, for
    /// example the registration of the provided-buffer ring or one of the
    /// socket opcodes. Needs a kernel version >= 6.0.
    KernelUnsupported(io::Error),

    /// No submission entry could be obtained even after flushing the queue
    /// once. This means the caller over-submitted or the completion loop is
    /// starved; it is not recoverable by retrying.
    SubmissionQueueFull,

    /// Errors returned by I/O failures.
    Io(io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MmapFailed(e) => write!(f, "buffer pool mmap failed: {e}"),
            Self::KernelUnsupported(e) => {
                write!(f, "kernel does not support a required io_uring feature: {e}")
            }
            Self::SubmissionQueueFull => write!(f, "submission queue full after flush"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Self::Io(io::Error::from(e))
    }
}
