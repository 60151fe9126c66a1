// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Socket construction and binding.
//!
//! Sockets created here are plain blocking sockets; the ring driver never
//! reads or writes them directly, it only hands their file descriptors to
//! the kernel inside submission entries. Every socket is reference counted
//! (`Arc<Socket>`): the ring's work items hold one reference for as long as
//! the kernel holds an operation on the descriptor, so the descriptor cannot
//! be reused out from under an in-flight operation.

use log::*;

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::socket::{setsockopt, sockopt, IpMembershipRequest};

use crate::ring::AcceptResult;
use crate::Error;

/// The address family and transport of a socket. Stream sockets are exactly
/// the TCP variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketType {
    Ipv4Udp,
    Ipv4Tcp,
    Ipv6Udp,
    Ipv6Tcp,
}

/// The role a socket plays, which decides how it is bound at creation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketKind {
    /// A datagram socket bound to a fixed port, optionally joined to a
    /// multicast group.
    MulticastPacket,

    /// A listening stream socket, or a stream accepted from one.
    ServerStream,

    /// An outgoing client socket.
    UnicastClient,
}

/// A reference-counted socket handle.
///
/// Dropping the last reference closes the descriptor, unless the kernel
/// already closed it through a CLOSE submission.
pub struct Socket {
    fd: RawFd,
    ty: SocketType,
    kind: SocketKind,
    port: u16,
    closed: AtomicBool,
    mreq: Mutex<Option<libc::ip_mreq>>,
}

impl Socket {
    /// Creates, configures and binds a fresh socket.
    ///
    /// SO_REUSEADDR is set before bind for every kind. A `ServerStream`
    /// socket is additionally put into the listening state with a backlog of
    /// 1024. Passing port 0 asks the kernel for an ephemeral port, which
    /// [`Socket::local_addr`] can recover.
    pub fn bind(ty: SocketType, port: u16, kind: SocketKind) -> Result<Arc<Socket>, Error> {
        let fd = create_fd(ty)?;
        let socket = Socket {
            fd,
            ty,
            kind,
            port,
            closed: AtomicBool::new(false),
            mreq: Mutex::new(None),
        };

        // Reuse-address must be set before bind, not after.
        setsockopt(&socket.borrowed(), sockopt::ReuseAddr, &true)?;

        match kind {
            SocketKind::UnicastClient => {
                socket.local_bind(0)?;
                setsockopt(&socket.borrowed(), sockopt::ReusePort, &true)?;
            }

            SocketKind::MulticastPacket => {
                socket.local_bind(port)?;
                setsockopt(&socket.borrowed(), sockopt::IpMulticastTtl, &1)?;
            }

            SocketKind::ServerStream => {
                socket.local_bind(port)?;
                let rc = unsafe { libc::listen(socket.fd, 1024) };
                if rc < 0 {
                    let e = io::Error::last_os_error();
                    error!("listen on port {port} failed: {e}");
                    return Err(Error::Io(e));
                }
            }
        }

        Ok(Arc::new(socket))
    }

    /// Wraps the descriptor produced by an accept completion.
    pub fn from_accept(res: &AcceptResult) -> Arc<Socket> {
        debug_assert!(res.fd >= 0);
        let ty = match res.peer {
            SocketAddr::V4(_) => SocketType::Ipv4Tcp,
            SocketAddr::V6(_) => SocketType::Ipv6Tcp,
        };
        Arc::new(Socket {
            fd: res.fd,
            ty,
            kind: SocketKind::ServerStream,
            port: res.peer.port(),
            closed: AtomicBool::new(false),
            mreq: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn socket_type(&self) -> SocketType {
        self.ty
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.ty, SocketType::Ipv4Tcp | SocketType::Ipv6Tcp)
    }

    /// The locally bound address, straight from getsockname(2). Useful after
    /// binding to port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        sockaddr_to_addr(&storage, len as usize)
            .ok_or_else(|| Error::Io(io::Error::from(io::ErrorKind::InvalidData)))
    }

    /// Joins `group` on the interface with address `interface`, and turns
    /// multicast loopback off. The membership is remembered so that
    /// [`Socket::leave_multicast_group`] can drop it again.
    pub fn join_multicast_group(
        &self,
        group: Ipv4Addr,
        interface: Ipv4Addr,
    ) -> Result<(), Error> {
        debug!("joining multicast group {group} on interface {interface}");

        let request = IpMembershipRequest::new(group, Some(interface));
        setsockopt(&self.borrowed(), sockopt::IpAddMembership, &request)?;
        setsockopt(&self.borrowed(), sockopt::IpMulticastLoop, &false)?;

        let mreq = libc::ip_mreq {
            imr_multiaddr: libc::in_addr {
                s_addr: u32::from_ne_bytes(group.octets()),
            },
            imr_interface: libc::in_addr {
                s_addr: u32::from_ne_bytes(interface.octets()),
            },
        };
        *self.mreq.lock().unwrap() = Some(mreq);
        Ok(())
    }

    /// Drops the membership recorded by the last join.
    pub fn leave_multicast_group(&self) -> Result<(), Error> {
        let Some(mreq) = self.mreq.lock().unwrap().take() else {
            return Ok(());
        };
        debug!("leaving multicast group");
        let group = Ipv4Addr::from(mreq.imr_multiaddr.s_addr.to_ne_bytes());
        let interface = Ipv4Addr::from(mreq.imr_interface.s_addr.to_ne_bytes());
        let request = IpMembershipRequest::new(group, Some(interface));
        setsockopt(&self.borrowed(), sockopt::IpDropMembership, &request)?;
        Ok(())
    }

    /// Selects the outgoing interface for multicast sends, using the
    /// interface recorded by the last join.
    pub fn bind_multicast_interface(&self) -> Result<(), Error> {
        let guard = self.mreq.lock().unwrap();
        let Some(mreq) = guard.as_ref() else {
            return Ok(());
        };
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::IPPROTO_IP,
                libc::IP_MULTICAST_IF,
                mreq as *const libc::ip_mreq as *const libc::c_void,
                mem::size_of::<libc::ip_mreq>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let e = io::Error::last_os_error();
            error!("IP_MULTICAST_IF failed: {e}");
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Called by the ring driver once a CLOSE completion has come back, so
    /// that drop does not close the descriptor a second time. close(2)
    /// releases the descriptor even when it reports an error, so this is
    /// set regardless of the completion status.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn borrowed(&self) -> BorrowedFd<'_> {
        // SAFETY: self.fd stays open for the lifetime of self (see Drop).
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }

    fn local_bind(&self, port: u16) -> Result<(), Error> {
        let any = match self.ty {
            SocketType::Ipv4Udp | SocketType::Ipv4Tcp => {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            }
            SocketType::Ipv6Udp | SocketType::Ipv6Tcp => {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            }
        };
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = addr_to_sockaddr(&SocketAddr::new(any, port), &mut storage);
        let rc = unsafe {
            libc::bind(self.fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if rc < 0 {
            let e = io::Error::last_os_error();
            error!("failed to bind to port {port}: {e}");
            return Err(Error::Io(e));
        }

        if let Ok(bound) = self.local_addr() {
            debug!("socket {} bound to {bound}", self.fd);
        }
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Relaxed) {
            // SAFETY: the descriptor is owned by this socket and has not been
            // closed through the ring.
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.fd)
            .field("type", &self.ty)
            .field("kind", &self.kind)
            .field("port", &self.port)
            .finish()
    }
}

fn create_fd(ty: SocketType) -> Result<RawFd, Error> {
    let (domain, sktype) = match ty {
        SocketType::Ipv4Udp => (libc::AF_INET, libc::SOCK_DGRAM),
        SocketType::Ipv4Tcp => (libc::AF_INET, libc::SOCK_STREAM),
        SocketType::Ipv6Udp => (libc::AF_INET6, libc::SOCK_DGRAM),
        SocketType::Ipv6Tcp => (libc::AF_INET6, libc::SOCK_STREAM),
    };
    let fd = unsafe { libc::socket(domain, sktype, 0) };
    if fd < 0 {
        let e = io::Error::last_os_error();
        error!("socket creation failed: {e}");
        return Err(Error::Io(e));
    }
    debug!("created socket {fd} ({ty:?})");
    Ok(fd)
}

/// Encodes `addr` into `storage` and returns the encoded length.
pub(crate) fn addr_to_sockaddr(
    addr: &SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sockaddr_storage is large enough for sockaddr_in.
            unsafe {
                (storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in).write(sin);
            }
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // SAFETY: sockaddr_storage is large enough for sockaddr_in6.
            unsafe {
                (storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6).write(sin6);
            }
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

/// Decodes a kernel-written sockaddr. Returns `None` when the length or the
/// address family does not describe an IPv4 or IPv6 address.
pub(crate) fn sockaddr_to_addr(
    storage: &libc::sockaddr_storage,
    len: usize,
) -> Option<SocketAddr> {
    sockaddr_bytes_to_addr(
        // SAFETY: reinterpreting the storage as raw bytes is always valid.
        unsafe {
            std::slice::from_raw_parts(
                storage as *const libc::sockaddr_storage as *const u8,
                len.min(mem::size_of::<libc::sockaddr_storage>()),
            )
        },
    )
}

/// Decodes a sockaddr from a raw byte view, as delivered in the name field
/// of a multishot recvmsg completion.
pub(crate) fn sockaddr_bytes_to_addr(bytes: &[u8]) -> Option<SocketAddr> {
    if bytes.len() >= mem::size_of::<libc::sockaddr_in>() {
        // SAFETY: length checked above; read_unaligned has no alignment
        // requirement on the source.
        let sin: libc::sockaddr_in =
            unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const _) };
        if sin.sin_family == libc::AF_INET as libc::sa_family_t {
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            return Some(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )));
        }
    }
    if bytes.len() >= mem::size_of::<libc::sockaddr_in6>() {
        // SAFETY: length checked above.
        let sin6: libc::sockaddr_in6 =
            unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const _) };
        if sin6.sin6_family == libc::AF_INET6 as libc::sa_family_t {
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            return Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "192.0.2.7:4242".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = addr_to_sockaddr(&addr, &mut storage);
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
        assert_eq!(sockaddr_to_addr(&storage, len as usize), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[2001:db8::17]:8080".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = addr_to_sockaddr(&addr, &mut storage);
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in6>());
        assert_eq!(sockaddr_to_addr(&storage, len as usize), Some(addr));
    }

    #[test]
    fn sockaddr_garbage_is_rejected() {
        assert_eq!(sockaddr_bytes_to_addr(&[0u8; 4]), None);
    }
}
