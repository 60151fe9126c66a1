// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! End-to-end scenarios over loopback. These need a kernel with io_uring
//! provided-buffer rings and multishot receive (>= 6.0).

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use netring::{ReceiveAction, Ring, Socket, SocketKind, SocketType};

mod common;

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn accept_and_echo() {
    common::init();
    let mut ring = Ring::with_defaults().unwrap();
    ring.init().unwrap();

    let listener = Socket::bind(SocketType::Ipv4Tcp, 0, SocketKind::ServerStream).unwrap();
    let addr = listener.local_addr().unwrap();

    let accepts = Arc::new(AtomicUsize::new(0));
    let accepts_seen = accepts.clone();
    ring.submit_accept(&listener, move |handle, res| {
        assert!(res.fd >= 0);
        assert!(res.peer.ip().is_loopback());
        accepts_seen.fetch_add(1, Ordering::Relaxed);

        let socket = Socket::from_accept(&res);
        handle.submit_recv(&socket.clone(), move |handle, msg| {
            if msg.is_err() || msg.is_empty() {
                // Error or connection closed by the peer.
                return ReceiveAction::None;
            }
            assert_eq!(msg.status as usize, msg.len());
            let mut send = handle.submit_send(&socket);
            send.append(msg.data);
            send.submit(|_, res| assert!(res.status > 0));
            ReceiveAction::Resubmit
        });
    })
    .unwrap();

    let client = thread::spawn(move || {
        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(TIMEOUT)).unwrap();

        for payload in [&b"hello\r\n"[..], &b"again\r\n"[..]] {
            client.write_all(payload).unwrap();
            let mut echoed = vec![0u8; payload.len()];
            client.read_exact(&mut echoed).unwrap();
            assert_eq!(echoed, payload);
        }
    });

    common::drive(&mut ring, TIMEOUT, || client.is_finished());
    client.join().unwrap();
    assert_eq!(accepts.load(Ordering::Relaxed), 1);

    // Both echoes were handled by the same re-armed receive: besides the
    // accept item, the pool holds exactly one receive item until the client
    // hangs up, after which the accept item is the only one left.
    let handle = ring.handle();
    common::drive(&mut ring, TIMEOUT, || handle.pool().in_use() == 1);
}

#[test]
fn connect_send_receive_close() {
    common::init();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        let mut request = vec![0u8; 512];
        let n = stream.read(&mut request).unwrap();
        assert!(request[..n].starts_with(b"GET /posts/1 HTTP/1.1\r\n"));
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .unwrap();
    });

    let mut ring = Ring::with_defaults().unwrap();
    ring.init().unwrap();

    let socket = Socket::bind(SocketType::Ipv4Tcp, 0, SocketKind::UnicastClient).unwrap();
    let closed = Arc::new(AtomicBool::new(false));
    let reply_head = Arc::new(Mutex::new(Vec::new()));

    let done = closed.clone();
    let reply = reply_head.clone();
    let conn_socket = socket.clone();
    ring.submit_connect(&socket, addr, move |handle, res| {
        assert_eq!(res.status, 0);
        assert_eq!(res.peer, addr);

        let socket = conn_socket;
        let mut send = handle.submit_send(&socket);
        send.append(b"GET /posts/1 HTTP/1.1\r\n");
        send.append(b"Host: example.com\r\n");
        send.append(b"Accept: application/json\r\n");
        send.append(b"\r\n");
        send.submit(move |handle, res| {
            assert!(res.status > 0, "send failed: {}", res.status);

            handle.submit_recv(&socket.clone(), move |handle, msg| {
                reply.lock().unwrap().extend_from_slice(msg.data);
                let done = done.clone();
                let socket = socket.clone();
                handle.submit_close(&socket, move |_, res| {
                    assert_eq!(res.status, 0);
                    done.store(true, Ordering::Relaxed);
                });
                ReceiveAction::None
            });
        });
    })
    .unwrap();

    common::drive(&mut ring, TIMEOUT, || closed.load(Ordering::Relaxed));
    server.join().unwrap();
    assert!(reply_head.lock().unwrap().starts_with(b"HTTP/1.1"));
}

#[test]
fn refused_connect_cancels_the_linked_send() {
    common::init();
    let mut ring = Ring::with_defaults().unwrap();
    ring.init().unwrap();

    let socket = Socket::bind(SocketType::Ipv4Tcp, 0, SocketKind::UnicastClient).unwrap();
    // Port 1 on loopback has no listener.
    let target: SocketAddr = "127.0.0.1:1".parse().unwrap();

    let connect_status = Arc::new(AtomicI32::new(i32::MIN));
    let send_status = Arc::new(AtomicI32::new(i32::MIN));

    let seen = connect_status.clone();
    ring.submit_connect_linked(&socket, target, move |_, res| {
        assert_eq!(res.peer, target);
        seen.store(res.status, Ordering::Relaxed);
    })
    .unwrap();

    let mut send = ring.submit_send(&socket);
    send.append(b"never sent");
    let seen = send_status.clone();
    send.submit(move |_, res| {
        seen.store(res.status, Ordering::Relaxed);
    });
    ring.flush().unwrap();

    common::drive(&mut ring, TIMEOUT, || {
        connect_status.load(Ordering::Relaxed) != i32::MIN
            && send_status.load(Ordering::Relaxed) != i32::MIN
    });

    assert_eq!(connect_status.load(Ordering::Relaxed), -libc::ECONNREFUSED);
    assert_eq!(send_status.load(Ordering::Relaxed), -libc::ECANCELED);
}

#[test]
fn multishot_datagram_receive_recycles_buffers() {
    common::init();
    let mut ring = Ring::with_defaults().unwrap();
    ring.init().unwrap();

    let receiver = Socket::bind(SocketType::Ipv4Udp, 0, SocketKind::MulticastPacket).unwrap();
    let port = receiver.local_addr().unwrap().port();

    let received = Arc::new(AtomicUsize::new(0));
    let source_ok = Arc::new(AtomicBool::new(true));

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let sender_addr = sender.local_addr().unwrap();

    let count = received.clone();
    let sources = source_ok.clone();
    ring.submit_recv(&receiver, move |_, msg| {
        if msg.len() != 100 || msg.status != 100 || msg.source != Some(sender_addr) {
            sources.store(false, Ordering::Relaxed);
        }
        count.fetch_add(1, Ordering::Relaxed);
        ReceiveAction::Resubmit
    })
    .unwrap();

    // Far more datagrams than the 512 published buffers: the run only
    // completes if every completion recycles its buffer.
    let total: usize = 1500;
    let payload = [0x42u8; 100];
    let mut sent: usize = 0;
    common::drive(&mut ring, Duration::from_secs(30), || {
        let seen = received.load(Ordering::Relaxed);
        while sent < total && sent - seen < 64 {
            sender.send_to(&payload, ("127.0.0.1", port)).unwrap();
            sent += 1;
        }
        seen == total
    });

    assert!(source_ok.load(Ordering::Relaxed), "bad payload or source");
}

#[test]
fn datagram_send_staged_from_a_helper_thread() {
    common::init();
    let mut ring = Ring::with_defaults().unwrap();
    ring.init().unwrap();

    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver.set_read_timeout(Some(TIMEOUT)).unwrap();
    let target = receiver.local_addr().unwrap();

    let socket = Socket::bind(SocketType::Ipv4Udp, 0, SocketKind::UnicastClient).unwrap();
    let sent_status = Arc::new(AtomicI32::new(i32::MIN));

    let mut handle = ring.handle();
    let seen = sent_status.clone();
    let stager = thread::spawn(move || {
        let mut send = handle.submit_send(&socket);
        send.append(b"from a helper thread");
        send.set_destination(target);
        send.submit(move |_, res| {
            seen.store(res.status, Ordering::Relaxed);
        });
    });
    stager.join().unwrap();

    common::drive(&mut ring, TIMEOUT, || {
        sent_status.load(Ordering::Relaxed) != i32::MIN
    });
    assert_eq!(sent_status.load(Ordering::Relaxed), 20);

    let mut buf = [0u8; 64];
    let (n, _) = receiver.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"from a helper thread");
}

#[test]
fn close_completes_with_status_zero() {
    common::init();
    let mut ring = Ring::with_defaults().unwrap();
    ring.init().unwrap();

    let socket = Socket::bind(SocketType::Ipv4Udp, 0, SocketKind::UnicastClient).unwrap();
    let status = Arc::new(AtomicI32::new(i32::MIN));

    let seen = status.clone();
    ring.submit_close(&socket, move |_, res| {
        seen.store(res.status, Ordering::Relaxed);
    })
    .unwrap();

    common::drive(&mut ring, TIMEOUT, || {
        status.load(Ordering::Relaxed) != i32::MIN
    });
    assert_eq!(status.load(Ordering::Relaxed), 0);
}
