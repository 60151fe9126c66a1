// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Demo driver: an HTTP ping client and a small TCP echo server, both
//! running on the ring.

use log::*;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use netring::adapter::NetworkAdapter;
use netring::{Error, ReceiveAction, Ring, Socket, SocketKind, SocketType, SubmitHandle};

const ECHO_PORT: u16 = 8080;
const HTTP_PORT: u16 = 80;
const PING_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Parser)]
struct Cli {
    /// IPv4 address to send an HTTP GET request to (port 80).
    #[arg(long)]
    ping: Option<Ipv4Addr>,

    /// Run a TCP echo server on port 8080.
    #[arg(long)]
    server: bool,

    /// Network interface to use.
    #[arg(long, default_value = "eth0")]
    interface: String,

    /// Skip NIC tuning.
    #[arg(long)]
    no_tune: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Cli::parse();

    let mut adapter = NetworkAdapter::new(&args.interface, !args.no_tune);
    if let Err(e) = adapter.init() {
        warn!("network adapter init failed: {e}");
    }

    let result = if let Some(ping) = args.ping {
        do_http_ping(ping)
    } else if args.server {
        do_echo_server()
    } else {
        error!("missing --ping or --server");
        return ExitCode::from(1);
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}

/// Connects to `target`, sends a GET request, prints the reply and closes
/// the connection.
fn do_http_ping(target: Ipv4Addr) -> Result<(), Error> {
    let target = SocketAddr::new(IpAddr::V4(target), HTTP_PORT);
    info!("going to ping {target}");

    let mut ring = Ring::with_defaults()?;
    ring.init()?;

    let socket = Socket::bind(SocketType::Ipv4Tcp, 0, SocketKind::UnicastClient)?;
    let closed = Arc::new(AtomicBool::new(false));

    let done = closed.clone();
    let conn_socket = socket.clone();
    ring.submit_connect(&socket, target, move |handle, res| {
        if res.status != 0 {
            error!("connect to {} failed: status {}", res.peer, res.status);
            done.store(true, Ordering::Relaxed);
            return;
        }
        info!("connected to {}", res.peer);
        send_request(handle, conn_socket, done);
    })?;

    let deadline = Instant::now() + PING_TIMEOUT;
    while !closed.load(Ordering::Relaxed) {
        if Instant::now() > deadline {
            error!("ping timed out");
            return Err(Error::Io(std::io::ErrorKind::TimedOut.into()));
        }
        ring.poll_completion_queues()?;
    }
    Ok(())
}

fn send_request(handle: &mut SubmitHandle, socket: Arc<Socket>, done: Arc<AtomicBool>) {
    let mut send = handle.submit_send(&socket);
    send.append(b"GET /posts/1 HTTP/1.1\r\n");
    send.append(b"Host: example.com\r\n");
    send.append(b"Accept: application/json\r\n");
    send.append(b"\r\n");
    send.submit(move |handle, res| {
        println!("packet sent successfully: {}", res.status);
        await_reply(handle, socket, done);
    });
}

fn await_reply(handle: &mut SubmitHandle, socket: Arc<Socket>, done: Arc<AtomicBool>) {
    handle.submit_recv(&socket.clone(), move |handle, msg| {
        println!("received: {}", String::from_utf8_lossy(msg.data));
        let socket = socket.clone();
        let done = done.clone();
        handle.submit_close(&socket, move |_handle, res| {
            info!("connection closed: {}", res.status);
            done.store(true, Ordering::Relaxed);
        });
        ReceiveAction::None
    });
}

/// Accepts connections on port 8080 and echoes everything back.
fn do_echo_server() -> Result<(), Error> {
    info!("going to run an echo server on port {ECHO_PORT}");

    let mut ring = Ring::with_defaults()?;
    ring.init()?;

    let listener = Socket::bind(SocketType::Ipv4Tcp, ECHO_PORT, SocketKind::ServerStream)?;

    ring.submit_accept(&listener, |handle, res| {
        info!("accepted connection from {}", res.peer);
        let socket = Socket::from_accept(&res);

        let peer = res.peer;
        handle.submit_recv(&socket.clone(), move |handle, msg| {
            if msg.is_err() {
                warn!("receive from {peer} failed: {}", msg.status);
                return ReceiveAction::None;
            }
            if msg.is_empty() {
                info!("{peer} disconnected");
                return ReceiveAction::None;
            }
            debug!("echoing {} bytes to {peer}", msg.len());
            let mut send = handle.submit_send(&socket);
            send.append(msg.data);
            send.submit(|_handle, res| {
                if res.status < 0 {
                    warn!("echo send failed: {}", res.status);
                }
            });
            ReceiveAction::Resubmit
        });
    })?;

    info!("waiting for new requests");
    loop {
        ring.poll_completion_queues()?;
    }
}
