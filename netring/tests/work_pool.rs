// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use netring::ring::{OpKind, WorkPool};
use netring::{Socket, SocketKind, SocketType};

mod common;

fn test_socket() -> Arc<Socket> {
    common::init();
    Socket::bind(SocketType::Ipv4Udp, 0, SocketKind::UnicastClient).unwrap()
}

#[test]
fn accept_item_is_registered_until_freed() {
    let socket = test_socket();
    let pool = WorkPool::new();

    let item = pool.alloc_accept(socket.clone(), Box::new(|_, _| {}), "test-accept");
    let id = item.lock().unwrap().id();
    assert_eq!(item.lock().unwrap().kind(), OpKind::Accept);
    assert_eq!(item.lock().unwrap().kind().as_str(), "accept");
    assert!(Arc::ptr_eq(item.lock().unwrap().socket(), &socket));

    // The item is registered:
    assert!(Arc::ptr_eq(&pool.lookup(id).unwrap(), &item));

    // After freeing it, lookup misses:
    pool.free(id);
    assert!(pool.lookup(id).is_none());
}

#[test]
#[should_panic(expected = "already freed")]
fn double_free_panics() {
    let socket = test_socket();
    let pool = WorkPool::new();

    let item = pool.alloc_close(socket, Box::new(|_, _| {}), "test-close");
    let id = item.lock().unwrap().id();
    pool.free(id);
    pool.free(id);
}

#[test]
fn freed_index_is_reused_with_a_new_generation() {
    let socket = test_socket();
    let pool = WorkPool::new();

    let first = pool.alloc_send(socket.clone(), "test-send");
    let first_id = first.lock().unwrap().id();
    pool.free(first_id);

    let second = pool.alloc_send(socket, "test-send");
    let second_id = second.lock().unwrap().id();

    // The index comes back from the free stack, but under a different
    // generation, so the stale id keeps missing.
    assert_eq!(second_id.index, first_id.index);
    assert_ne!(second_id.generation, first_id.generation);
    assert_ne!(second_id.as_user_data(), first_id.as_user_data());
    assert!(pool.lookup(first_id).is_none());
    assert!(Arc::ptr_eq(&pool.lookup(second_id).unwrap(), &second));
}

#[test]
fn ids_are_unique_among_in_use_items() {
    let socket = test_socket();
    let pool = WorkPool::new();

    let items: Vec<_> = (0..64)
        .map(|_| pool.alloc_send(socket.clone(), "test-send"))
        .collect();

    let mut seen = HashSet::new();
    for item in &items {
        assert!(seen.insert(item.lock().unwrap().id().as_user_data()));
    }
    assert_eq!(pool.in_use(), 64);

    for item in &items {
        pool.free(item.lock().unwrap().id());
    }
    assert_eq!(pool.in_use(), 0);
}

#[test]
fn concurrent_allocation_yields_unique_ids() {
    let socket = test_socket();
    let pool = Arc::new(WorkPool::new());

    let mut workers = Vec::new();
    for _ in 0..2 {
        let pool = pool.clone();
        let socket = socket.clone();
        workers.push(thread::spawn(move || {
            let mut ids = Vec::new();
            for _ in 0..1000 {
                let item = pool.alloc_send(socket.clone(), "test-send");
                ids.push(item.lock().unwrap().id());
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    for worker in workers {
        for id in worker.join().unwrap() {
            assert!(seen.insert(id.as_user_data()), "duplicate id handed out");
            assert!(pool.lookup(id).is_some());
        }
    }
    assert_eq!(pool.in_use(), 2000);
}
