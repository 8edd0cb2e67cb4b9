// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end scenarios over a real loopback TCP socket (§8 of the spec),
//! exercising the server frontend's accept loop and the client's `dial`
//! together rather than any single module in isolation.

use std::time::Duration;

use mrpc_core::{
    client::dial,
    codec::CodecRegistry,
    error::RpcError,
    option::OptionRecord,
    registry::ServiceBuilder,
    server::frontend::Server,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SumArgs {
    num1: i64,
    num2: i64,
}

async fn spawn_foo_server() -> std::net::SocketAddr {
    let foo = ServiceBuilder::new("Foo")
        .method("Sum", |args: SumArgs, reply: &mut i64| async move {
            *reply = args.num1 + args.num2;
            Ok(())
        })
        .method("Slow", |_args: SumArgs, reply: &mut i64| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            *reply = 1;
            Ok(())
        })
        .build();

    let server = Server::new();
    server.register(foo).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let bound = addr;
    tokio::spawn(async move {
        server.serve(bound).await.unwrap();
    });
    // Give the accept loop a moment to bind before callers dial it.
    tokio::time::sleep(Duration::from_millis(20)).await;
    addr
}

fn default_opt() -> OptionRecord {
    OptionRecord::new(
        mrpc_core::codec::gob::CODEC_TYPE,
        Duration::from_secs(2),
        Duration::ZERO,
    )
}

#[tokio::test]
async fn addition_service_scenario() {
    let addr = spawn_foo_server().await;
    let registry = CodecRegistry::new();
    let client = dial(addr, &registry, default_opt()).await.unwrap();

    let reply: i64 = client
        .call("Foo.Sum", &SumArgs { num1: 3, num2: 4 })
        .await
        .unwrap();
    assert_eq!(reply, 7);

    let reply: i64 = client
        .call("Foo.Sum", &SumArgs { num1: 0, num2: 0 })
        .await
        .unwrap();
    assert_eq!(reply, 0);
}

#[tokio::test]
async fn concurrent_calls_each_see_their_own_result() {
    let addr = spawn_foo_server().await;
    let registry = CodecRegistry::new();
    let client = dial(addr, &registry, default_opt()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..100i64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let reply: i64 = client
                .call("Foo.Sum", &SumArgs {
                    num1: i,
                    num2: i * i,
                })
                .await
                .unwrap();
            (i, reply)
        }));
    }

    for handle in handles {
        let (i, reply) = handle.await.unwrap();
        assert_eq!(reply, i + i * i);
    }
}

#[tokio::test]
async fn routing_error_leaves_connection_usable() {
    let addr = spawn_foo_server().await;
    let registry = CodecRegistry::new();
    let client = dial(addr, &registry, default_opt()).await.unwrap();

    let err = client
        .call::<SumArgs, i64>("Foo.Nonexistent", &SumArgs::default())
        .await
        .unwrap_err();
    match err {
        RpcError::Handler(msg) => assert!(msg.contains("can't find method")),
        other => panic!("expected a routing error, got {other:?}"),
    }

    let reply: i64 = client
        .call("Foo.Sum", &SumArgs { num1: 1, num2: 1 })
        .await
        .unwrap();
    assert_eq!(reply, 2);
}

#[tokio::test]
async fn handler_timeout_does_not_block_a_concurrent_fast_call() {
    let addr = spawn_foo_server().await;
    let registry = CodecRegistry::new();
    let opt = OptionRecord::new(
        mrpc_core::codec::gob::CODEC_TYPE,
        Duration::from_secs(2),
        Duration::from_millis(50),
    );
    let client = dial(addr, &registry, opt).await.unwrap();

    let slow = client.clone();
    let slow_call = tokio::spawn(async move {
        slow.call::<SumArgs, i64>("Foo.Slow", &SumArgs::default())
            .await
    });

    let reply: i64 = client
        .call("Foo.Sum", &SumArgs { num1: 2, num2: 2 })
        .await
        .unwrap();
    assert_eq!(reply, 4);

    let slow_result = slow_call.await.unwrap();
    match slow_result {
        Err(RpcError::Handler(msg)) => assert!(msg.contains("timeout")),
        other => panic!("expected a timeout error, got {other:?}"),
    }
}

#[tokio::test]
async fn dial_times_out_against_an_unreachable_peer() {
    // TEST-NET-1 (RFC 5737): never routable, so the connect future either
    // hangs (packets silently dropped) or fails outright — either way
    // `dial`'s `connect_timeout` must bound the total wait.
    let addr: std::net::SocketAddr = "192.0.2.1:9".parse().unwrap();

    let registry = CodecRegistry::new();
    let opt = OptionRecord::new(
        mrpc_core::codec::gob::CODEC_TYPE,
        Duration::from_millis(100),
        Duration::ZERO,
    );

    let started = tokio::time::Instant::now();
    let result = dial(addr, &registry, opt).await;
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_millis(500));
}
