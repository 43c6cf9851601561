//! End-to-end scenarios (spec §8 S1–S6), run against the in-process
//! `MemoryChannel` with virtual time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether::channel::{pair, Channel, MemoryChannel, Reply};
use tether::client::pipelined::PipelinedClient;
use tether::client::serial::SerialClient;
use tether::server;
use tether::supervisor::{Config, Generator, Supervisor};
use tether::{Acquired, Error};

type Endpoint = MemoryChannel<Reply<String>, String>;

fn echo_generator(slot: Mutex<Option<Endpoint>>) -> Generator<Reply<String>, String> {
    Arc::new(move || {
        let ch = slot.lock().unwrap().take();
        Box::pin(async move {
            ch.map(|c| Box::new(c) as Box<dyn Channel<Reply<String>, String>>)
                .ok_or_else(|| "generator exhausted".into())
        })
    })
}

fn spawn_echo_server(server_end: MemoryChannel<String, Reply<String>>) {
    let handler: server::Handler<String, String> = Arc::new(|responder, req| {
        Box::pin(async move {
            responder.success(req);
        })
    });
    server::serial::spawn(Arc::new(server_end), handler);
}

#[tokio::test]
async fn s1_echo_serial() {
    let (client_end, server_end) = pair::<String, String>();
    spawn_echo_server(server_end);

    let generate = echo_generator(Mutex::new(Some(client_end)));
    let supervisor = Supervisor::spawn(generate, Config::new("s1"));
    let client = SerialClient::new(supervisor);

    assert_eq!(client.request("a".to_string()).await, Ok("a".to_string()));
    assert_eq!(client.request("b".to_string()).await, Ok("b".to_string()));
    assert_eq!(client.request("c".to_string()).await, Ok("c".to_string()));
}

#[tokio::test(start_paused = true)]
async fn s2_reconnect_after_repeated_generator_failure() {
    let (client_end, server_end) = pair::<String, String>();
    spawn_echo_server(server_end);

    let attempts = Arc::new(AtomicU32::new(0));
    let slot = Mutex::new(Some(client_end));
    let attempts_clone = Arc::clone(&attempts);
    let generate: Generator<Reply<String>, String> = Arc::new(move || {
        let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
        let taken = if n >= 3 { slot.lock().unwrap().take() } else { None };
        Box::pin(async move {
            taken
                .map(|c| Box::new(c) as Box<dyn Channel<Reply<String>, String>>)
                .ok_or_else(|| "not yet".into())
        })
    });

    let supervisor = Supervisor::spawn(generate, Config::new("s2"));
    let client = SerialClient::new(supervisor);

    let started = tokio::time::Instant::now();
    let result = client.request("x".to_string()).await;
    let elapsed = started.elapsed();

    assert_eq!(result, Ok("x".to_string()));
    // 500 + 1000 + 2000 = 3500ms of backoff before the 4th (successful) attempt.
    assert!(elapsed >= Duration::from_millis(3500));
    assert!(attempts.load(Ordering::SeqCst) >= 4);
}

#[tokio::test(start_paused = true)]
async fn s3_timeout_during_outage() {
    let generate: Generator<Reply<String>, String> =
        Arc::new(|| Box::pin(async move { Err("always fails".into()) }));
    let supervisor = Supervisor::spawn(generate, Config::new("s3"));
    let client = SerialClient::new(supervisor);

    let started = tokio::time::Instant::now();
    let result = client.request_with_timeout("y".to_string(), 200).await;
    let elapsed = started.elapsed();

    assert_eq!(result, Err(Error::Timeout));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(700));
}

#[tokio::test]
async fn s4_mid_flight_loss_serial() {
    let (client1, server1) = pair::<String, String>();
    let (client2, server2) = pair::<String, String>();

    // server1 reads the request but never replies, then we close it
    // ourselves to simulate the drop.
    tokio::spawn(async move {
        let _ = server1.read().await;
        server1.close();
    });

    let handler: server::Handler<String, String> = Arc::new(|responder, _req| {
        Box::pin(async move {
            responder.success("P".to_string());
        })
    });
    server::serial::spawn(Arc::new(server2), handler);

    let endpoints = Mutex::new(vec![Some(client1), Some(client2)]);
    let generate: Generator<Reply<String>, String> = Arc::new(move || {
        let next = endpoints.lock().unwrap().iter_mut().find_map(|slot| slot.take());
        Box::pin(async move {
            next.map(|c| Box::new(c) as Box<dyn Channel<Reply<String>, String>>)
                .ok_or_else(|| "exhausted".into())
        })
    });

    let supervisor = Supervisor::spawn(generate, Config::new("s4-serial"));
    let client = SerialClient::new(supervisor);

    assert_eq!(client.request("p".to_string()).await, Ok("P".to_string()));
}

#[tokio::test]
async fn s4_mid_flight_loss_pipelined() {
    let (client1, server1) = pair::<String, String>();
    let (client2, server2) = pair::<String, String>();

    tokio::spawn(async move {
        let _ = server1.read().await;
        server1.close();
    });

    let handler: server::Handler<String, String> = Arc::new(|responder, _req| {
        Box::pin(async move {
            responder.success("P".to_string());
        })
    });
    server::serial::spawn(Arc::new(server2), handler);

    let endpoints = Mutex::new(vec![Some(client1), Some(client2)]);
    let generate: Generator<Reply<String>, String> = Arc::new(move || {
        let next = endpoints.lock().unwrap().iter_mut().find_map(|slot| slot.take());
        Box::pin(async move {
            next.map(|c| Box::new(c) as Box<dyn Channel<Reply<String>, String>>)
                .ok_or_else(|| "exhausted".into())
        })
    });

    let supervisor = Supervisor::spawn(generate, Config::new("s4-pipelined"));
    let client = PipelinedClient::new(supervisor);

    assert_eq!(client.request("p".to_string()).await, Ok("P".to_string()));
}

#[tokio::test]
async fn s5_pipelined_order() {
    let (client_end, server_end) = pair::<u32, u32>();
    let handler: server::Handler<u32, u32> = Arc::new(|responder, req| {
        Box::pin(async move {
            responder.success(req + 1);
        })
    });
    server::pipelined::spawn(Arc::new(server_end), handler);

    let slot = Mutex::new(Some(client_end));
    let generate: Generator<Reply<u32>, u32> = Arc::new(move || {
        let ch = slot.lock().unwrap().take();
        Box::pin(async move {
            ch.map(|c| Box::new(c) as Box<dyn Channel<Reply<u32>, u32>>)
                .ok_or_else(|| "exhausted".into())
        })
    });
    let supervisor = Supervisor::spawn(generate, Config::new("s5"));
    let client = PipelinedClient::new(supervisor);

    let futures: Vec<_> = (1..=100u32).map(|i| client.request(i)).collect();
    let mut results = Vec::with_capacity(100);
    for fut in futures {
        results.push(fut.await.unwrap());
    }

    let expected: Vec<u32> = (2..=101).collect();
    assert_eq!(results, expected);
}

#[tokio::test(start_paused = true)]
async fn s6_server_reply_order_despite_reverse_handler_completion() {
    let (client, server) = pair::<u32, u32>();
    let handler: server::Handler<u32, u32> = Arc::new(|responder, req| {
        Box::pin(async move {
            let delay = 100u64.saturating_sub(u64::from(req));
            tokio::time::sleep(Duration::from_millis(delay)).await;
            responder.success(req);
        })
    });
    server::pipelined::spawn(Arc::new(server), handler);

    for i in 1..=100u32 {
        client.enqueue(i).await.unwrap();
    }

    for i in 1..=100u32 {
        assert_eq!(client.read().await, Some(Reply::Value(i)));
    }
}

#[tokio::test]
async fn idempotent_close_matches_single_close() {
    let generate: Generator<Reply<String>, String> =
        Arc::new(|| Box::pin(async move { Err("always fails".into()) }));
    let supervisor = Supervisor::spawn(generate, Config::new("close-test"));
    let client = SerialClient::new(supervisor);

    client.close();
    client.close();
    client.close();

    assert_eq!(
        client.request("late".to_string()).await,
        Err(Error::Deactivated)
    );
}

#[tokio::test]
async fn at_most_one_connection_is_ever_live() {
    let (client_end, server_end) = pair::<String, String>();
    spawn_echo_server(server_end);

    let live_count = Arc::new(AtomicU32::new(0));
    let live_count_hook = Arc::clone(&live_count);
    let generate = echo_generator(Mutex::new(Some(client_end)));
    let config = Config::new("invariant-1").with_on_connect(Arc::new(move |_ch| {
        live_count_hook.fetch_add(1, Ordering::SeqCst);
    }));

    let supervisor = Supervisor::spawn(generate, config);
    match supervisor.get().await {
        Acquired::Connected(_) => {}
        Acquired::Closed => panic!("expected a connection"),
    }
    assert_eq!(live_count.load(Ordering::SeqCst), 1);
}
