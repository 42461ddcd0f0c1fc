//! End-to-end throughput benchmark for Herald.
//!
//! This benchmark measures actual WebSocket message throughput with real
//! network I/O: every client joins one private channel and floods it with
//! client events, which the server relays to every other subscriber.
//!
//! The target app must enable client messages. Settings come from the
//! environment:
//!
//! - `HERALD_URL` (default `ws://127.0.0.1:6001`)
//! - `HERALD_APP_KEY` / `HERALD_APP_SECRET` (default `BenchKey` / `BenchSecret`)

use futures_util::{SinkExt, StreamExt};
use herald_protocol::{codec, events};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenvis_herald_core::{auth, App};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;
const CHANNEL: &str = "private-benchmark";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

struct Settings {
    url: String,
    app: App,
}

impl Settings {
    fn from_env() -> Self {
        let var = |name: &str, default: &str| std::env::var(name).unwrap_or_else(|_| default.to_string());
        let key = var("HERALD_APP_KEY", "BenchKey");
        Self {
            url: format!("{}/app/{}?protocol=7", var("HERALD_URL", "ws://127.0.0.1:6001"), key),
            app: App::new("", key, var("HERALD_APP_SECRET", "BenchSecret")),
        }
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Herald End-to-End Throughput Benchmark               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_pubsub_benchmark(Arc::new(Settings::from_env()), num_clients).await;
}

async fn run_pubsub_benchmark(settings: Arc<Settings>, num_clients: usize) {
    println!("📊 Client event benchmark: {} clients on {}", num_clients, CHANNEL);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    // Spawn client tasks
    for client_id in 0..num_clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);
        let settings = Arc::clone(&settings);

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(&settings, msg_count, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    // Wait for all clients to connect
    barrier.wait().await;
    println!("✓ All {} clients subscribed", num_clients);

    // Warmup phase
    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    // Reset counter and start measurement
    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);

    // Calculate throughput
    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();
    let msgs_per_sec_per_client = msgs_per_sec / num_clients as f64;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Total Received:       {:>10}                           ║",
        total_messages
    );
    println!(
        "║  Throughput:           {:>10.0} msg/s                    ║",
        msgs_per_sec
    );
    println!(
        "║  Per-Client:           {:>10.0} msg/s                    ║",
        msgs_per_sec_per_client
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    // Signal clients to stop
    for handle in handles {
        handle.abort();
    }
}

/// Read text frames until one with the given event arrives.
async fn wait_for<S>(receiver: &mut S, event: &str) -> Result<Value, BoxError>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = receiver.next().await {
        if let Message::Text(text) = frame? {
            let message: Value = serde_json::from_str(&text)?;
            if message["event"] == event {
                return Ok(message);
            }
            if message["event"] == events::ERROR {
                return Err(format!("server error: {}", message["data"]).into());
            }
        }
    }
    Err(format!("connection closed while waiting for {event}").into())
}

async fn run_client(
    settings: &Settings,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    // Connect to server
    let (ws, _) = connect_async(settings.url.as_str()).await?;
    let (mut sender, mut receiver) = ws.split();

    let established = wait_for(&mut receiver, events::CONNECTION_ESTABLISHED).await?;
    let data: Value = match &established["data"] {
        Value::String(raw) => serde_json::from_str(raw)?,
        other => other.clone(),
    };
    let socket_id = data["socket_id"].as_str().ok_or("missing socket_id")?.to_string();

    // Subscribe with a locally signed token
    let subscribe = json!({
        "event": events::SUBSCRIBE,
        "data": {
            "channel": CHANNEL,
            "auth": auth::sign_channel(&settings.app, &socket_id, CHANNEL, None),
        }
    });
    sender.send(Message::Text(subscribe.to_string())).await?;
    wait_for(&mut receiver, events::SUBSCRIPTION_SUCCEEDED).await?;

    // Wait for all clients to be ready
    barrier.wait().await;

    // Pre-encode the client event for efficiency
    let client_event = herald_protocol::PusherMessage::new(
        "client-bench",
        Some(CHANNEL.to_string()),
        Some(json!({ "payload": "x".repeat(64) })),
    );
    let publish_msg = Message::Text(codec::encode(&client_event)?);

    // Spawn separate receiver task for full-duplex operation
    let recv_count = message_count.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            if let Ok(Message::Text(_)) = result {
                recv_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    // Send loop - no waiting, just blast messages
    loop {
        if sender.send(publish_msg.clone()).await.is_err() {
            break;
        }
        // Small yield to not starve the receiver task
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
