//! End-to-end throughput benchmark for astrond.
//!
//! Every client subscribes to one shared channel and floods it. Measures
//! delivered datagrams per second over real sockets.
//!
//! Usage: `e2e_throughput [clients] [address]`

use astron_bench::datagram;
use astron_protocol::msgtypes::CONTROL_ADD_CHANNEL;
use astron_protocol::Datagram;
use astron_transport::{DatagramReader, DatagramWriter, TcpConfig, TcpConnection};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;

const DEFAULT_ADDR: &str = "127.0.0.1:7199";
const BENCH_CHANNEL: u64 = 4_000_000;
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let addr = args.get(2).cloned().unwrap_or_else(|| DEFAULT_ADDR.to_string());

    println!("astrond end-to-end throughput");
    println!("  server:  {} (start it first: cargo run --release --bin astrond)", addr);
    println!("  clients: {}", num_clients);
    println!("  warmup {}s, measure {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let delivered = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();
    for client_id in 0..num_clients {
        let delivered = Arc::clone(&delivered);
        let barrier = Arc::clone(&barrier);
        let addr = addr.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(&addr, client_id, delivered, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        }));
    }

    barrier.wait().await;
    println!("All {} clients subscribed", num_clients);

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;
    delivered.store(0, Ordering::SeqCst);
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = delivered.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("  duration:   {:>10.2}s", elapsed.as_secs_f64());
    println!("  delivered:  {:>10}", total);
    println!("  throughput: {:>10.0} dg/s", per_sec);
    println!("  per client: {:>10.0} dg/s", per_sec / num_clients as f64);

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    addr: &str,
    client_id: usize,
    delivered: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut reader, mut writer) = TcpConnection::connect(addr, TcpConfig::default())
        .await?
        .split();

    let mut subscribe = Datagram::new();
    subscribe
        .add_control_header(CONTROL_ADD_CHANNEL)
        .add_channel(BENCH_CHANNEL);
    writer.send(subscribe.freeze()).await?;

    // Give the MD a moment to apply the subscription before traffic starts.
    tokio::time::sleep(Duration::from_millis(100)).await;
    barrier.wait().await;

    let recv_task = tokio::spawn(async move {
        while let Ok(Some(_)) = reader.recv().await {
            delivered.fetch_add(1, Ordering::Relaxed);
        }
    });

    let dg = datagram(&[BENCH_CHANNEL], 64);
    loop {
        if writer.send(dg.clone()).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    eprintln!("Client {} disconnected", client_id);
    Ok(())
}
