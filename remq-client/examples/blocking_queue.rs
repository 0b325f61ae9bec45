//! Blocking queue example: a producer and a consumer sharing one queue.
//!
//! Run with: `cargo run --example blocking_queue`
//!
//! Requires a RESP server (Redis or compatible) on localhost:6379. Restart the
//! server while the consumer waits to watch its pending take reattach.

use std::time::Duration;

use remq_client::{ClientConfig, PoolEvent, RemqClient};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Job {
    id: u64,
    payload: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ClientConfig::builder()
        .address("127.0.0.1:6379")
        .client_name("remq-demo")
        .pool(|p| p.min_idle(2).max_size(8))
        .retry(|r| r.initial_backoff(Duration::from_millis(200)).jitter(0.2))
        .build()?;

    let client = RemqClient::new(config).await?;
    println!("Connected with {} connection(s)", client.pool().connection_count());

    let mut events = client.pool().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PoolEvent::Connected { id, .. } => println!("  [pool] {} connected", id),
                PoolEvent::Disconnected { id, in_flight, .. } => {
                    println!("  [pool] {} lost with {} command(s) in flight", id, in_flight.len())
                }
                _ => {}
            }
        }
    });

    let queue = client.get_blocking_queue::<Job>("remq-demo:jobs");
    queue.delete().await?;

    let producer = queue.clone();
    tokio::spawn(async move {
        for id in 1..=5u64 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let job = Job {
                id,
                payload: format!("resize image {}", id),
            };
            if let Err(e) = producer.put(&job).await {
                eprintln!("producer failed: {}", e);
            }
        }
    });

    println!("Waiting for jobs...");
    for _ in 0..5 {
        let job = queue.take().await?;
        println!("Took job {}: {}", job.id, job.payload);
    }

    match queue.poll_timeout(Duration::from_secs(1)).await? {
        Some(job) => println!("Unexpected job {:?}", job),
        None => println!("Queue drained"),
    }

    client.shutdown().await;
    Ok(())
}
