//! Broker load tests. They need a running broker on localhost:1883 and an
//! ingestor consuming from it, so they are ignored by default:
//!
//! ```text
//! cargo test -p wattflow-ingestor --test load_test -- --ignored --nocapture
//! ```

use chrono::Utc;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use wattflow_common::model::{Heartbeat, Location, Measurement};
use wattflow_common::routing;
use wattflow_common::{Broker, BrokerConfig, Publish, Topology};

const CITIES: [&str; 3] = ["Novi Sad", "Belgrade", "Nis"];

fn random_measurement(device: usize) -> Measurement {
    let mut rng = rand::thread_rng();
    Measurement {
        device_id: format!("load-test-dev-{}", device),
        value: rng.gen_range(0.2..4.5),
        timestamp: Utc::now(),
        address: Location {
            city: CITIES[device % CITIES.len()].to_string(),
            street: "Load Test".to_string(),
            number: device.to_string(),
        },
    }
}

async fn connect(client_id: &str, shutdown: &CancellationToken) -> Broker {
    let config = BrokerConfig::new("localhost", 1883, client_id);
    let (broker, _connection) = Broker::connect(config, Topology::exchange_only(), shutdown)
        .await
        .expect("broker must be running on localhost:1883");
    broker
}

#[tokio::test]
#[ignore]
async fn test_1000_measurements_per_second() {
    println!("\n🚀 Starting Load Test: 1000 msg/s");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let test_duration_secs = 10;
    let target_rate = 1000;
    let total_messages = test_duration_secs * target_rate;

    let shutdown = CancellationToken::new();
    let broker = connect("load-test", &shutdown).await;

    println!("\n📊 Test Configuration:");
    println!("  Target Rate:    {} msg/s", target_rate);
    println!("  Duration:       {} seconds", test_duration_secs);
    println!("  Total Messages: {}", total_messages);
    println!("  Devices:        30");

    let start = Instant::now();
    let mut sent_count = 0;
    let mut error_count = 0;

    let burst_size = 100;
    let delay_per_burst = Duration::from_micros((burst_size * 1_000_000) / target_rate as u64);

    for batch_start in (0..total_messages).step_by(burst_size as usize) {
        for i in batch_start..std::cmp::min(batch_start + burst_size, total_messages) {
            let measurement = random_measurement((i % 30) as usize);
            let payload = serde_json::to_vec(&measurement).unwrap();

            match broker.publish(&measurement.routing_key(), payload).await {
                Ok(()) => sent_count += 1,
                Err(e) => {
                    error_count += 1;
                    if error_count < 10 {
                        eprintln!("Send error: {}", e);
                    }
                }
            }
        }

        sleep(delay_per_burst).await;

        if (batch_start + burst_size) % 5000 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            let rate = (batch_start + burst_size) as f64 / elapsed;
            println!(" {} msgs ({:.0} msg/s)", batch_start + burst_size, rate);
        }
    }

    let duration = start.elapsed();
    let actual_rate = sent_count as f64 / duration.as_secs_f64();

    println!("\n📈 Results:");
    println!("  Total Sent:     {}", sent_count);
    println!("  Errors:         {}", error_count);
    println!("  Duration:       {:.2}s", duration.as_secs_f64());
    println!("  Actual Rate:    {:.2} msg/s", actual_rate);

    broker.close().await;

    assert!(
        actual_rate >= 900.0,
        "Throughput too low: {:.2} msg/s (expected >= 900)",
        actual_rate
    );
    assert_eq!(error_count, 0, "Publish errors: {}", error_count);
}

#[tokio::test]
#[ignore]
async fn test_heartbeats_from_500_devices() {
    println!("\n🚀 Starting Heartbeat Load Test: 500 devices, 30 seconds");

    let devices = 500;
    let rounds = 6;

    let shutdown = CancellationToken::new();
    let broker = connect("load-test-heartbeats", &shutdown).await;

    let start = Instant::now();
    let mut sent_count = 0;
    let mut error_count = 0;

    for round in 0..rounds {
        for device in 0..devices {
            let heartbeat = Heartbeat {
                device_id: format!("load-test-dev-{}", device),
                timestamp: Utc::now(),
            };
            let routing_key = routing::heartbeat_key(CITIES[device % CITIES.len()]);
            let payload = serde_json::to_vec(&heartbeat).unwrap();

            match broker.publish(&routing_key, payload).await {
                Ok(()) => sent_count += 1,
                Err(_) => error_count += 1,
            }
        }
        println!("round {} done after {:.1}s", round + 1, start.elapsed().as_secs_f64());
        sleep(Duration::from_secs(5)).await;
    }

    println!("\n✅ Heartbeat Test Complete!");
    println!("  Total Sent:     {}", sent_count);
    println!("  Errors:         {}", error_count);

    broker.close().await;

    assert_eq!(sent_count, devices * rounds);
}
