//! Basic reliability coordinator usage example
//!
//! Run with `RUST_LOG=reliability_engine=debug` to see the engine's events.

use reliability_engine::{
    CircuitBreakerConfig, FallbackConfig, OperationError, OperationPolicy, ReliabilityCoordinator,
    RetryConfig, RetryStrategy,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("=== Reliability Engine Basic Example ===\n");

    let coordinator = ReliabilityCoordinator::builder()
        .on_open(|t| println!("🔴 Circuit '{}' opened!", t.key))
        .on_close(|t| println!("🟢 Circuit '{}' closed!", t.key))
        .on_half_open(|t| println!("🟡 Circuit '{}' half-open, testing...", t.key))
        .build();

    coordinator
        .configure(
            "screen.capture",
            OperationPolicy::new()
                .with_retry(
                    RetryConfig::new()
                        .with_max_attempts(3)
                        .with_strategy(RetryStrategy::Fibonacci)
                        .with_base_delay(Duration::from_millis(50)),
                )
                .with_circuit_breaker(
                    CircuitBreakerConfig::new()
                        .with_failure_threshold(2)
                        .with_success_threshold(1)
                        .with_timeout(Duration::from_millis(500)),
                )
                .with_fallback(FallbackConfig::cached_result(Duration::from_secs(30))),
        )
        .expect("valid policy");

    let attempts = AtomicU32::new(0);
    let healthy = || async {
        attempts.fetch_add(1, Ordering::SeqCst);
        Ok::<_, OperationError>(json!({ "frame": "frame-001.png" }))
    };
    let broken = || async {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err::<serde_json::Value, _>(OperationError::timeout("display server not responding"))
    };

    println!("--- Successful capture (fills the cache) ---");
    match coordinator.execute("screen.capture", healthy).await {
        Ok(outcome) => println!("✓ {}", outcome.into_value()),
        Err(e) => println!("✗ [{}] {}", e.code(), e),
    }

    println!("\n--- Failing captures (served from cache) ---");
    for _ in 0..2 {
        match coordinator.execute("screen.capture", broken).await {
            Ok(outcome) => println!("✓ {:?} -> {}", outcome.strategy(), outcome.into_value()),
            Err(e) => println!("✗ [{}] {}", e.code(), e),
        }
    }

    let before = attempts.load(Ordering::SeqCst);
    println!("\n--- Call while open (operation not invoked) ---");
    match coordinator.execute("screen.capture", broken).await {
        Ok(outcome) => println!("✓ {:?} -> {}", outcome.strategy(), outcome.into_value()),
        Err(e) => println!("✗ [{}] {}", e.code(), e),
    }
    println!("attempts made: {}", attempts.load(Ordering::SeqCst) - before);

    println!("\n--- Recovery after the open timeout ---");
    tokio::time::sleep(Duration::from_millis(600)).await;
    match coordinator.execute("screen.capture", healthy).await {
        Ok(outcome) => println!("✓ {}", outcome.into_value()),
        Err(e) => println!("✗ [{}] {}", e.code(), e),
    }

    if let Some(report) = coordinator.monitor("screen.capture") {
        println!("\n--- Monitor ---");
        println!(
            "{}",
            serde_json::to_string_pretty(&report).unwrap_or_else(|e| e.to_string())
        );
    }

    let summary = coordinator.summary();
    println!(
        "\nsystem stable: {}, overall success rate: {:.2}",
        summary.system_stable, summary.overall_success_rate
    );
}
