use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use omnifolio::protection::{CircuitBreakerConfig, CircuitOpenError, CircuitState, RateLimitConfig};
use omnifolio::sync::{SyncError, SyncOrchestrator};

mod support;
use support::{EventRecorder, MockProvider};

fn quick_breaker(failure_threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        recovery_timeout: Duration::from_millis(100),
        half_open_retries: 1,
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn cycle_settles_all_providers_despite_failures() -> Result<()> {
    let recorder = EventRecorder::new();
    let evm = Arc::new(MockProvider::new("evm"));
    let solana = Arc::new(MockProvider::new("solana").failing());

    let mut orchestrator = SyncOrchestrator::new().with_event_bus(recorder.bus.clone());
    orchestrator.register_provider(evm);
    orchestrator.register_provider(solana);

    let result = orchestrator
        .orchestrate_sync(&names(&["evm", "solana"]))
        .await?;

    assert_eq!(result.successful, vec!["evm".to_string()]);
    assert_eq!(result.failed, vec!["solana".to_string()]);
    assert!(result.errors.contains_key("solana"));

    let metrics = orchestrator.sync_metrics();
    assert_eq!(metrics.cycles, 1);
    assert_eq!(metrics.per_provider["evm"].successes, 1);
    assert_eq!(metrics.per_provider["solana"].failures, 1);
    assert!(metrics.per_provider["evm"].last_success.is_some());

    assert_eq!(recorder.count_of("sync_cycle_started"), 1);
    assert_eq!(recorder.count_of("sync_cycle_completed"), 1);
    assert_eq!(recorder.count_of("sync_source_failed"), 1);
    Ok(())
}

#[tokio::test]
async fn unknown_provider_fails_its_task_only() -> Result<()> {
    let evm = Arc::new(MockProvider::new("evm"));
    let mut orchestrator = SyncOrchestrator::new();
    orchestrator.register_provider(evm);

    let result = orchestrator
        .orchestrate_sync(&names(&["evm", "ghost"]))
        .await?;

    assert_eq!(result.successful, vec!["evm".to_string()]);
    assert_eq!(result.failed, vec!["ghost".to_string()]);
    Ok(())
}

#[tokio::test]
async fn repeated_failures_trip_the_circuit() -> Result<()> {
    let recorder = EventRecorder::new();
    let solana = Arc::new(MockProvider::new("solana").failing());

    let mut orchestrator = SyncOrchestrator::new().with_event_bus(recorder.bus.clone());
    orchestrator.register_provider_with(
        solana.clone(),
        RateLimitConfig::new(6000),
        quick_breaker(2),
    );

    orchestrator.orchestrate_sync(&names(&["solana"])).await?;
    orchestrator.orchestrate_sync(&names(&["solana"])).await?;

    assert_eq!(
        orchestrator.circuit_state("solana")?,
        CircuitState::Open
    );
    assert_eq!(recorder.count_of("circuit_breaker_opened"), 1);

    // While open, the provider is refused without being called.
    let calls_before = solana.fetch_calls();
    let result = orchestrator.orchestrate_sync(&names(&["solana"])).await?;
    assert_eq!(result.failed, vec!["solana".to_string()]);
    assert_eq!(solana.fetch_calls(), calls_before);
    assert!(result.errors["solana"].contains(&CircuitOpenError.to_string()));
    Ok(())
}

#[tokio::test]
async fn circuit_recovers_through_half_open_probe() -> Result<()> {
    let recorder = EventRecorder::new();
    let solana = Arc::new(MockProvider::new("solana").failing());

    let mut orchestrator = SyncOrchestrator::new().with_event_bus(recorder.bus.clone());
    orchestrator.register_provider_with(
        solana.clone(),
        RateLimitConfig::new(6000),
        quick_breaker(1),
    );

    orchestrator.orchestrate_sync(&names(&["solana"])).await?;
    assert_eq!(orchestrator.circuit_state("solana")?, CircuitState::Open);

    // Provider heals; after the recovery timeout the probe is admitted and
    // the single required success closes the circuit.
    solana.set_failing(false);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let result = orchestrator.orchestrate_sync(&names(&["solana"])).await?;
    assert_eq!(result.successful, vec!["solana".to_string()]);
    assert_eq!(orchestrator.circuit_state("solana")?, CircuitState::Closed);
    assert!(recorder.count_of("circuit_breaker_half_open") >= 1);
    assert_eq!(recorder.count_of("circuit_breaker_closed"), 1);
    Ok(())
}

#[tokio::test]
async fn only_one_cycle_runs_at_a_time() -> Result<()> {
    let slow = Arc::new(
        MockProvider::new("evm").with_fetch_delay(Duration::from_millis(200)),
    );
    let mut orchestrator = SyncOrchestrator::new();
    orchestrator.register_provider(slow);
    let orchestrator = Arc::new(orchestrator);

    let first = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.orchestrate_sync(&names(&["evm"])).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = orchestrator.orchestrate_sync(&names(&["evm"])).await;
    let err = second.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::SyncInProgress)
    ));

    let first = first.await.expect("join")?;
    assert_eq!(first.successful, vec!["evm".to_string()]);

    // The guard releases once the cycle settles.
    orchestrator.orchestrate_sync(&names(&["evm"])).await?;
    Ok(())
}

#[tokio::test]
async fn retry_failed_provider_resets_breaker() -> Result<()> {
    let solana = Arc::new(MockProvider::new("solana").failing());
    let mut orchestrator = SyncOrchestrator::new();
    orchestrator.register_provider_with(
        solana.clone(),
        RateLimitConfig::new(6000),
        quick_breaker(1),
    );

    orchestrator.orchestrate_sync(&names(&["solana"])).await?;
    assert_eq!(orchestrator.circuit_state("solana")?, CircuitState::Open);

    solana.set_failing(false);
    orchestrator.retry_failed_provider("solana").await?;
    assert_ne!(orchestrator.circuit_state("solana")?, CircuitState::Open);

    let metrics = orchestrator.sync_metrics();
    assert_eq!(metrics.per_provider["solana"].successes, 1);
    Ok(())
}

#[tokio::test]
async fn configure_protection_requires_known_provider() {
    let mut orchestrator = SyncOrchestrator::new();
    orchestrator.register_provider(Arc::new(MockProvider::new("evm")));

    assert!(orchestrator
        .configure_rate_limit("evm", RateLimitConfig::new(120))
        .is_ok());
    assert!(orchestrator
        .configure_circuit_breaker("evm", quick_breaker(9))
        .is_ok());

    let err = orchestrator
        .configure_rate_limit("ghost", RateLimitConfig::new(120))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::UnknownProvider(_))
    ));
}

#[tokio::test]
async fn scheduled_cycles_run_until_cancelled() -> Result<()> {
    let evm = Arc::new(MockProvider::new("evm"));
    let mut orchestrator = SyncOrchestrator::new();
    orchestrator.register_provider(evm.clone());
    let orchestrator = Arc::new(orchestrator);

    let handle = orchestrator.schedule_sync_cycle(Duration::from_millis(50));
    tokio::time::sleep(Duration::from_millis(220)).await;
    handle.cancel();

    let cycles = orchestrator.sync_metrics().cycles;
    assert!(cycles >= 2, "expected at least 2 cycles, got {cycles}");
    assert!(orchestrator.sync_metrics().next_scheduled_sync.is_some());

    // No further cycles after cancellation.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(orchestrator.sync_metrics().cycles, cycles);
    Ok(())
}
