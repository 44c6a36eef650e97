//! Provider sync runs: paging, mutual exclusion, item caps, failure handling
//! and the scheduler.

#[path = "test_utils/mod.rs"]
mod test_utils;

use std::sync::Arc;

use anyhow::Result;

use credential_sync::adapters::{ProviderError, SyncCursor};
use credential_sync::dlq::RetryOutcome;
use credential_sync::orchestrator::{SyncRunError, SyncTrigger};
use credential_sync::scheduler::Scheduler;
use test_utils::{FakeAdapter, Harness, raw_credential, test_config};

const SECRET: &str = "whsec_sync";

#[tokio::test]
async fn sync_follows_pages_until_exhausted() -> Result<()> {
    let adapter = Arc::new(FakeAdapter::new("alpha", SECRET));
    adapter.push_page(
        vec![raw_credential("alpha", "A-1", "Leela Joshi", Some("leela@example.com"))],
        Some("page_2"),
    );
    adapter.push_page(
        vec![raw_credential("alpha", "A-2", "Unknown Person", None)],
        None,
    );
    let h = Harness::new(test_config(), vec![adapter.clone()]).await?;
    h.insert_learner("Leela Joshi", Some("leela@example.com"), 1)
        .await?;

    let run = h
        .orchestrator
        .force_sync("alpha", false, SyncTrigger::Manual)
        .await?;

    assert_eq!(run.status, "completed");
    assert_eq!(run.trigger, "manual");
    assert_eq!(run.processed, 2);
    assert_eq!(run.created, 1);
    assert_eq!(run.rejected, 1);
    assert_eq!(adapter.fetch_count(), 2);
    assert_eq!(
        adapter.seen_cursors()[1].page_token.as_deref(),
        Some("page_2")
    );

    let state = h.orchestrator.sync_states().get("alpha").await?.unwrap();
    assert_eq!(state.status, "completed");
    assert_eq!(state.credentials_synced, 2);
    assert!(state.last_successful_sync_at.is_some());
    assert!(state.cursor.is_none());

    // The next incremental run starts from the previous run's start time.
    h.orchestrator
        .force_sync("alpha", false, SyncTrigger::Manual)
        .await?;
    let third_cursor = &adapter.seen_cursors()[2];
    assert!(third_cursor.since > chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
    assert!(third_cursor.page_token.is_none());

    let runs = h.orchestrator.results().list_recent(Some("alpha"), 10).await?;
    assert_eq!(runs.len(), 2);
    Ok(())
}

#[tokio::test]
async fn full_sync_starts_from_epoch() -> Result<()> {
    let adapter = Arc::new(FakeAdapter::new("alpha", SECRET));
    let h = Harness::new(test_config(), vec![adapter.clone()]).await?;

    h.orchestrator
        .force_sync("alpha", false, SyncTrigger::Manual)
        .await?;
    h.orchestrator
        .force_sync("alpha", true, SyncTrigger::Manual)
        .await?;

    assert_eq!(adapter.seen_cursors()[1], SyncCursor::epoch());
    Ok(())
}

#[tokio::test]
async fn second_run_for_same_provider_is_refused() -> Result<()> {
    let adapter = Arc::new(FakeAdapter::new("alpha", SECRET));
    let h = Harness::new(test_config(), vec![adapter.clone()]).await?;

    assert!(h.orchestrator.sync_states().try_begin("alpha").await?);

    let refused = h
        .orchestrator
        .force_sync("alpha", false, SyncTrigger::Manual)
        .await;
    assert!(matches!(
        refused,
        Err(SyncRunError::AlreadyRunning { provider_id }) if provider_id == "alpha"
    ));
    assert_eq!(adapter.fetch_count(), 0);

    let state = h.orchestrator.sync_states().get("alpha").await?.unwrap();
    assert_eq!(state.status, "running");
    Ok(())
}

#[tokio::test]
async fn different_providers_sync_concurrently() -> Result<()> {
    let alpha = Arc::new(FakeAdapter::new("alpha", SECRET));
    let beta = Arc::new(FakeAdapter::new("beta", SECRET));
    alpha.push_page(vec![raw_credential("alpha", "A-1", "One Person", None)], None);
    beta.push_page(vec![raw_credential("beta", "B-1", "Two Person", None)], None);
    let h = Harness::new(test_config(), vec![alpha, beta]).await?;

    let results = h
        .orchestrator
        .sync_enabled(false, SyncTrigger::Manual)
        .await?;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "alpha");
    assert_eq!(results[1].0, "beta");
    for (_, result) in &results {
        let run = result.as_ref().expect("run completes");
        assert_eq!(run.status, "completed");
        assert_eq!(run.processed, 1);
    }
    Ok(())
}

#[tokio::test]
async fn disabled_provider_is_not_synced() -> Result<()> {
    let adapter = Arc::new(FakeAdapter::new("alpha", SECRET));
    let h = Harness::new(test_config(), vec![adapter.clone()]).await?;
    h.orchestrator.providers().set_enabled("alpha", false).await?;

    let refused = h
        .orchestrator
        .force_sync("alpha", false, SyncTrigger::Manual)
        .await;
    assert!(matches!(refused, Err(SyncRunError::ProviderDisabled { .. })));

    let results = h
        .orchestrator
        .sync_enabled(false, SyncTrigger::Scheduler)
        .await?;
    assert!(results.is_empty());
    assert_eq!(adapter.fetch_count(), 0);
    Ok(())
}

#[tokio::test]
async fn item_cap_defers_rest_of_feed() -> Result<()> {
    let mut config = test_config();
    config.sync.max_items_per_run = 2;
    let adapter = Arc::new(FakeAdapter::new("alpha", SECRET));
    adapter.push_page(
        vec![
            raw_credential("alpha", "C-1", "First Learner", None),
            raw_credential("alpha", "C-2", "Second Learner", None),
            raw_credential("alpha", "C-3", "Third Learner", None),
        ],
        None,
    );
    let h = Harness::new(config, vec![adapter.clone()]).await?;

    let run = h
        .orchestrator
        .force_sync("alpha", false, SyncTrigger::Manual)
        .await?;
    assert_eq!(run.status, "completed");
    assert_eq!(run.processed, 2);
    assert!(
        h.orchestrator
            .credentials()
            .find_by_key("alpha", "C-3")
            .await?
            .is_none()
    );

    let state = h.orchestrator.sync_states().get("alpha").await?.unwrap();
    assert!(state.cursor.is_some());
    assert!(state.last_successful_sync_at.is_none());

    // The capped page is requested again on the next run.
    h.orchestrator
        .force_sync("alpha", false, SyncTrigger::Manual)
        .await?;
    let cursors = adapter.seen_cursors();
    assert_eq!(cursors[1], cursors[0]);
    Ok(())
}

#[tokio::test]
async fn exhausted_transient_failure_is_dead_lettered() -> Result<()> {
    let adapter = Arc::new(
        FakeAdapter::new("alpha", SECRET)
            .failing_auth(ProviderError::Network("connection reset".to_string())),
    );
    let h = Harness::new(test_config(), vec![adapter]).await?;

    let run = h
        .orchestrator
        .force_sync("alpha", false, SyncTrigger::Manual)
        .await?;
    assert_eq!(run.status, "failed");
    assert_eq!(run.dead_lettered, 1);

    let state = h.orchestrator.sync_states().get("alpha").await?.unwrap();
    assert_eq!(state.status, "failed");
    assert!(
        state
            .error_list()
            .iter()
            .any(|e| e.contains("connection reset"))
    );

    let (items, total) = h.orchestrator.dlq().list(10, 0).await?;
    assert_eq!(total, 1);
    assert_eq!(items[0].job_type, "poll-sync");
    assert_eq!(items[0].reason, "provider_unavailable");
    assert_eq!(items[0].error_kind, "transient");

    // Replaying a sync that still fails bumps attempts without a new item.
    let outcome = h.orchestrator.retry_dlq_item(items[0].id).await?;
    let RetryOutcome::Failed { item, .. } = outcome else {
        panic!("replay should fail while the provider is down");
    };
    assert_eq!(item.attempts, 1);
    assert_eq!(h.orchestrator.dlq().count().await?, 1);
    Ok(())
}

#[tokio::test]
async fn permanent_auth_failure_fails_run_without_dead_letter() -> Result<()> {
    let adapter = Arc::new(FakeAdapter::new("alpha", SECRET).failing_auth(
        ProviderError::Authentication {
            message: "bad client secret".to_string(),
            transient: false,
        },
    ));
    let h = Harness::new(test_config(), vec![adapter]).await?;

    let run = h
        .orchestrator
        .force_sync("alpha", false, SyncTrigger::Manual)
        .await?;

    assert_eq!(run.status, "failed");
    assert_eq!(h.orchestrator.dlq().count().await?, 0);
    let errors: Vec<String> = serde_json::from_value(run.errors)?;
    assert!(errors.iter().any(|e| e.contains("bad client secret")));
    Ok(())
}

#[tokio::test]
async fn stale_running_state_is_recovered() -> Result<()> {
    let mut config = test_config();
    config.sync.stale_running_minutes = 0;
    let adapter = Arc::new(FakeAdapter::new("alpha", SECRET));
    let h = Harness::new(config, vec![adapter]).await?;

    assert!(h.orchestrator.sync_states().try_begin("alpha").await?);
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let recovered = h.orchestrator.recover_stale().await?;
    assert_eq!(recovered, vec!["alpha".to_string()]);

    let state = h.orchestrator.sync_states().get("alpha").await?.unwrap();
    assert_eq!(state.status, "failed");

    let run = h
        .orchestrator
        .force_sync("alpha", false, SyncTrigger::Manual)
        .await?;
    assert_eq!(run.status, "completed");
    Ok(())
}

#[tokio::test]
async fn scheduler_tick_syncs_enabled_providers() -> Result<()> {
    let adapter = Arc::new(FakeAdapter::new("alpha", SECRET));
    let h = Harness::new(test_config(), vec![adapter.clone()]).await?;
    let scheduler = Scheduler::new(&h.config, Arc::clone(&h.orchestrator));

    let report = scheduler.tick().await.expect("tick runs");
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);
    assert!(scheduler.status().last_sync_at.is_some());
    assert!(!scheduler.is_syncing());

    let runs = h.orchestrator.results().list_recent(Some("alpha"), 10).await?;
    assert_eq!(runs[0].trigger, "scheduler");
    Ok(())
}

#[tokio::test]
async fn scheduler_tick_skips_provider_already_running() -> Result<()> {
    let adapter = Arc::new(FakeAdapter::new("alpha", SECRET));
    let h = Harness::new(test_config(), vec![adapter.clone()]).await?;
    let scheduler = Scheduler::new(&h.config, Arc::clone(&h.orchestrator));
    h.orchestrator.sync_states().try_begin("alpha").await?;

    let report = scheduler.tick().await.expect("tick runs");
    assert_eq!(report.skipped, 1);
    assert_eq!(report.completed, 0);
    assert_eq!(adapter.fetch_count(), 0);
    Ok(())
}

#[tokio::test]
async fn scheduler_does_nothing_when_feature_disabled() -> Result<()> {
    let mut config = test_config();
    config.sync.enabled = false;
    let adapter = Arc::new(FakeAdapter::new("alpha", SECRET));
    let h = Harness::new(config, vec![adapter.clone()]).await?;
    let scheduler = Scheduler::new(&h.config, Arc::clone(&h.orchestrator));

    assert!(scheduler.tick().await.is_none());
    assert_eq!(adapter.fetch_count(), 0);
    Ok(())
}

#[tokio::test]
async fn scheduler_stop_then_start_resumes_ticking() -> Result<()> {
    let adapter = Arc::new(FakeAdapter::new("alpha", SECRET));
    let h = Harness::new(test_config(), vec![adapter.clone()]).await?;
    let scheduler = Arc::new(
        Scheduler::new(&h.config, Arc::clone(&h.orchestrator)).with_interval(
            std::time::Duration::from_secs(3600),
            std::time::Duration::from_millis(10),
        ),
    );

    assert!(scheduler.start().running);
    wait_for(|| adapter.fetch_count() >= 1).await;

    let stopped = scheduler.stop();
    assert!(!stopped.running);
    assert!(stopped.next_sync_at.is_none());
    let fetched = adapter.fetch_count();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(adapter.fetch_count(), fetched);

    assert!(scheduler.start().running);
    wait_for(|| adapter.fetch_count() > fetched).await;
    scheduler.stop();
    Ok(())
}

#[tokio::test]
async fn stopping_scheduler_lets_in_flight_run_finish() -> Result<()> {
    let adapter = Arc::new(FakeAdapter::new("alpha", SECRET));
    adapter.push_page(
        vec![raw_credential("alpha", "G-1", "Gita Menon", Some("gita@example.com"))],
        None,
    );
    let gate = adapter.hold_next_fetch();
    let h = Harness::new(test_config(), vec![adapter.clone()]).await?;
    h.insert_learner("Gita Menon", Some("gita@example.com"), 1)
        .await?;
    let scheduler = Arc::new(
        Scheduler::new(&h.config, Arc::clone(&h.orchestrator)).with_interval(
            std::time::Duration::from_millis(20),
            std::time::Duration::from_millis(10),
        ),
    );

    scheduler.start();
    gate.wait_entered().await;

    // The run is parked inside fetch_since when the stop arrives.
    let stopped = scheduler.stop();
    assert!(!stopped.running);
    assert!(stopped.is_syncing);
    let state = h.orchestrator.sync_states().get("alpha").await?.unwrap();
    assert_eq!(state.status, "running");

    gate.release.notify_one();
    wait_for(|| !scheduler.is_syncing()).await;

    let state = h.orchestrator.sync_states().get("alpha").await?.unwrap();
    assert_eq!(state.status, "completed");
    let stored = h.orchestrator.credentials().find_by_key("alpha", "G-1").await?;
    assert_eq!(stored.map(|c| c.status).as_deref(), Some("verified"));

    // Well past the interval: no further tick starts.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(adapter.fetch_count(), 1);
    let runs = h.orchestrator.results().list_recent(Some("alpha"), 10).await?;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "completed");
    Ok(())
}

#[tokio::test]
async fn manual_run_is_reported_as_syncing() -> Result<()> {
    let adapter = Arc::new(FakeAdapter::new("alpha", SECRET));
    let gate = adapter.hold_next_fetch();
    let h = Harness::new(test_config(), vec![adapter.clone()]).await?;
    let scheduler = Scheduler::new(&h.config, Arc::clone(&h.orchestrator));
    assert!(!scheduler.status().is_syncing);

    let orchestrator = Arc::clone(&h.orchestrator);
    let run = tokio::spawn(async move {
        orchestrator
            .force_sync("alpha", false, SyncTrigger::Manual)
            .await
    });
    gate.wait_entered().await;

    let status = scheduler.status();
    assert!(status.is_syncing);
    assert!(!status.running);
    assert_eq!(h.orchestrator.active_runs(), 1);

    gate.release.notify_one();
    let result = run.await??;
    assert_eq!(result.status, "completed");
    assert_eq!(h.orchestrator.active_runs(), 0);
    assert!(!scheduler.status().is_syncing);
    Ok(())
}

async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}
