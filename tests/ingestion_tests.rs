//! Single-credential ingestion: idempotency, gating, matching bands and
//! pending match resolution.

#[path = "test_utils/mod.rs"]
mod test_utils;

use std::sync::Arc;

use anyhow::Result;
use sea_orm::{ActiveModelTrait, Set};

use credential_sync::config::AppConfig;
use credential_sync::crypto::is_sealed;
use credential_sync::dlq::RetryOutcome;
use credential_sync::models::issuer;
use credential_sync::orchestrator::{IngestOutcome, ResolveError, SkipReason};
use credential_sync::repositories::{NewLearner, WriteEffect};
use credential_sync::webhook_verification::sign_hmac_sha256;
use test_utils::{FakeAdapter, Harness, fake_payload, raw_credential, test_config};

const PROVIDER: &str = "fake";
const SECRET: &str = "whsec_ingest";

async fn harness() -> Result<Harness> {
    Harness::new(test_config(), vec![Arc::new(FakeAdapter::new(PROVIDER, SECRET))]).await
}

/// Thresholds under which a phone-only match lands in review
fn review_config() -> AppConfig {
    let mut config = test_config();
    config.matching.threshold_high = 0.9;
    config.matching.threshold_low = 0.4;
    config.matching.phone_confidence = 0.6;
    config
}

#[tokio::test]
async fn same_credential_twice_stores_one_row() -> Result<()> {
    let h = harness().await?;
    let learner = h
        .insert_learner("Asha Verma", Some("asha@example.com"), 1)
        .await?;
    let raw = raw_credential(PROVIDER, "C-1", "Asha Verma", Some("asha@example.com"));

    let first = h.orchestrator.ingest(raw.clone()).await?;
    let IngestOutcome::Credential { credential, effect } = &first else {
        panic!("expected a stored credential, got {first:?}");
    };
    assert_eq!(*effect, WriteEffect::Created);
    assert_eq!(credential.status, "verified");
    assert_eq!(credential.learner_id, Some(learner.id));
    assert_eq!(credential.match_confidence, Some(1.0));

    let second = h.orchestrator.ingest(raw).await?;
    assert_eq!(second.label(), "duplicate");

    let counts = h.orchestrator.credentials().counts().await?;
    assert_eq!(counts.total, 1);
    assert_eq!(counts.verified, 1);
    assert_eq!(h.orchestrator.dlq().count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn rejected_credential_is_updated_in_place() -> Result<()> {
    let h = harness().await?;
    let raw = raw_credential(PROVIDER, "C-2", "Nobody Known", None);

    let first = h.orchestrator.ingest(raw.clone()).await?;
    assert_eq!(first.label(), "rejected");
    let second = h.orchestrator.ingest(raw).await?;
    assert!(matches!(
        second,
        IngestOutcome::Credential {
            effect: WriteEffect::Updated,
            ..
        }
    ));

    assert_eq!(h.orchestrator.credentials().counts().await?.total, 1);
    Ok(())
}

#[tokio::test]
async fn replayed_webhook_creates_nothing_new() -> Result<()> {
    let h = harness().await?;
    h.insert_learner("Ravi Kumar", Some("ravi@example.com"), 3)
        .await?;
    let body = serde_json::to_vec(&fake_payload("W-1", "Ravi Kumar", Some("ravi@example.com")))?;
    let signature = sign_hmac_sha256(&body, SECRET);

    let first = h
        .orchestrator
        .ingest_webhook(PROVIDER, &body, Some(&signature))
        .await?;
    assert_eq!(first.label(), "verified");

    let replay = h
        .orchestrator
        .ingest_webhook(PROVIDER, &body, Some(&signature))
        .await?;
    assert_eq!(replay.label(), "duplicate");

    assert_eq!(h.orchestrator.credentials().counts().await?.total, 1);
    assert_eq!(h.orchestrator.dlq().count().await?, 0);

    let stored = h
        .orchestrator
        .credentials()
        .find_by_key(PROVIDER, "W-1")
        .await?
        .expect("credential stored");
    assert!(stored.signature_verified);
    assert_eq!(stored.verification_method, "hmac_sha256");
    Ok(())
}

#[tokio::test]
async fn unparseable_webhook_is_dead_lettered_as_validation_failure() -> Result<()> {
    let h = harness().await?;
    let body = br#"{"id": "W-2"}"#;
    let signature = sign_hmac_sha256(body, SECRET);

    let outcome = h
        .orchestrator
        .ingest_webhook(PROVIDER, body, Some(&signature))
        .await?;

    let IngestOutcome::DeadLettered(item) = outcome else {
        panic!("expected dead letter");
    };
    assert_eq!(item.reason, "validation_failed");
    assert_eq!(item.error_kind, "validation");
    assert_eq!(item.attempts, 0);
    Ok(())
}

#[tokio::test]
async fn confidence_bands_decide_outcome() -> Result<()> {
    let mut config = test_config();
    config.matching.threshold_high = 0.9;
    config.matching.threshold_low = 0.4;
    config.matching.secondary_email_confidence = 0.95;
    config.matching.phone_confidence = 0.5;
    config.matching.name_only_weight = 0.1;
    let h = Harness::new(config, vec![Arc::new(FakeAdapter::new(PROVIDER, SECRET))]).await?;

    let kiran = h
        .insert_learner_with(NewLearner {
            full_name: "Kiran Rao".to_string(),
            secondary_email: Some("kiran@alt.example".to_string()),
            ..NewLearner::default()
        })
        .await?;
    let anil = h
        .insert_learner_with(NewLearner {
            full_name: "Anil Mehta".to_string(),
            phone: Some("+919876543210".to_string()),
            ..NewLearner::default()
        })
        .await?;
    h.insert_learner("Divya Nair", None, 2).await?;

    // 0.95 via secondary email: accepted
    let accepted = h
        .orchestrator
        .ingest(raw_credential(
            PROVIDER,
            "B-1",
            "Kiran Rao",
            Some("kiran@alt.example"),
        ))
        .await?;
    let IngestOutcome::Credential { credential, .. } = accepted else {
        panic!("expected accepted credential");
    };
    assert_eq!(credential.status, "verified");
    assert_eq!(credential.learner_id, Some(kiran.id));
    assert_eq!(credential.match_confidence, Some(0.95));

    // 0.5 via phone: queued for review
    let mut by_phone = raw_credential(PROVIDER, "B-2", "Anil Mehta", None);
    by_phone.candidate_phone = Some("9876543210".to_string());
    let pending = h.orchestrator.ingest(by_phone).await?;
    let IngestOutcome::PendingMatch(pending) = pending else {
        panic!("expected pending match");
    };
    assert_eq!(pending.top_confidence, 0.5);
    assert_eq!(pending.status, "open");
    assert!(
        h.orchestrator
            .credentials()
            .find_by_key(PROVIDER, "B-2")
            .await?
            .is_none()
    );

    // 0.1 via weighted name only: rejected
    let rejected = h
        .orchestrator
        .ingest(raw_credential(
            PROVIDER,
            "B-3",
            "Divya Nair",
            Some("divya@elsewhere.example"),
        ))
        .await?;
    let IngestOutcome::Credential { credential, .. } = rejected else {
        panic!("expected rejected credential");
    };
    assert_eq!(credential.status, "rejected");
    assert_eq!(credential.learner_id, None);

    // Operator resolves the pending match to the phone learner
    let resolved = h.orchestrator.resolve_pending(pending.id, Some(anil.id)).await?;
    assert_eq!(resolved.credential.status, "verified");
    assert_eq!(resolved.credential.learner_id, Some(anil.id));
    assert_eq!(resolved.credential.match_confidence, Some(0.5));
    assert_eq!(resolved.pending_match.status, "resolved");
    assert_eq!(resolved.pending_match.resolved_learner_id, Some(anil.id));

    let again = h.orchestrator.resolve_pending(pending.id, Some(anil.id)).await;
    assert!(matches!(again, Err(ResolveError::AlreadyResolved(id)) if id == pending.id));
    Ok(())
}

#[tokio::test]
async fn resolving_with_unknown_learner_fails() -> Result<()> {
    let mut config = test_config();
    config.matching.phone_confidence = 0.6;
    let h = Harness::new(config, vec![Arc::new(FakeAdapter::new(PROVIDER, SECRET))]).await?;
    h.insert_learner_with(NewLearner {
        full_name: "Sunita Das".to_string(),
        phone: Some("9123456780".to_string()),
        ..NewLearner::default()
    })
    .await?;

    let mut raw = raw_credential(PROVIDER, "P-1", "S Das", None);
    raw.candidate_phone = Some("9123456780".to_string());
    let IngestOutcome::PendingMatch(pending) = h.orchestrator.ingest(raw).await? else {
        panic!("expected pending match");
    };

    let unknown = uuid::Uuid::new_v4();
    let result = h.orchestrator.resolve_pending(pending.id, Some(unknown)).await;
    assert!(matches!(result, Err(ResolveError::LearnerNotFound(id)) if id == unknown));

    let rejected = h.orchestrator.resolve_pending(pending.id, None).await?;
    assert_eq!(rejected.credential.status, "rejected");
    assert_eq!(rejected.credential.learner_id, None);
    Ok(())
}

#[tokio::test]
async fn gating_skips_without_writing() -> Result<()> {
    let h = harness().await?;
    h.insert_learner("Farah Khan", Some("farah@example.com"), 1)
        .await?;

    let mut implausible = raw_credential(PROVIDER, "G-1", "Farah Khan", Some("farah@example.com"));
    implausible.training_hours_max = Some(h.config.sync.max_training_hours + 1);
    let outcome = h.orchestrator.ingest(implausible).await?;
    assert!(matches!(
        outcome,
        IngestOutcome::Skipped(SkipReason::ImplausibleTrainingHours)
    ));

    let issuer = h
        .orchestrator
        .issuers()
        .find_by_registry_id(PROVIDER)
        .await?
        .expect("seeded issuer");
    let mut opted_out: issuer::ActiveModel = issuer.into();
    opted_out.accept_external = Set(false);
    opted_out.update(&*h.db).await?;

    let outcome = h
        .orchestrator
        .ingest(raw_credential(PROVIDER, "G-2", "Farah Khan", Some("farah@example.com")))
        .await?;
    assert!(matches!(
        outcome,
        IngestOutcome::Skipped(SkipReason::IssuerOptedOut)
    ));

    h.orchestrator.providers().set_enabled(PROVIDER, false).await?;
    let outcome = h
        .orchestrator
        .ingest(raw_credential(PROVIDER, "G-3", "Farah Khan", Some("farah@example.com")))
        .await?;
    assert!(matches!(
        outcome,
        IngestOutcome::Skipped(SkipReason::ProviderDisabled)
    ));

    assert_eq!(h.orchestrator.credentials().counts().await?.total, 0);
    assert_eq!(h.orchestrator.dlq().count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn accepted_match_touches_issuer_last_sync() -> Result<()> {
    let h = harness().await?;
    h.insert_learner("Gopal Singh", Some("gopal@example.com"), 1)
        .await?;

    h.orchestrator
        .ingest(raw_credential(PROVIDER, "T-1", "Gopal Singh", Some("gopal@example.com")))
        .await?;

    let issuer = h
        .orchestrator
        .issuers()
        .find_by_registry_id(PROVIDER)
        .await?
        .expect("seeded issuer");
    assert!(issuer.last_sync_at.is_some());

    let stored = h
        .orchestrator
        .credentials()
        .find_by_key(PROVIDER, "T-1")
        .await?
        .expect("credential stored");
    assert_eq!(stored.issuer_id, Some(issuer.id));
    Ok(())
}

#[tokio::test]
async fn operator_rejection_survives_redelivery() -> Result<()> {
    let h = Harness::new(review_config(), vec![Arc::new(FakeAdapter::new(PROVIDER, SECRET))])
        .await?;
    h.insert_learner_with(NewLearner {
        full_name: "Farah Khan".to_string(),
        phone: Some("+919811122233".to_string()),
        ..NewLearner::default()
    })
    .await?;
    let mut raw = raw_credential(PROVIDER, "H-1", "F Khan", None);
    raw.candidate_phone = Some("9811122233".to_string());

    let IngestOutcome::PendingMatch(pending) = h.orchestrator.ingest(raw.clone()).await? else {
        panic!("expected pending match");
    };
    assert_eq!(pending.top_confidence, 0.6);
    let decided = h.orchestrator.resolve_pending(pending.id, None).await?;
    assert_eq!(decided.credential.status, "rejected");

    let again = h.orchestrator.ingest(raw).await?;
    assert_eq!(again.label(), "duplicate");

    let stored = h
        .orchestrator
        .pending_matches()
        .find_by_id(pending.id)
        .await?
        .expect("pending match kept");
    assert_eq!(stored.status, "resolved");
    assert!(stored.resolved_at.is_some());
    assert_eq!(stored.resolved_learner_id, None);
    assert_eq!(h.orchestrator.pending_matches().count_open().await?, 0);

    let credential = h
        .orchestrator
        .credentials()
        .find_by_key(PROVIDER, "H-1")
        .await?
        .expect("credential kept");
    assert_eq!(credential.status, "rejected");
    assert_eq!(credential.updated_at, decided.credential.updated_at);
    Ok(())
}

#[tokio::test]
async fn concurrent_webhook_and_poll_store_one_row() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let mut config = test_config();
    config.database_url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("race.db").display()
    );
    config.db_max_connections = 4;
    let h = Harness::new(config, vec![Arc::new(FakeAdapter::new(PROVIDER, SECRET))]).await?;
    h.insert_learner("Nisha Bose", Some("nisha@example.com"), 1)
        .await?;

    for n in 0..8 {
        let id = format!("R-{n}");
        let body = serde_json::to_vec(&fake_payload(&id, "Nisha Bose", Some("nisha@example.com")))?;
        let signature = sign_hmac_sha256(&body, SECRET);
        let raw = raw_credential(PROVIDER, &id, "Nisha Bose", Some("nisha@example.com"));

        let (pushed, polled) = tokio::join!(
            h.orchestrator.ingest_webhook(PROVIDER, &body, Some(&signature)),
            h.orchestrator.ingest(raw),
        );
        let mut labels = [pushed?.label(), polled?.label()];
        labels.sort_unstable();
        assert_eq!(labels, ["duplicate", "verified"], "credential {id}");
    }

    let counts = h.orchestrator.credentials().counts().await?;
    assert_eq!(counts.total, 8);
    assert_eq!(counts.verified, 8);
    assert_eq!(h.orchestrator.dlq().count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn provider_payloads_are_sealed_at_rest() -> Result<()> {
    let mut config = review_config();
    config.crypto_key = Some(vec![3u8; 32]);
    let h = Harness::new(config, vec![Arc::new(FakeAdapter::new(PROVIDER, SECRET))]).await?;
    h.insert_learner("Asha Verma", Some("asha@example.com"), 1)
        .await?;
    let reviewer_pick = h
        .insert_learner_with(NewLearner {
            full_name: "Farah Khan".to_string(),
            phone: Some("+919811122233".to_string()),
            ..NewLearner::default()
        })
        .await?;

    // Accepted credential: raw payload sealed, readable through the pipeline.
    h.orchestrator
        .ingest(raw_credential(PROVIDER, "E-1", "Asha Verma", Some("asha@example.com")))
        .await?;
    let stored = h
        .orchestrator
        .credentials()
        .find_by_key(PROVIDER, "E-1")
        .await?
        .expect("credential stored");
    assert!(is_sealed(&stored.raw_payload));
    assert!(!stored.raw_payload.to_string().contains("asha@example.com"));
    assert_eq!(
        h.orchestrator.open_raw_payload(&stored)?,
        fake_payload("E-1", "Asha Verma", Some("asha@example.com"))
    );

    // Pending match: sealed in storage, opened for review and resolution.
    let mut ambiguous = raw_credential(PROVIDER, "E-2", "F Khan", None);
    ambiguous.candidate_phone = Some("9811122233".to_string());
    let IngestOutcome::PendingMatch(pending) = h.orchestrator.ingest(ambiguous).await? else {
        panic!("expected pending match");
    };
    assert!(is_sealed(&pending.credential));
    let revealed = h.orchestrator.reveal_pending(pending.clone());
    assert_eq!(revealed.credential["provider_credential_id"], "E-2");
    assert_eq!(revealed.credential["candidate_phone"], "9811122233");

    let resolved = h
        .orchestrator
        .resolve_pending(pending.id, Some(reviewer_pick.id))
        .await?;
    assert_eq!(resolved.credential.status, "verified");
    assert!(is_sealed(&resolved.credential.raw_payload));

    // Dead-lettered job: sealed handle that still replays.
    let IngestOutcome::DeadLettered(item) = h
        .orchestrator
        .ingest(raw_credential("ghost", "E-3", "Lost Learner", Some("lost@example.com")))
        .await?
    else {
        panic!("expected dead letter");
    };
    assert!(is_sealed(&item.job_id));
    assert!(!item.job_id.to_string().contains("lost@example.com"));
    let RetryOutcome::Failed { error, .. } = h.orchestrator.retry_dlq_item(item.id).await? else {
        panic!("unknown provider keeps failing");
    };
    assert!(error.contains("ghost"), "replay should reach processing: {error}");
    Ok(())
}
