//! Maintenance orchestration
//!
//! Periodic housekeeping: per-user classifier retraining (bounded by a
//! semaphore), orphan cleanup, storage optimization, and stats retention.
//! Every step emits a structured maintenance log row; no step failure stops
//! the cycle.

use crate::classifier::{self, TrainingSample, LEARN_RATE, TRAIN_EPOCHS};
use crate::engine::{Engine, Result};
use crate::storage::Storage as _;
use crate::types::{now_ms, MaintLog};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Concurrent classifier trainings
const TRAINING_CONCURRENCY: usize = 3;
/// Maximum training samples fetched per user
const TRAINING_SAMPLE_LIMIT: i64 = 10_000;
/// Minimum samples before a model is worth training
const MIN_TRAINING_SAMPLES: usize = 10;

async fn log_step(
    engine: &Engine,
    op: &str,
    status: &str,
    mut details: serde_json::Value,
) {
    crate::redact::redact_structured(&mut details);
    let log = MaintLog {
        id: Uuid::new_v4().to_string(),
        op: op.to_string(),
        status: status.to_string(),
        ts: now_ms(),
        details: details.to_string(),
    };
    if let Err(e) = engine.store().append_maint_log(&log).await {
        tracing::error!("[maintenance] failed to write maint log: {e}");
    }
}

/// Train (or refine) one user's sector classifier from their stored mean
/// vectors. Returns the new version, or None when there is too little data.
pub async fn train_user_classifier(engine: &Engine, user_id: &str) -> Result<Option<i64>> {
    let data = engine
        .store()
        .training_data(user_id, TRAINING_SAMPLE_LIMIT)
        .await?;
    if data.len() < MIN_TRAINING_SAMPLES {
        tracing::debug!(
            "[maintenance] not enough data to train classifier for {user_id} ({} samples)",
            data.len()
        );
        return Ok(None);
    }

    let samples: Vec<TrainingSample> = data
        .into_iter()
        .map(|(vector, label)| TrainingSample { vector, label })
        .collect();

    let existing = engine.store().classifier_model(user_id).await?;
    let model = classifier::train(&samples, existing.as_ref(), LEARN_RATE, TRAIN_EPOCHS);
    let version = model.version;

    engine.store().put_classifier_model(user_id, &model).await?;
    engine.classifier_cache().invalidate(user_id);
    tracing::info!(
        "[maintenance] trained classifier v{version} for {user_id} ({} samples)",
        samples.len()
    );
    Ok(Some(version))
}

/// One full maintenance cycle: retrain classifiers for every active user
/// (bounded concurrency), clean orphans, optimize storage, prune old stats.
pub async fn run_maintenance_cycle(engine: &Arc<Engine>) -> Result<()> {
    let started = now_ms();
    let users = engine.store().list_users().await?;
    tracing::info!("[maintenance] cycle start, {} users", users.len());

    // Classifier retraining, at most TRAINING_CONCURRENCY at once
    let semaphore = Arc::new(Semaphore::new(TRAINING_CONCURRENCY));
    let mut set = JoinSet::new();
    let mut trained = 0usize;
    for user in users.iter().cloned() {
        let engine = engine.clone();
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            match train_user_classifier(&engine, &user).await {
                Ok(Some(_)) => true,
                Ok(None) => false,
                Err(e) => {
                    tracing::error!("[maintenance] training failed for {user}: {e}");
                    false
                }
            }
        });
    }
    while let Some(res) = set.join_next().await {
        if matches!(res, Ok(true)) {
            trained += 1;
        }
    }
    if trained > 0 {
        engine.store().append_stat("retrain", trained as i64, now_ms()).await?;
    }

    // Orphan cleanup; the gate keeps its transaction clear of ingest
    let orphan_result = {
        let _write = engine.write_gate().lock().await;
        engine.store().delete_orphans().await
    };
    match orphan_result {
        Ok((vectors, waypoints)) => {
            log_step(
                engine,
                "cleanup_orphans",
                "success",
                serde_json::json!({ "vectors_removed": vectors, "waypoints_removed": waypoints }),
            )
            .await;
            if vectors + waypoints > 0 {
                tracing::info!(
                    "[maintenance] removed {vectors} orphan vectors, {waypoints} orphan waypoints"
                );
            }
        }
        Err(e) => {
            tracing::error!("[maintenance] orphan cleanup failed: {e}");
            log_step(
                engine,
                "cleanup_orphans",
                "error",
                serde_json::json!({ "error": e.to_string() }),
            )
            .await;
        }
    }

    // Storage optimization (VACUUM / ANALYZE depending on backend)
    if let Err(e) = engine.store().optimize().await {
        tracing::error!("[maintenance] optimization failed: {e}");
        log_step(
            engine,
            "optimize",
            "error",
            serde_json::json!({ "error": e.to_string() }),
        )
        .await;
    } else {
        log_step(engine, "optimize", "success", serde_json::json!({})).await;
    }

    // Stats retention
    let cutoff = now_ms() - engine.config().stats_retention_days * 86_400_000;
    match engine.store().delete_stats_before(cutoff).await {
        Ok(removed) => {
            log_step(
                engine,
                "stats_retention",
                "success",
                serde_json::json!({ "removed": removed }),
            )
            .await;
        }
        Err(e) => {
            tracing::error!("[maintenance] stats cleanup failed: {e}");
        }
    }

    log_step(
        engine,
        "retrain_all",
        "success",
        serde_json::json!({
            "user_count": users.len(),
            "trained": trained,
            "duration_ms": now_ms() - started,
        }),
    )
    .await;
    Ok(())
}
