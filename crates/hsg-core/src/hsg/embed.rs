//! Multi-sector embedding
//!
//! One piece of content embeds once per assigned sector (the sector salts the
//! synthetic features and hints remote providers). Each operation writes one
//! pending -> completed/failed embed-log row. Per-sector calls fan out as
//! tasks and join.

use crate::embedding::EmbeddingProvider;
use crate::engine::{Engine, Result};
use crate::storage::Storage as _;
use crate::types::{now_ms, EmbedLog, EmbedStatus, Sector};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Embed `text` for every sector in `sectors`, in parallel, logging the
/// operation under `id`. Results come back in the order of `sectors`.
pub async fn embed_multi_sector(
    engine: &Engine,
    id: &str,
    text: &str,
    sectors: &[Sector],
    user_id: Option<&str>,
) -> Result<Vec<(Sector, Vec<f32>)>> {
    engine
        .store()
        .insert_embed_log(&EmbedLog {
            id: id.to_string(),
            model: "multi-sector".to_string(),
            status: EmbedStatus::Pending,
            ts: now_ms(),
            err: None,
            user_id: user_id.map(str::to_string),
        })
        .await?;

    match embed_each(engine.embedder(), text, sectors).await {
        Ok(out) => {
            engine
                .store()
                .update_embed_log(id, EmbedStatus::Completed, None)
                .await?;
            Ok(out)
        }
        Err(e) => {
            engine
                .store()
                .update_embed_log(id, EmbedStatus::Failed, Some(&e.to_string()))
                .await?;
            Err(e.into())
        }
    }
}

/// Embed a query for each requested sector in parallel (no embed log).
pub async fn embed_query_for_sectors(
    engine: &Engine,
    query: &str,
    sectors: &[Sector],
) -> Result<Vec<(Sector, Vec<f32>)>> {
    Ok(embed_each(engine.embedder(), query, sectors).await?)
}

async fn embed_each(
    embedder: Arc<dyn EmbeddingProvider>,
    text: &str,
    sectors: &[Sector],
) -> std::result::Result<Vec<(Sector, Vec<f32>)>, crate::embedding::ProviderError> {
    let mut set = JoinSet::new();
    for (idx, sector) in sectors.iter().enumerate() {
        let embedder = embedder.clone();
        let text = text.to_string();
        let sector = *sector;
        set.spawn(async move {
            let vec = embedder.embed(&text, Some(sector)).await;
            (idx, sector, vec)
        });
    }

    let mut slots: Vec<Option<(Sector, Vec<f32>)>> = vec![None; sectors.len()];
    while let Some(joined) = set.join_next().await {
        let (idx, sector, vec) = joined.map_err(|e| {
            crate::embedding::ProviderError::InvalidResponse {
                provider: "failover",
                message: format!("embed task aborted: {e}"),
            }
        })?;
        slots[idx] = Some((sector, vec?));
    }
    Ok(slots.into_iter().flatten().collect())
}

/// Batch embedding for bulk ingest: one provider batch call per sector, each
/// item receiving vectors for its own sector list. Logs one row per item.
pub async fn embed_batch_multi_sector(
    engine: &Engine,
    items: &[(String, String, Vec<Sector>)], // (id, content, sectors)
    user_id: Option<&str>,
) -> Result<Vec<Vec<(Sector, Vec<f32>)>>> {
    if items.is_empty() {
        return Ok(vec![]);
    }
    let ts = now_ms();
    for (id, _, _) in items {
        engine
            .store()
            .insert_embed_log(&EmbedLog {
                id: id.clone(),
                model: "multi-sector-batch".to_string(),
                status: EmbedStatus::Pending,
                ts,
                err: None,
                user_id: user_id.map(str::to_string),
            })
            .await?;
    }

    // Group item indices by sector so each sector is one batch call
    let mut by_sector: HashMap<Sector, Vec<usize>> = HashMap::new();
    for (idx, (_, _, sectors)) in items.iter().enumerate() {
        for s in sectors {
            by_sector.entry(*s).or_default().push(idx);
        }
    }

    let mut set = JoinSet::new();
    for (sector, idxs) in by_sector {
        let embedder = engine.embedder();
        let texts: Vec<String> = idxs.iter().map(|i| items[*i].1.clone()).collect();
        set.spawn(async move {
            let vecs = embedder.embed_batch(&texts, Some(sector)).await;
            (sector, idxs, vecs)
        });
    }

    let mut results: Vec<Vec<(Sector, Vec<f32>)>> = vec![Vec::new(); items.len()];
    let mut failure = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((sector, idxs, Ok(vecs))) => {
                for (slot, vec) in idxs.into_iter().zip(vecs) {
                    results[slot].push((sector, vec));
                }
            }
            Ok((_, _, Err(e))) => failure = Some(e.to_string()),
            Err(e) => failure = Some(format!("embed task aborted: {e}")),
        }
    }

    let (status, err) = match &failure {
        None => (EmbedStatus::Completed, None),
        Some(e) => (EmbedStatus::Failed, Some(e.as_str())),
    };
    for (id, _, _) in items {
        engine.store().update_embed_log(id, status, err).await?;
    }
    if let Some(e) = failure {
        return Err(crate::engine::EngineError::Validation(format!(
            "batch embedding failed: {e}"
        )));
    }
    Ok(results)
}
