//! User profile summaries
//!
//! A cheap rolling natural-language summary of what a user's memory store
//! looks like: sector distribution plus the dominant recent keywords.
//! Refreshed in the background after ingest; failures only log.

use crate::engine::{Engine, Result};
use crate::storage::Storage as _;
use crate::text::top_keywords;
use crate::types::{now_ms, Sector};
use std::collections::HashMap;

/// Memories considered for the summary
const SUMMARY_WINDOW: i64 = 50;
/// Keywords surfaced in the summary
const SUMMARY_KEYWORDS: usize = 6;

/// Build the summary text from a user's recent memories.
pub async fn generate_user_summary(engine: &Engine, user_id: &str) -> Result<Option<String>> {
    let mems = engine
        .store()
        .recent_memories(SUMMARY_WINDOW, 0, Some(user_id))
        .await?;
    if mems.is_empty() {
        return Ok(None);
    }

    let mut sector_counts: HashMap<Sector, usize> = HashMap::new();
    let mut corpus = String::new();
    for m in &mems {
        *sector_counts.entry(m.primary_sector).or_insert(0) += 1;
        if let Ok(text) = engine.encryption().decrypt(&m.content) {
            corpus.push_str(&text);
            corpus.push(' ');
        }
    }

    let mut sectors: Vec<(Sector, usize)> = sector_counts.into_iter().collect();
    sectors.sort_by(|a, b| b.1.cmp(&a.1));
    let dominant: Vec<String> = sectors
        .iter()
        .take(2)
        .map(|(s, n)| format!("{s} ({n})"))
        .collect();

    let keywords = top_keywords(&corpus, SUMMARY_KEYWORDS);
    let mut summary = format!(
        "{} memories, mostly {}",
        mems.len(),
        dominant.join(" and ")
    );
    if !keywords.is_empty() {
        summary.push_str(&format!("; recurring topics: {}", keywords.join(", ")));
    }
    Ok(Some(summary))
}

/// Refresh the stored summary for a user. Called from a detached task after
/// ingest; the profile row is created by ingestion before this runs.
pub async fn update_user_summary(engine: &Engine, user_id: &str) -> Result<()> {
    let Some(summary) = generate_user_summary(engine, user_id).await? else {
        return Ok(());
    };
    engine
        .store()
        .update_user_summary(user_id, &summary, now_ms())
        .await?;
    tracing::debug!("[summary] refreshed for {user_id}");
    Ok(())
}
