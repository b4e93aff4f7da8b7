//! Cognitive dynamics primitives
//!
//! The fixed parameter set of the engine (reinforcement rates, expansion
//! decay, co-activation learning rate), the 5x5 sector resonance matrix,
//! cross-sector penalties, the hybrid score, and budgeted spreading
//! activation over the waypoint graph.

use crate::config::Config;
use crate::types::{Sector, Waypoint};
use std::collections::HashMap;
use std::future::Future;

// ============================================================================
// FIXED PARAMETERS
// ============================================================================

/// Non-configurable dynamics constants. Changing these changes retrieval
/// behavior for existing stores, so they are deliberately not env-tunable.
pub mod params {
    /// Similarity boost curvature: `1 - exp(-TAU * sim)`
    pub const TAU: f64 = 3.0;
    /// Softmax temperature for the fused mean vector
    pub const BETA: f64 = 2.0;
    /// Co-activation learning rate
    pub const ETA_COACTIVATION: f64 = 0.1;
    /// Attenuation constant for associative propagation
    pub const GAMMA_PROPAGATION: f64 = 0.2;
    /// Co-activation temporal window, hours
    pub const COACTIVATION_TAU_HOURS: f64 = 1.0;
    /// Numerical floor for normalization
    pub const EPSILON: f64 = 1e-8;
    /// Trace reinforcement factor applied to retrieved memories
    pub const TRACE_ETA: f64 = 0.18;
    /// Salience bump when a cold memory is hit and regenerated
    pub const QUERY_HIT_BOOST: f64 = 0.5;
    /// Salience bump applied to the surviving row on deduplication
    pub const DEDUP_BOOST: f64 = 0.15;
    /// Simhash Hamming distance at or below which content deduplicates
    pub const HAMMING_THRESHOLD: u32 = 3;
    /// Per-hop decay during waypoint BFS expansion
    pub const WAYPOINT_DECAY: f64 = 0.8;
    /// Expansion stops below this propagated weight
    pub const EXPANSION_MIN_WEIGHT: f64 = 0.1;
    /// EMA factor for feedback_score updates
    pub const FEEDBACK_EMA_ALPHA: f64 = 0.1;
    /// Time decay of context propagation, per day
    pub const PROPAGATION_DECAY_LAMBDA: f64 = 0.02;
    /// Spreading activation node cap
    pub const MAX_ACTIVATED_NODES: usize = 2000;
    /// Spreading activation edge-fetch budget
    pub const TRAVERSAL_BUDGET: usize = 10_000;
    /// Average top similarity below which waypoint expansion kicks in
    pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.55;
}

// ============================================================================
// WEIGHT BUNDLES
// ============================================================================

/// Hybrid score feature weights, read once from config.
#[derive(Debug, Clone, Copy)]
pub struct ScoringWeights {
    pub similarity: f64,
    pub overlap: f64,
    pub waypoint: f64,
    pub recency: f64,
    pub tag_match: f64,
}

impl ScoringWeights {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            similarity: cfg.scoring_similarity,
            overlap: cfg.scoring_overlap,
            waypoint: cfg.scoring_waypoint,
            recency: cfg.scoring_recency,
            tag_match: cfg.scoring_tag_match,
        }
    }
}

/// Reinforcement caps and boosts, read once from config.
#[derive(Debug, Clone, Copy)]
pub struct Reinforcement {
    pub salience_boost: f64,
    pub waypoint_boost: f64,
    pub max_salience: f64,
    pub max_waypoint_weight: f64,
    pub prune_threshold: f64,
}

impl Reinforcement {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            salience_boost: cfg.reinf_salience_boost,
            waypoint_boost: cfg.reinf_waypoint_boost,
            max_salience: cfg.reinf_max_salience,
            max_waypoint_weight: cfg.reinf_max_waypoint_weight,
            prune_threshold: cfg.reinf_prune_threshold,
        }
    }
}

// ============================================================================
// SECTOR RESONANCE
// ============================================================================

/// Sectoral interdependence matrix, indexed by `Sector::matrix_index`
/// (episodic, semantic, procedural, emotional, reflective).
const RESONANCE_MATRIX: [[f64; 5]; 5] = [
    [1.0, 0.7, 0.3, 0.6, 0.6],
    [0.7, 1.0, 0.4, 0.7, 0.8],
    [0.3, 0.4, 1.0, 0.5, 0.2],
    [0.6, 0.7, 0.5, 1.0, 0.8],
    [0.6, 0.8, 0.2, 0.8, 1.0],
];

/// Scale a base similarity by how strongly the memory's sector resonates
/// with the query's sector.
pub fn cross_sector_resonance(memory: Sector, query: Sector, base: f64) -> f64 {
    base * RESONANCE_MATRIX[memory.matrix_index()][query.matrix_index()]
}

/// Penalty multiplier applied when a memory's primary sector does not match
/// the query's primary (and is not among the query's additional sectors).
pub fn sector_penalty(query: Sector, memory: Sector) -> f64 {
    use Sector::*;
    match (query, memory) {
        (Episodic, Episodic)
        | (Semantic, Semantic)
        | (Procedural, Procedural)
        | (Emotional, Emotional)
        | (Reflective, Reflective) => 1.0,
        (Episodic, Reflective) => 0.8,
        (Episodic, Semantic) => 0.6,
        (Episodic, Procedural) => 0.6,
        (Episodic, Emotional) => 0.7,
        (Semantic, Procedural) => 0.8,
        (Semantic, Episodic) => 0.6,
        (Semantic, Reflective) => 0.7,
        (Semantic, Emotional) => 0.4,
        (Procedural, Semantic) => 0.8,
        (Procedural, Episodic) => 0.6,
        (Procedural, Reflective) => 0.6,
        (Procedural, Emotional) => 0.3,
        (Emotional, Episodic) => 0.7,
        (Emotional, Reflective) => 0.6,
        (Emotional, Semantic) => 0.4,
        (Emotional, Procedural) => 0.3,
        (Reflective, Episodic) => 0.8,
        (Reflective, Semantic) => 0.7,
        (Reflective, Procedural) => 0.6,
        (Reflective, Emotional) => 0.6,
    }
}

// ============================================================================
// SCORING
// ============================================================================

/// Numerically safe logistic
pub fn sigmoid(x: f64) -> f64 {
    if x.is_nan() {
        return 0.5;
    }
    if x < -40.0 {
        return 0.0;
    }
    if x > 40.0 {
        return 1.0;
    }
    1.0 / (1.0 + (-x).exp())
}

/// Concave similarity boost: rewards any signal, saturates near 1
#[inline]
pub fn boosted_sim(sim: f64) -> f64 {
    1.0 - (-params::TAU * sim).exp()
}

/// Exponential recency on hours since last_seen_at
pub fn recency_score(last_seen_at: i64, now_ms: i64) -> f64 {
    let hours = (now_ms - last_seen_at).max(0) as f64 / 3_600_000.0;
    (-0.05 * hours).exp()
}

/// The hybrid retrieval score: weighted feature sum squashed through a
/// sigmoid. `keyword_score` is the tier=hybrid lexical boost, already scaled.
pub fn hybrid_score(
    w: &ScoringWeights,
    sim: f64,
    token_overlap: f64,
    waypoint_weight: f64,
    recency: f64,
    keyword_score: f64,
    tag_match: f64,
) -> f64 {
    let raw = w.similarity * boosted_sim(sim)
        + w.overlap * token_overlap
        + w.waypoint * waypoint_weight
        + w.recency * recency
        + w.tag_match * tag_match
        + keyword_score;
    sigmoid(raw)
}

// ============================================================================
// REINFORCEMENT
// ============================================================================

/// New salience after a successful retrieval (trace learning):
/// `sal + eta * (1 - sal)`, capped at 1.
pub fn trace_reinforce(salience: f64) -> f64 {
    (salience + params::TRACE_ETA * (1.0 - salience)).min(1.0)
}

/// Salience updates for neighbors of a reinforced source node. Each linked
/// node gains `eta * edge_weight * source_salience`, capped at 1.
pub fn propagate_reinforcement(
    source_salience: f64,
    neighbors: &[(String, f64, f64)], // (node_id, edge_weight, current_salience)
) -> Vec<(String, f64)> {
    neighbors
        .iter()
        .map(|(id, weight, current)| {
            let pr = params::TRACE_ETA * weight * source_salience;
            (id.clone(), (current + pr).min(1.0))
        })
        .collect()
}

/// Co-activation edge update: `w + eta * (1 - w) * exp(-dt/tau)`, capped at 1.
pub fn coactivation_weight(current: f64, dt_ms: i64) -> f64 {
    let tau_ms = params::COACTIVATION_TAU_HOURS * 3_600_000.0;
    let temporal = (-(dt_ms.unsigned_abs() as f64) / tau_ms).exp();
    (current + params::ETA_COACTIVATION * (1.0 - current) * temporal).min(1.0)
}

// ============================================================================
// SPREADING ACTIVATION
// ============================================================================

/// Budgeted spreading activation across the waypoint graph. Seeds start at
/// energy 1.0; each iteration propagates `weight * energy * exp(-gamma*hop)`
/// to neighbors, keeping the max energy per node. Bounded by the node cap and
/// a total edge-fetch budget so a dense graph cannot run away.
///
/// `fetch` returns the outgoing waypoints of a batch of source ids.
pub async fn spreading_activation<F, Fut, E>(
    seed_ids: &[String],
    max_iterations: usize,
    mut fetch: F,
) -> Result<HashMap<String, f64>, E>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = Result<Vec<Waypoint>, E>>,
{
    let mut activation: HashMap<String, f64> =
        seed_ids.iter().map(|id| (id.clone(), 1.0)).collect();
    let mut budget = params::TRAVERSAL_BUDGET as i64;

    for hop in 0..max_iterations {
        let mut batch: Vec<(String, f64)> = activation
            .iter()
            .filter(|(_, e)| **e >= 0.05)
            .map(|(id, e)| (id.clone(), *e))
            .collect();
        if batch.is_empty() || budget <= 0 {
            break;
        }
        batch.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        batch.truncate(500);

        let edges = fetch(batch.iter().map(|(id, _)| id.clone()).collect()).await?;
        budget -= edges.len() as i64;

        let mut by_src: HashMap<&str, Vec<&Waypoint>> = HashMap::new();
        for wp in &edges {
            by_src.entry(wp.src_id.as_str()).or_default().push(wp);
        }

        let attenuation = (-params::GAMMA_PROPAGATION * (hop + 1) as f64).exp();
        let mut changed = false;
        let mut updates: HashMap<String, f64> = HashMap::new();
        for (node_id, energy) in &batch {
            if let Some(neighbors) = by_src.get(node_id.as_str()) {
                for wp in neighbors {
                    let propagated = wp.weight * energy * attenuation;
                    let slot = updates.entry(wp.dst_id.clone()).or_insert(0.0);
                    *slot += propagated;
                }
            }
        }
        for (id, energy) in updates {
            let current = activation.get(&id).copied().unwrap_or(0.0);
            if energy > current {
                activation.insert(id, energy);
                changed = true;
            }
        }
        if !changed {
            break;
        }

        if activation.len() > params::MAX_ACTIVATED_NODES {
            let mut nodes: Vec<(String, f64)> = activation.into_iter().collect();
            nodes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            nodes.truncate(params::MAX_ACTIVATED_NODES);
            activation = nodes.into_iter().collect();
        }
    }

    Ok(activation)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resonance_diagonal_is_identity() {
        for s in Sector::ALL {
            assert!((cross_sector_resonance(s, s, 0.8) - 0.8).abs() < 1e-9);
        }
    }

    #[test]
    fn test_sector_penalty_symmetry_not_required() {
        assert!((sector_penalty(Sector::Semantic, Sector::Emotional) - 0.4).abs() < 1e-9);
        assert!((sector_penalty(Sector::Emotional, Sector::Semantic) - 0.4).abs() < 1e-9);
        assert!((sector_penalty(Sector::Procedural, Sector::Emotional) - 0.3).abs() < 1e-9);
        assert_eq!(sector_penalty(Sector::Episodic, Sector::Episodic), 1.0);
    }

    #[test]
    fn test_sigmoid_bounds() {
        assert_eq!(sigmoid(f64::NAN), 0.5);
        assert_eq!(sigmoid(-100.0), 0.0);
        assert_eq!(sigmoid(100.0), 1.0);
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_trace_reinforce_monotone_capped() {
        let mut s = 0.2;
        for _ in 0..100 {
            let next = trace_reinforce(s);
            assert!(next >= s);
            assert!(next <= 1.0);
            s = next;
        }
        assert!(s > 0.99);
    }

    #[test]
    fn test_coactivation_weight_stays_in_bounds() {
        let mut w = 0.0;
        for _ in 0..1000 {
            w = coactivation_weight(w, 0);
            assert!((0.0..=1.0).contains(&w));
        }
        // Distant-in-time pairs barely move
        let far = coactivation_weight(0.5, 100 * 3_600_000);
        assert!((far - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_propagation_capped() {
        let updates = propagate_reinforcement(
            1.0,
            &[("a".into(), 1.0, 0.95), ("b".into(), 0.5, 0.1)],
        );
        assert_eq!(updates[0].1, 1.0);
        assert!((updates[1].1 - (0.1 + 0.18 * 0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_hybrid_score_orders_features() {
        let w = ScoringWeights {
            similarity: 1.0,
            overlap: 0.5,
            waypoint: 0.3,
            recency: 0.2,
            tag_match: 0.4,
        };
        let strong = hybrid_score(&w, 0.9, 0.8, 0.5, 0.9, 0.0, 0.5);
        let weak = hybrid_score(&w, 0.1, 0.0, 0.0, 0.1, 0.0, 0.0);
        assert!(strong > weak);
        assert!(strong > 0.0 && strong < 1.0);
    }

    #[tokio::test]
    async fn test_spreading_activation_propagates_and_attenuates() {
        // a -> b (0.9), b -> c (0.9)
        let edges = vec![
            Waypoint {
                src_id: "a".into(),
                dst_id: "b".into(),
                user_id: "u".into(),
                weight: 0.9,
                created_at: 0,
                updated_at: 0,
            },
            Waypoint {
                src_id: "b".into(),
                dst_id: "c".into(),
                user_id: "u".into(),
                weight: 0.9,
                created_at: 0,
                updated_at: 0,
            },
        ];
        let act = spreading_activation(&["a".to_string()], 3, |srcs| {
            let hits: Vec<Waypoint> = edges
                .iter()
                .filter(|w| srcs.contains(&w.src_id))
                .cloned()
                .collect();
            async move { Ok::<_, std::convert::Infallible>(hits) }
        })
        .await
        .unwrap();

        assert_eq!(act.get("a"), Some(&1.0));
        let b = act.get("b").copied().unwrap();
        let c = act.get("c").copied().unwrap_or(0.0);
        assert!(b > c);
        assert!(b < 1.0);
    }
}
