//! Learned per-user classifier
//!
//! A softmax linear model over the fused mean vector, trained by SGD on
//! `(mean_vec, primary_sector)` samples accumulated for each user. Kept
//! deliberately small: five classes, one weight vector each, versioned rows
//! in the learned_models table, and a short-lived in-memory cache.

use crate::types::{now_ms, ClassifierModel, Sector};
use lru::LruCache;
use rand::Rng;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// SGD learning rate
pub const LEARN_RATE: f32 = 0.01;
/// Epochs per training cycle
pub const TRAIN_EPOCHS: usize = 20;
/// Posterior floor for additional sectors
const ADDITIONAL_MIN_PROB: f64 = 0.2;
/// Cached models expire after this long
const CACHE_TTL_MS: i64 = 60_000;
const CACHE_CAPACITY: usize = 100;

/// Prediction from the learned model.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub primary: Sector,
    pub additional: Vec<Sector>,
    pub confidence: f64,
}

// ============================================================================
// PREDICT
// ============================================================================

/// Score a fused mean vector against the model. Dimension mismatches (from a
/// provider change) degrade to the common prefix rather than erroring.
pub fn predict(vector: &[f32], model: &ClassifierModel) -> Prediction {
    let mut scores: Vec<(String, f64)> = Vec::with_capacity(model.weights.len());
    for (sector, w) in &model.weights {
        let bias = model.biases.get(sector).copied().unwrap_or(0.0) as f64;
        let n = vector.len().min(w.len());
        let dot: f64 = vector[..n]
            .iter()
            .zip(&w[..n])
            .map(|(a, b)| (*a as f64) * (*b as f64))
            .sum();
        scores.push((sector.clone(), dot + bias));
    }

    if scores.is_empty() {
        return Prediction {
            primary: Sector::Semantic,
            additional: vec![],
            confidence: 0.0,
        };
    }

    // Softmax with max-shift for stability
    let max_sc = scores.iter().map(|(_, s)| *s).fold(f64::MIN, f64::max);
    let exp: Vec<(String, f64)> = scores
        .into_iter()
        .map(|(s, sc)| (s, (sc - max_sc).exp()))
        .collect();
    let sum: f64 = exp.iter().map(|(_, e)| e).sum();
    let mut probs: Vec<(String, f64)> = exp
        .into_iter()
        .map(|(s, e)| (s, if sum > 0.0 { e / sum } else { 0.0 }))
        .collect();
    probs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let primary = Sector::parse_name(&probs[0].0);
    let additional = probs[1..]
        .iter()
        .take(2)
        .filter(|(_, p)| *p > ADDITIONAL_MIN_PROB)
        .map(|(s, _)| Sector::parse_name(s))
        .collect();

    Prediction {
        primary,
        additional,
        confidence: probs[0].1,
    }
}

// ============================================================================
// TRAIN
// ============================================================================

/// One labelled sample: a fused mean vector and the sector it was stored as.
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub vector: Vec<f32>,
    pub label: Sector,
}

/// Multinomial logistic regression by SGD. Starts from `existing` when given
/// so repeated cycles refine rather than restart; unseen sectors get a small
/// random init. The returned model's version is bumped by one.
pub fn train(
    samples: &[TrainingSample],
    existing: Option<&ClassifierModel>,
    lr: f32,
    epochs: usize,
) -> ClassifierModel {
    if samples.is_empty() {
        return existing.cloned().unwrap_or(ClassifierModel {
            weights: HashMap::new(),
            biases: HashMap::new(),
            version: 1,
            updated_at: now_ms(),
        });
    }

    let dim = samples[0].vector.len();
    let mut weights: HashMap<String, Vec<f32>> =
        existing.map(|m| m.weights.clone()).unwrap_or_default();
    let mut biases: HashMap<String, f32> =
        existing.map(|m| m.biases.clone()).unwrap_or_default();

    let mut sectors: Vec<String> = weights.keys().cloned().collect();
    for s in samples {
        let name = s.label.as_str().to_string();
        if !sectors.contains(&name) {
            sectors.push(name);
        }
    }

    let mut rng = rand::rng();
    for sector in &sectors {
        weights
            .entry(sector.clone())
            .or_insert_with(|| (0..dim).map(|_| (rng.random::<f32>() - 0.5) * 0.01).collect());
        biases.entry(sector.clone()).or_insert(0.0);
    }

    for _ in 0..epochs {
        for sample in samples {
            let n = dim.min(sample.vector.len());

            // Forward pass
            let mut scores: Vec<f32> = sectors
                .iter()
                .map(|s| {
                    let w = &weights[s];
                    let m = n.min(w.len());
                    let dot: f32 = sample.vector[..m].iter().zip(&w[..m]).map(|(a, b)| a * b).sum();
                    dot + biases[s]
                })
                .collect();
            let max_sc = scores.iter().cloned().fold(f32::MIN, f32::max);
            for s in scores.iter_mut() {
                *s = (*s - max_sc).exp();
            }
            let sum: f32 = scores.iter().sum();
            if sum <= 0.0 {
                continue;
            }

            // Backward pass
            for (i, sector) in sectors.iter().enumerate() {
                let prob = scores[i] / sum;
                let target = if sector == sample.label.as_str() { 1.0 } else { 0.0 };
                let error = prob - target;
                let w = weights.get_mut(sector).expect("sector initialized above");
                let m = n.min(w.len());
                for (wi, xi) in w[..m].iter_mut().zip(&sample.vector[..m]) {
                    *wi -= lr * error * xi;
                }
                *biases.get_mut(sector).expect("sector initialized above") -= lr * error;
            }
        }
    }

    ClassifierModel {
        weights,
        biases,
        version: existing.map(|m| m.version).unwrap_or(0) + 1,
        updated_at: now_ms(),
    }
}

// ============================================================================
// MODEL CACHE
// ============================================================================

/// TTL'd per-user model cache so the query path does not hit the models table
/// on every call.
pub struct ClassifierCache {
    inner: Mutex<LruCache<String, (ClassifierModel, i64)>>,
}

impl Default for ClassifierCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassifierCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    pub fn get(&self, user_id: &str) -> Option<ClassifierModel> {
        let mut cache = self.inner.lock().ok()?;
        match cache.get(user_id) {
            Some((model, ts)) if now_ms() - *ts < CACHE_TTL_MS => Some(model.clone()),
            Some(_) => {
                cache.pop(user_id);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, user_id: &str, model: ClassifierModel) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(user_id.to_string(), (model, now_ms()));
        }
    }

    /// Drop a user's entry, e.g. right after retraining
    pub fn invalidate(&self, user_id: &str) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.pop(user_id);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hot(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_train_separable_data() {
        // Episodic lives on axis 0, procedural on axis 1
        let mut samples = Vec::new();
        for _ in 0..20 {
            samples.push(TrainingSample {
                vector: one_hot(8, 0),
                label: Sector::Episodic,
            });
            samples.push(TrainingSample {
                vector: one_hot(8, 1),
                label: Sector::Procedural,
            });
        }
        let model = train(&samples, None, LEARN_RATE, TRAIN_EPOCHS);
        assert_eq!(model.version, 1);

        let p = predict(&one_hot(8, 0), &model);
        assert_eq!(p.primary, Sector::Episodic);
        assert!(p.confidence > 0.5);

        let p = predict(&one_hot(8, 1), &model);
        assert_eq!(p.primary, Sector::Procedural);
    }

    #[test]
    fn test_retrain_bumps_version() {
        let samples = vec![TrainingSample {
            vector: one_hot(4, 0),
            label: Sector::Semantic,
        }];
        let m1 = train(&samples, None, LEARN_RATE, 2);
        let m2 = train(&samples, Some(&m1), LEARN_RATE, 2);
        assert_eq!(m2.version, m1.version + 1);
    }

    #[test]
    fn test_predict_empty_model() {
        let model = ClassifierModel {
            weights: HashMap::new(),
            biases: HashMap::new(),
            version: 1,
            updated_at: 0,
        };
        let p = predict(&[1.0, 2.0], &model);
        assert_eq!(p.primary, Sector::Semantic);
        assert_eq!(p.confidence, 0.0);
    }

    #[test]
    fn test_predict_dimension_mismatch_degrades() {
        let mut weights = HashMap::new();
        weights.insert("episodic".to_string(), vec![1.0, 0.0, 0.0, 0.0]);
        weights.insert("semantic".to_string(), vec![0.0, 1.0, 0.0, 0.0]);
        let model = ClassifierModel {
            weights,
            biases: HashMap::new(),
            version: 1,
            updated_at: 0,
        };
        // Shorter query vector than model weights
        let p = predict(&[1.0, 0.0], &model);
        assert_eq!(p.primary, Sector::Episodic);
    }

    #[test]
    fn test_cache_ttl_and_invalidate() {
        let cache = ClassifierCache::new();
        let model = ClassifierModel {
            weights: HashMap::new(),
            biases: HashMap::new(),
            version: 3,
            updated_at: 0,
        };
        cache.put("u1", model);
        assert_eq!(cache.get("u1").unwrap().version, 3);
        cache.invalidate("u1");
        assert!(cache.get("u1").is_none());
    }
}
