//! Sector classification
//!
//! Two stages: a regex pattern bank scores content against the five sectors,
//! and an optional per-user learned linear model refines the result from the
//! fused mean vector once enough training data exists.

mod learned;
mod patterns;

pub use learned::{
    predict, train, ClassifierCache, Prediction, TrainingSample, LEARN_RATE, TRAIN_EPOCHS,
};
pub use patterns::{classify_content, Classification};
