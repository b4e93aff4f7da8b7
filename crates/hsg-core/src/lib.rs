//! # HSG Core
//!
//! Hierarchical semantic graph memory engine for conversational agents:
//!
//! - **Five cognitive sectors**: episodic, semantic, procedural, emotional,
//!   reflective — a regex pattern bank classifies content, an optional
//!   per-user learned linear model refines it
//! - **Multi-sector embeddings**: one vector per assigned sector plus a
//!   softmax-fused mean vector, from a provider failover chain that always
//!   bottoms out on deterministic synthetic embeddings
//! - **Associative waypoints**: a directed weighted graph linking related
//!   memories, grown at ingest, strengthened by co-activation, traversed at
//!   query time when vector confidence is low
//! - **Salience dynamics**: sector-specific lambda decay with tiered
//!   compression and cold-store fingerprints, trace reinforcement on recall,
//!   regeneration the moment a cold memory is hit again
//! - **Hybrid retrieval**: weighted cosine fusion, cross-sector resonance
//!   and penalties, lexical overlap, recency, tags, z-score normalization
//! - **Encryption at rest**: AES-256-GCM envelopes with key rotation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hsg_core::{Config, Engine, SearchFilters};
//!
//! let engine = Engine::open(Config::load()?).await?;
//! engine.start_background();
//!
//! let outcome = engine
//!     .add("I went to Paris yesterday", Some("alice"), &[], Default::default())
//!     .await?;
//!
//! let filters = SearchFilters { user_id: Some("alice".into()), ..Default::default() };
//! let results = engine.search("paris travel", 10, filters).await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `bundled-sqlite` (default): compile SQLite from the bundled amalgamation
//! - `remote-providers` (default): OpenAI / Gemini / Ollama / Bedrock adapters
//! - `postgres`: external Postgres + pgvector backend

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod classifier;
pub mod config;
pub mod crypto;
pub mod decay;
pub mod dynamics;
pub mod embedding;
pub mod engine;
pub mod hsg;
pub mod maintenance;
pub mod redact;
pub mod reflect;
pub mod storage;
pub mod summary;
pub mod text;
pub mod types;
pub mod vector_store;
pub mod vectors;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// The engine handle and its API types
pub use engine::{Engine, EngineError, EngineStats, Result, RotateOutcome};

// Configuration
pub use config::{BackendKind, Config, Tier};

// Core data model
pub use types::{
    ClassifierModel, EmbedLog, EmbedStatus, IngestOutcome, IngestRequest, MaintLog, MemoryItem,
    MemoryRecord, ScoreBreakdown, SearchFilters, Sector, SectorStat, Trace, UserProfile,
    VectorRecord, Waypoint,
};

// Classification
pub use classifier::{classify_content, Classification};

// Embedding providers
pub use embedding::{
    fused_mean, CircuitBreaker, CircuitState, EmbeddingProvider, ErrorCode, FailoverChain,
    ProviderError, RetryPolicy, SyntheticProvider,
};

// Persistence and vector store seams
pub use storage::{Storage, StorageError, Tables};
pub use vector_store::{VectorFilters, VectorMatch, VectorStore};

// Encryption
pub use crypto::{CryptoError, Encryption};

// Dynamics primitives
pub use dynamics::{
    cross_sector_resonance, hybrid_score, sector_penalty, spreading_activation, trace_reinforce,
    Reinforcement, ScoringWeights,
};

// Decay / reflection surface
pub use decay::{DecayStats, MemoryTier};
pub use reflect::ReflectionOutcome;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cognitive sectors recognized by the engine
pub const SECTOR_COUNT: usize = 5;

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        Config, Engine, EngineError, IngestOutcome, IngestRequest, MemoryItem, Result,
        SearchFilters, Sector, Tier,
    };

    pub use crate::{EmbeddingProvider, SyntheticProvider};
    pub use crate::{Storage, VectorStore};
}
