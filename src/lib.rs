use thiserror::Error;

/// Binary descriptor capability required by the vocabulary.
pub mod desc;
pub use desc::{Desc, Descriptor};

/// Sparse bag-of-words vectors and direct index.
pub mod bow;
pub use bow::{BowVector, FeatureVector, LNorm};

/// Similarity metrics between bag-of-words vectors.
pub mod scoring;
pub use scoring::ScoringType;

/// Implementation of a visual bag-of-words vocabulary tree,
/// which provides the main functionality of this crate.
pub mod vocab;
pub use vocab::{VocabStats, Vocabulary, VocabularyParams, WeightingType};

/// Inverted-index image database built on a vocabulary.
pub mod database;
pub use database::{Database, DatabaseEntry, QueryOptions, QueryResult, SharedDatabase};

/// Persisted document format for vocabularies and databases.
pub mod storage;
pub use storage::Format;

/// Id of a node in the vocabulary tree arena. The root is always 0.
pub type NodeId = u32;

/// Id of a visual word (leaf) in the vocabulary. Dense in `0..num_words`.
pub type WordId = u32;

/// Id of an image stored in a [`Database`]. Monotonic, never reused.
pub type ImageId = u32;

/// Weight of a word in a bag-of-words vector.
pub type WordValue = f64;

pub type BowResult<T> = std::result::Result<T, BowErr>;

#[derive(Error, Debug)]
pub enum BowErr {
    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "bincode")]
    #[error("Binary serialization error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Json serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Descriptor dimension mismatch: expected {expected} bits, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Vocabulary is not built")]
    NotBuilt,
    #[error("Malformed document: {0}")]
    Serialization(String),
    #[error("Image {0} not found")]
    NotFound(ImageId),
    #[error("Vocabulary build cancelled")]
    Cancelled,
}

impl BowErr {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Serialization(reason.into())
    }
}
