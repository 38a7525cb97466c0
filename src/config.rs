//! Run configuration: problem sizes, numeric precision and collection parameters

use std::fmt;

use crate::error::{BenchError, Result};

/// Storage precision of the embedding weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    /// 32-bit float weights
    #[default]
    Fp32,
    /// 16-bit float weights (`half::f16`)
    Fp16,
}

impl Precision {
    /// Select precision from the `--fp16` flag
    #[must_use]
    pub fn from_fp16_flag(fp16: bool) -> Self {
        if fp16 {
            Self::Fp16
        } else {
            Self::Fp32
        }
    }

    /// Bytes per stored weight element
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Fp32 => 4,
            Self::Fp16 => 2,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fp32 => write!(f, "fp32"),
            Self::Fp16 => write!(f, "fp16"),
        }
    }
}

/// Optimizer the collection allocates state for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Optimizer {
    /// Plain SGD, no optimizer state
    Sgd,
    /// Approximate row-wise Adagrad, one accumulator per row
    #[default]
    ApproxRowwiseAdagrad,
}

/// Construction parameters of a table-batched embedding collection
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionConfig {
    /// Number of tables (T)
    pub num_tables: usize,
    /// Rows per table (E)
    pub num_embeddings: usize,
    /// Columns per row (D)
    pub embedding_dim: usize,
    /// Optimizer kind
    pub optimizer: Optimizer,
    /// Optimizer learning rate
    pub learning_rate: f32,
    /// Optimizer epsilon
    pub eps: f32,
    /// Stochastic rounding of reduced-precision weight updates
    pub stochastic_rounding: bool,
    /// Weight precision
    pub precision: Precision,
    /// Prefer a memory-footprint oriented allocation over raw speed
    pub managed: bool,
}

impl CollectionConfig {
    /// Total number of weight elements (T × E × D)
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.num_tables * self.num_embeddings * self.embedding_dim
    }

    /// Total number of rows across all tables (T × E)
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.num_tables * self.num_embeddings
    }

    /// Validate sizes
    pub fn validate(&self) -> Result<()> {
        positive("num_tables", self.num_tables)?;
        positive("num_embeddings", self.num_embeddings)?;
        positive("embedding_dim", self.embedding_dim)?;
        if u32::try_from(self.num_rows()).is_err() {
            return Err(BenchError::InvalidArgument(format!(
                "{} rows do not fit 32-bit row offsets",
                self.num_rows()
            )));
        }
        Ok(())
    }
}

/// Parameters of one benchmark run
#[derive(Debug, Clone, PartialEq)]
pub struct BenchConfig {
    /// Batch size (B)
    pub batch_size: usize,
    /// Number of tables (T)
    pub num_tables: usize,
    /// Rows per table (E)
    pub num_embeddings: usize,
    /// Bag length (L)
    pub bag_size: usize,
    /// Embedding dimension (D)
    pub embedding_dim: usize,
    /// Timed iterations per configuration
    pub iters: usize,
    /// Weight precision
    pub precision: Precision,
    /// Managed allocation hint for the collection
    pub managed: bool,
    /// RNG seed; a random seed is drawn when absent
    pub seed: Option<u64>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            num_tables: 64,
            num_embeddings: 10_000,
            bag_size: 32,
            embedding_dim: 32,
            iters: 100,
            precision: Precision::Fp32,
            managed: false,
            seed: None,
        }
    }
}

impl BenchConfig {
    /// Validate sizes before any allocation happens
    pub fn validate(&self) -> Result<()> {
        positive("batch_size", self.batch_size)?;
        positive("num_tables", self.num_tables)?;
        positive("bag_size", self.bag_size)?;
        positive("embedding_dim", self.embedding_dim)?;
        positive("iters", self.iters)?;
        if self.num_embeddings < 2 {
            return Err(BenchError::InvalidArgument(format!(
                "num_embeddings must be >= 2 to draw indices from [0, E-1), got {}",
                self.num_embeddings
            )));
        }
        Ok(())
    }

    /// Collection used by the benchmark: approximate row-wise Adagrad,
    /// learning rate 0.1, eps 0.1, no stochastic rounding
    #[must_use]
    pub fn collection(&self) -> CollectionConfig {
        CollectionConfig {
            num_tables: self.num_tables,
            num_embeddings: self.num_embeddings,
            embedding_dim: self.embedding_dim,
            optimizer: Optimizer::ApproxRowwiseAdagrad,
            learning_rate: 0.1,
            eps: 0.1,
            stochastic_rounding: false,
            precision: self.precision,
            managed: self.managed,
        }
    }

    /// Problem shape used for bandwidth derivation
    #[must_use]
    pub fn shape(&self) -> ProblemShape {
        ProblemShape {
            batch_size: self.batch_size,
            num_tables: self.num_tables,
            bag_size: self.bag_size,
            embedding_dim: self.embedding_dim,
        }
    }
}

/// (B, T, L, D) of one benchmark run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemShape {
    /// Batch size (B)
    pub batch_size: usize,
    /// Number of tables (T)
    pub num_tables: usize,
    /// Bag length (L)
    pub bag_size: usize,
    /// Embedding dimension (D)
    pub embedding_dim: usize,
}

impl ProblemShape {
    /// Number of looked-up rows per call (B × T × L)
    #[must_use]
    pub fn lookups(&self) -> u64 {
        (self.batch_size * self.num_tables * self.bag_size) as u64
    }
}

fn positive(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(BenchError::InvalidArgument(format!(
            "{name} must be >= 1"
        )));
    }
    Ok(())
}
