//! Dataset ingestion and normalization (C2, §4.2).

pub mod calendar;
pub mod ingest;

pub use ingest::{declared_bar_seconds, ingest_csv, IngestedDataset, SourceDeclaration};

use crate::domain::{Candle, DatasetMetadata};

/// An immutable, already-normalized candle sequence plus its provenance.
/// Produced once by [`ingest_csv`] and never mutated; `slice` returns a new
/// view rather than editing in place, so every indicator/strategy stage
/// downstream sees the same frozen input regardless of call order.
#[derive(Debug, Clone)]
pub struct Dataset {
    candles: Vec<Candle>,
    pub metadata: DatasetMetadata,
}

impl Dataset {
    pub fn new(candles: Vec<Candle>, metadata: DatasetMetadata) -> Self {
        Self { candles, metadata }
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    /// Return the candles with `start_ms <= ts <= end_ms`, inclusive, as a
    /// new immutable view. Does not recompute `metadata.data_hash` — the
    /// hash identifies the full ingested frame, not a requested window.
    pub fn slice(&self, start_ms: i64, end_ms: i64) -> Vec<Candle> {
        self.candles
            .iter()
            .copied()
            .filter(|c| c.ts >= start_ms && c.ts <= end_ms)
            .collect()
    }
}

impl From<IngestedDataset> for Dataset {
    fn from(ingested: IngestedDataset) -> Self {
        Self {
            candles: ingested.candles,
            metadata: ingested.metadata,
        }
    }
}
