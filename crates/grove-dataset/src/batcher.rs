//! Mini-batch assembly and cross-rank sharding.

use grove_core::matrix::local_mat;
use grove_core::{GroveError, LocalMat, Result};

use crate::reader::DataReader;

/// One rank's share of a global mini-batch.
pub struct Batch {
    /// Local (feature x sample) matrix. May have zero columns when the
    /// trailing partial batch leaves this rank without samples.
    pub samples: LocalMat<f32>,
    /// Global indices of the local samples, in column order.
    pub indices: Vec<usize>,
    /// Number of samples in the batch across all ranks. Gradient deposits
    /// are scaled by this, not by the local width.
    pub effective_size: usize,
}

/// Deals global mini-batches out to ranks round-robin.
///
/// Batch `b` covers the global indices `[b * batch_size, ...)` clipped to
/// the dataset; rank `r` of `n` takes every index congruent to `r` mod `n`.
pub struct Batcher {
    global_batch_size: usize,
    rank: usize,
    num_ranks: usize,
}

impl Batcher {
    pub fn new(global_batch_size: usize, rank: usize, num_ranks: usize) -> Result<Self> {
        if global_batch_size == 0 {
            return Err(GroveError::invalid_argument(
                "Batcher::new",
                "global batch size must be positive",
            ));
        }
        if num_ranks == 0 || rank >= num_ranks {
            return Err(GroveError::invalid_argument(
                "Batcher::new",
                format!("rank {} is out of range for {} ranks", rank, num_ranks),
            ));
        }
        Ok(Self {
            global_batch_size,
            rank,
            num_ranks,
        })
    }

    /// Number of batches in one epoch over `reader`, counting the trailing
    /// partial batch.
    pub fn num_batches(&self, reader: &dyn DataReader) -> usize {
        reader.num_samples().div_ceil(self.global_batch_size)
    }

    /// Assembles this rank's shard of batch `batch_index`.
    pub fn next_batch(&self, reader: &dyn DataReader, batch_index: usize) -> Result<Batch> {
        let start = batch_index * self.global_batch_size;
        if start >= reader.num_samples() {
            return Err(GroveError::invalid_argument(
                "Batcher::next_batch",
                format!(
                    "batch {} starts past the dataset ({} samples)",
                    batch_index,
                    reader.num_samples()
                ),
            ));
        }
        let end = (start + self.global_batch_size).min(reader.num_samples());
        let effective_size = end - start;

        let indices: Vec<usize> = (start..end)
            .filter(|i| (i - start) % self.num_ranks == self.rank)
            .collect();
        if indices.is_empty() {
            log::debug!(
                "rank {}/{} holds no samples of batch {}",
                self.rank,
                self.num_ranks,
                batch_index
            );
        }

        let sample_size = reader.sample_size();
        let mut samples = local_mat::<f32>(sample_size, indices.len());
        for (col, &index) in indices.iter().enumerate() {
            let mut column = samples.column_mut(col);
            let slice = column.as_slice_mut().ok_or_else(|| {
                GroveError::invalid_argument("Batcher::next_batch", "sample column is not contiguous")
            })?;
            reader.fetch(index, slice)?;
        }

        Ok(Batch {
            samples,
            indices,
            effective_size,
        })
    }
}
