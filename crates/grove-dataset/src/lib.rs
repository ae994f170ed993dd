//! Data readers and mini-batch assembly for grove.
//!
//! Readers produce fixed-size sample vectors by index; the [`Batcher`] packs
//! a rank's share of each global mini-batch into a local (feature x sample)
//! matrix. Samples are dealt round-robin across ranks, so the trailing
//! partial batch of an epoch shrinks some shards and can leave a rank with
//! no local samples at all. Downstream compute treats an empty shard as a
//! first-class input rather than an error.

pub mod batcher;
pub mod reader;

pub use batcher::{Batch, Batcher};
pub use reader::{DataReader, InMemoryReader, SyntheticReader, SyntheticSpec};

pub use grove_core::{GroveError, LocalMat, Result};
