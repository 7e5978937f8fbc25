use std::collections::BTreeMap;

use crate::models::{PeerId, WorkerCapabilities};

/// Picks the admin from a set of known workers: most GPU memory wins, ties go
/// to the lexicographically smaller peer id. Pure and synchronous, so every
/// replica holding the same worker set computes the same winner without
/// exchanging any messages.
pub fn elect(workers: &BTreeMap<PeerId, WorkerCapabilities>) -> Option<PeerId> {
  workers
    .iter()
    .min_by(|(a_id, a), (b_id, b)| {
      b.gpu_memory_mb
        .cmp(&a.gpu_memory_mb)
        .then_with(|| a_id.cmp(b_id))
    })
    .map(|(id, _)| id.clone())
}
