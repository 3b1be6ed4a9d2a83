use std::{collections::BTreeMap, time::Duration};

use serde::Serialize;

use crate::Phase;

/// Timings and cache counters for the most recent run of a
/// [`Validator`](crate::Validator). Each run overwrites the previous values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationMetrics {
  /// Only phases that ran to completion appear here.
  pub phase_durations: BTreeMap<Phase, Duration>,
  pub total:           Duration,
  pub cache_hits:      u64,
  pub cache_misses:    u64,
}
