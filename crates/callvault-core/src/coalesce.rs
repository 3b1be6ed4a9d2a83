//! Hash-keyed deduplication of records across overlapping backups.
//!
//! One [`Coalescer`] is built per entity type for each import run. It is
//! first seeded with the repository's existing records, then fed candidates
//! from new backups; the first record seen for a content hash wins.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{CancelToken, Result, entry::Entry};

// ─── Summary ─────────────────────────────────────────────────────────────────

/// Outcome counts for one entity type.
///
/// `final_count = initial + added` always holds. `rejected` and `errors` are
/// filled in by the importer; the coalescer itself never rejects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
  pub initial:     usize,
  #[serde(rename = "final")]
  pub final_count: usize,
  pub added:       usize,
  pub duplicates:  usize,
  pub rejected:    usize,
  pub errors:      usize,
}

// ─── Coalescer ───────────────────────────────────────────────────────────────

struct Slot<E> {
  entry: E,
  /// Insertion sequence number; breaks timestamp ties.
  seq:   u64,
}

struct State<E> {
  entries:       HashMap<String, Slot<E>>,
  next_seq:      u64,
  initial_count: usize,
  duplicates:    usize,
}

impl<E> Default for State<E> {
  fn default() -> Self {
    Self {
      entries:       HashMap::new(),
      next_seq:      0,
      initial_count: 0,
      duplicates:    0,
    }
  }
}

impl<E: Entry> State<E> {
  fn insert(&mut self, entry: E) -> bool {
    let key = entry.content_hash();
    if self.entries.contains_key(&key) {
      return false;
    }
    let seq = self.next_seq;
    self.next_seq += 1;
    self.entries.insert(key, Slot { entry, seq });
    true
  }

  fn sorted(&self, year: Option<i32>) -> Vec<E> {
    let mut slots: Vec<&Slot<E>> = self
      .entries
      .values()
      .filter(|s| year.is_none_or(|y| s.entry.year() == y))
      .collect();
    slots.sort_by_key(|s| (s.entry.timestamp(), s.seq));
    slots.into_iter().map(|s| s.entry.clone()).collect()
  }
}

/// Deduplicating container keyed by [`Entry::content_hash`].
///
/// Internally synchronised, so a shared reference can be fed from several
/// ingestion threads. Nothing here is persisted; the partition files written
/// from [`Coalescer::all`] are the durable state.
pub struct Coalescer<E> {
  state: RwLock<State<E>>,
}

impl<E> Default for Coalescer<E> {
  fn default() -> Self {
    Self {
      state: RwLock::new(State::default()),
    }
  }
}

impl<E: Entry> Coalescer<E> {
  pub fn new() -> Self { Self::default() }

  /// Seed with records already in the repository. Entries whose hash is
  /// already present are skipped; each net-new insertion counts towards
  /// `initial`. Returns the number inserted.
  pub fn load_existing<I>(&self, entries: I) -> usize
  where
    I: IntoIterator<Item = E>,
  {
    let mut state = self.state.write();
    let mut inserted = 0;
    for entry in entries {
      if state.insert(entry) {
        inserted += 1;
      }
    }
    state.initial_count += inserted;
    inserted
  }

  /// Insert `entry` unless a record with the same hash exists. Returns
  /// `false` (and counts a duplicate) when it was already present.
  pub fn add(&self, entry: E) -> bool {
    let mut state = self.state.write();
    let inserted = state.insert(entry);
    if !inserted {
      state.duplicates += 1;
    }
    inserted
  }

  /// Every record, ascending by timestamp; equal timestamps keep insertion
  /// order.
  pub fn all(&self) -> Vec<E> { self.state.read().sorted(None) }

  /// The records of one calendar year, ordered as in [`Coalescer::all`].
  ///
  /// Sorts the full set on every call; callers writing every year should
  /// call [`Coalescer::all`] once and partition the result instead.
  pub fn by_year(&self, year: i32) -> Vec<E> {
    self.state.read().sorted(Some(year))
  }

  pub fn summary(&self) -> Summary {
    let state = self.state.read();
    let final_count = state.entries.len();
    Summary {
      initial: state.initial_count,
      final_count,
      added: final_count - state.initial_count,
      duplicates: state.duplicates,
      rejected: 0,
      errors: 0,
    }
  }

  pub fn len(&self) -> usize { self.state.read().entries.len() }

  pub fn is_empty(&self) -> bool { self.len() == 0 }

  /// Drop every record and zero the counters.
  pub fn reset(&self) { *self.state.write() = State::default(); }

  // ── Cancellation-aware variants ──────────────────────────────────────────

  /// [`Coalescer::load_existing`], checking `cancel` before each entry.
  /// Entries inserted before cancellation stay inserted and counted.
  pub fn load_existing_with_cancel<I>(
    &self,
    entries: I,
    cancel: &CancelToken,
  ) -> Result<usize>
  where
    I: IntoIterator<Item = E>,
  {
    cancel.check()?;
    let mut state = self.state.write();
    let mut inserted = 0;
    let mut outcome = Ok(());
    for entry in entries {
      if let Err(e) = cancel.check() {
        outcome = Err(e);
        break;
      }
      if state.insert(entry) {
        inserted += 1;
      }
    }
    state.initial_count += inserted;
    outcome.map(|()| inserted)
  }

  pub fn add_with_cancel(&self, entry: E, cancel: &CancelToken) -> Result<bool> {
    cancel.check()?;
    Ok(self.add(entry))
  }

  pub fn all_with_cancel(&self, cancel: &CancelToken) -> Result<Vec<E>> {
    cancel.check()?;
    Ok(self.all())
  }

  pub fn by_year_with_cancel(
    &self,
    year: i32,
    cancel: &CancelToken,
  ) -> Result<Vec<E>> {
    cancel.check()?;
    Ok(self.by_year(year))
  }

  pub fn summary_with_cancel(&self, cancel: &CancelToken) -> Result<Summary> {
    cancel.check()?;
    Ok(self.summary())
  }

  pub fn reset_with_cancel(&self, cancel: &CancelToken) -> Result<()> {
    cancel.check()?;
    self.reset();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::{
    Error,
    record::{CallRecord, Message, test_helpers::*},
  };

  const JAN_2015: i64 = 1_420_070_400_000;
  const JUN_2016: i64 = 1_464_739_200_000;

  #[test]
  fn add_rejects_duplicate_hash() {
    let c = Coalescer::new();
    assert!(c.add(call("100", JAN_2015)));
    assert!(!c.add(call("100", JAN_2015)));
    assert!(c.add(call("101", JAN_2015)));

    let s = c.summary();
    assert_eq!(s.final_count, 2);
    assert_eq!(s.added, 2);
    assert_eq!(s.duplicates, 1);
  }

  #[test]
  fn first_seen_instance_wins() {
    let c = Coalescer::new();
    let mut first = call("100", JAN_2015);
    first.contact_name = Some("First".into());
    let mut second = first.clone();
    second.contact_name = Some("Second".into());

    c.add(first);
    c.add(second);
    assert_eq!(c.all()[0].contact_name.as_deref(), Some("First"));
  }

  #[test]
  fn adding_everything_twice_is_idempotent() {
    let records: Vec<Message> = (0..20)
      .map(|i| sms(&format!("body {i}"), JAN_2015 + (i % 4) * 1000))
      .collect();

    let once = Coalescer::new();
    for r in &records {
      once.add(r.clone());
    }

    let twice = Coalescer::new();
    for r in &records {
      twice.add(r.clone());
    }
    for r in records.iter().rev() {
      twice.add(r.clone());
    }

    assert_eq!(once.all(), twice.all());
    assert_eq!(twice.summary().duplicates, records.len());
  }

  #[test]
  fn equal_timestamps_keep_insertion_order() {
    let c = Coalescer::new();
    // Hash order of these bodies is unrelated to insertion order.
    let bodies = ["zulu", "alpha", "mike", "bravo", "yankee"];
    for b in bodies {
      c.add(sms(b, JAN_2015));
    }
    c.add(sms("earlier", JAN_2015 - 1));

    let got: Vec<String> = c
      .all()
      .into_iter()
      .map(|m| match m {
        Message::Sms(s) => s.body,
        Message::Mms(_) => unreachable!(),
      })
      .collect();
    assert_eq!(got, ["earlier", "zulu", "alpha", "mike", "bravo", "yankee"]);
  }

  #[test]
  fn by_year_is_filtered_all() {
    let c = Coalescer::new();
    c.add(call("a", JUN_2016));
    c.add(call("b", JAN_2015));
    c.add(call("c", JUN_2016 - 5));
    c.add(call("d", JAN_2015 + 5));

    let all = c.all();
    for year in [2015, 2016, 2017] {
      let expected: Vec<CallRecord> =
        all.iter().filter(|r| r.year() == year).cloned().collect();
      assert_eq!(c.by_year(year), expected);
    }
    assert!(c.by_year(2017).is_empty());
  }

  #[test]
  fn load_existing_sets_initial_count() {
    let c = Coalescer::new();
    let existing = vec![
      call("a", JAN_2015),
      call("a", JAN_2015),
      call("b", JAN_2015),
    ];
    assert_eq!(c.load_existing(existing), 2);
    c.add(call("c", JAN_2015));
    c.add(call("b", JAN_2015));

    let s = c.summary();
    assert_eq!(s.initial, 2);
    assert_eq!(s.final_count, 3);
    assert_eq!(s.added, 1);
    assert_eq!(s.duplicates, 1);
  }

  #[test]
  fn reset_clears_everything() {
    let c = Coalescer::new();
    c.load_existing(vec![call("a", JAN_2015)]);
    c.add(call("a", JAN_2015));
    c.reset();
    assert!(c.is_empty());
    assert_eq!(c.summary(), Summary::default());
  }

  #[test]
  fn cancelled_variants_fail_without_mutating() {
    let c = Coalescer::new();
    let token = CancelToken::new();
    token.cancel();

    assert!(matches!(
      c.add_with_cancel(call("a", JAN_2015), &token),
      Err(Error::Cancelled)
    ));
    assert!(matches!(
      c.load_existing_with_cancel(vec![call("b", JAN_2015)], &token),
      Err(Error::Cancelled)
    ));
    assert!(c.all_with_cancel(&token).is_err());
    assert!(c.by_year_with_cancel(2015, &token).is_err());
    assert!(c.summary_with_cancel(&token).is_err());
    assert!(c.reset_with_cancel(&token).is_err());
    assert!(c.is_empty());
  }

  #[test]
  fn concurrent_adds_keep_one_entry_per_hash() {
    let c = Arc::new(Coalescer::new());
    let handles: Vec<_> = (0..4)
      .map(|_| {
        let c = Arc::clone(&c);
        std::thread::spawn(move || {
          for i in 0..50 {
            c.add(call(&i.to_string(), JAN_2015 + i));
          }
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }
    let s = c.summary();
    assert_eq!(s.final_count, 50);
    assert_eq!(s.duplicates, 150);
  }
}
