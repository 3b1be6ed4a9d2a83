//! Cooperative cancellation shared between the importer and the validator.

use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

use crate::{Error, Result};

#[derive(Debug, Default)]
struct Inner {
  cancelled: AtomicBool,
  notify:    Notify,
}

/// A cloneable cancellation flag.
///
/// Synchronous code polls [`CancelToken::check`] between units of work;
/// async code can await [`CancelToken::cancelled`]. Once fired a token stays
/// fired.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
  inner: Arc<Inner>,
}

impl CancelToken {
  pub fn new() -> Self { Self::default() }

  /// Fire the token, waking every task awaiting [`CancelToken::cancelled`].
  pub fn cancel(&self) {
    if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
      self.inner.notify.notify_waiters();
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::SeqCst)
  }

  /// `Err(Error::Cancelled)` once the token has fired.
  pub fn check(&self) -> Result<()> {
    if self.is_cancelled() {
      Err(Error::Cancelled)
    } else {
      Ok(())
    }
  }

  /// Resolves when the token fires. Returns immediately if it already has.
  pub async fn cancelled(&self) {
    loop {
      // Register before checking the flag so a concurrent `cancel` is not
      // lost between the check and the await.
      let notified = self.inner.notify.notified();
      if self.is_cancelled() {
        return;
      }
      notified.await;
    }
  }
}
