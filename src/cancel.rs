use tokio::sync::watch;

/// Creates a linked cancellation pair. The gateway keeps the handle and passes
/// the token along with the request; cancelling is a one-way, idempotent edge.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
  let (tx, rx) = watch::channel(false);
  (CancelHandle(tx), CancelToken(Some(rx)))
}

/// Caller-side handle used to cancel an in-flight disbursement.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
  pub fn cancel(&self) {
    // Receivers may already be gone if the request finished first.
    let _ = self.0.send(true);
  }
}

/// Cancellation signal observed by the engine between unit steps.
#[derive(Debug, Clone)]
pub struct CancelToken(Option<watch::Receiver<bool>>);

impl CancelToken {
  /// A token that never signals cancellation, for callers without a deadline.
  pub fn never() -> Self {
    CancelToken(None)
  }

  pub fn is_cancelled(&self) -> bool {
    match &self.0 {
      Some(rx) => *rx.borrow(),
      None => false,
    }
  }
}
