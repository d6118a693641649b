use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long a cancelled stage gets to wind down before it is abandoned.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> CancelToken {
    CancelToken::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::Relaxed);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::Relaxed)
  }
}

#[derive(Debug)]
pub enum StageWait<T> {
  Completed(T),
  Panicked(String),
  TimedOut,
  Aborted,
}

/// Runs `job` on its own thread and waits at most `timeout` for it. On
/// timeout or abort the stage's token is tripped and the thread gets
/// [`CANCEL_GRACE`] to return; after that it is left to wind down on its own.
/// Its result is discarded either way.
pub fn run_stage<T, F>(timeout: Duration, abort: &CancelToken, job: F) -> StageWait<T>
where
  T: Send + 'static,
  F: FnOnce(CancelToken) -> T + Send + 'static,
{
  let token = CancelToken::new();
  let stage_token = token.clone();
  let (tx, rx) = mpsc::channel();
  std::thread::spawn(move || {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| job(stage_token)));
    let _ = tx.send(result);
  });

  let deadline = Instant::now() + timeout;
  loop {
    if abort.is_cancelled() {
      token.cancel();
      let _ = rx.recv_timeout(CANCEL_GRACE);
      return StageWait::Aborted;
    }
    let now = Instant::now();
    if now >= deadline {
      token.cancel();
      let _ = rx.recv_timeout(CANCEL_GRACE);
      return StageWait::TimedOut;
    }

    match rx.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
      Ok(Ok(value)) => return StageWait::Completed(value),
      Ok(Err(payload)) => return StageWait::Panicked(panic_message(payload.as_ref())),
      Err(mpsc::RecvTimeoutError::Timeout) => continue,
      Err(mpsc::RecvTimeoutError::Disconnected) => {
        return StageWait::Panicked("stage thread exited without a result".to_string())
      }
    }
  }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(msg) = payload.downcast_ref::<&str>() {
    (*msg).to_string()
  } else if let Some(msg) = payload.downcast_ref::<String>() {
    msg.clone()
  } else {
    "stage panicked".to_string()
  }
}
