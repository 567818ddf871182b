//! Bounded script execution.
//!
//! A watchdog thread arms the shared interrupt flag at the deadline; the
//! QuickJS interrupt handler observes it and aborts the script at the next
//! safe point. The flag is cleared before the call returns so the VM can be
//! reused, and host panics raised while the interpreter unwinds are folded
//! into the same timeout error.

use crate::error::{Error, Result};
use crate::runtime::{eval_to_json, ExtensionRuntime};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Deadline applied when the caller passes a zero duration.
pub const DEFAULT_JS_TIMEOUT: Duration = Duration::from_secs(30);

impl ExtensionRuntime {
    /// Evaluate `script` with a hard deadline.
    ///
    /// On timeout the returned error satisfies [`Error::is_timeout`]. The
    /// VM remains usable afterwards.
    pub fn run_with_timeout(
        &self,
        script: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let timeout = if timeout.is_zero() {
            DEFAULT_JS_TIMEOUT
        } else {
            timeout
        };

        let (done_tx, done_rx) = mpsc::channel::<()>();
        let flag = Arc::clone(&self.interrupt);
        let watchdog = thread::spawn(move || {
            if done_rx.recv_timeout(timeout).is_err() {
                flag.set();
            }
        });

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.context.with(|ctx| eval_to_json(&ctx, script))
        }));

        // Stop the watchdog (it may already have fired) and reset the
        // interrupt state so the VM can be reused.
        let _ = done_tx.send(());
        let timed_out = self.interrupt.is_set();
        self.interrupt.clear();
        let _ = watchdog.join();

        match outcome {
            Ok(result) => {
                if timed_out {
                    Err(Error::timeout("execution timeout exceeded"))
                } else {
                    result
                }
            }
            Err(_) => {
                if timed_out {
                    Err(Error::timeout("execution timeout exceeded"))
                } else {
                    Err(Error::script("panic during execution"))
                }
            }
        }
    }
}
