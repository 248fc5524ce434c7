//! Cooperative cancellation token (§5 suspension points): checked at
//! least every 64 trials inside both the permutation and bootstrap loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{EngineError, EngineResult};

pub const CHECK_INTERVAL: u64 = 64;

#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Convenience for phase-boundary checks in the orchestrator: `Err`
    /// short-circuits the pipeline with the same cancellation error the
    /// validation loops themselves would bail out with mid-trial.
    pub fn check(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}
