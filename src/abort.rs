use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::output;

/// Shared operator-abort flag. Set once by the Ctrl-C listener; checked
/// between steps and probe ticks so cancellation takes the same rollback
/// path as a phase failure.
#[derive(Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Spawn a background task that trips the flag on the first Ctrl-C.
    pub fn listen_for_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                output::warning("Abort requested, rolling back at the next safe point...");
                flag.set();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::AbortFlag;

    #[test]
    fn starts_unset_and_is_sticky() {
        let flag = AbortFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
        let clone = flag.clone();
        assert!(clone.is_set());
    }
}
