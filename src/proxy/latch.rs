use std::sync::Arc;

use tokio::sync::watch;

/// One-shot notification that stays set once fired.
///
/// Watches taken before or after the latch fires both observe it, so a
/// handler can be attached before the event source exists.
#[derive(Debug, Clone)]
pub struct Latch {
    tx: Arc<watch::Sender<bool>>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Set the latch. Returns `true` only for the call that set it.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|set| {
            if *set {
                false
            } else {
                *set = true;
                true
            }
        })
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> LatchWatch {
        LatchWatch {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct LatchWatch {
    rx: watch::Receiver<bool>,
}

impl LatchWatch {
    /// Resolves once the latch is set. Cancel safe.
    pub async fn wait(&mut self) {
        // A dropped sender can never fire; treat it as set so waiters don't hang.
        let _ = self.rx.wait_for(|set| *set).await;
    }
}
