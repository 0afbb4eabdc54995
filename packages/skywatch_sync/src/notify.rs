//! Change notification via monotonically increasing revision counters.

use tokio::sync::watch;

/// A revision counter observers can watch for changes.
#[derive(Debug)]
pub struct Revision {
    tx: watch::Sender<u64>,
}

impl Default for Revision {
    fn default() -> Self {
        Self::new()
    }
}

impl Revision {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    /// Advance the revision and wake every observer. Returns the new value.
    pub fn bump(&self) -> u64 {
        let mut next = 0;
        self.tx.send_modify(|rev| {
            *rev += 1;
            next = *rev;
        });
        next
    }

    pub fn current(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_increments() {
        let rev = Revision::new();
        assert_eq!(rev.current(), 0);
        assert_eq!(rev.bump(), 1);
        assert_eq!(rev.bump(), 2);
        assert_eq!(rev.current(), 2);
    }

    #[tokio::test]
    async fn observers_are_woken() {
        let rev = Revision::new();
        let mut rx = rev.subscribe();
        rev.bump();
        rx.changed().await.expect("sender alive");
        assert_eq!(*rx.borrow_and_update(), 1);
        assert!(!rx.has_changed().unwrap());
    }
}
