use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Collapses concurrent fetches for the same cache key into one upstream
/// call. The mutex guards only map operations and is never held across I/O;
/// waiters park on a per-key one-shot watch latch.
#[derive(Default)]
pub struct Inflight {
    slots: Mutex<HashMap<String, watch::Receiver<bool>>>,
}

pub enum Claim<'a> {
    /// This caller owns the fetch; dropping the slot releases it.
    Acquired(FlightSlot<'a>),
    /// Another fetch is in flight; wait on the latch and retry.
    InFlight(watch::Receiver<bool>),
}

impl Inflight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, key: &str) -> Claim<'_> {
        let mut slots = self.slots.lock();
        if let Some(rx) = slots.get(key) {
            return Claim::InFlight(rx.clone());
        }
        let (tx, rx) = watch::channel(false);
        slots.insert(key.to_string(), rx);
        Claim::Acquired(FlightSlot {
            inflight: self,
            key: key.to_string(),
            tx,
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Waits until the in-flight fetch for the key completes. A dropped sender
/// counts as completion.
pub async fn wait(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|done| *done).await;
}

pub struct FlightSlot<'a> {
    inflight: &'a Inflight,
    key: String,
    tx: watch::Sender<bool>,
}

impl Drop for FlightSlot<'_> {
    // The slot must disappear before waiters resume, so a retrying caller
    // either sees the fresh entry or claims the key itself: remove and
    // signal under the same lock acquisition.
    fn drop(&mut self) {
        let mut slots = self.inflight.slots.lock();
        slots.remove(&self.key);
        let _ = self.tx.send(true);
    }
}
