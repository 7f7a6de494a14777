use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Single-slot handoff between one producer path and one waiting consumer.
///
/// [`offer`](Mailbox::offer) never blocks: when the slot is already occupied
/// the value is handed back, so the first delivery always wins and later
/// ones can be closed by the caller instead of being buffered.
pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }
    pub fn offer(&self, value: T) -> Result<(), T> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(value);
        }
        *slot = Some(value);
        drop(slot);
        self.notify.notify_one();
        Ok(())
    }
    pub fn try_take(&self) -> Option<T> {
        self.slot.lock().take()
    }
    pub fn is_full(&self) -> bool {
        self.slot.lock().is_some()
    }
    /// Wait until a value is offered and take it.
    pub async fn take(&self) -> T {
        loop {
            if let Some(value) = self.try_take() {
                return value;
            }
            // notify_one stores a permit when nobody is parked yet,
            // so an offer racing this check is not lost
            self.notify.notified().await;
        }
    }
    pub async fn poll(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.take()).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::Mailbox;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn offer_on_full_hands_value_back() {
        let mailbox = Mailbox::new();
        assert!(mailbox.offer(1).is_ok());
        assert_eq!(mailbox.offer(2), Err(2));
        assert_eq!(mailbox.try_take(), Some(1));
        assert_eq!(mailbox.try_take(), None);
    }

    #[tokio::test]
    async fn take_waits_for_offer() {
        let mailbox = Arc::new(Mailbox::new());
        let producer = mailbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.offer("hello").unwrap();
        });
        assert_eq!(mailbox.take().await, "hello");
    }

    #[tokio::test]
    async fn poll_times_out_when_empty() {
        let mailbox: Mailbox<u8> = Mailbox::new();
        assert_eq!(mailbox.poll(Duration::from_millis(20)).await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_offers_have_one_winner() {
        for _ in 0..20 {
            let mailbox = Arc::new(Mailbox::new());
            let mut tasks = Vec::new();
            for i in 0..8 {
                let mailbox = mailbox.clone();
                tasks.push(tokio::spawn(async move { mailbox.offer(i).is_ok() }));
            }
            let mut accepted = 0;
            for task in tasks {
                if task.await.unwrap() {
                    accepted += 1;
                }
            }
            assert_eq!(accepted, 1);
            assert_eq!(mailbox.offer(100), Err(100));
            let first = mailbox.take().await;
            assert!(first < 8);
        }
    }
}
