use tokio::sync::mpsc;

/// A single-slot, coalescing notification channel.
///
/// This is the only pattern the control plane uses for cross-task "something happened, wake
/// up" signals (the Worker's reconnect trigger and its backoff-reset signal in particular): the
/// producer never blocks and a pending signal is silently coalesced rather than queued, because
/// only the *fact* that it fired matters, not how many times.
pub struct Signal<T> {
    tx: mpsc::Sender<T>,
    rx: mpsc::Receiver<T>,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Signal { tx, rx }
    }

    pub fn sender(&self) -> SignalSender<T> {
        SignalSender { tx: self.tx.clone() }
    }

    /// Drains any pending signal without waiting. Used at the top of a supervisor loop to pick
    /// up a signal that fired while the loop was busy elsewhere.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct SignalSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> SignalSender<T> {
    /// Non-blocking trigger: if the slot is already occupied, the new signal is dropped — the
    /// pending one already carries the "wake up" meaning.
    pub fn trigger(&self, value: T) {
        let _ = self.tx.try_send(value);
    }
}

impl SignalSender<()> {
    pub fn fire(&self) {
        self.trigger(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn coalesces_repeated_triggers() {
        let mut signal: Signal<()> = Signal::new();
        let sender = signal.sender();

        sender.fire();
        sender.fire();
        sender.fire();

        assert!(signal.try_recv().is_some());
        assert!(signal.try_recv().is_none());
    }

    #[tokio::test]
    async fn recv_waits_for_trigger() {
        let mut signal: Signal<&'static str> = Signal::new();
        let sender = signal.sender();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            sender.trigger("reason");
        });

        let received = signal.recv().await;
        assert_eq!(received, Some("reason"));
        handle.await.unwrap();
    }
}
