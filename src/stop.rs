use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

/// Latched stop signal shared by the CLI, the orchestrator and every bounded
/// wait. Nothing is ever sent on the channel: setting the event drops the only
/// sender, which wakes every receiver with `Disconnected` and keeps doing so.
#[derive(Clone, Debug)]
pub struct StopEvent {
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

impl Default for StopEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl StopEvent {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        StopEvent {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }

    pub fn set(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps for up to `timeout`, returning early with `true` once the event
    /// is set.
    pub fn wait(&self, timeout: Duration) -> bool {
        matches!(
            self.receiver.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_not_set_by_default() {
        let stop = StopEvent::new();
        assert!(!stop.is_set());
        assert!(!stop.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_set_is_latched_and_shared() {
        let stop = StopEvent::new();
        let clone = stop.clone();
        clone.set();
        clone.set();
        assert!(stop.is_set());
        assert!(stop.is_set());
        assert!(stop.wait(Duration::from_secs(10)));
    }

    #[test]
    fn test_wait_wakes_up_when_set() {
        let stop = StopEvent::new();
        let setter = stop.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            setter.set();
        });
        assert!(stop.wait(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(10));
        handle.join().unwrap();
    }
}
