// ABOUTME: Correlates a solicitation token back to whatever eventually satisfies it: the
// ABOUTME: PCM's direct/indirect connection race and transfer rendezvous both wait here

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::cancel::CancelToken;
use crate::error::PeerError;

/// One component of a composite wait key. Build keys with the [`wait_key`]
/// macro rather than constructing this directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WaitKeyPart {
    Str(String),
    Int(i64),
}

impl From<&str> for WaitKeyPart {
    fn from(value: &str) -> Self {
        WaitKeyPart::Str(value.to_string())
    }
}

impl From<String> for WaitKeyPart {
    fn from(value: String) -> Self {
        WaitKeyPart::Str(value)
    }
}

impl From<&String> for WaitKeyPart {
    fn from(value: &String) -> Self {
        WaitKeyPart::Str(value.clone())
    }
}

macro_rules! impl_wait_key_part_int {
    ($($t:ty),+) => {
        $(impl From<$t> for WaitKeyPart {
            fn from(value: $t) -> Self {
                WaitKeyPart::Int(value as i64)
            }
        })+
    };
}

impl_wait_key_part_int!(i64, i32, u32, u64, usize);

/// A composite correlation key, e.g. `("SolicitedPeerConnection", username, token)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaitKey(Vec<WaitKeyPart>);

impl WaitKey {
    pub fn new(parts: Vec<WaitKeyPart>) -> Self {
        WaitKey(parts)
    }
}

/// Builds a [`WaitKey`] from a mix of string and integer parts.
#[macro_export]
macro_rules! wait_key {
    ($($part:expr),+ $(,)?) => {
        $crate::waiter::WaitKey::new(vec![$($crate::waiter::WaitKeyPart::from($part)),+])
    };
}

enum Slot {
    Waiting(oneshot::Sender<Outcome>),
    Buffered(Outcome),
}

enum Outcome {
    Value(Box<dyn Any + Send>),
    Error(PeerError),
}

/// A type-erased correlator: callers `wait` on a key with the concrete
/// type they expect, and some other task later `complete`s or `throw`s
/// against the same key. A value that arrives before anyone waits for it
/// is buffered until the first `wait` call for that key.
pub struct Waiter {
    slots: Mutex<HashMap<WaitKey, Slot>>,
    default_timeout: Duration,
}

impl Waiter {
    pub fn new(default_timeout: Duration) -> Self {
        Waiter {
            slots: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Waits for `key` to be completed or thrown against, or for `timeout`
    /// (falling back to the waiter's default) or `cancel` to fire first.
    pub async fn wait<T: Send + 'static>(
        &self,
        key: WaitKey,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<T, PeerError> {
        let rx = {
            let mut slots = self.slots.lock().unwrap();
            match slots.remove(&key) {
                Some(Slot::Buffered(outcome)) => return Self::resolve(outcome),
                // A second waiter on an already-waited key shadows the
                // first: the first's receiver fails with RecvError, which
                // we treat as cancelled.
                Some(Slot::Waiting(_)) | None => {}
            }
            let (tx, rx) = oneshot::channel();
            slots.insert(key.clone(), Slot::Waiting(tx));
            rx
        };

        let dur = timeout.unwrap_or(self.default_timeout);
        tokio::select! {
            _ = cancel.cancelled() => {
                self.remove(&key);
                Err(PeerError::Cancelled)
            }
            _ = tokio::time::sleep(dur) => {
                self.remove(&key);
                Err(PeerError::Timeout)
            }
            result = rx => match result {
                Ok(outcome) => Self::resolve(outcome),
                Err(_) => Err(PeerError::Cancelled),
            }
        }
    }

    /// Satisfies `key` with `value`. If nobody is waiting yet, buffers it
    /// for the next `wait` call against the same key.
    pub fn complete<T: Send + 'static>(&self, key: WaitKey, value: T) {
        self.resolve_slot(key, Outcome::Value(Box::new(value)));
    }

    /// Fails `key` with `error`, buffering it the same way `complete` does.
    pub fn throw(&self, key: WaitKey, error: PeerError) {
        self.resolve_slot(key, Outcome::Error(error));
    }

    fn resolve_slot(&self, key: WaitKey, outcome: Outcome) {
        let mut slots = self.slots.lock().unwrap();
        match slots.remove(&key) {
            Some(Slot::Waiting(tx)) => {
                let _ = tx.send(outcome);
            }
            _ => {
                slots.insert(key, Slot::Buffered(outcome));
            }
        }
    }

    /// Fails every currently-waiting key with [`PeerError::Cancelled`].
    /// Used when the owning manager is disposed.
    pub fn cancel_all(&self) {
        let mut slots = self.slots.lock().unwrap();
        for (_, slot) in slots.drain() {
            if let Slot::Waiting(tx) = slot {
                let _ = tx.send(Outcome::Error(PeerError::Cancelled));
            }
        }
    }

    fn remove(&self, key: &WaitKey) {
        self.slots.lock().unwrap().remove(key);
    }

    fn resolve<T: Send + 'static>(outcome: Outcome) -> Result<T, PeerError> {
        match outcome {
            Outcome::Error(e) => Err(e),
            Outcome::Value(boxed) => boxed
                .downcast::<T>()
                .map(|b| *b)
                .map_err(|_| PeerError::Protocol("wait key resolved with the wrong type".into())),
        }
    }
}
