use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] cache mutex poisoned, cannot recover from this - aborting";

/// The outcome of a claimed computation, once published.
type Outcome<V, E> = Option<Result<V, CacheError<E>>>;

/// A write-once, read-many cache which guarantees that at most one
/// computation is in flight per key.
///
/// The first caller to `claim` a key becomes its owner and is handed a
/// `Publisher`; every other caller gets nothing, and should `wait` for
/// the owner to publish.  Entries are never updated or evicted.
///
/// Invoking `clone` on a `SharedCache` gives a new instance which
/// refers to the same underlying maps.
pub struct SharedCache<V, E> {
    inner: Arc<Inner<V, E>>,
}

struct Inner<V, E> {
    /// Published values, for non-blocking reads.
    values: RwLock<HashMap<String, V>>,

    /// One completion signal per claimed key.
    ///
    /// INVARIANT: every key in `values` is also in here.
    claims: Mutex<HashMap<String, Arc<watch::Sender<Outcome<V, E>>>>>,
}

impl<V, E> Clone for SharedCache<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> Default for SharedCache<V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E> fmt::Debug for SharedCache<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCache")
            .field("claims", &self.inner.claims.lock().expect(MUTEX_POISON_MESSAGE).len())
            .finish()
    }
}

impl<V, E> SharedCache<V, E> {
    /// Make a new, empty, shared cache.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                values: RwLock::new(HashMap::new()),
                claims: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Try to become the owner of `key`.
    ///
    /// Returns a `Publisher` if this call registered the claim, or
    /// `None` if some other caller got there first.
    pub fn claim(&self, key: &str) -> Option<Publisher<V, E>> {
        let mut claims = self.inner.claims.lock().expect(MUTEX_POISON_MESSAGE);
        if claims.contains_key(key) {
            return None;
        }

        let (sender, _) = watch::channel(None);
        let sender = Arc::new(sender);
        claims.insert(key.to_string(), Arc::clone(&sender));

        Some(Publisher {
            key: key.to_string(),
            sender,
            cache: self.clone(),
            published: false,
        })
    }

    /// Whether `key` has been claimed, published or not.
    pub fn is_claimed(&self, key: &str) -> bool {
        self.inner
            .claims
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .contains_key(key)
    }

    /// Number of claimed keys.
    pub fn len(&self) -> usize {
        self.inner.claims.lock().expect(MUTEX_POISON_MESSAGE).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone, E: Clone> SharedCache<V, E> {
    /// Get a published value without blocking.  Returns `None` if the
    /// key is unclaimed, still being computed, or failed.
    pub fn get(&self, key: &str) -> Option<V> {
        self.inner
            .values
            .read()
            .expect(MUTEX_POISON_MESSAGE)
            .get(key)
            .cloned()
    }

    /// Claim `key` and publish `value` in one step.
    ///
    /// # Errors
    ///
    /// `CacheError::AlreadyClaimed` if the key has already been
    /// claimed: entries are write-once.
    pub fn insert(&self, key: &str, value: V) -> Result<(), CacheError<E>> {
        match self.claim(key) {
            Some(publisher) => {
                publisher.publish(Ok(value));
                Ok(())
            }
            None => Err(CacheError::AlreadyClaimed(key.to_string())),
        }
    }

    /// Wait for the owner of `key` to publish, and return what it
    /// published.  Every waiter sees the same outcome, including the
    /// error if the computation failed.
    ///
    /// There is no timeout: an owner which neither publishes nor is
    /// dropped blocks its waiters forever.
    ///
    /// # Errors
    ///
    /// - `CacheError::NoSuchClaim` immediately if the key was never
    ///   claimed.
    /// - `CacheError::Failed` with the published error.
    /// - `CacheError::Abandoned` if the owner was dropped without
    ///   publishing.
    pub async fn wait(&self, key: &str) -> Result<V, CacheError<E>> {
        let mut receiver = {
            let claims = self.inner.claims.lock().expect(MUTEX_POISON_MESSAGE);
            match claims.get(key) {
                Some(sender) => sender.subscribe(),
                None => return Err(CacheError::NoSuchClaim(key.to_string())),
            }
        };

        loop {
            let outcome = receiver.borrow_and_update().clone();
            if let Some(outcome) = outcome {
                return outcome;
            }
            // the sender lives in the claim map as long as the cache
            // does, so this only fails if the cache is being torn down.
            if receiver.changed().await.is_err() {
                return Err(CacheError::Abandoned(key.to_string()));
            }
        }
    }
}

/// The right, and obligation, to publish the outcome for a claimed
/// key.  Publishing consumes the publisher, so a key can only be
/// written once.
///
/// Dropping an unpublished publisher publishes
/// `CacheError::Abandoned`, so waiters do not block forever when the
/// owning computation is cancelled.
pub struct Publisher<V, E> {
    key: String,
    sender: Arc<watch::Sender<Outcome<V, E>>>,
    cache: SharedCache<V, E>,
    published: bool,
}

impl<V: Clone, E> Publisher<V, E> {
    /// Publish the outcome and wake every waiter.
    ///
    /// A successful value is also made visible to `SharedCache::get`.
    /// An error is delivered to waiters only: no value is stored.
    pub fn publish(mut self, outcome: Result<V, E>) {
        let outcome = match outcome {
            Ok(value) => {
                self.cache
                    .inner
                    .values
                    .write()
                    .expect(MUTEX_POISON_MESSAGE)
                    .insert(self.key.clone(), value.clone());
                Ok(value)
            }
            Err(error) => Err(CacheError::Failed(error)),
        };

        self.sender.send_replace(Some(outcome));
        self.published = true;
    }
}

impl<V, E> Drop for Publisher<V, E> {
    fn drop(&mut self) {
        if !self.published {
            tracing::debug!(key = %self.key, "claim dropped without publishing");
            self.sender
                .send_replace(Some(Err(CacheError::Abandoned(self.key.clone()))));
        }
    }
}

impl<V, E> fmt::Debug for Publisher<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("key", &self.key)
            .field("published", &self.published)
            .finish()
    }
}

/// Errors from waiting on, or writing to, a `SharedCache`.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CacheError<E> {
    /// `wait` was called for a key nobody claimed.
    #[error("no claim exists for {0:?}")]
    NoSuchClaim(String),

    /// A write-once key was written a second time.
    #[error("{0:?} has already been claimed")]
    AlreadyClaimed(String),

    /// The owner went away without publishing.
    #[error("claim for {0:?} was dropped without publishing")]
    Abandoned(String),

    /// The owner published an error.
    #[error("{0}")]
    Failed(E),
}
