//! In-process key-value store with fault injection.
//!
//! [`MemoryStore`] is shared between the test harness and any number of
//! [`MemoryConnection`]s. Every request is served by its own tokio task, so
//! completions arrive asynchronously and, with latency jitter enabled, out
//! of order.
//!
//! # Faults
//!
//! - [`MemoryStore::corrupt`] / [`MemoryStore::corrupt_on_store`]: flip a bit
//!   in a stored value
//! - [`MemoryStore::fail_next_connect`]: next connect reports a transport
//!   error
//! - [`MemoryStore::break_connection`]: the live connection fails mid-run
//! - [`MemoryStore::hold`]: completions wait until released
//! - [`MemoryStore::with_max_in_flight`]: submissions beyond the limit are
//!   rejected synchronously

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::Semaphore;

use crate::codec::decode_document;
use crate::config::Timeouts;
use crate::connection::{
    post, with_timeout, Connection, Connector, Event, EventSender, OpError, SubmitError, Token,
    TransportError,
};
use crate::counters::OpKind;

/// What the aggregate view counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewKind {
    /// Every stored value.
    AllDocuments,
    /// Stored values that are not valid self-verifying documents.
    #[default]
    InvalidDocuments,
}

#[derive(Debug)]
struct Inner {
    data: HashMap<String, Bytes>,
    corrupt_on_store: HashSet<String>,
    view: ViewKind,
    max_in_flight: Option<usize>,
    jitter: Option<(Duration, Duration)>,
    rng: ChaCha8Rng,
    fail_connects: u32,
    fail_views: u32,
    fail_stores: u32,
    refuse: bool,
    gate: Option<Arc<Semaphore>>,
    held: usize,
    in_flight: [usize; 3],
    max_in_flight_seen: usize,
    phase_overlaps: u64,
    submitted: [u64; 3],
    completed: [u64; 3],
    /// Newest connection: generation, event sink, broken flag.
    live: Option<(u64, EventSender, Arc<Mutex<bool>>)>,
    opened: u64,
}

impl Inner {
    fn delay(&mut self) -> Duration {
        match self.jitter {
            Some((min, max)) if max > min => self.rng.gen_range(min..=max),
            Some((min, _)) => min,
            None => Duration::ZERO,
        }
    }
}

const fn slot(kind: OpKind) -> usize {
    match kind {
        OpKind::Store => 0,
        OpKind::Fetch => 1,
        OpKind::View | OpKind::Connect => 2,
    }
}

/// Shared in-memory store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store with immediate completions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                data: HashMap::new(),
                corrupt_on_store: HashSet::new(),
                view: ViewKind::default(),
                max_in_flight: None,
                jitter: None,
                rng: ChaCha8Rng::seed_from_u64(0),
                fail_connects: 0,
                fail_views: 0,
                fail_stores: 0,
                refuse: false,
                gate: None,
                held: 0,
                in_flight: [0; 3],
                max_in_flight_seen: 0,
                phase_overlaps: 0,
                submitted: [0; 3],
                completed: [0; 3],
                live: None,
                opened: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("lock poisoned")
    }

    /// Selects what the aggregate view counts.
    #[must_use]
    pub fn with_view(self, view: ViewKind) -> Self {
        self.lock().view = view;
        self
    }

    /// Rejects submissions while `limit` requests are in flight.
    #[must_use]
    pub fn with_max_in_flight(self, limit: usize) -> Self {
        self.lock().max_in_flight = Some(limit);
        self
    }

    /// Delays every completion by a seeded random duration in `min..=max`.
    #[must_use]
    pub fn with_jitter(self, seed: u64, min: Duration, max: Duration) -> Self {
        {
            let mut inner = self.lock();
            inner.jitter = Some((min, max));
            inner.rng = ChaCha8Rng::seed_from_u64(seed);
        }
        self
    }

    /// Inserts a value directly, bypassing any connection.
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.lock().data.insert(key.into(), value.into());
    }

    /// Reads a value directly.
    #[must_use]
    pub fn get_raw(&self, key: &str) -> Option<Bytes> {
        self.lock().data.get(key).cloned()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().data.is_empty()
    }

    /// Flips one bit in the middle of a stored value.
    ///
    /// Returns false if the key does not exist.
    pub fn corrupt(&self, key: &str) -> bool {
        let mut inner = self.lock();
        match inner.data.get_mut(key) {
            Some(value) => {
                *value = flip_middle_bit(value);
                true
            }
            None => false,
        }
    }

    /// Corrupts the next value stored under `key`.
    pub fn corrupt_on_store(&self, key: impl Into<String>) {
        self.lock().corrupt_on_store.insert(key.into());
    }

    /// Fails the next `n` connect requests with a transport error.
    pub fn fail_next_connect(&self, n: u32) {
        self.lock().fail_connects = n;
    }

    /// Fails the next `n` view queries with HTTP 500.
    pub fn fail_next_views(&self, n: u32) {
        self.lock().fail_views = n;
    }

    /// Rejects the next `n` stores.
    pub fn fail_next_stores(&self, n: u32) {
        self.lock().fail_stores = n;
    }

    /// Makes [`Connector::open`] refuse new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse = refuse;
    }

    /// Breaks the newest connection: a transport error is posted, further
    /// submissions are rejected and in-flight requests fail.
    ///
    /// Returns false if no connection was ever opened.
    pub fn break_connection(&self, message: &str) -> bool {
        let live = self.lock().live.clone();
        let Some((generation, events, broken)) = live else {
            return false;
        };
        *broken.lock().expect("lock poisoned") = true;
        post(
            &events,
            Event::TransportFailed {
                generation,
                message: message.to_string(),
            },
        );
        true
    }

    /// Holds every completion until released.
    pub fn hold(&self) {
        let mut inner = self.lock();
        if inner.gate.is_none() {
            inner.gate = Some(Arc::new(Semaphore::new(0)));
        }
    }

    /// Lets `n` held completions through.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.lock().gate {
            gate.add_permits(n);
        }
    }

    /// Releases every held completion and stops holding.
    pub fn release_all(&self) {
        if let Some(gate) = self.lock().gate.take() {
            gate.close();
        }
    }

    /// Completions currently waiting for release.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.lock().held
    }

    /// Requests accepted per kind.
    #[must_use]
    pub fn submitted(&self, kind: OpKind) -> u64 {
        self.lock().submitted[slot(kind)]
    }

    /// Requests completed per kind.
    #[must_use]
    pub fn completed(&self, kind: OpKind) -> u64 {
        self.lock().completed[slot(kind)]
    }

    /// Submissions of one kind made while another kind was in flight.
    #[must_use]
    pub fn phase_overlaps(&self) -> u64 {
        self.lock().phase_overlaps
    }

    /// Highest number of requests ever in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight_seen
    }

    /// Connections opened so far.
    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.lock().opened
    }

    /// Admits a request or rejects it for back-pressure.
    fn admit(&self, kind: OpKind) -> Result<(Duration, Option<Arc<Semaphore>>), SubmitError> {
        let mut inner = self.lock();
        let total: usize = inner.in_flight.iter().sum();
        if let Some(limit) = inner.max_in_flight {
            if total >= limit {
                return Err(SubmitError::Backpressure { limit });
            }
        }

        let s = slot(kind);
        if inner
            .in_flight
            .iter()
            .enumerate()
            .any(|(i, &n)| i != s && n > 0)
        {
            inner.phase_overlaps += 1;
        }
        inner.in_flight[s] += 1;
        inner.submitted[s] += 1;
        inner.max_in_flight_seen = inner.max_in_flight_seen.max(total + 1);
        Ok((inner.delay(), inner.gate.clone()))
    }

    fn finish(&self, kind: OpKind) {
        let mut inner = self.lock();
        let s = slot(kind);
        inner.in_flight[s] = inner.in_flight[s].saturating_sub(1);
        inner.completed[s] += 1;
    }

    fn apply_store(&self, key: &str, value: Bytes) -> Result<(), OpError> {
        let mut inner = self.lock();
        if inner.fail_stores > 0 {
            inner.fail_stores -= 1;
            return Err(OpError::Rejected("injected store failure".to_string()));
        }
        let value = if inner.corrupt_on_store.remove(key) {
            flip_middle_bit(&value)
        } else {
            value
        };
        inner.data.insert(key.to_string(), value);
        Ok(())
    }

    fn apply_fetch(&self, key: &str) -> Result<Bytes, OpError> {
        self.lock().data.get(key).cloned().ok_or(OpError::NotFound)
    }

    fn apply_view(&self) -> Result<Bytes, OpError> {
        let mut inner = self.lock();
        if inner.fail_views > 0 {
            inner.fail_views -= 1;
            return Err(OpError::Http(500));
        }
        let rows = match inner.view {
            ViewKind::AllDocuments => inner.data.len(),
            ViewKind::InvalidDocuments => inner
                .data
                .values()
                .filter(|v| decode_document(v).map_or(true, |d| d.verify().is_err()))
                .count(),
        };
        Ok(Bytes::from(format!(r#"{{"total_rows":{rows},"rows":[]}}"#)))
    }
}

fn flip_middle_bit(value: &Bytes) -> Bytes {
    let mut bytes = value.to_vec();
    if let Some(b) = bytes.get_mut(value.len() / 2) {
        *b ^= 1;
    }
    Bytes::from(bytes)
}

/// Waits at the hold gate, if any. Counted in `held` while waiting.
async fn pass_gate(store: &MemoryStore, gate: Option<Arc<Semaphore>>) {
    struct Held<'a>(&'a MemoryStore);

    impl Drop for Held<'_> {
        fn drop(&mut self) {
            let mut inner = self.0.lock();
            inner.held = inner.held.saturating_sub(1);
        }
    }

    let Some(gate) = gate else { return };
    store.lock().held += 1;
    let _held = Held(store);
    // A closed gate means release_all.
    let acquired = gate.acquire().await;
    if let Ok(permit) = acquired {
        permit.forget();
    }
}

/// Opens connections to a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: MemoryStore,
    timeouts: Timeouts,
}

impl MemoryConnector {
    /// Creates a connector for `store`.
    #[must_use]
    pub const fn new(store: MemoryStore, timeouts: Timeouts) -> Self {
        Self { store, timeouts }
    }

    /// The backing store.
    #[must_use]
    pub const fn store(&self) -> &MemoryStore {
        &self.store
    }
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    fn open(
        &mut self,
        generation: u64,
        events: EventSender,
    ) -> Result<MemoryConnection, TransportError> {
        let broken = Arc::new(Mutex::new(false));
        {
            let mut inner = self.store.lock();
            if inner.refuse {
                return Err(TransportError::Refused("memory store refusing".to_string()));
            }
            inner.opened += 1;
            inner.live = Some((generation, events.clone(), broken.clone()));
        }
        Ok(MemoryConnection {
            generation,
            store: self.store.clone(),
            events,
            timeouts: self.timeouts,
            broken,
        })
    }
}

/// One connection to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnection {
    generation: u64,
    store: MemoryStore,
    events: EventSender,
    timeouts: Timeouts,
    broken: Arc<Mutex<bool>>,
}

impl MemoryConnection {
    fn is_broken(&self) -> bool {
        *self.broken.lock().expect("lock poisoned")
    }

    /// Admits and spawns one request. `op` runs after the delay and gate;
    /// `event` wraps its result.
    fn spawn<T, Op, Wrap>(
        &self,
        kind: OpKind,
        timeout: Duration,
        op: Op,
        event: Wrap,
    ) -> Result<(), SubmitError>
    where
        T: Send + 'static,
        Op: FnOnce(&MemoryStore) -> Result<T, OpError> + Send + 'static,
        Wrap: FnOnce(Result<T, OpError>) -> Event + Send + 'static,
    {
        if self.is_broken() {
            return Err(SubmitError::Closed);
        }
        let (delay, gate) = self.store.admit(kind)?;
        let store = self.store.clone();
        let events = self.events.clone();
        let broken = self.broken.clone();

        tokio::spawn(async move {
            let result = with_timeout(timeout, async {
                tokio::time::sleep(delay).await;
                pass_gate(&store, gate).await;
                if *broken.lock().expect("lock poisoned") {
                    return Err(OpError::Io("connection reset".to_string()));
                }
                op(&store)
            })
            .await;
            store.finish(kind);
            post(&events, event(result));
        });
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn connect(&mut self) -> Result<(), SubmitError> {
        let store = self.store.clone();
        let events = self.events.clone();
        let generation = self.generation;
        let timeout = self.timeouts.connect();
        let delay = store.lock().delay().min(timeout);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fail = {
                let mut inner = store.lock();
                let fail = inner.fail_connects > 0;
                inner.fail_connects = inner.fail_connects.saturating_sub(1);
                fail
            };
            let event = if fail {
                Event::TransportFailed {
                    generation,
                    message: "injected connect failure".to_string(),
                }
            } else {
                Event::Configured { generation }
            };
            post(&events, event);
        });
        Ok(())
    }

    fn store(&mut self, token: Token, key: &str, value: Bytes) -> Result<(), SubmitError> {
        let key = key.to_string();
        self.spawn(
            OpKind::Store,
            self.timeouts.store(),
            move |store| store.apply_store(&key, value),
            move |result| Event::Stored { token, result },
        )
    }

    fn fetch(&mut self, token: Token, key: &str) -> Result<(), SubmitError> {
        let key = key.to_string();
        self.spawn(
            OpKind::Fetch,
            self.timeouts.fetch(),
            move |store| store.apply_fetch(&key),
            move |result| Event::Fetched { token, result },
        )
    }

    fn query_view(&mut self, token: Token, _path: &str) -> Result<(), SubmitError> {
        self.spawn(
            OpKind::View,
            self.timeouts.view(),
            MemoryStore::apply_view,
            move |result| Event::Viewed { token, result },
        )
    }
}
