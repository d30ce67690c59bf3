//! Single owner of everything observers can see: process lifecycle, the log record and the
//! contents of watched files.
//!
//! Writers go through [StateStore::mutate], which bumps the snapshot version and wakes a
//! background pusher. The pusher hands copies of the latest snapshot to every subscriber, at
//! most once per subscriber throttle interval, through a one-slot mailbox where newer snapshots
//! replace undelivered older ones. A slow observer therefore never blocks writers and never
//! falls behind by more than one interval.
pub mod log_ring;
pub mod snapshot;

use crate::utils::thread_context::spawn_named_thread;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use log_ring::LogStream;
use snapshot::{ProcessState, StateSnapshot};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_PUSH_INTERVAL: Duration = Duration::from_millis(250);

const PUSHER_THREAD_NAME: &str = "state-pusher";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct StateStore {
    shared: Arc<Shared>,
    notifier: Sender<()>,
}

struct Shared {
    snapshot: Mutex<StateSnapshot>,
    subscribers: Mutex<Subscribers>,
    push_interval: Duration,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    slots: Vec<Slot>,
}

struct Slot {
    id: u64,
    mailbox: Sender<Arc<StateSnapshot>>,
    // Lets the pusher take back an undelivered snapshot to replace it with a newer one.
    reclaim: Receiver<Arc<StateSnapshot>>,
    throttle: Duration,
    last_push: Instant,
    delivered_version: u64,
    pending: bool,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("push_interval", &self.shared.push_interval)
            .finish_non_exhaustive()
    }
}

/// Paths grouped by what happened to them during [StateStore::refresh_files].
#[derive(Debug, Default, PartialEq)]
pub struct RefreshOutcome {
    pub changed: Vec<PathBuf>,
    pub unreadable: Vec<PathBuf>,
}

impl RefreshOutcome {
    /// True when every path could be read.
    pub fn is_complete(&self) -> bool {
        self.unreadable.is_empty()
    }
}

impl StateStore {
    pub fn new(snapshot: StateSnapshot, push_interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            snapshot: Mutex::new(snapshot),
            subscribers: Mutex::new(Subscribers::default()),
            push_interval,
        });
        let (notifier, notifications) = bounded(1);

        let pusher_shared = shared.clone();
        spawn_named_thread(PUSHER_THREAD_NAME, move || {
            pusher_shared.push_loop(notifications)
        });

        Self { shared, notifier }
    }

    /// Applies `f` to the snapshot atomically, then schedules a push.
    pub fn mutate<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut StateSnapshot) -> R,
    {
        let result = {
            let mut snapshot = lock(&self.shared.snapshot);
            let result = f(&mut snapshot);
            snapshot.version += 1;
            result
        };
        self.schedule_push();
        result
    }

    /// Log sink for every stream. Nothing is published when all fragments were empty.
    pub fn append(&self, stream: LogStream, bytes: &[u8]) -> usize {
        let added = {
            let mut snapshot = lock(&self.shared.snapshot);
            let added = snapshot.log.append(stream, bytes);
            if added > 0 {
                snapshot.version += 1;
            }
            added
        };
        if added > 0 {
            self.schedule_push();
        }
        added
    }

    pub fn set_state(&self, state: ProcessState) {
        self.mutate(|s| s.transition(state));
    }

    pub fn set_running(&self, pid: u32) {
        self.mutate(|s| s.set_running(pid));
    }

    pub fn set_exited(&self, exit_code: i32) {
        self.mutate(|s| s.set_exited(exit_code));
    }

    pub fn state(&self) -> ProcessState {
        lock(&self.shared.snapshot).state
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.shared.snapshot()
    }

    /// Re-reads `paths` and stores the contents of those that changed. Files are read outside
    /// the lock, unreadable ones keep their previous contents.
    pub fn refresh_files<P: AsRef<Path>>(&self, paths: &[P]) -> RefreshOutcome {
        let mut outcome = RefreshOutcome::default();
        let mut contents = Vec::with_capacity(paths.len());
        for path in paths.iter().map(AsRef::as_ref) {
            match fs::read(path) {
                Ok(bytes) => contents.push((path, String::from_utf8_lossy(&bytes).into_owned())),
                Err(err) => {
                    warn!(path = %path.display(), "could not read configuration file: {err}");
                    outcome.unreadable.push(path.to_path_buf());
                }
            }
        }

        let changed: Vec<(&Path, String)> = {
            let current = lock(&self.shared.snapshot);
            contents
                .into_iter()
                .filter(|(path, text)| {
                    current.files.get(&path.display().to_string()) != Some(text)
                })
                .collect()
        };
        if !changed.is_empty() {
            self.mutate(|s| {
                for (path, text) in changed.iter() {
                    s.files.insert(path.display().to_string(), text.clone());
                }
            });
            outcome.changed = changed.into_iter().map(|(p, _)| p.to_path_buf()).collect();
        }
        debug!(
            changed = outcome.changed.len(),
            unreadable = outcome.unreadable.len(),
            "configuration files refreshed"
        );
        outcome
    }

    /// Subscribes with the store's default push interval.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_throttle(self.shared.push_interval)
    }

    /// The returned subscription already holds the current snapshot.
    pub fn subscribe_with_throttle(&self, throttle: Duration) -> Subscription {
        let (mailbox, receiver) = bounded(1);
        let mut subscribers = lock(&self.shared.subscribers);
        let current = Arc::new(self.shared.snapshot());
        let delivered_version = current.version;
        // A fresh mailbox always has room.
        let _ = mailbox.try_send(current);

        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.slots.push(Slot {
            id,
            mailbox,
            reclaim: receiver.clone(),
            throttle,
            last_push: Instant::now(),
            delivered_version,
            pending: false,
        });

        Subscription {
            id,
            receiver,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Detaches a subscriber. Returns false if it was not attached.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.shared.remove_subscriber(id)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.subscribers).slots.len()
    }

    fn schedule_push(&self) {
        // A full channel means a push is already scheduled and will pick this change up.
        let _ = self.notifier.try_send(());
    }
}

impl Shared {
    fn snapshot(&self) -> StateSnapshot {
        lock(&self.snapshot).clone()
    }

    fn remove_subscriber(&self, id: u64) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.slots.len();
        subscribers.slots.retain(|slot| slot.id != id);
        before != subscribers.slots.len()
    }

    /// Runs until every [StateStore] handle is gone.
    fn push_loop(&self, notifications: Receiver<()>) {
        let mut next_deadline: Option<Instant> = None;
        loop {
            let woke = match next_deadline {
                Some(deadline) => notifications.recv_deadline(deadline),
                None => notifications
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            if let Err(RecvTimeoutError::Disconnected) = woke {
                debug!("state store dropped, pusher exiting");
                return;
            }
            next_deadline = self.deliver();
        }
    }

    /// Offers the latest snapshot to every subscriber. Returns when the earliest throttled
    /// subscriber becomes eligible again, if any.
    fn deliver(&self) -> Option<Instant> {
        let latest = Arc::new(self.snapshot());
        let now = Instant::now();
        let mut subscribers = lock(&self.subscribers);
        subscribers.slots.retain_mut(|slot| slot.offer(&latest, now));
        subscribers
            .slots
            .iter()
            .filter(|slot| slot.pending)
            .map(|slot| slot.last_push + slot.throttle)
            .min()
    }
}

impl Slot {
    /// Returns false when the subscriber can no longer receive.
    fn offer(&mut self, latest: &Arc<StateSnapshot>, now: Instant) -> bool {
        if latest.version <= self.delivered_version {
            self.pending = false;
            return true;
        }
        if now < self.last_push + self.throttle {
            self.pending = true;
            return true;
        }

        let delivered = match self.mailbox.try_send(latest.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(snapshot)) => {
                let _ = self.reclaim.try_recv();
                !matches!(
                    self.mailbox.try_send(snapshot),
                    Err(TrySendError::Disconnected(_))
                )
            }
            Err(TrySendError::Disconnected(_)) => false,
        };
        self.pending = false;
        self.delivered_version = latest.version;
        self.last_push = now;
        delivered
    }
}

/// Receiving end of a subscription. Dropping it detaches the subscriber.
pub struct Subscription {
    id: u64,
    receiver: Receiver<Arc<StateSnapshot>>,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Blocks for the next snapshot. `None` once the subscriber was detached.
    pub fn recv(&self) -> Option<Arc<StateSnapshot>> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Arc<StateSnapshot>> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Result<Arc<StateSnapshot>, TryRecvError> {
        self.receiver.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_subscriber(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn store(push_interval: Duration) -> StateStore {
        StateStore::new(StateSnapshot::new(16), push_interval)
    }

    /// Receives until a snapshot with at least `version` shows up.
    fn recv_version(sub: &Subscription, version: u64) -> Arc<StateSnapshot> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let snapshot = sub
                .recv_timeout(remaining)
                .unwrap_or_else(|| panic!("version {version} was never delivered"));
            if snapshot.version >= version {
                return snapshot;
            }
        }
    }

    #[test]
    fn new_subscriber_gets_current_snapshot() {
        let store = store(DEFAULT_PUSH_INTERVAL);
        store.set_running(10);

        let sub = store.subscribe();
        let first = sub.try_recv().unwrap();

        assert_eq!(first.state, ProcessState::Running);
        assert_eq!(first.pid, Some(10));
        assert_eq!(first.version, 1);
    }

    #[test]
    fn latest_state_is_eventually_delivered() {
        let store = store(Duration::from_millis(20));
        let sub = store.subscribe();
        sub.try_recv().unwrap();

        store.set_state(ProcessState::Starting);
        store.set_running(7);
        store.set_exited(2);

        let last = recv_version(&sub, 3);
        assert_eq!(last.state, ProcessState::Exited);
        assert_eq!(last.exit_code, Some(2));
        assert_eq!(last.pid, None);
    }

    #[test]
    fn bursts_are_coalesced_by_throttle() {
        let throttle = Duration::from_millis(300);
        let store = store(throttle);
        let sub = store.subscribe();
        sub.try_recv().unwrap();

        for i in 0..50 {
            store.append(LogStream::Stdout, format!("line {i}\n").as_bytes());
        }

        let last = recv_version(&sub, 50);
        assert_eq!(last.log.len(), 16);
        assert_eq!(last.log.next_sequence(), 50);
        // Everything arrived in a single coalesced push.
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn slow_subscribers_do_not_block_writers() {
        let store = store(Duration::ZERO);
        let _never_read = store.subscribe();

        for _ in 0..1000 {
            store.set_state(ProcessState::Running);
        }
        assert_eq!(store.snapshot().version, 1000);
    }

    #[test]
    fn subscribers_have_independent_throttles() {
        let store = store(DEFAULT_PUSH_INTERVAL);
        let fast = store.subscribe_with_throttle(Duration::ZERO);
        let slow = store.subscribe_with_throttle(Duration::from_secs(60));
        fast.try_recv().unwrap();
        slow.try_recv().unwrap();

        store.set_running(1);

        assert_eq!(recv_version(&fast, 1).pid, Some(1));
        assert!(slow.recv_timeout(Duration::from_millis(200)).is_none());
    }

    #[test]
    fn unsubscribe_detaches() {
        let store = store(DEFAULT_PUSH_INTERVAL);
        let sub = store.subscribe();
        sub.try_recv().unwrap();
        assert_eq!(store.subscriber_count(), 1);

        assert!(store.unsubscribe(sub.id()));
        assert!(!store.unsubscribe(sub.id()));
        assert_eq!(store.subscriber_count(), 0);
        assert!(sub.recv().is_none());
    }

    #[test]
    fn dropping_subscription_detaches() {
        let store = store(DEFAULT_PUSH_INTERVAL);
        let sub = store.subscribe();
        drop(sub);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn empty_appends_do_not_bump_version() {
        let store = store(DEFAULT_PUSH_INTERVAL);
        assert_eq!(store.append(LogStream::Stderr, b"\x1b[0m"), 0);
        assert_eq!(store.snapshot().version, 0);
        assert_eq!(store.append(LogStream::Stderr, b"a\nb"), 2);
        assert_eq!(store.snapshot().version, 1);
    }

    #[test]
    fn refresh_files_updates_only_changed() {
        let store = store(DEFAULT_PUSH_INTERVAL);
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "key: 1").unwrap();
        let missing = file.path().with_extension("missing");
        let paths = vec![file.path().to_path_buf(), missing.clone()];

        let outcome = store.refresh_files(&paths);
        assert_eq!(outcome.changed, vec![file.path().to_path_buf()]);
        assert_eq!(outcome.unreadable, vec![missing]);
        assert!(!outcome.is_complete());
        let version = store.snapshot().version;

        let outcome = store.refresh_files(&paths[..1]);
        assert!(outcome.changed.is_empty());
        assert!(outcome.is_complete());
        assert_eq!(store.snapshot().version, version);

        write!(file, "\nother: 2").unwrap();
        let outcome = store.refresh_files(&paths[..1]);
        assert_eq!(outcome.changed.len(), 1);
        let key = file.path().display().to_string();
        assert_eq!(store.snapshot().files[&key], "key: 1\nother: 2");
    }

    #[test]
    fn unreadable_file_keeps_previous_contents() {
        let store = store(DEFAULT_PUSH_INTERVAL);
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "v1").unwrap();
        let path = file.path().to_path_buf();
        store.refresh_files(&[&path]);

        drop(file);
        let outcome = store.refresh_files(&[&path]);

        assert_eq!(outcome.unreadable, vec![path.clone()]);
        assert_eq!(store.snapshot().files[&path.display().to_string()], "v1");
    }
}
