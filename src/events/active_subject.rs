//! Per-subject runtime: history, refresh timer, subscriber table.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::events::actions::to_actions;
use crate::events::clock::{CancelToken, Clock, DelayResult};
use crate::events::history::{DnsResult, History};
use crate::events::stream::{EventError, StreamShared};
use crate::protocols::protocol::DnsQuestion;
use crate::resolvers::resolve::Subject;

/// Subscriber callback, invoked with a newest-first history snapshot.
pub type BoundFn = Box<dyn Fn(&[Arc<DnsResult>]) + Send + Sync>;

struct SubjectState {
    activated: bool,
    refresh_scheduled: bool,
    cancel: CancelToken,
    history: History,
    subscribers: HashMap<Uuid, BoundFn>,
}

/// The runtime wrapper of a subject.
///
/// Owns the resolution history, the refresh timer and the subscriber table.
/// One mutex serializes activate/deactivate/resolve/refresh, so at most one
/// refresh body runs at a time per subject.
pub struct ActiveSubject {
    subject: Arc<dyn Subject>,
    key: String,
    shared: Arc<StreamShared>,
    state: Mutex<SubjectState>,
}

impl std::fmt::Debug for ActiveSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSubject")
            .field("key", &self.key)
            .finish()
    }
}

impl ActiveSubject {
    pub(crate) fn new(subject: Arc<dyn Subject>, shared: Arc<StreamShared>) -> Arc<ActiveSubject> {
        let key = subject.key().key();
        let history = History::new(shared.history_limit);
        Arc::new(ActiveSubject {
            subject,
            key,
            shared,
            state: Mutex::new(SubjectState {
                activated: false,
                refresh_scheduled: false,
                cancel: CancelToken::new(),
                history,
                subscribers: HashMap::new(),
            }),
        })
    }

    /// Canonical question key of this subject.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn question(&self) -> DnsQuestion {
        self.subject.key()
    }

    pub fn subject(&self) -> &Arc<dyn Subject> {
        &self.subject
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.activated
    }

    /// Shallow copy of the current history, newest first.
    pub async fn history(&self) -> Vec<Arc<DnsResult>> {
        self.state.lock().await.history.snapshot()
    }

    /// Registers a subscriber; the returned handle removes it again.
    ///
    /// Binding is allowed while inactive; notifications begin once the
    /// subject is activated. Callbacks run while the subject's lock is held:
    /// they must not call back into the subject and should return quickly.
    pub async fn bind(self: &Arc<Self>, callback: BoundFn) -> Subscription {
        let id = Uuid::new_v4();
        self.state.lock().await.subscribers.insert(id, callback);
        Subscription {
            id,
            subject: Arc::downgrade(self),
        }
    }

    /// Marks the subject active and runs the first refresh inline, so the
    /// first result is observable by the time this returns.
    pub async fn activate(self: &Arc<Self>) -> Result<(), EventError> {
        let mut state = self.state.lock().await;
        if state.activated {
            return Err(EventError::AlreadyActive(self.key.clone()));
        }
        info!(subject = %self.key, "activate");
        state.activated = true;
        state.cancel = CancelToken::new();
        self.refresh_locked(&mut state).await;
        Ok(())
    }

    /// Cancels the pending refresh and clears the subscriber table.
    ///
    /// History is kept. A resolver call already in flight is not
    /// interrupted; its refresh body observes the deactivation and returns
    /// without rescheduling or notifying.
    pub async fn deactivate(&self) -> Result<(), EventError> {
        let mut state = self.state.lock().await;
        if !state.activated {
            return Err(EventError::NotActive(self.key.clone()));
        }
        state.cancel.cancel();
        state.refresh_scheduled = false;
        state.subscribers.clear();
        state.activated = false;
        info!(subject = %self.key, "deactivate");
        Ok(())
    }

    /// Synchronous read of the current state.
    ///
    /// Combines the most recent error with the records of the most recent
    /// entry that has any, so readers keep seeing last-known-good records
    /// through a transient resolver failure.
    pub async fn resolve(&self) -> Result<DnsResult, EventError> {
        let state = self.state.lock().await;
        if !state.activated {
            return Err(EventError::NotActive(self.key.clone()));
        }

        let mut result = DnsResult {
            records: Vec::new(),
            error: None,
            created: self.shared.clock.now(),
            elapsed: Duration::ZERO,
        };
        if let Some(newest) = state.history.newest() {
            result.error = newest.error.clone();
        }
        if let Some(with_records) = state.history.last_with_records() {
            result.records = with_records.records.clone();
        }
        Ok(result)
    }

    /// One refresh step: resolve, diff, record, reschedule, notify.
    pub async fn refresh(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        state.refresh_scheduled = false;
        if !state.activated {
            debug!(subject = %self.key, "not activated");
            return;
        }
        self.refresh_locked(&mut state).await;
    }

    async fn refresh_locked(self: &Arc<Self>, state: &mut SubjectState) {
        let start = self.shared.clock.now();
        let (records, error) = match self.subject.resolve().await {
            Ok(records) => (records, None),
            Err(err) => (Vec::new(), Some(Arc::new(err))),
        };
        let elapsed = (self.shared.clock.now() - start)
            .to_std()
            .unwrap_or(Duration::ZERO);

        metrics::increment_counter!("dnswall_refresh_total");
        metrics::histogram!("dnswall_resolve_duration_seconds", elapsed.as_secs_f64());
        if error.is_some() {
            metrics::increment_counter!("dnswall_resolve_errors_total");
        }

        let result = Arc::new(DnsResult {
            records,
            error,
            created: start,
            elapsed,
        });

        let last_good = state
            .history
            .last_good()
            .map(|entry| entry.records.clone())
            .unwrap_or_default();
        let actions = to_actions(&result.records, &last_good);

        let first = state.history.is_empty();
        state.history.push(result.clone());

        let delay = self.next_delay(&result);
        if !state.refresh_scheduled {
            state.refresh_scheduled = true;
            self.schedule(delay, state.cancel.clone());
        }

        if first || !actions.is_empty() {
            debug!(
                subject = %self.key,
                actions = actions.len(),
                history = state.history.len(),
                "notifying subscribers"
            );
            let snapshot = state.history.snapshot();
            for (id, callback) in state.subscribers.iter() {
                // A panicking subscriber must not break delivery to the rest.
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(&snapshot)
                }));
                if outcome.is_err() {
                    error!(subject = %self.key, subscription = %id, "subscriber panicked");
                }
            }
        }
    }

    /// Derives the next refresh delay from the newest result.
    fn next_delay(&self, newest: &DnsResult) -> Duration {
        let times = &self.shared.refresh_times;

        let mut delay = Duration::from_secs(1);
        if newest.is_good() && !newest.records.is_empty() {
            let min_ttl = newest
                .records
                .iter()
                .map(|record| record.get_ttl())
                .min()
                .unwrap_or(0);
            delay = Duration::from_secs(min_ttl as u64);
        }

        if delay > times.overlay {
            delay -= times.overlay;
        }

        let floor = times.min.max(Duration::from_secs(1));
        if delay < floor {
            delay = floor;
        }
        if !times.max.is_zero() && times.max > floor && delay > times.max {
            delay = times.max;
        }
        delay
    }

    /// Spawns the timer task for the next refresh. The task waits outside
    /// the subject lock and holds only a weak reference.
    fn schedule(self: &Arc<Self>, delay: Duration, cancel: CancelToken) {
        debug!(subject = %self.key, delay = ?delay, "scheduling refresh");
        let weak = Arc::downgrade(self);
        let clock = self.shared.clock.clone();
        tokio::spawn(async move {
            if clock.delay(delay, &cancel).await == DelayResult::Interrupted {
                return;
            }
            if let Some(subject) = weak.upgrade() {
                subject.refresh().await;
            }
        });
    }
}

/// Handle returned by [`ActiveSubject::bind`].
pub struct Subscription {
    id: Uuid,
    subject: Weak<ActiveSubject>,
}

impl Subscription {
    /// Removes the subscriber this handle was created for.
    pub async fn revoke(&self) {
        if let Some(subject) = self.subject.upgrade() {
            subject.state.lock().await.subscribers.remove(&self.id);
        }
    }
}
