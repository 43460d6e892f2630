//! Registry and lifecycle of active subjects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::events::active_subject::{ActiveSubject, BoundFn, Subscription};
use crate::events::clock::{Clock, SystemClock};
use crate::events::history::DnsResult;
use crate::protocols::protocol::DnsQuestion;
use crate::resolvers::resolve::Subject;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("already started")]
    AlreadyStarted,
    #[error("not started")]
    NotStarted,
    #[error("subject already activated: {0}")]
    AlreadyActive(String),
    #[error("subject not activated: {0}")]
    NotActive(String),
    #[error("subject not found: {0}")]
    SubjectNotFound(String),
}

/// Bounds for the TTL-derived refresh schedule.
#[derive(Debug, Clone, Copy)]
pub struct RefreshTimes {
    /// Lower bound; values below one second are lifted to one second.
    pub min: Duration,
    /// Upper bound; zero means unbounded.
    pub max: Duration,
    /// Slice subtracted from the TTL so a refresh lands before expiry.
    pub overlay: Duration,
}

impl Default for RefreshTimes {
    fn default() -> Self {
        RefreshTimes {
            min: Duration::from_secs(1),
            max: Duration::ZERO,
            overlay: Duration::ZERO,
        }
    }
}

/// Tunables shared by a stream and all its subjects.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Resolution results retained per subject.
    pub history_limit: usize,
    pub refresh_times: RefreshTimes,
    /// Poll interval of the blocking [`DnsEventStream::resolve`].
    pub wait_resolve: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            history_limit: 5,
            refresh_times: RefreshTimes::default(),
            wait_resolve: Duration::from_millis(100),
        }
    }
}

/// Stream-wide state handed to every active subject at construction, so the
/// subjects never need a reference back to the stream itself.
pub(crate) struct StreamShared {
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) history_limit: usize,
    pub(crate) refresh_times: RefreshTimes,
    pub(crate) wait_resolve: Duration,
}

/// The registry of active subjects, keyed by canonical question key.
///
/// Registry access is never held across a subject call, and subject locks
/// are never held while touching the registry.
pub struct DnsEventStream {
    subjects: DashMap<String, Arc<ActiveSubject>>,
    started: AtomicBool,
    shared: Arc<StreamShared>,
}

impl DnsEventStream {
    pub fn new(config: StreamConfig, clock: Arc<dyn Clock>) -> DnsEventStream {
        let stream = DnsEventStream {
            subjects: DashMap::new(),
            started: AtomicBool::new(false),
            shared: Arc::new(StreamShared {
                clock,
                history_limit: config.history_limit,
                refresh_times: config.refresh_times,
                wait_resolve: config.wait_resolve,
            }),
        };
        info!("created");
        stream
    }

    /// A stream driven by the wall clock.
    pub fn system(config: StreamConfig) -> DnsEventStream {
        Self::new(config, Arc::new(SystemClock))
    }

    pub fn start(&self) -> Result<(), EventError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EventError::AlreadyStarted);
        }
        info!("start");
        Ok(())
    }

    /// Deactivates every subject and clears the started flag.
    ///
    /// The subject map is kept; individual deactivation failures are logged
    /// and do not abort the stop.
    pub async fn stop(&self) -> Result<(), EventError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Err(EventError::NotStarted);
        }
        let subjects: Vec<Arc<ActiveSubject>> = self
            .subjects
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for subject in subjects {
            if let Err(err) = subject.deactivate().await {
                debug!(subject = %subject.key(), error = %err, "deactivate on stop");
            }
        }
        info!("stop");
        Ok(())
    }

    /// Registers a subject, returning the existing active subject when one
    /// is already known under the same canonical key.
    ///
    /// The subject is not activated; callers activate explicitly.
    pub fn create_subject(
        &self,
        subject: Arc<dyn Subject>,
    ) -> Result<Arc<ActiveSubject>, EventError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(EventError::NotStarted);
        }
        let key = subject.key().key();

        let mut created = false;
        let active = match self.subjects.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                created = true;
                let active = ActiveSubject::new(subject.clone(), Arc::clone(&self.shared));
                entry.insert(active.clone());
                active
            }
        };

        if created {
            // Attach outside the registry shard lock.
            subject.attach(&active);
            metrics::gauge!("dnswall_active_subjects", self.subjects.len() as f64);
            info!(subject = %key, "added");
        } else {
            debug!(subject = %key, "already added");
        }
        Ok(active)
    }

    /// Drops the registry entry for the question.
    ///
    /// The returned active subject stays usable by anyone still holding it,
    /// but it is orphaned now: deactivation is the caller's business.
    pub fn remove_subject(
        &self,
        question: &DnsQuestion,
    ) -> Result<Arc<ActiveSubject>, EventError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(EventError::NotStarted);
        }
        let key = question.key();
        match self.subjects.remove(&key) {
            Some((_, active)) => {
                metrics::gauge!("dnswall_active_subjects", self.subjects.len() as f64);
                info!(subject = %key, "removed");
                Ok(active)
            }
            None => Err(EventError::SubjectNotFound(key)),
        }
    }

    /// Looks up a registered subject by question.
    pub fn get_subject(&self, question: &DnsQuestion) -> Option<Arc<ActiveSubject>> {
        self.subjects.get(&question.key()).map(|e| e.value().clone())
    }

    /// Registers the subject (if needed) and binds a subscriber to it.
    pub async fn bind(
        &self,
        subject: Arc<dyn Subject>,
        callback: BoundFn,
    ) -> Result<Subscription, EventError> {
        let active = self.create_subject(subject)?;
        Ok(active.bind(callback).await)
    }

    /// Blocking read: registers and activates the subject when necessary,
    /// then polls until the background refresh has produced either records
    /// or an error.
    pub async fn resolve(&self, subject: Arc<dyn Subject>) -> Result<DnsResult, EventError> {
        let active = self.create_subject(subject)?;
        if !active.is_active().await {
            if let Err(err) = active.activate().await {
                if !matches!(err, EventError::AlreadyActive(_)) {
                    return Err(err);
                }
            }
        }

        let mut outcome = active.resolve().await;
        if matches!(outcome, Err(EventError::NotActive(_))) {
            info!(subject = %active.key(), "waiting for activation");
            tokio::time::sleep(self.shared.wait_resolve).await;
            outcome = active.resolve().await;
        }

        let mut result = outcome?;
        while result.error.is_none() && result.records.is_empty() {
            info!(subject = %active.key(), "waiting for results");
            tokio::time::sleep(self.shared.wait_resolve).await;
            result = active.resolve().await?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::{
        notifications, wait_until, MockClock, ScriptStep, ScriptedSubject,
    };
    use crate::protocols::protocol::{DnsRecord, QueryType, TransientTtl};
    use std::net::Ipv4Addr;

    fn a_record(last: u8) -> DnsRecord {
        DnsRecord::A {
            domain: "test".to_string(),
            addr: Ipv4Addr::new(last, 0, 0, 0),
            ttl: TransientTtl(10),
        }
    }

    fn scripted(name: &str) -> Arc<ScriptedSubject> {
        Arc::new(ScriptedSubject::new(
            name,
            QueryType::A,
            vec![ScriptStep::Answer(vec![a_record(1)])],
        ))
    }

    fn stream_with(clock: Arc<MockClock>) -> DnsEventStream {
        DnsEventStream::new(StreamConfig::default(), clock)
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let stream = stream_with(MockClock::parked());

        match stream.stop().await {
            Err(EventError::NotStarted) => {}
            other => panic!("expected NotStarted, got {:?}", other),
        }
        assert!(matches!(
            stream.create_subject(scripted("www.example.com")),
            Err(EventError::NotStarted)
        ));
        assert!(matches!(
            stream.remove_subject(&DnsQuestion::new("www.example.com".to_string(), QueryType::A)),
            Err(EventError::NotStarted)
        ));

        stream.start().unwrap();
        assert!(matches!(stream.start(), Err(EventError::AlreadyStarted)));

        stream.stop().await.unwrap();
        assert!(matches!(stream.stop().await, Err(EventError::NotStarted)));
    }

    #[tokio::test]
    async fn test_create_subject_is_idempotent() {
        let stream = stream_with(MockClock::parked());
        stream.start().unwrap();

        for i in 0..10 {
            let name = format!("www{}.example.com", i);
            let first = stream.create_subject(scripted(&name)).unwrap();
            let second = stream.create_subject(scripted(&name)).unwrap();
            assert!(
                Arc::ptr_eq(&first, &second),
                "same canonical key must map to the same active subject"
            );
        }

        stream.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_subject_canonicalizes_case_and_dots() {
        let stream = stream_with(MockClock::parked());
        stream.start().unwrap();

        let upper = stream.create_subject(scripted("EXAMPLE.COM")).unwrap();
        let dotted = stream.create_subject(scripted("example.com.")).unwrap();
        assert!(Arc::ptr_eq(&upper, &dotted));

        stream.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_subject_orphans_but_keeps_usable() {
        let stream = stream_with(MockClock::parked());
        stream.start().unwrap();

        let question = DnsQuestion::new("www.example.com".to_string(), QueryType::A);
        let active = stream.create_subject(scripted("www.example.com")).unwrap();
        active.activate().await.unwrap();

        let removed = stream.remove_subject(&question).unwrap();
        assert!(Arc::ptr_eq(&active, &removed));
        assert!(stream.get_subject(&question).is_none());

        match stream.remove_subject(&question) {
            Err(EventError::SubjectNotFound(key)) => {
                assert_eq!("www.example.com:IN:A", key)
            }
            other => panic!("expected SubjectNotFound, got {:?}", other),
        }

        // Removal did not deactivate: that stays with the caller.
        assert!(removed.is_active().await);
        removed.deactivate().await.unwrap();
        assert!(matches!(
            removed.deactivate().await,
            Err(EventError::NotActive(_))
        ));

        stream.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_deactivates_all_subjects() {
        let stream = stream_with(MockClock::parked());
        stream.start().unwrap();

        let mut subjects = Vec::new();
        for i in 0..3 {
            let active = stream
                .create_subject(scripted(&format!("www{}.example.com", i)))
                .unwrap();
            active.activate().await.unwrap();
            subjects.push(active);
        }

        stream.stop().await.unwrap();
        for active in subjects {
            assert!(!active.is_active().await);
        }
    }

    #[tokio::test]
    async fn test_resolve_waits_for_first_result() {
        let clock = MockClock::parked();
        let stream = stream_with(clock);
        stream.start().unwrap();

        let subject = scripted("www.example.com");
        let result = stream.resolve(subject.clone()).await.unwrap();
        assert_eq!(vec![a_record(1)], result.records);
        assert!(result.error.is_none());
        assert_eq!(1, subject.calls());

        stream.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_then_resolve_notifies_subscriber() {
        let clock = MockClock::with_budget(2);
        let stream = stream_with(clock);
        stream.start().unwrap();

        let subject = Arc::new(ScriptedSubject::new(
            "www.example.com",
            QueryType::A,
            vec![
                ScriptStep::Answer(vec![a_record(1)]),
                ScriptStep::Answer(vec![a_record(2)]),
            ],
        ));

        let (callback, log) = notifications();
        stream.bind(subject.clone(), callback).await.unwrap();

        let result = stream.resolve(subject.clone()).await.unwrap();
        assert_eq!(vec![a_record(1)], result.records);

        {
            let log = log.clone();
            wait_until(move || log.lock().unwrap().len() >= 2).await;
        }

        let snapshots = log.lock().unwrap();
        assert_eq!(vec![a_record(1)], snapshots[0][0].records);
        assert_eq!(vec![a_record(2)], snapshots[1][0].records);

        drop(snapshots);
        stream.stop().await.unwrap();
    }
}
