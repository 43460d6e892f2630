//! Scripted subjects and clocks shared by the event engine tests.

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};

use crate::events::active_subject::BoundFn;
use crate::events::clock::{CancelToken, Clock, DelayResult};
use crate::events::history::DnsResult;
use crate::events::stream::{StreamConfig, StreamShared};
use crate::protocols::protocol::{DnsQuestion, DnsRecord, QueryType};
use crate::resolvers::resolve::{ResolveError, Result as ResolveResult, Subject};

#[derive(Clone)]
pub(crate) enum ScriptStep {
    Answer(Vec<DnsRecord>),
    Fail,
}

/// Subject answering from a fixed script; the last step repeats forever.
pub(crate) struct ScriptedSubject {
    question: DnsQuestion,
    steps: Vec<ScriptStep>,
    calls: AtomicUsize,
}

impl ScriptedSubject {
    pub(crate) fn new(name: &str, qtype: QueryType, steps: Vec<ScriptStep>) -> ScriptedSubject {
        ScriptedSubject {
            question: DnsQuestion::new(name.to_string(), qtype),
            steps,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Subject for ScriptedSubject {
    fn key(&self) -> DnsQuestion {
        self.question.clone()
    }

    async fn resolve(&self) -> ResolveResult<Vec<DnsRecord>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .get(call)
            .or_else(|| self.steps.last())
            .cloned()
            .expect("scripted subject needs at least one step");
        match step {
            ScriptStep::Answer(records) => Ok(records),
            ScriptStep::Fail => Err(ResolveError::TimeOut),
        }
    }
}

/// Clock that records every requested delay.
///
/// The first `budget` delays elapse after a short real sleep; every delay
/// beyond the budget parks until its token is cancelled.
pub(crate) struct MockClock {
    delays: Mutex<Vec<Duration>>,
    budget: AtomicIsize,
    interrupted: AtomicUsize,
}

impl MockClock {
    pub(crate) fn with_budget(budget: isize) -> Arc<MockClock> {
        Arc::new(MockClock {
            delays: Mutex::new(Vec::new()),
            budget: AtomicIsize::new(budget),
            interrupted: AtomicUsize::new(0),
        })
    }

    /// Every delay parks until cancelled.
    pub(crate) fn parked() -> Arc<MockClock> {
        Self::with_budget(0)
    }

    pub(crate) fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }

    pub(crate) fn interrupted(&self) -> usize {
        self.interrupted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    async fn delay(&self, duration: Duration, cancel: &CancelToken) -> DelayResult {
        self.delays.lock().unwrap().push(duration);
        if self.budget.fetch_sub(1, Ordering::SeqCst) > 0 {
            // Short real sleep so the refresh chain interleaves with the
            // test body instead of spinning.
            tokio::time::sleep(Duration::from_millis(1)).await;
            if cancel.is_cancelled() {
                self.interrupted.fetch_add(1, Ordering::SeqCst);
                return DelayResult::Interrupted;
            }
            DelayResult::Elapsed
        } else {
            cancel.cancelled().await;
            self.interrupted.fetch_add(1, Ordering::SeqCst);
            DelayResult::Interrupted
        }
    }
}

pub(crate) fn shared_with(config: StreamConfig, clock: Arc<MockClock>) -> Arc<StreamShared> {
    Arc::new(StreamShared {
        clock,
        history_limit: config.history_limit,
        refresh_times: config.refresh_times,
        wait_resolve: config.wait_resolve,
    })
}

pub(crate) type NotifyLog = Arc<Mutex<Vec<Vec<Arc<DnsResult>>>>>;

/// A subscriber callback recording every snapshot it is handed.
pub(crate) fn notifications() -> (BoundFn, NotifyLog) {
    let log: NotifyLog = Arc::new(Mutex::new(Vec::new()));
    let writer = log.clone();
    let callback: BoundFn = Box::new(move |snapshot: &[Arc<DnsResult>]| {
        writer.lock().unwrap().push(snapshot.to_vec());
    });
    (callback, log)
}

/// Polls `predicate` until it holds, failing the test after two seconds.
pub(crate) async fn wait_until(predicate: impl Fn() -> bool) {
    for _ in 0..1000 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached within 2s");
}
