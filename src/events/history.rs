//! Per-subject resolution history, newest first.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::protocols::protocol::DnsRecord;
use crate::resolvers::resolve::ResolveError;

/// One resolution outcome with its timing.
///
/// An errored result carries whatever the resolver returned, which for the
/// built-in resolvers means an empty record list.
#[derive(Debug, Clone)]
pub struct DnsResult {
    pub records: Vec<DnsRecord>,
    pub error: Option<Arc<ResolveError>>,
    pub created: DateTime<Local>,
    pub elapsed: Duration,
}

impl DnsResult {
    pub fn is_good(&self) -> bool {
        self.error.is_none()
    }
}

/// Fixed-capacity, newest-first sequence of resolution results.
#[derive(Debug)]
pub struct History {
    entries: Vec<Arc<DnsResult>>,
    limit: usize,
}

impl History {
    /// A capacity below one is lifted to one.
    pub fn new(limit: usize) -> History {
        let limit = limit.max(1);
        History {
            entries: Vec::with_capacity(limit),
            limit,
        }
    }

    /// Pushes a result to the front, evicting the oldest entry on overflow.
    pub fn push(&mut self, result: Arc<DnsResult>) {
        if self.entries.len() == self.limit {
            self.entries.pop();
        }
        self.entries.insert(0, result);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most recent result.
    pub fn newest(&self) -> Option<&Arc<DnsResult>> {
        self.entries.first()
    }

    /// The most recent result that did not fail.
    pub fn last_good(&self) -> Option<&Arc<DnsResult>> {
        self.entries.iter().find(|e| e.is_good())
    }

    /// The most recent result carrying at least one record.
    pub fn last_with_records(&self) -> Option<&Arc<DnsResult>> {
        self.entries.iter().find(|e| !e.records.is_empty())
    }

    /// Shallow copy of the entries, newest first.
    pub fn snapshot(&self) -> Vec<Arc<DnsResult>> {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::protocol::TransientTtl;
    use crate::resolvers::resolve::ResolveError;
    use std::net::Ipv4Addr;

    fn result(i: u8, error: bool) -> Arc<DnsResult> {
        Arc::new(DnsResult {
            records: vec![DnsRecord::A {
                domain: "test".to_string(),
                addr: Ipv4Addr::new(i, 0, 0, 0),
                ttl: TransientTtl(i as u32),
            }],
            error: error.then(|| Arc::new(ResolveError::TimeOut)),
            created: Local::now(),
            elapsed: Duration::ZERO,
        })
    }

    #[test]
    fn test_push_keeps_newest_first_and_bounded() {
        let mut history = History::new(4);
        for i in 0..8u8 {
            history.push(result(i, false));
            if i < 4 {
                assert_eq!(i as usize + 1, history.len());
            } else {
                assert_eq!(4, history.len());
            }

            // Entries run from newest (i) down to oldest.
            for (j, entry) in history.snapshot().iter().enumerate() {
                let expected = i - j as u8;
                assert_eq!(
                    Ipv4Addr::new(expected, 0, 0, 0).to_string(),
                    match &entry.records[0] {
                        DnsRecord::A { addr, .. } => addr.to_string(),
                        other => panic!("unexpected record {:?}", other),
                    }
                );
            }
        }
    }

    #[test]
    fn test_capacity_below_one_is_lifted() {
        let mut history = History::new(0);
        history.push(result(1, false));
        history.push(result(2, false));
        assert_eq!(1, history.len());
    }

    #[test]
    fn test_last_good_skips_errored_entries() {
        let mut history = History::new(5);
        history.push(result(1, false));
        history.push(result(2, true));
        history.push(result(3, true));

        let good = history.last_good().expect("one good entry");
        assert_eq!(result(1, false).records, good.records);
        assert!(history.newest().unwrap().error.is_some());
    }

    #[test]
    fn test_last_with_records_skips_empty_entries() {
        let mut history = History::new(5);
        history.push(result(7, false));
        history.push(Arc::new(DnsResult {
            records: Vec::new(),
            error: Some(Arc::new(ResolveError::TimeOut)),
            created: Local::now(),
            elapsed: Duration::ZERO,
        }));

        let latest = history.last_with_records().expect("entry with records");
        assert_eq!(result(7, false).records, latest.records);
    }
}
