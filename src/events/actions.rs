//! Pure diff between two record sets.

use std::sync::Arc;

use crate::events::history::DnsResult;
use crate::protocols::protocol::DnsRecord;

/// One unit of diff output between successive resolutions.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Add { idx: usize, record: DnsRecord },
    Remove { idx: usize, record: DnsRecord },
    Change {
        idx: usize,
        prev: DnsRecord,
        current: DnsRecord,
    },
}

fn sorted_uniq(records: &[DnsRecord]) -> Vec<DnsRecord> {
    let mut out = records.to_vec();
    out.sort();
    out.dedup();
    out
}

/// Computes the ordered action list turning `old` into `new`.
///
/// Both inputs are sorted by canonical form and de-duplicated first, then
/// walked in parallel by index. This is an index-zipped set difference, not
/// a minimum edit script: consumers treat positions as opaque and only care
/// about the effective difference.
pub fn to_actions(new: &[DnsRecord], old: &[DnsRecord]) -> Vec<Action> {
    let new = sorted_uniq(new);
    let old = sorted_uniq(old);

    let mut actions = Vec::with_capacity(new.len().max(old.len()));
    for (idx, record) in new.iter().enumerate() {
        if idx >= old.len() {
            actions.push(Action::Add {
                idx,
                record: record.clone(),
            });
            continue;
        }
        if record == &old[idx] {
            continue;
        }
        actions.push(Action::Change {
            idx,
            prev: old[idx].clone(),
            current: record.clone(),
        });
    }
    for (idx, record) in old.iter().enumerate().skip(new.len()) {
        actions.push(Action::Remove {
            idx,
            record: record.clone(),
        });
    }
    actions
}

/// Recomputes the actions between the newest snapshot entry and the last
/// good result before it.
///
/// Subscriber-side counterpart of the refresh diff: a snapshot alone is
/// enough to derive the rule changes it implies.
pub fn current_actions(history: &[Arc<DnsResult>]) -> Vec<Action> {
    let Some(current) = history.first() else {
        return Vec::new();
    };
    match history.iter().skip(1).find(|e| e.is_good()) {
        Some(prev) => to_actions(&current.records, &prev.records),
        None => to_actions(&current.records, &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::protocol::TransientTtl;
    use std::net::Ipv4Addr;

    fn a(last: u8) -> DnsRecord {
        DnsRecord::A {
            domain: "test".to_string(),
            addr: Ipv4Addr::new(last, 0, 0, 0),
            ttl: TransientTtl(10),
        }
    }

    #[test]
    fn test_empty_against_empty_is_empty() {
        assert!(to_actions(&[], &[]).is_empty());
    }

    #[test]
    fn test_identical_sets_yield_no_actions() {
        let records = vec![a(1), a(2), a(3)];
        assert!(to_actions(&records, &records).is_empty());
    }

    #[test]
    fn test_duplicates_collapse() {
        let dup = vec![a(1), a(1)];
        assert!(to_actions(&dup, &dup).is_empty());

        let actions = to_actions(&dup, &[]);
        assert_eq!(vec![Action::Add { idx: 0, record: a(1) }], actions);
    }

    #[test]
    fn test_adds_emitted_at_ascending_indices() {
        let actions = to_actions(&[a(3), a(1), a(2)], &[]);
        assert_eq!(
            vec![
                Action::Add { idx: 0, record: a(1) },
                Action::Add { idx: 1, record: a(2) },
                Action::Add { idx: 2, record: a(3) },
            ],
            actions
        );
    }

    #[test]
    fn test_removes_only_when_new_is_empty() {
        let actions = to_actions(&[], &[a(1), a(1)]);
        assert_eq!(vec![Action::Remove { idx: 0, record: a(1) }], actions);
    }

    #[test]
    fn test_grown_set_appends() {
        let actions = to_actions(&[a(1), a(2)], &[a(1)]);
        assert_eq!(vec![Action::Add { idx: 1, record: a(2) }], actions);
    }

    #[test]
    fn test_replaced_record_is_a_change() {
        // First resolve 1.1.1.1 + 2.2.2.2, second resolve 1.1.1.1 + 3.3.3.3.
        let one = DnsRecord::A {
            domain: "test".to_string(),
            addr: Ipv4Addr::new(1, 1, 1, 1),
            ttl: TransientTtl(10),
        };
        let two = DnsRecord::A {
            domain: "test".to_string(),
            addr: Ipv4Addr::new(2, 2, 2, 2),
            ttl: TransientTtl(10),
        };
        let three = DnsRecord::A {
            domain: "test".to_string(),
            addr: Ipv4Addr::new(3, 3, 3, 3),
            ttl: TransientTtl(10),
        };

        let actions = to_actions(
            &[one.clone(), three.clone()],
            &[one.clone(), two.clone()],
        );
        assert_eq!(
            vec![Action::Change {
                idx: 1,
                prev: two,
                current: three,
            }],
            actions
        );
    }

    #[test]
    fn test_unsorted_input_is_sorted_before_diffing() {
        // sorted new: 1,2,3 / sorted old: 1,2 -> one append at index 2
        let actions = to_actions(&[a(1), a(3), a(2)], &[a(1), a(2)]);
        assert_eq!(vec![Action::Add { idx: 2, record: a(3) }], actions);
    }

    #[test]
    fn test_shrunk_set_removes_tail() {
        let actions = to_actions(&[a(1)], &[a(1), a(2), a(3)]);
        assert_eq!(
            vec![
                Action::Remove { idx: 1, record: a(2) },
                Action::Remove { idx: 2, record: a(3) },
            ],
            actions
        );
    }

    /// Applying the actions to the old set reproduces the new set.
    #[test]
    fn test_actions_commute_at_set_level() {
        let cases: Vec<(Vec<DnsRecord>, Vec<DnsRecord>)> = vec![
            (vec![], vec![]),
            (vec![a(1)], vec![]),
            (vec![], vec![a(1)]),
            (vec![a(1), a(2), a(5)], vec![a(2), a(3)]),
            (vec![a(9), a(1)], vec![a(9), a(1)]),
            (vec![a(4)], vec![a(1), a(2), a(3)]),
        ];

        for (new, old) in cases {
            let mut applied: Vec<DnsRecord> = {
                let mut sorted = old.clone();
                sorted.sort();
                sorted.dedup();
                sorted
            };
            for action in to_actions(&new, &old) {
                match action {
                    Action::Add { record, .. } => applied.push(record),
                    Action::Remove { record, .. } => applied.retain(|r| r != &record),
                    Action::Change { prev, current, .. } => {
                        applied.retain(|r| r != &prev);
                        applied.push(current);
                    }
                }
            }
            applied.sort();

            let mut expected = new.clone();
            expected.sort();
            expected.dedup();
            assert_eq!(expected, applied);
        }
    }

    #[test]
    fn test_current_actions_diffs_newest_against_last_good() {
        use crate::resolvers::resolve::ResolveError;
        use chrono::Local;
        use std::time::Duration;

        let entry = |records: Vec<DnsRecord>, error: bool| {
            Arc::new(DnsResult {
                records,
                error: error.then(|| Arc::new(ResolveError::TimeOut)),
                created: Local::now(),
                elapsed: Duration::ZERO,
            })
        };

        // Newest first: a good result, an errored one, then the previous good.
        let history = vec![
            entry(vec![a(1), a(3)], false),
            entry(vec![], true),
            entry(vec![a(1), a(2)], false),
        ];

        let actions = current_actions(&history);
        assert_eq!(
            vec![Action::Change { idx: 1, prev: a(2), current: a(3) }],
            actions
        );

        assert!(current_actions(&[]).is_empty());
    }
}
