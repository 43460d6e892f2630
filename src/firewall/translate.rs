//! Turns record diffs into firewall rule operations.

use ipnetwork::IpNetwork;

use crate::events::actions::Action;
use crate::protocols::protocol::DnsRecord;

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("record type {0} carries no enforceable address")]
    UnsupportedRecord(String),
    #[error("no parseable CIDR among TXT strings: {0:?}")]
    NoCidr(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    Add,
    Remove,
}

/// Extracts the address a record permits.
///
/// A records yield the dotted quad, AAAA the compressed hex form, TXT the
/// first text that parses as a CIDR (returned verbatim, prefix included).
/// CNAMEs carry no address of their own and are skipped.
pub fn record_ip(record: &DnsRecord) -> Result<Option<String>, TranslateError> {
    match record {
        DnsRecord::A { addr, .. } => Ok(Some(addr.to_string())),
        DnsRecord::AAAA { addr, .. } => Ok(Some(addr.to_string())),
        DnsRecord::TXT { data, .. } => {
            for text in data {
                if text.parse::<IpNetwork>().is_ok() {
                    return Ok(Some(text.clone()));
                }
            }
            Err(TranslateError::NoCidr(data.clone()))
        }
        DnsRecord::CNAME { .. } => Ok(None),
        other => Err(TranslateError::UnsupportedRecord(
            other.get_querytype().to_string(),
        )),
    }
}

/// Flattens a diff into ordered `(op, address)` pairs.
///
/// A change removes the previous address before adding the new one; changes
/// whose addresses coincide are dropped. Untranslatable records are
/// collected rather than aborting the whole batch.
pub fn to_rule_ops(actions: &[Action]) -> (Vec<(RuleOp, String)>, Vec<TranslateError>) {
    let mut ops = Vec::new();
    let mut errors = Vec::new();

    for action in actions {
        match action {
            Action::Add { record, .. } => match record_ip(record) {
                Ok(Some(ip)) => ops.push((RuleOp::Add, ip)),
                Ok(None) => {}
                Err(err) => errors.push(err),
            },
            Action::Remove { record, .. } => match record_ip(record) {
                Ok(Some(ip)) => ops.push((RuleOp::Remove, ip)),
                Ok(None) => {}
                Err(err) => errors.push(err),
            },
            Action::Change { prev, current, .. } => match (record_ip(prev), record_ip(current)) {
                (Ok(Some(prev_ip)), Ok(Some(current_ip))) => {
                    if prev_ip != current_ip {
                        ops.push((RuleOp::Remove, prev_ip));
                        ops.push((RuleOp::Add, current_ip));
                    }
                }
                (Ok(_), Ok(_)) => {}
                (Err(err), _) | (_, Err(err)) => errors.push(err),
            },
        }
    }

    (ops, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::protocol::TransientTtl;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn a(last: u8) -> DnsRecord {
        DnsRecord::A {
            domain: "test".to_string(),
            addr: Ipv4Addr::new(1, 1, 1, last),
            ttl: TransientTtl(10),
        }
    }

    #[test]
    fn test_record_ip_per_type() {
        assert_eq!(Some("1.1.1.9".to_string()), record_ip(&a(9)).unwrap());

        let aaaa = DnsRecord::AAAA {
            domain: "test".to_string(),
            addr: Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1),
            ttl: TransientTtl(10),
        };
        assert_eq!(Some("2001:db8::1".to_string()), record_ip(&aaaa).unwrap());

        let txt = DnsRecord::TXT {
            domain: "test".to_string(),
            data: vec!["not a cidr".to_string(), "10.0.0.0/24".to_string()],
            ttl: TransientTtl(10),
        };
        assert_eq!(Some("10.0.0.0/24".to_string()), record_ip(&txt).unwrap());

        let cname = DnsRecord::CNAME {
            domain: "test".to_string(),
            host: "other.test".to_string(),
            ttl: TransientTtl(10),
        };
        assert_eq!(None, record_ip(&cname).unwrap());

        let garbage = DnsRecord::TXT {
            domain: "test".to_string(),
            data: vec!["hello".to_string()],
            ttl: TransientTtl(10),
        };
        assert!(matches!(record_ip(&garbage), Err(TranslateError::NoCidr(_))));

        let unknown = DnsRecord::UNKNOWN {
            domain: "test".to_string(),
            qtype: 99,
            data_len: 0,
            ttl: TransientTtl(10),
        };
        assert!(matches!(
            record_ip(&unknown),
            Err(TranslateError::UnsupportedRecord(_))
        ));
    }

    #[test]
    fn test_change_becomes_remove_then_add() {
        let actions = vec![Action::Change {
            idx: 1,
            prev: a(2),
            current: a(3),
        }];
        let (ops, errors) = to_rule_ops(&actions);
        assert!(errors.is_empty());
        assert_eq!(
            vec![
                (RuleOp::Remove, "1.1.1.2".to_string()),
                (RuleOp::Add, "1.1.1.3".to_string()),
            ],
            ops
        );
    }

    #[test]
    fn test_change_with_identical_addresses_is_dropped() {
        // TTL-only differences never reach the firewall.
        let prev = DnsRecord::A {
            domain: "test".to_string(),
            addr: Ipv4Addr::new(1, 1, 1, 1),
            ttl: TransientTtl(30),
        };
        let current = DnsRecord::A {
            domain: "test".to_string(),
            addr: Ipv4Addr::new(1, 1, 1, 1),
            ttl: TransientTtl(60),
        };
        let (ops, errors) = to_rule_ops(&[Action::Change {
            idx: 0,
            prev,
            current,
        }]);
        assert!(ops.is_empty());
        assert!(errors.is_empty());
    }

    #[test]
    fn test_add_and_remove_map_directly() {
        let actions = vec![
            Action::Add { idx: 0, record: a(1) },
            Action::Remove { idx: 1, record: a(2) },
        ];
        let (ops, errors) = to_rule_ops(&actions);
        assert!(errors.is_empty());
        assert_eq!(
            vec![
                (RuleOp::Add, "1.1.1.1".to_string()),
                (RuleOp::Remove, "1.1.1.2".to_string()),
            ],
            ops
        );
    }

    #[test]
    fn test_untranslatable_records_are_collected_not_fatal() {
        let bad = DnsRecord::UNKNOWN {
            domain: "test".to_string(),
            qtype: 99,
            data_len: 0,
            ttl: TransientTtl(10),
        };
        let actions = vec![
            Action::Add { idx: 0, record: bad },
            Action::Add { idx: 1, record: a(1) },
        ];
        let (ops, errors) = to_rule_ops(&actions);
        assert_eq!(1, errors.len());
        assert_eq!(vec![(RuleOp::Add, "1.1.1.1".to_string())], ops);
    }
}
