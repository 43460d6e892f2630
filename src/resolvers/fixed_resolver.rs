use async_trait::async_trait;

use crate::protocols::protocol::{DnsQuestion, DnsRecord};
use crate::resolvers::resolve::{Result, Subject};

/// A fixed-answer subject.
///
/// Returns a preconfigured record list and never errors. Literal IP targets
/// use this with a single TXT record carrying the address in CIDR form.
pub struct FixedResolverSubject {
    question: DnsQuestion,
    records: Vec<DnsRecord>,
}

impl FixedResolverSubject {
    pub fn new(question: DnsQuestion, records: Vec<DnsRecord>) -> FixedResolverSubject {
        FixedResolverSubject { question, records }
    }
}

#[async_trait]
impl Subject for FixedResolverSubject {
    fn key(&self) -> DnsQuestion {
        self.question.clone()
    }

    async fn resolve(&self) -> Result<Vec<DnsRecord>> {
        Ok(self.records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::protocol::{QueryType, TransientTtl};

    #[tokio::test]
    async fn test_fixed_resolver_returns_configured_records() {
        let question = DnsQuestion::new("10.1.2.3".to_string(), QueryType::TXT);
        let records = vec![DnsRecord::TXT {
            domain: "10.1.2.3".to_string(),
            data: vec!["10.1.2.3/32".to_string()],
            ttl: TransientTtl(u32::MAX),
        }];

        let subject = FixedResolverSubject::new(question.clone(), records.clone());
        assert_eq!(question.key(), subject.key().key());

        let resolved = subject.resolve().await.unwrap();
        assert_eq!(records, resolved);

        // A second resolve keeps answering the same thing.
        assert_eq!(records, subject.resolve().await.unwrap());
    }
}
