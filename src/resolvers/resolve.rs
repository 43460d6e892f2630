//! The subject capability with strategies for answering watched questions.
use std::sync::Arc;

use async_trait::async_trait;
use derive_more::{Display, Error, From};

use crate::events::active_subject::ActiveSubject;
use crate::protocols::protocol::{DnsQuestion, DnsRecord, ResultCode};

#[derive(Debug, Display, From, Error)]
pub enum ResolveError {
    Buffer(crate::buffer::buffer::BufferError),
    Protocol(crate::protocols::protocol::ProtocolError),
    Io(std::io::Error),
    #[display(fmt = "query timed out")]
    TimeOut,
    #[display(fmt = "server answered {:?}", _0)]
    Server(#[error(not(source))] ResultCode),
    #[display(fmt = "invalid nameserver: {}", _0)]
    BadNameserver(#[error(not(source))] String),
    #[display(fmt = "poisoned lock")]
    PoisonedLock,
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// A question paired with a resolution strategy.
///
/// Subjects are registered with the event stream, which wraps each in an
/// [`ActiveSubject`] and drives its refresh schedule. Implementations do not
/// need their own serialization: the active subject's mutex already
/// guarantees at most one `resolve` call at a time per subject.
#[async_trait]
pub trait Subject: Send + Sync {
    /// The question identifying this subject in the stream registry.
    fn key(&self) -> DnsQuestion;

    /// Resolves the question to its current record set.
    async fn resolve(&self) -> Result<Vec<DnsRecord>>;

    /// Invoked once when the subject is registered with a stream, handing it
    /// a reference to its activation context for log enrichment. Hold it
    /// weakly or not at all.
    fn attach(&self, _active: &Arc<ActiveSubject>) {}
}
