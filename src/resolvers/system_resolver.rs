use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, error, info};

use crate::buffer::buffer::{BytePacketBuffer, PacketBuffer};
use crate::events::active_subject::ActiveSubject;
use crate::protocols::protocol::{DnsPacket, DnsQuestion, DnsRecord, ResultCode};
use crate::resolvers::resolve::{Result, ResolveError, Subject};

const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(200);

/// A subject answered by the system's nameservers over UDP.
///
/// Nameservers come from the constructor, or lazily from resolv.conf on the
/// first query. Requests round-robin across the configured list.
pub struct SystemResolverSubject {
    question: DnsQuestion,
    nameservers: Mutex<Vec<String>>,
    resolv_conf: Option<PathBuf>,
    timeout: Duration,
    request: AtomicUsize,
    active: OnceLock<Weak<ActiveSubject>>,
}

/// Splits a nameserver entry into address and port, defaulting to 53.
///
/// Accepted forms: `1.2.3.4`, `1.2.3.4:53`, `::1`, `[::1]`, `[::1]:53`.
pub fn parse_nameserver(entry: &str) -> Result<(IpAddr, u16)> {
    if let Ok(sockaddr) = entry.parse::<std::net::SocketAddr>() {
        return Ok((sockaddr.ip(), sockaddr.port()));
    }
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Ok((ip, 53));
    }
    let trimmed = entry.strip_prefix('[').and_then(|e| e.strip_suffix(']'));
    if let Some(Ok(ip)) = trimmed.map(|e| e.parse::<IpAddr>()) {
        return Ok((ip, 53));
    }
    Err(ResolveError::BadNameserver(entry.to_string()))
}

/// Extracts the nameserver entries from resolv.conf content.
fn parse_resolv_conf(content: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in content.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() == Some("nameserver") {
            if let Some(addr) = tokens.next() {
                out.push(addr.to_string());
            }
        }
    }
    out
}

impl SystemResolverSubject {
    pub fn new(question: DnsQuestion) -> SystemResolverSubject {
        SystemResolverSubject {
            question,
            nameservers: Mutex::new(Vec::new()),
            resolv_conf: None,
            timeout: DEFAULT_QUERY_TIMEOUT,
            request: AtomicUsize::new(0),
            active: OnceLock::new(),
        }
    }

    /// Uses the given nameservers instead of consulting resolv.conf.
    pub fn with_nameservers(mut self, nameservers: Vec<String>) -> SystemResolverSubject {
        self.nameservers = Mutex::new(nameservers);
        self
    }

    /// Overrides the resolv.conf path.
    pub fn with_resolv_conf(mut self, path: PathBuf) -> SystemResolverSubject {
        self.resolv_conf = Some(path);
        self
    }

    /// Overrides the per-query timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> SystemResolverSubject {
        self.timeout = timeout;
        self
    }

    fn log_key(&self) -> String {
        match self.active.get().and_then(|weak| weak.upgrade()) {
            Some(active) => active.key().to_string(),
            None => self.question.key(),
        }
    }

    async fn load_nameservers(&self) -> Result<Vec<String>> {
        let path = self
            .resolv_conf
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RESOLV_CONF));
        info!(subject = %self.log_key(), path = %path.display(), "reading resolv.conf");
        let content = tokio::fs::read_to_string(&path).await?;
        let mut entries = parse_resolv_conf(&content);
        if entries.is_empty() {
            entries = vec!["127.0.0.1".to_string(), "[::1]".to_string()];
        }
        Ok(entries)
    }

    /// Picks the nameserver for this request, loading the list first if it
    /// is still empty.
    async fn pick_nameserver(&self, request: usize) -> Result<String> {
        {
            let nameservers = self
                .nameservers
                .lock()
                .map_err(|_| ResolveError::PoisonedLock)?;
            if !nameservers.is_empty() {
                return Ok(nameservers[request % nameservers.len()].clone());
            }
        }

        let loaded = self.load_nameservers().await?;
        let mut nameservers = self
            .nameservers
            .lock()
            .map_err(|_| ResolveError::PoisonedLock)?;
        if nameservers.is_empty() {
            *nameservers = loaded;
        }
        Ok(nameservers[request % nameservers.len()].clone())
    }

    async fn exchange(&self, ip: IpAddr, port: u16) -> Result<DnsPacket> {
        let mut packet = DnsPacket::new();
        packet.header.id = rand::random::<u16>();
        packet.header.recursion_desired = true;
        packet.questions.push(self.question.clone());

        let mut req_buffer = BytePacketBuffer::new();
        packet.write(&mut req_buffer, 512)?;

        let bind_addr = if ip.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.send_to(&req_buffer.buf[0..req_buffer.pos], (ip, port)).await?;

        let response = time::timeout(self.timeout, async {
            // Datagrams with a foreign transaction id are ignored until the
            // deadline runs out.
            loop {
                let mut data = [0u8; 512];
                let (len, _) = socket.recv_from(&mut data).await?;
                let mut res_buffer = BytePacketBuffer::from_bytes(&data[..len]);
                let parsed = DnsPacket::from_buffer(&mut res_buffer)?;
                if parsed.header.id == packet.header.id {
                    return Ok::<DnsPacket, ResolveError>(parsed);
                }
            }
        })
        .await
        .map_err(|_| ResolveError::TimeOut)??;

        Ok(response)
    }
}

#[async_trait]
impl Subject for SystemResolverSubject {
    fn key(&self) -> DnsQuestion {
        self.question.clone()
    }

    fn attach(&self, active: &Arc<ActiveSubject>) {
        let _ = self.active.set(Arc::downgrade(active));
    }

    async fn resolve(&self) -> Result<Vec<DnsRecord>> {
        let request = self.request.fetch_add(1, Ordering::SeqCst);
        let entry = self.pick_nameserver(request).await?;
        let (ip, port) = parse_nameserver(&entry)?;

        debug!(
            subject = %self.log_key(),
            nameserver = %ip,
            port,
            "sending query"
        );

        match self.exchange(ip, port).await {
            Ok(response) => {
                if response.header.rescode != ResultCode::NOERROR {
                    error!(
                        subject = %self.log_key(),
                        nameserver = %ip,
                        rescode = ?response.header.rescode,
                        "query refused"
                    );
                    return Err(ResolveError::Server(response.header.rescode));
                }
                debug!(
                    subject = %self.log_key(),
                    answers = response.answers.len(),
                    "query answered"
                );
                Ok(response.answers)
            }
            Err(err) => {
                error!(
                    subject = %self.log_key(),
                    nameserver = %ip,
                    error = %err,
                    "exchange failed"
                );
                Err(err)
            }
        }
    }
}
