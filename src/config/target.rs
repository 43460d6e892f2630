//! Target URL grammar.
//!
//! ```text
//! sken://<host-or-ip>[:<port>][/<prefix>]?[type=A|AAAA|TXT|...]
//!     [&nameserver=<ip>]*[&port=<p>[,<p>]*[/<proto>]]*
//!     [&inIface=<name>][&outIface=<name>][&nonStateful]
//!     [&snat4=<ip>][&snat6=<ip>][&masq]
//! ```
//!
//! Literal IP hosts become a fixed TXT subject carrying the address in CIDR
//! form; hostnames become one system-resolver subject per requested type.

use std::net::IpAddr;
use std::sync::Arc;

use url::{Host, Url};

use crate::protocols::protocol::{DnsQuestion, DnsRecord, QueryType, TransientTtl};
use crate::resolvers::fixed_resolver::FixedResolverSubject;
use crate::resolvers::resolve::Subject;
use crate::resolvers::system_resolver::SystemResolverSubject;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("target {0} is not a valid url: {1}")]
    Url(String, url::ParseError),
    #[error("target {0} has invalid scheme")]
    Scheme(String),
    #[error("target {0} has no host")]
    NoHost(String),
    #[error("target {0} has an empty port spec")]
    Port(String),
    #[error("target {0} requests unknown record type {1}")]
    UnknownType(String, String),
    #[error("target {0}: only one mode is allowed, snat or masq")]
    NatConflict(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub ports: Vec<String>,
    pub proto: String,
}

/// One forwarding target: its subjects plus the rule policy applied to every
/// address they resolve to.
#[derive(Clone)]
pub struct Target {
    pub host: String,
    pub subjects: Vec<Arc<dyn Subject>>,
    pub ports: Vec<PortSpec>,
    pub input_iface: Option<String>,
    pub output_iface: Option<String>,
    pub non_stateful: bool,
    pub snat4: Option<String>,
    pub snat6: Option<String>,
    pub masquerade: bool,
}

fn literal_ip_subject(host: &str, ip: IpAddr, path: &str) -> Arc<dyn Subject> {
    let max_prefix = if ip.is_ipv4() { 32 } else { 128 };
    let prefix = path
        .strip_prefix('/')
        .and_then(|p| p.parse::<u32>().ok())
        .filter(|p| *p <= max_prefix)
        .unwrap_or(max_prefix);

    let record = DnsRecord::TXT {
        domain: host.to_string(),
        data: vec![format!("{}/{}", ip, prefix)],
        ttl: TransientTtl(u32::MAX),
    };
    Arc::new(FixedResolverSubject::new(
        DnsQuestion::new(host.to_string(), QueryType::TXT),
        vec![record],
    ))
}

fn query_values(url: &Url, key: &str) -> Vec<String> {
    url.query_pairs()
        .filter(|(k, _)| k.as_ref() == key)
        .map(|(_, v)| v.to_string())
        .collect()
}

fn query_flag(url: &Url, key: &str) -> bool {
    url.query_pairs().any(|(k, _)| k.as_ref() == key)
}

/// Parses one `sken://` target URL.
pub fn parse_target(raw: &str) -> Result<Target, ConfigError> {
    let url = Url::parse(raw).map_err(|err| ConfigError::Url(raw.to_string(), err))?;
    if url.scheme() != "sken" {
        return Err(ConfigError::Scheme(raw.to_string()));
    }

    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => return Err(ConfigError::NoHost(raw.to_string())),
    };

    let subjects: Vec<Arc<dyn Subject>> = if let Ok(ip) = host.parse::<IpAddr>() {
        vec![literal_ip_subject(&host, ip, url.path())]
    } else {
        let mut name = host.clone();
        if !name.ends_with('.') {
            name.push('.');
        }
        let mut requested = query_values(&url, "type");
        if requested.is_empty() {
            requested.push("A".to_string());
        }
        let nameservers = query_values(&url, "nameserver");

        let mut subjects: Vec<Arc<dyn Subject>> = Vec::new();
        for type_name in requested {
            let qtype = QueryType::from_name(&type_name)
                .ok_or_else(|| ConfigError::UnknownType(raw.to_string(), type_name.clone()))?;
            let mut subject = SystemResolverSubject::new(DnsQuestion::new(name.clone(), qtype));
            if !nameservers.is_empty() {
                subject = subject.with_nameservers(nameservers.clone());
            }
            subjects.push(Arc::new(subject));
        }
        subjects
    };

    let mut ports = Vec::new();
    for entry in query_values(&url, "port") {
        let (port_part, proto) = match entry.split_once('/') {
            Some((ports, proto)) => (ports.to_string(), proto.to_string()),
            None => (entry.clone(), "tcp".to_string()),
        };
        let port_list: Vec<String> = port_part
            .split(|c| c == ',' || c == '|')
            .filter(|p| !p.is_empty())
            .map(|p| p.to_string())
            .collect();
        if port_list.is_empty() {
            return Err(ConfigError::Port(raw.to_string()));
        }
        ports.push(PortSpec {
            ports: port_list,
            proto,
        });
    }
    if ports.is_empty() {
        ports.push(PortSpec {
            ports: vec!["443".to_string()],
            proto: "tcp".to_string(),
        });
    }

    let snat4 = query_values(&url, "snat4").into_iter().next();
    let snat6 = query_values(&url, "snat6").into_iter().next();
    let masquerade = query_flag(&url, "masq");
    if (snat4.is_some() || snat6.is_some()) && masquerade {
        return Err(ConfigError::NatConflict(raw.to_string()));
    }

    Ok(Target {
        host,
        subjects,
        ports,
        input_iface: query_values(&url, "inIface").into_iter().next(),
        output_iface: query_values(&url, "outIface").into_iter().next(),
        non_stateful: query_flag(&url, "nonStateful"),
        snat4,
        snat6,
        masquerade,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_literal_ipv4_becomes_fixed_txt_subject() {
        let target = parse_target("sken://10.1.2.3").unwrap();
        assert_eq!("10.1.2.3", target.host);
        assert_eq!(1, target.subjects.len());

        let subject = &target.subjects[0];
        assert_eq!("10.1.2.3:IN:TXT", subject.key().key());

        let records = subject.resolve().await.unwrap();
        match &records[0] {
            DnsRecord::TXT { data, .. } => assert_eq!(vec!["10.1.2.3/32".to_string()], *data),
            other => panic!("expected TXT, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_literal_ipv4_with_prefix() {
        let target = parse_target("sken://10.1.2.0/24").unwrap();
        let records = target.subjects[0].resolve().await.unwrap();
        match &records[0] {
            DnsRecord::TXT { data, .. } => assert_eq!(vec!["10.1.2.0/24".to_string()], *data),
            other => panic!("expected TXT, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_literal_ipv4_invalid_prefix_falls_back() {
        let target = parse_target("sken://10.1.2.3/99").unwrap();
        let records = target.subjects[0].resolve().await.unwrap();
        match &records[0] {
            DnsRecord::TXT { data, .. } => assert_eq!(vec!["10.1.2.3/32".to_string()], *data),
            other => panic!("expected TXT, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_literal_ipv6_defaults_to_full_prefix() {
        let target = parse_target("sken://[2001:db8::1]").unwrap();
        assert_eq!("2001:db8::1", target.host);
        let records = target.subjects[0].resolve().await.unwrap();
        match &records[0] {
            DnsRecord::TXT { data, .. } => {
                assert_eq!(vec!["2001:db8::1/128".to_string()], *data)
            }
            other => panic!("expected TXT, got {:?}", other),
        }
    }

    #[test]
    fn test_hostname_defaults_to_a_subject() {
        let target = parse_target("sken://www.example.com").unwrap();
        assert_eq!(1, target.subjects.len());
        assert_eq!("www.example.com:IN:A", target.subjects[0].key().key());
        // Query names carry the trailing dot.
        assert_eq!("www.example.com.", target.subjects[0].key().name);
    }

    #[test]
    fn test_hostname_one_subject_per_requested_type() {
        let target = parse_target("sken://www.example.com?type=A&type=AAAA").unwrap();
        let keys: Vec<String> = target.subjects.iter().map(|s| s.key().key()).collect();
        assert_eq!(
            vec![
                "www.example.com:IN:A".to_string(),
                "www.example.com:IN:AAAA".to_string()
            ],
            keys
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(matches!(
            parse_target("sken://www.example.com?type=BOGUS"),
            Err(ConfigError::UnknownType(_, _))
        ));
    }

    #[test]
    fn test_ports_default_to_https() {
        let target = parse_target("sken://www.example.com").unwrap();
        assert_eq!(
            vec![PortSpec {
                ports: vec!["443".to_string()],
                proto: "tcp".to_string()
            }],
            target.ports
        );
    }

    #[test]
    fn test_port_lists_and_protocols() {
        let target =
            parse_target("sken://www.example.com?port=80,8080/tcp&port=53/udp&port=25").unwrap();
        assert_eq!(
            vec![
                PortSpec {
                    ports: vec!["80".to_string(), "8080".to_string()],
                    proto: "tcp".to_string()
                },
                PortSpec {
                    ports: vec!["53".to_string()],
                    proto: "udp".to_string()
                },
                PortSpec {
                    ports: vec!["25".to_string()],
                    proto: "tcp".to_string()
                },
            ],
            target.ports
        );
    }

    #[test]
    fn test_interfaces_and_statefulness() {
        let target = parse_target(
            "sken://www.example.com?inIface=eth0&outIface=wg0&nonStateful",
        )
        .unwrap();
        assert_eq!(Some("eth0".to_string()), target.input_iface);
        assert_eq!(Some("wg0".to_string()), target.output_iface);
        assert!(target.non_stateful);
    }

    #[test]
    fn test_snat_and_masq_are_exclusive() {
        let target = parse_target("sken://www.example.com?snat4=192.0.2.1").unwrap();
        assert_eq!(Some("192.0.2.1".to_string()), target.snat4);
        assert!(!target.masquerade);

        let target = parse_target("sken://www.example.com?masq").unwrap();
        assert!(target.masquerade);

        assert!(matches!(
            parse_target("sken://www.example.com?snat4=192.0.2.1&masq"),
            Err(ConfigError::NatConflict(_))
        ));
    }

    #[test]
    fn test_invalid_scheme_and_url() {
        assert!(matches!(
            parse_target("https://www.example.com"),
            Err(ConfigError::Scheme(_))
        ));
        assert!(matches!(
            parse_target("not a url at all"),
            Err(ConfigError::Url(_, _))
        ));
    }
}
