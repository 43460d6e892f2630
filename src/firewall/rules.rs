//! Builds iptables argument vectors for one destination address under a
//! target's policy. Pure, so the exact rules are testable without touching
//! the system tables.

use crate::config::target::{PortSpec, Target};

/// True when the address (bare or CIDR) belongs to the v6 tables.
pub fn is_ipv6(ip: &str) -> bool {
    ip.contains(':')
}

fn proto_args(port: &PortSpec) -> Vec<String> {
    if port.proto.is_empty() || port.proto == "all" {
        return Vec::new();
    }
    vec!["-p".to_string(), port.proto.clone()]
}

fn port_match(port: &PortSpec, flag: &str, multi_flag: &str) -> Vec<String> {
    if port.ports.is_empty() {
        return Vec::new();
    }
    if port.proto == "icmp" || port.proto == "icmpv6" {
        return vec!["--icmp-type".to_string(), port.ports.join(",")];
    }
    if port.ports.len() == 1 {
        vec![flag.to_string(), port.ports[0].clone()]
    } else {
        vec![
            "-m".to_string(),
            "multiport".to_string(),
            multi_flag.to_string(),
            port.ports.join(","),
        ]
    }
}

fn conntrack_args(states: &str) -> Vec<String> {
    vec![
        "-m".to_string(),
        "conntrack".to_string(),
        "--ctstate".to_string(),
        states.to_string(),
    ]
}

/// The ACCEPT pair for one destination and one port spec: the outbound rule
/// matching traffic towards the address, then the inbound mirror.
fn accept_pair(ip: &str, port: &PortSpec, target: &Target) -> (Vec<String>, Vec<String>) {
    let mut outbound = Vec::new();
    if !target.non_stateful {
        outbound.extend(conntrack_args("NEW,RELATED,ESTABLISHED"));
    }
    outbound.push("-d".to_string());
    outbound.push(ip.to_string());
    outbound.extend(proto_args(port));
    outbound.extend(port_match(port, "--dport", "--dports"));
    if let Some(oif) = &target.output_iface {
        outbound.push("-o".to_string());
        outbound.push(oif.clone());
    }
    outbound.push("-j".to_string());
    outbound.push("ACCEPT".to_string());

    let mut inbound = Vec::new();
    if !target.non_stateful {
        inbound.extend(conntrack_args("RELATED,ESTABLISHED"));
    }
    inbound.push("-s".to_string());
    inbound.push(ip.to_string());
    inbound.extend(proto_args(port));
    inbound.extend(port_match(port, "--sport", "--sports"));
    if let Some(iif) = &target.input_iface {
        inbound.push("-i".to_string());
        inbound.push(iif.clone());
    }
    inbound.push("-j".to_string());
    inbound.push("ACCEPT".to_string());

    (outbound, inbound)
}

/// All filter-table rules permitting traffic to `ip` under the target's
/// policy, outbound before inbound per port spec.
pub fn forward_rules(ip: &str, target: &Target) -> Vec<Vec<String>> {
    let mut rules = Vec::with_capacity(target.ports.len() * 2);
    for port in &target.ports {
        let (outbound, inbound) = accept_pair(ip, port, target);
        rules.push(outbound);
        rules.push(inbound);
    }
    rules
}

/// The POSTROUTING rules for the target's NAT mode, if any. SNAT sources
/// apply only to their own address family.
pub fn nat_rules(ip: &str, target: &Target) -> Vec<Vec<String>> {
    let mut rules = Vec::new();
    if target.masquerade {
        rules.push(vec![
            "-d".to_string(),
            ip.to_string(),
            "-j".to_string(),
            "MASQUERADE".to_string(),
        ]);
        return rules;
    }
    let snat = if is_ipv6(ip) {
        target.snat6.as_ref()
    } else {
        target.snat4.as_ref()
    };
    if let Some(source) = snat {
        rules.push(vec![
            "-d".to_string(),
            ip.to_string(),
            "-j".to_string(),
            "SNAT".to_string(),
            "--to-source".to_string(),
            source.clone(),
        ]);
    }
    rules
}
