//! dnswall keeps Linux packet-filter rules synchronized with the DNS
//! resolution of a configured set of targets.
//!
//! The crate is built around an event stream of resolved records: each
//! target becomes one or more subjects, every subject is refreshed on a
//! TTL-derived schedule, and the diffs between successive resolutions are
//! translated into incremental iptables add/remove operations.

pub mod buffer;
pub mod config;
pub mod events;
pub mod firewall;
pub mod protocols;
pub mod resolvers;
