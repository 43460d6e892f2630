//! The dnswall daemon: resolves configured targets, keeps the managed
//! iptables chains in sync with the answers, and runs until interrupted.

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dnswall::config::target::{parse_target, Target};
use dnswall::events::actions::current_actions;
use dnswall::events::history::DnsResult;
use dnswall::events::stream::{DnsEventStream, RefreshTimes, StreamConfig};
use dnswall::firewall::executor::FirewallTables;
use dnswall::firewall::translate::{to_rule_ops, RuleOp};

#[derive(Parser, Debug)]
#[command(name = "dnswall", about = "DNS-driven forwarding firewall")]
struct Cli {
    /// Base name of the managed chains (FWD-<name> and NAT-<name>).
    #[arg(long, default_value = "DNSWALL")]
    chain_name: String,

    /// Jump into the managed chain before existing FORWARD rules.
    #[arg(long)]
    first_rule: bool,

    /// End the forward chain with RETURN instead of DROP.
    #[arg(long)]
    no_final_drop: bool,

    /// Targets to keep reachable, as sken:// URLs. Repeatable.
    #[arg(long = "target", required = true)]
    targets: Vec<String>,

    /// Resolution results retained per subject.
    #[arg(long, default_value_t = 5)]
    history_limit: usize,

    /// Lower bound of the refresh interval, seconds.
    #[arg(long, default_value_t = 1)]
    refresh_min: u64,

    /// Upper bound of the refresh interval, seconds; 0 means unbounded.
    #[arg(long, default_value_t = 0)]
    refresh_max: u64,

    /// Seconds subtracted from each TTL so refreshes land before expiry.
    #[arg(long, default_value_t = 0)]
    refresh_overlay: u64,

    /// Prometheus exporter listen address.
    #[arg(long, default_value = "127.0.0.1:9478")]
    metrics_listen: SocketAddr,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    PrometheusBuilder::new()
        .listen_address(cli.metrics_listen)
        .install()?;

    let mut targets = Vec::new();
    for raw in &cli.targets {
        targets.push(Arc::new(parse_target(raw)?));
    }

    let tables = Arc::new(FirewallTables::new(&cli.chain_name));
    tables.setup(cli.first_rule, cli.no_final_drop).await?;

    let stream = DnsEventStream::system(StreamConfig {
        history_limit: cli.history_limit,
        refresh_times: RefreshTimes {
            min: std::time::Duration::from_secs(cli.refresh_min),
            max: std::time::Duration::from_secs(cli.refresh_max),
            overlay: std::time::Duration::from_secs(cli.refresh_overlay),
        },
        ..StreamConfig::default()
    });
    stream.start()?;

    // Subscribers only compute and enqueue rule operations; the firewall
    // I/O happens on this task, outside every subject lock.
    let (ops_tx, mut ops_rx) =
        tokio::sync::mpsc::unbounded_channel::<(RuleOp, String, Arc<Target>)>();
    let applier = {
        let tables = tables.clone();
        tokio::spawn(async move {
            while let Some((op, ip, target)) = ops_rx.recv().await {
                for err in tables.apply(op, &ip, &target).await {
                    error!(ip = %ip, error = %err, "rule application failed");
                }
            }
        })
    };

    for target in &targets {
        for subject in target.subjects.clone() {
            let active = stream.create_subject(subject)?;
            let key = active.key().to_string();
            let target = target.clone();
            let ops_tx = ops_tx.clone();
            active
                .bind(Box::new(move |history: &[Arc<DnsResult>]| {
                    let Some(newest) = history.first() else {
                        return;
                    };
                    if let Some(err) = &newest.error {
                        error!(subject = %key, error = %err, "resolve failed");
                        return;
                    }
                    let actions = current_actions(history);
                    let (ops, errors) = to_rule_ops(&actions);
                    for err in errors {
                        error!(subject = %key, error = %err, "untranslatable record");
                    }
                    for (op, ip) in ops {
                        let _ = ops_tx.send((op, ip, target.clone()));
                    }
                }))
                .await;
            active.activate().await?;
            info!(subject = %active.key(), "activated");
        }
    }
    drop(ops_tx);

    info!(targets = targets.len(), "running, interrupt to exit");
    tokio::signal::ctrl_c().await?;

    stream.stop().await?;
    applier.await?;
    Ok(())
}
