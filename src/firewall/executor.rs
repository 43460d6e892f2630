//! Applies rule operations through the system's iptables binaries.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error};

use crate::config::target::Target;
use crate::firewall::rules::{forward_rules, is_ipv6, nat_rules};
use crate::firewall::translate::RuleOp;

#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{program} {args:?} failed: {stderr}")]
    Command {
        program: String,
        args: Vec<String>,
        stderr: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePosition {
    First,
    Last,
}

/// Where firewall rules end up. The daemon talks to iptables through this
/// seam, tests capture the calls instead.
#[async_trait]
pub trait RuleSink: Send + Sync {
    async fn ensure_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError>;
    async fn flush_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError>;
    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: &str,
        chain: &str,
        args: &[String],
    ) -> Result<(), FirewallError>;
    async fn delete_rule(&self, table: &str, chain: &str, args: &[String])
        -> Result<(), FirewallError>;
}

/// Shells out to `iptables`/`ip6tables`, always with `-w` so concurrent
/// invocations wait for the xtables lock.
pub struct IptablesCmd {
    program: String,
}

impl IptablesCmd {
    pub fn v4() -> IptablesCmd {
        IptablesCmd {
            program: "iptables".to_string(),
        }
    }

    pub fn v6() -> IptablesCmd {
        IptablesCmd {
            program: "ip6tables".to_string(),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<(), FirewallError> {
        debug!(program = %self.program, args = ?args, "iptables");
        let output = Command::new(&self.program).arg("-w").args(&args).output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(FirewallError::Command {
                program: self.program.clone(),
                args,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn rule_exists(&self, table: &str, chain: &str, args: &[String]) -> bool {
        let mut check = vec!["-t".to_string(), table.to_string(), "-C".to_string(), chain.to_string()];
        check.extend(args.iter().cloned());
        self.run(check).await.is_ok()
    }
}

#[async_trait]
impl RuleSink for IptablesCmd {
    async fn ensure_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError> {
        let result = self
            .run(vec![
                "-t".to_string(),
                table.to_string(),
                "-N".to_string(),
                chain.to_string(),
            ])
            .await;
        match result {
            Ok(()) => Ok(()),
            // Builtin and already-created chains are fine.
            Err(FirewallError::Command { ref stderr, .. }) if stderr.contains("exist") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn flush_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError> {
        self.run(vec![
            "-t".to_string(),
            table.to_string(),
            "-F".to_string(),
            chain.to_string(),
        ])
        .await
    }

    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: &str,
        chain: &str,
        args: &[String],
    ) -> Result<(), FirewallError> {
        if self.rule_exists(table, chain, args).await {
            return Ok(());
        }
        let mut cmd = vec!["-t".to_string(), table.to_string()];
        match position {
            RulePosition::First => {
                cmd.push("-I".to_string());
                cmd.push(chain.to_string());
                cmd.push("1".to_string());
            }
            RulePosition::Last => {
                cmd.push("-A".to_string());
                cmd.push(chain.to_string());
            }
        }
        cmd.extend(args.iter().cloned());
        self.run(cmd).await
    }

    async fn delete_rule(
        &self,
        table: &str,
        chain: &str,
        args: &[String],
    ) -> Result<(), FirewallError> {
        let mut cmd = vec!["-t".to_string(), table.to_string(), "-D".to_string(), chain.to_string()];
        cmd.extend(args.iter().cloned());
        self.run(cmd).await
    }
}

/// The v4/v6 table pair with the daemon's two chains.
pub struct FirewallTables {
    v4: Box<dyn RuleSink>,
    v6: Box<dyn RuleSink>,
    pub fwd_chain: String,
    pub nat_chain: String,
}

impl FirewallTables {
    pub fn new(chain_base: &str) -> FirewallTables {
        Self::with_sinks(chain_base, Box::new(IptablesCmd::v4()), Box::new(IptablesCmd::v6()))
    }

    pub fn with_sinks(
        chain_base: &str,
        v4: Box<dyn RuleSink>,
        v6: Box<dyn RuleSink>,
    ) -> FirewallTables {
        FirewallTables {
            v4,
            v6,
            fwd_chain: format!("FWD-{}", chain_base),
            nat_chain: format!("NAT-{}", chain_base),
        }
    }

    fn sink_for(&self, ip: &str) -> &dyn RuleSink {
        if is_ipv6(ip) {
            &*self.v6
        } else {
            &*self.v4
        }
    }

    /// Builds the daemon's chains from scratch in both address families:
    /// a forward chain jumped to from FORWARD and a NAT chain jumped to
    /// from POSTROUTING, each flushed and re-terminated.
    pub async fn setup(&self, first_rule: bool, no_final_drop: bool) -> Result<(), FirewallError> {
        for sink in [&self.v4, &self.v6] {
            let chains = [
                ("filter", "FORWARD", &self.fwd_chain),
                ("nat", "POSTROUTING", &self.nat_chain),
            ];
            for (table, base_chain, chain) in chains {
                sink.ensure_chain(table, base_chain).await?;

                let jump = vec!["-j".to_string(), chain.clone()];
                if let Err(err) = sink.delete_rule(table, base_chain, &jump).await {
                    debug!(table, chain = %chain, error = %err, "no previous jump rule");
                }
                if let Err(err) = sink.flush_chain(table, chain).await {
                    debug!(table, chain = %chain, error = %err, "no previous chain to flush");
                }
                sink.ensure_chain(table, chain).await?;

                let position = if first_rule {
                    RulePosition::First
                } else {
                    RulePosition::Last
                };
                sink.ensure_rule(position, table, base_chain, &jump).await?;

                let final_target = if table == "filter" && !no_final_drop {
                    "DROP"
                } else {
                    "RETURN"
                };
                sink.ensure_rule(
                    RulePosition::Last,
                    table,
                    chain,
                    &["-j".to_string(), final_target.to_string()],
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Applies one address operation across the filter and nat chains of
    /// the matching address family. Failures are collected, not fatal: the
    /// next diff gets another chance.
    pub async fn apply(&self, op: RuleOp, ip: &str, target: &Target) -> Vec<FirewallError> {
        let sink = self.sink_for(ip);
        let mut errors = Vec::new();

        let batches = [
            ("filter", &self.fwd_chain, forward_rules(ip, target)),
            ("nat", &self.nat_chain, nat_rules(ip, target)),
        ];
        for (table, chain, rules) in batches {
            for args in rules {
                let outcome = match op {
                    RuleOp::Add => {
                        sink.ensure_rule(RulePosition::First, table, chain, &args).await
                    }
                    RuleOp::Remove => sink.delete_rule(table, chain, &args).await,
                };
                if let Err(err) = outcome {
                    error!(table, chain = %chain, error = %err, "rule application failed");
                    errors.push(err);
                }
            }
        }
        errors
    }
}
