//! Command-line surface for the warden binary.

use clap::{Parser, Subcommand};
use serde::Serialize;
use tabled::{Table, Tabled};

use crate::config::AppConfig;
use crate::domain::{Trigger, Venue};
use crate::reconciliation::{AuditReport, ReconcileAction};
use crate::supervisor::{Engine, PositionProtection, ProtectionSummary};

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version)]
#[command(about = "Reconciliation and protection engine for leveraged futures positions", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Directory holding default.toml and the per-environment overlay
    #[arg(long, global = true, default_value = "config", env = "WARDEN_CONFIG_DIR")]
    pub config_dir: String,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the venue loops until a shutdown signal (default)
    Run,
    /// Reconcile once against the venues without placing protection
    Audit {
        /// Restrict to one venue
        #[arg(long)]
        venue: Option<Venue>,
        /// Commit the reconcile actions to the ledger
        #[arg(long)]
        apply: bool,
    },
    /// Show protection status from the ledger
    Status {
        #[arg(long)]
        venue: Option<Venue>,
        /// Per-position rows instead of the summary
        #[arg(long)]
        all: bool,
    },
    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[derive(Debug, Serialize, Tabled)]
pub struct PositionRow {
    pub venue: String,
    pub symbol: String,
    pub side: String,
    pub quantity: String,
    pub entry: String,
    pub status: String,
    pub orders: String,
    pub synced: String,
}

impl From<&PositionProtection> for PositionRow {
    fn from(p: &PositionProtection) -> Self {
        let orders = p
            .active_orders
            .iter()
            .map(|o| match o.trigger {
                Trigger::Fixed { trigger_price } => format!("{}@{}", o.kind, trigger_price),
                Trigger::Trailing {
                    activation_price,
                    callback_rate,
                } => format!("{}@{}/{}%", o.kind, activation_price, callback_rate),
            })
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            venue: p.venue.to_string(),
            symbol: p.symbol.clone(),
            side: p.side.to_string(),
            quantity: p.quantity.to_string(),
            entry: p.entry_price.to_string(),
            status: p.protection_status.to_string(),
            orders: if orders.is_empty() { "-".into() } else { orders },
            synced: p.last_synced_at.format("%H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct SummaryRow {
    pub venue: String,
    pub open: usize,
    pub fully: usize,
    pub partially: usize,
    pub unprotected: usize,
}

impl SummaryRow {
    fn rows(summary: &ProtectionSummary) -> Vec<Self> {
        let mut rows: Vec<Self> = summary
            .venues
            .iter()
            .map(|v| Self {
                venue: v.venue.to_string(),
                open: v.open,
                fully: v.fully_protected,
                partially: v.partially_protected,
                unprotected: v.unprotected,
            })
            .collect();
        rows.push(Self {
            venue: "total".into(),
            open: summary.open,
            fully: summary.fully_protected,
            partially: summary.partially_protected,
            unprotected: summary.unprotected,
        });
        rows
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct AuditRow {
    pub venue: String,
    pub local: usize,
    pub remote: usize,
    pub action: String,
    pub key: String,
}

fn audit_rows(report: &AuditReport) -> Vec<AuditRow> {
    let row = |action: String, key: String| AuditRow {
        venue: report.venue.to_string(),
        local: report.local_open,
        remote: report.remote_open,
        action,
        key,
    };
    let mut rows: Vec<AuditRow> = report
        .outcome
        .actions
        .iter()
        .map(|a: &ReconcileAction| row(a.name().to_lowercase(), a.key().to_string()))
        .collect();
    rows.extend(
        report
            .outcome
            .discrepancies
            .iter()
            .map(|d| row(d.kind.as_str().to_lowercase(), d.key.to_string())),
    );
    if rows.is_empty() {
        rows.push(row("clean".into(), "-".into()));
    }
    rows
}

fn print_rows<T: Tabled + Serialize>(rows: &[T], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(rows)?);
    } else if rows.is_empty() {
        println!("(no results)");
    } else {
        println!("{}", Table::new(rows));
    }
    Ok(())
}

pub async fn run_audit(
    engine: &Engine,
    venue: Option<Venue>,
    apply: bool,
    json: bool,
) -> anyhow::Result<()> {
    let reports = engine.audit(venue, apply).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }
    let rows: Vec<AuditRow> = reports.iter().flat_map(audit_rows).collect();
    print_rows(&rows, false)?;
    if !apply && reports.iter().any(|r| !r.outcome.is_clean()) {
        println!("dry run: re-run with --apply to commit these actions");
    }
    Ok(())
}

pub async fn run_status(
    engine: &Engine,
    venue: Option<Venue>,
    all: bool,
    json: bool,
) -> anyhow::Result<()> {
    if all || venue.is_some() {
        let positions = engine.protection_status(venue).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&positions)?);
            return Ok(());
        }
        let rows: Vec<PositionRow> = positions.iter().map(PositionRow::from).collect();
        return print_rows(&rows, false);
    }

    let summary = engine.summary().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    print_rows(&SummaryRow::rows(&summary), false)
}

/// Prints validation problems; Ok only when the configuration is usable
pub fn check_config(config: &AppConfig) -> anyhow::Result<()> {
    match config.validate() {
        Ok(()) => {
            let venues: Vec<String> = config
                .enabled_venues()
                .map(|v| v.kind.to_string())
                .collect();
            println!("configuration ok; enabled venues: {}", venues.join(", "));
            Ok(())
        }
        Err(problems) => {
            for problem in &problems {
                eprintln!("  - {}", problem);
            }
            anyhow::bail!("{} configuration problem(s)", problems.len())
        }
    }
}

/// Fails with every validation problem joined into one error
pub fn check_config_quiet(config: &AppConfig) -> anyhow::Result<()> {
    config
        .validate()
        .map_err(|problems| anyhow::anyhow!("invalid configuration: {}", problems.join("; ")))
}
