//! # Outreach: scheduling engine host
//!
//! Runs the tick and sweep loops against file-based rules and leads, a
//! SQLite ledger, and the channel adapters configured in `config.toml`.
//!
//! Usage:
//!   outreach run                          # Run until Ctrl-C
//!   outreach run --config ./outreach.toml # Explicit config
//!   outreach check-rules                  # Validate the rules file
//!   outreach ledger --lead lead-42        # Show a lead's ledger history

use anyhow::Result;
use clap::{Parser, Subcommand};
use outreach_core::config::OutreachConfig;
use outreach_scheduler::{
    AdapterSet, EventLog, FanoutSink, FileLeadSource, FileRuleStore, LedgerStore, OutreachEngine, RuleRef,
    SqliteLedgerStore, TracingSink,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "outreach", version, about = "📞 Outreach: dialing and reengagement scheduler")]
struct Cli {
    /// Config file (default: ~/.outreach/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine until Ctrl-C
    Run,
    /// Validate a rules file and print each rule's verdict
    CheckRules {
        /// Rules file (default: storage.rules_path)
        #[arg(long)]
        rules: Option<String>,
    },
    /// Print persisted ledger entries
    Ledger {
        /// Full history of one lead instead of every current line
        #[arg(long)]
        lead: Option<String>,
        /// Also print the most recent transition events
        #[arg(long, default_value = "0")]
        events: usize,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        "outreach=debug,outreach_scheduler=debug,outreach_channels=debug"
    } else {
        "outreach=info,outreach_scheduler=info,outreach_channels=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

fn load_config(path: Option<&str>) -> Result<OutreachConfig> {
    let config = match path {
        Some(p) => OutreachConfig::load_from(&expand_path(p))?,
        None => OutreachConfig::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run => run(config).await,
        Command::CheckRules { rules } => {
            let path = rules.map(|r| expand_path(&r)).unwrap_or_else(|| config.storage.rules_path());
            check_rules(&path)
        }
        Command::Ledger { lead, events } => show_ledger(&config, lead.as_deref(), events),
    }
}

async fn run(config: OutreachConfig) -> Result<()> {
    let ledger_path = config.storage.ledger_path();
    let rules_path = config.storage.rules_path();
    let leads_path = config.storage.leads_path();

    let store = Arc::new(SqliteLedgerStore::open(&ledger_path)?);
    let history = Arc::new(EventLog::new(config.engine.event_history));
    let sink = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(store.clone())
        .with(history.clone());
    let adapters: AdapterSet = outreach_channels::adapters_from_config(&config.channels)
        .into_iter()
        .collect();
    if adapters.channels().is_empty() {
        tracing::warn!("⚠️ No channels configured; every attempt will be recorded as an error");
    }

    let engine = Arc::new(
        OutreachEngine::builder(
            &config.engine,
            Arc::new(FileRuleStore::new(&rules_path)),
            Arc::new(FileLeadSource::new(&leads_path)),
            store,
            adapters,
        )
        .events(Arc::new(sink))
        .build()?,
    );

    println!("📞 Outreach v{}", env!("CARGO_PKG_VERSION"));
    println!("   🗄️  Ledger: {}", ledger_path.display());
    println!("   📋 Rules:  {}", rules_path.display());
    println!("   👥 Leads:  {}", leads_path.display());
    println!();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let runner = tokio::spawn(engine.clone().run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Ctrl-C received, shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(e) = runner.await? {
        tracing::warn!("⚠️ Shutdown incomplete: {e}");
    }

    let stats = engine.stats().await;
    tracing::info!("📊 {} transitions in recent history", history.len());
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn check_rules(path: &std::path::Path) -> Result<()> {
    let file = FileRuleStore::new(path).load_file()?;
    println!("📋 {} ({} dialing, {} reengagement)", path.display(), file.dialing.len(), file.reengagement.len());

    let rules = file
        .dialing
        .into_iter()
        .map(|r| RuleRef::Dialing(Arc::new(r)))
        .chain(file.reengagement.into_iter().map(|r| RuleRef::Reengagement(Arc::new(r))));
    let mut invalid = 0;
    for rule in rules {
        let state = if rule.enabled() { "" } else { " (disabled)" };
        match rule.validate() {
            Ok(()) => {
                println!("   ✅ [{:?}] {}: {}{state}", rule.kind(), rule.id(), rule.name());
                let missing = rule.policy().backoff.missing_outcomes();
                if !missing.is_empty() {
                    let names: Vec<&str> = missing.iter().map(|o| o.as_str()).collect();
                    println!("      ⚠️  no backoff for: {}", names.join(", "));
                }
            }
            Err(e) => {
                invalid += 1;
                println!("   ❌ [{:?}] {}{state}: {e}", rule.kind(), rule.id());
            }
        }
    }
    if invalid > 0 {
        anyhow::bail!("{invalid} invalid rule(s)");
    }
    Ok(())
}

fn show_ledger(config: &OutreachConfig, lead: Option<&str>, events: usize) -> Result<()> {
    let store = SqliteLedgerStore::open(&config.storage.ledger_path())?;
    let entries = match lead {
        Some(lead_id) => store.load_history(lead_id)?,
        None => store.load_current()?,
    };
    if entries.is_empty() {
        println!("📒 Ledger is empty");
    }
    for e in &entries {
        let last = e.last_outcome.map(|o| o.as_str()).unwrap_or("-");
        println!(
            "{:<40} {:<10} attempts={:<3} last={:<15} next={}{}",
            e.key().to_string(),
            e.state.as_str(),
            e.attempts_total,
            last,
            e.next_eligible_at.to_rfc3339(),
            e.cancel_reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default()
        );
    }

    if events > 0 {
        println!();
        for event in store.recent_events(events)? {
            println!("{}", serde_json::to_string(&event)?);
        }
    }
    Ok(())
}
