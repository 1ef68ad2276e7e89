//! # Cadence — contact outreach scheduler & delivery pipeline
//!
//! Operator CLI over the scheduling engine and the delivery pipeline.
//!
//! Usage:
//!   cadence schedule --input contacts.json --output schedule.json \
//!       --start 2024-01-01 --end 2024-12-31 [--parallel]
//!   cadence batch --input contacts.json --db cadence.db --org-id 7 \
//!       --scope next_30_days --mode test --test-email qa@example.com
//!   cadence send --batch <id> --db cadence.db --chunk 25 [--live]
//!   cadence retry --batch <id> --db cadence.db --chunk 25
//!   cadence status --batch <id> --db cadence.db
//!   cadence delivery-status --batch <id> --db cadence.db

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use cadence_channels::{DisabledGateway, SendGridConfig, SendGridGateway, StockRenderer};
use cadence_core::config::{PipelineConfig, RuleConfig};
use cadence_core::traits::MailGateway;
use cadence_core::types::{Contact, ContactSchedule, DateRange, EmailKind, Organization, SendMode};
use cadence_pipeline::{DeliveryPipeline, Scope};
use cadence_scheduler::{BatchProcessor, CancelFlag};
use cadence_store::TrackingStore;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "cadence",
    version,
    about = "📬 Cadence — contact outreach scheduler & delivery pipeline"
)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compute the schedule for a contact file and write the JSON report
    Schedule {
        /// Input JSON file with contacts
        #[arg(long)]
        input: String,
        /// Output JSON file for the schedule report
        #[arg(long)]
        output: String,
        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: String,
        /// End date (YYYY-MM-DD)
        #[arg(long)]
        end: String,
        /// Rule config TOML (built-in rules when omitted)
        #[arg(long)]
        rules: Option<String>,
        /// Fan out across contacts
        #[arg(long)]
        parallel: bool,
        /// Worker bound for --parallel
        #[arg(long, default_value = "16")]
        workers: usize,
        /// Also write a flat CSV of the schedule
        #[arg(long)]
        csv: Option<String>,
    },
    /// Schedule contacts and insert tracking rows for sending
    Batch {
        #[arg(long)]
        input: String,
        /// Tracking database path
        #[arg(long, default_value = "~/.cadence/cadence.db")]
        db: String,
        #[arg(long)]
        org_id: i64,
        #[arg(long, default_value = "Cadence")]
        org_name: String,
        /// Comma-separated message kinds (all four when omitted)
        #[arg(long)]
        types: Option<String>,
        /// today | next_7_days | next_30_days | next_90_days | bulk
        #[arg(long, default_value = "next_30_days")]
        scope: String,
        /// test | production
        #[arg(long, default_value = "test")]
        mode: String,
        /// Test recipient (repeatable; round-robin)
        #[arg(long = "test-email")]
        test_emails: Vec<String>,
        /// Schedule window start (default: today)
        #[arg(long)]
        start: Option<String>,
        /// Schedule window end (default: start + 1 year)
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        rules: Option<String>,
    },
    /// Process a chunk of a batch through the mail gateway
    Send {
        #[arg(long)]
        batch: String,
        #[arg(long, default_value = "~/.cadence/cadence.db")]
        db: String,
        #[arg(long, default_value = "25")]
        chunk: usize,
        /// Disable dry-run (still subject to the sending-enabled flags)
        #[arg(long)]
        live: bool,
        /// Inter-message delay in seconds
        #[arg(long)]
        delay: Option<f64>,
        #[arg(long, default_value = "Cadence")]
        org_name: String,
    },
    /// Move failed rows back to pending and process a chunk
    Retry {
        #[arg(long)]
        batch: String,
        #[arg(long, default_value = "~/.cadence/cadence.db")]
        db: String,
        #[arg(long, default_value = "25")]
        chunk: usize,
        #[arg(long, default_value = "Cadence")]
        org_name: String,
    },
    /// Show aggregate counts for a batch
    Status {
        #[arg(long)]
        batch: String,
        #[arg(long, default_value = "~/.cadence/cadence.db")]
        db: String,
    },
    /// Refresh delivery outcomes from the gateway for a batch
    DeliveryStatus {
        #[arg(long)]
        batch: String,
        #[arg(long, default_value = "~/.cadence/cadence.db")]
        db: String,
        #[arg(long, default_value = "Cadence")]
        org_name: String,
    },
    /// Apply a gateway event-webhook payload to tracking rows
    Events {
        /// JSON file with the event array
        #[arg(long)]
        input: String,
        #[arg(long, default_value = "~/.cadence/cadence.db")]
        db: String,
    },
    /// List recent batches
    Batches {
        #[arg(long, default_value = "~/.cadence/cadence.db")]
        db: String,
        /// Keep batches containing rows with this status
        #[arg(long)]
        status: Option<String>,
        /// test | production
        #[arg(long)]
        mode: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "cadence=debug" } else { "cadence=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    match cli.command {
        Command::Schedule { input, output, start, end, rules, parallel, workers, csv } => {
            run_schedule(
                &input,
                &output,
                &start,
                &end,
                rules.as_deref(),
                parallel,
                workers,
                csv.as_deref(),
            )
            .await
        }
        Command::Batch {
            input,
            db,
            org_id,
            org_name,
            types,
            scope,
            mode,
            test_emails,
            start,
            end,
            rules,
        } => {
            run_batch(
                &input,
                &db,
                org_id,
                &org_name,
                types.as_deref(),
                &scope,
                &mode,
                test_emails,
                start.as_deref(),
                end.as_deref(),
                rules.as_deref(),
            )
            .await
        }
        Command::Send { batch, db, chunk, live, delay, org_name } => {
            run_send(&batch, &db, chunk, live, delay, &org_name).await
        }
        Command::Retry { batch, db, chunk, org_name } => {
            run_retry(&batch, &db, chunk, &org_name).await
        }
        Command::Status { batch, db } => run_status(&batch, &db),
        Command::DeliveryStatus { batch, db, org_name } => {
            run_delivery_status(&batch, &db, &org_name).await
        }
        Command::Events { input, db } => run_events(&input, &db),
        Command::Batches { db, status, mode, limit } => {
            run_batches(&db, status.as_deref(), mode.as_deref(), limit)
        }
    }
}

// ─── schedule ─────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn run_schedule(
    input: &str,
    output: &str,
    start: &str,
    end: &str,
    rules: Option<&str>,
    parallel: bool,
    workers: usize,
    csv_out: Option<&str>,
) -> Result<()> {
    let range = parse_range(start, end)?;
    let cfg = load_rules(rules)?;
    let contacts = load_contacts(input)?;
    println!("📅 Scheduling {} contacts over {} → {}", contacts.len(), range.start, range.end);

    let schedules = run_engine(contacts, cfg, range, parallel, workers).await?;

    let scheduled: usize = schedules.iter().map(|s| s.emails.len()).sum();
    let skipped: usize = schedules.iter().map(|s| s.skipped.len()).sum();

    let out_path = expand_path(output);
    if let Some(parent) = Path::new(&out_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let json = serde_json::to_string_pretty(&schedules)?;
    std::fs::write(&out_path, json).with_context(|| format!("writing {out_path}"))?;

    if let Some(csv_path) = csv_out {
        write_schedule_csv(&schedules, &expand_path(csv_path))?;
    }

    println!("✅ {scheduled} scheduled, {skipped} skipped → {out_path}");
    Ok(())
}

/// Flat CSV of the schedule report, one row per intent.
fn write_schedule_csv(schedules: &[ContactSchedule], path: &str) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).with_context(|| format!("writing {path}"))?;
    writer.write_record(["contact_id", "type", "date", "default_date", "status", "reason"])?;
    for schedule in schedules {
        for email in &schedule.emails {
            let date = email.date.to_string();
            let default_date = email.default_date.map(|d| d.to_string()).unwrap_or_default();
            writer.write_record([
                schedule.contact_id.as_str(),
                email.kind.as_str(),
                date.as_str(),
                default_date.as_str(),
                "scheduled",
                "",
            ])?;
        }
        for skip in &schedule.skipped {
            let date = skip.date.map(|d| d.to_string()).unwrap_or_default();
            writer.write_record([
                schedule.contact_id.as_str(),
                skip.kind.as_str(),
                date.as_str(),
                "",
                "skipped",
                skip.reason.as_str(),
            ])?;
        }
    }
    writer.flush()?;
    println!("🗒️ CSV written to {path}");
    Ok(())
}

async fn run_engine(
    contacts: Vec<Contact>,
    cfg: RuleConfig,
    range: DateRange,
    parallel: bool,
    workers: usize,
) -> Result<Vec<ContactSchedule>> {
    if parallel {
        let processor = BatchProcessor::new(workers);
        let schedules = processor
            .process(contacts, Arc::new(cfg), range, CancelFlag::new())
            .await?;
        Ok(schedules)
    } else {
        let mut schedules: Vec<_> = contacts
            .iter()
            .map(|c| cadence_scheduler::schedule(c, &cfg, range))
            .collect();
        schedules.sort_by(|a, b| a.contact_id.cmp(&b.contact_id));
        Ok(schedules)
    }
}

// ─── batch ────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn run_batch(
    input: &str,
    db: &str,
    org_id: i64,
    org_name: &str,
    types: Option<&str>,
    scope: &str,
    mode: &str,
    test_emails: Vec<String>,
    start: Option<&str>,
    end: Option<&str>,
    rules: Option<&str>,
) -> Result<()> {
    let scope = Scope::parse(scope).ok_or_else(|| anyhow!("invalid scope: {scope}"))?;
    let mode = SendMode::parse(mode).ok_or_else(|| anyhow!("invalid mode: {mode}"))?;
    let kinds = parse_kinds(types)?;

    let today = Utc::now().date_naive();
    let range_start = match start {
        Some(s) => parse_date(s)?,
        None => today,
    };
    let range_end = match end {
        Some(s) => parse_date(s)?,
        None => range_start + chrono::Duration::days(365),
    };
    let range = DateRange::new(range_start, range_end);

    let cfg = load_rules(rules)?;
    let mut contacts = load_contacts(input)?;
    for contact in &mut contacts {
        if contact.org_id == 0 {
            contact.org_id = org_id;
        }
    }

    let schedules = run_engine(contacts.clone(), cfg, range, true, 16).await?;

    let mut config = PipelineConfig::from_env();
    config.send_mode = mode;
    config.test_emails = test_emails;
    let store = Arc::new(TrackingStore::open(Path::new(&expand_path(db)))?);
    let pipeline = DeliveryPipeline::new(
        store,
        Arc::new(DisabledGateway),
        Arc::new(StockRenderer::new()),
        config,
        Organization::new(org_id, org_name),
    )?;

    let receipt = pipeline.create_batch(&schedules, &contacts, &kinds, scope, today)?;
    println!("📦 Batch created: {}", receipt.batch_id);
    println!("   Rows:  {}", receipt.total);
    println!("   Scope: {scope}");
    println!("   Mode:  {mode}");
    Ok(())
}

// ─── send / retry / status ────────────────────────────────────

async fn run_send(
    batch: &str,
    db: &str,
    chunk: usize,
    live: bool,
    delay: Option<f64>,
    org_name: &str,
) -> Result<()> {
    let store = Arc::new(TrackingStore::open(Path::new(&expand_path(db)))?);
    let (pipeline, dry_run) = pipeline_for_batch(store, batch, live, delay, org_name)?;

    let label = if dry_run { "dry-run" } else { "live" };
    println!("📨 Processing batch {batch} (chunk {chunk}, {label})");
    let report = pipeline.process_chunk(batch, chunk).await?;
    print_chunk(&report);
    Ok(())
}

async fn run_retry(batch: &str, db: &str, chunk: usize, org_name: &str) -> Result<()> {
    let store = Arc::new(TrackingStore::open(Path::new(&expand_path(db)))?);
    let (pipeline, _) = pipeline_for_batch(store, batch, false, None, org_name)?;
    let report = pipeline.retry_failed(batch, chunk).await?;
    println!("🔁 Retried {} failed rows", report.retried);
    print_chunk(&report.chunk);
    Ok(())
}

fn run_status(batch: &str, db: &str) -> Result<()> {
    let store = TrackingStore::open(Path::new(&expand_path(db)))?;
    let status = store
        .get_batch(batch)?
        .ok_or_else(|| anyhow!("no batch found with id {batch}"))?;
    println!("📊 Batch {batch}");
    println!("   Mode:       {}", status.send_mode.map(|m| m.to_string()).unwrap_or_default());
    println!("   Total:      {}", status.total);
    println!("   Pending:    {}", status.pending);
    println!("   Processing: {}", status.processing);
    println!("   Sent:       {}", status.sent);
    println!("   Failed:     {}", status.failed);
    println!("   Deferred:   {}", status.deferred);
    println!("   Bounced:    {}", status.bounced);
    println!("   Dropped:    {}", status.dropped);
    println!("   Skipped:    {}", status.skipped);
    println!("   Complete:   {}", if status.is_complete { "yes" } else { "no" });
    Ok(())
}

async fn run_delivery_status(batch: &str, db: &str, org_name: &str) -> Result<()> {
    let store = Arc::new(TrackingStore::open(Path::new(&expand_path(db)))?);
    let (pipeline, _) = pipeline_for_batch(store, batch, true, None, org_name)?;
    let report = pipeline.update_delivery_status(batch).await?;
    println!("🔎 Checked {} rows", report.checked);
    println!("   Delivered: {}", report.delivered);
    println!("   Deferred:  {}", report.deferred);
    println!("   Bounced:   {}", report.bounced);
    println!("   Dropped:   {}", report.dropped);
    println!("   Unknown:   {}", report.unknown);
    if report.errors > 0 {
        println!("   ⚠️ Query errors: {}", report.errors);
    }
    Ok(())
}

fn run_events(input: &str, db: &str) -> Result<()> {
    let store = TrackingStore::open(Path::new(&expand_path(db)))?;
    let body = std::fs::read_to_string(expand_path(input))
        .with_context(|| format!("reading events from {input}"))?;
    let events = cadence_channels::parse_events(&body)?;

    let mut applied = 0usize;
    let mut unmatched = 0usize;
    let mut ignored = 0usize;
    for event in &events {
        let Some(report) = event.delivery_report() else {
            ignored += 1;
            continue;
        };
        let Some(message_id) = event.message_id() else {
            unmatched += 1;
            continue;
        };
        match store.find_by_message_id(message_id)? {
            Some(row) => match store.record_status_check(row.id, &report) {
                Ok(()) => applied += 1,
                Err(e) => {
                    tracing::warn!("Event for row {} not applied: {e}", row.id);
                    unmatched += 1;
                }
            },
            None => unmatched += 1,
        }
    }
    println!("📥 {} events: {applied} applied, {unmatched} unmatched, {ignored} ignored", events.len());
    Ok(())
}

fn run_batches(db: &str, status: Option<&str>, mode: Option<&str>, limit: usize) -> Result<()> {
    let store = TrackingStore::open(Path::new(&expand_path(db)))?;
    let filter = cadence_store::BatchFilter {
        status: status
            .map(|s| {
                cadence_core::types::SendStatus::parse(s)
                    .ok_or_else(|| anyhow!("invalid status: {s}"))
            })
            .transpose()?,
        send_mode: mode
            .map(|m| SendMode::parse(m).ok_or_else(|| anyhow!("invalid mode: {m}")))
            .transpose()?,
        limit: Some(limit),
        ..Default::default()
    };
    let batches = store.list_batches(&filter)?;
    if batches.is_empty() {
        println!("No batches found");
        return Ok(());
    }
    for batch in batches {
        println!(
            "{}  total={} pending={} sent={} failed={} mode={} {}",
            batch.batch_id,
            batch.total,
            batch.pending,
            batch.sent,
            batch.failed,
            batch.send_mode.map(|m| m.to_string()).unwrap_or_default(),
            if batch.is_complete { "✅" } else { "…" }
        );
    }
    Ok(())
}

/// Build a pipeline whose mode matches the batch's rows.
fn pipeline_for_batch(
    store: Arc<TrackingStore>,
    batch: &str,
    live: bool,
    delay: Option<f64>,
    org_name: &str,
) -> Result<(DeliveryPipeline, bool)> {
    let status = store
        .get_batch(batch)?
        .ok_or_else(|| anyhow!("no batch found with id {batch}"))?;

    let mut config = PipelineConfig::from_env();
    config.send_mode = status.send_mode.unwrap_or(SendMode::Test);
    if let Some(addr) = status.test_email.clone() {
        config.test_emails = vec![addr];
    } else if config.send_mode == SendMode::Test && config.test_emails.is_empty() {
        bail!("batch {batch} is a test batch but carries no test recipient");
    }
    if live {
        config.dry_run = false;
    }
    if let Some(secs) = delay {
        if secs < 0.0 {
            bail!("--delay must be non-negative");
        }
        config.send_delay_ms = (secs * 1000.0) as u64;
    }

    let dry_run = config.effective_dry_run();
    let gateway: Arc<dyn MailGateway> = if dry_run {
        Arc::new(DisabledGateway)
    } else {
        let key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("SENDGRID_API_KEY is required for live sending"))?;
        let mut sg = SendGridConfig::new(key);
        sg.timeout_secs = config.gateway_timeout_secs;
        Arc::new(SendGridGateway::new(sg)?)
    };

    let org_id = store.batch_org_id(batch)?.unwrap_or(0);
    let pipeline = DeliveryPipeline::new(
        store,
        gateway,
        Arc::new(StockRenderer::new()),
        config,
        Organization::new(org_id, org_name),
    )?;
    Ok((pipeline, dry_run))
}

fn print_chunk(report: &cadence_pipeline::ChunkReport) {
    println!("   Processed: {}", report.processed);
    println!("   Sent:      {}", report.sent);
    println!("   Failed:    {}", report.failed);
    println!("   Skipped:   {}", report.skipped);
    println!("   Remaining: {}", report.remaining);
    for error in report.errors.iter().take(10) {
        println!("   ⚠️ {error}");
    }
}

// ─── helpers ──────────────────────────────────────────────────

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{raw}' (expected YYYY-MM-DD)"))
}

fn parse_range(start: &str, end: &str) -> Result<DateRange> {
    let start = parse_date(start)?;
    let end = parse_date(end)?;
    if end <= start {
        bail!("end date must be after start date");
    }
    Ok(DateRange::new(start, end))
}

fn parse_kinds(raw: Option<&str>) -> Result<Vec<EmailKind>> {
    match raw {
        None => Ok(Vec::new()),
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| EmailKind::parse(s).ok_or_else(|| anyhow!("invalid message kind: {s}")))
            .collect(),
    }
}

fn load_rules(path: Option<&str>) -> Result<RuleConfig> {
    let expanded = path.map(expand_path);
    let cfg = RuleConfig::load_or_default(expanded.as_deref().map(Path::new))?;
    Ok(cfg)
}

fn load_contacts(path: &str) -> Result<Vec<Contact>> {
    let expanded = expand_path(path);
    let content = std::fs::read_to_string(&expanded)
        .with_context(|| format!("reading contacts from {expanded}"))?;
    let contacts: Vec<Contact> =
        serde_json::from_str(&content).with_context(|| format!("parsing {expanded}"))?;
    if contacts.is_empty() {
        tracing::warn!("⚠️ Contact file {expanded} is empty");
    }
    Ok(contacts)
}
