//! herald CLI: operator interface to the notification delivery core.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use herald_rs::channel::{ChannelRegistry, ConsoleSender, WebhookSender};
use herald_rs::config::Config;
use herald_rs::config::secrets::redacted_url;
use herald_rs::engine::{ControlConfig, ControlPlane, Reconciler, ReconcilerConfig};
use herald_rs::model::{
    NewNotificationRequest, NotificationRequest, NotificationType, Phase, Priority, RequestId,
};
use herald_rs::sanitize::Sanitizer;
use herald_rs::store::{PgStore, RequestStore};
use herald_rs::telemetry::metrics::OtelMetrics;
use herald_rs::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use tracing::info;

#[derive(Parser)]
#[command(name = "herald", about = "Notification delivery reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane daemon
    Serve {
        /// Global maximum concurrent reconciles (overrides HERALD_MAX_CONCURRENT)
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Notification request operations
    Request {
        #[command(subcommand)]
        action: RequestAction,
    },
    /// Sanitize stdin to stdout with the configured rules
    Sanitize {
        /// Extra rules file (TOML), appended after the built-in rules
        #[arg(long)]
        rules: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum RequestAction {
    /// Submit a new notification request
    Submit {
        subject: String,
        body: String,
        /// Target channel (repeatable)
        #[arg(long = "channel", short = 'c', required = true)]
        channels: Vec<String>,
        /// critical | high | medium | low
        #[arg(long, default_value = "medium")]
        priority: String,
        /// alert | status-update | escalation
        #[arg(long = "type", default_value = "alert")]
        kind: String,
    },
    /// List notification requests
    List {
        /// Filter by phase
        #[arg(long)]
        phase: Option<String>,
        /// Maximum requests to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a request and its delivery audit trail
    Show {
        /// Request ID (full UUID or prefix)
        id: String,
    },
    /// Delete a request
    Delete {
        /// Request ID (full UUID or prefix)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { max_concurrent } => cmd_serve(max_concurrent).await,
        Command::Request { action } => {
            let config = Config::from_env()?;
            let store = PgStore::connect(config.database_url.expose_secret(), 5).await?;
            store.migrate().await?;

            match action {
                RequestAction::Submit {
                    subject,
                    body,
                    channels,
                    priority,
                    kind,
                } => cmd_request_submit(&store, subject, body, channels, priority, kind).await,
                RequestAction::List { phase, limit } => {
                    cmd_request_list(&store, phase, limit).await
                }
                RequestAction::Show { id } => cmd_request_show(&store, id).await,
                RequestAction::Delete { id } => cmd_request_delete(&store, id).await,
            }
        }
        Command::Sanitize { rules } => cmd_sanitize(rules),
    }
}

async fn cmd_serve(max_concurrent: Option<usize>) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "herald".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let max_concurrent = max_concurrent.unwrap_or(config.max_concurrent);
    let store = PgStore::connect(config.database_url.expose_secret(), max_concurrent as u32 + 2)
        .await?;
    store.migrate().await?;
    let store: Arc<dyn RequestStore> = Arc::new(store);

    let mut channels = ChannelRegistry::new();
    channels.register("console", Arc::new(ConsoleSender::new()));
    if let Some(ref url) = config.webhook_url {
        info!(endpoint = %redacted_url(url), "webhook channel enabled");
        channels.register(
            "webhook",
            Arc::new(WebhookSender::new(url.clone(), config.send_timeout)?),
        );
    }
    let registered: Vec<_> = channels.ids().map(|id| id.as_str()).collect();
    info!(channels = %registered.join(","), "channel senders registered");

    let mut sanitizer = Sanitizer::new();
    if let Some(ref path) = config.sanitizer_rules {
        sanitizer = sanitizer.with_rules_file(path)?;
        info!(path = %path.display(), "loaded operator sanitizer rules");
    }

    let reconciler = Reconciler::builder(store.clone(), channels)
        .metrics(Arc::new(OtelMetrics::new()))
        .sanitizer(sanitizer)
        .config(ReconcilerConfig {
            send_timeout: config.send_timeout,
            ..ReconcilerConfig::default()
        })
        .build();

    let control = ControlPlane::new(
        Arc::new(reconciler),
        store,
        ControlConfig {
            max_concurrent,
            ..ControlConfig::default()
        },
    );

    let handle = control.handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    control.run().await?;
    Ok(())
}

async fn cmd_request_submit(
    store: &PgStore,
    subject: String,
    body: String,
    channels: Vec<String>,
    priority: String,
    kind: String,
) -> anyhow::Result<()> {
    let priority: Priority = priority.parse()?;
    let kind: NotificationType = kind.parse()?;

    let new = NewNotificationRequest::new(subject, body)
        .priority(priority)
        .kind(kind)
        .channels(channels);

    let request = store.create(new).await?;
    println!(
        "Created: {} (phase: {}, channels: {})",
        request.id,
        request.status.phase,
        join_channels(&request)
    );
    Ok(())
}

async fn cmd_request_list(
    store: &PgStore,
    phase: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let phase_filter: Option<Phase> = match phase {
        Some(p) => Some(p.parse()?),
        None => None,
    };

    let requests = store.list(phase_filter, limit).await?;

    if requests.is_empty() {
        println!("No notification requests found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<13}  {:<8}  {:<8}  {:<20}  {:<30}  CREATED",
        "ID", "PHASE", "PRI", "ATTEMPTS", "CHANNELS", "SUBJECT"
    );
    println!("{}", "-".repeat(110));

    let sanitizer = Sanitizer::new();
    for request in &requests {
        let short_id = &request.id.to_string()[..8];
        println!(
            "{:<8}  {:<13}  {:<8}  {:<8}  {:<20}  {:<30}  {}",
            short_id,
            request.status.phase,
            request.spec.priority,
            request.status.total_attempts,
            truncate(&join_channels(request), 20),
            truncate(&sanitizer.sanitize(&request.spec.subject), 30),
            request.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} request(s)", requests.len());
    Ok(())
}

async fn cmd_request_show(store: &PgStore, id_str: String) -> anyhow::Result<()> {
    let id = resolve_id(store, &id_str).await?;
    let Some(request) = store.get(&id).await? else {
        anyhow::bail!("notification request {id} not found");
    };
    let status = &request.status;

    println!("ID:          {}", request.id);
    println!("Phase:       {}", status.phase);
    println!("Reason:      {}", status.reason.as_deref().unwrap_or("-"));
    println!("Message:     {}", status.message.as_deref().unwrap_or("-"));
    println!(
        "Subject:     {}",
        Sanitizer::new().sanitize(&request.spec.subject)
    );
    println!("Priority:    {}", request.spec.priority);
    println!("Type:        {}", request.spec.kind);
    println!("Channels:    {}", join_channels(&request));
    println!(
        "Generation:  {} (observed {})",
        request.generation, status.observed_version
    );
    println!(
        "Attempts:    {} total, {} succeeded, {} failed",
        status.total_attempts, status.successful_deliveries, status.failed_deliveries
    );
    println!("Created:     {}", request.created_at);
    println!("Updated:     {}", request.updated_at);
    if let Some(started) = status.processing_started_at {
        println!("Started:     {started}");
    }
    if let Some(completed) = status.completion_time {
        println!("Completed:   {completed}");
    }

    if !status.delivery_attempts.is_empty() {
        println!("---");
        for attempt in &status.delivery_attempts {
            let outcome = if attempt.is_success() {
                "success"
            } else if attempt.permanent {
                "failed (permanent)"
            } else {
                "failed"
            };
            println!(
                "{}  {:<10} #{}  {:<18} {:>6}ms  {}",
                attempt.timestamp.format("%Y-%m-%d %H:%M:%S"),
                attempt.channel,
                attempt.attempt_number,
                outcome,
                attempt.duration_ms,
                attempt.error.as_deref().unwrap_or("")
            );
        }
    }

    Ok(())
}

async fn cmd_request_delete(store: &PgStore, id_str: String) -> anyhow::Result<()> {
    let id = resolve_id(store, &id_str).await?;
    if store.delete(&id).await? {
        println!("Deleted: {id}");
    } else {
        println!("No notification request {id}");
    }
    Ok(())
}

fn cmd_sanitize(rules: Option<PathBuf>) -> anyhow::Result<()> {
    let rules = rules.or_else(|| std::env::var("HERALD_SANITIZER_RULES").ok().map(PathBuf::from));
    let mut sanitizer = Sanitizer::new();
    if let Some(ref path) = rules {
        sanitizer = sanitizer.with_rules_file(path)?;
    }

    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(sanitizer.sanitize(&input).as_bytes())?;
    stdout.flush()?;
    Ok(())
}

/// Accept a full UUID or a unique prefix of a recent request's id.
async fn resolve_id(store: &PgStore, id_str: &str) -> anyhow::Result<RequestId> {
    if id_str.len() >= 36 {
        return Ok(id_str.parse()?);
    }
    let requests = store.list(None, 100).await?;
    let matches: Vec<_> = requests
        .iter()
        .filter(|request| request.id.to_string().starts_with(id_str))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no notification request matching prefix '{id_str}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("{n} requests match prefix '{id_str}', be more specific"),
    }
}

fn join_channels(request: &NotificationRequest) -> String {
    request
        .spec
        .channels
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max.saturating_sub(1)).chain(['…']).collect()
    }
}
