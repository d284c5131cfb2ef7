use std::io::Read;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use triage_plane::{
    config::{Config, LogFormat},
    connection::{ConnectionService, HttpEventTransport},
    events::{EventDispatcher, InvestigationHandlers, LogNotificationSink, ProgressThrottle},
    investigation::{classify_request, extract_commands, extract_metadata},
    storage::{ReportStore, SqliteStorage},
};

/// Cluster troubleshooting control plane
#[derive(Parser)]
#[command(name = "triage", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Follow the agent's push stream and log alerts and progress until Ctrl-C
    Watch {
        /// Agent endpoint, overriding AGENT_BASE_URL
        #[arg(long)]
        base_url: Option<String>,
    },
    /// Classify the intent of a message
    Classify {
        /// Message text
        text: Vec<String>,
    },
    /// Extract tool calls from model output on stdin, as JSON
    Extract,
    /// Extract confidence, root cause and hypotheses from model output on stdin, as JSON
    Assess,
    /// List recently concluded investigations
    Reports {
        /// Maximum number of reports
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    match cli.command {
        Command::Watch { base_url } => watch(config, base_url).await,
        Command::Classify { text } => {
            println!("{}", classify_request(&text.join(" ")));
            Ok(())
        }
        Command::Extract => {
            let commands = extract_commands(&read_stdin()?);
            println!("{}", serde_json::to_string_pretty(&commands)?);
            Ok(())
        }
        Command::Assess => {
            let metadata = extract_metadata(&read_stdin()?);
            println!("{}", serde_json::to_string_pretty(&metadata)?);
            Ok(())
        }
        Command::Reports { limit } => reports(&config, limit).await,
    }
}

async fn watch(config: Config, base_url: Option<String>) -> anyhow::Result<()> {
    let base_url = base_url.unwrap_or_else(|| config.agent.base_url.clone());
    info!(
        version = env!("CARGO_PKG_VERSION"),
        base_url = %base_url,
        "Watching agent push stream"
    );

    let handlers = InvestigationHandlers::new();
    let subscription = handlers.register(|prompt| {
        info!(prompt = %prompt, "Investigation requested");
    });

    let dispatcher = Arc::new(EventDispatcher::new(
        Arc::new(LogNotificationSink),
        handlers,
        ProgressThrottle::spawn(config.throttle.clone()),
    ));
    let transport = Arc::new(HttpEventTransport::new(config.connection.probe_timeout())?);

    let mut progress = dispatcher.progress().subscribe();
    let service = ConnectionService::start(
        config.connection.clone(),
        base_url,
        transport,
        Arc::clone(&dispatcher),
    );
    let mut status = service.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    error!("Connection driver stopped unexpectedly");
                    break;
                }
                let state = *status.borrow_and_update();
                info!(state = %state, "Connection state changed");
            }
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                match progress.borrow_and_update().as_ref() {
                    Some(p) => info!(
                        percent = p.percent(),
                        current = p.current,
                        total = p.total,
                        "{}",
                        p.message
                    ),
                    None => info!("Progress cleared"),
                }
            }
        }
    }

    info!("Shutting down");
    service.shutdown().await;
    subscription.unregister();
    Ok(())
}

async fn reports(config: &Config, limit: u32) -> anyhow::Result<()> {
    let storage = SqliteStorage::new(&config.database).await?;
    for report in storage.recent_reports(limit).await? {
        println!(
            "{}  {}  [{} / {}]  {}",
            report.concluded_at.format("%Y-%m-%d %H:%M:%S"),
            report.id,
            report.termination,
            report.assessment.level,
            report.query
        );
        if let Some(cause) = &report.root_cause {
            println!("    root cause: {}", cause);
        }
    }
    Ok(())
}

fn read_stdin() -> anyhow::Result<String> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    Ok(input)
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
