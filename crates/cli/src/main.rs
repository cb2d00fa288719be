//! Agent Mesh CLI
//!
//! Run an interactive agent session, ask one-off questions, message other
//! sessions and inspect who is online.

mod store;
mod terminal;
mod tools;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use agent_mesh_claude::ClaudeEngine;
use agent_mesh_core::{
    AutoApprove, ChannelHandler, Input, InteractionHandler, PendingApproval, RunResult,
    RuntimeEventKind,
};
use agent_mesh_server::{
    Collaborators, Config, CustomTriggers, Messenger, PresenceRecord, RedisBus, Runtime,
    SessionRegistry,
};

use store::FileStore;
use terminal::{render_event, Console};
use tools::BuiltinTools;

#[derive(Parser)]
#[command(name = "agent-mesh")]
#[command(about = "Run and coordinate reasoning agent sessions")]
struct Cli {
    /// Config file (defaults to <config dir>/agent-mesh/config.toml when present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Redis URL, overrides the config file
    #[arg(long, env = "REDIS_URL", global = true)]
    redis_url: Option<String>,

    /// Key prefix, overrides the config file
    #[arg(long, global = true)]
    prefix: Option<String>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open an interactive session
    Chat {
        /// Session ID
        #[arg(long, short, default_value = "default")]
        session: String,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Ask a single question and print the answer
    Ask {
        /// The question
        question: String,

        /// Session ID
        #[arg(long, short, default_value = "default")]
        session: String,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Send a message to another session's inbox
    Send {
        /// Sender session ID
        #[arg(long, default_value = "cli")]
        from: String,

        /// Recipient session ID
        #[arg(long)]
        to: String,

        /// Message text
        message: String,
    },

    /// List sessions currently online
    Sessions {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate the config and print a summary
    Check,
}

#[derive(Args)]
struct EngineArgs {
    /// Claude CLI binary
    #[arg(long, env = "CLAUDE_BIN", default_value = "claude")]
    claude_bin: String,

    /// Model passed to the Claude CLI
    #[arg(long)]
    model: Option<String>,

    /// Working directory for the Claude CLI
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Seconds to wait for one engine call
    #[arg(long, default_value = "300")]
    engine_timeout: u64,

    /// Where session history is kept
    #[arg(long)]
    history_dir: Option<PathBuf>,

    /// Approve every request without asking
    #[arg(long, short)]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json)?;

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Check => print_config(&config),

        Commands::Send { from, to, message } => {
            let bus = RedisBus::connect(&config.redis.url)
                .await
                .context("Failed to connect to Redis")?;
            let messenger = Messenger::new(Arc::new(bus), config.redis.prefix.clone());
            messenger
                .send(&from, &to, &message)
                .await
                .with_context(|| format!("Failed to send message to {to}"))?;
            println!("Sent to {to}");
        }

        Commands::Sessions { json } => {
            let bus = RedisBus::connect(&config.redis.url)
                .await
                .context("Failed to connect to Redis")?;
            let registry = SessionRegistry::new(Arc::new(bus), config.redis.prefix.clone());
            registry.refresh().await;
            let records = registry.records();
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No sessions online");
            } else {
                println!("Sessions:");
                let now = chrono::Utc::now().timestamp_millis();
                for record in &records {
                    print_record(record, now);
                }
            }
        }

        Commands::Chat { session, engine } => {
            let (runtime, approvals) = start_runtime(config, &engine).await?;
            let outcome = chat(&runtime, &session, approvals).await;
            runtime.shutdown().await;
            outcome?;
        }

        Commands::Ask {
            question,
            session,
            engine,
        } => {
            let (runtime, approvals) = start_runtime(config, &engine).await?;
            let outcome = ask(&runtime, &session, question, approvals).await;
            runtime.shutdown().await;
            let result = outcome?;
            match result.final_answer {
                Some(answer) => println!("{answer}"),
                None => println!("(no answer: {})", result.status),
            }
        }
    }

    Ok(())
}

fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("agent-mesh").join("config.toml"))
}

fn load_config(cli: &Cli) -> Result<Config> {
    let custom = CustomTriggers::with_builtins();
    let path = cli
        .config
        .clone()
        .or_else(|| default_config_path().filter(|path| path.exists()));

    let mut config = match &path {
        Some(path) => Config::load(path, &custom)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(url) = &cli.redis_url {
        config.redis.url = url.clone();
    }
    if let Some(prefix) = &cli.prefix {
        config.redis.prefix = prefix.clone();
    }
    config.validate(&custom).context("Invalid config")?;
    let source = path
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "defaults".into());
    info!(config = %source, redis = %config.redis.url, "Config loaded");
    Ok(config)
}

async fn start_runtime(
    config: Config,
    args: &EngineArgs,
) -> Result<(Runtime, Option<mpsc::Receiver<PendingApproval>>)> {
    let bus = RedisBus::connect(&config.redis.url)
        .await
        .context("Failed to connect to Redis")?;

    let mut engine = ClaudeEngine::new()
        .with_binary(args.claude_bin.clone())
        .with_tools(BuiltinTools::specs())
        .with_timeout(Duration::from_secs(args.engine_timeout));
    if let Some(model) = &args.model {
        engine = engine.with_model(model.clone());
    }
    if let Some(dir) = &args.workdir {
        engine = engine.with_working_dir(dir.clone());
    }

    let (handler, approvals): (Arc<dyn InteractionHandler>, _) = if args.yes {
        (Arc::new(AutoApprove), None)
    } else {
        let (handler, rx) = ChannelHandler::new(8);
        (Arc::new(handler), Some(rx))
    };

    let store = FileStore::new(args.history_dir.clone().unwrap_or_else(FileStore::default_dir));
    info!(history = %store.dir().display(), "Using session history");

    let runtime = Runtime::start(
        config,
        Arc::new(bus),
        Collaborators {
            engine: Arc::new(engine),
            tools: Arc::new(BuiltinTools),
            handler,
            store: Arc::new(store),
        },
        CustomTriggers::with_builtins(),
    )
    .await
    .context("Failed to start runtime")?;
    Ok((runtime, approvals))
}

/// Next approval request, or never when approvals are answered automatically.
async fn next_approval(
    approvals: &mut Option<mpsc::Receiver<PendingApproval>>,
) -> Option<PendingApproval> {
    match approvals {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn chat(
    runtime: &Runtime,
    session: &str,
    mut approvals: Option<mpsc::Receiver<PendingApproval>>,
) -> Result<()> {
    runtime
        .open_session(session, Some(serde_json::json!({ "client": "cli" })))
        .await
        .with_context(|| format!("Failed to open session {session}"))?;

    let mut events = runtime.events().subscribe(format!("cli-{session}"));
    let mut console = Console::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    println!("Session `{session}` is online. Commands: /peers /triggers /cancel /quit");
    console.prompt("> ");

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!();
                break;
            }
            Some(pending) = next_approval(&mut approvals) => {
                console.resolve(pending).await?;
                console.prompt("> ");
            }
            Some(event) = events.recv() => {
                if let Some(line) = render_event(&event) {
                    println!("\r{line}");
                    console.prompt("> ");
                }
            }
            line = console.read_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                match line {
                    "" => {}
                    "/quit" | "/exit" => break,
                    "/peers" => {
                        for peer in runtime.list_active() {
                            let marker = if peer == session { " (this session)" } else { "" };
                            println!("  {peer}{marker}");
                        }
                    }
                    "/triggers" => {
                        let status = runtime.triggers().status(session);
                        if status.is_empty() {
                            println!("  no triggers");
                        }
                        for trigger in status {
                            println!(
                                "  {:<20} {:<8} fired {} time(s){}",
                                trigger.name,
                                trigger.kind,
                                trigger.fired,
                                if trigger.running { "" } else { " (stopped)" }
                            );
                        }
                    }
                    "/cancel" => {
                        if !runtime.dispatcher().cancel_run(session) {
                            println!("  nothing is running");
                        }
                    }
                    text => {
                        if let Err(e) = runtime.inject(session, Input::user(text)) {
                            warn!(error = %e, "Input not accepted");
                            break;
                        }
                    }
                }
                console.prompt("> ");
            }
        }
    }

    runtime.events().unsubscribe(&format!("cli-{session}"));
    runtime.close_session(session).await;
    Ok(())
}

async fn ask(
    runtime: &Runtime,
    session: &str,
    question: String,
    mut approvals: Option<mpsc::Receiver<PendingApproval>>,
) -> Result<RunResult> {
    let mut console = Console::new();
    let mut events = runtime.events().subscribe(format!("cli-{session}"));
    let run = runtime.ask(session, Input::user(question));
    tokio::pin!(run);

    let result = loop {
        tokio::select! {
            result = &mut run => break result?,
            Some(pending) = next_approval(&mut approvals) => console.resolve(pending).await?,
            Some(event) = events.recv() => {
                // The answer itself is printed by the caller.
                if !matches!(event.kind, RuntimeEventKind::FinalAnswer { .. }) {
                    if let Some(line) = render_event(&event) {
                        eprintln!("{line}");
                    }
                }
            }
        }
    };
    runtime.events().unsubscribe(&format!("cli-{session}"));
    Ok(result)
}

fn print_record(record: &PresenceRecord, now_ms: i64) {
    let age = (now_ms - record.last_seen).max(0) / 1000;
    let metadata = record
        .metadata
        .as_ref()
        .map(|m| m.to_string())
        .unwrap_or_default();
    println!(
        "  {:<20} seen {age}s ago (ttl {}s) {metadata}",
        record.session_id, record.ttl_seconds
    );
}

fn print_config(config: &Config) {
    let kernel = &config.kernel;
    let approval = &config.approval;
    println!("Config OK");
    println!("  Redis:          {} (prefix `{}`)", config.redis.url, config.redis.prefix);
    println!("  Iterations:     {}", kernel.max_iterations);
    println!("  Engine retries: {}", kernel.engine_retries);
    println!("  Approvals:      {}", if approval.enabled { "on" } else { "off" });
    println!("  Approval wait:  {}s", kernel.approval_timeout_secs);
    println!(
        "  Checkpoints:    {}",
        match approval.checkpoint_interval.unwrap_or(kernel.checkpoint_interval) {
            0 => "off".to_string(),
            n => format!("every {n} iterations"),
        }
    );
    println!("  Presence TTL:   {}s", config.presence.ttl_secs);
    if config.triggers.is_empty() {
        println!("  Triggers:       none");
    } else {
        println!("  Triggers:");
        for trigger in &config.triggers {
            println!(
                "    {:<20} {:<8}{}",
                trigger.name,
                trigger.kind,
                if trigger.enabled { "" } else { " (disabled)" }
            );
        }
    }
}
