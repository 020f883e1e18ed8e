//! Command-line front end.

use crate::config::Config;
use crate::provider::models;
use crate::secrets::FileSecretStore;
use crate::session::{
    ChannelSink, HistoryItem, SessionHost, SinkMessage, StateSnapshot, TaskStatus,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Stream LLM tasks from the terminal and keep a resumable history
#[derive(Parser, Debug)]
#[command(name = "tack", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a new task and stream the reply
    Run(RunArgs),
    /// Continue a task from history
    Resume(ResumeArgs),
    /// List, show, export or delete past tasks
    History(HistoryArgs),
    /// Manage the API key and model selection
    Config(ConfigArgs),
    /// Delete all tasks, settings and the stored API key
    Reset,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// The prompt (use "-" to read from stdin)
    #[arg(required = true)]
    pub prompt: String,

    /// Model id, saved as the selection for later runs
    #[arg(short, long)]
    pub model: Option<String>,

    /// Output format
    #[arg(short = 'o', long, default_value = "text", value_enum)]
    pub output_format: OutputFormat,

    /// Only print the reply, no usage summary
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// Task id (see `tack history list`)
    pub id: String,

    /// Next message for the task
    pub prompt: Option<String>,

    /// Output format
    #[arg(short = 'o', long, default_value = "text", value_enum)]
    pub output_format: OutputFormat,

    /// Only print the reply, no usage summary
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
pub struct HistoryArgs {
    #[command(subcommand)]
    pub action: HistoryAction,
}

#[derive(Subcommand, Debug)]
pub enum HistoryAction {
    /// List tasks, most recent first
    List,
    /// Print a task's transcript
    Show { id: String },
    /// Write a task's transcript to a markdown file
    Export {
        id: String,
        /// Output file (defaults to a generated name in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete a task
    Delete { id: String },
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Store the Anthropic API key
    SetKey { key: String },
    /// Remove the stored API key
    ClearKey,
    /// Select the model for new turns
    SetModel { model: String },
    /// Show config and data paths
    Path,
    /// List supported models
    Models,
}

/// JSON output for `--output-format json`.
#[derive(Serialize)]
struct JsonResult<'a> {
    task_id: Option<&'a str>,
    status: Option<TaskStatus>,
    response: &'a str,
    input_tokens: u64,
    output_tokens: u64,
    total_cost: f64,
    error: Option<&'a str>,
}

/// Prints streamed text as it grows across snapshots.
#[derive(Default)]
struct Printer {
    task_id: Option<String>,
    turn: usize,
    printed: usize,
    last: Option<StateSnapshot>,
}

impl Printer {
    fn handle(&mut self, message: SinkMessage, echo: bool) -> io::Result<()> {
        let SinkMessage::State(snapshot) = message else {
            return Ok(());
        };

        let task_id = snapshot.active_task.as_ref().map(|t| t.id.clone());
        let turn = snapshot
            .messages
            .iter()
            .filter(|m| m.role == crate::provider::Role::User)
            .count();
        if task_id != self.task_id || turn != self.turn {
            self.task_id = task_id;
            self.turn = turn;
            self.printed = 0;
        }

        if echo && let Some(text) = current_reply(&snapshot) {
            if let Some(fresh) = text.get(self.printed..).filter(|s| !s.is_empty()) {
                print!("{fresh}");
                io::stdout().flush()?;
            }
            self.printed = self.printed.max(text.len());
        }

        self.last = Some(*snapshot);
        Ok(())
    }
}

/// The reply text for the current turn: in flight or just committed.
fn current_reply(snapshot: &StateSnapshot) -> Option<&str> {
    match snapshot.status? {
        TaskStatus::Streaming | TaskStatus::Aborting => snapshot.streaming_text.as_deref(),
        TaskStatus::Completed => snapshot
            .messages
            .last()
            .filter(|m| m.role == crate::provider::Role::Assistant)
            .map(|m| m.content.as_str()),
        TaskStatus::Created | TaskStatus::Aborted => None,
    }
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_default()
}

fn format_item(item: &HistoryItem) -> String {
    format!(
        "{}  {}  {:>7} in {:>7} out  ${:.4}  {}",
        item.id,
        format_ts(item.ts),
        item.tokens_in,
        item.tokens_out,
        item.total_cost,
        item.task
    )
}

fn open_host() -> Result<(SessionHost, mpsc::UnboundedReceiver<SinkMessage>)> {
    let config = Config::load().context("Failed to load config")?;
    let secrets = Arc::new(FileSecretStore::new(config.secrets_path()));
    let (sink, rx) = ChannelSink::new();
    let host = SessionHost::open(&config, secrets, sink).context("Failed to open history")?;
    Ok((host, rx))
}

fn read_prompt(prompt: &str) -> Result<String> {
    let prompt = if prompt == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer.trim().to_string()
    } else {
        prompt.to_string()
    };
    if prompt.trim().is_empty() {
        anyhow::bail!("Empty prompt");
    }
    Ok(prompt)
}

fn check_model(model: &str) -> Result<()> {
    if models::find(model).is_none() {
        let known: Vec<&str> = models::MODELS.iter().map(|m| m.id).collect();
        anyhow::bail!("Unknown model: {model}. Supported: {}", known.join(", "));
    }
    Ok(())
}

/// Run the command line.
pub async fn run(cli: Cli) -> ExitCode {
    match run_inner(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run_inner(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Run(args) => run_task(args).await,
        Commands::Resume(args) => resume_task(args).await,
        Commands::History(args) => history(args).await,
        Commands::Config(args) => config(args).await,
        Commands::Reset => {
            let (host, _rx) = open_host()?;
            host.reset_state().await?;
            println!("Removed all tasks, settings and the stored API key");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_task(args: RunArgs) -> Result<ExitCode> {
    let prompt = read_prompt(&args.prompt)?;
    let (host, mut rx) = open_host()?;

    if let Some(model) = args.model {
        check_model(&model)?;
        let mut api = host.api_configuration();
        api.model_id = Some(model);
        host.update_api_configuration(api).await?;
    }

    host.start_new(&prompt).await?;
    stream_until_idle(&host, &mut rx, args.output_format, args.quiet).await
}

async fn resume_task(args: ResumeArgs) -> Result<ExitCode> {
    let (host, mut rx) = open_host()?;
    host.resume(&args.id).await?;

    if let Some(prompt) = args.prompt {
        let prompt = read_prompt(&prompt)?;
        // Let a reply to a pending question finish first.
        host.wait_for_idle().await;
        host.submit(&prompt).await?;
    }

    stream_until_idle(&host, &mut rx, args.output_format, args.quiet).await
}

/// Print the active turn as it streams; Ctrl-C cancels it.
async fn stream_until_idle(
    host: &SessionHost,
    rx: &mut mpsc::UnboundedReceiver<SinkMessage>,
    format: OutputFormat,
    quiet: bool,
) -> Result<ExitCode> {
    let echo = format == OutputFormat::Text;
    let mut printer = Printer::default();
    let mut interrupted = false;

    let idle = host.wait_for_idle();
    tokio::pin!(idle);

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(message) => printer.handle(message, echo)?,
                None => break,
            },
            () = &mut idle => break,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nCancelling...");
                host.cancel_active().await;
                interrupted = true;
                break;
            }
        }
    }
    while let Ok(message) = rx.try_recv() {
        printer.handle(message, echo)?;
    }

    let Some(last) = printer.last else {
        return Ok(ExitCode::SUCCESS);
    };

    match format {
        OutputFormat::Text => {
            if printer.printed > 0 {
                println!();
            }
            if !quiet {
                eprintln!(
                    "[{}] {} in / {} out tokens, ${:.4}",
                    last.model_id, last.usage.input_tokens, last.usage.output_tokens, last.total_cost
                );
            }
        }
        OutputFormat::Json => {
            let response = last
                .messages
                .last()
                .filter(|m| m.role == crate::provider::Role::Assistant)
                .map_or("", |m| m.content.as_str());
            let json = serde_json::to_string_pretty(&JsonResult {
                task_id: last.active_task.as_ref().map(|t| t.id.as_str()),
                status: last.status,
                response,
                input_tokens: last.usage.input_tokens,
                output_tokens: last.usage.output_tokens,
                total_cost: last.total_cost,
                error: last.error.as_deref(),
            })?;
            println!("{json}");
        }
    }

    if interrupted {
        Ok(ExitCode::from(3))
    } else if let Some(error) = last.error.as_deref() {
        if format == OutputFormat::Text {
            eprintln!("Error: {error}");
        }
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn history(args: HistoryArgs) -> Result<ExitCode> {
    let (host, _rx) = open_host()?;

    match args.action {
        HistoryAction::List => {
            let items = host.task_history().await?;
            if items.is_empty() {
                println!("No tasks yet");
            }
            for item in &items {
                println!("{}", format_item(item));
            }
        }
        HistoryAction::Show { id } => {
            let export = host.export_history(&id).await?;
            print!("{}", export.markdown);
        }
        HistoryAction::Export { id, output } => {
            let export = host.export_history(&id).await?;
            let path = output.unwrap_or_else(|| PathBuf::from(&export.file_name));
            std::fs::write(&path, &export.markdown)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("{}", path.display());
        }
        HistoryAction::Delete { id } => {
            host.delete_history(&id).await?;
            println!("Deleted {id}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn config(args: ConfigArgs) -> Result<ExitCode> {
    match args.action {
        ConfigAction::Path => {
            let config = Config::load().context("Failed to load config")?;
            println!("config:  {}", Config::path().display());
            println!("history: {}", config.history_db_path().display());
            println!("secrets: {}", config.secrets_path().display());
        }
        ConfigAction::Models => {
            let (host, _rx) = open_host()?;
            let selected = models::resolve(host.api_configuration().model_id.as_deref()).id;
            for model in models::MODELS {
                let marker = if model.id == selected { "*" } else { " " };
                println!(
                    "{marker} {:<28} {:>5} max tokens  ${}/${} per 1K in/out",
                    model.id, model.max_tokens, model.input_price, model.output_price
                );
            }
        }
        ConfigAction::SetKey { key } => {
            let (host, _rx) = open_host()?;
            let mut api = host.api_configuration();
            api.api_key = Some(key);
            host.update_api_configuration(api).await?;
            println!("API key saved");
        }
        ConfigAction::ClearKey => {
            let (host, _rx) = open_host()?;
            let mut api = host.api_configuration();
            api.api_key = None;
            host.update_api_configuration(api).await?;
            println!("API key removed");
        }
        ConfigAction::SetModel { model } => {
            check_model(&model)?;
            let (host, _rx) = open_host()?;
            let mut api = host.api_configuration();
            api.model_id = Some(model.clone());
            host.update_api_configuration(api).await?;
            println!("Model set to {model}");
        }
    }
    Ok(ExitCode::SUCCESS)
}
