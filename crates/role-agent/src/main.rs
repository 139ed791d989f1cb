use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use role_agent::app::{AppState, bootstrap};
use role_agent::batch::{BatchSession, TaskStatus, read_csv_file, submit_with_notice};
use role_agent::config::{self, Config};
use role_agent::executor::{SingleRun, StdoutSink};
use role_agent::form::InputForm;
use role_agent::log_sanitize::sanitize_text;
use role_agent::logging::{LogTarget, init_logging};
use role_agent::notify::StderrNotify;
use role_agent::results::{BatchSummary, FeedbackState, export_to_file};
use role_agent::service::{CompletionRequest, PlatformClient, Rating};
use role_agent::welcome::{QUICK_PROMPTS, prompt_bridge};
use role_agent::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to a config TOML (defaults to ./role-agent.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch the application parameters and print the prompt variables
    Params,
    /// List the quick prompts
    Prompts,
    /// Run one completion
    Run {
        /// Variable value as key=value (repeatable)
        #[arg(long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Remote image URL to attach (repeatable)
        #[arg(long = "image", value_name = "URL")]
        images: Vec<String>,
        /// Send quick prompt N (1-based) instead of the form
        #[arg(long)]
        prompt: Option<usize>,
        /// Text for the first variable
        text: Option<String>,
    },
    /// Run every row of a CSV file, a few tasks at a time
    Batch {
        /// CSV file whose header matches the prompt variables
        csv: PathBuf,
        /// Write inputs and results to this CSV when done
        #[arg(long)]
        export: Option<PathBuf>,
        /// Automatically retry failed tasks up to N rounds
        #[arg(long, default_value_t = 0)]
        retry_failed: usize,
    },
    /// Rate a generated message
    Feedback {
        message_id: String,
        #[arg(long, value_enum)]
        rating: RatingArg,
    },
    /// Terminal UI
    Tui,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RatingArg {
    Like,
    Dislike,
    None,
}

impl RatingArg {
    fn rating(self) -> Option<Rating> {
        match self {
            RatingArg::Like => Some(Rating::Like),
            RatingArg::Dislike => Some(Rating::Dislike),
            RatingArg::None => None,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load_with_env(args.config.as_deref())?;

    let target = match args.cmd {
        Command::Tui => LogTarget::for_tui(&cfg.log),
        _ => LogTarget::Stderr,
    };
    init_logging(&target, cfg.log.json, args.verbose)?;

    match args.cmd {
        Command::Params => cmd_params(&cfg),
        Command::Prompts => cmd_prompts(),
        Command::Run {
            inputs,
            images,
            prompt,
            text,
        } => cmd_run(&cfg, &inputs, &images, prompt, text.as_deref()),
        Command::Batch {
            csv,
            export,
            retry_failed,
        } => cmd_batch(&cfg, &csv, export.as_deref(), retry_failed),
        Command::Feedback { message_id, rating } => cmd_feedback(&cfg, message_id, rating),
        Command::Tui => role_agent::ui::run_tui(cfg),
    }
}

fn load_app(cfg: &Config) -> Result<(PlatformClient, AppState)> {
    let client = PlatformClient::new(cfg)?;
    let state = bootstrap(cfg, &client)?;
    Ok((client, state))
}

fn cmd_params(cfg: &Config) -> Result<()> {
    let (_, state) = load_app(cfg)?;
    println!("title: {}", state.info.title);
    println!("mode: {}", if state.is_workflow { "workflow" } else { "completion" });
    println!("variables:");
    for v in &state.prompt_config.prompt_variables {
        let mut line = format!("  {:<16} {:<10} {}", v.key, v.var_type.as_str(), v.name);
        if !v.is_required() {
            line.push_str(" (optional)");
        }
        if v.is_string() {
            line.push_str(&format!(" max={}", v.max_len(cfg.default_value_max_len())));
        }
        if !v.options.is_empty() {
            line.push_str(&format!(" options=[{}]", v.options.join(", ")));
        }
        println!("{line}");
    }
    let vision = &state.vision;
    println!(
        "vision: enabled={} limit={} detail={:?} remote_url={} size_limit={}",
        vision.enabled,
        vision.number_limits,
        vision.detail,
        vision.accepts_remote_url(),
        vision.image_file_size_limit
    );
    Ok(())
}

fn cmd_prompts() -> Result<()> {
    for (i, p) in QUICK_PROMPTS.iter().enumerate() {
        println!("{:>2}. {:<28} {}", i + 1, p.label, p.text);
    }
    Ok(())
}

fn cmd_run(
    cfg: &Config,
    inputs: &[String],
    images: &[String],
    prompt: Option<usize>,
    text: Option<&str>,
) -> Result<()> {
    let (client, state) = load_app(cfg)?;
    let mut form = InputForm::new(state.prompt_config.prompt_variables.clone(), state.vision.clone());

    for kv in inputs {
        let (k, v) = kv
            .split_once('=')
            .ok_or_else(|| Error::msg(format!("--input expects KEY=VALUE, got '{kv}'")))?;
        form.set(k.trim(), v);
    }
    if let Some(t) = text {
        let first = state
            .prompt_config
            .first_key()
            .ok_or_else(|| Error::msg("the app declares no prompt variables"))?;
        form.set(first, t);
    }
    for url in images {
        form.add_image_url(url)?;
    }

    let req: CompletionRequest = match prompt {
        Some(n) => {
            let (bridge, inbox) = prompt_bridge();
            if n == 0 || !bridge.send_quick(n - 1) {
                return Err(Error::msg(format!(
                    "no quick prompt {n} (1-{})",
                    QUICK_PROMPTS.len()
                )));
            }
            match inbox.deliver(&mut form).into_iter().next() {
                Some(res) => res?,
                None => return Err(Error::msg("the app declares no prompt variables")),
            }
        }
        None => form.submit()?,
    };

    let sink = Arc::new(StdoutSink::default());
    let out = SingleRun::start(Arc::new(client), sink, req).join()?;
    if let Some(id) = out.message_id {
        eprintln!("message: {id}");
    }
    Ok(())
}

fn cmd_batch(
    cfg: &Config,
    csv: &Path,
    export: Option<&Path>,
    retry_rounds: usize,
) -> Result<()> {
    let (client, state) = load_app(cfg)?;
    let vars = &state.prompt_config.prompt_variables;
    let data = read_csv_file(csv)?;

    let sink = Arc::new(StdoutSink::default());
    let mut session = BatchSession::new(Arc::new(client), sink, cfg.group_size());
    let Some(n) = submit_with_notice(
        &mut session,
        &data,
        vars,
        cfg.default_value_max_len(),
        &StderrNotify,
    ) else {
        return Err(Error::msg("batch rejected"));
    };
    tracing::info!(tasks = n, file = %csv.display(), "batch started");
    session.run_to_completion();

    for round in 1..=retry_rounds {
        if !BatchSummary::of(session.scheduler()).can_retry() {
            break;
        }
        tracing::info!(round, "retry round");
        session.retry_failed();
        session.run_to_completion();
    }

    println!();
    for task in session.scheduler().tasks() {
        let status = match task.status {
            TaskStatus::Completed => "ok",
            TaskStatus::Failed => "failed",
            TaskStatus::Running => "running",
            TaskStatus::Pending => "pending",
        };
        println!("=== task {} [{status}]", task.id);
        match session.scheduler().completion(task.id) {
            Some(text) if !text.is_empty() => println!("{}", sanitize_text(text)),
            _ => {
                if let Some(e) = session.error(task.id) {
                    println!("error: {e}");
                }
            }
        }
    }

    let summary = BatchSummary::of(session.scheduler());
    if let Some(path) = export {
        if summary.can_export() {
            export_to_file(path, session.scheduler(), vars)?;
            println!("exported: {}", path.display());
        } else {
            eprintln!("nothing to export: no task completed");
        }
    }
    if let Some(label) = summary.failed_label() {
        return Err(Error::msg(label));
    }
    Ok(())
}

fn cmd_feedback(cfg: &Config, message_id: String, rating: RatingArg) -> Result<()> {
    let client = PlatformClient::new(cfg)?;
    let mut state = FeedbackState::for_message(Some(message_id));
    state.submit(&client, rating.rating())?;
    println!("feedback: {}", rating.rating().map(|r| r.as_str()).unwrap_or("cleared"));
    Ok(())
}
