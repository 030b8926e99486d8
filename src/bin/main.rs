use anyhow::Context;
use autoflow::{
    BrowserSession, Config, HttpReporter, OpenAiClient, Planner, SharedSettings, TaskController,
    TaskStatus,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "autoflow")]
#[command(about = "LLM-driven browser task runner")]
#[command(version)]
struct Cli {
    /// Run file to execute
    config: PathBuf,

    /// Run in headless mode (overrides config)
    #[arg(long)]
    headless: bool,

    /// Read instructions from this file instead of the run file
    #[arg(long, value_name = "FILE")]
    instructions: Option<PathBuf>,

    /// Write the step history as JSON after the run
    #[arg(long, value_name = "FILE")]
    history: Option<PathBuf>,

    /// Verbose output (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Validate config without running
    #[arg(long)]
    check: bool,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    };

    // RUST_LOG wins over -v/-q when set.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if let Some(path) = &cli.instructions {
        config.instructions = std::fs::read_to_string(path)
            .with_context(|| format!("reading instructions from {}", path.display()))?;
    }

    if cli.check {
        println!("Config valid: {}", config.name);
        println!("  Target: {}", config.target.url);
        println!("  Model: {}", config.model.name);
        println!("  Instructions: {}", config.instruction_lines().len());
        println!("  Step limit: {}", config.limits.max_steps);
        if let Some(ref url) = config.report.reporter_url {
            println!("  Reporter: {}", url);
        }
        if let Some(ref url) = config.report.generator_url {
            println!("  Step generator: {}", url);
        }
        return Ok(());
    }

    if config.instruction_lines().is_empty() {
        anyhow::bail!("no instructions to run");
    }

    if cli.headless {
        config.browser.headless = true;
    }

    println!("Running: {}", config.name);

    let session = Arc::new(
        BrowserSession::launch(&config.browser)
            .await
            .context("launching browser")?,
    );
    session
        .goto(&config.target.url)
        .await
        .with_context(|| format!("opening {}", config.target.url))?;

    let planner = Planner::new(
        OpenAiClient::new(&config.model.api_base),
        SharedSettings::new(config.settings()),
    )
    .max_attempts(config.model.max_attempts)
    .max_tokens(config.model.max_tokens);

    let controller = TaskController::builder(planner)
        .transport(session.clone())
        .driver(session.clone())
        .target(session.clone())
        .reporter(Arc::new(HttpReporter::from_config(&config.report)))
        .timing(config.timing())
        .max_steps(config.limits.max_steps)
        .bridge_retry(config.bridge.max_tries, config.bridge.backoff())
        .build()?;

    let handle = controller.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            handle.interrupt();
        }
    });

    let notify = |msg: &str| eprintln!("  ! {}", msg);
    let status = controller.run_task(&config.instructions, &notify).await;
    let history = controller.history();

    println!();
    match status {
        TaskStatus::Success => println!("✓ Success"),
        TaskStatus::Interrupted => println!("■ Interrupted"),
        _ => {
            println!("✗ Failed");
            if let Some(error) = controller.last_error() {
                println!("  Error: {}", error);
            }
        }
    }
    println!("  Steps: {}", history.len());
    let tokens: u32 = history.iter().map(|h| h.usage.total_tokens).sum();
    println!("  Tokens: {}", tokens);
    if let Some(report) = controller.report() {
        println!("  Report: {}", report.file_url);
    }

    if let Some(path) = &cli.history {
        let json = serde_json::to_string_pretty(&history)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    }

    session.close().await?;

    if status != TaskStatus::Success {
        std::process::exit(1);
    }

    Ok(())
}
