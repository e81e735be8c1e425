//! Resilience CLI
//!
//! Inspect classification, print the effective configuration and run a local
//! retry simulation against the scheduler.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use rand::Rng;
use tracing::{info, warn};

use resilience::models::{ErrorContext, OperationError, PolicyOverride};
use resilience::retry::SubmitOptions;
use resilience::{Config, Resilience};

/// Resilience - retry scheduling, exception tracking and alerting
#[derive(Parser)]
#[command(name = "resilience")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "RESILIENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify an error message
    Classify {
        /// Error message
        message: String,

        /// Error code, numeric status or symbolic (e.g. ECONNRESET)
        #[arg(long)]
        code: Option<String>,

        /// Category hint used when the message matches nothing
        #[arg(long)]
        category: Option<String>,
    },

    /// Run a batch of randomly failing tasks through the scheduler
    Simulate {
        /// Number of tasks to submit
        #[arg(long, default_value = "20")]
        tasks: usize,

        /// Probability that an attempt fails
        #[arg(long, default_value = "0.3")]
        failure_rate: f64,

        /// Initial backoff delay in milliseconds
        #[arg(long, default_value = "50")]
        delay_ms: u64,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config, cli.verbose);

    let result = match cli.command {
        Commands::Classify {
            message,
            code,
            category,
        } => run_classify(&config, message, code, category, cli.format),
        Commands::Simulate {
            tasks,
            failure_rate,
            delay_ms,
        } => run_simulate(config, tasks, failure_rate, delay_ms, cli.format).await,
        Commands::Config => run_config(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn run_classify(
    config: &Config,
    message: String,
    code: Option<String>,
    category: Option<String>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let hub = Resilience::new(config.clone());

    let mut error = OperationError::new(message);
    if let Some(code) = code {
        error = match code.parse::<u16>() {
            Ok(status) => error.with_code(status),
            Err(_) => error.with_code(code),
        };
    }
    let mut context = ErrorContext::new();
    if let Some(category) = category {
        context = context.with_category(category);
    }

    let verdict = hub
        .classifier()
        .classify(&error, &context, &config.retry.default_policy);

    if format == OutputFormat::Json {
        let json = serde_json::json!({
            "category": verdict.error_type,
            "retryable": verdict.retryable,
            "severity": verdict.severity,
            "fallback": verdict.fallback,
            "strategy": verdict.strategy,
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        println!("Category:   {}", verdict.error_type);
        println!("Retryable:  {}", verdict.retryable);
        println!("Severity:   {}", verdict.severity);
        println!("Attempts:   {}", verdict.strategy.max_attempts);
        println!("Delay:      {}ms", verdict.strategy.initial_delay_ms);
        if verdict.fallback {
            println!("(no pattern matched, using the conservative default)");
        }
    }
    Ok(())
}

async fn run_simulate(
    config: Config,
    tasks: usize,
    failure_rate: f64,
    delay_ms: u64,
    format: OutputFormat,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&failure_rate),
        "failure rate must be within [0, 1]"
    );

    let mut hub = Resilience::new(config);
    hub.load().await;
    info!(tasks, failure_rate, "Starting simulation");

    let messages = [
        "Network timeout",
        "503 Service Unavailable",
        "ECONNRESET",
        "rate limit exceeded",
    ];
    let mut handles = Vec::with_capacity(tasks);

    for i in 0..tasks {
        let options = SubmitOptions::new()
            .context(
                ErrorContext::new()
                    .with_component("simulator")
                    .with_operation(format!("task-{i}")),
            )
            .policy(PolicyOverride::default().initial_delay_ms(delay_ms));

        let submitted = hub.scheduler().submit(
            move |ctx| async move {
                let fail = rand::thread_rng().gen_bool(failure_rate);
                if fail {
                    let pick = rand::thread_rng().gen_range(0..messages.len());
                    Err(OperationError::new(messages[pick]))
                } else {
                    Ok(ctx.attempt)
                }
            },
            options,
        );

        match submitted {
            Ok(handle) => handles.push(handle),
            Err(e) => warn!(task = i, error = %e, "Submission rejected"),
        }
    }

    let results = futures::future::join_all(handles).await;
    let succeeded = results.iter().filter(|r| r.is_ok()).count();

    let stats = hub.scheduler().statistics(None);
    let exceptions = hub.exceptions().statistics(None);
    let alerts = hub.alerts().statistics();
    hub.shutdown().await;

    if format == OutputFormat::Json {
        let json = serde_json::json!({
            "retries": stats,
            "exceptions": exceptions,
            "alerts": alerts,
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        println!("Submitted:     {}", results.len());
        println!("Succeeded:     {succeeded}");
        println!("Failed:        {}", results.len() - succeeded);
        println!("Avg attempts:  {:.2}", stats.overview.average_attempts);
        println!("Success rate:  {:.2}%", stats.overview.success_rate);
        println!("Exceptions:    {}", exceptions.total);
        println!("Alerts:        {}", alerts.total);
        if stats.cooldown.active {
            println!("Cooldown active until {:?}", stats.cooldown.until);
        }
    }
    Ok(())
}

fn run_config(config: &Config) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
