use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mastercontrol::agent::{AgentFactories, load_agents};
use mastercontrol::config::Config;
use mastercontrol::dispatcher::Dispatcher;
use mastercontrol::logging::{self, LogConfig};
use mastercontrol::timing::{self, TimePattern};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ── CLI ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "mastercontrol",
    version,
    about = "Event bus for agents: subscriptions, commands and schedules"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the dispatcher with the configured agents until interrupted
    Run(RunArgs),
    /// Resolve a time pattern against the current time
    When(WhenArgs),
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Config file (default ~/.mastercontrol/config.toml)
    #[arg(long, short, value_name = "PATH", env = "MASTERCONTROL_CONFIG")]
    config: Option<PathBuf>,
    /// Worker threads, overriding the config file
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
    /// Verbose logging
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Debug, clap::Args)]
struct WhenArgs {
    /// Seconds from now
    #[arg(long)]
    seconds: Option<i64>,
    /// Minutes from now
    #[arg(long)]
    minutes: Option<i64>,
    /// Hours from now
    #[arg(long)]
    hours: Option<i64>,
    /// Days from now
    #[arg(long)]
    days: Option<i64>,
    /// Months (of 30 days) from now
    #[arg(long)]
    months: Option<i64>,
    /// Years (of 365 days) from now
    #[arg(long)]
    years: Option<i64>,

    /// A specific time, 'HH:MM'
    #[arg(long)]
    time: Option<String>,
    /// A specific date, 'YYYY-MM-DD'
    #[arg(long)]
    date: Option<String>,
    /// A specific date and time, 'YYYY-MM-DD HH:MM'
    #[arg(long)]
    datetime: Option<String>,

    /// Seconds to match
    #[arg(long, num_args = 1..)]
    secondlist: Option<Vec<u32>>,
    /// Minutes to match
    #[arg(long, num_args = 1..)]
    minutelist: Option<Vec<u32>>,
    /// Hours to match
    #[arg(long, num_args = 1..)]
    hourlist: Option<Vec<u32>>,
    /// Days of the month to match
    #[arg(long, num_args = 1..)]
    daylist: Option<Vec<u32>>,
    /// Days of the week to match, Monday = 0
    #[arg(long, num_args = 1..)]
    dowlist: Option<Vec<u32>>,
    /// Day names to match
    #[arg(long, num_args = 1..)]
    daynames: Option<Vec<String>>,
    /// Months to match
    #[arg(long, num_args = 1..)]
    monthlist: Option<Vec<u32>>,
    /// Month names to match
    #[arg(long, num_args = 1..)]
    monthnames: Option<Vec<String>>,

    /// Random adjustment window in seconds
    #[arg(long)]
    randseconds: Option<i64>,
    /// Random adjustment window in minutes
    #[arg(long)]
    randminutes: Option<i64>,
    /// Random adjustment window in hours
    #[arg(long)]
    randhours: Option<i64>,
    /// Random adjustment window in days
    #[arg(long)]
    randdays: Option<i64>,

    /// Treat the pattern as recurring
    #[arg(long)]
    recurring: bool,
}

impl From<WhenArgs> for TimePattern {
    fn from(args: WhenArgs) -> Self {
        TimePattern {
            seconds: args.seconds,
            minutes: args.minutes,
            hours: args.hours,
            days: args.days,
            months: args.months,
            years: args.years,
            datetime: args.datetime,
            date: args.date,
            time: args.time,
            secondlist: args.secondlist,
            minutelist: args.minutelist,
            hourlist: args.hourlist,
            daylist: args.daylist,
            dowlist: args.dowlist,
            daynames: args.daynames,
            monthlist: args.monthlist,
            monthnames: args.monthnames,
            randseconds: args.randseconds,
            randminutes: args.randminutes,
            randhours: args.randhours,
            randdays: args.randdays,
            recurring: args.recurring,
            ..TimePattern::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::When(args) => {
            when(args.into());
            Ok(())
        }
    }
}

// ── run ─────────────────────────────────────────────────────────────────────

async fn run(args: RunArgs) -> Result<()> {
    if args.verbose {
        logging::init(LogConfig::debug());
    } else {
        logging::init_from_env();
    }

    let config = Config::load(args.config).context("loading configuration")?;
    let workers = args.workers.unwrap_or(config.workers);

    let dispatcher = Arc::new(Dispatcher::with_formats(config.time.clone())?);
    let loaded = load_agents(&config, &AgentFactories::builtin(), &dispatcher);
    info!(agents = ?loaded, "Agents loaded");

    for schedule in &config.schedules {
        if let Err(e) = dispatcher.scheduler().add(
            schedule.id.as_str(),
            schedule.when.clone(),
            schedule.event.clone(),
        ) {
            warn!(id = %schedule.id, error = %e, "Skipping schedule");
        }
    }

    dispatcher.start(workers)?;

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_for_signal.cancel();
    });

    #[cfg(unix)]
    {
        let cancel_for_term = cancel.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            if let Ok(mut sig) = signal(SignalKind::terminate()) {
                sig.recv().await;
                cancel_for_term.cancel();
            }
        });
    }

    cancel.cancelled().await;
    info!("Signal received");

    // Draining blocks until every queued event has been handled.
    let for_shutdown = Arc::clone(&dispatcher);
    tokio::task::spawn_blocking(move || for_shutdown.shutdown()).await?;
    Ok(())
}

// ── when ────────────────────────────────────────────────────────────────────

fn when(pattern: TimePattern) {
    let now = timing::local_now();
    let resolved = timing::resolve_offset(&pattern, now)
        .and_then(|seconds| Some((seconds, timing::target_after(now, seconds)?)));
    match resolved {
        Some((seconds, target)) => {
            println!("Seconds from now: {seconds}");
            println!("Target: {}", target.format("%a, %d %b %Y %H:%M:%S"));
            println!("In: {}", timing::humanize_elapsed(seconds));
        }
        None => println!("Pattern never occurs"),
    }
}
