//! Tidepool main entry point
//!
//! This is the command-line interface for the Tidepool crawling-session engine.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tidepool::config::{load_config_with_hash, Config, RuleAction, RuleEntry, SeedEntry};
use tidepool::output::print_report;
use tidepool::rules::{Handler, Pattern, Rule, RuleContext};
use tidepool::{ConfigError, Crawler, TaskSpec};
use tracing_subscriber::EnvFilter;

/// Tidepool: a crawling-session engine
///
/// Tidepool seeds a session from a TOML file, fetches pages with bounded
/// concurrency and retries, and applies the configured rules to every result.
#[derive(Parser, Debug)]
#[command(name = "tidepool")]
#[command(version)]
#[command(about = "A crawling-session engine", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show what would be crawled without actually crawling
    #[arg(long)]
    dry_run: bool,

    /// Print the final report as JSON
    #[arg(long, conflicts_with = "dry_run")]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let config = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            cfg
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if cli.dry_run {
        handle_dry_run(&config);
        return Ok(());
    }

    handle_crawl(config, cli.json).await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("tidepool=info,warn"),
            1 => EnvFilter::new("tidepool=debug,info"),
            2 => EnvFilter::new("tidepool=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows what would be crawled
fn handle_dry_run(config: &Config) {
    let session = &config.session;
    println!("=== Tidepool Dry Run ===\n");

    println!("Session:");
    println!("  Id: {}", session.id.as_deref().unwrap_or("-"));
    println!("  Concurrency: {}", session.concurrency);
    println!("  Interval: {:?} ms", session.interval.bounds());
    println!("  Retry limit: {}", session.retry_limit);
    println!("  Tasks per cycle: {}", session.tasks_size);
    println!("  Dedup: {}", session.dedup);
    println!("  Drain grace: {}ms", session.drain_await);
    println!("  Download dir: {}", session.download_dir.display());
    println!("  Request timeout: {}ms", session.request.timeout().as_millis());

    println!("\nSeeds ({}):", config.seeds.len());
    for seed in &config.seeds {
        let kind = if seed.download { "download" } else { "page" };
        println!("  - {} ({})", seed.url, kind);
    }

    println!("\nRules ({}):", config.rules.len());
    for rule in &config.rules {
        println!(
            "  - {} {:?} -> {:?}",
            rule.name.as_deref().unwrap_or("<unnamed>"),
            rule.pattern.as_deref().unwrap_or(""),
            rule.action
        );
    }

    println!("\n✓ Configuration is valid");
    println!("✓ Would start crawling with {} seed URLs", config.seeds.len());
}

/// Handles the main crawl operation
async fn handle_crawl(config: Config, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let crawler = Crawler::new(config.session.clone())?;

    for entry in &config.rules {
        crawler.register(build_rule(entry)?);
    }
    crawler.add_tasks(config.seeds.iter().map(seed_spec));

    tracing::info!(
        "Seeds: {}, Rules: {}",
        config.seeds.len(),
        config.rules.len()
    );

    // Ctrl-C lets started fetches finish and drops the rest
    let stopper = crawler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after in-flight tasks");
            if let Err(e) = stopper.stop() {
                tracing::debug!("Stop ignored: {}", e);
            }
        }
    });

    match crawler.start().await {
        Ok(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(())
        }
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            Err(e.into())
        }
    }
}

fn seed_spec(seed: &SeedEntry) -> TaskSpec {
    let mut spec = if seed.download {
        TaskSpec::download(seed.url.as_str())
    } else {
        TaskSpec::page(seed.url.as_str())
    };
    if let Some(target) = &seed.target {
        spec = spec.target(target.as_str());
    }
    spec.properties = seed.properties.clone();
    spec
}

fn handler<F>(f: F) -> Handler
where
    F: Fn(&RuleContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Turns a config rule into a rule with one of the built-in actions
fn build_rule(entry: &RuleEntry) -> Result<Rule, ConfigError> {
    let follow = entry.follow.as_deref().map(Pattern::compile).transpose()?;

    let action = match entry.action {
        RuleAction::FollowLinks => handler(move |ctx| {
            if let Some(doc) = ctx.document {
                let links = doc
                    .links()
                    .into_iter()
                    .filter(|link| follow.as_ref().map_or(true, |p| p.is_match(link)));
                ctx.expand(links);
            }
            Ok(())
        }),
        RuleAction::LogTitle => handler(|ctx| {
            if let Some(doc) = ctx.document {
                tracing::info!(
                    "{}: {}",
                    ctx.task().url(),
                    doc.title().unwrap_or_else(|| "(untitled)".to_string())
                );
            }
            Ok(())
        }),
        RuleAction::DownloadImages => handler(|ctx| {
            if let Some(doc) = ctx.document {
                ctx.expand(doc.images().into_iter().map(TaskSpec::download));
            }
            Ok(())
        }),
    };

    let mut rule = Rule::from_parts(entry.pattern.as_deref(), action)?.filters(entry.filter.clone());
    if let Some(name) = &entry.name {
        rule = rule.named(name.clone());
    }
    Ok(rule)
}
