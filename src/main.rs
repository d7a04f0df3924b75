use clap::{Args, Parser, Subcommand};
use eoka_watcher::WatchConfig;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "eoka-watch")]
#[command(about = "Interstitial watchers for browser automation, served over MCP")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output (-v for info, -vv for debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the MCP server on stdio
    Serve(ServeArgs),
    /// Validate a config file without running
    Check {
        /// Config file to validate
        config: PathBuf,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Config file with limits and preset watchers
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run the browser headless (default from EOKA_HEADLESS)
    #[arg(long)]
    headless: bool,

    /// Maximum watchers per session (1-20)
    #[arg(long)]
    max_watchers: Option<usize>,

    /// Maximum watcher duration in ms (1000-600000)
    #[arg(long)]
    max_duration_ms: Option<u64>,

    /// Element reference cache capacity (10-200)
    #[arg(long)]
    max_cache_entries: Option<usize>,

    /// Element reference time-to-live in ms (5000-300000)
    #[arg(long)]
    cache_ttl_ms: Option<u64>,
}

impl ServeArgs {
    fn load_config(&self) -> eoka_watcher::Result<WatchConfig> {
        let mut config = match &self.config {
            Some(path) => WatchConfig::load(path)?,
            None => WatchConfig::default(),
        };
        let limits = &mut config.limits;
        if let Some(v) = self.max_watchers {
            limits.max_watchers = v;
        }
        if let Some(v) = self.max_duration_ms {
            limits.max_duration_ms = v;
        }
        if let Some(v) = self.max_cache_entries {
            limits.max_cache_entries = v;
        }
        if let Some(v) = self.cache_ttl_ms {
            limits.cache_ttl_ms = v;
        }
        // Overrides can invalidate limits or presets that passed on load.
        config.validate()?;
        Ok(config)
    }

    fn headless(&self) -> bool {
        self.headless
            || std::env::var("EOKA_HEADLESS")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(false)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity. Stdout carries MCP, so logs go to stderr.
    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    match cli.command {
        Command::Check { config: path } => {
            let config = WatchConfig::load(&path)?;
            let presets = config.presets()?;
            let limits = config.limits;
            println!("Config valid: {}", path.display());
            println!("  Max watchers: {}", limits.max_watchers);
            println!("  Max duration: {}ms", limits.max_duration_ms);
            println!("  Cache entries: {}", limits.max_cache_entries);
            println!("  Cache TTL: {}ms", limits.cache_ttl_ms);
            println!("  Preset watchers: {}", presets.len());
            for spec in &presets {
                println!(
                    "    - {} (priority {}, {}ms): {} -> {}",
                    spec.name,
                    spec.priority,
                    spec.duration_ms,
                    spec.reference_locator,
                    spec.action_locator
                );
            }
        }
        Command::Serve(args) => {
            let config = args.load_config()?;
            eoka_watch::run_server(config, args.headless()).await?;
        }
    }

    Ok(())
}
