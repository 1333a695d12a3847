//! Port Discovery Core - listening-port discovery CLI
//!
//! The main entry point for pd-core, handling:
//! - One-shot discovery of candidate listening ports
//! - Config resolution and inspection
//! - Version reporting

use clap::{Args, Parser, Subcommand};
use pd_common::error::StructuredError;
use pd_common::{
    ConfigPaths, ConfigResolver, ConfigSource, DiscoveryConfig, Error, OutputFormat, OwnerSource,
    UnattributedPolicy,
};
use pd_core::exit_codes::ExitCode;
use pd_core::logging::{event_names, init_logging, LogConfig, LogFormat, LogLevel, Stage};
use pd_core::{output, Discovery};
use std::io::Write;
use std::path::PathBuf;

/// Port Discovery Core - find listening TCP ports and the processes behind them
#[derive(Parser)]
#[command(name = "pd-core")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Path to discovery.json (overrides PD_CONFIG and XDG lookup)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format on stderr (human, jsonl)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover candidate listening ports
    Ports(PortsArgs),

    /// Show the resolved configuration and where it came from
    Config(ConfigArgs),

    /// Print version information
    Version,
}

#[derive(Args, Debug)]
struct PortsArgs {
    /// Output format
    #[arg(long, short = 'f', value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Report listening sockets with no resolvable owner as "unknown"
    #[arg(long)]
    include_unattributed: bool,

    /// Root of the process filesystem
    #[arg(long)]
    proc_root: Option<PathBuf>,

    /// Socket owner source (listing, fd-walk)
    #[arg(long)]
    owner_source: Option<OwnerSource>,

    /// Wall-clock cap on the socket listing, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Never report this port (repeatable)
    #[arg(long = "exclude-port", value_name = "PORT")]
    exclude_ports: Vec<u16>,

    /// Run the listing without `nice`
    #[arg(long)]
    no_nice: bool,

    /// Gather datasets one after another instead of in parallel
    #[arg(long)]
    sequential: bool,

    /// Include discovery statistics in the output
    #[arg(long)]
    stats: bool,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Output format
    #[arg(long, short = 'f', value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
}

// ============================================================================
// Main entry point
// ============================================================================

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() {
                ExitCode::ArgsError
            } else {
                ExitCode::Clean
            };
            let _ = e.print();
            std::process::exit(code.as_i32());
        }
    };

    let cli_level = if cli.global.quiet {
        Some(LogLevel::Error)
    } else {
        match cli.global.verbose {
            0 => cli.global.log_level,
            1 => Some(LogLevel::Debug),
            _ => Some(LogLevel::Trace),
        }
    };
    init_logging(&LogConfig::from_env(cli_level, cli.global.log_format));

    let exit_code = match &cli.command {
        Commands::Ports(args) => run_ports(&cli.global, args),
        Commands::Config(args) => run_config(&cli.global, args),
        Commands::Version => run_version(),
    };

    std::process::exit(exit_code.as_i32());
}

// ============================================================================
// Command implementations
// ============================================================================

fn run_ports(global: &GlobalOpts, args: &PortsArgs) -> ExitCode {
    let (mut config, _source) = match load_config(global) {
        Ok(loaded) => loaded,
        Err(e) => return report_error(&e),
    };
    apply_overrides(&mut config, args);

    let discovery = match Discovery::new(config) {
        Ok(d) => d,
        Err(e) => return report_error(&e),
    };
    let report = discovery.discover();

    let rendered = match output::render(&report, args.format, args.stats) {
        Ok(s) => s,
        Err(e) => return report_error(&Error::Json(e)),
    };
    write_stdout(&rendered)
}

fn run_config(global: &GlobalOpts, args: &ConfigArgs) -> ExitCode {
    let (config, source) = match load_config(global) {
        Ok(loaded) => loaded,
        Err(e) => return report_error(&e),
    };

    let rendered = match args.format {
        OutputFormat::Json | OutputFormat::Jsonl => {
            let response = serde_json::json!({
                "source": &source,
                "config": &config,
            });
            let body = if args.format == OutputFormat::Json {
                serde_json::to_string_pretty(&response)
            } else {
                serde_json::to_string(&response)
            };
            match body {
                Ok(s) => format!("{}\n", s),
                Err(e) => return report_error(&Error::Json(e)),
            }
        }
        OutputFormat::Summary => format!(
            "config: {} ({})\n",
            source_label(&source),
            source.resolution
        ),
        OutputFormat::Md => {
            let mut out = String::from("# pd-core config\n\n");
            out.push_str(&format!("Source: {}\n", source_label(&source)));
            out.push_str(&format!("Resolution: {}\n", source.resolution));
            if let Some(hash) = &source.hash {
                out.push_str(&format!("Hash: {}\n", hash));
            }
            out.push('\n');
            out.push_str(&format!("- proc_root: {}\n", config.proc_root.display()));
            out.push_str(&format!("- owner_source: {}\n", config.owner_source));
            out.push_str(&format!("- listing_timeout_ms: {}\n", config.listing_timeout_ms));
            out.push_str(&format!("- max_listing_bytes: {}\n", config.max_listing_bytes));
            out.push_str(&format!("- use_nice: {}\n", config.use_nice));
            out.push_str(&format!("- unattributed: {:?}\n", config.unattributed));
            out.push_str(&format!("- exclude_ports: {:?}\n", config.exclude_ports));
            out.push_str(&format!("- concurrent: {}\n", config.concurrent));
            out
        }
    };
    write_stdout(&rendered)
}

fn run_version() -> ExitCode {
    write_stdout(&format!("pd-core {}\n", env!("CARGO_PKG_VERSION")))
}

// ============================================================================
// Helpers
// ============================================================================

fn load_config(global: &GlobalOpts) -> pd_common::Result<(DiscoveryConfig, ConfigSource)> {
    let resolver = ConfigResolver::new(ConfigPaths {
        config_path: global.config.clone(),
    });
    let (config, source) = resolver.load()?;
    match &source.path {
        Some(path) => tracing::debug!(
            event = event_names::CONFIG_LOADED,
            stage = %Stage::Init,
            path = %path,
            resolution = %source.resolution,
            "config loaded"
        ),
        None => tracing::debug!(
            event = event_names::CONFIG_DEFAULT_USED,
            stage = %Stage::Init,
            "no config file; using defaults"
        ),
    }
    Ok((config, source))
}

fn apply_overrides(config: &mut DiscoveryConfig, args: &PortsArgs) {
    if args.include_unattributed {
        config.unattributed = UnattributedPolicy::Surface;
    }
    if let Some(root) = &args.proc_root {
        config.proc_root = root.clone();
    }
    if let Some(source) = args.owner_source {
        config.owner_source = source;
    }
    if let Some(ms) = args.timeout_ms {
        config.listing_timeout_ms = ms;
    }
    if args.no_nice {
        config.use_nice = false;
    }
    if args.sequential {
        config.concurrent = false;
    }
    config.exclude_ports.extend(args.exclude_ports.iter().copied());
}

fn source_label(source: &ConfigSource) -> String {
    source
        .path
        .clone()
        .unwrap_or_else(|| "built-in defaults".to_string())
}

fn report_error(err: &Error) -> ExitCode {
    tracing::error!(
        event = event_names::COMMAND_FAILED,
        code = err.code(),
        error = %err,
        "command failed"
    );
    eprintln!("{}", err.format_human());
    tracing::debug!(structured = %StructuredError::from(err).to_json(), "error detail");
    ExitCode::from(err)
}

fn write_stdout(payload: &str) -> ExitCode {
    let mut stdout = std::io::stdout().lock();
    match stdout.write_all(payload.as_bytes()).and_then(|_| stdout.flush()) {
        Ok(()) => ExitCode::Clean,
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => ExitCode::Clean,
        Err(e) => {
            eprintln!("pd-core: failed to write output: {}", e);
            ExitCode::IoError
        }
    }
}
