use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use rlm_config::{ConfigLoader, RlmConfig};
use rlm_core::{Result, RlmError};

mod gateway;
mod plan;
mod run;

/// Recursive Language Model execution scaffold
#[derive(Parser)]
#[command(name = "rlm", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to rlm.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a query over a context file
    Run(RunArgs),
    /// Print the chunk plan for a context file
    Plan {
        /// Context file ("-" reads stdin)
        context: PathBuf,
        /// Characters per chunk
        #[arg(short = 's', long, default_value = "10000")]
        chunk_size: usize,
        /// Characters shared by consecutive chunks
        #[arg(short, long, default_value = "0")]
        overlap: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and report issues
    Doctor,
    /// Show version and build info
    Version,
}

#[derive(Args)]
struct RunArgs {
    /// Context file ("-" reads stdin)
    context: PathBuf,
    /// The question to answer about the context
    #[arg(short = 'Q', long)]
    query: String,
    /// Recursion limit for this run
    #[arg(short = 'd', long)]
    max_depth: Option<u32>,
    /// Controller model (provider/model)
    #[arg(short, long)]
    model: Option<String>,
    /// Sub-call model (provider/model)
    #[arg(long)]
    sub_model: Option<String>,
    /// File holding the Controller system prompt
    #[arg(long)]
    system_prompt_file: Option<PathBuf>,
    /// Write the full session output (answer + trace) as JSON to this file
    #[arg(long)]
    trace_out: Option<PathBuf>,
    /// Print the full session output as JSON instead of a summary
    #[arg(long)]
    json: bool,
}

impl Cli {
    pub async fn run(self) -> Result<ExitCode> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(&config.logging.level)
        };
        init_tracing(&config.logging.format, log_level);

        match self.command {
            Commands::Run(args) => run::cmd_run(&config_loader, args).await,
            Commands::Plan {
                context,
                chunk_size,
                overlap,
                json,
            } => plan::cmd_plan(&context, chunk_size, overlap, json).map(|_| ExitCode::SUCCESS),
            Commands::Config { json } => Self::cmd_config(&config, json).map(|_| ExitCode::SUCCESS),
            Commands::Doctor => Ok(Self::cmd_doctor(&config)),
            Commands::Version => {
                Self::cmd_version();
                Ok(ExitCode::SUCCESS)
            }
        }
    }

    fn cmd_config(config: &RlmConfig, json: bool) -> Result<()> {
        let mut shown = config.clone();
        redact(&mut shown.services.anthropic_api_key);
        redact(&mut shown.services.openai_api_key);
        if json {
            println!("{}", serde_json::to_string_pretty(&shown)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(&shown).map_err(|e| RlmError::Config(e.to_string()))?
            );
        }
        Ok(())
    }

    fn cmd_doctor(config: &RlmConfig) -> ExitCode {
        println!("{}", console::style("RLM configuration check").bold());
        println!();

        let warnings = match config.validate() {
            Ok(w) => w,
            Err(e) => {
                println!("{}", console::style(e).red());
                return ExitCode::FAILURE;
            }
        };
        for w in &warnings {
            println!("  {w}");
        }

        let mut hints = 0;
        let services = &config.services;
        if services.anthropic_api_key.is_none()
            && services.openai_api_key.is_none()
            && services.local_model.is_none()
            && !config.backend.model.starts_with("local/")
        {
            println!("  hint: no backend credentials configured; set [services] keys or ANTHROPIC_API_KEY / OPENAI_API_KEY");
            hints += 1;
        }
        if config.engine.max_depth > 2 {
            println!(
                "  hint: engine.max_depth = {} multiplies backend calls per level",
                config.engine.max_depth
            );
            hints += 1;
        }

        println!();
        println!("  {} warnings, {} hints", warnings.len(), hints);
        ExitCode::SUCCESS
    }

    fn cmd_version() {
        println!("rlm v{}", env!("CARGO_PKG_VERSION"));
        println!("   Target: {}", std::env::consts::ARCH);
        println!("   OS: {}", std::env::consts::OS);
        #[cfg(debug_assertions)]
        println!("   Profile: debug");
        #[cfg(not(debug_assertions))]
        println!("   Profile: release");
    }
}

/// Logs go to stderr so stdout carries only command output.
fn init_tracing(format: &str, level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        "json" => builder.json().with_target(true).init(),
        "compact" => builder.compact().with_target(false).init(),
        _ => builder.with_target(false).init(),
    }
}

fn redact(secret: &mut Option<String>) {
    if secret.is_some() {
        *secret = Some("<redacted>".into());
    }
}

/// Read a context file, or stdin for "-".
fn read_input(path: &std::path::Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut text = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut text)?;
        return Ok(text);
    }
    std::fs::read_to_string(path)
        .map_err(|e| RlmError::Config(format!("cannot read {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "rlm", "run", "book.txt", "-Q", "Who is the narrator?", "--max-depth", "2", "--json",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.context, PathBuf::from("book.txt"));
        assert_eq!(args.query, "Who is the narrator?");
        assert_eq!(args.max_depth, Some(2));
        assert!(args.json);
        assert!(args.model.is_none());
    }

    #[test]
    fn test_run_requires_query() {
        assert!(Cli::try_parse_from(["rlm", "run", "book.txt"]).is_err());
    }

    #[test]
    fn test_parse_plan_defaults() {
        let cli = Cli::try_parse_from(["rlm", "plan", "-", "--overlap", "20"]).unwrap();
        let Commands::Plan {
            chunk_size,
            overlap,
            json,
            ..
        } = cli.command
        else {
            panic!("expected plan");
        };
        assert_eq!(chunk_size, 10_000);
        assert_eq!(overlap, 20);
        assert!(!json);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["rlm", "-v", "-q", "version"]).is_err());
    }

    #[test]
    fn test_read_input_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.txt");
        std::fs::write(&path, "hello context").unwrap();
        assert_eq!(read_input(&path).unwrap(), "hello context");
        assert!(matches!(
            read_input(&dir.path().join("missing.txt")),
            Err(RlmError::Config(_))
        ));
    }

    #[test]
    fn test_redact() {
        let mut key = Some("sk-secret".to_string());
        redact(&mut key);
        assert_eq!(key.as_deref(), Some("<redacted>"));
        let mut none: Option<String> = None;
        redact(&mut none);
        assert!(none.is_none());
    }
}
