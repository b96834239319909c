use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use theme_classifier::ModelTransport;
use theme_engine::Analyzer;
use theme_protocol::{AnalysisConfig, DiffFile};

use crate::transport::{NullTransport, ProcessTransport};

mod report;
mod transport;

#[derive(Parser)]
#[command(name = "theme-finder")]
#[command(about = "Hierarchical theme decomposition for code diffs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors (stdout is reserved for output)
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a pre-parsed diff into a theme tree
    Analyze(AnalyzeArgs),
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Diff JSON file; "-" reads stdin
    #[arg(long, default_value = "-")]
    input: String,

    /// TOML configuration file (defaults apply where omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shell command each prompt is piped to; omit to run heuristics only
    #[arg(long)]
    model_cmd: Option<String>,

    /// Override the maximum decomposition depth
    #[arg(long)]
    max_depth: Option<usize>,

    /// Skip both consolidation passes
    #[arg(long)]
    no_dedup: bool,

    /// Fail classifications instead of using the heuristic fallback
    #[arg(long)]
    no_fallback: bool,

    /// Emit the forest as JSON instead of the text report
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);
    match cli.command {
        Commands::Analyze(args) => analyze(args).await,
    }
}

fn init_logging(cli: &Cli) {
    let default = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .target(env_logger::Target::Stderr)
        .init();
}

async fn analyze(args: AnalyzeArgs) -> Result<()> {
    let mut cfg = load_config(args.config.as_deref())?;
    if let Some(depth) = args.max_depth {
        cfg.breaker.max_depth = depth;
    }
    if args.no_dedup {
        cfg.consolidation.skip_sibling_pass = true;
        cfg.consolidation.skip_cross_level_pass = true;
    }
    if args.no_fallback {
        cfg.fallback_enabled = false;
    }

    let diff = read_diff(&args.input)?;
    let transport: Arc<dyn ModelTransport> = match &args.model_cmd {
        Some(cmd) => Arc::new(ProcessTransport::new(cmd.clone())),
        None => {
            log::warn!("no --model-cmd given; classification runs on heuristics only");
            Arc::new(NullTransport)
        }
    };

    let analyzer = Analyzer::new(cfg, transport);
    let forest = analyzer.run(&diff).await?;

    let gateway = analyzer.gateway_snapshot();
    let cache = analyzer.cache_snapshot();
    let breaker = analyzer.breaker_snapshot();
    log::debug!(
        "gateway: processed={} failed={} avg_wait={:.1}ms; cache: hit rate {:.2}; \
         breaker: {} nodes tracked, {} atomic",
        gateway.processed,
        gateway.failed,
        gateway.avg_wait_ms,
        cache.hit_rate(),
        breaker.tracked_nodes,
        breaker.atomic_nodes
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&forest)?);
    } else {
        print!("{}", report::render_report(&forest));
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<AnalysisConfig> {
    match path {
        Some(p) => {
            let text = fs::read_to_string(p)
                .with_context(|| format!("reading config {}", p.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing config {}", p.display()))
        }
        None => Ok(AnalysisConfig::standard()),
    }
}

fn read_diff(input: &str) -> Result<Vec<DiffFile>> {
    let text = if input == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("reading diff from stdin")?;
        buf
    } else {
        fs::read_to_string(input).with_context(|| format!("reading diff {input}"))?
    };
    serde_json::from_str(&text).context("parsing diff JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn config_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "fallback_enabled = false\n[breaker]\nmax_depth = 4\n[gateway]\nconcurrency = 2"
        )
        .unwrap();

        let cfg = load_config(Some(file.path())).unwrap();
        assert!(!cfg.fallback_enabled);
        assert_eq!(cfg.breaker.max_depth, 4);
        assert_eq!(cfg.gateway.concurrency, 2);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.cache.expansion_ttl_secs, 3600);
    }

    #[test]
    fn diff_json_parses_into_typed_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"path":"src/a.rs","hunks":[{{"start_line":3,"lines":[{{"kind":"added","content":"x"}}]}}]}}]"#
        )
        .unwrap();

        let diff = read_diff(file.path().to_str().unwrap()).unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].path, "src/a.rs");
        assert_eq!(diff[0].changed_line_count(), 1);
    }
}
