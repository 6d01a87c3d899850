//! sift - reproducible uncertainty-driven sample curation
//!
//! ## Commands
//!
//! - `run`: run one configuration, or a sweep with `--multirun`
//! - `fingerprint`: print the dataset fingerprint of a configuration
//! - `cache`: list or invalidate cache entries
//! - `list-models`: show registered model types
//! - `summarize`: aggregate result rows across runs

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use sift_core::config::{self, Override};
use sift_core::reporting;
use sift_core::{fingerprint, CacheStore, EntryStatus, RunParameters};
use sift_pipeline::{
    ModelRegistry, PipelineOrchestrator, SweepConfig, SweepMember, SweepReport, SweepRunner,
    SweepSpec,
};
use sift_tracking::{ExperimentTracker, JsonlTracker, NoopTracker};

#[derive(Parser)]
#[command(name = "sift")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Reproducible uncertainty-driven sample curation", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Which configuration to load and how to override it.
#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    /// Directory holding named configurations
    #[arg(long, env = "SIFT_CONFIG_DIR", default_value = "configs")]
    config_dir: PathBuf,

    /// Configuration name (`<config-dir>/<name>.toml`)
    #[arg(short, long, default_value = "baseline")]
    config: String,

    /// Field override `dotted.path=value`; comma-separated values declare a sweep axis
    #[arg(short = 'o', long = "override", value_name = "PATH=VALUE")]
    overrides: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the curation pipeline
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Expand multi-valued overrides into a sweep
        #[arg(short, long)]
        multirun: bool,

        /// Maximum sweep members in flight
        #[arg(short, long, default_value_t = 4)]
        jobs: usize,
    },

    /// Print the dataset fingerprint and cache directory of a configuration
    Fingerprint {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Inspect or maintain the dataset cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// List registered model types
    ListModels,

    /// Aggregate result rows under an output directory
    Summarize {
        /// Output directory containing `results/*.csv`
        #[arg(default_value = "outputs")]
        dir: PathBuf,

        /// Write the markdown summary to this file as well
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cache entries with their validity
    List {
        /// Cache root (default: `cache.root` of the configuration)
        #[arg(long)]
        root: Option<PathBuf>,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Remove one cache entry by directory name
    Invalidate {
        /// Entry directory name, e.g. `tuab_dropout_0.3_seed_12`
        name: String,

        /// Cache root (default: `cache.root` of the configuration)
        #[arg(long)]
        root: Option<PathBuf>,

        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // `--verbose` and `--json` win over the configuration's logging section.
    let verbose = cli.verbose;
    let json = cli.json;
    let init = |json_config: bool, level: &str| {
        sift_core::init_tracing(json || json_config, if verbose { "debug" } else { level });
    };

    match cli.command {
        Commands::Run {
            config,
            multirun,
            jobs,
        } => {
            let members = expand(&config, multirun)?;
            match members.iter().find_map(SweepMember::resolved) {
                Some(params) => init(params.logging.json, &params.logging.verbosity),
                None => init(false, "info"),
            }
            cmd_run(members, jobs).await
        }
        Commands::Fingerprint { config } => {
            init(false, "info");
            cmd_fingerprint(&config)
        }
        Commands::Cache { action } => {
            init(false, "info");
            match action {
                CacheAction::List { root, config } => cmd_cache_list(root, &config),
                CacheAction::Invalidate { name, root, config } => {
                    cmd_cache_invalidate(&name, root, &config)
                }
            }
        }
        Commands::ListModels => cmd_list_models(),
        Commands::Summarize { dir, output } => {
            init(false, "info");
            cmd_summarize(&dir, output.as_deref())
        }
    }
}

fn parse_overrides(raw: &[String]) -> Result<Vec<Override>> {
    raw.iter()
        .map(|o| Override::parse(o).with_context(|| format!("Invalid override '{o}'")))
        .collect()
}

/// Resolve the configuration into sweep members.
fn expand(args: &ConfigArgs, multirun: bool) -> Result<Vec<SweepMember>> {
    let tree = config::load_tree(&args.config_dir, &args.config)
        .with_context(|| format!("Failed to load config '{}'", args.config))?;
    let sweep = SweepSpec::new(tree).with_overrides(parse_overrides(&args.overrides)?);
    if sweep.is_sweep() && !multirun {
        anyhow::bail!("Multi-valued overrides declare a sweep; pass --multirun to run it");
    }
    Ok(sweep.expand()?)
}

/// Resolve a single configuration.
fn resolve(args: &ConfigArgs) -> Result<RunParameters> {
    let overrides = parse_overrides(&args.overrides)?;
    config::load(&args.config_dir, &args.config, &overrides)
        .with_context(|| format!("Failed to load config '{}'", args.config))
}

async fn cmd_run(members: Vec<SweepMember>, jobs: usize) -> Result<()> {
    // Cache and tracking settings come from the first member that resolved.
    let Some(params) = members.iter().find_map(SweepMember::resolved).cloned() else {
        for member in &members {
            if let Err(failure) = &member.params {
                println!("  ✗ {} {} {}", member.name, member.assignments.join(" "), failure);
            }
        }
        anyhow::bail!("None of the {} members resolved", members.len());
    };
    let cache = CacheStore::from_config(&params.cache)
        .with_context(|| format!("Failed to open cache at {}", params.cache.root.display()))?;

    let tracker: Arc<dyn ExperimentTracker> = if params.logging.tracking {
        let path = params.logging.output_dir.join("tracking.jsonl");
        Arc::new(
            JsonlTracker::open(&path)
                .await
                .with_context(|| format!("Failed to open tracking log {}", path.display()))?,
        )
    } else {
        Arc::new(NoopTracker)
    };

    info!(members = members.len(), jobs, cache = %cache.root().display(), "starting run");
    let orchestrator = PipelineOrchestrator::new(Arc::new(cache)).with_tracker(tracker);
    let runner = SweepRunner::new(
        Arc::new(orchestrator),
        SweepConfig {
            max_concurrent: jobs,
        },
    );
    let labels: Vec<(String, Vec<String>)> = members
        .iter()
        .map(|m| (m.name.clone(), m.assignments.clone()))
        .collect();

    let report = runner.run(members).await;
    print!("{}", render_report(&report, &labels));

    if report.all_succeeded() {
        Ok(())
    } else {
        anyhow::bail!(
            "{} of {} members failed",
            report.total() - report.succeeded(),
            report.total()
        )
    }
}

fn render_report(report: &SweepReport, labels: &[(String, Vec<String>)]) -> String {
    let mut out = String::new();
    for outcome in &report.outcomes {
        let assignments = labels
            .iter()
            .find(|(name, _)| name == &outcome.member)
            .map(|(_, a)| a.join(" "))
            .unwrap_or_default();
        match &outcome.result {
            Ok(r) => out.push_str(&format!(
                "  ✓ {} {} ({}ms) {} -> {} removed {} kept {}\n",
                outcome.member,
                assignments,
                outcome.duration_ms,
                r.base,
                r.curated,
                r.removed,
                r.retained
            )),
            Err(f) => out.push_str(&format!(
                "  ✗ {} {} [{}] {}\n",
                outcome.member, assignments, outcome.state, f
            )),
        }
    }
    out.push_str(&format!(
        "\nSummary: {}/{} members done in {}ms\n",
        report.succeeded(),
        report.total(),
        report.duration_ms
    ));
    out
}

#[derive(Debug, Serialize)]
struct FingerprintOutput {
    name: String,
    digest: String,
    location: PathBuf,
    cached: bool,
}

fn fingerprint_output(params: &RunParameters) -> Result<FingerprintOutput> {
    let fp = fingerprint::derive(params)?;
    let location = params.cache.root.join(fp.name());
    Ok(FingerprintOutput {
        name: fp.name().to_string(),
        digest: fp.digest().to_string(),
        cached: location.join(sift_core::cache::MANIFEST_FILE).is_file(),
        location,
    })
}

fn cmd_fingerprint(args: &ConfigArgs) -> Result<()> {
    let out = fingerprint_output(&resolve(args)?)?;
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn open_cache(root: Option<PathBuf>, args: &ConfigArgs) -> Result<CacheStore> {
    let root = match root {
        Some(root) => root,
        None => resolve(args)?.cache.root,
    };
    CacheStore::open(&root).with_context(|| format!("Failed to open cache at {}", root.display()))
}

fn cmd_cache_list(root: Option<PathBuf>, args: &ConfigArgs) -> Result<()> {
    let cache = open_cache(root, args)?;
    let entries = cache.list()?;
    if entries.is_empty() {
        println!("No cache entries in {}", cache.root().display());
        return Ok(());
    }
    for entry in entries {
        match entry {
            EntryStatus::Valid(e) => println!(
                "  ✓ {} ({} records, created {})",
                e.fingerprint,
                e.manifest.total_records(),
                e.created_at.format("%Y-%m-%d %H:%M:%S")
            ),
            EntryStatus::Stale { name, reason, .. } => println!("  ✗ {name} (stale: {reason})"),
        }
    }
    Ok(())
}

fn cmd_cache_invalidate(name: &str, root: Option<PathBuf>, args: &ConfigArgs) -> Result<()> {
    let cache = open_cache(root, args)?;
    if cache.invalidate_by_name(name)? {
        println!("Invalidated {name}");
    } else {
        warn!(entry = %name, "no such cache entry");
        println!("No entry named {name}");
    }
    Ok(())
}

fn cmd_list_models() -> Result<()> {
    for name in ModelRegistry::builtin().names() {
        println!("{name}");
    }
    Ok(())
}

fn cmd_summarize(dir: &Path, output: Option<&Path>) -> Result<()> {
    let rows = reporting::read_results(dir)
        .with_context(|| format!("Failed to read results under {}", dir.display()))?;
    if rows.is_empty() {
        anyhow::bail!("No result rows under {}", dir.join("results").display());
    }
    let markdown = reporting::render_summary_md(&reporting::summarize(&rows));
    print!("{markdown}");
    if let Some(path) = output {
        std::fs::write(path, &markdown)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_core::{Phase, ResultRow, Split};

    const BASELINE: &str = r#"
name = "baseline"

[preproc]
dataset = "tuab"
"#;

    fn config_args(dir: &Path, overrides: &[&str]) -> ConfigArgs {
        ConfigArgs {
            config_dir: dir.to_path_buf(),
            config: "baseline".to_string(),
            overrides: overrides.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn config_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("baseline.toml"), BASELINE).unwrap();
        dir
    }

    #[test]
    fn test_cli_parses_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "sift",
            "run",
            "-c",
            "baseline",
            "-o",
            "preproc.dropout_rate=0.3,0.7",
            "--multirun",
            "-j",
            "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                config,
                multirun,
                jobs,
            } => {
                assert_eq!(config.overrides, vec!["preproc.dropout_rate=0.3,0.7"]);
                assert!(multirun);
                assert_eq!(jobs, 2);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_sweep_requires_multirun() {
        let dir = config_dir();
        let args = config_args(dir.path(), &["preproc.dropout_rate=0.3,0.7"]);
        let err = expand(&args, false).unwrap_err();
        assert!(format!("{err:#}").contains("--multirun"));

        let members = expand(&args, true).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[1].name, "baseline_001");
    }

    #[test]
    fn test_dataset_sweep_gives_one_entry_per_dataset() {
        let dir = config_dir();
        let members = expand(&config_args(dir.path(), &["preproc.dataset=tuab,tuev"]), true).unwrap();
        let names: Vec<String> = members
            .iter()
            .map(|m| fingerprint::derive(m.resolved().unwrap()).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["tuab", "tuev"]);
    }

    #[tokio::test]
    async fn test_run_with_no_resolvable_member_fails() {
        let dir = config_dir();
        let members = expand(&config_args(dir.path(), &["preproc.dropout_seed=x,y"]), true).unwrap();
        assert!(members.iter().all(|m| m.resolved().is_none()));

        let err = cmd_run(members, 1).await.unwrap_err();
        assert!(err.to_string().contains("None of the 2 members resolved"));
    }

    #[test]
    fn test_fingerprint_ignores_source_and_names_dropout() {
        let dir = config_dir();
        let a = resolve(&config_args(
            dir.path(),
            &[
                "preproc.random_dropout=true",
                "preproc.dropout_rate=0.3",
                "preproc.dropout_seed=12",
                "preproc.source=/data/a.jsonl",
            ],
        ))
        .unwrap();
        let b = resolve(&config_args(
            dir.path(),
            &[
                "preproc.random_dropout=true",
                "preproc.dropout_rate=0.3",
                "preproc.dropout_seed=12",
                "preproc.source=/elsewhere/a.jsonl",
            ],
        ))
        .unwrap();

        let fa = fingerprint_output(&a).unwrap();
        let fb = fingerprint_output(&b).unwrap();
        assert_eq!(fa.name, "tuab_dropout_0.3_seed_12");
        assert_eq!(fa.digest, fb.digest);
        assert!(!fa.cached);
    }

    #[test]
    fn test_bad_override_is_rejected() {
        let dir = config_dir();
        assert!(resolve(&config_args(dir.path(), &["no_equals_sign"])).is_err());
    }

    #[test]
    fn test_summarize_writes_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<ResultRow> = [0.8, 0.9]
            .iter()
            .enumerate()
            .map(|(seed, acc)| ResultRow {
                member: format!("m{seed}"),
                model: "centroid".to_string(),
                dataset: "tuab".to_string(),
                seed: seed as u64,
                dropout_rate: 0.3,
                phase: Phase::Curated,
                split: Split::Test,
                acc: *acc,
                balanced_acc: *acc,
            })
            .collect();
        reporting::append_results(&reporting::results_path(dir.path(), "m"), &rows).unwrap();

        let out = dir.path().join("summary.md");
        cmd_summarize(dir.path(), Some(&out)).unwrap();
        let markdown = std::fs::read_to_string(out).unwrap();
        assert!(markdown.contains("| curated | test | 0.3 | 2 | 0.8500 |"));
    }

    #[test]
    fn test_summarize_without_rows_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cmd_summarize(dir.path(), None).is_err());
    }
}
