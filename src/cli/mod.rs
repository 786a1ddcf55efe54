// Purpose: Parse the command line and drive the build pipeline end to end.
// Inputs/Outputs: Reads target packages from argv, stdin or a file; produces the test binary.
// Invariants: Stage order is hash, pull, rewrite, generate, build, link; store runs best-effort last.
// Gotchas: Exactly one input mode is allowed; the cache directory lock is fail-fast.

use std::collections::HashSet;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, info, warn};

use crate::buildctx::BuildCtx;
use crate::builder::Builder;
use crate::builder::tools::Tools;
use crate::cache::puller::Puller;
use crate::cache::storer::Storer;
use crate::cache::cache_root;
use crate::dag::{CancelToken, Dag, Node, VisitCx};
use crate::errors::Error;
use crate::hasher::Hasher;
use crate::linker::Linker;
use crate::maingen::{Generator, runner};
use crate::pkg;
use crate::rewrite::DeferredIniter;
use crate::util::DirLock;

/// Compile Go packages and their tests into one self-contained test binary.
#[derive(Parser, Debug)]
#[command(name = "gophertest", version)]
pub struct Cli {
    /// Target import paths.
    pub packages: Vec<String>,

    /// Read package names from stdin, one per line.
    #[arg(long)]
    pub from_stdin: bool,

    /// Read package names from a file, one per line.
    #[arg(long, value_name = "PATH")]
    pub from_file: Option<PathBuf>,

    /// Base source directory (defaults to the working directory).
    #[arg(long, value_name = "DIR")]
    pub pkg_dir: Option<PathBuf>,

    /// Output binary path.
    #[arg(long, default_value = "gopher.test")]
    pub out: PathBuf,

    /// Print the work dir and do not delete it on exit.
    #[arg(long)]
    pub keep_work_dir: bool,

    /// Log external tool invocations.
    #[arg(long)]
    pub log_build_commands: bool,

    /// Skip the cache pull phase and rebuild everything.
    #[arg(long)]
    pub ignore_cache: bool,

    /// Skip the cache store phase.
    #[arg(long)]
    pub skip_cache_update: bool,

    /// Dump a dependency graph in DOT form to this file and exit.
    #[arg(long, value_name = "FILE")]
    pub graph: Option<PathBuf>,

    /// Comma-separated node keys to include in the graph dump.
    #[arg(long, value_name = "CSV")]
    pub graph_nodes: Option<String>,

    /// Enable info logging.
    #[arg(short, long)]
    pub verbose: bool,
}

pub fn run_cli() -> i32 {
    let cli = Cli::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            LevelFilter::Info
        } else {
            LevelFilter::Warn
        })
        .init();
    match drive(cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{err:?}");
            1
        }
    }
}

fn drive(cli: Cli) -> Result<()> {
    let ctx = BuildCtx::probe()?;

    let cwd = std::env::current_dir().context("getting working directory")?;
    let src_dir = cli.pkg_dir.clone().unwrap_or_else(|| cwd.clone());
    let out_file = if cli.out.is_absolute() {
        cli.out.clone()
    } else {
        cwd.join(&cli.out)
    };

    let targets = read_targets(&cli)?;
    if targets.is_empty() {
        return Err(Error::NoPackages.into());
    }

    let cache_dir = cache_root(&ctx)?;
    let _cache_lock = DirLock::try_acquire(&cache_dir)
        .with_context(|| format!("locking cache dir {}", cache_dir.display()))?;

    let temp = tempfile::Builder::new()
        .prefix("gophertest")
        .tempdir()
        .context("creating work directory")?;
    let work_dir = temp.path().to_path_buf();
    if cli.keep_work_dir {
        println!("workDir={}", work_dir.display());
    }

    let tools = Tools::new(ctx.clone(), cli.log_build_commands);

    let mut full_packages = targets.clone();
    full_packages.extend(runner::DEPS.iter().map(|d| d.to_string()));
    let build_pkgs = pkg::import_all(&ctx, &src_dir, &full_packages)
        .context("importing packages")?;

    let test_set: HashSet<&str> = targets.iter().map(|s| s.as_str()).collect();
    let dag = Dag::new();
    for p in &build_pkgs {
        let include_tests = test_set.contains(p.import_path.as_str());
        dag.add(p, include_tests, false)
            .with_context(|| format!("adding {:?} to dag", p.import_path))?;
    }

    if let Some(graph_file) = &cli.graph {
        let keys: Vec<String> = match &cli.graph_nodes {
            Some(csv) => csv.split(',').map(|s| s.trim().to_string()).collect(),
            None => dag.keys().into_iter().map(|k| k.0).collect(),
        };
        dag.graph(graph_file, &keys)?;
        return Ok(());
    }

    dag.check_for_cycles().context("repairing cycles")?;
    dag.check_for_cycles().context("verifying cycle repair")?;
    dag.check_complete(true).context("dag incomplete")?;

    let cancel = CancelToken::new();
    let hasher = Hasher { ctx: &ctx };

    let outcome = (|| -> Result<()> {
        dag.visit_all_from_right(&cancel, &hasher)
            .context("hashing source")?;

        if !cli.ignore_cache {
            let puller = Puller {
                tools: &tools,
                cache_dir: cache_dir.clone(),
            };
            dag.visit_all_from_right(&cancel, &puller)
                .context("pulling from cache")?;
        }

        let mut di = DeferredIniter::new(work_dir.clone());
        dag.visit_all_from_right(&cancel, &|cx: &VisitCx, n: &mut Node| di.collect(cx, n))
            .context("finding tests")?;
        di.load_packages().context("loading tests")?;
        dag.visit_all_from_right(&cancel, &|cx: &VisitCx, n: &mut Node| di.rewrite(cx, n))
            .context("rewriting tests")?;
        di.apply_discovered_imports(&dag)
            .context("wiring discovered imports")?;
        hasher
            .refresh_changed(&dag)
            .context("rehashing rewritten packages")?;

        dag.check_complete(false).context("dag incomplete")?;

        let generator = Generator::new(work_dir.clone());
        dag.visit_all_from_right(&cancel, &|cx: &VisitCx, n: &mut Node| {
            generator.find_tests(cx, n)
        })
        .context("finding tests")?;
        generator
            .generate_main(&dag, &hasher)
            .context("generating main")?;

        let builder = Builder {
            tools: &tools,
            work_dir: work_dir.clone(),
        };
        dag.visit_all_from_right(&cancel, &builder)
            .context("compiling")?;

        let linker = Linker::new(&tools, work_dir.clone(), out_file.clone());
        dag.visit_all_from_right(&cancel, &linker)
            .context("linking")?;
        Ok(())
    })();

    // Best-effort cache update, even after a failed stage; its own errors
    // never mask an earlier one.
    if !cli.skip_cache_update {
        let store_cancel = CancelToken::new();
        let storer = Storer {
            cache_dir: cache_dir.clone(),
        };
        if let Err(err) = dag.visit_all_from_right(&store_cancel, &storer) {
            warn!("updating cache: {err:?}");
        }
    }

    if cli.keep_work_dir {
        let _ = temp.keep();
    }

    if outcome.is_ok() {
        info!("wrote {}", out_file.display());
    }
    outcome
}

fn read_targets(cli: &Cli) -> Result<Vec<String>> {
    let mut input_modes = 0;
    let mut targets = Vec::new();

    if !cli.packages.is_empty() {
        input_modes += 1;
        targets = cli.packages.clone();
    }
    if cli.from_stdin {
        input_modes += 1;
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading packages from stdin")?;
        targets = split_lines(&buf);
    }
    if let Some(path) = &cli.from_file {
        input_modes += 1;
        let buf = std::fs::read_to_string(path)
            .with_context(|| format!("reading packages from {}", path.display()))?;
        targets = split_lines(&buf);
    }

    if input_modes != 1 {
        return Err(Error::AmbiguousInput.into());
    }
    Ok(targets)
}

fn split_lines(buf: &str) -> Vec<String> {
    buf.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{Cli, read_targets, split_lines};
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("gophertest").chain(args.iter().copied()))
    }

    #[test]
    fn positional_packages_are_the_default_mode() {
        let cli = parse(&["example.com/a", "example.com/b"]);
        let targets = read_targets(&cli).expect("targets");
        assert_eq!(targets, vec!["example.com/a", "example.com/b"]);
    }

    #[test]
    fn mixing_input_modes_is_rejected() {
        let cli = parse(&["--from-stdin", "example.com/a"]);
        assert!(read_targets(&cli).is_err());
    }

    #[test]
    fn no_input_mode_is_rejected() {
        let cli = parse(&[]);
        assert!(read_targets(&cli).is_err());
    }

    #[test]
    fn file_mode_reads_line_separated_packages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pkgs.txt");
        std::fs::write(&path, "a\n\n  b \n").expect("write");
        let cli = parse(&["--from-file", path.to_str().expect("utf8")]);
        let targets = read_targets(&cli).expect("targets");
        assert_eq!(targets, vec!["a", "b"]);
    }

    #[test]
    fn line_splitting_trims_and_drops_blanks() {
        assert_eq!(split_lines(" a \n\nb\n"), vec!["a", "b"]);
    }

    #[test]
    fn defaults_match_the_documented_surface() {
        let cli = parse(&["pkg"]);
        assert_eq!(cli.out.to_str(), Some("gopher.test"));
        assert!(!cli.keep_work_dir);
        assert!(!cli.ignore_cache);
        assert!(!cli.skip_cache_update);
        assert!(!cli.verbose);
    }
}
