use crate::config::{HarnessConfig, HarnessOpt};
use crate::error::{Error, Result};
use crate::experiment::{aggregate_variant, Experiment};
use crate::integrity::{check, ensure_passed};
use crate::server::LiveServers;
use clap::ValueHint::FilePath;
use clap::{Args, Parser, Subcommand};
use log::{debug, error, info, warn};
use std::fs::read_to_string;
use std::sync::Arc;

#[derive(Args, Debug)]
struct ExperimentArgs {
    #[arg(short = 'c')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the experiment's TOML config file")]
    config: String,

    #[arg(help = "Variants to run, all configured variants if none is given")]
    variants: Vec<String>,

    #[arg(long)]
    #[arg(help = "Number of iterations of every run, overrides the config file")]
    iterations: Option<usize>,

    #[arg(long, value_delimiter = ',')]
    #[arg(help = "Comma-separated request counts, overrides the config file")]
    requests: Option<Vec<u64>>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    experiment: ExperimentArgs,

    #[arg(long)]
    #[arg(help = "Render comparison charts after all runs")]
    plot: bool,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[arg(short = 'c')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the experiment's TOML config file")]
    config: String,

    #[arg(long)]
    #[arg(help = "Variant to check")]
    variant: String,

    #[arg(long, default_value_t = 1000)]
    #[arg(help = "Number of keys written before the restart")]
    keys: usize,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[arg(short = 'c')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the experiment's TOML config file")]
    config: String,
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run an experiment and average its measurements")]
    Run(RunArgs),
    #[command(about = "Recompute the averages from the per-run files on disk")]
    Aggregate(ExperimentArgs),
    #[command(about = "Render comparison charts from the averages on disk")]
    Plot(ExperimentArgs),
    #[command(about = "Check that writes survive a server restart")]
    Check(CheckArgs),
    #[command(about = "Print the configuration with all defaults filled in")]
    Show(ConfigArgs),
    #[command(about = "List the configured variants")]
    List(ConfigArgs),
}

fn load(path: &str) -> Result<HarnessOpt> {
    let text = read_to_string(path)?;
    HarnessOpt::from_toml_str(&text)
}

fn resolve(args: &ExperimentArgs) -> Result<HarnessConfig> {
    let mut opt = load(&args.config)?;
    if let Some(iterations) = args.iterations {
        opt.global.iterations = Some(iterations);
    }
    if let Some(ref requests) = args.requests {
        opt.global.requests = Some(requests.clone());
    }
    let mut config = HarnessConfig::new(&opt)?;
    config.select(&args.variants)?;
    Ok(config)
}

/// Stop every live server on Ctrl-C, then exit.
fn install_interrupt_handler(live: &Arc<LiveServers>) {
    let live = live.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("Interrupted, stopping servers");
        live.terminate_all();
        std::process::exit(130);
    }) {
        warn!("Failed to set the Ctrl-C handler: {}", e);
    }
}

fn plot(config: &HarnessConfig) -> Result<()> {
    match config.plot {
        Some(ref renderer) => {
            crate::plot::render(config, renderer)?;
        }
        None => warn!("No chart renderer configured, skipping charts"),
    }
    Ok(())
}

fn run_cli(args: &RunArgs) -> Result<()> {
    let config = resolve(&args.experiment)?;
    let live = LiveServers::new();
    install_interrupt_handler(&live);
    Experiment::new(&config, live).run()?;
    if args.plot {
        plot(&config)?;
    }
    Ok(())
}

fn aggregate_cli(args: &ExperimentArgs) -> Result<()> {
    let config = resolve(args)?;
    for variant in config.variants.iter() {
        let written = aggregate_variant(&config, variant)?;
        info!("{}: {} averaged files", variant.name, written.len());
    }
    Ok(())
}

fn plot_cli(args: &ExperimentArgs) -> Result<()> {
    plot(&resolve(args)?)
}

fn check_cli(args: &CheckArgs) -> Result<()> {
    let config = HarnessConfig::new(&load(&args.config)?)?;
    let Some(variant) = config.variant(&args.variant) else {
        return Err(Error::Config(format!("variant {} not found", args.variant)));
    };
    let live = LiveServers::new();
    install_interrupt_handler(&live);
    let report = check(&config, variant, args.keys, &live)?;
    println!(
        "{} ({}): {} correct keys, {} incorrect keys, counter {}",
        report.variant,
        report.mode,
        report.correct,
        report.incorrect,
        if report.counter_ok { "correct" } else { "incorrect" }
    );
    ensure_passed(&report)
}

fn show_cli(args: &ConfigArgs) -> Result<()> {
    let opt = load(&args.config)?;
    // resolve as well, so that an invalid file is reported instead of printed
    HarnessConfig::new(&opt)?;
    let text = toml::to_string_pretty(&opt).map_err(|e| Error::Config(e.to_string()))?;
    print!("{}", text);
    Ok(())
}

fn list_cli(args: &ConfigArgs) -> Result<()> {
    let config = HarnessConfig::new(&load(&args.config)?)?;
    for v in config.variants.iter() {
        let modes: Vec<&str> = v.modes.iter().map(|m| m.label()).collect();
        println!(
            "Variant: {} (port {}, modes {})",
            v.name,
            v.server.port,
            modes.join(",")
        );
    }
    Ok(())
}

/// The default command line interface.
///
/// ## Usage
///
/// To get the usage of the command line interface, users can run:
///
/// ```bash
/// persistbench -h
/// ```
///
/// The interface supports six modes, `run`, `aggregate`, `plot`, `check`, `show` and `list`. All
/// of them read an experiment configuration, whose format is documented in [`crate::config`].
///
/// ### Run mode
///
/// Usage:
///
/// ```bash
/// persistbench run -c <CONFIG> [VARIANTS]... [--iterations <N>] [--requests <N,N,...>] [--plot]
/// ```
///
/// Runs every selected variant (all by default) and writes the per-run and averaged files under
/// the configured output directory. `--iterations` and `--requests` override the values of the
/// config file. With `--plot`, the configured chart renderer is invoked afterwards, see
/// [`crate::plot`].
///
/// ### Aggregate and plot modes
///
/// ```bash
/// persistbench aggregate -c <CONFIG> [VARIANTS]...
/// persistbench plot -c <CONFIG> [VARIANTS]...
/// ```
///
/// These only redo the last steps of a run from the files already on disk.
///
/// ### Check mode
///
/// ```bash
/// persistbench check -c <CONFIG> --variant <NAME> [--keys <N>]
/// ```
///
/// Writes keys to the variant's server, restarts it and verifies that every key survived, see
/// [`crate::integrity`].
///
/// ### Show and list modes
///
/// `show` prints the configuration with all defaults filled in, `list` the configured variants.
///
/// ## Exit status
///
/// 0 on success, 1 if any step fails, and 130 when interrupted. Logging is controlled with
/// `RUST_LOG`.
pub fn cmdline() {
    env_logger::init();
    let cli = Cli::parse();
    debug!("Starting persistbench with args: {:?}", cli);
    let result = match cli.command {
        Commands::Run(args) => run_cli(&args),
        Commands::Aggregate(args) => aggregate_cli(&args),
        Commands::Plot(args) => plot_cli(&args),
        Commands::Check(args) => check_cli(&args),
        Commands::Show(args) => show_cli(&args),
        Commands::List(args) => list_cli(&args),
    };
    if let Err(e) = result {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
