use anyhow::bail;
use anyhow::Context;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use diag_harness::audit;
use diag_harness::build_filter;
use diag_harness::config::DEFAULT_CONFIG_FILE;
use diag_harness::driver::active_ids;
use diag_harness::process::CommandSpec;
use diag_harness::process::ProcessCompiler;
use diag_harness::report::print_json_report;
use diag_harness::report::render_human;
use diag_harness::report::write_json_report;
use diag_harness::report::RunReport;
use diag_harness::run_suite;
use diag_harness::CompareMode;
use diag_harness::HarnessConfig;
use diag_harness::HarnessError;
use diag_harness::Registrations;
use diag_harness::RunMode;
use diag_harness::Shard;
use diag_harness::SuiteOptions;
use diag_harness::TargetBackend;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Diagnostic comparison harness for compiler front ends", long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run suites and compare produced diagnostics against the expectations
  Run(RunArgs),

  /// Compare the active files of each suite against the registration manifest
  Audit {
    #[command(flatten)]
    suite: SuiteArgs,

    /// Registration manifest (defaults to the one named in the config)
    #[arg(long)]
    registrations: Option<PathBuf>,
  },

  /// Rewrite the registration manifest from the active files of each suite
  Register {
    #[command(flatten)]
    suite: SuiteArgs,

    #[arg(long)]
    registrations: Option<PathBuf>,
  },

  /// Print the active test ids of each suite
  List {
    #[command(flatten)]
    suite: SuiteArgs,
  },
}

#[derive(Args)]
struct SuiteArgs {
  /// Config file (defaults to ./diag-harness.toml when present)
  #[arg(long)]
  config: Option<PathBuf>,

  /// Restrict to one configured suite, or name the ad-hoc suite given by --root
  #[arg(long)]
  suite: Option<String>,

  /// Corpus root; overrides the suite root from the config
  #[arg(long)]
  root: Option<PathBuf>,

  /// Target back end
  #[arg(long)]
  backend: Option<String>,

  #[arg(long, value_enum)]
  mode: Option<RunMode>,

  /// Enable tracing output from the harness
  #[arg(long)]
  trace: bool,

  /// Emit tracing output as JSON lines (implies --trace)
  #[arg(long)]
  trace_json: bool,
}

#[derive(Args)]
struct RunArgs {
  #[command(flatten)]
  suite: SuiteArgs,

  /// Glob or regex to filter test ids
  #[arg(long)]
  filter: Option<String>,

  /// Run only a shard (zero-based): `i/n`
  #[arg(long)]
  shard: Option<String>,

  /// Maximum number of tests to run concurrently
  #[arg(long)]
  jobs: Option<usize>,

  /// Timeout per pipeline stage
  #[arg(long)]
  timeout_secs: Option<u64>,

  #[arg(long, value_enum)]
  compare: Option<CompareMode>,

  /// Directory under which per-test scratch directories are created
  #[arg(long)]
  scratch: Option<PathBuf>,

  /// Front-end command, whitespace separated; overrides the config
  #[arg(long)]
  frontend: Option<String>,

  /// Back-end command, whitespace separated; overrides the config
  #[arg(long = "backend-cmd")]
  backend_cmd: Option<String>,

  /// Print the JSON report to stdout instead of the human summary
  #[arg(long)]
  json: bool,

  /// Also write the JSON report to this path
  #[arg(long, value_name = "PATH")]
  json_out: Option<PathBuf>,

  /// Registration manifest to audit alongside the run
  #[arg(long)]
  registrations: Option<PathBuf>,

  /// Allow running with zero selected tests
  #[arg(long)]
  allow_empty: bool,

  /// List passing and skipped tests too
  #[arg(long, short)]
  verbose: bool,
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  let outcome = match cli.command {
    Commands::Run(args) => run(args),
    Commands::Audit {
      suite,
      registrations,
    } => run_audit(suite, registrations),
    Commands::Register {
      suite,
      registrations,
    } => run_register(suite, registrations),
    Commands::List { suite } => run_list(suite),
  };
  match outcome {
    Ok(true) => ExitCode::SUCCESS,
    Ok(false) => ExitCode::from(1),
    Err(err) => print_error(format!("{err:#}")),
  }
}

fn run(args: RunArgs) -> anyhow::Result<bool> {
  init_tracing(&args.suite);
  let config = load_config(args.suite.config.as_deref())?;
  let mut suites = suite_options(&config, &args.suite)?;

  let filter = build_filter(args.filter.as_deref())?;
  let shard = args.shard.as_deref().map(Shard::parse).transpose()?;
  for opts in &mut suites {
    opts.filter = filter.clone();
    opts.shard = shard;
    opts.allow_empty = args.allow_empty;
    if let Some(jobs) = args.jobs {
      opts.jobs = jobs.max(1);
    }
    if let Some(secs) = args.timeout_secs {
      opts.stage_timeout = Duration::from_secs(secs);
    }
    if let Some(compare) = args.compare {
      opts.compare = compare;
    }
    if let Some(scratch) = &args.scratch {
      opts.scratch_root = scratch.clone();
    }
  }

  let frontend = match &args.frontend {
    Some(raw) => command_from_flag(raw),
    None => config.frontend.clone().ok_or_else(|| {
      HarnessError::Config("no front-end command configured; use --frontend".to_string())
    })?,
  };
  let backend = match &args.backend_cmd {
    Some(raw) => Some(command_from_flag(raw)),
    None => config.backend.clone(),
  };
  let compiler = Arc::new(ProcessCompiler::new(frontend, backend)?);

  let registrations = match registrations_path(&config, args.registrations) {
    Some(path) => Some(Registrations::load(&path)?),
    None => None,
  };

  let mut reports = Vec::with_capacity(suites.len());
  for opts in &suites {
    let registered = registrations
      .as_ref()
      .map(|r| r.suite(&opts.name).cloned().unwrap_or_default());
    let report = run_suite(opts, Arc::clone(&compiler), registered.as_ref())?;
    if !args.json {
      print!("{}", render_human(&report, args.verbose));
    }
    reports.push(report);
  }

  let run_report = RunReport::new(&reports);
  if args.json {
    print_json_report(&run_report)?;
  }
  if let Some(path) = &args.json_out {
    write_json_report(path, &run_report)?;
  }
  Ok(run_report.success)
}

fn run_audit(args: SuiteArgs, registrations: Option<PathBuf>) -> anyhow::Result<bool> {
  init_tracing(&args);
  let config = load_config(args.config.as_deref())?;
  let suites = suite_options(&config, &args)?;
  let Some(path) = registrations_path(&config, registrations) else {
    bail!("no registration manifest given; use --registrations");
  };
  let manifest = Registrations::load(&path)?;

  let mut complete = true;
  for opts in &suites {
    let (active, warnings) = active_ids(opts)?;
    for warning in &warnings {
      eprintln!("warning: {warning}");
    }
    let registered = manifest.suite(&opts.name).cloned().unwrap_or_default();
    let report = audit(active.iter().map(String::as_str), &registered);
    if report.is_empty() {
      println!("{}: {} registered test(s) match", opts.name, active.len());
    } else {
      complete = false;
      print!("{}", report.render());
      println!(
        "{}: {} missing, {} orphan",
        opts.name,
        report.missing_registrations.len(),
        report.orphan_registrations.len()
      );
    }
  }
  Ok(complete)
}

fn run_register(args: SuiteArgs, registrations: Option<PathBuf>) -> anyhow::Result<bool> {
  init_tracing(&args);
  let config = load_config(args.config.as_deref())?;
  let suites = suite_options(&config, &args)?;
  let Some(path) = registrations_path(&config, registrations) else {
    bail!("no registration manifest given; use --registrations");
  };
  let mut manifest = if path.exists() {
    Registrations::load(&path)?
  } else {
    Registrations::default()
  };

  for opts in &suites {
    let (active, _) = active_ids(opts)?;
    println!("{}: registered {} test(s)", opts.name, active.len());
    manifest.set_suite(&opts.name, active.into_iter().collect::<BTreeSet<_>>());
  }
  manifest.write(&path)?;
  Ok(true)
}

fn run_list(args: SuiteArgs) -> anyhow::Result<bool> {
  init_tracing(&args);
  let config = load_config(args.config.as_deref())?;
  for opts in suite_options(&config, &args)? {
    let (active, warnings) = active_ids(&opts)?;
    for warning in &warnings {
      eprintln!("warning: {warning}");
    }
    for id in active {
      println!("{id}");
    }
  }
  Ok(true)
}

fn load_config(path: Option<&Path>) -> anyhow::Result<HarnessConfig> {
  match path {
    Some(path) => Ok(HarnessConfig::load(path)?),
    None => {
      let implicit = Path::new(DEFAULT_CONFIG_FILE);
      if implicit.is_file() {
        Ok(HarnessConfig::load(implicit)?)
      } else {
        Ok(HarnessConfig::default())
      }
    }
  }
}

/// Suites selected by the flags, with config values applied and the CLI
/// overrides that affect classification already folded in.
fn suite_options(config: &HarnessConfig, args: &SuiteArgs) -> anyhow::Result<Vec<SuiteOptions>> {
  let mut selected = match (&args.root, &args.suite) {
    (Some(root), name) => {
      let name = name.clone().unwrap_or_else(|| "default".to_string());
      let mut suite = match config.suite(&name) {
        Some(suite) => suite.clone(),
        None => diag_harness::config::SuiteConfig {
          name,
          root: root.clone(),
          backend: TargetBackend::default(),
          mode: RunMode::default(),
          rules: Vec::new(),
          variant_suffixes: None,
          frontend_only_suffixes: None,
        },
      };
      suite.root = if root.is_absolute() {
        root.clone()
      } else {
        std::env::current_dir()
          .context("resolve current directory")?
          .join(root)
      };
      vec![suite]
    }
    (None, Some(name)) => match config.suite(name) {
      Some(suite) => vec![suite.clone()],
      None => bail!(HarnessError::Config(format!("unknown suite '{name}'"))),
    },
    (None, None) => {
      if config.suites.is_empty() {
        bail!(HarnessError::Config(
          "no suites configured; pass --root or --config".to_string()
        ));
      }
      config.suites.clone()
    }
  };

  let mut options = Vec::with_capacity(selected.len());
  for suite in &mut selected {
    if let Some(backend) = &args.backend {
      suite.backend = TargetBackend::new(backend);
    }
    if let Some(mode) = args.mode {
      suite.mode = mode;
    }
    options.push(config.suite_options(suite)?);
  }
  Ok(options)
}

fn registrations_path(config: &HarnessConfig, flag: Option<PathBuf>) -> Option<PathBuf> {
  flag.or_else(|| config.registrations_path())
}

fn command_from_flag(raw: &str) -> CommandSpec {
  CommandSpec {
    command: raw.split_whitespace().map(str::to_string).collect(),
    env: Default::default(),
  }
}

fn print_error(err: impl std::fmt::Display) -> ExitCode {
  eprintln!("error: {err}");
  ExitCode::from(2)
}

fn init_tracing(args: &SuiteArgs) {
  if !args.trace && !args.trace_json {
    return;
  }

  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let builder = fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr);
  let installed = if args.trace_json {
    builder.json().try_init()
  } else {
    builder.try_init()
  };
  if let Err(err) = installed {
    eprintln!("failed to install tracing subscriber: {err}");
  }
}
