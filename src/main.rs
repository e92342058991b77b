//! ArrayRunner CLI Entry Point
//!
//! Runs one array task on the local machine.
//!
//! # Usage
//!
//! ```bash
//! # Run an array task
//! arrayrunner map_square.yaml
//!
//! # With pause control
//! arrayrunner map_square.yaml /tmp/pause.flag
//!
//! # Dry run mode (print every child's unit)
//! arrayrunner map_square.yaml --dry-run
//!
//! # Read inputs from one prefix and write outputs under another
//! arrayrunner map_square.yaml --input data/in --output data/out
//!
//! # Limit per-child operations to 8 worker threads
//! arrayrunner map_square.yaml --parallel 8
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use colored::Colorize;
use log::{error, info};

use arrayrunner::array::{ArrayPhase, Config};
use arrayrunner::execution::{Engine, RunSummary};
use arrayrunner::{APP_NAME, VERSION};

/// Default task template used when none is specified.
const DEFAULT_TEMPLATE: &str = "task.yaml";

/// Default delay between rounds, in milliseconds.
const DEFAULT_POLL_MS: u64 = 1000;

/// Command-line options parsed from arguments.
#[derive(Debug)]
struct Options {
    template_path: String,
    pause_flag_path: Option<String>,
    abort_flag_path: Option<String>,
    config_path: Option<PathBuf>,
    dry_run: bool,
    fresh: bool,
    working_dir: Option<PathBuf>,
    parallel: Option<usize>,
    execution_name: Option<String>,
    namespace: Option<String>,
    input_prefix: Option<String>,
    output_prefix: Option<String>,
    poll_ms: u64,
    verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            template_path: DEFAULT_TEMPLATE.to_string(),
            pause_flag_path: None,
            abort_flag_path: None,
            config_path: None,
            dry_run: false,
            fresh: false,
            working_dir: None,
            parallel: None,
            execution_name: None,
            namespace: None,
            input_prefix: None,
            output_prefix: None,
            poll_ms: DEFAULT_POLL_MS,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Array Task Runner");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: arrayrunner [OPTIONS] <TEMPLATE_FILE> [PAUSE_FLAG_PATH]");
    println!();
    println!("Arguments:");
    println!("  <TEMPLATE_FILE>     Path to the task template YAML file");
    println!("  [PAUSE_FLAG_PATH]   Optional path for pause/resume control");
    println!();
    println!("Options:");
    println!("  --config PATH       Plugin config file (default: $ARRAYRUNNER_CONFIG or arrayrunner.yaml)");
    println!("  --dry-run           Print every child's unit without running it");
    println!("  --working-dir PATH  Set working directory for file operations");
    println!("  --parallel N        Worker threads for per-child operations (default: one per CPU)");
    println!("  --name NAME         Execution name (default: the template's task name)");
    println!("  --namespace NS      Namespace units run in (default: default)");
    println!("  --input PREFIX      Input location substituted into commands");
    println!("  --output PREFIX     Output location; child i writes under PREFIX/i");
    println!("  --poll-ms N         Delay between rounds (default: {})", DEFAULT_POLL_MS);
    println!("  --abort-flag PATH   Abort the task once PATH exists");
    println!("  --fresh             Discard state left by an earlier run");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  arrayrunner map_square.yaml");
    println!("  arrayrunner map_square.yaml --dry-run");
    println!("  arrayrunner map_square.yaml --working-dir /data/analysis --parallel 8");
}

/// Returns the value following an option, advancing the cursor.
fn option_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", option))
}

/// Parses command-line arguments into an Options struct.
fn parse_arguments(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => {
                options.dry_run = true;
            }
            "--fresh" => {
                options.fresh = true;
            }
            "--verbose" | "-v" => {
                options.verbose = true;
            }
            "--config" => {
                options.config_path = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--working-dir" => {
                options.working_dir = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--parallel" => {
                let value = option_value(args, &mut i, arg)?;
                options.parallel = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid parallel value: {}", value))?,
                );
            }
            "--name" => {
                options.execution_name = Some(option_value(args, &mut i, arg)?.to_string());
            }
            "--namespace" => {
                options.namespace = Some(option_value(args, &mut i, arg)?.to_string());
            }
            "--input" => {
                options.input_prefix = Some(option_value(args, &mut i, arg)?.to_string());
            }
            "--output" => {
                options.output_prefix = Some(option_value(args, &mut i, arg)?.to_string());
            }
            "--poll-ms" => {
                let value = option_value(args, &mut i, arg)?;
                options.poll_ms = value
                    .parse()
                    .map_err(|_| format!("Invalid poll interval: {}", value))?;
            }
            "--abort-flag" => {
                options.abort_flag_path = Some(option_value(args, &mut i, arg)?.to_string());
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                // Positional argument
                match positional_index {
                    0 => options.template_path = arg.clone(),
                    1 => options.pause_flag_path = Some(arg.clone()),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(options)
}

/// Validates and sets up the working directory.
fn setup_working_directory(
    working_dir: Option<PathBuf>,
) -> Result<Option<PathBuf>, Box<dyn std::error::Error>> {
    let Some(dir) = working_dir else {
        let current = env::current_dir()?;
        info!("Working directory: {}", current.display());
        return Ok(None);
    };

    if !dir.exists() {
        return Err(format!("Working directory does not exist: {}", dir.display()).into());
    }

    if !dir.is_dir() {
        return Err(format!("Path is not a directory: {}", dir.display()).into());
    }

    // Change to working directory for relative path resolution
    env::set_current_dir(&dir)?;
    info!("Working directory: {}", env::current_dir()?.display());

    Ok(Some(dir))
}

/// Loads the plugin config from the given file or the default location.
fn load_config(options: &Options) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &options.config_path {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    if let Some(parallel) = options.parallel {
        config.parallelism = parallel;
    }
    Ok(config)
}

/// Prints the outcome of a run.
fn print_summary(summary: &RunSummary) {
    println!();
    let Some(phase) = summary.phase else {
        println!("{} {} children previewed", "[DRY RUN]".cyan(), summary.counts.pending);
        return;
    };

    let label = phase.to_string();
    let label = match phase {
        ArrayPhase::Succeeded => label.green().bold(),
        ArrayPhase::PartiallyFailed | ArrayPhase::Aborted => label.yellow().bold(),
        _ => label.red().bold(),
    };

    println!("Array task {}: {}", label, summary.counts);
    println!(
        "Finished in {} rounds ({:.1}s)",
        summary.rounds,
        summary.elapsed.as_secs_f64()
    );
    print!("{}", summary.timeline);
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let options = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(options.verbose);

    // Print banner
    print_banner();

    // Display configuration
    if let Some(ref path) = options.pause_flag_path {
        info!("Pause control: {}", path);
    }

    if options.dry_run {
        info!("Mode: DRY RUN (units will not run)");
        println!();
    }

    // Setup working directory
    let work_dir = setup_working_directory(options.working_dir.clone())?;

    let config = load_config(&options).map_err(|e| {
        error!("Failed to load config: {}", e);
        e
    })?;

    // Create and configure engine
    info!("Loading task template: {}", options.template_path);
    let mut engine = Engine::new(&options.template_path);
    engine.set_config(config);
    engine.set_dry_run(options.dry_run);
    engine.set_fresh(options.fresh);
    engine.set_poll_interval(Duration::from_millis(options.poll_ms));

    if let Some(name) = options.execution_name {
        engine.set_execution_name(name);
    }

    if let Some(namespace) = options.namespace {
        engine.set_namespace(namespace);
    }

    if options.input_prefix.is_some() || options.output_prefix.is_some() {
        engine.set_io(
            options.input_prefix.unwrap_or_else(|| ".".to_string()),
            options.output_prefix.unwrap_or_else(|| "outputs".to_string()),
        );
    }

    if let Some(pause_path) = options.pause_flag_path {
        engine.set_pause_flag_path(pause_path);
    }

    if let Some(abort_path) = options.abort_flag_path {
        engine.set_abort_flag_path(abort_path);
    }

    if let Some(dir) = work_dir {
        engine.set_working_dir(dir);
    }

    // Run the task
    let summary = engine.run()?;
    print_summary(&summary);

    Ok(!matches!(summary.phase, Some(ArrayPhase::Failed)))
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
