use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context};
use clap::{ArgAction, Parser};
use log::{error, info, LevelFilter};

use whittle_core::config::{MinimizerConfig, WriteSpec};
use whittle_core::engine::{DdminEngine, EngineError};
use whittle_core::materialize::Materializer;
use whittle_core::oracle::CommandOracle;
use whittle_core::predicate::FailurePredicate;
use whittle_core::source::Source;
use whittle_core::template::CommandTemplate;

/// Minimize a failing test case with delta debugging.
///
/// Runs COMMAND against ever-smaller subsequences of the input and writes
/// the smallest one that still fails.
#[derive(Parser, Debug)]
#[clap(name = "whittle", version, about, long_about = None)]
struct Cli {
    /// Command template. `@` expands to the candidate file path, `@@` to
    /// its contents; without either the path is appended.
    command: Option<String>,

    /// Settings file (TOML); flags override its values.
    #[clap(long, value_parser)]
    config_file: Option<PathBuf>,

    /// Source file (default: stdin, which must be seekable).
    #[clap(short, long)]
    input: Option<PathBuf>,

    /// Destination for the minimized bytes (default: stdout).
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Increase verbosity (repeatable, up to -vvv).
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Exit statuses that count as failure, e.g. "42" or "1-10,~5".
    #[clap(long)]
    status: Vec<String>,

    /// Termination signals that count as failure, e.g. "SIGSEGV" or "ANY,~9".
    #[clap(long)]
    signal: Vec<String>,

    /// Shorthand for --signal SIGSEGV.
    #[clap(long)]
    segfaults: bool,

    /// A substring whose appearance on a fd counts as failure.
    #[clap(long, num_args = 2, value_names = ["FD", "SUBSTRING"], action = ArgAction::Append)]
    writes_to: Vec<String>,

    /// Shorthand for --writes-to 1 SUBSTRING.
    #[clap(long)]
    writes: Vec<String>,

    /// Shorthand for --writes-to 2 SUBSTRING.
    #[clap(long)]
    writes_to_stderr: Vec<String>,

    /// Feed the candidate on the subject's stdin.
    #[clap(long)]
    write_to_stdin: bool,

    /// Per-run wall-clock budget in milliseconds; 0 disables.
    #[clap(short = 't', long)]
    timeout: Option<u64>,

    /// Run the template through `sh -c`.
    #[clap(long)]
    shell: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbose);
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();
}

/// Layers CLI flags over the (optional) settings file.
fn resolve_config(cli: &Cli) -> anyhow::Result<MinimizerConfig> {
    let mut config = match &cli.config_file {
        Some(path) => MinimizerConfig::load_from_file(path)
            .with_context(|| format!("failed to load config file {}", path.display()))?,
        None => MinimizerConfig::default(),
    };

    if let Some(command) = &cli.command {
        config.command = Some(command.clone());
    }
    config.shell |= cli.shell;
    config.write_to_stdin |= cli.write_to_stdin;
    if let Some(timeout) = cli.timeout {
        config.timeout_ms = timeout;
    }
    config.status.extend(cli.status.iter().cloned());
    config.signal.extend(cli.signal.iter().cloned());
    if cli.segfaults {
        config.signal.push("SIGSEGV".to_owned());
    }
    for pair in cli.writes_to.chunks(2) {
        let fd: i32 = pair[0]
            .parse()
            .with_context(|| format!("invalid watched fd {:?}", pair[0]))?;
        config.writes.push(WriteSpec {
            fd,
            substring: pair[1].clone(),
        });
    }
    for substring in &cli.writes {
        config.writes.push(WriteSpec {
            fd: 1,
            substring: substring.clone(),
        });
    }
    for substring in &cli.writes_to_stderr {
        config.writes.push(WriteSpec {
            fd: 2,
            substring: substring.clone(),
        });
    }
    if let Some(input) = &cli.input {
        config.input = Some(input.clone());
    }
    if let Some(output) = &cli.output {
        config.output = Some(output.clone());
    }
    Ok(config)
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = resolve_config(cli)?;
    let command = config
        .command
        .as_deref()
        .context("no command template given (positional argument or config file)")?;

    let template = CommandTemplate::parse(command, config.shell, config.write_to_stdin)?;
    let predicate = FailurePredicate::compile(&config.predicate_spec())?;
    let source = match &config.input {
        Some(path) => Source::open(path)?,
        None => Source::from_stdin()?,
    };
    let input_len = source.len();
    info!("minimizing {input_len} bytes against: {command}");

    let materializer =
        Materializer::new(source).context("failed to create temporary directory")?;
    let oracle = CommandOracle::new(template, predicate, materializer);
    let mut engine = DdminEngine::new(oracle);
    let outcome = engine.minimize(input_len).map_err(|err| match err {
        EngineError::InitialTestPasses => {
            anyhow!("initial test does not fail: the unreduced input already passes")
        }
        other => other.into(),
    })?;
    info!("{outcome}");

    let mut oracle = engine.into_oracle();
    let bytes = oracle.extract(&outcome.chunks)?;
    match &config.output {
        Some(path) => std::fs::write(path, &bytes)
            .with_context(|| format!("failed to write result to {}", path.display()))?,
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(&bytes)
                .context("failed to write result to stdout")?;
            handle.flush().context("failed to flush stdout")?;
        }
    }
    Ok(())
}
