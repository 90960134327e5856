use std::env;
use std::path::PathBuf;
use std::process::Command;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use fim::channel;
use fim::monitor::{MonitorConfig, MonitorController, MonitorMode};
use fim::strategy::{ErrorInjectionStrategy, ErrorType};

struct Cli {
    mode: MonitorMode,
    program: String,
    program_args: Vec<String>,
    verbose: bool,
    log_file: Option<PathBuf>,
    log_level: String,
    threads: usize,
    error_type: ErrorType,
    pointer_error_rate: f64,
    non_pointer_error_rate: f64,
    error_limit: usize,
    error_seed: u64,
    interval_ms: u64,
    initial_delay_ms: u64,
    max_iterations: Option<u64>,
}

impl Cli {
    fn parse() -> Result<Self> {
        let args: Vec<String> = env::args().collect();

        if args.len() < 2 || args[1] == "-h" || args[1] == "--help" {
            Self::print_help();
            std::process::exit(if args.len() < 2 { 1 } else { 0 });
        }

        let mode = match args[1].as_str() {
            "periodic" => MonitorMode::Periodic,
            "command" => MonitorMode::Command,
            other => bail!("unknown subcommand '{}', expected 'periodic' or 'command'", other),
        };

        let mut cli = Self {
            mode,
            program: String::new(),
            program_args: Vec::new(),
            verbose: false,
            log_file: None,
            log_level: "info".to_string(),
            threads: 12,
            error_type: ErrorType::BitFlip,
            pointer_error_rate: 0.0,
            non_pointer_error_rate: 0.0,
            error_limit: usize::MAX,
            error_seed: 0,
            interval_ms: 1000,
            initial_delay_ms: 1000,
            max_iterations: None,
        };

        let mut i = 2;
        while i < args.len() {
            // Once the program is known, everything left is forwarded to it.
            if !cli.program.is_empty() {
                cli.program_args.push(args[i].clone());
                i += 1;
                continue;
            }

            match args[i].as_str() {
                "-v" | "--verbose" => {
                    cli.verbose = true;
                }
                "-l" | "--log-file" => {
                    i += 1;
                    cli.log_file = Some(PathBuf::from(Self::value(&args, i, "--log-file")?));
                }
                "--log-level" => {
                    i += 1;
                    let level = Self::value(&args, i, "--log-level")?;
                    match level {
                        "trace" | "debug" | "info" | "warn" | "error" | "critical" => {
                            cli.log_level = level.to_string();
                        }
                        other => bail!("unknown log level '{}'", other),
                    }
                }
                "--threads" => {
                    i += 1;
                    let threads = usize::from_str(Self::value(&args, i, "--threads")?)
                        .context("invalid thread count")?;
                    if !(1..=256).contains(&threads) {
                        bail!("--threads must be in [1, 256]");
                    }
                    cli.threads = threads;
                }
                "--error-type" => {
                    i += 1;
                    cli.error_type = match Self::value(&args, i, "--error-type")? {
                        "bitflip" => ErrorType::BitFlip,
                        "zero" => ErrorType::StuckAtZero,
                        "one" => ErrorType::StuckAtOne,
                        other => bail!("unknown error type '{}'", other),
                    };
                }
                "--pointer-error-rate" => {
                    i += 1;
                    cli.pointer_error_rate =
                        Self::parse_rate(Self::value(&args, i, "--pointer-error-rate")?)?;
                }
                "--non-pointer-error-rate" => {
                    i += 1;
                    cli.non_pointer_error_rate =
                        Self::parse_rate(Self::value(&args, i, "--non-pointer-error-rate")?)?;
                }
                "--error-limit" => {
                    i += 1;
                    cli.error_limit = usize::from_str(Self::value(&args, i, "--error-limit")?)
                        .context("invalid error limit")?;
                }
                "--error-seed" => {
                    i += 1;
                    cli.error_seed = u64::from_str(Self::value(&args, i, "--error-seed")?)
                        .context("invalid error seed")?;
                }
                "-i" | "--interval" => {
                    i += 1;
                    cli.interval_ms = u64::from_str(Self::value(&args, i, "--interval")?)
                        .context("invalid interval")?;
                }
                "-d" | "--delay" => {
                    i += 1;
                    cli.initial_delay_ms = u64::from_str(Self::value(&args, i, "--delay")?)
                        .context("invalid delay")?;
                }
                "--max-iterations" => {
                    i += 1;
                    cli.max_iterations = Some(
                        u64::from_str(Self::value(&args, i, "--max-iterations")?)
                            .context("invalid iteration limit")?,
                    );
                }
                "-h" | "--help" => {
                    Self::print_help();
                    std::process::exit(0);
                }
                other if other.starts_with('-') => {
                    bail!("unknown option '{}' (use --help for usage)", other);
                }
                program => {
                    cli.program = program.to_string();
                }
            }
            i += 1;
        }

        if cli.program.is_empty() {
            bail!("no program to monitor was given (use --help for usage)");
        }

        Ok(cli)
    }

    fn value<'a>(args: &'a [String], i: usize, option: &str) -> Result<&'a str> {
        args.get(i)
            .map(String::as_str)
            .with_context(|| format!("{} requires a value", option))
    }

    fn parse_rate(raw: &str) -> Result<f64> {
        let rate = f64::from_str(raw).context("invalid rate")?;
        if !(0.0..=1.0).contains(&rate) {
            bail!("rates must be in [0.0, 1.0]");
        }
        Ok(rate)
    }

    fn print_help() {
        println!("Process memory monitor and fault injector");
        println!();
        println!("Usage: fim-cli <periodic|command> [OPTIONS] PROGRAM [ARGS...]");
        println!();
        println!("Subcommands:");
        println!("  periodic                     Scan the child on a fixed interval");
        println!("  command                      Service scan/checkpoint requests from the child");
        println!();
        println!("Common options:");
        println!("  -v, --verbose                Keep logging on stderr");
        println!("  -l, --log-file PATH          Write the log to PATH (default: fim.log)");
        println!("      --log-level LEVEL        trace|debug|info|warn|error|critical (default: info)");
        println!("      --threads N              Scanner threads, 1-256 (default: 12)");
        println!("      --error-type TYPE        bitflip|zero|one (default: bitflip)");
        println!("      --pointer-error-rate R   Injection rate for pointer words, 0-1 (default: 0)");
        println!("      --non-pointer-error-rate R");
        println!("                               Injection rate for other words, 0-1 (default: 0)");
        println!("      --error-limit N          Maximum injected errors (default: unlimited)");
        println!("      --error-seed SEED        RNG seed, 0 draws one from the clock (default: 0)");
        println!();
        println!("Periodic options:");
        println!("  -i, --interval MS            Scan interval in milliseconds (default: 1000)");
        println!("  -d, --delay MS               Delay before the first scan (default: 1000)");
        println!("      --max-iterations N       Stop after N scans");
        println!();
        println!("Everything after PROGRAM is forwarded to it unchanged.");
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    // "critical" comes from the option grammar; the log facade tops out at
    // error, which subsumes it.
    let filter = match cli.log_level.as_str() {
        "critical" => "error",
        other => other,
    };

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter));

    // env_logger drives a single sink: an explicit --log-file wins, verbose
    // runs keep stderr, and everything else lands in the default log file.
    let target = match (&cli.log_file, cli.verbose) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => None,
        (None, false) => Some(PathBuf::from("fim.log")),
    };
    if let Some(path) = target {
        let file = std::fs::File::create(&path)
            .with_context(|| format!("failed to create log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn run() -> Result<()> {
    let cli = Cli::parse()?;
    init_logging(&cli)?;

    // The request handler must be in place before the child can race us
    // with its first command; the child pid is published right after the
    // spawn.
    channel::install_monitor_handlers().context("failed to install signal handlers")?;

    let mut child = Command::new(&cli.program)
        .args(&cli.program_args)
        .spawn()
        .with_context(|| format!("failed to execute {}", cli.program))?;
    let child_pid = child.id() as i32;
    channel::set_traced_child(child_pid);

    log::info!(
        "launched {} {} with pid {}",
        cli.program,
        cli.program_args.join(" "),
        child_pid
    );

    // Ctrl+C kills the child; the liveness poll then winds the loop down.
    ctrlc::set_handler(move || {
        let _ = kill(Pid::from_raw(child_pid), Signal::SIGKILL);
    })
    .context("failed to install Ctrl+C handler")?;

    let strategy = ErrorInjectionStrategy::new(
        cli.error_type,
        cli.pointer_error_rate,
        cli.non_pointer_error_rate,
        cli.error_limit,
        cli.error_seed,
    );
    let config = MonitorConfig {
        initial_delay: Duration::from_millis(cli.initial_delay_ms),
        interval: Duration::from_millis(cli.interval_ms),
        iteration_limit: cli.max_iterations,
    };

    let mut monitor =
        MonitorController::new(child_pid, strategy, cli.threads, cli.mode, config)?;
    if let Err(e) = monitor.start_monitoring() {
        // Not a setup failure: the monitor ran and then lost its target.
        log::error!("monitoring ended with error: {}", e);
    }

    log::info!("stopping child process");
    let _ = kill(Pid::from_raw(child_pid), Signal::SIGKILL);
    let _ = child.wait();
    log::info!("monitoring complete");

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("fim-cli: {:#}", e);
        std::process::exit(1);
    }
}
