// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::process::{ExitCode, exit};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing::metadata::LevelFilter;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use logtail::error::BoxError;
use logtail::init::agent::Agent;
use logtail::init::args::AgentRun;
use logtail::init::wait;

// Used when daemonized
static WORKING_DIR: &str = "/";

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Run agent
    Start(Box<AgentRun>),

    /// Return version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "logtail")]
#[command(bin_name = "logtail")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "LOGTAIL_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", get_version())
        }
        Some(Commands::Start(agent)) => {
            if agent.daemon {
                unsafe {
                    if check_logtail_active(&agent.pid_file) {
                        return ExitCode::SUCCESS;
                    }
                }
                match daemonize(&agent.pid_file, &agent.log_file) {
                    Ok(Some(exitcode)) => return exitcode,
                    Err(e) => {
                        eprintln!("ERROR: failed to daemonize: {:?}", e);
                        return ExitCode::from(1);
                    }
                    _ => {}
                }
            }

            let _guard = match setup_logging(&opt.log_format) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };

            match run_agent(agent) {
                Ok(_) => {}
                Err(e) => {
                    error!(error = e, "Failed to run agent.");
                    return ExitCode::from(1);
                }
            }
        }
        _ => {
            // it shouldn't be possible to get here since we mark a subcommand
            // as required
            error!("Must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run_agent(agent_args: Box<AgentRun>) -> Result<(), BoxError> {
    let mut agent_join_set: JoinSet<Result<(), BoxError>> = JoinSet::new();
    let shutdown_timeout = agent_args.shutdown_timeout;

    let cancel_token = CancellationToken::new();
    {
        let token = cancel_token.clone();
        agent_join_set.spawn(async move {
            let agent = Agent::new(*agent_args);
            agent.run(token).await
        });
    }

    loop {
        select! {
            _ = signal_wait() => {
                info!("Shutdown signal received.");
                cancel_token.cancel();
                break;
            },
            e = wait::wait_for_any_task(&mut agent_join_set) => {
                match e {
                    Ok(()) => info!("Agent finished."),
                    Err(e) => return Err(e),
                }
                return Ok(());
            },
        }
    }

    // The agent enforces its own shutdown timeout while draining; this outer
    // deadline only guards against it wedging entirely.
    wait::wait_for_tasks_with_timeout(&mut agent_join_set, shutdown_timeout + Duration::from_secs(5))
        .await?;

    Ok(())
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_format: &LogFormatArg) -> Result<LoggerGuard, BoxError> {
    LogTracer::init().expect("Unable to setup log tracer!");

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    } else {
        use std::io;
        use std::io::IsTerminal;

        // Skip color codes when not in a terminal
        let use_ansi = io::stdout().is_terminal();

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(file_layer);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    }
    Ok(guard)
}

fn daemonize(pid_file: &String, log_file: &String) -> Result<Option<ExitCode>, Box<dyn Error>> {
    // Do not use tracing logging functions in here, it is not setup until
    // after we daemonize
    let stdout_file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(log_file)
        .map_err(|e| format!("failed to open log file: {}: {}", log_file, e))?;
    let stderr_file = stdout_file.try_clone()?;

    let daemonize = daemonize::Daemonize::new()
        .pid_file(pid_file)
        .working_directory(WORKING_DIR)
        .stdout(stdout_file)
        .stderr(stderr_file);

    match daemonize.start() {
        Ok(_) => Ok(None),
        Err(e) => match e.kind {
            daemonize::ErrorKind::LockPidfile(_) => {
                println!(
                    "Detected existing agent running, if not remove: {}",
                    pid_file
                );
                Ok(Some(ExitCode::SUCCESS))
            }
            _ => Err(e.into()),
        },
    }
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}

// Check the lock status of the PID file to see if another instance is
// already running.
unsafe fn check_logtail_active(pid_path: &String) -> bool {
    fn string_to_cstring(path: &String) -> Result<CString, Box<dyn Error>> {
        CString::new(path.clone()).map_err(|e| format!("path contains null: {e}").into())
    }
    let path_c = match string_to_cstring(pid_path) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("PID path string is invalid: {e}");
            exit(1);
        }
    };

    let ret = unwrap_errno(unsafe { libc::open(path_c.as_ptr(), libc::O_RDONLY, 0o666) });
    if ret.0 < 0 {
        return false;
    }

    let ret = unwrap_errno(unsafe { libc::flock(ret.0, libc::LOCK_EX | libc::LOCK_NB) });

    // Close the original file descriptor
    unsafe { libc::close(ret.0) };

    if ret.0 != 0 {
        // Unknown error from flock
        if ret.1 != 11 {
            eprintln!("Unknown error from pid file check: {}", ret.1)
        }
        // Treat this as if we are running
        return true;
    }

    false
}

type LibcRet = libc::c_int;
type Errno = libc::c_int;
fn unwrap_errno(ret: LibcRet) -> (LibcRet, Errno) {
    if ret >= 0 {
        return (ret, 0);
    }

    let errno = std::io::Error::last_os_error()
        .raw_os_error()
        .expect("errno");
    (ret, errno)
}

async fn signal_wait() {
    let mut sig_term = sig(SignalKind::terminate());
    let mut sig_int = sig(SignalKind::interrupt());

    select! {
        _ = sig_term.recv() => {},
        _ = sig_int.recv() => {},
    }
}

fn sig(kind: SignalKind) -> tokio::signal::unix::Signal {
    signal(kind).unwrap()
}
