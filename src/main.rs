use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use flexi_logger::{
    Age, Cleanup, Criterion, Duplicate, FileSpec, LogSpecification, Logger, LoggerHandle, Naming,
};
use futures::StreamExt;
use log::{error, info};
use matshell::{
    bar,
    config::{self, get_config},
    outputs::Outputs,
    reactive::NextTick,
    services::compositor::detect,
    toolkit::Toolkit,
};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::{path::PathBuf, process::ExitCode, rc::Rc};
use tokio::task::LocalSet;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, value_parser = clap::value_parser!(PathBuf))]
    config_path: Option<PathBuf>,

    /// Raise the log level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn log_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("matshell")
}

fn log_spec(verbose: u8, configured: &str) -> LogSpecification {
    match verbose {
        0 => LogSpecification::parse(configured).unwrap_or_else(|_| LogSpecification::warn()),
        1 => LogSpecification::info(),
        2 => LogSpecification::debug(),
        _ => LogSpecification::trace(),
    }
}

fn start_logger(verbose: u8) -> Result<LoggerHandle> {
    Logger::with(log_spec(verbose, "warn"))
        .log_to_file(FileSpec::default().directory(log_dir()))
        .duplicate_to_stderr(Duplicate::All)
        .rotate(
            Criterion::Age(Age::Day),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(7),
        )
        .start()
        .context("Failed to start the logger")
}

fn main() -> ExitCode {
    let args = Args::parse();

    let logger = match start_logger(args.verbose) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let (config, config_path) = match get_config(args.config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };
    logger.set_new_spec(log_spec(args.verbose, &config.log_level));
    info!("Using config {}", config_path.display());

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start the runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match LocalSet::new().block_on(&runtime, run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: config::Config) -> Result<()> {
    let compositor = detect(config.compositor)?;
    let toolkit = Toolkit::connect()?;

    let outputs = Outputs::new(
        toolkit.clone(),
        bar::builder(
            &toolkit,
            compositor.workspaces(),
            config.bar.clone(),
            config.appearance.clone(),
        ),
        Rc::new(NextTick),
        config.outputs.clone(),
    );
    let _lifecycle = outputs.start(compositor.service());
    let _resync = toolkit.outputs_changed().connect({
        let outputs = outputs.clone();
        let monitors = compositor.monitors();
        move |_| outputs.sync(&monitors.get())
    });

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let signals_handle = signals.handle();

    let result = tokio::select! {
        result = compositor.listen() => {
            result.with_context(|| format!("Lost the connection to {}", compositor.name()))
        }
        result = toolkit.run() => result.context("Lost the toolkit connection"),
        Some(signal) = signals.next() => {
            info!("Received signal {signal}, shutting down");
            Ok(())
        }
    };
    signals_handle.close();

    outputs.detach_all();
    while outputs.has_entries() {
        tokio::task::yield_now().await;
    }
    toolkit.flush();

    result
}
