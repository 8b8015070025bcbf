//! The `rtk-controller` daemon.
//!
//! Exit codes: 0 on a clean shutdown, 1 for configuration errors,
//! 2 when the broker cannot be reached, 3 for runtime failures.

use clap::Parser;
use rtk_controller::config::ControllerConfig;
use rtk_controller::config::LogFormat;
use rtk_controller::config::LogOutput;
use rtk_controller::config::LoggingSection;
use rtk_controller::controller::Controller;
use rtk_controller::controller::RuntimeError;
use rtk_controller::plugin::PluginRegistry;
use rtk_api::schema::SchemaRegistry;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 1;
const EXIT_CONNECT: u8 = 2;
const EXIT_RUNTIME: u8 = 3;

#[derive(Parser)]
#[command(name = clap::crate_name!())]
#[command(version = clap::crate_version!())]
#[command(about = "MQTT diagnostic controller for RTK devices")]
struct Args {
    /// Path of the YAML configuration file.
    #[arg(long, short, default_value = "/etc/rtk/controller.yaml")]
    config: std::path::PathBuf,

    /// Force debug-level logging, whatever the configuration says.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match ControllerConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("rtk-controller: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if let Err(err) = init_logging(&config.logging, args.debug) {
        eprintln!("rtk-controller: cannot initialize logging: {err}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let controller = match Controller::new(
        config,
        SchemaRegistry::with_default_schemas(),
        builtin_plugins(),
    ) {
        Ok(controller) => controller,
        Err(err) => {
            error!("invalid configuration: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let running = match controller.connect().await {
        Ok(running) => running,
        Err(err @ RuntimeError::Connect(_)) => {
            error!("{err}");
            return ExitCode::from(EXIT_CONNECT);
        }
        Err(err) => {
            error!("{err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    match running.run_until(shutdown).await {
        Ok(()) => {
            info!("bye");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

/// The plugin types this build ships with. Deployments with local device
/// adapters extend this registry.
fn builtin_plugins() -> PluginRegistry {
    PluginRegistry::new()
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    error!("cannot listen for SIGTERM: {err}");
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
        shutdown.cancel();
    });
}

fn init_logging(logging: &LoggingSection, debug: bool) -> std::io::Result<()> {
    let level = if debug {
        "debug"
    } else {
        logging.level.as_filter()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let open_log_file = || -> std::io::Result<std::sync::Mutex<std::fs::File>> {
        let path = logging.file_path.as_ref().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "logging.output=file requires logging.file_path",
            )
        })?;
        // Rotation of this file is delegated to logrotate.
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(std::sync::Mutex::new(file))
    };

    let writer = match logging.output {
        LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogOutput::File => BoxMakeWriter::new(open_log_file()?),
        LogOutput::Both => BoxMakeWriter::new(std::io::stdout.and(open_log_file()?)),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}
