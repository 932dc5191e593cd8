//! Shipyard - Entry Point
//!
//! Runs the control plane (admission API, status watcher, log ingester and
//! reverse proxy), a single build executor with `--build`, or a live log
//! tail with `--tail=<pattern>`.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use shipyard::app::build::run_build;
use shipyard::app::options::AppOptions;
use shipyard::app::run::run;
use shipyard::deploy::config::BuildEnv;
use shipyard::logs::{init_logging, LogOptions};
use shipyard::storage::settings::Settings;
use shipyard::tail;
use shipyard::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Unable to print version: {e}"),
        }
        return;
    }

    // Build executor: configured from the environment, exit code is the outcome
    if cli_args.contains_key("build") {
        let _guard = match init_logging(LogOptions::default()) {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Failed to initialize logging: {e}");
                None
            }
        };
        let code = match BuildEnv::from_env() {
            Ok(build_env) => match run_build(build_env).await {
                Ok(_) => 0,
                Err(e) => {
                    error!("Build failed: {e}");
                    1
                }
            },
            Err(e) => {
                error!("Invalid build environment: {e}");
                1
            }
        };
        std::process::exit(code);
    }

    // Live tail
    if let Some(pattern) = cli_args.get("tail") {
        let _guard = init_logging(LogOptions {
            log_level: shipyard::logs::LogLevel::Warn,
            ..Default::default()
        });
        let api = cli_args
            .get("api")
            .cloned()
            .unwrap_or_else(|| "http://127.0.0.1:8000".to_string());
        if let Err(e) = tail::run(&api, pattern, Box::pin(await_shutdown_signal())).await {
            eprintln!("Live tail failed: {e}");
            std::process::exit(1);
        }
        return;
    }

    // Run the control plane starting here

    // Retrieve the settings file
    let config_path = cli_args.get("config").map(PathBuf::from);
    let settings = match Settings::load(config_path.as_deref()).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings file: {e}");
            std::process::exit(1);
        }
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
        json_format: settings.log_json,
        ..Default::default()
    };
    let _guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = AppOptions::from_settings(&settings);

    info!("Running Shipyard {} with options: {:?}", version.version, options);
    if let Err(e) = run(options, await_shutdown_signal()).await {
        error!("Failed to run Shipyard: {e}");
        std::process::exit(1);
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Unable to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
