//! The worker binary: loads the TOML configuration, brings up logging and
//! the engine, and serves the default route surface until the process is
//! stopped. The master/supervisor side lives outside this program.

mod controllers;

use clap::{Arg, Command};
use ember::config::{ServerConfig, DEFAULT_CONFIG_PATH};
use ember::logging;
use std::path::Path;
use std::process;
use std::sync::{Arc, Mutex};

/// Shared secret guarding `/api/admin`. A deployment would feed this from
/// its secret store; the demo surface ships a fixed token.
const ADMIN_TOKEN: &str = "stoker-admin-token";

fn main() {
    let matches = Command::new("stoker")
        .version("0.1.0")
        .about("Runs one HTTP worker engine.")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Path to the TOML config file")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);

    // A missing file at the default path falls back to defaults so the
    // binary runs out of the box; an unreadable or malformed file is a
    // fatal initialization error.
    let config = if Path::new(config_path).exists() {
        match ServerConfig::load(config_path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("stoker: cannot load {}: {}", config_path, err);
                process::exit(1);
            }
        }
    } else if config_path == DEFAULT_CONFIG_PATH {
        ServerConfig::default()
    } else {
        eprintln!("stoker: config file {} not found", config_path);
        process::exit(1);
    };

    let log = logging::init(&config.log);
    logging::info!(log, "starting worker";
                   "config" => config_path,
                   "ports" => format!("{:?}", config.net.listen_ports),
                   "pool" => config.net.worker_connections,
                   "handler_threads" => config.proc.msg_recv_work_thread_count);

    let status: controllers::StatusCell = Arc::new(Mutex::new(None));
    let router = controllers::build_router(&log, status.clone(), ADMIN_TOKEN);

    let engine = match forge::Engine::start(&config, router, &log) {
        Ok(engine) => engine,
        Err(err) => {
            logging::crit!(log, "worker failed to start"; "error" => %err);
            eprintln!("stoker: {}", err);
            process::exit(1);
        }
    };
    *status.lock().unwrap() = Some(engine.stats_handle());

    logging::info!(log, "worker ready";
                   "addrs" => format!("{:?}", engine.local_addrs()));
    engine.wait();
}
