//! Wireless Broadcast Link Daemon Binary
//!
//! Entry point for the wb-link daemon. Sets up logging, parses the
//! command line, constructs a link controller for the requested role and
//! runs until interrupted. Without real monitor-mode hardware attached,
//! an emulated radio pair keeps the whole engine exercisable on a desk.

use clap::{Arg, Command};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wb_link::actions::LinkContext;
use wb_link::controller::{LinkConfig, LinkController, LinkRole};
use wb_link::radio::{EmulatedRadio, RadioSet, WifiCard};
use wb_link::{LinkError, Result};

/// Default settings directory
const DEFAULT_SETTINGS_DIR: &str = "/etc/wb-link";

fn main() -> Result<()> {
    let matches = Command::new("wb-linkd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Wireless broadcast link management daemon")
        .arg(
            Arg::new("role")
                .short('r')
                .long("role")
                .value_name("ROLE")
                .help("Unit role: air or ground")
                .required(true),
        )
        .arg(
            Arg::new("settings-dir")
                .short('s')
                .long("settings-dir")
                .value_name("DIR")
                .help("Directory for persisted settings")
                .default_value(DEFAULT_SETTINGS_DIR),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if matches.get_flag("verbose") && std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "debug");
    }
    wb_link::init_logging();

    let role = match matches.get_one::<String>("role").map(String::as_str) {
        Some("air") => LinkRole::Air,
        Some("ground") => LinkRole::Ground,
        other => {
            return Err(LinkError::Config(format!(
                "invalid role {:?}, expected air or ground",
                other
            )))
        }
    };
    let settings_dir = matches
        .get_one::<String>("settings-dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_DIR));

    log::info!("wb-linkd {} starting as {} unit", env!("CARGO_PKG_VERSION"), role.name());

    // Emulated radio pair: the local end drives the controller, the
    // remote end is kept alive so the loopback stays connected.
    let (local, _remote) = EmulatedRadio::new_pair();
    let radios = RadioSet::new(vec![WifiCard::emulated("emu0")])?;
    let context = LinkContext::new();
    let controller = LinkController::new(
        LinkConfig::new(role, settings_dir),
        radios,
        local,
        context.clone(),
    )?;

    // signal_hook raises the flag on SIGINT / SIGTERM
    let shutdown = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, shutdown.clone())
            .map_err(|e| LinkError::Config(format!("cannot install signal handler: {}", e)))?;
    }

    while !shutdown.load(Ordering::SeqCst) {
        if context.fatal.is_raised() {
            log::error!(
                "giving up: {}",
                context.fatal.message().unwrap_or_else(|| "unknown".to_string())
            );
            break;
        }
        let stats = controller.stats();
        log::debug!(
            "stats: {} MHz / {} MHz width, mcs {}, video {} kbit/s, foreign pps {}",
            stats.curr_frequency_mhz,
            stats.curr_channel_width_mhz,
            stats.curr_mcs_index,
            stats.curr_video_rate_kbits,
            stats.foreign_packets_per_second
        );
        std::thread::sleep(Duration::from_secs(1));
    }

    drop(controller);
    log::info!("wb-linkd stopped");
    Ok(())
}
