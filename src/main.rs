use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use anyhow::{anyhow, Result};
use clap::{App, load_yaml};
use env_logger::Builder;
use log::info;
use log::LevelFilter::*;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag::register;
use pathprobe::cmd;

fn main() -> Result<()> {
    let yaml = load_yaml!("args.yml");
    let ver  = env!("CARGO_PKG_VERSION");
    let args = App::from_yaml(&yaml).version(ver).get_matches();

    let (module, level) = match args.occurrences_of("verbose") {
        0 => (Some("pathprobe"), Info),
        1 => (Some("pathprobe"), Debug),
        2 => (Some("pathprobe"), Trace),
        _ => (None,              Trace),
    };
    Builder::from_default_env().filter(module, level).init();

    info!("initializing pathprobe {}", ver);

    let shutdown = Arc::new(AtomicBool::new(false));
    register(SIGTERM, shutdown.clone())?;
    register(SIGINT,  shutdown.clone())?;

    match args.subcommand() {
        ("measure", Some(args)) => cmd::measure::run(args, shutdown),
        ("observe", Some(args)) => cmd::observe::run(args, shutdown),
        ("filter",  Some(args)) => cmd::filter::run(args),
        ("test",    _)          => cmd::selftest::run(),
        _                       => Err(anyhow!("no command given, see --help")),
    }
}
