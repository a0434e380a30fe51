use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use crossbeam_channel::bounded;
use log::{debug, info, warn};
use crate::chains;
use crate::observer::{open_uri, run_enqueuer, Chain, Observer};
use crate::spider::{FlowMsg, QUEUE_SIZE};

/// Run the observer standalone: capture, aggregate into flows, write
/// one JSON record per flow. Useful for debugging chains without a
/// measurement around them.
pub fn run(args: &ArgMatches, interrupt: Arc<AtomicBool>) -> Result<()> {
    if args.is_present("list-chains") {
        for name in chains::NAMES.iter() {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut chosen: Vec<Box<dyn Chain>> = Vec::new();
    match args.values_of("chains") {
        Some(names) => {
            for name in names {
                match chains::by_name(name) {
                    Some(chain) => chosen.push(chain),
                    None        => return Err(anyhow!(
                        "chain '{}' not found, try --list-chains", name)),
                }
            }
        }
        None => chosen.push(chains::by_name("basic").unwrap()),
    }

    let interface = args.value_of("interface").unwrap_or("eth0");
    let uri = match interface.contains(':') {
        true  => interface.to_owned(),
        false => format!("int:{}", interface),
    };

    info!("starting observer on {}", uri);

    let source = open_uri(&uri)?;
    let observer = Observer::new(chosen);

    let (tx, rx) = bounded(QUEUE_SIZE);
    let enqueuer = {
        let interrupt = interrupt.clone();
        thread::spawn(move || {
            if let Err(e) = run_enqueuer(observer, source, &tx, &interrupt) {
                warn!("observer stopped: {:?}", e);
            }
        })
    };

    let output = args.value_of("output").unwrap_or("/dev/stdout");
    let mut sink = BufWriter::new(File::create(output).context("unable to open output")?);
    info!("writing flows to {}", output);

    loop {
        match rx.recv() {
            Ok(FlowMsg::Flow(rec)) => {
                writeln!(sink, "{}", serde_json::to_string(&rec)?)?;
                debug!("wrote a flow");
            }
            Ok(FlowMsg::Shutdown) => {
                info!("output complete");
                break;
            }
            Err(_) => break,
        }
    }

    sink.flush()?;
    let _ = enqueuer.join();

    Ok(())
}
