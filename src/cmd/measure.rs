use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use anyhow::{anyhow, Context, Result};
use clap::{value_t, ArgMatches};
use crossbeam_channel::RecvTimeoutError;
use log::{info, warn};
use crate::plugins;
use crate::spider::job::{feed_csv, feed_ndjson};
use crate::spider::{OutMsg, Spider, QUEUE_SLEEP};

pub fn run(args: &ArgMatches, interrupt: Arc<AtomicBool>) -> Result<()> {
    let (name, plugin_args) = match args.subcommand() {
        (name, Some(sub)) if !name.is_empty() => (name, sub),
        _ => return Err(anyhow!("no plugin given, see --help for the list")),
    };

    let plugin = plugins::lookup(name, plugin_args)?;

    let interface = args.value_of("interface").unwrap_or("eth0");
    let uri = match interface.contains(':') {
        true  => interface.to_owned(),
        false => format!("int:{}", interface),
    };

    let workers = value_t!(args, "workers", usize)?;
    let input = args.value_of("input").unwrap_or("/dev/stdin").to_owned();
    let output = args.value_of("output").unwrap_or("/dev/stdout");
    let output_flows = args.is_present("output-flows");
    let csv = args.is_present("csv-input");

    info!("activating {} measurement", plugin.name());

    let spider = Arc::new(Spider::new(plugin.clone(), workers, &uri));
    spider.start()?;

    // The feeder owns the orderly shutdown: once the target list is
    // exhausted it waits for the spider to finish.
    let feeder = {
        let spider = spider.clone();
        thread::spawn(move || {
            let fed = File::open(&input)
                .map_err(anyhow::Error::from)
                .and_then(|file| {
                    let reader = BufReader::new(file);
                    match csv {
                        true  => feed_csv(reader, |job| spider.add_job(job)),
                        false => feed_ndjson(reader, |job| spider.add_job(job)),
                    }
                });

            if let Err(e) = fed {
                warn!("job feeder failed: {}", e);
            }

            spider.shutdown();
        })
    };

    let outputs = spider.outputs();
    let mut sink = BufWriter::new(File::create(output).context("unable to open output")?);
    info!("writing results to {}", output);

    let mut aggregated = Vec::new();
    let mut interrupted = false;

    loop {
        if interrupt.load(Ordering::Acquire) && !interrupted {
            interrupted = true;
            info!("interrupt received, shutting down");
            let spider = spider.clone();
            thread::spawn(move || spider.shutdown());
        }

        match outputs.recv_timeout(QUEUE_SLEEP) {
            Ok(OutMsg::Record(mut record)) => {
                if !output_flows {
                    if let Some(map) = record.as_object_mut() {
                        map.remove("flow_results");
                        map.remove("missed_flows");
                    }
                }
                writeln!(sink, "{}", record)?;
                if plugin.wants_aggregate() {
                    aggregated.push(record);
                }
            }
            Ok(OutMsg::Shutdown) => {
                info!("output complete");
                break;
            }
            Err(RecvTimeoutError::Timeout)      => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    sink.flush()?;

    // on interrupt the feeder may still be blocked reading the input;
    // it is abandoned rather than waited for
    if !interrupted {
        let _ = feeder.join();
    }

    if plugin.wants_aggregate() {
        plugin.aggregate(&aggregated);
    }

    if spider.failed() {
        return Err(anyhow!("measurement did not complete cleanly"));
    }

    Ok(())
}
