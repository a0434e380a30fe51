use std::io::{self, BufWriter, Write};
use anyhow::Result;
use clap::ArgMatches;
use crate::spider::job::{feed_csv, feed_ndjson};
use crate::args::opt;

/// Normalise a target list: read NDJSON or CSV from stdin, de-duplicate
/// targets, optionally force a destination port, write NDJSON.
pub fn run(args: &ArgMatches) -> Result<()> {
    let dp: Option<u16> = opt(args.value_of("dp"))?;
    let csv = args.is_present("csv-input");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut sink = BufWriter::new(stdout.lock());

    let emit = |mut job: crate::spider::Job| {
        if let Some(dp) = dp {
            job.dp = dp;
        }
        if let Ok(line) = serde_json::to_string(&job) {
            let _ = writeln!(sink, "{}", line);
        }
    };

    match csv {
        true  => feed_csv(stdin.lock(), emit)?,
        false => feed_ndjson(stdin.lock(), emit)?,
    };

    sink.flush()?;

    Ok(())
}
