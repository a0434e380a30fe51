use anyhow::{anyhow, Result};
use clap::ArgMatches;
use crate::chains;
use crate::plugins;

/// Sanity checks over the built-in registries: every plugin must
/// resolve with default arguments, declare at least two variants and
/// attach the basic chain; every chain name must resolve. The full
/// unit suite lives in `cargo test`.
pub fn run() -> Result<()> {
    let defaults = ArgMatches::default();
    let mut failures = 0;

    for name in plugins::NAMES.iter() {
        match plugins::lookup(name, &defaults) {
            Ok(plugin) => {
                let mut problems = Vec::new();

                if plugin.count() < 2 {
                    problems.push("fewer than two configurations");
                }
                if plugin.chains().is_empty() {
                    problems.push("no observer chains");
                }
                if plugin.name() != *name {
                    problems.push("name mismatch");
                }

                match problems.is_empty() {
                    true  => println!("ok - plugin {}", name),
                    false => {
                        failures += 1;
                        println!("fail - plugin {}: {}", name, problems.join(", "));
                    }
                }
            }
            Err(e) => {
                failures += 1;
                println!("fail - plugin {}: {}", name, e);
            }
        }
    }

    for name in chains::NAMES.iter() {
        match chains::by_name(name) {
            Some(_) => println!("ok - chain {}", name),
            None    => {
                failures += 1;
                println!("fail - chain {}", name);
            }
        }
    }

    match failures {
        0 => Ok(()),
        n => Err(anyhow!("{} self checks failed", n)),
    }
}
