use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{value_parser, Arg, Command};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, trace};
use tracing_subscriber::EnvFilter;

use wirestack::socket::{StreamEvent, StreamSet};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("wirestack-wire")
        .about("Relays bytes written by any attached node to every other attached node")
        .arg(
            Arg::new("path")
                .required(true)
                .help("Path to listen on for nodes")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("corrupt")
                .long("corrupt")
                .default_value("0.0")
                .help("Probability of flipping one bit in each relayed chunk")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .default_value("0")
                .value_parser(value_parser!(u64)),
        )
        .get_matches();

    let (Some(path), Some(&corrupt), Some(&seed)) = (
        matches.get_one::<PathBuf>("path"),
        matches.get_one::<f64>("corrupt"),
        matches.get_one::<u64>("seed"),
    ) else {
        return ExitCode::FAILURE;
    };

    if !(0.0..=1.0).contains(&corrupt) {
        error!(corrupt, "corruption probability must be within [0, 1]");
        return ExitCode::FAILURE;
    }

    match run(path, corrupt, seed) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "wire failed");
            ExitCode::FAILURE
        }
    }
}

fn run(path: &Path, corrupt: f64, seed: u64) -> std::io::Result<()> {
    let mut streams = StreamSet::new()?;
    streams.listen(path)?;

    let mut rng = StdRng::seed_from_u64(seed);

    info!(path = %path.display(), "wire up");

    loop {
        for event in streams.wait(None)? {
            match event {
                StreamEvent::Accepted(key) => info!(key, "node attached"),
                StreamEvent::Closed(key) => info!(key, "node detached"),
                StreamEvent::Data(source, mut bytes) => {
                    if !bytes.is_empty() && rng.gen_bool(corrupt) {
                        let index = rng.gen_range(0..bytes.len());
                        bytes[index] ^= 1 << rng.gen_range(0..8);
                        debug!(source, index, "corrupted relayed bytes");
                    }

                    let targets: Vec<usize> = streams.keys().filter(|&key| key != source).collect();

                    trace!(source, len = bytes.len(), targets = targets.len(), "relaying");

                    for key in targets {
                        if let Err(err) = streams.send(key, &bytes) {
                            info!(key, %err, "node detached");
                        }
                    }
                }
            }
        }
    }
}
