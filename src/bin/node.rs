use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{value_parser, Arg, ArgAction, Command};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wirestack::epoch::Epoch;
use wirestack::link::LinkId;
use wirestack::node::{self, Output};
use wirestack::socket::{StreamEvent, StreamSet};
use wirestack::transport::AppId;
use wirestack::{MacAddress, Node};

static IDLE_TIMEOUT: Duration = Duration::from_millis(1000);

struct Options {
    mac: MacAddress,
    address: Ipv4Addr,
    app_socket: PathBuf,
    wires: Vec<PathBuf>,
    seed: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("wirestack-node")
        .about("Runs one host, attached to wire relays and serving local applications")
        .arg(
            Arg::new("mac")
                .long("mac")
                .required(true)
                .value_parser(value_parser!(MacAddress)),
        )
        .arg(
            Arg::new("ip")
                .long("ip")
                .required(true)
                .value_parser(value_parser!(Ipv4Addr)),
        )
        .arg(
            Arg::new("app-socket")
                .long("app-socket")
                .required(true)
                .help("Path to listen on for applications")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("wire")
                .long("wire")
                .action(ArgAction::Append)
                .help("Path of a wire relay to attach to; may be repeated")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .help("Seed for randomized timers and route selection; defaults to the MAC address")
                .value_parser(value_parser!(u64)),
        )
        .get_matches();

    let Some(&mac) = matches.get_one::<MacAddress>("mac") else {
        return ExitCode::FAILURE;
    };
    let Some(&address) = matches.get_one::<Ipv4Addr>("ip") else {
        return ExitCode::FAILURE;
    };
    let Some(app_socket) = matches.get_one::<PathBuf>("app-socket").cloned() else {
        return ExitCode::FAILURE;
    };

    let options = Options {
        mac,
        address,
        app_socket,
        wires: matches
            .get_many::<PathBuf>("wire")
            .map(|wires| wires.cloned().collect())
            .unwrap_or_default(),
        seed: matches
            .get_one::<u64>("seed")
            .copied()
            .unwrap_or(mac.to_u64()),
    };

    match run(options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "node failed");
            ExitCode::FAILURE
        }
    }
}

fn run(options: Options) -> wirestack::Result<()> {
    let epoch = Epoch::new();

    let mut node = Node::new(
        node::Config::default(),
        options.mac,
        options.address,
        options.seed,
    );

    let mut streams = StreamSet::new()?;
    streams.listen(&options.app_socket)?;

    // Stream keys of attached wires; every other stream is an application
    let mut links: HashMap<usize, LinkId> = HashMap::new();
    let mut link_keys: HashMap<LinkId, usize> = HashMap::new();

    for (index, path) in options.wires.iter().enumerate() {
        let key = streams.connect(path)?;
        let link = LinkId(index as u32);

        info!(%link, path = %path.display(), "attached to wire");

        links.insert(key, link);
        link_keys.insert(link, key);

        node.add_link(link, epoch.time_now_ms());
    }

    info!(path = %options.app_socket.display(), "accepting applications");

    loop {
        let now_ms = epoch.time_now_ms();

        node.handle_timers(now_ms);

        while let Some(output) = node.poll_output() {
            match output {
                Output::Wire { link, bytes } => {
                    let Some(&key) = link_keys.get(&link) else {
                        continue;
                    };

                    if let Err(err) = streams.send(key, &bytes) {
                        warn!(%link, %err, "wire failed");
                        links.remove(&key);
                        link_keys.remove(&link);
                        node.remove_link(link);
                    }
                }
                Output::App { app, bytes } => {
                    if let Err(err) = streams.send(app.0 as usize, &bytes) {
                        warn!(%app, %err, "application stream failed");
                        node.remove_app(app);
                    }
                }
            }
        }

        let timeout = match node.next_timer_time_ms() {
            Some(time_ms) => Duration::from_millis(time_ms.saturating_sub(now_ms)).min(IDLE_TIMEOUT),
            None => IDLE_TIMEOUT,
        };

        for event in streams.wait(Some(timeout))? {
            let now_ms = epoch.time_now_ms();

            match event {
                StreamEvent::Accepted(key) => {
                    node.add_app(AppId(key as u32));
                }
                StreamEvent::Data(key, bytes) => match links.get(&key) {
                    Some(&link) => node.handle_wire_bytes(link, &bytes, now_ms),
                    None => {
                        let app = AppId(key as u32);

                        if node.handle_app_bytes(app, &bytes, now_ms).is_err() {
                            streams.remove(key);
                        }
                    }
                },
                StreamEvent::Closed(key) => match links.remove(&key) {
                    Some(link) => {
                        warn!(%link, "wire closed");
                        link_keys.remove(&link);
                        node.remove_link(link);
                    }
                    None => node.remove_app(AppId(key as u32)),
                },
            }
        }
    }
}
