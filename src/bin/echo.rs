use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{value_parser, Arg, Command};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wirestack::client::TransportClient;

fn node_arg() -> Arg {
    Arg::new("node")
        .long("node")
        .required(true)
        .help("Application socket of the local node")
        .value_parser(value_parser!(PathBuf))
}

fn port_arg() -> Arg {
    Arg::new("port")
        .long("port")
        .default_value("7")
        .value_parser(value_parser!(u16))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("wirestack-echo")
        .about("Line echo service over wirestack connections")
        .subcommand_required(true)
        .subcommand(
            Command::new("serve")
                .about("Echoes one line back to every client")
                .arg(node_arg())
                .arg(port_arg()),
        )
        .subcommand(
            Command::new("send")
                .about("Sends a line and prints the echo")
                .arg(node_arg())
                .arg(port_arg())
                .arg(
                    Arg::new("address")
                        .long("address")
                        .required(true)
                        .value_parser(value_parser!(Ipv4Addr)),
                )
                .arg(Arg::new("message").required(true)),
        )
        .get_matches();

    let Some((name, args)) = matches.subcommand() else {
        return ExitCode::FAILURE;
    };

    let (Some(node), Some(&port)) = (
        args.get_one::<PathBuf>("node"),
        args.get_one::<u16>("port"),
    ) else {
        return ExitCode::FAILURE;
    };

    let result = match name {
        "serve" => serve(node, port),
        _ => match (
            args.get_one::<Ipv4Addr>("address"),
            args.get_one::<String>("message"),
        ) {
            (Some(&address), Some(message)) => send(node, port, address, message),
            _ => return ExitCode::FAILURE,
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "echo failed");
            ExitCode::FAILURE
        }
    }
}

fn serve(node: &Path, port: u16) -> wirestack::Result<()> {
    let mut client = TransportClient::connect(node)?;

    client.listen(port)?;

    info!(port, "serving");

    loop {
        let accepted = client.accept(port)?;

        info!(address = %accepted.address, port = accepted.port, "client connected");

        let mut line = Vec::new();

        while !line.contains(&b'\n') {
            let chunk = client.recv(accepted.socket, u16::MAX)?;

            if chunk.is_empty() {
                break;
            }

            line.extend_from_slice(&chunk);
        }

        client.send_all(accepted.socket, &line)?;
        client.close(accepted.socket)?;
    }
}

fn send(node: &Path, port: u16, address: Ipv4Addr, message: &str) -> wirestack::Result<()> {
    let mut client = TransportClient::connect(node)?;

    let socket = client.connect_to(address, port)?;

    client.send_all(socket, format!("{}\n", message).as_bytes())?;

    let echo = client.recv_to_end(socket)?;
    client.close(socket)?;

    println!("{}", String::from_utf8_lossy(&echo).trim_end());

    Ok(())
}
