//! The broker binary: bind, register queues, serve.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use hematite::broker::{Broker, BrokerOptions};
use hematite::terminus::QueueOptions;

#[derive(Debug, Parser)]
#[command(name = "hematite-broker", about = "AMQP 1.0 message broker")]
struct Args {
    /// Interface to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind
    #[arg(long, default_value_t = 5672)]
    port: u16,

    /// Require SASL authentication before AMQP
    #[arg(long)]
    auth: bool,

    /// Mechanisms to offer when --auth is set
    #[arg(long, value_delimiter = ',', default_value = "ANONYMOUS")]
    mechanisms: Vec<String>,

    /// `user:password` lines for the PLAIN mechanism
    #[arg(long)]
    passwords_file: Option<PathBuf>,

    /// Queue addresses to create at startup
    #[arg(long = "queue")]
    queues: Vec<String>,

    /// Container id; a random one is generated when absent
    #[arg(long)]
    container_id: Option<String>,
}

fn read_passwords(path: &PathBuf) -> Result<HashMap<String, String>, std::io::Error> {
    let mut passwords = HashMap::new();
    for line in std::fs::read_to_string(path)?.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((user, pass)) = line.split_once(':') {
            passwords.insert(user.to_string(), pass.to_string());
        }
    }
    Ok(passwords)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hematite=debug")),
        )
        .init();

    let args = Args::parse();

    let passwords = match &args.passwords_file {
        Some(path) => match read_passwords(path) {
            Ok(passwords) => passwords,
            Err(err) => {
                eprintln!("cannot read {}: {err}", path.display());
                return ExitCode::from(2);
            }
        },
        None => HashMap::new(),
    };

    let container_id = args
        .container_id
        .unwrap_or_else(|| format!("hematite-{}", uuid::Uuid::new_v4()));
    let broker = Broker::new(container_id).with_options(BrokerOptions {
        host: args.host,
        port: args.port,
        auth: args.auth,
        mechanisms: args.mechanisms,
        passwords,
        ..Default::default()
    });
    for address in &args.queues {
        broker.add_queue(address.clone(), QueueOptions::work_queue());
    }

    tokio::select! {
        result = broker.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("{err}");
                ExitCode::from(2)
            }
        },
        _ = tokio::signal::ctrl_c() => ExitCode::SUCCESS,
    }
}
