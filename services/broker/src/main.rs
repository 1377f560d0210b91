// broker: Central message bus for the backend services.
//
// Routes length-prefixed JSON envelopes between registered services over
// persistent TCP connections.

use broker::{Broker, BrokerConfig};
use clap::{Arg, ArgAction, Command};
use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriterExt;

fn validate_port_value(value: &str) -> Result<u16, String> {
    value
        .parse::<u16>()
        .map_err(|_| "Invalid port number".to_owned())
}

/// Console logging, with an optional file sink when `LOG_DIR` is set.
/// Filter precedence: `--verbose`, then `LOG_LEVEL`, then `RUST_LOG`.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
            .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    let log_file = std::env::var("LOG_DIR").ok().and_then(|dir| {
        std::fs::create_dir_all(&dir).ok()?;
        let name = format!("medibus_{}.log", chrono::Utc::now().format("%Y%m%d"));
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(std::path::Path::new(&dir).join(name))
            .ok()
    });

    match log_file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::io::stdout.and(std::sync::Arc::new(file)))
            .init(),
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() {
    let defaults = BrokerConfig::from_env();
    let matches = Command::new("medibus broker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Message bus broker for the backend services")
        .arg(
            Arg::new("host")
                .help("Address to bind the listener to")
                .long("host")
                .default_value(defaults.host.clone()),
        )
        .arg(
            Arg::new("port")
                .help("Port to bind the listener to")
                .short('p')
                .long("port")
                .value_parser(validate_port_value)
                .default_value(defaults.port.to_string()),
        )
        .arg(
            Arg::new("verbose")
                .help("Enable debug logging")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    init_tracing(matches.get_flag("verbose"));

    let cfg = BrokerConfig {
        host: matches
            .get_one::<String>("host")
            .expect("host has a default")
            .clone(),
        port: *matches.get_one::<u16>("port").expect("port has a default"),
        ..defaults
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %cfg.host,
        port = cfg.port,
        "broker starting"
    );

    let broker = match Broker::bind(cfg).await {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };

    let handle = broker.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            handle.shutdown();
        }
    });

    broker.run().await;
    info!("broker stopped");
}
