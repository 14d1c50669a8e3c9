//! mqpeek - a minimal MQTT 3.1.1 debug broker.

mod client;
mod config;
mod error;
mod packet;
mod server;
mod subscription;
mod util;

use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Local;
use clap::Parser;
use log::error;

use crate::config::Config;
use crate::server::Server;

#[derive(Parser)]
#[command(name = "mqpeek")]
#[command(about = "A minimal MQTT 3.1.1 debug broker for observing embedded clients")]
struct CommandLine {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// TCP port to listen on
    #[arg(long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Maximum concurrent client sessions
    #[arg(long, default_value_t = config::DEFAULT_MAX_CLIENTS)]
    max_clients: usize,

    /// Dump every received frame as hex
    #[arg(long)]
    log_raw: bool,

    /// Render publish payloads as UTF-8 in log lines
    #[arg(long)]
    log_payload: bool,

    /// Prefix log lines with a timestamp
    #[arg(long)]
    timestamp: bool,

    /// Deliver publications back to their publisher when subscribed
    #[arg(long)]
    reflect: bool,

    /// Close the session on any malformed frame
    #[arg(long)]
    disconnect_on_error: bool,

    /// Sleep this many milliseconds before answering CONNECT
    #[arg(long, default_value_t = 0)]
    connect_delay_ms: u64,

    /// Suppress non-error log output
    #[arg(long, short)]
    quiet: bool,
}

impl CommandLine {
    fn into_config(self) -> Config {
        Config {
            bind: SocketAddr::new(self.host, self.port),
            max_clients: self.max_clients,
            log_raw: self.log_raw,
            log_payload: self.log_payload,
            timestamp: self.timestamp,
            reflect: self.reflect,
            disconnect_on_error: self.disconnect_on_error,
            connect_delay: Duration::from_millis(self.connect_delay_ms),
            quiet: self.quiet,
        }
    }
}

fn init_logger(config: &Config) {
    let default_filter = if config.quiet { "error" } else { "info" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter));
    if config.timestamp {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        });
    } else {
        builder.format_timestamp(None);
    }
    builder.init();
}

fn main() {
    let commandline = CommandLine::parse();
    let config = commandline.into_config();

    init_logger(&config);

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    let stop = server.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed)) {
        error!("Failed to install signal handler: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
