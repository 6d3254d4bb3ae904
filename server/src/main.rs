//! Demo server binary running the sample cart simulation.

use clap::Parser;
use log::info;
use rand::Rng;
use server::network::SocketServerTransport;
use server::{Server, ServerConfig};
use shared::sample::{Drift, SampleGame};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Address to bind the TCP and UDP sockets to
    #[clap(short, long, default_value = "127.0.0.1:8080")]
    addr: String,
    /// Maximum absolute wind applied per tick
    #[clap(short, long, default_value = "2")]
    wind: i8,
    /// Omit state checksums from authoritative broadcasts
    #[clap(long)]
    no_checksum: bool,
}

/// Normalizes the wind flag so `-wind..=wind` is a valid range even for
/// negative values. `unsigned_abs` keeps `i8::MIN` from overflowing.
fn wind_amplitude(raw: i8) -> i8 {
    raw.unsigned_abs().min(i8::MAX as u8) as i8
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let transport = SocketServerTransport::listen(&args.addr).await?;

    let wind = wind_amplitude(args.wind);
    let config = ServerConfig::<SampleGame> {
        server_input: Box::new(move || Drift {
            wind: rand::thread_rng().gen_range(-wind..=wind),
        }),
        send_checksum: !args.no_checksum,
        ..ServerConfig::default()
    };

    let server = Server::new(config, transport);
    server.start()?;

    let waiter = server.clone();
    let session = tokio::task::spawn_blocking(move || waiter.wait());

    tokio::select! {
        _ = session => {
            info!("session ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            server.stop();
            server.wait();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wind_amplitude_clamps_to_valid_range() {
        assert_eq!(wind_amplitude(2), 2);
        assert_eq!(wind_amplitude(-3), 3);
        assert_eq!(wind_amplitude(0), 0);
        assert_eq!(wind_amplitude(i8::MIN), i8::MAX);
    }
}
