//! Demo client binary driving a cart in the sample simulation.

use clap::Parser;
use client::network::SocketClientTransport;
use client::{Client, ClientConfig};
use log::info;
use shared::sample::{SampleGame, Thrust};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address to connect to
    #[clap(short, long, default_value = "127.0.0.1:8080")]
    addr: String,
    /// Thrust amplitude of the scripted driver
    #[clap(short = 'A', long, default_value = "3")]
    amplitude: i8,
    /// Skip checksum verification of authoritative frames
    #[clap(long)]
    no_verify: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let transport = SocketClientTransport::connect(&args.addr).await?;
    let local_id = transport.client_id();

    // Scripted driver: thrust one way, then the other, forever.
    let amplitude = args.amplitude;
    let mut step = 0u64;
    let config = ClientConfig::<SampleGame> {
        input_provider: Box::new(move || {
            step += 1;
            let accel = if (step / 60) % 2 == 0 { amplitude } else { -amplitude };
            Thrust { accel }
        }),
        on_frame: Box::new(move |frame, state| {
            if frame % 30 == 0 {
                if let Some(cart) = state.carts.get(&local_id) {
                    info!("frame {frame}: position {} velocity {}", cart.position, cart.velocity);
                }
            }
        }),
        verify_checksum: !args.no_verify,
        ..ClientConfig::default()
    };

    let client = Client::new(config, transport);

    let session = {
        let client = client.clone();
        tokio::task::spawn_blocking(move || client.run())
    };

    tokio::select! {
        result = session => {
            match result? {
                Ok(()) => info!("session ended"),
                Err(err) => return Err(err.into()),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, leaving session");
            client.stop();
        }
    }

    Ok(())
}
