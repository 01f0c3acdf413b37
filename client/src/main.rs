mod network;

use clap::Parser;
use log::{error, info};
use shared::sim::GridWorld;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:13353")]
    server: String,

    /// Nickname to request (the server may assign another one)
    #[arg(short = 'n', long, default_value = "player")]
    nickname: String,

    /// Pakset identifier; must match the server's
    #[arg(long, default_value = "pak128")]
    pakset: String,

    /// Milliseconds per simulation frame; must match the server's pacing
    #[arg(long, default_value = "100")]
    frame_ms: u64,

    /// Only query the server's game summary, then exit
    #[arg(long)]
    probe: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    if args.probe {
        let info = network::Client::probe(&args.server)?;
        println!(
            "{}x{} map, {} clients, {} companies, population {}, pakset {}",
            info.size_x, info.size_y, info.clients, info.companies, info.population, info.pakset
        );
        return Ok(());
    }

    info!("Connecting to: {}", args.server);
    let world = Box::new(GridWorld::new(&args.pakset, 256, 256));
    let mut paks = shared::pakset::PakTable::new();
    let mut checksum = [0u8; shared::pakset::CHECKSUM_LEN];
    for (i, b) in args.pakset.bytes().enumerate().take(checksum.len()) {
        checksum[i] = b;
    }
    paks.insert(&args.pakset, checksum);

    let mut client = network::Client::connect(&args.server, &args.nickname, &paks, world)?;
    info!("playing as {} (client {})", client.nickname, client.client_id);

    let frame = Duration::from_millis(args.frame_ms);
    loop {
        let start = Instant::now();
        if let Err(e) = client.tick() {
            error!("leaving the game: {}", e);
            return Err(e);
        }
        for line in client.messages.drain(..) {
            println!("{}", line);
        }
        if let Some(remaining) = frame.checked_sub(start.elapsed()) {
            std::thread::sleep(remaining);
        }
    }
}
