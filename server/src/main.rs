use clap::Parser;
use server::game::{GameServer, ServerConfig};
use shared::pakset::{PakTable, CHECKSUM_LEN};
use shared::sim::GridWorld;

/// Parses command-line arguments, builds the world, and hands control to
/// the single-threaded frame loop.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "13353")]
        port: u16,
        /// Milliseconds of real time per simulated step
        #[clap(short, long, default_value = "100")]
        frame_ms: u64,
        /// Sync steps between two checklist broadcasts
        #[clap(long, default_value = "16")]
        check_interval: u32,
        /// Maximum number of concurrent clients
        #[clap(short, long, default_value = "16")]
        max_clients: usize,
        /// Administrator password; the service channel stays disabled
        /// without one
        #[clap(long)]
        admin_password: Option<String>,
        /// Pakset identity announced to clients
        #[clap(long, default_value = "pak128")]
        pakset: String,
        /// World edge length in tiles
        #[clap(long, default_value = "256")]
        map_size: u16,
    }

    env_logger::init();
    let args = Args::parse();

    let world = GridWorld::new(&args.pakset, args.map_size, args.map_size);

    // A placeholder fingerprint table keyed off the pakset name; a real
    // deployment feeds the installed addon checksums in here.
    let mut paks = PakTable::new();
    let mut checksum = [0u8; CHECKSUM_LEN];
    for (i, b) in args.pakset.bytes().take(CHECKSUM_LEN).enumerate() {
        checksum[i] = b;
    }
    paks.insert(&args.pakset, checksum);

    let config = ServerConfig {
        address: format!("{}:{}", args.host, args.port),
        admin_password: args.admin_password,
        frame_ms: args.frame_ms,
        sync_check_interval: args.check_interval,
        max_clients: args.max_clients,
    };

    let mut game = GameServer::new(config, Box::new(world), paks)?;
    game.run();
    Ok(())
}
