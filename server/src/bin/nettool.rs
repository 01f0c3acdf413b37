//! Lightweight administrative command-line tool. Speaks the same wire
//! protocol as a game client but only ever uses the service channel, so it
//! never joins the simulation.
//!
//! Exit codes: 0 success, 1 could not connect, 2 could not send the
//! request, 3 authentication or miscellaneous failure.

use clap::{Parser, Subcommand};
use log::debug;
use server::admin::svc;
use shared::command::{Command, Message, ServiceCmd};
use shared::packet::Packet;
use std::net::TcpStream;
use std::process::ExitCode;
use std::time::Duration;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[clap(author, version, about = "Administrative tool for a running game server")]
struct Args {
    /// Server address, host:port
    address: String,
    /// Administrator password
    #[clap(short, long, default_value = "")]
    password: String,
    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Ask the server to refresh its public listing (no password needed)
    Announce,
    /// List connected clients
    Clients,
    /// List banned address ranges
    Bans,
    /// Disconnect a client by id
    KickClient { id: u32 },
    /// Ban a connected client's address and disconnect it
    BanClient { id: u32 },
    /// Ban an address range (e.g. 203.0.113.0/24)
    Ban { range: String },
    /// Remove a banned address range
    Unban { range: String },
    /// Broadcast a message to all players
    Say { message: String },
    /// Ask the server to shut down
    ShutDown,
    /// Force an immediate resync of all participants
    ForceSync,
}

impl Cmd {
    fn request(&self) -> ServiceCmd {
        let (flag, number, text) = match self {
            Cmd::Announce => (svc::ANNOUNCE, 0, String::new()),
            Cmd::Clients => (svc::GET_CLIENT_LIST, 0, String::new()),
            Cmd::Bans => (svc::GET_BAN_LIST, 0, String::new()),
            Cmd::KickClient { id } => (svc::KICK_CLIENT, *id, String::new()),
            Cmd::BanClient { id } => (svc::BAN_IP, *id, String::new()),
            Cmd::Ban { range } => (svc::BAN_IP, 0, range.clone()),
            Cmd::Unban { range } => (svc::UNBAN_IP, 0, range.clone()),
            Cmd::Say { message } => (svc::ADMIN_MSG, 0, message.clone()),
            Cmd::ShutDown => (svc::SHUTDOWN, 0, String::new()),
            Cmd::ForceSync => (svc::FORCE_SYNC, 0, String::new()),
        };
        ServiceCmd { flag, number, text }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut stream = match TcpStream::connect(&args.address) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("could not connect to {}: {}", args.address, e);
            return ExitCode::from(1);
        }
    };

    // Log in first; every service operation except announce requires a
    // session.
    if !matches!(args.command, Cmd::Announce) {
        let login = ServiceCmd {
            flag: svc::LOGIN,
            number: 0,
            text: args.password.clone(),
        };
        match exchange(&mut stream, &login) {
            Ok(reply) if reply.number == 1 => debug!("logged in"),
            Ok(_) => {
                eprintln!("login refused (wrong password, or no admin password set)");
                return ExitCode::from(3);
            }
            Err(code) => return code,
        }
    }

    match exchange(&mut stream, &args.command.request()) {
        Ok(reply) if reply.number >= 1 => {
            if !reply.text.is_empty() {
                println!("{}", reply.text);
            }
            ExitCode::SUCCESS
        }
        Ok(reply) => {
            if reply.text.is_empty() {
                eprintln!("server refused the request");
            } else {
                eprintln!("server refused the request: {}", reply.text);
            }
            ExitCode::from(3)
        }
        Err(code) => code,
    }
}

/// Sends one service request and waits for the matching reply, skipping any
/// unrelated frames (broadcasts) that happen to arrive in between.
fn exchange(stream: &mut TcpStream, request: &ServiceCmd) -> Result<ServiceCmd, ExitCode> {
    let msg = Message::new(0, Command::Service(request.clone()));
    let mut pkt = msg.encode();
    if !pkt.send_blocking(stream, REPLY_TIMEOUT) {
        eprintln!("could not send the request");
        return Err(ExitCode::from(2));
    }
    // Tolerate a few non-service frames before the reply.
    for _ in 0..8 {
        let mut incoming = Packet::for_receive();
        if !incoming.receive_blocking(stream, REPLY_TIMEOUT) {
            eprintln!("server did not respond");
            return Err(ExitCode::from(3));
        }
        match Message::decode(&mut incoming) {
            Some(Message {
                command: Command::Service(reply),
                ..
            }) if reply.flag == request.flag => return Ok(reply),
            Some(other) => debug!("skipping frame of type {}", other.command.kind()),
            None => debug!("skipping undecodable frame"),
        }
    }
    eprintln!("server did not answer the request");
    Err(ExitCode::from(3))
}
