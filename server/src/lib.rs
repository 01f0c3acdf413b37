//! # Game Server Library
//!
//! The authoritative half of the lock-step synchronization layer. The
//! server owns the canonical simulation, arbitrates every client-authored
//! world command, and drives the one epoch-minting resync procedure that
//! brings new participants up to a byte-identical state.
//!
//! ## Core Responsibilities
//!
//! ### Command Arbitration
//! Client-authored world commands arrive with exec=false. The server
//! validates them (tool class, player unlocks, scenario rules), stamps the
//! survivors with a future sync step and the current epoch, re-broadcasts
//! them with exec=true, and feeds its own copy into its own execution
//! queue so it executes them at exactly the same step as everyone else.
//!
//! ### Roster Management
//! The roster tracks every socket from accept to release: connection
//! states, nicknames, per-company unlock masks, and address bans. Client
//! id 0 is permanently the server's own loop-back identity.
//!
//! ### Join & Resync
//! At most one join is in flight at a time. Admitting a joiner mints a
//! fresh map-counter epoch, schedules a save/reload on every participant
//! at the same stamped step, and streams the resulting snapshot to the
//! joiner before flipping it to Playing.
//!
//! ### Desync Detection
//! The server records a checklist fingerprint every step and periodically
//! broadcasts one so clients can compare against their own history; a
//! client that diverges disconnects itself rather than corrupting the
//! shared state.
//!
//! ## Architecture Design
//!
//! Everything runs on a single-threaded event loop: one poller watches
//! the listener and every client socket with a bounded timeout, decoded
//! commands are handled inline, and the simulation advances one step per
//! frame, draining the execution queue at the step boundary. All sockets
//! are nonblocking; only the snapshot transfer switches a socket to
//! blocking mode, chunked with short per-chunk timeouts.
//!
//! ## Module Organization
//!
//! - `roster`: connection slots, state machine, bans ([`roster::Roster`])
//! - `network`: the polling event loop ([`network::NetworkServer`])
//! - `game`: arbitration, join protocol, frame loop ([`game::GameServer`])
//! - `admin`: service-channel login and cooldowns ([`admin::AdminGate`])

pub mod admin;
pub mod game;
pub mod network;
pub mod roster;
