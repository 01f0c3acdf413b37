//! # Game Client Library
//!
//! Client side of the lock-step multiplayer layer. Unlike a predictive
//! client, this one never acts ahead of the server: every world mutation
//! travels to the server as a proposal, and only the stamped broadcast copy
//! is executed, at the step the server chose. Determinism across machines is
//! the load-bearing assumption; the periodic checklist comparison exists to
//! notice when it breaks.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! Everything protocol-facing:
//! - The blocking join handshake (pakset comparison, nickname arbitration,
//!   admission, snapshot download, initial Ready exchange)
//! - The nonblocking live loop: frame reassembly, queueing of stamped world
//!   commands and their execution at the target step
//! - Resync handling and desync self-detection

pub mod network;
