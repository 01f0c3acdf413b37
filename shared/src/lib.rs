//! Protocol and simulation-model code shared by the server, the client and
//! the admin tool: the framed packet layer, the command object model, the
//! deterministic execution queue, checklist fingerprints, scenario rules,
//! pakset fingerprint comparison and the bulk file transfer primitive.

pub mod checklist;
pub mod command;
pub mod forbidden;
pub mod info;
pub mod pakset;
pub mod packet;
pub mod queue;
pub mod sim;
pub mod tool;
pub mod transfer;

pub use checklist::{Checklist, ChecklistHistory};
pub use command::{Command, Message, WorldStamp};
pub use packet::{Packet, MAX_PACKET_SIZE, PROTOCOL_VERSION};
pub use queue::{EnqueueOutcome, ExecQueue};
pub use sim::{GridWorld, Simulation};
