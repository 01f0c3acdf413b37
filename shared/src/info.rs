//! Lightweight game summary a server hands out to clients that probe it
//! without joining. Shipped as an opaque bincode blob inside the game-info
//! reply; the wire core only cares about its length.

use serde::{Deserialize, Serialize};
use std::error::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameInfo {
    pub size_x: u16,
    pub size_y: u16,
    pub clients: u8,
    pub companies: u8,
    pub population: u32,
    pub pakset: String,
    pub protocol_version: u16,
}

impl GameInfo {
    pub fn to_blob(&self) -> Result<Vec<u8>, Box<dyn Error>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_blob(blob: &[u8]) -> Result<GameInfo, Box<dyn Error>> {
        Ok(bincode::deserialize(blob)?)
    }
}
