//! Tool invocations: the generic mechanism by which every user-triggered
//! world mutation is expressed, validated by the server and replayed
//! identically on every participant.

use crate::packet::Packet;
use crate::sim::Simulation;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tool id bit marking dialog-class tools. These only open local UI and must
/// never cross the network.
pub const DIALOG_TOOL_BIT: u16 = 0x8000;

/// Tool id bit marking map-editing tools; the server forces their
/// attribution to the public player.
pub const MAP_EDIT_BIT: u16 = 0x4000;

/// The neutral/public player that owns shared infrastructure.
pub const PUBLIC_PLAYER: u8 = 1;

/// Number of company slots. Player ids at or above this do not fit the u16
/// unlock/company bitmasks and are refused wherever wire input names one.
pub const MAX_PLAYERS: u8 = 16;

pub const TOOL_BUILD: u16 = 1;
pub const TOOL_REMOVE: u16 = 2;
/// Posts a system message; allowed even for clients without a player unlock
/// (falls back to the public player instead of being rejected).
pub const TOOL_ADD_MESSAGE: u16 = 3;
/// Display-only error routed back to a single offending client. Must never
/// mutate checklist-visible state.
pub const TOOL_ERROR_MESSAGE: u16 = 4;

/// 3D world position addressed by a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Coord3 {
    pub x: i16,
    pub y: i16,
    pub z: i8,
}

impl Coord3 {
    pub fn new(x: i16, y: i16, z: i8) -> Self {
        Coord3 { x, y, z }
    }

    pub fn rdwr_put(&self, pkt: &mut Packet) {
        pkt.put_i16(self.x);
        pkt.put_i16(self.y);
        pkt.put_i8(self.z);
    }

    pub fn rdwr_get(pkt: &mut Packet) -> Coord3 {
        Coord3 {
            x: pkt.get_i16(),
            y: pkt.get_i16(),
            z: pkt.get_i8(),
        }
    }
}

/// One tool application: who acts, which tool, where, and the tool-specific
/// extras (free-form string parameter plus an opaque custom-data blob that
/// the tool instance rehydrates on execution).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolCall {
    pub player: u8,
    pub tool_id: u16,
    pub waytype: i8,
    pub pos: Coord3,
    pub param: String,
    /// True for the tool's init phase, false for its work phase.
    pub init: bool,
    pub flags: u8,
    pub custom: Vec<u8>,
}

impl ToolCall {
    pub fn rdwr_put(&self, pkt: &mut Packet) {
        pkt.put_u8(self.player);
        pkt.put_u16(self.tool_id);
        pkt.put_i8(self.waytype);
        self.pos.rdwr_put(pkt);
        pkt.put_str(&self.param);
        pkt.put_bool(self.init);
        pkt.put_u8(self.flags);
        pkt.put_blob(&self.custom);
    }

    pub fn rdwr_get(pkt: &mut Packet) -> ToolCall {
        ToolCall {
            player: pkt.get_u8(),
            tool_id: pkt.get_u16(),
            waytype: pkt.get_i8(),
            pos: Coord3::rdwr_get(pkt),
            param: pkt.get_str(),
            init: pkt.get_bool(),
            flags: pkt.get_u8(),
            custom: pkt.get_blob(),
        }
    }

    pub fn is_dialog(&self) -> bool {
        self.tool_id & DIALOG_TOOL_BIT != 0
    }

    /// Tool id with the class bits stripped.
    pub fn base_id(&self) -> u16 {
        self.tool_id & !(DIALOG_TOOL_BIT | MAP_EDIT_BIT)
    }

    pub fn is_map_edit(&self) -> bool {
        self.tool_id & MAP_EDIT_BIT != 0
    }
}

/// Cached tool instance for one (client, player) pair. The custom-data blob
/// of the latest invocation is kept so a tool that spans init and work
/// phases sees consistent state.
#[derive(Debug, Default)]
pub struct ToolSlot {
    pub tool_id: u16,
    pub custom: Vec<u8>,
    pub invocations: u32,
}

/// Per-(client id, acting player) tool instances, lazily constructed on
/// first use and evicted when the owning client disconnects.
#[derive(Debug, Default)]
pub struct ToolCache {
    slots: HashMap<(u32, u8), ToolSlot>,
}

impl ToolCache {
    pub fn new() -> Self {
        ToolCache::default()
    }

    /// Looks up or creates the tool instance for the originating client and
    /// acting player, rehydrates its custom data, then runs the call against
    /// the simulation.
    pub fn apply(
        &mut self,
        sim: &mut dyn Simulation,
        sender: u32,
        call: &ToolCall,
    ) -> Result<(), String> {
        let slot = self.slots.entry((sender, call.player)).or_default();
        if slot.tool_id != call.tool_id {
            // Different tool selected: fresh instance state.
            slot.custom.clear();
            slot.tool_id = call.tool_id;
        }
        if !call.custom.is_empty() {
            slot.custom = call.custom.clone();
        }
        slot.invocations += 1;
        sim.call_tool(sender, call)
    }

    /// Drops every cached instance belonging to a departing client.
    pub fn drop_client(&mut self, client_id: u32) {
        self.slots.retain(|(owner, _), _| *owner != client_id);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
