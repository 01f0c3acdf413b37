//! The narrow interface the synchronization core needs from the simulation
//! engine, plus `GridWorld`, a small deterministic reference world used by
//! the binaries and the test suite. The real game engine is an external
//! collaborator; everything the core calls goes through [`Simulation`].

use crate::checklist::Checklist;
use crate::forbidden::{ForbiddenRule, RuleSet};
use crate::info::GameInfo;
use crate::packet::PROTOCOL_VERSION;
use crate::tool::{ToolCall, DIALOG_TOOL_BIT, MAP_EDIT_BIT, MAX_PLAYERS, TOOL_ADD_MESSAGE, TOOL_BUILD, TOOL_ERROR_MESSAGE, TOOL_REMOVE};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;

/// Player-control actions carried by a PlayerControlChange command.
pub const PLAYER_CREATE_AI: u8 = 1;
pub const PLAYER_REMOVE: u8 = 2;

/// What the lock-step core requires from a simulation.
///
/// The sync step is the discrete tick counter used for temporal addressing;
/// the map counter identifies which incarnation of the world is live and
/// changes whenever state is wholesale replaced via `load`.
pub trait Simulation {
    /// Current sync step (monotonic tick counter).
    fn sync_step(&self) -> u32;

    /// Advances the simulation by exactly one sync step.
    fn step(&mut self);

    /// Current map/epoch counter.
    fn map_counter(&self) -> u32;

    /// Adopts a freshly-minted epoch after a wholesale state replacement.
    fn set_map_counter(&mut self, counter: u32);

    fn paused(&self) -> bool;

    fn set_pause(&mut self, pause: bool);

    /// State fingerprint at the current sync step.
    fn checklist(&self) -> Checklist;

    /// Applies one tool invocation on behalf of the originating client.
    fn call_tool(&mut self, sender: u32, call: &ToolCall) -> Result<(), String>;

    /// Active scenario rule set.
    fn rules(&self) -> &RuleSet;

    /// Adds or removes one scenario rule.
    fn change_rule(&mut self, add: bool, rule: &ForbiddenRule);

    /// Updates the scenario win/lose bitmask state.
    fn set_scenario_state(&mut self, won: u16, lost: u16);

    /// Administrative player slot change (create AI, remove player, ...).
    fn control_player(&mut self, action: u8, player: u8, param: u16);

    /// Appends to the persistent in-game message log. Deliberately not part
    /// of the checklist, so messages may be applied on arrival.
    fn log_message(&mut self, text: &str);

    /// Lightweight summary answered to non-joining probes.
    fn game_info(&self) -> GameInfo;

    /// Serializes the whole world to an opaque byte blob.
    fn save(&self) -> Result<Vec<u8>, Box<dyn Error>>;

    /// Replaces the whole world from a blob produced by `save`.
    fn load(&mut self, blob: &[u8]) -> Result<(), Box<dyn Error>>;
}

fn mix(mut h: u32, v: u32) -> u32 {
    h ^= v.wrapping_mul(0x9E37_79B9);
    h = h.rotate_left(13);
    h.wrapping_mul(5).wrapping_add(0xE654_6B64)
}

fn tile_hash(x: i16, y: i16, value: u16) -> u32 {
    // Order-independent per-tile contribution so the rolling hash can be
    // updated incrementally on build and remove.
    mix(mix(0x811C_9DC5, ((x as u16 as u32) << 16) | y as u16 as u32), value as u32)
}

/// Minimal deterministic world: a tile grid, a seeded RNG stream advanced
/// once per sync step, a scenario rule set and a message log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GridWorld {
    sync_step: u32,
    map_counter: u32,
    paused: bool,
    size_x: u16,
    size_y: u16,
    rng_state: u32,
    tiles: BTreeMap<(i16, i16), u16>,
    tiles_hash: u32,
    companies: u16,
    rules: RuleSet,
    won: u16,
    lost: u16,
    messages: Vec<String>,
    pakset: String,
}

impl GridWorld {
    pub fn new(pakset: &str, size_x: u16, size_y: u16) -> Self {
        GridWorld {
            sync_step: 0,
            map_counter: 0,
            paused: false,
            size_x,
            size_y,
            rng_state: 1,
            tiles: BTreeMap::new(),
            tiles_hash: 0,
            companies: 0b10, // public player only
            rules: RuleSet::new(),
            won: 0,
            lost: 0,
            messages: Vec::new(),
            pakset: pakset.to_string(),
        }
    }

    pub fn tile(&self, x: i16, y: i16) -> Option<u16> {
        self.tiles.get(&(x, y)).copied()
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn scenario_state(&self) -> (u16, u16) {
        (self.won, self.lost)
    }
}

impl Simulation for GridWorld {
    fn sync_step(&self) -> u32 {
        self.sync_step
    }

    fn step(&mut self) {
        // xorshift32; every participant advances the identical stream.
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng_state = x;
        self.sync_step += 1;
    }

    fn map_counter(&self) -> u32 {
        self.map_counter
    }

    fn set_map_counter(&mut self, counter: u32) {
        self.map_counter = counter;
    }

    fn paused(&self) -> bool {
        self.paused
    }

    fn set_pause(&mut self, pause: bool) {
        self.paused = pause;
    }

    fn checklist(&self) -> Checklist {
        Checklist {
            random_seed: self.rng_state,
            object_count: self.tiles.len() as u32,
            player_mask: self.companies,
            state_hash: self.tiles_hash,
        }
    }

    fn call_tool(&mut self, sender: u32, call: &ToolCall) -> Result<(), String> {
        if call.tool_id & DIALOG_TOOL_BIT != 0 {
            return Err("dialog tools cannot execute over the network".to_string());
        }
        match call.tool_id & !MAP_EDIT_BIT {
            TOOL_BUILD => {
                let value = call.param.parse::<u16>().unwrap_or(1);
                let key = (call.pos.x, call.pos.y);
                if let Some(old) = self.tiles.insert(key, value) {
                    self.tiles_hash ^= tile_hash(key.0, key.1, old);
                }
                self.tiles_hash ^= tile_hash(key.0, key.1, value);
                Ok(())
            }
            TOOL_REMOVE => {
                let key = (call.pos.x, call.pos.y);
                if let Some(old) = self.tiles.remove(&key) {
                    self.tiles_hash ^= tile_hash(key.0, key.1, old);
                }
                Ok(())
            }
            TOOL_ADD_MESSAGE => {
                self.messages.push(call.param.clone());
                Ok(())
            }
            TOOL_ERROR_MESSAGE => {
                // Display-only; must not touch checklist-visible state.
                info!("client {} error display: {}", sender, call.param);
                Ok(())
            }
            other => Err(format!("unknown tool id {}", other)),
        }
    }

    fn rules(&self) -> &RuleSet {
        &self.rules
    }

    fn change_rule(&mut self, add: bool, rule: &ForbiddenRule) {
        if add {
            self.rules.insert(rule.clone());
        } else {
            self.rules.remove(rule);
        }
    }

    fn set_scenario_state(&mut self, won: u16, lost: u16) {
        self.won = won;
        self.lost = lost;
    }

    fn control_player(&mut self, action: u8, player: u8, param: u16) {
        if player >= MAX_PLAYERS {
            info!("ignoring player control for out-of-range slot {}", player);
            return;
        }
        match action {
            PLAYER_CREATE_AI => self.companies |= 1 << player,
            PLAYER_REMOVE => self.companies &= !(1 << player),
            _ => info!("ignoring unknown player control action {} ({})", action, param),
        }
    }

    fn log_message(&mut self, text: &str) {
        self.messages.push(text.to_string());
    }

    fn game_info(&self) -> GameInfo {
        GameInfo {
            size_x: self.size_x,
            size_y: self.size_y,
            clients: 0, // filled in by the server
            companies: self.companies.count_ones() as u8,
            population: self.tiles.len() as u32 * 37,
            pakset: self.pakset.clone(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    fn save(&self) -> Result<Vec<u8>, Box<dyn Error>> {
        Ok(bincode::serialize(self)?)
    }

    fn load(&mut self, blob: &[u8]) -> Result<(), Box<dyn Error>> {
        *self = bincode::deserialize(blob)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::Coord3;

    fn build(x: i16, y: i16, value: &str) -> ToolCall {
        ToolCall {
            player: 2,
            tool_id: TOOL_BUILD,
            waytype: 0,
            pos: Coord3::new(x, y, 0),
            param: value.to_string(),
            init: false,
            flags: 0,
            custom: Vec::new(),
        }
    }

    #[test]
    fn test_identical_histories_produce_identical_checklists() {
        let mut a = GridWorld::new("pak", 32, 32);
        let mut b = GridWorld::new("pak", 32, 32);
        for i in 0..10 {
            a.call_tool(1, &build(i, i, "5")).unwrap();
            b.call_tool(1, &build(i, i, "5")).unwrap();
            a.step();
            b.step();
        }
        assert_eq!(a.checklist(), b.checklist());
    }

    #[test]
    fn test_diverging_histories_differ_in_checklist() {
        let mut a = GridWorld::new("pak", 32, 32);
        let mut b = GridWorld::new("pak", 32, 32);
        a.call_tool(1, &build(1, 1, "5")).unwrap();
        b.call_tool(1, &build(1, 2, "5")).unwrap();
        assert_ne!(a.checklist(), b.checklist());
    }

    #[test]
    fn test_build_then_remove_restores_hash() {
        let mut world = GridWorld::new("pak", 32, 32);
        let before = world.checklist();
        world.call_tool(1, &build(3, 4, "9")).unwrap();
        assert_ne!(world.checklist(), before);
        let mut remove = build(3, 4, "9");
        remove.tool_id = TOOL_REMOVE;
        world.call_tool(1, &remove).unwrap();
        assert_eq!(world.checklist(), before);
    }

    #[test]
    fn test_messages_do_not_affect_checklist() {
        let mut world = GridWorld::new("pak", 32, 32);
        let before = world.checklist();
        world.log_message("chat line");
        let mut msg = build(0, 0, "x");
        msg.tool_id = TOOL_ADD_MESSAGE;
        msg.param = "system notice".to_string();
        world.call_tool(1, &msg).unwrap();
        assert_eq!(world.checklist(), before);
        assert_eq!(world.messages().len(), 2);
    }

    #[test]
    fn test_snapshot_roundtrip_is_byte_identical_state() {
        let mut world = GridWorld::new("pak", 32, 32);
        for i in 0..5 {
            world.call_tool(1, &build(i, 0, "2")).unwrap();
            world.step();
        }
        let blob = world.save().unwrap();
        let mut restored = GridWorld::new("other", 1, 1);
        restored.load(&blob).unwrap();
        assert_eq!(restored, world);
        // The reload round-trip must reproduce the exact serialized bytes.
        assert_eq!(restored.save().unwrap(), blob);
    }

    #[test]
    fn test_dialog_tool_refused() {
        let mut world = GridWorld::new("pak", 32, 32);
        let mut call = build(0, 0, "1");
        call.tool_id |= DIALOG_TOOL_BIT;
        assert!(world.call_tool(1, &call).is_err());
    }

    #[test]
    fn test_player_control_updates_mask() {
        let mut world = GridWorld::new("pak", 32, 32);
        world.control_player(PLAYER_CREATE_AI, 3, 0);
        assert_eq!(world.checklist().player_mask & (1 << 3), 1 << 3);
        world.control_player(PLAYER_REMOVE, 3, 0);
        assert_eq!(world.checklist().player_mask & (1 << 3), 0);
    }

    #[test]
    fn test_player_control_ignores_out_of_range_slot() {
        let mut world = GridWorld::new("pak", 32, 32);
        let before = world.checklist().player_mask;
        world.control_player(PLAYER_CREATE_AI, 200, 0);
        assert_eq!(world.checklist().player_mask, before);
    }
}
