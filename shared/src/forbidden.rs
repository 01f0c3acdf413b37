//! Scenario rule set: which tools a player may invoke, possibly restricted
//! to a spatial region. Kept sorted by (kind, player, tool, waytype) so
//! membership and range queries are binary searches; mutated only through an
//! add/remove pair that deduplicates exact matches.

use crate::packet::Packet;
use crate::tool::Coord3;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RuleKind {
    /// Tool forbidden for the player everywhere.
    ForbidTool = 0,
    /// Tool forbidden for the player inside a bounding cube.
    ForbidToolAt = 1,
}

impl RuleKind {
    fn from_u8(v: u8) -> RuleKind {
        if v == 1 {
            RuleKind::ForbidToolAt
        } else {
            RuleKind::ForbidTool
        }
    }
}

/// Axis-aligned 3D bounding box, inclusive on both corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cube {
    pub min: Coord3,
    pub max: Coord3,
}

impl Cube {
    pub fn contains(&self, pos: Coord3) -> bool {
        (self.min.x..=self.max.x).contains(&pos.x)
            && (self.min.y..=self.max.y).contains(&pos.y)
            && (self.min.z..=self.max.z).contains(&pos.z)
    }
}

/// One scenario rule. Total order ignores the cube and message so an exact
/// (kind, player, tool, waytype) tuple is unique in the set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForbiddenRule {
    pub kind: RuleKind,
    pub player: u8,
    pub tool: u16,
    pub waytype: i8,
    pub cube: Option<Cube>,
    pub message: String,
}

impl ForbiddenRule {
    fn order_key(&self) -> (RuleKind, u8, u16, i8) {
        (self.kind, self.player, self.tool, self.waytype)
    }

    pub fn rdwr_put(&self, pkt: &mut Packet) {
        pkt.put_u8(self.kind as u8);
        pkt.put_u8(self.player);
        pkt.put_u16(self.tool);
        pkt.put_i8(self.waytype);
        pkt.put_bool(self.cube.is_some());
        if let Some(cube) = &self.cube {
            cube.min.rdwr_put(pkt);
            cube.max.rdwr_put(pkt);
        }
        pkt.put_str(&self.message);
    }

    pub fn rdwr_get(pkt: &mut Packet) -> ForbiddenRule {
        let kind = RuleKind::from_u8(pkt.get_u8());
        let player = pkt.get_u8();
        let tool = pkt.get_u16();
        let waytype = pkt.get_i8();
        let cube = if pkt.get_bool() {
            Some(Cube {
                min: Coord3::rdwr_get(pkt),
                max: Coord3::rdwr_get(pkt),
            })
        } else {
            None
        };
        ForbiddenRule {
            kind,
            player,
            tool,
            waytype,
            cube,
            message: pkt.get_str(),
        }
    }
}

/// Ordered collection of forbidden rules with binary-search queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    rules: Vec<ForbiddenRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        RuleSet::default()
    }

    /// Binary search for the key range, then a short scan inside it for an
    /// exact match (several rules may share a key but differ in cube/message).
    fn position(&self, rule: &ForbiddenRule) -> Result<usize, usize> {
        let key = rule.order_key();
        let start = self.rules.partition_point(|r| r.order_key() < key);
        let mut at = start;
        while at < self.rules.len() && self.rules[at].order_key() == key {
            if self.rules[at] == *rule {
                return Ok(at);
            }
            at += 1;
        }
        Err(at)
    }

    /// Inserts a rule; exact duplicates are dropped. Returns whether the set
    /// changed.
    pub fn insert(&mut self, rule: ForbiddenRule) -> bool {
        match self.position(&rule) {
            Ok(_) => false,
            Err(at) => {
                self.rules.insert(at, rule);
                true
            }
        }
    }

    /// Removes an exactly-matching rule. Returns whether anything was removed.
    pub fn remove(&mut self, rule: &ForbiddenRule) -> bool {
        match self.position(rule) {
            Ok(at) => {
                self.rules.remove(at);
                true
            }
            Err(_) => false,
        }
    }

    /// Checks whether the player may invoke this tool at this position.
    /// Returns the rule's error message on refusal.
    pub fn allowed(&self, player: u8, tool: u16, waytype: i8, pos: Coord3) -> Result<(), &str> {
        if let Some(rule) = self.matching(RuleKind::ForbidTool, player, tool, waytype).next() {
            return Err(rule.message.as_str());
        }
        for rule in self.matching(RuleKind::ForbidToolAt, player, tool, waytype) {
            if rule.cube.map(|c| c.contains(pos)).unwrap_or(true) {
                return Err(rule.message.as_str());
            }
        }
        Ok(())
    }

    /// All rules with the exact (kind, player, tool, waytype) key, found via
    /// binary search for the key range.
    fn matching(
        &self,
        kind: RuleKind,
        player: u8,
        tool: u16,
        waytype: i8,
    ) -> impl Iterator<Item = &ForbiddenRule> {
        let key = (kind, player, tool, waytype);
        let start = self.rules.partition_point(|r| r.order_key() < key);
        self.rules[start..]
            .iter()
            .take_while(move |r| r.order_key() == key)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ForbiddenRule> {
        self.rules.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_everywhere(player: u8, tool: u16) -> ForbiddenRule {
        ForbiddenRule {
            kind: RuleKind::ForbidTool,
            player,
            tool,
            waytype: 0,
            cube: None,
            message: "tool forbidden by scenario".to_string(),
        }
    }

    fn rule_in_cube(player: u8, tool: u16, min: Coord3, max: Coord3) -> ForbiddenRule {
        ForbiddenRule {
            kind: RuleKind::ForbidToolAt,
            player,
            tool,
            waytype: 0,
            cube: Some(Cube { min, max }),
            message: "area is protected".to_string(),
        }
    }

    #[test]
    fn test_insert_keeps_sorted_and_dedups() {
        let mut set = RuleSet::new();
        assert!(set.insert(rule_everywhere(3, 9)));
        assert!(set.insert(rule_everywhere(1, 5)));
        assert!(set.insert(rule_everywhere(2, 7)));
        assert!(!set.insert(rule_everywhere(1, 5)));
        assert_eq!(set.len(), 3);
        let keys: Vec<_> = set.iter().map(|r| (r.player, r.tool)).collect();
        assert_eq!(keys, vec![(1, 5), (2, 7), (3, 9)]);
    }

    #[test]
    fn test_remove_exact_match_only() {
        let mut set = RuleSet::new();
        set.insert(rule_everywhere(1, 5));
        let mut other = rule_everywhere(1, 5);
        other.message = "different text".to_string();
        assert!(!set.remove(&other));
        assert!(set.remove(&rule_everywhere(1, 5)));
        assert!(set.is_empty());
    }

    #[test]
    fn test_global_forbid_applies_anywhere() {
        let mut set = RuleSet::new();
        set.insert(rule_everywhere(2, 1));
        assert!(set.allowed(2, 1, 0, Coord3::new(50, 50, 0)).is_err());
        // Other players and tools are unaffected.
        assert!(set.allowed(3, 1, 0, Coord3::new(50, 50, 0)).is_ok());
        assert!(set.allowed(2, 2, 0, Coord3::new(50, 50, 0)).is_ok());
    }

    #[test]
    fn test_spatial_forbid_respects_cube() {
        let mut set = RuleSet::new();
        set.insert(rule_in_cube(
            2,
            1,
            Coord3::new(0, 0, -1),
            Coord3::new(10, 10, 1),
        ));
        assert!(set.allowed(2, 1, 0, Coord3::new(5, 5, 0)).is_err());
        assert!(set.allowed(2, 1, 0, Coord3::new(11, 5, 0)).is_ok());
        assert!(set.allowed(2, 1, 0, Coord3::new(5, 5, 2)).is_ok());
    }

    #[test]
    fn test_waytype_distinguishes_rules() {
        let mut set = RuleSet::new();
        let mut road = rule_everywhere(2, 1);
        road.waytype = 1;
        set.insert(road);
        assert!(set.allowed(2, 1, 1, Coord3::new(0, 0, 0)).is_err());
        assert!(set.allowed(2, 1, 2, Coord3::new(0, 0, 0)).is_ok());
    }

    #[test]
    fn test_rule_wire_roundtrip() {
        let rule = rule_in_cube(2, 6, Coord3::new(-3, -3, 0), Coord3::new(3, 3, 0));
        let mut pkt = Packet::new(15);
        rule.rdwr_put(&mut pkt);
        let bytes = pkt.to_bytes().unwrap().to_vec();
        let mut decoded = Packet::from_bytes(&bytes);
        assert_eq!(ForbiddenRule::rdwr_get(&mut decoded), rule);
    }
}
