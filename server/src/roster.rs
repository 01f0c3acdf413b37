//! Client roster and connection lifecycle for the game server
//!
//! This module owns the table of connection slots, including:
//! - Slot allocation, state transitions and release
//! - Per-slot receive/send buffering over nonblocking sockets
//! - Nickname arbitration against collisions and reserved names
//! - Address-range bans checked at accept time
//!
//! A client's id is simply its slot index, and id 0 is permanently the
//! server's own loop-back slot, so commands the server applies to itself
//! travel the same code paths as remote ones.

use log::{info, warn};
use shared::packet::Packet;
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::str::FromStr;
use std::time::Duration;

/// Lifecycle state of one roster slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No connection; the slot (and its id) is free for reuse.
    Inactive,
    /// The server's own loop-back slot. Always slot 0, never released.
    Server,
    /// Socket established but the client is not part of the simulation yet
    /// (probing game info, comparing paksets, or mid-join).
    Connected,
    /// Full participant: receives broadcasts and counts towards the roster.
    Playing,
}

/// One connection slot: the socket, its partial-frame buffers and the
/// client-visible identity attached to it.
#[derive(Debug)]
pub struct Slot {
    pub state: SlotState,
    pub stream: Option<TcpStream>,
    pub addr: Option<SocketAddr>,
    /// Frame currently being accumulated from this socket.
    pub recv: Packet,
    /// Frames waiting to be flushed to this socket, front first.
    pub send_queue: VecDeque<Packet>,
    pub nickname: String,
    /// Bitmask of company slots this client has unlocked by password.
    pub unlock_mask: u16,
}

impl Slot {
    fn empty() -> Self {
        Slot {
            state: SlotState::Inactive,
            stream: None,
            addr: None,
            recv: Packet::for_receive(),
            send_queue: VecDeque::new(),
            nickname: String::new(),
            unlock_mask: 0,
        }
    }

    /// Drives the front of the send queue as far as the socket allows.
    /// Returns false once the connection must be considered dead.
    pub fn flush_sends(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return true;
        };
        while let Some(pkt) = self.send_queue.front_mut() {
            pkt.send(stream);
            if pkt.has_failed() {
                return false;
            }
            if !pkt.is_ready() {
                // Would block; retry on the next loop pass.
                return true;
            }
            self.send_queue.pop_front();
        }
        true
    }

    pub fn wants_write(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Flushes every queued frame to completion, retrying through would-block
    /// until `timeout` elapses per frame. Required before handing the socket
    /// to a raw byte stream: a partially-written frame left in the queue
    /// would interleave with the stream and corrupt the peer's framing.
    /// Returns false once the connection must be considered dead.
    pub fn flush_pending_blocking(&mut self, timeout: Duration) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return true;
        };
        while let Some(pkt) = self.send_queue.front_mut() {
            if !pkt.send_blocking(stream, timeout) {
                return false;
            }
            self.send_queue.pop_front();
        }
        true
    }
}

/// The slot table plus the counters and ban list that govern admission.
pub struct Roster {
    slots: Vec<Slot>,
    connected: usize,
    playing: usize,
    /// Highest id ever handed out, kept separately from the live slots so
    /// diagnostics can tell "slot reused" from "never used".
    ever_allocated: u32,
    bans: Vec<NetRange>,
}

impl Roster {
    /// Creates a roster with `max_clients` usable slots beyond the server's
    /// own slot 0.
    pub fn new(max_clients: usize) -> Self {
        let mut slots = Vec::with_capacity(max_clients + 1);
        let mut server_slot = Slot::empty();
        server_slot.state = SlotState::Server;
        server_slot.nickname = "Server".to_string();
        slots.push(server_slot);
        for _ in 0..max_clients {
            slots.push(Slot::empty());
        }
        Roster {
            slots,
            connected: 0,
            playing: 0,
            ever_allocated: 0,
            bans: Vec::new(),
        }
    }

    /// Admits a fresh socket into the lowest free slot. Returns the new
    /// client id, or None when the roster is full or the address is banned
    /// (the stream is dropped, closing the connection).
    pub fn admit(&mut self, stream: TcpStream, addr: SocketAddr) -> Option<u32> {
        if self.is_banned(&addr.ip()) {
            warn!("refusing banned address {}", addr);
            return None;
        }
        let id = self
            .slots
            .iter()
            .position(|s| s.state == SlotState::Inactive)?;
        let slot = &mut self.slots[id];
        slot.stream = Some(stream);
        slot.addr = Some(addr);
        slot.recv = Packet::for_receive();
        slot.send_queue.clear();
        slot.nickname = format!("Client#{}", id);
        slot.unlock_mask = 0;
        self.set_state(id as u32, SlotState::Connected);
        self.ever_allocated = self.ever_allocated.max(id as u32);
        info!("client {} connected from {}", id, addr);
        Some(id as u32)
    }

    /// Closes and frees a slot. Idempotent: returns whether anything was
    /// actually removed. Slot 0 is never released.
    pub fn release(&mut self, id: u32) -> bool {
        if id == 0 || id as usize >= self.slots.len() {
            return false;
        }
        if self.slots[id as usize].state == SlotState::Inactive {
            return false;
        }
        self.set_state(id, SlotState::Inactive);
        let slot = &mut self.slots[id as usize];
        info!("client {} ({}) disconnected", id, slot.nickname);
        *slot = Slot::empty();
        true
    }

    /// The single place slot states change, so the connected/playing
    /// counters can never drift from the table.
    pub fn set_state(&mut self, id: u32, state: SlotState) {
        let slot = &mut self.slots[id as usize];
        let old = slot.state;
        if old == state {
            return;
        }
        match old {
            SlotState::Connected => self.connected -= 1,
            SlotState::Playing => self.playing -= 1,
            _ => {}
        }
        match state {
            SlotState::Connected => self.connected += 1,
            SlotState::Playing => self.playing += 1,
            _ => {}
        }
        self.slots[id as usize].state = state;
    }

    pub fn get(&self, id: u32) -> Option<&Slot> {
        self.slots.get(id as usize)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Slot> {
        self.slots.get_mut(id as usize)
    }

    pub fn state(&self, id: u32) -> SlotState {
        self.slots
            .get(id as usize)
            .map(|s| s.state)
            .unwrap_or(SlotState::Inactive)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Highest client id ever allocated.
    pub fn ever_allocated(&self) -> u32 {
        self.ever_allocated
    }

    /// Count of sockets in the Connected state.
    pub fn connected_count(&self) -> usize {
        self.connected
    }

    /// Count of full participants, not including the server itself.
    pub fn playing_count(&self) -> usize {
        self.playing
    }

    /// Ids of every playing remote client.
    pub fn playing_ids(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Playing && s.stream.is_some())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Finds the playing client using `nickname`, for private chat routing.
    pub fn find_by_nickname(&self, nickname: &str) -> Option<u32> {
        self.slots
            .iter()
            .position(|s| s.state == SlotState::Playing && s.nickname.eq_ignore_ascii_case(nickname))
            .map(|i| i as u32)
    }

    /// Settles the nickname a client asked for: collisions with any active
    /// slot (compared case-insensitively) and the reserved administrative
    /// name fall back to the generated "Client#<id>" form. Returns the name
    /// actually assigned.
    pub fn arbitrate_nickname(&mut self, id: u32, wanted: &str) -> String {
        let wanted = wanted.trim();
        let taken = wanted.is_empty()
            || wanted.eq_ignore_ascii_case("admin")
            || self.slots.iter().enumerate().any(|(i, s)| {
                i as u32 != id
                    && s.state != SlotState::Inactive
                    && s.nickname.eq_ignore_ascii_case(wanted)
            });
        let assigned = if taken {
            format!("Client#{}", id)
        } else {
            wanted.to_string()
        };
        if let Some(slot) = self.slots.get_mut(id as usize) {
            slot.nickname = assigned.clone();
        }
        assigned
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.bans.iter().any(|range| range.contains(ip))
    }

    pub fn add_ban(&mut self, range: NetRange) {
        if !self.bans.contains(&range) {
            info!("banned {}", range);
            self.bans.push(range);
        }
    }

    pub fn remove_ban(&mut self, range: &NetRange) {
        self.bans.retain(|r| r != range);
    }

    pub fn bans(&self) -> &[NetRange] {
        &self.bans
    }
}

/// An IPv4 address range in prefix notation, e.g. `203.0.113.0/24`.
/// A bare address is a /32. IPv6 peers never match a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetRange {
    base: Ipv4Addr,
    prefix_len: u8,
}

impl NetRange {
    pub fn new(base: Ipv4Addr, prefix_len: u8) -> Self {
        NetRange {
            base,
            prefix_len: prefix_len.min(32),
        }
    }

    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len as u32)
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => {
                (u32::from(*v4) & self.mask()) == (u32::from(self.base) & self.mask())
            }
            IpAddr::V6(_) => false,
        }
    }
}

impl FromStr for NetRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, len_part) = match s.split_once('/') {
            Some((a, l)) => (a, Some(l)),
            None => (s, None),
        };
        let base: Ipv4Addr = addr_part
            .parse()
            .map_err(|_| format!("invalid address in range '{}'", s))?;
        let prefix_len = match len_part {
            Some(l) => l
                .parse::<u8>()
                .ok()
                .filter(|n| *n <= 32)
                .ok_or_else(|| format!("invalid prefix length in range '{}'", s))?,
            None => 32,
        };
        Ok(NetRange::new(base, prefix_len))
    }
}

impl fmt::Display for NetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn local_pair() -> (TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        drop(client);
        (stream, peer)
    }

    #[test]
    fn test_slot_zero_is_the_server() {
        let roster = Roster::new(4);
        assert_eq!(roster.state(0), SlotState::Server);
        assert_eq!(roster.len(), 5);
        assert_eq!(roster.get(0).unwrap().nickname, "Server");
    }

    #[test]
    fn test_admit_reuses_lowest_free_slot() {
        let mut roster = Roster::new(2);
        let (s1, a1) = local_pair();
        let (s2, a2) = local_pair();
        assert_eq!(roster.admit(s1, a1), Some(1));
        assert_eq!(roster.admit(s2, a2), Some(2));
        assert_eq!(roster.connected_count(), 2);

        let (s3, a3) = local_pair();
        assert_eq!(roster.admit(s3, a3), None);

        assert!(roster.release(1));
        assert!(!roster.release(1));
        assert_eq!(roster.connected_count(), 1);
        let (s4, a4) = local_pair();
        assert_eq!(roster.admit(s4, a4), Some(1));
        assert_eq!(roster.ever_allocated(), 2);
    }

    #[test]
    fn test_state_counters_follow_transitions() {
        let mut roster = Roster::new(3);
        let (s, a) = local_pair();
        let id = roster.admit(s, a).unwrap();
        assert_eq!(roster.connected_count(), 1);
        assert_eq!(roster.playing_count(), 0);

        roster.set_state(id, SlotState::Playing);
        assert_eq!(roster.connected_count(), 0);
        assert_eq!(roster.playing_count(), 1);
        assert_eq!(roster.playing_ids(), vec![id]);

        roster.release(id);
        assert_eq!(roster.playing_count(), 0);
        assert_eq!(roster.state(id), SlotState::Inactive);
    }

    #[test]
    fn test_release_never_touches_server_slot() {
        let mut roster = Roster::new(1);
        roster.release(0);
        assert_eq!(roster.state(0), SlotState::Server);
    }

    #[test]
    fn test_nickname_arbitration() {
        let mut roster = Roster::new(3);
        let (s1, a1) = local_pair();
        let (s2, a2) = local_pair();
        let id1 = roster.admit(s1, a1).unwrap();
        let id2 = roster.admit(s2, a2).unwrap();

        assert_eq!(roster.arbitrate_nickname(id1, "Alice"), "Alice");
        // Collision with an active slot falls back to the generated name,
        // in any casing.
        assert_eq!(roster.arbitrate_nickname(id2, "Alice"), "Client#2");
        assert_eq!(roster.arbitrate_nickname(id2, "alice"), "Client#2");
        // The administrative name is reserved in any casing.
        assert_eq!(roster.arbitrate_nickname(id2, "ADMIN"), "Client#2");
        assert_eq!(roster.arbitrate_nickname(id2, "  "), "Client#2");
        // Re-asserting your own current name is not a collision.
        assert_eq!(roster.arbitrate_nickname(id1, "Alice"), "Alice");
    }

    #[test]
    fn test_pending_frames_flush_before_raw_stream() {
        use std::io::{Read, Write};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let (mut peer, peer_addr) = listener.accept().unwrap();

        let mut roster = Roster::new(2);
        let id = roster.admit(stream, peer_addr).unwrap();
        let slot = roster.get_mut(id).unwrap();
        let mut expected = Vec::new();
        for kind in [7u16, 8] {
            let mut pkt = Packet::new(kind);
            pkt.put_u32(0xC0FFEE);
            expected.extend_from_slice(pkt.to_bytes().unwrap());
            slot.send_queue.push_back(pkt);
        }

        assert!(slot.flush_pending_blocking(Duration::from_secs(2)));
        assert!(!slot.wants_write());

        // Raw bytes written afterwards land strictly behind both frames.
        slot.stream.as_mut().unwrap().write_all(b"RAW").unwrap();
        expected.extend_from_slice(b"RAW");
        let mut got = vec![0u8; expected.len()];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_banned_address_is_refused_at_admit() {
        let mut roster = Roster::new(2);
        roster.add_ban("127.0.0.0/8".parse().unwrap());
        let (s, a) = local_pair();
        assert_eq!(roster.admit(s, a), None);
        assert_eq!(roster.connected_count(), 0);

        roster.remove_ban(&"127.0.0.0/8".parse().unwrap());
        let (s, a) = local_pair();
        assert!(roster.admit(s, a).is_some());
    }

    #[test]
    fn test_net_range_parse_and_match() {
        let range: NetRange = "10.1.2.0/24".parse().unwrap();
        assert!(range.contains(&"10.1.2.200".parse().unwrap()));
        assert!(!range.contains(&"10.1.3.1".parse().unwrap()));
        assert!(!range.contains(&"::1".parse().unwrap()));

        let single: NetRange = "192.0.2.7".parse().unwrap();
        assert!(single.contains(&"192.0.2.7".parse().unwrap()));
        assert!(!single.contains(&"192.0.2.8".parse().unwrap()));

        assert!("10.1.2.0/40".parse::<NetRange>().is_err());
        assert!("not-an-ip".parse::<NetRange>().is_err());
        assert_eq!(range.to_string(), "10.1.2.0/24");
    }

    #[test]
    fn test_find_by_nickname_only_matches_playing() {
        let mut roster = Roster::new(2);
        let (s, a) = local_pair();
        let id = roster.admit(s, a).unwrap();
        roster.arbitrate_nickname(id, "Bob");
        assert_eq!(roster.find_by_nickname("Bob"), None);
        roster.set_state(id, SlotState::Playing);
        assert_eq!(roster.find_by_nickname("Bob"), Some(id));
        assert_eq!(roster.find_by_nickname("bob"), Some(id));
    }
}
