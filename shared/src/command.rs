//! The network command object model: every message exchanged between
//! participants, its wire layout, and the decode dispatch by type id.
//!
//! Commands come in three layers: plain commands (handled on arrival),
//! world commands (carry a target sync step plus a map counter and are only
//! applied when the local simulation reaches that step), and broadcast
//! world commands (additionally carry an exec flag: `false` means "please
//! validate and broadcast", `true` means "now actually apply").

use crate::checklist::Checklist;
use crate::forbidden::ForbiddenRule;
use crate::packet::{Packet, PROTOCOL_VERSION};
use crate::tool::ToolCall;
use log::warn;

/// Stable command type id namespace. Unknown ids from other protocol-version
/// peers are tolerated (logged and ignored), never fatal.
pub mod kind {
    pub const GAME_INFO: u16 = 1;
    pub const NICKNAME: u16 = 2;
    pub const CHAT: u16 = 3;
    pub const JOIN: u16 = 4;
    pub const SYNC: u16 = 5;
    pub const GAME_TRANSFER: u16 = 6;
    pub const READY: u16 = 7;
    pub const TOOL: u16 = 8;
    pub const CHECK: u16 = 9;
    pub const PAK_CHECK: u16 = 10;
    pub const SERVICE: u16 = 11;
    pub const PLAYER_AUTH: u16 = 12;
    pub const PLAYER_CONTROL: u16 = 13;
    pub const SCENARIO_STATE: u16 = 14;
    pub const SCENARIO_RULES: u16 = 15;
}

/// Temporal address of a world command: the sync step at which every
/// participant must apply it, and the map counter (epoch) that was current
/// when it was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorldStamp {
    pub sync_step: u32,
    pub map_counter: u32,
}

impl WorldStamp {
    pub fn new(sync_step: u32, map_counter: u32) -> Self {
        WorldStamp {
            sync_step,
            map_counter,
        }
    }

    fn rdwr_put(&self, pkt: &mut Packet) {
        pkt.put_u32(self.sync_step);
        pkt.put_u32(self.map_counter);
    }

    fn rdwr_get(pkt: &mut Packet) -> WorldStamp {
        WorldStamp {
            sync_step: pkt.get_u32(),
            map_counter: pkt.get_u32(),
        }
    }
}

/// Probe for a lightweight game summary without joining. An empty blob is
/// the request; the reply carries the bincode-serialized summary.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GameInfoCmd {
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NicknameCmd {
    pub nickname: String,
}

/// Chat relay. An empty destination broadcasts to everyone playing (and is
/// echoed into the in-game message log); a non-empty destination addresses a
/// single nickname privately with no log echo.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatCmd {
    pub message: String,
    pub company: i8,
    pub nickname: String,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct JoinCmd {
    pub nickname: String,
    /// 1 = admitted, 0 = refused (another join pending, or slot not active).
    pub answer: u8,
    /// Roster id the server assigned to the requesting client.
    pub assigned_id: u32,
}

/// Server-initiated: pause at the stamped step, persist state, reload it and
/// adopt `new_map_counter`. Sent first to only the joining socket (with its
/// id in `target_client`), then broadcast to everyone else.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncCmd {
    pub stamp: WorldStamp,
    pub target_client: u32,
    pub new_map_counter: u32,
}

/// Announces the byte length of a following raw snapshot stream; the actual
/// bytes are pushed via the low-level file-transfer primitive.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GameTransferCmd {
    pub length: u32,
}

/// Client→server: resync complete at the carried step. Server→client: the
/// unpause signal, with the authoritative checklist at that step when one is
/// available.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadyCmd {
    pub sync_step: u32,
    pub map_counter: u32,
    pub checklist: Checklist,
}

/// Tool invocation; the broadcast world command through which every
/// user-triggered world mutation travels. The server stamps `check_step` /
/// `checklist` with its latest known state fingerprint at broadcast time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolCmd {
    pub stamp: WorldStamp,
    pub exec: bool,
    pub check_step: u32,
    pub checklist: Checklist,
    pub call: ToolCall,
}

/// Periodic desync probe: the server's checklist as it was at `check_step`.
/// Order-insensitive; applying it late cannot corrupt anything.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CheckCmd {
    pub stamp: WorldStamp,
    pub check_step: u32,
    pub checklist: Checklist,
}

/// One round of the pakset fingerprint cursor exchange.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PakCheckCmd {
    pub phase: u8,
    pub name: String,
    pub checksum: Vec<u8>,
}

/// Administrative channel; `flag` selects the operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServiceCmd {
    pub flag: u16,
    pub number: u32,
    pub text: String,
}

/// Sets a company password hash, or attempts to unlock a password-protected
/// company for the sending client.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlayerAuthCmd {
    pub player: u8,
    pub hash: Vec<u8>,
    pub unlock_mask: u16,
}

/// Administrative player/company slot change, server-arbitrated like a tool.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlayerControlCmd {
    pub stamp: WorldStamp,
    pub exec: bool,
    pub action: u8,
    pub player: u8,
    pub param: u16,
}

/// Scenario win/lose bitmask push (server-authored only).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScenarioStateCmd {
    pub stamp: WorldStamp,
    pub won: u16,
    pub lost: u16,
}

/// Scenario rule addition/removal push (server-authored only).
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioRulesCmd {
    pub stamp: WorldStamp,
    pub add: bool,
    pub rule: ForbiddenRule,
}

/// Every concrete command family, as a tagged sum type so a frame can be
/// decoded without knowing the concrete type in advance.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GameInfo(GameInfoCmd),
    Nickname(NicknameCmd),
    Chat(ChatCmd),
    Join(JoinCmd),
    Sync(SyncCmd),
    GameTransfer(GameTransferCmd),
    Ready(ReadyCmd),
    Tool(ToolCmd),
    Check(CheckCmd),
    PakCheck(PakCheckCmd),
    Service(ServiceCmd),
    PlayerAuth(PlayerAuthCmd),
    PlayerControl(PlayerControlCmd),
    ScenarioState(ScenarioStateCmd),
    ScenarioRules(ScenarioRulesCmd),
}

impl Command {
    /// Wire type id; fixed at construction, identical on both directions.
    pub fn kind(&self) -> u16 {
        match self {
            Command::GameInfo(_) => kind::GAME_INFO,
            Command::Nickname(_) => kind::NICKNAME,
            Command::Chat(_) => kind::CHAT,
            Command::Join(_) => kind::JOIN,
            Command::Sync(_) => kind::SYNC,
            Command::GameTransfer(_) => kind::GAME_TRANSFER,
            Command::Ready(_) => kind::READY,
            Command::Tool(_) => kind::TOOL,
            Command::Check(_) => kind::CHECK,
            Command::PakCheck(_) => kind::PAK_CHECK,
            Command::Service(_) => kind::SERVICE,
            Command::PlayerAuth(_) => kind::PLAYER_AUTH,
            Command::PlayerControl(_) => kind::PLAYER_CONTROL,
            Command::ScenarioState(_) => kind::SCENARIO_STATE,
            Command::ScenarioRules(_) => kind::SCENARIO_RULES,
        }
    }

    /// Temporal address, for the commands that are world commands and go
    /// through the deterministic execution queue.
    pub fn stamp(&self) -> Option<WorldStamp> {
        match self {
            Command::Sync(c) => Some(c.stamp),
            Command::Tool(c) => Some(c.stamp),
            Command::Check(c) => Some(c.stamp),
            Command::PlayerControl(c) => Some(c.stamp),
            Command::ScenarioState(c) => Some(c.stamp),
            Command::ScenarioRules(c) => Some(c.stamp),
            _ => None,
        }
    }

    pub fn stamp_mut(&mut self) -> Option<&mut WorldStamp> {
        match self {
            Command::Sync(c) => Some(&mut c.stamp),
            Command::Tool(c) => Some(&mut c.stamp),
            Command::Check(c) => Some(&mut c.stamp),
            Command::PlayerControl(c) => Some(&mut c.stamp),
            Command::ScenarioState(c) => Some(&mut c.stamp),
            Command::ScenarioRules(c) => Some(&mut c.stamp),
            _ => None,
        }
    }

    /// True for command types that are safe to apply whenever they arrive;
    /// a past target step then simply means "apply now" instead of forcing a
    /// disconnect.
    pub fn order_insensitive(&self) -> bool {
        matches!(self, Command::Check(_))
    }

    fn write(&self, pkt: &mut Packet) {
        match self {
            Command::GameInfo(c) => {
                pkt.put_blob(&c.blob);
            }
            Command::Nickname(c) => {
                pkt.put_str(&c.nickname);
            }
            Command::Chat(c) => {
                pkt.put_str(&c.message);
                pkt.put_i8(c.company);
                pkt.put_str(&c.nickname);
                pkt.put_str(&c.destination);
            }
            Command::Join(c) => {
                pkt.put_str(&c.nickname);
                pkt.put_u8(c.answer);
                pkt.put_u32(c.assigned_id);
            }
            Command::Sync(c) => {
                c.stamp.rdwr_put(pkt);
                pkt.put_u32(c.target_client);
                pkt.put_u32(c.new_map_counter);
            }
            Command::GameTransfer(c) => {
                pkt.put_u32(c.length);
            }
            Command::Ready(c) => {
                pkt.put_u32(c.sync_step);
                pkt.put_u32(c.map_counter);
                c.checklist.rdwr_put(pkt);
            }
            Command::Tool(c) => {
                c.stamp.rdwr_put(pkt);
                pkt.put_bool(c.exec);
                pkt.put_u32(c.check_step);
                c.checklist.rdwr_put(pkt);
                c.call.rdwr_put(pkt);
            }
            Command::Check(c) => {
                c.stamp.rdwr_put(pkt);
                pkt.put_u32(c.check_step);
                c.checklist.rdwr_put(pkt);
            }
            Command::PakCheck(c) => {
                pkt.put_u8(c.phase);
                pkt.put_str(&c.name);
                pkt.put_blob(&c.checksum);
            }
            Command::Service(c) => {
                pkt.put_u16(c.flag);
                pkt.put_u32(c.number);
                pkt.put_str(&c.text);
            }
            Command::PlayerAuth(c) => {
                pkt.put_u8(c.player);
                pkt.put_blob(&c.hash);
                pkt.put_u16(c.unlock_mask);
            }
            Command::PlayerControl(c) => {
                c.stamp.rdwr_put(pkt);
                pkt.put_bool(c.exec);
                pkt.put_u8(c.action);
                pkt.put_u8(c.player);
                pkt.put_u16(c.param);
            }
            Command::ScenarioState(c) => {
                c.stamp.rdwr_put(pkt);
                pkt.put_u16(c.won);
                pkt.put_u16(c.lost);
            }
            Command::ScenarioRules(c) => {
                c.stamp.rdwr_put(pkt);
                pkt.put_bool(c.add);
                c.rule.rdwr_put(pkt);
            }
        }
    }

    fn read(kind_id: u16, pkt: &mut Packet) -> Option<Command> {
        let command = match kind_id {
            kind::GAME_INFO => Command::GameInfo(GameInfoCmd {
                blob: pkt.get_blob(),
            }),
            kind::NICKNAME => Command::Nickname(NicknameCmd {
                nickname: pkt.get_str(),
            }),
            kind::CHAT => Command::Chat(ChatCmd {
                message: pkt.get_str(),
                company: pkt.get_i8(),
                nickname: pkt.get_str(),
                destination: pkt.get_str(),
            }),
            kind::JOIN => Command::Join(JoinCmd {
                nickname: pkt.get_str(),
                answer: pkt.get_u8(),
                assigned_id: pkt.get_u32(),
            }),
            kind::SYNC => Command::Sync(SyncCmd {
                stamp: WorldStamp::rdwr_get(pkt),
                target_client: pkt.get_u32(),
                new_map_counter: pkt.get_u32(),
            }),
            kind::GAME_TRANSFER => Command::GameTransfer(GameTransferCmd {
                length: pkt.get_u32(),
            }),
            kind::READY => Command::Ready(ReadyCmd {
                sync_step: pkt.get_u32(),
                map_counter: pkt.get_u32(),
                checklist: Checklist::rdwr_get(pkt),
            }),
            kind::TOOL => Command::Tool(ToolCmd {
                stamp: WorldStamp::rdwr_get(pkt),
                exec: pkt.get_bool(),
                check_step: pkt.get_u32(),
                checklist: Checklist::rdwr_get(pkt),
                call: ToolCall::rdwr_get(pkt),
            }),
            kind::CHECK => Command::Check(CheckCmd {
                stamp: WorldStamp::rdwr_get(pkt),
                check_step: pkt.get_u32(),
                checklist: Checklist::rdwr_get(pkt),
            }),
            kind::PAK_CHECK => Command::PakCheck(PakCheckCmd {
                phase: pkt.get_u8(),
                name: pkt.get_str(),
                checksum: pkt.get_blob(),
            }),
            kind::SERVICE => Command::Service(ServiceCmd {
                flag: pkt.get_u16(),
                number: pkt.get_u32(),
                text: pkt.get_str(),
            }),
            kind::PLAYER_AUTH => Command::PlayerAuth(PlayerAuthCmd {
                player: pkt.get_u8(),
                hash: pkt.get_blob(),
                unlock_mask: pkt.get_u16(),
            }),
            kind::PLAYER_CONTROL => Command::PlayerControl(PlayerControlCmd {
                stamp: WorldStamp::rdwr_get(pkt),
                exec: pkt.get_bool(),
                action: pkt.get_u8(),
                player: pkt.get_u8(),
                param: pkt.get_u16(),
            }),
            kind::SCENARIO_STATE => Command::ScenarioState(ScenarioStateCmd {
                stamp: WorldStamp::rdwr_get(pkt),
                won: pkt.get_u16(),
                lost: pkt.get_u16(),
            }),
            kind::SCENARIO_RULES => Command::ScenarioRules(ScenarioRulesCmd {
                stamp: WorldStamp::rdwr_get(pkt),
                add: pkt.get_bool(),
                rule: ForbiddenRule::rdwr_get(pkt),
            }),
            other => {
                warn!("ignoring unknown command type id {}", other);
                return None;
            }
        };
        Some(command)
    }
}

/// A decoded command together with its originating client id. The id is on
/// every command (base-level concern) so re-broadcasts preserve attribution
/// to the true author rather than to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub sender: u32,
    pub command: Command,
}

impl Message {
    pub fn new(sender: u32, command: Command) -> Self {
        Message { sender, command }
    }

    /// Serializes into a fresh packet: type id in the header, then the
    /// 4-byte originating client id, then the command's fields in fixed
    /// order matching `decode`.
    pub fn encode(&self) -> Packet {
        let mut pkt = Packet::new(self.command.kind());
        pkt.put_u32(self.sender);
        self.command.write(&mut pkt);
        pkt
    }

    /// Hydrates a command from a fully-received packet. Returns `None` for
    /// failed packets, unsupported protocol versions, unknown type ids and
    /// short payloads; the caller treats all of those as "no command".
    pub fn decode(pkt: &mut Packet) -> Option<Message> {
        if pkt.has_failed() || !pkt.is_ready() {
            return None;
        }
        if pkt.version() != PROTOCOL_VERSION {
            warn!("dropping packet with protocol version {}", pkt.version());
            return None;
        }
        let sender = pkt.get_u32();
        let command = Command::read(pkt.kind(), pkt)?;
        if pkt.has_failed() {
            warn!("short payload for command type {}", pkt.kind());
            return None;
        }
        Some(Message { sender, command })
    }

    pub fn stamp(&self) -> Option<WorldStamp> {
        self.command.stamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forbidden::RuleKind;
    use crate::tool::{Coord3, TOOL_BUILD};

    fn roundtrip(msg: Message) -> Message {
        let mut pkt = msg.encode();
        let bytes = pkt.to_bytes().expect("encode failed").to_vec();
        let mut received = Packet::from_bytes(&bytes);
        Message::decode(&mut received).expect("decode failed")
    }

    fn sample_checklist() -> Checklist {
        Checklist {
            random_seed: 7,
            object_count: 8,
            player_mask: 9,
            state_hash: 10,
        }
    }

    #[test]
    fn test_roundtrip_every_command_family() {
        let samples = vec![
            Message::new(0, Command::GameInfo(GameInfoCmd { blob: vec![1, 2, 3] })),
            Message::new(
                4,
                Command::Nickname(NicknameCmd {
                    nickname: "Alice".to_string(),
                }),
            ),
            Message::new(
                4,
                Command::Chat(ChatCmd {
                    message: "hello all".to_string(),
                    company: 2,
                    nickname: "Alice".to_string(),
                    destination: String::new(),
                }),
            ),
            Message::new(
                3,
                Command::Join(JoinCmd {
                    nickname: "Bob".to_string(),
                    answer: 1,
                    assigned_id: 3,
                }),
            ),
            Message::new(
                0,
                Command::Sync(SyncCmd {
                    stamp: WorldStamp::new(100, 555),
                    target_client: 3,
                    new_map_counter: 556,
                }),
            ),
            Message::new(0, Command::GameTransfer(GameTransferCmd { length: 4096 })),
            Message::new(
                3,
                Command::Ready(ReadyCmd {
                    sync_step: 100,
                    map_counter: 556,
                    checklist: sample_checklist(),
                }),
            ),
            Message::new(
                2,
                Command::Tool(ToolCmd {
                    stamp: WorldStamp::new(101, 556),
                    exec: true,
                    check_step: 100,
                    checklist: sample_checklist(),
                    call: ToolCall {
                        player: 2,
                        tool_id: TOOL_BUILD,
                        waytype: 1,
                        pos: Coord3::new(10, -4, 2),
                        param: "7".to_string(),
                        init: false,
                        flags: 3,
                        custom: vec![9, 9, 9],
                    },
                }),
            ),
            Message::new(
                0,
                Command::Check(CheckCmd {
                    stamp: WorldStamp::new(104, 556),
                    check_step: 96,
                    checklist: sample_checklist(),
                }),
            ),
            Message::new(
                5,
                Command::PakCheck(PakCheckCmd {
                    phase: 2,
                    name: "pak.building".to_string(),
                    checksum: vec![0xAB; 20],
                }),
            ),
            Message::new(
                5,
                Command::Service(ServiceCmd {
                    flag: 9,
                    number: 1,
                    text: "hello".to_string(),
                }),
            ),
            Message::new(
                2,
                Command::PlayerAuth(PlayerAuthCmd {
                    player: 4,
                    hash: vec![0xCD; 20],
                    unlock_mask: 0b10110,
                }),
            ),
            Message::new(
                0,
                Command::PlayerControl(PlayerControlCmd {
                    stamp: WorldStamp::new(102, 556),
                    exec: true,
                    action: 1,
                    player: 5,
                    param: 0,
                }),
            ),
            Message::new(
                0,
                Command::ScenarioState(ScenarioStateCmd {
                    stamp: WorldStamp::new(103, 556),
                    won: 0b100,
                    lost: 0b010,
                }),
            ),
            Message::new(
                0,
                Command::ScenarioRules(ScenarioRulesCmd {
                    stamp: WorldStamp::new(103, 556),
                    add: true,
                    rule: ForbiddenRule {
                        kind: RuleKind::ForbidTool,
                        player: 2,
                        tool: 1,
                        waytype: 0,
                        cube: None,
                        message: "nope".to_string(),
                    },
                }),
            ),
        ];
        for msg in samples {
            let back = roundtrip(msg.clone());
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn test_sender_attribution_survives_roundtrip() {
        let msg = Message::new(
            42,
            Command::Chat(ChatCmd {
                message: "m".to_string(),
                company: 0,
                nickname: "n".to_string(),
                destination: String::new(),
            }),
        );
        assert_eq!(roundtrip(msg).sender, 42);
    }

    #[test]
    fn test_unknown_type_id_yields_no_command() {
        let mut pkt = Packet::new(999);
        pkt.put_u32(1);
        let bytes = pkt.to_bytes().unwrap().to_vec();
        let mut received = Packet::from_bytes(&bytes);
        assert!(received.is_ready());
        assert!(Message::decode(&mut received).is_none());
    }

    #[test]
    fn test_short_payload_yields_no_command() {
        // A Join frame whose payload stops after the client id.
        let mut pkt = Packet::new(kind::JOIN);
        pkt.put_u32(1);
        let bytes = pkt.to_bytes().unwrap().to_vec();
        let mut received = Packet::from_bytes(&bytes);
        assert!(Message::decode(&mut received).is_none());
    }

    #[test]
    fn test_failed_packet_yields_no_command() {
        let mut pkt = Packet::new(kind::CHAT);
        pkt.set_failed();
        assert!(Message::decode(&mut pkt).is_none());
    }

    #[test]
    fn test_world_command_classification() {
        let world = Command::Sync(SyncCmd::default());
        assert!(world.stamp().is_some());
        let plain = Command::Chat(ChatCmd::default());
        assert!(plain.stamp().is_none());
        // Ready controls pause state immediately; it is not queued.
        let ready = Command::Ready(ReadyCmd::default());
        assert!(ready.stamp().is_none());
        assert!(Command::Check(CheckCmd::default()).order_insensitive());
        assert!(!Command::Tool(ToolCmd::default()).order_insensitive());
    }
}
