//! The authoritative game server: admission, command arbitration, the
//! join/resync procedure and the per-step drive of the simulation.
//!
//! Everything runs on one thread. Each frame the server polls its sockets,
//! handles whatever arrived, then advances the simulation one step and
//! drains the execution queue at the step boundary. Client-authored world
//! commands never execute directly; they are validated, stamped with a
//! future step and the current epoch, broadcast to every playing client,
//! and fed back into the server's own queue so the server applies them at
//! exactly the same step as everyone else.

use crate::admin::{svc, AdminGate};
use crate::network::{NetEvent, NetworkServer};
use crate::roster::{NetRange, Roster, SlotState};
use log::{debug, error, info, warn};
use rand::Rng;
use shared::checklist::ChecklistHistory;
use shared::command::{
    ChatCmd, CheckCmd, Command, GameInfoCmd, JoinCmd, Message, NicknameCmd, PakCheckCmd,
    PlayerAuthCmd, PlayerControlCmd, ReadyCmd, ScenarioRulesCmd, ScenarioStateCmd, ServiceCmd,
    SyncCmd, ToolCmd, WorldStamp,
};
use shared::forbidden::ForbiddenRule;
use shared::pakset::{PakTable, PAK_DATA, PAK_DONE, PAK_INIT, PAK_WANT_NEXT};
use shared::queue::{EnqueueOutcome, ExecQueue};
use shared::sim::Simulation;
use shared::tool::{ToolCache, ToolCall, MAX_PLAYERS, PUBLIC_PLAYER, TOOL_ADD_MESSAGE, TOOL_ERROR_MESSAGE};
use shared::transfer;
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Epochs the server remembers for validating Ready claims from clients
/// that are still catching up.
const EPOCH_HISTORY: usize = 7;

/// Scalar configuration handed in by the startup code.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub admin_password: Option<String>,
    /// Real time per simulated step.
    pub frame_ms: u64,
    /// Sync steps between two checklist broadcasts.
    pub sync_check_interval: u32,
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: "127.0.0.1:13353".to_string(),
            admin_password: None,
            frame_ms: 100,
            sync_check_interval: 16,
            max_clients: 16,
        }
    }
}

/// Outcome of validating a client-authored tool invocation.
#[derive(Debug, PartialEq)]
pub enum ToolVerdict {
    /// Broadcast this (possibly rewritten) call.
    Forward(ToolCall),
    /// Drop without any reply.
    Reject,
    /// Send this error-display call back to the offender only.
    Bounce(ToolCall),
}

/// Pure arbitration of one tool call: dialog tools never cross the network,
/// map-editing tools are forced onto the public player, the sender must
/// hold an unlock on the acting player (message posts fall back to the
/// public player instead), and the scenario rule set has the last word.
pub fn validate_tool(
    call: &ToolCall,
    unlock_mask: u16,
    sim: &dyn Simulation,
) -> ToolVerdict {
    if call.is_dialog() {
        return ToolVerdict::Reject;
    }
    // The player id indexes a u16 bitmask; anything wider is invalid wire
    // input, not a shift amount.
    if call.player >= MAX_PLAYERS {
        return ToolVerdict::Reject;
    }
    let mut call = call.clone();
    if call.is_map_edit() {
        call.player = PUBLIC_PLAYER;
    }
    if unlock_mask & (1 << call.player) == 0 {
        if call.base_id() == TOOL_ADD_MESSAGE {
            call.player = PUBLIC_PLAYER;
        } else {
            return ToolVerdict::Reject;
        }
    }
    if let Err(reason) = sim
        .rules()
        .allowed(call.player, call.base_id(), call.waytype, call.pos)
    {
        if call.init {
            return ToolVerdict::Reject;
        }
        // Work-phase rejections owe the player an explanation.
        return ToolVerdict::Bounce(ToolCall {
            player: call.player,
            tool_id: TOOL_ERROR_MESSAGE,
            waytype: call.waytype,
            pos: call.pos,
            param: reason.to_string(),
            init: false,
            flags: 0,
            custom: Vec::new(),
        });
    }
    ToolVerdict::Forward(call)
}

pub struct GameServer {
    config: ServerConfig,
    net: NetworkServer,
    roster: Roster,
    sim: Box<dyn Simulation>,
    queue: ExecQueue,
    tools: ToolCache,
    history: ChecklistHistory,
    epoch_history: VecDeque<u32>,
    pending_join: Option<u32>,
    paks: PakTable,
    admin: AdminGate,
    company_passwords: HashMap<u8, Vec<u8>>,
    save_path: PathBuf,
    last_check_step: u32,
    shutdown: bool,
}

impl GameServer {
    pub fn new(
        config: ServerConfig,
        sim: Box<dyn Simulation>,
        paks: PakTable,
    ) -> Result<Self, Box<dyn Error>> {
        let net = NetworkServer::bind(&config.address)?;
        let port = net.local_addr()?.port();
        let roster = Roster::new(config.max_clients);
        let admin = AdminGate::new(config.admin_password.clone());
        let mut epoch_history = VecDeque::with_capacity(EPOCH_HISTORY);
        epoch_history.push_back(sim.map_counter());
        info!("server listening on {}", net.local_addr()?);
        Ok(GameServer {
            config,
            net,
            roster,
            sim,
            queue: ExecQueue::new(),
            tools: ToolCache::new(),
            history: ChecklistHistory::new(),
            epoch_history,
            pending_join: None,
            paks,
            admin,
            company_passwords: HashMap::new(),
            save_path: PathBuf::from(format!("server{}-network.sve", port)),
            last_check_step: 0,
            shutdown: false,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.net.local_addr()
    }

    /// Runs the frame loop until an administrative shutdown.
    pub fn run(&mut self) {
        let frame = Duration::from_millis(self.config.frame_ms.max(1));
        let mut next_step = Instant::now() + frame;
        while !self.shutdown {
            let timeout = next_step.saturating_duration_since(Instant::now());
            let events = self.net.poll(&mut self.roster, timeout);
            for event in events {
                self.handle_event(event);
            }
            if Instant::now() >= next_step {
                self.advance();
                next_step += frame;
            }
        }
        info!("server shutting down");
    }

    /// One poll pass plus at most one simulation step; the frame loop in
    /// `run` and the tests both drive the server through this.
    pub fn tick(&mut self, poll_timeout: Duration) {
        let events = self.net.poll(&mut self.roster, poll_timeout);
        for event in events {
            self.handle_event(event);
        }
        self.advance();
    }

    fn handle_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connected(id) => {
                debug!("client {} awaiting its first command", id);
            }
            NetEvent::Message(id, msg) => self.handle_message(id, msg),
            NetEvent::Disconnected(id) => self.forget_client(id),
        }
    }

    /// Per-client cleanup shared by every disconnect path.
    fn forget_client(&mut self, id: u32) {
        self.admin.logout(id);
        self.tools.drop_client(id);
        if self.pending_join == Some(id) {
            info!("pending joiner {} vanished; join slot is free again", id);
            self.pending_join = None;
        }
    }

    /// Tears a client down on the server's initiative.
    fn disconnect(&mut self, id: u32) {
        let mut scratch = Vec::new();
        self.net.drop_client(&mut self.roster, id, &mut scratch);
        self.forget_client(id);
    }

    fn handle_message(&mut self, from: u32, msg: Message) {
        match msg.command {
            Command::GameInfo(_) => self.handle_game_info(from),
            Command::Nickname(c) => {
                let assigned = self.roster.arbitrate_nickname(from, &c.nickname);
                let reply = Message::new(0, Command::Nickname(NicknameCmd { nickname: assigned }));
                self.net.send(&mut self.roster, from, reply.encode());
            }
            Command::Chat(c) => self.handle_chat(from, c),
            Command::Join(_) => self.handle_join(from),
            Command::Ready(c) => self.handle_ready(from, c),
            Command::Tool(c) => self.handle_tool(from, c),
            Command::PakCheck(c) => self.handle_pak_check(from, c),
            Command::Service(c) => self.handle_service(from, c),
            Command::PlayerAuth(c) => self.handle_player_auth(from, c),
            Command::PlayerControl(c) => self.handle_player_control(from, c),
            // Server-authored families; a client has no business sending them.
            Command::Sync(_)
            | Command::Check(_)
            | Command::GameTransfer(_)
            | Command::ScenarioState(_)
            | Command::ScenarioRules(_) => {
                debug!(
                    "ignoring server-only command type {} from client {}",
                    msg.command.kind(),
                    from
                );
            }
        }
    }

    fn handle_game_info(&mut self, from: u32) {
        let info = self.sim.game_info();
        match info.to_blob() {
            Ok(blob) => {
                let reply = Message::new(0, Command::GameInfo(GameInfoCmd { blob }));
                self.net.send(&mut self.roster, from, reply.encode());
            }
            Err(e) => error!("could not serialize the game summary: {}", e),
        }
    }

    fn handle_chat(&mut self, from: u32, mut chat: ChatCmd) {
        // Attribution is the server's call, not the sender's.
        if let Some(slot) = self.roster.get(from) {
            chat.nickname = slot.nickname.clone();
        }
        if chat.destination.is_empty() {
            self.sim
                .log_message(&format!("{}: {}", chat.nickname, chat.message));
            let msg = Message::new(from, Command::Chat(chat));
            self.net.broadcast(&mut self.roster, &msg);
        } else if let Some(target) = self.roster.find_by_nickname(&chat.destination) {
            // Private chat is point to point and leaves no trace in the log.
            let msg = Message::new(from, Command::Chat(chat));
            self.net.send(&mut self.roster, target, msg.encode());
        } else {
            debug!("chat for unknown nickname '{}' dropped", chat.destination);
        }
    }

    fn handle_join(&mut self, from: u32) {
        let admissible =
            self.pending_join.is_none() && self.roster.state(from) == SlotState::Connected;
        let answer = if admissible { 1 } else { 0 };
        let nickname = self
            .roster
            .get(from)
            .map(|s| s.nickname.clone())
            .unwrap_or_default();
        let reply = Message::new(
            from,
            Command::Join(JoinCmd {
                nickname,
                answer,
                assigned_id: from,
            }),
        );
        self.net.send(&mut self.roster, from, reply.encode());
        if !admissible {
            if self.pending_join.is_some() {
                info!("refused join from client {} (another join pending)", from);
            } else {
                info!(
                    "refused join from client {} (slot state {:?})",
                    from,
                    self.roster.state(from)
                );
            }
            return;
        }
        self.pending_join = Some(from);
        self.start_sync(Some(from));
    }

    /// Mints a fresh epoch and schedules the save/reload cycle on every
    /// participant, optionally on behalf of a joining client.
    fn start_sync(&mut self, joiner: Option<u32>) {
        let new_epoch = self.mint_epoch();
        let stamp = WorldStamp::new(self.sim.sync_step() + 1, self.sim.map_counter());
        let sync = Message::new(
            0,
            Command::Sync(SyncCmd {
                stamp,
                target_client: joiner.unwrap_or(0),
                new_map_counter: new_epoch,
            }),
        );
        if let Some(id) = joiner {
            // The joiner is not Playing yet, so the broadcast filter would
            // miss it; address it explicitly first.
            self.net.send(&mut self.roster, id, sync.encode());
        }
        self.net.broadcast(&mut self.roster, &sync);
        self.enqueue_own(sync);
        // A paused world would never reach the stamped step.
        if self.sim.paused() {
            self.sim.set_pause(false);
        }
    }

    fn mint_epoch(&mut self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let epoch: u32 = rng.gen();
            if epoch != self.sim.map_counter() && !self.epoch_history.contains(&epoch) {
                if self.epoch_history.len() == EPOCH_HISTORY {
                    self.epoch_history.pop_front();
                }
                self.epoch_history.push_back(epoch);
                return epoch;
            }
        }
    }

    fn handle_ready(&mut self, from: u32, ready: ReadyCmd) {
        if !self.epoch_history.contains(&ready.map_counter) {
            warn!(
                "client {} claims unknown epoch {}; dropping it as out of sync",
                from, ready.map_counter
            );
            self.disconnect(from);
            return;
        }
        let checklist = self
            .history
            .get(ready.sync_step)
            .unwrap_or_default();
        let reply = Message::new(
            0,
            Command::Ready(ReadyCmd {
                sync_step: ready.sync_step,
                map_counter: ready.map_counter,
                checklist,
            }),
        );
        self.net.send(&mut self.roster, from, reply.encode());
    }

    fn handle_tool(&mut self, from: u32, cmd: ToolCmd) {
        if cmd.exec {
            debug!("client {} sent a pre-broadcast tool command", from);
            return;
        }
        let unlock_mask = self.roster.get(from).map(|s| s.unlock_mask).unwrap_or(0);
        match validate_tool(&cmd.call, unlock_mask, self.sim.as_ref()) {
            ToolVerdict::Reject => {}
            ToolVerdict::Bounce(call) => {
                let bounce = Message::new(
                    0,
                    Command::Tool(ToolCmd {
                        stamp: WorldStamp::new(self.sim.sync_step() + 1, self.sim.map_counter()),
                        exec: true,
                        check_step: 0,
                        checklist: Default::default(),
                        call,
                    }),
                );
                self.net.send(&mut self.roster, from, bounce.encode());
            }
            ToolVerdict::Forward(call) => {
                let (check_step, checklist) = self.history.latest().unwrap_or_default();
                let broadcast = Message::new(
                    from,
                    Command::Tool(ToolCmd {
                        stamp: WorldStamp::new(self.sim.sync_step() + 1, self.sim.map_counter()),
                        exec: true,
                        check_step,
                        checklist,
                        call,
                    }),
                );
                self.net.broadcast(&mut self.roster, &broadcast);
                self.enqueue_own(broadcast);
            }
        }
    }

    fn handle_player_control(&mut self, from: u32, cmd: PlayerControlCmd) {
        if cmd.exec {
            return;
        }
        // Company slot surgery is an operator action.
        if !self.admin.is_logged_in(from) {
            debug!("client {} is not an administrator; control change dropped", from);
            return;
        }
        let broadcast = Message::new(
            from,
            Command::PlayerControl(PlayerControlCmd {
                stamp: WorldStamp::new(self.sim.sync_step() + 1, self.sim.map_counter()),
                exec: true,
                ..cmd
            }),
        );
        self.net.broadcast(&mut self.roster, &broadcast);
        self.enqueue_own(broadcast);
    }

    fn handle_player_auth(&mut self, from: u32, auth: PlayerAuthCmd) {
        let player = auth.player;
        if player >= MAX_PLAYERS {
            debug!("client {} named out-of-range company {}; dropped", from, player);
            return;
        }
        let holds_unlock = self
            .roster
            .get(from)
            .map(|s| s.unlock_mask & (1 << player) != 0)
            .unwrap_or(false);
        if holds_unlock {
            // Already unlocked: this is a password (re)set for the company.
            if auth.hash.is_empty() {
                self.company_passwords.remove(&player);
                info!("company {} password cleared by client {}", player, from);
            } else {
                self.company_passwords.insert(player, auth.hash);
                info!("company {} password set by client {}", player, from);
            }
        } else {
            let stored = self.company_passwords.get(&player);
            let granted = match stored {
                None => true,
                Some(h) => *h == auth.hash,
            };
            if granted {
                if let Some(slot) = self.roster.get_mut(from) {
                    slot.unlock_mask |= 1 << player;
                }
            } else {
                debug!("client {} failed to unlock company {}", from, player);
            }
        }
        let mask = self.roster.get(from).map(|s| s.unlock_mask).unwrap_or(0);
        let reply = Message::new(
            0,
            Command::PlayerAuth(PlayerAuthCmd {
                player,
                hash: Vec::new(),
                unlock_mask: mask,
            }),
        );
        self.net.send(&mut self.roster, from, reply.encode());
    }

    fn handle_pak_check(&mut self, from: u32, cmd: PakCheckCmd) {
        let next = match cmd.phase {
            PAK_INIT => self.paks.first(),
            PAK_WANT_NEXT => self.paks.next_after(&cmd.name),
            other => {
                debug!("unexpected pakset-exchange phase {} from client {}", other, from);
                return;
            }
        };
        let reply = match next {
            Some(entry) => Message::new(
                0,
                Command::PakCheck(PakCheckCmd {
                    phase: PAK_DATA,
                    name: entry.name.clone(),
                    checksum: entry.checksum.to_vec(),
                }),
            ),
            None => Message::new(
                0,
                Command::PakCheck(PakCheckCmd {
                    phase: PAK_DONE,
                    name: String::new(),
                    checksum: Vec::new(),
                }),
            ),
        };
        self.net.send(&mut self.roster, from, reply.encode());
    }

    fn handle_service(&mut self, from: u32, cmd: ServiceCmd) {
        if !self.admin.authorized(from, cmd.flag) {
            debug!("unauthorized service request {} from client {}", cmd.flag, from);
            return;
        }
        if self.admin.throttled(cmd.flag) {
            self.service_reply(from, cmd.flag, 0, "cooldown active");
            return;
        }
        match cmd.flag {
            svc::LOGIN => {
                let ok = self.admin.try_login(from, &cmd.text);
                self.service_reply(from, svc::LOGIN, ok as u32, "");
            }
            svc::GET_CLIENT_LIST => {
                let mut lines = Vec::new();
                for id in 0..self.roster.len() as u32 {
                    if self.roster.state(id) == SlotState::Inactive {
                        continue;
                    }
                    if let Some(slot) = self.roster.get(id) {
                        lines.push(format!("{}:{}:{:?}", id, slot.nickname, slot.state));
                    }
                }
                self.service_reply(from, cmd.flag, 1, &lines.join("\n"));
            }
            svc::KICK_CLIENT => {
                let target = cmd.number;
                if target != 0 && target != from && self.roster.state(target) != SlotState::Inactive
                {
                    info!("kicking client {} on administrator request", target);
                    self.disconnect(target);
                    self.service_reply(from, cmd.flag, 1, "");
                } else {
                    self.service_reply(from, cmd.flag, 0, "no such client");
                }
            }
            svc::BAN_IP => self.handle_ban(from, &cmd),
            svc::UNBAN_IP => match cmd.text.parse::<NetRange>() {
                Ok(range) => {
                    self.roster.remove_ban(&range);
                    self.service_reply(from, cmd.flag, 1, "");
                }
                Err(e) => self.service_reply(from, cmd.flag, 0, &e),
            },
            svc::GET_BAN_LIST => {
                let list = self
                    .roster
                    .bans()
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join("\n");
                self.service_reply(from, cmd.flag, 1, &list);
            }
            svc::ADMIN_MSG => {
                let chat = Message::new(
                    0,
                    Command::Chat(ChatCmd {
                        message: cmd.text.clone(),
                        company: -1,
                        nickname: "Admin".to_string(),
                        destination: String::new(),
                    }),
                );
                self.sim.log_message(&format!("Admin: {}", cmd.text));
                self.net.broadcast(&mut self.roster, &chat);
                self.service_reply(from, cmd.flag, 1, "");
            }
            svc::GET_COMPANY_LIST => {
                let info = self.sim.game_info();
                self.service_reply(from, cmd.flag, info.companies as u32, "");
            }
            svc::REMOVE_COMPANY => {
                let control = Message::new(
                    0,
                    Command::PlayerControl(PlayerControlCmd {
                        stamp: WorldStamp::new(self.sim.sync_step() + 1, self.sim.map_counter()),
                        exec: true,
                        action: shared::sim::PLAYER_REMOVE,
                        player: cmd.number as u8,
                        param: 0,
                    }),
                );
                self.net.broadcast(&mut self.roster, &control);
                self.enqueue_own(control);
                self.service_reply(from, cmd.flag, 1, "");
            }
            svc::SHUTDOWN => {
                self.service_reply(from, cmd.flag, 1, "");
                info!("shutdown requested by administrator");
                self.shutdown = true;
            }
            svc::FORCE_SYNC => {
                self.start_sync(None);
                self.service_reply(from, cmd.flag, 1, "");
            }
            svc::ANNOUNCE => {
                // No listing service is wired up; answer with the summary a
                // listing would carry so the caller can verify liveness.
                let info = self.sim.game_info();
                info!("public announce requested by client {}", from);
                let line = format!(
                    "{}x{} {} ({} playing)",
                    info.size_x,
                    info.size_y,
                    info.pakset,
                    self.roster.playing_count()
                );
                self.service_reply(from, cmd.flag, 1, &line);
            }
            other => self.service_reply(from, other, 0, "unknown service flag"),
        }
    }

    fn handle_ban(&mut self, from: u32, cmd: &ServiceCmd) {
        if !cmd.text.is_empty() {
            match cmd.text.parse::<NetRange>() {
                Ok(range) => {
                    self.roster.add_ban(range);
                    self.service_reply(from, cmd.flag, 1, "");
                }
                Err(e) => self.service_reply(from, cmd.flag, 0, &e),
            }
            return;
        }
        // No range given: ban a connected client by id and drop it.
        let target = cmd.number;
        let addr = self.roster.get(target).and_then(|s| s.addr);
        match addr {
            Some(addr) if target != from => {
                if let std::net::IpAddr::V4(v4) = addr.ip() {
                    self.roster.add_ban(NetRange::new(v4, 32));
                }
                self.disconnect(target);
                self.service_reply(from, cmd.flag, 1, "");
            }
            _ => self.service_reply(from, cmd.flag, 0, "no such client"),
        }
    }

    fn service_reply(&mut self, to: u32, flag: u16, number: u32, text: &str) {
        let reply = Message::new(
            0,
            Command::Service(ServiceCmd {
                flag,
                number,
                text: text.to_string(),
            }),
        );
        self.net.send(&mut self.roster, to, reply.encode());
    }

    /// Feeds a freshly-broadcast command into the server's own queue; the
    /// server never loops commands through its own socket.
    fn enqueue_own(&mut self, msg: Message) {
        let outcome = self.queue.enqueue(
            msg,
            self.sim.sync_step(),
            self.sim.map_counter(),
            true,
        );
        if outcome != EnqueueOutcome::Queued {
            error!("server failed to queue its own command: {:?}", outcome);
        }
    }

    /// Advances the simulation one step, draining whatever is due first.
    fn advance(&mut self) {
        if self.sim.paused() {
            return;
        }
        let step = self.sim.sync_step();
        for msg in self.queue.drain_due(step) {
            self.execute(msg);
        }
        self.sim.step();
        let now = self.sim.sync_step();
        self.history.record(now, self.sim.checklist());
        if self.config.sync_check_interval > 0
            && now.saturating_sub(self.last_check_step) >= self.config.sync_check_interval
        {
            self.last_check_step = now;
            self.broadcast_check(now);
        }
    }

    fn broadcast_check(&mut self, step: u32) {
        let Some((check_step, checklist)) = self.history.latest() else {
            return;
        };
        let check = Message::new(
            0,
            Command::Check(CheckCmd {
                stamp: WorldStamp::new(step + 1, self.sim.map_counter()),
                check_step,
                checklist,
            }),
        );
        self.net.broadcast(&mut self.roster, &check);
    }

    fn execute(&mut self, msg: Message) {
        match msg.command {
            Command::Sync(c) => {
                if let Err(e) = self.execute_sync(&c) {
                    error!("resync failed: {}", e);
                    if let Some(joiner) = self.pending_join.take() {
                        self.disconnect(joiner);
                    }
                }
            }
            Command::Tool(c) => {
                if let Err(e) = self.tools.apply(self.sim.as_mut(), msg.sender, &c.call) {
                    warn!("tool {} from client {} failed: {}", c.call.tool_id, msg.sender, e);
                }
            }
            Command::PlayerControl(c) => {
                self.sim.control_player(c.action, c.player, c.param);
            }
            Command::ScenarioState(c) => self.sim.set_scenario_state(c.won, c.lost),
            Command::ScenarioRules(c) => self.sim.change_rule(c.add, &c.rule),
            other => debug!("no server-side execution for command type {}", other.kind()),
        }
    }

    /// The server's own half of a Sync: save, reload from the same bytes,
    /// adopt the new epoch, then bring the pending joiner (if any) up to
    /// state and into the Playing set.
    fn execute_sync(&mut self, sync: &SyncCmd) -> Result<(), Box<dyn Error>> {
        let bytes = self.sim.save()?;
        fs::write(&self.save_path, &bytes)?;
        self.sim.load(&bytes)?;
        self.sim.set_map_counter(sync.new_map_counter);
        self.history.clear();
        self.last_check_step = self.sim.sync_step();
        info!(
            "world reloaded at step {} under epoch {}",
            self.sim.sync_step(),
            sync.new_map_counter
        );

        let Some(joiner) = self.pending_join else {
            return Ok(());
        };
        let step = self.sim.sync_step();
        let checklist = self.sim.checklist();
        self.history.record(step, checklist);

        let result = self.stream_snapshot(joiner);
        match result {
            Ok(()) => {
                let ready = Message::new(
                    0,
                    Command::Ready(ReadyCmd {
                        sync_step: step,
                        map_counter: sync.new_map_counter,
                        checklist,
                    }),
                );
                self.net.send(&mut self.roster, joiner, ready.encode());
                self.roster.set_state(joiner, SlotState::Playing);
                self.pending_join = None;
                info!("client {} is now playing", joiner);
                Ok(())
            }
            Err(e) => {
                self.pending_join = None;
                self.disconnect(joiner);
                Err(e)
            }
        }
    }

    fn stream_snapshot(&mut self, joiner: u32) -> Result<(), Box<dyn Error>> {
        let path = self.save_path.clone();
        let slot = self
            .roster
            .get_mut(joiner)
            .ok_or("joiner left before the snapshot was sent")?;
        // Frames still queued for this socket (typically the Sync sent one
        // step earlier) must finish before the raw byte stream takes over,
        // or a partial frame would interleave mid-stream.
        if !slot.flush_pending_blocking(transfer::CHUNK_TIMEOUT) {
            return Err("joiner connection lost before the snapshot".into());
        }
        let stream = slot
            .stream
            .as_mut()
            .ok_or("joiner has no socket")?;
        let result = transfer::send_file(stream, &path, 0, |sent, total| {
            debug!("snapshot to client {}: {}/{} bytes", joiner, sent, total);
        });
        // The transfer ran in blocking mode; the event loop needs the
        // socket nonblocking again whatever happened.
        if let Some(stream) = slot.stream.as_ref() {
            stream.set_nonblocking(true)?;
        }
        result
    }

    /// Server-side scenario engine hooks: push a win/lose update or a rule
    /// change to every participant.
    pub fn push_scenario_state(&mut self, won: u16, lost: u16) {
        let msg = Message::new(
            0,
            Command::ScenarioState(ScenarioStateCmd {
                stamp: WorldStamp::new(self.sim.sync_step() + 1, self.sim.map_counter()),
                won,
                lost,
            }),
        );
        self.net.broadcast(&mut self.roster, &msg);
        self.enqueue_own(msg);
    }

    pub fn push_rule_change(&mut self, add: bool, rule: ForbiddenRule) {
        let msg = Message::new(
            0,
            Command::ScenarioRules(ScenarioRulesCmd {
                stamp: WorldStamp::new(self.sim.sync_step() + 1, self.sim.map_counter()),
                add,
                rule,
            }),
        );
        self.net.broadcast(&mut self.roster, &msg);
        self.enqueue_own(msg);
    }

    pub fn sim(&self) -> &dyn Simulation {
        self.sim.as_ref()
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::sim::GridWorld;
    use shared::tool::{Coord3, DIALOG_TOOL_BIT, MAP_EDIT_BIT, TOOL_BUILD};

    fn world_with_rule() -> GridWorld {
        let mut world = GridWorld::new("pak128", 32, 32);
        world.change_rule(
            true,
            &ForbiddenRule {
                kind: shared::forbidden::RuleKind::ForbidTool,
                player: 2,
                tool: TOOL_BUILD,
                waytype: 0,
                cube: None,
                message: "scenario forbids building".to_string(),
            },
        );
        world
    }

    fn call(player: u8, tool_id: u16) -> ToolCall {
        ToolCall {
            player,
            tool_id,
            waytype: 0,
            pos: Coord3::new(1, 1, 0),
            param: String::new(),
            init: true,
            flags: 0,
            custom: Vec::new(),
        }
    }

    #[test]
    fn test_dialog_tools_never_cross_the_network() {
        let world = GridWorld::new("pak128", 8, 8);
        let verdict = validate_tool(&call(1, TOOL_BUILD | DIALOG_TOOL_BIT), 0xFFFF, &world);
        assert_eq!(verdict, ToolVerdict::Reject);
    }

    #[test]
    fn test_map_edit_forces_public_player() {
        let world = GridWorld::new("pak128", 8, 8);
        let verdict = validate_tool(&call(3, TOOL_BUILD | MAP_EDIT_BIT), 1 << PUBLIC_PLAYER, &world);
        match verdict {
            ToolVerdict::Forward(c) => assert_eq!(c.player, PUBLIC_PLAYER),
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_unheld_player_is_rejected() {
        let world = GridWorld::new("pak128", 8, 8);
        // Unlock mask covers player 1 only; acting as player 3 is refused.
        let verdict = validate_tool(&call(3, TOOL_BUILD), 1 << 1, &world);
        assert_eq!(verdict, ToolVerdict::Reject);
    }

    #[test]
    fn test_out_of_range_player_is_rejected_not_shifted() {
        let world = GridWorld::new("pak128", 8, 8);
        // Wider than the u16 unlock mask; must be refused, never used as a
        // shift amount.
        let verdict = validate_tool(&call(200, TOOL_BUILD), 0xFFFF, &world);
        assert_eq!(verdict, ToolVerdict::Reject);
    }

    #[test]
    fn test_auth_for_out_of_range_company_is_dropped() {
        let world = GridWorld::new("pak128", 8, 8);
        let config = ServerConfig {
            address: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        let mut server = GameServer::new(config, Box::new(world), PakTable::new()).unwrap();
        server.handle_player_auth(
            1,
            PlayerAuthCmd {
                player: 200,
                hash: Vec::new(),
                unlock_mask: 0,
            },
        );
        assert_eq!(server.roster().get(1).map(|s| s.unlock_mask), Some(0));
    }

    #[test]
    fn test_message_post_falls_back_to_public_player() {
        let world = GridWorld::new("pak128", 8, 8);
        let verdict = validate_tool(&call(3, TOOL_ADD_MESSAGE), 0, &world);
        match verdict {
            ToolVerdict::Forward(c) => assert_eq!(c.player, PUBLIC_PLAYER),
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_scenario_rule_rejects_init_silently_and_bounces_work() {
        let world = world_with_rule();
        let mut forbidden = call(2, TOOL_BUILD);
        assert_eq!(
            validate_tool(&forbidden, 1 << 2, &world),
            ToolVerdict::Reject
        );
        forbidden.init = false;
        match validate_tool(&forbidden, 1 << 2, &world) {
            ToolVerdict::Bounce(c) => {
                assert_eq!(c.tool_id, TOOL_ERROR_MESSAGE);
                assert_eq!(c.param, "scenario forbids building");
            }
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_server_boots_and_steps() {
        let world = GridWorld::new("pak128", 8, 8);
        let config = ServerConfig {
            address: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        let mut server = GameServer::new(config, Box::new(world), PakTable::new()).unwrap();
        let before = server.sim().sync_step();
        server.tick(Duration::from_millis(1));
        server.tick(Duration::from_millis(1));
        assert_eq!(server.sim().sync_step(), before + 2);
        assert_eq!(server.roster().playing_count(), 0);
    }
}
