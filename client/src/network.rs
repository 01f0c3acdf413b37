//! Client-side protocol driver: the blocking join handshake, the
//! nonblocking live loop, and the lock-step execution of broadcast world
//! commands.

use log::{debug, error, info, warn};
use shared::checklist::ChecklistHistory;
use shared::command::{
    ChatCmd, Command, GameInfoCmd, JoinCmd, Message, NicknameCmd, PakCheckCmd, ReadyCmd, SyncCmd,
    ToolCmd, WorldStamp,
};
use shared::info::GameInfo;
use shared::packet::Packet;
use shared::pakset::{PakCompare, PakReport, PakTable, PAK_DATA, PAK_DONE, PAK_INIT, PAK_WANT_NEXT};
use shared::queue::{EnqueueOutcome, ExecQueue};
use shared::sim::Simulation;
use shared::tool::{ToolCache, ToolCall, TOOL_ERROR_MESSAGE};
use shared::transfer;
use std::error::Error;
use std::fs;
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

/// Per-reply wait during the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Frames of the wrong type tolerated while waiting for a specific one.
const RETRY_BUDGET: usize = 16;

/// A connected, playing participant.
pub struct Client {
    stream: TcpStream,
    pub client_id: u32,
    pub nickname: String,
    sim: Box<dyn Simulation>,
    queue: ExecQueue,
    tools: ToolCache,
    history: ChecklistHistory,
    recv: Packet,
    save_path: PathBuf,
    /// Chat lines and bounced error messages, oldest first; the UI layer
    /// drains this.
    pub messages: Vec<String>,
}

impl Client {
    /// Asks a server for its game summary without joining. The connection
    /// is consumed; probing and playing use separate sockets.
    pub fn probe(address: &str) -> Result<GameInfo, Box<dyn Error>> {
        let mut stream = TcpStream::connect(address).map_err(|e| format!("Bad address: {}", e))?;
        let query = Message::new(0, Command::GameInfo(GameInfoCmd::default()));
        send_handshake(&mut stream, query)?;
        let reply = await_command(&mut stream, |c| matches!(c, Command::GameInfo(_)))?;
        match reply.command {
            Command::GameInfo(c) => GameInfo::from_blob(&c.blob),
            _ => unreachable!(),
        }
    }

    /// Runs the full join handshake: pakset comparison, nickname
    /// arbitration, admission, snapshot download and the initial Ready
    /// exchange. On success the returned client is live and unpaused.
    pub fn connect(
        address: &str,
        nickname: &str,
        local_paks: &PakTable,
        mut sim: Box<dyn Simulation>,
    ) -> Result<Client, Box<dyn Error>> {
        let mut stream = TcpStream::connect(address).map_err(|e| format!("Bad address: {}", e))?;

        let report = compare_paksets(&mut stream, local_paks)?;
        if !report.matches() {
            return Err(format!("pakset mismatch:\n{}", report).into());
        }

        send_handshake(
            &mut stream,
            Message::new(
                0,
                Command::Nickname(NicknameCmd {
                    nickname: nickname.to_string(),
                }),
            ),
        )?;
        let reply = await_command(&mut stream, |c| matches!(c, Command::Nickname(_)))?;
        let nickname = match reply.command {
            Command::Nickname(c) => c.nickname,
            _ => unreachable!(),
        };

        send_handshake(&mut stream, Message::new(0, Command::Join(JoinCmd::default())))?;
        let reply = await_command(&mut stream, |c| matches!(c, Command::Join(_)))?;
        let join = match reply.command {
            Command::Join(c) => c,
            _ => unreachable!(),
        };
        if join.answer == 0 {
            return Err("Server busy (another join is pending)".into());
        }
        let client_id = join.assigned_id;
        info!("admitted as client {} ({})", client_id, nickname);

        // The server now schedules a resync; wait for our copy of it.
        let reply = await_command(&mut stream, |c| matches!(c, Command::Sync(_)))?;
        let sync = match reply.command {
            Command::Sync(c) => c,
            _ => unreachable!(),
        };

        // Snapshot announcement, then the raw bytes.
        let reply = await_command(&mut stream, |c| matches!(c, Command::GameTransfer(_)))?;
        let length = match reply.command {
            Command::GameTransfer(c) => c.length,
            _ => unreachable!(),
        };
        let save_path = PathBuf::from(format!("client{}-network.sve", client_id));
        transfer::receive_file(&mut stream, &save_path, length, |got, total| {
            debug!("snapshot download: {}/{} bytes", got, total);
        })?;
        sim.load(&fs::read(&save_path)?)?;
        sim.set_map_counter(sync.new_map_counter);
        sim.set_pause(true);

        // The unpause signal carries the authoritative checklist.
        let reply = await_command(&mut stream, |c| matches!(c, Command::Ready(_)))?;
        let ready = match reply.command {
            Command::Ready(c) => c,
            _ => unreachable!(),
        };
        if ready.map_counter != sim.map_counter() {
            return Err("Protocol error (unexpected epoch after resync)".into());
        }
        let local = sim.checklist();
        if local != ready.checklist {
            return Err(format!(
                "state differs right after the snapshot: local {} server {}",
                local, ready.checklist
            )
            .into());
        }
        sim.set_pause(false);

        let mut history = ChecklistHistory::new();
        history.record(sim.sync_step(), local);
        let ack = Message::new(
            client_id,
            Command::Ready(ReadyCmd {
                sync_step: sim.sync_step(),
                map_counter: sim.map_counter(),
                checklist: local,
            }),
        );
        send_handshake(&mut stream, ack)?;

        stream.set_nonblocking(true)?;
        Ok(Client {
            stream,
            client_id,
            nickname,
            sim,
            queue: ExecQueue::new(),
            tools: ToolCache::new(),
            history,
            recv: Packet::for_receive(),
            save_path,
            messages: Vec::new(),
        })
    }

    pub fn sim(&self) -> &dyn Simulation {
        self.sim.as_ref()
    }

    /// One frame: pump the socket, then advance the simulation one step if
    /// unpaused. An error means the connection can no longer be trusted
    /// and the client must drop it.
    pub fn tick(&mut self) -> Result<(), Box<dyn Error>> {
        self.pump()?;
        if self.sim.paused() {
            return Ok(());
        }
        let step = self.sim.sync_step();
        // The whole batch due at this step belongs to the epoch live when
        // the step begins; a Sync inside the batch changes the epoch for
        // later steps, not for its own. A command queued under an epoch
        // this client never adopted is from a different world incarnation
        // and makes the connection untrustworthy.
        let epoch = self.sim.map_counter();
        for msg in self.queue.drain_due(step) {
            if let Some(stamp) = msg.stamp() {
                if stamp.map_counter != epoch && !msg.command.order_insensitive() {
                    return Err(format!(
                        "command for epoch {} came due under epoch {}; state can no longer be trusted",
                        stamp.map_counter, epoch
                    )
                    .into());
                }
            }
            self.execute(msg)?;
        }
        self.sim.step();
        self.history.record(self.sim.sync_step(), self.sim.checklist());
        Ok(())
    }

    /// Drains every complete frame currently available on the socket.
    fn pump(&mut self) -> Result<(), Box<dyn Error>> {
        loop {
            self.recv.receive(&mut self.stream);
            if self.recv.has_failed() {
                return Err("connection to the server lost".into());
            }
            if !self.recv.is_ready() {
                return Ok(());
            }
            let mut pkt = std::mem::replace(&mut self.recv, Packet::for_receive());
            if let Some(msg) = Message::decode(&mut pkt) {
                self.route(msg)?;
            }
        }
    }

    fn route(&mut self, msg: Message) -> Result<(), Box<dyn Error>> {
        match &msg.command {
            Command::Ready(ready) => {
                if ready.map_counter != self.sim.map_counter() {
                    return Err("server resumed under a different epoch".into());
                }
                if let Some(local) = self.history.get(ready.sync_step) {
                    if local != ready.checklist {
                        warn!(
                            "checklist differs at step {}: local {} server {}",
                            ready.sync_step, local, ready.checklist
                        );
                    }
                }
                if self.sim.paused() {
                    info!("unpaused at step {}", ready.sync_step);
                    self.sim.set_pause(false);
                }
                Ok(())
            }
            Command::Chat(chat) => {
                self.messages.push(format!("{}: {}", chat.nickname, chat.message));
                Ok(())
            }
            Command::GameTransfer(_) => {
                // Snapshots only travel during a handshake or resync.
                debug!("unexpected transfer announcement ignored");
                Ok(())
            }
            _ if msg.stamp().is_some() => {
                let outcome = self.queue.enqueue(
                    msg,
                    self.sim.sync_step(),
                    self.sim.map_counter(),
                    false,
                );
                match outcome {
                    EnqueueOutcome::Stale => {
                        Err("command for a step already passed; state can no longer be trusted"
                            .into())
                    }
                    // Epoch mismatches are logged at enqueue time and
                    // re-checked against the live epoch when the command
                    // comes due.
                    _ => Ok(()),
                }
            }
            other => {
                debug!("no client-side route for command type {}", other.kind());
                Ok(())
            }
        }
    }

    fn execute(&mut self, msg: Message) -> Result<(), Box<dyn Error>> {
        match msg.command {
            Command::Sync(c) => self.execute_sync(&c),
            Command::Tool(c) => {
                if c.call.tool_id == TOOL_ERROR_MESSAGE {
                    // Display-only bounce from the server.
                    self.messages.push(format!("Error: {}", c.call.param));
                    return Ok(());
                }
                if let Err(e) = self.tools.apply(self.sim.as_mut(), msg.sender, &c.call) {
                    warn!("tool {} failed locally: {}", c.call.tool_id, e);
                }
                Ok(())
            }
            Command::Check(c) => {
                match self.history.get(c.check_step) {
                    Some(local) if local != c.checklist => Err(format!(
                        "desync detected at step {}: local {} server {}",
                        c.check_step, local, c.checklist
                    )
                    .into()),
                    Some(_) => Ok(()),
                    None => {
                        debug!("no local checklist for step {}; skipping", c.check_step);
                        Ok(())
                    }
                }
            }
            Command::PlayerControl(c) => {
                self.sim.control_player(c.action, c.player, c.param);
                Ok(())
            }
            Command::ScenarioState(c) => {
                self.sim.set_scenario_state(c.won, c.lost);
                Ok(())
            }
            Command::ScenarioRules(c) => {
                self.sim.change_rule(c.add, &c.rule);
                Ok(())
            }
            other => {
                debug!("no execution for command type {}", other.kind());
                Ok(())
            }
        }
    }

    /// A server-scheduled resync: save, reload from the same bytes, adopt
    /// the new epoch, report Ready and pause until the server resumes us.
    fn execute_sync(&mut self, sync: &SyncCmd) -> Result<(), Box<dyn Error>> {
        let bytes = self.sim.save()?;
        fs::write(&self.save_path, &bytes)?;
        self.sim.load(&bytes)?;
        self.sim.set_map_counter(sync.new_map_counter);
        self.history.clear();
        self.sim.set_pause(true);
        info!(
            "reloaded at step {} under epoch {}",
            self.sim.sync_step(),
            sync.new_map_counter
        );
        let checklist = self.sim.checklist();
        self.history.record(self.sim.sync_step(), checklist);
        let ready = Message::new(
            self.client_id,
            Command::Ready(ReadyCmd {
                sync_step: self.sim.sync_step(),
                map_counter: sync.new_map_counter,
                checklist,
            }),
        );
        self.send(ready)
    }

    /// Proposes a tool invocation to the server. Nothing happens locally
    /// until the broadcast copy comes back with exec set.
    pub fn send_tool(&mut self, call: ToolCall) -> Result<(), Box<dyn Error>> {
        let msg = Message::new(
            self.client_id,
            Command::Tool(ToolCmd {
                stamp: WorldStamp::new(self.sim.sync_step(), self.sim.map_counter()),
                exec: false,
                check_step: 0,
                checklist: Default::default(),
                call,
            }),
        );
        self.send(msg)
    }

    /// Sends a chat line; an empty destination broadcasts to everyone.
    pub fn send_chat(&mut self, message: &str, destination: &str) -> Result<(), Box<dyn Error>> {
        let msg = Message::new(
            self.client_id,
            Command::Chat(ChatCmd {
                message: message.to_string(),
                company: -1,
                nickname: self.nickname.clone(),
                destination: destination.to_string(),
            }),
        );
        self.send(msg)
    }

    fn send(&mut self, msg: Message) -> Result<(), Box<dyn Error>> {
        let mut pkt = msg.encode();
        if pkt.send_blocking(&mut self.stream, Duration::from_secs(2)) {
            Ok(())
        } else {
            Err("could not send to the server".into())
        }
    }
}

/// Walks the server's pakset fingerprint table one entry at a time and
/// compares it against the local one.
fn compare_paksets(
    stream: &mut TcpStream,
    local: &PakTable,
) -> Result<PakReport, Box<dyn Error>> {
    let mut compare = PakCompare::new(local);
    send_handshake(
        stream,
        Message::new(
            0,
            Command::PakCheck(PakCheckCmd {
                phase: PAK_INIT,
                name: String::new(),
                checksum: Vec::new(),
            }),
        ),
    )?;
    loop {
        let reply = await_command(stream, |c| matches!(c, Command::PakCheck(_)))?;
        let cmd = match reply.command {
            Command::PakCheck(c) => c,
            _ => unreachable!(),
        };
        match cmd.phase {
            PAK_DATA => {
                compare.offer(&cmd.name, &cmd.checksum);
                send_handshake(
                    stream,
                    Message::new(
                        0,
                        Command::PakCheck(PakCheckCmd {
                            phase: PAK_WANT_NEXT,
                            name: cmd.name,
                            checksum: Vec::new(),
                        }),
                    ),
                )?;
            }
            PAK_DONE => return Ok(compare.finish()),
            other => return Err(format!("Protocol error (pakset phase {})", other).into()),
        }
    }
}

fn send_handshake(stream: &mut TcpStream, msg: Message) -> Result<(), Box<dyn Error>> {
    let mut pkt = msg.encode();
    if pkt.send_blocking(stream, HANDSHAKE_TIMEOUT) {
        Ok(())
    } else {
        Err("could not send to the server".into())
    }
}

/// Waits for the next frame matching `want`, tolerating a bounded number
/// of unrelated frames in between.
fn await_command<F>(stream: &mut TcpStream, want: F) -> Result<Message, Box<dyn Error>>
where
    F: Fn(&Command) -> bool,
{
    for _ in 0..RETRY_BUDGET {
        let mut pkt = Packet::for_receive();
        if !pkt.receive_blocking(stream, HANDSHAKE_TIMEOUT) {
            return Err("server did not respond".into());
        }
        match Message::decode(&mut pkt) {
            Some(msg) if want(&msg.command) => return Ok(msg),
            Some(msg) => debug!("ignoring frame of type {} during handshake", msg.command.kind()),
            None => error!("undecodable frame during handshake"),
        }
    }
    Err("Protocol error (expected frame never arrived)".into())
}
