//! Nonblocking socket event loop for the game server.
//!
//! One poller watches the listener plus every client socket. Each pass
//! drains readable sockets into framed packets, flushes pending outbound
//! frames, and surfaces what happened as a list of events for the game
//! layer to act on. All sockets stay nonblocking; partial frames simply
//! wait for the next pass.

use crate::roster::{Roster, SlotState};
use log::{debug, warn};
use polling::Poller;
use shared::command::Message;
use shared::packet::Packet;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

const LISTENER: usize = usize::MAX - 1;

/// What a poll pass observed, in arrival order.
#[derive(Debug)]
pub enum NetEvent {
    /// A socket was accepted into this roster slot.
    Connected(u32),
    /// A complete, decodable frame arrived from this client.
    Message(u32, Message),
    /// The socket died or the peer closed; the slot is already released.
    Disconnected(u32),
}

pub struct NetworkServer {
    listener: TcpListener,
    poller: Poller,
    events: Vec<polling::Event>,
}

impl NetworkServer {
    pub fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let poller = Poller::new()?;
        poller.add(&listener, polling::Event::readable(LISTENER))?;
        Ok(NetworkServer {
            listener,
            poller,
            events: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Waits up to `timeout` for socket activity and processes it.
    pub fn poll(&mut self, roster: &mut Roster, timeout: Duration) -> Vec<NetEvent> {
        let mut out = Vec::new();
        self.events.clear();
        match self.poller.wait(&mut self.events, Some(timeout)) {
            Ok(0) => return out,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return out,
            Err(e) => {
                warn!("poll failed: {}", e);
                return out;
            }
        }
        let events = std::mem::take(&mut self.events);
        for event in &events {
            if event.key == LISTENER {
                if let Err(e) = self
                    .poller
                    .modify(&self.listener, polling::Event::readable(LISTENER))
                {
                    warn!("could not re-arm the listener: {}", e);
                }
                self.accept_clients(roster, &mut out);
                continue;
            }
            let id = event.key as u32;
            if roster.state(id) == SlotState::Inactive {
                // Stale wakeup for a slot already released this pass.
                continue;
            }
            if event.readable && !self.read_frames(roster, id, &mut out) {
                self.drop_client(roster, id, &mut out);
                continue;
            }
            let slot = match roster.get_mut(id) {
                Some(s) => s,
                None => continue,
            };
            if event.writable && !slot.flush_sends() {
                self.drop_client(roster, id, &mut out);
                continue;
            }
            self.rearm(roster, id);
        }
        self.events = events;
        out
    }

    fn accept_clients(&mut self, roster: &mut Roster, out: &mut Vec<NetEvent>) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("could not configure socket from {}: {}", addr, e);
                        continue;
                    }
                    match roster.admit(stream, addr) {
                        Some(id) => {
                            let watched = roster.get(id).and_then(|s| s.stream.as_ref());
                            if let Some(stream) = watched {
                                if let Err(e) = self
                                    .poller
                                    .add(stream, polling::Event::readable(id as usize))
                                {
                                    warn!("could not watch client {}: {}", id, e);
                                    roster.release(id);
                                    continue;
                                }
                            }
                            out.push(NetEvent::Connected(id));
                        }
                        None => debug!("turned away a connection from {}", addr),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Drains every complete frame currently available from one socket.
    /// Returns false once the connection is dead.
    fn read_frames(&mut self, roster: &mut Roster, id: u32, out: &mut Vec<NetEvent>) -> bool {
        loop {
            let slot = match roster.get_mut(id) {
                Some(s) => s,
                None => return false,
            };
            let Some(stream) = slot.stream.as_mut() else {
                return false;
            };
            slot.recv.receive(stream);
            if slot.recv.has_failed() {
                return false;
            }
            if !slot.recv.is_ready() {
                return true;
            }
            let mut pkt = std::mem::replace(&mut slot.recv, Packet::for_receive());
            match Message::decode(&mut pkt) {
                Some(msg) => out.push(NetEvent::Message(id, msg)),
                None => debug!("discarded an undecodable frame from client {}", id),
            }
        }
    }

    /// Queues a frame to one client and arms the socket for writing if it
    /// could not be flushed in one go.
    pub fn send(&self, roster: &mut Roster, id: u32, pkt: Packet) {
        let Some(slot) = roster.get_mut(id) else {
            return;
        };
        if slot.stream.is_none() {
            return;
        }
        slot.send_queue.push_back(pkt);
        if !slot.flush_sends() {
            // The next poll pass notices the dead socket and releases it.
            warn!("send to client {} failed", id);
            return;
        }
        self.rearm(roster, id);
    }

    /// Queues one message to every playing remote client.
    pub fn broadcast(&self, roster: &mut Roster, msg: &Message) {
        for id in roster.playing_ids() {
            self.send(roster, id, msg.encode());
        }
    }

    /// Detaches a socket from the poller and frees its slot.
    pub fn drop_client(&self, roster: &mut Roster, id: u32, out: &mut Vec<NetEvent>) {
        if let Some(stream) = roster.get(id).and_then(|s| s.stream.as_ref()) {
            let _ = self.poller.delete(stream);
        }
        roster.release(id);
        out.push(NetEvent::Disconnected(id));
    }

    fn rearm(&self, roster: &Roster, id: u32) {
        let Some(slot) = roster.get(id) else {
            return;
        };
        let Some(stream) = slot.stream.as_ref() else {
            return;
        };
        let interest = polling::Event {
            key: id as usize,
            readable: true,
            writable: slot.wants_write(),
        };
        if let Err(e) = self.poller.modify(stream, interest) {
            warn!("could not re-arm client {}: {}", id, e);
        }
    }
}
