// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

// Remote-process records and the connection handshake: a /dy exchange
// fixes the peer record, a /sv exchange replays service advertisements
// in both directions, then clock sync begins.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use mio;

use error::Result;
use global::Status;
use msg::{Arg, Message};
use services::{ProviderEntry, ProviderKind, Tap};
use session::{Owner, Session};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PeerState {
    /// TCP connect issued, no handshake yet.
    Connecting,
    /// Handshake done, the peer's clock is not synchronized.
    ConnectedUnsynced,
    /// Handshake done and the peer reported clock sync.
    ConnectedSynced,
}

impl PeerState {
    pub fn name(&self) -> &'static str {
        match *self {
            PeerState::Connecting        => "Connecting",
            PeerState::ConnectedUnsynced => "ConnectedUnsynced",
            PeerState::ConnectedSynced   => "ConnectedSynced",
        }
    }
}

/// Hub involvement of a peer pair, carried in the /dy hello.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HubRole {
    None,
    /// The sender offers itself as the receiver's hub.
    IAmHub,
    /// The sender uses the receiver as its hub.
    RemoteIsHub,
    /// Short-lived connection asking the receiver to connect back.
    Callback,
}

impl HubRole {
    pub fn flag(&self) -> i32 {
        match *self {
            HubRole::None        => 0,
            HubRole::IAmHub      => 1,
            HubRole::RemoteIsHub => 2,
            HubRole::Callback    => 3,
        }
    }

    pub fn from_flag(flag: i32) -> HubRole {
        match flag {
            1 => HubRole::IAmHub,
            2 => HubRole::RemoteIsHub,
            3 => HubRole::Callback,
            _ => HubRole::None,
        }
    }
}

pub struct Peer {
    pub name: String,
    pub tcp: mio::Token,
    pub udp_addr: SocketAddr,
    pub state: PeerState,
    pub hub: HubRole,
    /// Our /sv replay has gone out on this connection.
    pub sv_sent: bool,
}

impl Peer {
    pub fn new(name: String, tcp: mio::Token, udp_addr: SocketAddr) -> Peer {
        Peer {
            name: name,
            tcp: tcp,
            udp_addr: udp_addr,
            state: PeerState::Connecting,
            hub: HubRole::None,
            sv_sent: false,
        }
    }
}

/// The wire image of our /dy message, shared by the handshake hello and
/// the discovery broadcast.
pub fn dy_wire(sess: &mut Session, role: HubRole) -> Result<Vec<u8>> {
    let ensemble = sess.ensemble.clone();
    let name = sess.name.clone();
    let ip = u32::from(sess.internal_ip) as i32;
    let (tcp_port, udp_port) = (sess.tcp_port as i32, sess.udp_port as i32);

    sess.writer.add_str(&ensemble);
    sess.writer.add_str(&name);
    sess.writer.add_i32(ip);
    sess.writer.add_i32(tcp_port);
    sess.writer.add_i32(udp_port);
    sess.writer.add_i32(role.flag());
    let msg = sess.writer.finish("!_o2/dy", 0.0, true)?;

    Ok(msg.to_wire())
}

/// Send our /dy hello on a peer connection.
pub fn send_dy(sess: &mut Session, token: mio::Token, role: HubRole) -> Result<()> {
    let wire = dy_wire(sess, role)?;

    debug!("[{:?}] dy hello sent as {:?}", token, role);
    sess.net.enqueue(token, &wire)
}

/// Send the full /sv replay: every locally offered service and tap.
pub fn send_sv_all(sess: &mut Session, token: mio::Token) -> Result<()> {
    let me = sess.name.clone();
    let mut entries: Vec<(String, bool, String)> = Vec::new(); // (name, is_service, extra)

    for (name, entry) in &sess.table.services {
        // internal services stay out of the advertisement
        if name == ::global::LOCAL_ALIAS || name.starts_with('@') {
            continue;
        }
        for provider in &entry.providers {
            if provider.ident == me {
                entries.push((name.clone(), true, provider.properties.clone()));
            }
        }
        for tap in &entry.taps {
            if tap.tapper_proc == me {
                entries.push((name.clone(), false, tap.tapper_service.clone()));
            }
        }
    }
    if entries.is_empty() {
        return Ok(());
    }
    for (name, is_service, extra) in entries {
        sess.writer.add_str(&name);
        sess.writer.add_i32(1);
        sess.writer.add_i32(is_service as i32);
        sess.writer.add_str(&extra);
    }
    let msg = sess.writer.finish("!_o2/sv", 0.0, true)?;
    sess.net.enqueue(token, &msg.to_wire())
}

/// Send an incremental /sv update to every connected peer.
pub fn send_sv_update(sess: &mut Session, name: &str, exists: bool,
                      is_service: bool, extra: &str) {
    let tokens: Vec<mio::Token> = sess.peers.values()
        .filter(|p| p.state != PeerState::Connecting)
        .map(|p| p.tcp)
        .collect();

    for token in tokens {
        sess.writer.add_str(name);
        sess.writer.add_i32(exists as i32);
        sess.writer.add_i32(is_service as i32);
        sess.writer.add_str(extra);
        let built = sess.writer.finish("!_o2/sv", 0.0, true);
        match built {
            Ok(msg) => {
                let _ = sess.net.enqueue(token, &msg.to_wire());
            }
            Err(e) => warn!("sv update build failed: '{}'", e),
        }
    }
}

/// The /dy handler. A datagram on a discovery socket is a candidate
/// announcement; a frame on a TCP connection is a handshake hello.
pub fn handle_dy(sess: &mut Session, _msg: &Message, args: &[Arg]) {
    let ensemble = args[0].str().unwrap_or("");
    let name = args[1].str().unwrap_or("").to_owned();
    let ip = Ipv4Addr::from(args[2].i32().unwrap_or(0) as u32);
    let tcp_port = args[3].i32().unwrap_or(0) as u16;
    let udp_port = args[4].i32().unwrap_or(0) as u16;
    let role = HubRole::from_flag(args[5].i32().unwrap_or(0));

    if ensemble != sess.ensemble {
        debug!("dy from foreign ensemble '{}' ignored", ensemble);
        return;
    }
    if name == sess.name || name.len() != 23 {
        return;
    }

    let source = sess.source;
    let from_udp = source == Some(sess.udp_server) ||
                   (source.is_some() && source == sess.disc.token());
    if from_udp {
        ::discovery::on_candidate(sess, &name, ip, tcp_port, udp_port);
        return;
    }
    let token = match source {
        Some(token) => token,
        None => return,
    };

    if role == HubRole::Callback {
        // the greater side asks us to connect; the connection it used is
        // disposable
        debug!("[{:?}] dy callback from '{}'", token, name);
        sess.net.close(token, true);
        sess.owners.remove(&token);
        ::discovery::on_candidate(sess, &name, ip, tcp_port, udp_port);
        return;
    }

    let udp_addr = SocketAddr::V4(SocketAddrV4::new(ip, udp_port));
    match sess.owners.get(&token).cloned() {
        Some(Owner::PeerNamed(expected)) => {
            if expected != name {
                let handshaken = sess.peers.get(&expected)
                    .map(|p| p.state != PeerState::Connecting)
                    .unwrap_or(false);
                if handshaken {
                    // a hub forwarding somebody else's discovery info
                    ::discovery::on_candidate(sess, &name, ip, tcp_port, udp_port);
                } else {
                    warn!("[{:?}] dy name mismatch: '{}' vs '{}'",
                          token, expected, name);
                    sess.drop_peer(token);
                }
                return;
            }
            // reply hello on the connection we initiated
            if let Some(peer) = sess.peers.get_mut(&name) {
                peer.state = PeerState::ConnectedUnsynced;
                peer.udp_addr = udp_addr;
                peer.hub = role;
            }
            finish_handshake(sess, &name, token);
        }
        Some(Owner::PendingPeer) | Some(Owner::PeerUnknown) => {
            // hello on an accepted connection (or the hub's reply on one
            // we initiated blind): fix the peer record
            let reply = sess.owners.get(&token).cloned() ==
                        Some(Owner::PendingPeer);
            let mut peer = Peer::new(name.clone(), token, udp_addr);
            peer.state = PeerState::ConnectedUnsynced;
            peer.hub = role;
            sess.peers.insert(name.clone(), peer);
            sess.owners.insert(token, Owner::PeerNamed(name.clone()));
            if reply {
                let _ = send_dy(sess, token, HubRole::None);
            }
            finish_handshake(sess, &name, token);
        }
        _ => {
            debug!("[{:?}] unexpected dy from '{}'", token, name);
        }
    }
}

/// Both sides know each other: install the peer's name service, replay
/// our services, honor hub duties, and let clock sync begin.
fn finish_handshake(sess: &mut Session, name: &str, token: mio::Token) {
    let change = sess.table.add_provider(name, ProviderEntry {
        ident: name.to_owned(),
        kind: ProviderKind::Remote,
        properties: String::new(),
    });
    if change.is_ok() {
        sess.notify_si(name, Status::RemoteNoTime, name, "");
    }

    let sv_sent = sess.peers.get(name).map(|p| p.sv_sent).unwrap_or(true);
    if !sv_sent {
        if let Err(e) = send_sv_all(sess, token) {
            warn!("[{:?}] sv replay failed: '{}'", token, e);
        }
        if let Some(peer) = sess.peers.get_mut(name) {
            peer.sv_sent = true;
        }
    }

    let hub_duty = sess.peers.get(name).map(|p| p.hub) == Some(HubRole::RemoteIsHub);
    if hub_duty {
        ::discovery::replay_known_peers(sess, token);
    }

    // a peer that joined after we synchronized still needs to hear it
    if sess.clock.is_synced() {
        let me = sess.name.clone();
        sess.writer.reset();
        sess.writer.add_str(&me);
        match sess.writer.finish("!_o2/cs/cs", 0.0, true) {
            Ok(msg) => {
                let _ = sess.net.enqueue(token, &msg.to_wire());
            }
            Err(e) => warn!("cs replay build failed: '{}'", e),
        }
    }
    info!("peer '{}' connected", name);
}

/// The /sv handler: install or remove remote services and taps
/// advertised by the sending peer.
pub fn handle_sv(sess: &mut Session, msg: &Message, _args: &[Arg]) {
    let sender = match sess.source.and_then(|t| sess.owners.get(&t).cloned()) {
        Some(Owner::PeerNamed(name)) => name,
        _ => {
            debug!("sv from unknown source ignored");
            return;
        }
    };

    let mut ext = msg.unpack();
    loop {
        if ext.finished() {
            break;
        }
        let parsed = (|| -> Result<(String, i32, i32, String)> {
            let name = ext.get('s')?.str().unwrap_or("").to_owned();
            let exists = ext.get('i')?.i32().unwrap_or(0);
            let is_service = ext.get('i')?.i32().unwrap_or(0);
            let extra = ext.get('s')?.str().unwrap_or("").to_owned();
            Ok((name, exists, is_service, extra))
        })();
        let (name, exists, is_service, extra) = match parsed {
            Ok(tuple) => tuple,
            Err(_) => {
                warn!("malformed sv from '{}'", sender);
                return;
            }
        };
        if name == ::global::LOCAL_ALIAS || name.starts_with('@') {
            continue; // nobody else provides our internal services
        }

        if is_service != 0 {
            if exists != 0 {
                let change = sess.table.add_provider(&name, ProviderEntry {
                    ident: sender.clone(),
                    kind: ProviderKind::Remote,
                    properties: extra,
                });
                if let Ok(::services::Change::NewActive(_)) = change {
                    let status = sess.status(&name);
                    let props = sess.table.lookup(&name)
                        .and_then(|e| e.active())
                        .map(|p| p.properties.clone())
                        .unwrap_or_default();
                    sess.notify_si(&name, status, &sender, &props);
                }
            } else {
                sess.service_dropped(&name, &sender);
            }
        } else {
            let tap = Tap {
                tapper_service: extra,
                tapper_proc: sender.clone(),
            };
            if exists != 0 {
                let tapper = tap.tapper_service.clone();
                if sess.table.add_tap(&name, tap).is_ok() {
                    sess.notify_si(&name, Status::Tap, &sender, &tapper);
                }
            } else {
                let _ = sess.table.remove_tap(&name, &tap);
            }
        }
    }
}

/// The /cs/cs handler: a peer reports that its clock is now synchronized.
pub fn handle_cs_cs(sess: &mut Session, _msg: &Message, args: &[Arg]) {
    let name = args[0].str().unwrap_or("").to_owned();

    if let Some(peer) = sess.peers.get_mut(&name) {
        peer.state = PeerState::ConnectedSynced;
    } else {
        return;
    }
    debug!("peer '{}' reports clock sync", name);

    // every service it actively provides moves to a synced status
    let promoted: Vec<String> = sess.table.services.iter()
        .filter(|&(_, entry)| entry.active().map(|p| p.ident == name)
                                             .unwrap_or(false))
        .map(|(service, _)| service.clone())
        .collect();
    for service in promoted {
        let status = sess.status(&service);
        sess.notify_si(&service, status, &name, "");
    }
}

#[cfg(test)]
mod tests {
    use super::HubRole;

    #[test]
    fn hub_roles_round_trip_their_wire_flag() {
        for role in [HubRole::None, HubRole::IAmHub,
                     HubRole::RemoteIsHub, HubRole::Callback].iter() {
            assert_eq!(*role, HubRole::from_flag(role.flag()));
        }
    }
}
