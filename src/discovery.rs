// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

// Peer discovery. The broadcast backend rotates /dy announcements through
// a fixed port table with exponential backoff; a resolver backend (mDNS
// and friends) stays outside the core and injects candidates through
// Session::discovered. Either way a candidate goes through the same
// ordering tie-break so each peer pair ends up with exactly one TCP
// connection.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use mio;

use global::parse_proc_name;
use peer::{HubRole, Peer, PeerState};
use session::{Owner, Session};

/// The well-known discovery ports, tried in order for the receive socket
/// and rotated through for announcements.
pub const PORT_TABLE: [u16; 16] = [64541, 60238, 57143, 55764, 56975, 62711,
                                   57571, 53472, 51779, 63714, 53304, 61696,
                                   50665, 49404, 64828, 54859];

const PERIOD_MIN: f64 = 0.1;
const PERIOD_MAX: f64 = 4.0;
const PERIOD_DECAY: f64 = 1.25;

/// Backend restarts after this long with no candidate activity.
const ACTIVITY_TIMEOUT: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscMode {
    /// Announce and listen on the LAN port table.
    Broadcast,
    /// An external resolver feeds Session::discovered; stay quiet.
    Resolver,
    /// A nominated hub is the sole discovery source; stay quiet too.
    Hub,
}

pub struct Discovery {
    mode: DiscMode,
    token: Option<mio::Token>,
    period: f64,
    next_send: f64,
    port_idx: usize,
    /// Ports whose last send failed; they stay in the rotation and are
    /// retried on the next pass.
    port_failed: [bool; 16],
    last_activity: f64,
    hub_target: Option<SocketAddr>,
    hub_connected: bool,
    hub_token: Option<mio::Token>,
}

impl Discovery {
    pub fn new(mode: DiscMode, hub_target: Option<SocketAddr>) -> Discovery {
        Discovery {
            mode: mode,
            token: None,
            period: PERIOD_MIN,
            next_send: 0.0,
            port_idx: 0,
            port_failed: [false; 16],
            last_activity: 0.0,
            hub_target: hub_target,
            hub_connected: false,
            hub_token: None,
        }
    }

    pub fn mode(&self) -> DiscMode {
        self.mode
    }

    pub fn token(&self) -> Option<mio::Token> {
        self.token
    }

    pub fn hub_token(&self) -> Option<mio::Token> {
        self.hub_token
    }

    pub fn saw_activity(&mut self, now: f64) {
        self.last_activity = now;
    }
}

/// Bind the discovery receive socket on the first free table port.
pub fn start(sess: &mut Session) {
    if sess.disc.mode != DiscMode::Broadcast {
        return;
    }
    for port in PORT_TABLE.iter() {
        match sess.net.udp_server(*port) {
            Ok((token, _)) => {
                sess.disc.token = Some(token);
                debug!("discovery listening on port {}", port);
                return;
            }
            Err(_) => continue,
        }
    }
    warn!("discovery: no port of the table is free, announce only");
}

/// One discovery pass: announce on the next table port, and restart the
/// backend when nothing has been heard for too long.
pub fn tick(sess: &mut Session, now: f64) {
    match sess.disc.mode {
        DiscMode::Broadcast => broadcast_tick(sess, now),
        DiscMode::Hub => hub_tick(sess, now),
        DiscMode::Resolver => {}
    }
}

fn broadcast_tick(sess: &mut Session, now: f64) {
    if now - sess.disc.last_activity > ACTIVITY_TIMEOUT {
        sess.disc.period = PERIOD_MIN;
        sess.disc.last_activity = now;
        debug!("discovery restarted after inactivity");
    }
    if now < sess.disc.next_send {
        return;
    }

    let idx = sess.disc.port_idx;
    let port = PORT_TABLE[idx];
    if sess.disc.port_failed[idx] {
        debug!("retrying discovery port {}", port);
    }
    let wire = match ::peer::dy_wire(sess, HubRole::None) {
        Ok(wire) => wire,
        Err(e) => {
            warn!("discovery announce build failed: '{}'", e);
            return;
        }
    };
    let broadcast = SocketAddr::V4(
        SocketAddrV4::new(Ipv4Addr::new(255, 255, 255, 255), port));
    let local = SocketAddr::V4(
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port));
    let sent = sess.net.send_udp(&broadcast, &wire);
    sess.net.send_udp(&local, &wire);
    sess.disc.port_failed[idx] = !sent;
    if sess.debug.contains(::global::DebugFlags::DISCOVERY) {
        info!("announced on port {} (next in {:.1}s)", port, sess.disc.period);
    }

    sess.disc.port_idx = (idx + 1) % PORT_TABLE.len();
    sess.disc.period = (sess.disc.period * PERIOD_DECAY).min(PERIOD_MAX);
    sess.disc.next_send = now + sess.disc.period;
}

fn hub_tick(sess: &mut Session, now: f64) {
    if sess.disc.hub_connected || now < sess.disc.next_send {
        return;
    }
    let target = match sess.disc.hub_target {
        Some(target) => target,
        None => return,
    };

    match sess.net.connect(target) {
        Ok(token) => {
            sess.owners.insert(token, Owner::PeerUnknown);
            sess.disc.hub_connected = true;
            sess.disc.hub_token = Some(token);
            debug!("[{:?}] connecting to hub {}", token, target);
        }
        Err(e) => {
            warn!("hub connect to {} failed: '{}'", target, e);
            sess.disc.period = (sess.disc.period * PERIOD_DECAY).min(PERIOD_MAX);
            sess.disc.next_send = now + sess.disc.period;
        }
    }
}

/// The hub connection dropped; try again after a backoff.
pub fn hub_lost(sess: &mut Session) {
    sess.disc.hub_connected = false;
    sess.disc.hub_token = None;
    sess.disc.next_send = sess.clock.local() + sess.disc.period;
}

/// Ordering tie-break for a discovered candidate: the side with the
/// smaller identity connects; the greater side pokes the smaller one with
/// a short-lived callback connection so it connects back.
pub fn on_candidate(sess: &mut Session, name: &str, ip: Ipv4Addr,
                    tcp_port: u16, udp_port: u16) {
    let now = sess.clock.local();
    sess.disc.saw_activity(now);

    if name == sess.name || sess.peers.contains_key(name) {
        return;
    }
    let tcp_addr = SocketAddr::V4(SocketAddrV4::new(ip, tcp_port));
    let udp_addr = SocketAddr::V4(SocketAddrV4::new(ip, udp_port));

    if name > sess.name.as_str() {
        // their identity wins: we initiate the one connection of the pair
        match sess.net.connect(tcp_addr) {
            Ok(token) => {
                sess.owners.insert(token, Owner::PeerNamed(name.to_owned()));
                sess.peers.insert(name.to_owned(),
                                  Peer::new(name.to_owned(), token, udp_addr));
                debug!("[{:?}] candidate '{}' is greater, connecting", token, name);
            }
            Err(e) => warn!("connect to candidate '{}' failed: '{}'", name, e),
        }
    } else {
        match sess.net.connect(tcp_addr) {
            Ok(token) => {
                sess.owners.insert(token, Owner::TempCallback);
                debug!("[{:?}] candidate '{}' is lesser, sending callback",
                       token, name);
            }
            Err(e) => warn!("callback to candidate '{}' failed: '{}'", name, e),
        }
    }
}

/// Hub duty: replay every connected peer to a hub client as /dy info.
pub fn replay_known_peers(sess: &mut Session, token: mio::Token) {
    let known: Vec<(String, SocketAddr)> = sess.peers.values()
        .filter(|p| p.state != PeerState::Connecting && p.tcp != token)
        .map(|p| (p.name.clone(), p.udp_addr))
        .collect();

    for (name, udp_addr) in known {
        let id = match parse_proc_name(&name) {
            Ok(id) => id,
            Err(_) => continue,
        };
        let ensemble = sess.ensemble.clone();
        sess.writer.add_str(&ensemble);
        sess.writer.add_str(&name);
        sess.writer.add_i32(u32::from(id.internal) as i32);
        sess.writer.add_i32(id.tcp_port as i32);
        sess.writer.add_i32(udp_addr.port() as i32);
        sess.writer.add_i32(HubRole::None.flag());
        match sess.writer.finish("!_o2/dy", 0.0, true) {
            Ok(msg) => {
                let _ = sess.net.enqueue(token, &msg.to_wire());
            }
            Err(e) => warn!("dy replay build failed: '{}'", e),
        }
    }
}

/// Parse a resolver TXT record ("name=<proc>", "vers=<x.y.z>") into the
/// pieces Session::discovered wants. Resolvers stay thin.
pub fn parse_txt(txt: &[(String, String)]) -> Option<(String, (u8, u8, u8))> {
    let mut name = None;
    let mut vers = None;

    for &(ref key, ref value) in txt {
        if key == "name" && value.len() == 23 {
            name = Some(value.clone());
        }
        if key == "vers" {
            let mut parts = value.split('.')
                                 .filter_map(|p| p.parse::<u8>().ok());
            if let (Some(a), Some(b), Some(c)) =
                   (parts.next(), parts.next(), parts.next()) {
                vers = Some((a, b, c));
            }
        }
    }
    match (name, vers) {
        (Some(name), Some(vers)) => Some((name, vers)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txt_records_parse_name_and_version() {
        let txt = vec![
            ("name".to_owned(), "@00000000:c0a8010a:1f41".to_owned()),
            ("vers".to_owned(), "1.2.3".to_owned()),
        ];
        let (name, vers) = parse_txt(&txt).unwrap();
        assert_eq!("@00000000:c0a8010a:1f41", name);
        assert_eq!((1, 2, 3), vers);

        assert!(parse_txt(&[("vers".to_owned(), "1.2".to_owned())]).is_none());
    }

    #[test]
    fn the_port_table_is_the_wire_contract() {
        // shared with every deployed build; a change here is a protocol break
        assert_eq!(16, PORT_TABLE.len());
        assert_eq!(64541, PORT_TABLE[0]);
        assert_eq!(54859, PORT_TABLE[15]);
    }
}
