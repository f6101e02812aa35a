// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

// Sponsor side of the lite bridge. A lite client opens one TCP link to
// this process, introduces itself with /_o2/o2lite/con, advertises its
// services, and runs the cut-down clock-sync protocol. Its services join
// the ensemble as if this process offered them; frames forwarded to the
// client keep their timestamps so the client can schedule or ignore them.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};

use mio;

use error::{Error, Result};
use msg::{Arg, Message};
use peer::HubRole;
use services::{ProviderEntry, ProviderKind};
use session::{Owner, Session};

pub struct Bridge {
    pub id: u32,
    pub tcp: mio::Token,
    pub udp_addr: Option<SocketAddr>,
    pub synced: bool,
}

pub struct LiteHost {
    pub bridges: HashMap<u32, Bridge>,
    next_id: u32,
}

impl LiteHost {
    pub fn new() -> LiteHost {
        LiteHost {
            bridges: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn by_token(&self, token: mio::Token) -> Option<u32> {
        self.bridges.values()
            .find(|b| b.tcp == token)
            .map(|b| b.id)
    }
}

/// Forward one message out a bridge link, timestamp intact.
pub fn send(sess: &mut Session, id: u32, msg: Message) -> Result<()> {
    let wire = msg.to_wire();
    sess.pool.free(msg.into_buf());
    let token = sess.lite.bridges.get(&id)
        .map(|b| b.tcp)
        .ok_or(Error::NoService(format!("bridge#{}", id)))?;

    sess.net.enqueue(token, &wire)
}

/// /_o2/o2lite/con (ip:s, udp_port:i): adopt the connection as a bridge
/// and hand the client its id.
pub fn handle_con(sess: &mut Session, _msg: &Message, args: &[Arg]) {
    let token = match sess.source {
        Some(token) => token,
        None => return,
    };
    let ip = args[0].str().unwrap_or("").parse().ok();
    let udp_port = args[1].i32().unwrap_or(0) as u16;
    let udp_addr = ip.map(|ip| SocketAddr::V4(SocketAddrV4::new(ip, udp_port)));

    let id = sess.lite.next_id;
    sess.lite.next_id += 1;
    sess.lite.bridges.insert(id, Bridge {
        id: id,
        tcp: token,
        udp_addr: udp_addr,
        synced: false,
    });
    sess.owners.insert(token, Owner::Lite(id));
    info!("[{:?}] lite client connected as bridge#{}", token, id);

    sess.writer.add_i32(id as i32);
    match sess.writer.finish("!_o2/id", 0.0, true) {
        Ok(reply) => {
            let _ = sess.net.enqueue(token, &reply.to_wire());
        }
        Err(e) => warn!("lite id reply build failed: '{}'", e),
    }
}

/// /_o2/o2lite/sv: service advertisements from the bridge client, the
/// same tuple stream as the peer protocol.
pub fn handle_sv(sess: &mut Session, msg: &Message, _args: &[Arg]) {
    let id = match sess.source.and_then(|t| sess.owners.get(&t).cloned()) {
        Some(Owner::Lite(id)) => id,
        _ => return,
    };
    let me = sess.name.clone();

    let mut ext = msg.unpack();
    while !ext.finished() {
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
                warn!("malformed lite sv from bridge#{}", id);
                return;
            }
        };
        if is_service == 0 {
            continue; // lite clients do not install taps
        }

        if exists != 0 {
            let added = sess.table.add_provider(&name, ProviderEntry {
                ident: me.clone(),
                kind: ProviderKind::Lite(id),
                properties: extra.clone(),
            });
            if added.is_ok() {
                let status = sess.status(&name);
                sess.notify_si(&name, status, &me, &extra);
                ::peer::send_sv_update(sess, &name, true, true, &extra);
            }
        } else {
            sess.service_dropped(&name, &me);
            ::peer::send_sv_update(sess, &name, false, true, "");
        }
    }
}

/// /_o2/o2lite/cs/get (serial:i, reply_to:s): answer with the global
/// time over the bridge's UDP return path.
pub fn handle_cs_get(sess: &mut Session, _msg: &Message, args: &[Arg]) {
    let id = match sess.source.and_then(|t| sess.owners.get(&t).cloned()) {
        Some(Owner::Lite(id)) => id,
        _ => return,
    };
    let serial = args[0].i32().unwrap_or(0);
    let reply_to = args[1].str().unwrap_or("").to_owned();

    let now = match sess.clock.global() {
        Some(now) => now,
        None => return, // no reference time to offer yet
    };
    let udp_addr = match sess.lite.bridges.get(&id).and_then(|b| b.udp_addr) {
        Some(addr) => addr,
        None => return,
    };

    sess.writer.add_i32(serial);
    sess.writer.add_time(now);
    match sess.writer.finish(&reply_to, 0.0, false) {
        Ok(reply) => {
            sess.net.send_udp(&udp_addr, &reply.to_wire());
        }
        Err(e) => warn!("lite cs reply build failed: '{}'", e),
    }
}

/// /_o2/o2lite/cs/cs: the client reports clock sync.
pub fn handle_cs_cs(sess: &mut Session, _msg: &Message, _args: &[Arg]) {
    let id = match sess.source.and_then(|t| sess.owners.get(&t).cloned()) {
        Some(Owner::Lite(id)) => id,
        _ => return,
    };

    if let Some(bridge) = sess.lite.bridges.get_mut(&id) {
        bridge.synced = true;
    }
    debug!("bridge#{} reports clock sync", id);

    let me = sess.name.clone();
    let promoted: Vec<String> = sess.table.services.iter()
        .filter(|&(_, entry)| match entry.active() {
            Some(p) => match p.kind {
                ProviderKind::Lite(owner) => owner == id,
                _ => false,
            },
            None => false,
        })
        .map(|(service, _)| service.clone())
        .collect();
    for service in promoted {
        let status = sess.status(&service);
        sess.notify_si(&service, status, &me, "");
    }
}

/// /_o2/o2lite/dy (ensemble:s): a lite client probing for a sponsor over
/// the discovery port; answer with our /dy info straight back.
pub fn handle_dy(sess: &mut Session, _msg: &Message, args: &[Arg]) {
    let ensemble = args[0].str().unwrap_or("");
    if ensemble != sess.ensemble {
        return;
    }
    let src = match sess.datagram_src {
        Some(src) => src,
        None => return,
    };

    match ::peer::dy_wire(sess, HubRole::None) {
        Ok(wire) => {
            sess.net.send_udp(&src, &wire);
        }
        Err(e) => warn!("lite dy reply build failed: '{}'", e),
    }
}

/// /_o2/o2lite/ls: stream the service directory back to the client,
/// finished by an empty name.
pub fn handle_ls(sess: &mut Session, _msg: &Message, _args: &[Arg]) {
    let token = match sess.source {
        Some(token) => token,
        None => return,
    };
    let mut services: Vec<String> = sess.table.services.keys().cloned().collect();
    services.sort();
    services.push(String::new()); // terminator

    for service in services {
        let status = if service.is_empty() {
            -1
        } else {
            sess.status(&service).id()
        };
        let props = sess.table.lookup(&service)
            .and_then(|e| e.active())
            .map(|p| p.properties.clone())
            .unwrap_or_default();

        sess.writer.add_str(&service);
        sess.writer.add_i32(status);
        sess.writer.add_str(&props);
        match sess.writer.finish("!_o2/ls", 0.0, true) {
            Ok(reply) => {
                let _ = sess.net.enqueue(token, &reply.to_wire());
            }
            Err(e) => {
                warn!("lite ls reply build failed: '{}'", e);
                return;
            }
        }
    }
}

/// /_o2/o2lite/st (service:s): answer one status query.
pub fn handle_st(sess: &mut Session, _msg: &Message, args: &[Arg]) {
    let token = match sess.source {
        Some(token) => token,
        None => return,
    };
    let service = args[0].str().unwrap_or("").to_owned();
    let status = sess.status(&service);

    sess.writer.add_str(&service);
    sess.writer.add_i32(status.id());
    match sess.writer.finish("!_o2/st", 0.0, true) {
        Ok(reply) => {
            let _ = sess.net.enqueue(token, &reply.to_wire());
        }
        Err(e) => warn!("lite st reply build failed: '{}'", e),
    }
}

/// A bridge link dropped: remove its services and notify.
pub fn bridge_lost(sess: &mut Session, id: u32) {
    sess.lite.bridges.remove(&id);
    info!("bridge#{} disconnected", id);

    let changes = sess.table.remove_lite(id);
    for (service, change) in changes {
        sess.announce_change(&service, &change);
        ::peer::send_sv_update(sess, &service, false, true, "");
    }
}
