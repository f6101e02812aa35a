// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

// The provider capability: every non-local destination presents the same
// send/status surface. Local subtrees never reach `forward` because the
// dispatcher terminates in a handler; remote peers get the frame over
// their TCP link (or a datagram when the message is flagged UDP), OSC
// targets get a translated packet, lite bridges get the frame intact so
// the client can apply its own scheduling policy.

use mio;

use error::{Error, Result};
use global::Status;
use msg::Message;
use peer::PeerState;
use services::{OscTarget, ProviderKind};
use session::Session;

enum Route {
    Peer(String),
    Osc(OscTarget),
    Lite(u32),
}

/// Status of the active provider of `service`.
pub fn status_of(sess: &Session, service: &str) -> Status {
    let entry = match sess.table.lookup(service) {
        Some(entry) => entry,
        None => return Status::Unknown,
    };
    let provider = match entry.active() {
        Some(provider) => provider,
        None => return Status::Unknown,
    };

    match provider.kind {
        ProviderKind::Node(_) => {
            if sess.clock.is_synced() {
                Status::Local
            } else {
                Status::LocalNoTime
            }
        }
        ProviderKind::Remote => {
            let synced = sess.peers.get(&provider.ident)
                .map(|p| p.state == PeerState::ConnectedSynced)
                .unwrap_or(false);
            if synced { Status::Remote } else { Status::RemoteNoTime }
        }
        ProviderKind::Osc(_) => {
            if sess.clock.is_synced() {
                Status::ToOsc
            } else {
                Status::ToOscNoTime
            }
        }
        ProviderKind::Lite(id) => {
            let synced = sess.lite.bridges.get(&id)
                .map(|b| b.synced)
                .unwrap_or(false);
            if synced { Status::Bridge } else { Status::BridgeNoTime }
        }
    }
}

/// Forward a message to the active non-local provider of `service`.
pub fn forward(sess: &mut Session, service: &str, msg: Message) -> Result<()> {
    let route = match sess.table.lookup(service).and_then(|e| e.active()) {
        Some(provider) => match provider.kind {
            ProviderKind::Remote => Some(Route::Peer(provider.ident.clone())),
            ProviderKind::Osc(ref target) => Some(Route::Osc(target.clone())),
            ProviderKind::Lite(id) => Some(Route::Lite(id)),
            ProviderKind::Node(_) => None,
        },
        None => None,
    };

    match route {
        Some(Route::Peer(ident)) => send_to_proc(sess, &ident, msg),
        Some(Route::Osc(target)) => ::osc::send(sess, &target, service, msg),
        Some(Route::Lite(id)) => ::lite::send(sess, id, msg),
        None => {
            sess.pool.free(msg.into_buf());
            Err(Error::NoService(service.to_owned()))
        }
    }
}

/// Ship a message to a named process, over its TCP link or as a datagram
/// to its UDP port per the message's transport flag.
pub fn send_to_proc(sess: &mut Session, ident: &str, msg: Message) -> Result<()> {
    let (token, udp_addr, ready) = match sess.peers.get(ident) {
        Some(peer) => (peer.tcp, peer.udp_addr,
                       peer.state != PeerState::Connecting),
        None => {
            sess.pool.free(msg.into_buf());
            return Err(Error::NoService(ident.to_owned()));
        }
    };
    let wire = msg.to_wire();
    let tcp = msg.is_tcp();
    sess.pool.free(msg.into_buf());
    if !ready {
        return Err(Error::Blocked);
    }

    if tcp {
        sess.net.enqueue(token, &wire)
    } else {
        sess.net.send_udp(&udp_addr, &wire);
        Ok(())
    }
}

/// The TCP link carrying the active provider of `service`, for callers
/// that want blocking back-pressure semantics after a send.
pub fn tcp_link(sess: &Session, service: &str) -> Option<mio::Token> {
    let provider = sess.table.lookup(service).and_then(|entry| entry.active())?;

    match provider.kind {
        ProviderKind::Remote => sess.peers.get(&provider.ident).map(|p| p.tcp),
        ProviderKind::Osc(ref target) => target.tcp,
        ProviderKind::Lite(id) => sess.lite.bridges.get(&id).map(|b| b.tcp),
        ProviderKind::Node(_) => None,
    }
}
