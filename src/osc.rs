// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

// The OSC integration point: a service can delegate to an OSC server.
// Translation strips the service prefix from the address and drops the
// fabric header; type string and arguments are already OSC-shaped on the
// wire. An OSC server has no clock of ours, so timestamped messages are
// held here and the packet goes out at delivery time without a timetag
// bundle. Full OSC protocol translation lives outside the core.

use error::Result;
use global::padded_len;
use msg::Message;
use services::OscTarget;
use session::Session;

/// Build the OSC packet for a message addressed to `/<service><rest>`:
/// `<rest>` (or "/") padded, then the type string and arguments exactly
/// as they appear after the fabric header, in network order.
pub fn translate(msg: &Message, service: &str) -> Vec<u8> {
    let addr = msg.address();
    let rest = &addr[1 + service.len()..];
    let osc_addr = if rest.is_empty() { "/" } else { rest };

    let wire = msg.to_wire();
    let skip = ::msg::ADDR_OFF + padded_len(addr);
    let mut packet = Vec::with_capacity(padded_len(osc_addr) + wire.len() - skip);
    packet.extend_from_slice(osc_addr.as_bytes());
    packet.resize(padded_len(osc_addr), 0);
    packet.extend_from_slice(&wire[skip..]);

    packet
}

/// Forward one message to an OSC target: a single datagram, or a
/// length-prefixed frame on the delegate's TCP connection.
pub fn send(sess: &mut Session, target: &OscTarget, service: &str,
            msg: Message) -> Result<()> {
    let packet = translate(&msg, service);
    sess.pool.free(msg.into_buf());

    match target.tcp {
        Some(token) => sess.net.enqueue(token, &packet),
        None => {
            sess.net.send_udp(&target.addr, &packet);
            Ok(())
        }
    }
}
