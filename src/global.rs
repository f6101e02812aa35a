// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::cell::Cell;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::rc::Rc;

use error::{Error, Result};

/// Status of a service as seen from the local process.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Status {
    /// The service is not known here.
    Unknown,
    /// Provided by a local handler, the local clock is not yet synchronized.
    LocalNoTime,
    /// Provided by a remote peer that has not synchronized its clock.
    RemoteNoTime,
    /// Provided by a bridged lite client that has not synchronized.
    BridgeNoTime,
    /// Forwarded to an OSC server, the local clock is not yet synchronized.
    ToOscNoTime,
    /// Provided by a local handler, clock synchronized.
    Local,
    /// Provided by a remote peer, clock synchronized.
    Remote,
    /// Provided by a bridged lite client, synchronized.
    Bridge,
    /// Forwarded to an OSC server, local clock synchronized.
    ToOsc,
    /// A tap installation, not a callable provider.
    Tap,
}

impl Status {
    pub fn id(&self) -> i32 {
        match *self {
            Status::Unknown      => -1,
            Status::LocalNoTime  => 0,
            Status::RemoteNoTime => 1,
            Status::BridgeNoTime => 2,
            Status::ToOscNoTime  => 3,
            Status::Local        => 4,
            Status::Remote       => 5,
            Status::Bridge       => 6,
            Status::ToOsc        => 7,
            Status::Tap          => 8,
        }
    }

    pub fn from_id(id: i32) -> Status {
        match id {
            0 => Status::LocalNoTime,
            1 => Status::RemoteNoTime,
            2 => Status::BridgeNoTime,
            3 => Status::ToOscNoTime,
            4 => Status::Local,
            5 => Status::Remote,
            6 => Status::Bridge,
            7 => Status::ToOsc,
            8 => Status::Tap,
            _ => Status::Unknown,
        }
    }

    /// The synchronized counterpart of a no-time status, self otherwise.
    pub fn synced(&self) -> Status {
        match *self {
            Status::LocalNoTime  => Status::Local,
            Status::RemoteNoTime => Status::Remote,
            Status::BridgeNoTime => Status::Bridge,
            Status::ToOscNoTime  => Status::ToOsc,
            other                => other,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "{:?}", self)
    }
}

/// Debug log categories, combined into a bitset on the session builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugFlags(pub u32);

impl DebugFlags {
    pub const NONE: DebugFlags      = DebugFlags(0);
    pub const DISCOVERY: DebugFlags = DebugFlags(1);
    pub const MESSAGES: DebugFlags  = DebugFlags(2);
    pub const CLOCK: DebugFlags     = DebugFlags(4);
    pub const MEMORY: DebugFlags    = DebugFlags(8);
    pub const ALL: DebugFlags       = DebugFlags(0xf);

    pub fn contains(&self, other: DebugFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Clone)]
pub struct IdSequence {
    value: Rc<Cell<usize>>
}

impl IdSequence {
    pub fn new() -> IdSequence {
        IdSequence { value: Rc::new(Cell::new(0)) }
    }

    pub fn next(&self) -> usize {
        let id = self.value.get();

        self.value.set(id + 1);
        id
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        IdSequence::new()
    }
}

pub const VERSION: (u8, u8, u8) = (0, 1, 2);

pub fn version_int() -> i32 {
    ((VERSION.0 as i32) << 16) | ((VERSION.1 as i32) << 8) | VERSION.2 as i32
}

/// Round a byte count up to the 32-bit boundary every wire field sits on.
pub fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Size of a zero-terminated, zero-padded wire string: at least one
/// terminating zero, then padding to the next word boundary.
pub fn padded_len(s: &str) -> usize {
    (s.len() / 4 + 1) * 4
}

/// Alias under which the local process addresses itself.
pub const LOCAL_ALIAS: &'static str = "_o2";

/// Format the 28-char process identity `@PUB:INT:PORT`.
pub fn proc_name(public: Ipv4Addr, internal: Ipv4Addr, tcp_port: u16) -> String {
    format!("@{:08x}:{:08x}:{:04x}",
            u32::from(public), u32::from(internal), tcp_port)
}

pub struct ProcId {
    pub public: Ipv4Addr,
    pub internal: Ipv4Addr,
    pub tcp_port: u16,
}

/// Parse a process identity back into its address triple.
pub fn parse_proc_name(name: &str) -> Result<ProcId> {
    if name.len() != 23 || !name.starts_with('@') {
        return Err(Error::BadName(name.to_owned()));
    }
    let bytes = name.as_bytes();
    if bytes[9] != b':' || bytes[18] != b':' {
        return Err(Error::BadName(name.to_owned()));
    }
    let bad = |_| Error::BadName(name.to_owned());
    let public = u32::from_str_radix(&name[1..9], 16).map_err(&bad)?;
    let internal = u32::from_str_radix(&name[10..18], 16).map_err(&bad)?;
    let tcp_port = u16::from_str_radix(&name[19..23], 16).map_err(&bad)?;

    Ok(ProcId {
        public: Ipv4Addr::from(public),
        internal: Ipv4Addr::from(internal),
        tcp_port: tcp_port,
    })
}

/// An ensemble name is printable, non-empty, at most 63 chars, no slashes.
pub fn check_ensemble_name(name: &str) -> Result<()> {
    let ok = !name.is_empty() && name.len() <= 63 &&
             name.chars().all(|c| c.is_ascii() && !c.is_control() && c != '/');

    if ok {
        Ok(())
    } else {
        Err(Error::BadName(name.to_owned()))
    }
}

/// A service name has no slashes and fits in a wire string.
pub fn check_service_name(name: &str) -> Result<()> {
    let ok = !name.is_empty() && name.len() <= 63 &&
             !name.contains('/') && !name.contains('!');

    if ok {
        Ok(())
    } else {
        Err(Error::BadName(name.to_owned()))
    }
}

/// The LAN address of this host, found by routing a dummy datagram.
/// No packet is sent; connect() just selects the outgoing interface.
pub fn internal_ip() -> Ipv4Addr {
    let probe = || -> ::std::io::Result<Ipv4Addr> {
        let sock = UdpSocket::bind("0.0.0.0:0")?;
        sock.connect("8.8.8.8:80")?;
        match sock.local_addr()? {
            SocketAddr::V4(sa) => Ok(*sa.ip()),
            SocketAddr::V6(_)  => Ok(Ipv4Addr::new(127, 0, 0, 1)),
        }
    };

    probe().unwrap_or(Ipv4Addr::new(127, 0, 0, 1))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn id_sequence_can_be_cloned() {
        let seq = IdSequence::new();
        let other = seq.clone();

        assert_eq!(0, other.next());
        assert_eq!(1, seq.next());
        assert_eq!(2, seq.next());
        assert_eq!(3, other.next());
    }

    #[test]
    fn proc_name_orders_and_round_trips() {
        let a = proc_name(Ipv4Addr::new(0, 0, 0, 0), Ipv4Addr::new(192, 168, 1, 10), 8001);
        let b = proc_name(Ipv4Addr::new(0, 0, 0, 0), Ipv4Addr::new(192, 168, 1, 10), 8002);

        assert_eq!(23, a.len());
        assert!(a < b);

        let id = parse_proc_name(&a).unwrap();
        assert_eq!(Ipv4Addr::new(192, 168, 1, 10), id.internal);
        assert_eq!(8001, id.tcp_port);
    }

    #[test]
    fn padded_len_always_terminates() {
        assert_eq!(4, padded_len(""));
        assert_eq!(4, padded_len("abc"));
        assert_eq!(8, padded_len("abcd"));
    }

    #[test]
    fn ensemble_names_are_checked() {
        assert!(check_ensemble_name("test").is_ok());
        assert!(check_ensemble_name("").is_err());
        assert!(check_ensemble_name("a/b").is_err());
    }
}
