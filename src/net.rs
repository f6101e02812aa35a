// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

// Non-blocking TCP/UDP plumbing around one mio poll. Sockets are kept in a
// token-keyed map; tokens are never reused, and removal is deferred to an
// after-sweep pass so event handling never invalidates a live entry.
// TCP frames are a 4-byte network-order length prefix followed by the
// message body; a frame announcing more than MAX_FRAME closes the socket.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{self, SocketAddr};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use mio;
use mio::net::{TcpListener, TcpStream, UdpSocket};

use error::{invalid_data_io_error, other_io_error, Result};
use global::IdSequence;
use mem::Pool;
use msg::MAX_FRAME;

/// Role of a socket record.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NetTag {
    UdpServer,
    TcpServer,
    TcpConnecting,
    TcpClient,
    TcpConnection,
    Closed,
}

impl NetTag {
    pub fn name(&self) -> &'static str {
        match *self {
            NetTag::UdpServer     => "UdpServer",
            NetTag::TcpServer     => "TcpServer",
            NetTag::TcpConnecting => "TcpConnecting",
            NetTag::TcpClient     => "TcpClient",
            NetTag::TcpConnection => "TcpConnection",
            NetTag::Closed        => "Closed",
        }
    }

    fn is_stream(&self) -> bool {
        match *self {
            NetTag::TcpConnecting | NetTag::TcpClient | NetTag::TcpConnection => true,
            _ => false,
        }
    }
}

/// What one poll pass surfaced to the layer above.
pub enum NetEvent {
    /// A listening socket produced a new connection record.
    Accepted(mio::Token, mio::Token),
    /// An outgoing connect completed.
    Connected(mio::Token),
    /// An outgoing connect failed.
    ConnectFailed(mio::Token),
    /// A complete TCP frame body arrived.
    Frame(mio::Token, Vec<u8>),
    /// A UDP datagram arrived.
    Datagram(mio::Token, Vec<u8>, SocketAddr),
    /// The peer closed or the socket errored; the record is being removed.
    Hup(mio::Token),
}

impl NetEvent {
    pub fn name(&self) -> &'static str {
        match *self {
            NetEvent::Accepted(..)      => "Accepted",
            NetEvent::Connected(_)      => "Connected",
            NetEvent::ConnectFailed(_)  => "ConnectFailed",
            NetEvent::Frame(..)         => "Frame",
            NetEvent::Datagram(..)      => "Datagram",
            NetEvent::Hup(_)            => "Hup",
        }
    }
}

enum Sock {
    Stream(TcpStream),
    Listener(TcpListener),
    Udp(UdpSocket),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RecvStep {
    Prefix,
    Payload,
}

struct RecvOp {
    step: RecvStep,
    read: usize,
    prefix: [u8; 4],
    buffer: Vec<u8>,
}

impl RecvOp {
    fn new() -> RecvOp {
        RecvOp {
            step: RecvStep::Prefix,
            read: 0,
            prefix: [0u8; 4],
            buffer: Vec::new(),
        }
    }

    /// Pull as many complete frames as the stream will yield right now.
    fn recv(&mut self, stream: &mut TcpStream, frames: &mut Vec<Vec<u8>>,
            pool: &mut Pool) -> io::Result<()> {
        loop {
            if self.step == RecvStep::Prefix {
                let read = stream.read(&mut self.prefix[self.read..])?;
                if read == 0 {
                    return Err(other_io_error("connection closed"));
                }
                self.read += read;
                if self.read < self.prefix.len() {
                    return Ok(()); // partial prefix, try again next poll
                }
                let announced = BigEndian::read_u32(&self.prefix) as usize;
                if announced == 0 || announced > MAX_FRAME {
                    return Err(invalid_data_io_error("frame length out of bounds"));
                }
                self.step = RecvStep::Payload;
                self.read = 0;
                self.buffer = pool.alloc(announced);
                self.buffer.resize(announced, 0);
            }

            let read = stream.read(&mut self.buffer[self.read..])?;
            if read == 0 {
                return Err(other_io_error("connection closed"));
            }
            self.read += read;
            if self.read == self.buffer.len() {
                frames.push(::std::mem::replace(&mut self.buffer, Vec::new()));
                self.step = RecvStep::Prefix;
                self.read = 0;
            } else {
                return Ok(()); // partial payload
            }
        }
    }
}

struct SendFrame {
    data: Vec<u8>,
    written: usize,
}

pub struct SocketRec {
    tag: NetTag,
    sock: Sock,
    recv: RecvOp,
    sendq: VecDeque<SendFrame>,
    delete_me: bool,
    flush_then_close: bool,
}

impl SocketRec {
    fn stream(&mut self) -> &mut TcpStream {
        match self.sock {
            Sock::Stream(ref mut stream) => stream,
            _ => unreachable!("stream operation on non-stream socket"),
        }
    }

    /// Write queued frames until done or the socket would block.
    /// Returns true when the queue drained.
    fn send_step(&mut self, block: bool) -> io::Result<bool> {
        while let Some(mut frame) = self.sendq.pop_front() {
            loop {
                match self.stream().write(&frame.data[frame.written..]) {
                    Ok(written) => {
                        frame.written += written;
                        if frame.written == frame.data.len() {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if block {
                            // back-pressure: spin until the peer drains us
                            thread::sleep(Duration::from_millis(1));
                            continue;
                        }
                        self.sendq.push_front(frame);
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(true)
    }
}

pub struct NetPoller {
    poll: mio::Poll,
    events: mio::Events,
    socks: HashMap<mio::Token, SocketRec>,
    ids: IdSequence,
    udp_out: net::UdpSocket,
    udp_buf: Vec<u8>,
}

impl NetPoller {
    pub fn new() -> Result<NetPoller> {
        let udp_out = net::UdpSocket::bind("0.0.0.0:0")?;
        udp_out.set_broadcast(true)?;

        Ok(NetPoller {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(256),
            socks: HashMap::new(),
            ids: IdSequence::new(),
            udp_out: udp_out,
            udp_buf: vec![0u8; MAX_FRAME],
        })
    }

    fn next_token(&self) -> mio::Token {
        mio::Token(self.ids.next())
    }

    /// Bind a UDP receive socket; port 0 picks an ephemeral port.
    pub fn udp_server(&mut self, port: u16) -> Result<(mio::Token, u16)> {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse().unwrap();
        let sock = UdpSocket::bind(&addr)?;
        let bound = sock.local_addr()?.port();
        let token = self.next_token();

        self.poll.register(&sock, token, mio::Ready::readable(),
                           mio::PollOpt::level())?;
        self.socks.insert(token, SocketRec {
            tag: NetTag::UdpServer,
            sock: Sock::Udp(sock),
            recv: RecvOp::new(),
            sendq: VecDeque::new(),
            delete_me: false,
            flush_then_close: false,
        });
        debug!("[{:?}] udp server on port {}", token, bound);

        Ok((token, bound))
    }

    /// Bind the TCP listening socket; port 0 picks an ephemeral port.
    pub fn tcp_server(&mut self, port: u16) -> Result<(mio::Token, u16)> {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse().unwrap();
        let sock = TcpListener::bind(&addr)?;
        let bound = sock.local_addr()?.port();
        let token = self.next_token();

        self.poll.register(&sock, token, mio::Ready::readable(),
                           mio::PollOpt::level())?;
        self.socks.insert(token, SocketRec {
            tag: NetTag::TcpServer,
            sock: Sock::Listener(sock),
            recv: RecvOp::new(),
            sendq: VecDeque::new(),
            delete_me: false,
            flush_then_close: false,
        });
        debug!("[{:?}] tcp server on port {}", token, bound);

        Ok((token, bound))
    }

    /// Begin a non-blocking connect; completion arrives as a net event.
    pub fn connect(&mut self, addr: SocketAddr) -> Result<mio::Token> {
        let stream = TcpStream::connect(&addr)?;
        let _ = stream.set_nodelay(true);
        let token = self.next_token();

        self.poll.register(&stream, token,
                           mio::Ready::readable() | mio::Ready::writable(),
                           mio::PollOpt::level())?;
        self.socks.insert(token, SocketRec {
            tag: NetTag::TcpConnecting,
            sock: Sock::Stream(stream),
            recv: RecvOp::new(),
            sendq: VecDeque::new(),
            delete_me: false,
            flush_then_close: false,
        });
        debug!("[{:?}] connecting to {}", token, addr);

        Ok(token)
    }

    pub fn tag(&self, token: mio::Token) -> NetTag {
        self.socks.get(&token).map(|rec| rec.tag).unwrap_or(NetTag::Closed)
    }

    pub fn peer_addr(&self, token: mio::Token) -> Option<SocketAddr> {
        match self.socks.get(&token) {
            Some(&SocketRec { sock: Sock::Stream(ref stream), .. }) =>
                stream.peer_addr().ok(),
            _ => None,
        }
    }

    /// Queue a frame (length prefix + body) on a stream socket. A queue
    /// that was empty is given an immediate send attempt.
    pub fn enqueue(&mut self, token: mio::Token, body: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.resize(4, 0);
        BigEndian::write_u32(&mut frame[0..4], body.len() as u32);
        frame.extend_from_slice(body);

        let (kick, failed) = {
            let rec = match self.socks.get_mut(&token) {
                Some(rec) if rec.tag.is_stream() => rec,
                _ => return Err(::error::Error::TcpHup),
            };
            let was_empty = rec.sendq.is_empty();
            rec.sendq.push_back(SendFrame { data: frame, written: 0 });
            if was_empty && rec.tag != NetTag::TcpConnecting {
                match rec.send_step(false) {
                    Ok(_) => (true, false),
                    Err(e) => {
                        debug!("[{:?}] send error: '{}'", token, e);
                        (false, true)
                    }
                }
            } else {
                (false, false)
            }
        };
        if failed {
            self.close(token, true);
            return Err(::error::Error::TcpHup);
        }
        if kick {
            self.update_interest(token);
        }

        Ok(())
    }

    /// Drain the send queue of one socket, blocking until done or failed.
    pub fn flush(&mut self, token: mio::Token) -> Result<()> {
        let res = match self.socks.get_mut(&token) {
            Some(rec) if rec.tag.is_stream() => rec.send_step(true),
            _ => return Err(::error::Error::TcpHup),
        };
        match res {
            Ok(_) => Ok(()),
            Err(e) => {
                self.close(token, true);
                Err(::error::Error::Socket(e))
            }
        }
    }

    /// Send one datagram from the shared outbound UDP socket.
    /// UDP errors are logged and ignored, never fatal to the process.
    pub fn send_udp(&self, to: &SocketAddr, body: &[u8]) -> bool {
        match self.udp_out.send_to(body, to) {
            Ok(_) => true,
            Err(e) => {
                warn!("udp send to {} failed: '{}'", to, e);
                false
            }
        }
    }

    /// Close a socket now, or after its send queue drains.
    pub fn close(&mut self, token: mio::Token, now: bool) {
        if let Some(rec) = self.socks.get_mut(&token) {
            if now || rec.sendq.is_empty() {
                rec.delete_me = true;
                rec.tag = NetTag::Closed;
            } else {
                rec.flush_then_close = true;
            }
        }
        self.update_interest(token);
    }

    pub fn is_open(&self, token: mio::Token) -> bool {
        match self.socks.get(&token) {
            Some(rec) => !rec.delete_me && rec.tag != NetTag::Closed,
            None => false,
        }
    }

    /// One pass over the socket set. Inbound buffers are drawn from the
    /// caller's pool; the caller returns them when messages retire.
    pub fn poll(&mut self, timeout: Option<Duration>, pool: &mut Pool)
                -> Vec<NetEvent> {
        let mut out = Vec::new();

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            error!("poll failed: '{}'", e);
            return out;
        }
        let ready: Vec<(mio::Token, mio::Ready)> =
            self.events.iter().map(|e| (e.token(), e.readiness())).collect();
        for (token, readiness) in ready {
            self.dispatch_ready(token, readiness, &mut out, pool);
        }
        self.sweep();

        out
    }

    fn dispatch_ready(&mut self, token: mio::Token, readiness: mio::Ready,
                      out: &mut Vec<NetEvent>, pool: &mut Pool) {
        match self.tag(token) {
            NetTag::UdpServer if readiness.is_readable() => {
                self.read_datagrams(token, out, pool);
            }
            NetTag::TcpServer if readiness.is_readable() => {
                self.accept_all(token, out);
            }
            NetTag::TcpConnecting if readiness.is_writable() => {
                self.finish_connect(token, out);
            }
            NetTag::TcpClient | NetTag::TcpConnection => {
                if readiness.is_readable() {
                    self.read_frames(token, out, pool);
                }
                if readiness.is_writable() && self.is_open(token) {
                    self.write_step(token, out);
                }
            }
            _ => {}
        }
    }

    fn read_datagrams(&mut self, token: mio::Token, out: &mut Vec<NetEvent>,
                      pool: &mut Pool) {
        loop {
            let received = match self.socks.get_mut(&token) {
                Some(&mut SocketRec { sock: Sock::Udp(ref sock), .. }) => {
                    sock.recv_from(&mut self.udp_buf)
                }
                _ => return,
            };
            match received {
                Ok((len, from)) => {
                    let mut body = pool.alloc(len);
                    body.extend_from_slice(&self.udp_buf[..len]);
                    out.push(NetEvent::Datagram(token, body, from));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    // not fatal: log and move on
                    warn!("[{:?}] udp recv error: '{}'", token, e);
                    return;
                }
            }
        }
    }

    fn accept_all(&mut self, token: mio::Token, out: &mut Vec<NetEvent>) {
        loop {
            let accepted = match self.socks.get_mut(&token) {
                Some(&mut SocketRec { sock: Sock::Listener(ref listener), .. }) => {
                    listener.accept()
                }
                _ => return,
            };
            match accepted {
                Ok((stream, from)) => {
                    let _ = stream.set_nodelay(true);
                    let conn = self.next_token();
                    if let Err(e) = self.poll.register(
                            &stream, conn, mio::Ready::readable(),
                            mio::PollOpt::level()) {
                        error!("[{:?}] register accepted failed: '{}'", conn, e);
                        continue;
                    }
                    self.socks.insert(conn, SocketRec {
                        tag: NetTag::TcpConnection,
                        sock: Sock::Stream(stream),
                        recv: RecvOp::new(),
                        sendq: VecDeque::new(),
                        delete_me: false,
                        flush_then_close: false,
                    });
                    debug!("[{:?}] accepted connection [{:?}] from {}",
                           token, conn, from);
                    out.push(NetEvent::Accepted(token, conn));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("[{:?}] accept error: '{}'", token, e);
                    return;
                }
            }
        }
    }

    fn finish_connect(&mut self, token: mio::Token, out: &mut Vec<NetEvent>) {
        let verdict = match self.socks.get_mut(&token) {
            Some(rec) => match rec.stream().take_error() {
                Ok(None) => {
                    rec.tag = NetTag::TcpClient;
                    Ok(())
                }
                Ok(Some(e)) | Err(e) => Err(e),
            },
            None => return,
        };
        match verdict {
            Ok(()) => {
                debug!("[{:?}] connected", token);
                out.push(NetEvent::Connected(token));
                self.update_interest(token);
                self.write_step(token, out);
            }
            Err(e) => {
                debug!("[{:?}] connect failed: '{}'", token, e);
                out.push(NetEvent::ConnectFailed(token));
                self.close(token, true);
            }
        }
    }

    fn read_frames(&mut self, token: mio::Token, out: &mut Vec<NetEvent>,
                   pool: &mut Pool) {
        let mut frames = Vec::new();
        let verdict = match self.socks.get_mut(&token) {
            Some(rec) => {
                let (recv, sock) = (&mut rec.recv, &mut rec.sock);
                match *sock {
                    Sock::Stream(ref mut stream) => {
                        match recv.recv(stream, &mut frames, pool) {
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
                            other => other,
                        }
                    }
                    _ => return,
                }
            }
            None => return,
        };
        for frame in frames {
            out.push(NetEvent::Frame(token, frame));
        }
        if let Err(e) = verdict {
            debug!("[{:?}] closing on read: '{}'", token, e);
            out.push(NetEvent::Hup(token));
            self.close(token, true);
        }
    }

    fn write_step(&mut self, token: mio::Token, out: &mut Vec<NetEvent>) {
        let verdict = match self.socks.get_mut(&token) {
            Some(rec) => match rec.send_step(false) {
                Ok(drained) => {
                    if drained && rec.flush_then_close {
                        rec.delete_me = true;
                        rec.tag = NetTag::Closed;
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
            None => return,
        };
        match verdict {
            Ok(()) => self.update_interest(token),
            Err(e) => {
                debug!("[{:?}] closing on write: '{}'", token, e);
                out.push(NetEvent::Hup(token));
                self.close(token, true);
            }
        }
    }

    fn update_interest(&mut self, token: mio::Token) {
        let wanted = match self.socks.get(&token) {
            Some(rec) if !rec.delete_me => match rec.tag {
                NetTag::TcpConnecting =>
                    Some(mio::Ready::readable() | mio::Ready::writable()),
                NetTag::TcpClient | NetTag::TcpConnection => {
                    if rec.sendq.is_empty() {
                        Some(mio::Ready::readable())
                    } else {
                        Some(mio::Ready::readable() | mio::Ready::writable())
                    }
                }
                _ => None,
            },
            _ => None,
        };
        if let Some(interest) = wanted {
            if let Some(rec) = self.socks.get(&token) {
                let res = match rec.sock {
                    Sock::Stream(ref s) =>
                        self.poll.reregister(s, token, interest, mio::PollOpt::level()),
                    Sock::Listener(ref s) =>
                        self.poll.reregister(s, token, interest, mio::PollOpt::level()),
                    Sock::Udp(ref s) =>
                        self.poll.reregister(s, token, interest, mio::PollOpt::level()),
                };
                if let Err(e) = res {
                    error!("[{:?}] reregister failed: '{}'", token, e);
                }
            }
        }
    }

    /// Remove sockets marked for deletion, after event handling is done.
    fn sweep(&mut self) {
        let dead: Vec<mio::Token> = self.socks.iter()
            .filter(|&(_, rec)| rec.delete_me)
            .map(|(token, _)| *token)
            .collect();
        for token in dead {
            if let Some(rec) = self.socks.remove(&token) {
                let res = match rec.sock {
                    Sock::Stream(ref s) => self.poll.deregister(s),
                    Sock::Listener(ref s) => self.poll.deregister(s),
                    Sock::Udp(ref s) => self.poll.deregister(s),
                };
                if let Err(e) = res {
                    debug!("[{:?}] deregister failed: '{}'", token, e);
                }
                debug!("[{:?}] removed", token);
            }
        }
    }

    /// Close every socket; used at session shutdown.
    pub fn close_all(&mut self) {
        let tokens: Vec<mio::Token> = self.socks.keys().cloned().collect();
        for token in tokens {
            self.close(token, true);
        }
        self.sweep();
    }
}

#[cfg(test)]
mod tests {
    use byteorder::{BigEndian, ByteOrder};

    use super::*;

    fn poll_until<F>(net: &mut NetPoller, mut done: F) -> Vec<NetEvent>
        where F: FnMut(&[NetEvent]) -> bool
    {
        let mut pool = Pool::new(::mem::MemPolicy::System);
        let mut all = Vec::new();
        for _ in 0..200 {
            let events = net.poll(Some(Duration::from_millis(10)), &mut pool);
            all.extend(events);
            if done(&all) {
                break;
            }
        }
        all
    }

    #[test]
    fn connect_accept_and_frame_round_trip() {
        let mut net = NetPoller::new().unwrap();
        let (_server, port) = net.tcp_server(0).unwrap();
        let addr = format!("127.0.0.1:{}", port).parse().unwrap();
        let client = net.connect(addr).unwrap();

        let events = poll_until(&mut net, |evts| {
            evts.iter().any(|e| e.name() == "Accepted") &&
            evts.iter().any(|e| e.name() == "Connected")
        });
        let conn = events.iter().filter_map(|e| match *e {
            NetEvent::Accepted(_, conn) => Some(conn),
            _ => None,
        }).next().unwrap();

        net.enqueue(client, b"hello fabric").unwrap();
        let events = poll_until(&mut net, |evts| {
            evts.iter().any(|e| e.name() == "Frame")
        });
        let frame = events.iter().filter_map(|e| match *e {
            NetEvent::Frame(token, ref body) if token == conn => Some(body.clone()),
            _ => None,
        }).next().unwrap();

        assert_eq!(b"hello fabric".to_vec(), frame);
    }

    #[test]
    fn oversized_frame_closes_the_socket() {
        let mut net = NetPoller::new().unwrap();
        let (_server, port) = net.tcp_server(0).unwrap();
        let mut raw = ::std::net::TcpStream::connect(
            format!("127.0.0.1:{}", port)).unwrap();

        let events = poll_until(&mut net, |evts| {
            evts.iter().any(|e| e.name() == "Accepted")
        });
        let conn = events.iter().filter_map(|e| match *e {
            NetEvent::Accepted(_, conn) => Some(conn),
            _ => None,
        }).next().unwrap();

        // announce a body far beyond the cap
        let mut prefix = [0u8; 4];
        BigEndian::write_u32(&mut prefix, (MAX_FRAME + 1) as u32);
        use std::io::Write;
        raw.write_all(&prefix).unwrap();
        raw.write_all(&[0u8; 16]).unwrap();

        poll_until(&mut net, |evts| {
            evts.iter().any(|e| match *e {
                NetEvent::Hup(token) => token == conn,
                _ => false,
            })
        });
        assert!(!net.is_open(conn));
    }

    #[test]
    fn udp_datagrams_surface_with_their_source() {
        let mut net = NetPoller::new().unwrap();
        let (token, port) = net.udp_server(0).unwrap();
        let to = format!("127.0.0.1:{}", port).parse().unwrap();

        assert!(net.send_udp(&to, b"ping"));
        let events = poll_until(&mut net, |evts| {
            evts.iter().any(|e| e.name() == "Datagram")
        });

        let hit = events.iter().any(|e| match *e {
            NetEvent::Datagram(t, ref body, _) => t == token && body == b"ping",
            _ => false,
        });
        assert!(hit);
    }
}
