// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

// The session is the whole fabric state of one process: sockets, address
// tables, peers, clocks, schedulers and scratch space, owned by the one
// thread that calls poll(). Configuration is fixed by the builder before
// the first poll and read-only afterwards.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::rc::Rc;
use std::time::Duration;

use mio;

use clock::{Clock, Sync, SyncStep};
use discovery::{DiscMode, Discovery};
use error::{Error, Result};
use global::{self, DebugFlags, Status};
use lite::LiteHost;
use mem::{MemPolicy, MemReport, Pool};
use msg::{Arg, Message, MsgWriter, VecArg};
use net::{NetEvent, NetPoller};
use peer::{HubRole, Peer, PeerState};
use sched::Sched;
use services::{Method, OscTarget, ProviderEntry, ProviderKind, ServiceTable, Tap};

/// What a socket belongs to, from the session's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    /// Accepted connection, nothing heard yet.
    PendingPeer,
    /// Connection to a named peer.
    PeerNamed(String),
    /// Connection we initiated without knowing the name (hub target).
    PeerUnknown,
    /// Short-lived connection carrying one discovery callback.
    TempCallback,
    /// A lite bridge link.
    Lite(u32),
    /// The TCP connection of an OSC delegate, keyed by service.
    Osc(String),
}

/// Fixes the process-wide configuration, then starts the fabric.
pub struct SessionBuilder {
    ensemble: String,
    mem: MemPolicy,
    disc: DiscMode,
    hub: Option<SocketAddr>,
    tcp_port: u16,
    debug: DebugFlags,
}

impl SessionBuilder {
    pub fn new(ensemble: &str) -> SessionBuilder {
        SessionBuilder {
            ensemble: ensemble.to_owned(),
            mem: MemPolicy::Pooled,
            disc: DiscMode::Broadcast,
            hub: None,
            tcp_port: 0,
            debug: DebugFlags::NONE,
        }
    }

    /// Replace the pooled buffer recycling with plain system allocation.
    pub fn memory(mut self, policy: MemPolicy) -> SessionBuilder {
        self.mem = policy;
        self
    }

    pub fn discovery(mut self, mode: DiscMode) -> SessionBuilder {
        self.disc = mode;
        self
    }

    /// Nominate a hub as the sole discovery source.
    pub fn hub(mut self, internal: Ipv4Addr, tcp_port: u16) -> SessionBuilder {
        self.hub = Some(SocketAddr::V4(SocketAddrV4::new(internal, tcp_port)));
        self.disc = DiscMode::Hub;
        self
    }

    /// Ask for a fixed TCP listening port instead of an ephemeral one.
    pub fn tcp_port(mut self, port: u16) -> SessionBuilder {
        self.tcp_port = port;
        self
    }

    pub fn debug(mut self, flags: DebugFlags) -> SessionBuilder {
        self.debug = flags;
        self
    }

    pub fn start(self) -> Result<Session> {
        global::check_ensemble_name(&self.ensemble)?;

        let mut net = NetPoller::new()?;
        let (tcp_server, tcp_port) = net.tcp_server(self.tcp_port)?;
        let (udp_server, udp_port) = net.udp_server(0)?;
        let internal_ip = global::internal_ip();
        let name = global::proc_name(Ipv4Addr::new(0, 0, 0, 0),
                                     internal_ip, tcp_port);

        let mut sess = Session {
            ensemble: self.ensemble,
            name: name,
            internal_ip: internal_ip,
            tcp_port: tcp_port,
            udp_port: udp_port,
            tcp_server: tcp_server,
            udp_server: udp_server,
            debug: self.debug,
            net: net,
            table: ServiceTable::new(),
            peers: HashMap::new(),
            owners: HashMap::new(),
            clock: Clock::new(),
            csync: Sync::new(),
            sched_local: Sched::new(),
            sched_global: Sched::new(),
            disc: Discovery::new(self.disc, self.hub),
            lite: LiteHost::new(),
            pool: Pool::new(self.mem),
            writer: MsgWriter::new(),
            depth: 0,
            draining: false,
            pending: VecDeque::new(),
            pending_taps: VecDeque::new(),
            source: None,
            datagram_src: None,
            warn: None,
        };
        sess.install_system_services()?;
        ::discovery::start(&mut sess);
        info!("session '{}' up as '{}' tcp:{} udp:{}",
              sess.ensemble, sess.name, sess.tcp_port, sess.udp_port);

        Ok(sess)
    }
}

pub struct Session {
    pub(crate) ensemble: String,
    pub(crate) name: String,
    pub(crate) internal_ip: Ipv4Addr,
    pub(crate) tcp_port: u16,
    pub(crate) udp_port: u16,
    pub(crate) tcp_server: mio::Token,
    pub(crate) udp_server: mio::Token,
    pub(crate) debug: DebugFlags,
    pub(crate) net: NetPoller,
    pub(crate) table: ServiceTable,
    pub(crate) peers: HashMap<String, Peer>,
    pub(crate) owners: HashMap<mio::Token, Owner>,
    pub(crate) clock: Clock,
    pub(crate) csync: Sync,
    pub(crate) sched_local: Sched,
    pub(crate) sched_global: Sched,
    pub(crate) disc: Discovery,
    pub(crate) lite: LiteHost,
    pub(crate) pool: Pool,
    pub(crate) writer: MsgWriter,
    pub(crate) depth: u32,
    pub(crate) draining: bool,
    pub(crate) pending: VecDeque<Message>,
    pub(crate) pending_taps: VecDeque<Message>,
    pub(crate) source: Option<mio::Token>,
    pub(crate) datagram_src: Option<SocketAddr>,
    pub(crate) warn: Option<Box<dyn Fn(&str, &Message)>>,
}

impl Session {
    pub fn ensemble(&self) -> &str {
        &self.ensemble
    }

    /// Our process identity, `@PUB:INT:PORT`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    /// The local clock, seconds since the session started.
    pub fn time(&self) -> f64 {
        self.clock.local()
    }

    /// The shared ensemble time, once synchronized.
    pub fn global_time(&self) -> Option<f64> {
        self.clock.global()
    }

    /// Become the ensemble's clock reference.
    pub fn clock_set(&mut self) -> Result<()> {
        self.clock.set_reference();
        self.broadcast_cs();
        self.promote_own_services();
        info!("'{}' is now the clock reference", self.name);
        Ok(())
    }

    pub fn status(&self, service: &str) -> Status {
        ::proxy::status_of(self, service)
    }

    /// Install a user callback for every locally dropped message.
    pub fn on_warning<F>(&mut self, callback: F)
        where F: Fn(&str, &Message) + 'static
    {
        self.warn = Some(Box::new(callback));
    }

    /// Offer a new service from this process.
    pub fn service_new(&mut self, service: &str) -> Result<()> {
        let me = self.name.clone();
        self.table.create_local(service, &me)?;

        let status = self.status(service);
        self.notify_si(service, status, &me, "");
        ::peer::send_sv_update(self, service, true, true, "");
        Ok(())
    }

    /// Withdraw a locally offered service.
    pub fn service_free(&mut self, service: &str) -> Result<()> {
        let me = self.name.clone();
        let change = self.table.remove_provider(service, &me)
            .ok_or_else(|| Error::NoService(service.to_owned()))?;

        self.announce_change(service, &change);
        ::peer::send_sv_update(self, service, false, true, "");
        Ok(())
    }

    /// Install a handler with the default flags: declared types are
    /// coerced and parsed into an argv.
    pub fn method_new<F>(&mut self, path: &str, typespec: Option<&str>,
                         handler: F) -> Result<()>
        where F: Fn(&mut Session, &Message, &str, &[Arg]) + 'static
    {
        self.method_new_full(path, typespec, true, true, handler)
    }

    pub fn method_new_full<F>(&mut self, path: &str, typespec: Option<&str>,
                              coerce: bool, parse: bool, handler: F) -> Result<()>
        where F: Fn(&mut Session, &Message, &str, &[Arg]) + 'static
    {
        let me = self.name.clone();
        let method = Rc::new(Method {
            typespec: typespec.map(|s| s.to_owned()),
            coerce: coerce,
            parse: parse,
            func: Box::new(handler),
        });

        self.table.install_method(path, &me, method)
    }

    /// Observe `tappee`: every delivery to it is copied to `tapper` here.
    pub fn tap(&mut self, tappee: &str, tapper: &str) -> Result<()> {
        global::check_service_name(tapper)?;
        let me = self.name.clone();
        self.table.add_tap(tappee, Tap {
            tapper_service: tapper.to_owned(),
            tapper_proc: me.clone(),
        })?;

        self.notify_si(tappee, Status::Tap, &me, tapper);
        ::peer::send_sv_update(self, tappee, true, false, tapper);
        Ok(())
    }

    pub fn untap(&mut self, tappee: &str, tapper: &str) -> Result<()> {
        let me = self.name.clone();
        self.table.remove_tap(tappee, &Tap {
            tapper_service: tapper.to_owned(),
            tapper_proc: me,
        })?;

        ::peer::send_sv_update(self, tappee, false, false, tapper);
        Ok(())
    }

    /// Forward messages for `service` to an OSC server.
    pub fn osc_delegate(&mut self, service: &str, addr: SocketAddr,
                        tcp: bool) -> Result<()> {
        let me = self.name.clone();
        let target = if tcp {
            let token = self.net.connect(addr)?;
            self.owners.insert(token, Owner::Osc(service.to_owned()));
            OscTarget { addr: addr, tcp: Some(token) }
        } else {
            OscTarget { addr: addr, tcp: None }
        };

        self.table.add_provider(service, ProviderEntry {
            ident: me.clone(),
            kind: ProviderKind::Osc(target),
            properties: String::new(),
        })?;
        let status = self.status(service);
        self.notify_si(service, status, &me, "");
        ::peer::send_sv_update(self, service, true, true, "");
        Ok(())
    }

    /// Set a property on our provider of `service` and re-advertise it.
    pub fn service_set_property(&mut self, service: &str, attr: &str,
                                value: &str) -> Result<()> {
        let me = self.name.clone();
        let props = {
            let entry = self.table.services.get_mut(service)
                .ok_or_else(|| Error::NoService(service.to_owned()))?;
            let provider = entry.providers.iter_mut()
                .find(|p| p.ident == me)
                .ok_or_else(|| Error::NoService(service.to_owned()))?;
            provider.properties =
                ::properties::set(&provider.properties, attr, value);
            provider.properties.clone()
        };

        let status = self.status(service);
        self.notify_si(service, status, &me, &props);
        ::peer::send_sv_update(self, service, true, true, &props);
        Ok(())
    }

    /// A property of the service's active provider.
    pub fn service_property(&self, service: &str, attr: &str) -> Option<String> {
        self.table.lookup(service)
            .and_then(|entry| entry.active())
            .and_then(|provider| ::properties::lookup(&provider.properties, attr))
    }

    /// Resolver contract: feed one resolved candidate into discovery.
    pub fn discovered(&mut self, proc_name: &str, internal: Ipv4Addr,
                      tcp_port: u16, udp_port: u16) -> Result<()> {
        global::parse_proc_name(proc_name)?;
        ::discovery::on_candidate(self, proc_name, internal, tcp_port, udp_port);
        Ok(())
    }

    /// Begin a message to `addr`; finish with deliver().
    pub fn send_to(&mut self, addr: &str) -> MsgBuild {
        self.writer.reset();
        MsgBuild {
            sess: self,
            addr: addr.to_owned(),
            time: 0.0,
            tcp: true,
            blocking: false,
        }
    }

    /// Sorted names of every known service.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.services.keys().cloned().collect();
        names.sort();
        names
    }

    /// One cooperative pass: sockets, discovery, clock sync, schedulers,
    /// pending deliveries.
    pub fn poll(&mut self) -> Result<()> {
        self.poll_timeout(0)
    }

    pub fn poll_timeout(&mut self, ms: u64) -> Result<()> {
        let events = {
            let Session { ref mut net, ref mut pool, .. } = *self;
            net.poll(Some(Duration::from_millis(ms)), pool)
        };
        for event in events {
            self.on_net_event(event);
        }

        let now = self.clock.local();
        ::discovery::tick(self, now);
        self.clock_tick(now);
        self.run_schedulers();
        self.drain_pending();
        Ok(())
    }

    /// Shut down: close every socket and report the buffer tallies.
    pub fn finish(&mut self) -> MemReport {
        self.net.close_all();
        self.peers.clear();
        self.owners.clear();
        while let Some(msg) = self.sched_local.pop_due(::std::f64::INFINITY) {
            self.pool.free(msg.into_buf());
        }
        while let Some(msg) = self.sched_global.pop_due(::std::f64::INFINITY) {
            self.pool.free(msg.into_buf());
        }
        while let Some(msg) = self.pending.pop_front() {
            self.pool.free(msg.into_buf());
        }
        while let Some(msg) = self.pending_taps.pop_front() {
            self.pool.free(msg.into_buf());
        }
        let report = self.pool.report();
        if self.debug.contains(DebugFlags::MEMORY) {
            info!("shutdown buffers: {:?}", report);
        }
        report
    }

    // ---- internals ----

    fn install_system_services(&mut self) -> Result<()> {
        let me = self.name.clone();
        self.table.create_local(global::LOCAL_ALIAS, &me)?;
        // the process identity is itself a routable service
        self.table.create_local(&me, &me)?;

        self.sys_method("/_o2/dy", Some("ssiiii"), ::peer::handle_dy)?;
        self.sys_method_raw("/_o2/sv", ::peer::handle_sv)?;
        self.sys_method("/_o2/cs/get", Some("is"), Session::handle_cs_get)?;
        self.sys_method("/_o2/cs/put", Some("it"), Session::handle_cs_put)?;
        self.sys_method("/_o2/cs/cs", Some("s"), ::peer::handle_cs_cs)?;
        self.sys_method("/_o2/o2lite/con", Some("si"), ::lite::handle_con)?;
        self.sys_method_raw("/_o2/o2lite/sv", ::lite::handle_sv)?;
        self.sys_method("/_o2/o2lite/cs/get", Some("is"), ::lite::handle_cs_get)?;
        self.sys_method("/_o2/o2lite/cs/cs", Some(""), ::lite::handle_cs_cs)?;
        self.sys_method("/_o2/o2lite/dy", Some("s"), ::lite::handle_dy)?;
        self.sys_method("/_o2/o2lite/ls", Some(""), ::lite::handle_ls)?;
        self.sys_method("/_o2/o2lite/st", Some("s"), ::lite::handle_st)?;
        Ok(())
    }

    fn sys_method(&mut self, path: &str, typespec: Option<&str>,
                  f: fn(&mut Session, &Message, &[Arg])) -> Result<()> {
        self.method_new_full(path, typespec, true, true,
                             move |sess, msg, _types, args| f(sess, msg, args))
    }

    /// System handlers that walk variable tuple streams themselves.
    fn sys_method_raw(&mut self, path: &str,
                      f: fn(&mut Session, &Message, &[Arg])) -> Result<()> {
        self.method_new_full(path, None, false, false,
                             move |sess, msg, _types, args| f(sess, msg, args))
    }

    fn on_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Accepted(server, conn) => {
                if server == self.tcp_server {
                    self.owners.insert(conn, Owner::PendingPeer);
                }
            }
            NetEvent::Connected(token) => self.on_connected(token),
            NetEvent::ConnectFailed(token) => self.drop_conn(token),
            NetEvent::Frame(token, body) => {
                match Message::from_wire(body) {
                    Ok(msg) => {
                        self.source = Some(token);
                        self.datagram_src = None;
                        let _ = self.route(msg);
                        self.source = None;
                    }
                    Err(_) => {
                        // malformed input is fatal to the socket, not to us
                        warn!("[{:?}] invalid frame, closing", token);
                        self.pool.discard();
                        self.drop_conn(token);
                    }
                }
            }
            NetEvent::Datagram(token, body, src) => {
                match Message::from_wire(body) {
                    Ok(msg) => {
                        self.source = Some(token);
                        self.datagram_src = Some(src);
                        let _ = self.route(msg);
                        self.source = None;
                        self.datagram_src = None;
                    }
                    Err(_) => {
                        // malformed datagrams are simply ignored
                        debug!("[{:?}] malformed datagram from {}", token, src);
                        self.pool.discard();
                    }
                }
            }
            NetEvent::Hup(token) => self.drop_conn(token),
        }
    }

    fn on_connected(&mut self, token: mio::Token) {
        match self.owners.get(&token).cloned() {
            Some(Owner::PeerNamed(_)) => {
                let _ = ::peer::send_dy(self, token, HubRole::None);
            }
            Some(Owner::PeerUnknown) => {
                // the hub link: announce ourselves and ask for the world
                let _ = ::peer::send_dy(self, token, HubRole::RemoteIsHub);
            }
            Some(Owner::TempCallback) => {
                let _ = ::peer::send_dy(self, token, HubRole::Callback);
                self.net.close(token, false); // flush, then close
            }
            _ => {}
        }
    }

    /// A connection died or went bad: tear down whatever it owned,
    /// cascading service removals and status broadcasts.
    pub(crate) fn drop_conn(&mut self, token: mio::Token) {
        self.net.close(token, true);
        let owner = self.owners.remove(&token);
        let was_hub = self.disc.hub_token() == Some(token);

        match owner {
            Some(Owner::PeerNamed(name)) => {
                let still_current = self.peers.get(&name)
                    .map(|p| p.tcp == token)
                    .unwrap_or(false);
                if still_current {
                    self.peers.remove(&name);
                    let changes = self.table.remove_process(&name);
                    for (service, change) in changes {
                        self.announce_change(&service, &change);
                    }
                    info!("peer '{}' removed", name);
                }
            }
            Some(Owner::Lite(id)) => ::lite::bridge_lost(self, id),
            Some(Owner::Osc(service)) => {
                let me = self.name.clone();
                if let Some(change) = self.table.remove_provider(&service, &me) {
                    self.announce_change(&service, &change);
                }
            }
            _ => {}
        }
        if was_hub {
            ::discovery::hub_lost(self);
        }
    }

    pub(crate) fn drop_peer(&mut self, token: mio::Token) {
        self.drop_conn(token);
    }

    /// Broadcast a status change to local listeners on /_o2/si.
    pub(crate) fn notify_si(&mut self, service: &str, status: Status,
                            process: &str, properties: &str) {
        if !self.table.full_paths.contains_key("/_o2/si") {
            return;
        }
        self.writer.reset();
        self.writer.add_str(service);
        self.writer.add_i32(status.id());
        self.writer.add_str(process);
        self.writer.add_str(properties);
        match self.writer.finish("!_o2/si", 0.0, true) {
            Ok(msg) => self.deliver_or_pend(msg),
            Err(e) => warn!("si build failed: '{}'", e),
        }
    }

    pub(crate) fn announce_change(&mut self, service: &str,
                                  change: &::services::Change) {
        match *change {
            ::services::Change::NewActive(ref ident) => {
                let status = self.status(service);
                let props = self.table.lookup(service)
                    .and_then(|e| e.active())
                    .map(|p| p.properties.clone())
                    .unwrap_or_default();
                let ident = ident.clone();
                self.notify_si(service, status, &ident, &props);
            }
            ::services::Change::Gone => {
                self.notify_si(service, Status::Unknown, "", "");
            }
            ::services::Change::Quiet => {}
        }
    }

    /// A remote provider withdrew a service.
    pub(crate) fn service_dropped(&mut self, service: &str, ident: &str) {
        if let Some(change) = self.table.remove_provider(service, ident) {
            self.announce_change(service, &change);
        }
    }

    // ---- clock sync plumbing ----

    fn clock_tick(&mut self, now: f64) {
        if self.clock.is_reference() {
            return;
        }
        if !self.csync.ping_due(now) {
            return;
        }
        let target = self.peers.values()
            .find(|p| p.state == PeerState::ConnectedSynced)
            .map(|p| p.udp_addr);
        let addr = match target {
            Some(addr) => addr,
            None => return, // nobody can serve reference time yet
        };

        let serial = self.csync.ping_sent(now);
        let reply_to = format!("!{}/cs/put", self.name);
        self.writer.reset();
        self.writer.add_i32(serial);
        self.writer.add_str(&reply_to);
        match self.writer.finish("!_o2/cs/get", 0.0, false) {
            Ok(msg) => {
                self.net.send_udp(&addr, &msg.to_wire());
            }
            Err(e) => warn!("cs ping build failed: '{}'", e),
        }
    }

    /// /_o2/cs/get: serve the reference time to whoever asked.
    fn handle_cs_get(sess: &mut Session, _msg: &Message, args: &[Arg]) {
        let serial = args[0].i32().unwrap_or(0);
        let reply_to = args[1].str().unwrap_or("!_o2/cs/put").to_owned();

        let now = match sess.clock.global() {
            Some(now) => now,
            None => return, // not synchronized, nothing to offer
        };
        sess.writer.reset();
        sess.writer.add_i32(serial);
        sess.writer.add_time(now);
        let reply = match sess.writer.finish(&reply_to, 0.0, false) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("cs reply build failed: '{}'", e);
                return;
            }
        };
        // the reply address names the requester's identity service, so
        // normal routing carries it back over the requester's UDP port
        let _ = sess.route(reply);
    }

    /// /_o2/cs/put: fold the reference's answer into our estimate.
    fn handle_cs_put(sess: &mut Session, _msg: &Message, args: &[Arg]) {
        let serial = args[0].i32().unwrap_or(0);
        let ref_time = match args[1] {
            Arg::Time(t) => t,
            Arg::Double(t) => t,
            _ => return,
        };
        let now = sess.clock.local();

        let step = {
            let Session { ref mut csync, ref mut clock, .. } = *sess;
            csync.reply(clock, serial, ref_time, now)
        };
        match step {
            SyncStep::Synced => {
                info!("'{}' clock synchronized", sess.name);
                sess.broadcast_cs();
                sess.promote_own_services();
            }
            SyncStep::Adjusted => {
                if sess.debug.contains(DebugFlags::CLOCK) {
                    info!("clock offset now {:.6}", sess.clock.offset());
                }
            }
            SyncStep::Sampling | SyncStep::Ignored => {}
        }
    }

    /// Tell every peer our clock is synchronized now.
    fn broadcast_cs(&mut self) {
        let me = self.name.clone();
        let tokens: Vec<mio::Token> = self.peers.values()
            .filter(|p| p.state != PeerState::Connecting)
            .map(|p| p.tcp)
            .collect();

        for token in tokens {
            self.writer.reset();
            self.writer.add_str(&me);
            match self.writer.finish("!_o2/cs/cs", 0.0, true) {
                Ok(msg) => {
                    let _ = self.net.enqueue(token, &msg.to_wire());
                }
                Err(e) => warn!("cs broadcast build failed: '{}'", e),
            }
        }
    }

    /// Our own providers move to synced statuses.
    fn promote_own_services(&mut self) {
        let me = self.name.clone();
        let mine: Vec<String> = self.table.services.iter()
            .filter(|&(_, entry)| entry.active()
                .map(|p| p.ident == me)
                .unwrap_or(false))
            .map(|(service, _)| service.clone())
            .collect();

        for service in mine {
            let status = self.status(&service);
            let props = self.table.lookup(&service)
                .and_then(|e| e.active())
                .map(|p| p.properties.clone())
                .unwrap_or_default();
            self.notify_si(&service, status, &me, &props);
        }
    }

    fn run_schedulers(&mut self) {
        let now_local = self.clock.local();
        while let Some(msg) = self.sched_local.pop_due(now_local) {
            let _ = self.route(msg);
        }
        if let Some(now_global) = self.clock.global() {
            while let Some(msg) = self.sched_global.pop_due(now_global) {
                let _ = self.route(msg);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.net.close_all();
    }
}

/// Chained construction of one outgoing message. Borrowing the session
/// for the whole build keeps construction single-threaded and
/// non-reentrant by construction.
pub struct MsgBuild<'s> {
    sess: &'s mut Session,
    addr: String,
    time: f64,
    tcp: bool,
    blocking: bool,
}

impl<'s> MsgBuild<'s> {
    /// Deliver at this ensemble time instead of immediately.
    pub fn at(mut self, time: f64) -> MsgBuild<'s> {
        self.time = time;
        self
    }

    /// Ship over UDP instead of TCP.
    pub fn udp(mut self) -> MsgBuild<'s> {
        self.tcp = false;
        self
    }

    /// Apply back-pressure: block until the frame is on the wire.
    pub fn blocking(mut self) -> MsgBuild<'s> {
        self.blocking = true;
        self
    }

    pub fn add_i32(mut self, v: i32) -> MsgBuild<'s> {
        self.sess.writer.add_i32(v);
        self
    }

    pub fn add_i64(mut self, v: i64) -> MsgBuild<'s> {
        self.sess.writer.add_i64(v);
        self
    }

    pub fn add_f32(mut self, v: f32) -> MsgBuild<'s> {
        self.sess.writer.add_f32(v);
        self
    }

    pub fn add_f64(mut self, v: f64) -> MsgBuild<'s> {
        self.sess.writer.add_f64(v);
        self
    }

    pub fn add_time(mut self, v: f64) -> MsgBuild<'s> {
        self.sess.writer.add_time(v);
        self
    }

    pub fn add_str(mut self, v: &str) -> MsgBuild<'s> {
        self.sess.writer.add_str(v);
        self
    }

    pub fn add_symbol(mut self, v: &str) -> MsgBuild<'s> {
        self.sess.writer.add_symbol(v);
        self
    }

    pub fn add_blob(mut self, v: &[u8]) -> MsgBuild<'s> {
        self.sess.writer.add_blob(v);
        self
    }

    pub fn add_midi(mut self, v: u32) -> MsgBuild<'s> {
        self.sess.writer.add_midi(v);
        self
    }

    pub fn add_char(mut self, v: char) -> MsgBuild<'s> {
        self.sess.writer.add_char(v);
        self
    }

    pub fn add_bool(mut self, v: bool) -> MsgBuild<'s> {
        self.sess.writer.add_bool(v);
        self
    }

    pub fn add_vector(mut self, v: &VecArg) -> MsgBuild<'s> {
        self.sess.writer.add_vector(v);
        self
    }

    pub fn add_arg(mut self, v: &Arg) -> MsgBuild<'s> {
        self.sess.writer.add_arg(v);
        self
    }

    /// Finish and route the message.
    pub fn deliver(self) -> Result<()> {
        let msg = self.sess.writer.finish(&self.addr, self.time, self.tcp)?;
        let link = if self.blocking {
            ::dispatch::service_of(&self.addr).ok()
                .and_then(|service| ::proxy::tcp_link(self.sess, service))
        } else {
            None
        };

        self.sess.route(msg)?;
        if let Some(token) = link {
            self.sess.net.flush(token)?;
        }
        Ok(())
    }
}
