// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

// The dispatcher: scheduling policy on entry, address lookup (hashed
// full path or pattern-tree walk), type enforcement and argv build,
// handler invocation, tap fan-out, and the reentrancy queues that keep
// handler-issued sends ordered.

use std::rc::Rc;

use error::{Error, Result};
use msg::{Arg, Message};
use pattern;
use services::{Method, Node, ProviderKind};
use session::Session;

/// Coarse destination classes for the scheduling policy.
enum DestKind {
    /// A local subtree or handler: scheduling happens here.
    Local,
    /// A remote fabric process: it runs its own scheduler, forward now.
    Remote,
    /// OSC or bridge destinations have no clock of their own: hold the
    /// message here and forward at dispatch time.
    Clockless,
}

pub fn service_of(addr: &str) -> Result<&str> {
    let body = match addr.as_bytes().first() {
        Some(&b'/') | Some(&b'!') => &addr[1..],
        _ => return Err(Error::BadName(addr.to_owned())),
    };
    let service = body.split('/').next().unwrap_or("");
    if service.is_empty() {
        return Err(Error::BadName(addr.to_owned()));
    }

    Ok(service)
}

impl Session {
    /// Accept a message into the fabric: apply the scheduling policy,
    /// then deliver locally, enqueue, or forward.
    pub(crate) fn route(&mut self, msg: Message) -> Result<()> {
        if msg.is_bundle() {
            let elements = msg.bundle_elements();
            self.pool.free(msg.into_buf());
            for element in elements? {
                self.route(element)?;
            }
            return Ok(());
        }

        let mut msg = msg;
        let mut service = match service_of(msg.address()) {
            Ok(service) => service.to_owned(),
            Err(e) => {
                self.warn_drop("unroutable address", &msg);
                self.pool.free(msg.into_buf());
                return Err(e);
            }
        };
        // messages addressed to our own identity take the local alias
        if service == self.name {
            let tag = msg.address().as_bytes()[0] as char;
            let rest = msg.address()[1 + service.len()..].to_owned();
            let aliased = format!("{}{}{}", tag, ::global::LOCAL_ALIAS, rest);
            match msg.readdressed(&aliased) {
                Ok(alias_msg) => {
                    self.pool.free(msg.into_buf());
                    msg = alias_msg;
                    service = ::global::LOCAL_ALIAS.to_owned();
                }
                Err(e) => {
                    self.warn_drop("alias rewrite failed", &msg);
                    self.pool.free(msg.into_buf());
                    return Err(e);
                }
            }
        }
        let dest = match self.table.lookup(&service).and_then(|e| e.active()) {
            Some(provider) => match provider.kind {
                ProviderKind::Node(_) => DestKind::Local,
                ProviderKind::Remote  => DestKind::Remote,
                _                     => DestKind::Clockless,
            },
            None => {
                self.warn_drop("no service", &msg);
                self.pool.free(msg.into_buf());
                return Err(Error::NoService(service));
            }
        };

        match dest {
            // the remote peer enforces timing with its own scheduler
            DestKind::Remote => ::proxy::forward(self, &service, msg),
            DestKind::Local | DestKind::Clockless => {
                let ts = msg.timestamp();
                let now = self.clock.global()
                              .unwrap_or_else(|| self.clock.local());
                if ts > 0.0 && ts > now {
                    if self.clock.is_synced() {
                        self.sched_global.insert(ts, msg);
                    } else {
                        self.sched_local.insert(ts, msg);
                    }
                    return Ok(());
                }
                match dest {
                    DestKind::Local => {
                        self.deliver_or_pend(msg);
                        Ok(())
                    }
                    _ => ::proxy::forward(self, &service, msg),
                }
            }
        }
    }

    /// Local deliveries issued from inside a handler are queued and
    /// drained after the outer dispatch returns.
    pub(crate) fn deliver_or_pend(&mut self, msg: Message) {
        if self.depth > 0 {
            if msg.is_tap() {
                self.pending_taps.push_back(msg);
            } else {
                self.pending.push_back(msg);
            }
        } else {
            self.deliver_local(msg);
        }
    }

    /// Deliver to local handlers: hashed full path for `!` and plain
    /// addresses, pattern-tree walk otherwise, then the tap fan-out.
    pub(crate) fn deliver_local(&mut self, msg: Message) {
        let addr = msg.address().to_owned();
        let service = match service_of(&addr) {
            Ok(service) => service.to_owned(),
            Err(_) => {
                self.warn_drop("unroutable address", &msg);
                self.pool.free(msg.into_buf());
                return;
            }
        };
        let normalized = if addr.starts_with('!') {
            format!("/{}", &addr[1..])
        } else {
            addr.clone()
        };

        let mut handlers: Vec<Rc<Method>> = Vec::new();
        let pattern_walk = addr.starts_with('/') && pattern::has_pattern(&addr);
        if pattern_walk {
            let segments: Vec<&str> = normalized[1..].split('/').skip(1).collect();
            if let Some(node) = self.local_node(&service) {
                collect_matches(node, &segments, &mut handlers);
            }
        } else {
            if let Some(method) = self.table.full_paths.get(&normalized) {
                handlers.push(method.clone());
            } else if let Some(&Node::Leaf(ref method)) = self.local_node(&service) {
                // a service-level handler accepts every sub-address
                handlers.push(method.clone());
            }
        }

        if handlers.is_empty() {
            self.warn_drop("no handler", &msg);
            self.pool.free(msg.into_buf());
            return;
        }
        for method in handlers {
            self.invoke(method, &msg);
        }
        if !msg.is_tap() {
            self.fan_out_taps(&service, &msg);
        }
        self.pool.free(msg.into_buf());
    }

    fn local_node(&self, service: &str) -> Option<&Node> {
        self.table.lookup(service)
            .and_then(|entry| entry.providers.iter().find(|p| match p.kind {
                ProviderKind::Node(_) => true,
                _ => false,
            }))
            .and_then(|provider| match provider.kind {
                ProviderKind::Node(ref node) => Some(node),
                _ => None,
            })
    }

    /// Enforce the declared type string, build the argv, and run the
    /// handler. A coercion failure drops the message with a warning.
    fn invoke(&mut self, method: Rc<Method>, msg: &Message) {
        let types = msg.types().to_owned();
        let argv = match method.typespec {
            Some(ref spec) => {
                match build_argv(msg, spec, method.coerce) {
                    Ok(argv) => argv,
                    Err(_) => {
                        self.warn_drop("type mismatch", msg);
                        return;
                    }
                }
            }
            None if method.parse => {
                match parse_all(msg) {
                    Ok(argv) => argv,
                    Err(_) => {
                        self.warn_drop("malformed arguments", msg);
                        return;
                    }
                }
            }
            None => Vec::new(),
        };
        let argv = if method.parse { argv } else { Vec::new() };

        self.depth += 1;
        (method.func)(self, msg, &types, &argv);
        self.depth -= 1;
        if self.depth == 0 {
            self.drain_pending();
        }
    }

    /// Copy a delivered message to every tapper, readdressed and flagged;
    /// tap copies never trigger taps themselves.
    fn fan_out_taps(&mut self, service: &str, msg: &Message) {
        let taps = match self.table.lookup(service) {
            Some(entry) if !entry.taps.is_empty() => entry.taps.clone(),
            _ => return,
        };
        let addr = msg.address();
        let rest = &addr[1 + service.len()..];

        for tap in taps {
            let new_addr = format!("/{}{}", tap.tapper_service, rest);
            let copy = match msg.retargeted(&new_addr) {
                Ok(copy) => copy,
                Err(e) => {
                    warn!("tap copy for '{}' failed: '{}'", tap.tapper_service, e);
                    continue;
                }
            };
            if tap.tapper_proc == self.name {
                self.deliver_or_pend(copy);
            } else if let Err(e) =
                    ::proxy::send_to_proc(self, &tap.tapper_proc, copy) {
                debug!("tap to '{}' undeliverable: '{}'", tap.tapper_proc, e);
            }
        }
    }

    /// Drain the reentrancy queues, normal deliveries before tap copies.
    pub(crate) fn drain_pending(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        loop {
            if let Some(msg) = self.pending.pop_front() {
                self.deliver_local(msg);
                continue;
            }
            if let Some(msg) = self.pending_taps.pop_front() {
                self.deliver_local(msg);
                continue;
            }
            break;
        }
        self.draining = false;
    }

    pub(crate) fn warn_drop(&mut self, reason: &str, msg: &Message) {
        if self.debug.contains(::global::DebugFlags::MESSAGES) {
            info!("message to '{}' dropped: {}", msg.address(), reason);
        } else {
            debug!("message to '{}' dropped: {}", msg.address(), reason);
        }
        if let Some(ref callback) = self.warn {
            callback(reason, msg);
        }
    }
}

fn collect_matches(node: &Node, segments: &[&str], out: &mut Vec<Rc<Method>>) {
    match *node {
        // a leaf absorbs the rest of the address
        Node::Leaf(ref method) => out.push(method.clone()),
        Node::Branch(ref children) => {
            if segments.is_empty() {
                return;
            }
            for (key, child) in children {
                if pattern::match_segment(segments[0], key) {
                    collect_matches(child, &segments[1..], out);
                }
            }
        }
    }
}

/// Build the argv for a declared type string, coercing per element when
/// allowed. The argument count must match exactly.
fn build_argv(msg: &Message, spec: &str, coerce: bool) -> Result<Vec<Arg>> {
    let mut ext = msg.unpack();
    let expected: Vec<char> = spec.chars().collect();
    let mut argv = Vec::new();
    let mut i = 0;

    while i < expected.len() {
        let code = expected[i];
        match code {
            'v' => {
                let elem = *expected.get(i + 1).ok_or(Error::BadType('v'))?;
                argv.push(ext.get_vector(elem)?);
                i += 2;
            }
            '[' => {
                let close = matching_bracket(&expected, i)
                    .ok_or(Error::BadType('['))?;
                argv.push(ext.get('[')?);
                i = close + 1;
            }
            c => {
                argv.push(if coerce { ext.get(c)? } else { ext.exact(c)? });
                i += 1;
            }
        }
    }
    if !ext.finished() {
        return Err(Error::BadType(','));
    }

    Ok(argv)
}

/// Read every argument as its actual type, for handlers that declare no
/// type string but want parsed arguments.
fn parse_all(msg: &Message) -> Result<Vec<Arg>> {
    let mut ext = msg.unpack();
    let mut argv = Vec::new();

    while !ext.finished() {
        argv.push(ext.next_arg()?);
    }
    Ok(argv)
}

fn matching_bracket(expected: &[char], open: usize) -> Option<usize> {
    let mut depth = 0;

    for (at, &c) in expected.iter().enumerate().skip(open) {
        if c == '[' {
            depth += 1;
        }
        if c == ']' {
            depth -= 1;
            if depth == 0 {
                return Some(at);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{matching_bracket, service_of};

    #[test]
    fn service_names_split_off_the_address() {
        assert_eq!("svc", service_of("/svc/a/b").unwrap());
        assert_eq!("svc", service_of("!svc").unwrap());
        assert!(service_of("svc/a").is_err());
        assert!(service_of("/").is_err());
    }

    #[test]
    fn brackets_pair_up() {
        let spec: Vec<char> = "i[if]s".chars().collect();
        assert_eq!(Some(4), matching_bracket(&spec, 1));
        let broken: Vec<char> = "i[if".chars().collect();
        assert_eq!(None, matching_bracket(&broken, 1));
    }
}
