// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

// The address table: service name -> providers and taps, plus the hashed
// full-path shortcut and the pattern tree. The provider list is kept in
// descending identity order so providers[0] is always the active one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;

use mio;

use error::{Error, Result};
use global::check_service_name;
use msg::{Arg, Message};

/// A handler bound to an address, with its expected types and flags.
pub struct Method {
    pub typespec: Option<String>,
    pub coerce: bool,
    pub parse: bool,
    pub func: Box<dyn Fn(&mut ::session::Session, &Message, &str, &[Arg])>,
}

/// One level of the pattern tree under a locally provided service.
pub enum Node {
    Branch(HashMap<String, Node>),
    Leaf(Rc<Method>),
}

impl Node {
    pub fn empty() -> Node {
        Node::Branch(HashMap::new())
    }
}

/// Forwarding endpoint for an OSC delegate service.
#[derive(Debug, Clone)]
pub struct OscTarget {
    pub addr: SocketAddr,
    /// Some when framed over a TCP connection, None for UDP datagrams.
    pub tcp: Option<mio::Token>,
}

/// What a provider entry binds the service to.
pub enum ProviderKind {
    /// Local handlers: a subtree, or a single leaf at service level.
    Node(Node),
    /// A remote peer; the entry's ident is the peer's process name.
    Remote,
    /// Forwarded to an OSC server.
    Osc(OscTarget),
    /// A bridged lite client.
    Lite(u32),
}

impl ProviderKind {
    pub fn name(&self) -> &'static str {
        match *self {
            ProviderKind::Node(_) => "Node",
            ProviderKind::Remote  => "Remote",
            ProviderKind::Osc(_)  => "Osc",
            ProviderKind::Lite(_) => "Lite",
        }
    }
}

pub struct ProviderEntry {
    /// Identity of the offering process; the ordering key.
    pub ident: String,
    pub kind: ProviderKind,
    pub properties: String,
}

/// An observer: every delivery to the tappee is copied to
/// `tapper_service` at `tapper_proc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tap {
    pub tapper_service: String,
    pub tapper_proc: String,
}

pub struct ServiceEntry {
    pub providers: Vec<ProviderEntry>,
    pub taps: Vec<Tap>,
}

impl ServiceEntry {
    fn new() -> ServiceEntry {
        ServiceEntry {
            providers: Vec::new(),
            taps: Vec::new(),
        }
    }

    pub fn active(&self) -> Option<&ProviderEntry> {
        self.providers.first()
    }

    fn is_empty(&self) -> bool {
        self.providers.is_empty() && self.taps.is_empty()
    }
}

/// What an insertion or removal did to the service, so the session can
/// broadcast the right status changes.
#[derive(Debug, PartialEq, Eq)]
pub enum Change {
    /// The active provider is now the named identity.
    NewActive(String),
    /// A non-active provider changed; no visible effect.
    Quiet,
    /// The service lost its last provider and tap, and was removed.
    Gone,
}

pub struct ServiceTable {
    pub services: HashMap<String, ServiceEntry>,
    pub full_paths: HashMap<String, Rc<Method>>,
}

impl ServiceTable {
    pub fn new() -> ServiceTable {
        ServiceTable {
            services: HashMap::new(),
            full_paths: HashMap::new(),
        }
    }

    pub fn lookup(&self, service: &str) -> Option<&ServiceEntry> {
        self.services.get(service)
    }

    /// Install a provider, keeping providers sorted by descending
    /// identity. A provider from the same identity is replaced in place.
    pub fn add_provider(&mut self, service: &str, provider: ProviderEntry)
                        -> Result<Change> {
        check_service_name(service)?;
        let entry = self.services.entry(service.to_owned())
                                 .or_insert_with(ServiceEntry::new);

        if let Some(at) = entry.providers.iter()
                               .position(|p| p.ident == provider.ident) {
            let was_active = at == 0;
            entry.providers[at] = provider;
            return Ok(if was_active {
                Change::NewActive(entry.providers[0].ident.clone())
            } else {
                Change::Quiet
            });
        }

        let at = entry.providers.iter()
                      .position(|p| p.ident < provider.ident)
                      .unwrap_or(entry.providers.len());
        entry.providers.insert(at, provider);
        Ok(if at == 0 {
            Change::NewActive(entry.providers[0].ident.clone())
        } else {
            Change::Quiet
        })
    }

    /// Create a locally provided service backed by an empty subtree.
    pub fn create_local(&mut self, service: &str, local_ident: &str)
                        -> Result<Change> {
        check_service_name(service)?;
        let taken = self.services.get(service)
            .map(|entry| entry.providers.iter().any(|p| p.ident == local_ident))
            .unwrap_or(false);
        if taken {
            return Err(Error::ServiceExists(service.to_owned()));
        }

        self.add_provider(service, ProviderEntry {
            ident: local_ident.to_owned(),
            kind: ProviderKind::Node(Node::empty()),
            properties: String::new(),
        })
    }

    /// Remove the provider offered by `ident`; promotes the next-highest
    /// provider when the active one goes away.
    pub fn remove_provider(&mut self, service: &str, ident: &str)
                           -> Option<Change> {
        let change = {
            let entry = self.services.get_mut(service)?;
            let at = entry.providers.iter().position(|p| p.ident == ident)?;
            entry.providers.remove(at);
            if entry.is_empty() {
                Change::Gone
            } else if at == 0 {
                match entry.active() {
                    Some(next) => Change::NewActive(next.ident.clone()),
                    None => Change::Quiet, // taps remain
                }
            } else {
                Change::Quiet
            }
        };
        if change == Change::Gone {
            self.services.remove(service);
        }
        self.drop_full_paths_if_no_local(service);
        Some(change)
    }

    fn drop_full_paths_if_no_local(&mut self, service: &str) {
        let has_local = self.services.get(service)
            .map(|entry| entry.providers.iter().any(|p| match p.kind {
                ProviderKind::Node(_) => true,
                _ => false,
            }))
            .unwrap_or(false);
        if !has_local {
            let prefix = format!("/{}/", service);
            let top = format!("/{}", service);
            self.full_paths.retain(|path, _| {
                path != &top && !path.starts_with(&prefix)
            });
        }
    }

    pub fn add_tap(&mut self, tappee: &str, tap: Tap) -> Result<()> {
        check_service_name(tappee)?;
        let entry = self.services.entry(tappee.to_owned())
                                 .or_insert_with(ServiceEntry::new);
        if entry.taps.contains(&tap) {
            return Err(Error::ServiceExists(tappee.to_owned()));
        }
        entry.taps.push(tap);
        Ok(())
    }

    pub fn remove_tap(&mut self, tappee: &str, tap: &Tap) -> Result<()> {
        let now_empty = {
            let entry = self.services.get_mut(tappee)
                .ok_or_else(|| Error::NoService(tappee.to_owned()))?;
            let before = entry.taps.len();
            entry.taps.retain(|t| t != tap);
            if entry.taps.len() == before {
                return Err(Error::NoService(tappee.to_owned()));
            }
            entry.is_empty()
        };
        if now_empty {
            self.services.remove(tappee);
        }
        Ok(())
    }

    /// Cascade removal when a process disappears: drop every provider it
    /// offered and every tap that forwarded to it. Returns the affected
    /// services and what happened to each.
    pub fn remove_process(&mut self, ident: &str) -> Vec<(String, Change)> {
        let names: Vec<String> = self.services.keys().cloned().collect();
        let mut changes = Vec::new();

        for name in names {
            {
                let entry = self.services.get_mut(&name).unwrap();
                entry.taps.retain(|t| t.tapper_proc != ident);
            }
            if let Some(change) = self.remove_provider(&name, ident) {
                changes.push((name, change));
            } else {
                // no provider from that process; the entry may still have
                // become empty through tap removal
                let empty = self.services.get(&name)
                                .map(ServiceEntry::is_empty)
                                .unwrap_or(false);
                if empty {
                    self.services.remove(&name);
                    changes.push((name, Change::Gone));
                }
            }
        }
        changes
    }

    /// Cascade removal of every service provided through one lite bridge.
    pub fn remove_lite(&mut self, id: u32) -> Vec<(String, Change)> {
        let names: Vec<String> = self.services.iter()
            .filter(|&(_, entry)| entry.providers.iter().any(|p| match p.kind {
                ProviderKind::Lite(owner) => owner == id,
                _ => false,
            }))
            .map(|(name, _)| name.clone())
            .collect();
        let mut changes = Vec::new();

        for name in names {
            let change = {
                let entry = self.services.get_mut(&name).unwrap();
                let at = entry.providers.iter().position(|p| match p.kind {
                    ProviderKind::Lite(owner) => owner == id,
                    _ => false,
                }).unwrap();
                entry.providers.remove(at);
                if entry.is_empty() {
                    Change::Gone
                } else if at == 0 {
                    match entry.active() {
                        Some(next) => Change::NewActive(next.ident.clone()),
                        None => Change::Quiet,
                    }
                } else {
                    Change::Quiet
                }
            };
            if change == Change::Gone {
                self.services.remove(&name);
            }
            changes.push((name, change));
        }
        changes
    }

    /// Install a handler at `path` ("/svc" or "/svc/a/b"). The service
    /// must already be locally provided. A placement that collides with
    /// an existing leaf or subtree is a conflict, never a silent replace.
    pub fn install_method(&mut self, path: &str, local_ident: &str,
                          method: Rc<Method>) -> Result<()> {
        let stripped = match path.as_bytes().first() {
            Some(&b'/') => &path[1..],
            _ => return Err(Error::BadName(path.to_owned())),
        };
        let mut segments = stripped.split('/');
        let service = segments.next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::BadName(path.to_owned()))?;
        let rest: Vec<&str> = segments.collect();
        if rest.iter().any(|s| s.is_empty()) {
            return Err(Error::BadName(path.to_owned()));
        }

        {
            let entry = self.services.get_mut(service)
                .ok_or_else(|| Error::NoService(service.to_owned()))?;
            let provider = entry.providers.iter_mut()
                .find(|p| p.ident == local_ident)
                .ok_or_else(|| Error::NoService(service.to_owned()))?;
            let node = match provider.kind {
                ProviderKind::Node(ref mut node) => node,
                _ => return Err(Error::ServiceConflict(service.to_owned())),
            };

            if rest.is_empty() {
                // handler at service level: only onto a virgin subtree
                match *node {
                    Node::Branch(ref children) if children.is_empty() => {}
                    _ => return Err(Error::ServiceConflict(service.to_owned())),
                }
                *node = Node::Leaf(method.clone());
            } else {
                insert_leaf(node, &rest, method.clone(), service)?;
            }
        }
        self.full_paths.insert(path.to_owned(), method);
        Ok(())
    }
}

fn insert_leaf(node: &mut Node, segments: &[&str], method: Rc<Method>,
               service: &str) -> Result<()> {
    match *node {
        Node::Leaf(_) => Err(Error::ServiceConflict(service.to_owned())),
        Node::Branch(ref mut children) => {
            if segments.len() == 1 {
                if children.contains_key(segments[0]) {
                    return Err(Error::ServiceConflict(service.to_owned()));
                }
                children.insert(segments[0].to_owned(), Node::Leaf(method));
                Ok(())
            } else {
                let child = children.entry(segments[0].to_owned())
                                    .or_insert_with(Node::empty);
                insert_leaf(child, &segments[1..], method, service)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    fn remote(ident: &str) -> ProviderEntry {
        ProviderEntry {
            ident: ident.to_owned(),
            kind: ProviderKind::Remote,
            properties: String::new(),
        }
    }

    fn noop() -> Rc<Method> {
        Rc::new(Method {
            typespec: None,
            coerce: false,
            parse: false,
            func: Box::new(|_, _, _, _| {}),
        })
    }

    #[test]
    fn providers_stay_in_descending_identity_order() {
        let mut table = ServiceTable::new();
        table.add_provider("svc", remote("@00000000:c0a80102:1f41")).unwrap();
        table.add_provider("svc", remote("@00000000:c0a80102:1f43")).unwrap();
        table.add_provider("svc", remote("@00000000:c0a80102:1f42")).unwrap();

        let entry = table.lookup("svc").unwrap();
        let idents: Vec<&str> =
            entry.providers.iter().map(|p| p.ident.as_str()).collect();
        assert_eq!(vec!["@00000000:c0a80102:1f43",
                        "@00000000:c0a80102:1f42",
                        "@00000000:c0a80102:1f41"], idents);
    }

    #[test]
    fn removing_the_active_provider_promotes_the_next() {
        let mut table = ServiceTable::new();
        table.add_provider("svc", remote("@00000000:c0a80102:1f41")).unwrap();
        table.add_provider("svc", remote("@00000000:c0a80102:1f43")).unwrap();

        let change = table.remove_provider("svc", "@00000000:c0a80102:1f43");
        assert_eq!(Some(Change::NewActive("@00000000:c0a80102:1f41".to_owned())),
                   change);
        let change = table.remove_provider("svc", "@00000000:c0a80102:1f41");
        assert_eq!(Some(Change::Gone), change);
        assert!(table.lookup("svc").is_none());
    }

    #[test]
    fn double_local_creation_is_rejected() {
        let mut table = ServiceTable::new();
        table.create_local("svc", "@00000000:c0a80102:1f41").unwrap();
        let again = table.create_local("svc", "@00000000:c0a80102:1f41");

        assert!(again.is_err());
    }

    #[test]
    fn method_placement_conflicts_are_never_silent() {
        let mut table = ServiceTable::new();
        let me = "@00000000:c0a80102:1f41";
        table.create_local("svc", me).unwrap();

        table.install_method("/svc/a/b", me, noop()).unwrap();
        // a leaf cannot replace another leaf
        assert!(table.install_method("/svc/a/b", me, noop()).is_err());
        // a service-level handler cannot bury the existing subtree
        assert!(table.install_method("/svc", me, noop()).is_err());
        // and a handler below a leaf is equally impossible
        assert!(table.install_method("/svc/a/b/c", me, noop()).is_err());

        assert!(table.full_paths.contains_key("/svc/a/b"));
    }

    #[test]
    fn process_removal_cascades_to_services_and_taps() {
        let mut table = ServiceTable::new();
        let gone = "@00000000:c0a80102:1f43";
        table.add_provider("svc", remote("@00000000:c0a80102:1f41")).unwrap();
        table.add_provider("svc", remote(gone)).unwrap();
        table.add_provider("only", remote(gone)).unwrap();
        table.add_tap("watched", Tap {
            tapper_service: "spy".to_owned(),
            tapper_proc: gone.to_owned(),
        }).unwrap();

        let mut changes = table.remove_process(gone);
        changes.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(3, changes.len());
        assert_eq!(("only".to_owned(), Change::Gone), changes[0]);
        assert_eq!(("svc".to_owned(),
                    Change::NewActive("@00000000:c0a80102:1f41".to_owned())),
                   changes[1]);
        assert_eq!(("watched".to_owned(), Change::Gone), changes[2]);
        assert!(table.lookup("watched").is_none());
    }
}
