// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Peer-to-peer discovery and timed messaging for soft-real-time
//! ensembles, such as networked music performances and interactive
//! installations.
//!
//! Each participating process advertises named **services**; any process
//! can invoke a handler on any service by sending a hierarchically
//! addressed, typed message, optionally timestamped for scheduled
//! delivery. A distributed clock-synchronization protocol gives all
//! synchronized processes a common time reference.
//!
//! The whole fabric runs cooperatively on one thread: build a
//! [Session](struct.Session.html), install services and methods, then
//! call [poll](struct.Session.html#method.poll) in your event loop.
//!
//! ```no_run
//! use tactus::SessionBuilder;
//!
//! let mut sess = SessionBuilder::new("rehearsal").start().unwrap();
//! sess.service_new("synth").unwrap();
//! sess.method_new("/synth/freq", Some("f"), |_sess, _msg, _types, args| {
//!     println!("freq = {:?}", args[0]);
//! }).unwrap();
//! loop {
//!     sess.poll_timeout(2).unwrap();
//! }
//! ```

#[macro_use] extern crate log;
extern crate byteorder;
extern crate mio;
extern crate time;

mod global;
mod error;
mod mem;
mod msg;
mod pattern;
mod sched;
mod clock;
mod net;
mod services;
mod proxy;
mod osc;
mod lite;
mod discovery;
mod peer;
mod dispatch;
mod session;

pub mod properties;

pub use error::{Error, Result};
pub use global::{proc_name, DebugFlags, Status};
pub use mem::{MemPolicy, MemReport};
pub use msg::build::bundle;
pub use msg::{Arg, Extract, Message, MsgWriter, VecArg};
pub use discovery::{parse_txt, DiscMode, PORT_TABLE};
pub use session::{MsgBuild, Session, SessionBuilder};
