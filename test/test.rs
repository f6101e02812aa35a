// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

#[macro_use]
extern crate log;
extern crate env_logger;
extern crate byteorder;
extern crate rand;
extern crate tactus;

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use tactus::*;

// The core is single-threaded by contract, so two in-process sessions
// polled alternately on one thread stand in for two processes.

fn ensemble(tag: &str) -> String {
    format!("{}-{}", tag, rand::random::<u16>())
}

fn session(ensemble: &str) -> Session {
    SessionBuilder::new(ensemble)
        .discovery(DiscMode::Resolver)
        .start()
        .unwrap()
}

/// Make `a` aware of `b`; the tie-break takes it from there.
fn introduce(a: &mut Session, b: &Session) {
    let name = b.name().to_owned();
    let tcp = b.tcp_port();
    let udp = b.udp_port();
    a.discovered(&name, Ipv4Addr::new(127, 0, 0, 1), tcp, udp).unwrap();
}

fn converge(a: &mut Session, b: &mut Session) {
    for _ in 0..2000 {
        a.poll_timeout(1).unwrap();
        b.poll_timeout(1).unwrap();
        if a.status(b.name()) != Status::Unknown &&
           b.status(a.name()) != Status::Unknown {
            return;
        }
    }
    panic!("sessions failed to converge");
}

#[test]
fn two_process_discovery_and_echo() {
    let _ = env_logger::init();
    let ens = ensemble("echo");
    let mut p1 = session(&ens);
    let mut p2 = session(&ens);

    let acks: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let acks_in_handler = acks.clone();
    p1.service_new("peer1").unwrap();
    p1.method_new("/peer1/ack", Some("s"), move |_sess, _msg, _types, args| {
        acks_in_handler.borrow_mut().push(args[0].str().unwrap().to_owned());
    }).unwrap();

    let echoes = Rc::new(RefCell::new(0));
    let echoes_in_handler = echoes.clone();
    p2.service_new("peer2").unwrap();
    p2.method_new("/peer2/echo", Some("s"), move |sess, _msg, _types, args| {
        *echoes_in_handler.borrow_mut() += 1;
        let text = args[0].str().unwrap().to_owned();
        sess.send_to("/peer1/ack").add_str(&text).deliver().unwrap();
    }).unwrap();

    introduce(&mut p1, &p2);
    converge(&mut p1, &mut p2);
    for _ in 0..500 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        if p1.status("peer2") != Status::Unknown {
            break;
        }
    }
    assert_eq!(Status::RemoteNoTime, p1.status("peer2"));
    info!("'{}' and '{}' are connected", p1.name(), p2.name());

    p1.send_to("/peer2/echo").add_str("hello").deliver().unwrap();
    for _ in 0..2000 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        if !acks.borrow().is_empty() {
            break;
        }
    }

    assert_eq!(1, *echoes.borrow());
    assert_eq!(vec!["hello".to_owned()], *acks.borrow());
}

#[test]
fn exactly_one_connection_per_pair() {
    let _ = env_logger::init();
    let ens = ensemble("pair");
    let mut p1 = session(&ens);
    let mut p2 = session(&ens);

    // both sides discover each other at the same time; the ordering
    // tie-break must still leave exactly one usable link
    introduce(&mut p1, &p2);
    introduce(&mut p2, &p1);
    converge(&mut p1, &mut p2);
    for _ in 0..200 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
    }

    // one peer record each, and messages flow
    let pings = Rc::new(RefCell::new(0));
    let pings_in_handler = pings.clone();
    p2.service_new("target").unwrap();
    p2.method_new("/target/ping", Some("i"), move |_sess, _msg, _types, _args| {
        *pings_in_handler.borrow_mut() += 1;
    }).unwrap();
    for _ in 0..500 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        if p1.status("target") != Status::Unknown {
            break;
        }
    }
    p1.send_to("/target/ping").add_i32(1).deliver().unwrap();
    for _ in 0..500 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        if *pings.borrow() > 0 {
            break;
        }
    }
    assert_eq!(1, *pings.borrow());
}

#[test]
fn clock_sync_convergence() {
    let _ = env_logger::init();
    let ens = ensemble("clock");
    let mut p1 = session(&ens);
    let mut p2 = session(&ens);

    p1.clock_set().unwrap();
    assert!(p1.global_time().is_some());

    introduce(&mut p1, &p2);
    converge(&mut p1, &mut p2);

    // five samples at the fast ping rate: well under the 5 s bound
    for _ in 0..5000 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        if p2.global_time().is_some() {
            break;
        }
    }
    let p2_global = p2.global_time().expect("p2 failed to synchronize");
    let p1_global = p1.global_time().unwrap();
    assert!((p1_global - p2_global).abs() < 0.010,
            "offset {} too large", (p1_global - p2_global).abs());

    // and the peer's services now report synchronized statuses
    for _ in 0..500 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        if p1.status(p2.name()) == Status::Remote {
            break;
        }
    }
    assert_eq!(Status::Remote, p1.status(p2.name()));
}

#[test]
fn timestamped_scheduling() {
    let _ = env_logger::init();
    let ens = ensemble("sched");
    let mut p1 = session(&ens);
    let mut p2 = session(&ens);

    p1.clock_set().unwrap();
    introduce(&mut p1, &p2);
    converge(&mut p1, &mut p2);
    for _ in 0..5000 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        if p2.global_time().is_some() {
            break;
        }
    }
    assert!(p2.global_time().is_some());

    let hit: Rc<RefCell<Option<f64>>> = Rc::new(RefCell::new(None));
    let hit_in_handler = hit.clone();
    p2.service_new("peer2").unwrap();
    p2.method_new("/peer2/at", Some("i"), move |sess, _msg, _types, _args| {
        *hit_in_handler.borrow_mut() = sess.global_time();
    }).unwrap();
    for _ in 0..500 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        if p1.status("peer2") != Status::Unknown {
            break;
        }
    }

    let intended = p1.global_time().unwrap() + 0.3;
    p1.send_to("/peer2/at").at(intended).add_i32(0).deliver().unwrap();
    for _ in 0..5000 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        if hit.borrow().is_some() {
            break;
        }
    }

    let dispatched = hit.borrow().expect("scheduled message never dispatched");
    assert!((dispatched - intended).abs() < 0.020,
            "dispatch off by {}", (dispatched - intended).abs());
}

#[test]
fn service_failover_promotes_the_survivor() {
    let _ = env_logger::init();
    let ens = ensemble("failover");
    let mut p1 = session(&ens);
    let pa = session(&ens);
    let pb = session(&ens);

    // order the two providers by identity: `winner` is the active one
    let (mut winner, mut survivor) = if pa.name() > pb.name() {
        (pa, pb)
    } else {
        (pb, pa)
    };

    let winner_hits = Rc::new(RefCell::new(0));
    let winner_in_handler = winner_hits.clone();
    winner.service_new("svc").unwrap();
    winner.method_new("/svc/x", None, move |_sess, _msg, _types, _args| {
        *winner_in_handler.borrow_mut() += 1;
    }).unwrap();

    let survivor_hits = Rc::new(RefCell::new(0));
    let survivor_in_handler = survivor_hits.clone();
    survivor.service_new("svc").unwrap();
    survivor.method_new("/svc/x", None, move |_sess, _msg, _types, _args| {
        *survivor_in_handler.borrow_mut() += 1;
    }).unwrap();

    // p1 watches for the status broadcast
    let si: Rc<RefCell<Vec<(String, i32, String)>>> =
        Rc::new(RefCell::new(Vec::new()));
    let si_in_handler = si.clone();
    p1.method_new("/_o2/si", Some("siss"), move |_sess, _msg, _types, args| {
        si_in_handler.borrow_mut().push((
            args[0].str().unwrap().to_owned(),
            match args[1] { Arg::Int32(v) => v, _ => -1 },
            args[2].str().unwrap().to_owned(),
        ));
    }).unwrap();

    introduce(&mut p1, &winner);
    converge(&mut p1, &mut winner);
    introduce(&mut p1, &survivor);
    converge(&mut p1, &mut survivor);
    introduce(&mut winner, &survivor);
    converge(&mut winner, &mut survivor);
    for _ in 0..1000 {
        p1.poll_timeout(1).unwrap();
        winner.poll_timeout(1).unwrap();
        survivor.poll_timeout(1).unwrap();
        if p1.status("svc") != Status::Unknown {
            break;
        }
    }
    assert_ne!(Status::Unknown, p1.status("svc"));
    // let both advertisement replays settle so p1 knows both providers
    for _ in 0..300 {
        p1.poll_timeout(1).unwrap();
        winner.poll_timeout(1).unwrap();
        survivor.poll_timeout(1).unwrap();
    }

    p1.send_to("/svc/x").deliver().unwrap();
    for _ in 0..1000 {
        p1.poll_timeout(1).unwrap();
        winner.poll_timeout(1).unwrap();
        survivor.poll_timeout(1).unwrap();
        if *winner_hits.borrow() > 0 {
            break;
        }
    }
    assert_eq!(1, *winner_hits.borrow());
    assert_eq!(0, *survivor_hits.borrow());

    // the active provider dies; the survivor must take over within 1 s
    let survivor_name = survivor.name().to_owned();
    drop(winner);
    for _ in 0..1000 {
        p1.poll_timeout(1).unwrap();
        survivor.poll_timeout(1).unwrap();
        let promoted = si.borrow().iter().any(|&(ref service, _, ref process)| {
            service == "svc" && process == &survivor_name
        });
        if promoted {
            break;
        }
    }
    let promoted = si.borrow().iter().any(|&(ref service, _, ref process)| {
        service == "svc" && process == &survivor_name
    });
    assert!(promoted, "no status broadcast named the survivor");

    p1.send_to("/svc/x").deliver().unwrap();
    for _ in 0..1000 {
        p1.poll_timeout(1).unwrap();
        survivor.poll_timeout(1).unwrap();
        if *survivor_hits.borrow() > 0 {
            break;
        }
    }
    assert_eq!(1, *survivor_hits.borrow());
}

#[test]
fn taps_duplicate_in_order_with_the_flag() {
    let _ = env_logger::init();
    let ens = ensemble("tap");
    let mut p1 = session(&ens);
    let mut p2 = session(&ens);

    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let order_observed = order.clone();
    p1.service_new("observed").unwrap();
    p1.method_new("/observed/e", Some("i"), move |_sess, msg, _types, _args| {
        assert!(!msg.is_tap());
        order_observed.borrow_mut().push("observed");
    }).unwrap();

    let order_observer = order.clone();
    p1.service_new("observer").unwrap();
    p1.method_new("/observer/e", Some("i"), move |_sess, msg, _types, _args| {
        assert!(msg.is_tap());
        order_observer.borrow_mut().push("observer");
    }).unwrap();

    p1.tap("observed", "observer").unwrap();

    introduce(&mut p1, &p2);
    converge(&mut p1, &mut p2);
    for _ in 0..500 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        if p2.status("observed") != Status::Unknown {
            break;
        }
    }

    p2.send_to("/observed/e").add_i32(42).deliver().unwrap();
    for _ in 0..1000 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        if order.borrow().len() == 2 {
            break;
        }
    }

    assert_eq!(vec!["observed", "observer"], *order.borrow());
}

#[test]
fn pattern_addresses_reach_every_match() {
    let _ = env_logger::init();
    let mut sess = session(&ensemble("pattern"));
    sess.service_new("svc").unwrap();

    let hits: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    for leaf in ["1", "2", "3"].iter() {
        let hits_in_handler = hits.clone();
        let label = leaf.to_string();
        sess.method_new(&format!("/svc/a/{}", leaf), None,
                        move |_sess, _msg, _types, _args| {
            hits_in_handler.borrow_mut().push(label.clone());
        }).unwrap();
    }

    sess.send_to("/svc/a/*").deliver().unwrap();
    sess.poll().unwrap();

    let mut seen = hits.borrow().clone();
    seen.sort();
    assert_eq!(vec!["1".to_owned(), "2".to_owned(), "3".to_owned()], seen);

    // and a bracketed set hits a subset
    hits.borrow_mut().clear();
    sess.send_to("/svc/a/[12]").deliver().unwrap();
    sess.poll().unwrap();
    let mut seen = hits.borrow().clone();
    seen.sort();
    assert_eq!(vec!["1".to_owned(), "2".to_owned()], seen);
}

#[test]
fn tcp_messages_arrive_in_send_order() {
    let _ = env_logger::init();
    let ens = ensemble("order");
    let mut p1 = session(&ens);
    let mut p2 = session(&ens);

    let received: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
    let received_in_handler = received.clone();
    p2.service_new("sink").unwrap();
    p2.method_new("/sink/n", Some("i"), move |_sess, _msg, _types, args| {
        received_in_handler.borrow_mut().push(
            match args[0] { Arg::Int32(v) => v, _ => -1 });
    }).unwrap();

    introduce(&mut p1, &p2);
    converge(&mut p1, &mut p2);
    for _ in 0..500 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        if p1.status("sink") != Status::Unknown {
            break;
        }
    }

    for n in 0..100 {
        p1.send_to("/sink/n").add_i32(n).deliver().unwrap();
    }
    for _ in 0..2000 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        if received.borrow().len() == 100 {
            break;
        }
    }

    let received = received.borrow();
    assert_eq!(100, received.len());
    for n in 0..100 {
        assert_eq!(n as i32, received[n]);
    }
}

#[test]
fn clean_shutdown_leaks_no_buffers() {
    let _ = env_logger::init();
    let ens = ensemble("leak");
    let mut p1 = session(&ens);
    let mut p2 = session(&ens);

    let count = Rc::new(RefCell::new(0));
    let count_in_handler = count.clone();
    p2.service_new("sink").unwrap();
    p2.method_new("/sink/n", Some("i"), move |_sess, _msg, _types, _args| {
        *count_in_handler.borrow_mut() += 1;
    }).unwrap();

    introduce(&mut p1, &p2);
    converge(&mut p1, &mut p2);
    for _ in 0..500 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        if p1.status("sink") != Status::Unknown {
            break;
        }
    }
    for n in 0..20 {
        p1.send_to("/sink/n").add_i32(n).deliver().unwrap();
    }
    for _ in 0..1000 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        if *count.borrow() == 20 {
            break;
        }
    }
    assert_eq!(20, *count.borrow());

    assert_eq!(0, p1.finish().in_use());
    assert_eq!(0, p2.finish().in_use());
}

#[test]
fn coercion_feeds_declared_types_and_drops_mismatches() {
    let _ = env_logger::init();
    let mut sess = session(&ensemble("coerce"));
    sess.service_new("svc").unwrap();

    let got: Rc<RefCell<Vec<Arg>>> = Rc::new(RefCell::new(Vec::new()));
    let got_in_handler = got.clone();
    sess.method_new("/svc/d", Some("d"), move |_sess, _msg, _types, args| {
        got_in_handler.borrow_mut().push(args[0].clone());
    }).unwrap();

    let dropped = Rc::new(RefCell::new(0));
    let dropped_in_callback = dropped.clone();
    sess.on_warning(move |_reason, _msg| {
        *dropped_in_callback.borrow_mut() += 1;
    });

    // i32 coerces into the declared double
    sess.send_to("/svc/d").add_i32(21).deliver().unwrap();
    sess.poll().unwrap();
    assert_eq!(vec![Arg::Double(21.0)], *got.borrow());

    // a string does not; the message is dropped with a warning
    sess.send_to("/svc/d").add_str("nope").deliver().unwrap();
    sess.poll().unwrap();
    assert_eq!(1, got.borrow().len());
    assert_eq!(1, *dropped.borrow());
}

#[test]
fn lite_bridge_services_join_the_fabric() {
    let _ = env_logger::init();
    let mut sponsor = session(&ensemble("lite"));

    // a minimal lite client: one TCP link, the con/sv handshake
    let mut client = ::std::net::TcpStream::connect(
        format!("127.0.0.1:{}", sponsor.tcp_port())).unwrap();
    client.set_nonblocking(true).unwrap();

    let mut writer = MsgWriter::new();
    writer.add_str("127.0.0.1");
    writer.add_i32(0); // no udp return path in this test
    let con = writer.finish("!_o2/o2lite/con", 0.0, true).unwrap();
    send_raw(&mut client, &con);

    writer.add_str("liteserv");
    writer.add_i32(1);
    writer.add_i32(1);
    writer.add_str("");
    let sv = writer.finish("!_o2/o2lite/sv", 0.0, true).unwrap();
    send_raw(&mut client, &sv);

    for _ in 0..2000 {
        sponsor.poll_timeout(1).unwrap();
        if sponsor.status("liteserv") != Status::Unknown {
            break;
        }
    }
    assert_eq!(Status::BridgeNoTime, sponsor.status("liteserv"));

    // the client got its id back
    let frames = read_frames(&mut client);
    let id_frame = frames.iter()
        .map(|f| Message::from_wire(f.clone()).unwrap())
        .find(|m| m.address() == "!_o2/id");
    assert!(id_frame.is_some());

    // a message to the bridged service is forwarded out the link
    sponsor.send_to("/liteserv/x").add_i32(7).deliver().unwrap();
    sponsor.poll().unwrap();
    let mut forwarded = None;
    for _ in 0..2000 {
        sponsor.poll_timeout(1).unwrap();
        let frames = read_frames(&mut client);
        if let Some(frame) = frames.into_iter()
            .map(|f| Message::from_wire(f).unwrap())
            .find(|m| m.address() == "/liteserv/x") {
            forwarded = Some(frame);
            break;
        }
    }
    assert!(forwarded.is_some());
}

#[test]
fn osc_delegate_forwards_translated_packets() {
    let _ = env_logger::init();
    let mut sess = session(&ensemble("osc"));

    let osc_server = ::std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    osc_server.set_nonblocking(true).unwrap();
    let addr = osc_server.local_addr().unwrap();

    sess.osc_delegate("synth", addr, false).unwrap();
    assert_eq!(Status::ToOscNoTime, sess.status("synth"));

    sess.send_to("/synth/freq").udp().add_f32(440.0).deliver().unwrap();
    sess.poll().unwrap();

    let mut buf = [0u8; 1024];
    let mut packet = None;
    for _ in 0..200 {
        sess.poll_timeout(1).unwrap();
        if let Ok((len, _)) = osc_server.recv_from(&mut buf) {
            packet = Some(buf[..len].to_vec());
            break;
        }
    }
    let packet = packet.expect("no OSC packet arrived");
    assert!(packet.starts_with(b"/freq\0"));
}

#[test]
fn properties_propagate_with_advertisements() {
    let _ = env_logger::init();
    let ens = ensemble("props");
    let mut p1 = session(&ens);
    let mut p2 = session(&ens);

    p1.service_new("synth").unwrap();
    p1.service_set_property("synth", "voice", "lead;main").unwrap();

    introduce(&mut p1, &p2);
    converge(&mut p1, &mut p2);
    for _ in 0..1000 {
        p1.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        if p2.service_property("synth", "voice").is_some() {
            break;
        }
    }

    assert_eq!(Some("lead;main".to_owned()),
               p2.service_property("synth", "voice"));
}

#[test]
fn hub_mode_relays_discovery() {
    let _ = env_logger::init();
    let ens = ensemble("hub");
    let mut hub = session(&ens);
    let hub_port = hub.tcp_port();

    let mut p2 = SessionBuilder::new(&ens)
        .hub(Ipv4Addr::new(127, 0, 0, 1), hub_port)
        .start()
        .unwrap();
    let mut p3 = SessionBuilder::new(&ens)
        .hub(Ipv4Addr::new(127, 0, 0, 1), hub_port)
        .start()
        .unwrap();

    // both clients reach the hub, and through its replay, each other
    for _ in 0..4000 {
        hub.poll_timeout(1).unwrap();
        p2.poll_timeout(1).unwrap();
        p3.poll_timeout(1).unwrap();
        if p2.status(p3.name()) != Status::Unknown &&
           p3.status(p2.name()) != Status::Unknown {
            break;
        }
    }

    assert_ne!(Status::Unknown, p2.status(hub.name()));
    assert_ne!(Status::Unknown, p2.status(p3.name()));
    assert_ne!(Status::Unknown, p3.status(p2.name()));
}

#[test]
fn bundles_deliver_every_element() {
    let _ = env_logger::init();
    let mut sess = session(&ensemble("bundle"));
    sess.service_new("svc").unwrap();

    let hits: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
    let hits_in_handler = hits.clone();
    sess.method_new("/svc/n", Some("i"), move |_sess, _msg, _types, args| {
        hits_in_handler.borrow_mut().push(
            match args[0] { Arg::Int32(v) => v, _ => -1 });
    }).unwrap();

    sess.send_to("/svc/n").add_i32(0).deliver().unwrap(); // plain first
    sess.poll().unwrap();

    // loop a bundle through the session's own TCP server
    let mut raw = ::std::net::TcpStream::connect(
        format!("127.0.0.1:{}", sess.tcp_port())).unwrap();
    let mut writer = MsgWriter::new();
    writer.add_i32(1);
    let first = writer.finish("/svc/n", 0.0, true).unwrap();
    writer.add_i32(2);
    let second = writer.finish("/svc/n", 0.0, true).unwrap();
    let wrapped = bundle(0.0, &[first, second]).unwrap();
    send_raw(&mut raw, &wrapped);

    for _ in 0..2000 {
        sess.poll_timeout(1).unwrap();
        if hits.borrow().len() == 3 {
            break;
        }
    }
    assert_eq!(vec![0, 1, 2], *hits.borrow());
}

// ---- raw-wire helpers for the lite client ----

fn send_raw(stream: &mut ::std::net::TcpStream, msg: &Message) {
    let wire = msg.to_wire();
    let mut frame = Vec::with_capacity(4 + wire.len());
    frame.write_u32::<BigEndian>(wire.len() as u32).unwrap();
    frame.extend_from_slice(&wire);
    stream.write_all(&frame).unwrap();
}

fn read_frames(stream: &mut ::std::net::TcpStream) -> Vec<Vec<u8>> {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => raw.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }

    let mut frames = Vec::new();
    let mut at = 0;
    while at + 4 <= raw.len() {
        let len = BigEndian::read_u32(&raw[at..at + 4]) as usize;
        at += 4;
        if at + len > raw.len() {
            break;
        }
        frames.push(raw[at..at + len].to_vec());
        at += len;
    }
    frames
}
