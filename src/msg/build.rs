// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use byteorder::{NativeEndian, WriteBytesExt};

use error::{Error, Result};
use global::padded_len;
use super::{Arg, Message, VecArg, ADDR_OFF, FLAG_TCP};

/// Accumulates one message from typed pieces. The two scratch buffers grow
/// monotonically and are cleared at each start; a build must complete
/// before another begins on the same writer.
pub struct MsgWriter {
    types: Vec<u8>,
    data: Vec<u8>,
}

impl MsgWriter {
    pub fn new() -> MsgWriter {
        MsgWriter {
            types: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.types.clear();
        self.data.clear();
    }

    pub fn add_i32(&mut self, v: i32) {
        self.types.push(b'i');
        self.data.write_i32::<NativeEndian>(v).unwrap();
    }

    pub fn add_i64(&mut self, v: i64) {
        self.types.push(b'h');
        self.data.write_i64::<NativeEndian>(v).unwrap();
    }

    pub fn add_f32(&mut self, v: f32) {
        self.types.push(b'f');
        self.data.write_f32::<NativeEndian>(v).unwrap();
    }

    pub fn add_f64(&mut self, v: f64) {
        self.types.push(b'd');
        self.data.write_f64::<NativeEndian>(v).unwrap();
    }

    pub fn add_time(&mut self, v: f64) {
        self.types.push(b't');
        self.data.write_f64::<NativeEndian>(v).unwrap();
    }

    pub fn add_str(&mut self, v: &str) {
        self.types.push(b's');
        self.push_padded_str(v);
    }

    pub fn add_symbol(&mut self, v: &str) {
        self.types.push(b'S');
        self.push_padded_str(v);
    }

    pub fn add_blob(&mut self, v: &[u8]) {
        self.types.push(b'b');
        self.data.write_i32::<NativeEndian>(v.len() as i32).unwrap();
        self.data.extend_from_slice(v);
        let aligned = ::global::align4(v.len());
        for _ in v.len()..aligned {
            self.data.push(0);
        }
    }

    pub fn add_midi(&mut self, v: u32) {
        self.types.push(b'm');
        self.data.write_u32::<NativeEndian>(v).unwrap();
    }

    pub fn add_char(&mut self, v: char) {
        self.types.push(b'c');
        self.data.write_i32::<NativeEndian>(v as i32).unwrap();
    }

    pub fn add_bool(&mut self, v: bool) {
        self.types.push(b'B');
        self.data.write_i32::<NativeEndian>(v as i32).unwrap();
    }

    pub fn add_true(&mut self) {
        self.types.push(b'T');
    }

    pub fn add_false(&mut self) {
        self.types.push(b'F');
    }

    pub fn add_nil(&mut self) {
        self.types.push(b'N');
    }

    pub fn add_infinitum(&mut self) {
        self.types.push(b'I');
    }

    pub fn array_start(&mut self) {
        self.types.push(b'[');
    }

    pub fn array_end(&mut self) {
        self.types.push(b']');
    }

    pub fn add_vector(&mut self, v: &VecArg) {
        self.types.push(b'v');
        match *v {
            VecArg::Int32(ref elems) => {
                self.types.push(b'i');
                self.data.write_i32::<NativeEndian>(elems.len() as i32).unwrap();
                for e in elems {
                    self.data.write_i32::<NativeEndian>(*e).unwrap();
                }
            }
            VecArg::Int64(ref elems) => {
                self.types.push(b'h');
                self.data.write_i32::<NativeEndian>(elems.len() as i32).unwrap();
                for e in elems {
                    self.data.write_i64::<NativeEndian>(*e).unwrap();
                }
            }
            VecArg::Float(ref elems) => {
                self.types.push(b'f');
                self.data.write_i32::<NativeEndian>(elems.len() as i32).unwrap();
                for e in elems {
                    self.data.write_f32::<NativeEndian>(*e).unwrap();
                }
            }
            VecArg::Double(ref elems) => {
                self.types.push(b'd');
                self.data.write_i32::<NativeEndian>(elems.len() as i32).unwrap();
                for e in elems {
                    self.data.write_f64::<NativeEndian>(*e).unwrap();
                }
            }
        }
    }

    pub fn add_arg(&mut self, arg: &Arg) {
        match *arg {
            Arg::Int32(v)          => self.add_i32(v),
            Arg::Int64(v)          => self.add_i64(v),
            Arg::Float(v)          => self.add_f32(v),
            Arg::Double(v)         => self.add_f64(v),
            Arg::Time(v)           => self.add_time(v),
            Arg::Str(ref v)        => self.add_str(v),
            Arg::Symbol(ref v)     => self.add_symbol(v),
            Arg::Blob(ref v)       => self.add_blob(v),
            Arg::Midi(v)           => self.add_midi(v),
            Arg::Char(v)           => self.add_char(v),
            Arg::Bool(v)           => self.add_bool(v),
            Arg::True              => self.add_true(),
            Arg::False             => self.add_false(),
            Arg::Nil               => self.add_nil(),
            Arg::Infinitum         => self.add_infinitum(),
            Arg::Vector(ref v)     => self.add_vector(v),
            Arg::Array(ref elems)  => {
                self.array_start();
                for e in elems {
                    self.add_arg(e);
                }
                self.array_end();
            }
        }
    }

    fn push_padded_str(&mut self, v: &str) {
        self.data.extend_from_slice(v.as_bytes());
        let target = self.data.len() - v.len() + padded_len(v);
        while self.data.len() < target {
            self.data.push(0);
        }
    }

    /// Assemble the accumulated arguments into a message and clear the
    /// scratch space for the next build.
    pub fn finish(&mut self, addr: &str, time: f64, tcp: bool) -> Result<Message> {
        let first = addr.as_bytes().first().cloned();
        if first != Some(b'/') && first != Some(b'!') {
            self.reset();
            return Err(Error::BadName(addr.to_owned()));
        }

        let type_str_len = padded_len(::std::str::from_utf8(&self.types).unwrap_or("")) ;
        let mut buf = Vec::with_capacity(ADDR_OFF + padded_len(addr) +
                                         type_str_len + self.data.len());

        buf.write_u32::<NativeEndian>(if tcp { FLAG_TCP } else { 0 }).unwrap();
        buf.write_f64::<NativeEndian>(time).unwrap();
        buf.extend_from_slice(addr.as_bytes());
        buf.resize(ADDR_OFF + padded_len(addr), 0);

        let types_at = buf.len();
        buf.push(b',');
        buf.extend_from_slice(&self.types);
        let padded = types_at + (1 + self.types.len()) / 4 * 4 + 4;
        buf.resize(padded, 0);

        buf.extend_from_slice(&self.data);
        self.reset();

        Message::from_body(buf)
    }
}

impl Default for MsgWriter {
    fn default() -> MsgWriter {
        MsgWriter::new()
    }
}

/// Assemble a bundle from finished messages, all delivered at `time`.
pub fn bundle(time: f64, elements: &[Message]) -> Result<Message> {
    let mut buf = Vec::new();

    buf.write_u32::<NativeEndian>(FLAG_TCP).unwrap();
    buf.write_f64::<NativeEndian>(time).unwrap();
    buf.extend_from_slice(b"#bundle\0");
    for element in elements {
        buf.write_i32::<NativeEndian>(element.body().len() as i32).unwrap();
        buf.extend_from_slice(element.body());
    }

    Message::from_body(buf)
}

#[cfg(test)]
mod tests {
    use msg::{Arg, Message, VecArg};
    use super::*;

    #[test]
    fn finish_produces_padded_layout() {
        let mut writer = MsgWriter::new();
        writer.add_str("hello");
        writer.add_i32(7);
        let msg = writer.finish("/svc/echo", 1.5, true).unwrap();

        assert_eq!("/svc/echo", msg.address());
        assert_eq!("si", msg.types());
        assert_eq!(1.5, msg.timestamp());
        assert!(msg.is_tcp());
        assert_eq!(0, msg.len() % 4);
    }

    #[test]
    fn finish_rejects_unrooted_addresses() {
        let mut writer = MsgWriter::new();
        assert!(writer.finish("svc/echo", 0.0, true).is_err());
        // and the scratch is usable again afterwards
        writer.add_i32(1);
        assert!(writer.finish("/svc", 0.0, true).is_ok());
    }

    #[test]
    fn writer_round_trips_all_scalar_types() {
        let mut writer = MsgWriter::new();
        writer.add_i32(-5);
        writer.add_i64(1 << 40);
        writer.add_f32(2.5);
        writer.add_f64(-0.125);
        writer.add_time(100.0);
        writer.add_symbol("sym");
        writer.add_blob(&[1, 2, 3, 4, 5]);
        writer.add_char('x');
        writer.add_bool(true);
        writer.add_true();
        writer.add_false();
        writer.add_nil();
        writer.add_infinitum();
        let msg = writer.finish("/t", 0.0, false).unwrap();

        let mut ext = msg.unpack();
        assert_eq!(Arg::Int32(-5), ext.next_arg().unwrap());
        assert_eq!(Arg::Int64(1 << 40), ext.next_arg().unwrap());
        assert_eq!(Arg::Float(2.5), ext.next_arg().unwrap());
        assert_eq!(Arg::Double(-0.125), ext.next_arg().unwrap());
        assert_eq!(Arg::Time(100.0), ext.next_arg().unwrap());
        assert_eq!(Arg::Symbol("sym".to_owned()), ext.next_arg().unwrap());
        assert_eq!(Arg::Blob(vec![1, 2, 3, 4, 5]), ext.next_arg().unwrap());
        assert_eq!(Arg::Char('x'), ext.next_arg().unwrap());
        assert_eq!(Arg::Bool(true), ext.next_arg().unwrap());
        assert_eq!(Arg::True, ext.next_arg().unwrap());
        assert_eq!(Arg::False, ext.next_arg().unwrap());
        assert_eq!(Arg::Nil, ext.next_arg().unwrap());
        assert_eq!(Arg::Infinitum, ext.next_arg().unwrap());
        assert!(ext.next_arg().is_err());
    }

    #[test]
    fn writer_round_trips_vectors_and_arrays() {
        let mut writer = MsgWriter::new();
        writer.add_vector(&VecArg::Double(vec![1.0, 2.0, 3.0]));
        writer.array_start();
        writer.add_i32(1);
        writer.add_str("two");
        writer.array_end();
        let msg = writer.finish("/v", 0.0, false).unwrap();

        let mut ext = msg.unpack();
        assert_eq!(Arg::Vector(VecArg::Double(vec![1.0, 2.0, 3.0])),
                   ext.next_arg().unwrap());
        assert_eq!(Arg::Array(vec![Arg::Int32(1), Arg::Str("two".to_owned())]),
                   ext.next_arg().unwrap());
    }

    #[test]
    fn bundles_nest_and_unpack() {
        let mut writer = MsgWriter::new();
        writer.add_i32(1);
        let first = writer.finish("/a/x", 0.5, true).unwrap();
        writer.add_i32(2);
        let second = writer.finish("/b/y", 0.7, true).unwrap();

        let wrapped = bundle(0.25, &[first, second]).unwrap();
        assert!(wrapped.is_bundle());

        let elements = wrapped.bundle_elements().unwrap();
        assert_eq!(2, elements.len());
        assert_eq!("/a/x", elements[0].address());
        assert_eq!(0.7, elements[1].timestamp());
    }
}
