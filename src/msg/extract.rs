// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

// Typed argument extraction with coercion. Every cursor move is bounds
// checked so a malformed payload yields InvalidMsg instead of a panic;
// a type that cannot be coerced yields BadType and the message is dropped
// by the dispatcher.

use byteorder::{ByteOrder, NativeEndian};

use error::{Error, Result};
use super::{Arg, VecArg};

pub struct Extract<'m> {
    types: Vec<char>,
    t_at: usize,
    data: &'m [u8],
    cursor: usize,
}

/// Scalar value in transit between two numeric wire types.
enum Num {
    I(i64),
    F(f64),
}

impl Num {
    fn as_i64(&self) -> i64 {
        match *self {
            Num::I(v) => v,
            Num::F(v) => v as i64,
        }
    }

    fn as_f64(&self) -> f64 {
        match *self {
            Num::I(v) => v as f64,
            Num::F(v) => v,
        }
    }

    fn truthy(&self) -> bool {
        match *self {
            Num::I(v) => v != 0,
            Num::F(v) => v != 0.0,
        }
    }
}

fn is_numeric(code: char) -> bool {
    match code {
        'i' | 'h' | 'f' | 'd' | 't' | 'c' | 'B' | 'T' | 'F' => true,
        _ => false,
    }
}

impl<'m> Extract<'m> {
    pub fn new(types: &str, data: &'m [u8]) -> Extract<'m> {
        Extract {
            types: types.chars().collect(),
            t_at: 0,
            data: data,
            cursor: 0,
        }
    }

    pub fn finished(&self) -> bool {
        self.t_at >= self.types.len()
    }

    fn peek(&self) -> Result<char> {
        self.types.get(self.t_at).cloned().ok_or(Error::InvalidMsg)
    }

    fn take4(&mut self) -> Result<&'m [u8]> {
        if self.cursor + 4 > self.data.len() {
            return Err(Error::InvalidMsg);
        }
        let slice = &self.data[self.cursor..self.cursor + 4];
        self.cursor += 4;
        Ok(slice)
    }

    fn take8(&mut self) -> Result<&'m [u8]> {
        if self.cursor + 8 > self.data.len() {
            return Err(Error::InvalidMsg);
        }
        let slice = &self.data[self.cursor..self.cursor + 8];
        self.cursor += 8;
        Ok(slice)
    }

    fn take_str(&mut self) -> Result<String> {
        let from = self.cursor;
        let mut at = from;
        while at < self.data.len() && self.data[at] != 0 {
            at += 1;
        }
        if at >= self.data.len() {
            return Err(Error::InvalidMsg);
        }
        let end = from + (at - from) / 4 * 4 + 4;
        if end > self.data.len() {
            return Err(Error::InvalidMsg);
        }
        self.cursor = end;

        ::std::str::from_utf8(&self.data[from..at])
            .map(|s| s.to_owned())
            .map_err(|_| Error::InvalidMsg)
    }

    /// Read the next argument as its actual wire type.
    pub fn next_arg(&mut self) -> Result<Arg> {
        let code = self.peek()?;
        self.t_at += 1;
        self.read_scalar(code)
    }

    fn read_scalar(&mut self, code: char) -> Result<Arg> {
        match code {
            'i' => Ok(Arg::Int32(NativeEndian::read_i32(self.take4()?))),
            'h' => Ok(Arg::Int64(NativeEndian::read_i64(self.take8()?))),
            'f' => Ok(Arg::Float(NativeEndian::read_f32(self.take4()?))),
            'd' => Ok(Arg::Double(NativeEndian::read_f64(self.take8()?))),
            't' => Ok(Arg::Time(NativeEndian::read_f64(self.take8()?))),
            's' => Ok(Arg::Str(self.take_str()?)),
            'S' => Ok(Arg::Symbol(self.take_str()?)),
            'b' => {
                let len = NativeEndian::read_i32(self.take4()?);
                if len < 0 {
                    return Err(Error::InvalidMsg);
                }
                let len = len as usize;
                let aligned = ::global::align4(len);
                if self.cursor + aligned > self.data.len() {
                    return Err(Error::InvalidMsg);
                }
                let blob = self.data[self.cursor..self.cursor + len].to_vec();
                self.cursor += aligned;
                Ok(Arg::Blob(blob))
            }
            'm' => Ok(Arg::Midi(NativeEndian::read_u32(self.take4()?))),
            'c' => {
                let raw = NativeEndian::read_i32(self.take4()?);
                ::std::char::from_u32(raw as u32)
                    .map(Arg::Char)
                    .ok_or(Error::InvalidMsg)
            }
            'B' => Ok(Arg::Bool(NativeEndian::read_i32(self.take4()?) != 0)),
            'T' => Ok(Arg::True),
            'F' => Ok(Arg::False),
            'N' => Ok(Arg::Nil),
            'I' => Ok(Arg::Infinitum),
            'v' => {
                let elem = self.peek()?;
                self.t_at += 1;
                self.read_vector(elem)
            }
            '[' => {
                let mut elems = Vec::new();
                while self.peek()? != ']' {
                    elems.push(self.next_arg()?);
                }
                self.t_at += 1; // consume ']'
                Ok(Arg::Array(elems))
            }
            _ => Err(Error::BadType(code)),
        }
    }

    fn read_vector(&mut self, elem: char) -> Result<Arg> {
        let count = NativeEndian::read_i32(self.take4()?);
        if count < 0 {
            return Err(Error::InvalidMsg);
        }
        let count = count as usize;
        match elem {
            'i' => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(NativeEndian::read_i32(self.take4()?));
                }
                Ok(Arg::Vector(VecArg::Int32(v)))
            }
            'h' => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(NativeEndian::read_i64(self.take8()?));
                }
                Ok(Arg::Vector(VecArg::Int64(v)))
            }
            'f' => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(NativeEndian::read_f32(self.take4()?));
                }
                Ok(Arg::Vector(VecArg::Float(v)))
            }
            'd' => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(NativeEndian::read_f64(self.take8()?));
                }
                Ok(Arg::Vector(VecArg::Double(v)))
            }
            other => Err(Error::BadType(other)),
        }
    }

    /// Read the next argument, coercing it to `expected`. Numeric and
    /// boolean codes interconvert (with possible loss), string and symbol
    /// are interchangeable, everything else must match exactly.
    pub fn get(&mut self, expected: char) -> Result<Arg> {
        let actual = self.peek()?;

        if actual == expected {
            return self.next_arg();
        }
        match (expected, actual) {
            ('s', 'S') | ('S', 's') => {
                let arg = self.next_arg()?;
                match (expected, arg) {
                    ('s', Arg::Symbol(v)) => Ok(Arg::Str(v)),
                    ('S', Arg::Str(v))    => Ok(Arg::Symbol(v)),
                    _                     => Err(Error::BadType(expected)),
                }
            }
            ('v', '[') => {
                self.t_at += 1; // consume '['
                let mut elems = Vec::new();
                while self.peek()? != ']' {
                    let arg = self.next_arg()?;
                    elems.push(to_num(&arg).ok_or(Error::BadType('v'))?);
                }
                self.t_at += 1;
                Ok(Arg::Vector(VecArg::Double(
                    elems.iter().map(Num::as_f64).collect())))
            }
            ('[', 'v') => {
                match self.next_arg()? {
                    Arg::Vector(v) => Ok(Arg::Array(vec_to_args(v))),
                    _              => Err(Error::BadType('[')),
                }
            }
            (e, a) if is_numeric(e) && is_numeric(a) => {
                let num = to_num(&self.next_arg()?).ok_or(Error::BadType(e))?;
                Ok(coerce_num(e, &num))
            }
            (e, _) => Err(Error::BadType(e)),
        }
    }

    /// Read the next argument requiring the exact wire type.
    pub fn exact(&mut self, expected: char) -> Result<Arg> {
        if self.peek()? != expected {
            return Err(Error::BadType(expected));
        }
        self.next_arg()
    }

    /// Read a vector, coercing element type if needed.
    pub fn get_vector(&mut self, elem: char) -> Result<Arg> {
        let arg = self.get('v')?;
        match arg {
            Arg::Vector(v) => coerce_vector(elem, v).map(Arg::Vector),
            _              => Err(Error::BadType('v')),
        }
    }
}

fn to_num(arg: &Arg) -> Option<Num> {
    match *arg {
        Arg::Int32(v)  => Some(Num::I(v as i64)),
        Arg::Int64(v)  => Some(Num::I(v)),
        Arg::Float(v)  => Some(Num::F(v as f64)),
        Arg::Double(v) => Some(Num::F(v)),
        Arg::Time(v)   => Some(Num::F(v)),
        Arg::Char(v)   => Some(Num::I(v as i64)),
        Arg::Bool(v)   => Some(Num::I(v as i64)),
        Arg::True      => Some(Num::I(1)),
        Arg::False     => Some(Num::I(0)),
        _              => None,
    }
}

fn coerce_num(expected: char, num: &Num) -> Arg {
    match expected {
        'i' => Arg::Int32(num.as_i64() as i32),
        'h' => Arg::Int64(num.as_i64()),
        'f' => Arg::Float(num.as_f64() as f32),
        'd' => Arg::Double(num.as_f64()),
        't' => Arg::Time(num.as_f64()),
        'c' => ::std::char::from_u32(num.as_i64() as u32)
                   .map(Arg::Char)
                   .unwrap_or(Arg::Char('\0')),
        'B' => Arg::Bool(num.truthy()),
        'T' | 'F' => if num.truthy() { Arg::True } else { Arg::False },
        _ => unreachable!(),
    }
}

fn coerce_vector(elem: char, v: VecArg) -> Result<VecArg> {
    let unchanged = match (&v, elem) {
        (&VecArg::Int32(_), 'i') | (&VecArg::Int64(_), 'h') |
        (&VecArg::Float(_), 'f') | (&VecArg::Double(_), 'd') => true,
        _ => false,
    };
    if unchanged {
        return Ok(v);
    }
    let doubles: Vec<f64> = match v {
        VecArg::Int32(e)  => e.into_iter().map(|x| x as f64).collect(),
        VecArg::Int64(e)  => e.into_iter().map(|x| x as f64).collect(),
        VecArg::Float(e)  => e.into_iter().map(|x| x as f64).collect(),
        VecArg::Double(e) => e,
    };
    match elem {
        'i' => Ok(VecArg::Int32(doubles.into_iter().map(|x| x as i32).collect())),
        'h' => Ok(VecArg::Int64(doubles.into_iter().map(|x| x as i64).collect())),
        'f' => Ok(VecArg::Float(doubles.into_iter().map(|x| x as f32).collect())),
        'd' => Ok(VecArg::Double(doubles)),
        other => Err(Error::BadType(other)),
    }
}

fn vec_to_args(v: VecArg) -> Vec<Arg> {
    match v {
        VecArg::Int32(e)  => e.into_iter().map(Arg::Int32).collect(),
        VecArg::Int64(e)  => e.into_iter().map(Arg::Int64).collect(),
        VecArg::Float(e)  => e.into_iter().map(Arg::Float).collect(),
        VecArg::Double(e) => e.into_iter().map(Arg::Double).collect(),
    }
}

#[cfg(test)]
mod tests {
    use msg::{Arg, MsgWriter, VecArg};

    #[test]
    fn numeric_codes_interconvert() {
        let mut writer = MsgWriter::new();
        writer.add_i32(42);
        writer.add_f64(2.75);
        writer.add_true();
        let msg = writer.finish("/n", 0.0, false).unwrap();

        let mut ext = msg.unpack();
        assert_eq!(Arg::Double(42.0), ext.get('d').unwrap());
        assert_eq!(Arg::Int32(2), ext.get('i').unwrap());
        assert_eq!(Arg::Bool(true), ext.get('B').unwrap());
    }

    #[test]
    fn string_and_symbol_interchange() {
        let mut writer = MsgWriter::new();
        writer.add_str("abc");
        let msg = writer.finish("/s", 0.0, false).unwrap();

        assert_eq!(Arg::Symbol("abc".to_owned()), msg.unpack().get('S').unwrap());
    }

    #[test]
    fn non_numeric_mismatch_is_rejected() {
        let mut writer = MsgWriter::new();
        writer.add_str("abc");
        let msg = writer.finish("/s", 0.0, false).unwrap();

        assert!(msg.unpack().get('i').is_err());
        assert!(msg.unpack().exact('S').is_err());
    }

    #[test]
    fn arrays_and_vectors_cross_coerce() {
        let mut writer = MsgWriter::new();
        writer.array_start();
        writer.add_i32(1);
        writer.add_f32(2.0);
        writer.array_end();
        let msg = writer.finish("/x", 0.0, false).unwrap();
        assert_eq!(Arg::Vector(VecArg::Double(vec![1.0, 2.0])),
                   msg.unpack().get('v').unwrap());

        let mut writer = MsgWriter::new();
        writer.add_vector(&VecArg::Int32(vec![3, 4]));
        let msg = writer.finish("/y", 0.0, false).unwrap();
        assert_eq!(Arg::Array(vec![Arg::Int32(3), Arg::Int32(4)]),
                   msg.unpack().get('[').unwrap());
    }

    #[test]
    fn truncated_payload_is_invalid_not_fatal() {
        let mut writer = MsgWriter::new();
        writer.add_i64(7);
        let msg = writer.finish("/t", 0.0, false).unwrap();

        // rebuild the body with the payload cut short
        let mut body = msg.body().to_vec();
        let cut = body.len() - 4;
        body.truncate(cut);
        let short = ::msg::Message::from_body(body).unwrap();

        assert!(short.unpack().next_arg().is_err());
    }
}
