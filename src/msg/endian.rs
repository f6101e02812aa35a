// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

// Byte-order conversion between the wire image (network order) and the
// in-memory image (host order). The walk follows the type string, swaps
// scalars in place, skips strings, honors blob and vector lengths, and
// recurses into bundle elements. Any out-of-bounds step is InvalidMsg so
// a malformed frame closes its socket instead of corrupting memory.

use byteorder::{BigEndian, ByteOrder, NativeEndian};

use error::{Error, Result};
use global::align4;
use super::{Message, ADDR_OFF};

pub fn to_host(buf: &mut [u8], types_off: usize, args_off: usize) -> Result<()> {
    convert(buf, types_off, args_off, false)
}

pub fn to_network(buf: &mut [u8], types_off: usize, args_off: usize) -> Result<()> {
    convert(buf, types_off, args_off, true)
}

fn swap32(buf: &mut [u8], at: usize, to_net: bool) -> Result<()> {
    if at + 4 > buf.len() {
        return Err(Error::InvalidMsg);
    }
    let slice = &mut buf[at..at + 4];
    if to_net {
        let v = NativeEndian::read_u32(slice);
        BigEndian::write_u32(slice, v);
    } else {
        let v = BigEndian::read_u32(slice);
        NativeEndian::write_u32(slice, v);
    }
    Ok(())
}

fn swap64(buf: &mut [u8], at: usize, to_net: bool) -> Result<()> {
    if at + 8 > buf.len() {
        return Err(Error::InvalidMsg);
    }
    let slice = &mut buf[at..at + 8];
    if to_net {
        let v = NativeEndian::read_u64(slice);
        BigEndian::write_u64(slice, v);
    } else {
        let v = BigEndian::read_u64(slice);
        NativeEndian::write_u64(slice, v);
    }
    Ok(())
}

/// Read a length word in whatever order the source side currently uses.
fn read_i32_src(buf: &[u8], at: usize, to_net: bool) -> Result<i32> {
    if at + 4 > buf.len() {
        return Err(Error::InvalidMsg);
    }
    let slice = &buf[at..at + 4];
    let v = if to_net {
        NativeEndian::read_i32(slice)
    } else {
        BigEndian::read_i32(slice)
    };
    if v < 0 {
        return Err(Error::InvalidMsg);
    }
    Ok(v)
}

fn skip_str(buf: &[u8], from: usize) -> Result<usize> {
    let mut at = from;
    while at < buf.len() && buf[at] != 0 {
        at += 1;
    }
    if at >= buf.len() {
        return Err(Error::InvalidMsg);
    }
    let end = from + (at - from) / 4 * 4 + 4;
    if end > buf.len() {
        return Err(Error::InvalidMsg);
    }
    Ok(end)
}

fn convert(buf: &mut [u8], types_off: usize, args_off: usize, to_net: bool) -> Result<()> {
    swap32(buf, 0, to_net)?; // flags
    swap64(buf, 4, to_net)?; // timestamp

    if buf[ADDR_OFF] == b'#' {
        // bundle: (length, body) pairs
        let mut at = args_off;
        while at < buf.len() {
            let len = read_i32_src(buf, at, to_net)? as usize;
            swap32(buf, at, to_net)?;
            at += 4;
            if len < ADDR_OFF + 4 || at + len > buf.len() {
                return Err(Error::InvalidMsg);
            }
            let sub = &mut buf[at..at + len];
            let (sub_types, sub_args) = Message::layout(sub)?;
            convert(sub, sub_types, sub_args, to_net)?;
            at += len;
        }
        return Ok(());
    }

    let mut types = Vec::new();
    let mut t = types_off + 1; // skip ','
    while t < buf.len() && buf[t] != 0 {
        types.push(buf[t]);
        t += 1;
    }

    let mut at = args_off;
    let mut i = 0;
    while i < types.len() {
        let code = types[i] as char;
        i += 1;
        match code {
            'i' | 'f' | 'c' | 'B' | 'm' => {
                swap32(buf, at, to_net)?;
                at += 4;
            }
            'h' | 'd' | 't' => {
                swap64(buf, at, to_net)?;
                at += 8;
            }
            's' | 'S' => {
                at = skip_str(buf, at)?;
            }
            'b' => {
                let len = read_i32_src(buf, at, to_net)? as usize;
                swap32(buf, at, to_net)?;
                at += 4;
                if at + align4(len) > buf.len() {
                    return Err(Error::InvalidMsg);
                }
                at += align4(len);
            }
            'v' => {
                if i >= types.len() {
                    return Err(Error::InvalidMsg);
                }
                let elem = types[i] as char;
                i += 1;
                let count = read_i32_src(buf, at, to_net)? as usize;
                swap32(buf, at, to_net)?;
                at += 4;
                let width = match elem {
                    'i' | 'f' => 4,
                    'h' | 'd' => 8,
                    _ => return Err(Error::InvalidMsg),
                };
                for _ in 0..count {
                    if width == 4 {
                        swap32(buf, at, to_net)?;
                    } else {
                        swap64(buf, at, to_net)?;
                    }
                    at += width;
                }
            }
            '[' | ']' | 'T' | 'F' | 'N' | 'I' => {}
            _ => return Err(Error::InvalidMsg),
        }
    }
    Ok(())
}
