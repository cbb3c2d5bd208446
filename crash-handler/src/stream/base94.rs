// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! A reversible binary-to-text encoding using the 94 printable ASCII characters `'!'..='~'`.
//!
//! Input bits are consumed little-end first, 13 or 14 at a time, and each group is written as
//! two symbols (low digit first). Since 94 * 94 = 8836, a 14-bit group fits whenever its low
//! 13 bits are at most 643; otherwise only 13 bits are taken. The decoder applies the same
//! test to each symbol pair to know how many bits it carries.

use std::io::{self, Write};

const FIRST_SYMBOL: u8 = b'!';
const BASE: u32 = 94;
const LOW_13_BITS: u32 = 0x1fff;
const LOW_14_BITS: u32 = 0x3fff;
const MAX_LOW_BITS_FOR_14: u32 = 643;

fn symbol(digit: u32) -> u8 {
    FIRST_SYMBOL + digit as u8
}

/// Encodes everything written to it and writes the symbols to `inner`.
///
/// [`finish`][Base94Encoder::finish] must be called to write out the final bits.
#[derive(Debug)]
pub struct Base94Encoder<W: Write> {
    inner: W,
    bit_buf: u32,
    bit_count: u32,
    out: Vec<u8>,
}

impl<W: Write> Base94Encoder<W> {
    pub fn new(inner: W) -> Base94Encoder<W> {
        Base94Encoder {
            inner,
            bit_buf: 0,
            bit_count: 0,
            out: Vec::new(),
        }
    }

    /// Write out any buffered bits and return the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        if self.bit_count > 0 {
            self.out.push(symbol(self.bit_buf % BASE));
            if self.bit_count > 7 || self.bit_buf >= BASE {
                self.out.push(symbol(self.bit_buf / BASE));
            }
        }
        self.inner.write_all(&self.out)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for Base94Encoder<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.out.clear();
        for &byte in data {
            self.bit_buf |= u32::from(byte) << self.bit_count;
            self.bit_count += 8;
            if self.bit_count < 14 {
                continue;
            }
            let mut value = self.bit_buf & LOW_13_BITS;
            if value > MAX_LOW_BITS_FOR_14 {
                self.bit_buf >>= 13;
                self.bit_count -= 13;
            } else {
                value = self.bit_buf & LOW_14_BITS;
                self.bit_buf >>= 14;
                self.bit_count -= 14;
            }
            self.out.push(symbol(value % BASE));
            self.out.push(symbol(value / BASE));
        }
        self.inner.write_all(&self.out)?;
        self.out.clear();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decodes symbols written to it and writes the recovered bytes to `inner`.
///
/// ASCII whitespace is skipped. Any other byte outside the alphabet is an
/// [`InvalidData`][io::ErrorKind::InvalidData] error.
#[derive(Debug)]
pub struct Base94Decoder<W: Write> {
    inner: W,
    pending: Option<u32>,
    bit_buf: u32,
    bit_count: u32,
    out: Vec<u8>,
}

impl<W: Write> Base94Decoder<W> {
    pub fn new(inner: W) -> Base94Decoder<W> {
        Base94Decoder {
            inner,
            pending: None,
            bit_buf: 0,
            bit_count: 0,
            out: Vec::new(),
        }
    }

    /// Write out the final partial byte, if any, and return the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        if let Some(low) = self.pending {
            let byte = (self.bit_buf | (low << self.bit_count)) as u8;
            self.inner.write_all(&[byte])?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for Base94Decoder<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.out.clear();
        for &c in data {
            if c.is_ascii_whitespace() {
                continue;
            }
            if !(FIRST_SYMBOL..FIRST_SYMBOL + BASE as u8).contains(&c) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid base94 symbol {:#04x}", c),
                ));
            }
            let digit = u32::from(c - FIRST_SYMBOL);
            let Some(low) = self.pending.take() else {
                self.pending = Some(digit);
                continue;
            };
            let value = low + digit * BASE;
            self.bit_buf |= value << self.bit_count;
            self.bit_count += if value & LOW_13_BITS > MAX_LOW_BITS_FOR_14 {
                13
            } else {
                14
            };
            while self.bit_count >= 8 {
                self.out.push(self.bit_buf as u8);
                self.bit_buf >>= 8;
                self.bit_count -= 8;
            }
        }
        self.inner.write_all(&self.out)?;
        self.out.clear();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
