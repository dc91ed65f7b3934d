// Copyright (C) 2020-2023 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of xnde.
//
// xnde is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// xnde is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with xnde.  If not, see <http://www.gnu.org/licenses/>. *
//! Bit-addressable views over a shared, mutable byte buffer.
//!
//! A [`BitView`] is a triple `(buffer, abs_start_bit, length_bits)`. Views never hold a
//! reference to a parent view; they're built by slicing an existing view and always resolve
//! back to the same shared buffer. This keeps the view "tree" logical only, per the design
//! note that traded a real nested-view hierarchy for shared-buffer-plus-offset-arithmetic.

use crate::texttable::TextTable;

use parse_display::Display;

use bitvec::prelude::*;

use std::cell::RefCell;
use std::rc::Rc;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           error type                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Display)]
pub enum Cause {
    /// An error in another crate or module-- cf. source.
    #[display("An error in another crate or module-- cf. source.")]
    Other,
    /// A slice fell outside the bounds of its parent view.
    #[display("slice [{0}, {1}) {2} falls outside a view of {3} bits")]
    OutOfRange(i64, i64, String, usize),
    /// A byte-position was requested of a view that isn't byte-aligned.
    #[display("view starting at bit {0} of length {1} bits is not byte-aligned")]
    Unaligned(usize, usize),
    /// A string was too long to fit in the destination view.
    #[display("encoded string of {0} bytes does not fit in a view of {1} bytes")]
    StringTooLong(usize, usize),
    /// A `strz` terminator was never found before the view ended.
    #[display("no terminator found before end of view")]
    NoTerminator,
}

#[derive(Debug, Display)]
#[display("{cause} Source (if any): {source:?} Stack trace (if any): {trace:?}")]
pub struct Error {
    cause: Cause,
    source: Option<Box<dyn std::error::Error>>,
    trace: Option<backtrace::Backtrace>,
}

impl Error {
    pub(crate) fn new(cause: Cause) -> Error {
        Error {
            cause,
            source: None,
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.source {
            Some(bx) => Some(bx.as_ref()),
            None => None,
        }
    }
}

impl std::convert::From<crate::texttable::Error> for Error {
    fn from(err: crate::texttable::Error) -> Self {
        Error {
            cause: Cause::Other,
            source: Some(Box::new(err)),
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Unit                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A unit of measure for slicing & sizing views, expressed as a bit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Unit {
    #[display("bits")]
    Bits,
    #[display("bytes")]
    Bytes,
    #[display("kb")]
    Kb,
    #[display("mb")]
    Mb,
    #[display("gb")]
    Gb,
}

impl Unit {
    /// Number of bits in one instance of this unit.
    pub fn bits(self) -> i64 {
        match self {
            Unit::Bits => 1,
            Unit::Bytes => 8,
            Unit::Kb => 8 * 1024,
            Unit::Mb => 8 * 1024 * 1024,
            Unit::Gb => 8 * 1024 * 1024 * 1024,
        }
    }
}

type Buffer = Rc<RefCell<BitVec<u8, Msb0>>>;

/// A typed, bit-addressable slice over a shared byte buffer.
///
/// Cloning a `BitView` is cheap and shares the same underlying buffer; it is the idiom used
/// throughout this crate in place of a true parent-child view tree.
#[derive(Clone)]
pub struct BitView {
    buffer: Buffer,
    abs_start: usize,
    length: usize,
    name: Option<String>,
}

impl BitView {
    /// Wrap a freshly-allocated byte buffer as a single root view over all of it.
    pub fn from_bytes(bytes: Vec<u8>) -> BitView {
        let len = bytes.len() * 8;
        let bv: BitVec<u8, Msb0> = BitVec::from_vec(bytes);
        BitView {
            buffer: Rc::new(RefCell::new(bv)),
            abs_start: 0,
            length: len,
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> BitView {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Length of this view, in bits.
    pub fn len_bits(&self) -> usize {
        self.length
    }

    /// Length of this view, in bytes. Fails if the view isn't byte-aligned in length.
    pub fn len_bytes(&self) -> Result<usize> {
        if self.length % 8 != 0 {
            return Err(Error::new(Cause::Unaligned(self.abs_start, self.length)));
        }
        Ok(self.length / 8)
    }

    /// Absolute byte position of the start of this view within the underlying buffer. Fails if
    /// the view does not start on a byte boundary.
    pub fn bytepos(&self) -> Result<usize> {
        if self.abs_start % 8 != 0 {
            return Err(Error::new(Cause::Unaligned(self.abs_start, self.length)));
        }
        Ok(self.abs_start / 8)
    }

    fn resolve_bound(&self, val: i64, unit: Unit) -> i64 {
        val * unit.bits()
    }

    /// Slice this view. `start`/`stop` are optional; negative values index from the end of this
    /// view (in `unit`s). Slicing outside this view's bounds fails with [`Cause::OutOfRange`].
    pub fn slice(&self, start: Option<i64>, stop: Option<i64>, unit: Unit) -> Result<BitView> {
        let len = self.length as i64;
        let raw_start = start.map(|s| self.resolve_bound(s, unit)).unwrap_or(0);
        let raw_stop = stop.map(|s| self.resolve_bound(s, unit)).unwrap_or(len);

        let norm = |v: i64| -> i64 {
            if v < 0 {
                v + len
            } else {
                v
            }
        };
        let (s, e) = (norm(raw_start), norm(raw_stop));

        if s < 0 || e > len || s > e {
            return Err(Error::new(Cause::OutOfRange(
                raw_start,
                raw_stop,
                unit.to_string(),
                self.length,
            )));
        }

        Ok(BitView {
            buffer: Rc::clone(&self.buffer),
            abs_start: self.abs_start + s as usize,
            length: (e - s) as usize,
            name: None,
        })
    }

    fn bits(&self) -> std::cell::Ref<'_, BitVec<u8, Msb0>> {
        self.buffer.borrow()
    }

    fn bits_mut(&self) -> std::cell::RefMut<'_, BitVec<u8, Msb0>> {
        self.buffer.borrow_mut()
    }

    /// Read the raw bits of this view, MSB-first.
    pub fn read_bits(&self) -> BitVec<u8, Msb0> {
        let buf = self.bits();
        buf[self.abs_start..self.abs_start + self.length].to_bitvec()
    }

    /// Write raw bits into this view. The number of bits written is `min(bits.len(), self.length)`.
    pub fn write_bits(&self, bits: &BitSlice<u8, Msb0>) {
        let mut buf = self.bits_mut();
        let n = bits.len().min(self.length);
        buf[self.abs_start..self.abs_start + n].copy_from_bitslice(&bits[..n]);
    }

    /// Read this view's bits rendered as a string of `0`/`1` characters.
    pub fn read_bin(&self) -> String {
        self.read_bits().iter().map(|b| if *b { '1' } else { '0' }).collect()
    }

    pub fn write_bin(&self, s: &str) {
        let bv: BitVec<u8, Msb0> = s.chars().map(|c| c == '1').collect();
        self.write_bits(&bv);
    }

    /// Read the contained bytes. Fails if this view is not byte-aligned.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let n = self.len_bytes()?;
        let start = self.bytepos()?;
        let buf = self.bits();
        let slice = &buf.as_raw_slice()[start..start + n];
        Ok(slice.to_vec())
    }

    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let n = self.len_bytes()?;
        let start = self.bytepos()?;
        let to_write = bytes.len().min(n);
        let mut buf = self.bits_mut();
        let raw = buf.as_raw_mut_slice();
        raw[start..start + to_write].copy_from_slice(&bytes[..to_write]);
        Ok(())
    }

    pub fn read_hex(&self) -> Result<String> {
        Ok(self.read_bytes()?.iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn write_hex(&self, hex: &str) -> Result<()> {
        let bytes: std::result::Result<Vec<u8>, _> = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
            .collect();
        let bytes = bytes.map_err(|_| Error::new(Cause::Other))?;
        self.write_bytes(&bytes)
    }

    /// Unsigned integer, MSB-first over this view's bit range, regardless of byte alignment.
    pub fn read_uint(&self) -> u64 {
        let bits = self.read_bits();
        let mut v: u64 = 0;
        for b in bits.iter() {
            v = (v << 1) | (*b as u64);
        }
        v
    }

    pub fn write_uint(&self, mut value: u64) {
        let n = self.length;
        let mut bv: BitVec<u8, Msb0> = BitVec::with_capacity(n);
        let mut tmp = vec![false; n];
        for i in (0..n).rev() {
            tmp[i] = value & 1 == 1;
            value >>= 1;
        }
        bv.extend(tmp);
        self.write_bits(&bv);
    }

    /// Little-endian unsigned integer. Requires byte alignment.
    pub fn read_uintle(&self) -> Result<u64> {
        let bytes = self.read_bytes()?;
        let mut v: u64 = 0;
        for (i, b) in bytes.iter().enumerate() {
            v |= (*b as u64) << (8 * i);
        }
        Ok(v)
    }

    pub fn write_uintle(&self, value: u64) -> Result<()> {
        let n = self.len_bytes()?;
        let mut bytes = vec![0u8; n];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = ((value >> (8 * i)) & 0xff) as u8;
        }
        self.write_bytes(&bytes)
    }

    /// Big-endian unsigned integer. Requires byte alignment.
    pub fn read_uintbe(&self) -> Result<u64> {
        let bytes = self.read_bytes()?;
        let mut v: u64 = 0;
        for b in bytes.iter() {
            v = (v << 8) | (*b as u64);
        }
        Ok(v)
    }

    pub fn write_uintbe(&self, value: u64) -> Result<()> {
        let n = self.len_bytes()?;
        let mut bytes = vec![0u8; n];
        for i in 0..n {
            bytes[n - 1 - i] = ((value >> (8 * i)) & 0xff) as u8;
        }
        self.write_bytes(&bytes)
    }

    /// Signed, two's-complement integer, MSB-first over this view's bit range.
    pub fn read_int(&self) -> i64 {
        let n = self.length;
        let u = self.read_uint();
        if n == 0 || n >= 64 {
            return u as i64;
        }
        let sign_bit = 1u64 << (n - 1);
        if u & sign_bit != 0 {
            (u as i64) - (1i64 << n)
        } else {
            u as i64
        }
    }

    pub fn write_int(&self, value: i64) {
        let n = self.length as u32;
        let mask = if n >= 64 { u64::MAX } else { (1u64 << n) - 1 };
        self.write_uint((value as u64) & mask);
    }

    /// Little-endian binary-coded decimal: `sum(10^n * nybble(n))`, nybbles taken low to high.
    pub fn read_nbcdle(&self) -> Result<u64> {
        let bytes = self.read_bytes()?;
        let mut v: u64 = 0;
        let mut place: u64 = 1;
        for byte in bytes.iter() {
            let lo = (byte & 0x0f) as u64;
            let hi = (byte >> 4) as u64;
            v += lo * place;
            place *= 10;
            v += hi * place;
            place *= 10;
        }
        Ok(v)
    }

    pub fn write_nbcdle(&self, mut value: u64) -> Result<()> {
        let n = self.len_bytes()?;
        let mut bytes = vec![0u8; n];
        for byte in bytes.iter_mut() {
            let lo = (value % 10) as u8;
            value /= 10;
            let hi = (value % 10) as u8;
            value /= 10;
            *byte = lo | (hi << 4);
        }
        self.write_bytes(&bytes)
    }

    /// Decode this view's bytes as text through `codec`. Fails if the view isn't byte-aligned.
    pub fn read_str(&self, codec: &TextTable) -> Result<String> {
        let bytes = self.read_bytes()?;
        let (s, _consumed) = codec.decode(&bytes)?;
        Ok(s)
    }

    /// Decode a NUL/EOS-terminated string: reads until (and including) the first terminator
    /// byte sequence defined by `codec`. Returns the decoded string and the number of bytes
    /// consumed, since the logical length isn't known ahead of time.
    pub fn read_strz(&self, codec: &TextTable) -> Result<(String, usize)> {
        let bytes = self.read_bytes()?;
        codec.decode_z(&bytes).map_err(Error::from)
    }

    /// Encode `s` through `codec` and write it into this view. An over-length encoding fails;
    /// a short one is padded with the codec's single-space byte.
    pub fn write_str(&self, s: &str, codec: &TextTable) -> Result<()> {
        let n = self.len_bytes()?;
        let mut bytes = codec.encode(s)?;
        if bytes.len() > n {
            return Err(Error::new(Cause::StringTooLong(bytes.len(), n)));
        }
        bytes.resize(n, codec.pad_byte());
        self.write_bytes(&bytes)
    }

    /// Encode `s` through `codec`, appending the terminator if `encode` didn't already add one,
    /// and write it into this view. Fails if the encoded form (with terminator) doesn't fit.
    pub fn write_strz(&self, s: &str, codec: &TextTable) -> Result<()> {
        let n = self.len_bytes()?;
        let mut bytes = codec.encode(s)?;
        if !codec.ends_with_eos(&bytes) {
            bytes.extend(codec.eos_bytes());
        }
        if bytes.len() > n {
            return Err(Error::new(Cause::StringTooLong(bytes.len(), n)));
        }
        self.write_bytes(&bytes)
    }

    pub fn sha1(&self) -> Result<String> {
        use sha1::{Digest, Sha1};
        let bytes = self.read_bytes()?;
        let mut hasher = Sha1::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn md5(&self) -> Result<String> {
        use md5::{Digest, Md5};
        let bytes = self.read_bytes()?;
        let mut hasher = Md5::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn crc32(&self) -> Result<u32> {
        let bytes = self.read_bytes()?;
        Ok(crc32fast::hash(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texttable::TextTable;

    #[test]
    fn slice_and_uint_roundtrip() {
        let v = BitView::from_bytes(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        let sub = v.slice(Some(1), Some(3), Unit::Bytes).unwrap();
        assert_eq!(sub.read_uintbe().unwrap(), 0xADBE);
    }

    #[test]
    fn negative_slice_from_end() {
        let v = BitView::from_bytes(vec![1, 2, 3, 4]);
        let sub = v.slice(Some(-2), None, Unit::Bytes).unwrap();
        assert_eq!(sub.read_bytes().unwrap(), vec![3, 4]);
    }

    #[test]
    fn out_of_range_fails() {
        let v = BitView::from_bytes(vec![1, 2]);
        assert!(v.slice(Some(0), Some(10), Unit::Bytes).is_err());
    }

    #[test]
    fn write_is_bit_identical_noop_when_same_value() {
        let v = BitView::from_bytes(vec![0x42]);
        let before = v.read_bytes().unwrap();
        v.write_uintbe(0x42).unwrap();
        assert_eq!(before, v.read_bytes().unwrap());
    }

    #[test]
    fn unaligned_bytepos_fails() {
        let v = BitView::from_bytes(vec![0xff]);
        let sub = v.slice(Some(1), Some(5), Unit::Bits).unwrap();
        assert!(sub.bytepos().is_err());
    }

    #[test]
    fn nbcd_roundtrip() {
        let v = BitView::from_bytes(vec![0x00, 0x00]);
        v.write_nbcdle(1234).unwrap();
        assert_eq!(v.read_nbcdle().unwrap(), 1234);
    }

    #[test]
    fn strz_roundtrip() {
        let tbl = TextTable::parse(
            "24=E\n4C=s\n4E=u\n47=n\n3A=a\n/F7=[EOS]\n",
            "std",
        )
        .unwrap();
        let v = BitView::from_bytes(vec![0; 8]);
        v.write_strz("Esuna", &tbl).unwrap();
        let (s, consumed) = v.read_strz(&tbl).unwrap();
        assert_eq!(s, "Esuna[EOS]");
        assert_eq!(consumed, 6);
    }
}
