// Copyright 2020 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte buffer with a read cursor, plus rsync's integer and string encodings:
//! fixed-width little-endian, variable-length 32- and 64-bit, length-prefixed
//! strings, text lines, and multiplex frames.
//!
//! Unpacking is restartable: every `unpack_*` method either consumes a whole
//! value or returns `None` with the cursor unmoved, so the caller can append
//! more bytes and retry.

use anyhow::{bail, Result};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// The multiplex channel space starts above this tag.
const MPLEX_BASE: u32 = 7;

/// A growable byte string with a read cursor.
///
/// Writes always append at the end; reads consume from the cursor forward.
/// `discard` drops everything already read so the buffer doesn't grow without
/// bound on long sessions.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    pos: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::default()
    }

    /// Append bytes at the end. Never moves the read cursor.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Drop the bytes before the read cursor and reset the cursor to 0.
    pub fn discard(&mut self) {
        self.data.drain(..self.pos);
        self.pos = 0;
    }

    /// Reset to completely empty.
    pub fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn set_pos(&mut self, pos: usize) {
        assert!(pos <= self.data.len());
        self.pos = pos;
    }

    /// Bytes left between the cursor and the end.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// The whole contents, read or not.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Remove and return the whole contents, leaving the buffer empty.
    ///
    /// This is how a caller drains the session's write buffer onto its own
    /// transport.
    pub fn take(&mut self) -> Vec<u8> {
        self.pos = 0;
        std::mem::take(&mut self.data)
    }

    pub fn pack_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn pack_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn pack_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn pack_s32(&mut self, v: i32) {
        trace!("pack {:#x}i32", v);
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Pack a 64-bit value the way rsync's `longint` does: values that fit in
    /// a non-negative 32-bit word are sent as 4 bytes; anything else is the
    /// `0xffffffff` escape followed by the full 8 bytes.
    pub fn pack_s64(&mut self, v: i64) {
        if v >= 0 && v < i64::from(i32::MAX) {
            self.pack_s32(v as i32);
        } else {
            self.data.extend_from_slice(&(-1i32).to_le_bytes());
            self.data.extend_from_slice(&v.to_le_bytes());
        }
    }

    /// Pack a variable-length 32-bit value in 1 to 5 bytes.
    ///
    /// The count of leading one bits in the first byte says how many more
    /// bytes follow; the remaining low bits of the first byte hold the top
    /// bits of the value.
    pub fn pack_v32(&mut self, v: i32) {
        let mut b = [0u8; 5];
        b[1..5].copy_from_slice(&v.to_le_bytes());
        let mut cnt = 4;
        while cnt > 1 && b[cnt] == 0 {
            cnt -= 1;
        }
        let bit = 1u16 << (8 - cnt);
        if u16::from(b[cnt]) >= bit {
            cnt += 1;
            b[0] = !((bit - 1) as u8);
        } else if cnt > 1 {
            b[0] = b[cnt] | !((bit * 2 - 1) as u8);
        } else {
            b[0] = b[cnt];
        }
        self.data.extend_from_slice(&b[..cnt]);
    }

    /// Pack a variable-length 64-bit value in at least `min_bytes` and at
    /// most `min_bytes + 6` bytes.
    ///
    /// Small values are padded out to `min_bytes`; large ones extend the
    /// width through the same leading-ones header as [`pack_v32`]. A value
    /// too wide for the header to express at this minimum width is an error,
    /// which is why `min_bytes` below 3 cannot carry the full 64-bit range.
    ///
    /// [`pack_v32`]: #method.pack_v32
    pub fn pack_v64(&mut self, v: i64, min_bytes: usize) -> Result<()> {
        if min_bytes < 1 || min_bytes > 8 {
            bail!("varlong minimum width {} out of range", min_bytes);
        }
        let mut b = [0u8; 9];
        b[1..9].copy_from_slice(&v.to_le_bytes());
        let mut cnt = 8;
        while cnt > min_bytes && b[cnt] == 0 {
            cnt -= 1;
        }
        let bit = 1u16 << (7 + min_bytes - cnt);
        if u16::from(b[cnt]) >= bit {
            cnt += 1;
            b[0] = !((bit - 1) as u8);
        } else if cnt > min_bytes {
            b[0] = b[cnt] | !((bit * 2 - 1) as u8);
        } else {
            b[0] = b[cnt];
        }
        if cnt > min_bytes + 6 {
            bail!(
                "{:#x} is too wide for a varlong of minimum width {}",
                v,
                min_bytes
            );
        }
        self.data.extend_from_slice(&b[..cnt]);
        Ok(())
    }

    /// Pack a length-prefixed byte string: one length byte below 128,
    /// otherwise a 16-bit big-endian length with the top bit set. Strings of
    /// 0x8000 bytes or more don't fit the header and are an error.
    pub fn pack_vstring(&mut self, s: &[u8]) -> Result<()> {
        if s.len() < 0x80 {
            self.data.push(s.len() as u8);
        } else if s.len() < 0x8000 {
            self.data.push(0x80 | (s.len() >> 8) as u8);
            self.data.push(s.len() as u8);
        } else {
            bail!("{} bytes is too long for a vstring", s.len());
        }
        self.data.extend_from_slice(s);
        Ok(())
    }

    /// Pack a text line, adding the trailing newline if `s` lacks one.
    pub fn pack_line(&mut self, s: &str) {
        self.data.extend_from_slice(s.as_bytes());
        if !s.ends_with('\n') {
            self.data.push(b'\n');
        }
    }

    /// Pack one multiplex frame: a little-endian header of
    /// `((7 + code) << 24) | payload_length` followed by the payload.
    pub fn pack_msg(&mut self, code: u8, payload: &[u8]) -> Result<()> {
        if payload.len() >= 1 << 24 {
            bail!(
                "{:#x} bytes is too much for one multiplex frame",
                payload.len()
            );
        }
        if u32::from(code) + MPLEX_BASE > 0xff {
            bail!("multiplex code {} out of range", code);
        }
        let header = ((MPLEX_BASE + u32::from(code)) << 24) | payload.len() as u32;
        self.data.extend_from_slice(&header.to_le_bytes());
        self.data.extend_from_slice(payload);
        trace!("pack msg code {} {}", code, hex::encode(payload));
        Ok(())
    }

    pub fn unpack_u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    pub fn unpack_u16(&mut self) -> Option<u16> {
        if self.remaining() < 2 {
            return None;
        }
        let v = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Some(v)
    }

    pub fn unpack_s32(&mut self) -> Option<i32> {
        if self.remaining() < 4 {
            return None;
        }
        let mut le = [0u8; 4];
        le.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Some(i32::from_le_bytes(le))
    }

    pub fn unpack_s64(&mut self) -> Option<i64> {
        let start = self.pos;
        let v = self.unpack_s32()?;
        if v != -1 {
            return Some(i64::from(v));
        }
        if self.remaining() < 8 {
            self.pos = start;
            return None;
        }
        let mut le = [0u8; 8];
        le.copy_from_slice(&self.data[self.pos..self.pos + 8]);
        self.pos += 8;
        Some(i64::from_le_bytes(le))
    }

    /// Unpack a known-length byte string.
    pub fn unpack_bytes(&mut self, len: usize) -> Option<Vec<u8>> {
        if self.remaining() < len {
            return None;
        }
        let v = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Some(v)
    }

    /// Unpack a variable-length 32-bit value.
    ///
    /// In the 5-byte form the low 4 bits of the header byte fall beyond the
    /// 32-bit result and are ignored, matching the encoding's other
    /// implementations.
    pub fn unpack_v32(&mut self) -> Result<Option<i32>> {
        let start = self.pos;
        let head = match self.unpack_u8() {
            Some(b) => b,
            None => return Ok(None),
        };
        let extra = head.leading_ones() as usize;
        if extra > 4 {
            self.pos = start;
            bail!("impossible varint header {:#04x}", head);
        }
        if self.remaining() < extra {
            self.pos = start;
            return Ok(None);
        }
        let mut b = [0u8; 5];
        b[..extra].copy_from_slice(&self.data[self.pos..self.pos + extra]);
        self.pos += extra;
        b[extra] = if extra == 0 {
            head
        } else {
            head & (((1u32 << (8 - extra)) - 1) as u8)
        };
        Ok(Some(i32::from_le_bytes([b[0], b[1], b[2], b[3]])))
    }

    /// Unpack a variable-length 64-bit value with the given minimum width.
    pub fn unpack_v64(&mut self, min_bytes: usize) -> Result<Option<i64>> {
        assert!(min_bytes >= 1 && min_bytes <= 8);
        if self.remaining() < min_bytes {
            return Ok(None);
        }
        let head = self.data[self.pos];
        let extra = head.leading_ones() as usize;
        if extra + min_bytes > 9 {
            bail!("impossible varlong header {:#04x}", head);
        }
        if self.remaining() < min_bytes + extra {
            return Ok(None);
        }
        let mut b = [0u8; 9];
        b[..min_bytes - 1].copy_from_slice(&self.data[self.pos + 1..self.pos + min_bytes]);
        b[min_bytes - 1..min_bytes - 1 + extra]
            .copy_from_slice(&self.data[self.pos + min_bytes..self.pos + min_bytes + extra]);
        b[min_bytes + extra - 1] = head & (((1u32 << (8 - extra)) - 1) as u8);
        self.pos += min_bytes + extra;
        let mut le = [0u8; 8];
        le.copy_from_slice(&b[..8]);
        Ok(Some(i64::from_le_bytes(le)))
    }

    pub fn unpack_vstring(&mut self) -> Option<Vec<u8>> {
        let start = self.pos;
        let b0 = self.unpack_u8()?;
        let len = if b0 & 0x80 == 0 {
            usize::from(b0)
        } else {
            match self.unpack_u8() {
                Some(b1) => usize::from(b0 & 0x7f) << 8 | usize::from(b1),
                None => {
                    self.pos = start;
                    return None;
                }
            }
        };
        match self.unpack_bytes(len) {
            Some(v) => Some(v),
            None => {
                self.pos = start;
                None
            }
        }
    }

    /// Unpack one newline-terminated line, without the newline.
    ///
    /// Bytes that aren't UTF-8 are replaced, as line-framed traffic is
    /// expected to be ASCII.
    pub fn unpack_line(&mut self) -> Option<String> {
        let nl = self.data[self.pos..].iter().position(|&b| b == b'\n')?;
        let line = String::from_utf8_lossy(&self.data[self.pos..self.pos + nl]).into_owned();
        self.pos += nl + 1;
        Some(line)
    }

    /// Unpack one multiplex frame, returning its channel code and payload.
    pub fn unpack_msg(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        let start = self.pos;
        let header = match self.unpack_s32() {
            Some(h) => h as u32,
            None => return Ok(None),
        };
        let tag = header >> 24;
        if tag < MPLEX_BASE {
            self.pos = start;
            bail!("multiplex tag {:#x} below the message base", tag);
        }
        let len = (header & 0x00ff_ffff) as usize;
        match self.unpack_bytes(len) {
            Some(payload) => Ok(Some(((tag - MPLEX_BASE) as u8, payload))),
            None => {
                self.pos = start;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn packed<F: FnOnce(&mut Buffer)>(f: F) -> Vec<u8> {
        let mut b = Buffer::new();
        f(&mut b);
        b.take()
    }

    #[test]
    fn fixed_width_round_trips() {
        let mut b = Buffer::new();
        for &v in &[0u8, 1, 0x7f, 0x80, 0xff] {
            b.pack_u8(v);
            assert_eq!(b.unpack_u8(), Some(v));
        }
        for &v in &[0u16, 1, 0x7fff, 0x8000, 0xffff] {
            b.pack_u16(v);
            assert_eq!(b.unpack_u16(), Some(v));
        }
        for &v in &[0i32, 1, -1, i32::MIN, i32::MAX, 0x123456] {
            b.pack_s32(v);
            assert_eq!(b.unpack_s32(), Some(v));
        }
        for &v in &[0i64, 1, -1, i64::MIN, i64::MAX, 1 << 40] {
            b.pack_s64(v);
            assert_eq!(b.unpack_s64(), Some(v));
        }
    }

    #[test]
    fn s64_uses_four_bytes_when_small() {
        assert_eq!(packed(|b| b.pack_s64(0x10)), &[0x10, 0, 0, 0]);
        assert_eq!(
            packed(|b| b.pack_s64(0x7766554433221100)),
            &[0xff, 0xff, 0xff, 0xff, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77],
        );
        // The boundary value no longer fits the short form.
        assert_eq!(packed(|b| b.pack_s64(i64::from(i32::MAX))).len(), 12);
    }

    #[test]
    fn v32_round_trips() {
        let mut b = Buffer::new();
        for &v in &[
            0,
            1,
            0x7f,
            0x80,
            0xff,
            0x100,
            0x3fff,
            0x4000,
            0x123456,
            i32::MAX,
            -1,
            -12345,
            i32::MIN,
        ] {
            b.pack_v32(v);
            assert_eq!(b.unpack_v32().unwrap(), Some(v), "value {:#x}", v);
        }
        assert_eq!(b.remaining(), 0);
    }

    #[test]
    fn v32_small_values_fit_one_byte() {
        assert_eq!(packed(|b| b.pack_v32(0)), &[0]);
        assert_eq!(packed(|b| b.pack_v32(0x7f)), &[0x7f]);
        assert_eq!(packed(|b| b.pack_v32(0x80)).len(), 2);
    }

    #[test]
    fn v32_five_byte_header_low_bits_are_ignored() {
        // 0xf0 and 0xf7 differ only in the 4 low header bits, which fall
        // beyond the 32-bit result.
        let mut a = Buffer::new();
        a.append(&[0xf0, 0x01, 0, 0, 0]);
        let mut b = Buffer::new();
        b.append(&[0xf7, 0x01, 0, 0, 0]);
        assert_eq!(a.unpack_v32().unwrap(), Some(1));
        assert_eq!(b.unpack_v32().unwrap(), Some(1));
    }

    #[test]
    fn v32_rejects_impossible_header() {
        let mut b = Buffer::new();
        b.append(&[0xf8, 0, 0, 0, 0, 0]);
        assert!(b.unpack_v32().is_err());
    }

    #[test]
    fn v64_round_trips() {
        for &min_bytes in &[3usize, 4, 5] {
            let mut b = Buffer::new();
            for &v in &[
                0i64,
                1,
                255,
                256,
                (1 << 24) - 1,
                1 << 24,
                i64::from(i32::MAX),
                1 << 31,
                1 << 40,
                1 << 53,
                i64::MAX,
            ] {
                b.pack_v64(v, min_bytes).unwrap();
                let len = b.len();
                assert!(len >= min_bytes && len <= min_bytes + 6);
                assert_eq!(
                    b.unpack_v64(min_bytes).unwrap(),
                    Some(v),
                    "value {:#x} min {}",
                    v,
                    min_bytes
                );
                b.discard();
            }
        }
    }

    #[test]
    fn v64_narrow_minimum_cannot_hold_wide_values() {
        let mut b = Buffer::new();
        assert!(b.pack_v64(i64::MAX, 2).is_err());
        assert!(b.pack_v64(i64::MAX, 1).is_err());
        // Small values are still fine at narrow widths.
        b.pack_v64(1000, 1).unwrap();
        assert_eq!(b.unpack_v64(1).unwrap(), Some(1000));
    }

    #[test]
    fn vstring_length_headers() {
        let short = vec![b'x'; 0x7f];
        let long = vec![b'y'; 0x300];
        let mut b = Buffer::new();
        b.pack_vstring(&short).unwrap();
        b.pack_vstring(&long).unwrap();
        assert_eq!(b.unpack_vstring(), Some(short));
        assert_eq!(b.unpack_vstring(), Some(long));
        assert!(b.pack_vstring(&vec![0u8; 0x8000]).is_err());
    }

    #[test]
    fn lines() {
        let mut b = Buffer::new();
        b.pack_line("@RSYNCD: 30.0");
        b.pack_line("already terminated\n");
        assert_eq!(b.unpack_line().as_deref(), Some("@RSYNCD: 30.0"));
        assert_eq!(b.unpack_line().as_deref(), Some("already terminated"));
        b.append(b"no newline yet");
        assert_eq!(b.unpack_line(), None);
    }

    #[test]
    fn msg_frames() {
        let mut b = Buffer::new();
        b.pack_msg(0, b"payload").unwrap();
        b.pack_msg(2, b"").unwrap();
        assert_eq!(b.unpack_msg().unwrap(), Some((0, b"payload".to_vec())));
        assert_eq!(b.unpack_msg().unwrap(), Some((2, Vec::new())));
        // A tag below the message base is malformed, not a short read.
        let mut bad = Buffer::new();
        bad.append(&[0, 0, 0, 1]);
        assert!(bad.unpack_msg().is_err());
    }

    #[test]
    fn underflow_leaves_cursor_unmoved() {
        let mut b = Buffer::new();
        b.append(&[0xff, 0xff, 0xff, 0xff, 0x01]);
        // Incomplete escaped s64: retry succeeds once the rest arrives.
        assert_eq!(b.unpack_s64(), None);
        assert_eq!(b.pos(), 0);
        b.append(&[0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(b.unpack_s64(), Some(0x0807060504030201));

        let mut c = Buffer::new();
        c.append(&[0xc0]);
        assert_eq!(c.unpack_v32().unwrap(), None);
        assert_eq!(c.pos(), 0);
        c.append(&[0x12, 0x34]);
        assert_eq!(c.unpack_v32().unwrap(), Some(0x3412));

        let mut d = Buffer::new();
        d.pack_msg(1, b"abcdef").unwrap();
        let whole = d.take();
        let mut e = Buffer::new();
        e.append(&whole[..5]);
        assert_eq!(e.unpack_msg().unwrap(), None);
        assert_eq!(e.pos(), 0);
        e.append(&whole[5..]);
        assert_eq!(e.unpack_msg().unwrap(), Some((1, b"abcdef".to_vec())));
    }

    #[test]
    fn discard_drops_only_read_bytes() {
        let mut b = Buffer::new();
        b.append(b"abcdef");
        b.unpack_bytes(2);
        b.discard();
        assert_eq!(b.as_bytes(), b"cdef");
        assert_eq!(b.pos(), 0);
    }
}
