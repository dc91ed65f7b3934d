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
//! A trie-based byte↔string codec for ROM-specific text encodings (the "Nightcrawler"
//! `.tbl` format).
//!
//! Two prefix tries back every [`TextTable`]: one keyed on the decoded text fragment's UTF-8
//! bytes (used by `encode`), one keyed on the raw ROM bytes (used by `decode`). The four
//! variants named in the format (`std`, `clean`, `raw`, and the unnamed default, which is
//! identical to `std`) are the same two tries parameterized by three booleans rather than
//! three independent tables.

use parse_display::Display;

use std::collections::HashMap;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           error type                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Display)]
pub enum Cause {
    /// An error in another crate or module-- cf. source.
    #[display("An error in another crate or module-- cf. source.")]
    Other,
    /// A `.tbl` file used the unsupported `!` line prefix.
    #[display("unsupported text table feature on line {0}: {1:?}")]
    UnsupportedFeature(usize, String),
    /// A `.tbl` mapping line couldn't be parsed.
    #[display("malformed text table line {0}: {1:?}")]
    MalformedLine(usize, String),
    /// Unknown codec variant name.
    #[display("unknown text table variant {0:?}")]
    UnknownVariant(String),
    /// No prefix of the remaining input matched any encode-trie entry.
    #[display("cannot encode text at byte offset {0}: {1:?}")]
    NoMatch(usize, String),
}

#[derive(Debug, Display)]
#[display("{cause} Source (if any): {source:?} Stack trace (if any): {trace:?}")]
pub struct Error {
    cause: Cause,
    source: Option<Box<dyn std::error::Error>>,
    trace: Option<backtrace::Backtrace>,
}

impl Error {
    fn new(cause: Cause) -> Error {
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

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                               trie                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
struct TrieNode<V> {
    children: HashMap<u8, TrieNode<V>>,
    value: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        TrieNode {
            children: HashMap::new(),
            value: None,
        }
    }

    fn insert(&mut self, key: &[u8], value: V) {
        let mut node = self;
        for b in key {
            node = node.children.entry(*b).or_insert_with(TrieNode::new);
        }
        node.value = Some(value);
    }

    /// Walk `input` as far as possible, returning the longest prefix that terminates at a node
    /// carrying a value, along with that value.
    fn longest_prefix(&self, input: &[u8]) -> Option<(usize, &V)> {
        let mut node = self;
        let mut best: Option<(usize, &V)> = None;
        for (i, b) in input.iter().enumerate() {
            match node.children.get(b) {
                Some(next) => {
                    node = next;
                    if let Some(v) = &node.value {
                        best = Some((i + 1, v));
                    }
                }
                None => break,
            }
        }
        best
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            TextTable                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
struct EncEntry {
    bytes: Vec<u8>,
    is_eos: bool,
}

#[derive(Debug, Clone)]
struct DecEntry {
    text: String,
    is_eos: bool,
}

/// A parsed `.tbl` text table, ready to encode/decode in one of its four variants.
pub struct TextTable {
    id: Option<String>,
    enc: TrieNode<EncEntry>,
    dec: TrieNode<DecEntry>,
    eos_list: Vec<Vec<u8>>,
    pad_byte: u8,
    stop_on_eos: bool,
    include_eos: bool,
    force_eos_on_encode: bool,
}

impl TextTable {
    /// Parse a `.tbl` file's contents and configure the named variant (`std`/`default`,
    /// `clean`, or `raw`).
    pub fn parse(data: &str, variant: &str) -> Result<TextTable> {
        let mut id = None;
        let mut enc = TrieNode::new();
        let mut dec = TrieNode::new();
        let mut eos_list = Vec::new();
        let mut pad_byte = 0x00u8;

        for (lineno, raw_line) in data.lines().enumerate() {
            let line = raw_line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('@') {
                id = Some(rest.trim().to_string());
                continue;
            }
            if let Some(rest) = line.strip_prefix('!') {
                return Err(Error::new(Cause::UnsupportedFeature(
                    lineno + 1,
                    rest.to_string(),
                )));
            }
            let (is_eos, mapping) = if let Some(rest) = line.strip_prefix('/') {
                (true, rest)
            } else {
                (false, line)
            };
            let (hexpart, text) = mapping
                .split_once('=')
                .ok_or_else(|| Error::new(Cause::MalformedLine(lineno + 1, mapping.to_string())))?;
            let bytes = parse_hex_bytes(hexpart)
                .ok_or_else(|| Error::new(Cause::MalformedLine(lineno + 1, mapping.to_string())))?;

            if text == " " {
                pad_byte = bytes[0];
            }

            enc.insert(
                text.as_bytes(),
                EncEntry {
                    bytes: bytes.clone(),
                    is_eos,
                },
            );
            dec.insert(
                &bytes,
                DecEntry {
                    text: text.to_string(),
                    is_eos,
                },
            );
            if is_eos {
                eos_list.push(bytes);
            }
        }

        let (stop_on_eos, include_eos, force_eos_on_encode) = match variant {
            "std" | "default" => (true, true, false),
            "clean" => (true, false, true),
            "raw" => (false, true, false),
            other => return Err(Error::new(Cause::UnknownVariant(other.to_string()))),
        };

        Ok(TextTable {
            id,
            enc,
            dec,
            eos_list,
            pad_byte,
            stop_on_eos,
            include_eos,
            force_eos_on_encode,
        })
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn pad_byte(&self) -> u8 {
        self.pad_byte
    }

    /// The raw bytes of the first registered EOS terminator, if any.
    pub fn eos_bytes(&self) -> Vec<u8> {
        self.eos_list.first().cloned().unwrap_or_default()
    }

    pub fn ends_with_eos(&self, bytes: &[u8]) -> bool {
        self.eos_list
            .iter()
            .any(|eos| bytes.len() >= eos.len() && &bytes[bytes.len() - eos.len()..] == eos.as_slice())
    }

    /// Encode `s` to bytes via longest-prefix match on the encode trie. A literal `[$XX]`
    /// produces byte `0xXX` directly. The `clean` variant appends the first EOS terminator if
    /// none ended the input.
    pub fn encode(&self, s: &str) -> Result<Vec<u8>> {
        let input = s.as_bytes();
        let mut out = Vec::new();
        let mut pos = 0usize;
        let mut last_was_eos = false;

        while pos < input.len() {
            if input[pos] == b'[' {
                if let Some(escape) = parse_literal_escape(&input[pos..]) {
                    out.push(escape.0);
                    pos += escape.1;
                    last_was_eos = false;
                    continue;
                }
            }
            match self.enc.longest_prefix(&input[pos..]) {
                Some((n, entry)) => {
                    out.extend(&entry.bytes);
                    last_was_eos = entry.is_eos;
                    pos += n;
                }
                None => {
                    return Err(Error::new(Cause::NoMatch(
                        pos,
                        String::from_utf8_lossy(&input[pos..]).to_string(),
                    )));
                }
            }
        }

        if self.force_eos_on_encode && !last_was_eos {
            out.extend(self.eos_bytes());
        }

        Ok(out)
    }

    /// Decode `bytes` via longest-prefix match on the decode trie. An unmatched byte `b`
    /// renders as `[$XX]`. Returns the decoded string and the number of input bytes consumed.
    pub fn decode(&self, bytes: &[u8]) -> Result<(String, usize)> {
        self.decode_with(bytes, self.stop_on_eos, self.include_eos)
    }

    /// Decode until (and including) the first EOS terminator, regardless of this table's
    /// configured variant -- the semantics `strz` reads always need.
    pub fn decode_z(&self, bytes: &[u8]) -> Result<(String, usize)> {
        self.decode_with(bytes, true, true)
    }

    fn decode_with(&self, bytes: &[u8], stop_on_eos: bool, include_eos: bool) -> Result<(String, usize)> {
        let mut out = String::new();
        let mut pos = 0usize;
        while pos < bytes.len() {
            match self.dec.longest_prefix(&bytes[pos..]) {
                Some((n, entry)) => {
                    pos += n;
                    if entry.is_eos {
                        if include_eos {
                            out.push_str(&entry.text);
                        }
                        if stop_on_eos {
                            return Ok((out, pos));
                        }
                    } else {
                        out.push_str(&entry.text);
                    }
                }
                None => {
                    out.push_str(&format!("[${:02X}]", bytes[pos]));
                    pos += 1;
                }
            }
        }
        Ok((out, pos))
    }
}

fn parse_hex_bytes(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Parse a leading `[$XX]` literal-byte escape. Returns the byte and the length consumed.
fn parse_literal_escape(input: &[u8]) -> Option<(u8, usize)> {
    if input.len() < 5 || input[1] != b'$' || input[4] != b']' {
        return None;
    }
    let hex = std::str::from_utf8(&input[2..4]).ok()?;
    let byte = u8::from_str_radix(hex, 16).ok()?;
    Some((byte, 5))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TBL: &str = "24=E\n4C=s\n4E=u\n47=n\n3A=a\n/F7=[EOS]\n";

    #[test]
    fn std_decode_includes_eos_and_stops() {
        let t = TextTable::parse(TBL, "std").unwrap();
        let bytes = [0x24, 0x4C, 0x4E, 0x47, 0x3A, 0xF7, 0x00, 0x00];
        let (s, consumed) = t.decode(&bytes).unwrap();
        assert_eq!(s, "Esuna[EOS]");
        assert_eq!(consumed, 6);
    }

    #[test]
    fn clean_decode_omits_eos() {
        let t = TextTable::parse(TBL, "clean").unwrap();
        let bytes = [0x24, 0x4C, 0x4E, 0x47, 0x3A, 0xF7];
        let (s, _) = t.decode(&bytes).unwrap();
        assert_eq!(s, "Esuna");
    }

    #[test]
    fn clean_encode_forces_eos() {
        let t = TextTable::parse(TBL, "clean").unwrap();
        let out = t.encode("Esuna").unwrap();
        assert_eq!(out, vec![0x24, 0x4C, 0x4E, 0x47, 0x3A, 0xF7]);
    }

    #[test]
    fn literal_escape_roundtrips() {
        let t = TextTable::parse(TBL, "raw").unwrap();
        let out = t.encode("[$FF]").unwrap();
        assert_eq!(out, vec![0xFF]);
        let (s, consumed) = t.decode(&out).unwrap();
        assert_eq!(s, "[$FF]");
        assert_eq!(consumed, 1);
    }

    #[test]
    fn unmatched_byte_renders_as_escape() {
        let t = TextTable::parse(TBL, "raw").unwrap();
        let (s, _) = t.decode(&[0x99]).unwrap();
        assert_eq!(s, "[$99]");
    }
}
