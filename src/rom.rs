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
//! A loaded ROM image: format detection/typing, table/entity construction from a [`RomMap`],
//! dump/load, diffing against the original to produce a [`Patch`], and sanitize hooks.

use crate::bitview::{BitView, Unit};
use crate::entity::EntityList;
use crate::expr::Context;
use crate::patch::Patch;
use crate::rommap::RomMap;
use crate::table::{Index, ItemType, Table};

use parse_display::Display;

use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::process::Command;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           error type                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Display)]
pub enum Cause {
    #[display("An error in another crate or module-- cf. source.")]
    Other,
    /// ROM does not validate as the expected format.
    #[display("{0}")]
    Header(String),
    /// A changeset path does not resolve, a field refuses a value, or assembly fails.
    #[display("changeset error at {0:?}: {1}")]
    Changeset(String, String),
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

    pub fn header(msg: impl Into<String>) -> Error {
        Error::new(Cause::Header(msg.into()))
    }

    pub fn changeset(path: impl Into<String>, msg: impl Into<String>) -> Error {
        Error::new(Cause::Changeset(path.into(), msg.into()))
    }

    pub fn is_header(&self) -> bool {
        matches!(self.cause, Cause::Header(_))
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

impl std::convert::From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            cause: Cause::Other,
            source: Some(Box::new(err)),
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

impl std::convert::From<crate::rommap::Error> for Error {
    fn from(err: crate::rommap::Error) -> Self {
        Error {
            cause: Cause::Other,
            source: Some(Box::new(err)),
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

impl std::convert::From<crate::table::Error> for Error {
    fn from(err: crate::table::Error) -> Self {
        Error {
            cause: Cause::Other,
            source: Some(Box::new(err)),
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

impl std::convert::From<crate::entity::Error> for Error {
    fn from(err: crate::entity::Error) -> Self {
        Error {
            cause: Cause::Other,
            source: Some(Box::new(err)),
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

impl std::convert::From<crate::patch::Error> for Error {
    fn from(err: crate::patch::Error) -> Self {
        Error {
            cause: Cause::Other,
            source: Some(Box::new(err)),
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

impl std::convert::From<crate::bitview::Error> for Error {
    fn from(err: crate::bitview::Error) -> Self {
        Error {
            cause: Cause::Other,
            source: Some(Box::new(err)),
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

impl std::convert::From<crate::structure::Error> for Error {
    fn from(err: crate::structure::Error) -> Self {
        Error {
            cause: Cause::Other,
            source: Some(Box::new(err)),
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

impl std::convert::From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error {
            cause: Cause::Other,
            source: Some(Box::new(err)),
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         ROM typing                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RomKind {
    #[display("iNES ROM")]
    Ines,
    #[display("SNES ROM")]
    Snes,
    #[display("GBA ROM")]
    Gba,
    #[display("unknown ROM")]
    Unknown,
}

const INES_IDENT: &[u8] = b"NES\x1a";
const INES_HEADER_SIZE: usize = 16;

const GBA_HDR_OFFSET: usize = 0xA0;
const GBA_HDR_MAGIC_REL: usize = 0x1D;
const GBA_MAGIC: u8 = 0x96;

const SNES_SMC_SIZE: usize = 0x200;
/// mapmode byte -> the header offset it's only valid at. Mirrors the original's
/// `header_locations`: 7 known `(mapmode, offset)` pairs scanned during detection.
const SNES_HEADER_LOCATIONS: &[(u8, usize)] = &[
    (0x20, 0x7FC0),
    (0x21, 0xFFC0),
    (0x23, 0x7FC0),
    (0x30, 0x7FC0),
    (0x31, 0xFFC0),
    (0x32, 0x7FC0),
    (0x35, 0xFFC0),
];

pub fn is_ines(data: &[u8]) -> bool {
    data.len() >= INES_HEADER_SIZE && &data[..4] == INES_IDENT
}

pub fn is_gba(data: &[u8]) -> bool {
    data.len() >= GBA_HDR_OFFSET + 32 && data[GBA_HDR_OFFSET + GBA_HDR_MAGIC_REL] == GBA_MAGIC
}

/// Offset (within `data`, i.e. after any SMC header has been stripped) of the SNES header that
/// validates, or a [`Cause::Header`] error naming why none did.
pub fn detect_snes_header_offset(data: &[u8]) -> Result<usize> {
    let mut candidate_offsets: Vec<usize> = SNES_HEADER_LOCATIONS.iter().map(|(_, o)| *o).collect();
    candidate_offsets.sort_unstable();
    candidate_offsets.dedup();

    for offset in candidate_offsets {
        if offset + 0x18 > data.len() {
            continue;
        }
        let name = &data[offset..offset + 0x15];
        let mapmode = data[offset + 0x15];
        let sz_rom = data[offset + 0x17];

        let expected_offset = SNES_HEADER_LOCATIONS
            .iter()
            .find(|(mm, _)| *mm == mapmode)
            .map(|(_, o)| *o);
        if expected_offset != Some(offset) {
            continue;
        }

        let sz_max = 1024usize.saturating_mul(1usize << sz_rom.min(31));
        let sz_min = sz_max / 2;
        let sz_real = data.len();
        if !(sz_real <= sz_max && sz_real > sz_min) {
            continue;
        }

        if name[..name.len() - 1].iter().all(|c| c.is_ascii_graphic() || *c == b' ') {
            return Ok(offset);
        }
    }
    Err(Error::header("No valid SNES header found"))
}

/// `Some(512)` if a 512-byte SMC copier header is present, `None` if unheadered, or a
/// [`Cause::Header`] error if the file size is neither.
pub fn detect_smc_offset(file_len: usize) -> Result<Option<usize>> {
    let sz_smc = file_len % 1024;
    if sz_smc == 0 {
        Ok(None)
    } else if sz_smc == SNES_SMC_SIZE {
        Ok(Some(SNES_SMC_SIZE))
    } else {
        Err(Error::header("Bad rom file size or corrupt SMC header"))
    }
}

/// Try each known ROM type in turn, as the original's brute-force subclass trial does.
pub fn detect(bytes: &[u8]) -> RomKind {
    if is_ines(bytes) {
        return RomKind::Ines;
    }
    if is_gba(bytes) {
        return RomKind::Gba;
    }
    if let Ok(smc) = detect_smc_offset(bytes.len()) {
        let data = &bytes[smc.unwrap_or(0)..];
        if detect_snes_header_offset(data).is_ok() {
            return RomKind::Snes;
        }
    }
    RomKind::Unknown
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                               Rom                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

struct NoCtx;
impl Context for NoCtx {
    fn resolve(&self, _ident: &str) -> Option<i64> {
        None
    }
}

/// A loaded ROM image bound to a map: tables and entities constructed, ready for reads, writes,
/// dumping, loading, and patch diffing.
pub struct Rom {
    pub kind: RomKind,
    pub map: RomMap,
    working: BitView,
    original: BitView,
    pub entities: HashMap<String, EntityList>,
}

impl Rom {
    /// Build a `Rom` from raw bytes and an already-loaded map: construct tables in dependency
    /// order (those with an `index` dependency after the tables they depend on), then group
    /// them into entity lists by `set`.
    pub fn new(bytes: Vec<u8>, map: RomMap) -> Result<Rom> {
        let kind = detect(&bytes);
        let working = BitView::from_bytes(bytes.clone());
        let original = BitView::from_bytes(bytes);

        let mut specs = map.table_specs.clone();
        specs.sort_by_key(|s| s.index.is_some());

        let mut tables: HashMap<String, Table> = HashMap::new();
        for spec in &specs {
            let index = if let Some(index_id) = &spec.index {
                let index_table = tables.get(index_id).ok_or_else(|| {
                    crate::rommap::Error::map(format!(
                        "table '{}' uses index '{}' but no such index exists",
                        spec.id, index_id
                    ))
                })?;
                crate::table::offsets_from_index_table(index_table, &NoCtx)?
            } else {
                Index::Fixed {
                    offset: spec.offset.unwrap_or(0),
                    count: spec.count.unwrap_or(0),
                    stride: spec.stride.unwrap_or(0),
                }
            };

            let item_type = match spec.type_name.as_str() {
                "uint" => ItemType::Primitive(crate::field::FieldKind::Uint),
                "uintle" => ItemType::Primitive(crate::field::FieldKind::UintLe),
                "uintbe" => ItemType::Primitive(crate::field::FieldKind::UintBe),
                "int" => ItemType::Primitive(crate::field::FieldKind::Int),
                "bytes" => ItemType::Primitive(crate::field::FieldKind::Bytes),
                other => ItemType::Struct(map.types.get(other)?),
            };

            let table = Table::new(
                spec.id.clone(),
                spec.name.clone(),
                working.clone(),
                working.clone(),
                item_type,
                index,
                spec.unit,
                spec.size,
            )?;
            tables.insert(spec.id.clone(), table);
        }

        let mut by_set: HashMap<String, Vec<String>> = HashMap::new();
        for spec in &specs {
            let set = spec.set.clone().unwrap_or_else(|| spec.id.clone());
            by_set.entry(set).or_default().push(spec.id.clone());
        }

        let mut entities = HashMap::new();
        for (set, ids) in by_set {
            let members: Vec<Table> = ids
                .into_iter()
                .filter_map(|id| tables.remove(&id))
                .collect();
            entities.insert(set.clone(), EntityList::new(set, members)?);
        }

        Ok(Rom {
            kind,
            map,
            working,
            original,
            entities,
        })
    }

    /// Check every `tests.tsv` assertion: the named table/entity's attribute (or its own value,
    /// if no attribute column) must render to the expected string.
    pub fn check_assertions(&self) -> Result<Vec<String>> {
        let mut failures = Vec::new();
        for assertion in &self.map.tests {
            let elist = match self.entities.get(&assertion.table) {
                Some(e) => e,
                None => {
                    failures.push(format!("no table or set named {:?}", assertion.table));
                    continue;
                }
            };
            let idx = assertion.item as usize;
            let entity = match elist.entity(idx) {
                Ok(e) => e,
                Err(e) => {
                    failures.push(format!("{}[{}]: {}", assertion.table, idx, e));
                    continue;
                }
            };
            let actual = match &assertion.attribute {
                Some(attr) => entity.get(attr, &NoCtx).map(|v| v.to_string()),
                None => entity.get("name", &NoCtx).map(|v| v.to_string()),
            };
            match actual {
                Ok(v) if v == assertion.value => {}
                Ok(v) => failures.push(format!(
                    "{}[{}].{:?}: expected {:?}, got {:?}",
                    assertion.table, idx, assertion.attribute, assertion.value, v
                )),
                Err(e) => failures.push(format!("{}[{}]: {}", assertion.table, idx, e)),
            }
        }
        Ok(failures)
    }

    /// Build a `Rom` directly from pre-built entities, bypassing table construction. Used by
    /// other modules' tests that need a `Rom` without a full map directory on disk.
    #[cfg(test)]
    pub(crate) fn for_test(map: RomMap, entities: HashMap<String, EntityList>, bytes: Vec<u8>) -> Rom {
        Rom {
            kind: detect(&bytes),
            map,
            working: BitView::from_bytes(bytes.clone()),
            original: BitView::from_bytes(bytes),
            entities,
        }
    }

    pub fn open(path: impl AsRef<Path>, map: RomMap) -> Result<Rom> {
        let bytes = fs::read(path)?;
        Rom::new(bytes, map)
    }

    /// Diff the working buffer against the original to produce a [`Patch`].
    pub fn make_patch(&self) -> Result<Patch> {
        let old = self.original.read_bytes()?;
        let new = self.working.read_bytes()?;
        Ok(Patch::diff(&old, &new))
    }

    pub fn apply_patch(&self, patch: &Patch) -> Result<()> {
        let mut bytes = self.working.read_bytes()?;
        let mut cursor = Cursor::new(&mut bytes);
        patch.apply(&mut cursor)?;
        self.working.write_bytes(&bytes)?;
        Ok(())
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.working.read_bytes()?;
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Write each entity set's columns to a `<set>.tsv` file in `folder`.
    pub fn dump(&self, folder: impl AsRef<Path>, force: bool) -> Result<()> {
        let folder = folder.as_ref();
        for (name, elist) in &self.entities {
            let path = folder.join(format!("{name}.tsv"));
            if path.exists() && !force {
                return Err(Error::new(Cause::Other));
            }
            let mut wtr = csv::WriterBuilder::new()
                .delimiter(b'\t')
                .quote_style(csv::QuoteStyle::Never)
                .from_path(&path)?;
            let columns = elist.columns();
            let mut header = vec!["_idx".to_string()];
            header.extend(columns.clone());
            wtr.write_record(&header)?;
            for i in 0..elist.len() {
                let entity = elist.entity(i)?;
                let mut row = vec![i.to_string()];
                for col in &columns {
                    row.push(entity.get(col, &NoCtx).map(|v| v.to_string()).unwrap_or_default());
                }
                wtr.write_record(&row)?;
            }
        }
        Ok(())
    }

    /// Read each `<set>.tsv` in `folder`, sort by `_idx` when present, and apply row `i` to
    /// entity `i` via [`crate::entity::Entity::update`] inside a cached-lookup scope.
    pub fn load(&self, folder: impl AsRef<Path>) -> Result<()> {
        let folder = folder.as_ref();
        for (name, elist) in &self.entities {
            let path = folder.join(format!("{name}.tsv"));
            if !path.is_file() {
                continue;
            }
            let mut rdr = csv::ReaderBuilder::new()
                .delimiter(b'\t')
                .quoting(false)
                .from_path(&path)?;
            let headers = rdr.headers()?.clone();
            let mut rows: Vec<(usize, HashMap<String, String>)> = Vec::new();
            for (fallback_idx, result) in rdr.records().enumerate() {
                let record = result?;
                let mut row = HashMap::new();
                for (h, v) in headers.iter().zip(record.iter()) {
                    row.insert(h.to_string(), v.to_string());
                }
                let idx = row
                    .get("_idx")
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(fallback_idx);
                rows.push((idx, row));
            }
            rows.sort_by_key(|(i, _)| *i);

            let _scope = elist.cached_searches();
            for (i, row) in rows {
                if i >= elist.len() {
                    continue;
                }
                let entity = elist.entity(i)?;
                let mut values = HashMap::new();
                for (k, v) in &row {
                    if k == "_idx" {
                        continue;
                    }
                    values.insert(k.clone(), crate::field::FieldValue::Str(v.clone()));
                }
                entity.update(&values, &NoCtx)?;
            }
        }
        Ok(())
    }

    pub fn sanitize<H: RomHooks>(&self, hooks: &H) -> Result<()> {
        hooks.sanitize(self)
    }

    /// Scan `path` for a `romtool: patch@HEX:ASSEMBLER` marker, invoke the named external
    /// assembler, and splice the resulting binary into the working buffer at the marked offset.
    pub fn apply_assembly(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let marker = contents
            .lines()
            .find_map(|line| parse_assembly_marker(line))
            .ok_or_else(|| Error::changeset(path.display().to_string(), "no patch location given"))?;

        let tmp = tempfile::tempdir()?;
        let outfile = tmp.path().join(format!(
            "{}.bin",
            path.file_name().unwrap_or_default().to_string_lossy()
        ));

        let args: Vec<String> = match marker.assembler.as_str() {
            "cl65" => vec![
                "-t".into(),
                "none".into(),
                "-o".into(),
                outfile.display().to_string(),
                path.display().to_string(),
            ],
            "xa65" => vec![
                "-w".into(),
                "-c".into(),
                "-M".into(),
                "-o".into(),
                outfile.display().to_string(),
                path.display().to_string(),
            ],
            other => {
                return Err(Error::changeset(
                    path.display().to_string(),
                    format!("don't know how to assemble with {}", other),
                ))
            }
        };

        let binary = if marker.assembler == "cl65" { "cl65" } else { "xa" };
        let status = Command::new(binary).args(&args).status().map_err(|e| {
            Error::changeset(path.display().to_string(), format!("failed to launch {}: {}", binary, e))
        })?;
        if !status.success() {
            return Err(Error::changeset(
                path.display().to_string(),
                format!("external assembly failed with status {:?}", status.code()),
            ));
        }

        let data = fs::read(&outfile)?;
        let end = marker.location as usize + data.len();
        let view = self.working.slice(
            Some(marker.location as i64),
            Some(end as i64),
            Unit::Bytes,
        )?;
        view.write_bytes(&data)?;
        Ok(())
    }
}

struct AssemblyMarker {
    location: u64,
    assembler: String,
}

fn parse_assembly_marker(line: &str) -> Option<AssemblyMarker> {
    let idx = line.find("romtool: patch@")?;
    let rest = &line[idx + "romtool: patch@".len()..];
    let (hex, assembler) = rest.split_once(':')?;
    let location = u64::from_str_radix(hex.trim(), 16).ok()?;
    Some(AssemblyMarker {
        location,
        assembler: assembler.trim().to_string(),
    })
}

/// Map-specific hooks: sanitize (recompute checksums, etc) and lint. A compiled-language
/// substitute for the original's dynamically-loaded `hooks.py` module -- the embedding binary
/// implements this trait and passes an instance in, rather than the map directory supplying
/// executable code at load time.
pub trait RomHooks {
    fn sanitize(&self, rom: &Rom) -> Result<()>;
}

/// The default no-op hook set, used when a map declares none.
pub struct NoHooks;
impl RomHooks for NoHooks {
    fn sanitize(&self, _rom: &Rom) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_ines() {
        let mut bytes = vec![0x4E, 0x45, 0x53, 0x1A];
        bytes.resize(16, 0);
        assert_eq!(detect(&bytes), RomKind::Ines);
    }

    #[test]
    fn detects_gba() {
        let mut bytes = vec![0u8; 0xA0 + 32];
        bytes[0xA0 + 0x1D] = 0x96;
        assert_eq!(detect(&bytes), RomKind::Gba);
    }

    #[test]
    fn detects_snes_hirom_unheadered() {
        let size = 512 * 1024;
        let mut bytes = vec![0u8; size];
        let base = 0xFFC0;
        for (i, b) in bytes[base..base + 0x15].iter_mut().enumerate() {
            *b = b'A' + (i as u8 % 26);
        }
        bytes[base + 0x15] = 0x21; // mapmode: hirom
        bytes[base + 0x17] = 9; // 2^9 KiB = 512 KiB
        assert_eq!(detect(&bytes), RomKind::Snes);
    }

    #[test]
    fn snes_headered_and_unheadered_agree_on_header_content() {
        let size = 512 * 1024;
        let mut plain = vec![0u8; size];
        let base = 0xFFC0;
        for (i, b) in plain[base..base + 0x15].iter_mut().enumerate() {
            *b = b'A' + (i as u8 % 26);
        }
        plain[base + 0x15] = 0x21;
        plain[base + 0x17] = 9;

        let mut headered = vec![0u8; SNES_SMC_SIZE];
        headered.extend(&plain);

        let off_plain = detect_snes_header_offset(&plain).unwrap();
        let smc = detect_smc_offset(headered.len()).unwrap();
        let data = &headered[smc.unwrap_or(0)..];
        let off_headered = detect_snes_header_offset(data).unwrap();
        assert_eq!(off_plain, off_headered);
        assert_eq!(
            &plain[off_plain..off_plain + 0x15],
            &data[off_headered..off_headered + 0x15]
        );
    }

    #[test]
    fn unknown_falls_through_all_candidates() {
        let bytes = vec![0u8; 64];
        assert_eq!(detect(&bytes), RomKind::Unknown);
    }

    #[test]
    fn assembly_marker_parses() {
        let m = parse_assembly_marker("; romtool: patch@1A2B:cl65").unwrap();
        assert_eq!(m.location, 0x1A2B);
        assert_eq!(m.assembler, "cl65");
    }
}
