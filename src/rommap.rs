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
//! Loading a map directory into a [`RomMap`]: metadata, text tables, enums, bitfields, structs,
//! table specs, and assertions, in the order the format requires.

use crate::bitview::Unit;
use crate::expr::FieldExpr;
use crate::field::{Display_, FieldDef, FieldKind, Origin};
use crate::structure::{StructDef, TypeRegistry};
use crate::texttable::TextTable;

use parse_display::Display;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           error type                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Display)]
pub enum Cause {
    #[display("An error in another crate or module-- cf. source.")]
    Other,
    /// Map specification is malformed or inconsistent.
    #[display("map error: {0}")]
    Map(String),
    /// No map in any searched database matched the ROM's SHA-1.
    #[display("ROM sha1 hash {0} not in any hash database")]
    RomDetection(String),
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

    pub fn map(msg: impl Into<String>) -> Error {
        Error::new(Cause::Map(msg.into()))
    }

    pub fn detection(sha1: impl Into<String>) -> Error {
        Error::new(Cause::RomDetection(sha1.into()))
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

impl std::convert::From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
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

impl std::convert::From<crate::texttable::Error> for Error {
    fn from(err: crate::texttable::Error) -> Self {
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

impl std::convert::From<crate::expr::Error> for Error {
    fn from(err: crate::expr::Error) -> Self {
        Error {
            cause: Cause::Other,
            source: Some(Box::new(err)),
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Metadata                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, serde::Deserialize)]
pub struct MapMeta {
    pub name: String,
    pub file: Option<String>,
    pub sha1: Option<String>,
}

/// One `table, item, attribute?, value` row from `tests.tsv`: an assertion the map author
/// expects to hold for a correctly-loaded ROM.
#[derive(Debug, Clone)]
pub struct MapAssertion {
    pub table: String,
    pub item: i64,
    pub attribute: Option<String>,
    pub value: String,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          TableSpec                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One `rom.tsv` row: describes a [`crate::table::Table`] before it's bound to a buffer.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub id: String,
    pub type_name: String,
    pub set: Option<String>,
    pub index: Option<String>,
    pub offset: Option<i64>,
    pub size: Option<i64>,
    pub count: Option<usize>,
    pub stride: Option<i64>,
    pub unit: Unit,
    pub display: Option<String>,
    pub fid: Option<String>,
    pub name: Option<String>,
    pub iname: Option<String>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             RomMap                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Everything loaded from a map directory: metadata, the type registry, text tables, table
/// specs (not yet bound to a buffer -- that's `Rom::construct`), and test assertions.
pub struct RomMap {
    pub meta: MapMeta,
    pub types: Rc<TypeRegistry>,
    pub texttables: HashMap<String, Rc<TextTable>>,
    pub enums: HashMap<String, HashMap<String, i64>>,
    pub table_specs: Vec<TableSpec>,
    pub tests: Vec<MapAssertion>,
    pub root: PathBuf,
}

impl RomMap {
    /// Load a map directory: `meta.yaml`, texttables, enums, bitfields, structs, `rom.tsv`,
    /// `tests.tsv`, in that order. Hook modules (`hooks.py` in the original) aren't dynamically
    /// loadable in a compiled language; a hook's contribution -- custom field handlers, a `Rom`
    /// subclass -- is expressed instead as a [`crate::rom::RomHooks`] implementation the embedding
    /// binary registers at compile time (see `rom.rs`).
    pub fn load(dir: impl AsRef<Path>) -> Result<RomMap> {
        let root = dir.as_ref().to_path_buf();

        let meta_path = root.join("meta.yaml");
        let meta: MapMeta = serde_yaml::from_str(&fs::read_to_string(&meta_path)?)?;

        let types = Rc::new(TypeRegistry::new());

        let mut texttables = HashMap::new();
        let tt_dir = root.join("texttables");
        if tt_dir.is_dir() {
            for entry in fs::read_dir(&tt_dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("tbl") {
                    let stem = path.file_stem().unwrap().to_string_lossy().to_string();
                    let contents = fs::read_to_string(&path)?;
                    let tbl = TextTable::parse(&contents, "std")?;
                    texttables.insert(stem, Rc::new(tbl));
                }
            }
        }

        let mut enums = HashMap::new();
        let enum_dir = root.join("enums");
        if enum_dir.is_dir() {
            for entry in fs::read_dir(&enum_dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                    let stem = path.file_stem().unwrap().to_string_lossy().to_string();
                    let map: HashMap<String, i64> = serde_yaml::from_str(&fs::read_to_string(&path)?)?;
                    enums.insert(stem, map);
                }
            }
        }

        let bf_dir = root.join("bitfields");
        if bf_dir.is_dir() {
            for entry in fs::read_dir(&bf_dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("tsv") {
                    let stem = path.file_stem().unwrap().to_string_lossy().to_string();
                    let fields = load_field_rows(&path, &texttables)?;
                    types.define(StructDef::new(stem, fields)?)?;
                }
            }
        }

        let struct_dir = root.join("structs");
        if struct_dir.is_dir() {
            for entry in fs::read_dir(&struct_dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("tsv") {
                    let stem = path.file_stem().unwrap().to_string_lossy().to_string();
                    let fields = load_field_rows(&path, &texttables)?;
                    types.define(StructDef::new(stem, fields)?)?;
                }
            }
        }

        let table_specs = {
            let rom_tsv = root.join("rom.tsv");
            if rom_tsv.is_file() {
                load_table_specs(&rom_tsv)?
            } else {
                Vec::new()
            }
        };

        let tests = {
            let tests_tsv = root.join("tests.tsv");
            if tests_tsv.is_file() {
                load_tests(&tests_tsv)?
            } else {
                Vec::new()
            }
        };

        Ok(RomMap {
            meta,
            types,
            texttables,
            enums,
            table_specs,
            tests,
            root,
        })
    }

    /// The distinct entity-set names declared by `rom.tsv`.
    pub fn sets(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for spec in &self.table_specs {
            if let Some(set) = &spec.set {
                if !seen.contains(set) {
                    seen.push(set.clone());
                }
            }
        }
        seen
    }
}

fn load_field_rows(path: &Path, texttables: &HashMap<String, Rc<TextTable>>) -> Result<Vec<FieldDef>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .from_path(path)?;
    let mut fields = Vec::new();
    for (i, result) in rdr.records().enumerate() {
        let row = result?;
        let get = |name: &str| -> Option<&str> {
            rdr.headers().ok().and_then(|h| {
                h.iter()
                    .position(|c| c == name)
                    .and_then(|idx| row.get(idx))
            })
        };
        let id = get("id").unwrap_or_default().to_string();
        let name = get("name").filter(|s| !s.is_empty()).map(|s| s.to_string());
        let type_name = get("type").unwrap_or("uint");
        let kind = resolve_kind(type_name, texttables)?;
        let origin = Origin::parse(get("origin").unwrap_or(""));
        let unit = match get("unit").unwrap_or("bytes") {
            "bits" => Unit::Bits,
            "kb" => Unit::Kb,
            "mb" => Unit::Mb,
            "gb" => Unit::Gb,
            _ => Unit::Bytes,
        };
        let offset = FieldExpr::parse(get("offset").unwrap_or("0"))?;
        let size = FieldExpr::parse(get("size").unwrap_or("1"))?;
        let arg = get("arg").and_then(|s| s.parse().ok()).unwrap_or(0);
        let reference = get("ref").filter(|s| !s.is_empty()).map(|s| s.to_string());
        let display = match get("display").unwrap_or("") {
            "hex" => Display_::Hex,
            "pointer" => Display_::Pointer,
            "" => Display_::None,
            codec => Display_::Codec(codec.to_string()),
        };
        let order = get("order").and_then(|s| s.parse().ok()).unwrap_or(0);
        let comment = get("comment").unwrap_or("").to_string();

        fields.push(FieldDef {
            id,
            name,
            kind,
            origin,
            unit,
            offset,
            size,
            arg,
            reference,
            display,
            order,
            declaration_index: i,
            comment,
        });
    }
    Ok(fields)
}

fn resolve_kind(type_name: &str, texttables: &HashMap<String, Rc<TextTable>>) -> Result<FieldKind> {
    Ok(match type_name {
        "str" => FieldKind::Str(Rc::clone(
            texttables
                .get("default")
                .ok_or_else(|| Error::map("str field needs a default text table"))?,
        )),
        "strz" => FieldKind::StrZ(Rc::clone(
            texttables
                .get("default")
                .ok_or_else(|| Error::map("strz field needs a default text table"))?,
        )),
        "bytes" => FieldKind::Bytes,
        "bin" => FieldKind::Bin,
        "hex" => FieldKind::Hex,
        "uint" => FieldKind::Uint,
        "uintle" => FieldKind::UintLe,
        "uintbe" => FieldKind::UintBe,
        "int" => FieldKind::Int,
        "nbcd" | "nbcdle" => FieldKind::Nbcdle,
        other => FieldKind::Struct(other.to_string()),
    })
}

fn load_table_specs(path: &Path) -> Result<Vec<TableSpec>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .from_path(path)?;
    let headers = rdr.headers()?.clone();
    let mut out = Vec::new();
    for result in rdr.records() {
        let row = result?;
        let get = |name: &str| -> Option<&str> {
            headers
                .iter()
                .position(|c| c == name)
                .and_then(|idx| row.get(idx))
                .filter(|s| !s.is_empty())
        };
        out.push(TableSpec {
            id: get("id").unwrap_or_default().to_string(),
            type_name: get("type").unwrap_or_default().to_string(),
            set: get("set").map(|s| s.to_string()),
            index: get("index").map(|s| s.to_string()),
            offset: get("offset").and_then(|s| s.parse().ok()),
            size: get("size").and_then(|s| s.parse().ok()),
            count: get("count").and_then(|s| s.parse().ok()),
            stride: get("stride").and_then(|s| s.parse().ok()),
            unit: match get("unit").unwrap_or("bytes") {
                "bits" => Unit::Bits,
                "kb" => Unit::Kb,
                "mb" => Unit::Mb,
                "gb" => Unit::Gb,
                _ => Unit::Bytes,
            },
            display: get("display").map(|s| s.to_string()),
            fid: get("fid").map(|s| s.to_string()),
            name: get("name").map(|s| s.to_string()),
            iname: get("iname").map(|s| s.to_string()),
        });
    }
    Ok(out)
}

fn load_tests(path: &Path) -> Result<Vec<MapAssertion>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .from_path(path)?;
    let headers = rdr.headers()?.clone();
    let mut out = Vec::new();
    for result in rdr.records() {
        let row = result?;
        let get = |name: &str| -> Option<&str> {
            headers
                .iter()
                .position(|c| c == name)
                .and_then(|idx| row.get(idx))
                .filter(|s| !s.is_empty())
        };
        out.push(MapAssertion {
            table: get("table").unwrap_or_default().to_string(),
            item: get("item").and_then(|s| s.parse().ok()).unwrap_or(0),
            attribute: get("attribute").map(|s| s.to_string()),
            value: get("value").unwrap_or_default().to_string(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_map_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("meta.yaml"), "name: Test Game\n").unwrap();

        let structs = dir.path().join("structs");
        fs::create_dir(&structs).unwrap();
        let mut f = fs::File::create(structs.join("Monster.tsv")).unwrap();
        writeln!(f, "id\tname\ttype\toffset\tsize").unwrap();
        writeln!(f, "hp\thp\tuintbe\t0\t2").unwrap();

        let map = RomMap::load(dir.path()).unwrap();
        assert_eq!(map.meta.name, "Test Game");
        let def = map.types.get("Monster").unwrap();
        assert_eq!(def.fields.len(), 1);
    }
}
