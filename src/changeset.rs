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
//! Path-based traversal applying a nested changeset (YAML or JSON) to a loaded [`Rom`].
//!
//! A changeset is a nested mapping whose leaf key names a field and whose intermediate keys
//! name an entity set, then an entity (by index or by `locate`-able name). Traversal starts at
//! the `Rom` and follows the same `lookup` steps a map author would type by hand: set name,
//! entity name, field name. A path that fails to resolve is reported in full, dotted form.

use crate::expr::Context;
use crate::field::FieldValue;
use crate::rom::Rom;

use parse_display::Display;

use std::fs;
use std::path::Path;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           error type                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Display)]
pub enum Cause {
    #[display("An error in another crate or module-- cf. source.")]
    Other,
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

    fn at(path: &[String], msg: impl Into<String>) -> Error {
        Error::new(Cause::Changeset(path.join(":"), msg.into()))
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

impl std::convert::From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
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

pub type Result<T> = std::result::Result<T, Error>;

struct NoCtx;
impl Context for NoCtx {
    fn resolve(&self, _ident: &str) -> Option<i64> {
        None
    }
}

/// Read a changeset file, dispatching on extension (`.json`, else YAML).
pub fn load(path: impl AsRef<Path>) -> Result<serde_json::Value> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        Ok(serde_json::from_str(&text)?)
    } else {
        Ok(serde_yaml::from_str(&text)?)
    }
}

/// Apply `changeset` (`{set: {entity: {field: value}}}`) to `rom`, in place.
pub fn apply(rom: &Rom, changeset: &serde_json::Value) -> Result<()> {
    let obj = changeset
        .as_object()
        .ok_or_else(|| Error::at(&[], "a changeset must be a mapping of set name to entities"))?;

    let mut path = Vec::new();
    for (set_key, entities) in obj {
        path.push(set_key.clone());
        let elist = rom
            .entities
            .get(set_key)
            .ok_or_else(|| Error::at(&path, format!("no entity set named {:?}", set_key)))?;

        let entity_map = entities
            .as_object()
            .ok_or_else(|| Error::at(&path, "expected a mapping of entity name to fields"))?;

        for (entity_key, fields) in entity_map {
            path.push(entity_key.clone());

            let idx = if let Ok(i) = entity_key.parse::<usize>() {
                i
            } else {
                elist
                    .locate(entity_key, &NoCtx)
                    .map_err(|e| Error::at(&path, e.to_string()))?
            };
            let entity = elist
                .entity(idx)
                .map_err(|e| Error::at(&path, e.to_string()))?;

            let field_map = fields
                .as_object()
                .ok_or_else(|| Error::at(&path, "expected a mapping of field name to value"))?;

            for (field_key, value) in field_map {
                path.push(field_key.clone());
                let fv = json_to_field_value(value);
                entity
                    .set(field_key, &fv, &NoCtx)
                    .map_err(|e| Error::at(&path, e.to_string()))?;
                path.pop();
            }
            path.pop();
        }
        path.pop();
    }
    Ok(())
}

fn json_to_field_value(v: &serde_json::Value) -> FieldValue {
    match v {
        serde_json::Value::Number(n) => FieldValue::Int(n.as_i64().unwrap_or(0)),
        serde_json::Value::String(s) => FieldValue::Str(s.clone()),
        other => FieldValue::Str(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitview::{BitView, Unit};
    use crate::entity::EntityList;
    use crate::field::FieldKind;
    use crate::rommap::RomMap;
    use crate::table::{Index, ItemType, Table};
    use std::collections::HashMap;

    fn minimal_map() -> RomMap {
        RomMap {
            meta: crate::rommap::MapMeta {
                name: "Test".to_string(),
                file: None,
                sha1: None,
            },
            types: std::rc::Rc::new(crate::structure::TypeRegistry::new()),
            texttables: HashMap::new(),
            enums: HashMap::new(),
            table_specs: Vec::new(),
            tests: Vec::new(),
            root: std::path::PathBuf::new(),
        }
    }

    #[test]
    fn sets_a_field_and_produces_a_two_byte_patch() {
        let buf = BitView::from_bytes(vec![0; 4]);
        let hp = Table::new(
            "hp",
            Some("hp".to_string()),
            buf.clone(),
            buf,
            ItemType::Primitive(FieldKind::UintBe),
            Index::Fixed { offset: 0, count: 1, stride: 2 },
            Unit::Bytes,
            None,
        )
        .unwrap();
        let list = EntityList::new("monsters", vec![hp]).unwrap();

        let mut entities = HashMap::new();
        entities.insert("monsters".to_string(), list);

        let rom = Rom::for_test(minimal_map(), entities, vec![0; 4]);

        let changeset: serde_json::Value =
            serde_json::from_str(r#"{"monsters": {"0": {"hp": 100}}}"#).unwrap();
        apply(&rom, &changeset).unwrap();

        let patch = rom.make_patch().unwrap();
        assert_eq!(patch.len(), 2);
        assert_eq!(patch.get(0), Some(0));
        assert_eq!(patch.get(1), Some(100));
    }

    #[test]
    fn unknown_set_reports_dotted_path() {
        let rom = Rom::for_test(minimal_map(), HashMap::new(), vec![0; 4]);
        let changeset: serde_json::Value = serde_json::from_str(r#"{"monsters": {}}"#).unwrap();
        let err = apply(&rom, &changeset).unwrap_err();
        assert!(err.to_string().contains("monsters"));
    }
}
