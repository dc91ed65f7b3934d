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
//! Typed, located struct members: the closed-tagged-union replacement for the map format's
//! dynamic field-type plugin mechanism.
//!
//! A [`FieldDef`] fully describes one member of a [`crate::structure::Structure`]: its type
//! ([`FieldKind`]), where its bits live ([`Origin`] + `offset`/`size` expressions), and how its
//! stored representation maps to a logical value (`arg`, `ref`, `display`). Resolving a
//! `FieldKind` from a map's `type` column happens once, at map-load time, so the read/write hot
//! path is a plain enum match rather than a registry lookup.

use crate::bitview::{BitView, Unit};
use crate::expr::{Context, FieldExpr};
use crate::texttable::TextTable;

use parse_display::Display;

use std::rc::Rc;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           error type                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Display)]
pub enum Cause {
    #[display("An error in another crate or module-- cf. source.")]
    Other,
    #[display("unknown field type {0:?}")]
    UnknownType(String),
    #[display("field {0:?} has no label to look up by name")]
    NoLabel(String),
    #[display("field {0:?} refused value {1:?}")]
    BadValue(String, String),
    #[display("origin {0:?} is not a recognized sibling or special name")]
    BadOrigin(String),
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

impl std::convert::From<crate::bitview::Error> for Error {
    fn from(err: crate::bitview::Error) -> Self {
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
//                                            FieldKind                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The closed set of primitive field types, plus a reference to a named struct type for
/// struct-valued fields.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Str(Rc<TextTable>),
    StrZ(Rc<TextTable>),
    Bytes,
    Bin,
    Hex,
    Uint,
    UintLe,
    UintBe,
    Int,
    Nbcdle,
    Struct(String),
}

impl FieldKind {
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Str(_) => "str",
            FieldKind::StrZ(_) => "strz",
            FieldKind::Bytes => "bytes",
            FieldKind::Bin => "bin",
            FieldKind::Hex => "hex",
            FieldKind::Uint => "uint",
            FieldKind::UintLe => "uintle",
            FieldKind::UintBe => "uintbe",
            FieldKind::Int => "int",
            FieldKind::Nbcdle => "nbcd",
            FieldKind::Struct(_) => "struct",
        }
    }
}

/// Where a field's view is rooted: the enclosing structure (`self`, the default), the entire
/// buffer (`root`), or a named sibling field's own view.
#[derive(Debug, Clone, PartialEq)]
pub enum Origin {
    SelfOrigin,
    Root,
    Sibling(String),
}

impl Origin {
    pub fn parse(s: &str) -> Origin {
        match s {
            "" | "self" => Origin::SelfOrigin,
            "root" => Origin::Root,
            other => Origin::Sibling(other.to_string()),
        }
    }
}

/// Hex/pointer rendering, or the name of a text codec for string fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Display_ {
    None,
    Hex,
    Pointer,
    Codec(String),
}

/// A single value produced by reading a field, or accepted by writing one.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    /// An integer that also names an entity to look up by index (`ref`).
    IndexInt(i64, String),
}

impl FieldValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(n) => Some(*n),
            FieldValue::IndexInt(n, _) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Int(n) => write!(f, "{}", n),
            FieldValue::Str(s) => write!(f, "{}", s),
            FieldValue::Bytes(b) => write!(f, "{}", b.iter().map(|x| format!("{:02x}", x)).collect::<String>()),
            FieldValue::IndexInt(n, entity) => write!(f, "{}@{}", n, entity),
        }
    }
}

/// The static description of one struct member, as parsed from a `structs/*.tsv` row.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub id: String,
    pub name: Option<String>,
    pub kind: FieldKind,
    pub origin: Origin,
    pub unit: Unit,
    pub offset: FieldExpr,
    pub size: FieldExpr,
    pub arg: i64,
    pub reference: Option<String>,
    pub display: Display_,
    pub order: i32,
    pub declaration_index: usize,
    pub comment: String,
}

impl FieldDef {
    /// Display-order sort key, per the declared priority: the field literally named `name`
    /// first, then ordinary fields, then slop/pointer/unknown/flag fields last, then declared
    /// `order`, then declaration index.
    pub fn sort_key(&self) -> (bool, bool, bool, bool, bool, i32, usize) {
        let label = self.name.as_deref().unwrap_or(&self.id).to_lowercase();
        let is_name = self.id.to_lowercase() == "name" || label == "name";
        let is_slop = matches!(label.as_str(), "padding" | "reserved");
        let is_pointer = matches!(self.display, Display_::Pointer);
        let is_unknown = label.contains("unknown");
        let is_flag = matches!(self.size, FieldExpr::Static(1)) && matches!(self.unit, Unit::Bits);
        (
            !is_name,
            is_slop,
            is_pointer,
            is_unknown,
            is_flag,
            self.order,
            self.declaration_index,
        )
    }

    /// Resolve this field's view given the enclosing struct's view, the root buffer view, and a
    /// sibling-lookup closure (for `origin` and for expression evaluation).
    pub fn view<'a>(
        &self,
        self_view: &BitView,
        root_view: &BitView,
        ctx: &dyn Context,
        sibling_view: &dyn Fn(&str) -> Option<BitView>,
    ) -> Result<BitView> {
        let base = match &self.origin {
            Origin::SelfOrigin => self_view.clone(),
            Origin::Root => root_view.clone(),
            Origin::Sibling(name) => sibling_view(name)
                .ok_or_else(|| Error::new(Cause::BadOrigin(name.clone())))?,
        };
        let offset = self.offset.eval(ctx)?;
        let size = self.size.eval(ctx)?;
        Ok(base.slice(Some(offset), Some(offset + size), self.unit)?)
    }

    /// Read this field's logical value out of `view`.
    pub fn read(&self, view: &BitView) -> Result<FieldValue> {
        let raw = match &self.kind {
            FieldKind::Str(tbl) => return Ok(FieldValue::Str(view.read_str(tbl)?)),
            FieldKind::StrZ(tbl) => return Ok(FieldValue::Str(view.read_strz(tbl)?.0)),
            FieldKind::Bytes => return Ok(FieldValue::Bytes(view.read_bytes()?)),
            FieldKind::Bin => return Ok(FieldValue::Str(view.read_bin())),
            FieldKind::Hex => return Ok(FieldValue::Str(view.read_hex()?)),
            FieldKind::Uint => view.read_uint() as i64,
            FieldKind::UintLe => view.read_uintle()? as i64,
            FieldKind::UintBe => view.read_uintbe()? as i64,
            FieldKind::Int => view.read_int(),
            FieldKind::Nbcdle => view.read_nbcdle()? as i64,
            FieldKind::Struct(_) => return Err(Error::new(Cause::Other)),
        };
        let logical = raw + self.arg;
        match &self.reference {
            Some(entity) => Ok(FieldValue::IndexInt(logical, entity.clone())),
            None => Ok(FieldValue::Int(logical)),
        }
    }

    /// Write `value` (already resolved to an integer for `ref` fields) into `view`.
    pub fn write(&self, view: &BitView, value: &FieldValue) -> Result<()> {
        match &self.kind {
            FieldKind::Str(tbl) => {
                let s = value
                    .as_str()
                    .ok_or_else(|| Error::new(Cause::BadValue(self.id.clone(), value.to_string())))?;
                view.write_str(s, tbl)?;
            }
            FieldKind::StrZ(tbl) => {
                let s = value
                    .as_str()
                    .ok_or_else(|| Error::new(Cause::BadValue(self.id.clone(), value.to_string())))?;
                view.write_strz(s, tbl)?;
            }
            FieldKind::Bytes => {
                if let FieldValue::Bytes(b) = value {
                    view.write_bytes(b)?;
                } else {
                    return Err(Error::new(Cause::BadValue(self.id.clone(), value.to_string())));
                }
            }
            FieldKind::Bin => {
                let s = value
                    .as_str()
                    .ok_or_else(|| Error::new(Cause::BadValue(self.id.clone(), value.to_string())))?;
                view.write_bin(s);
            }
            FieldKind::Hex => {
                let s = value
                    .as_str()
                    .ok_or_else(|| Error::new(Cause::BadValue(self.id.clone(), value.to_string())))?;
                view.write_hex(s)?;
            }
            FieldKind::Uint => {
                let n = value
                    .as_int()
                    .ok_or_else(|| Error::new(Cause::BadValue(self.id.clone(), value.to_string())))?;
                view.write_uint((n - self.arg) as u64);
            }
            FieldKind::UintLe => {
                let n = value
                    .as_int()
                    .ok_or_else(|| Error::new(Cause::BadValue(self.id.clone(), value.to_string())))?;
                view.write_uintle((n - self.arg) as u64)?;
            }
            FieldKind::UintBe => {
                let n = value
                    .as_int()
                    .ok_or_else(|| Error::new(Cause::BadValue(self.id.clone(), value.to_string())))?;
                view.write_uintbe((n - self.arg) as u64)?;
            }
            FieldKind::Int => {
                let n = value
                    .as_int()
                    .ok_or_else(|| Error::new(Cause::BadValue(self.id.clone(), value.to_string())))?;
                view.write_int(n - self.arg);
            }
            FieldKind::Nbcdle => {
                let n = value
                    .as_int()
                    .ok_or_else(|| Error::new(Cause::BadValue(self.id.clone(), value.to_string())))?;
                view.write_nbcdle((n - self.arg) as u64)?;
            }
            FieldKind::Struct(_) => return Err(Error::new(Cause::Other)),
        }
        Ok(())
    }

    /// Render this field as hex if `display` calls for it.
    pub fn format(&self, value: &FieldValue) -> String {
        match (&self.display, value) {
            (Display_::Hex, FieldValue::Int(n)) | (Display_::Hex, FieldValue::IndexInt(n, _)) => {
                format!("{:#x}", n)
            }
            (Display_::Pointer, FieldValue::Int(n)) | (Display_::Pointer, FieldValue::IndexInt(n, _)) => {
                format!("{:#x}", n)
            }
            _ => value.to_string(),
        }
    }

    /// Parse a tabular cell back into a [`FieldValue`] appropriate to this field's kind.
    pub fn parse(&self, cell: &str) -> Result<FieldValue> {
        match &self.kind {
            FieldKind::Str(_) | FieldKind::StrZ(_) | FieldKind::Bin | FieldKind::Hex => {
                Ok(FieldValue::Str(cell.to_string()))
            }
            FieldKind::Bytes => {
                let bytes: std::result::Result<Vec<u8>, _> = (0..cell.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&cell[i..i + 2], 16))
                    .collect();
                Ok(FieldValue::Bytes(
                    bytes.map_err(|_| Error::new(Cause::BadValue(self.id.clone(), cell.to_string())))?,
                ))
            }
            _ => {
                let trimmed = cell.trim();
                let n = if let Some(hex) = trimmed.strip_prefix("0x") {
                    i64::from_str_radix(hex, 16)
                } else {
                    trimmed.parse::<i64>()
                }
                .map_err(|_| Error::new(Cause::BadValue(self.id.clone(), cell.to_string())))?;
                match &self.reference {
                    Some(entity) => Ok(FieldValue::IndexInt(n, entity.clone())),
                    None => Ok(FieldValue::Int(n)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct EmptyCtx;
    impl Context for EmptyCtx {
        fn resolve(&self, _ident: &str) -> Option<i64> {
            None
        }
    }

    fn def(id: &str, kind: FieldKind, offset: i64, size: i64) -> FieldDef {
        FieldDef {
            id: id.to_string(),
            name: Some(id.to_string()),
            kind,
            origin: Origin::SelfOrigin,
            unit: Unit::Bytes,
            offset: FieldExpr::Static(offset),
            size: FieldExpr::Static(size),
            arg: 0,
            reference: None,
            display: Display_::None,
            order: 0,
            declaration_index: 0,
            comment: String::new(),
        }
    }

    #[test]
    fn int_read_write_roundtrip() {
        let buf = BitView::from_bytes(vec![0, 0]);
        let f = def("hp", FieldKind::UintBe, 0, 2);
        let ctx = EmptyCtx;
        let view = f.view(&buf, &buf, &ctx, &|_| None).unwrap();
        f.write(&view, &FieldValue::Int(300)).unwrap();
        assert_eq!(f.read(&view).unwrap(), FieldValue::Int(300));
    }

    #[test]
    fn arg_offsets_logical_value() {
        let buf = BitView::from_bytes(vec![0]);
        let mut f = def("lvl", FieldKind::Uint, 0, 1);
        f.unit = Unit::Bytes;
        f.arg = 1;
        let ctx = EmptyCtx;
        let view = f.view(&buf, &buf, &ctx, &|_| None).unwrap();
        view.write_uint(4);
        assert_eq!(f.read(&view).unwrap(), FieldValue::Int(5));
    }

    #[test]
    fn hashmap_context_resolves_sibling() {
        struct MapCtx(HashMap<String, i64>);
        impl Context for MapCtx {
            fn resolve(&self, ident: &str) -> Option<i64> {
                self.0.get(ident).copied()
            }
        }
        let mut m = HashMap::new();
        m.insert("hdrsize".to_string(), 16);
        let ctx = MapCtx(m);
        let f = FieldDef {
            offset: FieldExpr::parse("hdrsize").unwrap(),
            ..def("body", FieldKind::Bytes, 0, 4)
        };
        let buf = BitView::from_bytes(vec![0; 32]);
        let view = f.view(&buf, &buf, &ctx, &|_| None).unwrap();
        assert_eq!(view.bytepos().unwrap(), 16);
    }
}
