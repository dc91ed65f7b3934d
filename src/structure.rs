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
//! Named ordered collections of fields that read/write a region of a [`BitView`].
//!
//! Defining a [`StructDef`] registers it by name in a [`TypeRegistry`] (owned per-`RomMap`, not
//! a process-global singleton, per the design note). A [`Structure`] binds a `StructDef` to a
//! concrete view and exposes get/set by field id or by label, display-ordered iteration, and
//! tabular row round-tripping.

use crate::expr::Context;
use crate::field::{Display_, FieldDef, FieldValue};

use parse_display::Display;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::bitview::BitView;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           error type                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Display)]
pub enum Cause {
    #[display("An error in another crate or module-- cf. source.")]
    Other,
    #[display("no field with id {0:?} in struct {1:?}")]
    NoSuchId(String, String),
    #[display("no field labeled {0:?} in struct {1:?}")]
    NoSuchLabel(String, String),
    #[display("duplicate field id or label {0:?} defining struct {1:?}")]
    Duplicate(String, String),
    #[display("field id {0:?} shadows a built-in attribute")]
    ShadowsBuiltin(String),
    #[display("struct {0:?} is already registered")]
    AlreadyRegistered(String),
    #[display("no struct type registered under {0:?}")]
    UnknownStruct(String),
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

impl std::convert::From<crate::field::Error> for Error {
    fn from(err: crate::field::Error) -> Self {
        Error {
            cause: Cause::Other,
            source: Some(Box::new(err)),
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

const BUILTIN_ATTRS: &[&str] = &["name", "size", "fields"];

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            StructDef                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The static shape of a struct type: its name and its ordered fields.
#[derive(Debug)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
    /// True for a BitField: all fields are single-bit and the string form is a letter-bitmap.
    pub is_bitfield: bool,
}

impl StructDef {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDef>) -> Result<StructDef> {
        let name = name.into();
        let mut seen_ids = std::collections::HashSet::new();
        let mut seen_labels = std::collections::HashSet::new();
        for f in &fields {
            if BUILTIN_ATTRS.contains(&f.id.as_str()) {
                return Err(Error::new(Cause::ShadowsBuiltin(f.id.clone())));
            }
            if !seen_ids.insert(f.id.clone()) {
                return Err(Error::new(Cause::Duplicate(f.id.clone(), name)));
            }
            if let Some(label) = &f.name {
                if !seen_labels.insert(label.clone()) {
                    return Err(Error::new(Cause::Duplicate(label.clone(), name)));
                }
            }
        }
        let is_bitfield = fields
            .iter()
            .all(|f| matches!(f.kind, crate::field::FieldKind::Bin) && matches!(f.size, crate::expr::FieldExpr::Static(1)));
        Ok(StructDef {
            name,
            fields,
            is_bitfield,
        })
    }

    pub fn size_bits(&self, ctx: &dyn Context) -> crate::field::Result<i64> {
        let mut total = 0;
        for f in &self.fields {
            total += f.size.eval(ctx)? * (f.unit.bits());
        }
        Ok(total)
    }

    fn field_by_id(&self, id: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.id == id)
    }

    fn field_by_label(&self, label: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name.as_deref() == Some(label))
    }

    /// Fields in display order: see [`FieldDef::sort_key`].
    pub fn display_order(&self) -> Vec<&FieldDef> {
        let mut v: Vec<&FieldDef> = self.fields.iter().collect();
        v.sort_by_key(|f| f.sort_key());
        v
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          TypeRegistry                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An owned, per-`RomMap` registry of struct types -- replaces the original's process-global
/// registry per the design note.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    structs: RefCell<HashMap<String, Rc<StructDef>>>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry {
            structs: RefCell::new(HashMap::new()),
        }
    }

    pub fn define(&self, def: StructDef) -> Result<Rc<StructDef>> {
        let mut structs = self.structs.borrow_mut();
        if structs.contains_key(&def.name) {
            return Err(Error::new(Cause::AlreadyRegistered(def.name)));
        }
        let name = def.name.clone();
        let rc = Rc::new(def);
        structs.insert(name, Rc::clone(&rc));
        Ok(rc)
    }

    pub fn get(&self, name: &str) -> Result<Rc<StructDef>> {
        self.structs
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::new(Cause::UnknownStruct(name.to_string())))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Structure                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A `StructDef` bound to a concrete view: the object you actually read and write through.
pub struct Structure {
    pub def: Rc<StructDef>,
    pub view: BitView,
    pub root: BitView,
}

impl Structure {
    pub fn new(def: Rc<StructDef>, view: BitView, root: BitView) -> Structure {
        Structure { def, view, root }
    }

    fn field_view(&self, f: &FieldDef, ctx: &dyn Context) -> Result<BitView> {
        let sv = &self.view;
        let sibling = |name: &str| self.sibling_view(name, ctx).ok();
        Ok(f.view(sv, &self.root, ctx, &sibling)?)
    }

    /// Resolve a named sibling field's view, for fields whose `origin` points at one.
    fn sibling_view(&self, name: &str, ctx: &dyn Context) -> Result<BitView> {
        let f = self
            .def
            .field_by_id(name)
            .or_else(|| self.def.field_by_label(name))
            .ok_or_else(|| Error::new(Cause::NoSuchId(name.to_string(), self.def.name.clone())))?;
        self.field_view(f, ctx)
    }

    pub fn get(&self, id: &str, ctx: &dyn Context) -> Result<FieldValue> {
        let f = self
            .def
            .field_by_id(id)
            .ok_or_else(|| Error::new(Cause::NoSuchId(id.to_string(), self.def.name.clone())))?;
        let view = self.field_view(f, ctx)?;
        Ok(f.read(&view)?)
    }

    pub fn get_by_label(&self, label: &str, ctx: &dyn Context) -> Result<FieldValue> {
        let f = self
            .def
            .field_by_label(label)
            .ok_or_else(|| Error::new(Cause::NoSuchLabel(label.to_string(), self.def.name.clone())))?;
        let view = self.field_view(f, ctx)?;
        Ok(f.read(&view)?)
    }

    pub fn set(&self, id: &str, value: &FieldValue, ctx: &dyn Context) -> Result<()> {
        let f = self
            .def
            .field_by_id(id)
            .ok_or_else(|| Error::new(Cause::NoSuchId(id.to_string(), self.def.name.clone())))?;
        let view = self.field_view(f, ctx)?;
        Ok(f.write(&view, value)?)
    }

    pub fn set_by_label(&self, label: &str, value: &FieldValue, ctx: &dyn Context) -> Result<()> {
        let f = self
            .def
            .field_by_label(label)
            .ok_or_else(|| Error::new(Cause::NoSuchLabel(label.to_string(), self.def.name.clone())))?;
        let view = self.field_view(f, ctx)?;
        Ok(f.write(&view, value)?)
    }

    /// Iterate fields (and their currently-held values) in display order.
    pub fn iter_display(&self, ctx: &dyn Context) -> Result<Vec<(&FieldDef, FieldValue)>> {
        let mut out = Vec::new();
        for f in self.def.display_order() {
            let view = self.field_view(f, ctx)?;
            out.push((f, f.read(&view)?));
        }
        Ok(out)
    }

    /// Recursively copy field values from `self` into `other`, which must share this struct type.
    pub fn copy(&self, other: &Structure, ctx: &dyn Context) -> Result<()> {
        for f in &self.def.fields {
            let v = self.get(&f.id, ctx)?;
            other.set(&f.id, &v, ctx)?;
        }
        Ok(())
    }

    /// Parse a string-keyed tabular row and write each named cell into its field.
    pub fn load(&self, row: &HashMap<String, String>, ctx: &dyn Context) -> Result<()> {
        for f in &self.def.fields {
            let key = f.name.as_deref().unwrap_or(&f.id);
            if let Some(cell) = row.get(key) {
                let value = f.parse(cell)?;
                self.set(&f.id, &value, ctx)?;
            }
        }
        Ok(())
    }

    /// Dump this struct's display-ordered fields as a tabular row.
    pub fn dump(&self, ctx: &dyn Context) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for (f, v) in self.iter_display(ctx)? {
            let key = f.name.clone().unwrap_or_else(|| f.id.clone());
            out.push((key, f.format(&v)));
        }
        Ok(out)
    }

    /// A BitField's string form: each bit's display letter, uppercased when set, lowercased
    /// when clear, in declaration order.
    pub fn bitfield_str(&self, ctx: &dyn Context) -> Result<String> {
        let mut s = String::new();
        for f in &self.def.fields {
            let view = self.field_view(f, ctx)?;
            let set = view.read_uint() != 0;
            let letter = match &f.display {
                Display_::Codec(letter) => letter.chars().next(),
                _ => None,
            }
            .unwrap_or('?');
            s.push(if set { letter.to_ascii_uppercase() } else { letter.to_ascii_lowercase() });
        }
        Ok(s)
    }

    /// Parse a BitField's letter-bitmap string back into bit values, in declaration order.
    pub fn bitfield_parse(&self, letters: &str, ctx: &dyn Context) -> Result<()> {
        for (f, ch) in self.def.fields.iter().zip(letters.chars()) {
            let view = self.field_view(f, ctx)?;
            view.write_uint(if ch.is_uppercase() { 1 } else { 0 });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::FieldExpr;
    use crate::field::{Display_, FieldKind, Origin};

    struct NoCtx;
    impl Context for NoCtx {
        fn resolve(&self, _: &str) -> Option<i64> {
            None
        }
    }

    fn simple_field(id: &str, offset: i64, size: i64) -> FieldDef {
        FieldDef {
            id: id.to_string(),
            name: Some(id.to_string()),
            kind: FieldKind::UintBe,
            origin: Origin::SelfOrigin,
            unit: crate::bitview::Unit::Bytes,
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
    fn get_set_roundtrip_and_duplicate_detection() {
        let fields = vec![simple_field("hp", 0, 2), simple_field("mp", 2, 2)];
        let def = Rc::new(StructDef::new("Monster", fields).unwrap());
        let buf = BitView::from_bytes(vec![0; 4]);
        let s = Structure::new(def, buf.clone(), buf);
        let ctx = NoCtx;
        s.set("hp", &FieldValue::Int(42), &ctx).unwrap();
        assert_eq!(s.get("hp", &ctx).unwrap(), FieldValue::Int(42));
        assert!(s.get("nope", &ctx).is_err());

        let dup = vec![simple_field("hp", 0, 2), simple_field("hp", 2, 2)];
        assert!(StructDef::new("Bad", dup).is_err());
    }

    #[test]
    fn sibling_origin_resolves_within_struct() {
        let raw = simple_field("raw", 0, 1);
        let mut alias = simple_field("alias", 0, 1);
        alias.origin = Origin::Sibling("raw".to_string());
        alias.kind = FieldKind::Hex;
        let def = Rc::new(StructDef::new("Aliased", vec![raw, alias]).unwrap());
        let buf = BitView::from_bytes(vec![0; 1]);
        let s = Structure::new(def, buf.clone(), buf);
        let ctx = NoCtx;
        s.set("raw", &FieldValue::Int(0x2a), &ctx).unwrap();
        assert_eq!(s.get("alias", &ctx).unwrap(), FieldValue::Str("2a".to_string()));
    }

    #[test]
    fn bitfield_str_uses_display_letter() {
        let mut poison = simple_field("f0", 0, 1);
        poison.kind = FieldKind::Bin;
        poison.unit = crate::bitview::Unit::Bits;
        poison.size = FieldExpr::Static(1);
        poison.display = Display_::Codec("p".to_string());
        let mut burn = simple_field("f1", 1, 1);
        burn.kind = FieldKind::Bin;
        burn.unit = crate::bitview::Unit::Bits;
        burn.size = FieldExpr::Static(1);
        burn.display = Display_::Codec("b".to_string());
        let def = Rc::new(StructDef::new("Status", vec![poison, burn]).unwrap());
        let buf = BitView::from_bytes(vec![0; 1]);
        let s = Structure::new(def, buf.clone(), buf);
        let ctx = NoCtx;
        s.set("f0", &FieldValue::Int(1), &ctx).unwrap();
        s.set("f1", &FieldValue::Int(0), &ctx).unwrap();
        assert_eq!(s.bitfield_str(&ctx).unwrap(), "Pb");
    }

    #[test]
    fn registry_rejects_redefinition() {
        let reg = TypeRegistry::new();
        reg.define(StructDef::new("A", vec![simple_field("x", 0, 1)]).unwrap())
            .unwrap();
        assert!(reg
            .define(StructDef::new("A", vec![simple_field("y", 0, 1)]).unwrap())
            .is_err());
    }
}
