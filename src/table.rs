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
//! Sequences of items -- primitives or structures -- located either by a fixed stride/count or
//! by a sibling index table of offsets.

use crate::bitview::{BitView, Unit};
use crate::expr::Context;
use crate::field::{FieldKind, FieldValue};
use crate::structure::{Structure, StructDef};

use parse_display::Display;

use std::rc::Rc;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           error type                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Display)]
pub enum Cause {
    #[display("An error in another crate or module-- cf. source.")]
    Other,
    #[display("table index {0} out of range (length {1})")]
    OutOfRange(usize, usize),
    #[display("no item named {0:?} in table {1:?}")]
    NotFound(String, String),
    #[display("table {0:?} has no declared item size, no structural size, and no indexed stride to fall back on")]
    NoItemSize(String),
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

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Index                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Either a fixed `(offset, count, stride)` or a materialized list of per-item offsets drawn
/// from a sibling table of integers.
#[derive(Debug, Clone)]
pub enum Index {
    Fixed { offset: i64, count: usize, stride: i64 },
    Offsets(Vec<i64>),
}

impl Index {
    pub fn len(&self) -> usize {
        match self {
            Index::Fixed { count, .. } => *count,
            Index::Offsets(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bit offset (relative to the table's own `offset`, in the table's `unit`) at which item
    /// `i` begins.
    pub fn item_offset(&self, i: usize) -> i64 {
        match self {
            Index::Fixed { offset, stride, .. } => offset + stride * i as i64,
            Index::Offsets(v) => v[i],
        }
    }

    pub fn stride(&self) -> Option<i64> {
        match self {
            Index::Fixed { stride, .. } => Some(*stride),
            Index::Offsets(_) => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Table                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub enum ItemType {
    Primitive(FieldKind),
    Struct(Rc<StructDef>),
}

/// A located, counted sequence of items of one type.
pub struct Table {
    pub id: String,
    pub name: Option<String>,
    view: BitView,
    root: BitView,
    item_type: ItemType,
    index: Index,
    unit: Unit,
    /// Declared per-item size, in `unit`s, if given explicitly in the map.
    declared_size: Option<i64>,
}

impl Table {
    pub fn new(
        id: impl Into<String>,
        name: Option<String>,
        view: BitView,
        root: BitView,
        item_type: ItemType,
        index: Index,
        unit: Unit,
        declared_size: Option<i64>,
    ) -> Result<Table> {
        let t = Table {
            id: id.into(),
            name,
            view,
            root,
            item_type,
            index,
            unit,
            declared_size,
        };
        t.item_size_bits(&NoCtx)?;
        Ok(t)
    }

    /// Priority order: declared `size` -> structural size -> index stride -> error.
    fn item_size_bits(&self, ctx: &dyn Context) -> Result<i64> {
        if let Some(sz) = self.declared_size {
            return Ok(sz * self.unit.bits());
        }
        if let ItemType::Struct(def) = &self.item_type {
            return Ok(def.size_bits(ctx)?);
        }
        if let Some(stride) = self.index.stride() {
            if stride > 0 {
                return Ok(stride * self.unit.bits());
            }
        }
        Err(Error::new(Cause::NoItemSize(self.id.clone())))
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn item_type(&self) -> &ItemType {
        &self.item_type
    }

    /// The column keys this table contributes to an owning [`crate::entity::EntityList`]: a
    /// struct table contributes each field's id/label, a primitive table contributes its own
    /// name.
    pub fn item_type_columns(&self) -> Option<Vec<String>> {
        match &self.item_type {
            ItemType::Struct(def) => Some(
                def.fields
                    .iter()
                    .map(|f| f.name.clone().unwrap_or_else(|| f.id.clone()))
                    .collect(),
            ),
            ItemType::Primitive(_) => None,
        }
    }

    fn item_view(&self, i: usize, ctx: &dyn Context) -> Result<BitView> {
        if i >= self.len() {
            return Err(Error::new(Cause::OutOfRange(i, self.len())));
        }
        let size_bits = self.item_size_bits(ctx)?;
        let start_bits = self.index.item_offset(i) * self.unit.bits();
        let end_bits = start_bits + size_bits;
        Ok(self.view.slice(
            Some(start_bits),
            Some(end_bits),
            Unit::Bits,
        )?)
    }

    /// Read item `i` as a primitive value. Fails if this table holds structures.
    pub fn get_primitive(&self, i: usize, ctx: &dyn Context) -> Result<FieldValue> {
        let kind = match &self.item_type {
            ItemType::Primitive(k) => k,
            ItemType::Struct(_) => return Err(Error::new(Cause::Other)),
        };
        let view = self.item_view(i, ctx)?;
        let field = synth_field(kind.clone(), self.unit);
        Ok(field.read(&view)?)
    }

    pub fn set_primitive(&self, i: usize, value: &FieldValue, ctx: &dyn Context) -> Result<()> {
        let kind = match &self.item_type {
            ItemType::Primitive(k) => k,
            ItemType::Struct(_) => return Err(Error::new(Cause::Other)),
        };
        let view = self.item_view(i, ctx)?;
        let field = synth_field(kind.clone(), self.unit);
        Ok(field.write(&view, value)?)
    }

    /// Bind item `i` as a [`Structure`]. Fails if this table holds primitives.
    pub fn get_struct(&self, i: usize, ctx: &dyn Context) -> Result<Structure> {
        let def = match &self.item_type {
            ItemType::Struct(d) => Rc::clone(d),
            ItemType::Primitive(_) => return Err(Error::new(Cause::Other)),
        };
        let view = self.item_view(i, ctx)?;
        Ok(Structure::new(def, view, self.root.clone()))
    }

    /// Find the index of the first item whose `name` field equals `name`. Only meaningful for
    /// struct tables with a field labeled `name`.
    pub fn locate(&self, name: &str, ctx: &dyn Context) -> Result<usize> {
        if let ItemType::Struct(_) = &self.item_type {
            for i in 0..self.len() {
                let s = self.get_struct(i, ctx)?;
                if let Ok(FieldValue::Str(n)) = s.get_by_label("name", ctx) {
                    if n == name {
                        return Ok(i);
                    }
                }
            }
        }
        Err(Error::new(Cause::NotFound(name.to_string(), self.id.clone())))
    }
}

struct NoCtx;
impl Context for NoCtx {
    fn resolve(&self, _ident: &str) -> Option<i64> {
        None
    }
}

fn synth_field(kind: FieldKind, unit: Unit) -> crate::field::FieldDef {
    crate::field::FieldDef {
        id: "item".to_string(),
        name: None,
        kind,
        origin: crate::field::Origin::SelfOrigin,
        unit,
        offset: crate::expr::FieldExpr::Static(0),
        size: crate::expr::FieldExpr::Static(-1),
        arg: 0,
        reference: None,
        display: crate::field::Display_::None,
        order: 0,
        declaration_index: 0,
        comment: String::new(),
    }
}

/// Build a [`Table`]'s [`Index`] by materializing an integer-valued sibling table of offsets.
pub fn offsets_from_index_table(index_table: &Table, ctx: &dyn Context) -> Result<Index> {
    let mut v = Vec::with_capacity(index_table.len());
    for i in 0..index_table.len() {
        let val = index_table.get_primitive(i, ctx)?;
        v.push(val.as_int().ok_or_else(|| Error::new(Cause::Other))?);
    }
    Ok(Index::Offsets(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoCtx2;
    impl Context for NoCtx2 {
        fn resolve(&self, _: &str) -> Option<i64> {
            None
        }
    }

    #[test]
    fn fixed_table_primitive_roundtrip() {
        let buf = BitView::from_bytes(vec![0; 8]);
        let t = Table::new(
            "hp",
            None,
            buf.clone(),
            buf,
            ItemType::Primitive(FieldKind::UintBe),
            Index::Fixed { offset: 0, count: 4, stride: 2 },
            Unit::Bytes,
            None,
        )
        .unwrap();
        let ctx = NoCtx2;
        t.set_primitive(0, &FieldValue::Int(10), &ctx).unwrap();
        t.set_primitive(1, &FieldValue::Int(20), &ctx).unwrap();
        assert_eq!(t.get_primitive(0, &ctx).unwrap(), FieldValue::Int(10));
        assert_eq!(t.get_primitive(1, &ctx).unwrap(), FieldValue::Int(20));
        assert_eq!(t.len(), 4);
    }

    #[test]
    fn missing_item_size_fails_at_construction() {
        let buf = BitView::from_bytes(vec![0; 8]);
        let res = Table::new(
            "bad",
            None,
            buf.clone(),
            buf,
            ItemType::Primitive(FieldKind::Bytes),
            Index::Offsets(vec![0, 4]),
            Unit::Bytes,
            None,
        );
        assert!(res.is_err());
    }

    #[test]
    fn out_of_range_index_fails() {
        let buf = BitView::from_bytes(vec![0; 4]);
        let t = Table::new(
            "t",
            None,
            buf.clone(),
            buf,
            ItemType::Primitive(FieldKind::Uint),
            Index::Fixed { offset: 0, count: 2, stride: 1 },
            Unit::Bytes,
            None,
        )
        .unwrap();
        assert!(t.get_primitive(5, &NoCtx2).is_err());
    }
}
