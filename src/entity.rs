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
//! A named bundle of parallel [`Table`]s of identical length, exposing a union of columns per
//! row.

use crate::expr::Context;
use crate::field::FieldValue;
use crate::table::{ItemType, Table};

use parse_display::Display;

use std::cell::RefCell;
use std::collections::HashMap;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           error type                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Display)]
pub enum Cause {
    #[display("An error in another crate or module-- cf. source.")]
    Other,
    #[display("tables in entity list {0:?} have unequal lengths: {1} vs {2}")]
    LengthMismatch(String, usize, usize),
    #[display("column {0:?} is contributed by more than one table in entity list {1:?}")]
    DuplicateColumn(String, String),
    #[display("entity index {0} out of range (length {1})")]
    OutOfRange(usize, usize),
    #[display("no column named {0:?} on entity {1}")]
    NoSuchColumn(String, usize),
    #[display("no entity named {0:?} in set {1:?}")]
    NotFound(String, String),
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

impl std::convert::From<crate::table::Error> for Error {
    fn from(err: crate::table::Error) -> Self {
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
//                                           EntityList                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A named bundle of one or more parallel tables of identical length.
pub struct EntityList {
    pub set: String,
    pub tables: Vec<Table>,
    /// field-id/label/table-name -> index into `tables` that owns that column.
    columns: HashMap<String, usize>,
    /// Memoization scope for `locate`, installed by [`EntityList::cached_searches`].
    search_cache: RefCell<Option<HashMap<String, usize>>>,
}

impl EntityList {
    pub fn new(set: impl Into<String>, tables: Vec<Table>) -> Result<EntityList> {
        let set = set.into();
        if let Some(first) = tables.first() {
            let len = first.len();
            for t in &tables {
                if t.len() != len {
                    return Err(Error::new(Cause::LengthMismatch(set, len, t.len())));
                }
            }
        }
        let mut columns = HashMap::new();
        for (ti, t) in tables.iter().enumerate() {
            let keys: Vec<String> = match &t.item_type_columns() {
                Some(names) => names.clone(),
                None => vec![t.name.clone().unwrap_or_else(|| t.id.clone())],
            };
            for key in keys {
                if columns.insert(key.clone(), ti).is_some() {
                    return Err(Error::new(Cause::DuplicateColumn(key, set)));
                }
            }
        }
        Ok(EntityList {
            set,
            tables,
            columns,
            search_cache: RefCell::new(None),
        })
    }

    pub fn len(&self) -> usize {
        self.tables.first().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The full ordered union of columns this entity list exposes, across every table it binds:
    /// the field literally named `name` first, then ordinary structural fields in display
    /// order, then slop/pointer/unknown/flag fields last -- mirroring
    /// [`crate::field::FieldDef::sort_key`] across table boundaries, not just within one struct.
    /// A primitive table contributes its own name/id as a single column, ordered as though it
    /// were itself such a field.
    pub fn columns(&self) -> Vec<String> {
        enum Entry<'a> {
            Field(&'a crate::field::FieldDef),
            Table(usize, String),
        }
        let mut entries: Vec<Entry> = Vec::new();
        for (ti, t) in self.tables.iter().enumerate() {
            match t.item_type() {
                ItemType::Struct(def) => entries.extend(def.fields.iter().map(Entry::Field)),
                ItemType::Primitive(_) => {
                    entries.push(Entry::Table(ti, t.name.clone().unwrap_or_else(|| t.id.clone())))
                }
            }
        }
        entries.sort_by_key(|e| match e {
            Entry::Field(f) => f.sort_key(),
            Entry::Table(ti, name) => {
                let lower = name.to_lowercase();
                (!(lower == "name"), false, false, lower.contains("unknown"), false, 0, *ti)
            }
        });
        entries
            .into_iter()
            .map(|e| match e {
                Entry::Field(f) => f.name.clone().unwrap_or_else(|| f.id.clone()),
                Entry::Table(_, name) => name,
            })
            .collect()
    }

    pub fn entity(&self, i: usize) -> Result<Entity<'_>> {
        if i >= self.len() {
            return Err(Error::new(Cause::OutOfRange(i, self.len())));
        }
        Ok(Entity { list: self, index: i })
    }

    /// Look up the index of the entity whose `name` column equals `name`, memoizing the result
    /// for the duration of an active [`cached_searches`](Self::cached_searches) scope.
    pub fn locate(&self, name: &str, ctx: &dyn Context) -> Result<usize> {
        if let Some(cache) = self.search_cache.borrow().as_ref() {
            if let Some(&i) = cache.get(name) {
                return Ok(i);
            }
        }
        for (ti, t) in self.tables.iter().enumerate() {
            if matches!(t.item_type(), ItemType::Struct(_)) {
                if let Ok(idx) = t.locate(name, ctx) {
                    if let Some(cache) = self.search_cache.borrow_mut().as_mut() {
                        cache.insert(name.to_string(), idx);
                    }
                    let _ = ti;
                    return Ok(idx);
                }
            }
        }
        Err(Error::new(Cause::NotFound(name.to_string(), self.set.clone())))
    }

    /// Install a scoped memoization cache for `locate`; cleared on drop of the returned guard.
    pub fn cached_searches(&self) -> CachedSearches<'_> {
        *self.search_cache.borrow_mut() = Some(HashMap::new());
        CachedSearches { list: self }
    }
}

/// RAII guard clearing an [`EntityList`]'s search-memoization cache on scope exit.
pub struct CachedSearches<'a> {
    list: &'a EntityList,
}

impl Drop for CachedSearches<'_> {
    fn drop(&mut self) {
        *self.list.search_cache.borrow_mut() = None;
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Entity                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Row `#i` across an [`EntityList`]'s parallel tables.
pub struct Entity<'a> {
    list: &'a EntityList,
    index: usize,
}

impl Entity<'_> {
    pub fn get(&self, column: &str, ctx: &dyn Context) -> Result<FieldValue> {
        let ti = *self
            .list
            .columns
            .get(column)
            .ok_or_else(|| Error::new(Cause::NoSuchColumn(column.to_string(), self.index)))?;
        let t = &self.list.tables[ti];
        match t.item_type() {
            ItemType::Struct(_) => {
                let s = t.get_struct(self.index, ctx)?;
                Ok(s.get_by_label(column, ctx).or_else(|_| s.get(column, ctx))?)
            }
            ItemType::Primitive(_) => Ok(t.get_primitive(self.index, ctx)?),
        }
    }

    pub fn set(&self, column: &str, value: &FieldValue, ctx: &dyn Context) -> Result<()> {
        let ti = *self
            .list
            .columns
            .get(column)
            .ok_or_else(|| Error::new(Cause::NoSuchColumn(column.to_string(), self.index)))?;
        let t = &self.list.tables[ti];
        match t.item_type() {
            ItemType::Struct(_) => {
                let s = t.get_struct(self.index, ctx)?;
                if s.set_by_label(column, value, ctx).is_err() {
                    s.set(column, value, ctx)?;
                }
                Ok(())
            }
            ItemType::Primitive(_) => Ok(t.set_primitive(self.index, value, ctx)?),
        }
    }

    /// Batch-write a mapping of column -> value, grouped by underlying table (one table lookup
    /// per table, not per field).
    pub fn update(&self, values: &HashMap<String, FieldValue>, ctx: &dyn Context) -> Result<()> {
        let mut by_table: HashMap<usize, Vec<(&str, &FieldValue)>> = HashMap::new();
        for (col, val) in values {
            if let Some(&ti) = self.list.columns.get(col) {
                by_table.entry(ti).or_default().push((col.as_str(), val));
            }
        }
        for (ti, cols) in by_table {
            let t = &self.list.tables[ti];
            match t.item_type() {
                ItemType::Struct(_) => {
                    let s = t.get_struct(self.index, ctx)?;
                    for (col, val) in cols {
                        if s.set_by_label(col, val, ctx).is_err() {
                            s.set(col, val, ctx)?;
                        }
                    }
                }
                ItemType::Primitive(_) => {
                    if let Some((_, val)) = cols.first() {
                        t.set_primitive(self.index, val, ctx)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitview::{BitView, Unit};
    use crate::field::FieldKind;
    use crate::table::Index;

    struct NoCtx;
    impl Context for NoCtx {
        fn resolve(&self, _: &str) -> Option<i64> {
            None
        }
    }

    #[test]
    fn entity_list_rejects_length_mismatch() {
        let buf = BitView::from_bytes(vec![0; 16]);
        let a = Table::new(
            "a",
            None,
            buf.clone(),
            buf.clone(),
            ItemType::Primitive(FieldKind::UintBe),
            Index::Fixed { offset: 0, count: 4, stride: 2 },
            Unit::Bytes,
            None,
        )
        .unwrap();
        let b = Table::new(
            "b",
            None,
            buf.clone(),
            buf,
            ItemType::Primitive(FieldKind::UintBe),
            Index::Fixed { offset: 0, count: 3, stride: 2 },
            Unit::Bytes,
            None,
        )
        .unwrap();
        assert!(EntityList::new("monsters", vec![a, b]).is_err());
    }

    #[test]
    fn columns_includes_primitive_tables_with_name_first() {
        use crate::expr::FieldExpr;
        use crate::field::{Display_, Origin};
        use crate::structure::StructDef;
        use std::rc::Rc;

        let name_field = crate::field::FieldDef {
            id: "fname".to_string(),
            name: Some("name".to_string()),
            kind: FieldKind::UintBe,
            origin: Origin::SelfOrigin,
            unit: Unit::Bytes,
            offset: FieldExpr::Static(0),
            size: FieldExpr::Static(4),
            arg: 0,
            reference: None,
            display: Display_::None,
            order: 0,
            declaration_index: 0,
            comment: String::new(),
        };
        let hp_field = crate::field::FieldDef {
            id: "hp".to_string(),
            name: Some("hp".to_string()),
            kind: FieldKind::UintBe,
            origin: Origin::SelfOrigin,
            unit: Unit::Bytes,
            offset: FieldExpr::Static(4),
            size: FieldExpr::Static(2),
            arg: 0,
            reference: None,
            display: Display_::None,
            order: 0,
            declaration_index: 1,
            comment: String::new(),
        };
        let def = Rc::new(StructDef::new("Monster", vec![name_field, hp_field]).unwrap());

        let buf = BitView::from_bytes(vec![0; 12]);
        let stats = Table::new(
            "stats",
            None,
            buf.clone(),
            buf.clone(),
            ItemType::Struct(def),
            Index::Fixed { offset: 0, count: 2, stride: 6 },
            Unit::Bytes,
            None,
        )
        .unwrap();
        let level = Table::new(
            "level",
            Some("level".to_string()),
            buf.clone(),
            buf,
            ItemType::Primitive(FieldKind::UintBe),
            Index::Fixed { offset: 0, count: 2, stride: 1 },
            Unit::Bytes,
            None,
        )
        .unwrap();
        let list = EntityList::new("monsters", vec![stats, level]).unwrap();
        assert_eq!(
            list.columns(),
            vec!["name".to_string(), "hp".to_string(), "level".to_string()]
        );
    }

    #[test]
    fn entity_get_set_roundtrip() {
        let buf = BitView::from_bytes(vec![0; 8]);
        let hp = Table::new(
            "hp",
            Some("hp".to_string()),
            buf.clone(),
            buf.clone(),
            ItemType::Primitive(FieldKind::UintBe),
            Index::Fixed { offset: 0, count: 4, stride: 2 },
            Unit::Bytes,
            None,
        )
        .unwrap();
        let list = EntityList::new("monsters", vec![hp]).unwrap();
        let ctx = NoCtx;
        {
            let e = list.entity(0).unwrap();
            e.set("hp", &FieldValue::Int(99), &ctx).unwrap();
        }
        let e = list.entity(0).unwrap();
        assert_eq!(e.get("hp", &ctx).unwrap(), FieldValue::Int(99));
    }
}
