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
//! romtool
//!
//! # Introduction
//!
//! A data-driven toolkit for editing retro console ROM images (NES, SNES, GBA). Rather than
//! hand-rolling a parser for each game, the layout of a ROM's data -- its tables of monsters,
//! items, text, and so on -- is described once in a "map": a directory of YAML and tab-separated
//! files. This crate reads a map, binds it to a ROM image, and exposes the result as ordinary
//! rows and fields: you can dump them to TSV, edit the TSV in a spreadsheet, load it back, and
//! produce a patch containing just the bytes that changed.
//!
//! This crate does not implement a full disassembler, nor does it attempt to understand game
//! logic; it understands *layout*, the way its author's earlier database-reverse-engineering
//! work did for other inscrutable binary formats.
//!
//! # Discussion
//!
//! ## Views and Buffers
//!
//! Every read and write in this crate ultimately goes through a [`bitview::BitView`]: a
//! bit-addressable slice over a buffer shared (via `Rc<RefCell<_>>`) with every other view into
//! the same ROM. There is no tree of parent/child views; a view is just `(buffer, start, len)`,
//! and slicing one view produces another cheap, independent handle onto the same bytes. Writes
//! through any view are immediately visible through any other view over the same bytes.
//!
//! ## Map Directory Layout
//!
//! A map directory has the following members, all optional except `meta.yaml`:
//!
//! ```ignore
//!     meta.yaml           game name, canonical file size/hash, hook registration
//!     texttables/*.tbl    byte <-> string codecs for in-game text
//!     enums/*.yaml        named integer constants
//!     bitfields/*.tsv     single-bit struct definitions (flags) rendered as letter-bitmaps
//!     structs/*.tsv       general struct definitions (a monster, an item, ...)
//!     rom.tsv             table declarations: where each struct/primitive sequence lives
//!     tests.tsv           assertions a correctly-loaded ROM should satisfy
//!     ext/*               built-in changesets/patches the map author ships with the map
//! ```
//!
//! Structs and bitfields are both tab-separated files with one row per field:
//!
//! ```ignore
//!     id      name    type     offset  size  unit  arg  ref  display  order  comment
//! ```
//!
//! `offset` and `size` are small arithmetic expressions (see [`expr`]), not bare integers, so a
//! field's location can depend on another field's value (a length-prefixed string, say).
//!
//! ## Tables, Entities, and Sets
//!
//! A [`table::Table`] is a located, counted sequence of one type -- all primitives or all one
//! struct. `rom.tsv` rows that share a `set` column are bound together into a
//! [`entity::EntityList`]: one row of `rom.tsv` might be the monsters' stat block, another their
//! names, a third their sprite pointers, and all three read and write like columns of a single
//! table of "monsters".
//!
//! ## Identification and Patching
//!
//! A freshly opened [`rom::Rom`] is typed against the binary header conventions of the consoles
//! this crate knows about (see [`rom::detect`]), and its current bytes are kept alongside a copy
//! of the bytes as first loaded. [`rom::Rom::make_patch`] diffs the two to produce a
//! [`patch::Patch`], which can be serialized as binary IPS or textual IPST for distribution.
//!
//! [`changeset`] applies a nested YAML/JSON edit description directly to a `Rom`, the way a map
//! author would otherwise type edits into a TSV by hand.

pub mod bitview;
pub mod changeset;
pub mod entity;
pub mod expr;
pub mod field;
pub mod patch;
pub mod rom;
pub mod rommap;
pub mod structure;
pub mod table;
pub mod texttable;

use parse_display::Display;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       crate-level error                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Display)]
pub enum Cause {
    /// An error in another module took place during this operation-- cf. source.
    #[display("Another module's error-- cf. source.")]
    Other,
}

/// Unifies every module's error type for callers working at the `Rom` level rather than against
/// a single module -- the same shape as each module's own `Error`, one level up.
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

macro_rules! from_module_error {
    ($t:ty) => {
        impl std::convert::From<$t> for Error {
            fn from(err: $t) -> Self {
                Error {
                    cause: Cause::Other,
                    source: Some(Box::new(err)),
                    trace: Some(backtrace::Backtrace::new()),
                }
            }
        }
    };
}

from_module_error!(bitview::Error);
from_module_error!(texttable::Error);
from_module_error!(expr::Error);
from_module_error!(field::Error);
from_module_error!(structure::Error);
from_module_error!(table::Error);
from_module_error!(entity::Error);
from_module_error!(rommap::Error);
from_module_error!(rom::Error);
from_module_error!(patch::Error);
from_module_error!(changeset::Error);

pub type Result<T> = std::result::Result<T, Error>;

/// Open a ROM file against a map directory in one step: load the map, then construct the `Rom`.
pub fn open(rom_path: impl AsRef<std::path::Path>, map_dir: impl AsRef<std::path::Path>) -> Result<rom::Rom> {
    let map = rommap::RomMap::load(map_dir)?;
    Ok(rom::Rom::open(rom_path, map)?)
}
