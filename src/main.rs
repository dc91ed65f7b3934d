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

// If I try to document this file at this level, it collides with the corresponding docs in lib.rs
// when I run `cargo doc`. This is a known [issue](https://github.com/rust-lang/cargo/issues/6313),
// as is the entire "src/{main,lib}.rs"
// [pattern](https://github.com/rust-lang/api-guidelines/issues/167). Oh, well. I suppose a CLI
// should be self-documenting, anyway.

use env_logger::Env;
use romtool::changeset;
use romtool::patch::Patch;
use romtool::rom::{NoHooks, Rom};
use romtool::rommap::RomMap;

use clap::{value_parser, Arg, Command};

use parse_display::Display;

use sha1::{Digest, Sha1};

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         app error type                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Display)]
enum Cause {
    /// An error in the library took place during this operation-- cf. source.
    #[display("Another crate's or module's error-- cf. source.")]
    Other,
    /// Some sort of internal logic error has occurred
    #[display(
        "An internal error has occurred; please consider filing a bug report to sp1ff@pobox.com."
    )]
    Internal,
    /// No sub-command specified
    #[display("No sub-command given.")]
    NoSubCommand,
}

#[derive(Debug, Display)]
#[display("{cause} Source (if any): {source:?} Stack trace (if any): {trace:?}")]
struct Error {
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

impl std::convert::From<romtool::Error> for Error {
    fn from(err: romtool::Error) -> Self {
        Error {
            cause: Cause::Other,
            source: Some(Box::new(err)),
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

impl std::convert::From<romtool::rom::Error> for Error {
    fn from(err: romtool::rom::Error) -> Self {
        Error {
            cause: Cause::Other,
            source: Some(Box::new(err)),
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

impl std::convert::From<romtool::rommap::Error> for Error {
    fn from(err: romtool::rommap::Error) -> Self {
        Error {
            cause: Cause::Other,
            source: Some(Box::new(err)),
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

impl std::convert::From<romtool::patch::Error> for Error {
    fn from(err: romtool::patch::Error) -> Self {
        Error {
            cause: Cause::Other,
            source: Some(Box::new(err)),
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

impl std::convert::From<romtool::changeset::Error> for Error {
    fn from(err: romtool::changeset::Error) -> Self {
        Error {
            cause: Cause::Other,
            source: Some(Box::new(err)),
            trace: Some(backtrace::Backtrace::new()),
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

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        sub-commands                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn open_rom(map_dir: &Path, rom_path: &Path) -> Result<Rom, Error> {
    let map = RomMap::load(map_dir)?;
    Ok(Rom::open(rom_path, map)?)
}

fn cmd_dump(map_dir: &Path, rom_path: &Path, out_dir: &Path, force: bool) -> Result<(), Error> {
    let rom = open_rom(map_dir, rom_path)?;
    fs::create_dir_all(out_dir)?;
    rom.dump(out_dir, force)?;
    Ok(())
}

fn cmd_build(map_dir: &Path, rom_path: &Path, tsv_dir: &Path, out_path: &Path) -> Result<(), Error> {
    let rom = open_rom(map_dir, rom_path)?;
    rom.load(tsv_dir)?;
    rom.write(out_path)?;
    Ok(())
}

fn cmd_diff(before: &Path, after: &Path, out_path: &Path, ipst: bool) -> Result<(), Error> {
    let before_bytes = fs::read(before)?;
    let after_bytes = fs::read(after)?;
    let patch = Patch::diff(&before_bytes, &after_bytes);
    if ipst {
        fs::write(out_path, patch.to_ipst(None)?)?;
    } else {
        fs::write(out_path, patch.to_ips(None)?)?;
    }
    Ok(())
}

fn cmd_apply(rom_path: &Path, patch_path: &Path, out_path: &Path) -> Result<(), Error> {
    let data = fs::read(patch_path)?;
    let patch = if patch_path.extension().and_then(|e| e.to_str()) == Some("ipst") {
        Patch::from_ipst(&String::from_utf8_lossy(&data))?
    } else {
        Patch::from_ips(&data)?
    };
    let mut bytes = fs::read(rom_path)?;
    let mut cursor = std::io::Cursor::new(&mut bytes);
    patch.apply(&mut cursor)?;
    fs::write(out_path, bytes)?;
    Ok(())
}

fn cmd_convert(in_path: &Path, out_path: &Path) -> Result<(), Error> {
    let from_ipst = in_path.extension().and_then(|e| e.to_str()) == Some("ipst");
    let to_ipst = out_path.extension().and_then(|e| e.to_str()) == Some("ipst");
    let patch = if from_ipst {
        Patch::from_ipst(&fs::read_to_string(in_path)?)?
    } else {
        Patch::from_ips(&fs::read(in_path)?)?
    };
    if to_ipst {
        fs::write(out_path, patch.to_ipst(None)?)?;
    } else {
        fs::write(out_path, patch.to_ips(None)?)?;
    }
    Ok(())
}

fn cmd_ident(rom_path: &Path) -> Result<(), Error> {
    let bytes = fs::read(rom_path)?;
    let kind = romtool::rom::detect(&bytes);
    let mut hasher = Sha1::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    println!("{}  {}  {}", hex, kind, rom_path.display());
    Ok(())
}

fn cmd_meta(map_dir: &Path) -> Result<(), Error> {
    let map = RomMap::load(map_dir)?;
    println!("name: {}", map.meta.name);
    if let Some(file) = &map.meta.file {
        println!("file: {}", file);
    }
    if let Some(sha1) = &map.meta.sha1 {
        println!("sha1: {}", sha1);
    }
    for set in map.sets() {
        println!("set: {}", set);
    }
    Ok(())
}

fn cmd_sanitize(map_dir: &Path, rom_path: &Path, out_path: &Path) -> Result<(), Error> {
    let rom = open_rom(map_dir, rom_path)?;
    rom.sanitize(&NoHooks)?;
    rom.write(out_path)?;
    Ok(())
}

fn cmd_apply_changeset(map_dir: &Path, rom_path: &Path, changeset_path: &Path, out_path: &Path) -> Result<(), Error> {
    let rom = open_rom(map_dir, rom_path)?;
    let doc = changeset::load(changeset_path)?;
    changeset::apply(&rom, &doc)?;
    rom.write(out_path)?;
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          The Big Tuna                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn build_cli() -> Command {
    Command::new("romtool")
        .version(env!("CARGO_PKG_VERSION"))
        .about("romtool -- a data-driven toolkit for editing retro console ROM images")
        .long_about(
            "Read a map directory describing a ROM's tables (monsters, items, text, ...),
bind it to a ROM image, and work with the result as ordinary rows and fields: dump them to
TSV, edit the TSV, load it back, and diff the result into a distributable patch.",
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Produce more copious output.")
                .required(false)
                .num_args(0),
        )
        .subcommand(
            Command::new("dump")
                .about("dump a ROM's tables to TSV")
                .arg(Arg::new("map").help("map directory").index(1).required(true).value_parser(value_parser!(PathBuf)))
                .arg(Arg::new("rom").help("ROM image").index(2).required(true).value_parser(value_parser!(PathBuf)))
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("folder to which TSV files shall be written")
                        .num_args(1)
                        .default_value(".")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("force")
                        .long("force")
                        .help("overwrite existing TSV files")
                        .num_args(0),
                ),
        )
        .subcommand(
            Command::new("build")
                .about("load edited TSV tables back into a ROM image")
                .arg(Arg::new("map").help("map directory").index(1).required(true).value_parser(value_parser!(PathBuf)))
                .arg(Arg::new("rom").help("ROM image").index(2).required(true).value_parser(value_parser!(PathBuf)))
                .arg(Arg::new("tables").help("folder of edited TSV files").index(3).required(true).value_parser(value_parser!(PathBuf)))
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("file to which the patched ROM shall be written")
                        .num_args(1)
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("diff")
                .about("diff two ROM images into a patch")
                .arg(Arg::new("before").help("original ROM image").index(1).required(true).value_parser(value_parser!(PathBuf)))
                .arg(Arg::new("after").help("modified ROM image").index(2).required(true).value_parser(value_parser!(PathBuf)))
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("file to which the patch shall be written")
                        .num_args(1)
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("ipst")
                        .long("ipst")
                        .help("write a textual IPST patch instead of binary IPS")
                        .num_args(0),
                ),
        )
        .subcommand(
            Command::new("apply")
                .about("apply an IPS/IPST patch to a ROM image")
                .arg(Arg::new("rom").help("ROM image").index(1).required(true).value_parser(value_parser!(PathBuf)))
                .arg(Arg::new("patch").help("patch file (.ips or .ipst)").index(2).required(true).value_parser(value_parser!(PathBuf)))
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("file to which the patched ROM shall be written")
                        .num_args(1)
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("convert")
                .about("convert a patch between IPS and IPST")
                .arg(Arg::new("input").help("source patch file").index(1).required(true).value_parser(value_parser!(PathBuf)))
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("destination patch file; extension picks the format (.ips or .ipst)")
                        .num_args(1)
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("ident")
                .about("hash-identify a ROM image")
                .arg(Arg::new("rom").help("ROM image").index(1).required(true).value_parser(value_parser!(PathBuf))),
        )
        .subcommand(
            Command::new("meta")
                .about("print a map directory's metadata")
                .arg(Arg::new("map").help("map directory").index(1).required(true).value_parser(value_parser!(PathBuf))),
        )
        .subcommand(
            Command::new("sanitize")
                .about("run a map's sanitize hooks (recompute checksums, &c) over a ROM image")
                .arg(Arg::new("map").help("map directory").index(1).required(true).value_parser(value_parser!(PathBuf)))
                .arg(Arg::new("rom").help("ROM image").index(2).required(true).value_parser(value_parser!(PathBuf)))
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("file to which the sanitized ROM shall be written")
                        .num_args(1)
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("initchg")
                .about("generate a skeleton changeset from a map (not yet implemented)")
                .arg(Arg::new("map").help("map directory").index(1).required(true).value_parser(value_parser!(PathBuf))),
        )
        .subcommand(
            Command::new("apply-changeset")
                .about("apply a YAML/JSON changeset directly to a ROM image")
                .arg(Arg::new("map").help("map directory").index(1).required(true).value_parser(value_parser!(PathBuf)))
                .arg(Arg::new("rom").help("ROM image").index(2).required(true).value_parser(value_parser!(PathBuf)))
                .arg(Arg::new("changeset").help("changeset file (.yaml or .json)").index(3).required(true).value_parser(value_parser!(PathBuf)))
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("file to which the changed ROM shall be written")
                        .num_args(1)
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(Command::new("findblocks").about("search a ROM for unused space (not yet implemented)"))
        .subcommand(Command::new("charmap").about("derive a text table from a ROM's strings (not yet implemented)"))
        .subcommand(Command::new("dirs").about("print the map search path (not yet implemented)"))
        .subcommand(Command::new("fix").about("check and repair a ROM against tests.tsv assertions (not yet implemented)"))
}

fn run() -> Result<(), Error> {
    let matches = build_cli().get_matches();

    env_logger::init_from_env(Env::default().filter_or(
        "RUST_LOG",
        if matches.get_flag("verbose") { "debug" } else { "info" },
    ));

    macro_rules! get {
        ($subm:expr, $name:expr) => {
            $subm.get_one::<PathBuf>($name).ok_or(Error::new(Cause::Internal))?
        };
    }

    if let Some(subm) = matches.subcommand_matches("dump") {
        let map = get!(subm, "map");
        let rom = get!(subm, "rom");
        let out = get!(subm, "output");
        let force = subm.get_flag("force");
        cmd_dump(map, rom, out, force)
    } else if let Some(subm) = matches.subcommand_matches("build") {
        cmd_build(get!(subm, "map"), get!(subm, "rom"), get!(subm, "tables"), get!(subm, "output"))
    } else if let Some(subm) = matches.subcommand_matches("diff") {
        cmd_diff(get!(subm, "before"), get!(subm, "after"), get!(subm, "output"), subm.get_flag("ipst"))
    } else if let Some(subm) = matches.subcommand_matches("apply") {
        cmd_apply(get!(subm, "rom"), get!(subm, "patch"), get!(subm, "output"))
    } else if let Some(subm) = matches.subcommand_matches("convert") {
        cmd_convert(get!(subm, "input"), get!(subm, "output"))
    } else if let Some(subm) = matches.subcommand_matches("ident") {
        cmd_ident(get!(subm, "rom"))
    } else if let Some(subm) = matches.subcommand_matches("meta") {
        cmd_meta(get!(subm, "map"))
    } else if let Some(subm) = matches.subcommand_matches("sanitize") {
        cmd_sanitize(get!(subm, "map"), get!(subm, "rom"), get!(subm, "output"))
    } else if let Some(subm) = matches.subcommand_matches("apply-changeset") {
        cmd_apply_changeset(get!(subm, "map"), get!(subm, "rom"), get!(subm, "changeset"), get!(subm, "output"))
    } else if matches.subcommand_matches("initchg").is_some()
        || matches.subcommand_matches("findblocks").is_some()
        || matches.subcommand_matches("charmap").is_some()
        || matches.subcommand_matches("dirs").is_some()
        || matches.subcommand_matches("fix").is_some()
    {
        // TODO(sp1ff): these are thin collaborator conveniences, not core engine surface; wire
        // them up once there's a map in hand to drive their design against.
        log::warn!("this sub-command is not yet implemented");
        Ok(())
    } else {
        Err(Error::new(Cause::NoSubCommand))
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            match e.cause {
                Cause::NoSubCommand => {
                    eprintln!("{}", e);
                    ExitCode::from(1)
                }
                _ => {
                    eprintln!("{}", e);
                    ExitCode::from(2)
                }
            }
        }
    }
}
