/*!
# Rewrite Pipeline

Per-archive orchestration: parse, pick the effective operation, rewrite
into a sibling temp file, validate the result, and atomically swap it in.

## Flow

```text
open -> read -> decide mode -> write <name>.new -> re-read temp
     -> validate -> rename over the original
```

Every non-success path deletes the temp file and leaves the original
untouched. A failure in one archive never affects the next; the caller
just moves on.
*/

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::{self, File};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::common::Mode;
use crate::package::{self, read_package, Package, PackageRead, HEADER_LEN};
use crate::qfs;
use crate::writer;

/// Entries at least this large make the recompression probe worthwhile.
const PROBE_THRESHOLD: u32 = 100_000;

/// Rewrite one archive in place
///
/// Returns the archive's size before and after; the two are equal when
/// nothing changed (already processed, nothing to do, or the rewrite did
/// not shrink the file).
pub fn process_file(path: &Path, display_path: &str, requested: Mode) -> Result<(u64, u64)> {
    let old_size = fs::metadata(path)
        .with_context(|| format!("{display_path}: failed to open file"))?
        .len();

    let mut file =
        File::open(path).with_context(|| format!("{display_path}: failed to open file"))?;

    let outcome = read_package(&mut file, display_path, Some(requested.signature()))?;
    let PackageRead::Parsed(old_package) = outcome else {
        // a previous run already rewrote this archive
        return Ok((old_size, old_size));
    };

    let mode = decide_mode(&mut file, &old_package, requested)?;
    if mode == Mode::Skip {
        return Ok((old_size, old_size));
    }

    let temp_path = temp_file_path(path);
    let temp = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .with_context(|| format!("{display_path}: failed to create temp file"))?;

    // the writer's workers share both handles
    let source = Mutex::new(file);
    let dest = Mutex::new(temp);
    let mut package = old_package.clone();
    let written = writer::write_package(&source, &dest, &mut package, mode);

    let mut file = source
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut temp = dest
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let validated = written
        .with_context(|| format!("{display_path}: failed to write temp file"))
        .and_then(|()| validate(&old_package, &mut file, &mut temp, mode, display_path));

    let new_size = temp.metadata().map(|m| m.len()).unwrap_or(0);
    drop(file);
    drop(temp);

    if let Err(err) = validated {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    // decompression always goes through; compression only when it pays off
    if mode == Mode::Decompress || new_size < old_size {
        if let Err(err) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(err).with_context(|| format!("{display_path}: failed to overwrite file"));
        }
        Ok((old_size, new_size))
    } else {
        let _ = fs::remove_file(&temp_path);
        Ok((old_size, old_size))
    }
}

/// `<name>.new`, next to the original
fn temp_file_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".new");
    PathBuf::from(name)
}

/// Refine the requested operation for one archive
///
/// Decompression runs whenever anything is compressed. A compress request
/// first probes one large already-compressed entry: if decoding and
/// re-encoding it shrinks the stream, the whole archive is recompressed;
/// otherwise fully-compressed archives are skipped and the rest get a
/// plain compress pass.
fn decide_mode<R: Read + Seek>(file: &mut R, package: &Package, requested: Mode) -> Result<Mode> {
    if requested == Mode::Decompress {
        if package.entries.iter().all(|e| !e.compressed) {
            return Ok(Mode::Skip);
        }
        return Ok(Mode::Decompress);
    }

    let probe = package
        .entries
        .iter()
        .find(|e| e.compressed && e.uncompressed_size >= PROBE_THRESHOLD);
    if let Some(&entry) = probe {
        let content = package::read_at(file, entry.location as u64, entry.size as usize)?;
        let mut scratch = entry;
        let recompressed = writer::recompress_entry(&mut scratch, content);
        if (recompressed.len() as u32) < entry.size {
            return Ok(Mode::Recompress);
        }
    }

    if package.entries.iter().all(|e| e.compressed) {
        Ok(Mode::Skip)
    } else {
        Ok(Mode::Compress)
    }
}

/// Confirm that the temp file is a faithful rewrite of the original
///
/// Each predicate gets its own message so a failed archive names the
/// check that sank it.
fn validate(
    old: &Package,
    old_file: &mut File,
    temp: &mut File,
    mode: Mode,
    display_path: &str,
) -> Result<()> {
    let new = match read_package(temp, &format!("{display_path}.new"), None)
        .context("failed to load new package")?
    {
        PackageRead::Parsed(package) => package,
        PackageRead::AlreadyProcessed => bail!("{display_path}: unexpected sentinel for new package"),
    };

    // only the index and hole header fields may differ
    let old_head = package::read_at(old_file, 0, HEADER_LEN)?;
    let new_head = package::read_at(temp, 0, HEADER_LEN)?;
    if old_head[..36] != new_head[..36] || old_head[60..] != new_head[60..] {
        bail!("{display_path}: preserved header bytes changed");
    }

    let temp_size = temp.seek(SeekFrom::End(0))?;
    let &[hole] = new.holes.as_slice() else {
        bail!("{display_path}: expected exactly one hole in new package");
    };
    if hole.size != 8 {
        bail!("{display_path}: signature hole has the wrong size");
    }
    let sig = package::read_at(temp, hole.location as u64, 8)?;
    let mut sig = Cursor::new(sig);
    let signature = sig.read_u32::<LittleEndian>()?;
    let recorded_size = sig.read_u32::<LittleEndian>()?;
    if signature != mode.signature() {
        bail!("{display_path}: signature value does not match the operation");
    }
    if recorded_size as u64 != temp_size {
        bail!("{display_path}: signature records the wrong file size");
    }

    if old.entries.len() != new.entries.len() {
        bail!("{display_path}: number of entries between old package and new package not matching");
    }

    for (old_entry, new_entry) in old.entries.iter().zip(&new.entries) {
        if old_entry.key != new_entry.key {
            bail!(
                "{display_path}: types, groups, instances, or resources of entries not matching"
            );
        }

        let new_content =
            package::read_at(temp, new_entry.location as u64, new_entry.size as usize)?;

        // the directory and the stream marker must agree on every entry
        if new.clst.contains_key(&new_entry.key) != qfs::is_compressed(&new_content) {
            bail!("{display_path}: compressed directory does not match entry contents");
        }

        if new_entry.compressed && new_entry.size > new_entry.uncompressed_size {
            bail!("{display_path}: compressed entry larger than its uncompressed form");
        }

        let old_content =
            package::read_at(old_file, old_entry.location as u64, old_entry.size as usize)?;
        let old_raw = if old_entry.compressed {
            qfs::decompress(&old_content)
                .with_context(|| format!("{display_path}: old entry failed to decompress"))?
        } else {
            old_content
        };
        let new_raw = if new_entry.compressed {
            qfs::decompress(&new_content)
                .with_context(|| format!("{display_path}: new entry failed to decompress"))?
        } else {
            new_content
        };

        if old_raw != new_raw {
            bail!("{display_path}: mismatch between old entry and new entry");
        }
    }

    Ok(())
}
