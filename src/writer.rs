/*!
# DBPF Package Writer

Rewrites an archive into a fresh file, applying one [`Mode`] to every
entry body.

## Write Order

```text
1. Placeholder header (version fields kept, index/hole fields zeroed)
2. Entry bodies - rewritten in parallel; bodies land in whatever order
   the workers finish, the index records the real locations afterwards
3. Directory of compressed files (only when something is compressed)
4. Entry index
5. Signature hole (8 bytes: signature value + total file size)
6. Hole index (one record pointing at the signature hole)
7. Header patch at offset 36 with the final index and hole regions
```

## Concurrency

Workers share the source and destination file handles behind mutexes.
The position query and the write on the destination happen under one
lock, so the location recorded for an entry is exactly where its bytes
landed; the CPU-bound transform runs outside both locks.
*/

use anyhow::{anyhow, Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use deku::prelude::*;
use rayon::prelude::*;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::sync::{Mutex, MutexGuard};

use crate::common::{Mode, CLST_KEY};
use crate::package::{read_at, Entry, Package, HEADER_INDEX_FIELDS};
use crate::qfs;

/// Write `package` to `dest`, reading the original bodies from `source`
///
/// The descriptor is updated in place: entry locations, sizes and flags
/// reflect the new file, and the synthetic CLST entry is appended when
/// any entry comes out compressed.
pub fn write_package(
    source: &Mutex<File>,
    dest: &Mutex<File>,
    package: &mut Package,
    mode: Mode,
) -> Result<()> {
    let mut header = package.header.clone();
    header.entry_count = 0;
    header.index_location = 0;
    header.index_size = 0;
    header.hole_count = 0;
    header.hole_index_location = 0;
    header.hole_index_size = 0;

    {
        let mut out = lock(dest)?;
        out.seek(SeekFrom::Start(0))?;
        let bytes = header
            .to_bytes()
            .map_err(|e| anyhow!("failed to encode file header: {e}"))?;
        out.write_all(&bytes)?;
    }

    package
        .entries
        .par_iter_mut()
        .try_for_each(|entry| -> Result<()> {
            let content = {
                let mut input = lock(source)?;
                read_at(&mut *input, entry.location as u64, entry.size as usize)
                    .context("failed to read entry body")?
            };

            // CPU-bound part, deliberately outside both locks
            let content = transform_entry(entry, content, mode);

            if entry.compressed {
                entry.uncompressed_size = qfs::recorded_size(&content)
                    .ok_or_else(|| anyhow!("compressed entry shorter than a stream header"))?;
            }

            // tellp and write stay under one lock so the recorded
            // location is where the bytes actually went
            let mut out = lock(dest)?;
            let location = out.stream_position()?;
            out.write_all(&content)?;

            entry.location = location as u32;
            entry.size = content.len() as u32;
            Ok(())
        })?;

    let mut out = lock(dest)?;

    let clst = build_clst(&package.entries, package.header.index_minor);
    if !clst.is_empty() {
        let location = out.stream_position()?;
        out.write_all(&clst)?;
        package.entries.push(Entry {
            key: CLST_KEY,
            location: location as u32,
            size: clst.len() as u32,
            uncompressed_size: 0,
            compressed: false,
            repeated: false,
        });
    }

    let index_start = out.stream_position()?;
    for entry in &package.entries {
        out.write_u32::<LittleEndian>(entry.key.type_id)?;
        out.write_u32::<LittleEndian>(entry.key.group)?;
        out.write_u32::<LittleEndian>(entry.key.instance)?;
        if package.header.index_minor == 2 {
            out.write_u32::<LittleEndian>(entry.key.resource)?;
        }
        out.write_u32::<LittleEndian>(entry.location)?;
        out.write_u32::<LittleEndian>(entry.size)?;
    }
    let index_end = out.stream_position()?;

    // the signature hole sits right after the index, the hole index
    // record right after the hole, and nothing follows it
    let hole_location = index_end;
    let hole_index_location = hole_location + 8;
    let total_size = hole_index_location + 8;
    out.write_u32::<LittleEndian>(mode.signature())?;
    out.write_u32::<LittleEndian>(total_size as u32)?;
    out.write_u32::<LittleEndian>(hole_location as u32)?;
    out.write_u32::<LittleEndian>(8)?;

    out.seek(SeekFrom::Start(HEADER_INDEX_FIELDS))?;
    out.write_u32::<LittleEndian>(package.entries.len() as u32)?;
    out.write_u32::<LittleEndian>(index_start as u32)?;
    out.write_u32::<LittleEndian>((index_end - index_start) as u32)?;
    out.write_u32::<LittleEndian>(1)?;
    out.write_u32::<LittleEndian>(hole_index_location as u32)?;
    out.write_u32::<LittleEndian>(8)?;
    out.flush()?;

    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("a worker thread panicked"))
}

/// Apply the operation to one entry body, updating its flags
pub fn transform_entry(entry: &mut Entry, content: Vec<u8>, mode: Mode) -> Vec<u8> {
    match mode {
        Mode::Compress => try_compress(entry, content),
        Mode::Decompress => {
            if !entry.compressed {
                return content;
            }
            match qfs::decompress(&content) {
                Ok(raw) => {
                    entry.compressed = false;
                    raw
                }
                Err(err) => {
                    eprintln!("Failed to decompress entry: {err:#}");
                    content
                }
            }
        }
        Mode::Recompress => {
            if entry.compressed {
                recompress_entry(entry, content)
            } else {
                try_compress(entry, content)
            }
        }
        Mode::Skip => content,
    }
}

/// Compress a raw entry, keeping the original when it does not shrink
fn try_compress(entry: &mut Entry, content: Vec<u8>) -> Vec<u8> {
    if entry.compressed || entry.repeated {
        return content;
    }
    match qfs::compress(&content) {
        Some(packed) => {
            entry.compressed = true;
            packed
        }
        None => content,
    }
}

/// Decode and re-encode an already compressed entry
///
/// The new stream only replaces the old one when it is strictly smaller
/// than what is on disk; otherwise the entry keeps its original bytes and
/// compressed state.
pub fn recompress_entry(entry: &mut Entry, content: Vec<u8>) -> Vec<u8> {
    if !entry.compressed || entry.repeated {
        return content;
    }

    let raw = match qfs::decompress(&content) {
        Ok(raw) => raw,
        Err(err) => {
            eprintln!("Failed to decompress entry: {err:#}");
            return content;
        }
    };

    match qfs::compress(&raw) {
        Some(packed) if packed.len() < content.len() => packed,
        _ => content,
    }
}

/// One CLST record per compressed entry, in index order
fn build_clst(entries: &[Entry], index_minor: u32) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries.iter().filter(|e| e.compressed) {
        out.extend_from_slice(&entry.key.type_id.to_le_bytes());
        out.extend_from_slice(&entry.key.group.to_le_bytes());
        out.extend_from_slice(&entry.key.instance.to_le_bytes());
        if index_minor == 2 {
            out.extend_from_slice(&entry.key.resource.to_le_bytes());
        }
        out.extend_from_slice(&entry.uncompressed_size.to_le_bytes());
    }
    out
}
