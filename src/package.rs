/*!
# DBPF Package Format

Descriptor types and the reader for DBPF v1 archives (`.package` files).

## Format Overview

```text
DBPF Archive Layout:
1. Header (96 bytes)
   - Magic "DBPF", version fields, index and hole-index pointers,
     32 bytes of opaque remainder preserved verbatim
2. Entry bodies (variable length)
   - Raw or QFS-compressed resource data, one blob per entry
3. Directory of compressed files (CLST, optional)
   - One record per compressed entry: TGIR + uncompressed size
4. Entry index
   - TGIR + location + size per entry, 20 bytes each
     (24 when the index minor version is 2, which adds a resource id)
5. Hole index
   - Byte ranges the game skips; this tool stores its signature there
```

An entry counts as compressed only when both its TGIR appears in the CLST
and its body carries the QFS marker `0x10 0xFB` at offsets 4..6. A CLST
record without the marker is treated as stale and the entry as raw.

The reader returns metadata only; entry bodies stay on disk and are
fetched per entry by the writer and the validator.
*/

use anyhow::{anyhow, bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use deku::prelude::*;
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::common::{Tgir, CLST_TYPE};
use crate::qfs;

/// On-disk size of the header.
pub const HEADER_LEN: usize = 96;

/// Offset of the first header field the writer patches (the entry count).
pub const HEADER_INDEX_FIELDS: u64 = 36;

/// The 96-byte file header
///
/// Index and hole fields are rewritten on save; everything else, the
/// 32-byte remainder included, is carried over from the source archive
/// untouched.
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little", magic = b"DBPF")]
pub struct Header {
    pub major: u32,
    pub minor: u32,
    pub user_major: u32,
    pub user_minor: u32,
    pub flags: u32,
    pub created: u32,
    pub modified: u32,
    pub index_major: u32,
    pub entry_count: u32,
    pub index_location: u32,
    pub index_size: u32,
    pub hole_count: u32,
    pub hole_index_location: u32,
    pub hole_index_size: u32,
    pub index_minor: u32,
    pub remainder: [u8; 32],
}

/// One resource inside the package
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub key: Tgir,
    /// Byte position of the body within the archive
    pub location: u32,
    /// On-disk size of the body
    pub size: u32,
    /// Size after decompression; only meaningful while `compressed` is set
    pub uncompressed_size: u32,
    pub compressed: bool,
    /// Another entry shares this TGIR; such entries are never compressed
    pub repeated: bool,
}

/// A byte range the game tolerates as junk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hole {
    pub location: u32,
    pub size: u32,
}

/// In-memory description of one archive, without entry bodies
#[derive(Debug, Clone)]
pub struct Package {
    pub header: Header,
    /// All entries in index order, the CLST excluded
    pub entries: Vec<Entry>,
    /// Uncompressed sizes claimed by the directory of compressed files
    pub clst: HashMap<Tgir, u32>,
    pub holes: Vec<Hole>,
}

/// Outcome of parsing an archive
#[derive(Debug)]
pub enum PackageRead {
    Parsed(Package),
    /// The signature hole already matches the requested operation
    AlreadyProcessed,
}

/// Index record width for a given index minor version
pub fn entry_stride(index_minor: u32) -> usize {
    if index_minor == 2 {
        4 * 6
    } else {
        4 * 5
    }
}

/// CLST record width for a given index minor version
pub fn clst_stride(index_minor: u32) -> usize {
    if index_minor == 2 {
        4 * 5
    } else {
        4 * 4
    }
}

/// Read `size` bytes at an absolute file position
pub fn read_at<R: Read + Seek>(file: &mut R, location: u64, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    file.seek(SeekFrom::Start(location))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Parse an archive into a [`Package`]
///
/// `display_path` names the archive in every diagnostic. When
/// `skip_signature` is given and the archive carries a sole 8-byte hole
/// holding that signature plus the actual file size, the archive was
/// already rewritten by this tool and [`PackageRead::AlreadyProcessed`] is
/// returned instead of a descriptor. Validation passes suppress the check
/// by passing `None`.
pub fn read_package<R: Read + Seek>(
    file: &mut R,
    display_path: &str,
    skip_signature: Option<u32>,
) -> Result<PackageRead> {
    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < 64 {
        bail!("{display_path}: file header not found");
    }

    let header_bytes = read_at(file, 0, HEADER_LEN)
        .with_context(|| format!("{display_path}: failed to read file header"))?;
    let (_, header) = Header::from_bytes((header_bytes.as_slice(), 0))
        .map_err(|e| anyhow!("{display_path}: failed to parse file header: {e}"))?;

    if header.major != 1 || header.minor > 2 {
        bail!(
            "{display_path}: unsupported package version {}.{}",
            header.major,
            header.minor
        );
    }
    if header.index_major != 7 {
        bail!("{display_path}: unrecognized index version {}", header.index_major);
    }
    if header.index_minor > 2 {
        bail!(
            "{display_path}: unrecognized index minor version {}",
            header.index_minor
        );
    }

    // all region pointers are validated before anything is dereferenced
    if header.index_location as u64 + header.index_size as u64 > file_size {
        bail!("{display_path}: file index outside of bounds");
    }
    if header.hole_index_location as u64 + header.hole_index_size as u64 > file_size {
        bail!("{display_path}: hole index outside of bounds");
    }

    let stride = entry_stride(header.index_minor);
    if header.entry_count as u64 * stride as u64 != header.index_size as u64 {
        bail!("{display_path}: entry count does not match the index size");
    }
    if header.hole_count as u64 * 8 > header.hole_index_size as u64 {
        bail!("{display_path}: hole count does not fit the hole index");
    }

    let holes = read_holes(file, &header)
        .with_context(|| format!("{display_path}: failed to read hole index"))?;

    if let Some(expected) = skip_signature {
        if carries_signature(file, &holes, expected, file_size)? {
            return Ok(PackageRead::AlreadyProcessed);
        }
    }

    let (mut entries, clst_body) = read_index(file, &header, file_size, display_path)?;
    let clst = parse_clst(clst_body.as_deref(), header.index_minor)
        .with_context(|| format!("{display_path}: failed to parse the compressed directory"))?;

    // an entry is compressed only when the directory claims it AND the
    // body opens with a QFS stream header
    for entry in &mut entries {
        if clst.contains_key(&entry.key) && entry.size as usize >= qfs::HEADER_LEN {
            let head = read_at(file, entry.location as u64, qfs::HEADER_LEN)
                .with_context(|| format!("{display_path}: failed to read entry body"))?;
            if qfs::is_compressed(&head) {
                entry.compressed = true;
                entry.uncompressed_size = qfs::recorded_size(&head).unwrap_or(0);
            }
        }
    }

    mark_repeated(&mut entries);

    Ok(PackageRead::Parsed(Package {
        header,
        entries,
        clst,
        holes,
    }))
}

/// Read the hole index records
fn read_holes<R: Read + Seek>(file: &mut R, header: &Header) -> Result<Vec<Hole>> {
    if header.hole_count == 0 {
        return Ok(Vec::new());
    }

    let bytes = read_at(
        file,
        header.hole_index_location as u64,
        header.hole_count as usize * 8,
    )?;
    let mut cursor = Cursor::new(bytes);

    let mut holes = Vec::with_capacity(header.hole_count as usize);
    for _ in 0..header.hole_count {
        holes.push(Hole {
            location: cursor.read_u32::<LittleEndian>()?,
            size: cursor.read_u32::<LittleEndian>()?,
        });
    }
    Ok(holes)
}

/// Whether a sole 8-byte hole holds `expected` plus the actual file size
fn carries_signature<R: Read + Seek>(
    file: &mut R,
    holes: &[Hole],
    expected: u32,
    file_size: u64,
) -> Result<bool> {
    let [hole] = holes else {
        return Ok(false);
    };
    if hole.size != 8 || hole.location as u64 + 8 > file_size {
        return Ok(false);
    }

    let bytes = read_at(file, hole.location as u64, 8)?;
    let mut cursor = Cursor::new(bytes);
    let signature = cursor.read_u32::<LittleEndian>()?;
    let recorded_file_size = cursor.read_u32::<LittleEndian>()?;

    Ok(signature == expected && recorded_file_size as u64 == file_size)
}

/// Walk the entry index; returns the entries and the CLST body, if any
fn read_index<R: Read + Seek>(
    file: &mut R,
    header: &Header,
    file_size: u64,
    display_path: &str,
) -> Result<(Vec<Entry>, Option<Vec<u8>>)> {
    let index = read_at(file, header.index_location as u64, header.index_size as usize)
        .with_context(|| format!("{display_path}: failed to read file index"))?;
    let mut cursor = Cursor::new(index);

    let mut entries = Vec::with_capacity(header.entry_count as usize);
    let mut clst_body = None;

    for _ in 0..header.entry_count {
        let type_id = cursor.read_u32::<LittleEndian>()?;
        let group = cursor.read_u32::<LittleEndian>()?;
        let instance = cursor.read_u32::<LittleEndian>()?;
        let resource = if header.index_minor == 2 {
            cursor.read_u32::<LittleEndian>()?
        } else {
            0
        };
        let location = cursor.read_u32::<LittleEndian>()?;
        let size = cursor.read_u32::<LittleEndian>()?;

        if location as u64 + size as u64 > file_size {
            bail!("{display_path}: entry location outside of bounds");
        }

        if type_id == CLST_TYPE {
            clst_body = Some(read_at(file, location as u64, size as usize)?);
            continue;
        }

        entries.push(Entry {
            key: Tgir {
                type_id,
                group,
                instance,
                resource,
            },
            location,
            size,
            uncompressed_size: 0,
            compressed: false,
            repeated: false,
        });
    }

    Ok((entries, clst_body))
}

/// Parse CLST records into a TGIR -> uncompressed-size map
///
/// A trailing partial record is ignored, matching what the game does.
fn parse_clst(body: Option<&[u8]>, index_minor: u32) -> Result<HashMap<Tgir, u32>> {
    let mut clst = HashMap::new();
    let Some(body) = body else {
        return Ok(clst);
    };

    let stride = clst_stride(index_minor);
    let mut cursor = Cursor::new(body);

    while (cursor.position() as usize) + stride <= body.len() {
        let type_id = cursor.read_u32::<LittleEndian>()?;
        let group = cursor.read_u32::<LittleEndian>()?;
        let instance = cursor.read_u32::<LittleEndian>()?;
        let resource = if index_minor == 2 {
            cursor.read_u32::<LittleEndian>()?
        } else {
            0
        };
        let uncompressed_size = cursor.read_u32::<LittleEndian>()?;

        clst.insert(
            Tgir {
                type_id,
                group,
                instance,
                resource,
            },
            uncompressed_size,
        );
    }
    Ok(clst)
}

/// Flag every entry whose TGIR occurs more than once
///
/// The game's CLST lookup cannot tell such entries apart, so they must
/// never be stored compressed.
fn mark_repeated(entries: &mut [Entry]) {
    let mut first_seen: HashMap<Tgir, usize> = HashMap::new();

    for i in 0..entries.len() {
        if let Some(&j) = first_seen.get(&entries[i].key) {
            entries[i].repeated = true;
            entries[j].repeated = true;
        } else {
            first_seen.insert(entries[i].key, i);
        }
    }
}
