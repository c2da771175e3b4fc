/*!
Shared unit-test fixtures: a hand-rolled archive builder and stream
helpers, kept independent of the production writer so the tests check the
on-disk format rather than the code against itself.
*/

use crate::common::{Tgir, CLST_KEY};
use crate::package::HEADER_LEN;
use crate::qfs;

pub(crate) fn key(n: u32) -> Tgir {
    Tgir {
        type_id: n,
        group: n + 1,
        instance: n + 2,
        resource: 0,
    }
}

/// Body that opens with a QFS stream header claiming `raw` bytes.
///
/// The token section is zero padding; good enough for readers that only
/// look at the header, useless for decoding.
pub(crate) fn fake_stream(raw: u32, pad: usize) -> Vec<u8> {
    let mut body = vec![0u8; qfs::HEADER_LEN + pad];
    let total = body.len() as u32;
    body[..4].copy_from_slice(&total.to_le_bytes());
    body[4] = 0x10;
    body[5] = 0xFB;
    body[6] = (raw >> 16) as u8;
    body[7] = (raw >> 8) as u8;
    body[8] = raw as u8;
    body
}

/// A valid QFS stream that stores `raw` entirely as literals
///
/// Decodes back to `raw` but is always larger than it, which makes it the
/// worst possible encoding an archive could legitimately carry.
pub(crate) fn literal_stream(raw: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; qfs::HEADER_LEN];
    let mut emitted = 0;

    while raw.len() - emitted > 3 {
        let run = ((raw.len() - emitted) & !3).min(112);
        out.push(0xE0 | ((run - 4) >> 2) as u8);
        out.extend_from_slice(&raw[emitted..emitted + run]);
        emitted += run;
    }
    let rest = raw.len() - emitted;
    if rest > 0 {
        out.push(0xFC | rest as u8);
        out.extend_from_slice(&raw[emitted..]);
    }

    let total = out.len() as u32;
    out[..4].copy_from_slice(&total.to_le_bytes());
    out[4] = 0x10;
    out[5] = 0xFB;
    out[6] = (raw.len() >> 16) as u8;
    out[7] = (raw.len() >> 8) as u8;
    out[8] = raw.len() as u8;
    out
}

pub(crate) fn put32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn push32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Hand-rolled archive builder
pub(crate) struct Builder {
    minor: u32,
    items: Vec<(Tgir, Vec<u8>)>,
    clst: Vec<(Tgir, u32)>,
    signature: Option<(u32, Option<u32>)>,
}

impl Builder {
    pub(crate) fn new(minor: u32) -> Self {
        Self {
            minor,
            items: Vec::new(),
            clst: Vec::new(),
            signature: None,
        }
    }

    pub(crate) fn entry(mut self, key: Tgir, body: &[u8]) -> Self {
        self.items.push((key, body.to_vec()));
        self
    }

    pub(crate) fn clst_record(mut self, key: Tgir, uncompressed_size: u32) -> Self {
        self.clst.push((key, uncompressed_size));
        self
    }

    /// Append a signature hole; `size_override` forges the stored file size.
    pub(crate) fn signed(mut self, signature: u32, size_override: Option<u32>) -> Self {
        self.signature = Some((signature, size_override));
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN];
        out[..4].copy_from_slice(b"DBPF");
        put32(&mut out, 4, 1); // major version
        put32(&mut out, 8, 1); // minor version
        put32(&mut out, 32, 7); // index major version
        put32(&mut out, 60, self.minor);

        let mut index_items: Vec<(Tgir, u32, u32)> = Vec::new();
        for (key, body) in &self.items {
            index_items.push((*key, out.len() as u32, body.len() as u32));
            out.extend_from_slice(body);
        }

        if !self.clst.is_empty() {
            let location = out.len() as u32;
            for (key, size) in &self.clst {
                push32(&mut out, key.type_id);
                push32(&mut out, key.group);
                push32(&mut out, key.instance);
                if self.minor == 2 {
                    push32(&mut out, key.resource);
                }
                push32(&mut out, *size);
            }
            index_items.push((CLST_KEY, location, out.len() as u32 - location));
        }

        let index_location = out.len() as u32;
        for (key, location, size) in &index_items {
            push32(&mut out, key.type_id);
            push32(&mut out, key.group);
            push32(&mut out, key.instance);
            if self.minor == 2 {
                push32(&mut out, key.resource);
            }
            push32(&mut out, *location);
            push32(&mut out, *size);
        }
        let index_size = out.len() as u32 - index_location;

        let mut hole_fields = (0u32, 0u32, 0u32);
        if let Some((signature, size_override)) = self.signature {
            let hole_location = out.len() as u32;
            let total = size_override.unwrap_or(hole_location + 16);
            push32(&mut out, signature);
            push32(&mut out, total);
            let hole_index_location = out.len() as u32;
            push32(&mut out, hole_location);
            push32(&mut out, 8);
            hole_fields = (1, hole_index_location, 8);
        }

        put32(&mut out, 36, index_items.len() as u32);
        put32(&mut out, 40, index_location);
        put32(&mut out, 44, index_size);
        put32(&mut out, 48, hole_fields.0);
        put32(&mut out, 52, hole_fields.1);
        put32(&mut out, 56, hole_fields.2);
        out
    }
}
