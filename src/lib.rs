/*!
# DBPF Recompress

Rewrites DBPF v1 archives (The Sims 2 `.package` files) in place,
recompressing their entries with the QFS codec to shrink the files while
keeping every resource byte-identical after decompression.

The crate is split along the data flow:

- [`package`] parses an archive into a descriptor (reader)
- [`qfs`] and [`matcher`] compress and decompress entry bodies
- [`writer`] emits a rewritten archive, transforming entries in parallel
- [`pipeline`] ties it together per archive: probe, temp file, validate,
  atomic rename
*/

pub mod common;
pub mod matcher;
pub mod package;
pub mod pipeline;
pub mod qfs;
pub mod writer;

#[cfg(test)]
pub(crate) mod testutil;
