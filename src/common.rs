/*!
# Common Types and Utilities

This module contains shared code used across the package reader, writer and
rewrite pipeline: the resource key type, the operation mode, the signature
constants, and small path/size helpers.
*/

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Resource type id of the directory of compressed files (DIR/CLST).
pub const CLST_TYPE: u32 = 0xE86B1EEF;

/// Fixed key of the synthetic CLST entry appended by the writer.
pub const CLST_KEY: Tgir = Tgir {
    type_id: CLST_TYPE,
    group: 0xE86B1EEF,
    instance: 0x286B1F03,
    resource: 0,
};

/// Signature value stored in the hole of a compressed package ("brg5").
pub const SIGNATURE_COMPRESSED: u32 = 0x35677262;

/// Signature value stored in the hole of a decompressed package.
pub const SIGNATURE_DECOMPRESSED: u32 = 0;

/// Identifies a single resource inside a package
///
/// Every entry is addressed by its (type, group, instance, resource) tuple.
/// The resource id only exists on disk when the package uses index minor
/// version 2; older packages leave it at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tgir {
    /// Resource type id (e.g. 0xE86B1EEF for the CLST)
    pub type_id: u32,
    /// Group id
    pub group: u32,
    /// Instance id
    pub instance: u32,
    /// Second instance id, zero unless index minor version is 2
    pub resource: u32,
}

/// Operation applied to the entries of a package
///
/// `Compress` and `Decompress` are selected on the command line; the
/// pipeline refines a compress request into `Recompress` or `Skip` after
/// probing the archive (see the pipeline module).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Compress entries that are stored raw
    Compress,
    /// Expand every compressed entry back to its raw form
    Decompress,
    /// Decode and re-encode entries that are already compressed
    Recompress,
    /// Leave the package untouched
    Skip,
}

impl Mode {
    /// Signature value a package rewritten with this mode carries in its hole.
    pub fn signature(self) -> u32 {
        match self {
            Mode::Decompress => SIGNATURE_DECOMPRESSED,
            _ => SIGNATURE_COMPRESSED,
        }
    }
}

/// Helper functions for file discovery and console output
pub mod utils {
    use super::*;

    /// Collect the `.package` files named by a path argument
    ///
    /// A regular file is accepted only if it carries the `.package`
    /// extension. A directory is walked recursively and every `.package`
    /// file below it is returned, sorted for a stable processing order.
    pub fn collect_package_files<P: AsRef<Path>>(path: P) -> Result<Vec<PathBuf>> {
        let path = path.as_ref();

        if path.is_file() {
            if path.extension().map(|e| e == "package") != Some(true) {
                bail!("Not a package file");
            }
            return Ok(vec![path.to_path_buf()]);
        }

        if path.is_dir() {
            let mut files = Vec::new();
            walk_packages(path, &mut files)?;
            files.sort();
            return Ok(files);
        }

        bail!("File not found");
    }

    /// Recursive directory scan for `.package` files
    fn walk_packages(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
        for entry in
            fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?
        {
            let entry_path = entry?.path();

            if entry_path.is_dir() {
                walk_packages(&entry_path, files)?;
            } else if entry_path.is_file()
                && entry_path.extension().map(|e| e == "package") == Some(true)
            {
                files.push(entry_path);
            }
        }
        Ok(())
    }

    /// Path shown on the console for one archive
    ///
    /// A single-file invocation prints the path as the user typed it; a
    /// directory invocation prints paths relative to that directory.
    pub fn display_path(file: &Path, root: &Path) -> String {
        if root.is_dir() {
            if let Ok(relative) = file.strip_prefix(root) {
                return relative.display().to_string();
            }
        }
        file.display().to_string()
    }

    /// Render a byte count the way the console report expects it
    ///
    /// Sizes below 1000 KB print as KB, larger ones as MB, both with two
    /// decimal places.
    pub fn format_size(bytes: u64) -> String {
        let kb = bytes as f64 / 1024.0;
        if kb >= 1000.0 {
            format!("{:.2} MB", kb / 1024.0)
        } else {
            format!("{kb:.2} KB")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn signature_constant_spells_brg5() {
        assert_eq!(SIGNATURE_COMPRESSED.to_le_bytes(), *b"brg5");
    }

    #[test]
    fn mode_signatures() {
        assert_eq!(Mode::Compress.signature(), SIGNATURE_COMPRESSED);
        assert_eq!(Mode::Recompress.signature(), SIGNATURE_COMPRESSED);
        assert_eq!(Mode::Decompress.signature(), SIGNATURE_DECOMPRESSED);
    }

    #[test]
    fn format_size_switches_units() {
        assert_eq!(utils::format_size(512), "0.50 KB");
        assert_eq!(utils::format_size(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn collect_rejects_non_package_file() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("notes.txt");
        File::create(&other).unwrap();

        assert!(utils::collect_package_files(&other).is_err());
    }

    #[test]
    fn collect_walks_directories_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("downloads/mods");
        fs::create_dir_all(&nested).unwrap();
        File::create(dir.path().join("a.package")).unwrap();
        File::create(nested.join("b.package")).unwrap();
        File::create(nested.join("readme.txt")).unwrap();

        let files = utils::collect_package_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, ["a.package", "b.package"]);
    }

    #[test]
    fn display_path_is_relative_under_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sub").join("c.package");

        assert_eq!(
            utils::display_path(&file, dir.path()),
            Path::new("sub").join("c.package").display().to_string()
        );
        // single file invocations keep the full path
        assert_eq!(utils::display_path(&file, &file), file.display().to_string());
    }
}
