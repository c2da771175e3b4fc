/*!
# dbpf-recompress - The Sims 2 package recompressor

Recompresses the resources inside DBPF `.package` files to reduce their
size, or restores them to their uncompressed form. Archives are replaced
in place, and only after the rewritten file validates against the
original.
*/

use anyhow::Result;
use clap::{CommandFactory, Parser};
use std::path::PathBuf;

// Use a faster memory allocator on Linux (optional optimization)
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use dbpf::common::{utils, Mode};
use dbpf::pipeline;

/// Command-line interface definition, parsed by clap
#[derive(Parser)]
#[command(name = "dbpf-recompress")]
#[command(version = "0.4.0")]
#[command(about = "The Sims 2 .package recompression cli")]
struct Cli {
    /// Decompress instead of compress
    #[arg(short = 'd')]
    decompress: bool,

    /// A .package file, or a directory searched recursively for them
    path: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // an empty invocation and a bare `help` both print usage and exit 0
    let path = match cli.path {
        Some(path) if path.as_os_str() != "help" => path,
        _ => {
            Cli::command().print_help()?;
            return Ok(());
        }
    };

    let mode = if cli.decompress {
        Mode::Decompress
    } else {
        Mode::Compress
    };

    let files = match utils::collect_package_files(&path) {
        Ok(files) => files,
        Err(err) => {
            println!("{err:#}");
            return Ok(());
        }
    };

    // archives are processed one after the other; a failure in one is
    // reported and the loop moves on
    for file in &files {
        let display = utils::display_path(file, &path);

        match pipeline::process_file(file, &display, mode) {
            Ok((old_size, new_size)) => {
                println!(
                    "{display} {} -> {}",
                    utils::format_size(old_size),
                    utils::format_size(new_size)
                );
            }
            Err(err) => eprintln!("{err:#}"),
        }
    }

    Ok(())
}
