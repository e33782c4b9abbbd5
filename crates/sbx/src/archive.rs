//! Tar archives used to move files across the host/environment boundary.
//!
//! A single path (file or directory tree) is packed under one top-level entry
//! name. Directory trees are enumerated with `walkdir` so relative structure,
//! permission bits and symlinks survive the trip.

use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use tar::{Archive, Builder, HeaderMode};
use walkdir::WalkDir;

/// Pack `source` into an in-memory tar archive whose top-level entry is
/// `entry_name`.
pub fn pack(source: &Path, entry_name: &str) -> io::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.mode(HeaderMode::Complete);

    // The requested path itself is resolved; links below it are kept as links.
    let metadata = fs::metadata(source)?;
    if metadata.is_dir() {
        builder.append_dir(entry_name, source)?;
        for entry in WalkDir::new(source)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(io::Error::other)?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(io::Error::other)?;
            builder.append_path_with_name(entry.path(), Path::new(entry_name).join(relative))?;
        }
    } else {
        let mut file = fs::File::open(source)?;
        builder.append_file(entry_name, &mut file)?;
    }

    builder.into_inner()
}

/// Extract `archive` below `dest_dir`.
///
/// Entries that would land outside `dest_dir` (absolute paths, `..`) fail the
/// whole extraction.
pub fn unpack(archive: &[u8], dest_dir: &Path) -> io::Result<()> {
    let mut archive = Archive::new(Cursor::new(archive));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.unpack_in(dest_dir)? {
            let name = entry.path()?.display().to_string();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("archive entry '{}' escapes the destination", name),
            ));
        }
    }

    Ok(())
}

/// Names of the top-level entries in `archive`.
pub fn top_level_entries(archive: &[u8]) -> io::Result<Vec<String>> {
    let mut archive = Archive::new(Cursor::new(archive));
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?;
        if let Some(first) = path.components().next() {
            let first = first.as_os_str().to_string_lossy().to_string();
            if first != "." && !names.contains(&first) {
                names.push(first);
            }
        }
    }
    Ok(names)
}

/// [`pack`] on the blocking pool.
pub async fn pack_blocking(source: PathBuf, entry_name: String) -> io::Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || pack(&source, &entry_name))
        .await
        .map_err(io::Error::other)?
}

/// [`unpack`] on the blocking pool.
pub async fn unpack_blocking(archive: Vec<u8>, dest_dir: PathBuf) -> io::Result<()> {
    tokio::task::spawn_blocking(move || unpack(&archive, &dest_dir))
        .await
        .map_err(io::Error::other)?
}
