//! Small filesystem helpers shared by the runtime cache and the backup
//! manager.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Copy file contents, creating parent directories as needed.
pub fn copy_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    let data = std::fs::read(src)?;
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(dst, data)?;
    if let Ok(meta) = std::fs::metadata(src) {
        let _ = std::fs::set_permissions(dst, meta.permissions());
    }
    Ok(())
}

/// Recursively copy a directory tree. `skip` prunes whole subtrees (it is
/// consulted for every entry; a skipped directory is not descended into).
/// Symlinks are not followed and not copied.
pub fn copy_dir(
    src_dir: &Path,
    dst_dir: &Path,
    skip: Option<&dyn Fn(&Path) -> bool>,
) -> std::io::Result<()> {
    let mut walker = WalkDir::new(src_dir).follow_links(false).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| {
            e.into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walk error"))
        })?;
        let path = entry.path();
        if let Some(skip) = skip {
            if skip(path) {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
        }

        let rel = path.strip_prefix(src_dir).unwrap_or(path);
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dst_path = dst_dir.join(rel);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dst_path)?;
        } else if entry.file_type().is_file() {
            copy_file(path, &dst_path)?;
        }
    }
    Ok(())
}

/// Remove everything inside `dst_dir`, then copy `src_dir` into it. A
/// missing `src_dir` leaves `dst_dir` empty.
pub fn replace_dir_contents(dst_dir: &Path, src_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst_dir)?;
    for entry in std::fs::read_dir(dst_dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            let _ = std::fs::remove_dir_all(&path);
        } else {
            let _ = std::fs::remove_file(&path);
        }
    }

    match std::fs::metadata(src_dir) {
        Ok(_) => copy_dir(src_dir, dst_dir, None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Write a file atomically: temp file in the destination directory, then
/// rename over the target.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    std::io::Write::write_all(&mut tmp, data)
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Absolute form of `path`, resolved against the current directory without
/// touching the filesystem (the path may not exist yet).
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(clean_dots(path));
    }
    let cwd = std::env::current_dir().context("failed to resolve current directory")?;
    Ok(clean_dots(&cwd.join(path)))
}

fn clean_dots(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// True when `path` is strictly inside `parent`.
pub fn is_under(path: &Path, parent: &Path) -> bool {
    match path.strip_prefix(parent) {
        Ok(rel) => !rel.as_os_str().is_empty(),
        Err(_) => false,
    }
}
