use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{CalibError, IoContext, Result};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).at(path)
}

/// Anchors a relative path at the current directory.
pub fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().at(path)?;
    Ok(cwd.join(path))
}

/// Writes through a sibling temp file and renames it into place, so readers
/// see either the old contents or the new ones.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp).at(&tmp)?;
    file.write_all(bytes).at(&tmp)?;
    file.sync_all().at(&tmp)?;
    fs::rename(&tmp, path).at(path)?;
    Ok(())
}

/// `rename` with a copy+remove fallback for cross-device moves.
pub fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst).at(src)?;
    fs::remove_file(src).at(src)?;
    Ok(())
}

pub fn dir_has_entries(path: &Path) -> Result<bool> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CalibError::io(path, e)),
    }
}

/// Copies every regular file under `src` whose extension is listed in
/// `extensions` into the same relative location under `dst`. An empty list
/// copies everything.
pub fn copy_tree_filtered(src: &Path, dst: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let mut copied = Vec::new();
    for entry in walkdir::WalkDir::new(src).follow_links(true) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let keep = extensions.is_empty()
            || path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| extensions.iter().any(|want| want == e))
                .unwrap_or(false);
        if !keep {
            continue;
        }
        let rel = path.strip_prefix(src).unwrap_or(path);
        let target = dst.join(rel);
        if let Some(parent) = target.parent() {
            ensure_dir(parent)?;
        }
        fs::copy(path, &target).at(path)?;
        copied.push(target);
    }
    Ok(copied)
}

/// Removes a tree deepest-first. Entries that vanish while walking are
/// ignored, and a missing root is not an error.
pub fn remove_tree(root: &Path) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(root).contents_first(true) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) if is_not_found(&e) => continue,
            Err(e) => return Err(e.into()),
        };
        let path = entry.path();
        let res = if entry.file_type().is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        match res {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CalibError::io(path, e)),
        }
    }
    Ok(())
}

/// Empties a directory but keeps the directory itself.
pub fn purge_dir_contents(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CalibError::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.at(dir)?;
        let path = entry.path();
        if path.is_dir() {
            remove_tree(&path)?;
        } else {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CalibError::io(&path, e)),
            }
        }
    }
    Ok(())
}

fn is_not_found(err: &walkdir::Error) -> bool {
    err.io_error()
        .map(|e| e.kind() == std::io::ErrorKind::NotFound)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "calib_fsutil_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn copy_tree_filtered_keeps_only_listed_extensions() {
        let root = scratch("copy");
        let src = root.join("src");
        ensure_dir(&src.join("nested")).expect("nested");
        fs::write(src.join("a.nml"), "&a\n/\n").expect("a");
        fs::write(src.join("notes.txt"), "x").expect("notes");
        fs::write(src.join("nested").join("b.nml"), "&b\n/\n").expect("b");

        let dst = root.join("dst");
        let copied = copy_tree_filtered(&src, &dst, &["nml".to_string()]).expect("copy");
        assert_eq!(copied.len(), 2);
        assert!(dst.join("a.nml").exists());
        assert!(dst.join("nested").join("b.nml").exists());
        assert!(!dst.join("notes.txt").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn remove_tree_is_idempotent() {
        let root = scratch("remove");
        ensure_dir(&root.join("x").join("y")).expect("deep");
        fs::write(root.join("x").join("y").join("f"), "1").expect("f");
        remove_tree(&root).expect("first removal");
        assert!(!root.exists());
        remove_tree(&root).expect("second removal is a no-op");
    }

    #[test]
    fn purge_keeps_directory() {
        let root = scratch("purge");
        fs::write(root.join("f1"), "1").expect("f1");
        ensure_dir(&root.join("sub")).expect("sub");
        fs::write(root.join("sub").join("f2"), "2").expect("f2");
        purge_dir_contents(&root).expect("purge");
        assert!(root.exists());
        assert!(!dir_has_entries(&root).expect("read"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let root = scratch("atomic");
        let path = root.join("out.txt");
        atomic_write_bytes(&path, b"one").expect("first");
        atomic_write_bytes(&path, b"two").expect("second");
        assert_eq!(fs::read_to_string(&path).expect("read"), "two");
        let leftovers: Vec<_> = fs::read_dir(&root)
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(root);
    }
}
