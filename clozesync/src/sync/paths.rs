use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("{0} is outside the vault root")]
    OutsideRoot(PathBuf),
    #[error("path contains unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("path is not valid UTF-8: {0}")]
    NotUtf8(PathBuf),
    #[error("path is empty")]
    Empty,
}

/// Stable cache key for a note file: its path below the vault root with `/`
/// separators, e.g. `Uni/Physik/Ausdehnung.md`.
pub fn vault_key(root: &Path, path: &Path) -> Result<String, PathError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| PathError::OutsideRoot(path.to_path_buf()))?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| PathError::NotUtf8(path.to_path_buf()))?,
            ),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(
                    relative.display().to_string(),
                ));
            }
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

pub fn path_for_key(root: &Path, key: &str) -> Result<PathBuf, PathError> {
    if key.is_empty() {
        return Err(PathError::Empty);
    }
    let mut out = root.to_path_buf();
    for component in Path::new(key).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(key.to_string()));
            }
        }
    }
    Ok(out)
}

/// All `.md` files below `root`, sorted by path. Entries equal to or below an
/// ignored path are skipped; relative ignore entries are resolved against
/// `root`.
pub fn discover_markdown(root: &Path, ignore: &[PathBuf]) -> io::Result<Vec<PathBuf>> {
    let ignore: Vec<PathBuf> = ignore
        .iter()
        .map(|entry| {
            if entry.is_absolute() {
                entry.clone()
            } else {
                root.join(entry)
            }
        })
        .collect();
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !ignore.iter().any(|skip| entry.path().starts_with(skip)));
    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == "md")
        {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Writes `bytes` next to `target` and renames over it, so readers see either
/// the old or the new contents.
pub fn replace_file(target: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let partial = partial_path(target);
    let result = (|| {
        let mut file = std::fs::File::create(&partial)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
        std::fs::rename(&partial, target)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&partial);
    }
    result
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn vault_key_uses_forward_slashes() {
        let root = PathBuf::from("/vault");
        let key = vault_key(&root, Path::new("/vault/Uni/Physik/Ausdehnung.md")).unwrap();
        assert_eq!(key, "Uni/Physik/Ausdehnung.md");
        assert_eq!(
            path_for_key(&root, &key).unwrap(),
            PathBuf::from("/vault/Uni/Physik/Ausdehnung.md")
        );
    }

    #[test]
    fn rejects_paths_outside_root_and_parent_components() {
        let root = PathBuf::from("/vault");
        assert!(matches!(
            vault_key(&root, Path::new("/elsewhere/a.md")),
            Err(PathError::OutsideRoot(_))
        ));
        assert!(matches!(
            path_for_key(&root, "../secret.md"),
            Err(PathError::UnsupportedComponent(_))
        ));
    }

    #[test]
    fn discovers_markdown_and_honours_ignore_list() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("notes/deep")).unwrap();
        std::fs::create_dir_all(root.join("templates")).unwrap();
        std::fs::write(root.join("notes/b.md"), "b").unwrap();
        std::fs::write(root.join("notes/deep/a.md"), "a").unwrap();
        std::fs::write(root.join("notes/image.png"), "png").unwrap();
        std::fs::write(root.join("templates/t.md"), "t").unwrap();

        let files = discover_markdown(root, &[PathBuf::from("templates")]).unwrap();
        let keys: Vec<_> = files
            .iter()
            .map(|path| vault_key(root, path).unwrap())
            .collect();
        assert_eq!(keys, vec!["notes/b.md", "notes/deep/a.md"]);
    }

    #[test]
    fn replace_file_leaves_no_partial_behind() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("cache/cache.json");
        replace_file(&target, b"{}").unwrap();
        replace_file(&target, b"{\"v\":1}").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"{\"v\":1}");
        assert!(!partial_path(&target).exists());
        assert_eq!(
            partial_path(&target),
            dir.path().join("cache/cache.json.partial")
        );
    }
}
