//! Confinement of request-derived paths to a server's root directory.
//!
//! A candidate is accepted only when its canonical form is the canonical
//! root or lies beneath it, compared component by component. Lexical
//! escapes (`..` past the root, absolute names) are refused before the
//! filesystem is consulted at all.

use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{ControlError, Result};

/// Join `name` onto `root` and return the canonical result, or
/// `InvalidPath` if it would land outside `root`. A `root` that does not
/// exist at all is `RootMissing`.
///
/// The target itself need not exist: a missing tail is resolved against its
/// deepest existing ancestor, so callers can report "missing" separately
/// and only for paths that are already known to be inside the root.
pub fn safe_join(root: &Path, name: impl AsRef<Path>) -> Result<PathBuf> {
    let name = name.as_ref();
    let relative = normalize_relative(name).ok_or_else(|| rejected(root, name))?;
    let canonical_root = std::fs::canonicalize(root).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ControlError::RootMissing(root.display().to_string()),
        _ => rejected(root, name),
    })?;

    let candidate = canonical_root.join(&relative);
    let resolved = resolve_existing(&candidate).ok_or_else(|| rejected(root, name))?;

    // Path::starts_with matches whole components: /srv/app-evil is not under /srv/app.
    if resolved.starts_with(&canonical_root) {
        Ok(resolved)
    } else {
        Err(rejected(root, name))
    }
}

fn rejected(root: &Path, name: &Path) -> ControlError {
    ControlError::InvalidPath(format!(
        "{} is outside {}",
        name.display(),
        root.display()
    ))
}

/// Lexically normalise a relative name. `None` if it is absolute or climbs
/// above its starting point.
fn normalize_relative(name: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;

    for component in name.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(out)
}

/// Canonicalise `path`, tolerating missing trailing components.
fn resolve_existing(path: &Path) -> Option<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(p) => Some(p),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            // Dangling symlink: its target cannot be judged.
            if std::fs::symlink_metadata(path).is_ok() {
                return None;
            }
            let parent = path.parent()?;
            let file_name = path.file_name()?;
            resolve_existing(parent).map(|p| p.join(file_name))
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    /// Layout: <tmp>/app (root), <tmp>/app-evil (sibling), <tmp>/outside.
    fn fixture() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("app");
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::write(root.join("start.sh"), "#!/bin/sh\n").unwrap();
        std::fs::write(root.join("bin/tool.sh"), "#!/bin/sh\n").unwrap();

        let evil = dir.path().join("app-evil");
        std::fs::create_dir_all(&evil).unwrap();
        std::fs::write(evil.join("start.sh"), "#!/bin/sh\n").unwrap();

        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("secret"), "x").unwrap();

        (dir, root)
    }

    fn canon(p: &Path) -> PathBuf {
        std::fs::canonicalize(p).unwrap()
    }

    fn is_invalid(result: Result<PathBuf>) -> bool {
        matches!(result, Err(ControlError::InvalidPath(_)))
    }

    #[test]
    fn test_plain_script_accepted() {
        let (_dir, root) = fixture();
        let resolved = safe_join(&root, "start.sh").unwrap();
        assert_eq!(resolved, canon(&root.join("start.sh")));
    }

    #[test]
    fn test_nested_and_dotted_names_accepted() {
        let (_dir, root) = fixture();
        assert_eq!(
            safe_join(&root, "bin/tool.sh").unwrap(),
            canon(&root.join("bin/tool.sh"))
        );
        assert_eq!(
            safe_join(&root, "./bin/../start.sh").unwrap(),
            canon(&root.join("start.sh"))
        );
    }

    #[test]
    fn test_root_itself_accepted() {
        let (_dir, root) = fixture();
        assert_eq!(safe_join(&root, ".").unwrap(), canon(&root));
        assert_eq!(safe_join(&root, "").unwrap(), canon(&root));
    }

    #[test]
    fn test_missing_target_inside_root_accepted() {
        let (_dir, root) = fixture();
        let resolved = safe_join(&root, "server.log").unwrap();
        assert_eq!(resolved, canon(&root).join("server.log"));

        let resolved = safe_join(&root, "new/dir/file").unwrap();
        assert_eq!(resolved, canon(&root).join("new/dir/file"));
    }

    #[test]
    fn test_parent_traversal_rejected() {
        let (_dir, root) = fixture();
        assert!(is_invalid(safe_join(&root, "../outside/secret")));
        assert!(is_invalid(safe_join(&root, "..")));
        assert!(is_invalid(safe_join(&root, "bin/../../outside/secret")));
        assert!(is_invalid(safe_join(&root, "bin/../../../../../../etc/passwd")));
    }

    #[test]
    fn test_traversal_to_missing_target_rejected() {
        let (_dir, root) = fixture();
        // Same answer whether or not the outside target exists.
        assert!(is_invalid(safe_join(&root, "../outside/secret")));
        assert!(is_invalid(safe_join(&root, "../outside/does-not-exist")));
        assert!(is_invalid(safe_join(&root, "../no-such-dir/x")));
    }

    #[test]
    fn test_absolute_override_rejected() {
        let (_dir, root) = fixture();
        assert!(is_invalid(safe_join(&root, "/etc/passwd")));
        let inside_but_absolute = root.join("start.sh");
        assert!(is_invalid(safe_join(&root, &inside_but_absolute)));
    }

    #[test]
    fn test_sibling_prefix_rejected() {
        let (_dir, root) = fixture();
        assert!(is_invalid(safe_join(&root, "../app-evil/start.sh")));
        assert!(is_invalid(safe_join(&root, "../app-evil")));
    }

    #[test]
    fn test_symlink_to_sibling_rejected() {
        let (dir, root) = fixture();
        symlink(dir.path().join("app-evil"), root.join("evil")).unwrap();
        assert!(is_invalid(safe_join(&root, "evil/start.sh")));
        assert!(is_invalid(safe_join(&root, "evil/missing.sh")));
    }

    #[test]
    fn test_symlink_escapes_rejected() {
        let (dir, root) = fixture();
        symlink(dir.path().join("outside"), root.join("linkdir")).unwrap();
        symlink(dir.path().join("outside/secret"), root.join("linkfile")).unwrap();

        assert!(is_invalid(safe_join(&root, "linkdir/secret")));
        assert!(is_invalid(safe_join(&root, "linkdir")));
        assert!(is_invalid(safe_join(&root, "linkfile")));
    }

    #[test]
    fn test_dangling_symlink_rejected() {
        let (dir, root) = fixture();
        symlink(dir.path().join("outside/not-yet"), root.join("dangling")).unwrap();
        assert!(is_invalid(safe_join(&root, "dangling")));
    }

    #[test]
    fn test_symlink_within_root_accepted() {
        let (_dir, root) = fixture();
        symlink(root.join("bin/tool.sh"), root.join("restart.sh")).unwrap();
        assert_eq!(
            safe_join(&root, "restart.sh").unwrap(),
            canon(&root.join("bin/tool.sh"))
        );
    }

    #[test]
    fn test_root_reached_through_symlink() {
        let (dir, root) = fixture();
        let alias = dir.path().join("alias");
        symlink(&root, &alias).unwrap();
        assert_eq!(
            safe_join(&alias, "start.sh").unwrap(),
            canon(&root.join("start.sh"))
        );
        assert!(is_invalid(safe_join(&alias, "../outside/secret")));
    }

    #[test]
    fn test_missing_root_is_not_a_traversal() {
        let (dir, _root) = fixture();
        let err = safe_join(&dir.path().join("gone"), "start.sh").unwrap_err();
        assert!(matches!(err, ControlError::RootMissing(_)), "{err:?}");

        // Lexical escapes are still refused first, even without a root.
        assert!(is_invalid(safe_join(&dir.path().join("gone"), "../outside/secret")));
    }

    #[test]
    fn test_rejection_message_is_uniform() {
        let (dir, root) = fixture();
        symlink(dir.path().join("outside"), root.join("linkdir")).unwrap();

        let lexical = safe_join(&root, "../outside/secret").unwrap_err();
        let symlinked = safe_join(&root, "linkdir/secret").unwrap_err();
        assert_eq!(lexical.public_message(), symlinked.public_message());
        assert_eq!(lexical.public_message(), "invalid path");
    }

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize_relative(Path::new("a/./b")), Some(PathBuf::from("a/b")));
        assert_eq!(normalize_relative(Path::new("a/../b")), Some(PathBuf::from("b")));
        assert_eq!(normalize_relative(Path::new("../a")), None);
        assert_eq!(normalize_relative(Path::new("/a")), None);
    }
}
