//! Hash-indexed layout of an Authority certificate directory.
//!
//! OpenSSL looks trust anchors up by `<subject hash>.<n>` names (the
//! `c_rehash` convention). The store keeps its certificates in regular files
//! and maintains one symbolic link per certificate pointing at them. Links
//! are never patched: every rebuild deletes all links in the directory and
//! recreates them from the live entry list, so `<n>` is always the smallest
//! suffix not taken by an earlier entry with the same hash.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use log::{debug, error};

use crate::error::{CertError, Result};

/// One planned reference: `<dir>/<name>` → `target` (a file name in `<dir>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name:   String,
    pub target: PathBuf,
}

/// Assign `<hash>.<n>` names to `(subject hash, backing file)` pairs, in order.
pub fn plan<'a, I>(entries: I) -> Vec<Link>
where
    I: IntoIterator<Item = (u32, &'a Path)>,
{
    let mut next_suffix: HashMap<u32, u32> = HashMap::new();
    entries
        .into_iter()
        .map(|(hash, file)| {
            let suffix = next_suffix.entry(hash).or_insert(0);
            let name = format!("{hash:08x}.{suffix}");
            *suffix += 1;
            let target = file
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| file.to_path_buf());
            Link { name, target }
        })
        .collect()
}

/// Remove every symbolic link directly inside `dir`.
pub fn clear_links(dir: &Path) -> Result<()> {
    for dent in fs::read_dir(dir)? {
        let dent = dent?;
        if dent.file_type()?.is_symlink() {
            let path = dent.path();
            fs::remove_file(&path).map_err(|e| {
                error!("failed to remove link {}: {e}", path.display());
                CertError::internal(format!("cannot remove link {}: {e}", path.display()))
            })?;
        }
    }
    Ok(())
}

/// Replace all links in `dir` with `links`.
pub fn rebuild(dir: &Path, links: &[Link]) -> Result<()> {
    clear_links(dir)?;
    for link in links {
        let path = dir.join(&link.name);
        symlink(&link.target, &path).map_err(|e| {
            CertError::internal(format!("cannot create link {}: {e}", path.display()))
        })?;
        debug!("{} -> {}", link.name, link.target.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffixes_are_dense_per_hash() {
        let a = PathBuf::from("/store/a.pem");
        let b = PathBuf::from("/store/b.pem");
        let c = PathBuf::from("/store/c.pem");
        let links = plan([(0xdead_beef, a.as_path()), (0x1, b.as_path()), (0xdead_beef, c.as_path())]);
        let names: Vec<_> = links.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["deadbeef.0", "00000001.0", "deadbeef.1"]);
        assert_eq!(links[2].target, PathBuf::from("c.pem"));
    }

    #[test]
    fn rebuild_drops_stale_links_and_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.pem"), "a").unwrap();
        fs::write(dir.path().join("b.pem"), "b").unwrap();
        symlink("gone.pem", dir.path().join("cafef00d.0")).unwrap();

        let b = dir.path().join("b.pem");
        rebuild(dir.path(), &plan([(0xcafe_f00d, b.as_path())])).unwrap();

        let link = dir.path().join("cafef00d.0");
        assert_eq!(fs::read_to_string(&link).unwrap(), "b");
        assert!(dir.path().join("a.pem").exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);

        rebuild(dir.path(), &[]).unwrap();
        assert!(fs::symlink_metadata(&link).is_err());
    }
}
