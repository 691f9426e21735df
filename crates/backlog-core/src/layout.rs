//! On-disk layout of one product namespace.
//!
//! ```text
//! products/<product>/
//!   _config/config.toml
//!   _config/profile.toml            # optional custom process profile
//!   items/<kind>/<bucket>/<ID>_<slug>.md
//!   _meta/counters/<CODE>.counter   # last issued sequence per kind
//!   _meta/counters/<CODE>.lock
//!   _meta/locks/<ID>.lock           # ownership marker (Conflict Guard)
//!   _meta/locks/<ID>.mutex          # short mutation lock
//!   _index/backlog.sqlite3          # derived index, disposable
//! ```
//!
//! Records are written to a temporary sibling and renamed into place, so a
//! concurrent reader sees either the old or the new file, never a torn one.

use crate::error::{Result, StoreError};
use crate::model::item::{Kind, parse_id};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Path conventions for a product root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.root.join("_config")
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join("config.toml")
    }

    #[must_use]
    pub fn items_dir(&self) -> PathBuf {
        self.root.join("items")
    }

    #[must_use]
    pub fn kind_dir(&self, kind: Kind) -> PathBuf {
        self.items_dir().join(kind.folder())
    }

    #[must_use]
    pub fn counters_dir(&self) -> PathBuf {
        self.root.join("_meta").join("counters")
    }

    #[must_use]
    pub fn counter_path(&self, kind: Kind) -> PathBuf {
        self.counters_dir().join(format!("{}.counter", kind.code()))
    }

    #[must_use]
    pub fn counter_lock_path(&self, kind: Kind) -> PathBuf {
        self.counters_dir().join(format!("{}.lock", kind.code()))
    }

    #[must_use]
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("_meta").join("locks")
    }

    #[must_use]
    pub fn owner_lock_path(&self, item_id: &str) -> PathBuf {
        self.locks_dir().join(format!("{item_id}.lock"))
    }

    #[must_use]
    pub fn mutation_lock_path(&self, item_id: &str) -> PathBuf {
        self.locks_dir().join(format!("{item_id}.mutex"))
    }

    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.root.join("_index").join("backlog.sqlite3")
    }

    /// Whether the product has been initialized.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.items_dir().is_dir()
    }

    /// Create the directory skeleton. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a directory cannot be created.
    pub fn ensure_dirs(&self) -> Result<()> {
        let mut dirs = vec![
            self.config_dir(),
            self.counters_dir(),
            self.locks_dir(),
            self.root.join("_index"),
        ];
        dirs.extend(Kind::ALL.into_iter().map(|kind| self.kind_dir(kind).join("0000")));
        for dir in dirs {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(())
    }

    /// Path for a new record: `items/<kind>/<bucket>/<ID>_<slug>.md`.
    #[must_use]
    pub fn record_path(&self, kind: Kind, id: &str, seq: u64, title: &str) -> PathBuf {
        self.bucket_dir(kind, seq)
            .join(format!("{id}_{}.md", slugify(title)))
    }

    /// Directory a record with sequence `seq` is written to.
    #[must_use]
    pub fn bucket_dir(&self, kind: Kind, seq: u64) -> PathBuf {
        self.kind_dir(kind).join(bucket(seq))
    }

    /// Record for `item_id` in its expected bucket only.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the bucket cannot be listed.
    pub fn find_in_bucket(&self, item_id: &str) -> Result<Option<PathBuf>> {
        match parse_id(item_id) {
            Some((_, kind, seq)) => find_in_dir(&self.bucket_dir(kind, seq), &format!("{item_id}_")),
            None => Ok(None),
        }
    }

    /// Locate the record file for `item_id`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a directory cannot be listed.
    pub fn find_record(&self, item_id: &str) -> Result<Option<PathBuf>> {
        if let Some(found) = self.find_in_bucket(item_id)? {
            return Ok(Some(found));
        }
        // Records moved by hand may sit in another bucket.
        let prefix = format!("{item_id}_");
        Ok(self
            .record_files()?
            .into_iter()
            .find(|path| file_name(path).starts_with(&prefix)))
    }

    /// Every record file under `items/`, sorted by path.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a directory cannot be listed.
    pub fn record_files(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        collect_records(&self.items_dir(), &mut out)?;
        out.sort();
        Ok(out)
    }

    /// Record path relative to the product root, with `/` separators.
    #[must_use]
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_record_file(path: &Path) -> bool {
    let name = file_name(path);
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".md") && !lower.starts_with("readme") && !lower.ends_with(".index.md")
}

fn find_in_dir(dir: &Path, prefix: &str) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    for entry in fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))? {
        let path = entry.map_err(|e| StoreError::io(dir, e))?.path();
        if is_record_file(&path) && file_name(&path).starts_with(prefix) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

fn collect_records(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))? {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| StoreError::io(&path, e))?;
        if file_type.is_dir() {
            let hidden = file_name(&path).starts_with(['_', '.']);
            if !hidden {
                collect_records(&path, out)?;
            }
        } else if is_record_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

/// Hundreds bucket for a sequence number: 7 → `0000`, 142 → `0100`.
#[must_use]
pub fn bucket(seq: u64) -> String {
    format!("{:04}", (seq / 100) * 100)
}

/// File-name slug derived from a title.
#[must_use]
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= 48 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug.to_string()
    }
}

/// Replace `path` with `contents` via a temporary sibling and rename.
///
/// # Errors
///
/// Returns an I/O error if the temporary file cannot be written or renamed.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    static SEQ: AtomicU64 = AtomicU64::new(0);

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    let tmp = dir.join(format!(
        ".{}.tmp-{}-{}",
        file_name(path),
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_data()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("Fix login: timeout (prod)!"), "fix-login-timeout-prod");
        assert_eq!(slugify("   "), "untitled");
        assert_eq!(slugify("Ünïcode only ☃"), "n-code-only");
        assert!(slugify(&"word ".repeat(40)).len() <= 48);
    }

    #[test]
    fn bucket_groups_by_hundreds() {
        assert_eq!(bucket(1), "0000");
        assert_eq!(bucket(99), "0000");
        assert_eq!(bucket(100), "0100");
        assert_eq!(bucket(1234), "1200");
    }

    #[test]
    fn record_path_and_lookup() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        layout.ensure_dirs()?;

        let path = layout.record_path(Kind::Task, "APP-TSK-0101", 101, "Add retries");
        assert!(path.ends_with("items/task/0100/APP-TSK-0101_add-retries.md"));
        write_atomic(&path, b"---\n")?;
        fs::write(layout.kind_dir(Kind::Task).join("README.md"), "docs").expect("readme");

        assert_eq!(layout.find_record("APP-TSK-0101")?, Some(path.clone()));
        assert_eq!(layout.find_record("APP-TSK-0102")?, None);
        assert_eq!(layout.record_files()?, vec![path.clone()]);
        assert_eq!(
            layout.relative(&path),
            "items/task/0100/APP-TSK-0101_add-retries.md"
        );
        Ok(())
    }

    #[test]
    fn write_atomic_replaces_contents() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/file.md");
        write_atomic(&path, b"one")?;
        write_atomic(&path, b"two")?;
        assert_eq!(fs::read_to_string(&path).expect("read"), "two");
        let leftovers = fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .count();
        assert_eq!(leftovers, 1);
        Ok(())
    }
}
