//! Persistent state store: named documents behind atomic replace.
//!
//! Every document has exactly one writer role, so no locking is needed. A
//! reader never observes a torn write because each write lands in a temp
//! sibling that is renamed over the target.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

/// A named document in the state directory.
pub trait Document: Default + Sized {
    /// File name relative to the state directory.
    const FILE: &'static str;

    fn decode(contents: &str) -> Result<Self>;

    fn encode(&self) -> Result<String>;
}

/// What `StateStore::repair` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The document parsed; left byte-identical.
    Valid,
    /// The document was missing and was written with defaults.
    Created,
    /// The document was unreadable and was replaced with defaults.
    Repaired,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path<D: Document>(&self) -> PathBuf {
        self.dir.join(D::FILE)
    }

    /// Strict read: `Ok(None)` when missing, `Err` when unreadable or unparseable.
    pub fn try_read<D: Document>(&self) -> Result<Option<D>> {
        let path = self.path::<D>();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        D::decode(&contents)
            .map(Some)
            .with_context(|| format!("parse {}", path.display()))
    }

    /// Last committed value. Missing or corrupt content reads as the default;
    /// a parse failure means "never initialized", not a fatal error.
    pub fn read<D: Document>(&self) -> D {
        match self.try_read::<D>() {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                debug!(file = D::FILE, "document missing, using default");
                D::default()
            }
            Err(err) => {
                warn!(file = D::FILE, err = %format!("{err:#}"), "document unreadable, using default");
                D::default()
            }
        }
    }

    pub fn write<D: Document>(&self, doc: &D) -> Result<()> {
        let path = self.path::<D>();
        let contents = doc
            .encode()
            .with_context(|| format!("encode {}", D::FILE))?;
        debug!(file = D::FILE, bytes = contents.len(), "writing document");
        write_atomic(&path, &contents)
    }

    /// Leave a valid document untouched; otherwise write the default.
    ///
    /// A corrupt file is preserved as `<file>.corrupt` before replacement.
    pub fn repair<D: Document>(&self) -> Result<RepairOutcome> {
        let path = self.path::<D>();
        if path.is_dir() {
            return Err(anyhow!("{} is a directory", path.display()));
        }
        match self.try_read::<D>() {
            Ok(Some(_)) => Ok(RepairOutcome::Valid),
            Ok(None) => {
                self.write(&D::default())?;
                Ok(RepairOutcome::Created)
            }
            Err(err) => {
                warn!(file = D::FILE, err = %format!("{err:#}"), "repairing corrupt document");
                let quarantine = sibling(&path, "corrupt");
                fs::rename(&path, &quarantine)
                    .with_context(|| format!("quarantine {}", path.display()))?;
                self.write(&D::default())?;
                Ok(RepairOutcome::Repaired)
            }
        }
    }

    /// Content-addressed candidate source (`candidates/<hash>.txt`). Existing
    /// files are never rewritten.
    pub fn write_candidate(&self, content_hash: &str, content: &str) -> Result<PathBuf> {
        let path = self.candidate_path(content_hash);
        if !path.exists() {
            write_atomic(&path, content)?;
        }
        Ok(path)
    }

    pub fn candidate_path(&self, content_hash: &str) -> PathBuf {
        self.dir.join("candidates").join(format!("{content_hash}.txt"))
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.{suffix}"))
}

/// Write `contents` to a temp sibling and rename it over `path`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = sibling(path, "tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Pretty JSON with a trailing newline.
pub fn to_json_pretty<T: serde::Serialize>(value: &T) -> Result<String> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Note(String);

    impl Document for Note {
        const FILE: &'static str = "note";

        fn decode(contents: &str) -> Result<Self> {
            if contents.starts_with('!') {
                return Err(anyhow!("bad note"));
            }
            Ok(Note(contents.to_string()))
        }

        fn encode(&self) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn write_then_read_returns_committed_value() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(temp.path());
        store.write(&Note("hello".to_string())).expect("write");
        assert_eq!(store.read::<Note>(), Note("hello".to_string()));
        assert!(!temp.path().join("note.tmp").exists());
    }

    #[test]
    fn corrupt_and_missing_read_as_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(temp.path());
        assert_eq!(store.read::<Note>(), Note::default());
        fs::write(temp.path().join("note"), "!garbage").expect("write");
        assert_eq!(store.read::<Note>(), Note::default());
        assert!(store.try_read::<Note>().is_err());
    }

    #[test]
    fn repair_reports_and_quarantines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(temp.path());
        assert_eq!(store.repair::<Note>().expect("repair"), RepairOutcome::Created);
        assert_eq!(store.repair::<Note>().expect("repair"), RepairOutcome::Valid);
        fs::write(temp.path().join("note"), "!garbage").expect("write");
        assert_eq!(store.repair::<Note>().expect("repair"), RepairOutcome::Repaired);
        let quarantined = fs::read_to_string(temp.path().join("note.corrupt")).expect("read");
        assert_eq!(quarantined, "!garbage");
    }

    #[test]
    fn candidates_are_written_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(temp.path());
        let path = store.write_candidate("abc", "first").expect("write");
        store.write_candidate("abc", "second").expect("write");
        assert_eq!(fs::read_to_string(path).expect("read"), "first");
    }
}
