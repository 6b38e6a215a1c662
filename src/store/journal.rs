//! JSON-lines journal
//!
//! One record per line. Research records and schema versions are written
//! once; jobs and field candidates are written as a fresh snapshot on every
//! change and the last snapshot wins on replay.
//! Erasure rewrites the whole file through a temp file and an atomic rename.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::records::{AttributeSet, BiasResult};
use crate::diff::DiffResult;
use crate::error::{Error, Result};
use crate::evolution::CandidateRecord;
use crate::queue::job::BiasJob;
use crate::schema::types::SchemaRecord;

/// Journal file name inside the data directory
pub const JOURNAL_FILE: &str = "audit.jsonl";

/// One journal line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum JournalEntry {
    AttributeSet(AttributeSet),
    Diff(DiffResult),
    Result(BiasResult),
    Job(BiasJob),
    Schema(SchemaRecord),
    Candidate(CandidateRecord),
}

/// Append handle on the journal file
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Open (creating if needed) and replay existing entries
    ///
    /// Lines that fail to parse are skipped with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<JournalEntry>)> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut entries = Vec::new();
        if path.exists() {
            let file = File::open(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            for (line_no, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|e| Error::IoRead {
                    path: path.clone(),
                    source: e,
                })?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalEntry>(&line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!(
                        path = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "Skipping malformed journal line"
                    ),
                }
            }
        }

        let file = Self::open_append(&path)?;
        debug!(path = %path.display(), entries = entries.len(), "Journal opened");
        Ok((Self { path, file }, entries))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append entries and sync them to disk
    pub fn append(&mut self, entries: &[JournalEntry]) -> Result<()> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        self.file
            .write_all(&buf)
            .and_then(|_| self.file.sync_data())
            .map_err(|e| Error::IoWrite {
                path: self.path.clone(),
                source: e,
            })
    }

    /// Replace the journal with exactly `entries`
    pub fn rewrite<'a, I>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a JournalEntry>,
    {
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let write_err = |e: std::io::Error| Error::IoWrite {
            path: self.path.clone(),
            source: e,
        };

        let mut tmp = NamedTempFile::new_in(&dir).map_err(write_err)?;
        for entry in entries {
            serde_json::to_writer(&mut tmp, entry)?;
            tmp.write_all(b"\n").map_err(write_err)?;
        }
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;

        self.file = Self::open_append(&self.path)?;
        Ok(())
    }

    fn open_append(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::IoWrite {
                path: path.to_path_buf(),
                source: e,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::{AttributeValue, SchemaVersion, TypedAttributeMap};
    use crate::store::Pseudonym;
    use crate::types::SourceTag;
    use tempfile::TempDir;

    fn set(p: &str) -> JournalEntry {
        let mut values = TypedAttributeMap::new();
        values.insert("age".into(), AttributeValue::Text("adult".into()));
        JournalEntry::AttributeSet(AttributeSet::new(
            Pseudonym::new(p).unwrap(),
            SourceTag::Description,
            SchemaVersion::new(1, 0),
            values,
        ))
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(JOURNAL_FILE);
        {
            let (mut journal, entries) = Journal::open(&path).unwrap();
            assert!(entries.is_empty());
            journal.append(&[set("a"), set("b")]).unwrap();
        }
        let (_, entries) = Journal::open(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], JournalEntry::AttributeSet(_)));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(JOURNAL_FILE);
        {
            let (mut journal, _) = Journal::open(&path).unwrap();
            journal.append(&[set("a")]).unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{{not json").unwrap();
        let (_, entries) = Journal::open(&path).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_rewrite_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(JOURNAL_FILE);
        let (mut journal, _) = Journal::open(&path).unwrap();
        journal.append(&[set("a"), set("b")]).unwrap();

        let keep = set("b");
        journal.rewrite([&keep]).unwrap();
        journal.append(&[set("c")]).unwrap();

        let (_, entries) = Journal::open(&path).unwrap();
        assert_eq!(entries.len(), 2);
    }
}
