use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Append-only JSONL file. One record per line, never rewritten.
#[derive(Debug)]
pub struct LedgerLog {
    file: File,
    path: PathBuf,
    fsync: bool,
}

impl LedgerLog {
    pub fn open(path: &Path, fsync: bool) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            fsync,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Single `write_all` of line + newline so a record is either fully
    /// present or absent.
    pub fn append(&mut self, line: &str) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.file.write_all(&buf)?;
        self.file.flush()?;
        if self.fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Stream non-blank lines with their 1-based line numbers.
    pub fn for_each_line<E, F>(path: &Path, mut f: F) -> Result<(), E>
    where
        E: From<std::io::Error>,
        F: FnMut(usize, String) -> Result<(), E>,
    {
        let reader = BufReader::new(File::open(path)?);
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            f(idx + 1, line)?;
        }
        Ok(())
    }

    /// Read all lines with their 1-based line numbers. Blank lines skipped.
    pub fn read_lines(path: &Path) -> std::io::Result<Vec<(usize, String)>> {
        let mut out = Vec::new();
        Self::for_each_line(path, |line_no, line| {
            out.push((line_no, line));
            Ok::<(), std::io::Error>(())
        })?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/ledger.jsonl");
        let mut log = LedgerLog::open(&path, true).unwrap();
        log.append(r#"{"a":1}"#).unwrap();
        log.append(r#"{"a":2}"#).unwrap();
        drop(log);

        let lines = LedgerLog::read_lines(&path).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], (2, r#"{"a":2}"#.to_string()));
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        LedgerLog::open(&path, false).unwrap().append("{}").unwrap();
        LedgerLog::open(&path, false).unwrap().append("{}").unwrap();
        assert_eq!(LedgerLog::read_lines(&path).unwrap().len(), 2);
    }
}
