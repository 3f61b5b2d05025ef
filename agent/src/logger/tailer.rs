//! CSV log tailer.
//!
//! Follows the server's CSV log through rotations. File names embed a
//! timestamp, so lexicographic order equals chronological order and "the
//! next file" is the smallest name strictly greater than the current one.
//! The byte offset only advances once a complete record has been read, so
//! a record that is still being written is retried on the next tick.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glob::glob;

use crate::logger::output::TextLog;
use crate::logger::record::{read_csv_record, CsvRead, CsvReadError};
use crate::logger::record::Severity;
use crate::state::Shared;

pub struct CsvTailer {
    shared: Arc<Shared>,
    log_directory: PathBuf,
    /// Name of the CSV file being (or last) parsed; starts at the
    /// launcher-provided previous name so already-archived logs are skipped.
    csv_name: String,
    csv_path: Option<PathBuf>,
    offset: u64,
    reader: Option<BufReader<File>>,
}

impl CsvTailer {
    pub fn new(shared: Arc<Shared>, log_directory: PathBuf, prev_csv_name: String) -> CsvTailer {
        CsvTailer {
            shared,
            log_directory,
            csv_name: prev_csv_name,
            csv_path: None,
            offset: 0,
            reader: None,
        }
    }

    pub fn current_name(&self) -> &str {
        &self.csv_name
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Yield the next complete CSV record, rotating files when the current
    /// one is consumed. `None` means nothing to read right now.
    pub fn next(&mut self, ncolumns: usize, textlog: &mut TextLog) -> Option<Vec<String>> {
        if self.need_advance() && !self.advance(textlog) {
            return None;
        }
        let reader = self.reader.as_mut()?;

        if let Err(e) = reader.seek(SeekFrom::Start(self.offset)) {
            self.read_failed(&e.to_string());
            return None;
        }

        match read_csv_record(reader, ncolumns) {
            Ok(CsvRead::Record(fields)) => {
                match self.reader.as_mut().unwrap().stream_position() {
                    Ok(pos) => self.offset = pos,
                    Err(e) => {
                        self.read_failed(&e.to_string());
                        return None;
                    }
                }
                Some(fields)
            }
            Ok(CsvRead::Incomplete) => None,
            Err(CsvReadError::MalformedRecord { expected, found }) => {
                self.read_failed(&format!(
                    "expected {} columns, found {}",
                    expected, found
                ));
                None
            }
            Err(CsvReadError::Io(e)) => {
                self.read_failed(&e.to_string());
                None
            }
        }
    }

    fn need_advance(&self) -> bool {
        if self.reader.is_none() {
            return true;
        }
        match self.csv_path.as_ref().map(std::fs::metadata) {
            Some(Ok(meta)) => self.offset >= meta.len(),
            _ => true,
        }
    }

    /// Move to the next CSV file if one exists. Returns true when a file is
    /// open and ready to read afterwards.
    fn advance(&mut self, textlog: &mut TextLog) -> bool {
        if self.reader.is_none() {
            if let Some(path) = self.csv_path.as_ref() {
                if path.exists() {
                    // reopen the current file after a read error
                    return self.open_current();
                }
                // current file vanished; fall through and look for a newer one
                self.csv_path = None;
            }
        }

        if self.shared.shutdown_message_found() {
            return false; // must end with the current log
        }

        let Some(next_name) = self.find_next_csv() else {
            return false;
        };
        if self.reader.is_some() && next_name == self.csv_name {
            return false;
        }

        // retire the old file: its textlog takes over the CSV base name
        if self.reader.take().is_some() {
            if let Some(old) = self.csv_path.as_ref() {
                textlog.retire(old);
            }
        }

        self.csv_path = Some(self.log_directory.join(&next_name));
        self.csv_name = next_name;
        self.offset = 0;
        self.open_current()
    }

    fn open_current(&mut self) -> bool {
        let Some(path) = self.csv_path.as_ref() else {
            return false;
        };
        match File::open(path) {
            Ok(file) => {
                tracing::debug!("read csvlog \"{}\"", path.display());
                self.reader = Some(BufReader::new(file));
                true
            }
            Err(_) => false,
        }
    }

    /// Smallest `.csv` name in the log directory strictly greater than the
    /// current one.
    fn find_next_csv(&self) -> Option<String> {
        let pattern = self.log_directory.join("*.csv");
        let mut best: Option<String> = None;

        let entries = glob(pattern.to_str()?).ok()?;
        for path in entries.flatten() {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name <= self.csv_name.as_str() {
                continue;
            }
            if best.as_deref().map_or(true, |b| name < b) {
                best = Some(name.to_string());
            }
        }
        best
    }

    fn read_failed(&mut self, cause: &str) {
        let path = self
            .csv_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        self.shared.elog(
            Severity::Warning,
            format!("could not read csvlog file \"{}\": {}", path, cause),
        );
        self.reader = None;
        self.offset = 0;
    }
}

/// Sibling path with the extension swapped for `.log`.
pub fn log_buddy_path(csv_path: &Path) -> PathBuf {
    csv_path.with_extension("log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::io::Write;

    fn fields_csv(n: usize, tag: &str) -> String {
        let mut cols = vec![tag.to_string()];
        cols.extend((1..n).map(|i| format!("c{}", i)));
        cols.join(",") + "\n"
    }

    fn setup() -> (tempfile::TempDir, CsvTailer, TextLog) {
        let dir = tempfile::tempdir().unwrap();
        let shared = Shared::new(Config::default());
        let tailer = CsvTailer::new(
            shared,
            dir.path().to_path_buf(),
            "0000-00-00_000000.csv".to_string(),
        );
        let textlog = TextLog::new(dir.path().join("pg_statsinfo.log"), 0o600);
        (dir, tailer, textlog)
    }

    #[test]
    fn reads_records_and_advances_offset() {
        let (dir, mut tailer, mut textlog) = setup();
        let csv = dir.path().join("2024-01-01_100000.csv");
        std::fs::write(&csv, fields_csv(3, "one") + &fields_csv(3, "two")).unwrap();

        let first = tailer.next(3, &mut textlog).unwrap();
        assert_eq!(first[0], "one");
        let offset_after_first = tailer.offset();
        assert!(offset_after_first > 0);

        let second = tailer.next(3, &mut textlog).unwrap();
        assert_eq!(second[0], "two");
        assert!(tailer.offset() > offset_after_first);

        assert!(tailer.next(3, &mut textlog).is_none());
    }

    #[test]
    fn partial_record_keeps_offset_until_completed() {
        let (dir, mut tailer, mut textlog) = setup();
        let csv = dir.path().join("2024-01-01_100000.csv");
        std::fs::write(&csv, "a,b").unwrap();

        assert!(tailer.next(3, &mut textlog).is_none());
        assert_eq!(tailer.offset(), 0);

        let mut f = std::fs::OpenOptions::new().append(true).open(&csv).unwrap();
        f.write_all(b",c\n").unwrap();
        drop(f);

        let rec = tailer.next(3, &mut textlog).unwrap();
        assert_eq!(rec, vec!["a", "b", "c"]);
    }

    #[test]
    fn rotates_to_the_next_file_and_retires_the_textlog() {
        let (dir, mut tailer, mut textlog) = setup();
        let first = dir.path().join("2024-01-01_100000.csv");
        std::fs::write(&first, fields_csv(3, "old")).unwrap();

        assert_eq!(tailer.next(3, &mut textlog).unwrap()[0], "old");
        assert_eq!(tailer.current_name(), "2024-01-01_100000.csv");

        // textlog content destined for the first file's window
        std::fs::write(dir.path().join("pg_statsinfo.log"), "routed lines\n").unwrap();

        let second = dir.path().join("2024-01-01_110000.csv");
        std::fs::write(&second, fields_csv(3, "new")).unwrap();

        let rec = tailer.next(3, &mut textlog).unwrap();
        assert_eq!(rec[0], "new");
        assert_eq!(tailer.current_name(), "2024-01-01_110000.csv");

        // the buddy .log took over the retired CSV's base name
        let buddy = dir.path().join("2024-01-01_100000.log");
        assert_eq!(std::fs::read_to_string(buddy).unwrap(), "routed lines\n");
        assert!(!dir.path().join("pg_statsinfo.log").exists());
    }

    #[test]
    fn skips_names_not_greater_than_previous() {
        let dir = tempfile::tempdir().unwrap();
        let shared = Shared::new(Config::default());
        let mut tailer = CsvTailer::new(
            shared,
            dir.path().to_path_buf(),
            "2024-01-01_100000.csv".to_string(),
        );
        let mut textlog = TextLog::new(dir.path().join("pg_statsinfo.log"), 0o600);

        std::fs::write(dir.path().join("2024-01-01_090000.csv"), "x,y,z\n").unwrap();
        assert!(tailer.next(3, &mut textlog).is_none());

        std::fs::write(dir.path().join("2024-01-01_110000.csv"), "a,b,c\n").unwrap();
        assert_eq!(tailer.next(3, &mut textlog).unwrap()[0], "a");
    }

    #[test]
    fn malformed_record_closes_and_reopens_from_start() {
        let (dir, mut tailer, mut textlog) = setup();
        let csv = dir.path().join("2024-01-01_100000.csv");
        std::fs::write(&csv, "only,two\n").unwrap();

        assert!(tailer.next(3, &mut textlog).is_none()); // malformed, closed

        std::fs::write(&csv, fields_csv(3, "fixed")).unwrap();
        let rec = tailer.next(3, &mut textlog).unwrap();
        assert_eq!(rec[0], "fixed");
    }
}
