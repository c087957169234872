use chrono::SecondsFormat;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

pub const OPS_LOG_NAME: &str = "relay.log";

/// Append-only operations journal kept next to the captured binlogs.
/// One line per operational event, flushed immediately; tracing covers the
/// process-wide log, this file stays with the upstream's data.
#[derive(Debug)]
pub struct OpsLog {
    file: Mutex<File>,
    prefix: String,
}

impl OpsLog {
    pub fn open(dir: &Path, prefix: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(OPS_LOG_NAME))?;
        Ok(OpsLog {
            file: Mutex::new(file),
            prefix: prefix.to_string(),
        })
    }

    fn log(&self, level: &str, message: &str) {
        let now = chrono::Local::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let line = format!("{now}\t{level}\t[{}] {message}\n", self.prefix);
        let mut file = self.file.lock();
        if file.write_all(line.as_bytes()).is_ok() {
            let _ = file.sync_data();
        }
    }

    pub fn info(&self, message: &str) {
        self.log("INFO", message);
    }

    pub fn warn(&self, message: &str) {
        self.log("WARN", message);
    }

    pub fn error(&self, message: &str) {
        self.log("ERR", message);
    }

    pub fn fatal(&self, message: &str) {
        self.log("FATAL", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_tagged_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = OpsLog::open(dir.path(), "main").unwrap();
        log.info("connected to 127.0.0.1:3306");
        log.warn("reconnect 1/10");

        let raw = std::fs::read_to_string(dir.path().join(OPS_LOG_NAME)).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\tINFO\t[main] connected"));
        assert!(lines[1].contains("\tWARN\t[main] reconnect 1/10"));
    }
}
