use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;
use serde::Serialize;

/// One line of the access log.
#[derive(Debug, Serialize)]
pub struct AccessEntry<'a> {
    pub ts: String,
    pub ip: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub status: u16,
    pub outcome: &'a str,
    pub us: u64,
    pub ua: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<&'a str>,
}

/// Appends one JSON object per request. Writes go straight to the file so
/// entries are visible immediately.
pub struct AccessLogger {
    writer: Mutex<File>,
}

impl AccessLogger {
    pub fn new(path: &str) -> std::io::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(file),
        })
    }

    pub fn log(&self, entry: &AccessEntry<'_>) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(_) => return,
        };
        let mut f = self.writer.lock();
        let _ = writeln!(f, "{}", line);
    }
}

pub fn timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_are_json_lines_with_escaping() {
        let path = std::env::temp_dir().join(format!("shieldwall-access-{}.log", uuid::Uuid::new_v4()));
        let logger = AccessLogger::new(path.to_str().unwrap()).unwrap();
        logger.log(&AccessEntry {
            ts: timestamp(),
            ip: "1.2.3.4",
            method: "GET",
            path: "/a\"b",
            status: 403,
            outcome: "blocked",
            us: 120,
            ua: "curl/8.0",
            event: Some("evt-1"),
        });
        logger.log(&AccessEntry {
            ts: timestamp(),
            ip: "1.2.3.4",
            method: "GET",
            path: "/",
            status: 200,
            outcome: "allowed",
            us: 80,
            ua: "",
            event: None,
        });

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["path"], "/a\"b");
        assert_eq!(lines[0]["event"], "evt-1");
        assert!(lines[1].get("event").is_none());
        let _ = std::fs::remove_file(&path);
    }
}
