//! Per-process interaction logging.
//!
//! When `--log path` is given, every backing process gets its own record
//! file at `{path}/{protocol}/{route}/{processID}.txt`: a header line
//! followed by one tab-separated record per transferred line, with the
//! payload tight-JSON encoded. Records are handed to a writer task over an
//! unbounded channel so logging never blocks a bridge or session.

use std::fs;
use std::io::Write;
use std::path::Path;

use tokio::sync::mpsc;

struct LogRecord {
    epoch_ms: i64,
    /// client → process payload, if this record is client-originated
    client: Option<String>,
    /// process → client payload, if this record is server-originated
    server: Option<String>,
}

/// Handle to one process's log file. Dropping it closes the file.
pub struct InteractionLog {
    tx: mpsc::UnboundedSender<LogRecord>,
}

impl InteractionLog {
    /// Create the `{root}/{protocol}/{route}` folders, open the per-process
    /// file, and start its writer task.
    pub fn open(root: &Path, protocol: &str, route: &str, process_id: &str) -> Result<Self, String> {
        let dir = root.join(protocol).join(route);
        fs::create_dir_all(&dir).map_err(|e| format!("failed to create log folder: {}", e))?;
        let path = dir.join(format!("{}.txt", process_id));
        let mut file =
            fs::File::create(&path).map_err(|e| format!("failed to open log file: {}", e))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<LogRecord>();
        tokio::spawn(async move {
            let _ = writeln!(file, "epochms\tcs-body\tsc-body");
            while let Some(rec) = rx.recv().await {
                let cs = rec.client.as_deref().map(tight_json);
                let sc = rec.server.as_deref().map(tight_json);
                let _ = writeln!(
                    file,
                    "{}\t{}\t{}",
                    rec.epoch_ms,
                    cs.as_deref().unwrap_or("-"),
                    sc.as_deref().unwrap_or("-")
                );
            }
        });

        Ok(Self { tx })
    }

    /// Record one client → process line.
    pub fn client(&self, data: &str) {
        let _ = self.tx.send(LogRecord {
            epoch_ms: chrono::Utc::now().timestamp_millis(),
            client: Some(data.to_string()),
            server: None,
        });
    }

    /// Record one process → client line.
    pub fn server(&self, data: &str) {
        let _ = self.tx.send(LogRecord {
            epoch_ms: chrono::Utc::now().timestamp_millis(),
            client: None,
            server: Some(data.to_string()),
        });
    }
}

/// Encode a payload as tight (whitespace-free) JSON: valid JSON is
/// re-serialized compactly, anything else becomes a JSON string.
pub fn tight_json(s: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(s) {
        Ok(v) => v.to_string(),
        Err(_) => serde_json::Value::String(s.to_string()).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tight_json_quotes_plain_text() {
        assert_eq!(tight_json("hello"), "\"hello\"");
        assert_eq!(tight_json("say \"hi\""), "\"say \\\"hi\\\"\"");
    }

    #[test]
    fn test_tight_json_compacts_json() {
        assert_eq!(tight_json("{\"x\": 1,  \"y\": true}"), "{\"x\":1,\"y\":true}");
    }

    #[tokio::test]
    async fn test_log_file_shape() {
        let root = std::env::temp_dir().join(format!("procgate-log-test-{}", std::process::id()));
        let log = InteractionLog::open(&root, "tcp", "9001", "20260101T000000-42").unwrap();
        log.client("hello");
        log.server("world");
        drop(log);
        // Give the writer task a moment to drain and close the file.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let path = root.join("tcp").join("9001").join("20260101T000000-42.txt");
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "epochms\tcs-body\tsc-body");
        assert!(lines[1].ends_with("\t\"hello\"\t-"));
        assert!(lines[2].ends_with("\t-\t\"world\""));
        let _ = fs::remove_dir_all(&root);
    }
}
