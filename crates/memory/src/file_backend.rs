//! File-based storage backends.
//!
//! - [`FileSessionStore`]: one JSON file per key under a directory. Writes go
//!   to a temporary file first and are renamed into place.
//! - [`JsonlLogStore`]: one append-only JSON-lines file per stream.
//!
//! Storage location defaults to `~/.routewise/data/`.

use async_trait::async_trait;
use routewise_core::error::MemoryError;
use routewise_core::store::{LogStore, SessionStore};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A directory of JSON files, one per key.
///
/// Keys are percent-encoded into file names so arbitrary keys
/// (`episode:abc`, `learning:stats`) map to portable paths.
pub struct FileSessionStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        debug!(path = %dir.display(), "File session store opened");
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, MemoryError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(MemoryError::Storage(format!("Failed to read '{key}': {e}"))),
        }
    }

    async fn put(&self, key: &str, value: String) -> Result<(), MemoryError> {
        let _guard = self.write_lock.lock().await;

        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            MemoryError::Storage(format!("Failed to create storage directory: {e}"))
        })?;

        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value.as_bytes())
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to write '{key}': {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to commit '{key}': {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, MemoryError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(e) => Err(MemoryError::Storage(format!("Failed to delete '{key}': {e}"))),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, MemoryError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MemoryError::Storage(format!("Failed to list storage: {e}"))),
        };

        let mut keys = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to list storage: {e}")))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".json") else { continue };
            if let Some(key) = decode_key(stem) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Append-only JSON-lines files, one per stream.
pub struct JsonlLogStore {
    dir: PathBuf,
    append_lock: Mutex<()>,
}

impl JsonlLogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            append_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, stream: &str) -> Result<PathBuf, MemoryError> {
        let valid = !stream.is_empty()
            && stream
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(MemoryError::Storage(format!("Invalid log stream name: '{stream}'")));
        }
        Ok(self.dir.join(format!("{stream}.jsonl")))
    }
}

#[async_trait]
impl LogStore for JsonlLogStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn append(&self, stream: &str, record: String) -> Result<(), MemoryError> {
        if record.contains('\n') {
            return Err(MemoryError::Storage("Log records must be single-line".into()));
        }
        let path = self.path_for(stream)?;
        let _guard = self.append_lock.lock().await;

        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            MemoryError::Storage(format!("Failed to create log directory: {e}"))
        })?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to open log '{stream}': {e}")))?;

        let mut line = record;
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to append to '{stream}': {e}")))?;
        file.flush()
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to flush '{stream}': {e}")))?;
        Ok(())
    }

    async fn read_all(&self, stream: &str) -> Result<Vec<String>, MemoryError> {
        let path = self.path_for(stream)?;
        let content = match tokio::fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MemoryError::Storage(format!("Failed to read log '{stream}': {e}"))),
        };
        // Lines are decoded one at a time so a torn write only costs its own record.
        Ok(content
            .split(|b| *b == b'\n')
            .enumerate()
            .filter_map(|(i, line)| match std::str::from_utf8(line) {
                Ok(line) => Some(line.trim_end_matches('\r')),
                Err(e) => {
                    warn!(stream, line = i + 1, error = %e, "Skipping undecodable log line");
                    None
                }
            })
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_roundtrips() {
        for key in ["episode:abc", "learning:stats", "conv/../x", "plain-key_1.2", "ünï"] {
            let encoded = encode_key(key);
            assert!(!encoded.contains('/'));
            assert!(!encoded.contains(':'));
            assert_eq!(decode_key(&encoded).as_deref(), Some(key));
        }
    }

    #[tokio::test]
    async fn put_get_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        store.put("episode:s1", "{\"a\":1}".into()).await.unwrap();

        let reopened = FileSessionStore::new(dir.path());
        assert_eq!(reopened.get("episode:s1").await.unwrap().as_deref(), Some("{\"a\":1}"));
        assert!(reopened.get("episode:missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn keys_filter_by_prefix_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        store.put("episode:b", "1".into()).await.unwrap();
        store.put("episode:a", "1".into()).await.unwrap();
        store.put("learning:stats", "1".into()).await.unwrap();

        assert_eq!(store.keys("episode:").await.unwrap(), vec!["episode:a", "episode:b"]);
        assert_eq!(store.keys("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        store.put("k", "v".into()).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn keys_on_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("never-created"));
        assert!(store.keys("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlLogStore::new(dir.path());
        log.append("reflections", "{\"n\":1}".into()).await.unwrap();
        log.append("reflections", "{\"n\":2}".into()).await.unwrap();
        log.append("violations", "{\"n\":3}".into()).await.unwrap();

        let reopened = JsonlLogStore::new(dir.path());
        assert_eq!(
            reopened.read_all("reflections").await.unwrap(),
            vec!["{\"n\":1}", "{\"n\":2}"]
        );
        assert_eq!(reopened.read_all("violations").await.unwrap().len(), 1);
        assert!(reopened.read_all("unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_skips_undecodable_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlLogStore::new(dir.path());
        log.append("reflections", "{\"n\":1}".into()).await.unwrap();
        log.append("reflections", "{\"n\":2}".into()).await.unwrap();

        let path = dir.path().join("reflections.jsonl");
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(b"\xff\xfe torn\n");
        std::fs::write(&path, raw).unwrap();
        log.append("reflections", "{\"n\":3}".into()).await.unwrap();

        assert_eq!(
            log.read_all("reflections").await.unwrap(),
            vec!["{\"n\":1}", "{\"n\":2}", "{\"n\":3}"]
        );
    }

    #[tokio::test]
    async fn log_rejects_bad_stream_and_multiline() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlLogStore::new(dir.path());
        assert!(log.append("../escape", "{}".into()).await.is_err());
        assert!(log.append("ok", "{\n}".into()).await.is_err());
    }
}
