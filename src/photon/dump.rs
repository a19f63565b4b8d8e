//! Unknown-payload sink.
//!
//! Unrecognized `(kind, code)` payloads are the raw material for extending
//! the event registry after a game patch. Each is written once per dedup
//! window per `(kind, code)` as `<epoch_ms>_<code>_<kind>.bin`; losing a
//! dump is never worth interrupting the meter.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use super::message::MessageKind;

pub struct UnknownSink {
    dir: Option<PathBuf>,
    dedup_window_ms: u64,
    recent: BTreeMap<(u8, u8), u64>,
    pub written_total: u64,
}

impl UnknownSink {
    pub fn new(dir: Option<PathBuf>, dedup_window_seconds: u64) -> Self {
        if let Some(dir) = &dir {
            if let Err(e) = fs::create_dir_all(dir) {
                tracing::warn!("unknown-payload dir {} unavailable: {e}", dir.display());
            }
        }
        Self {
            dir,
            dedup_window_ms: dedup_window_seconds.max(1) * 1000,
            recent: BTreeMap::new(),
            written_total: 0,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, 60)
    }

    /// Persist a raw command body, deduplicated per `(kind, code)` window.
    pub fn write(&mut self, now_epoch_ms: u64, kind: MessageKind, code: u8, body: &[u8]) {
        let Some(dir) = &self.dir else {
            return;
        };
        let window = now_epoch_ms / self.dedup_window_ms;
        let key = (kind.wire_type(), code);
        if self.recent.get(&key) == Some(&window) {
            return;
        }
        self.recent.insert(key, window);

        let path = dir.join(format!("{now_epoch_ms}_{code}_{}.bin", kind.label()));
        match fs::write(&path, body) {
            Ok(()) => {
                self.written_total += 1;
                tracing::debug!(code, kind = kind.label(), "dumped unknown payload");
            }
            Err(e) => tracing::warn!("unknown-payload write failed for {}: {e}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_file_per_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = UnknownSink::new(Some(dir.path().to_owned()), 60);

        sink.write(1_000, MessageKind::Event, 99, b"abc");
        sink.write(2_000, MessageKind::Event, 99, b"abc");
        sink.write(61_000, MessageKind::Event, 99, b"abc");
        sink.write(61_500, MessageKind::Request, 99, b"abc");

        let files: Vec<_> = fs::read_dir(dir.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().into_string().expect("name"))
            .collect();
        assert_eq!(files.len(), 3);
        assert!(files.iter().any(|f| f == "1000_99_event.bin"));
        assert!(files.iter().any(|f| f == "61000_99_event.bin"));
        assert!(files.iter().any(|f| f == "61500_99_request.bin"));
        assert_eq!(sink.written_total, 3);
    }

    #[test]
    fn disabled_sink_is_a_noop() {
        let mut sink = UnknownSink::disabled();
        sink.write(1_000, MessageKind::Event, 99, b"abc");
        assert_eq!(sink.written_total, 0);
    }
}
