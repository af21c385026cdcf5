//! Exclusive capture of toolchain output.
//!
//! Toolchain stdout and stderr are written to a single anonymous temp file
//! so that diagnostics keep their original interleaving. Only one build may
//! hold the capture at a time; the guard releases it on every exit path.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Owned, mutex-guarded diagnostics sink shared by all builds of an orchestrator.
#[derive(Debug)]
pub struct OutputCapture {
    lock: Mutex<()>,
    enabled: bool,
}

impl Default for OutputCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputCapture {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            enabled: true,
        }
    }

    /// A capture that never redirects; builds still serialize on its lock.
    pub fn disabled() -> Self {
        Self {
            lock: Mutex::new(()),
            enabled: false,
        }
    }

    /// Block until the capture is free and take it.
    ///
    /// If no sink can be created the guard still serializes, but output
    /// flows to the inherited streams and `finish` returns an empty string.
    pub fn acquire(&self) -> CaptureGuard<'_> {
        // A panic while capturing leaves nothing to repair; the sink is per guard.
        let lock = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let sink = if self.enabled {
            match tempfile::tempfile() {
                Ok(file) => Some(file),
                Err(e) => {
                    tracing::warn!("Output capture unavailable, building without diagnostics: {}", e);
                    None
                }
            }
        } else {
            None
        };

        CaptureGuard { _lock: lock, sink }
    }

    /// Whether the capture is currently held by a build.
    pub fn is_held(&self) -> bool {
        matches!(self.lock.try_lock(), Err(std::sync::TryLockError::WouldBlock))
    }
}

/// Scoped ownership of the capture. Dropping it releases the lock.
pub struct CaptureGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    sink: Option<File>,
}

impl CaptureGuard<'_> {
    /// Whether output is actually being recorded.
    pub fn is_capturing(&self) -> bool {
        self.sink.is_some()
    }

    /// Stdio handles for a child process's stdout and stderr.
    pub fn child_stdio(&self) -> (Stdio, Stdio) {
        let Some(sink) = &self.sink else {
            return (Stdio::inherit(), Stdio::inherit());
        };

        match (sink.try_clone(), sink.try_clone()) {
            (Ok(out), Ok(err)) => (Stdio::from(out), Stdio::from(err)),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Failed to share capture sink with child: {}", e);
                (Stdio::inherit(), Stdio::inherit())
            }
        }
    }

    /// Read back everything captured and release the capture.
    pub fn finish(mut self) -> String {
        let Some(sink) = self.sink.as_mut() else {
            return String::new();
        };

        let mut bytes = Vec::new();
        let read = sink
            .seek(SeekFrom::Start(0))
            .and_then(|_| sink.read_to_end(&mut bytes));

        if let Err(e) = read {
            tracing::warn!("Failed to read captured output: {}", e);
        }

        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for CaptureGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.sink.as_mut() {
            Some(sink) => sink.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_roundtrip() {
        let capture = OutputCapture::new();
        let mut guard = capture.acquire();
        assert!(guard.is_capturing());
        writeln!(guard, "warning: unused variable").unwrap();
        assert_eq!(guard.finish(), "warning: unused variable\n");
    }

    #[test]
    fn test_guard_releases_lock() {
        let capture = OutputCapture::new();
        {
            let _guard = capture.acquire();
            assert!(capture.is_held());
        }
        assert!(!capture.is_held());

        let guard = capture.acquire();
        let _ = guard.finish();
        assert!(!capture.is_held());
    }

    #[test]
    fn test_disabled_capture_yields_empty_diagnostics() {
        let capture = OutputCapture::disabled();
        let mut guard = capture.acquire();
        assert!(!guard.is_capturing());
        writeln!(guard, "dropped").unwrap();
        assert_eq!(guard.finish(), "");
    }

    #[test]
    fn test_lock_released_after_panic() {
        let capture = std::sync::Arc::new(OutputCapture::new());
        let c = capture.clone();
        let result = std::thread::spawn(move || {
            let _guard = c.acquire();
            panic!("toolchain exploded");
        })
        .join();
        assert!(result.is_err());
        assert!(!capture.is_held());
        let _guard = capture.acquire();
    }

    #[cfg(unix)]
    #[test]
    fn test_child_output_is_captured() {
        let capture = OutputCapture::new();
        let guard = capture.acquire();
        let (out, err) = guard.child_stdio();
        let status = std::process::Command::new("sh")
            .args(["-c", "echo to-stdout; echo to-stderr 1>&2"])
            .stdout(out)
            .stderr(err)
            .status()
            .unwrap();
        assert!(status.success());
        let text = guard.finish();
        assert!(text.contains("to-stdout"));
        assert!(text.contains("to-stderr"));
    }
}
