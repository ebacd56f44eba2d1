//! Console attach: stdio multiplexing over the helper's unix socket.
//!
//! The logging helper exposes one socket carrying byte-tagged frames; the
//! first byte of each frame routes the payload to stdout or stderr. Two
//! tasks run concurrently — one draining that socket, one copying stdin
//! into it while scanning for the detach key sequence. The first task to
//! finish decides the outcome; when stdin closes first, the output task
//! still gets a drain window so buffered container output is not lost.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use ibex_common::{IbexError, IbexResult};

/// Default detach sequence, Docker-style.
pub const DEFAULT_DETACH_KEYS: &str = "ctrl-p,ctrl-q";

/// Frame tag for stdout payloads.
const TAG_STDOUT: u8 = 2;
/// Frame tag for stderr payloads.
const TAG_STDERR: u8 = 3;

/// How long the output task may keep draining after stdin closes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How an attach session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The container's output stream closed (it exited).
    Exited,
    /// The user typed the detach key sequence.
    Detached,
}

/// Attach to the helper socket and multiplex stdio until the container
/// exits or the user detaches.
pub async fn attach(socket: &Path, detach_keys: &str) -> IbexResult<AttachOutcome> {
    let sequence = parse_detach_keys(detach_keys)?;
    let stream = UnixStream::connect(socket).await.map_err(|e| {
        IbexError::Internal {
            message: format!("cannot connect to attach socket {}: {e}", socket.display()),
        }
    })?;
    let (read_half, write_half) = stream.into_split();

    let mut output = tokio::spawn(drain_output(read_half));
    let mut input = tokio::spawn(copy_stdin(write_half, sequence));

    tokio::select! {
        out = &mut output => {
            input.abort();
            out.map_err(join_error)??;
            Ok(AttachOutcome::Exited)
        }
        inp = &mut input => {
            let detached = inp.map_err(join_error)??;
            if detached {
                output.abort();
                Ok(AttachOutcome::Detached)
            } else {
                // Stdin hit EOF; let remaining container output through.
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut output).await;
                Ok(AttachOutcome::Exited)
            }
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> IbexError {
    IbexError::Internal {
        message: format!("attach task failed: {e}"),
    }
}

/// Demultiplex tagged frames from the socket until EOF.
async fn drain_output(mut socket: OwnedReadHalf) -> IbexResult<()> {
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut buf = [0u8; 8192];

    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let (tag, payload) = (buf[0], &buf[1..n]);
        match tag {
            TAG_STDERR => {
                stderr.write_all(payload).await?;
                stderr.flush().await?;
            }
            TAG_STDOUT => {
                stdout.write_all(payload).await?;
                stdout.flush().await?;
            }
            other => {
                tracing::debug!(tag = other, len = payload.len(), "unknown frame tag, routed to stdout");
                stdout.write_all(payload).await?;
                stdout.flush().await?;
            }
        }
    }
}

/// Copy stdin into the socket, watching for the detach sequence.
///
/// Returns `true` when the user detached, `false` on stdin EOF.
async fn copy_stdin(mut socket: OwnedWriteHalf, sequence: Vec<u8>) -> IbexResult<bool> {
    let mut stdin = tokio::io::stdin();
    let mut scanner = DetachScanner::new(sequence);
    let mut buf = [0u8; 4096];

    loop {
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            return Ok(false);
        }
        if let Some(end) = scanner.scan(&buf[..n]) {
            // Forward anything typed before the sequence started.
            let keep = end.saturating_sub(scanner.len());
            if keep > 0 {
                socket.write_all(&buf[..keep]).await?;
            }
            return Ok(true);
        }
        socket.write_all(&buf[..n]).await?;
    }
}

/// Incremental matcher for the detach byte sequence, robust across read
/// boundaries.
#[derive(Debug)]
struct DetachScanner {
    sequence: Vec<u8>,
    matched: usize,
}

impl DetachScanner {
    fn new(sequence: Vec<u8>) -> Self {
        Self {
            sequence,
            matched: 0,
        }
    }

    fn len(&self) -> usize {
        self.sequence.len()
    }

    /// Feed a buffer; returns the index one past the completed sequence.
    fn scan(&mut self, buf: &[u8]) -> Option<usize> {
        if self.sequence.is_empty() {
            return None;
        }
        for (i, &byte) in buf.iter().enumerate() {
            if byte == self.sequence[self.matched] {
                self.matched += 1;
                if self.matched == self.sequence.len() {
                    self.matched = 0;
                    return Some(i + 1);
                }
            } else {
                self.matched = usize::from(byte == self.sequence[0]);
            }
        }
        None
    }
}

/// Parse a detach key specification like `ctrl-p,ctrl-q` or `ctrl-[,q`.
pub fn parse_detach_keys(spec: &str) -> IbexResult<Vec<u8>> {
    let mut sequence = Vec::new();
    if spec.is_empty() {
        return Ok(sequence);
    }
    for key in spec.split(',') {
        if let Some(ctrl) = key.strip_prefix("ctrl-") {
            let c = ctrl
                .chars()
                .next()
                .filter(|_| ctrl.chars().count() == 1)
                .ok_or_else(|| {
                    IbexError::config(format!("invalid detach key: {key:?}"))
                })?;
            if !c.is_ascii() {
                return Err(IbexError::config(format!("invalid detach key: {key:?}")));
            }
            sequence.push((c as u8) & 0x1f);
        } else {
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii() => sequence.push(c as u8),
                _ => {
                    return Err(IbexError::config(format!("invalid detach key: {key:?}")));
                }
            }
        }
    }
    Ok(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_detach_keys_parse_to_control_bytes() {
        let seq = parse_detach_keys(DEFAULT_DETACH_KEYS).unwrap();
        assert_eq!(seq, vec![0x10, 0x11]);
    }

    #[test]
    fn plain_character_keys() {
        assert_eq!(parse_detach_keys("ctrl-[,q").unwrap(), vec![0x1b, b'q']);
    }

    #[test]
    fn invalid_keys_are_rejected() {
        assert!(parse_detach_keys("ctrl-").is_err());
        assert!(parse_detach_keys("longkey").is_err());
    }

    #[test]
    fn scanner_matches_within_one_buffer() {
        let mut scanner = DetachScanner::new(vec![0x10, 0x11]);
        assert_eq!(scanner.scan(b"hi\x10\x11"), Some(4));
    }

    #[test]
    fn scanner_matches_across_buffers() {
        let mut scanner = DetachScanner::new(vec![0x10, 0x11]);
        assert_eq!(scanner.scan(b"abc\x10"), None);
        assert_eq!(scanner.scan(b"\x11"), Some(1));
    }

    #[test]
    fn scanner_resets_on_mismatch() {
        let mut scanner = DetachScanner::new(vec![0x10, 0x11]);
        assert_eq!(scanner.scan(b"\x10x\x10\x11"), Some(4));
    }

    #[test]
    fn scanner_handles_restart_byte() {
        // A repeated first byte must not lose the in-progress match.
        let mut scanner = DetachScanner::new(vec![0x10, 0x11]);
        assert_eq!(scanner.scan(b"\x10\x10\x11"), Some(3));
    }
}
