#![allow(unsafe_code)]
//! Lifecycle supervision around the external runtime and its logging
//! helper.
//!
//! `create` launches conmon, which in turn invokes the OCI runtime's own
//! create; the two are wired together with a start pipe (launcher signals
//! "begin") and a sync pipe (helper reports a JSON `{data, message}` line).
//! Every other operation is a thin synchronous invocation of the runtime
//! binary with `--root` pointing at the resolved state root.

use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;

use ibex_common::paths::{StatePaths, runtime_state_root};
use ibex_common::{IbexError, IbexResult};
use ibex_oci::ContainerState;

use crate::bundle::BundleHandle;
use crate::bundle::attach::{self, DEFAULT_DETACH_KEYS};

/// Fixed timeout for the create handshake.
const CREATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime binaries tried in order.
const RUNTIME_CANDIDATES: &[&str] = &["crun", "runc"];

/// Sync-pipe message from the logging helper.
#[derive(Debug, Deserialize)]
struct SyncInfo {
    data: i32,
    #[serde(default)]
    message: Option<String>,
}

/// One line of the runtime's JSON error log.
#[derive(Debug, Deserialize)]
struct RuntimeLogEntry {
    #[serde(default)]
    level: String,
    #[serde(default)]
    msg: String,
}

/// Drives one container through the external runtime.
#[derive(Debug)]
pub struct BundleSupervisor {
    id: String,
    runtime: PathBuf,
    conmon: PathBuf,
    state_root: PathBuf,
    state: StatePaths,
}

impl BundleSupervisor {
    /// Supervisor for a container ID, resolving the runtime and helper
    /// binaries and the runtime state root.
    pub fn new(id: &str) -> IbexResult<Self> {
        let uid = unsafe { libc::getuid() };
        let runtime = find_binary(RUNTIME_CANDIDATES)?;
        let conmon = find_binary(&["conmon"])?;
        let state_root = runtime_state_root(uid)?;

        Ok(Self {
            id: id.to_string(),
            runtime,
            conmon,
            state_root,
            state: StatePaths::for_container(id),
        })
    }

    /// Per-container state paths.
    #[must_use]
    pub fn state_paths(&self) -> &StatePaths {
        &self.state
    }

    /// Create the container: launch the logging helper, wait for its
    /// handshake, and record the bundle symlink.
    pub fn create(&self, bundle: &BundleHandle) -> IbexResult<()> {
        self.state.create()?;
        std::fs::create_dir_all(self.exit_dir())?;

        let (start_parent, start_child) = socket_pair()?;
        let (sync_parent, sync_child) = socket_pair()?;

        let mut cmd = Command::new(&self.conmon);
        // The container UUID doubles as the helper's socket subdirectory
        // name; using the ID keeps the attach socket at the documented
        // <state-dir>/attach location.
        cmd.arg("--api-version").arg("1")
            .arg("--cid").arg(&self.id)
            .arg("--name").arg(&self.id)
            .arg("--cuuid").arg(&self.id)
            .arg("--runtime").arg(&self.runtime)
            .arg("--conmon-pidfile").arg(self.state.conmon_pid())
            .arg("--container-pidfile").arg(self.state.container_pid())
            .arg("--log-path").arg(self.state.container_log())
            .arg("--runtime-arg").arg("--root")
            .arg("--runtime-arg").arg(&self.state_root)
            .arg("--runtime-arg").arg("--log")
            .arg("--runtime-arg").arg(self.state.runtime_log())
            .arg("--runtime-arg").arg("--log-format")
            .arg("--runtime-arg").arg("json")
            .arg("--bundle").arg(bundle.path())
            .arg("--exit-dir").arg(self.exit_dir());
        // conmon appends <cuuid>/attach to this directory, landing the
        // socket at the state dir's documented attach path.
        if let Some(socket_parent) = self.state.dir().parent() {
            cmd.arg("--socket-dir-path").arg(socket_parent);
        }

        if let Ok(launcher) = std::env::current_exe() {
            cmd.arg("--exit-command").arg(launcher)
                .arg("--exit-command-arg").arg("oci")
                .arg("--exit-command-arg").arg("cleanup")
                .arg("--exit-command-arg").arg(&self.id);
        }

        // The helper finds its pipes on fds 3 and 4.
        cmd.env("_OCI_STARTPIPE", "3").env("_OCI_SYNCPIPE", "4");
        let start_raw = start_child.as_raw_fd();
        let sync_raw = sync_child.as_raw_fd();
        unsafe {
            cmd.pre_exec(move || {
                // dup2 clears close-on-exec on the target descriptors.
                if libc::dup2(start_raw, 3) < 0 || libc::dup2(sync_raw, 4) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        tracing::info!(id = %self.id, bundle = %bundle.path().display(), "creating container");
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                IbexError::BinaryNotFound {
                    binary: self.conmon.display().to_string(),
                }
            } else {
                e.into()
            }
        })?;
        drop(start_child);
        drop(sync_child);

        // Signal the helper to begin, then wait for its verdict.
        let mut start_pipe = UnixStream::from(start_parent);
        start_pipe.write_all(b"1")?;
        drop(start_pipe);

        let sync = self.await_sync(sync_parent);
        // The helper double-forks; reap the intermediate child either way.
        let _ = child.wait();
        let sync = sync?;

        if sync.data < 0 {
            return Err(IbexError::HandshakeFailed {
                status: sync.data,
                message: self.create_diagnostic(sync.message.as_deref()),
            });
        }

        let link = self.state.bundle_link();
        if let Err(e) = std::os::unix::fs::symlink(bundle.path(), &link) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(e.into());
            }
        }
        tracing::info!(id = %self.id, pid = sync.data, "container created");
        Ok(())
    }

    /// Wait for the helper's `{data, message}` line within the fixed
    /// timeout. A timeout is its own failure mode, distinct from a
    /// negative sync result.
    fn await_sync(&self, sync_fd: OwnedFd) -> IbexResult<SyncInfo> {
        let stream = UnixStream::from(sync_fd);
        stream.set_read_timeout(Some(CREATE_TIMEOUT))?;

        let mut line = String::new();
        let mut reader = BufReader::new(stream);
        match reader.read_line(&mut line) {
            Ok(0) => Err(IbexError::HandshakeFailed {
                status: -1,
                message: self.create_diagnostic(None),
            }),
            Ok(_) => Ok(serde_json::from_str(&line)?),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(IbexError::HandshakeTimeout {
                    seconds: CREATE_TIMEOUT.as_secs(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best available diagnostic for a failed create: the runtime's own
    /// JSON error log, the sync message, or a generic fallback.
    fn create_diagnostic(&self, sync_message: Option<&str>) -> String {
        if let Ok(log) = std::fs::read_to_string(self.state.runtime_log()) {
            let last_error = log
                .lines()
                .filter_map(|l| serde_json::from_str::<RuntimeLogEntry>(l).ok())
                .filter(|e| e.level == "error")
                .next_back();
            if let Some(entry) = last_error {
                return entry.msg;
            }
        }
        sync_message
            .map(ToString::to_string)
            .unwrap_or_else(|| "container creation failed (no diagnostic available)".to_string())
    }

    /// Start the created container.
    pub fn start(&self) -> IbexResult<()> {
        self.runtime_op("start", &[])?;
        tracing::info!(id = %self.id, "container started");
        Ok(())
    }

    /// Send a signal to the container.
    pub fn kill(&self, signal: &str) -> IbexResult<()> {
        self.runtime_op("kill", &[signal])?;
        Ok(())
    }

    /// Pause the container.
    pub fn pause(&self) -> IbexResult<()> {
        self.runtime_op("pause", &[])?;
        Ok(())
    }

    /// Resume a paused container.
    pub fn resume(&self) -> IbexResult<()> {
        self.runtime_op("resume", &[])?;
        Ok(())
    }

    /// Query the runtime for the container state.
    pub fn state(&self) -> IbexResult<ContainerState> {
        let output = self.runtime_op("state", &[])?;
        Ok(serde_json::from_slice(&output)?)
    }

    /// Attach to the container console until it exits or the user
    /// detaches, then collect the exit code.
    pub fn run(&self, bundle: &BundleHandle) -> IbexResult<i32> {
        self.create(bundle)?;
        self.start()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        match runtime.block_on(attach::attach(&self.state.attach_socket(), DEFAULT_DETACH_KEYS)) {
            Ok(attach::AttachOutcome::Detached) => {
                tracing::info!(id = %self.id, "detached from container");
                return Ok(0);
            }
            Ok(attach::AttachOutcome::Exited) => {}
            Err(e) => {
                // Attach is best-effort for non-interactive runs; the exit
                // code still comes from the helper.
                tracing::warn!(id = %self.id, error = %e, "console attach unavailable");
            }
        }
        self.wait_exit()
    }

    /// Poll until the runtime reports the container stopped, then read the
    /// exit code the helper recorded.
    pub fn wait_exit(&self) -> IbexResult<i32> {
        loop {
            match self.state() {
                Ok(state) if state.status.can_delete() => break,
                Ok(_) => std::thread::sleep(Duration::from_millis(100)),
                // The helper may already have cleaned the runtime state.
                Err(_) => break,
            }
        }

        let exit_file = self.exit_dir().join(&self.id);
        match std::fs::read_to_string(&exit_file) {
            Ok(content) => content.trim().parse().map_err(|_| IbexError::Internal {
                message: format!("unparseable exit status in {}", exit_file.display()),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the container, remove the bundle symlink and release the
    /// bundle lock.
    pub fn delete(&self, bundle: BundleHandle) -> IbexResult<()> {
        if let Err(e) = self.runtime_op("delete", &["--force"]) {
            tracing::warn!(id = %self.id, error = %e, "runtime delete failed");
        }
        if let Err(e) = std::fs::remove_file(self.state.bundle_link()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(id = %self.id, error = %e, "bundle symlink removal failed");
            }
        }
        bundle.release();
        tracing::info!(id = %self.id, "container deleted");
        Ok(())
    }

    /// Delete a container created by an earlier invocation, resolving its
    /// bundle through the state-directory symlink.
    pub fn delete_detached(&self) -> IbexResult<()> {
        if let Err(e) = self.runtime_op("delete", &["--force"]) {
            tracing::warn!(id = %self.id, error = %e, "runtime delete failed");
        }
        let link = self.state.bundle_link();
        if let Ok(bundle) = std::fs::read_link(&link) {
            let lock = bundle.join(ibex_common::paths::BUNDLE_LOCK_FILE);
            if let Err(e) = std::fs::remove_file(&lock) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(lock = %lock.display(), error = %e, "bundle lock removal failed");
                }
            }
        }
        if let Err(e) = std::fs::remove_file(&link) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(id = %self.id, error = %e, "bundle symlink removal failed");
            }
        }
        Ok(())
    }

    /// Exit-command entry point: clear per-container state the helper
    /// leaves behind once the container is gone.
    pub fn cleanup(id: &str) -> IbexResult<()> {
        let state = StatePaths::for_container(id);
        for stale in [state.bundle_link(), state.attach_socket()] {
            if let Err(e) = std::fs::remove_file(&stale) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %stale.display(), error = %e, "cleanup failed");
                }
            }
        }
        Ok(())
    }

    fn exit_dir(&self) -> PathBuf {
        self.state.dir().join("exit")
    }

    /// Invoke the runtime binary synchronously and capture its stdout.
    fn runtime_op(&self, op: &str, extra: &[&str]) -> IbexResult<Vec<u8>> {
        let mut cmd = Command::new(&self.runtime);
        cmd.arg("--root").arg(&self.state_root).arg(op);
        cmd.args(extra);
        cmd.arg(&self.id);

        tracing::debug!(runtime = %self.runtime.display(), op, id = %self.id, "invoking runtime");
        let output = cmd.output()?;
        if !output.status.success() {
            return Err(IbexError::RuntimeFailed {
                runtime: self.runtime.display().to_string(),
                operation: op.to_string(),
                id: self.id.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Map a finished child process to the launcher's own exit code:
/// signal-terminated children re-raise as `128 + signal`.
#[must_use]
pub fn propagate_exit_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Locate the first of `names` on `PATH`.
fn find_binary(names: &[&str]) -> IbexResult<PathBuf> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    for name in names {
        for dir in std::env::split_paths(&path) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(IbexError::BinaryNotFound {
        binary: names.join("/"),
    })
}

fn socket_pair() -> IbexResult<(OwnedFd, OwnedFd)> {
    use rustix::net::{AddressFamily, SocketFlags, SocketType, socketpair};

    let (a, b) = socketpair(
        AddressFamily::UNIX,
        SocketType::STREAM,
        SocketFlags::CLOEXEC,
        None,
    )
    .map_err(|e| IbexError::Io(e.into()))?;
    Ok((a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_message_parsing() {
        let ok: SyncInfo = serde_json::from_str(r#"{"data": 4212}"#).unwrap();
        assert_eq!(ok.data, 4212);
        assert!(ok.message.is_none());

        let err: SyncInfo =
            serde_json::from_str(r#"{"data": -1, "message": "exec failed"}"#).unwrap();
        assert_eq!(err.data, -1);
        assert_eq!(err.message.as_deref(), Some("exec failed"));
    }

    #[test]
    fn runtime_log_entry_parsing() {
        let entry: RuntimeLogEntry = serde_json::from_str(
            r#"{"level":"error","msg":"sd-bus call failed","time":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(entry.level, "error");
        assert_eq!(entry.msg, "sd-bus call failed");
    }

    #[test]
    fn missing_binary_is_reported() {
        let err = find_binary(&["definitely-not-a-real-binary-name"]).unwrap_err();
        assert!(matches!(err, IbexError::BinaryNotFound { .. }));
    }

    #[test]
    fn exit_status_propagation() {
        use std::os::unix::process::ExitStatusExt;
        // Normal exit code 3.
        let status = std::process::ExitStatus::from_raw(3 << 8);
        assert_eq!(propagate_exit_status(status), 3);
        // Terminated by SIGKILL (9).
        let status = std::process::ExitStatus::from_raw(9);
        assert_eq!(propagate_exit_status(status), 137);
    }

    #[test]
    fn socket_pair_yields_connected_fds() {
        let (a, b) = socket_pair().unwrap();
        let mut left = UnixStream::from(a);
        let right = UnixStream::from(b);
        left.write_all(b"ping").unwrap();
        drop(left);
        use std::io::Read;
        let mut buf = Vec::new();
        let mut right = right;
        right.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"ping");
    }
}
