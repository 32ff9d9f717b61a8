//! Bulk file transfer.
//!
//! Methods are tried in a fixed order. A method that is unavailable (tool
//! not installed, hard link across filesystems) passes to the next one; a
//! method that runs and fails ends the attempt.
//!
//! - local (same host): hard link, `rsync`, in-process copy
//! - remote: `bbcp`, `rsync`
//!
//! Subprocesses are killed once the policy timeout for the file size expires.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use md5::{Digest, Md5};
use tokio::process::Command;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

use crate::config::TransferPolicy;

const COPY_CHUNK: usize = 1 << 20;

/// rsync exit codes for partial transfers, which point at the source.
const RSYNC_PARTIAL: [i32; 2] = [23, 24];

/// A transfer method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `link(2)` on the same filesystem.
    HardLink,
    /// The `rsync` tool.
    Rsync,
    /// The `bbcp` tool.
    Bbcp,
    /// A streaming copy inside this process.
    Copy,
}

/// Where a remote source lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSource {
    /// Login name, if not the current user.
    pub user: Option<String>,
    /// Host address.
    pub address: String,
}

impl RemoteSource {
    fn spec(&self, path: &Path) -> String {
        match &self.user {
            Some(user) => format!("{}@{}:{}", user, self.address, path.display()),
            None => format!("{}:{}", self.address, path.display()),
        }
    }
}

/// One file to move.
#[derive(Debug, Clone)]
pub struct TransferSpec {
    /// Source path (on the remote host if `remote` is set).
    pub src: PathBuf,
    /// Destination path.
    pub dest: PathBuf,
    /// Expected size, used for the timeout.
    pub size_b: u64,
    /// Remote source location; `None` for a local transfer.
    pub remote: Option<RemoteSource>,
}

/// Result of a transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// The destination was written.
    pub success: bool,
    /// The failure looks like the source's fault.
    pub check_src: bool,
    /// Digest computed during the transfer, if the method produced one.
    pub md5: Option<String>,
    /// The method that ran, if any.
    pub method: Option<Method>,
    /// Human-readable detail for logs.
    pub message: String,
}

impl TransferOutcome {
    fn ok(method: Method, md5: Option<String>) -> Self {
        Self {
            success: true,
            check_src: false,
            md5,
            method: Some(method),
            message: String::new(),
        }
    }

    fn failed(method: Option<Method>, check_src: bool, message: impl Into<String>) -> Self {
        Self {
            success: false,
            check_src,
            md5: None,
            method,
            message: message.into(),
        }
    }
}

/// Methods to try, in order.
pub fn methods(local: bool) -> &'static [Method] {
    if local {
        &[Method::HardLink, Method::Rsync, Method::Copy]
    } else {
        &[Method::Bbcp, Method::Rsync]
    }
}

/// Hex MD5 of a file's contents.
pub fn md5_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Finds an executable on `PATH`.
pub fn find_tool(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

enum Attempt {
    Unavailable,
    Done(TransferOutcome),
}

/// Moves one file, trying methods in order.
pub fn transfer(runtime: &Runtime, policy: &TransferPolicy, spec: &TransferSpec) -> TransferOutcome {
    let timeout = policy.timeout(spec.size_b);
    for &method in methods(spec.remote.is_none()) {
        let attempt = match method {
            Method::HardLink => hard_link(spec),
            Method::Copy => stream_copy(spec),
            Method::Rsync | Method::Bbcp => run_tool(runtime, method, spec, timeout),
        };
        match attempt {
            Attempt::Unavailable => debug!("{:?} unavailable for {}", method, spec.dest.display()),
            Attempt::Done(outcome) => return outcome,
        }
    }
    TransferOutcome::failed(None, false, "no transfer method available")
}

fn hard_link(spec: &TransferSpec) -> Attempt {
    match std::fs::hard_link(&spec.src, &spec.dest) {
        Ok(()) => Attempt::Done(TransferOutcome::ok(Method::HardLink, None)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Attempt::Done(TransferOutcome::failed(
            Some(Method::HardLink),
            true,
            format!("source missing: {}", err),
        )),
        // EXDEV, EPERM and friends: fall back to copying
        Err(err) => {
            debug!("hard link failed: {}", err);
            Attempt::Unavailable
        }
    }
}

fn stream_copy(spec: &TransferSpec) -> Attempt {
    let mut src = match File::open(&spec.src) {
        Ok(f) => f,
        Err(err) => {
            return Attempt::Done(TransferOutcome::failed(
                Some(Method::Copy),
                true,
                format!("unable to open source: {}", err),
            ))
        }
    };
    let mut dest = match File::create(&spec.dest) {
        Ok(f) => f,
        Err(err) => {
            return Attempt::Done(TransferOutcome::failed(
                Some(Method::Copy),
                false,
                format!("unable to create destination: {}", err),
            ))
        }
    };

    let mut hasher = Md5::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Attempt::Done(TransferOutcome::failed(
                    Some(Method::Copy),
                    true,
                    format!("read error: {}", err),
                ))
            }
        };
        hasher.update(&buf[..n]);
        if let Err(err) = dest.write_all(&buf[..n]) {
            return Attempt::Done(TransferOutcome::failed(
                Some(Method::Copy),
                false,
                format!("write error: {}", err),
            ));
        }
    }
    if let Err(err) = dest.sync_all() {
        return Attempt::Done(TransferOutcome::failed(
            Some(Method::Copy),
            false,
            format!("sync error: {}", err),
        ));
    }
    Attempt::Done(TransferOutcome::ok(
        Method::Copy,
        Some(hex::encode(hasher.finalize())),
    ))
}

fn run_tool(runtime: &Runtime, method: Method, spec: &TransferSpec, timeout: Duration) -> Attempt {
    let tool = match method {
        Method::Bbcp => "bbcp",
        _ => "rsync",
    };
    let Some(program) = find_tool(tool) else {
        return Attempt::Unavailable;
    };
    let src = match &spec.remote {
        Some(remote) => remote.spec(&spec.src),
        None => spec.src.display().to_string(),
    };

    let mut cmd = Command::new(program);
    match method {
        Method::Bbcp => {
            cmd.args(["-f", "-z", "-s", "16"]);
        }
        _ => {
            cmd.args(["--quiet", "--times", "--protect-args"]);
            if spec.remote.is_some() {
                cmd.args(["-e", "ssh -q"]);
            }
        }
    }
    cmd.arg(&src).arg(&spec.dest);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let result = runtime.block_on(async move {
        let child = cmd.spawn()?;
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output.map(Some),
            Err(_) => Ok(None),
        }
    });

    let outcome = match result {
        Err(err) => TransferOutcome::failed(Some(method), false, format!("{} failed to start: {}", tool, err)),
        Ok(None) => {
            warn!("{} timed out after {:?}", tool, timeout);
            TransferOutcome::failed(Some(method), false, format!("{} timed out", tool))
        }
        Ok(Some(output)) if output.status.success() => TransferOutcome::ok(method, None),
        Ok(Some(output)) => {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let check_src = method == Method::Rsync && RSYNC_PARTIAL.contains(&code);
            TransferOutcome::failed(
                Some(method),
                check_src,
                format!("{} exited with {}: {}", tool, code, stderr.trim()),
            )
        }
    };
    Attempt::Done(outcome)
}
