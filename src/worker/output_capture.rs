// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Redirection of the worker's standard streams.
//!
//! The worker owns fds 1 and 2: user writes to stdout/stderr are routed
//! into pipes, drained by dedicated threads, and forwarded to the parent as
//! `stdOut`/`stdErr` events attributed to the currently running test. The
//! real stdout is saved first and keeps carrying the IPC frames.
//!
//! On non-Unix platforms capture is disabled; user output goes wherever the
//! parent pointed the child's stderr, and IPC stays on the regular stdout.

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

/// Which standard stream a captured chunk came from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum CapturedStream {
    Out,
    Err,
}

/// A chunk of captured user output, in write order per stream.
#[derive(Debug)]
pub(crate) struct CapturedChunk {
    pub(crate) stream: CapturedStream,
    pub(crate) bytes: Vec<u8>,
}

/// The live capture: a chunk receiver plus, when redirection is active, the
/// saved real stdout for IPC frames.
#[derive(Debug)]
pub(crate) struct OutputCaptureHandle {
    pub(crate) chunks: UnboundedReceiver<CapturedChunk>,
    pub(crate) ipc_stdout: Option<std::fs::File>,
}

/// A capture that never yields. Used by in-process workers and platforms
/// without fd redirection.
pub(crate) fn disabled() -> OutputCaptureHandle {
    let (_tx, chunks) = unbounded_channel();
    OutputCaptureHandle {
        chunks,
        ipc_stdout: None,
    }
}

#[cfg(unix)]
pub(crate) fn install() -> std::io::Result<OutputCaptureHandle> {
    use std::os::unix::io::FromRawFd;

    let (tx, chunks) = unbounded_channel();

    // Save the real stdout before redirecting fd 1; IPC frames keep flowing
    // through it.
    let saved_stdout = unsafe {
        let fd = libc::dup(libc::STDOUT_FILENO);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        std::fs::File::from_raw_fd(fd)
    };

    for (target_fd, stream) in [
        (libc::STDOUT_FILENO, CapturedStream::Out),
        (libc::STDERR_FILENO, CapturedStream::Err),
    ] {
        let mut fds = [0i32; 2];
        unsafe {
            if libc::pipe(fds.as_mut_ptr()) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::dup2(fds[1], target_fd) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            libc::close(fds[1]);
        }

        let reader = unsafe { std::fs::File::from_raw_fd(fds[0]) };
        let tx = tx.clone();
        std::thread::Builder::new()
            .name(format!("toreador-capture-{stream:?}"))
            .spawn(move || drain(reader, stream, tx))?;
    }

    Ok(OutputCaptureHandle {
        chunks,
        ipc_stdout: Some(saved_stdout),
    })
}

#[cfg(not(unix))]
pub(crate) fn install() -> std::io::Result<OutputCaptureHandle> {
    Ok(disabled())
}

#[cfg(unix)]
fn drain(
    mut reader: std::fs::File,
    stream: CapturedStream,
    tx: tokio::sync::mpsc::UnboundedSender<CapturedChunk>,
) {
    use std::io::Read;

    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx
                    .send(CapturedChunk {
                        stream,
                        bytes: buf[..n].to_vec(),
                    })
                    .is_err()
                {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}
