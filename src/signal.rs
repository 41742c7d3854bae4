// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shutdown-signal plumbing for the dispatcher.
//!
//! The dispatcher owns one [`SignalHandler`] and polls it from its event
//! loop; a received [`ShutdownEvent`] begins cancellation. Tests build the
//! no-op variant so no process-global handlers get installed under a test
//! harness.

use crate::errors::SignalHandlerSetupError;

/// A signal asking the run to shut down.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ShutdownEvent {
    /// SIGINT or Ctrl-C. The run exits with code 130.
    Interrupt,
    /// SIGHUP.
    #[cfg(unix)]
    Hangup,
    /// SIGTERM.
    #[cfg(unix)]
    Term,
    /// SIGQUIT.
    #[cfg(unix)]
    Quit,
}

/// Which signal handling to install for a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SignalHandlerKind {
    /// Listen for the platform's interrupt and termination signals.
    Standard,

    /// Listen for nothing. For tests, and for embedders that manage
    /// signals themselves.
    Noop,
}

impl SignalHandlerKind {
    /// Installs the handler. Must run inside a tokio runtime context.
    pub(crate) fn build(self) -> Result<SignalHandler, SignalHandlerSetupError> {
        let inner = match self {
            Self::Standard => Some(os::ShutdownSignals::install()?),
            Self::Noop => None,
        };
        Ok(SignalHandler { inner })
    }
}

/// Receives shutdown signals for the dispatcher's event loop.
#[derive(Debug)]
pub(crate) struct SignalHandler {
    inner: Option<os::ShutdownSignals>,
}

impl SignalHandler {
    /// Waits for the next shutdown signal. Returns `None` when no more
    /// signals can arrive; the no-op handler returns `None` straight away,
    /// which disables the caller's select branch.
    pub(crate) async fn recv(&mut self) -> Option<ShutdownEvent> {
        self.inner.as_mut()?.next_event().await
    }
}

#[cfg(unix)]
mod os {
    use super::ShutdownEvent;
    use std::io;
    use tokio::signal::unix::{signal, SignalKind};
    use tokio_stream::{wrappers::SignalStream, StreamExt, StreamMap};

    /// The Unix shutdown set, merged into one stream keyed by the event
    /// each signal delivers.
    #[derive(Debug)]
    pub(super) struct ShutdownSignals {
        merged: StreamMap<ShutdownEvent, SignalStream>,
    }

    impl ShutdownSignals {
        pub(super) fn install() -> io::Result<Self> {
            let mut merged = StreamMap::new();
            for (event, kind) in [
                (ShutdownEvent::Interrupt, SignalKind::interrupt()),
                (ShutdownEvent::Hangup, SignalKind::hangup()),
                (ShutdownEvent::Term, SignalKind::terminate()),
                (ShutdownEvent::Quit, SignalKind::quit()),
            ] {
                merged.insert(event, SignalStream::new(signal(kind)?));
            }
            Ok(Self { merged })
        }

        pub(super) async fn next_event(&mut self) -> Option<ShutdownEvent> {
            self.merged.next().await.map(|(event, ())| event)
        }
    }
}

#[cfg(windows)]
mod os {
    use super::ShutdownEvent;
    use std::io;
    use tokio::signal::windows::{ctrl_c, CtrlC};

    /// Ctrl-C is the only shutdown signal on Windows.
    #[derive(Debug)]
    pub(super) struct ShutdownSignals {
        ctrl_c: CtrlC,
        closed: bool,
    }

    impl ShutdownSignals {
        pub(super) fn install() -> io::Result<Self> {
            Ok(Self {
                ctrl_c: ctrl_c()?,
                closed: false,
            })
        }

        pub(super) async fn next_event(&mut self) -> Option<ShutdownEvent> {
            if self.closed {
                return None;
            }
            let received = self.ctrl_c.recv().await;
            if received.is_none() {
                self.closed = true;
            }
            received.map(|()| ShutdownEvent::Interrupt)
        }
    }
}
