//! Stop signals (SIGINT, SIGTERM, SIGHUP)
//!
//! Installed once at the start of a run. From then on those signals no longer
//! terminate the process; they are queued here and picked up either at a
//! phase boundary ([`ShutdownSignals::checkpoint`]) or while the VM runs
//! ([`ShutdownSignals::recv`]).

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::warn;

use crate::error::{Error, Result};

pub struct ShutdownSignals {
    streams: Option<(Signal, Signal, Signal)>,
}

impl ShutdownSignals {
    pub fn install() -> Self {
        let streams = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        );
        match streams {
            (Ok(int), Ok(term), Ok(hup)) => Self {
                streams: Some((int, term, hup)),
            },
            (int, term, hup) => {
                let error = [int.err(), term.err(), hup.err()].into_iter().flatten().next();
                warn!(
                    ?error,
                    "could not install signal handlers; VM can only be stopped from the guest"
                );
                Self { streams: None }
            }
        }
    }

    /// Wait for the next stop signal
    pub async fn recv(&mut self) -> &'static str {
        match &mut self.streams {
            Some((int, term, hup)) => tokio::select! {
                _ = int.recv() => "SIGINT",
                _ = term.recv() => "SIGTERM",
                _ = hup.recv() => "SIGHUP",
            },
            None => std::future::pending().await,
        }
    }

    /// Fail with [`Error::Interrupted`] if a stop signal arrived since the
    /// last check
    pub async fn checkpoint(&mut self) -> Result<()> {
        // lets the runtime drain the signal pipe before looking
        tokio::task::yield_now().await;
        let received = tokio::select! {
            biased;
            sig = self.recv() => Some(sig),
            _ = std::future::ready(()) => None,
        };
        match received {
            Some(signal) => Err(Error::Interrupted(signal)),
            None => Ok(()),
        }
    }
}
