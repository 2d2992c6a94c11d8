//! Moving one torrent from the source client to the destination client.
//!
//! The files are already mirrored, so only the torrent itself moves: stop it on the source, add
//! it (stopped) on the destination, wait for the destination to verify the existing data, start
//! it there and finally delete the source copy with its files. Any step may fail or time out;
//! the attempt is then abandoned with the source files intact and the next cycle starts over.
//! A torrent already present on the destination is reconciled instead of re-added.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::{AddOutcome, AddTorrentRequest, Torrent, TorrentClient};
use crate::error::{Result, RouterError};
use crate::wait::{self, PollSchedule};

const TARGET: &str = "qbrouter::migrate";

/// Bounds on each wait of a move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoveTimeouts {
    pub stop: Duration,
    pub appear: Duration,
    pub verify: Duration,
    pub poll_interval: Duration,
}

impl Default for MoveTimeouts {
    fn default() -> Self {
        Self {
            stop: Duration::from_secs(30),
            appear: Duration::from_secs(20),
            verify: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveStep {
    Stopping,
    DestCheck,
    Transfer,
    WaitAppear,
    WaitVerify,
    Cleanup,
}

impl fmt::Display for MoveStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MoveStep::Stopping => "stopping",
            MoveStep::DestCheck => "dest-check",
            MoveStep::Transfer => "transfer",
            MoveStep::WaitAppear => "wait-appear",
            MoveStep::WaitVerify => "wait-verify",
            MoveStep::Cleanup => "cleanup",
        })
    }
}

#[derive(Debug)]
pub enum MoveOutcome {
    /// Added to the destination, verified, started, and removed from the source.
    Migrated,
    /// The destination already had it; it was started there and removed from the source.
    Reconciled,
    /// The source no longer has the torrent. Nothing was changed.
    AlreadyGone,
    /// Abandoned for this cycle. Source files are untouched.
    Aborted { step: MoveStep, error: RouterError },
}

impl MoveOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, MoveOutcome::Migrated | MoveOutcome::Reconciled)
    }
}

/// Runs the per-torrent move state machine between two clients.
pub struct Mover<'a> {
    source: &'a dyn TorrentClient,
    dest: &'a dyn TorrentClient,
    timeouts: MoveTimeouts,
    cancel: &'a CancellationToken,
}

impl fmt::Debug for Mover<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mover")
            .field("source", &self.source.label())
            .field("dest", &self.dest.label())
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl<'a> Mover<'a> {
    pub fn new(
        source: &'a dyn TorrentClient,
        dest: &'a dyn TorrentClient,
        timeouts: MoveTimeouts,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            source,
            dest,
            timeouts,
            cancel,
        }
    }

    /// Move `torrent`. Never fails outright: errors come back as [`MoveOutcome::Aborted`].
    pub async fn migrate(&self, torrent: &Torrent) -> MoveOutcome {
        let hash = torrent.hash.as_str();
        info!(target: TARGET, hash, name = %torrent.name, "moving torrent to destination");

        let outcome = match self.run(torrent).await {
            Ok(outcome) => outcome,
            Err((step, error)) => MoveOutcome::Aborted { step, error },
        };

        match &outcome {
            MoveOutcome::Migrated => info!(target: TARGET, hash, "torrent migrated"),
            MoveOutcome::Reconciled => {
                info!(target: TARGET, hash, "torrent already on destination, source removed")
            }
            MoveOutcome::AlreadyGone => info!(target: TARGET, hash, "torrent no longer on source"),
            MoveOutcome::Aborted { step, error } => {
                warn!(target: TARGET, hash, %step, %error, "move abandoned, retrying next cycle")
            }
        }
        outcome
    }

    async fn run(&self, torrent: &Torrent) -> std::result::Result<MoveOutcome, (MoveStep, RouterError)> {
        let hash = torrent.hash.as_str();
        let at = |step: MoveStep| move |error: RouterError| (step, error);

        // STOPPING
        if self.source.get_torrent(hash).await.map_err(at(MoveStep::Stopping))?.is_none() {
            return Ok(MoveOutcome::AlreadyGone);
        }
        self.source.stop(hash).await.map_err(at(MoveStep::Stopping))?;
        let stopped = self
            .poll(
                "source torrent to stop",
                self.timeouts.stop,
                self.source,
                hash,
                |state| state.is_none_or(|t| t.state.is_stopped()),
            )
            .await
            .map_err(at(MoveStep::Stopping))?;
        let Some(stopped) = stopped else {
            return Ok(MoveOutcome::AlreadyGone);
        };

        // DEST_CHECK
        let existing = self.dest.get_torrent(hash).await.map_err(at(MoveStep::DestCheck))?;
        if existing.is_some() {
            info!(target: TARGET, hash, "torrent already exists on destination");
            self.dest.start(hash).await.map_err(at(MoveStep::DestCheck))?;
            self.source.delete(hash, true).await.map_err(at(MoveStep::Cleanup))?;
            return Ok(MoveOutcome::Reconciled);
        }

        // TRANSFER
        if let Err(error) = self.transfer(&stopped).await {
            error!(target: TARGET, hash, %error, "failed to add torrent to destination");
            if let Err(restart) = self.source.start(hash).await {
                error!(target: TARGET, hash, error = %restart, "failed to restart source torrent");
            }
            return Err((MoveStep::Transfer, error));
        }

        // WAIT_APPEAR
        self.poll(
            "torrent to appear on destination",
            self.timeouts.appear,
            self.dest,
            hash,
            |state| state.is_some(),
        )
        .await
        .map_err(at(MoveStep::WaitAppear))?;

        // WAIT_VERIFY
        self.poll(
            "destination to verify torrent",
            self.timeouts.verify,
            self.dest,
            hash,
            |state| state.is_some_and(|t| t.state.is_verified()),
        )
        .await
        .map_err(at(MoveStep::WaitVerify))?;

        // CLEANUP
        self.dest.start(hash).await.map_err(at(MoveStep::Cleanup))?;
        self.source.delete(hash, true).await.map_err(at(MoveStep::Cleanup))?;
        Ok(MoveOutcome::Migrated)
    }

    async fn transfer(&self, torrent: &Torrent) -> Result<()> {
        let metadata = self.source.export(&torrent.hash).await?;
        match self.dest.add(AddTorrentRequest::like(torrent, metadata)).await? {
            AddOutcome::Accepted => Ok(()),
            AddOutcome::Rejected(reason) => Err(RouterError::remote(
                format!("{}:torrents/add", self.dest.label()),
                200,
                reason,
            )),
        }
    }

    async fn poll<C>(
        &self,
        operation: &str,
        timeout: Duration,
        client: &dyn TorrentClient,
        hash: &str,
        mut done: C,
    ) -> Result<Option<Torrent>>
    where
        C: FnMut(Option<&Torrent>) -> bool,
    {
        wait::until(
            operation,
            PollSchedule::new(self.timeouts.poll_interval, timeout),
            self.cancel,
            || client.get_torrent(hash),
            |state: &Option<Torrent>| done(state.as_ref()),
        )
        .await
    }
}
