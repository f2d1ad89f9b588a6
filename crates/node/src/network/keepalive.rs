//! Liveness probing on the control stream.
//!
//! Every interval a random 32-byte challenge is queued ahead of other
//! control traffic and must be answered before the interval elapses again.
//! A missed reply halves the interval; a reply restores the default. Too
//! many consecutive misses, or an interval below the floor, end the
//! connection with a timeout.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use protocol::error::{ProtocolError, Result};
use protocol::packet::{KeepaliveId, Packet, PacketType};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::lifecycle::{CloseReason, LifecycleContext};
use crate::queue::OutboundQueue;

/// Default time between challenges.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(12);

/// Shortest interval backoff may reach.
pub const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// Consecutive misses tolerated before the peer is declared dead.
pub const DEFAULT_MAX_MISSED: u32 = 3;

/// Keepalive tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveSettings {
    pub interval: Duration,
    pub min_interval: Duration,
    pub max_missed: u32,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_KEEPALIVE_INTERVAL,
            min_interval: MIN_KEEPALIVE_INTERVAL,
            max_missed: DEFAULT_MAX_MISSED,
        }
    }
}

/// Keepalive state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveState {
    /// Waiting for the next tick at the default interval.
    Idle,
    /// A challenge is outstanding.
    AwaitingResponse,
    /// Waiting for the next tick at a shortened interval.
    Backoff,
    /// The peer is considered dead.
    Fatal,
}

/// Result of a missed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Try again after the halved interval.
    Retry(Duration),
    /// Give up on the connection.
    Fatal,
}

/// Interval bookkeeping, free of any I/O.
#[derive(Debug, Clone)]
pub struct KeepaliveSchedule {
    settings: KeepaliveSettings,
    interval: Duration,
    missed: u32,
    state: KeepaliveState,
}

impl KeepaliveSchedule {
    pub fn new(settings: KeepaliveSettings) -> Self {
        Self {
            settings,
            interval: settings.interval,
            missed: 0,
            state: KeepaliveState::Idle,
        }
    }

    /// Interval used for the next tick and challenge deadline.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> KeepaliveState {
        self.state
    }

    /// Consecutive misses so far.
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// A challenge went out.
    pub fn on_sent(&mut self) {
        self.state = KeepaliveState::AwaitingResponse;
    }

    /// The outstanding challenge was answered.
    pub fn on_reply(&mut self) {
        self.missed = 0;
        self.interval = self.settings.interval;
        self.state = KeepaliveState::Idle;
    }

    /// The outstanding challenge expired.
    pub fn on_timeout(&mut self) -> TimeoutOutcome {
        self.missed += 1;
        let halved = self.interval / 2;
        if self.missed >= self.settings.max_missed || halved < self.settings.min_interval {
            self.state = KeepaliveState::Fatal;
            return TimeoutOutcome::Fatal;
        }
        self.interval = halved;
        self.state = KeepaliveState::Backoff;
        TimeoutOutcome::Retry(halved)
    }
}

/// Outstanding challenges, keyed by id.
#[derive(Debug, Default)]
pub struct KeepaliveTable {
    pending: DashMap<KeepaliveId, CancellationToken>,
}

impl KeepaliveTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a challenge. The returned token fires when the reply arrives
    /// or `parent` is cancelled.
    pub fn register(&self, id: KeepaliveId, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.pending.insert(id, token.clone());
        token
    }

    /// Complete the challenge `id`.
    ///
    /// A reply to anything not pending, including a challenge whose deadline
    /// already fired, is a protocol violation.
    pub fn resolve(&self, id: &KeepaliveId) -> Result<()> {
        match self.pending.remove(id) {
            Some((_, token)) => {
                token.cancel();
                Ok(())
            }
            None => Err(ProtocolError::UnknownKeepaliveReply(hex::encode(id))),
        }
    }

    /// Stop waiting for `id`. Returns false if it was not pending.
    pub fn remove(&self, id: &KeepaliveId) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Number of outstanding challenges.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Handle incoming keepalive traffic on the control reader.
///
/// Challenges are echoed ahead of queued traffic; replies complete the
/// matching pending entry.
pub fn handle_packet(
    packet: &Packet,
    table: &KeepaliveTable,
    control_out: &OutboundQueue<Packet>,
) -> Result<()> {
    let id = packet.keepalive_id()?;
    match packet.kind {
        PacketType::Keepalive => {
            debug!("Answering keepalive");
            control_out.push_front(Packet::keepalive_reply(&id))
        }
        PacketType::KeepaliveReply => {
            table.resolve(&id)?;
            debug!("Keepalive reply matched");
            Ok(())
        }
        other => Err(ProtocolError::MalformedPacket(format!(
            "{} is not a keepalive packet",
            other
        ))),
    }
}

/// Keepalive task body. Returns once the connection is cancelled or the
/// peer is declared dead, in which case the context is cancelled with a
/// timeout.
pub async fn run(
    ctx: LifecycleContext,
    settings: KeepaliveSettings,
    table: Arc<KeepaliveTable>,
    control_out: Arc<OutboundQueue<Packet>>,
    interval_tx: watch::Sender<Duration>,
) {
    let mut schedule = KeepaliveSchedule::new(settings);

    loop {
        let interval = schedule.interval();
        tokio::select! {
            _ = ctx.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let id: KeepaliveId = rand::random();
        let answered = table.register(id, &ctx.child_token());
        if let Err(err) = control_out.push_front(Packet::keepalive(&id)) {
            table.remove(&id);
            debug!(error = %err, "Keepalive not queued");
            return;
        }
        schedule.on_sent();

        let replied = tokio::select! {
            _ = answered.cancelled() => true,
            _ = tokio::time::sleep(interval) => false,
        };
        if ctx.is_cancelled() {
            table.remove(&id);
            return;
        }

        if replied {
            schedule.on_reply();
            debug!("Keepalive answered");
        } else {
            table.remove(&id);
            match schedule.on_timeout() {
                TimeoutOutcome::Retry(next) => {
                    warn!(
                        missed = schedule.missed(),
                        next_interval_ms = next.as_millis() as u64,
                        "Keepalive timed out"
                    );
                }
                TimeoutOutcome::Fatal => {
                    ctx.cancel(CloseReason::Timeout(format!(
                        "no keepalive reply after {} attempts",
                        schedule.missed()
                    )));
                    return;
                }
            }
        }
        interval_tx.send_replace(schedule.interval());
    }
}
