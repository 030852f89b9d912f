//! Window-synchronized operator plumbing.
//!
//! [`ReplayableInput`] wraps an input source so the batch emitted for
//! each window is recorded in the replay log; on restart, windows at
//! or below the replay horizon are re-emitted byte-for-byte from the
//! log without touching the live source. Downstream effects become
//! exactly-once per window as long as sinks key their work on the
//! window id.

use std::path::Path;

use crate::errors::Result;
use crate::errors::StateError;
use crate::idempotent::IdempotentStorageManager;
use crate::model::OperatorId;
use crate::model::WindowId;

/// Live input feed. `poll` hands out the next item or `None` when
/// nothing is ready this window.
pub trait Source {
    fn poll(&mut self) -> Option<Vec<u8>>;
}

/// Downstream consumer of one window's batch.
pub trait Sink {
    fn deliver(&mut self, window: WindowId, items: &[Vec<u8>]) -> Result<()>;
}

/// In-memory source over a fixed item list.
pub struct VecSource {
    items: std::vec::IntoIter<Vec<u8>>,
}

impl VecSource {
    pub fn new(items: Vec<Vec<u8>>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

impl Source for VecSource {
    fn poll(&mut self) -> Option<Vec<u8>> {
        self.items.next()
    }
}

/// Sink that appends every delivered item, in order, for assertions.
#[derive(Default)]
pub struct VecSink {
    pub items: Vec<Vec<u8>>,
}

impl Sink for VecSink {
    fn deliver(&mut self, _window: WindowId, items: &[Vec<u8>]) -> Result<()> {
        self.items.extend_from_slice(items);
        Ok(())
    }
}

/// An input operator whose per-window output is recorded and, after a
/// restart, replayed.
pub struct ReplayableInput<S> {
    operator: OperatorId,
    source: S,
    log: IdempotentStorageManager,
    per_window_cap: usize,
    /// Largest logged window at construction. Windows at or below
    /// this replay from the log; windows above it read live input.
    replay_horizon: Option<WindowId>,
}

impl<S: Source> ReplayableInput<S> {
    pub fn open(
        operator: OperatorId,
        source: S,
        log_path: &Path,
        per_window_cap: usize,
    ) -> Result<Self> {
        let log = IdempotentStorageManager::open(log_path)?;
        Self::with_log(operator, source, log, per_window_cap)
    }

    pub fn with_log(
        operator: OperatorId,
        source: S,
        log: IdempotentStorageManager,
        per_window_cap: usize,
    ) -> Result<Self> {
        let replay_horizon = log.largest_recovery_window(&operator)?;
        if let Some(horizon) = replay_horizon {
            tracing::info!("Operator {operator} will replay windows up to {horizon}");
        }
        Ok(Self {
            operator,
            source,
            log,
            per_window_cap,
            replay_horizon,
        })
    }

    pub fn replay_horizon(&self) -> Option<WindowId> {
        self.replay_horizon
    }

    /// Process one window: replay it from the log if it is at or
    /// below the horizon, otherwise drain up to the per-window cap
    /// from the live source, deliver the batch, and log it.
    pub fn next_window(&mut self, window: WindowId, sink: &mut impl Sink) -> Result<usize> {
        if self.replay_horizon.is_some_and(|horizon| window <= horizon) {
            let payload = self.log.load(&self.operator, window)?.ok_or_else(|| {
                StateError::NotFound(format!(
                    "no replay record for operator {} window {window}",
                    self.operator
                ))
            })?;
            let items = decode_batch(&payload)?;
            tracing::debug!("Replayed window {window}: {} items", items.len());
            sink.deliver(window, &items)?;
            return Ok(items.len());
        }

        let mut items = Vec::new();
        while items.len() < self.per_window_cap {
            match self.source.poll() {
                Some(item) => items.push(item),
                None => break,
            }
        }
        sink.deliver(window, &items)?;
        self.log.save(&self.operator, window, &encode_batch(&items))?;
        Ok(items.len())
    }

    /// Prune replay records at windows <= `bound`, once the platform
    /// has committed everything up to it.
    pub fn prune(&self, bound: WindowId) -> Result<usize> {
        self.log.delete_up_to(&self.operator, bound)
    }
}

fn encode_batch(items: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(items.len() as u64).to_le_bytes());
    for item in items {
        buf.extend_from_slice(&(item.len() as u32).to_le_bytes());
        buf.extend_from_slice(item);
    }
    buf
}

fn decode_batch(payload: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut offset = 0;
    let count = u64::from_le_bytes(
        next(payload, &mut offset, 8)?
            .try_into()
            .map_err(|_| truncated())?,
    );
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = u32::from_le_bytes(
            next(payload, &mut offset, 4)?
                .try_into()
                .map_err(|_| truncated())?,
        );
        items.push(next(payload, &mut offset, len as usize)?.to_vec());
    }
    Ok(items)
}

fn next<'p>(payload: &'p [u8], offset: &mut usize, len: usize) -> Result<&'p [u8]> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= payload.len())
        .ok_or_else(truncated)?;
    let slice = &payload[*offset..end];
    *offset = end;
    Ok(slice)
}

fn truncated() -> StateError {
    StateError::NotFound("replay record truncated".to_owned())
}
