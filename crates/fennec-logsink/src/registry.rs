//! Owning registry for several independent sinks

use crate::{config::SinkConfig, sink::FileSink, Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Opaque handle returned when a sink is added
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Holds one [`FileSink`] per handle; sinks share no state
#[derive(Default)]
pub struct SinkRegistry {
    sinks: BTreeMap<SinkId, FileSink>,
    next_id: u64,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a sink and register it under a fresh handle
    pub fn add(&mut self, config: SinkConfig) -> Result<SinkId> {
        let sink = FileSink::start(config)?;
        let id = SinkId(self.next_id);
        self.next_id += 1;
        self.sinks.insert(id, sink);
        Ok(id)
    }

    pub fn get(&self, id: SinkId) -> Option<&FileSink> {
        self.sinks.get(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = SinkId> + '_ {
        self.sinks.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Write a record to one sink
    pub fn write(&mut self, id: SinkId, record: &[u8]) -> Result<()> {
        self.sinks
            .get_mut(&id)
            .ok_or(Error::UnknownSink(id))?
            .write(record)
    }

    /// Write a record to every sink, returning the first failure after all
    /// sinks were tried
    pub fn broadcast(&mut self, record: &[u8]) -> Result<()> {
        let mut result = Ok(());
        for (id, sink) in self.sinks.iter_mut() {
            if let Err(e) = sink.write(record) {
                warn!(
                    logsink.event = "broadcast_write_failed",
                    sink_id = %id,
                    error = %e,
                    "Failed to write record to sink"
                );
                result = result.and(Err(e));
            }
        }
        result
    }

    /// Stop and forget one sink
    pub fn remove(&mut self, id: SinkId) -> Result<()> {
        let mut sink = self.sinks.remove(&id).ok_or(Error::UnknownSink(id))?;
        sink.stop()
    }

    /// Stop and forget every sink, returning the first failure
    pub fn remove_all(&mut self) -> Result<()> {
        let mut result = Ok(());
        for (_, mut sink) in std::mem::take(&mut self.sinks) {
            result = result.and(sink.stop());
        }
        result
    }
}
