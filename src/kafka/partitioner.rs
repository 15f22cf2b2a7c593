//! Producer-side partition selection.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::error::{MqError, Result};

use super::config::PartitionerKind;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

#[derive(Debug)]
pub struct Partitioner {
    kind: PartitionerKind,
    next: AtomicUsize,
}

impl Partitioner {
    pub fn new(kind: PartitionerKind) -> Self {
        Self {
            kind,
            next: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> PartitionerKind {
        self.kind
    }

    /// Pick a partition in `0..partitions`.
    ///
    /// `hash` falls back to random placement for keyless records; `manual`
    /// requires an explicit partition.
    pub fn select(&self, key: Option<&str>, explicit: Option<i32>, partitions: i32) -> Result<i32> {
        if partitions <= 0 {
            return Err(MqError::Publish("topic has no partitions".to_string()));
        }

        match self.kind {
            PartitionerKind::Manual => match explicit {
                Some(p) if (0..partitions).contains(&p) => Ok(p),
                Some(p) => Err(MqError::Publish(format!(
                    "partition {p} out of range (topic has {partitions})"
                ))),
                None => Err(MqError::Publish(
                    "manual partitioner requires an explicit partition".to_string(),
                )),
            },
            PartitionerKind::Hash => match key {
                Some(key) => Ok((fnv1a(key.as_bytes()) % partitions as u32) as i32),
                None => Ok(rand::rng().random_range(0..partitions)),
            },
            PartitionerKind::Random => Ok(rand::rng().random_range(0..partitions)),
            PartitionerKind::RoundRobin => {
                let next = self.next.fetch_add(1, Ordering::Relaxed);
                Ok((next % partitions as usize) as i32)
            }
        }
    }
}
