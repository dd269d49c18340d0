//! Host port selection for container port mappings.

use crate::error::{CoreError, Result};
use rand::Rng;
use std::collections::HashSet;
use std::ops::RangeInclusive;

/// Inclusive range of host ports handed out to containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 30000,
            max: 60000,
        }
    }
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Result<Self> {
        if min == 0 || min > max {
            return Err(CoreError::Validation(format!(
                "invalid port range {min}-{max}"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, port: u16) -> bool {
        self.as_range().contains(&port)
    }

    pub fn len(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    fn as_range(&self) -> RangeInclusive<u16> {
        self.min..=self.max
    }
}

/// Picks random free host ports.
///
/// The allocator has no memory of its own: callers pass the ports currently
/// held by registered containers and must register the result before the
/// next call (the provisioner does both under one lock).
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    range: PortRange,
}

/// Random draws before falling back to a linear scan for a free port.
const MAX_RANDOM_ATTEMPTS: usize = 256;

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self { range }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Pick a port in range that is not in `taken`.
    ///
    /// Samples uniformly; once sampling keeps colliding, picks uniformly
    /// among the remaining free ports. Fails only when the range is full.
    pub fn allocate(&self, taken: &HashSet<u16>) -> Result<u16> {
        let mut rng = rand::rng();
        for _ in 0..MAX_RANDOM_ATTEMPTS {
            let port = rng.random_range(self.range.as_range());
            if !taken.contains(&port) {
                return Ok(port);
            }
        }

        let free: Vec<u16> = self
            .range
            .as_range()
            .filter(|p| !taken.contains(p))
            .collect();
        if free.is_empty() {
            return Err(CoreError::Provisioning(format!(
                "no free host port in {}-{}",
                self.range.min, self.range.max
            )));
        }
        Ok(free[rng.random_range(0..free.len())])
    }
}
