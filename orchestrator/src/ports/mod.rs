//! Atomic range-based host-port allocation.
//!
//! Uniqueness rests on two ephemeral-store primitives: INCR on a shared
//! counter to pick candidates, SET-NX-EX to claim them. No process-local
//! lock, so allocations survive restarts and concurrent orchestrators.

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::cache::{Cache, PortAllocation};
use crate::error::{Error, Result};

/// Candidate host port for the nth counter value, wrapping over the range.
pub fn candidate_port(start: u16, end: u16, counter: u64) -> u16 {
    let span = (end - start) as u64;
    start + (counter % span) as u16
}

#[derive(Clone)]
pub struct PortAllocator {
    cache: Cache,
    start: u16,
    end: u16,
}

impl PortAllocator {
    pub fn new(cache: Cache, start: u16, end: u16) -> Self {
        Self { cache, start, end }
    }

    /// Reserve a host port for (sandbox, container port). Walks candidates
    /// from the shared counter; gives up after one full range sweep.
    pub async fn allocate(
        &self,
        sandbox_id: Uuid,
        container_port: u16,
        ttl_secs: u64,
    ) -> Result<u16> {
        let span = (self.end - self.start) as u64;
        for _ in 0..span {
            let counter = self.cache.next_port_counter().await?;
            let host_port = candidate_port(self.start, self.end, counter);

            let alloc = PortAllocation {
                sandbox_id,
                container_port,
                allocated_at: Utc::now(),
            };
            if self.cache.claim_port(host_port, &alloc, ttl_secs).await? {
                self.cache
                    .put_port_mapping(sandbox_id, container_port, host_port, ttl_secs)
                    .await?;
                return Ok(host_port);
            }
        }
        Err(Error::NoPortsAvailable)
    }

    /// Release one host port: drop the reverse hash entry, then the claim.
    pub async fn release(&self, host_port: u16) -> Result<()> {
        if let Some(alloc) = self.cache.get_port_allocation(host_port).await? {
            self.cache
                .del_port_mapping(alloc.sandbox_id, alloc.container_port)
                .await?;
        }
        self.cache.del_port_allocation(host_port).await?;
        Ok(())
    }

    /// Release every port held by a sandbox and drop its hash.
    pub async fn release_all(&self, sandbox_id: Uuid) -> Result<()> {
        let mappings = self.cache.port_mappings(sandbox_id).await?;
        for (container_port, host_port) in mappings {
            if let Err(e) = self.cache.del_port_allocation(host_port).await {
                warn!(sandbox_id = %sandbox_id, host_port, container_port, "port release failed: {e}");
            }
        }
        self.cache.del_ports_hash(sandbox_id).await?;
        Ok(())
    }

    /// Existing host port for (sandbox, container port), if any.
    pub async fn lookup(&self, sandbox_id: Uuid, container_port: u16) -> Result<Option<u16>> {
        self.cache.get_port_mapping(sandbox_id, container_port).await
    }

    pub async fn snapshot(&self, sandbox_id: Uuid) -> Result<std::collections::HashMap<u16, u16>> {
        self.cache.port_mappings(sandbox_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_stay_inside_the_range() {
        for counter in 0..100_000u64 {
            let p = candidate_port(30000, 40000, counter);
            assert!((30000..40000).contains(&p));
        }
    }

    #[test]
    fn candidates_wrap_over_the_range() {
        let span = 40000u64 - 30000;
        assert_eq!(candidate_port(30000, 40000, 0), 30000);
        assert_eq!(candidate_port(30000, 40000, span - 1), 39999);
        assert_eq!(candidate_port(30000, 40000, span), 30000);
        assert_eq!(candidate_port(30000, 40000, span + 7), 30007);
    }

    #[test]
    fn one_sweep_visits_every_port_once() {
        let (start, end) = (30000u16, 30016u16);
        let mut seen = std::collections::HashSet::new();
        for counter in 0..(end - start) as u64 {
            seen.insert(candidate_port(start, end, counter));
        }
        assert_eq!(seen.len(), (end - start) as usize);
    }
}
