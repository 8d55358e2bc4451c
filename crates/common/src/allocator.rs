//! Peer address allocation
//!
//! The n-th peer gets host `n + offset` of the subnet, where n is the number
//! of peer directories at the time of the call. This is not a scan for the
//! lowest free host: after a deletion the next candidate can be an address a
//! surviving peer still holds. [`AddressAllocator::next_free`] closes that gap
//! by checking the candidate against the addresses in the live server document.

use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Computes peer addresses inside a fixed subnet
#[derive(Debug, Clone, Copy)]
pub struct AddressAllocator {
    subnet: Ipv4Network,
    offset: u32,
}

impl AddressAllocator {
    pub fn new(subnet: Ipv4Network, offset: u32) -> Self {
        Self { subnet, offset }
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    /// Last host that may be handed out (the broadcast address is excluded)
    fn last_host(&self) -> u32 {
        self.subnet.size().saturating_sub(2)
    }

    fn host(&self, index: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet.network()) + index)
    }

    fn exhausted(&self) -> Error {
        Error::AddressPoolExhausted {
            subnet: self.subnet.to_string(),
        }
    }

    /// Count-based address for the given number of existing peers
    pub fn next_address(&self, existing_peers: usize) -> Result<Ipv4Addr> {
        let index = u32::try_from(existing_peers)
            .ok()
            .and_then(|n| n.checked_add(self.offset))
            .filter(|&i| i <= self.last_host())
            .ok_or_else(|| self.exhausted())?;
        Ok(self.host(index))
    }

    /// Count-based candidate, moved forward (then wrapped) past anything in `taken`
    pub fn next_free(&self, existing_peers: usize, taken: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
        let first = self.offset;
        let last = self.last_host();
        if first > last {
            return Err(self.exhausted());
        }

        let start = u32::try_from(existing_peers)
            .ok()
            .and_then(|n| n.checked_add(first))
            .filter(|&i| i <= last)
            .unwrap_or(first);

        (start..=last)
            .chain(first..start)
            .map(|i| self.host(i))
            .find(|addr| !taken.contains(addr))
            .ok_or_else(|| self.exhausted())
    }
}
