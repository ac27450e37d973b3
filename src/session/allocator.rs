//! Address allocation for peer sessions
//!
//! Addresses are handed out sequentially from the block's host range and
//! never returned. The first one goes to the gateway.

use crate::protocol::{IpAllocation, MESSAGE_ID_IP_ALLOCATE};
use ipnet::{Ipv4AddrRange, Ipv4Net};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Allocation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("Address block {0} exhausted")]
    Exhausted(Ipv4Net),
}

/// Sequential allocator over one IPv4 block
#[derive(Debug)]
pub struct IpAllocator {
    block: Ipv4Net,
    hosts: Mutex<Ipv4AddrRange>,
}

impl IpAllocator {
    /// `block` is normalized to its network address
    pub fn new(block: Ipv4Net) -> Self {
        let block = block.trunc();
        Self {
            block,
            hosts: Mutex::new(block.hosts()),
        }
    }

    /// The normalized block
    pub fn block(&self) -> Ipv4Net {
        self.block
    }

    /// Next unused address
    pub fn allocate(&self) -> Result<Ipv4Addr, AllocError> {
        self.hosts
            .lock()
            .next()
            .ok_or(AllocError::Exhausted(self.block))
    }
}

/// Address lease delivered to a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub client: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub block: Ipv4Net,
}

impl Lease {
    /// Control message announcing this lease
    pub fn to_message(&self) -> IpAllocation {
        IpAllocation::new(
            self.client.to_string(),
            self.gateway.to_string(),
            self.block.to_string(),
        )
    }

    /// Lease carried by an allocation message, if its fields parse
    pub fn from_message(msg: &IpAllocation) -> Option<Self> {
        if msg.id != MESSAGE_ID_IP_ALLOCATE {
            return None;
        }
        Some(Self {
            client: msg.ip_address.parse().ok()?,
            gateway: msg.gateway_address.parse().ok()?,
            block: msg.cidr.parse().ok()?,
        })
    }
}

/// Server-side lease source: the gateway is reserved up front and every
/// client gets the next free address.
#[derive(Debug)]
pub struct LeasePool {
    allocator: IpAllocator,
    gateway: Ipv4Addr,
}

impl LeasePool {
    pub fn new(block: Ipv4Net) -> Result<Self, AllocError> {
        let allocator = IpAllocator::new(block);
        let gateway = allocator.allocate()?;
        Ok(Self { allocator, gateway })
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn block(&self) -> Ipv4Net {
        self.allocator.block()
    }

    /// Issue a lease for a new client session
    pub fn issue(&self) -> Result<Lease, AllocError> {
        Ok(Lease {
            client: self.allocator.allocate()?,
            gateway: self.gateway,
            block: self.allocator.block(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sequential_allocation() {
        let allocator = IpAllocator::new("10.0.0.0/24".parse().unwrap());
        assert_eq!(allocator.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(allocator.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(allocator.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn test_block_normalized() {
        let allocator = IpAllocator::new("10.0.0.77/24".parse().unwrap());
        assert_eq!(allocator.block().to_string(), "10.0.0.0/24");
        assert_eq!(allocator.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_exhaustion() {
        let block: Ipv4Net = "192.168.7.0/29".parse().unwrap();
        let allocator = IpAllocator::new(block);

        let mut seen = HashSet::new();
        for _ in 0..6 {
            let ip = allocator.allocate().unwrap();
            assert!(block.contains(&ip));
            assert_ne!(ip, block.network());
            assert_ne!(ip, block.broadcast());
            assert!(seen.insert(ip));
        }
        assert_eq!(allocator.allocate(), Err(AllocError::Exhausted(block)));
        assert_eq!(allocator.allocate(), Err(AllocError::Exhausted(block)));
    }

    #[test]
    fn test_concurrent_allocation_unique() {
        let allocator = std::sync::Arc::new(IpAllocator::new("10.1.0.0/16".parse().unwrap()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = std::sync::Arc::clone(&allocator);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| allocator.allocate().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for ip in handle.join().unwrap() {
                assert!(seen.insert(ip));
            }
        }
        assert_eq!(seen.len(), 800);
    }

    #[test]
    fn test_lease_pool() {
        let pool = LeasePool::new("10.0.0.0/24".parse().unwrap()).unwrap();
        assert_eq!(pool.gateway(), Ipv4Addr::new(10, 0, 0, 1));

        let lease = pool.issue().unwrap();
        let msg = lease.to_message();
        assert_eq!(msg.id, "ip.allocate");
        assert_eq!(msg.ip_address, "10.0.0.2");
        assert_eq!(msg.gateway_address, "10.0.0.1");
        assert_eq!(msg.cidr, "10.0.0.0/24");
        assert_eq!(Lease::from_message(&msg), Some(lease));

        assert_eq!(pool.issue().unwrap().client, Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn test_tiny_block_exhausts() {
        let pool = LeasePool::new("10.9.0.0/30".parse().unwrap()).unwrap();
        assert_eq!(pool.gateway(), Ipv4Addr::new(10, 9, 0, 1));
        assert!(pool.issue().is_ok());
        assert!(matches!(pool.issue(), Err(AllocError::Exhausted(_))));
    }
}
