use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Maximum number of concurrently allocated sandbox slots.
const MAX_SLOTS: u16 = 256;

/// A slot is the stable (namespace, vpeerIP, hostIP) triple a sandbox bridge
/// is built from for its whole lifetime (§3 "Slot allocator reference
/// implementation"). `host_ip`/`vpeer_ip` come from the two /16 ranges used
/// as worked examples in the reference implementation's comments
/// (10.11.0.0/16 host-side, 10.12.0.0/16 namespace-side); this allocator is
/// a standalone reference for driving the bridge outside a full fleet —
/// the production-wide IPAM is out of scope here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub index: u16,
    pub namespace_id: u16,
    pub vpeer_ip: Ipv4Addr,
    pub host_ip: Ipv4Addr,
}

impl Slot {
    fn for_index(index: u16) -> Self {
        let hi = (index >> 8) as u8;
        let lo = (index & 0xff) as u8;
        Self {
            index,
            namespace_id: index,
            vpeer_ip: Ipv4Addr::new(10, 12, hi, lo),
            host_ip: Ipv4Addr::new(10, 11, hi, lo),
        }
    }

    pub fn namespace_name(&self) -> String {
        format!("ns-{}", self.namespace_id)
    }
}

/// Allocates and releases sandbox slots. Reuses the lowest free index, same
/// discipline as the teacher's `SlotManager` (first-fit over a `HashSet`).
pub struct SlotManager {
    used: Mutex<HashSet<u16>>,
}

impl Default for SlotManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotManager {
    pub fn new() -> Self {
        Self {
            used: Mutex::new(HashSet::new()),
        }
    }

    pub fn allocate(&self) -> Result<Slot, SlotError> {
        let mut used = self.used.lock().unwrap();
        for index in 0..MAX_SLOTS {
            if !used.contains(&index) {
                used.insert(index);
                return Ok(Slot::for_index(index));
            }
        }
        Err(SlotError::Exhausted)
    }

    pub fn release(&self, slot: Slot) {
        let mut used = self.used.lock().unwrap();
        used.remove(&slot.index);
    }

    pub fn active_count(&self) -> usize {
        self.used.lock().unwrap().len()
    }
}

#[derive(Debug)]
pub enum SlotError {
    Exhausted,
}

impl std::fmt::Display for SlotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotError::Exhausted => write!(f, "all sandbox slots exhausted (max {})", MAX_SLOTS),
        }
    }
}

impl std::error::Error for SlotError {}
