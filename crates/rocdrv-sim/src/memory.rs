//! Simulated unified address space.
//!
//! Device allocations live in host `Vec<u8>` buffers addressed by fake device
//! addresses outside the canonical host range, so a device pointer can never
//! alias a real host pointer. Pinned and registered host ranges are tracked by
//! their real addresses for pointer introspection.

use std::collections::BTreeMap;

use rocdrv_core::native::{DevicePtr, HipResult, HipStatus, RawContext};

/// Device addresses start here; one 1 TiB window per device ordinal.
const DEVICE_BASE: u64 = 0x0d00_0000_0000_0000;
const DEVICE_WINDOW: u64 = 1 << 40;
const ALLOC_ALIGN: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Device,
    /// Module-scope variable; freed with its module.
    ModuleGlobal,
    HostPinned,
    HostRegistered,
}

impl RegionKind {
    pub fn is_device(self) -> bool {
        matches!(self, RegionKind::Device | RegionKind::ModuleGlobal)
    }
}

#[derive(Debug)]
pub struct Region {
    pub size: usize,
    pub ctx: RawContext,
    pub device: i32,
    pub kind: RegionKind,
    /// Backing store for device regions; empty for host regions.
    data: Vec<u8>,
}

pub struct AddressSpace {
    regions: BTreeMap<u64, Region>,
    next: Vec<u64>,
    used: Vec<u64>,
    budget: Vec<u64>,
}

impl AddressSpace {
    pub fn new(budgets: Vec<u64>) -> Self {
        let next = (0..budgets.len() as u64)
            .map(|ordinal| DEVICE_BASE + ordinal * DEVICE_WINDOW)
            .collect();
        Self {
            regions: BTreeMap::new(),
            next,
            used: vec![0; budgets.len()],
            budget: budgets,
        }
    }

    /// Reserve a zero-filled device range.
    pub fn alloc_device(&mut self, device: i32, ctx: RawContext, bytes: usize, kind: RegionKind) -> HipResult<DevicePtr> {
        let ordinal = usize::try_from(device).map_err(|_| HipStatus::ERROR_INVALID_DEVICE)?;
        if ordinal >= self.budget.len() {
            return Err(HipStatus::ERROR_INVALID_DEVICE);
        }
        let reserve = (bytes as u64).max(1).div_ceil(ALLOC_ALIGN) * ALLOC_ALIGN;
        if self.used[ordinal] + bytes as u64 > self.budget[ordinal] {
            return Err(HipStatus::ERROR_OUT_OF_MEMORY);
        }
        let window_end = DEVICE_BASE + (ordinal as u64 + 1) * DEVICE_WINDOW;
        if self.next[ordinal] + reserve > window_end {
            return Err(HipStatus::ERROR_OUT_OF_MEMORY);
        }

        let base = self.next[ordinal];
        self.next[ordinal] += reserve;
        self.used[ordinal] += bytes as u64;
        self.regions.insert(
            base,
            Region { size: bytes, ctx, device, kind, data: vec![0; bytes] },
        );
        Ok(DevicePtr(base))
    }

    /// Track a host range (pinned allocation or registration).
    pub fn insert_host(&mut self, addr: u64, bytes: usize, ctx: RawContext, device: i32, kind: RegionKind) -> HipResult<()> {
        let end = addr + bytes as u64;
        let overlaps = self
            .regions
            .range(..end)
            .next_back()
            .is_some_and(|(&base, r)| base + r.size.max(1) as u64 > addr);
        if overlaps {
            return Err(HipStatus::ERROR_HOST_MEMORY_ALREADY_REGISTERED);
        }
        self.regions.insert(addr, Region { size: bytes, ctx, device, kind, data: Vec::new() });
        Ok(())
    }

    /// Remove a region by its exact base address.
    pub fn remove(&mut self, base: u64, kind: RegionKind) -> Option<Region> {
        if self.regions.get(&base)?.kind != kind {
            return None;
        }
        let region = self.regions.remove(&base)?;
        if region.kind.is_device() {
            if let Ok(ordinal) = usize::try_from(region.device) {
                self.used[ordinal] = self.used[ordinal].saturating_sub(region.size as u64);
            }
        }
        Some(region)
    }

    /// Drop every region belonging to `ctx`. Returns the host-pinned ranges so
    /// the caller can release their memory.
    pub fn remove_context(&mut self, ctx: RawContext) -> Vec<(u64, usize)> {
        let bases: Vec<(u64, RegionKind)> = self
            .regions
            .iter()
            .filter(|(_, r)| r.ctx == ctx)
            .map(|(&base, r)| (base, r.kind))
            .collect();
        let mut pinned = Vec::new();
        for (base, kind) in bases {
            if let Some(region) = self.remove(base, kind) {
                if kind == RegionKind::HostPinned {
                    pinned.push((base, region.size));
                }
            }
        }
        pinned
    }

    /// The region containing `addr`, with its base.
    pub fn find(&self, addr: u64) -> Option<(u64, &Region)> {
        let (&base, region) = self.regions.range(..=addr).next_back()?;
        (addr < base + region.size.max(1) as u64).then_some((base, region))
    }

    fn device_slice(&self, ptr: DevicePtr, bytes: usize) -> HipResult<(u64, usize)> {
        let (base, region) = self.find(ptr.0).ok_or(HipStatus::ERROR_INVALID_VALUE)?;
        if !region.kind.is_device() {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        let offset = (ptr.0 - base) as usize;
        if offset + bytes > region.size {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        Ok((base, offset))
    }

    /// Check that `[ptr, ptr+bytes)` lies inside one device allocation.
    pub fn check_device_range(&self, ptr: DevicePtr, bytes: usize) -> HipResult<()> {
        self.device_slice(ptr, bytes).map(|_| ())
    }

    pub fn read(&self, ptr: DevicePtr, out: &mut [u8]) -> HipResult<()> {
        let (base, offset) = self.device_slice(ptr, out.len())?;
        let region = &self.regions[&base];
        out.copy_from_slice(&region.data[offset..offset + out.len()]);
        Ok(())
    }

    pub fn write(&mut self, ptr: DevicePtr, src: &[u8]) -> HipResult<()> {
        let (base, offset) = self.device_slice(ptr, src.len())?;
        let region = self.regions.get_mut(&base).ok_or(HipStatus::ERROR_INVALID_VALUE)?;
        region.data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn copy(&mut self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> HipResult<()> {
        let mut staging = vec![0u8; bytes];
        self.read(src, &mut staging)?;
        self.write(dst, &staging)
    }

    /// Repeat `pattern` `count` times starting at `dst`.
    pub fn fill(&mut self, dst: DevicePtr, pattern: &[u8], count: usize) -> HipResult<()> {
        let bytes = pattern.len() * count;
        let (base, offset) = self.device_slice(dst, bytes)?;
        let region = self.regions.get_mut(&base).ok_or(HipStatus::ERROR_INVALID_VALUE)?;
        for chunk in region.data[offset..offset + bytes].chunks_exact_mut(pattern.len()) {
            chunk.copy_from_slice(pattern);
        }
        Ok(())
    }

    /// `(free, total)` for a device.
    pub fn info(&self, device: i32) -> HipResult<(usize, usize)> {
        let ordinal = usize::try_from(device).map_err(|_| HipStatus::ERROR_INVALID_DEVICE)?;
        let total = *self.budget.get(ordinal).ok_or(HipStatus::ERROR_INVALID_DEVICE)?;
        Ok(((total - self.used[ordinal]) as usize, total as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: RawContext = RawContext(1);

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut space = AddressSpace::new(vec![1 << 20, 1 << 20]);
        let a = space.alloc_device(0, CTX, 10, RegionKind::Device).expect("alloc a");
        let b = space.alloc_device(0, CTX, 10, RegionKind::Device).expect("alloc b");
        let c = space.alloc_device(1, CTX, 10, RegionKind::Device).expect("alloc c");
        assert_eq!(a.0 % ALLOC_ALIGN, 0);
        assert_eq!(b.0 - a.0, ALLOC_ALIGN);
        assert_eq!(c.0 - a.0, DEVICE_WINDOW);
        assert_eq!(space.find(a.0 + 9).map(|(base, _)| base), Some(a.0));
        assert!(space.find(a.0 + 10).is_none());
    }

    #[test]
    fn budget_is_enforced() {
        let mut space = AddressSpace::new(vec![1024]);
        let a = space.alloc_device(0, CTX, 1000, RegionKind::Device).expect("fits");
        assert_eq!(
            space.alloc_device(0, CTX, 100, RegionKind::Device),
            Err(HipStatus::ERROR_OUT_OF_MEMORY)
        );
        assert!(space.remove(a.0, RegionKind::Device).is_some());
        assert_eq!(space.info(0), Ok((1024, 1024)));
    }

    #[test]
    fn reads_and_writes_stay_in_bounds() {
        let mut space = AddressSpace::new(vec![1 << 20]);
        let p = space.alloc_device(0, CTX, 8, RegionKind::Device).expect("alloc");
        space.write(p.offset(4), &[1, 2, 3, 4]).expect("write tail");
        let mut out = [0u8; 8];
        space.read(p, &mut out).expect("read");
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(space.write(p.offset(6), &[0; 4]), Err(HipStatus::ERROR_INVALID_VALUE));

        space.fill(p, &0xdead_beef_u32.to_ne_bytes(), 2).expect("fill");
        space.read(p, &mut out).expect("read");
        assert_eq!(&out[..4], &0xdead_beef_u32.to_ne_bytes());
    }

    #[test]
    fn overlapping_host_registration_is_rejected() {
        let mut space = AddressSpace::new(vec![1024]);
        space.insert_host(0x1000, 0x100, CTX, 0, RegionKind::HostRegistered).expect("first");
        assert_eq!(
            space.insert_host(0x1080, 0x10, CTX, 0, RegionKind::HostRegistered),
            Err(HipStatus::ERROR_HOST_MEMORY_ALREADY_REGISTERED)
        );
        assert!(space.remove(0x1000, RegionKind::Device).is_none());
        assert!(space.remove(0x1000, RegionKind::HostRegistered).is_some());
    }
}
