use dashmap::DashMap;

use crate::error::DriverError;

/// The kinds of native handle whose ownership the layer tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Stream,
    Event,
    Module,
    Function,
    DeviceMemory,
    HostMemory,
    HostRegistration,
}

impl HandleKind {
    /// Functions live and die with their module, so they do not keep a context busy.
    fn counts_as_live(self) -> bool {
        !matches!(self, HandleKind::Function)
    }
}

/// Bookkeeping for one native handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleRecord {
    pub kind: HandleKind,
    /// Owning context id. Host registrations may be owned by none.
    pub context_id: Option<i64>,
    /// Creation flags, e.g. the event timing mode.
    pub flags: u32,
    /// Size in bytes for memory handles.
    pub size: usize,
    /// For functions: the module they were resolved from.
    pub parent: Option<u64>,
    /// For events: whether the event has been recorded at least once.
    pub recorded: bool,
}

impl HandleRecord {
    pub fn new(kind: HandleKind, context_id: Option<i64>) -> Self {
        Self {
            kind,
            context_id,
            flags: 0,
            size: 0,
            parent: None,
            recorded: false,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_parent(mut self, parent: u64) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Registry of every handle handed out by the driver layer, keyed by kind and
/// raw native value.
///
/// Used to reject cross-context handle use, to answer "was this ever
/// recorded/registered" questions the native driver cannot, and to refuse
/// destroying a context that still owns resources.
pub struct HandleRegistry {
    records: DashMap<(HandleKind, u64), HandleRecord>,
    /// Context id -> number of live owned handles
    live: DashMap<i64, usize>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            live: DashMap::new(),
        }
    }

    /// Track a freshly created handle. Replaces any stale record with the same key.
    pub fn insert(&self, raw: u64, record: HandleRecord) {
        let kind = record.kind;
        let owner = record.context_id;
        if let Some(old) = self.records.insert((kind, raw), record) {
            self.release(&old);
        }
        if let (Some(ctx), true) = (owner, kind.counts_as_live()) {
            *self.live.entry(ctx).or_insert(0) += 1;
        }
    }

    pub fn get(&self, kind: HandleKind, raw: u64) -> Option<HandleRecord> {
        self.records.get(&(kind, raw)).map(|r| r.clone())
    }

    pub fn contains(&self, kind: HandleKind, raw: u64) -> bool {
        self.records.contains_key(&(kind, raw))
    }

    /// Stop tracking a handle, returning its record.
    pub fn remove(&self, kind: HandleKind, raw: u64) -> Option<HandleRecord> {
        let (_, record) = self.records.remove(&(kind, raw))?;
        self.release(&record);
        Some(record)
    }

    /// Look up a handle and check that it belongs to `context_id`.
    pub fn lookup_owned(&self, kind: HandleKind, raw: u64, context_id: i64) -> Result<HandleRecord, DriverError> {
        match self.get(kind, raw) {
            Some(record) if record.context_id == Some(context_id) => Ok(record),
            Some(record) => Err(DriverError::InvalidHandle(format!(
                "{kind:?} 0x{raw:x} belongs to context {:?}, not context {context_id}",
                record.context_id
            ))),
            None => Err(DriverError::InvalidHandle(format!(
                "{kind:?} 0x{raw:x} is not a live handle"
            ))),
        }
    }

    /// Mutate a record in place. Returns false when the handle is unknown.
    pub fn update(&self, kind: HandleKind, raw: u64, f: impl FnOnce(&mut HandleRecord)) -> bool {
        match self.records.get_mut(&(kind, raw)) {
            Some(mut record) => {
                f(&mut record);
                true
            }
            None => false,
        }
    }

    /// Number of live handles owned by a context.
    pub fn live_count(&self, context_id: i64) -> usize {
        self.live.get(&context_id).map(|v| *v).unwrap_or(0)
    }

    /// Drop every record whose parent is `parent` (functions of an unloaded module).
    pub fn remove_children(&self, parent: u64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.parent != Some(parent));
        before - self.records.len()
    }

    /// Find a tracked memory handle whose range intersects `[addr, addr + len)`.
    pub fn find_overlapping(&self, kind: HandleKind, addr: u64, len: usize) -> Option<(u64, HandleRecord)> {
        let end = addr.saturating_add(len.max(1) as u64);
        self.records.iter().find_map(|entry| {
            let (k, base) = *entry.key();
            let base_end = base.saturating_add(entry.size.max(1) as u64);
            (k == kind && addr < base_end && base < end).then(|| (base, entry.value().clone()))
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn release(&self, record: &HandleRecord) {
        if let (Some(ctx), true) = (record.context_id, record.kind.counts_as_live()) {
            if let Some(mut count) = self.live.get_mut(&ctx) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_counts_follow_insert_and_remove() {
        let registry = HandleRegistry::new();
        registry.insert(0x10, HandleRecord::new(HandleKind::Stream, Some(1)));
        registry.insert(0x20, HandleRecord::new(HandleKind::Event, Some(1)));
        registry.insert(0x30, HandleRecord::new(HandleKind::Function, Some(1)).with_parent(0x40));
        assert_eq!(registry.live_count(1), 2);

        registry.remove(HandleKind::Stream, 0x10);
        assert_eq!(registry.live_count(1), 1);
        assert_eq!(registry.live_count(2), 0);
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let registry = HandleRegistry::new();
        registry.insert(0x10, HandleRecord::new(HandleKind::Stream, Some(1)));
        assert!(registry.lookup_owned(HandleKind::Stream, 0x10, 1).is_ok());
        assert!(matches!(
            registry.lookup_owned(HandleKind::Stream, 0x10, 2),
            Err(DriverError::InvalidHandle(_))
        ));
        assert!(registry.lookup_owned(HandleKind::Event, 0x10, 1).is_err());
    }

    #[test]
    fn unloading_a_module_drops_its_functions() {
        let registry = HandleRegistry::new();
        registry.insert(0x40, HandleRecord::new(HandleKind::Module, Some(1)));
        registry.insert(0x41, HandleRecord::new(HandleKind::Function, Some(1)).with_parent(0x40));
        registry.insert(0x42, HandleRecord::new(HandleKind::Function, Some(1)).with_parent(0x40));
        assert_eq!(registry.remove_children(0x40), 2);
        assert!(!registry.contains(HandleKind::Function, 0x41));
        assert!(registry.contains(HandleKind::Module, 0x40));
    }

    #[test]
    fn overlapping_range_lookup() {
        let registry = HandleRegistry::new();
        registry.insert(0x1000, HandleRecord::new(HandleKind::HostRegistration, None).with_size(0x100));
        let hit = |addr, len| registry.find_overlapping(HandleKind::HostRegistration, addr, len).map(|(b, _)| b);
        assert_eq!(hit(0x10ff, 1), Some(0x1000));
        assert_eq!(hit(0x0f00, 0x101), Some(0x1000));
        assert_eq!(hit(0x0f00, 0x100), None);
        assert_eq!(hit(0x1100, 0x10), None);
        assert!(registry.find_overlapping(HandleKind::DeviceMemory, 0x1000, 1).is_none());
    }
}
