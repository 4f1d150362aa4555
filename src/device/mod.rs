//! Reference device: memory and native handle bookkeeping
//!
//! The device stands in for the GPU context the native RNN library runs on.
//! It hands out [`DeviceMemory`] buffers and [`NativeHandle`] descriptors,
//! both RAII wrappers that release themselves exactly once on drop, and it
//! keeps counters so callers can verify that every allocation and handle
//! created during a layer's life is released again.
//!
//! Ghost-memory tracking is a debug aid: while enabled, allocations are
//! recorded and any that are still live show up in [`Device::ghost_leaks`].
//! Long-lived buffers that are resized on purpose (shared workspaces)
//! allocate inside [`Device::suspend_ghost_tracking`] so they are not
//! reported.

pub mod workspace;

use crate::{NetError, Result};
use log::debug;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

pub use workspace::{LayerContext, ScratchBuffer, SharedBuffer};

/// Features the device's native library offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Descriptor-based RNN API.
    pub native_rnn: bool,
    /// Persistent-state RNN8 API.
    pub rnn8: bool,
}

/// Kind of descriptor a [`NativeHandle`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Rnn,
    Tensor,
    Dropout,
    Filter,
    Rnn8,
}

/// Allocation and handle counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub live_allocations: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
    pub total_allocations: usize,
    pub total_frees: usize,
    pub live_handles: usize,
    pub handles_created: usize,
    pub handles_destroyed: usize,
}

/// Entry in the ghost-memory log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryEvent {
    Alloc { id: u64, bytes: usize },
    Free { id: u64, bytes: usize },
}

#[derive(Debug, Default)]
struct GhostTracker {
    enabled: bool,
    suspended: usize,
    events: Vec<MemoryEvent>,
    tracked: HashSet<u64>,
}

impl GhostTracker {
    fn active(&self) -> bool {
        self.enabled && self.suspended == 0
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    next_id: u64,
    live: HashMap<u64, usize>,
    handles: HashMap<u64, HandleKind>,
    stats: MemoryStats,
    memory_limit: Option<usize>,
    ghost: GhostTracker,
}

impl DeviceState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug)]
struct DeviceInner {
    name: String,
    caps: Capabilities,
    state: RefCell<DeviceState>,
}

/// Cheaply cloneable handle onto one device.
#[derive(Debug, Clone)]
pub struct Device {
    inner: Rc<DeviceInner>,
}

impl Device {
    pub fn new(name: &str, caps: Capabilities) -> Self {
        Self {
            inner: Rc::new(DeviceInner {
                name: name.to_string(),
                caps,
                state: RefCell::new(DeviceState::default()),
            }),
        }
    }

    /// Device exposing both native RNN generations.
    pub fn reference() -> Self {
        Device::new(
            "reference",
            Capabilities {
                native_rnn: true,
                rnn8: true,
            },
        )
    }

    /// Device whose native library predates the RNN8 API.
    pub fn legacy_only() -> Self {
        Device::new(
            "reference-legacy",
            Capabilities {
                native_rnn: true,
                rnn8: false,
            },
        )
    }

    /// Device without any native RNN support.
    pub fn host_only() -> Self {
        Device::new(
            "host",
            Capabilities {
                native_rnn: false,
                rnn8: false,
            },
        )
    }

    /// Cap the total live bytes; allocations beyond fail with `OutOfMemory`.
    pub fn with_memory_limit(self, bytes: usize) -> Self {
        self.inner.state.borrow_mut().memory_limit = Some(bytes);
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.caps
    }

    /// Allocate a zeroed buffer of at least `bytes` bytes.
    pub fn alloc(&self, bytes: usize) -> Result<DeviceMemory> {
        let mut state = self.inner.state.borrow_mut();
        if let Some(limit) = state.memory_limit {
            let available = limit.saturating_sub(state.stats.live_bytes);
            if bytes > available {
                return Err(NetError::OutOfMemory {
                    requested: bytes,
                    available,
                });
            }
        }
        let id = state.next_id();
        state.live.insert(id, bytes);
        state.stats.live_allocations += 1;
        state.stats.live_bytes += bytes;
        state.stats.peak_bytes = state.stats.peak_bytes.max(state.stats.live_bytes);
        state.stats.total_allocations += 1;
        if state.ghost.active() {
            state.ghost.tracked.insert(id);
            state.ghost.events.push(MemoryEvent::Alloc { id, bytes });
        }
        drop(state);

        debug!("{}: alloc #{} ({} bytes)", self.inner.name, id, bytes);
        let floats = bytes.div_ceil(std::mem::size_of::<f32>());
        Ok(DeviceMemory {
            device: self.clone(),
            id,
            bytes,
            buf: vec![0.0f32; floats],
        })
    }

    fn release(&self, id: u64) {
        let mut state = self.inner.state.borrow_mut();
        let bytes = state.live.remove(&id);
        debug_assert!(bytes.is_some(), "device memory #{} released twice", id);
        if let Some(bytes) = bytes {
            state.stats.live_allocations -= 1;
            state.stats.live_bytes -= bytes;
            state.stats.total_frees += 1;
            if state.ghost.tracked.remove(&id) || state.ghost.active() {
                state.ghost.events.push(MemoryEvent::Free { id, bytes });
            }
        }
    }

    pub(crate) fn create_handle(&self, kind: HandleKind) -> NativeHandle {
        let mut state = self.inner.state.borrow_mut();
        let id = state.next_id();
        state.handles.insert(id, kind);
        state.stats.live_handles += 1;
        state.stats.handles_created += 1;
        NativeHandle {
            device: self.clone(),
            id,
            kind,
        }
    }

    fn destroy_handle(&self, id: u64) {
        let mut state = self.inner.state.borrow_mut();
        let removed = state.handles.remove(&id);
        debug_assert!(removed.is_some(), "native handle #{} destroyed twice", id);
        if removed.is_some() {
            state.stats.live_handles -= 1;
            state.stats.handles_destroyed += 1;
        }
    }

    pub fn stats(&self) -> MemoryStats {
        self.inner.state.borrow().stats.clone()
    }

    /// Number of live handles of one kind.
    pub fn live_handles_of(&self, kind: HandleKind) -> usize {
        self.inner
            .state
            .borrow()
            .handles
            .values()
            .filter(|&&k| k == kind)
            .count()
    }

    pub fn set_ghost_tracking(&self, enabled: bool) {
        let mut state = self.inner.state.borrow_mut();
        state.ghost.enabled = enabled;
        if !enabled {
            state.ghost.tracked.clear();
        }
    }

    pub fn ghost_tracking(&self) -> bool {
        self.inner.state.borrow().ghost.active()
    }

    pub fn ghost_events(&self) -> Vec<MemoryEvent> {
        self.inner.state.borrow().ghost.events.clone()
    }

    /// Allocations recorded while tracking was active that are still live.
    pub fn ghost_leaks(&self) -> Vec<u64> {
        let state = self.inner.state.borrow();
        let mut leaks: Vec<u64> = state.ghost.tracked.iter().copied().collect();
        leaks.sort_unstable();
        leaks
    }

    /// Run `f` with ghost tracking switched off; nesting is allowed.
    pub fn suspend_ghost_tracking<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.state.borrow_mut().ghost.suspended += 1;
        let result = f();
        self.inner.state.borrow_mut().ghost.suspended -= 1;
        result
    }
}

/// Device buffer released on drop.
pub struct DeviceMemory {
    device: Device,
    id: u64,
    bytes: usize,
    buf: Vec<f32>,
}

impl std::fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("id", &self.id)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl DeviceMemory {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.buf
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        debug!("{}: free #{} ({} bytes)", self.device.name(), self.id, self.bytes);
        self.device.release(self.id);
    }
}

/// Opaque native descriptor, destroyed on drop.
#[derive(Debug)]
pub struct NativeHandle {
    device: Device,
    id: u64,
    kind: HandleKind,
}

impl NativeHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        self.device.destroy_handle(self.id);
    }
}
