//! Workspace and reserve buffers
//!
//! Native RNN calls need scratch memory (the workspace) and memory that
//! survives from forward to backward (the reserve). Sibling layers may share
//! one buffer of each kind through a [`LayerContext`]; the shared buffer is
//! sized to the largest request any of them has made.
//!
//! Growth is monotonic: a request for less than the current size, or for
//! zero bytes, leaves the buffer alone. Growing frees the old allocation and
//! allocates the new one with ghost tracking suspended.
//!
//! Every buffer carries a write stamp. A layer that leaves data in the
//! buffer for a later call takes a fresh stamp with [`ScratchBuffer::claim`]
//! and compares it against [`ScratchBuffer::stamp`] before reading the data
//! back. Growth and claims by any other holder change the stamp.

use super::{Device, DeviceMemory};
use crate::utils::CancelEvent;
use crate::{NetError, Result};
use log::debug;
use std::cell::{RefCell, RefMut};
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

fn grow(
    device: &Device,
    label: &str,
    memory: &mut Option<DeviceMemory>,
    size: &mut usize,
    stamp: &mut u64,
    bytes: usize,
) -> Result<bool> {
    if bytes == 0 || bytes <= *size {
        return Ok(false);
    }
    debug!("{}: growing from {} to {} bytes", label, *size, bytes);
    *stamp += 1;
    device.suspend_ghost_tracking(|| {
        *memory = None;
        *size = 0;
        let fresh = device.alloc(bytes)?;
        *memory = Some(fresh);
        *size = bytes;
        Ok(true)
    })
}

#[derive(Debug)]
struct SharedState {
    device: Device,
    label: String,
    memory: Option<DeviceMemory>,
    size: usize,
    stamp: u64,
}

/// Reference-counted scratch buffer borrowed by several layers.
#[derive(Debug, Clone)]
pub struct SharedBuffer {
    inner: Rc<RefCell<SharedState>>,
}

impl SharedBuffer {
    pub fn new(device: &Device, label: &str) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SharedState {
                device: device.clone(),
                label: label.to_string(),
                memory: None,
                size: 0,
                stamp: 0,
            })),
        }
    }

    /// Current allocation id (if any) and size in bytes.
    pub fn get(&self) -> (Option<u64>, usize) {
        let state = self.inner.borrow();
        (state.memory.as_ref().map(|m| m.id()), state.size)
    }

    pub fn size(&self) -> usize {
        self.inner.borrow().size
    }

    /// Request at least `bytes`; returns whether the buffer was reallocated.
    pub fn set(&self, bytes: usize) -> Result<bool> {
        let mut state = self.inner.borrow_mut();
        let SharedState {
            device,
            label,
            memory,
            size,
            stamp,
        } = &mut *state;
        grow(device, label, memory, size, stamp, bytes)
    }

    /// Current write stamp.
    pub fn stamp(&self) -> u64 {
        self.inner.borrow().stamp
    }

    /// Mark the contents as written by the caller; returns the new stamp.
    pub fn claim(&self) -> u64 {
        let mut state = self.inner.borrow_mut();
        state.stamp += 1;
        state.stamp
    }

    pub fn same_buffer(&self, other: &SharedBuffer) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of holders of this buffer.
    pub fn holders(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    fn borrow_slice(&self) -> RefMut<'_, [f32]> {
        RefMut::map(self.inner.borrow_mut(), |s| match s.memory.as_mut() {
            Some(m) => m.as_mut_slice(),
            None => &mut [],
        })
    }
}

/// Mutable view of a scratch buffer's contents.
pub enum ScratchGuard<'a> {
    Owned(&'a mut [f32]),
    Shared(RefMut<'a, [f32]>),
}

impl Deref for ScratchGuard<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        match self {
            ScratchGuard::Owned(s) => s,
            ScratchGuard::Shared(s) => s,
        }
    }
}

impl DerefMut for ScratchGuard<'_> {
    fn deref_mut(&mut self) -> &mut [f32] {
        match self {
            ScratchGuard::Owned(s) => s,
            ScratchGuard::Shared(s) => s,
        }
    }
}

/// A layer's workspace or reserve slot: its own buffer or a borrowed one.
#[derive(Debug)]
pub enum ScratchBuffer {
    Owned {
        device: Device,
        label: String,
        memory: Option<DeviceMemory>,
        size: usize,
        stamp: u64,
    },
    Shared(SharedBuffer),
}

impl ScratchBuffer {
    pub fn owned(device: &Device, label: &str) -> Self {
        ScratchBuffer::Owned {
            device: device.clone(),
            label: label.to_string(),
            memory: None,
            size: 0,
            stamp: 0,
        }
    }

    /// Use the context's shared buffer if present, else an owned one.
    pub fn from_context(shared: Option<&SharedBuffer>, device: &Device, label: &str) -> Self {
        match shared {
            Some(buffer) => ScratchBuffer::Shared(buffer.clone()),
            None => ScratchBuffer::owned(device, label),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            ScratchBuffer::Owned { size, .. } => *size,
            ScratchBuffer::Shared(buffer) => buffer.size(),
        }
    }

    /// Grow to at least `bytes`.
    pub fn ensure(&mut self, bytes: usize) -> Result<bool> {
        match self {
            ScratchBuffer::Owned {
                device,
                label,
                memory,
                size,
                stamp,
            } => grow(device, label, memory, size, stamp, bytes),
            ScratchBuffer::Shared(buffer) => buffer.set(bytes),
        }
    }

    pub fn stamp(&self) -> u64 {
        match self {
            ScratchBuffer::Owned { stamp, .. } => *stamp,
            ScratchBuffer::Shared(buffer) => buffer.stamp(),
        }
    }

    /// Take ownership of the current contents until another holder
    /// claims or grows the buffer.
    pub fn claim(&mut self) -> u64 {
        match self {
            ScratchBuffer::Owned { stamp, .. } => {
                *stamp += 1;
                *stamp
            }
            ScratchBuffer::Shared(buffer) => buffer.claim(),
        }
    }

    pub fn borrow_mut(&mut self) -> ScratchGuard<'_> {
        match self {
            ScratchBuffer::Owned { memory, .. } => ScratchGuard::Owned(match memory.as_mut() {
                Some(m) => m.as_mut_slice(),
                None => &mut [],
            }),
            ScratchBuffer::Shared(buffer) => ScratchGuard::Shared(buffer.borrow_slice()),
        }
    }
}

/// Resources a composite layer hands to its children.
#[derive(Debug, Clone, Default)]
pub struct LayerContext {
    pub workspace: Option<SharedBuffer>,
    pub reserved: Option<SharedBuffer>,
    pub cancel: Option<CancelEvent>,
}

impl LayerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspace(mut self, buffer: SharedBuffer) -> Self {
        self.workspace = Some(buffer);
        self
    }

    pub fn with_reserved(mut self, buffer: SharedBuffer) -> Self {
        self.reserved = Some(buffer);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelEvent) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Workspace and reserve must be distinct buffers.
    pub fn validate(&self) -> Result<()> {
        if let (Some(w), Some(r)) = (&self.workspace, &self.reserved) {
            if w.same_buffer(r) {
                return Err(NetError::InvalidConfig(
                    "workspace and reserved buffers must differ".to_string(),
                ));
            }
        }
        Ok(())
    }
}
