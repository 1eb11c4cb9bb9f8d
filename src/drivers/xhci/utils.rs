use thiserror::Error;

use crate::drivers::xhci::rings::trbs::CompletionStatusCode;
use crate::memory::frame_allocator::{self, Frame};
use crate::memory::{PAGE_SIZE, PhysAddr};

// FIXME: make a DMA allocator that doesn't waste memory like this
/// Uses the given frame as backing for a zero-initialized `[T; len]`,
/// starting at `offset` bytes into the frame.
pub fn allocate_buffers_frame<'a, T: Clone>(
    frame: Frame,
    offset: usize,
    len: usize,
) -> (&'a mut [T], PhysAddr) {
    assert!(offset + len * size_of::<T>() <= PAGE_SIZE);
    let virt_addr = frame.virt_addr() + offset;
    let phys_addr = frame.phys_addr() + offset;
    let slice_ptr = virt_addr.into_ptr::<T>();
    let slice = unsafe { core::slice::from_raw_parts_mut(slice_ptr, len) };
    slice.fill(unsafe { core::mem::zeroed() });
    (slice, phys_addr)
}

/// Allocates a frame then carves a zeroed `[T; len]` out of it. None if no
/// frame could be obtained.
pub fn allocate_buffers<'a, T: Clone>(len: usize) -> Option<(&'a mut [T], PhysAddr)> {
    frame_allocator::allocate_frame().map(|frame| allocate_buffers_frame(frame, 0, len))
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum XhciError {
    #[error("system out of memory")]
    OutOfMemory,
    #[error("timeout waiting for command response")]
    NoCommandResponse,
    #[error("timeout waiting for transfer event response")]
    NoTransferResponse,
    #[error("command response not successful, code: {0:?}")]
    CommandNotSuccessful(CompletionStatusCode),
    #[error("transfer response not successful, code: {0:?}")]
    TransferNotSuccessful(CompletionStatusCode),
    #[error("controller register wait timed out")]
    ControllerTimeout,
    #[error("bad parameter")]
    BadParameter,
    #[error("device is gone")]
    NoDevice,
    #[error("unknown error")]
    Other,
}
