// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! [`NetBuffer`]: the abstract packet buffer the filter works on.

#[cfg(any(doc, test, feature = "test_buffer"))]
pub mod test_buffer;

#[cfg(any(doc, test, feature = "test_buffer"))]
pub use test_buffer::TestBuffer;

use crate::interface::IfId;
use core::fmt::Debug;

/// Errors reported by a [`NetBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// The requested range extends beyond the end of the packet.
    #[error("range of {0} octets exceeds the packet length")]
    TooShort(usize),
    /// The buffer storage could not be rearranged to be contiguous.
    #[error("failed to make {0} octets contiguous")]
    Pullup(usize),
    /// The buffer cannot be made writable (e.g. shared storage that cannot be copied).
    #[error("buffer is not writable")]
    NotWritable,
    /// The buffer cannot carry a tag.
    #[error("buffer cannot be tagged")]
    NoTag,
}

/// A network packet, as handed to the filter by its host.
///
/// The storage of a packet may be split over several segments. Data is always accessed through
/// contiguous windows: a window that spans several segments is only available after the
/// storage has been rearranged with [`NetBuffer::pullup`].
pub trait NetBuffer: Debug {
    /// Total length of the packet, in octets.
    fn len(&self) -> usize;

    /// Whether the packet has no data at all.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get `len` octets at `offset`, if they are stored contiguously.
    fn window(&self, offset: usize, len: usize) -> Option<&[u8]>;

    /// Get `len` writable octets at `offset`, if they are stored contiguously.
    ///
    /// Callers must have called [`NetBuffer::ensure_writable`] first.
    fn window_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]>;

    /// Rearrange the storage so that the first `len` octets are contiguous.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::TooShort`] if the packet is shorter than `len` and
    /// [`BufferError::Pullup`] if the storage could not be rearranged.
    fn pullup(&mut self, len: usize) -> Result<(), BufferError>;

    /// Make sure the first `len` octets can be modified in place.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::NotWritable`] if this is not possible.
    fn ensure_writable(&mut self, len: usize) -> Result<(), BufferError>;

    /// The interface the packet was received on or is sent to.
    fn ifid(&self) -> Option<IfId>;

    /// The tag attached to the packet, if any.
    fn tag(&self) -> Option<u32>;

    /// Attach a tag to the packet.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::NoTag`] if the buffer cannot carry a tag.
    fn set_tag(&mut self, tag: u32) -> Result<(), BufferError>;

    /// Whether `len` octets at `offset` can be read without a pull-up.
    fn is_contiguous(&self, offset: usize, len: usize) -> bool {
        self.window(offset, len).is_some()
    }
}
