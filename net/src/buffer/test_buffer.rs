// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Toy implementation of [`NetBuffer`] which is useful for testing.

use crate::buffer::{BufferError, NetBuffer};
use crate::interface::IfId;
use tracing::trace;

/// Toy packet buffer made of a chain of segments.
///
/// It mimics the properties of a real host buffer the filter has to cope with: headers may be
/// split across segments, storage may be read-only, and the packet may carry a tag.
#[derive(Debug, Clone, Default)]
pub struct TestBuffer {
    segments: Vec<Vec<u8>>,
    ifid: Option<IfId>,
    tag: Option<u32>,
    readonly: bool,
    pullups: usize,
}

impl TestBuffer {
    /// Create a single-segment `TestBuffer` from the given octets.
    #[must_use]
    pub fn from_raw_data(data: &[u8]) -> TestBuffer {
        TestBuffer {
            segments: vec![data.to_vec()],
            ..TestBuffer::default()
        }
    }

    /// Create a `TestBuffer` made of the given segments.
    #[must_use]
    pub fn from_segments(segments: Vec<Vec<u8>>) -> TestBuffer {
        TestBuffer {
            segments,
            ..TestBuffer::default()
        }
    }

    /// Create a `TestBuffer` from `data`, split into two segments at `at`.
    #[must_use]
    pub fn split_at(data: &[u8], at: usize) -> TestBuffer {
        let at = at.min(data.len());
        let (head, tail) = data.split_at(at);
        TestBuffer::from_segments(vec![head.to_vec(), tail.to_vec()])
    }

    /// Set the interface of the packet.
    #[must_use]
    pub fn with_ifid(mut self, ifid: IfId) -> TestBuffer {
        self.ifid = Some(ifid);
        self
    }

    /// Make the buffer read-only: [`NetBuffer::ensure_writable`] will fail.
    #[must_use]
    pub fn readonly(mut self) -> TestBuffer {
        self.readonly = true;
        self
    }

    /// Change the interface of the packet.
    pub fn set_ifid(&mut self, ifid: Option<IfId>) {
        self.ifid = ifid;
    }

    /// Number of segments in the chain.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Number of pull-ups performed so far.
    #[must_use]
    pub fn pullups(&self) -> usize {
        self.pullups
    }

    /// A contiguous copy of the whole packet.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.segments.concat()
    }

    fn locate(&self, offset: usize, len: usize) -> Option<(usize, usize)> {
        let mut start = 0;
        for (index, segment) in self.segments.iter().enumerate() {
            let end = start + segment.len();
            if offset < end || (len == 0 && offset == end) {
                return (offset + len <= end).then_some((index, offset - start));
            }
            start = end;
        }
        None
    }
}

impl NetBuffer for TestBuffer {
    fn len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    fn window(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let (index, start) = self.locate(offset, len)?;
        self.segments[index].get(start..start + len)
    }

    fn window_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        let (index, start) = self.locate(offset, len)?;
        self.segments[index].get_mut(start..start + len)
    }

    fn pullup(&mut self, len: usize) -> Result<(), BufferError> {
        if len > self.len() {
            return Err(BufferError::TooShort(len));
        }
        if self.segments.first().is_some_and(|first| first.len() >= len) {
            return Ok(());
        }
        let mut merged = Vec::with_capacity(len);
        let mut consumed = 0;
        for segment in &self.segments {
            if merged.len() >= len {
                break;
            }
            merged.extend_from_slice(segment);
            consumed += 1;
        }
        self.segments.drain(..consumed);
        self.segments.insert(0, merged);
        self.pullups += 1;
        trace!("pulled up {len} octets from {consumed} segments");
        Ok(())
    }

    fn ensure_writable(&mut self, len: usize) -> Result<(), BufferError> {
        if self.readonly {
            return Err(BufferError::NotWritable);
        }
        if len > self.len() {
            return Err(BufferError::TooShort(len));
        }
        Ok(())
    }

    fn ifid(&self) -> Option<IfId> {
        self.ifid
    }

    fn tag(&self) -> Option<u32> {
        self.tag
    }

    fn set_tag(&mut self, tag: u32) -> Result<(), BufferError> {
        self.tag = Some(tag);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_do_not_span_segments() {
        let buf = TestBuffer::from_segments(vec![vec![1, 2, 3], vec![4, 5]]);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.window(0, 3), Some(&[1u8, 2, 3][..]));
        assert_eq!(buf.window(3, 2), Some(&[4u8, 5][..]));
        assert_eq!(buf.window(2, 2), None);
        assert_eq!(buf.window(4, 2), None);
        assert!(!buf.is_contiguous(1, 3));
    }

    #[test]
    fn pullup_merges_leading_segments() {
        let mut buf = TestBuffer::from_segments(vec![vec![1], vec![2, 3], vec![4], vec![5, 6]]);
        buf.pullup(4).unwrap();
        assert_eq!(buf.segment_count(), 2);
        assert_eq!(buf.window(0, 4), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(buf.pullups(), 1);
        // already contiguous: nothing to do
        buf.pullup(3).unwrap();
        assert_eq!(buf.pullups(), 1);
        assert_eq!(buf.pullup(7), Err(BufferError::TooShort(7)));
        assert_eq!(buf.to_vec(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn readonly_buffer() {
        let mut buf = TestBuffer::from_raw_data(&[0; 8]).readonly();
        assert_eq!(buf.ensure_writable(4), Err(BufferError::NotWritable));
        let mut buf = TestBuffer::from_raw_data(&[0; 8]);
        assert!(buf.ensure_writable(8).is_ok());
        buf.window_mut(2, 2).unwrap().copy_from_slice(&[7, 7]);
        assert_eq!(buf.to_vec(), vec![0, 0, 7, 7, 0, 0, 0, 0]);
    }
}
