//! Slicing a firmware image into data channel frames
//!
//! Every frame is exactly `size` bytes except the last one, which carries
//! whatever is left (`len % size`, or a full `size` when the image divides
//! evenly). An empty image yields no frames.

use std::num::NonZeroUsize;

/// Number of frames an image of `len` bytes splits into.
pub fn frame_count(len: usize, size: NonZeroUsize) -> usize {
    len.div_ceil(size.get())
}

/// Iterator over `(offset, frame)` pairs of a byte buffer.
#[derive(Debug, Clone)]
pub struct Frames<'a> {
    data: &'a [u8],
    size: usize,
    offset: usize,
}

impl<'a> Frames<'a> {
    pub fn new(data: &'a [u8], size: NonZeroUsize) -> Self {
        Self {
            data,
            size: size.get(),
            offset: 0,
        }
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = (usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let start = self.offset;
        let end = start.saturating_add(self.size).min(self.data.len());
        self.offset = end;
        Some((start, &self.data[start..end]))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.data.len() - self.offset).div_ceil(self.size);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Frames<'_> {}
