//! Pushes the image through the data characteristic
//!
//! Data writes are unacknowledged, so the only flow control is the link
//! refusing a frame when its buffer is full. The uploader then sleeps for the
//! backoff and offers the same frame again. It runs on its own task so the
//! event loop stays free while it waits.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use slota_proto::Frames;
use tracing::{debug, trace};

use crate::{CancelToken, FirmwareImage, Generation, PeripheralLink};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub frames: usize,
    pub bytes: usize,
    pub retries: u64,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadError {
    #[error("frame at offset {offset} rejected {attempts} times")]
    Rejected { offset: usize, attempts: u32 },
    #[error("upload cancelled at offset {offset}")]
    Cancelled { offset: usize },
}

pub struct ChunkUploader<L> {
    link: Arc<L>,
    generation: Generation,
    frame_size: NonZeroUsize,
    backoff: Duration,
    max_retries: Option<u32>,
    cancel: CancelToken,
}

impl<L: PeripheralLink> ChunkUploader<L> {
    pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(5);

    pub fn new(
        link: Arc<L>,
        generation: Generation,
        frame_size: NonZeroUsize,
        cancel: CancelToken,
    ) -> Self {
        Self {
            link,
            generation,
            frame_size,
            backoff: Self::DEFAULT_BACKOFF,
            max_retries: None,
            cancel,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// `None` retries a refused frame until it goes through or the transfer is cancelled.
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Write every frame in order. The image cursor follows accepted frames.
    pub async fn run(self, image: FirmwareImage) -> Result<UploadStats, UploadError> {
        let bytes = image.bytes();
        let mut cancel = self.cancel.clone();
        let mut stats = UploadStats::default();
        debug!(
            len = bytes.len(),
            frame_size = self.frame_size.get(),
            generation = %self.generation,
            "upload starting"
        );

        for (offset, frame) in Frames::new(&bytes, self.frame_size) {
            let mut rejected = 0u32;
            loop {
                if cancel.is_cancelled() {
                    return Err(UploadError::Cancelled { offset });
                }
                if self.link.write_data(self.generation, frame) {
                    break;
                }

                rejected += 1;
                stats.retries += 1;
                if let Some(max) = self.max_retries
                    && rejected > max
                {
                    return Err(UploadError::Rejected {
                        offset,
                        attempts: rejected,
                    });
                }
                trace!(offset, rejected, "link buffer full, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(self.backoff) => {}
                    _ = cancel.cancelled() => return Err(UploadError::Cancelled { offset }),
                }
            }

            stats.frames += 1;
            stats.bytes += frame.len();
            image.set_cursor(offset + frame.len());
        }

        debug!(frames = stats.frames, retries = stats.retries, "upload finished");
        Ok(stats)
    }
}
