//! Firmware image handed to the chunk uploader

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use slota_proto::DeviceAddress;

use crate::OtaError;

/// Immutable image bytes plus the upload cursor.
///
/// Clones share both. Only the uploader moves the cursor; everyone else
/// reads it for progress and may see a slightly old value.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    bytes: Arc<[u8]>,
    cursor: Arc<AtomicUsize>,
}

impl FirmwareImage {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Read an image file. The contents are opaque; empty files are rejected.
    pub async fn load(path: &Path) -> Result<Self, OtaError> {
        let bytes = tokio::fs::read(path).await?;
        if bytes.is_empty() {
            return Err(OtaError::EmptyImage);
        }
        Ok(Self::new(bytes))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> Arc<[u8]> {
        self.bytes.clone()
    }

    /// Bytes accepted by the link so far.
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    pub(crate) fn set_cursor(&self, offset: usize) {
        self.cursor.store(offset.min(self.bytes.len()), Ordering::Relaxed);
    }
}

impl From<Vec<u8>> for FirmwareImage {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

/// The peripheral being updated. The name is learned once connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDevice {
    pub address: DeviceAddress,
    pub name: Option<String>,
}

impl TargetDevice {
    pub fn new(address: DeviceAddress) -> Self {
        Self { address, name: None }
    }
}

impl std::fmt::Display for TargetDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({})", self.address),
            None => write!(f, "{}", self.address),
        }
    }
}
