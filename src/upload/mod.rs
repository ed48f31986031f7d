//! Chunked image upload into a staging slot.
//!
//! An upload is driven by the sender: every chunk names its offset, and the first chunk also
//! declares the total image size and optionally its digest. Each chunk is first inspected
//! (see [`inspect`]), yielding a plan that is then executed by the [`ImageManager`](crate::ImageManager).

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{Digest, Slot};

pub mod erase;
pub mod inspect;

pub use erase::EraseCoordinator;
pub use inspect::{InspectContext, SessionStart, UploadAction, WritePlan, inspect};

/// A single chunk of an image, as received from the transport.
#[derive(Clone, Copy, Debug)]
pub struct UploadRequest<'a> {
    /// Slot the image is uploaded to.
    pub slot: Slot,
    /// Position of `data` within the image.
    pub offset: u32,
    pub data: &'a [u8],
    /// Size of the entire image. Required on the first chunk, ignored on the others.
    pub total_size: Option<u32>,
    /// SHA-256 of the entire image. Only considered on the first chunk.
    pub expected_digest: Option<Digest>,
}

impl<'a> UploadRequest<'a> {
    pub const fn new(slot: Slot, offset: u32, data: &'a [u8]) -> Self {
        Self {
            slot,
            offset,
            data,
            total_size: None,
            expected_digest: None,
        }
    }

    pub const fn with_total_size(mut self, total_size: u32) -> Self {
        self.total_size = Some(total_size);
        self
    }

    pub const fn with_digest(mut self, digest: Digest) -> Self {
        self.expected_digest = Some(digest);
        self
    }
}

/// Outcome of a successfully handled chunk.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UploadStatus {
    /// Offset the sender should continue at.
    pub offset: u32,
    /// Set once, by the chunk that completed and verified the image.
    pub complete: bool,
}

/// Snapshot of the current upload session.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UploadProgress {
    pub slot: Slot,
    pub offset: u32,
    pub total_size: u32,
    pub complete: bool,
}

/// State of one image transfer, bound to a single slot.
#[derive(Clone, Debug)]
pub struct UploadSession {
    slot: Slot,
    total_size: u32,
    next_offset: u32,
    expected_digest: Option<Digest>,
    hasher: Sha256,
    /// Digest of the received image, set once complete.
    digest: Option<Digest>,
    eraser: EraseCoordinator,
}

impl UploadSession {
    pub fn new(slot: Slot, start: SessionStart) -> Self {
        Self {
            slot,
            total_size: start.total_size,
            next_offset: 0,
            expected_digest: start.expected_digest,
            hasher: Sha256::new(),
            digest: None,
            eraser: EraseCoordinator::new(start.sector_size),
        }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn next_offset(&self) -> u32 {
        self.next_offset
    }

    pub fn expected_digest(&self) -> Option<&Digest> {
        self.expected_digest.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.digest.is_some()
    }

    /// Digest of the received image, once complete.
    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    pub fn eraser(&self) -> &EraseCoordinator {
        &self.eraser
    }

    pub(crate) fn eraser_mut(&mut self) -> &mut EraseCoordinator {
        &mut self.eraser
    }

    pub fn progress(&self) -> UploadProgress {
        UploadProgress {
            slot: self.slot,
            offset: self.next_offset,
            total_size: self.total_size,
            complete: self.is_complete(),
        }
    }

    /// Whether a restarted upload describes the same image as this session.
    pub(crate) fn is_same_image(&self, total_size: u32, digest: Option<&Digest>) -> bool {
        match (self.expected_digest.as_ref(), digest) {
            (Some(ours), Some(theirs)) => self.total_size == total_size && ours == theirs,
            _ => false,
        }
    }

    /// Record bytes that were written at the next expected offset.
    pub(crate) fn advance(&mut self, data: &[u8]) {
        self.hasher.update(data);
        // Chunk lengths were checked against the total size, which is a u32.
        self.next_offset += data.len() as u32;
    }

    /// Close the session once all bytes have been received.
    ///
    /// Returns the digest of the image, or `Err` with the computed digest when it does not
    /// match the one declared by the sender.
    pub(crate) fn finalize(&mut self) -> Result<Digest, Digest> {
        debug_assert_eq!(self.next_offset, self.total_size);

        let digest: Digest = self.hasher.clone().finalize().into();
        match self.expected_digest {
            Some(expected) if expected != digest => Err(digest),
            _ => {
                self.digest = Some(digest);
                Ok(digest)
            }
        }
    }
}
