//! Image management core for devices with an active and one or more staging firmware slots.
//!
//! Accepts an image in arbitrarily sized chunks, writes it into a staging slot erasing only the
//! sectors about to be written, and maintains the flags a bootloader consults on reset.
#![no_std]

#[macro_use]
mod fmt;

pub mod device;
mod error;
mod events;
mod manager;
mod shared;
pub mod state;
pub mod upload;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod mock;

use serde::{Deserialize, Serialize};

pub use error::{Error, FlashError, Rejection, RejectionKind};
pub use events::{EventError, Events, NoEvents};
pub use manager::ImageManager;
pub use shared::SharedImageManager;
pub use state::{SlotState, StateFlags, SwapType};
pub use upload::{UploadProgress, UploadRequest, UploadStatus};

/// SHA-256 digest of an image.
pub type Digest = [u8; 32];

/// Image slot as seen by the bootloader.
///
/// Slot 0 always holds the running image, every other slot is a staging slot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Slot(pub u8);

impl Slot {
    /// The slot the device is currently running from.
    pub const ACTIVE: Slot = Slot(0);
    /// The slot new images are uploaded to on a dual-slot device.
    pub const STAGING: Slot = Slot(1);

    pub const fn is_active(self) -> bool {
        self.0 == Self::ACTIVE.0
    }
}

impl core::fmt::Display for Slot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// Representation of a concrete device with image slots.
///
/// Offsets are relative to the start of a slot. All operations are blocking.
pub trait Device {
    /// Number of slots, including the active one. Dual-slot devices have two.
    fn slot_count(&self) -> u8 {
        2
    }

    /// Size in bytes of an image slot.
    fn slot_size(&self, slot: Slot) -> u32;

    /// Erase granularity of an image slot.
    ///
    /// Must be a power of two, and the slot size a multiple of it.
    fn sector_size(&self, slot: Slot) -> u32;

    fn read(&mut self, slot: Slot, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Write image data.
    ///
    /// `last` signals the end of the image, any data the driver buffers must be flushed.
    fn write(&mut self, slot: Slot, offset: u32, data: &[u8], last: bool)
    -> Result<(), FlashError>;

    /// Erase `[offset, offset + length)`, both sector aligned.
    fn erase(&mut self, slot: Slot, offset: u32, length: u32) -> Result<(), FlashError>;

    /// Raw boot flags of a slot, see [`SlotState`] for the encoding.
    fn read_flags(&mut self, slot: Slot) -> Result<u8, FlashError>;

    fn write_flags(&mut self, slot: Slot, flags: u8) -> Result<(), FlashError>;
}

impl<D: Device + ?Sized> Device for &mut D {
    fn slot_count(&self) -> u8 {
        (**self).slot_count()
    }

    fn slot_size(&self, slot: Slot) -> u32 {
        (**self).slot_size(slot)
    }

    fn sector_size(&self, slot: Slot) -> u32 {
        (**self).sector_size(slot)
    }

    fn read(&mut self, slot: Slot, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(slot, offset, buf)
    }

    fn write(
        &mut self,
        slot: Slot,
        offset: u32,
        data: &[u8],
        last: bool,
    ) -> Result<(), FlashError> {
        (**self).write(slot, offset, data, last)
    }

    fn erase(&mut self, slot: Slot, offset: u32, length: u32) -> Result<(), FlashError> {
        (**self).erase(slot, offset, length)
    }

    fn read_flags(&mut self, slot: Slot) -> Result<u8, FlashError> {
        (**self).read_flags(slot)
    }

    fn write_flags(&mut self, slot: Slot, flags: u8) -> Result<(), FlashError> {
        (**self).write_flags(slot, flags)
    }
}
