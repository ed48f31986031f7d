//! Lazy, sector-granular erasing of the staging slot.
//!
//! Erasing a whole slot before an upload takes long enough to drop a connection or sag a
//! battery, so sectors are erased right before the first write that touches them.
//! A high-water-mark records how far the slot is known to be erased within the current
//! session. Sectors below it are never erased again, also not for retried chunks.
//! No blank check is performed: any sector above the mark is erased unconditionally.

use core::ops::Range;

use crate::{Device, FlashError, Slot};

/// Round `value` up to the next multiple of `sector_size`.
pub const fn round_up(value: u32, sector_size: u32) -> u32 {
    value.div_ceil(sector_size) * sector_size
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EraseCoordinator {
    sector_size: u32,
    /// Everything below this offset is erased, always sector aligned.
    high_water_mark: u32,
}

impl EraseCoordinator {
    pub const fn new(sector_size: u32) -> Self {
        Self {
            sector_size,
            high_water_mark: 0,
        }
    }

    pub const fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub const fn high_water_mark(&self) -> u32 {
        self.high_water_mark
    }

    /// Whether writing `[offset, offset + length)` touches sectors not yet erased.
    pub const fn needs_erase(&self, offset: u32, length: u32) -> bool {
        round_up(offset + length, self.sector_size) > self.high_water_mark
    }

    /// Erase the sectors a write to `[offset, offset + length)` touches beyond the high-water-mark.
    ///
    /// Returns the erased range, if any. On failure the high-water-mark is left untouched
    /// so that a retry erases the same range again.
    pub fn erase_if_needed(
        &mut self,
        device: &mut impl Device,
        slot: Slot,
        offset: u32,
        length: u32,
    ) -> Result<Option<Range<u32>>, FlashError> {
        let erase_through = round_up(offset + length, self.sector_size);
        if erase_through <= self.high_water_mark {
            return Ok(None);
        }

        let range = self.high_water_mark..erase_through;
        erase_sectors(device, slot, range.clone())?;
        self.high_water_mark = erase_through;

        Ok(Some(range))
    }
}

/// Erase a sector aligned range of a slot.
pub fn erase_sectors(
    device: &mut impl Device,
    slot: Slot,
    range: Range<u32>,
) -> Result<(), FlashError> {
    let sector_size = device.sector_size(slot);
    if range.start % sector_size != 0 || range.end % sector_size != 0 {
        return Err(FlashError::NotAligned);
    }

    debug!("erasing {} [{}, {})", slot, range.start, range.end);
    device
        .erase(slot, range.start, range.end - range.start)
        .inspect_err(|e| error!("erase of {} at {} failed: {}", slot, range.start, e))
}
