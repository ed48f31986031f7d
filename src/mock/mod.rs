use core::ops::Range;
use std::{collections::BTreeMap, vec, vec::Vec};

use crate::{Device, FlashError, Slot};

/// Erase count of every sector ever erased, keyed by slot and sector index.
#[derive(Debug)]
pub struct WearTracker(BTreeMap<(Slot, u32), usize>);

impl WearTracker {
    pub const fn new() -> Self {
        WearTracker(BTreeMap::new())
    }

    pub fn increase(&mut self, slot: Slot, sector: u32) {
        *self.0.entry((slot, sector)).or_insert(0) += 1;
    }

    /// Check wear on all sectors of slot for worst wear.
    pub fn check_slot(&self, slot: Slot, wear_level: usize) -> bool {
        self.0
            .iter()
            .filter(|((s, _), _)| *s == slot)
            .all(|(_, v)| *v <= wear_level)
    }
}

/// Slot 0 holds the running image, every other slot leftovers of an older one.
pub const RUNNING_IMAGE: u8 = 0x5a;
pub const STALE_IMAGE: u8 = 0x00;

pub struct MockDevice {
    pub slots: Vec<Vec<u8>>,
    pub flags: Vec<u8>,
    pub sector_size: u32,
    pub erases: Vec<(Slot, Range<u32>)>,
    pub writes: Vec<(Slot, Range<u32>, bool)>,
    pub flag_writes: usize,
    pub wear: WearTracker,
    pub fail_erase: bool,
    pub fail_write: bool,
}

impl MockDevice {
    pub fn new(slot_size: u32, sector_size: u32) -> MockDevice {
        Self::with_slots(2, slot_size, sector_size)
    }

    pub fn with_slots(count: u8, slot_size: u32, sector_size: u32) -> MockDevice {
        let slots = (0..count)
            .map(|slot| {
                let fill = if slot == 0 { RUNNING_IMAGE } else { STALE_IMAGE };
                vec![fill; slot_size as usize]
            })
            .collect();

        MockDevice {
            slots,
            flags: vec![0xff; count as usize],
            sector_size,
            erases: Vec::new(),
            writes: Vec::new(),
            flag_writes: 0,
            wear: WearTracker::new(),
            fail_erase: false,
            fail_write: false,
        }
    }

    /// First `len` bytes of a slot.
    pub fn image(&self, slot: Slot, len: usize) -> &[u8] {
        &self.slots[slot.0 as usize][..len]
    }

    fn range(&mut self, slot: Slot, offset: u32, len: usize) -> Result<&mut [u8], FlashError> {
        let start = offset as usize;
        self.slots
            .get_mut(slot.0 as usize)
            .and_then(|data| data.get_mut(start..start + len))
            .ok_or(FlashError::OutOfBounds)
    }
}

impl Device for MockDevice {
    fn slot_count(&self) -> u8 {
        self.slots.len() as u8
    }

    fn slot_size(&self, slot: Slot) -> u32 {
        self.slots[slot.0 as usize].len() as u32
    }

    fn sector_size(&self, _slot: Slot) -> u32 {
        self.sector_size
    }

    fn read(&mut self, slot: Slot, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        buf.copy_from_slice(self.range(slot, offset, buf.len())?);
        Ok(())
    }

    fn write(
        &mut self,
        slot: Slot,
        offset: u32,
        data: &[u8],
        last: bool,
    ) -> Result<(), FlashError> {
        if self.fail_write {
            return Err(FlashError::Other);
        }

        let target = self.range(slot, offset, data.len())?;
        assert!(
            target.iter().all(|b| *b == 0xff),
            "write to {slot} at {offset} hits unerased flash"
        );
        target.copy_from_slice(data);

        let end = offset + data.len() as u32;
        self.writes.push((slot, offset..end, last));
        Ok(())
    }

    fn erase(&mut self, slot: Slot, offset: u32, length: u32) -> Result<(), FlashError> {
        if offset % self.sector_size != 0 || length % self.sector_size != 0 {
            return Err(FlashError::NotAligned);
        }
        if self.fail_erase {
            return Err(FlashError::Other);
        }

        self.range(slot, offset, length as usize)?.fill(0xff);

        let sector_size = self.sector_size;
        for sector in (offset..offset + length).step_by(sector_size as usize) {
            self.wear.increase(slot, sector / sector_size);
        }
        self.erases.push((slot, offset..offset + length));
        Ok(())
    }

    fn read_flags(&mut self, slot: Slot) -> Result<u8, FlashError> {
        self.flags
            .get(slot.0 as usize)
            .copied()
            .ok_or(FlashError::OutOfBounds)
    }

    fn write_flags(&mut self, slot: Slot, flags: u8) -> Result<(), FlashError> {
        let target = self
            .flags
            .get_mut(slot.0 as usize)
            .ok_or(FlashError::OutOfBounds)?;
        *target = flags;
        self.flag_writes += 1;
        Ok(())
    }
}
