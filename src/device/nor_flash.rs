//! [`Device`] over a NOR flash implementing the `embedded-storage` traits.
//!
//! Images are written as they arrive, with the bytes that do not fill a whole write unit buffered
//! until the next chunk, or padded with `0xff` on the last one. Slot flags are kept together in a
//! postcard encoded record, stored with `sequential-storage` in a dedicated state partition so
//! that an interrupted update leaves the previous record in place.

use core::ops::Range;

use embassy_embedded_hal::adapter::BlockingAsync;
use embedded_storage::nor_flash::{NorFlash, NorFlashError, ReadNorFlash};
use sequential_storage::{
    cache::NoCache,
    map::{self, SerializationError, Value},
};
use serde::{Deserialize, Serialize};

use crate::{Device, FlashError, Slot};

/// Largest write unit supported.
pub const MAX_WRITE_SIZE: usize = 32;
/// Largest number of slots supported, including the active one.
pub const MAX_SLOTS: usize = 8;

const ERASED: u8 = 0xff;

/// Where the slots and the state partition live on the flash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NorFlashLayout<const N: usize> {
    /// Absolute range of every slot, the active one first.
    pub slots: [Range<u32>; N],
    /// Absolute range holding the slot flags, at least two erase units.
    pub state: Range<u32>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct FlagRecord {
    flags: [u8; MAX_SLOTS],
}

impl FlagRecord {
    const BUFFER_SIZE: usize = 64;

    const fn unset() -> Self {
        FlagRecord {
            flags: [ERASED; MAX_SLOTS],
        }
    }
}

impl<'a> Value<'a> for FlagRecord {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        let buffer = postcard::to_slice(self, buffer).map_err(|e| match e {
            postcard::Error::SerializeBufferFull => SerializationError::BufferTooSmall,
            _ => SerializationError::Custom(0),
        })?;

        Ok(buffer.len())
    }

    fn deserialize_from(buffer: &'a [u8]) -> Result<Self, SerializationError>
    where
        Self: Sized,
    {
        postcard::from_bytes(buffer).map_err(|e| match e {
            postcard::Error::DeserializeUnexpectedEnd => SerializationError::BufferTooSmall,
            postcard::Error::DeserializeBadVarint
            | postcard::Error::DeserializeBadBool
            | postcard::Error::DeserializeBadEncoding => SerializationError::InvalidFormat,
            _ => SerializationError::Custom(0),
        })
    }
}

fn storage_error<E: NorFlashError>(error: sequential_storage::Error<E>) -> FlashError {
    match error {
        sequential_storage::Error::Storage { value, .. } => FlashError::from(value.kind()),
        _ => FlashError::Other,
    }
}

/// Bytes of a slot waiting for the rest of their write unit.
#[derive(Clone, Copy, Debug)]
struct Tail {
    slot: Slot,
    /// Slot offset of `buf`, aligned to the write size. Everything below is on flash.
    offset: u32,
    len: usize,
    buf: [u8; MAX_WRITE_SIZE],
    /// Offset of a chunk that failed after part of it was stored.
    retry_from: Option<u32>,
}

impl Tail {
    const fn new(slot: Slot, offset: u32) -> Self {
        Tail {
            slot,
            offset,
            len: 0,
            buf: [ERASED; MAX_WRITE_SIZE],
            retry_from: None,
        }
    }

    const fn end(&self) -> u32 {
        self.offset + self.len as u32
    }
}

pub struct NorFlashDevice<F: NorFlash, const N: usize = 2> {
    flash: F,
    layout: NorFlashLayout<N>,
    cache: NoCache,
    tail: Option<Tail>,
}

impl<F: NorFlash, const N: usize> NorFlashDevice<F, N> {
    /// Checks every range of the layout is erase aligned and within the flash.
    pub fn new(flash: F, layout: NorFlashLayout<N>) -> Result<Self, FlashError> {
        const {
            assert!(F::WRITE_SIZE <= MAX_WRITE_SIZE);
            assert!(N >= 2 && N <= MAX_SLOTS);
        }

        let erase_size = F::ERASE_SIZE as u32;
        let capacity = flash.capacity();
        for range in layout.slots.iter().chain([&layout.state]) {
            if range.start % erase_size != 0 || range.end % erase_size != 0 {
                return Err(FlashError::NotAligned);
            }
            if range.start >= range.end || range.end as usize > capacity {
                return Err(FlashError::OutOfBounds);
            }
        }
        if layout.state.end - layout.state.start < 2 * erase_size {
            return Err(FlashError::OutOfBounds);
        }

        Ok(Self {
            flash,
            layout,
            cache: NoCache::new(),
            tail: None,
        })
    }

    pub fn layout(&self) -> &NorFlashLayout<N> {
        &self.layout
    }

    /// Give up the flash. Buffered image bytes not yet flushed are lost.
    pub fn release(self) -> F {
        self.flash
    }

    fn slot_range(&self, slot: Slot) -> Result<Range<u32>, FlashError> {
        self.layout
            .slots
            .get(slot.0 as usize)
            .cloned()
            .ok_or(FlashError::OutOfBounds)
    }

    fn check_bounds(&self, slot: Slot, offset: u32, length: usize) -> Result<u32, FlashError> {
        let range = self.slot_range(slot)?;
        u32::try_from(length)
            .ok()
            .and_then(|length| offset.checked_add(length))
            .filter(|end| *end <= range.end - range.start)
            .ok_or(FlashError::OutOfBounds)?;
        Ok(range.start)
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        self.flash
            .write(address, data)
            .map_err(|e| FlashError::from(e.kind()))
    }

    /// Stream `data` to flash behind the buffered bytes of `tail`.
    ///
    /// `tail` tracks what reached the flash, also when an error is returned.
    fn stream(
        &mut self,
        start: u32,
        tail: &mut Tail,
        data: &[u8],
        last: bool,
    ) -> Result<(), FlashError> {
        let write_size = F::WRITE_SIZE;

        // Complete partial write unit
        let mut data = data;
        if tail.len > 0 {
            let take = (write_size - tail.len).min(data.len());
            tail.buf[tail.len..tail.len + take].copy_from_slice(&data[..take]);
            tail.len += take;
            data = &data[take..];

            if tail.len == write_size {
                self.program(start + tail.offset, &tail.buf[..write_size])?;
                *tail = Tail::new(tail.slot, tail.end());
            }
        }

        // Write aligned bulk
        let aligned = data.len() - data.len() % write_size;
        if aligned > 0 {
            self.program(start + tail.offset, &data[..aligned])?;
            tail.offset += aligned as u32;
        }

        // Keep trailing bytes
        let rest = &data[aligned..];
        tail.buf[tail.len..tail.len + rest.len()].copy_from_slice(rest);
        tail.len += rest.len();

        if last && tail.len > 0 {
            tail.buf[tail.len..write_size].fill(ERASED);
            self.program(start + tail.offset, &tail.buf[..write_size])?;
            *tail = Tail::new(tail.slot, tail.offset + write_size as u32);
        }

        Ok(())
    }

    fn read_record(&mut self) -> Result<FlagRecord, FlashError> {
        let mut buf = [0u8; FlagRecord::BUFFER_SIZE];
        let mut flash = BlockingAsync::new(&mut self.flash);

        let record = embassy_futures::block_on(map::fetch_item::<(), FlagRecord, _>(
            &mut flash,
            self.layout.state.clone(),
            &mut self.cache,
            &mut buf,
            &(),
        ))
        .map_err(storage_error)?;

        Ok(record.unwrap_or_else(|| {
            debug!("no flag record in state partition");
            FlagRecord::unset()
        }))
    }

    fn write_record(&mut self, record: &FlagRecord) -> Result<(), FlashError> {
        let mut buf = [0u8; FlagRecord::BUFFER_SIZE];
        let mut flash = BlockingAsync::new(&mut self.flash);

        embassy_futures::block_on(map::store_item::<(), FlagRecord, _>(
            &mut flash,
            self.layout.state.clone(),
            &mut self.cache,
            &mut buf,
            &(),
            record,
        ))
        .map_err(storage_error)
    }
}

impl<F: NorFlash, const N: usize> Device for NorFlashDevice<F, N> {
    fn slot_count(&self) -> u8 {
        N as u8
    }

    fn slot_size(&self, slot: Slot) -> u32 {
        self.slot_range(slot)
            .map_or(0, |range| range.end - range.start)
    }

    fn sector_size(&self, _slot: Slot) -> u32 {
        F::ERASE_SIZE as u32
    }

    /// Bytes still buffered for a write unit read as they are on flash.
    fn read(&mut self, slot: Slot, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let start = self.check_bounds(slot, offset, buf.len())?;
        self.flash
            .read(start + offset, buf)
            .map_err(|e| FlashError::from(e.kind()))
    }

    /// A chunk that failed may be retried at the same offset with the same data, the part that
    /// already reached the flash is skipped.
    fn write(
        &mut self,
        slot: Slot,
        offset: u32,
        data: &[u8],
        last: bool,
    ) -> Result<(), FlashError> {
        let start = self.check_bounds(slot, offset, data.len())?;

        let stored = self
            .tail
            .filter(|tail| tail.slot == slot && tail.retry_from == Some(offset))
            .and_then(|tail| tail.end().checked_sub(offset))
            .map(|stored| stored as usize)
            .filter(|stored| *stored <= data.len());

        // Only bytes directly preceding this chunk can be completed by it.
        let (mut tail, skip) = match (self.tail, stored) {
            (Some(tail), Some(stored)) => (tail, stored),
            (Some(tail), None) if tail.slot == slot && tail.end() == offset => (tail, 0),
            (stale, _) => {
                if let Some(stale) = stale {
                    debug!(
                        "dropping {} buffered bytes of {} at {}",
                        stale.len, stale.slot, stale.offset
                    );
                }
                if offset % F::WRITE_SIZE as u32 != 0 {
                    return Err(FlashError::NotAligned);
                }
                (Tail::new(slot, offset), 0)
            }
        };

        tail.retry_from = None;
        match self.stream(start, &mut tail, &data[skip..], last) {
            Ok(()) => {
                self.tail = (!last && tail.len > 0).then_some(tail);
                Ok(())
            }
            Err(e) => {
                error!("write to {} at {} failed: {}", slot, offset, e);
                tail.retry_from = Some(offset);
                self.tail = Some(tail);
                Err(e)
            }
        }
    }

    fn erase(&mut self, slot: Slot, offset: u32, length: u32) -> Result<(), FlashError> {
        let start = self.check_bounds(slot, offset, length as usize)?;

        let erased = offset..offset + length;
        if self
            .tail
            .is_some_and(|tail| tail.slot == slot && erased.contains(&tail.offset))
        {
            self.tail = None;
        }

        self.flash
            .erase(start + offset, start + offset + length)
            .map_err(|e| FlashError::from(e.kind()))
    }

    fn read_flags(&mut self, slot: Slot) -> Result<u8, FlashError> {
        self.slot_range(slot)?;
        Ok(self.read_record()?.flags[slot.0 as usize])
    }

    fn write_flags(&mut self, slot: Slot, flags: u8) -> Result<(), FlashError> {
        self.slot_range(slot)?;

        let mut record = self.read_record()?;
        if record.flags[slot.0 as usize] == flags {
            return Ok(());
        }
        record.flags[slot.0 as usize] = flags;
        self.write_record(&record)
    }
}
