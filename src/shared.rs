use core::cell::RefCell;

use embassy_sync::blocking_mutex::{Mutex, raw::RawMutex};

use crate::{
    Device, Error, Events, ImageManager, NoEvents, Slot, StateFlags, SwapType, UploadProgress,
    UploadRequest, UploadStatus,
};

/// An [`ImageManager`] shared between contexts, for example a transport task uploading images
/// and the application confirming itself after boot.
///
/// Every operation runs to completion under the mutex, so operations never interleave.
/// Calling back into the manager from within [`lock`](Self::lock) or an event hook panics.
pub struct SharedImageManager<M: RawMutex, D: Device, E: Events = NoEvents> {
    inner: Mutex<M, RefCell<ImageManager<D, E>>>,
}

impl<M: RawMutex, D: Device, E: Events> SharedImageManager<M, D, E> {
    pub const fn new(manager: ImageManager<D, E>) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(manager)),
        }
    }

    /// Run `f` with exclusive access to the manager.
    pub fn lock<R>(&self, f: impl FnOnce(&mut ImageManager<D, E>) -> R) -> R {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }

    pub fn get_mut(&mut self) -> &mut ImageManager<D, E> {
        self.inner.get_mut().get_mut()
    }

    pub fn into_inner(self) -> ImageManager<D, E> {
        self.inner.into_inner().into_inner()
    }

    pub fn handle_chunk(&self, request: &UploadRequest<'_>) -> Result<UploadStatus, Error> {
        self.lock(|manager| manager.handle_chunk(request))
    }

    pub fn upload_progress(&self) -> Option<UploadProgress> {
        self.lock(|manager| manager.upload_progress())
    }

    pub fn abandon(&self) {
        self.lock(|manager| manager.abandon())
    }

    pub fn erase_slot(&self, slot: Slot) -> Result<(), Error> {
        self.lock(|manager| manager.erase_slot(slot))
    }

    pub fn slot_state_flags(&self, slot: Slot) -> Result<StateFlags, Error> {
        self.lock(|manager| manager.slot_state_flags(slot))
    }

    pub fn swap_type(&self) -> Result<SwapType, Error> {
        self.lock(|manager| manager.swap_type())
    }

    pub fn mark_pending(&self, slot: Slot, permanent: bool) -> Result<(), Error> {
        self.lock(|manager| manager.mark_pending(slot, permanent))
    }

    pub fn mark_confirmed(&self) -> Result<(), Error> {
        self.lock(|manager| manager.mark_confirmed())
    }
}
