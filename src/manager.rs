use crate::{
    Device, Digest, Error, EventError, Events, FlashError, NoEvents, RejectionKind, Slot,
    state::{self, SlotState, StateFlags, SwapType},
    upload::{
        self, InspectContext, UploadAction, UploadProgress, UploadRequest, UploadSession,
        UploadStatus, WritePlan,
    },
};

/// Image management for a single device.
///
/// Owns the device and the state of the current upload. All operations are blocking and take
/// `&mut self`; wrap the manager in a [`SharedImageManager`](crate::SharedImageManager) to use
/// it from multiple contexts.
pub struct ImageManager<D: Device, E: Events = NoEvents> {
    device: D,
    events: E,
    session: Option<UploadSession>,
}

impl<D: Device> ImageManager<D> {
    pub const fn new(device: D) -> Self {
        Self::with_events(device, NoEvents)
    }
}

impl<D: Device, E: Events> ImageManager<D, E> {
    pub const fn with_events(device: D, events: E) -> Self {
        Self {
            device,
            events,
            session: None,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    /// Give up the device and event sink, forgetting any upload in progress.
    pub fn release(self) -> (D, E) {
        (self.device, self.events)
    }

    /// Handle one chunk of an image upload.
    ///
    /// Rejected chunks leave the upload untouched. On a flash failure the chunk may be sent again
    /// at the same offset.
    pub fn handle_chunk(&mut self, request: &UploadRequest<'_>) -> Result<UploadStatus, Error> {
        let action = self
            .context(request)
            .and_then(|context| upload::inspect(&context, self.session.as_ref(), request));

        let action = match action {
            Ok(action) => action,
            Err(e) => {
                warn!("chunk for {} at {} refused: {}", request.slot, request.offset, e);
                if request.offset == 0 {
                    notify(self.events.upload_started(Err(e)), "upload start");
                }
                return Err(e);
            }
        };

        match action {
            UploadAction::Duplicate { next_offset } => {
                debug!(
                    "chunk for {} at {} already written",
                    request.slot, request.offset
                );
                Ok(UploadStatus {
                    offset: next_offset,
                    complete: false,
                })
            }
            UploadAction::Resume { next_offset } => {
                info!("upload to {} resumed at {}", request.slot, next_offset);
                Ok(UploadStatus {
                    offset: next_offset,
                    complete: false,
                })
            }
            UploadAction::Write(plan) => self.write_chunk(request, plan),
        }
    }

    fn context(&mut self, request: &UploadRequest<'_>) -> Result<InspectContext, Error> {
        let slot = request.slot;
        let slot_count = self.device.slot_count();

        // Inspection refuses these, do not ask the device about slots it does not have.
        if slot.is_active() || slot.0 >= slot_count {
            return Ok(InspectContext {
                slot_count,
                slot_size: 0,
                sector_size: 0,
                slot_in_use: false,
            });
        }

        let slot_in_use = request.offset == 0 && self.slot_state(slot)?.is_pending();

        Ok(InspectContext {
            slot_count,
            slot_size: self.device.slot_size(slot),
            sector_size: self.device.sector_size(slot),
            slot_in_use,
        })
    }

    fn write_chunk(
        &mut self,
        request: &UploadRequest<'_>,
        plan: WritePlan,
    ) -> Result<UploadStatus, Error> {
        let mut fresh = plan.start.map(|start| UploadSession::new(request.slot, start));

        let written = match (fresh.as_mut(), self.session.as_mut()) {
            (Some(session), _) | (None, Some(session)) => {
                program(&mut self.device, session, request.data, &plan)
            }
            (None, None) => return Err(RejectionKind::NoSession.into()),
        };

        if let Err(e) = written {
            if fresh.is_some() {
                // The erase may have reached an image of the same slot.
                if self.session.as_ref().is_some_and(|s| s.slot() == request.slot) {
                    self.session = None;
                }
                notify(self.events.upload_started(Err(e.into())), "upload start");
            } else {
                notify(self.events.upload_done(Err(e.into()), None), "upload done");
            }
            return Err(e.into());
        }

        if let Some(fresh) = fresh {
            if let Some(previous) = self.session.as_ref().filter(|s| !s.is_complete()) {
                info!(
                    "upload to {} superseded at {} of {}",
                    previous.slot(),
                    previous.next_offset(),
                    previous.total_size()
                );
            }

            info!("upload to {} started, {} bytes", request.slot, fresh.total_size());
            self.session = Some(fresh);
            notify(self.events.upload_started(Ok(())), "upload start");
        }

        let Some(session) = self.session.as_mut() else {
            return Err(RejectionKind::NoSession.into());
        };

        if !plan.finalize {
            return Ok(UploadStatus {
                offset: session.next_offset(),
                complete: false,
            });
        }

        match session.finalize() {
            Ok(digest) => {
                info!(
                    "upload to {} complete, {} bytes",
                    session.slot(),
                    session.total_size()
                );
                notify(self.events.upload_done(Ok(()), Some(&digest)), "upload done");
                Ok(UploadStatus {
                    offset: session.next_offset(),
                    complete: true,
                })
            }
            Err(digest) => {
                warn!("upload to {} does not match its digest", session.slot());
                self.session = None;

                let error = Error::from(RejectionKind::DigestMismatch);
                notify(self.events.upload_done(Err(error), Some(&digest)), "upload done");
                Err(error)
            }
        }
    }

    /// Progress of the current upload, if any.
    pub fn upload_progress(&self) -> Option<UploadProgress> {
        self.session.as_ref().map(UploadSession::progress)
    }

    /// Digest of the image uploaded to `slot`, if its upload completed.
    pub fn staged_digest(&self, slot: Slot) -> Option<Digest> {
        self.session
            .as_ref()
            .filter(|session| session.slot() == slot)
            .and_then(|session| session.digest().copied())
    }

    /// Forget the current upload, complete or not. Neither flash nor flags are touched.
    pub fn abandon(&mut self) {
        if let Some(session) = self.session.take() {
            info!(
                "upload to {} abandoned at {}",
                session.slot(),
                session.next_offset()
            );
        }
    }

    /// Erase a staging slot entirely and clear its flags.
    ///
    /// Refused while the slot is marked pending, as the bootloader would swap in an empty slot.
    pub fn erase_slot(&mut self, slot: Slot) -> Result<(), Error> {
        self.check_slot(slot)?;
        if slot.is_active() {
            return Err(Error::InvalidSlot);
        }

        // Corrupt flags are not an obstacle, they get cleared below.
        let raw = self.device.read_flags(slot)?;
        if SlotState::decode(raw).is_some_and(SlotState::is_pending) {
            return Err(Error::InvalidTransition);
        }

        if self.session.as_ref().is_some_and(|s| s.slot() == slot) {
            self.abandon();
        }

        let size = self.device.slot_size(slot);
        upload::erase::erase_sectors(&mut self.device, slot, 0..size)?;

        if raw != SlotState::Unset.encode() {
            self.device.write_flags(slot, SlotState::Unset.encode())?;
        }

        info!("{} erased", slot);
        Ok(())
    }

    /// Read back image data from a slot.
    pub fn read(&mut self, slot: Slot, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.check_slot(slot)?;

        let size = self.device.slot_size(slot);
        u32::try_from(buf.len())
            .ok()
            .and_then(|length| offset.checked_add(length))
            .filter(|end| *end <= size)
            .ok_or(FlashError::OutOfBounds)?;

        Ok(self.device.read(slot, offset, buf)?)
    }

    pub fn slot_state(&mut self, slot: Slot) -> Result<SlotState, Error> {
        self.check_slot(slot)?;

        let raw = self.device.read_flags(slot)?;
        SlotState::decode(raw).ok_or(Error::CorruptFlags { slot, raw })
    }

    /// Flags of a slot for reporting.
    pub fn slot_state_flags(&mut self, slot: Slot) -> Result<StateFlags, Error> {
        let state = self.slot_state(slot)?;
        Ok(StateFlags::new(state, slot.is_active()))
    }

    /// What the bootloader will do on the next reset.
    ///
    /// Corrupt flags result in [`SwapType::Fail`], only a failure to read them is an error.
    pub fn swap_type(&mut self) -> Result<SwapType, Error> {
        let active = SlotState::decode(self.device.read_flags(Slot::ACTIVE)?);

        let count = self.device.slot_count();
        let device = &mut self.device;
        let mut failure = None;
        let staging = (1..count).map(|slot| match device.read_flags(Slot(slot)) {
            Ok(raw) => SlotState::decode(raw),
            Err(e) => {
                failure = Some(e);
                None
            }
        });

        let swap_type = state::swap_type(active, staging);
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(swap_type),
        }
    }

    /// Request the bootloader to swap to the image in `slot` on the next reset.
    ///
    /// The image must have been uploaded completely. If not `permanent` the image is booted
    /// once, and must confirm itself to be kept.
    ///
    /// Marking the active slot is only possible while it runs a test image, and confirms it.
    pub fn mark_pending(&mut self, slot: Slot, permanent: bool) -> Result<(), Error> {
        let result = self.write_pending(slot, permanent);
        if slot.is_active() {
            notify(self.events.confirmed(result, None), "confirmed");
        } else {
            let digest = self.staged_digest(slot);
            notify(self.events.pending(result, digest.as_ref()), "pending");
        }
        result
    }

    fn write_pending(&mut self, slot: Slot, permanent: bool) -> Result<(), Error> {
        self.check_slot(slot)?;

        let active = self.slot_state(Slot::ACTIVE)?;
        if slot.is_active() {
            return match active {
                SlotState::Testing => self.write_confirmed(),
                _ => Err(Error::InvalidSlot),
            };
        }

        if self.staged_digest(slot).is_none() {
            return Err(Error::InvalidSlot);
        }
        // The running test image has to settle before another swap can be requested.
        if active == SlotState::Testing {
            return Err(Error::InvalidTransition);
        }

        let count = self.device.slot_count();
        for other in (1..count).map(Slot).filter(|other| *other != slot) {
            if self.slot_state(other)?.is_pending() {
                return Err(Error::InvalidTransition);
            }
        }

        self.device
            .write_flags(slot, SlotState::Pending { permanent }.encode())?;
        info!("{} marked pending, permanent: {}", slot, permanent);
        Ok(())
    }

    /// Keep the running image across resets.
    ///
    /// Clears the test marker of the active slot, and cancels any test swap that was requested
    /// but not yet performed. Confirming twice is harmless.
    pub fn mark_confirmed(&mut self) -> Result<(), Error> {
        let result = self.write_confirmed();
        notify(self.events.confirmed(result, None), "confirmed");
        result
    }

    fn write_confirmed(&mut self) -> Result<(), Error> {
        let active = self.slot_state(Slot::ACTIVE)?;
        if active.is_pending() {
            return Err(Error::InvalidTransition);
        }

        if active != SlotState::Confirmed {
            self.device
                .write_flags(Slot::ACTIVE, SlotState::Confirmed.encode())?;
            info!("{} confirmed", Slot::ACTIVE);
        }

        let test = SlotState::Pending { permanent: false };
        let count = self.device.slot_count();
        for slot in (1..count).map(Slot) {
            if SlotState::decode(self.device.read_flags(slot)?) == Some(test) {
                self.device.write_flags(slot, SlotState::Unset.encode())?;
                info!("test of {} cancelled", slot);
            }
        }

        Ok(())
    }

    fn check_slot(&self, slot: Slot) -> Result<(), Error> {
        if slot.0 < self.device.slot_count() {
            Ok(())
        } else {
            Err(Error::InvalidSlot)
        }
    }
}

/// Erase as planned, write the chunk and fold it into the session.
fn program<D: Device>(
    device: &mut D,
    session: &mut UploadSession,
    data: &[u8],
    plan: &WritePlan,
) -> Result<(), FlashError> {
    let slot = session.slot();

    if plan.erase {
        session
            .eraser_mut()
            .erase_if_needed(device, slot, plan.offset, plan.length)?;
    }

    device
        .write(slot, plan.offset, data, plan.finalize)
        .inspect_err(|e| error!("write to {} at {} failed: {}", slot, plan.offset, e))?;
    session.advance(data);

    Ok(())
}

fn notify(result: Result<(), EventError>, event: &'static str) {
    if result.is_err() {
        warn!("{} event not recorded", event);
    }
}
