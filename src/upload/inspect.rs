//! Decide what a chunk requires before anything is written.
//!
//! Inspection only reads the session and produces an [`UploadAction`], leaving execution to the
//! caller.

use crate::{
    Digest, Error, RejectionKind,
    upload::{UploadRequest, UploadSession},
};

/// Facts about the device needed to judge a chunk.
#[derive(Clone, Copy, Debug)]
pub struct InspectContext {
    /// Number of slots on the device, including the active one.
    pub slot_count: u8,
    /// Size of the target slot.
    pub slot_size: u32,
    /// Erase granularity of the target slot.
    pub sector_size: u32,
    /// Whether the target slot is marked pending, and must not be overwritten.
    pub slot_in_use: bool,
}

/// Parameters of a session to be started by a first chunk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SessionStart {
    pub total_size: u32,
    pub expected_digest: Option<Digest>,
    pub sector_size: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WritePlan {
    pub offset: u32,
    pub length: u32,
    /// Bytes beyond the erase high-water-mark are written, erasing is required.
    pub erase: bool,
    /// This chunk completes the image, flush and verify after writing.
    pub finalize: bool,
    /// Start a new session before writing, superseding any incomplete one for the slot.
    pub start: Option<SessionStart>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UploadAction {
    /// Write the chunk.
    Write(WritePlan),
    /// Data was already accepted earlier, report success without writing.
    Duplicate { next_offset: u32 },
    /// Sender restarted an interrupted upload of the same image, continue at `next_offset`.
    Resume { next_offset: u32 },
}

/// Judge an upload chunk against the current session.
pub fn inspect(
    context: &InspectContext,
    session: Option<&UploadSession>,
    request: &UploadRequest<'_>,
) -> Result<UploadAction, Error> {
    if request.slot.is_active() || request.slot.0 >= context.slot_count {
        return Err(Error::InvalidSlot);
    }

    let length = u32::try_from(request.data.len()).map_err(|_| RejectionKind::Overflow)?;
    let current = session.filter(|session| session.slot() == request.slot);

    if current.is_some_and(UploadSession::is_complete) {
        return Err(RejectionKind::AlreadyComplete.into());
    }

    if request.offset == 0 {
        return inspect_start(context, session, current, length, request);
    }

    let Some(session) = current else {
        return Err(RejectionKind::NoSession.into());
    };

    if request.offset < session.next_offset() {
        return Ok(UploadAction::Duplicate {
            next_offset: session.next_offset(),
        });
    }
    if request.offset > session.next_offset() {
        return Err(RejectionKind::OutOfOrder.into());
    }

    let end = request
        .offset
        .checked_add(length)
        .filter(|end| *end <= session.total_size())
        .ok_or(RejectionKind::Overflow)?;

    Ok(UploadAction::Write(WritePlan {
        offset: request.offset,
        length,
        erase: session.eraser().needs_erase(request.offset, length),
        finalize: end == session.total_size(),
        start: None,
    }))
}

fn inspect_start(
    context: &InspectContext,
    session: Option<&UploadSession>,
    current: Option<&UploadSession>,
    length: u32,
    request: &UploadRequest<'_>,
) -> Result<UploadAction, Error> {
    // One incomplete upload at a time.
    if session.is_some_and(|session| session.slot() != request.slot && !session.is_complete()) {
        return Err(RejectionKind::Busy.into());
    }

    let total_size = match request.total_size {
        Some(total_size) if total_size > 0 => total_size,
        _ => return Err(RejectionKind::MissingLength.into()),
    };

    // Resuming a session that has not progressed is the same as starting over.
    let resumable = current.filter(|current| {
        current.next_offset() > 0
            && current.is_same_image(total_size, request.expected_digest.as_ref())
    });
    if let Some(current) = resumable {
        return Ok(UploadAction::Resume {
            next_offset: current.next_offset(),
        });
    }

    if context.slot_in_use {
        return Err(RejectionKind::SlotInUse.into());
    }
    if total_size > context.slot_size {
        return Err(RejectionKind::TooLarge.into());
    }
    if length > total_size {
        return Err(RejectionKind::Overflow.into());
    }

    Ok(UploadAction::Write(WritePlan {
        offset: 0,
        length,
        erase: length > 0,
        finalize: length == total_size,
        start: Some(SessionStart {
            total_size,
            expected_digest: request.expected_digest,
            sector_size: context.sector_size,
        }),
    }))
}
