use core::fmt;

use crate::Slot;

/// Failure reported by the flash driver.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Range falls outside of the slot or the underlying memory.
    OutOfBounds,
    /// Offset or length violates the alignment requirements of the memory.
    NotAligned,
    /// Any other driver failure.
    Other,
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashError::OutOfBounds => f.write_str("flash access out of bounds"),
            FlashError::NotAligned => f.write_str("flash access not aligned"),
            FlashError::Other => f.write_str("flash driver failure"),
        }
    }
}

impl core::error::Error for FlashError {}

#[cfg(feature = "nor_flash")]
impl From<embedded_storage::nor_flash::NorFlashErrorKind> for FlashError {
    fn from(kind: embedded_storage::nor_flash::NorFlashErrorKind) -> Self {
        use embedded_storage::nor_flash::NorFlashErrorKind;

        match kind {
            NorFlashErrorKind::NotAligned => FlashError::NotAligned,
            NorFlashErrorKind::OutOfBounds => FlashError::OutOfBounds,
            _ => FlashError::Other,
        }
    }
}

/// Why an upload chunk was refused.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RejectionKind {
    /// First chunk lacks a nonzero total image size.
    MissingLength,
    /// Declared image does not fit the slot.
    TooLarge,
    /// Chunk extends past the declared image size.
    Overflow,
    /// Chunk starts beyond the next expected offset.
    OutOfOrder,
    /// Chunk continues an upload that was never started.
    NoSession,
    /// Another slot has an upload in progress.
    Busy,
    /// Target slot is marked pending.
    SlotInUse,
    /// The upload for this slot already completed.
    AlreadyComplete,
    /// The received image does not match the declared digest.
    DigestMismatch,
}

/// A chunk refused by validation.
///
/// Rejections never alter the session, with the exception of [`RejectionKind::DigestMismatch`]
/// which discards it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Rejection {
    kind: RejectionKind,
}

impl Rejection {
    pub const fn new(kind: RejectionKind) -> Self {
        Self { kind }
    }

    pub const fn kind(&self) -> RejectionKind {
        self.kind
    }

    /// Reason to report back to the sender.
    pub const fn reason(&self) -> &'static str {
        match self.kind {
            RejectionKind::MissingLength => "missing length",
            RejectionKind::TooLarge => "image too large",
            RejectionKind::Overflow => "overflow",
            RejectionKind::OutOfOrder => "out of order",
            RejectionKind::NoSession => "no upload in progress",
            RejectionKind::Busy => "another upload in progress",
            RejectionKind::SlotInUse => "slot in use",
            RejectionKind::AlreadyComplete => "already complete",
            RejectionKind::DigestMismatch => "digest mismatch",
        }
    }
}

impl From<RejectionKind> for Rejection {
    fn from(kind: RejectionKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Upload chunk refused, see [`Rejection::reason`].
    Rejected(Rejection),
    /// Flash erase, write or read failed.
    Flash(FlashError),
    /// The slot does not exist or cannot be used for the requested operation.
    InvalidSlot,
    /// The operation is not allowed in the current slot state.
    InvalidTransition,
    /// The stored flags of a slot do not decode to a valid state.
    CorruptFlags { slot: Slot, raw: u8 },
}

impl Error {
    /// Shorthand to check for a specific rejection.
    pub fn is_rejection(&self, kind: RejectionKind) -> bool {
        matches!(self, Error::Rejected(rejection) if rejection.kind() == kind)
    }
}

impl From<Rejection> for Error {
    fn from(rejection: Rejection) -> Self {
        Error::Rejected(rejection)
    }
}

impl From<RejectionKind> for Error {
    fn from(kind: RejectionKind) -> Self {
        Error::Rejected(kind.into())
    }
}

impl From<FlashError> for Error {
    fn from(e: FlashError) -> Self {
        Error::Flash(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Rejected(rejection) => write!(f, "upload rejected: {}", rejection),
            Error::Flash(e) => write!(f, "{}", e),
            Error::InvalidSlot => f.write_str("invalid slot"),
            Error::InvalidTransition => f.write_str("invalid slot state transition"),
            Error::CorruptFlags { slot, raw } => {
                write!(f, "corrupt flags {:#04x} in {}", raw, slot)
            }
        }
    }
}

impl core::error::Error for Error {}
