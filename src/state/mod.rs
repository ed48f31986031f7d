//! Boot selection state of the image slots, as consulted by the bootloader on reset.
//!
//! Each slot stores a single flag byte. Erased flash reads as `0xff`, which means no state.
//! The byte is decoded into a [`SlotState`] at the boundary so that inconsistent combinations
//! are caught before any decision is based on them.

use serde::{Deserialize, Serialize};

const RAW_UNSET: u8 = 0xff;
const RAW_PENDING: u8 = 0x01;
const RAW_CONFIRMED: u8 = 0x02;
const RAW_PENDING_PERMANENT: u8 = 0x09;
const RAW_TESTING: u8 = 0x10;

/// State of a single slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotState {
    /// No request recorded.
    Unset,
    /// The bootloader should swap to this slot on the next reset.
    ///
    /// If not `permanent` the image is booted once, and reverted unless it confirms itself.
    Pending { permanent: bool },
    /// The image is to be kept.
    Confirmed,
    /// Only valid for the active slot: the running image was booted as a test and has not
    /// confirmed itself yet. On the next reset the bootloader reverts to the previous image.
    Testing,
}

impl SlotState {
    /// Decode a stored flag byte, `None` if the combination is not valid.
    pub const fn decode(raw: u8) -> Option<SlotState> {
        match raw {
            RAW_UNSET => Some(SlotState::Unset),
            RAW_PENDING => Some(SlotState::Pending { permanent: false }),
            RAW_PENDING_PERMANENT => Some(SlotState::Pending { permanent: true }),
            RAW_CONFIRMED => Some(SlotState::Confirmed),
            RAW_TESTING => Some(SlotState::Testing),
            _ => None,
        }
    }

    pub const fn encode(self) -> u8 {
        match self {
            SlotState::Unset => RAW_UNSET,
            SlotState::Pending { permanent: false } => RAW_PENDING,
            SlotState::Pending { permanent: true } => RAW_PENDING_PERMANENT,
            SlotState::Confirmed => RAW_CONFIRMED,
            SlotState::Testing => RAW_TESTING,
        }
    }

    pub const fn is_pending(self) -> bool {
        matches!(self, SlotState::Pending { .. })
    }
}

/// Flags of a slot as reported to management clients.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StateFlags(u8);

impl StateFlags {
    pub const PENDING: u8 = 0x01;
    pub const CONFIRMED: u8 = 0x02;
    pub const ACTIVE: u8 = 0x04;
    pub const PERMANENT: u8 = 0x08;

    pub const fn new(state: SlotState, active: bool) -> Self {
        let bits = match state {
            SlotState::Unset | SlotState::Testing => 0,
            SlotState::Pending { permanent: false } => Self::PENDING,
            SlotState::Pending { permanent: true } => Self::PENDING | Self::PERMANENT,
            SlotState::Confirmed => Self::CONFIRMED,
        };

        if active {
            StateFlags(bits | Self::ACTIVE)
        } else {
            StateFlags(bits)
        }
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub const fn is_pending(self) -> bool {
        self.contains(Self::PENDING)
    }

    pub const fn is_confirmed(self) -> bool {
        self.contains(Self::CONFIRMED)
    }

    pub const fn is_active(self) -> bool {
        self.contains(Self::ACTIVE)
    }

    pub const fn is_permanent(self) -> bool {
        self.contains(Self::PERMANENT)
    }
}

/// What the bootloader will do on the next reset.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SwapType {
    /// Keep booting the active slot.
    None,
    /// Boot the pending image once.
    Test,
    /// Boot the pending image and keep it.
    Permanent,
    /// Swap back to the previous image, the tested one did not confirm itself.
    Revert,
    /// The flags are inconsistent.
    Fail,
}

impl SwapType {
    /// Numeric code used on the management wire protocol.
    pub const fn code(self) -> u8 {
        match self {
            SwapType::None => 0,
            SwapType::Test => 1,
            SwapType::Permanent => 2,
            SwapType::Revert => 3,
            SwapType::Fail => 0xff,
        }
    }
}

/// Compute the swap type from the decoded state of every slot.
///
/// `None` entries are slots whose flags did not decode.
pub fn swap_type(
    active: Option<SlotState>,
    staging: impl IntoIterator<Item = Option<SlotState>>,
) -> SwapType {
    let reverting = match active {
        Some(SlotState::Unset | SlotState::Confirmed) => false,
        Some(SlotState::Testing) => true,
        Some(SlotState::Pending { .. }) | None => return SwapType::Fail,
    };

    let mut pending = None;
    for state in staging {
        match state {
            Some(SlotState::Unset | SlotState::Confirmed) => {}
            Some(SlotState::Pending { permanent }) => {
                if pending.replace(permanent).is_some() {
                    return SwapType::Fail;
                }
            }
            Some(SlotState::Testing) | None => return SwapType::Fail,
        }
    }

    match (reverting, pending) {
        // A test image that has not confirmed itself cannot have requested another swap.
        (true, Some(_)) => SwapType::Fail,
        (true, None) => SwapType::Revert,
        (false, Some(false)) => SwapType::Test,
        (false, Some(true)) => SwapType::Permanent,
        (false, None) => SwapType::None,
    }
}
