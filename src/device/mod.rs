//! Implementations of [`Device`](crate::Device) for common storage.

#[cfg(feature = "nor_flash")]
pub mod nor_flash;
