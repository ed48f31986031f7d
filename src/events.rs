use crate::{Digest, Error};

/// An event sink failed to record an event.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventError;

/// Hooks invoked on noteworthy image management events, for example to keep an audit log.
///
/// Every hook receives the outcome of the operation, and the digest of the image involved if
/// known. Failures are logged and otherwise ignored: they never abort the operation.
pub trait Events {
    /// A first chunk was handled, starting a new upload or failing to.
    fn upload_started(&mut self, _status: Result<(), Error>) -> Result<(), EventError> {
        Ok(())
    }

    /// An upload completed, or was aborted by a failure.
    fn upload_done(
        &mut self,
        _status: Result<(), Error>,
        _digest: Option<&Digest>,
    ) -> Result<(), EventError> {
        Ok(())
    }

    /// A staged image was marked to be swapped in on the next reset.
    fn pending(
        &mut self,
        _status: Result<(), Error>,
        _digest: Option<&Digest>,
    ) -> Result<(), EventError> {
        Ok(())
    }

    /// The running image was confirmed.
    ///
    /// The manager does not know the digest of the running image, so `digest` is always `None`.
    fn confirmed(
        &mut self,
        _status: Result<(), Error>,
        _digest: Option<&Digest>,
    ) -> Result<(), EventError> {
        Ok(())
    }
}

/// Discards all events.
#[derive(Clone, Copy, Default, Debug)]
pub struct NoEvents;

impl Events for NoEvents {}

impl<E: Events + ?Sized> Events for &mut E {
    fn upload_started(&mut self, status: Result<(), Error>) -> Result<(), EventError> {
        (**self).upload_started(status)
    }

    fn upload_done(
        &mut self,
        status: Result<(), Error>,
        digest: Option<&Digest>,
    ) -> Result<(), EventError> {
        (**self).upload_done(status, digest)
    }

    fn pending(
        &mut self,
        status: Result<(), Error>,
        digest: Option<&Digest>,
    ) -> Result<(), EventError> {
        (**self).pending(status, digest)
    }

    fn confirmed(
        &mut self,
        status: Result<(), Error>,
        digest: Option<&Digest>,
    ) -> Result<(), EventError> {
        (**self).confirmed(status, digest)
    }
}
