/// Errors returned by the data path.
///
/// Most of these are soft conditions. The caller is expected to back off and retry, or to drop
/// the offending unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HifError {
    /// No free buffer is left in the pool.
    Exhausted,
    /// The buffer isn't in the state required for the operation.
    InvalidBufferState,
    /// The device address doesn't belong to any mapped buffer.
    UnknownAddress,
    /// The buffer couldn't be mapped for the device.
    TranslationFailed,
    /// The address batch is full and couldn't be flushed.
    BatchBusy,
    /// Neither exclusive nor shared credit is available.
    NoCredit,
    /// The grant was already acknowledged, cancelled or forfeited.
    UnknownGrant,
    InterfaceOutOfBounds,
    /// The link channel can't accept more buffers right now.
    LinkBusy,
    LinkDown,
    /// The data received from the firmware is malformed.
    Malformed,
    OutOfMemory,
}
pub type HifResult<T> = Result<T, HifError>;
