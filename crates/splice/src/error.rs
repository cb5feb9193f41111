use thiserror::Error;

/// Terminal and transient IOQ error states. Any variant except
/// [`IoqError::Already`] latches the queue and tears the connection down;
/// the numeric code travels in the `error` field of synthesized messages.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum IoqError {
    #[error("unexpected end of stream")]
    Eof = 1,
    #[error("fatal socket error")]
    Sock = 2,
    #[error("stream desynchronized, bad magic")]
    Sync = 3,
    #[error("header or aux size field out of range")]
    Field = 4,
    #[error("header crc mismatch")]
    HdrCrc = 5,
    #[error("aux payload crc mismatch")]
    AuxCrc = 6,
    #[error("message sequence mismatch")]
    MsgSeq = 7,
    /// The message raced a transaction teardown. The frame is discarded
    /// and the stream keeps going.
    #[error("message raced a closed transaction")]
    Already = 8,
    #[error("transaction protocol violation")]
    Trans = 9,
}

impl IoqError {
    /// Stable wire code for the `error` header field.
    #[inline]
    pub const fn code(self) -> u32 {
        self as u32
    }

    #[inline]
    pub const fn is_fatal(self) -> bool {
        !matches!(self, Self::Already)
    }
}
