use std::io::{self, IoSlice};

use crate::{error::IoqError, ioq::IoqBuf};

/// One direction of an established stream cipher. The codec is
/// thread-confined to the IO core and works in place on the IOQ FIFO.
pub trait StreamCodec: Send {
    /// Decrypts whatever full cipher blocks sit in `[cdn, end)`, writing
    /// plaintext back into the buffer and advancing `cdx`/`cdn`. Partial
    /// blocks stay in the tail.
    fn decrypt(&mut self, fifo: &mut IoqBuf) -> Result<(), IoqError>;

    /// Stages ciphertext for the given plaintext slices into the FIFO,
    /// advancing `cdx`/`cdn`, and returns how many plaintext bytes were
    /// consumed. The caller writes `[beg, cdx)` to the socket afterwards.
    fn encrypt(&mut self, fifo: &mut IoqBuf, plain: &[IoSlice<'_>]) -> usize;
}

/// Session key negotiation, run blocking on the fresh socket before the IO
/// core starts. On success the connection is marked crypted and every byte
/// after the handshake flows through the returned codecs.
pub trait LinkCrypto: Send {
    /// Returns the (receive, transmit) codecs.
    fn negotiate(
        &mut self,
        sock: &mut std::net::TcpStream,
    ) -> io::Result<(Box<dyn StreamCodec>, Box<dyn StreamCodec>)>;
}
