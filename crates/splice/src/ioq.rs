use std::{
    collections::VecDeque,
    io::{self, Read},
};

use splice_utils::safe_assert;
use tracing::debug;

use crate::{
    crypto::StreamCodec,
    error::IoqError,
    msg::Msg,
    wire::{AUX_MAX, Crc32Fn, HDR_CRC_OFF, HDR_MAGIC, HDR_MAGIC_REV, HDR_MAX, HDR_SIZE, Header, align64, hdr_bytes},
};

/// Per-direction FIFO size. Half is reserved for not-yet-processed
/// ciphertext; worst-case encrypted expansion is budgeted as 2x the
/// plaintext.
pub const IOQ_BUF_SIZE: usize = 128 * 1024;

/// Cap on gathered slices per vectored write.
pub const MAX_IOVEC: usize = 16;

/// Byte FIFO shared between the parser and the stream codec.
///
/// Cursor layout, always `beg <= cdx <= cdn <= end`:
///
/// ```text
/// beg ......... cdx ............ cdn ............. end
///    [READY]       [BOOKKEEPING]    [NOTYETCRYPTED]
/// ```
///
/// `[beg, cdx)` is decrypted and ready for the parser, `[cdx, cdn)` has
/// been consumed by CRC/alignment bookkeeping, `[cdn, end)` is ciphertext.
/// Plaintext links keep `cdx = cdn = end`.
pub struct IoqBuf {
    pub buf: Box<[u8]>,
    pub beg: usize,
    pub cdx: usize,
    pub cdn: usize,
    pub end: usize,
}

impl Default for IoqBuf {
    fn default() -> Self {
        Self { buf: vec![0u8; IOQ_BUF_SIZE].into_boxed_slice(), beg: 0, cdx: 0, cdn: 0, end: 0 }
    }
}

impl IoqBuf {
    /// Decrypted bytes available to the parser.
    #[inline]
    pub fn ready(&self) -> usize {
        self.cdx - self.beg
    }

    #[inline]
    pub fn drained(&self) -> bool {
        self.beg == self.cdx && self.cdn == self.end
    }

    #[inline]
    pub fn reset(&mut self) {
        self.beg = 0;
        self.cdx = 0;
        self.cdn = 0;
        self.end = 0;
    }

    /// Marks everything received so far as plaintext.
    #[inline]
    pub fn mark_plain(&mut self) {
        self.cdx = self.end;
        self.cdn = self.end;
    }

    /// Makes sure the tail can hold `needed` more bytes, compacting the
    /// ready region to offset 0 and moving the ciphertext tail in tandem.
    /// Returns the writable tail size.
    pub fn make_room(&mut self, needed: usize) -> usize {
        let bytes = self.cdx - self.beg;
        let mut nmax = self.buf.len() - self.end;
        if bytes + nmax / 2 < needed {
            if bytes > 0 {
                self.buf.copy_within(self.beg..self.cdx, 0);
            }
            self.cdx = bytes;
            self.beg = 0;
            if self.cdn < self.end {
                self.buf.copy_within(self.cdn..self.end, self.cdx);
            }
            self.end -= self.cdn - self.cdx;
            self.cdn = self.cdx;
            nmax = self.buf.len() - self.end;
        }
        nmax
    }
}

/// A fully framed message as it comes off the wire, before transaction
/// state resolution.
#[derive(Debug)]
pub(crate) struct Frame {
    pub hdr: Header,
    /// Extended header bytes beyond the core 64, verbatim (never
    /// byte-swapped).
    pub ext: Vec<u8>,
    /// Aux payload, truncated back to the unaligned size.
    pub aux: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RxState {
    Header1,
    Header2,
    AuxData1,
    AuxData2,
    Error,
}

/// Receive-side parser. One instance per connection, owned by the IO core
/// thread.
pub(crate) struct RxIoq {
    pub fifo: IoqBuf,
    state: RxState,
    pub error: Option<IoqError>,
    /// Rolling sequence checked against the low salt byte.
    pub seq: u32,
    rev: bool,
    hbytes: usize,
    abytes: usize,
    unaligned_aux: usize,
    aux: Vec<u8>,
    pending: Option<Frame>,
}

impl Default for RxIoq {
    fn default() -> Self {
        Self {
            fifo: IoqBuf::default(),
            state: RxState::Header1,
            error: None,
            seq: 0,
            rev: false,
            hbytes: 0,
            abytes: 0,
            unaligned_aux: 0,
            aux: Vec::new(),
            pending: None,
        }
    }
}

impl RxIoq {
    fn fail(&mut self, err: IoqError) -> IoqError {
        self.state = RxState::Error;
        self.error = Some(err);
        err
    }

    /// Latches an externally detected failure (e.g. a transaction protocol
    /// violation) so no further frames are parsed.
    pub fn latch(&mut self, err: IoqError) {
        if self.error.is_none() {
            let _ = self.fail(err);
        }
    }

    /// One nonblocking read into the FIFO tail followed by a decrypt pass.
    /// Returns false when the link hit a fatal condition.
    fn pull<R: Read>(
        &mut self,
        rd: &mut R,
        codec: &mut Option<Box<dyn StreamCodec>>,
        nmax: usize,
    ) -> Result<(), IoqError> {
        safe_assert!(nmax > 0);
        if nmax == 0 {
            return self.ingest(codec);
        }
        match rd.read(&mut self.fifo.buf[self.fifo.end..self.fifo.end + nmax]) {
            Ok(0) => return Err(self.fail(IoqError::Eof)),
            Ok(n) => self.fifo.end += n,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock ||
                    e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(?e, "ioq: socket read failed");
                return Err(self.fail(IoqError::Sock));
            }
        }
        self.ingest(codec)
    }

    /// Decrypts data received so far in place. Partial cipher blocks stay
    /// in the `[cdn, end)` tail.
    fn ingest(&mut self, codec: &mut Option<Box<dyn StreamCodec>>) -> Result<(), IoqError> {
        match codec {
            Some(c) => c.decrypt(&mut self.fifo).map_err(|e| self.fail(e)),
            None => {
                self.fifo.mark_plain();
                Ok(())
            }
        }
    }

    /// Advances the parser, producing at most one frame. `Ok(None)` means
    /// insufficient data: the caller should re-poll for readability.
    pub fn read_frame<R: Read>(
        &mut self,
        rd: &mut R,
        codec: &mut Option<Box<dyn StreamCodec>>,
        crc: Crc32Fn,
    ) -> Result<Option<Frame>, IoqError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        loop {
            match self.state {
                RxState::Header1 => {
                    // The core header is one alignment unit, so it never
                    // straddles the end of the buffer.
                    let nmax = self.fifo.make_room(HDR_SIZE);
                    if self.fifo.ready() < HDR_SIZE {
                        self.pull(rd, codec, nmax)?;
                        if self.fifo.ready() < HDR_SIZE {
                            return Ok(None);
                        }
                    }

                    let head = &self.fifo.buf[self.fifo.beg..self.fifo.beg + HDR_SIZE];
                    let magic = u16::from_ne_bytes([head[0], head[1]]);
                    self.rev = match magic {
                        HDR_MAGIC => false,
                        HDR_MAGIC_REV => true,
                        _ => {
                            debug!(magic, "ioq: bad magic");
                            return Err(self.fail(IoqError::Sync));
                        }
                    };

                    let mut cmd =
                        u32::from_ne_bytes([head[0x20], head[0x21], head[0x22], head[0x23]]);
                    let mut aux_size =
                        u32::from_ne_bytes([head[0x28], head[0x29], head[0x2A], head[0x2B]]);
                    if self.rev {
                        cmd = cmd.swap_bytes();
                        aux_size = aux_size.swap_bytes();
                    }
                    self.hbytes = hdr_bytes(cmd);
                    self.unaligned_aux = aux_size as usize;
                    self.abytes = align64(self.unaligned_aux);
                    if self.hbytes < HDR_SIZE || self.hbytes > HDR_MAX || self.abytes > AUX_MAX {
                        debug!(
                            hbytes = self.hbytes,
                            abytes = self.abytes,
                            "ioq: frame size out of range"
                        );
                        return Err(self.fail(IoqError::Field));
                    }

                    self.state = RxState::Header2;
                }

                RxState::Header2 => {
                    let nmax = self.fifo.make_room(self.hbytes);
                    if self.fifo.ready() < self.hbytes {
                        self.pull(rd, codec, nmax)?;
                        if self.fifo.ready() < self.hbytes {
                            return Ok(None);
                        }
                    }

                    // The CRC runs over the raw bytes before any endian
                    // fixup, with the crc field itself zeroed.
                    let beg = self.fifo.beg;
                    let head = &mut self.fifo.buf[beg..beg + self.hbytes];
                    let mut xcrc = u32::from_ne_bytes([
                        head[HDR_CRC_OFF],
                        head[HDR_CRC_OFF + 1],
                        head[HDR_CRC_OFF + 2],
                        head[HDR_CRC_OFF + 3],
                    ]);
                    let raw_crc_bytes =
                        [head[HDR_CRC_OFF], head[HDR_CRC_OFF + 1], head[HDR_CRC_OFF + 2], head[HDR_CRC_OFF + 3]];
                    if self.rev {
                        xcrc = xcrc.swap_bytes();
                    }
                    head[HDR_CRC_OFF..HDR_CRC_OFF + 4].fill(0);
                    let actual = crc(&head[..self.hbytes]);
                    head[HDR_CRC_OFF..HDR_CRC_OFF + 4].copy_from_slice(&raw_crc_bytes);
                    if actual != xcrc {
                        debug!(expect = xcrc, actual, "ioq: header crc mismatch");
                        return Err(self.fail(IoqError::HdrCrc));
                    }

                    let mut hdr = Header::decode(head);
                    if self.rev {
                        hdr.bswap();
                    }
                    let ext = head[HDR_SIZE..self.hbytes].to_vec();
                    self.fifo.beg += self.hbytes;

                    let frame = Frame { hdr, ext, aux: Vec::new() };
                    if self.abytes == 0 {
                        return self.finish(frame);
                    }
                    self.aux = Vec::with_capacity(self.abytes);
                    self.pending = Some(frame);
                    self.state = RxState::AuxData1;
                }

                RxState::AuxData1 => {
                    // Move whatever is already decrypted so the makeroom in
                    // the next state sees an empty ready region.
                    let take = self.fifo.ready().min(self.abytes - self.aux.len());
                    if take > 0 {
                        let beg = self.fifo.beg;
                        self.aux.extend_from_slice(&self.fifo.buf[beg..beg + take]);
                        self.fifo.beg += take;
                    }
                    self.state = RxState::AuxData2;
                }

                RxState::AuxData2 => {
                    if self.aux.len() < self.abytes {
                        let nmax = self.fifo.make_room(self.abytes - self.aux.len());
                        self.pull(rd, codec, nmax)?;
                        let take = self.fifo.ready().min(self.abytes - self.aux.len());
                        if take > 0 {
                            let beg = self.fifo.beg;
                            self.aux.extend_from_slice(&self.fifo.buf[beg..beg + take]);
                            self.fifo.beg += take;
                        }
                        if self.aux.len() < self.abytes {
                            return Ok(None);
                        }
                    }

                    // The aux crc covers the aligned size, not the actual
                    // payload size.
                    let mut frame = match self.pending.take() {
                        Some(f) => f,
                        None => return Err(self.fail(IoqError::Field)),
                    };
                    let actual = crc(&self.aux[..self.abytes]);
                    if actual != frame.hdr.aux_crc {
                        debug!(
                            expect = frame.hdr.aux_crc,
                            actual,
                            msgid = frame.hdr.msgid,
                            "ioq: aux crc mismatch"
                        );
                        return Err(self.fail(IoqError::AuxCrc));
                    }
                    frame.aux = std::mem::take(&mut self.aux);
                    frame.aux.truncate(self.unaligned_aux);
                    return self.finish(frame);
                }

                RxState::Error => {
                    return Err(self.error.unwrap_or(IoqError::Sock));
                }
            }
        }
    }

    /// Sequence check and parser reset after a complete frame.
    fn finish(&mut self, frame: Frame) -> Result<Option<Frame>, IoqError> {
        if (frame.hdr.salt & 0xFF) != (self.seq & 0xFF) {
            debug!(salt = frame.hdr.salt, seq = self.seq, "ioq: sequence mismatch");
            return Err(self.fail(IoqError::MsgSeq));
        }
        self.seq = self.seq.wrapping_add(1);
        self.state = RxState::Header1;
        self.pending = None;
        Ok(Some(frame))
    }
}

/// Transmit-side queue and staging FIFO, owned by the IO core thread. The
/// cross-thread handoff queue lives under the connection mutex; messages
/// land here once stamped with salt and CRCs.
pub(crate) struct TxIoq {
    pub fifo: IoqBuf,
    pub msgq: VecDeque<Msg>,
    pub error: Option<IoqError>,
    pub seq: u32,
    /// Header bytes of the head-of-queue message already consumed.
    pub hbytes: usize,
    /// Aux bytes of the head-of-queue message already consumed.
    pub abytes: usize,
}

impl Default for TxIoq {
    fn default() -> Self {
        Self {
            fifo: IoqBuf::default(),
            msgq: VecDeque::new(),
            error: None,
            seq: 0,
            hbytes: 0,
            abytes: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::{CmdFlags, LNK_ERROR, icrc32};

    /// Nonblocking reader over a canned byte stream, optionally dribbling
    /// a few bytes per call.
    struct Feed {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Feed {
        fn new(data: Vec<u8>) -> Self {
            let chunk = data.len().max(1);
            Self { data, pos: 0, chunk }
        }

        fn dribble(data: Vec<u8>, chunk: usize) -> Self {
            Self { data, pos: 0, chunk }
        }
    }

    impl Read for Feed {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.data.len() {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = buf.len().min(self.chunk).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    /// Encodes one wire frame the way the transmit path does.
    fn encode_frame(mut hdr: Header, aux: &[u8], seq: u32) -> Vec<u8> {
        hdr.magic = HDR_MAGIC;
        hdr.salt = (0x5EED_00 << 8) | (seq & 0xFF);
        hdr.aux_bytes = aux.len() as u32;
        let mut padded = aux.to_vec();
        padded.resize(align64(aux.len()), 0);
        if !padded.is_empty() {
            hdr.aux_crc = icrc32(&padded);
        }
        let hbytes = hdr.hdr_bytes();
        let mut wire = vec![0u8; hbytes];
        hdr.hdr_crc = 0;
        hdr.encode_into(&mut wire);
        let crc = icrc32(&wire);
        wire[HDR_CRC_OFF..HDR_CRC_OFF + 4].copy_from_slice(&crc.to_ne_bytes());
        wire.extend_from_slice(&padded);
        wire
    }

    fn read_all(ioq: &mut RxIoq, feed: &mut Feed) -> Result<Option<Frame>, IoqError> {
        let mut codec = None;
        loop {
            match ioq.read_frame(feed, &mut codec, icrc32) {
                Ok(None) if feed.pos < feed.data.len() => {}
                other => return other,
            }
        }
    }

    #[test]
    fn single_frame() {
        let hdr = Header { cmd: LNK_ERROR, msgid: 9, error: 3, ..Header::default() };
        let mut feed = Feed::new(encode_frame(hdr, b"hello aux", 0));
        let mut ioq = RxIoq::default();
        let frame = read_all(&mut ioq, &mut feed).unwrap().unwrap();
        assert_eq!(frame.hdr.msgid, 9);
        assert_eq!(frame.hdr.error, 3);
        assert_eq!(frame.aux, b"hello aux");
        assert!(ioq.fifo.drained());
    }

    #[test]
    fn dribbled_frame() {
        let hdr = Header { cmd: LNK_ERROR, msgid: 1, ..Header::default() };
        let mut feed = Feed::dribble(encode_frame(hdr, &[7u8; 100], 0), 3);
        let mut ioq = RxIoq::default();
        let frame = read_all(&mut ioq, &mut feed).unwrap().unwrap();
        assert_eq!(frame.aux, [7u8; 100]);
    }

    #[test]
    fn back_to_back_frames() {
        let mut data = encode_frame(Header { cmd: LNK_ERROR, msgid: 1, ..Header::default() }, &[], 0);
        data.extend(encode_frame(Header { cmd: LNK_ERROR, msgid: 2, ..Header::default() }, b"x", 1));
        let mut feed = Feed::new(data);
        let mut ioq = RxIoq::default();
        let first = read_all(&mut ioq, &mut feed).unwrap().unwrap();
        assert_eq!(first.hdr.msgid, 1);
        let second = read_all(&mut ioq, &mut feed).unwrap().unwrap();
        assert_eq!(second.hdr.msgid, 2);
        assert_eq!(second.aux, b"x");
    }

    #[test]
    fn byte_swapped_frame() {
        let hdr = Header {
            cmd: LNK_ERROR | CmdFlags::CREATE.bits(),
            msgid: 0x0102_0304_0506_0708,
            circuit: 0xAABB,
            ..Header::default()
        };
        let mut wire = encode_frame(hdr, b"swapped", 0);
        // Rewrite the core header as the opposite-endian peer would have.
        let mut sent = Header::decode(&wire[..HDR_SIZE]);
        sent.bswap();
        sent.encode_into(&mut wire[..HDR_SIZE]);

        let mut feed = Feed::new(wire);
        let mut ioq = RxIoq::default();
        let frame = read_all(&mut ioq, &mut feed).unwrap().unwrap();
        assert_eq!(frame.hdr.magic, HDR_MAGIC);
        assert_eq!(frame.hdr.msgid, 0x0102_0304_0506_0708);
        assert_eq!(frame.aux, b"swapped");
    }

    #[test]
    fn bad_magic() {
        let mut wire = encode_frame(Header { cmd: LNK_ERROR, ..Header::default() }, &[], 0);
        wire[0] ^= 0xFF;
        let mut ioq = RxIoq::default();
        assert_eq!(read_all(&mut ioq, &mut Feed::new(wire)).unwrap_err(), IoqError::Sync);
    }

    #[test]
    fn header_size_out_of_range() {
        // 17 units exceeds HDR_MAX; the size field is validated before any
        // allocation happens.
        let mut hdr =
            Header { cmd: (HDR_MAX / crate::wire::ALIGN) as u32 + 1, ..Header::default() };
        hdr.magic = HDR_MAGIC;
        let mut wire = vec![0u8; HDR_SIZE];
        hdr.encode_into(&mut wire);
        let mut ioq = RxIoq::default();
        assert_eq!(read_all(&mut ioq, &mut Feed::new(wire)).unwrap_err(), IoqError::Field);
    }

    #[test]
    fn aux_size_out_of_range() {
        let mut hdr = Header { cmd: LNK_ERROR, aux_bytes: AUX_MAX as u32 + 1, ..Header::default() };
        hdr.magic = HDR_MAGIC;
        let mut wire = vec![0u8; HDR_SIZE];
        hdr.encode_into(&mut wire);
        let mut ioq = RxIoq::default();
        assert_eq!(read_all(&mut ioq, &mut Feed::new(wire)).unwrap_err(), IoqError::Field);
    }

    #[test]
    fn corrupt_header_crc() {
        let mut wire = encode_frame(Header { cmd: LNK_ERROR, ..Header::default() }, &[], 0);
        wire[HDR_CRC_OFF] ^= 0x01;
        let mut ioq = RxIoq::default();
        assert_eq!(read_all(&mut ioq, &mut Feed::new(wire)).unwrap_err(), IoqError::HdrCrc);
    }

    #[test]
    fn corrupt_aux_crc() {
        let mut wire = encode_frame(Header { cmd: LNK_ERROR, ..Header::default() }, b"payload", 0);
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        let mut ioq = RxIoq::default();
        assert_eq!(read_all(&mut ioq, &mut Feed::new(wire)).unwrap_err(), IoqError::AuxCrc);
    }

    #[test]
    fn sequence_mismatch() {
        let mut data = encode_frame(Header { cmd: LNK_ERROR, msgid: 1, ..Header::default() }, &[], 0);
        // Second frame stamped with seq 7 instead of 1.
        data.extend(encode_frame(Header { cmd: LNK_ERROR, msgid: 2, ..Header::default() }, &[], 7));
        let mut feed = Feed::new(data);
        let mut ioq = RxIoq::default();
        assert!(read_all(&mut ioq, &mut feed).unwrap().is_some());
        assert_eq!(read_all(&mut ioq, &mut feed).unwrap_err(), IoqError::MsgSeq);
        // The error is latched.
        let mut codec = None;
        assert_eq!(ioq.read_frame(&mut feed, &mut codec, icrc32).unwrap_err(), IoqError::MsgSeq);
    }

    #[test]
    fn make_room_compacts() {
        let mut fifo = IoqBuf::default();
        // Simulate a consumed frame leaving the ready region deep in the
        // buffer.
        fifo.beg = IOQ_BUF_SIZE - 128;
        fifo.cdx = IOQ_BUF_SIZE - 64;
        fifo.cdn = IOQ_BUF_SIZE - 64;
        fifo.end = IOQ_BUF_SIZE - 64;
        fifo.buf[IOQ_BUF_SIZE - 128..IOQ_BUF_SIZE - 64].fill(0xAB);
        let nmax = fifo.make_room(4096);
        assert_eq!(fifo.beg, 0);
        assert_eq!(fifo.cdx, 64);
        assert_eq!(fifo.end, 64);
        assert!(nmax >= 4096);
        assert!(fifo.buf[..64].iter().all(|&b| b == 0xAB));
    }
}
