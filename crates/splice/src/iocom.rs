use std::{
    io::{self, IoSlice, Write},
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use bitflags::bitflags;
use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use rand::Rng;
use splice_utils::{safe_assert, safe_assert_eq, safe_panic};
use tracing::{debug, trace, warn};

use crate::{
    crypto::{LinkCrypto, StreamCodec},
    error::IoqError,
    ioq::{IOQ_BUF_SIZE, MAX_IOVEC, RxIoq, TxIoq},
    msg::Msg,
    relay,
    state::{Core, ROOT_ID, RelayPeer, StateFlags, StateId},
    wire::{self, ALIGN, CmdFlags, Crc32Fn, HDR_CRC_OFF, HDR_SIZE, LNK_ERROR, align64},
};

const WAKEUP: Token = Token(0);
const SOCKET: Token = Token(1);
const ALT: Token = Token(2);

bitflags! {
    /// Connection flags. The WORK/REQ bits are only ever flipped with the
    /// IO core awake or about to be woken; EOF and CRYPTED are sticky.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IocomFlags: u32 {
        /// Poll the socket for readability.
        const RREQ = 0x0000_0001;
        /// Poll the socket for writability.
        const WREQ = 0x0000_0002;
        /// Receive processing pending.
        const RWORK = 0x0000_0004;
        /// Transmit flush pending.
        const WWORK = 0x0000_0008;
        /// Self-pipe needs draining.
        const PWORK = 0x0000_0010;
        /// Signal callback armed.
        const SWORK = 0x0000_0020;
        /// Alt descriptor readable.
        const ARWORK = 0x0000_0040;
        /// Terminal; the core loop exits at the next iteration.
        const EOF = 0x0000_0080;
        /// Stream codecs are active on both directions.
        const CRYPTED = 0x0000_0100;
    }
}

const ANY_WORK: IocomFlags = IocomFlags::RWORK
    .union(IocomFlags::WWORK)
    .union(IocomFlags::PWORK)
    .union(IocomFlags::SWORK)
    .union(IocomFlags::ARWORK);

/// State shared between the IO core thread and writer threads. Everything
/// mutable sits behind the mutex except the flag word and the wakeup pipe.
pub(crate) struct Shared {
    pub flags: AtomicU32,
    wake_tx: Option<OwnedFd>,
    pub core: Mutex<Core>,
    pub label: String,
    pub crc: Crc32Fn,
}

impl Shared {
    #[inline]
    pub fn set_flags(&self, f: IocomFlags) {
        self.flags.fetch_or(f.bits(), Ordering::SeqCst);
    }

    #[inline]
    pub fn clear_flags(&self, f: IocomFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::SeqCst);
    }

    #[inline]
    pub fn test_flags(&self, f: IocomFlags) -> bool {
        self.flags.load(Ordering::SeqCst) & f.bits() != 0
    }

    pub fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One byte down the self-pipe; the IO core drains it and rechecks
    /// both queues.
    pub fn wake(&self) {
        if let Some(fd) = &self.wake_tx {
            let b = [0u8; 1];
            unsafe {
                libc::write(fd.as_raw_fd(), b.as_ptr().cast(), 1);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            flags: AtomicU32::new(0),
            wake_tx: None,
            core: Mutex::new(Core::new()),
            label: "test".to_string(),
            crc: wire::icrc32,
        }
    }
}

/// Releases relay references that were queued while a connection mutex was
/// held. Each drop may cascade one hop to the paired connection.
pub(crate) fn settle_relay_drops(shared: &Arc<Shared>) {
    let mut work: Vec<RelayPeer> = {
        let mut core = shared.lock();
        if core.relay_drops.is_empty() {
            return;
        }
        core.relay_drops.drain(..).collect()
    };
    while let Some(peer) = work.pop() {
        let mut core = peer.handle.shared.lock();
        core.drop_ref(peer.id);
        work.extend(core.relay_drops.drain(..));
    }
}

/// Snapshot of connection bookkeeping, taken under the mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IocomStats {
    /// Open transactions we initiated.
    pub statewr: usize,
    /// Open transactions the peer initiated.
    pub staterd: usize,
    /// Live dynamic states, including closed ones pending release.
    pub live_states: usize,
    pub state0_refs: u32,
    pub state0_children: usize,
}

/// User-side callbacks, all invoked on the IO core thread.
pub trait IocomHandler {
    /// One callback per received or synthesized transactional message,
    /// including the final non-transactional link-error sentinel.
    fn recv_msg(&mut self, link: &IocomHandle, msg: &mut Msg);

    /// Unsolicited non-transactional traffic riding the root state.
    fn user_msg(&mut self, _link: &IocomHandle, _msg: &mut Msg, _unmanaged: bool) {}

    /// Armed at startup and via [`IocomHandle::signal`].
    fn signal(&mut self, _link: &IocomHandle) {}

    /// The alt descriptor polled readable.
    fn alt_ready(&mut self, _link: &IocomHandle) {}
}

/// Cloneable cross-thread handle: message allocation, writes and
/// transaction shortcuts. The heavy lifting stays on the IO core.
#[derive(Clone)]
pub struct IocomHandle {
    pub(crate) shared: Arc<Shared>,
}

impl IocomHandle {
    /// Sentinel parent for top-level transactions and one-off messages.
    #[inline]
    pub fn state0(&self) -> StateId {
        ROOT_ID
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Allocates a message. With CREATE set (and REPLY clear) this opens a
    /// new transaction under `state`; otherwise the message rides the
    /// existing transaction. `None` when the state raced a teardown.
    pub fn msg_alloc(&self, state: StateId, aux: Option<Vec<u8>>, cmd: u32) -> Option<Msg> {
        self.shared.lock().msg_alloc(state, aux, cmd)
    }

    /// Commits a message for transmission. May be called from any thread;
    /// the IO core is woken through the self-pipe. Messages to transactions
    /// that already closed or are dying are dropped (the latter synthesizes
    /// the failure on the subtree).
    pub fn msg_write(&self, msg: Msg) {
        {
            let mut core = self.shared.lock();
            core.msg_write(&self.shared, msg);
        }
        settle_relay_drops(&self.shared);
    }

    /// Returns an unused message, releasing its state reference.
    pub fn msg_free(&self, msg: Msg) {
        {
            let mut core = self.shared.lock();
            core.free_msg(msg);
        }
        settle_relay_drops(&self.shared);
    }

    /// Replies to `msg` with a bare status code and closes our direction.
    /// Replying to a one-way message flips the REPLY bit instead.
    pub fn msg_reply(&self, msg: &Msg, error: u32) {
        self.reply_common(msg.state(), Some(msg.cmd()), error, true);
    }

    /// Streaming variant of [`IocomHandle::msg_reply`]: sends the status
    /// but leaves the transaction open.
    pub fn msg_result(&self, msg: &Msg, error: u32) {
        self.reply_common(msg.state(), Some(msg.cmd()), error, false);
    }

    /// Terminates a transaction by state, issuing a DELETE. No-op if our
    /// direction already closed.
    pub fn state_reply(&self, state: StateId, error: u32) {
        self.reply_common(state, None, error, true);
    }

    /// Intermediate acknowledgement by state; the transaction stays open.
    pub fn state_result(&self, state: StateId, error: u32) {
        self.reply_common(state, None, error, false);
    }

    fn reply_common(&self, sid: StateId, one_way_cmd: Option<u32>, error: u32, terminate: bool) {
        {
            let mut core = self.shared.lock();
            let Some(st) = core.states.get(sid) else { return };

            let mut cmd = LNK_ERROR;
            let root = st.is(StateFlags::ROOT);
            let txcmd = st.txcmd;
            if root {
                // Reply to a one-way message: just flip the direction bit.
                if let Some(orig) = one_way_cmd {
                    if !wire::has(orig, CmdFlags::REPLY) {
                        cmd |= CmdFlags::REPLY.bits();
                    }
                }
            } else {
                if wire::has(txcmd, CmdFlags::DELETE) {
                    return;
                }
                if wire::has(txcmd, CmdFlags::REPLY) {
                    cmd |= CmdFlags::REPLY.bits();
                }
                if terminate {
                    cmd |= CmdFlags::DELETE.bits();
                }
            }

            let Some(mut nmsg) = core.msg_alloc(sid, None, cmd) else { return };
            if !root && !wire::has(txcmd, CmdFlags::CREATE) {
                nmsg.hdr.cmd |= CmdFlags::CREATE.bits();
            }
            nmsg.hdr.error = error;
            core.msg_write(&self.shared, nmsg);
        }
        settle_relay_drops(&self.shared);
    }

    /// Pairs two open circuit states across connections. Messages creating
    /// sub-transactions under either side are mirrored onto the other and
    /// auto-forwarded from then on. Each edge holds one reference on the
    /// state it points at.
    pub fn set_relay(&self, local: StateId, peer: &IocomHandle, peer_state: StateId) -> bool {
        {
            let mut pc = peer.shared.lock();
            if pc.states.get(peer_state).is_none() {
                return false;
            }
            pc.hold(peer_state);
        }
        {
            let mut lc = self.shared.lock();
            let Some(st) = lc.states.get_mut(local) else {
                let mut pc = peer.shared.lock();
                pc.drop_ref(peer_state);
                return false;
            };
            st.relay = Some(RelayPeer { handle: peer.clone(), id: peer_state });
            lc.hold(local);
        }
        {
            let mut pc = peer.shared.lock();
            if let Some(st) = pc.states.get_mut(peer_state) {
                st.relay = Some(RelayPeer { handle: self.clone(), id: local });
            }
        }
        true
    }

    /// Re-arms the signal callback for the next loop iteration.
    pub fn signal(&self) {
        self.shared.set_flags(IocomFlags::SWORK);
        self.shared.wake();
    }

    /// Marks the connection terminal; the IO core exits at its next
    /// iteration without a failure cascade.
    pub fn shutdown(&self) {
        self.shared.set_flags(IocomFlags::EOF);
        self.shared.wake();
    }

    /// Attaches an opaque cookie to a transaction.
    pub fn set_udata(&self, state: StateId, udata: u64) {
        if let Some(st) = self.shared.lock().states.get_mut(state) {
            st.udata = udata;
        }
    }

    pub fn udata(&self, state: StateId) -> Option<u64> {
        self.shared.lock().states.get(state).map(|st| st.udata)
    }

    pub fn stats(&self) -> IocomStats {
        let core = self.shared.lock();
        let root = core.states.get(ROOT_ID);
        IocomStats {
            statewr: core.states.statewr.len(),
            staterd: core.states.staterd.len(),
            live_states: core.states.live,
            state0_refs: root.map_or(0, |s| s.refs),
            state0_children: root.map_or(0, |s| s.subq.len()),
        }
    }
}

/// Connection builder. The defaults are a plaintext link, the built-in
/// CRC-32C and a label derived from the peer address.
pub struct IocomBuilder {
    label: Option<String>,
    crc: Crc32Fn,
    crypto: Option<Box<dyn LinkCrypto>>,
    alt_fd: Option<OwnedFd>,
    socket_buf_size: Option<usize>,
}

impl Default for IocomBuilder {
    fn default() -> Self {
        Self { label: None, crc: wire::icrc32, crypto: None, alt_fd: None, socket_buf_size: None }
    }
}

impl IocomBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label<S: Into<String>>(mut self, label: S) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Overrides the CRC used for header and aux checksums. Both peers
    /// have to agree on the polynomial.
    pub fn crc32(mut self, crc: Crc32Fn) -> Self {
        self.crc = crc;
        self
    }

    /// Negotiates session crypto synchronously during [`IocomBuilder::build`].
    pub fn crypto(mut self, crypto: Box<dyn LinkCrypto>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    /// Alternative bulk-I/O descriptor: polled for readability, surfaced
    /// through [`IocomHandler::alt_ready`].
    pub fn alt_fd(mut self, fd: OwnedFd) -> Self {
        self.alt_fd = Some(fd);
        self
    }

    /// Sets kernel SO_SNDBUF and SO_RCVBUF on the socket.
    pub fn socket_buf_size(mut self, size: usize) -> Self {
        self.socket_buf_size = Some(size);
        self
    }

    pub fn build(self, sock: std::net::TcpStream) -> io::Result<Iocom> {
        sock.set_nodelay(true)?;
        if let Some(size) = self.socket_buf_size {
            set_socket_buf_size(&sock, size);
        }

        // Session crypto runs blocking on the fresh socket; everything
        // after the handshake flows through the codecs.
        let mut sock = sock;
        let mut crypted = false;
        let (rx_codec, tx_codec) = match self.crypto {
            Some(mut crypto) => {
                let (rx, tx) = crypto.negotiate(&mut sock)?;
                crypted = true;
                (Some(rx), Some(tx))
            }
            None => (None, None),
        };

        let label = self.label.unwrap_or_else(|| match sock.peer_addr() {
            Ok(addr) => format!("iocom-{addr}"),
            Err(_) => "iocom".to_string(),
        });

        sock.set_nonblocking(true)?;
        let mut sock = mio::net::TcpStream::from_std(sock);

        let (wake_rx, wake_tx) = wake_pipe()?;

        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&wake_rx.as_raw_fd()),
            WAKEUP,
            Interest::READABLE,
        )?;
        poll.registry().register(&mut sock, SOCKET, Interest::READABLE)?;
        if let Some(alt) = &self.alt_fd {
            poll.registry().register(&mut SourceFd(&alt.as_raw_fd()), ALT, Interest::READABLE)?;
        }

        let mut flags = IocomFlags::RREQ | IocomFlags::SWORK;
        if crypted {
            flags |= IocomFlags::CRYPTED;
        }

        let shared = Arc::new(Shared {
            flags: AtomicU32::new(flags.bits()),
            wake_tx: Some(wake_tx),
            core: Mutex::new(Core::new()),
            label,
            crc: self.crc,
        });

        Ok(Iocom {
            shared,
            sock,
            poll,
            events: Events::with_capacity(8),
            wake_rx,
            alt: self.alt_fd,
            rx: RxIoq::default(),
            tx: TxIoq::default(),
            rx_codec,
            tx_codec,
            sock_interest: Some(Interest::READABLE),
        })
    }
}

/// One connection: socket, framing queues, transaction forest and the poll
/// loop driving them. Owned by the IO core thread; cross-thread access
/// goes through [`IocomHandle`].
pub struct Iocom {
    shared: Arc<Shared>,
    sock: mio::net::TcpStream,
    poll: Poll,
    events: Events,
    wake_rx: OwnedFd,
    alt: Option<OwnedFd>,
    rx: RxIoq,
    tx: TxIoq,
    rx_codec: Option<Box<dyn StreamCodec>>,
    tx_codec: Option<Box<dyn StreamCodec>>,
    sock_interest: Option<Interest>,
}

impl Iocom {
    pub fn handle(&self) -> IocomHandle {
        IocomHandle { shared: Arc::clone(&self.shared) }
    }

    /// The alternative bulk-I/O descriptor, if one was attached.
    pub fn alt_raw_fd(&self) -> Option<std::os::fd::RawFd> {
        self.alt.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// IO core loop. Interleaves reads, writes, callbacks and cross-thread
    /// wakeups until the connection turns terminal.
    pub fn run<H: IocomHandler>(&mut self, handler: &mut H) {
        while !self.shared.test_flags(IocomFlags::EOF) {
            self.step(handler);
        }
        debug!(label = %self.shared.label, "iocom: core loop done");
    }

    fn step<H: IocomHandler>(&mut self, handler: &mut H) {
        let handle = self.handle();

        if !self.shared.test_flags(ANY_WORK) {
            // Only poll when no immediate work is pending; the timeout is a
            // liveness safety net.
            self.update_interest();
            if let Err(e) = self.poll.poll(&mut self.events, Some(Duration::from_secs(5))) {
                if e.kind() != io::ErrorKind::Interrupted {
                    safe_panic!(link: self.shared.label, "iocom: poll failed: {e}");
                    self.shared.set_flags(IocomFlags::EOF);
                }
                return;
            }
            for ev in self.events.iter() {
                match ev.token() {
                    WAKEUP => {
                        if ev.is_readable() {
                            self.shared.set_flags(IocomFlags::PWORK);
                        }
                    }
                    SOCKET => {
                        if ev.is_readable() {
                            self.shared.set_flags(IocomFlags::RWORK);
                        }
                        if ev.is_writable() {
                            self.shared.set_flags(IocomFlags::WWORK);
                        }
                    }
                    ALT => {
                        if ev.is_readable() {
                            self.shared.set_flags(IocomFlags::ARWORK);
                        }
                    }
                    _ => safe_panic!(link: self.shared.label, "iocom: event for unknown token"),
                }
            }
        } else {
            // Always recheck the pipe while work is pending.
            self.shared.set_flags(IocomFlags::PWORK);
        }

        if self.shared.test_flags(IocomFlags::SWORK) {
            self.shared.clear_flags(IocomFlags::SWORK);
            handler.signal(&handle);
        }

        if self.shared.test_flags(IocomFlags::PWORK) {
            self.shared.clear_flags(IocomFlags::PWORK);
            let mut scratch = [0u8; 256];
            unsafe {
                libc::read(self.wake_rx.as_raw_fd(), scratch.as_mut_ptr().cast(), scratch.len());
            }
            self.shared.set_flags(IocomFlags::RWORK | IocomFlags::WWORK);
        }

        if self.shared.test_flags(IocomFlags::WWORK) {
            self.flush1();
        }

        // Read sequencing runs after write sequencing so a transmit-side
        // auto-DELETE is visible to the receive side.
        if self.shared.test_flags(IocomFlags::RWORK) {
            while !self.shared.test_flags(IocomFlags::EOF) {
                let Some(msg) = self.ioq_read() else { break };
                self.deliver(handler, msg);
            }
        }

        if self.shared.test_flags(IocomFlags::ARWORK) {
            self.shared.clear_flags(IocomFlags::ARWORK);
            handler.alt_ready(&handle);
        }

        settle_relay_drops(&self.shared);
    }

    fn update_interest(&mut self) {
        let mut want = None;
        if self.shared.test_flags(IocomFlags::RREQ) {
            want = Some(Interest::READABLE);
        }
        if self.shared.test_flags(IocomFlags::WREQ) {
            want = Some(match want {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        if want == self.sock_interest {
            return;
        }
        let registry = self.poll.registry();
        let res = match (self.sock_interest, want) {
            (None, Some(i)) => registry.register(&mut self.sock, SOCKET, i),
            (Some(_), Some(i)) => registry.reregister(&mut self.sock, SOCKET, i),
            (Some(_), None) => registry.deregister(&mut self.sock),
            (None, None) => Ok(()),
        };
        if let Err(e) = res {
            debug!(?e, "iocom: socket interest update failed");
        }
        self.sock_interest = want;
    }

    /// Produces at most one received message. Pre-processed messages
    /// (synthesized failures, the final link-error sentinel) drain first;
    /// popping a root-parented message marks the connection terminal.
    fn ioq_read(&mut self) -> Option<Msg> {
        loop {
            {
                let mut core = self.shared.lock();
                if let Some(msg) = core.rxmsgq.pop_front() {
                    drop(core);
                    if msg.state() == ROOT_ID {
                        debug!(label = %self.shared.label, "iocom: EOF on connection");
                        self.shared.set_flags(IocomFlags::EOF);
                    }
                    return Some(msg);
                }
            }
            self.shared.clear_flags(IocomFlags::RREQ | IocomFlags::RWORK);

            if self.rx.error.is_some() {
                // Latched: the cascade already ran. The final sentinel gets
                // queued once the last transaction fully closes.
                return None;
            }

            let crc = self.shared.crc;
            match self.rx.read_frame(&mut self.sock, &mut self.rx_codec, crc) {
                Ok(Some(frame)) => {
                    // Trivially reset the FIFO when it drained, otherwise
                    // bypass the poll and keep parsing.
                    if self.rx.fifo.drained() {
                        self.rx.fifo.reset();
                        self.shared.set_flags(IocomFlags::RREQ);
                    } else {
                        self.shared.set_flags(IocomFlags::RWORK);
                    }

                    let mut core = self.shared.lock();
                    core.hold(ROOT_ID);
                    let aux = if frame.aux.is_empty() { None } else { Some(frame.aux) };
                    let mut msg = Msg::new(ROOT_ID, frame.hdr, frame.ext, aux);
                    match core.state_msgrx(&mut msg, false) {
                        Ok(()) => {
                            drop(core);
                            return Some(msg);
                        }
                        Err(IoqError::Already) => {
                            // Abort-after-closure race: throw the message
                            // away and read another.
                            core.free_msg(msg);
                        }
                        Err(err) => {
                            core.free_msg(msg);
                            drop(core);
                            self.rx_error(err);
                        }
                    }
                }
                Ok(None) => {
                    self.shared.set_flags(IocomFlags::RREQ);
                    return None;
                }
                Err(err) => self.rx_error(err),
            }
        }
    }

    /// Latches a receive failure: no more reads, kill pending transmits,
    /// terminate every open transaction and arrange the final sentinel.
    fn rx_error(&mut self, err: IoqError) {
        warn!(label = %self.shared.label, %err, "iocom: receive failure");
        self.rx.latch(err);
        self.drain_tx();
        {
            let mut core = self.shared.lock();
            core.fail_rx(&self.shared, err);
        }
        settle_relay_drops(&self.shared);
    }

    fn deliver<H: IocomHandler>(&mut self, handler: &mut H, mut msg: Msg) {
        let handle = self.handle();
        let relay_routed = {
            let core = self.shared.lock();
            core.states.get(msg.state()).is_some_and(|s| s.is(StateFlags::RELAY))
        };
        if relay_routed {
            relay::relay_msg(&handle, &mut msg);
        } else if msg.state() == ROOT_ID && !msg.stated {
            handler.user_msg(&handle, &mut msg, true);
        } else {
            handler.recv_msg(&handle, &mut msg);
        }
        {
            let mut core = self.shared.lock();
            core.cleanup_rx(&self.shared, msg);
        }
        settle_relay_drops(&self.shared);
    }

    /// Drains the cross-thread queue, stamps salt, sequence and CRCs with
    /// the mutex released, then pushes bytes.
    fn flush1(&mut self) {
        self.shared.clear_flags(IocomFlags::WREQ | IocomFlags::WWORK);
        let pending: Vec<Msg> = {
            let mut core = self.shared.lock();
            core.txmsgq.drain(..).collect()
        };

        let mut rng = rand::rng();
        for mut msg in pending {
            if self.tx.error.is_some() {
                let mut core = self.shared.lock();
                core.free_msg(msg);
                continue;
            }

            msg.hdr.magic = wire::HDR_MAGIC;
            msg.hdr.salt = (rng.random::<u32>() << 8) | (self.tx.seq & 0xFF);
            self.tx.seq = self.tx.seq.wrapping_add(1);

            // Zero-pad the aux payload to alignment and checksum it unless
            // the caller pre-computed the crc.
            if let Some(aux) = msg.aux.as_mut() {
                let unaligned = aux.len();
                msg.hdr.aux_bytes = unaligned as u32;
                aux.resize(align64(unaligned), 0);
                if msg.hdr.aux_crc == 0 && !aux.is_empty() {
                    msg.hdr.aux_crc = (self.shared.crc)(aux);
                }
            } else {
                msg.hdr.aux_bytes = 0;
            }

            let hbytes = msg.hdr.hdr_bytes();
            safe_assert_eq!(link: self.shared.label, hbytes, HDR_SIZE + msg.ext.len());
            let mut staged = vec![0u8; hbytes];
            msg.hdr.hdr_crc = 0;
            msg.hdr.encode_into(&mut staged);
            let n = msg.ext.len().min(hbytes - HDR_SIZE);
            staged[HDR_SIZE..HDR_SIZE + n].copy_from_slice(&msg.ext[..n]);
            let crc = (self.shared.crc)(&staged);
            msg.hdr.hdr_crc = crc;
            staged[HDR_CRC_OFF..HDR_CRC_OFF + 4].copy_from_slice(&crc.to_ne_bytes());
            msg.wire = staged;

            self.tx.msgq.push_back(msg);
        }

        self.flush2();
    }

    /// Gathers up to [`MAX_IOVEC`] slices across queued messages and
    /// issues one vectored write, resuming partially written messages via
    /// the `(hbytes, abytes)` progress cursors. With crypto active the
    /// plaintext is staged into the FIFO first and the ciphertext written
    /// from there.
    fn flush2(&mut self) {
        if self.tx.error.is_some() {
            self.drain_tx();
            return;
        }

        let mut iov: Vec<IoSlice<'_>> = Vec::with_capacity(MAX_IOVEC);
        {
            let mut hoff = self.tx.hbytes;
            let mut aoff = self.tx.abytes;
            for msg in &self.tx.msgq {
                let hbytes = msg.wire.len();
                let abytes = msg.aux.as_ref().map_or(0, Vec::len);
                safe_assert!(link: self.shared.label, hoff <= hbytes && aoff <= abytes);

                if hoff < hbytes {
                    let maxlen = (hbytes - hoff).min(IOQ_BUF_SIZE / 2);
                    iov.push(IoSlice::new(&msg.wire[hoff..hoff + maxlen]));
                    if iov.len() == MAX_IOVEC || maxlen != hbytes - hoff {
                        break;
                    }
                }
                if aoff < abytes {
                    let maxlen = (abytes - aoff).min(IOQ_BUF_SIZE / 2);
                    let aux = msg.aux.as_ref().map_or(&[][..], Vec::as_slice);
                    iov.push(IoSlice::new(&aux[aoff..aoff + maxlen]));
                    if iov.len() == MAX_IOVEC || maxlen != abytes - aoff {
                        break;
                    }
                }
                hoff = 0;
                aoff = 0;
            }
        }

        if iov.is_empty() && self.tx.fifo.beg == self.tx.fifo.cdx {
            return;
        }

        let written: io::Result<usize>;
        let mut nact: usize;
        let mut attempted = true;
        if let Some(codec) = &mut self.tx_codec {
            // Staging: (nact) is plaintext consumed into the FIFO, the
            // write drains whatever ciphertext is ready. The two advance
            // independently.
            let fifo = &mut self.tx.fifo;
            if fifo.beg > fifo.buf.len() / 2 && fifo.buf.len() - fifo.end < ALIGN * 2 {
                fifo.buf.copy_within(fifo.beg..fifo.end, 0);
                fifo.cdx -= fifo.beg;
                fifo.cdn -= fifo.beg;
                fifo.end -= fifo.beg;
                fifo.beg = 0;
            }
            nact = codec.encrypt(fifo, &iov);
            drop(iov);
            attempted = self.tx.fifo.cdx > self.tx.fifo.beg;
            written = if attempted {
                self.sock.write(&self.tx.fifo.buf[self.tx.fifo.beg..self.tx.fifo.cdx])
            } else {
                Ok(0)
            };
            if let Ok(n) = written {
                self.tx.fifo.beg += n;
                if self.tx.fifo.beg == self.tx.fifo.end {
                    self.tx.fifo.reset();
                }
            }
        } else {
            written = self.sock.write_vectored(&iov);
            drop(iov);
            nact = match &written {
                Ok(n) => *n,
                Err(_) => 0,
            };
        }

        // Retire fully sent messages, remember progress into the head of
        // the queue.
        let mut finished: Vec<Msg> = Vec::new();
        while let Some(front) = self.tx.msgq.front() {
            let hbytes = front.wire.len();
            let abytes = front.aux.as_ref().map_or(0, Vec::len);

            if nact < hbytes - self.tx.hbytes {
                self.tx.hbytes += nact;
                nact = 0;
                break;
            }
            nact -= hbytes - self.tx.hbytes;
            self.tx.hbytes = hbytes;
            if nact < abytes - self.tx.abytes {
                self.tx.abytes += nact;
                nact = 0;
                break;
            }
            nact -= abytes - self.tx.abytes;

            if let Some(msg) = self.tx.msgq.pop_front() {
                trace!(
                    cmd = format_args!("{:08x}", msg.hdr.cmd),
                    circuit = msg.hdr.circuit,
                    "txmsg complete"
                );
                finished.push(msg);
            }
            self.tx.hbytes = 0;
            self.tx.abytes = 0;
        }
        safe_assert_eq!(link: self.shared.label, nact, 0);
        if !finished.is_empty() {
            let mut core = self.shared.lock();
            for msg in finished {
                core.free_msg(msg);
            }
        }

        match written {
            Ok(0) if attempted => {
                warn!(label = %self.shared.label, "iocom: stream refused the write");
                self.tx.error = Some(IoqError::Sock);
                self.drain_tx();
            }
            Ok(_) => {
                let more_queued = { !self.shared.lock().txmsgq.is_empty() };
                if !self.tx.msgq.is_empty() ||
                    more_queued ||
                    self.tx.fifo.beg != self.tx.fifo.cdx
                {
                    self.shared.set_flags(IocomFlags::WWORK);
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock ||
                    e.kind() == io::ErrorKind::Interrupted =>
            {
                // Wait for socket buffer space before pushing more.
                self.shared.set_flags(IocomFlags::WREQ);
            }
            Err(e) => {
                warn!(label = %self.shared.label, ?e, "iocom: fatal write error");
                self.tx.error = Some(IoqError::Sock);
                self.drain_tx();
            }
        }
    }

    /// Kills pending transmits and stops asking for write events. Receive
    /// messages are left alone so the terminal sentinel still comes
    /// through.
    fn drain_tx(&mut self) {
        self.shared.clear_flags(IocomFlags::WREQ | IocomFlags::WWORK);
        self.tx.hbytes = 0;
        self.tx.abytes = 0;
        if !self.tx.msgq.is_empty() {
            let mut core = self.shared.lock();
            while let Some(msg) = self.tx.msgq.pop_front() {
                core.free_msg(msg);
            }
        }
    }
}

/// Nonblocking self-pipe for cross-thread wakeup: (read end, write end).
fn wake_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Set kernel SO_SNDBUF and SO_RCVBUF on a socket.
fn set_socket_buf_size<F: AsRawFd>(sock: &F, size: usize) {
    let fd = sock.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            (&raw const size).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            (&raw const size).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
