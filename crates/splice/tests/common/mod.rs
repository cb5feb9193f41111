//! Shared harness: paired connections driven from std threads, with every
//! delivered message mirrored into a channel for assertions.
#![allow(dead_code)]

use std::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use splice::{
    Iocom, IocomBuilder, IocomHandle, IocomHandler, IocomStats, Msg, StateId,
    wire::{HDR_CRC_OFF, HDR_SIZE, Header, align64, icrc32},
};

/// Snapshot of one delivered message.
#[derive(Debug, Clone)]
pub struct Event {
    pub tcmd: u32,
    pub cmd: u32,
    pub msgid: u64,
    pub circuit: u64,
    pub error: u32,
    pub state: StateId,
    pub root: bool,
    pub user: bool,
    pub aux: Option<Vec<u8>>,
}

impl Event {
    fn snapshot(link: &IocomHandle, msg: &Msg, user: bool) -> Self {
        Self {
            tcmd: msg.tcmd,
            cmd: msg.cmd(),
            msgid: msg.hdr.msgid,
            circuit: msg.hdr.circuit,
            error: msg.hdr.error,
            state: msg.state(),
            root: msg.state() == link.state0(),
            user,
            aux: msg.aux.clone(),
        }
    }
}

pub type Action = Box<dyn FnMut(&IocomHandle, &mut Msg) + Send>;

struct Recorder {
    events: mpsc::Sender<Event>,
    action: Action,
}

impl IocomHandler for Recorder {
    fn recv_msg(&mut self, link: &IocomHandle, msg: &mut Msg) {
        let _ = self.events.send(Event::snapshot(link, msg, false));
        (self.action)(link, msg);
    }

    fn user_msg(&mut self, link: &IocomHandle, msg: &mut Msg, _unmanaged: bool) {
        let _ = self.events.send(Event::snapshot(link, msg, true));
    }
}

pub struct Peer {
    pub handle: IocomHandle,
    pub events: mpsc::Receiver<Event>,
    join: thread::JoinHandle<()>,
}

impl Peer {
    /// Next delivered message, or a panic after the timeout.
    pub fn recv(&self) -> Event {
        self.events.recv_timeout(Duration::from_secs(5)).expect("no message within timeout")
    }

    pub fn stats(&self) -> IocomStats {
        self.handle.stats()
    }

    /// Asks the IO core to exit and joins it.
    pub fn stop(self) {
        self.handle.shutdown();
        self.join.join().expect("io core panicked");
    }

    /// Joins the IO core, expecting it to exit on its own (link failure).
    pub fn join(self) {
        self.join.join().expect("io core panicked");
    }
}

/// Boots a connection on its own IO core thread. Construction happens on
/// the thread so blocking crypto negotiation can run against a peer doing
/// the same.
pub fn spawn_peer<F>(sock: TcpStream, build: F, action: Action) -> Peer
where
    F: FnOnce(IocomBuilder) -> IocomBuilder + Send + 'static,
{
    let (events_tx, events_rx) = mpsc::channel();
    let (handle_tx, handle_rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let mut iocom: Iocom =
            build(IocomBuilder::new()).build(sock).expect("iocom construction failed");
        let _ = handle_tx.send(iocom.handle());
        let mut handler = Recorder { events: events_tx, action };
        iocom.run(&mut handler);
    });
    let handle = handle_rx.recv_timeout(Duration::from_secs(5)).expect("iocom did not come up");
    Peer { handle, events: events_rx, join }
}

pub fn ignore() -> Action {
    Box::new(|_, _| {})
}

/// A connected localhost socket pair.
pub fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let client = TcpStream::connect(addr).expect("connect");
    let (server, _) = listener.accept().expect("accept");
    (client, server)
}

pub fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

/// Encodes one raw wire frame the way the transmit path does, for tests
/// that speak the protocol by hand.
pub fn raw_frame(mut hdr: Header, aux: &[u8], seq: u32) -> Vec<u8> {
    hdr.magic = splice::wire::HDR_MAGIC;
    hdr.salt = (0xACE0_00 << 8) | (seq & 0xFF);
    hdr.aux_bytes = aux.len() as u32;
    let mut padded = aux.to_vec();
    padded.resize(align64(aux.len()), 0);
    if !padded.is_empty() {
        hdr.aux_crc = icrc32(&padded);
    }
    if hdr.cmd & splice::wire::CMD_SIZE_MASK == 0 {
        hdr.cmd |= 1;
    }
    let hbytes = hdr.hdr_bytes().max(HDR_SIZE);
    let mut wire = vec![0u8; hbytes];
    hdr.hdr_crc = 0;
    hdr.encode_into(&mut wire);
    let crc = icrc32(&wire);
    wire[HDR_CRC_OFF..HDR_CRC_OFF + 4].copy_from_slice(&crc.to_ne_bytes());
    wire.extend_from_slice(&padded);
    wire
}
