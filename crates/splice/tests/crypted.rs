//! Stream-codec plumbing over a real link, with a toy XOR cipher standing
//! in for the external stream codec. Worthless as cryptography; it only
//! exercises the FIFO cursor handling on both directions.

mod common;

use std::{
    io::{self, IoSlice, Read, Write},
    net::TcpStream,
};

use common::{ignore, socket_pair, spawn_peer, wait_until};
use splice::{
    IoqBuf,
    crypto::{LinkCrypto, StreamCodec},
    wire::CmdFlags,
};

const CMD_FOO: u32 = 0x0000_3001;

struct XorCodec(u8);

impl StreamCodec for XorCodec {
    fn decrypt(&mut self, fifo: &mut IoqBuf) -> Result<(), splice::IoqError> {
        for i in fifo.cdn..fifo.end {
            fifo.buf[i] ^= self.0;
        }
        fifo.cdx = fifo.end;
        fifo.cdn = fifo.end;
        Ok(())
    }

    fn encrypt(&mut self, fifo: &mut IoqBuf, plain: &[IoSlice<'_>]) -> usize {
        let mut consumed = 0;
        for slice in plain {
            let avail = fifo.buf.len() - fifo.end;
            let take = slice.len().min(avail);
            for (i, b) in slice[..take].iter().enumerate() {
                fifo.buf[fifo.end + i] = *b ^ self.0;
            }
            fifo.end += take;
            consumed += take;
            if take < slice.len() {
                break;
            }
        }
        fifo.cdx = fifo.end;
        fifo.cdn = fifo.end;
        consumed
    }
}

/// One-byte key exchange; the session key is the xor of both
/// contributions so the two ends always agree.
struct XorHandshake {
    key: u8,
}

impl LinkCrypto for XorHandshake {
    fn negotiate(
        &mut self,
        sock: &mut TcpStream,
    ) -> io::Result<(Box<dyn StreamCodec>, Box<dyn StreamCodec>)> {
        sock.write_all(&[self.key])?;
        let mut peer = [0u8; 1];
        sock.read_exact(&mut peer)?;
        let session = self.key ^ peer[0];
        Ok((Box::new(XorCodec(session)), Box::new(XorCodec(session))))
    }
}

#[test]
fn crypted_one_shot_roundtrip() {
    let (a_sock, b_sock) = socket_pair();
    let a = spawn_peer(
        a_sock,
        |b| b.label("a").crypto(Box::new(XorHandshake { key: 0x5A })),
        ignore(),
    );
    let b = spawn_peer(
        b_sock,
        |b| b.label("b").crypto(Box::new(XorHandshake { key: 0xC3 })),
        Box::new(|link, msg| {
            if msg.has(CmdFlags::CREATE) {
                link.msg_reply(msg, 0);
            }
        }),
    );

    // Payload deliberately not a multiple of the alignment so the padded
    // tail goes through the codec too.
    let payload: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
    let msg = a
        .handle
        .msg_alloc(
            a.handle.state0(),
            Some(payload.clone()),
            CMD_FOO | (CmdFlags::CREATE | CmdFlags::DELETE).bits(),
        )
        .expect("alloc");
    a.handle.msg_write(msg);

    let at_b = b.recv();
    assert_eq!(at_b.aux.as_deref(), Some(payload.as_slice()));

    let at_a = a.recv();
    assert!(at_a.cmd & CmdFlags::REPLY.bits() != 0);
    assert_eq!(at_a.error, 0);

    wait_until("teardown", || {
        a.stats().live_states == 0 && b.stats().live_states == 0
    });

    a.stop();
    b.stop();
}

#[test]
fn crypted_stream_of_messages() {
    let (a_sock, b_sock) = socket_pair();
    let a = spawn_peer(
        a_sock,
        |b| b.label("a").crypto(Box::new(XorHandshake { key: 0x11 })),
        ignore(),
    );
    let b = spawn_peer(
        b_sock,
        |b| b.label("b").crypto(Box::new(XorHandshake { key: 0x22 })),
        ignore(),
    );

    // A burst of one-off messages exercises frame boundaries inside the
    // decrypt FIFO.
    for i in 0..32u32 {
        let msg = a
            .handle
            .msg_alloc(a.handle.state0(), Some(vec![i as u8; 1 + (i as usize * 17) % 300]), CMD_FOO)
            .expect("alloc");
        a.handle.msg_write(msg);
    }

    for i in 0..32u32 {
        let ev = b.recv();
        assert!(ev.user);
        assert_eq!(ev.aux.as_deref(), Some(vec![i as u8; 1 + (i as usize * 17) % 300].as_slice()));
    }

    a.stop();
    b.stop();
}
