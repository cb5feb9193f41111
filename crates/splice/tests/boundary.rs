//! Malformed-frame behavior, driven by a raw peer that speaks the wire
//! format by hand. Every fatal condition ends in exactly one
//! non-transactional link-error sentinel carrying the specific code.

mod common;

use std::io::Write;

use common::{ignore, raw_frame, socket_pair, spawn_peer};
use splice::{
    IoqError,
    wire::{CMD_SW_MASK, HDR_CRC_OFF, HDR_SIZE, Header, icrc32},
};

const CMD_FOO: u32 = 0x0000_3001;

#[test]
fn one_off_then_salt_replay() {
    let (sock, mut raw) = socket_pair();
    let a = spawn_peer(sock, |b| b.label("a"), ignore());

    // A well-formed non-transactional message is handed to the user path.
    raw.write_all(&raw_frame(Header { cmd: CMD_FOO, ..Header::default() }, b"hi", 0))
        .expect("write");
    let oneoff = a.recv();
    assert!(oneoff.user);
    assert!(oneoff.root);
    assert_eq!(oneoff.tcmd, CMD_FOO & CMD_SW_MASK);
    assert_eq!(oneoff.aux.as_deref(), Some(&b"hi"[..]));

    // The second frame skips ahead in the salt sequence.
    raw.write_all(&raw_frame(Header { cmd: CMD_FOO, ..Header::default() }, &[], 7))
        .expect("write");

    let sentinel = a.recv();
    assert!(sentinel.root);
    assert!(!sentinel.user);
    assert_eq!(sentinel.error, IoqError::MsgSeq.code());
    a.join();
}

#[test]
fn bad_magic_desynchronizes() {
    let (sock, mut raw) = socket_pair();
    let a = spawn_peer(sock, |b| b.label("a"), ignore());

    let mut frame = raw_frame(Header { cmd: CMD_FOO, ..Header::default() }, &[], 0);
    frame[0] ^= 0xFF;
    raw.write_all(&frame).expect("write");

    let sentinel = a.recv();
    assert!(sentinel.root);
    assert_eq!(sentinel.error, IoqError::Sync.code());
    a.join();
}

#[test]
fn header_size_zero_is_rejected() {
    let (sock, mut raw) = socket_pair();
    let a = spawn_peer(sock, |b| b.label("a"), ignore());

    // Size field of zero units: below the core header minimum.
    let hdr = Header { magic: splice::wire::HDR_MAGIC, cmd: 0, ..Header::default() };
    let mut frame = vec![0u8; HDR_SIZE];
    hdr.encode_into(&mut frame);
    raw.write_all(&frame).expect("write");

    let sentinel = a.recv();
    assert_eq!(sentinel.error, IoqError::Field.code());
    a.join();
}

#[test]
fn oversized_aux_is_rejected() {
    let (sock, mut raw) = socket_pair();
    let a = spawn_peer(sock, |b| b.label("a"), ignore());

    let hdr = Header {
        magic: splice::wire::HDR_MAGIC,
        cmd: CMD_FOO,
        aux_bytes: splice::wire::AUX_MAX as u32 + 1,
        ..Header::default()
    };
    let mut frame = vec![0u8; HDR_SIZE];
    hdr.encode_into(&mut frame);
    raw.write_all(&frame).expect("write");

    let sentinel = a.recv();
    assert_eq!(sentinel.error, IoqError::Field.code());
    a.join();
}

#[test]
fn corrupt_header_crc() {
    let (sock, mut raw) = socket_pair();
    let a = spawn_peer(sock, |b| b.label("a"), ignore());

    let mut frame = raw_frame(Header { cmd: CMD_FOO, ..Header::default() }, &[], 0);
    frame[HDR_CRC_OFF] ^= 0x01;
    raw.write_all(&frame).expect("write");

    let sentinel = a.recv();
    assert_eq!(sentinel.error, IoqError::HdrCrc.code());
    a.join();
}

#[test]
fn corrupt_aux_crc() {
    let (sock, mut raw) = socket_pair();
    let a = spawn_peer(sock, |b| b.label("a"), ignore());

    let mut frame = raw_frame(Header { cmd: CMD_FOO, ..Header::default() }, b"payload", 0);
    let last = frame.len() - 1;
    frame[last] ^= 0x01;
    raw.write_all(&frame).expect("write");

    let sentinel = a.recv();
    assert_eq!(sentinel.error, IoqError::AuxCrc.code());
    a.join();
}

#[test]
fn byte_swapped_peer_is_understood() {
    let (sock, mut raw) = socket_pair();
    let a = spawn_peer(sock, |b| b.label("a"), ignore());

    // Re-encode the frame the way an opposite-endian sender would have
    // produced it: every core field byte-swapped, crc over the raw bytes.
    let mut frame = raw_frame(
        Header { cmd: CMD_FOO, msgid: 0, error: 99, ..Header::default() },
        b"mirrored",
        0,
    );
    let mut hdr = Header::decode(&frame[..HDR_SIZE]);
    hdr.bswap();
    hdr.hdr_crc = 0;
    hdr.encode_into(&mut frame[..HDR_SIZE]);
    frame[HDR_CRC_OFF..HDR_CRC_OFF + 4].fill(0);
    let crc = icrc32(&frame[..HDR_SIZE]);
    // An opposite-endian sender stores the crc in its own byte order.
    frame[HDR_CRC_OFF..HDR_CRC_OFF + 4].copy_from_slice(&crc.swap_bytes().to_ne_bytes());
    raw.write_all(&frame).expect("write");

    let oneoff = a.recv();
    assert!(oneoff.user);
    assert_eq!(oneoff.error, 99);
    assert_eq!(oneoff.aux.as_deref(), Some(&b"mirrored"[..]));

    a.stop();
}
