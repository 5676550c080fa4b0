// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Packet builders for tests, on top of [`etherparse::PacketBuilder`].

#![allow(clippy::panic, clippy::expect_used)] // test helpers

use crate::buffer::TestBuffer;
use crate::cache::TcpFlags;
use etherparse::{IpHeaders, PacketBuilder, PacketBuilderStep, TcpOptionElement};
use std::net::{IpAddr, SocketAddr};

const TTL: u8 = 64;

/// Parameters of a TCP segment to build.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment {
    /// Flags.
    pub flags: TcpFlags,
    /// Sequence number.
    pub seq: u32,
    /// Acknowledgement number (only written with [`TcpFlags::ACK`]).
    pub ack: u32,
    /// Window.
    pub win: u16,
    /// Window scale option.
    pub wscale: Option<u8>,
    /// MSS option.
    pub mss: Option<u16>,
    /// Number of payload octets.
    pub payload_len: usize,
}

impl Default for TcpSegment {
    fn default() -> Self {
        TcpSegment {
            flags: TcpFlags::empty(),
            seq: 0,
            ack: 0,
            win: 65535,
            wscale: None,
            mss: None,
            payload_len: 0,
        }
    }
}

fn ip(src: IpAddr, dst: IpAddr) -> PacketBuilderStep<IpHeaders> {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => PacketBuilder::ipv4(src.octets(), dst.octets(), TTL),
        (IpAddr::V6(src), IpAddr::V6(dst)) => PacketBuilder::ipv6(src.octets(), dst.octets(), TTL),
        _ => panic!("address family mismatch: {src} / {dst}"),
    }
}

/// Build a TCP packet.
#[must_use]
pub fn tcp(src: SocketAddr, dst: SocketAddr, segment: &TcpSegment) -> TestBuffer {
    let mut builder = ip(src.ip(), dst.ip()).tcp(src.port(), dst.port(), segment.seq, segment.win);
    if segment.flags.contains(TcpFlags::SYN) {
        builder = builder.syn();
    }
    if segment.flags.contains(TcpFlags::FIN) {
        builder = builder.fin();
    }
    if segment.flags.contains(TcpFlags::RST) {
        builder = builder.rst();
    }
    if segment.flags.contains(TcpFlags::PUSH) {
        builder = builder.psh();
    }
    if segment.flags.contains(TcpFlags::ACK) {
        builder = builder.ack(segment.ack);
    }
    let mut options = Vec::new();
    if let Some(mss) = segment.mss {
        options.push(TcpOptionElement::MaximumSegmentSize(mss));
    }
    if let Some(wscale) = segment.wscale {
        options.push(TcpOptionElement::Noop);
        options.push(TcpOptionElement::WindowScale(wscale));
    }
    if !options.is_empty() {
        builder = builder.options(&options).expect("valid TCP options");
    }
    let payload = vec![0xa5; segment.payload_len];
    let mut data = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut data, &payload).expect("packet build");
    TestBuffer::from_raw_data(&data)
}

/// Build a UDP packet.
#[must_use]
pub fn udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> TestBuffer {
    let builder = ip(src.ip(), dst.ip()).udp(src.port(), dst.port());
    let mut data = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut data, payload).expect("packet build");
    TestBuffer::from_raw_data(&data)
}

/// Build an ICMP (or `ICMPv6`) echo request.
#[must_use]
pub fn icmp_echo(src: IpAddr, dst: IpAddr, id: u16) -> TestBuffer {
    let mut data = Vec::new();
    if src.is_ipv4() {
        ip(src, dst)
            .icmpv4_echo_request(id, 1)
            .write(&mut data, &[])
            .expect("packet build");
    } else {
        ip(src, dst)
            .icmpv6_echo_request(id, 1)
            .write(&mut data, &[])
            .expect("packet build");
    }
    TestBuffer::from_raw_data(&data)
}
