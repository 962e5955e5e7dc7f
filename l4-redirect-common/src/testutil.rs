// Frame builders and checksum assertions for tests.

use std::vec::Vec;

use core::net::Ipv4Addr;

use crate::{
    checksum::{ipv4_header_checksum, l4_checksum},
    IPPROTO_TCP, IPPROTO_UDP,
};

#[derive(Clone, Debug)]
pub struct FrameParts {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub options: usize,
    pub payload: &'static [u8],
}

impl Default for FrameParts {
    fn default() -> Self {
        Self {
            src: Ipv4Addr::new(192, 168, 0, 10),
            dst: Ipv4Addr::new(172, 16, 0, 1),
            src_port: 40000,
            dst_port: 8080,
            options: 0,
            payload: &[],
        }
    }
}

impl FrameParts {
    pub fn dst(mut self, dst: Ipv4Addr) -> Self {
        self.dst = dst;
        self
    }

    pub fn dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    /// Bytes of IP options; must be a multiple of four, at most 40.
    pub fn options(mut self, len: usize) -> Self {
        self.options = len;
        self
    }

    pub fn payload(mut self, payload: &'static [u8]) -> Self {
        self.payload = payload;
        self
    }
}

fn ipv4_frame(parts: &FrameParts, proto: u8, segment: &[u8]) -> Vec<u8> {
    assert!(parts.options % 4 == 0 && parts.options <= 40);
    let ihl = 20 + parts.options;

    let mut frame = Vec::with_capacity(14 + ihl + segment.len());
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01, 0x02, 0, 0, 0, 0, 0x02, 0x08, 0x00]);

    let mut ip = Vec::with_capacity(ihl);
    ip.push(0x40 | (ihl / 4) as u8);
    ip.push(0);
    ip.extend_from_slice(&((ihl + segment.len()) as u16).to_be_bytes());
    ip.extend_from_slice(&[0x1c, 0x46, 0x40, 0x00, 64, proto, 0, 0]);
    ip.extend_from_slice(&parts.src.octets());
    ip.extend_from_slice(&parts.dst.octets());
    ip.resize(ihl, 0x01);
    let check = ipv4_header_checksum(&ip);
    ip[10..12].copy_from_slice(&check.to_be_bytes());

    frame.extend_from_slice(&ip);
    frame.extend_from_slice(segment);
    frame
}

pub fn tcp_frame(parts: &FrameParts) -> Vec<u8> {
    let mut tcp = Vec::with_capacity(20 + parts.payload.len());
    tcp.extend_from_slice(&parts.src_port.to_be_bytes());
    tcp.extend_from_slice(&parts.dst_port.to_be_bytes());
    tcp.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, 0x18, 0xff, 0xff, 0, 0, 0, 0]);
    tcp.extend_from_slice(parts.payload);
    let check = l4_checksum(parts.src, parts.dst, IPPROTO_TCP, &tcp);
    tcp[16..18].copy_from_slice(&check.to_be_bytes());
    ipv4_frame(parts, IPPROTO_TCP, &tcp)
}

pub fn udp_frame(parts: &FrameParts, with_checksum: bool) -> Vec<u8> {
    let mut udp = Vec::with_capacity(8 + parts.payload.len());
    udp.extend_from_slice(&parts.src_port.to_be_bytes());
    udp.extend_from_slice(&parts.dst_port.to_be_bytes());
    udp.extend_from_slice(&((8 + parts.payload.len()) as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(parts.payload);
    if with_checksum {
        let mut check = l4_checksum(parts.src, parts.dst, IPPROTO_UDP, &udp);
        if check == 0 {
            check = 0xffff;
        }
        udp[6..8].copy_from_slice(&check.to_be_bytes());
    }
    ipv4_frame(parts, IPPROTO_UDP, &udp)
}

fn ip_header_len(frame: &[u8]) -> usize {
    ((frame[14] & 0x0f) as usize) * 4
}

pub fn assert_ipv4_checksum_recomputes(frame: &[u8]) {
    let ihl = ip_header_len(frame);
    let mut header = frame[14..14 + ihl].to_vec();
    let embedded = u16::from_be_bytes([header[10], header[11]]);
    header[10] = 0;
    header[11] = 0;
    assert_eq!(embedded, ipv4_header_checksum(&header), "ipv4 checksum");
}

pub fn assert_l4_checksum_recomputes(frame: &[u8]) {
    let ihl = ip_header_len(frame);
    let total = u16::from_be_bytes([frame[16], frame[17]]) as usize;
    let proto = frame[14 + 9];
    let src = Ipv4Addr::new(frame[26], frame[27], frame[28], frame[29]);
    let dst = Ipv4Addr::new(frame[30], frame[31], frame[32], frame[33]);

    let mut segment = frame[14 + ihl..14 + total].to_vec();
    let field = if proto == IPPROTO_TCP { 16 } else { 6 };
    let embedded = u16::from_be_bytes([segment[field], segment[field + 1]]);
    segment[field] = 0;
    segment[field + 1] = 0;

    let mut expected = l4_checksum(src, dst, proto, &segment);
    if proto == IPPROTO_UDP && expected == 0 {
        expected = 0xffff;
    }
    assert_eq!(embedded, expected, "l4 checksum");
}

/// Every byte other than the destination fields and the two checksums is
/// unchanged.
pub fn assert_only_rewritten_fields_changed(before: &[u8], after: &[u8]) {
    assert_eq!(before.len(), after.len());
    let l4 = 14 + ip_header_len(before);
    let l4_check = if before[14 + 9] == IPPROTO_TCP { l4 + 16 } else { l4 + 6 };
    let rewritable = |i: usize| {
        (24..26).contains(&i)
            || (30..34).contains(&i)
            || (l4 + 2..l4 + 4).contains(&i)
            || (l4_check..l4_check + 2).contains(&i)
    };
    for (i, (a, b)) in before.iter().zip(after).enumerate() {
        if !rewritable(i) {
            assert_eq!(a, b, "byte {i} changed");
        }
    }
}
