use core::net::Ipv4Addr;

use crate::{Frame, PolicyKey, IPPROTO_TCP, IPPROTO_UDP};

pub const ETH_HDR_LEN: usize = 14;
pub const ETH_P_IP: u16 = 0x0800;
pub const IPV4_MIN_HDR_LEN: usize = 20;
pub const TCP_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;

const ETH_PROTO_OFFSET: usize = 12;
pub(crate) const IPV4_PROTO_OFFSET: usize = 9;
pub(crate) const IPV4_CHECK_OFFSET: usize = 10;
pub(crate) const IPV4_DADDR_OFFSET: usize = 16;
pub(crate) const L4_DEST_OFFSET: usize = 2;
pub(crate) const TCP_CHECK_OFFSET: usize = 16;
pub(crate) const UDP_CHECK_OFFSET: usize = 6;

/// Outcome of walking Ethernet, IPv4 and TCP/UDP headers of a frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ParsedFlow {
    pub protocol: u8,
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
    pub ip_offset: usize,
    pub l4_offset: usize,
}

impl ParsedFlow {
    #[inline(always)]
    pub fn key(&self) -> PolicyKey {
        PolicyKey::new(self.protocol, self.dst_port)
    }

    /// Absolute offset of the L4 checksum field.
    #[inline(always)]
    pub fn l4_check_offset(&self) -> usize {
        let field = if self.protocol == IPPROTO_TCP {
            TCP_CHECK_OFFSET
        } else {
            UDP_CHECK_OFFSET
        };
        self.l4_offset + field
    }
}

/// Returns `None` for anything that is not a complete IPv4 TCP or UDP header
/// chain. Every field is range-checked before it is read.
#[inline(always)]
pub fn parse_flow<F: Frame + ?Sized>(frame: &F) -> Option<ParsedFlow> {
    if !frame.has(0, ETH_HDR_LEN) {
        return None;
    }
    if frame.load_be16(ETH_PROTO_OFFSET)? != ETH_P_IP {
        return None;
    }

    let ip_offset = ETH_HDR_LEN;
    if !frame.has(ip_offset, IPV4_MIN_HDR_LEN) {
        return None;
    }
    let ihl_words = (frame.load_u8(ip_offset)? & 0x0f) as usize;
    if ihl_words < 5 {
        return None;
    }
    let protocol = frame.load_u8(ip_offset + IPV4_PROTO_OFFSET)?;
    let dst_addr = Ipv4Addr::from(frame.load::<4>(ip_offset + IPV4_DADDR_OFFSET)?);

    let l4_offset = ip_offset + ihl_words * 4;
    if !frame.has(l4_offset, 2) {
        return None;
    }

    let l4_len = match protocol {
        IPPROTO_TCP => TCP_HDR_LEN,
        IPPROTO_UDP => UDP_HDR_LEN,
        _ => return None,
    };
    if !frame.has(l4_offset, l4_len) {
        return None;
    }
    let dst_port = frame.load_be16(l4_offset + L4_DEST_OFFSET)?;

    Some(ParsedFlow {
        protocol,
        dst_addr,
        dst_port,
        ip_offset,
        l4_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{tcp_frame, udp_frame, FrameParts};

    #[test]
    fn parses_tcp_flow() {
        let frame = tcp_frame(&FrameParts::default().dst_port(8080));
        let flow = parse_flow(frame.as_slice()).unwrap();
        assert_eq!(flow.protocol, IPPROTO_TCP);
        assert_eq!(flow.dst_port, 8080);
        assert_eq!(flow.dst_addr, FrameParts::default().dst);
        assert_eq!(flow.ip_offset, 14);
        assert_eq!(flow.l4_offset, 34);
        assert_eq!(flow.l4_check_offset(), 50);
        assert_eq!(flow.key(), PolicyKey::new(IPPROTO_TCP, 8080));
    }

    #[test]
    fn parses_udp_flow() {
        let frame = udp_frame(&FrameParts::default().dst_port(53), false);
        let flow = parse_flow(frame.as_slice()).unwrap();
        assert_eq!(flow.protocol, IPPROTO_UDP);
        assert_eq!(flow.dst_port, 53);
        assert_eq!(flow.l4_check_offset(), 40);
    }

    #[test]
    fn rejects_short_ethernet_header() {
        let frame = tcp_frame(&FrameParts::default());
        assert_eq!(parse_flow(&frame[..13]), None);
        assert_eq!(parse_flow(&frame[..0]), None);
    }

    #[test]
    fn rejects_other_ether_types() {
        for ether_type in [0x86ddu16, 0x0806, 0x8100] {
            let mut frame = tcp_frame(&FrameParts::default());
            frame[12..14].copy_from_slice(&ether_type.to_be_bytes());
            assert_eq!(parse_flow(frame.as_slice()), None, "{ether_type:#06x}");
        }
    }

    #[test]
    fn rejects_truncated_ip_header() {
        let frame = tcp_frame(&FrameParts::default());
        assert_eq!(parse_flow(&frame[..14 + 19]), None);
    }

    #[test]
    fn rejects_ihl_below_five() {
        for ihl in 0..5u8 {
            let mut frame = tcp_frame(&FrameParts::default());
            frame[14] = 0x40 | ihl;
            assert_eq!(parse_flow(frame.as_slice()), None, "ihl {ihl}");
        }
    }

    #[test]
    fn rejects_other_protocols() {
        let mut frame = tcp_frame(&FrameParts::default());
        frame[14 + 9] = 1;
        assert_eq!(parse_flow(frame.as_slice()), None);
    }

    #[test]
    fn rejects_truncated_l4_headers() {
        let tcp = tcp_frame(&FrameParts::default());
        assert_eq!(parse_flow(&tcp[..34 + 1]), None);
        assert_eq!(parse_flow(&tcp[..34 + 19]), None);
        assert!(parse_flow(&tcp[..34 + 20]).is_some());

        let udp = udp_frame(&FrameParts::default(), true);
        assert_eq!(parse_flow(&udp[..34 + 7]), None);
        assert!(parse_flow(&udp[..34 + 8]).is_some());
    }

    #[test]
    fn honours_ip_options() {
        let parts = FrameParts::default().dst_port(4242).options(40);
        let frame = tcp_frame(&parts);
        assert_eq!(frame[14] & 0x0f, 15);

        let flow = parse_flow(frame.as_slice()).unwrap();
        assert_eq!(flow.l4_offset, 14 + 60);
        assert_eq!(flow.dst_port, 4242);
    }

    #[test]
    fn ihl_pointing_past_the_end_is_rejected() {
        let parts = FrameParts::default().options(40);
        let frame = tcp_frame(&parts);
        // Options present but the L4 header is cut off.
        assert_eq!(parse_flow(&frame[..14 + 60 + 1]), None);
    }
}
