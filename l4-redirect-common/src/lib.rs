#![cfg_attr(not(test), no_std)]

// Types and packet logic shared between the TC classifier and userspace.
// Keep this crate `no_std` friendly so it can be linked into eBPF code.

use core::net::Ipv4Addr;

pub mod checksum;
pub mod frame;
pub mod parse;
pub mod rewrite;

pub use frame::{ChecksumKind, ChecksumUpdate, Frame, StoreError};
pub use parse::{parse_flow, ParsedFlow};
pub use rewrite::{RewriteError, RewritePlan};

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

pub const PROGRAM_NAME: &str = "l4_redirect_ingress";
pub const POLICY_MAP: &str = "l4_redirect_policy";
pub const STATS_MAP: &str = "l4_redirect_stats";
pub const POLICY_MAP_CAPACITY: u32 = 4096;

pub const STAT_PASSED: u32 = 0;
pub const STAT_REWRITTEN: u32 = 1;
pub const STAT_REWRITE_FAILED: u32 = 2;
pub const STAT_SLOTS: u32 = 3;

/// Lookup key of the policy table.
///
/// The port is kept in network byte order so the layout matches what the
/// classifier reads straight out of the L4 header.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct PolicyKey {
    pub proto: u8,
    pub pad: u8,
    pub port_be: u16,
}

impl PolicyKey {
    pub const fn new(proto: u8, port: u16) -> Self {
        Self {
            proto,
            pad: 0,
            port_be: port.to_be(),
        }
    }

    pub const fn port(&self) -> u16 {
        u16::from_be(self.port_be)
    }
}

/// Redirection target. Address and port are both always rewritten.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct PolicyValue {
    pub addr_be: u32,
    pub port_be: u16,
    pub pad: u16,
}

impl PolicyValue {
    pub const fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self {
            addr_be: u32::from_ne_bytes(addr.octets()),
            port_be: port.to_be(),
            pad: 0,
        }
    }

    pub const fn addr(&self) -> Ipv4Addr {
        let [a, b, c, d] = self.addr_be.to_ne_bytes();
        Ipv4Addr::new(a, b, c, d)
    }

    pub const fn port(&self) -> u16 {
        u16::from_be(self.port_be)
    }
}

/// Read side of the policy table as seen by the dataplane.
pub trait PolicyLookup {
    fn lookup(&self, key: &PolicyKey) -> Option<PolicyValue>;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    ForwardUnmodified,
    ForwardRewritten,
}

/// Parses `frame`, looks the flow up in `policy` and rewrites the frame on a hit.
///
/// `Err` means a policy matched but the rewrite was abandoned; the frame has
/// been restored to its received bytes.
#[inline(always)]
pub fn try_redirect<F, P>(frame: &mut F, policy: &P) -> Result<Verdict, RewriteError>
where
    F: Frame + ?Sized,
    P: PolicyLookup + ?Sized,
{
    let flow = match parse_flow(frame) {
        Some(flow) => flow,
        None => return Ok(Verdict::ForwardUnmodified),
    };
    let target = match policy.lookup(&flow.key()) {
        Some(target) => target,
        None => return Ok(Verdict::ForwardUnmodified),
    };
    RewritePlan::new(frame, &flow, &target)?.commit(frame)?;
    Ok(Verdict::ForwardRewritten)
}

/// Per-frame entry point. Never drops: anything that is not rewritten is
/// forwarded exactly as received.
#[inline(always)]
pub fn redirect<F, P>(frame: &mut F, policy: &P) -> Verdict
where
    F: Frame + ?Sized,
    P: PolicyLookup + ?Sized,
{
    try_redirect(frame, policy).unwrap_or(Verdict::ForwardUnmodified)
}

#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{PolicyKey, PolicyValue};
    use aya::Pod;

    unsafe impl Pod for PolicyKey {}
    unsafe impl Pod for PolicyValue {}
}

#[cfg(test)]
pub(crate) mod testutil;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{tcp_frame, udp_frame, FrameParts};
    use core::mem;

    struct OneRule(PolicyKey, PolicyValue);

    impl PolicyLookup for OneRule {
        fn lookup(&self, key: &PolicyKey) -> Option<PolicyValue> {
            (*key == self.0).then_some(self.1)
        }
    }

    #[test]
    fn shared_layouts_match_kernel_structs() {
        assert_eq!(mem::size_of::<PolicyKey>(), 4);
        assert_eq!(mem::offset_of!(PolicyKey, port_be), 2);
        assert_eq!(mem::size_of::<PolicyValue>(), 8);
        assert_eq!(mem::offset_of!(PolicyValue, port_be), 4);
    }

    #[test]
    fn key_and_value_store_network_order() {
        let key = PolicyKey::new(IPPROTO_TCP, 8080);
        assert_eq!(key.port_be.to_ne_bytes(), [0x1f, 0x90]);
        assert_eq!(key.port(), 8080);

        let value = PolicyValue::new(Ipv4Addr::new(10, 0, 0, 5), 80);
        assert_eq!(value.addr_be.to_ne_bytes(), [10, 0, 0, 5]);
        assert_eq!(value.port_be.to_ne_bytes(), [0, 80]);
        assert_eq!(value.addr(), Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(value.port(), 80);
    }

    #[test]
    fn redirect_rewrites_matching_tcp() {
        let rule = OneRule(
            PolicyKey::new(IPPROTO_TCP, 8080),
            PolicyValue::new(Ipv4Addr::new(10, 0, 0, 5), 80),
        );
        let mut frame = tcp_frame(&FrameParts::default().dst_port(8080));
        assert_eq!(redirect(frame.as_mut_slice(), &rule), Verdict::ForwardRewritten);

        let flow = parse_flow(frame.as_slice()).unwrap();
        assert_eq!(flow.dst_addr, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(flow.dst_port, 80);
    }

    #[test]
    fn redirect_passes_unmatched_port() {
        let rule = OneRule(
            PolicyKey::new(IPPROTO_TCP, 8080),
            PolicyValue::new(Ipv4Addr::new(10, 0, 0, 5), 80),
        );
        let original = tcp_frame(&FrameParts::default().dst_port(8081));
        let mut frame = original.clone();
        assert_eq!(redirect(frame.as_mut_slice(), &rule), Verdict::ForwardUnmodified);
        assert_eq!(frame, original);
    }

    #[test]
    fn redirect_keys_on_protocol() {
        let rule = OneRule(
            PolicyKey::new(IPPROTO_TCP, 53),
            PolicyValue::new(Ipv4Addr::new(192, 168, 1, 2), 5353),
        );
        let original = udp_frame(&FrameParts::default().dst_port(53), true);
        let mut frame = original.clone();
        assert_eq!(redirect(frame.as_mut_slice(), &rule), Verdict::ForwardUnmodified);
        assert_eq!(frame, original);
    }

    #[test]
    fn repeated_evaluation_is_stateless() {
        let rule = OneRule(
            PolicyKey::new(IPPROTO_UDP, 9000),
            PolicyValue::new(Ipv4Addr::new(10, 1, 1, 1), 9001),
        );
        let original = udp_frame(&FrameParts::default().dst_port(9999), true);
        let mut frame = original.clone();
        for _ in 0..3 {
            assert_eq!(redirect(frame.as_mut_slice(), &rule), Verdict::ForwardUnmodified);
            assert_eq!(frame, original);
        }
    }
}
