use std::net::Ipv4Addr;

use anyhow::{ensure, Context, Result};
use serde::Serialize;

use crate::{routes::Route, table::PolicyTable};
use l4_redirect_common::{
    checksum::{sum_words, verify},
    parse_flow, try_redirect, ParsedFlow, Verdict, IPPROTO_UDP,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum L4Checksum {
    Valid,
    Invalid,
    /// UDP sender left the checksum at zero.
    Disabled,
}

#[derive(Clone, Debug, Serialize)]
pub struct Simulation {
    pub verdict: &'static str,
    pub frame: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksums: Option<ChecksumReport>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct ChecksumReport {
    pub ipv4: bool,
    pub l4: L4Checksum,
}

/// Builds an in-process policy table from `routes`.
pub fn policy_from_routes(routes: &[Route]) -> Result<PolicyTable> {
    let table = PolicyTable::new();
    for route in routes {
        let (key, value) = route
            .policy()
            .with_context(|| format!("invalid route {}", route.storage_key()))?;
        table.insert(key, value)?;
    }
    Ok(table)
}

/// Runs the dataplane over one hex-encoded frame.
pub fn simulate(frame_hex: &str, policy: &PolicyTable) -> Result<Simulation> {
    let cleaned: String = frame_hex.chars().filter(|c| !c.is_whitespace()).collect();
    let mut frame = hex::decode(&cleaned).context("frame is not valid hex")?;
    ensure!(!frame.is_empty(), "frame is empty");

    let (verdict, error) = match try_redirect(frame.as_mut_slice(), policy) {
        Ok(verdict) => (verdict, None),
        Err(err) => (Verdict::ForwardUnmodified, Some(format!("{err:?}"))),
    };

    Ok(Simulation {
        verdict: match verdict {
            Verdict::ForwardUnmodified => "forward_unmodified",
            Verdict::ForwardRewritten => "forward_rewritten",
        },
        checksums: parse_flow(frame.as_slice()).map(|flow| check_frame(&frame, &flow)),
        frame: hex::encode(&frame),
        error,
    })
}

/// Recomputes the IPv4 header and L4 checksums of a parsed frame from
/// scratch.
pub fn check_frame(frame: &[u8], flow: &ParsedFlow) -> ChecksumReport {
    let ip = &frame[flow.ip_offset..];
    let ipv4 = verify(0, &frame[flow.ip_offset..flow.l4_offset]);

    let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    let end = (flow.ip_offset + total_len).clamp(flow.l4_offset, frame.len());
    let segment = &frame[flow.l4_offset..end];

    let l4 = if flow.protocol == IPPROTO_UDP
        && frame[flow.l4_check_offset()..flow.l4_check_offset() + 2] == [0, 0]
    {
        L4Checksum::Disabled
    } else {
        let src = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
        let mut pseudo = [0u8; 12];
        pseudo[0..4].copy_from_slice(&src.octets());
        pseudo[4..8].copy_from_slice(&flow.dst_addr.octets());
        pseudo[9] = flow.protocol;
        pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
        if verify(sum_words(0, &pseudo), segment) {
            L4Checksum::Valid
        } else {
            L4Checksum::Invalid
        }
    };

    ChecksumReport { ipv4, l4 }
}
