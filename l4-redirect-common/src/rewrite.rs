use crate::{
    frame::{ChecksumKind, ChecksumUpdate},
    parse::{ParsedFlow, IPV4_CHECK_OFFSET, IPV4_DADDR_OFFSET, L4_DEST_OFFSET},
    Frame, PolicyValue, StoreError, IPPROTO_UDP,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RewriteError {
    /// A field to patch lies outside the frame.
    OutOfBounds { offset: usize },
    /// A store was rejected. `restored` tells whether every earlier patch was
    /// undone successfully.
    Store { error: StoreError, restored: bool },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Patch {
    Checksum {
        update: ChecksumUpdate,
        saved: [u8; 2],
    },
    Word {
        offset: usize,
        old: [u8; 2],
        new: [u8; 2],
    },
    Addr {
        offset: usize,
        old: [u8; 4],
        new: [u8; 4],
    },
}

impl Patch {
    #[inline(always)]
    fn span(&self) -> (usize, usize) {
        match self {
            Patch::Checksum { update, .. } => (update.offset, 2),
            Patch::Word { offset, .. } => (*offset, 2),
            Patch::Addr { offset, .. } => (*offset, 4),
        }
    }

    #[inline(always)]
    fn apply<F: Frame + ?Sized>(&self, frame: &mut F) -> Result<(), StoreError> {
        match *self {
            Patch::Checksum { update, .. } => frame.update_checksum(&update),
            Patch::Word { offset, new, .. } => frame.store(offset, new),
            Patch::Addr { offset, new, .. } => frame.store(offset, new),
        }
    }

    #[inline(always)]
    fn revert<F: Frame + ?Sized>(&self, frame: &mut F) -> Result<(), StoreError> {
        match *self {
            Patch::Checksum { update, saved } => frame.revert_checksum(&update, saved),
            Patch::Word { offset, old, .. } => frame.store(offset, old),
            Patch::Addr { offset, old, .. } => frame.store(offset, old),
        }
    }
}

/// Destination rewrite staged as a fixed set of patches.
///
/// Checksum patches carry the field deltas rather than finished values, so
/// the frame decides how to fold them: a plain buffer patches the checksum
/// bytes, a socket buffer hands them to the kernel, which knows whether the
/// L4 checksum is finished or still a pseudo-header seed. Nothing touches
/// the frame until [`RewritePlan::commit`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RewritePlan {
    // L4 checksum for the port, L4 checksum for the address (pseudo-header),
    // IP checksum, L4 port, IP address. The two L4 checksum slots are empty
    // for UDP datagrams sent without a checksum.
    patches: [Option<Patch>; 5],
}

impl RewritePlan {
    #[inline(always)]
    pub fn new<F: Frame + ?Sized>(
        frame: &F,
        flow: &ParsedFlow,
        target: &PolicyValue,
    ) -> Result<Self, RewriteError> {
        let old_addr = u32::from(flow.dst_addr);
        let new_addr = u32::from(target.addr());
        let old_port = flow.dst_port;
        let new_port = target.port();
        let udp = flow.protocol == IPPROTO_UDP;

        let ip_check_offset = flow.ip_offset + IPV4_CHECK_OFFSET;
        let ip_check = load_check(frame, ip_check_offset)?;

        let l4_check_offset = flow.l4_check_offset();
        let l4_check = load_check(frame, l4_check_offset)?;
        let l4_patch = |size, from, to, pseudo| Patch::Checksum {
            update: ChecksumUpdate {
                offset: l4_check_offset,
                kind: ChecksumKind::L4 { pseudo, udp },
                size,
                from,
                to,
            },
            saved: l4_check,
        };
        let (l4_port, l4_addr) = if udp && l4_check == [0, 0] {
            (None, None)
        } else {
            (
                Some(l4_patch(2, old_port as u32, new_port as u32, false)),
                Some(l4_patch(4, old_addr, new_addr, true)),
            )
        };

        Ok(Self {
            patches: [
                l4_port,
                l4_addr,
                Some(Patch::Checksum {
                    update: ChecksumUpdate {
                        offset: ip_check_offset,
                        kind: ChecksumKind::L3,
                        size: 4,
                        from: old_addr,
                        to: new_addr,
                    },
                    saved: ip_check,
                }),
                Some(Patch::Word {
                    offset: flow.l4_offset + L4_DEST_OFFSET,
                    old: old_port.to_be_bytes(),
                    new: new_port.to_be_bytes(),
                }),
                Some(Patch::Addr {
                    offset: flow.ip_offset + IPV4_DADDR_OFFSET,
                    old: old_addr.to_be_bytes(),
                    new: new_addr.to_be_bytes(),
                }),
            ],
        })
    }

    /// Whether the plan updates the L4 checksum.
    pub fn updates_l4_checksum(&self) -> bool {
        self.patches[0].is_some()
    }

    /// Writes every patch, or none of them.
    ///
    /// All ranges are validated before the first store. If a store fails the
    /// patches already written are reverted in reverse order.
    #[inline(always)]
    pub fn commit<F: Frame + ?Sized>(&self, frame: &mut F) -> Result<(), RewriteError> {
        for patch in self.patches.iter().flatten() {
            let (offset, len) = patch.span();
            if !frame.has(offset, len) {
                return Err(RewriteError::OutOfBounds { offset });
            }
        }

        for (applied, slot) in self.patches.iter().enumerate() {
            let Some(patch) = slot else { continue };
            if let Err(error) = patch.apply(frame) {
                let restored = self.rollback(frame, applied);
                return Err(RewriteError::Store { error, restored });
            }
        }
        Ok(())
    }

    #[inline(always)]
    fn rollback<F: Frame + ?Sized>(&self, frame: &mut F, applied: usize) -> bool {
        let mut restored = true;
        for patch in self.patches[..applied].iter().rev().flatten() {
            if patch.revert(frame).is_err() {
                restored = false;
            }
        }
        restored
    }
}

#[inline(always)]
fn load_check<F: Frame + ?Sized>(frame: &F, offset: usize) -> Result<[u8; 2], RewriteError> {
    frame
        .load::<2>(offset)
        .ok_or(RewriteError::OutOfBounds { offset })
}
