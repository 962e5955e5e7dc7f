#![no_std]
#![no_main]

use aya_ebpf::bindings::{BPF_F_MARK_MANGLED_0, BPF_F_PSEUDO_HDR, TC_ACT_OK};
use aya_ebpf::cty::c_long;
use aya_ebpf::macros::classifier;
use aya_ebpf::programs::TcContext;
use l4_redirect_common::{
    try_redirect, ChecksumKind, ChecksumUpdate, Frame, PolicyKey, PolicyLookup, PolicyValue,
    StoreError, Verdict, STAT_PASSED, STAT_REWRITE_FAILED, STAT_REWRITTEN,
};

mod maps;

use maps::{POLICY, STATS};

/// TC ingress hook. Frames are never dropped: the return value is always
/// `TC_ACT_OK`, rewritten or not.
#[classifier]
pub fn l4_redirect_ingress(mut ctx: TcContext) -> i32 {
    let slot = match try_redirect(&mut SkbFrame(&mut ctx), &PolicyMap) {
        Ok(Verdict::ForwardRewritten) => STAT_REWRITTEN,
        Ok(Verdict::ForwardUnmodified) => STAT_PASSED,
        Err(_) => STAT_REWRITE_FAILED,
    };
    bump(slot);
    TC_ACT_OK
}

/// Socket buffer access through the load/store helpers, which do their own
/// range checks and also reach non-linear data.
struct SkbFrame<'a>(&'a mut TcContext);

impl Frame for SkbFrame<'_> {
    #[inline(always)]
    fn len(&self) -> usize {
        self.0.len() as usize
    }

    #[inline(always)]
    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        self.0.load::<[u8; N]>(offset).ok()
    }

    #[inline(always)]
    fn store<const N: usize>(&mut self, offset: usize, bytes: [u8; N]) -> Result<(), StoreError> {
        // Checksums, skb->csum included, are kept by the csum_replace
        // helpers, so the bytes go in as they are.
        self.0
            .store(offset, &bytes, 0)
            .map_err(|code| store_error(offset, code))
    }

    #[inline(always)]
    fn update_checksum(&mut self, update: &ChecksumUpdate) -> Result<(), StoreError> {
        csum_replace(self.0, update)
    }

    #[inline(always)]
    fn revert_checksum(
        &mut self,
        update: &ChecksumUpdate,
        _saved: [u8; 2],
    ) -> Result<(), StoreError> {
        // The saved bytes are only meaningful for a finished checksum. Undo
        // by delta so the kernel applies it to whatever state the skb is in.
        csum_replace(self.0, &update.inverse())
    }
}

/// Folds a field change into a checksum through the kernel, which knows
/// whether the L4 checksum is finished or left for the device to complete.
#[inline(always)]
fn csum_replace(ctx: &TcContext, update: &ChecksumUpdate) -> Result<(), StoreError> {
    // The helpers take field values as they sit in the packet.
    let (from, to) = if update.size == 2 {
        (
            (update.from as u16).to_be() as u64,
            (update.to as u16).to_be() as u64,
        )
    } else {
        (update.from.to_be() as u64, update.to.to_be() as u64)
    };
    let result = match update.kind {
        ChecksumKind::L3 => ctx.l3_csum_replace(update.offset, from, to, update.size as u64),
        ChecksumKind::L4 { pseudo, udp } => {
            let mut flags = update.size as u64;
            if pseudo {
                flags |= BPF_F_PSEUDO_HDR as u64;
            }
            if udp {
                flags |= BPF_F_MARK_MANGLED_0 as u64;
            }
            ctx.l4_csum_replace(update.offset, from, to, flags)
        }
    };
    result.map_err(|code| store_error(update.offset, code))
}

#[inline(always)]
fn store_error(offset: usize, code: c_long) -> StoreError {
    StoreError {
        offset,
        code: code as i64,
    }
}

struct PolicyMap;

impl PolicyLookup for PolicyMap {
    #[inline(always)]
    fn lookup(&self, key: &PolicyKey) -> Option<PolicyValue> {
        // The value is copied out; a concurrent update replaces the element
        // rather than mutating it.
        unsafe { POLICY.get(key) }.copied()
    }
}

#[inline(always)]
fn bump(slot: u32) {
    if let Some(ptr) = STATS.get_ptr_mut(slot) {
        unsafe {
            *ptr = (*ptr).wrapping_add(1);
        }
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
