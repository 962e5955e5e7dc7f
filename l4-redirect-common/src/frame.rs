use crate::checksum::{replace_u16, replace_u32};

/// Failure reported by the primitive that writes into a frame.
///
/// `code` is whatever the backing store reports; the socket buffer helpers
/// return a negative errno.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StoreError {
    pub offset: usize,
    pub code: i64,
}

/// Checksum a field change is folded into.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChecksumKind {
    /// IPv4 header checksum.
    L3,
    /// TCP or UDP checksum. `pseudo` marks fields covered through the
    /// pseudo-header; `udp` applies the RFC 768 zero rules: a zero field is
    /// left alone and a result of zero is written as `0xffff`.
    L4 { pseudo: bool, udp: bool },
}

/// Replacement of one 2- or 4-byte field, to be folded into the checksum at
/// `offset`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChecksumUpdate {
    pub offset: usize,
    pub kind: ChecksumKind,
    pub size: u8,
    pub from: u32,
    pub to: u32,
}

impl ChecksumUpdate {
    /// The update that undoes this one.
    #[inline(always)]
    pub const fn inverse(self) -> Self {
        Self {
            from: self.to,
            to: self.from,
            ..self
        }
    }
}

/// Bounded read/write window over the bytes of one packet.
///
/// Every access names a fixed-size field at an offset. Implementations must
/// return `None` (or an error) instead of touching anything at or beyond
/// [`Frame::len`].
pub trait Frame {
    fn len(&self) -> usize;

    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]>;

    fn store<const N: usize>(&mut self, offset: usize, bytes: [u8; N]) -> Result<(), StoreError>;

    /// Folds `update` into its checksum field.
    ///
    /// The default treats the field as a finished checksum and patches it
    /// with RFC 1624 arithmetic. Socket buffers override this with the
    /// kernel helpers, which also handle partially offloaded checksums.
    #[inline(always)]
    fn update_checksum(&mut self, update: &ChecksumUpdate) -> Result<(), StoreError> {
        let offset = update.offset;
        let check = self
            .load_be16(offset)
            .ok_or(StoreError { offset, code: -1 })?;
        let udp = matches!(update.kind, ChecksumKind::L4 { udp: true, .. });
        if udp && check == 0 {
            return Ok(());
        }
        let mut next = if update.size == 2 {
            replace_u16(check, update.from as u16, update.to as u16)
        } else {
            replace_u32(check, update.from, update.to)
        };
        if udp && next == 0 {
            next = 0xffff;
        }
        self.store(offset, next.to_be_bytes())
    }

    /// Undoes an update made by [`Frame::update_checksum`]. `saved` is the
    /// checksum field as it was before any update of the rewrite; the
    /// default writes it back.
    #[inline(always)]
    fn revert_checksum(
        &mut self,
        update: &ChecksumUpdate,
        saved: [u8; 2],
    ) -> Result<(), StoreError> {
        self.store(update.offset, saved)
    }

    #[inline(always)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    fn has(&self, offset: usize, len: usize) -> bool {
        match offset.checked_add(len) {
            Some(end) => end <= self.len(),
            None => false,
        }
    }

    #[inline(always)]
    fn load_u8(&self, offset: usize) -> Option<u8> {
        self.load::<1>(offset).map(|[b]| b)
    }

    #[inline(always)]
    fn load_be16(&self, offset: usize) -> Option<u16> {
        self.load::<2>(offset).map(u16::from_be_bytes)
    }
}

impl Frame for [u8] {
    #[inline(always)]
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    #[inline(always)]
    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let end = offset.checked_add(N)?;
        self.get(offset..end)?.try_into().ok()
    }

    #[inline(always)]
    fn store<const N: usize>(&mut self, offset: usize, bytes: [u8; N]) -> Result<(), StoreError> {
        let field = offset
            .checked_add(N)
            .and_then(|end| self.get_mut(offset..end))
            .ok_or(StoreError { offset, code: -1 })?;
        field.copy_from_slice(&bytes);
        Ok(())
    }
}
