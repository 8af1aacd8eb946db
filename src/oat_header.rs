//! Raw access to the key-value store fields of ART's `OatHeader`.
//!
//! The offsets must match the `OatHeader` layout of the ART module the compiler was built from.
//! Accessor names intentionally differ from ART's own methods, which are hook targets.

use std::ptr::NonNull;

/// Offsets of the key-value store fields inside `OatHeader`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OatHeaderLayout {
    pub key_value_store_size_offset: usize,
    pub key_value_store_offset: usize,
}

impl OatHeaderLayout {
    /// Layout of current ART releases: 17 `uint32_t`-sized fields, the store size, then the
    /// store itself as trailing data.
    pub const CURRENT: OatHeaderLayout = OatHeaderLayout {
        key_value_store_size_offset: 68,
        key_value_store_offset: 72,
    };
}

impl Default for OatHeaderLayout {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// View of an `OatHeader` owned by the host process.
#[derive(Copy, Clone, Debug)]
pub struct OatHeader {
    base: NonNull<u8>,
    layout: OatHeaderLayout,
}

impl OatHeader {
    /// # Safety
    ///
    /// `header` must point to a live `OatHeader` laid out as described by `layout`, and must stay
    /// valid for as long as the returned view is used.
    pub unsafe fn from_raw(header: *const libc::c_void, layout: OatHeaderLayout) -> Option<Self> {
        NonNull::new(header as *mut u8).map(|base| OatHeader { base, layout })
    }

    pub fn key_value_store_size(&self) -> u32 {
        // SAFETY: The field lies inside the header, as guaranteed by the caller of `from_raw`.
        // The header is only 4-byte aligned in the output buffer.
        unsafe {
            self.base
                .as_ptr()
                .add(self.layout.key_value_store_size_offset)
                .cast::<u32>()
                .read_unaligned()
        }
    }

    pub fn key_value_store(&self) -> *mut u8 {
        // SAFETY: The store starts inside the header allocation, see `from_raw`.
        unsafe { self.base.as_ptr().add(self.layout.key_value_store_offset) }
    }

    pub fn set_key_value_store_size(&mut self, size: u32) {
        // SAFETY: See `key_value_store_size`.
        unsafe {
            self.base
                .as_ptr()
                .add(self.layout.key_value_store_size_offset)
                .cast::<u32>()
                .write_unaligned(size)
        }
    }
}
