//! Codec for the key-value store embedded in OAT headers.
//!
//! The store is a packed sequence of `key\0value\0` entries. Its length is held by the enclosing
//! header and may include trailing zero padding. When the compiler runs in deterministic mode,
//! entries for fields whose content varies between runs are followed by zero padding as well, so
//! that the header keeps a fixed size.
//!
//! All scanning goes through [`Cursor`], which never looks outside the slice it was given. A store
//! that cannot be parsed within its bound is reported as a [`StoreError`] and left untouched.

use std::ops::Range;

use tracing::{debug, info, warn};

use crate::cmdline;

/// Key holding the compiler's command line.
pub const CMDLINE_KEY: &str = "dex2oat-cmdline";

/// Keys whose values may be followed by zero padding.
pub const NON_DETERMINISTIC_KEYS: [&str; 3] =
    [CMDLINE_KEY, "apex-versions", "bootclasspath-checksums"];

/// Length of the zero run taken as the end of a store whose size is not known.
pub const BOUNDARY_ZERO_RUN: usize = 3;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key at offset {0} is not terminated within the store")]
    UnterminatedKey(usize),
    #[error("value at offset {0} is not terminated within the store")]
    UnterminatedValue(usize),
    #[error("no zero-run boundary found after offset {0}")]
    NoBoundary(usize),
    #[error("rewritten store needs {needed} bytes but only {available} are available")]
    NoRoom { needed: usize, available: usize },
}

/// How the length of a store slice was obtained.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SizeHint {
    /// The slice is exactly the store, as declared by the header.
    Declared,
    /// The slice is a readable window starting at the store; its end must be discovered.
    Unknown,
}

/// Result of a successful [`spoof`] call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SpoofOutcome {
    /// Nothing to hide, the store was not modified.
    Untouched,
    /// Value rewritten inside its own padding, the store size is unchanged.
    InPlace,
    /// Store re-serialized from its parsed entries.
    Rebuilt { new_size: usize },
    /// Store bytes after the value shifted left within a discovered bound.
    Spliced { new_size: usize },
}

impl SpoofOutcome {
    /// New store size, if the edit changed it.
    pub fn new_size(&self) -> Option<usize> {
        match *self {
            SpoofOutcome::Rebuilt { new_size } | SpoofOutcome::Spliced { new_size } => {
                Some(new_size)
            }
            SpoofOutcome::Untouched | SpoofOutcome::InPlace => None,
        }
    }
}

/// Bounds-checked read cursor over a serialized store.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    /// Index of the first zero byte at or after the cursor.
    fn find_nul(&self) -> Option<usize> {
        self.bytes
            .get(self.pos..)?
            .iter()
            .position(|&b| b == 0)
            .map(|i| self.pos + i)
    }

    /// Advances past a run of zero bytes, returning its length.
    fn skip_zeros(&mut self) -> usize {
        let run = self
            .bytes
            .get(self.pos..)
            .map_or(0, |rest| rest.iter().take_while(|&&b| b == 0).count());
        self.pos += run;
        run
    }

    /// Reads the next entry, or `None` at the end-of-entries sentinel or the end of the slice.
    fn next_entry(&mut self) -> Result<Option<EntrySpan>, StoreError> {
        match self.peek() {
            None | Some(0) => return Ok(None),
            Some(_) => {}
        }

        let key_start = self.pos;
        let key_end = self
            .find_nul()
            .ok_or(StoreError::UnterminatedKey(key_start))?;
        self.pos = key_end + 1;

        let value_start = self.pos;
        let value_end = self
            .find_nul()
            .ok_or(StoreError::UnterminatedValue(value_start))?;
        self.pos = value_end + 1;

        let padding = if is_non_deterministic(&self.bytes[key_start..key_end]) {
            self.skip_zeros()
        } else {
            0
        };

        Ok(Some(EntrySpan {
            key: key_start..key_end,
            value: value_start..value_end,
            padding,
        }))
    }
}

/// Location of one entry. `value.end` is the index of the value's terminator.
#[derive(Clone, Debug)]
struct EntrySpan {
    key: Range<usize>,
    value: Range<usize>,
    padding: usize,
}

impl EntrySpan {
    fn is_spoof_target(&self, bytes: &[u8]) -> bool {
        &bytes[self.key.clone()] == CMDLINE_KEY.as_bytes()
            && cmdline::contains_injected_flag(&bytes[self.value.clone()])
    }
}

fn is_non_deterministic(key: &[u8]) -> bool {
    NON_DETERMINISTIC_KEYS
        .iter()
        .any(|candidate| candidate.as_bytes() == key)
}

/// One parsed entry.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Zero bytes following the value's terminator.
    pub padding: usize,
}

/// Owned, order-preserving model of a store.
///
/// Bytes after the end-of-entries sentinel are kept verbatim as the tail, so that serializing a
/// parsed record reproduces its input exactly.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KeyValueRecord {
    entries: Vec<Entry>,
    tail: Vec<u8>,
}

impl KeyValueRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a store occupying all of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut cursor = Cursor::new(bytes);
        let mut entries = Vec::new();
        while let Some(span) = cursor.next_entry()? {
            entries.push(Entry {
                key: bytes[span.key].to_vec(),
                value: bytes[span.value].to_vec(),
                padding: span.padding,
            });
        }
        let tail = bytes.get(cursor.pos..).unwrap_or_default().to_vec();
        Ok(KeyValueRecord { entries, tail })
    }

    /// Appends an unpadded entry.
    pub fn push(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.push_padded(key, value, 0);
    }

    /// Appends an entry followed by `padding` zero bytes.
    pub fn push_padded(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        padding: usize,
    ) {
        self.entries.push(Entry {
            key: key.into(),
            value: value.into(),
            padding,
        });
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|entry| entry.key == key.as_bytes())
            .map(|entry| entry.value.as_slice())
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn tail(&self) -> &[u8] {
        &self.tail
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn serialized_len(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.key.len() + 1 + entry.value.len() + 1 + entry.padding)
            .sum::<usize>()
            + self.tail.len()
    }

    /// Serializes into the start of `out` and zeroes the rest of it.
    /// Returns the serialized length.
    pub fn write_to(&self, out: &mut [u8]) -> Result<usize, StoreError> {
        let needed = self.serialized_len();
        if needed > out.len() {
            return Err(StoreError::NoRoom {
                needed,
                available: out.len(),
            });
        }

        out.fill(0);
        let mut pos = 0;
        for entry in &self.entries {
            out[pos..pos + entry.key.len()].copy_from_slice(&entry.key);
            pos += entry.key.len() + 1;
            out[pos..pos + entry.value.len()].copy_from_slice(&entry.value);
            pos += entry.value.len() + 1 + entry.padding;
        }
        out[pos..pos + self.tail.len()].copy_from_slice(&self.tail);
        Ok(needed)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0; self.serialized_len()];
        // Cannot fail, the buffer has exactly the serialized length.
        let _ = self.write_to(&mut bytes);
        bytes
    }
}

/// Removes the traces of the launcher from the command line entry of a store.
///
/// With [`SizeHint::Declared`], `store` is the whole store. The value is rewritten inside its
/// padding if it has any, otherwise the store is rebuilt with a smaller size.
///
/// With [`SizeHint::Unknown`], `store` is a readable window starting at the store. The value is
/// rewritten in place if padded, otherwise the end of the store is located by a run of
/// [`BOUNDARY_ZERO_RUN`] zero bytes and the following bytes are shifted left.
///
/// On error, `store` is left unmodified.
pub fn spoof(
    store: &mut [u8],
    hint: SizeHint,
    original_path: &str,
) -> Result<SpoofOutcome, StoreError> {
    debug!(len = store.len(), ?hint, "parsing key-value store");
    match hint {
        SizeHint::Declared => spoof_declared(store, original_path),
        SizeHint::Unknown => spoof_discovered(store, original_path),
    }
}

fn spoof_declared(store: &mut [u8], original_path: &str) -> Result<SpoofOutcome, StoreError> {
    let mut cursor = Cursor::new(store);
    let mut spans = Vec::new();
    while let Some(span) = cursor.next_entry()? {
        spans.push(span);
    }
    let end = cursor.pos;

    let Some(index) = spans.iter().position(|span| span.is_spoof_target(store)) else {
        return Ok(SpoofOutcome::Untouched);
    };
    let target = spans[index].clone();
    let Some(sanitized) = cmdline::sanitize(&store[target.value.clone()], original_path) else {
        return Ok(SpoofOutcome::Untouched);
    };
    info!(
        original_len = target.value.len(),
        new_len = sanitized.len(),
        "spoofing command line"
    );

    if target.padding > 0
        && write_in_place(
            store,
            target.value.clone(),
            target.value.len() + target.padding,
            &sanitized,
        )
    {
        info!("command line rewritten inside its padding");
        return Ok(SpoofOutcome::InPlace);
    }

    let mut record = KeyValueRecord {
        entries: spans
            .iter()
            .map(|span| Entry {
                key: store[span.key.clone()].to_vec(),
                value: store[span.value.clone()].to_vec(),
                padding: span.padding,
            })
            .collect(),
        tail: store[end..].to_vec(),
    };
    record.entries[index].value = sanitized;
    let new_size = record.write_to(store)?;
    info!(new_size, "key-value store rebuilt");
    Ok(SpoofOutcome::Rebuilt { new_size })
}

fn spoof_discovered(window: &mut [u8], original_path: &str) -> Result<SpoofOutcome, StoreError> {
    let mut cursor = Cursor::new(window);
    let target = loop {
        match cursor.next_entry()? {
            None => return Ok(SpoofOutcome::Untouched),
            Some(span) if span.is_spoof_target(window) => break span,
            Some(_) => {}
        }
    };
    let Some(sanitized) = cmdline::sanitize(&window[target.value.clone()], original_path) else {
        return Ok(SpoofOutcome::Untouched);
    };

    // Padding may run past the end of the store here, only the value itself is safe to use.
    if target.padding > 0
        && write_in_place(window, target.value.clone(), target.value.len(), &sanitized)
    {
        info!("command line rewritten inside its padding");
        return Ok(SpoofOutcome::InPlace);
    }

    let end = find_zero_run(window, target.value.end)
        .ok_or(StoreError::NoBoundary(target.value.end))?
        + 1;
    let old_len = target.value.len();
    if sanitized.len() > old_len {
        warn!(old_len, new_len = sanitized.len(), "sanitized command line does not fit");
        return Err(StoreError::NoRoom {
            needed: end - old_len + sanitized.len(),
            available: end,
        });
    }
    let delta = old_len - sanitized.len();

    let value_start = target.value.start;
    window[value_start..value_start + sanitized.len()].copy_from_slice(&sanitized);
    window.copy_within(target.value.end..end, value_start + sanitized.len());
    window[end - delta..end].fill(0);

    let new_size = end - delta;
    info!(discovered_end = end, new_size, "key-value store spliced");
    Ok(SpoofOutcome::Spliced { new_size })
}

/// Overwrites a value with `sanitized` if it fits in `capacity` bytes plus a terminator.
fn write_in_place(
    store: &mut [u8],
    value: Range<usize>,
    capacity: usize,
    sanitized: &[u8],
) -> bool {
    if sanitized.len() > capacity {
        return false;
    }
    store[value.start..value.start + capacity + 1].fill(0);
    store[value.start..value.start + sanitized.len()].copy_from_slice(sanitized);
    true
}

/// Start of the first run of [`BOUNDARY_ZERO_RUN`] zero bytes at or after `from`.
fn find_zero_run(bytes: &[u8], from: usize) -> Option<usize> {
    bytes
        .get(from..)?
        .windows(BOUNDARY_ZERO_RUN)
        .position(|window| window.iter().all(|&b| b == 0))
        .map(|i| from + i)
}
