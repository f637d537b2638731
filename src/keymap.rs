//! Filepath: src/keymap.rs
//!
//! Fixed-capacity sorted key map stored inline in a tree node.
//!
//! # Layout
//!
//! ```text
//! data: [ slot 0 | slot 1 | ... | slot n-1 | free ... | kv n-1 | ... | kv 0 ]
//!         ^0                      ^free_space_start   ^free_space_end       ^CAP
//! ```
//!
//! Each slot is 4 bytes, `(key_offset: u16, key_size: u16)` little-endian,
//! kept sorted by key. A slot points into the data region, which grows toward
//! lower addresses from `CAP`. The value (`size_of::<V>()` bytes) is stored
//! right after the key bytes.
//!
//! # Torn Reads
//!
//! Optimistic readers look at a map while a writer may be changing it, so
//! every field is atomic: the counters are `AtomicU16` and the arena is a run
//! of `AtomicU8`. Readers copy bytes out with relaxed loads before comparing
//! or decoding them, and writers store with relaxed stores while holding the
//! node's write lock. The node version orders the two sides.
//!
//! Every accessor also bounds-checks offsets against `CAP` and returns `None`
//! (or a clamped index) on nonsense. The caller's version check then discards
//! the result.

use std::cmp::Ordering as CmpOrdering;
use std::fmt as StdFmt;
use std::marker::PhantomData;
use std::mem::{MaybeUninit, size_of};
use std::ops::Range;
use std::sync::atomic::{AtomicU8, AtomicU16};

use crate::ordering::RELAXED;

/// Bytes per slot in the sorted index.
pub const SLOT_SIZE: usize = 4;

const SLOT_STEP: u16 = 4;

// ============================================================================
//  SlotValue
// ============================================================================

/// Fixed-size value stored inline next to its key.
///
/// # Safety
/// Every bit pattern of `size_of::<Self>()` bytes must be a valid `Self`, and
/// `Self` must have no padding bytes. Values are stored and loaded byte by
/// byte, and optimistic readers may assemble one from a write in progress.
pub unsafe trait SlotValue: Copy + 'static {}

macro_rules! impl_slot_value {
    ($($t:ty),* $(,)?) => {
        $(
            // SAFETY: plain integers accept every bit pattern.
            unsafe impl SlotValue for $t {}
        )*
    };
}

impl_slot_value!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);

// SAFETY: raw pointers accept every bit pattern. Dereferencing is the
// caller's business.
unsafe impl<T: 'static> SlotValue for *mut T {}

// SAFETY: as above.
unsafe impl<T: 'static> SlotValue for *const T {}

// ============================================================================
//  KeyMap
// ============================================================================

/// Sorted `key -> V` map in a `CAP`-byte arena.
///
/// Reads take `&self` and may run concurrently with a writer. Mutators also
/// take `&self`; the caller must hold the owning node's write lock (or own a
/// map no other thread can see).
#[repr(C)]
pub struct KeyMap<V: SlotValue, const CAP: usize> {
    size: AtomicU16,
    free_space_start: AtomicU16,
    free_space_end: AtomicU16,
    data: [AtomicU8; CAP],
    _marker: PhantomData<V>,
}

impl<V: SlotValue, const CAP: usize> KeyMap<V, CAP> {
    const CAP_FITS_U16: () = assert!(CAP <= u16::MAX as usize, "KeyMap capacity must fit in u16");

    const VALUE_SIZE: usize = size_of::<V>();

    #[expect(clippy::cast_possible_truncation, reason = "checked by CAP_FITS_U16")]
    const END: u16 = CAP as u16;

    /// An empty map.
    #[must_use]
    pub const fn new() -> Self {
        let () = Self::CAP_FITS_U16;

        Self {
            size: AtomicU16::new(0),
            free_space_start: AtomicU16::new(0),
            free_space_end: AtomicU16::new(Self::END),
            data: [const { AtomicU8::new(0) }; CAP],
            _marker: PhantomData,
        }
    }

    // ========================================================================
    //  Size Accessors
    // ========================================================================

    /// Number of entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.size.load(RELAXED) as usize
    }

    /// True when the map holds no entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn fss(&self) -> usize {
        self.free_space_start.load(RELAXED) as usize
    }

    #[inline]
    fn fse(&self) -> usize {
        self.free_space_end.load(RELAXED) as usize
    }

    /// Bytes consumed by keys and values (the data region).
    #[inline]
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        CAP.saturating_sub(self.fse())
    }

    /// Bytes between the slot index and the data region.
    #[inline]
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.fse().saturating_sub(self.fss())
    }

    /// True if a key of `key_len` bytes, its value and one slot still fit.
    #[inline]
    #[must_use]
    pub fn enough_space(&self, key_len: usize) -> bool {
        self.free_bytes() >= key_len + Self::VALUE_SIZE + SLOT_SIZE
    }

    /// Entry count clamped to what the slot index could physically hold.
    #[inline]
    fn bounded_len(&self) -> usize {
        let slots: usize = self.fss().min(CAP) / SLOT_SIZE;
        self.len().min(slots)
    }

    // ========================================================================
    //  Byte Access
    // ========================================================================

    #[inline]
    fn byte(&self, at: usize) -> Option<u8> {
        self.data.get(at).map(|b| b.load(RELAXED))
    }

    #[inline]
    fn set_byte(&self, at: usize, value: u8) {
        if let Some(b) = self.data.get(at) {
            b.store(value, RELAXED);
        }
    }

    /// Copy `range` out of the arena.
    fn read_bytes(&self, range: Range<usize>) -> Option<Vec<u8>> {
        let cells: &[AtomicU8] = self.data.get(range)?;

        Some(cells.iter().map(|b| b.load(RELAXED)).collect())
    }

    fn write_bytes(&self, at: usize, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            self.set_byte(at + i, b);
        }
    }

    /// `memmove` within the arena.
    fn move_bytes(&self, src: Range<usize>, dest: usize) {
        let len: usize = src.len();

        if dest > src.start {
            for i in (0..len).rev() {
                self.set_byte(dest + i, self.byte(src.start + i).unwrap_or(0));
            }
        } else {
            for i in 0..len {
                self.set_byte(dest + i, self.byte(src.start + i).unwrap_or(0));
            }
        }
    }

    // ========================================================================
    //  Entry Accessors
    // ========================================================================

    /// `(key_offset, key_size)` of slot `index`.
    #[inline]
    fn slot(&self, index: usize) -> Option<(usize, usize)> {
        let at: usize = index.checked_mul(SLOT_SIZE)?;
        let offset: u16 = u16::from_le_bytes([self.byte(at)?, self.byte(at + 1)?]);
        let size: u16 = u16::from_le_bytes([self.byte(at + 2)?, self.byte(at + 3)?]);

        Some((offset as usize, size as usize))
    }

    #[inline]
    fn set_slot(&self, index: usize, offset: usize, size: usize) {
        let at: usize = index * SLOT_SIZE;
        let offset: u16 = u16::try_from(offset).unwrap_or(u16::MAX);
        let size: u16 = u16::try_from(size).unwrap_or(u16::MAX);

        self.write_bytes(at, &offset.to_le_bytes());
        self.write_bytes(at + 2, &size.to_le_bytes());
    }

    /// Bounds-checked key range of entry `index`.
    #[inline]
    fn key_range(&self, index: usize) -> Option<Range<usize>> {
        if index >= self.bounded_len() {
            return None;
        }
        let (offset, size) = self.slot(index)?;
        let end: usize = offset.checked_add(size)?;

        (end <= CAP).then_some(offset..end)
    }

    /// Copy of the key bytes of entry `index`.
    #[inline]
    #[must_use]
    pub fn key_at(&self, index: usize) -> Option<Vec<u8>> {
        self.read_bytes(self.key_range(index)?)
    }

    /// Order of entry `index`'s key relative to `key`.
    #[must_use]
    pub fn compare_at(&self, index: usize, key: &[u8]) -> Option<CmpOrdering> {
        let range: Range<usize> = self.key_range(index)?;
        let stored_len: usize = range.len();

        for (i, &wanted) in key.iter().take(stored_len).enumerate() {
            let stored: u8 = self.byte(range.start + i)?;
            match stored.cmp(&wanted) {
                CmpOrdering::Equal => {}
                other => return Some(other),
            }
        }

        Some(stored_len.cmp(&key.len()))
    }

    /// Value of entry `index`.
    #[inline]
    #[must_use]
    pub fn value_at(&self, index: usize) -> Option<V> {
        let start: usize = self.key_range(index)?.end;
        let cells: &[AtomicU8] = self.data.get(start..start.checked_add(Self::VALUE_SIZE)?)?;

        let mut out: MaybeUninit<V> = MaybeUninit::uninit();
        let dst: *mut u8 = out.as_mut_ptr().cast::<u8>();
        for (i, cell) in cells.iter().enumerate() {
            // SAFETY: `i < size_of::<V>()`, inside `out`.
            unsafe { dst.add(i).write(cell.load(RELAXED)) };
        }

        // SAFETY: every byte was written above, and SlotValue accepts any bit
        // pattern.
        Some(unsafe { out.assume_init() })
    }

    fn write_value(&self, at: usize, value: V) {
        let src: *const u8 = (&raw const value).cast::<u8>();

        for i in 0..Self::VALUE_SIZE {
            // SAFETY: `i < size_of::<V>()`, and SlotValue types have no padding.
            self.set_byte(at + i, unsafe { src.add(i).read() });
        }
    }

    /// Key and value of entry `index`.
    #[inline]
    #[must_use]
    pub fn entry_at(&self, index: usize) -> Option<(Vec<u8>, V)> {
        Some((self.key_at(index)?, self.value_at(index)?))
    }

    /// Iterate over copies of the entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (Vec<u8>, V)> + '_ {
        (0..self.bounded_len()).filter_map(|i| self.entry_at(i))
    }

    // ========================================================================
    //  Search
    // ========================================================================

    /// Index of the first entry whose key is `>= key`, in `[0, len]`.
    #[must_use]
    pub fn find_lower(&self, key: &[u8]) -> usize {
        let mut low: usize = 0;
        let mut high: usize = self.bounded_len();

        while low < high {
            let mid: usize = low + (high - low) / 2;

            // A torn slot compares as Greater; validation catches it.
            let ord: CmpOrdering = self.compare_at(mid, key).unwrap_or(CmpOrdering::Greater);

            if ord == CmpOrdering::Less {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        low
    }

    /// Index of the entry whose key equals `key`.
    #[must_use]
    pub fn find(&self, key: &[u8]) -> Option<usize> {
        let index: usize = self.find_lower(key);

        (self.compare_at(index, key)? == CmpOrdering::Equal).then_some(index)
    }

    /// Value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<V> {
        self.value_at(self.find(key)?)
    }

    // ========================================================================
    //  Mutation (write lock held)
    // ========================================================================

    /// Insert `key -> value` at slot `index`.
    ///
    /// # Panics
    /// If `index > len()` or there is not [`enough_space`](Self::enough_space).
    pub fn insert_key_value(&self, index: usize, key: &[u8], value: V) {
        assert!(index <= self.len(), "insert index {index} out of bounds");
        assert!(self.enough_space(key.len()), "key map overflow");

        let fss: usize = self.fss();
        let slot_at: usize = index * SLOT_SIZE;

        // Open a gap in the slot index.
        self.move_bytes(slot_at..fss, slot_at + SLOT_SIZE);

        let offset: usize = self.fse() - key.len() - Self::VALUE_SIZE;
        self.write_bytes(offset, key);
        self.write_value(offset + key.len(), value);
        self.set_slot(index, offset, key.len());

        self.size.fetch_add(1, RELAXED);
        self.free_space_start.fetch_add(SLOT_STEP, RELAXED);
        self.free_space_end
            .store(u16::try_from(offset).unwrap_or(0), RELAXED);
    }

    /// Append `key -> value` after the last entry.
    ///
    /// The caller keeps keys sorted.
    pub fn push(&self, key: &[u8], value: V) {
        self.insert_key_value(self.len(), key, value);
    }

    /// Remove entry `index` and compact the data region.
    ///
    /// # Panics
    /// If `index >= len()`.
    pub fn remove_at(&self, index: usize) {
        assert!(index < self.len(), "remove index {index} out of bounds");

        let Some((offset, size)) = self.slot(index) else {
            return;
        };
        let entry_len: usize = size + Self::VALUE_SIZE;
        let fse: usize = self.fse();

        // Slide the bytes stored below the removed entry up over it.
        self.move_bytes(fse..offset, fse + entry_len);

        for i in 0..self.len() {
            if let Some((other_offset, other_size)) = self.slot(i) {
                if other_offset < offset {
                    self.set_slot(i, other_offset + entry_len, other_size);
                }
            }
        }

        let fss: usize = self.fss();
        let slot_at: usize = index * SLOT_SIZE;
        self.move_bytes(slot_at + SLOT_SIZE..fss, slot_at);

        self.size.fetch_sub(1, RELAXED);
        self.free_space_start.fetch_sub(SLOT_STEP, RELAXED);
        self.free_space_end
            .store(u16::try_from(fse + entry_len).unwrap_or(u16::MAX), RELAXED);
    }

    /// Remove and return the last entry.
    pub fn pop_last(&self) -> Option<(Vec<u8>, V)> {
        let last: usize = self.len().checked_sub(1)?;
        let entry: (Vec<u8>, V) = self.entry_at(last)?;

        self.remove_at(last);
        Some(entry)
    }

    /// Drop every entry. The arena bytes are left as they are.
    fn clear(&self) {
        self.size.store(0, RELAXED);
        self.free_space_start.store(0, RELAXED);
        self.free_space_end.store(Self::END, RELAXED);
    }

    /// Move the upper half of the entries (by byte size) into the empty
    /// `other`, then compact this map.
    ///
    /// Entries are accumulated from the low end until half of
    /// [`used_bytes`](Self::used_bytes) is reached. Both sides keep at least
    /// one entry.
    ///
    /// # Panics
    /// If `other` is not empty or this map has fewer than two entries.
    pub fn split(&self, other: &Self) {
        assert!(other.is_empty(), "split target must be empty");
        assert!(self.len() >= 2, "cannot split a map with {} entries", self.len());

        let entries: Vec<(Vec<u8>, V)> = self.iter().collect();
        let half: usize = self.used_bytes() / 2;
        let mut accumulated: usize = 0;
        let mut boundary: usize = entries.len();

        for (i, (key, _)) in entries.iter().enumerate() {
            accumulated += key.len() + Self::VALUE_SIZE;
            if accumulated >= half {
                boundary = i + 1;
                break;
            }
        }
        let boundary: usize = boundary.clamp(1, entries.len() - 1);

        for (key, value) in &entries[boundary..] {
            other.push(key, *value);
        }

        self.clear();
        for (key, value) in &entries[..boundary] {
            self.push(key, *value);
        }
    }

    /// [`split`](Self::split), then pop the last entry of this (left) map and
    /// return it for promotion to the parent.
    ///
    /// # Panics
    /// If this map has fewer than three entries.
    pub fn split_with_key(&self, other: &Self) -> (Vec<u8>, V) {
        assert!(self.len() >= 3, "inner split needs at least three entries");

        self.split(other);
        if self.len() < 2 {
            // Keep one entry on the left after the pop.
            if let Some((key, value)) = other.entry_at(0) {
                other.remove_at(0);
                self.push(&key, value);
            }
        }

        match self.pop_last() {
            Some(promoted) => promoted,
            None => unreachable!("left side holds at least two entries"),
        }
    }
}

impl<V: SlotValue, const CAP: usize> Default for KeyMap<V, CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: SlotValue, const CAP: usize> StdFmt::Debug for KeyMap<V, CAP> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("KeyMap")
            .field("size", &self.len())
            .field("free_space_start", &self.fss())
            .field("free_space_end", &self.fse())
            .field("capacity", &CAP)
            .finish_non_exhaustive()
    }
}
