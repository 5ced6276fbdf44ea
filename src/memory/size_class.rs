use super::header::HEADER_SIZE;
use super::source::AllocError;

/// Upper bound on the number of size classes a single allocator carries.
///
/// The free-list table is a fixed array of this length so that building an
/// allocator never touches the heap.
pub const MAX_CLASSES: usize = 27;

/// Smallest permitted block shift. A 16-byte block leaves 8 payload bytes,
/// exactly enough for the free-list link.
pub const MIN_BLOCK_SHIFT_LIMIT: u32 = 4;

/// Largest permitted block shift (1 GiB blocks).
pub const MAX_BLOCK_SHIFT_LIMIT: u32 = 30;

/// Index of a size class. Class `i` serves blocks of `2^(min_shift + i)` bytes,
/// header included.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassIndex(u8);

impl ClassIndex {
    #[inline]
    pub fn get(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        if (raw as usize) < MAX_CLASSES {
            Some(Self(raw as u8))
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn raw(self) -> u32 {
        u32::from(self.0)
    }
}

/// Power-of-two size-class table.
///
/// ```text
///   class:      0     1     2    ...   N-1
///   block:    2^min 2^min+1 ...        2^max
///   payload:  block - HEADER_SIZE
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClasses {
    min_shift: u32,
    max_shift: u32,
}

impl SizeClasses {
    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` if the shifts are out of range,
    /// inverted, or describe more than [`MAX_CLASSES`] classes.
    pub fn new(min_shift: u32, max_shift: u32) -> Result<Self, AllocError> {
        if min_shift < MIN_BLOCK_SHIFT_LIMIT {
            return Err(AllocError::InvalidConfig(format!(
                "min_block_shift {min_shift} is below {MIN_BLOCK_SHIFT_LIMIT}"
            )));
        }
        if max_shift > MAX_BLOCK_SHIFT_LIMIT {
            return Err(AllocError::InvalidConfig(format!(
                "max_block_shift {max_shift} exceeds {MAX_BLOCK_SHIFT_LIMIT}"
            )));
        }
        if min_shift > max_shift {
            return Err(AllocError::InvalidConfig(format!(
                "min_block_shift {min_shift} is greater than max_block_shift {max_shift}"
            )));
        }
        let count = (max_shift - min_shift + 1) as usize;
        if count > MAX_CLASSES {
            return Err(AllocError::InvalidConfig(format!(
                "{count} size classes requested, at most {MAX_CLASSES} supported"
            )));
        }
        Ok(Self {
            min_shift,
            max_shift,
        })
    }

    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        (self.max_shift - self.min_shift + 1) as usize
    }

    /// Total block size for `class`, header included.
    #[inline]
    pub fn block_size(&self, class: ClassIndex) -> usize {
        debug_assert!(class.get() < self.len());
        1usize << (self.min_shift as usize + class.get())
    }

    /// Bytes the caller may use in a block of `class`.
    #[inline]
    pub fn usable_size(&self, class: ClassIndex) -> usize {
        self.block_size(class) - HEADER_SIZE
    }

    /// Largest payload served from a free list.
    #[inline]
    pub fn max_pooled_size(&self) -> usize {
        (1usize << self.max_shift) - HEADER_SIZE
    }

    /// Smallest class whose block holds `size` payload bytes plus the header,
    /// or `None` when the request belongs on the fallback path.
    #[inline]
    pub fn classify(&self, size: usize) -> Option<ClassIndex> {
        let total = size.checked_add(HEADER_SIZE)?;
        if total > 1usize << self.max_shift {
            return None;
        }
        let shift = total.next_power_of_two().trailing_zeros().max(self.min_shift);
        Some(ClassIndex((shift - self.min_shift) as u8))
    }

    #[inline]
    pub(crate) fn contains(&self, class: ClassIndex) -> bool {
        class.get() < self.len()
    }
}

impl Default for SizeClasses {
    fn default() -> Self {
        Self {
            min_shift: 5,
            max_shift: 17,
        }
    }
}
