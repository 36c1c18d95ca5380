//! Row and table model shared by every stage of the pipeline.

pub type Key = u32;
pub type Payload = u32;

/// A fixed-size `(key, payload)` pair. Eight rows fill one cache line.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(C)]
pub struct Row {
    pub key: Key,
    pub payload: Payload,
}

impl Row {
    /// Row produced by pre-faulting a buffer with the byte pattern `0x2A`.
    pub const FILL: Self = Self {
        key: 0x2A2A_2A2A,
        payload: 0x2A2A_2A2A,
    };

    #[inline(always)]
    pub const fn new(key: Key, payload: Payload) -> Self {
        Self { key, payload }
    }
}

/// One materialized join match.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(C)]
pub struct OutputTriple {
    pub key: Key,
    pub r_payload: Payload,
    pub s_payload: Payload,
}

/// An owned relation.
///
/// The join engine only ever borrows `rows`; `sorted` and `hole_ratio` are
/// descriptive flags set by the generators.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Table {
    pub rows: Vec<Row>,
    pub sorted: bool,
    pub hole_ratio: u32,
}

impl Table {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows,
            sorted: false,
            hole_ratio: 0,
        }
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (Key, Payload)>) -> Self {
        Self::new(pairs.into_iter().map(|(k, p)| Row::new(k, p)).collect())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[Row] {
        &self.rows
    }

    /// Sorts rows by key and marks the table sorted.
    pub fn sort(&mut self) {
        self.rows.sort_unstable_by_key(|r| r.key);
        self.sorted = true;
    }
}
