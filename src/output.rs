//! Materialization of join results.
//!
//! Two shapes are supported: a per-thread linked list with one heap node per
//! match, and a chunked table that appends into fixed-capacity blocks so that
//! heavy materialization does not allocate per tuple.
use crate::row::{Key, OutputTriple, Payload};

pub const CHUNK_SIZE: usize = 16 * 1024;
pub const TUPLES_PER_CHUNK: usize = (CHUNK_SIZE - 8) / size_of::<OutputTriple>();

/// Destination for the matches a join kernel emits.
pub trait OutputSink {
    fn insert(&mut self, key: Key, r_payload: Payload, s_payload: Payload);
}

/// Sink for count-only joins.
pub struct Discard;

impl OutputSink for Discard {
    #[inline(always)]
    fn insert(&mut self, _key: Key, _r_payload: Payload, _s_payload: Payload) {}
}

/// Which materialization shape a join produces.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputShape {
    LinkedList,
    /// With `prealloc`, each thread allocates its share of the expected
    /// chunks before the join starts.
    Chunked { prealloc: bool },
}

impl Default for OutputShape {
    fn default() -> Self {
        Self::Chunked { prealloc: false }
    }
}

pub struct OutputNode {
    pub triple: OutputTriple,
    next: Option<Box<OutputNode>>,
}

/// Singly linked list of matches, newest first.
#[derive(Default)]
pub struct OutputList {
    head: Option<Box<OutputNode>>,
    len: usize,
}

impl OutputList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn iter(&self) -> ListIter<'_> {
        ListIter {
            next: self.head.as_deref(),
        }
    }
}

impl OutputSink for OutputList {
    fn insert(&mut self, key: Key, r_payload: Payload, s_payload: Payload) {
        let node = Box::new(OutputNode {
            triple: OutputTriple {
                key,
                r_payload,
                s_payload,
            },
            next: self.head.take(),
        });
        self.head = Some(node);
        self.len += 1;
    }
}

impl Drop for OutputList {
    fn drop(&mut self) {
        // Iterative, long lists would overflow the stack otherwise.
        let mut cur = self.head.take();
        while let Some(mut node) = cur {
            cur = node.next.take();
        }
    }
}

pub struct ListIter<'a> {
    next: Option<&'a OutputNode>,
}

impl<'a> Iterator for ListIter<'a> {
    type Item = &'a OutputTriple;

    fn next(&mut self) -> Option<Self::Item> {
        self.next.map(|node| {
            self.next = node.next.as_deref();
            &node.triple
        })
    }
}

/// Consumes the list, releasing each node as it is yielded.
pub struct ListIntoIter(OutputList);

impl Iterator for ListIntoIter {
    type Item = OutputTriple;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.head.take().map(|mut node| {
            self.0.head = node.next.take();
            self.0.len -= 1;
            node.triple
        })
    }
}

impl IntoIterator for OutputList {
    type Item = OutputTriple;
    type IntoIter = ListIntoIter;

    fn into_iter(self) -> Self::IntoIter {
        ListIntoIter(self)
    }
}

/// A fixed-capacity block of output triples.
pub struct TableChunk {
    tuples: Vec<OutputTriple>,
}

impl TableChunk {
    fn new() -> Self {
        // Capacity only, unwritten slots stay uninitialized.
        Self {
            tuples: Vec::with_capacity(TUPLES_PER_CHUNK),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.tuples.len() >= TUPLES_PER_CHUNK
    }

    pub fn as_slice(&self) -> &[OutputTriple] {
        &self.tuples
    }
}

/// Growable array of [`TableChunk`]s.
///
/// Chunks after `current_chunk` are pre-allocated and still empty. After
/// [`concatenate`](ChunkedTable::concatenate) any chunk may be partially
/// filled, so readers must respect each chunk's length.
pub struct ChunkedTable {
    chunks: Vec<TableChunk>,
    current_chunk: usize,
    num_tuples: usize,
}

impl ChunkedTable {
    /// Room for 8 chunk pointers (one cache line) and one allocated chunk.
    pub fn new() -> Self {
        let mut table = Self {
            chunks: Vec::with_capacity(64 / size_of::<usize>()),
            current_chunk: 0,
            num_tuples: 0,
        };
        table.add_chunk();
        table
    }

    /// Exactly `num_chunks` allocated chunks.
    pub fn with_chunks(num_chunks: usize) -> Self {
        let num_chunks = num_chunks.max(1);
        Self {
            chunks: (0..num_chunks).map(|_| TableChunk::new()).collect(),
            current_chunk: 0,
            num_tuples: 0,
        }
    }

    /// Chunks each thread pre-allocates for a probe side of `num_s` rows,
    /// with 20% headroom for skew between threads.
    pub fn prealloc_chunks_per_thread(num_s: usize, nthreads: usize) -> usize {
        let total = (num_s / TUPLES_PER_CHUNK + 1) * 6 / 5;
        total / nthreads.max(1) + 1
    }

    fn add_chunk(&mut self) {
        if self.chunks.len() == self.chunks.capacity() {
            self.chunks.reserve_exact(self.chunks.capacity().max(1));
        }
        self.chunks.push(TableChunk::new());
    }

    /// Sums the chunk lengths into the table's tuple count.
    pub fn finish(&mut self) {
        self.num_tuples = self.chunks.iter().map(TableChunk::len).sum();
    }

    /// Tuple count as of the last [`finish`](Self::finish).
    pub fn len(&self) -> usize {
        self.num_tuples
    }

    pub fn is_empty(&self) -> bool {
        self.num_tuples == 0
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> &[TableChunk] {
        &self.chunks
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputTriple> + '_ {
        self.chunks.iter().flat_map(|c| c.tuples.iter())
    }

    /// Frees every chunk. The table is consumed, so nothing can be inserted
    /// into it afterwards.
    pub fn destroy(self) {
        drop(self.chunks);
    }

    /// Moves the chunks of all `tables` into one table without copying
    /// tuples.
    pub fn concatenate(tables: Vec<ChunkedTable>) -> ChunkedTable {
        let num_chunks = tables.iter().map(|t| t.chunks.len()).sum();
        let num_tuples = tables.iter().map(|t| t.num_tuples).sum();
        let mut chunks = Vec::with_capacity(num_chunks);
        for mut table in tables {
            chunks.append(&mut table.chunks);
        }
        ChunkedTable {
            current_chunk: chunks.len().saturating_sub(1),
            chunks,
            num_tuples,
        }
    }
}

impl Default for ChunkedTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSink for ChunkedTable {
    #[inline]
    fn insert(&mut self, key: Key, r_payload: Payload, s_payload: Payload) {
        if self.chunks[self.current_chunk].is_full() {
            if self.current_chunk == self.chunks.len() - 1 {
                self.add_chunk();
            }
            self.current_chunk += 1;
        }
        self.chunks[self.current_chunk].tuples.push(OutputTriple {
            key,
            r_payload,
            s_payload,
        });
    }
}

/// One worker's linked-list output.
pub struct ThreadOutput {
    pub thread_id: usize,
    pub matches: u64,
    pub list: OutputList,
}

/// Materialized matches handed back to the caller.
pub enum Materialized {
    None,
    LinkedLists(Vec<ThreadOutput>),
    Chunked(ChunkedTable),
}

impl Materialized {
    pub fn len(&self) -> usize {
        match self {
            Materialized::None => 0,
            Materialized::LinkedLists(lists) => lists.iter().map(|t| t.list.len()).sum(),
            Materialized::Chunked(table) => table.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_each(&self, mut f: impl FnMut(&OutputTriple)) {
        match self {
            Materialized::None => {}
            Materialized::LinkedLists(lists) => {
                lists.iter().flat_map(|t| t.list.iter()).for_each(&mut f);
            }
            Materialized::Chunked(table) => table.iter().for_each(f),
        }
    }

    /// Drains all triples, releasing list nodes one by one.
    pub fn into_triples(self) -> Vec<OutputTriple> {
        match self {
            Materialized::None => Vec::new(),
            Materialized::LinkedLists(lists) => {
                lists.into_iter().flat_map(|t| t.list.into_iter()).collect()
            }
            Materialized::Chunked(table) => {
                let triples = table.iter().copied().collect();
                table.destroy();
                triples
            }
        }
    }
}
