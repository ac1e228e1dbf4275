//! Bump allocator which owns the memory of decoded messages.
//!
//! An [`Arena`] is a list of zero-initialized byte chunks. Allocations bump a
//! cursor within the current chunk and are never freed individually. The
//! whole arena is reset or released in one operation.
//!
//! Memory is addressed with [`Addr`] handles rather than pointers. An address
//! identifies a chunk and an offset within it, so a value stored in the arena
//! can only ever refer to other values in the same arena.

/// Number of low bits of an [`Addr`] which hold the offset within a chunk.
const OFFSET_BITS: u32 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Bit set in addresses of string and bytes values which refer to the input
/// buffer instead of the arena.
const ALIAS_BIT: u64 = 1 << 63;

/// Address of a value in an [`Arena`].
///
/// The null address is zero. Since memory is zero-initialized, an unset
/// pointer field in a record reads as null.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Addr(u64);

impl Addr {
    pub const NULL: Addr = Addr(0);

    fn new(chunk: usize, offset: usize) -> Addr {
        debug_assert!((offset as u64) <= OFFSET_MASK);
        Addr((((chunk as u64) + 1) << OFFSET_BITS) | offset as u64)
    }

    /// Create an address that refers to `offset` in the input buffer.
    pub fn aliased(offset: usize) -> Addr {
        Addr(ALIAS_BIT | offset as u64)
    }

    pub fn from_bits(bits: u64) -> Addr {
        Addr(bits)
    }

    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn is_aliased(self) -> bool {
        self.0 & ALIAS_BIT != 0
    }

    /// Return the input offset of an aliased address.
    pub fn input_offset(self) -> usize {
        debug_assert!(self.is_aliased());
        (self.0 & !ALIAS_BIT) as usize
    }

    fn chunk(self) -> usize {
        debug_assert!(!self.is_null() && !self.is_aliased());
        ((self.0 >> OFFSET_BITS) - 1) as usize
    }

    fn offset(self) -> usize {
        (self.0 & OFFSET_MASK) as usize
    }

    /// Return the address `delta` bytes after `self`.
    pub fn add(self, delta: usize) -> Addr {
        Addr(self.0 + delta as u64)
    }
}

/// Options that control arena growth and retention.
#[derive(Clone, Debug, PartialEq)]
pub struct ArenaOptions {
    initial_chunk_size: usize,
    max_chunk_size: usize,
    retain_chunks: usize,
}

impl ArenaOptions {
    /// Size of the first chunk. Subsequent chunks double in size.
    pub fn initial_chunk_size(mut self, size: usize) -> Self {
        self.initial_chunk_size = size.max(64);
        self
    }

    /// Largest chunk created by doubling. Larger allocations get a chunk of
    /// their own.
    pub fn max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size.max(64);
        self
    }

    /// Number of chunks kept for reuse when the arena is reset.
    pub fn retain_chunks(mut self, count: usize) -> Self {
        self.retain_chunks = count;
        self
    }
}

impl Default for ArenaOptions {
    fn default() -> Self {
        Self {
            initial_chunk_size: 4096,
            max_chunk_size: 1 << 20,
            retain_chunks: 4,
        }
    }
}

struct Chunk {
    data: Box<[u8]>,
    used: usize,
}

impl Chunk {
    fn new(size: usize) -> Chunk {
        Chunk {
            data: vec![0; size].into_boxed_slice(),
            used: 0,
        }
    }

    /// Return the offset at which an allocation of `size` bytes aligned to
    /// `align` would start, if it fits.
    fn fit(&self, size: usize, align: usize) -> Option<usize> {
        let start = self.used.next_multiple_of(align);
        (start + size <= self.data.len()).then_some(start)
    }
}

/// Bump allocator for message records, lists, strings and unknown fields.
pub struct Arena {
    chunks: Vec<Chunk>,

    /// Index of the chunk allocations are taken from. Chunks after this one
    /// are empty.
    current: usize,

    options: ArenaOptions,
}

impl Arena {
    pub fn new(options: ArenaOptions) -> Arena {
        Arena {
            chunks: Vec::new(),
            current: 0,
            options,
        }
    }

    /// Allocate `size` zeroed bytes aligned to `align`.
    ///
    /// `align` must be a power of two. Zero-sized allocations return a valid
    /// address.
    pub fn alloc(&mut self, size: usize, align: usize) -> Addr {
        debug_assert!(align.is_power_of_two());
        if let Some(chunk) = self.chunks.get_mut(self.current) {
            if let Some(start) = chunk.fit(size, align) {
                chunk.used = start + size;
                return Addr::new(self.current, start);
            }
        }
        self.alloc_slow(size, align)
    }

    #[cold]
    fn alloc_slow(&mut self, size: usize, align: usize) -> Addr {
        let next = if self.chunks.is_empty() {
            0
        } else {
            self.current + 1
        };

        // Look for an empty retained chunk which is large enough.
        let retained = (next..self.chunks.len()).find(|&i| self.chunks[i].fit(size, align).is_some());
        let index = match retained {
            Some(i) => {
                // Chunks at or after `next` are unused, so they can be
                // reordered without invalidating any address.
                self.chunks.swap(next, i);
                next
            }
            None => {
                let last_size = self.chunks.last().map(|c| c.data.len());
                let chunk_size = match last_size {
                    Some(len) => (len * 2).min(self.options.max_chunk_size),
                    None => self.options.initial_chunk_size,
                }
                .max(size + align);
                self.chunks.push(Chunk::new(chunk_size));
                let last = self.chunks.len() - 1;
                self.chunks.swap(next, last);
                next
            }
        };

        self.current = index;
        let chunk = &mut self.chunks[index];
        let start = chunk.used.next_multiple_of(align);
        chunk.used = start + size;
        Addr::new(index, start)
    }

    /// Resize an allocation, returning its new address.
    ///
    /// If `addr` is the most recent allocation and there is room, it is
    /// extended in place. Otherwise a new allocation is made and the old
    /// contents are copied. New bytes are zero.
    pub fn grow(&mut self, addr: Addr, old_size: usize, new_size: usize, align: usize) -> Addr {
        debug_assert!(new_size >= old_size);
        if addr.is_null() {
            return self.alloc(new_size, align);
        }
        let (chunk_idx, offset) = (addr.chunk(), addr.offset());
        if chunk_idx == self.current {
            let chunk = &mut self.chunks[chunk_idx];
            if chunk.used == offset + old_size && offset + new_size <= chunk.data.len() {
                chunk.used = offset + new_size;
                return addr;
            }
        }
        let new_addr = self.alloc(new_size, align);
        self.copy_within(addr, new_addr, old_size);
        new_addr
    }

    fn copy_within(&mut self, src: Addr, dst: Addr, len: usize) {
        if len == 0 {
            return;
        }
        let (src_chunk, src_off) = (src.chunk(), src.offset());
        let (dst_chunk, dst_off) = (dst.chunk(), dst.offset());
        if src_chunk == dst_chunk {
            self.chunks[src_chunk]
                .data
                .copy_within(src_off..src_off + len, dst_off);
        } else {
            let (src_data, dst_data) = if src_chunk < dst_chunk {
                let (lo, hi) = self.chunks.split_at_mut(dst_chunk);
                (&lo[src_chunk].data, &mut hi[0].data)
            } else {
                let (lo, hi) = self.chunks.split_at_mut(src_chunk);
                (&hi[0].data, &mut lo[dst_chunk].data)
            };
            dst_data[dst_off..dst_off + len].copy_from_slice(&src_data[src_off..src_off + len]);
        }
    }

    /// Allocate a copy of `bytes`.
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> Addr {
        let addr = self.alloc(bytes.len(), 1);
        self.bytes_mut(addr, bytes.len()).copy_from_slice(bytes);
        addr
    }

    /// Return `len` bytes starting at `addr`.
    ///
    /// Null addresses are valid only when `len` is zero.
    pub fn bytes(&self, addr: Addr, len: usize) -> &[u8] {
        if len == 0 {
            return &[];
        }
        let offset = addr.offset();
        &self.chunks[addr.chunk()].data[offset..offset + len]
    }

    /// Return the contents of a string or bytes value, which is stored either
    /// in the arena or, for an aliased address, in `input`.
    pub fn payload<'s>(&'s self, input: &'s [u8], addr: Addr, len: usize) -> &'s [u8] {
        if addr.is_aliased() {
            let start = addr.input_offset();
            &input[start..start + len]
        } else {
            self.bytes(addr, len)
        }
    }

    pub fn bytes_mut(&mut self, addr: Addr, len: usize) -> &mut [u8] {
        if len == 0 {
            return &mut [];
        }
        let offset = addr.offset();
        &mut self.chunks[addr.chunk()].data[offset..offset + len]
    }

    pub fn read_u8(&self, addr: Addr) -> u8 {
        self.bytes(addr, 1)[0]
    }

    pub fn read_u32(&self, addr: Addr) -> u32 {
        let mut buf = [0; 4];
        buf.copy_from_slice(self.bytes(addr, 4));
        u32::from_le_bytes(buf)
    }

    pub fn read_u64(&self, addr: Addr) -> u64 {
        let mut buf = [0; 8];
        buf.copy_from_slice(self.bytes(addr, 8));
        u64::from_le_bytes(buf)
    }

    pub fn read_addr(&self, addr: Addr) -> Addr {
        Addr(self.read_u64(addr))
    }

    pub fn write_u8(&mut self, addr: Addr, val: u8) {
        self.bytes_mut(addr, 1)[0] = val;
    }

    pub fn write_u32(&mut self, addr: Addr, val: u32) {
        self.bytes_mut(addr, 4).copy_from_slice(&val.to_le_bytes());
    }

    pub fn write_u64(&mut self, addr: Addr, val: u64) {
        self.bytes_mut(addr, 8).copy_from_slice(&val.to_le_bytes());
    }

    pub fn write_addr(&mut self, addr: Addr, val: Addr) {
        self.write_u64(addr, val.0)
    }

    /// Zero `len` bytes starting at `addr`.
    pub fn zero(&mut self, addr: Addr, len: usize) {
        self.bytes_mut(addr, len).fill(0);
    }

    /// Free all allocations, keeping up to the configured number of chunks
    /// for reuse.
    ///
    /// Retained chunks are zeroed so that future allocations from them are
    /// zero-initialized.
    pub fn reset(&mut self) {
        self.chunks.truncate(self.options.retain_chunks);
        for chunk in &mut self.chunks {
            chunk.data[..chunk.used].fill(0);
            chunk.used = 0;
        }
        self.current = 0;
    }

    /// Free all allocations and chunks.
    pub fn release(&mut self) {
        self.chunks = Vec::new();
        self.current = 0;
    }

    /// Total number of bytes allocated since the last reset, including
    /// alignment padding.
    pub fn allocated_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.used).sum()
    }

    /// Total size of all chunks.
    pub fn capacity(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new(ArenaOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use tdpb_testing::TestCases;

    use super::{Addr, Arena, ArenaOptions};

    fn small_arena() -> Arena {
        Arena::new(
            ArenaOptions::default()
                .initial_chunk_size(64)
                .max_chunk_size(256)
                .retain_chunks(1),
        )
    }

    #[test]
    fn test_alloc_alignment() {
        #[derive(Debug)]
        struct Case {
            allocs: &'static [(usize, usize)],
        }

        let cases = [
            Case {
                allocs: &[(1, 1), (4, 4), (8, 8), (3, 1), (8, 8)],
            },
            Case {
                allocs: &[(0, 8), (16, 8), (5, 4)],
            },
        ];

        cases.test_each(|case| {
            let mut arena = small_arena();
            for &(size, align) in case.allocs {
                let addr = arena.alloc(size, align);
                assert!(!addr.is_null());
                assert_eq!(addr.offset() % align, 0);
                assert!(arena.bytes(addr, size).iter().all(|&b| b == 0));
            }
        })
    }

    #[test]
    fn test_growth_and_oversized() {
        let mut arena = small_arena();
        let a = arena.alloc(48, 8);
        let b = arena.alloc(48, 8);
        assert_ne!(a.chunk(), b.chunk());
        assert_eq!(arena.chunk_count(), 2);

        // Larger than the max chunk size.
        let c = arena.alloc(1000, 8);
        arena.write_u64(c.add(992), 7);
        assert_eq!(arena.read_u64(c.add(992)), 7);
    }

    #[test]
    fn test_reset_zeroes_and_retains() {
        let mut arena = small_arena();
        let a = arena.alloc(16, 8);
        arena.write_u64(a, u64::MAX);
        arena.alloc(200, 8);
        assert_eq!(arena.chunk_count(), 2);

        arena.reset();
        assert_eq!(arena.chunk_count(), 1);
        assert_eq!(arena.allocated_bytes(), 0);

        let b = arena.alloc(16, 8);
        assert_eq!(b, a);
        assert_eq!(arena.read_u64(b), 0);

        arena.release();
        assert_eq!(arena.chunk_count(), 0);
        assert_eq!(arena.capacity(), 0);
    }

    #[test]
    fn test_grow_in_place_and_copy() {
        let mut arena = small_arena();
        let a = arena.alloc_bytes(b"abcd");
        let a2 = arena.grow(a, 4, 8, 1);
        assert_eq!(a2, a);
        assert_eq!(arena.bytes(a2, 8), b"abcd\0\0\0\0");

        // Another allocation prevents growing in place.
        arena.alloc(1, 1);
        let a3 = arena.grow(a2, 8, 16, 1);
        assert_ne!(a3, a2);
        assert_eq!(&arena.bytes(a3, 16)[..4], b"abcd");

        // Growth which needs a new chunk.
        let a4 = arena.grow(a3, 16, 200, 1);
        assert_eq!(&arena.bytes(a4, 200)[..4], b"abcd");
    }

    #[test]
    fn test_aliased_addr() {
        let addr = Addr::aliased(1234);
        assert!(addr.is_aliased());
        assert!(!addr.is_null());
        assert_eq!(addr.input_offset(), 1234);
        assert!(Addr::NULL.is_null());
    }
}
