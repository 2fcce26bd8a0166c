use paste::paste;

use crate::error::*;

macro_rules! impl_access {
    ($($type:ident),*) => { paste! { $(
        #[inline(always)]
        pub fn [<load_ $type>](&self, ptr: u32, offset: u32) -> Result<$type, Error> {
            let start = self.effective(ptr, offset, std::mem::size_of::<$type>())?;
            let mut raw = [0u8; std::mem::size_of::<$type>()];
            raw.copy_from_slice(&self.data[start..start + std::mem::size_of::<$type>()]);
            Ok($type::from_le_bytes(raw))
        }
        #[inline(always)]
        pub fn [<store_ $type>](&mut self, ptr: u32, offset: u32, v: $type) -> Result<(), Error> {
            let start = self.effective(ptr, offset, std::mem::size_of::<$type>())?;
            self.data[start..start + std::mem::size_of::<$type>()].copy_from_slice(&v.to_le_bytes());
            Ok(())
        }
    )* } };
}

/// One linear memory plus the app heap region the host allocates from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryInstance {
    data: Vec<u8>,
    heap: Vec<u8>,
    cur_page_count: u32,
    max_page_count: u32,
    bytes_per_page: u32,
    is_shared: bool,
    /// Number of extra module instances attached to a shared memory.
    pub ref_count: u32,
}

impl MemoryInstance {
    pub const MAX_PAGES: u32 = 65536;
    pub const PAGE_SIZE: u32 = 65536;

    pub fn new(initial: u32, maximum: u32, shared: bool, heap_size: usize) -> Result<Self, Error> {
        let maximum = maximum.min(Self::MAX_PAGES);
        let data = zeroed(initial as usize * Self::PAGE_SIZE as usize)?;
        let heap = zeroed(heap_size)?;
        Ok(Self {
            data,
            heap,
            cur_page_count: initial,
            max_page_count: maximum,
            bytes_per_page: Self::PAGE_SIZE,
            is_shared: shared,
            ref_count: 0,
        })
    }

    /// Rebuild a memory from captured parts. A shared memory reserves
    /// `shared_capacity` bytes up front so that every attaching environment
    /// sees the same backing region when it grows.
    pub fn from_parts(
        memory_bytes: &[u8],
        heap_bytes: &[u8],
        pages: (u32, u32, u32),
        is_shared: bool,
        ref_count: u32,
        shared_capacity: usize,
    ) -> Result<Self, Error> {
        let (bytes_per_page, cur_page_count, max_page_count) = pages;
        let expected = cur_page_count as usize * bytes_per_page as usize;
        if memory_bytes.len() != expected {
            return Err(Error::restore(format!(
                "memory holds {} bytes but {} pages of {} bytes were recorded",
                memory_bytes.len(), cur_page_count, bytes_per_page
            )));
        }
        let mut data = Vec::new();
        let capacity = if ref_count > 0 { shared_capacity.max(expected) } else { expected };
        data.try_reserve_exact(capacity)
            .map_err(|_| Error::restore(format!("cannot allocate {capacity} bytes of linear memory")))?;
        data.extend_from_slice(memory_bytes);
        let mut heap = Vec::new();
        heap.try_reserve_exact(heap_bytes.len())
            .map_err(|_| Error::restore(format!("cannot allocate {} bytes of app heap", heap_bytes.len())))?;
        heap.extend_from_slice(heap_bytes);
        Ok(Self { data, heap, cur_page_count, max_page_count, bytes_per_page, is_shared, ref_count })
    }

    #[inline]
    pub fn size(&self) -> u32 { self.cur_page_count }
    #[inline]
    pub fn max(&self) -> u32 { self.max_page_count }
    #[inline]
    pub fn bytes_per_page(&self) -> u32 { self.bytes_per_page }
    #[inline]
    pub fn is_shared(&self) -> bool { self.is_shared }
    #[inline]
    pub fn data(&self) -> &[u8] { &self.data }
    #[inline]
    pub fn heap(&self) -> &[u8] { &self.heap }
    #[inline]
    pub fn heap_mut(&mut self) -> &mut [u8] { &mut self.heap }
    /// Bytes reserved for the linear memory, including room to grow.
    #[inline]
    pub fn capacity(&self) -> usize { self.data.capacity() }

    /// Returns the previous page count, or `u32::MAX` when the limit is hit.
    pub fn grow(&mut self, delta: u32) -> u32 {
        if delta == 0 { return self.cur_page_count; }
        if delta > self.max_page_count.saturating_sub(self.cur_page_count) { return u32::MAX; }
        let new_len = (self.cur_page_count + delta) as usize * self.bytes_per_page as usize;
        if self.data.try_reserve_exact(new_len - self.data.len()).is_err() {
            return u32::MAX;
        }
        let old = self.cur_page_count;
        self.cur_page_count += delta;
        self.data.resize(new_len, 0);
        old
    }

    #[inline(always)]
    fn effective(&self, ptr: u32, offset: u32, width: usize) -> Result<usize, Error> {
        let addr = (ptr as usize).checked_add(offset as usize).ok_or(Error::Trap(OOB_MEMORY_ACCESS))?;
        if addr.saturating_add(width) > self.data.len() { return Err(Error::Trap(OOB_MEMORY_ACCESS)); }
        Ok(addr)
    }

    impl_access!(u8, u16, u32, u64, i8, i16, i32, i64);

    #[inline(always)]
    pub fn load_f32(&self, ptr: u32, offset: u32) -> Result<f32, Error> {
        Ok(f32::from_bits(self.load_u32(ptr, offset)?))
    }
    #[inline(always)]
    pub fn store_f32(&mut self, ptr: u32, offset: u32, v: f32) -> Result<(), Error> {
        self.store_u32(ptr, offset, v.to_bits())
    }
    #[inline(always)]
    pub fn load_f64(&self, ptr: u32, offset: u32) -> Result<f64, Error> {
        Ok(f64::from_bits(self.load_u64(ptr, offset)?))
    }
    #[inline(always)]
    pub fn store_f64(&mut self, ptr: u32, offset: u32, v: f64) -> Result<(), Error> {
        self.store_u64(ptr, offset, v.to_bits())
    }

    pub fn write_bytes(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        let start = self.effective(offset, 0, bytes.len())?;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_bytes(&self, offset: u32, len: usize) -> Result<&[u8], Error> {
        let start = self.effective(offset, 0, len)?;
        Ok(&self.data[start..start + len])
    }
}

fn zeroed(len: usize) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| Error::Link(MEMORY_ALLOC_FAILED))?;
    buf.resize(len, 0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_and_stores_are_little_endian() {
        let mut m = MemoryInstance::new(1, 2, false, 0).unwrap();
        m.store_u32(8, 4, 0x0403_0201).unwrap();
        assert_eq!(m.load_u8(12, 0).unwrap(), 1);
        assert_eq!(m.load_u16(13, 0).unwrap(), 0x0302);
        m.store_i64(0, 0, -2).unwrap();
        assert_eq!(m.load_u64(0, 0).unwrap(), u64::MAX - 1);
        m.store_f64(16, 0, 1.5).unwrap();
        assert_eq!(m.load_f64(16, 0).unwrap(), 1.5);
    }

    #[test]
    fn out_of_bounds_traps() {
        let mut m = MemoryInstance::new(1, 1, false, 0).unwrap();
        assert!(matches!(m.load_u32(65533, 0), Err(Error::Trap(OOB_MEMORY_ACCESS))));
        assert!(matches!(m.store_u8(u32::MAX, 1, 0), Err(Error::Trap(OOB_MEMORY_ACCESS))));
        assert!(m.write_bytes(65535, &[1]).is_ok());
        assert!(m.write_bytes(65535, &[1, 2]).is_err());
    }

    #[test]
    fn grow_respects_maximum() {
        let mut m = MemoryInstance::new(1, 2, false, 0).unwrap();
        assert_eq!(m.grow(1), 1);
        assert_eq!(m.size(), 2);
        assert_eq!(m.data().len(), 2 * 65536);
        assert_eq!(m.grow(1), u32::MAX);
    }

    #[test]
    fn shared_memory_reserves_capacity() {
        let bytes = vec![7u8; 65536];
        let m = MemoryInstance::from_parts(&bytes, &[1, 2], (65536, 1, 4), true, 1, 4 * 65536).unwrap();
        assert!(m.capacity() >= 4 * 65536);
        assert_eq!(m.heap(), &[1, 2]);
        assert!(MemoryInstance::from_parts(&bytes[1..], &[], (65536, 1, 4), false, 0, 0).is_err());
    }
}
