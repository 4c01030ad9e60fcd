//! Guest address space as seen by the GE.
//!
//! Only main RAM and VRAM are visible. Addresses are masked to 28 bits, so
//! cached and uncached mirrors resolve to the same bytes; VRAM repeats every
//! 2 MiB up to 0x04800000.

use crate::GpuError;

pub const RAM_BASE: u32 = 0x0800_0000;
pub const VRAM_BASE: u32 = 0x0400_0000;
pub const DEFAULT_RAM_SIZE: usize = 32 * 1024 * 1024;
pub const VRAM_SIZE: usize = 2 * 1024 * 1024;
const VRAM_MIRROR_END: u32 = 0x0480_0000;
pub const ADDRESS_MASK: u32 = 0x0FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Ram,
    Vram,
}

/// Main RAM plus VRAM.
#[derive(Clone)]
pub struct GuestMemory {
    ram: Vec<u8>,
    vram: Vec<u8>,
}

impl GuestMemory {
    pub fn new() -> Self {
        Self::with_ram_size(DEFAULT_RAM_SIZE)
    }

    pub fn with_ram_size(size: usize) -> Self {
        Self {
            ram: vec![0; size],
            vram: vec![0; VRAM_SIZE],
        }
    }

    pub fn ram_size(&self) -> usize {
        self.ram.len()
    }

    /// Map `[addr, addr + len)` to a region and offset. The whole range must
    /// fall inside one region.
    fn translate(&self, addr: u32, len: usize) -> Option<(Region, usize)> {
        let a = addr & ADDRESS_MASK;
        let (region, offset, size) = if a >= RAM_BASE {
            (Region::Ram, (a - RAM_BASE) as usize, self.ram.len())
        } else if (VRAM_BASE..VRAM_MIRROR_END).contains(&a) {
            let off = ((a - VRAM_BASE) as usize) % VRAM_SIZE;
            (Region::Vram, off, VRAM_SIZE)
        } else {
            return None;
        };
        let end = offset.checked_add(len)?;
        if end > size {
            return None;
        }
        Some((region, offset))
    }

    pub fn is_valid_range(&self, addr: u32, len: usize) -> bool {
        self.translate(addr, len).is_some()
    }

    pub fn is_valid_address(&self, addr: u32) -> bool {
        self.is_valid_range(addr, 1)
    }

    pub fn slice(&self, addr: u32, len: usize) -> Result<&[u8], GpuError> {
        match self.translate(addr, len) {
            Some((Region::Ram, off)) => Ok(&self.ram[off..off + len]),
            Some((Region::Vram, off)) => Ok(&self.vram[off..off + len]),
            None => Err(GpuError::OutOfBoundsMemoryAccess { addr, len }),
        }
    }

    pub fn slice_mut(&mut self, addr: u32, len: usize) -> Result<&mut [u8], GpuError> {
        match self.translate(addr, len) {
            Some((Region::Ram, off)) => Ok(&mut self.ram[off..off + len]),
            Some((Region::Vram, off)) => Ok(&mut self.vram[off..off + len]),
            None => Err(GpuError::OutOfBoundsMemoryAccess { addr, len }),
        }
    }

    pub fn read_u32(&self, addr: u32) -> Result<u32, GpuError> {
        let b = self.slice(addr, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u16(&self, addr: u32) -> Result<u16, GpuError> {
        let b = self.slice(addr, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), GpuError> {
        self.slice_mut(addr, 4)?
            .copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), GpuError> {
        self.slice_mut(addr, data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Write a run of command words starting at `addr`.
    pub fn write_words(&mut self, addr: u32, words: &[u32]) -> Result<(), GpuError> {
        let dst = self.slice_mut(addr, words.len() * 4)?;
        for (chunk, w) in dst.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        Ok(())
    }

    /// Copy `len` bytes between possibly different regions.
    pub fn copy(&mut self, dst: u32, src: u32, len: usize) -> Result<(), GpuError> {
        let tmp = self.slice(src, len)?.to_vec();
        self.write_bytes(dst, &tmp)
    }

    pub fn clear(&mut self) {
        self.ram.fill(0);
        self.vram.fill(0);
    }
}

impl Default for GuestMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("ram", &self.ram.len())
            .field("vram", &self.vram.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_read_write() {
        let mut mem = GuestMemory::with_ram_size(0x1000);
        mem.write_u32(0x0800_0010, 0xDEAD_BEEF).unwrap();
        assert_eq!(mem.read_u32(0x0800_0010).unwrap(), 0xDEAD_BEEF);
        assert_eq!(mem.read_u16(0x0800_0012).unwrap(), 0xDEAD);
    }

    #[test]
    fn test_uncached_mirror() {
        let mut mem = GuestMemory::with_ram_size(0x1000);
        mem.write_u32(0x4800_0000, 42).unwrap();
        assert_eq!(mem.read_u32(0x0800_0000).unwrap(), 42);
    }

    #[test]
    fn test_vram_mirror() {
        let mut mem = GuestMemory::with_ram_size(0x1000);
        mem.write_u32(0x0400_0100, 7).unwrap();
        assert_eq!(mem.read_u32(0x0420_0100).unwrap(), 7);
        assert_eq!(mem.read_u32(0x4400_0100).unwrap(), 7);
    }

    #[test]
    fn test_out_of_bounds() {
        let mem = GuestMemory::with_ram_size(0x1000);
        assert!(mem.read_u32(0x0800_0FFE).is_err());
        assert!(mem.read_u32(0x0000_0000).is_err());
        assert!(!mem.is_valid_range(0x0800_0000, 0x1001));
        assert!(mem.is_valid_range(0x0800_0000, 0x1000));
        match mem.slice(0x0900_0000, 4) {
            Err(GpuError::OutOfBoundsMemoryAccess { addr, len }) => {
                assert_eq!(addr, 0x0900_0000);
                assert_eq!(len, 4);
            }
            other => panic!("unexpected {:?}", other.map(|s| s.len())),
        }
    }

    #[test]
    fn test_copy_between_regions() {
        let mut mem = GuestMemory::with_ram_size(0x1000);
        mem.write_bytes(0x0800_0000, &[1, 2, 3, 4]).unwrap();
        mem.copy(0x0400_0000, 0x0800_0000, 4).unwrap();
        assert_eq!(mem.slice(0x0400_0000, 4).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_write_words() {
        let mut mem = GuestMemory::with_ram_size(0x1000);
        mem.write_words(0x0800_0000, &[0x0C00_0000, 0x0F00_0000]).unwrap();
        assert_eq!(mem.read_u32(0x0800_0004).unwrap(), 0x0F00_0000);
    }
}
