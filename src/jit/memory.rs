/// Anonymous memory regions backing a JIT engine
///
/// Code is copied into a writable map, patched while relocations are applied, then
/// flipped to read+execute in place; its base address never changes. Data stays
/// writable for the lifetime of the engine.
use memmap2::{Mmap, MmapMut};
use std::io;

enum CodeState {
    Writable(MmapMut),
    Executable(Mmap),
    Lost,
}

pub struct CodeRegion {
    state: CodeState,
    base: usize,
    len: usize,
}

impl CodeRegion {
    pub fn new(code: &[u8]) -> io::Result<Self> {
        // zero-length anonymous maps are rejected by mmap
        let mut map = MmapMut::map_anon(code.len().max(1))?;
        map[..code.len()].copy_from_slice(code);
        let base = map.as_ptr() as usize;
        Ok(Self { state: CodeState::Writable(map), base, len: code.len() })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_executable(&self) -> bool {
        matches!(self.state, CodeState::Executable(_))
    }

    /// Write a little-endian word at `offset`. Fails once the region is executable.
    pub fn patch_u64(&mut self, offset: usize, value: u64) -> io::Result<()> {
        match &mut self.state {
            CodeState::Writable(map) if offset + 8 <= self.len => {
                map[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
                Ok(())
            }
            CodeState::Writable(_) => Err(io::Error::new(io::ErrorKind::InvalidInput, "patch outside code region")),
            _ => Err(io::Error::new(io::ErrorKind::PermissionDenied, "code region is no longer writable")),
        }
    }

    pub fn make_exec(&mut self) -> io::Result<()> {
        match std::mem::replace(&mut self.state, CodeState::Lost) {
            CodeState::Writable(map) => {
                let map = map.make_exec()?;
                flush_icache(map.as_ptr(), map.len());
                self.state = CodeState::Executable(map);
                Ok(())
            }
            other => {
                self.state = other;
                Ok(())
            }
        }
    }
}

pub struct DataRegion {
    map: MmapMut,
    len: usize,
}

impl DataRegion {
    pub fn new(len: usize) -> io::Result<Self> {
        Ok(Self { map: MmapMut::map_anon(len.max(1))?, len })
    }

    pub fn base(&self) -> usize {
        self.map.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn contains(&self, address: usize, size: usize) -> bool {
        address >= self.base() && address + size <= self.base() + self.len
    }

    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        self.map[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.map[offset..offset + len]
    }
}

#[cfg(target_arch = "aarch64")]
fn flush_icache(start: *const u8, len: usize) {
    use std::arch::asm;

    let ctr: u64;
    unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr) };
    let dline = 4usize << ((ctr >> 16) & 0xf);
    let iline = 4usize << (ctr & 0xf);
    let begin = start as usize;
    let end = begin + len;

    unsafe {
        let mut addr = begin & !(dline - 1);
        while addr < end {
            asm!("dc cvau, {}", in(reg) addr);
            addr += dline;
        }
        asm!("dsb ish");
        let mut addr = begin & !(iline - 1);
        while addr < end {
            asm!("ic ivau, {}", in(reg) addr);
            addr += iline;
        }
        asm!("dsb ish", "isb");
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_icache(_start: *const u8, _len: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patches_only_while_writable() {
        let mut region = CodeRegion::new(&[0u8; 16]).unwrap();
        region.patch_u64(8, 0x1122_3344_5566_7788).unwrap();
        assert!(region.patch_u64(12, 0).is_err());

        let base = region.base();
        region.make_exec().unwrap();
        assert!(region.is_executable());
        assert_eq!(region.base(), base);
        assert!(region.patch_u64(0, 1).is_err());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn executes_copied_code() {
        let ret_code: u8 = 0x2c;
        let instructions: [u8; 6] = [
            0xb8, ret_code, 0x00, 0x00, 0x00, // mov eax, 0x2c
            0xc3, // ret
        ];
        let mut region = CodeRegion::new(&instructions).unwrap();
        region.make_exec().unwrap();

        let result = unsafe {
            let func: extern "C" fn() -> u8 = std::mem::transmute(region.base());
            func()
        };
        assert_eq!(result, ret_code);
    }

    #[test]
    fn data_region_bounds() {
        let mut data = DataRegion::new(16).unwrap();
        data.write(8, &[1, 2, 3]);
        assert_eq!(data.bytes(8, 3), &[1, 2, 3]);
        assert!(data.contains(data.base() + 8, 8));
        assert!(!data.contains(data.base() + 9, 8));
    }
}
