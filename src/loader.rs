//! ELF loading.
//!
//! The guest image is mapped at its own requested virtual addresses inside
//! the harness process, so guest pointers are host pointers and the host
//! CPU can run the text directly. `MAP_FIXED_NOREPLACE` turns any clash
//! with an existing mapping (the harness itself, a previous segment) into
//! a loud error instead of silent corruption.
//!
//! Writable segments become anonymous memory initialised from the file, so
//! the image on disk stays untouched and `p_memsz > p_filesz` tails come up
//! zeroed. Non-writable segments are mapped straight from the file, which
//! requires `p_filesz == p_memsz` and a page-aligned `p_vaddr`.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use elf::abi;
use elf::endian::AnyEndian;
use elf::file::Class;
use elf::segment::ProgramHeader;
use elf::ElfBytes;

use crate::Error;


pub const PAGE_SIZE: u64 = 4096;


/// Read-only mapping of the input file.
struct FileMap {
    base: *mut libc::c_void,
    len: usize,
    fd: libc::c_int,
}


impl FileMap {
    fn open(path: &Path) -> Result<Self, Error> {
        let open_err = |source| Error::Open { path: path.display().to_string(), source };

        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| open_err(io::Error::from_raw_os_error(libc::EINVAL)))?;

        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY) };
        if fd < 0 {
            return Err(open_err(io::Error::last_os_error()));
        }

        let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, st.as_mut_ptr()) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(open_err(err));
        }
        let st = unsafe { st.assume_init() };

        if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            unsafe { libc::close(fd) };
            return Err(open_err(io::Error::from_raw_os_error(libc::EISDIR)));
        }

        let len = st.st_size as usize;
        if len == 0 {
            unsafe { libc::close(fd) };
            return Err(Error::InvalidElf("empty file".to_string()));
        }

        let base = unsafe {
            libc::mmap(std::ptr::null_mut(), len, libc::PROT_READ, libc::MAP_PRIVATE, fd, 0)
        };
        if base == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(open_err(err));
        }

        Ok(Self { base, len, fd })
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base as *const u8, self.len) }
    }
}


impl Drop for FileMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.len);
            libc::close(self.fd);
        }
    }
}


/// One live guest mapping, released on drop.
struct Segment {
    addr: u64,
    len: usize,
}


impl Drop for Segment {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.addr as *mut libc::c_void, self.len) };
    }
}


/// A loaded guest image: entry point plus the owned segment mappings.
pub struct Image {
    entry: u64,
    segments: Vec<Segment>,
}


impl Image {
    pub fn load(path: &Path) -> Result<Self, Error> {
        // Segment placement math assumes the architected page size.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size != PAGE_SIZE as i64 {
            return Err(Error::PageSize(page_size));
        }

        let file = FileMap::open(path)?;
        let data = file.bytes();

        let elf = ElfBytes::<AnyEndian>::minimal_parse(data)
            .map_err(|e| Error::InvalidElf(e.to_string()))?;
        validate_header(&elf)?;

        let phdrs = elf
            .segments()
            .ok_or_else(|| Error::InvalidElf("no program headers present".to_string()))?;

        let mut segments = Vec::new();
        for phdr in phdrs.iter().filter(|p| p.p_type == abi::PT_LOAD) {
            if phdr.p_memsz == 0 {
                continue;
            }
            segments.push(map_segment(&file, data, &phdr)?);
        }

        Ok(Image { entry: elf.ehdr.e_entry, segments })
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}


fn validate_header(elf: &ElfBytes<AnyEndian>) -> Result<(), Error> {
    // Magic, ident class/data/version are already enforced by the parser.
    let ehdr = &elf.ehdr;
    let fail = |msg: &str| Err(Error::InvalidElf(msg.to_string()));

    if ehdr.class != Class::ELF64 {
        return fail("unsupported ELF class");
    }
    if ehdr.endianness != AnyEndian::Little {
        return fail("not a little-endian ELF");
    }
    if ehdr.e_type != abi::ET_EXEC {
        return fail("not an executable file");
    }
    if ehdr.e_machine != abi::EM_RISCV {
        return fail("not a RISC-V ELF");
    }
    if ehdr.version != u32::from(abi::EV_CURRENT) {
        return fail("ELF version mismatch");
    }

    Ok(())
}


fn map_segment(file: &FileMap, data: &[u8], phdr: &ProgramHeader) -> Result<Segment, Error> {
    let mut prot = 0;
    if phdr.p_flags & abi::PF_R != 0 { prot |= libc::PROT_READ }
    if phdr.p_flags & abi::PF_W != 0 { prot |= libc::PROT_WRITE }
    if phdr.p_flags & abi::PF_X != 0 { prot |= libc::PROT_EXEC }

    let page_base = phdr.p_vaddr & !(PAGE_SIZE - 1);
    let off = phdr.p_vaddr - page_base;

    let file_end = phdr.p_offset.checked_add(phdr.p_filesz);
    if phdr.p_filesz > phdr.p_memsz || file_end.is_none() || file_end.unwrap() > data.len() as u64 {
        return Err(Error::InvalidElf(format!(
            "segment at {:#x}: file range out of bounds",
            phdr.p_vaddr
        )));
    }

    if prot & libc::PROT_WRITE != 0 {
        // Anonymous memory, initialised by copying the file contents. The
        // tail past p_filesz is the zero-initialised bss.
        let len = (phdr.p_memsz + off) as usize;
        let seg = fixed_map(
            "segment",
            page_base,
            len,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )?;

        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr().add(phdr.p_offset as usize),
                phdr.p_vaddr as *mut u8,
                phdr.p_filesz as usize,
            );
        }

        log::debug!(
            "mapped rw segment {:#x}..{:#x} ({} file bytes)",
            page_base,
            page_base + len as u64,
            phdr.p_filesz
        );
        Ok(seg)
    } else {
        if phdr.p_filesz != phdr.p_memsz {
            return Err(Error::InvalidElf(format!(
                "segment at {:#x}: p_filesz != p_memsz on a non-writable segment",
                phdr.p_vaddr
            )));
        }
        if off != 0 {
            return Err(Error::InvalidElf(format!(
                "segment at {:#x}: non-writable segment is not page-aligned",
                phdr.p_vaddr
            )));
        }

        let seg = fixed_map(
            "segment",
            phdr.p_vaddr,
            phdr.p_filesz as usize,
            prot,
            libc::MAP_PRIVATE | libc::MAP_FIXED_NOREPLACE,
            file.fd,
            phdr.p_offset as i64,
        )?;

        log::debug!(
            "mapped file segment {:#x}..{:#x}",
            phdr.p_vaddr,
            phdr.p_vaddr + phdr.p_filesz
        );
        Ok(seg)
    }
}


fn fixed_map(
    what: &'static str,
    addr: u64,
    len: usize,
    prot: libc::c_int,
    flags: libc::c_int,
    fd: libc::c_int,
    offset: i64,
) -> Result<Segment, Error> {
    let base = unsafe { libc::mmap(addr as *mut libc::c_void, len, prot, flags, fd, offset) };

    if base != addr as *mut libc::c_void {
        let source = io::Error::last_os_error();
        if base != libc::MAP_FAILED {
            unsafe { libc::munmap(base, len) };
        }
        return Err(Error::Mapping { what, addr, source });
    }

    Ok(Segment { addr, len })
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const EM_X86_64: u16 = 62;

    struct Seg {
        vaddr: u64,
        offset: u64,
        filesz: u64,
        memsz: u64,
        flags: u32,
        data: Vec<u8>,
    }

    /// Minimal ELF64 builder: header, program headers, then each segment's
    /// bytes at its stated offset.
    fn build_elf(entry: u64, machine: u16, e_type: u16, class: u8, segs: &[Seg]) -> Vec<u8> {
        let mut elf = vec![0x7f, b'E', b'L', b'F', class, 1, 1, 0];
        elf.extend_from_slice(&[0u8; 8]);

        elf.extend_from_slice(&e_type.to_le_bytes());
        elf.extend_from_slice(&machine.to_le_bytes());
        elf.extend_from_slice(&1u32.to_le_bytes()); // e_version
        elf.extend_from_slice(&entry.to_le_bytes());
        elf.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
        elf.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        elf.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
        elf.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
        elf.extend_from_slice(&(segs.len() as u16).to_le_bytes());
        elf.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        assert_eq!(elf.len(), 64);

        for seg in segs {
            elf.extend_from_slice(&abi::PT_LOAD.to_le_bytes());
            elf.extend_from_slice(&seg.flags.to_le_bytes());
            elf.extend_from_slice(&seg.offset.to_le_bytes());
            elf.extend_from_slice(&seg.vaddr.to_le_bytes());
            elf.extend_from_slice(&seg.vaddr.to_le_bytes()); // p_paddr
            elf.extend_from_slice(&seg.filesz.to_le_bytes());
            elf.extend_from_slice(&seg.memsz.to_le_bytes());
            elf.extend_from_slice(&PAGE_SIZE.to_le_bytes()); // p_align
        }

        for seg in segs {
            if elf.len() < seg.offset as usize {
                elf.resize(seg.offset as usize, 0);
            }
            elf.extend_from_slice(&seg.data);
        }

        elf
    }

    fn temp(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("rvh-{}-{name}", std::process::id()));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn rw_seg(vaddr: u64, data: &[u8], memsz: u64) -> Seg {
        Seg {
            vaddr,
            offset: 0x200,
            filesz: data.len() as u64,
            memsz,
            flags: abi::PF_R | abi::PF_W,
            data: data.to_vec(),
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut elf = build_elf(0, abi::EM_RISCV, abi::ET_EXEC, 2, &[]);
        elf[3] = b'?';
        let path = temp("badmagic", &elf);

        assert!(matches!(Image::load(&path), Err(Error::InvalidElf(_))));
    }

    #[test]
    fn rejects_wrong_class_machine_type() {
        for (name, elf) in [
            ("class32", build_elf(0, abi::EM_RISCV, abi::ET_EXEC, 1, &[])),
            ("x86", build_elf(0, EM_X86_64, abi::ET_EXEC, 2, &[])),
            ("dyn", build_elf(0, abi::EM_RISCV, abi::ET_DYN, 2, &[])),
        ] {
            let path = temp(name, &elf);
            assert!(matches!(Image::load(&path), Err(Error::InvalidElf(_))), "{name}");
        }
    }

    #[test]
    fn rejects_directories() {
        let result = Image::load(&std::env::temp_dir());
        assert!(matches!(result, Err(Error::Open { .. })));
    }

    #[test]
    fn rejects_truncated_segment_data() {
        let seg = Seg {
            vaddr: 0x76000,
            offset: 0x2000, // past the end of the file
            filesz: 0x100,
            memsz: 0x100,
            flags: abi::PF_R | abi::PF_W,
            data: Vec::new(),
        };
        let path = temp("truncated", &build_elf(0x76000, abi::EM_RISCV, abi::ET_EXEC, 2, &[seg]));

        assert!(matches!(Image::load(&path), Err(Error::InvalidElf(_))));
    }

    #[test]
    fn maps_writable_segment_and_zero_fills() {
        let payload: Vec<u8> = (1..=0x20u8).collect();
        let seg = rw_seg(0x70010, &payload, 0x40);
        let path = temp("rw", &build_elf(0x70010, abi::EM_RISCV, abi::ET_EXEC, 2, &[seg]));

        let image = Image::load(&path).unwrap();
        assert_eq!(image.entry(), 0x70010);
        assert_eq!(image.segment_count(), 1);

        let mapped = unsafe { std::slice::from_raw_parts(0x70010 as *const u8, 0x40) };
        assert_eq!(&mapped[..0x20], &payload[..]);
        assert_eq!(&mapped[0x20..], &[0u8; 0x20]);

        // The head of the page below p_vaddr is mapped and zeroed too.
        let head = unsafe { std::slice::from_raw_parts(0x70000 as *const u8, 0x10) };
        assert_eq!(head, &[0u8; 0x10]);
    }

    #[test]
    fn refuses_overlapping_mappings() {
        let claimed = unsafe {
            libc::mmap(
                0x72000 as *mut libc::c_void,
                PAGE_SIZE as usize,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        assert_eq!(claimed, 0x72000 as *mut libc::c_void);

        let seg = rw_seg(0x72000, &[0xaa; 8], 8);
        let path = temp("overlap", &build_elf(0x72000, abi::EM_RISCV, abi::ET_EXEC, 2, &[seg]));

        assert!(matches!(Image::load(&path), Err(Error::Mapping { addr: 0x72000, .. })));

        unsafe { libc::munmap(claimed, PAGE_SIZE as usize) };
    }

    #[test]
    fn maps_file_backed_segment() {
        let mut data = vec![0u8; PAGE_SIZE as usize];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let seg = Seg {
            vaddr: 0x74000,
            offset: PAGE_SIZE,
            filesz: PAGE_SIZE,
            memsz: PAGE_SIZE,
            flags: abi::PF_R,
            data,
        };
        let path = temp("ro", &build_elf(0x74000, abi::EM_RISCV, abi::ET_EXEC, 2, &[seg]));

        let image = Image::load(&path).unwrap();
        let mapped = unsafe { std::slice::from_raw_parts(0x74000 as *const u8, 16) };
        assert_eq!(mapped, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
        drop(image);
    }

    #[test]
    fn rejects_unaligned_or_padded_readonly_segments() {
        let unaligned = Seg {
            vaddr: 0x78010,
            offset: 0x200,
            filesz: 0x10,
            memsz: 0x10,
            flags: abi::PF_R,
            data: vec![0; 0x10],
        };
        let path = temp("unaligned", &build_elf(0, abi::EM_RISCV, abi::ET_EXEC, 2, &[unaligned]));
        assert!(matches!(Image::load(&path), Err(Error::InvalidElf(_))));

        let padded = Seg {
            vaddr: 0x78000,
            offset: 0x200,
            filesz: 0x10,
            memsz: 0x20,
            flags: abi::PF_R,
            data: vec![0; 0x10],
        };
        let path = temp("padded", &build_elf(0, abi::EM_RISCV, abi::ET_EXEC, 2, &[padded]));
        assert!(matches!(Image::load(&path), Err(Error::InvalidElf(_))));
    }

    #[test]
    fn drop_releases_the_mappings() {
        let seg = rw_seg(0x7a000, &[0x55; 4], 4);
        let path = temp("release", &build_elf(0x7a000, abi::EM_RISCV, abi::ET_EXEC, 2, &[seg]));

        drop(Image::load(&path).unwrap());

        // The page is free again, so a fresh no-replace mapping succeeds.
        let remapped = unsafe {
            libc::mmap(
                0x7a000 as *mut libc::c_void,
                PAGE_SIZE as usize,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        assert_eq!(remapped, 0x7a000 as *mut libc::c_void);
        unsafe { libc::munmap(remapped, PAGE_SIZE as usize) };
    }
}
