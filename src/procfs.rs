use crate::{*, error::*};
use std::io::{BufReader, BufRead};
use std::{fs::File, mem::MaybeUninit, sync::Arc};
use bitflags::*;
use libc::{pid_t, c_void};

#[derive(Clone, Debug)]
pub struct MemMapInfo {
    pub start: usize,
    pub len: usize,
    pub perms: MemMapPermissions,
    pub offset: usize,
    pub inode: u64,
    pub path: Option<String>,
}

bitflags! { pub struct MemMapPermissions: u8 {
        const READ = 0b00001;
        const WRITE = 0b00010;
        const EXECUTE = 0b00100;
        const SHARED = 0b01000;
        const PRIVATE = 0b10000;
}}

// Information from /proc/[pid]/maps
#[derive(Default, Clone)]
pub struct MemMapsInfo {
    pub maps: Vec<MemMapInfo>, // sorted by address
}

impl MemMapsInfo {
    pub fn read_proc_maps(pid: pid_t) -> Result<MemMapsInfo> {
        let reader = BufReader::new(File::open(format!("/proc/{}/maps", pid))?);
        let mut res: Vec<MemMapInfo> = Vec::new();
        for line in reader.lines() {
            res.push(Self::parse_line(&line?)?);
        }
        res.sort_by_key(|m| m.start);
        Ok(MemMapsInfo {maps: res})
    }

    pub fn parse_line(line: &str) -> Result<MemMapInfo> {
        // The last field of the line is path. It can contain spaces (including trailing), so no split_whitespace().

        let mut s = line.trim_start().splitn(2, ' ');
        let (range, rest) = (s.next(), s.next());
        let (Some(range), Some(rest)) = (range, rest) else { return err!(Format, "too few fields") };

        let mut s = range.splitn(2, '-');
        let (Some(start), Some(end)) = (s.next(), s.next()) else { return err!(Format, "bad range") };
        let start = usize::from_str_radix(start, 16)?;
        let end = usize::from_str_radix(end, 16)?;
        if end < start {
            return err!(Format, "bad range");
        }

        let mut s = rest.trim_start().splitn(2, ' ');
        let (Some(perms), Some(rest)) = (s.next(), s.next()) else { return err!(Format, "too few fields") };
        let mut permissions = MemMapPermissions::empty();
        for ch in perms.chars() {
            match ch {
                'r' => permissions.insert(MemMapPermissions::READ),
                'w' => permissions.insert(MemMapPermissions::WRITE),
                'x' => permissions.insert(MemMapPermissions::EXECUTE),
                's' => permissions.insert(MemMapPermissions::SHARED),
                'p' => permissions.insert(MemMapPermissions::PRIVATE),
                _ => (),
            }
        }

        let mut s = rest.trim_start().splitn(2, ' ');
        let (Some(offset), Some(rest)) = (s.next(), s.next()) else { return err!(Format, "too few fields") };
        let offset = usize::from_str_radix(offset, 16)?;

        let mut s = rest.trim_start().splitn(2, ' ');
        let (Some(_dev), Some(rest)) = (s.next(), s.next()) else { return err!(Format, "too few fields") };

        let mut s = rest.trim_start().splitn(2, ' ');
        let (inode, rest) = (s.next(), s.next());
        let Some(inode) = inode else { return err!(Format, "too few fields") };
        let inode = u64::from_str_radix(inode, 10)?;

        let path = match rest { None => None, Some(p) if p.trim().is_empty() => None, Some(p) => Some(p.trim_start().to_string()) };

        Ok(MemMapInfo {start, len: end - start, perms: permissions, offset, inode, path})
    }

    pub fn addr_to_map(&self, addr: usize) -> Option<&MemMapInfo> {
        let idx = self.maps.partition_point(|m| m.start + m.len <= addr);
        if idx < self.maps.len() && self.maps[idx].start <= addr {
            Some(&self.maps[idx])
        } else {
            None
        }
    }

    // Number of readable bytes from addr to the end of its run of adjacent readable maps.
    pub fn readable_extent(&self, addr: usize) -> Option<usize> {
        let mut idx = self.maps.partition_point(|m| m.start + m.len <= addr);
        if idx >= self.maps.len() || self.maps[idx].start > addr || !self.maps[idx].perms.contains(MemMapPermissions::READ) {
            return None;
        }
        let mut end = self.maps[idx].start + self.maps[idx].len;
        idx += 1;
        while idx < self.maps.len() && self.maps[idx].start == end && self.maps[idx].perms.contains(MemMapPermissions::READ) {
            end += self.maps[idx].len;
            idx += 1;
        }
        Some(end - addr)
    }
}

// Thing for reading the target's memory, either from a running process or from a captured snapshot.
// Copyable for convenience, even though it adds extra Arc dereference when reading from a snapshot.
// Every read goes to the target; nothing is cached, because the target may be running.
#[derive(Clone)]
pub enum MemReader {
    Invalid,
    Pid(PidMemReader),
    Snapshot(Arc<MemSnapshot>),
}
impl MemReader {
    pub fn check_valid(&self) -> Result<()> { match &self {Self::Invalid => err!(ProcessState, "no process"), _ => Ok(())} }

    pub fn read_uninit<'a>(&self, offset: usize, buf: &'a mut [MaybeUninit<u8>]) -> Result<&'a mut [u8]> {
        if buf.len() > usize::MAX - offset {
            return err_at!(UnreadableMemory, offset, "bad memory range: 0x{:x} + 0x{:x}", offset, buf.len());
        }
        match self {
            Self::Invalid => return err!(ProcessState, "no process"),
            Self::Pid(r) => return r.read_uninit(offset, buf),
            Self::Snapshot(r) => return r.read_uninit(offset, buf),
        }
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        unsafe {self.read_uninit(offset, std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len()))}?;
        Ok(())
    }

    pub fn read_vec(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut v = vec![0u8; len];
        self.read(offset, &mut v)?;
        Ok(v)
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read(offset, &mut buf)?;
        Ok(buf[0])
    }
    pub fn read_u16(&self, offset: usize) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read(offset, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
    pub fn read_i32(&self, offset: usize) -> Result<i32> {
        Ok(self.read_u32(offset)? as i32)
    }
    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
    pub fn read_usize(&self, offset: usize) -> Result<usize> {
        let mut buf = [0u8; 8];
        self.read(offset, &mut buf)?;
        Ok(usize::from_le_bytes(buf))
    }

    // Reads a NUL-terminated string of at most max_len bytes, in small chunks so that a string
    // near the end of a mapping doesn't fail just because max_len would cross into unmapped memory.
    pub fn read_cstring(&self, mut offset: usize, max_len: usize) -> Result<String> {
        let start = offset;
        let mut res: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 64];
        while res.len() < max_len {
            // Don't cross a page boundary within one read.
            let mut n = (4096 - (offset & 4095)).min(chunk.len()).min(max_len - res.len());
            if self.read(offset, &mut chunk[..n]).is_err() {
                // The mapping may end before the chunk does. Fall back to one byte at a time.
                n = 1;
                self.read(offset, &mut chunk[..1]).map_err(|e| e.at(start))?;
            }
            if let Some(end) = chunk[..n].iter().position(|&b| b == 0) {
                res.extend_from_slice(&chunk[..end]);
                return Ok(String::from_utf8_lossy(&res).into_owned());
            }
            res.extend_from_slice(&chunk[..n]);
            offset += n;
        }
        err_at!(TooLong, start, "string longer than {} bytes", max_len)
    }

    // How many bytes starting at addr are mapped readable, if known. Used for sanity bounds on lengths read from the target.
    pub fn readable_extent(&self, addr: usize) -> Option<usize> {
        match self {
            Self::Invalid => None,
            Self::Pid(r) => match MemMapsInfo::read_proc_maps(r.pid) {
                Ok(maps) => maps.readable_extent(addr),
                Err(_) => None,
            }
            Self::Snapshot(r) => r.readable_extent(addr),
        }
    }
}

#[derive(Clone)]
pub struct PidMemReader {
    pid: pid_t,
}
impl PidMemReader {
    pub fn new(pid: pid_t) -> Self { PidMemReader {pid: pid} }

    pub fn pid(&self) -> pid_t { self.pid }

    pub fn read_uninit<'a>(&self, addr: usize, buf: &'a mut [MaybeUninit<u8>]) -> Result<&'a mut [u8]> {
        if buf.is_empty() {
            return Ok(&mut []);
        }
        unsafe {
            let local_iov = libc::iovec {iov_base: buf.as_mut_ptr() as *mut c_void, iov_len: buf.len()};
            let mut remote_iov = libc::iovec {iov_base: addr as *mut c_void, iov_len: buf.len()};
            let r = libc::process_vm_readv(self.pid, &local_iov as *const libc::iovec, 1, &mut remote_iov as *mut libc::iovec, 1, 0);
            if r < 0 {
                if *libc::__errno_location() == libc::EFAULT {
                    return err_at!(UnreadableMemory, addr, "bad address"); // shorter message for common error
                } else {
                    let e: Result<&mut [u8]> = errno_err!("process_vm_readv failed");
                    return e.map_err(|e| e.at(addr));
                }
            }
            // A short read means the range crosses into unmapped memory. Don't return partial data.
            if r != buf.len() as isize {
                return err_at!(UnreadableMemory, addr, "unexpected EOF in mem @{:x}:0x{:x}", addr, buf.len());
            }
            Ok(std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut u8, buf.len()))
        }
    }
}

// Captured pieces of a target's address space. Reads must fall entirely within one segment.
#[derive(Default)]
pub struct MemSnapshot {
    segments: Vec<(/*start*/ usize, Vec<u8>)>, // sorted by start, non-overlapping
}
impl MemSnapshot {
    pub fn new() -> Self { Self::default() }

    pub fn add_segment(&mut self, start: usize, data: Vec<u8>) -> Result<()> {
        let end = match start.checked_add(data.len()) {
            Some(e) => e,
            None => return err!(Usage, "segment 0x{:x} + 0x{:x} overflows", start, data.len()),
        };
        let idx = self.segments.partition_point(|(s, d)| s + d.len() <= start);
        if idx < self.segments.len() && self.segments[idx].0 < end {
            return err!(Usage, "segment 0x{:x}-0x{:x} overlaps an existing one at 0x{:x}", start, end, self.segments[idx].0);
        }
        self.segments.insert(idx, (start, data));
        Ok(())
    }

    fn find(&self, addr: usize) -> Option<&(usize, Vec<u8>)> {
        let idx = self.segments.partition_point(|(s, d)| s + d.len() <= addr);
        match self.segments.get(idx) {
            Some(seg) if seg.0 <= addr => Some(seg),
            _ => None,
        }
    }

    pub fn read_uninit<'a>(&self, addr: usize, buf: &'a mut [MaybeUninit<u8>]) -> Result<&'a mut [u8]> {
        if buf.is_empty() {
            return Ok(&mut []);
        }
        let Some((start, data)) = self.find(addr) else { return err_at!(UnreadableMemory, addr, "bad address") };
        let off = addr - start;
        if buf.len() > data.len() - off {
            return err_at!(UnreadableMemory, addr, "unexpected EOF in mem @{:x}:0x{:x}", addr, buf.len());
        }
        let n = buf.len();
        for (dst, src) in buf.iter_mut().zip(&data[off..off + n]) {
            *dst = MaybeUninit::new(*src);
        }
        Ok(unsafe {std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut u8, buf.len())})
    }

    pub fn readable_extent(&self, addr: usize) -> Option<usize> {
        self.find(addr).map(|(start, data)| start + data.len() - addr)
    }
}
