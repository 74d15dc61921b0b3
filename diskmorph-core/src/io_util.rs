//! Raw positioned-I/O helpers shared by input/output plug-ins.
//!
//! Grounded on the `pread`/`pwrite` wrappers in the teacher's `qcow2.rs`:
//! a loop around `libc::pread`/`pwrite` that treats a short read as fatal
//! (forensic reads never tolerate partial results) rather than retrying.

use std::os::unix::io::RawFd;

use crate::error::{DiskMorphError, Result};

pub fn pread_exact(fd: RawFd, buf: &mut [u8], mut offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let r = unsafe {
            libc::pread(
                fd,
                buf[pos..].as_mut_ptr() as *mut _,
                buf.len() - pos,
                offset as libc::off_t,
            )
        };
        if r < 0 {
            return Err(DiskMorphError::Io(std::io::Error::last_os_error()));
        }
        if r == 0 {
            return Err(DiskMorphError::corruption("unexpected EOF"));
        }
        pos += r as usize;
        offset += r as u64;
    }
    Ok(())
}

pub fn pwrite_all(fd: RawFd, buf: &[u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    let mut offset = offset;
    while pos < buf.len() {
        let r = unsafe {
            libc::pwrite(
                fd,
                buf[pos..].as_ptr() as *const _,
                buf.len() - pos,
                offset as libc::off_t,
            )
        };
        if r < 0 {
            return Err(DiskMorphError::Io(std::io::Error::last_os_error()));
        }
        pos += r as usize;
        offset += r as u64;
    }
    Ok(())
}

pub fn file_size_fd(fd: RawFd) -> Result<u64> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(DiskMorphError::Io(std::io::Error::last_os_error()));
    }
    Ok(stat.st_size as u64)
}

pub fn round_up(v: u64, align: u64) -> u64 {
    (v + align - 1) / align * align
}

pub fn div_round_up(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}
