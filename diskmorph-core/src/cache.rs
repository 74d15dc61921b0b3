//! Copy-on-write block cache.
//!
//! Sits between the consumer and the output envelope: reads of untouched
//! blocks fall through to the envelope, writes are diverted into a
//! private cache file so the evidence is never touched. The in-memory
//! block index mirrors the on-disk one exactly; every mutation is
//! flushed before the call that caused it returns.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use crate::error::{DiskMorphError, Result};
use crate::image::Image;
use crate::io_util::div_round_up;

pub const BLOCK_SIZE: u64 = 1024 * 1024;
const MAGIC: [u8; 8] = *b"\x78\x6D\x6F\x75\x6E\x74\xFF\xFF";
const VERSION: u32 = 2;
const HEADER_SIZE: u64 = 512;
const SENTINEL: u64 = u64::MAX;

struct Header {
    block_size: u64,
    block_count: u64,
    index_offset: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&VERSION.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.block_size.to_ne_bytes());
        buf[24..32].copy_from_slice(&self.block_count.to_ne_bytes());
        buf[32..40].copy_from_slice(&self.index_offset.to_ne_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_SIZE as usize]) -> Result<Header> {
        if buf[0..8] != MAGIC {
            return Err(DiskMorphError::corruption("bad cache file magic"));
        }
        let version = u32::from_ne_bytes(buf[8..12].try_into().unwrap());
        if version != VERSION {
            return Err(DiskMorphError::unsupported(format!(
                "cache file version {version} is incompatible (expected {VERSION}); refusing to migrate"
            )));
        }
        Ok(Header {
            block_size: u64::from_ne_bytes(buf[16..24].try_into().unwrap()),
            block_count: u64::from_ne_bytes(buf[24..32].try_into().unwrap()),
            index_offset: u64::from_ne_bytes(buf[32..40].try_into().unwrap()),
        })
    }
}

struct State {
    file: File,
    index: Vec<u64>,
    index_offset: u64,
    append_pos: u64,
}

/// The copy-on-write cache. `inner` is the layer beneath it — typically
/// an output envelope — consulted on every cache miss.
pub struct CowCache {
    inner: Box<dyn Image>,
    envelope_size: u64,
    state: Mutex<State>,
}

impl CowCache {
    /// Open an existing cache file, validating it against `envelope_size`,
    /// or create a fresh one (when the file doesn't exist, or `overwrite`
    /// is set).
    pub fn open(inner: Box<dyn Image>, path: &std::path::Path, overwrite: bool) -> Result<Self> {
        let envelope_size = inner.size()?;
        let block_count = div_round_up(envelope_size, BLOCK_SIZE);

        let exists = path.exists();
        let state = if exists && !overwrite {
            Self::open_existing(path, block_count)?
        } else {
            Self::create(path, block_count)?
        };

        Ok(CowCache { inner, envelope_size, state: Mutex::new(state) })
    }

    fn create(path: &std::path::Path, block_count: u64) -> Result<State> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let index_offset = HEADER_SIZE;
        let header = Header { block_size: BLOCK_SIZE, block_count, index_offset };
        file.write_all(&header.encode())?;

        let index = vec![SENTINEL; block_count as usize];
        let index_bytes: Vec<u8> = index.iter().flat_map(|v| v.to_ne_bytes()).collect();
        file.write_all(&index_bytes)?;
        file.flush()?;
        file.sync_all()?;

        let append_pos = index_offset + index_bytes.len() as u64;
        Ok(State { file, index, index_offset, append_pos })
    }

    fn open_existing(path: &std::path::Path, block_count: u64) -> Result<State> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header_buf = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header_buf)?;
        let header = Header::decode(&header_buf)?;

        if header.block_size != BLOCK_SIZE {
            return Err(DiskMorphError::corruption("cache block size mismatch"));
        }
        if header.block_count != block_count {
            return Err(DiskMorphError::corruption(
                "cache block count does not match envelope size",
            ));
        }

        file.seek(SeekFrom::Start(header.index_offset))?;
        let mut index_bytes = vec![0u8; block_count as usize * 8];
        file.read_exact(&mut index_bytes)?;
        let index: Vec<u64> = index_bytes
            .chunks_exact(8)
            .map(|c| u64::from_ne_bytes(c.try_into().unwrap()))
            .collect();

        let append_pos = index
            .iter()
            .filter(|&&off| off != SENTINEL)
            .map(|&off| off + BLOCK_SIZE)
            .max()
            .unwrap_or(header.index_offset + index_bytes.len() as u64);

        Ok(State { file, index, index_offset: header.index_offset, append_pos })
    }

    fn block_range(&self, offset: u64, len: u64) -> (u64, u64) {
        let first = offset / BLOCK_SIZE;
        let last = (offset + len.max(1) - 1) / BLOCK_SIZE;
        (first, last)
    }

    fn persist_entry(state: &mut State, block: u64) -> Result<()> {
        let entry_offset = state.index_offset + block * 8;
        state.file.seek(SeekFrom::Start(entry_offset))?;
        state.file.write_all(&state.index[block as usize].to_ne_bytes())?;
        state.file.flush()?;
        state.file.sync_all()?;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.envelope_size
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.envelope_size {
            return Err(DiskMorphError::bad_argument("read beyond envelope size"));
        }
        let len = (buf.len() as u64).min(self.envelope_size - offset);
        let (first_block, last_block) = self.block_range(offset, len);

        let mut state = self.state.lock().unwrap();
        let mut produced = 0usize;
        let mut cur = offset;
        let end = offset + len;

        for block in first_block..=last_block {
            let block_start = block * BLOCK_SIZE;
            let block_end = (block_start + BLOCK_SIZE).min(self.envelope_size);
            let want_start = cur.max(block_start);
            let want_end = end.min(block_end);
            if want_start >= want_end {
                continue;
            }
            let want_len = (want_end - want_start) as usize;
            let out = &mut buf[produced..produced + want_len];

            let index_entry = state.index[block as usize];
            if index_entry == SENTINEL {
                drop(state);
                let n = self.inner.read(want_start, out)?;
                if n != want_len {
                    return Err(DiskMorphError::corruption("short read from envelope"));
                }
                state = self.state.lock().unwrap();
            } else {
                let in_block_offset = want_start - block_start;
                state.file.seek(SeekFrom::Start(index_entry + in_block_offset))?;
                state.file.read_exact(out)?;
            }

            produced += want_len;
            cur = want_end;
        }

        Ok(produced)
    }

    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        if offset >= self.envelope_size {
            return Err(DiskMorphError::bad_argument("write beyond envelope size"));
        }
        let len = (buf.len() as u64).min(self.envelope_size - offset);
        let (first_block, last_block) = self.block_range(offset, len);

        let mut state = self.state.lock().unwrap();
        let mut consumed = 0usize;
        let mut cur = offset;
        let end = offset + len;

        for block in first_block..=last_block {
            let block_start = block * BLOCK_SIZE;
            let block_end = (block_start + BLOCK_SIZE).min(self.envelope_size);
            let want_start = cur.max(block_start);
            let want_end = end.min(block_end);
            if want_start >= want_end {
                continue;
            }
            let want_len = (want_end - want_start) as usize;
            let chunk = &buf[consumed..consumed + want_len];
            let in_block_offset = want_start - block_start;

            let index_entry = state.index[block as usize];
            if index_entry != SENTINEL {
                state.file.seek(SeekFrom::Start(index_entry + in_block_offset))?;
                state.file.write_all(chunk)?;
                state.file.flush()?;
                state.file.sync_all()?;
            } else {
                let full_block = (block_end - block_start) == BLOCK_SIZE
                    && in_block_offset == 0
                    && want_len as u64 == BLOCK_SIZE;

                let mut scratch = vec![0u8; BLOCK_SIZE as usize];
                let scratch_len = (block_end - block_start) as usize;
                if !full_block {
                    drop(state);
                    let n = self.inner.read(block_start, &mut scratch[..scratch_len])?;
                    if n != scratch_len {
                        return Err(DiskMorphError::corruption(
                            "short read-modify-write from envelope",
                        ));
                    }
                    state = self.state.lock().unwrap();
                }
                scratch[in_block_offset as usize..in_block_offset as usize + want_len]
                    .copy_from_slice(chunk);

                let new_offset = state.append_pos;
                state.file.seek(SeekFrom::Start(new_offset))?;
                state.file.write_all(&scratch)?;
                state.file.flush()?;
                state.file.sync_all()?;

                state.append_pos += BLOCK_SIZE;
                state.index[block as usize] = new_offset;
                Self::persist_entry(&mut state, block)?;
            }

            consumed += want_len;
            cur = want_end;
        }

        Ok(consumed)
    }

    /// Every non-sentinel index entry references a unique, block-sized,
    /// in-bounds region — the invariant backing property 6 in the spec.
    #[cfg(test)]
    fn check_well_formed(&self) -> bool {
        let state = self.state.lock().unwrap();
        let file_len = state.file.metadata().map(|m| m.len()).unwrap_or(0);
        let mut seen = std::collections::HashSet::new();
        for &entry in &state.index {
            if entry == SENTINEL {
                continue;
            }
            if !seen.insert(entry) {
                return false;
            }
            if entry + BLOCK_SIZE > file_len {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeEnvelope {
        data: StdMutex<Vec<u8>>,
    }

    impl Image for FakeEnvelope {
        fn size(&self) -> Result<u64> {
            Ok(self.data.lock().unwrap().len() as u64)
        }

        fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            let data = self.data.lock().unwrap();
            let offset = offset as usize;
            let n = buf.len().min(data.len().saturating_sub(offset));
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }
    }

    fn fake(size: usize, fill: u8) -> Box<dyn Image> {
        Box::new(FakeEnvelope { data: StdMutex::new(vec![fill; size]) })
    }

    #[test]
    fn reads_through_when_uncached() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.xmc");
        let cache = CowCache::open(fake(10 * 1024 * 1024, 0xAA), &cache_path, false).unwrap();

        let mut buf = [0u8; 16];
        cache.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xAAu8; 16]);
    }

    #[test]
    fn write_then_read_is_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.xmc");
        let cache = CowCache::open(fake(10 * 1024 * 1024, 0), &cache_path, false).unwrap();

        let data = vec![0xFFu8; 4096];
        cache.write(2 * 1024 * 1024, &data).unwrap();

        let mut buf = vec![0u8; 4096];
        cache.read(2 * 1024 * 1024, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert!(cache.check_well_formed());
    }

    #[test]
    fn partial_block_write_is_read_modify_write() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.xmc");
        let cache = CowCache::open(fake(BLOCK_SIZE as usize, 0x11), &cache_path, false).unwrap();

        cache.write(10, &[0xEE; 4]).unwrap();

        let mut whole = vec![0u8; BLOCK_SIZE as usize];
        cache.read(0, &mut whole).unwrap();
        assert_eq!(&whole[0..10], &[0x11; 10]);
        assert_eq!(&whole[10..14], &[0xEE; 4]);
        assert_eq!(whole[14], 0x11);
    }

    #[test]
    fn reopen_without_overwrite_preserves_writes() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.xmc");
        {
            let cache = CowCache::open(fake(BLOCK_SIZE as usize, 0), &cache_path, false).unwrap();
            cache.write(0, &[0x42; 8]).unwrap();
        }
        let cache = CowCache::open(fake(BLOCK_SIZE as usize, 0), &cache_path, false).unwrap();
        let mut buf = [0u8; 8];
        cache.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0x42; 8]);
    }

    #[test]
    fn overwrite_discards_prior_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.xmc");
        {
            let cache = CowCache::open(fake(BLOCK_SIZE as usize, 0), &cache_path, false).unwrap();
            cache.write(0, &[0x42; 8]).unwrap();
        }
        let cache = CowCache::open(fake(BLOCK_SIZE as usize, 0x99), &cache_path, true).unwrap();
        let mut buf = [0u8; 8];
        cache.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0x99; 8]);
    }

    #[test]
    fn reads_beyond_size_fail() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.xmc");
        let cache = CowCache::open(fake(1024, 0), &cache_path, false).unwrap();
        let mut buf = [0u8; 8];
        assert!(cache.read(2000, &mut buf).is_err());
    }
}
