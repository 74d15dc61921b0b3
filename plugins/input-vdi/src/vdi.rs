//! VDI reader: a 512-byte header (leading with the VirtualBox text
//! comment, then the signature/version/geometry fields) followed by a
//! block map (one u32 per block) and the block data itself. A discarded
//! or unallocated block entry reads back as zero; everything else is one
//! seek-and-read.

use std::fs::File;
use std::io::{Read as _, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use diskmorph_core::error::{DiskMorphError, Result};

pub const COMMENT_LEN: usize = 64;
pub const SIGNATURE: u32 = 0xBEDA_107F;
pub const VERSION: u32 = 0x0001_0001;
pub const HEADER_LEN: u64 = 512;
pub const UNALLOCATED: u32 = u32::MAX;

const SIGNATURE_OFF: usize = COMMENT_LEN;
const VERSION_OFF: usize = SIGNATURE_OFF + 4;
const BLOCK_SIZE_OFF: usize = VERSION_OFF + 4;
const BLOCK_COUNT_OFF: usize = BLOCK_SIZE_OFF + 8;
const BLOCK_MAP_OFFSET_OFF: usize = BLOCK_COUNT_OFF + 8;
const DISK_SIZE_OFF: usize = BLOCK_MAP_OFFSET_OFF + 8;

struct Header {
    block_size: u64,
    block_count: u64,
    block_map_offset: u64,
    disk_size: u64,
}

fn parse_header(buf: &[u8]) -> Result<Header> {
    if buf.len() < HEADER_LEN as usize {
        return Err(DiskMorphError::corruption("VDI header truncated"));
    }
    let signature = u32::from_le_bytes(buf[SIGNATURE_OFF..SIGNATURE_OFF + 4].try_into().unwrap());
    let version = u32::from_le_bytes(buf[VERSION_OFF..VERSION_OFF + 4].try_into().unwrap());
    if signature != SIGNATURE || version != VERSION {
        return Err(DiskMorphError::corruption("not a VDI image (bad signature or version)"));
    }
    let block_size = u64::from_le_bytes(buf[BLOCK_SIZE_OFF..BLOCK_SIZE_OFF + 8].try_into().unwrap());
    let block_count =
        u64::from_le_bytes(buf[BLOCK_COUNT_OFF..BLOCK_COUNT_OFF + 8].try_into().unwrap());
    let block_map_offset =
        u64::from_le_bytes(buf[BLOCK_MAP_OFFSET_OFF..BLOCK_MAP_OFFSET_OFF + 8].try_into().unwrap());
    let disk_size = u64::from_le_bytes(buf[DISK_SIZE_OFF..DISK_SIZE_OFF + 8].try_into().unwrap());
    Ok(Header { block_size, block_count, block_map_offset, disk_size })
}

pub struct Vdi {
    file: Mutex<File>,
    block_size: u64,
    disk_size: u64,
    block_map: Vec<u32>,
    data_offset: u64,
}

impl Vdi {
    pub fn open(path: &Path) -> Result<Vdi> {
        let mut file = File::open(path).map_err(DiskMorphError::Io)?;
        let mut header_buf = vec![0u8; HEADER_LEN as usize];
        file.read_exact(&mut header_buf).map_err(DiskMorphError::Io)?;
        let header = parse_header(&header_buf)?;

        let mut map_buf = vec![0u8; header.block_count as usize * 4];
        file.seek(SeekFrom::Start(header.block_map_offset)).map_err(DiskMorphError::Io)?;
        file.read_exact(&mut map_buf).map_err(DiskMorphError::Io)?;
        let block_map: Vec<u32> = map_buf
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();

        let data_offset = header.block_map_offset + header.block_count * 4;

        Ok(Vdi {
            file: Mutex::new(file),
            block_size: header.block_size,
            disk_size: header.disk_size,
            block_map,
            data_offset,
        })
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.disk_size)
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.disk_size {
            return Err(DiskMorphError::bad_argument("read beyond VDI disk size"));
        }
        let want = buf.len().min((self.disk_size - offset) as usize);
        let mut produced = 0usize;
        let mut pos = offset;

        while produced < want {
            let block_index = (pos / self.block_size) as usize;
            let in_block = (pos % self.block_size) as usize;
            let take = (want - produced).min(self.block_size as usize - in_block);

            let entry = *self.block_map.get(block_index)
                .ok_or_else(|| DiskMorphError::corruption("block index out of range"))?;
            if entry == UNALLOCATED {
                buf[produced..produced + take].fill(0);
            } else {
                let file_offset = self.data_offset + entry as u64 * self.block_size + in_block as u64;
                let mut file = self.file.lock().unwrap();
                file.seek(SeekFrom::Start(file_offset)).map_err(DiskMorphError::Io)?;
                file.read_exact(&mut buf[produced..produced + take]).map_err(DiskMorphError::Io)?;
            }

            produced += take;
            pos += take as u64;
        }

        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_header(block_size: u64, block_count: u64, disk_size: u64) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN as usize];
        buf[SIGNATURE_OFF..SIGNATURE_OFF + 4].copy_from_slice(&SIGNATURE.to_le_bytes());
        buf[VERSION_OFF..VERSION_OFF + 4].copy_from_slice(&VERSION.to_le_bytes());
        buf[BLOCK_SIZE_OFF..BLOCK_SIZE_OFF + 8].copy_from_slice(&block_size.to_le_bytes());
        buf[BLOCK_COUNT_OFF..BLOCK_COUNT_OFF + 8].copy_from_slice(&block_count.to_le_bytes());
        buf[BLOCK_MAP_OFFSET_OFF..BLOCK_MAP_OFFSET_OFF + 8].copy_from_slice(&HEADER_LEN.to_le_bytes());
        buf[DISK_SIZE_OFF..DISK_SIZE_OFF + 8].copy_from_slice(&disk_size.to_le_bytes());
        buf
    }

    #[test]
    fn unallocated_block_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.vdi");
        let block_size = 4096u64;

        let mut file = File::create(&path).unwrap();
        file.write_all(&build_header(block_size, 2, block_size * 2)).unwrap();
        file.write_all(&0u32.to_le_bytes()).unwrap(); // block 0 -> file block 0
        file.write_all(&UNALLOCATED.to_le_bytes()).unwrap(); // block 1 unallocated
        let pattern = vec![0x7Au8; block_size as usize];
        file.write_all(&pattern).unwrap();
        drop(file);

        let vdi = Vdi::open(&path).unwrap();
        let mut out = vec![0xFFu8; (block_size * 2) as usize];
        let n = vdi.read(0, &mut out).unwrap();
        assert_eq!(n, out.len());
        assert_eq!(&out[..block_size as usize], &pattern[..]);
        assert!(out[block_size as usize..].iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_bad_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.vdi");
        let mut file = File::create(&path).unwrap();
        file.write_all(&[0u8; HEADER_LEN as usize]).unwrap();
        drop(file);
        assert!(Vdi::open(&path).is_err());
    }
}
