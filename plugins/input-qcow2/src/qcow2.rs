//! QCOW2 reader: an in-memory L1 table read once at open, L2 tables
//! fetched per access, compressed clusters inflated on demand. Unlike
//! the write-only image used elsewhere in this tool's lineage, this side
//! only ever reads — there is no snapshot or refcount handling because
//! nothing here ever allocates a new cluster.

use std::fs::File;
use std::io::{Read as _, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use flate2::read::DeflateDecoder;

use diskmorph_core::error::{DiskMorphError, Result};

const QCOW_MAGIC: u32 = 0x514649FB; // "QFI\xFB"
const OFLAG_COPIED: u64 = 1 << 63;
const OFLAG_COMPRESSED: u64 = 1 << 62;
const PLAIN_OFFSET_MASK: u64 = 0x00FF_FFFF_FFFF_FE00;

#[repr(C)]
struct RawHeader {
    magic: u32,
    version: u32,
    backing_file_offset: u64,
    backing_file_size: u32,
    cluster_bits: u32,
    size: u64,
    crypt_method: u32,
    l1_size: u32,
    l1_table_offset: u64,
    refcount_table_offset: u64,
    refcount_table_clusters: u32,
    nb_snapshots: u32,
    snapshots_offset: u64,
}

const HEADER_LEN: usize = 72;

fn parse_header(buf: &[u8]) -> Result<RawHeader> {
    if buf.len() < HEADER_LEN {
        return Err(DiskMorphError::corruption("QCOW2 header truncated"));
    }
    let be32 = |o: usize| u32::from_be_bytes(buf[o..o + 4].try_into().unwrap());
    let be64 = |o: usize| u64::from_be_bytes(buf[o..o + 8].try_into().unwrap());
    Ok(RawHeader {
        magic: be32(0),
        version: be32(4),
        backing_file_offset: be64(8),
        backing_file_size: be32(16),
        cluster_bits: be32(20),
        size: be64(24),
        crypt_method: be32(32),
        l1_size: be32(36),
        l1_table_offset: be64(40),
        refcount_table_offset: be64(48),
        refcount_table_clusters: be32(56),
        nb_snapshots: be32(60),
        snapshots_offset: be64(64),
    })
}

pub struct Qcow2 {
    file: Mutex<File>,
    cluster_bits: u32,
    cluster_size: u64,
    image_size: u64,
    l1_table: Vec<u64>,
    compressed_split_bit: u32,
}

impl Qcow2 {
    pub fn open(path: &Path) -> Result<Qcow2> {
        let mut file = File::open(path).map_err(DiskMorphError::Io)?;
        let mut header_buf = vec![0u8; HEADER_LEN];
        file.read_exact(&mut header_buf).map_err(DiskMorphError::Io)?;
        let header = parse_header(&header_buf)?;

        if header.magic != QCOW_MAGIC {
            return Err(DiskMorphError::corruption("not a QCOW2 image (bad magic)"));
        }
        if header.version != 2 && header.version != 3 {
            return Err(DiskMorphError::unsupported("only QCOW2 versions 2 and 3 are supported"));
        }
        if header.crypt_method != 0 {
            return Err(DiskMorphError::unsupported("encrypted QCOW2 images are not supported"));
        }
        let _ = (header.backing_file_offset, header.backing_file_size);
        let _ = (header.refcount_table_offset, header.refcount_table_clusters);
        let _ = (header.nb_snapshots, header.snapshots_offset);

        let cluster_bits = header.cluster_bits;
        let cluster_size = 1u64 << cluster_bits;

        let mut l1_buf = vec![0u8; header.l1_size as usize * 8];
        file.seek(SeekFrom::Start(header.l1_table_offset)).map_err(DiskMorphError::Io)?;
        file.read_exact(&mut l1_buf).map_err(DiskMorphError::Io)?;
        let l1_table: Vec<u64> = l1_buf
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect();

        let compressed_split_bit = 64 - 2 - (cluster_bits.saturating_sub(8));

        Ok(Qcow2 {
            file: Mutex::new(file),
            cluster_bits,
            cluster_size,
            image_size: header.size,
            l1_table,
            compressed_split_bit,
        })
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.image_size)
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.image_size {
            return Err(DiskMorphError::bad_argument("read beyond QCOW2 image size"));
        }
        let want = buf.len().min((self.image_size - offset) as usize);
        let mut produced = 0usize;
        let mut pos = offset;

        while produced < want {
            let in_cluster = (pos & (self.cluster_size - 1)) as usize;
            let take = (want - produced).min(self.cluster_size as usize - in_cluster);

            let l2_entry = self.lookup_l2_entry(pos)?;
            self.read_cluster_slice(l2_entry, in_cluster, &mut buf[produced..produced + take])?;

            produced += take;
            pos += take as u64;
        }

        Ok(produced)
    }

    fn lookup_l2_entry(&self, logical_offset: u64) -> Result<u64> {
        let l2_entries = self.cluster_size / 8;
        let cluster_index = logical_offset >> self.cluster_bits;
        let l1_index = (cluster_index / l2_entries) as usize;
        let l2_index = (cluster_index % l2_entries) as usize;

        let Some(&l1_entry) = self.l1_table.get(l1_index) else {
            return Ok(0);
        };
        let l2_table_offset = l1_entry & !OFLAG_COPIED;
        if l2_table_offset == 0 {
            return Ok(0);
        }

        let mut l2_buf = vec![0u8; 8];
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(l2_table_offset + l2_index as u64 * 8))
            .map_err(DiskMorphError::Io)?;
        file.read_exact(&mut l2_buf).map_err(DiskMorphError::Io)?;
        Ok(u64::from_be_bytes(l2_buf.try_into().unwrap()))
    }

    fn read_cluster_slice(&self, l2_entry: u64, in_cluster: usize, dest: &mut [u8]) -> Result<()> {
        if l2_entry == 0 {
            dest.fill(0);
            return Ok(());
        }

        if l2_entry & OFLAG_COMPRESSED != 0 {
            let split = self.compressed_split_bit;
            let offset_mask = (1u64 << split) - 1;
            let file_offset = l2_entry & offset_mask;
            let sectors = (l2_entry >> split) & ((1u64 << (62 - split)) - 1);
            let compressed_len = (sectors + 1) * 512;

            let mut compressed = vec![0u8; compressed_len as usize];
            {
                let mut file = self.file.lock().unwrap();
                file.seek(SeekFrom::Start(file_offset)).map_err(DiskMorphError::Io)?;
                file.read_exact(&mut compressed).map_err(DiskMorphError::Io)?;
            }

            let mut decompressed = Vec::with_capacity(self.cluster_size as usize);
            DeflateDecoder::new(&compressed[..])
                .read_to_end(&mut decompressed)
                .map_err(|_| DiskMorphError::corruption("failed to inflate QCOW2 compressed cluster"))?;
            if in_cluster + dest.len() > decompressed.len() {
                return Err(DiskMorphError::corruption("decompressed QCOW2 cluster shorter than requested slice"));
            }
            dest.copy_from_slice(&decompressed[in_cluster..in_cluster + dest.len()]);
        } else {
            let file_offset = (l2_entry & !OFLAG_COPIED) & PLAIN_OFFSET_MASK;
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(file_offset + in_cluster as u64)).map_err(DiskMorphError::Io)?;
            file.read_exact(dest).map_err(DiskMorphError::Io)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_header(file: &mut File, cluster_bits: u32, size: u64, l1_table_offset: u64, l1_size: u32) {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&QCOW_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&2u32.to_be_bytes());
        buf[20..24].copy_from_slice(&cluster_bits.to_be_bytes());
        buf[24..32].copy_from_slice(&size.to_be_bytes());
        buf[36..40].copy_from_slice(&l1_size.to_be_bytes());
        buf[40..48].copy_from_slice(&l1_table_offset.to_be_bytes());
        file.write_all(&buf).unwrap();
    }

    /// Mirrors spec scenario S3: one allocated cluster, one unallocated,
    /// cluster_size=65536.
    #[test]
    fn unallocated_cluster_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.qcow2");
        let cluster_bits = 16u32; // 65536-byte clusters
        let cluster_size = 1u64 << cluster_bits;

        let mut file = File::create(&path).unwrap();
        write_header(&mut file, cluster_bits, cluster_size * 2, 4096, 1);

        // L1 table at 4096: one entry pointing at an L2 table at 8192.
        file.set_len(8192 + cluster_size).unwrap();
        file.seek(SeekFrom::Start(4096)).unwrap();
        file.write_all(&(8192u64 | OFLAG_COPIED).to_be_bytes()).unwrap();

        // L2 table at 8192: entry 0 points at cluster data, entry 1 is unallocated.
        let cluster_data_offset = 8192 + cluster_size;
        file.set_len(cluster_data_offset + cluster_size).unwrap();
        file.seek(SeekFrom::Start(8192)).unwrap();
        file.write_all(&(cluster_data_offset | OFLAG_COPIED).to_be_bytes()).unwrap();
        file.write_all(&0u64.to_be_bytes()).unwrap();

        let pattern = vec![0x42u8; cluster_size as usize];
        file.seek(SeekFrom::Start(cluster_data_offset)).unwrap();
        file.write_all(&pattern).unwrap();
        drop(file);

        let qcow2 = Qcow2::open(&path).unwrap();
        let mut out = vec![0xFFu8; (cluster_size * 2) as usize];
        let n = qcow2.read(0, &mut out).unwrap();
        assert_eq!(n, out.len());
        assert_eq!(&out[..cluster_size as usize], &pattern[..]);
        assert!(out[cluster_size as usize..].iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_non_qcow2_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.qcow2");
        let mut file = File::create(&path).unwrap();
        file.write_all(&[0u8; HEADER_LEN]).unwrap();
        drop(file);
        assert!(Qcow2::open(&path).is_err());
    }
}
