//! EWF/AEWF reader: parses the segment/section/table structure at open
//! time, then serves `Read` by walking chunk-by-chunk through cached
//! tables and segment handles.

use std::fs::File;
use std::io::{Read as _, Seek, SeekFrom};
use std::path::PathBuf;

use flate2::read::DeflateDecoder;

use diskmorph_core::error::{DiskMorphError, Result};
use diskmorph_core::lru::LruCache;
use diskmorph_core::worker::WorkerPool;

use crate::format::{
    self, decode_table_entries, parse_file_header, parse_section_header, parse_table_header,
    parse_volume_section, SectionType, AEWF_MAX_CHUNK_SIZE, AEWF_MAX_SECTION_COUNT,
    AEWF_MAX_SECTORS_PER_CHUNK, AEWF_MAX_SECTOR_SIZE, COMPRESSED_FLAG, SECTION_HEADER_LEN,
};

struct Segment {
    path: PathBuf,
    file_size: u64,
}

/// A decoded chunk-offset table: one entry per chunk this table covers,
/// already resolved to an absolute file offset plus the compressed flag.
struct DecodedTable {
    entries: Vec<(u64, bool)>,
}

struct TableMeta {
    chunk_from: u64,
    chunk_to: u64,
    segment_idx: usize,
    table_base_offset: u64,
    raw_offset: u64,
    raw_size: u64,
    chunk_count: u32,
    sectors_end: u64,
}

pub struct Ewf {
    segments: Vec<Segment>,
    tables: Vec<TableMeta>,
    sector_size: u64,
    sectors_per_chunk: u64,
    chunk_size: u64,
    image_size: u64,

    handles: std::sync::Mutex<LruCache<usize, File>>,
    decoded: std::sync::Mutex<LruCache<usize, DecodedTable>>,
    workers: WorkerPool,
}

impl Ewf {
    pub fn open(paths: &[PathBuf], max_open_segments: u64, table_cache_bytes: u64, worker_count: usize) -> Result<Ewf> {
        if paths.is_empty() {
            return Err(DiskMorphError::bad_argument("no EWF segment files given"));
        }

        let mut segments = Vec::with_capacity(paths.len());
        let mut seen_numbers = std::collections::HashSet::new();
        let mut tables = Vec::new();
        let mut sector_size = 0u64;
        let mut sectors_per_chunk = 0u64;
        let mut sector_count = 0u64;
        let mut volume_seen = false;
        let mut chunks_seen = 0u64;

        for (idx, path) in paths.iter().enumerate() {
            let mut file = File::open(path).map_err(DiskMorphError::Io)?;
            let file_size = file.metadata().map_err(DiskMorphError::Io)?.len();

            let mut header_buf = [0u8; format::FILE_HEADER_LEN];
            file.read_exact(&mut header_buf).map_err(DiskMorphError::Io)?;
            let header = parse_file_header(&header_buf)?;
            if !seen_numbers.insert(header.segment_number) {
                return Err(DiskMorphError::corruption("duplicate EWF segment number"));
            }

            segments.push(Segment { path: path.clone(), file_size });

            let mut pos = format::FILE_HEADER_LEN as u64;
            let mut section_count = 0u64;
            let mut pending_sectors: Option<(u64, u64)> = None;

            loop {
                if section_count > AEWF_MAX_SECTION_COUNT {
                    return Err(DiskMorphError::corruption("segment has too many sections"));
                }
                section_count += 1;

                file.seek(SeekFrom::Start(pos)).map_err(DiskMorphError::Io)?;
                let mut hdr_buf = [0u8; SECTION_HEADER_LEN];
                if file.read_exact(&mut hdr_buf).is_err() {
                    break;
                }
                let section = parse_section_header(&hdr_buf)?;
                let data_offset = pos + SECTION_HEADER_LEN as u64;

                match section.kind {
                    SectionType::Volume => {
                        let len = (section.size.saturating_sub(SECTION_HEADER_LEN as u64)) as usize;
                        let mut buf = vec![0u8; len];
                        file.seek(SeekFrom::Start(data_offset)).map_err(DiskMorphError::Io)?;
                        file.read_exact(&mut buf).map_err(DiskMorphError::Io)?;
                        let vol = parse_volume_section(&buf)?;
                        if vol.bytes_per_sector as u64 > AEWF_MAX_SECTOR_SIZE
                            || vol.sectors_per_chunk as u64 > AEWF_MAX_SECTORS_PER_CHUNK
                        {
                            return Err(DiskMorphError::corruption("volume section exceeds sanity limits"));
                        }
                        sector_size = vol.bytes_per_sector as u64;
                        sectors_per_chunk = vol.sectors_per_chunk as u64;
                        sector_count = vol.sector_count;
                        volume_seen = true;
                    }
                    SectionType::Sectors => {
                        pending_sectors = Some((data_offset, section.size.saturating_sub(SECTION_HEADER_LEN as u64)));
                    }
                    SectionType::Table => {
                        if !volume_seen {
                            return Err(DiskMorphError::corruption("table section precedes volume section"));
                        }
                        let (sectors_offset, sectors_size) = pending_sectors
                            .take()
                            .ok_or_else(|| DiskMorphError::corruption("table section has no preceding sectors section"))?;

                        let mut thdr_buf = [0u8; format::TABLE_HEADER_LEN];
                        file.seek(SeekFrom::Start(data_offset)).map_err(DiskMorphError::Io)?;
                        file.read_exact(&mut thdr_buf).map_err(DiskMorphError::Io)?;
                        let thdr = parse_table_header(&thdr_buf)?;

                        let chunk_size_bytes = sectors_per_chunk * sector_size;
                        if chunk_size_bytes > AEWF_MAX_CHUNK_SIZE {
                            return Err(DiskMorphError::corruption("chunk size exceeds sanity limit"));
                        }

                        tables.push(TableMeta {
                            chunk_from: chunks_seen,
                            chunk_to: chunks_seen + thdr.chunk_count as u64 - 1,
                            segment_idx: idx,
                            table_base_offset: thdr.table_base_offset,
                            raw_offset: data_offset + format::TABLE_HEADER_LEN as u64,
                            raw_size: thdr.chunk_count as u64 * 4,
                            chunk_count: thdr.chunk_count,
                            sectors_end: sectors_offset + sectors_size,
                        });
                        chunks_seen += thdr.chunk_count as u64;
                    }
                    SectionType::Hash | SectionType::Other => {}
                }

                if section.offset_next == pos || section.offset_next == 0 {
                    break;
                }
                pos = section.offset_next;
                if pos >= file_size {
                    break;
                }
            }
        }

        if !volume_seen {
            return Err(DiskMorphError::corruption("no volume section found in any segment"));
        }
        let chunk_size = sectors_per_chunk * sector_size;
        let image_size = sector_count * sector_size;

        Ok(Ewf {
            segments,
            tables,
            sector_size,
            sectors_per_chunk,
            chunk_size,
            image_size,
            handles: std::sync::Mutex::new(LruCache::new(max_open_segments)),
            decoded: std::sync::Mutex::new(LruCache::new(table_cache_bytes)),
            workers: WorkerPool::new(worker_count),
        })
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.image_size)
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.image_size {
            return Err(DiskMorphError::bad_argument("read beyond EWF image size"));
        }
        let want = buf.len().min((self.image_size - offset) as usize);
        if want == 0 {
            return Ok(0);
        }

        // Split the request at chunk boundaries, then hand every chunk's
        // worth of work to the worker pool as one job.
        let chunk_size = self.chunk_size;
        let mut jobs: Vec<Box<dyn FnOnce() -> i32 + Send + 'static>> = Vec::new();
        let mut produced = 0usize;
        let mut pos = offset;

        // Safety: each job writes into a disjoint sub-slice of `buf`, so
        // handing out raw pointers here and reassembling a `&mut [u8]`
        // inside each job is sound as long as no two jobs' ranges overlap.
        // `self` is likewise passed through as a raw address rather than a
        // borrow to satisfy the worker pool's `'static` job bound; this is
        // sound because `run_batch` below blocks until every job has
        // returned, so `self` and `buf` both outlive the jobs that use them.
        let buf_ptr = buf.as_mut_ptr() as usize;

        while produced < want {
            let chunk_number = pos / chunk_size;
            let chunk_start = chunk_number * chunk_size;
            let in_chunk = (pos - chunk_start) as usize;
            let take = (want - produced).min(chunk_size as usize - in_chunk);

            let dest_offset = produced;
            let job_len = take;
            let job_chunk_number = chunk_number;
            let job_in_chunk = in_chunk;

            let this = self as *const Ewf as usize;
            jobs.push(Box::new(move || {
                let this = unsafe { &*(this as *const Ewf) };
                let dest = unsafe {
                    std::slice::from_raw_parts_mut((buf_ptr as *mut u8).add(dest_offset), job_len)
                };
                match this.read_within_chunk(job_chunk_number, job_in_chunk, dest) {
                    Ok(()) => 0,
                    Err(e) => e.as_errno(),
                }
            }));

            produced += take;
            pos += take as u64;
        }

        let code = self.workers.run_batch(jobs);
        if code != 0 {
            return Err(DiskMorphError::from_plugin_code(code));
        }
        Ok(want)
    }

    fn find_table(&self, chunk_number: u64) -> Result<usize> {
        self.tables
            .iter()
            .position(|t| chunk_number >= t.chunk_from && chunk_number <= t.chunk_to)
            .ok_or_else(|| DiskMorphError::corruption("chunk number not covered by any table"))
    }

    fn decode_table(&self, table_idx: usize) -> Result<()> {
        let mut decoded = self.decoded.lock().unwrap();
        if decoded.contains(&table_idx) {
            decoded.get_mut(&table_idx);
            return Ok(());
        }
        drop(decoded);

        let table = &self.tables[table_idx];
        let mut handles = self.handles.lock().unwrap();
        self.ensure_open(&mut handles, table.segment_idx)?;
        let file = handles.get_mut(&table.segment_idx).unwrap();
        let mut raw = vec![0u8; table.raw_size as usize];
        file.seek(SeekFrom::Start(table.raw_offset)).map_err(DiskMorphError::Io)?;
        file.read_exact(&mut raw).map_err(DiskMorphError::Io)?;
        drop(handles);

        let raw_entries = decode_table_entries(&raw, table.chunk_count)?;
        let entries = raw_entries
            .iter()
            .map(|&e| (table.table_base_offset + (e & !COMPRESSED_FLAG) as u64, e & COMPRESSED_FLAG != 0))
            .collect();

        let mut decoded = self.decoded.lock().unwrap();
        decoded.insert(table_idx, DecodedTable { entries }, table.raw_size);
        Ok(())
    }

    fn ensure_open(&self, handles: &mut LruCache<usize, File>, segment_idx: usize) -> Result<()> {
        if handles.contains(&segment_idx) {
            return Ok(());
        }
        let segment = &self.segments[segment_idx];
        let file = File::open(&segment.path).map_err(DiskMorphError::Io)?;
        let meta = file.metadata().map_err(DiskMorphError::Io)?;
        if meta.len() < segment.file_size {
            return Err(DiskMorphError::corruption("segment file shrank since open"));
        }
        handles.insert(segment_idx, file, 1);
        Ok(())
    }

    fn read_within_chunk(&self, chunk_number: u64, in_chunk: usize, dest: &mut [u8]) -> Result<()> {
        let table_idx = self.find_table(chunk_number)?;
        self.decode_table(table_idx)?;

        let table = &self.tables[table_idx];
        let local = (chunk_number - table.chunk_from) as usize;

        // The table cache may have evicted this table again between
        // `decode_table` returning and the lock below being taken; retry
        // the decode once rather than panic.
        let entry_data = {
            let mut decoded = self.decoded.lock().unwrap();
            decoded.get_mut(&table_idx).map(|dt| {
                let (offset, compressed) = dt.entries[local];
                let end = if local + 1 < dt.entries.len() {
                    dt.entries[local + 1].0
                } else {
                    table.sectors_end
                };
                (offset, compressed, end.saturating_sub(offset))
            })
        };
        let (file_offset, compressed, raw_len) = match entry_data {
            Some(v) => v,
            None => {
                self.decode_table(table_idx)?;
                let mut decoded = self.decoded.lock().unwrap();
                let dt = decoded
                    .get_mut(&table_idx)
                    .ok_or_else(|| DiskMorphError::corruption("table evicted before use"))?;
                let (offset, compressed) = dt.entries[local];
                let end = if local + 1 < dt.entries.len() {
                    dt.entries[local + 1].0
                } else {
                    table.sectors_end
                };
                (offset, compressed, end.saturating_sub(offset))
            }
        };

        let mut handles = self.handles.lock().unwrap();
        self.ensure_open(&mut handles, table.segment_idx)?;
        let file = handles.get_mut(&table.segment_idx).unwrap();
        let mut raw = vec![0u8; raw_len as usize];
        file.seek(SeekFrom::Start(file_offset)).map_err(DiskMorphError::Io)?;
        file.read_exact(&mut raw).map_err(DiskMorphError::Io)?;
        drop(handles);

        let plain = if compressed {
            if raw.len() < 6 {
                return Err(DiskMorphError::corruption("compressed chunk too short"));
            }
            let (checksum_bytes, body) = (
                &raw[raw.len() - 4..],
                &raw[2..raw.len() - 4],
            );
            let mut out = Vec::with_capacity(self.chunk_size as usize);
            DeflateDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|_| DiskMorphError::corruption("failed to inflate EWF chunk"))?;
            let checksum = u32::from_le_bytes(checksum_bytes.try_into().unwrap());
            if !format::adler32_matches(&out, checksum) {
                return Err(DiskMorphError::corruption("EWF chunk checksum mismatch"));
            }
            out
        } else {
            if raw.len() < 4 {
                return Err(DiskMorphError::corruption("uncompressed chunk too short"));
            }
            let (body, checksum_bytes) = raw.split_at(raw.len() - 4);
            let checksum = u32::from_le_bytes(checksum_bytes.try_into().unwrap());
            if !format::adler32_matches(body, checksum) {
                return Err(DiskMorphError::corruption("EWF chunk checksum mismatch"));
            }
            body.to_vec()
        };

        if in_chunk + dest.len() > plain.len() {
            return Err(DiskMorphError::corruption("decoded chunk shorter than requested slice"));
        }
        dest.copy_from_slice(&plain[in_chunk..in_chunk + dest.len()]);
        Ok(())
    }
}

unsafe impl Sync for Ewf {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn section_header(kind: &[u8], offset_next: u64, size: u64) -> Vec<u8> {
        let mut buf = vec![0u8; SECTION_HEADER_LEN];
        buf[..kind.len()].copy_from_slice(kind);
        buf[16..24].copy_from_slice(&offset_next.to_le_bytes());
        buf[24..32].copy_from_slice(&size.to_le_bytes());
        buf
    }

    /// Builds a one-segment, one-table, single-uncompressed-chunk EWF file
    /// by hand and verifies a full-chunk read round trips.
    #[test]
    fn reads_single_uncompressed_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evidence.E01");

        let sector_size = 512u32;
        let sectors_per_chunk = 4u32;
        let chunk_bytes = vec![0xABu8; (sector_size * sectors_per_chunk) as usize];
        let checksum = adler::adler32_slice(&chunk_bytes);

        let mut file = File::create(&path).unwrap();
        file.write_all(&format::SIGNATURE).unwrap();
        file.write_all(&[1, 1, 0, 0, 0]).unwrap(); // StartOfFields, SegmentNumber=1 LE, EndOfFields

        let mut volume_payload = vec![0u8; 24];
        volume_payload[8..12].copy_from_slice(&sectors_per_chunk.to_le_bytes());
        volume_payload[12..16].copy_from_slice(&sector_size.to_le_bytes());
        volume_payload[16..24].copy_from_slice(&10u64.to_le_bytes());

        let vol_section_size = SECTION_HEADER_LEN as u64 + volume_payload.len() as u64;
        let pos_after_file_header = format::FILE_HEADER_LEN as u64;
        let vol_next = pos_after_file_header + vol_section_size;
        file.write_all(&section_header(b"volume", vol_next, vol_section_size)).unwrap();
        file.write_all(&volume_payload).unwrap();

        let sectors_payload_len = chunk_bytes.len() as u64 + 4;
        let sectors_section_size = SECTION_HEADER_LEN as u64 + sectors_payload_len;
        let sectors_data_offset = vol_next + SECTION_HEADER_LEN as u64;
        let table_next = vol_next + sectors_section_size;
        file.write_all(&section_header(b"sectors", table_next, sectors_section_size)).unwrap();
        file.write_all(&chunk_bytes).unwrap();
        file.write_all(&checksum.to_le_bytes()).unwrap();

        let mut table_payload = vec![0u8; format::TABLE_HEADER_LEN + 4];
        table_payload[0..4].copy_from_slice(&1u32.to_le_bytes());
        table_payload[8..16].copy_from_slice(&sectors_data_offset.to_le_bytes());
        table_payload[format::TABLE_HEADER_LEN..format::TABLE_HEADER_LEN + 4]
            .copy_from_slice(&0u32.to_le_bytes());
        let table_section_size = SECTION_HEADER_LEN as u64 + table_payload.len() as u64;
        file.write_all(&section_header(b"table", 0, table_section_size)).unwrap();
        file.write_all(&table_payload).unwrap();
        drop(file);

        let ewf = Ewf::open(&[path], 4, 1 << 20, 1).unwrap();
        assert_eq!(ewf.size().unwrap(), sector_size as u64 * 10);

        let mut out = vec![0u8; chunk_bytes.len()];
        let n = ewf.read(0, &mut out).unwrap();
        assert_eq!(n, out.len());
        assert_eq!(out, chunk_bytes);
    }
}
