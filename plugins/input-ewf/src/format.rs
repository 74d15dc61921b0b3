//! EWF/AEWF on-disk structures: segment file header, section header, and
//! the `volume`/`table`/`sectors`/`hash` section payloads this plug-in
//! cares about. All multi-byte fields are little-endian, matching the
//! EWF specification.

use diskmorph_core::error::{DiskMorphError, Result};

pub const SIGNATURE: [u8; 8] = [0x45, 0x56, 0x46, 0x09, 0x0D, 0x0A, 0xFF, 0x00];
pub const FILE_HEADER_LEN: usize = 13;

pub const SECTION_HEADER_LEN: usize = 16 + 8 + 8 + 40 + 4;
pub const TABLE_HEADER_LEN: usize = 4 + 4 + 8 + 4 + 4;
pub const VOLUME_SECTION_LEN: usize = 94 + 963 + 5 + 4;

pub const COMPRESSED_FLAG: u32 = 0x8000_0000;

pub const AEWF_MAX_SECTOR_SIZE: u64 = 10_485_760;
pub const AEWF_MAX_CHUNK_SIZE: u64 = 104_857_600;
pub const AEWF_MAX_SECTORS_PER_CHUNK: u64 = 65_536;
pub const AEWF_MAX_SECTION_COUNT: u64 = 10_485_760;

pub struct FileHeader {
    pub segment_number: u16,
}

pub fn parse_file_header(buf: &[u8]) -> Result<FileHeader> {
    if buf.len() < FILE_HEADER_LEN {
        return Err(DiskMorphError::corruption("segment file too short for header"));
    }
    if buf[0..8] != SIGNATURE {
        return Err(DiskMorphError::corruption("not an EWF/AEWF segment file (bad signature)"));
    }
    let segment_number = u16::from_le_bytes([buf[9], buf[10]]);
    Ok(FileHeader { segment_number })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionType {
    Volume,
    Table,
    Sectors,
    Hash,
    Other,
}

pub struct SectionHeader {
    pub kind: SectionType,
    pub offset_next: u64,
    pub size: u64,
}

/// Parses the 76-byte section header at `buf[..SECTION_HEADER_LEN]`.
/// Does not verify the checksum; callers that need the raw header bytes
/// for checksum verification should slice before calling this.
pub fn parse_section_header(buf: &[u8]) -> Result<SectionHeader> {
    if buf.len() < SECTION_HEADER_LEN {
        return Err(DiskMorphError::corruption("section header truncated"));
    }
    let type_field = &buf[0..16];
    let nul = type_field.iter().position(|&b| b == 0).unwrap_or(16);
    let kind = match &type_field[..nul] {
        b"volume" | b"disk" => SectionType::Volume,
        b"table" | b"table2" => SectionType::Table,
        b"sectors" => SectionType::Sectors,
        b"hash" => SectionType::Hash,
        _ => SectionType::Other,
    };
    let offset_next = u64::from_le_bytes(buf[16..24].try_into().unwrap());
    let size = u64::from_le_bytes(buf[24..32].try_into().unwrap());
    Ok(SectionHeader { kind, offset_next, size })
}

pub struct VolumeSection {
    pub sectors_per_chunk: u32,
    pub bytes_per_sector: u32,
    pub sector_count: u64,
}

pub fn parse_volume_section(buf: &[u8]) -> Result<VolumeSection> {
    if buf.len() < 28 {
        return Err(DiskMorphError::corruption("volume section truncated"));
    }
    // MediaType(1) Unknown1[3] ChunkCount(4) SectorsPerChunk(4) BytesPerSector(4) SectorCount(8)
    let sectors_per_chunk = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    let bytes_per_sector = u32::from_le_bytes(buf[12..16].try_into().unwrap());
    let sector_count = u64::from_le_bytes(buf[16..24].try_into().unwrap());
    Ok(VolumeSection { sectors_per_chunk, bytes_per_sector, sector_count })
}

pub struct TableHeader {
    pub chunk_count: u32,
    pub table_base_offset: u64,
}

pub fn parse_table_header(buf: &[u8]) -> Result<TableHeader> {
    if buf.len() < TABLE_HEADER_LEN {
        return Err(DiskMorphError::corruption("table header truncated"));
    }
    let chunk_count = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let table_base_offset = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    Ok(TableHeader { chunk_count, table_base_offset })
}

/// Decodes the packed offset-array entries following a table header.
/// Each raw entry's top bit marks the chunk as zlib-compressed; the
/// remaining 31 bits are added to `table_base_offset` to get the chunk's
/// absolute file offset.
pub fn decode_table_entries(raw: &[u8], chunk_count: u32) -> Result<Vec<u32>> {
    let expected = chunk_count as usize * 4;
    if raw.len() < expected {
        return Err(DiskMorphError::corruption("table offset array truncated"));
    }
    let mut entries = Vec::with_capacity(chunk_count as usize);
    for i in 0..chunk_count as usize {
        let bytes = &raw[i * 4..i * 4 + 4];
        entries.push(u32::from_le_bytes(bytes.try_into().unwrap()));
    }
    Ok(entries)
}

pub fn adler32_matches(data: &[u8], expected: u32) -> bool {
    adler::adler32_slice(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_signature() {
        let buf = [0u8; FILE_HEADER_LEN];
        assert!(parse_file_header(&buf).is_err());
    }

    #[test]
    fn parses_segment_number() {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..8].copy_from_slice(&SIGNATURE);
        buf[9..11].copy_from_slice(&7u16.to_le_bytes());
        let hdr = parse_file_header(&buf).unwrap();
        assert_eq!(hdr.segment_number, 7);
    }

    #[test]
    fn section_type_matches_known_names() {
        let mut buf = [0u8; SECTION_HEADER_LEN];
        buf[0..6].copy_from_slice(b"volume");
        let hdr = parse_section_header(&buf).unwrap();
        assert_eq!(hdr.kind, SectionType::Volume);
    }

    #[test]
    fn decodes_compressed_flag() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(100u32 | COMPRESSED_FLAG).to_le_bytes());
        let entries = decode_table_entries(&raw, 1).unwrap();
        assert_eq!(entries[0] & COMPRESSED_FLAG, COMPRESSED_FLAG);
        assert_eq!(entries[0] & !COMPRESSED_FLAG, 100);
    }
}
