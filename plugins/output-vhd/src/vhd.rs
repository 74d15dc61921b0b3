//! VHD output envelope: the morphed body verbatim, followed by a fixed
//! 512-byte big-endian footer per the Microsoft VHD image format spec.
//! Only the "fixed" disk type is produced; no dynamic/differencing block
//! allocation table is synthesized.

use std::time::{SystemTime, UNIX_EPOCH};

use diskmorph_core::error::{DiskMorphError, Result};
use diskmorph_core::image::Image;

pub const COOKIE: &[u8; 8] = b"conectix";
pub const FOOTER_LEN: u64 = 512;
const FEATURES_RESERVED: u32 = 0x0000_0002;
const FILE_FORMAT_VERSION: u32 = 0x0001_0000;
const FIXED_DISK_DATA_OFFSET: u64 = u64::MAX;
const DISK_TYPE_FIXED: u32 = 2;
const VHD_EPOCH_OFFSET_SECS: u64 = 946_684_800; // 2000-01-01T00:00:00Z - Unix epoch

fn chs_geometry(total_sectors: u64) -> (u16, u8, u8) {
    let total_sectors = total_sectors.min(65535 * 16 * 255);

    let (sectors_per_track, heads, cylinders_times_heads) = if total_sectors >= 65535 * 16 * 63 {
        let spt = 255u64;
        let heads = 16u64;
        (spt, heads, total_sectors / spt)
    } else {
        let mut spt = 17u64;
        let mut cth = total_sectors / spt;
        let mut heads = (cth + 1023) / 1024;
        if heads < 4 {
            heads = 4;
        }
        if cth >= heads * 1024 || heads > 16 {
            spt = 31;
            heads = 16;
            cth = total_sectors / spt;
        }
        if cth >= heads * 1024 {
            spt = 63;
            heads = 16;
            cth = total_sectors / spt;
        }
        (spt, heads, cth)
    };

    let cylinders = cylinders_times_heads / heads;
    (cylinders as u16, heads as u8, sectors_per_track as u8)
}

fn build_footer(disk_size: u64, fingerprint: &[u8; 16], timestamp: u32) -> Vec<u8> {
    let mut f = vec![0u8; FOOTER_LEN as usize];
    f[0..8].copy_from_slice(COOKIE);
    f[8..12].copy_from_slice(&FEATURES_RESERVED.to_be_bytes());
    f[12..16].copy_from_slice(&FILE_FORMAT_VERSION.to_be_bytes());
    f[16..24].copy_from_slice(&FIXED_DISK_DATA_OFFSET.to_be_bytes());
    f[24..28].copy_from_slice(&timestamp.to_be_bytes());
    f[28..32].copy_from_slice(b"dmph");
    f[32..36].copy_from_slice(&FILE_FORMAT_VERSION.to_be_bytes());
    f[36..40].copy_from_slice(b"Wi2k");
    f[40..48].copy_from_slice(&disk_size.to_be_bytes());
    f[48..56].copy_from_slice(&disk_size.to_be_bytes());

    let total_sectors = disk_size / 512;
    let (cylinders, heads, sectors_per_track) = chs_geometry(total_sectors);
    f[56..58].copy_from_slice(&cylinders.to_be_bytes());
    f[58] = heads;
    f[59] = sectors_per_track;
    f[60..64].copy_from_slice(&DISK_TYPE_FIXED.to_be_bytes());

    // checksum field (64..68) stays zero while computing the checksum
    f[68..84].copy_from_slice(fingerprint);
    // byte 84 (saved state) and the 427-byte reserved tail stay zero

    let sum: u32 = f.iter().map(|&b| b as u32).sum();
    let checksum = !sum;
    f[64..68].copy_from_slice(&checksum.to_be_bytes());
    f
}

fn creation_timestamp() -> u32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(VHD_EPOCH_OFFSET_SECS);
    now.saturating_sub(VHD_EPOCH_OFFSET_SECS) as u32
}

pub struct VhdOutput<M: Image> {
    morph: M,
    disk_size: u64,
    footer: Vec<u8>,
}

impl<M: Image> VhdOutput<M> {
    pub fn new(morph: M, fingerprint: [u8; 16]) -> Result<VhdOutput<M>> {
        let disk_size = morph.size()?;
        let footer = build_footer(disk_size, &fingerprint, creation_timestamp());
        Ok(VhdOutput { morph, disk_size, footer })
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.disk_size + self.footer.len() as u64)
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let total = self.size()?;
        if offset >= total {
            return Err(DiskMorphError::bad_argument("read beyond VHD envelope size"));
        }
        let want = buf.len().min((total - offset) as usize);
        let mut produced = 0usize;
        let mut pos = offset;

        while produced < want {
            if pos < self.disk_size {
                let take = (want - produced).min((self.disk_size - pos) as usize);
                let n = self.morph.read(pos, &mut buf[produced..produced + take])?;
                if n == 0 {
                    return Err(DiskMorphError::corruption("short read from morphed body"));
                }
                produced += n;
                pos += n as u64;
            } else {
                let footer_pos = (pos - self.disk_size) as usize;
                let take = (want - produced).min(self.footer.len() - footer_pos);
                buf[produced..produced + take]
                    .copy_from_slice(&self.footer[footer_pos..footer_pos + take]);
                produced += take;
                pos += take as u64;
            }
        }

        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeMorph(Vec<u8>);
    impl Image for FakeMorph {
        fn size(&self) -> Result<u64> {
            Ok(self.0.len() as u64)
        }
        fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            let offset = offset as usize;
            let n = buf.len().min(self.0.len() - offset);
            buf[..n].copy_from_slice(&self.0[offset..offset + n]);
            Ok(n)
        }
    }

    #[test]
    fn footer_checksum_is_ones_complement_of_zeroed_sum() {
        let footer = build_footer(1 << 20, &[0xCC; 16], 12345);
        let mut zeroed = footer.clone();
        zeroed[64..68].fill(0);
        let sum: u32 = zeroed.iter().map(|&b| b as u32).sum();
        let expected = !sum;
        assert_eq!(u32::from_be_bytes(footer[64..68].try_into().unwrap()), expected);
    }

    #[test]
    fn footer_cookie_and_fixed_disk_type() {
        let footer = build_footer(4096, &[0u8; 16], 0);
        assert_eq!(&footer[0..8], COOKIE);
        assert_eq!(u32::from_be_bytes(footer[60..64].try_into().unwrap()), DISK_TYPE_FIXED);
        assert_eq!(u64::from_be_bytes(footer[16..24].try_into().unwrap()), u64::MAX);
    }

    #[test]
    fn chs_geometry_stays_within_small_disk_bounds() {
        let (c, h, s) = chs_geometry(2048); // 1 MiB disk
        assert!(h >= 4);
        assert!(s > 0);
        assert!((c as u64) * (h as u64) * (s as u64) >= 2048 - 63);
    }

    /// Matches the end-to-end scenario in the testable-properties section:
    /// a body size not a multiple of 512, envelope size `n + 512`, and a
    /// verifiable one's-complement checksum in the trailing footer.
    #[test]
    fn odd_sized_body_yields_n_plus_512_with_verifying_checksum() {
        let n = 10_000_013u64;
        let out = VhdOutput::new(FakeMorph(vec![0x5Au8; n as usize]), [0x9u8; 16]).unwrap();
        assert_eq!(out.size().unwrap(), n + 512);

        let mut footer = vec![0u8; 512];
        let read = out.read(n, &mut footer).unwrap();
        assert_eq!(read, 512);
        assert_eq!(&footer[0..8], COOKIE);

        let mut zeroed = footer.clone();
        zeroed[64..68].fill(0);
        let sum: u32 = zeroed.iter().map(|&b| b as u32).sum();
        assert_eq!(u32::from_be_bytes(footer[64..68].try_into().unwrap()), !sum);
    }

    #[test]
    fn read_spans_body_and_footer() {
        let body = vec![0x11u8; 10];
        let out = VhdOutput::new(FakeMorph(body.clone()), [0u8; 16]).unwrap();
        let mut buf = vec![0u8; 6];
        let n = out.read(8, &mut buf).unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf[..2], &[0x11, 0x11]);
        assert_eq!(&buf[2..6], &out.footer[..4]);
    }
}
