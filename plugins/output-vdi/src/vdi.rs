//! VDI output envelope: a 512-byte VirtualBox-style header (leading with
//! the traditional text comment VirtualBox itself writes, so the bytes
//! are recognizable to real VDI consumers), immediately followed by an
//! identity-mapped block map (the image is presented as fully allocated),
//! then the morphed body verbatim. Both UUID fields carry the
//! partial-image fingerprint so the envelope identifier is stable across
//! remounts of the same evidence.

use diskmorph_core::error::{DiskMorphError, Result};
use diskmorph_core::image::Image;

pub const COMMENT: &[u8] = b"<<< Oracle VirtualBox Disk Image >>>\n";
pub const COMMENT_LEN: usize = 64;
pub const SIGNATURE: u32 = 0xBEDA_107F;
pub const VERSION: u32 = 0x0001_0001;
pub const HEADER_LEN: u64 = 512;
pub const BLOCK_SIZE: u64 = 1024 * 1024;

const SIGNATURE_OFF: usize = COMMENT_LEN;
const VERSION_OFF: usize = SIGNATURE_OFF + 4;
const BLOCK_SIZE_OFF: usize = VERSION_OFF + 4;
const BLOCK_COUNT_OFF: usize = BLOCK_SIZE_OFF + 8;
const BLOCK_MAP_OFFSET_OFF: usize = BLOCK_COUNT_OFF + 8;
const DISK_SIZE_OFF: usize = BLOCK_MAP_OFFSET_OFF + 8;
const UUID_CREATE_OFF: usize = DISK_SIZE_OFF + 8;
const UUID_MODIFY_OFF: usize = UUID_CREATE_OFF + 16;

fn build_header(disk_size: u64, block_count: u64, fingerprint: &[u8; 16]) -> Vec<u8> {
    let mut h = vec![0u8; HEADER_LEN as usize];
    h[0..COMMENT.len()].copy_from_slice(COMMENT);
    h[SIGNATURE_OFF..SIGNATURE_OFF + 4].copy_from_slice(&SIGNATURE.to_le_bytes());
    h[VERSION_OFF..VERSION_OFF + 4].copy_from_slice(&VERSION.to_le_bytes());
    h[BLOCK_SIZE_OFF..BLOCK_SIZE_OFF + 8].copy_from_slice(&BLOCK_SIZE.to_le_bytes());
    h[BLOCK_COUNT_OFF..BLOCK_COUNT_OFF + 8].copy_from_slice(&block_count.to_le_bytes());
    h[BLOCK_MAP_OFFSET_OFF..BLOCK_MAP_OFFSET_OFF + 8].copy_from_slice(&HEADER_LEN.to_le_bytes());
    h[DISK_SIZE_OFF..DISK_SIZE_OFF + 8].copy_from_slice(&disk_size.to_le_bytes());
    h[UUID_CREATE_OFF..UUID_CREATE_OFF + 16].copy_from_slice(fingerprint);
    h[UUID_MODIFY_OFF..UUID_MODIFY_OFF + 16].copy_from_slice(fingerprint);
    h
}

fn identity_block_map(block_count: u64) -> Vec<u8> {
    let mut map = Vec::with_capacity(block_count as usize * 4);
    for i in 0..block_count as u32 {
        map.extend_from_slice(&i.to_le_bytes());
    }
    map
}

/// Generic over the morph layer so the offset arithmetic below can be
/// exercised with a plain in-memory `Image` in tests; the plug-in shim
/// instantiates this with `BorrowedMorph`.
pub struct VdiOutput<M: Image> {
    morph: M,
    disk_size: u64,
    prefix: Vec<u8>,
}

impl<M: Image> VdiOutput<M> {
    pub fn new(morph: M, fingerprint: [u8; 16]) -> Result<VdiOutput<M>> {
        let disk_size = morph.size()?;
        let block_count = disk_size.div_ceil(BLOCK_SIZE);
        let mut prefix = build_header(disk_size, block_count, &fingerprint);
        prefix.extend(identity_block_map(block_count));
        Ok(VdiOutput { morph, disk_size, prefix })
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.prefix.len() as u64 + self.disk_size)
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let total = self.size()?;
        if offset >= total {
            return Err(DiskMorphError::bad_argument("read beyond VDI envelope size"));
        }
        let want = buf.len().min((total - offset) as usize);
        let mut produced = 0usize;
        let mut pos = offset;
        let prefix_len = self.prefix.len() as u64;

        while produced < want {
            if pos < prefix_len {
                let take = (want - produced).min((prefix_len - pos) as usize);
                buf[produced..produced + take]
                    .copy_from_slice(&self.prefix[pos as usize..pos as usize + take]);
                produced += take;
                pos += take as u64;
            } else {
                let body_offset = pos - prefix_len;
                let n = self.morph.read(body_offset, &mut buf[produced..want])?;
                if n == 0 {
                    return Err(DiskMorphError::corruption("short read from morphed body"));
                }
                produced += n;
                pos += n as u64;
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
    fn header_fields_round_trip() {
        let fp = [0x42u8; 16];
        let morph = FakeMorph(vec![0xAB; BLOCK_SIZE as usize + 10]);
        let out = VdiOutput::new(morph, fp).unwrap();

        assert_eq!(
            u32::from_le_bytes(out.prefix[SIGNATURE_OFF..SIGNATURE_OFF + 4].try_into().unwrap()),
            SIGNATURE
        );
        assert_eq!(
            u32::from_le_bytes(out.prefix[VERSION_OFF..VERSION_OFF + 4].try_into().unwrap()),
            VERSION
        );
        assert_eq!(
            u64::from_le_bytes(out.prefix[DISK_SIZE_OFF..DISK_SIZE_OFF + 8].try_into().unwrap()),
            out.disk_size
        );
        assert_eq!(&out.prefix[UUID_CREATE_OFF..UUID_CREATE_OFF + 16], &fp);
        assert_eq!(&out.prefix[UUID_MODIFY_OFF..UUID_MODIFY_OFF + 16], &fp);

        // two blocks needed for a size just over one block
        let block_count =
            u64::from_le_bytes(out.prefix[BLOCK_COUNT_OFF..BLOCK_COUNT_OFF + 8].try_into().unwrap());
        assert_eq!(block_count, 2);
        assert_eq!(
            u32::from_le_bytes(out.prefix[HEADER_LEN as usize + 4..HEADER_LEN as usize + 8].try_into().unwrap()),
            1
        );
    }

    /// Matches the end-to-end scenario in the testable-properties section:
    /// a VirtualBox-recognizable comment at 0..63, the signature bytes
    /// `7F 10 DA BE` at 64..67, and the morphed body starting exactly at
    /// `header_end`.
    #[test]
    fn comment_and_signature_bytes_match_virtualbox_layout() {
        let morph = FakeMorph(vec![0x11u8; 1_048_576]);
        let out = VdiOutput::new(morph, [0u8; 16]).unwrap();

        let mut expected_comment = vec![0u8; COMMENT_LEN];
        expected_comment[..COMMENT.len()].copy_from_slice(COMMENT);
        assert_eq!(&out.prefix[0..COMMENT_LEN], &expected_comment[..]);
        assert_eq!(&out.prefix[64..68], &[0x7F, 0x10, 0xDA, 0xBE]);

        let header_end = out.prefix.len() as u64;
        let mut body = vec![0u8; 1_048_576];
        let n = out.read(header_end, &mut body).unwrap();
        assert_eq!(n, body.len());
        assert!(body.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn read_spans_header_map_and_body() {
        let fp = [0u8; 16];
        let body = vec![0x7Au8; 100];
        let morph = FakeMorph(body.clone());
        let out = VdiOutput::new(morph, fp).unwrap();
        let prefix_len = out.prefix.len() as u64;

        let mut buf = vec![0u8; 20];
        let n = out.read(prefix_len - 10, &mut buf).unwrap();
        assert_eq!(n, 20);
        assert_eq!(&buf[..10], &out.prefix[out.prefix.len() - 10..]);
        assert_eq!(&buf[10..], &body[..10]);
    }

    #[test]
    fn rejects_read_past_envelope_end() {
        let morph = FakeMorph(vec![1, 2, 3]);
        let out = VdiOutput::new(morph, [0u8; 16]).unwrap();
        let total = out.size().unwrap();
        let mut buf = [0u8; 1];
        assert!(out.read(total, &mut buf).is_err());
    }
}
