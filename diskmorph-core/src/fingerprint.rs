//! Partial-image fingerprint: a 128-bit digest of the first 10 MiB of the
//! morphed image, substituted for the randomly generated UUID that VDI
//! and VHD envelopes would otherwise carry so that remounting the same
//! evidence reports the same envelope identity.

use md5::{Digest, Md5};

use crate::error::Result;
use crate::image::Image;

const FINGERPRINT_WINDOW: u64 = 10 * 1024 * 1024;

/// Read up to [`FINGERPRINT_WINDOW`] bytes from `image` at offset zero and
/// return the MD5 digest over the bytes actually read (a short image
/// contributes fewer bytes, not zero-padding).
pub fn compute(image: &dyn Image) -> Result<[u8; 16]> {
    let size = image.size()?;
    let window = size.min(FINGERPRINT_WINDOW);

    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut offset = 0u64;

    while offset < window {
        let want = buf.len().min((window - offset) as usize);
        let n = image.read(offset, &mut buf[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        offset += n as u64;
    }

    Ok(hasher.finalize().into())
}

/// Split a fingerprint into the low/high 64-bit halves the output layer
/// substitutes into a UUID.
pub fn halves(fingerprint: &[u8; 16]) -> (u64, u64) {
    let low = u64::from_le_bytes(fingerprint[0..8].try_into().unwrap());
    let high = u64::from_le_bytes(fingerprint[8..16].try_into().unwrap());
    (low, high)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeImage {
        data: Vec<u8>,
        reads: Mutex<Vec<(u64, usize)>>,
    }

    impl Image for FakeImage {
        fn size(&self) -> Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            self.reads.lock().unwrap().push((offset, buf.len()));
            let offset = offset as usize;
            if offset >= self.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.data.len() - offset);
            buf[..n].copy_from_slice(&self.data[offset..offset + n]);
            Ok(n)
        }
    }

    #[test]
    fn deterministic_across_calls() {
        let image = FakeImage { data: vec![0xAB; 5_000_000], reads: Mutex::new(Vec::new()) };
        let fp1 = compute(&image).unwrap();
        let fp2 = compute(&image).unwrap();
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn short_image_digests_only_available_bytes() {
        let image = FakeImage { data: vec![0x11; 100], reads: Mutex::new(Vec::new()) };
        let fp = compute(&image).unwrap();
        let mut hasher = Md5::new();
        hasher.update([0x11u8; 100]);
        let expected: [u8; 16] = hasher.finalize().into();
        assert_eq!(fp, expected);
    }
}
