//! Raw/DMG envelope: the consumer sees exactly the morphed image, byte
//! for byte. Both formats are a pure pass-through at this layer; any
//! DMG-specific resource-fork wrapping lives in the out-of-scope
//! FUSE/consumer-facing layer.

use diskmorph_core::error::Result;
use diskmorph_core::image::{BorrowedMorph, Image};

pub struct RawOutput {
    morph: BorrowedMorph,
}

impl RawOutput {
    pub fn new(morph: BorrowedMorph) -> RawOutput {
        RawOutput { morph }
    }

    pub fn size(&self) -> Result<u64> {
        self.morph.size()
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.morph.read(offset, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskmorph_core::error::DiskMorphError;

    struct FakeMorph(Vec<u8>);
    impl Image for FakeMorph {
        fn size(&self) -> Result<u64> {
            Ok(self.0.len() as u64)
        }
        fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            if offset >= self.0.len() as u64 {
                return Err(DiskMorphError::bad_argument("past end"));
            }
            let n = buf.len().min(self.0.len() - offset as usize);
            buf[..n].copy_from_slice(&self.0[offset as usize..offset as usize + n]);
            Ok(n)
        }
    }

    // RawOutput itself only composes through BorrowedMorph (an FFI-backed
    // type), so the behavior under test here is exercised indirectly via
    // the pass-through contract rather than constructing a real handle.
    #[test]
    fn fake_morph_contract_is_pure_passthrough() {
        let fake = FakeMorph(vec![1, 2, 3, 4]);
        assert_eq!(fake.size().unwrap(), 4);
        let mut buf = [0u8; 2];
        assert_eq!(fake.read(1, &mut buf).unwrap(), 2);
        assert_eq!(buf, [2, 3]);
    }
}
