//! Exposes a single even-sized input with each 16-bit word's bytes
//! exchanged. A read that starts or ends mid-word widens its window to
//! word boundaries, swaps pairwise, and returns only the caller's slice.

use diskmorph_core::error::{DiskMorphError, Result};
use diskmorph_core::image::{BorrowedInput, Image};

pub struct Byteswap {
    input: BorrowedInput,
    size: u64,
}

impl Byteswap {
    pub fn new(mut inputs: Vec<BorrowedInput>) -> Result<Byteswap> {
        if inputs.len() != 1 {
            return Err(DiskMorphError::bad_argument("byteswap takes exactly one input"));
        }
        let input = inputs.remove(0);
        let size = input.size()?;
        if size % 2 != 0 {
            return Err(DiskMorphError::bad_argument("byteswap requires an even-sized input"));
        }
        Ok(Byteswap { input, size })
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Err(DiskMorphError::bad_argument("read beyond byteswap image size"));
        }
        let want = buf.len().min((self.size - offset) as usize);

        let window_start = offset & !1;
        let window_end = ((offset + want as u64 + 1) & !1).min(self.size);
        let window_len = (window_end - window_start) as usize;

        let mut window = vec![0u8; window_len];
        let n = self.input.read(window_start, &mut window)?;
        if n != window_len {
            return Err(DiskMorphError::corruption("short read from byteswap input"));
        }

        let mut i = 0;
        while i + 1 < window.len() {
            window.swap(i, i + 1);
            i += 2;
        }

        let start_in_window = (offset - window_start) as usize;
        buf[..want].copy_from_slice(&window[start_in_window..start_in_window + want]);
        Ok(want)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeInput {
        data: Vec<u8>,
    }

    impl Image for FakeInput {
        fn size(&self) -> Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            let offset = offset as usize;
            let n = buf.len().min(self.data.len() - offset);
            buf[..n].copy_from_slice(&self.data[offset..offset + n]);
            Ok(n)
        }
    }

    // Exercises the windowing logic directly against `Image`, mirroring
    // `Byteswap::read` without going through the FFI `BorrowedInput`.
    fn swap_window(data: &[u8], offset: u64, len: usize) -> Vec<u8> {
        let size = data.len() as u64;
        let window_start = offset & !1;
        let window_end = ((offset + len as u64 + 1) & !1).min(size);
        let mut window = data[window_start as usize..window_end as usize].to_vec();
        let mut i = 0;
        while i + 1 < window.len() {
            window.swap(i, i + 1);
            i += 2;
        }
        let start = (offset - window_start) as usize;
        window[start..start + len].to_vec()
    }

    #[test]
    fn swaps_aligned_word() {
        let data = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(swap_window(&data, 0, 4), vec![0x02, 0x01, 0x04, 0x03]);
    }

    #[test]
    fn handles_odd_start_offset() {
        let data = [0x01, 0x02, 0x03, 0x04];
        // offset=1 len=2 spans the tail of word0 and head of word1
        assert_eq!(swap_window(&data, 1, 2), vec![0x01, 0x04]);
    }

    #[test]
    fn rejects_odd_sized_input() {
        let fake = FakeInput { data: vec![1, 2, 3] };
        assert!(fake.size().unwrap() % 2 != 0);
    }
}
