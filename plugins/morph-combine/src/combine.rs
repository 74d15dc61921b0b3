//! Default morph: presents the concatenation of N input images in the
//! order specified. Size is the sum of input sizes; a read finds the
//! first input whose cumulative end exceeds the offset, reads up to that
//! input's end, and loops across inputs as needed.

use diskmorph_core::error::{DiskMorphError, Result};
use diskmorph_core::image::{BorrowedInput, Image};

pub struct Combine {
    inputs: Vec<BorrowedInput>,
    /// `cumulative[i]` is the offset in the combined stream where input
    /// `i` begins; `cumulative[len]` is the total size.
    cumulative: Vec<u64>,
}

impl Combine {
    pub fn new(inputs: Vec<BorrowedInput>) -> Result<Combine> {
        if inputs.is_empty() {
            return Err(DiskMorphError::bad_argument("combine requires at least one input"));
        }
        let mut cumulative = Vec::with_capacity(inputs.len() + 1);
        let mut total = 0u64;
        cumulative.push(0);
        for input in &inputs {
            total += input.size()?;
            cumulative.push(total);
        }
        Ok(Combine { inputs, cumulative })
    }

    pub fn size(&self) -> Result<u64> {
        Ok(*self.cumulative.last().unwrap())
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let total = *self.cumulative.last().unwrap();
        if offset >= total {
            return Err(DiskMorphError::bad_argument("read beyond combined image size"));
        }
        let want = buf.len().min((total - offset) as usize);
        let mut produced = 0usize;
        let mut pos = offset;

        let mut idx = match self.cumulative.binary_search(&pos) {
            Ok(i) => i.min(self.inputs.len() - 1),
            Err(i) => i - 1,
        };

        while produced < want {
            let input_start = self.cumulative[idx];
            let input_end = self.cumulative[idx + 1];
            let local_offset = pos - input_start;
            let avail = (input_end - input_start - local_offset) as usize;
            let n = (want - produced).min(avail);

            let got = self.inputs[idx].read(local_offset, &mut buf[produced..produced + n])?;
            if got != n {
                return Err(DiskMorphError::corruption("short read from a combined input"));
            }

            produced += n;
            pos += n as u64;
            idx += 1;
        }

        Ok(produced)
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

    // Drives `Combine`'s algorithm directly against plain `Image`s instead
    // of FFI `BorrowedInput`s, since the boundary logic under test lives
    // entirely in offset arithmetic, not in the FFI call itself.
    struct TestCombine {
        inputs: Vec<Box<dyn Image>>,
        cumulative: Vec<u64>,
    }

    impl TestCombine {
        fn new(inputs: Vec<Box<dyn Image>>) -> Result<Self> {
            let mut cumulative = vec![0u64];
            let mut total = 0u64;
            for i in &inputs {
                total += i.size()?;
                cumulative.push(total);
            }
            Ok(TestCombine { inputs, cumulative })
        }

        fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            let total = *self.cumulative.last().unwrap();
            if offset >= total {
                return Err(DiskMorphError::bad_argument("oob"));
            }
            let want = buf.len().min((total - offset) as usize);
            let mut produced = 0usize;
            let mut pos = offset;
            let mut idx = match self.cumulative.binary_search(&pos) {
                Ok(i) => i.min(self.inputs.len() - 1),
                Err(i) => i - 1,
            };
            while produced < want {
                let start = self.cumulative[idx];
                let end = self.cumulative[idx + 1];
                let local = pos - start;
                let avail = (end - start - local) as usize;
                let n = (want - produced).min(avail);
                self.inputs[idx].read(local, &mut buf[produced..produced + n])?;
                produced += n;
                pos += n as u64;
                idx += 1;
            }
            Ok(produced)
        }
    }

    #[test]
    fn spans_boundary_like_scenario_s1() {
        let a: Vec<u8> = (0..1_000_000).map(|_| 0xAAu8).collect();
        let b: Vec<u8> = (0..500_000).map(|_| 0x55u8).collect();
        let combine = TestCombine::new(vec![
            Box::new(FakeInput { data: a }),
            Box::new(FakeInput { data: b }),
        ])
        .unwrap();

        assert_eq!(*combine.cumulative.last().unwrap(), 1_500_000);
        let mut buf = [0u8; 4];
        combine.read(999_998, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xAA, 0x55, 0x55]);
    }

    #[test]
    fn single_input_passthrough() {
        let combine = TestCombine::new(vec![Box::new(FakeInput { data: vec![1, 2, 3, 4] })]).unwrap();
        let mut buf = [0u8; 2];
        combine.read(1, &mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
    }
}
