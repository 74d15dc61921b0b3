//! Swaps adjacent byte pairs of a single input. Functionally the same
//! transform as byteswap, kept as a separate plug-in for parity with the
//! source tool's separate `swab` morph type. The anchor for the swap is
//! always an even offset: a request starting on an odd offset pulls in
//! the preceding byte so the pairing lines up, and the caller only ever
//! sees its requested slice of the widened, swapped window.

use diskmorph_core::error::{DiskMorphError, Result};
use diskmorph_core::image::{BorrowedInput, Image};

pub struct Swab {
    input: BorrowedInput,
    size: u64,
}

impl Swab {
    pub fn new(mut inputs: Vec<BorrowedInput>) -> Result<Swab> {
        if inputs.len() != 1 {
            return Err(DiskMorphError::bad_argument("swab takes exactly one input"));
        }
        let input = inputs.remove(0);
        let size = input.size()?;
        Ok(Swab { input, size })
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Err(DiskMorphError::bad_argument("read beyond swab image size"));
        }
        let want = buf.len().min((self.size - offset) as usize);

        let anchor = offset & !1;
        let end = ((offset + want as u64 + 1) & !1).min(self.size);
        let span = (end - anchor) as usize;

        let mut window = vec![0u8; span];
        let n = self.input.read(anchor, &mut window)?;
        if n != span {
            return Err(DiskMorphError::corruption("short read from swab input"));
        }

        let mut i = 0;
        while i + 1 < window.len() {
            window.swap(i, i + 1);
            i += 2;
        }

        let lead = (offset - anchor) as usize;
        buf[..want].copy_from_slice(&window[lead..lead + want]);
        Ok(want)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swapped(data: &[u8], offset: u64, len: usize) -> Vec<u8> {
        let size = data.len() as u64;
        let anchor = offset & !1;
        let end = ((offset + len as u64 + 1) & !1).min(size);
        let mut window = data[anchor as usize..end as usize].to_vec();
        let mut i = 0;
        while i + 1 < window.len() {
            window.swap(i, i + 1);
            i += 2;
        }
        let lead = (offset - anchor) as usize;
        window[lead..lead + len].to_vec()
    }

    #[test]
    fn preserves_leading_byte_on_odd_start() {
        let data = [0x01, 0x02, 0x03, 0x04];
        // word0 = (01,02) -> (02,01); word1 = (03,04) -> (04,03)
        // offset=1 reads across the swapped stream [02,01,04,03]
        assert_eq!(swapped(&data, 1, 2), vec![0x01, 0x04]);
    }

    #[test]
    fn even_offset_is_a_plain_pairwise_swap() {
        let data = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(swapped(&data, 0, 4), vec![0x02, 0x01, 0x04, 0x03]);
    }
}
