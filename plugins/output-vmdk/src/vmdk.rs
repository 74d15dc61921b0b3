//! VMDK output envelope: the flat extent is a pure pass-through over the
//! morphed body, same as raw. The accompanying text descriptor (the
//! small sidecar a VMDK consumer reads to find the extent) is delivered
//! through the info-file hook rather than the main size/read pair, since
//! the plug-in ABI only exposes one byte stream per handle; presenting
//! the descriptor as a second, independently nameable file is a FUSE
//! binding concern and lives outside this core.
//!
//! Lock-directory/file requests a VMDK-aware consumer issues (creating,
//! writing, renaming, deleting `.lck` entries) are handled in memory by
//! that same FUSE binding layer and never reach this plug-in.

use diskmorph_core::error::Result;
use diskmorph_core::image::Image;

pub const DEFAULT_ADAPTER_TYPE: &str = "ide";

pub struct VmdkOutput<M: Image> {
    morph: M,
    extent_filename: String,
    adapter_type: String,
}

impl<M: Image> VmdkOutput<M> {
    pub fn new(morph: M, extent_filename: String, adapter_type: Option<String>) -> VmdkOutput<M> {
        VmdkOutput {
            morph,
            extent_filename,
            adapter_type: adapter_type.unwrap_or_else(|| DEFAULT_ADAPTER_TYPE.to_string()),
        }
    }

    pub fn size(&self) -> Result<u64> {
        self.morph.size()
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.morph.read(offset, buf)
    }

    pub fn descriptor(&self) -> Result<String> {
        let sector_count = self.morph.size()?.div_ceil(512);
        Ok(format!(
            "version=1, CID=fffffffe, createType=monolithicFlat, RW {sector_count} FLAT \"{}\" 0, adapterType={}\n",
            self.extent_filename, self.adapter_type
        ))
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
    fn descriptor_matches_expected_form() {
        let out = VmdkOutput::new(FakeMorph(vec![0u8; 1024]), "evidence.raw".to_string(), None);
        let descriptor = out.descriptor().unwrap();
        assert!(descriptor.contains("createType=monolithicFlat"));
        assert!(descriptor.contains("RW 2 FLAT \"evidence.raw\" 0"));
        assert!(descriptor.contains("adapterType=ide"));
    }

    #[test]
    fn descriptor_honors_scsi_adapter_override() {
        let out = VmdkOutput::new(
            FakeMorph(vec![0u8; 512]),
            "img.raw".to_string(),
            Some("scsi".to_string()),
        );
        assert!(out.descriptor().unwrap().contains("adapterType=scsi"));
    }

    #[test]
    fn body_read_is_pure_passthrough() {
        let out = VmdkOutput::new(FakeMorph(vec![9, 8, 7, 6]), "x".to_string(), None);
        let mut buf = [0u8; 2];
        assert_eq!(out.read(1, &mut buf).unwrap(), 2);
        assert_eq!(buf, [8, 7]);
    }
}
