//! Unallocated-space extraction morph plug-in (HFS+ and FAT).

mod abi;
pub mod unallocated;

use std::ffi::c_char;
use std::sync::OnceLock;

use diskmorph_abi::{pack_formats, MorphFunctions, MORPH_API_VERSION};

#[no_mangle]
pub extern "C" fn diskmorph_morph_api_version() -> u32 {
    MORPH_API_VERSION
}

#[no_mangle]
pub extern "C" fn diskmorph_morph_formats() -> *const c_char {
    static PACKED: OnceLock<Vec<u8>> = OnceLock::new();
    PACKED.get_or_init(|| pack_formats(&["unallocated"])).as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn diskmorph_morph_functions() -> *const MorphFunctions {
    &abi::FUNCTIONS
}
