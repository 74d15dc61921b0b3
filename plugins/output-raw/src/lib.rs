//! Raw/DMG output plug-in.

mod abi;
pub mod raw;

use std::ffi::c_char;
use std::sync::OnceLock;

use diskmorph_abi::{pack_formats, OutputFunctions, OUTPUT_API_VERSION};

#[no_mangle]
pub extern "C" fn diskmorph_output_api_version() -> u32 {
    OUTPUT_API_VERSION
}

#[no_mangle]
pub extern "C" fn diskmorph_output_formats() -> *const c_char {
    static PACKED: OnceLock<Vec<u8>> = OnceLock::new();
    PACKED.get_or_init(|| pack_formats(&["raw", "dmg"])).as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn diskmorph_output_functions() -> *const OutputFunctions {
    &abi::FUNCTIONS
}
