//! Raw / split-DD input plug-in.
//!
//! Deliberately trivial (the design's "trivial formats" non-goal): no
//! chunking, no compression, no per-file options beyond what the ABI's
//! `open` call already carries.

mod abi;
pub mod raw;

use std::ffi::c_char;

use diskmorph_abi::{pack_formats, InputFunctions, INPUT_API_VERSION};

#[no_mangle]
pub extern "C" fn diskmorph_input_api_version() -> u32 {
    INPUT_API_VERSION
}

#[no_mangle]
pub extern "C" fn diskmorph_input_formats() -> *const c_char {
    use std::sync::OnceLock;
    static PACKED: OnceLock<Vec<u8>> = OnceLock::new();
    PACKED.get_or_init(|| pack_formats(&["raw", "dd"])).as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn diskmorph_input_functions() -> *const InputFunctions {
    &abi::FUNCTIONS
}
