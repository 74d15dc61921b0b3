//! QCOW2 input plug-in.

mod abi;
pub mod qcow2;

use std::ffi::c_char;
use std::sync::OnceLock;

use diskmorph_abi::{pack_formats, InputFunctions, INPUT_API_VERSION};

#[no_mangle]
pub extern "C" fn diskmorph_input_api_version() -> u32 {
    INPUT_API_VERSION
}

#[no_mangle]
pub extern "C" fn diskmorph_input_formats() -> *const c_char {
    static PACKED: OnceLock<Vec<u8>> = OnceLock::new();
    PACKED.get_or_init(|| pack_formats(&["qcow2"])).as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn diskmorph_input_functions() -> *const InputFunctions {
    &abi::FUNCTIONS
}
