//! The C-stable boundary plug-ins are loaded across.
//!
//! A plug-in is a cdylib that exports three symbols per role (see the
//! `*_SYMBOL` constants below): an API-version probe, a supported-formats
//! probe, and a function-table getter. Everything in this crate is
//! `#[repr(C)]` plain data and `extern "C"` function pointers so that the
//! loader and a plug-in compiled as a separate shared object agree on
//! layout without sharing anything but this crate's source.

use std::ffi::{c_char, c_int, c_void};

pub const INPUT_API_VERSION: u32 = 2;
pub const MORPH_API_VERSION: u32 = 2;
pub const OUTPUT_API_VERSION: u32 = 2;

pub const INPUT_VERSION_SYMBOL: &[u8] = b"diskmorph_input_api_version\0";
pub const INPUT_FORMATS_SYMBOL: &[u8] = b"diskmorph_input_formats\0";
pub const INPUT_FUNCTIONS_SYMBOL: &[u8] = b"diskmorph_input_functions\0";

pub const MORPH_VERSION_SYMBOL: &[u8] = b"diskmorph_morph_api_version\0";
pub const MORPH_FORMATS_SYMBOL: &[u8] = b"diskmorph_morph_formats\0";
pub const MORPH_FUNCTIONS_SYMBOL: &[u8] = b"diskmorph_morph_functions\0";

pub const OUTPUT_VERSION_SYMBOL: &[u8] = b"diskmorph_output_api_version\0";
pub const OUTPUT_FORMATS_SYMBOL: &[u8] = b"diskmorph_output_formats\0";
pub const OUTPUT_FUNCTIONS_SYMBOL: &[u8] = b"diskmorph_output_functions\0";

/// Plug-in role, used only for log messages and the registry's bookkeeping —
/// never crosses the FFI boundary itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Input,
    Morph,
    Output,
}

impl Role {
    pub fn file_prefix(self) -> &'static str {
        match self {
            Role::Input => "libdiskmorph_input_",
            Role::Morph => "libdiskmorph_morph_",
            Role::Output => "libdiskmorph_output_",
        }
    }
}

/// A loaded input image handed down to a morph plug-in: opaque handle plus
/// the function table that operates on it. Plain data, `#[repr(C)]`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputRef {
    pub handle: *mut c_void,
    pub functions: *const InputFunctions,
}

/// Same idea, morph handed down to an output plug-in.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MorphRef {
    pub handle: *mut c_void,
    pub functions: *const MorphFunctions,
}

#[repr(C)]
pub struct InputFunctions {
    pub create_handle: unsafe extern "C" fn(out_handle: *mut *mut c_void) -> c_int,
    pub destroy_handle: unsafe extern "C" fn(handle: *mut c_void) -> c_int,
    /// `files` is an array of `n_files` NUL-terminated paths, owned by the caller.
    pub open: unsafe extern "C" fn(
        handle: *mut c_void,
        files: *const *const c_char,
        n_files: c_int,
        offset: u64,
        size_limit: u64,
    ) -> c_int,
    pub close: unsafe extern "C" fn(handle: *mut c_void) -> c_int,
    pub size: unsafe extern "C" fn(handle: *mut c_void, out_size: *mut u64) -> c_int,
    pub read: unsafe extern "C" fn(
        handle: *mut c_void,
        buf: *mut u8,
        offset: u64,
        count: u64,
        out_read: *mut u64,
    ) -> c_int,
    pub options_help: unsafe extern "C" fn() -> *const c_char,
    pub options_parse: unsafe extern "C" fn(handle: *mut c_void, options: *const c_char) -> c_int,
    pub get_infofile_content: unsafe extern "C" fn(
        handle: *mut c_void,
        out_buf: *mut *mut c_char,
    ) -> c_int,
    pub get_error_message: unsafe extern "C" fn(code: c_int) -> *const c_char,
    pub free_buffer: unsafe extern "C" fn(buf: *mut c_void),
}

#[repr(C)]
pub struct MorphFunctions {
    pub create_handle: unsafe extern "C" fn(out_handle: *mut *mut c_void) -> c_int,
    pub destroy_handle: unsafe extern "C" fn(handle: *mut c_void) -> c_int,
    /// `transform` is called exactly once, at pipeline-build time.
    pub transform: unsafe extern "C" fn(
        handle: *mut c_void,
        inputs: *const InputRef,
        n_inputs: c_int,
        options: *const c_char,
    ) -> c_int,
    pub close: unsafe extern "C" fn(handle: *mut c_void) -> c_int,
    pub size: unsafe extern "C" fn(handle: *mut c_void, out_size: *mut u64) -> c_int,
    pub read: unsafe extern "C" fn(
        handle: *mut c_void,
        buf: *mut u8,
        offset: u64,
        count: u64,
        out_read: *mut u64,
    ) -> c_int,
    pub write: unsafe extern "C" fn(
        handle: *mut c_void,
        buf: *const u8,
        offset: u64,
        count: u64,
        out_written: *mut u64,
    ) -> c_int,
    pub options_help: unsafe extern "C" fn() -> *const c_char,
    pub options_parse: unsafe extern "C" fn(handle: *mut c_void, options: *const c_char) -> c_int,
    pub get_infofile_content: unsafe extern "C" fn(
        handle: *mut c_void,
        out_buf: *mut *mut c_char,
    ) -> c_int,
    pub get_error_message: unsafe extern "C" fn(code: c_int) -> *const c_char,
    pub free_buffer: unsafe extern "C" fn(buf: *mut c_void),
}

#[repr(C)]
pub struct OutputFunctions {
    pub create_handle: unsafe extern "C" fn(out_handle: *mut *mut c_void) -> c_int,
    pub destroy_handle: unsafe extern "C" fn(handle: *mut c_void) -> c_int,
    pub open: unsafe extern "C" fn(
        handle: *mut c_void,
        morph: MorphRef,
        fingerprint: *const [u8; 16],
        options: *const c_char,
    ) -> c_int,
    pub close: unsafe extern "C" fn(handle: *mut c_void) -> c_int,
    pub size: unsafe extern "C" fn(handle: *mut c_void, out_size: *mut u64) -> c_int,
    pub read: unsafe extern "C" fn(
        handle: *mut c_void,
        buf: *mut u8,
        offset: u64,
        count: u64,
        out_read: *mut u64,
    ) -> c_int,
    pub write: unsafe extern "C" fn(
        handle: *mut c_void,
        buf: *const u8,
        offset: u64,
        count: u64,
        out_written: *mut u64,
    ) -> c_int,
    pub options_help: unsafe extern "C" fn() -> *const c_char,
    pub options_parse: unsafe extern "C" fn(handle: *mut c_void, options: *const c_char) -> c_int,
    pub get_infofile_content: unsafe extern "C" fn(
        handle: *mut c_void,
        out_buf: *mut *mut c_char,
    ) -> c_int,
    pub get_error_message: unsafe extern "C" fn(code: c_int) -> *const c_char,
    pub free_buffer: unsafe extern "C" fn(buf: *mut c_void),
}

/// POSIX errno values a plug-in boundary call may return; 0 means success.
/// Kept as plain `c_int` in the function signatures above so the ABI has no
/// Rust-specific types crossing it, but callers should map through these.
pub mod errno {
    pub const OK: i32 = 0;
    pub const EINVAL: i32 = libc::EINVAL;
    pub const ENOMEM: i32 = libc::ENOMEM;
    pub const EIO: i32 = libc::EIO;
    pub const ENOTSUP: i32 = libc::ENOTSUP;
}

/// Build the double-NUL-terminated packed format list a plug-in's
/// `*_formats` symbol returns: `"ewf\0aewf\0\0"`.
pub fn pack_formats(formats: &[&str]) -> Vec<u8> {
    let mut buf = Vec::new();
    for f in formats {
        buf.extend_from_slice(f.as_bytes());
        buf.push(0);
    }
    buf.push(0);
    buf
}

/// Parse a packed format list back into owned strings. `ptr` must point at
/// a buffer terminated by two consecutive NUL bytes (or be null, which
/// yields an empty vec).
///
/// # Safety
/// `ptr` must either be null or point at memory valid to read until the
/// double-NUL terminator is found.
pub unsafe fn unpack_formats(ptr: *const c_char) -> Vec<String> {
    let mut out = Vec::new();
    if ptr.is_null() {
        return out;
    }
    let mut p = ptr as *const u8;
    loop {
        let start = p;
        let mut len = 0usize;
        while unsafe { *p } != 0 {
            p = unsafe { p.add(1) };
            len += 1;
        }
        if len == 0 {
            break;
        }
        let slice = unsafe { std::slice::from_raw_parts(start, len) };
        out.push(String::from_utf8_lossy(slice).into_owned());
        p = unsafe { p.add(1) };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let packed = pack_formats(&["ewf", "aewf"]);
        assert_eq!(packed, b"ewf\0aewf\0\0");
        let parsed = unsafe { unpack_formats(packed.as_ptr() as *const c_char) };
        assert_eq!(parsed, vec!["ewf".to_string(), "aewf".to_string()]);
    }

    #[test]
    fn unpack_empty() {
        let packed = pack_formats(&[]);
        assert_eq!(packed, b"\0");
        let parsed = unsafe { unpack_formats(packed.as_ptr() as *const c_char) };
        assert!(parsed.is_empty());
    }

    #[test]
    fn unpack_null_is_empty() {
        let parsed = unsafe { unpack_formats(std::ptr::null()) };
        assert!(parsed.is_empty());
    }
}
