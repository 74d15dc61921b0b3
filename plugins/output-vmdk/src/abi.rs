//! C ABI shim adapting [`crate::vmdk::VmdkOutput`] to `OutputFunctions`.

use std::ffi::{c_char, c_int, c_void, CStr, CString};

use diskmorph_abi::{errno, MorphRef, OutputFunctions};
use diskmorph_core::error::DiskMorphError;
use diskmorph_core::image::BorrowedMorph;

use crate::vmdk::VmdkOutput;

const DEFAULT_EXTENT_FILENAME: &str = "data.raw";

struct Handle {
    inner: Option<VmdkOutput<BorrowedMorph>>,
    extent_filename: String,
    adapter_type: Option<String>,
}

fn code_of(err: &DiskMorphError) -> c_int {
    err.as_errno()
}

fn parse_options(raw: &str) -> std::result::Result<(String, Option<String>), ()> {
    let mut extent = DEFAULT_EXTENT_FILENAME.to_string();
    let mut adapter = None;
    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or(())?;
        match key {
            "extent" => extent = value.to_string(),
            "adapter" => adapter = Some(value.to_string()),
            _ => return Err(()),
        }
    }
    Ok((extent, adapter))
}

unsafe extern "C" fn create_handle(out_handle: *mut *mut c_void) -> c_int {
    let handle = Box::new(Handle {
        inner: None,
        extent_filename: DEFAULT_EXTENT_FILENAME.to_string(),
        adapter_type: None,
    });
    unsafe { *out_handle = Box::into_raw(handle) as *mut c_void };
    errno::OK
}

unsafe extern "C" fn destroy_handle(handle: *mut c_void) -> c_int {
    if !handle.is_null() {
        unsafe { drop(Box::from_raw(handle as *mut Handle)) };
    }
    errno::OK
}

unsafe extern "C" fn open(
    handle: *mut c_void,
    morph: MorphRef,
    _fingerprint: *const [u8; 16],
    _options: *const c_char,
) -> c_int {
    let handle = unsafe { &mut *(handle as *mut Handle) };
    let view = unsafe { BorrowedMorph::from_ref(&morph) };
    handle.inner = Some(VmdkOutput::new(
        view,
        handle.extent_filename.clone(),
        handle.adapter_type.clone(),
    ));
    errno::OK
}

unsafe extern "C" fn close(handle: *mut c_void) -> c_int {
    let handle = unsafe { &mut *(handle as *mut Handle) };
    handle.inner = None;
    errno::OK
}

unsafe extern "C" fn size(handle: *mut c_void, out_size: *mut u64) -> c_int {
    let handle = unsafe { &*(handle as *mut Handle) };
    let Some(inner) = &handle.inner else { return errno::EINVAL };
    match inner.size() {
        Ok(n) => {
            unsafe { *out_size = n };
            errno::OK
        }
        Err(e) => code_of(&e),
    }
}

unsafe extern "C" fn read(
    handle: *mut c_void,
    buf: *mut u8,
    offset: u64,
    count: u64,
    out_read: *mut u64,
) -> c_int {
    let handle = unsafe { &*(handle as *mut Handle) };
    let Some(inner) = &handle.inner else { return errno::EINVAL };
    let slice = unsafe { std::slice::from_raw_parts_mut(buf, count as usize) };
    match inner.read(offset, slice) {
        Ok(n) => {
            unsafe { *out_read = n as u64 };
            errno::OK
        }
        Err(e) => code_of(&e),
    }
}

unsafe extern "C" fn write(
    _handle: *mut c_void,
    _buf: *const u8,
    _offset: u64,
    _count: u64,
    _out_written: *mut u64,
) -> c_int {
    errno::ENOTSUP
}

unsafe extern "C" fn options_help() -> *const c_char {
    static HELP: &CStr = c"extent=<filename>,adapter=ide|scsi : descriptor fields for the flat extent";
    HELP.as_ptr()
}

unsafe extern "C" fn options_parse(handle: *mut c_void, options: *const c_char) -> c_int {
    let handle = unsafe { &mut *(handle as *mut Handle) };
    if options.is_null() {
        return errno::OK;
    }
    let s = unsafe { CStr::from_ptr(options) };
    let Ok(text) = s.to_str() else { return errno::EINVAL };
    match parse_options(text) {
        Ok((extent, adapter)) => {
            handle.extent_filename = extent;
            handle.adapter_type = adapter;
            errno::OK
        }
        Err(()) => errno::EINVAL,
    }
}

unsafe extern "C" fn get_infofile_content(handle: *mut c_void, out_buf: *mut *mut c_char) -> c_int {
    let handle = unsafe { &*(handle as *mut Handle) };
    let Some(inner) = &handle.inner else { return errno::EINVAL };
    match inner.descriptor() {
        Ok(text) => {
            let text = CString::new(text).unwrap();
            unsafe { *out_buf = text.into_raw() };
            errno::OK
        }
        Err(e) => code_of(&e),
    }
}

unsafe extern "C" fn get_error_message(code: c_int) -> *const c_char {
    let msg = CString::new(std::io::Error::from_raw_os_error(code).to_string()).unwrap();
    msg.into_raw()
}

unsafe extern "C" fn free_buffer(buf: *mut c_void) {
    if !buf.is_null() {
        unsafe { drop(CString::from_raw(buf as *mut c_char)) };
    }
}

pub(crate) static FUNCTIONS: OutputFunctions = OutputFunctions {
    create_handle,
    destroy_handle,
    open,
    close,
    size,
    read,
    write,
    options_help,
    options_parse,
    get_infofile_content,
    get_error_message,
    free_buffer,
};
