//! C ABI shim adapting [`crate::vdi::Vdi`] to `InputFunctions`.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;

use diskmorph_abi::{errno, InputFunctions};
use diskmorph_core::error::DiskMorphError;

use crate::vdi::Vdi;

struct Handle {
    inner: Option<Vdi>,
}

fn code_of(err: &DiskMorphError) -> c_int {
    err.as_errno()
}

unsafe extern "C" fn create_handle(out_handle: *mut *mut c_void) -> c_int {
    let handle = Box::new(Handle { inner: None });
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
    files: *const *const c_char,
    n_files: c_int,
    _offset: u64,
    _size_limit: u64,
) -> c_int {
    let handle = unsafe { &mut *(handle as *mut Handle) };
    if files.is_null() || n_files != 1 {
        return errno::EINVAL;
    }
    let ptrs = unsafe { std::slice::from_raw_parts(files, 1) };
    if ptrs[0].is_null() {
        return errno::EINVAL;
    }
    let s = unsafe { CStr::from_ptr(ptrs[0]) };
    let Ok(s) = s.to_str() else { return errno::EINVAL };

    match Vdi::open(Path::new(s)) {
        Ok(inner) => {
            handle.inner = Some(inner);
            errno::OK
        }
        Err(e) => code_of(&e),
    }
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

unsafe extern "C" fn options_help() -> *const c_char {
    static HELP: &CStr = c"vdi takes no options";
    HELP.as_ptr()
}

unsafe extern "C" fn options_parse(_handle: *mut c_void, options: *const c_char) -> c_int {
    if options.is_null() {
        return errno::OK;
    }
    let s = unsafe { CStr::from_ptr(options) };
    if s.to_bytes().is_empty() { errno::OK } else { errno::EINVAL }
}

unsafe extern "C" fn get_infofile_content(handle: *mut c_void, out_buf: *mut *mut c_char) -> c_int {
    let handle = unsafe { &*(handle as *mut Handle) };
    let Some(inner) = &handle.inner else { return errno::EINVAL };
    let size = inner.size().unwrap_or(0);
    let text = CString::new(format!("input type: vdi\nsize: {size}\n")).unwrap();
    unsafe { *out_buf = text.into_raw() };
    errno::OK
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

pub(crate) static FUNCTIONS: InputFunctions = InputFunctions {
    create_handle,
    destroy_handle,
    open,
    close,
    size,
    read,
    options_help,
    options_parse,
    get_infofile_content,
    get_error_message,
    free_buffer,
};
