//! C ABI shim adapting [`crate::ewf::Ewf`] to `InputFunctions`.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::PathBuf;

use diskmorph_abi::{errno, InputFunctions};
use diskmorph_core::error::DiskMorphError;

use crate::ewf::Ewf;

const DEFAULT_MAX_OPEN_SEGMENTS: u64 = 16;
const DEFAULT_TABLE_CACHE_BYTES: u64 = 16 * 1024 * 1024;
const DEFAULT_WORKERS: usize = 4;

struct Handle {
    inner: Option<Ewf>,
    max_open_segments: u64,
    table_cache_bytes: u64,
    workers: usize,
}

fn code_of(err: &DiskMorphError) -> c_int {
    err.as_errno()
}

unsafe extern "C" fn create_handle(out_handle: *mut *mut c_void) -> c_int {
    let handle = Box::new(Handle {
        inner: None,
        max_open_segments: DEFAULT_MAX_OPEN_SEGMENTS,
        table_cache_bytes: DEFAULT_TABLE_CACHE_BYTES,
        workers: DEFAULT_WORKERS,
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
    files: *const *const c_char,
    n_files: c_int,
    _offset: u64,
    _size_limit: u64,
) -> c_int {
    let handle = unsafe { &mut *(handle as *mut Handle) };
    if files.is_null() || n_files <= 0 {
        return errno::EINVAL;
    }
    let ptrs = unsafe { std::slice::from_raw_parts(files, n_files as usize) };
    let mut paths = Vec::with_capacity(ptrs.len());
    for &p in ptrs {
        if p.is_null() {
            return errno::EINVAL;
        }
        let s = unsafe { CStr::from_ptr(p) };
        let Ok(s) = s.to_str() else { return errno::EINVAL };
        paths.push(PathBuf::from(s));
    }

    match Ewf::open(&paths, handle.max_open_segments, handle.table_cache_bytes, handle.workers) {
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
    static HELP: &CStr =
        c"max_open_segments=<n>,table_cache_bytes=<n>,workers=<n> — comma-separated, all optional";
    HELP.as_ptr()
}

unsafe extern "C" fn options_parse(handle: *mut c_void, options: *const c_char) -> c_int {
    let handle = unsafe { &mut *(handle as *mut Handle) };
    if options.is_null() {
        return errno::OK;
    }
    let s = unsafe { CStr::from_ptr(options) };
    let Ok(s) = s.to_str() else { return errno::EINVAL };
    if s.is_empty() {
        return errno::OK;
    }
    for kv in s.split(',') {
        let Some((key, value)) = kv.split_once('=') else { return errno::EINVAL };
        let Ok(value) = value.parse::<u64>() else { return errno::EINVAL };
        match key {
            "max_open_segments" => handle.max_open_segments = value.max(1),
            "table_cache_bytes" => handle.table_cache_bytes = value.max(1),
            "workers" => handle.workers = value.max(1) as usize,
            _ => return errno::EINVAL,
        }
    }
    errno::OK
}

unsafe extern "C" fn get_infofile_content(handle: *mut c_void, out_buf: *mut *mut c_char) -> c_int {
    let handle = unsafe { &*(handle as *mut Handle) };
    let Some(inner) = &handle.inner else { return errno::EINVAL };
    let size = inner.size().unwrap_or(0);
    let text = CString::new(format!("input type: ewf\nsize: {size}\n")).unwrap();
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
