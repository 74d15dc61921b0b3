//! C ABI shim adapting [`crate::unallocated::Unallocated`] to `MorphFunctions`.

use std::ffi::{c_char, c_int, c_void, CStr, CString};

use diskmorph_abi::{errno, InputRef, MorphFunctions};
use diskmorph_core::error::DiskMorphError;
use diskmorph_core::image::BorrowedInput;

use crate::unallocated::Unallocated;

struct Handle {
    inner: Option<Unallocated>,
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

unsafe extern "C" fn transform(
    handle: *mut c_void,
    inputs: *const InputRef,
    n_inputs: c_int,
    options: *const c_char,
) -> c_int {
    let handle = unsafe { &mut *(handle as *mut Handle) };
    if inputs.is_null() || n_inputs <= 0 {
        return errno::EINVAL;
    }
    let refs = unsafe { std::slice::from_raw_parts(inputs, n_inputs as usize) };
    let views: Vec<BorrowedInput> = refs.iter().map(|r| unsafe { BorrowedInput::from_ref(r) }).collect();

    let forced = if options.is_null() {
        None
    } else {
        match unsafe { CStr::from_ptr(options) }.to_str() {
            Ok(s) if s.is_empty() => None,
            Ok(s) => Some(s.to_owned()),
            Err(_) => return errno::EINVAL,
        }
    };

    match Unallocated::new(views, forced.as_deref()) {
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
    static HELP: &CStr = c"force filesystem type instead of autodetecting: hfs+, fat12, fat16 or fat32";
    HELP.as_ptr()
}

unsafe extern "C" fn options_parse(_handle: *mut c_void, options: *const c_char) -> c_int {
    if options.is_null() {
        return errno::OK;
    }
    let s = unsafe { CStr::from_ptr(options) };
    match s.to_str() {
        Ok("") | Ok("hfs+") | Ok("fat12") | Ok("fat16") | Ok("fat32") => errno::OK,
        _ => errno::EINVAL,
    }
}

unsafe extern "C" fn get_infofile_content(handle: *mut c_void, out_buf: *mut *mut c_char) -> c_int {
    let handle = unsafe { &*(handle as *mut Handle) };
    let Some(inner) = &handle.inner else { return errno::EINVAL };
    let size = inner.size().unwrap_or(0);
    let text = CString::new(format!("morph type: unallocated\nsize: {size}\n")).unwrap();
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

pub(crate) static FUNCTIONS: MorphFunctions = MorphFunctions {
    create_handle,
    destroy_handle,
    transform,
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
