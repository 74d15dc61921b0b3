//! Safe wrappers around a loaded plug-in's opaque handle + function table.
//!
//! This is the one place raw ABI calls happen outside the plug-ins
//! themselves: the pipeline builder calls through these adapters, and
//! every other layer (the cache, the fingerprint pass) only ever sees the
//! `Image` trait. A C callback table with a mutable-state function
//! pointer becomes, on this side of the boundary, a trait object the
//! pipeline builder keeps strong ownership of.

use std::ffi::c_void;
use std::sync::Arc;

use diskmorph_abi::{InputFunctions, InputRef, MorphFunctions, OutputFunctions};
use libloading::Library;

use crate::error::{DiskMorphError, Result};

/// A finite, addressable byte sequence: the common shape of an input,
/// morph, or output layer once wrapped behind its ABI function table.
pub trait Image: Send + Sync {
    fn size(&self) -> Result<u64>;
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    fn write(&self, _offset: u64, _buf: &[u8]) -> Result<usize> {
        Err(DiskMorphError::unsupported("this layer is read-only"))
    }
}

/// Keeps a plug-in's backing `Library` alive for as long as any adapter
/// holding one of its function-table pointers is alive.
#[derive(Clone)]
pub(crate) struct LibHandle(pub(crate) Arc<Library>);

pub struct InputAdapter {
    pub(crate) handle: *mut c_void,
    pub(crate) functions: *const InputFunctions,
    pub(crate) _lib: LibHandle,
}

unsafe impl Send for InputAdapter {}
unsafe impl Sync for InputAdapter {}

impl Image for InputAdapter {
    fn size(&self) -> Result<u64> {
        let f = unsafe { &*self.functions };
        let mut out = 0u64;
        let code = unsafe { (f.size)(self.handle, &mut out) };
        if code != 0 {
            return Err(DiskMorphError::from_plugin_code(code));
        }
        Ok(out)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let f = unsafe { &*self.functions };
        let mut out_read = 0u64;
        let code = unsafe {
            (f.read)(
                self.handle,
                buf.as_mut_ptr(),
                offset,
                buf.len() as u64,
                &mut out_read,
            )
        };
        if code != 0 {
            return Err(DiskMorphError::from_plugin_code(code));
        }
        Ok(out_read as usize)
    }
}

impl Drop for InputAdapter {
    fn drop(&mut self) {
        let f = unsafe { &*self.functions };
        unsafe {
            (f.close)(self.handle);
            (f.destroy_handle)(self.handle);
        }
    }
}

/// Non-owning view over an `InputRef` handed to a morph plug-in's
/// `transform`. Morph plug-ins live on the far side of the FFI boundary
/// from the pipeline builder, which retains exclusive ownership of the
/// original `InputAdapter`; this wrapper never closes or destroys the
/// handle it views.
pub struct BorrowedInput {
    handle: *mut c_void,
    functions: *const InputFunctions,
}

unsafe impl Send for BorrowedInput {}
unsafe impl Sync for BorrowedInput {}

impl BorrowedInput {
    /// # Safety
    /// `input_ref` must stay valid (handle alive, function table valid)
    /// for as long as the returned view is used.
    pub unsafe fn from_ref(input_ref: &InputRef) -> Self {
        BorrowedInput { handle: input_ref.handle, functions: input_ref.functions }
    }
}

impl Image for BorrowedInput {
    fn size(&self) -> Result<u64> {
        let f = unsafe { &*self.functions };
        let mut out = 0u64;
        let code = unsafe { (f.size)(self.handle, &mut out) };
        if code != 0 {
            return Err(DiskMorphError::from_plugin_code(code));
        }
        Ok(out)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let f = unsafe { &*self.functions };
        let mut out_read = 0u64;
        let code = unsafe {
            (f.read)(self.handle, buf.as_mut_ptr(), offset, buf.len() as u64, &mut out_read)
        };
        if code != 0 {
            return Err(DiskMorphError::from_plugin_code(code));
        }
        Ok(out_read as usize)
    }
}

/// Non-owning view over a `MorphRef` handed to an output plug-in's
/// `open`. Same ownership story as `BorrowedInput`: the pipeline builder
/// retains the real `MorphAdapter` and closes it; this wrapper never does.
pub struct BorrowedMorph {
    handle: *mut c_void,
    functions: *const MorphFunctions,
}

unsafe impl Send for BorrowedMorph {}
unsafe impl Sync for BorrowedMorph {}

impl BorrowedMorph {
    /// # Safety
    /// `morph_ref` must stay valid (handle alive, function table valid)
    /// for as long as the returned view is used.
    pub unsafe fn from_ref(morph_ref: &diskmorph_abi::MorphRef) -> Self {
        BorrowedMorph { handle: morph_ref.handle, functions: morph_ref.functions }
    }
}

impl Image for BorrowedMorph {
    fn size(&self) -> Result<u64> {
        let f = unsafe { &*self.functions };
        let mut out = 0u64;
        let code = unsafe { (f.size)(self.handle, &mut out) };
        if code != 0 {
            return Err(DiskMorphError::from_plugin_code(code));
        }
        Ok(out)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let f = unsafe { &*self.functions };
        let mut out_read = 0u64;
        let code = unsafe {
            (f.read)(self.handle, buf.as_mut_ptr(), offset, buf.len() as u64, &mut out_read)
        };
        if code != 0 {
            return Err(DiskMorphError::from_plugin_code(code));
        }
        Ok(out_read as usize)
    }
}

pub struct MorphAdapter {
    pub(crate) handle: *mut c_void,
    pub(crate) functions: *const MorphFunctions,
    pub(crate) _lib: LibHandle,
    /// Keeps the input adapters (and the libraries behind them) alive for
    /// as long as the morph handle may call back into them.
    pub(crate) _inputs: Vec<Arc<InputAdapter>>,
}

unsafe impl Send for MorphAdapter {}
unsafe impl Sync for MorphAdapter {}

impl Image for MorphAdapter {
    fn size(&self) -> Result<u64> {
        let f = unsafe { &*self.functions };
        let mut out = 0u64;
        let code = unsafe { (f.size)(self.handle, &mut out) };
        if code != 0 {
            return Err(DiskMorphError::from_plugin_code(code));
        }
        Ok(out)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let f = unsafe { &*self.functions };
        let mut out_read = 0u64;
        let code = unsafe {
            (f.read)(
                self.handle,
                buf.as_mut_ptr(),
                offset,
                buf.len() as u64,
                &mut out_read,
            )
        };
        if code != 0 {
            return Err(DiskMorphError::from_plugin_code(code));
        }
        Ok(out_read as usize)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let f = unsafe { &*self.functions };
        let mut out_written = 0u64;
        let code = unsafe {
            (f.write)(
                self.handle,
                buf.as_ptr(),
                offset,
                buf.len() as u64,
                &mut out_written,
            )
        };
        if code != 0 {
            return Err(DiskMorphError::from_plugin_code(code));
        }
        Ok(out_written as usize)
    }
}

impl Drop for MorphAdapter {
    fn drop(&mut self) {
        let f = unsafe { &*self.functions };
        unsafe {
            (f.close)(self.handle);
            (f.destroy_handle)(self.handle);
        }
    }
}

pub struct OutputAdapter {
    pub(crate) handle: *mut c_void,
    pub(crate) functions: *const OutputFunctions,
    pub(crate) _lib: LibHandle,
    pub(crate) _morph: Arc<MorphAdapter>,
}

unsafe impl Send for OutputAdapter {}
unsafe impl Sync for OutputAdapter {}

impl OutputAdapter {
    /// Pulls the plug-in's info-file text (the sidecar a consumer can read
    /// to learn the envelope's type and size) through `GetInfofileContent`,
    /// copies it into an owned `String`, and frees the plug-in's buffer.
    pub fn info_file_content(&self) -> Result<String> {
        let f = unsafe { &*self.functions };
        let mut out_buf: *mut std::os::raw::c_char = std::ptr::null_mut();
        let code = unsafe { (f.get_infofile_content)(self.handle, &mut out_buf) };
        if code != 0 {
            return Err(DiskMorphError::from_plugin_code(code));
        }
        if out_buf.is_null() {
            return Ok(String::new());
        }
        let text = unsafe { std::ffi::CStr::from_ptr(out_buf) }.to_string_lossy().into_owned();
        unsafe { (f.free_buffer)(out_buf as *mut c_void) };
        Ok(text)
    }
}

impl Image for OutputAdapter {
    fn size(&self) -> Result<u64> {
        let f = unsafe { &*self.functions };
        let mut out = 0u64;
        let code = unsafe { (f.size)(self.handle, &mut out) };
        if code != 0 {
            return Err(DiskMorphError::from_plugin_code(code));
        }
        Ok(out)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let f = unsafe { &*self.functions };
        let mut out_read = 0u64;
        let code = unsafe {
            (f.read)(
                self.handle,
                buf.as_mut_ptr(),
                offset,
                buf.len() as u64,
                &mut out_read,
            )
        };
        if code != 0 {
            return Err(DiskMorphError::from_plugin_code(code));
        }
        Ok(out_read as usize)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let f = unsafe { &*self.functions };
        let mut out_written = 0u64;
        let code = unsafe {
            (f.write)(
                self.handle,
                buf.as_ptr(),
                offset,
                buf.len() as u64,
                &mut out_written,
            )
        };
        if code != 0 {
            return Err(DiskMorphError::from_plugin_code(code));
        }
        Ok(out_written as usize)
    }
}

impl Drop for OutputAdapter {
    fn drop(&mut self) {
        let f = unsafe { &*self.functions };
        unsafe {
            (f.close)(self.handle);
            (f.destroy_handle)(self.handle);
        }
    }
}
