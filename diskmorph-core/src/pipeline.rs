//! Pipeline builder: turns a resolved configuration into one live handle
//! per layer, wired inputs -> morph -> output -> (optional) cache.
//!
//! Mirrors the control flow in the design notes: the configuration names
//! a vector of (input-format, source-file-list) tuples, an optional morph
//! type (`combine` unless told otherwise), an output format, and an
//! optional cache file. Exactly one handle is instantiated per input
//! tuple and exactly one for morph and output; morph's `transform` is
//! called exactly once, at build time, not per read.

use std::ffi::CString;
use std::os::raw::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use diskmorph_abi::InputRef;

use crate::cache::CowCache;
use crate::error::{DiskMorphError, Result};
use crate::fingerprint;
use crate::image::{Image, InputAdapter, LibHandle, MorphAdapter, OutputAdapter};
use crate::registry::Registry;

pub struct InputSpec {
    pub format: String,
    pub files: Vec<PathBuf>,
    pub offset: u64,
    pub size_limit: u64,
    pub options: Option<String>,
}

pub struct PipelineConfig {
    pub inputs: Vec<InputSpec>,
    /// Defaults to `"combine"` when empty, matching the morph plug-in's
    /// default behaviour.
    pub morph_format: String,
    pub morph_options: Option<String>,
    pub output_format: String,
    pub output_options: Option<String>,
    pub cache_path: Option<PathBuf>,
    pub cache_overwrite: bool,
}

impl PipelineConfig {
    pub fn morph_format_or_default(&self) -> &str {
        if self.morph_format.is_empty() { "combine" } else { &self.morph_format }
    }
}

enum Envelope {
    Cached(CowCache),
    Direct(Arc<OutputAdapter>),
}

/// The assembled, ready-to-serve pipeline: N inputs, one morph, one
/// output, optionally fronted by a copy-on-write cache.
pub struct Pipeline {
    envelope: Envelope,
    // Held only to keep the chain alive for as long as the pipeline is;
    // never read directly once `envelope` is constructed.
    _output: Arc<OutputAdapter>,
}

impl Pipeline {
    pub fn build(registry: &Registry, config: &PipelineConfig) -> Result<Pipeline> {
        if config.inputs.is_empty() {
            return Err(DiskMorphError::bad_argument("no input files given"));
        }

        let inputs: Vec<Arc<InputAdapter>> = config
            .inputs
            .iter()
            .map(|spec| build_input(registry, spec))
            .collect::<Result<_>>()?;
        let morph = build_morph(registry, config, inputs)?;
        let output = build_output(registry, config, morph)?;

        let envelope = match &config.cache_path {
            Some(path) => Envelope::Cached(CowCache::open(
                Box::new(AdapterHandle(output.clone())),
                path,
                config.cache_overwrite,
            )?),
            None => Envelope::Direct(output.clone()),
        };

        Ok(Pipeline { envelope, _output: output })
    }

    pub fn size(&self) -> Result<u64> {
        match &self.envelope {
            Envelope::Cached(c) => Ok(c.size()),
            Envelope::Direct(o) => o.size(),
        }
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match &self.envelope {
            Envelope::Cached(c) => c.read(offset, buf),
            Envelope::Direct(o) => o.read(offset, buf),
        }
    }

    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        match &self.envelope {
            Envelope::Cached(c) => c.write(offset, buf),
            Envelope::Direct(o) => o.write(offset, buf),
        }
    }

    /// Info-file text for the output envelope, regardless of whether a
    /// cache sits in front of it.
    pub fn info_file_content(&self) -> Result<String> {
        self._output.info_file_content()
    }
}

/// Adapts an `Arc<OutputAdapter>` into a plain `Image` the cache can hold
/// by value, without cloning the adapter's FFI state.
struct AdapterHandle(Arc<OutputAdapter>);

impl Image for AdapterHandle {
    fn size(&self) -> Result<u64> {
        self.0.size()
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.0.read(offset, buf)
    }
}

fn to_cstrings(paths: &[PathBuf]) -> Result<Vec<CString>> {
    paths
        .iter()
        .map(|p| {
            CString::new(p.as_os_str().to_str().unwrap_or_default())
                .map_err(|_| DiskMorphError::bad_argument("input path contains a NUL byte"))
        })
        .collect()
}

fn options_cstring(options: &Option<String>) -> Result<Option<CString>> {
    match options {
        Some(s) => Ok(Some(
            CString::new(s.as_str())
                .map_err(|_| DiskMorphError::bad_argument("options string contains a NUL byte"))?,
        )),
        None => Ok(None),
    }
}

fn build_input(registry: &Registry, spec: &InputSpec) -> Result<Arc<InputAdapter>> {
    let plugin = registry.find_input(&spec.format)?;
    let f = unsafe { &*plugin.functions };

    let mut handle: *mut c_void = std::ptr::null_mut();
    let code = unsafe { (f.create_handle)(&mut handle) };
    if code != 0 {
        return Err(DiskMorphError::from_plugin_code(code));
    }

    if let Some(options) = options_cstring(&spec.options)? {
        let code = unsafe { (f.options_parse)(handle, options.as_ptr()) };
        if code != 0 {
            unsafe {
                (f.destroy_handle)(handle);
            }
            return Err(DiskMorphError::from_plugin_code(code));
        }
    }

    let file_cstrings = to_cstrings(&spec.files)?;
    let file_ptrs: Vec<*const std::os::raw::c_char> =
        file_cstrings.iter().map(|c| c.as_ptr()).collect();

    let code = unsafe {
        (f.open)(
            handle,
            file_ptrs.as_ptr(),
            file_ptrs.len() as std::os::raw::c_int,
            spec.offset,
            spec.size_limit,
        )
    };
    if code != 0 {
        unsafe {
            (f.destroy_handle)(handle);
        }
        return Err(DiskMorphError::from_plugin_code(code));
    }

    Ok(Arc::new(InputAdapter {
        handle,
        functions: plugin.functions,
        _lib: LibHandle(plugin.lib.clone()),
    }))
}

fn build_morph(
    registry: &Registry,
    config: &PipelineConfig,
    inputs: Vec<Arc<InputAdapter>>,
) -> Result<Arc<MorphAdapter>> {
    let plugin = registry.find_morph(config.morph_format_or_default())?;
    let f = unsafe { &*plugin.functions };

    let mut handle: *mut c_void = std::ptr::null_mut();
    let code = unsafe { (f.create_handle)(&mut handle) };
    if code != 0 {
        return Err(DiskMorphError::from_plugin_code(code));
    }

    let input_refs: Vec<InputRef> = inputs
        .iter()
        .map(|i| InputRef { handle: i.handle, functions: i.functions })
        .collect();
    let options = options_cstring(&config.morph_options)?;
    let options_ptr = options.as_ref().map(|c| c.as_ptr()).unwrap_or(std::ptr::null());

    // `transform` is called exactly once, here, at pipeline-build time.
    let code = unsafe {
        (f.transform)(handle, input_refs.as_ptr(), input_refs.len() as std::os::raw::c_int, options_ptr)
    };
    if code != 0 {
        unsafe {
            (f.destroy_handle)(handle);
        }
        return Err(DiskMorphError::from_plugin_code(code));
    }

    Ok(Arc::new(MorphAdapter {
        handle,
        functions: plugin.functions,
        _lib: LibHandle(plugin.lib.clone()),
        _inputs: inputs,
    }))
}

fn build_output(
    registry: &Registry,
    config: &PipelineConfig,
    morph: Arc<MorphAdapter>,
) -> Result<Arc<OutputAdapter>> {
    let plugin = registry.find_output(&config.output_format)?;
    let f = unsafe { &*plugin.functions };

    let mut handle: *mut c_void = std::ptr::null_mut();
    let code = unsafe { (f.create_handle)(&mut handle) };
    if code != 0 {
        return Err(DiskMorphError::from_plugin_code(code));
    }

    let fp = fingerprint::compute(morph.as_ref() as &dyn Image)?;
    let morph_ref = diskmorph_abi::MorphRef { handle: morph.handle, functions: morph.functions };
    let options = options_cstring(&config.output_options)?;
    let options_ptr = options.as_ref().map(|c| c.as_ptr()).unwrap_or(std::ptr::null());

    let code = unsafe { (f.open)(handle, morph_ref, &fp, options_ptr) };
    if code != 0 {
        unsafe {
            (f.destroy_handle)(handle);
        }
        return Err(DiskMorphError::from_plugin_code(code));
    }

    Ok(Arc::new(OutputAdapter {
        handle,
        functions: plugin.functions,
        _lib: LibHandle(plugin.lib.clone()),
        _morph: morph,
    }))
}

/// Default cache path alongside the mountpoint, matching the teacher's
/// convention of a sibling `.cache` file.
pub fn default_cache_path(mountpoint: &Path) -> PathBuf {
    let mut name = mountpoint.file_name().map(|n| n.to_owned()).unwrap_or_default();
    name.push(".diskmorph-cache");
    mountpoint.with_file_name(name)
}
