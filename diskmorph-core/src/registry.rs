//! Plug-in discovery: scan a directory for shared objects named by role
//! prefix, load each, validate its ABI version and symbol set, and index
//! it by every format string it claims to support.
//!
//! Populated once at startup, consulted per format lookup afterwards,
//! torn down last (after every pipeline handle that still references a
//! loaded library has been dropped, since `Registry` is what keeps the
//! `Library` objects themselves alive).

use std::ffi::c_char;
use std::path::Path;
use std::sync::Arc;

use diskmorph_abi::{
    InputFunctions, MorphFunctions, OutputFunctions, INPUT_API_VERSION, INPUT_FORMATS_SYMBOL,
    INPUT_FUNCTIONS_SYMBOL, INPUT_VERSION_SYMBOL, MORPH_API_VERSION, MORPH_FORMATS_SYMBOL,
    MORPH_FUNCTIONS_SYMBOL, MORPH_VERSION_SYMBOL, OUTPUT_API_VERSION, OUTPUT_FORMATS_SYMBOL,
    OUTPUT_FUNCTIONS_SYMBOL, OUTPUT_VERSION_SYMBOL, Role,
};
use libloading::{Library, Symbol};

use crate::error::{DiskMorphError, Result};

pub(crate) struct LoadedPlugin<F> {
    pub name: String,
    pub lib: Arc<Library>,
    pub functions: *const F,
}

// `functions` points into the mmap'd shared object kept alive by `lib`;
// the registry only ever hands out `&'static`-lifetime-equivalent reads
// through adapters that also hold `lib`.
unsafe impl<F> Send for LoadedPlugin<F> {}
unsafe impl<F> Sync for LoadedPlugin<F> {}

#[derive(Default)]
pub struct Registry {
    pub(crate) inputs: std::collections::HashMap<String, Arc<LoadedPlugin<InputFunctions>>>,
    pub(crate) morphs: std::collections::HashMap<String, Arc<LoadedPlugin<MorphFunctions>>>,
    pub(crate) outputs: std::collections::HashMap<String, Arc<LoadedPlugin<OutputFunctions>>>,
    input_order: Vec<String>,
    morph_order: Vec<String>,
    output_order: Vec<String>,
}

impl Registry {
    /// Scan `dir` for every entry whose name begins with a role prefix,
    /// load it, and register it by supported format. A missing directory
    /// or an empty result is fatal; a bad individual plug-in is skipped
    /// with a warning.
    pub fn discover(dir: &Path) -> Result<Self> {
        let read_dir = std::fs::read_dir(dir).map_err(|e| {
            DiskMorphError::bad_argument(format!(
                "plug-in directory {} not found: {e}",
                dir.display()
            ))
        })?;

        let mut reg = Registry::default();

        for entry in read_dir.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if file_name.starts_with(Role::Input.file_prefix()) {
                match reg.load_input(&path) {
                    Ok(()) => {}
                    Err(e) => log::warn!("skipping input plug-in {file_name}: {e}"),
                }
            } else if file_name.starts_with(Role::Morph.file_prefix()) {
                match reg.load_morph(&path) {
                    Ok(()) => {}
                    Err(e) => log::warn!("skipping morph plug-in {file_name}: {e}"),
                }
            } else if file_name.starts_with(Role::Output.file_prefix()) {
                match reg.load_output(&path) {
                    Ok(()) => {}
                    Err(e) => log::warn!("skipping output plug-in {file_name}: {e}"),
                }
            }
        }

        if reg.inputs.is_empty() && reg.morphs.is_empty() && reg.outputs.is_empty() {
            return Err(DiskMorphError::bad_argument(format!(
                "no plug-ins loaded from {}",
                dir.display()
            )));
        }

        Ok(reg)
    }

    fn load_input(&mut self, path: &Path) -> Result<()> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| DiskMorphError::corruption(format!("dlopen failed: {e}")))?;

        let version: Symbol<unsafe extern "C" fn() -> u32> =
            unsafe { lib.get(INPUT_VERSION_SYMBOL) }
                .map_err(|e| DiskMorphError::corruption(format!("missing version symbol: {e}")))?;
        if unsafe { version() } != INPUT_API_VERSION {
            return Err(DiskMorphError::unsupported("input plug-in ABI version mismatch"));
        }

        let formats_fn: Symbol<unsafe extern "C" fn() -> *const c_char> =
            unsafe { lib.get(INPUT_FORMATS_SYMBOL) }
                .map_err(|e| DiskMorphError::corruption(format!("missing formats symbol: {e}")))?;
        let formats = unsafe { diskmorph_abi::unpack_formats(formats_fn()) };

        let functions_fn: Symbol<unsafe extern "C" fn() -> *const InputFunctions> =
            unsafe { lib.get(INPUT_FUNCTIONS_SYMBOL) }.map_err(|e| {
                DiskMorphError::corruption(format!("missing function table symbol: {e}"))
            })?;
        let functions = unsafe { functions_fn() };
        if functions.is_null() {
            return Err(DiskMorphError::corruption("null function table"));
        }

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        let lib = Arc::new(lib);
        let plugin = Arc::new(LoadedPlugin { name, lib, functions });

        for fmt in formats {
            self.input_order.push(fmt.clone());
            self.inputs.entry(fmt).or_insert_with(|| plugin.clone());
        }
        Ok(())
    }

    fn load_morph(&mut self, path: &Path) -> Result<()> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| DiskMorphError::corruption(format!("dlopen failed: {e}")))?;

        let version: Symbol<unsafe extern "C" fn() -> u32> =
            unsafe { lib.get(MORPH_VERSION_SYMBOL) }
                .map_err(|e| DiskMorphError::corruption(format!("missing version symbol: {e}")))?;
        if unsafe { version() } != MORPH_API_VERSION {
            return Err(DiskMorphError::unsupported("morph plug-in ABI version mismatch"));
        }

        let formats_fn: Symbol<unsafe extern "C" fn() -> *const c_char> =
            unsafe { lib.get(MORPH_FORMATS_SYMBOL) }
                .map_err(|e| DiskMorphError::corruption(format!("missing formats symbol: {e}")))?;
        let formats = unsafe { diskmorph_abi::unpack_formats(formats_fn()) };

        let functions_fn: Symbol<unsafe extern "C" fn() -> *const MorphFunctions> =
            unsafe { lib.get(MORPH_FUNCTIONS_SYMBOL) }.map_err(|e| {
                DiskMorphError::corruption(format!("missing function table symbol: {e}"))
            })?;
        let functions = unsafe { functions_fn() };
        if functions.is_null() {
            return Err(DiskMorphError::corruption("null function table"));
        }

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        let lib = Arc::new(lib);
        let plugin = Arc::new(LoadedPlugin { name, lib, functions });

        for fmt in formats {
            self.morph_order.push(fmt.clone());
            self.morphs.entry(fmt).or_insert_with(|| plugin.clone());
        }
        Ok(())
    }

    fn load_output(&mut self, path: &Path) -> Result<()> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| DiskMorphError::corruption(format!("dlopen failed: {e}")))?;

        let version: Symbol<unsafe extern "C" fn() -> u32> =
            unsafe { lib.get(OUTPUT_VERSION_SYMBOL) }
                .map_err(|e| DiskMorphError::corruption(format!("missing version symbol: {e}")))?;
        if unsafe { version() } != OUTPUT_API_VERSION {
            return Err(DiskMorphError::unsupported("output plug-in ABI version mismatch"));
        }

        let formats_fn: Symbol<unsafe extern "C" fn() -> *const c_char> =
            unsafe { lib.get(OUTPUT_FORMATS_SYMBOL) }
                .map_err(|e| DiskMorphError::corruption(format!("missing formats symbol: {e}")))?;
        let formats = unsafe { diskmorph_abi::unpack_formats(formats_fn()) };

        let functions_fn: Symbol<unsafe extern "C" fn() -> *const OutputFunctions> =
            unsafe { lib.get(OUTPUT_FUNCTIONS_SYMBOL) }.map_err(|e| {
                DiskMorphError::corruption(format!("missing function table symbol: {e}"))
            })?;
        let functions = unsafe { functions_fn() };
        if functions.is_null() {
            return Err(DiskMorphError::corruption("null function table"));
        }

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        let lib = Arc::new(lib);
        let plugin = Arc::new(LoadedPlugin { name, lib, functions });

        for fmt in formats {
            self.output_order.push(fmt.clone());
            self.outputs.entry(fmt).or_insert_with(|| plugin.clone());
        }
        Ok(())
    }

    pub fn find_input(&self, format: &str) -> Result<Arc<LoadedPlugin<InputFunctions>>> {
        self.inputs
            .get(format)
            .cloned()
            .ok_or_else(|| DiskMorphError::unsupported(format!("unsupported input format: {format}")))
    }

    pub fn find_morph(&self, format: &str) -> Result<Arc<LoadedPlugin<MorphFunctions>>> {
        self.morphs
            .get(format)
            .cloned()
            .ok_or_else(|| DiskMorphError::unsupported(format!("unsupported morph type: {format}")))
    }

    pub fn find_output(&self, format: &str) -> Result<Arc<LoadedPlugin<OutputFunctions>>> {
        self.outputs
            .get(format)
            .cloned()
            .ok_or_else(|| DiskMorphError::unsupported(format!("unsupported output format: {format}")))
    }

    /// `(role, name, formats)` for every loaded plug-in, in registration
    /// order — backs the `diskmorph plugins` subcommand.
    pub fn list(&self) -> Vec<(Role, String, Vec<String>)> {
        let mut out = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for fmt in &self.input_order {
            if let Some(p) = self.inputs.get(fmt) {
                if seen.insert((Role::Input, p.name.clone())) {
                    let formats: Vec<_> = self
                        .inputs
                        .iter()
                        .filter(|(_, v)| Arc::ptr_eq(v, p))
                        .map(|(k, _)| k.clone())
                        .collect();
                    out.push((Role::Input, p.name.clone(), formats));
                }
            }
        }
        for fmt in &self.morph_order {
            if let Some(p) = self.morphs.get(fmt) {
                if seen.insert((Role::Morph, p.name.clone())) {
                    let formats: Vec<_> = self
                        .morphs
                        .iter()
                        .filter(|(_, v)| Arc::ptr_eq(v, p))
                        .map(|(k, _)| k.clone())
                        .collect();
                    out.push((Role::Morph, p.name.clone(), formats));
                }
            }
        }
        for fmt in &self.output_order {
            if let Some(p) = self.outputs.get(fmt) {
                if seen.insert((Role::Output, p.name.clone())) {
                    let formats: Vec<_> = self
                        .outputs
                        .iter()
                        .filter(|(_, v)| Arc::ptr_eq(v, p))
                        .map(|(k, _)| k.clone())
                        .collect();
                    out.push((Role::Output, p.name.clone(), formats));
                }
            }
        }
        out
    }
}
