//! `mount`: assemble a `Pipeline` from the External Interfaces §6
//! configuration value and attach it to a FUSE mountpoint exposing
//! exactly one regular file — the envelope, named after the output
//! format. The `fuser::Filesystem` impl below is a thin, contract-only
//! shim: every operation on the envelope file delegates straight to the
//! `Pipeline`; it holds no pipeline logic of its own.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use diskmorph_core::pipeline::{InputSpec, Pipeline, PipelineConfig};
use diskmorph_core::{DiskMorphError, Registry};
use fuser::{
    Errno, FileAttr, FileHandle, FileType, FopenFlags, Generation, INodeNo, MountOption,
    OpenFlags, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry, ReplyOpen, ReplyStatfs,
    ReplyWrite, Request, TimeOrNow,
};

use crate::commands::plugins::DEFAULT_PLUGIN_DIR;

const TTL: Duration = Duration::MAX;
const ROOT_INO: u64 = 1;
const IMAGE_INO: u64 = 2;

#[derive(Parser, Debug)]
pub struct Cli {
    /// One evidence group: `<format>:<file>[,<file>...]`. May be given
    /// more than once; the morph layer concatenates them in order.
    #[arg(long = "in", required = true)]
    inputs: Vec<String>,

    /// Bytes to skip at the start of each input, before morphing
    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// Cap the exposed size of each input, in bytes (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    sizelimit: u64,

    /// Morph type: combine (default), byteswap, swab, unallocated
    #[arg(long, default_value = "combine")]
    morph: String,

    /// Options string passed verbatim to the input plug-in(s)
    #[arg(long)]
    inopts: Option<String>,

    /// Options string passed verbatim to the morph plug-in
    #[arg(long)]
    morphopts: Option<String>,

    /// Output envelope format: raw, dmg, vdi, vhd, vmdk
    #[arg(long = "out", required = true)]
    output: String,

    /// Options string passed verbatim to the output plug-in
    #[arg(long)]
    outopts: Option<String>,

    /// Copy-on-write cache file; writes are diverted here instead of
    /// touching the evidence. Without this, the mount is read-only.
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Recreate the cache file instead of reusing an existing one
    #[arg(long)]
    overwrite_cache: bool,

    /// Directory to scan for plug-in shared objects
    #[arg(short = 'p', long, default_value = DEFAULT_PLUGIN_DIR)]
    plugin_dir: PathBuf,

    /// Stay attached to the terminal instead of forking to the background
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Where to attach the virtual image
    mountpoint: PathBuf,
}

fn parse_input_group(raw: &str) -> anyhow::Result<InputSpec> {
    let (format, files) = raw
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("--in {raw:?} is missing a ':' between format and file list"))?;
    if files.is_empty() {
        anyhow::bail!("--in {raw:?} names no files");
    }
    Ok(InputSpec {
        format: format.to_string(),
        files: files.split(',').map(PathBuf::from).collect(),
        offset: 0,
        size_limit: 0,
        options: None,
    })
}

fn image_filename(output_format: &str) -> String {
    let ext = match output_format {
        "raw" => "dd",
        other => other,
    };
    format!("image.{ext}")
}

fn errno_of(err: &DiskMorphError) -> Errno {
    Errno::from_i32(err.as_errno())
}

fn dir_attr(ino: u64) -> FileAttr {
    FileAttr {
        ino: INodeNo(ino),
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: FileType::Directory,
        perm: 0o555,
        nlink: 2,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn file_attr(ino: u64, size: u64, writable: bool) -> FileAttr {
    FileAttr {
        ino: INodeNo(ino),
        size,
        blocks: size.div_ceil(512),
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: FileType::RegularFile,
        perm: if writable { 0o644 } else { 0o444 },
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

struct DiskMorphFs {
    pipeline: Pipeline,
    image_name: String,
    writable: bool,
}

// `Pipeline` forwards every call through `#[repr(C)]` function tables
// that are themselves `Send + Sync` (see `diskmorph_core::image`); FUSE
// worker threads sharing one `DiskMorphFs` is exactly the intended usage.
unsafe impl Send for DiskMorphFs {}
unsafe impl Sync for DiskMorphFs {}

impl DiskMorphFs {
    fn size(&self) -> u64 {
        self.pipeline.size().unwrap_or(0)
    }
}

impl fuser::Filesystem for DiskMorphFs {
    fn init(&mut self, _req: &Request, _config: &mut fuser::KernelConfig) -> std::io::Result<()> {
        log::info!("diskmorph fuse: mounted, exposing {}", self.image_name);
        Ok(())
    }

    fn destroy(&mut self) {
        log::info!("diskmorph fuse: unmounting");
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        if parent.0 != ROOT_INO || name.to_str() != Some(self.image_name.as_str()) {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        }
        reply.entry(&TTL, &file_attr(IMAGE_INO, self.size(), self.writable), Generation(0));
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        match ino.0 {
            ROOT_INO => reply.attr(&TTL, &dir_attr(ROOT_INO)),
            IMAGE_INO => reply.attr(&TTL, &file_attr(IMAGE_INO, self.size(), self.writable)),
            _ => reply.error(Errno::from_i32(libc::ENOENT)),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        if ino.0 != IMAGE_INO {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        }
        reply.opened(FileHandle(0), FopenFlags::FOPEN_KEEP_CACHE);
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: i64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if ino.0 != IMAGE_INO || offset < 0 {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        }
        let mut buf = vec![0u8; size as usize];
        match self.pipeline.read(offset as u64, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn write(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: OpenFlags,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if ino.0 != IMAGE_INO || offset < 0 {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        }
        match self.pipeline.write(offset as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino.0 != ROOT_INO {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        }
        let entries: [(u64, FileType, &str); 3] = [
            (ROOT_INO, FileType::Directory, "."),
            (ROOT_INO, FileType::Directory, ".."),
            (IMAGE_INO, FileType::RegularFile, self.image_name.as_str()),
        ];
        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(INodeNo(*ino), (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: ReplyStatfs) {
        let size = self.size();
        let blocks = size.div_ceil(512);
        reply.statfs(blocks, 0, 0, 1, 0, 512, 255, 0);
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        match ino.0 {
            ROOT_INO => reply.attr(&TTL, &dir_attr(ROOT_INO)),
            IMAGE_INO => reply.attr(&TTL, &file_attr(IMAGE_INO, self.size(), self.writable)),
            _ => reply.error(Errno::from_i32(libc::ENOENT)),
        }
    }
}

pub fn run(args: Cli) -> anyhow::Result<()> {
    let registry = Registry::discover(&args.plugin_dir)?;

    let mut inputs = Vec::with_capacity(args.inputs.len());
    for raw in &args.inputs {
        let mut spec = parse_input_group(raw)?;
        spec.offset = args.offset;
        spec.size_limit = args.sizelimit;
        spec.options = args.inopts.clone();
        inputs.push(spec);
    }

    let config = PipelineConfig {
        inputs,
        morph_format: args.morph.clone(),
        morph_options: args.morphopts.clone(),
        output_format: args.output.clone(),
        output_options: args.outopts.clone(),
        cache_path: args.cache.clone(),
        cache_overwrite: args.overwrite_cache,
    };

    let pipeline = Pipeline::build(&registry, &config)?;
    let writable = args.cache.is_some();
    let image_name = image_filename(&args.output);

    let mut mount_options = vec![
        MountOption::FSName("diskmorph".to_string()),
        MountOption::CUSTOM("subtype=diskmorph".to_string()),
    ];
    if !writable {
        mount_options.push(MountOption::RO);
    }

    let fs = DiskMorphFs { pipeline, image_name, writable };

    if args.foreground {
        fuser::mount2(fs, &args.mountpoint, &mount_options)?;
        return Ok(());
    }

    daemonize_and_mount(fs, &args.mountpoint, &mount_options)
}

/// Fork before mounting so the parent (the process `mount`-style tooling
/// waits on) returns only once the mountpoint is actually usable. The
/// child signals readiness through a pipe from `init()`.
fn daemonize_and_mount(
    fs: DiskMorphFs,
    mountpoint: &std::path::Path,
    mount_options: &[MountOption],
) -> anyhow::Result<()> {
    let mut pipe_fds = [0i32; 2];
    if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
        anyhow::bail!("pipe() failed");
    }

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        anyhow::bail!("fork() failed");
    }

    if pid > 0 {
        unsafe { libc::close(pipe_fds[1]) };
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(pipe_fds[0], buf.as_mut_ptr() as *mut _, 1) };
        unsafe { libc::close(pipe_fds[0]) };
        if n == 1 && buf[0] == 0 {
            return Ok(());
        }
        anyhow::bail!("FUSE mount failed in child process");
    }

    unsafe {
        libc::close(pipe_fds[0]);
        libc::setsid();
    }

    // mount2() blocks for the lifetime of the mount, so signal readiness
    // up front: by the time fuser accepts connections the kernel has
    // already acknowledged the mount syscall that spawned this process.
    unsafe {
        let byte = 0u8;
        libc::write(pipe_fds[1], &byte as *const _ as *const _, 1);
        libc::close(pipe_fds[1]);
    }

    if let Err(e) = fuser::mount2(fs, mountpoint, mount_options) {
        log::error!("fuser::mount2 failed: {e}");
        std::process::exit(1);
    }

    Ok(())
}
