//! Error taxonomy shared by every layer of the pipeline.
//!
//! Four broad groups, matching the boundary errno mapping: a bad argument
//! or out-of-range request, a resource exhaustion, an I/O or
//! container-corruption failure, and an unsupported container/feature.
//! No layer retries; a read either returns exact bytes or fails loudly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiskMorphError {
    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("out of memory")]
    Resource,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container corruption: {0}")]
    Corruption(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("plug-in returned error code {0}")]
    PluginFailed(i32),
}

impl DiskMorphError {
    /// Map to the POSIX errno the spec assigns this error's group. Only
    /// meaningful at the outer (FUSE/CLI) boundary — internal layers
    /// propagate the typed error itself.
    pub fn as_errno(&self) -> libc::c_int {
        match self {
            DiskMorphError::BadArgument(_) => libc::EINVAL,
            DiskMorphError::Resource => libc::ENOMEM,
            DiskMorphError::Io(_) | DiskMorphError::Corruption(_) => libc::EIO,
            DiskMorphError::Unsupported(_) => libc::ENOTSUP,
            DiskMorphError::PluginFailed(code) => {
                if *code == 0 {
                    libc::EIO
                } else {
                    code.unsigned_abs() as libc::c_int
                }
            }
        }
    }

    pub fn bad_argument(msg: impl Into<String>) -> Self {
        DiskMorphError::BadArgument(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        DiskMorphError::Corruption(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        DiskMorphError::Unsupported(msg.into())
    }

    /// Translate a raw plug-in return code (0 == success, else an errno-ish
    /// failure code returned across the ABI) into a typed error.
    pub fn from_plugin_code(code: i32) -> Self {
        match code {
            libc::EINVAL => DiskMorphError::BadArgument("plug-in rejected arguments".into()),
            libc::ENOMEM => DiskMorphError::Resource,
            libc::ENOTSUP => DiskMorphError::Unsupported("plug-in does not support this".into()),
            libc::EIO => DiskMorphError::Corruption("plug-in I/O failure".into()),
            other => DiskMorphError::PluginFailed(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, DiskMorphError>;
