//! Kernel-wide error type with the fixed MOS error numbering.
//!
//! System calls report failure as the negated code; user library functions
//! propagate the same values.

use core::fmt;

/// Result type alias for kernel operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Kernel and file-server error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum Error {
    /// Generic catch-all for otherwise unmapped conditions.
    Unspecified = 1,
    /// Identifier names no live Env, or the caller lacks permission over it.
    BadEnv = 2,
    /// Malformed argument: bad address, alignment, perm bits or status value.
    Inval = 3,
    /// Physical frame allocator is empty.
    NoMemory = 4,
    /// Unknown system-call number.
    NoSys = 5,
    /// Env table is full.
    NoFreeEnv = 6,
    /// IPC target is not currently blocked in receive.
    IpcNotRecv = 7,
    /// File too large, or a block outside the volume.
    NoDisk = 8,
    /// Per-process or server open-file table is full.
    MaxOpen = 9,
    /// File-server lookup failure.
    NotFound = 10,
    /// Malformed path.
    BadPath = 11,
    /// File-server create collision.
    FileExists = 12,
    /// Image is not a loadable executable.
    NotExecutable = 13,
}

impl Error {
    /// Negative integer form returned from system calls.
    pub const fn to_errno(self) -> i32 {
        -(self as i32)
    }

    /// Recover an `Error` from a negative syscall return value.
    pub const fn from_errno(errno: i32) -> Option<Self> {
        match -errno {
            1 => Some(Self::Unspecified),
            2 => Some(Self::BadEnv),
            3 => Some(Self::Inval),
            4 => Some(Self::NoMemory),
            5 => Some(Self::NoSys),
            6 => Some(Self::NoFreeEnv),
            7 => Some(Self::IpcNotRecv),
            8 => Some(Self::NoDisk),
            9 => Some(Self::MaxOpen),
            10 => Some(Self::NotFound),
            11 => Some(Self::BadPath),
            12 => Some(Self::FileExists),
            13 => Some(Self::NotExecutable),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified error",
            Self::BadEnv => "bad environment",
            Self::Inval => "invalid parameter",
            Self::NoMemory => "out of memory",
            Self::NoSys => "no such system call",
            Self::NoFreeEnv => "no free environment",
            Self::IpcNotRecv => "env is not receiving",
            Self::NoDisk => "no free space on disk",
            Self::MaxOpen => "too many files are open",
            Self::NotFound => "file or block not found",
            Self::BadPath => "bad path",
            Self::FileExists => "file already exists",
            Self::NotExecutable => "file is not a valid executable",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Convert a syscall-style return value into a `Result`.
pub fn from_syscall(ret: i32) -> Result<u32> {
    if ret < 0 {
        Err(Error::from_errno(ret).unwrap_or(Error::Unspecified))
    } else {
        Ok(ret as u32)
    }
}
