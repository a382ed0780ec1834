//! Kernel error types.
//!
//! Errors are plain values returned up the call stack; nothing in the
//! kernel unwinds. The syscall dispatcher flattens any `Err` into a -1
//! return value for user space, so variants exist for diagnostics and for
//! callers that branch on the cause (e.g. pipe writers distinguishing a
//! closed read end from a bad address).

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical frame or table slot exhaustion.
    OutOfMemory,
    /// A user-supplied address failed translation or permission checks.
    BadAddress { addr: usize },
    /// A fixed-size kernel table has no free slot.
    ResourceExhausted { resource: &'static str },
    /// Caller passed a value outside the accepted domain.
    InvalidArgument { name: &'static str },
    /// Filesystem-level failure.
    Fs(FsError),
    /// Write on a pipe whose read end is closed.
    BrokenPipe,
    /// The process was killed while sleeping; the syscall must abort.
    Interrupted,
    /// Device reported a failure (virtqueue status byte, bad MMIO probe).
    DeviceError { device: &'static str, code: u32 },
    /// Injected power failure from the log's crash-test hook. On bare
    /// metal the kernel panics instead of surfacing this; hosted tests
    /// observe it and remount to exercise recovery.
    SimulatedCrash { point: &'static str },
}

/// Filesystem-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path or directory entry not found.
    NotFound,
    /// Directory entry already exists.
    AlreadyExists,
    /// Path component traversed a non-directory.
    NotADirectory,
    /// Directory where a file was required.
    IsADirectory,
    /// File descriptor out of range or not open.
    BadFileDescriptor,
    /// Open mode forbids the attempted access.
    NotOpenForThat,
    /// Name longer than a directory entry can hold.
    NameTooLong,
    /// Write would exceed the maximum file size.
    FileTooLarge,
    /// Data-block bitmap has no free bit.
    NoFreeBlocks,
    /// On-disk inode table has no free entry.
    NoFreeInodes,
    /// Superblock magic mismatch at mount.
    BadMagic,
    /// Unlink of `.`, `..`, or a non-empty directory.
    NotEmpty,
    /// Executable image failed validation.
    BadExecutable,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::BadAddress { addr } => write!(f, "bad user address {:#x}", addr),
            Self::ResourceExhausted { resource } => {
                write!(f, "resource exhausted: {}", resource)
            }
            Self::InvalidArgument { name } => write!(f, "invalid argument '{}'", name),
            Self::Fs(e) => write!(f, "filesystem error: {:?}", e),
            Self::BrokenPipe => write!(f, "broken pipe"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::DeviceError { device, code } => {
                write!(f, "device error on {}: code {:#x}", device, code)
            }
            Self::SimulatedCrash { point } => write!(f, "simulated crash: {}", point),
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn fs_error_converts_via_question_mark() {
        fn inner() -> KernelResult<()> {
            Err(FsError::NotFound)?
        }
        assert_eq!(inner(), Err(KernelError::Fs(FsError::NotFound)));
    }

    #[test]
    fn display_is_readable() {
        let e = KernelError::DeviceError {
            device: "virtio-blk",
            code: 2,
        };
        assert_eq!(
            std::format!("{}", e),
            "device error on virtio-blk: code 0x2"
        );
    }
}
