#![cfg(any(target_os = "android", target_os = "linux"))]

use std::path::PathBuf;

pub mod cmdline;
pub mod hooks;
pub mod key_value_store;
pub mod oat_header;
pub mod plt_hook;
pub mod relay;

/// Flag appended to the compiler's command line by the launcher.
pub const INJECTED_FLAG: &str = "--inline-max-code-units=0";

/// Selects between a 32-bit and a 64-bit value based on the target's pointer width.
#[macro_export]
macro_rules! lp_select {
    ($lp32:expr, $lp64:expr) => {{
        #[cfg(target_pointer_width = "64")]
        let value = $lp64;
        #[cfg(not(target_pointer_width = "64"))]
        let value = $lp32;
        value
    }};
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error connecting to rendezvous socket `{1}`: `{0}`")]
    Connect(#[source] std::io::Error, String),
    #[error("Error in socket transfer for request {1}: `{0}`")]
    Transport(#[source] std::io::Error, i32),
    #[error("Supervisor sent no descriptor for request {0}")]
    MissingDescriptor(i32),
    #[error("Argument contains an interior NUL byte: {0:?}")]
    InvalidArgument(String),
    #[error("Error in `execve` of `{1}`: `{0}`")]
    Exec(#[source] std::io::Error, String),
    #[error("Error parsing `/proc/self/maps`: `{0}`")]
    ProcfsParse(#[source] procfs::ProcError),
    #[error("No memory mapping matches `{0}`")]
    MappingNotFound(String),
    #[error("Filesystem error for path {1:?}: `{0}`")]
    Filesystem(#[source] std::io::Error, PathBuf),
    #[error("Error parsing elf file {1:?}: `{0}`")]
    ElfParse(#[source] elf::ParseError, PathBuf),
    #[error("Elf file {0:?} has no loadable segment at file offset 0")]
    ElfNoLoadBias(PathBuf),
    #[error("Symbols not found in mapped image: {0:?}")]
    UnresolvedSymbols(Vec<String>),
    #[error("Error changing protection of {1:#x}: `{0}`")]
    Protect(#[source] std::io::Error, usize),
}

impl Error {
    /// Exit status the launcher reports when it fails with this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Exec(..) => 2,
            Error::MissingDescriptor(_) => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
