//! Launcher side of the wrapper: fetches the real compiler and the hook library from the
//! supervisor, then replaces itself with the dynamic linker running the compiler.
//!
//! # Protocol
//!
//! For each resource, a new stream connection is made to an abstract unix socket. The client
//! writes a native-endian `i32` request code. The supervisor answers with one message carrying a
//! single descriptor in `SCM_RIGHTS` ancillary data, followed by an `i32` status, and the
//! connection is closed.

use std::convert::Infallible;
use std::ffi::{CString, OsStr, OsString};
use std::io::{Read, Write};
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, UnixAddr};
use tracing::{debug, error, info, info_span, warn};

use crate::{lp_select, Error, Result, INJECTED_FLAG};

/// Abstract-namespace name of the supervisor's rendezvous socket.
pub const SOCKET_NAME: &str = "5291374ceda0aef7c5d86cd2a4f6a3ac";

/// Dynamic linker used to run the compiler.
pub const LINKER_PATH: &str = lp_select!(
    "/apex/com.android.runtime/bin/linker",
    "/apex/com.android.runtime/bin/linker64"
);

const IS_64BIT: bool = cfg!(target_pointer_width = "64");

/// Resources the launcher asks the supervisor for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Request {
    /// The real compiler binary. `debug` selects the `dex2oatd` variant.
    Compiler { is_64bit: bool, debug: bool },
    /// The hook library matching the launcher's bitness.
    HookLibrary { is_64bit: bool },
}

impl Request {
    /// Compiler request for a launcher started as `argv0`.
    pub fn compiler(argv0: &OsStr) -> Self {
        let debug = argv0
            .as_bytes()
            .windows(b"dex2oatd".len())
            .any(|window| window == b"dex2oatd");
        Request::Compiler {
            is_64bit: IS_64BIT,
            debug,
        }
    }

    pub fn hook_library() -> Self {
        Request::HookLibrary { is_64bit: IS_64BIT }
    }

    /// Code sent on the wire.
    pub fn code(&self) -> i32 {
        match *self {
            Request::Compiler { is_64bit, debug } => ((is_64bit as i32) << 1) | debug as i32,
            Request::HookLibrary { is_64bit } => {
                if is_64bit {
                    5
                } else {
                    4
                }
            }
        }
    }
}

/// Connects to the abstract unix socket `name`.
fn connect_abstract(name: &str) -> Result<UnixStream> {
    let to_error = |errno: Errno| Error::Connect(errno.into(), name.to_owned());
    let sock = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(to_error)?;
    let addr = UnixAddr::new_abstract(name.as_bytes()).map_err(to_error)?;
    connect(sock.as_raw_fd(), &addr).map_err(to_error)?;
    Ok(UnixStream::from(sock))
}

/// Runs one request/response exchange with the supervisor listening on `socket_name`.
///
/// Returns `Ok(None)` if the supervisor answered without a well-formed descriptor.
pub fn request_descriptor(socket_name: &str, request: Request) -> Result<Option<OwnedFd>> {
    let code = request.code();
    let _log_guard = info_span!("request", code).entered();

    let mut stream = connect_abstract(socket_name)?;
    stream
        .write_all(&code.to_ne_bytes())
        .map_err(|err| Error::Transport(err, code))?;
    let fd = recv_fd(&stream).map_err(|err| Error::Transport(err, code))?;

    let mut status = [0u8; size_of::<i32>()];
    match stream.read_exact(&mut status) {
        Ok(()) => debug!(status = i32::from_ne_bytes(status), "supervisor status"),
        Err(err) => debug!(%err, "no status after descriptor"),
    }

    Ok(fd)
}

/// Control buffer aligned for `cmsghdr`.
#[repr(C, align(8))]
struct ControlBuffer([u8; 64]);

/// Receives exactly one descriptor passed with `SCM_RIGHTS`.
///
/// Anything other than a single control message of the exact size produced for one descriptor
/// yields `Ok(None)`. Descriptors carried by such a message are closed.
pub fn recv_fd(sock: &impl AsRawFd) -> std::io::Result<Option<OwnedFd>> {
    let mut data: libc::c_int = 0;
    let mut iov = libc::iovec {
        iov_base: (&mut data as *mut libc::c_int).cast(),
        iov_len: size_of::<libc::c_int>(),
    };
    // SAFETY: Pure size computation.
    let control_space = unsafe { libc::CMSG_SPACE(size_of::<libc::c_int>() as _) } as usize;
    let mut control = ControlBuffer([0; 64]);

    // SAFETY: An all-zero `msghdr` is a valid empty message header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr().cast();
    msg.msg_controllen = control_space as _;

    // Loop to handle `EINTR`.
    loop {
        // SAFETY: `msg` points to `iov` and `control`, which outlive the call and are at least as
        // large as announced in `msg`.
        let res = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, libc::MSG_WAITALL) };
        if res != -1 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }

    // SAFETY: `msg` was filled in by `recvmsg`, and its control pointer is still valid.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        let well_formed = msg.msg_controllen as usize == control_space
            && msg.msg_flags & libc::MSG_CTRUNC == 0
            && !cmsg.is_null()
            && (*cmsg).cmsg_len as usize
                == libc::CMSG_LEN(size_of::<libc::c_int>() as _) as usize
            && (*cmsg).cmsg_level == libc::SOL_SOCKET
            && (*cmsg).cmsg_type == libc::SCM_RIGHTS;
        if !well_formed {
            warn!(
                controllen = msg.msg_controllen as usize,
                flags = msg.msg_flags,
                "rejecting malformed descriptor message"
            );
            close_received_rights(&msg);
            return Ok(None);
        }

        let fd = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int);
        Ok(Some(OwnedFd::from_raw_fd(fd)))
    }
}

/// Closes every descriptor carried in the `SCM_RIGHTS` messages of `msg`.
///
/// # Safety
///
/// `msg` must have been filled in by `recvmsg`, and its control buffer must still be valid.
unsafe fn close_received_rights(msg: &libc::msghdr) {
    let control_end = (msg.msg_control as usize).saturating_add(msg.msg_controllen as usize);
    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
            let data = libc::CMSG_DATA(cmsg);
            let data_len = ((*cmsg).cmsg_len as usize)
                .saturating_sub(libc::CMSG_LEN(0) as usize)
                .min(control_end.saturating_sub(data as usize));
            for i in 0..data_len / size_of::<libc::c_int>() {
                let fd = std::ptr::read_unaligned((data as *const libc::c_int).add(i));
                libc::close(fd);
            }
        }
        cmsg = libc::CMSG_NXTHDR(msg, cmsg);
    }
}

/// Program, arguments and environment of the compiler run through the dynamic linker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecPlan {
    pub program: CString,
    pub argv: Vec<CString>,
    pub envp: Vec<CString>,
}

impl ExecPlan {
    /// Builds the plan from the launcher's own arguments and environment.
    ///
    /// The compiler is passed to the linker as `/proc/self/fd/<compiler_fd>`, and the hook library
    /// is preloaded from `/proc/<pid>/fd/<hook_fd>`. `LD_LIBRARY_PATH` is dropped so that the
    /// linker uses its own configuration.
    pub fn new(
        args: impl IntoIterator<Item = OsString>,
        compiler_fd: RawFd,
        hook_fd: Option<RawFd>,
        pid: u32,
        env: impl IntoIterator<Item = (OsString, OsString)>,
    ) -> Result<Self> {
        let program = cstring(LINKER_PATH)?;

        let mut argv = vec![
            program.clone(),
            cstring(format!("/proc/self/fd/{compiler_fd}"))?,
        ];
        for arg in args.into_iter().skip(1) {
            argv.push(cstring(arg.as_bytes())?);
        }
        argv.push(cstring(INJECTED_FLAG)?);

        let mut envp = Vec::new();
        for (key, value) in env {
            if key == "LD_LIBRARY_PATH" || (key == "LD_PRELOAD" && hook_fd.is_some()) {
                continue;
            }
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            envp.push(cstring(entry)?);
        }
        if let Some(hook_fd) = hook_fd {
            envp.push(cstring(format!("LD_PRELOAD=/proc/{pid}/fd/{hook_fd}"))?);
        }

        Ok(ExecPlan {
            program,
            argv,
            envp,
        })
    }

    /// Replaces the current process image. Only returns on failure.
    pub fn exec(&self) -> Error {
        match nix::unistd::execve(&self.program, &self.argv, &self.envp) {
            Ok(never) => match never {},
            Err(errno) => Error::Exec(errno.into(), LINKER_PATH.to_owned()),
        }
    }
}

fn cstring(bytes: impl Into<Vec<u8>>) -> Result<CString> {
    CString::new(bytes).map_err(|err| {
        Error::InvalidArgument(String::from_utf8_lossy(&err.into_vec()).into_owned())
    })
}

/// Runs the launcher against the supervisor at `socket_name`. Only returns on failure.
///
/// Failing to obtain the compiler is fatal. Failing to obtain the hook library only disables
/// interception.
pub fn run(socket_name: &str, args: Vec<OsString>) -> Result<Infallible> {
    let argv0 = args.first().cloned().unwrap_or_default();
    info!(ppid = nix::unistd::getppid().as_raw(), "dex2oat wrapper started");

    let compiler = Request::compiler(&argv0);
    let compiler_fd = request_descriptor(socket_name, compiler)?
        .ok_or(Error::MissingDescriptor(compiler.code()))?;

    let hook_fd = match request_descriptor(socket_name, Request::hook_library()) {
        Ok(Some(fd)) => Some(fd),
        Ok(None) => {
            error!("supervisor sent no hook library, running without interception");
            None
        }
        Err(err) => {
            error!(%err, "failed to fetch hook library, running without interception");
            None
        }
    };

    let plan = ExecPlan::new(
        args,
        compiler_fd.as_raw_fd(),
        hook_fd.as_ref().map(AsRawFd::as_raw_fd),
        std::process::id(),
        std::env::vars_os(),
    )?;
    info!(
        linker = LINKER_PATH,
        compiler_fd = compiler_fd.as_raw_fd(),
        hook_fd = hook_fd.as_ref().map(AsRawFd::as_raw_fd),
        "executing compiler via linker"
    );
    Err(plan.exec())
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::IoSlice;
    use std::os::unix::fs::MetadataExt;

    use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};

    use super::*;

    fn send_fds(sock: &UnixStream, fds: &[RawFd]) {
        let payload = 0i32.to_ne_bytes();
        let iov = [IoSlice::new(&payload)];
        let cmsgs = [ControlMessage::ScmRights(fds)];
        sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None).unwrap();
    }

    fn inode_of(fd: &OwnedFd) -> u64 {
        File::from(fd.try_clone().unwrap()).metadata().unwrap().ino()
    }

    #[test]
    fn request_codes() {
        let compiler = Request::compiler(OsStr::new("/apex/com.android.art/bin/dex2oat64"));
        assert_eq!(compiler.code(), (IS_64BIT as i32) << 1);
        let debug = Request::compiler(OsStr::new("/apex/com.android.art/bin/dex2oatd64"));
        assert_eq!(debug.code(), ((IS_64BIT as i32) << 1) | 1);
        assert_eq!(Request::Compiler { is_64bit: true, debug: true }.code(), 3);
        assert_eq!(Request::HookLibrary { is_64bit: false }.code(), 4);
        assert_eq!(Request::HookLibrary { is_64bit: true }.code(), 5);
    }

    #[test]
    fn single_descriptor_is_received() {
        let (client, server) = UnixStream::pair().unwrap();
        let file = OwnedFd::from(File::open("/proc/self/exe").unwrap());
        send_fds(&server, &[file.as_raw_fd()]);

        let received = recv_fd(&client).unwrap().expect("descriptor");
        assert_ne!(received.as_raw_fd(), file.as_raw_fd());
        assert_eq!(inode_of(&received), inode_of(&file));
    }

    #[test]
    fn two_descriptors_are_rejected() {
        let (client, server) = UnixStream::pair().unwrap();
        let file = File::open("/proc/self/exe").unwrap();
        send_fds(&server, &[file.as_raw_fd(), file.as_raw_fd()]);

        assert!(recv_fd(&client).unwrap().is_none());
    }

    #[test]
    fn plain_data_is_rejected() {
        let (client, mut server) = UnixStream::pair().unwrap();
        server.write_all(&7i32.to_ne_bytes()).unwrap();

        assert!(recv_fd(&client).unwrap().is_none());
    }

    #[test]
    fn exec_plan_runs_compiler_through_linker() {
        let args = ["/apex/com.android.art/bin/dex2oat64", "--dex-file=a.apk", "--oat-fd=9"]
            .map(OsString::from);
        let env = [
            ("PATH", "/system/bin"),
            ("LD_LIBRARY_PATH", "/data/local/tmp"),
            ("LD_PRELOAD", "libstale.so"),
        ]
        .map(|(k, v)| (OsString::from(k), OsString::from(v)));

        let plan = ExecPlan::new(args, 7, Some(8), 1234, env).unwrap();

        assert_eq!(plan.program.to_bytes(), LINKER_PATH.as_bytes());
        let argv: Vec<&[u8]> = plan.argv.iter().map(|arg| arg.to_bytes()).collect();
        assert_eq!(
            argv,
            [
                LINKER_PATH.as_bytes(),
                &b"/proc/self/fd/7"[..],
                &b"--dex-file=a.apk"[..],
                &b"--oat-fd=9"[..],
                INJECTED_FLAG.as_bytes(),
            ]
        );
        let envp: Vec<&[u8]> = plan.envp.iter().map(|entry| entry.to_bytes()).collect();
        assert_eq!(
            envp,
            [&b"PATH=/system/bin"[..], &b"LD_PRELOAD=/proc/1234/fd/8"[..]]
        );
    }

    #[test]
    fn exec_plan_without_hook_keeps_preload() {
        let env =
            [("LD_PRELOAD", "libother.so")].map(|(k, v)| (OsString::from(k), OsString::from(v)));
        let plan = ExecPlan::new([OsString::from("dex2oat")], 3, None, 1, env).unwrap();
        assert_eq!(plan.argv.len(), 3);
        assert_eq!(plan.envp, [CString::new("LD_PRELOAD=libother.so").unwrap()]);
    }

    #[test]
    fn missing_descriptor_exit_code() {
        assert_eq!(Error::MissingDescriptor(2).exit_code(), 3);
        assert_eq!(
            Error::Exec(std::io::Error::from_raw_os_error(libc::ENOENT), LINKER_PATH.into())
                .exit_code(),
            2
        );
    }
}
