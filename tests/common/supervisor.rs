use std::fs::File;
use std::io::{IoSlice, Read, Write};
use std::os::fd::AsRawFd;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};

/// Answer of the fake supervisor to one connection.
pub enum Reply {
    /// Sends the descriptor of the file, then a status.
    Descriptor(File),
    /// Sends a status without any ancillary data.
    Nothing,
}

/// Listens on a fresh abstract socket and answers one connection per reply, in order. Returns the
/// socket name and a handle yielding the request codes received.
pub fn spawn_supervisor(replies: Vec<Reply>) -> (String, JoinHandle<Vec<i32>>) {
    static NEXT_ID: AtomicUsize = AtomicUsize::new(0);
    let name = format!(
        "dex2oat-wrapper-test-{}-{}",
        std::process::id(),
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    );
    let addr = SocketAddr::from_abstract_name(name.as_bytes()).unwrap();
    let listener = UnixListener::bind_addr(&addr).unwrap();

    let handle = thread::spawn(move || {
        let mut codes = Vec::new();
        for reply in replies {
            let (mut stream, _) = listener.accept().unwrap();
            let mut code = [0u8; 4];
            stream.read_exact(&mut code).unwrap();
            codes.push(i32::from_ne_bytes(code));

            let status = 0i32.to_ne_bytes();
            match reply {
                Reply::Descriptor(file) => {
                    let fds = [file.as_raw_fd()];
                    let iov = [IoSlice::new(&status)];
                    let cmsgs = [ControlMessage::ScmRights(&fds)];
                    sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                        .unwrap();
                }
                Reply::Nothing => stream.write_all(&status).unwrap(),
            }
            stream.write_all(&status).ok();
        }
        codes
    });
    (name, handle)
}
