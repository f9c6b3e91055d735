//! SCM_RIGHTS stdio adoption.
//!
//! `attachio` hands the client's real stdin/stdout/stderr to the worker as
//! ancillary data on the connection socket. Everything descriptor-level
//! lives here: receiving the rights message, installing the descriptors
//! over 0/1/2, and duplicating the installed trio for the [`crate::ui`]
//! sinks.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{ControlMessageOwned, MsgFlags, recvmsg};
use nix::unistd::{dup, dup2};

/// Receive one rights message carrying up to three descriptors beside its
/// one-byte payload. Zero descriptors is a valid answer; anything past
/// three is closed on arrival.
pub fn receive_fds(stream: &UnixStream) -> io::Result<Vec<OwnedFd>> {
    loop {
        match recv_fds_once(stream.as_raw_fd()) {
            Err(Errno::EINTR) => continue,
            other => return other.map_err(io::Error::from),
        }
    }
}

#[allow(unsafe_code)]
fn recv_fds_once(fd: RawFd) -> nix::Result<Vec<OwnedFd>> {
    let mut byte = [0u8; 1];
    let mut iov = [io::IoSliceMut::new(&mut byte)];
    let mut space = cmsg_space!([RawFd; 3]);
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut space), MsgFlags::empty())?;
    let mut fds = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for raw in received {
                // SAFETY: the kernel installed these descriptors for this
                // process just now; nothing else owns them
                fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }
    fds.truncate(3);
    Ok(fds)
}

/// Install received descriptors over stdin/stdout/stderr in arrival order.
/// A short list leaves the remaining slots as they are.
pub fn install(fds: &[OwnedFd]) -> io::Result<()> {
    for (fd, target) in fds.iter().zip(0..3) {
        dup2(fd.as_raw_fd(), target)?;
    }
    Ok(())
}

/// Fresh duplicates of the current stdio trio, taken after every install
/// so the sinks never point at descriptors a later attach replaced.
pub fn stdio_files() -> io::Result<(File, File, File)> {
    Ok((dup_file(0)?, dup_file(1)?, dup_file(2)?))
}

#[allow(unsafe_code)]
fn dup_file(fd: RawFd) -> io::Result<File> {
    let copy = dup(fd)?;
    // SAFETY: copy is a fresh descriptor with no other owner
    Ok(unsafe { File::from_raw_fd(copy) })
}
