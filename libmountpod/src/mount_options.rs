//! Mount option handoff between the driver and a mount pod.
//!
//! The driver opens the FUSE device and performs the kernel mount itself,
//! then hands the open device file descriptor plus the mount arguments to
//! the mount pod over a Unix domain socket in the shared communication
//! directory. The descriptor travels as `SCM_RIGHTS` ancillary data; the
//! options travel as a length-prefixed JSON message alongside it.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::Error;

/// Everything a mount pod needs to run its mount process, except the FUSE
/// device descriptor, which rides along as ancillary data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    /// Bucket the mount serves.
    pub bucket_name: String,
    /// Command-line arguments for the mount process.
    pub args: Vec<String>,
    /// Environment assignments in `KEY=value` form.
    pub env: Vec<String>,
}

/// Connect to the socket the mount pod listens on and send `options`
/// together with the open FUSE device `fd`.
///
/// The mount pod binds the socket on its own schedule; connection attempts
/// are retried until `deadline` elapses.
#[instrument(skip(options, fd), fields(path = %sock_path.display()))]
pub async fn send(
    sock_path: &Path,
    fd: RawFd,
    options: &MountOptions,
    deadline: Duration,
) -> Result<(), Error> {
    let payload = encode(sock_path, options)?;

    let stream = tokio::time::timeout(deadline, connect_with_retry(sock_path))
        .await
        .map_err(|_| ipc_err(sock_path, "timed out waiting for the mount socket"))??;
    let stream = stream.into_std().map_err(|e| ipc_err(sock_path, e))?;
    stream
        .set_nonblocking(false)
        .map_err(|e| ipc_err(sock_path, e))?;

    let sock_path = sock_path.to_owned();
    tokio::task::spawn_blocking(move || send_blocking(&sock_path, stream, fd, &payload))
        .await
        .map_err(Error::internal)?
}

/// Listen on `sock_path`, accept one connection, and receive the mount
/// options and the FUSE device descriptor.
#[instrument(fields(path = %sock_path.display()))]
pub async fn recv(sock_path: &Path) -> Result<(MountOptions, OwnedFd), Error> {
    let sock_path = sock_path.to_owned();

    tokio::task::spawn_blocking(move || recv_blocking(&sock_path))
        .await
        .map_err(Error::internal)?
}

fn encode(sock_path: &Path, options: &MountOptions) -> Result<Vec<u8>, Error> {
    let body = serde_json::to_vec(options).map_err(|e| ipc_err(sock_path, e))?;
    let mut payload = Vec::with_capacity(4 + body.len());
    payload.extend_from_slice(&(body.len() as u32).to_le_bytes());
    payload.extend_from_slice(&body);
    Ok(payload)
}

fn send_blocking(
    sock_path: &PathBuf,
    mut stream: UnixStream,
    fd: RawFd,
    payload: &[u8],
) -> Result<(), Error> {
    use std::io::Write;

    // The descriptor must accompany actual data, so attach it to the first
    // byte and write the rest normally.
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let iov = [std::io::IoSlice::new(&payload[..1])];
    sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(|e| ipc_err(sock_path, e))?;

    stream
        .write_all(&payload[1..])
        .map_err(|e| ipc_err(sock_path, e))?;
    Ok(())
}

async fn connect_with_retry(sock_path: &Path) -> Result<tokio::net::UnixStream, Error> {
    const RETRY_INTERVAL: Duration = Duration::from_millis(100);

    loop {
        match tokio::net::UnixStream::connect(sock_path).await {
            Ok(stream) => return Ok(stream),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                ) =>
            {
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => return Err(ipc_err(sock_path, e)),
        }
    }
}

fn recv_blocking(sock_path: &PathBuf) -> Result<(MountOptions, OwnedFd), Error> {
    use std::io::Read;

    let listener = UnixListener::bind(sock_path).map_err(|e| ipc_err(sock_path, e))?;
    let (mut stream, _) = listener.accept().map_err(|e| ipc_err(sock_path, e))?;

    let mut first = [0u8; 1];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    let fd = {
        let mut iov = [std::io::IoSliceMut::new(&mut first)];
        let msg = recvmsg::<UnixAddr>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )
        .map_err(|e| ipc_err(sock_path, e))?;

        let mut received = None;
        for cmsg in msg.cmsgs().map_err(|e| ipc_err(sock_path, e))? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                received = fds.first().copied();
            }
        }
        let raw =
            received.ok_or_else(|| ipc_err(sock_path, "no file descriptor in message"))?;
        // The kernel installed the descriptor into this process; take
        // ownership of it.
        unsafe { OwnedFd::from_raw_fd(raw) }
    };

    let mut len_rest = [0u8; 3];
    stream
        .read_exact(&mut len_rest)
        .map_err(|e| ipc_err(sock_path, e))?;
    let len_bytes = [first[0], len_rest[0], len_rest[1], len_rest[2]];
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .map_err(|e| ipc_err(sock_path, e))?;

    let options = serde_json::from_slice(&body).map_err(|e| ipc_err(sock_path, e))?;
    Ok((options, fd))
}

fn ipc_err(path: &Path, reason: impl std::fmt::Display) -> Error {
    Error::Ipc {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::IntoRawFd;

    #[tokio::test]
    async fn options_and_descriptor_cross_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("mount.sock");

        let options = MountOptions {
            bucket_name: "test-bucket".to_owned(),
            args: vec!["--read-only".to_owned(), "--allow-other".to_owned()],
            env: vec!["AWS_REGION=eu-west-1".to_owned()],
        };

        let receiver = tokio::spawn({
            let sock = sock.clone();
            async move { recv(&sock).await }
        });

        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let raw = write_end.into_raw_fd();
        send(&sock, raw, &options, Duration::from_secs(5))
            .await
            .unwrap();
        drop(unsafe { OwnedFd::from_raw_fd(raw) });

        let (got, fd) = receiver.await.unwrap().unwrap();
        assert_eq!(got, options);

        // The received descriptor is a live duplicate: writing through it
        // is visible on the pipe's read end.
        let mut writer = std::fs::File::from(fd);
        writer.write_all(b"ping").unwrap();
        drop(writer);

        let mut reader = std::fs::File::from(read_end);
        let mut buf = String::new();
        reader.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "ping");
    }

    #[tokio::test]
    async fn send_gives_up_when_no_listener_appears() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("mount.sock");

        let (_read_end, write_end) = nix::unistd::pipe().unwrap();
        let started = std::time::Instant::now();
        let err = send(
            &sock,
            write_end.as_raw_fd(),
            &MountOptions::default(),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Ipc { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
