//! Duplex, message-framed channel shared by the supervisor and one worker.
//!
//! Frames are length-delimited (4-byte big-endian prefix) and each frame
//! carries the literal of one [`Token`]. Across a process boundary the
//! channel is a pair of anonymous pipes; the worker finds them at
//! [`CHANNEL_READ_FD`] and [`CHANNEL_WRITE_FD`].

use std::fmt;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::unix::pipe;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::ChannelError;

/// Worker-side descriptor for reading supervisor frames.
pub const CHANNEL_READ_FD: RawFd = 3;
/// Worker-side descriptor for writing frames to the supervisor.
pub const CHANNEL_WRITE_FD: RawFd = 4;

const MAX_FRAME_LEN: usize = 64 * 1024;

/// Control messages exchanged between supervisor and worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// Worker → supervisor: the service is accepting on its listeners.
    ReadyOk,
    /// Worker → supervisor: the service failed to start.
    ReadyError,
    /// Supervisor → worker: stop serving and exit.
    ExitRequest,
    /// Worker → supervisor: acknowledgement of `ExitRequest`.
    ExitReply,
}

impl Token {
    pub const fn as_str(self) -> &'static str {
        match self {
            Token::ReadyOk => "ReadyOK",
            Token::ReadyError => "ReadyError",
            Token::ExitRequest => "ExitRequest",
            Token::ExitReply => "ExitReply",
        }
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        match raw {
            b"ReadyOK" => Some(Token::ReadyOk),
            b"ReadyError" => Some(Token::ReadyError),
            b"ExitRequest" => Some(Token::ExitRequest),
            b"ExitReply" => Some(Token::ExitReply),
            _ => None,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a [`Channel::read`] loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    /// The callback asked to stop.
    Stopped,
    /// The peer closed its end.
    Closed,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Channel {
    reader: FramedRead<BoxedReader, LengthDelimitedCodec>,
    writer: FramedWrite<BoxedWriter, LengthDelimitedCodec>,
}

impl Channel {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: FramedRead::new(Box::new(reader) as BoxedReader, codec()),
            writer: FramedWrite::new(Box::new(writer) as BoxedWriter, codec()),
        }
    }

    /// Wraps the parent's ends of two anonymous pipes.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn from_pipes(read: OwnedFd, write: OwnedFd) -> io::Result<Self> {
        let reader = pipe::Receiver::from_owned_fd(read)?;
        let writer = pipe::Sender::from_owned_fd(write)?;
        Ok(Self::new(reader, writer))
    }

    /// Opens the channel a worker inherited from its supervisor.
    pub fn inherited() -> Result<Self, ChannelError> {
        for fd in [CHANNEL_READ_FD, CHANNEL_WRITE_FD] {
            if !is_fifo(fd) {
                return Err(ChannelError::NotAPipe { fd });
            }
        }
        // SAFETY: both descriptors were verified open pipes above, and the
        // supervisor placed them here for this process alone.
        let (read, write) = unsafe {
            (
                OwnedFd::from_raw_fd(CHANNEL_READ_FD),
                OwnedFd::from_raw_fd(CHANNEL_WRITE_FD),
            )
        };
        Ok(Self::from_pipes(read, write)?)
    }

    pub async fn send(&mut self, token: Token) -> Result<(), ChannelError> {
        debug!("channel send {token}");
        self.writer
            .send(Bytes::from_static(token.as_str().as_bytes()))
            .await?;
        Ok(())
    }

    /// Feeds every incoming token to `on_token` until it returns `false` or
    /// the peer closes. Frames that are not tokens are skipped.
    pub async fn read<F>(&mut self, mut on_token: F) -> Result<ReadEnd, ChannelError>
    where
        F: FnMut(Token) -> bool,
    {
        while let Some(frame) = self.reader.next().await {
            let frame = frame?;
            match Token::from_bytes(&frame) {
                Some(token) => {
                    debug!("channel recv {token}");
                    if !on_token(token) {
                        return Ok(ReadEnd::Stopped);
                    }
                }
                None => warn!("ignoring unrecognised {}-byte frame", frame.len()),
            }
        }
        Ok(ReadEnd::Closed)
    }

    /// Two connected in-memory channels.
    #[cfg(test)]
    pub(crate) fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(MAX_FRAME_LEN);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (Self::new(a_read, a_write), Self::new(b_read, b_write))
    }

    #[cfg(test)]
    pub(crate) async fn send_raw(&mut self, frame: &'static [u8]) -> Result<(), ChannelError> {
        self.writer.send(Bytes::from_static(frame)).await?;
        Ok(())
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Creates an anonymous pipe with both ends close-on-exec.
pub(crate) fn os_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        // SAFETY: `fds` has room for the two descriptors pipe2(2) writes.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2(2) succeeded; both descriptors are open and unowned.
        Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe(2) succeeded; both descriptors are open and unowned.
        let (read, write) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_cloexec(&read)?;
        set_cloexec(&write)?;
        Ok((read, write))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let raw = fd.as_raw_fd();
    // SAFETY: fcntl on a descriptor we own; no pointers involved.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
    if flags < 0 || unsafe { libc::fcntl(raw, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn is_fifo(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFIFO
}
