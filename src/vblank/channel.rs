//! Delivery of wake notifications from the predictor to the compositor.
//!
//! Delivery is fire-and-forget: a notification that cannot be written right
//! away is dropped, and the next cycle tries again.

use std::{io, sync::mpsc};

use crate::time::Nanoseconds;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("The notification channel is full.")]
    Full,
    #[error("The notification channel has been closed.")]
    Closed,
    #[error("Only {0} of 8 bytes of the notification were written.")]
    Truncated(usize),
    #[error("Writing the notification failed: {0}")]
    Io(#[from] io::Error),
}

/// Where the predictor delivers one wake timestamp per cycle.
///
/// Implementations must not block.
pub trait VblankSink: Send + 'static {
    fn notify(&mut self, wake_time: Nanoseconds) -> Result<(), NotifyError>;
}

impl VblankSink for mpsc::SyncSender<Nanoseconds> {
    fn notify(&mut self, wake_time: Nanoseconds) -> Result<(), NotifyError> {
        self.try_send(wake_time).map_err(|e| match e {
            mpsc::TrySendError::Full(_) => NotifyError::Full,
            mpsc::TrySendError::Disconnected(_) => NotifyError::Closed,
        })
    }
}

#[cfg(unix)]
pub use self::unix::{channel, VblankReceiver, VblankWriter};

#[cfg(unix)]
mod unix {
    use std::{
        io,
        os::{
            fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
            unix::net::UnixDatagram,
        },
    };

    use super::{NotifyError, VblankSink};
    use crate::time::Nanoseconds;

    const MESSAGE_SIZE: usize = std::mem::size_of::<i64>();

    /// Creates a non-blocking datagram pair. Each datagram carries exactly one
    /// native-endian nanosecond timestamp.
    pub fn channel() -> io::Result<(VblankWriter, VblankReceiver)> {
        let (writer, reader) = UnixDatagram::pair()?;
        writer.set_nonblocking(true)?;
        reader.set_nonblocking(true)?;

        Ok((VblankWriter { socket: writer }, VblankReceiver { socket: reader }))
    }

    #[derive(Debug)]
    pub struct VblankWriter {
        socket: UnixDatagram,
    }

    impl VblankSink for VblankWriter {
        fn notify(&mut self, wake_time: Nanoseconds) -> Result<(), NotifyError> {
            match self.socket.send(&wake_time.to_ne_bytes()) {
                Ok(MESSAGE_SIZE) => Ok(()),
                Ok(written) => Err(NotifyError::Truncated(written)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(NotifyError::Full),
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    Err(NotifyError::Closed)
                }
                Err(e) => Err(e.into()),
            }
        }
    }

    /// The compositor's end of the notification channel.
    ///
    /// Register the file descriptor with an event loop and call
    /// [`VblankReceiver::try_recv`] until it returns `Ok(None)` whenever it
    /// becomes readable.
    #[derive(Debug)]
    pub struct VblankReceiver {
        socket: UnixDatagram,
    }

    impl VblankReceiver {
        /// Reads the next pending wake timestamp, if any.
        pub fn try_recv(&self) -> io::Result<Option<Nanoseconds>> {
            let mut buffer = [0u8; MESSAGE_SIZE];

            match self.socket.recv(&mut buffer) {
                Ok(MESSAGE_SIZE) => Ok(Some(Nanoseconds::from_ne_bytes(buffer))),
                Ok(read) => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("short vblank notification ({read} bytes)"),
                )),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            }
        }

        /// Discards every pending notification and returns the newest.
        pub fn latest(&self) -> io::Result<Option<Nanoseconds>> {
            let mut latest = None;
            while let Some(time) = self.try_recv()? {
                latest = Some(time);
            }
            Ok(latest)
        }
    }

    impl AsFd for VblankReceiver {
        fn as_fd(&self) -> BorrowedFd<'_> {
            self.socket.as_fd()
        }
    }

    impl AsRawFd for VblankReceiver {
        fn as_raw_fd(&self) -> RawFd {
            self.socket.as_raw_fd()
        }
    }
}
