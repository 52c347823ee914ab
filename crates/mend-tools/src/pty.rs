//! Pseudo-terminal support for the shell tool.
//!
//! Opens a master/slave pair through `/dev/ptmx`. The child is started in
//! a new session with the slave as its controlling terminal; a reader
//! drains the master with per-read poll deadlines so a closed PTY never
//! blocks forever.

#[cfg(target_os = "linux")]
pub use linux::Pty;

/// Whether PTY execution is available on this platform.
pub fn is_supported() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/dev/ptmx").exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::{File, OpenOptions};
    use std::io::Read;
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::OpenOptionsExt;
    use std::time::Instant;

    use mend_core::{MendError, Result};

    /// Per-read deadline while draining the master.
    const READ_TIMEOUT_MS: i32 = 500;
    const READ_BUF_SIZE: usize = 4096;

    pub struct Pty {
        master: File,
        slave: Option<File>,
    }

    impl Pty {
        /// Open a new master/slave pair.
        pub fn open() -> Result<Self> {
            let master = OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/ptmx")
                .map_err(|e| MendError::Tool(format!("failed to open PTY master: {e}")))?;

            // Unlock the slave, then resolve its device name.
            let mut unlock: libc::c_int = 0;
            ioctl(master.as_raw_fd(), libc::TIOCSPTLCK, &mut unlock as *mut _ as usize)
                .map_err(|e| MendError::Tool(format!("failed to unlock PTY slave: {e}")))?;
            let mut num: libc::c_uint = 0;
            ioctl(master.as_raw_fd(), libc::TIOCGPTN, &mut num as *mut _ as usize)
                .map_err(|e| MendError::Tool(format!("failed to get PTY slave name: {e}")))?;

            let slave = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NOCTTY)
                .open(format!("/dev/pts/{num}"))
                .map_err(|e| MendError::Tool(format!("failed to open PTY slave: {e}")))?;

            Ok(Self {
                master,
                slave: Some(slave),
            })
        }

        /// Set the terminal window size.
        pub fn set_winsize(&self, rows: u16, cols: u16) -> Result<()> {
            let ws = libc::winsize {
                ws_row: rows,
                ws_col: cols,
                ws_xpixel: 0,
                ws_ypixel: 0,
            };
            ioctl(
                self.master.as_raw_fd(),
                libc::TIOCSWINSZ,
                &ws as *const _ as usize,
            )
            .map_err(|e| MendError::Tool(format!("failed to set PTY window size: {e}")))
        }

        /// Duplicate the slave for use as a child stdio handle.
        pub fn slave_stdio(&self) -> Result<File> {
            self.slave
                .as_ref()
                .ok_or_else(|| MendError::Tool("PTY slave already closed".to_string()))?
                .try_clone()
                .map_err(MendError::Io)
        }

        /// Close the parent's slave handle. Once the child exits too, the
        /// master read loop observes hangup and terminates.
        pub fn close_slave(&mut self) {
            self.slave = None;
        }

        /// Drain the master into `out` until hangup or `deadline`.
        ///
        /// Each read waits at most [`READ_TIMEOUT_MS`] so the loop stays
        /// responsive to the overall deadline even when the child is
        /// silent. Intended to run on a blocking thread.
        pub fn copy_output(&mut self, out: &mut Vec<u8>, deadline: Option<Instant>) {
            let fd = self.master.as_raw_fd();
            let mut buf = [0u8; READ_BUF_SIZE];
            loop {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return;
                    }
                }
                let mut pollfd = libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                };
                let n = unsafe { libc::poll(&mut pollfd, 1, READ_TIMEOUT_MS) };
                if n < 0 {
                    return;
                }
                if n == 0 {
                    // Read deadline elapsed with no data; try again.
                    continue;
                }
                if pollfd.revents & libc::POLLIN != 0 {
                    match self.master.read(&mut buf) {
                        Ok(0) => return,
                        Ok(n) => out.extend_from_slice(&buf[..n]),
                        // EIO means the slave side hung up.
                        Err(_) => return,
                    }
                } else if pollfd.revents & (libc::POLLHUP | libc::POLLERR) != 0 {
                    return;
                }
            }
        }
    }

    fn ioctl(fd: i32, request: libc::c_ulong, arg: usize) -> std::io::Result<()> {
        let r = unsafe { libc::ioctl(fd, request, arg) };
        if r != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

}
