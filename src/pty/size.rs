//! Window size management for PTY

use std::os::unix::io::RawFd;

use nix::errno::Errno;

/// Rows used when a caller asks for zero rows
pub const DEFAULT_ROWS: u16 = 24;
/// Columns used when a caller asks for zero columns
pub const DEFAULT_COLS: u16 = 80;

/// Window size in rows, columns, and pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    /// Number of rows (lines)
    pub rows: u16,
    /// Number of columns (characters per line)
    pub cols: u16,
    /// Width in pixels (optional, can be 0)
    pub pixel_width: u16,
    /// Height in pixels (optional, can be 0)
    pub pixel_height: u16,
}

impl WindowSize {
    /// Create a new window size
    pub fn new(rows: u16, cols: u16) -> Self {
        WindowSize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Create a new window size with pixel dimensions
    pub fn with_pixels(rows: u16, cols: u16, pixel_width: u16, pixel_height: u16) -> Self {
        WindowSize {
            rows,
            cols,
            pixel_width,
            pixel_height,
        }
    }

    /// Replace zero rows or columns with the 24x80 defaults
    pub fn or_default_cells(self) -> Self {
        WindowSize {
            rows: if self.rows == 0 { DEFAULT_ROWS } else { self.rows },
            cols: if self.cols == 0 { DEFAULT_COLS } else { self.cols },
            ..self
        }
    }

    /// Convert to libc winsize structure
    pub fn to_winsize(&self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }

    /// Create from libc winsize structure
    pub fn from_winsize(ws: libc::winsize) -> Self {
        WindowSize {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }

    /// Set the window size on a file descriptor (PTY master)
    pub(crate) fn set_on_fd(&self, fd: RawFd) -> Result<(), Errno> {
        let ws = self.to_winsize();
        // SAFETY: TIOCSWINSZ reads a winsize from the pointer we pass
        let result = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) };
        Errno::result(result).map(drop)
    }

    /// Get the window size from a file descriptor
    pub(crate) fn get_from_fd(fd: RawFd) -> Result<Self, Errno> {
        // SAFETY: winsize is plain data; TIOCGWINSZ fills it in
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
        Errno::result(result).map(|_| WindowSize::from_winsize(ws))
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        WindowSize::new(DEFAULT_ROWS, DEFAULT_COLS)
    }
}
