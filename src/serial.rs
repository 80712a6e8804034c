use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

pub const DEFAULT_BAUD: u32 = 115_200;

/// Longest a read waits for the first byte, in tenths of a second. A silent
/// device then reads as end of stream instead of blocking forever.
pub const READ_TIMEOUT_DECISECONDS: u8 = 20;

/// Opens a serial device node for reading and writing, switched to raw 8N1 at
/// `baud` with a bounded read wait where the platform has termios.
pub fn open_serial(path: &Path, baud: u32) -> io::Result<File> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    #[cfg(unix)]
    configure_raw(&file, baud)?;
    #[cfg(not(unix))]
    let _ = baud;
    Ok(file)
}

#[cfg(unix)]
fn configure_raw(file: &File, baud: u32) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let speed = match baud {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {other}"),
            ))
        }
    };
    let fd = file.as_raw_fd();
    // SAFETY: `fd` stays open for the duration of these calls and `termios`
    // is fully initialised by tcgetattr before use.
    unsafe {
        let mut termios: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut termios) != 0 {
            // Not a tty (a plain file or pipe): nothing to configure.
            return Ok(());
        }
        libc::cfmakeraw(&mut termios);
        termios.c_cflag |= libc::CLOCAL | libc::CREAD;
        termios.c_cc[libc::VMIN] = 0;
        termios.c_cc[libc::VTIME] = READ_TIMEOUT_DECISECONDS as libc::cc_t;
        if libc::cfsetispeed(&mut termios, speed) != 0
            || libc::cfsetospeed(&mut termios, speed) != 0
            || libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
