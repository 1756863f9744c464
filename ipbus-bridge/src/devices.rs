//! Opening the byte channels between the bridge processes and the hardware link.
//!
//! The request and response channels are named pipes. Opening one end of a pipe blocks until the
//! other end is opened as well, so both processes must open them in the same order: requests
//! first, then responses.
use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    fcntl::OFlag,
    sys::termios::{self, BaudRate, SetArg},
};
use tokio::net::unix::pipe;

async fn open_blocking(path: &Path, write: bool) -> io::Result<File> {
    let path: PathBuf = path.to_owned();
    tokio::task::spawn_blocking(move || {
        log::debug!("Waiting for the other end of {}", path.display());
        OpenOptions::new()
            .read(!write)
            .write(write)
            .open(&path)
    })
    .await
    .map_err(io::Error::other)?
}

/// Opens the writing end of the named pipe at `path`.
pub async fn open_sender(path: impl AsRef<Path>) -> io::Result<pipe::Sender> {
    let file = open_blocking(path.as_ref(), true).await?;
    log::info!("Opened {} for writing", path.as_ref().display());
    pipe::Sender::from_file(file)
}

/// Opens the reading end of the named pipe at `path`.
pub async fn open_receiver(path: impl AsRef<Path>) -> io::Result<pipe::Receiver> {
    let file = open_blocking(path.as_ref(), false).await?;
    log::info!("Opened {} for reading", path.as_ref().display());
    pipe::Receiver::from_file(file)
}

fn baud_rate(baud: u32) -> io::Result<BaudRate> {
    Ok(match baud {
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        460800 => BaudRate::B460800,
        921600 => BaudRate::B921600,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Unsupported baud rate {}", other),
            ));
        }
    })
}

/// Opens the hardware link at `path`.
///
/// Terminals are switched to raw mode at `baud`. Anything else, e.g. a socket or a pipe created by
/// an emulator, is used as is.
pub fn open_link(path: impl AsRef<Path>, baud: u32) -> io::Result<tokio::fs::File> {
    let path = path.as_ref();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NOCTTY.bits())
        .open(path)?;

    match termios::tcgetattr(&file) {
        Ok(mut settings) => {
            termios::cfmakeraw(&mut settings);
            termios::cfsetspeed(&mut settings, baud_rate(baud)?)?;
            termios::tcsetattr(&file, SetArg::TCSANOW, &settings)?;
            log::info!("Opened link {} at {} baud", path.display(), baud);
        }
        Err(Errno::ENOTTY) => log::info!("Opened link {}", path.display()),
        Err(err) => return Err(err.into()),
    }
    Ok(tokio::fs::File::from_std(file))
}
