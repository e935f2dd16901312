/// Host side of the console device: unbuffered stdout and raw stdin
use log::warn;
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};
use std::io::{self, Read, Stdin, Write};
use std::os::fd::AsFd;

/// Source of console input bytes.
pub trait ConsoleInput {
    /// Block until one byte is available.
    fn read_byte(&mut self) -> io::Result<u8>;
}

/// Reads single keystrokes from stdin without waiting for a newline.
pub struct RawTerminal {
    stdin: Stdin,
    echo: bool,
    warned: bool,
}

impl RawTerminal {
    pub fn new(echo: bool) -> Self {
        Self {
            stdin: io::stdin(),
            echo,
            warned: false,
        }
    }
}

impl ConsoleInput for RawTerminal {
    fn read_byte(&mut self) -> io::Result<u8> {
        let _mode = match RawModeGuard::enter(&self.stdin, self.echo) {
            Ok(guard) => Some(guard),
            Err(e) => {
                if !self.warned {
                    warn!("stdin is not a terminal ({}), reading without raw mode", e);
                    self.warned = true;
                }
                None
            }
        };

        let mut byte = [0u8; 1];
        self.stdin.lock().read_exact(&mut byte)?;
        Ok(byte[0])
    }
}

/// Canonical mode is off while the guard lives; the previous settings are
/// restored on drop.
struct RawModeGuard<'a> {
    stdin: &'a Stdin,
    saved: Termios,
}

impl<'a> RawModeGuard<'a> {
    fn enter(stdin: &'a Stdin, echo: bool) -> nix::Result<Self> {
        let saved = tcgetattr(stdin.as_fd())?;
        let mut raw = saved.clone();
        raw.local_flags.remove(LocalFlags::ICANON);
        raw.local_flags.set(LocalFlags::ECHO, echo);
        tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw)?;
        Ok(Self { stdin, saved })
    }
}

impl Drop for RawModeGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = tcsetattr(self.stdin.as_fd(), SetArg::TCSANOW, &self.saved) {
            warn!("failed to restore terminal settings: {}", e);
        }
    }
}

/// Writes each guest byte straight through, flushing so output appears in
/// the order and at the moment the guest wrote it.
pub struct ConsoleOutput<W: Write> {
    inner: W,
}

impl<W: Write> ConsoleOutput<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.inner.write_all(&[byte])?;
        self.inner.flush()
    }
}
