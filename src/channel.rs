//! One-shot control channel carrying the user's command from launcher to init.
//!
//! The message is the command tokens joined by single spaces. There is no
//! framing: closing the write end marks the end of the message. The reader
//! splits on any whitespace, so an argument containing spaces arrives as
//! several arguments.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;

use crate::error::{Error, Result};

/// Descriptor slot where the init process finds the read end of the channel.
pub const INIT_PIPE_FD: RawFd = 3;

/// Something that accepts the container command exactly once.
pub trait CommandSink {
    /// Delivers `command` and closes the channel.
    fn send(self, command: &[String]) -> Result<()>;
}

/// Write end of the control channel, held by the launcher.
///
/// `send` consumes the writer, so the channel is written and closed exactly
/// once. Dropping an unsent writer closes the channel with an empty message.
#[derive(Debug)]
pub struct ControlWriter {
    pipe: File,
}

impl CommandSink for ControlWriter {
    fn send(mut self, command: &[String]) -> Result<()> {
        let message = command.join(" ");
        tracing::info!(command = %message, "sending command to init process");
        self.pipe
            .write_all(message.as_bytes())
            .map_err(|e| Error::io("control channel", e))?;
        Ok(())
    }
}

/// Creates the channel. Both ends are close-on-exec; the launcher moves the
/// read end to [`INIT_PIPE_FD`] in the child, which clears the flag there.
pub fn control_channel() -> Result<(OwnedFd, ControlWriter)> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(Error::Pipe)?;
    Ok((
        read,
        ControlWriter {
            pipe: File::from(write),
        },
    ))
}

/// Reads the whole message until the writer closes and splits it into tokens.
pub fn read_command(mut reader: impl Read) -> Result<Vec<String>> {
    let mut message = String::new();
    reader
        .read_to_string(&mut message)
        .map_err(|_| Error::NoCommandReceived)?;
    let command: Vec<String> = message.split_whitespace().map(str::to_owned).collect();
    if command.is_empty() {
        return Err(Error::NoCommandReceived);
    }
    Ok(command)
}

/// Reads the command from the inherited descriptor at [`INIT_PIPE_FD`].
///
/// Must only be called once, from the init process.
pub fn read_inherited_command() -> Result<Vec<String>> {
    // SAFETY: the launcher installs the channel at this slot before exec and
    // nothing else in the init process owns it.
    let pipe = unsafe { File::from_raw_fd(INIT_PIPE_FD) };
    read_command(pipe)
}
