//! ioctl commands of the trace device

pub use swap_common::{
    BufferInitialize, SWAP_DRIVER_BUFFER_INITIALIZE, SWAP_DRIVER_BUFFER_UNINITIALIZE,
    SWAP_DRIVER_FLUSH_BUFFER, SWAP_DRIVER_IOC_MAGIC, SWAP_DRIVER_MSG,
    SWAP_DRIVER_NEXT_BUFFER_TO_READ, SWAP_DRIVER_WAKE_UP,
};

use crate::domain::DeviceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlCommand {
    BufferInitialize(BufferInitialize),
    BufferUninitialize,
    NextBufferToRead,
    FlushBuffer,
    /// Opaque blob for the registered message handler
    Msg(Vec<u8>),
    WakeUp,
}

impl IoctlCommand {
    /// Decode a command number and its argument block
    ///
    /// # Errors
    /// - [`DeviceError::UnknownCommand`] for a foreign command number
    /// - [`DeviceError::InvalidArgument`] if `BUFFER_INITIALIZE` carries
    ///   fewer than 8 bytes
    pub fn decode(cmd: u32, arg: &[u8]) -> Result<Self, DeviceError> {
        match cmd {
            SWAP_DRIVER_BUFFER_INITIALIZE => {
                let word = |at: usize| {
                    arg.get(at..at + 4)
                        .and_then(|raw| raw.try_into().ok())
                        .map(u32::from_le_bytes)
                        .ok_or_else(|| {
                            DeviceError::InvalidArgument(format!(
                                "BUFFER_INITIALIZE needs 8 bytes, got {}",
                                arg.len()
                            ))
                        })
                };
                Ok(Self::BufferInitialize(BufferInitialize { size: word(0)?, count: word(4)? }))
            }
            SWAP_DRIVER_BUFFER_UNINITIALIZE => Ok(Self::BufferUninitialize),
            SWAP_DRIVER_NEXT_BUFFER_TO_READ => Ok(Self::NextBufferToRead),
            SWAP_DRIVER_FLUSH_BUFFER => Ok(Self::FlushBuffer),
            SWAP_DRIVER_MSG => Ok(Self::Msg(arg.to_vec())),
            SWAP_DRIVER_WAKE_UP => Ok(Self::WakeUp),
            other => Err(DeviceError::UnknownCommand(other)),
        }
    }
}

/// Argument block of `BUFFER_INITIALIZE` as user space passes it
#[must_use]
pub fn encode_buffer_initialize(init: BufferInitialize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&init.size.to_le_bytes());
    out[4..].copy_from_slice(&init.count.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_initialize() {
        let init = BufferInitialize { size: 65536, count: 1_000_000 };
        let cmd = IoctlCommand::decode(SWAP_DRIVER_BUFFER_INITIALIZE, &encode_buffer_initialize(init));
        assert_eq!(cmd.unwrap(), IoctlCommand::BufferInitialize(init));

        let short = IoctlCommand::decode(SWAP_DRIVER_BUFFER_INITIALIZE, &[0; 4]).unwrap_err();
        assert_eq!(short.errno(), -libc::EINVAL);
    }

    #[test]
    fn test_decode_simple_commands() {
        assert_eq!(IoctlCommand::decode(SWAP_DRIVER_WAKE_UP, &[]).unwrap(), IoctlCommand::WakeUp);
        assert_eq!(
            IoctlCommand::decode(SWAP_DRIVER_MSG, b"cfg").unwrap(),
            IoctlCommand::Msg(b"cfg".to_vec())
        );
        assert_eq!(
            IoctlCommand::decode(0x5401, &[]).unwrap_err(),
            DeviceError::UnknownCommand(0x5401)
        );
    }
}
