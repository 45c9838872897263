use crate::address_space::AddressSpaceError;
use crate::command_buffer::CommandBufferError;
use crate::device::DeviceError;
use crate::ringbuffer::RingbufferError;
use gpu_platform::PlatformError;
use gpu_vmem::PageTableError;

/// Error of the client-facing entry points.
#[derive(Debug, thiserror::Error)]
pub enum MsdError {
    #[error(transparent)]
    AddressSpace(#[from] AddressSpaceError),
    #[error(transparent)]
    CommandBuffer(#[from] CommandBufferError),
    #[error(transparent)]
    Ringbuffer(#[from] RingbufferError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("connection no longer exists")]
    ConnectionGone,
    #[error("device no longer exists")]
    DeviceGone,
    #[error("context has been killed")]
    ContextKilled,
}

/// Coarse status for an ABI shim.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    Ok,
    InvalidArgs,
    AccessDenied,
    MemoryError,
    InternalError,
    ContextKilled,
}

impl MsdError {
    #[must_use]
    pub const fn status(&self) -> Status {
        match self {
            Self::AddressSpace(e) => address_space_status(e),
            Self::CommandBuffer(CommandBufferError::Platform(e)) | Self::Platform(e) => {
                platform_status(e)
            }
            Self::CommandBuffer(_) => Status::InvalidArgs,
            Self::Ringbuffer(RingbufferError::Full { .. }) => Status::MemoryError,
            Self::Ringbuffer(_) | Self::ConnectionGone | Self::DeviceGone => {
                Status::InternalError
            }
            Self::Device(e) => e.status(),
            Self::ContextKilled => Status::ContextKilled,
        }
    }
}

impl From<Result<(), MsdError>> for Status {
    fn from(result: Result<(), MsdError>) -> Self {
        match result {
            Ok(()) => Self::Ok,
            Err(e) => e.status(),
        }
    }
}

pub(crate) const fn platform_status(e: &PlatformError) -> Status {
    match e {
        PlatformError::OutOfMemory => Status::MemoryError,
        PlatformError::InvalidPageRange { .. } => Status::InvalidArgs,
        PlatformError::OutOfRange { .. } | PlatformError::UnmappedBusAddress(_) => {
            Status::InternalError
        }
    }
}

pub(crate) const fn address_space_status(e: &AddressSpaceError) -> Status {
    match e {
        AddressSpaceError::ForeignMapping => Status::AccessDenied,
        AddressSpaceError::Slot(_) => Status::MemoryError,
        AddressSpaceError::Platform(e) | AddressSpaceError::PageTable(PageTableError::Platform(e)) => {
            platform_status(e)
        }
        AddressSpaceError::Overlap { .. }
        | AddressSpaceError::NotFound { .. }
        | AddressSpaceError::InvalidRange { .. }
        | AddressSpaceError::Released
        | AddressSpaceError::PageTable(_) => Status::InvalidArgs,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use gpu_addresses::GpuAddress;

    #[test]
    fn status_mapping() {
        let overlap = MsdError::from(AddressSpaceError::Overlap {
            range: gpu_addresses::GpuRange::EMPTY,
            existing: GpuAddress::new(0x1000),
        });
        assert_eq!(overlap.status(), Status::InvalidArgs);
        assert_eq!(
            MsdError::from(AddressSpaceError::ForeignMapping).status(),
            Status::AccessDenied
        );
        assert_eq!(
            MsdError::from(AddressSpaceError::PageTable(PageTableError::Platform(
                PlatformError::OutOfMemory
            )))
            .status(),
            Status::MemoryError
        );
        assert_eq!(
            MsdError::from(RingbufferError::Full {
                bytes: 8,
                used: 0,
                size: 8
            })
            .status(),
            Status::MemoryError
        );
        assert_eq!(
            MsdError::from(DeviceError::NoFreeEvent).status(),
            Status::MemoryError
        );
        assert_eq!(MsdError::ContextKilled.status(), Status::ContextKilled);
        assert_eq!(Status::from(Ok(())), Status::Ok);
        assert_eq!(
            Status::from(Err(MsdError::DeviceGone)),
            Status::InternalError
        );
    }
}
