//! Opaque handles for backend objects.
//!
//! Every object the runtime hands out (platform, device, context, queue,
//! memory object, program, kernel, session) is addressed by a 64-bit value
//! that can cross the host boundary as a plain integer. The value packs the
//! object kind into the top byte and the registry slot into the low bits:
//!
//! ```text
//! 63      56 55                         0
//! +---------+----------------------------+
//! |  kind   |       slot index + 1       |
//! +---------+----------------------------+
//! ```
//!
//! Zero is never a valid handle, so it stays available as the null
//! sentinel of the host boundary.

use std::fmt;

const KIND_SHIFT: u32 = 56;
const INDEX_MASK: u64 = (1 << KIND_SHIFT) - 1;

/// Kind of object a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum HandleKind {
    /// Compute platform.
    Platform = 1,
    /// Compute device.
    Device = 2,
    /// Execution context.
    Context = 3,
    /// Command queue.
    Queue = 4,
    /// Buffer or image.
    Memory = 5,
    /// Built program.
    Program = 6,
    /// Prepared kernel.
    Kernel = 7,
    /// Caller session (component instance).
    Session = 8,
}

impl HandleKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(HandleKind::Platform),
            2 => Some(HandleKind::Device),
            3 => Some(HandleKind::Context),
            4 => Some(HandleKind::Queue),
            5 => Some(HandleKind::Memory),
            6 => Some(HandleKind::Program),
            7 => Some(HandleKind::Kernel),
            8 => Some(HandleKind::Session),
            _ => None,
        }
    }

    /// Decode the kind tag of a raw handle value.
    pub fn of_raw(raw: u64) -> Option<Self> {
        Self::from_tag((raw >> KIND_SHIFT) as u8)
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleKind::Platform => "platform",
            HandleKind::Device => "device",
            HandleKind::Context => "context",
            HandleKind::Queue => "queue",
            HandleKind::Memory => "memory",
            HandleKind::Program => "program",
            HandleKind::Kernel => "kernel",
            HandleKind::Session => "session",
        };
        f.write_str(name)
    }
}

/// Common behavior of all typed handles.
pub trait Handle: Copy + Eq + std::hash::Hash + fmt::Debug + Send + Sync + 'static {
    /// Kind encoded in every handle of this type.
    const KIND: HandleKind;

    /// Build the handle for a registry slot.
    fn from_index(index: usize) -> Self;

    /// Registry slot this handle refers to.
    fn index(&self) -> usize;

    /// Raw 64-bit value for the host boundary.
    fn raw(&self) -> u64;

    /// Decode a raw value, checking the kind tag.
    fn from_raw(raw: u64) -> crate::error::ComputeResult<Self> {
        use crate::error::ComputeError;

        if raw == 0 || raw & INDEX_MASK == 0 {
            return Err(ComputeError::UnknownHandle {
                kind: Self::KIND,
                raw,
            });
        }
        match HandleKind::of_raw(raw) {
            Some(kind) if kind == Self::KIND => {
                Ok(Self::from_index(((raw & INDEX_MASK) - 1) as usize))
            }
            _ => Err(ComputeError::WrongHandleKind {
                expected: Self::KIND,
                raw,
            }),
        }
    }
}

fn pack(kind: HandleKind, index: usize) -> u64 {
    ((kind as u64) << KIND_SHIFT) | ((index as u64 + 1) & INDEX_MASK)
}

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident => $kind:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl Handle for $name {
            const KIND: HandleKind = HandleKind::$kind;

            fn from_index(index: usize) -> Self {
                Self(pack(HandleKind::$kind, index))
            }

            fn index(&self) -> usize {
                ((self.0 & INDEX_MASK) - 1) as usize
            }

            fn raw(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}:{}", HandleKind::$kind, self.index())
            }
        }

        impl From<$name> for u64 {
            fn from(handle: $name) -> u64 {
                handle.0
            }
        }

        impl TryFrom<u64> for $name {
            type Error = crate::error::ComputeError;

            fn try_from(raw: u64) -> Result<Self, Self::Error> {
                <Self as Handle>::from_raw(raw)
            }
        }
    };
}

define_handle!(
    /// Handle to a discovered platform.
    PlatformHandle => Platform
);
define_handle!(
    /// Handle to a discovered device.
    DeviceHandle => Device
);
define_handle!(
    /// Handle to an execution context.
    ContextHandle => Context
);
define_handle!(
    /// Handle to a command queue.
    QueueHandle => Queue
);
define_handle!(
    /// Handle to a buffer or image.
    MemHandle => Memory
);
define_handle!(
    /// Handle to a built program.
    ProgramHandle => Program
);
define_handle!(
    /// Handle to a kernel with bound arguments.
    KernelHandle => Kernel
);
define_handle!(
    /// Handle to a caller session.
    SessionHandle => Session
);

/// Convert an optional handle to its raw value, using zero for `None`.
pub fn raw_or_null<H: Handle>(handle: Option<H>) -> u64 {
    handle.map(|h| h.raw()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ComputeError;

    #[test]
    fn test_handle_roundtrip_through_raw() {
        let handle = MemHandle::from_index(41);
        assert_eq!(handle.index(), 41);
        assert_eq!(MemHandle::from_raw(handle.raw()).unwrap(), handle);
        assert_eq!(HandleKind::of_raw(handle.raw()), Some(HandleKind::Memory));
    }

    #[test]
    fn test_zero_is_never_valid() {
        assert_eq!(
            DeviceHandle::from_raw(0),
            Err(ComputeError::UnknownHandle {
                kind: HandleKind::Device,
                raw: 0
            })
        );
        assert_ne!(DeviceHandle::from_index(0).raw(), 0);
    }

    #[test]
    fn test_kind_is_checked() {
        let queue = QueueHandle::from_index(3);
        let err = MemHandle::from_raw(queue.raw()).unwrap_err();
        assert!(matches!(
            err,
            ComputeError::WrongHandleKind {
                expected: HandleKind::Memory,
                ..
            }
        ));

        // A bare pointer-like value carries no valid tag.
        assert!(KernelHandle::from_raw(0x7f3a_2c00_1000).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(ContextHandle::from_index(2).to_string(), "context:2");
        assert_eq!(raw_or_null::<ProgramHandle>(None), 0);
    }
}
