//! Gateway frame descriptor.
//!
//! A `Frame` is what flows through the gateway: an arbitration id, a small
//! flag bitset and a payload. The payload is shared between copies of a
//! frame — fanning one ingress frame out to several egress queues clones
//! the descriptor, not the bytes. A deep copy detaches the payload when a
//! destination must own its bytes exclusively.

use std::fmt::{self, Display};
use std::sync::Arc;

use thiserror::Error;

use crate::device::DeviceId;

/// if set, the frame carries a 29 bit extended identifier
pub const FLAG_EXTENDED: u8 = 0x01;

/// remote transmission request
pub const FLAG_RTR: u8 = 0x02;

/// CAN-FD frame format
pub const FLAG_FD: u8 = 0x04;

/// CAN-FD bit rate switch
pub const FLAG_BRS: u8 = 0x08;

/// CAN-FD error state indicator
pub const FLAG_ESI: u8 = 0x10;

/// valid bits in standard frame id
pub const SFF_MASK: u32 = 0x000007ff;

/// valid bits in extended frame id
pub const EFF_MASK: u32 = 0x1fffffff;

/// payload limit for classical CAN
pub const CAN_MAX_DLEN: usize = 8;

/// payload limit for CAN-FD
pub const CANFD_MAX_DLEN: usize = 64;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Provided slice of data was longer than the frame format allows.")]
    TooMuchData,
    #[error("Provided ID was greater than EFF_MASK.")]
    IDTooLarge,
}

/// One CAN or CAN-FD frame inside the gateway.
///
/// Shallow copies (`Clone`) share the payload buffer; the buffer lives
/// until the last copy is dropped.
#[derive(Debug, Clone)]
pub struct Frame {
    id: u32,
    flags: u8,
    data: Arc<[u8]>,
    source: Option<DeviceId>,
}

impl Frame {
    /// Build a frame from raw parts, validating the payload length
    /// against the frame format and the id against `EFF_MASK`.
    ///
    /// Ids above `SFF_MASK` get `FLAG_EXTENDED` set automatically.
    pub fn new(id: u32, mut flags: u8, data: &[u8]) -> Result<Frame, FrameError> {
        let max_dlen = if flags & FLAG_FD != 0 {
            CANFD_MAX_DLEN
        } else {
            CAN_MAX_DLEN
        };

        if data.len() > max_dlen {
            return Err(FrameError::TooMuchData);
        }
        if id > EFF_MASK {
            return Err(FrameError::IDTooLarge);
        }
        if id > SFF_MASK {
            flags |= FLAG_EXTENDED;
        }

        Ok(Frame {
            id,
            flags,
            data: Arc::from(data),
            source: None,
        })
    }

    /// Duplicate the frame with a freshly allocated payload of its own.
    pub fn deep_copy(&self) -> Frame {
        Frame {
            id: self.id,
            flags: self.flags,
            data: Arc::from(&self.data[..]),
            source: self.source,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_extended(&self) -> bool {
        self.flags & FLAG_EXTENDED != 0
    }

    pub fn is_rtr(&self) -> bool {
        self.flags & FLAG_RTR != 0
    }

    pub fn is_fd(&self) -> bool {
        self.flags & FLAG_FD != 0
    }

    /// Interface the frame arrived on. `None` for host-originated frames.
    pub fn source(&self) -> Option<DeviceId> {
        self.source
    }

    pub(crate) fn set_source(&mut self, dev: DeviceId) {
        self.source = Some(dev);
    }

    /// Number of live descriptors sharing this frame's payload.
    pub fn usage_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ID: {:#x} RTR: {} FD: {} DATA: {:?}",
            self.id(),
            self.is_rtr(),
            self.is_fd(),
            self.data()
        )
    }
}

impl fmt::UpperHex for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{:X}#", self.id())?;

        let parts: Vec<String> = self.data().iter().map(|v| format!("{:02X}", v)).collect();

        write!(f, "{}", parts.join(" "))
    }
}
