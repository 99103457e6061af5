//! Raw-socket SocketCAN device adapter.
//!
//! Binds a raw `PF_CAN` socket to a named network interface and presents
//! it to the gateway as a [`CANDevice`]. The socket takes CAN-FD frames
//! and runs non-blocking, so both directions fit the cooperative tick:
//! `send` maps `EAGAIN` to [`SendStatus::WouldBlock`], and `poll` reads
//! until the kernel has nothing more or the budget runs out.

use std::io;
use std::mem::size_of;
use std::os::unix::prelude::*;

use log::{debug, warn};
use thiserror::Error;

use crate::device::{CANDevice, Ingress, SendStatus};
use crate::frame;

// constants stolen from C headers
const AF_CAN: libc::c_int = 29;
const PF_CAN: libc::c_int = 29;
const CAN_RAW: libc::c_int = 1;
const SOL_CAN_BASE: libc::c_int = 100;
const SOL_CAN_RAW: libc::c_int = SOL_CAN_BASE + CAN_RAW;
const CAN_RAW_FILTER: libc::c_int = 1;
const CAN_RAW_FD_FRAMES: libc::c_int = 5;

/// if set in the kernel id word, 29 bit extended format
const EFF_FLAG: u32 = 0x80000000;

/// remote transmission request flag in the kernel id word
const RTR_FLAG: u32 = 0x40000000;

/// kernel CAN-FD flag: bit rate switch
const CANFD_BRS: u8 = 0x01;

/// kernel CAN-FD flag: error state indicator
const CANFD_ESI: u8 = 0x02;

/// wire size of a classical frame on a raw socket
const CAN_MTU: usize = 16;

/// wire size of a CAN-FD frame on a raw socket
const CANFD_MTU: usize = 72;

#[derive(Debug)]
#[repr(C, align(8))]
struct CANAddr {
    af_can: libc::c_short,
    if_index: libc::c_int,
}

/// canfd_frame kernel layout. A classical can_frame is the same header
/// over an 8 byte data field, so the first `CAN_MTU` bytes of this
/// struct are also a valid classical frame.
#[repr(C, align(8))]
struct RawFdFrame {
    can_id: u32,
    len: u8,
    flags: u8,
    res0: u8,
    res1: u8,
    data: [u8; 64],
}

impl Default for RawFdFrame {
    fn default() -> Self {
        RawFdFrame {
            can_id: 0,
            len: 0,
            flags: 0,
            res0: 0,
            res1: 0,
            data: [0; 64],
        }
    }
}

/// can_filter kernel layout.
#[repr(C, align(8))]
struct RawFilter {
    id: u32,
    mask: u32,
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("Target CAN network couldn't be found.")]
    LookupError(nix::Error),
    #[error("Failed to access or set-up CAN network socket.")]
    IOError(std::io::Error),
}

/// Turn a libc `-1` return into a proper `io::Error`.
fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

fn enable_fd_frames(fd: RawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            SOL_CAN_RAW,
            CAN_RAW_FD_FRAMES,
            &on as *const libc::c_int as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

/// One SocketCAN interface presented to the gateway.
pub struct SocketCANDevice {
    fd: RawFd,
    name: String,
}

impl SocketCANDevice {
    pub fn new(interface_name: &str) -> Result<Self, OpenError> {
        let interface_index =
            nix::net::if_::if_nametoindex(interface_name).map_err(OpenError::LookupError)?;

        let fd = cvt(unsafe { libc::socket(PF_CAN, libc::SOCK_RAW, CAN_RAW) })
            .map_err(OpenError::IOError)?;

        // from here on Drop owns the fd
        let device = SocketCANDevice {
            fd,
            name: interface_name.to_string(),
        };

        let addr = CANAddr {
            af_can: AF_CAN as libc::c_short,
            if_index: interface_index as libc::c_int,
        };
        cvt(unsafe {
            libc::bind(
                device.fd,
                &addr as *const CANAddr as *const libc::sockaddr,
                size_of::<CANAddr>() as libc::socklen_t,
            )
        })
        .map_err(OpenError::IOError)?;

        enable_fd_frames(device.fd).map_err(OpenError::IOError)?;
        set_nonblocking(device.fd).map_err(OpenError::IOError)?;

        Ok(device)
    }

    /// Install a kernel-side acceptance list.
    ///
    /// Mirrors the gateway filter into the socket so frames the gateway
    /// would drop anyway never cross into user space. An empty list
    /// accepts nothing.
    pub fn set_filters(&self, ids: &[u32]) -> io::Result<()> {
        let filters: Vec<RawFilter> = ids
            .iter()
            .map(|&id| RawFilter {
                id,
                mask: frame::EFF_MASK,
            })
            .collect();

        cvt(unsafe {
            libc::setsockopt(
                self.fd,
                SOL_CAN_RAW,
                CAN_RAW_FILTER,
                filters.as_ptr() as *const libc::c_void,
                (size_of::<RawFilter>() * filters.len()) as libc::socklen_t,
            )
        })?;

        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        cvt(unsafe { libc::close(self.fd) })?;
        Ok(())
    }
}

impl CANDevice for SocketCANDevice {
    fn link_state(&self) -> bool {
        // the raw socket stays bound while the interface exists; a
        // vanished interface surfaces as send/poll errors instead
        true
    }

    fn send(&mut self, id: u32, flags: u8, data: &[u8]) -> SendStatus {
        let mut raw = RawFdFrame::default();

        raw.can_id = id;
        if flags & frame::FLAG_EXTENDED != 0 {
            raw.can_id |= EFF_FLAG;
        }
        if flags & frame::FLAG_RTR != 0 {
            raw.can_id |= RTR_FLAG;
        }
        raw.len = data.len() as u8;
        raw.data[..data.len()].copy_from_slice(data);

        let wire_len = if flags & frame::FLAG_FD != 0 {
            if flags & frame::FLAG_BRS != 0 {
                raw.flags |= CANFD_BRS;
            }
            if flags & frame::FLAG_ESI != 0 {
                raw.flags |= CANFD_ESI;
            }
            CANFD_MTU
        } else {
            CAN_MTU
        };

        let nbytes = unsafe {
            let frame_ptr = &raw as *const RawFdFrame;
            libc::write(self.fd, frame_ptr as *const libc::c_void, wire_len)
        };

        if nbytes == wire_len as isize {
            debug!("{}: sent {} bytes", self.name, nbytes);
            return SendStatus::Sent;
        }

        // a non-blocking write that cannot proceed fails with EAGAIN or
        // EWOULDBLOCK; the stdlib maps both to WouldBlock
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            SendStatus::WouldBlock
        } else {
            warn!("{}: transmit failed: {}", self.name, err);
            SendStatus::Failed
        }
    }

    fn poll(&mut self, rx: &Ingress, mut loop_score: i32) -> i32 {
        while loop_score > 0 {
            let mut raw = RawFdFrame::default();
            let nbytes = unsafe {
                let frame_ptr = &mut raw as *mut RawFdFrame;
                libc::read(
                    self.fd,
                    frame_ptr as *mut libc::c_void,
                    size_of::<RawFdFrame>(),
                )
            };

            if nbytes < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    warn!("{}: receive failed: {}", self.name, err);
                }
                break;
            }

            let mut flags = match nbytes as usize {
                CAN_MTU => 0u8,
                CANFD_MTU => {
                    let mut flags = frame::FLAG_FD;
                    if raw.flags & CANFD_BRS != 0 {
                        flags |= frame::FLAG_BRS;
                    }
                    if raw.flags & CANFD_ESI != 0 {
                        flags |= frame::FLAG_ESI;
                    }
                    flags
                }
                n => {
                    warn!("{}: received unknown frame size {}", self.name, n);
                    loop_score -= 1;
                    continue;
                }
            };

            let id = if raw.can_id & EFF_FLAG != 0 {
                flags |= frame::FLAG_EXTENDED;
                raw.can_id & frame::EFF_MASK
            } else {
                raw.can_id & frame::SFF_MASK
            };
            if raw.can_id & RTR_FLAG != 0 {
                flags |= frame::FLAG_RTR;
            }

            let len = (raw.len as usize).min(raw.data.len());
            if rx.receive(id, flags, &raw.data[..len]).is_err() {
                debug!(
                    "{}: ingress rejected frame {:#x} [{}]",
                    self.name,
                    id,
                    hex::encode(&raw.data[..len])
                );
            }
            loop_score -= 1;
        }

        loop_score
    }
}

impl Drop for SocketCANDevice {
    fn drop(&mut self) {
        self.close().ok();
    }
}

impl AsRawFd for SocketCANDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}
