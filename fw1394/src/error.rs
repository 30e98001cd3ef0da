// SPDX-License-Identifier: LGPL-2.1-or-later

//! Error taxonomy. One enum per component, plus a top-level
//! enum that every public operation returns. Mirrors the per-domain
//! `GError` quarks of the source (`hinawa-fw-node-error-quark`,
//! `hinawa-fw-req-error-quark`, `hinawa-fw-resp-error-quark`,
//! `hinawa-fw-fcp-error-quark`, `hinawa-snd-efw-error-quark`) as one Rust
//! enum variant per quark.

use crate::sys::cdev;
use std::fmt;

/// Node lifecycle errors (`fw_node.c`).
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum NodeError {
    #[error("the associated node is not available for communication")]
    Disconnected,
    #[error("the instance is already associated to a node")]
    Opened,
    #[error("the instance is not associated to a node")]
    NotOpened,
}

/// Transport-layer (request/response) errors (`fw_req.c`). Variants map
/// one-to-one to IEEE 1394 `rcode`s beyond `RCODE_COMPLETE`, plus two
/// library-local conditions (`Cancelled` for timeout, `Invalid` for an
/// unrecognised rcode).
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    #[error("conflict error")]
    ConflictError,
    #[error("data error")]
    DataError,
    #[error("type error")]
    TypeError,
    #[error("address error")]
    AddressError,
    #[error("send error")]
    SendError,
    #[error("timeout")]
    Cancelled,
    #[error("busy")]
    Busy,
    #[error("bus reset")]
    Generation,
    #[error("no ack")]
    NoAck,
    #[error("invalid")]
    Invalid,
}

impl RequestError {
    /// Maps a raw 1394 `rcode` (as delivered by `FW_CDEV_EVENT_RESPONSE[2]`)
    /// to the corresponding error. `RCODE_COMPLETE` has no error and is
    /// handled by the caller before reaching this function.
    pub fn from_rcode(rcode: u32) -> Self {
        match rcode {
            cdev::RCODE_CONFLICT_ERROR => Self::ConflictError,
            cdev::RCODE_DATA_ERROR => Self::DataError,
            cdev::RCODE_TYPE_ERROR => Self::TypeError,
            cdev::RCODE_ADDRESS_ERROR => Self::AddressError,
            cdev::RCODE_SEND_ERROR => Self::SendError,
            cdev::RCODE_CANCELLED => Self::Cancelled,
            cdev::RCODE_BUSY => Self::Busy,
            cdev::RCODE_GENERATION => Self::Generation,
            cdev::RCODE_NO_ACK => Self::NoAck,
            _ => Self::Invalid,
        }
    }
}

/// Responder (address-range reservation) errors (`fw_resp.c`).
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ResponderError {
    #[error("reservation of address space is already done")]
    Reserved,
    #[error("the requested range of address is already used exclusively")]
    AddrSpaceUsed,
}

/// FCP (Function Control Protocol) errors (`fw_fcp.c`).
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum FcpError {
    #[error("the transaction is canceled due to response timeout")]
    Timeout,
    #[error("the size of response is larger than expected")]
    LargeResp,
    /// Reserved for a bus reset occurring mid-transaction. The source names
    /// this code point but never emits it; kept
    /// for wire/API compatibility but never constructed by this crate.
    #[error("the transaction was aborted by a bus reset")]
    Aborted,
}

/// Echo Fireworks Transaction status taxonomy (`efw.c`, `snd_efw.c`),
/// preserved verbatim, plus two library-local conditions.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum EfwError {
    #[error("the request or response includes invalid header")]
    Bad,
    #[error("the request includes invalid category or command")]
    BadCommand,
    #[error("the transaction fails due to communication error")]
    CommErr,
    #[error("the number of quadlets in transaction is invalid")]
    BadQuadCount,
    #[error("the request is not supported")]
    Unsupported,
    #[error("the transaction is canceled due to response timeout on the 1394 bus")]
    Timeout1394,
    #[error("the operation for DSP did not finish within timeout")]
    DspTimeout,
    #[error("the request includes invalid value for sampling frequency")]
    BadRate,
    #[error("the request includes invalid value for source of clock")]
    BadClock,
    #[error("the request includes invalid value for the number of channel")]
    BadChannel,
    #[error("the request includes invalid value for panning")]
    BadPan,
    #[error("the on-board flash is busy and not operable")]
    FlashBusy,
    #[error("the request includes invalid value for mirroring channel")]
    BadMirror,
    #[error("the request includes invalid value for LED")]
    BadLed,
    #[error("the request includes invalid value of parameter")]
    BadParameter,
    /// Named by the wire format (`EFW_STATUS_INCOMPLETE = 0x80000000` in
    /// `efw.c`) but never produced by any response path in the source; kept
    /// for decode completeness, never constructed by this crate's write path.
    #[error("the response is an incomplete continuation frame")]
    Incomplete,
    /// Library-local: no matching response arrived within the timeout.
    #[error("the transaction is canceled due to response timeout")]
    Timeout,
    /// Library-local: the response carries more parameters than the
    /// caller's buffer can hold.
    #[error("the size of response is larger than expected")]
    LargeResp,
}

impl EfwError {
    /// Maps a raw `status` quadlet from a response frame. Unknown (future)
    /// status codes above `BadParameter` collapse to `Bad`, matching
    /// `snd_efw.c`'s `handle_response`.
    pub fn from_status(status: u32) -> Option<Self> {
        match status {
            0 => None,
            1 => Some(Self::Bad),
            2 => Some(Self::BadCommand),
            3 => Some(Self::CommErr),
            4 => Some(Self::BadQuadCount),
            5 => Some(Self::Unsupported),
            6 => Some(Self::Timeout1394),
            7 => Some(Self::DspTimeout),
            8 => Some(Self::BadRate),
            9 => Some(Self::BadClock),
            10 => Some(Self::BadChannel),
            11 => Some(Self::BadPan),
            12 => Some(Self::FlashBusy),
            13 => Some(Self::BadMirror),
            14 => Some(Self::BadLed),
            15 => Some(Self::BadParameter),
            0x8000_0000 => Some(Self::Incomplete),
            _ => Some(Self::Bad),
        }
    }
}

/// Wraps a failed syscall with the operation name and errno,
/// for the propagation policy ("All ioctl failures are wrapped with the
/// operation name and errno for logging").
#[derive(Debug)]
pub struct IoError {
    pub operation: &'static str,
    pub source: nix::Error,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.source)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Top-level error returned by every public, fallible operation in this
/// crate.
#[derive(Debug, thiserror::Error)]
pub enum Fw1394Error {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Responder(#[from] ResponderError),
    #[error(transparent)]
    Fcp(#[from] FcpError),
    #[error(transparent)]
    Efw(#[from] EfwError),
}

impl Fw1394Error {
    pub fn io(operation: &'static str, source: nix::Error) -> Self {
        // ENODEV is terminal at the Node level; downstream operations must
        // convert it to `Disconnected` rather than surfacing a raw errno.
        if source == nix::Error::ENODEV {
            Self::Node(NodeError::Disconnected)
        } else {
            Self::Io(IoError { operation, source })
        }
    }
}

pub type Result<T> = std::result::Result<T, Fw1394Error>;
