// SPDX-License-Identifier: LGPL-2.1-or-later

//! Safe userspace engine for IEEE 1394 (FireWire) audio devices: the
//! asynchronous request/response protocol over Linux's `firewire-cdev`
//! character device, the Function Control Protocol (FCP) overlay used by
//! AV/C-style commands, and the Echo Fireworks Transaction (EFW) overlay
//! carried over the ALSA FireWire hwdep interface.
//!
//! Five pieces, built bottom-up:
//!
//! - [`node`] — one open `firewire-cdev` descriptor: cached configuration
//!   ROM, bus-generation tracking, and the event dispatcher C2/C3 plug into.
//! - [`request`] — outbound read/write/lock subactions and the synchronous
//!   transaction wrapper built on top of them.
//! - [`responder`] — address-range reservation and inbound request dispatch.
//! - [`fcp`] — AV/C-style command/response built compositionally on a
//!   [`responder::Responder`] plus [`request`].
//! - [`efw`] — the Echo Fireworks Transaction protocol over a separate ALSA
//!   hwdep descriptor.
//! - [`cycle_time`] — pure decoding of the 1394 OHCI `CYCLE_TIME` register
//!   and of OHCI context timestamps.
//!
//! None of these own a thread: callers integrate [`node::Node::fd`] and
//! [`efw::EfwNode`]'s descriptor into their own event loop and drive
//! dispatch themselves.

pub mod cycle_time;
pub mod efw;
pub mod error;
pub mod fcp;
pub mod node;
pub mod request;
pub mod responder;
pub(crate) mod sys;

pub use cycle_time::{CycleTime, CycleTimeFields};
pub use error::{EfwError, FcpError, Fw1394Error, IoError, NodeError, RequestError, ResponderError, Result};
pub use efw::{EfwDispatchOutcome, EfwEventSource, EfwNode};
pub use fcp::FcpExecutor;
pub use node::{BusGeneration, DispatchOutcome, Node, NodeEventSource};
pub use request::{request, transaction, RequestHandle, TransactionResponse};
pub use responder::{RequestInfo, Responder, ResponderReply};
