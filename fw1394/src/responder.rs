// SPDX-License-Identifier: LGPL-2.1-or-later

//! Address-range reservation and inbound request dispatch (`fw_resp.c`).

use std::sync::{Arc, Mutex};

use crate::error::{Fw1394Error, IoError, Result};
use crate::error::ResponderError;
use crate::node::{Node, Target};
use crate::sys::cdev;

/// Everything a handler is told about one inbound request subaction. Fields
/// that an older kernel ABI can't supply carry the sentinel `u32::MAX`
/// (`cdev::SENTINEL_U32`), matching `FW_CDEV_EVENT_REQUEST`'s reduced field
/// set.
pub struct RequestInfo {
    pub tcode: u32,
    pub offset: u64,
    pub source_node_id: u32,
    pub destination_node_id: u32,
    pub card_id: u32,
    pub generation: u32,
    pub tstamp: u32,
    pub payload: Vec<u8>,
}

/// What a handler hands back: the rcode to send, and an optional response
/// payload. A payload longer than the reserved width is silently dropped,
/// mirroring `hinawa_fw_resp_set_resp_frame`'s width check.
pub struct ResponderReply {
    pub rcode: u32,
    pub payload: Option<Vec<u8>>,
}

impl ResponderReply {
    pub fn new(rcode: u32) -> Self {
        Self {
            rcode,
            payload: None,
        }
    }

    pub fn with_payload(rcode: u32, payload: Vec<u8>) -> Self {
        Self {
            rcode,
            payload: Some(payload),
        }
    }
}

/// A request is rejected with `ConflictError` without reaching the handler
/// when the Responder isn't bound, or the event carries more bytes than the
/// reserved width.
fn conflicts(is_reserved: bool, payload_len: usize, width: u32) -> bool {
    !is_reserved || payload_len as u32 > width
}

type Handler = Box<dyn FnMut(RequestInfo) -> ResponderReply + Send>;

struct ResponderState {
    node: Option<Node>,
    closure: Option<u64>,
    offset: u64,
    width: u32,
    handle: u32,
    handler: Handler,
}

/// Shared state reachable both from the owning [`Responder`] handle and from
/// the Node's dispatch registry.
pub(crate) struct ResponderShared {
    state: Mutex<ResponderState>,
}

impl ResponderShared {
    /// Routes one inbound request subaction to the handler and sends the
    /// response. Errors from `FW_CDEV_IOC_SEND_RESPONSE` are intentionally
    /// dropped, matching the source's "ignore ioctl error" comment: there is
    /// no requester left to report them to.
    pub(crate) fn handle_request(
        &self,
        node: &Node,
        tcode: u32,
        offset: u64,
        handle: u32,
        source_node_id: u32,
        destination_node_id: u32,
        card_id: u32,
        generation: u32,
        tstamp: u32,
        payload: &[u8],
    ) {
        let mut state = self.state.lock().unwrap();
        let (rcode, response) = if conflicts(state.node.is_some(), payload.len(), state.width) {
            (cdev::RCODE_CONFLICT_ERROR, None)
        } else {
            let info = RequestInfo {
                tcode,
                offset,
                source_node_id,
                destination_node_id,
                card_id,
                generation,
                tstamp,
                payload: payload.to_vec(),
            };
            let width = state.width;
            let reply = (state.handler)(info);
            let response = reply.payload.filter(|p| p.len() as u32 <= width);
            (reply.rcode, response)
        };
        drop(state);

        let mut send = cdev::FwCdevSendResponse {
            rcode,
            length: response.as_ref().map_or(0, |p| p.len() as u32),
            data: response.as_ref().map_or(0, |p| p.as_ptr() as u64),
            handle,
        };
        let _ = node.ioctl_send_response(&mut send);
    }
}

/// An address-range reservation on a [`Node`] that dispatches inbound
/// request subactions to a user handler.
pub struct Responder {
    shared: Arc<ResponderShared>,
}

impl Responder {
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(RequestInfo) -> ResponderReply + Send + 'static,
    {
        Self {
            shared: Arc::new(ResponderShared {
                state: Mutex::new(ResponderState {
                    node: None,
                    closure: None,
                    offset: 0,
                    width: 0,
                    handle: 0,
                    handler: Box::new(handler),
                }),
            }),
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.shared.state.lock().unwrap().node.is_some()
    }

    pub fn offset(&self) -> u64 {
        self.shared.state.lock().unwrap().offset
    }

    pub fn width(&self) -> u32 {
        self.shared.state.lock().unwrap().width
    }

    /// Asks the kernel to allocate any `width`-sized window inside
    /// `[region_start, region_end)`.
    pub fn reserve_within(
        &self,
        node: &Node,
        region_start: u64,
        region_end: u64,
        width: u32,
    ) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if state.node.is_some() {
            return Err(Fw1394Error::Responder(ResponderError::Reserved));
        }

        let closure = node.alloc_closure();
        let mut alloc = cdev::FwCdevAllocate {
            offset: region_start,
            closure,
            length: width,
            handle: 0,
            region_end,
        };
        match node.ioctl_allocate(&mut alloc) {
            Ok(()) => {}
            Err(Fw1394Error::Io(IoError { source, .. })) if source == nix::Error::EBUSY => {
                return Err(Fw1394Error::Responder(ResponderError::AddrSpaceUsed));
            }
            Err(e) => return Err(e),
        }

        state.node = Some(node.clone());
        state.closure = Some(closure);
        state.offset = alloc.offset;
        state.width = alloc.length;
        state.handle = alloc.handle;
        drop(state);

        node.register(closure, Target::Responder(self.shared.clone()));
        Ok(())
    }

    /// Precise reservation at `addr`, expressed as a bounded region of
    /// exactly `width`.
    pub fn reserve_at(&self, node: &Node, addr: u64, width: u32) -> Result<()> {
        self.reserve_within(node, addr, addr + width as u64, width)
    }

    /// Deallocates and forgets the reservation. Safe to call on an
    /// unreserved Responder.
    pub fn release(&self) {
        let mut state = self.shared.state.lock().unwrap();
        let Some(node) = state.node.take() else {
            return;
        };
        let closure = state.closure.take();
        let handle = state.handle;
        state.offset = 0;
        state.width = 0;
        state.handle = 0;
        drop(state);

        if let Some(c) = closure {
            node.unregister(c);
        }
        // Ignore ioctl error, matching hinawa_fw_resp_release.
        let _ = node.ioctl_deallocate(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_responder_is_not_reserved() {
        let resp = Responder::new(|_info| ResponderReply::new(cdev::RCODE_COMPLETE));
        assert!(!resp.is_reserved());
        assert_eq!(resp.width(), 0);
    }

    #[test]
    fn release_on_unreserved_responder_is_a_noop() {
        let resp = Responder::new(|_info| ResponderReply::new(cdev::RCODE_COMPLETE));
        resp.release();
        assert!(!resp.is_reserved());
    }

    #[test]
    fn unbound_responder_always_conflicts() {
        assert!(conflicts(false, 0, 512));
    }

    #[test]
    fn oversize_payload_conflicts_even_when_bound() {
        assert!(conflicts(true, 8, 4));
        assert!(!conflicts(true, 4, 4));
    }
}
