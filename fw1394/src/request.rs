// SPDX-License-Identifier: LGPL-2.1-or-later

//! Outbound read/write/lock subactions and the synchronous transaction
//! wrapper built on top of them (`fw_req.c`).

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Fw1394Error, RequestError, Result};
use crate::node::{Node, Target};
use crate::sys::cdev;

fn requires_quadlet_alignment(tcode: u32) -> bool {
    matches!(
        tcode,
        cdev::TCODE_WRITE_QUADLET_REQUEST
            | cdev::TCODE_READ_QUADLET_REQUEST
            | cdev::TCODE_LOCK_MASK_SWAP
            | cdev::TCODE_LOCK_COMPARE_SWAP
            | cdev::TCODE_LOCK_FETCH_ADD
            | cdev::TCODE_LOCK_LITTLE_ADD
            | cdev::TCODE_LOCK_BOUNDED_ADD
            | cdev::TCODE_LOCK_WRAP_ADD
            | cdev::TCODE_LOCK_VENDOR_DEPENDENT
    )
}

fn is_lock_tcode(tcode: u32) -> bool {
    matches!(
        tcode,
        cdev::TCODE_LOCK_MASK_SWAP
            | cdev::TCODE_LOCK_COMPARE_SWAP
            | cdev::TCODE_LOCK_FETCH_ADD
            | cdev::TCODE_LOCK_LITTLE_ADD
            | cdev::TCODE_LOCK_BOUNDED_ADD
            | cdev::TCODE_LOCK_WRAP_ADD
            | cdev::TCODE_LOCK_VENDOR_DEPENDENT
    )
}

/// Write and lock subactions carry outgoing payload to the kernel; read
/// subactions carry none.
fn carries_outgoing_data(tcode: u32) -> bool {
    !matches!(
        tcode,
        cdev::TCODE_READ_QUADLET_REQUEST | cdev::TCODE_READ_BLOCK_REQUEST
    )
}

/// Wire length in bytes for `length` logical bytes at `tcode`. Lock
/// subactions carry two equal-size operands back to back.
fn wire_length(tcode: u32, length: usize) -> usize {
    if is_lock_tcode(tcode) {
        length * 2
    } else {
        length
    }
}

#[derive(Default)]
struct SlotInner {
    outcome: Option<Outcome>,
}

struct Outcome {
    rcode: u32,
    data: Vec<u8>,
    request_tstamp: u32,
    response_tstamp: u32,
}

/// The per-transaction waiter the Node's dispatcher completes exactly once.
/// Lives behind an `Arc` shared between the caller (blocked in
/// [`transaction`]) and the Node's registry entry.
pub(crate) struct RequestSlot {
    inner: Mutex<SlotInner>,
    condvar: Condvar,
}

impl RequestSlot {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner::default()),
            condvar: Condvar::new(),
        }
    }

    /// Delivers a response. Called at most once per slot: the Node's
    /// dispatcher only reaches this after winning the atomic removal of the
    /// request from the outstanding set.
    pub(crate) fn complete(&self, rcode: u32, payload: &[u8], request_tstamp: u32, response_tstamp: u32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.outcome.is_some() {
            return;
        }
        inner.outcome = Some(Outcome {
            rcode,
            data: payload.to_vec(),
            request_tstamp,
            response_tstamp,
        });
        self.condvar.notify_all();
    }
}

/// A submitted, not-yet-awaited request. Produced by [`request`]; consumed
/// by [`transaction`], or dropped and later cleaned up by
/// [`Node::invalidate_request`] if the caller only wanted fire-and-forget
/// submission.
pub struct RequestHandle {
    closure: u64,
    node: Node,
    slot: Arc<RequestSlot>,
}

/// Response payload and timestamps of a completed transaction.
/// `request_tstamp`/`response_tstamp` carry the sentinel `u32::MAX` when the
/// kernel ABI predates version 6 and never populated them.
pub struct TransactionResponse {
    pub data: Vec<u8>,
    pub request_tstamp: u32,
    pub response_tstamp: u32,
}

impl Node {
    /// Removes `req` from the outstanding set; a matching response arriving
    /// afterwards is dropped. Safe to call on an already-completed or
    /// already-invalidated handle.
    pub fn invalidate_request(&self, req: &RequestHandle) {
        self.unregister(req.closure);
    }
}

/// Non-blocking submit: validates alignment and buffer size for `tcode`,
/// registers the waiter in `node`'s outstanding set, then issues
/// `FW_CDEV_IOC_SEND_REQUEST`. Registration happens before the ioctl so that
/// submission happens-before completion even if the response races in
/// immediately.
pub fn request(
    node: &Node,
    tcode: u32,
    addr: u64,
    length: usize,
    buf: &[u8],
    generation: u32,
) -> Result<RequestHandle> {
    if requires_quadlet_alignment(tcode) && (addr & 0x3 != 0 || length & 0x3 != 0) {
        return Err(Fw1394Error::Request(RequestError::Invalid));
    }
    let wire_len = wire_length(tcode, length);
    if carries_outgoing_data(tcode) && buf.len() < wire_len {
        return Err(Fw1394Error::Request(RequestError::Invalid));
    }

    let slot = Arc::new(RequestSlot::new());
    let closure = node.alloc_closure();
    node.register(closure, Target::Request(slot.clone()));

    let mut send = cdev::FwCdevSendRequest {
        tcode,
        length: wire_len as u32,
        offset: addr,
        closure,
        data: if carries_outgoing_data(tcode) {
            buf.as_ptr() as u64
        } else {
            0
        },
        generation,
    };

    if let Err(e) = node.ioctl_send_request(&mut send) {
        node.unregister(closure);
        return Err(e);
    }

    Ok(RequestHandle {
        closure,
        node: node.clone(),
        slot,
    })
}

/// Synchronous request/response: submits via [`request`], then waits up to
/// `timeout_ms` wall time for the matching response. Once the deadline
/// passes without a response, the handle is unconditionally invalidated
/// before returning — a response that arrives after this point is dropped.
pub fn transaction(
    node: &Node,
    tcode: u32,
    addr: u64,
    length: usize,
    buf: &[u8],
    timeout_ms: u64,
) -> Result<TransactionResponse> {
    let handle = request(node, tcode, addr, length, buf, node.generation().generation)?;
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);

    let mut guard = handle.slot.inner.lock().unwrap();
    loop {
        if guard.outcome.is_some() {
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let (next_guard, timeout_result) = handle
            .slot
            .condvar
            .wait_timeout(guard, deadline - now)
            .unwrap();
        guard = next_guard;
        if timeout_result.timed_out() && guard.outcome.is_none() {
            break;
        }
    }
    let outcome = guard.outcome.take();
    drop(guard);

    // "Always for safe": whether we got an outcome or not, make sure this
    // handle can no longer be matched by a later event.
    node.invalidate_request(&handle);

    match outcome {
        None => Err(Fw1394Error::Request(RequestError::Cancelled)),
        Some(o) if o.rcode == cdev::RCODE_COMPLETE => {
            let want = length.min(o.data.len());
            Ok(TransactionResponse {
                data: o.data[..want].to_vec(),
                request_tstamp: o.request_tstamp,
                response_tstamp: o.response_tstamp,
            })
        }
        Some(o) => Err(Fw1394Error::Request(RequestError::from_rcode(o.rcode))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quadlet_tcode_requires_alignment() {
        assert!(requires_quadlet_alignment(cdev::TCODE_READ_QUADLET_REQUEST));
        assert!(requires_quadlet_alignment(cdev::TCODE_LOCK_COMPARE_SWAP));
        assert!(!requires_quadlet_alignment(cdev::TCODE_WRITE_BLOCK_REQUEST));
    }

    #[test]
    fn lock_tcode_doubles_wire_length() {
        assert_eq!(wire_length(cdev::TCODE_LOCK_COMPARE_SWAP, 4), 8);
        assert_eq!(wire_length(cdev::TCODE_WRITE_BLOCK_REQUEST, 8), 8);
    }

    #[test]
    fn read_requests_carry_no_outgoing_data() {
        assert!(!carries_outgoing_data(cdev::TCODE_READ_QUADLET_REQUEST));
        assert!(!carries_outgoing_data(cdev::TCODE_READ_BLOCK_REQUEST));
        assert!(carries_outgoing_data(cdev::TCODE_WRITE_QUADLET_REQUEST));
        assert!(carries_outgoing_data(cdev::TCODE_LOCK_COMPARE_SWAP));
    }

    #[test]
    fn slot_complete_is_idempotent() {
        let slot = RequestSlot::new();
        slot.complete(cdev::RCODE_COMPLETE, &[1, 2, 3, 4], 10, 20);
        slot.complete(cdev::RCODE_BUSY, &[9, 9, 9, 9], 99, 99);
        let inner = slot.inner.lock().unwrap();
        let outcome = inner.outcome.as_ref().unwrap();
        assert_eq!(outcome.rcode, cdev::RCODE_COMPLETE);
        assert_eq!(outcome.data, vec![1, 2, 3, 4]);
    }
}
