// SPDX-License-Identifier: LGPL-2.1-or-later

//! Echo Fireworks Transaction executor over an ALSA hwdep character device
//! (`efw.c`, `snd_efw.c`). Distinct descriptor and distinct matching key
//! (sequence number, not payload bytes) from the `firewire-cdev` engine in
//! [`crate::node`].

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;

use crate::error::{EfwError, Fw1394Error, Result};
use crate::sys::hwdep;

#[derive(Default)]
struct EfwWaiterState {
    delivered: bool,
    version: u32,
    category: u32,
    command: u32,
    status: u32,
    params: Vec<u32>,
}

/// One in-flight `transact` call, matched by the response's sequence number
/// (always `request.seqnum + 1`, never colliding the way FCP match keys
/// can).
struct EfwWaiter {
    seqnum: u32,
    state: Mutex<EfwWaiterState>,
    condvar: Condvar,
}

impl EfwWaiter {
    fn new(seqnum: u32) -> Self {
        Self {
            seqnum,
            state: Mutex::new(EfwWaiterState::default()),
            condvar: Condvar::new(),
        }
    }

    fn try_deliver(
        &self,
        seqnum: u32,
        version: u32,
        category: u32,
        command: u32,
        status: u32,
        params: &[u32],
    ) -> bool {
        if seqnum != self.seqnum {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        state.delivered = true;
        state.version = version;
        state.category = category;
        state.command = command;
        state.status = status;
        state.params = params.to_vec();
        drop(state);
        self.condvar.notify_all();
        true
    }
}

struct EfwInner {
    fd: OwnedFd,
    device_type: AtomicU32,
    card_id: AtomicU32,
    seqnum: Mutex<u32>,
    waiters: Mutex<Vec<Arc<EfwWaiter>>>,
}

/// One open ALSA hwdep character device bound to a Fireworks unit.
#[derive(Clone)]
pub struct EfwNode {
    inner: Arc<EfwInner>,
}

fn next_seqnum(counter: &Mutex<u32>) -> u32 {
    let mut guard = counter.lock().unwrap();
    let current = *guard;
    let next = current + 2;
    *guard = if next > hwdep::EFW_SEQNUM_MAX { 0 } else { next };
    current
}

impl EfwNode {
    /// Opens `path` for read/write and queries `SNDRV_FIREWIRE_IOCTL_GET_INFO`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let fd = open(path.as_ref(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| Fw1394Error::io("open", e))?;

        let mut info = hwdep::SndFirewireGetInfo::default();
        unsafe { hwdep::get_info(fd.as_raw_fd(), &mut info) }
            .map_err(|e| Fw1394Error::io("SNDRV_FIREWIRE_IOCTL_GET_INFO", e))?;

        Ok(Self {
            inner: Arc::new(EfwInner {
                fd,
                device_type: AtomicU32::new(info.device_type),
                card_id: AtomicU32::new(info.card as u32),
                seqnum: Mutex::new(0),
                waiters: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn device_type(&self) -> u32 {
        self.inner.device_type.load(Ordering::Relaxed)
    }

    pub fn card_id(&self) -> u32 {
        self.inner.card_id.load(Ordering::Relaxed)
    }

    fn remove_waiter(&self, waiter: &Arc<EfwWaiter>) {
        self.inner
            .waiters
            .lock()
            .unwrap()
            .retain(|w| !Arc::ptr_eq(w, waiter));
    }

    /// Frames a request, writes it to the hwdep descriptor, and waits up to
    /// `timeout_ms` for the response carrying `request.seqnum + 1`. On
    /// success, `params_out` holds the decoded parameters and the returned
    /// count is their length.
    pub fn transact(
        &self,
        category: u32,
        command: u32,
        args: &[u32],
        params_out: &mut [u32],
        timeout_ms: u64,
    ) -> Result<usize> {
        let quadlets = hwdep::EFW_TRANSACTION_HEADER_QUADLETS + args.len();
        if quadlets * 4 > hwdep::EFW_MAXIMUM_FRAME_BYTES {
            return Err(Fw1394Error::Efw(EfwError::BadQuadCount));
        }

        let seqnum = next_seqnum(&self.inner.seqnum);
        let header = hwdep::EfwTransactionHeader {
            length: quadlets as u32,
            version: hwdep::EFW_MINIMUM_SUPPORTED_VERSION,
            seqnum,
            category,
            command,
            status: 0,
        };

        let mut frame = vec![0u8; quadlets * 4];
        header.write_be_bytes(&mut frame[..hwdep::EFW_TRANSACTION_HEADER_LEN]);
        for (i, arg) in args.iter().enumerate() {
            let off = hwdep::EFW_TRANSACTION_HEADER_LEN + i * 4;
            frame[off..off + 4].copy_from_slice(&arg.to_be_bytes());
        }

        let waiter = Arc::new(EfwWaiter::new(seqnum + 1));
        self.inner.waiters.lock().unwrap().push(waiter.clone());
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        if let Err(e) = nix::unistd::write(self.inner.fd.as_raw_fd(), &frame)
            .map_err(|e| Fw1394Error::io("write", e))
        {
            self.remove_waiter(&waiter);
            return Err(e);
        }

        let mut state = waiter.state.lock().unwrap();
        loop {
            if state.delivered {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (next, timeout_result) = waiter.condvar.wait_timeout(state, deadline - now).unwrap();
            state = next;
            if timeout_result.timed_out() && !state.delivered {
                break;
            }
        }
        let delivered = state.delivered;
        let version = state.version;
        let resp_category = state.category;
        let resp_command = state.command;
        let status = state.status;
        let params = std::mem::take(&mut state.params);
        drop(state);
        self.remove_waiter(&waiter);

        if !delivered {
            return Err(Fw1394Error::Efw(EfwError::Timeout));
        }
        if version < hwdep::EFW_MINIMUM_SUPPORTED_VERSION
            || resp_category != category
            || resp_command != command
        {
            return Err(Fw1394Error::Efw(EfwError::Bad));
        }
        if let Some(err) = EfwError::from_status(status) {
            return Err(Fw1394Error::Efw(err));
        }
        if params.len() > params_out.len() {
            return Err(Fw1394Error::Efw(EfwError::LargeResp));
        }
        params_out[..params.len()].copy_from_slice(&params);
        Ok(params.len())
    }

    /// Returns a pollable source for this node's hwdep event stream, mirroring
    /// [`crate::node::Node::create_event_source`]: this crate owns no thread,
    /// the caller integrates the descriptor into its own event loop.
    pub fn create_event_source(&self) -> EfwEventSource {
        EfwEventSource {
            node: self.clone(),
            buf: vec![0u8; hwdep::EFW_MAXIMUM_FRAME_BYTES + 4],
        }
    }
}

/// Outcome of one `dispatch_one` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EfwDispatchOutcome {
    /// One or more EFW response frames were read and routed (or dropped, if
    /// no waiter's sequence number matched).
    Routed,
    /// A non-EFW hwdep event was read and ignored (lock-status, vendor
    /// notifications — out of scope here).
    Ignored,
    WouldBlock,
}

/// A pollable event source for one [`EfwNode`].
pub struct EfwEventSource {
    node: EfwNode,
    buf: Vec<u8>,
}

impl AsRawFd for EfwEventSource {
    fn as_raw_fd(&self) -> RawFd {
        self.node.inner.fd.as_raw_fd()
    }
}

impl EfwEventSource {
    pub fn node(&self) -> &EfwNode {
        &self.node
    }

    pub fn dispatch_one(&mut self) -> Result<EfwDispatchOutcome> {
        let n = match nix::unistd::read(self.node.inner.fd.as_raw_fd(), &mut self.buf) {
            Ok(n) => n,
            Err(nix::Error::EAGAIN) => return Ok(EfwDispatchOutcome::WouldBlock),
            Err(e) => return Err(Fw1394Error::io("read", e)),
        };
        if n < 4 {
            return Ok(EfwDispatchOutcome::Ignored);
        }
        let event_type = u32::from_ne_bytes(self.buf[0..4].try_into().unwrap());
        if event_type != hwdep::SNDRV_FIREWIRE_EVENT_TYPE_EFW_RESPONSE {
            return Ok(EfwDispatchOutcome::Ignored);
        }

        let mut remaining = &self.buf[4..n];
        while remaining.len() >= hwdep::EFW_TRANSACTION_HEADER_LEN {
            let header = hwdep::EfwTransactionHeader::from_be_bytes(remaining);
            let quadlets = header.length as usize;
            // A frame claiming fewer quadlets than its own header, or more
            // than fit in what's left of the buffer, can't be trusted:
            // stop rather than misinterpret trailing bytes as another frame.
            if quadlets < hwdep::EFW_TRANSACTION_HEADER_QUADLETS {
                break;
            }
            let frame_bytes = quadlets * 4;
            if frame_bytes > remaining.len() {
                break;
            }

            let param_quads = quadlets - hwdep::EFW_TRANSACTION_HEADER_QUADLETS;
            let mut params = Vec::with_capacity(param_quads);
            for i in 0..param_quads {
                let off = hwdep::EFW_TRANSACTION_HEADER_LEN + i * 4;
                params.push(u32::from_be_bytes(
                    remaining[off..off + 4].try_into().unwrap(),
                ));
            }

            let waiters = self.node.inner.waiters.lock().unwrap();
            for w in waiters.iter() {
                if w.try_deliver(
                    header.seqnum,
                    header.version,
                    header.category,
                    header.command,
                    header.status,
                    &params,
                ) {
                    break;
                }
            }
            drop(waiters);

            remaining = &remaining[frame_bytes..];
        }
        Ok(EfwDispatchOutcome::Routed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqnum_steps_by_two() {
        let counter = Mutex::new(10u32);
        assert_eq!(next_seqnum(&counter), 10);
        assert_eq!(next_seqnum(&counter), 12);
        assert_eq!(*counter.lock().unwrap(), 14);
    }

    #[test]
    fn seqnum_wraps_past_max() {
        let counter = Mutex::new(hwdep::EFW_SEQNUM_MAX - 1);
        let issued = next_seqnum(&counter);
        assert_eq!(issued, hwdep::EFW_SEQNUM_MAX - 1);
        // (MAX - 1) + 2 > MAX, so the counter wraps to 0.
        assert_eq!(*counter.lock().unwrap(), 0);
    }

    #[test]
    fn waiter_only_accepts_its_own_seqnum() {
        let waiter = EfwWaiter::new(7);
        assert!(!waiter.try_deliver(6, 1, 0, 1, 0, &[]));
        assert!(waiter.try_deliver(7, 1, 0, 1, 0, &[0x11]));
        let state = waiter.state.lock().unwrap();
        assert!(state.delivered);
        assert_eq!(state.params, vec![0x11]);
    }

    #[test]
    fn header_round_trips_through_wire_bytes() {
        let header = hwdep::EfwTransactionHeader {
            length: 8,
            version: 1,
            seqnum: 42,
            category: 3,
            command: 5,
            status: 0,
        };
        let mut buf = vec![0u8; hwdep::EFW_TRANSACTION_HEADER_LEN];
        header.write_be_bytes(&mut buf);
        let decoded = hwdep::EfwTransactionHeader::from_be_bytes(&buf);
        assert_eq!(decoded.length, 8);
        assert_eq!(decoded.seqnum, 42);
        assert_eq!(decoded.category, 3);
        assert_eq!(decoded.command, 5);
    }
}
