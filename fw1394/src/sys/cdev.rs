// SPDX-License-Identifier: LGPL-2.1-or-later

//! Raw uAPI surface of the Linux `firewire-cdev` character device.
//!
//! Struct layouts and ioctl numbers mirror `include/uapi/linux/firewire-cdev.h`.
//! Only the subset used by [`crate::node::Node`], [`crate::request`], and
//! [`crate::responder::Responder`] is declared; isochronous and PHY-packet
//! ioctls are out of scope.

use libc::{c_int, c_long};

pub const FW_CDEV_IOC_MAGIC: u8 = b'#';

/// Interface version implemented by this crate. `FW_CDEV_VERSION` 6 adds
/// `fw_cdev_event_request3`/`fw_cdev_event_response2` and `region_end` on
/// `fw_cdev_allocate`; version 4 is the minimum fallback understood here.
pub const FW_CDEV_VERSION: u32 = 6;
pub const FW_CDEV_VERSION_FALLBACK: u32 = 4;

pub const MAX_CONFIG_ROM_QUADLETS: usize = 256;
pub const MAX_CONFIG_ROM_LEN: usize = MAX_CONFIG_ROM_QUADLETS * 4;

// Transaction codes (IEEE 1394 tcode, plus the kernel/hinawa convention of
// flattening the six lock subtypes into distinct tcode-shaped constants).
pub const TCODE_WRITE_QUADLET_REQUEST: u32 = 0;
pub const TCODE_WRITE_BLOCK_REQUEST: u32 = 1;
pub const TCODE_WRITE_RESPONSE: u32 = 2;
pub const TCODE_READ_QUADLET_REQUEST: u32 = 4;
pub const TCODE_READ_BLOCK_REQUEST: u32 = 5;
pub const TCODE_READ_QUADLET_RESPONSE: u32 = 6;
pub const TCODE_READ_BLOCK_RESPONSE: u32 = 7;
pub const TCODE_LOCK_REQUEST: u32 = 9;
pub const TCODE_LOCK_RESPONSE: u32 = 11;
pub const TCODE_LOCK_MASK_SWAP: u32 = 0x11;
pub const TCODE_LOCK_COMPARE_SWAP: u32 = 0x12;
pub const TCODE_LOCK_FETCH_ADD: u32 = 0x13;
pub const TCODE_LOCK_LITTLE_ADD: u32 = 0x14;
pub const TCODE_LOCK_BOUNDED_ADD: u32 = 0x15;
pub const TCODE_LOCK_WRAP_ADD: u32 = 0x16;
pub const TCODE_LOCK_VENDOR_DEPENDENT: u32 = 0x17;

// Response codes (IEEE 1394 rcode, extended with the kernel's local codes).
pub const RCODE_COMPLETE: u32 = 0x00;
pub const RCODE_CONFLICT_ERROR: u32 = 0x04;
pub const RCODE_DATA_ERROR: u32 = 0x05;
pub const RCODE_TYPE_ERROR: u32 = 0x06;
pub const RCODE_ADDRESS_ERROR: u32 = 0x07;
pub const RCODE_SEND_ERROR: u32 = 0x10;
pub const RCODE_CANCELLED: u32 = 0x11;
pub const RCODE_BUSY: u32 = 0x12;
pub const RCODE_GENERATION: u32 = 0x13;
pub const RCODE_NO_ACK: u32 = 0x14;

// Event types, as returned in `fw_cdev_event_common.type`.
pub const FW_CDEV_EVENT_BUS_RESET: u32 = 0x00;
pub const FW_CDEV_EVENT_RESPONSE: u32 = 0x01;
pub const FW_CDEV_EVENT_REQUEST: u32 = 0x02;
pub const FW_CDEV_EVENT_REQUEST2: u32 = 0x06;
pub const FW_CDEV_EVENT_RESPONSE2: u32 = 0x0b;
pub const FW_CDEV_EVENT_REQUEST3: u32 = 0x0a;

pub const SENTINEL_U32: u32 = u32::MAX;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FwCdevGetInfo {
    pub version: u32,
    pub rom_length: u32,
    pub rom: u64,
    pub bus_reset: u64,
    pub bus_reset_closure: u64,
    pub card: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FwCdevEventBusReset {
    pub closure: u64,
    pub event_type: u32,
    pub node_id: u32,
    pub local_node_id: u32,
    pub bm_node_id: u32,
    pub irm_node_id: u32,
    pub root_node_id: u32,
    pub generation: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FwCdevSendRequest {
    pub tcode: u32,
    pub length: u32,
    pub offset: u64,
    pub closure: u64,
    pub data: u64,
    pub generation: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FwCdevSendResponse {
    pub rcode: u32,
    pub length: u32,
    pub data: u64,
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FwCdevAllocate {
    pub offset: u64,
    pub closure: u64,
    pub length: u32,
    pub handle: u32,
    pub region_end: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FwCdevDeallocate {
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FwCdevGetCycleTimer2 {
    pub clk_id: c_int,
    pub tv_sec: c_long,
    pub tv_nsec: c_int,
    pub cycle_timer: u32,
}

/// Fixed-header prefix shared by every event variant. The kernel writes a
/// variable-length event per `read(2)`; callers read into a page-sized
/// buffer and reinterpret the header to dispatch, then reinterpret the full
/// variant once the type is known (mirrors `union fw_cdev_event` in the
/// kernel header, which Rust has no direct analogue for).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FwCdevEventCommon {
    pub closure: u64,
    pub event_type: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FwCdevEventResponseHeader {
    pub closure: u64,
    pub event_type: u32,
    pub rcode: u32,
    pub length: u32,
    // followed by `length` bytes of response payload
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FwCdevEventResponse2Header {
    pub closure: u64,
    pub event_type: u32,
    pub rcode: u32,
    pub length: u32,
    pub request_tstamp: u32,
    pub response_tstamp: u32,
    // followed by `length` bytes of response payload
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FwCdevEventRequestHeader {
    pub closure: u64,
    pub event_type: u32,
    pub tcode: u32,
    pub offset: u64,
    pub handle: u32,
    pub length: u32,
    // followed by `length` bytes of request payload
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FwCdevEventRequest2Header {
    pub closure: u64,
    pub event_type: u32,
    pub tcode: u32,
    pub offset: u64,
    pub source_node_id: u32,
    pub destination_node_id: u32,
    pub card: u32,
    pub generation: u32,
    pub handle: u32,
    pub length: u32,
    // followed by `length` bytes of request payload
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FwCdevEventRequest3Header {
    pub closure: u64,
    pub event_type: u32,
    pub tcode: u32,
    pub offset: u64,
    pub source_node_id: u32,
    pub destination_node_id: u32,
    pub card: u32,
    pub generation: u32,
    pub handle: u32,
    pub length: u32,
    pub tstamp: u32,
    // followed by `length` bytes of request payload
}

nix::ioctl_readwrite!(get_info, FW_CDEV_IOC_MAGIC, 0x00, FwCdevGetInfo);
nix::ioctl_write_ptr!(send_request, FW_CDEV_IOC_MAGIC, 0x01, FwCdevSendRequest);
nix::ioctl_readwrite!(allocate, FW_CDEV_IOC_MAGIC, 0x02, FwCdevAllocate);
nix::ioctl_write_ptr!(deallocate, FW_CDEV_IOC_MAGIC, 0x03, FwCdevDeallocate);
nix::ioctl_write_ptr!(send_response, FW_CDEV_IOC_MAGIC, 0x04, FwCdevSendResponse);
nix::ioctl_readwrite!(
    get_cycle_timer2,
    FW_CDEV_IOC_MAGIC,
    0x14,
    FwCdevGetCycleTimer2
);
