// SPDX-License-Identifier: LGPL-2.1-or-later

//! Raw uAPI surface of the ALSA FireWire hwdep character device, as consumed
//! by the Echo Fireworks Transaction overlay. Mirrors
//! `include/uapi/sound/firewire.h`.

pub const SNDRV_FIREWIRE_IOC_MAGIC: u8 = b'H';

pub const SNDRV_FIREWIRE_TYPE_DICE: u32 = 1;
pub const SNDRV_FIREWIRE_TYPE_FIREWORKS: u32 = 2;

pub const SNDRV_FIREWIRE_EVENT_TYPE_EFW_RESPONSE: u32 = 0x4E61_7475;

pub const EFW_TRANSACTION_HEADER_QUADLETS: usize = 6;
pub const EFW_TRANSACTION_HEADER_LEN: usize = EFW_TRANSACTION_HEADER_QUADLETS * 4;
pub const EFW_MAXIMUM_FRAME_BYTES: usize = 0x200;
pub const EFW_MINIMUM_SUPPORTED_VERSION: u32 = 1;
pub const EFW_SEQNUM_MAX: u32 = 0xFFFE;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SndFirewireGetInfo {
    pub device_type: u32,
    pub card: i32,
    pub guid: [u8; 8],
    pub device_name: [u8; 16],
}

nix::ioctl_read!(
    get_info,
    SNDRV_FIREWIRE_IOC_MAGIC,
    0xf8,
    SndFirewireGetInfo
);

/// Quadlet-wise layout of an Echo Fireworks Transaction frame, big-endian on
/// the wire. `params` is variable-length; callers size the buffer to
/// `EFW_MAXIMUM_FRAME_BYTES` and slice by the decoded `length`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EfwTransactionHeader {
    pub length: u32,
    pub version: u32,
    pub seqnum: u32,
    pub category: u32,
    pub command: u32,
    pub status: u32,
}

impl EfwTransactionHeader {
    pub fn from_be_bytes(buf: &[u8]) -> Self {
        let quad = |i: usize| {
            u32::from_be_bytes([buf[i * 4], buf[i * 4 + 1], buf[i * 4 + 2], buf[i * 4 + 3]])
        };
        Self {
            length: quad(0),
            version: quad(1),
            seqnum: quad(2),
            category: quad(3),
            command: quad(4),
            status: quad(5),
        }
    }

    pub fn write_be_bytes(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.version.to_be_bytes());
        buf[8..12].copy_from_slice(&self.seqnum.to_be_bytes());
        buf[12..16].copy_from_slice(&self.category.to_be_bytes());
        buf[16..20].copy_from_slice(&self.command.to_be_bytes());
        buf[20..24].copy_from_slice(&self.status.to_be_bytes());
    }
}
