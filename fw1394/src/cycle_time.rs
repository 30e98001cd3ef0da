// SPDX-License-Identifier: LGPL-2.1-or-later

//! Pure decoding of the 1394 OHCI `CYCLE_TIME` register and of the 16-bit
//! timestamps OHCI attaches to AT/AR/IT/IR contexts (`cycle_time.c`). No
//! I/O; [`Node::read_cycle_time`](crate::node::Node::read_cycle_time) is the
//! only caller that performs a syscall, via `FW_CDEV_IOC_GET_CYCLE_TIMER2`.

const IEEE1394_CYCLE_TIME_SEC_SHIFT: u32 = 25;
const IEEE1394_CYCLE_TIME_SEC_MASK: u32 = 0xfe00_0000;
const IEEE1394_CYCLE_TIME_CYCLE_SHIFT: u32 = 12;
const IEEE1394_CYCLE_TIME_CYCLE_MASK: u32 = 0x01ff_f000;
const IEEE1394_CYCLE_TIME_OFFSET_MASK: u32 = 0x0000_0fff;

const OHCI1394_TSTAMP_SEC_SHIFT: u32 = 13;
const OHCI1394_TSTAMP_SEC_MASK: u32 = 0x0000_e000;
const OHCI1394_TSTAMP_CYCLE_MASK: u32 = 0x0000_1fff;

const IEEE1394_SEC_MAX: u32 = 128;
const OHCI1394_SEC_MAX: u32 = 8;

/// Three fields of the IEEE 1394 `CYCLE_TIME` register: `sec` (0..=127),
/// `cycle` (0..=7999), `offset` (0..=3071).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTimeFields {
    pub sec: u16,
    pub cycle: u16,
    pub offset: u16,
}

/// A sample of the 1394 OHCI `CYCLE_TIME` register plus the host-side
/// timestamp the kernel took it under (`FW_CDEV_IOC_GET_CYCLE_TIMER2`
/// result, `HinawaCycleTime` in the source).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTime {
    pub clock_id: i32,
    pub tv_sec: i64,
    pub tv_nsec: i32,
    pub cycle_timer: u32,
}

impl CycleTime {
    pub fn fields(&self) -> CycleTimeFields {
        CycleTimeFields {
            sec: ieee1394_sec(self.cycle_timer) as u16,
            cycle: ieee1394_cycle(self.cycle_timer) as u16,
            offset: (self.cycle_timer & IEEE1394_CYCLE_TIME_OFFSET_MASK) as u16,
        }
    }

    pub fn raw(&self) -> u32 {
        self.cycle_timer
    }

    /// Reconstructs the full `(sec, cycle)` pair from a 16-bit OHCI context
    /// timestamp, by extending the timestamp's 3-bit `sec_low` against this
    /// register's full 7-bit `sec` field. Valid when the timestamp was
    /// captured within 8 seconds of this sample (`hinawa_cycle_time_compute_tstamp`).
    pub fn compute_tstamp(&self, tstamp: u32) -> (u16, u16) {
        let tstamp_sec_low = (tstamp & OHCI1394_TSTAMP_SEC_MASK) >> OHCI1394_TSTAMP_SEC_SHIFT;
        let curr_sec_low = ieee1394_sec(self.cycle_timer) & 0x7;
        let mut sec = ieee1394_sec(self.cycle_timer);

        if tstamp_sec_low < curr_sec_low {
            sec += OHCI1394_SEC_MAX;
        }
        sec = (sec & !0x7) | tstamp_sec_low;
        sec %= IEEE1394_SEC_MAX;

        let cycle = tstamp & OHCI1394_TSTAMP_CYCLE_MASK;
        (sec as u16, cycle as u16)
    }
}

fn ieee1394_sec(cycle_time: u32) -> u32 {
    (cycle_time & IEEE1394_CYCLE_TIME_SEC_MASK) >> IEEE1394_CYCLE_TIME_SEC_SHIFT
}

fn ieee1394_cycle(cycle_time: u32) -> u32 {
    (cycle_time & IEEE1394_CYCLE_TIME_CYCLE_MASK) >> IEEE1394_CYCLE_TIME_CYCLE_SHIFT
}

/// Parses the raw 3-bit `sec_low`/13-bit `cycle` pair out of an OHCI context
/// timestamp without reconstructing the full second count
/// (`hinawa_cycle_time_parse_tstamp`). Distinct from
/// [`CycleTime::compute_tstamp`], which needs a register sample to extend
/// `sec_low` to the full 7-bit second.
pub fn parse_tstamp_low(tstamp: u32) -> (u16, u16) {
    let sec_low = (tstamp & OHCI1394_TSTAMP_SEC_MASK) >> OHCI1394_TSTAMP_SEC_SHIFT;
    let cycle = tstamp & OHCI1394_TSTAMP_CYCLE_MASK;
    (sec_low as u16, cycle as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cycle_timer(sec: u32, cycle: u32, offset: u32) -> u32 {
        (sec << IEEE1394_CYCLE_TIME_SEC_SHIFT)
            | (cycle << IEEE1394_CYCLE_TIME_CYCLE_SHIFT)
            | offset
    }

    #[test]
    fn fields_roundtrip() {
        let ct = CycleTime {
            clock_id: 1,
            tv_sec: 0,
            tv_nsec: 0,
            cycle_timer: make_cycle_timer(100, 1234, 42),
        };
        let fields = ct.fields();
        assert_eq!(fields.sec, 100);
        assert_eq!(fields.cycle, 1234);
        assert_eq!(fields.offset, 42);
    }

    #[test]
    fn compute_tstamp_within_window_no_wrap() {
        // current sec=10 (low 3 bits = 2), tstamp sec_low=2 -> no wraparound
        let ct = CycleTime {
            clock_id: 1,
            tv_sec: 0,
            tv_nsec: 0,
            cycle_timer: make_cycle_timer(10, 0, 0),
        };
        let tstamp = (2u32 << OHCI1394_TSTAMP_SEC_SHIFT) | 500;
        let (sec, cycle) = ct.compute_tstamp(tstamp);
        assert_eq!(sec, 10);
        assert_eq!(cycle, 500);
    }

    #[test]
    fn compute_tstamp_rounds_up_on_wrap() {
        // current sec=8 (low 3 bits = 0), tstamp sec_low=7 implies the
        // timestamp was taken just before the low-order bits wrapped.
        let ct = CycleTime {
            clock_id: 1,
            tv_sec: 0,
            tv_nsec: 0,
            cycle_timer: make_cycle_timer(8, 0, 0),
        };
        let tstamp = 7u32 << OHCI1394_TSTAMP_SEC_SHIFT;
        let (sec, _cycle) = ct.compute_tstamp(tstamp);
        assert_eq!(sec, 15);
    }

    #[test]
    fn compute_tstamp_wraps_mod_128() {
        let ct = CycleTime {
            clock_id: 1,
            tv_sec: 0,
            tv_nsec: 0,
            cycle_timer: make_cycle_timer(127, 0, 0),
        };
        // low 3 bits of 127 = 7; tstamp sec_low=7 matches, no round-up.
        let tstamp = 7u32 << OHCI1394_TSTAMP_SEC_SHIFT;
        let (sec, _) = ct.compute_tstamp(tstamp);
        assert_eq!(sec, 127);
    }

    #[test]
    fn parse_tstamp_low_matches_compute_low_bits() {
        let tstamp = (5u32 << OHCI1394_TSTAMP_SEC_SHIFT) | 333;
        let (sec_low, cycle) = parse_tstamp_low(tstamp);
        assert_eq!(sec_low, 5);
        assert_eq!(cycle, 333);
    }
}
