// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Port-I/O handler table and the hardware trap bitmap.

use std::sync::Arc;

use log::debug;
use log::error;
use parking_lot::Mutex;

use crate::ioreq::Direction;
use crate::ioreq::PioRequest;
use crate::Error;
use crate::Result;

/// A device that emulates accesses on a range of I/O ports.
pub trait PortIoDevice: Send {
    /// Returns a label suitable for debug output.
    fn debug_label(&self) -> String;
    /// Reads `size` bytes from `port`; the result is carried in the low
    /// `8 * size` bits.
    fn io_read(&mut self, port: u16, size: u32) -> u32;
    /// Writes the low `8 * size` bits of `value` to `port`.
    fn io_write(&mut self, port: u16, size: u32, value: u32);
}

/// A range of I/O ports occupied by one handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PioRange {
    pub base: u16,
    pub len: u16,
}

impl PioRange {
    fn end(&self) -> u32 {
        u32::from(self.base) + u32::from(self.len)
    }

    /// Returns true if there is overlap with the given range.
    pub fn overlaps(&self, other: &PioRange) -> bool {
        u32::from(self.base) < other.end() && u32::from(other.base) < self.end()
    }
}

struct PioEntry {
    range: PioRange,
    device: Arc<Mutex<dyn PortIoDevice>>,
}

/// Ordered table of port-I/O handlers for one VM. New handlers are
/// prepended; dispatch takes the first handler fully covering the access.
pub(crate) struct PioBus {
    entries: Mutex<Vec<PioEntry>>,
}

impl PioBus {
    pub fn new() -> PioBus {
        PioBus {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Puts `device` in front of the table for `range`. Ranges of distinct
    /// handlers must stay disjoint.
    pub fn insert(&self, device: Arc<Mutex<dyn PortIoDevice>>, range: PioRange) -> Result<()> {
        if range.len == 0 {
            return Err(Error::Invalid);
        }
        let mut entries = self.entries.lock();
        if let Some(other) = entries.iter().find(|e| e.range.overlaps(&range)) {
            error!(
                "pio: range {:#06x}+{:#x} overlaps {} at {:#06x}+{:#x}",
                range.base,
                range.len,
                other.device.lock().debug_label(),
                other.range.base,
                other.range.len,
            );
            return Err(Error::Invalid);
        }
        entries.insert(0, PioEntry { range, device });
        Ok(())
    }

    /// Drops every handler from the table.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Finds the handler fully covering the access, without holding the
    /// table lock across the handler call.
    fn find(&self, start: u32, last: u32) -> Result<Arc<Mutex<dyn PortIoDevice>>> {
        for entry in self.entries.lock().iter() {
            let base = u32::from(entry.range.base);
            let end = entry.range.end();

            if last <= base || start >= end {
                continue;
            }
            if !(start >= base && last <= end) {
                error!(
                    "pio: port {:#06x} size {} spans devices",
                    start,
                    last - start
                );
                return Err(Error::SpanError {
                    address: u64::from(start),
                    size: u64::from(last - start),
                });
            }
            return Ok(entry.device.clone());
        }
        Err(Error::NoDevice)
    }

    /// Tries to emulate `req` with a registered handler.
    pub fn emulate(&self, req: &mut PioRequest) -> Result<()> {
        let start = u32::from(req.port);
        let device = self.find(start, start + req.size)?;
        let mask = req.access_mask();

        let mut device = device.lock();
        match req.direction {
            Direction::Write => {
                device.io_write(req.port, req.size, req.value & mask);
                debug!(
                    "pio write on port {:#06x}, data {:#010x}",
                    req.port,
                    req.value & mask
                );
            }
            Direction::Read => {
                req.value = device.io_read(req.port, req.size);
                debug!(
                    "pio read on port {:#06x}, data {:#010x}",
                    req.port, req.value
                );
            }
        }
        Ok(())
    }
}

const IO_BITMAP_WORDS: usize = 1024;

/// The two-page port trap bitmap consumed by hardware during guest
/// execution: page A covers ports 0x0000-0x7fff, page B covers
/// 0x8000-0xffff. A set bit traps the access.
pub struct IoBitmap {
    a: Box<[u32; IO_BITMAP_WORDS]>,
    b: Box<[u32; IO_BITMAP_WORDS]>,
}

impl IoBitmap {
    /// Allocates both pages. The privileged guest starts with every port
    /// passed through; any other guest starts with every port trapped.
    pub fn new(default_trap: bool) -> IoBitmap {
        let fill = if default_trap { !0 } else { 0 };
        IoBitmap {
            a: Box::new([fill; IO_BITMAP_WORDS]),
            b: Box::new([fill; IO_BITMAP_WORDS]),
        }
    }

    fn word(&mut self, port: u32) -> (&mut u32, u32) {
        let page = if port & 0x8000 != 0 {
            &mut self.b
        } else {
            &mut self.a
        };
        let idx = port & 0x7fff;
        (&mut page[(idx >> 5) as usize], 1 << (idx & 0x1f))
    }

    /// Clears the trap bits for `nbytes` consecutive ports starting at
    /// `port`, letting the guest access them directly.
    pub fn allow(&mut self, port: u16, nbytes: u32) {
        for address in u32::from(port)..u32::from(port).saturating_add(nbytes) {
            if address > 0xffff {
                break;
            }
            let (word, bit) = self.word(address);
            *word &= !bit;
        }
    }

    /// Sets the trap bits for `nbytes` consecutive ports starting at
    /// `port`.
    pub fn deny(&mut self, port: u16, nbytes: u32) {
        for address in u32::from(port)..u32::from(port).saturating_add(nbytes) {
            if address > 0xffff {
                break;
            }
            let (word, bit) = self.word(address);
            *word |= bit;
        }
    }

    /// Whether an access to `port` traps.
    pub fn is_trapped(&self, port: u16) -> bool {
        let page = if port & 0x8000 != 0 { &self.b } else { &self.a };
        let idx = u32::from(port) & 0x7fff;
        page[(idx >> 5) as usize] & (1 << (idx & 0x1f)) != 0
    }
}
