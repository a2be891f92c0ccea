// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MMIO handler table.

use std::sync::Arc;

use log::error;
use parking_lot::Mutex;

use crate::ioreq::MmioRequest;
use crate::Error;
use crate::Result;

/// A device that emulates accesses on a guest-physical address range.
///
/// The handler owns whatever context it needs; on reads it populates
/// `req.value`.
pub trait MmioDevice: Send {
    /// Returns a label suitable for debug output.
    fn debug_label(&self) -> String;
    /// Emulates one access inside the registered range.
    fn mmio_access(&mut self, req: &mut MmioRequest) -> Result<()>;
}

/// Half-open guest-physical range `[start, end)` occupied by one handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MmioRange {
    pub start: u64,
    pub end: u64,
}

impl MmioRange {
    /// Returns true if there is overlap with the given range.
    pub fn overlaps(&self, other: &MmioRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

struct MmioEntry {
    range: MmioRange,
    device: Arc<Mutex<dyn MmioDevice>>,
}

/// Ordered table of MMIO handlers for one VM. New handlers are appended;
/// dispatch takes the first handler fully covering the access.
pub(crate) struct MmioBus {
    entries: Mutex<Vec<MmioEntry>>,
}

impl MmioBus {
    pub fn new() -> MmioBus {
        MmioBus {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Appends `device` for `[start, end)`. Ranges of distinct handlers
    /// must stay disjoint.
    pub fn insert(&self, device: Arc<Mutex<dyn MmioDevice>>, start: u64, end: u64) -> Result<()> {
        if end <= start {
            return Err(Error::Invalid);
        }
        let range = MmioRange { start, end };
        let mut entries = self.entries.lock();
        if let Some(other) = entries.iter().find(|e| e.range.overlaps(&range)) {
            error!(
                "mmio: range {:#x}..{:#x} overlaps {} at {:#x}..{:#x}",
                start,
                end,
                other.device.lock().debug_label(),
                other.range.start,
                other.range.end,
            );
            return Err(Error::Invalid);
        }
        entries.push(MmioEntry { range, device });
        Ok(())
    }

    /// Removes the first handler registered with exactly `[start, end)`.
    pub fn remove(&self, start: u64, end: u64) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries
            .iter()
            .position(|e| e.range.start == start && e.range.end == end)
        {
            entries.remove(pos);
        }
    }

    /// Finds the handler fully covering the access, without holding the
    /// table lock across the handler call.
    fn find(&self, address: u64, size: u64) -> Result<Arc<Mutex<dyn MmioDevice>>> {
        for entry in self.entries.lock().iter() {
            let base = entry.range.start;
            let end = entry.range.end;

            if address.saturating_add(size) <= base || address >= end {
                continue;
            }
            if !(address >= base && address.saturating_add(size) <= end) {
                error!("mmio: address {:#x} size {} spans devices", address, size);
                return Err(Error::SpanError { address, size });
            }
            return Ok(entry.device.clone());
        }
        Err(Error::NoDevice)
    }

    /// Tries to emulate `req` with a registered handler.
    pub fn emulate(&self, req: &mut MmioRequest) -> Result<()> {
        let device = self.find(req.address, u64::from(req.size))?;
        let mut device = device.lock();
        device.mmio_access(req)
    }
}
