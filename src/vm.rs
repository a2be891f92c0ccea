// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-VM slice of guest I/O emulation state.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::error;
use parking_lot::Mutex;

use crate::emulate::InstructionEmulator;
use crate::ioreq::IoSharedPage;
use crate::mmio::MmioBus;
use crate::mmio::MmioDevice;
use crate::pio::IoBitmap;
use crate::pio::PioBus;
use crate::pio::PioRange;
use crate::pio::PortIoDevice;
use crate::vhm::DeviceModelChannel;
use crate::Result;

/// Second-level address-space operations the embedder provides. Removing a
/// range from the privileged guest's identity mapping makes subsequent
/// accesses trap as MMIO.
pub trait GuestAddressSpace: Send + Sync {
    fn unmap_range(&self, start: u64, len: u64);
}

/// Static configuration of a VM's I/O personality.
#[derive(Copy, Clone, Debug, Default)]
pub struct VmConfig {
    pub id: u32,
    /// The privileged guest hosts the device model and sees pass-through
    /// I/O ports by default.
    pub privileged: bool,
    /// In the partitioned configuration there is no device model;
    /// unclaimed reads float high and unclaimed writes are dropped.
    pub partition_mode: bool,
}

/// The I/O state owned by one VM: both handler tables, the port trap
/// bitmap, and the request ring shared with the device model.
pub struct Vm {
    config: VmConfig,
    pub(crate) pio_bus: PioBus,
    pub(crate) mmio_bus: MmioBus,
    io_bitmap: Mutex<Option<IoBitmap>>,
    shared_page: Mutex<Option<Arc<IoSharedPage>>>,
    address_space: Mutex<Option<Arc<dyn GuestAddressSpace>>>,
    insn_emulator: Mutex<Option<Arc<dyn InstructionEmulator>>>,
    dm_channel: Mutex<Option<Arc<dyn DeviceModelChannel>>>,
    vcpu_launched: AtomicBool,
}

impl Vm {
    pub fn new(config: VmConfig) -> Vm {
        Vm {
            config,
            pio_bus: PioBus::new(),
            mmio_bus: MmioBus::new(),
            io_bitmap: Mutex::new(None),
            shared_page: Mutex::new(None),
            address_space: Mutex::new(None),
            insn_emulator: Mutex::new(None),
            dm_channel: Mutex::new(None),
            vcpu_launched: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.config.id
    }

    pub fn is_privileged(&self) -> bool {
        self.config.privileged
    }

    pub fn partition_mode(&self) -> bool {
        self.config.partition_mode
    }

    /// Allocates the two trap bitmap pages: all pass-through for the
    /// privileged guest, all trapped for anyone else.
    pub fn setup_io_bitmap(&self) {
        *self.io_bitmap.lock() = Some(IoBitmap::new(!self.config.privileged));
    }

    /// Attaches the request ring shared with the device model.
    pub fn set_io_shared_page(&self, page: Arc<IoSharedPage>) {
        *self.shared_page.lock() = Some(page);
    }

    pub fn io_shared_page(&self) -> Option<Arc<IoSharedPage>> {
        self.shared_page.lock().clone()
    }

    pub fn set_address_space(&self, space: Arc<dyn GuestAddressSpace>) {
        *self.address_space.lock() = Some(space);
    }

    pub fn set_instruction_emulator(&self, emulator: Arc<dyn InstructionEmulator>) {
        *self.insn_emulator.lock() = Some(emulator);
    }

    pub(crate) fn instruction_emulator(&self) -> Option<Arc<dyn InstructionEmulator>> {
        self.insn_emulator.lock().clone()
    }

    pub fn set_device_model_channel(&self, channel: Arc<dyn DeviceModelChannel>) {
        *self.dm_channel.lock() = Some(channel);
    }

    pub(crate) fn device_model_channel(&self) -> Option<Arc<dyn DeviceModelChannel>> {
        self.dm_channel.lock().clone()
    }

    pub(crate) fn mark_vcpu_launched(&self) {
        self.vcpu_launched.store(true, Ordering::Relaxed);
    }

    /// Registers a port-I/O handler for `range` and, on the privileged
    /// guest, flips the covered ports from pass-through to trapping.
    pub fn register_pio_handler(
        &self,
        range: PioRange,
        device: Arc<Mutex<dyn PortIoDevice>>,
    ) -> Result<()> {
        self.pio_bus.insert(device, range)?;
        if self.config.privileged {
            self.deny_io_access(range.base, u32::from(range.len));
        }
        Ok(())
    }

    /// Registers an MMIO handler for `[start, end)` and, on the privileged
    /// guest, unmaps the range so accesses start trapping. Must not be
    /// called once a vCPU of this VM has launched.
    pub fn register_mmio_handler(
        &self,
        device: Arc<Mutex<dyn MmioDevice>>,
        start: u64,
        end: u64,
    ) -> Result<()> {
        debug_assert!(
            !self.vcpu_launched.load(Ordering::Relaxed),
            "mmio handler registered after vm launch"
        );
        self.mmio_bus.insert(device, start, end)?;
        if self.config.privileged {
            if let Some(space) = &*self.address_space.lock() {
                space.unmap_range(start, end - start);
            }
        }
        Ok(())
    }

    /// Removes the MMIO handler registered with exactly `[start, end)`.
    pub fn unregister_mmio_handler(&self, start: u64, end: u64) {
        self.mmio_bus.remove(start, end);
    }

    /// Clears `nbytes` trap bits starting at `port`.
    pub fn allow_io_access(&self, port: u16, nbytes: u32) {
        match &mut *self.io_bitmap.lock() {
            Some(bitmap) => bitmap.allow(port, nbytes),
            None => error!("vm{}: io bitmap not set up", self.config.id),
        }
    }

    /// Sets `nbytes` trap bits starting at `port`.
    pub fn deny_io_access(&self, port: u16, nbytes: u32) {
        match &mut *self.io_bitmap.lock() {
            Some(bitmap) => bitmap.deny(port, nbytes),
            None => error!("vm{}: io bitmap not set up", self.config.id),
        }
    }

    /// Whether an access to `port` currently traps. False when the bitmap
    /// has not been set up or was freed.
    pub fn io_access_trapped(&self, port: u16) -> bool {
        self.io_bitmap
            .lock()
            .as_ref()
            .map_or(false, |bitmap| bitmap.is_trapped(port))
    }

    /// Tears down the port-I/O handler table and releases both bitmap
    /// pages.
    pub fn free_io_emulation_resource(&self) {
        self.pio_bus.clear();
        *self.io_bitmap.lock() = None;
    }
}
