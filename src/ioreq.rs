// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! I/O request types and the request-slot ABI shared with the device model.

use std::cell::UnsafeCell;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use log::error;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

/// Direction of a guest I/O access.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    fn to_wire(self) -> u32 {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }

    fn from_wire(raw: u32) -> Direction {
        if raw == 1 {
            Direction::Write
        } else {
            Direction::Read
        }
    }
}

/// A port-I/O access. `size` is 1, 2 or 4; `value` carries the low
/// `8 * size` bits of the data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PioRequest {
    pub direction: Direction,
    pub port: u16,
    pub size: u32,
    pub value: u32,
}

impl PioRequest {
    /// Mask covering the low `8 * size` bits of the access.
    pub fn access_mask(&self) -> u32 {
        match self.size {
            1 => 0xff,
            2 => 0xffff,
            _ => 0xffff_ffff,
        }
    }
}

/// A PCI configuration-space access, produced when the device model turns a
/// 0xcf8/0xcfc port access into a typed config request. Dispatch never
/// originates these; only the completion path sees them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PciConfigRequest {
    pub direction: Direction,
    pub bus: u32,
    pub dev: u32,
    pub func: u32,
    pub reg: u32,
    pub size: u32,
    pub value: u32,
}

impl PciConfigRequest {
    pub fn access_mask(&self) -> u32 {
        match self.size {
            1 => 0xff,
            2 => 0xffff,
            _ => 0xffff_ffff,
        }
    }
}

/// An MMIO access on a guest-physical address. `size` is 1, 2, 4 or 8.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MmioRequest {
    pub direction: Direction,
    pub address: u64,
    pub size: u32,
    pub value: u64,
}

impl MmioRequest {
    pub fn access_mask(&self) -> u64 {
        if self.size >= 8 {
            u64::MAX
        } else {
            (1u64 << (8 * self.size)) - 1
        }
    }
}

/// A single in-flight I/O request owned by a vCPU between the exit that
/// produced it and the resume that consumes its result.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoRequest {
    PortIo(PioRequest),
    PciConfig(PciConfigRequest),
    Mmio(MmioRequest),
    /// A write-protection violation, dispatched like MMIO. Always a write,
    /// so it never needs post-work.
    WriteProtect(MmioRequest),
}

/// Request type tag in a shared slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, enumn::N)]
#[repr(u32)]
pub enum VhmRequestKind {
    PortIo = 0,
    PciConfig = 1,
    Mmio = 2,
    WriteProtect = 3,
}

/// Slot carries no in-flight request; the hypervisor may fill it.
pub const REQ_STATE_FREE: u32 = 0;
/// Request posted, waiting on the device model.
pub const REQ_STATE_PENDING: u32 = 1;
/// Device model wrote the result; waiting on the hypervisor to consume it.
pub const REQ_STATE_COMPLETE: u32 = 2;

/// Wire form of a port-I/O request. The first 28 bytes are the common
/// request prefix also used by [`PciPayload`].
#[derive(Copy, Clone, Debug, Default, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct PioPayload {
    pub direction: u32,
    pub _reserved: u32,
    pub address: u64,
    pub size: u64,
    pub value: u32,
    pub _pad: u32,
}

/// Wire form of a PCI config request; shares its first 28 bytes with
/// [`PioPayload`].
#[derive(Copy, Clone, Debug, Default, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct PciPayload {
    pub direction: u32,
    pub _reserved: u32,
    pub address: u64,
    pub size: u64,
    pub value: u32,
    pub bus: u32,
    pub dev: u32,
    pub func: u32,
    pub reg: u32,
    pub _pad: u32,
}

/// Wire form of an MMIO or write-protect request.
#[derive(Copy, Clone, Debug, Default, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct MmioPayload {
    pub direction: u32,
    pub _reserved: u32,
    pub address: u64,
    pub size: u64,
    pub value: u64,
}

const PAYLOAD_SIZE: usize = 48;

#[derive(Copy, Clone)]
#[repr(C)]
union RequestPayload {
    pio: PioPayload,
    pci: PciPayload,
    mmio: MmioPayload,
    bytes: [u8; PAYLOAD_SIZE],
}

/// One request slot of the ring shared with the device model. The layout is
/// part of the ABI:
///
/// ```text
/// offset  0: kind      u32
/// offset  4: vcpu      u32
/// offset  8: payload   48 bytes (PioPayload / PciPayload / MmioPayload)
/// offset 56: valid     u32
/// offset 60: processed u32
/// ```
///
/// `processed` moves through FREE -> PENDING -> COMPLETE -> FREE. The
/// hypervisor stores FREE and PENDING, the device model stores COMPLETE;
/// both sides pair release stores with acquire loads so the payload bytes
/// written before a transition are visible after it is observed.
#[repr(C)]
pub struct VhmRequestSlot {
    kind: AtomicU32,
    vcpu: AtomicU32,
    payload: UnsafeCell<RequestPayload>,
    valid: AtomicU32,
    processed: AtomicU32,
}

// SAFETY: the payload cell is only written by the side that currently owns
// the slot, and ownership is handed over exclusively through the acquire/
// release transitions of `processed`.
unsafe impl Sync for VhmRequestSlot {}

impl VhmRequestSlot {
    fn new() -> VhmRequestSlot {
        VhmRequestSlot {
            kind: AtomicU32::new(0),
            vcpu: AtomicU32::new(0),
            payload: UnsafeCell::new(RequestPayload {
                bytes: [0; PAYLOAD_SIZE],
            }),
            valid: AtomicU32::new(0),
            processed: AtomicU32::new(REQ_STATE_FREE),
        }
    }

    /// Returns the request type tag, if the slot holds a recognized one.
    pub fn kind(&self) -> Option<VhmRequestKind> {
        VhmRequestKind::n(self.kind.load(Ordering::Relaxed))
    }

    /// Id of the vCPU owning this slot's in-flight request.
    pub fn vcpu(&self) -> u32 {
        self.vcpu.load(Ordering::Relaxed)
    }

    /// Whether the slot carries an in-flight request.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed) != 0
    }

    /// Current lifecycle state, with acquire semantics so the payload
    /// written before the observed transition is visible.
    pub fn state(&self) -> u32 {
        self.processed.load(Ordering::Acquire)
    }

    /// Posts `req` into the slot and publishes it to the device model.
    pub(crate) fn post(&self, vcpu_id: u32, req: &IoRequest) {
        let state = self.processed.load(Ordering::Acquire);
        if state != REQ_STATE_FREE {
            error!(
                "vcpu{}: posting request into a slot in state {}",
                vcpu_id, state
            );
            debug_assert_eq!(state, REQ_STATE_FREE);
        }

        let (kind, payload) = match req {
            IoRequest::PortIo(pio) => (
                VhmRequestKind::PortIo,
                RequestPayload {
                    pio: PioPayload {
                        direction: pio.direction.to_wire(),
                        address: u64::from(pio.port),
                        size: u64::from(pio.size),
                        value: pio.value,
                        ..Default::default()
                    },
                },
            ),
            IoRequest::PciConfig(pci) => (
                VhmRequestKind::PciConfig,
                RequestPayload {
                    pci: PciPayload {
                        direction: pci.direction.to_wire(),
                        size: u64::from(pci.size),
                        value: pci.value,
                        bus: pci.bus,
                        dev: pci.dev,
                        func: pci.func,
                        reg: pci.reg,
                        ..Default::default()
                    },
                },
            ),
            IoRequest::Mmio(mmio) => (VhmRequestKind::Mmio, Self::mmio_payload(mmio)),
            IoRequest::WriteProtect(mmio) => {
                (VhmRequestKind::WriteProtect, Self::mmio_payload(mmio))
            }
        };

        self.kind.store(kind as u32, Ordering::Relaxed);
        self.vcpu.store(vcpu_id, Ordering::Relaxed);
        // SAFETY: the slot is FREE, so the hypervisor owns the payload.
        unsafe {
            *self.payload.get() = payload;
        }
        self.valid.store(1, Ordering::Relaxed);
        self.processed.store(REQ_STATE_PENDING, Ordering::Release);
    }

    fn mmio_payload(mmio: &MmioRequest) -> RequestPayload {
        RequestPayload {
            mmio: MmioPayload {
                direction: mmio.direction.to_wire(),
                _reserved: 0,
                address: mmio.address,
                size: u64::from(mmio.size),
                value: mmio.value,
            },
        }
    }

    /// Device-model side: reconstructs the typed request held by the
    /// slot. Only meaningful while the slot is PENDING.
    pub fn request(&self) -> Option<IoRequest> {
        // SAFETY: the slot is PENDING, so the device model owns the payload.
        unsafe {
            let payload = &*self.payload.get();
            Some(match self.kind()? {
                VhmRequestKind::PortIo => IoRequest::PortIo(PioRequest {
                    direction: Direction::from_wire(payload.pio.direction),
                    port: payload.pio.address as u16,
                    size: payload.pio.size as u32,
                    value: payload.pio.value,
                }),
                VhmRequestKind::PciConfig => IoRequest::PciConfig(PciConfigRequest {
                    direction: Direction::from_wire(payload.pci.direction),
                    bus: payload.pci.bus,
                    dev: payload.pci.dev,
                    func: payload.pci.func,
                    reg: payload.pci.reg,
                    size: payload.pci.size as u32,
                    value: payload.pci.value,
                }),
                VhmRequestKind::Mmio => IoRequest::Mmio(Self::payload_mmio(payload)),
                VhmRequestKind::WriteProtect => {
                    IoRequest::WriteProtect(Self::payload_mmio(payload))
                }
            })
        }
    }

    fn payload_mmio(payload: &RequestPayload) -> MmioRequest {
        // SAFETY: callers hold payload ownership per the slot protocol.
        unsafe {
            MmioRequest {
                direction: Direction::from_wire(payload.mmio.direction),
                address: payload.mmio.address,
                size: payload.mmio.size as u32,
                value: payload.mmio.value,
            }
        }
    }

    /// Device-model side: stores the result `value` and publishes the
    /// COMPLETE transition. Only meaningful on a PENDING slot.
    pub fn complete_from_device_model(&self, value: u64) {
        // SAFETY: the slot is PENDING, so the device model owns the payload.
        unsafe {
            let payload = &mut *self.payload.get();
            match self.kind() {
                Some(VhmRequestKind::PortIo) | Some(VhmRequestKind::PciConfig) => {
                    payload.pio.value = value as u32;
                }
                Some(VhmRequestKind::Mmio) | Some(VhmRequestKind::WriteProtect) | None => {
                    payload.mmio.value = value;
                }
            }
        }
        self.processed.store(REQ_STATE_COMPLETE, Ordering::Release);
    }

    /// Reads the result value out of a COMPLETE slot.
    pub(crate) fn read_value(&self) -> u64 {
        // SAFETY: the slot is COMPLETE, so the hypervisor owns the payload.
        unsafe {
            let payload = &*self.payload.get();
            match self.kind() {
                Some(VhmRequestKind::PortIo) | Some(VhmRequestKind::PciConfig) => {
                    u64::from(payload.pio.value)
                }
                Some(VhmRequestKind::Mmio) | Some(VhmRequestKind::WriteProtect) | None => {
                    payload.mmio.value
                }
            }
        }
    }

    /// Returns the slot to the device model's free pool.
    pub(crate) fn release(&self) {
        self.valid.store(0, Ordering::Relaxed);
        self.processed.store(REQ_STATE_FREE, Ordering::Release);
    }
}

/// Number of request slots in one shared page, one per vCPU.
pub const VHM_REQUEST_SLOTS: usize = 64;

/// The page of request slots shared between the hypervisor and the device
/// model, indexed by vCPU id. Layout is ABI; both sides agree byte for
/// byte.
#[repr(C, align(4096))]
pub struct IoSharedPage {
    slots: [VhmRequestSlot; VHM_REQUEST_SLOTS],
}

const _: () = assert!(std::mem::size_of::<VhmRequestSlot>() == 64);
const _: () = assert!(std::mem::size_of::<IoSharedPage>() == 4096);

impl IoSharedPage {
    pub fn new() -> IoSharedPage {
        IoSharedPage {
            slots: std::array::from_fn(|_| VhmRequestSlot::new()),
        }
    }

    /// The slot owned by `vcpu_id`, or `None` when the id is outside the
    /// ring.
    pub fn slot(&self, vcpu_id: u32) -> Option<&VhmRequestSlot> {
        self.slots.get(vcpu_id as usize)
    }
}

impl Default for IoSharedPage {
    fn default() -> IoSharedPage {
        IoSharedPage::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_prefix_shared_between_pio_and_pci() {
        let pio = PioPayload {
            direction: 0,
            _reserved: 0,
            address: 0xcf8,
            size: 4,
            value: 0x8000_1000,
            _pad: 0,
        };
        let pci = PciPayload {
            direction: 0,
            _reserved: 0,
            address: 0xcf8,
            size: 4,
            value: 0x8000_1000,
            bus: 0,
            dev: 3,
            func: 0,
            reg: 0x10,
            _pad: 0,
        };
        assert_eq!(&pio.as_bytes()[..28], &pci.as_bytes()[..28]);
    }

    #[test]
    fn payload_sizes() {
        assert_eq!(std::mem::size_of::<PioPayload>(), 32);
        assert_eq!(std::mem::size_of::<PciPayload>(), 48);
        assert_eq!(std::mem::size_of::<MmioPayload>(), 32);
    }

    #[test]
    fn slot_lifecycle() {
        let slot = VhmRequestSlot::new();
        assert_eq!(slot.state(), REQ_STATE_FREE);
        assert!(!slot.is_valid());

        let req = IoRequest::PortIo(PioRequest {
            direction: Direction::Read,
            port: 0x3f8,
            size: 1,
            value: 0,
        });
        slot.post(7, &req);
        assert_eq!(slot.state(), REQ_STATE_PENDING);
        assert!(slot.is_valid());
        assert_eq!(slot.vcpu(), 7);
        assert_eq!(slot.kind(), Some(VhmRequestKind::PortIo));
        assert_eq!(slot.request(), Some(req));

        slot.complete_from_device_model(0x42);
        assert_eq!(slot.state(), REQ_STATE_COMPLETE);
        assert_eq!(slot.read_value(), 0x42);

        slot.release();
        assert_eq!(slot.state(), REQ_STATE_FREE);
        assert!(!slot.is_valid());
    }

    #[test]
    fn slot_mmio_value_width() {
        let slot = VhmRequestSlot::new();
        let req = IoRequest::Mmio(MmioRequest {
            direction: Direction::Read,
            address: 0xfee0_0020,
            size: 8,
            value: 0,
        });
        slot.post(0, &req);
        slot.complete_from_device_model(0xdead_beef_0bad_f00d);
        assert_eq!(slot.read_value(), 0xdead_beef_0bad_f00d);
    }

    #[test]
    fn access_masks() {
        let mut pio = PioRequest {
            direction: Direction::Read,
            port: 0,
            size: 1,
            value: 0,
        };
        assert_eq!(pio.access_mask(), 0xff);
        pio.size = 2;
        assert_eq!(pio.access_mask(), 0xffff);
        pio.size = 4;
        assert_eq!(pio.access_mask(), 0xffff_ffff);

        let mut mmio = MmioRequest {
            direction: Direction::Read,
            address: 0,
            size: 4,
            value: 0,
        };
        assert_eq!(mmio.access_mask(), 0xffff_ffff);
        mmio.size = 8;
        assert_eq!(mmio.access_mask(), u64::MAX);
    }
}
