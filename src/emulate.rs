// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The two-phase emulation pipeline: dispatch on exit, post-work on
//! completion.

use log::error;
use log::trace;

use crate::ioreq::Direction;
use crate::ioreq::IoRequest;
use crate::ioreq::MmioRequest;
use crate::ioreq::PioRequest;
use crate::ioreq::REQ_STATE_COMPLETE;
use crate::vcpu::Vcpu;
use crate::vcpu::VcpuState;
use crate::vhm::insert_request_wait;
use crate::Error;
use crate::IoStatus;
use crate::Result;

/// External instruction emulator, re-entered for MMIO-read post-work. By
/// the time it runs, `req.value` holds the data the handler or the device
/// model produced; the emulator moves it into the destination implied by
/// the decoded instruction.
pub trait InstructionEmulator: Send + Sync {
    fn decode_and_emulate(&self, vcpu: &Vcpu, req: &MmioRequest) -> Result<()>;
}

// VM-exit qualification layout for I/O instructions. Architectural.
const IO_INSTR_SIZE_MASK: u64 = 0x7;
const IO_INSTR_DIRECTION_IN: u64 = 1 << 3;
const IO_INSTR_PORT_SHIFT: u32 = 16;

pub(crate) fn exit_qual_access_size(qual: u64) -> u32 {
    ((qual & IO_INSTR_SIZE_MASK) + 1) as u32
}

pub(crate) fn exit_qual_direction(qual: u64) -> Direction {
    if qual & IO_INSTR_DIRECTION_IN != 0 {
        Direction::Read
    } else {
        Direction::Write
    }
}

pub(crate) fn exit_qual_port(qual: u64) -> u16 {
    (qual >> IO_INSTR_PORT_SHIFT) as u16
}

/// Routes `io_req` through the VM's handler tables.
///
/// Returns `Complete` when an in-hypervisor handler (or the partition-mode
/// dead-device fallback) finished the request, `Deferred` when it was
/// handed to the device model, and an error when no route can emulate it.
pub fn emulate_io(vcpu: &Vcpu, io_req: &mut IoRequest) -> Result<IoStatus> {
    let vm = vcpu.vm();
    let status = match io_req {
        IoRequest::PortIo(pio) => vm.pio_bus.emulate(pio),
        IoRequest::Mmio(mmio) | IoRequest::WriteProtect(mmio) => vm.mmio_bus.emulate(mmio),
        IoRequest::PciConfig(_) => return Err(Error::Invalid),
    };

    match status {
        Ok(()) => Ok(IoStatus::Complete),
        Err(Error::NoDevice) => {
            if vm.partition_mode() {
                // No device model to fall back on: reads float high,
                // writes are dropped.
                synthesize_dead_device(io_req);
                Ok(IoStatus::Complete)
            } else {
                match insert_request_wait(vcpu, io_req) {
                    Ok(()) => Ok(IoStatus::Deferred),
                    Err(e) => {
                        let (address, size) = request_location(io_req);
                        error!(
                            "failed to defer access at {:#x}, size {}: {}",
                            address, size, e
                        );
                        Err(e)
                    }
                }
            }
        }
        Err(e) => Err(e),
    }
}

fn request_location(io_req: &IoRequest) -> (u64, u32) {
    match io_req {
        IoRequest::PortIo(pio) => (u64::from(pio.port), pio.size),
        IoRequest::PciConfig(pci) => (u64::from(pci.reg), pci.size),
        IoRequest::Mmio(mmio) | IoRequest::WriteProtect(mmio) => (mmio.address, mmio.size),
    }
}

fn synthesize_dead_device(io_req: &mut IoRequest) {
    match io_req {
        IoRequest::PortIo(pio) => {
            if pio.direction == Direction::Read {
                pio.value = pio.access_mask();
            }
        }
        IoRequest::PciConfig(pci) => {
            if pci.direction == Direction::Read {
                pci.value = pci.access_mask();
            }
        }
        IoRequest::Mmio(mmio) | IoRequest::WriteProtect(mmio) => {
            if mmio.direction == Direction::Read {
                mmio.value = mmio.access_mask();
            }
        }
    }
}

/// Handles a VM exit caused by an I/O instruction: builds the request from
/// the exit qualification, dispatches it, and applies post-work when it
/// completed locally. When the request was deferred the vCPU is left
/// unresumed; the completion path picks it up later.
pub fn pio_instr_vmexit_handler(vcpu: &Vcpu, exit_qualification: u64) -> Result<()> {
    let direction = exit_qual_direction(exit_qualification);
    let pio = PioRequest {
        direction,
        port: exit_qual_port(exit_qualification),
        size: exit_qual_access_size(exit_qualification),
        value: if direction == Direction::Write {
            vcpu.rax() as u32
        } else {
            0
        },
    };
    trace!(
        "vcpu{}: pio vmexit, port {:#06x}, {:?}, size {}",
        vcpu.id(),
        pio.port,
        pio.direction,
        pio.size
    );

    let mut io_req = IoRequest::PortIo(pio);
    vcpu.set_io_request(io_req);
    match emulate_io(vcpu, &mut io_req)? {
        IoStatus::Complete => {
            vcpu.set_io_request(io_req);
            if let IoRequest::PortIo(pio) = io_req {
                emulate_pio_post(vcpu, &pio);
            }
            Ok(())
        }
        IoStatus::Deferred => Ok(()),
    }
}

/// Replaces the low `8 * size` bits of RAX, preserving the rest.
fn merge_rax(vcpu: &Vcpu, value: u32, mask: u32) {
    let mask = u64::from(mask);
    let rax = vcpu.rax();
    vcpu.set_rax((rax & !mask) | (u64::from(value) & mask));
}

/// Port-I/O post-work: folds a completed read into the guest accumulator.
/// Writes need none.
pub fn emulate_pio_post(vcpu: &Vcpu, pio: &PioRequest) {
    if pio.direction == Direction::Read {
        merge_rax(vcpu, pio.value, pio.access_mask());
    }
}

/// MMIO post-work: re-enters the instruction emulator so a completed read
/// lands in the destination the decoded instruction named. Writes need
/// none.
pub fn emulate_mmio_post(vcpu: &Vcpu, mmio: &MmioRequest) -> Result<()> {
    if mmio.direction != Direction::Read {
        return Ok(());
    }
    match vcpu.vm().instruction_emulator() {
        Some(emulator) => emulator.decode_and_emulate(vcpu, mmio),
        None => {
            error!(
                "vcpu{}: no instruction emulator for mmio completion",
                vcpu.id()
            );
            Err(Error::Invalid)
        }
    }
}

/// Consumes the device-model result of a port-I/O (or PCI config) request:
/// copies the value out of the shared slot, frees the slot, and runs the
/// port-I/O post-work.
pub fn dm_emulate_pio_post(vcpu: &Vcpu) {
    let Some(page) = vcpu.vm().io_shared_page() else {
        return;
    };
    let Some(slot) = page.slot(vcpu.id()) else {
        return;
    };
    let value = slot.read_value();
    slot.release();

    match vcpu.io_request() {
        Some(IoRequest::PortIo(mut pio)) => {
            pio.value = value as u32;
            vcpu.set_io_request(IoRequest::PortIo(pio));
            emulate_pio_post(vcpu, &pio);
        }
        Some(IoRequest::PciConfig(mut pci)) => {
            pci.value = value as u32;
            vcpu.set_io_request(IoRequest::PciConfig(pci));
            if pci.direction == Direction::Read {
                merge_rax(vcpu, pci.value, pci.access_mask());
            }
        }
        req => error!(
            "vcpu{}: pio completion with request {:?}",
            vcpu.id(),
            req
        ),
    }
}

/// Consumes the device-model result of an MMIO request and re-enters the
/// instruction emulator.
pub fn dm_emulate_mmio_post(vcpu: &Vcpu) -> Result<()> {
    let Some(page) = vcpu.vm().io_shared_page() else {
        return Ok(());
    };
    let Some(slot) = page.slot(vcpu.id()) else {
        return Ok(());
    };
    let value = slot.read_value();
    slot.release();

    match vcpu.io_request() {
        Some(IoRequest::Mmio(mut mmio)) => {
            mmio.value = value;
            vcpu.set_io_request(IoRequest::Mmio(mmio));
            emulate_mmio_post(vcpu, &mmio)
        }
        req => {
            error!(
                "vcpu{}: mmio completion with request {:?}",
                vcpu.id(),
                req
            );
            Err(Error::Invalid)
        }
    }
}

/// Completion path, run when a vCPU becomes runnable after the device
/// model finished its request.
///
/// Tolerates spurious wake-ups: a slot that is not valid or not COMPLETE
/// is left untouched. A zombie vCPU has its slot freed without post-work
/// and is not resumed.
pub fn emulate_io_post(vcpu: &Vcpu) {
    let Some(page) = vcpu.vm().io_shared_page() else {
        return;
    };
    let Some(slot) = page.slot(vcpu.id()) else {
        return;
    };
    if !slot.is_valid() || slot.state() != REQ_STATE_COMPLETE {
        return;
    }

    if vcpu.state() == VcpuState::Zombie {
        slot.release();
        return;
    }

    match vcpu.io_request() {
        Some(IoRequest::Mmio(_)) => {
            if let Err(e) = dm_emulate_mmio_post(vcpu) {
                error!("vcpu{}: mmio completion post-work failed: {}", vcpu.id(), e);
            }
        }
        Some(IoRequest::PortIo(_)) | Some(IoRequest::PciConfig(_)) => {
            dm_emulate_pio_post(vcpu);
        }
        // Write-protect requests are writes; nothing to fold back.
        Some(IoRequest::WriteProtect(_)) | None => slot.release(),
    }

    vcpu.resume();
}
