// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest I/O emulation core for a type-1 hypervisor.
//!
//! This crate intercepts port-I/O and MMIO accesses trapped out of guest
//! vCPUs and routes them through a dispatch pipeline of in-hypervisor
//! handlers. When no handler claims the accessed range, the request is
//! handed to a user-space device model running in the privileged guest
//! through a shared-memory request slot, and the vCPU stays parked until
//! the device model completes the request. A synchronous IPI broadcast
//! primitive ([`SmpCall`]) kicks remote physical CPUs out of guest mode so
//! they can service completed requests.
//!
//! Instruction decoding, second-level page table manipulation, the upcall
//! transport, and IPI delivery are owned by the embedder and reached
//! through the [`InstructionEmulator`], [`GuestAddressSpace`],
//! [`DeviceModelChannel`], and [`IpiSender`] traits.

mod emulate;
mod ioreq;
mod mmio;
mod pio;
mod smp_call;
mod vcpu;
mod vhm;
mod vm;

use remain::sorted;
use thiserror::Error;

pub use crate::emulate::dm_emulate_mmio_post;
pub use crate::emulate::dm_emulate_pio_post;
pub use crate::emulate::emulate_io;
pub use crate::emulate::emulate_io_post;
pub use crate::emulate::emulate_mmio_post;
pub use crate::emulate::emulate_pio_post;
pub use crate::emulate::pio_instr_vmexit_handler;
pub use crate::emulate::InstructionEmulator;
pub use crate::ioreq::Direction;
pub use crate::ioreq::IoRequest;
pub use crate::ioreq::IoSharedPage;
pub use crate::ioreq::MmioPayload;
pub use crate::ioreq::MmioRequest;
pub use crate::ioreq::PciConfigRequest;
pub use crate::ioreq::PciPayload;
pub use crate::ioreq::PioPayload;
pub use crate::ioreq::PioRequest;
pub use crate::ioreq::VhmRequestKind;
pub use crate::ioreq::VhmRequestSlot;
pub use crate::ioreq::REQ_STATE_COMPLETE;
pub use crate::ioreq::REQ_STATE_FREE;
pub use crate::ioreq::REQ_STATE_PENDING;
pub use crate::ioreq::VHM_REQUEST_SLOTS;
pub use crate::mmio::MmioDevice;
pub use crate::mmio::MmioRange;
pub use crate::pio::IoBitmap;
pub use crate::pio::PioRange;
pub use crate::pio::PortIoDevice;
pub use crate::smp_call::IpiSender;
pub use crate::smp_call::SmpCall;
pub use crate::smp_call::VECTOR_NOTIFY_VCPU;
pub use crate::vcpu::Vcpu;
pub use crate::vcpu::VcpuState;
pub use crate::vhm::insert_request_wait;
pub use crate::vhm::DeviceModelChannel;
pub use crate::vm::GuestAddressSpace;
pub use crate::vm::Vm;
pub use crate::vm::VmConfig;

#[sorted]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A setup operation was refused because the resource is already
    /// initialized.
    #[error("notification handler already registered")]
    Busy,
    /// The request is malformed or the operation arguments are unusable.
    #[error("malformed I/O request or invalid arguments")]
    Invalid,
    /// No handler covers the accessed range.
    #[error("no device claims the accessed range")]
    NoDevice,
    /// The access straddles a registered region boundary. Never split.
    #[error("access at {address:#x} size {size} spans device boundaries")]
    SpanError { address: u64, size: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a successfully dispatched I/O request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoStatus {
    /// The request was handled inside the hypervisor; post-work can run
    /// immediately and the vCPU may resume.
    Complete,
    /// The request was handed to the device model. The vCPU must not be
    /// resumed until the completion path runs.
    Deferred,
}
