// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Handoff of unclaimed requests to the device model in the privileged
//! guest.

use log::error;
use log::warn;

use crate::ioreq::IoRequest;
use crate::vcpu::Vcpu;
use crate::Error;
use crate::Result;

/// Upcall transport into the privileged guest. Raised after a request slot
/// transitions to PENDING so the device model starts servicing it.
pub trait DeviceModelChannel: Send + Sync {
    fn raise_upcall(&self, vm_id: u32);
}

/// Posts `req` into the calling vCPU's shared slot, publishes the PENDING
/// transition, and raises the device-model upcall.
///
/// On success the request is in flight and the vCPU must stay parked until
/// the completion path observes COMPLETE. Fails with `NoDevice` when the VM
/// has no shared ring to post into.
pub fn insert_request_wait(vcpu: &Vcpu, req: &IoRequest) -> Result<()> {
    let vm = vcpu.vm();
    let page = vm.io_shared_page().ok_or_else(|| {
        error!("vm{}: no I/O shared page attached", vm.id());
        Error::NoDevice
    })?;
    let slot = page.slot(vcpu.id()).ok_or_else(|| {
        error!("vm{}: vcpu{} has no request slot", vm.id(), vcpu.id());
        Error::Invalid
    })?;

    slot.post(vcpu.id(), req);

    match vm.device_model_channel() {
        Some(channel) => channel.raise_upcall(vm.id()),
        None => warn!("vm{}: request posted with no upcall channel", vm.id()),
    }
    Ok(())
}
