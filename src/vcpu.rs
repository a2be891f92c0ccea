// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-vCPU state consumed by the emulation pipeline.

use std::sync::Arc;

use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::ioreq::IoRequest;
use crate::vm::Vm;

/// Lifecycle of a vCPU as seen by the I/O pipeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VcpuState {
    /// Created but never run.
    Created,
    /// Executing, or runnable.
    Running,
    /// Parked waiting for an I/O completion.
    Paused,
    /// About to be destroyed; completions are discarded.
    Zombie,
}

#[derive(Default)]
struct GuestRegs {
    rax: u64,
}

/// A virtual CPU. Only the slice the I/O pipeline touches is modeled: the
/// accumulator, the lifecycle state, the in-flight request, and a
/// park/resume latch the scheduler drives.
pub struct Vcpu {
    id: u32,
    vm: Arc<Vm>,
    state: Mutex<VcpuState>,
    state_changed: Condvar,
    regs: Mutex<GuestRegs>,
    io_req: Mutex<Option<IoRequest>>,
}

impl Vcpu {
    pub fn new(vm: Arc<Vm>, id: u32) -> Vcpu {
        Vcpu {
            id,
            vm,
            state: Mutex::new(VcpuState::Created),
            state_changed: Condvar::new(),
            regs: Mutex::new(GuestRegs::default()),
            io_req: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn state(&self) -> VcpuState {
        *self.state.lock()
    }

    /// Marks the vCPU launched and runnable. After this point MMIO handler
    /// registration on the owning VM is a bug.
    pub fn launch(&self) {
        *self.state.lock() = VcpuState::Running;
        self.vm.mark_vcpu_launched();
    }

    /// Parks the vCPU until a completion resumes it.
    pub fn pause(&self) {
        *self.state.lock() = VcpuState::Paused;
    }

    /// Moves the vCPU to its terminal state. A zombie is never resumed;
    /// its pending completion, if any, is discarded.
    pub fn set_zombie(&self) {
        let mut state = self.state.lock();
        *state = VcpuState::Zombie;
        self.state_changed.notify_all();
    }

    /// Makes a paused vCPU runnable again. No-op on a zombie.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        if *state == VcpuState::Zombie {
            return;
        }
        *state = VcpuState::Running;
        self.state_changed.notify_all();
    }

    /// Blocks until the vCPU leaves the paused state, returning the state
    /// it woke to.
    pub fn wait_until_runnable(&self) -> VcpuState {
        let mut state = self.state.lock();
        while *state == VcpuState::Paused {
            self.state_changed.wait(&mut state);
        }
        *state
    }

    /// The guest accumulator (RAX).
    pub fn rax(&self) -> u64 {
        self.regs.lock().rax
    }

    pub fn set_rax(&self, value: u64) {
        self.regs.lock().rax = value;
    }

    /// The request produced by this vCPU's latest I/O exit.
    pub fn io_request(&self) -> Option<IoRequest> {
        *self.io_req.lock()
    }

    /// Records the request built by an exit handler. The MMIO exit
    /// dispatcher calls this before handing the request to `emulate_io` so
    /// the completion path can route the result.
    pub fn set_io_request(&self, req: IoRequest) {
        *self.io_req.lock() = Some(req);
    }
}
