// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Synchronous broadcast of a callback to a mask of physical CPUs over the
//! reserved notification vector.

use std::hint;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;
use log::error;
use log::info;
use parking_lot::Mutex;

use crate::Error;
use crate::Result;

/// The interrupt vector reserved for kicking CPUs out of guest mode and
/// carrying SMP-call requests.
pub const VECTOR_NOTIFY_VCPU: u8 = 0xf0;

// Sentinel bit callers use to flag an invalid CPU index; never a real
// target.
const INVALID_CPU_BIT: u64 = 1 << 63;

/// Delivers the notification vector to every CPU named in `cpu_mask`, in
/// logical destination mode. Provided by the embedder's interrupt layer.
pub trait IpiSender: Send + Sync {
    fn send_logical_ipi(&self, cpu_mask: u64, vector: u8);
}

struct CallSlot {
    func: Mutex<Option<Arc<dyn Fn(u32) + Send + Sync>>>,
}

/// The SMP-call broadcast primitive.
///
/// One broadcast is in flight system-wide at a time; concurrent issuers
/// serialize on the claim of the global call mask. Each targeted CPU runs
/// the callback exactly once from the notification ISR, then clears its
/// bit; the issuer returns only after the mask drains to zero.
pub struct SmpCall {
    ipi: Arc<dyn IpiSender>,
    call_mask: AtomicU64,
    active_mask: AtomicU64,
    slots: Vec<CallSlot>,
    registered: AtomicBool,
}

impl SmpCall {
    /// Creates the broadcast state for `num_cpus` physical CPUs (at most
    /// 64). All CPUs start offline; mark them active as they come up.
    pub fn new(num_cpus: usize, ipi: Arc<dyn IpiSender>) -> SmpCall {
        assert!(num_cpus <= 64);
        SmpCall {
            ipi,
            call_mask: AtomicU64::new(0),
            active_mask: AtomicU64::new(0),
            slots: (0..num_cpus)
                .map(|_| CallSlot {
                    func: Mutex::new(None),
                })
                .collect(),
            registered: AtomicBool::new(false),
        }
    }

    /// Registers the notification ISR. Only CPU 0 performs the
    /// registration; calls from other CPUs are no-ops. A second
    /// registration fails with `Busy`.
    pub fn setup_notification(&self, cpu_id: u32) -> Result<()> {
        if cpu_id != 0 {
            return Ok(());
        }
        if self
            .registered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            info!("notification vector already registered");
            return Err(Error::Busy);
        }
        debug!("notification isr registered on vector {:#x}", VECTOR_NOTIFY_VCPU);
        Ok(())
    }

    /// Unregisters the notification ISR.
    pub fn cleanup_notification(&self) {
        self.registered.store(false, Ordering::Release);
    }

    /// Marks a physical CPU active (eligible as a broadcast target) or
    /// offline.
    pub fn set_cpu_active(&self, cpu_id: u32, active: bool) {
        let bit = 1u64 << cpu_id;
        if active {
            self.active_mask.fetch_or(bit, Ordering::Relaxed);
        } else {
            self.active_mask.fetch_and(!bit, Ordering::Relaxed);
        }
    }

    fn cpu_active(&self, cpu_id: u32) -> bool {
        self.active_mask.load(Ordering::Relaxed) & (1u64 << cpu_id) != 0
    }

    /// The set of CPUs that still owe the current broadcast. Zero at rest.
    pub fn call_mask(&self) -> u64 {
        self.call_mask.load(Ordering::Acquire)
    }

    /// Runs `func` exactly once on every active CPU in `mask` and returns
    /// after all of them finished.
    ///
    /// Spins while claiming the global mask and while waiting for the
    /// targets to drain. Must not be called from interrupt context, nor
    /// with the calling CPU in `mask` while it cannot take the
    /// notification interrupt, nor recursively.
    pub fn smp_call_function<F>(&self, mask: u64, func: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        let mask = mask & !INVALID_CPU_BIT;
        let func: Arc<dyn Fn(u32) + Send + Sync> = Arc::new(func);

        // Wait for any previous broadcast, possibly still draining on
        // other CPUs, then claim the mask for this one.
        while self
            .call_mask
            .compare_exchange(0, mask, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }

        let mut remaining = mask;
        while remaining != 0 {
            let cpu_id = remaining.trailing_zeros();
            remaining &= remaining - 1;

            if self.cpu_active(cpu_id) && (cpu_id as usize) < self.slots.len() {
                *self.slots[cpu_id as usize].func.lock() = Some(func.clone());
            } else {
                // An absent CPU can never acknowledge; drop it from the
                // broadcast.
                error!("pcpu {} not active for smp call", cpu_id);
                self.call_mask
                    .fetch_and(!(1u64 << cpu_id), Ordering::AcqRel);
            }
        }

        let targets = self.call_mask.load(Ordering::Acquire);
        if targets != 0 {
            self.ipi.send_logical_ipi(targets, VECTOR_NOTIFY_VCPU);
        }

        // Wait for every target to run the callback and clear its bit.
        while self.call_mask.load(Ordering::Acquire) != 0 {
            hint::spin_loop();
        }
    }

    /// Body of the notification ISR, run on the receiving CPU.
    ///
    /// When the CPU's bit is set in the call mask, consumes the callback
    /// from its slot, runs it, and clears the bit. Otherwise the interrupt
    /// was a pure kick out of guest mode and nothing happens. A kick that
    /// outruns the requestor's slot write also leaves the bit alone; the
    /// broadcast IPI that follows the write finishes the job.
    pub fn kick_notification(&self, cpu_id: u32) {
        if !self.registered.load(Ordering::Acquire) {
            return;
        }
        let bit = 1u64 << cpu_id;
        if self.call_mask.load(Ordering::Acquire) & bit == 0 {
            return;
        }
        let func = match self.slots.get(cpu_id as usize) {
            Some(slot) => slot.func.lock().take(),
            None => None,
        };
        if let Some(func) = func {
            func(cpu_id);
            self.call_mask.fetch_and(!bit, Ordering::Release);
        }
    }
}
