// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end exercises of the emulation pipeline, the device-model
//! bridge, and the SMP-call broadcast.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use vm_io::emulate_io;
use vm_io::emulate_io_post;
use vm_io::pio_instr_vmexit_handler;
use vm_io::DeviceModelChannel;
use vm_io::Direction;
use vm_io::Error;
use vm_io::InstructionEmulator;
use vm_io::IoRequest;
use vm_io::IoSharedPage;
use vm_io::IoStatus;
use vm_io::IpiSender;
use vm_io::MmioRequest;
use vm_io::PioRange;
use vm_io::PioRequest;
use vm_io::PortIoDevice;
use vm_io::SmpCall;
use vm_io::Vcpu;
use vm_io::VcpuState;
use vm_io::Vm;
use vm_io::VmConfig;
use vm_io::REQ_STATE_FREE;
use vm_io::REQ_STATE_PENDING;

struct ConstantDevice {
    value: u32,
}

impl PortIoDevice for ConstantDevice {
    fn debug_label(&self) -> String {
        "constant device".to_owned()
    }

    fn io_read(&mut self, _port: u16, _size: u32) -> u32 {
        self.value
    }

    fn io_write(&mut self, _port: u16, _size: u32, _value: u32) {}
}

/// Instruction emulator fake that lands MMIO read results in a register
/// cell, standing in for the decoded destination.
struct RecordingEmulator {
    dest: Mutex<Option<u64>>,
}

impl InstructionEmulator for RecordingEmulator {
    fn decode_and_emulate(&self, _vcpu: &Vcpu, req: &MmioRequest) -> vm_io::Result<()> {
        *self.dest.lock() = Some(req.value & req.access_mask());
        Ok(())
    }
}

struct UpcallQueue {
    tx: Mutex<mpsc::Sender<u32>>,
}

impl DeviceModelChannel for UpcallQueue {
    fn raise_upcall(&self, vm_id: u32) {
        // The receiving end may already be gone when a test only checks
        // the posted slot.
        let _ = self.tx.lock().send(vm_id);
    }
}

fn test_vm(config: VmConfig) -> Arc<Vm> {
    let vm = Arc::new(Vm::new(config));
    vm.setup_io_bitmap();
    vm
}

fn in_qual(port: u16, size_bits: u64) -> u64 {
    (u64::from(port) << 16) | (1 << 3) | size_bits
}

fn out_qual(port: u16, size_bits: u64) -> u64 {
    (u64::from(port) << 16) | size_bits
}

#[test]
fn pio_read_with_handler_lands_in_rax() {
    let vm = test_vm(VmConfig {
        id: 1,
        ..Default::default()
    });
    vm.register_pio_handler(
        PioRange {
            base: 0x3f8,
            len: 8,
        },
        Arc::new(Mutex::new(ConstantDevice { value: 0x42 })),
    )
    .unwrap();

    let vcpu = Vcpu::new(vm, 0);
    vcpu.launch();
    vcpu.set_rax(0x0123_4567_89ab_cdef);

    // `in al, 0x3f8`
    pio_instr_vmexit_handler(&vcpu, in_qual(0x3f8, 0)).unwrap();
    assert_eq!(vcpu.rax(), 0x0123_4567_89ab_cd42);
    assert_eq!(vcpu.state(), VcpuState::Running);
}

#[test]
fn unhandled_pio_write_is_deferred_to_device_model() {
    let vm = test_vm(VmConfig {
        id: 1,
        ..Default::default()
    });
    let page = Arc::new(IoSharedPage::new());
    vm.set_io_shared_page(page.clone());
    let (tx, rx) = mpsc::channel();
    vm.set_device_model_channel(Arc::new(UpcallQueue { tx: Mutex::new(tx) }));

    let vcpu = Vcpu::new(vm, 0);
    vcpu.launch();
    vcpu.set_rax(0x8000_1000);

    // `out dx, eax` with DX = 0xcf8.
    pio_instr_vmexit_handler(&vcpu, out_qual(0xcf8, 3)).unwrap();

    let slot = page.slot(0).unwrap();
    assert!(slot.is_valid());
    assert_eq!(slot.state(), REQ_STATE_PENDING);
    assert_eq!(
        slot.request(),
        Some(IoRequest::PortIo(PioRequest {
            direction: Direction::Write,
            port: 0xcf8,
            size: 4,
            value: 0x8000_1000,
        }))
    );
    assert_eq!(rx.try_recv(), Ok(1));
    // The vCPU was not resumed by the exit handler.
    assert_eq!(vcpu.state(), VcpuState::Running);
}

#[test]
fn access_spanning_handler_boundary_fails() {
    let vm = test_vm(VmConfig {
        id: 1,
        ..Default::default()
    });
    vm.register_pio_handler(
        PioRange { base: 0x60, len: 4 },
        Arc::new(Mutex::new(ConstantDevice { value: 0 })),
    )
    .unwrap();

    let vcpu = Vcpu::new(vm, 0);
    vcpu.launch();
    vcpu.set_rax(0x5555_5555);

    // `in eax, 0x62` straddles the top boundary of [0x60, 0x64).
    let result = pio_instr_vmexit_handler(&vcpu, in_qual(0x62, 3));
    assert_eq!(
        result,
        Err(Error::SpanError {
            address: 0x62,
            size: 4
        })
    );
    assert_eq!(vcpu.rax(), 0x5555_5555);
}

#[test]
fn mmio_read_completed_by_device_model() {
    let vm = test_vm(VmConfig {
        id: 1,
        ..Default::default()
    });
    let page = Arc::new(IoSharedPage::new());
    vm.set_io_shared_page(page.clone());
    let emulator = Arc::new(RecordingEmulator {
        dest: Mutex::new(None),
    });
    vm.set_instruction_emulator(emulator.clone());
    let (tx, rx) = mpsc::channel();
    vm.set_device_model_channel(Arc::new(UpcallQueue { tx: Mutex::new(tx) }));

    let vcpu = Arc::new(Vcpu::new(vm, 0));
    vcpu.launch();

    let mut req = IoRequest::Mmio(MmioRequest {
        direction: Direction::Read,
        address: 0xfee0_0020,
        size: 4,
        value: 0,
    });
    vcpu.set_io_request(req);
    assert_eq!(emulate_io(&vcpu, &mut req), Ok(IoStatus::Deferred));
    vcpu.pause();

    // Device model services the upcall on its own thread.
    let dm_page = page.clone();
    let dm = thread::spawn(move || {
        let vm_id = rx.recv().unwrap();
        assert_eq!(vm_id, 1);
        let slot = dm_page.slot(0).unwrap();
        assert_eq!(slot.state(), REQ_STATE_PENDING);
        match slot.request() {
            Some(IoRequest::Mmio(mmio)) => {
                assert_eq!(mmio.address, 0xfee0_0020);
                assert_eq!(mmio.size, 4);
            }
            other => panic!("unexpected request in slot: {:?}", other),
        }
        slot.complete_from_device_model(0xdead_beef);
    });
    dm.join().unwrap();

    // The owning CPU observes the completion and resumes the vCPU.
    emulate_io_post(&vcpu);
    assert_eq!(*emulator.dest.lock(), Some(0xdead_beef));
    assert_eq!(vcpu.state(), VcpuState::Running);
    assert!(!page.slot(0).unwrap().is_valid());
    assert_eq!(page.slot(0).unwrap().state(), REQ_STATE_FREE);
}

#[test]
fn zombie_vcpu_completion_frees_slot_without_resume() {
    let vm = test_vm(VmConfig {
        id: 1,
        ..Default::default()
    });
    let page = Arc::new(IoSharedPage::new());
    vm.set_io_shared_page(page.clone());
    let emulator = Arc::new(RecordingEmulator {
        dest: Mutex::new(None),
    });
    vm.set_instruction_emulator(emulator.clone());

    let vcpu = Vcpu::new(vm, 0);
    vcpu.launch();

    let mut req = IoRequest::Mmio(MmioRequest {
        direction: Direction::Read,
        address: 0xfee0_0020,
        size: 4,
        value: 0,
    });
    vcpu.set_io_request(req);
    assert_eq!(emulate_io(&vcpu, &mut req), Ok(IoStatus::Deferred));

    page.slot(0).unwrap().complete_from_device_model(0xdead_beef);
    vcpu.set_zombie();

    emulate_io_post(&vcpu);
    let slot = page.slot(0).unwrap();
    assert!(!slot.is_valid());
    assert_eq!(slot.state(), REQ_STATE_FREE);
    assert_eq!(vcpu.state(), VcpuState::Zombie);
    assert_eq!(*emulator.dest.lock(), None);
}

/// IPI transport backed by one service thread per simulated CPU.
struct ThreadedIpi {
    kick_txs: Vec<Mutex<mpsc::Sender<()>>>,
}

impl IpiSender for ThreadedIpi {
    fn send_logical_ipi(&self, cpu_mask: u64, _vector: u8) {
        for (cpu_id, tx) in self.kick_txs.iter().enumerate() {
            if cpu_mask & (1u64 << cpu_id) != 0 {
                tx.lock().send(()).unwrap();
            }
        }
    }
}

#[test]
fn smp_call_reaches_every_target_and_serializes_issuers() {
    const NUM_CPUS: usize = 4;

    let mut kick_txs = Vec::new();
    let mut kick_rxs = Vec::new();
    for _ in 0..NUM_CPUS {
        let (tx, rx) = mpsc::channel();
        kick_txs.push(Mutex::new(tx));
        kick_rxs.push(rx);
    }

    let smp = Arc::new(SmpCall::new(NUM_CPUS, Arc::new(ThreadedIpi { kick_txs })));
    smp.setup_notification(0).unwrap();
    for cpu in 0..NUM_CPUS as u32 {
        smp.set_cpu_active(cpu, true);
    }

    // Each simulated CPU services notification IPIs until its channel
    // closes. Workers hold the broadcast state weakly so dropping it
    // tears the transport down.
    let workers: Vec<_> = kick_rxs
        .into_iter()
        .enumerate()
        .map(|(cpu_id, rx)| {
            let smp = Arc::downgrade(&smp);
            thread::spawn(move || {
                while rx.recv().is_ok() {
                    if let Some(smp) = smp.upgrade() {
                        smp.kick_notification(cpu_id as u32);
                    }
                }
            })
        })
        .collect();

    let counters: Arc<Vec<AtomicUsize>> =
        Arc::new((0..NUM_CPUS).map(|_| AtomicUsize::new(0)).collect());

    // Issuer on CPU 0 targets CPUs 1 and 2; a concurrent issuer on CPU 3
    // targets CPU 1 and must wait its turn at the claim.
    let first = {
        let smp = smp.clone();
        let counters = counters.clone();
        thread::spawn(move || {
            smp.smp_call_function(0b0110, move |cpu| {
                counters[cpu as usize].fetch_add(1, Ordering::SeqCst);
            });
        })
    };
    let second = {
        let smp = smp.clone();
        let counters = counters.clone();
        thread::spawn(move || {
            smp.smp_call_function(0b0010, move |cpu| {
                counters[cpu as usize].fetch_add(1, Ordering::SeqCst);
            });
        })
    };
    first.join().unwrap();
    second.join().unwrap();

    // Both broadcasts fully drained before their issuers returned.
    assert_eq!(smp.call_mask(), 0);
    assert_eq!(counters[0].load(Ordering::SeqCst), 0);
    assert_eq!(counters[1].load(Ordering::SeqCst), 2);
    assert_eq!(counters[2].load(Ordering::SeqCst), 1);
    assert_eq!(counters[3].load(Ordering::SeqCst), 0);

    drop(smp);
    // Workers exit once the IPI transport (and its senders) is dropped.
    for worker in workers {
        worker.join().unwrap();
    }
}
