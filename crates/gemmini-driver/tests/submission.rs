//! End-to-end submissions against the simulated device
//!
//! Each test checks the allocator's counters afterwards: whatever the
//! outcome, every buffer a submission allocated must have been freed.

use gemmini_driver::backends::software::{
    CompletionMode, HostMemory, RegisterWrite, SoftwareDevice, SoftwareDma,
};
use gemmini_driver::{
    regs, DriverConfig, GemminiError, Opcode, RegisterImage, Request, SessionState,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Route driver logs to the test harness; `RUST_LOG` overrides the level.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "trace".into()))
        .with_test_writer()
        .try_init();
}

fn f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Square matrix product of M and K into O
fn matmul(image: &RegisterImage, m: &[u8], k: Option<&[u8]>, o: &mut [u8]) {
    let n = usize::try_from(image.size_m).unwrap();
    let a = f32s(m);
    let b = f32s(k.unwrap());
    for i in 0..n {
        for j in 0..n {
            let v: f32 = (0..n).map(|x| a[i * n + x] * b[x * n + j]).sum();
            o[(i * n + j) * 4..][..4].copy_from_slice(&v.to_le_bytes());
        }
    }
}

fn assert_no_leak(dev: &SoftwareDevice) {
    let s = dev.dma.stats();
    assert_eq!(s.allocations, s.frees, "leaked DMA buffers: {s:?}");
    assert_eq!(s.bytes_in_use, 0);
}

fn fast_config() -> DriverConfig {
    init_tracing();
    DriverConfig::default().with_timeout(Duration::from_millis(50))
}

#[test]
fn mm_two_by_two_runs_to_completion() {
    init_tracing();
    let dev = SoftwareDevice::with_kernel(CompletionMode::AfterReads(3), SoftwareDma::new(), matmul);
    let session = dev.session(DriverConfig::default());
    let mem = HostMemory::new();
    let m = mem.alloc_f32(&[1.0, 2.0, 3.0, 4.0]);
    let k = mem.alloc_f32(&[1.0, 2.0, 3.0, 4.0]);
    let o = mem.alloc(16);

    let req = Request::new(Opcode::Mm, 2, 0).with_operands(m, k, o);
    let done = session.submit(&req, &mem).unwrap();

    assert_eq!(done.plan.m_bytes(), 16);
    assert_eq!(done.plan.o_bytes(), 16);
    assert_eq!(done.polls, 4, "status must read non-zero before copy-out");
    assert_eq!(mem.read_f32(o, 4).unwrap(), vec![7.0, 10.0, 15.0, 22.0]);
    assert_eq!(dev.accelerator.launches(), 1);
    assert_eq!(session.submissions(), 1);
    assert_eq!(session.state(), SessionState::Idle);
    assert_no_leak(&dev);
}

#[test]
fn registers_are_programmed_in_protocol_order() {
    init_tracing();
    let dev = SoftwareDevice::new(CompletionMode::Immediate);
    let session = dev.session(DriverConfig::default());
    let mem = HostMemory::new();
    let req = Request::new(Opcode::Conv2d, 4, 3).with_operands(
        mem.alloc(64),
        mem.alloc(36),
        mem.alloc(64),
    );
    session.submit(&req, &mem).unwrap();

    let trace = dev.accelerator.trace();
    let offsets: Vec<usize> = trace.iter().map(|w| w.offset).collect();
    assert_eq!(
        offsets,
        vec![
            regs::ADDR_M,
            regs::ADDR_K,
            regs::ADDR_O,
            regs::SIZE_M,
            regs::SIZE_K,
            regs::OPCODE,
            regs::START
        ]
    );
    assert_eq!(trace[3].value, 4);
    assert_eq!(trace[4].value, 3);
    assert_eq!(trace[5].value, u64::from(Opcode::Conv2d.ordinal()));
    assert_eq!(
        trace.last(),
        Some(&RegisterWrite {
            offset: regs::START,
            value: regs::START_TRIGGER
        })
    );
    assert_no_leak(&dev);
}

#[test]
fn operations_without_k_program_zero_k_registers() {
    let dev = SoftwareDevice::new(CompletionMode::Immediate);
    let session = dev.session(DriverConfig::default());
    let mem = HostMemory::new();
    // MAXPOOL takes k_size as the pooling window but has no K buffer.
    let req = Request::new(Opcode::MaxPool, 4, 2).with_operands(mem.alloc(64), 0, mem.alloc(16));
    let done = session.submit(&req, &mem).unwrap();

    assert!(!done.plan.has_k());
    let image = dev.accelerator.image();
    assert_eq!(image.addr_k, 0);
    assert_eq!(image.size_k, 0);
    assert_eq!(image.size_m, 4);
    assert_eq!(dev.dma.stats().allocations, 2);
    assert_no_leak(&dev);
}

#[test]
fn conv2d_without_k_size_is_rejected() {
    let dev = SoftwareDevice::new(CompletionMode::Immediate);
    let session = dev.session(DriverConfig::default());
    let mem = HostMemory::new();
    let req = Request::new(Opcode::Conv2d, 4, 0).with_operands(mem.alloc(64), mem.alloc(4), mem.alloc(64));

    let err = session.submit(&req, &mem).unwrap_err();
    assert!(matches!(err, GemminiError::InvalidArgument { .. }), "{err}");
    assert_eq!(dev.dma.stats().allocations, 0);
    assert!(dev.accelerator.trace().is_empty());
}

#[test]
fn oversized_mm_is_rejected_before_allocation() {
    let dev = SoftwareDevice::new(CompletionMode::Immediate);
    let session = dev.session(DriverConfig::default());
    let mem = HostMemory::new();
    let req = Request::new(Opcode::Mm, 1 << 31, 0).with_operands(mem.alloc(4), mem.alloc(4), mem.alloc(4));

    assert!(matches!(
        session.submit(&req, &mem),
        Err(GemminiError::InvalidArgument { .. })
    ));
    assert_eq!(dev.dma.stats().allocations, 0);
    assert!(dev.accelerator.trace().is_empty());
}

#[test]
fn device_that_never_completes_times_out() {
    let dev = SoftwareDevice::new(CompletionMode::Never);
    let session = dev.session(fast_config());
    let mem = HostMemory::new();
    let req = Request::new(Opcode::Relu, 2, 0).with_operands(mem.alloc(16), 0, mem.alloc(16));

    let err = session.submit(&req, &mem).unwrap_err();
    assert!(matches!(err, GemminiError::Timeout { duration_ms: 50 }), "{err}");
    assert_eq!(err.errno(), libc::ETIMEDOUT);
    assert!(dev.accelerator.status_reads() >= 1);
    assert_eq!(session.state(), SessionState::Idle);
    assert_no_leak(&dev);
}

#[test]
fn copy_out_fault_releases_everything_and_session_recovers() {
    let dev = SoftwareDevice::new(CompletionMode::Immediate);
    let session = dev.session(DriverConfig::default());
    let mem = HostMemory::new();
    let m = mem.alloc(16);
    let o = mem.alloc(16);
    mem.protect(o);

    let req = Request::new(Opcode::Relu, 2, 0).with_operands(m, 0, o);
    let err = session.submit(&req, &mem).unwrap_err();
    assert!(matches!(err, GemminiError::Fault { .. }), "{err}");
    assert_eq!(dev.accelerator.launches(), 1, "device already ran");
    assert_eq!(session.state(), SessionState::Idle);
    assert_no_leak(&dev);

    let o2 = mem.alloc(16);
    let retry = Request::new(Opcode::Relu, 2, 0).with_operands(m, 0, o2);
    session.submit(&retry, &mem).unwrap();
    assert_eq!(dev.accelerator.launches(), 2);
    assert_eq!(session.submissions(), 2);
    assert_no_leak(&dev);
}

#[test]
fn copy_in_fault_never_touches_registers() {
    let dev = SoftwareDevice::new(CompletionMode::Immediate);
    let session = dev.session(DriverConfig::default());
    let mem = HostMemory::new();
    let m = mem.alloc(16);
    mem.revoke(m);

    let req = Request::new(Opcode::Relu, 2, 0).with_operands(m, 0, mem.alloc(16));
    assert!(matches!(
        session.submit(&req, &mem),
        Err(GemminiError::Fault { .. })
    ));
    assert!(dev.accelerator.trace().is_empty());
    assert_no_leak(&dev);
}

#[test]
fn allocation_failure_never_touches_registers() {
    let dma = SoftwareDma::new();
    dma.fail_allocation(1);
    let dev = SoftwareDevice::with_kernel(CompletionMode::Immediate, dma, |_, _, _, _| {});
    let session = dev.session(DriverConfig::default());
    let mem = HostMemory::new();

    let req = Request::new(Opcode::Relu, 2, 0).with_operands(mem.alloc(16), 0, mem.alloc(16));
    let err = session.submit(&req, &mem).unwrap_err();
    assert_eq!(err.errno(), libc::ENOMEM);
    assert!(dev.accelerator.trace().is_empty());
    assert_no_leak(&dev);
}

#[test]
fn null_operands_are_rejected_before_allocation() {
    let dev = SoftwareDevice::new(CompletionMode::Immediate);
    let session = dev.session(DriverConfig::default());
    let mem = HostMemory::new();

    let no_output = Request::new(Opcode::Relu, 2, 0).with_operands(mem.alloc(16), 0, 0);
    let no_k = Request::new(Opcode::Mm, 2, 0).with_operands(mem.alloc(16), 0, mem.alloc(16));
    for req in [no_output, no_k] {
        let err = session.submit(&req, &mem).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL, "{err}");
    }
    assert_eq!(dev.dma.stats().allocations, 0);
    assert_eq!(session.submissions(), 2);
}

#[test]
fn conv3d_gemm_output_matches_volume_intermediate() {
    let dev = SoftwareDevice::new(CompletionMode::Immediate);
    let session = dev.session(DriverConfig::default());
    let mem = HostMemory::new();
    // m=2, k=1: M is (2·2·2)·(1·1·1) = 8 elements, O is the m³ volume = 8 elements.
    let req = Request::new(Opcode::Conv3dGemm, 2, 1).with_operands(
        mem.alloc(32),
        mem.alloc(4),
        mem.alloc(32),
    );
    let done = session.submit(&req, &mem).unwrap();
    assert_eq!(done.plan.o_bytes(), 2 * 2 * 2 * 4);
    assert_eq!(done.plan.k_bytes(), 4);
    assert_no_leak(&dev);
}

#[test]
fn output_is_cleared_before_the_device_runs() {
    let dev = SoftwareDevice::with_kernel(
        CompletionMode::Immediate,
        SoftwareDma::new(),
        |_, _, _, o| assert!(o.iter().all(|&b| b == 0)),
    );
    let session = dev.session(DriverConfig::default());
    let mem = HostMemory::new();
    let o = mem.alloc_f32(&[9.0; 4]);
    let req = Request::new(Opcode::Relu, 2, 0).with_operands(mem.alloc_f32(&[1.0; 4]), 0, o);
    session.submit(&req, &mem).unwrap();
    assert_eq!(mem.read_f32(o, 4).unwrap(), vec![0.0; 4]);
}

#[test]
fn unbounded_timeout_does_not_panic() {
    init_tracing();
    let dev = SoftwareDevice::new(CompletionMode::AfterReads(2));
    let session = dev.session(DriverConfig::default().with_timeout(Duration::MAX));
    let mem = HostMemory::new();
    let req = Request::new(Opcode::Relu, 2, 0).with_operands(mem.alloc(16), 0, mem.alloc(16));

    let done = session.submit(&req, &mem).unwrap();
    assert_eq!(done.polls, 3);
    assert_eq!(session.state(), SessionState::Idle);
    assert_no_leak(&dev);
}

#[test]
fn each_submission_programs_a_fresh_group() {
    init_tracing();
    let dev = SoftwareDevice::new(CompletionMode::Immediate);
    let session = dev.session(DriverConfig::default());
    let mem = HostMemory::new();

    let first = Request::new(Opcode::Relu, 2, 0).with_operands(mem.alloc(16), 0, mem.alloc(16));
    session.submit(&first, &mem).unwrap();
    assert_eq!(dev.accelerator.trace().len(), 7);

    dev.accelerator.clear_trace();
    assert!(dev.accelerator.trace().is_empty());

    let second = Request::new(Opcode::Relu, 3, 0).with_operands(mem.alloc(36), 0, mem.alloc(36));
    session.submit(&second, &mem).unwrap();
    let trace = dev.accelerator.trace();
    assert_eq!(trace.len(), 7);
    assert_eq!(trace[3], RegisterWrite { offset: regs::SIZE_M, value: 3 });
    assert_eq!(dev.accelerator.launches(), 2);
}
