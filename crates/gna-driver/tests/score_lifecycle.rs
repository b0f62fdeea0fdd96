//! Scoring request lifecycle against the simulated device
//!
//! Every request gets exactly one completion: on interrupt, on recovery
//! timeout, on cancellation, or on rejection before the hardware is touched.

use gna_chip::descriptor::{page_number, xnn, PAGE_SIZE, XNN_CONFIG_OFFSET};
use gna_chip::layer::{self, BufferSlot};
use gna_chip::regs::{self, status};
use gna_driver::layout::RequestBuilder;
use gna_driver::mmio::RegisterInterface;
use gna_driver::platform::{DmaPlatform, TimerService};
use gna_driver::sim::{ManualTimer, SimPlatform, SimRegisters, SimulatedDevice};
use gna_driver::{
    Device, DriverConfig, GnaError, HardwarePerf, HardwareStatus, InterruptOutcome, MemoryId,
    PollPolicy, RequestStatus, Session, ThreadTimer, TimeoutOutcome,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const BASE: u64 = 0x100_0000;
const LEN: usize = 4 * PAGE_SIZE;

/// `RUST_LOG=gna_driver=debug cargo test` shows the driver's trace
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> DriverConfig {
    init_logging();
    DriverConfig::default().with_poll(PollPolicy::new(16, Duration::ZERO))
}

fn started() -> SimulatedDevice {
    SimulatedDevice::started(config()).expect("simulated device starts")
}

/// A session with one mapped `LEN`-byte buffer
fn session_with_memory(sim: &SimulatedDevice, base: u64) -> (Arc<Session>, MemoryId) {
    sim.platform.add_user_region(base, LEN);
    let session = sim.device.open_session();
    let id = sim.device.map(&session, base, LEN).unwrap();
    (session, id)
}

fn le32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[..4].try_into().unwrap())
}

#[test]
fn completed_score_reports_success_and_counters() {
    let sim = started();
    let (session, memory) = session_with_memory(&sim, BASE);

    let request = RequestBuilder::new(memory, 1)
        .layers(0, 2)
        .stats(1)
        .buffer(1, BufferSlot::Output, 0x2000)
        .layer_field(0, layer::INPUT_ELEMENTS as u16, 2, 640)
        .patch(0x1000, &[1, 2, 3, 4])
        .build();
    let handle = sim.device.submit(&session, request).unwrap();

    let context = session.memory(memory).unwrap();
    assert_eq!(sim.device.processor().active_request(), Some(handle.id()));
    assert!(sim.regs.is_started());
    assert!(!sim.regs.in_d0i3());
    assert_eq!(sim.regs.peek(regs::DESBASE), page_number(context.descriptor_address()));

    sim.regs.set_perf(12_000, 340);
    sim.regs.complete_score();
    assert_eq!(
        sim.device.on_interrupt(),
        InterruptOutcome::Completed(HardwareStatus::Success)
    );

    let report = handle.wait();
    assert_eq!(report.status, RequestStatus::Hardware(HardwareStatus::Success));
    assert_eq!(
        report.perf,
        Some(HardwarePerf {
            total_cycles: 12_000,
            stall_cycles: 340
        })
    );

    let output = layer::field_position(1, layer::OUTPUT_BUFFER) as u64;
    assert_eq!(le32(&sim.platform.read_user(BASE + output, 4).unwrap()), 0x2000);
    let input = layer::field_position(0, layer::INPUT_ELEMENTS) as u64;
    assert_eq!(sim.platform.read_user(BASE + input, 2).unwrap(), 640u16.to_le_bytes());
    assert_eq!(sim.platform.read_user(BASE + 0x1000, 4).unwrap(), [1, 2, 3, 4]);

    let descriptor = context.descriptor_bytes();
    let xnn_block = &descriptor[XNN_CONFIG_OFFSET..];
    assert_eq!(le32(&xnn_block[xnn::LAYER_COUNT..]), 2);

    // idle again: the device goes back to D0i3
    assert_eq!(sim.device.processor().active_request(), None);
    assert!(sim.regs.in_d0i3());
}

#[test]
fn counters_are_not_read_without_statistics() {
    let sim = started();
    let (session, memory) = session_with_memory(&sim, BASE);

    let handle = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 1).build())
        .unwrap();
    sim.regs.set_perf(1, 1);
    sim.regs.complete_score();
    sim.device.on_interrupt();
    assert_eq!(handle.wait().perf, None);
}

#[test]
fn unmapped_memory_is_rejected_without_register_writes() {
    let sim = started();
    let session = sim.device.open_session();
    let writes = sim.regs.write_count();

    let handle = sim
        .device
        .submit(&session, RequestBuilder::new(7, 1).build())
        .unwrap();

    assert_eq!(
        handle.wait().status,
        RequestStatus::Failed(GnaError::NotMapped { id: 7 })
    );
    assert_eq!(sim.regs.write_count(), writes);
    assert_eq!(sim.device.processor().active_request(), None);
}

#[test]
fn out_of_range_patch_applies_nothing() {
    let sim = started();
    let (session, memory) = session_with_memory(&sim, BASE);
    let writes = sim.regs.write_count();

    let request = RequestBuilder::new(memory, 1)
        .patch(0x10, &[0xAA; 4])
        .patch((LEN - 2) as u32, &[0xBB; 4])
        .build();
    let handle = sim.device.submit(&session, request).unwrap();

    assert!(matches!(
        handle.wait().status,
        RequestStatus::Failed(GnaError::InvalidParameter { .. })
    ));
    assert_eq!(sim.platform.read_user(BASE + 0x10, 4).unwrap(), [0; 4]);
    assert_eq!(sim.platform.read_user(BASE + LEN as u64 - 2, 2).unwrap(), [0; 2]);
    assert_eq!(sim.regs.write_count(), writes);
}

#[test]
fn malformed_buffers_are_rejected() {
    let sim = started();
    let (session, memory) = session_with_memory(&sim, BASE);

    let mut truncated = RequestBuilder::new(memory, 1).patch(0, &[1; 8]).build().to_vec();
    truncated.pop();
    let handle = sim.device.submit(&session, truncated).unwrap();
    assert!(matches!(
        handle.wait().status,
        RequestStatus::Failed(GnaError::InvalidBufferSize { .. })
    ));

    let handle = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 1).mode(3).build())
        .unwrap();
    assert!(matches!(
        handle.wait().status,
        RequestStatus::Failed(GnaError::InvalidParameter { .. })
    ));

    let handle = sim.device.submit(&session, vec![0u8; 12]).unwrap();
    assert!(matches!(
        handle.wait().status,
        RequestStatus::Failed(GnaError::InvalidBufferSize { .. })
    ));
}

#[test]
fn duplicate_interrupt_completes_once() {
    let sim = started();
    let (session, memory) = session_with_memory(&sim, BASE);
    let handle = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 1).build())
        .unwrap();

    sim.regs.complete_score();
    assert_eq!(
        sim.device.on_interrupt(),
        InterruptOutcome::Completed(HardwareStatus::Success)
    );
    assert_eq!(sim.regs.peek(regs::STS) & status::COMPLETED, 0);
    assert_eq!(sim.device.on_interrupt(), InterruptOutcome::Spurious);
    assert_eq!(
        handle.wait().status,
        RequestStatus::Hardware(HardwareStatus::Success)
    );
    assert_eq!(sim.timer.armed_timeout(), None);
}

/// Register window that delivers a completion interrupt for the previous
/// request while the next one writes its descriptor base.
struct LateInterruptWindow {
    regs: Arc<SimRegisters>,
    device: Weak<Device>,
    armed: AtomicBool,
    outcomes: Mutex<Vec<InterruptOutcome>>,
}

impl RegisterInterface for LateInterruptWindow {
    fn read32(&self, offset: usize) -> u32 {
        self.regs.read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.regs.write32(offset, value);
        if offset == regs::DESBASE && self.armed.swap(false, Ordering::SeqCst) {
            if let Some(device) = self.device.upgrade() {
                self.regs.raise_status(status::COMPLETED);
                let outcome = device.on_interrupt();
                self.outcomes.lock().unwrap().push(outcome);
            }
        }
    }

    fn len(&self) -> usize {
        self.regs.len()
    }
}

#[test]
fn late_interrupt_does_not_complete_the_next_request() {
    init_logging();
    let regs = Arc::new(SimRegisters::new());
    let platform = Arc::new(SimPlatform::new());
    let timer = Arc::new(ManualTimer::new());
    let mut window = None;
    let device = Arc::new_cyclic(|this: &Weak<Device>| {
        let late = Arc::new(LateInterruptWindow {
            regs: Arc::clone(&regs),
            device: this.clone(),
            armed: AtomicBool::new(false),
            outcomes: Mutex::new(Vec::new()),
        });
        window = Some(Arc::clone(&late));
        Device::new(
            late as Arc<dyn RegisterInterface>,
            Arc::clone(&platform) as Arc<dyn DmaPlatform>,
            Arc::clone(&timer) as Arc<dyn TimerService>,
            config(),
        )
    });
    let window = window.unwrap();
    device.prepare_hardware().unwrap();
    device.on_power_entry();

    platform.add_user_region(BASE, LEN);
    let session = device.open_session();
    let memory = device.map(&session, BASE, LEN).unwrap();

    let first = device
        .submit(&session, RequestBuilder::new(memory, 1).build())
        .unwrap();
    regs.complete_score();
    assert_eq!(
        device.on_interrupt(),
        InterruptOutcome::Completed(HardwareStatus::Success)
    );
    assert!(first.wait().status.is_success());

    window.armed.store(true, Ordering::SeqCst);
    let second = device
        .submit(&session, RequestBuilder::new(memory, 2).build())
        .unwrap();
    assert_eq!(
        *window.outcomes.lock().unwrap(),
        vec![InterruptOutcome::Spurious]
    );
    assert!(!second.is_complete());
    assert!(regs.is_started());
    assert!(device.processor().active_request().is_some());

    regs.complete_score();
    assert_eq!(
        device.on_interrupt(),
        InterruptOutcome::Completed(HardwareStatus::Success)
    );
    assert!(second.wait().status.is_success());
}

#[test]
fn hung_device_fails_once_on_timeout() {
    let sim = started();
    let (session, memory) = session_with_memory(&sim, BASE);
    let handle = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 1).build())
        .unwrap();
    assert_eq!(sim.timer.armed_timeout(), Some(config().score_timeout));

    // interrupt while the engine is still busy: request stays active
    assert_eq!(
        sim.device.on_interrupt(),
        InterruptOutcome::MoreProcessingRequired
    );
    assert!(!handle.is_complete());

    assert!(sim.timer.fire());
    assert_eq!(
        handle.wait().status,
        RequestStatus::Hardware(HardwareStatus::DeviceFailure)
    );
    assert!(!sim.regs.is_started());
    assert!(!sim.timer.fire());
    assert_eq!(sim.device.on_interrupt(), InterruptOutcome::Spurious);
    assert_eq!(sim.device.on_timeout(), TimeoutOutcome::Idle);

    // the device recovers for the next request
    let next = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 2).build())
        .unwrap();
    sim.regs.complete_score();
    sim.device.on_interrupt();
    assert!(next.wait().status.is_success());
}

#[test]
fn expired_timer_of_a_finished_request_spares_the_next_one() {
    let sim = started();
    let (session, memory) = session_with_memory(&sim, BASE);
    let first = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 1).build())
        .unwrap();

    // The timer expires just as the first request completes.
    let expired = sim.timer.expire().expect("timer armed for the first request");
    sim.regs.complete_score();
    assert_eq!(
        sim.device.on_interrupt(),
        InterruptOutcome::Completed(HardwareStatus::Success)
    );
    assert!(first.wait().status.is_success());

    let second = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 2).build())
        .unwrap();
    let writes = sim.regs.write_count();
    expired();

    assert!(!second.is_complete());
    assert!(sim.regs.is_started());
    assert_eq!(sim.regs.write_count(), writes);
    assert_eq!(sim.timer.armed_timeout(), Some(config().score_timeout));

    sim.regs.complete_score();
    assert_eq!(
        sim.device.on_interrupt(),
        InterruptOutcome::Completed(HardwareStatus::Success)
    );
    assert!(second.wait().status.is_success());
}

#[test]
fn timeout_after_completion_leaves_it_to_the_interrupt() {
    let sim = started();
    let (session, memory) = session_with_memory(&sim, BASE);
    let handle = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 1).build())
        .unwrap();

    sim.regs.complete_score();
    assert_eq!(sim.device.on_timeout(), TimeoutOutcome::AlreadyCompleted);
    assert!(!handle.is_complete());
    assert_eq!(
        sim.device.on_interrupt(),
        InterruptOutcome::Completed(HardwareStatus::Success)
    );
}

fn completions(interrupt: InterruptOutcome, timeout: TimeoutOutcome) -> usize {
    usize::from(matches!(interrupt, InterruptOutcome::Completed(_)))
        + usize::from(matches!(timeout, TimeoutOutcome::Recovered(_)))
}

#[test]
fn interrupt_and_timeout_race_completes_once() {
    let sim = started();
    let (session, memory) = session_with_memory(&sim, BASE);

    for round in 0..64u64 {
        let handle = sim
            .device
            .submit(&session, RequestBuilder::new(memory, round).build())
            .unwrap();
        let finished = round % 2 == 0;
        if finished {
            sim.regs.complete_score();
        }

        let (interrupt, timeout) = std::thread::scope(|scope| {
            let interrupt = scope.spawn(|| sim.device.on_interrupt());
            let timeout = scope.spawn(|| sim.device.on_timeout());
            (interrupt.join().unwrap(), timeout.join().unwrap())
        });

        if finished {
            assert_eq!(interrupt, InterruptOutcome::Completed(HardwareStatus::Success));
        }
        assert_eq!(
            completions(interrupt, timeout),
            1,
            "round {round}: {interrupt:?} / {timeout:?}"
        );

        let expected = if finished {
            HardwareStatus::Success
        } else {
            HardwareStatus::DeviceFailure
        };
        assert_eq!(handle.wait().status, RequestStatus::Hardware(expected));
        assert_eq!(sim.device.processor().active_request(), None);
    }
}

#[test]
fn cancel_by_application_cancels_only_queued_requests_of_that_session() {
    let sim = started();
    let (other, other_memory) = session_with_memory(&sim, BASE);
    let (session, memory) = session_with_memory(&sim, BASE + 0x10_0000);

    let running = sim
        .device
        .submit(&other, RequestBuilder::new(other_memory, 1).build())
        .unwrap();
    let queued: Vec<_> = (0..3)
        .map(|config| {
            sim.device
                .submit(&session, RequestBuilder::new(memory, config).build())
                .unwrap()
        })
        .collect();
    assert_eq!(sim.device.processor().queue().len(), 3);

    assert_eq!(sim.device.cancel_by_application(&session), 3);
    for handle in &queued {
        assert_eq!(handle.wait().status, RequestStatus::Cancelled);
    }
    assert!(!queued.iter().any(|h| h.wait().status.is_success()));

    // the other session's active request is untouched
    assert_eq!(sim.device.processor().active_request(), Some(running.id()));
    assert_eq!(
        sim.device.processor().current_application(),
        Some(other.id())
    );
    sim.regs.complete_score();
    sim.device.on_interrupt();
    assert!(running.wait().status.is_success());
}

#[test]
fn queued_requests_run_in_order() {
    let sim = started();
    let (session, memory) = session_with_memory(&sim, BASE);

    let handles: Vec<_> = (0..3)
        .map(|config| {
            sim.device
                .submit(&session, RequestBuilder::new(memory, config).build())
                .unwrap()
        })
        .collect();

    for handle in &handles {
        assert_eq!(sim.device.processor().active_request(), Some(handle.id()));
        sim.regs.complete_score();
        sim.device.on_interrupt();
        assert!(handle.wait().status.is_success());
    }
    assert!(sim.device.processor().queue().is_empty());
    assert!(sim.regs.in_d0i3());
}

#[test]
fn closing_another_session_leaves_the_active_request_alone() {
    let sim = started();
    let (owner, owner_memory) = session_with_memory(&sim, BASE);
    let (bystander, _) = session_with_memory(&sim, BASE + 0x10_0000);

    let running = sim
        .device
        .submit(&owner, RequestBuilder::new(owner_memory, 1).build())
        .unwrap();
    sim.device.close_session(&bystander);

    assert!(!running.is_complete());
    assert!(sim.regs.is_started());
}

#[test]
fn closing_a_session_cancels_everything_it_owns() {
    let sim = started();
    let (session, memory) = session_with_memory(&sim, BASE);

    let notify = sim.device.arm_notify(&session).unwrap();
    let active = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 1).build())
        .unwrap();
    let queued = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 2).build())
        .unwrap();

    sim.device.close_session(&session);

    assert_eq!(active.wait().status, RequestStatus::Cancelled);
    assert_eq!(queued.wait().status, RequestStatus::Cancelled);
    assert_eq!(notify.wait().status, RequestStatus::Cancelled);
    assert!(!sim.regs.is_started());
    assert_eq!(sim.platform.live_pins(), 0);
    assert_eq!(sim.platform.live_allocations(), 0);
    assert_eq!(
        sim.device
            .submit(&session, RequestBuilder::new(memory, 3).build())
            .unwrap_err(),
        GnaError::Cancelled
    );
}

#[test]
fn unmap_cancels_the_request_using_that_memory() {
    let sim = started();
    let (session, memory) = session_with_memory(&sim, BASE);

    let notify = sim.device.arm_notify(&session).unwrap();
    let active = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 1).build())
        .unwrap();

    sim.device.unmap(&session, memory).unwrap();
    assert_eq!(active.wait().status, RequestStatus::Cancelled);
    assert_eq!(notify.wait().status, RequestStatus::MemoryReleased(memory));
    assert!(notify.wait().status.is_success());
    assert_eq!(sim.device.processor().active_request(), None);
    assert_eq!(sim.platform.live_pins(), 0);
}

#[test]
fn unmap_racing_dispatch_never_starts_released_memory() {
    let sim = started();
    sim.platform.add_user_region(BASE, LEN);
    let session = sim.device.open_session();

    for round in 0..64u64 {
        let memory = sim.device.map(&session, BASE, LEN).unwrap();
        let (handle, unmapped) = std::thread::scope(|scope| {
            let submit = scope.spawn(|| {
                sim.device
                    .submit(&session, RequestBuilder::new(memory, round).build())
                    .unwrap()
            });
            let unmap = scope.spawn(|| sim.device.unmap(&session, memory));
            (submit.join().unwrap(), unmap.join().unwrap())
        });
        unmapped.unwrap();

        let report = handle.try_report().expect("request completed");
        assert!(
            matches!(
                report.status,
                RequestStatus::Cancelled | RequestStatus::Failed(GnaError::NotMapped { .. })
            ),
            "round {round}: {:?}",
            report.status
        );
        assert!(!sim.regs.is_started(), "round {round}");
        assert_eq!(sim.device.processor().active_request(), None);
        assert_eq!(sim.platform.live_pins(), 0);
    }
}

#[test]
fn power_exit_cancels_and_refuses_new_work() {
    let sim = started();
    let (session, memory) = session_with_memory(&sim, BASE);

    let active = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 1).build())
        .unwrap();
    let queued = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 2).build())
        .unwrap();

    sim.device.on_power_exit();
    assert_eq!(active.wait().status, RequestStatus::Cancelled);
    assert_eq!(queued.wait().status, RequestStatus::Cancelled);
    assert!(sim.regs.in_d0i3());
    assert!(!sim.device.is_accepting());
    assert_eq!(
        sim.device
            .submit(&session, RequestBuilder::new(memory, 3).build())
            .unwrap_err(),
        GnaError::DeviceRemoved
    );

    sim.device.on_power_entry();
    let resumed = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 3).build())
        .unwrap();
    sim.regs.complete_score();
    sim.device.on_interrupt();
    assert!(resumed.wait().status.is_success());
}

#[test]
fn submissions_are_refused_before_power_entry() {
    let sim = SimulatedDevice::new(config());
    sim.device.prepare_hardware().unwrap();
    let session = sim.device.open_session();
    assert_eq!(
        sim.device
            .submit(&session, RequestBuilder::new(1, 1).build())
            .unwrap_err(),
        GnaError::DeviceRemoved
    );
}

#[test]
fn overrides_are_reapplied_only_for_a_new_configuration() {
    let sim = started();
    let (session, memory) = session_with_memory(&sim, BASE);
    let field = BASE + layer::field_position(0, layer::OUTPUT_BUFFER) as u64;

    let run = |config_id: u64| {
        let handle = sim
            .device
            .submit(
                &session,
                RequestBuilder::new(memory, config_id)
                    .layers(0, 1)
                    .buffer(0, BufferSlot::Output, 0x3000)
                    .build(),
            )
            .unwrap();
        sim.regs.complete_score();
        sim.device.on_interrupt();
        assert!(handle.wait().status.is_success());
    };

    run(5);
    assert_eq!(le32(&sim.platform.read_user(field, 4).unwrap()), 0x3000);
    assert_eq!(session.memory(memory).unwrap().applied_config(), Some(5));

    assert!(sim.platform.write_user(field, &0x1234u32.to_le_bytes()));
    run(5);
    assert_eq!(le32(&sim.platform.read_user(field, 4).unwrap()), 0x1234);

    run(6);
    assert_eq!(le32(&sim.platform.read_user(field, 4).unwrap()), 0x3000);
}

#[test]
fn hardware_errors_become_completion_statuses() {
    let sim = started();
    let (session, memory) = session_with_memory(&sim, BASE);

    for (bits, expected) in [
        (status::MMU_ERR, HardwareStatus::MmuRequestError),
        (status::DMA_ERR, HardwareStatus::DmaRequestError),
        (status::UNEXPECTED_COMPLETION, HardwareStatus::UnexpectedCompletion),
        (status::VA_OOR, HardwareStatus::VaOutOfRange),
        (status::PARAM_OOR, HardwareStatus::ParamOutOfRange),
    ] {
        let handle = sim
            .device
            .submit(&session, RequestBuilder::new(memory, 1).build())
            .unwrap();
        sim.regs.raise_status(bits);
        assert_eq!(sim.device.on_interrupt(), InterruptOutcome::Completed(expected));
        assert_eq!(handle.wait().status, RequestStatus::Hardware(expected));
        assert!(expected.is_error());
        assert_eq!(sim.regs.peek(regs::STS) & status::ERROR_MASK, 0);
    }

    let handle = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 1).build())
        .unwrap();
    sim.regs.complete_score();
    sim.regs.raise_status(status::SATURATED);
    sim.device.on_interrupt();
    let report = handle.wait();
    assert_eq!(report.status, RequestStatus::Hardware(HardwareStatus::Saturated));
    assert!(report.status.is_success());
}

#[test]
fn preserved_registers_keep_the_device_awake() {
    let sim = SimulatedDevice::started(config().with_preserve_registers(true)).unwrap();
    let (session, memory) = session_with_memory(&sim, BASE);

    let handle = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 1).build())
        .unwrap();
    sim.regs.complete_score();
    sim.device.on_interrupt();
    assert!(handle.wait().status.is_success());
    assert!(!sim.regs.in_d0i3());
}

#[test]
fn wrong_register_window_is_refused() {
    let sim = SimulatedDevice::with_registers(SimRegisters::with_len(0x2000), config());
    assert_eq!(
        sim.device.prepare_hardware(),
        Err(GnaError::MmioSizeMismatch {
            expected: 0x1000,
            actual: 0x2000
        })
    );
}

#[test]
fn stuck_power_command_fails_the_request() {
    let sim = started();
    let (session, memory) = session_with_memory(&sim, BASE);
    sim.regs.stick_power_command();

    let handle = sim
        .device
        .submit(&session, RequestBuilder::new(memory, 1).build())
        .unwrap();
    assert!(matches!(
        handle.wait().status,
        RequestStatus::Failed(GnaError::InvalidStateTransition { .. })
    ));
    assert_eq!(sim.device.processor().active_request(), None);
    assert_eq!(sim.timer.armed_timeout(), None);
}

#[test]
fn recovery_timer_thread_rescues_a_hung_request() {
    let regs = Arc::new(SimRegisters::new());
    let platform = Arc::new(SimPlatform::new());
    let timer = Arc::new(ThreadTimer::new().unwrap());
    let device = Device::new(
        Arc::clone(&regs) as Arc<dyn RegisterInterface>,
        Arc::clone(&platform) as Arc<dyn DmaPlatform>,
        timer as Arc<dyn TimerService>,
        config().with_score_timeout(Duration::from_millis(20)),
    );
    device.prepare_hardware().unwrap();
    device.on_power_entry();

    platform.add_user_region(BASE, LEN);
    let session = device.open_session();
    let memory = device.map(&session, BASE, LEN).unwrap();
    let handle = device
        .submit(&session, RequestBuilder::new(memory, 1).build())
        .unwrap();

    let report = handle
        .wait_timeout(Duration::from_secs(5))
        .expect("recovery timer fired");
    assert_eq!(
        report.status,
        RequestStatus::Hardware(HardwareStatus::DeviceFailure)
    );
    assert!(!regs.is_started());
}
