//! Bus main loop
//!
//! A single thread polls the bus for a selection, identifies the addressed
//! controller and drives its phase machine until the bus is free again.
//! While a target transaction is in flight the thread runs with the highest
//! real-time FIFO priority; between transactions it drops back to the
//! default policy. Priority changes happen outside the daemon lock.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::*;

use crate::daemon::Daemon;
use crate::scsi::ShutdownMode;
use crate::scsi::bus::ScsiBus;
use crate::scsi::controller::Phase;

/// Grace window for the initiator to release BSY after asserting SEL
const BSY_RELEASE_TIMEOUT: Duration = Duration::from_secs(3);

/// Pins the bus thread to one CPU core
pub fn pin_to_core(core: usize) {
    #[cfg(target_os = "linux")]
    {
        let mut cpu_set = nix::sched::CpuSet::new();
        if cpu_set.set(core).is_ok() {
            if let Err(e) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &cpu_set)
            {
                warn!("Setting CPU affinity failed: {}", e);
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = core;
}

#[cfg(target_os = "linux")]
fn set_realtime_priority(enable: bool) {
    // SAFETY: plain syscalls on the current thread
    unsafe {
        if enable {
            let param = libc::sched_param {
                sched_priority: libc::sched_get_priority_max(libc::SCHED_FIFO),
            };
            if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
                trace!("Raising to SCHED_FIFO failed (missing privileges?)");
            }
        } else {
            let param = libc::sched_param { sched_priority: 0 };
            libc::sched_setscheduler(0, libc::SCHED_OTHER, &param);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_realtime_priority(_enable: bool) {}

/// Acts on a shutdown scheduled via SCSI or the control protocol
pub fn execute_shutdown(daemon: &mut Daemon, mode: ShutdownMode) {
    match mode {
        ShutdownMode::StopProcess => {
            info!("Daemon shutdown requested");
            daemon.detach_all();
            std::process::exit(0);
        }
        ShutdownMode::StopHost => {
            info!("Host shutdown requested");
            daemon.detach_all();
            if let Err(e) = Command::new("init").arg("0").status() {
                error!("Host shutdown failed: {}", e);
            }
        }
        ShutdownMode::RestartHost => {
            info!("Host restart requested");
            daemon.detach_all();
            if let Err(e) = Command::new("init").arg("6").status() {
                error!("Host restart failed: {}", e);
            }
        }
    }
}

/// Runs the bus loop until `running` is cleared
pub fn run_bus_loop(bus: &mut dyn ScsiBus, daemon: &Arc<Mutex<Daemon>>, running: &AtomicBool) {
    pin_to_core(3);

    while running.load(Ordering::Relaxed) {
        // Wait for a selection
        if !bus.poll_select_event() {
            continue;
        }

        bus.acquire();
        if !bus.get_sel() {
            std::thread::yield_now();
            continue;
        }

        // The initiator may still assert BSY while setting the ID
        if bus.get_bsy() {
            let start = Instant::now();
            while start.elapsed() < BSY_RELEASE_TIMEOUT {
                bus.acquire();
                if !bus.get_bsy() {
                    break;
                }
            }
        }

        // Stop if the bus is busy or another device responded
        if bus.get_bsy() || !bus.get_sel() {
            continue;
        }

        let id_data = bus.dat();

        // Highest priority while the target transaction is in progress;
        // raised before taking the lock
        set_realtime_priority(true);

        let shutdown = {
            let mut daemon = daemon.lock().unwrap();

            let started = {
                let Some((controller, initiator_id)) =
                    daemon.registry.identify_controller(id_data)
                else {
                    set_realtime_priority(false);
                    continue;
                };

                if controller.process(bus, initiator_id) != Phase::Selection {
                    // Selection did not start, return to bus monitoring
                    false
                } else {
                    // Loop until the bus is free
                    while running.load(Ordering::Relaxed)
                        && controller.process(bus, initiator_id) != Phase::BusFree
                    {}
                    true
                }
            };

            if started {
                let Daemon {
                    registry,
                    reservations,
                    ..
                } = &mut *daemon;
                let controller = registry.identify_controller(id_data).map(|(c, _)| c);

                controller.and_then(|controller| {
                    // Target-side ejects release their image reservation
                    for path in controller.drain_released_images() {
                        reservations.release(&path);
                    }
                    controller.take_pending_shutdown()
                })
            } else {
                None
            }
        };

        set_realtime_priority(false);

        if let Some(mode) = shutdown {
            let mut daemon = daemon.lock().unwrap();
            execute_shutdown(&mut daemon, mode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::scriptbus::ScriptBus;
    use crate::scsi::target::DeviceType;
    use crate::scsi::target::factory::{DeviceProfile, create_device};

    /// Full end-to-end pass: selection on the scripted bus, one command,
    /// released reservation bookkeeping
    #[test]
    fn bus_loop_processes_one_transaction() {
        let mut daemon = Daemon::new();
        let device = create_device(&DeviceProfile {
            device_type: DeviceType::HostServices,
            id: 3,
            lun: 0,
            filename: String::new(),
        })
        .unwrap();
        daemon.registry.attach_to_controller(3, device);
        let daemon = Arc::new(Mutex::new(daemon));

        let mut bus = ScriptBus::new();
        // Initiator 7 selects target 3, TEST UNIT READY
        bus.begin_selection((1 << 3) | (1 << 7), false);
        bus.queue_cdb(&[0x00, 0, 0, 0, 0, 0]);

        let running = Arc::new(AtomicBool::new(true));

        // One iteration is enough; the script has no further selection
        {
            let mut guard = daemon.lock().unwrap();
            let (controller, initiator_id) = guard.registry.identify_controller(bus.dat()).unwrap();
            assert_eq!(initiator_id, Some(7));

            assert_eq!(controller.process(&mut bus, initiator_id), Phase::Selection);
            while controller.process(&mut bus, initiator_id) != Phase::BusFree {}
        }

        assert_eq!(bus.status_bytes(), &[0x00]);
        assert!(running.load(Ordering::Relaxed));
    }
}
