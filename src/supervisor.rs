//! VM lifecycle supervision.
//!
//! One event-loop task multiplexes {SIGCHLD, SIGINT, SIGTERM} onto the
//! shutdown state machine and pushes the terminal exit code onto a
//! channel the main task blocks on. Only the event-loop task mutates
//! shutdown state, so signal events are handled strictly in delivery
//! order with no further synchronization.
//!
//! SIGINT means "ask the guest nicely, no deadline" (a human can always
//! press ^C again to force). SIGTERM means "ask nicely with a deadline"
//! for process managers that need a bounded shutdown. The child's own
//! exit always wins by arrival order.

use crate::config::VmConfig;
use crate::error::Result;
use crate::network::{self, tap::IpLink};
use crate::{qemu, qmp};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// How long a SIGTERM-initiated graceful shutdown may wait for the guest
/// before the supervisor gives up and exits anyway.
const ESCALATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Shutdown progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// No shutdown requested.
    Running,
    /// A power-down request was delivered; waiting for the guest.
    GracefulRequested,
    /// Waiting was abandoned; the supervisor is exiting.
    ForcedPending,
}

/// What the event loop should do in response to a shutdown signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Ask the guest to power down over the management channel.
    RequestPowerDown {
        /// Arm the escalation timer once the request is delivered.
        with_deadline: bool,
    },
    /// Stop supervising immediately with exit code 0.
    ForceExit,
    /// Nothing to do in the current state.
    Ignore,
}

/// The shutdown state machine.
///
/// Decides per signal; the power-down transition is committed separately
/// (via [`powerdown_delivered`](Self::powerdown_delivered)) because the
/// management channel may be unreachable, in which case the state must
/// stay put so the operator can re-signal.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: ShutdownState,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: ShutdownState::Running,
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.state
    }

    /// Host interrupt (SIGINT). The same human signal pressed twice means
    /// "stop now".
    pub fn interrupt(&mut self) -> Action {
        match self.state {
            ShutdownState::Running => Action::RequestPowerDown {
                with_deadline: false,
            },
            ShutdownState::GracefulRequested => {
                self.state = ShutdownState::ForcedPending;
                Action::ForceExit
            }
            ShutdownState::ForcedPending => Action::Ignore,
        }
    }

    /// Host termination request (SIGTERM). No-op once a graceful or
    /// forced stop is already underway.
    pub fn terminate(&mut self) -> Action {
        match self.state {
            ShutdownState::Running => Action::RequestPowerDown {
                with_deadline: true,
            },
            _ => Action::Ignore,
        }
    }

    /// Commit the transition once the power-down request was delivered.
    pub fn powerdown_delivered(&mut self) {
        self.state = ShutdownState::GracefulRequested;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Supervise one VM to completion; returns the process exit code.
///
/// Sequence: provision the guest network, launch qemu, dispatch signals
/// until something terminal happens, tear the tap down, hand the code
/// back to `main`.
pub async fn run(config: VmConfig) -> Result<i32> {
    let link = IpLink;

    let net = network::provision(&config.network, &link)?;
    net.start_responder()?;

    let vm = qemu::launch(&config)?;
    info!(pid = vm.pid(), "qemu started");

    let mut sigchld = signal(SignalKind::child())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
    let qmp_socket = config.qmp_socket.clone();

    tokio::spawn(async move {
        let mut shutdown = ShutdownCoordinator::new();

        loop {
            let action = tokio::select! {
                _ = sigchld.recv() => {
                    match qemu::reap() {
                        Ok(Some(exit)) => {
                            info!(
                                %exit,
                                uptime_secs = vm.uptime().as_secs(),
                                "vm terminated"
                            );
                            let _ = exit_tx.send(exit.code());
                            return;
                        }
                        // Not a terminated child; keep waiting.
                        Ok(None) => continue,
                        Err(e) => {
                            error!(error = %e, "failed to reap vm process");
                            let _ = exit_tx.send(1);
                            return;
                        }
                    }
                }
                _ = sigint.recv() => shutdown.interrupt(),
                _ = sigterm.recv() => shutdown.terminate(),
            };

            match action {
                Action::RequestPowerDown { with_deadline } => {
                    info!("sending ACPI power-down request to vm");
                    match qmp::request_powerdown(&qmp_socket).await {
                        Ok(()) => {
                            shutdown.powerdown_delivered();
                            if with_deadline {
                                spawn_escalation_timer(exit_tx.clone(), ESCALATION_TIMEOUT);
                            }
                        }
                        // State stays put so the next signal retries the
                        // request (or forces, for a second SIGINT).
                        Err(e) => error!(error = %e, "power-down request failed"),
                    }
                }
                Action::ForceExit => {
                    info!("forcing shutdown");
                    let _ = exit_tx.send(0);
                    return;
                }
                Action::Ignore => {}
            }
        }
    });

    // First arrival wins: a late escalation timer or a child exit racing
    // a forced stop lands in a drained channel and is discarded.
    let code = exit_rx.recv().await.unwrap_or(1);

    net.teardown(&link);
    Ok(code)
}

/// After `delay`, push exit code 0 onto the exit channel.
///
/// The timer is never cancelled; if the guest exits first its code has
/// already been consumed and this send is discarded, which makes the
/// timer's effect idempotent.
fn spawn_escalation_timer(exit_tx: mpsc::UnboundedSender<i32>, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        warn!(
            timeout_secs = delay.as_secs(),
            "graceful shutdown deadline passed, exiting"
        );
        let _ = exit_tx.send(0);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_requests_powerdown_without_deadline() {
        let mut shutdown = ShutdownCoordinator::new();

        assert_eq!(
            shutdown.interrupt(),
            Action::RequestPowerDown {
                with_deadline: false
            }
        );
        // Not committed until the request is delivered.
        assert_eq!(shutdown.state(), ShutdownState::Running);

        shutdown.powerdown_delivered();
        assert_eq!(shutdown.state(), ShutdownState::GracefulRequested);
    }

    #[test]
    fn test_second_interrupt_forces() {
        let mut shutdown = ShutdownCoordinator::new();
        shutdown.interrupt();
        shutdown.powerdown_delivered();

        // No second power-down attempt, just a forced stop.
        assert_eq!(shutdown.interrupt(), Action::ForceExit);
        assert_eq!(shutdown.state(), ShutdownState::ForcedPending);

        // Anything after that is ignored.
        assert_eq!(shutdown.interrupt(), Action::Ignore);
        assert_eq!(shutdown.terminate(), Action::Ignore);
    }

    #[test]
    fn test_failed_powerdown_leaves_state_retryable() {
        let mut shutdown = ShutdownCoordinator::new();

        // The request was never delivered, so the next interrupt asks
        // again instead of forcing.
        assert_eq!(
            shutdown.interrupt(),
            Action::RequestPowerDown {
                with_deadline: false
            }
        );
        assert_eq!(
            shutdown.interrupt(),
            Action::RequestPowerDown {
                with_deadline: false
            }
        );
        assert_eq!(shutdown.state(), ShutdownState::Running);
    }

    #[test]
    fn test_terminate_requests_powerdown_with_deadline() {
        let mut shutdown = ShutdownCoordinator::new();

        assert_eq!(
            shutdown.terminate(),
            Action::RequestPowerDown {
                with_deadline: true
            }
        );
        shutdown.powerdown_delivered();

        // A repeated terminate is a no-op while graceful is underway.
        assert_eq!(shutdown.terminate(), Action::Ignore);
        assert_eq!(shutdown.state(), ShutdownState::GracefulRequested);
    }

    #[test]
    fn test_interrupt_still_forces_after_terminate() {
        let mut shutdown = ShutdownCoordinator::new();
        shutdown.terminate();
        shutdown.powerdown_delivered();

        assert_eq!(shutdown.interrupt(), Action::ForceExit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_exit_beats_escalation_timer() {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        spawn_escalation_timer(exit_tx.clone(), ESCALATION_TIMEOUT);

        // The child exits before the deadline; its code must win even
        // though the timer still fires later.
        let _ = exit_tx.send(137);

        assert_eq!(exit_rx.recv().await, Some(137));
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalation_timer_fires_zero() {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        spawn_escalation_timer(exit_tx, ESCALATION_TIMEOUT);

        assert_eq!(exit_rx.recv().await, Some(0));
    }

    #[tokio::test]
    async fn test_late_sends_are_discarded_without_blocking() {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();

        let _ = exit_tx.send(7);
        assert_eq!(exit_rx.recv().await, Some(7));
        drop(exit_rx);

        // The receiver is gone; a later terminal decision must not hang
        // or panic the producer.
        assert!(exit_tx.send(0).is_err());
    }
}
