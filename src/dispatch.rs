//! Ground command execution.
//!
//! Each checksum-valid command maps to exactly one action. The only waits
//! are the fixed payload wake pulse and the delay before a reset; both are
//! timer sleeps, so the comm unit yields while they run.

use std::sync::Arc;
use std::time::Duration;

use crate::config::FlightConfig;
use crate::coordinator::SharedState;
use crate::events::EventKind;
use crate::hal::{LinkError, Peripherals};
use crate::protocol::{Ack, CommandId, CommandPacket, ErrorFlag, SystemState};
use crate::state::TransitionCause;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Acknowledged(Ack),
    TelemetrySent { sequence: u16 },
    /// `GetTelemetry` before the first sensor cycle finished.
    NoTelemetry,
    ImageCaptureStarted,
    ModeChanged { from: SystemState, to: SystemState },
    ModeUnchanged(SystemState),
    /// `SetMode` with a byte that is not a known state.
    ModeRejected(u8),
    /// `SetMode` without a parameter byte.
    ModeMissing,
    ResetIssued,
    FileForwarded { bytes: usize },
    /// Reserved identifier with no behaviour on this controller.
    Ignored(CommandId),
    UnknownCommand(u8),
    LinkFailed { command: CommandId, error: LinkError },
}

pub struct CommandDispatcher {
    shared: Arc<SharedState>,
    peripherals: Peripherals,
    wake_pulse: Duration,
    reset_delay: Duration,
    dispatched: u32,
}

impl CommandDispatcher {
    #[must_use]
    pub fn new(shared: Arc<SharedState>, peripherals: Peripherals, config: &FlightConfig) -> Self {
        Self {
            shared,
            peripherals,
            wake_pulse: config.wake_pulse(),
            reset_delay: config.reset_delay(),
            dispatched: 0,
        }
    }

    #[must_use]
    pub fn dispatched(&self) -> u32 {
        self.dispatched
    }

    pub async fn dispatch(&mut self, cmd: &CommandPacket) -> DispatchOutcome {
        self.dispatched = self.dispatched.wrapping_add(1);

        let Ok(command) = cmd.command() else {
            tracing::warn!(id = cmd.command_id, seq = cmd.sequence_number, "unknown command");
            self.shared.raise(ErrorFlag::Uart);
            self.shared.log_event(
                EventKind::Command,
                format_args!("unknown command 0x{:02X}", cmd.command_id),
            );
            return DispatchOutcome::UnknownCommand(cmd.command_id);
        };

        tracing::debug!(?command, seq = cmd.sequence_number, param_len = cmd.parameter_length, "dispatching");

        match command {
            CommandId::Ping => {
                let ack = Ack::for_sequence(cmd.sequence_number);
                if let Err(outcome) = self.send(command, &ack.to_bytes()) {
                    return outcome;
                }
                DispatchOutcome::Acknowledged(ack)
            }

            CommandId::GetTelemetry => {
                let Some(snapshot) = self.shared.telemetry.latest() else {
                    return DispatchOutcome::NoTelemetry;
                };
                if let Err(outcome) = self.send(command, &snapshot.to_frame()) {
                    return outcome;
                }
                DispatchOutcome::TelemetrySent {
                    sequence: snapshot.sequence_number,
                }
            }

            CommandId::CaptureImage => {
                self.peripherals.payload.set_wake(true);
                tokio::time::sleep(self.wake_pulse).await;
                self.peripherals.payload.set_wake(false);
                self.shared
                    .transition(SystemState::ImageCapture, TransitionCause::CaptureImage);
                DispatchOutcome::ImageCaptureStarted
            }

            CommandId::SetMode => self.set_mode(cmd),

            CommandId::Reset => {
                tracing::error!(seq = cmd.sequence_number, delay_ms = self.reset_delay.as_millis() as u64, "reset commanded");
                self.shared
                    .log_event(EventKind::Reset, format_args!("reset commanded, seq {}", cmd.sequence_number));
                tokio::time::sleep(self.reset_delay).await;
                self.peripherals.system.reset();
                DispatchOutcome::ResetIssued
            }

            CommandId::TransmitFile => {
                let frame = cmd.to_frame();
                if let Err(outcome) = self.send(command, &frame) {
                    return outcome;
                }
                DispatchOutcome::FileForwarded { bytes: frame.len() }
            }

            CommandId::UpdateFirmware | CommandId::SetSchedule | CommandId::Beacon => {
                tracing::debug!(?command, "reserved command, no action");
                DispatchOutcome::Ignored(command)
            }
        }
    }

    fn set_mode(&mut self, cmd: &CommandPacket) -> DispatchOutcome {
        let Some(&requested) = cmd.params().first() else {
            tracing::debug!(seq = cmd.sequence_number, "SetMode without parameter ignored");
            return DispatchOutcome::ModeMissing;
        };

        let Ok(target) = SystemState::try_from(requested) else {
            tracing::warn!(value = requested, "SetMode with unknown state rejected");
            self.shared
                .log_event(EventKind::Command, format_args!("SetMode 0x{requested:02X} rejected"));
            return DispatchOutcome::ModeRejected(requested);
        };

        if matches!(target, SystemState::Nominal | SystemState::Idle) && self.shared.take_payload_shutdown() {
            tracing::info!(%target, "restoring payload power");
            self.peripherals.payload.restore_payload_power();
        }

        match self.shared.transition(target, TransitionCause::Operator) {
            Some(t) => DispatchOutcome::ModeChanged { from: t.from, to: t.to },
            None => DispatchOutcome::ModeUnchanged(target),
        }
    }

    fn send(&self, command: CommandId, bytes: &[u8]) -> Result<(), DispatchOutcome> {
        self.peripherals.companion.transmit(bytes).map_err(|error| {
            tracing::warn!(?command, %error, "companion link transmit failed");
            self.shared.raise(ErrorFlag::Uart);
            DispatchOutcome::LinkFailed { command, error }
        })
    }
}
