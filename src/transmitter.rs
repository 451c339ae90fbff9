use crate::{
    connection::{ConnectionManager, OutboundFrame},
    error::SendError,
    input_fusion::VelocityCommand,
};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::*;

#[derive(Debug, Serialize)]
pub struct MotionMessage {
    pub joystick: VelocityCommand,
    pub frequency: i64,
}

#[derive(Debug, Serialize)]
pub struct MapRequest {
    pub request: &'static str,
}

impl MapRequest {
    pub fn map() -> Self {
        Self { request: "map" }
    }
}

pub fn encode_json<T: Serialize>(message: &T) -> anyhow::Result<OutboundFrame> {
    Ok(OutboundFrame::Text(serde_json::to_string(message)?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitOutcome {
    Sent,
    /// Held back by the rate bound, goes out on the next flush
    Deferred,
    /// Not connected, the command is gone
    Dropped,
}

/// Serializes motion commands onto the connection.
///
/// Commands are real time state, anything that cannot go out right now is
/// dropped rather than queued.
#[derive(Debug)]
pub struct CommandTransmitter {
    min_interval: Duration,
    last_sent: Option<VelocityCommand>,
    last_sent_at: Option<Instant>,
    pending: Option<VelocityCommand>,
}

impl CommandTransmitter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: None,
            last_sent_at: None,
            pending: None,
        }
    }

    pub fn last_sent(&self) -> Option<VelocityCommand> {
        self.last_sent
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn transmit(
        &mut self,
        connection: &ConnectionManager,
        command: VelocityCommand,
        frequency: i64,
    ) -> TransmitOutcome {
        if !connection.is_connected() {
            trace!(?command, "not connected, dropping command");
            self.pending = None;
            return TransmitOutcome::Dropped;
        }
        if !command.is_zero() && self.within_min_interval() {
            self.pending = Some(command);
            return TransmitOutcome::Deferred;
        }
        self.pending = None;
        self.send(connection, command, frequency)
    }

    /// Sends the held command once the rate bound allows it.
    ///
    /// `frequency` is the operator's current selection, not the one in effect
    /// when the command was deferred.
    pub fn flush(
        &mut self,
        connection: &ConnectionManager,
        frequency: i64,
    ) -> Option<TransmitOutcome> {
        if self.within_min_interval() {
            return None;
        }
        let command = self.pending.take()?;
        Some(self.transmit(connection, command, frequency))
    }

    /// Repeats the last motion so the robot's command watchdog stays fed.
    pub fn resend(
        &mut self,
        connection: &ConnectionManager,
        frequency: i64,
    ) -> Option<TransmitOutcome> {
        if self.pending.is_some() {
            return self.flush(connection, frequency);
        }
        match self.last_sent {
            Some(command) if !command.is_zero() => {
                Some(self.transmit(connection, command, frequency))
            }
            _ => None,
        }
    }

    /// Forget what was sent, a new connection starts from a stopped robot.
    pub fn reset(&mut self) {
        self.last_sent = None;
        self.last_sent_at = None;
        self.pending = None;
    }

    fn within_min_interval(&self) -> bool {
        match self.last_sent_at {
            Some(sent_at) if !self.min_interval.is_zero() => sent_at.elapsed() < self.min_interval,
            _ => false,
        }
    }

    fn send(
        &mut self,
        connection: &ConnectionManager,
        command: VelocityCommand,
        frequency: i64,
    ) -> TransmitOutcome {
        let message = MotionMessage {
            joystick: command,
            frequency,
        };
        let frame = match encode_json(&message) {
            Ok(frame) => frame,
            Err(err) => {
                error!(?err, "failed to encode motion command");
                return TransmitOutcome::Dropped;
            }
        };
        match connection.send(frame) {
            Ok(()) => {
                debug!(
                    vx = command.vx,
                    vy = command.vy,
                    omega = command.omega,
                    frequency,
                    "sent motion"
                );
                self.last_sent = Some(command);
                self.last_sent_at = Some(Instant::now());
                TransmitOutcome::Sent
            }
            Err(SendError::NotConnected) => TransmitOutcome::Dropped,
            Err(SendError::LinkGone) => {
                warn!("link task gone while connected, dropping command");
                TransmitOutcome::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{
        tests::RecordingDialer, ConnectionConfig, ConnectionManager, LinkEvent,
    };
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn connected() -> (ConnectionManager, RecordingDialer) {
        let dialer = RecordingDialer::default();
        let (mut manager, _rx) =
            ConnectionManager::new(ConnectionConfig::new("robot", 8000), Arc::new(dialer.clone()));
        manager.open();
        manager.handle(LinkEvent::Opened { generation: 1 });
        (manager, dialer)
    }

    fn sent_json(dialer: &RecordingDialer) -> Vec<Value> {
        dialer
            .take_outbound(0)
            .into_iter()
            .map(|frame| match frame {
                OutboundFrame::Text(text) => serde_json::from_str(&text).unwrap(),
                OutboundFrame::Binary(_) => panic!("motion must be text"),
            })
            .collect()
    }

    #[test]
    fn map_request_wire_format() {
        let frame = encode_json(&MapRequest::map()).unwrap();
        assert_eq!(frame, OutboundFrame::Text(String::from(r#"{"request":"map"}"#)));
    }

    #[tokio::test]
    async fn motion_wire_format() {
        let (manager, dialer) = connected();
        let mut transmitter = CommandTransmitter::new(Duration::ZERO);
        let outcome = transmitter.transmit(&manager, VelocityCommand::new(0.3, -0.5, 0.6), 1200);
        assert_eq!(outcome, TransmitOutcome::Sent);
        assert_eq!(
            sent_json(&dialer),
            vec![json!({"joystick": {"vx": 0.3, "vy": -0.5, "omega": 0.6}, "frequency": 1200})]
        );
    }

    #[tokio::test]
    async fn dropped_when_not_connected() {
        let dialer = RecordingDialer::default();
        let (mut manager, _rx) =
            ConnectionManager::new(ConnectionConfig::new("robot", 8000), Arc::new(dialer.clone()));
        let mut transmitter = CommandTransmitter::new(Duration::ZERO);
        let command = VelocityCommand::new(0.3, 0.0, 0.0);
        assert_eq!(
            transmitter.transmit(&manager, command, 1000),
            TransmitOutcome::Dropped
        );
        manager.open();
        assert_eq!(
            transmitter.transmit(&manager, command, 1000),
            TransmitOutcome::Dropped
        );
        assert!(dialer.take_outbound(0).is_empty());
        assert_eq!(transmitter.last_sent(), None);
    }

    #[tokio::test]
    async fn every_command_sent_without_bound() {
        let (manager, dialer) = connected();
        let mut transmitter = CommandTransmitter::new(Duration::ZERO);
        for step in 0..5 {
            let command = VelocityCommand::new(0.1 * step as f32, 0.0, 0.0);
            assert_eq!(
                transmitter.transmit(&manager, command, 1000),
                TransmitOutcome::Sent
            );
        }
        assert_eq!(sent_json(&dialer).len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_bound_keeps_latest() {
        let (manager, dialer) = connected();
        let mut transmitter = CommandTransmitter::new(Duration::from_millis(100));
        let first = VelocityCommand::new(0.1, 0.0, 0.0);
        let latest = VelocityCommand::new(0.3, 0.0, 0.0);
        assert_eq!(transmitter.transmit(&manager, first, 1000), TransmitOutcome::Sent);
        assert_eq!(
            transmitter.transmit(&manager, VelocityCommand::new(0.2, 0.0, 0.0), 1000),
            TransmitOutcome::Deferred
        );
        assert_eq!(transmitter.transmit(&manager, latest, 1000), TransmitOutcome::Deferred);
        assert_eq!(transmitter.flush(&manager, 1000), None);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(transmitter.flush(&manager, 1000), Some(TransmitOutcome::Sent));
        assert_eq!(transmitter.last_sent(), Some(latest));
        assert_eq!(sent_json(&dialer).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_bypasses_rate_bound() {
        let (manager, _dialer) = connected();
        let mut transmitter = CommandTransmitter::new(Duration::from_millis(100));
        transmitter.transmit(&manager, VelocityCommand::new(0.1, 0.0, 0.0), 1000);
        transmitter.transmit(&manager, VelocityCommand::new(0.2, 0.0, 0.0), 1000);
        assert_eq!(
            transmitter.transmit(&manager, VelocityCommand::zero(), 1000),
            TransmitOutcome::Sent
        );
        assert!(!transmitter.has_pending());
    }

    #[tokio::test]
    async fn resend_repeats_motion_but_not_stop() {
        let (manager, dialer) = connected();
        let mut transmitter = CommandTransmitter::new(Duration::ZERO);
        assert_eq!(transmitter.resend(&manager, 1000), None);
        transmitter.transmit(&manager, VelocityCommand::new(0.0, 0.3, 0.0), 1000);
        assert_eq!(transmitter.resend(&manager, 1000), Some(TransmitOutcome::Sent));
        transmitter.transmit(&manager, VelocityCommand::zero(), 1000);
        assert_eq!(transmitter.resend(&manager, 1000), None);
        assert_eq!(sent_json(&dialer).len(), 3);
    }

    #[tokio::test]
    async fn resend_carries_current_frequency() {
        let (manager, dialer) = connected();
        let mut transmitter = CommandTransmitter::new(Duration::ZERO);
        transmitter.transmit(&manager, VelocityCommand::new(0.3, 0.0, 0.0), 1000);
        transmitter.resend(&manager, 1100);
        let frequencies: Vec<Value> = sent_json(&dialer)
            .into_iter()
            .map(|message| message["frequency"].clone())
            .collect();
        assert_eq!(frequencies, vec![json!(1000), json!(1100)]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_carries_current_frequency() {
        let (manager, dialer) = connected();
        let mut transmitter = CommandTransmitter::new(Duration::from_millis(100));
        transmitter.transmit(&manager, VelocityCommand::new(0.1, 0.0, 0.0), 1000);
        transmitter.transmit(&manager, VelocityCommand::new(0.2, 0.0, 0.0), 1000);
        tokio::time::advance(Duration::from_millis(100)).await;
        transmitter.flush(&manager, 1200);
        let sent = sent_json(&dialer);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1]["frequency"], 1200);
    }
}
