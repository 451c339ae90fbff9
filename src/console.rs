use crate::{
    connection::{
        ConnectionConfig, ConnectionManager, ConnectionNotification, ConnectionState, Dialer,
        InboundFrame, LinkEvent,
    },
    input_fusion::{InputEvent, InputFusionEngine, MotionConfig, VelocityCommand},
    map_decoder::{GridDimensions, MapStreamDecoder, OccupancyGrid},
    renderer::{FrameSink, Renderer, StatusLine},
    transmitter::{encode_json, CommandTransmitter, MapRequest},
};
use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::*;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Operator and timer events, all consumed by the console task in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleEvent {
    Input(InputEvent),
    /// Move the frequency by this many configured steps
    FrequencyStep(i64),
    SetFrequency(i64),
    MapRequestDue { generation: u64 },
    Quit,
}

/// Cheap handle producers use to feed the console.
#[derive(Debug, Clone)]
pub struct ConsoleHandle {
    events: mpsc::UnboundedSender<ConsoleEvent>,
}

impl ConsoleHandle {
    pub fn send(&self, event: ConsoleEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| anyhow::anyhow!("Console stopped"))
    }

    pub fn input(&self, event: InputEvent) -> Result<()> {
        self.send(ConsoleEvent::Input(event))
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

#[derive(Debug)]
pub enum Step {
    Link(LinkEvent),
    Console(ConsoleEvent),
    Resend,
    Flush,
    Quit,
}

/// Single owner of every piece of console state.
///
/// Link events, operator input and timers are funnelled into `next` and
/// applied one at a time by `dispatch`, so decode, fuse and render always run
/// to completion before the next event is looked at.
pub struct Console {
    connection: ConnectionManager,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    events: mpsc::UnboundedReceiver<ConsoleEvent>,
    handle: ConsoleHandle,
    decoder: MapStreamDecoder,
    fusion: InputFusionEngine,
    transmitter: CommandTransmitter,
    renderer: Renderer,
    current_grid: Option<OccupancyGrid>,
    rejected_frames: u64,
    frequency: i64,
    frequency_step: i64,
    map_request_interval: Duration,
    map_timer: Option<CancellationToken>,
    resend_timer: Option<Interval>,
    flush_timer: Option<Interval>,
}

impl Console {
    pub fn new(
        connection: ConnectionConfig,
        map: GridDimensions,
        motion: MotionConfig,
        dialer: Arc<dyn Dialer>,
        sink: Box<dyn FrameSink>,
    ) -> (Self, ConsoleHandle) {
        let map_request_interval = connection.map_request_interval();
        let (connection, link_events) = ConnectionManager::new(connection, dialer);
        let (events_tx, events) = mpsc::unbounded_channel();
        let handle = ConsoleHandle { events: events_tx };
        let min_command_interval = Duration::from_millis(motion.min_command_interval_ms);
        let console = Self {
            connection,
            link_events,
            events,
            handle: handle.clone(),
            decoder: MapStreamDecoder::new(map),
            transmitter: CommandTransmitter::new(min_command_interval),
            renderer: Renderer::new(sink),
            current_grid: None,
            rejected_frames: 0,
            frequency: motion.frequency,
            frequency_step: motion.frequency_step,
            map_request_interval,
            map_timer: None,
            resend_timer: repeating(Duration::from_millis(motion.resend_interval_ms)),
            flush_timer: repeating(min_command_interval),
            fusion: InputFusionEngine::new(motion),
        };
        (console, handle)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn current_grid(&self) -> Option<&OccupancyGrid> {
        self.current_grid.as_ref()
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn frequency(&self) -> i64 {
        self.frequency
    }

    pub fn rejected_frames(&self) -> u64 {
        self.rejected_frames
    }

    pub fn last_command(&self) -> VelocityCommand {
        self.fusion.command()
    }

    pub async fn run(mut self) -> Result<()> {
        self.open();
        loop {
            match self.next().await {
                Step::Quit => break,
                step => self.dispatch(step),
            }
        }
        self.shutdown().await;
        Ok(())
    }

    pub fn open(&mut self) {
        let notification = self.connection.open();
        self.apply(notification);
    }

    pub async fn next(&mut self) -> Step {
        tokio::select! {
            Some(event) = self.link_events.recv() => Step::Link(event),
            event = self.events.recv() => match event {
                Some(ConsoleEvent::Quit) | None => Step::Quit,
                Some(event) => Step::Console(event),
            },
            _ = tick(&mut self.resend_timer) => Step::Resend,
            _ = tick(&mut self.flush_timer), if self.transmitter.has_pending() => Step::Flush,
        }
    }

    pub fn dispatch(&mut self, step: Step) {
        match step {
            Step::Link(event) => {
                let notification = self.connection.handle(event);
                self.apply(notification);
            }
            Step::Console(event) => self.on_console_event(event),
            Step::Resend => {
                self.transmitter.resend(&self.connection, self.frequency);
            }
            Step::Flush => {
                self.transmitter.flush(&self.connection, self.frequency);
            }
            Step::Quit => {}
        }
    }

    /// Stops the robot if we still can, then drops the link.
    pub async fn shutdown(&mut self) {
        info!("shutting down console");
        if self.connection.is_connected() {
            self.transmitter
                .transmit(&self.connection, VelocityCommand::zero(), self.frequency);
        }
        self.stop_map_timer();
        let notification = self.connection.shutdown(SHUTDOWN_GRACE).await;
        self.apply(notification);
    }

    fn apply(&mut self, notification: Option<ConnectionNotification>) {
        match notification {
            Some(ConnectionNotification::StateChanged { state, generation }) => {
                self.on_state_changed(state, generation)
            }
            Some(ConnectionNotification::Message(frame)) => self.on_frame(frame),
            None => {}
        }
    }

    fn on_state_changed(&mut self, state: ConnectionState, generation: u64) {
        info!(?state, generation, "connection state changed");
        self.transmitter.reset();
        match state {
            ConnectionState::Connected => {
                self.start_map_timer(generation);
                // input still held across a reconnect has to reach the new link
                let command = self.fusion.command();
                if !command.is_zero() {
                    self.transmitter
                        .transmit(&self.connection, command, self.frequency);
                }
            }
            ConnectionState::Connecting | ConnectionState::Disconnected => self.stop_map_timer(),
        }
        self.refresh_status();
    }

    fn on_frame(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::Binary(data) => match self.decoder.decode(&data) {
                Ok(grid) => {
                    if let Err(err) = self.renderer.render(&grid) {
                        error!(?err, "failed to draw map frame");
                    }
                    self.current_grid = Some(grid);
                }
                Err(err) => {
                    self.rejected_frames += 1;
                    warn!(%err, rejected = self.rejected_frames, "discarding map frame");
                    self.refresh_status();
                }
            },
            InboundFrame::Text(text) => {
                debug!(len = text.len(), "ignoring text frame");
            }
        }
    }

    fn on_console_event(&mut self, event: ConsoleEvent) {
        match event {
            ConsoleEvent::Input(input) => {
                let command = self.fusion.handle(input);
                self.transmitter
                    .transmit(&self.connection, command, self.frequency);
                self.refresh_status();
            }
            ConsoleEvent::FrequencyStep(steps) => {
                self.frequency = self
                    .frequency
                    .saturating_add(steps.saturating_mul(self.frequency_step))
                    .max(0);
                info!(frequency = self.frequency, "frequency changed");
                self.refresh_status();
            }
            ConsoleEvent::SetFrequency(frequency) => {
                self.frequency = frequency;
                info!(frequency = self.frequency, "frequency changed");
                self.refresh_status();
            }
            ConsoleEvent::MapRequestDue { generation } => self.request_map(generation),
            ConsoleEvent::Quit => {}
        }
    }

    fn request_map(&mut self, generation: u64) {
        if generation != self.connection.generation() || !self.connection.is_connected() {
            trace!(generation, "stale map request timer");
            return;
        }
        let frame = match encode_json(&MapRequest::map()) {
            Ok(frame) => frame,
            Err(err) => {
                error!(?err, "failed to encode map request");
                return;
            }
        };
        if let Err(err) = self.connection.send(frame) {
            debug!(%err, "map request not sent");
        }
    }

    fn start_map_timer(&mut self, generation: u64) {
        self.stop_map_timer();
        let cancel = CancellationToken::new();
        let period = self.map_request_interval;
        let handle = self.handle.clone();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if handle.send(ConsoleEvent::MapRequestDue { generation }).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        self.map_timer = Some(cancel);
    }

    fn stop_map_timer(&mut self) {
        if let Some(cancel) = self.map_timer.take() {
            cancel.cancel();
        }
    }

    fn refresh_status(&mut self) {
        let status = StatusLine {
            state: self.connection.state(),
            command: self.fusion.command(),
            frequency: self.frequency,
            rejected_frames: self.rejected_frames,
        };
        if let Err(err) = self.renderer.show_status(&status) {
            error!(?err, "failed to draw status");
        }
    }
}

fn repeating(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(timer)
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
