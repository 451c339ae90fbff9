use crate::{
    console::{ConsoleEvent, ConsoleHandle},
    input_fusion::{InputEvent, Key},
    renderer::{Frame, FrameSink, Rgba, StatusLine},
};
use anyhow::Result;
use crossterm::{
    cursor::{Hide, MoveTo, Show},
    event::{
        self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
        KeyModifiers, KeyboardEnhancementFlags, MouseButton, MouseEvent, MouseEventKind,
        PopKeyboardEnhancementFlags, PushKeyboardEnhancementFlags,
    },
    execute, queue,
    style::{Color, Print, ResetColor, SetBackgroundColor, SetForegroundColor},
    terminal::{
        self, disable_raw_mode, enable_raw_mode, Clear, ClearType, EnterAlternateScreen,
        LeaveAlternateScreen,
    },
};
use std::{
    collections::BTreeMap,
    io::{self, Stdout, Write},
    time::{Duration, Instant},
};
use tracing::*;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Longer than the usual auto repeat delay so a held key is not dropped
/// before its first repeat arrives.
const KEY_HOLD_TIMEOUT: Duration = Duration::from_millis(700);
/// Mouse travel, in terminal cells, that counts as full joystick deflection.
const JOYSTICK_RADIUS_COLUMNS: f32 = 16.0;
const JOYSTICK_RADIUS_ROWS: f32 = 8.0;

/// Raw mode, alternate screen and mouse capture for the lifetime of the guard.
pub struct TerminalGuard {
    release_events: bool,
}

impl TerminalGuard {
    pub fn enter() -> Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, Hide, EnableMouseCapture)?;
        let release_events = terminal::supports_keyboard_enhancement().unwrap_or(false);
        if release_events {
            execute!(
                stdout,
                PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::REPORT_EVENT_TYPES)
            )?;
        } else {
            info!("terminal does not report key releases, using hold timeout");
        }
        Ok(Self { release_events })
    }

    pub fn release_events(&self) -> bool {
        self.release_events
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let mut stdout = io::stdout();
        if self.release_events {
            _ = execute!(stdout, PopKeyboardEnhancementFlags);
        }
        _ = execute!(stdout, DisableMouseCapture, ResetColor, Show, LeaveAlternateScreen);
        _ = disable_raw_mode();
    }
}

/// Turns crossterm events into console events.
///
/// Keeps track of held keys so auto repeat does not re-trigger presses, and
/// synthesizes releases on terminals that never report them.
pub struct InputTranslator {
    release_events: bool,
    hold_timeout: Duration,
    held: BTreeMap<Key, Instant>,
    joystick_origin: Option<(u16, u16)>,
}

impl InputTranslator {
    pub fn new(release_events: bool, hold_timeout: Duration) -> Self {
        Self {
            release_events,
            hold_timeout,
            held: BTreeMap::new(),
            joystick_origin: None,
        }
    }

    pub fn translate(&mut self, event: Event, now: Instant) -> Vec<ConsoleEvent> {
        match event {
            Event::Key(key) => self.key(key, now),
            Event::Mouse(mouse) => self.mouse(mouse).into_iter().collect(),
            _ => vec![],
        }
    }

    /// Releases keys that have not been seen within the hold timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<ConsoleEvent> {
        if self.release_events {
            return vec![];
        }
        let expired: Vec<Key> = self
            .held
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= self.hold_timeout)
            .map(|(key, _)| *key)
            .collect();
        expired
            .into_iter()
            .map(|key| {
                self.held.remove(&key);
                ConsoleEvent::Input(InputEvent::KeyUp(key))
            })
            .collect()
    }

    fn key(&mut self, event: KeyEvent, now: Instant) -> Vec<ConsoleEvent> {
        let pressed = matches!(event.kind, KeyEventKind::Press | KeyEventKind::Repeat);
        match event.code {
            KeyCode::Esc if pressed => return vec![ConsoleEvent::Quit],
            KeyCode::Char('c') if pressed && event.modifiers.contains(KeyModifiers::CONTROL) => {
                return vec![ConsoleEvent::Quit]
            }
            KeyCode::Char('+') | KeyCode::Char('=') if event.kind == KeyEventKind::Press => {
                return vec![ConsoleEvent::FrequencyStep(1)]
            }
            KeyCode::Char('-') if event.kind == KeyEventKind::Press => {
                return vec![ConsoleEvent::FrequencyStep(-1)]
            }
            _ => {}
        }
        let Some(key) = motion_key(event.code) else {
            return vec![];
        };
        if pressed {
            if self.held.insert(key, now).is_none() {
                return vec![ConsoleEvent::Input(InputEvent::KeyDown(key))];
            }
            vec![]
        } else if self.held.remove(&key).is_some() {
            vec![ConsoleEvent::Input(InputEvent::KeyUp(key))]
        } else {
            vec![]
        }
    }

    fn mouse(&mut self, event: MouseEvent) -> Option<ConsoleEvent> {
        match event.kind {
            MouseEventKind::Down(MouseButton::Left) => {
                self.joystick_origin = Some((event.column, event.row));
                None
            }
            MouseEventKind::Drag(MouseButton::Left) => {
                let (origin_column, origin_row) = self.joystick_origin?;
                let x = (event.column as f32 - origin_column as f32) / JOYSTICK_RADIUS_COLUMNS;
                // rows grow downwards, dragging up means forward
                let y = (origin_row as f32 - event.row as f32) / JOYSTICK_RADIUS_ROWS;
                Some(ConsoleEvent::Input(InputEvent::JoystickMove { x, y }))
            }
            MouseEventKind::Up(MouseButton::Left) => self
                .joystick_origin
                .take()
                .map(|_| ConsoleEvent::Input(InputEvent::JoystickRelease)),
            _ => None,
        }
    }
}

fn motion_key(code: KeyCode) -> Option<Key> {
    match code {
        KeyCode::Char(c) => Key::from_name(&c.to_string()),
        KeyCode::Up => Some(Key::Up),
        KeyCode::Down => Some(Key::Down),
        KeyCode::Left => Some(Key::Left),
        KeyCode::Right => Some(Key::Right),
        _ => None,
    }
}

/// Polls the terminal on a blocking thread and forwards console events.
pub fn spawn_input_reader(
    handle: ConsoleHandle,
    release_events: bool,
) -> tokio::task::JoinHandle<Result<()>> {
    tokio::task::spawn_blocking(move || {
        let mut translator = InputTranslator::new(release_events, KEY_HOLD_TIMEOUT);
        loop {
            if handle.is_closed() {
                return Ok(());
            }
            let mut events = translator.expire(Instant::now());
            if event::poll(POLL_INTERVAL)? {
                events.extend(translator.translate(event::read()?, Instant::now()));
            }
            for event in events {
                let quit = event == ConsoleEvent::Quit;
                handle.send(event)?;
                if quit {
                    return Ok(());
                }
            }
        }
    })
}

/// Draws frames with half block characters, two map rows per terminal row.
pub struct TerminalSink {
    stdout: Stdout,
}

impl Default for TerminalSink {
    fn default() -> Self {
        Self {
            stdout: io::stdout(),
        }
    }
}

impl TerminalSink {
    fn map_area() -> Result<(usize, usize)> {
        let (columns, rows) = terminal::size()?;
        // bottom row belongs to the status line
        let rows = rows.saturating_sub(1) as usize;
        Ok((columns as usize, rows * 2))
    }
}

impl FrameSink for TerminalSink {
    fn draw(&mut self, frame: &Frame) -> Result<()> {
        let (columns, pixel_rows) = Self::map_area()?;
        if columns == 0 || pixel_rows == 0 {
            return Ok(());
        }
        let scale = downscale_factor(frame.width(), frame.height(), columns, pixel_rows);
        let out_columns = (frame.width() / scale).min(columns);
        let out_rows = (frame.height() / scale).min(pixel_rows) / 2;

        let mut current: Option<(Rgba, Rgba)> = None;
        for row in 0..out_rows {
            queue!(self.stdout, MoveTo(0, row as u16))?;
            for column in 0..out_columns {
                let x = column * scale;
                let top = frame.pixel(x, row * 2 * scale);
                let bottom = frame.pixel(x, (row * 2 + 1) * scale);
                let (Some(top), Some(bottom)) = (top, bottom) else {
                    continue;
                };
                if current != Some((top, bottom)) {
                    queue!(
                        self.stdout,
                        SetForegroundColor(to_color(top)),
                        SetBackgroundColor(to_color(bottom))
                    )?;
                    current = Some((top, bottom));
                }
                queue!(self.stdout, Print('▀'))?;
            }
        }
        queue!(self.stdout, ResetColor)?;
        self.stdout.flush()?;
        Ok(())
    }

    fn show_status(&mut self, status: &StatusLine) -> Result<()> {
        let (columns, rows) = terminal::size()?;
        let line = format_status(status);
        let line: String = line.chars().take(columns as usize).collect();
        queue!(
            self.stdout,
            MoveTo(0, rows.saturating_sub(1)),
            ResetColor,
            Clear(ClearType::CurrentLine),
            Print(line)
        )?;
        self.stdout.flush()?;
        Ok(())
    }
}

fn downscale_factor(width: usize, height: usize, columns: usize, pixel_rows: usize) -> usize {
    let horizontal = width.div_ceil(columns.max(1));
    let vertical = height.div_ceil(pixel_rows.max(1));
    horizontal.max(vertical).max(1)
}

fn to_color(color: Rgba) -> Color {
    Color::Rgb {
        r: color.r,
        g: color.g,
        b: color.b,
    }
}

pub fn format_status(status: &StatusLine) -> String {
    format!(
        "{:?} | vx {:+.2} vy {:+.2} omega {:+.2} | freq {} | rejected {} | wasd/arrows move, q/e turn, drag to steer, +/- freq, esc quit",
        status.state,
        status.command.vx,
        status.command.vy,
        status.command.omega,
        status.frequency,
        status.rejected_frames
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connection::ConnectionState, input_fusion::VelocityCommand};
    use crossterm::event::KeyEventState;

    fn key(code: KeyCode, kind: KeyEventKind) -> Event {
        Event::Key(KeyEvent {
            code,
            modifiers: KeyModifiers::NONE,
            kind,
            state: KeyEventState::NONE,
        })
    }

    fn mouse(kind: MouseEventKind, column: u16, row: u16) -> Event {
        Event::Mouse(MouseEvent {
            kind,
            column,
            row,
            modifiers: KeyModifiers::NONE,
        })
    }

    #[test]
    fn press_and_release_with_enhanced_terminal() {
        let mut translator = InputTranslator::new(true, KEY_HOLD_TIMEOUT);
        let now = Instant::now();
        assert_eq!(
            translator.translate(key(KeyCode::Char('w'), KeyEventKind::Press), now),
            vec![ConsoleEvent::Input(InputEvent::KeyDown(Key::W))]
        );
        assert!(translator
            .translate(key(KeyCode::Char('w'), KeyEventKind::Repeat), now)
            .is_empty());
        assert!(translator.expire(now + Duration::from_secs(5)).is_empty());
        assert_eq!(
            translator.translate(key(KeyCode::Char('w'), KeyEventKind::Release), now),
            vec![ConsoleEvent::Input(InputEvent::KeyUp(Key::W))]
        );
    }

    #[test]
    fn hold_timeout_synthesizes_release() {
        let mut translator = InputTranslator::new(false, Duration::from_millis(700));
        let start = Instant::now();
        translator.translate(key(KeyCode::Up, KeyEventKind::Press), start);
        // auto repeat keeps the key alive
        translator.translate(
            key(KeyCode::Up, KeyEventKind::Press),
            start + Duration::from_millis(600),
        );
        assert!(translator.expire(start + Duration::from_millis(1000)).is_empty());
        assert_eq!(
            translator.expire(start + Duration::from_millis(1300)),
            vec![ConsoleEvent::Input(InputEvent::KeyUp(Key::Up))]
        );
        assert!(translator.expire(start + Duration::from_millis(2000)).is_empty());
    }

    #[test]
    fn unbound_keys_are_ignored() {
        let mut translator = InputTranslator::new(true, KEY_HOLD_TIMEOUT);
        assert!(translator
            .translate(key(KeyCode::Char('x'), KeyEventKind::Press), Instant::now())
            .is_empty());
    }

    #[test]
    fn operator_keys() {
        let mut translator = InputTranslator::new(true, KEY_HOLD_TIMEOUT);
        let now = Instant::now();
        assert_eq!(
            translator.translate(key(KeyCode::Esc, KeyEventKind::Press), now),
            vec![ConsoleEvent::Quit]
        );
        assert_eq!(
            translator.translate(key(KeyCode::Char('+'), KeyEventKind::Press), now),
            vec![ConsoleEvent::FrequencyStep(1)]
        );
        assert!(translator
            .translate(key(KeyCode::Char('+'), KeyEventKind::Release), now)
            .is_empty());
        let ctrl_c = Event::Key(KeyEvent {
            code: KeyCode::Char('c'),
            modifiers: KeyModifiers::CONTROL,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        });
        assert_eq!(translator.translate(ctrl_c, now), vec![ConsoleEvent::Quit]);
    }

    #[test]
    fn mouse_drag_steers() {
        let mut translator = InputTranslator::new(true, KEY_HOLD_TIMEOUT);
        let now = Instant::now();
        assert!(translator
            .translate(mouse(MouseEventKind::Drag(MouseButton::Left), 5, 5), now)
            .is_empty());
        assert!(translator
            .translate(mouse(MouseEventKind::Down(MouseButton::Left), 40, 20), now)
            .is_empty());
        assert_eq!(
            translator.translate(mouse(MouseEventKind::Drag(MouseButton::Left), 48, 16), now),
            vec![ConsoleEvent::Input(InputEvent::JoystickMove { x: 0.5, y: 0.5 })]
        );
        assert_eq!(
            translator.translate(mouse(MouseEventKind::Up(MouseButton::Left), 48, 16), now),
            vec![ConsoleEvent::Input(InputEvent::JoystickRelease)]
        );
        assert!(translator
            .translate(mouse(MouseEventKind::Up(MouseButton::Left), 48, 16), now)
            .is_empty());
    }

    #[test]
    fn downscale_fits_terminal() {
        assert_eq!(downscale_factor(400, 400, 200, 100), 4);
        assert_eq!(downscale_factor(400, 400, 500, 900), 1);
        assert_eq!(downscale_factor(400, 400, 0, 0), 400);
    }

    #[test]
    fn status_mentions_state_and_frequency() {
        let status = StatusLine {
            state: ConnectionState::Connected,
            command: VelocityCommand::new(0.3, 0.0, -0.6),
            frequency: 1500,
            rejected_frames: 2,
        };
        let line = format_status(&status);
        assert!(line.starts_with("Connected | vx +0.30 vy +0.00 omega -0.60 | freq 1500 | rejected 2"));
    }
}
