use crate::{
    handoff, AcqState, Acquisition, AcquisitionMode, CaptureWriter, Counter, HandoffReceiver,
    HandoffSender, Instrument, LoopEvent, SampleBuffer,
};
use anyhow::Result;
use crossbeam_channel::{tick, Receiver};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use log::{error, info};
use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Layout, Rect},
    style::{Color, Style, Stylize},
    symbols::{self, border},
    text::{Line, Text},
    widgets::{Axis, Block, Chart, Dataset, GraphType, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::time::Duration;

const TICK: Duration = Duration::from_millis(50);
/// Points drawn per trace; longer captures are decimated.
const MAX_POINTS: usize = 2000;
const TRACE_COLORS: [Color; 2] = [Color::Yellow, Color::Cyan];

/// Terminal front end: owns the acquisition controller and renders the most
/// recent capture.
pub struct Scope<I: Instrument + Send + 'static> {
    acq: Acquisition<I>,
    sink: HandoffSender,
    captures: HandoffReceiver,
    events: Receiver<LoopEvent>,
    writer: CaptureWriter,
    device_name: String,
    pub counter: Counter,
    pub latest: Option<Vec<SampleBuffer>>,
    pub last_error: Option<String>,
    pub message: Option<String>,
    exit: bool,
}

impl<I: Instrument + Send + 'static> Scope<I> {
    pub fn new(acq: Acquisition<I>, writer: CaptureWriter) -> Self {
        let (sink, captures) = handoff(acq.settings().handoff_capacity);
        let events = acq.events();
        let device_name = acq
            .session()
            .and_then(|s| s.info())
            .map_or_else(|| "scope".to_string(), |i| format!("{} {}", i.name, i.serial));
        Self {
            acq,
            sink,
            captures,
            events,
            writer,
            device_name,
            counter: Counter::new(),
            latest: None,
            last_error: None,
            message: None,
            exit: false,
        }
    }

    pub fn run(&mut self, terminal: &mut DefaultTerminal) -> Result<()> {
        let ticker = tick(TICK);

        while !self.exit {
            let _ = ticker.recv();
            self.update();
            self.handle_events()?;
            terminal.draw(|f| self.draw(f))?;
        }

        self.acq.close()?;
        Ok(())
    }

    /// Drain loop events and pick up the newest capture.
    pub fn update(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                LoopEvent::Error(e) => self.last_error = Some(e.to_string()),
                LoopEvent::Reconfigured => self.message = Some("Configuration applied".into()),
                LoopEvent::Finished => self.message = Some("Acquisition stopped".into()),
                LoopEvent::Captured { samples, .. } => self.counter.increment(samples),
            }
        }
        if let Some(capture) = self.captures.latest() {
            self.latest = Some(capture);
        }
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            match event::read()? {
                Event::Key(key_event) if key_event.kind == KeyEventKind::Press => {
                    self.handle_key_event(key_event)
                }
                _ => {}
            };
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        match key_event.code {
            KeyCode::Char('r') => self.start(AcquisitionMode::Continuous),
            KeyCode::Char('o') => self.start(AcquisitionMode::Single),
            KeyCode::Char('s') => self.stop(),
            KeyCode::Char('+') => self.step_range(1),
            KeyCode::Char('-') => self.step_range(-1),
            KeyCode::Char('w') => self.write_latest(),
            KeyCode::Char('q') => self.exit = true,
            _ => {}
        }
    }

    fn start(&mut self, mode: AcquisitionMode) {
        self.last_error = None;
        if !self.acq.is_running() {
            self.counter.reset();
        }
        match self.acq.start(mode, self.sink.clone()) {
            Ok(()) => self.message = Some(format!("{mode:?} acquisition running")),
            Err(e) => self.last_error = Some(e.to_string()),
        }
    }

    fn stop(&mut self) {
        if let Err(e) = self.acq.stop() {
            self.last_error = Some(e.to_string());
        }
    }

    fn step_range(&mut self, steps: i32) {
        let mut channels = self.acq.channels().to_vec();
        let Some(ch1) = channels.iter_mut().find(|c| c.index == 0) else {
            return;
        };
        ch1.range_volts = ch1.step_range(steps);
        let range = ch1.range_volts;
        let acq = self.acq.acquisition_config().clone();
        match self.acq.reconfigure(channels, acq) {
            Ok(()) => {
                info!("Channel 1 range set to {} V", range);
                self.message = Some(format!("CH1 range {range} V"));
            }
            Err(e) => self.last_error = Some(e.to_string()),
        }
    }

    fn write_latest(&mut self) {
        let Some(capture) = self.latest.as_ref() else {
            self.message = Some("No capture to write".into());
            return;
        };
        match self.writer.write(capture) {
            Ok(path) => self.message = Some(format!("Wrote {}", path.display())),
            Err(e) => {
                error!("Writing capture failed: {:#}", e);
                self.last_error = Some(e.to_string());
            }
        }
    }

    fn status_text(&self) -> Text<'static> {
        let state = match self.acq.state() {
            AcqState::Idle if self.acq.is_running() => "Idle (between captures)",
            AcqState::Idle => "Idle",
            AcqState::Arming => "Arming",
            AcqState::Waiting => "Waiting",
            AcqState::Reading => "Reading",
        };
        let acq = self.acq.acquisition_config();
        let mut lines = vec![
            Line::from(vec![
                "State: ".into(),
                state.to_string().yellow(),
                " Captures: ".into(),
                self.counter.n_captures.to_string().yellow(),
                " Rate: ".into(),
                format!("{:.1}", self.counter.rate()).yellow(),
                " /s".into(),
                " Dropped: ".into(),
                self.captures.dropped().to_string().yellow(),
            ]),
            Line::from(vec![
                "Sample rate: ".into(),
                crate::si(acq.sample_rate_hz, "Hz").yellow(),
                " Buffer: ".into(),
                acq.buffer_size.to_string().yellow(),
                " Trigger: ".into(),
                format!("{:?}", acq.trigger_source).yellow(),
            ]),
        ];
        if let Some(err) = &self.last_error {
            lines.push(Line::from(vec!["Error: ".into(), err.clone().red()]));
        } else if let Some(msg) = &self.message {
            lines.push(Line::from(msg.clone().green()));
        }
        Text::from(lines)
    }
}

/// Time/voltage pairs for one trace, at most `MAX_POINTS` long.
fn trace_points(buffer: &SampleBuffer) -> Vec<(f64, f64)> {
    let stride = buffer.len().div_ceil(MAX_POINTS).max(1);
    buffer
        .samples
        .iter()
        .enumerate()
        .step_by(stride)
        .map(|(i, &v)| (buffer.time_of(i), v))
        .collect()
}

impl<I: Instrument + Send + 'static> Widget for &Scope<I> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let [status_area, chart_area] =
            Layout::vertical([Constraint::Length(5), Constraint::Min(0)]).areas(area);

        let title = Line::from(format!(" {} ", self.device_name).bold());
        let instructions = Line::from(vec![
            " Run ".into(),
            "<R>".blue().bold(),
            " Single ".into(),
            "<O>".blue().bold(),
            " Stop ".into(),
            "<S>".blue().bold(),
            " CH1 range ".into(),
            "<+/->".blue().bold(),
            " Save ".into(),
            "<W>".blue().bold(),
            " Quit ".into(),
            "<Q> ".blue().bold(),
        ]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);
        Paragraph::new(self.status_text())
            .centered()
            .block(block)
            .render(status_area, buf);

        let channels = self.acq.channels();
        let traces: Vec<(String, Color, Vec<(f64, f64)>)> = self
            .latest
            .iter()
            .flatten()
            .map(|b| {
                (
                    format!("CH{}", b.channel_index + 1),
                    TRACE_COLORS[b.channel_index % TRACE_COLORS.len()],
                    trace_points(b),
                )
            })
            .collect();
        let datasets = traces
            .iter()
            .map(|(name, color, points)| {
                Dataset::default()
                    .name(name.clone())
                    .marker(symbols::Marker::Braille)
                    .graph_type(GraphType::Line)
                    .style(Style::default().fg(*color))
                    .data(points)
            })
            .collect();

        let t_max = self
            .latest
            .as_ref()
            .and_then(|c| c.first())
            .map_or(1e-3, |b| b.duration_secs().max(1e-9));
        let v_max = channels
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.span().1.abs().max(c.span().0.abs()))
            .fold(0.0f64, f64::max)
            .max(0.1);

        Chart::new(datasets)
            .block(Block::bordered().title(" Analog In "))
            .x_axis(
                Axis::default()
                    .title("Time")
                    .bounds([0.0, t_max])
                    .labels([
                        crate::si(0.0, "s"),
                        crate::si(t_max / 2.0, "s"),
                        crate::si(t_max, "s"),
                    ]),
            )
            .y_axis(
                Axis::default()
                    .title("Volts")
                    .bounds([-v_max, v_max])
                    .labels([
                        format!("{:.2}", -v_max),
                        "0".to_string(),
                        format!("{v_max:.2}"),
                    ]),
            )
            .render(chart_area, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AcquisitionConfig, ChannelConfig, DeviceSession, LoopSettings, SimSettings,
        SimulatedInstrument,
    };
    use crossterm::event::KeyModifiers;
    use std::time::Instant;

    fn scope(dir: &std::path::Path) -> Scope<SimulatedInstrument> {
        let session = DeviceSession::open(SimulatedInstrument::new(SimSettings::default())).unwrap();
        let acq = Acquisition::new(
            session,
            vec![ChannelConfig::new(0, 5.0), ChannelConfig::new(1, 5.0)],
            AcquisitionConfig {
                buffer_size: 1024,
                ..Default::default()
            },
            LoopSettings {
                frame_interval: Duration::ZERO,
                ..Default::default()
            },
        )
        .unwrap();
        Scope::new(acq, CaptureWriter::new(dir).unwrap())
    }

    fn press(scope: &mut Scope<SimulatedInstrument>, c: char) {
        scope.handle_key_event(KeyEvent::new(KeyCode::Char(c), KeyModifiers::NONE));
    }

    fn wait_for_capture(scope: &mut Scope<SimulatedInstrument>) {
        let until = Instant::now() + Duration::from_secs(5);
        while scope.latest.is_none() || scope.counter.n_captures == 0 {
            assert!(Instant::now() < until, "no capture delivered");
            std::thread::sleep(Duration::from_millis(1));
            scope.update();
        }
    }

    #[test]
    fn single_shot_renders_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let mut scope = scope(dir.path());
        press(&mut scope, 'o');
        wait_for_capture(&mut scope);
        assert_eq!(scope.latest.as_ref().unwrap().len(), 2);
        assert_eq!(scope.counter.n_captures, 1);

        let mut buf = Buffer::empty(Rect::new(0, 0, 100, 30));
        (&scope).render(buf.area, &mut buf);

        press(&mut scope, 'w');
        assert!(dir.path().join("capture0.csv").exists());
        press(&mut scope, 'q');
        assert!(scope.exit);
    }

    #[test]
    fn counter_includes_captures_the_display_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut scope = scope(dir.path());
        press(&mut scope, 'r');
        std::thread::sleep(Duration::from_millis(30));
        press(&mut scope, 's');
        scope.update();

        assert!(scope.counter.n_captures >= 2);
        assert_eq!(
            scope.counter.n_captures as u64,
            scope.captures.dropped() + 1
        );
    }

    #[test]
    fn range_keys_step_through_menu() {
        let dir = tempfile::tempdir().unwrap();
        let mut scope = scope(dir.path());
        press(&mut scope, '+');
        assert_eq!(scope.acq.channels()[0].range_volts, 10.0);
        press(&mut scope, '-');
        press(&mut scope, '-');
        assert_eq!(scope.acq.channels()[0].range_volts, 2.0);
    }

    #[test]
    fn write_without_capture_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut scope = scope(dir.path());
        press(&mut scope, 'w');
        assert_eq!(scope.message.as_deref(), Some("No capture to write"));
    }

    #[test]
    fn trace_is_decimated() {
        let buffer = SampleBuffer {
            channel_index: 0,
            samples: vec![0.0; 16384],
            timestamp_base: 0.0,
            sequence: 0,
            sample_rate_hz: 1e6,
        };
        assert!(trace_points(&buffer).len() <= MAX_POINTS);
    }
}
