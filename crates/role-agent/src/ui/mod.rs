use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Stdout};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::{Arc, mpsc};
use std::time::Duration;

use crossterm::cursor::{Hide, Show};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::buffer::Buffer;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{
    Block, BorderType, Borders, Clear, List, ListItem, ListState, Paragraph, Tabs, Widget, Wrap,
};

use crate::app::{AppState, Unavailable, bootstrap};
use crate::batch::{BatchSession, TaskId, TaskStatus, read_csv_file, submit_with_notice};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::{ChannelSink, RunEvent, RunSink, SingleRun};
use crate::form::InputForm;
use crate::log_sanitize::{sanitize_log_line, sanitize_text};
use crate::notify::{ChannelNotify, Toast, ToastKind};
use crate::prompt::VarType;
use crate::results::{BatchSummary, FeedbackState, export_to_file};
use crate::service::{CompletionRequest, CompletionService, PlatformClient, Rating};
use crate::welcome::{
    PromptBridge, PromptInbox, QUICK_PROMPTS, WELCOME_BODY, WELCOME_NOTE, WELCOME_TITLE,
    prompt_bridge,
};

const MAX_ACTIVITY_LINES: usize = 200;
const DEFAULT_EXPORT_PATH: &str = "role-agent-results.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Screen {
    Welcome,
    Create,
    Batch,
    Results,
    Unavailable,
}

impl Screen {
    const TABS: [Screen; 4] = [
        Screen::Welcome,
        Screen::Create,
        Screen::Batch,
        Screen::Results,
    ];

    fn label(&self) -> &'static str {
        match self {
            Screen::Welcome => "Welcome",
            Screen::Create => "Run Once",
            Screen::Batch => "Run Batch",
            Screen::Results => "AI Completion",
            Screen::Unavailable => "Unavailable",
        }
    }
}

#[derive(Debug, Clone)]
enum InputMode {
    Normal,
    EditVar {
        idx: usize,
        buffer: String,
        error: Option<String>,
    },
    AddImage {
        buffer: String,
        error: Option<String>,
    },
    BatchPath {
        buffer: String,
    },
    ExportPath {
        buffer: String,
    },
}

struct App {
    cfg: Config,
    state: Option<AppState>,
    unavailable: Option<Unavailable>,
    service: Arc<dyn CompletionService>,

    screen: Screen,
    input: InputMode,

    welcome_list: ListState,
    var_list: ListState,
    task_list: ListState,

    form: InputForm,
    bridge: PromptBridge,
    inbox: PromptInbox,

    run_tx: mpsc::Sender<RunEvent>,
    run_rx: mpsc::Receiver<RunEvent>,
    session: BatchSession,
    // Mirrors the result panel's mode: batch tasks or the last single run.
    is_batch: bool,
    batch_path: Option<PathBuf>,
    task_text: BTreeMap<TaskId, String>,

    single: Option<SingleRun>,
    single_text: String,
    single_error: Option<String>,
    responding: bool,
    feedback: FeedbackState,
    result_scroll: u16,

    notify: ChannelNotify,
    toast_rx: mpsc::Receiver<Toast>,
    last_toast: Option<Toast>,
    activity: VecDeque<String>,
}

impl App {
    fn new(cfg: Config) -> Result<Self> {
        let client = PlatformClient::new(&cfg)?;
        let boot = bootstrap(&cfg, &client);
        Ok(Self::from_parts(cfg, boot, Arc::new(client)))
    }

    fn from_parts(
        cfg: Config,
        boot: std::result::Result<AppState, Unavailable>,
        service: Arc<dyn CompletionService>,
    ) -> Self {
        let (state, unavailable) = match boot {
            Ok(s) => (Some(s), None),
            Err(e) => (None, Some(e)),
        };
        let form = match state.as_ref() {
            Some(s) => InputForm::new(s.prompt_config.prompt_variables.clone(), s.vision.clone()),
            None => InputForm::new(Vec::new(), Default::default()),
        };
        let (bridge, inbox) = prompt_bridge();
        let (run_tx, run_rx) = mpsc::channel();
        let (toast_tx, toast_rx) = mpsc::channel();
        let sink: Arc<dyn RunSink> = Arc::new(ChannelSink::new(run_tx.clone()));
        let session = BatchSession::new(Arc::clone(&service), sink, cfg.group_size());

        let mut welcome_list = ListState::default();
        welcome_list.select(Some(0));
        let mut var_list = ListState::default();
        var_list.select(Some(0));

        Self {
            screen: if unavailable.is_some() {
                Screen::Unavailable
            } else {
                Screen::Welcome
            },
            cfg,
            state,
            unavailable,
            service,
            input: InputMode::Normal,
            welcome_list,
            var_list,
            task_list: ListState::default(),
            form,
            bridge,
            inbox,
            run_tx,
            run_rx,
            session,
            is_batch: false,
            batch_path: None,
            task_text: BTreeMap::new(),
            single: None,
            single_text: String::new(),
            single_error: None,
            responding: false,
            feedback: FeedbackState::default(),
            result_scroll: 0,
            notify: ChannelNotify::new(toast_tx),
            toast_rx,
            last_toast: None,
            activity: VecDeque::new(),
        }
    }

    fn toast(&mut self, t: Toast) {
        self.push_activity(&t.message);
        self.last_toast = Some(t);
    }

    fn push_activity(&mut self, line: &str) {
        let now = chrono::Local::now().format("%H:%M:%S").to_string();
        push_bounded(
            &mut self.activity,
            format!("{now} {}", sanitize_log_line(line)),
            MAX_ACTIVITY_LINES,
        );
    }

    fn start_single(&mut self, req: CompletionRequest) {
        if let Some(prev) = self.single.take() {
            prev.stop();
        }
        // A single run replaces whatever batch was shown.
        self.session.clear();
        self.task_text.clear();
        self.is_batch = false;
        self.single_text.clear();
        self.single_error = None;
        self.feedback = FeedbackState::default();
        self.result_scroll = 0;
        self.responding = true;
        let sink: Arc<dyn RunSink> = Arc::new(ChannelSink::new(self.run_tx.clone()));
        self.single = Some(SingleRun::start(Arc::clone(&self.service), sink, req));
        self.screen = Screen::Results;
        tracing::info!("single run started");
    }

    fn send_form(&mut self) {
        match self.form.submit() {
            Ok(req) => self.start_single(req),
            Err(e) => self.toast(Toast::error(e.to_string())),
        }
    }

    fn stop_single(&mut self) {
        if let Some(run) = self.single.as_ref() {
            if self.responding {
                run.stop();
                self.push_activity("stop requested");
            }
        }
    }

    fn submit_batch(&mut self, path: PathBuf) {
        let Some(vars) = self
            .state
            .as_ref()
            .map(|s| s.prompt_config.prompt_variables.clone())
        else {
            return;
        };
        let data = match read_csv_file(&path) {
            Ok(d) => d,
            Err(e) => {
                self.toast(Toast::error(e.to_string()));
                return;
            }
        };
        let max_len = self.cfg.default_value_max_len();
        let notify = self.notify.clone();
        if let Some(n) = submit_with_notice(&mut self.session, &data, &vars, max_len, &notify) {
            if let Some(prev) = self.single.take() {
                prev.stop();
            }
            self.responding = false;
            self.is_batch = true;
            self.batch_path = Some(path.clone());
            self.task_text.clear();
            self.task_list.select(Some(0));
            self.result_scroll = 0;
            self.screen = Screen::Results;
            self.push_activity(&format!("batch of {n} tasks from {}", path.display()));
        }
    }

    fn retry_failed(&mut self) {
        if !self.is_batch {
            return;
        }
        let ids = self.session.retry_failed();
        for id in &ids {
            self.task_text.remove(id);
        }
        if !ids.is_empty() {
            self.push_activity(&format!("retrying {} failed tasks", ids.len()));
        }
    }

    fn export(&mut self, path: PathBuf) {
        let Some(vars) = self
            .state
            .as_ref()
            .map(|s| s.prompt_config.prompt_variables.clone())
        else {
            return;
        };
        if !BatchSummary::of(self.session.scheduler()).can_export() {
            self.toast(Toast::info("Nothing to export yet"));
            return;
        }
        let res = export_to_file(&path, self.session.scheduler(), &vars);
        match res {
            Ok(()) => self.toast(Toast::success(format!("Exported to {}", path.display()))),
            Err(e) => self.toast(Toast::error(e.to_string())),
        }
    }

    fn rate(&mut self, rating: Option<Rating>) {
        if self.is_batch {
            return;
        }
        match self.feedback.submit(&*self.service, rating) {
            Ok(true) => {
                let label = rating.map(|r| r.as_str()).unwrap_or("cleared");
                self.toast(Toast::success(format!("Feedback: {label}")));
            }
            Ok(false) => {}
            Err(e) => self.toast(Toast::error(e.to_string())),
        }
    }

    fn tick(&mut self) {
        let mut events = Vec::new();
        while let Ok(ev) = self.run_rx.try_recv() {
            events.push(ev);
        }
        for ev in events {
            self.apply_run_event(ev);
        }

        self.session.drain();

        while let Ok(t) = self.toast_rx.try_recv() {
            self.toast(t);
        }

        for res in self.inbox.deliver(&mut self.form) {
            match res {
                Ok(req) => self.start_single(req),
                Err(e) => self.toast(Toast::error(e.to_string())),
            }
        }

        if self.single.as_ref().is_some_and(|s| s.is_finished()) {
            if let Some(run) = self.single.take() {
                let _ = run.join();
            }
        }
    }

    fn apply_run_event(&mut self, ev: RunEvent) {
        match ev {
            RunEvent::TaskStarted { id } => {
                if self.is_batch {
                    self.task_text.remove(&id);
                    self.push_activity(&format!("run task {id}"));
                }
            }
            RunEvent::TaskChunk { id, text } => {
                if self.is_batch {
                    self.task_text.entry(id).or_default().push_str(&text);
                }
            }
            RunEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if !self.is_batch {
                    return;
                }
                if ok {
                    self.push_activity(&format!("done task {id} ({elapsed_ms}ms)"));
                } else {
                    self.push_activity(&format!(
                        "fail task {id} ({elapsed_ms}ms) {}",
                        error.unwrap_or_default()
                    ));
                }
            }
            RunEvent::BatchDone { completed, failed } => {
                if self.is_batch {
                    let msg = format!("Batch finished: {completed} succeeded, {failed} failed");
                    if failed == 0 {
                        self.toast(Toast::success(msg));
                    } else {
                        self.toast(Toast::info(msg));
                    }
                }
            }
            RunEvent::SingleStarted => {}
            RunEvent::SingleChunk { text } => {
                if !self.is_batch {
                    self.single_text.push_str(&text);
                }
            }
            RunEvent::SingleFinished {
                ok,
                message_id,
                error,
                elapsed_ms,
            } => {
                if self.is_batch {
                    return;
                }
                self.responding = false;
                self.feedback = FeedbackState::for_message(message_id);
                if ok {
                    self.push_activity(&format!("completion done ({elapsed_ms}ms)"));
                } else {
                    let e = error.unwrap_or_default();
                    self.single_error = Some(e.clone());
                    self.push_activity(&format!("completion failed: {e}"));
                }
            }
        }
    }

    fn handle_key(&mut self, code: KeyCode, mods: KeyModifiers) -> Result<bool> {
        if mods.contains(KeyModifiers::CONTROL) && matches!(code, KeyCode::Char('c')) {
            self.stop_single();
            return Ok(true);
        }

        if !matches!(self.input, InputMode::Normal) {
            self.handle_modal_key(code);
            return Ok(false);
        }

        match code {
            KeyCode::Char('q') => {
                self.stop_single();
                return Ok(true);
            }
            KeyCode::Tab if self.screen != Screen::Unavailable => {
                self.screen = next_tab(self.screen, 1);
                return Ok(false);
            }
            KeyCode::BackTab if self.screen != Screen::Unavailable => {
                self.screen = next_tab(self.screen, -1);
                return Ok(false);
            }
            _ => {}
        }

        match self.screen {
            Screen::Welcome => match code {
                KeyCode::Down | KeyCode::Char('j') => {
                    select_step(&mut self.welcome_list, QUICK_PROMPTS.len(), 1)
                }
                KeyCode::Up | KeyCode::Char('k') => {
                    select_step(&mut self.welcome_list, QUICK_PROMPTS.len(), -1)
                }
                KeyCode::Enter => {
                    let idx = self.welcome_list.selected().unwrap_or(0);
                    self.bridge.send_quick(idx);
                }
                KeyCode::Char(c @ '1'..='6') => {
                    let idx = (c as usize) - ('1' as usize);
                    self.welcome_list.select(Some(idx));
                    self.bridge.send_quick(idx);
                }
                _ => {}
            },
            Screen::Create => {
                let n = self.form.vars().len();
                match code {
                    KeyCode::Down | KeyCode::Char('j') => select_step(&mut self.var_list, n, 1),
                    KeyCode::Up | KeyCode::Char('k') => select_step(&mut self.var_list, n, -1),
                    KeyCode::Enter | KeyCode::Char('e') => self.begin_edit_var(),
                    KeyCode::Char(' ') => self.cycle_select_var(),
                    KeyCode::Char('i') => {
                        if self.form.vision().enabled {
                            self.input = InputMode::AddImage {
                                buffer: String::new(),
                                error: None,
                            };
                        } else {
                            self.toast(Toast::info("Image input is not enabled for this app"));
                        }
                    }
                    KeyCode::Char('x') => {
                        let last = self.form.files().len().checked_sub(1);
                        if let Some(i) = last {
                            self.form.remove_image(i);
                        }
                    }
                    KeyCode::Char('c') => self.form.clear(),
                    KeyCode::Char('s') | KeyCode::Char('r') => self.send_form(),
                    _ => {}
                }
            }
            Screen::Batch => match code {
                KeyCode::Enter | KeyCode::Char('o') => {
                    let buffer = self
                        .batch_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    self.input = InputMode::BatchPath { buffer };
                }
                KeyCode::Char('r') => {
                    if let Some(p) = self.batch_path.clone() {
                        self.submit_batch(p);
                    }
                }
                _ => {}
            },
            Screen::Results => match code {
                KeyCode::Down | KeyCode::Char('j') => {
                    let n = self.session.scheduler().shown().len();
                    select_step(&mut self.task_list, n, 1);
                    self.result_scroll = 0;
                }
                KeyCode::Up | KeyCode::Char('k') => {
                    let n = self.session.scheduler().shown().len();
                    select_step(&mut self.task_list, n, -1);
                    self.result_scroll = 0;
                }
                KeyCode::PageDown => self.result_scroll = self.result_scroll.saturating_add(10),
                KeyCode::PageUp => self.result_scroll = self.result_scroll.saturating_sub(10),
                KeyCode::Char('R') => self.retry_failed(),
                KeyCode::Char('x') => {
                    if self.is_batch {
                        self.input = InputMode::ExportPath {
                            buffer: DEFAULT_EXPORT_PATH.to_string(),
                        };
                    }
                }
                KeyCode::Char('s') => self.stop_single(),
                KeyCode::Char('+') => self.rate(Some(Rating::Like)),
                KeyCode::Char('-') => self.rate(Some(Rating::Dislike)),
                KeyCode::Char('0') => self.rate(None),
                _ => {}
            },
            Screen::Unavailable => {}
        }
        Ok(false)
    }

    fn begin_edit_var(&mut self) {
        let Some(idx) = self.var_list.selected() else {
            return;
        };
        let Some(var) = self.form.vars().get(idx) else {
            return;
        };
        if var.var_type == VarType::Select {
            self.cycle_select_var();
            return;
        }
        let buffer = self.form.value(&var.key).to_string();
        self.input = InputMode::EditVar {
            idx,
            buffer,
            error: None,
        };
    }

    fn cycle_select_var(&mut self) {
        let Some(idx) = self.var_list.selected() else {
            return;
        };
        let Some(var) = self.form.vars().get(idx).cloned() else {
            return;
        };
        if var.var_type != VarType::Select || var.options.is_empty() {
            return;
        }
        let current = self.form.value(&var.key);
        let next = match var.options.iter().position(|o| o == current) {
            Some(i) => &var.options[(i + 1) % var.options.len()],
            None => &var.options[0],
        };
        self.form.set(&var.key, next.clone());
    }

    fn handle_modal_key(&mut self, code: KeyCode) {
        let input = std::mem::replace(&mut self.input, InputMode::Normal);
        self.input = match input {
            InputMode::Normal => InputMode::Normal,
            InputMode::EditVar {
                idx,
                mut buffer,
                error,
            } => match code {
                KeyCode::Esc => InputMode::Normal,
                KeyCode::Enter => match self.apply_edit_var(idx, &buffer) {
                    Ok(()) => InputMode::Normal,
                    Err(e) => InputMode::EditVar {
                        idx,
                        buffer,
                        error: Some(e),
                    },
                },
                KeyCode::Backspace => {
                    buffer.pop();
                    InputMode::EditVar { idx, buffer, error }
                }
                KeyCode::Char(c) => {
                    buffer.push(c);
                    InputMode::EditVar { idx, buffer, error }
                }
                _ => InputMode::EditVar { idx, buffer, error },
            },
            InputMode::AddImage { mut buffer, error } => match code {
                KeyCode::Esc => InputMode::Normal,
                KeyCode::Enter => match self.form.add_image_url(&buffer) {
                    Ok(()) => InputMode::Normal,
                    Err(e) => InputMode::AddImage {
                        buffer,
                        error: Some(e.to_string()),
                    },
                },
                KeyCode::Backspace => {
                    buffer.pop();
                    InputMode::AddImage { buffer, error }
                }
                KeyCode::Char(c) => {
                    buffer.push(c);
                    InputMode::AddImage { buffer, error }
                }
                _ => InputMode::AddImage { buffer, error },
            },
            InputMode::BatchPath { mut buffer } => match code {
                KeyCode::Esc => InputMode::Normal,
                KeyCode::Enter => {
                    let path = buffer.trim();
                    if !path.is_empty() {
                        self.submit_batch(PathBuf::from(path));
                    }
                    InputMode::Normal
                }
                KeyCode::Backspace => {
                    buffer.pop();
                    InputMode::BatchPath { buffer }
                }
                KeyCode::Char(c) => {
                    buffer.push(c);
                    InputMode::BatchPath { buffer }
                }
                _ => InputMode::BatchPath { buffer },
            },
            InputMode::ExportPath { mut buffer } => match code {
                KeyCode::Esc => InputMode::Normal,
                KeyCode::Enter => {
                    let path = buffer.trim();
                    if !path.is_empty() {
                        self.export(PathBuf::from(path));
                    }
                    InputMode::Normal
                }
                KeyCode::Backspace => {
                    buffer.pop();
                    InputMode::ExportPath { buffer }
                }
                KeyCode::Char(c) => {
                    buffer.push(c);
                    InputMode::ExportPath { buffer }
                }
                _ => InputMode::ExportPath { buffer },
            },
        };
    }

    fn apply_edit_var(&mut self, idx: usize, buffer: &str) -> std::result::Result<(), String> {
        let Some(var) = self.form.vars().get(idx).cloned() else {
            return Ok(());
        };
        if var.var_type == VarType::Number
            && !buffer.trim().is_empty()
            && buffer.trim().parse::<f64>().is_err()
        {
            return Err(format!("{} must be a number", var.name));
        }
        if var.is_string() {
            let max = var.max_len(self.cfg.default_value_max_len());
            if buffer.chars().count() > max {
                return Err(format!("{} can not be more than {max} characters", var.name));
            }
        }
        self.form.set(&var.key, buffer);
        Ok(())
    }

    fn draw(&mut self, f: &mut ratatui::Frame) {
        let size = f.area();
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(2),
                Constraint::Min(0),
                Constraint::Length(2),
            ])
            .split(size);

        self.draw_header(f, chunks[0]);
        self.draw_main(f, chunks[1]);
        self.draw_footer(f, chunks[2]);

        self.draw_modal(f);
    }

    fn draw_header(&self, f: &mut ratatui::Frame, area: ratatui::layout::Rect) {
        let cols = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Min(20), Constraint::Length(46)])
            .split(area);

        if self.screen == Screen::Unavailable {
            let p = Paragraph::new(Line::from(Span::styled(
                self.cfg.app.title.clone(),
                Style::default().fg(Color::Cyan),
            )))
            .block(Block::default().borders(Borders::BOTTOM));
            f.render_widget(p, cols[0]);
        } else {
            let titles: Vec<Line> = Screen::TABS.iter().map(|s| Line::from(s.label())).collect();
            let selected = Screen::TABS.iter().position(|s| *s == self.screen);
            let tabs = Tabs::new(titles)
                .select(selected)
                .highlight_style(Style::default().fg(Color::Black).bg(Color::LightYellow))
                .block(Block::default().borders(Borders::BOTTOM));
            f.render_widget(tabs, cols[0]);
        }

        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let status = if self.responding {
            Span::styled("responding", Style::default().fg(Color::LightGreen))
        } else if !self.session.is_finished() {
            Span::styled("batch running", Style::default().fg(Color::LightGreen))
        } else {
            Span::styled("idle", Style::default().fg(Color::Gray))
        };
        let p = Paragraph::new(Line::from(vec![
            status,
            Span::raw("  "),
            Span::styled(now, Style::default().fg(Color::Yellow)),
        ]))
        .block(Block::default().borders(Borders::BOTTOM));
        f.render_widget(p, cols[1]);
    }

    fn draw_footer(&self, f: &mut ratatui::Frame, area: ratatui::layout::Rect) {
        let hint = match self.input {
            InputMode::Normal => match self.screen {
                Screen::Welcome => "[j/k] Move  [Enter/1-6] Ask  [Tab] Next  [q] Quit",
                Screen::Create => {
                    "[j/k] Move  [Enter/e] Edit  [Space] Cycle option  [i] Add image  [x] Drop image  [c] Clear  [s] Send  [Tab] Next  [q] Quit"
                }
                Screen::Batch => "[Enter/o] Open CSV  [r] Rerun file  [Tab] Next  [q] Quit",
                Screen::Results => {
                    "[j/k] Task  [PgUp/PgDn] Scroll  [R] Retry failed  [x] Export  [s] Stop  [+/-/0] Feedback  [Tab] Next  [q] Quit"
                }
                Screen::Unavailable => "[q] Quit",
            },
            _ => "[Enter] Apply  [Esc] Cancel",
        };
        let toast = match self.last_toast.as_ref() {
            Some(t) => {
                let color = match t.kind {
                    ToastKind::Error => Color::Red,
                    ToastKind::Info => Color::LightBlue,
                    ToastKind::Success => Color::LightGreen,
                };
                Line::from(Span::styled(
                    sanitize_log_line(&t.message),
                    Style::default().fg(color),
                ))
            }
            None => Line::from(""),
        };
        let p = Paragraph::new(Text::from(vec![
            toast,
            Line::from(Span::styled(hint, Style::default().fg(Color::Gray))),
        ]));
        f.render_widget(p, area);
    }

    fn draw_main(&mut self, f: &mut ratatui::Frame, area: ratatui::layout::Rect) {
        match self.screen {
            Screen::Welcome => self.draw_welcome(f, area),
            Screen::Create => self.draw_create(f, area),
            Screen::Batch => self.draw_batch(f, area),
            Screen::Results => self.draw_results(f, area),
            Screen::Unavailable => self.draw_unavailable(f, area),
        }
    }

    fn draw_welcome(&self, f: &mut ratatui::Frame, area: ratatui::layout::Rect) {
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(10), Constraint::Min(8)])
            .split(area);

        let mut lines = vec![
            Line::from(Span::styled(
                WELCOME_TITLE,
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD),
            )),
            Line::from(""),
        ];
        for p in WELCOME_BODY {
            lines.push(Line::from(*p));
        }
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            WELCOME_NOTE,
            Style::default().fg(Color::Gray),
        )));
        let title = if self.cfg.app.title.is_empty() {
            "Welcome".to_string()
        } else {
            self.cfg.app.title.clone()
        };
        let p = Paragraph::new(Text::from(lines))
            .wrap(Wrap { trim: false })
            .block(
                Block::default()
                    .title(title)
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            );
        f.render_widget(p, rows[0]);

        let items: Vec<ListItem> = QUICK_PROMPTS
            .iter()
            .enumerate()
            .map(|(i, q)| {
                ListItem::new(Line::from(vec![
                    Span::styled(format!("{}. ", i + 1), Style::default().fg(Color::Gray)),
                    Span::raw(q.label),
                ]))
            })
            .collect();
        let list = List::new(items)
            .block(
                Block::default()
                    .title("Quick prompts")
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            )
            .highlight_style(Style::default().fg(Color::Black).bg(Color::LightYellow))
            .highlight_symbol("> ");
        let mut state = self.welcome_list.clone();
        f.render_stateful_widget(list, rows[1], &mut state);
    }

    fn draw_create(&self, f: &mut ratatui::Frame, area: ratatui::layout::Rect) {
        let cols = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
            .split(area);

        let max_len = self.cfg.default_value_max_len();
        let items: Vec<ListItem> = self
            .form
            .vars()
            .iter()
            .map(|v| {
                let mut spans = vec![Span::styled(
                    format!("{} ", v.name),
                    Style::default().fg(Color::Yellow),
                )];
                spans.push(Span::styled(
                    format!("[{}]", v.var_type.as_str()),
                    Style::default().fg(Color::Gray),
                ));
                if !v.is_required() {
                    spans.push(Span::styled(" (optional)", Style::default().fg(Color::Gray)));
                }
                if v.is_string() {
                    spans.push(Span::styled(
                        format!(" {}/{}", self.form.value(&v.key).chars().count(), v.max_len(max_len)),
                        Style::default().fg(Color::DarkGray),
                    ));
                }
                spans.push(Span::raw(": "));
                spans.push(Span::raw(sanitize_log_line(self.form.value(&v.key))));
                ListItem::new(Line::from(spans))
            })
            .collect();
        let list = List::new(items)
            .block(
                Block::default()
                    .title("Inputs")
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            )
            .highlight_style(Style::default().fg(Color::Black).bg(Color::LightYellow))
            .highlight_symbol("> ");
        let mut state = self.var_list.clone();
        f.render_stateful_widget(list, cols[0], &mut state);

        let mut lines = Vec::new();
        if !self.cfg.app.description.is_empty() {
            lines.push(Line::from(self.cfg.app.description.clone()));
            lines.push(Line::from(""));
        }
        let vision = self.form.vision();
        if vision.enabled {
            lines.push(Line::from(format!(
                "Images: {}/{} (detail: {:?})",
                self.form.files().len(),
                vision.number_limits,
                vision.detail
            )));
            for file in self.form.files() {
                lines.push(Line::from(format!("  {}", sanitize_log_line(&file.url))));
            }
        } else {
            lines.push(Line::from(Span::styled(
                "Image input disabled",
                Style::default().fg(Color::Gray),
            )));
        }
        if let Some(state) = self.state.as_ref() {
            if state.is_workflow {
                lines.push(Line::from(""));
                lines.push(Line::from("Mode: workflow"));
            }
        }
        if !self.cfg.app.copyright.is_empty() {
            lines.push(Line::from(""));
            lines.push(Line::from(Span::styled(
                format!("© {}", self.cfg.app.copyright),
                Style::default().fg(Color::DarkGray),
            )));
        }
        if !self.cfg.app.privacy_policy.is_empty() {
            lines.push(Line::from(Span::styled(
                format!("Privacy policy: {}", self.cfg.app.privacy_policy),
                Style::default().fg(Color::DarkGray),
            )));
        }
        let p = Paragraph::new(Text::from(lines))
            .wrap(Wrap { trim: false })
            .block(
                Block::default()
                    .title("Details")
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            );
        f.render_widget(p, cols[1]);
    }

    fn draw_batch(&self, f: &mut ratatui::Frame, area: ratatui::layout::Rect) {
        let header = self
            .form
            .vars()
            .iter()
            .map(|v| v.name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let mut lines = vec![
            Line::from("Upload a CSV file whose first row names the inputs in this order:"),
            Line::from(Span::styled(header, Style::default().fg(Color::Yellow))),
            Line::from(""),
            Line::from(format!(
                "Each following row becomes one task. At most {} tasks run at a time.",
                self.session.scheduler().group_size()
            )),
            Line::from(""),
        ];
        match self.batch_path.as_ref() {
            Some(p) => lines.push(Line::from(format!("Last file: {}", p.display()))),
            None => lines.push(Line::from(Span::styled(
                "No file selected",
                Style::default().fg(Color::Gray),
            ))),
        }
        if self.is_batch {
            let sum = BatchSummary::of(self.session.scheduler());
            lines.push(Line::from(format!(
                "tasks: {}  pending: {}  running: {}  completed: {}  failed: {}",
                sum.total, sum.pending, sum.running, sum.completed, sum.failed
            )));
        }
        let p = Paragraph::new(Text::from(lines))
            .wrap(Wrap { trim: false })
            .block(
                Block::default()
                    .title("Run Batch")
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            );
        f.render_widget(p, area);
    }

    fn draw_results(&self, f: &mut ratatui::Frame, area: ratatui::layout::Rect) {
        if self.is_batch {
            self.draw_batch_results(f, area);
        } else {
            self.draw_single_result(f, area);
        }
    }

    fn draw_single_result(&self, f: &mut ratatui::Frame, area: ratatui::layout::Rect) {
        let mut lines: Vec<Line> = Vec::new();
        if let Some(e) = self.single_error.as_ref() {
            lines.push(Line::from(Span::styled(
                sanitize_log_line(e),
                Style::default().fg(Color::Red),
            )));
            lines.push(Line::from(""));
        }
        if self.single_text.is_empty() && self.responding {
            lines.push(Line::from(Span::styled(
                "Waiting for response...",
                Style::default().fg(Color::Gray),
            )));
        }
        for l in sanitize_text(&self.single_text).lines() {
            lines.push(Line::from(l.to_string()));
        }

        let mut title = "AI Completion".to_string();
        if self.responding {
            title.push_str(" (s: stop responding)");
        } else if self.feedback.message_id.is_some() {
            let r = match self.feedback.rating {
                Some(Rating::Like) => "liked",
                Some(Rating::Dislike) => "disliked",
                None => "not rated",
            };
            title.push_str(&format!(" [{r}]"));
        }
        let p = Paragraph::new(Text::from(lines))
            .wrap(Wrap { trim: false })
            .scroll((self.result_scroll, 0))
            .block(
                Block::default()
                    .title(title)
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            );
        f.render_widget(p, area);
    }

    fn draw_batch_results(&self, f: &mut ratatui::Frame, area: ratatui::layout::Rect) {
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Min(6),
                Constraint::Length(7),
            ])
            .split(area);

        let sched = self.session.scheduler();
        let sum = BatchSummary::of(sched);
        let mut spans = vec![Span::raw(format!(
            "completed {}  failed {}  running {}  pending {}",
            sum.completed, sum.failed, sum.running, sum.pending
        ))];
        if let Some(label) = sum.failed_label() {
            spans.push(Span::raw("  "));
            spans.push(Span::styled(
                format!("{label} (R: retry)"),
                Style::default().fg(Color::Red),
            ));
        }
        if sum.can_export() {
            spans.push(Span::styled(
                "  x: export",
                Style::default().fg(Color::LightGreen),
            ));
        }
        if sum.is_loading() {
            spans.push(Span::styled(
                "  loading...",
                Style::default().fg(Color::Yellow),
            ));
        }
        f.render_widget(Paragraph::new(Line::from(spans)), rows[0]);

        let cols = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(35), Constraint::Percentage(65)])
            .split(rows[1]);

        let shown = sched.shown();
        let items: Vec<ListItem> = shown
            .iter()
            .map(|t| {
                let (label, color) = match t.status {
                    TaskStatus::Running => ("run ", Color::Yellow),
                    TaskStatus::Completed => ("ok  ", Color::LightGreen),
                    TaskStatus::Failed if self.session.is_retrying(t.id) => ("retry", Color::Yellow),
                    TaskStatus::Failed => ("fail", Color::Red),
                    TaskStatus::Pending => ("wait", Color::Gray),
                };
                let first = self
                    .form
                    .vars()
                    .first()
                    .and_then(|v| t.params.inputs.get(&v.key))
                    .cloned()
                    .unwrap_or_default();
                ListItem::new(Line::from(vec![
                    Span::styled(format!("{label} "), Style::default().fg(color)),
                    Span::raw(format!("#{} ", t.id)),
                    Span::styled(sanitize_log_line(&first), Style::default().fg(Color::Gray)),
                ]))
            })
            .collect();
        let list = List::new(items)
            .block(
                Block::default()
                    .title(format!("Tasks ({}/{})", shown.len(), sum.total))
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            )
            .highlight_style(Style::default().fg(Color::Black).bg(Color::LightYellow))
            .highlight_symbol("> ");
        let mut state = self.task_list.clone();
        f.render_stateful_widget(list, cols[0], &mut state);

        let selected = self
            .task_list
            .selected()
            .and_then(|i| shown.get(i))
            .copied();
        let mut lines: Vec<Line> = Vec::new();
        let mut title = "Result".to_string();
        if let Some(task) = selected {
            title = format!("Task #{}", task.id);
            if let Some(e) = self.session.error(task.id) {
                lines.push(Line::from(Span::styled(
                    sanitize_log_line(e),
                    Style::default().fg(Color::Red),
                )));
                lines.push(Line::from(""));
            }
            let text = sched
                .completion(task.id)
                .filter(|t| !t.is_empty())
                .or_else(|| self.task_text.get(&task.id).map(String::as_str))
                .unwrap_or_default();
            for l in sanitize_text(text).lines() {
                lines.push(Line::from(l.to_string()));
            }
        }
        let p = Paragraph::new(Text::from(lines))
            .wrap(Wrap { trim: false })
            .scroll((self.result_scroll, 0))
            .block(
                Block::default()
                    .title(title)
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            );
        f.render_widget(p, cols[1]);

        let height = rows[2].height.saturating_sub(2) as usize;
        let skip = self.activity.len().saturating_sub(height);
        let lines: Vec<Line> = self
            .activity
            .iter()
            .skip(skip)
            .map(|l| Line::from(l.clone()))
            .collect();
        let p = Paragraph::new(Text::from(lines)).block(
            Block::default()
                .title("Activity")
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded),
        );
        f.render_widget(p, rows[2]);
    }

    fn draw_unavailable(&self, f: &mut ratatui::Frame, area: ratatui::layout::Rect) {
        let area = centered_rect(60, 40, area);
        let mut lines = Vec::new();
        match self.unavailable.as_ref() {
            Some(e) if e.is_unknown_reason() => {
                lines.push(Line::from(Span::styled(
                    "Something went wrong",
                    Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
                )));
                lines.push(Line::from(""));
                lines.push(Line::from(sanitize_log_line(&e.to_string())));
            }
            Some(e) => {
                lines.push(Line::from(Span::styled(
                    "App is unavailable",
                    Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
                )));
                if *e == Unavailable::ConfigMissing {
                    lines.push(Line::from(""));
                    lines.push(Line::from(e.to_string()));
                }
            }
            None => {}
        }
        let p = Paragraph::new(Text::from(lines))
            .wrap(Wrap { trim: false })
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            );
        f.render_widget(p, area);
    }

    fn draw_modal(&self, f: &mut ratatui::Frame) {
        let (title, prompt, buffer, error) = match &self.input {
            InputMode::Normal => return,
            InputMode::EditVar { idx, buffer, error } => {
                let name = self
                    .form
                    .vars()
                    .get(*idx)
                    .map(|v| v.name.clone())
                    .unwrap_or_default();
                ("Edit Input", name, buffer, error.as_ref())
            }
            InputMode::AddImage { buffer, error } => (
                "Add Image",
                "Image URL (http/https)".to_string(),
                buffer,
                error.as_ref(),
            ),
            InputMode::BatchPath { buffer } => {
                ("Open CSV", "Path to the batch file".to_string(), buffer, None)
            }
            InputMode::ExportPath { buffer } => {
                ("Export", "Write results to".to_string(), buffer, None)
            }
        };

        let area = centered_rect(70, 25, f.area());
        let shadow = shadow_rect(area, f.area());
        f.render_widget(
            Fill {
                style: Style::default()
                    .bg(Color::Black)
                    .add_modifier(Modifier::DIM),
            },
            shadow,
        );
        f.render_widget(Clear, area);

        let mut text = vec![
            Line::from(Span::styled(prompt, Style::default().fg(Color::Yellow))),
            Line::from("enter=save  esc=cancel"),
        ];
        if let Some(e) = error {
            text.push(Line::from(Span::styled(
                format!("error: {e}"),
                Style::default().fg(Color::Red),
            )));
        }
        text.push(Line::from(""));
        text.push(Line::from(buffer.clone()));

        let p = Paragraph::new(Text::from(text))
            .style(Style::default().fg(Color::White).bg(Color::DarkGray))
            .wrap(Wrap { trim: false })
            .block(
                Block::default()
                    .title(title)
                    .borders(Borders::ALL)
                    .border_type(BorderType::Double),
            );
        f.render_widget(p, area);
    }
}

pub fn run_tui(cfg: Config) -> Result<()> {
    let app = App::new(cfg)?;

    let mut stdout = io::stdout();
    enable_raw_mode().map_err(|e| Error::msg(e.to_string()))?;
    execute!(stdout, EnterAlternateScreen, Hide).map_err(|e| Error::msg(e.to_string()))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).map_err(|e| Error::msg(e.to_string()))?;
    terminal
        .clear()
        .map_err(|e| Error::msg(format!("tui clear failed: {e}")))?;

    let result = run_loop(&mut terminal, app);

    disable_raw_mode().ok();
    execute!(terminal.backend_mut(), LeaveAlternateScreen, Show).ok();
    result
}

fn run_loop(terminal: &mut Terminal<CrosstermBackend<Stdout>>, mut app: App) -> Result<()> {
    let tick = Duration::from_millis(100);
    loop {
        app.tick();
        let mut draw_panicked = false;
        let draw_result = terminal.draw(|f| {
            if catch_unwind(AssertUnwindSafe(|| app.draw(f))).is_err() {
                draw_panicked = true;
            }
        });
        if draw_panicked {
            tracing::error!("draw panicked; clearing terminal");
            let _ = terminal.clear();
            continue;
        }
        if let Err(e) = draw_result {
            tracing::error!("draw failed: {e}");
            let _ = terminal.clear();
            continue;
        }

        if event::poll(tick).map_err(|e| Error::msg(e.to_string()))? {
            match event::read().map_err(|e| Error::msg(e.to_string()))? {
                Event::Key(k) => {
                    if k.kind != KeyEventKind::Press {
                        continue;
                    }
                    if app.handle_key(k.code, k.modifiers)? {
                        break;
                    }
                }
                Event::Resize(_, _) => {}
                _ => {}
            }
        }
    }
    Ok(())
}

fn next_tab(current: Screen, delta: isize) -> Screen {
    let n = Screen::TABS.len() as isize;
    let idx = Screen::TABS.iter().position(|s| *s == current).unwrap_or(0) as isize;
    Screen::TABS[(idx + delta).rem_euclid(n) as usize]
}

fn select_step(state: &mut ListState, len: usize, delta: isize) {
    if len == 0 {
        state.select(None);
        return;
    }
    let cur = state.selected().unwrap_or(0) as isize;
    let next = (cur + delta).clamp(0, len as isize - 1);
    state.select(Some(next as usize));
}

fn push_bounded(q: &mut VecDeque<String>, v: String, max: usize) {
    if max == 0 {
        return;
    }
    while q.len() >= max {
        q.pop_front();
    }
    q.push_back(v);
}

fn centered_rect(
    percent_x: u16,
    percent_y: u16,
    r: ratatui::layout::Rect,
) -> ratatui::layout::Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);
    let vertical = popup_layout[1];
    let popup_layout = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical);
    popup_layout[1]
}

fn shadow_rect(
    inner: ratatui::layout::Rect,
    bounds: ratatui::layout::Rect,
) -> ratatui::layout::Rect {
    let max_x = bounds.x.saturating_add(bounds.width);
    let max_y = bounds.y.saturating_add(bounds.height);
    let x = inner.x.saturating_add(1).min(max_x.saturating_sub(1));
    let y = inner.y.saturating_add(1).min(max_y.saturating_sub(1));
    let w = inner.width.min(max_x.saturating_sub(x));
    let h = inner.height.min(max_y.saturating_sub(y));
    ratatui::layout::Rect {
        x,
        y,
        width: w,
        height: h,
    }
}

struct Fill {
    style: Style,
}

impl Widget for Fill {
    fn render(self, area: ratatui::layout::Rect, buf: &mut Buffer) {
        for y in area.y..area.y.saturating_add(area.height) {
            for x in area.x..area.x.saturating_add(area.width) {
                buf[(x, y)].set_char(' ').set_style(self.style);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::VisionSettings;
    use crate::prompt::{PromptConfig, PromptVariable};
    use crate::service::{CompletionOutcome, CompletionProgress, ServiceError};
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    struct Canned;

    impl CompletionService for Canned {
        fn complete(
            &self,
            req: &CompletionRequest,
            _cancel: &AtomicBool,
            on_progress: &mut dyn FnMut(CompletionProgress),
        ) -> std::result::Result<CompletionOutcome, ServiceError> {
            let q = req.inputs.get("query").cloned().unwrap_or_default();
            on_progress(CompletionProgress::Chunk(format!("answer: {q}")));
            Ok(CompletionOutcome {
                text: format!("answer: {q}"),
                message_id: Some("msg-1".into()),
                task_id: Some("t-1".into()),
            })
        }

        fn stop(&self, _task_id: &str) -> std::result::Result<(), ServiceError> {
            Ok(())
        }

        fn feedback(
            &self,
            _message_id: &str,
            _rating: Option<Rating>,
        ) -> std::result::Result<(), ServiceError> {
            Ok(())
        }
    }

    fn app() -> App {
        let state = AppState {
            info: Default::default(),
            prompt_config: PromptConfig::from_variables(vec![PromptVariable::new(
                "query",
                "Query",
                VarType::String,
            )]),
            vision: VisionSettings::default(),
            is_workflow: false,
        };
        App::from_parts(Config::default(), Ok(state), Arc::new(Canned))
    }

    fn settle(app: &mut App) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            app.tick();
            if !app.responding && app.single.is_none() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("single run did not settle");
    }

    #[test]
    fn unavailable_app_starts_on_the_unavailable_screen() {
        let a = App::from_parts(
            Config::default(),
            Err(Unavailable::ConfigMissing),
            Arc::new(Canned),
        );
        assert_eq!(a.screen, Screen::Unavailable);
    }

    #[test]
    fn quick_prompt_key_runs_a_completion() {
        let mut a = app();
        a.handle_key(KeyCode::Char('3'), KeyModifiers::NONE).unwrap();
        a.tick();
        assert_eq!(a.screen, Screen::Results);
        settle(&mut a);
        assert_eq!(a.single_text, "answer: Compare Chapter Lead vs TDM");
        assert_eq!(a.feedback.message_id.as_deref(), Some("msg-1"));

        a.handle_key(KeyCode::Char('+'), KeyModifiers::NONE).unwrap();
        assert_eq!(a.feedback.rating, Some(Rating::Like));
    }

    #[test]
    fn empty_form_is_not_sent() {
        let mut a = app();
        a.screen = Screen::Create;
        a.handle_key(KeyCode::Char('s'), KeyModifiers::NONE).unwrap();
        assert!(a.single.is_none());
        assert_eq!(
            a.last_toast.as_ref().map(|t| t.kind),
            Some(ToastKind::Error)
        );
    }

    #[test]
    fn tabs_wrap_around() {
        assert_eq!(next_tab(Screen::Results, 1), Screen::Welcome);
        assert_eq!(next_tab(Screen::Welcome, -1), Screen::Results);
    }
}
