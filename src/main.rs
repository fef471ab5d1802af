mod ui;

use anyhow::{Context, Result};
use clap::{error::ErrorKind, CommandFactory, Parser};
use crossterm::{
    event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    tty::IsTty,
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    Terminal,
};
use std::{
    fs::{self, OpenOptions},
    io::{self, stdin},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use timebox::{
    app_dirs::AppDirs,
    backend::RUN_ABORTED,
    clock::SystemClock,
    config::{Config, ConfigStore, FileConfigStore},
    controller::{BackendStatus, EditorController, NoticeLevel, SessionContext},
    dataset::{DatasetSource, FileDataset},
    language::Language,
    runtime::{spawn_run, AppEvent, CrosstermEventSource, Runner},
    signals::{CooldownProbe, LabelFileProbe, MarkerFileProbe, NoSignal, SolvedProbe},
    store::{MemoryBackend, ProblemStore, SqliteBackend, StorageBackend},
    submit::OutboxSubmitter,
    surface::TextBuffer,
};

const TICK_RATE_MS: u64 = 100;

/// five-minute solve windows for dataset problems, in python or javascript
#[derive(Parser, Debug, Clone)]
#[clap(
    version,
    about,
    long_about = "A terminal code editor that runs your solution against a problem dataset locally and hands the output in, all inside a five-minute solve window."
)]
pub struct Cli {
    /// problem identifier; code, language and timer are remembered per problem
    problem: String,

    /// dataset file, exposed to your code as the global `dataset`
    #[clap(short = 'd', long)]
    dataset: PathBuf,

    /// language to solve in (remembered for this problem)
    #[clap(short = 'l', long, value_enum)]
    language: Option<Language>,

    /// directory submissions are handed in to
    #[clap(short = 'o', long)]
    outbox: Option<PathBuf>,

    /// file whose presence means the host refuses resubmissions
    #[clap(long)]
    cooldown_marker: Option<PathBuf>,

    /// file holding the host's result label for this problem
    #[clap(long)]
    result_label: Option<PathBuf>,

    /// python interpreter command
    #[clap(long)]
    python: Option<String>,

    /// javascript interpreter command
    #[clap(long)]
    node: Option<String>,

    /// session database (defaults to the state directory)
    #[clap(long)]
    state_db: Option<PathBuf>,
}

impl Cli {
    /// Layer command-line overrides over the stored config
    fn apply(&self, mut config: Config) -> Config {
        if let Some(python) = &self.python {
            config.python_command = python.clone();
        }
        if let Some(node) = &self.node {
            config.node_command = node.clone();
        }
        if let Some(outbox) = &self.outbox {
            config.outbox_dir = Some(outbox.clone());
        }
        config
    }

    fn has_overrides(&self) -> bool {
        self.python.is_some() || self.node.is_some() || self.outbox.is_some()
    }

    fn cooldown_probe(&self) -> Box<dyn CooldownProbe> {
        match &self.cooldown_marker {
            Some(path) => Box::new(MarkerFileProbe::new(path)),
            None => Box::new(NoSignal),
        }
    }

    fn solved_probe(&self) -> Box<dyn SolvedProbe> {
        match &self.result_label {
            Some(path) => Box::new(LabelFileProbe::new(path)),
            None => Box::new(NoSignal),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Run,
    Quit,
}

pub struct App {
    pub controller: EditorController<TextBuffer>,
}

impl App {
    pub fn new(controller: EditorController<TextBuffer>) -> Self {
        Self { controller }
    }

    pub fn on_key(&mut self, key: KeyEvent) -> Action {
        if key.kind == KeyEventKind::Release {
            return Action::None;
        }
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        let controller = &mut self.controller;

        match key.code {
            KeyCode::Esc => return Action::Quit,
            KeyCode::Char('c') if ctrl => return Action::Quit,
            KeyCode::Char('r') if ctrl => return Action::Run,
            KeyCode::F(5) => return Action::Run,
            KeyCode::Char('s') if ctrl => {
                let result = controller.start();
                controller.report(result);
            }
            KeyCode::Char('u') if ctrl => {
                let result = controller.submit();
                controller.report(result);
            }
            KeyCode::Char('l') if ctrl => {
                let result = controller.clear_output();
                controller.report(result);
            }
            KeyCode::Char('t') if ctrl => self.toggle_language(),
            KeyCode::F(2) => self.toggle_language(),
            KeyCode::Char('k') if ctrl => {
                if controller.acknowledge_solved() {
                    controller.notify(NoticeLevel::Info, "Saved code for this problem removed.");
                }
            }
            _ => self.edit(key),
        }
        Action::None
    }

    fn toggle_language(&mut self) {
        let next = self.controller.language().toggle();
        let result = self.controller.switch_language(next);
        self.controller.report(result);
    }

    fn edit(&mut self, key: KeyEvent) {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        let buffer = self.controller.surface_mut();
        let changed = match key.code {
            KeyCode::Char(c) if !ctrl => buffer.insert_char(c),
            KeyCode::Enter => buffer.insert_newline(),
            KeyCode::Tab => buffer.insert_tab(),
            KeyCode::Backspace => buffer.backspace(),
            KeyCode::Delete => buffer.delete(),
            KeyCode::Left => {
                buffer.move_left();
                false
            }
            KeyCode::Right => {
                buffer.move_right();
                false
            }
            KeyCode::Up => {
                buffer.move_up();
                false
            }
            KeyCode::Down => {
                buffer.move_down();
                false
            }
            KeyCode::Home => {
                buffer.move_home();
                false
            }
            KeyCode::End => {
                buffer.move_end();
                false
            }
            _ => false,
        };
        if changed {
            self.controller.on_code_changed();
        }
    }

    pub fn on_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::Tick => {
                self.controller.tick();
            }
            AppEvent::Output(output) => self.controller.push_output(output),
            AppEvent::RunFinished { aborted } => self
                .controller
                .finish_run(aborted.then(|| RUN_ABORTED.to_string())),
            AppEvent::Key(_) | AppEvent::Resize => {}
        }
    }
}

fn init_logging() -> Result<()> {
    let Some(path) = AppDirs::log_path() else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("cannot open log file {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("timebox=info".parse()?))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

fn open_store(cli: &Cli) -> ProblemStore {
    let backend: Arc<dyn StorageBackend> =
        match cli.state_db.clone().or_else(AppDirs::db_path).map(SqliteBackend::open) {
            Some(Ok(db)) => Arc::new(db),
            Some(Err(err)) => {
                warn!(%err, "session database unavailable; progress will not survive a restart");
                Arc::new(MemoryBackend::new())
            }
            None => Arc::new(MemoryBackend::new()),
        };
    ProblemStore::new(backend, &cli.problem)
}

/// Remember interpreter and outbox overrides for later sessions
fn persist_overrides(cli: &Cli, store: &FileConfigStore, config: &Config) {
    if !cli.has_overrides() {
        return;
    }
    match store.save(config) {
        Ok(()) => info!(path = %store.path().display(), "command-line overrides saved"),
        Err(err) => warn!(%err, path = %store.path().display(), "could not save config"),
    }
}

fn outbox_dir(config: &Config) -> Result<PathBuf> {
    if let Some(dir) = &config.outbox_dir {
        return Ok(dir.clone());
    }
    let dir = AppDirs::outbox_dir().unwrap_or_else(|| PathBuf::from("outbox"));
    fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create outbox {}", dir.display()))?;
    Ok(dir)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if !stdin().is_tty() {
        let mut cmd = Cli::command();
        cmd.error(ErrorKind::Io, "stdin must be a tty").exit();
    }

    if let Err(err) = init_logging() {
        eprintln!("timebox: logging disabled: {err:#}");
    }

    let config_store = FileConfigStore::new();
    let config = cli.apply(config_store.load());
    persist_overrides(&cli, &config_store, &config);
    let dataset = FileDataset::new(&cli.dataset)
        .fetch()
        .context("cannot load the problem dataset")?;
    let outbox = outbox_dir(&config)?;

    let ctx = SessionContext {
        problem_id: cli.problem.clone(),
        store: open_store(&cli),
        clock: Arc::new(SystemClock),
        dataset,
        language: cli.language,
        solved: cli.solved_probe(),
        cooldown: cli.cooldown_probe(),
        submitter: Box::new(OutboxSubmitter::new(&outbox)),
        config,
    };
    let mut app = App::new(EditorController::new(ctx, TextBuffer::new()));
    info!(problem = %cli.problem, outbox = %outbox.display(), "editor opened");

    enable_raw_mode()?;

    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = start_tui(&mut terminal, &mut app, CrosstermEventSource::new());

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn start_tui<B: Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    events: CrosstermEventSource,
) -> Result<()> {
    let tx = events.sender();
    let frame = Duration::from_millis(TICK_RATE_MS);
    let runner = Runner::new(events, frame);
    let mut last_tick = Instant::now();

    loop {
        if app.controller.status() == &BackendStatus::Loading {
            // draw the overlay before blocking on interpreter startup
            terminal.draw(|f| ui::draw(app, f))?;
            let result = app.controller.ensure_backend();
            app.controller.report(result);
        }
        terminal.draw(|f| ui::draw(app, f))?;

        let event = runner.step();
        let is_tick = matches!(event, AppEvent::Tick);
        match event {
            AppEvent::Key(key) => match app.on_key(key) {
                Action::Quit => {
                    app.controller.abort_run();
                    break;
                }
                Action::Run => {
                    let result = app.controller.begin_run();
                    if let Some(outputs) = app.controller.report(result) {
                        spawn_run(outputs, tx.clone());
                    }
                }
                Action::None => {}
            },
            event => app.on_event(event),
        }

        // a steady stream of keys or run output must not starve the countdown
        if is_tick {
            last_tick = Instant::now();
        } else if last_tick.elapsed() >= frame {
            app.controller.tick();
            last_tick = Instant::now();
        }
    }

    Ok(())
}
