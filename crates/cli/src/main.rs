use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use persona_core::config::PersonaCfg;
use persona_core::memory::{EphemeralStore, PersonaStore, PgPersonaStore};
use persona_core::runtime::{CycleDisposition, CycleInput, CycleOutcome, MessageRate, Orchestrator};
use persona_core::types::DialogueTurn;
use persona_llm::provider::{FailingProvider, LlmProvider};
use rustyline::error::ReadlineError;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DB_CONNECT_TIMEOUT_SECS: u64 = 3;
const SPINNER_FRAMES: [&str; 4] = ["·  ", "·· ", "···", " ··"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing: write to file when RUST_LOG is set so the prompt stays clean
    if std::env::var("RUST_LOG").is_ok() {
        let file = std::fs::File::create("/tmp/persona.log")?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(fmt::layer().json().with_target(true).with_writer(file))
            .init();
    }

    // DATABASE_URL (optional; no DB = ephemeral mode)
    let mut notices: Vec<String> = Vec::new();
    let pool = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let connect_result = tokio::time::timeout(
                Duration::from_secs(DB_CONNECT_TIMEOUT_SECS),
                sqlx::postgres::PgPoolOptions::new().max_connections(8).connect(&url),
            )
            .await;

            match connect_result {
                Ok(Ok(pool)) => match sqlx::migrate!("../../migrations").run(&pool).await {
                    Ok(()) => {
                        tracing::info!("database connected and migrations applied");
                        Some(pool)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "database migration failed, falling back to ephemeral mode");
                        notices.push("note: database migration failed; this session will not be saved.".into());
                        None
                    }
                },
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "failed to connect DATABASE_URL, falling back to ephemeral mode");
                    notices.push("note: could not connect to DATABASE_URL; this session will not be saved.".into());
                    None
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_secs = DB_CONNECT_TIMEOUT_SECS,
                        "database connect timed out, falling back to ephemeral mode"
                    );
                    notices.push(format!(
                        "note: database connect timed out ({DB_CONNECT_TIMEOUT_SECS}s); this session will not be saved."
                    ));
                    None
                }
            }
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, running in ephemeral mode");
            None
        }
    };

    // Load PersonaCfg from DB or use defaults
    let cfg = if let Some(ref pool) = pool {
        PersonaCfg::load(pool).await?
    } else {
        PersonaCfg::default()
    };
    let cfg = Arc::new(cfg);

    let store: Arc<dyn PersonaStore> = match pool {
        Some(pool) => Arc::new(PgPersonaStore::new(pool, cfg.oscillation_window)),
        None => Arc::new(EphemeralStore::new(cfg.oscillation_window)),
    };

    let replier: Arc<dyn LlmProvider> = match persona_llm::http::from_env() {
        Some(p) => {
            tracing::info!(model = p.model(), "reply provider initialized");
            Arc::new(p)
        }
        None => {
            tracing::warn!("PERSONA_LLM_MODEL not set or invalid; replies will use fallbacks");
            notices.push("note: no language model configured; replies will be fallbacks.".into());
            Arc::new(FailingProvider)
        }
    };
    let narrator: Arc<dyn LlmProvider> = match persona_llm::http::narrative_from_env() {
        Some(p) => {
            tracing::info!(model = p.model(), "narrative provider initialized");
            Arc::new(p)
        }
        None => replier.clone(),
    };

    let orchestrator =
        Arc::new(Orchestrator::new(replier, narrator, store, cfg)?.with_guard(Arc::new(MessageRate::per_minute())));
    let identity = std::env::var("PERSONA_IDENTITY").unwrap_or_else(|_| "local".to_string());
    run_repl(orchestrator, identity, notices).await
}

/// Conversation state the caller keeps between cycles.
struct Session {
    identity: String,
    history: Vec<DialogueTurn>,
    summary: Option<String>,
}

impl Session {
    fn input(&self, utterance: &str, risk_flagged: bool) -> CycleInput {
        CycleInput {
            identity: self.identity.clone(),
            utterance: utterance.to_string(),
            history: self.history.clone(),
            summary: self.summary.clone(),
            risk_flagged,
        }
    }

    /// Fold a finished cycle back in. Once older turns have been summarized
    /// only the recent window is kept verbatim.
    fn record(&mut self, utterance: &str, outcome: &CycleOutcome) {
        if !outcome.summary.is_empty() {
            if outcome.summary.as_str() != self.summary.as_deref().unwrap_or("") {
                self.history = outcome.recent.clone();
            }
            self.summary = Some(outcome.summary.clone());
        }
        self.history.push(DialogueTurn::user(utterance));
        self.history.push(DialogueTurn::agent(outcome.reply.clone()));
    }
}

async fn run_repl(
    orchestrator: Arc<Orchestrator>,
    identity: String,
    notices: Vec<String>,
) -> anyhow::Result<()> {
    for notice in &notices {
        println!("{notice}");
    }
    println!("commands: /reflect  /reset  /risk <text>  /trace  /q");

    let agent = orchestrator.cfg().agent_name.clone();
    let prompt = Prompt::spawn();
    let prompt_text = format!("{identity}> ");
    let mut session = Session { identity, history: Vec::new(), summary: None };
    let mut show_trace = false;

    loop {
        let line = match prompt.read(&prompt_text).await {
            InputEvent::Line(line) => line,
            InputEvent::Closed(None) => break,
            InputEvent::Closed(Some(err)) => {
                eprintln!("input error: {err}");
                break;
            }
        };
        let text = line.trim();
        match text {
            "" => {}
            "/q" | "/exit" | "/quit" => break,
            "/trace" => {
                show_trace = !show_trace;
                println!("(cycle trace {})", if show_trace { "on" } else { "off" });
            }
            "/reset" => match orchestrator.reset(&session.identity).await {
                Ok(()) => println!("(traits reset to neutral)"),
                Err(e) => println!("(reset failed: {e})"),
            },
            "/reflect" => {
                let result = orchestrator.reflect_now(&session.identity, &session.history).await;
                println!("[reflection] {}", result.reflection);
                println!(
                    "[traits] calm={:.2} empathy={:.2} curiosity={:.2}  focus={}  safety={}",
                    result.traits.calm,
                    result.traits.empathy,
                    result.traits.curiosity,
                    result.next_focus,
                    result.safety
                );
            }
            _ => {
                let (utterance, risk) = match text.strip_prefix("/risk ") {
                    Some(rest) => (rest.trim(), true),
                    None => (text, false),
                };
                let input = session.input(utterance, risk);
                match run_cycle(orchestrator.clone(), input).await? {
                    CycleDisposition::Completed(outcome) => {
                        println!("{agent}> {}", outcome.reply);
                        if show_trace {
                            println!("  {}", trace_line(&outcome));
                        }
                        session.record(utterance, &outcome);
                    }
                    CycleDisposition::Denied { .. } => println!("(usage limit reached)"),
                    CycleDisposition::CallerGone { .. } => println!("(cancelled; the cycle still saved its state)"),
                }
            }
        }
    }
    println!();
    Ok(())
}

/// Run one cycle on its own task with a spinner. Ctrl+C cancels the
/// caller's token; the cycle itself runs to the end and persists.
async fn run_cycle(orchestrator: Arc<Orchestrator>, input: CycleInput) -> anyhow::Result<CycleDisposition> {
    let mut spinner = Spinner::new(format!("{} is thinking", orchestrator.cfg().agent_name));
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let mut task = tokio::spawn(async move { orchestrator.handle(input, &token).await });

    let mut ticks = tokio::time::interval(Duration::from_millis(120));
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    let joined = loop {
        tokio::select! {
            joined = &mut task => break joined,
            _ = &mut interrupt, if !cancel.is_cancelled() => {
                cancel.cancel();
                spinner.relabel("cancelled, saving state");
            }
            _ = ticks.tick() => spinner.draw()?,
        }
    };
    spinner.clear()?;
    Ok(joined?)
}

/// One-line view of a finished cycle: the states it visited, where it
/// stopped, and what shaped the reply.
fn trace_line(outcome: &CycleOutcome) -> String {
    let path: Vec<&str> = outcome.trace.iter().map(|s| s.as_str()).collect();
    let mut line = format!("[{} => {}]", path.join(" > "), outcome.final_state);
    if let Some(tone) = outcome.tone {
        line.push_str(&format!(" tone={tone}"));
    }
    if outcome.reply_fell_back {
        line.push_str(" reply=fallback");
    }
    let t = outcome.traits;
    line.push_str(&format!(" calm={:.2} empathy={:.2} curiosity={:.2}", t.calm, t.empathy, t.curiosity));
    if let Some(note) = &outcome.contradiction {
        line.push_str(&format!(" ({note})"));
    }
    line
}

/// Progress line redrawn in place while a cycle runs.
struct Spinner {
    label: String,
    frame: usize,
    started: Instant,
}

impl Spinner {
    fn new(label: String) -> Self {
        Self { label, frame: 0, started: Instant::now() }
    }

    fn relabel(&mut self, label: &str) {
        self.label = label.to_string();
    }

    fn draw(&mut self) -> io::Result<()> {
        self.frame = (self.frame + 1) % SPINNER_FRAMES.len();
        let elapsed = self.started.elapsed().as_secs_f32();
        print!("\r\x1b[2K{} {} {elapsed:.1}s", self.label, SPINNER_FRAMES[self.frame]);
        io::stdout().flush()
    }

    fn clear(&self) -> io::Result<()> {
        print!("\r\x1b[2K");
        io::stdout().flush()
    }
}

enum InputEvent {
    Line(String),
    /// Ctrl+C, Ctrl+D, or an editor failure.
    Closed(Option<String>),
}

/// Line editor living on its own thread. The terminal is only in raw mode
/// while a read is pending, so Ctrl+C during a cycle reaches the signal handler.
struct Prompt {
    requests: std::sync::mpsc::Sender<(String, oneshot::Sender<InputEvent>)>,
}

impl Prompt {
    fn spawn() -> Self {
        let (requests, pending) = std::sync::mpsc::channel::<(String, oneshot::Sender<InputEvent>)>();
        std::thread::spawn(move || {
            let mut editor = rustyline::DefaultEditor::new().map_err(|e| e.to_string());
            for (prompt, reply) in pending {
                let event = match editor.as_mut() {
                    Ok(editor) => read_line(editor, &prompt),
                    Err(e) => InputEvent::Closed(Some(e.clone())),
                };
                if reply.send(event).is_err() {
                    break;
                }
            }
        });
        Self { requests }
    }

    async fn read(&self, prompt: &str) -> InputEvent {
        let (reply, event) = oneshot::channel();
        if self.requests.send((prompt.to_string(), reply)).is_err() {
            return InputEvent::Closed(None);
        }
        event.await.unwrap_or(InputEvent::Closed(None))
    }
}

fn read_line(editor: &mut rustyline::DefaultEditor, prompt: &str) -> InputEvent {
    match editor.readline(prompt) {
        Ok(line) => {
            let _ = editor.add_history_entry(line.as_str());
            InputEvent::Line(line)
        }
        Err(ReadlineError::Interrupted | ReadlineError::Eof) => InputEvent::Closed(None),
        Err(e) => InputEvent::Closed(Some(e.to_string())),
    }
}
