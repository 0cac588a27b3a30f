use std::future::Future;
use std::io::{self, BufRead, Write};
use std::thread;

use anyhow::Result;
use lumen_core::{ChatEvent, GenerationState, LogLevel, LumenConfig, Theme};
use lumen_llm::GREETING;
use lumen_session::{ChatController, Completion};
use lumen_store::SettingsService;
use tokio::sync::mpsc::{self, UnboundedReceiver};

enum Step {
    Continue,
    Quit,
}

/// Terminal rendering of controller events.
struct View {
    printed: usize,
    verbose: bool,
}

impl View {
    fn render(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::Generation(GenerationState::Streaming { partial_text }) => {
                if self.printed == 0 && !partial_text.is_empty() {
                    print!("assistant: ");
                }
                if let Some(delta) = partial_text.get(self.printed..) {
                    print!("{}", delta);
                    let _ = io::stdout().flush();
                }
                self.printed = partial_text.len();
            }
            ChatEvent::Generation(GenerationState::Completed { final_text, .. }) => {
                match final_text.get(self.printed..) {
                    Some(rest) if self.printed > 0 => println!("{}", rest),
                    _ if self.printed == 0 => println!("assistant: {}", final_text),
                    _ => println!(),
                }
                self.printed = 0;
            }
            ChatEvent::Generation(GenerationState::Failed { .. }) => {
                if self.printed > 0 {
                    println!();
                }
                self.printed = 0;
            }
            ChatEvent::Generation(GenerationState::Idle) => {}
            ChatEvent::Lifecycle(state) => println!("  [{}]", state),
            ChatEvent::Progress(text) => println!("  {}", text),
            ChatEvent::Log(entry) => {
                if entry.level != LogLevel::Info || self.verbose {
                    println!("  {}", entry);
                }
            }
        }
    }

    fn drain(&mut self, rx: &mut UnboundedReceiver<ChatEvent>) {
        while let Ok(event) = rx.try_recv() {
            self.render(event);
        }
    }
}

/// Await `fut` while rendering events; Ctrl-C cancels a streaming reply.
async fn drive<F: Future>(
    fut: F,
    chat: &ChatController,
    rx: &mut UnboundedReceiver<ChatEvent>,
    view: &mut View,
) -> F::Output {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => {
                view.drain(rx);
                return out;
            }
            Some(event) = rx.recv() => view.render(event),
            _ = tokio::signal::ctrl_c() => {
                if !chat.cancel() {
                    println!("  (nothing to cancel)");
                }
            }
        }
    }
}

/// `toggle` flips `current`; anything else must name a theme.
pub(crate) fn next_theme(current: Theme, choice: &str) -> std::result::Result<Theme, String> {
    match choice.trim() {
        "" | "toggle" => Ok(current.toggle()),
        other => other.parse(),
    }
}

/// Read stdin on a plain thread so a pending read never holds up shutdown.
fn spawn_stdin() -> UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn print_stats(completion: &Completion) {
    let Some(usage) = &completion.usage else { return };
    println!("  usage: {}", usage);
    if let Some(rates) = usage.rates_line() {
        println!("  {}", rates);
    }
}

fn display_help() {
    println!();
    println!("Type a message and press Enter to chat. Commands:");
    println!("  /load <id>                   Load a model (and remember it)");
    println!("  /unload                      Unload the current model");
    println!("  /models                      List models");
    println!("  /theme [light|dark|toggle]   Set the color theme");
    println!("  /history                     Show the conversation");
    println!("  /status                      Show model and generation state");
    println!("  /help                        Show this help message");
    println!("  /quit                        Exit");
    println!();
    println!("Ctrl-C while a reply is streaming cancels it.");
    println!();
}

struct Session {
    chat: ChatController,
    rx: UnboundedReceiver<ChatEvent>,
    view: View,
    settings: SettingsService,
}

impl Session {
    async fn load(&mut self, model_id: &str) -> bool {
        if self.chat.select_model(model_id).is_err() {
            self.view.drain(&mut self.rx);
            return false;
        }
        let result = drive(self.chat.load(model_id), &self.chat, &mut self.rx, &mut self.view).await;
        result.is_ok()
    }

    async fn send(&mut self, text: &str) -> Result<()> {
        let result = drive(self.chat.send(text), &self.chat, &mut self.rx, &mut self.view).await;
        if let Ok(Some(completion)) = &result {
            print_stats(completion);
        }
        if self.chat.generation_state().is_terminal() {
            self.chat.acknowledge()?;
            self.view.drain(&mut self.rx);
        }
        Ok(())
    }

    async fn command(&mut self, line: &str) -> Result<Step> {
        let mut parts = line.split_whitespace();
        let cmd = parts.next().unwrap_or_default().to_lowercase();
        let arg = parts.next();

        match cmd.as_str() {
            "load" | "l" => match arg {
                Some(id) => {
                    if self.load(id).await {
                        self.settings.save_model(id.trim())?;
                    }
                }
                None => println!("Usage: /load <model id>"),
            },
            "unload" => {
                let _ = drive(self.chat.unload(), &self.chat, &mut self.rx, &mut self.view).await;
            }
            "models" | "m" => {
                let current = self.chat.current_state();
                crate::print_catalog(self.chat.catalog(), current.model_id());
            }
            "theme" => {
                let current = self.settings.theme(Theme::default())?;
                match next_theme(current, arg.unwrap_or("toggle")) {
                    Ok(theme) => {
                        self.settings.save_theme(theme)?;
                        println!("  Theme set to {}.", theme);
                    }
                    Err(e) => println!("  {}", e),
                }
            }
            "history" => {
                for message in self.chat.history().iter() {
                    println!("  [{}] {}", message.role, message.content);
                }
            }
            "status" | "s" => {
                println!("  Model:      {}", self.chat.current_state());
                println!(
                    "  Selected:   {}",
                    self.chat.selected_model().unwrap_or_else(|| "-".into())
                );
                println!("  Generation: {:?}", self.chat.generation_state());
                println!("  Theme:      {}", self.settings.theme(Theme::default())?);
            }
            "help" | "h" | "?" => display_help(),
            "quit" | "exit" | "q" => return Ok(Step::Quit),
            other => println!("Unknown command: /{}. Type /help for commands.", other),
        }
        Ok(Step::Continue)
    }
}

pub async fn run(
    config: LumenConfig,
    settings: SettingsService,
    model: Option<String>,
    verbose: bool,
) -> Result<()> {
    let catalog = crate::resolve_catalog(&config).await;
    let saved = settings.load(&catalog, Theme::default())?;
    let engine = lumen_llm::build_engine(&config.engine);
    let (chat, rx) = ChatController::new(engine, config.chat.clone(), catalog);

    let mut session = Session {
        chat,
        rx,
        view: View {
            printed: 0,
            verbose,
        },
        settings,
    };

    println!();
    println!(
        "  Lumen chat ({} theme, {}). Type /help for commands.",
        saved.theme,
        saved.theme.accent_color()
    );
    println!();
    println!("assistant: {}", GREETING);

    match model {
        Some(id) => {
            if session.load(&id).await {
                session.settings.save_model(id.trim())?;
            }
        }
        None => {
            session.load(&saved.model_id).await;
        }
    }

    let mut lines = spawn_stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let line = tokio::select! {
            line = lines.recv() => line,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break; // EOF
        };

        session.view.drain(&mut session.rx);
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(command) = input.strip_prefix('/') {
            match session.command(command).await? {
                Step::Quit => break,
                Step::Continue => continue,
            }
        }

        session.send(input).await?;
    }

    println!();
    println!("  Goodbye!");
    Ok(())
}
