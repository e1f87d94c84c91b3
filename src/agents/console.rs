//! Console agent: type commands on stdin, read replies on stdout.
//!
//! Each non-empty input line becomes a `command` event with `returnid` set
//! to the agent's name, so the command registry sends the reply back here.
//!
//! Settings:
//!
//! ```toml
//! [agents.console]
//! enabled = true
//! settings = { user = "operator", stdin = true }
//! ```

use crate::agent::{Agent, AgentContext};
use crate::dispatcher::{Submitter, lock};
use crate::event::{ALL, Event, EventKind};
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const NAME: &str = "console";
const DEFAULT_USER: &str = "console";

pub struct ConsoleAgent {
    name: String,
    cancel: CancellationToken,
    output: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleAgent {
    pub fn new(name: impl Into<String>, output: Box<dyn Write + Send>) -> Self {
        Self {
            name: name.into(),
            cancel: CancellationToken::new(),
            output: Mutex::new(output),
        }
    }

    /// Token cancelled when the shutdown event arrives.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn print(&self, text: &str) -> std::io::Result<()> {
        let mut out = lock(&self.output);
        writeln!(out, "{}", text.trim_end())?;
        out.flush()
    }
}

impl Agent for ConsoleAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle_event(&self, event: &Event) -> anyhow::Result<()> {
        match event.kind() {
            EventKind::Shutdown => {
                debug!("Got shutdown event");
                self.cancel.cancel();
            }
            EventKind::Message | EventKind::UserMessage => {
                let text = match event.body_str() {
                    Some(text) => text.to_string(),
                    None => event.body().to_string(),
                };
                self.print(&text)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Build the console agent, subscribe it, and start the stdin reader
/// unless `stdin = false`.
pub fn factory(ctx: AgentContext) -> anyhow::Result<Arc<dyn Agent>> {
    let user = ctx.setting_str("user").unwrap_or(DEFAULT_USER).to_string();
    let agent = Arc::new(ConsoleAgent::new(ctx.name.as_str(), Box::new(std::io::stdout())));

    ctx.subscribe_shutdown();
    ctx.subscribe(&ctx.name, ALL)?;

    if ctx.setting_bool("stdin").unwrap_or(true) {
        let submitter = ctx.submitter.clone();
        let cancel = agent.cancel_token();
        let name = ctx.name.clone();
        std::thread::Builder::new()
            .name(format!("{name}-reader"))
            .spawn(move || {
                let stdin = std::io::stdin();
                let read = read_commands(stdin.lock(), &submitter, &name, &user, &cancel);
                info!(commands = read, "Console reader stopped");
            })?;
    }

    Ok(agent)
}

/// Submit one command event per non-empty line of `input` until it ends or
/// `cancel` fires. Returns the number of commands submitted.
pub fn read_commands<R: BufRead>(
    input: R,
    submitter: &Submitter,
    name: &str,
    user: &str,
    cancel: &CancellationToken,
) -> usize {
    let mut count = 0;
    for line in input.lines() {
        if cancel.is_cancelled() {
            break;
        }
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Console read failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        submitter.submit(Event::command(line, user, name).with_data_entry("returnid", name));
        count += 1;
    }
    count
}
