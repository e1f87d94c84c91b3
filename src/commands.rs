//! Command registry: parsing and running line-oriented commands.
//!
//! Commands are keyed by a lowercase word, optionally grouped one level
//! deep (`lights on`, `lights off`). Each entry is serviced in one of three
//! ways:
//!
//! - [`CommandHandler::Function`] calls a closure directly,
//! - [`CommandHandler::Named`] looks the name up in the capability table,
//! - [`CommandHandler::Event`] submits a copy of a template event with the
//!   caller's arguments in `data.args`.
//!
//! Running a command always produces a reply string, error text included.

use crate::dispatcher::Submitter;
use crate::error::{CommandError, Removal};
use crate::event::{ALL, CORE_EMITTER, Event};
use regex::Regex;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

/// Reply when a handler produced no value.
pub const NO_RESPONSE: &str = "no response";

/// Reply when a function handler failed.
pub const HANDLER_FAILED: &str = "An error occurred";

pub type CommandFn = Arc<dyn Fn(&[String]) -> anyhow::Result<Option<String>> + Send + Sync>;

/// A built-in operation reachable through [`CommandHandler::Named`].
pub type Capability = fn(&CommandRegistry, &[String]) -> Option<String>;

#[derive(Clone)]
pub enum CommandHandler {
    Function(CommandFn),
    Named(String),
    Event(Event),
}

impl fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(_) => f.write_str("Function(..)"),
            Self::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Self::Event(event) => f.debug_tuple("Event").field(&event.id()).finish(),
        }
    }
}

/// A runnable command.
#[derive(Debug, Clone)]
pub struct CommandEntry {
    pub description: String,
    /// `ALL`, or a comma/space separated list of user ids.
    pub authorized: String,
    pub handler: CommandHandler,
    /// Pattern the first argument must match, checked by [`CommandEntry::validate`].
    pub validate: Option<Regex>,
    /// Whether the validated argument may be left out.
    pub optional: bool,
}

impl CommandEntry {
    pub fn new(
        description: impl Into<String>,
        authorized: impl Into<String>,
        handler: CommandHandler,
    ) -> Self {
        Self {
            description: description.into(),
            authorized: authorized.into(),
            handler,
            validate: None,
            optional: false,
        }
    }

    pub fn function<F>(description: impl Into<String>, authorized: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[String]) -> anyhow::Result<Option<String>> + Send + Sync + 'static,
    {
        Self::new(description, authorized, CommandHandler::Function(Arc::new(f)))
    }

    pub fn named(
        description: impl Into<String>,
        authorized: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(description, authorized, CommandHandler::Named(name.into()))
    }

    pub fn event(description: impl Into<String>, authorized: impl Into<String>, event: Event) -> Self {
        Self::new(description, authorized, CommandHandler::Event(event))
    }

    pub fn with_validation(mut self, pattern: Regex) -> Self {
        self.validate = Some(pattern);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Check `user` against the `authorized` list.
    pub fn authorize(&self, user: &str) -> Result<(), CommandError> {
        let allowed = self
            .authorized
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .any(|allowed| allowed == ALL || allowed == user);
        if allowed {
            Ok(())
        } else {
            warn!(user, "Not authorized");
            Err(CommandError::NotAuthorized)
        }
    }

    /// Check the first argument against the validation pattern, if any.
    ///
    /// The pattern must match at the start of the argument.
    pub fn validate(&self, args: &[String]) -> Result<(), CommandError> {
        let Some(pattern) = &self.validate else {
            return Ok(());
        };
        match args.first() {
            None if self.optional => Ok(()),
            None => Err(CommandError::ValidationFailed(
                "Command is missing an argument".to_string(),
            )),
            Some(arg) if pattern.find(arg).is_some_and(|m| m.start() == 0) => Ok(()),
            Some(arg) => Err(CommandError::ValidationFailed(format!("Bad input '{arg}'"))),
        }
    }
}

/// A top-level registry node.
#[derive(Debug, Clone)]
pub enum CommandSpec {
    Leaf(CommandEntry),
    Group(BTreeMap<String, CommandEntry>),
}

impl From<CommandEntry> for CommandSpec {
    fn from(entry: CommandEntry) -> Self {
        Self::Leaf(entry)
    }
}

/// Result of [`CommandRegistry::parse`].
#[derive(Debug, Clone)]
pub struct ParsedCommand {
    /// `"word"` or `"word sub"`.
    pub name: String,
    pub entry: CommandEntry,
    pub args: Vec<String>,
}

pub struct CommandRegistry {
    commands: RwLock<BTreeMap<String, CommandSpec>>,
    capabilities: RwLock<HashMap<String, Capability>>,
    submitter: Submitter,
}

impl CommandRegistry {
    /// A registry holding the `help` command, with the `help` and `ping`
    /// capabilities available.
    pub fn new(submitter: Submitter) -> Self {
        let mut capabilities: HashMap<String, Capability> = HashMap::new();
        capabilities.insert("help".to_string(), |registry, _| Some(registry.help()));
        capabilities.insert("ping".to_string(), |_, _| Some("pong".to_string()));

        let registry = Self {
            commands: RwLock::new(BTreeMap::new()),
            capabilities: RwLock::new(capabilities),
            submitter,
        };
        let _ = registry.add_one(
            "help",
            CommandEntry::named("List available commands", ALL, "help").into(),
        );
        registry
    }

    /// Make `capability` available to `handlername` entries as `name`.
    pub fn register_capability(&self, name: impl Into<String>, capability: Capability) {
        let name = name.into().to_lowercase();
        debug!(capability = %name, "Registering capability");
        self.capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, capability);
    }

    fn capability(&self, name: &str) -> Option<Capability> {
        self.capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    // ── Registration ────────────────────────────────────────────────────────

    /// Add several commands; each is accepted or rejected on its own.
    ///
    /// Returns the rejections, which have already been logged.
    pub fn add<I, S>(&self, entries: I) -> Vec<CommandError>
    where
        I: IntoIterator<Item = (S, CommandSpec)>,
        S: Into<String>,
    {
        entries
            .into_iter()
            .filter_map(|(name, spec)| self.add_one(name, spec).err())
            .collect()
    }

    pub fn add_one(&self, name: impl Into<String>, spec: CommandSpec) -> Result<(), CommandError> {
        let name = name.into().trim().to_lowercase();
        let result = self.check(&name, spec).and_then(|spec| {
            let mut commands = self.commands.write().unwrap_or_else(PoisonError::into_inner);
            if commands.contains_key(&name) {
                return Err(CommandError::Duplicate(name.clone()));
            }
            commands.insert(name.clone(), spec);
            Ok(())
        });

        match &result {
            Ok(()) => debug!(command = %name, "Added command"),
            Err(e) => error!(error = %e, "Skipping command"),
        }
        result
    }

    /// Normalise and validate a spec before insertion.
    fn check(&self, name: &str, spec: CommandSpec) -> Result<CommandSpec, CommandError> {
        let invalid = |reason: &str| CommandError::Invalid {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if !is_word(name) {
            return Err(invalid("name must be a single word"));
        }

        match spec {
            CommandSpec::Leaf(entry) => {
                self.check_entry(&entry).map_err(|r| invalid(&r))?;
                Ok(CommandSpec::Leaf(entry))
            }
            CommandSpec::Group(subs) => {
                if subs.is_empty() {
                    return Err(invalid("command group is empty"));
                }
                let mut normalised = BTreeMap::new();
                for (sub, entry) in subs {
                    let sub = sub.trim().to_lowercase();
                    if !is_word(&sub) {
                        return Err(invalid("sub-command must be a single word"));
                    }
                    self.check_entry(&entry)
                        .map_err(|r| invalid(&format!("'{sub}': {r}")))?;
                    normalised.insert(sub, entry);
                }
                Ok(CommandSpec::Group(normalised))
            }
        }
    }

    fn check_entry(&self, entry: &CommandEntry) -> Result<(), String> {
        if entry.description.trim().is_empty() {
            return Err("missing description".to_string());
        }
        if entry.authorized.trim().is_empty() {
            return Err("missing authorized".to_string());
        }
        if let CommandHandler::Named(handler) = &entry.handler {
            if self.capability(handler).is_none() {
                return Err(format!("unknown handler name '{handler}'"));
            }
        }
        Ok(())
    }

    /// Add commands described as JSON.
    ///
    /// The value maps each name either to an entry object or to an object of
    /// sub-command entries. Entry keys are `description`, `authorized`,
    /// exactly one of `handlername` / `handlerevent` / `handler`, and the
    /// optional `validate` and `optional`. Keys match case-insensitively.
    pub fn add_value(&self, value: &Value) -> Vec<CommandError> {
        let Some(object) = value.as_object() else {
            error!("Command definition is not an object");
            return vec![CommandError::Invalid {
                name: value.to_string(),
                reason: "definition is not an object".to_string(),
            }];
        };

        let mut rejected = Vec::new();
        for (name, definition) in object {
            match spec_from_value(name, definition) {
                Ok(spec) => {
                    if let Err(e) = self.add_one(name.as_str(), spec) {
                        rejected.push(e);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Skipping command");
                    rejected.push(e);
                }
            }
        }
        rejected
    }

    pub fn remove(&self, name: &str) -> Removal {
        let name = name.trim().to_lowercase();
        let removed = self
            .commands
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name)
            .is_some();

        if removed {
            debug!(command = %name, "Removed command");
            Removal::Removed
        } else {
            warn!(command = %name, "Command not registered");
            Removal::NotFound
        }
    }

    /// Command names, sorted; grouped commands appear as `"name sub"`.
    pub fn list(&self) -> Vec<String> {
        let commands = self.commands.read().unwrap_or_else(PoisonError::into_inner);
        let mut names = Vec::new();
        for (name, spec) in commands.iter() {
            match spec {
                CommandSpec::Leaf(_) => names.push(name.clone()),
                CommandSpec::Group(subs) => {
                    names.extend(subs.keys().map(|sub| format!("{name} {sub}")));
                }
            }
        }
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&name.to_lowercase())
    }

    /// Help text: one line per command, grouped commands under their name.
    pub fn help(&self) -> String {
        let commands = self.commands.read().unwrap_or_else(PoisonError::into_inner);
        let mut msg = String::new();
        for (name, spec) in commands.iter() {
            match spec {
                CommandSpec::Leaf(entry) => {
                    msg.push_str(&format!("{:10}{:15}{}\n", name, " ", entry.description));
                }
                CommandSpec::Group(subs) => {
                    msg.push_str(name);
                    msg.push('\n');
                    for (sub, entry) in subs {
                        msg.push_str(&format!("{:10}{:15}{}\n", "", sub, entry.description));
                    }
                }
            }
        }
        msg
    }

    // ── Execution ───────────────────────────────────────────────────────────

    /// Resolve `line` to an entry and its arguments.
    ///
    /// The first two words are lowercased before lookup, whether or not the
    /// second one names a sub-command; later words keep their case. An empty
    /// line means `help`.
    pub fn parse(&self, line: &str) -> Result<ParsedCommand, CommandError> {
        let mut words: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        for word in words.iter_mut().take(2) {
            *word = word.to_lowercase();
        }
        let mut words = words.into_iter();
        let first = words.next().unwrap_or_else(|| "help".to_string());

        let commands = self.commands.read().unwrap_or_else(PoisonError::into_inner);
        let (name, entry) = match commands.get(&first) {
            Some(CommandSpec::Leaf(entry)) => (first, entry.clone()),
            Some(CommandSpec::Group(subs)) => {
                let sub = words.next();
                match sub.as_deref().and_then(|s| subs.get(s).map(|entry| (s, entry))) {
                    Some((s, entry)) => (format!("{first} {s}"), entry.clone()),
                    None => {
                        debug!(command = %first, "Command not found");
                        return Err(CommandError::NotFound(first));
                    }
                }
            }
            None => {
                debug!(command = %first, "Command not found");
                return Err(CommandError::NotFound(first));
            }
        };
        drop(commands);

        let args: Vec<String> = words.collect();
        debug!(command = %name, ?args, "Parsed command");
        Ok(ParsedCommand { name, entry, args })
    }

    /// Run `entry` with `args` on behalf of `user`.
    pub fn run(&self, entry: &CommandEntry, args: &[String], user: &str) -> String {
        let reply = match &entry.handler {
            CommandHandler::Function(f) => match catch_unwind(AssertUnwindSafe(|| f(args))) {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    error!(error = %e, "Command handler failed");
                    Some(HANDLER_FAILED.to_string())
                }
                Err(_) => {
                    error!("Command handler panicked");
                    Some(HANDLER_FAILED.to_string())
                }
            },
            CommandHandler::Event(template) => {
                let event = template
                    .clone()
                    .with_data_entry("args", json!(args))
                    .with_user(user);
                debug!(%event, "Submitting command event");
                self.submitter.submit(event);
                None
            }
            CommandHandler::Named(name) => match self.capability(name) {
                Some(capability) => capability(self, args),
                None => {
                    error!(handler = %name, "Could not locate function");
                    return CommandError::HandlerNotFound(name.clone()).to_string();
                }
            },
        };

        reply.unwrap_or_else(|| NO_RESPONSE.to_string())
    }

    /// Parse and run `line`. Authorization and validation are not checked;
    /// see [`CommandRegistry::handle_checked`].
    pub fn handle(&self, user: &str, line: &str) -> String {
        match self.parse(line) {
            Ok(parsed) => self.run(&parsed.entry, &parsed.args, user),
            Err(e) => e.to_string(),
        }
    }

    /// [`CommandRegistry::handle`] gated on [`CommandEntry::authorize`] and
    /// [`CommandEntry::validate`].
    pub fn handle_checked(&self, user: &str, line: &str) -> String {
        let parsed = match self.parse(line) {
            Ok(parsed) => parsed,
            Err(e) => return e.to_string(),
        };
        if let Err(e) = parsed
            .entry
            .authorize(user)
            .and_then(|()| parsed.entry.validate(&parsed.args))
        {
            return e.to_string();
        }
        self.run(&parsed.entry, &parsed.args, user)
    }

    /// Entry point for `command` events routed by the dispatcher.
    pub fn on_command_event(&self, event: &Event) {
        match event.data_str("operation") {
            Some("add") => match event.data().get("command") {
                Some(definition) => {
                    self.add_value(definition);
                }
                None => warn!(%event, "Command add without a definition"),
            },
            Some("remove") => {
                let names: Vec<&str> = match event.data().get("command") {
                    Some(Value::String(name)) => vec![name.as_str()],
                    Some(Value::Array(names)) => names.iter().filter_map(Value::as_str).collect(),
                    Some(Value::Object(map)) => map.keys().map(String::as_str).collect(),
                    _ => Vec::new(),
                };
                if names.is_empty() {
                    warn!(%event, "Command remove without a name");
                }
                for name in names {
                    self.remove(name);
                }
            }
            Some("list") => self.reply_with_list(event),
            Some(other) => warn!(operation = other, "Unknown command operation"),
            None => match event.body_str() {
                Some(line) if !line.is_empty() => {
                    let reply = self.handle(event.user(), line);
                    if let Some(return_id) = event.data_str("returnid") {
                        self.send_reply(return_id, reply, event.user());
                    }
                }
                _ => error!(%event, "Cannot process command event"),
            },
        }
    }

    fn reply_with_list(&self, event: &Event) {
        let Some(template) = event.data().get("returnevent") else {
            debug!("Command list without a return event");
            return;
        };
        match Event::from_value(template.clone()) {
            Ok(reply) => {
                let reply = reply.with_data_entry("return", json!(self.list()));
                self.submitter.submit(reply);
            }
            Err(e) => warn!(error = %e, "Malformed return event"),
        }
    }

    fn send_reply(&self, return_id: &str, reply: String, user: &str) {
        match Event::message(return_id, reply, CORE_EMITTER) {
            Ok(event) => {
                info!(id = return_id, "Sending command reply");
                self.submitter.submit(event.with_user(user));
            }
            Err(e) => warn!(error = %e, "Cannot build command reply"),
        }
    }
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && !s.contains(char::is_whitespace)
}

// ── JSON definitions ────────────────────────────────────────────────────────

fn spec_from_value(name: &str, definition: &Value) -> Result<CommandSpec, CommandError> {
    let invalid = |reason: String| CommandError::Invalid {
        name: name.to_string(),
        reason,
    };

    let Some(object) = definition.as_object() else {
        return Err(invalid("definition is not an object".to_string()));
    };

    if lookup(object, "description").is_some() {
        return entry_from_object(object)
            .map(CommandSpec::Leaf)
            .map_err(invalid);
    }

    let mut subs = BTreeMap::new();
    for (sub, value) in object {
        let entry = value
            .as_object()
            .ok_or_else(|| format!("'{sub}' is not an object"))
            .and_then(entry_from_object)
            .map_err(|r| invalid(format!("'{sub}': {r}")))?;
        subs.insert(sub.clone(), entry);
    }
    Ok(CommandSpec::Group(subs))
}

fn lookup<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

fn entry_from_object(object: &Map<String, Value>) -> Result<CommandEntry, String> {
    let text = |key: &str| -> Result<String, String> {
        lookup(object, key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| format!("missing {key}"))
    };

    let description = text("description")?;
    let authorized = text("authorized")?;

    let handlers: Vec<&str> = ["handler", "handlername", "handlerevent"]
        .into_iter()
        .filter(|key| lookup(object, key).is_some())
        .collect();
    let handler = match handlers.as_slice() {
        ["handlername"] => CommandHandler::Named(text("handlername")?),
        ["handlerevent"] => {
            let template = lookup(object, "handlerevent")
                .cloned()
                .unwrap_or(Value::Null);
            let event = Event::from_value(template).map_err(|e| format!("bad handlerevent: {e}"))?;
            CommandHandler::Event(event)
        }
        ["handler"] => return Err("handler is not callable".to_string()),
        [] => return Err("missing handler".to_string()),
        _ => return Err("more than one handler".to_string()),
    };

    let validate = match lookup(object, "validate").and_then(Value::as_str) {
        Some(pattern) => Some(Regex::new(pattern).map_err(|e| format!("bad validate pattern: {e}"))?),
        None => None,
    };
    let optional = lookup(object, "optional")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(CommandEntry {
        description,
        authorized,
        handler,
        validate,
        optional,
    })
}
