//! An embeddable event bus for agent components.
//!
//! Agents exchange [`Event`]s through a [`Dispatcher`], which routes each
//! event to its subscribers on a pool of worker threads, runs line-oriented
//! commands through a [`CommandRegistry`], and emits timed or recurring
//! events from a [`Scheduler`] driven by wildcard [`TimePattern`]s.

pub mod agent;
pub mod agents;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod logging;
pub mod scheduler;
pub mod timing;

pub use agent::{Agent, AgentContext, AgentFactories, AgentFactory, load_agents};
pub use commands::{CommandEntry, CommandHandler, CommandRegistry, CommandSpec};
pub use config::Config;
pub use dispatcher::{Dispatcher, Submitter};
pub use error::{CommandError, ConfigError, EventError, Removal, ScheduleError, TimeError};
pub use event::{ALL, Event, EventKind};
pub use scheduler::Scheduler;
pub use timing::{TimeFormats, TimePattern};
