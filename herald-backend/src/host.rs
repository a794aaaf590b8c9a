//! The narrow interface between the presence core and the proxy it runs in.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use tracing::info;

/// Identity used for commands arriving over the bus. Anything published on
/// the command channels is trusted with console permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkCommandSender;

impl NetworkCommandSender {
    pub const NAME: &'static str = "Herald";

    pub fn name(&self) -> &'static str {
        Self::NAME
    }

    pub fn has_console_permissions(&self) -> bool {
        true
    }
}

/// Host proxy services the core calls into.
pub trait ProxyHost: Send + Sync {
    /// Execute a command line as `sender`. Returns false when the host does
    /// not know the command. May block.
    fn dispatch_command(&self, sender: &NetworkCommandSender, command: &str) -> bool;

    /// Whether `server` names a backend server this proxy can route to.
    fn has_server(&self, server: &str) -> bool;
}

/// Host used when running without a proxy attached: knows a fixed server
/// list and keeps the most recent dispatched commands.
#[derive(Debug, Default)]
pub struct StandaloneHost {
    servers: HashSet<String>,
    dispatched: Mutex<VecDeque<String>>,
}

impl StandaloneHost {
    const HISTORY: usize = 100;

    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            dispatched: Mutex::new(VecDeque::new()),
        }
    }

    /// Commands dispatched so far, oldest first.
    pub fn dispatched(&self) -> Vec<String> {
        self.dispatched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl ProxyHost for StandaloneHost {
    fn dispatch_command(&self, sender: &NetworkCommandSender, command: &str) -> bool {
        info!(sender = sender.name(), command, "executing network command");
        let mut dispatched = self.dispatched.lock().unwrap_or_else(PoisonError::into_inner);
        if dispatched.len() == Self::HISTORY {
            dispatched.pop_front();
        }
        dispatched.push_back(command.to_string());
        true
    }

    fn has_server(&self, server: &str) -> bool {
        self.servers.contains(server)
    }
}
