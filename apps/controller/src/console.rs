//! Line-oriented operator console.

use std::str::FromStr;
use std::sync::Arc;

use sashlink_link::{DeviceRegistry, LinkManager, PeripheralRef};
use sashlink_mirror::MirrorPublisher;
use sashlink_protocol::Command;

pub const HELP: &str = "\
Commands:
  list                      list bonded peripherals
  connect <address|index>   connect to a peripheral
  open                      open the window
  close                     close the window
  state                     show the link state
  disconnect                close the link
  help                      show this help
  quit                      exit";

/// Peripheral selector accepted by `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// 1-based position in the last `list` output.
    Index(usize),
    Address(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    List,
    Connect(Target),
    Send(Command),
    State,
    Disconnect,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty input")]
    Empty,

    #[error("unknown command '{0}', type 'help'")]
    Unknown(String),

    #[error("usage: connect <address|index>")]
    MissingTarget,

    #[error("'{0}' takes no arguments")]
    UnexpectedArgument(String),
}

impl FromStr for ConsoleCommand {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err(ParseError::Empty);
        };
        let verb = verb.to_ascii_lowercase();
        let arg = words.next();
        if words.next().is_some() {
            return Err(ParseError::UnexpectedArgument(verb));
        }

        if verb == "connect" {
            let target = arg.ok_or(ParseError::MissingTarget)?;
            return Ok(Self::Connect(match target.parse::<usize>() {
                Ok(index) => Target::Index(index),
                Err(_) => Target::Address(target.to_string()),
            }));
        }
        if arg.is_some() {
            return Err(ParseError::UnexpectedArgument(verb));
        }

        match verb.as_str() {
            "list" | "ls" => Ok(Self::List),
            "open" => Ok(Self::Send(Command::Open)),
            "close" => Ok(Self::Send(Command::Close)),
            "state" | "status" => Ok(Self::State),
            "disconnect" => Ok(Self::Disconnect),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            _ => Err(ParseError::Unknown(verb)),
        }
    }
}

/// What the input loop should do after a line.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue(Vec<String>),
    Quit,
}

pub struct Console {
    registry: DeviceRegistry,
    manager: Arc<LinkManager>,
    publisher: MirrorPublisher,
    listed: Vec<PeripheralRef>,
}

impl Console {
    pub fn new(
        registry: DeviceRegistry,
        manager: Arc<LinkManager>,
        publisher: MirrorPublisher,
    ) -> Self {
        Self {
            registry,
            manager,
            publisher,
            listed: Vec::new(),
        }
    }

    pub async fn handle_line(&mut self, line: &str) -> Flow {
        match line.parse::<ConsoleCommand>() {
            Ok(ConsoleCommand::Quit) => Flow::Quit,
            Ok(command) => Flow::Continue(self.execute(command).await),
            Err(ParseError::Empty) => Flow::Continue(Vec::new()),
            Err(e) => Flow::Continue(vec![e.to_string()]),
        }
    }

    async fn execute(&mut self, command: ConsoleCommand) -> Vec<String> {
        match command {
            ConsoleCommand::List => self.list().await,
            ConsoleCommand::Connect(target) => self.connect(target).await,
            ConsoleCommand::Send(command) => match self.manager.send(command).await {
                Ok(submitted) => {
                    // Mirror in the background; the command already went out.
                    drop(self.publisher.publish_command(submitted.command));
                    vec![format!("Command sent: {}", submitted.command)]
                }
                Err(e) => vec![format!("Command not sent: {e}")],
            },
            ConsoleCommand::State => self.state(),
            ConsoleCommand::Disconnect => {
                self.manager.close().await;
                vec!["Disconnected".to_string()]
            }
            ConsoleCommand::Help => HELP.lines().map(str::to_string).collect(),
            ConsoleCommand::Quit => Vec::new(),
        }
    }

    async fn list(&mut self) -> Vec<String> {
        match self.registry.list_bonded().await {
            Ok(peripherals) if peripherals.is_empty() => {
                self.listed.clear();
                vec!["No bonded peripherals. Pair the actuator in system settings first.".into()]
            }
            Ok(peripherals) => {
                let lines = peripherals
                    .iter()
                    .enumerate()
                    .map(|(i, p)| format!("{:>2}. {}  {}", i + 1, p.display_name, p.address))
                    .collect();
                self.listed = peripherals;
                lines
            }
            Err(e) => vec![format!("Cannot list peripherals: {e}")],
        }
    }

    async fn connect(&mut self, target: Target) -> Vec<String> {
        let address = match target {
            Target::Address(address) => address,
            Target::Index(index) => {
                if self.listed.is_empty() {
                    self.list().await;
                }
                match index.checked_sub(1).and_then(|i| self.listed.get(i)) {
                    Some(p) => p.address.clone(),
                    None => return vec![format!("No peripheral #{index}, run 'list'")],
                }
            }
        };

        match self.manager.connect(&address).await {
            Ok(()) => vec![format!("Connecting to {address}")],
            Err(e) => vec![format!("Cannot connect: {e}")],
        }
    }

    fn state(&self) -> Vec<String> {
        let mut lines = vec![format!("Status: {}", self.manager.current_state())];
        if let Some(address) = self.manager.address() {
            lines.push(format!("Device: {address}"));
        }
        if let Some(e) = self.manager.last_error() {
            lines.push(format!("Last error: {e}"));
        }
        lines
    }
}
