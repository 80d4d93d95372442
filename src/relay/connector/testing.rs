//! Scripted in-memory backend for exercising the connector and sessions
//! without a network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::backend::{ChannelEvent, ExecChannel, ShellBackend, ShellLink};
use crate::relay::error::RelayError;
use crate::relay::protocol::TargetConfig;

/// One scripted step of an exec channel.
pub(crate) enum Step {
    Event(ChannelEvent),
    Sleep(Duration),
    /// Never produce another event
    Pending,
}

impl Step {
    pub(crate) fn stdout(text: &str) -> Self {
        Step::Event(ChannelEvent::Stdout(text.as_bytes().to_vec()))
    }

    pub(crate) fn stderr(text: &str) -> Self {
        Step::Event(ChannelEvent::Stderr(text.as_bytes().to_vec()))
    }

    pub(crate) fn exit(code: u32) -> Self {
        Step::Event(ChannelEvent::ExitStatus(code))
    }
}

type Script = Arc<dyn Fn(&str) -> Vec<Step> + Send + Sync>;

#[derive(Clone)]
enum ConnectBehavior {
    Accept,
    Reject(String),
    Unreachable(String),
    Hang,
}

#[derive(Default)]
struct Recorded {
    targets: Mutex<Vec<String>>,
    commands: Mutex<Vec<String>>,
    stdin: Mutex<Vec<u8>>,
    closed_channels: AtomicUsize,
    disconnects: AtomicUsize,
    link_closed: AtomicBool,
}

/// Backend whose links answer every command from a script.
#[derive(Clone)]
pub(crate) struct ScriptedBackend {
    connect: ConnectBehavior,
    script: Script,
    recorded: Arc<Recorded>,
}

impl ScriptedBackend {
    /// Accepts every connection; commands exit 0 with no output.
    pub(crate) fn new() -> Self {
        Self {
            connect: ConnectBehavior::Accept,
            script: Arc::new(|_| vec![Step::exit(0), Step::Event(ChannelEvent::Closed)]),
            recorded: Arc::new(Recorded::default()),
        }
    }

    pub(crate) fn with_script(
        mut self,
        script: impl Fn(&str) -> Vec<Step> + Send + Sync + 'static,
    ) -> Self {
        self.script = Arc::new(script);
        self
    }

    pub(crate) fn rejecting(mut self, message: &str) -> Self {
        self.connect = ConnectBehavior::Reject(message.to_string());
        self
    }

    pub(crate) fn unreachable(mut self, message: &str) -> Self {
        self.connect = ConnectBehavior::Unreachable(message.to_string());
        self
    }

    pub(crate) fn hanging(mut self) -> Self {
        self.connect = ConnectBehavior::Hang;
        self
    }

    /// Addresses of every attempted connection, in order.
    pub(crate) fn targets(&self) -> Vec<String> {
        self.recorded.targets.lock().unwrap().clone()
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.recorded.commands.lock().unwrap().clone()
    }

    pub(crate) fn stdin(&self) -> Vec<u8> {
        self.recorded.stdin.lock().unwrap().clone()
    }

    pub(crate) fn closed_channels(&self) -> usize {
        self.recorded.closed_channels.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.recorded.disconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn link_disconnected(&self) -> bool {
        self.disconnects() > 0
    }

    /// Simulate the remote end dropping the connection.
    pub(crate) fn kill_link(&self) {
        self.recorded.link_closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ShellBackend for ScriptedBackend {
    async fn open(&self, target: &TargetConfig) -> Result<Arc<dyn ShellLink>, RelayError> {
        self.recorded
            .targets
            .lock()
            .unwrap()
            .push(target.display_address());

        match &self.connect {
            ConnectBehavior::Accept => {
                self.recorded.link_closed.store(false, Ordering::SeqCst);
                Ok(Arc::new(ScriptedLink {
                    script: self.script.clone(),
                    recorded: self.recorded.clone(),
                }))
            }
            ConnectBehavior::Reject(message) => {
                Err(RelayError::AuthenticationFailed(message.clone()))
            }
            ConnectBehavior::Unreachable(message) => Err(RelayError::Connection(message.clone())),
            ConnectBehavior::Hang => std::future::pending().await,
        }
    }
}

struct ScriptedLink {
    script: Script,
    recorded: Arc<Recorded>,
}

#[async_trait]
impl ShellLink for ScriptedLink {
    async fn exec(&self, command: &str) -> Result<Box<dyn ExecChannel>, RelayError> {
        if self.is_closed() {
            return Err(RelayError::channel("Failed to open channel: disconnected"));
        }
        self.recorded
            .commands
            .lock()
            .unwrap()
            .push(command.to_string());
        Ok(Box::new(ScriptedChannel {
            steps: (self.script)(command).into(),
            recorded: self.recorded.clone(),
        }))
    }

    fn is_closed(&self) -> bool {
        self.recorded.link_closed.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.recorded.disconnects.fetch_add(1, Ordering::SeqCst);
        self.recorded.link_closed.store(true, Ordering::SeqCst);
    }
}

struct ScriptedChannel {
    steps: VecDeque<Step>,
    recorded: Arc<Recorded>,
}

#[async_trait]
impl ExecChannel for ScriptedChannel {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.steps.pop_front()? {
                Step::Event(event) => return Some(event),
                Step::Sleep(duration) => tokio::time::sleep(duration).await,
                Step::Pending => std::future::pending::<()>().await,
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), RelayError> {
        self.recorded.stdin.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn send_eof(&mut self) -> Result<(), RelayError> {
        Ok(())
    }

    async fn close(&mut self) {
        self.recorded.closed_channels.fetch_add(1, Ordering::SeqCst);
    }
}
