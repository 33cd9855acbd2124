//! In-memory collaborators for driving a session without hardware.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    error::{Result, TrainerError},
    protocol::{Opcode, OutgoingCommand},
    session::{CommandTransport, WorkoutRepository},
    types::{CompletedSet, WorkoutParameters},
};

/// Transport that records every command and can be told to fail
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutgoingCommand>>,
    fail_on: Option<Opcode>,
    fail_all: AtomicBool,
}

impl RecordingTransport {
    /// Transport that accepts everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that rejects commands with `opcode`
    #[must_use]
    pub fn failing_on(opcode: Opcode) -> Self {
        Self {
            fail_on: Some(opcode),
            ..Self::default()
        }
    }

    /// Reject every command from now on, or stop rejecting
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Commands accepted so far, in order
    pub async fn sent(&self) -> Vec<OutgoingCommand> {
        self.sent.lock().await.clone()
    }

    /// Opcodes of the commands accepted so far
    pub async fn sent_opcodes(&self) -> Vec<Opcode> {
        self.sent.lock().await.iter().map(OutgoingCommand::opcode).collect()
    }

    /// Forget recorded commands
    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }
}

#[async_trait]
impl CommandTransport for RecordingTransport {
    async fn send(&self, command: &OutgoingCommand) -> Result<()> {
        let opcode = command.opcode();
        if self.fail_all.load(Ordering::SeqCst) || self.fail_on == Some(opcode) {
            return Err(TrainerError::Transport {
                opcode: opcode.to_string(),
                reason: "simulated write failure".to_string(),
            });
        }
        self.sent.lock().await.push(command.clone());
        Ok(())
    }
}

/// Repository keeping everything in memory
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    sets: Mutex<Vec<CompletedSet>>,
    last_parameters: Mutex<Option<WorkoutParameters>>,
    fail_saves: bool,
}

impl InMemoryRepository {
    /// Empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository whose saves always fail
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    /// Sets stored so far
    pub async fn completed_sets(&self) -> Vec<CompletedSet> {
        self.sets.lock().await.clone()
    }

    /// Last saved parameters
    pub async fn last_parameters(&self) -> Option<WorkoutParameters> {
        *self.last_parameters.lock().await
    }
}

#[async_trait]
impl WorkoutRepository for InMemoryRepository {
    async fn save_completed_set(&self, set: &CompletedSet) -> Result<()> {
        if self.fail_saves {
            return Err(TrainerError::Persistence("store unavailable".to_string()));
        }
        self.sets.lock().await.push(set.clone());
        Ok(())
    }

    async fn save_last_parameters(&self, params: &WorkoutParameters) -> Result<()> {
        if self.fail_saves {
            return Err(TrainerError::Persistence("store unavailable".to_string()));
        }
        *self.last_parameters.lock().await = Some(*params);
        Ok(())
    }

    async fn load_last_parameters(&self) -> Result<Option<WorkoutParameters>> {
        Ok(*self.last_parameters.lock().await)
    }
}
