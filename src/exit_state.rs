#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitLifecycleState {
    #[default]
    Running,
    QuitRequested,
    TeardownInProgress,
    Finished,
}

/// Tracks the launcher's progress toward exit so the teardown sweep runs once.
#[derive(Debug, Default)]
pub struct ExitStateMachine {
    state: ExitLifecycleState,
}

impl ExitStateMachine {
    pub fn state(&self) -> ExitLifecycleState {
        self.state
    }

    pub fn is_quitting(&self) -> bool {
        self.state != ExitLifecycleState::Running
    }

    /// Returns `true` only for the request that left `Running`.
    pub fn mark_quit_requested(&mut self) -> bool {
        if self.state == ExitLifecycleState::Running {
            self.state = ExitLifecycleState::QuitRequested;
            return true;
        }
        false
    }

    pub fn try_begin_teardown(&mut self) -> bool {
        if matches!(
            self.state,
            ExitLifecycleState::Running | ExitLifecycleState::QuitRequested
        ) {
            self.state = ExitLifecycleState::TeardownInProgress;
            return true;
        }
        false
    }

    pub fn finish_teardown(&mut self) {
        self.state = ExitLifecycleState::Finished;
    }

    pub fn is_finished(&self) -> bool {
        self.state == ExitLifecycleState::Finished
    }
}
