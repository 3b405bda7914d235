pub mod parse;
pub mod runner;
pub mod store;

use serde::Serialize;

use crate::app::flash::parse::FlashEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashPhase {
    Idle,
    AwaitingInput,
    Progress,
    Completed,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct FlashProgress {
    pub percent: f64,
    pub rate: f64,
    pub eta_s: f64,
    pub elapsed_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlashingState {
    pub phase: FlashPhase,
    pub step: Option<u32>,
    pub step_total: Option<u32>,
    pub step_title: Option<String>,
    pub past_titles: Vec<String>,
    pub progress: FlashProgress,
    pub error_text: Option<String>,
    pub suggestion: Option<String>,
    pub resolution_steps: Vec<String>,
}

impl Default for FlashingState {
    fn default() -> Self {
        Self {
            phase: FlashPhase::Idle,
            step: None,
            step_total: None,
            step_title: None,
            past_titles: Vec::new(),
            progress: FlashProgress::default(),
            error_text: None,
            suggestion: None,
            resolution_steps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub state: FlashingState,
    pub changed: bool,
}

/// Drives `FlashingState` from flashing-tool events. `Completed` and
/// `Cancelled` are terminal for the attempt; an `Error` phase is recoverable
/// until the attempt is cancelled.
pub struct FlashStateMachine {
    state: FlashingState,
}

impl Default for FlashStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashStateMachine {
    pub fn new() -> Self {
        Self {
            state: FlashingState::default(),
        }
    }

    pub fn state(&self) -> FlashingState {
        self.state.clone()
    }

    pub fn is_flashing(&self) -> bool {
        self.state.phase == FlashPhase::Progress
    }

    /// Reset for a fresh attempt. Valid from any phase except an attempt
    /// already in progress.
    pub fn begin(&mut self) -> StateUpdate {
        self.state = FlashingState {
            phase: FlashPhase::Progress,
            ..FlashingState::default()
        };
        StateUpdate {
            state: self.state.clone(),
            changed: true,
        }
    }

    pub fn apply_event(&mut self, event: &FlashEvent) -> StateUpdate {
        let before = self.state.clone();
        match event {
            FlashEvent::Log { level, message } => {
                let level = level.to_uppercase();
                if level == "ERROR" || level == "FATAL" {
                    self.fail_inner(message, Some("Read the logs for the full error"));
                }
            }
            FlashEvent::Steps { total } => {
                self.state.step_total = Some(*total);
            }
            FlashEvent::FindingDevice => self.set_title("Finding device"),
            FlashEvent::DeviceMode => self.set_title("Checking device mode"),
            FlashEvent::Connecting => self.set_title("Connecting"),
            FlashEvent::Connected => self.set_title("Connected"),
            FlashEvent::Bl2Boot => self.set_title("Booting BL2"),
            FlashEvent::Resetting => self.set_title("Resetting"),
            FlashEvent::StepChanged { step, title } => {
                self.state.step = Some(*step);
                self.state.step_title = Some(title.clone());
                self.state.past_titles.push(title.clone());
                self.state.phase = FlashPhase::Progress;
                self.state.error_text = None;
                self.state.suggestion = None;
                self.state.resolution_steps.clear();
            }
            FlashEvent::FlashInfo {
                percent,
                rate,
                elapsed_ms,
                eta_ms,
            } => {
                self.state.progress = FlashProgress {
                    percent: *percent,
                    rate: *rate,
                    eta_s: *eta_ms as f64 / 1000.0,
                    elapsed_s: *elapsed_ms as f64 / 1000.0,
                };
                self.state.phase = FlashPhase::Progress;
                self.state.error_text = None;
                self.state.suggestion = None;
                self.state.resolution_steps.clear();
            }
            FlashEvent::Complete => {}
        }
        StateUpdate {
            state: self.state.clone(),
            changed: self.state != before,
        }
    }

    pub fn fail(&mut self, error_text: &str, suggestion: Option<&str>) -> StateUpdate {
        self.fail_inner(error_text, suggestion);
        StateUpdate {
            state: self.state.clone(),
            changed: true,
        }
    }

    fn fail_inner(&mut self, error_text: &str, suggestion: Option<&str>) {
        self.state.phase = FlashPhase::Error;
        self.state.error_text = Some(error_text.to_string());
        self.state.suggestion = suggestion.map(|text| text.to_string());
        self.state.resolution_steps = resolution_steps_for(error_text);
    }

    /// Cancellation is terminal: the device must be replugged and the
    /// attempt restarted from scratch.
    pub fn cancel(&mut self) -> StateUpdate {
        let changed = self.state.phase != FlashPhase::Cancelled;
        self.state.phase = FlashPhase::Cancelled;
        StateUpdate {
            state: self.state.clone(),
            changed,
        }
    }

    pub fn finish(&mut self) -> StateUpdate {
        self.state.phase = FlashPhase::Completed;
        self.state.error_text = None;
        self.state.suggestion = None;
        self.state.resolution_steps.clear();
        StateUpdate {
            state: self.state.clone(),
            changed: true,
        }
    }

    pub fn steps_completed(&self) -> bool {
        match (self.state.step, self.state.step_total) {
            (Some(step), Some(total)) => step >= total,
            _ => false,
        }
    }

    /// Combined completed-steps plus current-step percentage, clamped.
    pub fn overall_percent(&self) -> Option<f64> {
        let step = self.state.step?;
        let total = self.state.step_total?;
        if total == 0 {
            return None;
        }
        let completed = (f64::from(step.saturating_sub(1)) / f64::from(total)) * 100.0;
        let current = self.state.progress.percent / f64::from(total);
        Some((completed + current).clamp(0.0, 100.0))
    }

    fn set_title(&mut self, title: &str) {
        self.state.step_title = Some(title.to_string());
    }
}

/// User-walkable recovery guidance for known failure shapes.
pub fn resolution_steps_for(error_text: &str) -> Vec<String> {
    let lower = error_text.to_lowercase();
    if lower.contains("no device") || lower.contains("device not found") {
        return vec![
            "Unplug the device, hold buttons 1 and 4, and plug it back in".to_string(),
            "Confirm the USB cable supports data transfer".to_string(),
            "Reinstall the USB driver, then try again".to_string(),
        ];
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return vec![
            "Replug the device and wait for it to enumerate".to_string(),
            "Try a different USB port, avoiding hubs".to_string(),
        ];
    }
    vec![
        "Unplug and replug the device, then retry".to_string(),
        "Check the logs for the full error output".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_changes_drive_progress_and_history() {
        let mut machine = FlashStateMachine::new();
        machine.begin();
        machine.apply_event(&FlashEvent::Steps { total: 3 });
        machine.apply_event(&FlashEvent::StepChanged {
            step: 1,
            title: "bootloader".to_string(),
        });
        let update = machine.apply_event(&FlashEvent::StepChanged {
            step: 2,
            title: "rootfs".to_string(),
        });

        assert!(update.changed);
        assert_eq!(update.state.phase, FlashPhase::Progress);
        assert_eq!(update.state.step, Some(2));
        assert_eq!(
            update.state.past_titles,
            vec!["bootloader".to_string(), "rootfs".to_string()]
        );
    }

    #[test]
    fn error_logs_are_recoverable_with_guidance() {
        let mut machine = FlashStateMachine::new();
        machine.begin();
        let update = machine.apply_event(&FlashEvent::Log {
            level: "ERROR".to_string(),
            message: "no device found".to_string(),
        });

        assert_eq!(update.state.phase, FlashPhase::Error);
        assert_eq!(update.state.error_text.as_deref(), Some("no device found"));
        assert!(!update.state.resolution_steps.is_empty());

        // Retry resets the attempt back into progress.
        let retried = machine.begin();
        assert_eq!(retried.state.phase, FlashPhase::Progress);
        assert!(retried.state.error_text.is_none());
    }

    #[test]
    fn progress_events_clear_a_prior_error() {
        let mut machine = FlashStateMachine::new();
        machine.begin();
        machine.apply_event(&FlashEvent::Log {
            level: "ERROR".to_string(),
            message: "hiccup".to_string(),
        });
        let update = machine.apply_event(&FlashEvent::FlashInfo {
            percent: 10.0,
            rate: 1.0,
            elapsed_ms: 1000,
            eta_ms: 9000,
        });
        assert_eq!(update.state.phase, FlashPhase::Progress);
        assert!(update.state.error_text.is_none());
    }

    #[test]
    fn cancel_is_terminal() {
        let mut machine = FlashStateMachine::new();
        machine.begin();
        let update = machine.cancel();
        assert_eq!(update.state.phase, FlashPhase::Cancelled);
        assert!(!machine.is_flashing());
    }

    #[test]
    fn overall_percent_combines_steps_and_current_progress() {
        let mut machine = FlashStateMachine::new();
        machine.begin();
        machine.apply_event(&FlashEvent::Steps { total: 4 });
        machine.apply_event(&FlashEvent::StepChanged {
            step: 2,
            title: "system-a".to_string(),
        });
        machine.apply_event(&FlashEvent::FlashInfo {
            percent: 50.0,
            rate: 4.0,
            elapsed_ms: 5000,
            eta_ms: 5000,
        });

        let percent = machine.overall_percent().expect("percent");
        assert!((percent - 37.5).abs() < 0.001, "got {percent}");
    }

    #[test]
    fn steps_completed_requires_reaching_the_total() {
        let mut machine = FlashStateMachine::new();
        machine.begin();
        machine.apply_event(&FlashEvent::Steps { total: 2 });
        machine.apply_event(&FlashEvent::StepChanged {
            step: 1,
            title: "a".to_string(),
        });
        assert!(!machine.steps_completed());
        machine.apply_event(&FlashEvent::StepChanged {
            step: 2,
            title: "b".to_string(),
        });
        assert!(machine.steps_completed());
    }

    #[test]
    fn info_logs_do_not_change_state() {
        let mut machine = FlashStateMachine::new();
        machine.begin();
        let update = machine.apply_event(&FlashEvent::Log {
            level: "INFO".to_string(),
            message: "probing".to_string(),
        });
        assert!(!update.changed);
        assert_eq!(update.state.phase, FlashPhase::Progress);
    }
}
