//! Installer Presentation
//!
//! The install flow runs on a worker thread and never touches the display.
//! It sends [`UiEvent`]s through a [`UiHandle`]; the thread that owns the
//! display drains them and applies each one to a [`Presenter`].

pub mod console;

use std::sync::mpsc;

/// Tone of a status message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// What the primary button currently does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Checking,
    VerifyPin,
    Install,
    Installing,
    Finish,
}

impl Action {
    pub fn label(self) -> &'static str {
        match self {
            Action::Checking => "Checking...",
            Action::VerifyPin => "Verify PIN",
            Action::Install => "Install Now",
            Action::Installing => "Installing...",
            Action::Finish => "Finish",
        }
    }
}

/// One display update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Status { text: String, severity: Severity },
    /// Percentage, 0-100
    Progress(u8),
    ShowPinInput(bool),
    PrimaryAction { action: Action, enabled: bool },
    /// Message the operator has to acknowledge
    Notice(String),
    /// The flow is over; no events follow
    Finished { success: bool },
}

/// Display surface of the installer
pub trait Presenter {
    fn set_status(&mut self, text: &str, severity: Severity);

    fn set_progress(&mut self, percent: u8);

    fn show_pin_input(&mut self, visible: bool);

    fn set_primary_action(&mut self, label: &str, enabled: bool);

    /// Show a message the operator has to acknowledge.
    ///
    /// Interactive presenters block until it is; silent ones only print it.
    fn prompt_blocking(&mut self, message: &str);
}

/// Apply one event to a presenter. `Finished` is left to the caller.
pub fn apply(presenter: &mut dyn Presenter, event: &UiEvent) {
    match event {
        UiEvent::Status { text, severity } => presenter.set_status(text, *severity),
        UiEvent::Progress(percent) => presenter.set_progress((*percent).min(100)),
        UiEvent::ShowPinInput(visible) => presenter.show_pin_input(*visible),
        UiEvent::PrimaryAction { action, enabled } => {
            presenter.set_primary_action(action.label(), *enabled)
        }
        UiEvent::Notice(message) => presenter.prompt_blocking(message),
        UiEvent::Finished { .. } => {}
    }
}

/// Sending side held by the worker.
///
/// Sends never fail: once the display is gone, updates are dropped.
#[derive(Debug, Clone)]
pub struct UiHandle {
    sender: mpsc::Sender<UiEvent>,
}

impl UiHandle {
    pub fn send(&self, event: UiEvent) {
        if self.sender.send(event).is_err() {
            tracing::debug!("Display closed; dropping update");
        }
    }

    pub fn status(&self, text: impl Into<String>, severity: Severity) {
        self.send(UiEvent::Status {
            text: text.into(),
            severity,
        });
    }

    pub fn progress(&self, percent: u8) {
        self.send(UiEvent::Progress(percent));
    }

    pub fn show_pin_input(&self, visible: bool) {
        self.send(UiEvent::ShowPinInput(visible));
    }

    pub fn primary_action(&self, action: Action, enabled: bool) {
        self.send(UiEvent::PrimaryAction { action, enabled });
    }

    pub fn notice(&self, message: impl Into<String>) {
        self.send(UiEvent::Notice(message.into()));
    }

    pub fn finished(&self, success: bool) {
        self.send(UiEvent::Finished { success });
    }
}

pub fn channel() -> (UiHandle, mpsc::Receiver<UiEvent>) {
    let (sender, receiver) = mpsc::channel();
    (UiHandle { sender }, receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingPresenter;

    #[test]
    fn test_events_reach_presenter_in_order() {
        let (ui, events) = channel();
        ui.status("Validating Device Security...", Severity::Info);
        ui.primary_action(Action::Checking, false);
        ui.progress(150);
        ui.show_pin_input(true);
        ui.notice("Invalid PIN. Ask IT Admin.");
        ui.finished(true);
        drop(ui);

        let mut recorder = RecordingPresenter::default();
        for event in events.iter() {
            apply(&mut recorder, &event);
        }

        assert_eq!(
            recorder.lines,
            vec![
                "status Info Validating Device Security...",
                "action Checking... false",
                "progress 100",
                "pin true",
                "notice Invalid PIN. Ask IT Admin.",
            ]
        );
    }

    #[test]
    fn test_send_after_display_closed_is_ignored() {
        let (ui, events) = channel();
        drop(events);
        ui.status("nobody is listening", Severity::Info);
        ui.finished(false);
    }

    #[test]
    fn test_action_labels() {
        assert_eq!(Action::VerifyPin.label(), "Verify PIN");
        assert_eq!(Action::Install.label(), "Install Now");
        assert_eq!(Action::Finish.label(), "Finish");
    }
}
