//! Terminal presenter
//!
//! Renders installer events with an indicatif progress bar and answers the
//! primary action with dialoguer prompts, or with preset answers when the
//! installer runs silently.

use super::{apply, Action, Presenter, Severity, UiEvent};
use crate::driver::UserAction;
use dialoguer::{Confirm, Input, Password};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::mpsc::Receiver;
use tokio::sync::mpsc::UnboundedSender;

/// How the primary action gets answered
#[derive(Debug, Clone)]
pub enum Interaction {
    /// Ask the operator
    Interactive { assume_yes: bool },
    /// No prompts; a preset PIN is submitted at most once
    Silent { pin: Option<String> },
}

impl Interaction {
    /// Decide what to do now that `action` is available
    fn respond(&mut self, action: Action) -> Option<UserAction> {
        match (self, action) {
            (Interaction::Silent { pin }, Action::VerifyPin) => Some(match pin.take() {
                Some(pin) => UserAction::SubmitPin(pin),
                None => {
                    eprintln!("This device requires an installation PIN. Re-run with --pin <PIN>.");
                    UserAction::Quit
                }
            }),
            (Interaction::Silent { .. }, Action::Install) => Some(UserAction::Install),
            (Interaction::Interactive { .. }, Action::VerifyPin) => Some(
                match Password::new().with_prompt("Installation PIN").interact() {
                    Ok(pin) => UserAction::SubmitPin(pin),
                    Err(e) => {
                        tracing::debug!("PIN prompt closed: {}", e);
                        UserAction::Quit
                    }
                },
            ),
            (Interaction::Interactive { assume_yes }, Action::Install) => {
                let confirmed = *assume_yes
                    || Confirm::new()
                        .with_prompt("Install the WatchSec agent now?")
                        .default(true)
                        .interact()
                        .unwrap_or(false);
                Some(if confirmed {
                    UserAction::Install
                } else {
                    UserAction::Quit
                })
            }
            _ => None,
        }
    }
}

pub struct ConsolePresenter {
    silent: bool,
    bar: Option<ProgressBar>,
}

impl ConsolePresenter {
    pub fn new(silent: bool) -> Self {
        Self {
            silent,
            bar: None,
        }
    }

    fn line(&self, text: &str) {
        match &self.bar {
            Some(bar) => bar.println(text),
            None => println!("{}", text),
        }
    }

    fn bar(&mut self) -> Option<&ProgressBar> {
        if self.silent {
            return None;
        }
        if self.bar.is_none() {
            let bar = ProgressBar::new(100);
            if let Ok(style) =
                ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            {
                bar.set_style(style.progress_chars("=>-"));
            }
            self.bar = Some(bar);
        }
        self.bar.as_ref()
    }

    pub fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

impl Presenter for ConsolePresenter {
    fn set_status(&mut self, text: &str, severity: Severity) {
        let prefix = match severity {
            Severity::Info => "•",
            Severity::Success => "✔",
            Severity::Warning => "⚠",
            Severity::Error => "✘",
        };
        for (index, line) in text.lines().enumerate() {
            if index == 0 {
                self.line(&format!("{} {}", prefix, line));
            } else {
                self.line(&format!("  {}", line));
            }
        }
    }

    fn set_progress(&mut self, percent: u8) {
        if let Some(bar) = self.bar() {
            bar.set_position(u64::from(percent));
        }
    }

    fn show_pin_input(&mut self, visible: bool) {
        tracing::debug!("PIN input {}", if visible { "shown" } else { "hidden" });
    }

    fn set_primary_action(&mut self, label: &str, enabled: bool) {
        if let Some(bar) = &self.bar {
            bar.set_message(label.to_string());
        }
        tracing::debug!("Primary action: {} (enabled: {})", label, enabled);
    }

    fn prompt_blocking(&mut self, message: &str) {
        let wait = !self.silent;
        match &self.bar {
            Some(bar) => bar.suspend(|| acknowledge(message, wait)),
            None => acknowledge(message, wait),
        }
    }
}

/// Print `message`; when `wait` is set, hold until the operator presses Enter
fn acknowledge(message: &str, wait: bool) {
    eprintln!("! {}", message);
    if !wait {
        return;
    }
    if let Err(e) = Input::<String>::new()
        .with_prompt("Press Enter to continue")
        .allow_empty(true)
        .report(false)
        .interact_text()
    {
        tracing::debug!("Acknowledgement prompt closed: {}", e);
    }
}

/// Drive the terminal until the install flow finishes.
///
/// Returns whether the install succeeded.
pub fn run(
    events: Receiver<UiEvent>,
    actions: UnboundedSender<UserAction>,
    interaction: Interaction,
) -> bool {
    let mut presenter = ConsolePresenter::new(matches!(interaction, Interaction::Silent { .. }));
    let mut interaction = interaction;
    let success = drive(&mut presenter, &events, &actions, |action| {
        interaction.respond(action)
    });
    presenter.finish();
    success
}

/// Event loop behind [`run`], independent of the terminal
pub(crate) fn drive(
    presenter: &mut dyn Presenter,
    events: &Receiver<UiEvent>,
    actions: &UnboundedSender<UserAction>,
    mut respond: impl FnMut(Action) -> Option<UserAction>,
) -> bool {
    for event in events.iter() {
        apply(presenter, &event);
        match event {
            UiEvent::Finished { success } => return success,
            UiEvent::PrimaryAction {
                action,
                enabled: true,
            } => {
                if let Some(reply) = respond(action) {
                    if actions.send(reply).is_err() {
                        tracing::debug!("Install flow no longer accepts actions");
                    }
                }
            }
            _ => {}
        }
    }

    presenter.set_status("Installer stopped unexpectedly.", Severity::Error);
    false
}
