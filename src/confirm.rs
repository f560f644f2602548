use crate::types::RiskClass;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    terminal,
};
use std::io::{IsTerminal, Write};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Decline,
}

/// Asks the initiating operator to acknowledge a risky command. Anything
/// short of an explicit yes is a no.
pub trait Confirmer {
    fn acknowledge(&self, command: &str) -> bool;
}

/// Safe commands pass straight through; risky ones block on the confirmer.
pub fn await_decision(risk: RiskClass, command: &str, confirmer: &dyn Confirmer) -> Decision {
    match risk {
        RiskClass::Safe => Decision::Proceed,
        RiskClass::Risky => {
            if confirmer.acknowledge(command) {
                Decision::Proceed
            } else {
                Decision::Decline
            }
        }
    }
}

/// Reads a single key press from the controlling terminal.
pub struct TerminalConfirmer;

impl Confirmer for TerminalConfirmer {
    fn acknowledge(&self, command: &str) -> bool {
        if !std::io::stdin().is_terminal() {
            eprintln!("risky command needs confirmation but stdin is not a terminal; declined");
            return false;
        }

        eprintln!();
        eprintln!("  {}", command);
        eprintln!();
        eprintln!("  warning: this command may be destructive");
        eprint!("run it? [y]es [n]o ");
        std::io::stderr().flush().ok();

        if terminal::enable_raw_mode().is_err() {
            return false;
        }
        let answer = loop {
            match event::poll(Duration::from_millis(100)) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(_) => break false,
            }
            match event::read() {
                Ok(Event::Key(k)) if k.kind != KeyEventKind::Release => match k.code {
                    KeyCode::Char('y') | KeyCode::Char('Y') => break true,
                    KeyCode::Char('c') if k.modifiers.contains(KeyModifiers::CONTROL) => {
                        break false
                    }
                    KeyCode::Char(_) | KeyCode::Enter | KeyCode::Esc => break false,
                    _ => {}
                },
                Ok(_) => {}
                Err(_) => break false,
            }
        };
        terminal::disable_raw_mode().ok();
        eprintln!("{}", if answer { "yes" } else { "no" });
        answer
    }
}

/// For unattended runs: every risky command is declined.
pub struct DeclineAll;

impl Confirmer for DeclineAll {
    fn acknowledge(&self, _command: &str) -> bool {
        false
    }
}
