// Copyright 2024 Neatx Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The agent-supervisor state machine (§4.5): classifies each line of the
//! display agent's stderr against a trigger table, updates the session
//! record, and decides when a hangup or terminate signal needs to go out.
//!
//! The supervisor never performs process IO itself — it returns a list of
//! [`Action`]s for the daemon's event loop to carry out, which keeps the
//! whole state machine testable against captured log lines without a real
//! child process.

use lazy_static::lazy_static;
use regex::Regex;

use crate::store::{Session, SessionState};

lazy_static! {
    static ref STARTING: Regex = Regex::new(r"^Session: Starting session at").unwrap();
    static ref WAITING: Regex =
        Regex::new(r"^Info: Waiting for connection from '[^']*' on port '(\d+)'\.").unwrap();
    static ref RUNNING: Regex = Regex::new(r"^Session: Session (started|resumed) at").unwrap();
    static ref SUSPENDING: Regex = Regex::new(r"^Session: Suspending session at").unwrap();
    static ref SUSPENDED: Regex = Regex::new(r"^Session: Session suspended at").unwrap();
    static ref TERMINATING: Regex = Regex::new(r"^Session: (Terminating|Aborting) session at").unwrap();
    static ref TERMINATED: Regex = Regex::new(r"^Session: Session (terminated|aborted) at").unwrap();
    static ref AGENT_PID: Regex = Regex::new(r"^Info: Agent running with pid (\d+)").unwrap();
    static ref WATCHDOG_PID: Regex = Regex::new(r"^Info: Waiting for watchdog with pid (\d+)").unwrap();
    static ref GEOMETRY: Regex = Regex::new(r"^Info: Change geometry to (\S+)").unwrap();
    static ref ERROR_LINE: Regex = Regex::new(r"^Error:").unwrap();
    static ref WARNING_LINE: Regex = Regex::new(r"^Warning:").unwrap();
}

/// Side effects the daemon's event loop must perform in response to a
/// supervisor transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Persist the session record (called after every transition).
    PersistRecord,
    /// The first transition out of `created`: kick off the resource-database
    /// and user-application steps.
    DisplayReady,
    /// Send SIGHUP to the agent process.
    SendHangupToAgent,
    /// Send a terminate signal to the agent process.
    SendTerminateToAgent,
    /// Send a terminate signal to the watchdog process.
    SendTerminateToWatchdog(i32),
}

pub struct AgentSupervisor {
    pub session: Session,
    pub agent_pid: Option<i32>,
    pub watchdog_pid: Option<i32>,
    terminating: bool,
    pending_second_hangup: bool,
    pending_resume_on_suspended: bool,
}

impl AgentSupervisor {
    pub fn new(session: Session) -> Self {
        AgentSupervisor {
            session,
            agent_pid: None,
            watchdog_pid: None,
            terminating: false,
            pending_second_hangup: false,
            pending_resume_on_suspended: false,
        }
    }

    /// Classifies one line of agent stderr, updates the session record,
    /// and returns the actions the caller must carry out. `Error:` and
    /// `Warning:` lines produce no actions — the caller is expected to log
    /// them directly at their line's severity.
    pub fn handle_line(&mut self, line: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        let was_created = self.session.state == SessionState::Created;

        if let Some(caps) = WAITING.captures(line) {
            self.session.set_state(SessionState::Waiting);
            if let Ok(port) = caps[1].parse() {
                self.session.port = Some(port);
            }
            actions.push(Action::PersistRecord);
        } else if STARTING.is_match(line) {
            self.session.set_state(SessionState::Starting);
            actions.push(Action::PersistRecord);
        } else if RUNNING.is_match(line) {
            self.session.set_state(SessionState::Running);
            actions.push(Action::PersistRecord);
        } else if SUSPENDING.is_match(line) {
            self.session.set_state(SessionState::Suspending);
            actions.push(Action::PersistRecord);
        } else if SUSPENDED.is_match(line) {
            self.session.set_state(SessionState::Suspended);
            actions.push(Action::PersistRecord);
            if self.pending_second_hangup || self.pending_resume_on_suspended {
                self.pending_second_hangup = false;
                self.pending_resume_on_suspended = false;
                actions.push(Action::SendHangupToAgent);
            }
        } else if TERMINATING.is_match(line) {
            self.session.set_state(SessionState::Terminating);
            actions.push(Action::PersistRecord);
        } else if TERMINATED.is_match(line) {
            self.session.set_state(SessionState::Terminated);
            actions.push(Action::PersistRecord);
        } else if let Some(caps) = AGENT_PID.captures(line) {
            if let Ok(pid) = caps[1].parse() {
                self.agent_pid = Some(pid);
            }
        } else if let Some(caps) = WATCHDOG_PID.captures(line) {
            if let Ok(pid) = caps[1].parse::<i32>() {
                self.watchdog_pid = Some(pid);
                if self.terminating {
                    actions.push(Action::SendTerminateToWatchdog(pid));
                }
            }
        } else if let Some(caps) = GEOMETRY.captures(line) {
            self.session.geometry = caps[1].to_string();
            actions.push(Action::PersistRecord);
        } else if ERROR_LINE.is_match(line) || WARNING_LINE.is_match(line) {
            // Logged by the caller at the matching severity; no state change.
        }

        if was_created && self.session.state != SessionState::Created {
            actions.push(Action::DisplayReady);
        }

        actions
    }

    /// Implements the suspend/resume decision table (§4.5): the supervisor
    /// only ever sends a hangup from `running`, `suspending`, or
    /// `suspended`.
    pub fn restore(&mut self) -> Vec<Action> {
        match self.session.state {
            SessionState::Running => {
                self.pending_second_hangup = true;
                vec![Action::SendHangupToAgent]
            }
            SessionState::Suspending => {
                self.pending_resume_on_suspended = true;
                Vec::new()
            }
            SessionState::Suspended => {
                vec![Action::SendHangupToAgent]
            }
            _ => Vec::new(),
        }
    }

    /// Begins termination: marks the supervisor so a later "waiting for
    /// watchdog" line also terminates the watchdog, and signals the agent.
    pub fn terminate(&mut self) -> Vec<Action> {
        self.terminating = true;
        vec![Action::SendTerminateToAgent]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::SessionType;

    fn session() -> Session {
        Session {
            id: "ID".to_string(),
            hostname: "host".to_string(),
            display: 42,
            port: None,
            username: "alice".to_string(),
            cookie: "cafe".to_string(),
            state: SessionState::Created,
            session_type: SessionType::Gnome,
            name: "desktop".to_string(),
            geometry: "1024x768".to_string(),
            screeninfo: "1024x768x24".to_string(),
            keyboard: "pc105/gb".to_string(),
            link: "isdn".to_string(),
            client: "unknown".to_string(),
            cache: 16,
            images: 64,
            fullscreen: false,
            rootless: false,
            virtualdesktop: true,
            resize: false,
            ssl: true,
            subscription: "GPL".to_string(),
            shadow_display: None,
            shadow_cookie: None,
            updated: String::new(),
        }
    }

    #[test]
    fn starting_line_transitions_and_signals_display_ready() {
        let mut sup = AgentSupervisor::new(session());
        let actions = sup.handle_line("Session: Starting session at 'Thu Jan 01 00:00:00 2026'.");
        assert_eq!(sup.session.state, SessionState::Starting);
        assert!(actions.contains(&Action::DisplayReady));
        assert!(actions.contains(&Action::PersistRecord));
    }

    #[test]
    fn second_non_created_line_does_not_repeat_display_ready() {
        let mut sup = AgentSupervisor::new(session());
        sup.handle_line("Session: Starting session at 'Thu Jan 01 00:00:00 2026'.");
        let actions = sup.handle_line("Info: Waiting for connection from 'nxhost' on port '5042'.");
        assert!(!actions.contains(&Action::DisplayReady));
        assert_eq!(sup.session.port, Some(5042));
        assert_eq!(sup.session.state, SessionState::Waiting);
    }

    #[test]
    fn agent_and_watchdog_pid_lines_are_captured() {
        let mut sup = AgentSupervisor::new(session());
        sup.handle_line("Info: Agent running with pid 1234");
        assert_eq!(sup.agent_pid, Some(1234));
        sup.handle_line("Info: Waiting for watchdog with pid 5678");
        assert_eq!(sup.watchdog_pid, Some(5678));
    }

    #[test]
    fn geometry_change_updates_record() {
        let mut sup = AgentSupervisor::new(session());
        let actions = sup.handle_line("Info: Change geometry to 1280x1024 now");
        assert_eq!(sup.session.geometry, "1280x1024");
        assert!(actions.contains(&Action::PersistRecord));
    }

    #[test]
    fn restore_from_running_sends_hangup_and_arms_second_hangup() {
        let mut sup = AgentSupervisor::new(session());
        sup.session.state = SessionState::Running;
        let actions = sup.restore();
        assert_eq!(actions, vec![Action::SendHangupToAgent]);

        let actions = sup.handle_line("Session: Session suspended at 'x'.");
        assert!(actions.contains(&Action::SendHangupToAgent));
    }

    #[test]
    fn restore_from_suspending_waits_for_suspended_transition() {
        let mut sup = AgentSupervisor::new(session());
        sup.session.state = SessionState::Suspending;
        assert!(sup.restore().is_empty());

        let actions = sup.handle_line("Session: Session suspended at 'x'.");
        assert!(actions.contains(&Action::SendHangupToAgent));
    }

    #[test]
    fn restore_from_suspended_sends_hangup_immediately() {
        let mut sup = AgentSupervisor::new(session());
        sup.session.state = SessionState::Suspended;
        assert_eq!(sup.restore(), vec![Action::SendHangupToAgent]);
    }

    #[test]
    fn restore_from_other_states_is_a_no_op() {
        let mut sup = AgentSupervisor::new(session());
        sup.session.state = SessionState::Waiting;
        assert!(sup.restore().is_empty());
    }

    #[test]
    fn terminate_then_watchdog_line_terminates_watchdog_too() {
        let mut sup = AgentSupervisor::new(session());
        let actions = sup.terminate();
        assert_eq!(actions, vec![Action::SendTerminateToAgent]);

        let actions = sup.handle_line("Info: Waiting for watchdog with pid 42");
        assert!(actions.contains(&Action::SendTerminateToWatchdog(42)));
    }

    #[test]
    fn watchdog_line_without_terminate_in_progress_does_not_signal() {
        let mut sup = AgentSupervisor::new(session());
        let actions = sup.handle_line("Info: Waiting for watchdog with pid 42");
        assert!(!actions.iter().any(|a| matches!(a, Action::SendTerminateToWatchdog(_))));
    }
}
