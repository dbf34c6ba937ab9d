//! Per-target configure errors and their presentation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use console::style;
use serde::{Deserialize, Serialize};

use crate::core::abbreviate_roots;
use crate::target::TargetIndex;

const SUB_MISSING: &str = "MissingInput";
const SUB_CONFIGURE: &str = "ConfigureError";

/// Everything that went wrong while configuring one target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureError {
    /// Declared inputs found in neither the source nor the build root.
    pub missing_inputs: BTreeSet<String>,
    /// Other human readable problems (conflicts, dangling dependencies).
    pub messages: Vec<String>,
}

impl ConfigureError {
    pub fn is_empty(&self) -> bool {
        self.missing_inputs.is_empty() && self.messages.is_empty()
    }

    pub fn add_missing(&mut self, path: impl Into<String>) {
        self.missing_inputs.insert(path.into());
    }

    pub fn add_message(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.messages.contains(&message) {
            self.messages.push(message);
        }
    }

    /// `(message, sub)` pairs, missing inputs first.
    pub fn colored_errors(&self) -> Vec<(String, &'static str)> {
        let missing = self
            .missing_inputs
            .iter()
            .map(|path| (format!("Missing input: {}", abbreviate_roots(path)), SUB_MISSING));

        let messages = self
            .messages
            .iter()
            .map(|message| (message.clone(), SUB_CONFIGURE));

        missing.chain(messages).collect()
    }

    /// Terminal-ready report for `target`.
    pub fn render(&self, target: &str) -> String {
        let mut out = format!("{}\n", style(target).bold().red());
        for (message, sub) in self.colored_errors() {
            out.push_str(&format!("  {} {}\n", style(format!("[[{sub}]]")).yellow(), message));
        }
        out
    }
}

/// Accumulates configure errors from concurrent resolver workers.
#[derive(Debug, Default)]
pub struct ErrorMap(Mutex<BTreeMap<String, ConfigureError>>);

impl ErrorMap {
    pub fn add_missing(&self, target: &str, path: impl Into<String>) {
        let mut map = self.0.lock().unwrap();
        map.entry(target.to_string()).or_default().add_missing(path);
    }

    pub fn add_message(&self, target: &str, message: impl Into<String>) {
        let mut map = self.0.lock().unwrap();
        map.entry(target.to_string()).or_default().add_message(message);
    }

    pub fn into_inner(self) -> BTreeMap<String, ConfigureError> {
        let mut map = self.0.into_inner().unwrap();
        map.retain(|_, error| !error.is_empty());
        map
    }
}

/// Typed report event, ready to be appended to the event queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_typename")]
pub enum BuildEvent {
    #[serde(rename = "JavaMissingDir")]
    MissingDir {
        #[serde(rename = "Dir")]
        dir: String,
    },
    #[serde(rename = "NEvent.TDisplayMessage")]
    DisplayMessage {
        #[serde(rename = "Where")]
        location: String,
        #[serde(rename = "Message")]
        message: String,
        #[serde(rename = "Sub")]
        sub: String,
        #[serde(rename = "Type")]
        kind: String,
        #[serde(rename = "Mod")]
        modifier: String,
    },
}

/// Turns a finished error map into report events.
///
/// Missing inputs are announced once each, then every error of every target
/// becomes a display message. A target producing a jar is reported under
/// `$B/<target>/<jar stem>` so the message points at the artifact.
pub fn report_events(errors: &BTreeMap<String, ConfigureError>, index: &TargetIndex) -> Vec<BuildEvent> {
    let dirs: BTreeSet<String> = errors
        .values()
        .flat_map(|error| error.missing_inputs.iter())
        .map(|path| abbreviate_roots(path))
        .collect();

    let mut events: Vec<_> = dirs.into_iter().map(|dir| BuildEvent::MissingDir { dir }).collect();

    for (path, error) in errors {
        let location = index
            .get(path)
            .and_then(|target| target.output_jar_name())
            .and_then(|jar| jar.strip_suffix(".jar"))
            .map(|stem| format!("$B/{path}/{stem}"))
            .unwrap_or_else(|| path.clone());

        for (message, sub) in error.colored_errors() {
            events.push(BuildEvent::DisplayMessage {
                location: location.clone(),
                message,
                sub: sub.to_string(),
                kind: "Error".to_string(),
                modifier: "bad".to_string(),
            });
        }
    }

    events
}
