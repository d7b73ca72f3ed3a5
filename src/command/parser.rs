//! Natural-language command parsing.
//!
//! Two interchangeable parser implementations sit behind the [`Parser`]
//! capability, chosen once at startup:
//!
//! - [`MockParser`]: regex recognition of the supported command phrases.
//! - [`RemoteParser`]: calls an external parsing service and falls back to
//!   the mock parser when the service is unreachable.

use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use super::{Command, Intent};

/// Errors raised while parsing a command string.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The text matched no supported command phrase.
    #[error("unable to parse command: {0}")]
    Unrecognized(String),

    /// The text matched a phrase but carried an unusable value.
    #[error("invalid command value: {0}")]
    InvalidValue(String),

    /// The remote parser rejected the command.
    #[error("command rejected by parser: {0}")]
    Rejected(String),
}

/// Parser capability: mock or remote, selected at startup.
pub enum Parser {
    Mock(MockParser),
    Remote(RemoteParser),
}

impl Parser {
    pub async fn parse(&self, text: &str) -> Result<Command, ParseError> {
        match self {
            Parser::Mock(parser) => parser.parse(text),
            Parser::Remote(parser) => parser.parse(text).await,
        }
    }
}

/// Regex-driven parser for the supported command phrases.
pub struct MockParser {
    by_group: Regex,
    by_age: Regex,
    show_next: Regex,
    waiting: Regex,
    max_wait: Regex,
}

impl Default for MockParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MockParser {
    pub fn new() -> Self {
        // The patterns are fixed strings; compilation cannot fail.
        Self {
            by_group: Regex::new(r"change priority to (\d+) for all ads in the (.+) family")
                .expect("static regex"),
            by_age: Regex::new(r"set priority to (\d+) for ads older than (\d+) minutes?")
                .expect("static regex"),
            show_next: Regex::new(r"show the next (\d+) ads to be processed")
                .expect("static regex"),
            waiting: Regex::new(r"list all ads waiting longer than (\d+) minutes?")
                .expect("static regex"),
            max_wait: Regex::new(r"set maximum wait time to (\d+) seconds?")
                .expect("static regex"),
        }
    }

    /// Parses a natural-language command into a typed [`Command`].
    pub fn parse(&self, text: &str) -> Result<Command, ParseError> {
        let normalized = text.trim().to_lowercase();

        if let Some(captures) = self.by_group.captures(&normalized) {
            let priority = parse_priority(&captures[1])?;
            let group = captures[2].trim().to_string();
            return Ok(Command::new(
                text,
                Intent::ChangePriorityByGroup,
                parameters(&[("priority", json!(priority)), ("group", json!(group))]),
            ));
        }

        if let Some(captures) = self.by_age.captures(&normalized) {
            let priority = parse_priority(&captures[1])?;
            let minutes = parse_number(&captures[2], "minutes")?;
            return Ok(Command::new(
                text,
                Intent::ChangePriorityByAge,
                parameters(&[("priority", json!(priority)), ("minutes", json!(minutes))]),
            ));
        }

        if let Some(captures) = self.show_next.captures(&normalized) {
            let count = parse_number(&captures[1], "count")?;
            if count == 0 {
                return Err(ParseError::InvalidValue("count must be positive".to_string()));
            }
            return Ok(Command::new(
                text,
                Intent::ShowNext,
                parameters(&[("count", json!(count))]),
            ));
        }

        if normalized.contains("queue distribution by priority") {
            return Ok(Command::new(text, Intent::QueueDistribution, parameters(&[])));
        }

        if let Some(captures) = self.waiting.captures(&normalized) {
            let minutes = parse_number(&captures[1], "minutes")?;
            return Ok(Command::new(
                text,
                Intent::WaitingItems,
                parameters(&[("minutes", json!(minutes))]),
            ));
        }

        if normalized.contains("enable starvation mode") {
            return Ok(Command::new(
                text,
                Intent::EnableStarvationMode,
                parameters(&[]),
            ));
        }

        if let Some(captures) = self.max_wait.captures(&normalized) {
            let seconds = parse_number(&captures[1], "seconds")?;
            if seconds == 0 {
                return Err(ParseError::InvalidValue(
                    "seconds must be positive".to_string(),
                ));
            }
            return Ok(Command::new(
                text,
                Intent::SetMaxWait,
                parameters(&[("seconds", json!(seconds))]),
            ));
        }

        Err(ParseError::Unrecognized(text.to_string()))
    }
}

fn parameters(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn parse_priority(raw: &str) -> Result<u64, ParseError> {
    let value: u64 = raw
        .parse()
        .map_err(|_| ParseError::InvalidValue(format!("invalid priority '{raw}'")))?;
    if !(1..=5).contains(&value) {
        return Err(ParseError::InvalidValue(format!(
            "priority must be between 1 and 5, got {value}"
        )));
    }
    Ok(value)
}

fn parse_number(raw: &str, name: &str) -> Result<u64, ParseError> {
    raw.parse()
        .map_err(|_| ParseError::InvalidValue(format!("invalid {name} '{raw}'")))
}

/// Response contract of the external parsing service.
#[derive(Debug, Deserialize)]
struct RemoteParseResponse {
    intent: String,
    #[serde(default)]
    parameters: serde_json::Map<String, Value>,
    valid: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Parser backed by an external natural-language parsing service.
///
/// Any transport or decoding failure falls back to the mock parser so the
/// control surface keeps working while the service is down.
pub struct RemoteParser {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    fallback: MockParser,
}

impl RemoteParser {
    pub fn new(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            fallback: MockParser::new(),
        }
    }

    pub async fn parse(&self, text: &str) -> Result<Command, ParseError> {
        match self.parse_remote(text).await {
            Ok(command) => Ok(command),
            Err(ParseError::Rejected(reason)) => Err(ParseError::Rejected(reason)),
            Err(e) => {
                warn!(error = %e, "Remote parser unavailable, using mock parser");
                self.fallback.parse(text)
            }
        }
    }

    async fn parse_remote(&self, text: &str) -> Result<Command, ParseError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .bearer_auth(&self.api_key)
            .json(&json!({ "command": text }))
            .send()
            .await
            .map_err(|e| ParseError::Unrecognized(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ParseError::Unrecognized(format!(
                "parser returned status {}",
                response.status()
            )));
        }

        let parsed: RemoteParseResponse = response
            .json()
            .await
            .map_err(|e| ParseError::Unrecognized(format!("bad parser response: {e}")))?;

        if !parsed.valid {
            return Err(ParseError::Rejected(
                parsed.error.unwrap_or_else(|| "command not valid".to_string()),
            ));
        }

        let intent = Intent::parse(&parsed.intent)
            .map_err(|e| ParseError::Unrecognized(e.to_string()))?;

        Ok(Command::new(text, intent, parsed.parameters))
    }
}
