use std::sync::Arc;
use std::time::Duration;

use http::header::HeaderName;

use super::http_client::HttpResponse;
use crate::cli::config::CheckConfig;
use crate::error::ConfigError;
use crate::utils::parse_duration_str;

#[derive(Debug, Clone, PartialEq)]
pub enum CheckRule {
    Status(u16),
    StatusIn(Vec<u16>),
    StatusRange(u16, u16),
    BodyContains(String),
    HeaderPresent(HeaderName),
    MaxDuration(Duration),
}

/// A named assertion run against every response. A failing check is a soft
/// failure: it is recorded on the sample and never stops the VU.
#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    pub name: Arc<str>,
    pub rule: CheckRule,
}

impl Check {
    pub fn from_config(config: &CheckConfig) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidCheck {
            name: config.name.clone(),
            reason: reason.to_string(),
        };
        if config.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }

        let mut rules = Vec::new();
        if let Some(code) = config.status {
            rules.push(CheckRule::Status(code));
        }
        if let Some(codes) = &config.status_in {
            if codes.is_empty() {
                return Err(invalid("status_in must list at least one status code"));
            }
            rules.push(CheckRule::StatusIn(codes.clone()));
        }
        if let Some([lo, hi]) = config.status_range {
            if lo > hi {
                return Err(invalid("status_range lower bound exceeds upper bound"));
            }
            rules.push(CheckRule::StatusRange(lo, hi));
        }
        if let Some(text) = &config.body_contains {
            rules.push(CheckRule::BodyContains(text.clone()));
        }
        if let Some(header) = &config.header_present {
            let name = HeaderName::from_bytes(header.as_bytes())
                .map_err(|_| invalid("header_present is not a valid header name"))?;
            rules.push(CheckRule::HeaderPresent(name));
        }
        if let Some(max) = &config.max_duration {
            let max = parse_duration_str(max)
                .ok_or_else(|| invalid("max_duration is not a valid duration"))?;
            rules.push(CheckRule::MaxDuration(max));
        }

        if rules.len() != 1 {
            return Err(invalid("exactly one rule must be set"));
        }
        Ok(Self {
            name: Arc::from(config.name.as_str()),
            rule: rules.remove(0),
        })
    }

    pub fn evaluate(&self, response: &HttpResponse, duration: Duration) -> bool {
        match &self.rule {
            CheckRule::Status(code) => response.status == *code,
            CheckRule::StatusIn(codes) => codes.contains(&response.status),
            CheckRule::StatusRange(lo, hi) => (*lo..=*hi).contains(&response.status),
            CheckRule::BodyContains(text) => {
                String::from_utf8_lossy(&response.body).contains(text.as_str())
            }
            CheckRule::HeaderPresent(name) => response.headers.contains_key(name),
            CheckRule::MaxDuration(max) => duration <= *max,
        }
    }
}
