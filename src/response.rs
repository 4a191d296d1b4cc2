//! Parser for the gateway's line-oriented `key:value` reply format.

use crate::error::Error;
use std::collections::HashMap;

/// Key holding the remaining balance in a `getcredit` reply.
pub const CREDIT_KEY: &str = "credit(0)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponseLine {
    pub fields: HashMap<String, String>,
    pub is_error: bool,
    lead: String,
}

impl GatewayResponseLine {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Short status token: the `STATUS` value when present, else the first key on the line.
    pub fn status_token(&self) -> &str {
        match self.get("STATUS") {
            Some(status) if !status.is_empty() => status,
            _ => self.lead.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub lines: Vec<GatewayResponseLine>,
    pub raw: String,
}

impl GatewayResponse {
    pub fn first(&self) -> Option<&GatewayResponseLine> {
        self.lines.first()
    }

    pub fn is_error(&self) -> bool {
        self.first().is_some_and(|line| line.is_error)
    }

    pub fn credit(&self) -> Result<&str, Error> {
        self.first()
            .and_then(|line| line.get(CREDIT_KEY))
            .ok_or_else(|| {
                Error::Protocol(format!("no {} in credit reply {:?}", CREDIT_KEY, self.raw))
            })
    }
}

pub fn parse(raw: &str) -> GatewayResponse {
    let lines = raw
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .map(parse_line)
        .collect();

    GatewayResponse {
        lines,
        raw: raw.to_string(),
    }
}

fn parse_line(line: &str) -> GatewayResponseLine {
    let mut fields = HashMap::new();
    let mut lead = None;

    for token in line.split(' ') {
        let (key, value) = token.split_once(':').unwrap_or((token, ""));
        let key = key.trim();
        if lead.is_none() && !key.is_empty() {
            lead = Some(key.to_string());
        }
        fields.insert(key.to_string(), value.trim().to_string());
    }

    GatewayResponseLine {
        fields,
        is_error: line.starts_with("ERROR"),
        lead: lead.unwrap_or_default(),
    }
}
