//! Wire message model.
//!
//! A message is one verb line followed by `Header: value` pairs and a
//! blank line. The closed verb set covers client requests (GET, POST,
//! OPTIONS, REGISTER, SUBSCRIBE, ORDER, SETTLE) and the three response
//! statuses (OK, INVALID, ERROR). The `Type` header selects the sub-kind,
//! `Tag` carries the current day index for staleness detection, `Id`
//! correlates requests with responses, `Value` carries the payload and
//! `Time` carries `day,round,tick`.

use crate::error::{WireError, WireResult};
use auctd_core::GameTime;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The closed verb set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Query market information.
    Get,
    /// Server- or operator-initiated notification payload.
    Post,
    /// Fee schedule submission (operators).
    Options,
    /// Identification / reconnection.
    Register,
    /// Opt into market event notifications.
    Subscribe,
    /// Submit an ask or bid.
    Order,
    /// Strike a settlement between an ask and a bid (operators).
    Settle,
    /// Positive response.
    Ok,
    /// Rejected but well-formed.
    Invalid,
    /// Malformed or unexpected.
    Error,
}

impl Verb {
    /// Whether this verb is a response status rather than a request.
    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Ok | Self::Invalid | Self::Error)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Options => "OPTIONS",
            Self::Register => "REGISTER",
            Self::Subscribe => "SUBSCRIBE",
            Self::Order => "ORDER",
            Self::Settle => "SETTLE",
            Self::Ok => "OK",
            Self::Invalid => "INVALID",
            Self::Error => "ERROR",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Verb {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "OPTIONS" => Ok(Self::Options),
            "REGISTER" => Ok(Self::Register),
            "SUBSCRIBE" => Ok(Self::Subscribe),
            "ORDER" => Ok(Self::Order),
            "SETTLE" => Ok(Self::Settle),
            "OK" => Ok(Self::Ok),
            "INVALID" => Ok(Self::Invalid),
            "ERROR" => Ok(Self::Error),
            other => Err(WireError::UnknownVerb(other.to_string())),
        }
    }
}

/// Response classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Invalid,
    Error,
}

impl Status {
    #[must_use]
    pub fn verb(&self) -> Verb {
        match self {
            Self::Ok => Verb::Ok,
            Self::Invalid => Verb::Invalid,
            Self::Error => Verb::Error,
        }
    }
}

/// The `Time` header payload: `day,round,tick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeStamp {
    pub day: u32,
    pub round: u32,
    pub tick_ms: u64,
}

impl From<GameTime> for TimeStamp {
    fn from(t: GameTime) -> Self {
        Self {
            day: t.day,
            round: t.round,
            tick_ms: t.tick_ms,
        }
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.day, self.round, self.tick_ms)
    }
}

impl FromStr for TimeStamp {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',').map(str::trim);
        let bad = || WireError::MalformedTime(s.to_string());
        let day = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let round = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let tick_ms = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(Self {
            day,
            round,
            tick_ms,
        })
    }
}

/// One wire message.
///
/// Unknown headers survive a decode/encode round trip but carry no
/// protocol meaning.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub verb: Verb,
    /// `Type` header: sub-kind within the verb (e.g. `ask` for ORDER).
    pub msg_type: Option<String>,
    /// `Tag` header: the sender's view of the current day index.
    pub tag: Option<String>,
    /// `Id` header: correlation id.
    pub id: Option<String>,
    /// `Value` header: payload.
    pub value: Option<String>,
    /// `Time` header.
    pub time: Option<TimeStamp>,
    /// Headers outside the known set, preserved verbatim.
    pub extra: BTreeMap<String, String>,
}

impl Message {
    #[must_use]
    pub fn new(verb: Verb) -> Self {
        Self {
            verb,
            msg_type: None,
            tag: None,
            id: None,
            value: None,
            time: None,
            extra: BTreeMap::new(),
        }
    }

    /// Build a response to `request`, echoing its correlation id and tag.
    #[must_use]
    pub fn response(status: Status, request: &Message) -> Self {
        let mut msg = Self::new(status.verb());
        msg.id = request.id.clone();
        msg.tag = request.tag.clone();
        msg
    }

    #[must_use]
    pub fn with_type(mut self, t: impl Into<String>) -> Self {
        self.msg_type = Some(t.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_time(mut self, time: TimeStamp) -> Self {
        self.time = Some(time);
        self
    }

    /// The `Id` header parsed as a numeric correlation id, if present.
    #[must_use]
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_deref().and_then(|s| s.parse().ok())
    }

    /// Response status of this message, if it is a response.
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        match self.verb {
            Verb::Ok => Some(Status::Ok),
            Verb::Invalid => Some(Status::Invalid),
            Verb::Error => Some(Status::Error),
            _ => None,
        }
    }

    /// Parse one decoded frame (without the trailing blank line).
    pub fn parse(frame: &str) -> WireResult<Self> {
        let mut lines = frame.lines();
        let verb_line = lines.next().ok_or(WireError::EmptyFrame)?.trim();
        if verb_line.is_empty() {
            return Err(WireError::EmptyFrame);
        }
        let verb: Verb = verb_line.parse()?;
        let mut msg = Self::new(verb);

        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| WireError::MalformedHeader(line.to_string()))?;
            let name = name.trim();
            let value = value.trim();
            match name {
                "Type" => msg.msg_type = Some(value.to_string()),
                "Tag" => msg.tag = Some(value.to_string()),
                "Id" => msg.id = Some(value.to_string()),
                "Value" => msg.value = Some(value.to_string()),
                "Time" => msg.time = Some(value.parse()?),
                _ => {
                    msg.extra.insert(name.to_string(), value.to_string());
                }
            }
        }

        Ok(msg)
    }

    /// Encode to the wire form, including the terminating blank line.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(64);
        out.push_str(&self.verb.to_string());
        out.push('\n');
        if let Some(t) = &self.msg_type {
            out.push_str("Type: ");
            out.push_str(t);
            out.push('\n');
        }
        if let Some(tag) = &self.tag {
            out.push_str("Tag: ");
            out.push_str(tag);
            out.push('\n');
        }
        if let Some(id) = &self.id {
            out.push_str("Id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(value) = &self.value {
            out.push_str("Value: ");
            out.push_str(value);
            out.push('\n');
        }
        if let Some(time) = &self.time {
            out.push_str("Time: ");
            out.push_str(&time.to_string());
            out.push('\n');
        }
        for (name, value) in &self.extra {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}
