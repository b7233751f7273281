//! Predicate trees attached to blocking rules.
//!
//! A rule's `conditions` is a tree of `all` / `any` / `not` nodes with
//! `match` leaves. Trees are deserialized as plain data, then compiled once
//! (regexes built, CIDRs parsed, numbers checked) so evaluation never parses
//! anything on the request path.

use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use blockgate_common::RequestRecord;
use ipnet::IpNet;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

const RULE_REGEX_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
    Match(Predicate),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: Field,
    pub op: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ConditionValue>,
}

/// Request attribute a predicate reads.
///
/// Written as a plain string in rule files; headers use `header:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Field {
    Method,
    Path,
    Query,
    Url,
    Header(String),
    Body,
    SourceIp,
    ApiKey,
    BodySize,
}

impl FromStr for Field {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix("header:") {
            let name = name.trim();
            if name.is_empty() {
                return Err("header field requires a name".into());
            }
            return Ok(Field::Header(name.to_string()));
        }
        match s {
            "method" => Ok(Field::Method),
            "path" => Ok(Field::Path),
            "query" => Ok(Field::Query),
            "url" => Ok(Field::Url),
            "body" => Ok(Field::Body),
            "source_ip" => Ok(Field::SourceIp),
            "api_key" => Ok(Field::ApiKey),
            "body_size" => Ok(Field::BodySize),
            other => Err(format!("unknown field '{}'", other)),
        }
    }
}

impl TryFrom<String> for Field {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Field> for String {
    fn from(field: Field) -> Self {
        field.to_string()
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Method => f.write_str("method"),
            Field::Path => f.write_str("path"),
            Field::Query => f.write_str("query"),
            Field::Url => f.write_str("url"),
            Field::Header(name) => write!(f, "header:{}", name),
            Field::Body => f.write_str("body"),
            Field::SourceIp => f.write_str("source_ip"),
            Field::ApiKey => f.write_str("api_key"),
            Field::BodySize => f.write_str("body_size"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    In,
    InCidr,
    Gt,
    Lt,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl ConditionValue {
    fn as_text(&self) -> Option<String> {
        match self {
            ConditionValue::Text(s) => Some(s.clone()),
            ConditionValue::Number(n) => Some(n.to_string()),
            ConditionValue::List(_) => None,
        }
    }

    fn as_list(&self) -> Vec<String> {
        match self {
            ConditionValue::List(items) => items.clone(),
            ConditionValue::Text(s) => vec![s.clone()],
            ConditionValue::Number(n) => vec![n.to_string()],
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            ConditionValue::Number(n) => Some(*n),
            ConditionValue::Text(s) => s.trim().parse().ok(),
            ConditionValue::List(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum CompiledCondition {
    All(Vec<CompiledCondition>),
    Any(Vec<CompiledCondition>),
    Not(Box<CompiledCondition>),
    Leaf(CompiledPredicate),
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledPredicate {
    field: Field,
    test: Test,
}

#[derive(Debug, Clone)]
enum Test {
    Equals(String),
    NotEquals(String),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    Matches(Regex),
    In(Vec<String>),
    InCidr(Vec<IpNet>),
    Gt(f64),
    Lt(f64),
    Exists,
}

impl Condition {
    pub(crate) fn compile(&self) -> Result<CompiledCondition, String> {
        match self {
            Condition::All { conditions } => Ok(CompiledCondition::All(
                conditions.iter().map(Condition::compile).collect::<Result<_, _>>()?,
            )),
            Condition::Any { conditions } => Ok(CompiledCondition::Any(
                conditions.iter().map(Condition::compile).collect::<Result<_, _>>()?,
            )),
            Condition::Not { condition } => {
                Ok(CompiledCondition::Not(Box::new(condition.compile()?)))
            }
            Condition::Match(predicate) => Ok(CompiledCondition::Leaf(predicate.compile()?)),
        }
    }
}

impl Predicate {
    fn compile(&self) -> Result<CompiledPredicate, String> {
        let text = || {
            self.value
                .as_ref()
                .and_then(ConditionValue::as_text)
                .ok_or_else(|| format!("operator {:?} on {} needs a scalar value", self.op, self.field))
        };
        let number = || {
            self.value
                .as_ref()
                .and_then(ConditionValue::as_number)
                .ok_or_else(|| format!("operator {:?} on {} needs a numeric value", self.op, self.field))
        };
        let list = || {
            self.value
                .as_ref()
                .map(ConditionValue::as_list)
                .ok_or_else(|| format!("operator {:?} on {} needs a value list", self.op, self.field))
        };

        let test = match self.op {
            Operator::Equals => Test::Equals(text()?),
            Operator::NotEquals => Test::NotEquals(text()?),
            Operator::Contains => Test::Contains(text()?),
            Operator::StartsWith => Test::StartsWith(text()?),
            Operator::EndsWith => Test::EndsWith(text()?),
            Operator::Matches => {
                let pattern = text()?;
                let regex = RegexBuilder::new(&pattern)
                    .size_limit(RULE_REGEX_SIZE_LIMIT)
                    .build()
                    .map_err(|e| format!("invalid regex '{}': {}", pattern, e))?;
                Test::Matches(regex)
            }
            Operator::In => Test::In(list()?),
            Operator::InCidr => {
                let nets = list()?
                    .iter()
                    .map(|s| parse_net(s))
                    .collect::<Result<Vec<_>, _>>()?;
                Test::InCidr(nets)
            }
            Operator::Gt => Test::Gt(number()?),
            Operator::Lt => Test::Lt(number()?),
            Operator::Exists => Test::Exists,
        };

        Ok(CompiledPredicate {
            field: self.field.clone(),
            test,
        })
    }
}

/// Accepts CIDR notation or a bare address (treated as a host route).
fn parse_net(s: &str) -> Result<IpNet, String> {
    let s = s.trim();
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net);
    }
    let addr = s
        .parse::<IpAddr>()
        .map_err(|_| format!("invalid CIDR or address '{}'", s))?;
    let host_prefix = if addr.is_ipv4() { 32 } else { 128 };
    IpNet::new(addr, host_prefix).map_err(|e| format!("invalid address '{}': {}", s, e))
}

/// Request view handed to compiled conditions.
pub(crate) struct EvalContext<'a> {
    pub request: &'a RequestRecord,
    pub ip: IpAddr,
}

impl EvalContext<'_> {
    fn field(&self, field: &Field) -> Option<Cow<'_, str>> {
        let req = self.request;
        match field {
            Field::Method => Some(Cow::Borrowed(req.method.as_str())),
            Field::Path => Some(Cow::Borrowed(req.path())),
            Field::Query => req.query().map(Cow::Borrowed),
            Field::Url => Some(Cow::Borrowed(req.url.as_str())),
            Field::Header(name) => req.header(name).map(Cow::Borrowed),
            Field::Body => req.body.as_deref().map(Cow::Borrowed),
            Field::SourceIp => Some(Cow::Owned(self.ip.to_string())),
            Field::ApiKey => req.api_key.as_deref().map(Cow::Borrowed),
            Field::BodySize => Some(Cow::Owned(
                req.body.as_ref().map_or(0, |b| b.len()).to_string(),
            )),
        }
    }
}

impl CompiledCondition {
    pub(crate) fn eval(&self, ctx: &EvalContext<'_>) -> bool {
        match self {
            CompiledCondition::All(items) => items.iter().all(|c| c.eval(ctx)),
            CompiledCondition::Any(items) => items.iter().any(|c| c.eval(ctx)),
            CompiledCondition::Not(inner) => !inner.eval(ctx),
            CompiledCondition::Leaf(predicate) => predicate.eval(ctx),
        }
    }
}

impl CompiledPredicate {
    fn eval(&self, ctx: &EvalContext<'_>) -> bool {
        // A missing field satisfies nothing, not even `not_equals`.
        let Some(value) = ctx.field(&self.field) else {
            return false;
        };
        let value = value.as_ref();

        match &self.test {
            Test::Equals(expected) => value == expected,
            Test::NotEquals(expected) => value != expected,
            Test::Contains(needle) => value.contains(needle.as_str()),
            Test::StartsWith(prefix) => value.starts_with(prefix.as_str()),
            Test::EndsWith(suffix) => value.ends_with(suffix.as_str()),
            Test::Matches(regex) => regex.is_match(value),
            Test::In(items) => items.iter().any(|item| item == value),
            Test::InCidr(nets) => {
                let addr = match self.field {
                    Field::SourceIp => Some(ctx.ip),
                    _ => value.trim().parse::<IpAddr>().ok(),
                };
                addr.is_some_and(|addr| nets.iter().any(|net| net.contains(&addr)))
            }
            Test::Gt(threshold) => value.trim().parse::<f64>().is_ok_and(|n| n > *threshold),
            Test::Lt(threshold) => value.trim().parse::<f64>().is_ok_and(|n| n < *threshold),
            Test::Exists => true,
        }
    }
}
