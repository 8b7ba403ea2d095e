//! Unleash toggle definitions and local evaluation.
//!
//! A [`FeatureSet`] is one synchronized snapshot: toggles by name plus the
//! segments their strategies reference. Strategies the proxy does not
//! recognise do not activate.

use std::collections::HashMap;
use std::io::Cursor;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Deserialize;
use uuid::Uuid;

use super::EvaluationContext;

/// Body of `GET /api/client/features`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeaturesResponse {
    #[serde(default)]
    pub features: Vec<Toggle>,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Toggle {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub strategies: Vec<Strategy>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

/// Parent toggle requirement of a child toggle.
#[derive(Debug, Clone, Deserialize)]
pub struct Dependency {
    pub feature: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct Segment {
    pub id: u32,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Strategy {
    pub name: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub segments: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub context_name: String,
    pub operator: Operator,
    #[serde(default)]
    pub values: Vec<String>,
    /// Operand of the numeric, date and semver operators.
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub inverted: bool,
    #[serde(default)]
    pub case_insensitive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    In,
    NotIn,
    StrContains,
    StrStartsWith,
    StrEndsWith,
    NumEq,
    NumGt,
    NumGte,
    NumLt,
    NumLte,
    DateAfter,
    DateBefore,
    SemverEq,
    SemverGt,
    SemverLt,
    #[serde(other)]
    Unsupported,
}

/// Strategy names advertised when registering with the upstream.
pub const SUPPORTED_STRATEGIES: &[&str] = &[
    "default",
    "userWithId",
    "remoteAddress",
    "applicationHostname",
    "flexibleRollout",
    "gradualRolloutUserId",
    "gradualRolloutSessionId",
    "gradualRolloutRandom",
];

/// Toggles and segments from one successful fetch.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    toggles: HashMap<String, Toggle>,
    segments: HashMap<u32, Vec<Constraint>>,
}

impl From<FeaturesResponse> for FeatureSet {
    fn from(response: FeaturesResponse) -> Self {
        Self {
            toggles: response
                .features
                .into_iter()
                .map(|toggle| (toggle.name.clone(), toggle))
                .collect(),
            segments: response
                .segments
                .into_iter()
                .map(|segment| (segment.id, segment.constraints))
                .collect(),
        }
    }
}

impl FeatureSet {
    pub fn toggle_count(&self) -> usize {
        self.toggles.len()
    }

    /// Unknown toggles evaluate to `false`.
    pub fn is_enabled(&self, feature: &str, context: &EvaluationContext) -> bool {
        self.toggles
            .get(feature)
            .is_some_and(|toggle| self.dependencies_met(toggle, context) && self.evaluate(toggle, context))
    }

    /// Parents must exist and may not themselves depend on other toggles.
    fn dependencies_met(&self, toggle: &Toggle, context: &EvaluationContext) -> bool {
        toggle.dependencies.iter().all(|dependency| {
            let Some(parent) = self.toggles.get(&dependency.feature) else {
                return false;
            };
            if !parent.dependencies.is_empty() {
                return false;
            }
            self.evaluate(parent, context) == dependency.enabled
        })
    }

    fn evaluate(&self, toggle: &Toggle, context: &EvaluationContext) -> bool {
        if !toggle.enabled {
            return false;
        }
        if toggle.strategies.is_empty() {
            return true;
        }
        toggle
            .strategies
            .iter()
            .any(|strategy| strategy.is_enabled(&toggle.name, context, &self.segments))
    }
}

impl Strategy {
    fn is_enabled(
        &self,
        toggle_name: &str,
        context: &EvaluationContext,
        segments: &HashMap<u32, Vec<Constraint>>,
    ) -> bool {
        let segments_hold = self.segments.iter().all(|id| {
            segments
                .get(id)
                .is_some_and(|constraints| constraints.iter().all(|c| c.is_satisfied(context)))
        });
        if !segments_hold || !self.constraints.iter().all(|c| c.is_satisfied(context)) {
            return false;
        }

        match self.name.as_str() {
            "default" => true,
            "userWithId" => context
                .field("userId")
                .is_some_and(|user| self.list("userIds").any(|id| id == user)),
            "remoteAddress" => context
                .field("remoteAddress")
                .is_some_and(|addr| self.list("IPs").any(|entry| address_matches(&entry, addr))),
            "applicationHostname" => std::env::var("HOSTNAME").is_ok_and(|host| {
                self.list("hostNames")
                    .any(|name| name.eq_ignore_ascii_case(&host))
            }),
            "flexibleRollout" => self.flexible_rollout(toggle_name, context),
            "gradualRolloutUserId" => self.gradual_rollout(toggle_name, context.field("userId")),
            "gradualRolloutSessionId" => {
                self.gradual_rollout(toggle_name, context.field("sessionId"))
            }
            "gradualRolloutRandom" => random_value() <= self.percentage("percentage"),
            _ => false,
        }
    }

    fn flexible_rollout(&self, toggle_name: &str, context: &EvaluationContext) -> bool {
        let percentage = self.percentage("rollout");
        if percentage == 0 {
            return false;
        }

        let group_id = self.group_id(toggle_name);
        let stickiness = self
            .parameter("stickiness")
            .unwrap_or_else(|| "default".to_string());

        let value = match stickiness.as_str() {
            "default" => match context.field("userId").or_else(|| context.field("sessionId")) {
                Some(id) => normalized_value(id, &group_id),
                None => random_value(),
            },
            "random" => random_value(),
            field => match context.field(field) {
                Some(id) => normalized_value(id, &group_id),
                None => return false,
            },
        };

        value <= percentage
    }

    fn gradual_rollout(&self, toggle_name: &str, id: Option<&str>) -> bool {
        let percentage = self.percentage("percentage");
        id.is_some_and(|id| {
            percentage > 0 && normalized_value(id, &self.group_id(toggle_name)) <= percentage
        })
    }

    fn group_id(&self, toggle_name: &str) -> String {
        self.parameter("groupId")
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| toggle_name.to_string())
    }

    fn parameter(&self, key: &str) -> Option<String> {
        match self.parameters.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Comma-separated parameter as trimmed, non-empty items.
    fn list(&self, key: &str) -> impl Iterator<Item = String> {
        self.parameter(key)
            .unwrap_or_default()
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn percentage(&self, key: &str) -> u32 {
        self.parameter(key)
            .and_then(|p| p.trim().parse::<f64>().ok())
            .map(|p| p.clamp(0.0, 100.0) as u32)
            .unwrap_or(0)
    }
}

/// `entry` is an exact address or a CIDR range.
fn address_matches(entry: &str, addr: &str) -> bool {
    if entry == addr {
        return true;
    }
    let Ok(ip) = addr.parse::<IpAddr>() else {
        return false;
    };
    match entry.parse::<IpNet>() {
        Ok(net) => net.contains(&ip),
        Err(_) => entry.parse::<IpAddr>().is_ok_and(|exact| exact == ip),
    }
}

impl Constraint {
    fn is_satisfied(&self, context: &EvaluationContext) -> bool {
        let value = context.field(&self.context_name);

        let matched = match self.operator {
            Operator::In => value.is_some_and(|v| self.values.iter().any(|c| c == v)),
            Operator::NotIn => value.map_or(true, |v| !self.values.iter().any(|c| c == v)),
            Operator::StrContains => self.match_str(value, |v, c| v.contains(c)),
            Operator::StrStartsWith => self.match_str(value, |v, c| v.starts_with(c)),
            Operator::StrEndsWith => self.match_str(value, |v, c| v.ends_with(c)),
            Operator::NumEq => self.compare_num(value, |v, c| v == c),
            Operator::NumGt => self.compare_num(value, |v, c| v > c),
            Operator::NumGte => self.compare_num(value, |v, c| v >= c),
            Operator::NumLt => self.compare_num(value, |v, c| v < c),
            Operator::NumLte => self.compare_num(value, |v, c| v <= c),
            Operator::DateAfter => self.compare_date(value, |v, c| v > c),
            Operator::DateBefore => self.compare_date(value, |v, c| v < c),
            Operator::SemverEq => self.compare_semver(value, |v, c| v == c),
            Operator::SemverGt => self.compare_semver(value, |v, c| v > c),
            Operator::SemverLt => self.compare_semver(value, |v, c| v < c),
            Operator::Unsupported => return false,
        };

        matched != self.inverted
    }

    fn match_str(&self, value: Option<&str>, op: impl Fn(&str, &str) -> bool) -> bool {
        let Some(value) = value else {
            return false;
        };
        if self.case_insensitive {
            let value = value.to_lowercase();
            self.values.iter().any(|c| op(&value, &c.to_lowercase()))
        } else {
            self.values.iter().any(|c| op(value, c))
        }
    }

    fn compare_num(&self, value: Option<&str>, op: impl Fn(f64, f64) -> bool) -> bool {
        let parse = |s: &str| s.trim().parse::<f64>().ok();
        match (value.and_then(parse), self.value.as_deref().and_then(parse)) {
            (Some(v), Some(c)) => op(v, c),
            _ => false,
        }
    }

    /// `currentTime` defaults to the evaluation instant.
    fn compare_date(
        &self,
        value: Option<&str>,
        op: impl Fn(DateTime<Utc>, DateTime<Utc>) -> bool,
    ) -> bool {
        let context_date = match value {
            Some(v) => parse_date(v),
            None if self.context_name == "currentTime" => Some(Utc::now()),
            None => None,
        };
        match (context_date, self.value.as_deref().and_then(parse_date)) {
            (Some(v), Some(c)) => op(v, c),
            _ => false,
        }
    }

    fn compare_semver(
        &self,
        value: Option<&str>,
        op: impl Fn(&semver::Version, &semver::Version) -> bool,
    ) -> bool {
        let parse = |s: &str| semver::Version::parse(s.trim()).ok();
        match (value.and_then(parse), self.value.as_deref().and_then(parse)) {
            (Some(v), Some(c)) => op(&v, &c),
            _ => false,
        }
    }
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

/// Stable 1..=100 bucket for `id` within `group_id`, compatible with Unleash SDKs.
pub fn normalized_value(id: &str, group_id: &str) -> u32 {
    let key = format!("{group_id}:{id}");
    // Reading from an in-memory cursor cannot fail
    let hash = murmur3::murmur3_32(&mut Cursor::new(key.as_bytes()), 0).unwrap_or_default();
    hash % 100 + 1
}

fn random_value() -> u32 {
    (Uuid::new_v4().as_u128() % 100) as u32 + 1
}
