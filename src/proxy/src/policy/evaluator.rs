//! The ordered rule pipeline. Everything here defaults to Block: a query
//! is relayed only when every stage explicitly passes, and any internal
//! failure (missing config, bad CIDR, unparseable time window) lands on
//! the deny side.

use crate::error::ProxyError;
use crate::policy::config::{PolicyConfig, ProcedureMode, TimeRestriction};
use crate::session::SessionContext;
use crate::sql::classifier::{ParsedQuery, QueryCommand};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use ipnet::Ipv4Net;
use regex::{Regex, RegexBuilder};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

const RESERVED_SCHEMAS: &[&str] = &["information_schema", "mysql", "performance_schema", "sys"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Allow,
    Block,
    Log,
}

#[derive(Debug, Clone)]
pub struct PolicyResult {
    pub action: PolicyAction,
    pub matched_rule: String,
    pub reason: String,
}

impl Default for PolicyResult {
    fn default() -> Self {
        PolicyResult {
            action: PolicyAction::Block,
            matched_rule: "default".to_string(),
            reason: "default deny".to_string(),
        }
    }
}

impl PolicyResult {
    pub fn block(matched_rule: &str, reason: impl Into<String>) -> Self {
        PolicyResult {
            action: PolicyAction::Block,
            matched_rule: matched_rule.to_string(),
            reason: reason.into(),
        }
    }

    pub fn allow(matched_rule: String, reason: impl Into<String>) -> Self {
        PolicyResult {
            action: PolicyAction::Allow,
            matched_rule,
            reason: reason.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        self.action == PolicyAction::Allow
    }

    pub fn is_block(&self) -> bool {
        self.action == PolicyAction::Block
    }
}

struct CompiledRule {
    user: String,
    cidrs: Vec<Ipv4Net>,
    restrict_source: bool,
    allowed_tables: Vec<String>,
    allowed_operations: Vec<String>,
    blocked_operations: Vec<String>,
    time_restriction: Option<TimeRestriction>,
}

impl CompiledRule {
    fn user_matches(&self, session_user: Option<&str>) -> bool {
        self.user == "*" || session_user == Some(self.user.as_str())
    }

    /// Empty CIDR list admits any source. A populated list admits only
    /// IPv4 clients inside one of its valid entries; malformed entries
    /// were dropped at compile time and so never match.
    fn source_matches(&self, client_ip: IpAddr) -> bool {
        if !self.restrict_source {
            return true;
        }
        match client_ip {
            IpAddr::V4(v4) => self.cidrs.iter().any(|net| net.contains(&v4)),
            IpAddr::V6(_) => false,
        }
    }
}

/// A policy with its regexes, CIDR blocks, and rule order baked in, shared
/// read-only between sessions through the evaluator's atomic handle.
pub struct CompiledPolicy {
    pub config: PolicyConfig,
    block_patterns: Vec<(String, Regex)>,
    rules: Vec<CompiledRule>,
}

impl CompiledPolicy {
    pub fn compile(config: PolicyConfig) -> Self {
        let block_patterns = config
            .sql_rules
            .block_patterns
            .iter()
            .filter_map(|src| {
                match RegexBuilder::new(src).case_insensitive(true).build() {
                    Ok(re) => Some((src.clone(), re)),
                    Err(e) => {
                        warn!(pattern = src.as_str(), "skipping invalid block pattern: {e}");
                        None
                    }
                }
            })
            .collect();
        let rules = config
            .access_control
            .iter()
            .map(|rule| {
                let cidrs = rule
                    .source_ip_cidr
                    .iter()
                    .filter_map(|cidr| match cidr.parse::<Ipv4Net>() {
                        Ok(net) => Some(net),
                        Err(e) => {
                            warn!(cidr = cidr.as_str(), "malformed cidr never matches: {e}");
                            None
                        }
                    })
                    .collect();
                CompiledRule {
                    user: rule.user.clone(),
                    cidrs,
                    restrict_source: !rule.source_ip_cidr.is_empty(),
                    allowed_tables: rule.allowed_tables.clone(),
                    allowed_operations: rule.allowed_operations.clone(),
                    blocked_operations: rule.blocked_operations.clone(),
                    time_restriction: rule.time_restriction.clone(),
                }
            })
            .collect();
        CompiledPolicy {
            config,
            block_patterns,
            rules,
        }
    }
}

fn parse_time_range(range: &str) -> Result<(NaiveTime, NaiveTime), ProxyError> {
    let (start, end) = range.split_once('-').ok_or_else(|| {
        ProxyError::InternalError(format!("time restriction {range:?} is not HH:MM-HH:MM"))
    })?;
    let parse = |s: &str| {
        NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|e| {
            ProxyError::InternalError(format!("time restriction {range:?} invalid: {e}"))
        })
    };
    Ok((parse(start)?, parse(end)?))
}

/// Whether `now` falls inside the allow window, evaluated in the rule's
/// IANA zone. Ranges may cross midnight (`22:00-06:00`).
fn time_allowed(tr: &TimeRestriction, now: DateTime<Utc>) -> Result<bool, ProxyError> {
    let tz: Tz = tr
        .timezone
        .parse()
        .map_err(|_| ProxyError::InternalError(format!("unknown timezone {:?}", tr.timezone)))?;
    let (start, end) = parse_time_range(&tr.allow_range)?;
    let local = now.with_timezone(&tz).time();
    Ok(if start <= end {
        local >= start && local <= end
    } else {
        local >= start || local <= end
    })
}

fn reserved_schema(table: &str) -> Option<&str> {
    let schema = table.split_once('.')?.0;
    RESERVED_SCHEMAS
        .iter()
        .find(|s| schema.eq_ignore_ascii_case(s))
        .copied()
}

/// Holds the active policy behind an atomic pointer. Readers pin a
/// snapshot per evaluation; a reload swaps the pointer with release
/// semantics and in-flight evaluations finish against the old value.
pub struct PolicyEvaluator {
    current: ArcSwapOption<CompiledPolicy>,
}

impl Default for PolicyEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEvaluator {
    /// Starts with no policy: everything blocks until one is installed.
    pub fn new() -> Self {
        PolicyEvaluator {
            current: ArcSwapOption::empty(),
        }
    }

    pub fn with_config(config: PolicyConfig) -> Self {
        let evaluator = Self::new();
        evaluator.install(Some(config));
        evaluator
    }

    /// Atomically replaces the active policy. `None` is permitted and
    /// moves every subsequent evaluation to fail-close.
    pub fn install(&self, config: Option<PolicyConfig>) {
        self.current
            .store(config.map(|c| Arc::new(CompiledPolicy::compile(c))));
    }

    /// Reload from a policy file; on failure the active policy is kept.
    pub fn reload_from_path(&self, path: &Path) -> Result<(), ProxyError> {
        let config = crate::policy::config::load_policy(path)?;
        self.install(Some(config));
        Ok(())
    }

    pub fn snapshot(&self) -> Option<Arc<CompiledPolicy>> {
        self.current.load_full()
    }

    pub fn evaluate(&self, query: &ParsedQuery, session: &SessionContext) -> PolicyResult {
        self.evaluate_at(query, session, Utc::now())
    }

    fn evaluate_at(
        &self,
        query: &ParsedQuery,
        session: &SessionContext,
        now: DateTime<Utc>,
    ) -> PolicyResult {
        let policy = match self.current.load_full() {
            Some(policy) => policy,
            None => return PolicyResult::block("no-config", "no policy configuration loaded"),
        };

        if query.command == QueryCommand::Unknown {
            return PolicyResult::block(
                "unknown-command",
                "statement keyword is not recognized",
            );
        }

        if policy
            .config
            .sql_rules
            .block_statements
            .iter()
            .any(|s| query.command.matches_name(s))
        {
            return PolicyResult::block(
                "block-statement",
                format!("{} statements are blocked", query.command.as_ref()),
            );
        }

        for (src, re) in &policy.block_patterns {
            if re.is_match(&query.raw_sql) {
                return PolicyResult::block("block-pattern", format!("matched pattern: {src}"));
            }
        }

        let user = session.user.as_deref();
        let rule = policy
            .rules
            .iter()
            .find(|r| r.user_matches(user) && r.source_matches(session.client_addr.ip()));
        let rule = match rule {
            Some(rule) => rule,
            None => {
                return PolicyResult::block(
                    "no-access-rule",
                    format!("no access rule for user {:?}", user.unwrap_or("")),
                )
            }
        };

        if rule
            .blocked_operations
            .iter()
            .any(|op| query.command.matches_name(op))
        {
            return PolicyResult::block(
                "blocked-operation",
                format!("{} is a blocked operation", query.command.as_ref()),
            );
        }

        if let Some(tr) = &rule.time_restriction {
            match time_allowed(tr, now) {
                Ok(true) => {}
                Ok(false) => {
                    return PolicyResult::block(
                        "time-restriction",
                        format!("outside allowed window {}", tr.allow_range),
                    )
                }
                Err(e) => return PolicyResult::block("time-restriction", e.to_string()),
            }
        }

        if !rule.allowed_tables.is_empty() && !rule.allowed_tables.iter().any(|t| t == "*") {
            for table in &query.tables {
                if !rule
                    .allowed_tables
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(table))
                {
                    return PolicyResult::block(
                        "table-denied",
                        format!("table {table} is not permitted"),
                    );
                }
            }
        }

        if !rule.allowed_operations.is_empty()
            && !rule.allowed_operations.iter().any(|o| o == "*")
            && !rule
                .allowed_operations
                .iter()
                .any(|o| query.command.matches_name(o))
        {
            return PolicyResult::block(
                "operation-denied",
                format!("{} is not an allowed operation", query.command.as_ref()),
            );
        }

        let procedures = &policy.config.procedure_control;
        match query.command {
            QueryCommand::Prepare | QueryCommand::Execute if procedures.block_dynamic_sql => {
                return PolicyResult::block("procedure-dynamic-sql", "dynamic sql is blocked");
            }
            QueryCommand::Call => {
                let name = query.tables.first().map(String::as_str).unwrap_or("");
                let listed = procedures
                    .list
                    .iter()
                    .any(|p| p.eq_ignore_ascii_case(name));
                match procedures.mode {
                    ProcedureMode::Whitelist if !listed => {
                        return PolicyResult::block(
                            "procedure-whitelist",
                            format!("procedure {name:?} is not whitelisted"),
                        );
                    }
                    ProcedureMode::Blacklist if listed => {
                        return PolicyResult::block(
                            "procedure-blacklist",
                            format!("procedure {name:?} is blacklisted"),
                        );
                    }
                    _ => {}
                }
            }
            QueryCommand::Create | QueryCommand::Alter if procedures.block_create_alter => {
                return PolicyResult::block(
                    "procedure-create-alter",
                    "CREATE/ALTER is blocked by procedure control",
                );
            }
            _ => {}
        }

        if policy.config.data_protection.block_schema_access {
            for table in &query.tables {
                if let Some(schema) = reserved_schema(table) {
                    return PolicyResult::block(
                        "schema-access",
                        format!("schema {schema} is protected"),
                    );
                }
            }
        }

        PolicyResult::allow(
            format!("access-rule:{}", rule.user),
            "all policy checks passed",
        )
    }

    /// Parse failures never reach the client as detail; they turn into a
    /// plain Block whose reason is only logged.
    pub fn evaluate_error(&self, error: &ProxyError, _session: &SessionContext) -> PolicyResult {
        PolicyResult::block("parse-error", error.to_string())
    }
}
