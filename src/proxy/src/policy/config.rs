//! The policy file: YAML with `global`, `access_control`, `sql_rules`,
//! `procedure_control`, and `data_protection` sections. Loading validates
//! the fail-close invariants up front so a bad file never becomes the
//! active policy.

use crate::error::ProxyError;

use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    pub global: GlobalOptions,
    pub access_control: Vec<AccessRule>,
    pub sql_rules: SqlRule,
    pub procedure_control: ProcedureControl,
    pub data_protection: DataProtection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct GlobalOptions {
    pub log_level: String,
    pub max_connections: usize,
    /// Idle timeout in seconds; the file may write `300` or `"300s"`.
    #[serde(deserialize_with = "de_seconds")]
    pub connection_timeout: u64,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        GlobalOptions {
            log_level: "info".to_string(),
            max_connections: 1000,
            connection_timeout: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AccessRule {
    /// Exact user name, or `*` for any authenticated user.
    pub user: String,
    /// IPv4 CIDR blocks the client must come from; empty means any source.
    pub source_ip_cidr: Vec<String>,
    /// Tables the rule permits; `*` or an empty list disables the check.
    pub allowed_tables: Vec<String>,
    /// Operations the rule permits; empty or `*` disables the check.
    pub allowed_operations: Vec<String>,
    /// Operations denied outright; takes precedence over allows.
    pub blocked_operations: Vec<String>,
    pub time_restriction: Option<TimeRestriction>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TimeRestriction {
    /// IANA zone name the window is evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// `HH:MM-HH:MM`, midnight crossing allowed.
    #[serde(rename = "allow")]
    pub allow_range: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SqlRule {
    /// Statement keywords refused for everyone (`DROP`, `TRUNCATE`, ...).
    pub block_statements: Vec<String>,
    /// Regex patterns matched against the raw SQL of every query.
    pub block_patterns: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureMode {
    #[default]
    Whitelist,
    Blacklist,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProcedureControl {
    pub mode: ProcedureMode,
    pub list: Vec<String>,
    pub block_dynamic_sql: bool,
    pub block_create_alter: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DataProtection {
    pub block_schema_access: bool,
    pub max_result_rows: u64,
}

impl Default for DataProtection {
    fn default() -> Self {
        DataProtection {
            block_schema_access: true,
            max_result_rows: 0,
        }
    }
}

fn de_seconds<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SecondsRepr {
        Num(u64),
        Text(String),
    }
    match SecondsRepr::deserialize(deserializer)? {
        SecondsRepr::Num(n) => Ok(n),
        SecondsRepr::Text(s) => {
            let t = s.trim();
            let t = t.strip_suffix('s').unwrap_or(t).trim();
            t.parse::<u64>().map_err(serde::de::Error::custom)
        }
    }
}

/// Startup/reload validation. An empty `block_patterns` means the operator
/// gets a detector with nothing to match, which would silently weaken the
/// injection screen; loading refuses instead.
pub fn validate_policy(config: &PolicyConfig) -> Result<(), ProxyError> {
    if config.sql_rules.block_patterns.is_empty() {
        return Err(ProxyError::PolicyLoadFailure(
            "sql_rules.block_patterns must not be empty".to_string(),
        ));
    }
    Ok(())
}

pub fn load_policy(path: &Path) -> Result<PolicyConfig, ProxyError> {
    let text = fs_err::read_to_string(path)
        .map_err(|e| ProxyError::PolicyLoadFailure(format!("{}: {e}", path.display())))?;
    let config: PolicyConfig = serde_yaml::from_str(&text)
        .map_err(|e| ProxyError::PolicyLoadFailure(format!("{}: {e}", path.display())))?;
    validate_policy(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
global:
  log_level: info
  max_connections: 500
  connection_timeout: 300s

access_control:
  - user: testuser
    source_ip_cidr:
      - 192.168.1.0/24
    allowed_tables:
      - users
      - orders
    allowed_operations:
      - SELECT
      - INSERT
    blocked_operations:
      - DROP
    time_restriction:
      timezone: Asia/Seoul
      allow: "09:00-18:00"
  - user: "*"
    allowed_operations:
      - SELECT

sql_rules:
  block_statements:
    - DROP
    - TRUNCATE
  block_patterns:
    - "union\\s+select"
    - "into\\s+outfile"

procedure_control:
  mode: whitelist
  list:
    - monthly_report
  block_dynamic_sql: true
  block_create_alter: true

data_protection:
  block_schema_access: true
  max_result_rows: 10000
"#;

    #[test]
    fn parses_full_document() {
        let config: PolicyConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.global.max_connections, 500);
        assert_eq!(config.global.connection_timeout, 300);
        assert_eq!(config.access_control.len(), 2);
        let rule = &config.access_control[0];
        assert_eq!(rule.user, "testuser");
        assert_eq!(rule.source_ip_cidr, vec!["192.168.1.0/24"]);
        let tr = rule.time_restriction.as_ref().unwrap();
        assert_eq!(tr.timezone, "Asia/Seoul");
        assert_eq!(tr.allow_range, "09:00-18:00");
        assert_eq!(config.procedure_control.mode, ProcedureMode::Whitelist);
        assert!(config.data_protection.block_schema_access);
    }

    #[test]
    fn timeout_accepts_plain_integer() {
        let config: PolicyConfig =
            serde_yaml::from_str("global:\n  connection_timeout: 120\nsql_rules:\n  block_patterns: [\"x\"]\n").unwrap();
        assert_eq!(config.global.connection_timeout, 120);
    }

    #[test]
    fn empty_block_patterns_fails_validation() {
        let config: PolicyConfig = serde_yaml::from_str("global: {}\n").unwrap();
        let err = validate_policy(&config).unwrap_err();
        assert!(matches!(err, ProxyError::PolicyLoadFailure(_)));
    }

    #[test]
    fn load_from_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = load_policy(file.path()).unwrap();
        assert_eq!(config.sql_rules.block_statements, vec!["DROP", "TRUNCATE"]);
    }

    #[test]
    fn missing_file_is_a_load_failure() {
        let err = load_policy(Path::new("/nonexistent/policy.yaml")).unwrap_err();
        assert!(matches!(err, ProxyError::PolicyLoadFailure(_)));
    }
}
