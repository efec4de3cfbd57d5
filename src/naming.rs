//! Filename Rendering
//!
//! Patterns contain `{NAME}` placeholders. Rendering is a plain substitution
//! against a variable map: a name with no value renders as an empty string
//! (tags are tenant-specific and may be absent), anything else that goes wrong
//! fails the call.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::bucket::TimeBucketer;
use crate::codec::LogId;
use crate::error::{Error, Result};

pub const LOG_TYPE: &str = "LOG_TYPE";
pub const LOG_VERSION: &str = "LOG_VERSION";
pub const SERVER_HOST: &str = "SERVER_HOST";
pub const CLIENT_HOST: &str = "CLIENT_HOST";
pub const YEAR: &str = "YEAR";
pub const MONTH: &str = "MONTH";
pub const DAY: &str = "DAY";
pub const HOUR: &str = "HOUR";
pub const MINUTE: &str = "MINUTE";
pub const INTERVAL: &str = "INTERVAL";
pub const LOG_TIME_INTERVAL: &str = "LOG_TIME_INTERVAL";
pub const REGION: &str = "REGION";

/// Substitute `{NAME}` placeholders from `variables`
pub fn render(pattern: &str, variables: &HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(pattern.len() + 32);
    let mut rest = pattern;

    while let Some(open) = rest.find(|c: char| c == '{' || c == '}') {
        if rest.as_bytes()[open] == b'}' {
            return Err(Error::Template(format!(
                "Unmatched '}}' in pattern '{}'",
                pattern
            )));
        }

        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            Error::Template(format!("Unterminated placeholder in pattern '{}'", pattern))
        })?;

        let name = &after[..close];
        if !is_valid_name(name) {
            return Err(Error::Template(format!(
                "Invalid placeholder '{{{}}}' in pattern '{}'",
                name, pattern
            )));
        }

        if let Some(value) = variables.get(name) {
            if value.contains(|c: char| c == '/' || c == '\\') || value == ".." {
                return Err(Error::Template(format!(
                    "Value '{}' for {} would escape the log directory",
                    value, name
                )));
            }
            out.push_str(value);
        }

        rest = &after[close + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Renders the concrete filename for a stream at a given instant
#[derive(Debug, Clone)]
pub struct FileNamer {
    pattern: String,
    server_host: String,
    region: Option<String>,
}

impl FileNamer {
    /// Create a namer. The pattern is checked for syntax errors up front.
    pub fn new(
        pattern: impl Into<String>,
        server_host: impl Into<String>,
        region: Option<String>,
    ) -> Result<Self> {
        let pattern = pattern.into();
        render(&pattern, &HashMap::new())?;
        Ok(Self {
            pattern,
            server_host: server_host.into(),
            region,
        })
    }

    /// Create a namer whose `REGION` comes from the named environment variable
    pub fn from_env(
        pattern: impl Into<String>,
        server_host: impl Into<String>,
        region_env: &str,
    ) -> Result<Self> {
        let region = std::env::var(region_env).ok().filter(|r| !r.is_empty());
        Self::new(pattern, server_host, region)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Variables available to the pattern. Tags are added first so that a
    /// tag can never shadow a built-in name.
    pub fn variables(
        &self,
        log_id: &LogId,
        instant: DateTime<Utc>,
        bucketer: &TimeBucketer,
        version: u32,
    ) -> HashMap<String, String> {
        let mut vars: HashMap<String, String> = log_id
            .tags()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        vars.insert(LOG_TYPE.into(), log_id.log_type().to_string());
        vars.insert(
            LOG_VERSION.into(),
            format!("{:08x}-{}", log_id.schema_hash(), version),
        );
        vars.insert(SERVER_HOST.into(), self.server_host.clone());
        vars.insert(CLIENT_HOST.into(), log_id.client_hostname().to_string());
        vars.insert(YEAR.into(), format!("{:04}", instant.year()));
        vars.insert(MONTH.into(), format!("{:02}", instant.month()));
        vars.insert(DAY.into(), format!("{:02}", instant.day()));
        vars.insert(HOUR.into(), format!("{:02}", instant.hour()));
        vars.insert(MINUTE.into(), format!("{:02}", instant.minute()));
        vars.insert(
            INTERVAL.into(),
            format!("{:02}", bucketer.current_bucket(instant)),
        );
        vars.insert(
            LOG_TIME_INTERVAL.into(),
            bucketer.minutes_per_bucket().to_string(),
        );
        if let Some(region) = &self.region {
            vars.insert(REGION.into(), region.clone());
        }

        vars
    }

    pub fn render_name(
        &self,
        log_id: &LogId,
        instant: DateTime<Utc>,
        bucketer: &TimeBucketer,
        version: u32,
    ) -> Result<String> {
        render(&self.pattern, &self.variables(log_id, instant, bucketer, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TypeTag;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn log_id(headers: &[&str], types: Vec<crate::codec::ColumnType>) -> LogId {
        let mut tags = BTreeMap::new();
        tags.insert("tenant".to_string(), "acme".to_string());
        LogId::new(
            "clicks",
            "click",
            "web-1",
            tags,
            headers.iter().map(|h| h.to_string()).collect(),
            types,
        )
        .unwrap()
    }

    #[test]
    fn test_render_substitutes() {
        let out = render("{A}-x-{B}", &vars(&[("A", "one"), ("B", "two")])).unwrap();
        assert_eq!(out, "one-x-two");
        assert_eq!(render("plain", &HashMap::new()).unwrap(), "plain");
    }

    #[test]
    fn test_missing_renders_empty() {
        let out = render("{LOG_TYPE}-{customer}", &vars(&[("LOG_TYPE", "click")])).unwrap();
        assert_eq!(out, "click-");
    }

    #[test]
    fn test_malformed_patterns_fail() {
        let empty = HashMap::new();
        assert!(render("{LOG_TYPE", &empty).is_err());
        assert!(render("LOG_TYPE}", &empty).is_err());
        assert!(render("{}", &empty).is_err());
        assert!(render("{a b}", &empty).is_err());
        assert!(FileNamer::new("{oops", "host", None).is_err());
    }

    #[test]
    fn test_values_cannot_escape_directory() {
        assert!(render("{t}", &vars(&[("t", "../etc")])).is_err());
        assert!(render("{t}", &vars(&[("t", "..")])).is_err());
        assert!(render("{t}", &vars(&[("t", "a.b")])).is_ok());
    }

    #[test]
    fn test_builtin_variables() {
        let namer = FileNamer::new(
            "{LOG_TYPE}_{SERVER_HOST}_{CLIENT_HOST}_{tenant}_{YEAR}{MONTH}{DAY}{HOUR}{MINUTE}_{INTERVAL}_{LOG_TIME_INTERVAL}_{REGION}",
            "collector-1",
            Some("eu-west-1".into()),
        )
        .unwrap();
        let bucketer = TimeBucketer::new(12).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 1, 14, 0).unwrap();
        let id = log_id(&["user"], vec![TypeTag::String.into()]);

        let name = namer.render_name(&id, at, &bucketer, 3).unwrap();
        assert_eq!(name, "click_collector-1_web-1_acme_202401020114_02_5_eu-west-1");
    }

    #[test]
    fn test_log_version_tracks_schema() {
        let namer = FileNamer::new("{LOG_VERSION}", "h", None).unwrap();
        let bucketer = TimeBucketer::new(1).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 1, 0, 0).unwrap();

        let a = log_id(&["user"], vec![TypeTag::String.into()]);
        let b = log_id(&["user"], vec![TypeTag::Long.into()]);

        let va = namer.render_name(&a, at, &bucketer, 1).unwrap();
        let vb = namer.render_name(&b, at, &bucketer, 1).unwrap();
        assert_ne!(va, vb);
        assert_eq!(va, format!("{:08x}-1", a.schema_hash()));
    }

    #[test]
    fn test_tags_do_not_shadow_builtins() {
        let mut tags = BTreeMap::new();
        tags.insert("LOG_TYPE".to_string(), "spoofed".to_string());
        let id = LogId::new("p", "real", "h", tags, vec![], vec![]).unwrap();
        let namer = FileNamer::new("{LOG_TYPE}", "s", None).unwrap();
        let bucketer = TimeBucketer::new(1).unwrap();

        let name = namer.render_name(&id, Utc::now(), &bucketer, 1).unwrap();
        assert_eq!(name, "real");
    }
}
