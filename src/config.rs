//! `omni.toml` loading and validation for the `[ralph]` table.
//!
//! Recognized keys are enumerated here; anything else in the table is
//! accepted but logged as a warning rather than rejected, matching the
//! "dynamic config shape" design note — configuration should degrade
//! gracefully across revisions rather than hard-fail on an unrecognized
//! field.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use ralph_common::RalphError;

const RECOGNIZED_TOP_LEVEL_KEYS: &[&str] = &[
    "project_name",
    "default_agent",
    "default_iterations",
    "verification_agent",
    "docs",
    "agents",
    "testing",
    "scripts",
    "review",
    "swarm",
];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub skip_permissions: bool,
}

impl AgentConfig {
    /// The command to invoke, with an `RALPH_AGENT_CMD` environment-variable
    /// override taking precedence over the configured value — lets a
    /// sandboxed or CI run swap the agent binary without editing
    /// `omni.toml`.
    pub fn resolved_command(&self) -> String {
        std::env::var("RALPH_AGENT_CMD").unwrap_or_else(|_| self.command.clone())
    }

    /// Whether permission prompts should be skipped, with an
    /// `RALPH_SKIP_PERMISSIONS` environment-variable override taking
    /// precedence over the configured value.
    pub fn resolved_skip_permissions(&self) -> bool {
        match std::env::var("RALPH_SKIP_PERMISSIONS") {
            Ok(val) => val != "false",
            Err(_) => self.skip_permissions,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DocsConfig {
    pub agent: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub auto_update: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestingConfig {
    pub project_verification_instructions: Option<String>,
    pub instructions: Option<String>,
    #[serde(default)]
    pub web_testing_enabled: bool,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout: u64,
    #[serde(default = "default_max_health_fix_attempts")]
    pub max_health_fix_attempts: u32,
    #[serde(default = "default_test_iterations")]
    pub test_iterations: u32,
}

fn default_health_check_timeout() -> u64 {
    30
}
fn default_max_health_fix_attempts() -> u32 {
    3
}
fn default_test_iterations() -> u32 {
    1
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            project_verification_instructions: None,
            instructions: None,
            web_testing_enabled: false,
            health_check_timeout: default_health_check_timeout(),
            max_health_fix_attempts: default_max_health_fix_attempts(),
            test_iterations: default_test_iterations(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScriptsConfig {
    pub setup: Option<PathBuf>,
    pub start: Option<PathBuf>,
    pub health_check: Option<PathBuf>,
    pub teardown: Option<PathBuf>,
}

/// One review aspect: a closed set of built-in perspectives plus an open
/// `Custom` variant, so `[ralph.review]`'s `phases[].aspects[]` can name
/// either a recognized aspect or an arbitrary project-specific one without a
/// schema migration.
///
/// Deserializes from a bare string (`"security"`, short aliases like
/// `"spec"`, or the long `snake_case` form) via [`ReviewAspect::from_str`],
/// which never fails — unrecognized strings fall back to `Custom`. A tagged
/// object form, `{custom = "my-aspect"}`, is also accepted.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAspect {
    #[default]
    Quality,
    Security,
    SpecAdherence,
    Simplification,
    Documentation,
    Testing,
    Custom(String),
}

impl ReviewAspect {
    /// Human-readable label embedded in review prompts.
    pub fn display_name(&self) -> &str {
        match self {
            Self::Quality => "quality",
            Self::Security => "security",
            Self::SpecAdherence => "spec-adherence",
            Self::Simplification => "simplification",
            Self::Documentation => "documentation",
            Self::Testing => "testing",
            Self::Custom(name) => name,
        }
    }
}

impl std::str::FromStr for ReviewAspect {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "quality" => Self::Quality,
            "security" => Self::Security,
            "spec" | "spec-adherence" | "spec_adherence" => Self::SpecAdherence,
            "simplification" | "simplicity" => Self::Simplification,
            "documentation" | "docs" => Self::Documentation,
            "testing" | "test" => Self::Testing,
            _ => Self::Custom(s.to_string()),
        })
    }
}

impl<'de> serde::Deserialize<'de> for ReviewAspect {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::{self, Visitor};
        use std::str::FromStr;

        struct ReviewAspectVisitor;

        impl<'de> Visitor<'de> for ReviewAspectVisitor {
            type Value = ReviewAspect;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str(
                    r#"a review aspect string (e.g. "security") or a tagged object (e.g. {custom = "my-aspect"})"#,
                )
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<ReviewAspect, E> {
                Ok(ReviewAspect::from_str(value).expect("ReviewAspect::from_str is infallible"))
            }

            fn visit_map<A: de::MapAccess<'de>>(self, mut map: A) -> Result<ReviewAspect, A::Error> {
                let key: String = map
                    .next_key()?
                    .ok_or_else(|| de::Error::custom("expected a key in review aspect object"))?;
                if key != "custom" {
                    return Err(de::Error::unknown_field(&key, &["custom"]));
                }
                let value: String = map.next_value()?;
                while map.next_key::<de::IgnoredAny>()?.is_some() {
                    map.next_value::<de::IgnoredAny>()?;
                }
                Ok(ReviewAspect::Custom(value))
            }
        }

        deserializer.deserialize_any(ReviewAspectVisitor)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReviewPhaseConfig {
    pub name: String,
    pub aspects: Vec<ReviewAspect>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReviewConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub phases: Vec<ReviewPhaseConfig>,
    pub agent: Option<String>,
    pub fix_agent: Option<String>,
    pub finalize_agent: Option<String>,
    #[serde(default = "default_max_fix_iterations")]
    pub max_fix_iterations: u32,
}

fn default_max_fix_iterations() -> u32 {
    3
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            phases: Vec::new(),
            agent: None,
            fix_agent: None,
            finalize_agent: None,
            max_fix_iterations: default_max_fix_iterations(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SwarmConfig {
    #[serde(default = "default_worktree_parent")]
    pub worktree_parent: PathBuf,
    #[serde(default = "default_panes_per_window")]
    pub panes_per_window: u32,
    #[serde(default = "default_pane_close_timeout")]
    pub pane_close_timeout: u64,
    pub worktree_create_cmd: Option<String>,
    pub merge_agent: Option<String>,
}

fn default_worktree_parent() -> PathBuf {
    PathBuf::from("../ralph-worktrees")
}
fn default_panes_per_window() -> u32 {
    4
}
fn default_pane_close_timeout() -> u64 {
    5
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            worktree_parent: default_worktree_parent(),
            panes_per_window: default_panes_per_window(),
            pane_close_timeout: default_pane_close_timeout(),
            worktree_create_cmd: None,
            merge_agent: None,
        }
    }
}

/// The fully parsed `[ralph]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RalphConfig {
    pub project_name: String,
    #[serde(default = "default_agent_name")]
    pub default_agent: String,
    #[serde(default = "default_iterations")]
    pub default_iterations: u32,
    pub verification_agent: Option<String>,
    #[serde(default)]
    pub docs: DocsConfig,
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    #[serde(default)]
    pub testing: TestingConfig,
    #[serde(default)]
    pub scripts: ScriptsConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub swarm: SwarmConfig,
}

fn default_agent_name() -> String {
    "default".to_string()
}
fn default_iterations() -> u32 {
    20
}

#[derive(Deserialize)]
struct OmniToml {
    ralph: toml::Value,
}

impl RalphConfig {
    /// Load and validate `<project_dir>/omni.toml`'s `[ralph]` table.
    pub fn load(project_dir: &std::path::Path) -> Result<Self, RalphError> {
        let path = project_dir.join("omni.toml");
        let raw = std::fs::read_to_string(&path).map_err(|source| RalphError::Io { path: path.clone(), source })?;
        Self::parse(&raw)
    }

    /// Parse an already-read `omni.toml` document. Warns (does not fail) on
    /// unrecognized keys inside `[ralph]`.
    pub fn parse(raw: &str) -> Result<Self, RalphError> {
        let doc: OmniToml =
            toml::from_str(raw).map_err(|e| RalphError::ConfigError(format!("invalid omni.toml: {e}")))?;

        if let toml::Value::Table(table) = &doc.ralph {
            for key in table.keys() {
                if !RECOGNIZED_TOP_LEVEL_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "unrecognized [ralph] configuration key, ignoring");
                }
            }
        }

        let config: RalphConfig = doc
            .ralph
            .try_into()
            .map_err(|e| RalphError::ConfigError(format!("invalid [ralph] table: {e}")))?;

        if !ralph_common::prd::is_valid_slug(&config.project_name) {
            return Err(RalphError::ConfigError(format!(
                "project_name '{}' must be lowercase alphanumeric/hyphen, 1-64 chars",
                config.project_name
            )));
        }

        Ok(config)
    }

    /// Resolve the agent config for a name, falling back to `default_agent`.
    pub fn agent(&self, name: Option<&str>) -> Result<&AgentConfig, RalphError> {
        let key = name.unwrap_or(&self.default_agent);
        self.agents
            .get(key)
            .ok_or_else(|| RalphError::ConfigError(format!("no [ralph.agents.{key}] configured")))
    }

    /// `fix_agent` falls back to `agent`, which falls back to `default_agent`.
    pub fn fix_agent_name(&self) -> &str {
        self.review
            .fix_agent
            .as_deref()
            .or(self.review.agent.as_deref())
            .unwrap_or(&self.default_agent)
    }

    /// `finalize_agent` falls back to `agent`, which falls back to `default_agent`.
    pub fn finalize_agent_name(&self) -> &str {
        self.review
            .finalize_agent
            .as_deref()
            .or(self.review.agent.as_deref())
            .unwrap_or(&self.default_agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const MINIMAL: &str = r#"
[ralph]
project_name = "alpha"

[ralph.agents.default]
command = "claude"
args = ["--print"]
"#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = RalphConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.project_name, "alpha");
        assert_eq!(config.default_agent, "default");
        assert_eq!(config.default_iterations, 20);
        assert_eq!(config.testing.health_check_timeout, 30);
        assert_eq!(config.swarm.panes_per_window, 4);
    }

    #[test]
    fn agent_lookup_resolves_default() {
        let config = RalphConfig::parse(MINIMAL).unwrap();
        let agent = config.agent(None).unwrap();
        assert_eq!(agent.command, "claude");
    }

    #[test]
    fn agent_lookup_missing_is_config_error() {
        let config = RalphConfig::parse(MINIMAL).unwrap();
        assert!(config.agent(Some("nonexistent")).is_err());
    }

    #[test]
    fn rejects_invalid_project_name() {
        let raw = MINIMAL.replace("alpha", "Not A Slug");
        assert!(RalphConfig::parse(&raw).is_err());
    }

    #[test]
    fn fix_agent_falls_back_through_agent_to_default() {
        let config = RalphConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.fix_agent_name(), "default");
    }

    #[test]
    fn fix_agent_prefers_explicit_fix_agent() {
        let raw = format!(
            "{MINIMAL}\n[ralph.review]\nenabled = true\nagent = \"reviewer\"\nfix_agent = \"fixer\"\n"
        );
        let config = RalphConfig::parse(&raw).unwrap();
        assert_eq!(config.fix_agent_name(), "fixer");
        assert_eq!(config.finalize_agent_name(), "reviewer");
    }

    #[test]
    fn unrecognized_keys_are_tolerated() {
        let raw = format!("{MINIMAL}\nunknown_key = true\n");
        assert!(RalphConfig::parse(&raw).is_ok());
    }

    #[test]
    fn review_phase_aspects_parse_recognized_and_custom_strings() {
        let raw = format!(
            "{MINIMAL}\n[ralph.review]\nenabled = true\n\
             [[ralph.review.phases]]\nname = \"quality-pass\"\n\
             aspects = [\"security\", \"spec-adherence\", \"threat-modeling\"]\n"
        );
        let config = RalphConfig::parse(&raw).unwrap();
        let aspects = &config.review.phases[0].aspects;
        assert_eq!(aspects[0], ReviewAspect::Security);
        assert_eq!(aspects[1], ReviewAspect::SpecAdherence);
        assert_eq!(aspects[2], ReviewAspect::Custom("threat-modeling".to_string()));
    }

    #[test]
    fn review_aspect_custom_object_form_parses() {
        let raw = format!(
            "{MINIMAL}\n[ralph.review]\nenabled = true\n\
             [[ralph.review.phases]]\nname = \"quality-pass\"\n\
             aspects = [{{ custom = \"threat-modeling\" }}]\n"
        );
        let config = RalphConfig::parse(&raw).unwrap();
        assert_eq!(
            config.review.phases[0].aspects[0],
            ReviewAspect::Custom("threat-modeling".to_string())
        );
    }

    #[test]
    fn review_aspect_display_names() {
        assert_eq!(ReviewAspect::Security.display_name(), "security");
        assert_eq!(ReviewAspect::Custom("foo".to_string()).display_name(), "foo");
    }

    #[test]
    fn resolved_command_prefers_env_override() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var("RALPH_AGENT_CMD").ok();
        unsafe { std::env::remove_var("RALPH_AGENT_CMD") };

        let agent = AgentConfig { command: "claude".to_string(), args: vec![], skip_permissions: false };
        assert_eq!(agent.resolved_command(), "claude");

        unsafe { std::env::set_var("RALPH_AGENT_CMD", "custom-agent") };
        assert_eq!(agent.resolved_command(), "custom-agent");

        match saved {
            Some(val) => unsafe { std::env::set_var("RALPH_AGENT_CMD", val) },
            None => unsafe { std::env::remove_var("RALPH_AGENT_CMD") },
        }
    }

    #[test]
    fn resolved_skip_permissions_prefers_env_override() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var("RALPH_SKIP_PERMISSIONS").ok();
        unsafe { std::env::remove_var("RALPH_SKIP_PERMISSIONS") };

        let agent = AgentConfig { command: "claude".to_string(), args: vec![], skip_permissions: false };
        assert!(!agent.resolved_skip_permissions());

        unsafe { std::env::set_var("RALPH_SKIP_PERMISSIONS", "true") };
        assert!(agent.resolved_skip_permissions());

        unsafe { std::env::set_var("RALPH_SKIP_PERMISSIONS", "false") };
        assert!(!agent.resolved_skip_permissions());

        match saved {
            Some(val) => unsafe { std::env::set_var("RALPH_SKIP_PERMISSIONS", val) },
            None => unsafe { std::env::remove_var("RALPH_SKIP_PERMISSIONS") },
        }
    }
}
