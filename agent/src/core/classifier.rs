//! Rule-table risk classification of candidate commands.
//!
//! Classification is a pure function of the command string and a [`RuleTable`].
//! The table is data: the embedded default lives in `rules/default.toml` and an
//! operator may replace it wholesale via `rules_path`.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::core::scope::{TargetScope, segment_binary, split_segments, tool_invocations};
use crate::core::types::{RiskTier, RiskVerdict};

const DEFAULT_RULES: &str = include_str!("../../rules/default.toml");

pub const RULE_LONG_COMMAND: &str = "shape.long_command";
pub const RULE_PIPE_CHAIN: &str = "shape.pipe_chain";
pub const RULE_EMPTY_COMMAND: &str = "shape.empty_command";
pub const RULE_UNKNOWN_BINARY: &str = "unknown.binary";
pub const RULE_OUT_OF_SCOPE: &str = "scope.out_of_scope_target";
pub const RULE_UNCHECKED_TARGETS: &str = "scope.unchecked_targets";

#[derive(Debug, Deserialize)]
struct RuleTableFile {
    #[serde(default = "default_max_command_length")]
    max_command_length: usize,
    #[serde(default = "default_max_pipes")]
    max_pipes: usize,
    #[serde(default)]
    known_binaries: Vec<String>,
    #[serde(default)]
    attack_tools: Vec<String>,
    #[serde(default)]
    scope: ScopeFile,
    #[serde(default)]
    rule: Vec<RuleFile>,
}

#[derive(Debug, Default, Deserialize)]
struct ScopeFile {
    #[serde(default)]
    targets: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    id: String,
    tier: RiskTier,
    pattern: String,
    rationale: String,
}

fn default_max_command_length() -> usize {
    500
}

fn default_max_pipes() -> usize {
    5
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub tier: RiskTier,
    pub rationale: String,
    regex: Regex,
}

impl Rule {
    pub fn matches(&self, command: &str) -> bool {
        self.regex.is_match(command)
    }
}

/// Compiled, ordered rule table plus the shape, binary and scope heuristics.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<Rule>,
    max_command_length: usize,
    max_pipes: usize,
    known_binaries: BTreeSet<String>,
    attack_tools: BTreeSet<String>,
    scope: TargetScope,
}

impl RuleTable {
    /// The embedded default table.
    pub fn builtin() -> Result<Self> {
        Self::from_toml(DEFAULT_RULES).context("parse embedded rule table")
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: RuleTableFile = toml::from_str(contents).context("parse rule table toml")?;
        let mut seen = BTreeSet::new();
        let mut rules = Vec::with_capacity(file.rule.len());
        for raw in file.rule {
            if raw.id.trim().is_empty() {
                return Err(anyhow!("rule id must be non-empty"));
            }
            if !seen.insert(raw.id.clone()) {
                return Err(anyhow!("duplicate rule id '{}'", raw.id));
            }
            if raw.tier == RiskTier::Safe {
                return Err(anyhow!(
                    "rule '{}' must be caution, dangerous or blocked",
                    raw.id
                ));
            }
            let regex = RegexBuilder::new(&raw.pattern)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("compile pattern for rule '{}'", raw.id))?;
            rules.push(Rule {
                id: raw.id,
                tier: raw.tier,
                rationale: raw.rationale,
                regex,
            });
        }
        if file.max_command_length == 0 || file.max_pipes == 0 {
            return Err(anyhow!("max_command_length and max_pipes must be > 0"));
        }
        let scope = TargetScope::parse(&file.scope.targets).context("parse rule table scope")?;
        Ok(Self {
            rules,
            max_command_length: file.max_command_length,
            max_pipes: file.max_pipes,
            known_binaries: lowercase_set(file.known_binaries),
            attack_tools: lowercase_set(file.attack_tools),
            scope,
        })
    }

    /// Load a table from `path`, or the embedded default when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Self::builtin();
        };
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read rule table {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("load rule table {}", path.display()))
    }

    /// Replace the target scope. An empty list disables the scope check.
    pub fn set_scope<S: AsRef<str>>(&mut self, targets: &[S]) -> Result<()> {
        self.scope = TargetScope::parse(targets)?;
        Ok(())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

fn lowercase_set(items: Vec<String>) -> BTreeSet<String> {
    items
        .into_iter()
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Classify a single command line.
pub fn classify(command: &str, table: &RuleTable) -> RiskVerdict {
    let command = command.trim();
    if command.is_empty() {
        return verdict(
            RiskTier::Caution,
            vec![RULE_EMPTY_COMMAND.to_string()],
            vec!["empty command".to_string()],
        );
    }

    let mut tier = RiskTier::Safe;
    let mut matched = Vec::new();
    let mut reasons = Vec::new();

    // Quotes do not change which path or argument the shell passes on.
    let unquoted = command.replace(['"', '\''], "");
    for rule in &table.rules {
        if !rule.matches(command) && !rule.matches(&unquoted) {
            continue;
        }
        if rule.tier == RiskTier::Blocked {
            return verdict(
                RiskTier::Blocked,
                vec![rule.id.clone()],
                vec![rule.rationale.clone()],
            );
        }
        tier = tier.max(rule.tier);
        matched.push(rule.id.clone());
        reasons.push(rule.rationale.clone());
    }

    let segments = split_segments(command);

    if !table.scope.is_empty() {
        let invocations = tool_invocations(command, &table.attack_tools);
        for invocation in &invocations {
            if let Some(arg) = invocation
                .targets
                .iter()
                .find(|arg| !table.scope.covers(&arg.target))
            {
                return verdict(
                    RiskTier::Blocked,
                    vec![RULE_OUT_OF_SCOPE.to_string()],
                    vec![format!(
                        "{} targets {}, outside the allowed scope",
                        invocation.tool, arg.raw
                    )],
                );
            }
        }
        let unchecked: BTreeSet<&str> = invocations
            .iter()
            .filter(|invocation| invocation.indirect)
            .map(|invocation| invocation.tool.as_str())
            .collect();
        if !unchecked.is_empty() {
            tier = tier.max(RiskTier::Dangerous);
            matched.push(RULE_UNCHECKED_TARGETS.to_string());
            reasons.push(format!(
                "{} reads targets that cannot be checked against the scope",
                unchecked.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }
    }

    if command.chars().count() > table.max_command_length {
        tier = tier.max(RiskTier::Caution);
        matched.push(RULE_LONG_COMMAND.to_string());
        reasons.push(format!(
            "command longer than {} characters",
            table.max_command_length
        ));
    }
    if command.matches('|').count() > table.max_pipes {
        tier = tier.max(RiskTier::Caution);
        matched.push(RULE_PIPE_CHAIN.to_string());
        reasons.push(format!("more than {} pipes", table.max_pipes));
    }

    let unknown: Vec<String> = segments
        .iter()
        .filter_map(|segment| segment_binary(segment))
        .map(str::to_ascii_lowercase)
        .filter(|binary| !table.known_binaries.contains(binary))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if !unknown.is_empty() {
        tier = tier.max(RiskTier::Caution);
        matched.push(RULE_UNKNOWN_BINARY.to_string());
        reasons.push(format!("unrecognized binary: {}", unknown.join(", ")));
    }

    if matched.is_empty() {
        reasons.push("no rule matched and every binary is known".to_string());
    }
    verdict(tier, matched, reasons)
}

/// Classify a batch of commands as one unit: any blocked member blocks the
/// batch, otherwise the batch takes the highest member tier.
pub fn classify_batch<S: AsRef<str>>(commands: &[S], table: &RuleTable) -> RiskVerdict {
    let mut tier = RiskTier::Safe;
    let mut matched: Vec<String> = Vec::new();
    let mut reasons = Vec::new();
    for command in commands {
        let command = command.as_ref();
        let member = classify(command, table);
        if member.is_blocked() {
            return RiskVerdict {
                rationale: format!("`{}`: {}", command.trim(), member.rationale),
                ..member
            };
        }
        tier = tier.max(member.tier);
        for id in member.matched_rules {
            if !matched.contains(&id) {
                matched.push(id);
            }
        }
        reasons.push(format!("`{}`: {}", command.trim(), member.rationale));
    }
    verdict(tier, matched, reasons)
}

fn verdict(tier: RiskTier, matched_rules: Vec<String>, reasons: Vec<String>) -> RiskVerdict {
    RiskVerdict {
        tier,
        matched_rules,
        rationale: reasons.join("; "),
    }
}
