use std::num::IntErrorKind;

use serde::{Deserialize, Serialize};

use crate::error::PlanningError;

/// Keyspace-affecting parameters of an attack. The storage layer resolves
/// wordlists, rules and masks to these counts; the planner only multiplies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "attack_mode", rename_all = "snake_case")]
pub enum KeyspaceParams {
    /// Every word, optionally mangled by every rule.
    Dictionary { wordlist_lines: u64, rule_count: u64 },
    /// One charset size per mask position.
    Mask { charset_sizes: Vec<u64> },
    /// Every word followed (or preceded) by every mask candidate.
    Hybrid {
        wordlist_lines: u64,
        charset_sizes: Vec<u64>,
    },
}

fn overflow(what: &str) -> PlanningError {
    PlanningError::KeyspaceOverflow(what.to_string())
}

fn mask_keyspace(charset_sizes: &[u64]) -> Result<u128, PlanningError> {
    if charset_sizes.is_empty() {
        return Err(PlanningError::InvalidKeyspace(
            "mask has no positions".to_string(),
        ));
    }
    charset_sizes
        .iter()
        .try_fold(1u128, |acc, &n| acc.checked_mul(u128::from(n)))
        .ok_or_else(|| overflow("mask charset product"))
}

impl KeyspaceParams {
    pub fn mode_name(&self) -> &'static str {
        match self {
            KeyspaceParams::Dictionary { .. } => "dictionary",
            KeyspaceParams::Mask { .. } => "mask",
            KeyspaceParams::Hybrid { .. } => "hybrid",
        }
    }

    /// Total candidate count. A rule count of zero means "no rules", which
    /// still tries each word once.
    pub fn total(&self) -> Result<u128, PlanningError> {
        match self {
            KeyspaceParams::Dictionary {
                wordlist_lines,
                rule_count,
            } => u128::from(*wordlist_lines)
                .checked_mul(u128::from((*rule_count).max(1)))
                .ok_or_else(|| overflow("wordlist lines x rules")),
            KeyspaceParams::Mask { charset_sizes } => mask_keyspace(charset_sizes),
            KeyspaceParams::Hybrid {
                wordlist_lines,
                charset_sizes,
            } => u128::from(*wordlist_lines)
                .checked_mul(mask_keyspace(charset_sizes)?)
                .ok_or_else(|| overflow("wordlist lines x mask")),
        }
    }
}

/// Parse a decimal keyspace size, telling overflow apart from garbage.
pub fn parse_keyspace(s: &str) -> Result<u128, PlanningError> {
    let trimmed = s.trim();
    trimmed.parse::<u128>().map_err(|e| match e.kind() {
        IntErrorKind::PosOverflow => PlanningError::KeyspaceOverflow(trimmed.to_string()),
        _ => PlanningError::InvalidKeyspace(trimmed.to_string()),
    })
}

/// Where an attack's total keyspace comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyspaceSource {
    Total(u128),
    Decimal(String),
    Params(KeyspaceParams),
}

impl KeyspaceSource {
    pub fn resolve(&self) -> Result<u128, PlanningError> {
        match self {
            KeyspaceSource::Total(total) => Ok(*total),
            KeyspaceSource::Decimal(s) => parse_keyspace(s),
            KeyspaceSource::Params(params) => params.total(),
        }
    }
}

impl From<u128> for KeyspaceSource {
    fn from(total: u128) -> Self {
        KeyspaceSource::Total(total)
    }
}

impl From<KeyspaceParams> for KeyspaceSource {
    fn from(params: KeyspaceParams) -> Self {
        KeyspaceSource::Params(params)
    }
}
