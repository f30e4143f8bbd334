//! Aggregation policy: status vocabulary, noise filters, station roles and
//! model families. Loaded once from `rules/aggregation.yaml` and injected into
//! every job.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// How a job decides that an event failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailRule {
    /// Any recorded status other than the pass value. A missing status is
    /// neither pass nor fail.
    NotPass,
    /// Only the explicit fail value.
    Explicit,
}

/// Status strings are compared trimmed and case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusVocabulary {
    pub pass: String,
    pub fail: String,
}

impl Default for StatusVocabulary {
    fn default() -> Self {
        Self {
            pass: "Pass".to_string(),
            fail: "Fail".to_string(),
        }
    }
}

impl StatusVocabulary {
    pub fn is_pass(&self, status: Option<&str>) -> bool {
        status.is_some_and(|s| s.trim().eq_ignore_ascii_case(&self.pass))
    }

    pub fn is_fail(&self, status: Option<&str>, rule: FailRule) -> bool {
        match (status, rule) {
            (None, _) => false,
            (Some(s), FailRule::NotPass) => !s.trim().eq_ignore_ascii_case(&self.pass),
            (Some(s), FailRule::Explicit) => s.trim().eq_ignore_ascii_case(&self.fail),
        }
    }
}

/// A product family with its fixed station sequence for hardcoded TPY.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFamily {
    pub name: String,
    pub model: String,
    pub stations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationRules {
    pub status: StatusVocabulary,
    pub workstation_fail_rule: FailRule,
    pub testboard_fail_rule: FailRule,
    pub excluded_service_flows: Vec<String>,
    pub exclude_missing_service_flow: bool,
    pub terminal_station: String,
    pub sorting_station: String,
    pub sort_test_station: String,
    pub sort_codes: BTreeMap<String, String>,
    pub daily_tpy_models: Vec<String>,
    pub model_families: Vec<ModelFamily>,
}

fn family(name: &str, model: &str, stations: &[&str]) -> ModelFamily {
    ModelFamily {
        name: name.to_string(),
        model: model.to_string(),
        stations: stations.iter().map(|s| s.to_string()).collect(),
    }
}

impl Default for AggregationRules {
    fn default() -> Self {
        Self {
            status: StatusVocabulary::default(),
            workstation_fail_rule: FailRule::NotPass,
            testboard_fail_rule: FailRule::Explicit,
            excluded_service_flows: vec!["NC Sort".to_string(), "RO".to_string()],
            exclude_missing_service_flow: true,
            terminal_station: "PACKING".to_string(),
            sorting_station: "SORTING".to_string(),
            sort_test_station: "TEST".to_string(),
            sort_codes: BTreeMap::from([
                ("Tesla SXM4".to_string(), "506".to_string()),
                ("Tesla SXM5".to_string(), "520".to_string()),
            ]),
            daily_tpy_models: vec!["Tesla SXM4".to_string(), "Tesla SXM5".to_string()],
            model_families: vec![
                family("SXM4", "Tesla SXM4", &["VI2", "ASSY2", "FI", "FQC"]),
                family("SXM5", "Tesla SXM5", &["BBD", "ASSY2", "FI", "FQC"]),
                family("SXM6", "SXM6", &["BBD", "ASSY2", "FI", "FQC"]),
            ],
        }
    }
}

impl AggregationRules {
    /// Reads the rules file; a missing file yields the built-in defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Service flows are matched exactly; a missing flow counts as excluded
    /// unless the rules say otherwise.
    pub fn is_excluded_flow(&self, service_flow: Option<&str>) -> bool {
        match service_flow {
            None => self.exclude_missing_service_flow,
            Some(flow) => self.excluded_service_flows.iter().any(|f| f == flow),
        }
    }

    pub fn is_terminal(&self, workstation: &str) -> bool {
        workstation == self.terminal_station
    }

    pub fn is_sorting(&self, workstation: &str) -> bool {
        workstation == self.sorting_station
    }

    pub fn sort_code_for(&self, model: &str) -> Option<&str> {
        self.sort_codes.get(model).map(String::as_str)
    }

    pub fn family_for_model(&self, model: &str) -> Option<&ModelFamily> {
        self.model_families.iter().find(|f| f.model == model)
    }
}
