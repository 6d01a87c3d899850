//! Sweep declaration and expansion.

use serde_json::Value;
use sift_core::config::{self, Override};
use sift_core::{CurationError, RunParameters, Stage};

use crate::pipeline::MemberFailure;

/// One expanded sweep member.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepMember {
    /// Deterministic, path-safe member name.
    pub name: String,
    /// The axis assignments that produced this member, e.g.
    /// `preproc.dropout_rate=0.3`.
    pub assignments: Vec<String>,
    /// Resolved parameters, or why this combination did not deserialize.
    /// An unresolved member fails on its own; its siblings still run.
    pub params: Result<RunParameters, MemberFailure>,
}

impl SweepMember {
    pub fn resolved(&self) -> Option<&RunParameters> {
        self.params.as_ref().ok()
    }
}

/// A base configuration tree plus fixed overrides and sweep axes.
///
/// Expansion is the cartesian product of the axes, in declaration order,
/// with the last axis varying fastest.
#[derive(Debug, Clone)]
pub struct SweepSpec {
    base: Value,
    fixed: Vec<Override>,
    axes: Vec<Override>,
}

impl SweepSpec {
    pub fn new(base: Value) -> Self {
        Self {
            base,
            fixed: Vec::new(),
            axes: Vec::new(),
        }
    }

    /// Add an override; several values make it a sweep axis.
    pub fn with_override(mut self, o: Override) -> Self {
        if o.is_sweep() {
            self.axes.push(o);
        } else {
            self.fixed.push(o);
        }
        self
    }

    pub fn with_overrides(self, overrides: impl IntoIterator<Item = Override>) -> Self {
        overrides.into_iter().fold(self, Self::with_override)
    }

    pub fn is_sweep(&self) -> bool {
        !self.axes.is_empty()
    }

    /// Number of members `expand` will produce.
    pub fn len(&self) -> usize {
        self.axes.iter().map(|a| a.values.len()).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve every combination into `RunParameters`.
    ///
    /// A combination that does not deserialize becomes a member carrying its
    /// failure. Only a malformed override path or an empty product fails the
    /// whole expansion; member validation happens later, per member.
    pub fn expand(&self) -> sift_core::Result<Vec<SweepMember>> {
        let mut tree = self.base.clone();
        for o in &self.fixed {
            config::set_path(&mut tree, &o.path, o.values[0].clone())?;
        }

        let total = self.len();
        let width = total.saturating_sub(1).to_string().len().max(3);
        let mut members = Vec::with_capacity(total);
        for index in 0..total {
            let mut member_tree = tree.clone();
            let mut assignments = Vec::with_capacity(self.axes.len());
            let mut rest = index;
            // Last axis varies fastest.
            let mut picks = vec![0usize; self.axes.len()];
            for (slot, axis) in self.axes.iter().enumerate().rev() {
                picks[slot] = rest % axis.values.len();
                rest /= axis.values.len();
            }
            for (axis, pick) in self.axes.iter().zip(&picks) {
                let value = axis.values[*pick].clone();
                assignments.push(format!("{}={}", axis.path, render(&value)));
                config::set_path(&mut member_tree, &axis.path, value)?;
            }

            let params = config::resolve(&member_tree).map_err(|e| {
                let dataset = member_tree
                    .pointer("/preproc/dataset")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                MemberFailure::new(dataset, Stage::Preprocess, &e)
            });
            let raw_name = match &params {
                Ok(p) => p.name.as_str(),
                Err(_) => member_tree.get("name").and_then(Value::as_str).unwrap_or("run"),
            };
            let name = if self.is_sweep() {
                format!("{}_{:0width$}", safe_name(raw_name), index)
            } else {
                safe_name(raw_name)
            };
            members.push(SweepMember {
                name,
                assignments,
                params,
            });
        }

        if members.is_empty() {
            return Err(CurationError::invalid("sweep", "no members to run"));
        }
        Ok(members)
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn safe_name(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}
