//! Debug tree dump (part of the platform-hook surface in §6).
//!
//! [`DebugRecord`] is a snapshot, not a live view — it is built once via
//! [`DebugRecord::from_operation`] and then rendered or inspected. Building
//! it walks dependencies and (for groups) children to a bounded depth so a
//! cyclic or pathologically deep graph can't make a debug dump hang.

use crate::operation::Operation;
use std::fmt::Write as _;

/// The maximum depth [`DebugRecord::from_operation`] will walk before
/// truncating with a placeholder child.
pub const MAX_DEPTH: usize = 12;

/// A point-in-time snapshot of an operation's shape, suitable for printing
/// or feeding to an external debug sink.
#[derive(Debug, Clone)]
pub struct DebugRecord {
    pub description: String,
    pub properties: Vec<(String, String)>,
    pub conditions: Vec<String>,
    pub dependencies: Vec<DebugRecord>,
    pub sub_operations: Vec<DebugRecord>,
    truncated: bool,
}

impl DebugRecord {
    /// Build a full snapshot of `operation`, descending into its
    /// dependencies up to [`MAX_DEPTH`].
    pub fn from_operation(operation: &Operation) -> Self {
        Self::build(operation, 0)
    }

    fn build(operation: &Operation, depth: usize) -> Self {
        let description = format!("{} ({})", operation.name(), operation.state());

        let properties = vec![
            ("id".to_string(), operation.id().to_string()),
            ("cancelled".to_string(), operation.is_cancelled().to_string()),
            ("errors".to_string(), operation.errors().len().to_string()),
        ];

        let conditions = operation
            .conditions()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        if depth >= MAX_DEPTH {
            return DebugRecord {
                description,
                properties,
                conditions,
                dependencies: Vec::new(),
                sub_operations: Vec::new(),
                truncated: true,
            };
        }

        let dependencies = operation
            .direct_dependencies()
            .iter()
            .map(|dep| Self::build(dep, depth + 1))
            .collect();

        DebugRecord {
            description,
            properties,
            conditions,
            dependencies,
            sub_operations: Vec::new(),
            truncated: false,
        }
    }

    /// Attach child records (e.g. a group's operations) to this record.
    pub fn with_sub_operations(mut self, sub_operations: Vec<DebugRecord>) -> Self {
        self.sub_operations = sub_operations;
        self
    }

    /// Render this record as an indented tree, depth-capped at
    /// [`MAX_DEPTH`].
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let _ = writeln!(out, "{indent}{}", self.description);
        for (key, value) in &self.properties {
            let _ = writeln!(out, "{indent}  {key}: {value}");
        }
        for condition in &self.conditions {
            let _ = writeln!(out, "{indent}  condition: {condition}");
        }
        if self.truncated {
            let _ = writeln!(out, "{indent}  ...(depth limit reached)");
            return;
        }
        for dep in &self.dependencies {
            let _ = writeln!(out, "{indent}  depends on:");
            dep.render_into(out, depth + 2);
        }
        for sub in &self.sub_operations {
            sub.render_into(out, depth + 1);
        }
    }
}
