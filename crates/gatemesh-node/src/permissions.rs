//! Permission-string evaluation boundary.
//!
//! Rules are matched in order; the first hit wins. A rule node ending in
//! `*` matches any longer permission with that prefix. With no matching
//! rule the check passes; a node with no rules configured is permissive.

use gatemesh_core::{MeshError, MeshResult};

#[derive(Debug, Clone)]
pub struct PermissionRule {
    /// `None` applies to every actor.
    pub actor: Option<String>,
    pub node: String,
    pub allow: bool,
}

#[derive(Debug, Default)]
pub struct Permissions {
    rules: Vec<PermissionRule>,
}

impl Permissions {
    pub fn new(rules: Vec<PermissionRule>) -> Self {
        Self { rules }
    }

    fn node_matches(pattern: &str, node: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => node.starts_with(prefix),
            None => pattern == node,
        }
    }

    pub fn allows(&self, actor: &str, node: &str) -> bool {
        for rule in &self.rules {
            if let Some(ref rule_actor) = rule.actor {
                if rule_actor != actor {
                    continue;
                }
            }
            if Self::node_matches(&rule.node, node) {
                return rule.allow;
            }
        }
        true
    }

    /// Fail with a `Validation` error unless `actor` holds `node`.
    pub fn require(&self, actor: &str, node: &str) -> MeshResult<()> {
        if self.allows(actor, node) {
            Ok(())
        } else {
            Err(MeshError::Validation(format!(
                "you don't have permission '{node}'"
            )))
        }
    }
}
