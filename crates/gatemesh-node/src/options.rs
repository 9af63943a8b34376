//! Named option access for gates and servers.
//!
//! An [`OptionTable`] is an explicit map from option name to a typed
//! accessor pair (a getter rendering the current value and a validating
//! setter) built once at startup. Options are listed, read, and written
//! by name, with sets gated behind a per-option permission node.

use crate::permissions::Permissions;
use gatemesh_core::{MeshError, MeshResult};
use std::collections::BTreeMap;

type Getter<T> = Box<dyn Fn(&T) -> String + Send + Sync>;
type Setter<T> = Box<dyn Fn(&mut T, &str) -> MeshResult<()> + Send + Sync>;

pub struct OptionTable<T> {
    permission_prefix: String,
    options: BTreeMap<String, (Getter<T>, Setter<T>)>,
}

impl<T> OptionTable<T> {
    pub fn new(permission_prefix: impl Into<String>) -> Self {
        Self {
            permission_prefix: permission_prefix.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn register(
        mut self,
        name: &str,
        get: impl Fn(&T) -> String + Send + Sync + 'static,
        set: impl Fn(&mut T, &str) -> MeshResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.options
            .insert(name.to_string(), (Box::new(get), Box::new(set)));
        self
    }

    /// All option names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.options.keys().map(|k| k.as_str()).collect()
    }

    pub fn get(&self, target: &T, name: &str) -> MeshResult<String> {
        let (get, _) = self
            .options
            .get(name)
            .ok_or_else(|| MeshError::Validation(format!("unknown option '{name}'")))?;
        Ok(get(target))
    }

    /// Set an option after checking `<prefix>.<name>` for the actor.
    pub fn set(
        &self,
        permissions: &Permissions,
        actor: &str,
        target: &mut T,
        name: &str,
        value: &str,
    ) -> MeshResult<()> {
        let (_, set) = self
            .options
            .get(name)
            .ok_or_else(|| MeshError::Validation(format!("unknown option '{name}'")))?;
        permissions.require(actor, &format!("{}.{name}", self.permission_prefix))?;
        set(target, value)
    }
}

/// Parse helpers shared by option setters.
pub fn parse_bool(name: &str, value: &str) -> MeshResult<bool> {
    match value {
        "true" | "yes" | "on" => Ok(true),
        "false" | "no" | "off" => Ok(false),
        _ => Err(MeshError::Validation(format!(
            "{name} must be true or false"
        ))),
    }
}

pub fn parse_cost(name: &str, value: &str) -> MeshResult<f64> {
    let cost: f64 = value
        .parse()
        .map_err(|_| MeshError::Validation(format!("{name} must be a number")))?;
    if cost < 0.0 {
        return Err(MeshError::Validation(format!(
            "{name} must be at least 0"
        )));
    }
    Ok(cost)
}

pub fn parse_millis(name: &str, value: &str) -> MeshResult<u64> {
    value
        .parse()
        .map_err(|_| MeshError::Validation(format!("{name} must be a duration in milliseconds")))
}
