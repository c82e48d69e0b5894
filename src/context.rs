use std::collections::HashMap;

use serde_json::Value;

/// Key under which the tenant id lives when the model does not configure one.
pub const DEFAULT_TENANT_KEY: &str = "tenant_id";
/// Key under which the user id lives when the model does not configure one.
pub const DEFAULT_USER_AUDIT_KEY: &str = "user_id";
/// Key holding the caller's roles, either a single string or a list.
pub const ROLES_KEY: &str = "roles";
/// Flag that disables soft-delete filtering for the whole request.
pub const INCLUDE_DELETED_KEY: &str = "include_deleted";

/// Per-request values supplied by the host: tenant id, user id, roles and
/// any ad-hoc claims referenced by auto-filter metadata. The core never
/// authenticates; it only reads this map.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    values: HashMap<String, Value>,
}

impl UserContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: HashMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// True when the key is present and holds boolean `true` (or the string
    /// `"true"`, which some hosts forward from headers).
    pub fn flag(&self, key: &str) -> bool {
        match self.values.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// The caller's roles. Hosts supply either a single string or a list of
    /// strings; both shapes are accepted, anything else is no roles.
    pub fn roles(&self) -> Vec<String> {
        match self.values.get(ROLES_KEY) {
            Some(Value::String(role)) => vec![role.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Case-insensitive role membership test.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles().iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roles_accepts_single_string() {
        let mut ctx = UserContext::new();
        ctx.set(ROLES_KEY, "Admin");
        assert_eq!(ctx.roles(), vec!["Admin".to_string()]);
        assert!(ctx.has_role("admin"));
    }

    #[test]
    fn roles_accepts_string_list() {
        let mut ctx = UserContext::new();
        ctx.set(ROLES_KEY, json!(["editor", "viewer"]));
        assert_eq!(ctx.roles().len(), 2);
        assert!(ctx.has_role("VIEWER"));
        assert!(!ctx.has_role("admin"));
    }

    #[test]
    fn roles_ignores_unexpected_shapes() {
        let mut ctx = UserContext::new();
        ctx.set(ROLES_KEY, json!({"role": "admin"}));
        assert!(ctx.roles().is_empty());
    }

    #[test]
    fn flag_reads_bool_and_string() {
        let mut ctx = UserContext::new();
        ctx.set(INCLUDE_DELETED_KEY, true);
        ctx.set("other", "TRUE");
        ctx.set("off", false);
        assert!(ctx.flag(INCLUDE_DELETED_KEY));
        assert!(ctx.flag("other"));
        assert!(!ctx.flag("off"));
        assert!(!ctx.flag("absent"));
    }
}
