//! Composite key derivation
//!
//! Every key sent to the remote tier has the shape
//! `{tenant}:{group}:{key}`, or `{group}:{key}` when no tenant is set.
//! This prefix is the only thing keeping tenants and groups apart in a
//! shared remote store. A group or key that itself contains `:` can collide
//! with another triple.

/// Derives composite keys for one tenant context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyNamespacer {
    prefix: String,
}

impl KeyNamespacer {
    /// Namespacer for the given tenant. `None` means a single-tenant deployment.
    pub fn new(tenant: Option<&str>) -> Self {
        let prefix = match tenant {
            Some(t) => format!("{}:", t),
            None => String::new(),
        };
        Self { prefix }
    }

    /// The tenant prefix prepended to every key (empty without a tenant).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build the composite key for `key` in `group`.
    pub fn derive(&self, key: &str, group: &str) -> String {
        let mut out = String::with_capacity(self.prefix.len() + group.len() + key.len() + 1);
        out.push_str(&self.prefix);
        out.push_str(group);
        out.push(':');
        out.push_str(key);
        out
    }
}
