use serde::{Deserialize, Serialize};

/// Account fields the core reads. The embedding application owns the full
/// user model; this is the slice that matters for provisioning.
#[derive(Debug, Clone, PartialEq)]
pub struct UserAccount {
    pub id: i64,
    pub username: String,
    /// CPU cores override, fractional allowed.
    pub cpu_limit: Option<f64>,
    /// Memory override, either plain MB ("15360") or suffixed ("15360m", "15g").
    pub memory_limit: Option<String>,
    pub storage_limit: Option<String>,
    pub gpu_access: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectiveLimits {
    pub cpu_cores: f64,
    pub memory_mb: i64,
    pub storage_mb: i64,
    pub gpu: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceDefaults {
    pub cpu_cores: f64,
    pub memory_mb: i64,
    pub storage_mb: i64,
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            cpu_cores: 4.0,
            memory_mb: 15360,
            storage_mb: 51200,
        }
    }
}

pub struct ResourcePolicy {
    defaults: ResourceDefaults,
}

impl ResourcePolicy {
    pub fn new(defaults: ResourceDefaults) -> Self {
        Self { defaults }
    }

    /// Resolve the limits actually applied to a user's containers.
    ///
    /// Never fails: an absent or invalid override falls back to the
    /// configured default with a warning. A misconfigured account must not
    /// block the creation path.
    pub fn effective_limits(&self, user: &UserAccount) -> EffectiveLimits {
        let cpu_cores = match user.cpu_limit {
            Some(cores) if cores > 0.0 && cores.is_finite() => cores,
            Some(cores) => {
                tracing::warn!(
                    user_id = user.id,
                    "Invalid cpu limit override {}, using default {}",
                    cores,
                    self.defaults.cpu_cores
                );
                self.defaults.cpu_cores
            }
            None => self.defaults.cpu_cores,
        };

        let memory_mb = self.resolve_mb(user.id, "memory", user.memory_limit.as_deref(), self.defaults.memory_mb);
        let storage_mb = self.resolve_mb(user.id, "storage", user.storage_limit.as_deref(), self.defaults.storage_mb);

        EffectiveLimits {
            cpu_cores,
            memory_mb,
            storage_mb,
            gpu: user.gpu_access,
        }
    }

    fn resolve_mb(&self, user_id: i64, field: &str, raw: Option<&str>, default_mb: i64) -> i64 {
        match raw {
            None => default_mb,
            Some(value) => match parse_memory_mb(value) {
                Some(mb) if mb > 0 => mb,
                _ => {
                    tracing::warn!(
                        user_id,
                        "Invalid {} limit override '{}', using default {} MB",
                        field,
                        value,
                        default_mb
                    );
                    default_mb
                }
            },
        }
    }
}

/// Parse a memory/storage size string into MB. Accepts a bare MB count
/// ("15360"), an "m"/"mb" suffix, or a "g"/"gb" suffix.
pub fn parse_memory_mb(raw: &str) -> Option<i64> {
    let value = raw.trim().to_ascii_lowercase();
    if value.is_empty() {
        return None;
    }

    let (digits, multiplier) = if let Some(stripped) = value.strip_suffix("mb") {
        (stripped, 1)
    } else if let Some(stripped) = value.strip_suffix("gb") {
        (stripped, 1024)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped, 1)
    } else if let Some(stripped) = value.strip_suffix('g') {
        (stripped, 1024)
    } else {
        (value.as_str(), 1)
    };

    digits.trim().parse::<i64>().ok().map(|n| n * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(cpu: Option<f64>, memory: Option<&str>, gpu: bool) -> UserAccount {
        UserAccount {
            id: 7,
            username: "ada".to_string(),
            cpu_limit: cpu,
            memory_limit: memory.map(|m| m.to_string()),
            storage_limit: None,
            gpu_access: gpu,
        }
    }

    #[test]
    fn test_overrides_applied_when_valid() {
        let policy = ResourcePolicy::new(ResourceDefaults::default());
        let limits = policy.effective_limits(&user(Some(2.5), Some("8192m"), true));

        assert_eq!(limits.cpu_cores, 2.5);
        assert_eq!(limits.memory_mb, 8192);
        assert_eq!(limits.storage_mb, 51200);
        assert!(limits.gpu);
    }

    #[test]
    fn test_absent_overrides_fall_back_to_defaults() {
        let policy = ResourcePolicy::new(ResourceDefaults::default());
        let limits = policy.effective_limits(&user(None, None, false));

        assert_eq!(limits.cpu_cores, 4.0);
        assert_eq!(limits.memory_mb, 15360);
        assert!(!limits.gpu);
    }

    #[test]
    fn test_invalid_overrides_fall_back_instead_of_failing() {
        let policy = ResourcePolicy::new(ResourceDefaults::default());

        let limits = policy.effective_limits(&user(Some(-1.0), Some("plenty"), false));
        assert_eq!(limits.cpu_cores, 4.0);
        assert_eq!(limits.memory_mb, 15360);

        let limits = policy.effective_limits(&user(Some(f64::NAN), Some("0m"), false));
        assert_eq!(limits.cpu_cores, 4.0);
        assert_eq!(limits.memory_mb, 15360);
    }

    #[test]
    fn test_parse_memory_mb_variants() {
        assert_eq!(parse_memory_mb("15360m"), Some(15360));
        assert_eq!(parse_memory_mb("15360mb"), Some(15360));
        assert_eq!(parse_memory_mb("15g"), Some(15360));
        assert_eq!(parse_memory_mb("2GB"), Some(2048));
        assert_eq!(parse_memory_mb("  1024  "), Some(1024));
        assert_eq!(parse_memory_mb(""), None);
        assert_eq!(parse_memory_mb("lots"), None);
    }
}
