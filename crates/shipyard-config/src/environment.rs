//! Deployment environment resolution.

use crate::{ConfigError, ConfigResult, VariableContext};
use shipyard_core::resource::DeployEnvironment;

/// Variables consulted, in order, when the topology omits the account.
pub const ACCOUNT_VARS: [&str; 2] = ["SHIPYARD_ACCOUNT", "CDK_DEFAULT_ACCOUNT"];
/// Variables consulted, in order, when the topology omits the region.
pub const REGION_VARS: [&str; 2] = ["SHIPYARD_REGION", "CDK_DEFAULT_REGION"];

/// Resolve account and region, preferring explicit values over the
/// environment variables in `vars`.
pub fn resolve_environment(
    account: Option<String>,
    region: Option<String>,
    vars: &VariableContext,
) -> ConfigResult<DeployEnvironment> {
    let from_env = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| vars.env.get(*name).filter(|v| !v.is_empty()).cloned())
    };

    let account = account
        .or_else(|| from_env(&ACCOUNT_VARS))
        .ok_or_else(|| {
            ConfigError::MissingField(format!(
                "environment account (or {})",
                ACCOUNT_VARS.join(" / ")
            ))
        })?;
    let region = region
        .or_else(|| from_env(&REGION_VARS))
        .ok_or_else(|| {
            ConfigError::MissingField(format!(
                "environment region (or {})",
                REGION_VARS.join(" / ")
            ))
        })?;

    if !account.chars().all(|c| c.is_ascii_digit()) {
        return Err(ConfigError::InvalidValue {
            field: "account".to_string(),
            message: format!("expected a numeric account id, got '{}'", account),
        });
    }

    Ok(DeployEnvironment::new(account, region))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VariableContextBuilder;

    #[test]
    fn test_explicit_values_win() {
        let vars = VariableContextBuilder::new()
            .with_env("CDK_DEFAULT_ACCOUNT", "111")
            .with_env("CDK_DEFAULT_REGION", "eu-west-1")
            .build();
        let env = resolve_environment(Some("222".into()), Some("us-east-1".into()), &vars).unwrap();
        assert_eq!(env, DeployEnvironment::new("222", "us-east-1"));
    }

    #[test]
    fn test_falls_back_in_order() {
        let vars = VariableContextBuilder::new()
            .with_env("SHIPYARD_ACCOUNT", "333")
            .with_env("CDK_DEFAULT_ACCOUNT", "111")
            .with_env("CDK_DEFAULT_REGION", "ap-southeast-1")
            .build();
        let env = resolve_environment(None, None, &vars).unwrap();
        assert_eq!(env, DeployEnvironment::new("333", "ap-southeast-1"));
    }

    #[test]
    fn test_missing_account_is_error() {
        let vars = VariableContextBuilder::new()
            .with_env("CDK_DEFAULT_REGION", "ap-southeast-1")
            .build();
        assert!(matches!(
            resolve_environment(None, None, &vars),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_non_numeric_account_rejected() {
        let vars = VariableContext::new();
        assert!(matches!(
            resolve_environment(Some("abc".into()), Some("r".into()), &vars),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
