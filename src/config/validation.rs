use crate::config::types::{Config, Interval, RuleEntry, SeedEntry, Settings};
use crate::rules::Pattern;
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration file
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_settings(&config.session)?;
    validate_seeds(&config.seeds)?;
    validate_rules(&config.rules)?;
    Ok(())
}

/// Validates session settings
pub fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    if settings.concurrency < 1 {
        return Err(ConfigError::Validation(format!(
            "concurrency must be >= 1, got {}",
            settings.concurrency
        )));
    }

    if settings.tasks_size < 1 {
        return Err(ConfigError::Validation(format!(
            "tasks_size must be >= 1, got {}",
            settings.tasks_size
        )));
    }

    if let Interval::Range(min, max) = settings.interval {
        if min > max {
            return Err(ConfigError::Validation(format!(
                "interval range must be [min, max] with min <= max, got [{}, {}]",
                min, max
            )));
        }
    }

    if let Some(proxy) = &settings.request.proxy {
        Url::parse(proxy)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid proxy '{}': {}", proxy, e)))?;
    }

    Ok(())
}

/// Validates seed entries
fn validate_seeds(seeds: &[SeedEntry]) -> Result<(), ConfigError> {
    for seed in seeds {
        let url = Url::parse(&seed.url)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid seed URL '{}': {}", seed.url, e)))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::Validation(format!(
                "Seed URL '{}' must use HTTP or HTTPS",
                seed.url
            )));
        }

        if seed.target.is_some() && !seed.download {
            return Err(ConfigError::Validation(format!(
                "Seed '{}' has a target but is not a download",
                seed.url
            )));
        }
    }

    Ok(())
}

/// Validates rule entries: every rule needs a pattern that compiles
fn validate_rules(rules: &[RuleEntry]) -> Result<(), ConfigError> {
    for rule in rules {
        let pattern = rule.pattern.as_deref().ok_or(ConfigError::MissingPattern)?;
        Pattern::compile(pattern)?;

        if let Some(follow) = &rule.follow {
            Pattern::compile(follow)?;
        }
    }
    Ok(())
}
