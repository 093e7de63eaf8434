use crate::config::{Config, SCHEMA_VERSION};
use crate::error::{QuarryError, Result, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_storage(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_bm25(config, &mut errors);
        Self::validate_fusion(config, &mut errors);
        Self::validate_cache(config, &mut errors);
        Self::validate_session(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(QuarryError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != SCHEMA_VERSION {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_storage(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.storage.data_dir.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.data_dir",
                "Data directory cannot be empty",
            ));
        }
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.retrieval.vector_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "retrieval.vector_timeout_ms",
                "Vector timeout must be greater than 0",
            ));
        }

        if config.retrieval.retry_attempts > 10 {
            errors.push(ValidationError::new(
                "retrieval.retry_attempts",
                format!(
                    "Retry attempts must be at most 10, got {}",
                    config.retrieval.retry_attempts
                ),
            ));
        }
    }

    fn validate_bm25(config: &Config, errors: &mut Vec<ValidationError>) {
        let k1 = config.bm25.k1;
        if !k1.is_finite() || k1 <= 0.0 {
            errors.push(ValidationError::new(
                "bm25.k1",
                format!("k1 must be a positive number, got {}", k1),
            ));
        }

        let b = config.bm25.b;
        if !(0.0..=1.0).contains(&b) {
            errors.push(ValidationError::new(
                "bm25.b",
                format!("b must be between 0.0 and 1.0, got {}", b),
            ));
        }

        if config.bm25.min_token_len == 0 {
            errors.push(ValidationError::new(
                "bm25.min_token_len",
                "Minimum token length must be greater than 0",
            ));
        }
    }

    fn validate_fusion(config: &Config, errors: &mut Vec<ValidationError>) {
        let weight = config.fusion.weight_lexical;
        if !(0.0..=1.0).contains(&weight) {
            errors.push(ValidationError::new(
                "fusion.weight_lexical",
                format!("Lexical weight must be between 0.0 and 1.0, got {}", weight),
            ));
        }

        let k = config.fusion.k_constant;
        if !k.is_finite() || k <= 0.0 {
            errors.push(ValidationError::new(
                "fusion.k_constant",
                format!("RRF constant must be a positive number, got {}", k),
            ));
        }
    }

    fn validate_cache(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.cache.l1_capacity == 0 {
            errors.push(ValidationError::new(
                "cache.l1_capacity",
                "L1 capacity must be greater than 0",
            ));
        }

        if config.cache.l2_enabled && config.cache.l2_capacity == 0 {
            errors.push(ValidationError::new(
                "cache.l2_capacity",
                "L2 capacity must be greater than 0 when L2 is enabled",
            ));
        }
    }

    fn validate_session(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.session.idle_timeout_seconds == 0 {
            errors.push(ValidationError::new(
                "session.idle_timeout_seconds",
                "Idle timeout must be greater than 0",
            ));
        }

        if config.session.sweep_interval_seconds == 0 {
            errors.push(ValidationError::new(
                "session.sweep_interval_seconds",
                "Sweep interval must be greater than 0",
            ));
        }
    }
}
