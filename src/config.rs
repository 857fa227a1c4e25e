use axum::http::HeaderValue;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::rate_limit::AdmissionLimits;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "imagegen-gateway")]
#[command(about = "Rate-limited front end for a remote image generation API")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    // Base directory for generated images
    #[arg(long, env = "GENERATED_IMAGES_DIR", default_value = "generated_images")]
    pub images_dir: PathBuf,

    // Turn admission control on/off (off admits everything)
    #[arg(long, env = "RATE_LIMIT_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub rate_limit_enabled: bool,

    // Max requests per client per minute, 0 = unbounded
    #[arg(long, env = "RATE_LIMIT_PER_MINUTE", default_value_t = 10)]
    pub rate_limit_per_minute: u32,

    // Max requests per client per hour, 0 = unbounded
    #[arg(long, env = "RATE_LIMIT_PER_HOUR", default_value_t = 100)]
    pub rate_limit_per_hour: u32,

    // Seconds between rate limiter sweeps
    #[arg(long, env = "CLIENT_SWEEP_INTERVAL", default_value_t = 300)]
    pub client_sweep_interval: u64,

    // Retention in days
    #[arg(long, env = "MAX_IMAGE_AGE_DAYS", default_value_t = 30)]
    pub max_image_age_days: u32,

    // Day buckets searched when downloading without a date
    #[arg(long, env = "RESOLVE_SEARCH_DAYS", default_value_t = 7)]
    pub resolve_search_days: u32,

    // Seconds between "is a cleanup due?" checks
    #[arg(long, env = "CLEANUP_CHECK_INTERVAL", default_value_t = 3600)]
    pub cleanup_check_interval: u64,

    // Image generation API
    #[arg(long, env = "IMAGE_GENERATOR_URL", default_value = "https://pollinations.ai/p")]
    pub generator_url: String,

    // Upper bound on one generation, in seconds
    #[arg(long, env = "IMAGE_GENERATION_TIMEOUT", default_value_t = 120)]
    pub generation_timeout: u64,

    #[arg(long, env = "MAX_CONCURRENT_GENERATIONS", default_value_t = 5)]
    pub max_concurrent_generations: usize,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    // Answer cross-origin requests
    #[arg(long, env = "ENABLE_CORS", default_value_t = false, action = ArgAction::Set)]
    pub enable_cors: bool,

    // Comma separated; empty allows any origin when CORS is on
    #[arg(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    pub enabled: bool,
    pub limits: AdmissionLimits,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub base_dir: PathBuf,
    pub resolve_search_days: u32,
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub max_age_days: u32,
    pub check_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// `None` leaves CORS off. An empty list allows any origin.
    pub cors_origins: Option<Vec<HeaderValue>>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub admission: AdmissionSettings,
    pub store: StoreSettings,
    pub retention: RetentionSettings,
    pub generator: GeneratorSettings,
    pub http: HttpSettings,
}

fn bounded(limit: u32) -> Option<u32> {
    (limit > 0).then_some(limit)
}

fn positive(value: u64, name: &str) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
    }
    Ok(value)
}

impl Args {
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        let limits =
            AdmissionLimits::new(bounded(self.rate_limit_per_minute), bounded(self.rate_limit_per_hour))?;

        let sweep = positive(self.client_sweep_interval, "client-sweep-interval")?;
        let check = positive(self.cleanup_check_interval, "cleanup-check-interval")?;
        let timeout = positive(self.generation_timeout, "generation-timeout")?;
        positive(self.resolve_search_days.into(), "resolve-search-days")?;
        positive(self.max_image_age_days.into(), "max-image-age-days")?;
        positive(self.max_concurrent_generations as u64, "max-concurrent-generations")?;

        if !self.generator_url.starts_with("http") {
            return Err(ConfigError::Invalid(format!(
                "generator url must be http(s): {}",
                self.generator_url
            )));
        }

        let cors_origins = if self.enable_cors {
            let origins = self
                .allowed_origins
                .iter()
                .map(|o| o.trim())
                .filter(|o| !o.is_empty())
                .map(|o| {
                    HeaderValue::from_str(o)
                        .map_err(|_| ConfigError::Invalid(format!("invalid allowed origin: {o}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Some(origins)
        } else {
            None
        };

        Ok(Settings {
            port: self.port,
            admission: AdmissionSettings {
                enabled: self.rate_limit_enabled,
                limits,
                sweep_interval: Duration::from_secs(sweep),
            },
            store: StoreSettings {
                base_dir: self.images_dir.clone(),
                resolve_search_days: self.resolve_search_days,
            },
            retention: RetentionSettings {
                max_age_days: self.max_image_age_days,
                check_interval: Duration::from_secs(check),
            },
            generator: GeneratorSettings {
                base_url: self.generator_url.trim_end_matches('/').to_string(),
                timeout: Duration::from_secs(timeout),
                max_concurrent: self.max_concurrent_generations,
            },
            http: HttpSettings { cors_origins },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("imagegen-gateway").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_validate() {
        let settings = parse(&[]).validate().unwrap();
        assert!(settings.admission.enabled);
        assert_eq!(settings.admission.limits.per_minute(), Some(10));
        assert_eq!(settings.admission.limits.per_hour(), Some(100));
        assert_eq!(settings.admission.sweep_interval, Duration::from_secs(300));
        assert_eq!(settings.store.resolve_search_days, 7);
        assert_eq!(settings.retention.max_age_days, 30);
    }

    #[test]
    fn zero_means_unbounded() {
        let settings = parse(&["--rate-limit-per-hour", "0"]).validate().unwrap();
        assert_eq!(settings.admission.limits.per_hour(), None);
    }

    #[test]
    fn disable_flag_takes_value() {
        let settings = parse(&["--rate-limit-enabled", "false"]).validate().unwrap();
        assert!(!settings.admission.enabled);
    }

    #[test]
    fn cors_off_unless_enabled() {
        assert!(parse(&[]).validate().unwrap().http.cors_origins.is_none());

        let settings = parse(&["--enable-cors", "true"]).validate().unwrap();
        assert_eq!(settings.http.cors_origins, Some(Vec::new()));

        let settings = parse(&[
            "--enable-cors",
            "true",
            "--allowed-origins",
            "https://a.example, https://b.example",
        ])
        .validate()
        .unwrap();
        let origins = settings.http.cors_origins.unwrap();
        assert_eq!(origins, ["https://a.example", "https://b.example"]);
    }

    #[test]
    fn out_of_range_rejected() {
        assert!(parse(&["--rate-limit-per-minute", "500"]).validate().is_err());
        assert!(parse(&["--client-sweep-interval", "0"]).validate().is_err());
        assert!(parse(&["--resolve-search-days", "0"]).validate().is_err());
        assert!(parse(&["--generator-url", "ftp://x"]).validate().is_err());
    }
}
