use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use chrono::Duration as ChronoDuration;

use crate::workflows::admissions::{
    AdmissionsSettings, FeeSchedule, Money, PaymentSettings, RetentionSettings, StripeConfig,
    WebhookVerifier, MAX_GRACE_PERIOD_DAYS,
};

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub storage: StorageConfig,
    pub fees: FeeSchedule,
    pub retention: RetentionSettings,
    pub payments: PaymentConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let storage = StorageConfig {
            database_path: optional("ADMISSIONS_DATABASE_PATH").map(PathBuf::from),
            document_root: PathBuf::from(
                optional("ADMISSIONS_DOCUMENT_ROOT")
                    .unwrap_or_else(|| "./data/documents".to_string()),
            ),
        };

        let default_fee = match env::var("ADMISSIONS_DEFAULT_FEE") {
            Ok(raw) if raw.trim().is_empty() => None,
            Ok(raw) => Some(parse_money("ADMISSIONS_DEFAULT_FEE", &raw)?),
            Err(_) => Some(Money::from_cents(150_000)),
        };
        let fees = parse_program_fees(
            FeeSchedule::new(default_fee),
            &env::var("ADMISSIONS_PROGRAM_FEES").unwrap_or_default(),
        )?;

        let retention = RetentionSettings {
            grace_period_days: bounded(
                "RETENTION_GRACE_PERIOD_DAYS",
                7,
                0..=MAX_GRACE_PERIOD_DAYS,
            )?,
            sweep_interval: Duration::from_secs(bounded(
                "RETENTION_SWEEP_INTERVAL_SECS",
                86_400,
                60..=31_536_000,
            )?),
        };

        let payments = PaymentConfig {
            api_base_url: optional("PAYMENT_API_BASE_URL")
                .unwrap_or_else(|| "https://api.stripe.com".to_string()),
            api_key: optional("PAYMENT_API_KEY"),
            api_version: optional("PAYMENT_API_VERSION"),
            webhook_secret: env::var("PAYMENT_WEBHOOK_SECRET").unwrap_or_default(),
            webhook_tolerance_secs: bounded("PAYMENT_WEBHOOK_TOLERANCE_SECS", 300, 1..=86_400)?,
            currency: optional("PAYMENT_CURRENCY").unwrap_or_else(|| "mxn".to_string()),
            success_url: optional("PAYMENT_SUCCESS_URL").unwrap_or_else(|| {
                format!("http://{host}:{port}/enrollment/payment/success")
            }),
            cancel_url: optional("PAYMENT_CANCEL_URL")
                .unwrap_or_else(|| format!("http://{host}:{port}/enrollment/payment/cancel")),
            // Checkout sessions must expire between 30 minutes and 24 hours after creation.
            session_ttl_minutes: bounded("PAYMENT_SESSION_TTL_MINUTES", 60, 30..=1_440)?,
            probe_timeout_ms: bounded("PAYMENT_PROBE_TIMEOUT_MS", 3_000, 1..=60_000)?,
        };

        if environment == AppEnvironment::Production && payments.api_key.is_none() {
            return Err(ConfigError::Missing {
                variable: "PAYMENT_API_KEY",
            });
        }

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            storage,
            fees,
            retention,
            payments,
        })
    }

    /// Component settings for [`crate::workflows::admissions::AdmissionsService`].
    pub fn admissions_settings(&self) -> AdmissionsSettings {
        AdmissionsSettings {
            fees: self.fees.clone(),
            payments: self.payments.settings(),
            webhook: self.payments.verifier(),
            retention: self.retention,
            expose_internal_errors: self.environment == AppEnvironment::Development,
        }
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Where records and uploaded files live.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// SQLite database file; the in-memory store is used when unset.
    pub database_path: Option<PathBuf>,
    pub document_root: PathBuf,
}

/// Payment gateway credentials and checkout defaults.
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub api_base_url: String,
    pub api_key: Option<String>,
    pub api_version: Option<String>,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: i64,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
    pub session_ttl_minutes: i64,
    pub probe_timeout_ms: u64,
}

impl PaymentConfig {
    pub fn settings(&self) -> PaymentSettings {
        PaymentSettings {
            currency: self.currency.clone(),
            success_url: self.success_url.clone(),
            cancel_url: self.cancel_url.clone(),
            session_ttl: ChronoDuration::minutes(self.session_ttl_minutes),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }

    pub fn verifier(&self) -> WebhookVerifier {
        WebhookVerifier::new(
            self.webhook_secret.clone(),
            ChronoDuration::seconds(self.webhook_tolerance_secs),
            self.api_version.clone(),
        )
    }

    /// Gateway connection settings, when a key is configured.
    pub fn stripe(&self) -> Option<StripeConfig> {
        self.api_key.as_ref().map(|api_key| StripeConfig {
            base_url: self.api_base_url.clone(),
            api_key: api_key.clone(),
            api_version: self.api_version.clone(),
            timeout: Duration::from_secs(10),
        })
    }
}

fn optional(variable: &str) -> Option<String> {
    env::var(variable)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn number<T: std::str::FromStr>(variable: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(variable) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { variable, value: raw }),
        None => Ok(default),
    }
}

fn bounded<T>(
    variable: &'static str,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + fmt::Display,
{
    let value = number(variable, default)?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            variable,
            value: value.to_string(),
            min: range.start().to_string(),
            max: range.end().to_string(),
        })
    }
}

fn parse_money(variable: &'static str, raw: &str) -> Result<Money, ConfigError> {
    Money::parse(raw).ok_or_else(|| ConfigError::InvalidNumber {
        variable,
        value: raw.to_string(),
    })
}

/// `PROGRAM=AMOUNT,PROGRAM=AMOUNT`
fn parse_program_fees(mut fees: FeeSchedule, raw: &str) -> Result<FeeSchedule, ConfigError> {
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let (program, amount) = entry
            .split_once('=')
            .map(|(program, amount)| (program.trim(), amount.trim()))
            .filter(|(program, _)| !program.is_empty())
            .ok_or_else(|| ConfigError::InvalidFeeEntry {
                entry: entry.to_string(),
            })?;
        let amount = Money::parse(amount).ok_or_else(|| ConfigError::InvalidFeeEntry {
            entry: entry.to_string(),
        })?;
        fees = fees.with_program(program, amount);
    }
    Ok(fees)
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidNumber { variable: &'static str, value: String },
    OutOfRange {
        variable: &'static str,
        value: String,
        min: String,
        max: String,
    },
    InvalidFeeEntry { entry: String },
    Missing { variable: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidNumber { variable, value } => {
                write!(f, "{variable} has an invalid value '{value}'")
            }
            ConfigError::OutOfRange {
                variable,
                value,
                min,
                max,
            } => write!(f, "{variable} must be between {min} and {max}, got {value}"),
            ConfigError::InvalidFeeEntry { entry } => write!(
                f,
                "ADMISSIONS_PROGRAM_FEES entry '{entry}' must look like PROGRAM=AMOUNT"
            ),
            ConfigError::Missing { variable } => {
                write!(f, "{variable} is required in production")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            _ => None,
        }
    }
}

/// Serializes tests that read or mutate process environment variables.
#[cfg(test)]
pub(crate) fn env_guard() -> &'static std::sync::Mutex<()> {
    static GUARD: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();
    GUARD.get_or_init(|| std::sync::Mutex::new(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    const VARIABLES: &[&str] = &[
        "APP_ENV",
        "APP_HOST",
        "APP_PORT",
        "APP_LOG_LEVEL",
        "ADMISSIONS_DATABASE_PATH",
        "ADMISSIONS_DOCUMENT_ROOT",
        "ADMISSIONS_DEFAULT_FEE",
        "ADMISSIONS_PROGRAM_FEES",
        "RETENTION_GRACE_PERIOD_DAYS",
        "RETENTION_SWEEP_INTERVAL_SECS",
        "PAYMENT_API_BASE_URL",
        "PAYMENT_API_KEY",
        "PAYMENT_API_VERSION",
        "PAYMENT_WEBHOOK_SECRET",
        "PAYMENT_WEBHOOK_TOLERANCE_SECS",
        "PAYMENT_CURRENCY",
        "PAYMENT_SUCCESS_URL",
        "PAYMENT_CANCEL_URL",
        "PAYMENT_SESSION_TTL_MINUTES",
        "PAYMENT_PROBE_TIMEOUT_MS",
    ];

    fn reset_env() {
        for variable in VARIABLES {
            env::remove_var(variable);
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().unwrap_or_else(|p| p.into_inner());
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert!(config.storage.database_path.is_none());
        assert_eq!(config.fees.amount_for("any"), Some(Money::from_cents(150_000)));
        assert_eq!(config.retention.grace_period_days, 7);
        assert_eq!(config.retention.sweep_interval, Duration::from_secs(86_400));
        assert_eq!(config.payments.currency, "mxn");
        assert!(config.payments.stripe().is_none());
        assert!(config.admissions_settings().expose_internal_errors);
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().unwrap_or_else(|p| p.into_inner());
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
    }

    #[test]
    fn program_fees_override_the_default() {
        let _lock = env_guard().lock().unwrap_or_else(|p| p.into_inner());
        reset_env();
        env::set_var("ADMISSIONS_DEFAULT_FEE", "");
        env::set_var("ADMISSIONS_PROGRAM_FEES", "ING-SIS=2100.50, MED=3000");
        let config = AppConfig::load().expect("config loads");
        assert_eq!(config.fees.amount_for("ING-SIS"), Some(Money::from_cents(210_050)));
        assert_eq!(config.fees.amount_for("MED"), Some(Money::from_cents(300_000)));
        assert_eq!(config.fees.amount_for("ARQ"), None);
        reset_env();
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let _lock = env_guard().lock().unwrap_or_else(|p| p.into_inner());
        reset_env();
        env::set_var("RETENTION_GRACE_PERIOD_DAYS", "a week");
        let err = AppConfig::load().expect_err("grace period must be numeric");
        assert!(err.to_string().contains("RETENTION_GRACE_PERIOD_DAYS"));

        reset_env();
        env::set_var("ADMISSIONS_PROGRAM_FEES", "ING-SIS");
        let err = AppConfig::load().expect_err("fee entry needs an amount");
        assert!(matches!(err, ConfigError::InvalidFeeEntry { .. }));
        reset_env();
    }

    #[test]
    fn numeric_settings_must_fall_within_bounds() {
        let _lock = env_guard().lock().unwrap_or_else(|p| p.into_inner());
        for (variable, value) in [
            ("RETENTION_GRACE_PERIOD_DAYS", "4294967295"),
            ("RETENTION_SWEEP_INTERVAL_SECS", "0"),
            ("PAYMENT_WEBHOOK_TOLERANCE_SECS", "-5"),
            ("PAYMENT_WEBHOOK_TOLERANCE_SECS", "9223372036854775807"),
            ("PAYMENT_SESSION_TTL_MINUTES", "-60"),
            ("PAYMENT_SESSION_TTL_MINUTES", "9223372036854775807"),
            ("PAYMENT_PROBE_TIMEOUT_MS", "0"),
        ] {
            reset_env();
            env::set_var(variable, value);
            let err = AppConfig::load().expect_err("value out of range");
            assert!(
                matches!(err, ConfigError::OutOfRange { variable: named, .. } if named == variable),
                "{variable}={value} gave {err}"
            );
        }

        reset_env();
        env::set_var("RETENTION_GRACE_PERIOD_DAYS", "0");
        env::set_var("PAYMENT_SESSION_TTL_MINUTES", "1440");
        let config = AppConfig::load().expect("bounds are inclusive");
        assert_eq!(config.retention.grace_period_days, 0);
        assert_eq!(
            config.payments.settings().session_ttl,
            ChronoDuration::minutes(1_440)
        );
        reset_env();
    }

    #[test]
    fn production_requires_a_gateway_key() {
        let _lock = env_guard().lock().unwrap_or_else(|p| p.into_inner());
        reset_env();
        env::set_var("APP_ENV", "production");
        let err = AppConfig::load().expect_err("production needs PAYMENT_API_KEY");
        assert!(matches!(err, ConfigError::Missing { variable: "PAYMENT_API_KEY" }));

        env::set_var("PAYMENT_API_KEY", "sk_live_example");
        let config = AppConfig::load().expect("config loads with key");
        assert!(!config.admissions_settings().expose_internal_errors);
        assert_eq!(
            config.payments.stripe().map(|stripe| stripe.api_key),
            Some("sk_live_example".to_string())
        );
        reset_env();
    }
}
