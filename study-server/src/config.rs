use study_core::StudyConfig;

/// Prefix of the environment variables read into the config store.
pub const ENV_PREFIX: &str = "STUDY__";

/// Defaults, then `.env`, then the process environment.
pub fn load() -> StudyConfig {
    // a missing .env file is normal outside development
    let _ = dotenvy::dotenv();

    let mut config = defaults();
    config.load_env(ENV_PREFIX);
    config
}

pub fn defaults() -> StudyConfig {
    let mut config = StudyConfig::with_defaults();
    config.set("http.host", "127.0.0.1");
    config.set("http.port", "3036");
    config.set("pg.pool_size", "5");
    config
}
