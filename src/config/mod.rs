mod settings;

#[cfg(test)]
mod tests;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{LoggingSettings, QueueSettings, Settings, StoreSettings};

/// Loads the configuration from `config/default` (if present) and `COURIER_*`
/// environment variables, then fills anything missing from the defaults.
///
/// Nested keys use a double underscore: `COURIER_QUEUE__GROUP=billing`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("COURIER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge(Settings::default()))
}
