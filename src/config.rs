use ::config::{Config, ConfigError};

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

// Like get_namespaced_string, but a missing key is `None` and any other lookup
// failure is an error.
pub(crate) fn get_namespaced_optional_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<Option<String>, ConfigError> {
    match get_namespaced_string(config, name, key) {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}
