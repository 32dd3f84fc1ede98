//! Subscriber setup driven by the `log` section of a [`ChdrLinkConfig`].

use crate::config::{ChdrLinkConfig, LogFormat, LogSection};

/// Install a stderr subscriber as described by `section`.
///
/// Returns `false` if a global subscriber was already set; that one stays
/// in place.
pub fn init_logging(section: &LogSection) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(section.level.level_filter())
        .with_ansi(false)
        .with_target(section.with_target)
        .with_thread_names(true);

    match section.format {
        LogFormat::Text => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    }
}

impl ChdrLinkConfig {
    /// Install the subscriber described by [`ChdrLinkConfig::log`].
    pub fn init_logging(&self) -> bool {
        init_logging(&self.log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_from_config_once() {
        let config = ChdrLinkConfig::from_json_str(r#"{ "log": { "format": "json", "level": "trace" } }"#)
            .expect("config should parse");
        config.init_logging();
        assert!(!config.init_logging(), "second install should keep the first subscriber");
        tracing::trace!(epid = config.local_epid, "logging initialised");
    }
}
