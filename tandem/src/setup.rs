use anyhow::{Context, Result};
use tandem_config::Config;
use tandem_statsd::MetricsClientConfig;

/// Validates that all values required to run are present.
pub fn check_config(config: &Config) -> Result<()> {
    config.validate().context(
        "tandem is not fully configured. Set an application id with --application-id, \
         TANDEM_APPLICATION_ID or `collector.application_id` in the config file.",
    )
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        tandem_log::info!("launching tandem without config folder");
    } else {
        tandem_log::info!(
            "launching tandem from config folder {}",
            config.path().display()
        );
    }

    match config.batch_url() {
        Ok(url) => tandem_log::info!("  collector: {url}"),
        Err(_) => tandem_log::info!("  collector: -"),
    }
    match config.cache_max_age() {
        Some(max_age) => tandem_log::info!("  cache max age: {}s", max_age.as_secs()),
        None => tandem_log::info!("  cache max age: -"),
    }
    tandem_log::info!("  log level: {}", config.logging().level);
}

/// Initialize the metric system.
pub fn init_metrics(config: &Config) -> Result<()> {
    let Some(host) = config.statsd_addr() else {
        return Ok(());
    };

    tandem_statsd::init(MetricsClientConfig {
        prefix: config.metrics_prefix(),
        host,
        default_tags: config.metrics_default_tags().clone(),
        default_sample_rate: config.metrics_sample_rate().into(),
    })
    .with_context(|| format!("failed to set up metrics for {host}"))?;

    Ok(())
}
