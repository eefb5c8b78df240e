use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::Subscriber;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer as _, Registry,
    filter::ParseError,
    fmt,
    layer::SubscriberExt as _,
    reload,
    util::SubscriberInitExt as _,
};

/// Registers the global subscriber with stdout logging.
///
/// `directives` follows the `RUST_LOG` syntax; the returned handle allows
/// changing the filter at runtime.
pub fn setup_global_subscriber(directives: &str) -> Result<FilterReloadHandle> {
    let (filter, reload_handle) =
        try_filter(directives).context("Failed to parse log directives")?;

    let subscriber = Registry::default().with(fmt::layer().with_filter(filter));

    init(subscriber)?;

    Ok(reload_handle)
}

fn init(subscriber: impl Subscriber + Send + Sync + 'static) -> Result<()> {
    subscriber
        .try_init()
        .context("Could not set global default subscriber")?;
    LogTracer::init().context("Failed to init LogTracer")?;

    Ok(())
}

/// Constructs an opinionated [`EnvFilter`] with some crates already silenced.
pub fn try_filter<S>(
    directives: &str,
) -> Result<(reload::Layer<EnvFilter, S>, FilterReloadHandle), ParseError>
where
    S: 'static,
{
    let env_filter = parse_filter(directives)?;
    let (layer, reload_handle) = reload::Layer::new(env_filter);

    let handle = FilterReloadHandle {
        inner: Arc::new(move |new| {
            let new_filter = parse_filter(&new)?;
            reload_handle
                .reload(new_filter)
                .map_err(|e| anyhow::anyhow!(e))?;

            Ok(())
        }),
    };

    Ok((layer, handle))
}

fn parse_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    /// Silences chatty dependencies unless the user explicitly opts in.
    const IRRELEVANT_CRATES: &[&str] = &["hyper", "rustls", "russh", "h2"];

    let mut filter = EnvFilter::default();

    for directive in IRRELEVANT_CRATES
        .iter()
        .map(|c| format!("{c}=warn").parse())
        .collect::<Result<Vec<_>, ParseError>>()?
    {
        filter = filter.add_directive(directive);
    }

    for directive in directives.split(',').filter(|d| !d.is_empty()) {
        filter = filter.add_directive(directive.parse()?);
    }

    Ok(filter)
}

/// Changes the log filter of a running subscriber.
#[derive(Clone)]
pub struct FilterReloadHandle {
    inner: Arc<dyn Fn(String) -> Result<()> + Send + Sync>,
}

impl FilterReloadHandle {
    pub fn reload(&self, new_directives: &str) -> Result<()> {
        (self.inner)(new_directives.to_owned())
    }
}

impl std::fmt::Debug for FilterReloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterReloadHandle").finish_non_exhaustive()
    }
}
