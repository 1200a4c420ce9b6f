use std::sync::Once;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogLevel;
use crate::error::{Error, Result};

static INIT: Once = Once::new();

/// Initialize logging system
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = init_logging_inner(level);
    });
    result
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    let tracing_level = match level {
        LogLevel::Silent => return Ok(()),
        LogLevel::Error => Level::ERROR,
        LogLevel::Warning => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
    };

    fn directive(d: &str) -> Result<tracing_subscriber::filter::Directive> {
        d.parse()
            .map_err(|e| Error::config(format!("invalid log directive: {e}")))
    }
    let filter = EnvFilter::from_default_env()
        .add_directive(directive(&format!("burrow_core={tracing_level}"))?)
        .add_directive(directive(&format!("burrow_doh={tracing_level}"))?)
        .add_directive(directive(&format!("burrow_net={tracing_level}"))?)
        .add_directive(directive("tokio=warn")?)
        .add_directive(directive("h2=warn")?)
        .add_directive(directive("rustls=warn")?);

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact();

    // Use try_init so an embedder-installed subscriber wins quietly.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
    Ok(())
}
