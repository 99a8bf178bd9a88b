use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Layer as _};

/// Install the global subscriber. `LOG_LEVEL` feeds the filter (any
/// `EnvFilter` directive string works); `LOG_FORMAT=json` switches to
/// flattened JSON lines for log shippers.
pub fn init(level: &str, format: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("fallback filter must parse");

    let format_layer = if format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(format_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("install tracing subscriber: {err}"))?;
    Ok(())
}
