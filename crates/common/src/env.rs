use std::{
    env,
    fmt::Debug,
    io,
    str::FromStr,
};

use tracing_subscriber::{
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer,
};

/// Read a configuration value from the environment, falling back to the
/// given default when the variable is unset or unparsable.
pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let var_s = match env::var(name) {
        Ok(s) => s,
        Err(env::VarError::NotPresent) => return default,
        Err(env::VarError::NotUnicode(..)) => {
            tracing::warn!("Invalid value for {name}, falling back to {default:?}.");
            return default;
        },
    };
    match T::from_str(&var_s) {
        Ok(v) => {
            tracing::info!("Overriding {name} to {v:?} from environment");
            v
        },
        Err(e) => {
            tracing::warn!("Invalid value {var_s} for {name}, falling back to {default:?}: {e:?}");
            default
        },
    }
}

/// Call this from the server binary at startup.
pub fn config_service() {
    config_tracing(io::stdout, tracing::Level::INFO)
}

/// Call this from tools and tests at startup.
pub fn config_tool() {
    config_tracing(io::stderr, tracing::Level::ERROR)
}

fn config_tracing<W>(writer: W, default_level: tracing::Level)
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_filter(filter);
    // Ignore a second init in tests that share a process.
    let _ = tracing_subscriber::registry().with(layer).try_init();
}
