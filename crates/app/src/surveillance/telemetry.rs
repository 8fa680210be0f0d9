//! Telemetry helpers for tracing spans, Prometheus metrics, and optional Chrome traces.

use std::{io, path::Path, sync::OnceLock, thread, time::Duration};

use anyhow::{Context, Result, anyhow};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{Dispatch, dispatcher::DefaultGuard};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

use crate::surveillance::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Keeps the installed subscriber (when thread-scoped) and the Chrome trace
/// writer alive.
pub(crate) struct TelemetryGuard {
    _default_guard: Option<DefaultGuard>,
    _chrome_guard: Option<tracing_chrome::FlushGuard>,
}

struct Telemetry {
    dispatch: Dispatch,
    chrome_guard: Option<tracing_chrome::FlushGuard>,
    chrome_error: Option<(std::path::PathBuf, io::Error)>,
}

/// Install the global metrics recorder once and return the Prometheus handle.
pub(crate) fn init_metrics_recorder() -> Result<&'static PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle);
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|_| anyhow!("metrics recorder already installed"))?;

    let upkeep_handle = handle.clone();
    spawn_thread("prometheus-upkeep", move || {
        loop {
            thread::sleep(Duration::from_secs(5));
            upkeep_handle.run_upkeep();
        }
    })
    .context("failed to spawn prometheus upkeep thread")?;

    Ok(PROM_HANDLE.get_or_init(|| handle))
}

/// Access the Prometheus handle when already initialised.
pub(crate) fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Install the tracing subscriber process-wide, so threads started by other
/// runtimes (the HTTP workers) log too. If a global subscriber already exists
/// the new one is scoped to the current thread and everything it spawns
/// through [`spawn_thread`].
pub(crate) fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let Telemetry {
        dispatch,
        chrome_guard,
        chrome_error,
    } = build_telemetry(opts);

    let default_guard = match tracing::dispatcher::set_global_default(dispatch.clone()) {
        Ok(()) => None,
        Err(_) => Some(tracing::dispatcher::set_default(&dispatch)),
    };

    if let Some((path, err)) = chrome_error {
        tracing::warn!(
            "failed to initialise chrome trace writer at {}: {err}",
            path.display()
        );
    }

    TelemetryGuard {
        _default_guard: default_guard,
        _chrome_guard: chrome_guard,
    }
}

fn build_telemetry(opts: &TelemetryOptions) -> Telemetry {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut chrome_error = None;
    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_ref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                chrome_error = Some((path.clone(), err));
                (None, None)
            }
        },
        None => (None, None),
    };

    let span_only_filter = filter_fn(|metadata| metadata.is_span());

    let dispatch = Dispatch::new(
        tracing_subscriber::registry()
            .with(chrome_layer.map(|layer| layer.with_filter(span_only_filter)))
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(fmt::time::uptime())
                    .with_filter(env_filter),
            )
            .with(tracing_error::ErrorLayer::default()),
    );

    Telemetry {
        dispatch,
        chrome_guard,
        chrome_error,
    }
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> Result<
    (
        tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
        tracing_chrome::FlushGuard,
    ),
    io::Error,
> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn spawned_threads_are_named() {
        let (tx, rx) = mpsc::channel();
        spawn_thread("worker-under-test", move || {
            tx.send(thread::current().name().map(str::to_owned)).unwrap();
        })
        .unwrap()
        .join()
        .unwrap();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("worker-under-test"));
    }

    #[test]
    fn chrome_trace_file_is_created() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.json");
        {
            let telemetry = build_telemetry(&TelemetryOptions {
                chrome_trace_path: Some(path.clone()),
            });
            assert!(telemetry.chrome_error.is_none());
            tracing::dispatcher::with_default(&telemetry.dispatch, || {
                let _span = tracing::info_span!("surveillance.test").entered();
            });
        }
        assert!(path.exists());
    }

    #[test]
    fn threads_outside_spawn_thread_still_log() {
        let _guard = enter_runtime(&TelemetryOptions {
            chrome_trace_path: None,
        });
        let has_subscriber = thread::spawn(|| {
            tracing::dispatcher::get_default(|current| !current.is::<tracing::subscriber::NoSubscriber>())
        })
        .join()
        .unwrap();
        assert!(has_subscriber);
    }
}
