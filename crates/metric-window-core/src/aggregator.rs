use std::time::Instant;

use serde_json::{Map, Value};

use crate::{
    build_payload, clean_values, new_record_id, ConnectionProvider, EntityKey, InputRecord,
    MetricConfigSource, OutputRecord, RetryOutcome, RetryPolicy, StoreError, TimestampedValue,
    WindowError, WindowResult, WindowSettings,
};

/// Why a record produced no output.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DropReason {
    /// The `(value, timestamp)` pair was already buffered.
    Duplicate,
    /// The buffer does not hold a full window yet.
    Filling { available: usize, required: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowOutcome {
    Emit(Box<OutputRecord>),
    Drop(DropReason),
}

/// Per-record orchestration of the windowing stage.
///
/// Holds no lock of its own: appends on one key are serialized by the store
/// transaction, so a single aggregator can be shared by any number of
/// workers.
pub struct WindowAggregator<C, P> {
    configs: C,
    provider: P,
    settings: WindowSettings,
    retry: RetryPolicy,
}

impl<C, P> WindowAggregator<C, P>
where
    C: MetricConfigSource,
    P: ConnectionProvider,
{
    /// # Errors
    /// Returns [`WindowError::Configuration`] when `settings` are invalid.
    pub fn new(configs: C, provider: P, settings: WindowSettings) -> Result<Self, WindowError> {
        settings.validate()?;
        Ok(Self {
            configs,
            provider,
            retry: RetryPolicy::new(settings.max_store_retries),
            settings,
        })
    }

    #[must_use]
    pub fn settings(&self) -> &WindowSettings {
        &self.settings
    }

    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Decodes a JSON record and processes it.
    ///
    /// # Errors
    /// Returns [`WindowError::InvalidRecord`] for undecodable payloads and
    /// otherwise the errors of [`WindowAggregator::process`].
    pub fn process_json(&self, payload: &[u8]) -> Result<WindowOutcome, WindowError> {
        let record: InputRecord = serde_json::from_slice(payload)
            .map_err(|err| WindowError::InvalidRecord(format!("undecodable record: {err}")))?;
        self.process(&record)
    }

    /// Appends one sample to its window buffer and emits the window once full.
    ///
    /// # Errors
    /// - [`WindowError::Configuration`] when no config resolves or the buffer
    ///   would be smaller than the window. No store call is made.
    /// - [`WindowError::InvalidRecord`] for missing labels or unparseable
    ///   fields. No store call is made.
    /// - [`WindowError::Store`] when the store fails beyond the retry budget.
    pub fn process(&self, record: &InputRecord) -> Result<WindowOutcome, WindowError> {
        let started = Instant::now();
        tracing::debug!(name = %record.name, "received record");

        let namespace = record.label("namespace").ok_or_else(|| {
            WindowError::InvalidRecord(format!(
                "record for metric {} has no namespace label",
                record.name
            ))
        })?;

        let config = self
            .configs
            .metric_config(&record.name, &namespace)
            .ok_or_else(|| {
                WindowError::Configuration(format!(
                    "no metric config for {namespace}/{}",
                    record.name
                ))
            })?;
        config.validate()?;
        let window_size = config.window_size;
        let buffer_size = self.settings.buffer_size(window_size)?;

        let key = EntityKey::from_record(record, &config.composite_keys)?;
        let entry = TimestampedValue {
            value: record.value.parse()?,
            timestamp: record.timestamp.parse()?,
        };

        let entries = match self.append_with_retry(&key, entry, window_size, buffer_size)? {
            WindowResult::Duplicate => {
                tracing::debug!(key = %key, timestamp = entry.timestamp, "dropping duplicate sample");
                return Ok(WindowOutcome::Drop(DropReason::Duplicate));
            }
            WindowResult::Window(entries) => entries,
        };

        if entries.len() < window_size {
            tracing::debug!(
                key = %key,
                available = entries.len(),
                required = window_size,
                "window still filling"
            );
            return Ok(WindowOutcome::Drop(DropReason::Filling {
                available: entries.len(),
                required: window_size,
            }));
        }

        let raw_values: Vec<f64> = entries.iter().map(|item| item.value).collect();
        let timestamps: Vec<i64> = entries.iter().map(|item| item.timestamp).collect();
        let cleaned_values = clean_values(
            &new_record_id(),
            &key,
            &raw_values,
            self.settings.replace_nan,
            self.settings.replace_inf,
        );

        let mut metadata = Map::new();
        metadata.insert(
            "src_labels".to_string(),
            Value::Object(record.labels.clone()),
        );

        let payload = build_payload(key, &raw_values, &cleaned_values, &timestamps, metadata);
        tracing::info!(
            uuid = %payload.uuid,
            key = %payload.composite_keys,
            window = window_size,
            "sending payload"
        );
        tracing::debug!(
            uuid = %payload.uuid,
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "window processing finished"
        );

        Ok(WindowOutcome::Emit(Box::new(payload)))
    }

    fn append_with_retry(
        &self,
        key: &EntityKey,
        entry: TimestampedValue,
        window_size: usize,
        buffer_size: usize,
    ) -> Result<WindowResult, WindowError> {
        let store_key = key.store_key();
        let mut stale_generation = None;

        let outcome = self.retry.run(StoreError::is_connection, |attempt| {
            let handle = match stale_generation.take() {
                Some(generation) => self.provider.recreate(generation),
                None => self.provider.connection(),
            };
            let handle = match handle {
                Ok(handle) => handle,
                Err(err) => {
                    if err.is_connection() {
                        tracing::warn!(
                            key = %store_key,
                            attempt,
                            error = %err,
                            "store connection failed"
                        );
                    }
                    return Err(err);
                }
            };

            let result = handle
                .store
                .append(&store_key, entry, window_size, buffer_size);
            if let Err(err) = &result {
                if err.is_connection() {
                    tracing::warn!(
                        key = %store_key,
                        attempt,
                        generation = handle.generation,
                        error = %err,
                        "store connection failed"
                    );
                    stale_generation = Some(handle.generation);
                }
            }
            result
        });

        match outcome {
            RetryOutcome::Success { value, .. } => Ok(value),
            RetryOutcome::Exhausted { error, attempts } | RetryOutcome::Aborted { error, attempts } => {
                Err(WindowError::Store {
                    attempts,
                    source: error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use crate::{
        InMemoryWindowStore, MetricConfig, SharedStoreProvider, StaticMetricConfigs, StoreHandle,
        WindowStore,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn configs(window_size: usize) -> StaticMetricConfigs {
        StaticMetricConfigs {
            metrics: Vec::new(),
            default: Some(MetricConfig {
                window_size,
                composite_keys: vec!["namespace".to_string(), "name".to_string()],
            }),
        }
    }

    fn record(value: f64, timestamp: &str) -> InputRecord {
        let mut labels = Map::new();
        labels.insert("namespace".to_string(), Value::from("ns"));
        labels.insert("pod".to_string(), Value::from("web-0"));
        InputRecord {
            name: "metric".to_string(),
            labels,
            timestamp: crate::RawTimestamp::Text(timestamp.to_string()),
            value: crate::RawValue::Number(value),
        }
    }

    fn memory_aggregator(
        window_size: usize,
    ) -> WindowAggregator<StaticMetricConfigs, SharedStoreProvider> {
        let store: Arc<dyn WindowStore> = Arc::new(InMemoryWindowStore::default());
        must_ok(WindowAggregator::new(
            configs(window_size),
            SharedStoreProvider::from_store(store),
            WindowSettings::default(),
        ))
    }

    fn emitted(outcome: WindowOutcome) -> OutputRecord {
        match outcome {
            WindowOutcome::Emit(record) => *record,
            WindowOutcome::Drop(reason) => panic!("expected emission, got drop: {reason:?}"),
        }
    }

    #[test]
    fn fills_then_emits_ordered_window() {
        let aggregator = memory_aggregator(3);

        let first = must_ok(aggregator.process(&record(1.0, "100")));
        assert_eq!(
            first,
            WindowOutcome::Drop(DropReason::Filling {
                available: 1,
                required: 3
            })
        );
        let second = must_ok(aggregator.process(&record(2.0, "110")));
        assert!(matches!(second, WindowOutcome::Drop(DropReason::Filling { .. })));

        let payload = emitted(must_ok(aggregator.process(&record(3.0, "120"))));
        assert_eq!(payload.status, crate::Status::Extracted);
        assert_eq!(payload.header, crate::Header::ModelInference);
        assert_eq!(payload.cleaned_values(), vec![1.0, 2.0, 3.0]);
        assert_eq!(payload.raw_values(), vec![1.0, 2.0, 3.0]);
        assert_eq!(payload.win_ts_arr, vec!["100", "110", "120"]);
        assert_eq!(payload.composite_keys.store_key(), "ns:metric");
        assert_eq!(
            payload.metadata.get("src_labels"),
            Some(&serde_json::json!({"namespace": "ns", "pod": "web-0"}))
        );

        let sliding = emitted(must_ok(aggregator.process(&record(4.0, "130"))));
        assert_eq!(sliding.cleaned_values(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn redelivered_sample_is_dropped_as_duplicate() {
        let aggregator = memory_aggregator(2);
        let _ = must_ok(aggregator.process(&record(1.0, "100")));
        let _ = must_ok(aggregator.process(&record(2.0, "110")));

        let again = must_ok(aggregator.process(&record(2.0, "110")));
        assert_eq!(again, WindowOutcome::Drop(DropReason::Duplicate));
    }

    #[test]
    fn non_finite_values_are_sanitized_but_kept_raw() {
        let aggregator = memory_aggregator(2);
        let _ = must_ok(aggregator.process(&record(f64::NAN, "100")));
        let payload = emitted(must_ok(aggregator.process(&record(f64::INFINITY, "110"))));

        assert_eq!(payload.cleaned_values(), vec![0.0, 1e10]);
        let raw = payload.raw_values();
        assert!(raw[0].is_nan());
        assert!(raw[1].is_infinite());
    }

    #[test]
    fn process_json_rejects_undecodable_payloads() {
        let aggregator = memory_aggregator(2);
        let result = aggregator.process_json(b"{\"name\": 3}");
        assert!(matches!(result, Err(WindowError::InvalidRecord(_))));

        let result = aggregator.process_json(
            br#"{"name":"metric","labels":{"namespace":"ns"},"timestamp":"100","value":"1.5"}"#,
        );
        assert!(matches!(result, Ok(WindowOutcome::Drop(_))));
    }

    /// Store double that counts calls and fails the first `failures` of them.
    struct ScriptedStore {
        calls: AtomicUsize,
        failures: usize,
        error: StoreError,
        inner: InMemoryWindowStore,
    }

    impl ScriptedStore {
        fn new(failures: usize, error: StoreError) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures,
                error,
                inner: InMemoryWindowStore::default(),
            }
        }
    }

    impl WindowStore for ScriptedStore {
        fn append(
            &self,
            key: &str,
            entry: TimestampedValue,
            window_size: usize,
            buffer_size: usize,
        ) -> Result<WindowResult, StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(self.error.clone());
            }
            self.inner.append(key, entry, window_size, buffer_size)
        }

        fn buffer_len(&self, key: &str) -> Result<usize, StoreError> {
            self.inner.buffer_len(key)
        }
    }

    /// Provider double that records how often it reconnects.
    struct ScriptedProvider {
        store: Arc<ScriptedStore>,
        recreated: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(store: ScriptedStore) -> Self {
            Self {
                store: Arc::new(store),
                recreated: AtomicUsize::new(0),
            }
        }

        fn handle(&self, generation: u64) -> StoreHandle {
            StoreHandle {
                generation,
                store: Arc::clone(&self.store) as Arc<dyn WindowStore>,
            }
        }
    }

    impl ConnectionProvider for ScriptedProvider {
        fn connection(&self) -> Result<StoreHandle, StoreError> {
            Ok(self.handle(1))
        }

        fn recreate(&self, stale_generation: u64) -> Result<StoreHandle, StoreError> {
            self.recreated.fetch_add(1, Ordering::SeqCst);
            Ok(self.handle(stale_generation + 1))
        }
    }

    fn scripted_aggregator(
        window_size: usize,
        settings: WindowSettings,
        store: ScriptedStore,
    ) -> WindowAggregator<StaticMetricConfigs, ScriptedProvider> {
        must_ok(WindowAggregator::new(
            configs(window_size),
            ScriptedProvider::new(store),
            settings,
        ))
    }

    #[test]
    fn undersized_buffer_fails_before_any_store_call() {
        let settings = WindowSettings {
            buffer_size_override: Some(2),
            ..WindowSettings::default()
        };
        let aggregator = scripted_aggregator(
            3,
            settings,
            ScriptedStore::new(0, StoreError::Backend("unused".to_string())),
        );

        let result = aggregator.process(&record(1.0, "100"));
        assert!(matches!(result, Err(WindowError::Configuration(_))));
        assert_eq!(aggregator.provider().store.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invalid_record_fails_before_any_store_call() {
        let aggregator = scripted_aggregator(
            3,
            WindowSettings::default(),
            ScriptedStore::new(0, StoreError::Backend("unused".to_string())),
        );

        let mut bad = record(1.0, "100");
        bad.timestamp = crate::RawTimestamp::Text("yesterday".to_string());
        assert!(matches!(
            aggregator.process(&bad),
            Err(WindowError::InvalidRecord(_))
        ));

        let mut no_namespace = record(1.0, "100");
        no_namespace.labels.remove("namespace");
        assert!(matches!(
            aggregator.process(&no_namespace),
            Err(WindowError::InvalidRecord(_))
        ));

        assert_eq!(aggregator.provider().store.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn connection_failure_is_retried_on_a_fresh_connection() {
        let flaky = scripted_aggregator(
            1,
            WindowSettings::default(),
            ScriptedStore::new(1, StoreError::Connection("reset by peer".to_string())),
        );
        let steady = memory_aggregator(1);

        let recovered = emitted(must_ok(flaky.process(&record(5.0, "100"))));
        let baseline = emitted(must_ok(steady.process(&record(5.0, "100"))));

        assert_eq!(recovered.win_arr, baseline.win_arr);
        assert_eq!(recovered.win_ts_arr, baseline.win_ts_arr);
        assert_eq!(flaky.provider().recreated.load(Ordering::SeqCst), 1);
        assert_eq!(flaky.provider().store.calls.load(Ordering::SeqCst), 2);
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            match self.0.lock() {
                Ok(mut logs) => logs.extend_from_slice(buf),
                Err(err) => panic!("log buffer poisoned: {err}"),
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn text(&self) -> String {
            match self.0.lock() {
                Ok(logs) => String::from_utf8_lossy(&logs).into_owned(),
                Err(err) => panic!("log buffer poisoned: {err}"),
            }
        }
    }

    #[test]
    fn failed_connect_is_logged_and_retried() {
        let opened = Arc::new(AtomicUsize::new(0));
        let provider = {
            let opened = Arc::clone(&opened);
            SharedStoreProvider::new(move || {
                if opened.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(StoreError::Connection("connection refused".to_string()));
                }
                Ok(Arc::new(InMemoryWindowStore::default()) as Arc<dyn WindowStore>)
            })
        };
        let aggregator = must_ok(WindowAggregator::new(
            configs(1),
            provider,
            WindowSettings::default(),
        ));

        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .finish();
        let outcome = tracing::subscriber::with_default(subscriber, || {
            aggregator.process(&record(5.0, "100"))
        });

        let payload = emitted(must_ok(outcome));
        assert_eq!(payload.cleaned_values(), vec![5.0]);
        assert_eq!(opened.load(Ordering::SeqCst), 2);

        let text = logs.text();
        assert!(text.contains("store connection failed"), "logs={text}");
        assert!(text.contains("connection refused"), "logs={text}");
    }

    #[test]
    fn second_connection_failure_surfaces_as_store_error() {
        let aggregator = scripted_aggregator(
            1,
            WindowSettings::default(),
            ScriptedStore::new(2, StoreError::Connection("reset by peer".to_string())),
        );

        let result = aggregator.process(&record(5.0, "100"));
        assert!(matches!(
            result,
            Err(WindowError::Store {
                attempts: 2,
                source: StoreError::Connection(_)
            })
        ));
        assert_eq!(aggregator.provider().recreated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backend_failure_is_not_retried() {
        let aggregator = scripted_aggregator(
            1,
            WindowSettings::default(),
            ScriptedStore::new(1, StoreError::Backend("WRONGTYPE".to_string())),
        );

        let result = aggregator.process(&record(5.0, "100"));
        assert!(matches!(
            result,
            Err(WindowError::Store {
                attempts: 1,
                source: StoreError::Backend(_)
            })
        ));
        assert_eq!(aggregator.provider().recreated.load(Ordering::SeqCst), 0);
        assert_eq!(aggregator.provider().store.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_metric_without_default_is_a_configuration_error() {
        let aggregator = must_ok(WindowAggregator::new(
            StaticMetricConfigs::default(),
            SharedStoreProvider::from_store(Arc::new(InMemoryWindowStore::default())),
            WindowSettings::default(),
        ));

        let result = aggregator.process(&record(1.0, "100"));
        assert!(matches!(result, Err(WindowError::Configuration(_))));
    }
}
