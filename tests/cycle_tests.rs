/// Dispatch cycle tests against in-memory stores and a fake provider
///
/// Covers the window scenarios (send all, split, past deadline), throttle
/// retry, render failures, single-flight locking, deferred batch tracking,
/// artifact naming across runs and the failure paths that must leave
/// batches pending.
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use smsbatch::config::parse_config;
use smsbatch::dispatch::{
    DispatchError, OutboundMessage, Provider, ProviderMessage, ProviderResponse,
};
use smsbatch::lifecycle::{
    BatchArtifacts, BatchDisposition, Clock, CycleError, CycleOutcome, Dispatcher,
};
use smsbatch::render::Template;
use smsbatch::storage::checkpoint::{DEFERRED_KEY, LAST_CHECK_KEY, PROCESSING_KEY};
use smsbatch::storage::{
    ArtifactInfo, ArtifactStore, CheckpointManager, CheckpointStore, DuckDbStore,
    FsArtifactStore, MemoryArtifactStore, MemoryCheckpointStore, StorageError, TemplateStore,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "ID;ID_SMSTEXT;MOBILTELEFONNUMMER;ABSENDER;NACHNAME;FELD01";

    /// Provider that accepts everything except the configured recipients
    #[derive(Default)]
    struct FakeProvider {
        calls: Mutex<Vec<OutboundMessage>>,
        throttle_once: Mutex<HashSet<String>>,
        reject: HashSet<String>,
    }

    impl FakeProvider {
        fn calls(&self) -> Vec<OutboundMessage> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        async fn submit(
            &self,
            message: &OutboundMessage,
        ) -> Result<ProviderResponse, DispatchError> {
            self.calls.lock().unwrap().push(message.clone());

            let (status, message_id, error_text) =
                if self.throttle_once.lock().unwrap().remove(&message.to) {
                    ("1", None, Some("Throttled".to_string()))
                } else if self.reject.contains(&message.to) {
                    ("3", None, Some("Invalid Recipient".to_string()))
                } else {
                    ("0", Some(format!("msg-{}", message.client_ref)), None)
                };

            Ok(ProviderResponse {
                message_count: Some("1".to_string()),
                messages: vec![ProviderMessage {
                    to: Some(message.to.clone()),
                    message_id,
                    status: status.to_string(),
                    error_text,
                }],
            })
        }
    }

    /// Artifact store that lists or writes through to memory unless told to fail
    struct FlakyArtifactStore {
        inner: MemoryArtifactStore,
        fail_list: bool,
        fail_put_suffix: Option<&'static str>,
    }

    #[async_trait]
    impl ArtifactStore for FlakyArtifactStore {
        async fn list(&self, prefix: &str) -> Result<Vec<ArtifactInfo>, StorageError> {
            if self.fail_list {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "store unreachable",
                )));
            }
            self.inner.list(prefix).await
        }

        async fn get_content(&self, name: &str) -> Result<Vec<u8>, StorageError> {
            self.inner.get_content(name).await
        }

        async fn put(&self, name: &str, content: &[u8]) -> Result<(), StorageError> {
            if let Some(suffix) = self.fail_put_suffix {
                if name.ends_with(suffix) {
                    return Err(StorageError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "upload failed",
                    )));
                }
            }
            self.inner.put(name, content).await
        }

        async fn remove(&self, name: &str) -> Result<(), StorageError> {
            self.inner.remove(name).await
        }
    }

    /// Checkpoint store whose cycle bookkeeping keys cannot be read or written
    #[derive(Default)]
    struct BrokenCheckpoints {
        inner: MemoryCheckpointStore,
    }

    impl BrokenCheckpoints {
        fn refuse(key: &str) -> Result<(), StorageError> {
            if key == LAST_CHECK_KEY || key == DEFERRED_KEY {
                return Err(StorageError::Database("checkpoint table unavailable".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CheckpointStore for BrokenCheckpoints {
        async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            Self::refuse(key)?;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            Self::refuse(key)?;
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key).await
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        provider: Arc<FakeProvider>,
        state: Arc<DuckDbStore>,
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl Harness {
        fn set_now(&self, now: DateTime<Utc>) {
            *self.now.lock().unwrap() = now;
        }

        async fn run(&self) -> Vec<(String, BatchDisposition)> {
            match self.dispatcher.run_cycle().await.unwrap() {
                CycleOutcome::Completed(report) => report
                    .batches
                    .into_iter()
                    .map(|b| (b.name, b.disposition))
                    .collect(),
                CycleOutcome::Busy => panic!("cycle unexpectedly busy"),
            }
        }
    }

    fn config(tps: u32) -> smsbatch::config::Config {
        parse_config(&format!(
            r#"
provider:
  api_key: key
  api_secret: secret
dispatch:
  tps: {}
window:
  end: "16:00"
storage:
  artifacts: /unused
  state: /unused
"#,
            tps
        ))
        .unwrap()
    }

    /// Wednesday, two seconds before the window closes
    fn two_seconds_left() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 15, 59, 58).unwrap()
    }

    fn morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 9, 0, 0).unwrap()
    }

    fn uploaded_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 7, 0, 0).unwrap()
    }

    fn batch_csv(rows: usize, template_id: &str) -> String {
        let mut csv = format!("{}\n", HEADER);
        for i in 1..=rows {
            csv.push_str(&format!(
                "{i};{template_id};+4917{i:07};EOS;Name{i};{i},00\n"
            ));
        }
        csv
    }

    async fn harness(
        tps: u32,
        artifacts: Arc<dyn ArtifactStore>,
        provider: FakeProvider,
        now: DateTime<Utc>,
    ) -> Harness {
        harness_with_checkpoints(tps, artifacts, provider, now, None).await
    }

    async fn harness_with_checkpoints(
        tps: u32,
        artifacts: Arc<dyn ArtifactStore>,
        provider: FakeProvider,
        now: DateTime<Utc>,
        checkpoints: Option<Arc<dyn CheckpointStore>>,
    ) -> Harness {
        let state = Arc::new(DuckDbStore::in_memory().unwrap());
        state.init_schema().await.unwrap();
        state
            .put_template(&Template {
                id: "1521".to_string(),
                body: "Hallo {{NACHNAME}}, offen: {{FELD01}} EUR. Gruss an {{NACHNAME}}".to_string(),
                sender_field: "ABSENDER".to_string(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let now = Arc::new(Mutex::new(now));
        let clock_now = now.clone();
        let clock: Clock = Arc::new(move || *clock_now.lock().unwrap());

        let provider = Arc::new(provider);
        let checkpoints =
            checkpoints.unwrap_or_else(|| state.clone() as Arc<dyn CheckpointStore>);
        let dispatcher = Arc::new(
            Dispatcher::new(
                &config(tps),
                artifacts,
                state.clone(),
                checkpoints,
                provider.clone(),
            )
            .with_clock(clock),
        );

        Harness {
            dispatcher,
            provider,
            state,
            now,
        }
    }

    fn memory_with(name: &str, content: &str) -> Arc<MemoryArtifactStore> {
        let store = Arc::new(MemoryArtifactStore::new());
        store.insert(name, content.as_bytes(), uploaded_at());
        store
    }

    fn text(store: &MemoryArtifactStore, name: &str) -> String {
        String::from_utf8(store.content(name).unwrap_or_else(|| panic!("missing {}", name)))
            .unwrap()
    }

    fn data_lines(store: &MemoryArtifactStore, name: &str) -> Vec<String> {
        text(store, name).lines().skip(1).map(str::to_string).collect()
    }

    fn keys(disposition: &BatchDisposition) -> &BatchArtifacts {
        match disposition {
            BatchDisposition::Sent { artifacts, .. } | BatchDisposition::Split { artifacts, .. } => {
                artifacts
            }
            other => panic!("expected a dispatched batch, got {:?}", other),
        }
    }

    async fn pending(store: &dyn ArtifactStore) -> Vec<String> {
        store
            .list("send/")
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect()
    }

    fn client_refs(provider: &FakeProvider) -> Vec<u32> {
        let mut refs: Vec<u32> = provider
            .calls()
            .iter()
            .map(|c| c.client_ref.parse().unwrap())
            .collect();
        refs.sort_unstable();
        refs
    }

    #[tokio::test]
    async fn test_scenario_a_whole_batch_sent() {
        let store = memory_with("send/mahnung.csv", &batch_csv(100, "1521"));
        let h = harness(30, store.clone(), FakeProvider::default(), morning()).await;

        let batches = h.run().await;

        assert_eq!(batches.len(), 1);
        match &batches[0].1 {
            BatchDisposition::Sent { summary, .. } => {
                assert_eq!(summary.attempted, 100);
                assert_eq!(summary.succeeded, 100);
                assert_eq!(summary.failed, 0);
            }
            other => panic!("expected Sent, got {:?}", other),
        }

        let calls = h.provider.calls();
        assert_eq!(calls.len(), 100);
        assert_eq!(calls[0].from, "EOS");
        assert_eq!(calls[0].to, "49170000001");
        assert_eq!(calls[0].text, "Hallo Name1, offen: 1,00 EUR. Gruss an Name1");
        assert_eq!(calls[0].client_ref, "1");
        assert_eq!(calls[0].account_ref, "send/mahnung.csv");

        let keys = keys(&batches[0].1);
        assert!(keys.summary.starts_with("output/mahnung_20240515T090000_"));
        assert!(keys.summary.ends_with("_summary.csv"));
        assert!(keys.archive.starts_with("processed/mahnung_20240515T090000_"));

        let summary = data_lines(&store, &keys.summary);
        assert!(summary[0].starts_with("0;100;"));
        assert_eq!(data_lines(&store, &keys.results).len(), 100);
        assert!(data_lines(&store, &keys.failed).is_empty());

        assert!(store.list("send/").await.unwrap().is_empty());
        assert_eq!(data_lines(&store, &keys.archive).len(), 100);
    }

    #[tokio::test]
    async fn test_scenario_b_split_requeues_remainder() {
        let store = memory_with("send/mahnung.csv", &batch_csv(100, "1521"));
        let h = harness(30, store.clone(), FakeProvider::default(), two_seconds_left()).await;

        let batches = h.run().await;

        let remainder_name = match &batches[0].1 {
            BatchDisposition::Split {
                summary,
                remainder,
                remainder_records,
                ..
            } => {
                assert_eq!(summary.attempted, 54);
                assert!(remainder.starts_with("send/mahnung_remainder_20240515T155958_"));
                assert_eq!(*remainder_records, 46);
                remainder.clone()
            }
            other => panic!("expected Split, got {:?}", other),
        };
        let remainder_name = remainder_name.as_str();
        assert_eq!(h.provider.calls().len(), 54);

        // Attempted prefix is archived, the suffix waits in pending
        let archived = data_lines(&store, &keys(&batches[0].1).archive);
        assert_eq!(archived.len(), 54);
        assert!(archived[53].starts_with("54;"));

        let remainder = data_lines(&store, remainder_name);
        assert_eq!(remainder.len(), 46);
        assert!(remainder[0].starts_with("55;"));
        assert!(text(&store, remainder_name).starts_with(HEADER));

        assert_eq!(pending(store.as_ref()).await, vec![remainder_name.to_string()]);

        let deferred = CheckpointManager::new(h.state.clone()).deferred().await.unwrap();
        assert!(deferred.contains(remainder_name));
        assert!(!deferred.contains("send/mahnung.csv"));
    }

    #[tokio::test]
    async fn test_scenario_c_past_deadline_leaves_batch() {
        let store = memory_with("send/mahnung.csv", &batch_csv(10, "1521"));
        let after_close = Utc.with_ymd_and_hms(2024, 5, 15, 16, 0, 5).unwrap();
        let h = harness(30, store.clone(), FakeProvider::default(), after_close).await;

        let batches = h.run().await;

        match &batches[0].1 {
            BatchDisposition::Deferred {
                seconds_remaining, ..
            } => assert_eq!(*seconds_remaining, -5),
            other => panic!("expected Deferred, got {:?}", other),
        }
        assert!(h.provider.calls().is_empty());
        assert_eq!(store.names(), vec!["send/mahnung.csv".to_string()]);
    }

    #[tokio::test]
    async fn test_deferred_batch_is_picked_up_next_window() {
        let store = memory_with("send/mahnung.csv", &batch_csv(10, "1521"));
        let after_close = Utc.with_ymd_and_hms(2024, 5, 15, 16, 0, 5).unwrap();
        let h = harness(1000, store.clone(), FakeProvider::default(), after_close).await;

        h.run().await;
        let manager = CheckpointManager::new(h.state.clone());
        assert_eq!(manager.last_check().await.unwrap(), Some(after_close));

        // Modified long before the last check; only the deferred set keeps it eligible
        h.set_now(Utc.with_ymd_and_hms(2024, 5, 16, 9, 0, 0).unwrap());
        let batches = h.run().await;

        assert!(matches!(batches[0].1, BatchDisposition::Sent { .. }));
        assert_eq!(h.provider.calls().len(), 10);
        assert!(manager.deferred().await.unwrap().is_empty());
        assert_eq!(h.state.get(DEFERRED_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_weekend_is_past_deadline() {
        let store = memory_with("send/mahnung.csv", &batch_csv(5, "1521"));
        let saturday = Utc.with_ymd_and_hms(2024, 5, 18, 10, 0, 0).unwrap();
        let h = harness(1000, store.clone(), FakeProvider::default(), saturday).await;

        let batches = h.run().await;
        assert!(matches!(batches[0].1, BatchDisposition::Deferred { .. }));
        assert!(h.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_scenario_d_throttled_message_counted_once() {
        let store = memory_with("send/mahnung.csv", &batch_csv(1, "1521"));
        let provider = FakeProvider::default();
        provider
            .throttle_once
            .lock()
            .unwrap()
            .insert("49170000001".to_string());
        let h = harness(1000, store.clone(), provider, morning()).await;

        let batches = h.run().await;

        match &batches[0].1 {
            BatchDisposition::Sent { summary, .. } => {
                assert_eq!(summary.attempted, 1);
                assert_eq!(summary.succeeded, 1);
            }
            other => panic!("expected Sent, got {:?}", other),
        }
        let calls = h.provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
        assert_eq!(data_lines(&store, &keys(&batches[0].1).results).len(), 1);
    }

    #[tokio::test]
    async fn test_scenario_e_unknown_template_routed_to_failed() {
        let csv = format!(
            "{}\n1;1521;+491700000001;EOS;Meyer;1,00\n2;9999;+491700000002;EOS;Schulz;2,00\n3;1521;+491700000003;EOS;Weber;3,00\n",
            HEADER
        );
        let store = memory_with("send/mahnung.csv", &csv);
        let h = harness(1000, store.clone(), FakeProvider::default(), morning()).await;

        let batches = h.run().await;

        match &batches[0].1 {
            BatchDisposition::Sent { summary, .. } => {
                assert_eq!(summary.attempted, 3);
                assert_eq!(summary.succeeded, 2);
                assert_eq!(summary.failed, 1);
            }
            other => panic!("expected Sent, got {:?}", other),
        }
        assert_eq!(h.provider.calls().len(), 2);

        let failed = data_lines(&store, &keys(&batches[0].1).failed);
        assert_eq!(failed.len(), 1);
        assert!(failed[0].starts_with("2;"));
        assert!(failed[0].contains("9999"));

        let results = data_lines(&store, &keys(&batches[0].1).results);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|line| !line.starts_with("2;")));
    }

    #[tokio::test]
    async fn test_provider_rejection_does_not_abort_batch() {
        let store = memory_with("send/mahnung.csv", &batch_csv(3, "1521"));
        let provider = FakeProvider {
            reject: ["49170000002".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let h = harness(1000, store.clone(), provider, morning()).await;

        let batches = h.run().await;

        assert_eq!(h.provider.calls().len(), 3);
        let keys = keys(&batches[0].1);
        let failed = data_lines(&store, &keys.failed);
        assert_eq!(failed, vec!["2;Invalid Recipient".to_string()]);
        assert!(data_lines(&store, &keys.summary)[0].starts_with("1;2;"));
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_a_noop() {
        let store = memory_with("send/mahnung.csv", &batch_csv(5, "1521"));
        let h = harness(1000, store.clone(), FakeProvider::default(), morning()).await;

        let guard = h.dispatcher.lock().try_acquire().await.unwrap().unwrap();
        let outcome = h.dispatcher.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Busy));
        assert!(h.provider.calls().is_empty());
        guard.release().await.unwrap();

        let batches = h.run().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(h.provider.calls().len(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_triggers_run_one_cycle() {
        let store = memory_with("send/mahnung.csv", &batch_csv(6, "1521"));
        let h = harness(10, store.clone(), FakeProvider::default(), morning()).await;

        let (first, second) = tokio::join!(h.dispatcher.run_cycle(), h.dispatcher.run_cycle());
        let outcomes = [first.unwrap(), second.unwrap()];

        let busy = outcomes
            .iter()
            .filter(|o| matches!(o, CycleOutcome::Busy))
            .count();
        assert_eq!(busy, 1);
        assert_eq!(h.provider.calls().len(), 6);
        assert!(!h.dispatcher.lock().is_held());
    }

    #[tokio::test]
    async fn test_parse_error_keeps_batch_pending() {
        let store = memory_with("send/kaputt.csv", "ID;NACHNAME\n1;Meyer\n");
        let h = harness(1000, store.clone(), FakeProvider::default(), morning()).await;

        let batches = h.run().await;

        match &batches[0].1 {
            BatchDisposition::Failed { error } => assert!(error.contains("ID_SMSTEXT")),
            other => panic!("expected Failed, got {:?}", other),
        }
        assert_eq!(store.names(), vec!["send/kaputt.csv".to_string()]);
        assert!(!h.dispatcher.lock().is_held());
        assert_eq!(h.state.get(PROCESSING_KEY).await.unwrap(), None);

        let deferred = CheckpointManager::new(h.state.clone()).deferred().await.unwrap();
        assert!(deferred.contains("send/kaputt.csv"));
    }

    #[tokio::test]
    async fn test_output_failure_rolls_back_remainder() {
        let inner = MemoryArtifactStore::new();
        inner.insert("send/mahnung.csv", batch_csv(100, "1521"), uploaded_at());
        let store = Arc::new(FlakyArtifactStore {
            inner,
            fail_list: false,
            fail_put_suffix: Some("_summary.csv"),
        });
        let h = harness(30, store.clone(), FakeProvider::default(), two_seconds_left()).await;

        let batches = h.run().await;

        assert!(matches!(batches[0].1, BatchDisposition::Failed { .. }));
        assert_eq!(pending(store.as_ref()).await, vec!["send/mahnung.csv".to_string()]);
        assert!(store
            .inner
            .names()
            .iter()
            .all(|name| !name.starts_with("processed/")));
        assert!(!h.dispatcher.lock().is_held());
    }

    #[tokio::test]
    async fn test_listing_failure_is_reported_and_checkpoint_kept() {
        let store = Arc::new(FlakyArtifactStore {
            inner: MemoryArtifactStore::new(),
            fail_list: true,
            fail_put_suffix: None,
        });
        let h = harness(1000, store, FakeProvider::default(), morning()).await;

        let err = h.dispatcher.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Listing(_)));

        assert!(!h.dispatcher.lock().is_held());
        let manager = CheckpointManager::new(h.state.clone());
        assert_eq!(manager.last_check().await.unwrap(), None);
        assert_eq!(manager.lease().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_already_checked_batches_are_skipped() {
        let store = memory_with("send/alt.csv", &batch_csv(3, "1521"));
        store.insert("send/notizen.txt", "not a batch", morning());
        let h = harness(1000, store.clone(), FakeProvider::default(), morning()).await;

        CheckpointManager::new(h.state.clone())
            .set_last_check(Utc.with_ymd_and_hms(2024, 5, 15, 8, 0, 0).unwrap())
            .await
            .unwrap();

        let batches = h.run().await;
        assert!(batches.is_empty());
        assert!(h.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_same_base_batches_split_in_one_second_keep_all_records() {
        let store = memory_with("send/a.csv", &batch_csv(100, "1521"));
        store.insert(
            "send/a_remainder_20240514T155958.csv",
            batch_csv(100, "1521"),
            uploaded_at(),
        );
        let h = harness(30, store.clone(), FakeProvider::default(), two_seconds_left()).await;

        let batches = h.run().await;

        assert_eq!(batches.len(), 2);
        let remainders: Vec<String> = batches
            .iter()
            .map(|(_, disposition)| match disposition {
                BatchDisposition::Split {
                    remainder,
                    remainder_records,
                    ..
                } => {
                    assert_eq!(*remainder_records, 46);
                    remainder.clone()
                }
                other => panic!("expected Split, got {:?}", other),
            })
            .collect();
        assert_ne!(remainders[0], remainders[1]);

        let pending_names = pending(store.as_ref()).await;
        assert_eq!(pending_names.len(), 2);
        let queued: usize = pending_names
            .iter()
            .map(|name| data_lines(&store, name).len())
            .sum();
        assert_eq!(queued, 92);

        let archives: HashSet<&str> = batches
            .iter()
            .map(|(_, d)| keys(d).archive.as_str())
            .collect();
        assert_eq!(archives.len(), 2);
    }

    #[tokio::test]
    async fn test_split_batch_drains_across_windows() {
        let store = memory_with("send/mahnung.csv", &batch_csv(100, "1521"));
        let h = harness(30, store.clone(), FakeProvider::default(), two_seconds_left()).await;

        let first = h.run().await;
        assert!(matches!(first[0].1, BatchDisposition::Split { .. }));

        h.set_now(Utc.with_ymd_and_hms(2024, 5, 16, 9, 0, 0).unwrap());
        let second = h.run().await;
        assert_eq!(second.len(), 1);
        match &second[0].1 {
            BatchDisposition::Sent { summary, .. } => assert_eq!(summary.attempted, 46),
            other => panic!("expected Sent, got {:?}", other),
        }

        // Every record went out exactly once, in two windows
        assert_eq!(client_refs(&h.provider), (1..=100).collect::<Vec<u32>>());
        assert!(pending(store.as_ref()).await.is_empty());
        assert!(CheckpointManager::new(h.state.clone())
            .deferred()
            .await
            .unwrap()
            .is_empty());

        let archived: usize = store
            .list("processed/")
            .await
            .unwrap()
            .iter()
            .map(|a| data_lines(&store, &a.name).len())
            .sum();
        assert_eq!(archived, 100);
    }

    #[tokio::test]
    async fn test_recurring_batch_name_keeps_earlier_results() {
        let store = memory_with("send/mahnung.csv", &batch_csv(3, "1521"));
        let provider = FakeProvider {
            reject: ["49170000002".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let h = harness(1000, store.clone(), provider, morning()).await;

        let first = h.run().await;

        let next_upload = Utc.with_ymd_and_hms(2024, 5, 16, 7, 0, 0).unwrap();
        store.insert("send/mahnung.csv", batch_csv(1, "1521"), next_upload);
        h.set_now(Utc.with_ymd_and_hms(2024, 5, 16, 9, 0, 0).unwrap());
        let second = h.run().await;

        let (earlier, later) = (keys(&first[0].1), keys(&second[0].1));
        assert_ne!(earlier, later);
        assert_eq!(
            data_lines(&store, &earlier.failed),
            vec!["2;Invalid Recipient".to_string()]
        );
        assert!(data_lines(&store, &later.failed).is_empty());
        assert_eq!(data_lines(&store, &earlier.archive).len(), 3);
        assert_eq!(data_lines(&store, &later.archive).len(), 1);
    }

    fn write_with_mtime(root: &Path, name: &str, content: &str, modified: DateTime<Utc>) {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(std::time::SystemTime::from(modified))
            .unwrap();
    }

    #[tokio::test]
    async fn test_fs_candidates_follow_modification_time() {
        let dir = tempfile::TempDir::new().unwrap();
        write_with_mtime(dir.path(), "send/a.csv", &batch_csv(3, "1521"), uploaded_at());
        let store = Arc::new(FsArtifactStore::new(dir.path()));
        let h = harness(1000, store.clone(), FakeProvider::default(), morning()).await;

        let first = h.run().await;
        assert_eq!(first.len(), 1);
        assert!(dir.path().join(&keys(&first[0].1).archive).is_file());

        // b was modified before the 09:00 check, c after it
        let before = Utc.with_ymd_and_hms(2024, 5, 15, 8, 30, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 5, 15, 9, 30, 0).unwrap();
        write_with_mtime(dir.path(), "send/b.csv", &batch_csv(2, "1521"), before);
        write_with_mtime(dir.path(), "send/c.csv", &batch_csv(4, "1521"), after);

        h.set_now(Utc.with_ymd_and_hms(2024, 5, 15, 10, 0, 0).unwrap());
        let second = h.run().await;

        let names: Vec<&str> = second.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["send/c.csv"]);
        assert_eq!(h.provider.calls().len(), 7);
        assert_eq!(pending(store.as_ref()).await, vec!["send/b.csv".to_string()]);
    }

    #[tokio::test]
    async fn test_unreadable_checkpoints_do_not_fail_cycle() {
        let store = memory_with("send/mahnung.csv", &batch_csv(3, "1521"));
        let checkpoints = Arc::new(BrokenCheckpoints::default());
        let h = harness_with_checkpoints(
            1000,
            store.clone(),
            FakeProvider::default(),
            morning(),
            Some(checkpoints.clone() as Arc<dyn CheckpointStore>),
        )
        .await;

        let batches = h.run().await;

        assert!(matches!(batches[0].1, BatchDisposition::Sent { .. }));
        assert_eq!(h.provider.calls().len(), 3);
        assert!(!h.dispatcher.lock().is_held());
        assert_eq!(checkpoints.inner.get(PROCESSING_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cycle_runs_on_spawned_task() {
        let store = memory_with("send/mahnung.csv", &batch_csv(2, "1521"));
        let h = harness(1000, store, FakeProvider::default(), morning()).await;

        let dispatcher = h.dispatcher.clone();
        let outcome = tokio::spawn(async move { dispatcher.run_cycle().await })
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(outcome, CycleOutcome::Completed(_)));
        assert_eq!(h.provider.calls().len(), 2);
    }
}
