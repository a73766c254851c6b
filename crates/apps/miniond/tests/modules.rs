//! Module-manager scenarios: exit-type dispatch, at-least-once delivery,
//! retry semantics, and decode-outcome tagging.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use miniond::config::ServerConfig;
use miniond::modules::{
    DeliveryModule, DeliveryStatus, ModuleDisposition, ModuleManager,
};
use minion_queue::RetryPolicy;
use minion_types::{encode_payload, DeliveryTag};

const TEST_TYPE: u16 = 0x0150;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Seen {
    payload: Vec<u8>,
    tag: DeliveryTag,
    exit_type: u16,
    exit_info: Vec<u8>,
}

/// Capturing module whose per-message verdicts are scripted up front.
struct ScriptedModule {
    verdicts: Arc<Mutex<Vec<DeliveryStatus>>>,
    seen: Arc<Mutex<Vec<Seen>>>,
    batches: Arc<Mutex<usize>>,
}

impl ScriptedModule {
    fn new(verdicts: Vec<DeliveryStatus>) -> Self {
        Self {
            verdicts: Arc::new(Mutex::new(verdicts)),
            seen: Arc::new(Mutex::new(Vec::new())),
            batches: Arc::new(Mutex::new(0)),
        }
    }
}

#[async_trait]
impl DeliveryModule for ScriptedModule {
    fn name(&self) -> &'static str {
        "SCRIPTED"
    }

    fn exit_types(&self) -> &[u16] {
        &[TEST_TYPE]
    }

    fn configure(&mut self, _config: &ServerConfig) -> Result<ModuleDisposition, miniond::config::ConfigError> {
        Ok(ModuleDisposition::Enable)
    }

    async fn process(
        &mut self,
        payload: &[u8],
        tag: &DeliveryTag,
        exit_type: u16,
        exit_info: &[u8],
    ) -> DeliveryStatus {
        self.seen.lock().expect("lock").push(Seen {
            payload: payload.to_vec(),
            tag: tag.clone(),
            exit_type,
            exit_info: exit_info.to_vec(),
        });
        let mut verdicts = self.verdicts.lock().expect("lock");
        if verdicts.is_empty() {
            DeliveryStatus::Ok
        } else {
            verdicts.remove(0)
        }
    }

    async fn end_batch(&mut self) {
        *self.batches.lock().expect("lock") += 1;
    }
}

fn minimal_config() -> ServerConfig {
    ServerConfig::from_str("[server]\nhomedir = \"/nonexistent\"\n").expect("config")
}

fn manager_with(
    dir: &std::path::Path,
    module: ScriptedModule,
    policy: RetryPolicy,
) -> (ModuleManager, Arc<Mutex<Vec<Seen>>>, Arc<Mutex<usize>>) {
    let seen = module.seen.clone();
    let batches = module.batches.clone();
    let mut manager = ModuleManager::new(dir.join("deliver"), policy);
    manager.register(Box::new(module)).expect("register");
    manager.configure(&minimal_config()).expect("configure");
    (manager, seen, batches)
}

#[tokio::test]
async fn enabled_module_receives_its_exit_type() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (mut manager, seen, batches) =
        manager_with(tmp.path(), ScriptedModule::new(Vec::new()), RetryPolicy::default());

    let payload = encode_payload(b"forward me");
    manager
        .accept(&payload, None, TEST_TYPE, b"destination", 1_000)
        .await
        .expect("accept");
    assert_eq!(manager.count(), 1, "message is durably queued before flush");

    let delivered = manager.flush(1_000).await;
    assert_eq!(delivered, 1);

    let seen = seen.lock().expect("lock");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].payload, b"forward me", "decoded cleartext is delivered");
    assert_eq!(seen[0].tag, DeliveryTag::Clear);
    assert_eq!(seen[0].exit_type, TEST_TYPE);
    assert_eq!(seen[0].exit_info, b"destination");
    assert_eq!(*batches.lock().expect("lock"), 1, "end of batch signalled once");
}

#[tokio::test]
async fn unknown_exit_type_is_dropped_silently() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (mut manager, seen, _) =
        manager_with(tmp.path(), ScriptedModule::new(Vec::new()), RetryPolicy::default());

    manager.accept(b"payload", None, 0x0999, b"x", 0).await.expect("accept");
    assert_eq!(manager.count(), 0);
    manager.flush(0).await;
    assert!(seen.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn still_encrypted_payload_keeps_its_tag() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (mut manager, seen, _) =
        manager_with(tmp.path(), ScriptedModule::new(Vec::new()), RetryPolicy::default());

    let ciphertext = vec![0x5A; 64];
    manager
        .accept(&ciphertext, Some(&[9; 20]), TEST_TYPE, b"dest", 0)
        .await
        .expect("accept");
    manager.flush(0).await;

    let seen = seen.lock().expect("lock");
    assert_eq!(seen[0].tag, DeliveryTag::Encrypted(vec![9; 20]));
    assert_eq!(seen[0].payload, ciphertext, "ciphertext passes through unchanged");
}

#[tokio::test]
async fn untagged_garbage_is_marked_corrupt() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (mut manager, seen, _) =
        manager_with(tmp.path(), ScriptedModule::new(Vec::new()), RetryPolicy::default());

    manager.accept(&[0x5A; 64], None, TEST_TYPE, b"dest", 0).await.expect("accept");
    manager.flush(0).await;

    assert_eq!(seen.lock().expect("lock")[0].tag, DeliveryTag::Corrupt);
}

#[tokio::test]
async fn retry_verdict_redelivers_until_ok() {
    let tmp = tempfile::tempdir().expect("tempdir");
    // Zero backoff so the retry is immediately ready.
    let policy = RetryPolicy::new(5, 0, 0);
    let (mut manager, seen, _) = manager_with(
        tmp.path(),
        ScriptedModule::new(vec![DeliveryStatus::Retry, DeliveryStatus::Ok]),
        policy,
    );

    manager
        .accept(&encode_payload(b"try hard"), None, TEST_TYPE, b"dest", 0)
        .await
        .expect("accept");

    assert_eq!(manager.flush(0).await, 0, "first attempt fails retriably");
    assert_eq!(manager.count(), 1, "message survives the failed attempt");
    assert_eq!(manager.flush(1).await, 1, "second attempt delivers");
    assert_eq!(seen.lock().expect("lock").len(), 2, "module observed it at least once");
    assert_eq!(manager.count(), 0);
}

#[tokio::test]
async fn no_retry_verdict_drops_without_redelivery() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (mut manager, seen, _) = manager_with(
        tmp.path(),
        ScriptedModule::new(vec![DeliveryStatus::NoRetry]),
        RetryPolicy::new(5, 0, 0),
    );

    manager
        .accept(&encode_payload(b"lost cause"), None, TEST_TYPE, b"dest", 0)
        .await
        .expect("accept");
    assert_eq!(manager.flush(0).await, 0);
    assert_eq!(manager.count(), 0, "message dropped on NoRetry");
    assert_eq!(manager.flush(1).await, 0);
    assert_eq!(seen.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn internal_error_retries_once_then_drops() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (mut manager, seen, _) = manager_with(
        tmp.path(),
        ScriptedModule::new(vec![
            DeliveryStatus::Error("boom".into()),
            DeliveryStatus::Error("boom again".into()),
            DeliveryStatus::Ok,
        ]),
        RetryPolicy::new(5, 0, 0),
    );

    manager
        .accept(&encode_payload(b"fragile"), None, TEST_TYPE, b"dest", 0)
        .await
        .expect("accept");

    assert_eq!(manager.flush(0).await, 0, "first internal error retries");
    assert_eq!(manager.count(), 1);
    assert_eq!(manager.flush(1).await, 0, "second internal error drops");
    assert_eq!(manager.count(), 0, "message gone after the second failure");
    assert_eq!(seen.lock().expect("lock").len(), 2);
}
