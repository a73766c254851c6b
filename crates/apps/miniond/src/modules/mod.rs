pub mod drop_module;
pub mod mbox;
pub mod smtp;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use minion_queue::{DurableQueue, RetryPolicy};
use minion_types::{decode_payload, DecodedPayload, DeliveryTag, ExitAddress};

use crate::config::{ConfigError, ServerConfig};
use crate::PipelineError;

const FLUSH_BATCH: usize = 64;

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Delivered; remove the message.
    Ok,
    /// Not delivered, but might be deliverable later.
    Retry,
    /// Delivery will never succeed; drop the message.
    NoRetry,
    /// The module itself failed. Retried once, then dropped.
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleDisposition {
    Enable,
    Disable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModuleState {
    Registered,
    Enabled,
}

/// A configuration section a module claims, with the keys that must be
/// present whenever the section appears. Two modules claiming the same
/// section fail validation.
#[derive(Debug, Clone, Copy)]
pub struct SectionSpec {
    pub name: &'static str,
    pub required: &'static [&'static str],
}

/// An exit-delivery strategy. Modules are pure strategies: the manager owns
/// their queues and they never retain handles across calls.
#[async_trait]
pub trait DeliveryModule: Send {
    /// Stable, filesystem-safe name.
    fn name(&self) -> &'static str;

    /// The exit types this module claims.
    fn exit_types(&self) -> &[u16];

    fn config_sections(&self) -> &'static [SectionSpec] {
        &[]
    }

    /// Read the module's configuration; say whether it should receive
    /// traffic.
    fn configure(&mut self, config: &ServerConfig) -> Result<ModuleDisposition, ConfigError>;

    /// Descriptor fragment advertised while the module is enabled.
    fn server_info_block(&self) -> String {
        String::new()
    }

    /// Modules whose delivery is instantaneous and loss-tolerant can skip
    /// durable queueing; their messages are processed at accept time.
    fn wants_immediate_queue(&self) -> bool {
        false
    }

    /// Called when the module is enabled with its queue directory, before
    /// any traffic arrives.
    fn attach_queue_dir(&mut self, dir: &Path) -> Result<(), ConfigError> {
        let _ = dir;
        Ok(())
    }

    /// Deliver one message.
    async fn process(
        &mut self,
        payload: &[u8],
        tag: &DeliveryTag,
        exit_type: u16,
        exit_info: &[u8],
    ) -> DeliveryStatus;

    /// Called once after each drained batch.
    async fn end_batch(&mut self) {}
}

struct Slot {
    module: Box<dyn DeliveryModule>,
    state: ModuleState,
}

/// Owns the registered delivery modules, the exit-type dispatch table, and
/// each enabled module's durable delivery queue.
pub struct ModuleManager {
    queue_root: PathBuf,
    policy: RetryPolicy,
    slots: Vec<Slot>,
    type_map: HashMap<u16, usize>,
    queues: HashMap<String, DurableQueue>,
}

impl ModuleManager {
    pub fn new(queue_root: PathBuf, policy: RetryPolicy) -> Self {
        Self { queue_root, policy, slots: Vec::new(), type_map: HashMap::new(), queues: HashMap::new() }
    }

    /// Register a module without enabling it. Names and claimed config
    /// sections must be unique.
    pub fn register(&mut self, module: Box<dyn DeliveryModule>) -> Result<(), ConfigError> {
        for slot in &self.slots {
            if slot.module.name() == module.name() {
                return Err(ConfigError::Invalid(format!(
                    "module {} registered twice",
                    module.name()
                )));
            }
            for mine in slot.module.config_sections() {
                for theirs in module.config_sections() {
                    if mine.name == theirs.name {
                        return Err(ConfigError::Invalid(format!(
                            "multiple modules want to define [delivery.{}]",
                            mine.name
                        )));
                    }
                }
            }
        }
        log::info!("loading module {}", module.name());
        self.slots.push(Slot { module, state: ModuleState::Registered });
        Ok(())
    }

    /// Validate section schemas, then let each module configure itself and
    /// enable or disable accordingly.
    pub fn configure(&mut self, config: &ServerConfig) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.queue_root).map_err(|e| {
            ConfigError::Invalid(format!(
                "cannot create delivery queue root {}: {e}",
                self.queue_root.display()
            ))
        })?;

        self.validate_sections(config)?;
        for idx in 0..self.slots.len() {
            match self.slots[idx].module.configure(config)? {
                ModuleDisposition::Enable => self.enable(idx)?,
                ModuleDisposition::Disable => self.disable(idx),
            }
        }
        Ok(())
    }

    fn validate_sections(&self, config: &ServerConfig) -> Result<(), ConfigError> {
        for slot in &self.slots {
            for spec in slot.module.config_sections() {
                if !config.has_delivery_section(spec.name) {
                    continue;
                }
                for key in spec.required {
                    let present: Option<toml::Value> = config
                        .delivery_section::<toml::Value>(spec.name)?
                        .filter(|v| v.get(key).is_some());
                    if present.is_none() {
                        return Err(ConfigError::Missing {
                            section: format!("delivery.{}", spec.name),
                            key: (*key).to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn enable(&mut self, idx: usize) -> Result<(), ConfigError> {
        let name = self.slots[idx].module.name().to_string();
        let exit_types: Vec<u16> = self.slots[idx].module.exit_types().to_vec();
        for t in &exit_types {
            if let Some(&other) = self.type_map.get(t) {
                if other != idx {
                    log::warn!("more than one module is enabled for type {t:#06x}");
                }
            }
            self.type_map.insert(*t, idx);
        }

        if !self.slots[idx].module.wants_immediate_queue() {
            let dir = self.queue_root.join(&name);
            self.slots[idx].module.attach_queue_dir(&dir)?;
            let queue = DurableQueue::open(&dir, self.policy).map_err(|e| {
                ConfigError::Invalid(format!("cannot open delivery queue for {name}: {e}"))
            })?;
            self.queues.insert(name.clone(), queue);
        }
        self.slots[idx].state = ModuleState::Enabled;
        log::info!(
            "module {name}: enabled for types {:?}",
            exit_types.iter().map(|t| format!("{t:#06x}")).collect::<Vec<_>>()
        );
        Ok(())
    }

    fn disable(&mut self, idx: usize) {
        let name = self.slots[idx].module.name().to_string();
        if self.slots[idx].state == ModuleState::Enabled {
            log::info!("disabling module {name}");
        }
        self.type_map.retain(|_, owner| *owner != idx);
        self.queues.remove(&name);
        self.slots[idx].state = ModuleState::Registered;
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.slots
            .iter()
            .any(|s| s.module.name() == name && s.state == ModuleState::Enabled)
    }

    /// Route an exit message to the module claiming its type. The payload is
    /// decoded here, and the message is durably queued (or, for immediate
    /// modules, delivered) before this returns.
    pub async fn accept(
        &mut self,
        payload: &[u8],
        tag: Option<&[u8]>,
        exit_type: u16,
        exit_info: &[u8],
        now: u64,
    ) -> Result<(), PipelineError> {
        let Some(&idx) = self.type_map.get(&exit_type) else {
            log::warn!("unable to handle message with unknown type {exit_type:#06x}");
            return Ok(());
        };
        let name = self.slots[idx].module.name();
        log::debug!("delivering message (type {exit_type:#06x}) via module {name}");

        let (delivery_tag, body) = match decode_payload(payload, tag) {
            DecodedPayload::Plain(body) => (DeliveryTag::Clear, body),
            DecodedPayload::StillEncrypted => {
                let tag = tag.map(<[u8]>::to_vec).unwrap_or_default();
                (DeliveryTag::Encrypted(tag), payload.to_vec())
            }
            DecodedPayload::Corrupt => (DeliveryTag::Corrupt, payload.to_vec()),
        };

        if self.slots[idx].module.wants_immediate_queue() {
            let status = self.slots[idx]
                .module
                .process(&body, &delivery_tag, exit_type, exit_info)
                .await;
            match status {
                DeliveryStatus::Ok => {}
                DeliveryStatus::Retry => {
                    log::error!("module {name}: unable to retry delivery for message");
                }
                DeliveryStatus::NoRetry => {
                    log::error!("module {name}: unable to deliver message");
                }
                DeliveryStatus::Error(err) => {
                    log::error!("module {name}: delivery failed: {err}");
                }
            }
            return Ok(());
        }

        let address = ExitAddress {
            exit_type,
            exit_info: exit_info.to_vec(),
            tag: delivery_tag,
        };
        let encoded =
            rmp_serde::to_vec(&address).map_err(|e| PipelineError::Codec(e.to_string()))?;
        let queue = self
            .queues
            .get(name)
            .ok_or_else(|| PipelineError::Codec(format!("no queue for module {name}")))?;
        queue.enqueue(&encoded, &body, now)?;
        Ok(())
    }

    /// Drain every enabled module's queue, delivering each ready message.
    pub async fn flush(&mut self, now: u64) -> usize {
        let mut delivered = 0;
        for idx in 0..self.slots.len() {
            if self.slots[idx].state != ModuleState::Enabled {
                continue;
            }
            let name = self.slots[idx].module.name().to_string();
            let Some(queue) = self.queues.get(&name) else {
                continue;
            };
            let entries = queue.drain(FLUSH_BATCH, now);
            if entries.is_empty() {
                continue;
            }

            for entry in entries {
                let address: ExitAddress = match rmp_serde::from_slice(&entry.address) {
                    Ok(address) => address,
                    Err(err) => {
                        log::error!("module {name}: unreadable queued address: {err}");
                        report(&name, queue.failed(&entry.handle, false, now));
                        continue;
                    }
                };
                let status = self.slots[idx]
                    .module
                    .process(&entry.payload, &address.tag, address.exit_type, &address.exit_info)
                    .await;
                match status {
                    DeliveryStatus::Ok => {
                        delivered += 1;
                        report(&name, queue.succeeded(&entry.handle));
                    }
                    DeliveryStatus::Retry => {
                        report(&name, queue.failed(&entry.handle, true, now));
                    }
                    DeliveryStatus::NoRetry => {
                        log::warn!("module {name}: unable to deliver message");
                        report(&name, queue.failed(&entry.handle, false, now));
                    }
                    DeliveryStatus::Error(err) => {
                        // Internal module failure: one retry, then drop.
                        let retriable = entry.retry_count == 0;
                        log::error!("module {name}: delivery failed: {err}");
                        report(&name, queue.failed(&entry.handle, retriable, now));
                    }
                }
            }
            self.slots[idx].module.end_batch().await;
        }
        delivered
    }

    pub fn clean(&self) {
        for queue in self.queues.values() {
            queue.clean();
        }
    }

    pub fn count(&self) -> usize {
        self.queues.values().map(DurableQueue::count).sum()
    }

    /// Descriptor fragments for every enabled module, in registration order.
    pub fn server_info_blocks(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| s.state == ModuleState::Enabled)
            .map(|s| s.module.server_info_block())
            .filter(|block| !block.is_empty())
            .collect()
    }
}

fn report(name: &str, result: Result<(), minion_queue::QueueError>) {
    if let Err(err) = result {
        log::error!("module {name}: queue bookkeeping failed: {err}");
    }
}
