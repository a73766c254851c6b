use async_trait::async_trait;
use minion_types::{DeliveryTag, DROP_TYPE};

use crate::config::{ConfigError, ServerConfig};
use crate::modules::{DeliveryModule, DeliveryStatus, ModuleDisposition};

/// Swallows padding traffic. Always enabled, never persists anything: drop
/// messages are cover traffic and need not survive a crash.
#[derive(Default)]
pub struct DropModule {
    dropped: u64,
}

impl DropModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[async_trait]
impl DeliveryModule for DropModule {
    fn name(&self) -> &'static str {
        "DROP"
    }

    fn exit_types(&self) -> &[u16] {
        &[DROP_TYPE]
    }

    fn configure(&mut self, _config: &ServerConfig) -> Result<ModuleDisposition, ConfigError> {
        Ok(ModuleDisposition::Enable)
    }

    fn wants_immediate_queue(&self) -> bool {
        true
    }

    async fn process(
        &mut self,
        _payload: &[u8],
        _tag: &DeliveryTag,
        _exit_type: u16,
        _exit_info: &[u8],
    ) -> DeliveryStatus {
        log::debug!("dropping padding message");
        self.dropped += 1;
        DeliveryStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn padding_is_counted_and_accepted() {
        let mut module = DropModule::new();
        let status = module.process(b"junk", &DeliveryTag::Clear, DROP_TYPE, &[]).await;
        assert_eq!(status, DeliveryStatus::Ok);
        assert_eq!(module.dropped(), 1);
    }
}
