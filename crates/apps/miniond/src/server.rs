use std::time::Duration;

use minion_keys::{KeyError, KeyRing};
use minion_queue::{HashLog, QueueError};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, ServerConfig};
use crate::handler::{FramedOnionLayer, PacketHandler};
use crate::incoming::{DrainOutcome, IncomingQueue};
use crate::mixpool::{MixPool, TimedMix};
use crate::modules::drop_module::DropModule;
use crate::modules::mbox::MboxModule;
use crate::modules::smtp::{MixmasterSmtpModule, TcpSmtpRelay};
use crate::modules::ModuleManager;
use crate::outgoing::OutgoingQueue;
use crate::transport::{spawn_listener, MmtpClient, TcpMmtpClient};
use crate::{unix_now, PipelineError};

const BOOTSTRAP_KEY_SPAN: u64 = 30 * 86_400;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wires the queues, the packet handler, the module manager, and the
/// transport into one pipeline, and drives the mix clock over them.
pub struct Server {
    config: ServerConfig,
    keyring: KeyRing,
    live_key_name: String,
    handler: PacketHandler,
    incoming: IncomingQueue,
    pool: MixPool<TimedMix>,
    outgoing: OutgoingQueue,
    modules: ModuleManager,
    client: TcpMmtpClient,
    packet_rx: mpsc::Receiver<Vec<u8>>,
    listener_task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Server {
    pub async fn bootstrap(
        config: ServerConfig,
        cancel: CancellationToken,
    ) -> Result<Self, ServerError> {
        log::debug!("initializing server");
        let queue_dir = config.queue_dir();

        log::debug!("initializing delivery modules");
        let smtp_name = if config.nickname.is_empty() {
            "localhost".to_string()
        } else {
            config.nickname.clone()
        };
        let mut modules = ModuleManager::new(queue_dir.join("deliver"), config.retry);
        modules.register(Box::new(DropModule::new()))?;
        modules.register(Box::new(MboxModule::new(Box::new(TcpSmtpRelay::new(smtp_name)))))?;
        modules.register(Box::new(MixmasterSmtpModule::new()))?;
        modules.configure(&config)?;

        let mut keyring = KeyRing::open(config.key_ring_config(modules.server_info_blocks()))?;
        let now = unix_now();
        if keyring.live_key(now).is_none() {
            log::info!("no live key; generating a month's worth of keys");
            let lifetime = config.public_key_lifetime.max(1);
            let count = BOOTSTRAP_KEY_SPAN.div_ceil(lifetime).max(1);
            keyring.create(count as u32, None, now)?;
        }
        keyring.dh_params()?;

        log::debug!("initializing packet handler");
        let keyset = keyring.live_keyset(now)?;
        let live_key_name = keyset.name.clone();
        let handler = PacketHandler::new(
            Box::new(FramedOnionLayer::new(&keyset)),
            HashLog::open(&keyset.hash_log_path)?,
        );

        let incoming = IncomingQueue::open(&queue_dir.join("incoming"), config.retry)?;
        log::debug!("found {} pending messages in incoming queue", incoming.count());
        let pool = MixPool::new(TimedMix::open(&queue_dir.join("mix"), config.mix_interval)?);
        log::debug!("found {} pending messages in mix pool", pool.count());
        let outgoing = OutgoingQueue::open(&queue_dir.join("outgoing"), config.retry)?;
        log::debug!("found {} pending messages in outgoing queue", outgoing.count());

        let client = TcpMmtpClient::new(
            Duration::from_secs(config.send_timeout),
            keyset.mmtp_cert.clone(),
        );

        let listen_addr = format!("{}:{}", config.incoming_ip, config.incoming_port);
        let listener = TcpListener::bind(&listen_addr).await?;
        log::info!("listening for relay connections on {listen_addr}");
        let (packet_tx, packet_rx) = mpsc::channel(256);
        let listener_task = spawn_listener(listener, packet_tx, cancel.clone());

        Ok(Self {
            config,
            keyring,
            live_key_name,
            handler,
            incoming,
            pool,
            outgoing,
            modules,
            client,
            packet_rx,
            listener_task,
            cancel,
        })
    }

    /// Drive the pipeline until cancelled: service the network until each
    /// mix tick, then sync the replay log, mix, and flush.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let mix_interval = self.config.mix_interval;
        let clean_interval = self.config.clean_interval.max(1);
        let mut next_mix = unix_now() + mix_interval;
        let mut next_clean = unix_now() + clean_interval;

        'main: loop {
            loop {
                let now = unix_now();
                if now >= next_mix {
                    break;
                }
                let wait = Duration::from_secs((next_mix - now).min(1));
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'main,
                    received = self.packet_rx.recv() => {
                        let Some(bytes) = received else {
                            log::warn!("transport listener stopped; shutting down");
                            break 'main;
                        };
                        if let Err(err) = self.incoming.queue_packet(&bytes, unix_now()) {
                            log::error!("failed to queue received packet: {err}");
                        }
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
                let outcome =
                    self.incoming.drain_into(&mut self.handler, &self.pool, unix_now());
                if outcome != DrainOutcome::default() {
                    log::debug!(
                        "incoming: {} pooled, {} padding, {} replays, {} rejected",
                        outcome.processed,
                        outcome.padding_dropped,
                        outcome.replays,
                        outcome.rejected
                    );
                }
            }

            // The replay log must be durable before any of this batch's side
            // effects happen.
            self.handler.sync_log()?;

            let now = unix_now();
            let stats = self.pool.mix(&self.outgoing, &mut self.modules, now).await;
            log::debug!(
                "mix tick: released {} messages ({} relay, {} exit)",
                stats.released,
                stats.relayed,
                stats.exited
            );
            self.outgoing.flush(&mut self.client, now).await;
            self.modules.flush(now).await;

            let now = unix_now();
            next_mix = now + mix_interval;
            if now >= next_clean {
                log::debug!("expunging deleted messages from queues");
                self.incoming.clean();
                self.pool.clean();
                self.outgoing.clean();
                self.modules.clean();
                next_clean = now + clean_interval;
            }

            self.check_rotation(now)?;
        }

        self.shutdown()
    }

    /// Swap in the newly live key set when the old one expires: fresh packet
    /// handler over the new hash log, fresh transport credentials.
    fn check_rotation(&mut self, now: u64) -> Result<(), ServerError> {
        let Some(live) = self.keyring.live_key(now) else {
            log::error!("no server key is live");
            return Err(KeyError::NoLiveKey.into());
        };
        if live.name == self.live_key_name {
            return Ok(());
        }
        let name = live.name.clone();
        log::info!("rotating from key {} to key {name}", self.live_key_name);

        let keyset = self.keyring.live_keyset(now)?;
        let fresh = PacketHandler::new(
            Box::new(FramedOnionLayer::new(&keyset)),
            HashLog::open(&keyset.hash_log_path)?,
        );
        let old = std::mem::replace(&mut self.handler, fresh);
        old.close()?;
        self.client.rotate(keyset.mmtp_cert.clone());
        self.live_key_name = name;
        Ok(())
    }

    fn shutdown(self) -> Result<(), ServerError> {
        log::info!("server shutting down");
        self.listener_task.abort();
        self.handler.close()?;
        self.incoming.clean();
        self.pool.clean();
        self.outgoing.clean();
        self.modules.clean();
        log::info!("server is shut down");
        Ok(())
    }
}

/// Run the server until interrupted.
pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("interrupt received");
                cancel.cancel();
            }
        });
    }

    let server = Server::bootstrap(config, cancel).await?;
    log::info!("starting server");
    server.run().await
}
