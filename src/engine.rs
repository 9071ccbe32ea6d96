//! File encryption engine
//!
//! [`ClientContext`] holds the process-wide client state (configuration,
//! custodian handle, cached session, approval broker). [`Engine`] runs one
//! file operation at a time as a sequential pipeline:
//!
//! ```text
//! encrypt: approval? -> key manager -> chunk reader -> worker pool -> container writer
//! decrypt: container trailer -> key manager -> chunk reader -> worker pool -> output file
//! ```

use crate::accel::{BackendKind, Dispatcher};
use crate::approval::{ApprovalBroker, ApprovalGate, ApprovalRequest, PushChannel, SessionStore};
use crate::chunk::split;
use crate::config::Config;
use crate::container::{self, AtomicOutput, ContainerVariant, ContainerWriter};
use crate::crypto::{random_iv, PrivateKey};
use crate::custodian::{CompletionNotice, Custodian, HttpCustodian};
use crate::error::{Error, Result};
use crate::executor::{ProgressObserver, Scaled, WorkerPool};
use crate::keys::{KeyManager, KeyRequest, KeyState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Client state shared by every operation of one installation
pub struct ClientContext {
    config: Config,
    custodian: Arc<dyn Custodian>,
    sessions: SessionStore,
    session: OnceCell<String>,
    broker: ApprovalBroker,
}

impl ClientContext {
    /// Context talking to the configured HTTP custodian
    pub fn new(config: Config) -> Result<Self> {
        let custodian = Arc::new(HttpCustodian::new(&config.server)?);
        Ok(Self::with_custodian(config, custodian))
    }

    pub fn with_custodian(config: Config, custodian: Arc<dyn Custodian>) -> Self {
        let sessions = SessionStore::new(config.session_file());
        ClientContext {
            config,
            custodian,
            sessions,
            session: OnceCell::new(),
            broker: ApprovalBroker::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn custodian(&self) -> Arc<dyn Custodian> {
        Arc::clone(&self.custodian)
    }

    pub fn broker(&self) -> &ApprovalBroker {
        &self.broker
    }

    /// Session identifier, loaded from disk or registered on first use
    pub async fn session(&self) -> Result<String> {
        let id = self
            .session
            .get_or_try_init(|| async {
                if let Some(id) = self.sessions.load()? {
                    debug!("Reusing session {}", id);
                    return Ok(id);
                }
                self.register_and_save().await
            })
            .await?;
        Ok(id.clone())
    }

    /// Register a fresh session and persist it, replacing any cached one.
    /// The in-process session is only set if it was not yet initialized.
    pub async fn register(&self) -> Result<String> {
        let id = self.register_and_save().await?;
        let _ = self.session.set(id.clone());
        Ok(id)
    }

    async fn register_and_save(&self) -> Result<String> {
        let id = self.custodian.register_session().await?;
        if id.trim().is_empty() {
            return Err(Error::SessionUnavailable(
                "custodian returned an empty session id".to_string(),
            ));
        }
        self.sessions.save(&id)?;
        info!("Registered session {}", id);
        Ok(id)
    }

    /// Push channel bound to this context's broker
    pub fn push_channel(&self) -> PushChannel {
        PushChannel::new(
            self.broker.clone(),
            self.config.server.client_id.clone(),
            self.config.server.heartbeat_interval(),
        )
    }
}

/// Options for [`Engine::encrypt_file`]
#[derive(Default)]
pub struct EncryptOptions {
    /// Container path; `<input>.enc` when unset
    pub output: Option<PathBuf>,
    /// Derive the key from a passphrase
    pub passphrase: Option<Zeroizing<String>>,
    /// Override `approval.required`
    pub require_approval: Option<bool>,
}

/// Options for [`Engine::decrypt_file`]
#[derive(Default)]
pub struct DecryptOptions {
    /// Output path; derived from the container name when unset
    pub output: Option<PathBuf>,
    /// Unwrap remote keys locally instead of asking the custodian
    pub private_key: Option<PrivateKey>,
}

/// Outcome of a successful encryption
#[derive(Debug, Clone)]
pub struct EncryptReport {
    pub output: PathBuf,
    pub variant: ContainerVariant,
    pub plaintext_len: u64,
    pub container_len: u64,
    pub chunk_count: u32,
    /// Session the encryption was approved under
    pub session_id: Option<String>,
    pub key_path: Vec<KeyState>,
}

/// Outcome of a successful decryption
#[derive(Debug, Clone)]
pub struct DecryptReport {
    pub output: PathBuf,
    pub variant: ContainerVariant,
    pub plaintext_len: u64,
    pub chunk_count: u32,
}

/// Runs file operations for one client context
pub struct Engine {
    context: Arc<ClientContext>,
    keys: KeyManager,
    dispatcher: Arc<Dispatcher>,
    pool: WorkerPool,
}

impl Engine {
    /// Engine with backends probed from the acceleration config
    pub fn new(context: Arc<ClientContext>) -> Self {
        let dispatcher = Dispatcher::probe(&context.config().acceleration);
        Self::with_dispatcher(context, dispatcher)
    }

    pub fn with_dispatcher(context: Arc<ClientContext>, dispatcher: Dispatcher) -> Self {
        let config = context.config();
        let keys = KeyManager::new(context.custodian(), config);
        let pool = WorkerPool::new(config.encryption.workers(), config.encryption.task_timeout());
        Engine {
            context,
            keys,
            dispatcher: Arc::new(dispatcher),
            pool,
        }
    }

    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Encrypt `input` into a container
    pub async fn encrypt_file(
        &self,
        input: &Path,
        options: EncryptOptions,
        progress: &dyn ProgressObserver,
    ) -> Result<EncryptReport> {
        let file_size = check_input(input)?;
        let output = options.output.unwrap_or_else(|| container::encrypted_path(input));
        if output == input {
            return Err(Error::InvalidConfig(
                "container path must differ from the input path".to_string(),
            ));
        }
        let file_name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let require_approval = options
            .require_approval
            .unwrap_or(self.context.config().approval.required);

        let mut session_id = None;
        let mut issued = None;
        let cipher_progress = if require_approval {
            let session = self.context.session().await?;
            let approval = &self.context.config().approval;
            let gate = ApprovalGate::new(
                self.context.custodian(),
                self.context.broker().clone(),
                approval.timeout(),
                approval.poll_interval(),
            );
            let request = ApprovalRequest::for_file(input, file_size, &session);
            let result = gate.await_approval(&request, progress).await?;
            issued = result.symmetric_key.map(|key| (key, result.salt));
            session_id = Some(session);
            Scaled::new(progress, 10, 90)
        } else {
            Scaled::new(progress, 0, 100)
        };

        let resolution = self
            .keys
            .resolve_encrypt_key(KeyRequest {
                file_name,
                file_size,
                passphrase: options.passphrase,
                issued,
            })
            .await?;

        let chunks = split(input, container::CHUNK_SIZE)?;
        let layout = *chunks.layout();
        let base_iv = random_iv();
        let mut writer = ContainerWriter::create(&output, &base_iv, layout.plaintext_len())?;

        info!(
            "Encrypting {} ({} bytes, {} chunks) with {} worker(s)",
            input.display(),
            layout.plaintext_len(),
            layout.chunk_count(),
            self.pool.workers()
        );

        let dispatcher = Arc::clone(&self.dispatcher);
        let key = resolution.key.clone();
        self.pool
            .execute(
                chunks,
                layout.chunk_count(),
                move |chunk| dispatcher.encrypt_chunk(chunk, &key, &base_iv),
                |_, ciphertext| writer.write_chunk(&ciphertext),
                &cipher_progress,
            )
            .await?;

        let container_len = writer.finish(&resolution.trailer, &resolution.key)?;
        cipher_progress.percent(100);
        let variant = if resolution.is_remote() {
            ContainerVariant::Remote
        } else {
            ContainerVariant::Local
        };
        info!(
            "Wrote {:?} container {} ({} bytes)",
            variant,
            output.display(),
            container_len
        );

        if let Some(session) = &session_id {
            let container_name = output
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let notice = CompletionNotice::completed(session, &container_name, container_len);
            if let Err(e) = self.context.custodian().notify_completed(&notice).await {
                warn!("Completion notice for session {} not delivered: {}", session, e);
            }
        }

        Ok(EncryptReport {
            output,
            variant,
            plaintext_len: layout.plaintext_len(),
            container_len,
            chunk_count: layout.chunk_count(),
            session_id,
            key_path: resolution.path,
        })
    }

    /// Decrypt a container. Nothing is written unless the whole file decrypts.
    pub async fn decrypt_file(
        &self,
        input: &Path,
        options: DecryptOptions,
        progress: &dyn ProgressObserver,
    ) -> Result<DecryptReport> {
        check_input(input)?;
        let info = container::inspect(input)?;

        let key = self
            .keys
            .resolve_decrypt_key(info.stored_key.clone(), options.private_key.as_ref())
            .await?;

        let output = options.output.unwrap_or_else(|| container::decrypted_path(input));
        if output == input {
            return Err(Error::InvalidConfig(
                "output path must differ from the container path".to_string(),
            ));
        }

        let chunks = container::ciphertext_chunks(input, &info)?;
        let chunk_count = chunks.layout().chunk_count();
        let mut out = AtomicOutput::create(&output)?;

        info!(
            "Decrypting {} ({:?}, {} chunks)",
            input.display(),
            info.variant,
            chunk_count
        );

        let dispatcher = Arc::clone(&self.dispatcher);
        let base_iv = info.iv;
        self.pool
            .execute(
                chunks,
                chunk_count,
                move |chunk| dispatcher.decrypt_chunk(chunk, &key, &base_iv),
                |_, plaintext| out.write(&plaintext),
                progress,
            )
            .await?;

        out.finish(info.plaintext_len)?;
        progress.percent(100);
        info!("Wrote {} ({} bytes)", output.display(), info.plaintext_len);

        Ok(DecryptReport {
            output,
            variant: info.variant,
            plaintext_len: info.plaintext_len,
            chunk_count,
        })
    }

    /// Backends usable by this engine, in fallback order
    pub fn backends(&self) -> Vec<BackendKind> {
        self.dispatcher.capabilities().iter().collect()
    }
}

/// Length of a readable regular file
fn check_input(path: &Path) -> Result<u64> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::InputNotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_file() {
        return Err(Error::NotAFile(path.to_path_buf()));
    }
    Ok(metadata.len())
}
