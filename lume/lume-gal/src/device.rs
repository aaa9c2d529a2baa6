//! Opened device: queues, submission and the blocking helpers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{Backend, BackendStatistics, Submission};
use crate::buffer::Buffer;
use crate::command::{Command, CommandBuffer, CommandBufferState};
use crate::config::ContextConfig;
use crate::context::{BackendKind, Capabilities};
use crate::error::{GalError, GalResult};
use crate::factory::ResourceFactory;
use crate::processor::CommandProcessor;
use crate::resource::{Resource, ResourceBase};
use crate::state::{QueueKind, SubmissionToken, Tracked, TrackedState, Transition};
use crate::texture::{Texture, TextureRegion, TextureUsage};

/// State shared by the device and every object created from it.
pub(crate) struct DeviceShared {
    backend: Arc<dyn Backend>,
    config: ContextConfig,
    /// Serialises submissions and blocking helpers so that global resource
    /// states are read and published in submission order.
    submit_lock: Mutex<()>,
    last_submitted: [AtomicU64; QueueKind::COUNT],
}

impl std::fmt::Debug for DeviceShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceShared")
            .field("backend", &self.backend.kind())
            .field("device", &self.backend.capabilities().device_name)
            .finish_non_exhaustive()
    }
}

impl DeviceShared {
    fn new(backend: Arc<dyn Backend>, config: ContextConfig) -> Self {
        Self {
            backend,
            config,
            submit_lock: Mutex::new(()),
            last_submitted: Default::default(),
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn capabilities(&self) -> &Capabilities {
        self.backend.capabilities()
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Latest value handed out on `queue`, 0 before the first submission.
    pub fn last_submitted(&self, queue: QueueKind) -> u64 {
        self.last_submitted[queue.index()].load(Ordering::Acquire)
    }

    pub fn is_complete(&self, token: SubmissionToken) -> GalResult<bool> {
        Ok(self.backend.completed_value(token.queue)? >= token.value)
    }

    pub fn wait(&self, token: SubmissionToken, timeout: Option<Duration>) -> GalResult<bool> {
        if self.is_complete(token)? {
            return Ok(true);
        }
        self.backend.wait(token, timeout)
    }

    /// Blocks until no submitted work references the resource. Used on teardown,
    /// so failures are logged rather than returned.
    pub fn wait_for_usage(&self, base: &ResourceBase) {
        for token in base.usage.pending() {
            if let Err(err) = self.wait(token, None) {
                log::warn!(
                    "waiting for {} {} before release failed: {err}",
                    base.kind(),
                    base.describe()
                );
            }
        }
    }

    fn lock_submissions(&self) -> std::sync::MutexGuard<'_, ()> {
        self.submit_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> GalResult<()> {
        buffer.base().ensure_alive()?;
        buffer.check_range(offset, data.len() as u64)?;
        if data.is_empty() {
            return Ok(());
        }
        self.wait_for_usage(buffer.base());
        let _guard = self.lock_submissions();
        let state = buffer.state_cell().get().state;
        self.backend
            .write_buffer(buffer.native(), state, offset, data)
    }

    pub fn read_buffer(&self, buffer: &Buffer, offset: u64, len: u64) -> GalResult<Vec<u8>> {
        buffer.base().ensure_alive()?;
        buffer.check_range(offset, len)?;
        let mut out = vec![0u8; len as usize];
        if len == 0 {
            return Ok(out);
        }
        self.wait_for_usage(buffer.base());
        let _guard = self.lock_submissions();
        let state = buffer.state_cell().get().state;
        self.backend
            .read_buffer(buffer.native(), state, offset, &mut out)?;
        Ok(out)
    }

    pub fn upload_texture(
        &self,
        texture: &Texture,
        region: &TextureRegion,
        data: &[u8],
    ) -> GalResult<()> {
        texture.base().ensure_alive()?;
        region.validate(texture.descriptor())?;
        let expected = region.data_size(texture.format());
        if data.len() as u64 != expected {
            return Err(GalError::descriptor(format!(
                "upload of {} bytes into a region of {expected} bytes",
                data.len()
            )));
        }
        self.wait_for_usage(texture.base());
        let _guard = self.lock_submissions();
        let before = texture.state_cell().get().state;
        let after = self
            .backend
            .upload_texture(texture.native(), before, region, data)?;
        texture.state_cell().set(TrackedState {
            state: after,
            owner: None,
            released_to: None,
        });
        Ok(())
    }

    pub fn generate_mipmaps(&self, texture: &Texture) -> GalResult<()> {
        texture.base().ensure_alive()?;
        if !texture.usage().contains(TextureUsage::GENERATE_MIPMAPS) {
            return Err(GalError::UnsupportedUsage(format!(
                "texture {} was not created with GENERATE_MIPMAPS",
                texture.base().describe()
            )));
        }
        self.wait_for_usage(texture.base());
        let _guard = self.lock_submissions();
        let before = texture.state_cell().get().state;
        let after = self.backend.generate_mipmaps(texture.native(), before)?;
        texture.state_cell().set(TrackedState {
            state: after,
            owner: None,
            released_to: None,
        });
        Ok(())
    }

    /// Submits a closed command buffer.
    ///
    /// The state each resource was first used in is compared against its global
    /// state and only the differing ones get a fix-up transition, prepended as one
    /// barrier. Resources last owned by another queue are acquired with an
    /// ownership transfer and the submission waits on that queue's work.
    pub fn commit(&self, buffer: &mut CommandBuffer) -> GalResult<SubmissionToken> {
        let state = buffer.state();
        if state != CommandBufferState::Closed {
            return Err(GalError::invalid_state(format!(
                "commit() on a {state:?} command buffer; call end() first"
            )));
        }
        let queue = buffer.queue();
        let _guard = self.lock_submissions();

        let mut fixups = Vec::new();
        let mut waits: Vec<SubmissionToken> = Vec::new();
        for entry in buffer.uses() {
            let resource = &entry.resource;
            resource.base().ensure_alive()?;
            let global = resource.state_cell().get();
            let transfer = match global.owner {
                Some(owner) if owner != queue => {
                    if global.released_to != Some(queue) {
                        log::warn!(
                            "{} {} implicitly acquired by {queue:?} from {owner:?}",
                            resource.base().kind(),
                            resource.base().describe()
                        );
                    }
                    for token in resource.base().usage.pending() {
                        if token.queue == owner && !waits.contains(&token) && !self.is_complete(token)? {
                            waits.push(token);
                        }
                    }
                    Some((owner, queue))
                }
                _ => None,
            };
            if global.state != entry.first || transfer.is_some() {
                fixups.push(Transition {
                    target: resource.target(),
                    before: global.state,
                    after: entry.first,
                    queue_transfer: transfer,
                });
            }
        }

        let mut commands = Vec::new();
        if !fixups.is_empty() {
            log::debug!("{queue:?} commit: {} state fix-ups", fixups.len());
            commands.push(Command::Barrier(fixups));
        }
        commands.extend(buffer.take_commands());
        let submitted = self.backend.submit(&Submission {
            queue,
            commands: &commands,
            waits: &waits,
        });
        match submitted {
            Ok(token) => {
                self.last_submitted[queue.index()].fetch_max(token.value, Ordering::AcqRel);
                buffer.mark_submitted(token);
                log::debug!(
                    "{queue:?} submission {}: {} commands, {} waits",
                    token.value,
                    commands.len(),
                    waits.len()
                );
                Ok(token)
            }
            Err(err) => {
                buffer.mark_failed();
                Err(err)
            }
        }
    }
}

/// An opened adapter. Owns the resource factory and one command processor per queue.
pub struct Device {
    shared: Arc<DeviceShared>,
    factory: ResourceFactory,
    processors: [Arc<CommandProcessor>; QueueKind::COUNT],
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub(crate) fn new(backend: Arc<dyn Backend>, config: ContextConfig) -> Self {
        let shared = Arc::new(DeviceShared::new(backend, config));
        log::info!(
            "{} device '{}' opened",
            shared.backend.kind(),
            shared.capabilities().device_name
        );
        let processors =
            QueueKind::ALL.map(|queue| Arc::new(CommandProcessor::new(shared.clone(), queue)));
        Self {
            factory: ResourceFactory::new(shared.clone()),
            shared,
            processors,
        }
    }

    /// The sole construction point for resources of this device.
    pub fn factory(&self) -> &ResourceFactory {
        &self.factory
    }

    pub fn command_processor(&self, queue: QueueKind) -> Arc<CommandProcessor> {
        self.processors[queue.index()].clone()
    }

    pub fn capabilities(&self) -> &Capabilities {
        self.shared.capabilities()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.shared.backend.kind()
    }

    /// Blocks until `token` completes; returns false if `timeout` elapsed first.
    pub fn wait(&self, token: SubmissionToken, timeout: Option<Duration>) -> GalResult<bool> {
        self.shared.wait(token, timeout)
    }

    pub fn is_complete(&self, token: SubmissionToken) -> GalResult<bool> {
        self.shared.is_complete(token)
    }

    /// Blocks until every queue is idle.
    pub fn wait_idle(&self) -> GalResult<()> {
        self.shared.backend.wait_idle()
    }

    pub fn statistics(&self) -> BackendStatistics {
        self.shared.backend.statistics()
    }

    /// Blocking write through the update path.
    pub fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> GalResult<()> {
        self.shared.write_buffer(buffer, offset, data)
    }

    /// Blocking readback.
    pub fn read_buffer(&self, buffer: &Buffer, offset: u64, len: u64) -> GalResult<Vec<u8>> {
        self.shared.read_buffer(buffer, offset, len)
    }

    /// Blocking upload of tightly packed texels into one mip and layer.
    pub fn upload_texture(
        &self,
        texture: &Texture,
        region: &TextureRegion,
        data: &[u8],
    ) -> GalResult<()> {
        self.shared.upload_texture(texture, region, data)
    }

    /// Blocking box-filtered mip chain generation from mip 0.
    pub fn generate_mipmaps(&self, texture: &Texture) -> GalResult<()> {
        self.shared.generate_mipmaps(texture)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(err) = self.shared.backend.wait_idle() {
            log::warn!("wait_idle on device drop failed: {err}");
        }
    }
}
