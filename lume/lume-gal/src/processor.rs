//! Per-queue submission front end with pooled command buffers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, ThreadId};

use crate::command::CommandBuffer;
use crate::device::DeviceShared;
use crate::error::{GalError, GalResult};
use crate::state::{QueueKind, SubmissionToken};

type FreeList = Mutex<Vec<CommandBuffer>>;

/// Hands out command buffers for one queue and commits them.
///
/// Recycled buffers go to a free list owned by the recycling thread, so threads
/// recording in parallel never contend on the same list. A thread whose own list
/// has nothing reusable takes a finished buffer from another thread's list, which
/// also drains the lists of threads that have exited.
pub struct CommandProcessor {
    device: Arc<DeviceShared>,
    queue: QueueKind,
    pools: RwLock<HashMap<ThreadId, FreeList>>,
}

impl std::fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("queue", &self.queue)
            .field("pooled", &self.pooled())
            .finish_non_exhaustive()
    }
}

impl CommandProcessor {
    pub(crate) fn new(device: Arc<DeviceShared>, queue: QueueKind) -> Self {
        Self {
            device,
            queue,
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    /// A command buffer in the `Initial` state, reused from a free list when one
    /// has finished executing. This thread's list is tried first.
    pub fn command_buffer(&self) -> CommandBuffer {
        let id = thread::current().id();
        let reused = {
            let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
            pools
                .get(&id)
                .and_then(|list| {
                    take_reusable(&mut list.lock().unwrap_or_else(|e| e.into_inner()))
                })
                .or_else(|| {
                    // Lists busy with their owner are skipped rather than waited on.
                    pools
                        .iter()
                        .filter(|(owner, _)| **owner != id)
                        .find_map(|(_, list)| take_reusable(&mut *list.try_lock().ok()?))
                })
        };
        match reused {
            Some(mut buffer) => match buffer.reset() {
                Ok(()) => buffer,
                Err(err) => {
                    log::warn!("dropping pooled command buffer: {err}");
                    CommandBuffer::new(self.device.clone(), self.queue)
                }
            },
            None => CommandBuffer::new(self.device.clone(), self.queue),
        }
    }

    /// Submits a closed command buffer. Returns immediately; the token tracks completion.
    pub fn commit(&self, buffer: &mut CommandBuffer) -> GalResult<SubmissionToken> {
        if buffer.queue() != self.queue {
            return Err(GalError::invalid_state(format!(
                "command buffer recorded for {:?} committed to the {:?} processor",
                buffer.queue(),
                self.queue
            )));
        }
        self.device.commit(buffer)
    }

    /// Returns a buffer to the calling thread's free list. It is handed out again
    /// once its last submission has completed.
    pub fn recycle(&self, buffer: CommandBuffer) {
        if buffer.queue() != self.queue {
            log::warn!(
                "not pooling a {:?} command buffer in the {:?} processor",
                buffer.queue(),
                self.queue
            );
            return;
        }
        let id = thread::current().id();
        {
            let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
            if let Some(list) = pools.get(&id) {
                list.lock().unwrap_or_else(|e| e.into_inner()).push(buffer);
                return;
            }
        }
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        pools
            .entry(id)
            .or_default()
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .push(buffer);
    }

    /// Buffers waiting in free lists across all threads.
    pub fn pooled(&self) -> usize {
        let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
        pools
            .values()
            .map(|list| list.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }
}

fn take_reusable(list: &mut Vec<CommandBuffer>) -> Option<CommandBuffer> {
    let index = list.iter().position(CommandBuffer::is_reusable)?;
    Some(list.swap_remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandBufferState;
    use crate::config::ContextConfig;
    use crate::context::{BackendKind, GraphicsContext};
    use crate::device::Device;

    fn device() -> Device {
        GraphicsContext::create_with_config(BackendKind::Headless, ContextConfig::default())
            .and_then(|context| context.create_device())
            .unwrap()
    }

    fn run_empty(processor: &CommandProcessor) -> CommandBuffer {
        let mut commands = processor.command_buffer();
        assert_eq!(commands.state(), CommandBufferState::Initial);
        commands.begin().unwrap();
        commands.end().unwrap();
        processor.commit(&mut commands).unwrap();
        commands.wait().unwrap();
        commands
    }

    #[test]
    fn threads_record_and_recycle_concurrently() {
        let device = device();
        let processor = device.command_processor(QueueKind::Compute);
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..8 {
                        let commands = run_empty(&processor);
                        processor.recycle(commands);
                    }
                });
            }
        });
        assert_eq!(device.statistics().submissions, 32);
        assert!(processor.pooled() >= 1);
    }

    #[test]
    fn buffers_recycled_by_exited_threads_are_reused() {
        let device = device();
        let processor = device.command_processor(QueueKind::Graphics);
        thread::scope(|scope| {
            scope.spawn(|| processor.recycle(run_empty(&processor)));
        });
        assert_eq!(processor.pooled(), 1);
        let commands = processor.command_buffer();
        assert_eq!(processor.pooled(), 0);
        assert_eq!(commands.state(), CommandBufferState::Initial);
    }
}
