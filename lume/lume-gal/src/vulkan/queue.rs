//! Queue submission with one timeline semaphore per queue kind, one-shot
//! blocking command buffers, and deferred destruction of objects the GPU may
//! still be reading.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ash::vk;

use crate::error::{GalError, GalResult};
use crate::state::{QueueKind, SubmissionToken};

use super::vk_error;

/// Native objects released once the submission that used them completes.
#[derive(Debug)]
pub(super) enum Garbage {
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
    Buffer(vk::Buffer, vk::DeviceMemory),
}

pub(super) fn destroy_garbage(device: &ash::Device, garbage: Vec<Garbage>) {
    for object in garbage {
        unsafe {
            match object {
                Garbage::RenderPass(pass) => device.destroy_render_pass(pass, None),
                Garbage::Framebuffer(framebuffer) => device.destroy_framebuffer(framebuffer, None),
                Garbage::Buffer(buffer, memory) => {
                    device.destroy_buffer(buffer, None);
                    device.free_memory(memory, None);
                }
            }
        }
    }
}

#[derive(Debug)]
struct InFlight {
    queue: QueueKind,
    value: u64,
    command_buffer: vk::CommandBuffer,
    garbage: Vec<Garbage>,
}

#[derive(Debug)]
struct QueueState {
    pool: vk::CommandPool,
    /// Signalled by one-shot submissions.
    fence: vk::Fence,
    /// Last timeline value handed out per queue kind.
    submitted: [u64; QueueKind::COUNT],
    in_flight: Vec<InFlight>,
}

/// The device queue every [`QueueKind`] is submitted to.
pub(super) struct Queues {
    queue: vk::Queue,
    timelines: [vk::Semaphore; QueueKind::COUNT],
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for Queues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queues")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Queues {
    pub fn new(device: &ash::Device, family: u32) -> GalResult<Self> {
        let queue = unsafe { device.get_device_queue(family, 0) };
        let mut queues = Self {
            queue,
            timelines: [vk::Semaphore::null(); QueueKind::COUNT],
            state: Mutex::new(QueueState {
                pool: vk::CommandPool::null(),
                fence: vk::Fence::null(),
                submitted: [0; QueueKind::COUNT],
                in_flight: Vec::new(),
            }),
        };
        if let Err(err) = queues.init(device, family) {
            queues.destroy(device);
            return Err(err);
        }
        Ok(queues)
    }

    fn init(&mut self, device: &ash::Device, family: u32) -> GalResult<()> {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                    | vk::CommandPoolCreateFlags::TRANSIENT,
            );
        state.pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| vk_error("create_command_pool", e))?;
        state.fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(|e| vk_error("create_fence", e))?;
        for timeline in &mut self.timelines {
            let mut type_info = vk::SemaphoreTypeCreateInfo::default()
                .semaphore_type(vk::SemaphoreType::TIMELINE)
                .initial_value(0);
            let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
            *timeline = unsafe { device.create_semaphore(&info, None) }
                .map_err(|e| vk_error("create_semaphore", e))?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate(device: &ash::Device, state: &QueueState) -> GalResult<vk::CommandBuffer> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(state.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { device.allocate_command_buffers(&allocate_info) }
            .map_err(|e| vk_error("allocate_command_buffers", e))?;
        let cmd = buffers
            .first()
            .copied()
            .ok_or_else(|| GalError::Backend("no command buffer allocated".into()))?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = unsafe { device.begin_command_buffer(cmd, &begin_info) } {
            unsafe { device.free_command_buffers(state.pool, &[cmd]) };
            return Err(vk_error("begin_command_buffer", e));
        }
        Ok(cmd)
    }

    /// Records into a fresh command buffer and submits it to `queue`, signalling the
    /// queue's timeline. Nothing is submitted if recording fails.
    pub fn submit(
        &self,
        device: &ash::Device,
        queue: QueueKind,
        waits: &[SubmissionToken],
        record: impl FnOnce(vk::CommandBuffer, &mut Vec<Garbage>) -> GalResult<()>,
    ) -> GalResult<SubmissionToken> {
        let mut state = self.lock();
        for wait in waits {
            if wait.value > state.submitted[wait.queue.index()] {
                return Err(GalError::invalid_state(format!(
                    "waiting on {:?} value {} which was never submitted",
                    wait.queue, wait.value
                )));
            }
        }
        self.retire(device, &mut state);
        let cmd = Self::allocate(device, &state)?;
        let mut garbage = Vec::new();
        let recorded = record(cmd, &mut garbage).and_then(|()| {
            unsafe { device.end_command_buffer(cmd) }.map_err(|e| vk_error("end_command_buffer", e))
        });
        let value = state.submitted[queue.index()] + 1;
        let submitted = recorded.and_then(|()| {
            let wait_semaphores: Vec<vk::Semaphore> = waits
                .iter()
                .map(|t| self.timelines[t.queue.index()])
                .collect();
            let wait_values: Vec<u64> = waits.iter().map(|t| t.value).collect();
            let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];
            let signal = [self.timelines[queue.index()]];
            let signal_values = [value];
            let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
                .wait_semaphore_values(&wait_values)
                .signal_semaphore_values(&signal_values);
            let submit_info = vk::SubmitInfo::default()
                .command_buffers(std::slice::from_ref(&cmd))
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .signal_semaphores(&signal)
                .push_next(&mut timeline_info);
            unsafe { device.queue_submit(self.queue, &[submit_info], vk::Fence::null()) }
                .map_err(|e| vk_error("queue_submit", e))
        });
        if let Err(err) = submitted {
            unsafe { device.free_command_buffers(state.pool, &[cmd]) };
            destroy_garbage(device, garbage);
            return Err(err);
        }
        state.submitted[queue.index()] = value;
        state.in_flight.push(InFlight {
            queue,
            value,
            command_buffer: cmd,
            garbage,
        });
        Ok(SubmissionToken { queue, value })
    }

    /// Records, submits and waits for a command buffer outside the timelines.
    pub fn immediate(
        &self,
        device: &ash::Device,
        record: impl FnOnce(vk::CommandBuffer, &mut Vec<Garbage>) -> GalResult<()>,
    ) -> GalResult<()> {
        let state = self.lock();
        let cmd = Self::allocate(device, &state)?;
        let mut garbage = Vec::new();
        let result = record(cmd, &mut garbage)
            .and_then(|()| {
                unsafe { device.end_command_buffer(cmd) }
                    .map_err(|e| vk_error("end_command_buffer", e))
            })
            .and_then(|()| {
                let submit_info =
                    vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
                unsafe { device.queue_submit(self.queue, &[submit_info], state.fence) }
                    .map_err(|e| vk_error("queue_submit", e))?;
                let waited = unsafe { device.wait_for_fences(&[state.fence], true, u64::MAX) }
                    .map_err(|e| vk_error("wait_for_fences", e));
                unsafe { device.reset_fences(&[state.fence]) }
                    .map_err(|e| vk_error("reset_fences", e))?;
                waited
            });
        unsafe { device.free_command_buffers(state.pool, &[cmd]) };
        destroy_garbage(device, garbage);
        result
    }

    pub fn completed(&self, device: &ash::Device, queue: QueueKind) -> GalResult<u64> {
        unsafe { device.get_semaphore_counter_value(self.timelines[queue.index()]) }
            .map_err(|e| vk_error("get_semaphore_counter_value", e))
    }

    pub fn wait(
        &self,
        device: &ash::Device,
        token: SubmissionToken,
        timeout: Option<Duration>,
    ) -> GalResult<bool> {
        let submitted = self.lock().submitted[token.queue.index()];
        if token.value > submitted {
            return Err(GalError::invalid_state(format!(
                "token {} on {:?} was never submitted (last {submitted})",
                token.value, token.queue
            )));
        }
        let semaphores = [self.timelines[token.queue.index()]];
        let values = [token.value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        let nanos = timeout.map_or(u64::MAX, |t| t.as_nanos().min(u64::MAX as u128) as u64);
        match unsafe { device.wait_semaphores(&wait_info, nanos) } {
            Ok(()) => {
                self.retire(device, &mut self.lock());
                Ok(true)
            }
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(vk_error("wait_semaphores", e)),
        }
    }

    pub fn wait_idle(&self, device: &ash::Device) -> GalResult<()> {
        let mut state = self.lock();
        unsafe { device.queue_wait_idle(self.queue) }.map_err(|e| vk_error("queue_wait_idle", e))?;
        self.retire(device, &mut state);
        Ok(())
    }

    /// Runs `f` with exclusive access to the native queue.
    pub fn with_queue<R>(&self, f: impl FnOnce(vk::Queue) -> R) -> R {
        let _state = self.lock();
        f(self.queue)
    }

    /// Frees command buffers and garbage of completed submissions.
    fn retire(&self, device: &ash::Device, state: &mut QueueState) {
        let mut completed = [None; QueueKind::COUNT];
        let mut i = 0;
        while i < state.in_flight.len() {
            let queue = state.in_flight[i].queue;
            let reached = *completed[queue.index()].get_or_insert_with(|| {
                self.completed(device, queue).unwrap_or(0)
            });
            if state.in_flight[i].value <= reached {
                let done = state.in_flight.swap_remove(i);
                unsafe { device.free_command_buffers(state.pool, &[done.command_buffer]) };
                destroy_garbage(device, done.garbage);
            } else {
                i += 1;
            }
        }
    }

    /// Releases everything; the device must be idle.
    pub fn destroy(&self, device: &ash::Device) {
        let mut state = self.lock();
        for done in state.in_flight.drain(..) {
            destroy_garbage(device, done.garbage);
        }
        unsafe {
            device.destroy_command_pool(state.pool, None);
            device.destroy_fence(state.fence, None);
            for &timeline in &self.timelines {
                device.destroy_semaphore(timeline, None);
            }
        }
        state.pool = vk::CommandPool::null();
        state.fence = vk::Fence::null();
    }
}
