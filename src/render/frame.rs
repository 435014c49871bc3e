// Frames in flight
//
// Each frame slot owns the command buffer, sync objects and uniform storage
// for one frame. Slots are reused round-robin; a slot is only touched again
// once its fence shows the GPU is done with it.
//
// FRAME TIMELINE:
// ┌──────────────────────────────────────────────────────────────────────┐
// │  wait_fence ─> acquire ─> reset_fence ─> record ─> submit ─> present │
// │                   │                                           │      │
// │             out of date:                          stale or resized:  │
// │             recreate, skip frame                  recreate swapchain │
// └──────────────────────────────────────────────────────────────────────┘

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::backend::buffer::{BufferUsage, GpuBuffer};
use crate::backend::sync::{Fence, Semaphore};
use crate::backend::GraphicsContext;

use super::uniforms::{align_up, StaticMatrices};

/// Result of asking the swapchain for an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready { image_index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented (or dropped) but the swapchain no longer matches the surface
    Stale,
}

/// Staleness becomes an outcome, every other failure is fatal
pub fn classify_acquire(result: VkResult<(u32, bool)>) -> Result<AcquireOutcome> {
    match result {
        Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Ready {
            image_index,
            suboptimal,
        }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
        Err(e) => Err(e).context("Failed to acquire swapchain image"),
    }
}

pub fn classify_present(result: VkResult<bool>) -> Result<PresentOutcome> {
    match result {
        Ok(false) => Ok(PresentOutcome::Presented),
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
        Err(e) => Err(e).context("Failed to present swapchain image"),
    }
}

/// The GPU work behind one frame, driven by [`FramePacer`]
pub trait FrameSteps {
    /// Block until the slot's fence is signaled
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;
    /// Reset the slot's fence; only called once an image was acquired
    fn reset_slot(&mut self, slot: usize) -> Result<()>;
    /// Start the command buffer and render pass on `image_index`
    fn begin_recording(&mut self, slot: usize, image_index: u32) -> Result<()>;
    /// End recording and submit, signalling the slot's fence
    fn finish_and_submit(&mut self, slot: usize) -> Result<()>;
    fn present_image(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;
    /// Whether the swapchain no longer matches the surface
    fn swapchain_stale(&self) -> bool;
    fn mark_swapchain_stale(&mut self);
    /// Rebuild the swapchain, `false` (still stale) while the window is minimized
    fn recreate_swapchain(&mut self) -> Result<bool>;
}

/// Frame-in-flight bookkeeping: which slot is next and whether a frame is
/// being recorded. Swapchain staleness is owned by the [`FrameSteps`].
#[derive(Debug)]
pub struct FramePacer {
    frames_in_flight: usize,
    index: usize,
    image_index: Option<u32>,
}

impl FramePacer {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            index: 0,
            image_index: None,
        }
    }

    /// Start a frame. Returns `false` when there is nothing to record into
    /// (swapchain out of date or window minimized).
    pub fn begin(&mut self, steps: &mut impl FrameSteps) -> Result<bool> {
        assert!(
            self.image_index.is_none(),
            "begin_frame called while a frame is already being recorded"
        );

        if steps.swapchain_stale() && !steps.recreate_swapchain()? {
            return Ok(false);
        }

        let slot = self.index;
        steps.wait_for_slot(slot)?;

        match steps.acquire_image(slot)? {
            AcquireOutcome::OutOfDate => {
                // Fence stays signaled, the retry waits on it for free
                steps.mark_swapchain_stale();
                steps.recreate_swapchain()?;
                Ok(false)
            }
            AcquireOutcome::Ready {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    steps.mark_swapchain_stale();
                }
                steps.reset_slot(slot)?;
                steps.begin_recording(slot, image_index)?;
                self.image_index = Some(image_index);
                Ok(true)
            }
        }
    }

    /// Submit and present the frame started by [`FramePacer::begin`]
    pub fn end(&mut self, steps: &mut impl FrameSteps) -> Result<()> {
        let Some(image_index) = self.image_index.take() else {
            panic!("end_frame called without a frame being recorded");
        };
        let slot = self.index;

        steps.finish_and_submit(slot)?;
        if steps.present_image(slot, image_index)? == PresentOutcome::Stale {
            steps.mark_swapchain_stale();
        }

        if steps.swapchain_stale() {
            steps.recreate_swapchain()?;
        }

        self.index = (self.index + 1) % self.frames_in_flight;
        Ok(())
    }

    /// Slot and image of the frame being recorded
    pub fn recording(&self) -> Option<(usize, u32)> {
        self.image_index.map(|image| (self.index, image))
    }

    #[cfg(test)]
    fn current_slot(&self) -> usize {
        self.index
    }
}

/// Resources dropped only once no submitted frame can still use them
///
/// Items are stamped with the number of frames submitted when they were
/// queued. After the fence of the slot about to be reused has been waited,
/// every submission older than `frames_in_flight` frames has retired.
pub struct DeletionQueue<T> {
    pending: VecDeque<(u64, T)>,
    frames_in_flight: u64,
}

impl<T> DeletionQueue<T> {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight: frames_in_flight.max(1) as u64,
        }
    }

    /// Queue `item`; `submitted` frames may still reference it
    pub fn push(&mut self, item: T, submitted: u64) {
        self.pending.push_back((submitted, item));
    }

    /// Drop what has retired; call right after waiting on the fence of the
    /// slot that submission number `submitted` will use. Returns how many
    /// items were dropped.
    pub fn collect(&mut self, submitted: u64) -> usize {
        let mut dropped = 0;
        // Stamps never decrease, so only the front can be due
        while matches!(
            self.pending.front(),
            Some((queued, _)) if *queued + self.frames_in_flight <= submitted + 1
        ) {
            self.pending.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// Drop everything; only valid once the device or every slot is idle
    pub fn flush(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Placement of aligned records inside a growable buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaCursor {
    stride: u64,
    used: u64,
    capacity: u64,
}

impl ArenaCursor {
    pub fn new(record_size: u64, alignment: u64, capacity: u64) -> Self {
        Self {
            stride: align_up(record_size, alignment),
            used: 0,
            capacity: capacity.max(1),
        }
    }

    /// Offset for the next record, and the new capacity if the buffer must grow first
    pub fn next(&mut self) -> (u64, Option<u64>) {
        let grow = if self.used == self.capacity {
            self.capacity *= 2;
            Some(self.capacity)
        } else {
            None
        };
        let offset = self.used * self.stride;
        self.used += 1;
        (offset, grow)
    }

    pub fn rewind(&mut self) {
        self.used = 0;
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn byte_capacity(&self) -> u64 {
        self.capacity * self.stride
    }
}

/// Host-visible uniform storage holding one aligned record per draw
pub struct UniformArena {
    buffer: GpuBuffer,
    cursor: ArenaCursor,
    record_size: u64,
    // Outgrown buffers may still be referenced by this frame's commands
    retired: Vec<GpuBuffer>,
    context: Arc<GraphicsContext>,
}

impl UniformArena {
    pub fn new(context: &Arc<GraphicsContext>, record_size: u64, capacity: u64) -> Result<Self> {
        let cursor = ArenaCursor::new(record_size, context.uniform_offset_alignment(), capacity);
        let buffer = GpuBuffer::new(
            context,
            cursor.byte_capacity(),
            BufferUsage::Uniform,
            "material arena",
        )?;

        Ok(Self {
            buffer,
            cursor,
            record_size,
            retired: Vec::new(),
            context: context.clone(),
        })
    }

    /// Forget all records. Only valid once the owning slot's fence has signaled.
    pub fn rewind(&mut self) {
        self.cursor.rewind();
        self.retired.clear();
    }

    /// Append `record`, returning the buffer and range to bind it with
    pub fn push<T: bytemuck::Pod>(&mut self, record: &T) -> Result<vk::DescriptorBufferInfo> {
        let (offset, grow) = self.cursor.next();
        if let Some(capacity) = grow {
            let bigger = GpuBuffer::new(
                &self.context,
                self.cursor.byte_capacity(),
                BufferUsage::Uniform,
                "material arena",
            )?;
            log::debug!("Material arena grown to {} records", capacity);
            self.retired.push(std::mem::replace(&mut self.buffer, bigger));
        }

        self.buffer.write(offset, std::slice::from_ref(record))?;

        Ok(vk::DescriptorBufferInfo {
            buffer: self.buffer.handle,
            offset,
            range: self.record_size,
        })
    }
}

/// Everything one frame in flight owns
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub image_available: Semaphore,
    pub render_finished: Semaphore,
    pub in_flight: Fence,
    pub static_matrices: GpuBuffer,
    pub materials: UniformArena,
}

impl FrameSlot {
    pub fn new(
        context: &Arc<GraphicsContext>,
        command_buffer: vk::CommandBuffer,
        material_record_size: u64,
    ) -> Result<Self> {
        Ok(Self {
            command_buffer,
            image_available: Semaphore::new(context)?,
            render_finished: Semaphore::new(context)?,
            // Signaled so the first wait on a fresh slot returns at once
            in_flight: Fence::new(context, true)?,
            static_matrices: GpuBuffer::new(
                context,
                std::mem::size_of::<StaticMatrices>() as u64,
                BufferUsage::Uniform,
                "static matrices",
            )?,
            materials: UniformArena::new(context, material_record_size, 64)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Stands in for a GPU buffer; flags when it is dropped
    struct Tracked(Rc<Cell<bool>>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Reset(usize),
        Begin(usize, u32),
        Submit(usize),
        Present(usize, u32),
        Recreate,
    }

    /// Records the calls and tracks fences the way the GPU would
    struct MockSteps {
        calls: Vec<Call>,
        fence_signaled: Vec<bool>,
        waited_since_submit: Vec<bool>,
        acquires: VecDeque<AcquireOutcome>,
        presents: VecDeque<PresentOutcome>,
        minimized: bool,
        stale: bool,
        next_image: u32,
        submitted: u64,
        retired: DeletionQueue<Tracked>,
    }

    impl MockSteps {
        fn new(slots: usize) -> Self {
            Self {
                calls: Vec::new(),
                fence_signaled: vec![true; slots],
                waited_since_submit: vec![true; slots],
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                minimized: false,
                stale: false,
                next_image: 0,
                submitted: 0,
                retired: DeletionQueue::new(slots),
            }
        }
    }

    impl FrameSteps for MockSteps {
        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            // Waiting returns once the GPU retires the slot's submission
            self.fence_signaled[slot] = true;
            self.waited_since_submit[slot] = true;
            self.retired.collect(self.submitted);
            self.calls.push(Call::Wait(slot));
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire(slot));
            Ok(self.acquires.pop_front().unwrap_or_else(|| {
                let image_index = self.next_image;
                self.next_image = (self.next_image + 1) % 3;
                AcquireOutcome::Ready {
                    image_index,
                    suboptimal: false,
                }
            }))
        }

        fn reset_slot(&mut self, slot: usize) -> Result<()> {
            assert!(self.fence_signaled[slot], "reset of an unsignaled fence");
            assert!(self.waited_since_submit[slot], "slot reused without a wait");
            self.fence_signaled[slot] = false;
            self.calls.push(Call::Reset(slot));
            Ok(())
        }

        fn begin_recording(&mut self, slot: usize, image_index: u32) -> Result<()> {
            self.calls.push(Call::Begin(slot, image_index));
            Ok(())
        }

        fn finish_and_submit(&mut self, slot: usize) -> Result<()> {
            self.waited_since_submit[slot] = false;
            self.submitted += 1;
            self.calls.push(Call::Submit(slot));
            Ok(())
        }

        fn present_image(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
            self.calls.push(Call::Present(slot, image_index));
            Ok(self
                .presents
                .pop_front()
                .unwrap_or(PresentOutcome::Presented))
        }

        fn swapchain_stale(&self) -> bool {
            self.stale
        }

        fn mark_swapchain_stale(&mut self) {
            self.stale = true;
        }

        fn recreate_swapchain(&mut self) -> Result<bool> {
            self.calls.push(Call::Recreate);
            self.stale = self.minimized;
            Ok(!self.minimized)
        }
    }

    fn run_frame(pacer: &mut FramePacer, steps: &mut MockSteps) -> bool {
        let began = pacer.begin(steps).unwrap();
        if began {
            pacer.end(steps).unwrap();
        }
        began
    }

    #[test]
    fn slots_rotate_with_backpressure() {
        let mut pacer = FramePacer::new(2);
        let mut steps = MockSteps::new(2);

        for _ in 0..6 {
            assert!(run_frame(&mut pacer, &mut steps));
        }

        let resets: Vec<usize> = steps
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Reset(slot) => Some(*slot),
                _ => None,
            })
            .collect();
        assert_eq!(resets, vec![0, 1, 0, 1, 0, 1]);

        // Every reset is directly preceded by the wait and acquire for that slot
        for (i, call) in steps.calls.iter().enumerate() {
            if let Call::Reset(slot) = call {
                assert_eq!(steps.calls[i - 2], Call::Wait(*slot));
                assert_eq!(steps.calls[i - 1], Call::Acquire(*slot));
            }
        }
    }

    #[test]
    fn out_of_date_acquire_skips_frame_and_retries() {
        let mut pacer = FramePacer::new(2);
        let mut steps = MockSteps::new(2);
        steps.acquires.push_back(AcquireOutcome::OutOfDate);

        assert!(!pacer.begin(&mut steps).unwrap());
        assert_eq!(
            steps.calls,
            vec![Call::Wait(0), Call::Acquire(0), Call::Recreate]
        );
        assert!(steps.fence_signaled[0], "fence must be left untouched");
        assert_eq!(pacer.recording(), None);
        assert_eq!(pacer.current_slot(), 0);

        steps.calls.clear();
        assert!(pacer.begin(&mut steps).unwrap());
        assert_eq!(
            steps.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Reset(0),
                Call::Begin(0, 0)
            ]
        );
        assert_eq!(pacer.recording(), Some((0, 0)));
    }

    #[test]
    fn suboptimal_acquire_renders_then_recreates() {
        let mut pacer = FramePacer::new(2);
        let mut steps = MockSteps::new(2);
        steps.acquires.push_back(AcquireOutcome::Ready {
            image_index: 1,
            suboptimal: true,
        });

        assert!(run_frame(&mut pacer, &mut steps));
        assert_eq!(
            steps.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Reset(0),
                Call::Begin(0, 1),
                Call::Submit(0),
                Call::Present(0, 1),
                Call::Recreate,
            ]
        );
        assert!(!steps.stale);
        assert_eq!(pacer.current_slot(), 1);
    }

    #[test]
    fn stale_present_triggers_recreation() {
        let mut pacer = FramePacer::new(3);
        let mut steps = MockSteps::new(3);
        steps.presents.push_back(PresentOutcome::Stale);

        assert!(run_frame(&mut pacer, &mut steps));
        assert_eq!(steps.calls.last(), Some(&Call::Recreate));
    }

    #[test]
    fn resize_recreates_after_present() {
        let mut pacer = FramePacer::new(2);
        let mut steps = MockSteps::new(2);

        assert!(pacer.begin(&mut steps).unwrap());
        steps.mark_swapchain_stale();
        pacer.end(&mut steps).unwrap();

        let n = steps.calls.len();
        assert_eq!(steps.calls[n - 2], Call::Present(0, 0));
        assert_eq!(steps.calls[n - 1], Call::Recreate);
    }

    #[test]
    fn minimized_window_declines_until_restored() {
        let mut pacer = FramePacer::new(2);
        let mut steps = MockSteps::new(2);
        steps.minimized = true;
        steps.mark_swapchain_stale();

        assert!(!pacer.begin(&mut steps).unwrap());
        assert!(!pacer.begin(&mut steps).unwrap());
        assert_eq!(steps.calls, vec![Call::Recreate, Call::Recreate]);
        assert!(steps.stale);

        steps.minimized = false;
        assert!(pacer.begin(&mut steps).unwrap());
        assert!(!steps.stale);
    }

    #[test]
    fn out_of_date_while_minimized_stays_stale() {
        let mut pacer = FramePacer::new(2);
        let mut steps = MockSteps::new(2);
        steps.minimized = true;
        steps.acquires.push_back(AcquireOutcome::OutOfDate);

        assert!(!pacer.begin(&mut steps).unwrap());
        assert!(steps.stale);
        // Next attempt goes straight to the rebuild, no acquire
        steps.calls.clear();
        assert!(!pacer.begin(&mut steps).unwrap());
        assert_eq!(steps.calls, vec![Call::Recreate]);
    }

    #[test]
    fn retired_resource_outlives_frames_that_used_it() {
        let mut pacer = FramePacer::new(2);
        let mut steps = MockSteps::new(2);
        let dropped = Rc::new(Cell::new(false));

        // Submission 0 draws with the resource, then it is removed
        assert!(run_frame(&mut pacer, &mut steps));
        steps
            .retired
            .push(Tracked(dropped.clone()), steps.submitted);

        // Slot 1 wait says nothing about submission 0
        assert!(run_frame(&mut pacer, &mut steps));
        assert!(!dropped.get());
        assert_eq!(steps.retired.len(), 1);

        // Waiting on slot 0 again retires submission 0
        assert!(pacer.begin(&mut steps).unwrap());
        assert!(dropped.get());
        assert_eq!(steps.retired.len(), 0);
        pacer.end(&mut steps).unwrap();
    }

    #[test]
    fn deletion_queue_keeps_stamp_order() {
        let mut queue = DeletionQueue::new(3);
        queue.push("a", 0);
        queue.push("b", 1);
        queue.push("c", 4);

        assert_eq!(queue.collect(1), 0);
        assert_eq!(queue.collect(2), 1);
        assert_eq!(queue.collect(5), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.flush(), 1);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    #[should_panic(expected = "without a frame being recorded")]
    fn end_without_begin_panics() {
        let mut pacer = FramePacer::new(2);
        let mut steps = MockSteps::new(2);
        pacer.end(&mut steps).unwrap();
    }

    #[test]
    fn acquire_classification() {
        assert_eq!(
            classify_acquire(Ok((2, false))).unwrap(),
            AcquireOutcome::Ready {
                image_index: 2,
                suboptimal: false
            }
        );
        assert_eq!(
            classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            AcquireOutcome::OutOfDate
        );
        assert!(classify_acquire(Err(vk::Result::ERROR_DEVICE_LOST)).is_err());
    }

    #[test]
    fn present_classification() {
        assert_eq!(
            classify_present(Ok(false)).unwrap(),
            PresentOutcome::Presented
        );
        assert_eq!(classify_present(Ok(true)).unwrap(), PresentOutcome::Stale);
        assert_eq!(
            classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            PresentOutcome::Stale
        );
        assert!(classify_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR)).is_err());
    }

    #[test]
    fn arena_offsets_are_aligned_and_grow() {
        let mut cursor = ArenaCursor::new(80, 256, 2);
        assert_eq!(cursor.stride(), 256);
        assert_eq!(cursor.next(), (0, None));
        assert_eq!(cursor.next(), (256, None));
        assert_eq!(cursor.next(), (512, Some(4)));
        assert_eq!(cursor.byte_capacity(), 1024);

        cursor.rewind();
        assert_eq!(cursor.next(), (0, None));
    }
}
