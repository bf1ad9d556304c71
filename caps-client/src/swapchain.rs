use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use caps_protocol::{BufferIndex, FramebufferLinkPayload};

#[cfg(feature = "gbm")]
use crate::error::CapsClientError;
use crate::monitor::MonitorId;

/// Distinguishes a monitor's successive pools, so a target minted before a
/// removal cannot submit against the replacement pool's identical indices.
static POOL_GENERATION: AtomicU64 = AtomicU64::new(0);

/// One scanout buffer of a monitor's pool.
///
/// The descriptor and its metadata are fixed at allocation; `fd` stays open
/// for the lifetime of the buffer so the compositor's import remains valid.
#[derive(Debug)]
pub struct CapsBuffer {
	pub index: BufferIndex,
	fd: OwnedFd,
	width: i32,
	height: i32,
	stride: i32,
	offset: i32,
	fourcc: i32,
	/// Keeps the GPU allocation alive alongside the exported descriptor.
	#[cfg(feature = "gbm")]
	bo: Option<gbm::BufferObject<()>>,
}

impl CapsBuffer {
	pub(crate) fn from_shm(
		index: BufferIndex,
		fd: OwnedFd,
		width: i32,
		height: i32,
		stride: i32,
		fourcc: i32,
	) -> Self {
		Self {
			index,
			fd,
			width,
			height,
			stride,
			offset: 0,
			fourcc,
			#[cfg(feature = "gbm")]
			bo: None,
		}
	}

	#[cfg(feature = "gbm")]
	pub(crate) fn from_bo(
		index: BufferIndex,
		bo: gbm::BufferObject<()>,
	) -> Result<Self, CapsClientError> {
		let fd = bo
			.fd()
			.map_err(|err| CapsClientError::Allocation(err.to_string()))?;
		Ok(Self {
			index,
			fd,
			width: bo.width() as i32,
			height: bo.height() as i32,
			stride: bo.stride() as i32,
			offset: bo.offset(0) as i32,
			fourcc: bo.format() as u32 as i32,
			bo: Some(bo),
		})
	}

	pub fn width(&self) -> i32 {
		self.width
	}

	pub fn height(&self) -> i32 {
		self.height
	}

	pub fn stride(&self) -> i32 {
		self.stride
	}

	pub fn offset(&self) -> i32 {
		self.offset
	}

	pub fn fourcc(&self) -> i32 {
		self.fourcc
	}

	pub fn fd(&self) -> RawFd {
		self.fd.as_raw_fd()
	}

	pub(crate) fn try_clone_fd(&self) -> std::io::Result<OwnedFd> {
		self.fd.try_clone()
	}
}

/// Double-buffered pool for one monitor.
///
/// `busy` tracks buffers the compositor still scans out of; they come back
/// through buffer_release on the swap channel. Acquisition prefers the buffer
/// not rendered to last so the compositor can keep presenting the other one.
#[derive(Debug)]
pub struct CapsSwapchain {
	monitor_id: MonitorId,
	generation: u64,
	buffers: [CapsBuffer; 2],
	current: usize,
	/// Pre-acquire cursor, consumed by `rollback` or `mark_busy`.
	undo: Option<usize>,
	busy: [bool; 2],
}

impl CapsSwapchain {
	pub fn new(monitor_id: MonitorId, buffers: [CapsBuffer; 2]) -> Self {
		Self {
			monitor_id,
			generation: POOL_GENERATION.fetch_add(1, Ordering::Relaxed),
			buffers,
			current: 0,
			undo: None,
			busy: [false; 2],
		}
	}

	pub fn monitor_id(&self) -> &str {
		&self.monitor_id
	}

	pub fn generation(&self) -> u64 {
		self.generation
	}

	/// Picks a free buffer, or `None` when the compositor holds both.
	pub fn acquire_next(&mut self) -> Option<(&CapsBuffer, BufferIndex)> {
		let preferred = self.current ^ 1;
		let slot = [preferred, self.current]
			.into_iter()
			.find(|&slot| !self.busy[slot])?;
		self.undo = Some(self.current);
		self.current = slot;
		Some((&self.buffers[slot], self.buffers[slot].index))
	}

	/// Reverts the last `acquire_next` that was not yet submitted.
	pub fn rollback(&mut self) {
		if let Some(previous) = self.undo.take() {
			self.current = previous;
		}
	}

	pub fn current(&self) -> (&CapsBuffer, BufferIndex) {
		(&self.buffers[self.current], self.buffers[self.current].index)
	}

	pub fn mark_busy(&mut self, index: BufferIndex) {
		self.busy[index as usize] = true;
		self.undo = None;
	}

	/// Returns whether the buffer was actually outstanding.
	pub fn mark_released(&mut self, index: BufferIndex) -> bool {
		let slot = index as usize;
		let was_busy = self.busy[slot];
		self.busy[slot] = false;
		was_busy
	}

	pub fn framebuffer_link_payload(&self) -> FramebufferLinkPayload {
		let buffer = &self.buffers[0];
		FramebufferLinkPayload {
			monitor_id: self.monitor_id.clone(),
			width: buffer.width(),
			height: buffer.height(),
			stride: buffer.stride(),
			offset: buffer.offset(),
			fourcc: buffer.fourcc(),
		}
	}

	pub fn export_fds(&self) -> [RawFd; 2] {
		[self.buffers[0].fd(), self.buffers[1].fd()]
	}
}

/// Exclusive dmabuf view attached to a [`FrameTarget`].
///
/// Holds a duplicate of the buffer's descriptor, closed when the target is
/// dropped or submitted.
#[derive(Debug)]
pub struct DmabufDescriptor {
	fd: OwnedFd,
	stride: i32,
	offset: i32,
	fourcc: i32,
}

impl DmabufDescriptor {
	pub(crate) fn new(fd: OwnedFd, stride: i32, offset: i32, fourcc: i32) -> Self {
		Self {
			fd,
			stride,
			offset,
			fourcc,
		}
	}

	pub fn fd(&self) -> BorrowedFd<'_> {
		self.fd.as_fd()
	}

	pub fn stride(&self) -> i32 {
		self.stride
	}

	pub fn offset(&self) -> i32 {
		self.offset
	}

	pub fn fourcc(&self) -> i32 {
		self.fourcc
	}
}

/// Render destination handed out by `acquire_frame` and consumed by
/// `swap_buffers`.
///
/// Passing it back by value is the submission; dropping it without submitting
/// merely closes the descriptor duplicate while the buffer stays acquired
/// until the monitor disappears or the connection ends.
#[derive(Debug)]
pub struct FrameTarget {
	monitor_id: MonitorId,
	buffer: BufferIndex,
	generation: u64,
	width: i32,
	height: i32,
	/// Renderer-owned handle slots, zero until the caller binds the dmabuf.
	pub framebuffer: u32,
	pub texture: u32,
	dmabuf: Option<DmabufDescriptor>,
}

impl FrameTarget {
	pub(crate) fn new(
		monitor_id: MonitorId,
		buffer: BufferIndex,
		generation: u64,
		width: i32,
		height: i32,
		dmabuf: Option<DmabufDescriptor>,
	) -> Self {
		Self {
			monitor_id,
			buffer,
			generation,
			width,
			height,
			framebuffer: 0,
			texture: 0,
			dmabuf,
		}
	}

	pub fn monitor_id(&self) -> &str {
		&self.monitor_id
	}

	pub fn buffer_index(&self) -> BufferIndex {
		self.buffer
	}

	pub(crate) fn generation(&self) -> u64 {
		self.generation
	}

	pub fn width(&self) -> i32 {
		self.width
	}

	pub fn height(&self) -> i32 {
		self.height
	}

	pub fn dmabuf(&self) -> Option<&DmabufDescriptor> {
		self.dmabuf.as_ref()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::fs::File;

	fn null_fd() -> OwnedFd {
		OwnedFd::from(File::open("/dev/null").unwrap())
	}

	fn test_swapchain() -> CapsSwapchain {
		let buffers = [
			CapsBuffer::from_shm(BufferIndex::Zero, null_fd(), 64, 32, 256, 0x3432_5258),
			CapsBuffer::from_shm(BufferIndex::One, null_fd(), 64, 32, 256, 0x3432_5258),
		];
		CapsSwapchain::new("m0".to_string(), buffers)
	}

	#[test]
	fn acquire_prefers_the_alternate_buffer() {
		let mut chain = test_swapchain();
		let (_, first) = chain.acquire_next().unwrap();
		assert_eq!(first, BufferIndex::One);
		chain.mark_busy(first);

		let (_, second) = chain.acquire_next().unwrap();
		assert_eq!(second, BufferIndex::Zero);
	}

	#[test]
	fn exhausted_pool_returns_none() {
		let mut chain = test_swapchain();
		chain.mark_busy(BufferIndex::Zero);
		chain.mark_busy(BufferIndex::One);
		assert!(chain.acquire_next().is_none());
	}

	#[test]
	fn rollback_restores_the_previous_cursor() {
		let mut chain = test_swapchain();
		let before = chain.current().1;
		chain.acquire_next().unwrap();
		chain.rollback();
		assert_eq!(chain.current().1, before);
	}

	#[test]
	fn rollback_after_submit_is_a_no_op() {
		let mut chain = test_swapchain();
		let (_, index) = chain.acquire_next().unwrap();
		chain.mark_busy(index);
		chain.rollback();
		assert_eq!(chain.current().1, index);
	}

	#[test]
	fn release_reopens_an_exhausted_pool() {
		let mut chain = test_swapchain();
		chain.mark_busy(BufferIndex::Zero);
		chain.mark_busy(BufferIndex::One);

		assert!(chain.mark_released(BufferIndex::Zero));
		let (_, index) = chain.acquire_next().unwrap();
		assert_eq!(index, BufferIndex::Zero);
	}

	#[test]
	fn releasing_an_idle_buffer_is_flagged() {
		let mut chain = test_swapchain();
		assert!(!chain.mark_released(BufferIndex::One));
	}

	#[test]
	fn link_payload_describes_the_pool() {
		let chain = test_swapchain();
		let payload = chain.framebuffer_link_payload();
		assert_eq!(payload.monitor_id, "m0");
		assert_eq!(payload.width, 64);
		assert_eq!(payload.height, 32);
		assert_eq!(payload.stride, 256);
		assert_eq!(payload.offset, 0);
		assert_eq!(payload.fourcc, 0x3432_5258);
	}

	#[test]
	fn replacement_pools_get_fresh_generations() {
		let first = test_swapchain();
		let second = test_swapchain();
		assert_ne!(first.generation(), second.generation());
	}

	#[test]
	fn dmabuf_descriptor_borrows_the_duplicate() {
		let fd = null_fd();
		let raw = fd.as_raw_fd();
		let dmabuf = DmabufDescriptor::new(fd, 256, 0, 0x3432_5258);
		assert_eq!(dmabuf.fd().as_raw_fd(), raw);
		assert_eq!(dmabuf.stride(), 256);
		assert_eq!(dmabuf.offset(), 0);
		assert_eq!(dmabuf.fourcc(), 0x3432_5258);
	}
}
