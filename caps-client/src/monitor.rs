use caps_protocol::MonitorInfo;

use crate::swapchain::CapsSwapchain;

pub type MonitorId = String;

/// Where a monitor sits in the acquire/submit cycle.
///
/// `Idle` accepts `acquire_frame`, `Acquired` accepts `swap_buffers`,
/// `Submitted` waits for the compositor's frame_done. Removal of the monitor
/// abandons the cycle wherever it stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FramePhase {
	Idle,
	Acquired,
	Submitted,
}

pub(crate) struct MonitorEntry {
	pub info: MonitorInfo,
	/// Allocated lazily on the first `acquire_frame` for this monitor.
	pub swapchain: Option<CapsSwapchain>,
	pub phase: FramePhase,
}

impl MonitorEntry {
	pub fn new(info: MonitorInfo) -> Self {
		Self {
			info,
			swapchain: None,
			phase: FramePhase::Idle,
		}
	}
}
