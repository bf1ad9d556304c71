use caps_protocol::{BufferIndex, MonitorInfo};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd::ftruncate;
use tracing::debug;

use crate::config::BufferBacking;
use crate::error::CapsClientError;
use crate::swapchain::{CapsBuffer, CapsSwapchain};

/// drm XR24, 4 bytes per pixel with the high byte unused.
pub const FOURCC_XRGB8888: i32 = 0x3432_5258;

const BYTES_PER_PIXEL: i32 = 4;

/// Backing store chosen at connect time from [`BufferBacking`].
pub(crate) enum BufferAllocator {
	Shm(ShmAllocator),
	#[cfg(feature = "gbm")]
	Gbm(gbm_backend::GbmAllocator),
}

impl BufferAllocator {
	pub fn new(backing: &BufferBacking) -> Result<Self, CapsClientError> {
		match backing {
			BufferBacking::Shm => Ok(Self::Shm(ShmAllocator)),
			#[cfg(feature = "gbm")]
			BufferBacking::RenderNode(path) => {
				Ok(Self::Gbm(gbm_backend::GbmAllocator::new(Some(path))?))
			}
			BufferBacking::Auto => {
				#[cfg(feature = "gbm")]
				{
					match gbm_backend::GbmAllocator::new(None) {
						Ok(allocator) => return Ok(Self::Gbm(allocator)),
						Err(err) => {
							debug!(error = %err, "no usable render node, using shared memory");
						}
					}
				}
				Ok(Self::Shm(ShmAllocator))
			}
		}
	}

	pub fn create_swapchain(
		&self,
		monitor: &MonitorInfo,
	) -> Result<CapsSwapchain, CapsClientError> {
		match self {
			Self::Shm(shm) => shm.create_swapchain(monitor),
			#[cfg(feature = "gbm")]
			Self::Gbm(gbm) => gbm.create_swapchain(monitor),
		}
	}
}

/// Anonymous shared-memory buffers, tightly packed XR24.
pub(crate) struct ShmAllocator;

impl ShmAllocator {
	pub fn create_swapchain(
		&self,
		monitor: &MonitorInfo,
	) -> Result<CapsSwapchain, CapsClientError> {
		if monitor.width <= 0 || monitor.height <= 0 {
			return Err(CapsClientError::InvalidMonitorDimensions);
		}
		let stride = monitor
			.width
			.checked_mul(BYTES_PER_PIXEL)
			.ok_or(CapsClientError::InvalidMonitorDimensions)?;
		let buffers = [
			Self::allocate(monitor, BufferIndex::Zero, stride)?,
			Self::allocate(monitor, BufferIndex::One, stride)?,
		];
		debug!(monitor = %monitor.id, stride, "allocated shm swapchain");
		Ok(CapsSwapchain::new(monitor.id.clone(), buffers))
	}

	fn allocate(
		monitor: &MonitorInfo,
		index: BufferIndex,
		stride: i32,
	) -> Result<CapsBuffer, CapsClientError> {
		let fd = memfd_create(c"caps-buffer", MemFdCreateFlag::MFD_CLOEXEC)?;
		ftruncate(&fd, i64::from(stride) * i64::from(monitor.height))?;
		Ok(CapsBuffer::from_shm(
			index,
			fd,
			monitor.width,
			monitor.height,
			stride,
			FOURCC_XRGB8888,
		))
	}
}

#[cfg(feature = "gbm")]
mod gbm_backend {
	use std::fs::{File, OpenOptions};
	use std::path::{Path, PathBuf};

	use caps_protocol::{BufferIndex, MonitorInfo};
	use gbm::{BufferObjectFlags, Device, Format};
	use tracing::{debug, warn};

	use crate::error::CapsClientError;
	use crate::swapchain::{CapsBuffer, CapsSwapchain};

	const DEFAULT_RENDER_NODES: [&str; 8] = [
		"/dev/dri/renderD128",
		"/dev/dri/renderD129",
		"/dev/dri/renderD130",
		"/dev/dri/renderD131",
		"/dev/dri/renderD132",
		"/dev/dri/renderD133",
		"/dev/dri/renderD134",
		"/dev/dri/renderD135",
	];

	/// GPU-backed allocation through a DRM render node.
	pub(crate) struct GbmAllocator {
		device: Device<File>,
		format: Format,
		usage: BufferObjectFlags,
	}

	impl GbmAllocator {
		pub fn new(configured_node: Option<&Path>) -> Result<Self, CapsClientError> {
			let mut last_error = None;
			for candidate in render_node_candidates(configured_node) {
				match OpenOptions::new().read(true).write(true).open(&candidate) {
					Ok(file) => match Device::new(file) {
						Ok(device) => {
							debug!(node = %candidate.display(), "opened gbm device");
							return Ok(Self {
								device,
								format: Format::Xrgb8888,
								usage: BufferObjectFlags::SCANOUT
									| BufferObjectFlags::RENDERING
									| BufferObjectFlags::LINEAR,
							});
						}
						Err(err) => {
							warn!(node = %candidate.display(), error = %err, "gbm device init failed");
							last_error =
								Some(CapsClientError::Allocation(err.to_string()));
						}
					},
					Err(err) => {
						last_error = Some(CapsClientError::RenderNodeOpen {
							path: candidate,
							source: err,
						});
					}
				}
			}
			Err(last_error
				.unwrap_or_else(|| CapsClientError::Allocation("no render node found".into())))
		}

		pub fn create_swapchain(
			&self,
			monitor: &MonitorInfo,
		) -> Result<CapsSwapchain, CapsClientError> {
			let width = u32::try_from(monitor.width)
				.map_err(|_| CapsClientError::InvalidMonitorDimensions)?;
			let height = u32::try_from(monitor.height)
				.map_err(|_| CapsClientError::InvalidMonitorDimensions)?;
			let buffers = [
				CapsBuffer::from_bo(BufferIndex::Zero, self.create_bo(width, height)?)?,
				CapsBuffer::from_bo(BufferIndex::One, self.create_bo(width, height)?)?,
			];
			debug!(monitor = %monitor.id, "allocated gbm swapchain");
			Ok(CapsSwapchain::new(monitor.id.clone(), buffers))
		}

		fn create_bo(
			&self,
			width: u32,
			height: u32,
		) -> Result<gbm::BufferObject<()>, CapsClientError> {
			self.device
				.create_buffer_object::<()>(width, height, self.format, self.usage)
				.map_err(|err| CapsClientError::Allocation(err.to_string()))
		}
	}

	/// An explicitly configured node is the only candidate; the defaults are
	/// probed only when nothing names a node.
	pub(super) fn render_node_candidates(configured: Option<&Path>) -> Vec<PathBuf> {
		if let Some(path) = configured {
			vec![path.to_path_buf()]
		} else if let Ok(node) = std::env::var("CAPS_CLIENT_RENDER_NODE") {
			vec![PathBuf::from(node)]
		} else {
			DEFAULT_RENDER_NODES.iter().map(PathBuf::from).collect()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn monitor(width: i32, height: i32) -> MonitorInfo {
		MonitorInfo {
			id: "m0".to_string(),
			width,
			height,
			refresh_rate: 60,
			name: "eDP-1".to_string(),
		}
	}

	#[test]
	fn shm_swapchain_is_tightly_packed() {
		let chain = ShmAllocator.create_swapchain(&monitor(800, 600)).unwrap();
		let payload = chain.framebuffer_link_payload();
		assert_eq!(payload.width, 800);
		assert_eq!(payload.height, 600);
		assert_eq!(payload.stride, 800 * 4);
		assert_eq!(payload.offset, 0);
		assert_eq!(payload.fourcc, FOURCC_XRGB8888);

		let [first, second] = chain.export_fds();
		assert_ne!(first, second);
	}

	#[test]
	fn nonpositive_dimensions_are_rejected() {
		let result = ShmAllocator.create_swapchain(&monitor(0, 600));
		assert!(matches!(
			result,
			Err(CapsClientError::InvalidMonitorDimensions)
		));

		let result = ShmAllocator.create_swapchain(&monitor(800, -1));
		assert!(matches!(
			result,
			Err(CapsClientError::InvalidMonitorDimensions)
		));
	}

	#[cfg(feature = "gbm")]
	#[test]
	fn a_configured_render_node_is_the_only_candidate() {
		use std::path::{Path, PathBuf};

		let configured = Path::new("/dev/dri/renderD200");
		let candidates = gbm_backend::render_node_candidates(Some(configured));
		assert_eq!(candidates, vec![PathBuf::from("/dev/dri/renderD200")]);

		assert!(!gbm_backend::render_node_candidates(None).is_empty());
	}
}
