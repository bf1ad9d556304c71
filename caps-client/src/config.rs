use std::path::{Path, PathBuf};

use caps_protocol::DEFAULT_SOCKET_PATH;

/// How swapchain buffers are backed.
///
/// `Auto` probes a GPU render node when the `gbm` feature is enabled and falls
/// back to anonymous shared memory otherwise. The explicit variants skip the
/// probe.
#[derive(Debug, Clone, Default)]
pub enum BufferBacking {
	#[default]
	Auto,
	Shm,
	#[cfg(feature = "gbm")]
	RenderNode(PathBuf),
}

/// Connection parameters for [`CapsClient::connect`](crate::CapsClient::connect).
///
/// Only the session token is mandatory; the compositor usually hands it to the
/// process through `SHIFT_SESSION_TOKEN`.
#[derive(Debug, Clone)]
pub struct CapsClientConfig {
	socket_path: PathBuf,
	token: String,
	backing: BufferBacking,
}

impl CapsClientConfig {
	pub fn new(token: impl Into<String>) -> Self {
		Self {
			socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
			token: token.into(),
			backing: BufferBacking::default(),
		}
	}

	pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.socket_path = path.into();
		self
	}

	pub fn backing(mut self, backing: BufferBacking) -> Self {
		self.backing = backing;
		self
	}

	/// Shorthand for `backing(BufferBacking::RenderNode(path))`.
	#[cfg(feature = "gbm")]
	pub fn render_node(mut self, path: impl Into<PathBuf>) -> Self {
		self.backing = BufferBacking::RenderNode(path.into());
		self
	}

	pub fn token(&self) -> &str {
		&self.token
	}

	pub fn socket_path_ref(&self) -> &Path {
		&self.socket_path
	}

	pub fn backing_ref(&self) -> &BufferBacking {
		&self.backing
	}
}
