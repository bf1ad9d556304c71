#[cfg(feature = "gbm")]
use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by [`CapsClient`](crate::CapsClient) operations.
///
/// Transport faults (`Unreachable`, `Disconnected`, `Io`, `Nix`) concern the
/// sockets themselves; the frame-pacing variants (`FrameAlreadyAcquired`,
/// `SwapPending`, `FrameNotAcquired`) report calls made out of order and leave
/// the client state untouched.
#[derive(Debug, Error)]
pub enum CapsClientError {
	#[error("compositor endpoint unreachable: {0}")]
	Unreachable(#[source] nix::Error),

	#[error("connection to compositor closed")]
	Disconnected,

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("wire protocol error: {0}")]
	Protocol(#[from] caps_protocol::ProtocolError),

	#[error("syscall failed: {0}")]
	Nix(#[from] nix::Error),

	#[error("authentication rejected: {0}")]
	AuthFailed(String),

	#[error("protocol version mismatch: client speaks {ours}, server offered {theirs}")]
	ProtocolMismatch { ours: String, theirs: String },

	#[error("unexpected message during handshake: {0}")]
	Unexpected(&'static str),

	#[error("unknown monitor: {0}")]
	UnknownMonitor(String),

	#[error("frame already acquired for monitor {0}")]
	FrameAlreadyAcquired(String),

	#[error("swap still pending for monitor {0}")]
	SwapPending(String),

	#[error("no acquired frame for monitor {0}")]
	FrameNotAcquired(String),

	#[error("monitor dimensions out of range")]
	InvalidMonitorDimensions,

	#[error("buffer allocation failed: {0}")]
	Allocation(String),

	#[cfg(feature = "gbm")]
	#[error("failed to open render node {path}: {source}")]
	RenderNodeOpen {
		path: PathBuf,
		source: std::io::Error,
	},
}
