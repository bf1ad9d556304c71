//! Shared Caps v1 protocol definitions for both ends of a Shift connection.
//! - Message framing over Unix seqpacket sockets (sendmsg/recvmsg + SCM_RIGHTS)
//! - Raw CapsMessageFrame representation (header + payload string + FDs)
//! - Parsing helpers into typed CapsMessage variants

use serde::{Deserialize, Serialize};
use std::{
	fmt,
	os::fd::{FromRawFd, OwnedFd},
	str::FromStr,
};

pub mod input;
pub mod message_frame;
pub mod unix_socket_utils;

/// Default Unix domain socket where Shift listens for Caps connections.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/shift.sock";
/// Protocol identifier advertised in `hello` payloads.
pub const PROTOCOL_VERSION: &str = const_str::concat!("caps/v", env!("CARGO_PKG_VERSION"));

/// Major component of a protocol version string. Accepts both the full
/// `<name>/vMAJOR.MINOR.PATCH` form and a bare `MAJOR.MINOR`.
pub fn protocol_major(version: &str) -> Option<u32> {
	let digits = version
		.rsplit_once("/v")
		.map_or(version, |(_, rest)| rest)
		.trim();
	digits.split('.').next()?.parse().ok()
}

/// Two protocol version strings interoperate when their majors match.
pub fn protocol_compatible(ours: &str, theirs: &str) -> bool {
	match (protocol_major(ours), protocol_major(theirs)) {
		(Some(a), Some(b)) => a == b,
		_ => false,
	}
}

/// Index into a monitor's two-deep swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BufferIndex {
	Zero = 0,
	One = 1,
}

impl FromStr for BufferIndex {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, ()> {
		match s {
			"0" => Ok(Self::Zero),
			"1" => Ok(Self::One),
			_ => Err(()),
		}
	}
}

impl fmt::Display for BufferIndex {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", *self as u8)
	}
}

/// Parsed, semantic Caps message.
#[derive(Debug)]
pub enum CapsMessage {
	Hello(HelloPayload),
	Auth(AuthPayload),
	AuthOk {
		payload: AuthOkPayload,
		/// Client end of the swap-completion channel, passed over SCM_RIGHTS.
		swap_channel: OwnedFd,
	},
	AuthError(AuthErrorPayload),
	FramebufferLink {
		payload: FramebufferLinkPayload,
		dma_bufs: [OwnedFd; 2],
	},
	SwapBuffers(SwapBuffersPayload),
	FrameDone(FrameDonePayload),
	BufferRelease(BufferReleasePayload),
	InputEvent(InputEvent),
	MonitorAdded(MonitorAddedPayload),
	MonitorRemoved(MonitorRemovedPayload),
	SessionCreate(SessionCreatePayload),
	SessionCreated(SessionCreatedPayload),
	SessionReady(SessionReadyPayload),
	SessionState(SessionStatePayload),
	Error(ErrorPayload),
	Ping,
	Pong,
	Unknown(CapsMessageFrame),
}

impl TryFrom<CapsMessageFrame> for CapsMessage {
	type Error = ProtocolError;
	fn try_from(value: CapsMessageFrame) -> Result<Self, ProtocolError> {
		Self::parse_message_frame(value)
	}
}

impl CapsMessage {
	/// Parse the raw CapsMessageFrame into a typed `CapsMessage` variant.
	#[tracing::instrument(skip_all, fields(header = %msg.header.0))]
	pub fn parse_message_frame(msg: CapsMessageFrame) -> Result<Self, ProtocolError> {
		let header = msg.header.0.as_str();

		match header {
			message_header::HELLO => Ok(CapsMessage::Hello(msg.expect_payload_json()?)),
			message_header::AUTH => Ok(CapsMessage::Auth(msg.expect_payload_json()?)),
			message_header::AUTH_OK => {
				let payload: AuthOkPayload = msg.expect_payload_json()?;
				msg.expect_n_fds(1)?;
				let swap_channel = unsafe { OwnedFd::from_raw_fd(msg.fds[0]) };
				Ok(CapsMessage::AuthOk {
					payload,
					swap_channel,
				})
			}
			message_header::AUTH_ERROR => Ok(CapsMessage::AuthError(msg.expect_payload_json()?)),
			message_header::FRAMEBUFFER_LINK => {
				let payload: FramebufferLinkPayload = msg.expect_payload_json()?;
				msg.expect_n_fds(2)?;
				let dma_bufs = unsafe {
					[
						OwnedFd::from_raw_fd(msg.fds[0]),
						OwnedFd::from_raw_fd(msg.fds[1]),
					]
				};
				Ok(CapsMessage::FramebufferLink { payload, dma_bufs })
			}
			message_header::SWAP_BUFFERS => {
				let (monitor_id, buffer) = parse_monitor_buffer_args(&msg)?;
				Ok(CapsMessage::SwapBuffers(SwapBuffersPayload {
					monitor_id,
					buffer,
				}))
			}
			message_header::FRAME_DONE => {
				let payload = msg.expect_payload_raw()?;
				let mut args = payload.split_ascii_whitespace();
				let monitor_id = args.next().ok_or_else(|| {
					ProtocolError::InvalidPayload(
						r#""frame_done" requires 1 argument: <monitor_id>"#.into(),
					)
				})?;
				if args.next().is_some() {
					return Err(ProtocolError::TrailingData);
				}
				Ok(CapsMessage::FrameDone(FrameDonePayload {
					monitor_id: monitor_id.into(),
				}))
			}
			message_header::BUFFER_RELEASE => {
				let (monitor_id, buffer) = parse_monitor_buffer_args(&msg)?;
				Ok(CapsMessage::BufferRelease(BufferReleasePayload {
					monitor_id,
					buffer,
				}))
			}
			message_header::INPUT_EVENT => Ok(CapsMessage::InputEvent(msg.expect_payload_json()?)),
			message_header::MONITOR_ADDED => {
				Ok(CapsMessage::MonitorAdded(msg.expect_payload_json()?))
			}
			message_header::MONITOR_REMOVED => {
				Ok(CapsMessage::MonitorRemoved(msg.expect_payload_json()?))
			}
			message_header::SESSION_CREATE => {
				Ok(CapsMessage::SessionCreate(msg.expect_payload_json()?))
			}
			message_header::SESSION_CREATED => {
				Ok(CapsMessage::SessionCreated(msg.expect_payload_json()?))
			}
			message_header::SESSION_READY => {
				Ok(CapsMessage::SessionReady(msg.expect_payload_json()?))
			}
			message_header::SESSION_STATE => {
				Ok(CapsMessage::SessionState(msg.expect_payload_json()?))
			}
			message_header::ERROR => Ok(CapsMessage::Error(msg.expect_payload_json()?)),
			message_header::PING => Ok(CapsMessage::Ping),
			message_header::PONG => Ok(CapsMessage::Pong),
			_ => Ok(CapsMessage::Unknown(msg)),
		}
	}
}

/// Shared parser for the `<monitor_id> <0|1>` payloads carried by
/// `swap_buffers` and `buffer_release`.
fn parse_monitor_buffer_args(msg: &CapsMessageFrame) -> Result<(String, BufferIndex), ProtocolError> {
	let payload = msg.expect_payload_raw()?;
	let invalid = || {
		ProtocolError::InvalidPayload(format!(
			"{:?} requires 2 arguments: <monitor_id> <0 or 1 (buffer index)>",
			msg.header.0
		))
	};
	let mut args = payload.split_ascii_whitespace();
	let monitor_id = args.next().ok_or_else(invalid)?;
	let buffer = args.next().ok_or_else(invalid)?.parse().map_err(|()| invalid())?;
	if args.next().is_some() {
		return Err(ProtocolError::TrailingData);
	}
	Ok((monitor_id.into(), buffer))
}

/// Typed payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
	pub server: String,
	pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
	pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorInfo {
	pub id: String,
	pub width: i32,
	pub height: i32,
	pub refresh_rate: i32,
	pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
	pub id: String,
	pub role: SessionRole,
	pub display_name: Option<String>,
	pub state: SessionLifecycle,
}

/// Session lifecycle; strictly forward on the wire, so the declaration order
/// doubles as the comparison order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionLifecycle {
	Pending,
	Loading,
	Occupied,
	Consumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
	Admin,
	Session,
}

/// Successful authentication. The connected monitor set is not part of this
/// payload; the server follows up with one `monitor_added` frame per monitor
/// so the client's directory has a single source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthOkPayload {
	pub session: SessionInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthErrorPayload {
	pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramebufferLinkPayload {
	pub monitor_id: String,
	pub width: i32,
	pub height: i32,
	pub stride: i32,
	pub offset: i32,
	pub fourcc: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapBuffersPayload {
	pub monitor_id: String,
	pub buffer: BufferIndex,
}

impl SwapBuffersPayload {
	pub fn encode(&self) -> String {
		format!("{} {}", self.monitor_id, self.buffer)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDonePayload {
	pub monitor_id: String,
}

impl FrameDonePayload {
	pub fn encode(&self) -> String {
		self.monitor_id.clone()
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferReleasePayload {
	pub monitor_id: String,
	pub buffer: BufferIndex,
}

impl BufferReleasePayload {
	pub fn encode(&self) -> String {
		format!("{} {}", self.monitor_id, self.buffer)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorAddedPayload {
	pub monitor: MonitorInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorRemovedPayload {
	pub monitor_id: String,
	pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreatePayload {
	pub role: SessionRole,
	pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreatedPayload {
	pub session: SessionInfo,
	pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReadyPayload {
	pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatePayload {
	pub session: SessionInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
	pub code: String,
	pub message: Option<String>,
}

pub use input::*;
pub use message_header::MessageHeader;
pub mod message_header;

mod error;
pub use error::*;

pub use crate::message_frame::{CapsFrameReader, CapsMessageFrame};
