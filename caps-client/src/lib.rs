//! Client library for the Caps protocol: connect to a Shift compositor,
//! mirror its monitor directory, pump events, and drive per-monitor
//! double-buffered rendering through acquire/submit cycles.
//!
//! The client owns two sockets. The control socket carries the handshake and
//! every notification; the swap-completion channel, handed over during
//! authentication, carries only buffer releases so a renderer can poll it at
//! frame cadence without wading through input traffic.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use tracing::{debug, warn};

use caps_protocol::unix_socket_utils::connect_seqpacket;
use caps_protocol::{
	message_header, protocol_compatible, AuthOkPayload, AuthPayload, BufferReleasePayload,
	CapsFrameReader, CapsMessage, CapsMessageFrame, ProtocolError, SessionCreatePayload,
	SessionReadyPayload, SwapBuffersPayload, PROTOCOL_VERSION,
};

mod allocator;
mod config;
mod error;
mod events;
mod monitor;
mod swapchain;

pub use allocator::FOURCC_XRGB8888;
pub use config::{BufferBacking, CapsClientConfig};
pub use error::CapsClientError;
pub use events::CapsEvent;
pub use monitor::MonitorId;
pub use swapchain::{CapsBuffer, CapsSwapchain, DmabufDescriptor, FrameTarget};

pub use caps_protocol::{
	BufferIndex, HelloPayload, InputEvent, MonitorInfo, SessionInfo, SessionLifecycle,
	SessionRole,
};

use crate::allocator::BufferAllocator;
use crate::monitor::{FramePhase, MonitorEntry};

/// Outcome of a successful [`CapsClient::acquire_frame`] call.
#[derive(Debug)]
pub enum Acquire {
	/// A buffer is reserved for rendering; submit it with
	/// [`CapsClient::swap_buffers`].
	Frame(FrameTarget),
	/// The compositor holds both buffers. Not an error: pump
	/// [`CapsClient::poll_events`] until a release arrives, then retry.
	NoBuffers,
}

/// Live transport state, torn down as a unit on close or connection loss.
struct Wire {
	socket: UnixStream,
	control_reader: CapsFrameReader,
	swap_channel: UnixStream,
	swap_reader: CapsFrameReader,
}

/// Connection to a Shift compositor.
///
/// All methods are non-blocking once [`connect`](Self::connect) returns;
/// integrate [`socket_fd`](Self::socket_fd) and [`swap_fd`](Self::swap_fd)
/// into a poll loop and call [`poll_events`](Self::poll_events) when either
/// becomes readable.
pub struct CapsClient {
	wire: Option<Wire>,
	hello: HelloPayload,
	session: SessionInfo,
	monitors: HashMap<MonitorId, MonitorEntry>,
	/// Announcement order, backing `monitor_id(index)`.
	monitor_order: Vec<MonitorId>,
	events: VecDeque<CapsEvent>,
	last_error: Option<String>,
	allocator: BufferAllocator,
}

impl CapsClient {
	/// Dial the compositor socket and run the handshake to completion:
	/// `hello`, version check, `auth`, and the `auth_ok` that carries the
	/// swap-completion channel. Blocks until the server answers or rejects.
	///
	/// Monitors are not part of the reply; the server announces each one
	/// with a `monitor_added` event right after, so the directory is empty
	/// until the first [`poll_events`](Self::poll_events).
	pub fn connect(config: &CapsClientConfig) -> Result<Self, CapsClientError> {
		let socket = connect_seqpacket(config.socket_path_ref())
			.map_err(CapsClientError::Unreachable)?;
		let mut control_reader = CapsFrameReader::new();

		let hello = match Self::read_message(&socket, &mut control_reader)? {
			CapsMessage::Hello(hello) => hello,
			_ => return Err(CapsClientError::Unexpected("expected hello")),
		};
		if !protocol_compatible(PROTOCOL_VERSION, &hello.protocol) {
			return Err(CapsClientError::ProtocolMismatch {
				ours: PROTOCOL_VERSION.to_string(),
				theirs: hello.protocol,
			});
		}

		CapsMessageFrame::json(
			message_header::AUTH,
			AuthPayload {
				token: config.token().to_string(),
			},
		)
		.encode_and_send(&socket)?;
		let (auth, swap_channel) = Self::wait_for_auth(&socket, &mut control_reader)?;

		socket.set_nonblocking(true)?;
		let swap_channel = UnixStream::from(swap_channel);
		swap_channel.set_nonblocking(true)?;
		let allocator = BufferAllocator::new(config.backing_ref())?;

		debug!(server = %hello.server, session = %auth.session.id, "connected");
		Ok(Self {
			wire: Some(Wire {
				socket,
				control_reader,
				swap_channel,
				swap_reader: CapsFrameReader::new(),
			}),
			hello,
			session: auth.session,
			monitors: HashMap::new(),
			monitor_order: Vec::new(),
			events: VecDeque::new(),
			last_error: None,
			allocator,
		})
	}

	fn read_message(
		socket: &UnixStream,
		reader: &mut CapsFrameReader,
	) -> Result<CapsMessage, CapsClientError> {
		let frame = reader.read_framed(socket)?;
		Ok(CapsMessage::parse_message_frame(frame)?)
	}

	fn wait_for_auth(
		socket: &UnixStream,
		reader: &mut CapsFrameReader,
	) -> Result<(AuthOkPayload, OwnedFd), CapsClientError> {
		loop {
			match Self::read_message(socket, reader)? {
				CapsMessage::AuthOk {
					payload,
					swap_channel,
				} => return Ok((payload, swap_channel)),
				CapsMessage::AuthError(payload) => {
					return Err(CapsClientError::AuthFailed(payload.error));
				}
				CapsMessage::Ping => {
					CapsMessageFrame::no_payload(message_header::PONG).encode_and_send(socket)?;
				}
				CapsMessage::Hello(_) => {
					return Err(CapsClientError::Unexpected("duplicate hello"));
				}
				_ => return Err(CapsClientError::Unexpected("unexpected message before auth")),
			}
		}
	}

	/// Server identity from the handshake `hello`.
	pub fn server_name(&self) -> &str {
		&self.hello.server
	}

	/// Protocol string the server advertised, e.g. `caps/v1.0.0`.
	pub fn protocol_name(&self) -> &str {
		&self.hello.protocol
	}

	pub fn hello(&self) -> &HelloPayload {
		&self.hello
	}

	/// Our session record, kept current by `session_state` events.
	pub fn session(&self) -> &SessionInfo {
		&self.session
	}

	pub fn monitor_count(&self) -> usize {
		self.monitor_order.len()
	}

	/// Monitor id at `index`, in announcement order.
	pub fn monitor_id(&self, index: usize) -> Option<&str> {
		self.monitor_order.get(index).map(String::as_str)
	}

	pub fn monitor_ids(&self) -> impl Iterator<Item = &str> {
		self.monitor_order.iter().map(String::as_str)
	}

	pub fn monitor_info(&self, monitor_id: &str) -> Option<&MonitorInfo> {
		self.monitors.get(monitor_id).map(|entry| &entry.info)
	}

	/// Control-socket descriptor for readiness polling.
	pub fn socket_fd(&self) -> Result<RawFd, CapsClientError> {
		self.wire
			.as_ref()
			.map(|wire| wire.socket.as_raw_fd())
			.ok_or(CapsClientError::Disconnected)
	}

	/// Swap-completion channel descriptor for readiness polling.
	pub fn swap_fd(&self) -> Result<RawFd, CapsClientError> {
		self.wire
			.as_ref()
			.map(|wire| wire.swap_channel.as_raw_fd())
			.ok_or(CapsClientError::Disconnected)
	}

	/// Drain both channels without blocking and return how many new events
	/// were queued.
	///
	/// Control frames become [`CapsEvent`]s in arrival order. Swap-channel
	/// buffer releases replenish swapchains silently, so `Ok(0)` after a
	/// readable swap descriptor is normal. A malformed or out-of-order frame
	/// stops the drain at the fault: everything decoded before it stays
	/// queued, and the description is left for
	/// [`take_last_error`](Self::take_last_error). Connection loss tears the
	/// transport down; this call still returns the events that made it
	/// through, and every later call fails with
	/// [`Disconnected`](CapsClientError::Disconnected).
	pub fn poll_events(&mut self) -> Result<usize, CapsClientError> {
		let Some(mut wire) = self.wire.take() else {
			return Err(CapsClientError::Disconnected);
		};
		let before = self.events.len();
		let mut severed = self.drain_control(&mut wire);
		if !severed {
			severed = self.drain_swap(&mut wire);
		}
		if severed {
			drop(wire);
			self.sever("connection to compositor lost");
		} else {
			self.wire = Some(wire);
		}
		Ok(self.events.len() - before)
	}

	/// Pop the oldest queued event. Events own their data; dropping one
	/// releases it.
	pub fn next_event(&mut self) -> Option<CapsEvent> {
		self.events.pop_front()
	}

	/// Description of the most recent decode fault or server `error` frame,
	/// cleared by taking it.
	pub fn take_last_error(&mut self) -> Option<String> {
		self.last_error.take()
	}

	/// Reserve the next free buffer of `monitor_id` for rendering.
	///
	/// The first acquisition for a monitor allocates its swapchain and sends
	/// the `framebuffer_link` that imports both buffers into the compositor.
	/// At most one frame may be in flight per monitor: a second acquire
	/// before submission fails with `FrameAlreadyAcquired`, and an acquire
	/// while the compositor still owes a `frame_done` fails with
	/// `SwapPending`.
	pub fn acquire_frame(&mut self, monitor_id: &str) -> Result<Acquire, CapsClientError> {
		if self.wire.is_none() {
			return Err(CapsClientError::Disconnected);
		}
		// Faults are decided, and a first-time pool allocated, before anything
		// goes on the wire.
		let pending = {
			let Some(entry) = self.monitors.get(monitor_id) else {
				return Err(CapsClientError::UnknownMonitor(monitor_id.to_string()));
			};
			match entry.phase {
				FramePhase::Acquired => {
					return Err(CapsClientError::FrameAlreadyAcquired(monitor_id.to_string()));
				}
				FramePhase::Submitted => {
					return Err(CapsClientError::SwapPending(monitor_id.to_string()));
				}
				FramePhase::Idle => {}
			}
			match &entry.swapchain {
				Some(_) => None,
				None => Some(self.allocator.create_swapchain(&entry.info)?),
			}
		};

		if let Some(swapchain) = &pending {
			let mut frame = CapsMessageFrame::json(
				message_header::FRAMEBUFFER_LINK,
				swapchain.framebuffer_link_payload(),
			);
			frame.fds = swapchain.export_fds().to_vec();
			// A refused link drops the fresh pool; the monitor stays idle and
			// the next acquire starts over.
			self.send_control(frame)?;
			debug!(monitor = %monitor_id, "framebuffers linked");
		}

		let Some(entry) = self.monitors.get_mut(monitor_id) else {
			return Err(CapsClientError::UnknownMonitor(monitor_id.to_string()));
		};
		let swapchain = match pending {
			Some(new) => entry.swapchain.insert(new),
			None => match entry.swapchain.as_mut() {
				Some(swapchain) => swapchain,
				None => return Err(CapsClientError::UnknownMonitor(monitor_id.to_string())),
			},
		};

		let generation = swapchain.generation();
		let Some((buffer, index)) = swapchain.acquire_next() else {
			return Ok(Acquire::NoBuffers);
		};
		let (width, height) = (buffer.width(), buffer.height());
		let (stride, offset, fourcc) = (buffer.stride(), buffer.offset(), buffer.fourcc());
		let dmabuf = match buffer.try_clone_fd() {
			Ok(fd) => DmabufDescriptor::new(fd, stride, offset, fourcc),
			Err(err) => {
				swapchain.rollback();
				return Err(err.into());
			}
		};
		entry.phase = FramePhase::Acquired;
		Ok(Acquire::Frame(FrameTarget::new(
			monitor_id.to_string(),
			index,
			generation,
			width,
			height,
			Some(dmabuf),
		)))
	}

	/// Submit the acquired frame for presentation, consuming the target.
	///
	/// After this returns the monitor waits for the compositor's
	/// `frame_done`; rendering into the submitted buffer is over. Validation
	/// failures change nothing. If the send itself is refused nothing reached
	/// the compositor: the monitor returns to idle, and unless the connection
	/// was lost the next [`acquire_frame`](Self::acquire_frame) hands out a
	/// fresh target for the same buffer.
	pub fn swap_buffers(&mut self, frame: FrameTarget) -> Result<(), CapsClientError> {
		if self.wire.is_none() {
			return Err(CapsClientError::Disconnected);
		}
		let monitor_id = frame.monitor_id().to_string();
		{
			let Some(entry) = self.monitors.get(&monitor_id) else {
				return Err(CapsClientError::UnknownMonitor(monitor_id));
			};
			if entry.phase != FramePhase::Acquired {
				return Err(CapsClientError::FrameNotAcquired(monitor_id));
			}
			// A target from before a monitor removal/re-add carries the
			// generation of a pool that no longer exists, even when the
			// replacement pool handed out the same index.
			let current = entry
				.swapchain
				.as_ref()
				.map(|chain| (chain.generation(), chain.current().1));
			if current != Some((frame.generation(), frame.buffer_index())) {
				return Err(CapsClientError::FrameNotAcquired(monitor_id));
			}
		}

		let payload = SwapBuffersPayload {
			monitor_id: monitor_id.clone(),
			buffer: frame.buffer_index(),
		};
		if let Err(err) = self.send_control(CapsMessageFrame::raw(
			message_header::SWAP_BUFFERS,
			payload.encode(),
		)) {
			// The target is gone but nothing was submitted; reopen the cycle
			// so the caller can acquire again instead of wedging on
			// `FrameAlreadyAcquired`.
			if let Some(entry) = self.monitors.get_mut(&monitor_id) {
				if let Some(swapchain) = entry.swapchain.as_mut() {
					swapchain.rollback();
				}
				entry.phase = FramePhase::Idle;
			}
			return Err(err);
		}

		if let Some(entry) = self.monitors.get_mut(&monitor_id) {
			if let Some(swapchain) = entry.swapchain.as_mut() {
				swapchain.mark_busy(frame.buffer_index());
			}
			entry.phase = FramePhase::Submitted;
		}
		debug!(monitor = %monitor_id, buffer = %frame.buffer_index(), "frame submitted");
		Ok(())
	}

	/// Tell the compositor this session finished loading and can be shown.
	pub fn send_ready(&mut self) -> Result<(), CapsClientError> {
		let payload = SessionReadyPayload {
			session_id: self.session.id.clone(),
		};
		self.send_control(CapsMessageFrame::json(message_header::SESSION_READY, payload))
	}

	/// Ask the compositor to provision a new session (admin connections
	/// only; others are answered with an `error` frame). The reply arrives
	/// as [`CapsEvent::SessionCreated`] carrying the spawn token.
	pub fn create_session(&mut self, display_name: Option<&str>) -> Result<(), CapsClientError> {
		let payload = SessionCreatePayload {
			role: SessionRole::Session,
			display_name: display_name.map(str::to_string),
		};
		self.send_control(CapsMessageFrame::json(message_header::SESSION_CREATE, payload))
	}

	/// Close both channels and drop every buffer. Safe to call repeatedly;
	/// after the first call all other operations fail with `Disconnected`.
	pub fn close(&mut self) {
		if self.wire.take().is_some() {
			debug!("closing connection");
		}
		for entry in self.monitors.values_mut() {
			entry.swapchain = None;
			entry.phase = FramePhase::Idle;
		}
		self.events.clear();
	}

	fn send_control(&mut self, frame: CapsMessageFrame) -> Result<(), CapsClientError> {
		let result = {
			let Some(wire) = self.wire.as_ref() else {
				return Err(CapsClientError::Disconnected);
			};
			frame.encode_and_send(&wire.socket)
		};
		match result {
			Ok(()) => Ok(()),
			Err(ProtocolError::Nix(errno))
				if errno == Errno::EPIPE || errno == Errno::ECONNRESET =>
			{
				self.sever("connection to compositor lost");
				Err(CapsClientError::Disconnected)
			}
			Err(err) => Err(err.into()),
		}
	}

	fn drain_control(&mut self, wire: &mut Wire) -> bool {
		loop {
			let frame = match wire.control_reader.read_framed(&wire.socket) {
				Ok(frame) => frame,
				Err(ProtocolError::WouldBlock) => return false,
				Err(ProtocolError::UnexpectedEof) => return true,
				Err(ProtocolError::Nix(errno)) if errno == Errno::ECONNRESET => return true,
				Err(err) => {
					self.record_error(format!("control channel read failed: {err}"));
					return false;
				}
			};
			let message = match CapsMessage::parse_message_frame(frame) {
				Ok(message) => message,
				Err(err) => {
					self.record_error(format!("malformed control frame: {err}"));
					return false;
				}
			};
			if let Err(fault) = self.apply_control_message(wire, message) {
				self.record_error(fault);
				return false;
			}
		}
	}

	fn drain_swap(&mut self, wire: &mut Wire) -> bool {
		loop {
			let frame = match wire.swap_reader.read_framed(&wire.swap_channel) {
				Ok(frame) => frame,
				Err(ProtocolError::WouldBlock) => return false,
				Err(ProtocolError::UnexpectedEof) => return true,
				Err(ProtocolError::Nix(errno)) if errno == Errno::ECONNRESET => return true,
				Err(err) => {
					self.record_error(format!("swap channel read failed: {err}"));
					return false;
				}
			};
			let message = match CapsMessage::parse_message_frame(frame) {
				Ok(message) => message,
				Err(err) => {
					self.record_error(format!("malformed swap-channel frame: {err}"));
					return false;
				}
			};
			match message {
				CapsMessage::BufferRelease(payload) => {
					if let Err(fault) = self.handle_buffer_release(payload) {
						self.record_error(fault);
						return false;
					}
				}
				other => {
					warn!(message = ?other, "ignoring non-release message on swap channel");
				}
			}
		}
	}

	/// `Err` carries a protocol-violation description bound for the error
	/// slot; it stops the current drain.
	fn apply_control_message(&mut self, wire: &Wire, message: CapsMessage) -> Result<(), String> {
		match message {
			CapsMessage::FrameDone(payload) => self.handle_frame_done(payload.monitor_id)?,
			CapsMessage::MonitorAdded(payload) => self.insert_monitor(payload.monitor),
			CapsMessage::MonitorRemoved(payload) => {
				self.remove_monitor(payload.monitor_id, payload.name);
			}
			CapsMessage::InputEvent(event) => self.events.push_back(CapsEvent::Input(event)),
			CapsMessage::SessionState(payload) => self.handle_session_state(payload.session)?,
			CapsMessage::SessionCreated(payload) => {
				debug!(session = %payload.session.id, "session created");
				self.events.push_back(CapsEvent::SessionCreated {
					token: payload.token,
				});
			}
			CapsMessage::Error(payload) => {
				self.record_error(match payload.message {
					Some(message) => format!("server error {}: {message}", payload.code),
					None => format!("server error {}", payload.code),
				});
			}
			CapsMessage::Ping => {
				let reply = CapsMessageFrame::no_payload(message_header::PONG);
				if let Err(err) = reply.encode_and_send(&wire.socket) {
					self.record_error(format!("pong reply failed: {err}"));
				}
			}
			CapsMessage::Pong => {}
			CapsMessage::BufferRelease(payload) => {
				// Releases belong on the swap channel; tolerated here so a
				// single-socket server still works.
				warn!(monitor = %payload.monitor_id, "buffer_release on the control channel");
				self.handle_buffer_release(payload)?;
			}
			other => {
				debug!(message = ?other, "ignoring unexpected control message");
			}
		}
		Ok(())
	}

	fn handle_frame_done(&mut self, monitor_id: String) -> Result<(), String> {
		let Some(entry) = self.monitors.get_mut(&monitor_id) else {
			// Completion racing a monitor removal; nothing left to update.
			warn!(monitor = %monitor_id, "frame_done for unknown monitor");
			return Ok(());
		};
		if entry.phase != FramePhase::Submitted {
			return Err(format!(
				"frame_done for monitor {monitor_id} with no swap in flight"
			));
		}
		entry.phase = FramePhase::Idle;
		self.events.push_back(CapsEvent::FrameDone { monitor_id });
		Ok(())
	}

	fn handle_buffer_release(&mut self, payload: BufferReleasePayload) -> Result<(), String> {
		let Some(entry) = self.monitors.get_mut(&payload.monitor_id) else {
			warn!(monitor = %payload.monitor_id, "buffer_release for unknown monitor");
			return Ok(());
		};
		let Some(swapchain) = entry.swapchain.as_mut() else {
			return Err(format!(
				"buffer_release for monitor {} before any framebuffer_link",
				payload.monitor_id
			));
		};
		if !swapchain.mark_released(payload.buffer) {
			return Err(format!(
				"buffer_release for idle buffer {} of monitor {}",
				payload.buffer, payload.monitor_id
			));
		}
		debug!(monitor = %payload.monitor_id, buffer = %payload.buffer, "buffer released");
		Ok(())
	}

	fn handle_session_state(&mut self, session: SessionInfo) -> Result<(), String> {
		if session.id == self.session.id {
			if session.state < self.session.state {
				return Err(format!(
					"session {} state went backwards: {:?} after {:?}",
					session.id, session.state, self.session.state
				));
			}
			self.session = session.clone();
		}
		self.events.push_back(CapsEvent::SessionState(session));
		Ok(())
	}

	fn insert_monitor(&mut self, info: MonitorInfo) {
		match self.monitors.get_mut(&info.id) {
			Some(entry) => {
				warn!(monitor = %info.id, "duplicate monitor_added, refreshing info");
				entry.info = info.clone();
			}
			None => {
				self.monitor_order.push(info.id.clone());
				self.monitors
					.insert(info.id.clone(), MonitorEntry::new(info.clone()));
			}
		}
		self.events.push_back(CapsEvent::MonitorAdded(info));
	}

	fn remove_monitor(&mut self, monitor_id: String, name: String) {
		if self.monitors.remove(&monitor_id).is_some() {
			self.monitor_order.retain(|id| id != &monitor_id);
			debug!(monitor = %name, "monitor removed");
		} else {
			warn!(monitor = %monitor_id, "removal of unknown monitor");
		}
		self.events.push_back(CapsEvent::MonitorRemoved { monitor_id });
	}

	/// Transport loss: keep the queued events, drop everything that needs a
	/// live connection.
	fn sever(&mut self, reason: &str) {
		self.record_error(reason.to_string());
		self.wire = None;
		for entry in self.monitors.values_mut() {
			entry.swapchain = None;
			entry.phase = FramePhase::Idle;
		}
	}

	fn record_error(&mut self, message: impl Into<String>) {
		let message = message.into();
		warn!("{message}");
		self.last_error = Some(message);
	}
}

impl Drop for CapsClient {
	fn drop(&mut self) {
		self.close();
	}
}
