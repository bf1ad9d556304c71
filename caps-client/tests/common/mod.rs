#![allow(dead_code)]

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use caps_client::{BufferBacking, CapsClient, CapsClientConfig, CapsEvent};
use caps_protocol::unix_socket_utils::{accept_seqpacket, bind_seqpacket_listener, seqpacket_pair};
use caps_protocol::{
	message_header, AuthErrorPayload, AuthOkPayload, BufferIndex, CapsFrameReader, CapsMessage,
	CapsMessageFrame, HelloPayload, MonitorAddedPayload, MonitorInfo, MonitorRemovedPayload,
	ProtocolError, SessionInfo, SessionLifecycle, SessionRole, PROTOCOL_VERSION,
};

pub const TOKEN: &str = "abc";
pub const SERVER_NAME: &str = "shift-1";

const DEADLINE: Duration = Duration::from_secs(5);

static SOCKET_SEQ: AtomicU32 = AtomicU32::new(0);

pub fn scratch_socket_path() -> PathBuf {
	let seq = SOCKET_SEQ.fetch_add(1, Ordering::Relaxed);
	std::env::temp_dir().join(format!("caps-test-{}-{seq}.sock", std::process::id()))
}

pub fn test_session() -> SessionInfo {
	SessionInfo {
		id: "s1".to_string(),
		role: SessionRole::Session,
		display_name: None,
		state: SessionLifecycle::Pending,
	}
}

pub fn admin_session() -> SessionInfo {
	SessionInfo {
		id: "s1".to_string(),
		role: SessionRole::Admin,
		display_name: Some("admin".to_string()),
		state: SessionLifecycle::Occupied,
	}
}

pub fn monitor_m0() -> MonitorInfo {
	MonitorInfo {
		id: "m0".to_string(),
		width: 800,
		height: 600,
		refresh_rate: 60,
		name: "eDP-1".to_string(),
	}
}

pub fn monitor_m1() -> MonitorInfo {
	MonitorInfo {
		id: "m1".to_string(),
		width: 1920,
		height: 1080,
		refresh_rate: 144,
		name: "DP-3".to_string(),
	}
}

pub fn monitor_added_frame(monitor: MonitorInfo) -> CapsMessageFrame {
	CapsMessageFrame::json(message_header::MONITOR_ADDED, MonitorAddedPayload { monitor })
}

pub fn monitor_removed_frame(monitor_id: &str, name: &str) -> CapsMessageFrame {
	CapsMessageFrame::json(
		message_header::MONITOR_REMOVED,
		MonitorRemovedPayload {
			monitor_id: monitor_id.to_string(),
			name: name.to_string(),
		},
	)
}

pub fn frame_done_frame(monitor_id: &str) -> CapsMessageFrame {
	CapsMessageFrame::raw(message_header::FRAME_DONE, monitor_id)
}

pub fn buffer_release_frame(monitor_id: &str, buffer: BufferIndex) -> CapsMessageFrame {
	CapsMessageFrame::raw(
		message_header::BUFFER_RELEASE,
		format!("{monitor_id} {buffer}"),
	)
}

/// Server half of an authenticated mock-compositor connection.
pub struct ServerEnd {
	pub control: UnixStream,
	pub swap: UnixStream,
	reader: CapsFrameReader,
}

impl ServerEnd {
	pub fn send(&self, frame: CapsMessageFrame) {
		frame.encode_and_send(&self.control).unwrap();
	}

	pub fn send_swap(&self, frame: CapsMessageFrame) {
		frame.encode_and_send(&self.swap).unwrap();
	}

	/// Blocking read of the next client frame on the control socket.
	pub fn recv(&mut self) -> CapsMessage {
		let frame = self.reader.read_framed(&self.control).unwrap();
		CapsMessage::parse_message_frame(frame).unwrap()
	}

	/// Swallow remaining client frames until it hangs up.
	pub fn expect_eof(&mut self) {
		loop {
			match self.reader.read_framed(&self.control) {
				Ok(_) => {}
				Err(ProtocolError::UnexpectedEof) => return,
				Err(err) => panic!("expected eof, got {err}"),
			}
		}
	}
}

/// Mock compositor for the common case: advertised protocol and a plain
/// session, then the per-test script.
pub fn spawn_compositor(
	script: impl FnOnce(&mut ServerEnd) + Send + 'static,
) -> (PathBuf, JoinHandle<()>) {
	spawn_compositor_full(PROTOCOL_VERSION, test_session(), script)
}

pub fn spawn_compositor_as(
	session: SessionInfo,
	script: impl FnOnce(&mut ServerEnd) + Send + 'static,
) -> (PathBuf, JoinHandle<()>) {
	spawn_compositor_full(PROTOCOL_VERSION, session, script)
}

pub fn spawn_compositor_full(
	protocol: &'static str,
	session: SessionInfo,
	script: impl FnOnce(&mut ServerEnd) + Send + 'static,
) -> (PathBuf, JoinHandle<()>) {
	let path = scratch_socket_path();
	let listener = bind_seqpacket_listener(&path).unwrap();
	let handle = std::thread::spawn(move || {
		let control = accept_seqpacket(&listener).unwrap();
		let mut server = authenticate(control, protocol, session);
		script(&mut server);
	});
	(path, handle)
}

/// Sends `hello` and then only waits for the client to hang up; for tests
/// where connect must fail before authentication completes.
pub fn spawn_hello_only(protocol: &'static str) -> (PathBuf, JoinHandle<()>) {
	let path = scratch_socket_path();
	let listener = bind_seqpacket_listener(&path).unwrap();
	let handle = std::thread::spawn(move || {
		let control = accept_seqpacket(&listener).unwrap();
		send_hello(&control, protocol);
		wait_for_eof(&control);
	});
	(path, handle)
}

/// Answers the client's auth with `auth_error`.
pub fn spawn_rejecting(error: &'static str) -> (PathBuf, JoinHandle<()>) {
	let path = scratch_socket_path();
	let listener = bind_seqpacket_listener(&path).unwrap();
	let handle = std::thread::spawn(move || {
		let control = accept_seqpacket(&listener).unwrap();
		send_hello(&control, PROTOCOL_VERSION);
		let mut reader = CapsFrameReader::new();
		let frame = reader.read_framed(&control).unwrap();
		let message = CapsMessage::parse_message_frame(frame).unwrap();
		assert!(matches!(message, CapsMessage::Auth(_)));
		CapsMessageFrame::json(
			message_header::AUTH_ERROR,
			AuthErrorPayload {
				error: error.to_string(),
			},
		)
		.encode_and_send(&control)
		.unwrap();
		wait_for_eof(&control);
	});
	(path, handle)
}

fn send_hello(control: &UnixStream, protocol: &str) {
	CapsMessageFrame::json(
		message_header::HELLO,
		HelloPayload {
			server: SERVER_NAME.to_string(),
			protocol: protocol.to_string(),
		},
	)
	.encode_and_send(control)
	.unwrap();
}

fn wait_for_eof(control: &UnixStream) {
	let mut reader = CapsFrameReader::new();
	loop {
		match reader.read_framed(control) {
			Ok(_) => {}
			Err(ProtocolError::UnexpectedEof) => return,
			Err(err) => panic!("expected eof, got {err}"),
		}
	}
}

fn authenticate(control: UnixStream, protocol: &str, session: SessionInfo) -> ServerEnd {
	send_hello(&control, protocol);

	let mut reader = CapsFrameReader::new();
	let frame = reader.read_framed(&control).unwrap();
	let message = CapsMessage::parse_message_frame(frame).unwrap();
	let CapsMessage::Auth(auth) = message else {
		panic!("expected auth, got {message:?}");
	};
	assert_eq!(auth.token, TOKEN);

	let (server_swap, client_swap) = seqpacket_pair().unwrap();
	let mut frame = CapsMessageFrame::json(message_header::AUTH_OK, AuthOkPayload { session });
	frame.fds = vec![client_swap.as_raw_fd()];
	frame.encode_and_send(&control).unwrap();

	ServerEnd {
		control,
		swap: UnixStream::from(server_swap),
		reader,
	}
}

pub fn connect_client(path: &Path) -> CapsClient {
	let config = CapsClientConfig::new(TOKEN)
		.socket_path(path)
		.backing(BufferBacking::Shm);
	CapsClient::connect(&config).unwrap()
}

/// Pump the client until `want` events have been popped, panicking on
/// timeout.
pub fn collect_events(client: &mut CapsClient, want: usize) -> Vec<CapsEvent> {
	let deadline = Instant::now() + DEADLINE;
	let mut events = Vec::new();
	loop {
		while let Some(event) = client.next_event() {
			events.push(event);
			if events.len() == want {
				return events;
			}
		}
		assert!(
			Instant::now() < deadline,
			"timed out: wanted {want} events, saw {}",
			events.len()
		);
		client.poll_events().unwrap();
		std::thread::sleep(Duration::from_millis(2));
	}
}

/// Pump the client until a fault lands in the error slot and return it.
pub fn pump_fault(client: &mut CapsClient) -> String {
	let deadline = Instant::now() + DEADLINE;
	loop {
		if let Some(error) = client.take_last_error() {
			return error;
		}
		assert!(Instant::now() < deadline, "timed out waiting for a fault");
		client.poll_events().unwrap();
		std::thread::sleep(Duration::from_millis(2));
	}
}
