mod common;

use caps_client::{CapsClient, CapsClientConfig, CapsClientError, SessionLifecycle, SessionRole};
use caps_protocol::unix_socket_utils::{accept_seqpacket, bind_seqpacket_listener};
use caps_protocol::{
	message_header, CapsFrameReader, CapsMessage, CapsMessageFrame, MonitorAddedPayload,
	ProtocolError, PROTOCOL_VERSION,
};

use common::{
	connect_client, monitor_m0, scratch_socket_path, spawn_compositor, spawn_compositor_full,
	spawn_hello_only, spawn_rejecting, test_session, SERVER_NAME, TOKEN,
};

#[test]
fn connect_runs_the_full_handshake() {
	let (path, server) = spawn_compositor(|server| {
		server.expect_eof();
	});

	let mut client = connect_client(&path);
	assert_eq!(client.server_name(), SERVER_NAME);
	assert_eq!(client.protocol_name(), PROTOCOL_VERSION);
	assert_eq!(client.session().id, "s1");
	assert_eq!(client.session().role, SessionRole::Session);
	assert_eq!(client.session().state, SessionLifecycle::Pending);

	// Monitors only arrive as events after auth; the directory starts empty.
	assert_eq!(client.monitor_count(), 0);
	assert!(client.monitor_id(0).is_none());

	// Both channels are live and distinct.
	assert_ne!(client.socket_fd().unwrap(), client.swap_fd().unwrap());

	client.close();
	server.join().unwrap();
}

#[test]
fn bare_legacy_version_strings_interoperate() {
	let (path, server) = spawn_compositor_full("1.0", test_session(), |server| {
		server.expect_eof();
	});

	let mut client = connect_client(&path);
	assert_eq!(client.protocol_name(), "1.0");

	client.close();
	server.join().unwrap();
}

#[test]
fn mismatched_major_version_is_rejected() {
	let (path, server) = spawn_hello_only("2.0");

	let config = CapsClientConfig::new(TOKEN).socket_path(&path);
	match CapsClient::connect(&config) {
		Err(CapsClientError::ProtocolMismatch { ours, theirs }) => {
			assert_eq!(ours, PROTOCOL_VERSION);
			assert_eq!(theirs, "2.0");
		}
		Err(err) => panic!("wrong error: {err}"),
		Ok(_) => panic!("connect should have failed"),
	}

	server.join().unwrap();
}

#[test]
fn rejected_token_surfaces_the_server_message() {
	let (path, server) = spawn_rejecting("bad token");

	let config = CapsClientConfig::new(TOKEN).socket_path(&path);
	match CapsClient::connect(&config) {
		Err(CapsClientError::AuthFailed(message)) => assert_eq!(message, "bad token"),
		Err(err) => panic!("wrong error: {err}"),
		Ok(_) => panic!("connect should have failed"),
	}

	server.join().unwrap();
}

#[test]
fn unreachable_endpoint_is_reported() {
	let path = scratch_socket_path();

	let config = CapsClientConfig::new(TOKEN).socket_path(&path);
	match CapsClient::connect(&config) {
		Err(CapsClientError::Unreachable(_)) => {}
		Err(err) => panic!("wrong error: {err}"),
		Ok(_) => panic!("connect should have failed"),
	}
}

#[test]
fn unexpected_pre_auth_message_aborts() {
	let path = scratch_socket_path();
	let listener = bind_seqpacket_listener(&path).unwrap();
	let server = std::thread::spawn(move || {
		let control = accept_seqpacket(&listener).unwrap();
		CapsMessageFrame::hello(SERVER_NAME)
			.encode_and_send(&control)
			.unwrap();

		let mut reader = CapsFrameReader::new();
		let frame = reader.read_framed(&control).unwrap();
		let message = CapsMessage::parse_message_frame(frame).unwrap();
		assert!(matches!(message, CapsMessage::Auth(_)));

		// A monitor announcement instead of auth_ok must abort the
		// handshake.
		CapsMessageFrame::json(
			message_header::MONITOR_ADDED,
			MonitorAddedPayload {
				monitor: monitor_m0(),
			},
		)
		.encode_and_send(&control)
		.unwrap();

		loop {
			match reader.read_framed(&control) {
				Ok(_) => {}
				Err(ProtocolError::UnexpectedEof) => return,
				Err(err) => panic!("expected eof, got {err}"),
			}
		}
	});

	let config = CapsClientConfig::new(TOKEN).socket_path(&path);
	match CapsClient::connect(&config) {
		Err(CapsClientError::Unexpected(_)) => {}
		Err(err) => panic!("wrong error: {err}"),
		Ok(_) => panic!("connect should have failed"),
	}

	server.join().unwrap();
}
