use std::env;
use std::error::Error;
use std::fs::File;
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::fs::FileExt;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use caps_client::{
	Acquire, BufferBacking, CapsClient, CapsClientConfig, CapsClientError, CapsEvent, FrameTarget,
};

fn main() -> Result<(), Box<dyn Error>> {
	tracing_subscriber::fmt().with_target(false).init();

	let token = env::args()
		.nth(1)
		.or_else(|| env::var("SHIFT_SESSION_TOKEN").ok())
		.expect("Provide a session token via SHIFT_SESSION_TOKEN or argv[1]");

	let config = CapsClientConfig::new(token).backing(BufferBacking::Shm);
	let mut client = CapsClient::connect(&config)?;
	println!(
		"Connected to Shift server '{}' via protocol {}",
		client.server_name(),
		client.protocol_name()
	);

	let mut monitor: Option<String> = None;
	client.send_ready()?;
	println!("Sent session_ready; painting...");

	let mut tick: u32 = 0;
	loop {
		let Some(active) = monitor.clone() else {
			println!("Waiting for a monitor from Shift...");
			pump(&mut client, true)?;
			drain(&mut client, &mut monitor);
			continue;
		};

		match client.acquire_frame(&active) {
			Ok(Acquire::Frame(frame)) => {
				paint(&frame, tick)?;
				client.swap_buffers(frame)?;
				tick = tick.wrapping_add(1);
			}
			Ok(Acquire::NoBuffers) => {
				pump(&mut client, true)?;
			}
			Err(CapsClientError::SwapPending(_)) => {
				pump(&mut client, true)?;
			}
			Err(CapsClientError::UnknownMonitor(_)) => {
				monitor = None;
				continue;
			}
			Err(err) => return Err(err.into()),
		}

		pump(&mut client, false)?;
		drain(&mut client, &mut monitor);
		if let Some(error) = client.take_last_error() {
			eprintln!("protocol fault: {error}");
		}
	}
}

/// Scrolling gradient written a row at a time through the frame's descriptor.
fn paint(frame: &FrameTarget, tick: u32) -> io::Result<()> {
	let Some(dmabuf) = frame.dmabuf() else {
		return Ok(());
	};
	let file = File::from(dmabuf.fd().try_clone_to_owned()?);
	let width = frame.width() as usize;
	let height = frame.height() as usize;
	let stride = dmabuf.stride() as usize;
	let base = dmabuf.offset() as u64;

	let mut row = vec![0u8; stride];
	for y in 0..height {
		for x in 0..width {
			let px = &mut row[x * 4..x * 4 + 4];
			px[0] = (x as u32).wrapping_add(tick) as u8;
			px[1] = (y as u32).wrapping_add(tick / 2) as u8;
			px[2] = ((x ^ y) & 0xff) as u8;
			px[3] = 0xff;
		}
		file.write_all_at(&row, base + (y * stride) as u64)?;
	}
	Ok(())
}

fn drain(client: &mut CapsClient, monitor: &mut Option<String>) {
	while let Some(event) = client.next_event() {
		match event {
			CapsEvent::MonitorAdded(info) => {
				println!("Monitor added: {} ({}x{})", info.id, info.width, info.height);
				if monitor.is_none() {
					*monitor = Some(info.id);
				}
			}
			CapsEvent::MonitorRemoved { monitor_id } => {
				println!("Monitor removed: {monitor_id}");
				if monitor.as_deref() == Some(monitor_id.as_str()) {
					*monitor = None;
				}
			}
			CapsEvent::SessionState(session) => {
				println!("Session state changed: {:?}", session.state);
			}
			_ => {}
		}
	}
}

fn pump(client: &mut CapsClient, blocking: bool) -> Result<usize, CapsClientError> {
	let (socket_fd, swap_fd) = (client.socket_fd()?, client.swap_fd()?);
	// Raw descriptors straight out of the client; it outlives this poll.
	let (socket_fd, swap_fd) = unsafe {
		(
			BorrowedFd::borrow_raw(socket_fd),
			BorrowedFd::borrow_raw(swap_fd),
		)
	};
	let mut fds = [
		PollFd::new(socket_fd, PollFlags::POLLIN),
		PollFd::new(swap_fd, PollFlags::POLLIN),
	];
	let timeout = if blocking {
		PollTimeout::NONE
	} else {
		PollTimeout::ZERO
	};
	match poll(&mut fds, timeout) {
		Ok(_) => {}
		Err(Errno::EINTR) => return Ok(0),
		Err(err) => return Err(err.into()),
	}
	client.poll_events()
}
