use std::env;
use std::error::Error;
use std::io::{self, Write};
use std::os::fd::BorrowedFd;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};

use caps_client::{CapsClient, CapsClientConfig, CapsEvent};

fn main() -> Result<(), Box<dyn Error>> {
	tracing_subscriber::fmt().with_target(false).init();

	let token = env::var("SHIFT_SESSION_TOKEN")
		.expect("SHIFT_SESSION_TOKEN env var must contain the admin token");

	let mut client = CapsClient::connect(&CapsClientConfig::new(token))?;
	info!(
		server = client.server_name(),
		protocol = client.protocol_name(),
		"Connected to Shift"
	);

	let mut tokens: Vec<String> = Vec::new();
	repl(&mut client, &mut tokens)?;
	Ok(())
}

fn repl(client: &mut CapsClient, tokens: &mut Vec<String>) -> Result<(), Box<dyn Error>> {
	print_help();
	let stdin = io::stdin();
	loop {
		print!("admin> ");
		io::stdout().flush()?;
		let mut line = String::new();
		if stdin.read_line(&mut line)? == 0 {
			break;
		}
		match parse_command(line.trim()) {
			Command::Empty => {}
			Command::Create { display_name } => {
				client.create_session(display_name.as_deref())?;
				match wait_for_session_created(client) {
					Ok(token) => {
						info!(token = token.as_str(), "Created session");
						tokens.push(token);
					}
					Err(err) => warn!("Session creation failed: {err}"),
				}
			}
			Command::List => {
				if tokens.is_empty() {
					println!("No sessions created yet");
				} else {
					for token in tokens.iter() {
						println!("- token={token}");
					}
				}
			}
			Command::Recv => {
				pump(client, true)?;
				report(client);
			}
			Command::Help => print_help(),
			Command::Quit => break,
			Command::Unknown(msg) => println!("{msg}"),
		}
	}
	Ok(())
}

fn wait_for_session_created(client: &mut CapsClient) -> Result<String, Box<dyn Error>> {
	loop {
		pump(client, true)?;
		if let Some(error) = client.take_last_error() {
			return Err(error.into());
		}
		while let Some(event) = client.next_event() {
			match event {
				CapsEvent::SessionCreated { token } => return Ok(token),
				other => debug!(?other, "Received while waiting for session_created"),
			}
		}
	}
}

fn report(client: &mut CapsClient) {
	if let Some(error) = client.take_last_error() {
		warn!("Error from server: {error}");
	}
	while let Some(event) = client.next_event() {
		match event {
			CapsEvent::MonitorAdded(info) => info!(monitor_id = info.id, "Monitor added"),
			CapsEvent::MonitorRemoved { monitor_id } => {
				info!(monitor_id = monitor_id, "Monitor removed");
			}
			CapsEvent::SessionState(session) => {
				info!(session_id = session.id.as_str(), state = ?session.state, "Session state changed");
			}
			other => debug!(?other, "Received event"),
		}
	}
}

fn pump(client: &mut CapsClient, blocking: bool) -> Result<usize, Box<dyn Error>> {
	let socket_fd = client.socket_fd()?;
	// Raw descriptor straight out of the client; it outlives this poll.
	let socket_fd = unsafe { BorrowedFd::borrow_raw(socket_fd) };
	let mut fds = [PollFd::new(socket_fd, PollFlags::POLLIN)];
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
	Ok(client.poll_events()?)
}

fn parse_command(input: &str) -> Command {
	let mut parts = input.split_whitespace();
	let cmd = parts.next().unwrap_or_default();
	match cmd {
		"" => Command::Empty,
		"help" | "?" => Command::Help,
		"quit" | "exit" => Command::Quit,
		"recv" => Command::Recv,
		"list" | "sessions" => Command::List,
		"create" | "create-session" => {
			let display_name = parts.collect::<Vec<_>>().join(" ");
			let display_name = if display_name.is_empty() {
				None
			} else {
				Some(display_name)
			};
			Command::Create { display_name }
		}
		other => Command::Unknown(format!("unknown command '{other}' (type 'help')")),
	}
}

fn print_help() {
	println!("Commands:");
	println!("  create-session [display_name]  - Create a pending session token");
	println!("  list                           - List tokens generated during this session");
	println!("  recv                           - Wait for a message from Shift");
	println!("  help                           - Show this message");
	println!("  quit                           - Exit");
}

enum Command {
	Empty,
	Create { display_name: Option<String> },
	List,
	Recv,
	Help,
	Quit,
	Unknown(String),
}
