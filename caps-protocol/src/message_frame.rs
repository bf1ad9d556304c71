use nix::errno::Errno;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{ErrorKind, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, RawFd};

use crate::{HelloPayload, MessageHeader, PROTOCOL_VERSION, ProtocolError};

/// Payload line sent when a message carries no payload.
const NO_PAYLOAD_SENTINEL: &str = "\0\0\0\0";

/// Raw framed message: header line + payload line plus attached descriptors.
/// Frames travel as single seqpacket datagrams; the reader still tolerates
/// split delivery so the codec also works over byte streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsMessageFrame {
	pub header: MessageHeader,
	pub payload: Option<String>,
	pub fds: Vec<RawFd>,
}

fn would_block_err() -> std::io::Error {
	std::io::Error::new(ErrorKind::WouldBlock, ProtocolError::WouldBlock)
}

/// Incremental frame reader: buffers partial bytes and pending descriptors,
/// yields complete frames in arrival order.
#[derive(Default)]
pub struct CapsFrameReader {
	pending_bytes: Vec<u8>,
	pending_fds: Vec<RawFd>,
	ready_frames: VecDeque<CapsMessageFrame>,
}

impl CapsFrameReader {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn try_pop_ready_frame(&mut self) -> Option<CapsMessageFrame> {
		self.ready_frames.pop_front()
	}

	#[tracing::instrument(skip_all)]
	fn feed_chunk(&mut self, bytes: &[u8], mut fds: Vec<RawFd>) -> Result<(), ProtocolError> {
		if !bytes.is_empty() {
			self.pending_bytes.extend_from_slice(bytes);
		}
		if !fds.is_empty() {
			self.pending_fds.append(&mut fds);
		}
		self.process_pending()
	}

	#[tracing::instrument(skip_all)]
	fn process_pending(&mut self) -> Result<(), ProtocolError> {
		while !self.pending_bytes.is_empty() {
			let fds_for_frame = self.pending_fds.clone();
			match CapsMessageFrame::parse_from_bytes(&self.pending_bytes, fds_for_frame)? {
				Some((frame, used)) => {
					self.pending_bytes.drain(..used);
					// descriptors attach to the frame completed by this chunk
					self.pending_fds.clear();
					self.ready_frames.push_back(frame);
				}
				None => break,
			}
		}
		Ok(())
	}

	/// Read until a complete frame is available. On a non-blocking descriptor
	/// this returns `ProtocolError::WouldBlock` once the socket is drained.
	#[tracing::instrument(skip_all)]
	pub fn read_framed(&mut self, stream: &impl AsRawFd) -> Result<CapsMessageFrame, ProtocolError> {
		loop {
			if let Some(frame) = self.try_pop_ready_frame() {
				return Ok(frame);
			}
			let (bytes, fds) = recv_into_vec(stream)?;
			self.feed_chunk(&bytes, fds)?;
		}
	}

	#[cfg(feature = "async")]
	#[tracing::instrument(skip_all)]
	pub async fn read_frame_from_async_fd<T: AsRawFd>(
		&mut self,
		fd: &tokio::io::unix::AsyncFd<T>,
	) -> Result<CapsMessageFrame, ProtocolError> {
		loop {
			if let Some(frame) = self.try_pop_ready_frame() {
				return Ok(frame);
			}
			let mut guard = fd.readable().await?;
			if let Ok(result) = guard.try_io(|_| match self.read_framed(fd.get_ref()) {
				Err(ProtocolError::WouldBlock) => Err(would_block_err()),
				def => Ok(def),
			}) {
				break result?;
			}
		}
	}
}

#[tracing::instrument(skip_all)]
fn recv_into_vec(stream: &impl AsRawFd) -> Result<(Vec<u8>, Vec<RawFd>), ProtocolError> {
	let mut buf = [0u8; 4096];
	let mut cmsg_space = nix::cmsg_space!([RawFd; 8]);
	let mut iov = [IoSliceMut::new(&mut buf)];
	let msg = loop {
		match recvmsg::<()>(
			stream.as_raw_fd(),
			&mut iov,
			Some(&mut cmsg_space),
			MsgFlags::empty(),
		) {
			Err(errno) if errno == Errno::EINTR => continue,
			Err(errno) if errno == Errno::EAGAIN || errno == Errno::EWOULDBLOCK => {
				break Err(ProtocolError::WouldBlock);
			}
			Err(errno) => break Err(ProtocolError::Nix(errno.into())),
			Ok(msg) => break Ok(msg),
		}
	}?;
	if msg.bytes == 0 {
		return Err(ProtocolError::UnexpectedEof);
	}
	if msg.flags.contains(MsgFlags::MSG_TRUNC) {
		return Err(ProtocolError::Truncated);
	}
	let mut fds = Vec::new();
	for cmsg in msg.cmsgs()? {
		if let ControlMessageOwned::ScmRights(rights) = cmsg {
			fds.extend(rights);
		}
	}
	let bytes = msg.bytes;
	let data = iov[0][..bytes].to_vec();
	Ok((data, fds))
}

impl CapsMessageFrame {
	/// Send the frame as one datagram via sendmsg, descriptors via SCM_RIGHTS.
	pub fn encode_and_send(&self, stream: &impl AsRawFd) -> Result<(), ProtocolError> {
		let (header_line, payload_line) = self.serialize();
		let header_line = format!("{header_line}\n");
		let payload_line = format!("{payload_line}\n");
		let iov = [
			IoSlice::new(header_line.as_bytes()),
			IoSlice::new(payload_line.as_bytes()),
		];
		let cmsg = if self.fds.is_empty() {
			vec![]
		} else {
			vec![ControlMessage::ScmRights(&self.fds)]
		};
		match sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None) {
			Err(errno) if errno == Errno::EAGAIN || errno == Errno::EWOULDBLOCK => {
				Err(ProtocolError::WouldBlock)
			}
			Err(errno) => Err(ProtocolError::Nix(errno.into())),
			Ok(_) => Ok(()),
		}
	}

	pub fn serialize(&self) -> (String, String) {
		let header_line = self.header.0.trim_end();
		let payload_line = self
			.payload
			.as_deref()
			.map(|p| p.trim_end_matches('\n'))
			.unwrap_or(NO_PAYLOAD_SENTINEL);
		(header_line.to_string(), payload_line.to_string())
	}

	#[cfg(feature = "async")]
	pub async fn send_frame_to_async_fd<T: AsRawFd>(
		&self,
		fd: &tokio::io::unix::AsyncFd<T>,
	) -> Result<(), ProtocolError> {
		loop {
			let mut guard = fd.writable().await?;
			if let Ok(result) = guard.try_io(|_| match self.encode_and_send(fd) {
				Err(ProtocolError::WouldBlock) => Err(would_block_err()),
				def => Ok(def),
			}) {
				break result?;
			}
		}
	}

	#[tracing::instrument(skip_all, fields(header = %self.header.0))]
	pub(crate) fn expect_payload_json<'a, T>(&'a self) -> Result<T, ProtocolError>
	where
		T: serde::Deserialize<'a>,
	{
		let payload = self.expect_payload_raw()?;
		serde_json::from_str(payload).map_err(ProtocolError::from)
	}

	pub(crate) fn expect_payload_raw(&self) -> Result<&str, ProtocolError> {
		self.payload
			.as_deref()
			.ok_or_else(|| ProtocolError::ExpectedPayload(self.header.0.clone()))
	}

	pub fn json(header: impl Into<MessageHeader>, payload: impl Serialize) -> Self {
		Self {
			header: header.into(),
			payload: Some(serde_json::to_string(&payload).unwrap()),
			fds: Vec::new(),
		}
	}

	pub fn raw(header: impl Into<MessageHeader>, body: impl Into<String>) -> Self {
		Self {
			header: header.into(),
			payload: Some(body.into()),
			fds: Vec::new(),
		}
	}

	pub fn no_payload(header: impl Into<MessageHeader>) -> Self {
		Self {
			header: header.into(),
			payload: None,
			fds: Vec::new(),
		}
	}

	pub fn hello(server: impl Into<String>) -> Self {
		Self::json(
			crate::message_header::HELLO,
			HelloPayload {
				server: server.into(),
				protocol: PROTOCOL_VERSION.to_string(),
			},
		)
	}

	pub fn expect_n_fds(&self, amount: u32) -> Result<(), ProtocolError> {
		let found = self.fds.len() as u32;
		if found == amount {
			Ok(())
		} else {
			Err(ProtocolError::ExpectedFds {
				expected: amount,
				found,
			})
		}
	}

	/// Split one complete frame off the front of `bytes`. Returns the frame
	/// and the number of bytes consumed, or `None` when both newlines have
	/// not arrived yet.
	#[tracing::instrument(skip_all, fields(frame_size = bytes.len(), fds = fds.len()))]
	pub fn parse_from_bytes(
		bytes: &[u8],
		fds: Vec<RawFd>,
	) -> Result<Option<(Self, usize)>, ProtocolError> {
		let Some(first_nl) = bytes.iter().position(|b| *b == b'\n') else {
			return Ok(None);
		};
		let Some(second_rel) = bytes[first_nl + 1..].iter().position(|b| *b == b'\n') else {
			return Ok(None);
		};
		let second_nl = first_nl + 1 + second_rel;
		let header = String::from_utf8(bytes[..first_nl].to_vec())?;
		let payload = String::from_utf8(bytes[first_nl + 1..second_nl].to_vec())?;
		let frame = Self {
			header: header.into(),
			payload: (payload != NO_PAYLOAD_SENTINEL).then_some(payload),
			fds,
		};
		Ok(Some((frame, second_nl + 1)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::message_header;

	#[test]
	fn parse_needs_both_newlines() {
		let partial = b"frame_done\nm0";
		assert!(
			CapsMessageFrame::parse_from_bytes(partial, Vec::new())
				.unwrap()
				.is_none()
		);
	}

	#[test]
	fn parse_consumes_exactly_one_frame() {
		let two = b"frame_done\nm0\nping\n\0\0\0\0\n";
		let (frame, used) = CapsMessageFrame::parse_from_bytes(two, Vec::new())
			.unwrap()
			.unwrap();
		assert_eq!(frame.header.0, message_header::FRAME_DONE);
		assert_eq!(frame.payload.as_deref(), Some("m0"));
		assert_eq!(used, b"frame_done\nm0\n".len());
	}

	#[test]
	fn no_payload_sentinel_maps_to_none() {
		let bytes = b"pong\n\0\0\0\0\n";
		let (frame, _) = CapsMessageFrame::parse_from_bytes(bytes, Vec::new())
			.unwrap()
			.unwrap();
		assert_eq!(frame.header.0, message_header::PONG);
		assert!(frame.payload.is_none());
	}

	#[test]
	fn serialize_round_trips_the_sentinel() {
		let frame = CapsMessageFrame::no_payload(message_header::PING);
		let (header, payload) = frame.serialize();
		assert_eq!(header, "ping");
		assert_eq!(payload, NO_PAYLOAD_SENTINEL);
	}

	#[test]
	fn reader_handles_split_and_batched_chunks() {
		let mut reader = CapsFrameReader::new();
		reader.feed_chunk(b"frame_do", Vec::new()).unwrap();
		assert!(reader.try_pop_ready_frame().is_none());
		reader
			.feed_chunk(b"ne\nm0\nframe_done\nm1\n", Vec::new())
			.unwrap();
		let first = reader.try_pop_ready_frame().unwrap();
		let second = reader.try_pop_ready_frame().unwrap();
		assert_eq!(first.payload.as_deref(), Some("m0"));
		assert_eq!(second.payload.as_deref(), Some("m1"));
		assert!(reader.try_pop_ready_frame().is_none());
	}

	#[test]
	fn missing_payload_is_reported_with_the_header() {
		let frame = CapsMessageFrame::no_payload(message_header::AUTH);
		let err = frame.expect_payload_raw().unwrap_err();
		assert!(matches!(err, ProtocolError::ExpectedPayload(h) if h == "auth"));
	}
}
